// SPDX-License-Identifier: Apache-2.0

//! Hardware-defined constants and structures shared across the pipeline.
//!
//! Field order and widths of everything in this module are part of the wire
//! contract with the hardware loader and must not change.

use bitflags::bitflags;

/// Shift of the architectural page size.
pub const PAGE_SHIFT: u32 = 12;

/// Architectural page size (EPC page).
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Span of one guard region, in bytes.
pub const GUARD_PAGE_SIZE: u64 = 0x1_0000;

/// SSA frame size, in pages.
pub const SSA_FRAME_SIZE: u32 = 1;

/// Number of SSA slots per thread.
pub const SSA_NUM: u32 = 2;

/// A TCS occupies exactly one page.
pub const TCS_SIZE: u64 = PAGE_SIZE;

/// Bytes of the TCS that are templated; the rest of the page is reserved
/// and zero.
pub const TCS_TEMPLATE_SIZE: usize = 72;

/// Size of the saved-GPR block at the tail of an SSA frame.
pub const GPR_RECORD_SIZE: u64 = 184;

/// RSA-3072 modulus/signature width in bytes.
pub const KEY_SIZE: usize = 384;

/// Width of the public exponent field.
pub const EXPONENT_SIZE: usize = 4;

/// Maximum virtual size of a 64-bit enclave.
pub const ENCLAVE_MAX_SIZE_64: u64 = 0x10_0000_0000;

/// Stack fill word written to measured stack pages.
pub const STACK_FILL: u32 = 0xCCCC_CCCC;

pub const SGX_FLAGS_INITTED: u64 = 0x01;
pub const SGX_FLAGS_DEBUG: u64 = 0x02;
pub const SGX_FLAGS_MODE64BIT: u64 = 0x04;
pub const SGX_FLAGS_PROVISION_KEY: u64 = 0x10;
pub const SGX_FLAGS_EINITTOKEN_KEY: u64 = 0x20;

pub const SGX_XFRM_LEGACY: u64 = 0x03;
pub const SGX_XFRM_AVX: u64 = 0x06;
pub const SGX_XFRM_MPX: u64 = 0x18;
pub const SGX_XFRM_AVX512: u64 = 0xE6;
pub const SGX_XFRM_RESERVED: u64 =
    !(SGX_XFRM_LEGACY | SGX_XFRM_AVX | SGX_XFRM_MPX | SGX_XFRM_AVX512);

bitflags! {
    /// Per-page security info flags, as measured in the EADD record.
    /// Bits 8..16 carry the page type.
    pub struct SiFlags: u64 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
        const PT_TCS = 1 << 8;
        const PT_REG = 2 << 8;
    }
}

impl SiFlags {
    pub const NONE: SiFlags = SiFlags::empty();

    /// Regular read-write data page.
    pub fn reg_rw() -> Self {
        SiFlags::PT_REG | SiFlags::R | SiFlags::W
    }

    /// Regular read-write-execute page (executable heap).
    pub fn reg_rwx() -> Self {
        SiFlags::PT_REG | SiFlags::R | SiFlags::W | SiFlags::X
    }

    /// Thread control structure page. TCS pages carry no access bits.
    pub fn tcs() -> Self {
        SiFlags::PT_TCS
    }

    /// The 48 bytes of SECINFO covered by the EADD measurement record.
    pub fn secinfo(self) -> [u8; 48] {
        let mut si = [0u8; 48];
        si[..8].copy_from_slice(&self.bits().to_le_bytes());
        si
    }
}

bitflags! {
    /// Load-time treatment of a layout entry.
    pub struct PageAttr: u16 {
        const EADD = 1 << 0;
        const EEXTEND = 1 << 1;
        const EREMOVE = 1 << 2;
        const POST_ADD = 1 << 3;
        const POST_REMOVE = 1 << 4;
        const DYN_THREAD = 1 << 5;
        const GROW_DOWN = 1 << 6;
    }
}

impl PageAttr {
    /// Pages added at load time without content measurement.
    pub fn add_page_only() -> Self {
        PageAttr::EADD
    }

    /// Pages added and content-measured at load time.
    pub fn add_extend_page() -> Self {
        PageAttr::EADD | PageAttr::EEXTEND
    }
}

/// Bit marking a layout id as a group record.
pub const GROUP_FLAG: u16 = 1 << 12;

pub const LAYOUT_ID_HEAP_MIN: u16 = 1;
pub const LAYOUT_ID_HEAP_INIT: u16 = 2;
pub const LAYOUT_ID_HEAP_MAX: u16 = 3;
pub const LAYOUT_ID_TCS: u16 = 4;
pub const LAYOUT_ID_TD: u16 = 5;
pub const LAYOUT_ID_SSA: u16 = 6;
pub const LAYOUT_ID_STACK_MAX: u16 = 7;
pub const LAYOUT_ID_STACK_MIN: u16 = 8;
pub const LAYOUT_ID_THREAD_GROUP: u16 = 9 | GROUP_FLAG;
pub const LAYOUT_ID_GUARD: u16 = 10;
pub const LAYOUT_ID_HEAP_DYN_MIN: u16 = 11;
pub const LAYOUT_ID_HEAP_DYN_INIT: u16 = 12;
pub const LAYOUT_ID_HEAP_DYN_MAX: u16 = 13;
pub const LAYOUT_ID_TCS_DYN: u16 = 14;
pub const LAYOUT_ID_TD_DYN: u16 = 15;
pub const LAYOUT_ID_SSA_DYN: u16 = 16;
pub const LAYOUT_ID_STACK_DYN_MAX: u16 = 17;
pub const LAYOUT_ID_STACK_DYN_MIN: u16 = 18;
pub const LAYOUT_ID_THREAD_GROUP_DYN: u16 = 19 | GROUP_FLAG;

/// Offset between a static layout id and its dynamic counterpart.
pub const LAYOUT_ID_DYN_DELTA: u16 = LAYOUT_ID_HEAP_DYN_MIN - LAYOUT_ID_HEAP_MIN;

/// Whether a layout id denotes a group record.
pub fn is_group_id(id: u16) -> bool {
    id & GROUP_FLAG != 0
}

/// Enclave attribute pair: feature flags plus the XFRM (XSAVE feature) mask.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Attributes {
    pub flags: u64,
    pub xfrm: u64,
}

impl Attributes {
    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.flags.to_le_bytes());
        out[8..].copy_from_slice(&self.xfrm.to_le_bytes());
        out
    }
}

/// Thread control structure template. Only the first [`TCS_TEMPLATE_SIZE`]
/// bytes of the page are templated.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Tcs {
    pub reserved0: u64,
    pub flags: u64,
    pub ossa: u64,
    pub cssa: u32,
    pub nssa: u32,
    pub oentry: u64,
    pub reserved1: u64,
    pub ofs_base: u64,
    pub ogs_base: u64,
    pub ofs_limit: u32,
    pub ogs_limit: u32,
}

impl Tcs {
    pub fn to_bytes(&self) -> [u8; TCS_TEMPLATE_SIZE] {
        let mut out = [0u8; TCS_TEMPLATE_SIZE];
        out[0..8].copy_from_slice(&self.reserved0.to_le_bytes());
        out[8..16].copy_from_slice(&self.flags.to_le_bytes());
        out[16..24].copy_from_slice(&self.ossa.to_le_bytes());
        out[24..28].copy_from_slice(&self.cssa.to_le_bytes());
        out[28..32].copy_from_slice(&self.nssa.to_le_bytes());
        out[32..40].copy_from_slice(&self.oentry.to_le_bytes());
        out[40..48].copy_from_slice(&self.reserved1.to_le_bytes());
        out[48..56].copy_from_slice(&self.ofs_base.to_le_bytes());
        out[56..64].copy_from_slice(&self.ogs_base.to_le_bytes());
        out[64..68].copy_from_slice(&self.ofs_limit.to_le_bytes());
        out[68..72].copy_from_slice(&self.ogs_limit.to_le_bytes());
        out
    }
}

/// Size of the XSAVE area implied by an XFRM value, or `None` when the XFRM
/// is empty or claims reserved bits.
pub fn xsave_size(xfrm: u64) -> Option<u32> {
    // Ascending feature sets; the last match wins.
    const TABLE: &[(u64, u32)] = &[
        (SGX_XFRM_LEGACY, 512 + 64),
        (SGX_XFRM_AVX, 512 + 64 + 256),
        (SGX_XFRM_MPX, 512 + 64 + 256 + 80),
        (SGX_XFRM_AVX512, 512 + 64 + 256 + 80 + 1600),
    ];

    if xfrm == 0 || xfrm & SGX_XFRM_RESERVED != 0 {
        return None;
    }

    let mut size = 0;
    for &(bits, sz) in TABLE {
        if xfrm & bits == bits {
            size = sz;
        }
    }
    Some(size)
}

/// Round `n` up to the next multiple of `align` (a power of two).
pub fn round_to(n: u64, align: u64) -> u64 {
    (n + align - 1) & !(align - 1)
}

/// Round `n` up to a page boundary.
pub fn round_to_page(n: u64) -> u64 {
    round_to(n, PAGE_SIZE)
}

/// Truncate `n` down to a page boundary.
pub fn trim_to_page(n: u64) -> u64 {
    n & !(PAGE_SIZE - 1)
}
