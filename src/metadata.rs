// SPDX-License-Identifier: Apache-2.0

//! The metadata block written into the `.note.sgxmeta` slot.
//!
//! The block is a fixed-capacity region: a header, the signature container,
//! two directories (layout table, patch table) and a trailing data blob that
//! accumulates sub-allocations through a bump arena. A reduced-schema
//! "compatible" block for previous-generation loaders is appended after the
//! primary block within the same capacity.

use crate::arch::*;
use crate::css::{EnclaveCss, CSS_SIZE};
use crate::error::{Error, Result};

use std::fmt::Write as _;

/// Magic number marking a valid metadata block.
pub const METADATA_MAGIC: u64 = 0x86A8_0294_635D_0E4C;

/// Fixed capacity of the metadata note area.
pub const METADATA_SIZE: usize = 0x5000;

/// Offset of the data blob; everything before it is the fixed header.
pub const METADATA_HEADER_SIZE: usize = 1888;

/// The TCS template is always the first arena allocation.
pub const TCS_TEMPLATE_OFFSET: u32 = METADATA_HEADER_SIZE as u32;

pub const MAX_SAVE_BUF_SIZE: u32 = 2632;

const fn make_version(major: u64, minor: u64) -> u64 {
    (major << 32) | minor
}

/// Current metadata schema.
pub const METADATA_VERSION: u64 = make_version(2, 1);

/// Previous-generation schema understood by loaders without dynamic memory
/// management.
pub const METADATA_VERSION_COMPAT: u64 = make_version(1, 4);

const LAYOUT_RECORD_SIZE: usize = 32;
const PATCH_RECORD_SIZE: usize = 32;
const ZERO_SOURCE_SIZE: usize = 56;

/// A run of pages placed at a fixed RVA.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LayoutEntry {
    pub id: u16,
    pub attributes: PageAttr,
    pub page_count: u32,
    pub rva: u64,
    /// With `content_offset` zero, a fill word replicated across the pages;
    /// otherwise the byte length of the referenced template.
    pub content_size: u32,
    /// Offset of template content within the metadata block.
    pub content_offset: u32,
    pub si_flags: SiFlags,
}

/// A repetition of the `entry_count` records immediately preceding this one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LayoutGroup {
    pub id: u16,
    pub entry_count: u16,
    pub load_times: u32,
    pub load_step: u64,
}

/// One record of the layout table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Layout {
    Entry(LayoutEntry),
    Group(LayoutGroup),
}

impl Layout {
    pub fn guard(page_count: u32) -> Self {
        Layout::Entry(LayoutEntry {
            id: LAYOUT_ID_GUARD,
            attributes: PageAttr::empty(),
            page_count,
            rva: 0,
            content_size: 0,
            content_offset: 0,
            si_flags: SiFlags::NONE,
        })
    }

    pub fn as_entry(&self) -> Option<&LayoutEntry> {
        match self {
            Layout::Entry(entry) => Some(entry),
            Layout::Group(_) => None,
        }
    }

    fn to_bytes(self) -> [u8; LAYOUT_RECORD_SIZE] {
        let mut out = [0u8; LAYOUT_RECORD_SIZE];
        match self {
            Layout::Entry(e) => {
                out[0..2].copy_from_slice(&e.id.to_le_bytes());
                out[2..4].copy_from_slice(&e.attributes.bits().to_le_bytes());
                out[4..8].copy_from_slice(&e.page_count.to_le_bytes());
                out[8..16].copy_from_slice(&e.rva.to_le_bytes());
                out[16..20].copy_from_slice(&e.content_size.to_le_bytes());
                out[20..24].copy_from_slice(&e.content_offset.to_le_bytes());
                out[24..32].copy_from_slice(&e.si_flags.bits().to_le_bytes());
            }
            Layout::Group(g) => {
                out[0..2].copy_from_slice(&g.id.to_le_bytes());
                out[2..4].copy_from_slice(&g.entry_count.to_le_bytes());
                out[4..8].copy_from_slice(&g.load_times.to_le_bytes());
                out[8..16].copy_from_slice(&g.load_step.to_le_bytes());
            }
        }
        out
    }
}

/// Where a patch takes its bytes from within the metadata block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PatchSource {
    GlobalData,
    Zero,
}

/// A fixup applied to the output file: `size` bytes copied from the
/// metadata block to file offset `dst`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PatchEntry {
    pub dst: u64,
    pub source: PatchSource,
    pub size: u32,
}

/// Bump allocator over the metadata data blob. Offsets are relative to the
/// start of the metadata block; exhausting the capacity is an error, never
/// a wrap.
struct Arena {
    buf: Vec<u8>,
}

impl Arena {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn alloc(&mut self, len: usize) -> Result<u32> {
        let offset = METADATA_HEADER_SIZE + self.buf.len();
        if offset + len > METADATA_SIZE {
            return Err(Error::capacity(format!(
                "metadata blob needs {} bytes, capacity is {}",
                offset + len,
                METADATA_SIZE
            )));
        }
        self.buf.resize(self.buf.len() + len, 0);
        Ok(offset as u32)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) {
        let start = offset as usize - METADATA_HEADER_SIZE;
        self.buf[start..start + bytes.len()].copy_from_slice(bytes);
    }
}

/// The assembled metadata, structured. [`Metadata::serialize`] produces the
/// wire block.
#[derive(Clone)]
pub struct Metadata {
    pub version: u64,
    pub tcs_policy: u32,
    pub tcs_min_pool: u32,
    pub enclave_size: u64,
    pub attributes: Attributes,
    pub enclave_css: EnclaveCss,
    pub layouts: Vec<Layout>,
    pub patches: Vec<PatchEntry>,
    pub tcs_template: Tcs,
    pub global_data: Vec<u8>,
}

impl Metadata {
    /// Start a metadata block: schema fields plus the attribute pair
    /// derived from the signature container.
    ///
    /// The low attribute word mirrors the container; the XFRM word marks
    /// every bit the signer does not care about, plus the required set bits.
    pub fn new(tcs_policy: u32, tcs_min_pool: u32, enclave_css: EnclaveCss) -> Self {
        let attributes = Attributes {
            flags: enclave_css.body.attributes.flags,
            xfrm: !enclave_css.body.attribute_mask.xfrm
                | (enclave_css.body.attributes.xfrm & enclave_css.body.attribute_mask.xfrm),
        };

        Self {
            version: METADATA_VERSION,
            tcs_policy,
            tcs_min_pool,
            enclave_size: 0,
            attributes,
            enclave_css,
            layouts: Vec::new(),
            patches: Vec::new(),
            tcs_template: Tcs::default(),
            global_data: Vec::new(),
        }
    }

    /// Find the first layout entry with the given id. The builder only
    /// queries ids it has itself emitted.
    pub fn entry_by_id(&self, id: u16) -> Option<&LayoutEntry> {
        self.layouts.iter().find_map(|layout| match layout {
            Layout::Entry(entry) if entry.id == id => Some(entry),
            _ => None,
        })
    }

    /// Serialize into one wire block. Allocation order inside the data blob
    /// is fixed: TCS template, global-data template, zero source, patch
    /// table, layout table.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut arena = Arena::new();

        let tcs_off = arena.alloc(TCS_TEMPLATE_SIZE)?;
        debug_assert_eq!(tcs_off, TCS_TEMPLATE_OFFSET);
        arena.write(tcs_off, &self.tcs_template.to_bytes());

        let gd_off = arena.alloc(self.global_data.len())?;
        arena.write(gd_off, &self.global_data);

        let zero_off = arena.alloc(ZERO_SOURCE_SIZE)?;

        let patch_off = arena.alloc(self.patches.len() * PATCH_RECORD_SIZE)?;
        for (i, patch) in self.patches.iter().enumerate() {
            let mut rec = [0u8; PATCH_RECORD_SIZE];
            let src = match patch.source {
                PatchSource::GlobalData => gd_off,
                PatchSource::Zero => zero_off,
            };
            rec[0..8].copy_from_slice(&patch.dst.to_le_bytes());
            rec[8..12].copy_from_slice(&src.to_le_bytes());
            rec[12..16].copy_from_slice(&patch.size.to_le_bytes());
            arena.write(patch_off + (i * PATCH_RECORD_SIZE) as u32, &rec);
        }

        let layout_off = arena.alloc(self.layouts.len() * LAYOUT_RECORD_SIZE)?;
        for (i, layout) in self.layouts.iter().enumerate() {
            arena.write(
                layout_off + (i * LAYOUT_RECORD_SIZE) as u32,
                &layout.to_bytes(),
            );
        }

        let size = METADATA_HEADER_SIZE + arena.buf.len();
        let mut out = vec![0u8; size];
        out[0..8].copy_from_slice(&METADATA_MAGIC.to_le_bytes());
        out[8..16].copy_from_slice(&self.version.to_le_bytes());
        out[16..20].copy_from_slice(&(size as u32).to_le_bytes());
        out[20..24].copy_from_slice(&self.tcs_policy.to_le_bytes());
        out[24..28].copy_from_slice(&SSA_FRAME_SIZE.to_le_bytes());
        out[28..32].copy_from_slice(&MAX_SAVE_BUF_SIZE.to_le_bytes());
        // desired_misc_select is always zero.
        out[36..40].copy_from_slice(&self.tcs_min_pool.to_le_bytes());
        out[40..48].copy_from_slice(&self.enclave_size.to_le_bytes());
        out[48..64].copy_from_slice(&self.attributes.to_bytes());
        self.enclave_css.write_to(&mut out[64..64 + CSS_SIZE]);

        let layout_size = (self.layouts.len() * LAYOUT_RECORD_SIZE) as u32;
        let patch_size = (self.patches.len() * PATCH_RECORD_SIZE) as u32;
        out[1872..1876].copy_from_slice(&layout_off.to_le_bytes());
        out[1876..1880].copy_from_slice(&layout_size.to_le_bytes());
        out[1880..1884].copy_from_slice(&patch_off.to_le_bytes());
        out[1884..1888].copy_from_slice(&patch_size.to_le_bytes());

        out[METADATA_HEADER_SIZE..].copy_from_slice(&arena.buf);
        Ok(out)
    }

    /// Derive the previous-generation block: dynamic thread entries (and
    /// the guard page leading them) are dropped, the static and EREMOVE
    /// thread tail collapses into a single repeated group, and the
    /// on-demand heap range is neutralized.
    pub fn compatible(&self) -> Result<Metadata> {
        let mut meta = self.clone();
        meta.version = METADATA_VERSION_COMPAT;

        let first_dyn = meta.layouts.iter().position(|layout| {
            matches!(layout.as_entry(),
                Some(e) if e.id == LAYOUT_ID_STACK_DYN_MAX || e.id == LAYOUT_ID_STACK_DYN_MIN)
        });
        let first_dyn = match first_dyn {
            Some(idx) => idx,
            None => return Ok(meta),
        };

        // The dynamic block opens with its guard page; everything from the
        // guard on is dropped.
        if first_dyn < 2 {
            return Err(Error::validation("dynamic thread block has no predecessor"));
        }
        let last = first_dyn - 2;
        meta.layouts.truncate(first_dyn - 1);

        let td = meta
            .layouts
            .iter()
            .position(|layout| matches!(layout.as_entry(), Some(e) if e.id == LAYOUT_ID_TD))
            .ok_or_else(|| Error::validation("layout has no utility thread"))?;

        if td != last {
            let first = td + 1;
            if first != last {
                // Repetitions the collapsed tail must cover: the EREMOVE
                // group's count plus the inline block, or just the block.
                let tail_times = match meta.layouts[last] {
                    Layout::Group(tail) => tail.load_times + 1,
                    Layout::Entry(_) => 1,
                };

                let is_static_group = matches!(meta.layouts[first],
                    Layout::Group(g) if g.id == LAYOUT_ID_THREAD_GROUP);
                if is_static_group {
                    if let Layout::Group(ref mut group) = meta.layouts[first] {
                        group.load_times += tail_times;
                    }
                } else {
                    // No static pool: the EREMOVE entries become
                    // repetitions of the utility thread block.
                    let entry_count = match meta.layouts[last] {
                        Layout::Group(_) => (last - first) as u16,
                        Layout::Entry(_) => (last - first + 1) as u16,
                    };
                    let load_step = meta.layouts[first..first + entry_count as usize]
                        .iter()
                        .filter_map(Layout::as_entry)
                        .map(|e| (e.page_count as u64) << PAGE_SHIFT)
                        .sum();
                    meta.layouts[first] = Layout::Group(LayoutGroup {
                        id: LAYOUT_ID_THREAD_GROUP,
                        entry_count,
                        load_times: tail_times,
                        load_step,
                    });
                }
                meta.layouts.truncate(first + 1);
            }
        }

        // The compat loader cannot grow memory after init: the on-demand
        // heap tier must neither load nor be dynamically addable.
        for layout in &mut meta.layouts {
            if let Layout::Entry(ref mut entry) = layout {
                match entry.id {
                    LAYOUT_ID_HEAP_MAX => {
                        entry.si_flags = SiFlags::NONE;
                        entry.attributes.remove(PageAttr::POST_ADD);
                    }
                    LAYOUT_ID_HEAP_INIT => {
                        entry.attributes.remove(PageAttr::POST_ADD);
                    }
                    _ => {}
                }
            }
        }

        Ok(meta)
    }

    /// Produce the full note-area image: primary block, compatible block,
    /// zero padding to the fixed capacity.
    pub fn note_area(&self) -> Result<Vec<u8>> {
        let primary = self.serialize()?;
        let compat = self.compatible()?.serialize()?;

        if primary.len() + compat.len() > METADATA_SIZE {
            return Err(Error::capacity(format!(
                "metadata blocks need {} bytes, note area holds {}",
                primary.len() + compat.len(),
                METADATA_SIZE
            )));
        }

        let mut out = vec![0u8; METADATA_SIZE];
        out[..primary.len()].copy_from_slice(&primary);
        out[primary.len()..primary.len() + compat.len()].copy_from_slice(&compat);
        Ok(out)
    }
}

fn read_u32(blob: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(blob[off..off + 4].try_into().unwrap())
}

fn read_u64(blob: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(blob[off..off + 8].try_into().unwrap())
}

fn dump_block(out: &mut String, blob: &[u8]) {
    let field = |out: &mut String, name: &str, value: u64| {
        let _ = writeln!(out, "metadata->{}: {:#x}", name, value);
    };

    field(out, "magic_num", read_u64(blob, 0));
    field(out, "version", read_u64(blob, 8));
    field(out, "size", read_u32(blob, 16) as u64);
    field(out, "tcs_policy", read_u32(blob, 20) as u64);
    field(out, "ssa_frame_size", read_u32(blob, 24) as u64);
    field(out, "max_save_buffer_size", read_u32(blob, 28) as u64);
    field(out, "desired_misc_select", read_u32(blob, 32) as u64);
    field(out, "tcs_min_pool", read_u32(blob, 36) as u64);
    field(out, "enclave_size", read_u64(blob, 40));
    field(out, "attributes.flags", read_u64(blob, 48));
    field(out, "attributes.xfrm", read_u64(blob, 56));

    let hex_array = |out: &mut String, name: &str, bytes: &[u8]| {
        let _ = write!(out, "enclave_css.{}:", name);
        for (i, b) in bytes.iter().enumerate() {
            if i % 16 == 0 {
                let _ = writeln!(out);
            }
            let _ = write!(out, "0x{:02x} ", b);
        }
        let _ = writeln!(out);
    };

    let css = &blob[64..];
    field(out, "enclave_css.header.type", read_u32(css, 12) as u64);
    field(out, "enclave_css.header.module_vendor", read_u32(css, 16) as u64);
    field(out, "enclave_css.header.date", read_u32(css, 20) as u64);
    field(out, "enclave_css.header.hw_version", read_u32(css, 40) as u64);
    hex_array(out, "key.modulus", &css[128..512]);
    hex_array(out, "key.exponent", &css[512..516]);
    hex_array(out, "key.signature", &css[516..900]);
    field(out, "enclave_css.body.misc_select", read_u32(css, 900) as u64);
    field(out, "enclave_css.body.misc_mask", read_u32(css, 904) as u64);
    field(out, "enclave_css.body.attributes.flags", read_u64(css, 928));
    field(out, "enclave_css.body.attributes.xfrm", read_u64(css, 936));
    field(out, "enclave_css.body.attribute_mask.flags", read_u64(css, 944));
    field(out, "enclave_css.body.attribute_mask.xfrm", read_u64(css, 952));
    hex_array(out, "body.enclave_hash", &css[960..992]);
    field(out, "enclave_css.body.isv_prod_id", read_u32(css, 1024) as u64 & 0xFFFF);
    field(out, "enclave_css.body.isv_svn", (read_u32(css, 1024) as u64 >> 16) & 0xFFFF);
    hex_array(out, "buffer.q1", &css[1040..1424]);
    hex_array(out, "buffer.q2", &css[1424..1808]);
}

/// Render the metadata block(s) found in a note area as text.
pub fn dump(blob: &[u8]) -> Result<String> {
    if blob.len() < METADATA_HEADER_SIZE || read_u64(blob, 0) != METADATA_MAGIC {
        return Err(Error::format("no metadata present in the image"));
    }

    let mut out = String::new();
    out.push_str("The metadata information:\n=========================\n");
    dump_block(&mut out, blob);

    let size = read_u32(blob, 16) as usize;
    if let Some(next) = blob.get(size..) {
        if next.len() >= METADATA_HEADER_SIZE
            && read_u64(next, 0) == METADATA_MAGIC
            && read_u64(next, 8) == METADATA_VERSION_COMPAT
        {
            out.push_str(
                "\n\nThe compatible metadata information:\n====================================\n",
            );
            dump_block(&mut out, next);
        }
    }
    Ok(out)
}
