// SPDX-License-Identifier: Apache-2.0

//! Enclave measurement.
//!
//! Replays the architectural page-measurement algorithm over the image and
//! the synthesized layout: one ECREATE record, then per added page an EADD
//! record, and for measured pages an EEXTEND record plus the page content
//! for every 256-byte stride. The resulting digest is the enclave's
//! identity and must reproduce bit for bit across runs.

use crate::arch::*;
use crate::elf::{EnclaveElf, Section};
use crate::error::{Error, Result};
use crate::metadata::{Layout, LayoutEntry, Metadata};

use log::trace;
use sha2::{Digest, Sha256};

const PAGE: usize = PAGE_SIZE as usize;

// Record markers, little-endian ASCII.
const ECREATE: u64 = 0x0045544145524345;
const EADD: u64 = 0x0000000044444145;
const EEXTEND: u64 = 0x00444E4554584545;

/// The running measurement. One context is threaded through the whole
/// page walk; there is no global hash state.
pub struct Hasher(Sha256);

impl Hasher {
    /// Start the measurement with the ECREATE record.
    pub fn new(enclave_size: u64, ssa_frame_size: u32) -> Self {
        let mut sha256 = Sha256::new();
        sha256.update(ECREATE.to_le_bytes());
        sha256.update(ssa_frame_size.to_le_bytes());
        sha256.update(enclave_size.to_le_bytes());
        sha256.update([0u8; 44]);
        Self(sha256)
    }

    /// Measure added pages. `data` must be page-multiple; `measure` says
    /// whether the page content is extended into the digest or only the
    /// page's security info.
    pub fn load(&mut self, data: &[u8], offset: u64, si_flags: SiFlags, measure: bool) {
        debug_assert_eq!(data.len() % PAGE, 0);
        debug_assert_eq!(offset % PAGE_SIZE, 0);

        for (i, page) in data.chunks(PAGE).enumerate() {
            let off = offset + (i * PAGE) as u64;

            self.0.update(EADD.to_le_bytes());
            self.0.update(off.to_le_bytes());
            self.0.update(si_flags.secinfo());

            if measure {
                for (j, segment) in page.chunks(256).enumerate() {
                    self.0.update(EEXTEND.to_le_bytes());
                    self.0.update((off + (j * 256) as u64).to_le_bytes());
                    self.0.update([0u8; 48]);
                    self.0.update(segment);
                }
            }
        }
    }

    /// Finish and return the measurement.
    pub fn finish(self) -> [u8; 32] {
        self.0.finalize().into()
    }
}

/// Add one section the way the loader does: initialized data page by page
/// (the first page may start unaligned, the last is zero-padded), then the
/// zero-filled tail up to the virtual size.
fn load_section(hasher: &mut Hasher, image: &[u8], elf: &EnclaveElf, sec: &Section) {
    let raw = sec.raw_data(image);
    let mut off = 0u64;

    while off < sec.raw_size {
        let rva = sec.rva + off;
        let page_off = (rva & (PAGE_SIZE - 1)) as usize;
        let take = ((PAGE_SIZE - rva % PAGE_SIZE).min(sec.raw_size - off)) as usize;

        let mut page = [0u8; PAGE];
        page[page_off..page_off + take].copy_from_slice(&raw[off as usize..off as usize + take]);

        // Relocated pages must be writable when the image carries text
        // relocations; the measurement reflects that.
        let mut flags = sec.si_flags;
        if elf.is_relocation_page(rva) && !flags.contains(SiFlags::W) {
            flags |= SiFlags::W;
        }

        hasher.load(&page, trim_to_page(rva), flags, true);
        // Only the first page can start unaligned.
        off += PAGE_SIZE - rva % PAGE_SIZE;
    }

    debug_assert_eq!((sec.rva + off) % PAGE_SIZE, 0);

    if sec.virtual_size > off {
        let rva = sec.rva + off;
        let pages = (round_to_page(sec.virtual_size - off) / PAGE_SIZE) as usize;
        let zero = [0u8; PAGE];
        for i in 0..pages {
            hasher.load(&zero, rva + (i * PAGE) as u64, sec.si_flags, true);
        }
    }
}

/// Measure one layout entry at `delta + entry.rva`. Entries without EADD
/// never reach the hash; EADD-only entries contribute their security info
/// alone.
fn load_layout_entry(
    hasher: &mut Hasher,
    meta: &Metadata,
    entry: &LayoutEntry,
    delta: u64,
) -> Result<()> {
    if !entry.attributes.contains(PageAttr::EADD) {
        return Ok(());
    }

    let rva = entry.rva + delta;
    let measure = entry.attributes.contains(PageAttr::EEXTEND);

    if entry.content_offset != 0 {
        // Only TCS pages carry template content; the template's thread
        // offsets are rebased to this repetition before measurement.
        if entry.si_flags != SiFlags::tcs() {
            return Err(Error::validation("non-TCS layout entry with template content"));
        }
        let mut tcs = meta.tcs_template;
        tcs.ossa += rva;
        tcs.ofs_base += rva;
        tcs.ogs_base += rva;

        let mut page = [0u8; PAGE];
        page[..TCS_TEMPLATE_SIZE].copy_from_slice(&tcs.to_bytes());
        for i in 0..entry.page_count as u64 {
            hasher.load(&page, rva + i * PAGE_SIZE, entry.si_flags, measure);
        }
    } else if entry.si_flags != SiFlags::NONE {
        let page = if entry.content_size != 0 {
            let mut page = [0u8; PAGE];
            for chunk in page.chunks_mut(4) {
                chunk.copy_from_slice(&entry.content_size.to_le_bytes());
            }
            page
        } else {
            [0u8; PAGE]
        };
        for i in 0..entry.page_count as u64 {
            hasher.load(&page, rva + i * PAGE_SIZE, entry.si_flags, measure);
        }
    }
    Ok(())
}

/// Walk a slice of the layout table, replaying groups over the entries
/// that precede them with an accumulating step.
fn load_layouts(
    hasher: &mut Hasher,
    meta: &Metadata,
    layouts: &[Layout],
    delta: u64,
) -> Result<()> {
    for (i, layout) in layouts.iter().enumerate() {
        match layout {
            Layout::Entry(entry) => load_layout_entry(hasher, meta, entry, delta)?,
            Layout::Group(group) => {
                let count = group.entry_count as usize;
                if count > i {
                    return Err(Error::validation("group back-reference underflows the table"));
                }
                let mut step = 0u64;
                for _ in 0..group.load_times {
                    step += group.load_step;
                    load_layouts(hasher, meta, &layouts[i - count..i], delta + step)?;
                }
            }
        }
    }
    Ok(())
}

/// Compute the enclave measurement over a (patched) image and its
/// metadata. Re-running over the same inputs yields the same digest.
pub fn measure(image: &[u8], elf: &EnclaveElf, meta: &Metadata) -> Result<[u8; 32]> {
    let mut hasher = Hasher::new(meta.enclave_size, SSA_FRAME_SIZE);

    for sec in &elf.sections {
        load_section(&mut hasher, image, elf, sec);
    }
    load_layouts(&mut hasher, meta, &meta.layouts, 0)?;

    let digest = hasher.finish();
    trace!("enclave measurement: {:02x?}", digest);
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    // A NOTE ABOUT THESE ANSWERS
    //
    // The ANSWER digests were produced by an independent implementation of
    // the record protocol and pin the exact byte layout of the ECREATE,
    // EADD and EEXTEND records. A change in any record breaks them.

    #[test]
    fn ecreate_only() {
        const ANSWER: [u8; 32] = [
            60, 199, 22, 164, 44, 141, 112, 125, 164, 138, 23, 50, 120, 211, 157, 128, 133, 94,
            229, 247, 123, 136, 30, 235, 165, 129, 3, 73, 229, 1, 39, 194,
        ];
        assert_eq!(Hasher::new(0x1000, 1).finish(), ANSWER);
    }

    #[test]
    fn one_measured_page() {
        const ANSWER: [u8; 32] = [
            7, 3, 168, 255, 207, 122, 191, 227, 168, 10, 3, 14, 208, 209, 101, 7, 17, 45, 86, 23,
            94, 22, 194, 12, 233, 110, 13, 217, 173, 196, 215, 27,
        ];
        let mut hasher = Hasher::new(0x2000, 2);
        hasher.load(&[0u8; PAGE], 0, SiFlags::reg_rw(), true);
        assert_eq!(hasher.finish(), ANSWER);
    }

    #[test]
    fn measured_and_unmeasured_pages() {
        const ANSWER: [u8; 32] = [
            183, 189, 11, 170, 90, 55, 205, 122, 3, 179, 78, 170, 18, 208, 26, 97, 37, 146, 9, 81,
            171, 121, 62, 176, 21, 38, 118, 91, 203, 169, 12, 76,
        ];
        let mut hasher = Hasher::new(0x8000, 2);
        hasher.load(&[0x5A; PAGE], 0x3000, SiFlags::reg_rwx(), true);
        hasher.load(&[0u8; PAGE], 0x5000, SiFlags::reg_rw(), false);
        assert_eq!(hasher.finish(), ANSWER);
    }

    #[test]
    fn tcs_page() {
        const ANSWER: [u8; 32] = [
            66, 10, 36, 116, 147, 236, 74, 209, 25, 68, 99, 58, 243, 81, 88, 183, 117, 56, 193,
            129, 176, 86, 201, 120, 96, 214, 128, 89, 76, 116, 86, 49,
        ];
        let mut hasher = Hasher::new(0x1000, 1);
        hasher.load(&[0u8; PAGE], 0, SiFlags::tcs(), true);
        assert_eq!(hasher.finish(), ANSWER);
    }

    #[test]
    fn stack_fill_page() {
        const ANSWER: [u8; 32] = [
            196, 167, 250, 75, 134, 161, 16, 131, 152, 193, 191, 76, 187, 201, 25, 161, 184, 3,
            204, 119, 126, 195, 213, 96, 145, 145, 7, 99, 175, 101, 225, 215,
        ];
        let mut fill = [0u8; PAGE];
        for chunk in fill.chunks_mut(4) {
            chunk.copy_from_slice(&STACK_FILL.to_le_bytes());
        }
        let mut hasher = Hasher::new(0x4000, 1);
        hasher.load(&fill, 0x1000, SiFlags::reg_rw(), true);
        assert_eq!(hasher.finish(), ANSWER);
    }

    #[test]
    fn determinism() {
        let run = || {
            let mut hasher = Hasher::new(0x10000, 2);
            hasher.load(&[7u8; 2 * PAGE], 0x2000, SiFlags::reg_rwx(), true);
            hasher.load(&[0u8; PAGE], 0x8000, SiFlags::reg_rw(), false);
            hasher.finish()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn content_changes_the_measurement() {
        let digest = |byte: u8| {
            let mut hasher = Hasher::new(0x2000, 2);
            hasher.load(&[byte; PAGE], 0, SiFlags::reg_rw(), true);
            hasher.finish()
        };
        assert_ne!(digest(0), digest(1));
    }

    #[test]
    fn unmeasured_content_does_not_matter() {
        let digest = |byte: u8| {
            let mut hasher = Hasher::new(0x2000, 2);
            hasher.load(&[byte; PAGE], 0, SiFlags::reg_rw(), false);
            hasher.finish()
        };
        assert_eq!(digest(0), digest(1));
    }
}
