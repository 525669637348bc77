// SPDX-License-Identifier: Apache-2.0

//! Enclave image parsing and validation.
//!
//! The input is an ELF64 shared object. Parsing indexes everything the rest
//! of the pipeline needs (loadable sections, the TLS segment, reserved
//! symbols, the `.note.sgxmeta` slot) and enforces the structural rules an
//! enclave must satisfy. Every violation is a hard failure; there is no
//! recovery path.

use crate::arch::{round_to, round_to_page, trim_to_page, PAGE_SHIFT, PAGE_SIZE, SiFlags};
use crate::error::{Error, Result};

use goblin::elf::dynamic::{DT_NULL, DT_REL, DT_TEXTREL};
use goblin::elf::header::{EI_CLASS, EI_DATA, EI_VERSION, ELFCLASS64, ELFDATA2LSB, EM_X86_64, ET_DYN, EV_CURRENT};
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_GNU_RELRO, PT_LOAD, PT_TLS};
use goblin::elf::reloc::{
    R_X86_64_64, R_X86_64_DTPMOD64, R_X86_64_DTPOFF64, R_X86_64_GLOB_DAT, R_X86_64_JUMP_SLOT,
    R_X86_64_NONE, R_X86_64_RELATIVE, R_X86_64_TPOFF64,
};
use goblin::elf::sym::STB_WEAK;
use goblin::elf::Elf;
use log::{debug, warn};

/// Size of one ELF64 program header; `e_phentsize` must agree.
pub const PHDR_SIZE: usize = 56;

/// File offsets of the header fields blanked by the patch table.
pub const E_SHOFF_OFFSET: u64 = 0x28;
pub const E_SHNUM_OFFSET: u64 = 0x3C;
pub const E_SHSTRNDX_OFFSET: u64 = 0x3E;

const NOTE_HEADER_SIZE: u64 = 12;
const METADATA_NOTE_SECTION: &str = ".note.sgxmeta";
const METADATA_NOTE_NAME: &[u8] = b"sgx_metadata\0";

/// Count of the classic dynamic tags held directly by tag value.
const DT_COUNT: usize = 34;
/// Extra slots for the `DT_ADDRRNGLO..=DT_ADDRRNGHI` range.
const DT_ADDR_COUNT: usize = 12;
const DT_ADDRRNGLO: u64 = 0x6FFF_FE00;
const DT_ADDRRNGHI: u64 = 0x6FFF_FEFF;

/// A loadable region of the enclave image. Immutable once built.
#[derive(Clone, Debug)]
pub struct Section {
    /// File offset of the raw data.
    pub offset: u64,
    /// Bytes of initialized data in the file.
    pub raw_size: u64,
    /// Bytes occupied in memory (zero-filled past `raw_size`).
    pub virtual_size: u64,
    /// Offset relative to the enclave base.
    pub rva: u64,
    pub si_flags: SiFlags,
}

impl Section {
    /// The initialized bytes backing this section.
    pub fn raw_data<'a>(&self, image: &'a [u8]) -> &'a [u8] {
        &image[self.offset as usize..(self.offset + self.raw_size) as usize]
    }
}

/// The `.note.sgxmeta` descriptor slot the signed metadata lands in.
#[derive(Copy, Clone, Debug)]
pub struct MetadataSlot {
    /// File offset of the note descriptor.
    pub offset: u64,
    /// Descriptor capacity in bytes.
    pub size: u64,
}

/// Dynamic-tag table indexed by tag value, with the address-range tags
/// folded into an extended index. All tags are known at compile time.
struct DynTable {
    slots: [Option<u64>; DT_COUNT + DT_ADDR_COUNT],
}

impl DynTable {
    fn new(dyns: &[goblin::elf::dynamic::Dyn]) -> Self {
        let mut slots = [None; DT_COUNT + DT_ADDR_COUNT];
        for dyn_entry in dyns {
            if dyn_entry.d_tag == DT_NULL {
                break;
            }
            if (dyn_entry.d_tag as usize) < DT_COUNT {
                slots[dyn_entry.d_tag as usize] = Some(dyn_entry.d_val);
            } else if dyn_entry.d_tag > DT_ADDRRNGLO && dyn_entry.d_tag <= DT_ADDRRNGHI {
                let idx = (DT_ADDRRNGHI - dyn_entry.d_tag) as usize + DT_COUNT;
                if idx < slots.len() {
                    slots[idx] = Some(dyn_entry.d_val);
                }
            }
        }
        Self { slots }
    }

    fn get(&self, tag: u64) -> Option<u64> {
        self.slots.get(tag as usize).copied().flatten()
    }
}

/// Everything the rest of the pipeline needs from the image, owned.
pub struct EnclaveElf {
    pub sections: Vec<Section>,
    pub tls: Option<Section>,
    /// RVA of `enclave_entry` (or `e_entry` when the symbol is nameless).
    pub entry_rva: u64,
    /// RVA of `g_global_data`, when exported.
    pub global_data_rva: Option<u64>,
    pub metadata_slot: MetadataSlot,
    /// One bit per page carrying a relocation; present only for images
    /// linked with text relocations.
    pub reloc_bitmap: Option<Vec<u8>>,
    /// File offset of the `PT_GNU_RELRO` program header, if any.
    pub relro_phdr_offset: Option<u64>,
}

impl EnclaveElf {
    /// Page-rounded end of the highest loadable section: where the
    /// synthesized layout begins.
    pub fn mapped_size(&self) -> u64 {
        let end = self
            .sections
            .iter()
            .max_by_key(|sec| sec.rva)
            .map(|sec| sec.rva + sec.virtual_size)
            .unwrap_or(0);
        round_to_page(end)
    }

    /// Translate an RVA into a file offset through the section that maps
    /// it, or `None` when the RVA has no initialized backing.
    pub fn file_offset_of_rva(&self, rva: u64) -> Option<u64> {
        for sec in &self.sections {
            let start = trim_to_page(sec.rva);
            let end = round_to_page(sec.rva + sec.virtual_size);
            if (start..end).contains(&rva) {
                let offset = rva.checked_sub(sec.rva)?;
                if offset > sec.raw_size {
                    return None;
                }
                return Some(sec.offset + offset);
            }
        }
        None
    }

    /// Whether the page holding `rva` carries a relocation.
    pub fn is_relocation_page(&self, rva: u64) -> bool {
        let bitmap = match &self.reloc_bitmap {
            Some(bitmap) => bitmap,
            None => return false,
        };
        let frame = (rva >> PAGE_SHIFT) as usize;
        bitmap
            .get(frame / 8)
            .map(|byte| byte & (1 << (frame % 8)) != 0)
            .unwrap_or(false)
    }
}

fn si_flags_for(p_flags: u32) -> SiFlags {
    let mut flags = SiFlags::PT_REG;
    if p_flags & PF_R != 0 {
        flags |= SiFlags::R;
    }
    if p_flags & PF_W != 0 {
        flags |= SiFlags::W;
    }
    if p_flags & PF_X != 0 {
        flags |= SiFlags::X;
    }
    flags
}

fn validate_header(elf: &Elf<'_>) -> Result<()> {
    let hdr = &elf.header;
    if hdr.e_ident[EI_CLASS] != ELFCLASS64 {
        return Err(Error::format("not a 64-bit image"));
    }
    if hdr.e_ident[EI_DATA] != ELFDATA2LSB {
        return Err(Error::format("not little-endian"));
    }
    if hdr.e_ident[EI_VERSION] != EV_CURRENT {
        return Err(Error::format("unexpected ELF version"));
    }
    if hdr.e_type != ET_DYN {
        return Err(Error::format("enclave image must be a shared object"));
    }
    if hdr.e_machine != EM_X86_64 {
        return Err(Error::format("unexpected machine type"));
    }
    if hdr.e_phentsize as usize != PHDR_SIZE {
        return Err(Error::format("unexpected program header entry size"));
    }
    Ok(())
}

fn validate_segments(elf: &Elf<'_>, len: u64) -> Result<()> {
    let mut ranges: Vec<(u64, u64)> = Vec::new();

    for phdr in &elf.program_headers {
        if len < phdr.p_offset + phdr.p_filesz {
            return Err(Error::format("segment extends past end of file"));
        }

        if phdr.p_type != PT_LOAD {
            continue;
        }

        // The ABI allows 2M alignment; EPC pages are 4K, so anything
        // page-multiple is acceptable.
        if phdr.p_align == 0 || phdr.p_align & (PAGE_SIZE - 1) != 0 {
            warn!("segment alignment {:#x} is not page aligned", phdr.p_align);
            return Err(Error::validation("segment not page aligned"));
        }

        let range = (
            phdr.p_vaddr,
            round_to(phdr.p_vaddr + phdr.p_memsz, phdr.p_align) - 1,
        );
        for prev in &ranges {
            if range.0 <= prev.1 && prev.0 <= range.1 {
                return Err(Error::validation(format!(
                    "overlapping load segments [{:#x}, {:#x}] and [{:#x}, {:#x}]",
                    range.0, range.1, prev.0, prev.1
                )));
            }
        }
        ranges.push(range);
    }
    Ok(())
}

/// Scan `.dynsym` for undefined symbols and capture the reserved ones.
fn check_symbols(elf: &Elf<'_>) -> Result<(u64, Option<u64>)> {
    if elf.dynsyms.is_empty() {
        return Err(Error::format("image has no dynamic symbol table"));
    }

    let mut entry = None;
    let mut global_data = None;

    for (idx, sym) in elf.dynsyms.iter().enumerate() {
        // The first entry is reserved and all zeros.
        if idx == 0 || sym.st_name == 0 {
            continue;
        }

        let name = elf
            .dynstrtab
            .get_at(sym.st_name)
            .ok_or_else(|| Error::format("symbol with name outside string table"))?;

        if sym.st_shndx == 0 && sym.st_bind() != STB_WEAK {
            return Err(Error::validation(format!("symbol '{}' is undefined", name)));
        }

        match name {
            "enclave_entry" => entry = Some(sym.st_value),
            "g_global_data" => global_data = Some(sym.st_value),
            _ => {}
        }
    }

    // A -pie link can leave `enclave_entry` nameless; the header entry
    // point is the same address.
    let entry = entry.unwrap_or(elf.header.e_entry);
    Ok((entry, global_data))
}

fn validate_relocs(elf: &Elf<'_>, dyn_table: &DynTable) -> Result<()> {
    // On x86-64 relocations carry explicit addends; a REL table means the
    // image was produced for another ABI.
    if dyn_table.get(DT_REL).is_some() || !elf.dynrels.is_empty() {
        return Err(Error::validation("REL relocation table on x86-64"));
    }

    for reloc in elf.dynrelas.iter().chain(elf.pltrelocs.iter()) {
        match reloc.r_type {
            R_X86_64_RELATIVE
            | R_X86_64_GLOB_DAT
            | R_X86_64_JUMP_SLOT
            | R_X86_64_64
            | R_X86_64_NONE
            | R_X86_64_DTPMOD64
            | R_X86_64_DTPOFF64
            | R_X86_64_TPOFF64 => {}
            other => {
                return Err(Error::validation(format!(
                    "unsupported relocation type {}",
                    other
                )))
            }
        }
    }
    Ok(())
}

/// One bit per page touched by a relocation. Only needed for images with
/// text relocations, where non-writable pages must measure as writable.
fn reloc_bitmap(elf: &Elf<'_>, sections: &[Section]) -> Option<Vec<u8>> {
    let image_size = sections
        .iter()
        .max_by_key(|sec| sec.rva)
        .map(|sec| sec.rva + sec.virtual_size)?;

    let pages = (image_size + PAGE_SIZE - 1) >> PAGE_SHIFT;
    let mut bitmap = vec![0u8; ((pages + 7) / 8) as usize];

    let mut mark = |rva: u64| {
        let frame = (rva >> PAGE_SHIFT) as usize;
        if let Some(byte) = bitmap.get_mut(frame / 8) {
            *byte |= 1 << (frame % 8);
        }
    };

    for reloc in elf.dynrelas.iter().chain(elf.pltrelocs.iter()) {
        if reloc.r_type == R_X86_64_NONE {
            continue;
        }
        let rva = reloc.r_offset;
        mark(rva);
        // A relocation straddling the page boundary dirties the next page
        // as well.
        if rva & (PAGE_SIZE - 1) > PAGE_SIZE - 8 {
            mark(rva + PAGE_SIZE);
        }
    }
    Some(bitmap)
}

fn find_section_by_name<'a>(
    elf: &'a Elf<'_>,
    name: &str,
) -> Option<&'a goblin::elf::SectionHeader> {
    elf.section_headers
        .iter()
        .find(|shdr| elf.shdr_strtab.get_at(shdr.sh_name) == Some(name))
}

/// Locate and validate the `.note.sgxmeta` slot.
fn metadata_slot(elf: &Elf<'_>, image: &[u8]) -> Result<MetadataSlot> {
    let shdr = find_section_by_name(elf, METADATA_NOTE_SECTION)
        .ok_or_else(|| Error::format("image has no .note.sgxmeta section"))?;

    let off = shdr.sh_offset as usize;
    let header = image
        .get(off..off + NOTE_HEADER_SIZE as usize)
        .ok_or_else(|| Error::format("metadata note header out of bounds"))?;
    let namesz = u32::from_le_bytes(header[0..4].try_into().unwrap()) as u64;
    let descsz = u32::from_le_bytes(header[4..8].try_into().unwrap()) as u64;

    // The note section holds the metadata and nothing else.
    let expected = round_to(
        NOTE_HEADER_SIZE + namesz + descsz,
        shdr.sh_addralign.max(1),
    );
    if shdr.sh_size != expected {
        return Err(Error::format("unexpected .note.sgxmeta section size"));
    }

    let name_off = off + NOTE_HEADER_SIZE as usize;
    let name = image
        .get(name_off..name_off + namesz as usize)
        .ok_or_else(|| Error::format("metadata note name out of bounds"))?;
    if name != METADATA_NOTE_NAME {
        return Err(Error::format(
            "the .note.sgxmeta note must be named \"sgx_metadata\"",
        ));
    }

    Ok(MetadataSlot {
        offset: shdr.sh_offset + NOTE_HEADER_SIZE + namesz,
        size: descsz,
    })
}

/// Parse and validate an enclave image.
pub fn parse(image: &[u8]) -> Result<EnclaveElf> {
    let elf = Elf::parse(image).map_err(|e| Error::format(format!("ELF parse: {}", e)))?;

    validate_header(&elf)?;
    validate_segments(&elf, image.len() as u64)?;

    let dynamic = elf
        .dynamic
        .as_ref()
        .filter(|dynamic| !dynamic.dyns.is_empty())
        .ok_or_else(|| Error::format("image has no dynamic segment"))?;
    let dyn_table = DynTable::new(&dynamic.dyns);

    let (entry_rva, global_data_rva) = check_symbols(&elf)?;
    validate_relocs(&elf, &dyn_table)?;

    // Legacy constructor tables never run inside an enclave.
    if find_section_by_name(&elf, ".ctors").is_some() {
        return Err(Error::validation(
            ".ctors section found, global initializers would be skipped",
        ));
    }

    let slot = metadata_slot(&elf, image)?;

    let mut sections = Vec::new();
    let mut tls = None;
    let mut relro_phdr_offset = None;

    for (idx, phdr) in elf.program_headers.iter().enumerate() {
        match phdr.p_type {
            PT_LOAD => {
                let si_flags = si_flags_for(phdr.p_flags);
                if si_flags == SiFlags::PT_REG {
                    return Err(Error::validation("load segment grants no access"));
                }
                sections.push(Section {
                    offset: phdr.p_offset,
                    raw_size: phdr.p_filesz,
                    virtual_size: phdr.p_memsz,
                    rva: phdr.p_vaddr,
                    si_flags,
                });
            }
            PT_TLS => {
                let align = phdr.p_align;
                let virtual_size = if align <= 1 {
                    phdr.p_memsz
                } else {
                    round_to(phdr.p_memsz, align)
                };
                tls = Some(Section {
                    offset: phdr.p_offset,
                    raw_size: phdr.p_filesz,
                    virtual_size,
                    rva: phdr.p_vaddr,
                    si_flags: si_flags_for(phdr.p_flags),
                });
            }
            PT_GNU_RELRO => {
                relro_phdr_offset =
                    Some(elf.header.e_phoff + (idx * PHDR_SIZE) as u64);
            }
            _ => {}
        }
    }

    if sections.is_empty() {
        return Err(Error::format("image has no loadable segments"));
    }

    let bitmap = if dyn_table.get(DT_TEXTREL).is_some() {
        debug!("image carries text relocations, building relocation bitmap");
        reloc_bitmap(&elf, &sections)
    } else {
        None
    };

    Ok(EnclaveElf {
        sections,
        tls,
        entry_rva,
        global_data_rva,
        metadata_slot: slot,
        reloc_bitmap: bitmap,
        relro_phdr_offset,
    })
}
