// SPDX-License-Identifier: Apache-2.0

//! A hand-built minimal enclave image for pipeline tests.
//!
//! The image is a valid `ET_DYN` ELF64 with two load segments, a dynamic
//! segment exporting `enclave_entry` and `g_global_data`, and an empty
//! `.note.sgxmeta` slot of the full metadata capacity. Optional features
//! inject a TLS segment or an unsupported relocation.

pub const ENTRY_RVA: u64 = 0x400;
pub const GLOBAL_DATA_RVA: u64 = 0x1000;
pub const NOTE_DESC_OFFSET: u64 = 0x2019;

const METADATA_SIZE: u64 = 0x5000;

const PHDRS_OFFSET: u64 = 0x40;
const HASH_OFFSET: u64 = 0x180;
const DYNSYM_OFFSET: u64 = 0x200;
const DYNSTR_OFFSET: u64 = 0x248;
const DYNAMIC_OFFSET: u64 = 0x270;
const RELA_OFFSET: u64 = 0x300;
const NOTE_OFFSET: u64 = 0x2000;
const SHSTRTAB_OFFSET: u64 = 0x7100;
const SHDRS_OFFSET: u64 = 0x7140;
const FILE_SIZE: u64 = 0x7200;

const TLS_RVA: u64 = 0x1800;
const TLS_MEMSZ: u64 = 0x180;

#[derive(Default)]
pub struct Fixture {
    /// Add a PT_TLS segment.
    pub tls: bool,
    /// Add an R_X86_64_COPY relocation, which no enclave may carry.
    pub bad_reloc: bool,
}

fn put(image: &mut [u8], offset: u64, bytes: &[u8]) {
    let offset = offset as usize;
    image[offset..offset + bytes.len()].copy_from_slice(bytes);
}

struct Cursor<'a> {
    image: &'a mut [u8],
    offset: u64,
}

impl Cursor<'_> {
    fn u16(&mut self, v: u16) {
        put(self.image, self.offset, &v.to_le_bytes());
        self.offset += 2;
    }

    fn u32(&mut self, v: u32) {
        put(self.image, self.offset, &v.to_le_bytes());
        self.offset += 4;
    }

    fn u64(&mut self, v: u64) {
        put(self.image, self.offset, &v.to_le_bytes());
        self.offset += 8;
    }

    fn bytes(&mut self, bytes: &[u8]) {
        put(self.image, self.offset, bytes);
        self.offset += bytes.len() as u64;
    }
}

#[allow(clippy::too_many_arguments)]
fn phdr(
    c: &mut Cursor<'_>,
    p_type: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
) {
    c.u32(p_type);
    c.u32(flags);
    c.u64(offset);
    c.u64(vaddr);
    c.u64(vaddr); // paddr
    c.u64(filesz);
    c.u64(memsz);
    c.u64(align);
}

fn shdr(c: &mut Cursor<'_>, name: u32, sh_type: u32, offset: u64, size: u64, addralign: u64) {
    c.u32(name);
    c.u32(sh_type);
    c.u64(0); // flags
    c.u64(0); // addr
    c.u64(offset);
    c.u64(size);
    c.u32(0); // link
    c.u32(0); // info
    c.u64(addralign);
    c.u64(0); // entsize
}

fn sym(c: &mut Cursor<'_>, name: u32, info: u8, shndx: u16, value: u64) {
    c.u32(name);
    c.bytes(&[info, 0]);
    c.u16(shndx);
    c.u64(value);
    c.u64(0); // size
}

/// Build the image.
pub fn build_enclave(fixture: Fixture) -> Vec<u8> {
    let mut image = vec![0u8; FILE_SIZE as usize];

    let mut phnum = 3u16;
    if fixture.tls {
        phnum += 1;
    }

    // ELF header.
    let mut c = Cursor { image: &mut image, offset: 0 };
    c.bytes(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    c.u16(3); // ET_DYN
    c.u16(62); // EM_X86_64
    c.u32(1);
    c.u64(ENTRY_RVA);
    c.u64(PHDRS_OFFSET);
    c.u64(SHDRS_OFFSET);
    c.u32(0);
    c.u16(64);
    c.u16(56);
    c.u16(phnum);
    c.u16(64);
    c.u16(3);
    c.u16(2);

    // Dynamic entries: symbol and string tables, plus a relocation table
    // when the fixture injects one.
    let mut dyns: Vec<(u64, u64)> = vec![
        (4, HASH_OFFSET),   // DT_HASH
        (6, DYNSYM_OFFSET), // DT_SYMTAB
        (11, 24),           // DT_SYMENT
        (5, DYNSTR_OFFSET), // DT_STRTAB
        (10, 29),           // DT_STRSZ
    ];
    if fixture.bad_reloc {
        dyns.push((7, RELA_OFFSET)); // DT_RELA
        dyns.push((8, 24)); // DT_RELASZ
        dyns.push((9, 24)); // DT_RELAENT
    }
    dyns.push((0, 0)); // DT_NULL
    let dynamic_size = (dyns.len() * 16) as u64;

    // Program headers.
    let mut c = Cursor { image: &mut image, offset: PHDRS_OFFSET };
    phdr(&mut c, 1, 0x5, 0, 0, 0x800, 0x800, 0x1000); // PT_LOAD r-x
    phdr(&mut c, 1, 0x6, 0x1000, 0x1000, 0x200, 0x1000, 0x1000); // PT_LOAD rw-
    phdr(&mut c, 2, 0x6, DYNAMIC_OFFSET, DYNAMIC_OFFSET, dynamic_size, dynamic_size, 8);
    if fixture.tls {
        phdr(&mut c, 7, 0x4, TLS_RVA, TLS_RVA, 0, TLS_MEMSZ, 8);
    }

    // SysV hash table. goblin sizes the dynamic symbol array from the
    // chain count, so `nchain` must equal the three symbols below; the
    // bucket/chain contents are otherwise unused by the parser.
    let mut c = Cursor { image: &mut image, offset: HASH_OFFSET };
    c.u32(1); // nbucket
    c.u32(3); // nchain == number of dynamic symbols
    c.u32(0); // bucket[0]
    c.u32(0); // chain[0]
    c.u32(0); // chain[1]
    c.u32(0); // chain[2]

    // Dynamic symbols: the reserved null entry, the entry point and the
    // global data anchor.
    let mut c = Cursor { image: &mut image, offset: DYNSYM_OFFSET };
    sym(&mut c, 0, 0, 0, 0);
    sym(&mut c, 1, 0x12, 1, ENTRY_RVA);
    sym(&mut c, 15, 0x11, 1, GLOBAL_DATA_RVA);
    put(&mut image, DYNSTR_OFFSET, b"\0enclave_entry\0g_global_data\0");

    let mut c = Cursor { image: &mut image, offset: DYNAMIC_OFFSET };
    for (tag, val) in dyns {
        c.u64(tag);
        c.u64(val);
    }

    if fixture.bad_reloc {
        let mut c = Cursor { image: &mut image, offset: RELA_OFFSET };
        c.u64(GLOBAL_DATA_RVA); // r_offset
        c.u64(5); // R_X86_64_COPY
        c.u64(0); // addend
    }

    // A little code so the text page is not all zeros.
    put(&mut image, ENTRY_RVA, &[0xCC; 16]);

    // The metadata note: header, name, then the empty descriptor slot.
    let mut c = Cursor { image: &mut image, offset: NOTE_OFFSET };
    c.u32(13); // namesz
    c.u32(METADATA_SIZE as u32); // descsz
    c.u32(1); // type
    c.bytes(b"sgx_metadata\0");
    assert_eq!(c.offset, NOTE_DESC_OFFSET);

    put(&mut image, SHSTRTAB_OFFSET, b"\0.note.sgxmeta\0.shstrtab\0");

    let note_size = 12 + 13 + METADATA_SIZE;
    let mut c = Cursor { image: &mut image, offset: SHDRS_OFFSET };
    shdr(&mut c, 0, 0, 0, 0, 0);
    shdr(&mut c, 1, 7, NOTE_OFFSET, (note_size + 3) & !3, 4); // SHT_NOTE
    shdr(&mut c, 15, 3, SHSTRTAB_OFFSET, 25, 1); // SHT_STRTAB

    image
}
