// SPDX-License-Identifier: Apache-2.0

//! Memory layout synthesis.
//!
//! Consumes the validated parameter table and the parsed image and emits
//! the layout table, the TCS and global-data templates and the patch table
//! into the metadata under construction. The layout mirrors what the
//! hardware builds at load time: heap tiers, per-thread blocks, optional
//! dynamic thread pools, guard pages and a power-of-two enclave size.

use crate::arch::*;
use crate::config::Parameters;
use crate::elf::{EnclaveElf, E_SHNUM_OFFSET, E_SHOFF_OFFSET, E_SHSTRNDX_OFFSET};
use crate::error::{Error, Result};
use crate::metadata::{
    Layout, LayoutEntry, LayoutGroup, Metadata, PatchEntry, PatchSource, TCS_TEMPLATE_OFFSET,
};

use log::{debug, trace};

/// Parameter cross-validation. Individual ranges were checked at load;
/// this enforces the relations between fields.
fn cross_validate(params: &Parameters) -> Result<()> {
    if params.stack_max_size & (PAGE_SIZE - 1) != 0 || params.stack_min_size & (PAGE_SIZE - 1) != 0
    {
        return Err(Error::validation("stack sizes must be page aligned"));
    }
    if params.stack_min_size > params.stack_max_size {
        return Err(Error::validation("StackMinSize exceeds StackMaxSize"));
    }

    if params.heap_max_size & (PAGE_SIZE - 1) != 0
        || params.heap_min_size & (PAGE_SIZE - 1) != 0
        || params.heap_init_size & (PAGE_SIZE - 1) != 0
    {
        return Err(Error::validation("heap sizes must be page aligned"));
    }
    if params.heap_init_size_set {
        if params.heap_init_size > params.heap_max_size {
            return Err(Error::validation("HeapInitSize exceeds HeapMaxSize"));
        }
        if params.heap_min_size > params.heap_init_size {
            return Err(Error::validation("HeapMinSize exceeds HeapInitSize"));
        }
    } else if params.heap_min_size > params.heap_max_size {
        return Err(Error::validation("HeapMinSize exceeds HeapMaxSize"));
    }

    // Launch enclaves and only launch enclaves run on raw hardware keys.
    if (params.hw != 0) != params.launch_key {
        return Err(Error::validation(
            "HW and LaunchKey must be enabled together",
        ));
    }

    if params.tcs_max_num_set {
        if params.tcs_max_num < params.tcs_num {
            return Err(Error::validation("TCSMaxNum is less than TCSNum"));
        }
        if params.tcs_min_pool_set && params.tcs_min_pool > params.tcs_max_num {
            return Err(Error::validation("TCSMinPool exceeds TCSMaxNum"));
        }
    } else if params.tcs_min_pool_set && params.tcs_min_pool > params.tcs_num {
        return Err(Error::validation("TCSMinPool exceeds TCSNum"));
    }

    Ok(())
}

fn entry(id: u16, attributes: PageAttr, page_count: u32, si_flags: SiFlags) -> LayoutEntry {
    LayoutEntry {
        id,
        attributes,
        page_count,
        rva: 0,
        content_size: 0,
        content_offset: 0,
        si_flags,
    }
}

/// Emit the heap tiers and the utility thread block, then replicate the
/// block for the static pool, the removable threads and the dynamic pool.
fn build_layout_table(params: &Parameters, elf: &EnclaveElf) -> Vec<Layout> {
    let heap_si = if params.heap_executable {
        SiFlags::reg_rwx()
    } else {
        SiFlags::reg_rw()
    };
    let guard = Layout::guard((GUARD_PAGE_SIZE >> PAGE_SHIFT) as u32);
    let mut layouts = Vec::new();

    // Heap: the committed floor, the initially grown span and the
    // grow-on-demand ceiling. Each tier exists only if it adds pages.
    layouts.push(Layout::Entry(entry(
        LAYOUT_ID_HEAP_MIN,
        PageAttr::add_page_only(),
        (params.heap_min_size >> PAGE_SHIFT) as u32,
        heap_si,
    )));
    if params.heap_init_size > params.heap_min_size {
        layouts.push(Layout::Entry(entry(
            LAYOUT_ID_HEAP_INIT,
            PageAttr::EADD | PageAttr::POST_REMOVE | PageAttr::POST_ADD,
            ((params.heap_init_size - params.heap_min_size) >> PAGE_SHIFT) as u32,
            heap_si,
        )));
    }
    if params.heap_max_size > params.heap_init_size {
        layouts.push(Layout::Entry(entry(
            LAYOUT_ID_HEAP_MAX,
            PageAttr::POST_ADD,
            ((params.heap_max_size - params.heap_init_size) >> PAGE_SHIFT) as u32,
            heap_si,
        )));
    }

    // One thread block:
    // guard | stack max | stack min | guard | TCS | SSA | guard | TD+TLS
    let thread_start = layouts.len();
    layouts.push(guard);

    if params.stack_max_size > params.stack_min_size {
        let mut stack = entry(
            LAYOUT_ID_STACK_MAX,
            PageAttr::add_extend_page() | PageAttr::GROW_DOWN,
            ((params.stack_max_size - params.stack_min_size) >> PAGE_SHIFT) as u32,
            SiFlags::reg_rw(),
        );
        stack.content_size = STACK_FILL;
        layouts.push(Layout::Entry(stack));
    }
    let mut stack = entry(
        LAYOUT_ID_STACK_MIN,
        PageAttr::add_extend_page(),
        (params.stack_min_size >> PAGE_SHIFT) as u32,
        SiFlags::reg_rw(),
    );
    stack.content_size = STACK_FILL;
    layouts.push(Layout::Entry(stack));

    layouts.push(guard);

    let mut tcs = entry(
        LAYOUT_ID_TCS,
        PageAttr::add_extend_page(),
        (TCS_SIZE >> PAGE_SHIFT) as u32,
        SiFlags::tcs(),
    );
    tcs.content_offset = TCS_TEMPLATE_OFFSET;
    tcs.content_size = TCS_TEMPLATE_SIZE as u32;
    layouts.push(Layout::Entry(tcs));

    layouts.push(Layout::Entry(entry(
        LAYOUT_ID_SSA,
        PageAttr::add_extend_page(),
        SSA_FRAME_SIZE * SSA_NUM,
        SiFlags::reg_rw(),
    )));

    layouts.push(guard);

    let tls_pages = elf
        .tls
        .as_ref()
        .map(|tls| (round_to_page(tls.virtual_size) >> PAGE_SHIFT) as u32)
        .unwrap_or(0);
    layouts.push(Layout::Entry(entry(
        LAYOUT_ID_TD,
        PageAttr::add_extend_page(),
        1 + tls_pages,
        SiFlags::reg_rw(),
    )));

    let thread_end = layouts.len();
    let block_len = (thread_end - thread_start) as u16;

    // The utility thread is always materialized; the remaining static
    // threads split into a kept pool and a created-then-removed tail.
    let (min_pool, eremove) = if params.tcs_min_pool > params.tcs_num - 1 {
        (params.tcs_num - 1, 0)
    } else {
        (params.tcs_min_pool, params.tcs_num - 1 - params.tcs_min_pool)
    };

    if min_pool > 0 {
        layouts.push(Layout::Group(LayoutGroup {
            id: LAYOUT_ID_THREAD_GROUP,
            entry_count: block_len,
            load_times: min_pool,
            load_step: 0,
        }));
    }

    if eremove > 0 {
        for i in thread_start..thread_end {
            let mut layout = layouts[i];
            if let Layout::Entry(ref mut e) = layout {
                if e.id != LAYOUT_ID_GUARD {
                    e.attributes |= PageAttr::EREMOVE;
                }
            }
            layouts.push(layout);
        }
        if eremove > 1 {
            layouts.push(Layout::Group(LayoutGroup {
                id: LAYOUT_ID_THREAD_GROUP,
                entry_count: block_len,
                load_times: eremove - 1,
                load_step: 0,
            }));
        }
    }

    // Threads beyond the static set exist only as dynamic ranges, added
    // after init on demand.
    if params.tcs_max_num > min_pool + 1 {
        for i in thread_start..thread_end {
            let mut layout = layouts[i];
            if let Layout::Entry(ref mut e) = layout {
                if e.id == LAYOUT_ID_STACK_MAX {
                    e.id += LAYOUT_ID_DYN_DELTA;
                    e.attributes = PageAttr::POST_ADD | PageAttr::GROW_DOWN;
                } else if e.id != LAYOUT_ID_GUARD {
                    e.id += LAYOUT_ID_DYN_DELTA;
                    e.attributes = PageAttr::POST_ADD | PageAttr::DYN_THREAD;
                }
            }
            layouts.push(layout);
        }
        if params.tcs_max_num > params.tcs_min_pool {
            layouts.push(Layout::Group(LayoutGroup {
                id: LAYOUT_ID_THREAD_GROUP_DYN,
                entry_count: block_len,
                load_times: params.tcs_max_num - min_pool - 1,
                load_step: 0,
            }));
        }
    }

    layouts
}

/// The single forward pass that assigns RVAs to entries and accumulated
/// steps to groups, followed by the power-of-two size computation and the
/// trailing guard that pads out the remainder.
fn assign_rvas(meta: &mut Metadata, base: u64) -> Result<()> {
    let mut rva = base;

    for i in 0..meta.layouts.len() {
        match meta.layouts[i] {
            Layout::Entry(mut e) => {
                e.rva = rva;
                rva += (e.page_count as u64) << PAGE_SHIFT;
                meta.layouts[i] = Layout::Entry(e);
            }
            Layout::Group(mut g) => {
                let count = g.entry_count as usize;
                // A group repeats the entries physically preceding it; the
                // builder never emits anything else. Anything different is
                // a construction defect.
                if count > i {
                    return Err(Error::validation("group back-reference underflows the table"));
                }
                let mut step = 0u64;
                for j in 0..count {
                    match meta.layouts[i - j - 1] {
                        Layout::Entry(prev) => step += (prev.page_count as u64) << PAGE_SHIFT,
                        Layout::Group(_) => {
                            return Err(Error::validation(
                                "group back-reference crosses another group",
                            ))
                        }
                    }
                }
                g.load_step = step;
                rva += g.load_times as u64 * step;
                meta.layouts[i] = Layout::Group(g);
            }
        }
    }

    meta.enclave_size = enclave_size_for(rva)?;
    trace!("layout spans {:#x}, enclave size {:#x}", rva, meta.enclave_size);

    if meta.enclave_size > rva {
        meta.layouts.push(Layout::Entry(LayoutEntry {
            id: LAYOUT_ID_GUARD,
            attributes: PageAttr::empty(),
            page_count: ((meta.enclave_size - rva) >> PAGE_SHIFT) as u32,
            rva,
            content_size: 0,
            content_offset: 0,
            si_flags: SiFlags::NONE,
        }));
    }
    Ok(())
}

/// Round up to the next power of two within the platform maximum.
fn enclave_size_for(size: u64) -> Result<u64> {
    if size > ENCLAVE_MAX_SIZE_64 {
        return Err(Error::capacity(format!(
            "enclave needs {:#x} bytes, platform maximum is {:#x}",
            size, ENCLAVE_MAX_SIZE_64
        )));
    }
    let mut round = 1u64;
    while round < size {
        round <<= 1;
    }
    if round > ENCLAVE_MAX_SIZE_64 {
        return Err(Error::capacity("enclave size exceeds the platform maximum"));
    }
    Ok(round)
}

fn required_entry(meta: &Metadata, id: u16) -> Result<LayoutEntry> {
    meta.entry_by_id(id)
        .copied()
        .ok_or_else(|| Error::validation("layout table is missing a required entry"))
}

fn build_tcs_template(meta: &mut Metadata, elf: &EnclaveElf) -> Result<()> {
    if elf.entry_rva == 0 {
        return Err(Error::validation("enclave entry point not found"));
    }

    let tcs = required_entry(meta, LAYOUT_ID_TCS)?;
    let ssa = required_entry(meta, LAYOUT_ID_SSA)?;
    let td = required_entry(meta, LAYOUT_ID_TD)?;

    // Offsets are relative to the owning TCS; the loader rebases them for
    // every repetition of the thread block.
    meta.tcs_template = Tcs {
        oentry: elf.entry_rva,
        nssa: SSA_NUM,
        cssa: 0,
        ossa: ssa.rva - tcs.rva,
        ofs_base: td.rva - tcs.rva + ((td.page_count as u64 - 1) << PAGE_SHIFT),
        ogs_base: td.rva - tcs.rva + ((td.page_count as u64 - 1) << PAGE_SHIFT),
        ofs_limit: u32::MAX,
        ogs_limit: u32::MAX,
        ..Tcs::default()
    };
    Ok(())
}

/// Per-thread runtime bootstrap record, embedded in the global data.
/// Stack and TLS fields are offsets relative to the owning TCS; negative
/// offsets are carried in two's complement.
#[derive(Clone, Copy, Debug, Default)]
struct ThreadData {
    self_addr: u64,
    last_sp: u64,
    stack_base_addr: u64,
    stack_limit_addr: u64,
    first_ssa_gpr: u64,
    stack_guard: u64,
    ssa_frame_size: u64,
    last_error: u64,
    tls_addr: u64,
    tls_array: u64,
    exception_flag: u64,
}

/// The enclave runtime's global bootstrap data, spliced over the
/// `g_global_data` symbol by the patch table.
#[derive(Clone, Copy, Debug, Default)]
struct GlobalData {
    enclave_size: u64,
    heap_offset: u64,
    heap_size: u64,
    thread_policy: u64,
    xsave_size: u64,
    td_template: ThreadData,
}

impl GlobalData {
    fn to_bytes(self) -> Vec<u8> {
        let words = [
            self.enclave_size,
            self.heap_offset,
            self.heap_size,
            self.thread_policy,
            self.xsave_size,
            self.td_template.self_addr,
            self.td_template.last_sp,
            self.td_template.stack_base_addr,
            self.td_template.stack_limit_addr,
            self.td_template.first_ssa_gpr,
            self.td_template.stack_guard,
            self.td_template.ssa_frame_size,
            self.td_template.last_error,
            self.td_template.tls_addr,
            self.td_template.tls_array,
            self.td_template.exception_flag,
        ];
        let mut out = Vec::with_capacity(words.len() * 8);
        for word in words {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out
    }
}

fn build_global_data(meta: &mut Metadata, params: &Parameters, elf: &EnclaveElf) -> Result<()> {
    let xsave = xsave_size(meta.attributes.xfrm)
        .ok_or_else(|| Error::validation("attribute XFRM claims reserved bits"))?;

    let tcs = required_entry(meta, LAYOUT_ID_TCS)?;
    let ssa = required_entry(meta, LAYOUT_ID_SSA)?;
    let td = required_entry(meta, LAYOUT_ID_TD)?;
    let stack_min = required_entry(meta, LAYOUT_ID_STACK_MIN)?;
    let heap_min = required_entry(meta, LAYOUT_ID_HEAP_MIN)?;

    // The stack sits below the TCS: these offsets are negative and wrap.
    let stack_base = (stack_min.rva + params.stack_min_size).wrapping_sub(tcs.rva);
    let stack_limit = stack_base.wrapping_sub(params.stack_max_size);
    let first_ssa_gpr =
        ssa.rva - tcs.rva + (SSA_FRAME_SIZE as u64) * PAGE_SIZE - GPR_RECORD_SIZE;

    let td_base = td.rva - tcs.rva;
    let td_addr = td_base + ((td.page_count as u64 - 1) << PAGE_SHIFT);

    let tls_addr = match &elf.tls {
        Some(tls) => {
            let addr = td_addr.wrapping_sub(tls.virtual_size);
            // The TLS area must occupy exactly the pages in front of the
            // thread descriptor; the TD page count was derived from the
            // same virtual size, so a mismatch is a construction defect.
            if trim_to_page(addr) != td_base {
                return Err(Error::validation("TLS area does not abut the thread descriptor"));
            }
            addr
        }
        None => td_base,
    };

    let gd = GlobalData {
        enclave_size: meta.enclave_size,
        heap_offset: heap_min.rva,
        heap_size: params.heap_max_size,
        thread_policy: params.tcs_policy as u64,
        xsave_size: xsave as u64,
        td_template: ThreadData {
            self_addr: td_addr,
            last_sp: stack_base,
            stack_base_addr: stack_base,
            stack_limit_addr: stack_limit,
            first_ssa_gpr,
            ssa_frame_size: SSA_FRAME_SIZE as u64,
            tls_addr,
            ..ThreadData::default()
        },
    };
    meta.global_data = gd.to_bytes();
    Ok(())
}

/// Patch table: splice the global data over its symbol, blank the section
/// header references and any RELRO program header. All fixups target the
/// output file only.
fn build_patches(meta: &mut Metadata, elf: &EnclaveElf) -> Result<()> {
    let gd_rva = elf
        .global_data_rva
        .ok_or_else(|| Error::validation("g_global_data symbol not found"))?;
    let gd_dst = elf
        .file_offset_of_rva(gd_rva)
        .ok_or_else(|| Error::validation("g_global_data has no initialized backing"))?;

    meta.patches.push(PatchEntry {
        dst: gd_dst,
        source: PatchSource::GlobalData,
        size: meta.global_data.len() as u32,
    });

    // Section headers play no part at load time; blanking them keeps the
    // measurement independent of tooling that rewrites them.
    for (dst, size) in [
        (E_SHNUM_OFFSET, 2u32),
        (E_SHOFF_OFFSET, 8),
        (E_SHSTRNDX_OFFSET, 2),
    ] {
        meta.patches.push(PatchEntry {
            dst,
            source: PatchSource::Zero,
            size,
        });
    }

    if let Some(offset) = elf.relro_phdr_offset {
        meta.patches.push(PatchEntry {
            dst: offset,
            source: PatchSource::Zero,
            size: crate::elf::PHDR_SIZE as u32,
        });
    }
    Ok(())
}

/// Build the complete layout into `meta`.
pub fn build(meta: &mut Metadata, params: &Parameters, elf: &EnclaveElf) -> Result<()> {
    cross_validate(params)?;

    let base = elf.mapped_size();
    if base == 0 {
        return Err(Error::format("image maps no content"));
    }

    meta.layouts = build_layout_table(params, elf);
    assign_rvas(meta, base)?;
    build_tcs_template(meta, elf)?;
    build_global_data(meta, params, elf)?;
    build_patches(meta, elf)?;

    debug!(
        "layout: {} records, enclave size {:#x}",
        meta.layouts.len(),
        meta.enclave_size
    );
    Ok(())
}
