//! Translation of caller payloads into PRP or SGL descriptors.
//!
//! All three builders leave the tracker's command with a valid PSDT and data
//! pointer on success. On any translation failure they return
//! [`NvmeError::PayloadMapping`] and the queue engine completes the request
//! synchronously with `GENERIC/INVALID_FIELD`, DNR set.

use crate::error::{NvmeError, Result};
use crate::protocol::{SglDescriptor, PSDT_PRP, PSDT_SGL_MPTR_SGL, SGL_DESCRIPTOR_SIZE};
use crate::request::{Payload, Request};
use crate::tracker::{Tracker, MAX_PRP_LIST_ENTRIES, MAX_SGL_DESCRIPTORS};
use vireo_hal::{DmaMemory, PAGE_SHIFT, PAGE_SIZE};

/// Number of pages spanned by `len` bytes whose first byte sits `unaligned`
/// bytes past a page boundary.
fn page_count(len: usize, unaligned: usize) -> usize {
    let mut nseg = len >> PAGE_SHIFT;
    let modulo = len & (PAGE_SIZE - 1);
    if modulo != 0 || unaligned != 0 {
        nseg += 1 + ((modulo + unaligned - 1) >> PAGE_SHIFT);
    }
    nseg
}

/// Build a PRP list for a virtually contiguous payload.
pub(crate) fn build_contig(req: &mut Request, tr: &mut Tracker, mem: &dyn DmaMemory) -> Result<()> {
    let Payload::Contig { buf, md } = &req.payload else {
        return Err(NvmeError::PayloadMapping);
    };

    // SAFETY: the caller guarantees `payload_offset` stays inside the pinned
    // payload buffer for the life of the request.
    let payload = unsafe { buf.as_ptr().add(req.payload_offset) };
    let phys = mem
        .vtophys(payload)
        .map_err(|_| NvmeError::PayloadMapping)?;

    let unaligned = phys as usize & (PAGE_SIZE - 1);
    let nseg = page_count(req.payload_size, unaligned);

    if let Some(md) = md {
        // SAFETY: as above, for the metadata buffer.
        let md_payload = unsafe { md.as_ptr().add(req.md_offset) };
        req.cmd.mptr = mem
            .vtophys(md_payload)
            .map_err(|_| NvmeError::PayloadMapping)?;
    }

    req.cmd.set_psdt(PSDT_PRP);
    req.cmd.prp1 = phys;

    if nseg == 2 {
        // SAFETY: one page past the (possibly unaligned) head, still inside
        // the payload since it spans two pages.
        let seg_addr = unsafe { payload.add(PAGE_SIZE - unaligned) };
        req.cmd.prp2 = mem
            .vtophys(seg_addr)
            .map_err(|_| NvmeError::PayloadMapping)?;
    } else if nseg > 2 {
        if nseg - 1 > MAX_PRP_LIST_ENTRIES {
            return Err(NvmeError::PayloadMapping);
        }
        req.cmd.prp2 = tr.scratch_bus_addr();
        // Pages may be physically discontiguous; translate each one.
        for cur_nseg in 1..nseg {
            // SAFETY: page `cur_nseg` of the payload, in bounds by `nseg`.
            let seg_addr = unsafe { payload.add(cur_nseg * PAGE_SIZE - unaligned) };
            let phys = mem
                .vtophys(seg_addr)
                .map_err(|_| NvmeError::PayloadMapping)?;
            tr.set_prp_entry(cur_nseg - 1, phys);
        }
    }

    Ok(())
}

/// Build a hardware SGL (one segment of DATA_BLOCK descriptors) for a
/// gather-list payload on an SGL-capable controller.
pub(crate) fn build_hw_sgl(req: &mut Request, tr: &mut Tracker, mem: &dyn DmaMemory) -> Result<()> {
    debug_assert!(req.payload_size != 0);
    let Payload::Gather(ref mut list) = req.payload else {
        return Err(NvmeError::PayloadMapping);
    };
    list.reset(req.payload_offset);

    req.cmd.set_psdt(PSDT_SGL_MPTR_SGL);

    let mut remaining = req.payload_size;
    let mut nseg = 0usize;
    // The first descriptor is held back so a single-descriptor transfer
    // leaves the scratch untouched and rides entirely in SGL1.
    let mut first: Option<SglDescriptor> = None;

    while remaining > 0 {
        if nseg >= MAX_SGL_DESCRIPTORS {
            return Err(NvmeError::PayloadMapping);
        }

        let (virt_addr, length) = list.next().ok_or(NvmeError::PayloadMapping)?;
        let phys = mem
            .vtophys(virt_addr.as_ptr())
            .map_err(|_| NvmeError::PayloadMapping)?;

        let length = remaining.min(length);
        remaining -= length;

        let desc = SglDescriptor::data_block(phys, length as u32);
        if nseg == 0 {
            first = Some(desc);
        } else {
            if nseg == 1 {
                tr.set_sgl_entry(0, first.unwrap());
            }
            tr.set_sgl_entry(nseg, desc);
        }
        nseg += 1;
    }

    if nseg == 1 {
        // The whole transfer fits one descriptor; SGL1 is itself the data
        // block and the scratch is unused.
        req.cmd.set_sgl1(first.unwrap());
    } else {
        req.cmd.set_sgl1(SglDescriptor::last_segment(
            tr.scratch_bus_addr(),
            (nseg * SGL_DESCRIPTOR_SIZE) as u32,
        ));
    }

    Ok(())
}

/// Build a PRP list for a gather-list payload on a controller without SGL
/// support. Every segment must be PRP compatible: 4-byte aligned, and every
/// non-final segment must end on a page boundary.
pub(crate) fn build_gather_prps(
    req: &mut Request,
    tr: &mut Tracker,
    mem: &dyn DmaMemory,
) -> Result<()> {
    let Payload::Gather(ref mut list) = req.payload else {
        return Err(NvmeError::PayloadMapping);
    };
    list.reset(req.payload_offset);

    let mut remaining = req.payload_size;
    let mut total_nseg = 0usize;
    let mut last_nseg = 0usize;
    let mut sge_count = 0usize;
    // prp2 value saved when the transfer was still describable without a
    // list; re-materialised into the scratch once a list becomes necessary.
    let mut prp2: u64 = 0;

    while remaining > 0 {
        let (virt_addr, length) = list.next().ok_or(NvmeError::PayloadMapping)?;
        let mut phys = mem
            .vtophys(virt_addr.as_ptr())
            .map_err(|_| NvmeError::PayloadMapping)?;

        if phys & 0x3 != 0
            || (length < remaining && (phys + length as u64) & (PAGE_SIZE as u64 - 1) != 0)
        {
            return Err(NvmeError::PayloadMapping);
        }

        let data_transferred = remaining.min(length);
        let unaligned = phys as usize & (PAGE_SIZE - 1);
        let nseg = page_count(data_transferred, unaligned);

        if total_nseg == 0 {
            req.cmd.set_psdt(PSDT_PRP);
            req.cmd.prp1 = phys;
            // Subsequent page addresses of this segment are computed from
            // its page-aligned base.
            phys -= unaligned as u64;
        }

        total_nseg += nseg;
        sge_count += 1;
        remaining -= data_transferred;

        if total_nseg == 2 {
            if sge_count == 1 {
                req.cmd.prp2 = phys + PAGE_SIZE as u64;
            } else if sge_count == 2 {
                req.cmd.prp2 = phys;
            }
            prp2 = req.cmd.prp2;
        } else if total_nseg > 2 {
            // Page 0 of the first segment rides in prp1.
            let mut cur_nseg = if sge_count == 1 { 1 } else { 0 };
            req.cmd.prp2 = tr.scratch_bus_addr();
            while cur_nseg < nseg {
                if last_nseg + 1 >= MAX_PRP_LIST_ENTRIES {
                    return Err(NvmeError::PayloadMapping);
                }
                if prp2 != 0 {
                    // A direct prp2 page was already chosen; it becomes the
                    // first list entry and later pages land after it.
                    tr.set_prp_entry(0, prp2);
                    tr.set_prp_entry(last_nseg + 1, phys + (cur_nseg * PAGE_SIZE) as u64);
                } else {
                    tr.set_prp_entry(last_nseg, phys + (cur_nseg * PAGE_SIZE) as u64);
                }
                last_nseg += 1;
                cur_nseg += 1;
            }
        }
    }

    Ok(())
}
