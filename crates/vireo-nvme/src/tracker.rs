//! Per-command trackers and the fixed pool they live in.
//!
//! Each in-flight command is tied to a tracker: a 4 KiB record whose tail is
//! the PRP/SGL scratch area the device reads during the transfer. The pool
//! is one DMA allocation; a tracker's identity is its array index, which is
//! also its command identifier, so the completion path resolves a CID with
//! one bounds-checked index.

use crate::error::{NvmeError, Result};
use crate::protocol::SglDescriptor;
use crate::request::Request;
use std::mem::{offset_of, size_of};
use std::sync::Arc;
use vireo_hal::{DmaBuffer, DmaMemory};

/// One PRP entry is carried in the command itself, so the largest transfer
/// is `MAX_PRP_LIST_ENTRIES * PAGE_SIZE`.
pub const MAX_PRP_LIST_ENTRIES: usize = 506;
pub const MAX_SGL_DESCRIPTORS: usize = 253;

pub const TRACKER_SIZE: usize = 4096;

/// List terminator for the index-linked tracker lists.
const NIL: u16 = u16::MAX;

/// A fixed 4 KiB tracker record.
///
/// The scratch area is a word array; PRP entries occupy one word each and
/// SGL descriptors two. Keeping the record exactly 4096 bytes and the
/// scratch 8-byte aligned means the scratch never crosses a page boundary,
/// so one bus address describes it.
#[repr(C, align(4096))]
pub struct Tracker {
    req: Option<Box<Request>>,
    scratch_bus: u64,
    next: u16,
    prev: u16,
    cid: u16,
    active: bool,
    _rsvd: [u8; 25],
    scratch: [u64; MAX_PRP_LIST_ENTRIES],
}

const _: () = assert!(size_of::<Tracker>() == TRACKER_SIZE);
const _: () = assert!(offset_of!(Tracker, scratch) % 8 == 0);
const _: () =
    assert!(offset_of!(Tracker, scratch) + MAX_PRP_LIST_ENTRIES * 8 <= TRACKER_SIZE);
const _: () = assert!(MAX_SGL_DESCRIPTORS * 2 == MAX_PRP_LIST_ENTRIES);

impl Tracker {
    fn new(cid: u16, record_bus: u64) -> Self {
        Tracker {
            req: None,
            scratch_bus: record_bus + offset_of!(Tracker, scratch) as u64,
            next: NIL,
            prev: NIL,
            cid,
            active: false,
            _rsvd: [0; 25],
            scratch: [0; MAX_PRP_LIST_ENTRIES],
        }
    }

    pub fn cid(&self) -> u16 {
        self.cid
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Bus address of the scratch area, precomputed at pool construction.
    pub fn scratch_bus_addr(&self) -> u64 {
        self.scratch_bus
    }

    pub fn prp_entry(&self, index: usize) -> u64 {
        self.scratch[index]
    }

    pub fn sgl_entry(&self, index: usize) -> SglDescriptor {
        SglDescriptor::from_words(self.scratch[2 * index], self.scratch[2 * index + 1])
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub(crate) fn set_prp_entry(&mut self, index: usize, addr: u64) {
        self.scratch[index] = addr;
    }

    pub(crate) fn set_sgl_entry(&mut self, index: usize, desc: SglDescriptor) {
        let (w0, w1) = desc.to_words();
        self.scratch[2 * index] = w0;
        self.scratch[2 * index + 1] = w1;
    }

    pub(crate) fn req(&self) -> Option<&Request> {
        self.req.as_deref()
    }

    pub(crate) fn req_mut(&mut self) -> Option<&mut Request> {
        self.req.as_deref_mut()
    }

    pub(crate) fn attach_req(&mut self, req: Box<Request>) {
        self.req = Some(req);
    }

    pub(crate) fn take_req(&mut self) -> Option<Box<Request>> {
        self.req.take()
    }
}

/// Pool of trackers over a single 4 KiB-aligned DMA allocation.
///
/// Every tracker is on exactly one of the two lists: `free` (singly linked)
/// or `outstanding` (doubly linked, so an arbitrary tracker can be released
/// in O(1)).
pub(crate) struct TrackerPool {
    buf: Option<DmaBuffer>,
    mem: Arc<dyn DmaMemory>,
    num: u16,
    free_head: u16,
    outstanding_head: u16,
}

impl TrackerPool {
    pub fn new(mem: Arc<dyn DmaMemory>, num: u16) -> Result<Self> {
        assert!(num > 0 && num < NIL);

        let len = num as usize * TRACKER_SIZE;
        let buf = mem
            .dma_zalloc(len, TRACKER_SIZE)
            .ok_or(NvmeError::OutOfMemory)?;

        let mut pool = TrackerPool {
            buf: Some(buf),
            mem,
            num,
            free_head: 0,
            outstanding_head: NIL,
        };

        let base_bus = pool.buf.as_ref().unwrap().bus_addr();
        for i in 0..num {
            let mut tr = Tracker::new(i, base_bus + i as u64 * TRACKER_SIZE as u64);
            // Thread the free list in index order so the first acquisition
            // hands out CID 0.
            tr.next = if i + 1 < num { i + 1 } else { NIL };
            // SAFETY: slot i is in bounds and exclusively owned by the pool.
            unsafe { pool.slot_ptr(i).write(tr) };
        }

        Ok(pool)
    }

    fn slot_ptr(&self, index: u16) -> *mut Tracker {
        assert!(index < self.num);
        let base = self.buf.as_ref().expect("pool destroyed").as_ptr();
        // SAFETY: in-bounds by the assert; alignment holds because the
        // allocation is 4096-aligned and the stride is 4096.
        unsafe { base.add(index as usize * TRACKER_SIZE) as *mut Tracker }
    }

    pub fn get(&self, index: u16) -> &Tracker {
        // SAFETY: slot was initialised in `new`; `&self` prevents mutation.
        unsafe { &*self.slot_ptr(index) }
    }

    pub fn get_mut(&mut self, index: u16) -> &mut Tracker {
        // SAFETY: as in `get`; `&mut self` gives exclusive access.
        unsafe { &mut *self.slot_ptr(index) }
    }

    pub fn num(&self) -> u16 {
        self.num
    }

    /// Index that the next `acquire` would return, if any.
    pub fn peek_free(&self) -> Option<u16> {
        (self.free_head != NIL).then_some(self.free_head)
    }

    /// Pop the free-list head and move it to the outstanding list.
    pub fn acquire(&mut self) -> Option<u16> {
        let idx = self.free_head;
        if idx == NIL {
            return None;
        }
        self.free_head = self.get(idx).next;

        let old_head = self.outstanding_head;
        {
            let tr = self.get_mut(idx);
            tr.next = old_head;
            tr.prev = NIL;
        }
        if old_head != NIL {
            self.get_mut(old_head).prev = idx;
        }
        self.outstanding_head = idx;
        Some(idx)
    }

    /// Unlink from the outstanding list and push back onto the free list.
    pub fn release(&mut self, index: u16) {
        let (prev, next) = {
            let tr = self.get(index);
            (tr.prev, tr.next)
        };
        if prev != NIL {
            self.get_mut(prev).next = next;
        } else {
            debug_assert_eq!(self.outstanding_head, index);
            self.outstanding_head = next;
        }
        if next != NIL {
            self.get_mut(next).prev = prev;
        }

        let free_head = self.free_head;
        {
            let tr = self.get_mut(index);
            tr.next = free_head;
            tr.prev = NIL;
        }
        self.free_head = index;
    }

    /// Snapshot of the outstanding list, in list order. Used by the abort
    /// paths, which release trackers while walking.
    pub fn outstanding_ids(&self) -> Vec<u16> {
        let mut ids = Vec::new();
        let mut cur = self.outstanding_head;
        while cur != NIL {
            ids.push(cur);
            cur = self.get(cur).next;
        }
        ids
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding_ids().len()
    }

    pub fn free_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.free_head;
        while cur != NIL {
            count += 1;
            cur = self.get(cur).next;
        }
        count
    }
}

impl Drop for TrackerPool {
    fn drop(&mut self) {
        for i in 0..self.num {
            // Release any request still attached before the memory goes away.
            drop(self.get_mut(i).take_req());
        }
        if let Some(buf) = self.buf.take() {
            self.mem.dma_free(buf);
        }
    }
}
