//! The submission/completion queue-pair engine.
//!
//! A queue pair owns two hardware rings (64-byte submission slots, 16-byte
//! completion slots), the tail/head indices and phase bit that drive them,
//! the doorbells that publish index updates, and the tracker pool tying
//! completions back to requests. Submission and completion are non-blocking;
//! callers serialise access to one queue pair, while distinct queue pairs
//! may progress on distinct threads.

use crate::ctrlr::Shared;
use crate::error::{NvmeError, Result};
use crate::payload;
use crate::protocol::{admin_opc, sc, Command, Completion, Status, SCT_GENERIC};
use crate::regs::{Doorbell, RegisterWindow};
use crate::request::{PayloadKind, Request};
use crate::tracker::{Tracker, TrackerPool};
use std::collections::VecDeque;
use std::ptr::{read_volatile, write_bytes, write_volatile, NonNull};
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use vireo_hal::{DmaBuffer, DmaMemory};

const ADMIN_QID: u16 = 0;

/// Arbitration priority recorded for I/O submission queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePriority {
    Urgent = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

/// SQ placement inside the controller memory buffer.
pub(crate) struct CmbSqPlacement {
    pub virt: NonNull<u8>,
    pub bus: u64,
}

pub struct QueuePair {
    id: u16,
    num_entries: u16,
    qprio: QueuePriority,

    sq_tail: u16,
    cq_head: u16,
    phase: u8,
    is_enabled: bool,

    sq_ring: *mut Command,
    cq_ring: *mut Completion,
    sq_bus: u64,
    cq_bus: u64,
    sq_in_cmb: bool,
    /// Ring allocations; the SQ buffer is absent when the SQ lives in CMB.
    sq_buf: Option<DmaBuffer>,
    cq_buf: Option<DmaBuffer>,

    sq_tdbl: Doorbell,
    cq_hdbl: Doorbell,

    trackers: TrackerPool,
    /// Requests deferred because no tracker was free or the pair was
    /// disabled; drained in FIFO order.
    queued: VecDeque<Box<Request>>,

    mem: Arc<dyn DmaMemory>,
    shared: Arc<Shared>,
}

// Ring pointers target memory owned by this queue pair (or the CMB mapping,
// which outlives it); access is serialised by `&mut self`.
unsafe impl Send for QueuePair {}

impl QueuePair {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn construct(
        id: u16,
        num_entries: u16,
        num_trackers: u16,
        qprio: QueuePriority,
        regs: &RegisterWindow,
        doorbell_stride_u32: u32,
        cmb_sq: Option<CmbSqPlacement>,
        mem: Arc<dyn DmaMemory>,
        shared: Arc<Shared>,
    ) -> Result<QueuePair> {
        assert!(num_entries >= 2);
        assert!(num_trackers >= 1 && num_trackers <= num_entries - 1);

        let sq_len = num_entries as usize * std::mem::size_of::<Command>();
        let cq_len = num_entries as usize * std::mem::size_of::<Completion>();

        // Both rings must sit on 4 KiB boundaries.
        let (sq_ring, sq_bus, sq_buf, sq_in_cmb) = match cmb_sq {
            Some(p) => (p.virt.as_ptr() as *mut Command, p.bus, None, true),
            None => {
                let buf = mem.dma_zalloc(sq_len, 4096).ok_or(NvmeError::OutOfMemory)?;
                (buf.as_ptr() as *mut Command, buf.bus_addr(), Some(buf), false)
            }
        };

        let cq_buf = match mem.dma_zalloc(cq_len, 4096) {
            Some(buf) => buf,
            None => {
                if let Some(buf) = sq_buf {
                    mem.dma_free(buf);
                }
                return Err(NvmeError::OutOfMemory);
            }
        };
        let cq_ring = cq_buf.as_ptr() as *mut Completion;
        let cq_bus = cq_buf.bus_addr();

        let trackers = match TrackerPool::new(mem.clone(), num_trackers) {
            Ok(pool) => pool,
            Err(err) => {
                if let Some(buf) = sq_buf {
                    mem.dma_free(buf);
                }
                mem.dma_free(cq_buf);
                return Err(err);
            }
        };

        let mut qpair = QueuePair {
            id,
            num_entries,
            qprio,
            sq_tail: 0,
            cq_head: 0,
            phase: 1,
            is_enabled: false,
            sq_ring,
            cq_ring,
            sq_bus,
            cq_bus,
            sq_in_cmb,
            sq_buf,
            cq_buf: Some(cq_buf),
            sq_tdbl: regs.sq_tail_doorbell(id, doorbell_stride_u32),
            cq_hdbl: regs.cq_head_doorbell(id, doorbell_stride_u32),
            trackers,
            queued: VecDeque::new(),
            mem,
            shared,
        };
        qpair.reset();
        Ok(qpair)
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn num_entries(&self) -> u16 {
        self.num_entries
    }

    pub fn priority(&self) -> QueuePriority {
        self.qprio
    }

    pub fn is_enabled(&self) -> bool {
        self.is_enabled
    }

    pub fn sq_tail(&self) -> u16 {
        self.sq_tail
    }

    pub fn cq_head(&self) -> u16 {
        self.cq_head
    }

    pub fn phase(&self) -> u8 {
        self.phase
    }

    pub fn sq_in_cmb(&self) -> bool {
        self.sq_in_cmb
    }

    pub fn sq_bus_addr(&self) -> u64 {
        self.sq_bus
    }

    pub fn cq_bus_addr(&self) -> u64 {
        self.cq_bus
    }

    pub fn outstanding_commands(&self) -> usize {
        self.trackers.outstanding_count()
    }

    pub fn free_trackers(&self) -> usize {
        self.trackers.free_count()
    }

    pub fn deferred_requests(&self) -> usize {
        self.queued.len()
    }

    /// Tracker by command identifier, if one exists.
    pub fn tracker(&self, cid: u16) -> Option<&Tracker> {
        (cid < self.trackers.num()).then(|| self.trackers.get(cid))
    }

    fn is_admin(&self) -> bool {
        self.id == ADMIN_QID
    }

    /// Clear the indices, reset the phase for a fresh first pass, and zero
    /// both rings. The phase starts at 1 because the device writes 1 into
    /// the first generation of completions.
    pub fn reset(&mut self) {
        self.sq_tail = 0;
        self.cq_head = 0;
        self.phase = 1;

        // SAFETY: ring pointers cover exactly `num_entries` slots.
        unsafe {
            write_bytes(self.sq_ring, 0, self.num_entries as usize);
            write_bytes(self.cq_ring, 0, self.num_entries as usize);
        }
    }

    /// Mark the pair usable and synthetically fail what a reset left behind.
    /// Admin commands are not retried (their issuing context is gone); I/O
    /// commands may retry subject to their own counters.
    pub fn enable(&mut self) {
        self.is_enabled = true;
        if self.is_admin() {
            self.abort_trackers(true);
        } else {
            self.abort_trackers(false);
        }
    }

    pub fn disable(&mut self) {
        self.is_enabled = false;
        if self.is_admin() {
            self.abort_aers();
        }
    }

    /// Fail every outstanding command with no retry.
    pub fn fail(&mut self) {
        self.abort_trackers(true);
    }

    fn check_enabled(&mut self) -> bool {
        if !self.is_enabled && !self.shared.is_resetting() {
            self.enable();
        }
        self.is_enabled
    }

    /// Submit a request.
    ///
    /// Returns `Ok` even when the request was deferred for lack of a
    /// tracker (it is retried when a completion frees one, or after reset).
    /// Returns [`NvmeError::PayloadMapping`] when the payload could not be
    /// translated; the request has then already been completed with
    /// `GENERIC/INVALID_FIELD`.
    pub fn submit(&mut self, req: Box<Request>) -> Result<()> {
        self.check_enabled();

        // Older deferred requests go first so FIFO order holds.
        if self.is_enabled && !self.shared.is_resetting() {
            self.flush_deferred();
        }

        if !self.is_enabled || self.trackers.peek_free().is_none() {
            self.queued.push_back(req);
            return Ok(());
        }

        self.submit_one(req)
    }

    fn flush_deferred(&mut self) {
        while self.trackers.peek_free().is_some() {
            let Some(req) = self.queued.pop_front() else {
                break;
            };
            // A failed build completes the popped request in place; keep
            // draining.
            let _ = self.submit_one(req);
        }
    }

    fn submit_one(&mut self, mut req: Box<Request>) -> Result<()> {
        let idx = self
            .trackers
            .acquire()
            .expect("caller checked for a free tracker");
        req.cmd.cid = idx;

        let build = if req.payload_size == 0 {
            Ok(()) // null payload leaves the data pointer zeroed
        } else {
            match req.payload.kind() {
                PayloadKind::Contig => {
                    payload::build_contig(&mut req, self.trackers.get_mut(idx), self.mem.as_ref())
                }
                PayloadKind::Gather => {
                    if self.shared.sgl_supported() {
                        payload::build_hw_sgl(
                            &mut req,
                            self.trackers.get_mut(idx),
                            self.mem.as_ref(),
                        )
                    } else {
                        payload::build_gather_prps(
                            &mut req,
                            self.trackers.get_mut(idx),
                            self.mem.as_ref(),
                        )
                    }
                }
                PayloadKind::None => Err(NvmeError::PayloadMapping),
            }
        };

        self.trackers.get_mut(idx).attach_req(req);

        match build {
            Ok(()) => {
                self.submit_tracker(idx);
                Ok(())
            }
            Err(_) => {
                // Bad translation: deliver INVALID_FIELD to the caller now.
                self.trackers.get_mut(idx).set_active(true);
                self.manual_complete_tracker(idx, SCT_GENERIC, sc::INVALID_FIELD, true, true);
                Err(NvmeError::PayloadMapping)
            }
        }
    }

    /// Copy the tracker's command into the ring and publish the new tail.
    fn submit_tracker(&mut self, idx: u16) {
        let tr = self.trackers.get_mut(idx);
        tr.set_active(true);
        let cmd = tr.req().expect("submitting tracker without request").cmd;

        // SAFETY: sq_tail < num_entries; both sides are 64-byte aligned.
        unsafe { write_volatile(self.sq_ring.add(self.sq_tail as usize), cmd) };

        self.sq_tail += 1;
        if self.sq_tail == self.num_entries {
            self.sq_tail = 0;
        }

        // The command slot must be visible to the device before the tail.
        fence(Ordering::Release);
        self.sq_tdbl.write(self.sq_tail as u32);
    }

    /// Poll the completion ring, consuming at most `max_completions` entries
    /// (0 means "a full queue depth"). Returns the number consumed.
    pub fn process_completions(&mut self, max_completions: u32) -> u32 {
        if !self.check_enabled() {
            // Mid-reset; whatever this poll would have found is retried
            // after the reset finishes.
            return 0;
        }

        let depth = (self.num_entries - 1) as u32;
        let max = if max_completions == 0 || max_completions > depth {
            // Cap one batch at queue depth so the head doorbell cannot wrap
            // within a single invocation.
            depth
        } else {
            max_completions
        };

        let mut num_completions = 0u32;
        loop {
            // SAFETY: cq_head < num_entries; ring allocated at construction.
            let cpl = unsafe { read_volatile(self.cq_ring.add(self.cq_head as usize)) };
            if cpl.phase() != self.phase {
                break;
            }
            // Pairs with the device ordering the entry before its phase bit.
            fence(Ordering::Acquire);

            let cid = cpl.cid;
            if cid < self.trackers.num() && self.trackers.get(cid).is_active() {
                self.complete_tracker(cid, &cpl, true);
            } else {
                log::error!(
                    "qpair {}: completion (cid {cid}, status {:#06x}) does not map to an outstanding command",
                    self.id,
                    cpl.status
                );
                debug_assert!(false, "completion does not map to an outstanding command");
            }

            self.cq_head += 1;
            if self.cq_head == self.num_entries {
                self.cq_head = 0;
                self.phase ^= 1;
            }

            num_completions += 1;
            if num_completions == max {
                break;
            }
        }

        if num_completions > 0 {
            self.cq_hdbl.write(self.cq_head as u32);
        }

        if self.is_admin() {
            self.drain_pending_admin();
        }

        num_completions
    }

    fn complete_tracker(&mut self, idx: u16, cpl: &Completion, print_on_error: bool) {
        let error = cpl.is_error();
        let (retry, was_active) = {
            let tr = self.trackers.get(idx);
            let req = tr.req().expect("completing tracker without request");
            (
                error && cpl.requests_retry() && req.retries < self.shared.retry_count(),
                tr.is_active(),
            )
        };

        if error && print_on_error {
            let req = self.trackers.get(idx).req().expect("checked above");
            let st = cpl.parsed_status();
            log::error!(
                "qpair {}: command {:#04x} (cid {}, nsid {}) failed: sct {:#x}, sc {:#x}, dnr {}",
                self.id,
                req.cmd.opc,
                cpl.cid,
                req.cmd.nsid,
                st.sct,
                st.sc,
                st.dnr as u8
            );
        }

        if cpl.cid < self.trackers.num() {
            self.trackers.get_mut(cpl.cid).set_active(false);
        }
        debug_assert_eq!(
            cpl.cid,
            self.trackers.get(idx).req().expect("checked above").cmd.cid
        );

        if retry {
            self.trackers
                .get_mut(idx)
                .req_mut()
                .expect("checked above")
                .retries += 1;
            self.submit_tracker(idx);
            return;
        }

        let mut req = self
            .trackers
            .get_mut(idx)
            .take_req()
            .expect("checked above");
        if was_active {
            if self.is_admin() && req.pid != std::process::id() {
                // Park on the originating process's pending list; it runs
                // the callback from its own completion pass.
                req.saved_cpl = *cpl;
                if let Err(orphan) = self.shared.processes().park(req) {
                    log::error!(
                        "admin completion for pid {} has no registered owner; dropping request",
                        orphan.pid
                    );
                }
            } else {
                req.invoke_callback(cpl);
            }
        }

        self.trackers.release(idx);

        if !self.queued.is_empty() && !self.shared.is_resetting() {
            // The freed tracker goes to the oldest deferred request; the
            // reset logic handles deferred work when a reset is in flight.
            self.flush_deferred();
        }
    }

    fn manual_complete_tracker(&mut self, idx: u16, sct: u8, sc: u8, dnr: bool, print: bool) {
        let mut cpl = Completion::default();
        cpl.sqid = self.id;
        cpl.cid = self.trackers.get(idx).cid();
        cpl.set_status(Status::new(sct, sc, dnr));
        self.complete_tracker(idx, &cpl, print);
    }

    fn abort_trackers(&mut self, dnr: bool) {
        for idx in self.trackers.outstanding_ids() {
            log::warn!("qpair {}: aborting outstanding command (cid {idx})", self.id);
            self.manual_complete_tracker(idx, SCT_GENERIC, sc::ABORTED_BY_REQUEST, dnr, true);
        }
    }

    /// Abort in-flight Asynchronous Event Requests. They never complete on
    /// their own, so teardown must synthesise their completions.
    pub(crate) fn abort_aers(&mut self) {
        let aers: Vec<u16> = self
            .trackers
            .outstanding_ids()
            .into_iter()
            .filter(|&idx| {
                self.trackers
                    .get(idx)
                    .req()
                    .is_some_and(|req| req.cmd.opc == admin_opc::ASYNC_EVENT_REQUEST)
            })
            .collect();
        for idx in aers {
            self.manual_complete_tracker(idx, SCT_GENERIC, sc::ABORTED_SQ_DELETION, false, false);
        }
    }

    fn drain_pending_admin(&mut self) {
        let pid = std::process::id();
        match self.shared.processes().drain(pid) {
            Some(reqs) => {
                for mut req in reqs {
                    let cpl = req.saved_cpl;
                    req.invoke_callback(&cpl);
                }
            }
            None => {
                log::error!("process {pid} is not registered with this controller");
                debug_assert!(false, "current process not registered");
            }
        }
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        if let Some(buf) = self.sq_buf.take() {
            self.mem.dma_free(buf);
        }
        if let Some(buf) = self.cq_buf.take() {
            self.mem.dma_free(buf);
        }
        // The tracker pool returns its allocation on drop.
    }
}
