//! Controller bring-up and the admin-command plumbing built on top of it.
//!
//! Bring-up maps BAR0, discovers the doorbell stride and (best-effort) the
//! controller memory buffer, enables bus mastering, and arms the admin
//! queue pair. I/O queue pairs are then created and deleted through admin
//! commands, polled synchronously on the admin queue.

use crate::cmb::CmbRegion;
use crate::error::{NvmeError, Result};
use crate::process::ProcessRegistry;
use crate::protocol::{admin_opc, Command, Completion};
use crate::qpair::{CmbSqPlacement, QueuePair, QueuePriority};
use crate::regs::{
    aqa_value, Cap, RegisterWindow, CC_EN, CC_IOCQES_SHIFT, CC_IOSQES_SHIFT, REG_ACQ, REG_AQA,
    REG_ASQ, REG_CAP, REG_CC,
};
use crate::request::Request;
use crate::tracker::MAX_PRP_LIST_ENTRIES;
use bitflags::bitflags;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use vireo_hal::{BarMapping, DmaMemory, PciFunction, PciId, PAGE_SIZE};

pub const ADMIN_QUEUE_ENTRIES: u16 = 128;
pub const ADMIN_QUEUE_TRACKERS: u16 = 16;

/// I/O ring depth; more entries than trackers only lengthens the visible
/// command history.
pub const IO_QUEUE_ENTRIES: u16 = 256;
pub const IO_QUEUE_TRACKERS: u16 = 128;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControllerFlags: u32 {
        /// The controller accepts hardware SGLs for data transfers.
        const SGL_SUPPORTED = 1 << 0;
    }
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Place submission queues in the controller memory buffer when the
    /// device offers one. Forced off when CMB discovery fails.
    pub use_cmb_sqs: bool,
    /// How many times a retry-eligible command is resubmitted.
    pub retry_count: u32,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            use_cmb_sqs: false,
            retry_count: 4,
        }
    }
}

/// Controller state shared with its queue pairs.
pub(crate) struct Shared {
    is_resetting: AtomicBool,
    flags: AtomicU32,
    retry_count: u32,
    processes: ProcessRegistry,
}

impl Shared {
    fn new(retry_count: u32) -> Self {
        Self {
            is_resetting: AtomicBool::new(false),
            flags: AtomicU32::new(0),
            retry_count,
            processes: ProcessRegistry::new(),
        }
    }

    pub fn is_resetting(&self) -> bool {
        self.is_resetting.load(Ordering::Acquire)
    }

    pub fn set_resetting(&self, resetting: bool) {
        self.is_resetting.store(resetting, Ordering::Release);
    }

    pub fn flags(&self) -> ControllerFlags {
        ControllerFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: ControllerFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    pub fn sgl_supported(&self) -> bool {
        self.flags().contains(ControllerFlags::SGL_SUPPORTED)
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn processes(&self) -> &ProcessRegistry {
        &self.processes
    }
}

/// Synchronous wait state for an admin command, shared into its callback.
struct CompletionWaiter(Arc<Mutex<Option<Completion>>>);

impl CompletionWaiter {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    fn callback(&self) -> impl FnMut(&Completion) + Send + 'static {
        let slot = Arc::clone(&self.0);
        move |cpl| {
            *slot.lock().unwrap() = Some(*cpl);
        }
    }

    fn take(&self) -> Option<Completion> {
        self.0.lock().unwrap().take()
    }
}

pub struct Controller {
    pci: Box<dyn PciFunction>,
    mem: Arc<dyn DmaMemory>,
    regs: RegisterWindow,
    bar0: Option<BarMapping>,
    cap: Cap,
    doorbell_stride_u32: u32,
    cmb: Option<CmbRegion>,
    admin: Option<Box<QueuePair>>,
    shared: Arc<Shared>,
    opts: ControllerOptions,
}

impl Controller {
    /// Bring the controller up far enough to issue admin commands: map
    /// BAR0, discover the CMB, enable bus mastering (and mask INTx),
    /// derive the doorbell stride from CAP, and construct the admin queue
    /// pair. The constructing process is registered for admin completion
    /// delivery.
    ///
    /// Queue pairs created from this controller must be torn down before
    /// the controller itself is dropped.
    pub fn construct(
        mut pci: Box<dyn PciFunction>,
        mem: Arc<dyn DmaMemory>,
        mut opts: ControllerOptions,
    ) -> Result<Controller> {
        let bar0 = pci.map_bar(0)?;
        let regs = RegisterWindow::new(&bar0);

        let cmb = CmbRegion::map(&regs, pci.as_mut(), &mut opts.use_cmb_sqs);

        // Bus-master enable + INTx disable; completions are polled.
        let cmd_reg = pci.cfg_read32(4);
        pci.cfg_write32(4, cmd_reg | 0x404);

        let cap = Cap(regs.read64(REG_CAP));
        // The stride is 2^(DSTRD + 2) bytes; keep it in 32-bit units.
        let doorbell_stride_u32 = 1u32 << cap.dstrd();

        let shared = Arc::new(Shared::new(opts.retry_count));

        let mut cmb = cmb;
        let cmb_sq = cmb_sq_placement(
            &mut cmb,
            opts.use_cmb_sqs,
            ADMIN_QUEUE_ENTRIES as u64 * std::mem::size_of::<Command>() as u64,
        );
        let admin = match QueuePair::construct(
            0,
            ADMIN_QUEUE_ENTRIES,
            ADMIN_QUEUE_TRACKERS,
            QueuePriority::Urgent,
            &regs,
            doorbell_stride_u32,
            cmb_sq,
            Arc::clone(&mem),
            Arc::clone(&shared),
        ) {
            Ok(qpair) => qpair,
            Err(err) => {
                if let Some(cmb) = cmb.take() {
                    cmb.unmap(pci.as_mut());
                }
                pci.unmap_bar(0, bar0);
                return Err(err);
            }
        };

        shared.processes().register(std::process::id());

        Ok(Controller {
            pci,
            mem,
            regs,
            bar0: Some(bar0),
            cap,
            doorbell_stride_u32,
            cmb,
            admin: Some(Box::new(admin)),
            shared,
            opts,
        })
    }

    /// Program the admin queue registers and set CC.EN. The upper layer
    /// polls CSTS.RDY through [`Controller::read_reg32`] before issuing
    /// commands.
    pub fn enable(&mut self) -> Result<()> {
        let (sq_bus, cq_bus, entries) = {
            let admin = self.admin_queue();
            (admin.sq_bus_addr(), admin.cq_bus_addr(), admin.num_entries())
        };

        self.regs.write64(REG_ASQ, sq_bus);
        self.regs.write64(REG_ACQ, cq_bus);
        self.regs.write32(REG_AQA, aqa_value(entries, entries));
        // Queue registers must be visible before the enable bit.
        std::sync::atomic::fence(Ordering::Release);

        let mut cc = self.regs.read32(REG_CC);
        cc |= (6 << CC_IOSQES_SHIFT) | (4 << CC_IOCQES_SHIFT) | CC_EN;
        self.regs.write32(REG_CC, cc);
        Ok(())
    }

    pub fn admin_queue(&self) -> &QueuePair {
        self.admin.as_ref().expect("admin queue alive")
    }

    pub fn admin_queue_mut(&mut self) -> &mut QueuePair {
        self.admin.as_mut().expect("admin queue alive")
    }

    /// Submit a request on the admin queue.
    pub fn submit_admin(&mut self, req: Box<Request>) -> Result<()> {
        self.admin_queue_mut().submit(req)
    }

    /// Poll the admin completion queue; see
    /// [`QueuePair::process_completions`].
    pub fn process_admin_completions(&mut self, max_completions: u32) -> u32 {
        self.admin_queue_mut().process_completions(max_completions)
    }

    /// Create an I/O queue pair: construct the rings, then issue
    /// `CREATE_IO_CQ` and `CREATE_IO_SQ`, compensating with `DELETE_IO_CQ`
    /// when the SQ creation fails.
    pub fn create_io_qpair(
        &mut self,
        qid: u16,
        qprio: QueuePriority,
    ) -> Result<Box<QueuePair>> {
        assert!(qid != 0, "queue id 0 is reserved for the admin pair");

        // Devices may cap queue depth below our default via CAP.MQES.
        let num_entries = (IO_QUEUE_ENTRIES as u32).min(self.cap.mqes() as u32 + 1) as u16;
        let num_trackers = (IO_QUEUE_TRACKERS as u32).min(num_entries as u32 - 1) as u16;

        let cmb_sq = cmb_sq_placement(
            &mut self.cmb,
            self.opts.use_cmb_sqs,
            num_entries as u64 * std::mem::size_of::<Command>() as u64,
        );

        let mut qpair = Box::new(QueuePair::construct(
            qid,
            num_entries,
            num_trackers,
            qprio,
            &self.regs,
            self.doorbell_stride_u32,
            cmb_sq,
            Arc::clone(&self.mem),
            Arc::clone(&self.shared),
        )?);

        self.setup_io_queues(&mut qpair)?;
        Ok(qpair)
    }

    /// Re-create the device-side queues of an existing pair after a
    /// controller reset.
    pub fn reinit_io_qpair(&mut self, qpair: &mut QueuePair) -> Result<()> {
        self.setup_io_queues(qpair)
    }

    /// Delete an I/O queue pair: submission queue first, then its
    /// completion queue, then the host-side resources.
    pub fn delete_io_qpair(&mut self, qpair: Box<QueuePair>) -> Result<()> {
        let waiter = CompletionWaiter::new();
        self.cmd_delete_io_sq(&qpair, waiter.callback())?;
        let cpl = self.poll_admin_until(&waiter);
        if cpl.is_error() {
            let st = cpl.parsed_status();
            return Err(NvmeError::CommandFailed {
                sct: st.sct,
                sc: st.sc,
            });
        }

        let waiter = CompletionWaiter::new();
        self.cmd_delete_io_cq(&qpair, waiter.callback())?;
        let cpl = self.poll_admin_until(&waiter);
        if cpl.is_error() {
            let st = cpl.parsed_status();
            return Err(NvmeError::CommandFailed {
                sct: st.sct,
                sc: st.sc,
            });
        }

        drop(qpair);
        Ok(())
    }

    fn setup_io_queues(&mut self, qpair: &mut QueuePair) -> Result<()> {
        let waiter = CompletionWaiter::new();
        self.cmd_create_io_cq(qpair, waiter.callback())?;
        let cpl = self.poll_admin_until(&waiter);
        if cpl.is_error() {
            let st = cpl.parsed_status();
            log::error!(
                "I/O completion queue {} creation failed: sct {:#x}, sc {:#x}",
                qpair.id(),
                st.sct,
                st.sc
            );
            return Err(NvmeError::CommandFailed {
                sct: st.sct,
                sc: st.sc,
            });
        }

        let waiter = CompletionWaiter::new();
        self.cmd_create_io_sq(qpair, waiter.callback())?;
        let cpl = self.poll_admin_until(&waiter);
        if cpl.is_error() {
            let st = cpl.parsed_status();
            log::error!(
                "I/O submission queue {} creation failed: sct {:#x}, sc {:#x}; deleting its completion queue",
                qpair.id(),
                st.sct,
                st.sc
            );
            let waiter = CompletionWaiter::new();
            if self.cmd_delete_io_cq(qpair, waiter.callback()).is_ok() {
                let _ = self.poll_admin_until(&waiter);
            }
            return Err(NvmeError::CommandFailed {
                sct: st.sct,
                sc: st.sc,
            });
        }

        qpair.reset();
        Ok(())
    }

    fn cmd_create_io_cq(
        &mut self,
        io_que: &QueuePair,
        cb: impl FnMut(&Completion) + Send + 'static,
    ) -> Result<()> {
        let mut req = Request::new_null(cb);
        req.cmd.opc = admin_opc::CREATE_IO_CQ;
        req.cmd.cdw10 = (((io_que.num_entries() - 1) as u32) << 16) | io_que.id() as u32;
        // Physically contiguous; completions are polled, so interrupts stay
        // disabled.
        req.cmd.cdw11 = 0x1;
        req.cmd.prp1 = io_que.cq_bus_addr();
        self.submit_admin(req)
    }

    fn cmd_create_io_sq(
        &mut self,
        io_que: &QueuePair,
        cb: impl FnMut(&Completion) + Send + 'static,
    ) -> Result<()> {
        let mut req = Request::new_null(cb);
        req.cmd.opc = admin_opc::CREATE_IO_SQ;
        req.cmd.cdw10 = (((io_que.num_entries() - 1) as u32) << 16) | io_que.id() as u32;
        // Bound to the CQ with the same id; physically contiguous.
        req.cmd.cdw11 =
            ((io_que.id() as u32) << 16) | ((io_que.priority() as u32) << 1) | 0x1;
        req.cmd.prp1 = io_que.sq_bus_addr();
        self.submit_admin(req)
    }

    fn cmd_delete_io_cq(
        &mut self,
        io_que: &QueuePair,
        cb: impl FnMut(&Completion) + Send + 'static,
    ) -> Result<()> {
        let mut req = Request::new_null(cb);
        req.cmd.opc = admin_opc::DELETE_IO_CQ;
        req.cmd.cdw10 = io_que.id() as u32;
        self.submit_admin(req)
    }

    fn cmd_delete_io_sq(
        &mut self,
        io_que: &QueuePair,
        cb: impl FnMut(&Completion) + Send + 'static,
    ) -> Result<()> {
        let mut req = Request::new_null(cb);
        req.cmd.opc = admin_opc::DELETE_IO_SQ;
        req.cmd.cdw10 = io_que.id() as u32;
        self.submit_admin(req)
    }

    /// Busy-poll the admin queue until the awaited completion lands. This
    /// is the only blocking construct in the transport and blocks only the
    /// calling thread.
    fn poll_admin_until(&mut self, waiter: &CompletionWaiter) -> Completion {
        loop {
            if let Some(cpl) = waiter.take() {
                return cpl;
            }
            self.process_admin_completions(0);
            std::hint::spin_loop();
        }
    }

    /// Flag a controller-level reset; disabled queue pairs defer
    /// submissions instead of re-enabling while this is set.
    pub fn set_resetting(&self, resetting: bool) {
        self.shared.set_resetting(resetting);
    }

    pub fn is_resetting(&self) -> bool {
        self.shared.is_resetting()
    }

    /// Record whether the device accepts hardware SGLs (learned from
    /// IDENTIFY by the upper layer).
    pub fn set_sgl_supported(&self, supported: bool) {
        let mut flags = self.shared.flags();
        flags.set(ControllerFlags::SGL_SUPPORTED, supported);
        self.shared.set_flags(flags);
    }

    pub fn sgl_supported(&self) -> bool {
        self.shared.sgl_supported()
    }

    /// Register a process for admin completion delivery.
    pub fn register_process(&self, pid: u32) {
        self.shared.processes().register(pid);
    }

    pub fn unregister_process(&self, pid: u32) {
        for req in self.shared.processes().unregister(pid) {
            log::warn!(
                "dropping admin completion parked for departing pid {}",
                req.pid
            );
        }
    }

    pub fn process_is_registered(&self, pid: u32) -> bool {
        self.shared.processes().is_registered(pid)
    }

    /// Admin completions parked for `pid` and not yet drained by it.
    pub fn pending_admin_completions(&self, pid: u32) -> usize {
        self.shared.processes().pending_count(pid)
    }

    /// Largest transfer one command can describe: one PRP in the command
    /// plus a full scratch list.
    pub fn max_transfer_size(&self) -> usize {
        MAX_PRP_LIST_ENTRIES * PAGE_SIZE
    }

    pub fn pci_id(&self) -> PciId {
        self.pci.id()
    }

    pub fn cap(&self) -> Cap {
        self.cap
    }

    pub fn doorbell_stride_u32(&self) -> u32 {
        self.doorbell_stride_u32
    }

    pub fn read_reg32(&self, offset: usize) -> u32 {
        self.regs.read32(offset)
    }

    pub fn read_reg64(&self, offset: usize) -> u64 {
        self.regs.read64(offset)
    }

    pub fn write_reg32(&self, offset: usize, value: u32) {
        self.regs.write32(offset, value)
    }

    pub fn write_reg64(&self, offset: usize, value: u64) {
        self.regs.write64(offset, value)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Some(mut admin) = self.admin.take() {
            // AERs never complete by themselves; finish them before the
            // rings go away.
            admin.abort_aers();
            drop(admin);
        }
        if let Some(cmb) = self.cmb.take() {
            cmb.unmap(self.pci.as_mut());
        }
        if let Some(bar0) = self.bar0.take() {
            self.pci.unmap_bar(0, bar0);
        }
    }
}

/// Try to carve an SQ out of the CMB; any failure falls back to host memory.
fn cmb_sq_placement(
    cmb: &mut Option<CmbRegion>,
    use_cmb_sqs: bool,
    sq_len: u64,
) -> Option<CmbSqPlacement> {
    if !use_cmb_sqs {
        return None;
    }
    let region = cmb.as_mut()?;
    let offset = region.alloc(sq_len, 4096)?;
    Some(CmbSqPlacement {
        virt: region.virt_at(offset),
        bus: region.bus_at(offset),
    })
}
