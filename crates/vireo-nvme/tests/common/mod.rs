//! Shared harness for the transport integration tests.
//!
//! `Machine` owns flat memories standing in for BAR0, host DMA space, and an
//! optional CMB BAR, plus a small polled NVMe device model that latches the
//! admin queue on CC.EN, services doorbells, walks PRP lists and SGLs, and
//! posts phase-tagged completions. The device runs on its own thread so the
//! transport's synchronous admin waits make progress, mirroring real
//! device-side concurrency.

#![allow(dead_code)]

use std::collections::HashMap;
use std::ptr::{read_volatile, write_volatile, NonNull};
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use vireo_hal::{BarMapping, DmaBuffer, DmaMemory, HalError, PciFunction, PciId};
use vireo_nvme::{admin_opc, nvm_opc, sc, Status};

pub const DMA_BUS_BASE: u64 = 0x4000_0000;
pub const CMB_BUS_BASE: u64 = 0x8000_0000;
pub const BAR0_BUS_BASE: u64 = 0xf000_0000;

pub const BAR0_LEN: usize = 0x4000;
pub const DMA_LEN: usize = 64 * 1024 * 1024;
pub const SECTOR_SIZE: usize = 512;
const PAGE_SIZE: usize = 4096;

const REG_CAP: usize = 0x0000;
const REG_VS: usize = 0x0008;
const REG_CC: usize = 0x0014;
const REG_CSTS: usize = 0x001c;
const REG_AQA: usize = 0x0024;
const REG_ASQ: usize = 0x0028;
const REG_ACQ: usize = 0x0030;
const REG_CMBLOC: usize = 0x0038;
const REG_CMBSZ: usize = 0x003c;
const DOORBELL_BASE: usize = 0x1000;

/// A pinned, page-aligned flat memory with volatile word access.
pub struct Memory {
    _backing: Box<[u8]>,
    base: *mut u8,
    len: usize,
}

unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

impl Memory {
    fn new(len: usize) -> Memory {
        let mut backing = vec![0u8; len + PAGE_SIZE].into_boxed_slice();
        let skew = backing.as_mut_ptr().align_offset(PAGE_SIZE);
        // SAFETY: skew < len + PAGE_SIZE.
        let base = unsafe { backing.as_mut_ptr().add(skew) };
        Memory {
            _backing: backing,
            base,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn ptr(&self, offset: usize) -> *mut u8 {
        assert!(offset < self.len);
        // SAFETY: in bounds.
        unsafe { self.base.add(offset) }
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.len && offset % 4 == 0);
        // SAFETY: in bounds and aligned.
        unsafe { read_volatile(self.ptr(offset) as *const u32) }
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.len && offset % 4 == 0);
        // SAFETY: as in `read_u32`.
        unsafe { write_volatile(self.ptr(offset) as *mut u32, value) }
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        assert!(offset + 8 <= self.len && offset % 8 == 0);
        // SAFETY: as in `read_u32`.
        unsafe { read_volatile(self.ptr(offset) as *const u64) }
    }

    pub fn write_u64(&self, offset: usize, value: u64) {
        assert!(offset + 8 <= self.len && offset % 8 == 0);
        // SAFETY: as in `read_u32`.
        unsafe { write_volatile(self.ptr(offset) as *mut u64, value) }
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        assert!(offset + 2 <= self.len && offset % 2 == 0);
        // SAFETY: as in `read_u32`.
        unsafe { read_volatile(self.ptr(offset) as *const u16) }
    }

    pub fn write_u16(&self, offset: usize, value: u16) {
        assert!(offset + 2 <= self.len && offset % 2 == 0);
        // SAFETY: as in `read_u32`.
        unsafe { write_volatile(self.ptr(offset) as *mut u16, value) }
    }

    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.len);
        // SAFETY: in bounds; cross-thread ordering is provided by fences at
        // the call sites.
        unsafe { std::ptr::copy_nonoverlapping(self.ptr(offset), out.as_mut_ptr(), out.len()) }
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len);
        // SAFETY: as in `read_bytes`.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr(offset), data.len()) }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CmbParams {
    pub szu: u32,
    pub sz: u64,
    pub ofst: u64,
    pub bir: u8,
    pub sqs: bool,
}

impl Default for CmbParams {
    fn default() -> Self {
        // 16 x 4 KiB units at offset 0 in BAR 2, SQ placement allowed.
        CmbParams {
            szu: 0,
            sz: 16,
            ofst: 0,
            bir: 2,
            sqs: true,
        }
    }
}

/// A scripted command failure, consumed once per matching opcode.
#[derive(Debug, Clone, Copy)]
pub struct ScriptedFailure {
    pub opc: u8,
    pub status: Status,
    pub times: u32,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// CAP.MQES, zero-based.
    pub mqes: u16,
    /// CAP.DSTRD exponent.
    pub dstrd: u32,
    pub cmb: Option<CmbParams>,
    pub disk_sectors: u64,
    /// Fail the next CREATE_IO_SQ admin commands with a non-retryable error.
    pub fail_create_sq: bool,
    /// Scripted failure for I/O commands (e.g. retry-eligible statuses).
    pub io_failure: Option<ScriptedFailure>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            mqes: 255,
            dstrd: 0,
            cmb: None,
            disk_sectors: 1024,
            fail_create_sq: false,
            io_failure: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DevSq {
    size: u16,
    base: u64,
    head: u16,
    cqid: u16,
}

#[derive(Debug, Clone, Copy)]
struct DevCq {
    size: u16,
    base: u64,
    tail: u16,
    phase: bool,
}

#[derive(Default)]
struct DeviceState {
    enabled: bool,
    admin_sq: Option<DevSq>,
    admin_cq: Option<DevCq>,
    io_sqs: HashMap<u16, DevSq>,
    io_cqs: HashMap<u16, DevCq>,
}

pub struct Machine {
    pub bar0: Memory,
    pub dma: Memory,
    pub cmb_mem: Option<Memory>,
    cfg_space: Mutex<[u32; 64]>,
    dma_next: Mutex<usize>,
    pub config: Mutex<DeviceConfig>,
    dev: Mutex<DeviceState>,
    /// Admin opcodes in the order the device executed them.
    pub admin_log: Mutex<Vec<u8>>,
    /// Every command the device executed, per queue, in execution order.
    pub cmd_log: Mutex<Vec<(u16, DevCommand)>>,
    pub disk: Mutex<Vec<u8>>,
}

impl Machine {
    pub fn new(config: DeviceConfig) -> Arc<Machine> {
        let bar0 = Memory::new(BAR0_LEN);

        // CAP: MQES | TO=1 | DSTRD; CSS/MPS are irrelevant to the model.
        let cap =
            config.mqes as u64 | (1u64 << 24) | ((config.dstrd as u64 & 0xf) << 32);
        bar0.write_u64(REG_CAP, cap);
        bar0.write_u32(REG_VS, 0x0001_0400);

        let cmb_mem = config.cmb.map(|cmb| {
            let unit = 1u64 << (12 + 4 * cmb.szu);
            bar0.write_u32(
                REG_CMBSZ,
                (cmb.sqs as u32) | ((cmb.szu & 0xf) << 8) | ((cmb.sz as u32) << 12),
            );
            bar0.write_u32(
                REG_CMBLOC,
                (cmb.bir as u32 & 0x7) | ((cmb.ofst as u32) << 12),
            );
            Memory::new(((cmb.ofst + cmb.sz) * unit) as usize)
        });

        let mut cfg_space = [0u32; 64];
        cfg_space[0] = 0x0001_1d1d; // device 0x0001, vendor 0x1d1d
        cfg_space[0x2c / 4] = 0x0002_1d1d; // subdevice 0x0002, subvendor 0x1d1d

        let disk = vec![0u8; config.disk_sectors as usize * SECTOR_SIZE];

        Arc::new(Machine {
            bar0,
            dma: Memory::new(DMA_LEN),
            cmb_mem,
            cfg_space: Mutex::new(cfg_space),
            dma_next: Mutex::new(0),
            config: Mutex::new(config),
            dev: Mutex::new(DeviceState::default()),
            admin_log: Mutex::new(Vec::new()),
            cmd_log: Mutex::new(Vec::new()),
            disk: Mutex::new(disk),
        })
    }

    /// Carve a payload buffer `page_offset` bytes past a page boundary from
    /// DMA space. Returns (virtual pointer, bus address).
    pub fn carve_payload(&self, len: usize, page_offset: usize) -> (NonNull<u8>, u64) {
        let mut next = self.dma_next.lock().unwrap();
        let off = ((*next + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)) + page_offset;
        assert!(off + len <= self.dma.len(), "harness DMA space exhausted");
        *next = off + len;
        (
            NonNull::new(self.dma.ptr(off)).unwrap(),
            DMA_BUS_BASE + off as u64,
        )
    }

    pub fn sq_doorbell(&self, qid: u16) -> u32 {
        let stride = 4usize << self.config.lock().unwrap().dstrd;
        self.bar0.read_u32(DOORBELL_BASE + 2 * qid as usize * stride)
    }

    pub fn cq_doorbell(&self, qid: u16) -> u32 {
        let stride = 4usize << self.config.lock().unwrap().dstrd;
        self.bar0
            .read_u32(DOORBELL_BASE + (2 * qid as usize + 1) * stride)
    }

    /// Resolve a device-visible bus range to host memory.
    fn bus_to_offset(&self, bus: u64, len: usize) -> Option<(&Memory, usize)> {
        let end = bus.checked_add(len as u64)?;
        if bus >= DMA_BUS_BASE && end <= DMA_BUS_BASE + self.dma.len() as u64 {
            return Some((&self.dma, (bus - DMA_BUS_BASE) as usize));
        }
        if let Some(cmb) = &self.cmb_mem {
            if bus >= CMB_BUS_BASE && end <= CMB_BUS_BASE + cmb.len() as u64 {
                return Some((cmb, (bus - CMB_BUS_BASE) as usize));
            }
        }
        None
    }

    fn dma_read(&self, bus: u64, out: &mut [u8]) -> bool {
        match self.bus_to_offset(bus, out.len()) {
            Some((mem, off)) => {
                mem.read_bytes(off, out);
                true
            }
            None => false,
        }
    }

    fn dma_write(&self, bus: u64, data: &[u8]) -> bool {
        match self.bus_to_offset(bus, data.len()) {
            Some((mem, off)) => {
                mem.write_bytes(off, data);
                true
            }
            None => false,
        }
    }

    fn dma_read_u64(&self, bus: u64) -> Option<u64> {
        let mut buf = [0u8; 8];
        self.dma_read(bus, &mut buf).then(|| u64::from_le_bytes(buf))
    }
}

/// Fields of a submission entry the device model cares about.
#[derive(Debug, Clone, Copy)]
pub struct DevCommand {
    pub opc: u8,
    pub psdt: u8,
    pub cid: u16,
    pub nsid: u32,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
}

impl DevCommand {
    fn parse(bytes: [u8; 64]) -> DevCommand {
        let dw0 = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        DevCommand {
            opc: (dw0 & 0xff) as u8,
            psdt: ((dw0 >> 14) & 0x3) as u8,
            cid: u16::from_le_bytes(bytes[2..4].try_into().unwrap()),
            nsid: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            prp1: u64::from_le_bytes(bytes[24..32].try_into().unwrap()),
            prp2: u64::from_le_bytes(bytes[32..40].try_into().unwrap()),
            cdw10: u32::from_le_bytes(bytes[40..44].try_into().unwrap()),
            cdw11: u32::from_le_bytes(bytes[44..48].try_into().unwrap()),
            cdw12: u32::from_le_bytes(bytes[48..52].try_into().unwrap()),
        }
    }
}

/// One scheduling pass of the device model.
fn device_pass(machine: &Machine) {
    let cc = machine.bar0.read_u32(REG_CC);
    // Pairs with the host's release fence before setting CC.EN.
    fence(Ordering::Acquire);
    {
        let mut dev = machine.dev.lock().unwrap();
        if cc & 1 != 0 && !dev.enabled {
            let aqa = machine.bar0.read_u32(REG_AQA);
            let asqs = (aqa & 0x0fff) as u16 + 1;
            let acqs = ((aqa >> 16) & 0x0fff) as u16 + 1;
            dev.admin_sq = Some(DevSq {
                size: asqs,
                base: machine.bar0.read_u64(REG_ASQ),
                head: 0,
                cqid: 0,
            });
            dev.admin_cq = Some(DevCq {
                size: acqs,
                base: machine.bar0.read_u64(REG_ACQ),
                tail: 0,
                phase: true,
            });
            dev.io_sqs.clear();
            dev.io_cqs.clear();
            dev.enabled = true;
            machine.bar0.write_u32(REG_CSTS, 1);
        } else if cc & 1 == 0 && dev.enabled {
            dev.enabled = false;
            dev.admin_sq = None;
            dev.admin_cq = None;
            dev.io_sqs.clear();
            dev.io_cqs.clear();
            // A controller reset clears the doorbell registers.
            for offset in (DOORBELL_BASE..machine.bar0.len()).step_by(4) {
                machine.bar0.write_u32(offset, 0);
            }
            machine.bar0.write_u32(REG_CSTS, 0);
        }
        if !dev.enabled {
            return;
        }
    }

    service_queue(machine, 0);
    let qids: Vec<u16> = machine.dev.lock().unwrap().io_sqs.keys().copied().collect();
    for qid in qids {
        service_queue(machine, qid);
    }
}

fn service_queue(machine: &Machine, qid: u16) {
    loop {
        let tail = machine.sq_doorbell(qid) as u16;
        // Pairs with the host's release fence before the doorbell store.
        fence(Ordering::Acquire);

        let (sq_base, sq_size, head, cqid) = {
            let dev = machine.dev.lock().unwrap();
            let sq = if qid == 0 {
                match dev.admin_sq {
                    Some(sq) => sq,
                    None => return,
                }
            } else {
                match dev.io_sqs.get(&qid) {
                    Some(sq) => *sq,
                    None => return,
                }
            };
            (sq.base, sq.size, sq.head, sq.cqid)
        };

        if head == tail {
            return;
        }

        let mut bytes = [0u8; 64];
        if !machine.dma_read(sq_base + head as u64 * 64, &mut bytes) {
            return;
        }
        let cmd = DevCommand::parse(bytes);
        machine.cmd_log.lock().unwrap().push((qid, cmd));

        let status = if qid == 0 {
            execute_admin(machine, cmd)
        } else {
            Some(execute_io(machine, cmd))
        };

        let new_head = (head + 1) % sq_size;
        {
            let mut dev = machine.dev.lock().unwrap();
            if qid == 0 {
                if let Some(sq) = dev.admin_sq.as_mut() {
                    sq.head = new_head;
                }
            } else if let Some(sq) = dev.io_sqs.get_mut(&qid) {
                sq.head = new_head;
            }
        }

        // Asynchronous Event Requests are held by the device indefinitely.
        if let Some(status) = status {
            if !post_completion(machine, qid, cqid, new_head, cmd.cid, status) {
                return; // CQ full; retried on a later pass
            }
        }
    }
}

fn execute_admin(machine: &Machine, cmd: DevCommand) -> Option<Status> {
    machine.admin_log.lock().unwrap().push(cmd.opc);

    let status = match cmd.opc {
        admin_opc::CREATE_IO_CQ => {
            let qid = (cmd.cdw10 & 0xffff) as u16;
            let size = ((cmd.cdw10 >> 16) & 0xffff) as u16 + 1;
            if qid == 0 || cmd.prp1 == 0 || cmd.prp1 % PAGE_SIZE as u64 != 0 {
                Status::new(0, sc::INVALID_FIELD, true)
            } else {
                machine.dev.lock().unwrap().io_cqs.insert(
                    qid,
                    DevCq {
                        size,
                        base: cmd.prp1,
                        tail: 0,
                        phase: true,
                    },
                );
                // Creating a queue resets its doorbell.
                let stride = 4usize << machine.config.lock().unwrap().dstrd;
                machine
                    .bar0
                    .write_u32(DOORBELL_BASE + (2 * qid as usize + 1) * stride, 0);
                Status::SUCCESS
            }
        }
        admin_opc::CREATE_IO_SQ => {
            if machine.config.lock().unwrap().fail_create_sq {
                Status::new(0, sc::INVALID_FIELD, true)
            } else {
                let qid = (cmd.cdw10 & 0xffff) as u16;
                let size = ((cmd.cdw10 >> 16) & 0xffff) as u16 + 1;
                let cqid = ((cmd.cdw11 >> 16) & 0xffff) as u16;
                let mut dev = machine.dev.lock().unwrap();
                if qid == 0 || !dev.io_cqs.contains_key(&cqid) {
                    Status::new(0, sc::INVALID_FIELD, true)
                } else {
                    dev.io_sqs.insert(
                        qid,
                        DevSq {
                            size,
                            base: cmd.prp1,
                            head: 0,
                            cqid,
                        },
                    );
                    drop(dev);
                    // Creating a queue resets its doorbell.
                    let stride = 4usize << machine.config.lock().unwrap().dstrd;
                    machine
                        .bar0
                        .write_u32(DOORBELL_BASE + 2 * qid as usize * stride, 0);
                    Status::SUCCESS
                }
            }
        }
        admin_opc::DELETE_IO_SQ => {
            let qid = (cmd.cdw10 & 0xffff) as u16;
            machine.dev.lock().unwrap().io_sqs.remove(&qid);
            Status::SUCCESS
        }
        admin_opc::DELETE_IO_CQ => {
            let qid = (cmd.cdw10 & 0xffff) as u16;
            machine.dev.lock().unwrap().io_cqs.remove(&qid);
            Status::SUCCESS
        }
        admin_opc::IDENTIFY => Status::SUCCESS,
        admin_opc::ASYNC_EVENT_REQUEST => return None,
        _ => Status::new(0, sc::INVALID_OPCODE, true),
    };
    Some(status)
}

fn execute_io(machine: &Machine, cmd: DevCommand) -> Status {
    // Scripted failures consume one "time" per I/O command.
    {
        let mut config = machine.config.lock().unwrap();
        if let Some(failure) = config.io_failure.as_mut() {
            if failure.opc == cmd.opc && failure.times > 0 {
                failure.times -= 1;
                return failure.status;
            }
        }
    }

    match cmd.opc {
        nvm_opc::FLUSH => Status::SUCCESS,
        nvm_opc::READ | nvm_opc::WRITE => {
            if cmd.nsid != 1 {
                return Status::new(0, 0x0b, true); // invalid namespace
            }
            let slba = ((cmd.cdw11 as u64) << 32) | cmd.cdw10 as u64;
            let nlb = (cmd.cdw12 & 0xffff) as usize;
            let len = (nlb + 1) * SECTOR_SIZE;

            let segs = match gather_segments(machine, &cmd, len) {
                Some(segs) => segs,
                None => return Status::new(0, sc::INVALID_FIELD, true),
            };

            let offset = slba as usize * SECTOR_SIZE;
            let mut disk = machine.disk.lock().unwrap();
            if offset + len > disk.len() {
                return Status::new(0, 0x80, true); // LBA out of range
            }

            let mut cursor = offset;
            for (bus, seg_len) in segs {
                if cmd.opc == nvm_opc::READ {
                    let ok = machine.dma_write(bus, &disk[cursor..cursor + seg_len]);
                    if !ok {
                        return Status::new(0, sc::INVALID_FIELD, true);
                    }
                } else {
                    let ok = machine.dma_read(bus, &mut disk[cursor..cursor + seg_len]);
                    if !ok {
                        return Status::new(0, sc::INVALID_FIELD, true);
                    }
                }
                cursor += seg_len;
            }
            Status::SUCCESS
        }
        _ => Status::new(0, sc::INVALID_OPCODE, true),
    }
}

/// Resolve a command's data pointer into (bus, len) segments, by PRP walk
/// or SGL walk depending on PSDT.
fn gather_segments(machine: &Machine, cmd: &DevCommand, len: usize) -> Option<Vec<(u64, usize)>> {
    if cmd.psdt == 0x2 {
        sgl_segments(machine, cmd.prp1, cmd.prp2, len)
    } else {
        prp_segments(machine, cmd.prp1, cmd.prp2, len)
    }
}

fn prp_segments(machine: &Machine, prp1: u64, prp2: u64, len: usize) -> Option<Vec<(u64, usize)>> {
    if len == 0 {
        return Some(Vec::new());
    }
    if prp1 == 0 {
        return None;
    }

    let page_mask = PAGE_SIZE as u64 - 1;
    let first_offset = (prp1 & page_mask) as usize;
    let first_len = (PAGE_SIZE - first_offset).min(len);

    let mut segs = vec![(prp1, first_len)];
    let mut remaining = len - first_len;
    if remaining == 0 {
        return Some(segs);
    }

    if prp2 == 0 || prp2 & page_mask != 0 {
        return None;
    }

    if remaining <= PAGE_SIZE {
        segs.push((prp2, remaining));
        return Some(segs);
    }

    // PRP list; the transport never chains lists.
    let mut entry = 0u64;
    while remaining > 0 {
        let page = machine.dma_read_u64(prp2 + entry * 8)?;
        if page == 0 || page & page_mask != 0 {
            return None;
        }
        let chunk = remaining.min(PAGE_SIZE);
        segs.push((page, chunk));
        remaining -= chunk;
        entry += 1;
    }
    Some(segs)
}

fn sgl_segments(machine: &Machine, w0: u64, w1: u64, len: usize) -> Option<Vec<(u64, usize)>> {
    let sgl_type = (w1 >> 60) as u8;
    let sgl_len = (w1 & 0xffff_ffff) as usize;
    let addr = w0;

    let descriptors: Vec<(u64, usize)> = match sgl_type {
        0x0 => vec![(addr, sgl_len)], // data block rides in SGL1
        0x3 => {
            // Last segment: read `sgl_len / 16` data block descriptors.
            if sgl_len % 16 != 0 {
                return None;
            }
            let mut descs = Vec::new();
            for i in 0..sgl_len / 16 {
                let d0 = machine.dma_read_u64(addr + i as u64 * 16)?;
                let d1 = machine.dma_read_u64(addr + i as u64 * 16 + 8)?;
                if (d1 >> 60) as u8 != 0x0 {
                    return None;
                }
                descs.push((d0, (d1 & 0xffff_ffff) as usize));
            }
            descs
        }
        _ => return None,
    };

    let total: usize = descriptors.iter().map(|(_, l)| l).sum();
    (total == len).then_some(descriptors)
}

/// Write a completion entry with the queue's current phase. Returns false
/// when the completion queue is full.
fn post_completion(
    machine: &Machine,
    sqid: u16,
    cqid: u16,
    sq_head: u16,
    cid: u16,
    status: Status,
) -> bool {
    let (base, size, tail, phase) = {
        let dev = machine.dev.lock().unwrap();
        let cq = if sqid == 0 {
            match dev.admin_cq {
                Some(cq) => cq,
                None => return false,
            }
        } else {
            match dev.io_cqs.get(&cqid) {
                Some(cq) => *cq,
                None => return false,
            }
        };
        (cq.base, cq.size, cq.tail, cq.phase)
    };

    let host_head = machine.cq_doorbell(if sqid == 0 { 0 } else { cqid }) as u16;
    let next_tail = (tail + 1) % size;
    if next_tail == host_head {
        return false;
    }

    let Some((mem, off)) = machine.bus_to_offset(base + tail as u64 * 16, 16) else {
        return false;
    };

    mem.write_u64(off, 0); // cdw0/cdw1
    fence(Ordering::Release);
    // sqhd/sqid/cid/status land in one aligned store so the host never
    // observes the phase bit without the matching cid.
    let status_with_phase = status.encode_without_phase() | phase as u16;
    let ident = (sq_head as u64)
        | ((sqid as u64) << 16)
        | ((cid as u64) << 32)
        | ((status_with_phase as u64) << 48);
    mem.write_u64(off + 8, ident);

    let mut dev = machine.dev.lock().unwrap();
    let cq = if sqid == 0 {
        dev.admin_cq.as_mut()
    } else {
        dev.io_cqs.get_mut(&cqid)
    };
    if let Some(cq) = cq {
        cq.tail = next_tail;
        if cq.tail == 0 {
            cq.phase = !cq.phase;
        }
    }
    true
}

// ---------------------------------------------------------------------------
// hal implementations over the machine
// ---------------------------------------------------------------------------

pub struct MockDmaMemory {
    machine: Arc<Machine>,
}

impl DmaMemory for MockDmaMemory {
    fn dma_zalloc(&self, len: usize, align: usize) -> Option<DmaBuffer> {
        assert!(align.is_power_of_two());
        let mut next = self.machine.dma_next.lock().unwrap();
        let off = (*next + align - 1) & !(align - 1);
        if off + len > self.machine.dma.len() {
            return None;
        }
        *next = off + len;
        Some(DmaBuffer::new(
            NonNull::new(self.machine.dma.ptr(off))?,
            DMA_BUS_BASE + off as u64,
            len,
        ))
    }

    fn dma_free(&self, _buf: DmaBuffer) {
        // Bump space; reclaimed when the machine goes away.
    }

    fn vtophys(&self, virt: *const u8) -> Result<u64, HalError> {
        let base = self.machine.dma.ptr(0) as usize;
        let addr = virt as usize;
        if addr < base || addr >= base + self.machine.dma.len() {
            return Err(HalError::NoTranslation { addr });
        }
        Ok(DMA_BUS_BASE + (addr - base) as u64)
    }
}

pub struct MockPci {
    machine: Arc<Machine>,
}

impl PciFunction for MockPci {
    fn map_bar(&mut self, bar: u8) -> Result<BarMapping, HalError> {
        match bar {
            0 => Ok(BarMapping::new(
                NonNull::new(self.machine.bar0.ptr(0)).unwrap(),
                BAR0_BUS_BASE,
                self.machine.bar0.len(),
            )),
            2 => {
                let cmb = self
                    .machine
                    .cmb_mem
                    .as_ref()
                    .ok_or(HalError::BarUnavailable { bar })?;
                Ok(BarMapping::new(
                    NonNull::new(cmb.ptr(0)).unwrap(),
                    CMB_BUS_BASE,
                    cmb.len(),
                ))
            }
            _ => Err(HalError::BarUnavailable { bar }),
        }
    }

    fn unmap_bar(&mut self, _bar: u8, _mapping: BarMapping) {}

    fn cfg_read32(&mut self, offset: u16) -> u32 {
        self.machine.cfg_space.lock().unwrap()[offset as usize / 4]
    }

    fn cfg_write32(&mut self, offset: u16, value: u32) {
        self.machine.cfg_space.lock().unwrap()[offset as usize / 4] = value;
    }

    fn id(&self) -> PciId {
        let cfg = self.machine.cfg_space.lock().unwrap();
        PciId {
            vendor_id: cfg[0] as u16,
            device_id: (cfg[0] >> 16) as u16,
            subvendor_id: cfg[0x2c / 4] as u16,
            subdevice_id: (cfg[0x2c / 4] >> 16) as u16,
        }
    }
}

// ---------------------------------------------------------------------------
// harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub machine: Arc<Machine>,
    stop: Arc<AtomicBool>,
    device_thread: Option<JoinHandle<()>>,
}

impl Harness {
    pub fn new(config: DeviceConfig) -> Harness {
        let machine = Machine::new(config);
        let stop = Arc::new(AtomicBool::new(false));

        let thread_machine = Arc::clone(&machine);
        let thread_stop = Arc::clone(&stop);
        let device_thread = std::thread::spawn(move || {
            while !thread_stop.load(Ordering::Acquire) {
                device_pass(&thread_machine);
                std::thread::yield_now();
            }
        });

        Harness {
            machine,
            stop,
            device_thread: Some(device_thread),
        }
    }

    pub fn dma_memory(&self) -> Arc<dyn DmaMemory> {
        Arc::new(MockDmaMemory {
            machine: Arc::clone(&self.machine),
        })
    }

    pub fn pci(&self) -> Box<dyn PciFunction> {
        Box::new(MockPci {
            machine: Arc::clone(&self.machine),
        })
    }

    pub fn controller(&self, opts: vireo_nvme::ControllerOptions) -> vireo_nvme::Controller {
        vireo_nvme::Controller::construct(self.pci(), self.dma_memory(), opts)
            .expect("controller bring-up")
    }

    /// Block until the device reports ready after CC.EN.
    pub fn wait_ready(&self) {
        while self.machine.bar0.read_u32(REG_CSTS) & 1 == 0 {
            std::thread::yield_now();
        }
    }

    pub fn admin_log(&self) -> Vec<u8> {
        self.machine.admin_log.lock().unwrap().clone()
    }

    pub fn cfg_read(&self, offset: u16) -> u32 {
        self.machine.cfg_space.lock().unwrap()[offset as usize / 4]
    }

    /// Wait until completion slots `first..first + count` of the queue whose
    /// CQ ring sits at `cq_bus` carry `phase`, so one host poll can consume
    /// them in a single pass.
    pub fn wait_cq_phase(&self, cq_bus: u64, first: u16, count: u16, phase: u8) {
        let off = (cq_bus - DMA_BUS_BASE) as usize;
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        for slot in first..first + count {
            loop {
                let status = self.machine.dma.read_u16(off + slot as usize * 16 + 14);
                if status & 1 == phase as u16 {
                    break;
                }
                assert!(
                    std::time::Instant::now() < deadline,
                    "device never produced completion in slot {slot}"
                );
                std::thread::yield_now();
            }
        }
    }

    pub fn disk_sector(&self, lba: u64) -> Vec<u8> {
        let disk = self.machine.disk.lock().unwrap();
        let off = lba as usize * SECTOR_SIZE;
        disk[off..off + SECTOR_SIZE].to_vec()
    }

    pub fn fill_disk_sector(&self, lba: u64, byte: u8) {
        let mut disk = self.machine.disk.lock().unwrap();
        let off = lba as usize * SECTOR_SIZE;
        disk[off..off + SECTOR_SIZE].fill(byte);
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.device_thread.take() {
            let _ = thread.join();
        }
    }
}

/// Bring a controller up and wait for the device to report ready.
pub fn ready_controller(
    harness: &Harness,
    opts: vireo_nvme::ControllerOptions,
) -> vireo_nvme::Controller {
    let mut ctrlr = harness.controller(opts);
    ctrlr.enable().expect("controller enable");
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while ctrlr.read_reg32(vireo_nvme::REG_CSTS) & vireo_nvme::CSTS_RDY == 0 {
        assert!(
            std::time::Instant::now() < deadline,
            "device never reported ready"
        );
        std::thread::yield_now();
    }
    ctrlr
}

/// Wait until the device has executed `want` commands on queue `qid`, then
/// return them.
pub fn wait_cmd_log(harness: &Harness, qid: u16, want: usize) -> Vec<DevCommand> {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let cmds: Vec<DevCommand> = harness
            .machine
            .cmd_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(q, _)| *q == qid)
            .map(|(_, cmd)| *cmd)
            .collect();
        if cmds.len() >= want {
            return cmds;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "device executed only {} of {want} commands on queue {qid}",
            cmds.len()
        );
        std::thread::yield_now();
    }
}

/// A caller gather list over fixed segments.
pub struct VecGather {
    segs: Vec<(NonNull<u8>, usize)>,
    cursor: usize,
}

unsafe impl Send for VecGather {}

impl VecGather {
    /// Carve segments of the given (length, page offset) layout from the
    /// machine's DMA space. Returns the list plus each segment's bus address.
    pub fn carve(machine: &Machine, layout: &[(usize, usize)]) -> (Box<VecGather>, Vec<u64>) {
        let mut segs = Vec::new();
        let mut buses = Vec::new();
        for &(len, page_off) in layout {
            let (ptr, bus) = machine.carve_payload(len, page_off);
            segs.push((ptr, len));
            buses.push(bus);
        }
        (Box::new(VecGather { segs, cursor: 0 }), buses)
    }

    pub fn fill(&mut self, byte: u8) {
        for &(ptr, len) in &self.segs {
            // SAFETY: segments were carved from live DMA space.
            unsafe { std::ptr::write_bytes(ptr.as_ptr(), byte, len) };
        }
    }
}

impl vireo_nvme::GatherList for VecGather {
    fn reset(&mut self, offset: usize) {
        assert_eq!(offset, 0, "tests submit at payload offset zero");
        self.cursor = 0;
    }

    fn next(&mut self) -> Option<(NonNull<u8>, usize)> {
        let seg = self.segs.get(self.cursor).copied();
        self.cursor += 1;
        seg
    }
}

/// Poll a queue pair until `want` completions have been consumed.
pub fn poll_completions(qpair: &mut vireo_nvme::QueuePair, want: u32) -> u32 {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    let mut total = 0;
    while total < want {
        total += qpair.process_completions(0);
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for {want} completions (got {total})"
        );
        std::thread::yield_now();
    }
    total
}

/// Build a READ or WRITE command template for `blocks` sectors at `lba`.
pub fn rw_command(opc: u8, lba: u64, blocks: u16) -> vireo_nvme::Command {
    let mut cmd = vireo_nvme::Command::default();
    cmd.opc = opc;
    cmd.nsid = 1;
    cmd.cdw10 = lba as u32;
    cmd.cdw11 = (lba >> 32) as u32;
    cmd.cdw12 = (blocks - 1) as u32;
    cmd
}
