//! User-space NVMe-over-PCIe transport.
//!
//! This crate drives NVMe commands directly against a PCIe SSD without
//! kernel mediation: the only external inputs are the platform seams from
//! `vireo-hal` (DMA-safe memory and PCI function access). Supported:
//!
//! - Controller bring-up: BAR0 mapping, doorbell stride discovery,
//!   AQA/ASQ/ACQ programming, optional Controller Memory Buffer placement
//!   of submission queues
//! - Queue pairs: hardware-owned submission/completion rings, phase-bit
//!   completion protocol, doorbell publication, tracker-pooled command
//!   identifiers
//! - Payload translation: PRP lists for contiguous and gather payloads,
//!   hardware SGLs (single segment) when the device supports them
//! - I/O queue lifecycle via `CREATE_IO_{CQ,SQ}` / `DELETE_IO_{SQ,CQ}`
//! - Per-process routing of admin completions on shared controllers
//!
//! Completion processing is polled; there is no interrupt plumbing. A queue
//! pair must be externally serialised, but distinct queue pairs may run on
//! distinct threads.

mod cmb;
mod ctrlr;
mod error;
mod payload;
mod process;
mod protocol;
mod qpair;
mod regs;
mod request;
mod tracker;

#[cfg(test)]
mod test_support;

pub use ctrlr::{
    Controller, ControllerFlags, ControllerOptions, ADMIN_QUEUE_ENTRIES, ADMIN_QUEUE_TRACKERS,
    IO_QUEUE_ENTRIES, IO_QUEUE_TRACKERS,
};
pub use error::{NvmeError, Result};
pub use protocol::{
    admin_opc, nvm_opc, sc, Command, Completion, SglDescriptor, Status, CQ_ENTRY_SIZE,
    PSDT_PRP, PSDT_SGL_MPTR_SGL, SCT_GENERIC, SGL_DESCRIPTOR_SIZE, SGL_TYPE_DATA_BLOCK,
    SGL_TYPE_LAST_SEGMENT, SQ_ENTRY_SIZE,
};
pub use qpair::{QueuePair, QueuePriority};
pub use regs::{
    aqa_value, Cap, Cmbloc, Cmbsz, Doorbell, RegisterWindow, CC_EN, CSTS_CFS, CSTS_RDY,
    DOORBELL_BASE, REG_ACQ, REG_AQA, REG_ASQ, REG_CAP, REG_CC, REG_CMBLOC, REG_CMBSZ, REG_CSTS,
    REG_INTMC, REG_INTMS, REG_VS,
};
pub use request::{CompletionCallback, GatherList, Payload, Request};
pub use tracker::{Tracker, MAX_PRP_LIST_ENTRIES, MAX_SGL_DESCRIPTORS, TRACKER_SIZE};
