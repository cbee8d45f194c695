//! Command requests as submitted by callers.
//!
//! A request owns a 64-byte command template, a payload descriptor, and the
//! completion callback. The transport fills in the command identifier and
//! the data pointer at submission time.

use crate::protocol::{Command, Completion};
use std::fmt;
use std::ptr::NonNull;

pub type CompletionCallback = Box<dyn FnMut(&Completion) + Send>;

/// A caller-supplied gather list.
///
/// `reset(offset)` rewinds the cursor to `offset` bytes into the payload;
/// `next` yields the following (address, length) segment, or `None` when the
/// walk cannot continue. Segments must stay pinned while the request is in
/// flight.
pub trait GatherList: Send {
    fn reset(&mut self, offset: usize);
    fn next(&mut self) -> Option<(NonNull<u8>, usize)>;
}

/// Payload carried by a request.
pub enum Payload {
    /// No data transfer; the data pointer stays zeroed.
    None,
    /// Virtually contiguous buffer, with optional metadata.
    Contig {
        buf: NonNull<u8>,
        md: Option<NonNull<u8>>,
    },
    /// Scattered buffer walked through a [`GatherList`].
    Gather(Box<dyn GatherList>),
}

// Payload addresses point at caller-pinned DMA buffers that are valid from
// any thread in this address space.
unsafe impl Send for Payload {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PayloadKind {
    None,
    Contig,
    Gather,
}

impl Payload {
    pub(crate) fn kind(&self) -> PayloadKind {
        match self {
            Payload::None => PayloadKind::None,
            Payload::Contig { .. } => PayloadKind::Contig,
            Payload::Gather(_) => PayloadKind::Gather,
        }
    }
}

pub struct Request {
    pub cmd: Command,
    pub payload: Payload,
    pub payload_size: usize,
    pub payload_offset: usize,
    pub md_offset: usize,
    pub retries: u32,
    /// Process that originated the request; admin completions are delivered
    /// on this process.
    pub pid: u32,
    cb: Option<CompletionCallback>,
    /// Completion storage used when the request is parked on another
    /// process's pending list.
    pub(crate) saved_cpl: Completion,
}

impl Request {
    fn new(payload: Payload, payload_size: usize, cb: Option<CompletionCallback>) -> Box<Request> {
        Box::new(Request {
            cmd: Command::default(),
            payload,
            payload_size,
            payload_offset: 0,
            md_offset: 0,
            retries: 0,
            pid: std::process::id(),
            cb,
            saved_cpl: Completion::default(),
        })
    }

    /// A request with no data transfer.
    pub fn new_null(cb: impl FnMut(&Completion) + Send + 'static) -> Box<Request> {
        Self::new(Payload::None, 0, Some(Box::new(cb)))
    }

    /// A request over a virtually contiguous payload of `payload_size` bytes.
    pub fn new_contig(
        buf: NonNull<u8>,
        payload_size: usize,
        cb: impl FnMut(&Completion) + Send + 'static,
    ) -> Box<Request> {
        Self::new(
            Payload::Contig { buf, md: None },
            payload_size,
            Some(Box::new(cb)),
        )
    }

    /// A request over a scattered payload of `payload_size` bytes.
    pub fn new_gather(
        list: Box<dyn GatherList>,
        payload_size: usize,
        cb: impl FnMut(&Completion) + Send + 'static,
    ) -> Box<Request> {
        Self::new(Payload::Gather(list), payload_size, Some(Box::new(cb)))
    }

    /// Attach a metadata buffer to a contiguous payload.
    pub fn set_metadata(&mut self, md: NonNull<u8>, md_offset: usize) {
        if let Payload::Contig { md: slot, .. } = &mut self.payload {
            *slot = Some(md);
            self.md_offset = md_offset;
        }
    }

    pub(crate) fn invoke_callback(&mut self, cpl: &Completion) {
        if let Some(cb) = self.cb.as_mut() {
            cb(cpl);
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("opc", &self.cmd.opc)
            .field("cid", &self.cmd.cid)
            .field("nsid", &self.cmd.nsid)
            .field("payload_size", &self.payload_size)
            .field("payload_offset", &self.payload_offset)
            .field("retries", &self.retries)
            .field("pid", &self.pid)
            .finish()
    }
}
