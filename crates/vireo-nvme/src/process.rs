//! Per-process delivery of admin completions.
//!
//! A controller may be shared by several processes, but a completion must
//! run its callback in the process that issued the request. Completions for
//! a foreign pid are parked on that process's pending list together with the
//! saved completion entry; each process drains its own list after an admin
//! completion pass.

use crate::request::Request;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
pub(crate) struct ProcessRegistry {
    pending: Mutex<HashMap<u32, VecDeque<Box<Request>>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pid: u32) {
        self.pending.lock().unwrap().entry(pid).or_default();
    }

    /// Remove a process; any completions still parked for it are returned
    /// so the caller can dispose of them.
    pub fn unregister(&self, pid: u32) -> Vec<Box<Request>> {
        self.pending
            .lock()
            .unwrap()
            .remove(&pid)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn is_registered(&self, pid: u32) -> bool {
        self.pending.lock().unwrap().contains_key(&pid)
    }

    pub fn pending_count(&self, pid: u32) -> usize {
        self.pending
            .lock()
            .unwrap()
            .get(&pid)
            .map_or(0, VecDeque::len)
    }

    /// Park a completed request on its originating process's list. Gives the
    /// request back when that process is not registered.
    pub fn park(&self, req: Box<Request>) -> Result<(), Box<Request>> {
        let mut pending = self.pending.lock().unwrap();
        match pending.get_mut(&req.pid) {
            Some(fifo) => {
                fifo.push_back(req);
                Ok(())
            }
            None => Err(req),
        }
    }

    /// Take everything parked for `pid`, or `None` when the pid is unknown.
    /// Callbacks run on the caller's side, outside the registry lock.
    pub fn drain(&self, pid: u32) -> Option<Vec<Box<Request>>> {
        let mut pending = self.pending.lock().unwrap();
        let fifo = pending.get_mut(&pid)?;
        Some(std::mem::take(fifo).into())
    }
}
