//! NVMe wire formats: submission entries, completion entries, status codes,
//! and SGL descriptors.
//!
//! Everything here is little-endian as it appears in queue memory. The
//! in-memory structs are `repr(C)` with the exact on-wire layout, so a
//! submission entry can be copied into a ring slot verbatim.

/// Admin command set opcodes used by the transport.
pub mod admin_opc {
    pub const DELETE_IO_SQ: u8 = 0x00;
    pub const CREATE_IO_SQ: u8 = 0x01;
    pub const DELETE_IO_CQ: u8 = 0x04;
    pub const CREATE_IO_CQ: u8 = 0x05;
    pub const IDENTIFY: u8 = 0x06;
    pub const ASYNC_EVENT_REQUEST: u8 = 0x0c;
}

/// NVM command set opcodes.
pub mod nvm_opc {
    pub const FLUSH: u8 = 0x00;
    pub const WRITE: u8 = 0x01;
    pub const READ: u8 = 0x02;
}

/// Generic command status codes (SCT = 0).
pub mod sc {
    pub const SUCCESS: u8 = 0x00;
    pub const INVALID_OPCODE: u8 = 0x01;
    pub const INVALID_FIELD: u8 = 0x02;
    pub const ABORTED_BY_REQUEST: u8 = 0x07;
    pub const ABORTED_SQ_DELETION: u8 = 0x08;
    pub const NAMESPACE_NOT_READY: u8 = 0x82;
}

pub const SCT_GENERIC: u8 = 0x0;

/// PSDT field values (submission entry byte 1, bits 6..7).
pub const PSDT_PRP: u8 = 0x0;
pub const PSDT_SGL_MPTR_SGL: u8 = 0x2;

pub const SQ_ENTRY_SIZE: usize = 64;
pub const CQ_ENTRY_SIZE: usize = 16;
pub const SGL_DESCRIPTOR_SIZE: usize = 16;

/// A 64-byte submission queue entry.
///
/// `prp1`/`prp2` are the raw data-pointer words; when the entry carries an
/// SGL instead of PRPs the same 16 bytes hold a single descriptor, accessed
/// through [`Command::set_sgl1`]/[`Command::sgl1`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C, align(64))]
pub struct Command {
    pub opc: u8,
    /// FUSE in bits 0..1, PSDT in bits 6..7.
    pub flags: u8,
    pub cid: u16,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub mptr: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

const _: () = assert!(core::mem::size_of::<Command>() == SQ_ENTRY_SIZE);

impl Command {
    pub fn psdt(&self) -> u8 {
        self.flags >> 6
    }

    pub fn set_psdt(&mut self, psdt: u8) {
        self.flags = (self.flags & 0x3f) | (psdt << 6);
    }

    /// Store an SGL descriptor in the data pointer (SGL1).
    pub fn set_sgl1(&mut self, desc: SglDescriptor) {
        let (w0, w1) = desc.to_words();
        self.prp1 = w0;
        self.prp2 = w1;
    }

    pub fn sgl1(&self) -> SglDescriptor {
        SglDescriptor::from_words(self.prp1, self.prp2)
    }
}

/// Status field of a completion entry, without the phase bit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Status {
    pub sct: u8,
    pub sc: u8,
    pub dnr: bool,
}

impl Status {
    pub const SUCCESS: Status = Status {
        sct: SCT_GENERIC,
        sc: sc::SUCCESS,
        dnr: false,
    };

    pub fn new(sct: u8, sc: u8, dnr: bool) -> Self {
        Self { sct, sc, dnr }
    }

    /// Encode into the completion status halfword, leaving phase (bit 0) clear.
    pub fn encode_without_phase(self) -> u16 {
        let mut val = 0u16;
        val |= (self.sc as u16) << 1;
        val |= ((self.sct & 0x7) as u16) << 9;
        if self.dnr {
            val |= 1 << 15;
        }
        val
    }

    pub fn decode(raw: u16) -> Self {
        Self {
            sc: (raw >> 1) as u8,
            sct: ((raw >> 9) & 0x7) as u8,
            dnr: raw & (1 << 15) != 0,
        }
    }
}

/// A 16-byte completion queue entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Completion {
    pub cdw0: u32,
    pub cdw1: u32,
    pub sqhd: u16,
    pub sqid: u16,
    pub cid: u16,
    /// Phase in bit 0, status field in bits 1..15.
    pub status: u16,
}

const _: () = assert!(core::mem::size_of::<Completion>() == CQ_ENTRY_SIZE);

impl Completion {
    pub fn phase(&self) -> u8 {
        (self.status & 1) as u8
    }

    pub fn set_phase(&mut self, phase: u8) {
        self.status = (self.status & !1) | (phase as u16 & 1);
    }

    pub fn parsed_status(&self) -> Status {
        Status::decode(self.status)
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status.encode_without_phase() | (self.status & 1);
    }

    pub fn is_error(&self) -> bool {
        let st = self.parsed_status();
        st.sct != SCT_GENERIC || st.sc != sc::SUCCESS
    }

    /// Whether the device asked for this command to be retried.
    pub fn requests_retry(&self) -> bool {
        let st = self.parsed_status();
        !st.dnr
            && st.sct == SCT_GENERIC
            && matches!(st.sc, sc::ABORTED_BY_REQUEST | sc::NAMESPACE_NOT_READY)
    }
}

/// SGL descriptor types used by the transport (generic subtype only).
pub const SGL_TYPE_DATA_BLOCK: u8 = 0x0;
pub const SGL_TYPE_LAST_SEGMENT: u8 = 0x3;

/// A 16-byte unkeyed SGL descriptor.
///
/// `type_byte` is the descriptor's last byte: type in the high nibble,
/// subtype in the low nibble.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SglDescriptor {
    pub address: u64,
    pub length: u32,
    pub type_byte: u8,
}

impl SglDescriptor {
    pub fn data_block(address: u64, length: u32) -> Self {
        Self {
            address,
            length,
            type_byte: SGL_TYPE_DATA_BLOCK << 4,
        }
    }

    pub fn last_segment(address: u64, length: u32) -> Self {
        Self {
            address,
            length,
            type_byte: SGL_TYPE_LAST_SEGMENT << 4,
        }
    }

    pub fn descriptor_type(&self) -> u8 {
        self.type_byte >> 4
    }

    /// Pack into the two little-endian words of descriptor memory.
    pub fn to_words(self) -> (u64, u64) {
        (
            self.address,
            (self.length as u64) | ((self.type_byte as u64) << 56),
        )
    }

    pub fn from_words(w0: u64, w1: u64) -> Self {
        Self {
            address: w0,
            length: w1 as u32,
            type_byte: (w1 >> 56) as u8,
        }
    }
}
