use thiserror::Error;
use vireo_hal::HalError;

pub type Result<T> = std::result::Result<T, NvmeError>;

#[derive(Debug, Error)]
pub enum NvmeError {
    #[error("out of DMA-safe memory")]
    OutOfMemory,

    /// The payload could not be translated into PRP or SGL descriptors. The
    /// request has already been completed with `GENERIC/INVALID_FIELD` and
    /// DNR set.
    #[error("payload could not be mapped for transfer")]
    PayloadMapping,

    #[error("command failed with status sct={sct:#x} sc={sc:#x}")]
    CommandFailed { sct: u8, sc: u8 },

    #[error(transparent)]
    Hal(#[from] HalError),
}
