use thiserror::Error;

pub type RingResult<T, E = RingError> = Result<T, E>;

/// Errors surfaced while allocating or interpreting a shared page.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("failed to allocate shared page of {size} bytes aligned to {alignment}")]
    AllocationFailed { size: usize, alignment: usize },

    #[error("page of {len} bytes cannot hold a ring descriptor of {required} bytes")]
    PageTooSmall { len: usize, required: usize },

    #[error("page address {addr:#x} is not aligned to {alignment}")]
    Misaligned { addr: usize, alignment: usize },

    #[error("ring sentinel mismatch: expected {expected:#010x}, found {found:#010x}")]
    SentinelMismatch { expected: u32, found: u32 },
}
