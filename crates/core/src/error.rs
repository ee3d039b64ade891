use thiserror::Error;

/// Errors surfaced to the embedding caller.
///
/// Invariant violations (refcount underflow, popping an empty free queue)
/// are programming errors and panic instead of returning a variant.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of cache blocks: requested {requested}, available {available}")]
    OutOfCache { requested: usize, available: usize },

    #[error("batch slot {slot} exceeds max batch size {max}")]
    MaxBatchExceeded { slot: usize, max: usize },

    #[error("unsupported logits dtype {0}, expected F32 or F16")]
    UnsupportedDtype(&'static str),

    #[error("kernel error: {0}")]
    Kernel(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DecodeError>;
