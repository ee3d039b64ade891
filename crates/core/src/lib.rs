//! Batched autoregressive decoding core.
//!
//! Three subsystems compose the crate: the paged KV cache
//! ([`kv_cache::KVCacheManager`] over [`kv_cache::BlockManager`]), the
//! dynamic decode pipeline ([`decode::DynamicDecodePipeline`] and its
//! layers), and the batch-level [`decoder::Decoder`] façade. The neural
//! forward pass, scheduling, and tokenization are external collaborators.

pub mod config;
pub mod decode;
pub mod decoder;
pub mod error;
pub mod kv_cache;

pub use config::{DecoderDomain, DecodingMode, EarlyStopping, KvCacheConfig, SamplingConfig};
pub use decode::{DecodingInput, DecodingOutput, FinishedState, SlotState};
pub use decoder::Decoder;
pub use error::{DecodeError, Result};
pub use kv_cache::{KVCacheManager, KvCacheStats, TokenId};
