use serde::{Deserialize, Serialize};

/// Immutable sizing information shared by every decoder layer.
///
/// Constructed once per decoder; all per-slot buffers are sized from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderDomain {
    /// Maximum number of concurrently tracked batch slots.
    pub max_batch_size: usize,
    /// Maximum beam width any slot may request.
    pub max_beam_width: usize,
    /// Logical vocabulary size.
    pub vocab_size: usize,
    /// Vocabulary size padded to the model's logits row stride.
    pub vocab_size_padded: usize,
    /// Maximum tokens decoded per slot per step (1 unless speculative).
    pub max_decoding_tokens: usize,
}

impl DecoderDomain {
    pub fn new(max_batch_size: usize, max_beam_width: usize, vocab_size: usize) -> Self {
        Self {
            max_batch_size,
            max_beam_width,
            vocab_size,
            vocab_size_padded: vocab_size,
            max_decoding_tokens: 1,
        }
    }

    pub fn with_vocab_padded(mut self, vocab_size_padded: usize) -> Self {
        assert!(vocab_size_padded >= self.vocab_size);
        self.vocab_size_padded = vocab_size_padded;
        self
    }

    pub fn with_max_decoding_tokens(mut self, max_decoding_tokens: usize) -> Self {
        self.max_decoding_tokens = max_decoding_tokens;
        self
    }
}

/// Which decoding pipeline to assemble.
///
/// `Auto` resolves on first `setup`: beam width 1 becomes `TopKTopP`,
/// anything wider becomes `BeamSearch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecodingMode {
    Auto,
    TopK,
    TopP,
    TopKTopP,
    MinP,
    BeamSearch,
    Medusa,
    Eagle,
    ExplicitDraftTokens,
}

impl DecodingMode {
    pub fn is_beam_search(self) -> bool {
        matches!(self, Self::BeamSearch)
    }

    pub fn uses_draft_tree(self) -> bool {
        matches!(self, Self::Medusa | Self::Eagle | Self::ExplicitDraftTokens)
    }

    /// Resolve `Auto` against the beam width seen at setup.
    pub fn resolve(self, beam_width: usize) -> Self {
        match self {
            Self::Auto if beam_width > 1 => Self::BeamSearch,
            Self::Auto => Self::TopKTopP,
            other => other,
        }
    }
}

/// When a beam-search slot may stop expanding hypotheses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EarlyStopping {
    /// Run until max length regardless of finished hypotheses.
    Never,
    /// Stop once the candidate array holds `beam_width` finished hypotheses
    /// and no live beam can beat the worst of them.
    Once,
    /// Stop as soon as the candidate array holds `beam_width` hypotheses.
    Always,
}

/// Paged KV cache sizing and feature switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvCacheConfig {
    pub blocks_in_primary_pool: usize,
    pub blocks_in_secondary_pool: usize,
    pub tokens_per_block: usize,
    /// Reuse full prompt blocks across requests via the prefix tree.
    pub enable_block_reuse: bool,
    /// Allocate pools in unified memory (advisory; pools are host tensors here).
    pub use_uvm: bool,
    /// Copy secondary blocks back to the primary pool before reuse.
    pub onboard_blocks: bool,
}

impl Default for KvCacheConfig {
    fn default() -> Self {
        Self {
            blocks_in_primary_pool: 512,
            blocks_in_secondary_pool: 0,
            tokens_per_block: 64,
            enable_block_reuse: false,
            use_uvm: false,
            onboard_blocks: true,
        }
    }
}

/// Per-slot sampling parameters installed at `setup`.
///
/// Every field is a column: entry `i` configures the slot `batch_slots[i]`
/// named in the same `setup` call. A `None` column leaves the slot at its
/// default. Columns shorter than the batch are broadcast from entry 0,
/// matching the way single-value configs are applied batch-wide.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub beam_width: usize,
    pub random_seed: Option<Vec<u64>>,
    pub temperature: Option<Vec<f32>>,
    pub repetition_penalty: Option<Vec<f32>>,
    pub presence_penalty: Option<Vec<f32>>,
    pub frequency_penalty: Option<Vec<f32>>,
    pub min_length: Option<Vec<usize>>,
    pub top_k: Option<Vec<usize>>,
    pub top_p: Option<Vec<f32>>,
    pub top_p_decay: Option<Vec<f32>>,
    pub top_p_min: Option<Vec<f32>>,
    pub top_p_reset_ids: Option<Vec<u32>>,
    pub min_p: Option<Vec<f32>>,
    pub beam_search_diversity_rate: Option<Vec<f32>>,
    pub length_penalty: Option<Vec<f32>>,
    pub early_stopping: Option<Vec<EarlyStopping>>,
    pub normalize_log_probs: bool,
}

impl SamplingConfig {
    pub fn greedy() -> Self {
        Self {
            beam_width: 1,
            top_k: Some(vec![1]),
            ..Default::default()
        }
    }

    pub fn beam_search(beam_width: usize) -> Self {
        Self {
            beam_width,
            ..Default::default()
        }
    }
}

/// Column access with broadcast-from-first semantics.
pub(crate) fn column<T: Copy>(col: &Option<Vec<T>>, i: usize, default: T) -> T {
    match col {
        Some(v) if v.len() > i => v[i],
        Some(v) if !v.is_empty() => v[0],
        _ => default,
    }
}

pub mod defaults {
    use super::EarlyStopping;

    pub const TEMPERATURE: f32 = 1.0;
    pub const REPETITION_PENALTY: f32 = 1.0;
    pub const PRESENCE_PENALTY: f32 = 0.0;
    pub const FREQUENCY_PENALTY: f32 = 0.0;
    pub const MIN_LENGTH: usize = 0;
    pub const TOP_K: usize = 0;
    pub const TOP_P: f32 = 1.0;
    pub const TOP_P_DECAY: f32 = 1.0;
    pub const TOP_P_MIN: f32 = 1e-6;
    pub const TOP_P_RESET_ID: u32 = u32::MAX;
    pub const MIN_P: f32 = 0.0;
    pub const DIVERSITY_RATE: f32 = 0.0;
    pub const LENGTH_PENALTY: f32 = 0.0;
    pub const EARLY_STOPPING: EarlyStopping = EarlyStopping::Once;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_resolves_by_beam_width() {
        assert_eq!(DecodingMode::Auto.resolve(1), DecodingMode::TopKTopP);
        assert_eq!(DecodingMode::Auto.resolve(4), DecodingMode::BeamSearch);
        assert_eq!(DecodingMode::TopP.resolve(4), DecodingMode::TopP);
    }

    #[test]
    fn column_broadcasts_first_entry() {
        let col = Some(vec![0.5f32]);
        assert_eq!(column(&col, 0, 1.0), 0.5);
        assert_eq!(column(&col, 3, 1.0), 0.5);
        assert_eq!(column(&None, 3, 1.0), 1.0);
    }

    #[test]
    fn column_indexes_full_vectors() {
        let col = Some(vec![1, 2, 3]);
        assert_eq!(column(&col, 2, 0), 3);
    }

    #[test]
    fn domain_padding_defaults_to_vocab() {
        let domain = DecoderDomain::new(8, 1, 100);
        assert_eq!(domain.vocab_size_padded, 100);
        let padded = domain.with_vocab_padded(128);
        assert_eq!(padded.vocab_size_padded, 128);
    }
}
