//! Step inputs, caller-owned outputs, and beam bookkeeping state.

use candle_core::Tensor;

use crate::config::DecoderDomain;
use crate::kv_cache::TokenId;

/// Packed per-beam termination state.
///
/// Finished flags are sticky: once set, later steps skip the beam and leave
/// its outputs untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FinishedState(u8);

impl FinishedState {
    const EOS: u8 = 1 << 0;
    const STOP_WORDS: u8 = 1 << 1;
    const MAX_LENGTH: u8 = 1 << 2;
    const SKIP_DECODING: u8 = 1 << 3;

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn finished_eos() -> Self {
        Self(Self::EOS)
    }

    pub fn finished_stop_words() -> Self {
        Self(Self::STOP_WORDS)
    }

    pub fn finished_max_length() -> Self {
        Self(Self::MAX_LENGTH)
    }

    pub fn skip_decoding() -> Self {
        Self(Self::SKIP_DECODING)
    }

    pub fn is_finished(self) -> bool {
        self.0 & (Self::EOS | Self::STOP_WORDS | Self::MAX_LENGTH) != 0
    }

    pub fn is_finished_eos(self) -> bool {
        self.0 & Self::EOS != 0
    }

    pub fn is_finished_stop_words(self) -> bool {
        self.0 & Self::STOP_WORDS != 0
    }

    pub fn is_finished_max_length(self) -> bool {
        self.0 & Self::MAX_LENGTH != 0
    }

    pub fn is_skip_decoding(self) -> bool {
        self.0 & Self::SKIP_DECODING != 0
    }

    pub fn set_finished_eos(&mut self) {
        self.0 |= Self::EOS;
    }

    pub fn set_finished_stop_words(&mut self) {
        self.0 |= Self::STOP_WORDS;
    }

    pub fn set_finished_max_length(&mut self) {
        self.0 |= Self::MAX_LENGTH;
    }
}

/// Ragged per-slot word lists (bad words or stop words).
///
/// `lists[slot]` holds the token sequences configured for that slot.
#[derive(Debug, Clone, Default)]
pub struct WordLists {
    pub lists: Vec<Vec<Vec<TokenId>>>,
}

impl WordLists {
    pub fn for_slot(&self, slot: usize) -> &[Vec<TokenId>] {
        self.lists.get(slot).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Draft information for speculative acceptance, slot-major.
#[derive(Debug, Clone)]
pub struct SpeculativeInputs {
    /// Drafted token ids, `[max_batch, max_draft_tokens]`.
    pub draft_tokens: Vec<TokenId>,
    pub max_draft_tokens: usize,
    /// Draft count per slot, `[max_batch]`.
    pub num_draft_tokens: Vec<usize>,
    /// Draft-model logits, `[max_batch, max_draft_tokens, vocab]`; required
    /// for acceptance by logits.
    pub draft_logits: Option<Tensor>,
    pub use_random_accept_threshold: bool,
    pub random_accept_threshold: f32,
}

/// Dense tensors produced by draft-tree preparation.
#[derive(Debug, Clone, Default)]
pub struct SpeculativeOutputs {
    /// Token ids selected for the next draft pass, `[batch, max_decoding_tokens]`.
    pub next_draft_tokens: Vec<TokenId>,
    /// Accepted draft length per dense batch index.
    pub accepted_lengths: Vec<usize>,
    /// Position offset of each draft token relative to the sequence tail.
    pub position_offsets: Vec<usize>,
    /// Ancestor visibility masks, `u32` words of 32 tokens each.
    pub packed_masks: Vec<u32>,
    /// Tokens to decode this pass per dense batch index.
    pub generation_lengths: Vec<usize>,
}

/// Everything the pipeline consumes for one step. Lifetime = one step.
pub struct DecodingInput {
    pub step: usize,
    pub max_length: usize,
    /// Dense batch size; `batch_slots` maps dense index to slot.
    pub batch_size: usize,
    pub batch_slots: Vec<usize>,
    /// `[max_batch]`.
    pub end_ids: Vec<TokenId>,
    /// `[batch, max_decoding_tokens, beam, vocab_padded]`.
    pub logits: Option<Tensor>,
    /// Per-slot alternative when a contiguous tensor is infeasible; each
    /// entry is `[max_decoding_tokens, beam, vocab_padded]`.
    pub logits_vec: Option<Vec<Tensor>>,
    /// `[max_batch]`.
    pub input_lengths: Vec<usize>,
    /// `[max_batch]`; a sequence reaching its limit finishes with MAX_LENGTH.
    pub sequence_limit_length: Option<Vec<usize>>,
    /// Per-slot additive bias over the vocabulary.
    pub embedding_bias: Option<Vec<Vec<f32>>>,
    pub bad_words: Option<WordLists>,
    pub stop_words: Option<WordLists>,
    pub speculative: Option<SpeculativeInputs>,
}

impl DecodingInput {
    pub fn new(batch_slots: Vec<usize>, end_ids: Vec<TokenId>, max_length: usize) -> Self {
        Self {
            step: 0,
            max_length,
            batch_size: batch_slots.len(),
            batch_slots,
            end_ids,
            logits: None,
            logits_vec: None,
            input_lengths: Vec::new(),
            sequence_limit_length: None,
            embedding_bias: None,
            bad_words: None,
            stop_words: None,
            speculative: None,
        }
    }
}

/// Per-slot candidate-beam-array of finished hypotheses.
///
/// Bounded at `2 * beam_width` entries per slot; `min_normed_scores` tracks
/// the weakest stored score so a better finished hypothesis can displace it.
#[derive(Debug, Clone)]
pub struct BeamHypotheses {
    pub max_batch_size: usize,
    pub beam_width: usize,
    pub max_seq_len: usize,
    /// `[max_batch]`.
    pub is_done: Vec<bool>,
    /// `[max_batch]`, number of stored hypotheses.
    pub num_beams: Vec<usize>,
    /// `[max_batch, 2B]`.
    pub cum_log_probs_cba: Vec<f32>,
    /// `[max_batch, 2B]`, length-normalized.
    pub normed_scores_cba: Vec<f32>,
    /// `[max_batch]`.
    pub min_normed_scores: Vec<f32>,
    /// `[max_batch, 2B, max_seq_len]`.
    pub output_ids_cba: Vec<TokenId>,
    /// `[max_batch, 2B]`.
    pub seq_len_cba: Vec<usize>,
    /// `[max_batch, 2B, max_seq_len]`, per-position token log probs.
    pub log_probs_cba: Vec<f32>,
}

impl BeamHypotheses {
    pub fn new(max_batch_size: usize, beam_width: usize, max_seq_len: usize) -> Self {
        let cba = 2 * beam_width;
        Self {
            max_batch_size,
            beam_width,
            max_seq_len,
            is_done: vec![false; max_batch_size],
            num_beams: vec![0; max_batch_size],
            cum_log_probs_cba: vec![0.0; max_batch_size * cba],
            normed_scores_cba: vec![0.0; max_batch_size * cba],
            min_normed_scores: vec![f32::MAX; max_batch_size],
            output_ids_cba: vec![0; max_batch_size * cba * max_seq_len],
            seq_len_cba: vec![0; max_batch_size * cba],
            log_probs_cba: vec![0.0; max_batch_size * cba * max_seq_len],
        }
    }

    pub fn cba_width(&self) -> usize {
        2 * self.beam_width
    }
}

/// Caller-owned decoder state, mutated in place every step.
pub struct DecodingOutput {
    pub max_seq_len: usize,
    pub max_batch_size: usize,
    pub max_beam_width: usize,
    pub max_decoding_tokens: usize,
    /// `[max_batch, beam, max_seq_len]`.
    pub output_ids: Vec<TokenId>,
    /// `[max_decoding_tokens, max_batch, beam]`.
    pub new_tokens: Vec<TokenId>,
    /// `[max_batch, beam]`.
    pub sequence_lengths: Vec<usize>,
    /// `[max_batch, beam]`.
    pub cum_log_probs: Vec<f32>,
    /// `[max_batch, beam, max_seq_len]`, per generated position.
    pub log_probs: Vec<f32>,
    /// `[max_batch, beam, max_seq_len]`; beam search only.
    pub parent_ids: Vec<usize>,
    /// `[max_batch, beam]`.
    pub finished: Vec<FinishedState>,
    /// `[max_batch]`, count of finished beams per slot.
    pub finished_sum: Vec<usize>,
    pub beam_hypotheses: BeamHypotheses,
    pub speculative: Option<SpeculativeOutputs>,
}

impl DecodingOutput {
    pub fn new(domain: &DecoderDomain, max_seq_len: usize) -> Self {
        let bs = domain.max_batch_size;
        let bw = domain.max_beam_width;
        Self {
            max_seq_len,
            max_batch_size: bs,
            max_beam_width: bw,
            max_decoding_tokens: domain.max_decoding_tokens,
            output_ids: vec![0; bs * bw * max_seq_len],
            new_tokens: vec![0; domain.max_decoding_tokens * bs * bw],
            sequence_lengths: vec![0; bs * bw],
            cum_log_probs: vec![0.0; bs * bw],
            log_probs: vec![0.0; bs * bw * max_seq_len],
            parent_ids: vec![0; bs * bw * max_seq_len],
            finished: vec![FinishedState::empty(); bs * bw],
            finished_sum: vec![0; bs],
            beam_hypotheses: BeamHypotheses::new(bs, bw.max(1), max_seq_len),
            speculative: None,
        }
    }

    /// Flat index into `[max_batch, beam]` arrays.
    pub fn bb(&self, slot: usize, beam: usize) -> usize {
        slot * self.max_beam_width + beam
    }

    /// Flat index into `[max_batch, beam, max_seq_len]` arrays.
    pub fn bbs(&self, slot: usize, beam: usize, pos: usize) -> usize {
        (slot * self.max_beam_width + beam) * self.max_seq_len + pos
    }

    /// Flat index into `new_tokens`.
    pub fn token_idx(&self, decoding_token: usize, slot: usize, beam: usize) -> usize {
        (decoding_token * self.max_batch_size + slot) * self.max_beam_width + beam
    }

    /// Record one generated token for a beam.
    pub fn push_token(&mut self, slot: usize, beam: usize, token: TokenId) {
        let bb = self.bb(slot, beam);
        let len = self.sequence_lengths[bb];
        let at = self.bbs(slot, beam, len);
        self.output_ids[at] = token;
        let nt = self.token_idx(0, slot, beam);
        self.new_tokens[nt] = token;
        self.sequence_lengths[bb] = len + 1;
    }

    /// Generated ids of a beam so far, prompt included.
    pub fn ids_so_far(&self, slot: usize, beam: usize) -> &[TokenId] {
        let len = self.sequence_lengths[self.bb(slot, beam)];
        let start = self.bbs(slot, beam, 0);
        &self.output_ids[start..start + len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_flags_compose() {
        let mut f = FinishedState::empty();
        assert!(!f.is_finished());
        f.set_finished_eos();
        assert!(f.is_finished());
        assert!(f.is_finished_eos());
        assert!(!f.is_finished_stop_words());
        f.set_finished_max_length();
        assert!(f.is_finished_eos() && f.is_finished_max_length());
    }

    #[test]
    fn skip_decoding_is_not_finished() {
        let f = FinishedState::skip_decoding();
        assert!(f.is_skip_decoding());
        assert!(!f.is_finished());
    }

    #[test]
    fn push_token_appends_and_counts() {
        let domain = DecoderDomain::new(2, 2, 8);
        let mut out = DecodingOutput::new(&domain, 16);
        out.push_token(1, 0, 5);
        out.push_token(1, 0, 6);
        assert_eq!(out.sequence_lengths[out.bb(1, 0)], 2);
        assert_eq!(out.ids_so_far(1, 0), &[5, 6]);
        // Other beams untouched.
        assert_eq!(out.sequence_lengths[out.bb(1, 1)], 0);
    }

    #[test]
    fn word_lists_default_to_empty_per_slot() {
        let words = WordLists {
            lists: vec![vec![vec![1, 2]], vec![]],
        };
        assert_eq!(words.for_slot(0), &[vec![1, 2]]);
        assert!(words.for_slot(1).is_empty());
        assert!(words.for_slot(7).is_empty());
    }

    #[test]
    fn beam_hypotheses_sized_to_two_beam_width() {
        let h = BeamHypotheses::new(2, 3, 10);
        assert_eq!(h.cba_width(), 6);
        assert_eq!(h.cum_log_probs_cba.len(), 2 * 6);
        assert_eq!(h.output_ids_cba.len(), 2 * 6 * 10);
    }
}
