//! Categorical sampling layers: top-k, top-p, min-p.
//!
//! Probabilities are computed by the shared workspace softmax before any
//! filtering; the sampler itself only filters and draws. Each slot owns a
//! seeded RNG, so two runs with identical seeds, logits, and batch slots
//! produce identical tokens.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::io::{DecodingInput, DecodingOutput};
use super::{log_softmax, DecodeWorkspace, DecoderLayer};
use crate::config::{column, defaults, DecoderDomain, DecodingMode, SamplingConfig};
use crate::error::{DecodeError, Result};
use crate::kv_cache::TokenId;

pub struct SamplingLayer {
    domain: DecoderDomain,
    mode: DecodingMode,
    rng: Vec<Option<StdRng>>,
    top_k: Vec<usize>,
    /// Initial top-p per slot; the running value resets to this.
    top_p_initial: Vec<f32>,
    /// Running top-p after decay.
    top_p: Vec<f32>,
    top_p_decay: Vec<f32>,
    top_p_min: Vec<f32>,
    top_p_reset_ids: Vec<TokenId>,
    min_p: Vec<f32>,
}

impl SamplingLayer {
    pub fn new(domain: &DecoderDomain, mode: DecodingMode) -> Self {
        debug_assert!(matches!(
            mode,
            DecodingMode::TopK | DecodingMode::TopP | DecodingMode::TopKTopP | DecodingMode::MinP
        ));
        let bs = domain.max_batch_size;
        Self {
            domain: *domain,
            mode,
            rng: (0..bs).map(|_| None).collect(),
            top_k: vec![defaults::TOP_K; bs],
            top_p_initial: vec![defaults::TOP_P; bs],
            top_p: vec![defaults::TOP_P; bs],
            top_p_decay: vec![defaults::TOP_P_DECAY; bs],
            top_p_min: vec![defaults::TOP_P_MIN; bs],
            top_p_reset_ids: vec![defaults::TOP_P_RESET_ID; bs],
            min_p: vec![defaults::MIN_P; bs],
        }
    }

    fn uses_top_k(&self) -> bool {
        matches!(self.mode, DecodingMode::TopK | DecodingMode::TopKTopP)
    }

    fn uses_top_p(&self) -> bool {
        matches!(self.mode, DecodingMode::TopP | DecodingMode::TopKTopP)
    }

    /// Multiplicative decay after each draw; a reset-id draw restores the
    /// initial value.
    fn update_top_p(&mut self, slot: usize, token: TokenId) {
        if token == self.top_p_reset_ids[slot] {
            self.top_p[slot] = self.top_p_initial[slot];
        } else {
            self.top_p[slot] =
                (self.top_p[slot] * self.top_p_decay[slot]).max(self.top_p_min[slot]);
        }
    }
}

impl DecoderLayer for SamplingLayer {
    fn name(&self) -> &'static str {
        "sampling"
    }

    fn setup(
        &mut self,
        batch_size: usize,
        beam_width: usize,
        batch_slots: &[usize],
        config: &SamplingConfig,
    ) -> Result<()> {
        if beam_width != 1 {
            return Err(DecodeError::InvalidArgument(format!(
                "sampling layers require beam width 1, got {beam_width}"
            )));
        }
        for i in 0..batch_size {
            let slot = batch_slots[i];
            let seed = column(&config.random_seed, i, 0);
            self.rng[slot] = Some(StdRng::seed_from_u64(seed));
            self.top_k[slot] = column(&config.top_k, i, defaults::TOP_K);
            let top_p = column(&config.top_p, i, defaults::TOP_P);
            if !(0.0..=1.0).contains(&top_p) {
                return Err(DecodeError::InvalidArgument(format!(
                    "top_p {top_p} outside [0, 1]"
                )));
            }
            self.top_p_initial[slot] = top_p;
            self.top_p[slot] = top_p;
            self.top_p_decay[slot] = column(&config.top_p_decay, i, defaults::TOP_P_DECAY);
            self.top_p_min[slot] = column(&config.top_p_min, i, defaults::TOP_P_MIN);
            self.top_p_reset_ids[slot] =
                column(&config.top_p_reset_ids, i, defaults::TOP_P_RESET_ID);
            self.min_p[slot] = column(&config.min_p, i, defaults::MIN_P);
        }
        Ok(())
    }

    fn forward(
        &mut self,
        outputs: &mut DecodingOutput,
        inputs: &DecodingInput,
        workspace: &mut DecodeWorkspace,
    ) -> Result<()> {
        let vocab = self.domain.vocab_size;
        for bi in 0..inputs.batch_size {
            let slot = inputs.batch_slots[bi];
            if outputs.finished[outputs.bb(slot, 0)].is_finished() {
                continue;
            }

            let log_probs = log_softmax(workspace.logits_row(bi, 0, 0));
            workspace.compute_probs(bi, 0, 0);
            let probs = workspace.probs_row_mut(bi, 0, 0);
            // Padded vocabulary tail never holds real tokens.
            for p in probs.iter_mut().skip(vocab) {
                *p = 0.0;
            }

            if self.mode == DecodingMode::MinP && self.min_p[slot] > 0.0 {
                apply_min_p(probs, self.min_p[slot]);
            }
            let top_k = self.top_k[slot];
            if self.uses_top_k() && top_k > 0 && top_k < vocab {
                apply_top_k(probs, top_k);
            }
            let top_p = self.top_p[slot];
            if self.uses_top_p() && top_p > 0.0 && top_p < 1.0 {
                apply_top_p(probs, top_p);
            }

            let token = if self.uses_top_k() && top_k == 1 {
                super::argmax(probs) as TokenId
            } else {
                renormalize(probs);
                let rng = self.rng[slot]
                    .as_mut()
                    .ok_or_else(|| DecodeError::InvalidArgument(format!("slot {slot} not set up")))?;
                sample_from_probs(probs, rng)
            };

            let bb = outputs.bb(slot, 0);
            let seq_len = outputs.sequence_lengths[bb];
            let lp_idx = outputs.bbs(slot, 0, seq_len);
            outputs.log_probs[lp_idx] = log_probs[token as usize];
            outputs.cum_log_probs[bb] += log_probs[token as usize];
            outputs.push_token(slot, 0, token);

            if token == inputs.end_ids[slot] {
                let idx = outputs.bb(slot, 0);
                outputs.finished[idx].set_finished_eos();
            }
            self.update_top_p(slot, token);
        }
        Ok(())
    }

    fn workspace_size(&self) -> usize {
        self.domain.max_batch_size * self.domain.vocab_size_padded * std::mem::size_of::<f32>()
    }
}

/// Drop tokens below `min_p * max_prob`.
fn apply_min_p(probs: &mut [f32], min_p: f32) {
    let max_prob = probs.iter().copied().fold(0.0f32, f32::max);
    let threshold = max_prob * min_p;
    for p in probs.iter_mut() {
        if *p < threshold {
            *p = 0.0;
        }
    }
}

/// Keep only the k most probable tokens.
fn apply_top_k(probs: &mut [f32], k: usize) {
    let mut sorted: Vec<f32> = probs.to_vec();
    sorted.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let threshold = sorted[k.min(sorted.len()) - 1];
    for p in probs.iter_mut() {
        if *p < threshold {
            *p = 0.0;
        }
    }
}

/// Nucleus filtering: keep the smallest prefix of the sorted distribution
/// whose mass exceeds `top_p`.
fn apply_top_p(probs: &mut [f32], top_p: f32) {
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_unstable_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumsum = 0.0f32;
    let mut cutoff = indexed.len();
    for (i, &(_, p)) in indexed.iter().enumerate() {
        cumsum += p;
        if cumsum > top_p {
            cutoff = i + 1;
            break;
        }
    }
    for &(idx, _) in &indexed[cutoff..] {
        probs[idx] = 0.0;
    }
}

fn renormalize(probs: &mut [f32]) {
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 && sum != 1.0 {
        let inv = 1.0 / sum;
        for p in probs.iter_mut() {
            *p *= inv;
        }
    }
}

fn sample_from_probs(probs: &[f32], rng: &mut StdRng) -> TokenId {
    let r: f32 = rng.gen();
    let mut cumsum = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return i as TokenId;
        }
    }
    // Numerical tail: fall back to the last candidate.
    probs.len() as TokenId - 1
}
