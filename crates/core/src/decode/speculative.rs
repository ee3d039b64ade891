//! Speculative-decoding acceptance.
//!
//! Two modes, both restricted to beam width 1 and remapped through
//! `batch_slots`:
//!
//! * **by ids** — target tokens are known; accept the longest draft prefix
//!   matching them and count the target's token at the first mismatch as the
//!   bonus emission.
//! * **by logits** — only distributions are known; accept each draft token
//!   with probability `min(1, p_target / p_draft)` and resample rejections
//!   from the residual `max(0, p_target - p_draft)`.

use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::Rng;
use tracing::{debug, warn};

use super::io::FinishedState;
use crate::error::{DecodeError, Result};
use crate::kv_cache::TokenId;

/// Outcome of acceptance for one dense batch entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DraftAcceptance {
    pub slot: usize,
    /// Draft tokens accepted as-is.
    pub accepted_len: usize,
    /// Token emitted after the accepted prefix (target token at the first
    /// mismatch, or a bonus/resampled token).
    pub next_token: TokenId,
}

/// Accept drafted tokens against known target tokens.
///
/// `target_tokens` is `[max_batch, max_seq_len]`, `draft_tokens` is
/// `[max_batch, max_draft_tokens]`. For each slot the accepted prefix plus
/// the bonus token advance `sequence_lengths`; `finished_by_step[step]`
/// (shape `[max_draft_tokens + 1, max_batch]`) supplies the finished state
/// that takes effect at the step where acceptance stopped. Returns the
/// number of finished slots across the batch.
#[allow(clippy::too_many_arguments)]
pub fn accept_draft_tokens_by_ids(
    target_tokens: &[TokenId],
    max_seq_len: usize,
    draft_tokens: &[TokenId],
    max_draft_tokens: usize,
    context_lengths: &[usize],
    num_draft_tokens: &[usize],
    sequence_lengths: &mut [usize],
    finished_by_step: &[FinishedState],
    finished_final: &mut [FinishedState],
    batch_slots: &[usize],
    beam_width: usize,
) -> Result<usize> {
    if beam_width != 1 {
        return Err(DecodeError::InvalidArgument(format!(
            "speculative decoding requires beam width 1, got {beam_width}"
        )));
    }
    let max_batch = sequence_lengths.len();
    let mut finished_sum = 0;
    for &slot in batch_slots {
        if slot >= max_batch {
            return Err(DecodeError::MaxBatchExceeded {
                slot,
                max: max_batch,
            });
        }
        let context_len = context_lengths[slot];
        let draft_len = num_draft_tokens[slot].min(max_draft_tokens);

        let mut accepted = 0;
        while accepted < draft_len {
            let target = target_tokens[slot * max_seq_len + context_len + accepted];
            let draft = draft_tokens[slot * max_draft_tokens + accepted];
            if target != draft {
                break;
            }
            accepted += 1;
        }
        if accepted == 0 && draft_len > 0 {
            warn!(slot, draft_len, "draft rejected at first token, only the target token advances");
        }

        // Accepted prefix plus the target token at the stop position.
        sequence_lengths[slot] = context_len + accepted + 1;
        finished_final[slot] = finished_by_step[accepted * max_batch + slot];
        if finished_final[slot].is_finished() {
            finished_sum += 1;
        }
    }
    Ok(finished_sum)
}

/// Accept drafted tokens by comparing draft and target distributions.
///
/// `draft_logits` is `[max_batch, max_draft_tokens, vocab]`; `target_logits`
/// is `[max_batch, max_draft_tokens + 1, vocab]` (the extra row feeds the
/// bonus draw after a fully accepted draft). Probabilities are softmaxed on
/// the fly. With `use_random_accept_threshold` the fixed threshold replaces
/// the likelihood-ratio test. `rngs` holds one state per slot.
#[allow(clippy::too_many_arguments)]
pub fn accept_draft_tokens_by_logits(
    draft_tokens: &[TokenId],
    max_draft_tokens: usize,
    num_draft_tokens: &[usize],
    draft_logits: &Tensor,
    target_logits: &Tensor,
    batch_slots: &[usize],
    vocab_size: usize,
    use_random_accept_threshold: bool,
    random_accept_threshold: f32,
    rngs: &mut [StdRng],
) -> Result<Vec<DraftAcceptance>> {
    let draft_rows = flatten_logits(draft_logits)?;
    let target_rows = flatten_logits(target_logits)?;
    let draft_row_len = max_draft_tokens * vocab_size;
    let target_row_len = (max_draft_tokens + 1) * vocab_size;
    let max_batch = rngs.len();

    let mut results = Vec::with_capacity(batch_slots.len());
    for &slot in batch_slots {
        let draft_len = num_draft_tokens[slot].min(max_draft_tokens);
        let rng = rngs
            .get_mut(slot)
            .ok_or(DecodeError::MaxBatchExceeded {
                slot,
                max: max_batch,
            })?;

        let mut accepted = 0;
        let mut next_token = None;
        while accepted < draft_len {
            let token = draft_tokens[slot * max_draft_tokens + accepted] as usize;
            let d_start = slot * draft_row_len + accepted * vocab_size;
            let t_start = slot * target_row_len + accepted * vocab_size;
            let draft_probs = softmaxed(&draft_rows[d_start..d_start + vocab_size]);
            let target_probs = softmaxed(&target_rows[t_start..t_start + vocab_size]);

            let threshold = if use_random_accept_threshold {
                random_accept_threshold
            } else if draft_probs[token] > 0.0 {
                (target_probs[token] / draft_probs[token]).min(1.0)
            } else {
                1.0
            };
            let u: f32 = rng.gen();
            if u < threshold {
                accepted += 1;
                continue;
            }

            // Rejected: draw from the residual distribution.
            if accepted == 0 {
                warn!(slot, draft_len, "draft rejected at first token, resampling from residual");
            } else {
                debug!(slot, accepted, "draft rejected, resampling from residual");
            }
            let mut residual: Vec<f32> = target_probs
                .iter()
                .zip(&draft_probs)
                .map(|(&t, &d)| (t - d).max(0.0))
                .collect();
            let sum: f32 = residual.iter().sum();
            if sum > 0.0 {
                let inv = 1.0 / sum;
                for p in residual.iter_mut() {
                    *p *= inv;
                }
            } else {
                // Distributions coincide; fall back to the target itself.
                residual.copy_from_slice(&target_probs);
            }
            next_token = Some(sample_categorical(&residual, rng));
            break;
        }

        let next_token = next_token.unwrap_or_else(|| {
            // Fully accepted: bonus draw from the position after the draft.
            let t_start = slot * target_row_len + draft_len * vocab_size;
            let target_probs = softmaxed(&target_rows[t_start..t_start + vocab_size]);
            sample_categorical(&target_probs, rng)
        });

        results.push(DraftAcceptance {
            slot,
            accepted_len: accepted,
            next_token,
        });
    }
    Ok(results)
}

fn flatten_logits(t: &Tensor) -> Result<Vec<f32>> {
    let t = match t.dtype() {
        DType::F32 => t.clone(),
        DType::F16 | DType::BF16 => t.to_dtype(DType::F32)?,
        _ => return Err(DecodeError::UnsupportedDtype("non-float logits")),
    };
    Ok(t.flatten_all()?.to_vec1::<f32>()?)
}

fn softmaxed(row: &[f32]) -> Vec<f32> {
    let mut probs = row.to_vec();
    super::softmax_in_place(&mut probs);
    probs
}

fn sample_categorical(probs: &[f32], rng: &mut StdRng) -> TokenId {
    let r: f32 = rng.gen();
    let mut cumsum = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return i as TokenId;
        }
    }
    probs.len() as TokenId - 1
}
