//! Penalty layer: temperature, repetition/presence/frequency penalties,
//! min-length masking, embedding bias, and bad-words filtering.
//!
//! Parameters live in parallel per-slot columns sized to the full domain;
//! kernels index them through `batch_slots`. Each penalty class is enabled
//! the first time any slot configures a non-default value and stays enabled
//! for the decoder's lifetime. Input logits are immutable; penalized rows
//! are written to the shared workspace buffer.

use std::collections::HashMap;

use candle_core::{DType, Tensor};

use super::io::{DecodingInput, DecodingOutput};
use super::{DecodeWorkspace, DecoderLayer};
use crate::config::{column, defaults, DecoderDomain, SamplingConfig};
use crate::error::{DecodeError, Result};
use crate::kv_cache::TokenId;

/// Marker for "no logits recorded" in the rolling origin window.
const NO_ORIGIN: i64 = -1;

pub struct PenaltyLayer {
    domain: DecoderDomain,
    max_seq_len: usize,

    temperature: Vec<f32>,
    repetition_penalty: Vec<f32>,
    presence_penalty: Vec<f32>,
    frequency_penalty: Vec<f32>,
    min_length: Vec<usize>,

    use_temperature: bool,
    use_repetition: bool,
    use_presence: bool,
    use_frequency: bool,
    use_min_length: bool,

    /// Rolling record of which dense batch row fed each slot at each recent
    /// step, indexed by `cyclic_step`; mirrors the pinned pointer window the
    /// penalty kernels consume.
    recent_logits_rows: Vec<i64>,
    cyclic_step: usize,
}

impl PenaltyLayer {
    pub fn new(domain: &DecoderDomain, max_seq_len: usize) -> Self {
        let bs = domain.max_batch_size;
        Self {
            domain: *domain,
            max_seq_len,
            temperature: vec![defaults::TEMPERATURE; bs],
            repetition_penalty: vec![defaults::REPETITION_PENALTY; bs],
            presence_penalty: vec![defaults::PRESENCE_PENALTY; bs],
            frequency_penalty: vec![defaults::FREQUENCY_PENALTY; bs],
            min_length: vec![defaults::MIN_LENGTH; bs],
            use_temperature: false,
            use_repetition: false,
            use_presence: false,
            use_frequency: false,
            use_min_length: false,
            recent_logits_rows: vec![NO_ORIGIN; max_seq_len * bs],
            cyclic_step: 0,
        }
    }

    /// Dense batch row that produced `slot`'s logits at `step`, if still in
    /// the window.
    pub fn logits_origin(&self, step: usize, slot: usize) -> Option<usize> {
        let row = self.recent_logits_rows[(step % self.max_seq_len) * self.domain.max_batch_size + slot];
        (row != NO_ORIGIN).then_some(row as usize)
    }

    fn load_row(
        &self,
        flat: &FlatLogits,
        batch_idx: usize,
        decoding_token: usize,
        beam: usize,
        beam_width: usize,
        dst: &mut [f32],
    ) {
        let vocab = self.domain.vocab_size_padded;
        let row = match flat {
            FlatLogits::Dense(values) => {
                let start = ((batch_idx * self.domain.max_decoding_tokens + decoding_token)
                    * beam_width
                    + beam)
                    * vocab;
                &values[start..start + vocab]
            }
            FlatLogits::PerSlot(rows) => {
                let values = &rows[batch_idx];
                let start = (decoding_token * beam_width + beam) * vocab;
                &values[start..start + vocab]
            }
        };
        dst.copy_from_slice(row);
    }
}

enum FlatLogits {
    Dense(Vec<f32>),
    PerSlot(Vec<Vec<f32>>),
}

fn tensor_to_f32(t: &Tensor) -> Result<Vec<f32>> {
    let t = match t.dtype() {
        DType::F32 => t.clone(),
        DType::F16 | DType::BF16 => t.to_dtype(DType::F32)?,
        other => {
            return Err(DecodeError::UnsupportedDtype(dtype_name(other)));
        }
    };
    Ok(t.flatten_all()?.to_vec1::<f32>()?)
}

fn dtype_name(dtype: DType) -> &'static str {
    match dtype {
        DType::U8 => "U8",
        DType::U32 => "U32",
        DType::I64 => "I64",
        DType::F64 => "F64",
        _ => "unknown",
    }
}

impl DecoderLayer for PenaltyLayer {
    fn name(&self) -> &'static str {
        "penalty"
    }

    fn setup(
        &mut self,
        batch_size: usize,
        _beam_width: usize,
        batch_slots: &[usize],
        config: &SamplingConfig,
    ) -> Result<()> {
        // A class switches on when any slot configures it; it never
        // switches back off.
        self.use_temperature |= config.temperature.is_some();
        self.use_repetition |= config.repetition_penalty.is_some();
        self.use_presence |= config.presence_penalty.is_some();
        self.use_frequency |= config.frequency_penalty.is_some();
        self.use_min_length |= config.min_length.is_some();

        for i in 0..batch_size {
            let slot = batch_slots[i];
            if slot >= self.domain.max_batch_size {
                return Err(DecodeError::MaxBatchExceeded {
                    slot,
                    max: self.domain.max_batch_size,
                });
            }
            let temperature = column(&config.temperature, i, defaults::TEMPERATURE);
            if temperature < 0.0 {
                return Err(DecodeError::InvalidArgument(format!(
                    "temperature {temperature} must be non-negative"
                )));
            }
            self.temperature[slot] = temperature;
            self.repetition_penalty[slot] =
                column(&config.repetition_penalty, i, defaults::REPETITION_PENALTY);
            self.presence_penalty[slot] =
                column(&config.presence_penalty, i, defaults::PRESENCE_PENALTY);
            self.frequency_penalty[slot] =
                column(&config.frequency_penalty, i, defaults::FREQUENCY_PENALTY);
            self.min_length[slot] = column(&config.min_length, i, defaults::MIN_LENGTH);
        }
        Ok(())
    }

    fn forward(
        &mut self,
        outputs: &mut DecodingOutput,
        inputs: &DecodingInput,
        workspace: &mut DecodeWorkspace,
    ) -> Result<()> {
        let beam_width = workspace.beam_width();
        let flat = if let Some(vec) = &inputs.logits_vec {
            if vec.len() != inputs.batch_size {
                return Err(DecodeError::InvalidArgument(format!(
                    "logits_vec length {} does not match batch size {}",
                    vec.len(),
                    inputs.batch_size
                )));
            }
            FlatLogits::PerSlot(vec.iter().map(tensor_to_f32).collect::<Result<_>>()?)
        } else {
            let tensor = inputs.logits.as_ref().expect("validated by pipeline");
            FlatLogits::Dense(tensor_to_f32(tensor)?)
        };

        self.cyclic_step %= self.max_seq_len;
        let origin_base = self.cyclic_step * self.domain.max_batch_size;

        let mut row = vec![0.0f32; self.domain.vocab_size_padded];
        for bi in 0..inputs.batch_size {
            let slot = inputs.batch_slots[bi];
            self.recent_logits_rows[origin_base + slot] = bi as i64;

            for beam in 0..beam_width {
                if outputs.finished[outputs.bb(slot, beam)].is_finished() {
                    continue;
                }
                let input_len = inputs.input_lengths.get(slot).copied().unwrap_or(0);
                let seq_len = outputs.sequence_lengths[outputs.bb(slot, beam)];
                let history_start = outputs.bbs(slot, beam, 0) + input_len;
                let history_end = outputs.bbs(slot, beam, 0) + seq_len;
                for ti in 0..self.domain.max_decoding_tokens {
                    self.load_row(&flat, bi, ti, beam, beam_width, &mut row);

                    if let Some(bias) = inputs.embedding_bias.as_ref().and_then(|b| b.get(slot)) {
                        for (l, b) in row.iter_mut().zip(bias) {
                            *l += b;
                        }
                    }

                    if self.use_temperature {
                        let t = self.temperature[slot];
                        if t != defaults::TEMPERATURE && t > 0.0 {
                            let inv = 1.0 / t;
                            for l in row.iter_mut() {
                                *l *= inv;
                            }
                        }
                    }

                    let history = &outputs.output_ids[history_start..history_end];
                    if self.use_repetition {
                        apply_repetition_penalty(&mut row, history, self.repetition_penalty[slot]);
                    }
                    if self.use_presence || self.use_frequency {
                        apply_presence_frequency_penalty(
                            &mut row,
                            history,
                            self.presence_penalty[slot],
                            self.frequency_penalty[slot],
                        );
                    }
                    if self.use_min_length {
                        let generated = seq_len.saturating_sub(input_len);
                        if generated < self.min_length[slot] {
                            let end_id = inputs.end_ids[slot] as usize;
                            if end_id < row.len() {
                                row[end_id] = f32::NEG_INFINITY;
                            }
                        }
                    }
                    if let Some(bad_words) = &inputs.bad_words {
                        apply_bad_words(&mut row, bad_words.for_slot(slot), history);
                    }

                    workspace.logits_row_mut(bi, ti, beam).copy_from_slice(&row);
                }
            }
        }

        self.cyclic_step += 1;
        Ok(())
    }

    fn workspace_size(&self) -> usize {
        self.domain.max_batch_size
            * self.domain.max_decoding_tokens
            * self.domain.max_beam_width
            * self.domain.vocab_size_padded
            * std::mem::size_of::<f32>()
    }
}

/// Divide positive logits, multiply negative ones (CTRL convention).
fn apply_repetition_penalty(row: &mut [f32], history: &[TokenId], penalty: f32) {
    if penalty == defaults::REPETITION_PENALTY {
        return;
    }
    for &token in history {
        let idx = token as usize;
        if idx < row.len() {
            if row[idx] > 0.0 {
                row[idx] /= penalty;
            } else {
                row[idx] *= penalty;
            }
        }
    }
}

/// OpenAI convention: subtract `frequency * count + presence` once per seen
/// token.
fn apply_presence_frequency_penalty(
    row: &mut [f32],
    history: &[TokenId],
    presence: f32,
    frequency: f32,
) {
    if presence == defaults::PRESENCE_PENALTY && frequency == defaults::FREQUENCY_PENALTY {
        return;
    }
    let mut counts: HashMap<TokenId, u32> = HashMap::with_capacity(history.len());
    for &token in history {
        *counts.entry(token).or_insert(0) += 1;
    }
    for (&token, &count) in &counts {
        let idx = token as usize;
        if idx < row.len() {
            row[idx] -= frequency * count as f32 + presence;
        }
    }
}

/// Mask tokens that would complete a banned sequence. Single-token entries
/// are banned unconditionally; longer ones only when the history tail
/// matches their prefix.
fn apply_bad_words(row: &mut [f32], bad_words: &[Vec<TokenId>], history: &[TokenId]) {
    for word in bad_words {
        let Some((&last, prefix)) = word.split_last() else {
            continue;
        };
        let banned = prefix.is_empty()
            || (prefix.len() <= history.len() && history[history.len() - prefix.len()..] == *prefix);
        if banned {
            let idx = last as usize;
            if idx < row.len() {
                row[idx] = f32::NEG_INFINITY;
            }
        }
    }
}
