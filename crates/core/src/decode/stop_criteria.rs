//! Stop criteria and the per-slot lifecycle state machine.
//!
//! Runs last in the chain: checks stop-word tails and length limits, then
//! refreshes `finished_sum`. End-id termination is detected where tokens are
//! produced (sampling and beam layers); terminal states are sticky until
//! the sequence is removed.

use super::io::{DecodingInput, DecodingOutput, FinishedState};
use super::{DecodeWorkspace, DecoderLayer};
use crate::config::{DecoderDomain, SamplingConfig};
use crate::error::Result;
use crate::kv_cache::TokenId;

/// Lifecycle of one batch slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    #[default]
    Idle,
    /// Prompt admitted, no token decoded yet.
    Context,
    Generation,
    FinishedEos,
    FinishedMaxLen,
    FinishedStopWords,
}

impl SlotState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::FinishedEos | Self::FinishedMaxLen | Self::FinishedStopWords
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Context | Self::Generation)
    }

    /// Transition taken after a decode step, given the beam-0 finished
    /// flags. Terminal states are sticky.
    pub fn advance(self, finished: FinishedState) -> Self {
        if self.is_terminal() || self == Self::Idle {
            return self;
        }
        if finished.is_finished_eos() {
            Self::FinishedEos
        } else if finished.is_finished_stop_words() {
            Self::FinishedStopWords
        } else if finished.is_finished_max_length() {
            Self::FinishedMaxLen
        } else {
            Self::Generation
        }
    }
}

pub struct StopCriteriaLayer {
    domain: DecoderDomain,
}

impl StopCriteriaLayer {
    pub fn new(domain: &DecoderDomain) -> Self {
        Self { domain: *domain }
    }
}

/// Whether the sequence tail equals any of the stop words.
fn tail_matches(sequence: &[TokenId], stop_words: &[Vec<TokenId>]) -> bool {
    stop_words.iter().any(|word| {
        !word.is_empty()
            && word.len() <= sequence.len()
            && sequence[sequence.len() - word.len()..] == word[..]
    })
}

impl DecoderLayer for StopCriteriaLayer {
    fn name(&self) -> &'static str {
        "stop_criteria"
    }

    fn setup(
        &mut self,
        _batch_size: usize,
        _beam_width: usize,
        _batch_slots: &[usize],
        _config: &SamplingConfig,
    ) -> Result<()> {
        Ok(())
    }

    fn forward(
        &mut self,
        outputs: &mut DecodingOutput,
        inputs: &DecodingInput,
        workspace: &mut DecodeWorkspace,
    ) -> Result<()> {
        let beam_width = workspace.beam_width();
        for bi in 0..inputs.batch_size {
            let slot = inputs.batch_slots[bi];
            if slot >= self.domain.max_batch_size {
                return Err(crate::error::DecodeError::MaxBatchExceeded {
                    slot,
                    max: self.domain.max_batch_size,
                });
            }
            let limit = inputs
                .sequence_limit_length
                .as_ref()
                .and_then(|l| l.get(slot).copied())
                .unwrap_or(inputs.max_length)
                .min(inputs.max_length);

            for beam in 0..beam_width {
                let idx = outputs.bb(slot, beam);
                if outputs.finished[idx].is_finished() {
                    continue;
                }
                if let Some(stop_words) = &inputs.stop_words {
                    let words = stop_words.for_slot(slot);
                    if !words.is_empty() && tail_matches(outputs.ids_so_far(slot, beam), words) {
                        outputs.finished[idx].set_finished_stop_words();
                        continue;
                    }
                }
                if outputs.sequence_lengths[idx] >= limit {
                    outputs.finished[idx].set_finished_max_length();
                }
            }

            let finished_beams = (0..beam_width)
                .filter(|&beam| outputs.finished[outputs.bb(slot, beam)].is_finished())
                .count();
            outputs.finished_sum[slot] = finished_beams;
        }
        Ok(())
    }
}
