//! Batch-level decoder façade.
//!
//! Owns the layer pipeline, per-slot lifecycle states, and the speculative
//! RNG column. `forward` additionally reads back `finished_sum` to report
//! whether every active slot reached a terminal state; `forward_async`
//! skips that read.

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::config::{column, defaults, DecoderDomain, DecodingMode, SamplingConfig};
use crate::decode::{
    accept_draft_tokens_by_ids, accept_draft_tokens_by_logits, gather_tree, DecodeWorkspace,
    DecodingInput, DecodingOutput, DraftAcceptance, DynamicDecodePipeline, FinishedState,
    SlotState,
};
use crate::error::{DecodeError, Result};
use crate::kv_cache::TokenId;

/// Suppresses non-primary beams until they diverge from beam 0.
const BEAM_SUPPRESSION: f32 = -1e20;

pub struct Decoder {
    mode: DecodingMode,
    domain: DecoderDomain,
    max_seq_len: usize,
    pipeline: Option<DynamicDecodePipeline>,
    workspace: DecodeWorkspace,
    slot_states: Vec<SlotState>,
    /// Captured at setup for gather_tree scoring.
    length_penalty: Vec<f32>,
    /// Per-slot states for acceptance by logits.
    speculative_rngs: Vec<StdRng>,
    beam_width: usize,
}

impl Decoder {
    pub fn new(mode: DecodingMode, domain: DecoderDomain, max_seq_len: usize) -> Self {
        let pipeline = (mode != DecodingMode::Auto)
            .then(|| DynamicDecodePipeline::new(mode, &domain, max_seq_len));
        Self {
            mode,
            domain,
            max_seq_len,
            pipeline,
            workspace: DecodeWorkspace::new(&domain),
            slot_states: vec![SlotState::Idle; domain.max_batch_size],
            length_penalty: vec![defaults::LENGTH_PENALTY; domain.max_batch_size],
            speculative_rngs: (0..domain.max_batch_size)
                .map(|slot| StdRng::seed_from_u64(slot as u64))
                .collect(),
            beam_width: 1,
        }
    }

    pub fn mode(&self) -> DecodingMode {
        self.mode
    }

    pub fn domain(&self) -> &DecoderDomain {
        &self.domain
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.slot_states[slot]
    }

    /// Scratch the assembled pipeline pre-declares, in bytes.
    pub fn workspace_size(&self) -> usize {
        self.pipeline.as_ref().map(|p| p.workspace_size()).unwrap_or(0)
    }

    /// Install sampling parameters for a batch of slots and move them to
    /// the context stage. An `Auto` mode resolves against the configured
    /// beam width here, on first use.
    pub fn setup(
        &mut self,
        config: &SamplingConfig,
        batch_size: usize,
        batch_slots: &[usize],
    ) -> Result<()> {
        if batch_slots.len() < batch_size {
            return Err(DecodeError::InvalidArgument(format!(
                "batch_slots holds {} entries for batch size {batch_size}",
                batch_slots.len()
            )));
        }
        let beam_width = config.beam_width.max(1);
        if beam_width > self.domain.max_beam_width {
            return Err(DecodeError::InvalidArgument(format!(
                "beam width {beam_width} exceeds max {}",
                self.domain.max_beam_width
            )));
        }
        if self.pipeline.is_none() {
            let resolved = self.mode.resolve(beam_width);
            debug!(?resolved, "resolved auto decoding mode");
            self.mode = resolved;
            self.pipeline = Some(DynamicDecodePipeline::new(
                resolved,
                &self.domain,
                self.max_seq_len,
            ));
        }
        self.beam_width = beam_width;
        self.pipeline
            .as_mut()
            .expect("constructed above")
            .setup(batch_size, beam_width, batch_slots, config)?;

        for i in 0..batch_size {
            let slot = batch_slots[i];
            self.slot_states[slot] = SlotState::Context;
            self.length_penalty[slot] = column(&config.length_penalty, i, defaults::LENGTH_PENALTY);
            let seed = column(&config.random_seed, i, slot as u64);
            self.speculative_rngs[slot] = StdRng::seed_from_u64(seed);
        }
        Ok(())
    }

    /// Seed the caller-owned output block for a newly admitted request:
    /// prompt in every beam row, beam 0 live, other beams suppressed until
    /// the first fork.
    pub fn new_request(
        &mut self,
        outputs: &mut DecodingOutput,
        slot: usize,
        prompt: &[TokenId],
    ) -> Result<()> {
        if slot >= self.domain.max_batch_size {
            return Err(DecodeError::MaxBatchExceeded {
                slot,
                max: self.domain.max_batch_size,
            });
        }
        if prompt.len() > self.max_seq_len {
            return Err(DecodeError::InvalidArgument(format!(
                "prompt of {} tokens exceeds max sequence length {}",
                prompt.len(),
                self.max_seq_len
            )));
        }
        for beam in 0..self.domain.max_beam_width {
            let idx = outputs.bb(slot, beam);
            outputs.finished[idx] = FinishedState::empty();
            outputs.sequence_lengths[idx] = prompt.len();
            outputs.cum_log_probs[idx] = if beam == 0 { 0.0 } else { BEAM_SUPPRESSION };
            for (i, &token) in prompt.iter().enumerate() {
                let at = outputs.bbs(slot, beam, i);
                outputs.output_ids[at] = token;
            }
        }
        outputs.finished_sum[slot] = 0;
        let cba_width = outputs.beam_hypotheses.cba_width();
        outputs.beam_hypotheses.is_done[slot] = false;
        outputs.beam_hypotheses.num_beams[slot] = 0;
        outputs.beam_hypotheses.min_normed_scores[slot] = f32::MAX;
        let base = slot * cba_width;
        outputs.beam_hypotheses.normed_scores_cba[base..base + cba_width].fill(0.0);
        Ok(())
    }

    /// One decode step; returns `true` iff every slot decoded this step is
    /// in a terminal state afterwards.
    pub fn forward(
        &mut self,
        outputs: &mut DecodingOutput,
        inputs: &DecodingInput,
    ) -> Result<bool> {
        self.forward_async(outputs, inputs)?;
        // The synchronizing read: finished_sum against the beam count.
        let all_done = inputs
            .batch_slots
            .iter()
            .all(|&slot| outputs.finished_sum[slot] == self.beam_width);
        Ok(all_done)
    }

    /// One decode step without the all-done read-back.
    pub fn forward_async(
        &mut self,
        outputs: &mut DecodingOutput,
        inputs: &DecodingInput,
    ) -> Result<()> {
        let pipeline = self.pipeline.as_mut().ok_or_else(|| {
            DecodeError::InvalidArgument("decoder used before setup resolved its mode".into())
        })?;
        self.workspace.prepare(inputs.batch_size, self.beam_width);
        pipeline.forward(outputs, inputs, &mut self.workspace)?;

        for &slot in &inputs.batch_slots {
            let finished = outputs.finished[outputs.bb(slot, 0)];
            self.slot_states[slot] = self.slot_states[slot].advance(finished);
        }
        Ok(())
    }

    /// Finalize beam-search output for all slots.
    pub fn gather_tree(
        &self,
        final_output_ids: &mut [TokenId],
        outputs: &DecodingOutput,
        inputs: &DecodingInput,
    ) -> Result<()> {
        gather_tree(
            final_output_ids,
            outputs,
            &inputs.end_ids,
            &inputs.input_lengths,
            &self.length_penalty,
            self.beam_width,
        )
    }

    /// Speculative acceptance with known target tokens; see
    /// [`accept_draft_tokens_by_ids`].
    #[allow(clippy::too_many_arguments)]
    pub fn accept_draft_tokens_by_ids(
        &self,
        target_tokens: &[TokenId],
        draft_tokens: &[TokenId],
        max_draft_tokens: usize,
        context_lengths: &[usize],
        num_draft_tokens: &[usize],
        sequence_lengths: &mut [usize],
        finished_by_step: &[FinishedState],
        finished_final: &mut [FinishedState],
        batch_slots: &[usize],
    ) -> Result<usize> {
        accept_draft_tokens_by_ids(
            target_tokens,
            self.max_seq_len,
            draft_tokens,
            max_draft_tokens,
            context_lengths,
            num_draft_tokens,
            sequence_lengths,
            finished_by_step,
            finished_final,
            batch_slots,
            self.beam_width,
        )
    }

    /// Speculative acceptance from draft/target distributions; see
    /// [`accept_draft_tokens_by_logits`].
    #[allow(clippy::too_many_arguments)]
    pub fn accept_draft_tokens_by_logits(
        &mut self,
        draft_tokens: &[TokenId],
        max_draft_tokens: usize,
        num_draft_tokens: &[usize],
        draft_logits: &Tensor,
        target_logits: &Tensor,
        batch_slots: &[usize],
        use_random_accept_threshold: bool,
        random_accept_threshold: f32,
    ) -> Result<Vec<DraftAcceptance>> {
        if self.beam_width != 1 {
            return Err(DecodeError::InvalidArgument(format!(
                "speculative decoding requires beam width 1, got {}",
                self.beam_width
            )));
        }
        accept_draft_tokens_by_logits(
            draft_tokens,
            max_draft_tokens,
            num_draft_tokens,
            draft_logits,
            target_logits,
            batch_slots,
            self.domain.vocab_size,
            use_random_accept_threshold,
            random_accept_threshold,
            &mut self.speculative_rngs,
        )
    }

    /// Release a slot between steps; its terminal state becomes `Idle`.
    pub fn remove_sequence(&mut self, slot: usize) -> Result<()> {
        if slot >= self.domain.max_batch_size {
            return Err(DecodeError::MaxBatchExceeded {
                slot,
                max: self.domain.max_batch_size,
            });
        }
        self.slot_states[slot] = SlotState::Idle;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    const VOCAB: usize = 8;
    const END_ID: TokenId = 7;

    fn greedy_decoder() -> Decoder {
        let domain = DecoderDomain::new(2, 1, VOCAB);
        Decoder::new(DecodingMode::TopKTopP, domain, 16)
    }

    fn greedy_inputs(max_length: usize) -> DecodingInput {
        let mut inputs = DecodingInput::new(vec![0], vec![END_ID, END_ID], max_length);
        inputs.input_lengths = vec![0, 0];
        inputs
    }

    fn logits_for(token: usize) -> Tensor {
        let mut row = vec![-20.0f32; VOCAB];
        row[token] = 9.0;
        Tensor::from_vec(row, (1, 1, 1, VOCAB), &Device::Cpu).unwrap()
    }

    #[test]
    fn greedy_decode_until_max_length() {
        let mut decoder = greedy_decoder();
        decoder
            .setup(&SamplingConfig::greedy(), 1, &[0])
            .unwrap();
        let mut outputs = DecodingOutput::new(decoder.domain(), 16);
        decoder.new_request(&mut outputs, 0, &[1, 2, 3]).unwrap();
        assert_eq!(decoder.slot_state(0), SlotState::Context);

        let mut inputs = greedy_inputs(6);
        inputs.input_lengths = vec![3, 0];
        let mut done = false;
        for step in 0..5 {
            inputs.step = step;
            inputs.logits = Some(logits_for(5));
            done = decoder.forward(&mut outputs, &inputs).unwrap();
            if done {
                break;
            }
        }
        assert!(done);
        assert_eq!(outputs.ids_so_far(0, 0), &[1, 2, 3, 5, 5, 5]);
        assert!(outputs.finished[outputs.bb(0, 0)].is_finished_max_length());
        assert_eq!(decoder.slot_state(0), SlotState::FinishedMaxLen);
    }

    #[test]
    fn end_id_terminates_early() {
        let mut decoder = greedy_decoder();
        decoder.setup(&SamplingConfig::greedy(), 1, &[0]).unwrap();
        let mut outputs = DecodingOutput::new(decoder.domain(), 16);
        decoder.new_request(&mut outputs, 0, &[1]).unwrap();

        let mut inputs = greedy_inputs(16);
        inputs.input_lengths = vec![1, 0];
        inputs.logits = Some(logits_for(END_ID as usize));
        let done = decoder.forward(&mut outputs, &inputs).unwrap();
        assert!(done);
        assert_eq!(decoder.slot_state(0), SlotState::FinishedEos);
    }

    #[test]
    fn auto_mode_resolves_at_setup() {
        let domain = DecoderDomain::new(2, 2, VOCAB);
        let mut decoder = Decoder::new(DecodingMode::Auto, domain, 16);
        decoder
            .setup(&SamplingConfig::beam_search(2), 1, &[0])
            .unwrap();
        assert_eq!(decoder.mode(), DecodingMode::BeamSearch);

        let mut decoder = Decoder::new(DecodingMode::Auto, domain, 16);
        decoder.setup(&SamplingConfig::greedy(), 1, &[0]).unwrap();
        assert_eq!(decoder.mode(), DecodingMode::TopKTopP);
    }

    #[test]
    fn forward_before_setup_fails_for_auto() {
        let domain = DecoderDomain::new(1, 1, VOCAB);
        let mut decoder = Decoder::new(DecodingMode::Auto, domain, 16);
        let mut outputs = DecodingOutput::new(&domain, 16);
        let mut inputs = greedy_inputs(8);
        inputs.logits = Some(logits_for(0));
        assert!(matches!(
            decoder.forward(&mut outputs, &inputs),
            Err(DecodeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn new_request_resets_slot_outputs() {
        let domain = DecoderDomain::new(2, 2, VOCAB);
        let mut decoder = Decoder::new(DecodingMode::BeamSearch, domain, 16);
        let mut outputs = DecodingOutput::new(&domain, 16);
        let idx = outputs.bb(0, 0);
        outputs.finished[idx].set_finished_eos();
        outputs.beam_hypotheses.num_beams[0] = 3;

        decoder.new_request(&mut outputs, 0, &[4, 5]).unwrap();
        assert!(!outputs.finished[outputs.bb(0, 0)].is_finished());
        assert_eq!(outputs.beam_hypotheses.num_beams[0], 0);
        assert_eq!(outputs.sequence_lengths[outputs.bb(0, 1)], 2);
        assert_eq!(outputs.cum_log_probs[outputs.bb(0, 0)], 0.0);
        assert!(outputs.cum_log_probs[outputs.bb(0, 1)] < -1e19);
        assert_eq!(outputs.ids_so_far(0, 1), &[4, 5]);
    }

    #[test]
    fn oversized_prompt_is_rejected() {
        let mut decoder = greedy_decoder();
        let mut outputs = DecodingOutput::new(decoder.domain(), 16);
        let prompt = vec![0; 17];
        assert!(matches!(
            decoder.new_request(&mut outputs, 0, &prompt),
            Err(DecodeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn workspace_size_is_declared_before_first_forward() {
        let decoder = greedy_decoder();
        assert!(decoder.workspace_size() > 0);
    }
}
