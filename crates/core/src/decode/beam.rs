//! Beam-search layer: candidate expansion, CBA maintenance, early stopping.
//!
//! Each step selects the top `2 * beam_width` (token, parent beam) pairs per
//! slot. Candidates that select the end id complete a hypothesis and move
//! into the candidate-beam-array; the first `beam_width` live candidates
//! become the next step's beams. Output rows are written per beam slot with
//! parent pointers; true histories are reconstructed by `gather_tree`.

use std::cmp::Ordering;

use super::io::{DecodingInput, DecodingOutput};
use super::{log_softmax, DecodeWorkspace, DecoderLayer};
use crate::config::{column, defaults, DecoderDomain, EarlyStopping, SamplingConfig};
use crate::error::{DecodeError, Result};
use crate::kv_cache::TokenId;

pub struct BeamSearchLayer {
    domain: DecoderDomain,
    diversity_rate: Vec<f32>,
    length_penalty: Vec<f32>,
    early_stopping: Vec<EarlyStopping>,
}

#[derive(Clone, Copy)]
struct Candidate {
    token: TokenId,
    parent_beam: usize,
    /// True cumulative log-prob (no diversity adjustment).
    cum_log_prob: f32,
    /// Log-prob of the selected token alone.
    token_log_prob: f32,
    /// Selection key: cumulative log-prob with diversity penalty applied.
    adjusted: f32,
}

impl BeamSearchLayer {
    pub fn new(domain: &DecoderDomain) -> Self {
        let bs = domain.max_batch_size;
        Self {
            domain: *domain,
            diversity_rate: vec![defaults::DIVERSITY_RATE; bs],
            length_penalty: vec![defaults::LENGTH_PENALTY; bs],
            early_stopping: vec![defaults::EARLY_STOPPING; bs],
        }
    }

    pub fn length_penalty(&self, slot: usize) -> f32 {
        self.length_penalty[slot]
    }
}

/// `cum_log_prob / length^length_penalty`; a zero penalty disables
/// normalization.
pub(crate) fn normed_score(cum_log_prob: f32, length: usize, length_penalty: f32) -> f32 {
    if length_penalty == 0.0 || length == 0 {
        cum_log_prob
    } else {
        cum_log_prob / (length as f32).powf(length_penalty)
    }
}

/// Materialize a beam's token history by walking parent pointers from the
/// tail back to the prompt boundary. Returns prompt + generated tokens.
pub(crate) fn reconstruct_path(
    outputs: &DecodingOutput,
    slot: usize,
    beam: usize,
    seq_len: usize,
    input_len: usize,
) -> Vec<TokenId> {
    let mut generated = Vec::with_capacity(seq_len.saturating_sub(input_len));
    let mut cur_beam = beam;
    let mut pos = seq_len;
    while pos > input_len {
        pos -= 1;
        generated.push(outputs.output_ids[outputs.bbs(slot, cur_beam, pos)]);
        cur_beam = outputs.parent_ids[outputs.bbs(slot, cur_beam, pos)];
    }
    generated.reverse();
    let prompt_start = outputs.bbs(slot, cur_beam, 0);
    let mut path = outputs.output_ids[prompt_start..prompt_start + input_len].to_vec();
    path.extend(generated);
    path
}

/// Insert a finished hypothesis into the slot's CBA, displacing the worst
/// stored entry when full. Keeps `min_normed_scores` current.
pub(crate) fn insert_into_cba(
    outputs: &mut DecodingOutput,
    slot: usize,
    path: &[TokenId],
    cum_log_prob: f32,
    normed: f32,
) {
    let cba_width = outputs.beam_hypotheses.cba_width();
    let max_seq_len = outputs.beam_hypotheses.max_seq_len;
    let num = outputs.beam_hypotheses.num_beams[slot];

    let entry = if num < cba_width {
        outputs.beam_hypotheses.num_beams[slot] = num + 1;
        num
    } else {
        if normed <= outputs.beam_hypotheses.min_normed_scores[slot] {
            return;
        }
        // Displace the weakest stored hypothesis.
        let base = slot * cba_width;
        let (weakest, _) = outputs.beam_hypotheses.normed_scores_cba[base..base + cba_width]
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
            .expect("cba is non-empty when full");
        weakest
    };

    let base = slot * cba_width;
    outputs.beam_hypotheses.cum_log_probs_cba[base + entry] = cum_log_prob;
    outputs.beam_hypotheses.normed_scores_cba[base + entry] = normed;
    outputs.beam_hypotheses.seq_len_cba[base + entry] = path.len();
    let ids_base = (base + entry) * max_seq_len;
    for (i, &token) in path.iter().take(max_seq_len).enumerate() {
        outputs.beam_hypotheses.output_ids_cba[ids_base + i] = token;
    }

    let count = outputs.beam_hypotheses.num_beams[slot];
    outputs.beam_hypotheses.min_normed_scores[slot] = outputs.beam_hypotheses.normed_scores_cba
        [base..base + count]
        .iter()
        .copied()
        .fold(f32::MAX, f32::min);
}

impl DecoderLayer for BeamSearchLayer {
    fn name(&self) -> &'static str {
        "beam_search"
    }

    fn setup(
        &mut self,
        batch_size: usize,
        beam_width: usize,
        batch_slots: &[usize],
        config: &SamplingConfig,
    ) -> Result<()> {
        if beam_width < 2 {
            return Err(DecodeError::InvalidArgument(format!(
                "beam search requires beam width > 1, got {beam_width}"
            )));
        }
        if beam_width > self.domain.max_beam_width {
            return Err(DecodeError::InvalidArgument(format!(
                "beam width {beam_width} exceeds max {}",
                self.domain.max_beam_width
            )));
        }
        for i in 0..batch_size {
            let slot = batch_slots[i];
            self.diversity_rate[slot] =
                column(&config.beam_search_diversity_rate, i, defaults::DIVERSITY_RATE);
            self.length_penalty[slot] =
                column(&config.length_penalty, i, defaults::LENGTH_PENALTY);
            self.early_stopping[slot] =
                column(&config.early_stopping, i, defaults::EARLY_STOPPING);
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
        let cba_width = 2 * beam_width;
        let vocab = self.domain.vocab_size;

        for bi in 0..inputs.batch_size {
            let slot = inputs.batch_slots[bi];
            if outputs.beam_hypotheses.is_done[slot] {
                continue;
            }
            let input_len = inputs.input_lengths.get(slot).copied().unwrap_or(0);
            let seq_len = outputs.sequence_lengths[outputs.bb(slot, 0)];
            let diversity_rate = self.diversity_rate[slot];
            let length_penalty = self.length_penalty[slot];

            // Gather 2B best candidates per beam, then merge across beams.
            let mut candidates: Vec<Candidate> = Vec::with_capacity(beam_width * cba_width);
            for beam in 0..beam_width {
                if outputs.finished[outputs.bb(slot, beam)].is_finished() {
                    continue;
                }
                let log_probs = log_softmax(&workspace.logits_row(bi, 0, beam)[..vocab]);
                let beam_cum = outputs.cum_log_probs[outputs.bb(slot, beam)];
                let mut beam_candidates: Vec<Candidate> = log_probs
                    .iter()
                    .enumerate()
                    .map(|(token, &lp)| Candidate {
                        token: token as TokenId,
                        parent_beam: beam,
                        cum_log_prob: beam_cum + lp,
                        token_log_prob: lp,
                        adjusted: beam_cum + lp - diversity_rate * beam as f32,
                    })
                    .collect();
                beam_candidates.sort_unstable_by(|a, b| {
                    b.adjusted
                        .partial_cmp(&a.adjusted)
                        .unwrap_or(Ordering::Equal)
                });
                beam_candidates.truncate(cba_width);
                candidates.extend(beam_candidates);
            }
            candidates.sort_by(|a, b| {
                b.adjusted
                    .partial_cmp(&a.adjusted)
                    .unwrap_or(Ordering::Equal)
                    .then(a.parent_beam.cmp(&b.parent_beam))
                    .then(a.token.cmp(&b.token))
            });
            candidates.truncate(cba_width);
            if candidates.is_empty() {
                continue;
            }

            // Split ended candidates into the CBA; keep the first
            // beam_width live ones as the next beam set.
            let mut next_beams: Vec<Candidate> = Vec::with_capacity(beam_width);
            for cand in &candidates {
                if cand.token == inputs.end_ids[slot] {
                    let path =
                        reconstruct_path(outputs, slot, cand.parent_beam, seq_len, input_len);
                    let hyp_len = seq_len - input_len + 1;
                    let normed = normed_score(cand.cum_log_prob, hyp_len, length_penalty);
                    insert_into_cba(outputs, slot, &path, cand.cum_log_prob, normed);
                } else if next_beams.len() < beam_width {
                    next_beams.push(*cand);
                }
            }

            // Commit the surviving beams in rank order.
            for (nb, cand) in next_beams.iter().enumerate() {
                let at = outputs.bbs(slot, nb, seq_len);
                outputs.output_ids[at] = cand.token;
                outputs.parent_ids[at] = cand.parent_beam;
                outputs.log_probs[at] = cand.token_log_prob;
                let nt = outputs.token_idx(0, slot, nb);
                outputs.new_tokens[nt] = cand.token;
                let idx = outputs.bb(slot, nb);
                outputs.cum_log_probs[idx] = cand.cum_log_prob;
            }
            for beam in 0..beam_width {
                let idx = outputs.bb(slot, beam);
                if beam < next_beams.len() {
                    outputs.sequence_lengths[idx] = seq_len + 1;
                } else {
                    outputs.finished[idx].set_finished_eos();
                }
            }

            self.update_done(outputs, slot, beam_width, seq_len + 1, input_len);
        }
        Ok(())
    }

    fn workspace_size(&self) -> usize {
        self.domain.max_batch_size
            * self.domain.max_beam_width
            * self.domain.vocab_size_padded
            * std::mem::size_of::<f32>()
    }
}

impl BeamSearchLayer {
    fn update_done(
        &self,
        outputs: &mut DecodingOutput,
        slot: usize,
        beam_width: usize,
        seq_len: usize,
        input_len: usize,
    ) {
        let num_finished = outputs.beam_hypotheses.num_beams[slot];
        let done = match self.early_stopping[slot] {
            EarlyStopping::Never => false,
            EarlyStopping::Always => num_finished >= beam_width,
            EarlyStopping::Once => {
                if num_finished < beam_width {
                    false
                } else {
                    // The best a live beam could still reach: its current
                    // cumulative score at the current hypothesis length.
                    let hyp_len = seq_len - input_len + 1;
                    let best_live = (0..beam_width)
                        .filter(|&b| !outputs.finished[outputs.bb(slot, b)].is_finished())
                        .map(|b| {
                            normed_score(
                                outputs.cum_log_probs[outputs.bb(slot, b)],
                                hyp_len,
                                self.length_penalty[slot],
                            )
                        })
                        .fold(f32::NEG_INFINITY, f32::max);
                    best_live <= outputs.beam_hypotheses.min_normed_scores[slot]
                }
            }
        };
        if done {
            outputs.beam_hypotheses.is_done[slot] = true;
            for beam in 0..beam_width {
                let idx = outputs.bb(slot, beam);
                outputs.finished[idx].set_finished_eos();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    const VOCAB: usize = 8;
    const END_ID: TokenId = 7;

    fn domain() -> DecoderDomain {
        DecoderDomain::new(2, 2, VOCAB)
    }

    /// Seed a slot the way the decoder façade does: prompt in every beam
    /// row, beam 0 live, other beams suppressed.
    fn seed_prompt(out: &mut DecodingOutput, slot: usize, prompt: &[TokenId]) {
        for beam in 0..2 {
            for (i, &t) in prompt.iter().enumerate() {
                let at = out.bbs(slot, beam, i);
                out.output_ids[at] = t;
            }
            let idx = out.bb(slot, beam);
            out.sequence_lengths[idx] = prompt.len();
            out.cum_log_probs[idx] = if beam == 0 { 0.0 } else { -1e20 };
        }
    }

    fn step(
        layer: &mut BeamSearchLayer,
        out: &mut DecodingOutput,
        rows: Vec<Vec<f32>>,
        input_len: usize,
    ) {
        let mut inputs = DecodingInput::new(vec![0], vec![END_ID, END_ID], 16);
        inputs.input_lengths = vec![input_len, input_len];
        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        inputs.logits = Some(Tensor::from_vec(flat, (1, 1, 2, VOCAB), &Device::Cpu).unwrap());
        let mut ws = DecodeWorkspace::new(&domain());
        ws.prepare(1, 2);
        let t = inputs.logits.as_ref().unwrap();
        let flat: Vec<f32> = t.flatten_all().unwrap().to_vec1().unwrap();
        ws.logits_row_mut(0, 0, 0).copy_from_slice(&flat[..VOCAB]);
        ws.logits_row_mut(0, 0, 1).copy_from_slice(&flat[VOCAB..]);
        layer.forward(out, &inputs, &mut ws).unwrap();
    }

    fn setup_layer() -> BeamSearchLayer {
        let mut layer = BeamSearchLayer::new(&domain());
        let config = SamplingConfig {
            beam_width: 2,
            length_penalty: Some(vec![1.0]),
            early_stopping: Some(vec![EarlyStopping::Never]),
            ..Default::default()
        };
        layer.setup(1, 2, &[0], &config).unwrap();
        layer
    }

    fn spiked(tokens: &[(usize, f32)]) -> Vec<f32> {
        let mut row = vec![-20.0f32; VOCAB];
        for &(t, v) in tokens {
            row[t] = v;
        }
        row
    }

    #[test]
    fn first_step_expands_only_live_beam() {
        let mut layer = setup_layer();
        let mut out = DecodingOutput::new(&domain(), 16);
        seed_prompt(&mut out, 0, &[1]);

        // Beam 0 prefers tokens 2 then 3; beam 1 is suppressed by -1e20.
        step(
            &mut layer,
            &mut out,
            vec![spiked(&[(2, 5.0), (3, 4.0)]), spiked(&[(4, 9.0)])],
            1,
        );
        assert_eq!(out.output_ids[out.bbs(0, 0, 1)], 2);
        assert_eq!(out.output_ids[out.bbs(0, 1, 1)], 3);
        assert_eq!(out.parent_ids[out.bbs(0, 0, 1)], 0);
        assert_eq!(out.parent_ids[out.bbs(0, 1, 1)], 0);
        assert_eq!(out.sequence_lengths[out.bb(0, 0)], 2);
    }

    #[test]
    fn cum_log_probs_are_monotone_in_parent() {
        let mut layer = setup_layer();
        let mut out = DecodingOutput::new(&domain(), 16);
        seed_prompt(&mut out, 0, &[1]);
        step(
            &mut layer,
            &mut out,
            vec![spiked(&[(2, 5.0), (3, 4.0)]), spiked(&[(4, 9.0)])],
            1,
        );
        let parent_cum = [
            out.cum_log_probs[out.bb(0, 0)],
            out.cum_log_probs[out.bb(0, 1)],
        ];
        step(
            &mut layer,
            &mut out,
            vec![spiked(&[(5, 3.0)]), spiked(&[(6, 2.0)])],
            1,
        );
        for beam in 0..2 {
            let parent = out.parent_ids[out.bbs(0, beam, 2)];
            assert!(out.cum_log_probs[out.bb(0, beam)] <= parent_cum[parent]);
        }
    }

    #[test]
    fn end_id_candidate_enters_cba_and_other_beam_continues() {
        let mut layer = setup_layer();
        let mut out = DecodingOutput::new(&domain(), 16);
        seed_prompt(&mut out, 0, &[1]);
        step(
            &mut layer,
            &mut out,
            vec![spiked(&[(2, 5.0), (3, 4.0)]), spiked(&[(4, 9.0)])],
            1,
        );

        // Beam 0 now overwhelmingly selects the end id; beam 1 keeps going.
        step(
            &mut layer,
            &mut out,
            vec![spiked(&[(END_ID as usize, 9.0), (5, 1.0)]), spiked(&[(6, 8.0), (5, 7.0)])],
            1,
        );
        assert_eq!(out.beam_hypotheses.num_beams[0], 1);
        let normed = out.beam_hypotheses.normed_scores_cba[0];
        let cum = out.beam_hypotheses.cum_log_probs_cba[0];
        // Hypothesis length is 2 generated tokens, length penalty 1.
        assert!((normed - cum / 2.0).abs() < 1e-5);
        assert!((out.beam_hypotheses.min_normed_scores[0] - normed).abs() < 1e-6);
        // The stored path is prompt + the token beam 0 chose at step 1.
        assert_eq!(&out.beam_hypotheses.output_ids_cba[..2], &[1, 2]);
        assert_eq!(out.beam_hypotheses.seq_len_cba[0], 2);
        // Live beams advanced to length 3.
        assert_eq!(out.sequence_lengths[out.bb(0, 0)], 3);
    }

    #[test]
    fn cba_capacity_is_bounded_and_displaces_weakest() {
        let domain = domain();
        let mut out = DecodingOutput::new(&domain, 16);
        // Fill the CBA (width 4) with scores 0,-1,-2,-3.
        for i in 0..4 {
            insert_into_cba(&mut out, 0, &[1], -(i as f32), -(i as f32));
        }
        assert_eq!(out.beam_hypotheses.num_beams[0], 4);
        assert_eq!(out.beam_hypotheses.min_normed_scores[0], -3.0);

        // A worse entry is dropped.
        insert_into_cba(&mut out, 0, &[2], -9.0, -9.0);
        assert_eq!(out.beam_hypotheses.num_beams[0], 4);
        assert_eq!(out.beam_hypotheses.min_normed_scores[0], -3.0);

        // A better entry displaces the weakest.
        insert_into_cba(&mut out, 0, &[3], -0.5, -0.5);
        assert_eq!(out.beam_hypotheses.num_beams[0], 4);
        assert_eq!(out.beam_hypotheses.min_normed_scores[0], -2.0);
    }

    #[test]
    fn early_stopping_always_stops_at_beam_width_hypotheses() {
        let mut layer = BeamSearchLayer::new(&domain());
        let config = SamplingConfig {
            beam_width: 2,
            early_stopping: Some(vec![EarlyStopping::Always]),
            ..Default::default()
        };
        layer.setup(1, 2, &[0], &config).unwrap();
        let mut out = DecodingOutput::new(&domain(), 16);
        seed_prompt(&mut out, 0, &[1]);
        step(
            &mut layer,
            &mut out,
            vec![spiked(&[(2, 5.0), (3, 4.0)]), spiked(&[(4, 9.0)])],
            1,
        );
        // Both top candidates pick the end id: two hypotheses, slot done.
        step(
            &mut layer,
            &mut out,
            vec![spiked(&[(END_ID as usize, 9.0)]), spiked(&[(END_ID as usize, 9.0)])],
            1,
        );
        assert!(out.beam_hypotheses.is_done[0]);
        assert!(out.finished[out.bb(0, 0)].is_finished());
        assert!(out.finished[out.bb(0, 1)].is_finished());

        // Sticky: a further step is a no-op.
        let lengths_before = out.sequence_lengths.clone();
        step(
            &mut layer,
            &mut out,
            vec![spiked(&[(2, 5.0)]), spiked(&[(2, 5.0)])],
            1,
        );
        assert_eq!(out.sequence_lengths, lengths_before);
    }

    #[test]
    fn normed_score_zero_penalty_is_identity() {
        assert_eq!(normed_score(-4.0, 5, 0.0), -4.0);
        assert!((normed_score(-4.0, 2, 1.0) + 2.0).abs() < 1e-6);
        assert!((normed_score(-4.0, 4, 0.5) + 2.0).abs() < 1e-6);
    }

    #[test]
    fn reconstruct_path_follows_parent_pointers() {
        let domain = domain();
        let mut out = DecodingOutput::new(&domain, 16);
        seed_prompt(&mut out, 0, &[9]);
        // Step 1: beam0 token 2 (parent 0), beam1 token 3 (parent 0).
        let at = out.bbs(0, 0, 1);
        out.output_ids[at] = 2;
        out.parent_ids[at] = 0;
        let at = out.bbs(0, 1, 1);
        out.output_ids[at] = 3;
        out.parent_ids[at] = 0;
        // Step 2: beam0 token 4 with parent 1 (crossover).
        let at = out.bbs(0, 0, 2);
        out.output_ids[at] = 4;
        out.parent_ids[at] = 1;

        let path = reconstruct_path(&out, 0, 0, 3, 1);
        assert_eq!(path, vec![9, 3, 4]);
    }
}
