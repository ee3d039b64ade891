//! Beam-search finalization.
//!
//! Reconstructs finished hypotheses from parent pointers, folds still-live
//! beams into the candidate array, and emits the best `beam_width` per slot.
//! Works on a copy of the candidate state, so repeated calls with unchanged
//! inputs produce identical results.

use std::cmp::Ordering;

use super::beam::{insert_into_cba, normed_score, reconstruct_path};
use super::io::DecodingOutput;
use crate::error::{DecodeError, Result};
use crate::kv_cache::TokenId;

/// Emit `final_output_ids[slot, beam, max_seq_len]`, best hypothesis first,
/// padded with the slot's end id.
///
/// `length_penalty` is a per-slot column, matching the values the beam layer
/// scored with.
pub fn gather_tree(
    final_output_ids: &mut [TokenId],
    outputs: &DecodingOutput,
    end_ids: &[TokenId],
    input_lengths: &[usize],
    length_penalty: &[f32],
    beam_width: usize,
) -> Result<()> {
    if beam_width <= 1 {
        return Err(DecodeError::InvalidArgument(
            "gather_tree is only needed for beam search".into(),
        ));
    }
    let max_seq_len = outputs.max_seq_len;
    let expected = outputs.max_batch_size * beam_width * max_seq_len;
    if final_output_ids.len() != expected {
        return Err(DecodeError::InvalidArgument(format!(
            "final_output_ids length {} does not match [batch {} x beam {} x len {}]",
            final_output_ids.len(),
            outputs.max_batch_size,
            beam_width,
            max_seq_len
        )));
    }

    // Idempotence: live-path insertion happens on a scratch copy.
    let mut scratch = DecodingOutput {
        beam_hypotheses: outputs.beam_hypotheses.clone(),
        ..scratch_shell(outputs)
    };

    for slot in 0..outputs.max_batch_size {
        let end_id = end_ids.get(slot).copied().unwrap_or(0);
        let input_len = input_lengths.get(slot).copied().unwrap_or(0);
        let lp = length_penalty.get(slot).copied().unwrap_or(0.0);

        // Fold unfinished beams in unless the slot already closed its CBA.
        if !scratch.beam_hypotheses.is_done[slot] {
            for beam in 0..beam_width {
                let seq_len = outputs.sequence_lengths[outputs.bb(slot, beam)];
                if seq_len == 0 {
                    continue;
                }
                let cum = outputs.cum_log_probs[outputs.bb(slot, beam)];
                let hyp_len = seq_len.saturating_sub(input_len).max(1);
                let normed = normed_score(cum, hyp_len, lp);
                let path = reconstruct_path(outputs, slot, beam, seq_len, input_len);
                insert_into_cba(&mut scratch, slot, &path, cum, normed);
            }
        }

        // Rank stored hypotheses; ties resolve to the lower CBA index.
        let cba_width = scratch.beam_hypotheses.cba_width();
        let base = slot * cba_width;
        let count = scratch.beam_hypotheses.num_beams[slot];
        let mut order: Vec<usize> = (0..count).collect();
        order.sort_by(|&a, &b| {
            scratch.beam_hypotheses.normed_scores_cba[base + b]
                .partial_cmp(&scratch.beam_hypotheses.normed_scores_cba[base + a])
                .unwrap_or(Ordering::Equal)
                .then(a.cmp(&b))
        });

        for out_beam in 0..beam_width {
            let dst = (slot * beam_width + out_beam) * max_seq_len;
            let row = &mut final_output_ids[dst..dst + max_seq_len];
            row.fill(end_id);
            if let Some(&entry) = order.get(out_beam) {
                let len = scratch.beam_hypotheses.seq_len_cba[base + entry].min(max_seq_len);
                let src = (base + entry) * max_seq_len;
                row[..len]
                    .copy_from_slice(&scratch.beam_hypotheses.output_ids_cba[src..src + len]);
            }
        }
    }
    Ok(())
}

/// Empty output shell reusing the source's geometry; only the beam
/// hypotheses field is consulted by `insert_into_cba`.
fn scratch_shell(outputs: &DecodingOutput) -> DecodingOutput {
    use crate::config::DecoderDomain;
    let domain = DecoderDomain::new(outputs.max_batch_size, outputs.max_beam_width, 1)
        .with_max_decoding_tokens(outputs.max_decoding_tokens);
    DecodingOutput::new(&domain, outputs.max_seq_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecoderDomain;

    const END_ID: TokenId = 7;

    fn outputs_with_two_live_beams() -> DecodingOutput {
        let domain = DecoderDomain::new(1, 2, 8);
        let mut out = DecodingOutput::new(&domain, 8);
        // Prompt [9] in both rows; two generated steps with a crossover.
        for beam in 0..2 {
            let at = out.bbs(0, beam, 0);
            out.output_ids[at] = 9;
        }
        let at = out.bbs(0, 0, 1);
        out.output_ids[at] = 2;
        out.parent_ids[at] = 0;
        let at = out.bbs(0, 1, 1);
        out.output_ids[at] = 3;
        out.parent_ids[at] = 0;
        let at = out.bbs(0, 0, 2);
        out.output_ids[at] = 4;
        out.parent_ids[at] = 1;
        let at = out.bbs(0, 1, 2);
        out.output_ids[at] = 5;
        out.parent_ids[at] = 0;
        for beam in 0..2 {
            let idx = out.bb(0, beam);
            out.sequence_lengths[idx] = 3;
        }
        let idx = out.bb(0, 0);
        out.cum_log_probs[idx] = -1.0;
        let idx = out.bb(0, 1);
        out.cum_log_probs[idx] = -2.0;
        out
    }

    fn finalize(out: &DecodingOutput) -> Vec<TokenId> {
        let mut final_ids = vec![0; 2 * out.max_seq_len];
        gather_tree(&mut final_ids, out, &[END_ID], &[1], &[0.0], 2).unwrap();
        final_ids
    }

    #[test]
    fn live_beams_are_reconstructed_through_parents() {
        let out = outputs_with_two_live_beams();
        let final_ids = finalize(&out);
        // Best beam (cum -1.0) followed the crossover: 9, 3, 4.
        assert_eq!(&final_ids[..3], &[9, 3, 4]);
        // Second best: 9, 2, 5.
        assert_eq!(&final_ids[8..11], &[9, 2, 5]);
        // Padding is the end id.
        assert!(final_ids[3..8].iter().all(|&t| t == END_ID));
    }

    #[test]
    fn gather_tree_is_idempotent() {
        let out = outputs_with_two_live_beams();
        let first = finalize(&out);
        let second = finalize(&out);
        assert_eq!(first, second);
        // Source CBA was not mutated.
        assert_eq!(out.beam_hypotheses.num_beams[0], 0);
    }

    #[test]
    fn stored_hypotheses_outrank_worse_live_beams() {
        let mut out = outputs_with_two_live_beams();
        // A finished hypothesis with a strong score sits in the CBA.
        insert_into_cba(&mut out, 0, &[9, 6], -0.1, -0.1);
        let final_ids = finalize(&out);
        assert_eq!(&final_ids[..2], &[9, 6]);
        assert_eq!(final_ids[2], END_ID);
    }

    #[test]
    fn beam_width_one_is_rejected() {
        let out = outputs_with_two_live_beams();
        let mut final_ids = vec![0; out.max_seq_len];
        let err =
            gather_tree(&mut final_ids, &out, &[END_ID], &[1], &[0.0], 1).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidArgument(_)));
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let out = outputs_with_two_live_beams();
        let mut final_ids = vec![0; 3];
        assert!(gather_tree(&mut final_ids, &out, &[END_ID], &[1], &[0.0], 2).is_err());
    }
}
