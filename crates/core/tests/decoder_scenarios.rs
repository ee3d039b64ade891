//! End-to-end decoding scenarios over the public API: decoder pipeline,
//! beam finalization, speculative acceptance, and KV cache lifecycle.

use candle_core::{DType, Device, Tensor};

use turbine_core::config::{DecoderDomain, DecodingMode, KvCacheConfig, SamplingConfig};
use turbine_core::decode::{DecodingInput, DecodingOutput, FinishedState};
use turbine_core::decoder::Decoder;
use turbine_core::kv_cache::{KVCacheManager, TokenId};

const VOCAB: usize = 8;
const END_ID: TokenId = 7;

fn spiked_logits(pairs: &[(usize, f32)]) -> Vec<f32> {
    let mut row = vec![-20.0f32; VOCAB];
    for &(t, v) in pairs {
        row[t] = v;
    }
    row
}

fn single_row_tensor(row: Vec<f32>) -> Tensor {
    Tensor::from_vec(row, (1, 1, 1, VOCAB), &Device::Cpu).unwrap()
}

fn cache_manager(primary: usize, reuse: bool, max_window: usize, sink: usize) -> KVCacheManager {
    let config = KvCacheConfig {
        blocks_in_primary_pool: primary,
        blocks_in_secondary_pool: 0,
        tokens_per_block: 4,
        enable_block_reuse: reuse,
        use_uvm: false,
        onboard_blocks: true,
    };
    KVCacheManager::new(
        &config,
        2,
        8,
        4,
        2,
        max_window,
        sink,
        false,
        DType::F32,
        &Device::Cpu,
    )
    .unwrap()
}

// Scenario S1: greedy decode runs to max length with argmax token 5.
#[test]
fn greedy_argmax_decodes_to_max_length() {
    let domain = DecoderDomain::new(1, 1, VOCAB);
    let mut decoder = Decoder::new(DecodingMode::TopKTopP, domain, 16);
    decoder.setup(&SamplingConfig::greedy(), 1, &[0]).unwrap();

    let mut outputs = DecodingOutput::new(&domain, 16);
    decoder.new_request(&mut outputs, 0, &[1, 2, 3]).unwrap();

    let mut kv = cache_manager(16, false, 64, 0);
    kv.add_sequence(0, 3, 1, None).unwrap();

    let mut inputs = DecodingInput::new(vec![0], vec![END_ID], 6);
    inputs.input_lengths = vec![3];

    let mut done = false;
    for step in 0..6 {
        inputs.step = step;
        inputs.logits = Some(single_row_tensor(spiked_logits(&[(5, 9.0)])));
        done = decoder.forward(&mut outputs, &inputs).unwrap();
        kv.add_token(0).unwrap();
        if done {
            break;
        }
    }
    assert!(done);
    assert_eq!(outputs.ids_so_far(0, 0), &[1, 2, 3, 5, 5, 5]);
    assert!(outputs.finished[outputs.bb(0, 0)].is_finished_max_length());
}

// Scenario S2: an identical full-block prompt is fully prepopulated and
// allocates no additional prompt blocks.
#[test]
fn identical_prompt_reuses_cached_blocks() {
    let mut kv = cache_manager(16, true, 64, 0);
    let prompt: Vec<TokenId> = vec![1, 2, 3, 4];

    kv.add_sequence(0, 4, 1, Some(&prompt)).unwrap();
    let blocks_after_first = kv.used_num_blocks();
    kv.remove_sequence(0, Some(&prompt)).unwrap();

    kv.add_sequence(1, 4, 1, Some(&prompt)).unwrap();
    assert_eq!(kv.num_prepopulated_tokens(1, 0), 4);
    assert_eq!(kv.used_num_blocks(), blocks_after_first);
    assert_eq!(kv.block_manager().stats().reused_blocks, 1);
}

// Scenario S3: freed blocks are taken from the front of the queue before
// untouched ones, and the pool never spills while capacity remains.
#[test]
fn freed_blocks_are_reassigned_front_of_queue() {
    let mut kv = cache_manager(3, false, 64, 0);

    kv.add_sequence(0, 8, 1, None).unwrap(); // R1: blocks 0, 1
    kv.add_sequence(1, 4, 1, None).unwrap(); // R2: block 2
    assert_eq!(kv.num_free_blocks(), 0);

    kv.remove_sequence(0, None).unwrap();
    kv.add_sequence(2, 8, 1, None).unwrap(); // R3 takes R1's blocks
    assert_eq!(kv.num_free_blocks(), 0);
    assert_eq!(kv.used_num_blocks(), 3);
}

// Scenario S4: an end-id candidate on beam 0 completes a hypothesis with a
// length-normalized score while beam 1 continues.
#[test]
fn beam_end_id_moves_into_candidate_array() {
    let domain = DecoderDomain::new(1, 2, VOCAB);
    let mut decoder = Decoder::new(DecodingMode::BeamSearch, domain, 16);
    let config = SamplingConfig {
        beam_width: 2,
        length_penalty: Some(vec![1.0]),
        early_stopping: Some(vec![turbine_core::EarlyStopping::Never]),
        ..Default::default()
    };
    decoder.setup(&config, 1, &[0]).unwrap();

    let mut outputs = DecodingOutput::new(&domain, 16);
    decoder.new_request(&mut outputs, 0, &[1]).unwrap();

    let mut inputs = DecodingInput::new(vec![0], vec![END_ID], 16);
    inputs.input_lengths = vec![1];

    let beam_rows = |rows: [Vec<f32>; 2]| {
        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        Tensor::from_vec(flat, (1, 1, 2, VOCAB), &Device::Cpu).unwrap()
    };

    // Step 1: beam 0 takes token 2, beam 1 forks to token 3.
    inputs.logits = Some(beam_rows([
        spiked_logits(&[(2, 5.0), (3, 4.0)]),
        spiked_logits(&[(4, 9.0)]),
    ]));
    decoder.forward(&mut outputs, &inputs).unwrap();

    // Step 2: beam 0 selects the end id.
    inputs.step = 1;
    inputs.logits = Some(beam_rows([
        spiked_logits(&[(END_ID as usize, 9.0), (5, 1.0)]),
        spiked_logits(&[(6, 8.0), (5, 7.0)]),
    ]));
    decoder.forward(&mut outputs, &inputs).unwrap();

    assert_eq!(outputs.beam_hypotheses.num_beams[0], 1);
    let cum = outputs.beam_hypotheses.cum_log_probs_cba[0];
    let normed = outputs.beam_hypotheses.normed_scores_cba[0];
    assert!((normed - cum / 2.0).abs() < 1e-5);
    // Live beams continue past the finished hypothesis.
    assert_eq!(outputs.sequence_lengths[outputs.bb(0, 0)], 3);
    assert!(!outputs.beam_hypotheses.is_done[0]);
}

// Scenario S5: speculative acceptance by ids accepts the matching prefix
// and counts the target token at the mismatch.
#[test]
fn speculative_by_ids_accepts_prefix_plus_one() {
    let domain = DecoderDomain::new(1, 1, VOCAB).with_max_decoding_tokens(4);
    let mut decoder = Decoder::new(DecodingMode::TopKTopP, domain, 16);
    decoder.setup(&SamplingConfig::greedy(), 1, &[0]).unwrap();

    let context_len = 5;
    let mut target_tokens = vec![0; 16];
    target_tokens[context_len] = 3;
    target_tokens[context_len + 1] = 4;
    target_tokens[context_len + 2] = 9;
    let draft_tokens = vec![3, 4, 5];

    let mut sequence_lengths = vec![context_len];
    let finished_by_step = vec![FinishedState::empty(); 4];
    let mut finished_final = vec![FinishedState::empty()];

    decoder
        .accept_draft_tokens_by_ids(
            &target_tokens,
            &draft_tokens,
            3,
            &[context_len],
            &[3],
            &mut sequence_lengths,
            &finished_by_step,
            &mut finished_final,
            &[0],
        )
        .unwrap();

    // Accepted [3, 4], then the target's token 9.
    assert_eq!(sequence_lengths[0], context_len + 3);
    assert_eq!(target_tokens[context_len + 2], 9);
}

// Scenario S6 / property 7: the cyclic cache stops growing at the window
// and the sink prefix survives.
#[test]
fn cyclic_cache_wraps_and_preserves_sink() {
    let domain = DecoderDomain::new(1, 1, VOCAB);
    let mut decoder = Decoder::new(DecodingMode::TopKTopP, domain, 32);
    decoder.setup(&SamplingConfig::greedy(), 1, &[0]).unwrap();

    let mut outputs = DecodingOutput::new(&domain, 32);
    let sink: Vec<TokenId> = vec![1, 2, 3, 4];
    decoder.new_request(&mut outputs, 0, &sink).unwrap();

    // max_attention_window 8, sink 4, tokens_per_block 4.
    let mut kv = cache_manager(16, false, 8, 4);
    kv.add_sequence(0, 4, 1, None).unwrap();

    let mut inputs = DecodingInput::new(vec![0], vec![END_ID], 32);
    inputs.input_lengths = vec![4];
    for step in 0..16 {
        inputs.step = step;
        inputs.logits = Some(single_row_tensor(spiked_logits(&[(6, 9.0)])));
        decoder.forward(&mut outputs, &inputs).unwrap();
        kv.add_token(0).unwrap();
    }

    // Block count stabilized at (sink + window) / tokens_per_block.
    assert_eq!(kv.sequence_block_count(0, 0), 3);
    assert_eq!(kv.used_num_blocks(), 3);
    // The sink prefix is untouched.
    assert_eq!(&outputs.ids_so_far(0, 0)[..4], &[1, 2, 3, 4]);
}

// Property 1: block refcount conservation across arbitrary lifecycles.
#[test]
fn all_blocks_free_after_every_sequence_removed() {
    let mut kv = cache_manager(16, true, 64, 0);
    let prompt_a: Vec<TokenId> = (0..11).collect();
    let prompt_b: Vec<TokenId> = (0..8).collect();

    kv.add_sequence(0, 11, 1, Some(&prompt_a)).unwrap();
    kv.add_sequence(1, 8, 1, Some(&prompt_b)).unwrap();
    kv.add_sequence(2, 5, 2, None).unwrap();
    for _ in 0..6 {
        kv.add_token(0).unwrap();
    }
    kv.rewind_kv_cache(0, 2).unwrap();
    kv.remove_sequence(0, Some(&prompt_a)).unwrap();
    kv.remove_sequence(1, Some(&prompt_b)).unwrap();
    kv.remove_sequence(2, None).unwrap();

    assert_eq!(kv.num_free_blocks(), kv.max_num_blocks());
}

// Property 2: a shared prompt of length >= tokens_per_block prepopulates at
// least its full blocks.
#[test]
fn prefix_reuse_covers_all_full_blocks() {
    let mut kv = cache_manager(16, true, 64, 0);
    let prompt: Vec<TokenId> = (10..21).collect(); // 11 tokens, 2 full blocks

    kv.add_sequence(0, 11, 1, Some(&prompt)).unwrap();
    kv.remove_sequence(0, Some(&prompt)).unwrap();
    kv.add_sequence(1, 11, 1, Some(&prompt)).unwrap();

    let prepopulated = kv.num_prepopulated_tokens(1, 0);
    assert!(prepopulated >= (11 / 4) * 4);
}

// Property 3: identical seeds, logits, and slots give bit-identical outputs.
#[test]
fn stochastic_decoding_is_deterministic_per_seed() {
    let domain = DecoderDomain::new(1, 1, VOCAB);
    let config = SamplingConfig {
        beam_width: 1,
        random_seed: Some(vec![1234]),
        top_p: Some(vec![0.9]),
        temperature: Some(vec![1.3]),
        ..Default::default()
    };
    let logits = spiked_logits(&[(1, 2.0), (2, 1.8), (3, 1.6), (4, 1.4)]);

    let mut runs = Vec::new();
    for _ in 0..2 {
        let mut decoder = Decoder::new(DecodingMode::TopP, domain, 32);
        decoder.setup(&config, 1, &[0]).unwrap();
        let mut outputs = DecodingOutput::new(&domain, 32);
        decoder.new_request(&mut outputs, 0, &[]).unwrap();
        let mut inputs = DecodingInput::new(vec![0], vec![END_ID], 32);
        inputs.input_lengths = vec![0];
        for step in 0..10 {
            inputs.step = step;
            inputs.logits = Some(single_row_tensor(logits.clone()));
            decoder.forward(&mut outputs, &inputs).unwrap();
        }
        runs.push((
            outputs.ids_so_far(0, 0).to_vec(),
            outputs.cum_log_probs[outputs.bb(0, 0)],
        ));
    }
    assert_eq!(runs[0].0, runs[1].0);
    assert_eq!(runs[0].1.to_bits(), runs[1].1.to_bits());
}

// Property 5: terminal states are sticky and outputs stay frozen.
#[test]
fn finished_slot_outputs_are_immutable() {
    let domain = DecoderDomain::new(1, 1, VOCAB);
    let mut decoder = Decoder::new(DecodingMode::TopKTopP, domain, 16);
    decoder.setup(&SamplingConfig::greedy(), 1, &[0]).unwrap();
    let mut outputs = DecodingOutput::new(&domain, 16);
    decoder.new_request(&mut outputs, 0, &[2]).unwrap();

    let mut inputs = DecodingInput::new(vec![0], vec![END_ID], 16);
    inputs.input_lengths = vec![1];
    inputs.logits = Some(single_row_tensor(spiked_logits(&[(END_ID as usize, 9.0)])));
    decoder.forward(&mut outputs, &inputs).unwrap();
    assert!(outputs.finished[outputs.bb(0, 0)].is_finished_eos());
    let frozen = outputs.ids_so_far(0, 0).to_vec();
    let frozen_len = outputs.sequence_lengths[outputs.bb(0, 0)];

    for step in 1..4 {
        inputs.step = step;
        inputs.logits = Some(single_row_tensor(spiked_logits(&[(1, 9.0)])));
        let done = decoder.forward(&mut outputs, &inputs).unwrap();
        assert!(done);
    }
    assert_eq!(outputs.ids_so_far(0, 0), frozen.as_slice());
    assert_eq!(outputs.sequence_lengths[outputs.bb(0, 0)], frozen_len);
}

// Property 6: gather_tree is idempotent over unchanged inputs.
#[test]
fn gather_tree_twice_gives_identical_finals() {
    let domain = DecoderDomain::new(1, 2, VOCAB);
    let mut decoder = Decoder::new(DecodingMode::BeamSearch, domain, 16);
    let config = SamplingConfig {
        beam_width: 2,
        length_penalty: Some(vec![0.0]),
        ..Default::default()
    };
    decoder.setup(&config, 1, &[0]).unwrap();

    let mut outputs = DecodingOutput::new(&domain, 16);
    decoder.new_request(&mut outputs, 0, &[1]).unwrap();
    let mut inputs = DecodingInput::new(vec![0], vec![END_ID], 16);
    inputs.input_lengths = vec![1];

    let beam_rows = |rows: [Vec<f32>; 2]| {
        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        Tensor::from_vec(flat, (1, 1, 2, VOCAB), &Device::Cpu).unwrap()
    };
    for step in 0..3 {
        inputs.step = step;
        inputs.logits = Some(beam_rows([
            spiked_logits(&[(2, 3.0), (3, 2.5)]),
            spiked_logits(&[(4, 3.0), (5, 2.5)]),
        ]));
        decoder.forward(&mut outputs, &inputs).unwrap();
    }

    let mut first = vec![0; 2 * 16];
    decoder.gather_tree(&mut first, &outputs, &inputs).unwrap();
    let mut second = vec![0; 2 * 16];
    decoder.gather_tree(&mut second, &outputs, &inputs).unwrap();
    assert_eq!(first, second);
    // Both emitted hypotheses start with the prompt.
    assert_eq!(first[0], 1);
    assert_eq!(first[16], 1);
}

// Beam monotonicity (property 4): each step's cumulative log-prob never
// exceeds its parent's.
#[test]
fn beam_scores_never_increase_along_paths() {
    let domain = DecoderDomain::new(1, 2, VOCAB);
    let mut decoder = Decoder::new(DecodingMode::BeamSearch, domain, 16);
    let config = SamplingConfig {
        beam_width: 2,
        early_stopping: Some(vec![turbine_core::EarlyStopping::Never]),
        ..Default::default()
    };
    decoder.setup(&config, 1, &[0]).unwrap();
    let mut outputs = DecodingOutput::new(&domain, 16);
    decoder.new_request(&mut outputs, 0, &[1]).unwrap();
    let mut inputs = DecodingInput::new(vec![0], vec![END_ID], 16);
    inputs.input_lengths = vec![1];

    let beam_rows = |rows: [Vec<f32>; 2]| {
        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        Tensor::from_vec(flat, (1, 1, 2, VOCAB), &Device::Cpu).unwrap()
    };
    let mut prev = [0.0f32, 0.0];
    for step in 0..4 {
        inputs.step = step;
        inputs.logits = Some(beam_rows([
            spiked_logits(&[(2, 3.0), (3, 2.0), (4, 1.0)]),
            spiked_logits(&[(5, 3.0), (6, 2.0), (2, 1.0)]),
        ]));
        decoder.forward(&mut outputs, &inputs).unwrap();
        for beam in 0..2 {
            let cum = outputs.cum_log_probs[outputs.bb(0, beam)];
            let seq_len = outputs.sequence_lengths[outputs.bb(0, beam)];
            let parent = outputs.parent_ids[outputs.bbs(0, beam, seq_len - 1)];
            if step > 0 {
                assert!(cum <= prev[parent] + 1e-5);
            }
        }
        prev = [
            outputs.cum_log_probs[outputs.bb(0, 0)],
            outputs.cum_log_probs[outputs.bb(0, 1)],
        ];
    }
}

// Sparse batch slots decode independently of their dense positions.
#[test]
fn batch_slot_indirection_reaches_sparse_slots() {
    let domain = DecoderDomain::new(4, 1, VOCAB);
    let mut decoder = Decoder::new(DecodingMode::TopKTopP, domain, 16);
    decoder.setup(&SamplingConfig::greedy(), 2, &[1, 3]).unwrap();

    let mut outputs = DecodingOutput::new(&domain, 16);
    decoder.new_request(&mut outputs, 1, &[5]).unwrap();
    decoder.new_request(&mut outputs, 3, &[6]).unwrap();

    let mut inputs = DecodingInput::new(vec![1, 3], vec![END_ID; 4], 16);
    inputs.input_lengths = vec![0, 1, 0, 1];
    let rows: Vec<f32> = [spiked_logits(&[(2, 9.0)]), spiked_logits(&[(3, 9.0)])]
        .into_iter()
        .flatten()
        .collect();
    inputs.logits = Some(Tensor::from_vec(rows, (2, 1, 1, VOCAB), &Device::Cpu).unwrap());
    decoder.forward(&mut outputs, &inputs).unwrap();

    assert_eq!(outputs.ids_so_far(1, 0), &[5, 2]);
    assert_eq!(outputs.ids_so_far(3, 0), &[6, 3]);
    // Slots 0 and 2 untouched.
    assert_eq!(outputs.sequence_lengths[outputs.bb(0, 0)], 0);
    assert_eq!(outputs.sequence_lengths[outputs.bb(2, 0)], 0);
}
