//! Dynamic decode pipeline: an ordered chain of stateful layers.
//!
//! Every layer implements the same three-operation contract: `setup`
//! installs per-slot parameters sized to the decoder domain, `forward`
//! transforms logits or produces tokens in place, `workspace_size`
//! pre-declares scratch. The chain is assembled once per decoding mode and
//! never changes afterwards.

mod beam;
mod draft_tree;
mod gather_tree;
mod io;
mod penalty;
mod sampling;
mod speculative;
mod stop_criteria;

pub use beam::BeamSearchLayer;
pub use draft_tree::{DraftTree, DraftTreeLayer};
pub use gather_tree::gather_tree;
pub use io::{
    BeamHypotheses, DecodingInput, DecodingOutput, FinishedState, SpeculativeInputs,
    SpeculativeOutputs, WordLists,
};
pub use penalty::PenaltyLayer;
pub use sampling::SamplingLayer;
pub use speculative::{
    accept_draft_tokens_by_ids, accept_draft_tokens_by_logits, DraftAcceptance,
};
pub use stop_criteria::{SlotState, StopCriteriaLayer};

use crate::config::{DecoderDomain, DecodingMode, SamplingConfig};
use crate::error::{DecodeError, Result};

/// Scratch shared along the layer chain for one step.
///
/// The penalty layer writes penalized logits here; samplers read them and
/// stage probabilities in `probs`. Rows are dense by batch index, laid out
/// `[batch, max_decoding_tokens, beam, vocab_padded]`.
pub struct DecodeWorkspace {
    pub logits: Vec<f32>,
    pub probs: Vec<f32>,
    batch_size: usize,
    beam_width: usize,
    max_decoding_tokens: usize,
    vocab_padded: usize,
}

impl DecodeWorkspace {
    pub fn new(domain: &DecoderDomain) -> Self {
        Self {
            logits: Vec::new(),
            probs: Vec::new(),
            batch_size: 0,
            beam_width: 1,
            max_decoding_tokens: domain.max_decoding_tokens,
            vocab_padded: domain.vocab_size_padded,
        }
    }

    /// Resize for the dense batch decoded this step.
    pub fn prepare(&mut self, batch_size: usize, beam_width: usize) {
        self.batch_size = batch_size;
        self.beam_width = beam_width;
        let elems = batch_size * self.max_decoding_tokens * beam_width * self.vocab_padded;
        self.logits.clear();
        self.logits.resize(elems, 0.0);
        self.probs.clear();
        self.probs.resize(elems, 0.0);
    }

    pub fn vocab_padded(&self) -> usize {
        self.vocab_padded
    }

    pub fn beam_width(&self) -> usize {
        self.beam_width
    }

    fn row_start(&self, batch_idx: usize, decoding_token: usize, beam: usize) -> usize {
        ((batch_idx * self.max_decoding_tokens + decoding_token) * self.beam_width + beam)
            * self.vocab_padded
    }

    pub fn logits_row(&self, batch_idx: usize, decoding_token: usize, beam: usize) -> &[f32] {
        let start = self.row_start(batch_idx, decoding_token, beam);
        &self.logits[start..start + self.vocab_padded]
    }

    pub fn logits_row_mut(
        &mut self,
        batch_idx: usize,
        decoding_token: usize,
        beam: usize,
    ) -> &mut [f32] {
        let start = self.row_start(batch_idx, decoding_token, beam);
        &mut self.logits[start..start + self.vocab_padded]
    }

    pub fn probs_row_mut(
        &mut self,
        batch_idx: usize,
        decoding_token: usize,
        beam: usize,
    ) -> &mut [f32] {
        let start = self.row_start(batch_idx, decoding_token, beam);
        &mut self.probs[start..start + self.vocab_padded]
    }

    /// Softmax `logits` row into the matching `probs` row.
    pub fn compute_probs(&mut self, batch_idx: usize, decoding_token: usize, beam: usize) {
        let start = self.row_start(batch_idx, decoding_token, beam);
        let end = start + self.vocab_padded;
        let (logits, probs) = (&self.logits[start..end], &mut self.probs[start..end]);
        probs.copy_from_slice(logits);
        softmax_in_place(probs);
    }
}

/// One stage of the decode chain.
pub trait DecoderLayer {
    /// Diagnostic name.
    fn name(&self) -> &'static str;

    /// Install per-slot parameters for the slots named in `batch_slots`.
    fn setup(
        &mut self,
        batch_size: usize,
        beam_width: usize,
        batch_slots: &[usize],
        config: &SamplingConfig,
    ) -> Result<()>;

    /// Transform logits or produce tokens for one step.
    fn forward(
        &mut self,
        outputs: &mut DecodingOutput,
        inputs: &DecodingInput,
        workspace: &mut DecodeWorkspace,
    ) -> Result<()>;

    /// Scratch requirement in bytes, pre-declared.
    fn workspace_size(&self) -> usize {
        0
    }
}

/// The assembled chain for one decoding mode.
pub struct DynamicDecodePipeline {
    mode: DecodingMode,
    layers: Vec<Box<dyn DecoderLayer>>,
    /// Memoized max of the layers' declared scratch; decoder-lifetime only.
    workspace_size: usize,
}

impl DynamicDecodePipeline {
    pub fn new(mode: DecodingMode, domain: &DecoderDomain, max_seq_len: usize) -> Self {
        assert!(
            mode != DecodingMode::Auto,
            "Auto must be resolved before pipeline construction"
        );
        let mut layers: Vec<Box<dyn DecoderLayer>> = Vec::new();
        layers.push(Box::new(PenaltyLayer::new(domain, max_seq_len)));
        match mode {
            DecodingMode::TopK
            | DecodingMode::TopP
            | DecodingMode::TopKTopP
            | DecodingMode::MinP => {
                layers.push(Box::new(SamplingLayer::new(domain, mode)));
            }
            DecodingMode::BeamSearch => {
                layers.push(Box::new(BeamSearchLayer::new(domain)));
            }
            DecodingMode::Medusa | DecodingMode::Eagle | DecodingMode::ExplicitDraftTokens => {
                layers.push(Box::new(DraftTreeLayer::new(domain)));
            }
            DecodingMode::Auto => unreachable!(),
        }
        layers.push(Box::new(StopCriteriaLayer::new(domain)));
        let workspace_size = layers.iter().map(|l| l.workspace_size()).max().unwrap_or(0);
        Self {
            mode,
            layers,
            workspace_size,
        }
    }

    pub fn mode(&self) -> DecodingMode {
        self.mode
    }

    pub fn layer_names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|l| l.name()).collect()
    }

    pub fn workspace_size(&self) -> usize {
        self.workspace_size
    }

    pub fn setup(
        &mut self,
        batch_size: usize,
        beam_width: usize,
        batch_slots: &[usize],
        config: &SamplingConfig,
    ) -> Result<()> {
        for layer in &mut self.layers {
            layer.setup(batch_size, beam_width, batch_slots, config)?;
        }
        Ok(())
    }

    pub fn forward(
        &mut self,
        outputs: &mut DecodingOutput,
        inputs: &DecodingInput,
        workspace: &mut DecodeWorkspace,
    ) -> Result<()> {
        validate_batch(inputs)?;
        for layer in &mut self.layers {
            layer.forward(outputs, inputs, workspace)?;
        }
        Ok(())
    }
}

fn validate_batch(inputs: &DecodingInput) -> Result<()> {
    if inputs.batch_slots.len() != inputs.batch_size {
        return Err(DecodeError::InvalidArgument(format!(
            "batch_slots length {} does not match batch size {}",
            inputs.batch_slots.len(),
            inputs.batch_size
        )));
    }
    if inputs.logits.is_none() && inputs.logits_vec.is_none() {
        return Err(DecodeError::InvalidArgument(
            "either logits or logits_vec must be provided".into(),
        ));
    }
    Ok(())
}

// ─── Shared numeric helpers ───────────────────────────────────────────────

pub(crate) fn softmax_in_place(row: &mut [f32]) {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return;
    }
    let mut sum = 0.0f32;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        let inv = 1.0 / sum;
        for v in row.iter_mut() {
            *v *= inv;
        }
    }
}

/// Numerically stable `log_softmax` of one row.
pub(crate) fn log_softmax(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_sum_ln = row.iter().map(|&x| (x - max).exp()).sum::<f32>().ln();
    row.iter().map(|&x| x - max - exp_sum_ln).collect()
}

pub(crate) fn argmax(row: &[f32]) -> usize {
    row.iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0)
}
