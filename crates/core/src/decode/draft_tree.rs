//! Draft-tree preparation for Explicit/Eagle-style decoding.
//!
//! A draft tree holds speculated tokens as nodes; node 0 is the last
//! accepted token. Preparation derives what the attention and verification
//! kernels consume: per-level top-K expansions, position offsets, ancestor
//! visibility masks packed as `u32` words of 32 tokens, and generation
//! lengths, all packed densely from possibly sparse batch slots.

use super::io::{DecodingInput, DecodingOutput, SpeculativeOutputs};
use super::{DecodeWorkspace, DecoderLayer};
use crate::config::{DecoderDomain, SamplingConfig};
use crate::error::{DecodeError, Result};
use crate::kv_cache::TokenId;

/// Speculation tree for one request.
///
/// Built from paths of node indices (root first); nodes shared by several
/// paths appear once.
#[derive(Debug, Clone)]
pub struct DraftTree {
    /// Parent of each node; `None` for the root.
    parents: Vec<Option<usize>>,
    /// Distance from the root.
    depths: Vec<usize>,
}

impl DraftTree {
    /// Build from path rows. Every path must start at node 0 and name each
    /// node after its parent; inconsistent parents are rejected.
    pub fn from_paths(paths: &[Vec<usize>]) -> Result<Self> {
        let num_nodes = paths
            .iter()
            .flat_map(|p| p.iter())
            .copied()
            .max()
            .map(|m| m + 1)
            .unwrap_or(0);
        let mut parents: Vec<Option<usize>> = vec![None; num_nodes];
        let mut seen = vec![false; num_nodes];
        if num_nodes > 0 {
            seen[0] = true;
        }
        for path in paths {
            if path.first() != Some(&0) {
                return Err(DecodeError::InvalidArgument(
                    "every draft path must start at the root node".into(),
                ));
            }
            for w in path.windows(2) {
                let (parent, child) = (w[0], w[1]);
                match parents[child] {
                    None if !seen[child] => {
                        parents[child] = Some(parent);
                        seen[child] = true;
                    }
                    Some(existing) if existing == parent => {}
                    None => {
                        return Err(DecodeError::InvalidArgument(format!(
                            "node {child} reached with conflicting parents"
                        )));
                    }
                    Some(existing) => {
                        return Err(DecodeError::InvalidArgument(format!(
                            "node {child} has parents {existing} and {parent}"
                        )));
                    }
                }
            }
        }
        let mut depths = vec![0; num_nodes];
        for node in 1..num_nodes {
            let mut depth = 0;
            let mut cursor = node;
            while let Some(parent) = parents[cursor] {
                depth += 1;
                cursor = parent;
            }
            depths[node] = depth;
        }
        Ok(Self { parents, depths })
    }

    pub fn num_nodes(&self) -> usize {
        self.parents.len()
    }

    pub fn depth(&self, node: usize) -> usize {
        self.depths[node]
    }

    /// Offset of each node's token relative to the sequence tail.
    pub fn position_offsets(&self) -> Vec<usize> {
        self.depths.clone()
    }

    /// Per-node visibility masks over all nodes: bit `j` of node `i`'s mask
    /// is set iff `j` is `i` itself or one of its ancestors. Packed as
    /// `u32` words, `ceil(num_nodes / 32)` words per node.
    pub fn packed_ancestor_masks(&self) -> Vec<u32> {
        let n = self.num_nodes();
        let words_per_node = n.div_ceil(32).max(1);
        let mut masks = vec![0u32; n * words_per_node];
        for node in 0..n {
            let base = node * words_per_node;
            let mut cursor = Some(node);
            while let Some(i) = cursor {
                masks[base + i / 32] |= 1 << (i % 32);
                cursor = self.parents[i];
            }
        }
        masks
    }

    pub fn mask_words_per_node(&self) -> usize {
        self.num_nodes().div_ceil(32).max(1)
    }
}

/// Highest-logit expansions per tree node.
///
/// `node_logits[i]` holds the scoring row of node `i`; the result keeps the
/// top `k` `(token, logit)` pairs per node, best first.
pub fn top_k_expansions(node_logits: &[Vec<f32>], k: usize) -> Vec<Vec<(TokenId, f32)>> {
    node_logits
        .iter()
        .map(|row| {
            let mut indexed: Vec<(TokenId, f32)> = row
                .iter()
                .enumerate()
                .map(|(i, &v)| (i as TokenId, v))
                .collect();
            indexed.sort_unstable_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.0.cmp(&b.0))
            });
            indexed.truncate(k);
            indexed
        })
        .collect()
}

/// Pipeline layer packing draft-tree tensors for the configured slots.
pub struct DraftTreeLayer {
    domain: DecoderDomain,
    trees: Vec<Option<DraftTree>>,
    top_k: usize,
}

impl DraftTreeLayer {
    pub fn new(domain: &DecoderDomain) -> Self {
        Self {
            domain: *domain,
            trees: (0..domain.max_batch_size).map(|_| None).collect(),
            top_k: 1,
        }
    }

    /// Install the speculation tree used for a slot's next passes.
    pub fn set_tree(&mut self, slot: usize, tree: DraftTree) -> Result<()> {
        if slot >= self.domain.max_batch_size {
            return Err(DecodeError::MaxBatchExceeded {
                slot,
                max: self.domain.max_batch_size,
            });
        }
        if tree.num_nodes() > self.domain.max_decoding_tokens {
            return Err(DecodeError::InvalidArgument(format!(
                "draft tree with {} nodes exceeds max decoding tokens {}",
                tree.num_nodes(),
                self.domain.max_decoding_tokens
            )));
        }
        self.trees[slot] = Some(tree);
        Ok(())
    }
}

impl DecoderLayer for DraftTreeLayer {
    fn name(&self) -> &'static str {
        "draft_tree"
    }

    fn setup(
        &mut self,
        _batch_size: usize,
        beam_width: usize,
        _batch_slots: &[usize],
        config: &SamplingConfig,
    ) -> Result<()> {
        if beam_width != 1 {
            return Err(DecodeError::InvalidArgument(format!(
                "draft-tree decoding requires beam width 1, got {beam_width}"
            )));
        }
        self.top_k = config
            .top_k
            .as_ref()
            .and_then(|v| v.first().copied())
            .unwrap_or(1)
            .max(1);
        Ok(())
    }

    fn forward(
        &mut self,
        outputs: &mut DecodingOutput,
        inputs: &DecodingInput,
        workspace: &mut DecodeWorkspace,
    ) -> Result<()> {
        let mut spec = SpeculativeOutputs::default();
        for bi in 0..inputs.batch_size {
            let slot = inputs.batch_slots[bi];
            let Some(tree) = self.trees.get(slot).and_then(|t| t.as_ref()) else {
                return Err(DecodeError::InvalidArgument(format!(
                    "slot {slot} has no draft tree installed"
                )));
            };
            let nodes = tree.num_nodes();

            // Top expansion per node from this pass's logits rows.
            let node_logits: Vec<Vec<f32>> = (0..nodes)
                .map(|ti| workspace.logits_row(bi, ti, 0).to_vec())
                .collect();
            let expansions = top_k_expansions(&node_logits, self.top_k);
            let mut row: Vec<TokenId> = expansions
                .iter()
                .map(|exp| exp.first().map(|&(t, _)| t).unwrap_or(0))
                .collect();
            row.resize(self.domain.max_decoding_tokens, 0);
            spec.next_draft_tokens.extend(row);
            spec.position_offsets.extend(tree.position_offsets());
            spec.packed_masks.extend(tree.packed_ancestor_masks());
            spec.generation_lengths.push(nodes);
            spec.accepted_lengths.push(0);
        }
        outputs.speculative = Some(spec);
        Ok(())
    }
}
