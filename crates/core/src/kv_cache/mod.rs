//! Paged KV cache: block allocator, prefix reuse, per-request lifecycle.

mod block;
mod block_manager;
mod free_queue;
mod pool;
mod sequence;

pub use block::{BlockId, KVCacheBlock, TokenId};
pub use block_manager::{BlockAllocStats, BlockManager, NO_UNSHARED_BLOCK};
pub use free_queue::FreeBlockQueue;
pub use pool::{BlockPool, PoolTier};
pub use sequence::GenerationRequest;

use candle_core::{DType, Device};
use tracing::debug;

use crate::config::KvCacheConfig;
use crate::error::{DecodeError, Result};

/// Point-in-time cache utilization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvCacheStats {
    pub max_num_blocks: usize,
    pub free_num_blocks: usize,
    pub used_num_blocks: usize,
    pub tokens_per_block: usize,
}

/// Per-request KV cache lifecycle over a [`BlockManager`].
///
/// Tracks one [`GenerationRequest`] per batch slot and publishes the block
/// pointer table consumed by attention. When a sequence outgrows
/// `max_attention_window` it becomes cyclic: writes wrap over the allocated
/// blocks while the sink prefix stays pinned.
pub struct KVCacheManager {
    block_manager: BlockManager,
    sequences: Vec<Option<GenerationRequest>>,
    max_num_sequences: usize,
    max_beam_width: usize,
    max_blocks_per_seq: usize,
    max_attention_window: usize,
    /// Padding that rounds the sink up to a block boundary.
    sink_bubble_len: usize,
    /// Sink length including the bubble: always a whole number of blocks.
    sink_block_token_len: usize,
    /// Capacity in tokens after which writes wrap.
    max_token_num: usize,
    enable_block_reuse: bool,
    /// Signed pool references, `[slot][beam][block_position]`, dense.
    block_pointers: Vec<i64>,
}

/// Pointer-table entry meaning "no block".
pub const NULL_BLOCK_POINTER: i64 = i64::MIN;

impl KVCacheManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &KvCacheConfig,
        num_kv_heads: usize,
        head_dim: usize,
        max_num_sequences: usize,
        max_beam_width: usize,
        max_attention_window: usize,
        sink_token_length: usize,
        use_one_more_block: bool,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let tokens_per_block = config.tokens_per_block;
        let block_manager = BlockManager::new(
            config.blocks_in_primary_pool,
            config.blocks_in_secondary_pool,
            tokens_per_block,
            num_kv_heads,
            head_dim,
            config.onboard_blocks,
            dtype,
            device,
        )?;

        // A sink that ends mid-block is padded ("bubble") so the sink always
        // occupies whole blocks; a block-aligned sink needs no bubble.
        let sink_in_last_block = sink_token_length % tokens_per_block;
        let sink_bubble_len = if sink_in_last_block == 0 {
            0
        } else {
            tokens_per_block - sink_in_last_block
        };
        let sink_block_token_len = sink_token_length + sink_bubble_len;
        let mut max_token_num = sink_block_token_len + max_attention_window;
        if use_one_more_block {
            max_token_num += tokens_per_block;
        }
        let max_blocks_per_seq = max_token_num.div_ceil(tokens_per_block);

        Ok(Self {
            block_manager,
            sequences: (0..max_num_sequences).map(|_| None).collect(),
            max_num_sequences,
            max_beam_width,
            max_blocks_per_seq,
            max_attention_window,
            sink_bubble_len,
            sink_block_token_len,
            max_token_num,
            enable_block_reuse: config.enable_block_reuse,
            block_pointers: vec![
                NULL_BLOCK_POINTER;
                max_num_sequences * max_beam_width * max_blocks_per_seq
            ],
        })
    }

    pub fn tokens_per_block(&self) -> usize {
        self.block_manager.tokens_per_block()
    }

    pub fn max_num_blocks(&self) -> usize {
        self.block_manager.max_num_blocks()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.block_manager.num_free_blocks()
    }

    pub fn used_num_blocks(&self) -> usize {
        self.block_manager.num_allocated_blocks()
    }

    pub fn max_blocks_per_seq(&self) -> usize {
        self.max_blocks_per_seq
    }

    pub fn sink_bubble_len(&self) -> usize {
        self.sink_bubble_len
    }

    pub fn max_attention_window(&self) -> usize {
        self.max_attention_window
    }

    pub fn is_block_reuse_enabled(&self) -> bool {
        self.enable_block_reuse
    }

    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    pub fn stats(&self) -> KvCacheStats {
        KvCacheStats {
            max_num_blocks: self.max_num_blocks(),
            free_num_blocks: self.num_free_blocks(),
            used_num_blocks: self.used_num_blocks(),
            tokens_per_block: self.tokens_per_block(),
        }
    }

    // ─── Sequence lifecycle ───────────────────────────────────────────────

    /// Admit a sequence into `slot`. With reuse enabled (and a single beam,
    /// no sink bubble) the prompt is matched against the prefix tree first.
    pub fn add_sequence(
        &mut self,
        slot: usize,
        input_length: usize,
        beam_width: usize,
        prompt: Option<&[TokenId]>,
    ) -> Result<()> {
        self.check_slot(slot)?;
        if beam_width > self.max_beam_width {
            return Err(DecodeError::InvalidArgument(format!(
                "beam width {beam_width} exceeds max {}",
                self.max_beam_width
            )));
        }
        if self.sequences[slot].is_some() {
            return Err(DecodeError::InvalidArgument(format!(
                "slot {slot} already holds a sequence"
            )));
        }

        let tokens_per_block = self.tokens_per_block();
        let effective_input = input_length.min(self.max_token_num) + self.sink_bubble_len;
        let mut seq = GenerationRequest::new(slot, effective_input, beam_width);

        let reuse_prompt = (self.enable_block_reuse && beam_width == 1 && self.sink_bubble_len == 0)
            .then_some(prompt)
            .flatten();
        if let Some(prompt) = reuse_prompt {
            self.block_manager
                .add_sequence_with_reuse(&mut seq, input_length.min(self.max_token_num), prompt)?;
        } else {
            let num_blocks = effective_input.div_ceil(tokens_per_block);
            // With several beams the last context block is the fork point
            // and must be private per beam.
            let unshared = if beam_width > 1 && num_blocks > 0 {
                num_blocks - 1
            } else {
                NO_UNSHARED_BLOCK
            };
            self.block_manager.add_sequence(&mut seq, num_blocks, unshared)?;
        }

        self.sequences[slot] = Some(seq);
        self.refresh_block_pointers(slot);
        debug!(slot, input_length, beam_width, "admitted sequence");
        Ok(())
    }

    /// Remove the sequence and release its blocks. With reuse enabled the
    /// token stream is stored into the prefix tree before release.
    pub fn remove_sequence(&mut self, slot: usize, tokens: Option<&[TokenId]>) -> Result<()> {
        self.check_slot(slot)?;
        let Some(mut seq) = self.sequences[slot].take() else {
            return Ok(());
        };
        let store = if self.enable_block_reuse && seq.beam_width() == 1 && self.sink_bubble_len == 0
        {
            tokens
        } else {
            None
        };
        self.block_manager.release_blocks(&mut seq, store);
        self.clear_block_pointers(slot);
        debug!(slot, "removed sequence");
        Ok(())
    }

    /// Dry-run removal for the scheduler's capacity forecast.
    pub fn scheduling_remove_sequence(&mut self, slot: usize) -> Result<()> {
        self.check_slot(slot)?;
        if let Some(seq) = self.sequences[slot].take() {
            self.block_manager.scheduling_release_blocks(&seq);
            self.sequences[slot] = Some(seq);
        }
        Ok(())
    }

    pub fn start_scheduling(&mut self) {
        self.block_manager.start_scheduling();
    }

    pub fn num_prepopulated_tokens(&self, slot: usize, beam: usize) -> usize {
        self.sequences[slot]
            .as_ref()
            .and_then(|seq| seq.num_prepopulated_tokens().get(beam).copied())
            .unwrap_or(0)
    }

    pub fn sequence_num_tokens(&self, slot: usize) -> usize {
        self.sequences[slot]
            .as_ref()
            .map(|seq| seq.num_tokens())
            .unwrap_or(0)
    }

    pub fn sequence_block_count(&self, slot: usize, beam: usize) -> usize {
        self.sequences[slot]
            .as_ref()
            .map(|seq| seq.cache_block_ids()[beam].len())
            .unwrap_or(0)
    }

    // ─── Token updates ────────────────────────────────────────────────────

    /// Account one generated token; allocates when a block boundary is
    /// crossed while the sequence is still growing. Past
    /// `max_token_num` the sequence is cyclic and writes wrap in place.
    pub fn add_token(&mut self, slot: usize) -> Result<()> {
        self.update_token(slot, true)
    }

    /// Account several context tokens at once (chunked prefill).
    pub fn add_context_tokens(&mut self, slot: usize, n: usize) -> Result<()> {
        for _ in 0..n {
            self.update_token(slot, true)?;
        }
        Ok(())
    }

    pub fn remove_token(&mut self, slot: usize) -> Result<()> {
        self.update_token(slot, false)
    }

    /// Roll back `n` speculative tokens, freeing emptied tail blocks.
    pub fn rewind_kv_cache(&mut self, slot: usize, n: usize) -> Result<()> {
        for _ in 0..n {
            self.remove_token(slot)?;
        }
        Ok(())
    }

    fn update_token(&mut self, slot: usize, add: bool) -> Result<()> {
        self.check_slot(slot)?;
        let tokens_per_block = self.tokens_per_block();
        let max_token_num = self.max_token_num;
        let sink_block = self.sink_block_token_len;
        let in_cycle = move |idx: usize| -> usize {
            if idx < max_token_num || max_token_num == sink_block {
                idx
            } else {
                (idx - sink_block) % (max_token_num - sink_block) + sink_block
            }
        };
        let (boundary, grow) = {
            let seq = self.sequences[slot]
                .as_mut()
                .ok_or_else(|| DecodeError::InvalidArgument(format!("slot {slot} is empty")))?;
            if add {
                let next_idx = seq.num_tokens();
                seq.add_new_tokens(1);
                (
                    in_cycle(next_idx) % tokens_per_block == 0,
                    next_idx < max_token_num,
                )
            } else {
                seq.remove_tokens(1);
                let last_idx = seq.num_tokens();
                (
                    in_cycle(last_idx) % tokens_per_block == 0,
                    last_idx < max_token_num,
                )
            }
        };
        if boundary && grow {
            let mut seq = self.sequences[slot].take().expect("checked above");
            let result = if add {
                self.block_manager.allocate_block(&mut seq, false)
            } else {
                self.block_manager.release_last_block(&mut seq);
                Ok(())
            };
            self.sequences[slot] = Some(seq);
            result?;
            self.refresh_block_pointers(slot);
        }
        Ok(())
    }

    /// Map a token index onto the cyclic window: sink tokens map to
    /// themselves, everything after wraps over the non-sink capacity.
    fn token_idx_in_cycle(&self, idx: usize) -> usize {
        if idx < self.max_token_num || self.max_token_num == self.sink_block_token_len {
            return idx;
        }
        let cyclic_len = self.max_token_num - self.sink_block_token_len;
        (idx - self.sink_block_token_len) % cyclic_len + self.sink_block_token_len
    }

    // ─── Forecasting ──────────────────────────────────────────────────────

    /// Blocks a slot would need to advance one (or two) decode steps.
    pub fn get_needed_blocks_one_step(&self, slot: usize, two_steps_look_ahead: bool) -> usize {
        let Some(seq) = self.sequences.get(slot).and_then(|s| s.as_ref()) else {
            return 0;
        };
        let steps = if two_steps_look_ahead { 2 } else { 1 };
        self.count_boundary_crossings(seq, steps)
    }

    /// Blocks a slot would need to decode `max_new_tokens` more tokens.
    pub fn get_needed_blocks_to_completion(&self, slot: usize, max_new_tokens: usize) -> usize {
        let Some(seq) = self.sequences.get(slot).and_then(|s| s.as_ref()) else {
            return 0;
        };
        self.count_boundary_crossings(seq, max_new_tokens)
    }

    fn count_boundary_crossings(&self, seq: &GenerationRequest, steps: usize) -> usize {
        let tokens_per_block = self.tokens_per_block();
        let mut needed = 0;
        for step in 0..steps {
            let idx = seq.num_tokens() + step;
            if idx >= self.max_token_num {
                break; // cyclic: no further growth
            }
            if self.token_idx_in_cycle(idx) % tokens_per_block == 0 {
                needed += seq.beam_width();
            }
        }
        needed
    }

    // ─── Pointer table ────────────────────────────────────────────────────

    /// Copy the slot's current block pointers into `dst` starting at
    /// `dst_offset`, `beam_width * max_blocks_per_seq` entries per beam.
    /// Returns the largest per-beam block count written.
    pub fn copy_block_pointers(
        &self,
        dst: &mut [i64],
        dst_offset: usize,
        slot: usize,
        beam_width: usize,
    ) -> usize {
        let Some(seq) = self.sequences.get(slot).and_then(|s| s.as_ref()) else {
            return 0;
        };
        let mut max_blocks = 0;
        for beam in 0..beam_width.min(seq.beam_width()) {
            let blocks = &seq.cache_block_ids()[beam];
            let base = dst_offset + beam * self.max_blocks_per_seq;
            for (pos, &id) in blocks.iter().take(self.max_blocks_per_seq).enumerate() {
                dst[base + pos] = self.block_manager.block_pointer(id);
            }
            max_blocks = max_blocks.max(blocks.len().min(self.max_blocks_per_seq));
        }
        max_blocks
    }

    /// Dense pointer table for a contiguous range of slots.
    pub fn get_block_pointers_of_batch(
        &self,
        dst: &mut [i64],
        first_slot: usize,
        batch_size: usize,
        beam_width: usize,
    ) {
        let stride = beam_width * self.max_blocks_per_seq;
        for (i, slot) in (first_slot..first_slot + batch_size).enumerate() {
            self.copy_block_pointers(dst, i * stride, slot, beam_width);
        }
    }

    /// The internally maintained `[slot][beam][position]` table, refreshed
    /// whenever a slot's block list changes.
    pub fn block_pointer_table(&self) -> &[i64] {
        &self.block_pointers
    }

    fn refresh_block_pointers(&mut self, slot: usize) {
        let stride = self.max_beam_width * self.max_blocks_per_seq;
        let base = slot * stride;
        self.block_pointers[base..base + stride].fill(NULL_BLOCK_POINTER);
        let Some(beam_width) = self.sequences[slot].as_ref().map(|s| s.beam_width()) else {
            return;
        };
        let mut table = std::mem::take(&mut self.block_pointers);
        self.copy_block_pointers(&mut table[base..], 0, slot, beam_width);
        self.block_pointers = table;
    }

    fn clear_block_pointers(&mut self, slot: usize) {
        let stride = self.max_beam_width * self.max_blocks_per_seq;
        let base = slot * stride;
        self.block_pointers[base..base + stride].fill(NULL_BLOCK_POINTER);
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.max_num_sequences {
            return Err(DecodeError::MaxBatchExceeded {
                slot,
                max: self.max_num_sequences,
            });
        }
        Ok(())
    }
}
