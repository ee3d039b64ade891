//! Paged block allocator with prefix reuse and two-tier memory.
//!
//! The manager owns every block. Blocks live in an arena indexed by
//! `BlockId`; sequences and the prefix tree refer to them by index only.
//! Freed blocks stay in the prefix tree with their content until the
//! eviction policy claims them, so a later request with the same prompt can
//! pick them up without recomputation.

use std::collections::HashMap;

use candle_core::{DType, Device};
use tracing::debug;

use super::block::{BlockId, KVCacheBlock, TokenId};
use super::free_queue::FreeBlockQueue;
use super::pool::{BlockPool, PoolTier};
use super::sequence::GenerationRequest;
use crate::error::{DecodeError, Result};

/// Marker for "no unshared context block".
pub const NO_UNSHARED_BLOCK: usize = usize::MAX;

/// Aggregate allocator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockAllocStats {
    pub alloc_total_blocks: usize,
    pub alloc_new_blocks: usize,
    pub reused_blocks: usize,
}

pub struct BlockManager {
    /// Arena of all blocks; the last entry is the prefix-tree root and is
    /// never allocated, queued, or counted.
    blocks: Vec<KVCacheBlock>,
    root: BlockId,
    free_primary: FreeBlockQueue,
    free_secondary: FreeBlockQueue,
    /// One entry per attachment: a block shared by `n` beams appears `n` times.
    allocated_per_seq: HashMap<usize, Vec<BlockId>>,
    pool: BlockPool,
    tokens_per_block: usize,
    onboard_blocks: bool,
    scheduling_num_free: usize,
    stats: BlockAllocStats,
}

impl BlockManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        blocks_in_primary_pool: usize,
        blocks_in_secondary_pool: usize,
        tokens_per_block: usize,
        num_kv_heads: usize,
        head_dim: usize,
        onboard_blocks: bool,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        assert!(tokens_per_block > 0, "tokens_per_block must be positive");
        let pool = BlockPool::new(
            blocks_in_primary_pool,
            blocks_in_secondary_pool,
            num_kv_heads,
            tokens_per_block,
            head_dim,
            dtype,
            device,
        )?;

        let total = blocks_in_primary_pool + blocks_in_secondary_pool;
        let mut blocks = Vec::with_capacity(total + 1);
        let mut free_primary = FreeBlockQueue::new(total);
        let mut free_secondary = FreeBlockQueue::new(total);
        for idx in 0..blocks_in_primary_pool {
            blocks.push(KVCacheBlock::new(idx, idx, false));
            free_primary.push_back(idx);
        }
        for offset in 0..blocks_in_secondary_pool {
            let idx = blocks_in_primary_pool + offset;
            blocks.push(KVCacheBlock::new(idx, offset, true));
            free_secondary.push_back(idx);
        }
        let root = total;
        blocks.push(KVCacheBlock::new(root, 0, false));

        Ok(Self {
            blocks,
            root,
            free_primary,
            free_secondary,
            allocated_per_seq: HashMap::new(),
            pool,
            tokens_per_block,
            onboard_blocks,
            scheduling_num_free: 0,
            stats: BlockAllocStats::default(),
        })
    }

    pub fn tokens_per_block(&self) -> usize {
        self.tokens_per_block
    }

    pub fn max_num_blocks(&self) -> usize {
        self.blocks.len() - 1
    }

    pub fn num_free_blocks(&self) -> usize {
        self.free_primary.len()
    }

    pub fn num_free_secondary_blocks(&self) -> usize {
        self.free_secondary.len()
    }

    pub fn num_allocated_blocks(&self) -> usize {
        self.max_num_blocks() - self.free_primary.len() - self.free_secondary.len()
    }

    pub fn has_free_blocks(&self, num_required: usize) -> bool {
        self.num_free_blocks() >= num_required
    }

    pub fn stats(&self) -> BlockAllocStats {
        self.stats
    }

    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    pub fn block(&self, id: BlockId) -> &KVCacheBlock {
        &self.blocks[id]
    }

    // ─── Sequence admission ───────────────────────────────────────────────

    /// Assign context blocks without attempting reuse.
    ///
    /// Blocks are shared across all beams except the one at
    /// `unshared_block_idx` (the beam-fork point), which every beam gets a
    /// private copy of. Pass [`NO_UNSHARED_BLOCK`] to share everything.
    pub fn add_sequence(
        &mut self,
        seq: &mut GenerationRequest,
        num_blocks: usize,
        unshared_block_idx: usize,
    ) -> Result<()> {
        for i in 0..num_blocks {
            let share = i != unshared_block_idx;
            self.allocate_block(seq, share)?;
        }
        Ok(())
    }

    /// Assign context blocks, reusing stored prefix blocks where the prompt
    /// matches. Returns the number of prepopulated tokens.
    ///
    /// Reuse attaches matched blocks to beam 0; callers gate this path on
    /// `beam_width == 1`.
    pub fn add_sequence_with_reuse(
        &mut self,
        seq: &mut GenerationRequest,
        input_length: usize,
        prompt: &[TokenId],
    ) -> Result<usize> {
        debug_assert_eq!(seq.beam_width(), 1);
        let prompt = &prompt[..input_length.min(prompt.len())];

        let mut matched_tokens = 0;
        let mut matched_blocks = 0;
        let mut cursor = self.root;
        for window in prompt.chunks(self.tokens_per_block) {
            if window.len() < self.tokens_per_block {
                break;
            }
            let Some(child) = self.blocks[cursor].next_block(window) else {
                break;
            };
            if !self.blocks[child].has_refs() {
                // Cached and idle: take it out of the free queue, keep tree links.
                let removed = self.free_primary.remove(child) || self.free_secondary.remove(child);
                debug_assert!(removed, "idle cached block must sit in a free queue");
            }
            self.attach_block(seq, 0, child)?;
            self.stats.reused_blocks += 1;
            self.stats.alloc_total_blocks += 1;
            matched_tokens += self.tokens_per_block;
            matched_blocks += 1;
            cursor = child;
        }

        let needed = input_length.div_ceil(self.tokens_per_block);
        for _ in matched_blocks..needed {
            self.allocate_block(seq, true)?;
        }
        seq.set_num_prepopulated_tokens(vec![matched_tokens]);
        if matched_tokens > 0 {
            debug!(
                slot = seq.seq_slot(),
                matched_tokens, "reused prefix blocks from cache"
            );
        }
        Ok(matched_tokens)
    }

    /// Append one block to every beam, or one shared block across beams.
    pub fn allocate_block(
        &mut self,
        seq: &mut GenerationRequest,
        share_among_beams: bool,
    ) -> Result<()> {
        let beam_width = seq.beam_width();
        if share_among_beams {
            let id = self.get_free_block()?;
            for beam in 0..beam_width {
                self.attach_block(seq, beam, id)?;
            }
            self.stats.alloc_new_blocks += 1;
            self.stats.alloc_total_blocks += 1;
        } else {
            for beam in 0..beam_width {
                let id = self.get_free_block()?;
                self.attach_block(seq, beam, id)?;
                self.stats.alloc_new_blocks += 1;
                self.stats.alloc_total_blocks += 1;
            }
        }
        Ok(())
    }

    /// Fork a shared context block: every beam receives a private copy of
    /// the block at `block_position` and the shared original is released.
    pub fn replace_shared_block(
        &mut self,
        seq: &mut GenerationRequest,
        block_position: usize,
    ) -> Result<()> {
        let shared = seq.cache_block_ids()[0][block_position];
        if !self.blocks[shared].is_shared() {
            return Ok(());
        }
        let beam_width = seq.beam_width();
        let (src_tier, src_offset) = self.tier_of(shared);
        for beam in 0..beam_width {
            let fresh = self.get_free_block()?;
            let (dst_tier, dst_offset) = self.tier_of(fresh);
            self.pool.copy_block(src_tier, src_offset, dst_tier, dst_offset)?;
            self.onboard_block(fresh)?;
            self.blocks[fresh].inc_ref();
            seq.change_cache_block(beam, block_position, fresh);
            self.allocated_per_seq
                .entry(seq.seq_slot())
                .or_default()
                .push(fresh);
            self.detach_one(seq.seq_slot(), shared, true);
        }
        Ok(())
    }

    // ─── Release ──────────────────────────────────────────────────────────

    /// Decrement a block's refcount; enqueue it once idle.
    ///
    /// `to_front` marks the block evict-first; otherwise it is kept as long
    /// as possible (cached content worth keeping).
    pub fn release_block(&mut self, id: BlockId, to_front: bool) {
        self.blocks[id].dec_ref();
        if self.blocks[id].has_refs() {
            return;
        }
        let queue = if self.blocks[id].is_primary() {
            &mut self.free_primary
        } else {
            &mut self.free_secondary
        };
        if to_front {
            queue.push_front(id);
        } else {
            queue.push_back(id);
        }
    }

    /// Release every block of the sequence. When `store_tokens` is provided
    /// (reuse enabled), full beam-0 blocks are first inserted into the
    /// prefix tree keyed by their token windows, so they are stored rather
    /// than discarded.
    pub fn release_blocks(&mut self, seq: &mut GenerationRequest, store_tokens: Option<&[TokenId]>) {
        if let Some(tokens) = store_tokens {
            let ids = seq.cache_block_ids()[0].clone();
            self.store_blocks(tokens, &ids);
        }
        let attachments = self
            .allocated_per_seq
            .remove(&seq.seq_slot())
            .unwrap_or_default();
        for id in attachments {
            let cached = self.blocks[id].is_full() && self.blocks[id].prev_block().is_some();
            self.release_block(id, !cached);
        }
        seq.clear_cache_blocks();
    }

    /// Release the trailing block of every beam (token rollback emptied it).
    pub fn release_last_block(&mut self, seq: &mut GenerationRequest) {
        let slot = seq.seq_slot();
        let tails: Vec<BlockId> = seq
            .cache_block_ids()
            .iter()
            .filter_map(|beam| beam.last().copied())
            .collect();
        seq.remove_last_block();
        for id in tails {
            self.detach_one(slot, id, true);
        }
    }

    // ─── Scheduling dry run ───────────────────────────────────────────────

    /// Snapshot refcounts so the scheduler can simulate releases.
    pub fn start_scheduling(&mut self) {
        self.scheduling_num_free = self.free_primary.len();
        for block in &mut self.blocks {
            block.start_scheduling();
        }
    }

    /// Simulate freeing the sequence's blocks. Touches only the scheduling
    /// counters, never the real allocator state.
    pub fn scheduling_release_blocks(&mut self, seq: &GenerationRequest) {
        if let Some(attachments) = self.allocated_per_seq.get(&seq.seq_slot()) {
            for &id in attachments {
                self.blocks[id].dec_scheduling_ref();
                if !self.blocks[id].has_scheduling_refs() {
                    self.scheduling_num_free += 1;
                }
            }
        }
    }

    pub fn scheduling_has_free_blocks(&self, num_required: usize) -> bool {
        self.scheduling_num_free >= num_required
    }

    // ─── Eviction and onboarding ──────────────────────────────────────────

    /// Pick the block least likely to be reused next, detach it from the
    /// prefix tree, and hand it out.
    ///
    /// Order of preference: a primary leaf in free-queue order (offloading
    /// its cached content to the secondary tier when possible), then a
    /// secondary leaf. Fails with `OutOfCache` only when both tiers are
    /// exhausted.
    fn get_free_block(&mut self) -> Result<BlockId> {
        if let Some(victim) = self.find_claimable(PoolTier::Primary) {
            if self.blocks[victim].is_full() && self.onboard_blocks {
                if let Some(spare) = self.find_claimable(PoolTier::Secondary) {
                    return self.offload_block(victim, spare);
                }
            }
            self.claim_leaf_block(victim);
            return Ok(victim);
        }
        if let Some(victim) = self.find_claimable(PoolTier::Secondary) {
            self.claim_leaf_block(victim);
            return Ok(victim);
        }
        Err(DecodeError::OutOfCache {
            requested: 1,
            available: 0,
        })
    }

    /// First block in the tier's free queue with no children left in the
    /// tree. Blocks whose descendants are still referenced (or still
    /// cached) keep their subtree alive and are skipped.
    fn find_claimable(&self, tier: PoolTier) -> Option<BlockId> {
        let queue = match tier {
            PoolTier::Primary => &self.free_primary,
            PoolTier::Secondary => &self.free_secondary,
        };
        queue.iter().find(|&id| self.blocks[id].is_leaf())
    }

    /// Preserve `victim`'s cached content by moving it to the secondary
    /// tier; `spare`'s stale content is dropped and its (now primary) slab
    /// is returned as the fresh block.
    fn offload_block(&mut self, victim: BlockId, spare: BlockId) -> Result<BlockId> {
        self.claim_leaf_block(spare);
        let (victim_tier, victim_offset) = self.tier_of(victim);
        let (spare_tier, spare_offset) = self.tier_of(spare);
        debug_assert_eq!(victim_tier, PoolTier::Primary);
        debug_assert_eq!(spare_tier, PoolTier::Secondary);
        self.pool
            .copy_block(PoolTier::Primary, victim_offset, PoolTier::Secondary, spare_offset)?;
        self.swap_pool_offsets(victim, spare);
        // The victim keeps its tree links and cached tokens but now lives in
        // the secondary tier; move it between queues accordingly.
        self.free_primary.remove(victim);
        self.free_secondary.push_back(victim);
        debug!(block = victim, "offloaded cached block to secondary pool");
        Ok(spare)
    }

    /// Bring a secondary-resident block into the primary pool. No-op when
    /// the block is already primary or onboarding is disabled; when no
    /// primary slab can be vacated the block is served from the secondary
    /// tier in place.
    fn onboard_block(&mut self, id: BlockId) -> Result<()> {
        if self.blocks[id].is_primary() || !self.onboard_blocks {
            return Ok(());
        }
        let Some(victim) = self.find_claimable(PoolTier::Primary) else {
            debug!(block = id, "no primary slab free, serving block from secondary");
            return Ok(());
        };
        self.claim_leaf_block(victim);
        let (_, src_offset) = self.tier_of(id);
        let (_, dst_offset) = self.tier_of(victim);
        self.pool
            .copy_block(PoolTier::Secondary, src_offset, PoolTier::Primary, dst_offset)?;
        self.swap_pool_offsets(id, victim);
        // The vacated metadata entry now addresses the secondary slab.
        self.free_secondary.push_front(victim);
        debug!(block = id, "onboarded block to primary pool");
        Ok(())
    }

    /// Detach from parent, drop the token key, and leave every free queue.
    fn claim_leaf_block(&mut self, id: BlockId) {
        debug_assert!(self.blocks[id].is_leaf(), "claiming a non-leaf block");
        if let Some(parent) = self.blocks[id].prev_block() {
            let key = self.blocks[id].tokens().to_vec();
            self.blocks[parent].remove_next_block(&key);
            self.blocks[id].set_prev_block(None);
        }
        self.blocks[id].set_tokens(Vec::new(), false);
        let removed = self.free_primary.remove(id) || self.free_secondary.remove(id);
        debug_assert!(removed, "claimed block was not free");
    }

    // ─── Internal plumbing ────────────────────────────────────────────────

    fn attach_block(&mut self, seq: &mut GenerationRequest, beam: usize, id: BlockId) -> Result<()> {
        self.onboard_block(id)?;
        self.blocks[id].inc_ref();
        seq.add_cache_block(beam, id);
        self.allocated_per_seq
            .entry(seq.seq_slot())
            .or_default()
            .push(id);
        Ok(())
    }

    /// Remove one attachment record and release one reference.
    fn detach_one(&mut self, slot: usize, id: BlockId, to_front: bool) {
        if let Some(attachments) = self.allocated_per_seq.get_mut(&slot) {
            if let Some(pos) = attachments.iter().rposition(|&b| b == id) {
                attachments.swap_remove(pos);
            }
        }
        self.release_block(id, to_front);
    }

    /// Insert a released sequence's full blocks into the prefix tree. A
    /// block whose token window already has a cached equivalent is left out
    /// (the existing child wins) and will be freed as uncached.
    fn store_blocks(&mut self, tokens: &[TokenId], block_ids: &[BlockId]) {
        let mut cursor = self.root;
        for (window, &id) in tokens.chunks(self.tokens_per_block).zip(block_ids) {
            if window.len() < self.tokens_per_block {
                break;
            }
            match self.blocks[cursor].next_block(window) {
                Some(existing) => {
                    // Tie-break: keep the block already in the tree.
                    cursor = existing;
                }
                None => {
                    self.blocks[id].set_tokens(window.to_vec(), true);
                    self.blocks[id].set_prev_block(Some(cursor));
                    self.blocks[cursor].add_next_block(window.to_vec(), id);
                    cursor = id;
                }
            }
        }
    }

    fn tier_of(&self, id: BlockId) -> (PoolTier, usize) {
        let block = &self.blocks[id];
        let tier = if block.is_primary() {
            PoolTier::Primary
        } else {
            PoolTier::Secondary
        };
        (tier, block.pool_offset())
    }

    fn swap_pool_offsets(&mut self, a: BlockId, b: BlockId) {
        let raw_a = self.blocks[a].raw_pool_offset();
        let raw_b = self.blocks[b].raw_pool_offset();
        self.blocks[a].set_raw_pool_offset(raw_b);
        self.blocks[b].set_raw_pool_offset(raw_a);
    }

    /// Signed pool reference published to the attention consumer: primary
    /// offsets are non-negative, secondary offsets are `-(offset + 1)`.
    pub fn block_pointer(&self, id: BlockId) -> i64 {
        let block = &self.blocks[id];
        if block.is_primary() {
            block.pool_offset() as i64
        } else {
            -(block.pool_offset() as i64) - 1
        }
    }
}
