//! Cache block metadata.
//!
//! Blocks are arena entries addressed by `BlockId`; ownership stays with the
//! [`BlockManager`](super::block_manager::BlockManager). The prefix tree is
//! expressed through `prev_block` / `next_blocks` indices, never pointers,
//! so parent back-references cannot create ownership cycles.

use std::collections::HashMap;

pub type BlockId = usize;
pub type TokenId = u32;

/// High bit of `pool_offset` marks residence in the secondary pool.
const SECONDARY_POOL_FLAG: usize = 1 << (usize::BITS - 1);

/// Metadata for one fixed-size KV cache block.
///
/// The block holds no cache data itself; `pool_offset` addresses its slab in
/// the primary or secondary pool. `tokens` is the key of this block in its
/// parent's `next_blocks` map once the block has been stored for reuse.
pub struct KVCacheBlock {
    block_idx: BlockId,
    pool_offset: usize,
    ref_count: usize,
    scheduling_ref_count: usize,
    tokens: Vec<TokenId>,
    prev_block: Option<BlockId>,
    next_blocks: HashMap<Vec<TokenId>, BlockId>,
    is_full: bool,
}

impl KVCacheBlock {
    pub fn new(block_idx: BlockId, pool_offset: usize, secondary: bool) -> Self {
        let pool_offset = if secondary {
            pool_offset | SECONDARY_POOL_FLAG
        } else {
            pool_offset
        };
        Self {
            block_idx,
            pool_offset,
            ref_count: 0,
            scheduling_ref_count: 0,
            tokens: Vec::new(),
            prev_block: None,
            next_blocks: HashMap::new(),
            is_full: false,
        }
    }

    pub fn block_idx(&self) -> BlockId {
        self.block_idx
    }

    pub fn is_primary(&self) -> bool {
        self.pool_offset & SECONDARY_POOL_FLAG == 0
    }

    /// Offset within its pool, without the tier flag.
    pub fn pool_offset(&self) -> usize {
        self.pool_offset & !SECONDARY_POOL_FLAG
    }

    pub(super) fn raw_pool_offset(&self) -> usize {
        self.pool_offset
    }

    pub(super) fn set_raw_pool_offset(&mut self, raw: usize) {
        self.pool_offset = raw;
    }

    pub fn inc_ref(&mut self) {
        self.ref_count += 1;
    }

    pub fn dec_ref(&mut self) {
        assert!(self.ref_count > 0, "refcount underflow on block {}", self.block_idx);
        self.ref_count -= 1;
    }

    pub fn has_refs(&self) -> bool {
        self.ref_count > 0
    }

    pub fn start_scheduling(&mut self) {
        self.scheduling_ref_count = self.ref_count;
    }

    pub fn dec_scheduling_ref(&mut self) {
        assert!(
            self.scheduling_ref_count > 0,
            "scheduling refcount underflow on block {}",
            self.block_idx
        );
        self.scheduling_ref_count -= 1;
    }

    pub fn has_scheduling_refs(&self) -> bool {
        self.scheduling_ref_count > 0
    }

    pub fn set_tokens(&mut self, tokens: Vec<TokenId>, is_full: bool) {
        self.tokens = tokens;
        self.is_full = is_full;
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    /// Full blocks are the only ones eligible for prefix-tree reuse.
    pub fn is_full(&self) -> bool {
        self.is_full
    }

    pub fn is_shared(&self) -> bool {
        self.ref_count > 1
    }

    pub fn prev_block(&self) -> Option<BlockId> {
        self.prev_block
    }

    pub fn set_prev_block(&mut self, prev: Option<BlockId>) {
        self.prev_block = prev;
    }

    pub fn next_block(&self, tokens: &[TokenId]) -> Option<BlockId> {
        self.next_blocks.get(tokens).copied()
    }

    pub fn add_next_block(&mut self, tokens: Vec<TokenId>, id: BlockId) {
        self.next_blocks.insert(tokens, id);
    }

    pub fn remove_next_block(&mut self, tokens: &[TokenId]) {
        self.next_blocks.remove(tokens);
    }

    /// A leaf has no children left in the tree and can be detached safely.
    pub fn is_leaf(&self) -> bool {
        self.next_blocks.is_empty()
    }

    pub fn next_block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.next_blocks.values().copied()
    }
}
