//! Primary and secondary pool tensors.
//!
//! Each pool is one tensor of shape
//! `[blocks, 2, num_kv_heads, tokens_per_block, head_dim]` shared logically
//! across layers. The pool never hands out storage: consumers receive
//! offsets, and the only data movement is whole-block copies for onboarding
//! and offloading between tiers.

use candle_core::{DType, Device, Tensor};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolTier {
    Primary,
    Secondary,
}

pub struct BlockPool {
    primary: Tensor,
    secondary: Option<Tensor>,
    block_elems: usize,
    blocks_in_primary: usize,
    blocks_in_secondary: usize,
}

impl BlockPool {
    pub fn new(
        blocks_in_primary: usize,
        blocks_in_secondary: usize,
        num_kv_heads: usize,
        tokens_per_block: usize,
        head_dim: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let block_elems = 2 * num_kv_heads * tokens_per_block * head_dim;
        let shape = |blocks: usize| (blocks, 2, num_kv_heads, tokens_per_block, head_dim);
        let primary = Tensor::zeros(shape(blocks_in_primary.max(1)), dtype, device)?;
        let secondary = if blocks_in_secondary > 0 {
            Some(Tensor::zeros(shape(blocks_in_secondary), dtype, device)?)
        } else {
            None
        };
        Ok(Self {
            primary,
            secondary,
            block_elems,
            blocks_in_primary,
            blocks_in_secondary,
        })
    }

    pub fn primary_tensor(&self) -> &Tensor {
        &self.primary
    }

    pub fn blocks_in_primary(&self) -> usize {
        self.blocks_in_primary
    }

    pub fn blocks_in_secondary(&self) -> usize {
        self.blocks_in_secondary
    }

    /// Elements per block (K and V fields included).
    pub fn block_elems(&self) -> usize {
        self.block_elems
    }

    /// Copy one block slab between pool offsets, possibly across tiers.
    pub fn copy_block(
        &self,
        src_tier: PoolTier,
        src_offset: usize,
        dst_tier: PoolTier,
        dst_offset: usize,
    ) -> Result<()> {
        let src = self.tier(src_tier);
        let dst = self.tier(dst_tier);
        let rows = dst.dim(0)?;
        let src_row = src
            .reshape((src.dim(0)?, self.block_elems))?
            .narrow(0, src_offset, 1)?
            .copy()?;
        let dst_flat = dst.reshape((rows, self.block_elems))?;
        let indices = Tensor::from_vec(
            vec![dst_offset as u32; self.block_elems],
            (1, self.block_elems),
            dst.device(),
        )?;
        dst_flat.scatter_set(&indices, &src_row, 0)?;
        Ok(())
    }

    fn tier(&self, tier: PoolTier) -> &Tensor {
        match tier {
            PoolTier::Primary => &self.primary,
            PoolTier::Secondary => self
                .secondary
                .as_ref()
                .expect("secondary pool not configured"),
        }
    }
}
