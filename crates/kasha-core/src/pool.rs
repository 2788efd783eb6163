//! Preallocated per-layer K/V block storage and free-list accounting.
//!
//! The K and V cache for each layer is one tensor of shape
//! `[num_blocks, block_size * num_kv_heads * head_size]`. Row `b` is
//! block `b`: `block_size` slots of `num_kv_heads * head_size` elements,
//! one slot per token. The storage is allocated once at construction;
//! blocks are handed to sequences as needed and returned on removal.

use std::collections::BTreeSet;

use candle_core::{Device, Tensor};
use tracing::debug;

use crate::config::CacheOptions;
use crate::error::{Error, Result};
use crate::types::BlockId;

/// K and V storage for one transformer layer.
#[derive(Debug)]
struct LayerKv {
    k: Tensor,
    v: Tensor,
}

/// Block pool: owns the K/V tensors for every layer and tracks which
/// block ids are free.
///
/// The free list hands out the lowest free id first, which keeps
/// allocation deterministic.
pub struct BlockPool {
    layers: Vec<LayerKv>,
    free: BTreeSet<BlockId>,
    num_blocks: usize,
}

impl BlockPool {
    /// Allocate K/V tensors for every layer and mark all blocks free.
    pub fn new(options: &CacheOptions, num_blocks: usize, device: &Device) -> Result<Self> {
        let cols = options.block_size * options.slot_width();
        let dtype = options.dtype.as_dtype();
        let mut layers = Vec::with_capacity(options.num_layers);
        for _ in 0..options.num_layers {
            let k = Tensor::zeros((num_blocks, cols), dtype, device)?;
            let v = Tensor::zeros((num_blocks, cols), dtype, device)?;
            layers.push(LayerKv { k, v });
        }
        Ok(Self {
            layers,
            free: (0..num_blocks).collect(),
            num_blocks,
        })
    }

    /// K and V tensors for `layer_id`.
    pub fn layer(&self, layer_id: usize) -> Option<(&Tensor, &Tensor)> {
        self.layers.get(layer_id).map(|layer| (&layer.k, &layer.v))
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn num_free(&self) -> usize {
        self.free.len()
    }

    pub fn num_allocated(&self) -> usize {
        self.num_blocks - self.free.len()
    }

    /// The lowest `n` free block ids, without reserving them.
    pub fn find_available(&self, n: usize) -> Result<Vec<BlockId>> {
        if self.free.len() < n {
            return Err(Error::CacheFull {
                needed: n,
                available: self.free.len(),
            });
        }
        Ok(self.free.iter().take(n).copied().collect())
    }

    /// Remove `ids` from the free list.
    ///
    /// Panics if any id was not free: handing out a held block would
    /// alias two sequences onto the same storage.
    pub fn reserve(&mut self, ids: &[BlockId]) {
        for &id in ids {
            assert!(self.free.remove(&id), "block {id} reserved while not free");
        }
    }

    /// Return `ids` to the free list.
    ///
    /// Panics on double free or an id outside the pool.
    pub fn release(&mut self, ids: &[BlockId]) {
        for &id in ids {
            assert!(id < self.num_blocks, "block {id} outside pool of {}", self.num_blocks);
            assert!(self.free.insert(id), "block {id} released twice");
        }
        if !ids.is_empty() {
            debug!("released blocks {:?}", ids);
        }
    }

    /// Reserve and return the lowest `n` free block ids, or fail without
    /// touching the free list.
    pub fn take_lowest(&mut self, n: usize) -> Result<Vec<BlockId>> {
        let ids = self.find_available(n)?;
        self.reserve(&ids);
        if !ids.is_empty() {
            debug!("reserved blocks {:?}", ids);
        }
        Ok(ids)
    }
}
