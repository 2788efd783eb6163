//! The paged cache manager: block accounting, sequence lifecycle, and
//! per-step index tensors for paged attention.
//!
//! One manager owns the preallocated K/V pool for every layer of a model
//! and tracks which blocks belong to which live sequence. The serving
//! loop drives it as follows:
//! - `add` each newly admitted sequence with its prompt length
//! - `add_token` for every live sequence before a decode step
//! - `block_tables` / `slot_mapping` to fetch the step's index tensors
//! - `cache(layer)` to hand the layer K/V tensors to the kernels
//! - `reorder` after beam selection, `remove` when a sequence finishes
//!
//! The manager is not safe for concurrent mutation; an external
//! orchestrator is expected to serialize all calls between model
//! executions.

use candle_core::{Device, Tensor};
use tracing::{debug, info};

use crate::config::CacheOptions;
use crate::error::{Error, Result};
use crate::memory;
use crate::pool::BlockPool;
use crate::sequence::{SequenceState, SequenceTable};
use crate::tables::{build_block_tables, build_slot_mapping};
use crate::types::{global_slot, SequenceId};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub num_blocks: usize,
    pub free_blocks: usize,
    pub allocated_blocks: usize,
    pub num_sequences: usize,
    pub memory_used_bytes: usize,
    pub memory_capacity_bytes: usize,
}

impl CacheStats {
    /// Fraction of the pool currently allocated (0.0 - 1.0).
    pub fn utilization(&self) -> f64 {
        if self.num_blocks == 0 {
            return 0.0;
        }
        self.allocated_blocks as f64 / self.num_blocks as f64
    }
}

/// Paged KV cache manager for a batch of concurrent sequences.
pub struct PagedCacheManager {
    options: CacheOptions,
    device: Device,
    pool: BlockPool,
    sequences: SequenceTable,
    block_bytes: usize,
}

impl PagedCacheManager {
    /// Create a manager, allocating the K/V pool on `device`.
    ///
    /// The pool size is `options.num_blocks` when given, otherwise
    /// derived from available device memory and `gpu_utilization`.
    pub fn new(options: CacheOptions, device: Device) -> Result<Self> {
        let available = if options.num_blocks.is_some() {
            None
        } else {
            memory::available_device_bytes(&device)
        };
        let num_blocks = options.resolve_num_blocks(available)?;
        let block_bytes = options.bytes_per_block()?;
        let pool = BlockPool::new(&options, num_blocks, &device)?;
        info!(
            num_blocks,
            block_size = options.block_size,
            num_layers = options.num_layers,
            "initialized paged KV cache ({} MB)",
            num_blocks * block_bytes / (1024 * 1024)
        );
        Ok(Self {
            options,
            device,
            pool,
            sequences: SequenceTable::new(),
            block_bytes,
        })
    }

    /// Reserve blocks for a new sequence's prompt and register it.
    ///
    /// Reserves `ceil(prompt_token_size / block_size)` blocks and records
    /// every prompt position as a write target for the prompt step.
    /// Either fully succeeds or leaves the manager untouched.
    pub fn add(&mut self, sequence_id: SequenceId, prompt_token_size: usize) -> Result<()> {
        if self.sequences.contains(sequence_id) {
            return Err(Error::DuplicateSequence(sequence_id));
        }
        let needed = self.options.blocks_for_tokens(prompt_token_size);
        let block_ids = self.pool.take_lowest(needed)?;
        let block_size = self.options.block_size;
        let slot_ids: Vec<usize> = (0..prompt_token_size)
            .map(|pos| global_slot(block_ids[pos / block_size], pos % block_size, block_size))
            .collect();
        let reserved = block_ids.clone();
        let state = SequenceState {
            sequence_id,
            block_ids,
            slot_ids,
            context_length: prompt_token_size,
            is_prompt: true,
        };
        if let Err(err) = self.sequences.append(state) {
            self.pool.release(&reserved);
            return Err(err);
        }
        debug!(
            sequence_id,
            prompt_token_size,
            "admitted sequence with blocks {:?}",
            reserved
        );
        Ok(())
    }

    /// Ensure a slot exists for the sequence's next token and record it
    /// as the step's only write target.
    ///
    /// Crossing a block boundary acquires one more block from the pool;
    /// a `CacheFull` failure leaves the sequence unchanged. The first
    /// call moves the sequence from the prompt stage to decode.
    pub fn add_token(&mut self, sequence_id: SequenceId) -> Result<()> {
        let block_size = self.options.block_size;
        let state = self
            .sequences
            .get_mut(sequence_id)
            .ok_or(Error::UnknownSequence(sequence_id))?;
        let next_pos = state.context_length;
        if next_pos % block_size == 0 {
            let fresh = self.pool.take_lowest(1)?;
            state.block_ids.extend(fresh);
        }
        let block_id = state.block_ids[next_pos / block_size];
        state.slot_ids = vec![global_slot(block_id, next_pos % block_size, block_size)];
        state.is_prompt = false;
        state.context_length += 1;
        Ok(())
    }

    /// Release a finished sequence's blocks back to the pool and drop
    /// its state.
    pub fn remove(&mut self, sequence_id: SequenceId) -> Result<()> {
        let state = self.sequences.remove(sequence_id)?;
        self.pool.release(&state.block_ids);
        debug!(
            sequence_id,
            "removed sequence, freed {} blocks",
            state.block_ids.len()
        );
        Ok(())
    }

    /// Reorder the sequence table to match a new beam order.
    ///
    /// `permutation[i] = j` moves the sequence currently at position `j`
    /// to position `i`. A permutation shorter than the number of live
    /// sequences drops the omitted positions: those sequences are
    /// removed and their blocks freed. No KV data is copied; only the
    /// row order of subsequent index tensors changes.
    pub fn reorder(&mut self, permutation: &[usize]) -> Result<()> {
        let len = self.sequences.len();
        if permutation.len() > len {
            return Err(Error::InvalidPermutation(format!(
                "length {} exceeds {} live sequences",
                permutation.len(),
                len
            )));
        }
        let mut seen = vec![false; len];
        for &pos in permutation {
            if pos >= len {
                return Err(Error::InvalidPermutation(format!(
                    "position {pos} out of range for {len} live sequences"
                )));
            }
            if seen[pos] {
                return Err(Error::InvalidPermutation(format!(
                    "position {pos} appears twice"
                )));
            }
            seen[pos] = true;
        }
        let dropped = self.sequences.permute(permutation);
        for state in &dropped {
            self.pool.release(&state.block_ids);
        }
        if !dropped.is_empty() {
            debug!("reorder dropped {} sequences", dropped.len());
        }
        Ok(())
    }

    /// The `[num_sequences, max_blocks_per_sequence]` block-table tensor
    /// for the current step, padded with `-1`. Rebuilt on every call; do
    /// not retain across steps.
    pub fn block_tables(&self) -> Result<Tensor> {
        build_block_tables(&self.sequences, &self.device)
    }

    /// The 1-D slot-mapping tensor for the current step. Rebuilt on
    /// every call; do not retain across steps.
    pub fn slot_mapping(&self) -> Result<Tensor> {
        build_slot_mapping(&self.sequences, &self.device)
    }

    /// Borrow the K and V cache tensors for `layer_id`.
    pub fn cache(&self, layer_id: usize) -> Result<(&Tensor, &Tensor)> {
        self.pool.layer(layer_id).ok_or(Error::LayerOutOfRange {
            layer: layer_id,
            num_layers: self.pool.num_layers(),
        })
    }

    /// True when `n` more blocks could be reserved right now.
    pub fn can_allocate(&self, n: usize) -> bool {
        self.pool.num_free() >= n
    }

    pub fn num_sequences(&self) -> usize {
        self.sequences.len()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.pool.num_free()
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Ids of live sequences in table order.
    pub fn sequence_ids(&self) -> Vec<SequenceId> {
        self.sequences.sequence_ids()
    }

    /// Context length of a live sequence.
    pub fn context_length(&self, sequence_id: SequenceId) -> Option<usize> {
        self.sequences.get(sequence_id).map(|s| s.context_length)
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            num_blocks: self.pool.num_blocks(),
            free_blocks: self.pool.num_free(),
            allocated_blocks: self.pool.num_allocated(),
            num_sequences: self.sequences.len(),
            memory_used_bytes: self.pool.num_allocated() * self.block_bytes,
            memory_capacity_bytes: self.pool.num_blocks() * self.block_bytes,
        }
    }

    #[cfg(test)]
    pub(crate) fn sequence(&self, sequence_id: SequenceId) -> Option<&SequenceState> {
        self.sequences.get(sequence_id)
    }
}
