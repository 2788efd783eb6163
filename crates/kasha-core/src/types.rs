//! Shared identifier types and slot arithmetic.

/// Index of a physical block in the pool. Blocks are indexed uniformly
/// across layers: block `b` names the same ordinal region in every
/// layer's K and V tensors.
pub type BlockId = usize;

/// Caller-supplied identifier for a sequence, unique among live sequences.
pub type SequenceId = u64;

/// Global slot id for the token stored at `offset` within `block_id`.
#[inline]
pub fn global_slot(block_id: BlockId, offset: usize, block_size: usize) -> usize {
    block_id * block_size + offset
}

/// Split a global slot id back into `(block_id, offset)`.
#[inline]
pub fn split_slot(slot_id: usize, block_size: usize) -> (BlockId, usize) {
    (slot_id / block_size, slot_id % block_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_round_trip() {
        let slot = global_slot(2, 11, 16);
        assert_eq!(slot, 43);
        assert_eq!(split_slot(slot, 16), (2, 11));
    }

    #[test]
    fn test_first_slot_of_block() {
        assert_eq!(global_slot(3, 0, 16), 48);
        assert_eq!(split_slot(48, 16), (3, 0));
    }
}
