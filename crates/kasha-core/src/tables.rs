//! Materialization of the per-step index tensors consumed by attention
//! kernels.
//!
//! Both tensors are rebuilt from the sequence table on every call and
//! describe only the upcoming step; callers must not retain them across
//! steps.

use candle_core::{Device, Tensor};

use crate::error::Result;
use crate::sequence::SequenceTable;

/// Padding value in the block-table tensor. Never a valid block id.
pub const BLOCK_TABLE_PAD: i64 = -1;

/// Build the `[num_sequences, max_blocks_per_sequence]` block-table
/// tensor. Row `i` holds the block ids of the sequence at position `i`
/// in the table, right-padded with [`BLOCK_TABLE_PAD`]. With no live
/// sequences the result is 0x0.
pub fn build_block_tables(table: &SequenceTable, device: &Device) -> Result<Tensor> {
    let rows = table.len();
    let width = table.iter().map(|s| s.block_ids.len()).max().unwrap_or(0);
    let mut data = Vec::with_capacity(rows * width);
    for state in table.iter() {
        data.extend(state.block_ids.iter().map(|&b| b as i64));
        data.extend(std::iter::repeat(BLOCK_TABLE_PAD).take(width - state.block_ids.len()));
    }
    Ok(Tensor::from_vec(data, (rows, width), device)?)
}

/// Build the 1-D slot-mapping tensor: every live sequence's write-target
/// slot ids concatenated in table order. One element per prompt token
/// for prompt-stage sequences, one element total for decode-stage ones.
pub fn build_slot_mapping(table: &SequenceTable, device: &Device) -> Result<Tensor> {
    let data: Vec<i64> = table
        .iter()
        .flat_map(|s| s.slot_ids.iter().map(|&slot| slot as i64))
        .collect();
    let len = data.len();
    Ok(Tensor::from_vec(data, (len,), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::SequenceState;

    fn table_of(rows: &[(u64, Vec<usize>, Vec<usize>)]) -> SequenceTable {
        let mut table = SequenceTable::new();
        for (sequence_id, block_ids, slot_ids) in rows {
            table
                .append(SequenceState {
                    sequence_id: *sequence_id,
                    block_ids: block_ids.clone(),
                    slot_ids: slot_ids.clone(),
                    context_length: slot_ids.len(),
                    is_prompt: true,
                })
                .unwrap();
        }
        table
    }

    #[test]
    fn test_block_tables_pads_to_widest_row() {
        let table = table_of(&[
            (2, vec![0, 1, 2], vec![]),
            (5, vec![3, 7, 9], vec![]),
            (7, vec![4, 5, 6, 8], vec![]),
        ]);
        let tensor = build_block_tables(&table, &Device::Cpu).unwrap();
        assert_eq!(
            tensor.to_vec2::<i64>().unwrap(),
            vec![
                vec![0, 1, 2, -1],
                vec![3, 7, 9, -1],
                vec![4, 5, 6, 8],
            ]
        );
    }

    #[test]
    fn test_block_tables_equal_widths_have_no_padding() {
        let table = table_of(&[(1, vec![0], vec![]), (2, vec![1], vec![])]);
        let tensor = build_block_tables(&table, &Device::Cpu).unwrap();
        assert_eq!(tensor.to_vec2::<i64>().unwrap(), vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_block_tables_empty_table() {
        let tensor = build_block_tables(&SequenceTable::new(), &Device::Cpu).unwrap();
        assert_eq!(tensor.dims2().unwrap(), (0, 0));
    }

    #[test]
    fn test_slot_mapping_concatenates_in_table_order() {
        let table = table_of(&[
            (2, vec![0], vec![0, 1, 2, 3]),
            (5, vec![1], vec![16, 17, 18, 19, 20]),
            (7, vec![2], vec![32, 33, 34]),
        ]);
        let tensor = build_slot_mapping(&table, &Device::Cpu).unwrap();
        assert_eq!(
            tensor.to_vec1::<i64>().unwrap(),
            vec![0, 1, 2, 3, 16, 17, 18, 19, 20, 32, 33, 34]
        );
    }

    #[test]
    fn test_slot_mapping_empty_table() {
        let tensor = build_slot_mapping(&SequenceTable::new(), &Device::Cpu).unwrap();
        assert_eq!(tensor.dims1().unwrap(), 0);
    }
}
