/// Data index engine
///
/// Addresses sub-trees of a structured value by (repetition, field) coordinate
/// paths. Producers' outputs are sliced by the edge's source path and the
/// slices are spliced into the consumer's input at each edge's target path.

use crate::datatype::catalog::lookup;
use crate::datatype::types::{Data, DataIndex, DataType};
use crate::error::{EngineError, Result};
use std::collections::HashMap;

/// Leaves whose coordinate path starts with `path`, in depth-first order
pub fn data_using_data_index(types: &HashMap<i64, DataType>, data: &Data, path: &DataIndex) -> Result<Vec<String>> {
    let root = lookup(types, data.data_type_id)?;
    let mut values = data.values.iter();
    let mut selected = Vec::new();
    let mut addressed = path.steps().is_empty();
    let mut stack: Vec<(&DataType, Vec<(u32, u32)>)> = vec![(root, Vec::new())];

    while let Some((node, coord)) = stack.pop() {
        if coord.as_slice() == path.steps() {
            addressed = true;
        }
        if node.is_structure() {
            push_children(types, node, &coord, &mut stack)?;
            continue;
        }
        if !node.carries_value() {
            continue;
        }
        let value = values.next().ok_or_else(|| {
            EngineError::Decode(format!(
                "data {} is missing the leaf at {}",
                data.id,
                DataIndex(coord.clone())
            ))
        })?;
        if coord.starts_with(path.steps()) {
            selected.push(value.clone());
        }
    }

    if values.next().is_some() {
        return Err(EngineError::Decode(format!(
            "data {} has more values than data type {} has leaves",
            data.id, data.data_type_id
        )));
    }
    if !addressed {
        return Err(EngineError::Consistency(format!(
            "data index {} addresses nothing in data type {}",
            path, data.data_type_id
        )));
    }
    Ok(selected)
}

/// Assemble a consumer input from slices keyed by their target path
///
/// Every value-carrying leaf of the consumer type must be covered by exactly
/// one slice, and every slice must land on a coordinate of the type.
pub fn merge_partial_indexing(
    types: &HashMap<i64, DataType>,
    data_type_id: i64,
    slices: &[(DataIndex, Vec<String>)],
) -> Result<Vec<String>> {
    if data_type_id == 0 {
        return Ok(Vec::new());
    }
    let root = lookup(types, data_type_id)?;
    let mut used = vec![false; slices.len()];
    let mut merged = Vec::new();
    let mut stack: Vec<(&DataType, Vec<(u32, u32)>)> = vec![(root, Vec::new())];

    while let Some((node, coord)) = stack.pop() {
        let mut matches = slices
            .iter()
            .enumerate()
            .filter(|(_, (target, _))| target.steps() == coord.as_slice());

        if let Some((position, (target, values))) = matches.next() {
            if matches.next().is_some() {
                return Err(EngineError::Consistency(format!(
                    "more than one edge targets {} of data type {}",
                    target, data_type_id
                )));
            }
            let expected = leaf_count(types, node)?;
            if values.len() != expected {
                return Err(EngineError::Consistency(format!(
                    "edge into {} supplies {} values, data type {} needs {}",
                    target,
                    values.len(),
                    node.id,
                    expected
                )));
            }
            merged.extend(values.iter().cloned());
            used[position] = true;
            continue;
        }

        if node.is_structure() {
            push_children(types, node, &coord, &mut stack)?;
        } else if node.carries_value() {
            return Err(EngineError::Consistency(format!(
                "no edge covers {} of data type {}",
                DataIndex(coord.clone()),
                data_type_id
            )));
        }
    }

    if let Some(position) = used.iter().position(|u| !u) {
        return Err(EngineError::Consistency(format!(
            "edge target {} is not a coordinate of data type {}",
            slices[position].0, data_type_id
        )));
    }
    Ok(merged)
}

/// Number of value-carrying leaves beneath a type node
pub fn leaf_count(types: &HashMap<i64, DataType>, node: &DataType) -> Result<usize> {
    let mut total = 0usize;
    let mut stack: Vec<(&DataType, usize)> = vec![(node, 1)];
    while let Some((node, multiplier)) = stack.pop() {
        if node.is_structure() {
            for sub in &node.sub_data_types {
                stack.push((lookup(types, sub.sub_data_type_id)?, multiplier * node.length as usize));
            }
        } else if node.carries_value() {
            total += multiplier;
        }
    }
    Ok(total)
}

/// Coordinate of every value-carrying leaf, in depth-first order
pub fn leaf_coordinates(types: &HashMap<i64, DataType>, data_type_id: i64) -> Result<Vec<DataIndex>> {
    let root = lookup(types, data_type_id)?;
    let mut coordinates = Vec::new();
    let mut stack: Vec<(&DataType, Vec<(u32, u32)>)> = vec![(root, Vec::new())];
    while let Some((node, coord)) = stack.pop() {
        if node.is_structure() {
            push_children(types, node, &coord, &mut stack)?;
        } else if node.carries_value() {
            coordinates.push(DataIndex(coord));
        }
    }
    Ok(coordinates)
}

/// Push every (repetition, field) child so they pop in depth-first order
fn push_children<'a>(
    types: &'a HashMap<i64, DataType>,
    node: &'a DataType,
    coord: &[(u32, u32)],
    stack: &mut Vec<(&'a DataType, Vec<(u32, u32)>)>,
) -> Result<()> {
    for rep in (1..=node.length).rev() {
        for (field, sub) in node.sub_data_types.iter().enumerate().rev() {
            let mut child = coord.to_vec();
            child.push((rep, field as u32 + 1));
            stack.push((lookup(types, sub.sub_data_type_id)?, child));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::types::BaseKind;

    fn catalog() -> HashMap<i64, DataType> {
        [
            DataType::leaf(1, "int", BaseKind::Int),
            DataType::structure(2, "pair", 3, &[("a", 1), ("b", 1)]),
            DataType::structure(3, "wrapper", 1, &[("count", 1), ("pairs", 2)]),
            DataType::structure(4, "two", 1, &[("left", 1), ("right", 1)]),
        ]
        .into_iter()
        .map(|t| (t.id, t))
        .collect()
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn pair_data() -> Data {
        Data::transient(2, strings(&["1", "2", "3", "4", "5", "6"]))
    }

    #[test]
    fn test_empty_path_selects_everything() {
        let types = catalog();
        let data = pair_data();
        assert_eq!(data_using_data_index(&types, &data, &DataIndex::root()).unwrap(), data.values);
    }

    #[test]
    fn test_extracts_leaf_and_sub_tree() {
        let types = catalog();
        let data = pair_data();
        assert_eq!(
            data_using_data_index(&types, &data, &DataIndex(vec![(2, 2)])).unwrap(),
            strings(&["4"])
        );

        let nested = Data::transient(3, strings(&["9", "1", "2", "3", "4", "5", "6"]));
        assert_eq!(
            data_using_data_index(&types, &nested, &DataIndex(vec![(1, 2)])).unwrap(),
            strings(&["1", "2", "3", "4", "5", "6"])
        );
        assert_eq!(
            data_using_data_index(&types, &nested, &DataIndex(vec![(1, 2), (3, 1)])).unwrap(),
            strings(&["5"])
        );
    }

    #[test]
    fn test_path_outside_type_is_consistency_error() {
        let types = catalog();
        let err = data_using_data_index(&types, &pair_data(), &DataIndex(vec![(4, 1)])).unwrap_err();
        assert!(matches!(err, EngineError::Consistency(_)));
    }

    #[test]
    fn test_missing_leaf_is_decode_error() {
        let types = catalog();
        let short = Data::transient(2, strings(&["1", "2"]));
        let err = data_using_data_index(&types, &short, &DataIndex::root()).unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
    }

    #[test]
    fn test_split_and_merge_reconstructs_value_in_any_order() {
        let types = catalog();
        let data = pair_data();
        let mut slices: Vec<(DataIndex, Vec<String>)> = leaf_coordinates(&types, 2)
            .unwrap()
            .into_iter()
            .map(|coord| {
                let values = data_using_data_index(&types, &data, &coord).unwrap();
                (coord, values)
            })
            .collect();

        assert_eq!(merge_partial_indexing(&types, 2, &slices).unwrap(), data.values);
        slices.reverse();
        slices.swap(1, 4);
        assert_eq!(merge_partial_indexing(&types, 2, &slices).unwrap(), data.values);
    }

    #[test]
    fn test_merge_places_sub_tree_slices() {
        let types = catalog();
        let slices = vec![
            (DataIndex(vec![(1, 2)]), strings(&["1", "2", "3", "4", "5", "6"])),
            (DataIndex(vec![(1, 1)]), strings(&["3"])),
        ];
        assert_eq!(
            merge_partial_indexing(&types, 3, &slices).unwrap(),
            strings(&["3", "1", "2", "3", "4", "5", "6"])
        );
    }

    #[test]
    fn test_merge_requires_full_coverage() {
        let types = catalog();
        let slices = vec![(DataIndex(vec![(1, 1)]), strings(&["7"]))];
        let err = merge_partial_indexing(&types, 4, &slices).unwrap_err();
        assert!(err.to_string().contains("no edge covers"));
    }

    #[test]
    fn test_merge_rejects_overlaps_and_stray_targets() {
        let types = catalog();
        let doubled = vec![
            (DataIndex(vec![(1, 1)]), strings(&["7"])),
            (DataIndex(vec![(1, 1)]), strings(&["8"])),
            (DataIndex(vec![(1, 2)]), strings(&["9"])),
        ];
        assert!(merge_partial_indexing(&types, 4, &doubled).is_err());

        let stray = vec![
            (DataIndex::root(), strings(&["7", "8"])),
            (DataIndex(vec![(5, 5)]), strings(&["9"])),
        ];
        assert!(merge_partial_indexing(&types, 4, &stray).is_err());

        let wrong_size = vec![(DataIndex::root(), strings(&["7"]))];
        assert!(merge_partial_indexing(&types, 4, &wrong_size).is_err());
    }

    #[test]
    fn test_merge_into_empty_type() {
        let types = catalog();
        assert!(merge_partial_indexing(&types, 0, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_leaf_count_multiplies_repetitions() {
        let types = catalog();
        assert_eq!(leaf_count(&types, &types[&3]).unwrap(), 7);
        assert_eq!(leaf_coordinates(&types, 1).unwrap(), vec![DataIndex::root()]);
    }
}
