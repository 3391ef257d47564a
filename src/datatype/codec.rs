/// Data codec: flat leaf lists to and from text streams and JSON objects
///
/// Every conversion is driven by the recursive shape of the value's data type
/// and walks it with an explicit stack, so the nesting depth of a registry
/// type never turns into call-stack depth.
///
/// Text form (process stdin/stdout): space separated tokens, newline
/// terminated. A structure emits its repetition count, a scalar emits its
/// value, a TEXT scalar emits its character count followed by one codepoint
/// per character.
///
/// Object form (HTTP bodies, script globals): a structure is an array of
/// `length` records keyed by sub-type title, scalars map to JSON scalars.
///
/// INT and FLOAT leaves are kept in canonical text (the JSON rendering of the
/// parsed number), so both forms reproduce stored values exactly. Values
/// arriving from outside go through [`canonical_values`] before they are
/// persisted.

use crate::datatype::catalog::lookup;
use crate::datatype::types::{BaseKind, Data, DataType};
use crate::error::{EngineError, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Encode a data value as a whitespace-delimited token stream
pub fn data_to_text(types: &HashMap<i64, DataType>, data: &Data) -> Result<String> {
    let root = lookup(types, data.data_type_id)?;
    let mut values = data.values.iter();
    let mut tokens: Vec<String> = Vec::new();
    let mut stack: Vec<&DataType> = vec![root];

    while let Some(node) = stack.pop() {
        if node.is_structure() {
            tokens.push(node.length.to_string());
            push_children(types, node, &mut stack)?;
            continue;
        }
        match node.base {
            BaseKind::None => tokens.push("0".to_string()),
            BaseKind::Text => {
                let value = next_value(&mut values, node)?;
                tokens.push(value.chars().count().to_string());
                tokens.extend(value.chars().map(|c| (c as u32).to_string()));
            }
            _ => {
                let value = next_value(&mut values, node)?;
                tokens.push(canonical_scalar(node.base, value)?);
            }
        }
    }

    if values.next().is_some() {
        return Err(EngineError::Decode(format!(
            "data {} has more values than data type {} has leaves",
            data.id, data.data_type_id
        )));
    }

    let mut text = tokens.join(" ");
    text.push('\n');
    Ok(text)
}

/// Decode a token stream produced by an external process
pub fn text_to_data(types: &HashMap<i64, DataType>, text: &str, data_type_id: i64) -> Result<Vec<String>> {
    let root = lookup(types, data_type_id)?;
    let mut tokens = text.split_whitespace();
    let mut values = Vec::new();
    let mut stack: Vec<&DataType> = vec![root];

    while let Some(node) = stack.pop() {
        if node.is_structure() {
            let token = next_token(&mut tokens)?;
            let count: u32 = token
                .parse()
                .map_err(|_| EngineError::Decode(format!("repetition count '{}' is not a number", token)))?;
            if count != node.length {
                return Err(EngineError::Decode(format!(
                    "repetition count {} does not match length {} of data type {}",
                    count, node.length, node.id
                )));
            }
            push_children(types, node, &mut stack)?;
            continue;
        }
        match node.base {
            BaseKind::None => {
                next_token(&mut tokens)?;
            }
            BaseKind::Text => {
                let token = next_token(&mut tokens)?;
                let count: usize = token
                    .parse()
                    .map_err(|_| EngineError::Decode(format!("text length '{}' is not a number", token)))?;
                let mut value = String::with_capacity(count);
                for _ in 0..count {
                    let token = next_token(&mut tokens)?;
                    let ch = token
                        .parse::<u32>()
                        .ok()
                        .and_then(char::from_u32)
                        .ok_or_else(|| EngineError::Decode(format!("'{}' is not a valid codepoint", token)))?;
                    value.push(ch);
                }
                values.push(value);
            }
            base => {
                let token = next_token(&mut tokens)?;
                values.push(canonical_scalar(base, token)?);
            }
        }
    }

    if let Some(extra) = tokens.next() {
        return Err(EngineError::Decode(format!(
            "unexpected trailing token '{}' after data type {}",
            extra, data_type_id
        )));
    }
    Ok(values)
}

/// Check leaf count and scalar syntax of externally supplied values and
/// return them in canonical form
pub fn canonical_values(types: &HashMap<i64, DataType>, data_type_id: i64, values: &[String]) -> Result<Vec<String>> {
    let root = lookup(types, data_type_id)?;
    let mut remaining = values.iter();
    let mut canonical = Vec::with_capacity(values.len());
    let mut stack: Vec<&DataType> = vec![root];

    while let Some(node) = stack.pop() {
        if node.is_structure() {
            push_children(types, node, &mut stack)?;
            continue;
        }
        match node.base {
            BaseKind::None => {}
            BaseKind::Text => canonical.push(next_value(&mut remaining, node)?.clone()),
            base => canonical.push(canonical_scalar(base, next_value(&mut remaining, node)?)?),
        }
    }

    if remaining.next().is_some() {
        return Err(EngineError::Decode(format!(
            "{} values given, data type {} has {} leaves",
            values.len(),
            data_type_id,
            canonical.len()
        )));
    }
    Ok(canonical)
}

/// Partially built array of records for one structure node
struct StructFrame<'a> {
    data_type: &'a DataType,
    rep: u32,
    field: usize,
    items: Vec<Value>,
    record: Map<String, Value>,
}

impl<'a> StructFrame<'a> {
    fn new(data_type: &'a DataType) -> Self {
        Self {
            data_type,
            rep: 0,
            field: 0,
            items: Vec::with_capacity(data_type.length as usize),
            record: Map::new(),
        }
    }

    fn is_complete(&self) -> bool {
        self.rep >= self.data_type.length
    }

    fn current_title(&self) -> &'a str {
        &self.data_type.sub_data_types[self.field].title
    }

    /// Store the value of the current field and move to the next one
    fn fill(&mut self, value: Value) {
        let title = self.current_title().to_string();
        self.record.insert(title, value);
        self.field += 1;
        if self.field == self.data_type.sub_data_types.len() {
            self.items.push(Value::Object(std::mem::take(&mut self.record)));
            self.field = 0;
            self.rep += 1;
        }
    }
}

/// Encode a data value as nested JSON mirroring its data type
pub fn data_to_object(types: &HashMap<i64, DataType>, data: &Data) -> Result<Value> {
    let root = lookup(types, data.data_type_id)?;
    let mut values = data.values.iter();

    let object = if root.is_structure() {
        let mut stack = vec![StructFrame::new(root)];
        loop {
            let Some(top) = stack.last() else {
                return Err(EngineError::Decode("structure walk lost its root".to_string()));
            };
            if top.is_complete() {
                let Some(done) = stack.pop() else { break Value::Null };
                let array = Value::Array(done.items);
                match stack.last_mut() {
                    Some(parent) => parent.fill(array),
                    None => break array,
                }
                continue;
            }

            let sub_id = top.data_type.sub_data_types[top.field].sub_data_type_id;
            let sub = lookup(types, sub_id)?;
            if sub.is_structure() {
                stack.push(StructFrame::new(sub));
            } else {
                let leaf = leaf_to_value(sub, &mut values)?;
                if let Some(top) = stack.last_mut() {
                    top.fill(leaf);
                }
            }
        }
    } else {
        leaf_to_value(root, &mut values)?
    };

    if values.next().is_some() {
        return Err(EngineError::Decode(format!(
            "data {} has more values than data type {} has leaves",
            data.id, data.data_type_id
        )));
    }
    Ok(object)
}

/// Decode nested JSON against a data type into a flat leaf list
pub fn object_to_data(types: &HashMap<i64, DataType>, object: &Value, data_type_id: i64) -> Result<Vec<String>> {
    let root = lookup(types, data_type_id)?;
    let mut values = Vec::new();

    if !root.is_structure() {
        value_to_leaf(root, object, &mut values)?;
        return Ok(values);
    }

    // (data type, its records, next repetition, next field)
    let mut stack: Vec<(&DataType, &Vec<Value>, u32, usize)> = vec![(root, records_of(root, object)?, 0, 0)];

    while let Some((node, records, rep, field)) = stack.pop() {
        if rep >= node.length {
            continue;
        }
        let (next_rep, next_field) = if field + 1 == node.sub_data_types.len() {
            (rep + 1, 0)
        } else {
            (rep, field + 1)
        };
        stack.push((node, records, next_rep, next_field));

        let record = records[rep as usize].as_object().ok_or_else(|| {
            EngineError::Decode(format!("element {} of data type {} is not a record", rep + 1, node.id))
        })?;
        let sub_ref = &node.sub_data_types[field];
        let value = record.get(&sub_ref.title).ok_or_else(|| {
            EngineError::Decode(format!(
                "record {} of data type {} has no field '{}'",
                rep + 1,
                node.id,
                sub_ref.title
            ))
        })?;
        let sub = lookup(types, sub_ref.sub_data_type_id)?;
        if sub.is_structure() {
            stack.push((sub, records_of(sub, value)?, 0, 0));
        } else {
            value_to_leaf(sub, value, &mut values)?;
        }
    }

    Ok(values)
}

fn push_children<'a>(types: &'a HashMap<i64, DataType>, node: &'a DataType, stack: &mut Vec<&'a DataType>) -> Result<()> {
    let mut children = Vec::with_capacity(node.sub_data_types.len());
    for sub in &node.sub_data_types {
        children.push(lookup(types, sub.sub_data_type_id)?);
    }
    for _ in 0..node.length {
        stack.extend(children.iter().rev().copied());
    }
    Ok(())
}

fn next_value<'v>(values: &mut std::slice::Iter<'v, String>, node: &DataType) -> Result<&'v String> {
    values
        .next()
        .ok_or_else(|| EngineError::Decode(format!("missing leaf value for data type {}", node.id)))
}

fn next_token<'t>(tokens: &mut std::str::SplitWhitespace<'t>) -> Result<&'t str> {
    tokens
        .next()
        .ok_or_else(|| EngineError::Decode("token stream ended before the data type was complete".to_string()))
}

/// Canonical text of an INT or FLOAT leaf; TEXT passes through
fn canonical_scalar(base: BaseKind, value: &str) -> Result<String> {
    let canonical = match base {
        BaseKind::Int => value.parse::<i64>().ok().map(|i| i.to_string()),
        BaseKind::Float => value
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(|n| n.to_string()),
        _ => Some(value.to_string()),
    };
    canonical.ok_or_else(|| EngineError::Decode(format!("'{}' is not a valid {:?} value", value, base)))
}

fn leaf_to_value(node: &DataType, values: &mut std::slice::Iter<'_, String>) -> Result<Value> {
    if node.base == BaseKind::None {
        return Ok(Value::Null);
    }
    let raw = next_value(values, node)?;
    match node.base {
        BaseKind::Int => raw
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| EngineError::Decode(format!("'{}' is not a valid Int value", raw))),
        BaseKind::Float => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| EngineError::Decode(format!("'{}' is not a finite Float value", raw))),
        _ => Ok(Value::String(raw.clone())),
    }
}

fn value_to_leaf(node: &DataType, value: &Value, values: &mut Vec<String>) -> Result<()> {
    let leaf = match (node.base, value) {
        (BaseKind::None, _) => return Ok(()),
        (BaseKind::Int, Value::Number(n)) => match n.as_i64() {
            Some(i) => i.to_string(),
            None => match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => (f as i64).to_string(),
                _ => return Err(EngineError::Decode(format!("{} is not an integer", n))),
            },
        },
        (BaseKind::Float, Value::Number(n)) => n
            .as_f64()
            .and_then(serde_json::Number::from_f64)
            .map(|f| f.to_string())
            .ok_or_else(|| EngineError::Decode(format!("{} is not a finite float", n)))?,
        (BaseKind::Text, Value::String(s)) => s.clone(),
        (base, other) => {
            return Err(EngineError::Decode(format!(
                "expected a {:?} value for data type {}, found {}",
                base, node.id, other
            )))
        }
    };
    values.push(leaf);
    Ok(())
}

fn records_of<'v>(node: &DataType, value: &'v Value) -> Result<&'v Vec<Value>> {
    let records = value
        .as_array()
        .ok_or_else(|| EngineError::Decode(format!("data type {} expects an array of records", node.id)))?;
    if records.len() != node.length as usize {
        return Err(EngineError::Decode(format!(
            "data type {} expects {} records, found {}",
            node.id,
            node.length,
            records.len()
        )));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn catalog() -> HashMap<i64, DataType> {
        [
            DataType::leaf(1, "int", BaseKind::Int),
            DataType::leaf(2, "float", BaseKind::Float),
            DataType::leaf(3, "text", BaseKind::Text),
            DataType::structure(4, "point", 2, &[("x", 1), ("y", 2)]),
            DataType::structure(5, "named", 1, &[("name", 3), ("points", 4)]),
            DataType::leaf(6, "nothing", BaseKind::None),
            DataType::structure(7, "tagged", 1, &[("tag", 6), ("n", 1)]),
        ]
        .into_iter()
        .map(|t| (t.id, t))
        .collect()
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_text_encoding_of_nested_structure() {
        let types = catalog();
        let data = Data::transient(5, strings(&["ab", "1", "2.5", "-3", "0.25"]));

        let text = data_to_text(&types, &data).unwrap();
        assert_eq!(text, "1 2 97 98 2 1 2.5 -3 0.25\n");
        assert_eq!(text_to_data(&types, &text, 5).unwrap(), data.values);
    }

    #[test]
    fn test_text_decoding_rejects_wrong_repetition_count() {
        let types = catalog();
        let err = text_to_data(&types, "3 1 2.5 2 3.5 3 4.5", 4).unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
    }

    #[test]
    fn test_text_decoding_rejects_truncated_and_trailing_input() {
        let types = catalog();
        assert!(text_to_data(&types, "2 1 2.5 2", 4).is_err());
        assert!(text_to_data(&types, "7 8", 1).is_err());
        assert!(text_to_data(&types, "seven", 1).is_err());
    }

    #[test]
    fn test_none_leaves_carry_no_value() {
        let types = catalog();
        let data = Data::transient(7, strings(&["9"]));

        let text = data_to_text(&types, &data).unwrap();
        assert_eq!(text, "1 0 9\n");
        assert_eq!(text_to_data(&types, &text, 7).unwrap(), strings(&["9"]));

        let object = data_to_object(&types, &data).unwrap();
        assert_eq!(object, json!([{"tag": null, "n": 9}]));
        assert_eq!(object_to_data(&types, &object, 7).unwrap(), strings(&["9"]));
    }

    #[test]
    fn test_empty_type_round_trips() {
        let types = catalog();
        let empty = Data::transient(0, Vec::new());
        assert_eq!(data_to_text(&types, &empty).unwrap(), "0\n");
        assert!(text_to_data(&types, "0\n", 0).unwrap().is_empty());
    }

    #[test]
    fn test_object_encoding_of_nested_structure() {
        let types = catalog();
        let data = Data::transient(5, strings(&["ab", "1", "2.5", "-3", "0.25"]));

        let object = data_to_object(&types, &data).unwrap();
        assert_eq!(
            object,
            json!([{"name": "ab", "points": [{"x": 1, "y": 2.5}, {"x": -3, "y": 0.25}]}])
        );
        assert_eq!(object_to_data(&types, &object, 5).unwrap(), data.values);
    }

    #[test]
    fn test_object_decoding_is_strict() {
        let types = catalog();
        // wrong record count
        assert!(object_to_data(&types, &json!([{"x": 1, "y": 2.0}]), 4).is_err());
        // missing field
        assert!(object_to_data(&types, &json!([{"x": 1}, {"x": 2, "y": 1.0}]), 4).is_err());
        // wrong scalar kind
        assert!(object_to_data(&types, &json!("12"), 1).is_err());
        assert!(object_to_data(&types, &json!(1.5), 1).is_err());
    }

    #[test]
    fn test_integral_float_accepted_for_int() {
        let types = catalog();
        assert_eq!(object_to_data(&types, &json!(4.0), 1).unwrap(), strings(&["4"]));
    }

    #[test]
    fn test_value_count_mismatch_is_decode_error() {
        let types = catalog();
        let short = Data::transient(4, strings(&["1", "2.5"]));
        assert!(matches!(data_to_text(&types, &short), Err(EngineError::Decode(_))));

        let long = Data::transient(1, strings(&["1", "2"]));
        assert!(matches!(data_to_object(&types, &long), Err(EngineError::Decode(_))));
    }

    #[test]
    fn test_numeric_leaves_are_canonicalised() {
        let types = catalog();
        assert_eq!(canonical_values(&types, 2, &strings(&["3"])).unwrap(), strings(&["3.0"]));
        assert_eq!(canonical_values(&types, 2, &strings(&["1.50"])).unwrap(), strings(&["1.5"]));
        assert_eq!(canonical_values(&types, 2, &strings(&["1e3"])).unwrap(), strings(&["1000.0"]));
        assert_eq!(canonical_values(&types, 1, &strings(&["+007"])).unwrap(), strings(&["7"]));
        assert_eq!(text_to_data(&types, "1 2 97 98 2 01 2.50 -3 1e0\n", 5).unwrap(), strings(&["ab", "1", "2.5", "-3", "1.0"]));
        assert_eq!(object_to_data(&types, &json!(3), 2).unwrap(), strings(&["3.0"]));
    }

    #[test]
    fn test_canonical_values_checks_leaf_count() {
        let types = catalog();
        assert_eq!(canonical_values(&types, 7, &strings(&["9"])).unwrap(), strings(&["9"]));
        assert!(matches!(canonical_values(&types, 4, &strings(&["1", "2.5"])), Err(EngineError::Decode(_))));
        assert!(matches!(canonical_values(&types, 1, &strings(&["1", "2"])), Err(EngineError::Decode(_))));
    }

    #[test]
    fn test_non_finite_floats_are_rejected_by_both_forms() {
        let types = catalog();
        for raw in ["NaN", "inf", "-infinity"] {
            let data = Data::transient(2, strings(&[raw]));
            assert!(matches!(data_to_text(&types, &data), Err(EngineError::Decode(_))));
            assert!(matches!(data_to_object(&types, &data), Err(EngineError::Decode(_))));
            assert!(text_to_data(&types, &format!("{}\n", raw), 2).is_err());
            assert!(canonical_values(&types, 2, &strings(&[raw])).is_err());
        }
    }

    /// Number text as a client or process might write it
    fn float_text() -> impl Strategy<Value = String> {
        prop_oneof![
            (-1000i32..1000).prop_map(|i| i.to_string()),
            (-1000i32..1000, 0u32..100).prop_map(|(i, f)| format!("{}.{:02}0", i, f)),
            (-9i32..10, -30i32..30).prop_map(|(m, e)| format!("{}e{}", m, e)),
            any::<f64>().prop_filter("finite", |f| f.is_finite()).prop_map(|f| f.to_string()),
        ]
    }

    fn named_values() -> impl Strategy<Value = Vec<String>> {
        (
            "[a-zA-Z0-9 éß]{0,12}",
            proptest::collection::vec((any::<i64>(), float_text()), 2),
        )
            .prop_map(|(name, points)| {
                let mut values = vec![name];
                for (x, y) in points {
                    values.push(x.to_string());
                    values.push(y);
                }
                values
            })
    }

    proptest! {
        #[test]
        fn prop_canonical_values_are_stable(values in named_values()) {
            let types = catalog();
            let canonical = canonical_values(&types, 5, &values).unwrap();
            prop_assert_eq!(canonical_values(&types, 5, &canonical).unwrap(), canonical);
        }

        #[test]
        fn prop_text_round_trip(values in named_values()) {
            let types = catalog();
            let data = Data::transient(5, canonical_values(&types, 5, &values).unwrap());
            let text = data_to_text(&types, &data).unwrap();
            prop_assert_eq!(text_to_data(&types, &text, 5).unwrap(), data.values);
        }

        #[test]
        fn prop_object_round_trip(values in named_values()) {
            let types = catalog();
            let data = Data::transient(5, canonical_values(&types, 5, &values).unwrap());
            let object = data_to_object(&types, &data).unwrap();
            prop_assert_eq!(object_to_data(&types, &object, 5).unwrap(), data.values);
        }
    }
}
