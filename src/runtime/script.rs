/// Embedded Lua execution for SCRIPT tasks
///
/// The input is exposed as the global `input` in object form and the script
/// must assign the global `output`, which is decoded against the task's
/// output type. Every failure here is a script error.

use crate::datatype::codec::{data_to_object, object_to_data};
use crate::datatype::{Data, DataType};
use crate::error::{EngineError, Result};
use mlua::LuaSerdeExt;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Globals removed before user code runs
const BLOCKED_GLOBALS: &[&str] = &["os", "io", "debug", "package", "require", "dofile", "loadfile"];

/// Run `code` against `input` and return the decoded output leaves
pub fn run_script(types: &HashMap<i64, DataType>, code: &str, input: &Data, output_data_type_id: i64) -> Result<Vec<String>> {
    let input_object = data_to_object(types, input)?;

    let lua = mlua::Lua::new();
    let globals = lua.globals();
    for name in BLOCKED_GLOBALS {
        globals
            .set(*name, mlua::Nil)
            .map_err(|e| EngineError::Script(format!("failed to sandbox '{}': {}", name, e)))?;
    }

    let input_value = lua
        .to_value(&input_object)
        .map_err(|e| EngineError::Script(format!("failed to expose input: {}", e)))?;
    globals
        .set("input", input_value)
        .map_err(|e| EngineError::Script(format!("failed to set input: {}", e)))?;

    tracing::debug!("🏃 Executing Lua script ({} bytes)", code.len());
    lua.load(code)
        .set_name("task")
        .exec()
        .map_err(|e| EngineError::Script(format!("Lua script execution failed: {}", e)))?;

    let output: mlua::Value = globals
        .get("output")
        .map_err(|e| EngineError::Script(format!("failed to read output: {}", e)))?;
    if output.is_nil() {
        return Err(EngineError::Script("script did not assign the global 'output'".to_string()));
    }

    let output_object = lua_to_json(output)?;
    object_to_data(types, &output_object, output_data_type_id)
        .map_err(|e| EngineError::Script(format!("script output does not match data type {}: {}", output_data_type_id, e)))
}

/// Deepest table nesting accepted in a script's output
const MAX_OUTPUT_DEPTH: usize = 64;

/// Convert Lua value to JSON Value
fn lua_to_json(lua_value: mlua::Value) -> Result<Value> {
    let mut open_tables = HashSet::new();
    lua_value_to_json(lua_value, 0, &mut open_tables)
}

/// `open_tables` holds the tables on the current path, so a table that
/// contains itself is reported instead of followed.
fn lua_value_to_json(lua_value: mlua::Value, depth: usize, open_tables: &mut HashSet<usize>) -> Result<Value> {
    match lua_value {
        mlua::Value::Nil => Ok(Value::Null),
        mlua::Value::Boolean(b) => Ok(Value::Bool(b)),
        mlua::Value::Integer(i) => Ok(Value::Number(serde_json::Number::from(i))),
        mlua::Value::Number(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| EngineError::Script(format!("script produced non-finite number {}", f))),
        mlua::Value::String(s) => {
            let s_str = s
                .to_str()
                .map_err(|e| EngineError::Script(format!("invalid UTF-8 in Lua string: {}", e)))?;
            Ok(Value::String(s_str.to_string()))
        }
        mlua::Value::Table(table) => {
            if depth >= MAX_OUTPUT_DEPTH {
                return Err(EngineError::Script(format!(
                    "script output is nested deeper than {} tables",
                    MAX_OUTPUT_DEPTH
                )));
            }
            let identity = table.to_pointer() as usize;
            if !open_tables.insert(identity) {
                return Err(EngineError::Script("script output contains a table that refers to itself".to_string()));
            }
            let converted = table_to_json(&table, depth, open_tables);
            open_tables.remove(&identity);
            converted
        }
        // mlua's JSON null sentinel and other userdata-like values
        _ => Ok(Value::Null),
    }
}

fn table_to_json(table: &mlua::Table, depth: usize, open_tables: &mut HashSet<usize>) -> Result<Value> {
    // Sequence tables become arrays, everything else a record
    let mut is_array = true;
    let mut max_index = 0;
    let mut count = 0;

    for pair in table.pairs::<mlua::Value, mlua::Value>() {
        let (key, _) = pair.map_err(|e| EngineError::Script(format!("failed to iterate Lua table: {}", e)))?;
        count += 1;
        match key {
            mlua::Value::Integer(i) if i > 0 => max_index = max_index.max(i as usize),
            _ => {
                is_array = false;
                break;
            }
        }
    }

    if is_array && count > 0 && count == max_index {
        let mut arr = Vec::with_capacity(max_index);
        for i in 1..=max_index {
            let val: mlua::Value = table
                .get(i)
                .map_err(|e| EngineError::Script(format!("failed to get Lua table value: {}", e)))?;
            arr.push(lua_value_to_json(val, depth + 1, open_tables)?);
        }
        Ok(Value::Array(arr))
    } else {
        let mut obj = serde_json::Map::new();
        for pair in table.pairs::<mlua::Value, mlua::Value>() {
            let (key, value) = pair.map_err(|e| EngineError::Script(format!("failed to iterate Lua table: {}", e)))?;
            let key_str = match key {
                mlua::Value::String(s) => s
                    .to_str()
                    .map_err(|e| EngineError::Script(format!("invalid UTF-8 in Lua key: {}", e)))?
                    .to_string(),
                mlua::Value::Integer(i) => i.to_string(),
                _ => continue,
            };
            obj.insert(key_str, lua_value_to_json(value, depth + 1, open_tables)?);
        }
        Ok(Value::Object(obj))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::BaseKind;

    fn catalog() -> HashMap<i64, DataType> {
        [
            DataType::leaf(1, "int", BaseKind::Int),
            DataType::leaf(2, "text", BaseKind::Text),
            DataType::structure(3, "pair", 2, &[("n", 1), ("label", 2)]),
        ]
        .into_iter()
        .map(|t| (t.id, t))
        .collect()
    }

    #[test]
    fn test_scalar_script() {
        let types = catalog();
        let input = Data::transient(1, vec!["21".to_string()]);
        let output = run_script(&types, "output = input * 2", &input, 1).unwrap();
        assert_eq!(output, vec!["42".to_string()]);
    }

    #[test]
    fn test_structured_script() {
        let types = catalog();
        let input = Data::transient(3, vec!["1".into(), "a".into(), "2".into(), "b".into()]);
        let code = r#"
            output = {}
            for i, row in ipairs(input) do
                output[i] = { n = row.n * 10, label = string.upper(row.label) }
            end
        "#;
        let output = run_script(&types, code, &input, 3).unwrap();
        assert_eq!(output, vec!["10", "A", "20", "B"]);
    }

    #[test]
    fn test_raising_script_is_script_error() {
        let types = catalog();
        let input = Data::transient(1, vec!["1".to_string()]);
        let err = run_script(&types, "error('boom')", &input, 1).unwrap_err();
        assert!(err.is_script());
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_missing_or_mistyped_output_is_script_error() {
        let types = catalog();
        let input = Data::transient(1, vec!["1".to_string()]);
        assert!(run_script(&types, "local x = input", &input, 1).unwrap_err().is_script());
        assert!(run_script(&types, "output = 'nope'", &input, 1).unwrap_err().is_script());
    }

    #[test]
    fn test_sandbox_blocks_os() {
        let types = catalog();
        let input = Data::transient(1, vec!["1".to_string()]);
        let err = run_script(&types, "output = os.time()", &input, 1).unwrap_err();
        assert!(err.is_script());
    }

    #[test]
    fn test_self_referencing_output_is_script_error() {
        let types = catalog();
        let input = Data::transient(1, vec!["1".to_string()]);
        let err = run_script(&types, "local t = {}; t.x = t; output = t", &input, 1).unwrap_err();
        assert!(err.is_script());
        assert!(err.to_string().contains("refers to itself"));
    }

    #[test]
    fn test_deeply_nested_output_is_script_error() {
        let types = catalog();
        let input = Data::transient(1, vec!["1".to_string()]);
        let code = "local t = {} ; output = t ; for i = 1, 10000 do t.next = {} ; t = t.next end";
        let err = run_script(&types, code, &input, 1).unwrap_err();
        assert!(err.is_script());
        assert!(err.to_string().contains("nested deeper"));
    }

    #[test]
    fn test_shared_table_is_not_a_cycle() {
        let types = catalog();
        let input = Data::transient(1, vec!["1".to_string()]);
        // the same row table appears twice, side by side
        let code = "local row = { n = 1, label = 'x' } ; output = { row, row }";
        let output = run_script(&types, code, &input, 3).unwrap();
        assert_eq!(output, vec!["1", "x", "1", "x"]);
    }
}
