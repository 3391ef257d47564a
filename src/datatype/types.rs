/// Data type, data value and data index definitions
///
/// Data types are recursive schemas supplied by the external type registry.
/// Data values are persisted as a flat ordered list of scalar leaves whose
/// meaning is recovered by walking the data type depth-first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar kind of a data type node, with the registry's integer codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum BaseKind {
    None,
    Int,
    Float,
    Text,
    Structure,
}

impl TryFrom<i64> for BaseKind {
    type Error = String;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            -1 => Ok(BaseKind::None),
            0 => Ok(BaseKind::Int),
            1 => Ok(BaseKind::Float),
            2 => Ok(BaseKind::Text),
            3 => Ok(BaseKind::Structure),
            other => Err(format!("unknown data type base code {}", other)),
        }
    }
}

impl From<BaseKind> for i64 {
    fn from(kind: BaseKind) -> i64 {
        match kind {
            BaseKind::None => -1,
            BaseKind::Int => 0,
            BaseKind::Float => 1,
            BaseKind::Text => 2,
            BaseKind::Structure => 3,
        }
    }
}

/// Named reference from a structure to one of its field types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubDataType {
    /// Field data type id
    pub sub_data_type_id: i64,
    /// Field name used as the record key in object form
    #[serde(default)]
    pub title: String,
}

/// A node of the recursive data type tree
///
/// Either a scalar leaf (`length == 0`, no sub-types) or a structure repeated
/// `length` times, each repetition holding one value of every sub-type in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataType {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    pub base: BaseKind,
    #[serde(default)]
    pub length: u32,
    #[serde(default)]
    pub sub_data_types: Vec<SubDataType>,
}

impl DataType {
    /// The "no data" type addressed by id 0
    pub const NONE: DataType = DataType {
        id: 0,
        title: String::new(),
        base: BaseKind::None,
        length: 0,
        sub_data_types: Vec::new(),
    };

    pub fn leaf(id: i64, title: &str, base: BaseKind) -> Self {
        Self {
            id,
            title: title.to_string(),
            base,
            length: 0,
            sub_data_types: Vec::new(),
        }
    }

    /// Structure repeated `length` times over the given (title, type id) fields
    pub fn structure(id: i64, title: &str, length: u32, fields: &[(&str, i64)]) -> Self {
        Self {
            id,
            title: title.to_string(),
            base: BaseKind::Structure,
            length,
            sub_data_types: fields
                .iter()
                .map(|(title, sub_data_type_id)| SubDataType {
                    sub_data_type_id: *sub_data_type_id,
                    title: title.to_string(),
                })
                .collect(),
        }
    }

    pub fn is_structure(&self) -> bool {
        self.length > 0 && !self.sub_data_types.is_empty()
    }

    /// Whether a leaf of this type occupies a slot in the flat value list
    pub fn carries_value(&self) -> bool {
        !self.is_structure() && self.base != BaseKind::None
    }

    /// Check the leaf/structure shape rule
    pub fn has_legal_shape(&self) -> bool {
        let leaf = self.length == 0 && self.sub_data_types.is_empty() && self.base != BaseKind::Structure;
        let structure = self.length >= 1 && !self.sub_data_types.is_empty() && self.base == BaseKind::Structure;
        leaf || structure
    }
}

/// Persisted value instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Data {
    pub id: i64,
    pub title: String,
    pub data_type_id: i64,
    pub created: Option<DateTime<Utc>>,
    /// Scalar leaves in depth-first order of the data type
    pub values: Vec<String>,
}

impl Data {
    /// Unsaved value, used when encoding data that has no row yet
    pub fn transient(data_type_id: i64, values: Vec<String>) -> Self {
        Self {
            id: 0,
            title: String::new(),
            data_type_id,
            created: None,
            values,
        }
    }
}

/// Path of (repetition, field) pairs, both 1-based, from a type's root down to a sub-tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataIndex(pub Vec<(u32, u32)>);

impl DataIndex {
    /// Source path marking a decision edge
    pub fn decision() -> Self {
        DataIndex(vec![(0, 0)])
    }

    /// Path addressing the whole value
    pub fn root() -> Self {
        DataIndex(Vec::new())
    }

    pub fn is_decision(&self) -> bool {
        self.0.as_slice() == [(0, 0)]
    }

    pub fn steps(&self) -> &[(u32, u32)] {
        &self.0
    }
}

impl fmt::Display for DataIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let steps: Vec<String> = self.0.iter().map(|(rep, field)| format!("{}.{}", rep, field)).collect();
        write!(f, "[{}]", steps.join("/"))
    }
}
