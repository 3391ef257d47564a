/// Process-wide data type catalog using ArcSwap
///
/// Holds every data type descriptor supplied by the type registry. A refresh
/// validates the full set and then swaps the whole map pointer, so codec and
/// index walks always run against one consistent snapshot.

use crate::datatype::types::DataType;
use crate::error::{EngineError, Result};
use arc_swap::ArcSwap;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

/// Immutable view of the catalog used for the duration of one walk
pub type TypeSnapshot = Arc<HashMap<i64, DataType>>;

/// Lock-free catalog of data type descriptors keyed by id
#[derive(Debug)]
pub struct TypeCatalog {
    types: ArcSwap<HashMap<i64, DataType>>,
}

impl Default for TypeCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeCatalog {
    /// Empty catalog; only the "no data" type resolves
    pub fn new() -> Self {
        Self {
            types: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Build a catalog from a known set of types (validated)
    pub fn from_types(types: Vec<DataType>) -> Result<Self> {
        let catalog = Self::new();
        catalog.replace(types)?;
        Ok(catalog)
    }

    /// Validate and atomically install a new type set
    pub fn replace(&self, types: Vec<DataType>) -> Result<()> {
        let mut map = HashMap::with_capacity(types.len());
        for data_type in types {
            if data_type.id == 0 {
                return Err(EngineError::Consistency(
                    "data type id 0 is reserved for the empty type".to_string(),
                ));
            }
            if map.insert(data_type.id, data_type).is_some() {
                return Err(EngineError::Consistency("duplicate data type id in registry payload".to_string()));
            }
        }
        validate_types(&map)?;

        let count = map.len();
        self.types.store(Arc::new(map));
        tracing::info!("📚 Type catalog loaded with {} data types", count);
        Ok(())
    }

    /// Fetch `GET {registry_url}/datatype` and install the result
    pub async fn refresh_from_registry(&self, client: &reqwest::Client, registry_url: &str) -> Result<()> {
        let url = format!("{}/datatype", registry_url.trim_end_matches('/'));
        tracing::info!("🌐 Fetching data types from registry: {}", url);

        let response = client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(EngineError::Dispatch(format!(
                "type registry answered {} for {}",
                response.status(),
                url
            )));
        }
        let types: Vec<DataType> = response.json().await?;
        self.replace(types)
    }

    /// Current snapshot (lock-free read)
    pub fn snapshot(&self) -> TypeSnapshot {
        self.types.load_full()
    }

    pub fn get(&self, id: i64) -> Result<DataType> {
        lookup(&self.snapshot(), id).cloned()
    }

    pub fn len(&self) -> usize {
        self.types.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.load().is_empty()
    }
}

static NONE_TYPE: DataType = DataType::NONE;

/// Resolve a type id inside a snapshot; id 0 is the empty type
pub fn lookup(types: &HashMap<i64, DataType>, id: i64) -> Result<&DataType> {
    if id == 0 {
        return Ok(&NONE_TYPE);
    }
    types
        .get(&id)
        .ok_or_else(|| EngineError::Consistency(format!("unknown data type id {}", id)))
}

/// Shape, reference and cycle checks over a complete type set
fn validate_types(types: &HashMap<i64, DataType>) -> Result<()> {
    for data_type in types.values() {
        if !data_type.has_legal_shape() {
            return Err(EngineError::Consistency(format!(
                "data type {} ({}) is neither a scalar leaf nor a structure",
                data_type.id, data_type.title
            )));
        }
        for sub in &data_type.sub_data_types {
            if sub.sub_data_type_id != 0 && !types.contains_key(&sub.sub_data_type_id) {
                return Err(EngineError::Consistency(format!(
                    "data type {} references unknown sub data type {}",
                    data_type.id, sub.sub_data_type_id
                )));
            }
        }
    }

    // Iterative three-colour DFS
    let mut finished: HashSet<i64> = HashSet::new();
    for &root in types.keys() {
        if finished.contains(&root) {
            continue;
        }
        let mut on_path: HashSet<i64> = HashSet::new();
        let mut stack: Vec<(i64, usize)> = vec![(root, 0)];
        on_path.insert(root);

        while let Some((id, next_child)) = stack.pop() {
            let children = types.get(&id).map(|t| t.sub_data_types.as_slice()).unwrap_or(&[]);
            if next_child < children.len() {
                stack.push((id, next_child + 1));
                let child = children[next_child].sub_data_type_id;
                if child == 0 || finished.contains(&child) {
                    continue;
                }
                if !on_path.insert(child) {
                    return Err(EngineError::Consistency(format!(
                        "data type {} is part of a reference cycle",
                        child
                    )));
                }
                stack.push((child, 0));
            } else {
                on_path.remove(&id);
                finished.insert(id);
            }
        }
    }

    Ok(())
}
