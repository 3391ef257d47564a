/// Data type layer - recursive type catalog, leaf codecs and index paths

pub mod catalog;
pub mod codec;
pub mod index;
pub mod types;

pub use catalog::{TypeCatalog, TypeSnapshot};
pub use types::{BaseKind, Data, DataIndex, DataType, SubDataType};
