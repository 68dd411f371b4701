use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;

/// A value a [`Record`] exposes for indexed, filtered queries.
///
/// Only scalar values are indexable; anything richer stays in the JSONL body
/// and is reached by loading the full record.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    Text(String),
    Int(i64),
    Bool(bool),
    Null,
}

impl IndexValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            IndexValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// A type that can be durably persisted in a [`crate::Store`].
///
/// Implementors are plain data: the store owns serialization, ordering and
/// concurrency. `indexed_fields` declares which fields can be queried via
/// [`crate::Filter`] without deserializing every record in the collection.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Unique id within the collection.
    fn id(&self) -> &str;

    /// Name of the JSONL file / SQLite table this record lives in.
    fn collection_name() -> &'static str;

    /// Last-modified timestamp (Unix ms), used to resolve write races during
    /// index rebuild (last write wins by this field, not by log position).
    fn updated_at(&self) -> i64;

    /// Scalar fields to mirror into the SQLite index for filtering/ordering.
    fn indexed_fields(&self) -> HashMap<String, IndexValue>;
}
