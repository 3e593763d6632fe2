//! Materialised document state.
//!
//! A document holds named ordered collections; each element is a record of
//! named fields. The state is derived purely from the set of integrated
//! operations, so replaying the same ops in any causal order yields the same
//! value.

use crate::crdt::RgaList;
use crate::oplog::{Op, OpContent};
use crate::version::{OpId, PeerId, Stamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A scalar field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    /// Absent / cleared value
    Null,
    /// Signed integer
    Int(i64),
    /// UTF-8 string
    Str(String),
}

impl Value {
    /// The string payload, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The integer payload, if this is an integer.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Convert to a JSON value.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Str(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

/// State of all collections of a document.
#[derive(Debug, Clone, Default)]
pub struct DocState {
    lists: BTreeMap<String, RgaList<Value>>,
}

impl DocState {
    /// Create an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state by replaying ops in causal order.
    pub fn replay<'a>(ops: impl IntoIterator<Item = (PeerId, &'a Op)>) -> Self {
        let mut state = Self::new();
        for (peer, op) in ops {
            state.apply(peer, op);
        }
        state.refresh();
        state
    }

    /// Integrate one op. Returns `true` if it changed the state.
    ///
    /// Callers must [`refresh`](Self::refresh) before reading again.
    pub fn apply(&mut self, peer: PeerId, op: &Op) -> bool {
        let id = OpId::new(peer, op.counter);
        let stamp = Stamp::new(op.lamport, peer);
        match &op.content {
            OpContent::Insert { container, parent } => {
                let applied = self.list_mut(container).integrate_insert(id, stamp, *parent);
                if !applied {
                    tracing::warn!(op = %id, container = %container, "Skipping insert with unknown parent");
                }
                applied
            }
            OpContent::Delete { container, target } => self.list_mut(container).delete(target),
            OpContent::Set {
                container,
                target,
                field,
                value,
            } => self
                .list_mut(container)
                .set(target, field, value.clone(), stamp),
        }
    }

    /// Recompute visible orders after integrating ops.
    pub fn refresh(&mut self) {
        for list in self.lists.values_mut() {
            list.refresh();
        }
    }

    /// Get a collection by name.
    #[must_use]
    pub fn list(&self, container: &str) -> Option<&RgaList<Value>> {
        self.lists.get(container)
    }

    /// Get or create a collection by name.
    pub fn list_mut(&mut self, container: &str) -> &mut RgaList<Value> {
        self.lists.entry(container.to_string()).or_default()
    }

    /// Number of visible records in a collection.
    #[must_use]
    pub fn len(&self, container: &str) -> usize {
        self.list(container).map_or(0, RgaList::len)
    }

    /// Read a field of the record at `index`.
    #[must_use]
    pub fn get(&self, container: &str, index: usize, field: &str) -> Option<&Value> {
        self.list(container)?.get(index, field)
    }

    /// Materialise a collection as a JSON array of objects.
    #[must_use]
    pub fn deep_value(&self, container: &str) -> serde_json::Value {
        let Some(list) = self.list(container) else {
            return serde_json::Value::Array(Vec::new());
        };
        let records = (0..list.len())
            .map(|index| {
                let fields = list
                    .fields(index)
                    .map(|(name, value)| (name.clone(), value.to_json()))
                    .collect::<serde_json::Map<_, _>>();
                serde_json::Value::Object(fields)
            })
            .collect();
        serde_json::Value::Array(records)
    }
}
