//! CRDT primitives for linesync.
//!
//! Provides Last-Writer-Wins registers for record fields and a replicated
//! growable array (RGA) for the ordered record collection.

use crate::version::{OpId, Stamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A Last-Writer-Wins register holding a value with a stamp.
///
/// A write only takes effect when its stamp is higher than the stored one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LwwRegister<T> {
    /// The stored value
    pub value: T,
    /// Stamp of the last write
    pub stamp: Stamp,
}

impl<T> LwwRegister<T> {
    /// Create a new register with an initial value.
    #[must_use]
    pub fn new(value: T, stamp: Stamp) -> Self {
        Self { value, stamp }
    }

    /// Update the register value if the new stamp is higher.
    ///
    /// Returns `true` if the value was updated.
    pub fn set(&mut self, value: T, stamp: Stamp) -> bool {
        if stamp > self.stamp {
            self.value = value;
            self.stamp = stamp;
            true
        } else {
            false
        }
    }
}

/// A node of the RGA tree.
#[derive(Debug, Clone)]
struct RgaNode<V> {
    stamp: Stamp,
    /// Children ordered by descending stamp
    children: Vec<(Stamp, OpId)>,
    deleted: bool,
    fields: BTreeMap<String, LwwRegister<V>>,
}

/// Replicated growable array of structured records.
///
/// Each element is inserted after a parent element (or the head). Siblings
/// are ordered by descending stamp and the visible sequence is the preorder
/// traversal of non-deleted nodes, so the order does not depend on the order
/// in which concurrent inserts are integrated.
#[derive(Debug, Clone)]
pub struct RgaList<V> {
    nodes: HashMap<OpId, RgaNode<V>>,
    roots: Vec<(Stamp, OpId)>,
    /// Cached visible order; `None` while stale
    visible: Option<Vec<OpId>>,
}

impl<V> Default for RgaList<V> {
    fn default() -> Self {
        Self {
            nodes: HashMap::new(),
            roots: Vec::new(),
            visible: Some(Vec::new()),
        }
    }
}

impl<V: Clone> RgaList<V> {
    /// Create an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Integrate an insert authored anywhere.
    ///
    /// Returns `false` if the element is already known or its parent is
    /// missing.
    pub fn integrate_insert(&mut self, id: OpId, stamp: Stamp, parent: Option<OpId>) -> bool {
        if !self.attach(id, stamp, parent) {
            return false;
        }
        self.visible = None;
        true
    }

    /// Insert a new element at a visible index.
    ///
    /// The stamp must be greater than every stamp already in the list, which
    /// holds for locally authored ops. Returns the parent the element was
    /// attached to, or `None` if the index is out of bounds.
    pub fn local_insert(&mut self, index: usize, id: OpId, stamp: Stamp) -> Option<Option<OpId>> {
        self.refresh();
        let parent = {
            let visible = self.visible.as_ref()?;
            if index > visible.len() {
                return None;
            }
            index.checked_sub(1).map(|i| visible[i])
        };
        if !self.attach(id, stamp, parent) {
            return None;
        }
        // Highest stamp among siblings: lands right after its parent.
        if let Some(visible) = self.visible.as_mut() {
            visible.insert(index, id);
        }
        Some(parent)
    }

    fn attach(&mut self, id: OpId, stamp: Stamp, parent: Option<OpId>) -> bool {
        if self.nodes.contains_key(&id) {
            return false;
        }
        let siblings = match parent {
            None => &mut self.roots,
            Some(parent_id) => match self.nodes.get_mut(&parent_id) {
                Some(node) => &mut node.children,
                None => return false,
            },
        };
        let pos = siblings.partition_point(|(s, _)| *s > stamp);
        siblings.insert(pos, (stamp, id));
        self.nodes.insert(
            id,
            RgaNode {
                stamp,
                children: Vec::new(),
                deleted: false,
                fields: BTreeMap::new(),
            },
        );
        true
    }

    /// Tombstone an element. Returns `true` if it was visible before.
    pub fn delete(&mut self, target: &OpId) -> bool {
        let Some(node) = self.nodes.get_mut(target) else {
            return false;
        };
        if node.deleted {
            return false;
        }
        node.deleted = true;
        if let Some(visible) = self.visible.as_mut() {
            if let Some(pos) = visible.iter().position(|id| id == target) {
                visible.remove(pos);
            }
        }
        true
    }

    /// Tombstone the element at a visible index, returning its id.
    pub fn delete_at(&mut self, index: usize) -> Option<OpId> {
        let id = self.id_at(index)?;
        self.delete(&id);
        Some(id)
    }

    /// Write a field of an element (deleted elements keep their fields).
    ///
    /// Returns `true` if the write won.
    pub fn set(&mut self, target: &OpId, field: &str, value: V, stamp: Stamp) -> bool {
        let Some(node) = self.nodes.get_mut(target) else {
            return false;
        };
        match node.fields.get_mut(field) {
            Some(register) => register.set(value, stamp),
            None => {
                node.fields
                    .insert(field.to_string(), LwwRegister::new(value, stamp));
                true
            }
        }
    }

    /// Recompute the visible order if stale.
    pub fn refresh(&mut self) {
        if self.visible.is_some() {
            return;
        }
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<OpId> = self.roots.iter().rev().map(|(_, id)| *id).collect();
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            if !node.deleted {
                order.push(id);
            }
            stack.extend(node.children.iter().rev().map(|(_, child)| *child));
        }
        self.visible = Some(order);
    }

    /// Visible element ids in order.
    ///
    /// Empty while the order is stale; callers refresh after integrating.
    #[must_use]
    pub fn ids(&self) -> &[OpId] {
        self.visible.as_deref().unwrap_or(&[])
    }

    /// Number of visible elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids().len()
    }

    /// Whether the list has no visible elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id of the visible element at `index`.
    #[must_use]
    pub fn id_at(&self, index: usize) -> Option<OpId> {
        self.ids().get(index).copied()
    }

    /// Read a field of the visible element at `index`.
    #[must_use]
    pub fn get(&self, index: usize, field: &str) -> Option<&V> {
        let id = self.id_at(index)?;
        self.nodes
            .get(&id)?
            .fields
            .get(field)
            .map(|register| &register.value)
    }

    /// All fields of the visible element at `index`.
    pub fn fields(&self, index: usize) -> impl Iterator<Item = (&String, &V)> {
        self.id_at(index)
            .and_then(|id| self.nodes.get(&id))
            .into_iter()
            .flat_map(|node| node.fields.iter().map(|(k, r)| (k, &r.value)))
    }
}
