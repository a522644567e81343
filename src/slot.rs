//! # Slot Store
//!
//! Typed per-request state. Every slot is declared up front in a
//! [`SlotSchema`]: a small integer id, a human-readable name, a fixed value
//! type, and (rarely) a multi-write opt-in. At run time the [`SlotStore`] holds
//! the values that steps and effects have produced so far, enforcing:
//!
//! - **Write-once**: a second write to a single-write slot is a
//!   `DuplicateWrite` error.
//! - **Type agreement**: a value whose tag disagrees with the schema is
//!   rejected.
//! - **Insertion order**: `for_each` visits slots in first-write order, which
//!   is what debug dumps and replay snapshots rely on.
//!
//! The store holds owned values only (no external references), so dropping
//! the request context releases everything at once.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifier for one slot; small and cheap to copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub u16);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// The closed set of value types a slot may hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotType {
    Bytes,
    Text,
    Json,
    Int,
    Float,
    Bool,
}

/// A value stored in a slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotValue {
    Bytes(Bytes),
    Text(String),
    Json(Value),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl SlotValue {
    pub fn slot_type(&self) -> SlotType {
        match self {
            SlotValue::Bytes(_) => SlotType::Bytes,
            SlotValue::Text(_) => SlotType::Text,
            SlotValue::Json(_) => SlotType::Json,
            SlotValue::Int(_) => SlotType::Int,
            SlotValue::Float(_) => SlotType::Float,
            SlotValue::Bool(_) => SlotType::Bool,
        }
    }

    /// Approximate heap footprint, charged against the request arena
    pub fn byte_len(&self) -> usize {
        match self {
            SlotValue::Bytes(b) => b.len(),
            SlotValue::Text(s) => s.len(),
            // close enough for budget accounting
            SlotValue::Json(v) => v.to_string().len(),
            SlotValue::Int(_) | SlotValue::Float(_) | SlotValue::Bool(_) => 8,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            SlotValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SlotValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            SlotValue::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            SlotValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SlotValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<Bytes> for SlotValue {
    fn from(b: Bytes) -> Self {
        SlotValue::Bytes(b)
    }
}

impl From<String> for SlotValue {
    fn from(s: String) -> Self {
        SlotValue::Text(s)
    }
}

impl From<&str> for SlotValue {
    fn from(s: &str) -> Self {
        SlotValue::Text(s.to_string())
    }
}

impl From<Value> for SlotValue {
    fn from(v: Value) -> Self {
        SlotValue::Json(v)
    }
}

impl From<i64> for SlotValue {
    fn from(i: i64) -> Self {
        SlotValue::Int(i)
    }
}

impl From<bool> for SlotValue {
    fn from(b: bool) -> Self {
        SlotValue::Bool(b)
    }
}

/// Design-time declaration of one slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotDef {
    pub id: SlotId,
    pub name: String,
    pub ty: SlotType,
    /// Explicit opt-in; single-write is the default
    pub multi_write: bool,
}

/// Errors surfaced by slot access
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    #[error("slot {0} written twice")]
    DuplicateWrite(SlotId),
    #[error("slot {0} was never written")]
    Missing(SlotId),
    #[error("slot {slot} expects {expected:?}, got {got:?}")]
    TypeMismatch {
        slot: SlotId,
        expected: SlotType,
        got: SlotType,
    },
    #[error("slot {0} is not declared in the schema")]
    Unknown(SlotId),
}

/// The schema mapping slot ids to names and types
#[derive(Debug, Clone, Default)]
pub struct SlotSchema {
    defs: Vec<SlotDef>,
}

impl SlotSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a single-write slot
    pub fn slot(mut self, id: SlotId, name: impl Into<String>, ty: SlotType) -> Self {
        self.defs.push(SlotDef {
            id,
            name: name.into(),
            ty,
            multi_write: false,
        });
        self
    }

    /// Declare a slot that may be written more than once per request
    pub fn multi_write_slot(mut self, id: SlotId, name: impl Into<String>, ty: SlotType) -> Self {
        self.defs.push(SlotDef {
            id,
            name: name.into(),
            ty,
            multi_write: true,
        });
        self
    }

    pub fn def(&self, id: SlotId) -> Option<&SlotDef> {
        self.defs.iter().find(|d| d.id == id)
    }

    /// Slot name for diagnostics; falls back to the numeric form
    pub fn name(&self, id: SlotId) -> String {
        self.def(id)
            .map(|d| d.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    pub fn defs(&self) -> &[SlotDef] {
        &self.defs
    }
}

/// Per-request slot values, keyed by [`SlotId`]
#[derive(Debug, Default)]
pub struct SlotStore {
    // (id, value) in first-write order; lookups scan, which is fine for the
    // small slot counts a pipeline declares
    cells: Vec<(SlotId, SlotValue)>,
}

impl SlotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a slot, enforcing schema type and write-once semantics.
    ///
    /// Returns the byte length of any value that was replaced (multi-write
    /// slots) so the caller can discharge it from the arena.
    pub fn put(
        &mut self,
        schema: &SlotSchema,
        id: SlotId,
        value: SlotValue,
    ) -> Result<Option<usize>, SlotError> {
        let def = schema.def(id).ok_or(SlotError::Unknown(id))?;
        if value.slot_type() != def.ty {
            return Err(SlotError::TypeMismatch {
                slot: id,
                expected: def.ty,
                got: value.slot_type(),
            });
        }
        if let Some(pos) = self.cells.iter().position(|(sid, _)| *sid == id) {
            if !def.multi_write {
                return Err(SlotError::DuplicateWrite(id));
            }
            let replaced = self.cells[pos].1.byte_len();
            self.cells[pos].1 = value;
            return Ok(Some(replaced));
        }
        self.cells.push((id, value));
        Ok(None)
    }

    /// Typed read; fails if the slot was never written
    pub fn get_required(&self, id: SlotId) -> Result<&SlotValue, SlotError> {
        self.get_optional(id).ok_or(SlotError::Missing(id))
    }

    /// Typed read returning `None` when the slot is unset
    pub fn get_optional(&self, id: SlotId) -> Option<&SlotValue> {
        self.cells
            .iter()
            .find(|(sid, _)| *sid == id)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.cells.iter().any(|(sid, _)| *sid == id)
    }

    /// Visit existing slots in first-write order
    pub fn for_each(&self, mut visitor: impl FnMut(SlotId, &SlotValue)) {
        for (id, value) in &self.cells {
            visitor(*id, value);
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> SlotSchema {
        SlotSchema::new()
            .slot(SlotId(0), "TodoItem", SlotType::Bytes)
            .slot(SlotId(1), "UserId", SlotType::Text)
            .multi_write_slot(SlotId(2), "Progress", SlotType::Int)
    }

    #[test]
    fn test_put_then_require_round_trip() {
        let schema = schema();
        let mut store = SlotStore::new();
        store
            .put(&schema, SlotId(1), SlotValue::Text("u-1".into()))
            .unwrap();
        let v = store.get_required(SlotId(1)).unwrap();
        assert_eq!(v.as_text(), Some("u-1"));
    }

    #[test]
    fn test_duplicate_write_rejected() {
        let schema = schema();
        let mut store = SlotStore::new();
        store.put(&schema, SlotId(1), "a".into()).unwrap();
        let err = store.put(&schema, SlotId(1), "b".into()).unwrap_err();
        assert_eq!(err, SlotError::DuplicateWrite(SlotId(1)));
    }

    #[test]
    fn test_multi_write_opt_in() {
        let schema = schema();
        let mut store = SlotStore::new();
        store.put(&schema, SlotId(2), SlotValue::Int(1)).unwrap();
        let replaced = store.put(&schema, SlotId(2), SlotValue::Int(2)).unwrap();
        assert_eq!(replaced, Some(8));
        assert_eq!(store.get_required(SlotId(2)).unwrap().as_int(), Some(2));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let schema = schema();
        let mut store = SlotStore::new();
        let err = store
            .put(&schema, SlotId(0), SlotValue::Text("nope".into()))
            .unwrap_err();
        assert!(matches!(err, SlotError::TypeMismatch { .. }));
    }

    #[test]
    fn test_missing_and_optional() {
        let store = SlotStore::new();
        assert_eq!(
            store.get_required(SlotId(0)).unwrap_err(),
            SlotError::Missing(SlotId(0))
        );
        assert!(store.get_optional(SlotId(0)).is_none());
    }

    #[test]
    fn test_for_each_insertion_order() {
        let schema = schema();
        let mut store = SlotStore::new();
        store.put(&schema, SlotId(1), "x".into()).unwrap();
        store.put(&schema, SlotId(0), SlotValue::Bytes(Bytes::from_static(b"b"))).unwrap();
        let mut seen = Vec::new();
        store.for_each(|id, _| seen.push(id));
        assert_eq!(seen, vec![SlotId(1), SlotId(0)]);
    }

    #[test]
    fn test_unknown_slot_rejected() {
        let schema = schema();
        let mut store = SlotStore::new();
        let err = store.put(&schema, SlotId(99), "x".into()).unwrap_err();
        assert_eq!(err, SlotError::Unknown(SlotId(99)));
    }
}
