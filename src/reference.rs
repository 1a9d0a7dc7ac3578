//! Persistent handles to runtime values.
//!
//! A [`Reference`] owns one registry slot, so the value it names survives
//! between native calls and across collections. Operations that can run
//! metamethods push the value, call into the runtime and restore the stack
//! through a [`StackGuard`].

use std::fmt;
use std::ops::{Deref, DerefMut};

use hostbind_core::{CompareOp, NIL_REF, RegistryRef, RuntimeError, State, Status, TableRef, Value, ValueType};

use crate::class;
use crate::convert::{FromStack, ToStack, from_value, to_value};
use crate::error::BindError;
use crate::multi::{FromResults, IntoArgs};

// ============================================================================
// StackGuard
// ============================================================================

/// Restores the stack depth when dropped.
pub struct StackGuard<'s> {
    state: &'s mut State,
    top: i32,
}

impl<'s> StackGuard<'s> {
    pub fn new(state: &'s mut State) -> Self {
        let top = state.top();
        Self { state, top }
    }

    /// The depth that will be restored.
    pub fn saved_top(&self) -> i32 {
        self.top
    }
}

impl Deref for StackGuard<'_> {
    type Target = State;

    fn deref(&self) -> &State {
        self.state
    }
}

impl DerefMut for StackGuard<'_> {
    fn deref_mut(&mut self) -> &mut State {
        self.state
    }
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        self.state.set_top(self.top);
    }
}

// ============================================================================
// Reference
// ============================================================================

/// An owned registry slot naming a runtime value.
///
/// Cloning duplicates the value into a fresh slot; dropping releases the
/// slot. A reference to `nil` holds no slot at all.
pub struct Reference {
    registry: RegistryRef,
    slot: i32,
}

impl Reference {
    pub fn new(state: &State, value: Value) -> Self {
        Self::with_registry(state.registry().clone(), value)
    }

    fn with_registry(registry: RegistryRef, value: Value) -> Self {
        let slot = registry.reference(value);
        Self { registry, slot }
    }

    /// Reference the value at `index`.
    pub fn at(state: &State, index: i32) -> Self {
        Self::new(state, state.value(index))
    }

    /// Reference `value` after converting it.
    pub fn from_rust<T: ToStack>(state: &mut State, value: T) -> Result<Self, BindError> {
        let value = to_value(state, value)?;
        Ok(Self::new(state, value))
    }

    /// Move the referenced value out, leaving a `nil` reference behind.
    pub fn take(&mut self) -> Reference {
        let slot = std::mem::replace(&mut self.slot, NIL_REF);
        Reference {
            registry: self.registry.clone(),
            slot,
        }
    }

    /// The registry slot, or a sentinel for `nil`.
    pub fn slot(&self) -> i32 {
        self.slot
    }

    pub fn value(&self) -> Value {
        self.registry.get(self.slot)
    }

    pub fn value_type(&self) -> ValueType {
        self.value().value_type()
    }

    pub fn is_nil(&self) -> bool {
        self.value().is_nil()
    }

    pub fn push(&self, state: &mut State) {
        state.push(self.value());
    }

    pub fn get<T: FromStack>(&self, state: &mut State) -> Result<T, BindError> {
        from_value(state, self.value())
    }

    /// Replace the referenced value.
    pub fn set<T: ToStack>(&mut self, state: &mut State, value: T) -> Result<(), BindError> {
        let value = to_value(state, value)?;
        self.registry.release(self.slot);
        self.slot = self.registry.reference(value);
        Ok(())
    }

    fn sibling(&self, value: Value) -> Reference {
        Self::with_registry(self.registry.clone(), value)
    }

    /// Lazily resolved `self[key]`.
    pub fn entry(&self, key: impl Into<Value>) -> TableEntry {
        TableEntry {
            anchor: Anchor::Table(self.clone()),
            key: self.sibling(key.into()),
        }
    }

    /// Iterate the referenced table in the runtime's traversal order.
    pub fn pairs(&self) -> Result<Pairs, BindError> {
        match self.value() {
            Value::Table(table) => Ok(Pairs {
                table,
                registry: self.registry.clone(),
                key: Value::Nil,
                done: false,
            }),
            other => Err(RuntimeError::type_error("iterate over", other.type_name()).into()),
        }
    }

    pub fn raw_len(&self) -> usize {
        match self.value() {
            Value::Str(s) => s.len(),
            Value::Table(t) => t.raw_len(),
            _ => 0,
        }
    }

    /// Length honoring `__len`.
    pub fn len(&self, state: &mut State) -> Result<Value, BindError> {
        let mut guard = StackGuard::new(state);
        self.push(&mut guard);
        guard.len(-1)?;
        Ok(guard.value(-1))
    }

    /// Equality honoring `__eq`.
    pub fn equals(&self, state: &mut State, other: &Reference) -> Result<bool, BindError> {
        self.compare(state, other, CompareOp::Eq)
    }

    pub fn less_than(&self, state: &mut State, other: &Reference) -> Result<bool, BindError> {
        self.compare(state, other, CompareOp::Lt)
    }

    pub fn less_equal(&self, state: &mut State, other: &Reference) -> Result<bool, BindError> {
        self.compare(state, other, CompareOp::Le)
    }

    fn compare(&self, state: &mut State, other: &Reference, op: CompareOp) -> Result<bool, BindError> {
        let mut guard = StackGuard::new(state);
        self.push(&mut guard);
        other.push(&mut guard);
        Ok(guard.compare(-2, -1, op)?)
    }

    /// String conversion honoring `__tostring`.
    pub fn to_display_string(&self, state: &mut State) -> Result<String, BindError> {
        let mut guard = StackGuard::new(state);
        self.push(&mut guard);
        Ok(guard.to_display_string(-1)?)
    }

    pub fn metatable(&self, state: &State) -> Option<Reference> {
        state
            .metatable_of(&self.value())
            .map(|mt| self.sibling(Value::Table(mt)))
    }

    /// Call the referenced value. Failures keep the runtime's status.
    pub fn call<A: IntoArgs, R: FromResults>(&self, state: &mut State, args: A) -> Result<R, BindError> {
        let mut guard = StackGuard::new(state);
        let base = guard.top();
        self.push(&mut guard);
        let nargs = args.push_args(&mut guard)?;
        let status = guard.pcall(nargs, R::COUNT);
        if status != Status::Ok {
            return Err(status_error(status, guard.value(-1)));
        }
        R::from_results(&mut guard, base + 1)
    }

    /// Protected call: the status plus the results when the call succeeded
    /// and they converted. Argument and result conversion failures report
    /// [`Status::Runtime`].
    pub fn pcall<A: IntoArgs, R: FromResults>(&self, state: &mut State, args: A) -> (Status, Option<R>) {
        match self.call(state, args) {
            Ok(results) => (Status::Ok, Some(results)),
            Err(BindError::Runtime(err)) => (err.status(), None),
            Err(BindError::RuntimeProtocolError(status)) => (status, None),
            Err(err) => {
                tracing::debug!(error = %err, "protected call failed outside the runtime");
                (Status::Runtime, None)
            }
        }
    }

    /// Destroy the referenced host object.
    pub fn destroy_host(&self, state: &mut State) -> Result<bool, BindError> {
        let mut guard = StackGuard::new(state);
        self.push(&mut guard);
        class::destroy(&guard, -1)
    }
}

fn status_error(status: Status, message: Value) -> BindError {
    match message {
        Value::Str(message) if status.is_error() => RuntimeError::with_status(status, message.to_string()).into(),
        _ => BindError::RuntimeProtocolError(status),
    }
}

impl Clone for Reference {
    fn clone(&self) -> Self {
        self.sibling(self.value())
    }
}

impl Drop for Reference {
    fn drop(&mut self) {
        self.registry.release(self.slot);
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("slot", &self.slot)
            .field("value", &self.value())
            .finish()
    }
}

/// Any value, kept alive in the registry.
impl FromStack for Reference {
    fn type_name() -> &'static str {
        "value"
    }

    fn check(_state: &State, _index: i32) -> bool {
        true
    }

    fn from_stack(state: &mut State, index: i32) -> Result<Self, BindError> {
        Ok(Reference::at(state, index))
    }
}

impl ToStack for Reference {
    fn to_stack(self, state: &mut State) -> Result<(), BindError> {
        Reference::push(&self, state);
        Ok(())
    }
}

impl ToStack for &Reference {
    fn to_stack(self, state: &mut State) -> Result<(), BindError> {
        Reference::push(self, state);
        Ok(())
    }
}

// ============================================================================
// TableEntry
// ============================================================================

#[derive(Clone)]
enum Anchor {
    Table(Reference),
    Entry(Box<TableEntry>),
}

/// A table slot addressed by an anchor and a key.
///
/// Nothing is looked up until the entry is read or written, and every access
/// resolves the whole chain again.
#[derive(Clone)]
pub struct TableEntry {
    anchor: Anchor,
    key: Reference,
}

impl TableEntry {
    fn container(&self, state: &mut State) -> Result<Value, BindError> {
        match &self.anchor {
            Anchor::Table(table) => Ok(table.value()),
            Anchor::Entry(parent) => parent.value(state),
        }
    }

    /// The entry's current value, following `__index`.
    pub fn value(&self, state: &mut State) -> Result<Value, BindError> {
        let container = self.container(state)?;
        Ok(state.index_value(&container, &self.key.value())?)
    }

    pub fn get<T: FromStack>(&self, state: &mut State) -> Result<T, BindError> {
        let value = self.value(state)?;
        from_value(state, value)
    }

    /// Assign the entry, following `__newindex`.
    pub fn set<T: ToStack>(&self, state: &mut State, value: T) -> Result<(), BindError> {
        let container = self.container(state)?;
        let value = to_value(state, value)?;
        Ok(state.set_index_value(&container, self.key.value(), value)?)
    }

    /// A persistent handle to the entry's current value.
    pub fn reference(&self, state: &mut State) -> Result<Reference, BindError> {
        let value = self.value(state)?;
        Ok(self.key.sibling(value))
    }

    /// Lazily resolved `self[key]`.
    pub fn entry(self, key: impl Into<Value>) -> TableEntry {
        let key = self.key.sibling(key.into());
        TableEntry {
            anchor: Anchor::Entry(Box::new(self)),
            key,
        }
    }
}

impl fmt::Debug for TableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableEntry").field("key", &self.key.value()).finish_non_exhaustive()
    }
}

// ============================================================================
// Pairs
// ============================================================================

/// Single-pass iterator over a table's key/value pairs.
pub struct Pairs {
    table: TableRef,
    registry: RegistryRef,
    key: Value,
    done: bool,
}

impl Iterator for Pairs {
    type Item = (Reference, Reference);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = self.table.borrow().next(&self.key);
        match step {
            Ok(Some((key, value))) => {
                self.key = key.clone();
                Some((
                    Reference::with_registry(self.registry.clone(), key),
                    Reference::with_registry(self.registry.clone(), value),
                ))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "table traversal stopped");
                self.done = true;
                None
            }
        }
    }
}

impl fmt::Debug for Pairs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pairs")
            .field("key", &self.key)
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_own_independent_slots() {
        let mut state = State::new();
        let original = Reference::from_rust(&mut state, "kept").unwrap();
        let copy = original.clone();
        assert_ne!(original.slot(), copy.slot());
        drop(copy);
        assert_eq!(original.value(), Value::from("kept"));
        assert_eq!(state.registry().live_count(), 1);
    }

    #[test]
    fn take_leaves_nil_behind() {
        let mut state = State::new();
        let mut source = Reference::from_rust(&mut state, 5_i64).unwrap();
        let moved = source.take();
        assert!(source.is_nil());
        assert_eq!(source.slot(), NIL_REF);
        assert_eq!(moved.get::<i64>(&mut state).unwrap(), 5);
        drop(source);
        assert_eq!(state.registry().live_count(), 1);
    }

    #[test]
    fn nil_references_hold_no_slot() {
        let state = State::new();
        let nil = Reference::new(&state, Value::Nil);
        assert_eq!(nil.slot(), NIL_REF);
        assert_eq!(nil.value_type(), ValueType::Nil);
        assert_eq!(state.registry().live_count(), 0);
    }

    #[test]
    fn set_replaces_value() {
        let mut state = State::new();
        let mut r = Reference::new(&state, Value::Nil);
        r.set(&mut state, 3_i32).unwrap();
        assert_eq!(r.get::<i32>(&mut state).unwrap(), 3);
        r.set(&mut state, "x").unwrap();
        assert_eq!(r.get::<String>(&mut state).unwrap(), "x");
        assert_eq!(state.registry().live_count(), 1);
    }

    #[test]
    fn entries_resolve_lazily() {
        let mut state = State::new();
        let table = state.new_table();
        let root = Reference::new(&state, Value::Table(table));
        root.entry("inner")
            .set(&mut state, Value::Table(TableRef::new()))
            .unwrap();
        let deep = root.entry("inner").entry("x");
        deep.set(&mut state, 42_i32).unwrap();
        assert_eq!(deep.get::<i32>(&mut state).unwrap(), 42);

        root.entry("inner").set(&mut state, Value::Table(TableRef::new())).unwrap();
        assert!(deep.value(&mut state).unwrap().is_nil());
    }

    #[test]
    fn sequence_pairs_in_index_order() {
        let mut state = State::new();
        let list = Reference::from_rust(&mut state, vec![10, 20, 30]).unwrap();
        let pairs: Vec<(i64, i64)> = list
            .pairs()
            .unwrap()
            .map(|(k, v)| (k.get(&mut state).unwrap(), v.get(&mut state).unwrap()))
            .collect();
        assert_eq!(pairs, vec![(1, 10), (2, 20), (3, 30)]);
    }

    #[test]
    fn pairs_rejects_non_tables() {
        let mut state = State::new();
        let n = Reference::from_rust(&mut state, 1_i32).unwrap();
        assert!(n.pairs().is_err());
    }

    #[test]
    fn operations_restore_the_stack() {
        let mut state = State::new();
        let a = Reference::from_rust(&mut state, 1_i32).unwrap();
        let b = Reference::from_rust(&mut state, 2_i32).unwrap();
        state.push_str("sentinel");
        assert!(a.less_than(&mut state, &b).unwrap());
        assert!(!a.equals(&mut state, &b).unwrap());
        assert!(a.less_equal(&mut state, &a.clone()).unwrap());
        assert_eq!(a.to_display_string(&mut state).unwrap(), "1");
        let s = Reference::from_rust(&mut state, "abc").unwrap();
        assert_eq!(s.len(&mut state).unwrap(), Value::Int(3));
        assert_eq!(state.top(), 1);
    }

    #[test]
    fn comparison_errors_propagate() {
        let mut state = State::new();
        let a = Reference::from_rust(&mut state, 1_i32).unwrap();
        let b = Reference::from_rust(&mut state, "x").unwrap();
        let err = a.less_than(&mut state, &b).unwrap_err();
        assert_eq!(err.to_string(), "attempt to compare number with string");
        assert_eq!(state.top(), 0);
    }

    #[test]
    fn metatable_lookup() {
        let mut state = State::new();
        let table = state.new_table();
        let meta = TableRef::new();
        table.set_metatable(Some(meta.clone()));
        let r = Reference::new(&state, Value::Table(table));
        let found = r.metatable(&state).unwrap();
        assert_eq!(found.value(), Value::Table(meta));
        assert!(Reference::new(&state, Value::Int(1)).metatable(&state).is_none());
    }
}
