//! The registry: a table of values pinned on behalf of host code.
//!
//! Slots are small positive integers recycled through a free list. The
//! registry is shared through an `Rc` so that a handle can give its slot
//! back when it is dropped, without needing the state.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::table::TableRef;
use crate::value::Value;

/// Returned for a failed reference.
pub const NO_REF: i32 = -2;
/// Returned when the referenced value is `nil`; no slot is used.
pub const NIL_REF: i32 = -1;

struct Registry {
    table: TableRef,
    free: RefCell<Vec<i32>>,
    next: Cell<i32>,
    live: Cell<usize>,
}

/// Shared handle to a state's registry.
#[derive(Clone)]
pub struct RegistryRef(Rc<Registry>);

impl RegistryRef {
    pub fn new() -> Self {
        RegistryRef(Rc::new(Registry {
            table: TableRef::new(),
            free: RefCell::new(Vec::new()),
            next: Cell::new(1),
            live: Cell::new(0),
        }))
    }

    /// The registry table itself.
    pub fn table(&self) -> &TableRef {
        &self.0.table
    }

    /// Pin `value` and return its slot.
    pub fn reference(&self, value: Value) -> i32 {
        if value.is_nil() {
            return NIL_REF;
        }
        let slot = match self.0.free.borrow_mut().pop() {
            Some(slot) => slot,
            None => {
                let slot = self.0.next.get();
                self.0.next.set(slot + 1);
                slot
            }
        };
        self.0.table.raw_set_int(slot as i64, value);
        self.0.live.set(self.0.live.get() + 1);
        slot
    }

    /// The value in `slot`, or `nil` for the sentinel slots.
    pub fn get(&self, slot: i32) -> Value {
        if slot <= 0 {
            return Value::Nil;
        }
        self.0.table.raw_get_int(slot as i64)
    }

    /// Overwrite a live slot. Writing `nil` keeps the slot reserved.
    pub fn set(&self, slot: i32, value: Value) {
        if slot > 0 {
            self.0.table.raw_set_int(slot as i64, value);
        }
    }

    /// Give a slot back. Sentinel slots are ignored.
    pub fn release(&self, slot: i32) {
        if slot <= 0 || slot >= self.0.next.get() {
            return;
        }
        let mut free = self.0.free.borrow_mut();
        if free.contains(&slot) {
            return;
        }
        self.0.table.raw_set_int(slot as i64, Value::Nil);
        free.push(slot);
        self.0.live.set(self.0.live.get() - 1);
    }

    /// Number of slots currently held.
    pub fn live_count(&self) -> usize {
        self.0.live.get()
    }

    pub fn ptr_eq(&self, other: &RegistryRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for RegistryRef {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RegistryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryRef")
            .field("live", &self.live_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_uses_no_slot() {
        let reg = RegistryRef::new();
        assert_eq!(reg.reference(Value::Nil), NIL_REF);
        assert_eq!(reg.live_count(), 0);
        assert_eq!(reg.get(NIL_REF), Value::Nil);
    }

    #[test]
    fn slots_are_recycled() {
        let reg = RegistryRef::new();
        let a = reg.reference(Value::Int(1));
        let b = reg.reference(Value::Int(2));
        assert_ne!(a, b);
        reg.release(a);
        assert_eq!(reg.get(a), Value::Nil);
        let c = reg.reference(Value::Int(3));
        assert_eq!(c, a);
        assert_eq!(reg.get(c), Value::Int(3));
        assert_eq!(reg.live_count(), 2);
    }

    #[test]
    fn double_release_is_ignored() {
        let reg = RegistryRef::new();
        let a = reg.reference(Value::Bool(true));
        reg.release(a);
        reg.release(a);
        assert_eq!(reg.live_count(), 0);
        let b = reg.reference(Value::Int(1));
        let c = reg.reference(Value::Int(2));
        assert_ne!(b, c);
    }

    #[test]
    fn release_ignores_sentinels() {
        let reg = RegistryRef::new();
        reg.release(NO_REF);
        reg.release(NIL_REF);
        reg.release(99);
        assert_eq!(reg.live_count(), 0);
    }
}
