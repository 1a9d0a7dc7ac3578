//! Tables: an array part for `1..n` plus an insertion-ordered hash part.
//!
//! Assigning `nil` to a hash entry leaves a dead entry in place so that a
//! traversal in progress can continue from that key. Dead entries are
//! compacted away only when a new key is inserted.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::error::RuntimeError;
use crate::value::{TableKey, Value};

/// Table storage.
#[derive(Default)]
pub struct Table {
    array: Vec<Value>,
    index: FxHashMap<TableKey, usize>,
    entries: Vec<(TableKey, Value)>,
    dead: usize,
    metatable: Option<TableRef>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(array: usize, hash: usize) -> Self {
        Self {
            array: Vec::with_capacity(array),
            index: FxHashMap::with_capacity_and_hasher(hash, Default::default()),
            entries: Vec::with_capacity(hash),
            ..Self::default()
        }
    }

    fn array_slot(&self, key: i64) -> Option<usize> {
        (key >= 1 && (key as u64) <= self.array.len() as u64).then(|| (key - 1) as usize)
    }

    pub fn get(&self, key: &TableKey) -> Value {
        if let TableKey::Int(i) = key
            && let Some(slot) = self.array_slot(*i)
        {
            return self.array[slot].clone();
        }
        self.index
            .get(key)
            .map(|&pos| self.entries[pos].1.clone())
            .unwrap_or_default()
    }

    pub fn set(&mut self, key: TableKey, value: Value) {
        if let TableKey::Int(i) = key {
            if let Some(slot) = self.array_slot(i) {
                self.array[slot] = value;
                return;
            }
            if i == self.array.len() as i64 + 1 && !value.is_nil() && !self.index.contains_key(&key) {
                self.array.push(value);
                self.migrate_from_hash();
                return;
            }
        }

        match self.index.get(&key) {
            Some(&pos) => {
                let entry = &mut self.entries[pos].1;
                match (entry.is_nil(), value.is_nil()) {
                    (true, false) => self.dead -= 1,
                    (false, true) => self.dead += 1,
                    _ => {}
                }
                *entry = value;
            }
            None if value.is_nil() => {}
            None => {
                if self.dead > 0 && self.dead * 2 >= self.entries.len() {
                    self.compact();
                }
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    /// Move `n+1, n+2, ...` out of the hash part after the array grew.
    fn migrate_from_hash(&mut self) {
        loop {
            let next = TableKey::Int(self.array.len() as i64 + 1);
            let Some(&pos) = self.index.get(&next) else {
                return;
            };
            let value = std::mem::take(&mut self.entries[pos].1);
            if value.is_nil() {
                return;
            }
            self.dead += 1;
            self.array.push(value);
        }
    }

    fn compact(&mut self) {
        self.entries.retain(|(_, value)| !value.is_nil());
        self.index.clear();
        for (pos, (key, _)) in self.entries.iter().enumerate() {
            self.index.insert(key.clone(), pos);
        }
        self.dead = 0;
    }

    /// A border: an `n` with `t[n] ~= nil` and `t[n+1] == nil` (or 0).
    pub fn len(&self) -> usize {
        let mut n = self.array.len();
        while n > 0 && self.array[n - 1].is_nil() {
            n -= 1;
        }
        if n == self.array.len() {
            while !self.get(&TableKey::Int(n as i64 + 1)).is_nil() {
                n += 1;
            }
        }
        n
    }

    pub fn is_empty(&self) -> bool {
        self.array.iter().all(Value::is_nil) && self.dead == self.entries.len()
    }

    /// The entry after `key` in traversal order; `nil` starts a traversal.
    ///
    /// Array entries come first, in index order, then hash entries in
    /// insertion order.
    pub fn next(&self, key: &Value) -> Result<Option<(Value, Value)>, RuntimeError> {
        let start = match key {
            Value::Nil => 0,
            key => {
                let key = TableKey::from_value(key)?;
                match key {
                    TableKey::Int(i) if self.array_slot(i).is_some() => i as usize,
                    key => match self.index.get(&key) {
                        Some(&pos) => return Ok(self.entry_from(pos + 1)),
                        None => return Err(RuntimeError::runtime("invalid key to 'next'")),
                    },
                }
            }
        };
        for slot in start..self.array.len() {
            let value = &self.array[slot];
            if !value.is_nil() {
                return Ok(Some((Value::Int(slot as i64 + 1), value.clone())));
            }
        }
        Ok(self.entry_from(0))
    }

    fn entry_from(&self, pos: usize) -> Option<(Value, Value)> {
        self.entries[pos.min(self.entries.len())..]
            .iter()
            .find(|(_, value)| !value.is_nil())
            .map(|(key, value)| (key.to_value(), value.clone()))
    }

    /// Every live key/value pair, in traversal order.
    pub fn pairs(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        let array = self
            .array
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nil())
            .map(|(i, v)| (Value::Int(i as i64 + 1), v.clone()));
        let hash = self
            .entries
            .iter()
            .filter(|(_, v)| !v.is_nil())
            .map(|(k, v)| (k.to_value(), v.clone()));
        array.chain(hash)
    }

    pub fn metatable(&self) -> Option<&TableRef> {
        self.metatable.as_ref()
    }

    pub fn set_metatable(&mut self, metatable: Option<TableRef>) {
        self.metatable = metatable;
    }
}

// ============================================================================
// TableRef
// ============================================================================

/// Shared handle to a table. Equality is identity.
#[derive(Clone, Default)]
pub struct TableRef(Rc<RefCell<Table>>);

impl TableRef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_table(table: Table) -> Self {
        TableRef(Rc::new(RefCell::new(table)))
    }

    /// A table whose array part holds `values`.
    pub fn from_sequence(values: impl IntoIterator<Item = Value>) -> Self {
        let mut table = Table::new();
        for (i, value) in values.into_iter().enumerate() {
            table.set(TableKey::Int(i as i64 + 1), value);
        }
        Self::from_table(table)
    }

    pub fn borrow(&self) -> Ref<'_, Table> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, Table> {
        self.0.borrow_mut()
    }

    pub fn ptr_eq(&self, other: &TableRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    /// Lookup without metamethods. A `nil` or NaN key reads as `nil`.
    pub fn raw_get(&self, key: &Value) -> Value {
        match TableKey::from_value(key) {
            Ok(key) => self.borrow().get(&key),
            Err(_) => Value::Nil,
        }
    }

    /// Assignment without metamethods.
    pub fn raw_set(&self, key: &Value, value: Value) -> Result<(), RuntimeError> {
        let key = TableKey::from_value(key)?;
        self.borrow_mut().set(key, value);
        Ok(())
    }

    pub fn raw_get_str(&self, name: &str) -> Value {
        self.borrow().get(&TableKey::str(name))
    }

    pub fn raw_set_str(&self, name: &str, value: Value) {
        self.borrow_mut().set(TableKey::str(name), value);
    }

    pub fn raw_get_int(&self, i: i64) -> Value {
        self.borrow().get(&TableKey::Int(i))
    }

    pub fn raw_set_int(&self, i: i64, value: Value) {
        self.borrow_mut().set(TableKey::Int(i), value);
    }

    pub fn raw_len(&self) -> usize {
        self.borrow().len()
    }

    pub fn metatable(&self) -> Option<TableRef> {
        self.borrow().metatable().cloned()
    }

    pub fn set_metatable(&self, metatable: Option<TableRef>) {
        self.borrow_mut().set_metatable(metatable);
    }
}

impl fmt::Debug for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableRef({:#x})", self.addr())
    }
}
