//! The runtime state: value stack, call frames, globals and registry.
//!
//! Stack indices follow the usual embedding convention. Positive indices
//! count from the first argument of the current frame (1-based), negative
//! indices count down from the top (`-1` is the topmost value), and
//! indices at or below [`REGISTRY_INDEX`] are pseudo-indices for the
//! registry and the running closure's upvalues.

use std::any::{Any, TypeId};
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::config::StateConfig;
use crate::error::{RuntimeError, Status};
use crate::function::{FunctionRef, NativeFn};
use crate::heap::{ObjectHeap, UserdataHandle};
use crate::registry::RegistryRef;
use crate::table::{Table, TableRef};
use crate::value::{LightRef, Value, ValueType, format_float};

/// Pseudo-index of the registry table.
pub const REGISTRY_INDEX: i32 = -1_001_000;

/// Result count meaning "keep every result".
pub const MULTRET: i32 = -1;

/// Pseudo-index of the running closure's `i`-th upvalue (1-based).
pub const fn upvalue_index(i: i32) -> i32 {
    REGISTRY_INDEX - i
}

const MAX_META_CHAIN: usize = 100;

/// Comparison selector for [`State::compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Lt,
    Le,
}

struct CallFrame {
    function: FunctionRef,
    base: usize,
}

/// An embedded runtime instance.
pub struct State {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: TableRef,
    registry: RegistryRef,
    pub(crate) heap: ObjectHeap,
    app_data: FxHashMap<TypeId, Box<dyn Any>>,
    config: StateConfig,
}

impl State {
    pub fn new() -> Self {
        Self::with_config(StateConfig::default())
    }

    pub fn with_config(config: StateConfig) -> Self {
        Self {
            stack: Vec::with_capacity(64),
            frames: Vec::new(),
            globals: TableRef::new(),
            registry: RegistryRef::new(),
            heap: ObjectHeap::new(),
            app_data: FxHashMap::default(),
            config,
        }
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    // ========================================================================
    // Stack
    // ========================================================================

    fn base(&self) -> usize {
        self.frames.last().map_or(0, |frame| frame.base)
    }

    fn slot(&self, index: i32) -> Option<usize> {
        let base = self.base();
        if index > 0 {
            let pos = base + index as usize - 1;
            (pos < self.stack.len()).then_some(pos)
        } else if index < 0 && index > REGISTRY_INDEX {
            let depth = index.unsigned_abs() as usize;
            (depth <= self.stack.len() - base).then(|| self.stack.len() - depth)
        } else {
            None
        }
    }

    /// Number of values in the current frame.
    pub fn top(&self) -> i32 {
        (self.stack.len() - self.base()) as i32
    }

    /// Grow (with `nil`) or shrink the current frame.
    pub fn set_top(&mut self, index: i32) {
        let base = self.base();
        let len = if index >= 0 {
            base + index as usize
        } else {
            (self.stack.len() as i64 + index as i64 + 1).max(base as i64) as usize
        };
        self.stack.resize(len, Value::Nil);
    }

    /// Convert a relative index into one that survives pushes and pops.
    pub fn abs_index(&self, index: i32) -> i32 {
        if index > 0 || index <= REGISTRY_INDEX {
            index
        } else {
            self.top() + index + 1
        }
    }

    /// Fail if `extra` more slots would exceed the configured limit.
    pub fn check_stack(&self, extra: usize) -> Result<(), RuntimeError> {
        if self.stack.len() + extra > self.config.max_stack_slots {
            return Err(RuntimeError::memory("stack overflow"));
        }
        Ok(())
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn push_nil(&mut self) {
        self.push(Value::Nil);
    }

    pub fn push_bool(&mut self, value: bool) {
        self.push(Value::Bool(value));
    }

    pub fn push_int(&mut self, value: i64) {
        self.push(Value::Int(value));
    }

    pub fn push_number(&mut self, value: f64) {
        self.push(Value::Float(value));
    }

    pub fn push_str(&mut self, value: &str) {
        self.push(Value::from(value));
    }

    pub fn push_light<T: Any>(&mut self, value: Rc<T>) {
        self.push(Value::Light(LightRef::new(value)));
    }

    /// Push a copy of the value at `index`.
    pub fn push_value(&mut self, index: i32) {
        let value = self.value(index);
        self.push(value);
    }

    /// Pop the topmost value of the current frame (`nil` if it is empty).
    pub fn pop(&mut self) -> Value {
        if self.stack.len() > self.base() {
            self.stack.pop().unwrap_or_default()
        } else {
            Value::Nil
        }
    }

    /// Discard `n` values from the top of the current frame.
    pub fn discard(&mut self, n: usize) {
        let len = self.stack.len().saturating_sub(n).max(self.base());
        self.stack.truncate(len);
    }

    /// The value at `index`, `nil` if the index is not valid.
    pub fn value(&self, index: i32) -> Value {
        if index == REGISTRY_INDEX {
            return Value::Table(self.registry.table().clone());
        }
        if index < REGISTRY_INDEX {
            let up = (REGISTRY_INDEX - index) as usize;
            return self
                .frames
                .last()
                .and_then(|frame| frame.function.upvalue(up - 1))
                .unwrap_or_default();
        }
        self.slot(index)
            .map(|pos| self.stack[pos].clone())
            .unwrap_or_default()
    }

    /// Type of the value at `index`, `None` when the index is not valid.
    pub fn value_type(&self, index: i32) -> ValueType {
        if index == REGISTRY_INDEX {
            return ValueType::Table;
        }
        if index < REGISTRY_INDEX {
            let up = (REGISTRY_INDEX - index) as usize;
            return self
                .frames
                .last()
                .and_then(|frame| frame.function.upvalue(up - 1))
                .map_or(ValueType::None, |v| v.value_type());
        }
        self.slot(index)
            .map_or(ValueType::None, |pos| self.stack[pos].value_type())
    }

    pub fn is_none(&self, index: i32) -> bool {
        self.value_type(index) == ValueType::None
    }

    pub fn is_none_or_nil(&self, index: i32) -> bool {
        matches!(self.value_type(index), ValueType::None | ValueType::Nil)
    }

    /// Pop the top value and store it at `index`.
    pub fn replace(&mut self, index: i32) -> Result<(), RuntimeError> {
        let index = self.abs_index(index);
        let value = self.pop();
        if index < REGISTRY_INDEX {
            let up = (REGISTRY_INDEX - index) as usize;
            let stored = self
                .frames
                .last()
                .is_some_and(|frame| frame.function.set_upvalue(up - 1, value));
            if !stored {
                return Err(RuntimeError::runtime(format!("no upvalue {up} in running function")));
            }
            return Ok(());
        }
        match self.slot(index) {
            Some(pos) => {
                self.stack[pos] = value;
                Ok(())
            }
            None => Err(RuntimeError::runtime(format!("invalid stack index {index}"))),
        }
    }

    /// Move the top value to `index`, shifting the values above it up.
    pub fn insert(&mut self, index: i32) -> Result<(), RuntimeError> {
        let pos = self
            .slot(index)
            .ok_or_else(|| RuntimeError::runtime(format!("invalid stack index {index}")))?;
        let value = self.pop();
        self.stack.insert(pos, value);
        Ok(())
    }

    /// Remove the value at `index`, shifting the values above it down.
    pub fn remove(&mut self, index: i32) -> Value {
        match self.slot(index) {
            Some(pos) => self.stack.remove(pos),
            None => Value::Nil,
        }
    }

    pub fn raw_equal(&self, a: i32, b: i32) -> bool {
        !self.is_none(a) && !self.is_none(b) && self.value(a).raw_equal(&self.value(b))
    }

    // ========================================================================
    // Tables and metatables
    // ========================================================================

    pub fn globals(&self) -> &TableRef {
        &self.globals
    }

    pub fn registry(&self) -> &RegistryRef {
        &self.registry
    }

    /// Push a new table with preallocated space and return a handle to it.
    pub fn create_table(&mut self, array: usize, hash: usize) -> TableRef {
        let table = TableRef::from_table(Table::with_capacity(array, hash));
        self.push(Value::Table(table.clone()));
        table
    }

    pub fn new_table(&mut self) -> TableRef {
        self.create_table(0, 0)
    }

    fn table_at(&self, index: i32) -> Result<TableRef, RuntimeError> {
        match self.value(index) {
            Value::Table(t) => Ok(t),
            other => Err(RuntimeError::runtime(format!(
                "table expected, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn metatable_of(&self, value: &Value) -> Option<TableRef> {
        match value {
            Value::Table(t) => t.metatable(),
            Value::Userdata(h) => self.heap.metatable(*h),
            _ => None,
        }
    }

    /// Raw lookup of `event` in the metatable of `value`.
    pub fn metafield(&self, value: &Value, event: &str) -> Value {
        self.metatable_of(value)
            .map(|mt| mt.raw_get_str(event))
            .unwrap_or_default()
    }

    /// Pop a table (or `nil`) and make it the metatable of the value at `index`.
    pub fn set_metatable(&mut self, index: i32) -> Result<(), RuntimeError> {
        let target = self.value(index);
        let metatable = match self.pop() {
            Value::Nil => None,
            Value::Table(t) => Some(t),
            other => {
                return Err(RuntimeError::runtime(format!(
                    "metatable must be a table or nil, got {}",
                    other.type_name()
                )));
            }
        };
        match target {
            Value::Table(t) => {
                t.set_metatable(metatable);
                Ok(())
            }
            Value::Userdata(h) if self.heap.set_metatable(h, metatable) => Ok(()),
            other => Err(RuntimeError::type_error("set the metatable of", other.type_name())),
        }
    }

    /// Push the metatable of the value at `index`, if it has one.
    pub fn get_metatable(&mut self, index: i32) -> bool {
        match self.metatable_of(&self.value(index)) {
            Some(mt) => {
                self.push(Value::Table(mt));
                true
            }
            None => false,
        }
    }

    /// `target[key]`, following `__index`.
    pub fn index_value(&mut self, target: &Value, key: &Value) -> Result<Value, RuntimeError> {
        let mut current = target.clone();
        for _ in 0..MAX_META_CHAIN {
            let handler = match &current {
                Value::Table(t) => {
                    let raw = t.raw_get(key);
                    if !raw.is_nil() {
                        return Ok(raw);
                    }
                    match t.metatable() {
                        Some(mt) => mt.raw_get_str("__index"),
                        None => return Ok(Value::Nil),
                    }
                }
                other => {
                    let handler = self.metafield(other, "__index");
                    if handler.is_nil() {
                        return Err(RuntimeError::type_error("index", other.type_name()));
                    }
                    handler
                }
            };
            match handler {
                Value::Nil => return Ok(Value::Nil),
                Value::Function(_) => return self.first_result(&handler, &[current, key.clone()]),
                next => current = next,
            }
        }
        Err(RuntimeError::runtime("'__index' chain too long; possible loop"))
    }

    /// `target[key] = value`, following `__newindex`.
    pub fn set_index_value(&mut self, target: &Value, key: Value, value: Value) -> Result<(), RuntimeError> {
        let mut current = target.clone();
        for _ in 0..MAX_META_CHAIN {
            let handler = match &current {
                Value::Table(t) => {
                    let handler = if t.raw_get(&key).is_nil() {
                        t.metatable()
                            .map(|mt| mt.raw_get_str("__newindex"))
                            .unwrap_or_default()
                    } else {
                        Value::Nil
                    };
                    if handler.is_nil() {
                        return t.raw_set(&key, value);
                    }
                    handler
                }
                other => {
                    let handler = self.metafield(other, "__newindex");
                    if handler.is_nil() {
                        return Err(RuntimeError::type_error("index", other.type_name()));
                    }
                    handler
                }
            };
            match handler {
                Value::Function(_) => {
                    self.call_value(&handler, &[current, key, value], 0)?;
                    return Ok(());
                }
                next => current = next,
            }
        }
        Err(RuntimeError::runtime("'__newindex' chain too long; possible loop"))
    }

    /// Push `t[name]` where `t` is the value at `index`.
    pub fn get_field(&mut self, index: i32, name: &str) -> Result<ValueType, RuntimeError> {
        let target = self.value(index);
        let value = self.index_value(&target, &Value::from(name))?;
        let ty = value.value_type();
        self.push(value);
        Ok(ty)
    }

    /// Pop a value and assign it to `t[name]` where `t` is at `index`.
    pub fn set_field(&mut self, index: i32, name: &str) -> Result<(), RuntimeError> {
        let target = self.value(index);
        let value = self.pop();
        self.set_index_value(&target, Value::from(name), value)
    }

    /// Replace the key on top of the stack with `t[key]`.
    pub fn get_table(&mut self, index: i32) -> Result<ValueType, RuntimeError> {
        let target = self.value(index);
        let key = self.pop();
        let value = self.index_value(&target, &key)?;
        let ty = value.value_type();
        self.push(value);
        Ok(ty)
    }

    /// Pop a value and a key and perform `t[key] = value`.
    pub fn set_table(&mut self, index: i32) -> Result<(), RuntimeError> {
        let target = self.value(index);
        let value = self.pop();
        let key = self.pop();
        self.set_index_value(&target, key, value)
    }

    /// Like [`State::get_table`] without metamethods.
    pub fn raw_get(&mut self, index: i32) -> Result<ValueType, RuntimeError> {
        let table = self.table_at(index)?;
        let key = self.pop();
        let value = table.raw_get(&key);
        let ty = value.value_type();
        self.push(value);
        Ok(ty)
    }

    /// Like [`State::set_table`] without metamethods.
    pub fn raw_set(&mut self, index: i32) -> Result<(), RuntimeError> {
        let table = self.table_at(index)?;
        let value = self.pop();
        let key = self.pop();
        table.raw_set(&key, value)
    }

    pub fn raw_get_int(&mut self, index: i32, i: i64) -> Result<ValueType, RuntimeError> {
        let value = self.table_at(index)?.raw_get_int(i);
        let ty = value.value_type();
        self.push(value);
        Ok(ty)
    }

    pub fn raw_set_int(&mut self, index: i32, i: i64) -> Result<(), RuntimeError> {
        let table = self.table_at(index)?;
        let value = self.pop();
        table.raw_set_int(i, value);
        Ok(())
    }

    /// Pop a key and push the next key/value pair of the table at `index`.
    ///
    /// Returns false, pushing nothing, when the traversal is complete.
    pub fn next(&mut self, index: i32) -> Result<bool, RuntimeError> {
        let table = self.table_at(index)?;
        let key = self.pop();
        let entry = table.borrow().next(&key)?;
        match entry {
            Some((key, value)) => {
                self.push(key);
                self.push(value);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Primitive length: string bytes or table border, 0 otherwise.
    pub fn raw_len(&self, index: i32) -> usize {
        match self.value(index) {
            Value::Str(s) => s.len(),
            Value::Table(t) => t.raw_len(),
            _ => 0,
        }
    }

    /// Push the length of the value at `index`, honoring `__len`.
    pub fn len(&mut self, index: i32) -> Result<(), RuntimeError> {
        let target = self.value(index);
        let length = self.length_of(&target)?;
        self.push(length);
        Ok(())
    }

    pub fn length_of(&mut self, value: &Value) -> Result<Value, RuntimeError> {
        if let Value::Str(s) = value {
            return Ok(Value::Int(s.len() as i64));
        }
        let handler = self.metafield(value, "__len");
        if !handler.is_nil() {
            return self.first_result(&handler, &[value.clone()]);
        }
        match value {
            Value::Table(t) => Ok(Value::Int(t.raw_len() as i64)),
            other => Err(RuntimeError::type_error("get length of", other.type_name())),
        }
    }

    /// Compare two stack values. Invalid indices compare false.
    pub fn compare(&mut self, a: i32, b: i32, op: CompareOp) -> Result<bool, RuntimeError> {
        if self.is_none(a) || self.is_none(b) {
            return Ok(false);
        }
        let (a, b) = (self.value(a), self.value(b));
        match op {
            CompareOp::Eq => self.values_equal(&a, &b),
            CompareOp::Lt => self.values_less_than(&a, &b),
            CompareOp::Le => self.values_less_equal(&a, &b),
        }
    }

    /// Equality honoring `__eq` for pairs of tables or pairs of userdata.
    pub fn values_equal(&mut self, a: &Value, b: &Value) -> Result<bool, RuntimeError> {
        if a.raw_equal(b) {
            return Ok(true);
        }
        let same_kind = matches!(
            (a, b),
            (Value::Table(_), Value::Table(_)) | (Value::Userdata(_), Value::Userdata(_))
        );
        if !same_kind {
            return Ok(false);
        }
        let mut handler = self.metafield(a, "__eq");
        if handler.is_nil() {
            handler = self.metafield(b, "__eq");
        }
        if handler.is_nil() {
            return Ok(false);
        }
        Ok(self.first_result(&handler, &[a.clone(), b.clone()])?.is_truthy())
    }

    pub fn values_less_than(&mut self, a: &Value, b: &Value) -> Result<bool, RuntimeError> {
        self.order(a, b, "__lt", |ord| ord.is_lt())
    }

    pub fn values_less_equal(&mut self, a: &Value, b: &Value) -> Result<bool, RuntimeError> {
        self.order(a, b, "__le", |ord| ord.is_le())
    }

    fn order(
        &mut self,
        a: &Value,
        b: &Value,
        event: &str,
        accept: fn(std::cmp::Ordering) -> bool,
    ) -> Result<bool, RuntimeError> {
        let primitive = match (a, b) {
            (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
            (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
            _ => match (a.as_float(), b.as_float()) {
                // NaN compares false either way.
                (Some(x), Some(y)) => match x.partial_cmp(&y) {
                    Some(ord) => Some(ord),
                    None => return Ok(false),
                },
                _ => None,
            },
        };
        if let Some(ord) = primitive {
            return Ok(accept(ord));
        }
        let mut handler = self.metafield(a, event);
        if handler.is_nil() {
            handler = self.metafield(b, event);
        }
        if handler.is_nil() {
            let (ta, tb) = (a.type_name(), b.type_name());
            return Err(RuntimeError::runtime(if ta == tb {
                format!("attempt to compare two {ta} values")
            } else {
                format!("attempt to compare {ta} with {tb}")
            }));
        }
        Ok(self.first_result(&handler, &[a.clone(), b.clone()])?.is_truthy())
    }

    /// Render a value as text, honoring `__tostring` and `__name`.
    pub fn display(&mut self, value: &Value) -> Result<String, RuntimeError> {
        let handler = self.metafield(value, "__tostring");
        if !handler.is_nil() {
            return match self.first_result(&handler, &[value.clone()])? {
                Value::Str(s) => Ok(s.to_string()),
                Value::Int(i) => Ok(i.to_string()),
                Value::Float(f) => Ok(format_float(f)),
                _ => Err(RuntimeError::runtime("'__tostring' must return a string")),
            };
        }
        Ok(match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => s.to_string(),
            Value::Table(t) => format!("table: {:#x}", t.addr()),
            Value::Function(f) => format!("function: {:#x}", f.addr()),
            Value::Userdata(h) => match self.metafield(value, "__name") {
                Value::Str(name) => format!("{name}: {:#010x}", h.index),
                _ => format!("userdata: {:#010x}", h.index),
            },
            Value::Light(l) => format!("userdata: {:#x}", l.addr()),
        })
    }

    /// Render the value at `index` as text.
    pub fn to_display_string(&mut self, index: i32) -> Result<String, RuntimeError> {
        let value = self.value(index);
        self.display(&value)
    }

    // ========================================================================
    // Globals and registry
    // ========================================================================

    pub fn get_global(&mut self, name: &str) -> Result<ValueType, RuntimeError> {
        let globals = Value::Table(self.globals.clone());
        let value = self.index_value(&globals, &Value::from(name))?;
        let ty = value.value_type();
        self.push(value);
        Ok(ty)
    }

    pub fn set_global(&mut self, name: &str) -> Result<(), RuntimeError> {
        let globals = Value::Table(self.globals.clone());
        let value = self.pop();
        self.set_index_value(&globals, Value::from(name), value)
    }

    /// Pop the top value into a fresh registry slot.
    pub fn reference(&mut self) -> i32 {
        let value = self.pop();
        self.registry.reference(value)
    }

    pub fn unreference(&mut self, slot: i32) {
        self.registry.release(slot);
    }

    pub fn push_reference(&mut self, slot: i32) {
        let value = self.registry.get(slot);
        self.push(value);
    }

    // ========================================================================
    // Userdata
    // ========================================================================

    /// Allocate a userdata, push it and return its handle.
    pub fn new_userdata(&mut self, payload: Rc<dyn Any>) -> UserdataHandle {
        let handle = self.heap.allocate(payload);
        self.push(Value::Userdata(handle));
        handle
    }

    /// Handle and payload of a live userdata at `index`.
    pub fn userdata(&self, index: i32) -> Option<(UserdataHandle, Rc<dyn Any>)> {
        let handle = self.value(index).as_userdata()?;
        let payload = self.heap.get(handle)?.clone();
        Some((handle, payload))
    }

    pub fn heap(&self) -> &ObjectHeap {
        &self.heap
    }

    // ========================================================================
    // Functions and calls
    // ========================================================================

    pub fn push_function(&mut self, native: NativeFn) {
        self.push(Value::Function(FunctionRef::new(native, Vec::new())));
    }

    /// Pop `upvalues` values and push a closure capturing them in order.
    pub fn push_closure(&mut self, native: NativeFn, upvalues: usize) {
        let at = self.stack.len().saturating_sub(upvalues).max(self.base());
        let captured = self.stack.split_off(at);
        self.push(Value::Function(FunctionRef::new(native, captured)));
    }

    /// The closure whose frame is active, if any.
    pub fn current_function(&self) -> Option<&FunctionRef> {
        self.frames.last().map(|frame| &frame.function)
    }

    /// Number of native frames currently active.
    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    /// Call the function sitting below `nargs` arguments.
    ///
    /// The function and its arguments are replaced by its results, adjusted
    /// to `nresults` unless that is [`MULTRET`]. On error the function and
    /// arguments are removed and nothing is pushed.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn call(&mut self, nargs: i32, nresults: i32) -> Result<(), RuntimeError> {
        let nargs = nargs.max(0) as usize;
        if self.stack.len() < self.base() + nargs + 1 {
            return Err(RuntimeError::runtime("not enough values on the stack for call"));
        }
        let func_pos = self.stack.len() - nargs - 1;
        let function = match self.resolve_callable(func_pos) {
            Ok(function) => function,
            Err(err) => {
                self.stack.truncate(func_pos);
                return Err(err);
            }
        };
        if self.frames.len() >= self.config.max_call_depth {
            self.stack.truncate(func_pos);
            return Err(RuntimeError::runtime("stack overflow (call depth exceeded)"));
        }
        if let Err(err) = self.check_stack(0) {
            self.stack.truncate(func_pos);
            return Err(err);
        }

        let base = func_pos + 1;
        tracing::trace!(depth = self.frames.len(), nargs = self.stack.len() - base, "native call");
        self.frames.push(CallFrame {
            function: function.clone(),
            base,
        });
        let outcome = function.native().call(self);
        self.frames.pop();

        match outcome {
            Ok(count) => self.finish_call(func_pos, base, count, nresults),
            Err(err) => {
                self.stack.truncate(func_pos);
                Err(err)
            }
        }
    }

    fn resolve_callable(&mut self, func_pos: usize) -> Result<FunctionRef, RuntimeError> {
        let callee = self.stack[func_pos].clone();
        if let Value::Function(function) = callee {
            return Ok(function);
        }
        match self.metafield(&callee, "__call") {
            Value::Function(handler) => {
                self.stack.insert(func_pos, Value::Function(handler.clone()));
                Ok(handler)
            }
            _ => Err(RuntimeError::type_error("call", callee.type_name())),
        }
    }

    fn finish_call(&mut self, func_pos: usize, base: usize, count: i32, nresults: i32) -> Result<(), RuntimeError> {
        let available = self.stack.len().saturating_sub(base);
        if count < 0 || count as usize > available {
            self.stack.truncate(func_pos);
            return Err(RuntimeError::runtime(format!(
                "native function reported {count} results but its frame holds {available}"
            )));
        }
        let first = self.stack.len() - count as usize;
        self.stack.drain(func_pos..first);
        if nresults != MULTRET {
            self.stack.resize(func_pos + nresults.max(0) as usize, Value::Nil);
        }
        Ok(())
    }

    /// Protected call: errors become a status plus a message on the stack.
    pub fn pcall(&mut self, nargs: i32, nresults: i32) -> Status {
        let func_pos = self
            .stack
            .len()
            .saturating_sub(nargs.max(0) as usize + 1)
            .max(self.base());
        let depth = self.frames.len();
        match self.call(nargs, nresults) {
            Ok(()) => Status::Ok,
            Err(err) => {
                self.frames.truncate(depth);
                self.stack.truncate(func_pos);
                self.push(Value::from(err.message()));
                err.status()
            }
        }
    }

    /// Call `function` with `args` and collect its results.
    pub fn call_value(&mut self, function: &Value, args: &[Value], nresults: i32) -> Result<Vec<Value>, RuntimeError> {
        let func_pos = self.stack.len();
        self.push(function.clone());
        for arg in args {
            self.push(arg.clone());
        }
        self.call(args.len() as i32, nresults)?;
        Ok(self.stack.split_off(func_pos))
    }

    fn first_result(&mut self, function: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
        Ok(self
            .call_value(function, args, 1)?
            .into_iter()
            .next()
            .unwrap_or_default())
    }

    // ========================================================================
    // Application data
    // ========================================================================

    /// Attach host data keyed by type. Returns the previous value.
    pub fn set_app_data<T: Any>(&mut self, data: T) -> Option<T> {
        self.app_data
            .insert(TypeId::of::<T>(), Box::new(data))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn app_data<T: Any>(&self) -> Option<&T> {
        self.app_data.get(&TypeId::of::<T>())?.downcast_ref()
    }

    pub fn app_data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.app_data.get_mut(&TypeId::of::<T>())?.downcast_mut()
    }

    pub fn remove_app_data<T: Any>(&mut self) -> Option<T> {
        self.app_data
            .remove(&TypeId::of::<T>())
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub(crate) fn roots(&self) -> Vec<Value> {
        let mut roots = self.stack.clone();
        roots.push(Value::Table(self.globals.clone()));
        roots.push(Value::Table(self.registry.table().clone()));
        roots.extend(self.frames.iter().map(|f| Value::Function(f.function.clone())));
        roots
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("stack", &self.stack.len())
            .field("frames", &self.frames.len())
            .field("heap", &self.heap)
            .finish_non_exhaustive()
    }
}
