//! Conversions between Rust values and runtime stack slots.
//!
//! [`FromStack`] and [`ToStack`] are the per-type binding triple:
//! `check` tests whether a slot holds something convertible, `from_stack`
//! extracts it (only called after `check` succeeds, except on fallback
//! paths), and `to_stack` encodes a Rust value as exactly one stack value.
//!
//! Any type can join by implementing the two traits.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasher;
use std::rc::Rc;

use hostbind_core::{State, Table, TableRef, Value, ValueType, format_float};

use crate::error::{BindError, ConversionError};

/// How a callable's results land on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnShape {
    /// Nothing is pushed.
    Void,
    /// One value is pushed.
    Single,
    /// A tuple pushes its elements positionally.
    Multiple(usize),
    /// The callee pushed its own results and reports how many.
    RawCount,
    /// A native collection becomes one sequence table.
    Sequence,
}

/// Read a Rust value out of a stack slot.
pub trait FromStack: Sized {
    /// Name used in type mismatch messages.
    fn type_name() -> &'static str;

    fn check(state: &State, index: i32) -> bool;

    fn from_stack(state: &mut State, index: i32) -> Result<Self, BindError>;

    /// The error reported when `check` fails at `index`.
    fn mismatch(state: &State, index: i32) -> BindError {
        BindError::argument_type(Self::type_name(), state.value_type(index).name(), index)
    }
}

/// Push a Rust value as exactly one stack value.
pub trait ToStack {
    const SHAPE: ReturnShape = ReturnShape::Single;

    fn to_stack(self, state: &mut State) -> Result<(), BindError>;
}

/// Encode a value without leaving anything on the stack.
pub fn to_value<T: ToStack>(state: &mut State, value: T) -> Result<Value, BindError> {
    value.to_stack(state)?;
    Ok(state.pop())
}

/// Decode a runtime value that is not on the stack.
pub fn from_value<T: FromStack>(state: &mut State, value: Value) -> Result<T, BindError> {
    state.push(value);
    let result = if T::check(state, -1) {
        T::from_stack(state, -1)
    } else {
        Err(T::mismatch(state, -1))
    };
    state.discard(1);
    result
}

fn key_label(key: &Value) -> String {
    match key {
        Value::Str(s) => s.to_string(),
        Value::Int(i) => i.to_string(),
        other => other.type_name().to_string(),
    }
}

/// Decode a container element, reporting failures against its key.
fn element<T: FromStack>(state: &mut State, key: &Value, value: Value) -> Result<T, BindError> {
    state.push(value);
    let result = if T::check(state, -1) {
        T::from_stack(state, -1)
    } else {
        Err(ConversionError::ElementMismatch {
            key: key_label(key),
            expected: T::type_name(),
            actual: state.value_type(-1).name(),
        }
        .into())
    };
    state.discard(1);
    result
}

// ============================================================================
// Integers
// ============================================================================

macro_rules! impl_stack_int {
    ($($ty:ty),*) => {
        $(
            impl FromStack for $ty {
                fn type_name() -> &'static str {
                    "integer"
                }

                fn check(state: &State, index: i32) -> bool {
                    state.value(index).as_int().is_some()
                }

                fn from_stack(state: &mut State, index: i32) -> Result<Self, BindError> {
                    let Some(raw) = state.value(index).as_int() else {
                        return Err(Self::mismatch(state, index));
                    };
                    <$ty>::try_from(raw).map_err(|_| {
                        ConversionError::IntegerOverflow {
                            value: raw.to_string(),
                            target: stringify!($ty),
                        }
                        .into()
                    })
                }
            }

            impl ToStack for $ty {
                fn to_stack(self, state: &mut State) -> Result<(), BindError> {
                    state.push_int(self as i64);
                    Ok(())
                }
            }
        )*
    };
}

impl_stack_int!(i8, i16, i32, i64, isize, u8, u16, u32);

// 64-bit unsigned values travel as their two's complement bit pattern so
// every value survives a round trip.
macro_rules! impl_stack_bits {
    ($($ty:ty),*) => {
        $(
            impl FromStack for $ty {
                fn type_name() -> &'static str {
                    "integer"
                }

                fn check(state: &State, index: i32) -> bool {
                    state.value(index).as_int().is_some()
                }

                fn from_stack(state: &mut State, index: i32) -> Result<Self, BindError> {
                    match state.value(index).as_int() {
                        Some(raw) => Ok(raw as $ty),
                        None => Err(Self::mismatch(state, index)),
                    }
                }
            }

            impl ToStack for $ty {
                fn to_stack(self, state: &mut State) -> Result<(), BindError> {
                    state.push_int(self as i64);
                    Ok(())
                }
            }
        )*
    };
}

impl_stack_bits!(u64, usize);

// ============================================================================
// Floats
// ============================================================================

macro_rules! impl_stack_float {
    ($($ty:ty),*) => {
        $(
            impl FromStack for $ty {
                fn type_name() -> &'static str {
                    "number"
                }

                fn check(state: &State, index: i32) -> bool {
                    state.value(index).as_float().is_some()
                }

                fn from_stack(state: &mut State, index: i32) -> Result<Self, BindError> {
                    match state.value(index).as_float() {
                        Some(v) => Ok(v as $ty),
                        None => Err(Self::mismatch(state, index)),
                    }
                }
            }

            impl ToStack for $ty {
                fn to_stack(self, state: &mut State) -> Result<(), BindError> {
                    state.push_number(self as f64);
                    Ok(())
                }
            }
        )*
    };
}

impl_stack_float!(f32, f64);

// ============================================================================
// Booleans and nil
// ============================================================================

impl FromStack for bool {
    fn type_name() -> &'static str {
        "boolean"
    }

    fn check(state: &State, index: i32) -> bool {
        state.value_type(index) == ValueType::Boolean
    }

    fn from_stack(state: &mut State, index: i32) -> Result<Self, BindError> {
        match state.value(index) {
            Value::Bool(b) => Ok(b),
            _ => Err(Self::mismatch(state, index)),
        }
    }
}

impl ToStack for bool {
    fn to_stack(self, state: &mut State) -> Result<(), BindError> {
        state.push_bool(self);
        Ok(())
    }
}

/// The runtime's `nil`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Nil;

impl FromStack for Nil {
    fn type_name() -> &'static str {
        "nil"
    }

    fn check(state: &State, index: i32) -> bool {
        state.is_none_or_nil(index)
    }

    fn from_stack(_state: &mut State, _index: i32) -> Result<Self, BindError> {
        Ok(Nil)
    }
}

impl ToStack for Nil {
    fn to_stack(self, state: &mut State) -> Result<(), BindError> {
        state.push_nil();
        Ok(())
    }
}

// ============================================================================
// Text
// ============================================================================

fn is_text(state: &State, index: i32) -> bool {
    matches!(state.value_type(index), ValueType::String | ValueType::Number)
}

impl FromStack for String {
    fn type_name() -> &'static str {
        "string"
    }

    fn check(state: &State, index: i32) -> bool {
        is_text(state, index)
    }

    fn from_stack(state: &mut State, index: i32) -> Result<Self, BindError> {
        match state.value(index) {
            Value::Str(s) => Ok(s.to_string()),
            Value::Int(i) => Ok(i.to_string()),
            Value::Float(f) => Ok(format_float(f)),
            _ => Err(Self::mismatch(state, index)),
        }
    }
}

impl ToStack for String {
    fn to_stack(self, state: &mut State) -> Result<(), BindError> {
        state.push(Value::from(self));
        Ok(())
    }
}

impl ToStack for &str {
    fn to_stack(self, state: &mut State) -> Result<(), BindError> {
        state.push_str(self);
        Ok(())
    }
}

/// Shared text: strings are handed out without copying.
impl FromStack for Rc<str> {
    fn type_name() -> &'static str {
        "string"
    }

    fn check(state: &State, index: i32) -> bool {
        is_text(state, index)
    }

    fn from_stack(state: &mut State, index: i32) -> Result<Self, BindError> {
        match state.value(index) {
            Value::Str(s) => Ok(s),
            Value::Int(i) => Ok(Rc::from(i.to_string())),
            Value::Float(f) => Ok(Rc::from(format_float(f))),
            _ => Err(Self::mismatch(state, index)),
        }
    }
}

impl ToStack for Rc<str> {
    fn to_stack(self, state: &mut State) -> Result<(), BindError> {
        state.push(Value::Str(self));
        Ok(())
    }
}

// ============================================================================
// Raw values and light userdata
// ============================================================================

/// Any value, unconverted. An absent argument reads as `nil`.
impl FromStack for Value {
    fn type_name() -> &'static str {
        "value"
    }

    fn check(_state: &State, _index: i32) -> bool {
        true
    }

    fn from_stack(state: &mut State, index: i32) -> Result<Self, BindError> {
        Ok(state.value(index))
    }
}

impl ToStack for Value {
    fn to_stack(self, state: &mut State) -> Result<(), BindError> {
        state.push(self);
        Ok(())
    }
}

/// A host value shared by pointer. Both sides see the same `RefCell`.
impl<T: 'static> FromStack for Rc<RefCell<T>> {
    fn type_name() -> &'static str {
        "light userdata"
    }

    fn check(state: &State, index: i32) -> bool {
        match state.value(index) {
            Value::Light(light) => light.downcast::<RefCell<T>>().is_some(),
            _ => false,
        }
    }

    fn from_stack(state: &mut State, index: i32) -> Result<Self, BindError> {
        match state.value(index) {
            Value::Light(light) => light
                .downcast::<RefCell<T>>()
                .ok_or_else(|| Self::mismatch(state, index)),
            _ => Err(Self::mismatch(state, index)),
        }
    }
}

impl<T: 'static> ToStack for Rc<RefCell<T>> {
    fn to_stack(self, state: &mut State) -> Result<(), BindError> {
        state.push_light(self);
        Ok(())
    }
}

// ============================================================================
// Containers
// ============================================================================

impl<T: FromStack> FromStack for Option<T> {
    fn type_name() -> &'static str {
        T::type_name()
    }

    fn check(state: &State, index: i32) -> bool {
        state.is_none_or_nil(index) || T::check(state, index)
    }

    fn from_stack(state: &mut State, index: i32) -> Result<Self, BindError> {
        if state.is_none_or_nil(index) {
            Ok(None)
        } else {
            T::from_stack(state, index).map(Some)
        }
    }
}

impl<T: ToStack> ToStack for Option<T> {
    fn to_stack(self, state: &mut State) -> Result<(), BindError> {
        match self {
            Some(value) => value.to_stack(state),
            None => {
                state.push_nil();
                Ok(())
            }
        }
    }
}

fn table_at<T: FromStack>(state: &State, index: i32) -> Result<TableRef, BindError> {
    match state.value(index) {
        Value::Table(table) => Ok(table),
        _ => Err(T::mismatch(state, index)),
    }
}

/// A homogeneous sequence: the table's `1..n` part.
impl<T: FromStack> FromStack for Vec<T> {
    fn type_name() -> &'static str {
        "table"
    }

    fn check(state: &State, index: i32) -> bool {
        state.value_type(index) == ValueType::Table
    }

    fn from_stack(state: &mut State, index: i32) -> Result<Self, BindError> {
        let table = table_at::<Self>(state, index)?;
        let len = table.raw_len();
        let mut items = Vec::with_capacity(len);
        for i in 1..=len as i64 {
            let value = table.raw_get_int(i);
            items.push(element(state, &Value::Int(i), value)?);
        }
        Ok(items)
    }
}

impl<T: ToStack> ToStack for Vec<T> {
    const SHAPE: ReturnShape = ReturnShape::Sequence;

    fn to_stack(self, state: &mut State) -> Result<(), BindError> {
        let table = TableRef::from_table(Table::with_capacity(self.len(), 0));
        for (i, item) in self.into_iter().enumerate() {
            let value = to_value(state, item)?;
            table.raw_set_int(i as i64 + 1, value);
        }
        state.push(Value::Table(table));
        Ok(())
    }
}

/// Snapshot the pairs first: element conversion may touch the stack.
fn string_pairs<T: FromStack>(
    state: &mut State,
    table: &TableRef,
) -> Result<Vec<(String, T)>, BindError> {
    let pairs: Vec<(Value, Value)> = table.borrow().pairs().collect();
    let mut out = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        let Value::Str(name) = &key else {
            return Err(ConversionError::NonStringKey {
                actual: key.type_name(),
            }
            .into());
        };
        let item = element(state, &key, value)?;
        out.push((name.to_string(), item));
    }
    Ok(out)
}

fn push_string_map<T: ToStack>(
    state: &mut State,
    len: usize,
    entries: impl IntoIterator<Item = (String, T)>,
) -> Result<(), BindError> {
    let table = TableRef::from_table(Table::with_capacity(0, len));
    for (key, item) in entries {
        let value = to_value(state, item)?;
        table.raw_set_str(&key, value);
    }
    state.push(Value::Table(table));
    Ok(())
}

impl<T: FromStack, S: BuildHasher + Default> FromStack for HashMap<String, T, S> {
    fn type_name() -> &'static str {
        "table"
    }

    fn check(state: &State, index: i32) -> bool {
        state.value_type(index) == ValueType::Table
    }

    fn from_stack(state: &mut State, index: i32) -> Result<Self, BindError> {
        let table = table_at::<Self>(state, index)?;
        Ok(string_pairs(state, &table)?.into_iter().collect())
    }
}

impl<T: ToStack, S> ToStack for HashMap<String, T, S> {
    fn to_stack(self, state: &mut State) -> Result<(), BindError> {
        let len = self.len();
        push_string_map(state, len, self)
    }
}

impl<T: FromStack> FromStack for BTreeMap<String, T> {
    fn type_name() -> &'static str {
        "table"
    }

    fn check(state: &State, index: i32) -> bool {
        state.value_type(index) == ValueType::Table
    }

    fn from_stack(state: &mut State, index: i32) -> Result<Self, BindError> {
        let table = table_at::<Self>(state, index)?;
        Ok(string_pairs(state, &table)?.into_iter().collect())
    }
}

impl<T: ToStack> ToStack for BTreeMap<String, T> {
    fn to_stack(self, state: &mut State) -> Result<(), BindError> {
        let len = self.len();
        push_string_map(state, len, self)
    }
}
