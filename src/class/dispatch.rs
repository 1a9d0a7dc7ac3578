//! Metamethods shared by every class.
//!
//! `__index` and `__newindex` are closures over the class member tables so
//! the collector can see everything a class references.

use std::panic::{self, AssertUnwindSafe};

use hostbind_core::{FunctionRef, MULTRET, NativeFn, RuntimeError, State, Value, upvalue_index};

use super::{ClassRecord, HostCell};
use crate::error::BindError;

/// Fill in the metatable of a freshly opened class.
pub(super) fn populate(record: &ClassRecord) {
    let metatable = record.metatable();
    metatable.raw_set_str("__name", Value::from(record.name()));
    metatable.raw_set_str(
        "__index",
        closure(
            index_event,
            vec![
                Value::Table(record.getters().clone()),
                Value::Table(record.methods().clone()),
            ],
        ),
    );
    metatable.raw_set_str(
        "__newindex",
        closure(
            newindex_event,
            vec![Value::Table(record.setters().clone()), Value::from(record.name())],
        ),
    );
    let finalizer = closure(finalize_event, Vec::new());
    metatable.raw_set_str("__gc", finalizer.clone());
    metatable.raw_set_str("__close", finalizer);
}

/// A `__call` handler that forwards `Class(...)` to `constructor(...)`.
pub(super) fn constructor_forwarder(constructor: Value) -> Value {
    closure(call_event, vec![constructor])
}

fn closure(f: fn(&mut State) -> Result<i32, RuntimeError>, upvalues: Vec<Value>) -> Value {
    Value::Function(FunctionRef::new(NativeFn::new(f), upvalues))
}

/// `object[key]`: getter, then method, else nil.
fn index_event(state: &mut State) -> Result<i32, RuntimeError> {
    let key = state.value(2);
    if let Value::Table(getters) = state.value(upvalue_index(1))
        && let getter @ Value::Function(_) = getters.raw_get(&key)
    {
        let this = state.value(1);
        let result = state
            .call_value(&getter, &[this], 1)?
            .into_iter()
            .next()
            .unwrap_or_default();
        state.push(result);
        return Ok(1);
    }
    let method = match state.value(upvalue_index(2)) {
        Value::Table(methods) => methods.raw_get(&key),
        _ => Value::Nil,
    };
    state.push(method);
    Ok(1)
}

/// `object[key] = value`: setter, else an error naming the field.
fn newindex_event(state: &mut State) -> Result<i32, RuntimeError> {
    let key = state.value(2);
    if let Value::Table(setters) = state.value(upvalue_index(1))
        && let setter @ Value::Function(_) = setters.raw_get(&key)
    {
        let args = [state.value(1), state.value(3)];
        state.call_value(&setter, &args, 0)?;
        return Ok(0);
    }
    let class = state
        .value(upvalue_index(2))
        .as_str()
        .unwrap_or("object")
        .to_string();
    let name = state.display(&key)?;
    Err(BindError::MissingField { name, class }.into_runtime())
}

/// `__gc` and `__close`: destroy once, never raise.
fn finalize_event(state: &mut State) -> Result<i32, RuntimeError> {
    let Some((handle, payload)) = state.userdata(1) else {
        return Ok(0);
    };
    let Ok(cell) = payload.downcast::<HostCell>() else {
        return Ok(0);
    };
    match panic::catch_unwind(AssertUnwindSafe(|| cell.destroy())) {
        Ok(Ok(true)) => {
            tracing::debug!(class = cell.class_name(), slot = handle.index, "host object finalized");
        }
        Ok(Ok(false)) => {}
        Ok(Err(err)) => {
            tracing::warn!(class = cell.class_name(), error = %err, "host object not finalized");
        }
        Err(_) => {
            tracing::warn!(class = cell.class_name(), "host object destructor panicked");
        }
    }
    Ok(0)
}

/// Drop the class table argument and call the constructor upvalue.
fn call_event(state: &mut State) -> Result<i32, RuntimeError> {
    state.remove(1);
    let constructor = state.value(upvalue_index(1));
    state.push(constructor);
    state.insert(1)?;
    let nargs = state.top() - 1;
    state.call(nargs, MULTRET)?;
    Ok(state.top())
}
