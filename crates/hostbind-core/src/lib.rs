//! Core runtime model for hostbind.
//!
//! This crate provides the embedded stack-based runtime that the binding
//! layer talks to:
//!
//! - [`State`] - value stack, call frames, globals, registry, metamethods
//! - [`Value`] - dynamically typed runtime values
//! - [`TableRef`] / [`Table`] - array + hash tables with metatables
//! - [`FunctionRef`] / [`NativeFn`] - native closures with upvalues
//! - [`ObjectHeap`] - generational storage for full userdata
//! - [`RegistryRef`] - integer slots pinning values for host code
//! - [`TypeHash`] - deterministic identity for exposed classes
//! - [`RuntimeError`] / [`Status`] - runtime failures
//!
//! # Example
//!
//! ```
//! use hostbind_core::{NativeFn, State, Value};
//!
//! let mut state = State::new();
//! state.push_function(NativeFn::new(|state| {
//!     let a = state.value(1).as_int().unwrap_or(0);
//!     let b = state.value(2).as_int().unwrap_or(0);
//!     state.push_int(a + b);
//!     Ok(1)
//! }));
//! state.push_int(2);
//! state.push_int(3);
//! state.call(2, 1).unwrap();
//! assert_eq!(state.value(-1), Value::Int(5));
//! ```

mod config;
mod error;
mod function;
mod gc;
mod heap;
mod registry;
mod state;
mod table;
mod type_hash;
mod value;

pub use config::StateConfig;
pub use error::{RuntimeError, Status};
pub use function::{FunctionRef, NativeCallable, NativeFn};
pub use heap::{ObjectHeap, UserdataHandle};
pub use registry::{NIL_REF, NO_REF, RegistryRef};
pub use state::{CompareOp, MULTRET, REGISTRY_INDEX, State, upvalue_index};
pub use table::{Table, TableRef};
pub use type_hash::TypeHash;
pub use value::{LightRef, TableKey, Value, ValueType, float_to_int, format_float};
