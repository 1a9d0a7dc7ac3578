//! Native function storage and closures.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::RuntimeError;
use crate::state::State;
use crate::value::Value;

/// Trait for callable native functions.
///
/// A native function reads its arguments from the current frame of the
/// state, pushes its results, and returns how many of the topmost stack
/// values are results.
pub trait NativeCallable {
    fn call(&self, state: &mut State) -> Result<i32, RuntimeError>;
}

impl<F> NativeCallable for F
where
    F: Fn(&mut State) -> Result<i32, RuntimeError>,
{
    fn call(&self, state: &mut State) -> Result<i32, RuntimeError> {
        (self)(state)
    }
}

/// Type-erased native function.
#[derive(Clone)]
pub struct NativeFn {
    inner: Rc<dyn NativeCallable>,
}

impl NativeFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut State) -> Result<i32, RuntimeError> + 'static,
    {
        Self { inner: Rc::new(f) }
    }

    /// Wrap an implementor that is not a closure.
    pub fn from_callable<C>(callable: C) -> Self
    where
        C: NativeCallable + 'static,
    {
        Self {
            inner: Rc::new(callable),
        }
    }

    pub fn call(&self, state: &mut State) -> Result<i32, RuntimeError> {
        self.inner.call(state)
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFn").finish_non_exhaustive()
    }
}

// ============================================================================
// Closures
// ============================================================================

/// A native function plus its upvalues.
pub struct Closure {
    native: NativeFn,
    upvalues: RefCell<Vec<Value>>,
}

/// Shared handle to a closure. Equality is identity.
#[derive(Clone)]
pub struct FunctionRef(Rc<Closure>);

impl FunctionRef {
    pub fn new(native: NativeFn, upvalues: Vec<Value>) -> Self {
        FunctionRef(Rc::new(Closure {
            native,
            upvalues: RefCell::new(upvalues),
        }))
    }

    pub fn native(&self) -> NativeFn {
        self.0.native.clone()
    }

    pub fn upvalue_count(&self) -> usize {
        self.0.upvalues.borrow().len()
    }

    /// Zero-based upvalue read.
    pub fn upvalue(&self, index: usize) -> Option<Value> {
        self.0.upvalues.borrow().get(index).cloned()
    }

    /// Zero-based upvalue write. Returns false if there is no such upvalue.
    pub fn set_upvalue(&self, index: usize, value: Value) -> bool {
        match self.0.upvalues.borrow_mut().get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub(crate) fn upvalues(&self) -> Vec<Value> {
        self.0.upvalues.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &FunctionRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }
}

impl fmt::Debug for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRef")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("upvalues", &self.upvalue_count())
            .finish()
    }
}
