//! Host object storage and typed handles.

use std::any::Any;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use hostbind_core::{State, TypeHash, UserdataHandle, Value};

use super::{CastEntry, ClassRegistry, HostType};
use crate::convert::{FromStack, ToStack};
use crate::error::BindError;

// ============================================================================
// HostCell
// ============================================================================

/// The payload of a userdata slot that holds a host object.
///
/// A cell goes from constructed to destroyed exactly once. Destroying it
/// drops the Rust value; the userdata slot itself stays until the collector
/// frees it.
pub struct HostCell {
    class: TypeHash,
    name: Rc<str>,
    destroyed: Cell<bool>,
    payload: RefCell<Option<Box<dyn Any>>>,
}

impl HostCell {
    pub(crate) fn new<T: Any>(class: TypeHash, name: Rc<str>, value: T) -> Self {
        Self {
            class,
            name,
            destroyed: Cell::new(false),
            payload: RefCell::new(Some(Box::new(value))),
        }
    }

    pub fn class(&self) -> TypeHash {
        self.class
    }

    pub fn class_name(&self) -> &str {
        &self.name
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    /// Drop the payload. Returns `false` if the cell was already destroyed.
    pub fn destroy(&self) -> Result<bool, BindError> {
        if self.destroyed.get() {
            return Ok(false);
        }
        let payload = self
            .payload
            .try_borrow_mut()
            .map_err(|_| BindError::AlreadyBorrowed {
                class: self.name.to_string(),
            })?
            .take();
        self.destroyed.set(true);
        drop(payload);
        Ok(true)
    }

    fn destroyed_error(&self) -> BindError {
        BindError::DestroyedHandleAccess {
            class: self.name.to_string(),
        }
    }

    fn borrowed_error(&self) -> BindError {
        BindError::AlreadyBorrowed {
            class: self.name.to_string(),
        }
    }
}

impl fmt::Debug for HostCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostCell")
            .field("class", &self.name)
            .field("destroyed", &self.destroyed.get())
            .finish()
    }
}

// ============================================================================
// Construction and validation
// ============================================================================

/// Move `value` into a new userdata tagged with its class and push it.
pub fn push_host<T: HostType>(state: &mut State, value: T) -> Result<UserdataHandle, BindError> {
    let record = ClassRegistry::lookup::<T>(state)?;
    let cell = Rc::new(HostCell::new(record.hash(), record.name_rc(), value));
    let handle = state.new_userdata(cell);
    state.push(Value::Table(record.metatable().clone()));
    state.set_metatable(-2)?;
    tracing::trace!(class = %record.name(), slot = handle.index, "host object constructed");
    Ok(handle)
}

/// Describe a value for handle type errors.
fn describe(state: &State, value: &Value) -> String {
    if let Value::Userdata(handle) = value
        && let Some(cell) = state.heap().downcast::<HostCell>(*handle)
    {
        return cell.class_name().to_string();
    }
    value.type_name().to_string()
}

/// Check that the value at `index` is a live host object usable as a `T`.
pub fn validate<T: HostType>(state: &State, index: i32) -> Result<Host<T>, BindError> {
    let record = ClassRegistry::lookup::<T>(state)?;
    let value = state.value(index);
    let wrong = || BindError::WrongHandleType {
        expected: record.name().to_string(),
        actual: describe(state, &value),
    };
    let &Value::Userdata(handle) = &value else {
        return Err(wrong());
    };
    let cell = state.heap().downcast::<HostCell>(handle).ok_or_else(wrong)?;
    let metatable = state.heap().metatable(handle).ok_or_else(wrong)?;
    if cell.is_destroyed() {
        return Err(cell.destroyed_error());
    }
    if metatable.ptr_eq(record.metatable()) {
        return Ok(Host::new(handle, cell, None));
    }
    match record.cast_from(cell.class()) {
        Some(entry) => Ok(Host::new(handle, cell, Some(entry))),
        None => Err(wrong()),
    }
}

/// Destroy the host object at `index`, whatever its class.
///
/// Returns `false` when it was already destroyed.
pub fn destroy(state: &State, index: i32) -> Result<bool, BindError> {
    match state.userdata(index) {
        Some((_, payload)) => match payload.downcast::<HostCell>() {
            Ok(cell) => cell.destroy(),
            Err(_) => Err(BindError::WrongHandleType {
                expected: "host object".to_string(),
                actual: "userdata".to_string(),
            }),
        },
        None => Err(BindError::WrongHandleType {
            expected: "host object".to_string(),
            actual: state.value_type(index).name().to_string(),
        }),
    }
}

// ============================================================================
// Host<T>
// ============================================================================

/// A validated handle to a host object seen as a `T`.
///
/// The handle does not keep the object alive across collections; keep it in
/// a [`Reference`](crate::Reference) for that.
pub struct Host<T> {
    handle: UserdataHandle,
    cell: Rc<HostCell>,
    cast: Option<CastEntry>,
    _marker: PhantomData<T>,
}

impl<T> Clone for Host<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle,
            cell: Rc::clone(&self.cell),
            cast: self.cast,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Host<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("handle", &self.handle)
            .field("cell", &self.cell)
            .finish()
    }
}

impl<T: HostType> Host<T> {
    fn new(handle: UserdataHandle, cell: Rc<HostCell>, cast: Option<CastEntry>) -> Self {
        Self {
            handle,
            cell,
            cast,
            _marker: PhantomData,
        }
    }

    fn cast_error(&self) -> BindError {
        BindError::WrongHandleType {
            expected: T::NAME.to_string(),
            actual: self.cell.class_name().to_string(),
        }
    }

    pub fn handle(&self) -> UserdataHandle {
        self.handle
    }

    pub fn class_name(&self) -> &str {
        self.cell.class_name()
    }

    pub fn is_destroyed(&self) -> bool {
        self.cell.is_destroyed()
    }

    /// Destroy the object. A second call is a no-op returning `false`.
    pub fn destroy(&self) -> Result<bool, BindError> {
        self.cell.destroy()
    }

    pub fn borrow(&self) -> Result<Ref<'_, T>, BindError> {
        if self.cell.is_destroyed() {
            return Err(self.cell.destroyed_error());
        }
        let payload = self
            .cell
            .payload
            .try_borrow()
            .map_err(|_| self.cell.borrowed_error())?;
        let cast = self.cast;
        Ref::filter_map(payload, |slot| {
            let value = slot.as_deref()?;
            match cast {
                Some(entry) => (entry.cast_ref)(value)?.downcast_ref::<T>(),
                None => value.downcast_ref::<T>(),
            }
        })
        .map_err(|_| self.cast_error())
    }

    pub fn borrow_mut(&self) -> Result<RefMut<'_, T>, BindError> {
        if self.cell.is_destroyed() {
            return Err(self.cell.destroyed_error());
        }
        let payload = self
            .cell
            .payload
            .try_borrow_mut()
            .map_err(|_| self.cell.borrowed_error())?;
        let cast = self.cast;
        RefMut::filter_map(payload, |slot| {
            let value = slot.as_deref_mut()?;
            match cast {
                Some(entry) => (entry.cast_mut)(value)?.downcast_mut::<T>(),
                None => value.downcast_mut::<T>(),
            }
        })
        .map_err(|_| self.cast_error())
    }
}

impl<T: HostType> FromStack for Host<T> {
    fn type_name() -> &'static str {
        T::NAME
    }

    fn check(state: &State, index: i32) -> bool {
        validate::<T>(state, index).is_ok()
    }

    fn from_stack(state: &mut State, index: i32) -> Result<Self, BindError> {
        validate::<T>(state, index)
    }

    fn mismatch(state: &State, index: i32) -> BindError {
        match validate::<T>(state, index) {
            Err(err) => err,
            Ok(_) => BindError::argument_type(T::NAME, state.value_type(index).name(), index),
        }
    }
}

impl<T> ToStack for Host<T> {
    fn to_stack(self, state: &mut State) -> Result<(), BindError> {
        state.push(Value::Userdata(self.handle));
        Ok(())
    }
}

pub(crate) fn unregistered<T: HostType>() -> BindError {
    BindError::UnregisteredClass(T::NAME.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::CastTo;

    struct Wheel {
        spokes: u32,
    }

    impl HostType for Wheel {
        const NAME: &'static str = "Wheel";
    }

    #[derive(Debug)]
    struct Rim;

    impl HostType for Rim {
        const NAME: &'static str = "Rim";
    }

    struct Bike {
        front: Wheel,
    }

    impl CastTo<Wheel> for Bike {
        fn cast_ref(&self) -> &Wheel {
            &self.front
        }

        fn cast_mut(&mut self) -> &mut Wheel {
            &mut self.front
        }
    }

    fn bike_host<T: HostType>(state: &mut State) -> Host<T> {
        let bike = Bike {
            front: Wheel { spokes: 32 },
        };
        let cell = Rc::new(HostCell::new(TypeHash::from_name("Bike"), Rc::from("Bike"), bike));
        let handle = state.new_userdata(cell.clone());
        Host::new(handle, cell, Some(CastEntry::of::<Bike, Wheel>()))
    }

    #[test]
    fn cast_borrow_reaches_the_target() {
        let mut state = State::new();
        let wheel = bike_host::<Wheel>(&mut state);
        assert_eq!(wheel.borrow().unwrap().spokes, 32);
        wheel.borrow_mut().unwrap().spokes = 36;
        assert_eq!(wheel.borrow().unwrap().spokes, 36);
    }

    #[test]
    fn mismatched_cast_is_a_handle_type_error() {
        let mut state = State::new();
        let rim = bike_host::<Rim>(&mut state);
        let err = rim.borrow().unwrap_err();
        assert_eq!(err.to_string(), "wrong handle type: Rim expected, got Bike");
        assert!(matches!(rim.borrow_mut(), Err(BindError::WrongHandleType { .. })));
    }

    #[test]
    fn destroyed_cells_refuse_access() {
        let mut state = State::new();
        let wheel = bike_host::<Wheel>(&mut state);
        assert!(wheel.destroy().unwrap());
        assert!(!wheel.destroy().unwrap());
        assert!(matches!(wheel.borrow(), Err(BindError::DestroyedHandleAccess { .. })));
    }
}
