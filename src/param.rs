//! The argument descriptor pipeline.
//!
//! Each parameter type of an exposed callable implements [`Param`]. Its
//! [`ParamKind`] says where the value comes from (a call frame slot, a
//! closure slot, or nowhere) and whether it can fall back when the caller
//! leaves it out. At registration the kinds are folded into a
//! [`CallSignature`]; at call time a [`Cursor`] threads the frame and
//! upvalue positions through the parameters in order.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use bitflags::bitflags;
use hostbind_core::{State, upvalue_index};
use rustc_hash::FxHashMap;

use crate::convert::{FromStack, ReturnShape, ToStack};
use crate::error::BindError;

// ============================================================================
// Parameter Kinds
// ============================================================================

bitflags! {
    /// What a parameter consumes and how it behaves.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ParamFlags: u8 {
        /// Reads one call frame slot.
        const FRAME = 1 << 0;
        /// Reads one closure slot.
        const UPVALUE = 1 << 1;
        /// Recovers locally when the argument is absent or invalid.
        const FALLBACK = 1 << 2;
        /// Written back to its closure slot after the call.
        const COMMIT = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Plain,
    Optional,
    Defaulted,
    Upvalue,
    /// An upvalue holding a shared pointer; never written back.
    UpvalueAlias,
    /// The runtime state itself.
    Context,
}

impl ParamKind {
    pub fn flags(self) -> ParamFlags {
        match self {
            ParamKind::Plain => ParamFlags::FRAME,
            ParamKind::Optional | ParamKind::Defaulted => ParamFlags::FRAME | ParamFlags::FALLBACK,
            ParamKind::Upvalue => ParamFlags::UPVALUE | ParamFlags::COMMIT,
            ParamKind::UpvalueAlias => ParamFlags::UPVALUE,
            ParamKind::Context => ParamFlags::empty(),
        }
    }
}

/// Checks that a stack slot holds a valid value for a parameter.
pub type SlotCheck = fn(&State, i32) -> bool;

/// One entry of a [`CallSignature`].
#[derive(Debug, Clone)]
pub struct ParamDescriptor {
    pub kind: ParamKind,
    pub type_name: &'static str,
    /// Type a registration fallback must have, for optional parameters.
    pub fallback: Option<TypeId>,
    /// Check run on the initial upvalue, for closure-bound parameters.
    pub upvalue: Option<SlotCheck>,
}

impl ParamDescriptor {
    pub fn new(kind: ParamKind, type_name: &'static str) -> Self {
        Self {
            kind,
            type_name,
            fallback: None,
            upvalue: None,
        }
    }

    pub fn context() -> Self {
        Self::new(ParamKind::Context, "state")
    }

    fn consumes_frame(&self) -> bool {
        self.kind.flags().contains(ParamFlags::FRAME)
    }
}

/// The accepted argument counts of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgRange {
    pub min: usize,
    pub max: usize,
}

impl ArgRange {
    pub fn contains(self, argc: usize) -> bool {
        (self.min..=self.max).contains(&argc)
    }
}

/// The flattened parameter list and return shape of an exposed callable.
#[derive(Debug, Clone)]
pub struct CallSignature {
    pub params: Vec<ParamDescriptor>,
    pub ret: ReturnShape,
    /// Methods take their receiver from frame slot 1.
    pub receiver: bool,
}

impl CallSignature {
    pub fn new(params: Vec<ParamDescriptor>, ret: ReturnShape) -> Self {
        Self {
            params,
            ret,
            receiver: false,
        }
    }

    pub fn method(params: Vec<ParamDescriptor>, ret: ReturnShape) -> Self {
        Self {
            params,
            ret,
            receiver: true,
        }
    }

    /// Accepted argument counts, the receiver included.
    ///
    /// The minimum counts the leading frame parameters up to the first one
    /// that can fall back or reads no frame slot (an upvalue or the state).
    /// Plain parameters after that point only raise the maximum; if omitted
    /// they fail their own type check.
    pub fn arg_range(&self) -> ArgRange {
        let offset = usize::from(self.receiver);
        let max = self.params.iter().filter(|p| p.consumes_frame()).count();
        let min = self
            .params
            .iter()
            .take_while(|p| p.kind.flags() == ParamFlags::FRAME)
            .count();
        ArgRange {
            min: min + offset,
            max: max + offset,
        }
    }

    pub fn upvalue_count(&self) -> usize {
        self.upvalues().count()
    }

    /// Closure-bound parameters in upvalue order.
    pub fn upvalues(&self) -> impl Iterator<Item = &ParamDescriptor> {
        self.params
            .iter()
            .filter(|p| p.kind.flags().contains(ParamFlags::UPVALUE))
    }

    /// Argument positions (1-based, receiver excluded) that need a
    /// registration fallback, with the type it must have.
    pub fn fallback_slots(&self) -> Vec<(usize, TypeId)> {
        let mut position = 0;
        let mut slots = Vec::new();
        for param in &self.params {
            if !param.consumes_frame() {
                continue;
            }
            position += 1;
            if let Some(type_id) = param.fallback {
                slots.push((position, type_id));
            }
        }
        slots
    }
}

// ============================================================================
// Fallbacks and Defaults
// ============================================================================

/// Per-position fallback values supplied at registration.
#[derive(Default)]
pub struct Fallbacks {
    values: FxHashMap<usize, (TypeId, Rc<dyn Any>)>,
}

impl Fallbacks {
    pub fn insert<T: Any>(&mut self, position: usize, value: T) {
        let value: Rc<dyn Any> = Rc::new(value);
        self.values.insert(position, (TypeId::of::<T>(), value));
    }

    pub fn type_at(&self, position: usize) -> Option<TypeId> {
        self.values.get(&position).map(|(type_id, _)| *type_id)
    }

    pub fn get<T: Any + Clone>(&self, position: usize) -> Option<T> {
        self.values
            .get(&position)
            .and_then(|(_, value)| value.downcast_ref::<T>())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Session-wide per-type defaults for [`Defaulted`] parameters.
#[derive(Default)]
struct DefaultValues(FxHashMap<TypeId, Rc<dyn Any>>);

/// Set the value [`Defaulted<T>`] parameters use when their argument is
/// missing. Replaces any earlier default for `T`.
pub fn set_default<T: Any + Clone>(state: &mut State, value: T) {
    if state.app_data::<DefaultValues>().is_none() {
        state.set_app_data(DefaultValues::default());
    }
    if let Some(defaults) = state.app_data_mut::<DefaultValues>() {
        defaults.0.insert(TypeId::of::<T>(), Rc::new(value));
    }
}

fn default_for<T: Any + Clone + Default>(state: &State) -> T {
    state
        .app_data::<DefaultValues>()
        .and_then(|defaults| defaults.0.get(&TypeId::of::<T>()))
        .and_then(|value| value.downcast_ref::<T>())
        .cloned()
        .unwrap_or_default()
}

// ============================================================================
// Cursor
// ============================================================================

type Commit = Box<dyn FnOnce(&mut State) -> Result<(), BindError>>;

/// Call-local extraction state.
pub struct Cursor {
    frame: i32,
    first: i32,
    upvalue: i32,
    fallbacks: Rc<Fallbacks>,
    commits: Vec<Commit>,
}

impl Cursor {
    /// Start reading arguments at frame slot `first`.
    pub fn new(first: i32, fallbacks: Rc<Fallbacks>) -> Self {
        Self {
            frame: first,
            first,
            upvalue: 1,
            fallbacks,
            commits: Vec::new(),
        }
    }

    /// Argument position of the next frame slot, the receiver excluded.
    pub fn position(&self) -> usize {
        (self.frame - self.first + 1) as usize
    }

    pub fn next_frame(&mut self) -> i32 {
        let index = self.frame;
        self.frame += 1;
        index
    }

    /// Ordinal of the next closure slot, starting at 1.
    pub fn upvalue_position(&self) -> usize {
        self.upvalue as usize
    }

    /// Pseudo-index of the next closure slot.
    pub fn next_upvalue(&mut self) -> i32 {
        let index = upvalue_index(self.upvalue);
        self.upvalue += 1;
        index
    }

    pub fn fallback<T: Any + Clone>(&self, position: usize) -> Result<T, BindError> {
        self.fallbacks
            .get(position)
            .ok_or(BindError::MissingFallback { position })
    }

    /// Queue work to run after the callable returns.
    pub fn defer_commit(&mut self, commit: impl FnOnce(&mut State) -> Result<(), BindError> + 'static) {
        self.commits.push(Box::new(commit));
    }

    /// Run every queued commit in parameter order.
    pub fn commit(&mut self, state: &mut State) -> Result<(), BindError> {
        for commit in self.commits.drain(..) {
            commit(state)?;
        }
        Ok(())
    }
}

// ============================================================================
// Param
// ============================================================================

/// A type that can appear as a parameter of an exposed callable.
pub trait Param: Sized {
    const KIND: ParamKind;

    fn describe() -> ParamDescriptor;

    fn extract(state: &mut State, cursor: &mut Cursor) -> Result<Self, BindError>;
}

impl<T: FromStack> Param for T {
    const KIND: ParamKind = ParamKind::Plain;

    fn describe() -> ParamDescriptor {
        ParamDescriptor::new(Self::KIND, T::type_name())
    }

    fn extract(state: &mut State, cursor: &mut Cursor) -> Result<Self, BindError> {
        let index = cursor.next_frame();
        if !T::check(state, index) {
            return Err(T::mismatch(state, index));
        }
        T::from_stack(state, index)
    }
}

/// Read the argument if it is present and valid.
fn try_frame<T: FromStack>(state: &mut State, index: i32) -> Option<T> {
    if state.is_none(index) || !T::check(state, index) {
        return None;
    }
    T::from_stack(state, index).ok()
}

/// An argument that falls back to the value registered for its position
/// with [`HostFunction::fallback`](crate::HostFunction::fallback).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Optional<T>(pub T);

impl<T> Optional<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Optional<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: FromStack + Clone + 'static> Param for Optional<T> {
    const KIND: ParamKind = ParamKind::Optional;

    fn describe() -> ParamDescriptor {
        ParamDescriptor {
            fallback: Some(TypeId::of::<T>()),
            ..ParamDescriptor::new(Self::KIND, T::type_name())
        }
    }

    fn extract(state: &mut State, cursor: &mut Cursor) -> Result<Self, BindError> {
        let position = cursor.position();
        let index = cursor.next_frame();
        match try_frame(state, index) {
            Some(value) => Ok(Optional(value)),
            None => cursor.fallback(position).map(Optional),
        }
    }
}

/// An argument that falls back to the session default for `T`, or
/// `T::default()` when none was set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Defaulted<T>(pub T);

impl<T> Defaulted<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Defaulted<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: FromStack + Default + Clone + 'static> Param for Defaulted<T> {
    const KIND: ParamKind = ParamKind::Defaulted;

    fn describe() -> ParamDescriptor {
        ParamDescriptor::new(Self::KIND, T::type_name())
    }

    fn extract(state: &mut State, cursor: &mut Cursor) -> Result<Self, BindError> {
        let index = cursor.next_frame();
        let value = match try_frame(state, index) {
            Some(value) => value,
            None => default_for(state),
        };
        Ok(Defaulted(value))
    }
}

// ============================================================================
// Closure-bound parameters
// ============================================================================

/// Name closure slots by their ordinal rather than their pseudo-index.
pub(crate) fn upvalue_mismatch<T: FromStack>(state: &State, index: i32, position: usize) -> BindError {
    match T::mismatch(state, index) {
        BindError::ArgumentTypeMismatch { expected, actual, .. } => BindError::UpvalueTypeMismatch {
            expected,
            actual,
            position,
        },
        other => other,
    }
}

/// State kept in a closure slot across calls.
///
/// Mutations made through `DerefMut` are written back to the slot once the
/// callable returns.
pub struct Upvalue<T: Clone> {
    value: T,
    mailbox: Rc<RefCell<Option<T>>>,
}

impl<T: Clone> Upvalue<T> {
    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn set(&mut self, value: T) {
        self.value = value;
    }
}

impl<T: Clone> Deref for Upvalue<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Clone> DerefMut for Upvalue<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Clone> Drop for Upvalue<T> {
    fn drop(&mut self) {
        *self.mailbox.borrow_mut() = Some(self.value.clone());
    }
}

impl<T: FromStack + ToStack + Clone + 'static> Param for Upvalue<T> {
    const KIND: ParamKind = ParamKind::Upvalue;

    fn describe() -> ParamDescriptor {
        ParamDescriptor {
            upvalue: Some(T::check),
            ..ParamDescriptor::new(Self::KIND, T::type_name())
        }
    }

    fn extract(state: &mut State, cursor: &mut Cursor) -> Result<Self, BindError> {
        let position = cursor.upvalue_position();
        let index = cursor.next_upvalue();
        if !T::check(state, index) {
            return Err(upvalue_mismatch::<T>(state, index, position));
        }
        let value = T::from_stack(state, index)?;
        let mailbox: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
        let outbox = Rc::clone(&mailbox);
        cursor.defer_commit(move |state| {
            let Some(value) = outbox.borrow_mut().take() else {
                return Ok(());
            };
            value.to_stack(state)?;
            state.replace(index)?;
            Ok(())
        });
        Ok(Upvalue { value, mailbox })
    }
}

/// A closure slot holding a shared host value.
///
/// The pointee can be mutated; the slot itself always keeps pointing at the
/// same value.
#[derive(Debug)]
pub struct UpvalueRef<T>(Rc<RefCell<T>>);

impl<T> UpvalueRef<T> {
    pub fn into_inner(self) -> Rc<RefCell<T>> {
        self.0
    }
}

impl<T> Deref for UpvalueRef<T> {
    type Target = RefCell<T>;

    fn deref(&self) -> &RefCell<T> {
        &self.0
    }
}

impl<T: 'static> Param for UpvalueRef<T> {
    const KIND: ParamKind = ParamKind::UpvalueAlias;

    fn describe() -> ParamDescriptor {
        ParamDescriptor {
            upvalue: Some(<Rc<RefCell<T>>>::check),
            ..ParamDescriptor::new(Self::KIND, <Rc<RefCell<T>>>::type_name())
        }
    }

    fn extract(state: &mut State, cursor: &mut Cursor) -> Result<Self, BindError> {
        let position = cursor.upvalue_position();
        let index = cursor.next_upvalue();
        if !<Rc<RefCell<T>>>::check(state, index) {
            return Err(upvalue_mismatch::<Rc<RefCell<T>>>(state, index, position));
        }
        <Rc<RefCell<T>>>::from_stack(state, index).map(UpvalueRef)
    }
}

// ============================================================================
// Parameter Lists
// ============================================================================

/// A tuple of parameters, extracted left to right.
pub trait ParamList: Sized {
    fn descriptors() -> Vec<ParamDescriptor>;

    fn extract_all(state: &mut State, cursor: &mut Cursor) -> Result<Self, BindError>;
}

macro_rules! impl_param_list {
    ($($name:ident),*) => {
        impl<$($name: Param),*> ParamList for ($($name,)*) {
            fn descriptors() -> Vec<ParamDescriptor> {
                vec![$($name::describe()),*]
            }

            #[allow(unused_variables)]
            fn extract_all(state: &mut State, cursor: &mut Cursor) -> Result<Self, BindError> {
                Ok(($($name::extract(state, cursor)?,)*))
            }
        }
    };
}

impl_param_list!();
impl_param_list!(A);
impl_param_list!(A, B);
impl_param_list!(A, B, C);
impl_param_list!(A, B, C, D);
impl_param_list!(A, B, C, D, E);
impl_param_list!(A, B, C, D, E, F);
impl_param_list!(A, B, C, D, E, F, G);
impl_param_list!(A, B, C, D, E, F, G, H);

#[cfg(test)]
mod tests {
    use super::*;

    fn signature<P: ParamList>() -> CallSignature {
        CallSignature::new(P::descriptors(), ReturnShape::Void)
    }

    #[test]
    fn kind_flags() {
        assert!(ParamKind::Plain.flags().contains(ParamFlags::FRAME));
        assert!(ParamKind::Optional.flags().contains(ParamFlags::FALLBACK));
        assert!(ParamKind::Upvalue.flags().contains(ParamFlags::COMMIT));
        assert!(!ParamKind::UpvalueAlias.flags().contains(ParamFlags::COMMIT));
        assert!(ParamKind::Context.flags().is_empty());
    }

    #[test]
    fn plain_range_is_exact() {
        let range = signature::<(i32, i32)>().arg_range();
        assert_eq!(range, ArgRange { min: 2, max: 2 });
    }

    #[test]
    fn range_stops_at_first_fallback() {
        let range = signature::<(i32, Optional<String>, i32)>().arg_range();
        assert_eq!(range, ArgRange { min: 1, max: 3 });
        assert!(!range.contains(0));
        assert!(range.contains(2));
        assert!(!range.contains(4));
    }

    #[test]
    fn upvalues_consume_no_frame_slot() {
        let sig = signature::<(i32, Upvalue<i64>, i32, UpvalueRef<i32>, Defaulted<i32>)>();
        assert_eq!(sig.arg_range(), ArgRange { min: 1, max: 3 });
        assert_eq!(sig.upvalue_count(), 2);
    }

    #[test]
    fn leading_upvalue_ends_required_prefix() {
        let sig = signature::<(Upvalue<i64>, i32)>();
        assert_eq!(sig.arg_range(), ArgRange { min: 0, max: 1 });
    }

    #[test]
    fn leading_context_ends_required_prefix() {
        let mut params = vec![ParamDescriptor::context()];
        params.extend(<(i32, i32)>::descriptors());
        let sig = CallSignature::new(params, ReturnShape::Void);
        assert_eq!(sig.arg_range(), ArgRange { min: 0, max: 2 });
    }

    #[test]
    fn receiver_counts_toward_range() {
        let sig = CallSignature::method(<(i32,)>::descriptors(), ReturnShape::Single);
        assert_eq!(sig.arg_range(), ArgRange { min: 2, max: 2 });
    }

    #[test]
    fn fallback_slots_skip_upvalues() {
        let sig = signature::<(Upvalue<i64>, i32, Optional<String>)>();
        assert_eq!(sig.fallback_slots(), vec![(2, TypeId::of::<String>())]);
    }

    #[test]
    fn plain_extract_reports_position() {
        let mut state = State::new();
        state.push_int(1);
        state.push_str("x");
        let mut cursor = Cursor::new(1, Rc::default());
        let err = <(i32, i32)>::extract_all(&mut state, &mut cursor).unwrap_err();
        assert_eq!(err.to_string(), "bad argument #2: integer expected, got string");
    }

    #[test]
    fn optional_uses_fallback_when_absent_or_invalid() {
        let mut fallbacks = Fallbacks::default();
        fallbacks.insert(2, String::from("world"));
        let fallbacks = Rc::new(fallbacks);

        let mut state = State::new();
        state.push_int(7);
        let mut cursor = Cursor::new(1, Rc::clone(&fallbacks));
        let (n, name) = <(i32, Optional<String>)>::extract_all(&mut state, &mut cursor).unwrap();
        assert_eq!((n, name.into_inner()), (7, "world".to_string()));

        state.push_bool(true);
        let mut cursor = Cursor::new(1, Rc::clone(&fallbacks));
        let (_, name) = <(i32, Optional<String>)>::extract_all(&mut state, &mut cursor).unwrap();
        assert_eq!(*name, "world");
    }

    #[test]
    fn optional_without_fallback_errors() {
        let mut state = State::new();
        let mut cursor = Cursor::new(1, Rc::default());
        let err = Optional::<i32>::extract(&mut state, &mut cursor).unwrap_err();
        assert!(matches!(err, BindError::MissingFallback { position: 1 }));
    }

    #[test]
    fn defaulted_prefers_session_default() {
        let mut state = State::new();
        let mut cursor = Cursor::new(1, Rc::default());
        assert_eq!(*Defaulted::<i32>::extract(&mut state, &mut cursor).unwrap(), 0);

        set_default(&mut state, 42_i32);
        let mut cursor = Cursor::new(1, Rc::default());
        assert_eq!(*Defaulted::<i32>::extract(&mut state, &mut cursor).unwrap(), 42);

        state.push_int(5);
        let mut cursor = Cursor::new(1, Rc::default());
        assert_eq!(*Defaulted::<i32>::extract(&mut state, &mut cursor).unwrap(), 5);
    }

    #[test]
    fn upvalue_mismatch_names_the_slot() {
        let mut state = State::new();
        state.push_str("x");
        let err = upvalue_mismatch::<i64>(&state, -1, 2);
        assert_eq!(err.to_string(), "bad upvalue #2: integer expected, got string");
    }

    #[test]
    fn cursor_positions() {
        let mut cursor = Cursor::new(2, Rc::default());
        assert_eq!(cursor.position(), 1);
        assert_eq!(cursor.next_frame(), 2);
        assert_eq!(cursor.position(), 2);
        assert_eq!(cursor.upvalue_position(), 1);
        assert_eq!(cursor.next_upvalue(), upvalue_index(1));
        assert_eq!(cursor.upvalue_position(), 2);
        assert_eq!(cursor.next_upvalue(), upvalue_index(2));
    }
}
