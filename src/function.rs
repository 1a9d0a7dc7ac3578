//! The call wrapper.
//!
//! A Rust callable becomes a runtime closure in three steps:
//!
//! 1. One of the `Into*` traits (implemented per arity for `Fn` types)
//!    reports the callable's [`CallSignature`] and erases it into an
//!    invoker that extracts arguments, invokes, commits upvalues and pushes
//!    results.
//! 2. [`HostFunction`] collects registration data: fallbacks for optional
//!    arguments and initial upvalues.
//! 3. [`HostFunction::push`] validates that data against the signature and
//!    pushes a closure whose native adapter checks the argument count,
//!    runs the invoker and translates every failure into a runtime error.
//!
//! # Example
//!
//! ```
//! use hostbind::{HostFunction, Optional, Session};
//!
//! let mut session = Session::new();
//! session.install(
//!     "greet",
//!     HostFunction::new(|name: Optional<String>| format!("Hello, {}", *name))
//!         .fallback(1, String::from("world")),
//! )?;
//! let greeting: String = session.call_global("greet", ())?;
//! assert_eq!(greeting, "Hello, world");
//! # Ok::<(), hostbind::BindError>(())
//! ```

use std::any::{Any, type_name};
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use hostbind_core::{NativeFn, RuntimeError, State, Value};

use crate::class::{HostType, push_host, validate};
use crate::convert::{ReturnShape, ToStack};
use crate::error::BindError;
use crate::param::{ArgRange, CallSignature, Cursor, Fallbacks, ParamDescriptor, ParamList};

// ============================================================================
// Results
// ============================================================================

/// What a callable can return.
pub trait Returns {
    const SHAPE: ReturnShape;

    /// Push the results and report how many were pushed.
    fn push_results(self, state: &mut State) -> Result<i32, BindError>;
}

impl<T: ToStack> Returns for T {
    const SHAPE: ReturnShape = T::SHAPE;

    fn push_results(self, state: &mut State) -> Result<i32, BindError> {
        self.to_stack(state)?;
        Ok(1)
    }
}

impl Returns for () {
    const SHAPE: ReturnShape = ReturnShape::Void;

    fn push_results(self, _state: &mut State) -> Result<i32, BindError> {
        Ok(0)
    }
}

/// Results the callable pushed itself, with their count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pushed(pub i32);

impl Returns for Pushed {
    const SHAPE: ReturnShape = ReturnShape::RawCount;

    fn push_results(self, _state: &mut State) -> Result<i32, BindError> {
        Ok(self.0)
    }
}

impl<R: Returns, E: Into<anyhow::Error>> Returns for Result<R, E> {
    const SHAPE: ReturnShape = R::SHAPE;

    fn push_results(self, state: &mut State) -> Result<i32, BindError> {
        match self {
            Ok(value) => value.push_results(state),
            Err(err) => Err(BindError::from_native(err.into())),
        }
    }
}

macro_rules! impl_returns_tuple {
    ($count:literal; $($name:ident),+) => {
        impl<$($name: ToStack),+> Returns for ($($name,)+) {
            const SHAPE: ReturnShape = ReturnShape::Multiple($count);

            #[allow(non_snake_case)]
            fn push_results(self, state: &mut State) -> Result<i32, BindError> {
                let ($($name,)+) = self;
                $($name.to_stack(state)?;)+
                Ok($count)
            }
        }
    };
}

impl_returns_tuple!(2; A, B);
impl_returns_tuple!(3; A, B, C);
impl_returns_tuple!(4; A, B, C, D);
impl_returns_tuple!(5; A, B, C, D, E);
impl_returns_tuple!(6; A, B, C, D, E, F);
impl_returns_tuple!(7; A, B, C, D, E, F, G);
impl_returns_tuple!(8; A, B, C, D, E, F, G, H);

/// What a constructor can return.
pub trait IntoHost<T> {
    fn into_host(self) -> Result<T, BindError>;
}

impl<T: HostType> IntoHost<T> for T {
    fn into_host(self) -> Result<T, BindError> {
        Ok(self)
    }
}

impl<T: HostType, E: Into<anyhow::Error>> IntoHost<T> for Result<T, E> {
    fn into_host(self) -> Result<T, BindError> {
        self.map_err(|err| BindError::from_native(err.into()))
    }
}

// ============================================================================
// Callable traits
// ============================================================================

pub(crate) type Invoker = Rc<dyn Fn(&mut State, &mut Cursor) -> Result<i32, BindError>>;

fn invoker<F>(f: F) -> Invoker
where
    F: Fn(&mut State, &mut Cursor) -> Result<i32, BindError> + 'static,
{
    Rc::new(f)
}

/// Push the results, then write upvalues back. An error result skips the
/// write-back.
fn finish<R: Returns>(state: &mut State, cursor: &mut Cursor, ret: R) -> Result<i32, BindError> {
    let count = ret.push_results(state)?;
    cursor.commit(state)?;
    Ok(count)
}

/// A free function or closure.
pub trait IntoHostFn<Marker>: 'static {
    fn signature() -> CallSignature;

    fn into_invoker(self) -> Invoker;
}

/// A function whose first parameter is the running `&mut State`.
pub trait IntoStateFn<Marker>: 'static {
    fn signature() -> CallSignature;

    fn into_invoker(self) -> Invoker;
}

/// A method taking its receiver by shared reference.
pub trait IntoMethod<T, Marker>: 'static {
    fn signature() -> CallSignature;

    fn into_invoker(self) -> Invoker;
}

/// A method taking its receiver by mutable reference.
pub trait IntoMethodMut<T, Marker>: 'static {
    fn signature() -> CallSignature;

    fn into_invoker(self) -> Invoker;
}

/// A function building a new host object.
pub trait IntoConstructor<T, Marker>: 'static {
    fn signature() -> CallSignature;

    fn into_invoker(self) -> Invoker;
}

macro_rules! impl_callables {
    ($($arg:ident),*) => {
        impl<Func, Ret, $($arg,)*> IntoHostFn<(Ret, $($arg,)*)> for Func
        where
            Func: Fn($($arg),*) -> Ret + 'static,
            Ret: Returns,
            $($arg: crate::param::Param,)*
        {
            fn signature() -> CallSignature {
                CallSignature::new(<($($arg,)*) as ParamList>::descriptors(), Ret::SHAPE)
            }

            #[allow(non_snake_case)]
            fn into_invoker(self) -> Invoker {
                invoker(move |state, cursor| {
                    let ($($arg,)*) = <($($arg,)*) as ParamList>::extract_all(state, cursor)?;
                    let ret = (self)($($arg),*);
                    finish(state, cursor, ret)
                })
            }
        }

        impl<Func, Ret, $($arg,)*> IntoStateFn<(Ret, $($arg,)*)> for Func
        where
            Func: Fn(&mut State, $($arg),*) -> Ret + 'static,
            Ret: Returns,
            $($arg: crate::param::Param,)*
        {
            fn signature() -> CallSignature {
                let mut params = vec![ParamDescriptor::context()];
                params.extend(<($($arg,)*) as ParamList>::descriptors());
                CallSignature::new(params, Ret::SHAPE)
            }

            #[allow(non_snake_case)]
            fn into_invoker(self) -> Invoker {
                invoker(move |state, cursor| {
                    let ($($arg,)*) = <($($arg,)*) as ParamList>::extract_all(state, cursor)?;
                    let ret = (self)(state, $($arg),*);
                    finish(state, cursor, ret)
                })
            }
        }

        impl<T, Func, Ret, $($arg,)*> IntoMethod<T, (Ret, $($arg,)*)> for Func
        where
            T: HostType,
            Func: Fn(&T, $($arg),*) -> Ret + 'static,
            Ret: Returns,
            $($arg: crate::param::Param,)*
        {
            fn signature() -> CallSignature {
                CallSignature::method(<($($arg,)*) as ParamList>::descriptors(), Ret::SHAPE)
            }

            #[allow(non_snake_case)]
            fn into_invoker(self) -> Invoker {
                invoker(move |state, cursor| {
                    let this = validate::<T>(state, 1)?;
                    let ($($arg,)*) = <($($arg,)*) as ParamList>::extract_all(state, cursor)?;
                    let ret = {
                        let receiver = this.borrow()?;
                        (self)(&receiver, $($arg),*)
                    };
                    finish(state, cursor, ret)
                })
            }
        }

        impl<T, Func, Ret, $($arg,)*> IntoMethodMut<T, (Ret, $($arg,)*)> for Func
        where
            T: HostType,
            Func: Fn(&mut T, $($arg),*) -> Ret + 'static,
            Ret: Returns,
            $($arg: crate::param::Param,)*
        {
            fn signature() -> CallSignature {
                CallSignature::method(<($($arg,)*) as ParamList>::descriptors(), Ret::SHAPE)
            }

            #[allow(non_snake_case)]
            fn into_invoker(self) -> Invoker {
                invoker(move |state, cursor| {
                    let this = validate::<T>(state, 1)?;
                    let ($($arg,)*) = <($($arg,)*) as ParamList>::extract_all(state, cursor)?;
                    let ret = {
                        let mut receiver = this.borrow_mut()?;
                        (self)(&mut receiver, $($arg),*)
                    };
                    finish(state, cursor, ret)
                })
            }
        }

        impl<T, Func, Ret, $($arg,)*> IntoConstructor<T, (Ret, $($arg,)*)> for Func
        where
            T: HostType,
            Func: Fn($($arg),*) -> Ret + 'static,
            Ret: IntoHost<T>,
            $($arg: crate::param::Param,)*
        {
            fn signature() -> CallSignature {
                CallSignature::new(<($($arg,)*) as ParamList>::descriptors(), ReturnShape::Single)
            }

            #[allow(non_snake_case)]
            fn into_invoker(self) -> Invoker {
                invoker(move |state, cursor| {
                    let ($($arg,)*) = <($($arg,)*) as ParamList>::extract_all(state, cursor)?;
                    let value = (self)($($arg),*).into_host()?;
                    cursor.commit(state)?;
                    push_host(state, value)?;
                    Ok(1)
                })
            }
        }
    };
}

impl_callables!();
impl_callables!(A);
impl_callables!(A, B);
impl_callables!(A, B, C);
impl_callables!(A, B, C, D);
impl_callables!(A, B, C, D, E);
impl_callables!(A, B, C, D, E, F);
impl_callables!(A, B, C, D, E, F, G);
impl_callables!(A, B, C, D, E, F, G, H);

/// A stateful function object.
///
/// The object is built once per closure and lives as long as the closure.
/// A call that re-enters the same object while it is running fails with
/// [`BindError::AlreadyBorrowed`].
pub trait HostCallable: 'static {
    type Args: ParamList;
    type Output: Returns;

    fn call(&mut self, args: Self::Args) -> Self::Output;
}

fn callable_invoker<C: HostCallable>(callable: C) -> Invoker {
    let cell = RefCell::new(callable);
    invoker(move |state, cursor| {
        let args = C::Args::extract_all(state, cursor)?;
        let ret = {
            let mut callable = cell.try_borrow_mut().map_err(|_| BindError::AlreadyBorrowed {
                class: type_name::<C>().to_string(),
            })?;
            callable.call(args)
        };
        finish(state, cursor, ret)
    })
}

// ============================================================================
// HostFunction
// ============================================================================

enum Source {
    Ready(Invoker),
    Deferred(Box<dyn FnOnce(&mut State) -> Invoker>),
}

type PushUpvalue = Box<dyn FnOnce(&mut State) -> Result<(), BindError>>;

/// A callable ready to be pushed as a runtime closure.
pub struct HostFunction {
    name: Rc<str>,
    signature: CallSignature,
    source: Source,
    fallbacks: Fallbacks,
    upvalues: Vec<PushUpvalue>,
}

impl HostFunction {
    fn from_parts<F>(signature: CallSignature, source: Source) -> Self {
        Self {
            name: Rc::from(type_name::<F>()),
            signature,
            source,
            fallbacks: Fallbacks::default(),
            upvalues: Vec::new(),
        }
    }

    /// Wrap a free function or closure.
    pub fn new<F, M>(f: F) -> Self
    where
        F: IntoHostFn<M>,
    {
        Self::from_parts::<F>(F::signature(), Source::Ready(f.into_invoker()))
    }

    /// Wrap a function that receives the running state first.
    pub fn with_state<F, M>(f: F) -> Self
    where
        F: IntoStateFn<M>,
    {
        Self::from_parts::<F>(F::signature(), Source::Ready(f.into_invoker()))
    }

    /// Wrap a method of host type `T` taking `&T`.
    pub fn method<T, F, M>(f: F) -> Self
    where
        F: IntoMethod<T, M>,
    {
        Self::from_parts::<F>(F::signature(), Source::Ready(f.into_invoker()))
    }

    /// Wrap a method of host type `T` taking `&mut T`.
    pub fn method_mut<T, F, M>(f: F) -> Self
    where
        F: IntoMethodMut<T, M>,
    {
        Self::from_parts::<F>(F::signature(), Source::Ready(f.into_invoker()))
    }

    /// Wrap a constructor of host type `T`.
    pub fn constructor<T, F, M>(f: F) -> Self
    where
        F: IntoConstructor<T, M>,
    {
        Self::from_parts::<F>(F::signature(), Source::Ready(f.into_invoker()))
    }

    /// Wrap a function object.
    pub fn object<C: HostCallable>(callable: C) -> Self {
        Self::from_parts::<C>(
            callable_signature::<C>(),
            Source::Ready(callable_invoker(callable)),
        )
    }

    /// Wrap a function object built from the state when the closure is
    /// pushed.
    pub fn object_with<C, I>(init: I) -> Self
    where
        C: HostCallable,
        I: FnOnce(&mut State) -> C + 'static,
    {
        let build = move |state: &mut State| callable_invoker(init(state));
        Self::from_parts::<C>(callable_signature::<C>(), Source::Deferred(Box::new(build)))
    }

    /// Name used in logs.
    pub fn named(mut self, name: impl Into<Rc<str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Supply the value an [`Optional`](crate::Optional) argument at
    /// `position` (1-based, receiver excluded) takes when it is missing.
    pub fn fallback<T: Any + Clone>(mut self, position: usize, value: T) -> Self {
        self.fallbacks.insert(position, value);
        self
    }

    /// Append an initial upvalue for the next closure-bound parameter.
    pub fn upvalue<T: ToStack + 'static>(mut self, value: T) -> Self {
        self.upvalues
            .push(Box::new(move |state: &mut State| value.to_stack(state)));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &CallSignature {
        &self.signature
    }

    fn validate(&self) -> Result<(), BindError> {
        for (position, type_id) in self.signature.fallback_slots() {
            if self.fallbacks.type_at(position) != Some(type_id) {
                return Err(BindError::MissingFallback { position });
            }
        }
        let expected = self.signature.upvalue_count();
        if self.upvalues.len() != expected {
            return Err(BindError::UpvalueCountMismatch {
                expected,
                got: self.upvalues.len(),
            });
        }
        Ok(())
    }

    /// Push the closure.
    pub fn push(self, state: &mut State) -> Result<(), BindError> {
        self.validate()?;
        let top = state.top();
        let count = self.upvalues.len();
        let slots = self.signature.upvalues().zip(self.upvalues).enumerate();
        for (i, (param, push)) in slots {
            let pushed = push(state).and_then(|()| match param.upvalue {
                Some(check) if !check(state, -1) => Err(BindError::UpvalueTypeMismatch {
                    expected: param.type_name,
                    actual: state.value_type(-1).name(),
                    position: i + 1,
                }),
                _ => Ok(()),
            });
            if let Err(err) = pushed {
                state.set_top(top);
                return Err(err);
            }
        }
        let invoker = match self.source {
            Source::Ready(invoker) => invoker,
            Source::Deferred(build) => build(state),
        };
        tracing::trace!(
            function = %self.name,
            params = self.signature.params.len(),
            upvalues = count,
            "host function registered"
        );
        let native = adapter(self.name, &self.signature, Rc::new(self.fallbacks), invoker);
        state.push_closure(native, count);
        Ok(())
    }

    /// Build the closure as a value without leaving it on the stack.
    pub fn into_value(self, state: &mut State) -> Result<Value, BindError> {
        self.push(state)?;
        Ok(state.pop())
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("fallbacks", &self.fallbacks.len())
            .field("upvalues", &self.upvalues.len())
            .finish()
    }
}

fn callable_signature<C: HostCallable>() -> CallSignature {
    CallSignature::new(C::Args::descriptors(), C::Output::SHAPE)
}

/// The uniform native entry point: the one place errors become runtime
/// errors.
fn adapter(name: Rc<str>, signature: &CallSignature, fallbacks: Rc<Fallbacks>, invoker: Invoker) -> NativeFn {
    let range = signature.arg_range();
    let first = if signature.receiver { 2 } else { 1 };
    NativeFn::new(move |state: &mut State| -> Result<i32, RuntimeError> {
        dispatch(state, &name, range, first, &fallbacks, &invoker)
    })
}

#[cfg_attr(feature = "profiling", profiling::function)]
fn dispatch(
    state: &mut State,
    name: &str,
    range: ArgRange,
    first: i32,
    fallbacks: &Rc<Fallbacks>,
    invoker: &Invoker,
) -> Result<i32, RuntimeError> {
    let argc = state.top().max(0) as usize;
    tracing::trace!(function = name, argc, "host call");
    if !range.contains(argc) {
        return Err(BindError::ArgumentCountMismatch {
            min: range.min,
            max: range.max,
            got: argc,
        }
        .into_runtime());
    }
    let mut cursor = Cursor::new(first, Rc::clone(fallbacks));
    match panic::catch_unwind(AssertUnwindSafe(|| invoker(state, &mut cursor))) {
        Ok(Ok(count)) => Ok(count),
        Ok(Err(err)) => Err(err.into_runtime()),
        Err(payload) => Err(BindError::from_panic(payload).into_runtime()),
    }
}
