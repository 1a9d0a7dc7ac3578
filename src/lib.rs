//! Static argument binding and object exposition for an embedded,
//! stack-based scripting runtime.
//!
//! Rust functions, closures, methods and constructors are exposed to the
//! runtime without hand-written glue. Parameter types decide how each
//! argument is read (see [`param`]); return types decide what is pushed
//! back (see [`function::Returns`]). Host types become classes with
//! metatable-driven property and method dispatch (see [`class`]), and
//! [`Reference`] keeps runtime values alive across native calls.
//!
//! # Example
//!
//! ```
//! use hostbind::{HostFunction, Optional, Session};
//!
//! let mut session = Session::new();
//! session.function("add", |x: i32, y: i32| x + y)?;
//! session.install(
//!     "greet",
//!     HostFunction::new(|name: Optional<String>| format!("Hello, {}", *name))
//!         .fallback(1, String::from("world")),
//! )?;
//!
//! let sum: i32 = session.call_global("add", (2, 3))?;
//! assert_eq!(sum, 5);
//! let greeting: String = session.call_global("greet", "Sam")?;
//! assert_eq!(greeting, "Hello, Sam");
//! # Ok::<(), hostbind::BindError>(())
//! ```

extern crate self as hostbind;

pub mod class;
pub mod convert;
pub mod error;
pub mod function;
pub mod multi;
pub mod param;
pub mod reference;
pub mod session;

/// The runtime model the engine binds against.
pub use hostbind_core as runtime;

pub use class::{CastTo, ClassBuilder, Host, HostType, MetaMethod};
pub use convert::{FromStack, Nil, ReturnShape, ToStack};
pub use error::{BindError, ConversionError};
pub use function::{HostCallable, HostFunction, Pushed, Returns};
pub use hostbind_core::{RuntimeError, State, StateConfig, Status, Value, ValueType};
pub use multi::{FromResults, IntoArgs};
pub use param::{CallSignature, Defaulted, Optional, ParamKind, Upvalue, UpvalueRef};
pub use reference::{Reference, StackGuard, TableEntry};
pub use session::{Namespace, Session};

#[cfg(feature = "macros")]
pub use hostbind_macros::HostType;

pub mod prelude {
    pub use crate::class::{CastTo, Host, HostType, MetaMethod};
    pub use crate::convert::{FromStack, Nil, ToStack};
    pub use crate::error::BindError;
    pub use crate::function::{HostCallable, HostFunction, Pushed};
    pub use crate::param::{Defaulted, Optional, Upvalue, UpvalueRef};
    pub use crate::reference::Reference;
    pub use crate::session::{Namespace, Session};
    pub use hostbind_core::{State, Value};
}
