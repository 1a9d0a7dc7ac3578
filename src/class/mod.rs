//! Opaque host objects.
//!
//! A host type is exposed once per session with a [`ClassBuilder`]. The
//! builder creates a [`ClassRecord`] holding the class metatable and its
//! member tables, and stores it in the session's [`ClassRegistry`] (app data
//! on the [`State`], never process-global).
//!
//! Instances live in runtime userdata slots as [`HostCell`]s and are reached
//! from Rust through validated [`Host<T>`] handles.
//!
//! # Example
//!
//! ```
//! use hostbind::{HostType, Session};
//!
//! #[derive(Default)]
//! struct Counter {
//!     n: i64,
//! }
//!
//! impl HostType for Counter {
//!     const NAME: &'static str = "Counter";
//! }
//!
//! let mut session = Session::new();
//! session
//!     .class::<Counter>()?
//!     .constructor(Counter::default)?
//!     .method_mut("Increment", |c: &mut Counter| {
//!         c.n += 1;
//!         c.n
//!     })?
//!     .build()?;
//! # Ok::<(), hostbind::BindError>(())
//! ```

mod builder;
mod cell;
mod dispatch;

use std::any::{Any, TypeId, type_name};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use hostbind_core::{NIL_REF, State, TableRef, TypeHash, Value};
use rustc_hash::FxHashMap;

use crate::error::BindError;

pub use builder::ClassBuilder;
pub use cell::{Host, HostCell, destroy, push_host, validate};

/// A Rust type that can be exposed as a class.
pub trait HostType: Any + Sized {
    /// The class name seen by scripts.
    const NAME: &'static str;

    /// Register the properties known statically. The derive macro fills
    /// this in from `#[host(...)]` field attributes.
    fn register_fields(builder: ClassBuilder<'_, Self>) -> Result<ClassBuilder<'_, Self>, BindError> {
        Ok(builder)
    }
}

/// Lets a `Self` object be used where a `U` is expected.
pub trait CastTo<U> {
    fn cast_ref(&self) -> &U;

    fn cast_mut(&mut self) -> &mut U;
}

type CastRef = for<'a> fn(&'a (dyn Any + 'static)) -> Option<&'a (dyn Any + 'static)>;
type CastMut = for<'a> fn(&'a mut (dyn Any + 'static)) -> Option<&'a mut (dyn Any + 'static)>;

/// Type-erased [`CastTo`] converters for one source class.
#[derive(Clone, Copy)]
pub struct CastEntry {
    pub(crate) cast_ref: CastRef,
    pub(crate) cast_mut: CastMut,
}

impl CastEntry {
    pub fn of<T: CastTo<U> + Any, U: Any>() -> Self {
        fn cast_ref<'a, T: CastTo<U> + Any, U: Any>(
            value: &'a (dyn Any + 'static),
        ) -> Option<&'a (dyn Any + 'static)> {
            let target: &'a (dyn Any + 'static) = value.downcast_ref::<T>()?.cast_ref();
            Some(target)
        }

        fn cast_mut<'a, T: CastTo<U> + Any, U: Any>(
            value: &'a mut (dyn Any + 'static),
        ) -> Option<&'a mut (dyn Any + 'static)> {
            let target: &'a mut (dyn Any + 'static) = value.downcast_mut::<T>()?.cast_mut();
            Some(target)
        }

        Self {
            cast_ref: cast_ref::<T, U>,
            cast_mut: cast_mut::<T, U>,
        }
    }
}

impl fmt::Debug for CastEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CastEntry").finish_non_exhaustive()
    }
}

/// Metamethods a class can override with [`ClassBuilder::meta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaMethod {
    Len,
    Eq,
    Lt,
    Le,
    Call,
    ToString,
}

impl MetaMethod {
    pub fn name(self) -> &'static str {
        match self {
            MetaMethod::Len => "__len",
            MetaMethod::Eq => "__eq",
            MetaMethod::Lt => "__lt",
            MetaMethod::Le => "__le",
            MetaMethod::Call => "__call",
            MetaMethod::ToString => "__tostring",
        }
    }
}

// ============================================================================
// Class Records
// ============================================================================

/// Everything the session knows about one exposed type.
pub struct ClassRecord {
    hash: TypeHash,
    type_id: TypeId,
    name: Rc<str>,
    metatable: TableRef,
    methods: TableRef,
    getters: TableRef,
    setters: TableRef,
    class_table: TableRef,
    casts: RefCell<FxHashMap<TypeHash, CastEntry>>,
    /// Registry slots holding the metatable and class table.
    anchors: [i32; 2],
}

impl ClassRecord {
    fn new<T: Any>(name: &str) -> Self {
        Self {
            hash: class_hash::<T>(),
            type_id: TypeId::of::<T>(),
            name: Rc::from(name),
            metatable: TableRef::new(),
            methods: TableRef::new(),
            getters: TableRef::new(),
            setters: TableRef::new(),
            class_table: TableRef::new(),
            casts: RefCell::default(),
            anchors: [NIL_REF; 2],
        }
    }

    /// Registry slots that keep the class tables alive for the session.
    pub fn anchors(&self) -> [i32; 2] {
        self.anchors
    }

    pub fn hash(&self) -> TypeHash {
        self.hash
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_rc(&self) -> Rc<str> {
        Rc::clone(&self.name)
    }

    pub fn metatable(&self) -> &TableRef {
        &self.metatable
    }

    pub fn methods(&self) -> &TableRef {
        &self.methods
    }

    pub fn getters(&self) -> &TableRef {
        &self.getters
    }

    pub fn setters(&self) -> &TableRef {
        &self.setters
    }

    /// The table scripts see under the class name.
    pub fn class_table(&self) -> &TableRef {
        &self.class_table
    }

    /// The converter that lets objects of class `source` act as this class.
    pub fn cast_from(&self, source: TypeHash) -> Option<CastEntry> {
        self.casts.borrow().get(&source).copied()
    }

    pub(crate) fn add_cast(&self, source: TypeHash, entry: CastEntry) {
        self.casts.borrow_mut().insert(source, entry);
    }
}

impl fmt::Debug for ClassRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassRecord")
            .field("name", &self.name)
            .field("hash", &self.hash)
            .field("casts", &self.casts.borrow().len())
            .field("anchors", &self.anchors)
            .finish()
    }
}

pub(crate) fn class_hash<T: Any>() -> TypeHash {
    TypeHash::from_name(type_name::<T>())
}

/// The classes exposed in one session.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    by_type: FxHashMap<TypeId, TypeHash>,
    classes: FxHashMap<TypeHash, Rc<ClassRecord>>,
}

impl ClassRegistry {
    pub fn get(&self, hash: TypeHash) -> Option<&Rc<ClassRecord>> {
        self.classes.get(&hash)
    }

    pub fn record_of<T: Any>(&self) -> Option<&Rc<ClassRecord>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|hash| self.classes.get(hash))
    }

    pub fn contains<T: Any>(&self) -> bool {
        self.by_type.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<ClassRecord>> {
        self.classes.values()
    }

    fn insert(&mut self, record: ClassRecord) -> Rc<ClassRecord> {
        let record = Rc::new(record);
        self.by_type.insert(record.type_id, record.hash);
        self.classes.insert(record.hash, Rc::clone(&record));
        record
    }

    /// Create the record of `T` in the registry of `state`.
    ///
    /// The metatable and class table are referenced from the runtime
    /// registry, so anything reachable from them survives collection even
    /// while no instance is alive.
    pub(crate) fn register<T: Any>(state: &mut State, name: &str) -> Result<Rc<ClassRecord>, BindError> {
        let mut registry = state.remove_app_data::<ClassRegistry>().unwrap_or_default();
        let result = if registry.contains::<T>() {
            Err(BindError::DuplicateClass(name.to_string()))
        } else {
            let mut record = ClassRecord::new::<T>(name);
            let slots = state.registry();
            record.anchors = [
                slots.reference(Value::Table(record.metatable.clone())),
                slots.reference(Value::Table(record.class_table.clone())),
            ];
            Ok(registry.insert(record))
        };
        state.set_app_data(registry);
        result
    }

    /// The record of `T` in the registry of `state`.
    pub(crate) fn lookup<T: HostType>(state: &State) -> Result<Rc<ClassRecord>, BindError> {
        state
            .app_data::<ClassRegistry>()
            .and_then(|registry| registry.record_of::<T>())
            .cloned()
            .ok_or_else(cell::unregistered::<T>)
    }
}
