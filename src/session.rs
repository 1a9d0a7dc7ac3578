//! The session facade: one runtime state plus everything registered in it.

use std::any::Any;

use hostbind_core::{State, StateConfig, TableRef, Value};

use crate::class::{ClassBuilder, HostType, push_host};
use crate::convert::{FromStack, ToStack, from_value, to_value};
use crate::error::BindError;
use crate::function::{HostFunction, IntoHostFn};
use crate::multi::{FromResults, IntoArgs};
use crate::param;
use crate::reference::Reference;

/// Owns a [`State`] and exposes registration and call helpers.
///
/// Class records, fallback defaults and registry slots are scoped to the
/// session; two sessions share nothing.
#[derive(Debug, Default)]
pub struct Session {
    state: State,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: StateConfig) -> Self {
        Self {
            state: State::with_config(config),
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    /// Expose `f` as the global `name`.
    pub fn function<F, M>(&mut self, name: &str, f: F) -> Result<(), BindError>
    where
        F: IntoHostFn<M>,
    {
        self.install(name, HostFunction::new(f))
    }

    /// Expose a prepared function as the global `name`.
    pub fn install(&mut self, name: &str, function: HostFunction) -> Result<(), BindError> {
        let value = function.named(name).into_value(&mut self.state)?;
        self.state.globals().raw_set_str(name, value);
        Ok(())
    }

    pub fn set_global<T: ToStack>(&mut self, name: &str, value: T) -> Result<(), BindError> {
        let value = to_value(&mut self.state, value)?;
        self.state.globals().raw_set_str(name, value);
        Ok(())
    }

    pub fn get_global<T: FromStack>(&mut self, name: &str) -> Result<T, BindError> {
        let value = self.state.globals().raw_get_str(name);
        from_value(&mut self.state, value)
    }

    /// Open a class builder for `T`, installed as a global when built.
    pub fn class<T: HostType>(&mut self) -> Result<ClassBuilder<'_, T>, BindError> {
        let globals = self.state.globals().clone();
        ClassBuilder::open(&mut self.state, globals, T::NAME).and_then(T::register_fields)
    }

    /// The global table `name`, created if missing.
    pub fn namespace(&mut self, name: &str) -> Result<Namespace<'_>, BindError> {
        let globals = self.state.globals().clone();
        Namespace::open(&mut self.state, &globals, name)
    }

    /// Default used by [`Defaulted<T>`](crate::Defaulted) parameters.
    pub fn set_default<T: Any + Clone>(&mut self, value: T) {
        param::set_default(&mut self.state, value);
    }

    pub fn globals(&self) -> Reference {
        Reference::new(&self.state, Value::Table(self.state.globals().clone()))
    }

    /// Keep `value` alive in the registry.
    pub fn reference<T: ToStack>(&mut self, value: T) -> Result<Reference, BindError> {
        Reference::from_rust(&mut self.state, value)
    }

    /// Construct a host object outside any script call.
    pub fn create<T: HostType>(&mut self, value: T) -> Result<Reference, BindError> {
        push_host(&mut self.state, value)?;
        let object = Reference::at(&self.state, -1);
        self.state.discard(1);
        Ok(object)
    }

    /// Call the global function `name`.
    pub fn call_global<A: IntoArgs, R: FromResults>(&mut self, name: &str, args: A) -> Result<R, BindError> {
        let function = Reference::new(&self.state, self.state.globals().raw_get_str(name));
        function.call(&mut self.state, args)
    }

    pub fn collect_garbage(&mut self) -> usize {
        self.state.collect_garbage()
    }
}

/// A table of related functions, values and classes.
pub struct Namespace<'s> {
    state: &'s mut State,
    table: TableRef,
}

impl<'s> Namespace<'s> {
    fn open(state: &'s mut State, parent: &TableRef, name: &str) -> Result<Self, BindError> {
        let table = match parent.raw_get_str(name) {
            Value::Table(existing) => existing,
            Value::Nil => {
                let table = TableRef::new();
                parent.raw_set_str(name, Value::Table(table.clone()));
                table
            }
            other => {
                return Err(BindError::argument_type("table", other.type_name(), 0));
            }
        };
        tracing::trace!(namespace = name, "namespace opened");
        Ok(Self { state, table })
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub fn function<F, M>(self, name: &str, f: F) -> Result<Self, BindError>
    where
        F: IntoHostFn<M>,
    {
        self.install(name, HostFunction::new(f))
    }

    pub fn install(self, name: &str, function: HostFunction) -> Result<Self, BindError> {
        let value = function.named(name).into_value(self.state)?;
        self.table.raw_set_str(name, value);
        Ok(self)
    }

    pub fn value<T: ToStack>(self, name: &str, value: T) -> Result<Self, BindError> {
        let value = to_value(self.state, value)?;
        self.table.raw_set_str(name, value);
        Ok(self)
    }

    /// Fill the nested namespace `name`.
    pub fn namespace<F>(self, name: &str, fill: F) -> Result<Self, BindError>
    where
        F: FnOnce(Namespace<'_>) -> Result<Namespace<'_>, BindError>,
    {
        let parent = self.table.clone();
        fill(Namespace::open(self.state, &parent, name)?)?;
        Ok(self)
    }

    /// Open a class builder for `T`, installed in this namespace when built.
    pub fn class<T: HostType>(&mut self) -> Result<ClassBuilder<'_, T>, BindError> {
        ClassBuilder::open(self.state, self.table.clone(), T::NAME).and_then(T::register_fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::Optional;

    #[test]
    fn add_and_greet() {
        let mut session = Session::new();
        session.function("Add", |x: i32, y: i32| x + y).unwrap();
        session
            .install(
                "Greet",
                HostFunction::new(|name: Optional<String>| format!("Hello, {}", *name))
                    .fallback(1, String::from("world")),
            )
            .unwrap();

        let sum: i32 = session.call_global("Add", (2, 3)).unwrap();
        assert_eq!(sum, 5);
        let err = session.call_global::<_, i32>("Add", 2).unwrap_err();
        assert_eq!(err.to_string(), "wrong number of arguments: expected 2, got 1");

        let hello: String = session.call_global("Greet", ()).unwrap();
        assert_eq!(hello, "Hello, world");
        let hello: String = session.call_global("Greet", "Sam").unwrap();
        assert_eq!(hello, "Hello, Sam");
    }

    #[test]
    fn globals_round_trip() {
        let mut session = Session::new();
        session.set_global("answer", 42_u8).unwrap();
        assert_eq!(session.get_global::<u8>("answer").unwrap(), 42);
        assert!(session.get_global::<bool>("answer").is_err());
        assert!(session.globals().entry("answer").value(session.state_mut()).is_ok());
    }

    #[test]
    fn namespaces_nest() {
        let mut session = Session::new();
        session
            .namespace("math")
            .and_then(|ns| ns.function("double", |x: f64| x * 2.0))
            .and_then(|ns| ns.value("pi", std::f64::consts::PI))
            .and_then(|ns| ns.namespace("int", |inner| inner.function("neg", |x: i64| -x)))
            .unwrap();

        let globals = session.globals();
        let double = globals.entry("math").entry("double").reference(session.state_mut()).unwrap();
        let result: f64 = double.call(session.state_mut(), 1.5).unwrap();
        assert_eq!(result, 3.0);
        let neg = globals
            .entry("math")
            .entry("int")
            .entry("neg")
            .reference(session.state_mut())
            .unwrap();
        assert_eq!(neg.call::<_, i64>(session.state_mut(), 4).unwrap(), -4);
    }

    #[test]
    fn namespace_reopens_existing_table() {
        let mut session = Session::new();
        let first = session.namespace("util").unwrap().table().clone();
        let second = session.namespace("util").unwrap().table().clone();
        assert!(first.ptr_eq(&second));

        session.set_global("taken", 1).unwrap();
        assert!(session.namespace("taken").is_err());
    }

    #[test]
    fn session_defaults_apply() {
        let mut session = Session::new();
        session
            .function("scale", |x: i64, by: crate::Defaulted<i64>| x * *by)
            .unwrap();
        session.set_default(10_i64);
        assert_eq!(session.call_global::<_, i64>("scale", 3).unwrap(), 30);
        assert_eq!(session.call_global::<_, i64>("scale", (3, 2)).unwrap(), 6);
    }
}
