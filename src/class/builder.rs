//! Fluent class registration.

use std::marker::PhantomData;
use std::rc::Rc;

use hostbind_core::{State, TableRef, Value};

use super::{CastEntry, CastTo, ClassRecord, ClassRegistry, HostType, MetaMethod, dispatch};
use crate::convert::{FromStack, ToStack};
use crate::error::BindError;
use crate::function::{HostFunction, IntoConstructor, IntoHostFn, IntoMethod, IntoMethodMut};

/// Builder for exposing a host type.
///
/// Opened by [`Session::class`](crate::Session::class) or
/// [`Namespace::class`](crate::Namespace::class); nothing is visible to
/// scripts until [`build`](Self::build) installs the class table.
pub struct ClassBuilder<'s, T: HostType> {
    state: &'s mut State,
    record: Rc<ClassRecord>,
    parent: TableRef,
    _marker: PhantomData<T>,
}

impl<'s, T: HostType> ClassBuilder<'s, T> {
    /// Create the class record and metatable.
    ///
    /// Fails with [`BindError::DuplicateClass`] if `T` is already exposed in
    /// this session.
    pub fn open(state: &'s mut State, parent: TableRef, name: &str) -> Result<Self, BindError> {
        let record = ClassRegistry::register::<T>(state, name)?;
        dispatch::populate(&record);
        tracing::trace!(class = name, hash = %record.hash(), "class opened");
        Ok(Self {
            state,
            record,
            parent,
            _marker: PhantomData,
        })
    }

    pub fn record(&self) -> &ClassRecord {
        &self.record
    }

    fn set(&mut self, table: &TableRef, name: &str, function: HostFunction) -> Result<(), BindError> {
        let value = function.named(format!("{}.{}", self.record.name(), name)).into_value(self.state)?;
        table.raw_set_str(name, value);
        Ok(())
    }

    /// Make `Class(...)` and `Class.new(...)` build objects with `f`.
    pub fn constructor<F, M>(self, f: F) -> Result<Self, BindError>
    where
        F: IntoConstructor<T, M>,
    {
        self.constructor_with(HostFunction::constructor::<T, F, M>(f))
    }

    /// Install a prepared constructor, for one with fallbacks or upvalues.
    pub fn constructor_with(mut self, function: HostFunction) -> Result<Self, BindError> {
        let class_table = self.record.class_table().clone();
        self.set(&class_table, "new", function)?;
        let forwarder = dispatch::constructor_forwarder(class_table.raw_get_str("new"));
        let class_meta = TableRef::new();
        class_meta.raw_set_str("__call", forwarder);
        class_table.set_metatable(Some(class_meta));
        Ok(self)
    }

    /// A method taking the object by shared reference.
    pub fn method<F, M>(self, name: &str, f: F) -> Result<Self, BindError>
    where
        F: IntoMethod<T, M>,
    {
        self.method_with(name, HostFunction::method::<T, F, M>(f))
    }

    /// A method taking the object by mutable reference.
    pub fn method_mut<F, M>(self, name: &str, f: F) -> Result<Self, BindError>
    where
        F: IntoMethodMut<T, M>,
    {
        self.method_with(name, HostFunction::method_mut::<T, F, M>(f))
    }

    /// Install a prepared method. Its receiver must be frame slot 1.
    pub fn method_with(mut self, name: &str, function: HostFunction) -> Result<Self, BindError> {
        let methods = self.record.methods().clone();
        self.set(&methods, name, function)?;
        Ok(self)
    }

    /// A read-write property.
    pub fn property<V, G, S>(self, name: &str, get: G, set: S) -> Result<Self, BindError>
    where
        V: FromStack + ToStack + 'static,
        G: Fn(&T) -> V + 'static,
        S: Fn(&mut T, V) + 'static,
    {
        let mut builder = self.property_readonly(name, get)?;
        let setter = HostFunction::method_mut::<T, _, _>(move |this: &mut T, value: V| set(this, value));
        let setters = builder.record.setters().clone();
        builder.set(&setters, name, setter)?;
        Ok(builder)
    }

    /// A property scripts can read but not assign.
    pub fn property_readonly<V, G>(mut self, name: &str, get: G) -> Result<Self, BindError>
    where
        V: ToStack + 'static,
        G: Fn(&T) -> V + 'static,
    {
        let getter = HostFunction::method::<T, _, _>(move |this: &T| get(this));
        let getters = self.record.getters().clone();
        self.set(&getters, name, getter)?;
        Ok(self)
    }

    /// A function on the class table, called as `Class.name(...)`.
    pub fn static_fn<F, M>(self, name: &str, f: F) -> Result<Self, BindError>
    where
        F: IntoHostFn<M>,
    {
        self.static_with(name, HostFunction::new(f))
    }

    pub fn static_with(mut self, name: &str, function: HostFunction) -> Result<Self, BindError> {
        let class_table = self.record.class_table().clone();
        self.set(&class_table, name, function)?;
        Ok(self)
    }

    /// A constant on the class table.
    pub fn constant<V: ToStack>(self, name: &str, value: V) -> Result<Self, BindError> {
        value.to_stack(self.state)?;
        let value = self.state.pop();
        self.record.class_table().raw_set_str(name, value);
        Ok(self)
    }

    /// Let `T` objects be passed where a `U` is expected.
    ///
    /// `U` must already be exposed.
    pub fn upcast<U: HostType>(self) -> Result<Self, BindError>
    where
        T: CastTo<U>,
    {
        let target = ClassRegistry::lookup::<U>(self.state)?;
        target.add_cast(self.record.hash(), CastEntry::of::<T, U>());
        tracing::trace!(from = %self.record.name(), to = %target.name(), "cast registered");
        Ok(self)
    }

    /// Override a metamethod of the instance metatable.
    pub fn meta(mut self, event: MetaMethod, function: HostFunction) -> Result<Self, BindError> {
        let metatable = self.record.metatable().clone();
        self.set(&metatable, event.name(), function)?;
        Ok(self)
    }

    /// Install the class table under the class name.
    pub fn build(self) -> Result<(), BindError> {
        self.parent.raw_set_str(
            self.record.name(),
            Value::Table(self.record.class_table().clone()),
        );
        tracing::trace!(class = %self.record.name(), "class installed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{Host, destroy, push_host, validate};
    use hostbind_core::RuntimeError;

    #[derive(Debug, Default)]
    struct Counter {
        n: i64,
    }

    impl HostType for Counter {
        const NAME: &'static str = "Counter";
    }

    struct Shape {
        sides: u32,
    }

    impl HostType for Shape {
        const NAME: &'static str = "Shape";
    }

    struct Square {
        shape: Shape,
        size: f64,
    }

    impl HostType for Square {
        const NAME: &'static str = "Square";
    }

    impl CastTo<Shape> for Square {
        fn cast_ref(&self) -> &Shape {
            &self.shape
        }

        fn cast_mut(&mut self) -> &mut Shape {
            &mut self.shape
        }
    }

    fn expose_counter(state: &mut State) {
        let globals = state.globals().clone();
        ClassBuilder::<Counter>::open(state, globals, "Counter")
            .and_then(|b| b.constructor(Counter::default))
            .and_then(|b| {
                b.method_mut("Increment", |c: &mut Counter| {
                    c.n += 1;
                    c.n
                })
            })
            .and_then(|b| b.property("n", |c: &Counter| c.n, |c: &mut Counter, n: i64| c.n = n))
            .and_then(|b| b.property_readonly("double", |c: &Counter| c.n * 2))
            .and_then(|b| b.static_fn("zero", || 0_i64))
            .and_then(|b| b.build())
            .unwrap();
    }

    fn new_counter(state: &mut State) -> Value {
        let class = state.globals().raw_get_str("Counter");
        state.call_value(&class, &[], 1).unwrap().remove(0)
    }

    fn call_method(state: &mut State, object: &Value, name: &str, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
        let method = state.index_value(object, &Value::from(name))?;
        let mut full = vec![object.clone()];
        full.extend_from_slice(args);
        state.call_value(&method, &full, hostbind_core::MULTRET)
    }

    #[test]
    fn counter_lifecycle() {
        let mut state = State::new();
        expose_counter(&mut state);
        let c = new_counter(&mut state);
        assert_eq!(call_method(&mut state, &c, "Increment", &[]).unwrap(), vec![Value::Int(1)]);
        assert_eq!(call_method(&mut state, &c, "Increment", &[]).unwrap(), vec![Value::Int(2)]);

        state.push(c.clone());
        assert!(destroy(&state, -1).unwrap());
        assert!(!destroy(&state, -1).unwrap());
        state.discard(1);

        let err = call_method(&mut state, &c, "Increment", &[]).unwrap_err();
        assert_eq!(err.message(), "attempt to use a destroyed Counter object");
    }

    #[test]
    fn properties_dispatch_through_metatable() {
        let mut state = State::new();
        expose_counter(&mut state);
        let c = new_counter(&mut state);
        state.set_index_value(&c, Value::from("n"), Value::Int(20)).unwrap();
        assert_eq!(state.index_value(&c, &Value::from("n")).unwrap(), Value::Int(20));
        assert_eq!(state.index_value(&c, &Value::from("double")).unwrap(), Value::Int(40));
        assert_eq!(state.index_value(&c, &Value::from("missing")).unwrap(), Value::Nil);

        let err = state
            .set_index_value(&c, Value::from("double"), Value::Int(1))
            .unwrap_err();
        assert_eq!(err.message(), "no writable member 'double' on Counter");
    }

    #[test]
    fn class_table_exposes_new_and_statics() {
        let mut state = State::new();
        expose_counter(&mut state);
        let class = state.globals().raw_get_str("Counter");
        let new = state.index_value(&class, &Value::from("new")).unwrap();
        let c = state.call_value(&new, &[], 1).unwrap().remove(0);
        assert!(c.as_userdata().is_some());
        let zero = state.index_value(&class, &Value::from("zero")).unwrap();
        assert_eq!(state.call_value(&zero, &[], 1).unwrap(), vec![Value::Int(0)]);
    }

    #[test]
    fn default_tostring_uses_class_name() {
        let mut state = State::new();
        expose_counter(&mut state);
        let c = new_counter(&mut state);
        let text = state.display(&c).unwrap();
        assert!(text.starts_with("Counter: 0x"), "{text}");
    }

    #[test]
    fn duplicate_class_is_rejected() {
        let mut state = State::new();
        expose_counter(&mut state);
        let globals = state.globals().clone();
        let err = ClassBuilder::<Counter>::open(&mut state, globals, "Counter")
            .err()
            .unwrap();
        assert!(matches!(err, BindError::DuplicateClass(_)));
    }

    #[test]
    fn validate_rejects_other_classes_and_values() {
        let mut state = State::new();
        expose_counter(&mut state);
        let globals = state.globals().clone();
        ClassBuilder::<Shape>::open(&mut state, globals, "Shape")
            .and_then(|b| b.build())
            .unwrap();

        push_host(&mut state, Counter::default()).unwrap();
        let err = validate::<Shape>(&state, -1).unwrap_err();
        assert_eq!(err.to_string(), "wrong handle type: Shape expected, got Counter");

        state.push_int(3);
        let err = validate::<Shape>(&state, -1).unwrap_err();
        assert_eq!(err.to_string(), "wrong handle type: Shape expected, got number");
    }

    #[test]
    fn upcast_accepts_derived_objects() {
        let mut state = State::new();
        let globals = state.globals().clone();
        ClassBuilder::<Shape>::open(&mut state, globals.clone(), "Shape")
            .and_then(|b| b.method("sides", |s: &Shape| s.sides))
            .and_then(|b| b.build())
            .unwrap();
        ClassBuilder::<Square>::open(&mut state, globals, "Square")
            .and_then(|b| b.upcast::<Shape>())
            .and_then(|b| b.property_readonly("size", |s: &Square| s.size))
            .and_then(|b| b.build())
            .unwrap();

        push_host(
            &mut state,
            Square {
                shape: Shape { sides: 4 },
                size: 2.0,
            },
        )
        .unwrap();
        let as_shape: Host<Shape> = validate(&state, -1).unwrap();
        assert_eq!(as_shape.borrow().unwrap().sides, 4);
        as_shape.borrow_mut().unwrap().sides = 5;
        let as_square: Host<Square> = validate(&state, -1).unwrap();
        assert_eq!(as_square.borrow().unwrap().shape.sides, 5);

        // Square objects are accepted as shapes but do not gain Shape's members.
        let square = state.value(-1);
        let sides = state.index_value(&square, &Value::from("sides")).unwrap();
        assert!(sides.is_nil());
    }

    #[test]
    fn borrow_conflicts_are_reported() {
        let mut state = State::new();
        expose_counter(&mut state);
        push_host(&mut state, Counter::default()).unwrap();
        let host: Host<Counter> = validate(&state, -1).unwrap();
        let _guard = host.borrow_mut().unwrap();
        assert!(matches!(host.borrow(), Err(BindError::AlreadyBorrowed { .. })));
        assert!(matches!(host.destroy(), Err(BindError::AlreadyBorrowed { .. })));
    }

    #[test]
    fn collector_finalizes_unreachable_objects() {
        let mut state = State::new();
        expose_counter(&mut state);
        push_host(&mut state, Counter::default()).unwrap();
        let host: Host<Counter> = validate(&state, -1).unwrap();
        state.discard(1);
        assert_eq!(state.collect_garbage(), 1);
        assert!(host.is_destroyed());
    }
}
