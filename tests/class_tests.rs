//! Integration tests for exposing host types as classes.

use std::cell::Cell;
use std::rc::Rc;

use hostbind::prelude::*;
use hostbind::{HostType, MetaMethod};

#[derive(Debug, Default)]
struct Counter {
    n: i64,
}

impl HostType for Counter {
    const NAME: &'static str = "Counter";
}

fn expose_counter(session: &mut Session) {
    session
        .class::<Counter>()
        .and_then(|b| b.constructor(Counter::default))
        .and_then(|b| {
            b.method_mut("Increment", |c: &mut Counter| {
                c.n += 1;
                c.n
            })
        })
        .and_then(|b| b.method("Get", |c: &Counter| c.n))
        .and_then(|b| b.build())
        .unwrap();
}

fn method(session: &mut Session, object: &Reference, name: &str) -> Reference {
    object.entry(name).reference(session.state_mut()).unwrap()
}

#[test]
fn counter_lifecycle() {
    let mut session = Session::new();
    expose_counter(&mut session);

    let counter: Reference = session.call_global("Counter", ()).unwrap();
    let increment = method(&mut session, &counter, "Increment");
    for expected in 1..=3_i64 {
        let n: i64 = increment.call(session.state_mut(), &counter).unwrap();
        assert_eq!(n, expected);
    }

    assert!(counter.destroy_host(session.state_mut()).unwrap());
    assert!(!counter.destroy_host(session.state_mut()).unwrap());

    let err = increment
        .call::<_, i64>(session.state_mut(), &counter)
        .unwrap_err();
    assert_eq!(err.to_string(), "attempt to use a destroyed Counter object");
}

#[test]
fn host_handles_as_parameters() {
    let mut session = Session::new();
    expose_counter(&mut session);
    session
        .function("Bump", |c: Host<Counter>, by: i64| -> Result<i64, BindError> {
            let mut counter = c.borrow_mut()?;
            counter.n += by;
            Ok(counter.n)
        })
        .unwrap();

    let counter = session.create(Counter { n: 40 }).unwrap();
    let n: i64 = session.call_global("Bump", (&counter, 2)).unwrap();
    assert_eq!(n, 42);

    let err = session.call_global::<_, i64>("Bump", (5, 2)).unwrap_err();
    assert_eq!(err.to_string(), "wrong handle type: Counter expected, got number");
}

#[test]
fn objects_of_another_class_are_rejected() {
    struct Timer;

    impl HostType for Timer {
        const NAME: &'static str = "Timer";
    }

    let mut session = Session::new();
    expose_counter(&mut session);
    session.class::<Timer>().and_then(|b| b.build()).unwrap();

    let timer = session.create(Timer).unwrap();
    let counter = session.create(Counter::default()).unwrap();
    let get = method(&mut session, &counter, "Get");
    let err = get.call::<_, i64>(session.state_mut(), &timer).unwrap_err();
    assert_eq!(err.to_string(), "wrong handle type: Counter expected, got Timer");
}

#[test]
fn unregistered_classes_cannot_be_created() {
    let mut session = Session::new();
    let err = session.create(Counter::default()).unwrap_err();
    assert_eq!(err.to_string(), "class 'Counter' is not registered");
}

#[derive(HostType, Debug)]
#[host(name = "Player")]
struct PlayerState {
    #[host(get, set)]
    health: i32,
    #[host(get, name = "id")]
    player_id: u32,
    #[host(get, set, name = "name")]
    display_name: String,
    inventory: Vec<String>,
}

fn expose_player(session: &mut Session) {
    session
        .class::<PlayerState>()
        .and_then(|b| {
            b.constructor(|id: u32, name: String| PlayerState {
                health: 100,
                player_id: id,
                display_name: name,
                inventory: Vec::new(),
            })
        })
        .and_then(|b| {
            b.method_mut("Pick", |p: &mut PlayerState, item: String| {
                p.inventory.push(item);
                p.inventory.len()
            })
        })
        .and_then(|b| b.build())
        .unwrap();
}

#[test]
fn derived_fields_become_properties() {
    let mut session = Session::new();
    expose_player(&mut session);
    assert_eq!(<PlayerState as HostType>::NAME, "Player");

    let player: Reference = session.call_global("Player", (7, "Ada")).unwrap();
    let state = session.state_mut();

    assert_eq!(player.entry("health").get::<i32>(state).unwrap(), 100);
    assert_eq!(player.entry("id").get::<u32>(state).unwrap(), 7);
    assert_eq!(player.entry("name").get::<String>(state).unwrap(), "Ada");

    player.entry("health").set(state, 64).unwrap();
    player.entry("name").set(state, "Grace").unwrap();
    assert_eq!(player.entry("health").get::<i32>(state).unwrap(), 64);
    assert_eq!(player.entry("name").get::<String>(state).unwrap(), "Grace");

    let err = player.entry("id").set(state, 8).unwrap_err();
    assert_eq!(err.to_string(), "no writable member 'id' on Player");
    assert!(player.entry("inventory").value(state).unwrap().is_nil());
}

#[test]
fn derived_types_return_as_objects() {
    let mut session = Session::new();
    expose_player(&mut session);
    session
        .function("Spawn", |id: u32| PlayerState {
            health: 50,
            player_id: id,
            display_name: format!("bot-{id}"),
            inventory: Vec::new(),
        })
        .unwrap();

    let bot: Reference = session.call_global("Spawn", 3).unwrap();
    let pick = method(&mut session, &bot, "Pick");
    let count: usize = pick.call(session.state_mut(), (&bot, "sword")).unwrap();
    assert_eq!(count, 1);
    let name: String = bot.entry("name").get(session.state_mut()).unwrap();
    assert_eq!(name, "bot-3");
}

struct Vector {
    x: f64,
    y: f64,
}

impl HostType for Vector {
    const NAME: &'static str = "Vector";
}

impl ToStack for Vector {
    fn to_stack(self, state: &mut State) -> Result<(), BindError> {
        hostbind::class::push_host(state, self).map(|_| ())
    }
}

#[test]
fn metamethods_and_statics() {
    let mut session = Session::new();
    session
        .class::<Vector>()
        .and_then(|b| b.constructor(|x: f64, y: f64| Vector { x, y }))
        .and_then(|b| b.static_fn("Zero", || Vector { x: 0.0, y: 0.0 }))
        .and_then(|b| b.constant("dimensions", 2))
        .and_then(|b| b.property_readonly("x", |v: &Vector| v.x))
        .and_then(|b| {
            b.meta(
                MetaMethod::ToString,
                HostFunction::method(|v: &Vector| format!("({}, {})", v.x, v.y)),
            )
        })
        .and_then(|b| b.meta(MetaMethod::Len, HostFunction::method(|v: &Vector| v.x.hypot(v.y))))
        .and_then(|b| {
            b.meta(
                MetaMethod::Lt,
                HostFunction::method(|a: &Vector, b: Host<Vector>| -> Result<bool, BindError> {
                    let b = b.borrow()?;
                    Ok(a.x.hypot(a.y) < b.x.hypot(b.y))
                }),
            )
        })
        .and_then(|b| b.build())
        .unwrap();

    let class = session.globals().entry("Vector").reference(session.state_mut()).unwrap();
    let dimensions: i64 = class.entry("dimensions").get(session.state_mut()).unwrap();
    assert_eq!(dimensions, 2);

    let zero: Reference = class
        .entry("Zero")
        .reference(session.state_mut())
        .and_then(|f| f.call(session.state_mut(), ()))
        .unwrap();
    let v: Reference = session.call_global("Vector", (3.0, 4.0)).unwrap();
    let state = session.state_mut();

    assert_eq!(v.to_display_string(state).unwrap(), "(3, 4)");
    assert_eq!(v.len(state).unwrap(), Value::Float(5.0));
    assert!(zero.less_than(state, &v).unwrap());
    assert!(!v.less_than(state, &zero).unwrap());
    assert_eq!(zero.entry("x").get::<f64>(state).unwrap(), 0.0);
}

#[test]
fn identity_equality_and_default_tostring() {
    let mut session = Session::new();
    expose_counter(&mut session);
    let a = session.create(Counter::default()).unwrap();
    let b = session.create(Counter::default()).unwrap();
    let a_again = a.clone();
    let state = session.state_mut();

    assert!(a.equals(state, &a_again).unwrap());
    assert!(!a.equals(state, &b).unwrap());
    assert!(a.to_display_string(state).unwrap().starts_with("Counter: 0x"));
}

struct Tracked {
    dropped: Rc<Cell<bool>>,
}

impl HostType for Tracked {
    const NAME: &'static str = "Tracked";
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.dropped.set(true);
    }
}

#[test]
fn unreachable_objects_are_finalized() {
    let mut session = Session::new();
    session.class::<Tracked>().and_then(|b| b.build()).unwrap();

    let dropped = Rc::new(Cell::new(false));
    let object = session
        .create(Tracked {
            dropped: Rc::clone(&dropped),
        })
        .unwrap();

    session.collect_garbage();
    assert!(!dropped.get());

    drop(object);
    assert_eq!(session.collect_garbage(), 1);
    assert!(dropped.get());
}

#[test]
fn explicit_destroy_drops_the_payload_once() {
    let mut session = Session::new();
    session.class::<Tracked>().and_then(|b| b.build()).unwrap();

    let dropped = Rc::new(Cell::new(false));
    let object = session
        .create(Tracked {
            dropped: Rc::clone(&dropped),
        })
        .unwrap();

    assert!(object.destroy_host(session.state_mut()).unwrap());
    assert!(dropped.get());

    drop(object);
    assert_eq!(session.collect_garbage(), 1);
    assert!(dropped.get());
}

#[test]
fn class_tables_keep_their_upvalues_alive() {
    let mut session = Session::new();
    session.class::<Tracked>().and_then(|b| b.build()).unwrap();

    let dropped = Rc::new(Cell::new(false));
    let tracked = session
        .create(Tracked {
            dropped: Rc::clone(&dropped),
        })
        .unwrap();
    let alive = HostFunction::method::<Counter, _, _>(|_: &Counter, held: Upvalue<Host<Tracked>>| {
        !held.is_destroyed()
    })
    .upvalue(tracked);
    session
        .class::<Counter>()
        .and_then(|b| b.constructor(Counter::default))
        .and_then(|b| b.method_with("Alive", alive))
        .and_then(|b| b.build())
        .unwrap();

    assert_eq!(session.collect_garbage(), 0);
    assert!(!dropped.get());

    let counter: Reference = session.call_global("Counter", ()).unwrap();
    let check = method(&mut session, &counter, "Alive");
    let alive: bool = check.call(session.state_mut(), &counter).unwrap();
    assert!(alive);
}
