//! Integration tests for binding free functions and closures.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use hostbind::prelude::*;
use hostbind::Status;

#[test]
fn add_returns_the_sum() {
    let mut session = Session::new();
    session.function("Add", |x: i32, y: i32| x + y).unwrap();

    let sum: i32 = session.call_global("Add", (2, 3)).unwrap();
    assert_eq!(sum, 5);
}

#[test]
fn add_reports_arity_and_type_errors() {
    let mut session = Session::new();
    session.function("Add", |x: i32, y: i32| x + y).unwrap();

    let err = session.call_global::<_, i32>("Add", 2).unwrap_err();
    assert_eq!(err.to_string(), "wrong number of arguments: expected 2, got 1");

    let err = session.call_global::<_, i32>("Add", (2, 3, 4)).unwrap_err();
    assert_eq!(err.to_string(), "wrong number of arguments: expected 2, got 3");

    let err = session.call_global::<_, i32>("Add", (2, "three")).unwrap_err();
    assert_eq!(err.to_string(), "bad argument #2: integer expected, got string");
}

#[test]
fn greet_uses_its_fallback_when_the_name_is_absent() {
    let mut session = Session::new();
    session
        .install(
            "Greet",
            HostFunction::new(|name: Optional<String>| format!("Hello, {}", *name))
                .fallback(1, String::from("world")),
        )
        .unwrap();

    let greeting: String = session.call_global("Greet", ()).unwrap();
    assert_eq!(greeting, "Hello, world");
    let greeting: String = session.call_global("Greet", "Sam").unwrap();
    assert_eq!(greeting, "Hello, Sam");

    let err = session.call_global::<_, String>("Greet", ("a", "b")).unwrap_err();
    assert_eq!(err.to_string(), "wrong number of arguments: expected 0 to 1, got 2");
}

#[test]
fn greet_with_a_wrong_type_falls_back_too() {
    let mut session = Session::new();
    session
        .install(
            "Greet",
            HostFunction::new(|name: Optional<String>| format!("Hello, {}", *name))
                .fallback(1, String::from("world")),
        )
        .unwrap();

    let greeting: String = session.call_global("Greet", true).unwrap();
    assert_eq!(greeting, "Hello, world");
}

#[test]
fn session_defaults_fill_defaulted_parameters() {
    let mut session = Session::new();
    session
        .function("Scale", |x: i64, by: Defaulted<i64>| x * *by)
        .unwrap();

    let scaled: i64 = session.call_global("Scale", (7, 3)).unwrap();
    assert_eq!(scaled, 21);
    let scaled: i64 = session.call_global("Scale", 7).unwrap();
    assert_eq!(scaled, 0);

    session.set_default(10_i64);
    let scaled: i64 = session.call_global("Scale", 7).unwrap();
    assert_eq!(scaled, 70);
}

#[test]
fn upvalues_persist_between_calls() {
    let mut session = Session::new();
    session
        .install(
            "Next",
            HostFunction::new(|mut counter: Upvalue<i64>, step: i64| {
                *counter += step;
                *counter
            })
            .upvalue(100_i64),
        )
        .unwrap();

    let values: Vec<i64> = (1..=3)
        .map(|step| session.call_global("Next", step).unwrap())
        .collect();
    assert_eq!(values, vec![101, 103, 106]);
}

#[test]
fn failed_calls_leave_upvalues_untouched() {
    let mut session = Session::new();
    session
        .install(
            "Spend",
            HostFunction::new(|mut budget: Upvalue<i64>, cost: i64| -> anyhow::Result<i64> {
                *budget -= cost;
                anyhow::ensure!(*budget >= 0, "over budget by {}", -*budget);
                Ok(*budget)
            })
            .upvalue(10_i64),
        )
        .unwrap();

    let left: i64 = session.call_global("Spend", 4).unwrap();
    assert_eq!(left, 6);

    let err = session.call_global::<_, i64>("Spend", 9).unwrap_err();
    assert_eq!(err.to_string(), "over budget by 3");

    let left: i64 = session.call_global("Spend", 6).unwrap();
    assert_eq!(left, 0);
}

#[test]
fn pointer_upvalues_write_through_to_the_host() {
    let mut session = Session::new();
    let log = Rc::new(RefCell::new(Vec::<String>::new()));
    session
        .install(
            "Log",
            HostFunction::new(|sink: UpvalueRef<Vec<String>>, line: String| {
                sink.borrow_mut().push(line);
            })
            .upvalue(Rc::clone(&log)),
        )
        .unwrap();

    session.call_global::<_, ()>("Log", "first").unwrap();
    session.call_global::<_, ()>("Log", "second").unwrap();
    assert_eq!(*log.borrow(), vec!["first".to_string(), "second".to_string()]);
}

#[test]
fn multiple_results_come_back_as_a_tuple() {
    let mut session = Session::new();
    session
        .function("DivMod", |a: i64, b: i64| (a / b, a % b))
        .unwrap();

    let (quotient, remainder): (i64, i64) = session.call_global("DivMod", (17, 5)).unwrap();
    assert_eq!((quotient, remainder), (3, 2));
}

#[test]
fn sequences_and_maps_convert_to_tables() {
    let mut session = Session::new();
    session
        .function("Sum", |values: Vec<i64>| values.iter().sum::<i64>())
        .unwrap();
    session
        .function("Histogram", |words: Vec<String>| {
            let mut counts = HashMap::new();
            for word in words {
                *counts.entry(word).or_insert(0_i64) += 1;
            }
            counts
        })
        .unwrap();

    let total: i64 = session.call_global("Sum", (vec![1_i64, 2, 3, 4],)).unwrap();
    assert_eq!(total, 10);

    let words = vec!["a".to_string(), "b".to_string(), "a".to_string()];
    let counts: HashMap<String, i64> = session.call_global("Histogram", (words,)).unwrap();
    assert_eq!(counts.len(), 2);
    assert_eq!(counts["a"], 2);
    assert_eq!(counts["b"], 1);
}

#[test]
fn bad_sequence_elements_are_rejected() {
    let mut session = Session::new();
    session
        .function("Sum", |values: Vec<i64>| values.iter().sum::<i64>())
        .unwrap();

    let mixed = session.reference(vec![Value::Int(1), Value::from("two")]).unwrap();
    let result = session.call_global::<_, i64>("Sum", &mixed);
    assert!(result.is_err());
}

#[test]
fn integers_out_of_range_are_rejected() {
    let mut session = Session::new();
    session.function("Byte", |b: u8| b).unwrap();

    let byte: u8 = session.call_global("Byte", 255).unwrap();
    assert_eq!(byte, 255);
    assert!(session.call_global::<_, u8>("Byte", 256).is_err());
}

#[test]
fn native_errors_surface_with_their_message() {
    let mut session = Session::new();
    session
        .function("Sqrt", |x: f64| -> anyhow::Result<f64> {
            anyhow::ensure!(x >= 0.0, "cannot take the root of {x}");
            Ok(x.sqrt())
        })
        .unwrap();

    let root: f64 = session.call_global("Sqrt", 16.0).unwrap();
    assert_eq!(root, 4.0);

    let err = session.call_global::<_, f64>("Sqrt", -4.0).unwrap_err();
    assert_eq!(err.to_string(), "cannot take the root of -4");

    let sqrt = session.globals().entry("Sqrt").reference(session.state_mut()).unwrap();
    let (status, result) = sqrt.pcall::<_, f64>(session.state_mut(), -4.0);
    assert_eq!(status, Status::Runtime);
    assert!(result.is_none());
}

#[test]
fn panics_are_contained() {
    let mut session = Session::new();
    session
        .function("Explode", || -> i32 { panic!("native code panicked") })
        .unwrap();

    let err = session.call_global::<_, i32>("Explode", ()).unwrap_err();
    assert_eq!(err.to_string(), "unknown error");

    // The session stays usable afterwards.
    session.function("One", || 1_i32).unwrap();
    let one: i32 = session.call_global("One", ()).unwrap();
    assert_eq!(one, 1);
}

#[test]
fn natives_can_call_back_into_the_runtime() {
    let mut session = Session::new();
    session.function("Double", |x: i64| x * 2).unwrap();
    session
        .install(
            "Apply",
            HostFunction::with_state(|state: &mut State, f: Reference, x: i64| -> Result<i64, BindError> {
                f.call(state, x)
            }),
        )
        .unwrap();

    let double = session.globals().entry("Double").reference(session.state_mut()).unwrap();
    let result: i64 = session.call_global("Apply", (&double, 21)).unwrap();
    assert_eq!(result, 42);
}

#[test]
fn errors_from_nested_calls_keep_their_message() {
    let mut session = Session::new();
    session
        .function("Fail", || -> anyhow::Result<()> { anyhow::bail!("inner failure") })
        .unwrap();
    session
        .install(
            "Relay",
            HostFunction::with_state(|state: &mut State, f: Reference| -> Result<(), BindError> {
                f.call(state, ())
            }),
        )
        .unwrap();

    let fail = session.globals().entry("Fail").reference(session.state_mut()).unwrap();
    let err = session.call_global::<_, ()>("Relay", &fail).unwrap_err();
    assert_eq!(err.to_string(), "inner failure");
    assert!(matches!(&err, BindError::Runtime(runtime) if runtime.status() == Status::Runtime));
}

#[test]
fn pushed_counts_are_returned_verbatim() {
    let mut session = Session::new();
    session
        .install(
            "Range",
            HostFunction::with_state(|state: &mut State, n: i64| {
                for i in 1..=n {
                    state.push_int(i);
                }
                Pushed(n as i32)
            }),
        )
        .unwrap();

    let (a, b, c): (i64, i64, i64) = session.call_global("Range", 3).unwrap();
    assert_eq!((a, b, c), (1, 2, 3));
}

struct Tally {
    seen: Vec<String>,
}

impl HostCallable for Tally {
    type Args = (String,);
    type Output = usize;

    fn call(&mut self, (word,): (String,)) -> usize {
        if !self.seen.contains(&word) {
            self.seen.push(word);
        }
        self.seen.len()
    }
}

#[test]
fn function_objects_keep_state() {
    let mut session = Session::new();
    session
        .install("Tally", HostFunction::object(Tally { seen: Vec::new() }))
        .unwrap();

    let counts: Vec<usize> = ["x", "y", "x", "z"]
        .into_iter()
        .map(|word| session.call_global("Tally", word).unwrap())
        .collect();
    assert_eq!(counts, vec![1, 2, 2, 3]);
}

#[test]
fn namespaces_group_functions() {
    let mut session = Session::new();
    session
        .namespace("math")
        .and_then(|ns| ns.function("Square", |x: f64| x * x))
        .and_then(|ns| ns.value("pi", 3.5_f64))
        .and_then(|ns| ns.namespace("int", |inner| inner.function("Abs", |x: i64| x.abs())))
        .unwrap();

    let math = session.globals().entry("math").reference(session.state_mut()).unwrap();
    let square = math.entry("Square").reference(session.state_mut()).unwrap();
    let result: f64 = square.call(session.state_mut(), 3.0).unwrap();
    assert_eq!(result, 9.0);

    let pi: f64 = math.entry("pi").get(session.state_mut()).unwrap();
    assert_eq!(pi, 3.5);

    let abs = math.entry("int").entry("Abs").reference(session.state_mut()).unwrap();
    let result: i64 = abs.call(session.state_mut(), -8).unwrap();
    assert_eq!(result, 8);
}
