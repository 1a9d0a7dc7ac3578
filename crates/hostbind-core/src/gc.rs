//! Mark-and-sweep collection of unreachable userdata.
//!
//! Tables and closures are reference counted and go away on their own.
//! Userdata live in the [`ObjectHeap`](crate::ObjectHeap) and are only
//! released here:
//!
//! 1. Mark: walk everything reachable from the stack, globals, registry and
//!    active frames, through table entries, metatables and upvalues.
//! 2. Finalize: for each unmarked userdata, run its `__gc` metamethod in a
//!    protected call. Errors are logged and otherwise ignored.
//! 3. Free: release the heap slot, invalidating every stale handle.

use rustc_hash::FxHashSet;

use crate::error::Status;
use crate::heap::{ObjectHeap, UserdataHandle};
use crate::state::State;
use crate::value::Value;

#[derive(Default)]
struct Tracer {
    pending: Vec<Value>,
    tables: FxHashSet<usize>,
    functions: FxHashSet<usize>,
}

impl Tracer {
    fn run(&mut self, heap: &mut ObjectHeap) {
        while let Some(value) = self.pending.pop() {
            match value {
                Value::Table(t) => {
                    if !self.tables.insert(t.addr()) {
                        continue;
                    }
                    let table = t.borrow();
                    for (key, value) in table.pairs() {
                        self.pending.push(key);
                        self.pending.push(value);
                    }
                    if let Some(mt) = table.metatable() {
                        self.pending.push(Value::Table(mt.clone()));
                    }
                }
                Value::Function(f) => {
                    if self.functions.insert(f.addr()) {
                        self.pending.extend(f.upvalues());
                    }
                }
                Value::Userdata(h) => {
                    if heap.mark(h)
                        && let Some(mt) = heap.metatable(h)
                    {
                        self.pending.push(Value::Table(mt));
                    }
                }
                _ => {}
            }
        }
    }
}

impl State {
    /// Run a full collection cycle. Returns the number of userdata freed.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn collect_garbage(&mut self) -> usize {
        self.heap.clear_marks();
        let mut tracer = Tracer {
            pending: self.roots(),
            ..Tracer::default()
        };
        tracer.run(&mut self.heap);
        let dead = self.heap.unmarked();
        let freed = self.finalize(dead);
        tracing::debug!(freed, live = self.heap.len(), "garbage collection finished");
        freed
    }

    /// Finalize and free every live userdata, newest first.
    pub(crate) fn close_userdata(&mut self) -> usize {
        let mut all = self.heap.handles();
        all.reverse();
        self.finalize(all)
    }

    fn finalize(&mut self, handles: Vec<UserdataHandle>) -> usize {
        let mut freed = 0;
        for handle in handles {
            let finalizer = self
                .heap
                .metatable(handle)
                .map(|mt| mt.raw_get_str("__gc"))
                .unwrap_or_default();
            if matches!(finalizer, Value::Function(_)) {
                let top = self.top();
                self.push(finalizer);
                self.push(Value::Userdata(handle));
                let status = self.pcall(1, 0);
                if status != Status::Ok {
                    let message = self.value(-1);
                    tracing::warn!(
                        status = status.name(),
                        error = ?message,
                        "error in __gc metamethod"
                    );
                }
                self.set_top(top);
            }
            if self.heap.free(handle) {
                freed += 1;
            }
        }
        freed
    }
}

impl Drop for State {
    fn drop(&mut self) {
        if self.config().finalize_on_drop {
            self.close_userdata();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::config::StateConfig;
    use crate::error::RuntimeError;
    use crate::function::{FunctionRef, NativeFn};
    use crate::state::State;
    use crate::table::TableRef;
    use crate::value::Value;

    fn counting_finalizer(count: Rc<Cell<u32>>) -> Value {
        Value::Function(FunctionRef::new(
            NativeFn::new(move |_| {
                count.set(count.get() + 1);
                Ok(0)
            }),
            Vec::new(),
        ))
    }

    fn userdata_with_gc(state: &mut State, count: &Rc<Cell<u32>>) {
        let mt = TableRef::new();
        mt.raw_set_str("__gc", counting_finalizer(count.clone()));
        state.new_userdata(Rc::new(()));
        state.push(Value::Table(mt));
        state.set_metatable(-2).unwrap();
    }

    #[test]
    fn unreachable_userdata_is_finalized_once() {
        let count = Rc::new(Cell::new(0));
        let mut state = State::new();
        userdata_with_gc(&mut state, &count);
        state.discard(1);
        assert_eq!(state.collect_garbage(), 1);
        assert_eq!(count.get(), 1);
        assert_eq!(state.collect_garbage(), 0);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn reachable_userdata_survives() {
        let count = Rc::new(Cell::new(0));
        let mut state = State::new();
        userdata_with_gc(&mut state, &count);
        state.set_global("keep").unwrap();
        assert_eq!(state.collect_garbage(), 0);
        assert_eq!(count.get(), 0);
        assert_eq!(state.heap().len(), 1);
    }

    #[test]
    fn userdata_reachable_through_upvalue_and_metatable() {
        let count = Rc::new(Cell::new(0));
        let mut state = State::new();
        userdata_with_gc(&mut state, &count);
        state.push_closure(NativeFn::new(|_| Ok(0)), 1);
        let holder = TableRef::new();
        let mt = TableRef::new();
        mt.raw_set_str("held", state.pop());
        holder.set_metatable(Some(mt));
        state.push(Value::Table(holder));
        state.set_global("holder").unwrap();
        assert_eq!(state.collect_garbage(), 0);
    }

    #[test]
    fn finalizer_errors_are_swallowed() {
        let mut state = State::new();
        let mt = TableRef::new();
        mt.raw_set_str(
            "__gc",
            Value::Function(FunctionRef::new(
                NativeFn::new(|_| Err(RuntimeError::runtime("finalizer failed"))),
                Vec::new(),
            )),
        );
        state.new_userdata(Rc::new(()));
        state.push(Value::Table(mt));
        state.set_metatable(-2).unwrap();
        state.discard(1);
        assert_eq!(state.collect_garbage(), 1);
        assert_eq!(state.top(), 0);
    }

    #[test]
    fn drop_finalizes_live_userdata() {
        let count = Rc::new(Cell::new(0));
        {
            let mut state = State::new();
            userdata_with_gc(&mut state, &count);
            state.set_global("kept").unwrap();
        }
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn drop_without_finalization() {
        let count = Rc::new(Cell::new(0));
        {
            let mut state = State::with_config(StateConfig::default().with_finalize_on_drop(false));
            userdata_with_gc(&mut state, &count);
        }
        assert_eq!(count.get(), 0);
    }
}
