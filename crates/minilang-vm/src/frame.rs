//! The call frame (§3.4, §4.7): a heap-allocated activation record that
//! implements [`Caller`] itself, so a suspended frame is just an
//! ordinary value that can be handed around and resumed later.
//!
//! Grounded in `ml_runtime.c`'s `ml_frame_t` (the `Caller` base struct
//! plus `Top`/`Stack`/`OnError` fields) and in §4.7's description of
//! frame creation, `RETURN` and `SUSPEND`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use minilang_core::bytecode::{ClosureInfo, Decl, Inst};
use minilang_core::compound::Names;
use minilang_core::error::{ErrorKind, ErrorValue};
use minilang_core::value::{CallResult, Caller, Closure, Gc, Reference, Step, Value};

use crate::context::Context;

/// One activation record. `stack` plays the dual role §3.4 describes:
/// the bottom `frame_size` slots are the closure's declared locals
/// (parameters boxed in [`Reference`] cells so `VAR`/`ASSIGN` can
/// mutate them through a value alone), and values pushed above that by
/// `PUSH`/expression evaluation are ordinary temporaries.
pub struct Frame {
    pub closure: Rc<Closure>,
    pub context: Rc<Context>,
    /// Who resumes once this frame produces a final `RETURN`. Mutable
    /// because resuming a suspended frame with a *new* caller (`all`,
    /// `map`, any generator consumer) rebinds it — the frame's eventual
    /// return must go back to whoever drove the most recent resumption,
    /// not whoever first called it (§4.7, §4.9).
    pub caller: RefCell<Rc<dyn Caller>>,
    pub inst: RefCell<Rc<Inst>>,
    pub stack: RefCell<Vec<Value>>,
    /// The instruction a `TRY` scope installed as its handler, or `None`
    /// if an error here should propagate straight to `caller` (§4.8).
    pub on_error: RefCell<Option<Rc<Inst>>>,
    pub decls: RefCell<Option<Rc<Decl>>>,
    /// Set once `RETURN` has actually fired; resuming a frame again
    /// after that is a no-op (§4.7 "a frame that has already returned
    /// ignores further resumption").
    pub done: Cell<bool>,
    preempt_remaining: Cell<u32>,
    /// When a suspending opcode (`KEY`, `VALUE`) hands off control, the
    /// local slot its result must land in once resumed, bypassing the
    /// ordinary `RESULT`/`PUSH_RESULT` stack path.
    pub pending_store: Cell<Option<usize>>,
    /// When `ITER`/`NEXT` hands off control, where to jump if the
    /// resumed value turns out to be falsy (sequence exhausted) instead
    /// of pushing it and falling through to the loop body.
    pub iter_exit: RefCell<Option<Rc<Inst>>>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("closure", &self.closure.info.name)
            .field("done", &self.done.get())
            .finish()
    }
}

impl Frame {
    /// Build a frame for `closure` and seed its parameter slots from
    /// `args`, applying named-argument matching when the first argument
    /// is a [`Names`] list (§4.10) and otherwise matching positionally.
    /// Extra positional arguments on a variadic closure are collected
    /// into the slot just past the named parameters.
    pub fn new(closure: Rc<Closure>, context: Rc<Context>, caller: Rc<dyn Caller>, args: &[Value]) -> Result<Rc<Self>, ErrorValue> {
        let info = &closure.info;
        let frame_size = info.frame_size as usize;
        let arity = info.named_arity() as usize;

        let (names, values): (Option<&Names>, &[Value]) = match args.first() {
            Some(Value::Names(n)) => (Some(n.as_ref()), &args[1..]),
            _ => (None, args),
        };

        let mut slots: Vec<Value> = vec![Value::Nil; arity];
        let mut extra: Vec<Value> = Vec::new();

        if let Some(names) = names {
            for (name, value) in names.names.iter().zip(values.iter()) {
                match info.param_names.iter().position(|p| p.as_ref() == name.as_str()) {
                    Some(idx) if idx < arity => slots[idx] = value.clone(),
                    _ => {
                        return Err(ErrorValue::new(
                            ErrorKind::CallError,
                            format!("no such parameter `{name}`"),
                        ))
                    }
                }
            }
        } else {
            for (idx, value) in values.iter().enumerate() {
                if idx < arity {
                    slots[idx] = value.clone();
                } else {
                    extra.push(value.clone());
                }
            }
        }

        if info.is_variadic() {
            let rest = minilang_core::compound::List::from_vec(extra);
            slots.push(Value::List(Rc::new(RefCell::new(rest))));
        } else if !extra.is_empty() {
            return Err(ErrorValue::new(
                ErrorKind::CallError,
                format!("too many arguments: expected {arity}, got {}", arity + extra.len()),
            ));
        }

        let mut stack: Vec<Value> = Vec::with_capacity(frame_size.max(slots.len()));
        for slot in slots {
            let cell: Gc<Value> = Rc::new(RefCell::new(slot));
            stack.push(Value::Reference(Reference(cell)));
        }
        while stack.len() < frame_size {
            stack.push(Value::Nil);
        }

        Ok(Rc::new(Frame {
            closure,
            context: context.clone(),
            caller: RefCell::new(caller),
            inst: RefCell::new(info.entry.clone()),
            stack: RefCell::new(stack),
            on_error: RefCell::new(None),
            decls: RefCell::new(info.decls.clone()),
            done: Cell::new(false),
            preempt_remaining: Cell::new(context.preempt_quantum),
            pending_store: Cell::new(None),
            iter_exit: RefCell::new(None),
        }))
    }

    /// The declared-local slot at `index`, as boxed by [`Frame::new`].
    pub fn local(&self, index: usize) -> Value {
        self.stack.borrow()[index].clone()
    }

    pub fn upvalue(&self, index: usize) -> Value {
        Value::Reference(Reference(self.closure.upvalues[index].clone()))
    }

    pub fn push(&self, v: Value) {
        self.stack.borrow_mut().push(v);
    }

    pub fn pop(&self) -> Value {
        self.stack
            .borrow_mut()
            .pop()
            .expect("bytecode pops more values than it pushed")
    }

    /// Advance to `next`, consuming one unit of the preemption quantum
    /// (§4.9). Returns `true` once the quantum is exhausted and the
    /// frame should park itself with the scheduler instead of continuing
    /// inline.
    pub fn goto(&self, next: Rc<Inst>) -> bool {
        *self.inst.borrow_mut() = next;
        let remaining = self.preempt_remaining.get();
        if remaining == 0 {
            self.preempt_remaining.set(self.context.preempt_quantum);
            true
        } else {
            self.preempt_remaining.set(remaining - 1);
            false
        }
    }

    pub fn rebind_caller(&self, caller: Rc<dyn Caller>) {
        *self.caller.borrow_mut() = caller;
    }

    /// Peek the value sitting on top of the stack without popping it —
    /// what a suspended generator frame last pushed before `SUSPEND`,
    /// used by the `Continuation` type's `VALUE` typed-fn.
    pub fn top(&self) -> Value {
        self.stack.borrow().last().cloned().unwrap_or(Value::Nil)
    }

    /// Peek the slot just below the top — the key half of the `key,
    /// value` pair a `susp key, value` expression pushes before
    /// `SUSPEND` (the key, or `Nil` if the expression omitted one, is
    /// always pushed first), used by the `Continuation` type's `KEY`
    /// typed-fn.
    pub fn top_key(&self) -> Value {
        let stack = self.stack.borrow();
        let len = stack.len();
        if len >= 2 {
            stack[len - 2].clone()
        } else {
            Value::Nil
        }
    }
}

impl Caller for Frame {
    fn run(self: Rc<Self>, result: CallResult) -> Step {
        if self.done.get() {
            return Step::Done(Ok(Value::Nil));
        }
        crate::exec::step(self, result)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::scheduler::Scheduler;
    use minilang_core::bytecode::{Op, Source};
    use minilang_core::method::MethodTable;
    use minilang_core::types::TypeRegistry;

    fn src() -> Source {
        Source {
            name: "t.ml".into(),
            line: 1,
        }
    }

    fn test_context() -> Rc<Context> {
        let registry = TypeRegistry::new();
        let methods = Rc::new(MethodTable::new(registry.clone()));
        let scheduler = Rc::new(Scheduler::new(false));
        Context::new(registry, methods, scheduler, 1000)
    }

    struct Sink;
    impl Caller for Sink {
        fn run(self: Rc<Self>, result: CallResult) -> Step {
            Step::Done(result)
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn simple_closure(num_params: i32, frame_size: u32) -> Rc<Closure> {
        let ret = Inst::new(Op::Return, src(), vec![]);
        let info = ClosureInfo::new(ret, frame_size, num_params, 0, vec!["x".into()], None, Some("f".into()));
        Rc::new(Closure {
            info: Rc::new(info),
            upvalues: vec![],
            ty: None,
        })
    }

    #[test]
    fn positional_args_fill_named_slots() {
        let closure = simple_closure(1, 1);
        let context = test_context();
        let frame = Frame::new(closure, context, Rc::new(Sink), &[Value::Integer(42)]).unwrap();
        match frame.local(0) {
            Value::Reference(r) => assert!(matches!(*r.0.borrow(), Value::Integer(42))),
            other => panic!("expected reference slot, got {other:?}"),
        }
    }

    #[test]
    fn too_many_positional_args_on_fixed_arity_is_a_call_error() {
        let closure = simple_closure(1, 1);
        let context = test_context();
        let err = Frame::new(closure, context, Rc::new(Sink), &[Value::Integer(1), Value::Integer(2)]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CallError);
    }

    #[test]
    fn variadic_closure_collects_extra_args_into_a_list() {
        let closure = simple_closure(!0i32, 1);
        let context = test_context();
        let frame = Frame::new(closure, context, Rc::new(Sink), &[Value::Integer(1), Value::Integer(2)]).unwrap();
        match frame.local(0) {
            Value::Reference(r) => match &*r.0.borrow() {
                Value::List(l) => assert_eq!(l.borrow().length, 2),
                other => panic!("expected list, got {other:?}"),
            },
            other => panic!("expected reference slot, got {other:?}"),
        }
    }
}
