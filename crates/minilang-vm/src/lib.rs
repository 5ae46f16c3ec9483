//! minilang-vm — the continuation-passing bytecode engine for Minilang.
//!
//! This crate owns everything `minilang-core` deliberately leaves out:
//! the call frame ([`frame`]), the opcode dispatch loop ([`exec`]), the
//! execution context frames share ([`context`]), the cooperative
//! scheduler hook ([`scheduler`]), a handful of iterator-protocol
//! consumers ([`iterfns`]) and the thread-safety audit ([`audit`]).
//!
//! [`Vm`] ties these together: it owns a [`minilang_core::types::TypeRegistry`]
//! and [`minilang_core::method::MethodTable`], installs the built-in
//! `call` slots and typed-fns every value needs to be callable/iterable,
//! and exposes a small embedding surface (§6.1) for constructing values,
//! defining methods, and driving a call to completion.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]
#![cfg_attr(not(debug_assertions), warn(missing_docs))]

pub mod audit;
pub mod context;
pub mod exec;
pub mod frame;
pub mod iterfns;
pub mod scheduler;

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

use minilang_core::compound::{List, Tuple};
use minilang_core::error::{ErrorKind, ErrorValue};
use minilang_core::method::MethodTable;
use minilang_core::types::{TypedFnKey, TypeRegistry};
use minilang_core::value::{CallResult, Caller, NativeFunction, Step, Value};

use crate::context::Context;
use crate::frame::Frame;
use crate::scheduler::Scheduler;

/// Crate-wide result alias.
pub type VmResult<T> = Result<T, VmError>;

/// Errors the VM itself raises, as distinct from script-level
/// [`ErrorValue`]s (which surface through [`Vm::call`]'s `Ok`/`Err`
/// payload unchanged).
#[derive(Debug, Error)]
pub enum VmError {
    /// An uncaught script error propagated all the way to the host.
    #[error("{0}")]
    Script(#[from] ErrorValue),

    /// A task was parked and the scheduler drained without it ever
    /// completing — either a generator that suspended and was dropped,
    /// or a genuine scheduler bug.
    #[error("task never completed: scheduler queue drained with no result")]
    Starved,
}

/// Construction-time knobs for a [`Vm`]: `stack_limit`/`gas_limit`/
/// `trace` plus the fields the scheduler hook (§4.9) and the
/// thread-safety audit (§5) need.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// How many call/iteration opcodes a frame executes before yielding
    /// to the scheduler (§4.9). `u32::MAX` effectively disables
    /// preemption for single-shot, non-cooperative embeddings.
    pub preempt_quantum: u32,
    /// Guards the per-type typed-fn cache and the method dispatch cache
    /// with a spinlock (§5) instead of a bare `RefCell`, for embeddings
    /// that share one `Vm` across threads. Single-threaded embeddings
    /// should leave this `false`.
    pub threaded: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            preempt_quantum: 10_000,
            threaded: false,
        }
    }
}

/// The runtime: a type registry, method table, scheduler and the shared
/// [`Context`] frames resolve them through, with every built-in `call`
/// slot and typed-fn already installed.
pub struct Vm {
    context: Rc<Context>,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm").field("context", &self.context).finish()
    }
}

fn type_error(message: impl Into<String>) -> ErrorValue {
    ErrorValue::new(ErrorKind::TypeError, message.into())
}

impl From<VmError> for ErrorValue {
    fn from(e: VmError) -> Self {
        let message = e.to_string();
        match e {
            VmError::Script(script_err) => script_err,
            VmError::Starved => ErrorValue::new(ErrorKind::InternalError, message),
        }
    }
}

impl Vm {
    /// Build a fresh `Vm`: a new [`TypeRegistry`] and [`MethodTable`],
    /// wired the way `ml_runtime_init` wires `ClosureT`/`ContinuationT`/
    /// `PartialFunctionT`/`MethodT` at process start — every built-in
    /// callable type gets exactly one `call` slot installed here, so
    /// `exec.rs`'s `CALL`/`CONST_CALL` opcodes can stay wholly generic.
    pub fn new(options: VmOptions) -> Self {
        let registry = TypeRegistry::new();
        let methods = Rc::new(MethodTable::new(registry.clone()));
        let scheduler = Rc::new(Scheduler::new(options.threaded));
        let context = Context::new(registry.clone(), methods.clone(), scheduler, options.preempt_quantum);

        install_call_slots(&registry, &methods, &context);
        install_typed_fns(&registry);
        install_arithmetic(&registry, &methods);

        Self { context }
    }

    /// The shared execution context every frame this `Vm` creates
    /// resolves its registry/methods/scheduler through.
    pub fn context(&self) -> &Rc<Context> {
        &self.context
    }

    pub fn registry(&self) -> &Rc<TypeRegistry> {
        &self.context.registry
    }

    pub fn methods(&self) -> &Rc<MethodTable> {
        &self.context.methods
    }

    /// Invoke `callee` with `args` and drive it to completion,
    /// including draining any tasks the preemption quantum (§4.9)
    /// parked along the way. This is the synchronous embedding surface
    /// (§6.1); a cooperative host that wants to interleave other work
    /// between quanta should instead call the `call` slot directly and
    /// pump [`scheduler::Scheduler::drain`] itself.
    pub fn call(&self, callee: Value, args: &[Value]) -> VmResult<Value> {
        let ty = self.context.registry.type_of(&callee);
        let call_slot = ty.call.borrow().clone();
        drive_call(&self.context, move |caller| match call_slot {
            Some(call) => call(caller, &callee, args),
            None => Step::Continue {
                next: caller,
                result: Err(type_error(format!("{callee} is not callable"))),
            },
        })
    }

    /// Register a host-provided callable under `name`, visible to
    /// scripted code as an ordinary method call with that many fixed
    /// arguments (§6.1 "define new types and methods").
    pub fn define_native(
        &self,
        name: &str,
        arg_types: Vec<minilang_core::types::TypeId>,
        callback: Rc<dyn Fn(Rc<dyn Caller>, &[Value]) -> Step>,
    ) {
        let method = self.context.methods.intern(name);
        self.context.methods.define(&method, arg_types, false, callback);
    }

    /// Wrap a host function as a first-class [`Value::Function`],
    /// callable from scripted code without going through the method
    /// table (§6.1's "native functions" surface).
    pub fn native_function(name: &'static str, callback: Rc<dyn Fn(Rc<dyn Caller>, &[Value]) -> Step>) -> Value {
        Value::Function(Rc::new(NativeFunction { name, callback }))
    }
}

/// Build a [`Step`] chain from `build` (handed a fresh [`ResultSink`] as
/// its ultimate caller) and drive it, and anything the scheduler parks
/// along the way, to completion. Shared by [`Vm::call`] and
/// [`iterfns`]'s `iterate`/`key`/`value`/`next` drivers, which each need
/// the same parked-vs-really-done disambiguation (§4.9).
pub(crate) fn drive_call(context: &Rc<Context>, build: impl FnOnce(Rc<dyn Caller>) -> Step) -> VmResult<Value> {
    let sink: Rc<ResultSink> = Rc::new(ResultSink(RefCell::new(None)));
    let step = build(sink.clone());
    drive_discarding(step);

    while sink.0.borrow().is_none() {
        if context.scheduler.is_empty() {
            return Err(VmError::Starved);
        }
        context.scheduler.drain();
    }
    sink.0
        .borrow_mut()
        .take()
        .expect("loop only exits once a result is present")
        .map_err(VmError::Script)
}

/// Drive a [`Step`] chain without trusting its terminal value: a parked
/// frame's synchronous leg also ends in `Step::Done`, so only a result
/// sink that was actually invoked (see [`ResultSink`]) can tell a real
/// completion apart from a parking placeholder.
fn drive_discarding(mut step: Step) {
    loop {
        match step {
            Step::Done(_) => return,
            Step::Continue { next, result } => step = next.run(result),
        }
    }
}

/// A terminal [`Caller`] that records whatever it is resumed with. The
/// top-level driver for [`Vm::call`]; distinguishing "really done" from
/// "parked mid-chain" is exactly what storing into this cell (rather
/// than trusting `Step::Done`'s bare value) buys us.
struct ResultSink(RefCell<Option<CallResult>>);

impl std::fmt::Debug for ResultSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSink").finish()
    }
}

impl Caller for ResultSink {
    fn run(self: Rc<Self>, result: CallResult) -> Step {
        *self.0.borrow_mut() = Some(result.clone());
        Step::Done(result)
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn install_call_slots(registry: &Rc<TypeRegistry>, methods: &Rc<MethodTable>, context: &Rc<Context>) {
    *registry.closure.call.borrow_mut() = Some({
        let context = context.clone();
        Rc::new(move |caller: Rc<dyn Caller>, callee: &Value, args: &[Value]| -> Step {
            let closure = match callee {
                Value::Closure(c) => c.clone(),
                other => return Step::Continue { next: caller, result: Err(type_error(format!("{other} is not a closure"))) },
            };
            match Frame::new(closure, context.clone(), caller.clone(), args) {
                Ok(frame) => frame.run(Ok(Value::Nil)),
                Err(e) => Step::Continue { next: caller, result: Err(e) },
            }
        })
    });

    *registry.partial.call.borrow_mut() = Some({
        let registry = registry.clone();
        Rc::new(move |caller: Rc<dyn Caller>, callee: &Value, args: &[Value]| -> Step {
            let pf = match callee {
                Value::Partial(p) => p.clone(),
                other => return Step::Continue { next: caller, result: Err(type_error(format!("{other} is not a partial function"))) },
            };
            let woven = pf.weave(args);
            let call_slot = registry.type_of(&pf.function).call.borrow().clone();
            match call_slot {
                Some(call) => call(caller, &pf.function, &woven),
                None => Step::Continue {
                    next: caller,
                    result: Err(type_error(format!("{} is not callable", pf.function))),
                },
            }
        })
    });

    *registry.function.call.borrow_mut() = Some(Rc::new(|caller: Rc<dyn Caller>, callee: &Value, args: &[Value]| -> Step {
        match callee {
            Value::Function(n) => (n.callback)(caller, args),
            other => Step::Continue { next: caller, result: Err(type_error(format!("{other} is not a function"))) },
        }
    }));

    *registry.continuation.call.borrow_mut() = Some(Rc::new(|caller: Rc<dyn Caller>, callee: &Value, args: &[Value]| -> Step {
        let cont = match callee {
            Value::Continuation(c) => c.clone(),
            other => return Step::Continue { next: caller, result: Err(type_error(format!("{other} is not a continuation"))) },
        };
        let value = args.first().cloned().unwrap_or(Value::Nil);
        if let Some(target_frame) = cont.as_any().downcast_ref::<Frame>() {
            target_frame.rebind_caller(caller);
        }
        Step::Continue { next: cont, result: Ok(value) }
    }));

    *registry.method.call.borrow_mut() = Some({
        let methods = methods.clone();
        Rc::new(move |caller: Rc<dyn Caller>, callee: &Value, args: &[Value]| -> Step {
            let m = match callee {
                Value::Method(m) => m.clone(),
                other => return Step::Continue { next: caller, result: Err(type_error(format!("{other} is not a method"))) },
            };
            methods.dispatch(&m, caller, args)
        })
    });
}

/// Wire `ITERATE`/`VALUE`/`KEY`/`NEXT` the way `ml_runtime_init` wires
/// `ClosureT` and `ContinuationT`: a closure is iterated by calling it
/// with no arguments (starting the generator); a continuation's `VALUE`
/// peeks the last value its frame pushed before `SUSPEND` and `KEY`
/// peeks the slot just below it — the `key, value` pair a `susp key,
/// value` expression always pushes together, key (or `Nil` if the
/// expression omitted one) first — and `NEXT` resumes it with `Nil`,
/// relying on `RETURN nil` vs. another `SUSPEND` to signal exhaustion
/// vs. advance.
fn install_typed_fns(registry: &Rc<TypeRegistry>) {
    registry.closure.set_typed_fn(TypedFnKey::ITERATE, {
        let registry = registry.clone();
        Rc::new(move |caller, receiver| {
            let call = registry
                .closure
                .call
                .borrow()
                .clone()
                .expect("closure call slot installed by install_call_slots");
            call(caller, receiver, &[])
        })
    });

    registry.continuation.set_typed_fn(TypedFnKey::VALUE, Rc::new(|_caller, receiver| {
        let v = continuation_frame(receiver).map(|f| f.top()).unwrap_or(Value::Nil);
        Step::Done(Ok(v))
    }));
    registry.continuation.set_typed_fn(TypedFnKey::KEY, Rc::new(|_caller, receiver| {
        let v = continuation_frame(receiver).map(|f| f.top_key()).unwrap_or(Value::Nil);
        Step::Done(Ok(v))
    }));
    registry.continuation.set_typed_fn(TypedFnKey::NEXT, Rc::new(|caller, receiver| {
        let cont = match receiver {
            Value::Continuation(c) => c.clone(),
            _ => return Step::Done(Err(type_error("next() on a non-continuation"))),
        };
        if let Some(target_frame) = cont.as_any().downcast_ref::<Frame>() {
            target_frame.rebind_caller(caller);
        }
        cont.run(Ok(Value::Nil))
    }));

    install_list_iteration(registry);
}

/// A list iterates as `(list, 0-based index)` tuples: `value`/`key` read
/// straight through [`List::get`] rather than walking node-by-node, and
/// `next` just advances the index, falling back to `Nil` once it runs
/// off the end (§4.4, `ml_list_iterate` in spirit though not by name).
fn install_list_iteration(registry: &Rc<TypeRegistry>) {
    registry.list.set_typed_fn(TypedFnKey::ITERATE, Rc::new(|_caller, receiver| {
        let list = match receiver {
            Value::List(l) => l.clone(),
            other => return Step::Done(Err(type_error(format!("{other} is not a list")))),
        };
        let len = list.borrow().length;
        let result = if len == 0 {
            Ok(Value::Nil)
        } else {
            Ok(Value::Tuple(Tuple::new(vec![Value::List(list), Value::Integer(0)])))
        };
        Step::Done(result)
    }));

    registry.list.set_typed_fn(TypedFnKey::VALUE, Rc::new(|_caller, receiver| {
        Step::Done(list_cursor(receiver).map(|(list, idx)| list.borrow_mut().get(idx).unwrap_or(Value::Nil)))
    }));

    registry.list.set_typed_fn(TypedFnKey::KEY, Rc::new(|_caller, receiver| {
        Step::Done(list_cursor(receiver).map(|(_, idx)| Value::Integer(idx as i64 + 1)))
    }));

    registry.list.set_typed_fn(TypedFnKey::NEXT, Rc::new(|_caller, receiver| {
        Step::Done(list_cursor(receiver).map(|(list, idx)| {
            let next_idx = idx + 1;
            if next_idx >= list.borrow().length {
                Value::Nil
            } else {
                Value::Tuple(Tuple::new(vec![Value::List(list), Value::Integer(next_idx as i64)]))
            }
        }))
    }));
}

fn list_cursor(cursor: &Value) -> Result<(Rc<RefCell<List>>, usize), ErrorValue> {
    match cursor {
        Value::Tuple(t) if t.values.len() == 2 => match (&t.values[0], &t.values[1]) {
            (Value::List(l), Value::Integer(i)) => Ok((l.clone(), *i as usize)),
            _ => Err(type_error("malformed list cursor")),
        },
        other => Err(type_error(format!("{other} is not a list cursor"))),
    }
}

fn continuation_frame(v: &Value) -> Option<&Frame> {
    match v {
        Value::Continuation(c) => c.as_any().downcast_ref::<Frame>(),
        _ => None,
    }
}

/// Arithmetic and comparison over `Integer`/`Real`, promoting to `Real`
/// on a mismatch. Not part of the core's own scope (§1's "concrete
/// library types" are a non-goal) but the minimum a method-dispatch VM
/// needs to run anything: without these, `spec.md` §8's testable
/// dispatch properties have nothing to dispatch.
///
/// Every callback hands its result to `caller` via `Step::Continue`
/// rather than `Step::Done`: a native method invoked from `CALL`/
/// `CONST_CALL` inside a live frame must resume that frame's own
/// `RESULT`/`RETURN` opcodes, not unwind the whole chain in place —
/// `Step::Done` is reserved for callers that really are the origin
/// (a one-shot `dispatch_sync` sink, for instance).
fn install_arithmetic(registry: &Rc<TypeRegistry>, methods: &Rc<MethodTable>) {
    macro_rules! numeric_binop {
        ($name:literal, $int_op:expr, $real_op:expr) => {{
            let method = methods.intern($name);
            methods.define(&method, vec![registry.integer.id, registry.integer.id], false, {
                let f: fn(i64, i64) -> i64 = $int_op;
                Rc::new(move |caller: Rc<dyn Caller>, args: &[Value]| -> Step {
                    let a = as_integer(&args[0]);
                    let b = as_integer(&args[1]);
                    Step::Continue { next: caller, result: Ok(Value::Integer(f(a, b))) }
                })
            });
            methods.define(&method, vec![registry.number.id, registry.number.id], false, {
                let f: fn(f64, f64) -> f64 = $real_op;
                Rc::new(move |caller: Rc<dyn Caller>, args: &[Value]| -> Step {
                    let a = as_real(&args[0]);
                    let b = as_real(&args[1]);
                    Step::Continue { next: caller, result: Ok(Value::Real(f(a, b))) }
                })
            });
        }};
    }

    numeric_binop!("+", |a, b| a.wrapping_add(b), |a, b| a + b);
    numeric_binop!("-", |a, b| a.wrapping_sub(b), |a, b| a - b);
    numeric_binop!("*", |a, b| a.wrapping_mul(b), |a, b| a * b);

    let div = methods.intern("/");
    methods.define(&div, vec![registry.number.id, registry.number.id], false, {
        Rc::new(|caller: Rc<dyn Caller>, args: &[Value]| -> Step {
            let a = as_real(&args[0]);
            let b = as_real(&args[1]);
            let result = if b == 0.0 {
                Err(ErrorValue::new(ErrorKind::ValueError, "division by zero"))
            } else {
                Ok(Value::Real(a / b))
            };
            Step::Continue { next: caller, result }
        })
    });

    macro_rules! numeric_cmp {
        ($name:literal, $op:tt) => {{
            let method = methods.intern($name);
            methods.define(&method, vec![registry.number.id, registry.number.id], false, {
                Rc::new(|caller: Rc<dyn Caller>, args: &[Value]| -> Step {
                    let a = as_real(&args[0]);
                    let b = as_real(&args[1]);
                    Step::Continue { next: caller, result: Ok(Value::Bool(a $op b)) }
                })
            });
        }};
    }
    numeric_cmp!("<", <);
    numeric_cmp!("<=", <=);
    numeric_cmp!(">", >);
    numeric_cmp!(">=", >=);

    let eq = methods.intern("=");
    methods.define(&eq, vec![registry.any.id, registry.any.id], false, Rc::new(|caller: Rc<dyn Caller>, args: &[Value]| -> Step {
        Step::Continue { next: caller, result: Ok(Value::Bool(values_equal(&args[0], &args[1]))) }
    }));

    let concat = methods.intern("+");
    methods.define(&concat, vec![registry.string.id, registry.string.id], false, Rc::new(|caller: Rc<dyn Caller>, args: &[Value]| -> Step {
        let a = as_str(&args[0]);
        let b = as_str(&args[1]);
        Step::Continue { next: caller, result: Ok(Value::str(format!("{a}{b}"))) }
    }));
}

fn as_integer(v: &Value) -> i64 {
    match v.deref() {
        Value::Integer(i) => i,
        Value::Real(r) => r as i64,
        _ => 0,
    }
}

fn as_real(v: &Value) -> f64 {
    match v.deref() {
        Value::Integer(i) => i as f64,
        Value::Real(r) => r,
        _ => 0.0,
    }
}

fn as_str(v: &Value) -> Rc<str> {
    match v.deref() {
        Value::Str(s) => s,
        other => other.to_string().into(),
    }
}

/// The default `(Any, Any)` rule for `=`: structural equality, the same
/// notion `compound::Map` uses for its keys, so `m.get(k)` and
/// `k = other_key` never disagree.
fn values_equal(a: &Value, b: &Value) -> bool {
    minilang_core::value::values_deep_equal(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use minilang_core::bytecode::{ClosureInfo, Inst, Op, Param, Source};
    use minilang_core::value::Closure;

    fn src() -> Source {
        Source { name: "t.ml".into(), line: 1 }
    }

    #[test]
    fn calling_a_closure_runs_it_to_return() {
        let vm = Vm::new(VmOptions::default());
        // `fn(x) return x + 1 end`, compiled by hand: LOCAL 0; LOAD 1;
        // CONST_CALL 2 "+"; RESULT; RETURN.
        let ret = Inst::new(Op::Return, src(), vec![]);
        let result_inst = Inst::new(Op::Result, src(), vec![]);
        result_inst.link(ret.clone());
        let plus = vm.methods().intern("+");
        let call_inst = Inst::new(Op::ConstCall, src(), vec![Param::Count(2), Param::Value(Value::Method(plus))]);
        call_inst.link(result_inst.clone());
        let load_inst = Inst::new(Op::Load, src(), vec![Param::Value(Value::Integer(1))]);
        load_inst.link(call_inst.clone());
        let local_inst = Inst::new(Op::Local, src(), vec![Param::Index(0)]);
        local_inst.link(load_inst.clone());

        let info = ClosureInfo::new(local_inst, 1, 1, 0, vec!["x".into()], None, Some("f".into()));
        let closure = Rc::new(Closure { info: Rc::new(info), upvalues: vec![], ty: None });

        let result = vm.call(Value::Closure(closure), &[Value::Integer(41)]).unwrap();
        assert!(matches!(result, Value::Integer(42)));
    }

    #[test]
    fn calling_a_non_callable_value_is_a_type_error() {
        let vm = Vm::new(VmOptions::default());
        let err = vm.call(Value::Integer(5), &[]).unwrap_err();
        assert!(matches!(err, VmError::Script(e) if e.kind == ErrorKind::TypeError));
    }

    #[test]
    fn method_dispatch_promotes_to_real_on_mismatch() {
        let vm = Vm::new(VmOptions::default());
        let plus = vm.methods().intern("+");
        let result = minilang_core::method::dispatch_sync(vm.methods(), &plus, &[Value::Integer(1), Value::Real(2.5)]).unwrap();
        match result {
            Value::Real(r) => assert!((r - 3.5).abs() < f64::EPSILON),
            other => panic!("expected a real, got {other:?}"),
        }
    }
}
