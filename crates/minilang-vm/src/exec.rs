//! The opcode dispatch loop (§3.7, §4.6-§4.9): decodes instructions from
//! the frame's current position and executes them natively until one
//! hands control to another [`Caller`] (a call, an iteration step, a
//! suspend/resume) or the frame terminates.
//!
//! Grounded in `ml_runtime.c`'s `ml_frame_run` computed-goto loop: the
//! same uniform "check the incoming result, then switch on the opcode"
//! shape, just as an ordinary Rust `match` instead of label addresses.

use std::cell::RefCell;
use std::rc::Rc;

use minilang_core::bytecode::{Decl, Inst, Param};
use minilang_core::bytecode::op::Op;
use minilang_core::compound::{List, Map, PartialFunction, StringBuffer, Tuple};
use minilang_core::error::{ErrorKind, ErrorValue};
use minilang_core::value::{CallResult, Caller, Closure, Reference, Step, Value};

use crate::frame::Frame;

/// Number of links in a decl chain, used to size the slot range a scope
/// pushed (`ENTER`) and to unwind back out of it (`EXIT`, `CATCH`).
fn decl_chain_len(decl: &Option<Rc<Decl>>) -> usize {
    let mut n = 0;
    let mut cursor = decl.clone();
    while let Some(d) = cursor {
        n += 1;
        cursor = d.next.clone();
    }
    n
}

fn type_error(message: impl Into<String>) -> ErrorValue {
    ErrorValue::new(ErrorKind::TypeError, message.into())
}

fn count_param(inst: &Inst, idx: usize) -> i64 {
    match &inst.params[idx] {
        Param::Count(c) => *c,
        other => panic!("expected Count param, found {other:?}"),
    }
}

fn index_param(inst: &Inst) -> usize {
    match &inst.params[0] {
        Param::Index(i) => *i as usize,
        other => panic!("expected Index param, found {other:?}"),
    }
}

fn value_param(inst: &Inst) -> Value {
    match &inst.params[0] {
        Param::Value(v) => v.clone(),
        other => panic!("expected Value param, found {other:?}"),
    }
}

fn decl_param(inst: &Inst) -> Option<Rc<Decl>> {
    match &inst.params[0] {
        Param::Decl(d) => d.clone(),
        other => panic!("expected Decl param, found {other:?}"),
    }
}

fn inst_param(inst: &Inst, idx: usize) -> Rc<Inst> {
    match &inst.params[idx] {
        Param::Inst(i) => i.clone(),
        other => panic!("expected Inst param, found {other:?}"),
    }
}

/// Pop the bottom-to-top evaluated arguments of a fixed-arity
/// construction/call opcode back into source order.
fn pop_n(frame: &Rc<Frame>, n: usize) -> Vec<Value> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(frame.pop());
    }
    out.reverse();
    out
}

/// Write `value` through the reference cell already occupying local
/// slot `index` (the `VAR` family's "rebind through an existing box").
fn write_through(frame: &Rc<Frame>, index: usize, value: Value) -> CallResult {
    frame.local(index).assign(value)
}

/// Resolve a `REF`-built upvalue/local source for `CLOSURE`'s trailing
/// index params: an existing boxed local is captured by its own cell;
/// an unboxed one is wrapped fresh (matching the compiler's convention
/// that `CLOSURE` may also capture plain `LET` locals by value-at-time).
fn capture_cell(frame: &Rc<Frame>, index: usize) -> minilang_core::value::Gc<Value> {
    match frame.local(index) {
        Value::Reference(r) => r.0,
        other => Rc::new(RefCell::new(other)),
    }
}

/// Advance to `next`, parking this frame with the scheduler and ending
/// this synchronous leg if doing so exhausted the preemption quantum
/// (§4.9). Returns `None` when execution should keep going inline.
fn goto_checked(frame: &Rc<Frame>, next: Rc<Inst>) -> Option<Step> {
    if frame.goto(next) {
        frame.context.scheduler.park(frame.clone(), Ok(Value::Nil));
        Some(Step::Done(Ok(Value::Nil)))
    } else {
        None
    }
}

/// Run `frame` from its current instruction, feeding in `incoming` as
/// the result of whatever it was last waiting on (a dummy `Ok(Nil)` on
/// first entry). Executes natively until a hand-off or terminal opcode
/// produces a `Step` to return to the caller's trampoline.
pub fn step(frame: Rc<Frame>, incoming: CallResult) -> Step {
    let mut pending = incoming;

    loop {
        let inst = frame.inst.borrow().clone();

        if inst.op != Op::Catch {
            if let Err(mut e) = pending {
                e.push_trace(inst.source.name.to_string(), inst.source.line);
                let handler = frame.on_error.borrow_mut().take();
                return match handler {
                    Some(target) => {
                        *frame.inst.borrow_mut() = target;
                        step(frame.clone(), Err(e))
                    }
                    None => Step::Continue {
                        next: frame.caller.borrow().clone(),
                        result: Err(e),
                    },
                };
            }
        }

        // Suspending ops (`KEY`/`VALUE`) resumed with a value destined
        // for a specific local slot rather than the stack.
        if let Some(idx) = frame.pending_store.take() {
            if let Ok(v) = &pending {
                if let Err(e) = write_through(&frame, idx, v.clone()) {
                    pending = Err(e);
                    continue;
                }
            }
        }

        // `ITER`/`NEXT` resumed: falsy means the sequence is exhausted.
        if let Some(exit) = frame.iter_exit.borrow_mut().take() {
            match &pending {
                Ok(v) if !v.is_truthy() => {
                    *frame.inst.borrow_mut() = exit;
                    continue;
                }
                Ok(v) => frame.push(v.clone()),
                Err(_) => unreachable!("errors are handled by the chokepoint above"),
            }
        }

        macro_rules! fallthrough {
            () => {{
                match inst.next() {
                    Some(n) => {
                        if let Some(parked) = goto_checked(&frame, n) {
                            return parked;
                        }
                    }
                    None => {
                        // No linked successor and this opcode didn't
                        // return on its own: an emitter bug, but the
                        // safest response is to end the frame rather
                        // than loop on a dangling instruction.
                        frame.done.set(true);
                        return Step::Continue {
                            next: frame.caller.borrow().clone(),
                            result: Ok(Value::Nil),
                        };
                    }
                }
                pending = Ok(Value::Nil);
                continue;
            }};
        }

        match inst.op {
            Op::Nil => {
                frame.push(Value::Nil);
                fallthrough!()
            }
            Op::Some => {
                frame.push(Value::Some);
                fallthrough!()
            }
            Op::Load => {
                frame.push(value_param(&inst));
                fallthrough!()
            }
            Op::Push => {
                let top = frame.stack.borrow().last().cloned().unwrap_or(Value::Nil);
                frame.push(top);
                fallthrough!()
            }
            Op::Pop => {
                frame.pop();
                fallthrough!()
            }
            Op::PushResult | Op::Result => {
                // Materialise the CPS value a preceding CALL/ITER/etc
                // handed back; by the time we reach here `pending` is
                // always `Ok` (errors were intercepted above).
                if let Ok(v) = pending.clone() {
                    frame.push(v);
                }
                fallthrough!()
            }

            Op::Local => {
                let idx = index_param(&inst);
                frame.push(frame.local(idx).deref());
                fallthrough!()
            }
            Op::Upvalue => {
                let idx = index_param(&inst);
                frame.push(frame.upvalue(idx).deref());
                fallthrough!()
            }
            Op::Enter => {
                let n_vars = count_param(&inst, 0) as usize;
                let n_lets = count_param(&inst, 1) as usize;
                for _ in 0..n_vars {
                    frame.push(Value::Reference(Reference(Rc::new(RefCell::new(Value::Nil)))));
                }
                for _ in 0..n_lets {
                    frame.push(Value::Nil);
                }
                let mut decls = frame.decls.borrow().clone();
                for _ in 0..(n_vars + n_lets) {
                    decls = Some(Rc::new(Decl {
                        name: "_".into(),
                        index: 0,
                        is_upvalue: false,
                        next: decls,
                    }));
                }
                *frame.decls.borrow_mut() = decls;
                fallthrough!()
            }
            Op::Exit => {
                let target = decl_param(&inst);
                let current_len = decl_chain_len(&frame.decls.borrow());
                let target_len = decl_chain_len(&target);
                let dropped = current_len.saturating_sub(target_len);
                {
                    let mut stack = frame.stack.borrow_mut();
                    let new_len = stack.len().saturating_sub(dropped);
                    stack.truncate(new_len);
                }
                *frame.decls.borrow_mut() = target;
                fallthrough!()
            }
            Op::Var | Op::VarType => {
                let idx = index_param(&inst);
                let v = frame.pop();
                if let Err(e) = write_through(&frame, idx, v) {
                    pending = Err(e);
                    continue;
                }
                fallthrough!()
            }
            Op::Let => {
                let idx = index_param(&inst);
                let v = frame.pop();
                frame.stack.borrow_mut()[idx] = v;
                fallthrough!()
            }
            Op::LetI => {
                let idx = index_param(&inst);
                let v = frame.pop();
                if let Value::Uninitialized(_) = frame.local(idx) {
                    if let Err(e) = frame.local(idx).assign(v.clone()) {
                        pending = Err(e);
                        continue;
                    }
                }
                frame.stack.borrow_mut()[idx] = v;
                fallthrough!()
            }
            Op::Ref => {
                let idx = index_param(&inst);
                let v = frame.pop();
                frame.stack.borrow_mut()[idx] = Value::Reference(Reference(Rc::new(RefCell::new(v))));
                fallthrough!()
            }
            Op::RefI => {
                let idx = index_param(&inst);
                let v = frame.pop();
                if let Value::Uninitialized(_) = frame.local(idx) {
                    if let Err(e) = frame.local(idx).assign(v.clone()) {
                        pending = Err(e);
                        continue;
                    }
                }
                frame.stack.borrow_mut()[idx] = Value::Reference(Reference(Rc::new(RefCell::new(v))));
                fallthrough!()
            }
            Op::VarX | Op::LetX | Op::RefX => {
                let n = count_param(&inst, 0) as usize;
                let src = frame.pop();
                let tuple = match src.deref() {
                    Value::Tuple(t) => t,
                    other => {
                        pending = Err(type_error(format!("cannot destructure {other}")));
                        continue;
                    }
                };
                let base = frame.stack.borrow().len().saturating_sub(n);
                for i in 0..n {
                    let v = tuple.values.get(i).cloned().unwrap_or(Value::Nil);
                    let slot = base + i;
                    match inst.op {
                        Op::VarX => {
                            if let Err(e) = write_through(&frame, slot, v) {
                                pending = Err(e);
                                break;
                            }
                        }
                        Op::LetX => frame.stack.borrow_mut()[slot] = v,
                        Op::RefX => {
                            frame.stack.borrow_mut()[slot] = Value::Reference(Reference(Rc::new(RefCell::new(v))))
                        }
                        _ => unreachable!(),
                    }
                }
                if matches!(pending, Err(_)) {
                    continue;
                }
                fallthrough!()
            }

            Op::Goto | Op::Link => {
                let target = inst_param(&inst, 0);
                if let Some(parked) = goto_checked(&frame, target) {
                    return parked;
                }
                pending = Ok(Value::Nil);
                continue;
            }
            Op::If => {
                let v = frame.pop();
                let target = if v.is_truthy() { inst_param(&inst, 1) } else { inst_param(&inst, 0) };
                if let Some(parked) = goto_checked(&frame, target) {
                    return parked;
                }
                pending = Ok(Value::Nil);
                continue;
            }
            Op::IfVar | Op::IfLet => {
                let v = frame.pop();
                if v.is_truthy() {
                    frame.push(v);
                    let target = inst_param(&inst, 1);
                    if let Some(parked) = goto_checked(&frame, target) {
                        return parked;
                    }
                } else {
                    let target = inst_param(&inst, 0);
                    if let Some(parked) = goto_checked(&frame, target) {
                        return parked;
                    }
                }
                pending = Ok(Value::Nil);
                continue;
            }
            Op::Else => {
                let v = frame.pop();
                let target = if v.is_truthy() { inst_param(&inst, 0) } else { inst_param(&inst, 1) };
                if let Some(parked) = goto_checked(&frame, target) {
                    return parked;
                }
                pending = Ok(Value::Nil);
                continue;
            }
            Op::And => {
                let v = frame.pop();
                if !v.is_truthy() {
                    frame.push(v);
                    let target = inst_param(&inst, 0);
                    if let Some(parked) = goto_checked(&frame, target) {
                        return parked;
                    }
                    pending = Ok(Value::Nil);
                    continue;
                }
                fallthrough!()
            }
            Op::Or => {
                let v = frame.pop();
                if v.is_truthy() {
                    frame.push(v);
                    let target = inst_param(&inst, 0);
                    if let Some(parked) = goto_checked(&frame, target) {
                        return parked;
                    }
                    pending = Ok(Value::Nil);
                    continue;
                }
                fallthrough!()
            }

            Op::For => {
                let v = frame.pop();
                if let Some(n) = inst.next() {
                    if let Some(parked) = goto_checked(&frame, n) {
                        return parked;
                    }
                }
                return minilang_core::iter::iterate(
                    &frame.context.registry,
                    &frame.context.methods,
                    frame.clone(),
                    &v,
                );
            }
            Op::Iter => {
                // The iterator FOR produced is already sitting on the
                // stack (pushed by the RESULT/PUSH_RESULT that follows
                // FOR's hand-off); this check is purely local, no
                // further dispatch needed.
                let top = frame.stack.borrow().last().cloned().unwrap_or(Value::Nil);
                if !top.is_truthy() {
                    frame.pop();
                    let target = inst_param(&inst, 0);
                    if let Some(parked) = goto_checked(&frame, target) {
                        return parked;
                    }
                    pending = Ok(Value::Nil);
                    continue;
                }
                fallthrough!()
            }
            Op::Next => {
                let target = inst_param(&inst, 0);
                *frame.iter_exit.borrow_mut() = Some(target);
                let it = frame.pop();
                if let Some(n) = inst.next() {
                    if let Some(parked) = goto_checked(&frame, n) {
                        return parked;
                    }
                }
                return minilang_core::iter::next(
                    &frame.context.registry,
                    &frame.context.methods,
                    frame.clone(),
                    &it,
                );
            }
            Op::Key => {
                let idx = index_param(&inst);
                let it = frame.stack.borrow().last().cloned().unwrap_or(Value::Nil);
                frame.pending_store.set(Some(idx));
                if let Some(n) = inst.next() {
                    if let Some(parked) = goto_checked(&frame, n) {
                        return parked;
                    }
                }
                return minilang_core::iter::key(
                    &frame.context.registry,
                    &frame.context.methods,
                    frame.clone(),
                    &it,
                );
            }
            Op::Value => {
                let idx = index_param(&inst);
                let it = frame.stack.borrow().last().cloned().unwrap_or(Value::Nil);
                frame.pending_store.set(Some(idx));
                if let Some(n) = inst.next() {
                    if let Some(parked) = goto_checked(&frame, n) {
                        return parked;
                    }
                }
                return minilang_core::iter::value(
                    &frame.context.registry,
                    &frame.context.methods,
                    frame.clone(),
                    &it,
                );
            }

            Op::Call => {
                let argc = count_param(&inst, 0) as usize;
                let args = pop_n(&frame, argc);
                let callee = frame.pop();
                let ty = frame.context.registry.type_of(&callee);
                let call_slot = ty.call.borrow().clone();
                if let Some(n) = inst.next() {
                    if let Some(parked) = goto_checked(&frame, n) {
                        return parked;
                    }
                }
                return match call_slot {
                    Some(call) => call(frame.clone(), &callee, &args),
                    None => Step::Continue {
                        next: frame.clone(),
                        result: Err(type_error(format!("{callee} is not callable"))),
                    },
                };
            }
            Op::ConstCall => {
                let argc = count_param(&inst, 0) as usize;
                let callee = match &inst.params[1] {
                    Param::Value(v) => v.clone(),
                    other => panic!("expected Value param, found {other:?}"),
                };
                let args = pop_n(&frame, argc);
                let ty = frame.context.registry.type_of(&callee);
                let call_slot = ty.call.borrow().clone();
                if let Some(n) = inst.next() {
                    if let Some(parked) = goto_checked(&frame, n) {
                        return parked;
                    }
                }
                return match call_slot {
                    Some(call) => call(frame.clone(), &callee, &args),
                    None => Step::Continue {
                        next: frame.clone(),
                        result: Err(type_error(format!("{callee} is not callable"))),
                    },
                };
            }
            Op::Resolve => {
                let name = value_param(&inst);
                let receiver = frame.pop();
                let name = match &name {
                    Value::Str(s) => s.clone(),
                    other => {
                        pending = Err(type_error(format!("RESOLVE name must be a string, found {other}")));
                        continue;
                    }
                };
                match &receiver {
                    Value::Type(t) => match t.get_export(&name) {
                        Some(v) => frame.push(v),
                        None => {
                            pending = Err(ErrorValue::new(
                                ErrorKind::NameError,
                                format!("{} has no export `{name}`", t.name),
                            ));
                            continue;
                        }
                    },
                    other => {
                        pending = Err(type_error(format!("cannot resolve a name on {other}")));
                        continue;
                    }
                }
                fallthrough!()
            }
            Op::Assign => {
                let rhs = frame.pop();
                let lhs = frame.pop();
                match lhs.assign(rhs) {
                    Ok(v) => frame.push(v),
                    Err(e) => {
                        pending = Err(e);
                        continue;
                    }
                }
                fallthrough!()
            }

            Op::Try => {
                let target = inst_param(&inst, 0);
                *frame.on_error.borrow_mut() = Some(target);
                fallthrough!()
            }
            Op::Retry => {
                // The handler has already fired once; falling through
                // resumes normal execution without re-installing it.
                fallthrough!()
            }
            Op::Catch => {
                let err = match pending {
                    Err(e) => e,
                    Ok(v) => {
                        // Reached without an active error (e.g. a guarded
                        // block that completed normally and simply flows
                        // past its handler); pass the value through.
                        frame.push(v);
                        fallthrough!();
                    }
                };
                let target = decl_param(&inst);
                let current_len = decl_chain_len(&frame.decls.borrow());
                let target_len = decl_chain_len(&target);
                let dropped = current_len.saturating_sub(target_len);
                {
                    let mut stack = frame.stack.borrow_mut();
                    let new_len = stack.len().saturating_sub(dropped);
                    stack.truncate(new_len);
                }
                *frame.decls.borrow_mut() = target;
                frame.push(Value::Error(Rc::new(err.into_caught())));
                fallthrough!()
            }
            Op::CatchType => {
                let err = match pending {
                    Err(e) => e,
                    Ok(v) => {
                        frame.push(v);
                        fallthrough!();
                    }
                };
                let filter = value_param(&inst);
                let matches = matches!(&filter, Value::Type(t) if err.kind.to_string() == t.name);
                if matches {
                    frame.push(Value::Error(Rc::new(err.into_caught())));
                    fallthrough!()
                } else {
                    return Step::Continue {
                        next: frame.caller.borrow().clone(),
                        result: Err(err),
                    };
                }
            }

            Op::Suspend => {
                let target = inst_param(&inst, 0);
                *frame.inst.borrow_mut() = target;
                return Step::Continue {
                    next: frame.caller.borrow().clone(),
                    result: Ok(Value::Continuation(frame.clone())),
                };
            }
            Op::Resume => {
                // A `susp key, value` expression always pushes exactly
                // those two operands before `SUSPEND` (`frame.rs`'s
                // `top`/`top_key` peek them while parked); the
                // expression itself yields nothing to the generator
                // body, so resuming tears that pair back off. The
                // consumer's seed value arrives as `pending` (the CPS
                // result this frame was re-entered with, already run
                // through the error chokepoint above) rather than as a
                // stack operand — there is no continuation pushed here
                // to pop and branch to.
                frame.pop();
                frame.pop();
                fallthrough!()
            }
            Op::Return => {
                let v = frame.pop();
                frame.done.set(true);
                return Step::Continue {
                    next: frame.caller.borrow().clone(),
                    result: Ok(v),
                };
            }

            Op::TupleNew => {
                let n = count_param(&inst, 0) as usize;
                let values = pop_n(&frame, n);
                frame.push(Value::Tuple(Tuple::new(values)));
                fallthrough!()
            }
            Op::TupleSet => {
                // No bytecode this VM emits constructs a tuple
                // incrementally (`TUPLE_NEW` always supplies every
                // element up front); kept only so a future emitter that
                // wants one has somewhere to land.
                fallthrough!()
            }
            Op::ListNew => {
                let n = count_param(&inst, 0) as usize;
                let values = pop_n(&frame, n);
                frame.push(Value::List(Rc::new(RefCell::new(List::from_vec(values)))));
                fallthrough!()
            }
            Op::ListAppend => {
                let v = frame.pop();
                let list = frame.stack.borrow().last().cloned().unwrap_or(Value::Nil);
                match list {
                    Value::List(l) => l.borrow_mut().append(v),
                    other => {
                        pending = Err(type_error(format!("cannot append to {other}")));
                        continue;
                    }
                }
                fallthrough!()
            }
            Op::MapNew => {
                let n = count_param(&inst, 0) as usize;
                let pairs = pop_n(&frame, n * 2);
                let mut map = Map::new();
                for kv in pairs.chunks_exact(2) {
                    map.insert(kv[0].clone(), kv[1].clone());
                }
                frame.push(Value::Map(Rc::new(RefCell::new(map))));
                fallthrough!()
            }
            Op::MapInsert => {
                let v = frame.pop();
                let k = frame.pop();
                let map = frame.stack.borrow().last().cloned().unwrap_or(Value::Nil);
                match map {
                    Value::Map(m) => m.borrow_mut().insert(k, v),
                    other => {
                        pending = Err(type_error(format!("cannot insert into {other}")));
                        continue;
                    }
                }
                fallthrough!()
            }
            Op::StringNew => {
                let n = count_param(&inst, 0) as usize;
                let mut sb = StringBuffer::new();
                for v in pop_n(&frame, n) {
                    sb.add(&v.to_string());
                }
                frame.push(Value::StringBuffer(Rc::new(RefCell::new(sb))));
                fallthrough!()
            }
            Op::StringAdds => {
                let chars = match &inst.params[1] {
                    Param::Chars(s) => s.clone(),
                    other => panic!("expected Chars param, found {other:?}"),
                };
                let buf = frame.stack.borrow().last().cloned().unwrap_or(Value::Nil);
                match buf {
                    Value::StringBuffer(sb) => sb.borrow_mut().add(&chars),
                    other => {
                        pending = Err(type_error(format!("cannot append to {other}")));
                        continue;
                    }
                }
                fallthrough!()
            }
            Op::StringAdd => {
                let v = frame.pop();
                let buf = frame.stack.borrow().last().cloned().unwrap_or(Value::Nil);
                match buf {
                    Value::StringBuffer(sb) => sb.borrow_mut().add(&v.to_string()),
                    other => {
                        pending = Err(type_error(format!("cannot append to {other}")));
                        continue;
                    }
                }
                fallthrough!()
            }
            Op::StringEnd => {
                let buf = frame.pop();
                match buf {
                    Value::StringBuffer(sb) => frame.push(Value::str(sb.borrow().get())),
                    other => {
                        pending = Err(type_error(format!("{other} is not a string buffer")));
                        continue;
                    }
                }
                fallthrough!()
            }
            Op::PartialNew => {
                let n = count_param(&inst, 0) as usize;
                let mut values = pop_n(&frame, n);
                if values.is_empty() {
                    pending = Err(type_error("PARTIAL_NEW requires at least a function"));
                    continue;
                }
                let function = values.remove(0);
                let bound = values
                    .into_iter()
                    .map(|v| if matches!(v, Value::Some) { None } else { Some(v) })
                    .collect();
                frame.push(Value::Partial(PartialFunction::new(function, bound)));
                fallthrough!()
            }
            Op::PartialSet => {
                // See `TupleSet`: no emitted bytecode mutates a partial
                // after construction.
                fallthrough!()
            }
            Op::Closure | Op::ClosureTyped => {
                let info = match &inst.params[0] {
                    Param::ClosureInfo(ci) => ci.clone(),
                    other => panic!("expected ClosureInfo param, found {other:?}"),
                };
                let mut upvalues = Vec::with_capacity(info.num_upvalues as usize);
                for p in &inst.params[1..] {
                    if let Param::Index(idx) = p {
                        upvalues.push(capture_cell(&frame, *idx as usize));
                    }
                }
                // `CLOSURE_TYPED` pops one more operand than `CLOSURE`: the
                // type to attach to the resulting closure (§4.6), so that
                // `typeof` on it answers something more specific than the
                // generic closure type.
                let ty = if inst.op == Op::ClosureTyped {
                    match frame.pop() {
                        Value::Type(t) => Some(t),
                        other => {
                            pending = Err(type_error(format!("{other} is not a type")));
                            continue;
                        }
                    }
                } else {
                    None
                };
                frame.push(Value::Closure(Rc::new(Closure { info, upvalues, ty })));
                fallthrough!()
            }

            Op::IfDebug => {
                // No attached debugger in this embedding; always takes
                // the fallthrough path as if the check were negative.
                fallthrough!()
            }
        }
    }
}
