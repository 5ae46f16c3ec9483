//! Integration tests driving a full [`Vm`] through hand-assembled
//! bytecode: calling a host-defined native function from scripted code
//! via the generic `CALL` opcode, rather than `CONST_CALL`'s inline
//! method constant.

use std::cell::RefCell;
use std::rc::Rc;

use minilang_core::bytecode::{ClosureInfo, Inst, Op, Param, Source};
use minilang_core::compound::List;
use minilang_core::value::{Closure, Value};
use minilang_vm::{iterfns, Vm, VmOptions};

fn src() -> Source {
    Source {
        name: "t.ml".into(),
        line: 1,
    }
}

#[test]
fn calling_a_native_function_value_via_the_generic_call_opcode() {
    let vm = Vm::new(VmOptions::default());
    let all_fn = iterfns::all_native(vm.context().clone());

    let list = Value::List(Rc::new(RefCell::new(List::from_vec(vec![Value::Integer(1), Value::Integer(2)]))));

    let ret = Inst::new(Op::Return, src(), vec![]);
    let result = Inst::new(Op::Result, src(), vec![]);
    result.link(ret);
    let call = Inst::new(Op::Call, src(), vec![Param::Count(1)]);
    call.link(result);
    let load_arg = Inst::new(Op::Load, src(), vec![Param::Value(list)]);
    load_arg.link(call);
    let load_callee = Inst::new(Op::Load, src(), vec![Param::Value(all_fn)]);
    load_callee.link(load_arg);

    let info = ClosureInfo::new(load_callee, 0, 0, 0, vec![], None, Some("caller".into()));
    let closure = Rc::new(Closure {
        info: Rc::new(info),
        upvalues: vec![],
        ty: None,
    });

    let result = vm.call(Value::Closure(closure), &[]).unwrap();
    match result {
        Value::List(l) => assert_eq!(l.borrow().to_vec().len(), 2),
        other => panic!("expected a list, got {other:?}"),
    }
}

/// A hand-assembled generator closure that suspends twice, each time
/// pushing a distinct `key, value` pair (`susp key, value`'s compiled
/// shape per `ml_suspend_expr_compile`: key first, then value, then
/// `SUSPEND` immediately followed by `RESUME`), before returning `nil`.
/// Driving it through `iterfns::map` exercises `SUSPEND`/`RESUME` end to
/// end: the iterator protocol's `key`/`value` must read back the two
/// distinct stack slots a suspension left behind, and `next` must be
/// able to resume the same frame repeatedly without the stale operands
/// leaking across iterations.
fn two_value_generator() -> Value {
    let ret = Inst::new(Op::Return, src(), vec![]);
    let load_nil = Inst::new(Op::Load, src(), vec![Param::Value(Value::Nil)]);
    load_nil.link(ret);

    let resume2 = Inst::new(Op::Resume, src(), vec![]);
    resume2.link(load_nil);
    let suspend2 = Inst::new(Op::Suspend, src(), vec![Param::Inst(resume2.clone())]);
    let load_val2 = Inst::new(Op::Load, src(), vec![Param::Value(Value::Integer(2))]);
    load_val2.link(suspend2);
    let load_key2 = Inst::new(Op::Load, src(), vec![Param::Value(Value::Integer(20))]);
    load_key2.link(load_val2);

    let resume1 = Inst::new(Op::Resume, src(), vec![]);
    resume1.link(load_key2);
    let suspend1 = Inst::new(Op::Suspend, src(), vec![Param::Inst(resume1.clone())]);
    let load_val1 = Inst::new(Op::Load, src(), vec![Param::Value(Value::Integer(1))]);
    load_val1.link(suspend1);
    let load_key1 = Inst::new(Op::Load, src(), vec![Param::Value(Value::Integer(10))]);
    load_key1.link(load_val1);

    let info = ClosureInfo::new(load_key1, 0, 0, 0, vec![], None, Some("gen".into()));
    Value::Closure(Rc::new(Closure {
        info: Rc::new(info),
        upvalues: vec![],
        ty: None,
    }))
}

#[test]
fn suspend_resume_drives_a_generator_through_two_distinct_key_value_pairs() {
    let vm = Vm::new(VmOptions::default());
    let generator = two_value_generator();

    let result = iterfns::map(vm.context(), &generator).unwrap();
    match result {
        Value::Map(m) => {
            let m = m.borrow();
            assert_eq!(m.len(), 2);
            assert!(matches!(m.get(&Value::Integer(10)), Some(Value::Integer(1))));
            assert!(matches!(m.get(&Value::Integer(20)), Some(Value::Integer(2))));
        }
        other => panic!("expected a map, got {other:?}"),
    }
}

#[test]
fn suspend_resume_does_not_leak_the_suspended_key_value_pair() {
    let vm = Vm::new(VmOptions::default());
    let generator = two_value_generator();

    // `all` only ever reads `value`, never `key`, so this exercises the
    // same resume cycle from the other typed-fn and confirms repeated
    // `RESUME`s leave the frame's stack exactly where `ml_compiler.c`'s
    // `Function->Top -= 2` bookkeeping says it should be: by the final
    // `RETURN nil`, only the `nil` `RETURN` itself pushed remains.
    let result = iterfns::all(vm.context(), &generator).unwrap();
    match result {
        Value::List(l) => {
            let values = l.borrow().to_vec();
            assert_eq!(values.len(), 2);
            assert!(matches!(values[0], Value::Integer(1)));
            assert!(matches!(values[1], Value::Integer(2)));
        }
        other => panic!("expected a list, got {other:?}"),
    }
}
