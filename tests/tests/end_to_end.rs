//! End-to-end scenarios spanning `minilang-core` and `minilang-vm`
//! together: hand-assembled bytecode (there is no front-end crate in
//! this workspace) driven through a real [`Vm`], exercising chained
//! method dispatch, error propagation, the iterator-protocol consumers
//! and the thread-safety audit together rather than in isolation.

use std::cell::RefCell;
use std::rc::Rc;

use minilang_core::bytecode::{ClosureInfo, Inst, Op, Param, Source};
use minilang_core::compound::List;
use minilang_core::error::ErrorKind;
use minilang_core::value::{Closure, Reference, Value};
use minilang_vm::{audit, iterfns, Vm, VmError, VmOptions};

fn src() -> Source {
    Source {
        name: "e2e.ml".into(),
        line: 1,
    }
}

#[test]
fn chained_method_dispatch_computes_doubled_successor() {
    let vm = Vm::new(VmOptions::default());
    let plus = vm.methods().intern("+");
    let mul = vm.methods().intern("*");

    let vm_ret = Inst::new(Op::Return, src(), vec![]);
    let result2 = Inst::new(Op::Result, src(), vec![]);
    result2.link(vm_ret);
    let call2 = Inst::new(Op::ConstCall, src(), vec![Param::Count(2), Param::Value(Value::Method(mul))]);
    call2.link(result2);
    let load2 = Inst::new(Op::Load, src(), vec![Param::Value(Value::Integer(2))]);
    load2.link(call2);
    let result1 = Inst::new(Op::Result, src(), vec![]);
    result1.link(load2);
    let call1 = Inst::new(Op::ConstCall, src(), vec![Param::Count(2), Param::Value(Value::Method(plus))]);
    call1.link(result1);
    let load1 = Inst::new(Op::Load, src(), vec![Param::Value(Value::Integer(1))]);
    load1.link(call1);
    let local0 = Inst::new(Op::Local, src(), vec![Param::Index(0)]);
    local0.link(load1);

    let info = ClosureInfo::new(local0, 1, 1, 0, vec!["x".into()], None, Some("doubled_successor".into()));
    let closure = Rc::new(Closure {
        info: Rc::new(info),
        upvalues: vec![],
    });

    let result = vm.call(Value::Closure(closure), &[Value::Integer(20)]).unwrap();
    assert!(matches!(result, Value::Integer(42)));
}

#[test]
fn division_by_zero_propagates_as_a_script_error() {
    let vm = Vm::new(VmOptions::default());
    let div = vm.methods().intern("/");

    let vm_ret = Inst::new(Op::Return, src(), vec![]);
    let result = Inst::new(Op::Result, src(), vec![]);
    result.link(vm_ret);
    let call = Inst::new(Op::ConstCall, src(), vec![Param::Count(2), Param::Value(Value::Method(div))]);
    call.link(result);
    let load = Inst::new(Op::Load, src(), vec![Param::Value(Value::Integer(0))]);
    load.link(call);
    let local0 = Inst::new(Op::Local, src(), vec![Param::Index(0)]);
    local0.link(load);

    let info = ClosureInfo::new(local0, 1, 1, 0, vec!["x".into()], None, Some("divider".into()));
    let closure = Rc::new(Closure {
        info: Rc::new(info),
        upvalues: vec![],
    });

    let err = vm.call(Value::Closure(closure), &[Value::Integer(5)]).unwrap_err();
    match err {
        VmError::Script(e) => assert_eq!(e.kind, ErrorKind::ValueError),
        other => panic!("expected a script error, got {other:?}"),
    }
}

#[test]
fn iterfns_all_count_and_map_agree_over_the_same_list() {
    let vm = Vm::new(VmOptions::default());
    let source = Value::List(Rc::new(RefCell::new(List::from_vec(vec![
        Value::str("a"),
        Value::str("b"),
        Value::str("c"),
    ]))));

    let collected = iterfns::all(vm.context(), &source).unwrap();
    let counted = iterfns::count(vm.context(), &source).unwrap();
    let mapped = iterfns::map(vm.context(), &source).unwrap();

    match (collected, counted, mapped) {
        (Value::List(l), Value::Integer(n), Value::Map(m)) => {
            assert_eq!(l.borrow().to_vec().len(), 3);
            assert_eq!(n, 3);
            assert_eq!(m.borrow().len(), 3);
        }
        other => panic!("unexpected shapes: {other:?}"),
    }
}

#[test]
fn thread_safety_audit_passes_plain_data_and_rejects_reference_cells() {
    assert!(audit::is_thread_safe(&Value::Integer(7)));
    assert!(audit::is_thread_safe(&Value::str("ok")));

    let cell = Rc::new(RefCell::new(Value::Integer(1)));
    assert!(!audit::is_thread_safe(&Value::Reference(Reference(cell))));
}
