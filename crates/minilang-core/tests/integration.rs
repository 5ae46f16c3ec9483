//! Integration tests over `minilang-core` alone: the type lattice,
//! method dispatch and bytecode graph, exercised through the crate's
//! public surface without the execution engine (`minilang-vm` depends
//! on this crate, not the other way round).

use std::rc::Rc;

use minilang_core::bytecode::{ClosureInfo, Inst, Op, Param, Source};
use minilang_core::compound::{List, Map, Tuple};
use minilang_core::method::{dispatch_sync, MethodTable};
use minilang_core::types::TypeRegistry;
use minilang_core::value::{Caller, Step, Value};

fn src() -> Source {
    Source {
        name: "t.ml".into(),
        line: 1,
    }
}

#[test]
fn method_dispatch_picks_the_most_specific_overload() {
    let registry = TypeRegistry::new();
    let methods = MethodTable::new(registry.clone());
    let greet = methods.intern("greet");

    methods.define(&greet, vec![registry.any.id], false, {
        Rc::new(|_c: Rc<dyn Caller>, _args: &[Value]| -> Step { Step::Done(Ok(Value::str("any"))) })
    });
    methods.define(&greet, vec![registry.string.id], false, {
        Rc::new(|_c: Rc<dyn Caller>, _args: &[Value]| -> Step { Step::Done(Ok(Value::str("string"))) })
    });

    let result = dispatch_sync(&methods, &greet, &[Value::str("hi")]).unwrap();
    match result {
        Value::Str(s) => assert_eq!(&*s, "string"),
        other => panic!("expected the string-specific overload, got {other:?}"),
    }

    let result = dispatch_sync(&methods, &greet, &[Value::Integer(1)]).unwrap();
    match result {
        Value::Str(s) => assert_eq!(&*s, "any"),
        other => panic!("expected the fallback overload, got {other:?}"),
    }
}

#[test]
fn closure_content_hash_is_stable_across_rebuilds() {
    let ret = Inst::new(Op::Return, src(), vec![]);
    let load = Inst::new(Op::Load, src(), vec![Param::Value(Value::Integer(1))]);
    load.link(ret);
    let info_a = ClosureInfo::new(load.clone(), 1, 0, 0, vec![], None, Some("f".into()));

    let ret2 = Inst::new(Op::Return, src(), vec![]);
    let load2 = Inst::new(Op::Load, src(), vec![Param::Value(Value::Integer(1))]);
    load2.link(ret2);
    let info_b = ClosureInfo::new(load2, 1, 0, 0, vec![], None, Some("f".into()));

    assert_eq!(info_a.hash, info_b.hash);
}

#[test]
fn tuple_deref_and_compound_containers_round_trip() {
    let t = Tuple::new(vec![Value::Integer(1), Value::Integer(2)]);
    assert!(Rc::ptr_eq(&t, &t.deref()));

    let mut list = List::new();
    list.append(Value::Integer(10));
    list.append(Value::Integer(20));
    assert_eq!(list.to_vec().len(), 2);

    let mut map = Map::new();
    map.insert(Value::str("k"), Value::Integer(5));
    match map.get(&Value::str("k")) {
        Some(Value::Integer(5)) => {}
        other => panic!("expected Some(Integer(5)), got {other:?}"),
    }
}
