//! A representative subset of `ml_iterfns.c`'s iterator-protocol
//! consumers, written against the four-function protocol
//! ([`minilang_core::iter`]) rather than as hand-rolled CPS state
//! machines, to exercise and document that protocol (§4.4).
//!
//! `all` and `map` walk the protocol the way `ml_all_fnx`/`ml_map_fnx`
//! do: `iterate` once, then alternate fetching the current `value`
//! (and, for `map`, `key`) with advancing via `next` until the iterator
//! yields `Nil`. `count` mirrors `ml_count_fn` exactly in never calling
//! `value` at all — advancing the iterator is all a count needs.

use std::cell::RefCell;
use std::rc::Rc;

use minilang_core::compound::{List, Map};
use minilang_core::value::{CallResult, Caller, NativeFunction, Step, Value};

use crate::context::Context;
use crate::{drive_call, VmResult};

fn iterate_start(context: &Rc<Context>, source: &Value) -> VmResult<Value> {
    let registry = context.registry.clone();
    let methods = context.methods.clone();
    let source = source.clone();
    drive_call(context, move |caller| minilang_core::iter::iterate(&registry, &methods, caller, &source))
}

fn iter_value(context: &Rc<Context>, cursor: &Value) -> VmResult<Value> {
    let registry = context.registry.clone();
    let methods = context.methods.clone();
    let cursor = cursor.clone();
    drive_call(context, move |caller| minilang_core::iter::value(&registry, &methods, caller, &cursor))
}

fn iter_key(context: &Rc<Context>, cursor: &Value) -> VmResult<Value> {
    let registry = context.registry.clone();
    let methods = context.methods.clone();
    let cursor = cursor.clone();
    drive_call(context, move |caller| minilang_core::iter::key(&registry, &methods, caller, &cursor))
}

fn iter_next(context: &Rc<Context>, cursor: &Value) -> VmResult<Value> {
    let registry = context.registry.clone();
    let methods = context.methods.clone();
    let cursor = cursor.clone();
    drive_call(context, move |caller| minilang_core::iter::next(&registry, &methods, caller, &cursor))
}

/// `all(source)`: collect every value `source` yields into a [`List`],
/// grounded in `ml_all_fnx`.
pub fn all(context: &Rc<Context>, source: &Value) -> CallResult {
    let mut list = List::new();
    let mut cursor = iterate_start(context, source)?;
    while cursor.is_truthy() {
        list.append(iter_value(context, &cursor)?.deref());
        cursor = iter_next(context, &cursor)?;
    }
    Ok(Value::List(Rc::new(RefCell::new(list))))
}

/// `map(source)`: collect every key/value pair `source` yields into a
/// [`Map`], grounded in `ml_map_fnx`.
pub fn map(context: &Rc<Context>, source: &Value) -> CallResult {
    let mut map = Map::new();
    let mut cursor = iterate_start(context, source)?;
    while cursor.is_truthy() {
        let key = iter_key(context, &cursor)?.deref();
        let value = iter_value(context, &cursor)?.deref();
        map.insert(key, value);
        cursor = iter_next(context, &cursor)?;
    }
    Ok(Value::Map(Rc::new(RefCell::new(map))))
}

/// `count(source)`: the number of values `source` yields, grounded in
/// `ml_count_fn`. Never touches `value` — advancing is all it needs.
pub fn count(context: &Rc<Context>, source: &Value) -> CallResult {
    let mut total: i64 = 0;
    let mut cursor = iterate_start(context, source)?;
    while cursor.is_truthy() {
        total += 1;
        cursor = iter_next(context, &cursor)?;
    }
    Ok(Value::Integer(total))
}

fn native(name: &'static str, context: Rc<Context>, f: fn(&Rc<Context>, &Value) -> CallResult) -> Value {
    let callback: Rc<dyn Fn(Rc<dyn Caller>, &[Value]) -> Step> = Rc::new(move |caller: Rc<dyn Caller>, args: &[Value]| -> Step {
        let source = args.first().cloned().unwrap_or(Value::Nil);
        Step::Continue { next: caller, result: f(&context, &source) }
    });
    Value::Function(Rc::new(NativeFunction { name, callback }))
}

/// A [`Value::Function`] wrapping [`all`], ready to install under a
/// name like `"all"` via the embedding surface (§6.1).
pub fn all_native(context: Rc<Context>) -> Value {
    native("all", context, all)
}

/// A [`Value::Function`] wrapping [`map`].
pub fn map_native(context: Rc<Context>) -> Value {
    native("map", context, map)
}

/// A [`Value::Function`] wrapping [`count`].
pub fn count_native(context: Rc<Context>) -> Value {
    native("count", context, count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Vm, VmOptions};

    #[test]
    fn all_collects_a_list_iterator_into_a_list() {
        let vm = Vm::new(VmOptions::default());
        let source = Value::List(Rc::new(RefCell::new(List::from_vec(vec![
            Value::Integer(1),
            Value::Integer(2),
            Value::Integer(3),
        ]))));
        let result = all(vm.context(), &source).unwrap();
        match result {
            Value::List(l) => assert_eq!(l.borrow().to_vec().len(), 3),
            other => panic!("expected a list, got {other:?}"),
        }
    }

    #[test]
    fn count_never_forces_values() {
        let vm = Vm::new(VmOptions::default());
        let source = Value::List(Rc::new(RefCell::new(List::from_vec(vec![
            Value::Integer(1),
            Value::Integer(2),
        ]))));
        let result = count(vm.context(), &source).unwrap();
        assert!(matches!(result, Value::Integer(2)));
    }

    #[test]
    fn map_pairs_keys_with_values() {
        let vm = Vm::new(VmOptions::default());
        let source = Value::List(Rc::new(RefCell::new(List::from_vec(vec![Value::str("a"), Value::str("b")]))));
        let result = map(vm.context(), &source).unwrap();
        match result {
            Value::Map(m) => assert_eq!(m.borrow().len(), 2),
            other => panic!("expected a map, got {other:?}"),
        }
    }
}
