//! The four-function iterator protocol (§4.4): `iterate`, `key`, `value`,
//! `next`. Each is dispatched as a typed function first, falling back to
//! an ordinary method call of the same name so that both native and
//! scripted implementations coexist.
//!
//! Grounded in `ml_runtime.c`'s `ml_runtime_init`, which wires
//! `ContinuationT`'s typed-fn table to `ml_iter_value`/`ml_iter_key`/
//! `ml_iter_next` — generators are iterators because their iterator
//! state *is* their suspended frame.

use std::rc::Rc;

use crate::method::MethodTable;
use crate::types::{TypeRegistry, TypedFnKey};
use crate::value::{Caller, Step, Value};

/// Dispatch one of the four iterator operations against `receiver`:
/// first the type's typed-fn table, then a method call of the same
/// name. Mirrors §4.4's "Dispatch order".
fn dispatch_typed_or_method(
    registry: &TypeRegistry,
    methods: &MethodTable,
    name: &'static str,
    key: TypedFnKey,
    caller: Rc<dyn Caller>,
    receiver: &Value,
) -> Step {
    let ty = registry.type_of(receiver);
    if let Some(f) = ty.typed_fn(key) {
        return f(caller, receiver);
    }
    let method = methods.intern(name);
    methods.dispatch(&method, caller, std::slice::from_ref(receiver))
}

/// `iterate(caller, value) → Nil | iterator`.
pub fn iterate(registry: &TypeRegistry, methods: &MethodTable, caller: Rc<dyn Caller>, value: &Value) -> Step {
    dispatch_typed_or_method(registry, methods, "iterate", TypedFnKey::ITERATE, caller, value)
}

/// `key(caller, iter) → current key`.
pub fn key(registry: &TypeRegistry, methods: &MethodTable, caller: Rc<dyn Caller>, iter: &Value) -> Step {
    dispatch_typed_or_method(registry, methods, "key", TypedFnKey::KEY, caller, iter)
}

/// `value(caller, iter) → current value`.
pub fn value(registry: &TypeRegistry, methods: &MethodTable, caller: Rc<dyn Caller>, iter: &Value) -> Step {
    dispatch_typed_or_method(registry, methods, "value", TypedFnKey::VALUE, caller, iter)
}

/// `next(caller, iter) → Nil | advanced iterator`.
pub fn next(registry: &TypeRegistry, methods: &MethodTable, caller: Rc<dyn Caller>, iter: &Value) -> Step {
    dispatch_typed_or_method(registry, methods, "next", TypedFnKey::NEXT, caller, iter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::CallResult;

    struct Sink;
    impl Caller for Sink {
        fn run(self: Rc<Self>, result: CallResult) -> Step {
            Step::Done(result)
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn typed_fn_table_takes_priority_over_method_fallback() {
        let registry = TypeRegistry::new();
        let methods = MethodTable::new(registry.clone());

        // A method fallback that would disagree with the typed-fn, so
        // the test can tell which path actually ran.
        let m = methods.intern("iterate");
        methods.define(&m, vec![registry.integer.id], false, {
            Rc::new(|_c, _args| Step::Done(Ok(Value::str("via-method"))))
        });
        registry
            .integer
            .set_typed_fn(TypedFnKey::ITERATE, Rc::new(|_c, _v| Step::Done(Ok(Value::str("via-typed-fn")))));

        let result = iterate(&registry, &methods, Rc::new(Sink), &Value::Integer(1))
            .drain()
            .unwrap();
        match result {
            Value::Str(s) => assert_eq!(&*s, "via-typed-fn"),
            _ => panic!("unexpected result"),
        }
    }

    #[test]
    fn falls_back_to_method_when_no_typed_fn_installed() {
        let registry = TypeRegistry::new();
        let methods = MethodTable::new(registry.clone());
        let m = methods.intern("iterate");
        methods.define(&m, vec![registry.string.id], false, {
            Rc::new(|_c, _args| Step::Done(Ok(Value::str("via-method"))))
        });
        let result = iterate(&registry, &methods, Rc::new(Sink), &Value::str("hi"))
            .drain()
            .unwrap();
        match result {
            Value::Str(s) => assert_eq!(&*s, "via-method"),
            _ => panic!("unexpected result"),
        }
    }
}
