//! Interned methods and multi-argument dispatch over the type lattice.
//!
//! Grounded in `spec.md` §4.3 and, at one remove, in `ml_types.h`'s
//! `ml_method_by_name`/`ml_method_by_value` (methods are themselves
//! values, defined incrementally by arity-tagged rules).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use ahash::AHashMap;

use crate::error::{ErrorKind, ErrorValue};
use crate::types::{TypeId, TypeRegistry};
use crate::value::{CallResult, Caller, Step, Value};

/// A method callback: `(caller, data, argc, argv)` in the original;
/// here the receiver slice *is* argv and "data" is whatever the closure
/// captures.
pub type MethodCallback = Rc<dyn Fn(Rc<dyn Caller>, &[Value]) -> Step>;

/// One dispatch rule: a declared argument-type signature, whether the
/// trailing position accepts any number of extra arguments, and the
/// callback to invoke when it is selected.
pub struct Rule {
    pub types: Vec<TypeId>,
    pub variadic: bool,
    pub callback: MethodCallback,
    /// Declaration order, used as the final dispatch tie-breaker.
    pub order: u32,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("types", &self.types)
            .field("variadic", &self.variadic)
            .field("order", &self.order)
            .finish()
    }
}

/// An interned method: a name plus a bag of dispatch rules. Methods are
/// values in their own right (`Value::Method`), so two lookups of the
/// same name must yield the same `Rc<Method>`; see [`MethodTable::intern`].
#[derive(Debug)]
pub struct Method {
    pub name: String,
    rules: RefCell<Vec<Rule>>,
    next_order: RefCell<u32>,
}

impl Method {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: RefCell::new(Vec::new()),
            next_order: RefCell::new(0),
        }
    }

    /// Add a dispatch rule. Declaration order is assigned automatically
    /// and used only to break ties among otherwise-equal rules.
    pub fn define(&self, types: Vec<TypeId>, variadic: bool, callback: MethodCallback) {
        let mut order = self.next_order.borrow_mut();
        self.rules.borrow_mut().push(Rule {
            types,
            variadic,
            callback,
            order: *order,
        });
        *order += 1;
    }

    fn rule_applies(rule: &Rule, arg_types: &[TypeId], registry: &TypeRegistry) -> bool {
        if rule.variadic {
            if arg_types.len() < rule.types.len() {
                return false;
            }
        } else if arg_types.len() != rule.types.len() {
            return false;
        }
        rule.types.iter().zip(arg_types.iter()).all(|(declared, actual)| {
            let declared_ty = match registry.type_by_id(*declared) {
                Some(t) => t,
                None => return false,
            };
            let actual_ty = match registry.type_by_id(*actual) {
                Some(t) => t,
                None => return false,
            };
            actual_ty.is_subtype_of(&declared_ty)
        })
    }

    fn tie_break_key(rule: &Rule, registry: &TypeRegistry) -> (u64, u32, i64) {
        let sum_of_ranks: u64 = rule
            .types
            .iter()
            .filter_map(|id| registry.type_by_id(*id))
            .map(|t| t.rank() as u64)
            .sum();
        let min_rank = rule
            .types
            .iter()
            .filter_map(|id| registry.type_by_id(*id))
            .map(|t| t.rank())
            .min()
            .unwrap_or(0);
        // Declaration order favours *earlier* definitions on a tie, so
        // negate it for a "greatest wins" comparison.
        (sum_of_ranks, min_rank, -(rule.order as i64))
    }

    /// Select the applicable rule with the greatest
    /// `(sum-of-ranks, min-rank, declaration-order)` tuple, per §4.3/§8.
    fn select(&self, arg_types: &[TypeId], registry: &TypeRegistry) -> Option<MethodCallback> {
        let rules = self.rules.borrow();
        rules
            .iter()
            .filter(|r| Self::rule_applies(r, arg_types, registry))
            .max_by_key(|r| Self::tie_break_key(r, registry))
            .map(|r| r.callback.clone())
    }
}

/// Cache key: argument-type tuple for a single method.
type CacheKey = (TypeId, Vec<TypeId>);

/// A "methods context": a scoped container for method definitions and
/// their per-context dispatch cache (§4.3's "cache is per-`methods`
/// context so that method definitions can be scoped to a dynamic
/// extent"). An embedding may create one per call tree to sandbox
/// temporary method definitions.
pub struct MethodTable {
    registry: Rc<TypeRegistry>,
    methods: RefCell<HashMap<String, Rc<Method>>>,
    method_ids: RefCell<AHashMap<*const Method, TypeId>>,
    next_method_id: RefCell<u32>,
    cache: RefCell<AHashMap<CacheKey, Option<MethodCallback>>>,
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.methods.borrow().len())
            .field("cache_entries", &self.cache.borrow().len())
            .finish()
    }
}

impl MethodTable {
    pub fn new(registry: Rc<TypeRegistry>) -> Self {
        Self {
            registry,
            methods: RefCell::new(HashMap::new()),
            method_ids: RefCell::new(AHashMap::new()),
            next_method_id: RefCell::new(0),
            cache: RefCell::new(AHashMap::new()),
        }
    }

    /// Intern a method by name, creating it on first use so that
    /// `foo` always names the same `Rc<Method>` within this table.
    pub fn intern(&self, name: &str) -> Rc<Method> {
        if let Some(m) = self.methods.borrow().get(name) {
            return m.clone();
        }
        let m = Rc::new(Method::new(name));
        self.methods.borrow_mut().insert(name.to_string(), m.clone());
        let mut id = self.next_method_id.borrow_mut();
        self.method_ids.borrow_mut().insert(Rc::as_ptr(&m), TypeId(*id));
        *id += 1;
        #[cfg(feature = "tracing")]
        tracing::debug!(target: "minilang_core::method", name, "method interned");
        m
    }

    /// Add a rule to a method, invalidating the dispatch cache: a newly
    /// defined rule can change which callback a previously-cached
    /// argument-type tuple should resolve to.
    pub fn define(&self, method: &Rc<Method>, types: Vec<TypeId>, variadic: bool, callback: MethodCallback) {
        method.define(types, variadic, callback);
        self.cache.borrow_mut().clear();
        #[cfg(feature = "tracing")]
        tracing::debug!(target: "minilang_core::method", name = %method.name, "method rule defined, cache cleared");
    }

    fn method_key(&self, method: &Rc<Method>) -> TypeId {
        *self
            .method_ids
            .borrow()
            .get(&Rc::as_ptr(method))
            .expect("method must be interned through this table before dispatch")
    }

    /// Dispatch `method` against `args`, consulting the per-context
    /// cache first. Fails with `MethodError` if no rule applies.
    pub fn dispatch(&self, method: &Rc<Method>, caller: Rc<dyn Caller>, args: &[Value]) -> Step {
        let arg_types: Vec<TypeId> = args
            .iter()
            .map(|v| self.registry.type_of(v).id)
            .collect();
        let key = (self.method_key(method), arg_types.clone());

        if let Some(cached) = self.cache.borrow().get(&key) {
            return match cached {
                Some(cb) => cb(caller, args),
                None => Step::Continue {
                    next: caller,
                    result: Err(method_error(&method.name, &arg_types, &self.registry)),
                },
            };
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(target: "minilang_core::method", name = %method.name, "dispatch cache miss");

        let selected = method.select(&arg_types, &self.registry);
        self.cache.borrow_mut().insert(key, selected.clone());
        match selected {
            Some(cb) => cb(caller, args),
            None => Step::Continue {
                next: caller,
                result: Err(method_error(&method.name, &arg_types, &self.registry)),
            },
        }
    }

    /// Clear the dispatch cache without forgetting any rules — used by
    /// embeddings that install temporary methods for one call tree and
    /// want to guarantee a clean cache on the way out.
    pub fn clear_cache(&self) {
        self.cache.borrow_mut().clear();
    }
}

fn method_error(name: &str, arg_types: &[TypeId], registry: &TypeRegistry) -> ErrorValue {
    let names: Vec<String> = arg_types
        .iter()
        .filter_map(|id| registry.type_by_id(*id))
        .map(|t| t.name.clone())
        .collect();
    ErrorValue::new(
        ErrorKind::MethodError,
        format!("no method `{name}` applicable to ({})", names.join(", ")),
    )
}

/// Drive a [`Step`] produced by [`MethodTable::dispatch`] to completion;
/// convenience for call sites that don't have a surrounding trampoline.
pub fn dispatch_sync(table: &MethodTable, method: &Rc<Method>, args: &[Value]) -> CallResult {
    struct Sink;
    impl Caller for Sink {
        fn run(self: Rc<Self>, result: CallResult) -> Step {
            Step::Done(result)
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }
    table.dispatch(method, Rc::new(Sink), args).drain()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plus_callback(registry: &Rc<TypeRegistry>) -> MethodCallback {
        let registry = registry.clone();
        Rc::new(move |_caller, args| {
            let _ = &registry;
            let a = match &args[0] {
                Value::Integer(i) => *i,
                _ => unreachable!(),
            };
            let b = match &args[1] {
                Value::Integer(i) => *i,
                _ => unreachable!(),
            };
            Step::Done(Ok(Value::Integer(a + b)))
        })
    }

    #[test]
    fn single_applicable_rule_is_selected() {
        let registry = TypeRegistry::new();
        let table = MethodTable::new(registry.clone());
        let plus = table.intern("+");
        table.define(
            &plus,
            vec![registry.integer.id, registry.integer.id],
            false,
            plus_callback(&registry),
        );
        let result = dispatch_sync(&table, &plus, &[Value::Integer(3), Value::Integer(4)]).unwrap();
        assert!(matches!(result, Value::Integer(7)));
    }

    #[test]
    fn no_applicable_rule_is_a_method_error() {
        let registry = TypeRegistry::new();
        let table = MethodTable::new(registry.clone());
        let plus = table.intern("+");
        table.define(
            &plus,
            vec![registry.integer.id, registry.integer.id],
            false,
            plus_callback(&registry),
        );
        let err = dispatch_sync(&table, &plus, &[Value::str("a"), Value::str("b")]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MethodError);
    }

    #[test]
    fn dispatch_is_referentially_transparent_under_fixed_context() {
        let registry = TypeRegistry::new();
        let table = MethodTable::new(registry.clone());
        let foo = table.intern("foo");
        table.define(&foo, vec![registry.integer.id], false, {
            Rc::new(|_c, args| Step::Done(Ok(args[0].clone())))
        });
        table.define(&foo, vec![registry.string.id], false, {
            Rc::new(|_c, _args| Step::Done(Ok(Value::str("string!"))))
        });
        let a = dispatch_sync(&table, &foo, &[Value::Integer(5)]).unwrap();
        let b = dispatch_sync(&table, &foo, &[Value::Integer(5)]).unwrap();
        assert!(matches!((a, b), (Value::Integer(5), Value::Integer(5))));
    }

    #[test]
    fn tie_break_prefers_greatest_sum_of_ranks() {
        let registry = TypeRegistry::new();
        let table = MethodTable::new(registry.clone());
        let foo = table.intern("foo");
        table.define(&foo, vec![registry.number.id], false, {
            Rc::new(|_c, _args| Step::Done(Ok(Value::str("number"))))
        });
        table.define(&foo, vec![registry.integer.id], false, {
            Rc::new(|_c, _args| Step::Done(Ok(Value::str("integer"))))
        });
        let result = dispatch_sync(&table, &foo, &[Value::Integer(1)]).unwrap();
        match result {
            Value::Str(s) => assert_eq!(&*s, "integer"),
            _ => panic!("expected a string"),
        }
    }
}
