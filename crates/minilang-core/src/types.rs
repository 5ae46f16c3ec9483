//! Types as values: the parent lattice, rank, and the typed-fn table.
//!
//! Grounded in `ml_types.h`'s `ml_type_t` (a flat function-pointer table:
//! `hash`/`call`/`deref`/`assign`) and `ml_runtime.c`'s `ml_runtime_init`,
//! which wires those slots for the built-in types at process start.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::value::{hash_value, AssignSlot, CallSlot, DerefSlot, HashSlot, Value};

/// Stable identity for a [`Type`], used as the key into dispatch caches
/// and the typed-fn table's per-type slot, independent of the `Rc`
/// pointer (which would otherwise pin the type in every cache key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

fn next_type_id() -> TypeId {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    TypeId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// A "type key" for the typed-fn table: the identity of a well-known
/// operation (e.g. `iterate`), used so that built-in types can install a
/// fast override without going through named-method dispatch. In the
/// original this is the address of a C function symbol; here it is a
/// small interned tag, since Rust has no stable function-pointer
/// identity guarantee across monomorphizations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypedFnKey(pub &'static str);

impl TypedFnKey {
    pub const ITERATE: TypedFnKey = TypedFnKey("iterate");
    pub const VALUE: TypedFnKey = TypedFnKey("value");
    pub const KEY: TypedFnKey = TypedFnKey("key");
    pub const NEXT: TypedFnKey = TypedFnKey("next");
}

/// A typed-fn implementation: takes the caller state and the receiver
/// value, continuation-passing style, same shape as a method callback
/// with a fixed arity of one.
pub type TypedFn = Rc<dyn Fn(Rc<dyn crate::value::Caller>, &Value) -> crate::value::Step>;

/// A type: itself a value, holding the per-type capability slots, the
/// parent lattice, and the typed-fn and exports tables.
///
/// `Interface` types start at rank 1 regardless of their parents (they
/// denote a capability, not a concrete representation); `NoInherit`
/// types refuse to propagate their own slots to subtypes that don't
/// explicitly override them (used for sealed built-ins).
#[derive(Debug)]
pub struct Type {
    pub id: TypeId,
    pub name: String,
    /// Direct parent, as declared; `None` only for `Any` itself.
    pub parent: Option<Rc<Type>>,
    /// Flat, transitively-closed ancestor set (including `parent`) for
    /// O(1) subtype checks.
    pub parents: RefCell<im_like_set::FlatSet>,
    pub rank: RefCell<u32>,
    pub interface: bool,
    pub no_inherit: bool,
    pub hash: RefCell<Option<HashSlot>>,
    pub call: RefCell<Option<CallSlot>>,
    pub deref: RefCell<Option<DerefSlot>>,
    pub assign: RefCell<Option<AssignSlot>>,
    pub typed_fns: RefCell<AHashMap<TypedFnKey, TypedFn>>,
    pub exports: RefCell<HashMap<String, Value>>,
    /// Generic subtyping rules (§4.2); empty for ordinary types.
    pub generic_rules: RefCell<Vec<crate::generics::GenericRule>>,
    /// Set only on interned generic instances: the `(base, args)` pair
    /// this type was created from.
    pub generic_payload: RefCell<Option<crate::generics::GenericPayload>>,
}

/// A tiny flat-set helper. A `HashSet<TypeId>` would do, but the lattice
/// is small and append-only in practice, so a sorted `Vec` with
/// deduplicating insert keeps `contains` branch-predictor-friendly and
/// avoids pulling in an extra hashing pass per `is()` check.
pub mod im_like_set {
    use super::TypeId;

    #[derive(Debug, Default, Clone)]
    pub struct FlatSet(Vec<TypeId>);

    impl FlatSet {
        pub fn contains(&self, id: TypeId) -> bool {
            self.0.binary_search(&id).is_ok()
        }
        pub fn insert(&mut self, id: TypeId) -> bool {
            match self.0.binary_search(&id) {
                Ok(_) => false,
                Err(pos) => {
                    self.0.insert(pos, id);
                    true
                }
            }
        }
        pub fn union_from(&mut self, other: &FlatSet) {
            for id in &other.0 {
                self.insert(*id);
            }
        }
        pub fn iter(&self) -> impl Iterator<Item = TypeId> + '_ {
            self.0.iter().copied()
        }
        pub fn len(&self) -> usize {
            self.0.len()
        }
        pub fn is_empty(&self) -> bool {
            self.0.is_empty()
        }
    }
}

impl Type {
    /// `is(value, type)`: true iff `type` is `value`'s own type or one of
    /// its registered parents.
    pub fn is_subtype_of(self: &Rc<Self>, other: &Rc<Type>) -> bool {
        self.id == other.id || self.parents.borrow().contains(other.id)
    }

    /// Sum of ranks is used by method dispatch as the primary tie-break;
    /// expose the current snapshot.
    pub fn rank(&self) -> u32 {
        *self.rank.borrow()
    }

    /// Install (or replace) a typed-fn override for `key`.
    pub fn set_typed_fn(&self, key: TypedFnKey, f: TypedFn) {
        self.typed_fns.borrow_mut().insert(key, f);
    }

    /// Look up a typed-fn, walking the lattice in rank order on a miss,
    /// matching §4.1's "lookup walks parents in rank order on miss and
    /// memoises the result".
    pub fn typed_fn(self: &Rc<Self>, key: TypedFnKey) -> Option<TypedFn> {
        if let Some(f) = self.typed_fns.borrow().get(&key) {
            return Some(f.clone());
        }
        let mut cursor = self.parent.clone();
        while let Some(p) = cursor {
            if let Some(f) = p.typed_fns.borrow().get(&key) {
                self.typed_fns.borrow_mut().insert(key, f.clone());
                return Some(f.clone());
            }
            cursor = p.parent.clone();
        }
        None
    }

    pub fn export(&self, name: impl Into<String>, value: Value) {
        self.exports.borrow_mut().insert(name.into(), value);
    }

    pub fn get_export(&self, name: &str) -> Option<Value> {
        self.exports.borrow().get(name).cloned()
    }
}

/// Process-wide registry of all live types, plus the handful of built-in
/// singletons every value's `typeof` resolves to. Modeled as an
/// "explicit init, process-scoped service" per the design notes on
/// global mutable state: tests that need isolation construct their own
/// `TypeRegistry` rather than sharing one process-wide instance.
pub struct TypeRegistry {
    by_id: Mutex<HashMap<TypeId, Rc<Type>>>,
    pub any: Rc<Type>,
    pub nil: Rc<Type>,
    pub some: Rc<Type>,
    pub boolean: Rc<Type>,
    pub number: Rc<Type>,
    pub integer: Rc<Type>,
    pub real: Rc<Type>,
    pub string: Rc<Type>,
    pub method: Rc<Type>,
    pub reference: Rc<Type>,
    pub tuple: Rc<Type>,
    pub list: Rc<Type>,
    pub map: Rc<Type>,
    pub names: Rc<Type>,
    pub stringbuffer: Rc<Type>,
    pub closure: Rc<Type>,
    pub partial: Rc<Type>,
    pub function: Rc<Type>,
    pub continuation: Rc<Type>,
    pub uninitialized: Rc<Type>,
    pub error: Rc<Type>,
    pub caught_error: Rc<Type>,
    pub type_type: Rc<Type>,
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.by_id.lock().len())
            .finish()
    }
}

impl TypeRegistry {
    /// Build a fresh registry with only the built-in types installed —
    /// no VM-specific `call` slots yet; `minilang-vm` wires those at
    /// `Vm::new()` the same way `ml_runtime_init` wires `ClosureT`'s and
    /// `ContinuationT`'s typed-fns.
    pub fn new() -> Rc<Self> {
        let mut by_id = HashMap::new();
        let any = Self::new_root(&mut by_id, "Any", false, false);

        let mut child = |name: &str, interface: bool, no_inherit: bool| {
            Self::new_child(&mut by_id, &any, name, interface, no_inherit)
        };

        let nil = child("Nil", false, false);
        let some = child("Some", false, false);
        let boolean = child("Bool", false, false);
        let number = child("Number", true, false);
        let integer = Self::new_child(&mut by_id, &number, "Integer", false, false);
        let real = Self::new_child(&mut by_id, &number, "Real", false, false);
        let string = child("String", false, false);
        let method = child("Method", false, false);
        let reference = child("Reference", false, true);
        let tuple = child("Tuple", false, false);
        let list = child("List", false, false);
        let map = child("Map", false, false);
        let names = Self::new_child(&mut by_id, &list, "Names", false, false);
        let stringbuffer = child("StringBuffer", false, false);
        let function = child("Function", false, false);
        let closure = Self::new_child(&mut by_id, &function, "Closure", false, false);
        let partial = Self::new_child(&mut by_id, &function, "PartialFunction", false, false);
        let continuation = child("Continuation", false, true);
        let uninitialized = child("Uninitialized", false, true);
        let error = child("Error", false, false);
        let caught_error = Self::new_child(&mut by_id, &error, "CaughtError", false, false);
        let type_type = child("Type", false, false);

        // Every built-in gets the structural `hash` default (§3.1/§4.1);
        // `new_type` then carries it down to user-defined subtypes unless
        // the parent is `NoInherit`.
        for ty in by_id.values() {
            *ty.hash.borrow_mut() = Some(hash_value as HashSlot);
        }

        Rc::new(Self {
            by_id: Mutex::new(by_id),
            any,
            nil,
            some,
            boolean,
            number,
            integer,
            real,
            string,
            method,
            reference,
            tuple,
            list,
            map,
            names,
            stringbuffer,
            closure,
            partial,
            function,
            continuation,
            uninitialized,
            error,
            caught_error,
            type_type,
        })
    }

    fn new_root(by_id: &mut HashMap<TypeId, Rc<Type>>, name: &str, interface: bool, no_inherit: bool) -> Rc<Type> {
        let id = next_type_id();
        let mut parents = im_like_set::FlatSet::default();
        parents.insert(id);
        let ty = Rc::new(Type {
            id,
            name: name.to_string(),
            parent: None,
            parents: RefCell::new(parents),
            rank: RefCell::new(if interface { 1 } else { 0 }),
            interface,
            no_inherit,
            hash: RefCell::new(None),
            call: RefCell::new(None),
            deref: RefCell::new(None),
            assign: RefCell::new(None),
            typed_fns: RefCell::new(AHashMap::new()),
            exports: RefCell::new(HashMap::new()),
            generic_rules: RefCell::new(Vec::new()),
            generic_payload: RefCell::new(None),
        });
        by_id.insert(id, ty.clone());
        ty
    }

    fn new_child(
        by_id: &mut HashMap<TypeId, Rc<Type>>,
        parent: &Rc<Type>,
        name: &str,
        interface: bool,
        no_inherit: bool,
    ) -> Rc<Type> {
        let id = next_type_id();
        let mut parents = parent.parents.borrow().clone();
        parents.insert(id);
        let rank = if interface {
            1
        } else if parent.interface {
            parent.rank() + 1
        } else {
            parent.rank() + 1
        };
        let ty = Rc::new(Type {
            id,
            name: name.to_string(),
            parent: Some(parent.clone()),
            parents: RefCell::new(parents),
            rank: RefCell::new(rank),
            interface,
            no_inherit,
            hash: RefCell::new(None),
            call: RefCell::new(None),
            deref: RefCell::new(None),
            assign: RefCell::new(None),
            typed_fns: RefCell::new(AHashMap::new()),
            exports: RefCell::new(HashMap::new()),
            generic_rules: RefCell::new(Vec::new()),
            generic_payload: RefCell::new(None),
        });
        by_id.insert(id, ty.clone());
        ty
    }

    /// `new_type(parent, name)`: allocate a type inheriting all slots
    /// from its parent, adding it to the parent's subtype set.
    pub fn new_type(&self, parent: &Rc<Type>, name: impl Into<String>) -> Rc<Type> {
        let name = name.into();
        let mut by_id = self.by_id.lock();
        let ty = Self::new_child(&mut by_id, parent, &name, false, false);
        // Inherit slots unless the parent is `NoInherit`.
        if !parent.no_inherit {
            *ty.hash.borrow_mut() = *parent.hash.borrow();
            *ty.deref.borrow_mut() = *parent.deref.borrow();
            *ty.assign.borrow_mut() = *parent.assign.borrow();
            *ty.call.borrow_mut() = parent.call.borrow().clone();
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(target: "minilang_core::types", name = %ty.name, "type registered");
        ty
    }

    /// `add_parent(type, parent)`: union `parent`'s ancestors into
    /// `type`'s flat parent set and bump its rank.
    pub fn add_parent(&self, ty: &Rc<Type>, parent: &Rc<Type>) {
        ty.parents.borrow_mut().union_from(&parent.parents.borrow());
        let bumped = parent.rank() + 1;
        let mut rank = ty.rank.borrow_mut();
        if bumped > *rank {
            *rank = bumped;
        }
    }

    pub fn type_by_id(&self, id: TypeId) -> Option<Rc<Type>> {
        self.by_id.lock().get(&id).cloned()
    }

    /// Allocate a generic instance's backing `Type` (called only from
    /// `crate::generics`'s intern table, which owns uniqueness).
    pub(crate) fn new_generic_instance_type(
        &self,
        base: &Rc<Type>,
        payload: crate::generics::GenericPayload,
    ) -> Rc<Type> {
        let mut by_id = self.by_id.lock();
        let ty = Self::new_child(&mut by_id, base, &payload.display_name(&by_id), false, false);
        *ty.generic_payload.borrow_mut() = Some(payload);
        ty
    }

    /// `typeof(value) → type`, total and never absent.
    pub fn type_of(&self, value: &Value) -> Rc<Type> {
        match value {
            Value::Nil => self.nil.clone(),
            Value::Some => self.some.clone(),
            Value::Bool(_) => self.boolean.clone(),
            Value::Integer(_) => self.integer.clone(),
            Value::Real(_) => self.real.clone(),
            Value::Str(_) => self.string.clone(),
            Value::Method(_) => self.method.clone(),
            Value::Tuple(_) => self.tuple.clone(),
            Value::List(_) => self.list.clone(),
            Value::Map(_) => self.map.clone(),
            Value::Names(_) => self.names.clone(),
            Value::StringBuffer(_) => self.stringbuffer.clone(),
            Value::Closure(c) => c.ty.clone().unwrap_or_else(|| self.closure.clone()),
            Value::Partial(_) => self.partial.clone(),
            Value::Function(_) => self.function.clone(),
            Value::Reference(_) => self.reference.clone(),
            Value::Continuation(_) => self.continuation.clone(),
            Value::Uninitialized(_) => self.uninitialized.clone(),
            Value::Error(e) if e.caught => self.caught_error.clone(),
            Value::Error(_) => self.error.clone(),
            Value::Type(_) => self.type_type.clone(),
            Value::Object(o) => o.ty.clone(),
        }
    }

    /// `is(value, type)`.
    pub fn is(&self, value: &Value, ty: &Rc<Type>) -> bool {
        self.type_of(value).is_subtype_of(ty)
    }

    /// `hash(value) -> int` (§3.1/§4.1), dispatched through the value's
    /// own type rather than calling the structural default directly, so a
    /// user type that overrides `hash` is honored.
    pub fn hash(&self, value: &Value) -> i64 {
        let ty = self.type_of(value);
        match *ty.hash.borrow() {
            Some(f) => f(value, &[]),
            None => hash_value(value, &[]),
        }
    }
}

/// Marker so that host-embedded data stored in typed-fn closures can be
/// downcast back out if needed; not required by the core itself but a
/// common embedding need, mirrored from the `Any` bound used elsewhere
/// in the corpus for host-supplied callback data.
pub trait AnyValue: Any + std::fmt::Debug {}
impl<T: Any + std::fmt::Debug> AnyValue for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_is_its_own_supertype() {
        let reg = TypeRegistry::new();
        assert!(reg.integer.is_subtype_of(&reg.any));
        assert!(reg.integer.is_subtype_of(&reg.number));
        assert!(reg.integer.is_subtype_of(&reg.integer));
        assert!(!reg.integer.is_subtype_of(&reg.string));
    }

    #[test]
    fn rank_increases_down_the_lattice() {
        let reg = TypeRegistry::new();
        assert!(reg.integer.rank() > reg.number.rank());
        assert!(reg.number.rank() >= reg.any.rank());
    }

    #[test]
    fn type_of_is_total() {
        let reg = TypeRegistry::new();
        assert_eq!(reg.type_of(&Value::Nil).id, reg.nil.id);
        assert_eq!(reg.type_of(&Value::Integer(3)).id, reg.integer.id);
    }

    #[test]
    fn new_type_is_a_subtype_of_its_parent() {
        let reg = TypeRegistry::new();
        let point = reg.new_type(&reg.any, "Point");
        assert!(point.is_subtype_of(&reg.any));
        assert!(!point.is_subtype_of(&reg.integer));
    }

    #[test]
    fn hash_is_installed_on_every_built_in_and_agrees_on_equal_values() {
        let reg = TypeRegistry::new();
        assert!(reg.integer.hash.borrow().is_some());
        assert_eq!(reg.hash(&Value::Integer(42)), reg.hash(&Value::Integer(42)));
        assert_ne!(reg.hash(&Value::Integer(42)), reg.hash(&Value::Integer(43)));
    }

    #[test]
    fn new_type_inherits_the_parent_hash_slot() {
        let reg = TypeRegistry::new();
        let point = reg.new_type(&reg.any, "Point");
        assert!(point.hash.borrow().is_some());
    }

    #[test]
    fn add_parent_propagates_ancestors_and_bumps_rank() {
        let reg = TypeRegistry::new();
        let mixin = reg.new_type(&reg.any, "Comparable");
        let ty = reg.new_type(&reg.any, "Ordinal");
        reg.add_parent(&ty, &mixin);
        assert!(ty.is_subtype_of(&mixin));
        assert!(ty.rank() > mixin.rank());
    }
}
