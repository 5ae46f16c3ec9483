//! Parameterised type instances `C[T1,…,Tn]`, interned globally, plus the
//! subtype algorithm and `type_max` (least common supertype) that walk
//! through a base type's declared generic rules.
//!
//! There is no direct grounding file for this in `ml_runtime.c` (the
//! original C implementation predates generic type parameters); this
//! module follows §4.2 directly, using the same "process-wide service
//! guarded by a short critical section" shape as the method dispatch
//! cache in `crate::method` for its intern table (§5).

use std::collections::HashMap;
use std::rc::Rc;

use parking_lot::Mutex;

use crate::types::{Type, TypeId, TypeRegistry};

/// One argument position of a generic rule's target: either a concrete
/// type, or a positional reference back into the declaring type's own
/// argument vector ("where each `ui` is either a concrete type or a
/// positional reference to one of my own arguments", §4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenericArg {
    Concrete(TypeId),
    Positional(usize),
}

/// A generic rule declared on a base type: "if my argument vector is
/// `[A0, A1, …]`, I am also a subtype of `target_base` instantiated with
/// `target_args`".
#[derive(Debug, Clone)]
pub struct GenericRule {
    pub target_base: TypeId,
    pub target_args: Vec<GenericArg>,
}

impl GenericRule {
    /// Instantiate this rule against a concrete argument vector,
    /// resolving each `Positional(i)` to `self_args[i]` (defaulting to
    /// `Any` if the rule allows a shorter vector than it references).
    fn instantiate(&self, self_args: &[TypeId], any: TypeId) -> Vec<TypeId> {
        self.target_args
            .iter()
            .map(|arg| match arg {
                GenericArg::Concrete(t) => *t,
                GenericArg::Positional(i) => self_args.get(*i).copied().unwrap_or(any),
            })
            .collect()
    }
}

/// The `(base_type, [T1,…,Tn])` payload of an interned generic instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenericPayload {
    pub base: TypeId,
    pub args: Vec<TypeId>,
}

impl GenericPayload {
    pub(crate) fn display_name(&self, by_id: &HashMap<TypeId, Rc<Type>>) -> String {
        let base_name = by_id
            .get(&self.base)
            .map(|t| t.name.clone())
            .unwrap_or_else(|| "?".to_string());
        let arg_names: Vec<String> = self
            .args
            .iter()
            .map(|id| by_id.get(id).map(|t| t.name.clone()).unwrap_or_else(|| "?".to_string()))
            .collect();
        format!("{base_name}[{}]", arg_names.join(","))
    }
}

/// `GenericInstance` is the value-facing handle for a generic type
/// instance; it wraps the interned `Rc<Type>` so call sites can treat it
/// like any other type while still recovering `(base, args)` cheaply.
#[derive(Debug, Clone)]
pub struct GenericInstance(pub Rc<Type>);

impl GenericInstance {
    pub fn base_and_args(&self) -> (TypeId, Vec<TypeId>) {
        let payload = self.0.generic_payload.borrow();
        let payload = payload.as_ref().expect("GenericInstance always carries a payload");
        (payload.base, payload.args.clone())
    }
}

/// The process-wide intern table for generic instances, guarded by a
/// `parking_lot::Mutex` around a short critical section — the same
/// shape §5 specifies for the type-level shared caches ("each uses a
/// test-and-set spinlock around a short critical section").
pub struct GenericInterner {
    table: Mutex<HashMap<GenericPayload, Rc<Type>>>,
}

impl std::fmt::Debug for GenericInterner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericInterner")
            .field("instances", &self.table.lock().len())
            .finish()
    }
}

impl GenericInterner {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Intern `base[args...]`, allocating a new backing `Type` on first
    /// use. Equality among instances is by identity after interning.
    pub fn intern(&self, registry: &TypeRegistry, base: &Rc<Type>, args: Vec<TypeId>) -> GenericInstance {
        let payload = GenericPayload { base: base.id, args };
        if let Some(existing) = self.table.lock().get(&payload) {
            return GenericInstance(existing.clone());
        }
        let ty = registry.new_generic_instance_type(base, payload.clone());
        self.table.lock().insert(payload, ty.clone());
        GenericInstance(ty)
    }
}

impl Default for GenericInterner {
    fn default() -> Self {
        Self::new()
    }
}

/// `is_subtype(T, U)` extended with generic rules, per §4.2.
pub fn is_subtype(registry: &TypeRegistry, t: &Rc<Type>, u: &Rc<Type>) -> bool {
    if u.id == registry.any.id {
        return true;
    }
    if t.id == u.id {
        return true;
    }

    let t_generic = t.generic_payload.borrow().clone();
    let u_generic = u.generic_payload.borrow().clone();

    if let (Some(tg), Some(ug)) = (&t_generic, &u_generic) {
        if tg.base == ug.base {
            return covariant_match(registry, &tg.args, &ug.args);
        }
    }

    if let Some(tg) = &t_generic {
        if let Some(base) = registry.type_by_id(tg.base) {
            for rule in base.generic_rules.borrow().iter() {
                let target_args = rule.instantiate(&tg.args, registry.any.id);
                if let Some(target_base) = registry.type_by_id(rule.target_base) {
                    if rule_target_is_subtype(registry, &target_base, &target_args, u) {
                        return true;
                    }
                }
            }
        }
    }

    t.parents.borrow().contains(u.id)
}

fn rule_target_is_subtype(
    registry: &TypeRegistry,
    target_base: &Rc<Type>,
    target_args: &[TypeId],
    u: &Rc<Type>,
) -> bool {
    if let Some(ug) = u.generic_payload.borrow().clone() {
        if ug.base == target_base.id {
            return covariant_match(registry, target_args, &ug.args);
        }
    }
    is_subtype(registry, target_base, u)
}

/// Covariant argument matching with "U's shorter vector allowed — missing
/// arguments default to Any" (§4.2).
fn covariant_match(registry: &TypeRegistry, t_args: &[TypeId], u_args: &[TypeId]) -> bool {
    if u_args.len() > t_args.len() {
        return false;
    }
    for (i, u_arg) in u_args.iter().enumerate() {
        let t_arg = t_args.get(i).copied().unwrap_or(registry.any.id);
        let t_ty = match registry.type_by_id(t_arg) {
            Some(t) => t,
            None => return false,
        };
        let u_ty = match registry.type_by_id(*u_arg) {
            Some(t) => t,
            None => return false,
        };
        if !is_subtype(registry, &t_ty, &u_ty) {
            return false;
        }
    }
    true
}

/// `type_max(a, b)`: the least common supertype, walking the same
/// generic-rule structure as [`is_subtype`] and returning the
/// highest-rank shared ancestor.
pub fn type_max(registry: &TypeRegistry, a: &Rc<Type>, b: &Rc<Type>) -> Rc<Type> {
    if is_subtype(registry, a, b) {
        return b.clone();
    }
    if is_subtype(registry, b, a) {
        return a.clone();
    }
    let mut best = registry.any.clone();
    for id in a.parents.borrow().iter() {
        if let Some(candidate) = registry.type_by_id(id) {
            if b.parents.borrow().contains(id) && candidate.rank() > best.rank() {
                best = candidate;
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_the_same_type_for_equal_args() {
        let registry = TypeRegistry::new();
        let interner = GenericInterner::new();
        let list_base = registry.new_type(&registry.any, "List");
        let a = interner.intern(&registry, &list_base, vec![registry.integer.id]);
        let b = interner.intern(&registry, &list_base, vec![registry.integer.id]);
        assert!(Rc::ptr_eq(&a.0, &b.0));
    }

    #[test]
    fn distinct_args_intern_to_distinct_types() {
        let registry = TypeRegistry::new();
        let interner = GenericInterner::new();
        let list_base = registry.new_type(&registry.any, "List");
        let a = interner.intern(&registry, &list_base, vec![registry.integer.id]);
        let b = interner.intern(&registry, &list_base, vec![registry.string.id]);
        assert!(!Rc::ptr_eq(&a.0, &b.0));
    }

    #[test]
    fn covariant_subtyping_with_shorter_u_vector() {
        let registry = TypeRegistry::new();
        let interner = GenericInterner::new();
        let list_base = registry.new_type(&registry.any, "List");
        let specific = interner.intern(&registry, &list_base, vec![registry.integer.id]);
        let generic = interner.intern(&registry, &list_base, vec![]);
        assert!(is_subtype(&registry, &specific.0, &generic.0));
    }

    #[test]
    fn type_max_of_unrelated_types_is_any() {
        let registry = TypeRegistry::new();
        let top = type_max(&registry, &registry.integer, &registry.string);
        assert_eq!(top.id, registry.any.id);
    }

    #[test]
    fn type_max_of_related_types_is_the_supertype() {
        let registry = TypeRegistry::new();
        let top = type_max(&registry, &registry.integer, &registry.number);
        assert_eq!(top.id, registry.number.id);
    }
}
