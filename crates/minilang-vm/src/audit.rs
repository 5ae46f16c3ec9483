//! The thread-safety audit (§5): a recursive check over a value that a
//! multi-threaded embedding runs before handing it to a task on another
//! thread. The audit rejects anything whose type retains a reference to
//! mutable scoped state — reference cells, live frames, mutable
//! compound containers — and audits a closure through both its captured
//! upvalues and its instruction stream's `LOAD` constants, since either
//! can smuggle a reference to the defining scope's locals across.
//!
//! Cycle-safe the same way `ClosureInfo`'s content hash is: a `seen` set
//! keyed on pointer identity stops the walk from looping forever on a
//! self-referential closure or instruction graph.

use std::rc::Rc;

use ahash::AHashSet;

use minilang_core::bytecode::{Inst, Param};
use minilang_core::value::Value;

/// `true` iff `value`, and everything it transitively holds, is safe to
/// move to another task: no reference cell, no suspended continuation,
/// no mutable container, nothing a second thread could race this one to
/// mutate.
pub fn is_thread_safe(value: &Value) -> bool {
    let mut seen = AHashSet::new();
    audit_value(value, &mut seen)
}

fn audit_value(value: &Value, seen: &mut AHashSet<usize>) -> bool {
    match value {
        Value::Nil
        | Value::Some
        | Value::Bool(_)
        | Value::Integer(_)
        | Value::Real(_)
        | Value::Str(_)
        | Value::Method(_)
        | Value::Function(_)
        | Value::Type(_)
        | Value::Error(_) => true,

        Value::Tuple(t) => t.values.iter().all(|v| audit_value(v, seen)),

        Value::Closure(c) => {
            let ptr = Rc::as_ptr(c) as usize;
            if !seen.insert(ptr) {
                return true;
            }
            c.upvalues.iter().all(|cell| audit_value(&cell.borrow(), seen)) && audit_inst_graph(&c.info.entry, seen)
        }

        Value::Partial(p) => {
            audit_value(&p.function, seen)
                && p.bound.iter().all(|slot| slot.as_ref().map(|v| audit_value(v, seen)).unwrap_or(true))
        }

        // Reference cells, suspended frames and the mutable compound
        // containers are exactly the "mutable scoped state" §5 rejects:
        // sharing any of these across a channel would let two tasks
        // race on the same interior-mutable cell.
        Value::List(_)
        | Value::Map(_)
        | Value::StringBuffer(_)
        | Value::Reference(_)
        | Value::Continuation(_)
        | Value::Uninitialized(_)
        | Value::Names(_)
        | Value::Object(_) => false,
    }
}

/// Walk every instruction reachable from `entry` and audit each `LOAD`
/// (or any other) constant it carries, recursing into nested closures'
/// own instruction graphs via `Param::ClosureInfo`.
fn audit_inst_graph(entry: &Rc<Inst>, seen: &mut AHashSet<usize>) -> bool {
    let mut stack = vec![entry.clone()];
    let mut visited: AHashSet<usize> = AHashSet::new();
    while let Some(inst) = stack.pop() {
        let ptr = Rc::as_ptr(&inst) as usize;
        if !visited.insert(ptr) {
            continue;
        }
        for param in &inst.params {
            match param {
                Param::Value(v) if !audit_value(v, seen) => return false,
                Param::ClosureInfo(ci) if !audit_inst_graph(&ci.entry, seen) => return false,
                _ => {}
            }
        }
        stack.extend(inst.successors());
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use minilang_core::bytecode::{ClosureInfo, Op, Source};
    use minilang_core::compound::Tuple;
    use minilang_core::value::Closure;

    fn src() -> Source {
        Source { name: "t.ml".into(), line: 1 }
    }

    #[test]
    fn scalars_and_tuples_of_scalars_pass() {
        assert!(is_thread_safe(&Value::Integer(1)));
        let t = Tuple::new(vec![Value::Integer(1), Value::str("hi")]);
        assert!(is_thread_safe(&Value::Tuple(t)));
    }

    #[test]
    fn a_reference_cell_fails() {
        use minilang_core::value::Reference;
        use std::cell::RefCell;
        let cell = Rc::new(RefCell::new(Value::Integer(1)));
        assert!(!is_thread_safe(&Value::Reference(Reference(cell))));
    }

    #[test]
    fn a_closure_with_only_scalar_constants_passes() {
        let ret = Inst::new(Op::Return, src(), vec![]);
        let load = Inst::new(Op::Load, src(), vec![minilang_core::bytecode::Param::Value(Value::Integer(1))]);
        load.link(ret);
        let info = ClosureInfo::new(load, 1, 0, 0, vec![], None, None);
        let closure = Rc::new(Closure { info: Rc::new(info), upvalues: vec![], ty: None });
        assert!(is_thread_safe(&Value::Closure(closure)));
    }

    #[test]
    fn a_closure_capturing_a_mutable_container_upvalue_fails() {
        use minilang_core::compound::List;
        use std::cell::RefCell;
        let ret = Inst::new(Op::Return, src(), vec![]);
        let info = ClosureInfo::new(ret, 0, 0, 1, vec![], None, None);
        let shared_list = Rc::new(RefCell::new(List::new()));
        let cell = Rc::new(RefCell::new(Value::List(shared_list)));
        let closure = Rc::new(Closure { info: Rc::new(info), upvalues: vec![cell], ty: None });
        assert!(!is_thread_safe(&Value::Closure(closure)));
    }
}
