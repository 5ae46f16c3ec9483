//! Graphviz dot-graph dump of a closure's instruction graph (§6.4).
//!
//! Grounded in `ml_internal.h`'s `ml_closure_info_debug` (declared but
//! opaque in the retrieved header — we follow §6.4's description of
//! what it emits) and, for the printer shape itself, in
//! `cranelift-codegen`'s `CFGPrinter` (`cfg_printer.rs`): a `write`
//! method that walks nodes then edges into anything implementing
//! `fmt::Write`, and a `Display` impl that hands off to it.

use std::collections::HashMap;
use std::fmt::{self, Write};
use std::rc::Rc;

use crate::bytecode::{ClosureInfo, Inst, Param};

/// A utility for pretty-printing a closure's instruction graph as a
/// Graphviz `digraph`. Edges are labelled on branches (`not nil` /
/// `error`, §6.4); try-scope interiors are coloured by a hash of their
/// handler pointer so nested `try` scopes are visually distinguishable.
pub struct DotGraph<'a> {
    info: &'a ClosureInfo,
}

impl<'a> DotGraph<'a> {
    pub fn new(info: &'a ClosureInfo) -> Self {
        Self { info }
    }

    /// Write the full `digraph { ... }` to `w`.
    pub fn write(&self, w: &mut dyn Write) -> fmt::Result {
        let order = self.reachable();
        writeln!(w, "digraph \"{}\" {{", self.info.name.as_deref().unwrap_or("closure"))?;
        self.nodes(w, &order)?;
        self.edges(w, &order)?;
        writeln!(w, "}}")
    }

    /// Depth-first reachable set from `entry`, in first-seen order —
    /// same walk `ClosureInfo::new`'s content hasher uses, so node
    /// numbering here is stable across a single process run.
    fn reachable(&self) -> Vec<Rc<Inst>> {
        let mut seen: HashMap<*const Inst, ()> = HashMap::new();
        let mut stack = vec![self.info.entry.clone()];
        let mut order = Vec::new();
        while let Some(inst) = stack.pop() {
            let ptr = Rc::as_ptr(&inst);
            if seen.contains_key(&ptr) {
                continue;
            }
            seen.insert(ptr, ());
            order.push(inst.clone());
            for succ in inst.successors() {
                stack.push(succ);
            }
        }
        order
    }

    fn node_id(order: &[Rc<Inst>], inst: &Rc<Inst>) -> usize {
        order.iter().position(|i| Rc::ptr_eq(i, inst)).unwrap_or(usize::MAX)
    }

    fn nodes(&self, w: &mut dyn Write, order: &[Rc<Inst>]) -> fmt::Result {
        for (id, inst) in order.iter().enumerate() {
            let colour = self.try_scope_colour(inst);
            write!(
                w,
                "    n{id} [shape=record, label=\"{{{}:{} | {}}}\"",
                inst.source.name, inst.source.line, inst.op
            )?;
            if let Some(colour) = colour {
                write!(w, ", style=filled, fillcolor=\"{colour}\"")?;
            }
            writeln!(w, "]")?;
        }
        Ok(())
    }

    fn edges(&self, w: &mut dyn Write, order: &[Rc<Inst>]) -> fmt::Result {
        for (id, inst) in order.iter().enumerate() {
            let branch_targets: Vec<&Rc<Inst>> = inst
                .params
                .iter()
                .filter_map(|p| match p {
                    Param::Inst(t) => Some(t),
                    _ => None,
                })
                .collect();

            match branch_targets.len() {
                0 => {}
                1 => {
                    let target_id = Self::node_id(order, branch_targets[0]);
                    let label = branch_edge_label(inst.op, 0);
                    writeln!(w, "    n{id} -> n{target_id}{}", edge_attrs(label))?;
                }
                _ => {
                    for (i, target) in branch_targets.iter().enumerate() {
                        let target_id = Self::node_id(order, target);
                        let label = branch_edge_label(inst.op, i);
                        writeln!(w, "    n{id} -> n{target_id}{}", edge_attrs(label))?;
                    }
                }
            }

            if let Some(next) = inst.next() {
                let next_id = Self::node_id(order, &next);
                writeln!(w, "    n{id} -> n{next_id}")?;
            }
        }
        Ok(())
    }

    /// Colour try-scope interiors by a hash of the handler instruction's
    /// pointer, so that nested or sibling `try` scopes group visually
    /// without needing a stable numeric scope id.
    fn try_scope_colour(&self, inst: &Rc<Inst>) -> Option<String> {
        if inst.op != crate::bytecode::Op::Try {
            return None;
        }
        let handler = inst.branch_target()?;
        let ptr = Rc::as_ptr(handler) as usize;
        let hue = (ptr.wrapping_mul(2654435761) >> 24) % 360;
        Some(format!("/hsv/{:.3},0.25,0.98", hue as f64 / 360.0))
    }
}

fn branch_edge_label(op: crate::bytecode::Op, branch_index: usize) -> Option<&'static str> {
    use crate::bytecode::Op::*;
    match (op, branch_index) {
        (If, 0) | (IfVar, 0) | (IfLet, 0) => Some("nil"),
        (If, 1) | (IfVar, 1) | (IfLet, 1) => Some("not nil"),
        (Else, 0) => Some("not nil"),
        (Else, 1) => Some("nil"),
        (And, _) | (Or, _) => Some("short-circuit"),
        (Iter, _) | (Next, _) => Some("exhausted"),
        (Try, _) => Some("error"),
        _ => None,
    }
}

fn edge_attrs(label: Option<&'static str>) -> String {
    match label {
        Some(l) => format!(" [label=\"{l}\"]"),
        None => String::new(),
    }
}

impl<'a> fmt::Display for DotGraph<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Inst, Op, Source};

    fn src(line: u32) -> Source {
        Source {
            name: "t.ml".into(),
            line,
        }
    }

    #[test]
    fn dot_graph_contains_digraph_header_and_footer() {
        let ret = Inst::new(Op::Return, src(1), vec![]);
        let info = ClosureInfo::new(ret, 0, 0, 0, vec![], None, Some("f".into()));
        let dot = DotGraph::new(&info).to_string();
        assert!(dot.starts_with("digraph"));
        assert!(dot.trim_end().ends_with('}'));
    }

    #[test]
    fn branch_edges_are_labelled() {
        let t = Inst::new(Op::Return, src(2), vec![]);
        let f = Inst::new(Op::Return, src(3), vec![]);
        let iff = Inst::new(Op::If, src(1), vec![Param::Inst(f.clone()), Param::Inst(t.clone())]);
        let info = ClosureInfo::new(iff, 0, 0, 0, vec![], None, None);
        let dot = DotGraph::new(&info).to_string();
        assert!(dot.contains("label=\"nil\""));
        assert!(dot.contains("label=\"not nil\""));
    }
}
