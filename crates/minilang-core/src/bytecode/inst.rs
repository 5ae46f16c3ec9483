//! The instruction graph and closure metadata (§3.5, §3.7, §4.6, §6.2).
//!
//! Grounded directly in `ml_internal.h`'s `ml_inst_t`/`ml_param_t`/
//! `ml_closure_info_t`, and in `ml_runtime.c`'s `ml_closure_sha256` for
//! the content-hash walk.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use sha2::{Digest, Sha256};

use super::op::Op;
use crate::value::Value;

/// Where an instruction came from, for trace frames and the debug
/// dot-graph's node labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub name: Rc<str>,
    pub line: u32,
}

/// A declaration-chain link: the currently-visible local/upvalue names
/// at a point in the program, used only for debug visibility (`ENTER`,
/// `EXIT`, `CATCH` carry one; §3.4's `decls` field, §6.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decl {
    pub name: Rc<str>,
    pub index: u32,
    pub is_upvalue: bool,
    pub next: Option<Rc<Decl>>,
}

/// One slot of an instruction's inline parameter array. The active
/// variant for a given instruction is determined by its opcode's
/// [`super::op::ParamShape`] — see that type's docs.
#[derive(Clone)]
pub enum Param {
    Inst(Rc<Inst>),
    Count(i64),
    Index(u32),
    Value(Value),
    Decl(Option<Rc<Decl>>),
    ClosureInfo(Rc<ClosureInfo>),
    Chars(Rc<str>),
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Inst(i) => write!(f, "Inst({})", i.op),
            Param::Count(c) => write!(f, "Count({c})"),
            Param::Index(i) => write!(f, "Index({i})"),
            Param::Value(v) => write!(f, "Value({v})"),
            Param::Decl(d) => write!(f, "Decl({})", d.is_some()),
            Param::ClosureInfo(_) => write!(f, "ClosureInfo"),
            Param::Chars(s) => write!(f, "Chars({s:?})"),
        }
    }
}

/// One node of the bytecode instruction graph. Allocated once by the
/// (out-of-scope) emitter and handed to the VM fully linked — the core
/// never mutates an `Inst`'s opcode or params after construction, so
/// those are plain fields; only `next` is a `RefCell`, because the
/// emitter commonly allocates an instruction before the one that
/// sequentially follows it exists yet and back-patches it with
/// [`Inst::link`] (the same "forward declare, patch later" shape as
/// `LETI`/`REFI`, just at the instruction-graph level instead of the
/// value level).
///
/// `next` is the *sequential fall-through* continuation: the place
/// execution goes after an opcode with no opcode-specific successor of
/// its own (`POP`, `RESULT`, `ASSIGN`, `CALL`, …). Opcodes that branch
/// (`GOTO`, `IF`, `ITER`, …) carry their targets as `Param::Inst`
/// entries instead and ignore `next`. A `LINK` opcode's single
/// parameter exists only so the emitter can stitch instruction blocks
/// allocated in separate chunks together explicitly — ordinary
/// same-chunk sequencing relies on `next` directly (§3.7).
pub struct Inst {
    pub op: Op,
    pub source: Source,
    pub params: Vec<Param>,
    next: RefCell<Option<Rc<Inst>>>,
}

/// Manual `Debug`: loop bodies legitimately make `next` cyclic, so this
/// prints one node shallowly instead of recursing into its neighbours.
impl fmt::Debug for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inst")
            .field("op", &self.op)
            .field("source", &self.source)
            .field("params", &self.params)
            .field("has_next", &self.next.borrow().is_some())
            .finish()
    }
}

impl Inst {
    pub fn new(op: Op, source: Source, params: Vec<Param>) -> Rc<Self> {
        Rc::new(Self {
            op,
            source,
            params,
            next: RefCell::new(None),
        })
    }

    /// Back-patch the sequential fall-through successor.
    pub fn link(self: &Rc<Self>, next: Rc<Inst>) {
        *self.next.borrow_mut() = Some(next);
    }

    /// The sequential fall-through successor, if one was linked.
    pub fn next(&self) -> Option<Rc<Inst>> {
        self.next.borrow().clone()
    }

    /// Convenience accessor for opcodes whose only/first param is a
    /// branch target (`GOTO`, `AND`, `OR`, `ITER succ_end`, …).
    pub fn branch_target(&self) -> Option<&Rc<Inst>> {
        self.params.iter().find_map(|p| match p {
            Param::Inst(i) => Some(i),
            _ => None,
        })
    }

    /// All direct successor instructions this node can transfer control
    /// to, opcode-specific branch targets plus the sequential `next` —
    /// used by the debug dot-graph walk and the content hasher to
    /// traverse the graph without needing a separate CFG builder.
    pub fn successors(&self) -> Vec<Rc<Inst>> {
        let mut out: Vec<Rc<Inst>> = self
            .params
            .iter()
            .filter_map(|p| match p {
                Param::Inst(i) => Some(i.clone()),
                _ => None,
            })
            .collect();
        if let Some(n) = self.next() {
            out.push(n);
        }
        out
    }
}

/// A closure's immutable, shared metadata (§3.5, §6.2): entry
/// instruction, frame layout, declared parameter count with a sign-bit
/// convention for varargs, an ordered parameter-name table, upvalue
/// count, a SHA-256 content hash, and a decl chain for debug.
#[derive(Debug)]
pub struct ClosureInfo {
    pub entry: Rc<Inst>,
    pub frame_size: u32,
    /// Non-negative: fixed arity. Negative: variadic; the bit-complement
    /// (`!num_params`) gives the named arity (§6.2).
    pub num_params: i32,
    pub num_upvalues: u32,
    pub param_names: Vec<Rc<str>>,
    pub hash: [u8; 32],
    pub decls: Option<Rc<Decl>>,
    pub name: Option<Rc<str>>,
}

impl ClosureInfo {
    pub fn is_variadic(&self) -> bool {
        self.num_params < 0
    }

    pub fn named_arity(&self) -> u32 {
        if self.num_params < 0 {
            (!self.num_params) as u32
        } else {
            self.num_params as u32
        }
    }

    /// Build a closure info, computing its content hash from the
    /// instruction graph reachable from `entry`.
    pub fn new(
        entry: Rc<Inst>,
        frame_size: u32,
        num_params: i32,
        num_upvalues: u32,
        param_names: Vec<Rc<str>>,
        decls: Option<Rc<Decl>>,
        name: Option<Rc<str>>,
    ) -> Self {
        let hash = content_hash(&entry, frame_size, num_params, num_upvalues);
        Self {
            entry,
            frame_size,
            num_params,
            num_upvalues,
            param_names,
            hash,
            decls,
            name,
        }
    }
}

/// Walk the instruction graph reachable from `entry` in a fixed,
/// deterministic order (depth-first, first-seen numbering) and fold the
/// opcode sequence plus static parameter shapes into a SHA-256 digest.
/// Two closures with the same info and equal upvalues must hash
/// identically (§3.5); this is what lets CBOR round-tripping (§6.3) and
/// the proptest in `tests/` assert hash-equality.
fn content_hash(entry: &Rc<Inst>, frame_size: u32, num_params: i32, num_upvalues: u32) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(frame_size.to_le_bytes());
    hasher.update(num_params.to_le_bytes());
    hasher.update(num_upvalues.to_le_bytes());

    let mut seen: ahash::AHashMap<*const Inst, u32> = ahash::AHashMap::new();
    let mut stack = vec![entry.clone()];
    let mut order: Vec<Rc<Inst>> = Vec::new();
    while let Some(inst) = stack.pop() {
        let ptr = Rc::as_ptr(&inst);
        if seen.contains_key(&ptr) {
            continue;
        }
        seen.insert(ptr, order.len() as u32);
        order.push(inst.clone());
        for succ in inst.successors() {
            stack.push(succ);
        }
    }

    for inst in &order {
        hasher.update([mnemonic_tag(inst.op)]);
        hasher.update(inst.source.line.to_le_bytes());
        for param in &inst.params {
            match param {
                Param::Inst(target) => {
                    let idx = seen.get(&Rc::as_ptr(target)).copied().unwrap_or(u32::MAX);
                    hasher.update(idx.to_le_bytes());
                }
                Param::Count(c) => hasher.update(c.to_le_bytes()),
                Param::Index(i) => hasher.update(i.to_le_bytes()),
                Param::Value(v) => hasher.update(format!("{v}").as_bytes()),
                Param::Decl(_) => {}
                Param::ClosureInfo(ci) => hasher.update(ci.hash),
                Param::Chars(s) => hasher.update(s.as_bytes()),
            }
        }
        if let Some(next) = inst.next() {
            let idx = seen.get(&Rc::as_ptr(&next)).copied().unwrap_or(u32::MAX);
            hasher.update(idx.to_le_bytes());
        }
    }

    hasher.finalize().into()
}

/// `Op` has no stable numeric discriminant of its own (it derives
/// `Default` rather than a `repr`), so the hasher folds in its
/// mnemonic's bytes instead of a raw tag. Stable across a process run,
/// which is all the content hash needs: it is compared only against
/// other hashes computed by this same binary, never persisted across
/// builds.
fn mnemonic_tag(op: Op) -> u8 {
    op.mnemonic().bytes().fold(0u8, |acc, b| acc.wrapping_add(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Source as _Source;

    fn leaf(op: Op) -> Rc<Inst> {
        Inst::new(
            op,
            Source {
                name: "t.ml".into(),
                line: 1,
            },
            vec![],
        )
    }

    #[test]
    fn equal_graphs_hash_equally() {
        let a = leaf(Op::Return);
        let b = leaf(Op::Return);
        let info_a = ClosureInfo::new(a, 1, 0, 0, vec![], None, None);
        let info_b = ClosureInfo::new(b, 1, 0, 0, vec![], None, None);
        assert_eq!(info_a.hash, info_b.hash);
    }

    #[test]
    fn different_frame_size_changes_the_hash() {
        let a = leaf(Op::Return);
        let b = leaf(Op::Return);
        let info_a = ClosureInfo::new(a, 1, 0, 0, vec![], None, None);
        let info_b = ClosureInfo::new(b, 2, 0, 0, vec![], None, None);
        assert_ne!(info_a.hash, info_b.hash);
    }

    #[test]
    fn variadic_arity_uses_bit_complement_convention() {
        let entry = leaf(Op::Return);
        let info = ClosureInfo::new(entry, 4, !2i32, 0, vec![], None, None);
        assert!(info.is_variadic());
        assert_eq!(info.named_arity(), 2);
    }

    #[test]
    fn cyclic_graph_hashing_terminates() {
        let ret = leaf(Op::Return);
        let goto = Inst::new(
            Op::Goto,
            _Source {
                name: "t.ml".into(),
                line: 2,
            },
            vec![Param::Inst(ret.clone())],
        );
        let diamond = Inst::new(
            Op::If,
            _Source {
                name: "t.ml".into(),
                line: 3,
            },
            vec![Param::Inst(goto.clone()), Param::Inst(ret.clone())],
        );
        // Back-link `ret` towards `diamond` to build a genuine cycle in
        // the `next` chain (a loop body looping back to its header) and
        // confirm the `seen`-set walk still terminates.
        ret.link(diamond.clone());
        let info = ClosureInfo::new(diamond, 1, 0, 0, vec![], None, None);
        assert_eq!(info.hash.len(), 32);
    }

    #[test]
    fn next_link_is_included_as_a_successor() {
        let ret = leaf(Op::Return);
        let pop = leaf(Op::Pop);
        pop.link(ret.clone());
        let succs: Vec<_> = pop.successors().iter().map(|i| i.op).collect();
        assert_eq!(succs, vec![Op::Return]);
    }
}
