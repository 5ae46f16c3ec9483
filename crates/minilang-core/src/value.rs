//! The uniform, dynamically-typed value used throughout the runtime.
//!
//! Every [`Value`] answers to the same four capability slots — `hash`,
//! `call`, `deref`, `assign` — dispatched through its [`Type`](crate::types::Type).
//! Built-in variants (`Bool`, `Integer`, …) have a fixed, well-known type;
//! user-defined types are represented uniformly as [`Object`] instances
//! carrying a field vector alongside their type pointer.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::compound::{List, Map, Names, PartialFunction, StringBuffer, Tuple};
use crate::error::ErrorValue;
use crate::method::Method;
use crate::types::Type;

/// Shared, interior-mutable handle — the runtime's GC story is "reference
/// counted, never collected across a cycle"; cyclic closures are resolved
/// through the forward-declare/back-patch protocol instead of a tracing GC.
pub type Gc<T> = Rc<RefCell<T>>;

/// The result of a call, from the callee's perspective: either a value to
/// hand back, or a Minilang error value propagating up the call chain.
pub type CallResult = Result<Value, ErrorValue>;

/// Anything that can be resumed with a result value — the "caller state"
/// of continuation-passing style. Implemented by VM frames (in
/// `minilang-vm`) and by small native trampolines used to drive a call
/// from host code without a surrounding frame.
///
/// `run` never recurses into the next caller directly; it returns a
/// [`Step`] so that a trampoline loop (owned by whoever initiated the
/// call) can keep pumping without growing the host stack.
pub trait Caller: fmt::Debug {
    /// Resume this caller with `result`, producing the next step.
    fn run(self: Rc<Self>, result: CallResult) -> Step;

    /// Type-erased downcast hook. `Value::Continuation` holds a bare
    /// `Rc<dyn Caller>`; resuming one with a *new* caller (generator
    /// consumers like `all`/`map` do this on every step, §4.7/§4.9) needs
    /// to recover the concrete frame type to update it, which a trait
    /// object alone can't do.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// One step of a continuation-passing call chain.
pub enum Step {
    /// The whole chain has unwound back to its origin; this is the final
    /// result of the original call.
    Done(CallResult),
    /// Hand `result` to `next` and keep pumping.
    Continue { next: Rc<dyn Caller>, result: CallResult },
}

impl Step {
    /// Drive a [`Step`] chain to completion. Used by host code and tests
    /// that don't otherwise own a trampoline loop.
    pub fn drain(mut self) -> CallResult {
        loop {
            match self {
                Step::Done(r) => return r,
                Step::Continue { next, result } => self = next.run(result),
            }
        }
    }
}

/// The `call` slot: invokes a value as if it were a function, in
/// continuation-passing style. Boxed rather than a bare function pointer
/// because closures over VM state (in particular, `minilang-vm`'s
/// `ClosureT.call` override) need to capture an execution context.
pub type CallSlot = Rc<dyn Fn(Rc<dyn Caller>, &Value, &[Value]) -> Step>;

/// The `hash` slot. Takes a cycle-breaking chain of `(value, index)` pairs
/// so that self-referential compound values terminate: on encountering a
/// value already present in the chain, the hash folds in the chain index
/// of the enclosing occurrence instead of recursing.
pub type HashSlot = fn(&Value, &[(*const (), usize)]) -> i64;

/// The `deref` slot: resolves a reference-like value to the value it
/// currently holds. Must be idempotent.
pub type DerefSlot = fn(&Value) -> Value;

/// The `assign` slot: stores `rhs` through a reference-like value,
/// returning the stored value or a `TypeError` if not assignable.
pub type AssignSlot = fn(&Value, Value) -> CallResult;

/// A user-defined value: a type pointer plus its declared fields in
/// definition order. The uniform representation that lets `new_type`
/// create genuinely new kinds of value without the core knowing their
/// shape ahead of time.
#[derive(Debug)]
pub struct ObjectInstance {
    pub ty: Rc<Type>,
    pub fields: RefCell<Vec<Value>>,
}

/// A native function: a host-provided callable that does not go through
/// the bytecode VM at all (the `ml_function_t` case — `Data` plus a
/// callback).
pub struct NativeFunction {
    pub name: &'static str,
    pub callback: Rc<dyn Fn(Rc<dyn Caller>, &[Value]) -> Step>,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}

/// A mutable reference cell — what `VAR`-kind locals and upvalues are
/// boxed in, and the payload of the `REF`/`REFI`/`REFX` opcodes.
#[derive(Debug, Clone)]
pub struct Reference(pub Gc<Value>);

/// A closure's immutable, shared metadata: entry instruction, frame
/// layout, declared arity, and a content hash. Lives in
/// `crate::bytecode::inst`; re-exported here for convenience since it is
/// the payload of `Value::Closure`.
pub use crate::bytecode::inst::ClosureInfo;

/// A closure value: closure info plus the upvalues captured at creation.
#[derive(Debug)]
pub struct Closure {
    pub info: Rc<ClosureInfo>,
    pub upvalues: Vec<Gc<Value>>,
    /// The type `CLOSURE_TYPED` pops and attaches, distinguishing this
    /// closure's runtime type from the generic `Closure` type (e.g. a
    /// method body that must answer `typeof` as its declared return
    /// type). `None` for an ordinary `CLOSURE`.
    pub ty: Option<Rc<Type>>,
}

/// A forward-declared binding awaiting its value (the `LETI`/`REFI`
/// back-patch protocol, §9 "Cyclic references"). Holds the list of
/// reference cells that must be overwritten once the real value is known.
#[derive(Debug, Default)]
pub struct Uninitialized {
    pub waiters: RefCell<Vec<Gc<Value>>>,
}

/// The uniform, dynamically-typed runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    /// The canonical "nothing" value — also what `iterate`/`next` return
    /// to signal an exhausted or empty sequence.
    Nil,
    /// A distinguished singleton distinct from `Nil`, used where a
    /// protocol must tell "no value" apart from "a real value that
    /// happens to be nil" (mirrors `MLSome` in the original type table).
    Some,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Str(Rc<str>),
    Method(Rc<Method>),
    Tuple(Rc<Tuple>),
    List(Gc<List>),
    Map(Gc<Map>),
    Names(Rc<Names>),
    StringBuffer(Gc<StringBuffer>),
    Closure(Rc<Closure>),
    Partial(Rc<PartialFunction>),
    Function(Rc<NativeFunction>),
    Reference(Reference),
    /// A suspended or active call frame, resumable as a value (§3.4).
    Continuation(Rc<dyn Caller>),
    Uninitialized(Rc<Uninitialized>),
    Error(Rc<ErrorValue>),
    /// A type, which is itself a value (types double as modules).
    Type(Rc<Type>),
    /// An instance of a user-defined (non-built-in) type.
    Object(Rc<ObjectInstance>),
}

impl Value {
    /// Shorthand for constructing an interned string value.
    pub fn str(s: impl Into<Rc<str>>) -> Value {
        Value::Str(s.into())
    }

    /// True for any value that is not `Nil` — the truthiness used by
    /// `IF`/`AND`/`OR`/`ELSE` opcodes.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil)
    }

    /// `deref` is total and must be idempotent: for any non-reference
    /// value it returns a clone of itself; `Reference` and
    /// `Uninitialized` are the only variants the core itself treats
    /// specially (a `Type`'s registered `deref` slot may override this
    /// for user types, but the built-ins follow this rule exactly).
    pub fn deref(&self) -> Value {
        match self {
            Value::Reference(r) => r.0.borrow().deref(),
            other => other.clone(),
        }
    }

    /// `assign` through a reference-like value. Non-reference values
    /// reject assignment with a `TypeError`, per §3.1's invariant.
    pub fn assign(&self, rhs: Value) -> CallResult {
        match self {
            Value::Reference(r) => {
                *r.0.borrow_mut() = rhs.clone();
                Ok(rhs)
            }
            Value::Uninitialized(u) => {
                for waiter in u.waiters.borrow_mut().drain(..) {
                    *waiter.borrow_mut() = rhs.clone();
                }
                Ok(rhs)
            }
            _ => Err(ErrorValue::new(
                crate::error::ErrorKind::TypeError,
                "not assignable",
            )),
        }
    }
}

/// The default `hash` slot (§3.1/§4.1) installed for every built-in type
/// by `TypeRegistry::new`. Derefs first, then folds scalars directly and
/// recurses into compounds, breaking cycles the way the spec's chain
/// parameter describes: a compound already present in `chain` folds in
/// the chain index of its enclosing occurrence instead of recursing
/// forever.
pub fn hash_value(value: &Value, chain: &[(*const (), usize)]) -> i64 {
    fn fnv1a(bytes: &[u8]) -> i64 {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in bytes {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        h as i64
    }

    fn fold(chain: &[(*const (), usize)], ptr: *const (), elems: impl Iterator<Item = i64>) -> i64 {
        if let Some((_, idx)) = chain.iter().find(|(p, _)| *p == ptr) {
            return (*idx as i64).wrapping_mul(0x9e3779b9);
        }
        let mut next_chain = chain.to_vec();
        next_chain.push((ptr, chain.len()));
        let mut h: i64 = 17;
        for e in elems {
            h = h.wrapping_mul(31).wrapping_add(e);
        }
        h
    }

    match value.deref() {
        Value::Nil => 0,
        Value::Some => 1,
        Value::Bool(b) => b as i64 + 2,
        Value::Integer(i) => i,
        Value::Real(r) => r.to_bits() as i64,
        Value::Str(s) => fnv1a(s.as_bytes()),
        Value::Tuple(t) => {
            let ptr = Rc::as_ptr(&t) as *const ();
            fold(chain, ptr, {
                let next_chain = {
                    let mut c = chain.to_vec();
                    c.push((ptr, chain.len()));
                    c
                };
                t.values.iter().map(move |v| hash_value(v, &next_chain)).collect::<Vec<_>>().into_iter()
            })
        }
        Value::List(l) => {
            let ptr = Rc::as_ptr(&l) as *const ();
            let values = l.borrow().to_vec();
            let next_chain = {
                let mut c = chain.to_vec();
                c.push((ptr, chain.len()));
                c
            };
            fold(chain, ptr, values.iter().map(move |v| hash_value(v, &next_chain)).collect::<Vec<_>>().into_iter())
        }
        Value::Map(m) => {
            let ptr = Rc::as_ptr(&m) as *const ();
            let next_chain = {
                let mut c = chain.to_vec();
                c.push((ptr, chain.len()));
                c
            };
            let pairs: Vec<i64> = m
                .borrow()
                .iter()
                .map(|(k, v)| hash_value(k, &next_chain).wrapping_add(hash_value(v, &next_chain)))
                .collect();
            fold(chain, ptr, pairs.into_iter())
        }
        Value::Method(m) => Rc::as_ptr(&m) as i64,
        Value::Closure(c) => Rc::as_ptr(&c) as i64,
        Value::Partial(p) => Rc::as_ptr(&p) as i64,
        Value::Function(f) => Rc::as_ptr(&f) as i64,
        Value::Names(n) => Rc::as_ptr(&n) as i64,
        Value::StringBuffer(sb) => Rc::as_ptr(&sb) as *const () as i64,
        Value::Reference(r) => Rc::as_ptr(&r.0) as *const () as i64,
        Value::Continuation(c) => Rc::as_ptr(&c) as *const () as i64,
        Value::Uninitialized(u) => Rc::as_ptr(&u) as i64,
        Value::Error(e) => Rc::as_ptr(&e) as i64,
        Value::Type(t) => Rc::as_ptr(&t) as i64,
        Value::Object(o) => {
            let ptr = Rc::as_ptr(&o) as *const ();
            let next_chain = {
                let mut c = chain.to_vec();
                c.push((ptr, chain.len()));
                c
            };
            fold(chain, ptr, o.fields.borrow().iter().map(|v| hash_value(v, &next_chain)).collect::<Vec<_>>().into_iter())
        }
    }
}

/// Structural `=` (§4.10's "keys are compared by hash then by `=`
/// method"), used by [`crate::compound::Map`]'s key lookup: recurses into
/// `Tuple`/`List`/`Map` element-wise rather than stopping at pointer
/// identity. Reference-like or callable values (closures, continuations,
/// partial functions, types, objects, …) fall back to pointer identity,
/// since they have no spec-given structural equality of their own.
pub fn values_deep_equal(a: &Value, b: &Value) -> bool {
    match (a.deref(), b.deref()) {
        (Value::Nil, Value::Nil) | (Value::Some, Value::Some) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Integer(x), Value::Integer(y)) => x == y,
        (Value::Real(x), Value::Real(y)) => x == y,
        (Value::Integer(x), Value::Real(y)) | (Value::Real(y), Value::Integer(x)) => x as f64 == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Tuple(x), Value::Tuple(y)) => {
            x.values.len() == y.values.len() && x.values.iter().zip(y.values.iter()).all(|(a, b)| values_deep_equal(a, b))
        }
        (Value::List(x), Value::List(y)) => {
            let (xv, yv) = (x.borrow().to_vec(), y.borrow().to_vec());
            xv.len() == yv.len() && xv.iter().zip(yv.iter()).all(|(a, b)| values_deep_equal(a, b))
        }
        (Value::Map(x), Value::Map(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).is_some_and(|yv| values_deep_equal(v, yv)))
        }
        (Value::Method(x), Value::Method(y)) => Rc::ptr_eq(&x, &y),
        (Value::Closure(x), Value::Closure(y)) => Rc::ptr_eq(&x, &y),
        (Value::Partial(x), Value::Partial(y)) => Rc::ptr_eq(&x, &y),
        (Value::Function(x), Value::Function(y)) => Rc::ptr_eq(&x, &y),
        (Value::Type(x), Value::Type(y)) => Rc::ptr_eq(&x, &y),
        (Value::Object(x), Value::Object(y)) => Rc::ptr_eq(&x, &y),
        _ => false,
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Some => write!(f, "some"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Real(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Method(m) => write!(f, "<method {}>", m.name),
            Value::Tuple(t) => {
                write!(f, "(")?;
                for (i, v) in t.values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
            Value::List(l) => write!(f, "{}", l.borrow()),
            Value::Map(m) => write!(f, "{}", m.borrow()),
            Value::Names(n) => write!(f, "{:?}", n.names),
            Value::StringBuffer(_) => write!(f, "<stringbuffer>"),
            Value::Closure(c) => write!(f, "<closure/{}>", c.info.num_params),
            Value::Partial(_) => write!(f, "<partial>"),
            Value::Function(n) => write!(f, "<function {}>", n.name),
            Value::Reference(_) => write!(f, "<reference>"),
            Value::Continuation(_) => write!(f, "<continuation>"),
            Value::Uninitialized(_) => write!(f, "<uninitialized>"),
            Value::Error(e) => write!(f, "<error {}: {}>", e.kind, e.message),
            Value::Type(t) => write!(f, "<type {}>", t.name),
            Value::Object(o) => write!(f, "<{} instance>", o.ty.name),
        }
    }
}
