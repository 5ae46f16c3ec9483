//! minilang-core — value model, type lattice, method dispatch, bytecode
//! format and compound data for the Minilang runtime.
//!
//! This crate holds everything the VM needs to describe *what a value is*
//! and *how a program is shaped*, without knowing how to run one. It is
//! deliberately free of an execution loop: that lives in `minilang-vm`.
//!
//! ## Modules
//! - `value`    : the uniform tagged `Value`, its capability slots.
//! - `types`    : `Type`, the parent lattice, rank, the typed-fn table.
//! - `generics` : interned generic type instances and their subtype rules.
//! - `method`   : interned methods, multi-dispatch, the per-context cache.
//! - `iter`     : the four-function iterator protocol.
//! - `error`    : error values (kind, message, trace).
//! - `bytecode` : the opcode set and the instruction graph / closure info.
//! - `compound` : Tuple, List, Map, Names, StringBuffer, PartialFunction.
//! - `cbor`     : CBOR tag mapping for the value model (feature `cbor`).
//! - `debug_graph` : Graphviz dot-graph dump of a closure's instructions.
//!
//! ## Features
//! - **std** *(default)*: pulls in the standard library.
//! - **serde**: derives `Serialize`/`Deserialize` on the wire-format types.
//! - **tracing**: instruments type registration, method definition and
//!   dispatch-cache misses at `debug`/`trace` level.
//! - **cbor**: enables the `cbor` module (implies `serde`).

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]
#![cfg_attr(not(debug_assertions), warn(missing_docs))]

pub mod bytecode;
#[cfg(feature = "cbor")]
pub mod cbor;
pub mod compound;
pub mod debug_graph;
pub mod error;
pub mod generics;
pub mod iter;
pub mod method;
pub mod types;
pub mod value;

pub use bytecode::{ClosureInfo, Inst, Op};
pub use error::{ErrorKind, ErrorValue, TraceFrame};
pub use generics::GenericInstance;
pub use method::{Method, MethodTable};
pub use types::{Type, TypeId, TypeRegistry};
pub use value::Value;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by the value/type/method layer itself (as distinct from
/// Minilang-level `ErrorValue`s, which are ordinary script-visible data).
#[derive(Debug, Error)]
pub enum Error {
    /// A type name was registered twice, or a parent cycle was attempted.
    #[error("type registry: {0}")]
    TypeRegistry(String),

    /// `bincode` (de)serialization of a wire-format type failed.
    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),

    /// CBOR (de)serialization failed (feature `cbor`).
    #[cfg(feature = "cbor")]
    #[error("cbor: {0}")]
    Cbor(String),

    /// An invariant the core itself is responsible for was violated —
    /// never raised for user-level mistakes, only for bugs in the host.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Re-exports convenient for crates built on top of `minilang-core`.
pub mod prelude {
    pub use crate::{
        bytecode::{Inst, Op},
        compound::{List, Map, Names, PartialFunction, StringBuffer, Tuple},
        error::{ErrorKind, ErrorValue},
        method::{Method, MethodTable},
        types::{Type, TypeId, TypeRegistry},
        value::Value,
        ClosureInfo, Error, Result,
    };
}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, trace};

#[cfg(not(feature = "tracing"))]
pub(crate) mod no_tracing {
    //! Stand-ins for `tracing::{debug,trace}` macros when the `tracing`
    //! feature is off, so call sites never need `#[cfg]`.
    macro_rules! debug { ($($_:tt)*) => {}; }
    macro_rules! trace { ($($_:tt)*) => {}; }
    pub(crate) use debug;
    pub(crate) use trace;
}
#[cfg(not(feature = "tracing"))]
pub(crate) use no_tracing::{debug, trace};
