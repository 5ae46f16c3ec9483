//! The bytecode format: opcodes (`op`) and the instruction graph they
//! form together with closure metadata (`inst`). §3.7/§4.6/§6.2.

pub mod inst;
pub mod op;

pub use inst::{ClosureInfo, Decl, Inst, Param, Source};
pub use op::{Op, ParamShape};
