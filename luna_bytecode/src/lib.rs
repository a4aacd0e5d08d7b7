//! Bytecode data model for the Luna register VM.
//!
//! This crate owns everything about compiled functions that outlives a
//! compilation: the opcode set, the packed 32-bit instruction word, the
//! constant value representation, the function prototype, and the binary
//! chunk reader/writer.

pub mod dump;
pub mod instruction;
pub mod opcode;
pub mod proto;
pub mod undump;
pub mod value;

pub use instruction::Instruction;
pub use opcode::{OpCode, OpMode};
pub use proto::{AbsLineInfo, Closure, LocVar, Proto, UpvalDesc};
pub use value::Value;
