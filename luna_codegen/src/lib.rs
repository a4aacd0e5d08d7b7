//! Code generation for the Luna compiler.
//!
//! The parser drives this crate: expressions live as deferred
//! [`exp::ExpDesc`] descriptors until the grammar forces them into
//! registers, and all instruction emission, register bookkeeping,
//! constant pooling, and jump patching happen through the [`Compiler`]
//! methods defined across the modules here.

pub mod code;
pub mod exp;
pub mod fold;
pub mod func_state;
pub mod ops;
pub mod scope;

pub use exp::{ExpDesc, ExpKind};
pub use func_state::{Block, Compiler, Dyndata, FuncState, LabelDesc, VarDesc};
pub use ops::{BinOp, UnOp};
