//! Shared infrastructure for the Luna compiler.
//!
//! Everything here is used by more than one pipeline stage: the error
//! type threaded through every fallible operation, the string interner
//! shared by the scanner and the constant pool, and the hard limits the
//! bytecode format imposes.

pub mod error;
pub mod interner;
pub mod limits;

pub use error::{LunaError, LunaResult};
pub use interner::{Interner, LuaStr};
