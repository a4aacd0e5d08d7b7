//! Lexical analysis for the Luna language.
//!
//! The scanner consumes a byte stream with one byte of lookahead and
//! produces the current token plus at most one token of lookahead. All
//! strings (names, literals, labels) are interned through the
//! compilation's shared [`luna_common::Interner`].

pub mod lexer;
pub mod numeral;
pub mod reader;
pub mod token;

pub use lexer::Lexer;
pub use numeral::Numeral;
pub use reader::ByteReader;
pub use token::Token;
