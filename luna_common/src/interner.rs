//! Interned strings.
//!
//! Luna strings are byte strings. The scanner funnels every name, string
//! literal, and label through one per-compilation [`Interner`], so each
//! distinct content exists exactly once and handle comparison is as good
//! as pointer comparison. Short strings (at most [`MAX_SHORT_LEN`] bytes)
//! are the only ones eligible for the `_K`-field opcode variants.

use std::fmt;
use std::rc::Rc;

use hashbrown::HashSet;
use serde::de::{Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Strings up to this length count as "short" for the field opcodes.
pub const MAX_SHORT_LEN: usize = 40;

/// A cheap-to-clone handle to an interned byte string.
#[derive(Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct LuaStr(Rc<[u8]>);

impl LuaStr {
    /// Create a detached (non-interned) string. Interned and detached
    /// handles still compare equal by content; the loader uses this when
    /// no interner is in play.
    pub fn detached(bytes: &[u8]) -> Self {
        LuaStr(Rc::from(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_short(&self) -> bool {
        self.0.len() <= MAX_SHORT_LEN
    }

    /// Lossy UTF-8 view for messages and listings.
    pub fn display(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl fmt::Display for LuaStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display())
    }
}

impl fmt::Debug for LuaStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LuaStr({:?})", self.display())
    }
}

impl From<&str> for LuaStr {
    fn from(s: &str) -> Self {
        LuaStr::detached(s.as_bytes())
    }
}

impl std::borrow::Borrow<[u8]> for LuaStr {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for LuaStr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(&self.0) {
            Ok(s) => serializer.serialize_str(s),
            Err(_) => serializer.serialize_bytes(&self.0),
        }
    }
}

impl<'de> Deserialize<'de> for LuaStr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BytesVisitor;
        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = LuaStr;
            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string or byte array")
            }
            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<LuaStr, E> {
                Ok(LuaStr::detached(v.as_bytes()))
            }
            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<LuaStr, E> {
                Ok(LuaStr::detached(v))
            }
            fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<LuaStr, A::Error> {
                let mut bytes = Vec::new();
                while let Some(b) = seq.next_element::<u8>()? {
                    bytes.push(b);
                }
                Ok(LuaStr::detached(&bytes))
            }
        }
        deserializer.deserialize_any(BytesVisitor)
    }
}

/// One-per-compilation string table. Keeps every string the scanner has
/// produced alive until the compilation ends, and unifies duplicates.
#[derive(Default)]
pub struct Interner {
    strings: HashSet<LuaStr>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find or create the unique handle for `bytes`.
    pub fn intern(&mut self, bytes: &[u8]) -> LuaStr {
        if let Some(existing) = self.strings.get(bytes) {
            return existing.clone();
        }
        let s = LuaStr::detached(bytes);
        self.strings.insert(s.clone());
        s
    }

    pub fn intern_str(&mut self, s: &str) -> LuaStr {
        self.intern(s.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_unifies_duplicates() {
        let mut interner = Interner::new();
        let a = interner.intern(b"print");
        let b = interner.intern(b"print");
        assert_eq!(a, b);
        assert_eq!(interner.len(), 1);
        assert!(Rc::ptr_eq(&a.0, &b.0));
    }

    #[test]
    fn short_string_threshold() {
        let short = LuaStr::detached(&[b'a'; MAX_SHORT_LEN]);
        let long = LuaStr::detached(&[b'a'; MAX_SHORT_LEN + 1]);
        assert!(short.is_short());
        assert!(!long.is_short());
    }

    #[test]
    fn detached_compares_by_content() {
        let mut interner = Interner::new();
        let interned = interner.intern(b"x");
        assert_eq!(interned, LuaStr::detached(b"x"));
    }
}
