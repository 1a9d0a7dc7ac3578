//! Deterministic hash-based identity for exposed classes.
//!
//! A [`TypeHash`] is computed from the fully qualified Rust type name of the
//! exposed type, so two sessions exposing the same type agree on its hash
//! and cast tables can be keyed by it.
//!
//! # Examples
//!
//! ```
//! use hostbind_core::TypeHash;
//!
//! let a = TypeHash::from_name("game::Counter");
//! let b = TypeHash::from_name("game::Counter");
//! assert_eq!(a, b);
//! assert_ne!(a, TypeHash::from_name("game::Timer"));
//! ```

use std::fmt;
use xxhash_rust::xxh64::xxh64;

/// Domain marker mixed into class hashes.
const TYPE_DOMAIN: u64 = 0x2fac10b63a6cc57c;

/// A 64-bit hash identifying an exposed class.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeHash(pub u64);

impl TypeHash {
    #[inline]
    pub fn from_name(name: &str) -> Self {
        TypeHash(TYPE_DOMAIN ^ xxh64(name.as_bytes(), 0))
    }
}

impl fmt::Debug for TypeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeHash({:#018x})", self.0)
    }
}

impl fmt::Display for TypeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}
