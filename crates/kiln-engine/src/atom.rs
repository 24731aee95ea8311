//! Process-global string interning.
//!
//! Symbol, file, and label names are stored once and referred to by a small
//! [`Atom`] identifier. Equal strings always produce equal atoms;
//! [`Atom::unique`] mints a fresh atom regardless, for anonymous symbols.
//! Interned strings are stable until process shutdown.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// An interned string (32-bit id). Cheap to copy and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Atom(u32);

struct AtomTable {
    map: FxHashMap<&'static str, Atom>,
    strings: Vec<&'static str>,
}

static TABLE: Lazy<Mutex<AtomTable>> = Lazy::new(|| {
    Mutex::new(AtomTable {
        map: FxHashMap::default(),
        // Id 0 is reserved for Atom::NONE.
        strings: vec![""],
    })
});

impl Atom {
    /// The absent atom. Resolves to the empty string.
    pub const NONE: Atom = Atom(0);

    /// Intern `s`, returning the existing atom if `s` was seen before.
    pub fn intern(s: &str) -> Atom {
        let mut table = TABLE.lock();
        if let Some(&atom) = table.map.get(s) {
            return atom;
        }
        let stored: &'static str = Box::leak(s.to_owned().into_boxed_str());
        let atom = Atom(table.strings.len() as u32);
        table.strings.push(stored);
        table.map.insert(stored, atom);
        atom
    }

    /// Mint a fresh atom unconditionally. The string is kept for
    /// diagnostics only; interning the same string again will *not* return
    /// this atom.
    pub fn unique(s: &str) -> Atom {
        let mut table = TABLE.lock();
        let stored: &'static str = Box::leak(s.to_owned().into_boxed_str());
        let atom = Atom(table.strings.len() as u32);
        table.strings.push(stored);
        atom
    }

    /// Resolve the atom back to its string. Unknown ids resolve to `""`.
    pub fn as_str(self) -> &'static str {
        let table = TABLE.lock();
        table.strings.get(self.0 as usize).copied().unwrap_or("")
    }

    /// Raw id, for dense side tables.
    pub fn id(self) -> u32 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Atom {
    fn from(s: &str) -> Atom {
        Atom::intern(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_deduplicates() {
        let a = Atom::intern("alpha");
        let b = Atom::intern("beta");
        let c = Atom::intern("alpha");
        assert_eq!(a, c);
        assert_ne!(a, b);
    }

    #[test]
    fn test_round_trip() {
        let a = Atom::intern("round_trip_payload");
        assert_eq!(a.as_str(), "round_trip_payload");
    }

    #[test]
    fn test_unique_never_collides() {
        let a = Atom::unique("anon");
        let b = Atom::unique("anon");
        let interned = Atom::intern("anon");
        assert_ne!(a, b);
        assert_ne!(a, interned);
        assert_ne!(b, interned);
        assert_eq!(a.as_str(), "anon");
    }

    #[test]
    fn test_none_is_empty() {
        assert_eq!(Atom::NONE.as_str(), "");
        assert!(Atom::NONE.is_none());
        assert!(!Atom::intern("x").is_none());
    }
}
