//! Interned symbols for names, tags, node kinds and string values.
//!
//! Every string the engine manipulates is interned once into a process-wide
//! table and referred to by a `Symbol` (a `u32` index). This keeps vectors of
//! strings cheap to clone and compare, and makes name environments plain
//! integer-keyed maps. The table is append-only and never freed; published
//! entries are immutable, so handing out `&'static str` is safe.
//!
//! Symbols serialize as their string form so that state snapshots survive a
//! restart with a differently-populated table.

use std::{
    fmt,
    sync::{LazyLock, RwLock},
};

use ahash::AHashMap;

/// Index into the process-wide symbol table.
///
/// Uses `u32` to keep values and AST nodes small; four billion distinct
/// strings is far beyond any real program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

struct SymbolTable {
    names: Vec<&'static str>,
    index: AHashMap<&'static str, u32>,
}

static TABLE: LazyLock<RwLock<SymbolTable>> = LazyLock::new(|| {
    RwLock::new(SymbolTable {
        names: Vec::new(),
        index: AHashMap::new(),
    })
});

impl Symbol {
    /// Interns `name`, returning the existing id if it was seen before.
    pub fn new(name: &str) -> Self {
        {
            let table = TABLE.read().expect("symbol table poisoned");
            if let Some(&id) = table.index.get(name) {
                return Self(id);
            }
        }
        let mut table = TABLE.write().expect("symbol table poisoned");
        // Double-checked: another thread may have interned between the locks.
        if let Some(&id) = table.index.get(name) {
            return Self(id);
        }
        let id = u32::try_from(table.names.len()).expect("symbol table overflow");
        // Leaked intentionally: entries live for the process lifetime and the
        // table is bounded by the set of distinct strings in loaded programs.
        let leaked: &'static str = Box::leak(name.to_owned().into_boxed_str());
        table.names.push(leaked);
        table.index.insert(leaked, id);
        Self(id)
    }

    /// Resolves the symbol back to its string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        let table = TABLE.read().expect("symbol table poisoned");
        table.names[self.0 as usize]
    }
}

impl From<&str> for Symbol {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for Symbol {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for Symbol {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl serde::de::Visitor<'_> for Visitor {
            type Value = Symbol;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an interned symbol string")
            }

            fn visit_str<E: serde::de::Error>(self, value: &str) -> Result<Symbol, E> {
                Ok(Symbol::new(value))
            }
        }

        deserializer.deserialize_str(Visitor)
    }
}
