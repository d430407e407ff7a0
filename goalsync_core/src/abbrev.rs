//! Abbreviation table: full goal names <-> compact wire keys.
//!
//! Goal updates fire on every meaningful change of every animating entity,
//! so the child keys of an entity map are kept short. Names missing from the
//! table are used verbatim: a new property works immediately, only with a
//! longer key.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Built-in `(name, key)` pairs shared by every client of a session.
pub const STANDARD_ABBREVIATIONS: &[(&str, &str)] = &[
    ("position", "p"),
    ("rotation", "r"),
    ("scale", "s"),
    ("color", "c"),
    ("label", "l"),
    ("locked", "lk"),
    ("asset", "a"),
    ("animationMesh", "anm"),
    ("animationClip", "anc"),
    ("visible", "v"),
    ("pointer", "pt"),
    ("pose", "ps"),
    ("opacity", "o"),
];

/// Bidirectional name/key lookup.
#[derive(Debug, Clone)]
pub struct AbbreviationTable {
    to_key: HashMap<String, String>,
    to_name: HashMap<String, String>,
    pairs: Vec<(String, String)>,
}

impl AbbreviationTable {
    /// Builds a table from `(name, key)` pairs.
    ///
    /// Returns `None` if a name or key appears twice.
    pub fn new<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Option<Self> {
        let mut table = Self {
            to_key: HashMap::new(),
            to_name: HashMap::new(),
            pairs: Vec::new(),
        };
        for (name, key) in pairs {
            if table.to_key.contains_key(name) || table.to_name.contains_key(key) {
                return None;
            }
            table.to_key.insert(name.to_string(), key.to_string());
            table.to_name.insert(key.to_string(), name.to_string());
            table.pairs.push((name.to_string(), key.to_string()));
        }
        Some(table)
    }

    /// The process-wide standard table.
    pub fn standard() -> &'static AbbreviationTable {
        static TABLE: OnceLock<AbbreviationTable> = OnceLock::new();
        TABLE.get_or_init(|| {
            AbbreviationTable::new(STANDARD_ABBREVIATIONS.iter().copied())
                .unwrap_or_else(AbbreviationTable::empty)
        })
    }

    /// A table that abbreviates nothing.
    pub fn empty() -> Self {
        Self {
            to_key: HashMap::new(),
            to_name: HashMap::new(),
            pairs: Vec::new(),
        }
    }

    /// Wire key for `name`; untabulated names map to themselves.
    pub fn lookup<'a>(&'a self, name: &'a str) -> &'a str {
        self.to_key.get(name).map(String::as_str).unwrap_or(name)
    }

    /// Full name for a wire key; unknown keys map to themselves.
    pub fn expand<'a>(&'a self, key: &'a str) -> &'a str {
        self.to_name.get(key).map(String::as_str).unwrap_or(key)
    }

    pub fn is_tabulated(&self, name: &str) -> bool {
        self.to_key.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Stable FNV-1a hash of the table contents.
    ///
    /// Clients sharing a room must run the same table; comparing
    /// fingerprints at join time detects mismatched builds.
    pub fn fingerprint(&self) -> u64 {
        const OFFSET: u64 = 0xcbf29ce484222325;
        const PRIME: u64 = 0x100000001b3;

        let mut sorted = self.pairs.clone();
        sorted.sort();
        let mut hash = OFFSET;
        for (name, key) in &sorted {
            for byte in name.bytes().chain([0u8]).chain(key.bytes()).chain([0xffu8]) {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(PRIME);
            }
        }
        hash
    }
}

impl Default for AbbreviationTable {
    fn default() -> Self {
        Self::standard().clone()
    }
}
