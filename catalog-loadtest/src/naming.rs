//! Stable names for generated entities.
//!
//! Names are a pure function of the entity kind and ordinal, so every worker (and every run)
//! derives the same name without coordination.

use std::collections::BTreeMap;

use crate::dataset::EntityKind;

/// Default prefix for catalog names.
pub const DEFAULT_CATALOG_PREFIX: &str = "C";

/// Produces entity names, optionally mangled into digests.
///
/// Mangled names are the lowercase hex MD5 digest of the readable name. MD5 is used for its
/// stable, fixed-length output, not for any security property.
#[derive(Clone, Debug)]
pub struct Namer {
    catalog_prefix: String,
    mangle: bool,
}

impl Namer {
    /// Creates a namer using `catalog_prefix` for catalogs.
    pub fn new(catalog_prefix: impl Into<String>, mangle: bool) -> Self {
        Self {
            catalog_prefix: catalog_prefix.into(),
            mangle,
        }
    }

    /// Returns the name of the entity of `kind` with the given `ordinal`.
    ///
    /// Catalog names are never mangled.
    pub fn name(&self, kind: EntityKind, ordinal: u64) -> String {
        let prefix = match kind {
            EntityKind::Catalog => return format!("{}_{ordinal}", self.catalog_prefix),
            EntityKind::Namespace => "NS",
            EntityKind::Table => "T",
            EntityKind::View => "V",
        };

        let readable = format!("{prefix}_{ordinal}");
        if self.mangle {
            mangle(&readable)
        } else {
            readable
        }
    }
}

impl Default for Namer {
    fn default() -> Self {
        Self::new(DEFAULT_CATALOG_PREFIX, false)
    }
}

/// Hashes `name` into 32 lowercase hex characters.
pub fn mangle(name: &str) -> String {
    format!("{:x}", md5::compute(name.as_bytes()))
}

/// The properties every generated entity is created with.
pub fn properties(count: u64) -> BTreeMap<String, String> {
    (0..count)
        .map(|i| (format!("InitialAttribute_{i}"), i.to_string()))
        .collect()
}

/// Schema column names of generated tables and views.
pub fn columns(count: u64) -> Vec<String> {
    (0..count).map(|i| format!("column{i}")).collect()
}

/// The property update applied by the `sequence`-th commit.
pub fn commit_update(sequence: u64) -> BTreeMap<String, String> {
    BTreeMap::from([(format!("commit_{sequence}"), sequence.to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readable_names() {
        let namer = Namer::default();
        assert_eq!(namer.name(EntityKind::Namespace, 3), "NS_3");
        assert_eq!(namer.name(EntityKind::Table, 0), "T_0");
        assert_eq!(namer.name(EntityKind::View, 12), "V_12");
        assert_eq!(namer.name(EntityKind::Catalog, 1), "C_1");
    }

    #[test]
    fn mangled_names_are_stable_digests() {
        let namer = Namer::new("bench", true);
        let name = namer.name(EntityKind::Namespace, 3);

        assert_eq!(name, namer.name(EntityKind::Namespace, 3));
        assert_eq!(name, mangle("NS_3"));
        assert_eq!(name.len(), 32);
        assert!(
            name.chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        );
        assert_ne!(name, namer.name(EntityKind::Table, 3));
    }

    #[test]
    fn mangling_matches_known_digest() {
        // md5("") and md5("abc") from RFC 1321.
        assert_eq!(mangle(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(mangle("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn catalogs_are_never_mangled() {
        let namer = Namer::new("bench", true);
        assert_eq!(namer.name(EntityKind::Catalog, 7), "bench_7");
    }

    #[test]
    fn mangled_length_is_fixed() {
        let namer = Namer::new("C", true);
        for ordinal in [0, 1, 9, 10, 12345, u64::MAX] {
            assert_eq!(namer.name(EntityKind::View, ordinal).len(), 32);
        }
    }

    #[test]
    fn generated_properties() {
        let props = properties(3);
        assert_eq!(props.len(), 3);
        assert_eq!(props["InitialAttribute_2"], "2");
        assert!(properties(0).is_empty());
        assert_eq!(columns(2), vec!["column0", "column1"]);
        assert_eq!(commit_update(4)["commit_4"], "4");
    }
}
