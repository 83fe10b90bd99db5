//! Canonical object identities.
//!
//! Every indexed entity gets a deterministic, content-addressed identifier
//! derived from `(source, kind, fqname)`. Identical inputs always produce
//! the same id, so reindexing is stable unless an object's identity changes.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Length of the short, human-pastable object id fragment.
pub const OBJECT_ID_LEN: usize = 12;

/// Closed set of indexable object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Schema,
    Table,
    View,
    Column,
    Constraint,
    Index,
    Function,
    Extension,
}

impl ObjectKind {
    pub const ALL: &'static [ObjectKind] = &[
        ObjectKind::Schema,
        ObjectKind::Table,
        ObjectKind::View,
        ObjectKind::Column,
        ObjectKind::Constraint,
        ObjectKind::Index,
        ObjectKind::Function,
        ObjectKind::Extension,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Schema => "schema",
            ObjectKind::Table => "table",
            ObjectKind::View => "view",
            ObjectKind::Column => "column",
            ObjectKind::Constraint => "constraint",
            ObjectKind::Index => "index",
            ObjectKind::Function => "function",
            ObjectKind::Extension => "extension",
        }
    }

    pub fn parse(value: &str) -> Result<ObjectKind> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| Error::Config(format!("unknown object kind: {value}")))
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully normalized object ready for catalog insertion.
#[derive(Debug, Clone)]
pub struct NormalizedObject {
    pub object_id: String,
    pub schema_name: Option<String>,
    pub object_name: String,
    pub kind: ObjectKind,
    pub fqname: String,
    pub definition: String,
    pub comment: String,
    pub signature: Option<String>,
    pub owner: Option<String>,
    pub parent_object_id: Option<String>,
}

/// `schema.object`, or the bare name for schema-less objects.
pub fn make_fqname(schema_name: Option<&str>, object_name: &str) -> String {
    match schema_name {
        Some(schema) if !schema.is_empty() => format!("{schema}.{object_name}"),
        _ => object_name.to_string(),
    }
}

/// Deterministic short identifier over `(source, kind, fqname)`.
pub fn make_object_id(source_name: &str, kind: ObjectKind, fqname: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_name.as_bytes());
    hasher.update(b":");
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(fqname.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..OBJECT_ID_LEN].to_string()
}

/// Canonicalize a DDL signature snippet: lowercased type names, single
/// spaces, declared order preserved.
pub fn normalize_signature(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[allow(clippy::too_many_arguments)]
pub fn normalize_object(
    source_name: &str,
    schema_name: Option<&str>,
    object_name: &str,
    kind: ObjectKind,
    definition: Option<&str>,
    comment: Option<&str>,
    signature: Option<&str>,
    owner: Option<&str>,
    parent_object_id: Option<&str>,
) -> NormalizedObject {
    let fqname = make_fqname(schema_name, object_name);
    let object_id = make_object_id(source_name, kind, &fqname);
    NormalizedObject {
        object_id,
        schema_name: schema_name.map(str::to_string),
        object_name: object_name.to_string(),
        kind,
        fqname,
        definition: definition.unwrap_or("").trim().to_string(),
        comment: comment.unwrap_or("").trim().to_string(),
        signature: signature.map(normalize_signature),
        owner: owner.map(str::to_string),
        parent_object_id: parent_object_id.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fqname_uses_schema_when_present() {
        assert_eq!(make_fqname(Some("sales"), "orders"), "sales.orders");
        assert_eq!(make_fqname(None, "public"), "public");
        assert_eq!(make_fqname(Some(""), "ext"), "ext");
    }

    #[test]
    fn object_id_is_stable_and_short() {
        let a = make_object_id("work", ObjectKind::Table, "sales.orders");
        let b = make_object_id("work", ObjectKind::Table, "sales.orders");
        assert_eq!(a, b);
        assert_eq!(a.len(), OBJECT_ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn object_id_changes_with_any_identity_part() {
        let base = make_object_id("work", ObjectKind::Table, "sales.orders");
        assert_ne!(base, make_object_id("other", ObjectKind::Table, "sales.orders"));
        assert_ne!(base, make_object_id("work", ObjectKind::View, "sales.orders"));
        assert_ne!(base, make_object_id("work", ObjectKind::Table, "sales.refunds"));
    }

    #[test]
    fn signature_is_canonicalized() {
        assert_eq!(
            normalize_signature("  id   BIGINT,\n  name TEXT "),
            "id bigint, name text"
        );
    }

    #[test]
    fn kind_round_trips() {
        for kind in ObjectKind::ALL {
            assert_eq!(ObjectKind::parse(kind.as_str()).unwrap(), *kind);
        }
        assert!(ObjectKind::parse("procedure").is_err());
    }
}
