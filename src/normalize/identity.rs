//! Row identity generation
//!
//! Deterministic identities are content hashes so that the same input on two
//! runs maps to the same row. Random identities are used when rows are only
//! ever appended or replaced.

use crate::types::{canonical, key_text, RowId};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// How row identities are produced for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMode {
    Random,
    Deterministic,
}

pub fn random_id() -> RowId {
    RowId::new(uuid::Uuid::new_v4().simple().to_string())
}

/// Hash of ordered parts, truncated to 128 bits
fn digest(parts: &[&str]) -> RowId {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        // unit separator keeps ("ab", "c") and ("a", "bc") apart
        hasher.update([0x1f]);
    }
    let hash = hasher.finalize();
    RowId::new(hex::encode(&hash[..16]))
}

/// Identity of a top-level row from its declared key values
pub fn key_id(table: &str, key: &[&Value]) -> RowId {
    let encoded: Vec<String> = key.iter().map(|v| key_text(v)).collect();
    let mut parts = vec![table, "key"];
    parts.extend(encoded.iter().map(String::as_str));
    digest(&parts)
}

/// Identity of a top-level row without a declared key, from its whole content
pub fn content_id(table: &str, record: &Value) -> RowId {
    digest(&[table, "content", &canonical(record)])
}

/// Identity of an array element row, from its parent and position
pub fn child_id(parent: &RowId, table: &str, idx: usize) -> RowId {
    digest(&[parent.as_str(), table, &idx.to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_id_is_stable() {
        let a = key_id("users", &[&json!(5)]);
        let b = key_id("users", &[&json!(5)]);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 32);

        assert_ne!(a, key_id("users", &[&json!("5")]));
        assert_ne!(a, key_id("orgs", &[&json!(5)]));
        assert_eq!(a, key_id("users", &[&json!(5.0)]));
    }

    #[test]
    fn test_key_parts_do_not_run_together() {
        assert_ne!(
            key_id("t", &[&json!("ab"), &json!("c")]),
            key_id("t", &[&json!("a"), &json!("bc")])
        );
    }

    #[test]
    fn test_content_id_ignores_key_order() {
        let a = content_id("t", &json!({"a": 1, "b": [1, 2]}));
        let b = content_id("t", &json!({"b": [1, 2], "a": 1}));
        assert_eq!(a, b);
    }

    #[test]
    fn test_child_id_depends_on_position() {
        let parent = RowId::new("p");
        assert_ne!(child_id(&parent, "t__x", 0), child_id(&parent, "t__x", 1));
        assert_eq!(child_id(&parent, "t__x", 0), child_id(&parent, "t__x", 0));
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(random_id(), random_id());
    }
}
