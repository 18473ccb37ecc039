//! Content fingerprints for the cache-probe protocol.
//!
//! `serde_json` maps are key-sorted, so the compact JSON text of a value is
//! stable for equal content and the hash is stable with it.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hash arbitrary bytes into a URL-safe string.
pub fn hash_bytes(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(bytes))
}

/// Hash a single JSON value.
pub fn content_hash(value: &Value) -> String {
    hash_bytes(value.to_string().as_bytes())
}

/// Hash a delivered collection. Equal to [`content_hash`] of the same items
/// wrapped in an array.
pub fn items_hash(items: &[Value]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"[");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            hasher.update(b",");
        }
        hasher.update(item.to_string().as_bytes());
    }
    hasher.update(b"]");
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_content_equal_hash() {
        let a = json!({"id": 1, "name": "x"});
        let b = json!({"name": "x", "id": 1});
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn different_content_different_hash() {
        assert_ne!(content_hash(&json!({"v": "a"})), content_hash(&json!({"v": "b"})));
    }

    #[test]
    fn items_hash_matches_array_hash() {
        let items = vec![json!({"id": 1}), json!({"id": 2, "v": "a"})];
        assert_eq!(items_hash(&items), content_hash(&Value::Array(items.clone())));
        assert_eq!(items_hash(&[]), content_hash(&json!([])));
    }

    #[test]
    fn hash_is_url_safe() {
        let h = hash_bytes(b"feedwire");
        assert!(!h.contains('+') && !h.contains('/') && !h.contains('='));
        assert_eq!(h.len(), 43);
    }
}
