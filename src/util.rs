//! Small shared helpers with no better home.

/// Lowercase hex encoding, used for SHA-1 fingerprints and SHA-256 content
/// hashes throughout the broker (config fingerprinting, trust hashing,
/// collision suffixing).
#[must_use]
pub fn hex_encode(bytes: impl AsRef<[u8]>) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.as_ref().len() * 2);
    for b in bytes.as_ref() {
        write!(s, "{b:02x}").expect("writing to a String never fails");
    }
    s
}

/// Serialize a JSON value with object keys sorted recursively, so two
/// values that differ only in field insertion order produce identical
/// output. Used for the worker's config fingerprint (§4.5) so key
/// reordering in a `.mcp.json` edit doesn't spuriously invalidate workers.
#[must_use]
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn sorted(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().map(|(k, v)| (k.clone(), sorted(v))).collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                serde_json::Value::Object(entries.into_iter().collect())
            }
            serde_json::Value::Array(items) => serde_json::Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_encode_matches_known_vector() {
        assert_eq!(hex_encode([0xde, 0xad, 0xbe, 0xef]), "deadbeef");
    }

    #[test]
    fn canonical_json_ignores_key_order() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn canonical_json_distinguishes_different_values() {
        let a = serde_json::json!({"a": 1});
        let b = serde_json::json!({"a": 2});
        assert_ne!(canonical_json(&a), canonical_json(&b));
    }
}
