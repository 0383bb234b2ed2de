//! Hashing - SHA-256 for manifests and prepare fingerprints
//!
//! Deterministic hashes: identical input always yields the identical digest,
//! across runs and machines.

use serde::Serialize;
use serde_json::{to_string, Value};
use sha2::{Digest, Sha256};

/// Length of the script hash embedded in automatic prepare tags.
pub const PREPARE_HASH_LEN: usize = 16;

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Convert to canonical JSON (sorted keys, no whitespace)
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v: Value = serde_json::to_value(value)?;
    to_string(&sort_value(&v))
}

fn sort_value(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sort_value(v)))
                    .collect(),
            )
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_value).collect()),
        _ => v.clone(),
    }
}

/// Digest of a compiled manifest
pub fn compute_manifest_hash<T: Serialize>(manifest: &T) -> Result<String, serde_json::Error> {
    let canonical = canonical_json(manifest)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Build run hash: sha256(appname + meta_version + manifest_hash + engine_version)
pub fn compute_build_hash(
    appname: &str,
    meta_version: &str,
    manifest_hash: &str,
    engine_version: &str,
) -> String {
    let combined = format!("{}:{}:{}:{}", appname, meta_version, manifest_hash, engine_version);
    sha256_hex(combined.as_bytes())
}

/// First 16 hex chars of sha256(base + " && ".join(script)).
pub fn prepare_script_hash(base: &str, script: &[String]) -> String {
    let content = format!("{}{}", base, script.join(" && "));
    let mut digest = sha256_hex(content.as_bytes());
    digest.truncate(PREPARE_HASH_LEN);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorted() {
        let obj = json!({"z": 1, "a": 2, "m": {"y": 1, "b": 2}});
        let canonical = canonical_json(&obj).unwrap();
        assert_eq!(canonical, r#"{"a":2,"m":{"b":2,"y":1},"z":1}"#);
    }

    #[test]
    fn test_sha256_known_value() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_prepare_hash_deterministic() {
        let script = vec!["( npm install )".to_string(), "( ls -1 | xargs rm -rf )".to_string()];
        let h1 = prepare_script_hash("node:8", &script);
        let h2 = prepare_script_hash("node:8", &script);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), PREPARE_HASH_LEN);
        assert_ne!(h1, prepare_script_hash("node:10", &script));
        assert_eq!(
            h1,
            sha256_hex("node:8( npm install ) && ( ls -1 | xargs rm -rf )".as_bytes())[..16]
        );
    }

    #[test]
    fn test_manifest_hash_stable() {
        let a = json!({"appname": "hello", "procs": {"web": 1, "worker": 2}});
        let b = json!({"procs": {"worker": 2, "web": 1}, "appname": "hello"});
        assert_eq!(compute_manifest_hash(&a).unwrap(), compute_manifest_hash(&b).unwrap());
    }
}
