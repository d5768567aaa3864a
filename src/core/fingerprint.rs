use std::fmt::Write as _;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::core::domain::EditParams;

/// Content fingerprint of an edit job: SHA-256 over the canonical JSON of the
/// cache-relevant parameters. Input order is part of the identity (concat is
/// order-sensitive); everything else in the spec is ignored.
pub fn fingerprint(params: &EditParams) -> String {
    let value = serde_json::json!({
        "fps": params.fps,
        "height": params.height,
        "inputs": params.inputs,
        "preset": params.preset,
        "width": params.width,
    });
    let canonical = canonicalize(&value);
    let digest = Sha256::digest(canonical.as_bytes());
    to_hex(&digest)
}

/// Deterministic textual form of a JSON tree: object keys sorted, numbers
/// normalized so `30`, `30.0` and `3e1` all canonicalize identically.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => {
            let _ = write!(out, "{b}");
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                let _ = write!(out, "{i}.000000");
            } else if let Some(u) = n.as_u64() {
                let _ = write!(out, "{u}.000000");
            } else {
                let f = n.as_f64().unwrap_or(0.0);
                let _ = write!(out, "{f:.6}");
            }
        }
        Value::String(s) => {
            // serde_json escaping keeps embedded quotes unambiguous.
            let _ = write!(out, "{}", Value::String(s.clone()));
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}:", Value::String((*key).clone()));
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(inputs: &[&str], width: i64, height: i64, fps: i64, preset: &str) -> EditParams {
        EditParams {
            out_path: "./output/x.mp4".into(),
            width,
            height,
            fps,
            preset: preset.into(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            oss_output: None,
        }
    }

    #[test]
    fn equal_parameters_produce_equal_fingerprints() {
        let a = fingerprint(&params(&["a.ts", "b.ts"], 640, 480, 30, "fast"));
        let b = fingerprint(&params(&["a.ts", "b.ts"], 640, 480, 30, "fast"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn fingerprint_ignores_non_cache_parameters() {
        let mut one = params(&["a.ts"], 640, 480, 30, "fast");
        let mut two = one.clone();
        one.out_path = "./output/one.mp4".into();
        two.out_path = "./elsewhere/two.mp4".into();
        two.oss_output = Some("bucket/key.mp4".into());
        assert_eq!(fingerprint(&one), fingerprint(&two));
    }

    #[test]
    fn any_cache_relevant_difference_changes_the_fingerprint() {
        let base = params(&["a.ts", "b.ts"], 640, 480, 30, "fast");
        let variants = [
            params(&["b.ts", "a.ts"], 640, 480, 30, "fast"),
            params(&["a.ts", "b.ts"], 641, 480, 30, "fast"),
            params(&["a.ts", "b.ts"], 640, 481, 30, "fast"),
            params(&["a.ts", "b.ts"], 640, 480, 29, "fast"),
            params(&["a.ts", "b.ts"], 640, 480, 30, "medium"),
            params(&["a.ts"], 640, 480, 30, "fast"),
        ];
        let reference = fingerprint(&base);
        for variant in &variants {
            assert_ne!(reference, fingerprint(variant), "variant {variant:?}");
        }
    }

    #[test]
    fn canonicalize_sorts_keys_and_normalizes_numbers() {
        let a = canonicalize(&json!({"b": 30, "a": 1.5}));
        let b = canonicalize(&json!({"a": 1.5, "b": 30.0}));
        assert_eq!(a, b);
        assert_eq!(a, r#"{"a":1.500000,"b":30.000000}"#);
    }
}
