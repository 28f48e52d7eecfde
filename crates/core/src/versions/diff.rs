use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::domain::version::{ChangeKind, DiffEntry};

const ROOT: &str = "$";

/// SHA-256 over the payload serialized with recursively sorted object keys, hex encoded.
pub fn content_hash(payload: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(payload, &mut canonical);
    let digest = Sha256::digest(canonical.as_bytes());
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(child) = map.get(key) {
                    write_canonical(child, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Leaf-level structural diff from `old` to `new`.
///
/// Entries for paths reachable in `new` come first, in the order `new` is walked. Paths
/// that only exist in `old` follow as `Removed`, sorted by path. A subtree present on one
/// side only is flattened to its leaves, and a change of JSON type is a single `Modified`
/// entry at the path where the types diverge.
pub fn diff_payloads(old: &Value, new: &Value) -> Vec<DiffEntry> {
    let mut changes = Vec::new();
    walk_newer(ROOT, Some(old), new, &mut changes);

    let mut removed = Vec::new();
    walk_older(ROOT, old, Some(new), &mut removed);
    removed.sort_by(|left, right| left.path.cmp(&right.path));

    changes.extend(removed);
    changes
}

fn walk_newer(path: &str, old: Option<&Value>, new: &Value, out: &mut Vec<DiffEntry>) {
    match (old, new) {
        (None, new) => flatten(path, new, ChangeKind::Added, out),
        (Some(Value::Object(old)), Value::Object(new)) => {
            for (key, value) in new {
                walk_newer(&key_path(path, key), old.get(key), value, out);
            }
        }
        (Some(Value::Array(old)), Value::Array(new)) => {
            for (index, value) in new.iter().enumerate() {
                walk_newer(&index_path(path, index), old.get(index), value, out);
            }
        }
        (Some(old), new) if old != new => out.push(DiffEntry {
            path: path.to_owned(),
            kind: ChangeKind::Modified,
            old_value: Some(old.clone()),
            new_value: Some(new.clone()),
        }),
        (Some(_), _) => {}
    }
}

fn walk_older(path: &str, old: &Value, new: Option<&Value>, out: &mut Vec<DiffEntry>) {
    match (old, new) {
        (old, None) => flatten(path, old, ChangeKind::Removed, out),
        (Value::Object(old), Some(Value::Object(new))) => {
            for (key, value) in old {
                walk_older(&key_path(path, key), value, new.get(key), out);
            }
        }
        (Value::Array(old), Some(Value::Array(new))) => {
            for (index, value) in old.iter().enumerate() {
                walk_older(&index_path(path, index), value, new.get(index), out);
            }
        }
        _ => {}
    }
}

fn flatten(path: &str, value: &Value, kind: ChangeKind, out: &mut Vec<DiffEntry>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, value) in map {
                flatten(&key_path(path, key), value, kind, out);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (index, item) in items.iter().enumerate() {
                flatten(&index_path(path, index), item, kind, out);
            }
        }
        leaf => {
            let (old_value, new_value) = match kind {
                ChangeKind::Removed => (Some(leaf.clone()), None),
                _ => (None, Some(leaf.clone())),
            };
            out.push(DiffEntry { path: path.to_owned(), kind, old_value, new_value });
        }
    }
}

fn key_path(parent: &str, key: &str) -> String {
    if parent == ROOT {
        key.to_owned()
    } else {
        format!("{parent}.{key}")
    }
}

fn index_path(parent: &str, index: usize) -> String {
    format!("{parent}[{index}]")
}
