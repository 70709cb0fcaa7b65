//! Placeholder value codec.
//!
//! A placeholder token travels inside JSON values in one of two shapes:
//!
//! - **Embedded**: an object `{"$vt": "<uuid>"}` standing in for a whole value.
//! - **Marker**: the text `[vt:<uuid>]` spliced into a string, e.g. a target
//!   path built before the id exists (`/todos/[vt:...]/done`).
//!
//! These helpers find, substitute, and render both shapes. Registry state
//! (pending vs. resolved) lives in the runtime; everything here is pure.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::id::PlaceholderToken;
use crate::request::RequestSpec;

/// Key of the single-entry object that embeds a token.
pub const TOKEN_KEY: &str = "$vt";

/// A result field that is not known until the owning operation succeeds.
///
/// `pointer` is a JSON pointer into the real result; `token` stands in for
/// the value at that pointer until then.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredField {
    pub pointer: String,
    pub token: PlaceholderToken,
}

const MARKER_PREFIX: &str = "[vt:";
const MARKER_SUFFIX: char = ']';
const UUID_LEN: usize = 36;

impl PlaceholderToken {
    /// Embedded JSON form of this token.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(TOKEN_KEY.to_string(), Value::String(self.to_string()));
        Value::Object(map)
    }

    /// Parse the embedded JSON form.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        if map.len() != 1 {
            return None;
        }
        let raw = map.get(TOKEN_KEY)?.as_str()?;
        Uuid::parse_str(raw).ok().map(Self::from_uuid)
    }

    /// Textual marker for splicing into strings.
    pub fn marker(&self) -> String {
        format!("{MARKER_PREFIX}{self}{MARKER_SUFFIX}")
    }
}

/// Collect every token referenced by `value` (embedded or marker form).
pub fn collect_tokens(value: &Value, out: &mut BTreeSet<PlaceholderToken>) {
    if let Some(token) = PlaceholderToken::from_value(value) {
        out.insert(token);
        return;
    }
    match value {
        Value::String(s) => scan_markers(s, out),
        Value::Array(items) => items.iter().for_each(|v| collect_tokens(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_tokens(v, out)),
        _ => {}
    }
}

/// Collect tokens referenced anywhere in a request descriptor.
pub fn collect_request_tokens(spec: &RequestSpec, out: &mut BTreeSet<PlaceholderToken>) {
    scan_markers(&spec.method, out);
    scan_markers(&spec.target, out);
    collect_tokens(&spec.body, out);
}

fn scan_markers(s: &str, out: &mut BTreeSet<PlaceholderToken>) {
    let mut rest = s;
    while let Some(start) = rest.find(MARKER_PREFIX) {
        let after = &rest[start + MARKER_PREFIX.len()..];
        if let (Some(id), Some(tail)) = (after.get(..UUID_LEN), after.get(UUID_LEN..)) {
            if tail.starts_with(MARKER_SUFFIX) {
                if let Ok(uuid) = Uuid::parse_str(id) {
                    out.insert(PlaceholderToken::from_uuid(uuid));
                }
            }
        }
        rest = after;
    }
}

/// Replace every occurrence of `token` in `value` with `real`.
///
/// Embedded tokens are replaced by `real` itself; markers inside strings are
/// replaced by the textual form of `real` (strings unquoted). Returns whether
/// anything changed.
pub fn substitute(value: &mut Value, token: PlaceholderToken, real: &Value) -> bool {
    if PlaceholderToken::from_value(value) == Some(token) {
        *value = real.clone();
        return true;
    }
    match value {
        Value::String(s) => substitute_markers(s, token, real),
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, v| substitute(v, token, real) | changed),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |changed, v| substitute(v, token, real) | changed),
        _ => false,
    }
}

/// Substitute `token` throughout a request descriptor.
pub fn substitute_request(spec: &mut RequestSpec, token: PlaceholderToken, real: &Value) -> bool {
    let mut changed = substitute_markers(&mut spec.method, token, real);
    changed |= substitute_markers(&mut spec.target, token, real);
    changed |= substitute(&mut spec.body, token, real);
    changed
}

fn substitute_markers(s: &mut String, token: PlaceholderToken, real: &Value) -> bool {
    let marker = token.marker();
    if !s.contains(&marker) {
        return false;
    }
    let text = match real {
        Value::String(inner) => inner.clone(),
        other => other.to_string(),
    };
    *s = s.replace(&marker, &text);
    true
}

/// Render `value` into stable text usable as a cache key or storage value.
///
/// Output is JSON with object keys in sorted order, except that embedded
/// tokens render as a bare `[vt:<uuid>]` (never quoted), so they cannot be
/// confused with any real string.
pub fn stringify(value: &Value) -> String {
    let mut out = String::new();
    write_stable(value, &mut out);
    out
}

fn write_stable(value: &Value, out: &mut String) {
    if let Some(token) = PlaceholderToken::from_value(value) {
        out.push_str(&token.marker());
        return;
    }
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_stable(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}:", Value::String(key.clone()));
                write_stable(&map[key], out);
            }
            out.push('}');
        }
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

/// Replace each embedded token by `lookup(token)` when it yields a value.
///
/// Only one level of indirection is removed: values returned by `lookup` are
/// not themselves scanned for tokens.
pub fn dehydrate_with<F>(value: &Value, lookup: &F) -> Value
where
    F: Fn(&PlaceholderToken) -> Option<Value>,
{
    if let Some(token) = PlaceholderToken::from_value(value) {
        return lookup(&token).unwrap_or_else(|| value.clone());
    }
    match value {
        Value::Array(items) => Value::Array(items.iter().map(|v| dehydrate_with(v, lookup)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), dehydrate_with(v, lookup)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Set `new` at JSON pointer `pointer`, creating intermediate objects.
///
/// Returns `false` when an intermediate segment exists but is not an object
/// or array.
pub fn set_pointer(root: &mut Value, pointer: &str, new: Value) -> bool {
    if pointer.is_empty() {
        *root = new;
        return true;
    }
    let Some(path) = pointer.strip_prefix('/') else {
        return false;
    };
    let segments: Vec<String> = path
        .split('/')
        .map(|s| s.replace("~1", "/").replace("~0", "~"))
        .collect();

    let mut cursor = root;
    for (i, segment) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        if cursor.is_null() {
            *cursor = Value::Object(Map::new());
        }
        cursor = match cursor {
            Value::Object(map) => {
                if last {
                    map.insert(segment.clone(), new);
                    return true;
                }
                map.entry(segment.clone()).or_insert(Value::Null)
            }
            Value::Array(items) => {
                let Ok(idx) = segment.parse::<usize>() else {
                    return false;
                };
                let Some(slot) = items.get_mut(idx) else {
                    return false;
                };
                if last {
                    *slot = new;
                    return true;
                }
                slot
            }
            _ => return false,
        };
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn embedded_token_round_trips() {
        let t = PlaceholderToken::new();
        assert_eq!(PlaceholderToken::from_value(&t.to_value()), Some(t));
        assert_eq!(PlaceholderToken::from_value(&json!({"$vt": "nope"})), None);
        assert_eq!(PlaceholderToken::from_value(&json!({"$vt": t.to_string(), "x": 1})), None);
    }

    #[test]
    fn collects_embedded_and_marker_tokens() {
        let a = PlaceholderToken::new();
        let b = PlaceholderToken::new();
        let value = json!({
            "parent": a.to_value(),
            "path": format!("/items/{}/children", b.marker()),
            "list": [1, "plain", a.to_value()],
        });

        let mut found = BTreeSet::new();
        collect_tokens(&value, &mut found);
        assert_eq!(found, BTreeSet::from([a, b]));
    }

    #[test]
    fn substitute_replaces_all_occurrences() {
        let t = PlaceholderToken::new();
        let mut value = json!({"id": t.to_value(), "nested": [t.to_value()], "url": format!("/x/{}", t.marker())});

        assert!(substitute(&mut value, t, &json!(42)));
        assert_eq!(value, json!({"id": 42, "nested": [42], "url": "/x/42"}));
        assert!(!substitute(&mut value, t, &json!(42)));
    }

    #[test]
    fn substitute_string_marker_is_unquoted() {
        let t = PlaceholderToken::new();
        let mut spec = RequestSpec::new("PUT", format!("/todos/{}", t.marker()), json!({"ref": t.to_value()}));

        assert!(substitute_request(&mut spec, t, &json!("abc")));
        assert_eq!(spec.target, "/todos/abc");
        assert_eq!(spec.body, json!({"ref": "abc"}));
    }

    #[test]
    fn stringify_is_stable_and_marks_tokens() {
        let t = PlaceholderToken::new();
        let a = json!({"b": 1, "a": [true, null, t.to_value()]});
        let rendered = stringify(&a);

        assert_eq!(rendered, format!("{{\"a\":[true,null,[vt:{t}]],\"b\":1}}"));
        // A real string that looks like a marker is still quoted.
        let fake = json!(t.marker());
        assert_eq!(stringify(&fake), format!("\"{}\"", t.marker()));
    }

    #[test]
    fn dehydrate_removes_one_level_only() {
        let outer = PlaceholderToken::new();
        let inner = PlaceholderToken::new();
        let value = json!({"x": outer.to_value(), "y": inner.to_value()});

        let out = dehydrate_with(&value, &|t: &PlaceholderToken| {
            (*t == outer).then(|| json!({"wrapped": inner.to_value()}))
        });
        assert_eq!(out, json!({"x": {"wrapped": inner.to_value()}, "y": inner.to_value()}));
    }

    #[test]
    fn set_pointer_creates_intermediate_objects() {
        let mut root = Value::Null;
        assert!(set_pointer(&mut root, "/data/id", json!(7)));
        assert_eq!(root, json!({"data": {"id": 7}}));

        let mut arr = json!({"items": [{"id": 1}]});
        assert!(set_pointer(&mut arr, "/items/0/id", json!(2)));
        assert!(!set_pointer(&mut arr, "/items/5/id", json!(2)));
        assert!(!set_pointer(&mut arr, "no-slash", json!(2)));
    }

    proptest! {
        #[test]
        fn stringify_ignores_key_insertion_order(keys in proptest::collection::btree_set("[a-z]{1,6}", 1..8)) {
            let forward: Map<String, Value> = keys.iter().map(|k| (k.clone(), json!(k.len()))).collect();
            let backward: Map<String, Value> = keys.iter().rev().map(|k| (k.clone(), json!(k.len()))).collect();
            prop_assert_eq!(stringify(&Value::Object(forward)), stringify(&Value::Object(backward)));
        }
    }
}
