//! Request parameters, canonical serialization, and cache key derivation.
//!
//! Every inbound request is reduced to a [`RequestParams`] map. The map has a
//! single canonical JSON form (object keys sorted lexicographically at every
//! nesting level, no whitespace) so that two requests differing only in key
//! insertion order produce the same cache key, the same subscription-set
//! member, and the same requester fingerprint.
//!
//! # Examples
//!
//! ```rust
//! use feedbridge::params::RequestParams;
//! use serde_json::json;
//!
//! let mut a = RequestParams::new();
//! a.insert("quote", json!("USD"));
//! a.insert("base", json!("ETH"));
//!
//! let mut b = RequestParams::new();
//! b.insert("base", json!("ETH"));
//! b.insert("quote", json!("USD"));
//!
//! assert_eq!(a.canonical(), b.canonical());
//! assert_eq!(a.canonical(), r#"{"base":"ETH","quote":"USD"}"#);
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix for the per-key in-flight marker used by request coalescing.
const IN_FLIGHT_PREFIX: &str = "InFlight-";

/// Normalized input parameters for a single adapter request.
///
/// Backed by a `BTreeMap` so top-level iteration order is already sorted;
/// nested objects are re-sorted during canonical serialization. Values are
/// plain JSON values, the framework never interprets them beyond equality
/// and serialization.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestParams(pub BTreeMap<String, Value>);

impl RequestParams {
    /// Creates an empty parameter map.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builds parameters from any JSON object, dropping nothing.
    ///
    /// Returns `None` when the value is not an object.
    pub fn from_object(value: &Value) -> Option<Self> {
        value.as_object().map(|map| {
            Self(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<BTreeMap<_, _>>(),
            )
        })
    }

    /// Parses parameters back from their canonical JSON form.
    pub fn from_canonical(canonical: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(canonical)
    }

    /// Inserts or replaces a single parameter.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Looks up a parameter by name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Canonical JSON form: sorted keys, minimal separators.
    pub fn canonical(&self) -> String {
        let mut out = String::with_capacity(self.0.len() * 16 + 2);
        out.push('{');
        let mut first = true;
        for (key, value) in &self.0 {
            if !first {
                out.push(',');
            }
            first = false;
            write_json_string(key, &mut out);
            out.push(':');
            write_canonical(value, &mut out);
        }
        out.push('}');
        out
    }

    /// Projection of the parameters onto a set of input fields, in canonical
    /// form. An empty field list keeps everything.
    ///
    /// This is the feed id: a stable label identifying one parameter tuple
    /// across metrics and response metadata.
    pub fn feed_id(&self, input_fields: &[String]) -> String {
        if input_fields.is_empty() {
            return self.canonical();
        }
        let projected: BTreeMap<String, Value> = self
            .0
            .iter()
            .filter(|(k, _)| input_fields.iter().any(|f| f == *k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self(projected).canonical()
    }
}

/// Serializes a JSON value in canonical form, sorting object keys at every
/// level regardless of how the underlying map is ordered.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_json_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
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
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

fn write_json_string(s: &str, out: &mut String) {
    // serde_json produces the exact escaping rules the canonical form needs.
    match serde_json::to_string(s) {
        Ok(quoted) => out.push_str(&quoted),
        Err(_) => out.push_str("\"\""),
    }
}

/// Computes the cache key for one (adapter, endpoint, transport, params)
/// tuple, with the optional process-wide namespace prefix.
pub fn cache_key(
    prefix: Option<&str>,
    adapter: &str,
    endpoint: &str,
    transport: &str,
    params: &RequestParams,
) -> String {
    match prefix {
        Some(p) if !p.is_empty() => {
            format!("{p}-{adapter}-{endpoint}-{transport}-{}", params.canonical())
        }
        _ => format!("{adapter}-{endpoint}-{transport}-{}", params.canonical()),
    }
}

/// Key of the subscription sorted set for one (endpoint, transport) pair.
pub fn subscription_set_key(
    prefix: Option<&str>,
    adapter: &str,
    endpoint: &str,
    transport: &str,
) -> String {
    match prefix {
        Some(p) if !p.is_empty() => format!("{p}-{adapter}-{endpoint}-{transport}-subs"),
        _ => format!("{adapter}-{endpoint}-{transport}-subs"),
    }
}

/// Key of the writer lock for one adapter namespace.
pub fn lock_key(prefix: Option<&str>, adapter: &str) -> String {
    match prefix {
        Some(p) if !p.is_empty() => format!("{p}-{adapter}-lock"),
        _ => format!("{adapter}-lock"),
    }
}

/// Key of the in-flight marker for a cache key.
pub fn in_flight_key(cache_key: &str) -> String {
    format!("{IN_FLIGHT_PREFIX}{cache_key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_sorts_keys_at_every_level() {
        let value = json!({
            "z": 1,
            "a": { "y": [3, 2], "b": "x" }
        });
        assert_eq!(canonical_json(&value), r#"{"a":{"b":"x","y":[3,2]},"z":1}"#);
    }

    #[test]
    fn canonical_has_no_whitespace() {
        let mut params = RequestParams::new();
        params.insert("base", json!("qweqwe"));
        params.insert("factor", json!(111));
        assert_eq!(params.canonical(), r#"{"base":"qweqwe","factor":111}"#);
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let mut a = RequestParams::new();
        a.insert("factor", json!(111));
        a.insert("base", json!("qweqwe"));

        let mut b = RequestParams::new();
        b.insert("base", json!("qweqwe"));
        b.insert("factor", json!(111));

        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(
            cache_key(None, "TEST", "test", "rest", &a),
            cache_key(None, "TEST", "test", "rest", &b)
        );
    }

    #[test]
    fn cache_key_includes_prefix_when_present() {
        let params = RequestParams::new();
        assert_eq!(
            cache_key(Some("ns"), "TEST", "price", "rest", &params),
            "ns-TEST-price-rest-{}"
        );
        assert_eq!(
            cache_key(None, "TEST", "price", "rest", &params),
            "TEST-price-rest-{}"
        );
    }

    #[test]
    fn feed_id_projects_onto_input_fields() {
        let mut params = RequestParams::new();
        params.insert("base", json!("ETH"));
        params.insert("quote", json!("USD"));
        params.insert("transportOnly", json!(true));

        let fields = vec!["base".to_string(), "quote".to_string()];
        assert_eq!(params.feed_id(&fields), r#"{"base":"ETH","quote":"USD"}"#);
        assert_eq!(
            params.feed_id(&[]),
            r#"{"base":"ETH","quote":"USD","transportOnly":true}"#
        );
    }

    #[test]
    fn canonical_roundtrip() {
        let mut params = RequestParams::new();
        params.insert("base", json!("BTC"));
        params.insert("amount", json!(1.5));
        let parsed = RequestParams::from_canonical(&params.canonical()).unwrap();
        assert_eq!(parsed, params);
    }

    #[test]
    fn in_flight_key_prefixes_cache_key() {
        assert_eq!(in_flight_key("TEST-a-rest-{}"), "InFlight-TEST-a-rest-{}");
    }

    #[test]
    fn string_escaping_is_preserved() {
        let mut params = RequestParams::new();
        params.insert("note", json!("line\nbreak \"quoted\""));
        let parsed = RequestParams::from_canonical(&params.canonical()).unwrap();
        assert_eq!(parsed, params);
    }
}
