//! Redaction of sensitive setting values from cached responses.
//!
//! Provider responses may echo credentials (API keys in URLs, auth headers
//! reflected into payloads). Before anything is cached, every string field is
//! scanned for the raw value of each sensitive setting and rewritten to
//! `[{NAME} REDACTED]`. Pathological nesting is cut off at a fixed depth and
//! replaced with the `[Unknown]` sentinel instead of failing the response
//! path.

use serde_json::Value;

use crate::config::CustomSetting;

/// Subtrees deeper than this are replaced with [`UNKNOWN_SENTINEL`].
const MAX_DEPTH: usize = 128;

/// Replacement for subtrees the censor refuses to walk.
const UNKNOWN_SENTINEL: &str = "[Unknown]";

/// One value to scrub, with the setting name used in the replacement text.
#[derive(Clone, Debug)]
pub struct CensorItem {
    pub name: String,
    pub value: String,
}

impl CensorItem {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    fn replacement(&self) -> String {
        format!("[{} REDACTED]", self.name)
    }
}

/// The set of sensitive values active for one adapter process.
#[derive(Clone, Debug, Default)]
pub struct CensorList {
    items: Vec<CensorItem>,
}

impl CensorList {
    pub fn new(items: Vec<CensorItem>) -> Self {
        // Empty values would turn every string into an infinite replacement.
        let items = items.into_iter().filter(|i| !i.value.is_empty()).collect();
        Self { items }
    }

    /// Builds the list from resolved custom settings plus any extra values
    /// the framework itself considers sensitive.
    pub fn from_settings(custom: &[CustomSetting], extra: Vec<CensorItem>) -> Self {
        let mut items: Vec<CensorItem> = custom
            .iter()
            .filter(|s| s.sensitive)
            .map(|s| CensorItem::new(s.name.clone(), s.value.clone()))
            .collect();
        items.extend(extra);
        Self::new(items)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Censors a string, replacing every occurrence of every sensitive value.
    pub fn censor_str(&self, input: &str) -> String {
        let mut out = input.to_string();
        for item in &self.items {
            if out.contains(&item.value) {
                out = out.replace(&item.value, &item.replacement());
            }
        }
        out
    }

    /// Censors a JSON tree in place. Subtrees past the depth cutoff are
    /// replaced with the `[Unknown]` sentinel; the walk itself cannot fail.
    pub fn censor_value(&self, value: &mut Value) {
        if self.items.is_empty() {
            return;
        }
        self.walk(value, 0);
    }

    fn walk(&self, value: &mut Value, depth: usize) {
        if depth > MAX_DEPTH {
            *value = Value::String(UNKNOWN_SENTINEL.to_string());
            return;
        }
        match value {
            Value::String(s) => {
                for item in &self.items {
                    if s.contains(&item.value) {
                        *s = s.replace(&item.value, &item.replacement());
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.walk(item, depth + 1);
                }
            }
            Value::Object(map) => {
                for (_, v) in map.iter_mut() {
                    self.walk(v, depth + 1);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn list() -> CensorList {
        CensorList::new(vec![CensorItem::new("API_KEY", "s3cr3t")])
    }

    #[test]
    fn replaces_every_occurrence_in_nested_strings() {
        let mut value = json!({
            "url": "https://api.example.com?key=s3cr3t",
            "nested": { "echo": ["s3cr3t", "clean"] }
        });
        list().censor_value(&mut value);
        assert_eq!(
            value["url"],
            "https://api.example.com?key=[API_KEY REDACTED]"
        );
        assert_eq!(value["nested"]["echo"][0], "[API_KEY REDACTED]");
        assert_eq!(value["nested"]["echo"][1], "clean");
    }

    #[test]
    fn leaves_non_string_values_untouched() {
        let mut value = json!({"n": 42, "b": true, "x": null});
        list().censor_value(&mut value);
        assert_eq!(value, json!({"n": 42, "b": true, "x": null}));
    }

    #[test]
    fn depth_cutoff_replaces_with_unknown() {
        let mut value = json!("leaf");
        for _ in 0..(MAX_DEPTH + 10) {
            value = json!([value]);
        }
        list().censor_value(&mut value);
        let mut probe = &value;
        let mut sentinel_found = false;
        for _ in 0..(MAX_DEPTH + 10) {
            match probe {
                Value::Array(items) => probe = &items[0],
                Value::String(s) => {
                    assert_eq!(s, UNKNOWN_SENTINEL);
                    sentinel_found = true;
                    break;
                }
                other => panic!("unexpected node: {other:?}"),
            }
        }
        assert!(sentinel_found);
    }

    #[test]
    fn empty_values_are_dropped_from_the_list() {
        let list = CensorList::new(vec![CensorItem::new("EMPTY", "")]);
        assert!(list.is_empty());
        assert_eq!(list.censor_str("anything"), "anything");
    }

    #[test]
    fn multiple_items_all_apply() {
        let list = CensorList::new(vec![
            CensorItem::new("API_KEY", "aaa"),
            CensorItem::new("API_SECRET", "bbb"),
        ]);
        assert_eq!(
            list.censor_str("aaa and bbb"),
            "[API_KEY REDACTED] and [API_SECRET REDACTED]"
        );
    }
}
