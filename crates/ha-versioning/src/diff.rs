//! Structural diff of automation configurations
//!
//! Objects are compared key by key. Arrays stored under a set-like key
//! (see [`SET_LIKE_FIELDS`]) are compared as multisets, so reordering their
//! elements is not a change. Every other array is an ordered sequence and is
//! compared index by index.
//!
//! Paths use dotted keys and `[i]` indices, e.g. `actions[1].data.brightness`.
//! A change to the document root itself is reported at path `$`.

use chrono::{DateTime, Utc};
use ha_core::new_id;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Keys whose array values are order-insensitive
pub const SET_LIKE_FIELDS: &[&str] = &[
    "triggers",
    "trigger",
    "entity_id",
    "device_id",
    "area_id",
    "labels",
    "depends_on",
];

/// A field present on only one side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub path: String,
    pub value: Value,
}

/// A field present on both sides with different values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub path: String,
    pub old_value: Value,
    pub new_value: Value,
}

/// Raw structural difference between two documents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationDiff {
    pub added: Vec<FieldValue>,
    pub removed: Vec<FieldValue>,
    pub changed: Vec<FieldChange>,
}

impl ConfigurationDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Comparison of two stored versions
///
/// Ephemeral: recomputed on every request and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionDiffResult {
    pub diff_id: String,
    pub source_version_id: String,
    pub target_version_id: String,
    pub added_fields: Vec<FieldValue>,
    pub removed_fields: Vec<FieldValue>,
    pub changed_fields: Vec<FieldChange>,
    pub computed_at: DateTime<Utc>,
}

impl VersionDiffResult {
    pub fn new(source_version_id: &str, target_version_id: &str, diff: ConfigurationDiff) -> Self {
        Self {
            diff_id: new_id(),
            source_version_id: source_version_id.to_string(),
            target_version_id: target_version_id.to_string(),
            added_fields: diff.added,
            removed_fields: diff.removed,
            changed_fields: diff.changed,
            computed_at: Utc::now(),
        }
    }

    pub fn is_identical(&self) -> bool {
        self.added_fields.is_empty() && self.removed_fields.is_empty() && self.changed_fields.is_empty()
    }

    pub fn total_changes(&self) -> usize {
        self.added_fields.len() + self.removed_fields.len() + self.changed_fields.len()
    }
}

/// Compute the structural difference from `old` to `new`
pub fn diff_configurations(old: &Value, new: &Value) -> ConfigurationDiff {
    let mut diff = ConfigurationDiff::default();
    walk("", None, old, new, &mut diff);
    diff
}

fn child_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "$".to_string()
    } else {
        path.to_string()
    }
}

fn walk(path: &str, key: Option<&str>, old: &Value, new: &Value, diff: &mut ConfigurationDiff) {
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            for (k, old_value) in a {
                let p = child_path(path, k);
                match b.get(k) {
                    Some(new_value) => walk(&p, Some(k), old_value, new_value, diff),
                    None => diff.removed.push(FieldValue {
                        path: p,
                        value: old_value.clone(),
                    }),
                }
            }
            for (k, new_value) in b {
                if !a.contains_key(k) {
                    diff.added.push(FieldValue {
                        path: child_path(path, k),
                        value: new_value.clone(),
                    });
                }
            }
        }
        (Value::Array(a), Value::Array(b)) if key.is_some_and(|k| SET_LIKE_FIELDS.contains(&k)) => {
            diff_multiset(&display_path(path), a, b, diff);
        }
        (Value::Array(a), Value::Array(b)) => {
            for i in 0..a.len().max(b.len()) {
                let p = format!("{path}[{i}]");
                match (a.get(i), b.get(i)) {
                    (Some(x), Some(y)) => walk(&p, None, x, y, diff),
                    (Some(x), None) => diff.removed.push(FieldValue {
                        path: p,
                        value: x.clone(),
                    }),
                    (None, Some(y)) => diff.added.push(FieldValue {
                        path: p,
                        value: y.clone(),
                    }),
                    (None, None) => {}
                }
            }
        }
        (a, b) if a == b => {}
        (a, b) => diff.changed.push(FieldChange {
            path: display_path(path),
            old_value: a.clone(),
            new_value: b.clone(),
        }),
    }
}

/// Multiset comparison: duplicates are matched one-to-one
fn diff_multiset(path: &str, old: &[Value], new: &[Value], diff: &mut ConfigurationDiff) {
    let mut matched = vec![false; new.len()];

    for item in old {
        let hit = new
            .iter()
            .enumerate()
            .find(|(i, candidate)| !matched[*i] && *candidate == item)
            .map(|(i, _)| i);
        match hit {
            Some(i) => matched[i] = true,
            None => diff.removed.push(FieldValue {
                path: path.to_string(),
                value: item.clone(),
            }),
        }
    }

    for (item, seen) in new.iter().zip(matched) {
        if !seen {
            diff.added.push(FieldValue {
                path: path.to_string(),
                value: item.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identical_documents() {
        let config = json!({"alias": "Porch", "triggers": [{"trigger": "sun"}]});
        assert!(diff_configurations(&config, &config).is_empty());
    }

    #[test]
    fn test_added_removed_changed_keys() {
        let old = json!({"alias": "Porch", "mode": "single", "description": "x"});
        let new = json!({"alias": "Porch lights", "mode": "single", "max": 3});

        let diff = diff_configurations(&old, &new);

        assert_eq!(
            diff.changed,
            vec![FieldChange {
                path: "alias".into(),
                old_value: json!("Porch"),
                new_value: json!("Porch lights"),
            }]
        );
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].path, "description");
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].path, "max");
    }

    #[test]
    fn test_trigger_order_is_ignored() {
        let old = json!({"triggers": [{"trigger": "sun", "event": "sunset"}, {"trigger": "time", "at": "22:00"}]});
        let new = json!({"triggers": [{"trigger": "time", "at": "22:00"}, {"trigger": "sun", "event": "sunset"}]});
        assert!(diff_configurations(&old, &new).is_empty());
    }

    #[test]
    fn test_set_like_field_reports_membership_changes() {
        let old = json!({"target": {"entity_id": ["light.a", "light.b"]}});
        let new = json!({"target": {"entity_id": ["light.c", "light.a"]}});

        let diff = diff_configurations(&old, &new);

        assert_eq!(diff.removed, vec![FieldValue { path: "target.entity_id".into(), value: json!("light.b") }]);
        assert_eq!(diff.added, vec![FieldValue { path: "target.entity_id".into(), value: json!("light.c") }]);
        assert!(diff.changed.is_empty());
    }

    #[test]
    fn test_set_like_duplicates_are_counted() {
        let old = json!({"labels": ["night", "night"]});
        let new = json!({"labels": ["night"]});
        let diff = diff_configurations(&old, &new);
        assert_eq!(diff.removed.len(), 1);
        assert!(diff.added.is_empty());
    }

    #[test]
    fn test_action_order_is_significant() {
        let old = json!({"actions": [{"action": "light.turn_on"}, {"delay": 5}]});
        let new = json!({"actions": [{"delay": 5}, {"action": "light.turn_on"}]});

        let diff = diff_configurations(&old, &new);

        // Position 0 swapped its keys, position 1 as well
        assert!(diff.removed.iter().any(|f| f.path == "actions[0].action"));
        assert!(diff.added.iter().any(|f| f.path == "actions[0].delay"));
        assert!(diff.removed.iter().any(|f| f.path == "actions[1].delay"));
        assert!(diff.added.iter().any(|f| f.path == "actions[1].action"));
    }

    #[test]
    fn test_sequence_growth_and_nested_change() {
        let old = json!({"actions": [{"action": "light.turn_on", "data": {"brightness": 100}}]});
        let new = json!({"actions": [
            {"action": "light.turn_on", "data": {"brightness": 180}},
            {"action": "notify.mobile"}
        ]});

        let diff = diff_configurations(&old, &new);

        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].path, "actions[0].data.brightness");
        assert_eq!(diff.added, vec![FieldValue { path: "actions[1]".into(), value: json!({"action": "notify.mobile"}) }]);
    }

    #[test]
    fn test_type_change_reported_as_change() {
        let diff = diff_configurations(&json!({"mode": "single"}), &json!({"mode": {"queued": 3}}));
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].path, "mode");

        let diff = diff_configurations(&json!({}), &json!(null));
        assert_eq!(diff.changed[0].path, "$");
    }
}
