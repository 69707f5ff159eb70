//! Resource renderer: JSON object to YAML with field exclusions
//!
//! Excluded paths use `.` as separator; a bracketed segment (`[...]`) is a
//! literal key so that keys containing dots, slashes or colons can be named:
//! `metadata.annotations[kubectl.kubernetes.io/last-applied-configuration]`.
//!
//! Output keys are sorted at every level so that identical objects always
//! render to identical bytes.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::{Error, Result};

static FIELD_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-zA-Z0-9_./:-]*(\[[a-zA-Z0-9_*./:-]*\])?)*$").expect("static regex")
});

/// Whether `path` is a syntactically valid excluded-field path
pub fn is_valid_field_path(path: &str) -> bool {
    FIELD_PATH_RE.is_match(path)
}

/// Split a field path into its keys
///
/// Empty segments (a leading `.`, `a..b`) are dropped. An unterminated
/// bracket takes the rest of the path literally.
pub fn split_field_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                let literal: String = chars.by_ref().take_while(|&c| c != ']').collect();
                if !literal.is_empty() {
                    segments.push(literal);
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// Remove the key addressed by `path` from `object`
///
/// Traversal stops silently when a segment is missing or is not a mapping.
/// Returns whether a key was removed.
pub fn remove_field(object: &mut Map<String, Value>, path: &str) -> bool {
    let segments = split_field_path(path);
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };

    let mut cursor = object;
    for segment in parents {
        match cursor.get_mut(segment) {
            Some(Value::Object(child)) => cursor = child,
            _ => return false,
        }
    }
    cursor.remove(last).is_some()
}

/// Render `object` to YAML after removing every excluded path
///
/// Fails if the object is not a JSON mapping.
pub fn render_yaml(object: &Value, excluded_fields: &[String]) -> Result<String> {
    let Value::Object(map) = object else {
        return Err(Error::serialization(
            "the intercepted object is not a JSON mapping",
        ));
    };
    let mut map = map.clone();
    for path in excluded_fields {
        remove_field(&mut map, path);
    }
    to_sorted_yaml(&Value::Object(map))
}

/// Serialize a JSON value to YAML with sorted mapping keys
pub fn to_sorted_yaml(value: &Value) -> Result<String> {
    serde_yaml::to_string(&sorted(value)).map_err(|e| Error::serialization(e.to_string()))
}

fn sorted(value: &Value) -> serde_yaml::Value {
    match value {
        Value::Null => serde_yaml::Value::Null,
        Value::Bool(b) => serde_yaml::Value::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                serde_yaml::Value::Number(i.into())
            } else if let Some(u) = n.as_u64() {
                serde_yaml::Value::Number(u.into())
            } else {
                serde_yaml::Value::Number(n.as_f64().unwrap_or_default().into())
            }
        }
        Value::String(s) => serde_yaml::Value::String(s.clone()),
        Value::Array(items) => serde_yaml::Value::Sequence(items.iter().map(sorted).collect()),
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut mapping = serde_yaml::Mapping::with_capacity(keys.len());
            for key in keys {
                mapping.insert(serde_yaml::Value::String(key.clone()), sorted(&map[key]));
            }
            serde_yaml::Value::Mapping(mapping)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_map() -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "test-cm",
                "namespace": "test",
                "uid": "1234",
                "managedFields": [{"manager": "kubectl"}],
                "annotations": {
                    "test-annotation1": "a",
                    "test-annotation2": "b",
                    "test-annotation3": "c",
                    "kubectl.kubernetes.io/last-applied-configuration": "{}"
                }
            },
            "data": {"test": "oui"}
        })
    }

    #[test]
    fn splits_dotted_and_bracketed_segments() {
        assert_eq!(split_field_path("metadata.uid"), vec!["metadata", "uid"]);
        assert_eq!(split_field_path(".metadata.uid"), vec!["metadata", "uid"]);
        assert_eq!(
            split_field_path("metadata.annotations[kubectl.kubernetes.io/last-applied-configuration]"),
            vec![
                "metadata",
                "annotations",
                "kubectl.kubernetes.io/last-applied-configuration"
            ]
        );
        assert_eq!(split_field_path("a[b].c"), vec!["a", "b", "c"]);
        assert!(split_field_path("").is_empty());
    }

    /// Story: excluded fields disappear from the committed manifest
    #[test]
    fn story_exclusions_are_applied_before_rendering() {
        let excluded = vec![
            "metadata.uid".to_string(),
            "metadata.managedFields".to_string(),
            "metadata.annotations[test-annotation1]".to_string(),
            "metadata.annotations.test-annotation2".to_string(),
            "metadata.annotations[kubectl.kubernetes.io/last-applied-configuration]".to_string(),
        ];
        let yaml = render_yaml(&config_map(), &excluded).unwrap();

        assert!(yaml.contains("test-annotation3"));
        assert!(!yaml.contains("test-annotation1"));
        assert!(!yaml.contains("test-annotation2"));
        assert!(!yaml.contains("uid"));
        assert!(!yaml.contains("managedFields"));
        assert!(!yaml.contains("last-applied"));
    }

    #[test]
    fn traversal_through_non_mappings_is_a_no_op() {
        let mut object = config_map().as_object().unwrap().clone();
        assert!(!remove_field(&mut object, "data.test.deeper"));
        assert!(!remove_field(&mut object, "metadata.managedFields.manager"));
        assert!(!remove_field(&mut object, "missing.key"));
        assert!(remove_field(&mut object, "data.test"));
    }

    #[test]
    fn rendering_is_deterministic_and_round_trips() {
        let first = render_yaml(&config_map(), &[]).unwrap();
        let second = render_yaml(&config_map(), &[]).unwrap();
        assert_eq!(first, second);

        let reparsed = crate::yaml::parse_yaml(&first).unwrap();
        assert_eq!(reparsed, config_map());

        let api_version = first.find("apiVersion").unwrap();
        let kind = first.find("kind").unwrap();
        assert!(api_version < kind);
    }

    #[test]
    fn non_objects_are_rejected() {
        assert!(render_yaml(&json!(["a"]), &[]).is_err());
    }

    #[test]
    fn field_path_grammar() {
        assert!(is_valid_field_path("metadata.uid"));
        assert!(is_valid_field_path("metadata.annotations[kubectl.kubernetes.io/x]"));
        assert!(is_valid_field_path("spec.items[*]"));
        assert!(!is_valid_field_path("metadata uid"));
        assert!(!is_valid_field_path("metadata.annotations[a b]"));
        assert!(!is_valid_field_path("metadata.{name}"));
    }
}
