// Request sanitization, response field transforms and masking of sensitive fields.

use std::{collections::BTreeMap, sync::Arc};

use serde_json::{Map, Value};
use tracing::warn;

pub const MASK: &str = "***MASKED***";

pub const DEFAULT_SENSITIVE_FIELDS: &[&str] = &[
    "password",
    "secret",
    "token",
    "authorization",
    "credit_card",
    "ssn",
    "phone",
    "email",
    "address",
];

pub type FieldTransform = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

// Dot separated path -> transform, applied in path order.
pub type Transforms = BTreeMap<String, FieldTransform>;

#[derive(Debug, Clone)]
pub struct DataTransformer {
    sensitive_fields: Vec<String>,
}

impl Default for DataTransformer {
    fn default() -> Self {
        Self::with_sensitive_fields(DEFAULT_SENSITIVE_FIELDS)
    }
}

impl DataTransformer {
    pub fn with_sensitive_fields(fields: &[&str]) -> Self {
        Self {
            sensitive_fields: fields.iter().map(|f| f.to_lowercase()).collect(),
        }
    }

    /// Drops nulls, empty strings and objects or lists left empty after cleaning.
    /// Non-object payloads are returned unchanged.
    pub fn sanitize(payload: &Value) -> Value {
        match payload {
            Value::Object(map) => Value::Object(sanitize_object(map)),
            other => other.clone(),
        }
    }

    /// Applies each transform to the value at its path. Paths that do not resolve and
    /// transforms that fail are skipped.
    pub fn transform(payload: Value, transforms: &Transforms) -> Value {
        let mut payload = payload;
        if !payload.is_object() {
            return payload;
        }

        for (path, func) in transforms {
            let Some(slot) = resolve_mut(&mut payload, path) else {
                continue;
            };
            match func(slot) {
                Ok(value) => *slot = value,
                Err(err) => warn!(field = %path, error = %err, "failed to transform field"),
            }
        }
        payload
    }

    pub fn mask(&self, payload: &Value) -> Value {
        mask_value(payload, &self.sensitive_fields)
    }

    pub fn mask_with(payload: &Value, fields: &[&str]) -> Value {
        let fields: Vec<String> = fields.iter().map(|f| f.to_lowercase()).collect();
        mask_value(payload, &fields)
    }
}

fn sanitize_object(map: &Map<String, Value>) -> Map<String, Value> {
    let mut cleaned = Map::new();
    for (key, value) in map {
        match value {
            Value::Null => {}
            Value::String(s) if s.is_empty() => {}
            Value::Object(nested) => {
                let nested = sanitize_object(nested);
                if !nested.is_empty() {
                    cleaned.insert(key.clone(), Value::Object(nested));
                }
            }
            Value::Array(items) => {
                let items: Vec<Value> = items
                    .iter()
                    .filter(|item| !item.is_null())
                    .map(|item| match item {
                        Value::Object(obj) => Value::Object(sanitize_object(obj)),
                        other => other.clone(),
                    })
                    .collect();
                if !items.is_empty() {
                    cleaned.insert(key.clone(), Value::Array(items));
                }
            }
            other => {
                cleaned.insert(key.clone(), other.clone());
            }
        }
    }
    cleaned
}

fn resolve_mut<'a>(payload: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.')
        .try_fold(payload, |current, key| current.as_object_mut()?.get_mut(key))
}

fn mask_value(value: &Value, fields: &[String]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let lower = key.to_lowercase();
                    let masked = if fields.iter().any(|f| lower.contains(f.as_str())) {
                        Value::String(MASK.to_string())
                    } else {
                        mask_value(value, fields)
                    };
                    (key.clone(), masked)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| mask_value(v, fields)).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_strips_empty_values() {
        let payload = json!({
            "guest": {"firstName": "Ada", "middleName": "", "title": null},
            "notes": {"internal": {"flag": null}},
            "rooms": [null, {"number": "101", "floor": null}, 3],
            "preferences": [null],
            "count": 0,
            "vip": false
        });

        assert_eq!(
            DataTransformer::sanitize(&payload),
            json!({
                "guest": {"firstName": "Ada"},
                "rooms": [{"number": "101"}, 3],
                "count": 0,
                "vip": false
            })
        );
        assert_eq!(DataTransformer::sanitize(&json!([1, null])), json!([1, null]));
    }

    #[test]
    fn test_transform_applies_nested_paths_and_skips_failures() {
        let mut transforms: Transforms = BTreeMap::new();
        transforms.insert(
            "guest.profile.name".to_string(),
            Arc::new(|v: &Value| {
                v.as_str()
                    .map(|s| Value::String(s.to_uppercase()))
                    .ok_or_else(|| "not a string".to_string())
            }),
        );
        transforms.insert(
            "total".to_string(),
            Arc::new(|_: &Value| Err::<Value, _>("bad amount".to_string())),
        );
        transforms.insert("missing.path".to_string(), Arc::new(|_: &Value| Ok::<_, String>(json!(1))));

        let out = DataTransformer::transform(
            json!({"guest": {"profile": {"name": "ada"}}, "total": 10}),
            &transforms,
        );

        assert_eq!(out, json!({"guest": {"profile": {"name": "ADA"}}, "total": 10}));
    }

    #[test]
    fn test_mask_redacts_nested_password_only() {
        let transformer = DataTransformer::default();
        let payload = json!({
            "reservation": {
                "guest": {"password": "hunter2", "lastName": "Lovelace"},
                "roomType": "KING"
            },
            "confirmation": "ABC123"
        });

        assert_eq!(
            transformer.mask(&payload),
            json!({
                "reservation": {
                    "guest": {"password": MASK, "lastName": "Lovelace"},
                    "roomType": "KING"
                },
                "confirmation": "ABC123"
            })
        );
    }

    #[test]
    fn test_mask_matches_case_insensitive_substrings_in_lists() {
        let masked = DataTransformer::default().mask(&json!({
            "contacts": [{"primaryEmail": "a@b.c", "name": "Ada"}],
            "Authorization": "Bearer x"
        }));
        assert_eq!(masked["contacts"][0]["primaryEmail"], json!(MASK));
        assert_eq!(masked["contacts"][0]["name"], json!("Ada"));
        assert_eq!(masked["Authorization"], json!(MASK));

        let custom = DataTransformer::mask_with(&json!({"pin": 1234, "email": "x"}), &["pin"]);
        assert_eq!(custom, json!({"pin": MASK, "email": "x"}));
    }
}
