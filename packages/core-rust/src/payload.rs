//! Helpers that shape an operation payload before it goes on the wire.

use serde::Serialize;
use serde_json::{Map, Value};

/// Reserved payload field carrying the caller's credentials.
pub const AUTHENTICATION_FIELD: &str = "authentication";

/// Field echoing the operation name inside `ExecuteOperation` payloads.
pub const OPERATION_NAME_FIELD: &str = "operationName";

/// Response field carrying the outcome; `"OK"` means success.
pub const STATUS_FIELD: &str = "status";

/// Status value reported by the server on success.
pub const STATUS_OK: &str = "OK";

/// Response field carrying a human-readable outcome message.
pub const MESSAGE_FIELD: &str = "message";

/// Field carrying the error text of a `GenericErrorResponse`.
pub const ERROR_MESSAGE_FIELD: &str = "errorMessage";

/// Errors raised while turning a typed payload into a JSON object.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload failed to serialize: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("payload must serialize to a JSON object")]
    NotAnObject,
}

/// Serializes any `Serialize` value into a JSON object map.
///
/// # Errors
///
/// Returns [`PayloadError`] if serialization fails or yields a non-object.
pub fn to_object<T: Serialize>(value: &T) -> Result<Map<String, Value>, PayloadError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Err(PayloadError::NotAnObject),
    }
}

/// Converts a `snake_case` key to `lowerCamelCase`; other keys pass through.
#[must_use]
pub fn camel_case(key: &str) -> String {
    if !key.contains('_') {
        return key.to_string();
    }
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for ch in key.chars() {
        if ch == '_' {
            // Leading underscores are dropped along with the separators.
            upper_next = !out.is_empty();
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Rewrites every top-level key to `lowerCamelCase`, keeping insertion order.
///
/// When a snake-case key and its camel-case twin are both present, the one
/// that appears later wins.
#[must_use]
pub fn normalize_keys(payload: Map<String, Value>) -> Map<String, Value> {
    payload
        .into_iter()
        .map(|(key, value)| (camel_case(&key), value))
        .collect()
}

/// Returns the first required field that is absent or `null`.
#[must_use]
pub fn first_missing<'a>(payload: &Map<String, Value>, required: &[&'a str]) -> Option<&'a str> {
    required
        .iter()
        .copied()
        .find(|field| payload.get(*field).is_none_or(Value::is_null))
}

/// Extracts the correlation value of `field` as a string.
///
/// Strings are used verbatim; other JSON values use their compact JSON text.
/// Absent and `null` values yield `None`.
#[must_use]
pub fn correlation_value(payload: &Map<String, Value>, field: &str) -> Option<String> {
    match payload.get(field)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Credentials injected into every request under [`AUTHENTICATION_FIELD`].
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    /// Username/password credentials.
    #[must_use]
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            token: None,
        }
    }

    /// Returns `(username, password)` when both are present.
    #[must_use]
    pub fn basic_pair(&self) -> Option<(&str, &str)> {
        Some((self.username.as_deref()?, self.password.as_deref()?))
    }

    /// The JSON object injected into payloads; absent fields are omitted.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        if let Some(username) = &self.username {
            map.insert("username".into(), Value::String(username.clone()));
        }
        if let Some(password) = &self.password {
            map.insert("password".into(), Value::String(password.clone()));
        }
        if let Some(token) = &self.token {
            map.insert("token".into(), Value::String(token.clone()));
        }
        Value::Object(map)
    }
}

/// Stores `credentials` under the reserved field, replacing any caller value.
pub fn inject_credentials(payload: &mut Map<String, Value>, credentials: &Credentials) {
    payload.insert(AUTHENTICATION_FIELD.to_string(), credentials.to_json());
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn credentials_debug_hides_secrets() {
        let rendered = format!("{:?}", Credentials::basic("jdoe", "hunter2"));
        assert!(rendered.contains("jdoe"));
        assert!(!rendered.contains("hunter2"));
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("test payload must be an object"),
        }
    }

    #[test]
    fn camel_case_conversions() {
        assert_eq!(camel_case("resource_path"), "resourcePath");
        assert_eq!(camel_case("destination_file_name"), "destinationFileName");
        assert_eq!(camel_case("resourcePath"), "resourcePath");
        assert_eq!(camel_case("_private_key"), "privateKey");
        assert_eq!(camel_case("trailing_"), "trailing");
        assert_eq!(camel_case("status"), "status");
    }

    #[test]
    fn normalize_keeps_values_and_order() {
        let payload = object(json!({
            "resource_path": "/p",
            "operationName": "Restart",
            "nested_map": {"inner_key": 1},
        }));
        let normalized = normalize_keys(payload);

        let keys: Vec<&str> = normalized.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["resourcePath", "operationName", "nestedMap"]);
        assert_eq!(normalized["nestedMap"], json!({"inner_key": 1}));
    }

    #[test]
    fn first_missing_treats_null_as_absent() {
        let payload = object(json!({"resourcePath": "/p", "driverName": null}));
        assert_eq!(first_missing(&payload, &["resourcePath"]), None);
        assert_eq!(
            first_missing(&payload, &["resourcePath", "driverName", "moduleName"]),
            Some("driverName")
        );
    }

    #[test]
    fn correlation_value_of_various_types() {
        let payload = object(json!({"s": "/p", "n": 42, "z": null}));
        assert_eq!(correlation_value(&payload, "s").as_deref(), Some("/p"));
        assert_eq!(correlation_value(&payload, "n").as_deref(), Some("42"));
        assert_eq!(correlation_value(&payload, "z"), None);
        assert_eq!(correlation_value(&payload, "missing"), None);
    }

    #[test]
    fn credentials_strip_absent_fields() {
        let creds = Credentials {
            username: Some("jdoe".into()),
            password: None,
            token: Some("t0k".into()),
        };
        assert_eq!(creds.to_json(), json!({"username": "jdoe", "token": "t0k"}));
        assert_eq!(creds.basic_pair(), None);
        assert_eq!(
            Credentials::basic("a", "b").basic_pair(),
            Some(("a", "b"))
        );
    }

    #[test]
    fn inject_overwrites_caller_authentication() {
        let mut payload = object(json!({"resourcePath": "/p", "authentication": "spoofed"}));
        inject_credentials(&mut payload, &Credentials::basic("u", "p"));
        assert_eq!(payload["authentication"], json!({"username": "u", "password": "p"}));
    }

    #[test]
    fn to_object_rejects_non_objects() {
        assert!(matches!(to_object(&"text"), Err(PayloadError::NotAnObject)));
        let map = to_object(&json!({"a": 1})).unwrap();
        assert_eq!(map["a"], json!(1));
    }
}
