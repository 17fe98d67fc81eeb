use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error as ThisError;

/// A decoded protocol value. Commands, responses and unsolicited notifications are all
/// represented with this type, whatever encoding was used on the wire.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

#[derive(Debug, Clone, PartialEq, ThisError)]
pub enum ValueError {
    #[error("expected {expected}, found {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("missing key: {0}")]
    MissingKey(String),
}

impl Value {
    /// Builds an object from key/value pairs.
    pub fn object<K, V, I>(pairs: I) -> Value
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Object(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Builds an array from anything convertible into values.
    pub fn array<V, I>(items: I) -> Value
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        Value::Array(items.into_iter().map(Into::into).collect())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    pub fn as_bool(&self) -> Result<bool, ValueError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(other.mismatch("bool")),
        }
    }

    pub fn as_i64(&self) -> Result<i64, ValueError> {
        match self {
            Value::Integer(i) => Ok(*i),
            other => Err(other.mismatch("integer")),
        }
    }

    /// Integers are widened, so `{"version": 4}` and `{"version": 4.0}` read the same.
    pub fn as_f64(&self) -> Result<f64, ValueError> {
        match self {
            Value::Integer(i) => Ok(*i as f64),
            Value::Real(r) => Ok(*r),
            other => Err(other.mismatch("real")),
        }
    }

    pub fn as_str(&self) -> Result<&str, ValueError> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(other.mismatch("string")),
        }
    }

    pub fn as_array(&self) -> Result<&[Value], ValueError> {
        match self {
            Value::Array(items) => Ok(items),
            other => Err(other.mismatch("array")),
        }
    }

    pub fn as_object(&self) -> Result<&BTreeMap<String, Value>, ValueError> {
        match self {
            Value::Object(map) => Ok(map),
            other => Err(other.mismatch("object")),
        }
    }

    /// Looks up `key` in an object. Returns `None` for missing keys and for non-objects.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Like [`Value::get`], but missing keys and non-objects are errors.
    pub fn field(&self, key: &str) -> Result<&Value, ValueError> {
        self.as_object()?
            .get(key)
            .ok_or_else(|| ValueError::MissingKey(key.to_string()))
    }

    fn mismatch(&self, expected: &'static str) -> ValueError {
        ValueError::TypeMismatch {
            expected,
            actual: self.type_name(),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(r: f64) -> Self {
        Value::Real(r)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Object(map)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Real(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Integer(i) => serde_json::Value::from(i),
            // Non-finite reals have no JSON representation and become null.
            Value::Real(r) => serde_json::Number::from_f64(r)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s),
            Value::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Object(map) => {
                serde_json::Value::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::Value::from(self.clone());
        write!(f, "{}", json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_object() {
        let value = Value::object([("cmd", Value::from("ping")), ("n", Value::from(3))]);

        assert_eq!(value.get("cmd"), Some(&Value::String("ping".to_string())));
        assert_eq!(value.field("n").and_then(Value::as_i64), Ok(3));
    }

    #[test]
    fn typed_access_mismatch() {
        let value = Value::from("hello");

        assert_eq!(
            value.as_i64(),
            Err(ValueError::TypeMismatch {
                expected: "integer",
                actual: "string"
            })
        );
        assert!(value.as_array().is_err());
    }

    #[test]
    fn missing_field() {
        let value = Value::object([("a", 1)]);

        assert_eq!(
            value.field("b"),
            Err(ValueError::MissingKey("b".to_string()))
        );
        assert_eq!(value.get("b"), None);
    }

    #[test]
    fn field_on_non_object() {
        let value = Value::array(["a", "b"]);

        assert!(matches!(
            value.field("a"),
            Err(ValueError::TypeMismatch { expected: "object", .. })
        ));
    }

    #[test]
    fn real_widens_integers() {
        assert_eq!(Value::from(4).as_f64(), Ok(4.0));
        assert_eq!(Value::from(1.5).as_f64(), Ok(1.5));
    }

    #[test]
    fn from_json_keeps_integers() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"a": 1, "b": 2.5, "c": [true, null]}"#).unwrap();

        let value = Value::from(json);

        assert_eq!(value.get("a"), Some(&Value::Integer(1)));
        assert_eq!(value.get("b"), Some(&Value::Real(2.5)));
        assert_eq!(
            value.get("c"),
            Some(&Value::Array(vec![Value::Bool(true), Value::Null]))
        );
    }

    #[test]
    fn display_as_json() {
        let value = Value::object([("pong", true)]);

        assert_eq!(value.to_string(), r#"{"pong":true}"#);
    }
}
