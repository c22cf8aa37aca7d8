//! Values handed to the host runtime.
//!
//! The host sees numbers, booleans, strings, arrays and objects, exactly the
//! shapes a JavaScript engine would. Serialization is untagged so a value
//! maps one-to-one onto JSON. Object keys keep their insertion order.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Host value types (must be serializable)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum HostValue {
    /// Null / undefined
    Null,
    /// Boolean value
    Bool(bool),
    /// Numeric value (f64 for JS compatibility)
    Number(f64),
    /// String value
    String(String),
    /// Array of values
    Array(Vec<HostValue>),
    /// Object/map of values
    Object(HostObject),
}

impl HostValue {
    /// Check if value is null
    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null)
    }

    /// Get as boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            HostValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as an integer, if the number is integral
    pub fn as_i64(&self) -> Option<i64> {
        self.as_number()
            .filter(|n| n.is_finite() && n.fract() == 0.0)
            .map(|n| n as i64)
    }

    /// Get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as array
    pub fn as_array(&self) -> Option<&Vec<HostValue>> {
        match self {
            HostValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Get as object
    pub fn as_object(&self) -> Option<&HostObject> {
        match self {
            HostValue::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Look up a key of an object value
    pub fn get(&self, key: &str) -> Option<&HostValue> {
        self.as_object().and_then(|obj| obj.get(key))
    }

    /// Name of the value's kind, for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            HostValue::Null => "null",
            HostValue::Bool(_) => "boolean",
            HostValue::Number(_) => "number",
            HostValue::String(_) => "string",
            HostValue::Array(_) => "array",
            HostValue::Object(_) => "object",
        }
    }

    /// Build an object from key/value pairs
    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, HostValue)>) -> Self {
        HostValue::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Object entries in insertion order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostObject(Vec<(String, HostValue)>);

impl HostObject {
    /// Create an empty object
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, replacing an existing entry in place
    pub fn insert(&mut self, key: impl Into<String>, value: HostValue) {
        let key = key.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.0.push((key, value)),
        }
    }

    /// Value stored under `key`
    pub fn get(&self, key: &str) -> Option<&HostValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HostValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the object has no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, HostValue)> for HostObject {
    fn from_iter<I: IntoIterator<Item = (String, HostValue)>>(iter: I) -> Self {
        let mut object = HostObject::new();
        for (key, value) in iter {
            object.insert(key, value);
        }
        object
    }
}

impl Serialize for HostObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for HostObject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ObjectVisitor;

        impl<'de> Visitor<'de> for ObjectVisitor {
            type Value = HostObject;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<HostObject, A::Error> {
                let mut object = HostObject::new();
                while let Some((key, value)) = access.next_entry::<String, HostValue>()? {
                    object.insert(key, value);
                }
                Ok(object)
            }
        }

        deserializer.deserialize_map(ObjectVisitor)
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Bool(b)
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        HostValue::Number(n)
    }
}

impl From<i32> for HostValue {
    fn from(n: i32) -> Self {
        HostValue::Number(n as f64)
    }
}

impl From<i64> for HostValue {
    fn from(n: i64) -> Self {
        HostValue::Number(n as f64)
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::String(s)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::String(s.to_string())
    }
}

impl<T: Into<HostValue>> From<Vec<T>> for HostValue {
    fn from(v: Vec<T>) -> Self {
        HostValue::Array(v.into_iter().map(Into::into).collect())
    }
}

impl Default for HostValue {
    fn default() -> Self {
        HostValue::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integral_numbers() {
        assert_eq!(HostValue::from(42).as_i64(), Some(42));
        assert_eq!(HostValue::Number(4.5).as_i64(), None);
        assert_eq!(HostValue::Number(f64::NAN).as_i64(), None);
        assert_eq!(HostValue::from("42").as_i64(), None);
    }

    #[test]
    fn test_object_lookup() {
        let value = HostValue::object([("name", HostValue::from("DIM")), ("level", 42.into())]);
        assert_eq!(value.get("name").and_then(HostValue::as_str), Some("DIM"));
        assert_eq!(value.get("level").and_then(HostValue::as_i64), Some(42));
        assert!(value.get("missing").is_none());
    }

    #[test]
    fn test_untagged_json() {
        let value = HostValue::from(vec!["TURNON", "DIM"]);
        assert_eq!(serde_json::to_string(&value).unwrap(), r#"["TURNON","DIM"]"#);

        let parsed: HostValue = serde_json::from_str(r#"{"name":"ON"}"#).unwrap();
        assert_eq!(parsed.get("name"), Some(&HostValue::from("ON")));
    }

    #[test]
    fn test_object_keeps_insertion_order() {
        let value = HostValue::object([
            ("name", HostValue::from("Lamp")),
            ("id", 3.into()),
            ("methods", HostValue::from(vec!["TURNON"])),
            ("model", "codeswitch".into()),
        ]);
        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            r#"{"name":"Lamp","id":3.0,"methods":["TURNON"],"model":"codeswitch"}"#
        );

        let parsed: HostValue = serde_json::from_str(r#"{"z":1,"a":2,"m":3}"#).unwrap();
        let keys: Vec<_> = parsed.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["z", "a", "m"]);
    }

    #[test]
    fn test_object_insert_replaces_in_place() {
        let mut object = HostObject::new();
        object.insert("a", 1.into());
        object.insert("b", 2.into());
        object.insert("a", 3.into());
        assert_eq!(object.len(), 2);
        assert_eq!(object.keys().collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(object.get("a"), Some(&HostValue::from(3)));
    }
}
