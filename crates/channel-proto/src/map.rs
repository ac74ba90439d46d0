use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Ordered key/value payload sent on the forward channel.
///
/// Values are restricted to JSON scalars and nested maps; arrays are
/// rejected both when building a map and when decoding one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Map<String, Value>")]
pub struct Map(serde_json::Map<String, Value>);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MapError {
    #[error("map value for `{0}` is an array")]
    ArrayValue(String),
    #[error("map value for `{0}` is not a map")]
    NotAMap(String),
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, keeping insertion order. Arrays anywhere inside the
    /// value are refused.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), MapError> {
        let key = key.into();
        let value = value.into();
        validate_value(&key, &value)?;
        self.0.insert(key, value);
        Ok(())
    }

    /// Builder-style variant of [`Map::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<Self, MapError> {
        self.insert(key, value)?;
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn into_inner(self) -> serde_json::Map<String, Value> {
        self.0
    }
}

impl TryFrom<serde_json::Map<String, Value>> for Map {
    type Error = MapError;

    fn try_from(value: serde_json::Map<String, Value>) -> Result<Self, Self::Error> {
        for (key, entry) in &value {
            validate_value(key, entry)?;
        }
        Ok(Map(value))
    }
}

impl TryFrom<Value> for Map {
    type Error = MapError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(object) => Map::try_from(object),
            _ => Err(MapError::NotAMap(String::new())),
        }
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Object(map.0)
    }
}

fn validate_value(key: &str, value: &Value) -> Result<(), MapError> {
    match value {
        Value::Array(_) => Err(MapError::ArrayValue(key.to_string())),
        Value::Object(nested) => {
            for (nested_key, nested_value) in nested {
                validate_value(&format!("{key}.{nested_key}"), nested_value)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn keeps_insertion_order() {
        let map = Map::new()
            .with("zeta", 1)
            .and_then(|m| m.with("alpha", "two"))
            .and_then(|m| m.with("mid", true))
            .unwrap();
        let keys: Vec<&str> = map.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["zeta", "alpha", "mid"]);
        assert_eq!(
            serde_json::to_string(&map).unwrap(),
            r#"{"zeta":1,"alpha":"two","mid":true}"#
        );
    }

    #[test_timeout::timeout]
    fn nested_maps_are_allowed_but_arrays_are_not() {
        let mut map = Map::new();
        map.insert("inner", json!({"a": {"b": null}})).unwrap();
        assert_eq!(
            map.insert("list", json!([1, 2])),
            Err(MapError::ArrayValue("list".into()))
        );
        assert_eq!(
            map.insert("deep", json!({"x": {"y": [1]}})),
            Err(MapError::ArrayValue("deep.x.y".into()))
        );
        assert_eq!(map.len(), 1);
    }

    #[test_timeout::timeout]
    fn deserialization_validates_values() {
        let ok: Map = serde_json::from_str(r#"{"id":"1","n":{"k":2.5}}"#).unwrap();
        assert_eq!(ok.get_str("id"), Some("1"));
        assert!(serde_json::from_str::<Map>(r#"{"id":[1]}"#).is_err());
        assert!(serde_json::from_str::<Map>(r#"[1]"#).is_err());
    }
}
