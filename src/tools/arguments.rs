//! Typed access to tool call arguments.

use serde_json::Value;

use crate::error::TillerError;
use crate::types::ArgumentMap;

/// Wrapper around validated tool call arguments providing typed extraction.
#[derive(Debug, Clone, Default)]
pub struct ToolArguments {
    values: ArgumentMap,
}

impl ToolArguments {
    pub fn new(values: ArgumentMap) -> Self {
        Self { values }
    }

    /// Raw argument map.
    pub fn raw(&self) -> &ArgumentMap {
        &self.values
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Get a string argument by key.
    pub fn get_str(&self, key: &str) -> Result<&str, TillerError> {
        self.values
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| missing("string", key))
    }

    /// Get an optional string argument.
    pub fn get_str_opt(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Result<i64, TillerError> {
        self.values
            .get(key)
            .and_then(Value::as_i64)
            .ok_or_else(|| missing("integer", key))
    }

    pub fn get_f64(&self, key: &str) -> Result<f64, TillerError> {
        self.values
            .get(key)
            .and_then(Value::as_f64)
            .ok_or_else(|| missing("number", key))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, TillerError> {
        self.values
            .get(key)
            .and_then(Value::as_bool)
            .ok_or_else(|| missing("boolean", key))
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.values.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    /// Deserialize the entire argument object into a typed struct.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T, TillerError> {
        serde_json::from_value(Value::Object(self.values.clone()))
            .map_err(|e| TillerError::InvalidArgument(e.to_string()))
    }
}

impl From<ArgumentMap> for ToolArguments {
    fn from(values: ArgumentMap) -> Self {
        Self::new(values)
    }
}

fn missing(kind: &str, key: &str) -> TillerError {
    TillerError::InvalidArgument(format!("Missing {kind} argument: {key}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn args(value: Value) -> ToolArguments {
        ToolArguments::new(value.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn typed_getters_report_missing_keys() {
        let a = args(json!({"expression": "2+2", "precise": true, "digits": 3}));
        assert_eq!(a.get_str("expression").unwrap(), "2+2");
        assert!(a.get_bool("precise").unwrap());
        assert_eq!(a.get_i64("digits").unwrap(), 3);
        assert_eq!(a.get_str_opt("missing"), None);
        assert!(!a.get_bool_or("verbose", false));

        let err = a.get_str("missing").unwrap_err();
        assert!(err.to_string().contains("Missing string argument: missing"));
    }

    #[test]
    fn deserializes_into_struct() {
        #[derive(Deserialize)]
        struct Calc {
            expression: String,
        }
        let calc: Calc = args(json!({"expression": "1+1"})).deserialize().unwrap();
        assert_eq!(calc.expression, "1+1");
        assert!(args(json!({})).deserialize::<Calc>().is_err());
    }
}
