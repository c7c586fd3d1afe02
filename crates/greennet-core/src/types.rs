/*!
 * Core data types for GreenNet.
 *
 * The gateway publishes every leaf of its property tree as a plain text
 * payload. [`Value`] is the typed scalar those payloads are parsed into.
 */
use std::fmt;

use serde::{Deserialize, Serialize};

/// A typed scalar leaf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean value
    Bool(bool),
    /// Integer value
    Integer(i64),
    /// Floating-point value
    Float(f64),
    /// String value
    String(String),
}

impl Value {
    /// Parse a raw wire leaf.
    ///
    /// `true`/`false` (any case) become booleans, then an integer parse is
    /// attempted, then a float parse. Anything else is kept as text, so this
    /// never fails.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();

        if trimmed.eq_ignore_ascii_case("true") {
            return Value::Bool(true);
        }
        if trimmed.eq_ignore_ascii_case("false") {
            return Value::Bool(false);
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Value::Integer(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            return Value::Float(f);
        }

        Value::String(raw.to_string())
    }

    /// Check if the value is a boolean
    pub fn is_bool(&self) -> bool {
        matches!(self, Value::Bool(_))
    }

    /// Check if the value is numeric (integer or float)
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    /// Check if the value is a string
    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    /// Try to get a boolean value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get an integer value
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(f) if *f == (*f as i64) as f64 => Some(*f as i64),
            _ => None,
        }
    }

    /// Try to get a float value
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Try to get a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view that also accepts numeric text and truncates floats.
    ///
    /// State fields arrive either already parsed or as raw JSON strings,
    /// depending on which topic carried them.
    pub fn to_integer_lossy(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(f) if f.is_finite() => Some(*f as i64),
            Value::String(s) => match Value::parse(s) {
                Value::String(_) => None,
                parsed => parsed.to_integer_lossy(),
            },
            _ => None,
        }
    }

    /// Float view that also accepts numeric text
    pub fn to_float_lossy(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::String(s) => match Value::parse(s) {
                Value::String(_) => None,
                parsed => parsed.to_float_lossy(),
            },
            _ => None,
        }
    }

    /// Convert into a JSON value
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Build a scalar from a JSON leaf. Returns `None` for arrays, objects
    /// and null.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Value::Integer)
                .or_else(|| n.as_f64().map(Value::Float)),
            serde_json::Value::String(s) => Some(Value::String(s.clone())),
            _ => None,
        }
    }
}

/// Wire text form. The gateway expects every function value as a string.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<u8> for Value {
    fn from(i: u8) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_booleans_case_insensitive() {
        assert_eq!(Value::parse("true"), Value::Bool(true));
        assert_eq!(Value::parse("True"), Value::Bool(true));
        assert_eq!(Value::parse("FALSE"), Value::Bool(false));
    }

    #[test]
    fn test_parse_numbers() {
        assert_eq!(Value::parse("42"), Value::Integer(42));
        assert_eq!(Value::parse("-7"), Value::Integer(-7));
        assert_eq!(Value::parse("1"), Value::Integer(1));
        assert_eq!(Value::parse("3.14"), Value::Float(3.14));
    }

    #[test]
    fn test_parse_falls_through_to_text() {
        assert_eq!(Value::parse("hello"), Value::String("hello".to_string()));
        assert_eq!(Value::parse("0123ABCD"), Value::String("0123ABCD".to_string()));
        assert_eq!(Value::parse(""), Value::String(String::new()));
    }

    #[test]
    fn test_lossy_conversions() {
        assert_eq!(Value::String("55".into()).to_integer_lossy(), Some(55));
        assert_eq!(Value::Float(12.9).to_integer_lossy(), Some(12));
        assert_eq!(Value::String("on".into()).to_integer_lossy(), None);
        assert_eq!(Value::String("0.5".into()).to_float_lossy(), Some(0.5));
        assert_eq!(Value::Bool(true).to_float_lossy(), None);
    }

    #[test]
    fn test_wire_text() {
        assert_eq!(Value::Integer(100).to_string(), "100");
        assert_eq!(Value::from("stop").to_string(), "stop");
        assert_eq!(Value::Float(21.5).to_string(), "21.5");
    }

    #[test]
    fn test_json_conversion() {
        let json = serde_json::json!(7);
        assert_eq!(Value::from_json(&json), Some(Value::Integer(7)));
        assert_eq!(Value::Integer(7).to_json(), json);
        assert_eq!(Value::from_json(&serde_json::Value::Null), None);

        let decoded: Value = serde_json::from_str("\"on\"").unwrap();
        assert_eq!(decoded, Value::String("on".to_string()));
        let decoded: Value = serde_json::from_str("2.5").unwrap();
        assert_eq!(decoded, Value::Float(2.5));
    }
}
