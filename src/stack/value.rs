//! Typed values exchanged between variables, module inputs and state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Opaque attribute map exchanged with providers and recorded in state
pub type Attributes = BTreeMap<String, Value>;

/// A loosely-typed value as found in variable files, CLI flags and provider results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Name of the variant, used in mismatch diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Render a scalar for string interpolation. Lists and maps have no scalar form.
    pub fn render_scalar(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(format_number(*n)),
            Value::List(_) | Value::Map(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} = {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
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

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Declared type of a variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarType {
    String,
    Number,
    Bool,
    List(Box<VarType>),
    Map(Box<VarType>),
    Any,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown variable type: {0}. Valid types: string, number, bool, list(T), map(T), any")]
pub struct UnknownVarType(pub String);

impl std::str::FromStr for VarType {
    type Err = UnknownVarType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        let inner = |prefix: &str| -> Option<&str> {
            lowered
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('('))
                .and_then(|rest| rest.strip_suffix(')'))
        };

        match lowered.as_str() {
            "string" => return Ok(VarType::String),
            "number" => return Ok(VarType::Number),
            "bool" => return Ok(VarType::Bool),
            "any" => return Ok(VarType::Any),
            // Bare collection types hold anything
            "list" => return Ok(VarType::List(Box::new(VarType::Any))),
            "map" => return Ok(VarType::Map(Box::new(VarType::Any))),
            _ => {}
        }

        if let Some(elem) = inner("list") {
            return Ok(VarType::List(Box::new(elem.parse()?)));
        }
        if let Some(elem) = inner("map") {
            return Ok(VarType::Map(Box::new(elem.parse()?)));
        }

        Err(UnknownVarType(s.trim().to_string()))
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarType::String => write!(f, "string"),
            VarType::Number => write!(f, "number"),
            VarType::Bool => write!(f, "bool"),
            VarType::Any => write!(f, "any"),
            VarType::List(elem) => write!(f, "list({})", elem),
            VarType::Map(elem) => write!(f, "map({})", elem),
        }
    }
}

impl Serialize for VarType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VarType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Default for VarType {
    fn default() -> Self {
        VarType::Any
    }
}

impl VarType {
    /// Coerce a value to this type, following the loose conversions variable
    /// files and CLI flags rely on. Returns `None` when no conversion exists.
    pub fn coerce(&self, value: &Value) -> Option<Value> {
        match (self, value) {
            (VarType::Any, v) => Some(v.clone()),

            (VarType::String, Value::String(_)) => Some(value.clone()),
            (VarType::String, Value::Number(_) | Value::Bool(_)) => {
                value.render_scalar().map(Value::String)
            }

            (VarType::Number, Value::Number(_)) => Some(value.clone()),
            (VarType::Number, Value::String(s)) => {
                s.trim().parse::<f64>().ok().filter(|n| n.is_finite()).map(Value::Number)
            }

            (VarType::Bool, Value::Bool(_)) => Some(value.clone()),
            (VarType::Bool, Value::String(s)) => match s.trim() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },

            (VarType::List(elem), Value::List(items)) => items
                .iter()
                .map(|item| elem.coerce(item))
                .collect::<Option<Vec<_>>>()
                .map(Value::List),
            (VarType::Map(elem), Value::Map(entries)) => entries
                .iter()
                .map(|(k, v)| elem.coerce(v).map(|v| (k.clone(), v)))
                .collect::<Option<BTreeMap<_, _>>>()
                .map(Value::Map),

            // CLI flags carry collections as JSON text
            (VarType::List(_) | VarType::Map(_), Value::String(s)) => {
                let parsed: Value = serde_json::from_str(s).ok()?;
                match parsed {
                    Value::List(_) | Value::Map(_) => self.coerce(&parsed),
                    _ => None,
                }
            }

            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var_type() {
        assert_eq!("string".parse::<VarType>().unwrap(), VarType::String);
        assert_eq!("number".parse::<VarType>().unwrap(), VarType::Number);
        assert_eq!(
            "list(string)".parse::<VarType>().unwrap(),
            VarType::List(Box::new(VarType::String))
        );
        assert_eq!(
            "map(list(number))".parse::<VarType>().unwrap(),
            VarType::Map(Box::new(VarType::List(Box::new(VarType::Number))))
        );
        assert_eq!(
            "tuple".parse::<VarType>().unwrap_err(),
            UnknownVarType("tuple".to_string())
        );
        assert_eq!(
            VarType::Map(Box::new(VarType::Bool)).to_string(),
            "map(bool)"
        );
    }

    #[test]
    fn test_parse_var_type_ignores_case() {
        assert_eq!(
            "List".parse::<VarType>().unwrap(),
            VarType::List(Box::new(VarType::Any))
        );
        assert_eq!(
            "List(String)".parse::<VarType>().unwrap(),
            VarType::List(Box::new(VarType::String))
        );
        assert_eq!(
            " MAP(Number) ".parse::<VarType>().unwrap(),
            VarType::Map(Box::new(VarType::Number))
        );
    }

    #[test]
    fn test_coerce_scalars() {
        assert_eq!(
            VarType::Number.coerce(&Value::from("3")),
            Some(Value::Number(3.0))
        );
        assert_eq!(VarType::Number.coerce(&Value::from("three")), None);
        assert_eq!(
            VarType::Bool.coerce(&Value::from("false")),
            Some(Value::Bool(false))
        );
        assert_eq!(
            VarType::String.coerce(&Value::Number(2.0)),
            Some(Value::from("2"))
        );
        assert_eq!(VarType::String.coerce(&Value::List(vec![])), None);
    }

    #[test]
    fn test_coerce_collections_from_json_text() {
        let ty: VarType = "list(string)".parse().unwrap();
        assert_eq!(
            ty.coerce(&Value::from(r#"["a", "b"]"#)),
            Some(Value::List(vec![Value::from("a"), Value::from("b")]))
        );
        assert_eq!(ty.coerce(&Value::from("a,b")), None);

        let ty: VarType = "map(number)".parse().unwrap();
        assert_eq!(ty.coerce(&Value::from(r#"{"a": true}"#)), None);
    }

    #[test]
    fn test_value_json_shape() {
        let value: Value = serde_json::from_str(r#"{"azs": ["a", "b"], "count": 2, "on": true}"#)
            .unwrap();
        match &value {
            Value::Map(entries) => {
                assert_eq!(entries["count"], Value::Number(2.0));
                assert_eq!(entries["on"], Value::Bool(true));
            }
            other => panic!("unexpected value {:?}", other),
        }
        assert_eq!(value.to_string(), r#"{azs = ["a", "b"], count = 2, on = true}"#);
    }
}
