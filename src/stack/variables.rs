//! Variable resolution: declared defaults overlaid by environment, files and CLI flags.

use crate::stack::model::VariableDecl;
use crate::stack::value::{Value, VarType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VariableError {
    #[error("No value for required variable '{name}'")]
    MissingRequiredVariable { name: String },

    #[error("Variable '{name}' expects {expected} but {origin} supplied a {found}")]
    TypeMismatch {
        name: String,
        expected: VarType,
        found: String,
        origin: String,
    },
}

/// Where a layer of variable values came from. Ordering is precedence, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Default,
    Environment,
    File,
    Cli,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Default => write!(f, "default"),
            SourceKind::Environment => write!(f, "environment"),
            SourceKind::File => write!(f, "file"),
            SourceKind::Cli => write!(f, "cli"),
        }
    }
}

/// One layer of override values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableSource {
    pub kind: SourceKind,
    /// Human-readable origin such as a file path or `-var`
    pub origin: String,
    pub values: BTreeMap<String, Value>,
}

impl VariableSource {
    pub fn new(kind: SourceKind, origin: impl Into<String>) -> Self {
        Self {
            kind,
            origin: origin.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

/// Concrete, type-checked variable values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableSet {
    values: BTreeMap<String, Value>,
    origins: BTreeMap<String, String>,
}

impl VariableSet {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Where the winning value of a variable came from
    pub fn origin(&self, name: &str) -> Option<&str> {
        self.origins.get(name).map(String::as_str)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Resolve the schema against the override sources.
///
/// Precedence is `Cli > File > Environment > Default`; within one kind, a later
/// source wins. Every winning value is coerced to the declared type.
pub fn resolve(
    schema: &BTreeMap<String, VariableDecl>,
    sources: &[VariableSource],
) -> Result<VariableSet, VariableError> {
    // Stable sort keeps the caller's order inside each kind
    let mut layers: Vec<&VariableSource> = sources.iter().collect();
    layers.sort_by_key(|source| source.kind);

    for source in &layers {
        for name in source.values.keys() {
            if !schema.contains_key(name) {
                warn!(
                    "Ignoring value for undeclared variable '{}' from {}",
                    name, source.origin
                );
            }
        }
    }

    let mut set = VariableSet::default();
    for (name, decl) in schema {
        let winner = layers
            .iter()
            .rev()
            .find_map(|source| source.values.get(name).map(|v| (v, source.origin.as_str())))
            .or_else(|| decl.default.as_ref().map(|v| (v, "default")));

        let Some((raw, origin)) = winner else {
            return Err(VariableError::MissingRequiredVariable { name: name.clone() });
        };

        let value = decl
            .type_
            .coerce(raw)
            .ok_or_else(|| VariableError::TypeMismatch {
                name: name.clone(),
                expected: decl.type_.clone(),
                found: raw.type_name().to_string(),
                origin: origin.to_string(),
            })?;

        debug!("Variable '{}' resolved from {}", name, origin);
        set.values.insert(name.clone(), value);
        set.origins.insert(name.clone(), origin.to_string());
    }

    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(type_: &str, default: Option<Value>) -> VariableDecl {
        VariableDecl {
            type_: type_.parse().unwrap(),
            default,
            ..Default::default()
        }
    }

    fn schema() -> BTreeMap<String, VariableDecl> {
        BTreeMap::from([
            ("region".to_string(), decl("string", Some(Value::from("us-east-1")))),
            ("node_count".to_string(), decl("number", Some(Value::Number(1.0)))),
            ("environment".to_string(), decl("string", None)),
        ])
    }

    #[test]
    fn test_precedence_cli_over_file_over_default() {
        let sources = vec![
            VariableSource::new(SourceKind::Cli, "-var")
                .with("node_count", "5")
                .with("environment", "prod"),
            VariableSource::new(SourceKind::File, "envs/dev.tfvars")
                .with("node_count", 3.0)
                .with("environment", "dev")
                .with("region", "eu-west-1"),
        ];
        let set = resolve(&schema(), &sources).unwrap();

        assert_eq!(set.get("node_count"), Some(&Value::Number(5.0)));
        assert_eq!(set.get("environment"), Some(&Value::from("prod")));
        assert_eq!(set.get("region"), Some(&Value::from("eu-west-1")));
        assert_eq!(set.origin("region"), Some("envs/dev.tfvars"));
        assert_eq!(set.origin("node_count"), Some("-var"));
    }

    #[test]
    fn test_later_file_wins() {
        let sources = vec![
            VariableSource::new(SourceKind::File, "common.tfvars").with("environment", "common"),
            VariableSource::new(SourceKind::File, "dev.tfvars").with("environment", "dev"),
        ];
        let set = resolve(&schema(), &sources).unwrap();
        assert_eq!(set.get("environment"), Some(&Value::from("dev")));
        assert_eq!(set.get("region"), Some(&Value::from("us-east-1")));
        assert_eq!(set.origin("region"), Some("default"));
    }

    #[test]
    fn test_missing_required_variable() {
        let err = resolve(&schema(), &[]).unwrap_err();
        assert_eq!(
            err,
            VariableError::MissingRequiredVariable {
                name: "environment".to_string()
            }
        );
    }

    #[test]
    fn test_type_mismatch_reports_origin() {
        let sources = vec![VariableSource::new(SourceKind::File, "dev.tfvars")
            .with("environment", "dev")
            .with("node_count", "many")];
        match resolve(&schema(), &sources).unwrap_err() {
            VariableError::TypeMismatch { name, origin, .. } => {
                assert_eq!(name, "node_count");
                assert_eq!(origin, "dev.tfvars");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_bad_default_is_a_mismatch() {
        let schema = BTreeMap::from([("flag".to_string(), decl("bool", Some(Value::from("yes"))))]);
        assert!(matches!(
            resolve(&schema, &[]),
            Err(VariableError::TypeMismatch { .. })
        ));
    }
}
