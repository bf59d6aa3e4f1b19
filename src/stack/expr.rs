//! Input expressions: JSON values whose strings may interpolate
//! `${var.<name>}` and `${module.<instance>.<output>}`.

use crate::stack::value::{Attributes, Value};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use thiserror::Error;

static INTERPOLATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{\s*([^}]*?)\s*\}").expect("Invalid interpolation regex")
});

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("Invalid reference '{0}': expected var.<name> or module.<instance>.<output>")]
    InvalidReference(String),

    #[error("Reference to undeclared variable '{0}'")]
    UnknownVariable(String),

    #[error("Instance '{instance}' has no output '{output}'")]
    UnknownOutput { instance: String, output: String },

    #[error("Cannot interpolate {found} value of '{reference}' into a string")]
    NotInterpolatable { reference: String, found: String },

    #[error("null values are not supported")]
    Null,
}

/// Something an expression points at
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reference {
    Variable(String),
    Output { instance: String, output: String },
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Variable(name) => write!(f, "var.{}", name),
            Reference::Output { instance, output } => {
                write!(f, "module.{}.{}", instance, output)
            }
        }
    }
}

impl std::str::FromStr for Reference {
    type Err = ExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        let valid = |p: &str| !p.is_empty() && p.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_');

        match parts.as_slice() {
            ["var", name] if valid(name) => Ok(Reference::Variable(name.to_string())),
            ["module", instance, output] if valid(instance) && valid(output) => {
                Ok(Reference::Output {
                    instance: instance.to_string(),
                    output: output.to_string(),
                })
            }
            _ => Err(ExprError::InvalidReference(s.to_string())),
        }
    }
}

/// Result of evaluating an expression at plan or apply time
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluated {
    Known(Value),
    /// Depends on outputs of instances that have not been reconciled yet
    Unknown { pending: BTreeSet<String> },
}

/// Values an expression can read from
pub struct EvalContext<'a> {
    pub variables: &'a BTreeMap<String, Value>,
    /// Outputs of instances whose results are known
    pub outputs: &'a HashMap<String, Attributes>,
}

impl EvalContext<'_> {
    fn resolve(&self, reference: &Reference) -> Result<Evaluated, ExprError> {
        match reference {
            Reference::Variable(name) => self
                .variables
                .get(name)
                .cloned()
                .map(Evaluated::Known)
                .ok_or_else(|| ExprError::UnknownVariable(name.clone())),
            Reference::Output { instance, output } => match self.outputs.get(instance) {
                Some(outputs) => outputs
                    .get(output)
                    .cloned()
                    .map(Evaluated::Known)
                    .ok_or_else(|| ExprError::UnknownOutput {
                        instance: instance.clone(),
                        output: output.clone(),
                    }),
                None => Ok(Evaluated::Unknown {
                    pending: BTreeSet::from([instance.clone()]),
                }),
            },
        }
    }
}

/// Collect every reference in an expression
pub fn references(expr: &serde_json::Value) -> Result<Vec<Reference>, ExprError> {
    let mut found = Vec::new();
    collect_references(expr, &mut found)?;
    Ok(found)
}

fn collect_references(expr: &serde_json::Value, found: &mut Vec<Reference>) -> Result<(), ExprError> {
    match expr {
        serde_json::Value::String(s) => {
            for cap in INTERPOLATION.captures_iter(s) {
                found.push(cap[1].parse()?);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_references(item, found)?;
            }
        }
        serde_json::Value::Object(entries) => {
            for value in entries.values() {
                collect_references(value, found)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Instances an expression reads outputs from
pub fn referenced_instances(expr: &serde_json::Value) -> Result<BTreeSet<String>, ExprError> {
    Ok(references(expr)?
        .into_iter()
        .filter_map(|r| match r {
            Reference::Output { instance, .. } => Some(instance),
            Reference::Variable(_) => None,
        })
        .collect())
}

/// Evaluate an expression against the context
pub fn evaluate(expr: &serde_json::Value, ctx: &EvalContext<'_>) -> Result<Evaluated, ExprError> {
    match expr {
        serde_json::Value::Null => Err(ExprError::Null),
        serde_json::Value::Bool(b) => Ok(Evaluated::Known(Value::Bool(*b))),
        serde_json::Value::Number(n) => Ok(Evaluated::Known(Value::Number(
            n.as_f64().unwrap_or_default(),
        ))),
        serde_json::Value::String(s) => evaluate_string(s, ctx),
        serde_json::Value::Array(items) => {
            let mut values = Vec::with_capacity(items.len());
            let mut pending = BTreeSet::new();
            for item in items {
                match evaluate(item, ctx)? {
                    Evaluated::Known(v) => values.push(v),
                    Evaluated::Unknown { pending: p } => pending.extend(p),
                }
            }
            if pending.is_empty() {
                Ok(Evaluated::Known(Value::List(values)))
            } else {
                Ok(Evaluated::Unknown { pending })
            }
        }
        serde_json::Value::Object(entries) => {
            let mut values = BTreeMap::new();
            let mut pending = BTreeSet::new();
            for (key, item) in entries {
                match evaluate(item, ctx)? {
                    Evaluated::Known(v) => {
                        values.insert(key.clone(), v);
                    }
                    Evaluated::Unknown { pending: p } => pending.extend(p),
                }
            }
            if pending.is_empty() {
                Ok(Evaluated::Known(Value::Map(values)))
            } else {
                Ok(Evaluated::Unknown { pending })
            }
        }
    }
}

fn evaluate_string(s: &str, ctx: &EvalContext<'_>) -> Result<Evaluated, ExprError> {
    let captures: Vec<_> = INTERPOLATION.captures_iter(s).collect();
    if captures.is_empty() {
        return Ok(Evaluated::Known(Value::String(s.to_string())));
    }

    // A lone interpolation keeps the referenced value's type
    if let [only] = captures.as_slice() {
        let whole = only.get(0).map(|m| m.start() == 0 && m.end() == s.len());
        if whole == Some(true) {
            let reference: Reference = only[1].parse()?;
            return ctx.resolve(&reference);
        }
    }

    let mut rendered = String::with_capacity(s.len());
    let mut pending = BTreeSet::new();
    let mut last = 0;
    for cap in &captures {
        let Some(m) = cap.get(0) else { continue };
        rendered.push_str(&s[last..m.start()]);
        let reference: Reference = cap[1].parse()?;
        match ctx.resolve(&reference)? {
            Evaluated::Known(value) => {
                let text = value
                    .render_scalar()
                    .ok_or_else(|| ExprError::NotInterpolatable {
                        reference: reference.to_string(),
                        found: value.type_name().to_string(),
                    })?;
                rendered.push_str(&text);
            }
            Evaluated::Unknown { pending: p } => pending.extend(p),
        }
        last = m.end();
    }
    rendered.push_str(&s[last..]);

    if pending.is_empty() {
        Ok(Evaluated::Known(Value::String(rendered)))
    } else {
        Ok(Evaluated::Unknown { pending })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("env".to_string(), Value::from("dev")),
            ("size".to_string(), Value::Number(3.0)),
        ])
    }

    #[test]
    fn test_parse_reference() {
        assert_eq!(
            "var.region".parse::<Reference>().unwrap(),
            Reference::Variable("region".to_string())
        );
        assert_eq!(
            "module.vpc.vpc_id".parse::<Reference>().unwrap(),
            Reference::Output {
                instance: "vpc".to_string(),
                output: "vpc_id".to_string()
            }
        );
        assert!("local.x".parse::<Reference>().is_err());
        assert!("module.vpc".parse::<Reference>().is_err());
    }

    #[test]
    fn test_references_walks_nested_values() {
        let expr = json!({
            "name": "${var.env}-cluster",
            "subnets": ["${module.vpc.private_subnets}", "static"]
        });
        let refs = references(&expr).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(
            referenced_instances(&expr).unwrap(),
            BTreeSet::from(["vpc".to_string()])
        );
    }

    #[test]
    fn test_lone_interpolation_keeps_type() {
        let variables = vars();
        let outputs = HashMap::new();
        let ctx = EvalContext {
            variables: &variables,
            outputs: &outputs,
        };
        assert_eq!(
            evaluate(&json!("${var.size}"), &ctx).unwrap(),
            Evaluated::Known(Value::Number(3.0))
        );
        assert_eq!(
            evaluate(&json!("eks-${var.env}-${var.size}"), &ctx).unwrap(),
            Evaluated::Known(Value::from("eks-dev-3"))
        );
    }

    #[test]
    fn test_unknown_upstream_outputs() {
        let variables = vars();
        let outputs = HashMap::new();
        let ctx = EvalContext {
            variables: &variables,
            outputs: &outputs,
        };
        let result = evaluate(&json!({"vpc": "${module.vpc.id}", "env": "${var.env}"}), &ctx).unwrap();
        assert_eq!(
            result,
            Evaluated::Unknown {
                pending: BTreeSet::from(["vpc".to_string()])
            }
        );
    }

    #[test]
    fn test_collection_cannot_be_interpolated() {
        let variables = vars();
        let outputs = HashMap::from([(
            "vpc".to_string(),
            Attributes::from([("subnets".to_string(), Value::List(vec![]))]),
        )]);
        let ctx = EvalContext {
            variables: &variables,
            outputs: &outputs,
        };
        let err = evaluate(&json!("ids: ${module.vpc.subnets}"), &ctx).unwrap_err();
        assert!(matches!(err, ExprError::NotInterpolatable { .. }));

        let err = evaluate(&json!("${module.vpc.missing}"), &ctx).unwrap_err();
        assert!(matches!(err, ExprError::UnknownOutput { .. }));
    }
}
