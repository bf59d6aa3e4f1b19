//! Reading stack definitions and variable override files.

use crate::stack::expr::{self, Reference};
use crate::stack::model::StackConfig;
use crate::stack::value::Value;
use crate::stack::variables::{SourceKind, VariableSource};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Prefix of environment variables that supply variable values
pub const ENV_VAR_PREFIX: &str = "TFSTACK_VAR_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path}:{line}: {message}")]
    Syntax {
        path: String,
        line: usize,
        message: String,
    },

    #[error("Invalid -var argument '{0}': expected name=value")]
    InvalidCliVar(String),

    #[error("Instance '{instance}' uses unknown module '{module}'")]
    UnknownModule { instance: String, module: String },

    #[error("Instance '{instance}' sets input '{input}' which module '{module}' does not declare")]
    UnknownInput {
        instance: String,
        module: String,
        input: String,
    },

    #[error("Instance '{instance}' is missing required input '{input}'")]
    MissingInput { instance: String, input: String },

    #[error("{location} references '{reference}': {reason}")]
    InvalidReference {
        location: String,
        reference: String,
        reason: String,
    },
}

/// Load and validate a stack definition
pub fn load_stack(path: &Path) -> Result<StackConfig, ConfigError> {
    let content = read(path)?;
    let config: StackConfig = serde_json::from_str(&content).map_err(|source| ConfigError::Json {
        path: path.display().to_string(),
        source,
    })?;
    validate(&config)?;
    debug!(
        "Loaded stack from {} with {} instances",
        path.display(),
        config.instances.len()
    );
    Ok(config)
}

/// Check module usage and every reference in the stack
pub fn validate(config: &StackConfig) -> Result<(), ConfigError> {
    for instance in &config.instances {
        let Some(module) = config.module_for(instance) else {
            return Err(ConfigError::UnknownModule {
                instance: instance.name.clone(),
                module: instance.module.clone(),
            });
        };

        for input in instance.inputs.keys() {
            if !module.inputs.contains_key(input) {
                return Err(ConfigError::UnknownInput {
                    instance: instance.name.clone(),
                    module: instance.module.clone(),
                    input: input.clone(),
                });
            }
        }

        for (name, decl) in &module.inputs {
            if decl.default.is_none() && !instance.inputs.contains_key(name) {
                return Err(ConfigError::MissingInput {
                    instance: instance.name.clone(),
                    input: name.clone(),
                });
            }
        }

        for (input, value) in &instance.inputs {
            let location = format!("module.{}.{}", instance.name, input);
            check_references(config, &location, value)?;
        }
    }

    for (name, value) in &config.outputs {
        check_references(config, &format!("output.{}", name), value)?;
    }

    Ok(())
}

fn check_references(
    config: &StackConfig,
    location: &str,
    value: &serde_json::Value,
) -> Result<(), ConfigError> {
    let invalid = |reference: String, reason: String| ConfigError::InvalidReference {
        location: location.to_string(),
        reference,
        reason,
    };

    let references =
        expr::references(value).map_err(|e| invalid(value.to_string(), e.to_string()))?;

    for reference in references {
        match &reference {
            Reference::Variable(name) => {
                if !config.variables.contains_key(name) {
                    return Err(invalid(
                        reference.to_string(),
                        "variable is not declared".to_string(),
                    ));
                }
            }
            Reference::Output { instance, output } => {
                let Some(target) = config.instance(instance) else {
                    return Err(invalid(
                        reference.to_string(),
                        "instance is not declared".to_string(),
                    ));
                };
                let declared = config
                    .module_for(target)
                    .map(|m| m.outputs.iter().any(|o| o == output))
                    .unwrap_or(false);
                if !declared {
                    return Err(invalid(
                        reference.to_string(),
                        format!("module '{}' has no output '{}'", target.module, output),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Load a variable override file.
///
/// `.json` files hold a flat object. Anything else is read line by line as
/// `name = <json literal>` with `#` and `//` comments.
pub fn load_var_file(path: &Path) -> Result<VariableSource, ConfigError> {
    let content = read(path)?;
    let origin = path.display().to_string();

    let values = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_str::<BTreeMap<String, Value>>(&content).map_err(|source| {
            ConfigError::Json {
                path: origin.clone(),
                source,
            }
        })?
    } else {
        parse_tfvars(&content, &origin)?
    };

    debug!("Loaded {} values from {}", values.len(), origin);
    Ok(VariableSource {
        kind: SourceKind::File,
        origin,
        values,
    })
}

/// Parse the `name = value` variable file format
pub fn parse_tfvars(content: &str, origin: &str) -> Result<BTreeMap<String, Value>, ConfigError> {
    let mut values = BTreeMap::new();

    for (i, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }

        let syntax = |message: String| ConfigError::Syntax {
            path: origin.to_string(),
            line: i + 1,
            message,
        };

        let (name, rhs) = line
            .split_once('=')
            .ok_or_else(|| syntax("expected name = value".to_string()))?;
        let name = name.trim();
        if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
            return Err(syntax(format!("invalid variable name '{}'", name)));
        }

        let value: Value = serde_json::from_str(rhs.trim())
            .map_err(|e| syntax(format!("invalid value for '{}': {}", name, e)))?;
        values.insert(name.to_string(), value);
    }

    Ok(values)
}

/// Parse a `-var name=value` flag. The value stays a string until resolution coerces it.
pub fn parse_cli_var(arg: &str) -> Result<(String, Value), ConfigError> {
    let (name, value) = arg
        .split_once('=')
        .ok_or_else(|| ConfigError::InvalidCliVar(arg.to_string()))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(ConfigError::InvalidCliVar(arg.to_string()));
    }
    Ok((name.to_string(), Value::String(value.to_string())))
}

/// Build the CLI source from `-var` flags, later flags winning
pub fn cli_source(args: &[String]) -> Result<VariableSource, ConfigError> {
    let mut source = VariableSource::new(SourceKind::Cli, "-var");
    for arg in args {
        let (name, value) = parse_cli_var(arg)?;
        source.values.insert(name, value);
    }
    Ok(source)
}

/// Collect `TFSTACK_VAR_<name>` values from the given environment
pub fn environment_source<I>(vars: I) -> VariableSource
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut source = VariableSource::new(SourceKind::Environment, "environment");
    for (key, value) in vars {
        if let Some(name) = key.strip_prefix(ENV_VAR_PREFIX) {
            if !name.is_empty() {
                source.values.insert(name.to_string(), Value::String(value));
            }
        }
    }
    source
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}
