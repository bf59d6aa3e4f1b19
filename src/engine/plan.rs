//! Diffing desired instance attributes against recorded state.

use crate::engine::provider::ProviderRegistry;
use crate::stack::expr::{self, EvalContext, Evaluated, ExprError};
use crate::stack::graph::{GraphError, GraphNode, ModuleGraph};
use crate::stack::model::{instance_address, InstanceDecl, ModuleDef, StackConfig};
use crate::stack::value::{Attributes, Value};
use crate::state::model::{ResourceRecord, State};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("Cannot evaluate input '{input}' of instance '{instance}': {source}")]
    Expression {
        instance: String,
        input: String,
        #[source]
        source: ExprError,
    },

    #[error("Cannot evaluate output '{output}': {source}")]
    Output {
        output: String,
        #[source]
        source: ExprError,
    },

    #[error("Output '{0}' depends on instances that have not been applied")]
    UnresolvedOutput(String),

    #[error("No provider for kind '{kind}' used by instance '{instance}'")]
    UnknownProvider { instance: String, kind: String },

    #[error("Instance '{0}' is not part of the configuration")]
    UnknownInstance(String),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// What an apply will do to one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    NoOp,
    Create,
    Update,
    Replace,
    Delete,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::NoOp => write!(f, "no-op"),
            Action::Create => write!(f, "create"),
            Action::Update => write!(f, "update"),
            Action::Replace => write!(f, "replace"),
            Action::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub name: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedChange {
    pub instance: String,
    pub address: String,
    pub module: String,
    pub kind: String,
    pub action: Action,
    /// `None` when inputs are only known after upstream instances apply
    pub desired: Option<Attributes>,
    pub pending_upstream: BTreeSet<String>,
    pub changes: Vec<AttributeChange>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub add: usize,
    pub change: usize,
    pub destroy: usize,
}

/// Ordered changes for one workspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub workspace: String,
    /// Serial of the state the plan was computed against
    pub state_serial: u64,
    pub destroy: bool,
    pub changes: Vec<PlannedChange>,
}

impl Plan {
    pub fn has_changes(&self) -> bool {
        self.changes.iter().any(|c| c.action != Action::NoOp)
    }

    pub fn summary(&self) -> ChangeSummary {
        let mut summary = ChangeSummary::default();
        for change in &self.changes {
            match change.action {
                Action::NoOp => {}
                Action::Create => summary.add += 1,
                Action::Update => summary.change += 1,
                Action::Replace => {
                    summary.add += 1;
                    summary.destroy += 1;
                }
                Action::Delete => summary.destroy += 1,
            }
        }
        summary
    }

    pub fn change(&self, instance: &str) -> Option<&PlannedChange> {
        self.changes.iter().find(|c| c.instance == instance)
    }
}

/// Desired attributes of an instance, or the instances they wait on
#[derive(Debug, Clone, PartialEq)]
pub enum Desired {
    Known(Attributes),
    Unknown(BTreeSet<String>),
}

/// Evaluate an instance's inputs, filling module defaults for omitted ones
pub fn desired_attributes(
    instance: &InstanceDecl,
    module: &ModuleDef,
    ctx: &EvalContext<'_>,
) -> Result<Desired, PlanError> {
    let mut desired = Attributes::new();
    let mut pending = BTreeSet::new();

    for (input, decl) in &module.inputs {
        let Some(expr) = instance.inputs.get(input) else {
            if let Some(default) = &decl.default {
                desired.insert(input.clone(), default.clone());
            }
            continue;
        };

        match expr::evaluate(expr, ctx).map_err(|source| PlanError::Expression {
            instance: instance.name.clone(),
            input: input.clone(),
            source,
        })? {
            Evaluated::Known(value) => {
                desired.insert(input.clone(), value);
            }
            Evaluated::Unknown { pending: p } => pending.extend(p),
        }
    }

    if pending.is_empty() {
        Ok(Desired::Known(desired))
    } else {
        Ok(Desired::Unknown(pending))
    }
}

/// Attribute-level differences between desired and recorded attributes.
/// Attributes only the provider sets are not compared.
pub fn diff_attributes(desired: &Attributes, recorded: &Attributes) -> Vec<AttributeChange> {
    desired
        .iter()
        .filter(|(name, value)| recorded.get(*name) != Some(*value))
        .map(|(name, value)| AttributeChange {
            name: name.clone(),
            before: recorded.get(name).cloned(),
            after: Some(value.clone()),
        })
        .collect()
}

/// Every declared output present in the record
pub fn has_declared_outputs(module: &ModuleDef, record: &ResourceRecord) -> bool {
    module.outputs.iter().all(|o| record.outputs.contains_key(o))
}

/// Fail before confirmation if any instance uses a kind with no provider
pub fn check_providers(config: &StackConfig, providers: &ProviderRegistry) -> Result<(), PlanError> {
    for instance in &config.instances {
        let kind = config
            .module_for(instance)
            .map(|m| m.kind.as_str())
            .unwrap_or_default();
        if !providers.contains(kind) {
            return Err(PlanError::UnknownProvider {
                instance: instance.name.clone(),
                kind: kind.to_string(),
            });
        }
    }
    Ok(())
}

/// Plan the changes that bring `state` in line with the configuration
pub fn compute(
    workspace: &str,
    config: &StackConfig,
    graph: &ModuleGraph,
    variables: &BTreeMap<String, Value>,
    state: &State,
) -> Result<Plan, PlanError> {
    let mut changes = Vec::with_capacity(graph.len());
    // Outputs of instances that will not change, usable by their dependents at plan time
    let mut known: HashMap<String, Attributes> = HashMap::new();

    for name in graph.order() {
        let instance = config
            .instance(name)
            .ok_or_else(|| PlanError::UnknownInstance(name.to_string()))?;
        let module = config
            .module_for(instance)
            .ok_or_else(|| PlanError::UnknownInstance(name.to_string()))?;
        let address = instance.address();
        let record = state.get(&address);

        let ctx = EvalContext {
            variables,
            outputs: &known,
        };
        let desired = desired_attributes(instance, module, &ctx)?;

        let mut planned = PlannedChange {
            instance: instance.name.clone(),
            address,
            module: instance.module.clone(),
            kind: module.kind.clone(),
            action: Action::NoOp,
            desired: None,
            pending_upstream: BTreeSet::new(),
            changes: Vec::new(),
        };

        match desired {
            Desired::Unknown(pending) => {
                planned.action = match record {
                    None => Action::Create,
                    Some(r) if r.kind != module.kind => Action::Replace,
                    Some(_) => Action::Update,
                };
                planned.pending_upstream = pending;
            }
            Desired::Known(desired) => {
                match record {
                    None => {
                        planned.action = Action::Create;
                        planned.changes = diff_attributes(&desired, &Attributes::new());
                    }
                    Some(r) if r.kind != module.kind => {
                        planned.action = Action::Replace;
                        planned.changes = diff_attributes(&desired, &r.attributes);
                    }
                    Some(r) => {
                        planned.changes = diff_attributes(&desired, &r.attributes);
                        if planned.changes.is_empty() && has_declared_outputs(module, r) {
                            known.insert(instance.name.clone(), r.outputs.clone());
                        } else {
                            planned.action = Action::Update;
                        }
                    }
                }
                planned.desired = Some(desired);
            }
        }

        debug!("Planned {} for {}", planned.action, planned.address);
        changes.push(planned);
    }

    let orphans: Vec<&ResourceRecord> = state
        .resources
        .values()
        .filter(|r| !graph.contains(&r.instance))
        .collect();
    changes.extend(deletions(&orphans)?);

    Ok(Plan {
        workspace: workspace.to_string(),
        state_serial: state.serial,
        destroy: false,
        changes,
    })
}

/// Plan deletion of everything the workspace records
pub fn compute_destroy(workspace: &str, state: &State) -> Result<Plan, PlanError> {
    let records: Vec<&ResourceRecord> = state.resources.values().collect();
    Ok(Plan {
        workspace: workspace.to_string(),
        state_serial: state.serial,
        destroy: true,
        changes: deletions(&records)?,
    })
}

/// Deletes ordered so that dependents go before what they consumed
fn deletions(records: &[&ResourceRecord]) -> Result<Vec<PlannedChange>, PlanError> {
    let names: BTreeSet<&str> = records.iter().map(|r| r.instance.as_str()).collect();
    let nodes = records
        .iter()
        .map(|r| {
            GraphNode::new(
                r.instance.clone(),
                r.dependencies
                    .iter()
                    .filter(|d| names.contains(d.as_str()))
                    .cloned(),
            )
        })
        .collect();
    let graph = ModuleGraph::build(nodes)?;

    let by_name: HashMap<&str, &ResourceRecord> =
        records.iter().map(|r| (r.instance.as_str(), *r)).collect();

    Ok(graph
        .reverse_order()
        .into_iter()
        .filter_map(|name| by_name.get(name))
        .map(|record| PlannedChange {
            instance: record.instance.clone(),
            address: instance_address(&record.instance),
            module: record.module.clone(),
            kind: record.kind.clone(),
            action: Action::Delete,
            desired: None,
            pending_upstream: BTreeSet::new(),
            changes: record
                .attributes
                .iter()
                .map(|(name, value)| AttributeChange {
                    name: name.clone(),
                    before: Some(value.clone()),
                    after: None,
                })
                .collect(),
        })
        .collect())
}
