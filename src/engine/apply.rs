//! Sequential reconciliation of a confirmed plan.

use crate::engine::plan::{self, Action, Desired, Plan, PlanError, PlannedChange};
use crate::engine::provider::{ProviderRegistry, ReconcileRequest, ResourceProvider};
use crate::stack::expr::{self, EvalContext, Evaluated};
use crate::stack::graph::ModuleGraph;
use crate::stack::model::StackConfig;
use crate::stack::value::{Attributes, Value};
use crate::state::model::{ResourceRecord, State};
use crate::state::store::{StateError, StateLock, WorkspaceStore};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Cooperative cancellation shared between a signal handler and the executor
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One instance whose reconciliation failed, with the provider's error
#[derive(Debug)]
pub struct InstanceFailure {
    pub instance: String,
    pub error: anyhow::Error,
}

/// Apply stopped at a failing instance. Everything in `completed` is committed to state.
#[derive(Error, Debug)]
#[error("{}", describe_partial(.completed, .failed, .not_attempted))]
pub struct PartialApplyError {
    pub completed: Vec<String>,
    pub failed: Vec<InstanceFailure>,
    pub not_attempted: Vec<String>,
}

fn describe_partial(completed: &[String], failed: &[InstanceFailure], not_attempted: &[String]) -> String {
    let failures: Vec<String> = failed
        .iter()
        .map(|f| format!("'{}': {:#}", f.instance, f.error))
        .collect();
    format!(
        "Apply failed for {}; committed: [{}]; not attempted: [{}]",
        failures.join(", "),
        completed.join(", "),
        not_attempted.join(", ")
    )
}

#[derive(Error, Debug)]
pub enum ApplyError {
    #[error(transparent)]
    Partial(#[from] PartialApplyError),

    #[error("Apply interrupted; committed: [{}]; not attempted: [{}]", .completed.join(", "), .not_attempted.join(", "))]
    Interrupted {
        completed: Vec<String>,
        not_attempted: Vec<String>,
    },

    #[error("Failed to commit state after '{instance}': {source}")]
    StateCommit {
        instance: String,
        #[source]
        source: StateError,
    },

    #[error("Plan targets workspace '{plan}' but the lock is for '{lock}'")]
    WorkspaceMismatch { plan: String, lock: String },

    #[error("Plan was computed at state serial {planned}, but state is at serial {current}")]
    StalePlan { planned: u64, current: u64 },

    #[error(transparent)]
    Plan(#[from] PlanError),
}

/// Outcome of a completed apply
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub workspace: String,
    pub applied: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: Vec<String>,
    pub outputs: BTreeMap<String, Value>,
    pub serial: u64,
    pub provider_calls: usize,
}

/// Configuration the plan was computed from
pub struct ApplyContext<'a> {
    pub config: &'a StackConfig,
    pub graph: &'a ModuleGraph,
    pub variables: &'a BTreeMap<String, Value>,
}

enum Step {
    Applied,
    Deleted,
    Unchanged,
}

pub struct Executor<'a> {
    store: &'a WorkspaceStore,
    providers: &'a ProviderRegistry,
    cancel: CancelToken,
}

struct Run<'r> {
    lock: &'r StateLock,
    state: State,
    saved_serial: u64,
    outputs: HashMap<String, Attributes>,
    report: ApplyReport,
}

impl<'a> Executor<'a> {
    pub fn new(store: &'a WorkspaceStore, providers: &'a ProviderRegistry) -> Self {
        Self {
            store,
            providers,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Reconcile every change in plan order, committing state after each one.
    ///
    /// `state` must be the state the plan was computed against, loaded under `lock`.
    pub async fn apply(
        &self,
        lock: &StateLock,
        ctx: &ApplyContext<'_>,
        state: State,
        plan: &Plan,
    ) -> Result<ApplyReport, ApplyError> {
        if lock.workspace() != plan.workspace {
            return Err(ApplyError::WorkspaceMismatch {
                plan: plan.workspace.clone(),
                lock: lock.workspace().to_string(),
            });
        }
        if state.serial != plan.state_serial {
            return Err(ApplyError::StalePlan {
                planned: plan.state_serial,
                current: state.serial,
            });
        }

        let mut run = Run {
            lock,
            saved_serial: state.serial,
            state,
            outputs: HashMap::new(),
            report: ApplyReport {
                workspace: plan.workspace.clone(),
                ..Default::default()
            },
        };
        let mut completed: Vec<String> = Vec::new();

        for (i, change) in plan.changes.iter().enumerate() {
            let remaining = || {
                plan.changes[i..]
                    .iter()
                    .map(|c| c.instance.clone())
                    .collect::<Vec<_>>()
            };

            if self.cancel.is_cancelled() {
                warn!("Apply of workspace '{}' interrupted", plan.workspace);
                return Err(ApplyError::Interrupted {
                    completed,
                    not_attempted: remaining(),
                });
            }

            match self.step(&mut run, ctx, change).await {
                Ok(Step::Applied) => {
                    completed.push(change.instance.clone());
                    run.report.applied.push(change.instance.clone());
                }
                Ok(Step::Deleted) => {
                    completed.push(change.instance.clone());
                    run.report.deleted.push(change.instance.clone());
                }
                Ok(Step::Unchanged) => run.report.unchanged.push(change.instance.clone()),
                Err(StepError::Provider(err)) => {
                    error!("{} failed: {:#}", change.address, err);
                    return Err(PartialApplyError {
                        completed,
                        failed: vec![InstanceFailure {
                            instance: change.instance.clone(),
                            error: err,
                        }],
                        not_attempted: plan.changes[i + 1..]
                            .iter()
                            .map(|c| c.instance.clone())
                            .collect(),
                    }
                    .into());
                }
                Err(StepError::Apply(err)) => return Err(err),
            }
        }

        let outputs = if plan.destroy {
            BTreeMap::new()
        } else {
            evaluate_outputs(ctx.config, ctx.variables, &run.outputs)?
        };
        run.state.set_outputs(outputs);
        self.commit(&mut run, "outputs")?;

        run.report.outputs = run.state.outputs.clone();
        run.report.serial = run.state.serial;
        info!(
            "Apply of workspace '{}' complete: {} applied, {} deleted, {} unchanged",
            plan.workspace,
            run.report.applied.len(),
            run.report.deleted.len(),
            run.report.unchanged.len()
        );
        Ok(run.report)
    }

    async fn step(
        &self,
        run: &mut Run<'_>,
        ctx: &ApplyContext<'_>,
        change: &PlannedChange,
    ) -> Result<Step, StepError> {
        match change.action {
            Action::NoOp => {
                if let Some(record) = run.state.get(&change.address) {
                    run.outputs
                        .insert(change.instance.clone(), record.outputs.clone());
                }
                self.refresh_dependencies(run, ctx, change)?;
                Ok(Step::Unchanged)
            }
            Action::Delete => {
                let Some(record) = run.state.get(&change.address).cloned() else {
                    debug!("{} already absent from state", change.address);
                    return Ok(Step::Unchanged);
                };
                let provider = self.provider(&record.kind)?;
                run.report.provider_calls += 1;
                provider
                    .destroy(&change.address, &record.attributes)
                    .await
                    .map_err(StepError::Provider)?;
                run.state.remove(&change.address);
                self.commit(run, &change.instance)?;
                info!("{}: destroyed", change.address);
                Ok(Step::Deleted)
            }
            Action::Create | Action::Update | Action::Replace => {
                self.reconcile(run, ctx, change).await
            }
        }
    }

    async fn reconcile(
        &self,
        run: &mut Run<'_>,
        ctx: &ApplyContext<'_>,
        change: &PlannedChange,
    ) -> Result<Step, StepError> {
        let instance = ctx
            .config
            .instance(&change.instance)
            .ok_or_else(|| ApplyError::from(PlanError::UnknownInstance(change.instance.clone())))?;
        let module = ctx
            .config
            .module_for(instance)
            .ok_or_else(|| ApplyError::from(PlanError::UnknownInstance(change.instance.clone())))?;

        // Upstream instances have run by now, so inputs are fully known
        let eval = EvalContext {
            variables: ctx.variables,
            outputs: &run.outputs,
        };
        let desired = match plan::desired_attributes(instance, module, &eval).map_err(ApplyError::from)? {
            Desired::Known(desired) => desired,
            Desired::Unknown(pending) => {
                return Err(StepError::Provider(anyhow::anyhow!(
                    "inputs still depend on unapplied instances: {}",
                    pending.into_iter().collect::<Vec<_>>().join(", ")
                )))
            }
        };

        let prior = run.state.get(&change.address).cloned();
        if let Some(record) = &prior {
            if record.kind == module.kind
                && plan::diff_attributes(&desired, &record.attributes).is_empty()
                && plan::has_declared_outputs(module, record)
            {
                debug!("{}: fresh inputs match state, skipping", change.address);
                run.outputs
                    .insert(change.instance.clone(), record.outputs.clone());
                self.refresh_dependencies(run, ctx, change)?;
                return Ok(Step::Unchanged);
            }
        }

        let replacing = prior.as_ref().filter(|r| r.kind != module.kind);
        if let Some(old) = replacing {
            let old_provider = self.provider(&old.kind)?;
            run.report.provider_calls += 1;
            old_provider
                .destroy(&change.address, &old.attributes)
                .await
                .map_err(StepError::Provider)?;
            run.state.remove(&change.address);
            self.commit(run, &change.instance)?;
            info!("{}: destroyed for replacement", change.address);
        }

        let provider = self.provider(&module.kind)?;
        let request = ReconcileRequest {
            address: change.address.clone(),
            kind: module.kind.clone(),
            desired,
            prior: prior
                .filter(|r| r.kind == module.kind)
                .map(|r| r.attributes),
        };
        run.report.provider_calls += 1;
        let actual = provider
            .reconcile(&request)
            .await
            .map_err(StepError::Provider)?;

        let mut outputs = Attributes::new();
        for name in &module.outputs {
            let value = actual.get(name).cloned().ok_or_else(|| {
                StepError::Provider(anyhow::anyhow!(
                    "provider for '{}' did not return declared output '{}'",
                    module.kind,
                    name
                ))
            })?;
            outputs.insert(name.clone(), value);
        }

        let record = ResourceRecord {
            instance: change.instance.clone(),
            module: instance.module.clone(),
            kind: module.kind.clone(),
            attributes: actual,
            outputs: outputs.clone(),
            dependencies: dependencies_of(ctx.graph, &change.instance),
            updated_at: Utc::now(),
        };
        run.state.commit(change.address.clone(), record);
        self.commit(run, &change.instance)?;
        run.outputs.insert(change.instance.clone(), outputs);
        info!("{}: {} complete", change.address, change.action);
        Ok(Step::Applied)
    }

    /// Keep recorded dependencies in line with the graph for instances the
    /// provider was not called for, so destroy ordering stays correct
    fn refresh_dependencies(
        &self,
        run: &mut Run<'_>,
        ctx: &ApplyContext<'_>,
        change: &PlannedChange,
    ) -> Result<(), ApplyError> {
        if !ctx.graph.contains(&change.instance) {
            return Ok(());
        }
        let dependencies = dependencies_of(ctx.graph, &change.instance);
        if run.state.set_dependencies(&change.address, dependencies) {
            self.commit(run, &change.instance)?;
            debug!("{}: recorded dependencies updated", change.address);
        }
        Ok(())
    }

    fn provider(&self, kind: &str) -> Result<Arc<dyn ResourceProvider>, StepError> {
        self.providers
            .get(kind)
            .ok_or_else(|| StepError::Provider(anyhow::anyhow!("no provider for kind '{}'", kind)))
    }

    fn commit(&self, run: &mut Run<'_>, instance: &str) -> Result<(), ApplyError> {
        if run.state.serial == run.saved_serial {
            return Ok(());
        }
        self.store
            .save(run.lock, &run.state)
            .map_err(|source| ApplyError::StateCommit {
                instance: instance.to_string(),
                source,
            })?;
        run.saved_serial = run.state.serial;
        Ok(())
    }
}

enum StepError {
    /// The instance itself failed; apply reports it as a partial failure
    Provider(anyhow::Error),
    Apply(ApplyError),
}

impl From<ApplyError> for StepError {
    fn from(err: ApplyError) -> Self {
        StepError::Apply(err)
    }
}

fn dependencies_of(graph: &ModuleGraph, instance: &str) -> Vec<String> {
    graph
        .dependencies(instance)
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Evaluate root outputs once every instance has known outputs
pub fn evaluate_outputs(
    config: &StackConfig,
    variables: &BTreeMap<String, Value>,
    outputs: &HashMap<String, Attributes>,
) -> Result<BTreeMap<String, Value>, PlanError> {
    let ctx = EvalContext { variables, outputs };
    let mut values = BTreeMap::new();
    for (name, expr) in &config.outputs {
        match expr::evaluate(expr, &ctx).map_err(|source| PlanError::Output {
            output: name.clone(),
            source,
        })? {
            Evaluated::Known(value) => {
                values.insert(name.clone(), value);
            }
            Evaluated::Unknown { .. } => return Err(PlanError::UnresolvedOutput(name.clone())),
        }
    }
    Ok(values)
}
