use crate::config::{self, BackendKind, Config};
use crate::engine::apply::{ApplyContext, ApplyError, ApplyReport, CancelToken, Executor};
use crate::engine::plan::{self, Plan, PlanError};
use crate::engine::provider::{LocalFileProvider, ProviderRegistry};
use crate::stack::graph::{GraphError, ModuleGraph};
use crate::stack::loader::{self, ConfigError};
use crate::stack::model::{instance_address, StackConfig};
use crate::stack::value::Value;
use crate::stack::variables::{self, VariableError, VariableSet, VariableSource};
use crate::state::backend::{LocalBackend, LockInfo, MemoryBackend, StateBackend};
use crate::state::model::ResourceRecord;
use crate::state::store::{StateError, WorkspaceStore, DEFAULT_WORKSPACE};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// File under the data directory naming the selected workspace
const ENVIRONMENT_FILE: &str = "environment";

#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Variable(#[from] VariableError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("No resource '{address}' in workspace '{workspace}'")]
    ResourceNotFound { workspace: String, address: String },

    #[error("Workspace '{0}' is currently selected. Select another workspace before deleting it")]
    CurrentWorkspace(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Variable overrides given for one operation
#[derive(Debug, Clone, Default)]
pub struct VarRequest {
    /// Override files in the order given; later files win
    pub var_files: Vec<PathBuf>,
    /// `name=value` pairs from `-var`
    pub vars: Vec<String>,
}

#[derive(Debug)]
pub enum ApplyOutcome {
    /// The caller declined the plan; nothing was changed
    Declined(Plan),
    Applied { plan: Plan, report: ApplyReport },
}

/// Configuration-time inputs, resolved before the lock is taken
struct Prepared {
    stack: StackConfig,
    graph: ModuleGraph,
    variables: VariableSet,
}

pub struct TfStack {
    config: Config,
    project_directory: PathBuf,
    store: WorkspaceStore,
    providers: ProviderRegistry,
}

impl TfStack {
    pub fn new(config_path: Option<String>, project_dir: Option<String>) -> anyhow::Result<Self> {
        let env_dir = std::env::var("TFSTACK_DIR").ok();
        if let Some(dir) = &env_dir {
            info!("Found TFSTACK_DIR environment variable: {}", dir);
        }

        let config = match config_path {
            Some(path) => {
                let path_buf = PathBuf::from(&path);
                if path_buf.is_absolute() {
                    config::init_from_path(&path)?
                } else {
                    let abs_path = std::env::current_dir()?.join(&path);
                    debug!("Resolved config path to {}", abs_path.display());
                    config::init_from_path(&abs_path.to_string_lossy())?
                }
            }
            None => {
                let search_dir = project_dir.clone().or_else(|| env_dir.clone());
                config::init_default(search_dir.as_deref().map(Path::new))?
            }
        };

        // Priority for project directory:
        // 1. Command line argument
        // 2. Environment variable
        // 3. Config file
        // 4. Current directory
        let project_directory = match project_dir
            .or(env_dir)
            .or_else(|| config.project.project_directory.clone())
        {
            Some(dir) => {
                let dir = PathBuf::from(dir);
                if dir.is_absolute() {
                    dir
                } else {
                    std::env::current_dir()?.join(dir)
                }
            }
            None => std::env::current_dir()?,
        };
        info!("Using project directory: {}", project_directory.display());

        let backend: Arc<dyn StateBackend> = match config.state.backend {
            BackendKind::Local => {
                let root = config.state_dir(&project_directory);
                debug!("Local state backend at {}", root.display());
                Arc::new(LocalBackend::new(root))
            }
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
        };
        let store = WorkspaceStore::new(backend).with_retry_interval(config.lock.retry_interval());

        let mut providers = ProviderRegistry::with_builtins();
        providers.register(
            "local_file",
            Arc::new(LocalFileProvider::new(&project_directory)),
        );

        Ok(Self::with_parts(config, project_directory, store, providers))
    }

    /// Assemble from explicit parts, e.g. a memory-backed store and custom providers
    pub fn with_parts(
        config: Config,
        project_directory: PathBuf,
        store: WorkspaceStore,
        providers: ProviderRegistry,
    ) -> Self {
        Self {
            config,
            project_directory,
            store,
            providers,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn project_directory(&self) -> &Path {
        &self.project_directory
    }

    pub fn store(&self) -> &WorkspaceStore {
        &self.store
    }

    fn data_dir(&self) -> PathBuf {
        self.config.data_dir(&self.project_directory)
    }

    /// Prepare the data directory and make sure the default workspace exists
    pub fn init(&self) -> Result<(), StackError> {
        std::fs::create_dir_all(self.data_dir()).map_err(StateError::from)?;
        match self.store.create(DEFAULT_WORKSPACE) {
            Ok(_) | Err(StateError::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
        info!(
            "Initialized tfstack in {}",
            self.project_directory.display()
        );
        Ok(())
    }

    pub fn workspace_new(&self, name: &str) -> Result<(), StackError> {
        self.store.create(name)?;
        Ok(())
    }

    /// Make `name` the workspace used when none is given explicitly
    pub fn workspace_select(&self, name: &str) -> Result<(), StackError> {
        self.store.select(name)?;
        let data_dir = self.data_dir();
        std::fs::create_dir_all(&data_dir).map_err(StateError::from)?;
        std::fs::write(data_dir.join(ENVIRONMENT_FILE), name).map_err(StateError::from)?;
        info!("Switched to workspace '{}'", name);
        Ok(())
    }

    /// Selected workspace, or `default` when nothing was selected
    pub fn current_workspace(&self) -> String {
        std::fs::read_to_string(self.data_dir().join(ENVIRONMENT_FILE))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_WORKSPACE.to_string())
    }

    pub fn workspace_list(&self) -> Result<Vec<String>, StackError> {
        Ok(self.store.list()?.into_iter().map(|w| w.name).collect())
    }

    pub fn workspace_delete(&self, name: &str, force: bool) -> Result<(), StackError> {
        if name == self.current_workspace() && name != DEFAULT_WORKSPACE {
            return Err(StackError::CurrentWorkspace(name.to_string()));
        }
        self.store.delete(name, force)?;
        Ok(())
    }

    pub fn load_stack(&self) -> Result<StackConfig, StackError> {
        Ok(loader::load_stack(
            &self.config.stack_path(&self.project_directory),
        )?)
    }

    /// Environment, then files, then `-var` flags
    pub fn variable_sources(&self, request: &VarRequest) -> Result<Vec<VariableSource>, StackError> {
        let mut sources = vec![loader::environment_source(std::env::vars())];
        for file in &request.var_files {
            let path = if file.is_absolute() {
                file.clone()
            } else {
                self.project_directory.join(file)
            };
            sources.push(loader::load_var_file(&path)?);
        }
        sources.push(loader::cli_source(&request.vars)?);
        Ok(sources)
    }

    fn prepare(&self, request: &VarRequest) -> Result<Prepared, StackError> {
        let stack = self.load_stack()?;
        let sources = self.variable_sources(request)?;
        let variables = variables::resolve(&stack.variables, &sources)?;
        let graph = ModuleGraph::from_config(&stack)?;
        plan::check_providers(&stack, &self.providers)?;
        Ok(Prepared {
            stack,
            graph,
            variables,
        })
    }

    /// Compute the plan for `workspace` without changing anything
    pub async fn plan(&self, workspace: &str, request: &VarRequest) -> Result<Plan, StackError> {
        let prepared = self.prepare(request)?;
        let lock = self
            .store
            .acquire_lock(workspace, self.config.lock.timeout(), "plan")
            .await?;
        let state = self.store.load(workspace)?;
        let plan = plan::compute(
            workspace,
            &prepared.stack,
            &prepared.graph,
            prepared.variables.values(),
            &state,
        )?;
        lock.release()?;
        Ok(plan)
    }

    /// Plan, ask `confirm` when there are changes, then apply under one lock
    pub async fn apply<F>(
        &self,
        workspace: &str,
        request: &VarRequest,
        confirm: F,
        cancel: CancelToken,
    ) -> Result<ApplyOutcome, StackError>
    where
        F: FnOnce(&Plan) -> bool,
    {
        let prepared = self.prepare(request)?;
        let lock = self
            .store
            .acquire_lock(workspace, self.config.lock.timeout(), "apply")
            .await?;
        let state = self.store.load(workspace)?;
        let plan = plan::compute(
            workspace,
            &prepared.stack,
            &prepared.graph,
            prepared.variables.values(),
            &state,
        )?;

        if plan.has_changes() && !confirm(&plan) {
            info!("Apply of workspace '{}' declined", workspace);
            return Ok(ApplyOutcome::Declined(plan));
        }

        let ctx = ApplyContext {
            config: &prepared.stack,
            graph: &prepared.graph,
            variables: prepared.variables.values(),
        };
        let report = Executor::new(&self.store, &self.providers)
            .with_cancel(cancel)
            .apply(&lock, &ctx, state, &plan)
            .await?;
        lock.release()?;
        Ok(ApplyOutcome::Applied { plan, report })
    }

    /// Destroy everything `workspace` records, dependents first
    pub async fn destroy<F>(
        &self,
        workspace: &str,
        confirm: F,
        cancel: CancelToken,
    ) -> Result<ApplyOutcome, StackError>
    where
        F: FnOnce(&Plan) -> bool,
    {
        let lock = self
            .store
            .acquire_lock(workspace, self.config.lock.timeout(), "destroy")
            .await?;
        let state = self.store.load(workspace)?;
        let plan = plan::compute_destroy(workspace, &state)?;

        if plan.has_changes() && !confirm(&plan) {
            info!("Destroy of workspace '{}' declined", workspace);
            return Ok(ApplyOutcome::Declined(plan));
        }

        // Deletions work from state alone
        let stack = StackConfig::default();
        let graph = ModuleGraph::build(Vec::new())?;
        let variables = BTreeMap::new();
        let ctx = ApplyContext {
            config: &stack,
            graph: &graph,
            variables: &variables,
        };
        let report = Executor::new(&self.store, &self.providers)
            .with_cancel(cancel)
            .apply(&lock, &ctx, state, &plan)
            .await?;
        lock.release()?;
        Ok(ApplyOutcome::Applied { plan, report })
    }

    /// Root outputs recorded by the last apply
    pub fn outputs(&self, workspace: &str) -> Result<BTreeMap<String, Value>, StackError> {
        Ok(self.store.load(workspace)?.outputs)
    }

    pub fn state_list(&self, workspace: &str) -> Result<Vec<String>, StackError> {
        let state = self.store.load(workspace)?;
        Ok(state.addresses().into_iter().map(str::to_string).collect())
    }

    /// Record for `address`, given either as `module.<name>` or just `<name>`
    pub fn state_show(
        &self,
        workspace: &str,
        address: &str,
    ) -> Result<(String, ResourceRecord), StackError> {
        let state = self.store.load(workspace)?;
        let address = if address.starts_with("module.") {
            address.to_string()
        } else {
            instance_address(address)
        };
        match state.get(&address) {
            Some(record) => Ok((address, record.clone())),
            None => Err(StackError::ResourceNotFound {
                workspace: workspace.to_string(),
                address,
            }),
        }
    }

    /// Dependency graph of the current configuration in DOT format
    pub fn graph_dot(&self) -> Result<String, StackError> {
        let stack = self.load_stack()?;
        Ok(ModuleGraph::from_config(&stack)?.to_dot())
    }

    pub fn force_unlock(&self, workspace: &str, lock_id: &str) -> Result<LockInfo, StackError> {
        Ok(self.store.force_unlock(workspace, lock_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn project() -> (TempDir, TfStack) {
        let dir = TempDir::new().unwrap();
        let stack = json!({
            "variables": {
                "env": { "type": "string" },
                "replicas": { "type": "number", "default": 1 }
            },
            "modules": {
                "app": {
                    "kind": "null",
                    "inputs": { "name": {}, "replicas": { "default": 1 } },
                    "outputs": ["id"]
                }
            },
            "instances": [
                { "name": "web", "module": "app", "inputs": { "name": "web-${var.env}", "replicas": "${var.replicas}" } }
            ],
            "outputs": { "web_id": "${module.web.id}" }
        });
        std::fs::write(dir.path().join("stack.json"), stack.to_string()).unwrap();

        let mut config = Config::default();
        config.lock.timeout_secs = 0;
        let store = WorkspaceStore::new(Arc::new(MemoryBackend::new()));
        let tf = TfStack::with_parts(
            config,
            dir.path().to_path_buf(),
            store,
            ProviderRegistry::with_builtins(),
        );
        tf.init().unwrap();
        (dir, tf)
    }

    fn vars(pairs: &[&str]) -> VarRequest {
        VarRequest {
            var_files: vec![],
            vars: pairs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_workspace_selection() {
        let (_dir, tf) = project();
        assert_eq!(tf.current_workspace(), DEFAULT_WORKSPACE);

        tf.workspace_new("dev").unwrap();
        tf.workspace_select("dev").unwrap();
        assert_eq!(tf.current_workspace(), "dev");
        assert!(matches!(
            tf.workspace_delete("dev", false),
            Err(StackError::CurrentWorkspace(_))
        ));
        assert!(matches!(
            tf.workspace_select("missing"),
            Err(StackError::State(StateError::NotFound(_)))
        ));
        assert_eq!(tf.workspace_list().unwrap(), vec!["default", "dev"]);
    }

    #[tokio::test]
    async fn test_missing_variable_aborts_before_lock() {
        let (_dir, tf) = project();
        let err = tf.plan(DEFAULT_WORKSPACE, &VarRequest::default()).await.unwrap_err();
        assert!(matches!(
            err,
            StackError::Variable(VariableError::MissingRequiredVariable { ref name }) if name == "env"
        ));
        assert_eq!(tf.store().lock_info(DEFAULT_WORKSPACE).unwrap(), None);
    }

    #[tokio::test]
    async fn test_apply_outputs_and_destroy() {
        let (_dir, tf) = project();
        let request = vars(&["env=dev", "replicas=3"]);

        let outcome = tf
            .apply(DEFAULT_WORKSPACE, &request, |_| true, CancelToken::new())
            .await
            .unwrap();
        let ApplyOutcome::Applied { report, .. } = outcome else {
            panic!("apply was declined");
        };
        assert_eq!(report.applied, vec!["web"]);

        let (address, record) = tf.state_show(DEFAULT_WORKSPACE, "web").unwrap();
        assert_eq!(address, "module.web");
        assert_eq!(record.attributes.get("name"), Some(&Value::from("web-dev")));
        assert_eq!(record.attributes.get("replicas"), Some(&Value::Number(3.0)));
        assert_eq!(
            tf.outputs(DEFAULT_WORKSPACE).unwrap().get("web_id"),
            record.outputs.get("id")
        );

        let plan = tf.plan(DEFAULT_WORKSPACE, &request).await.unwrap();
        assert!(!plan.has_changes());

        let declined = tf
            .destroy(DEFAULT_WORKSPACE, |_| false, CancelToken::new())
            .await
            .unwrap();
        assert!(matches!(declined, ApplyOutcome::Declined(_)));
        assert_eq!(tf.state_list(DEFAULT_WORKSPACE).unwrap(), vec!["module.web"]);

        tf.destroy(DEFAULT_WORKSPACE, |_| true, CancelToken::new())
            .await
            .unwrap();
        assert!(tf.state_list(DEFAULT_WORKSPACE).unwrap().is_empty());
        assert!(tf.outputs(DEFAULT_WORKSPACE).unwrap().is_empty());
        assert!(matches!(
            tf.state_show(DEFAULT_WORKSPACE, "web"),
            Err(StackError::ResourceNotFound { .. })
        ));
    }

    #[test]
    fn test_graph_dot() {
        let (_dir, tf) = project();
        assert!(tf.graph_dot().unwrap().contains("\"module.web\""));
    }
}
