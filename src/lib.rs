// Re-export modules for testing and external use
pub mod stack {
    pub mod expr;
    pub mod graph;
    pub mod loader;
    pub mod model;
    pub mod value;
    pub mod variables;

    pub use graph::{GraphError, ModuleGraph};
    pub use model::StackConfig;
    pub use value::{Value, VarType};
    pub use variables::{SourceKind, VariableError, VariableSet, VariableSource};
}

pub mod state {
    pub mod backend;
    pub mod model;
    pub mod store;

    pub use backend::{LocalBackend, LockInfo, MemoryBackend, StateBackend};
    pub use model::{ResourceRecord, State};
    pub use store::{StateError, StateLock, WorkspaceStore, DEFAULT_WORKSPACE};
}

pub mod engine {
    pub mod apply;
    pub mod plan;
    pub mod provider;

    pub use apply::{ApplyError, ApplyReport, CancelToken, Executor, PartialApplyError};
    pub use plan::{Action, Plan, PlanError};
    pub use provider::{ProviderRegistry, ReconcileRequest, ResourceProvider};
}

pub mod formatters {
    pub mod output;

    pub use output::OutputFormatter;
}

pub mod shared {
    pub mod logging;
}

pub mod core {
    pub mod stack;
}

pub mod config;

// Re-export commonly used types for easier testing and external use
pub use core::stack::{ApplyOutcome, StackError, TfStack, VarRequest};
