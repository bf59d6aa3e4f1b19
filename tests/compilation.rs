// Compilation tests to prevent regressions in core types and structures

#[cfg(test)]
mod compilation_tests {
    use std::sync::Arc;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_shared_types_are_thread_safe() {
        use tfstack::engine::provider::ProviderRegistry;
        use tfstack::state::store::WorkspaceStore;
        use tfstack::TfStack;

        assert_send_sync::<WorkspaceStore>();
        assert_send_sync::<ProviderRegistry>();
        assert_send_sync::<TfStack>();
    }

    #[test]
    fn test_backends_are_object_safe() {
        use tfstack::state::backend::{LocalBackend, MemoryBackend, StateBackend};

        let backends: Vec<Arc<dyn StateBackend>> = vec![
            Arc::new(MemoryBackend::new()),
            Arc::new(LocalBackend::new(std::env::temp_dir().join("tfstack-compilation"))),
        ];
        assert_eq!(backends.len(), 2);
    }

    #[test]
    fn test_error_kinds_are_reachable_from_stack_error() {
        use tfstack::engine::apply::{ApplyError, PartialApplyError};
        use tfstack::stack::graph::GraphError;
        use tfstack::stack::variables::VariableError;
        use tfstack::state::store::StateError;
        use tfstack::StackError;

        let errors: Vec<StackError> = vec![
            VariableError::MissingRequiredVariable {
                name: "region".to_string(),
            }
            .into(),
            GraphError::CyclicDependency {
                cycle: vec!["a".to_string(), "b".to_string(), "a".to_string()],
            }
            .into(),
            StateError::AlreadyExists("dev".to_string()).into(),
            StateError::NotFound("qa".to_string()).into(),
            ApplyError::from(PartialApplyError {
                completed: vec![],
                failed: vec![],
                not_attempted: vec![],
            })
            .into(),
        ];

        let rendered: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        assert!(rendered[0].contains("region"));
        assert!(rendered[1].contains("a -> b -> a"));
        assert!(rendered[2].contains("already exists"));
        assert!(rendered[3].contains("does not exist"));
    }

    #[test]
    fn test_config_defaults() {
        use tfstack::config::Config;

        let config = Config::default();
        assert_eq!(config.project.stack_file, "stack.json");
        assert_eq!(config.lock.retry_interval_ms, 250);
    }
}
