//! The boundary to whatever actually creates infrastructure.

use crate::stack::value::{Attributes, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// What the executor asks a provider to make true
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileRequest {
    pub address: String,
    pub kind: String,
    pub desired: Attributes,
    /// Attributes recorded by the previous reconciliation, if any
    pub prior: Option<Attributes>,
}

/// Reconciles one kind of resource. Implementations are opaque to the engine:
/// the returned attributes are recorded verbatim and must include the
/// module's declared outputs.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn reconcile(&self, request: &ReconcileRequest) -> anyhow::Result<Attributes>;

    async fn destroy(&self, address: &str, current: &Attributes) -> anyhow::Result<()>;
}

/// Providers by module kind
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ResourceProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the providers that ship with tfstack
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("null", Arc::new(NullProvider));
        registry.register("local_file", Arc::new(LocalFileProvider::default()));
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, provider: Arc<dyn ResourceProvider>) {
        self.providers.insert(kind.into(), provider);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn ResourceProvider>> {
        self.providers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.providers.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        kinds.sort();
        kinds
    }
}

/// Echoes desired attributes back, adding a stable `id`
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProvider;

#[async_trait]
impl ResourceProvider for NullProvider {
    async fn reconcile(&self, request: &ReconcileRequest) -> anyhow::Result<Attributes> {
        let id = request
            .prior
            .as_ref()
            .and_then(|prior| prior.get("id").cloned())
            .unwrap_or_else(|| Value::String(uuid::Uuid::new_v4().to_string()));

        let mut actual = request.desired.clone();
        actual.entry("id".to_string()).or_insert(id);
        debug!("null provider reconciled {}", request.address);
        Ok(actual)
    }

    async fn destroy(&self, address: &str, _current: &Attributes) -> anyhow::Result<()> {
        debug!("null provider destroyed {}", address);
        Ok(())
    }
}

/// Writes `content` to `filename`, relative paths resolved against `base_dir`
#[derive(Debug, Clone, Default)]
pub struct LocalFileProvider {
    pub base_dir: Option<PathBuf>,
}

impl LocalFileProvider {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn resolve(&self, filename: &str) -> PathBuf {
        let path = PathBuf::from(filename);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }
}

#[async_trait]
impl ResourceProvider for LocalFileProvider {
    async fn reconcile(&self, request: &ReconcileRequest) -> anyhow::Result<Attributes> {
        let filename = request
            .desired
            .get("filename")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("{}: 'filename' must be a string", request.address))?;
        let content = request
            .desired
            .get("content")
            .and_then(Value::render_scalar)
            .unwrap_or_default();

        let path = self.resolve(filename);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // A rename leaves the previous file behind otherwise
        if let Some(old) = request
            .prior
            .as_ref()
            .and_then(|prior| prior.get("filename"))
            .and_then(Value::as_str)
        {
            if old != filename {
                let old_path = self.resolve(old);
                if tokio::fs::try_exists(&old_path).await.unwrap_or(false) {
                    tokio::fs::remove_file(&old_path).await?;
                }
            }
        }

        tokio::fs::write(&path, content.as_bytes()).await?;
        debug!("Wrote {} bytes to {}", content.len(), path.display());

        let mut actual = request.desired.clone();
        actual.insert("id".to_string(), Value::String(path.display().to_string()));
        actual.insert("size".to_string(), Value::Number(content.len() as f64));
        Ok(actual)
    }

    async fn destroy(&self, address: &str, current: &Attributes) -> anyhow::Result<()> {
        let Some(filename) = current.get("filename").and_then(Value::as_str) else {
            return Ok(());
        };
        let path = self.resolve(filename);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("{}: removed {}", address, path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(desired: Attributes, prior: Option<Attributes>) -> ReconcileRequest {
        ReconcileRequest {
            address: "module.test".to_string(),
            kind: "null".to_string(),
            desired,
            prior,
        }
    }

    #[tokio::test]
    async fn test_null_provider_keeps_id() {
        let provider = NullProvider;
        let desired = Attributes::from([("name".to_string(), Value::from("vpc"))]);
        let first = provider.reconcile(&request(desired.clone(), None)).await.unwrap();
        let second = provider
            .reconcile(&request(desired, Some(first.clone())))
            .await
            .unwrap();
        assert_eq!(first.get("id"), second.get("id"));
        assert_eq!(second.get("name"), Some(&Value::from("vpc")));
    }

    #[tokio::test]
    async fn test_local_file_provider() {
        let dir = TempDir::new().unwrap();
        let provider = LocalFileProvider::new(dir.path());
        let desired = Attributes::from([
            ("filename".to_string(), Value::from("out/hello.txt")),
            ("content".to_string(), Value::from("hello")),
        ]);

        let actual = provider.reconcile(&request(desired, None)).await.unwrap();
        assert_eq!(actual.get("size"), Some(&Value::Number(5.0)));
        let path = dir.path().join("out/hello.txt");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");

        provider.destroy("module.test", &actual).await.unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_registry_builtins() {
        let registry = ProviderRegistry::with_builtins();
        assert_eq!(registry.kinds(), vec!["local_file", "null"]);
        assert!(registry.get("network").is_none());
    }
}
