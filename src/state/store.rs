//! Workspace management and locked access to per-workspace state.

use crate::state::backend::{LockInfo, StateBackend};
use crate::state::model::State;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Workspace that always exists after `init` and cannot be deleted
pub const DEFAULT_WORKSPACE: &str = "default";

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Workspace '{0}' does not exist")]
    NotFound(String),

    #[error("Workspace '{0}' already exists")]
    AlreadyExists(String),

    #[error("Invalid workspace name: '{0}'. Names must be alphanumeric with hyphens or underscores")]
    InvalidWorkspaceName(String),

    #[error("Cannot delete the '{0}' workspace")]
    ProtectedWorkspace(String),

    #[error("Workspace '{0}' is not empty. Destroy its resources first or delete with force")]
    NotEmpty(String),

    #[error("Timed out after {waited:?} waiting for workspace '{workspace}': {holder}")]
    LockTimeout {
        workspace: String,
        holder: Box<LockInfo>,
        waited: Duration,
    },

    #[error("Workspace '{workspace}' is locked: {holder}")]
    Locked {
        workspace: String,
        holder: Box<LockInfo>,
    },

    #[error("Workspace '{0}' is not locked")]
    NotLocked(String),

    #[error("Lock {lock_id} is no longer held on workspace '{workspace}'")]
    LockNotHeld { workspace: String, lock_id: String },

    #[error("Lock id mismatch on workspace '{workspace}': given {expected}, held by {actual}")]
    LockMismatch {
        workspace: String,
        expected: String,
        actual: String,
    },

    #[error("State lineage mismatch on workspace '{workspace}': persisted {persisted}, supplied {supplied}")]
    LineageMismatch {
        workspace: String,
        persisted: String,
        supplied: String,
    },

    #[error("Refusing to overwrite serial {persisted} of workspace '{workspace}' with older serial {supplied}")]
    StaleSerial {
        workspace: String,
        persisted: u64,
        supplied: u64,
    },

    #[error("Corrupt state for workspace '{workspace}': {source}")]
    Corrupt {
        workspace: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State backend error: {0}")]
    Backend(String),
}

/// A named, isolated deployment context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub name: String,
}

/// Exclusive hold on one workspace's state.
///
/// Released by `release` or when dropped, so every exit path of the
/// operation that acquired it gives the lock back.
pub struct StateLock {
    backend: Arc<dyn StateBackend>,
    workspace: String,
    info: LockInfo,
    released: bool,
}

impl StateLock {
    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn release(mut self) -> Result<(), StateError> {
        self.released = true;
        self.backend.unlock(&self.workspace, &self.info.id)?;
        debug!("Released lock {} on workspace '{}'", self.info.id, self.workspace);
        Ok(())
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.backend.unlock(&self.workspace, &self.info.id) {
            Ok(()) => debug!(
                "Released lock {} on workspace '{}'",
                self.info.id, self.workspace
            ),
            Err(e) => warn!(
                "Failed to release lock {} on workspace '{}': {}",
                self.info.id, self.workspace, e
            ),
        }
    }
}

impl std::fmt::Debug for StateLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateLock")
            .field("workspace", &self.workspace)
            .field("lock_id", &self.info.id)
            .field("operation", &self.info.operation)
            .finish()
    }
}

/// Workspace-scoped state access over a backend
#[derive(Clone)]
pub struct WorkspaceStore {
    backend: Arc<dyn StateBackend>,
    retry_interval: Duration,
}

impl WorkspaceStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self {
            backend,
            retry_interval: Duration::from_millis(250),
        }
    }

    /// Interval between lock attempts while waiting
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    /// Look up an existing workspace. Every state and lock operation goes through here.
    pub fn select(&self, workspace: &str) -> Result<Workspace, StateError> {
        if !is_valid_workspace_name(workspace) {
            return Err(StateError::InvalidWorkspaceName(workspace.to_string()));
        }
        if !self.backend.exists(workspace)? {
            return Err(StateError::NotFound(workspace.to_string()));
        }
        Ok(Workspace {
            name: workspace.to_string(),
        })
    }

    pub fn create(&self, workspace: &str) -> Result<Workspace, StateError> {
        if !is_valid_workspace_name(workspace) {
            return Err(StateError::InvalidWorkspaceName(workspace.to_string()));
        }
        self.backend.create(workspace)?;
        info!("Created workspace '{}'", workspace);
        Ok(Workspace {
            name: workspace.to_string(),
        })
    }

    pub fn list(&self) -> Result<Vec<Workspace>, StateError> {
        Ok(self
            .backend
            .list()?
            .into_iter()
            .map(|name| Workspace { name })
            .collect())
    }

    /// Delete a workspace. A workspace that still records resources needs `force`.
    /// The workspace lock is held from the emptiness check through removal.
    pub fn delete(&self, workspace: &str, force: bool) -> Result<(), StateError> {
        if workspace == DEFAULT_WORKSPACE {
            return Err(StateError::ProtectedWorkspace(workspace.to_string()));
        }
        self.select(workspace)?;

        let lock = match self.try_acquire(workspace, LockInfo::new("delete"))? {
            Ok(lock) => lock,
            Err(holder) => {
                return Err(StateError::Locked {
                    workspace: workspace.to_string(),
                    holder: Box::new(holder),
                })
            }
        };

        let state = self.load(workspace)?;
        if !state.is_empty() && !force {
            return Err(StateError::NotEmpty(workspace.to_string()));
        }
        if !state.is_empty() {
            warn!(
                "Deleting workspace '{}' with {} recorded resources",
                workspace,
                state.resources.len()
            );
        }

        self.backend.delete(workspace)?;
        lock.release()?;
        info!("Deleted workspace '{}'", workspace);
        Ok(())
    }

    /// Persisted state, or an empty state if nothing was saved yet
    pub fn load(&self, workspace: &str) -> Result<State, StateError> {
        self.select(workspace)?;
        match self.backend.read(workspace)? {
            None => Ok(State::default()),
            Some(blob) => serde_json::from_slice(&blob).map_err(|source| StateError::Corrupt {
                workspace: workspace.to_string(),
                source,
            }),
        }
    }

    /// Persist state. Only the active holder of the workspace lock may save.
    pub fn save(&self, lock: &StateLock, state: &State) -> Result<(), StateError> {
        let workspace = lock.workspace();
        let holder = self.backend.lock_info(workspace)?;
        if holder.as_ref().map(|h| h.id.as_str()) != Some(lock.info().id.as_str()) {
            return Err(StateError::LockNotHeld {
                workspace: workspace.to_string(),
                lock_id: lock.info().id.clone(),
            });
        }

        if let Some(blob) = self.backend.read(workspace)? {
            let persisted: State =
                serde_json::from_slice(&blob).map_err(|source| StateError::Corrupt {
                    workspace: workspace.to_string(),
                    source,
                })?;
            if !persisted.lineage.is_empty() && persisted.lineage != state.lineage {
                return Err(StateError::LineageMismatch {
                    workspace: workspace.to_string(),
                    persisted: persisted.lineage,
                    supplied: state.lineage.clone(),
                });
            }
            if persisted.serial > state.serial {
                return Err(StateError::StaleSerial {
                    workspace: workspace.to_string(),
                    persisted: persisted.serial,
                    supplied: state.serial,
                });
            }
        }

        let blob =
            serde_json::to_vec_pretty(state).map_err(|e| StateError::Backend(e.to_string()))?;
        self.backend.write(workspace, &blob)?;
        debug!(
            "Saved state of workspace '{}' at serial {}",
            workspace, state.serial
        );
        Ok(())
    }

    /// Acquire the workspace lock, retrying until `timeout` elapses.
    /// A zero timeout makes a single attempt.
    pub async fn acquire_lock(
        &self,
        workspace: &str,
        timeout: Duration,
        operation: &str,
    ) -> Result<StateLock, StateError> {
        self.select(workspace)?;
        let info = LockInfo::new(operation);
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            match self.try_acquire(workspace, info.clone())? {
                Ok(lock) => {
                    debug!(
                        "Acquired lock {} on workspace '{}' for {}",
                        lock.info.id, workspace, operation
                    );
                    return Ok(lock);
                }
                Err(holder) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(StateError::LockTimeout {
                            workspace: workspace.to_string(),
                            holder: Box::new(holder),
                            waited: now - started,
                        });
                    }
                    debug!("Workspace '{}' is locked ({}), waiting", workspace, holder);
                    tokio::time::sleep(self.retry_interval.min(deadline - now)).await;
                }
            }
        }
    }

    /// One lock attempt: the guard, or the current holder
    fn try_acquire(
        &self,
        workspace: &str,
        info: LockInfo,
    ) -> Result<Result<StateLock, LockInfo>, StateError> {
        Ok(match self.backend.try_lock(workspace, &info)? {
            None => Ok(StateLock {
                backend: Arc::clone(&self.backend),
                workspace: workspace.to_string(),
                info,
                released: false,
            }),
            Some(holder) => Err(holder),
        })
    }

    /// Remove a lock left behind by a crashed holder
    pub fn force_unlock(&self, workspace: &str, lock_id: &str) -> Result<LockInfo, StateError> {
        self.select(workspace)?;
        let holder = self
            .backend
            .lock_info(workspace)?
            .ok_or_else(|| StateError::NotLocked(workspace.to_string()))?;
        self.backend.unlock(workspace, lock_id)?;
        warn!("Force-unlocked workspace '{}' ({})", workspace, holder);
        Ok(holder)
    }

    pub fn lock_info(&self, workspace: &str) -> Result<Option<LockInfo>, StateError> {
        self.select(workspace)?;
        self.backend.lock_info(workspace)
    }
}

/// Validate workspace name
pub fn is_valid_workspace_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 100 {
        return false;
    }

    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::backend::{LocalBackend, MemoryBackend, LOCK_FILE, STATE_FILE};

    fn store() -> WorkspaceStore {
        WorkspaceStore::new(Arc::new(MemoryBackend::new()))
            .with_retry_interval(Duration::from_millis(5))
    }

    #[test]
    fn test_valid_workspace_name() {
        assert!(is_valid_workspace_name("dev"));
        assert!(is_valid_workspace_name("prod-us-east-1"));
        assert!(is_valid_workspace_name("staging_v2"));
        assert!(!is_valid_workspace_name(""));
        assert!(!is_valid_workspace_name("name with spaces"));
        assert!(!is_valid_workspace_name("name/slash"));
        assert!(!is_valid_workspace_name(".."));
    }

    #[test]
    fn test_create_select_list() {
        let store = store();
        assert!(matches!(store.select("dev"), Err(StateError::NotFound(_))));
        store.create("dev").unwrap();
        assert!(matches!(
            store.create("dev"),
            Err(StateError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.create("../etc"),
            Err(StateError::InvalidWorkspaceName(_))
        ));
        assert_eq!(store.select("dev").unwrap().name, "dev");
        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(store.load("dev").unwrap(), State::default());
    }

    #[tokio::test]
    async fn test_invalid_names_rejected_on_every_entry_point() {
        let store = store();
        for name in ["..", "", ".", "a/b"] {
            assert!(matches!(store.select(name), Err(StateError::InvalidWorkspaceName(_))));
            assert!(matches!(store.load(name), Err(StateError::InvalidWorkspaceName(_))));
            assert!(matches!(
                store.acquire_lock(name, Duration::ZERO, "apply").await,
                Err(StateError::InvalidWorkspaceName(_))
            ));
            assert!(matches!(
                store.force_unlock(name, "id"),
                Err(StateError::InvalidWorkspaceName(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_parent_directory_is_not_a_workspace() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().join("state");
        let store = WorkspaceStore::new(Arc::new(LocalBackend::new(&root)));
        store.create(DEFAULT_WORKSPACE).unwrap();

        assert!(matches!(store.select(".."), Err(StateError::InvalidWorkspaceName(_))));
        assert!(matches!(
            store.acquire_lock("..", Duration::ZERO, "apply").await,
            Err(StateError::InvalidWorkspaceName(_))
        ));
        assert!(!dir.path().join(STATE_FILE).exists());
        assert!(!dir.path().join(LOCK_FILE).exists());
        assert_eq!(store.list().unwrap(), vec![Workspace { name: DEFAULT_WORKSPACE.to_string() }]);
    }

    #[tokio::test]
    async fn test_lock_timeout_and_release_on_drop() {
        let store = store();
        store.create("dev").unwrap();

        let lock = store
            .acquire_lock("dev", Duration::ZERO, "apply")
            .await
            .unwrap();
        let err = store
            .acquire_lock("dev", Duration::from_millis(20), "plan")
            .await
            .unwrap_err();
        match err {
            StateError::LockTimeout { holder, .. } => assert_eq!(holder.operation, "apply"),
            other => panic!("unexpected error {:?}", other),
        }

        drop(lock);
        let again = store
            .acquire_lock("dev", Duration::ZERO, "plan")
            .await
            .unwrap();
        again.release().unwrap();
        assert_eq!(store.lock_info("dev").unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_requires_active_lock() {
        let store = store();
        store.create("dev").unwrap();

        let lock = store
            .acquire_lock("dev", Duration::ZERO, "apply")
            .await
            .unwrap();
        let lock_id = lock.info().id.clone();
        store.force_unlock("dev", &lock_id).unwrap();

        assert!(matches!(
            store.save(&lock, &State::default()),
            Err(StateError::LockNotHeld { .. })
        ));
    }

    #[tokio::test]
    async fn test_save_rejects_stale_serial_and_foreign_lineage() {
        let store = store();
        store.create("dev").unwrap();
        let lock = store
            .acquire_lock("dev", Duration::ZERO, "apply")
            .await
            .unwrap();

        let mut state = store.load("dev").unwrap();
        state.set_outputs([("a".to_string(), crate::stack::value::Value::from("1"))].into());
        store.save(&lock, &state).unwrap();

        let mut older = state.clone();
        older.serial = 0;
        assert!(matches!(
            store.save(&lock, &older),
            Err(StateError::StaleSerial { .. })
        ));

        let mut foreign = state.clone();
        foreign.lineage = "other".to_string();
        assert!(matches!(
            store.save(&lock, &foreign),
            Err(StateError::LineageMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let store = store();
        store.create(DEFAULT_WORKSPACE).unwrap();
        store.create("dev").unwrap();
        assert!(matches!(
            store.delete(DEFAULT_WORKSPACE, true),
            Err(StateError::ProtectedWorkspace(_))
        ));

        let lock = store
            .acquire_lock("dev", Duration::ZERO, "apply")
            .await
            .unwrap();
        assert!(matches!(
            store.delete("dev", false),
            Err(StateError::Locked { .. })
        ));
        drop(lock);

        store.delete("dev", false).unwrap();
        assert!(matches!(
            store.delete("dev", false),
            Err(StateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_holds_lock_and_refuses_non_empty() {
        let store = store();
        store.create("dev").unwrap();
        let lock = store
            .acquire_lock("dev", Duration::ZERO, "apply")
            .await
            .unwrap();
        let mut state = store.load("dev").unwrap();
        state.set_outputs([("a".to_string(), crate::stack::value::Value::from("1"))].into());
        state.commit(
            "module.a".to_string(),
            crate::state::model::ResourceRecord {
                instance: "a".to_string(),
                module: "m".to_string(),
                kind: "null".to_string(),
                attributes: Default::default(),
                outputs: Default::default(),
                dependencies: vec![],
                updated_at: chrono::Utc::now(),
            },
        );
        store.save(&lock, &state).unwrap();
        drop(lock);

        assert!(matches!(store.delete("dev", false), Err(StateError::NotEmpty(_))));
        // The refused delete gave its lock back
        assert_eq!(store.lock_info("dev").unwrap(), None);

        store.delete("dev", true).unwrap();
        assert!(!store.backend().exists("dev").unwrap());
    }

    #[test]
    fn test_delete_on_disk_releases_lock_inside_removed_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().join("state");
        let store = WorkspaceStore::new(Arc::new(LocalBackend::new(&root)));
        store.create("dev").unwrap();

        store.delete("dev", false).unwrap();
        assert!(!root.join("dev").exists());
        store.create("dev").unwrap();
        assert_eq!(store.lock_info("dev").unwrap(), None);
    }
}
