//! Storage for per-workspace state blobs and their locks.

use crate::state::store::{is_valid_workspace_name, StateError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// File name of the state blob inside a workspace directory
pub const STATE_FILE: &str = "terraform.tfstate.json";
/// File name of the lock blob inside a workspace directory
pub const LOCK_FILE: &str = ".lock.json";

/// Who holds a workspace lock, and for what
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub id: String,
    pub operation: String,
    pub who: String,
    pub created: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(operation: &str) -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation: operation.to_string(),
            who: format!("{}@pid-{}", user, std::process::id()),
            created: Utc::now(),
        }
    }

    /// Placeholder for a lock blob that exists but cannot be read yet
    fn unreadable() -> Self {
        Self {
            id: String::new(),
            operation: "unknown".to_string(),
            who: "unknown".to_string(),
            created: Utc::now(),
        }
    }
}

impl std::fmt::Display for LockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "lock {} held by {} for '{}' since {}",
            self.id,
            self.who,
            self.operation,
            self.created.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

/// Blob store keyed by workspace identifier.
///
/// `try_lock` must be a conditional create: it succeeds only if no lock blob
/// exists, and reports the current holder otherwise. `write` must replace the
/// blob atomically.
pub trait StateBackend: Send + Sync {
    fn list(&self) -> Result<Vec<String>, StateError>;
    fn exists(&self, workspace: &str) -> Result<bool, StateError>;
    fn create(&self, workspace: &str) -> Result<(), StateError>;
    fn delete(&self, workspace: &str) -> Result<(), StateError>;
    fn read(&self, workspace: &str) -> Result<Option<Vec<u8>>, StateError>;
    fn write(&self, workspace: &str, blob: &[u8]) -> Result<(), StateError>;
    /// `Ok(None)` when acquired, `Ok(Some(holder))` when someone else holds it
    fn try_lock(&self, workspace: &str, info: &LockInfo) -> Result<Option<LockInfo>, StateError>;
    fn lock_info(&self, workspace: &str) -> Result<Option<LockInfo>, StateError>;
    /// Remove the lock if `lock_id` matches the holder. Unlocking a free or
    /// deleted workspace is a no-op.
    fn unlock(&self, workspace: &str, lock_id: &str) -> Result<(), StateError>;
}

/// One directory per workspace under a root directory
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        debug!("Local state backend rooted at {}", root.display());
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn workspace_dir(&self, workspace: &str) -> PathBuf {
        self.root.join(workspace)
    }

    fn state_path(&self, workspace: &str) -> PathBuf {
        self.workspace_dir(workspace).join(STATE_FILE)
    }

    fn lock_path(&self, workspace: &str) -> PathBuf {
        self.workspace_dir(workspace).join(LOCK_FILE)
    }
}

impl StateBackend for LocalBackend {
    fn list(&self) -> Result<Vec<String>, StateError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match entry.file_name().to_str() {
                Some(name) if is_valid_workspace_name(name) => names.push(name.to_string()),
                _ => debug!("Skipping non-workspace directory {:?}", entry.file_name()),
            }
        }
        names.sort();
        Ok(names)
    }

    fn exists(&self, workspace: &str) -> Result<bool, StateError> {
        Ok(self.workspace_dir(workspace).is_dir())
    }

    fn create(&self, workspace: &str) -> Result<(), StateError> {
        std::fs::create_dir_all(&self.root)?;
        match std::fs::create_dir(self.workspace_dir(workspace)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(StateError::AlreadyExists(workspace.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, workspace: &str) -> Result<(), StateError> {
        match std::fs::remove_dir_all(self.workspace_dir(workspace)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StateError::NotFound(workspace.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read(&self, workspace: &str) -> Result<Option<Vec<u8>>, StateError> {
        match std::fs::read(self.state_path(workspace)) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, workspace: &str, blob: &[u8]) -> Result<(), StateError> {
        // Write-fsync-rename so readers see either the old or the new blob
        let dir = self.workspace_dir(workspace);
        let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
        temp.write_all(blob)?;
        temp.as_file().sync_all()?;
        temp.persist(self.state_path(workspace))
            .map_err(|e| StateError::Io(e.error))?;
        Ok(())
    }

    fn try_lock(&self, workspace: &str, info: &LockInfo) -> Result<Option<LockInfo>, StateError> {
        let path = self.lock_path(workspace);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let body = serde_json::to_vec_pretty(info).map_err(|e| StateError::Backend(e.to_string()))?;
                file.write_all(&body)?;
                file.sync_all()?;
                Ok(None)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(Some(
                self.lock_info(workspace)?.unwrap_or_else(LockInfo::unreadable),
            )),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StateError::NotFound(workspace.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lock_info(&self, workspace: &str) -> Result<Option<LockInfo>, StateError> {
        match std::fs::read(self.lock_path(workspace)) {
            Ok(body) => match serde_json::from_slice(&body) {
                Ok(info) => Ok(Some(info)),
                // The holder may not have finished writing its info yet
                Err(e) => {
                    warn!(
                        "Unreadable lock file for workspace '{}' ({}). If no run holds it, remove it with force-unlock \"\"",
                        workspace, e
                    );
                    Ok(Some(LockInfo::unreadable()))
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn unlock(&self, workspace: &str, lock_id: &str) -> Result<(), StateError> {
        let Some(holder) = self.lock_info(workspace)? else {
            return Ok(());
        };
        if holder.id != lock_id {
            return Err(StateError::LockMismatch {
                workspace: workspace.to_string(),
                expected: lock_id.to_string(),
                actual: holder.id,
            });
        }
        match std::fs::remove_file(self.lock_path(workspace)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Lock on workspace '{}' vanished before release", workspace);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryWorkspace {
    blob: Option<Vec<u8>>,
    lock: Option<LockInfo>,
}

/// Process-local backend for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryBackend {
    workspaces: Mutex<HashMap<String, MemoryWorkspace>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> Result<MutexGuard<'_, HashMap<String, MemoryWorkspace>>, StateError> {
        self.workspaces
            .lock()
            .map_err(|_| StateError::Backend("memory backend mutex poisoned".to_string()))
    }
}

impl StateBackend for MemoryBackend {
    fn list(&self) -> Result<Vec<String>, StateError> {
        let mut names: Vec<String> = self.guard()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn exists(&self, workspace: &str) -> Result<bool, StateError> {
        Ok(self.guard()?.contains_key(workspace))
    }

    fn create(&self, workspace: &str) -> Result<(), StateError> {
        let mut workspaces = self.guard()?;
        if workspaces.contains_key(workspace) {
            return Err(StateError::AlreadyExists(workspace.to_string()));
        }
        workspaces.insert(workspace.to_string(), MemoryWorkspace::default());
        Ok(())
    }

    fn delete(&self, workspace: &str) -> Result<(), StateError> {
        self.guard()?
            .remove(workspace)
            .map(|_| ())
            .ok_or_else(|| StateError::NotFound(workspace.to_string()))
    }

    fn read(&self, workspace: &str) -> Result<Option<Vec<u8>>, StateError> {
        self.guard()?
            .get(workspace)
            .map(|ws| ws.blob.clone())
            .ok_or_else(|| StateError::NotFound(workspace.to_string()))
    }

    fn write(&self, workspace: &str, blob: &[u8]) -> Result<(), StateError> {
        let mut workspaces = self.guard()?;
        let ws = workspaces
            .get_mut(workspace)
            .ok_or_else(|| StateError::NotFound(workspace.to_string()))?;
        ws.blob = Some(blob.to_vec());
        Ok(())
    }

    fn try_lock(&self, workspace: &str, info: &LockInfo) -> Result<Option<LockInfo>, StateError> {
        let mut workspaces = self.guard()?;
        let ws = workspaces
            .get_mut(workspace)
            .ok_or_else(|| StateError::NotFound(workspace.to_string()))?;
        match &ws.lock {
            Some(holder) => Ok(Some(holder.clone())),
            None => {
                ws.lock = Some(info.clone());
                Ok(None)
            }
        }
    }

    fn lock_info(&self, workspace: &str) -> Result<Option<LockInfo>, StateError> {
        Ok(self
            .guard()?
            .get(workspace)
            .and_then(|ws| ws.lock.clone()))
    }

    fn unlock(&self, workspace: &str, lock_id: &str) -> Result<(), StateError> {
        let mut workspaces = self.guard()?;
        let Some(ws) = workspaces.get_mut(workspace) else {
            return Ok(());
        };
        match &ws.lock {
            None => Ok(()),
            Some(holder) if holder.id == lock_id => {
                ws.lock = None;
                Ok(())
            }
            Some(holder) => Err(StateError::LockMismatch {
                workspace: workspace.to_string(),
                expected: lock_id.to_string(),
                actual: holder.id.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(backend: &dyn StateBackend) {
        assert!(backend.list().unwrap().is_empty());
        backend.create("dev").unwrap();
        backend.create("prod").unwrap();
        assert!(matches!(
            backend.create("dev"),
            Err(StateError::AlreadyExists(_))
        ));
        assert_eq!(backend.list().unwrap(), vec!["dev", "prod"]);

        assert_eq!(backend.read("dev").unwrap(), None);
        backend.write("dev", b"{\"serial\":1}").unwrap();
        backend.write("dev", b"{\"serial\":2}").unwrap();
        assert_eq!(backend.read("dev").unwrap().unwrap(), b"{\"serial\":2}".to_vec());

        let first = LockInfo::new("apply");
        let second = LockInfo::new("plan");
        assert_eq!(backend.try_lock("dev", &first).unwrap(), None);
        assert_eq!(backend.try_lock("dev", &second).unwrap(), Some(first.clone()));
        // Other workspaces are independent
        assert_eq!(backend.try_lock("prod", &second).unwrap(), None);

        assert!(matches!(
            backend.unlock("dev", &second.id),
            Err(StateError::LockMismatch { .. })
        ));
        backend.unlock("dev", &first.id).unwrap();
        backend.unlock("dev", &first.id).unwrap();
        assert_eq!(backend.lock_info("dev").unwrap(), None);

        backend.delete("dev").unwrap();
        assert!(!backend.exists("dev").unwrap());
    }

    #[test]
    fn test_local_backend() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path().join("state"));
        exercise(&backend);
        assert!(dir.path().join("state/prod").join(LOCK_FILE).exists());
    }

    #[test]
    fn test_local_backend_lists_only_workspace_directories() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("state");
        let backend = LocalBackend::new(&root);
        backend.create("dev").unwrap();
        std::fs::create_dir_all(root.join(".cache")).unwrap();
        std::fs::create_dir_all(root.join("not a workspace")).unwrap();
        std::fs::write(root.join("notes.txt"), "x").unwrap();
        assert_eq!(backend.list().unwrap(), vec!["dev"]);
    }

    #[test]
    fn test_corrupt_lock_file_reports_unreadable_holder() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path().join("state"));
        backend.create("dev").unwrap();
        std::fs::write(dir.path().join("state/dev").join(LOCK_FILE), "{not json").unwrap();

        let holder = backend.lock_info("dev").unwrap().unwrap();
        assert_eq!(holder.id, "");
        assert_eq!(holder.operation, "unknown");
        let blocked = backend.try_lock("dev", &LockInfo::new("apply")).unwrap();
        assert_eq!(blocked.map(|h| h.id), Some(String::new()));
        backend.unlock("dev", "").unwrap();
        assert_eq!(backend.lock_info("dev").unwrap(), None);
    }

    #[test]
    fn test_memory_backend() {
        exercise(&MemoryBackend::new());
    }
}
