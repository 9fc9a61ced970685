//! Task Workspace
//!
//! A scoped filesystem directory owned by exactly one task:
//!
//! ```text
//! {workspace_root}/{task_id}/
//!   raw/            downloaded artifact bytes
//!   logs/           decrypted, extracted log tree (agent-visible)
//!   code/           optional code checkout for rules with needs_code
//!   output/         where the agent writes result.json
//!   prompt.txt      the composed agent prompt
//!   transcript.txt  captured agent stdout
//!   snapshot.tar    post-mortem bundle, present only after a failure
//! ```
//!
//! On success the directory is removed. On failure the logs tree and the
//! transcript are packed into `snapshot.tar` which is kept until retention
//! expiry; everything else is removed.

use std::path::{Path, PathBuf};

use crate::utils::error::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Create the workspace directory tree for a task.
    pub fn create(workspace_root: &Path, task_id: &str) -> AppResult<Self> {
        let root = workspace_root.join(task_id);
        for sub in ["raw", "logs", "output"] {
            std::fs::create_dir_all(root.join(sub))?;
        }
        Ok(Self { root })
    }

    /// Open an existing workspace without creating anything.
    pub fn open(workspace_root: &Path, task_id: &str) -> Self {
        Self {
            root: workspace_root.join(task_id),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("raw")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn code_dir(&self) -> PathBuf {
        self.root.join("code")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn prompt_path(&self) -> PathBuf {
        self.root.join("prompt.txt")
    }

    pub fn transcript_path(&self) -> PathBuf {
        self.root.join("transcript.txt")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join("snapshot.tar")
    }

    /// Check that a candidate path stays inside the workspace root.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    /// Remove the whole workspace (success path).
    pub fn remove(&self) -> AppResult<()> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }

    /// Failure path: pack the logs tree and transcript into `snapshot.tar`,
    /// then drop everything else. The snapshot stays for post-mortems until
    /// retention cleanup removes the directory.
    pub fn snapshot_and_clean(&self) -> AppResult<()> {
        if !self.root.exists() {
            return Ok(());
        }

        let snapshot = self.snapshot_path();
        let file = std::fs::File::create(&snapshot)?;
        let mut builder = tar::Builder::new(file);

        if self.logs_dir().exists() {
            builder
                .append_dir_all("logs", self.logs_dir())
                .map_err(|e| AppError::internal(format!("snapshot pack failed: {}", e)))?;
        }
        for name in ["transcript.txt", "prompt.txt"] {
            let path = self.root.join(name);
            if path.exists() {
                builder
                    .append_path_with_name(&path, name)
                    .map_err(|e| AppError::internal(format!("snapshot pack failed: {}", e)))?;
            }
        }
        builder
            .finish()
            .map_err(|e| AppError::internal(format!("snapshot pack failed: {}", e)))?;

        // Drop everything except the snapshot
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path == snapshot {
                continue;
            }
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Remove workspaces older than the retention window. Returns the number of
/// directories deleted. Runs periodically from the scheduler.
pub fn cleanup_expired(workspace_root: &Path, retention_days: u32) -> AppResult<usize> {
    if !workspace_root.exists() {
        return Ok(0);
    }
    let cutoff = std::time::SystemTime::now()
        .checked_sub(std::time::Duration::from_secs(u64::from(retention_days) * 86_400))
        .unwrap_or(std::time::UNIX_EPOCH);

    let mut removed = 0;
    for entry in std::fs::read_dir(workspace_root)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let modified = entry.metadata().and_then(|m| m.modified());
        if let Ok(modified) = modified {
            if modified < cutoff {
                std::fs::remove_dir_all(&path)?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}
