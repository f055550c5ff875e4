//! Workspace storage for code artifacts.
//!
//! Artifacts live at `<workspace_dir>/<code_id>.ts`. Saves go through a
//! temp file plus an atomic rename so readers (child interpreters, the
//! linter) never observe a partially written file. Concurrent saves of the
//! same id resolve to whichever rename lands last.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{RestexecError, Result};

/// Outcome of a successful save.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedArtifact {
    pub code_id: String,
    pub file_path: String,
    pub size: usize,
}

/// Filesystem store for named TypeScript source artifacts.
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    dir: PathBuf,
}

impl WorkspaceStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| RestexecError::Internal(format!("cannot create workspace dir: {e}")))?;
        Ok(Self { dir })
    }

    /// Directory this store writes into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Absolute path of the artifact for `code_id`.
    ///
    /// Callers must have validated `code_id` already; this is a pure join.
    pub fn path_for(&self, code_id: &str) -> PathBuf {
        self.dir.join(format!("{code_id}.ts"))
    }

    /// Path of the import map shared by all child interpreters.
    pub fn import_map_path(&self) -> PathBuf {
        self.dir.join("import_map.json")
    }

    /// Whether an artifact exists for `code_id`.
    pub async fn exists(&self, code_id: &str) -> bool {
        tokio::fs::try_exists(self.path_for(code_id))
            .await
            .unwrap_or(false)
    }

    /// Save `code` under `code_id`, overwriting any previous artifact.
    ///
    /// Writes `<path>.tmp` first, then renames over `<path>`. Each save is
    /// individually atomic.
    pub async fn save(&self, code_id: &str, code: &str) -> Result<SavedArtifact> {
        let path = self.path_for(code_id);
        let tmp = path.with_extension("ts.tmp");
        let overwritten = tokio::fs::try_exists(&path).await.unwrap_or(false);

        tokio::fs::write(&tmp, code.as_bytes())
            .await
            .map_err(|e| RestexecError::Internal(format!("write failed for '{code_id}': {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| RestexecError::Internal(format!("rename failed for '{code_id}': {e}")))?;

        tracing::info!(
            code_id = %code_id,
            size = code.len(),
            overwritten,
            "artifact saved"
        );

        Ok(SavedArtifact {
            code_id: code_id.to_string(),
            file_path: path.to_string_lossy().into_owned(),
            size: code.len(),
        })
    }

    /// Load the exact stored bytes for `code_id`.
    pub async fn load(&self, code_id: &str) -> Result<String> {
        tokio::fs::read_to_string(self.path_for(code_id))
            .await
            .map_err(|_| RestexecError::FileNotFound(code_id.to_string()))
    }
}
