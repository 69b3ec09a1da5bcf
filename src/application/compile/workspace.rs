//! Per-request scratch workspace.
//!
//! Every request gets its own directory `<scratch_root>/<id>/` holding the
//! derived files `<id>.tex`, `<id>.html`, `<id>.pdf`, `<id>.aux`, `<id>.log`
//! and `<id>.out`, plus any fetched assets. The namespace is partitioned by
//! the random identifier, so concurrent requests never need a lock.

use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use super::types::ResolvedAsset;

const DERIVED_EXTENSIONS: &[&str] = &["tex", "html", "pdf", "aux", "log", "out"];
const REDACTED_JOB_NAME: &str = "document";

/// Scoped owner of one request's scratch files.
///
/// Call [`Workspace::release`] on the normal path. If the guard is dropped
/// without being released (panic, cancelled request future) the files are
/// removed synchronously in `Drop`.
#[derive(Debug)]
pub struct Workspace {
    id: String,
    dir: PathBuf,
    assets: Vec<ResolvedAsset>,
    released: bool,
}

impl Workspace {
    /// Allocate a fresh identifier and compute paths. Touches no files.
    pub fn acquire(scratch_root: &Path) -> Self {
        let id = Uuid::new_v4().to_string();
        let dir = scratch_root.join(&id);
        Self {
            id,
            dir,
            assets: Vec::new(),
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Derived path `<dir>/<id>.<extension>`.
    pub fn derived_path(&self, extension: &str) -> PathBuf {
        self.dir.join(format!("{}.{extension}", self.id))
    }

    pub fn source_path(&self) -> PathBuf {
        self.derived_path("tex")
    }

    pub fn log_path(&self) -> PathBuf {
        self.derived_path("log")
    }

    pub fn derived_paths(&self) -> Vec<PathBuf> {
        DERIVED_EXTENSIONS
            .iter()
            .map(|extension| self.derived_path(extension))
            .collect()
    }

    /// Create the workspace directory and write the source document.
    pub async fn stage(&self, source: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir).await?;
        fs::write(self.source_path(), source.as_bytes()).await
    }

    /// Location for an asset, keyed by the base name of its logical name.
    ///
    /// Returns `None` when the name has no usable final segment or would
    /// still resolve outside the workspace directory.
    pub fn asset_path(&self, name: &str) -> Option<PathBuf> {
        let file_name = asset_file_name(name)?;
        let path = self.dir.join(file_name);
        (path.parent() == Some(self.dir.as_path())).then_some(path)
    }

    pub fn adopt_assets(&mut self, assets: Vec<ResolvedAsset>) {
        self.assets.extend(assets);
    }

    /// Strip scratch paths and the identifier from text shown to callers.
    pub fn redact(&self, text: &str) -> String {
        let dir = self.dir.display().to_string();
        text.replace(&format!("{dir}/"), "")
            .replace(&dir, ".")
            .replace(&self.id, REDACTED_JOB_NAME)
    }

    /// Remove every derived path and the workspace directory.
    ///
    /// Missing files are fine; other failures are logged and swallowed.
    pub async fn release(mut self) {
        self.released = true;
        let mut paths = self.derived_paths();
        paths.extend(self.assets.iter().map(|asset| asset.path.clone()));
        for path in paths {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => log_cleanup_failure(&self.id, &path, &err),
            }
        }
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => log_cleanup_failure(&self.id, &self.dir, &err),
        }
        debug!(
            target = "application::compile::workspace",
            op = "workspace::release",
            workspace_id = %self.id,
            "Workspace released"
        );
    }

    fn release_blocking(&mut self) {
        self.released = true;
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => log_cleanup_failure(&self.id, &self.dir, &err),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.released {
            self.release_blocking();
        }
    }
}

fn log_cleanup_failure(id: &str, path: &Path, err: &io::Error) {
    warn!(
        target = "application::compile::workspace",
        op = "workspace::release",
        result = "error",
        workspace_id = %id,
        path = %path.display(),
        error = %err,
        "Failed to remove workspace path"
    );
}

/// Final path segment of an asset name, accepting `/` and `\` as separators.
pub(crate) fn asset_file_name(name: &str) -> Option<&str> {
    let trimmed = name.trim_end_matches(['/', '\\']);
    let candidate = trimmed.rsplit(['/', '\\']).next()?;
    match candidate {
        "" | "." | ".." => None,
        value if value.contains('\0') => None,
        value => Some(value),
    }
}
