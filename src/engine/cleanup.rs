//! Inter-run storage cleanup
//!
//! Test commands are free to persist scratch data under the configured data
//! directory; each immediate subdirectory is treated as a collection and
//! cleared between runs. Collections with a `system.` prefix are never
//! touched. Cleanup is best-effort: failures are logged and isolated, never
//! propagated into a run's reported result.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;

/// Storage that can enumerate and clear collections
#[async_trait]
pub trait StorageCleanup: Send + Sync {
    async fn collections(&self) -> io::Result<Vec<String>>;
    async fn delete_entries(&self, name: &str) -> io::Result<()>;
}

/// Clear every non-`system.` collection, logging per-collection failures
///
/// Returns how many collections were cleared.
pub async fn sweep(store: &dyn StorageCleanup) -> io::Result<usize> {
    let mut cleared = 0;
    for name in store.collections().await? {
        if name.starts_with("system.") {
            continue;
        }
        match store.delete_entries(&name).await {
            Ok(()) => cleared += 1,
            Err(e) => {
                tracing::warn!(collection = %name, error = %e, "failed to clear collection");
            }
        }
    }
    Ok(cleared)
}

/// Directory-backed scratch storage
///
/// Collections are the immediate subdirectories of the root; clearing one
/// removes its entries but keeps the directory itself.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Create the root directory if it does not exist yet
    pub fn ensure(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }
}

#[async_trait]
impl StorageCleanup for DirStore {
    async fn collections(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete_entries(&self, name: &str) -> io::Result<()> {
        let collection = self.root.join(name);
        let mut entries = tokio::fs::read_dir(&collection).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }
}
