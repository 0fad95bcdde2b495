//! services/api/src/adapters/blob.rs
//!
//! Filesystem blob store. Uploaded files live anywhere under the content
//! directory and are named `{messageId}-{originalName}`.

use async_trait::async_trait;
use couple_chat_core::{
    ports::{BlobStore, PortError, PortResult},
    MessageId,
};
use std::io;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Every file below the root whose name starts with `prefix`.
    async fn files_with_prefix(&self, prefix: &str) -> io::Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound && dir == self.root => {
                    debug!(root = %self.root.display(), "Content directory does not exist yet");
                    return Ok(found);
                }
                Err(e) => return Err(e),
            };
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_dir() {
                    pending.push(entry.path());
                } else if entry.file_name().to_string_lossy().starts_with(prefix) {
                    found.push(entry.path());
                }
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn remove_for_message(&self, message_id: MessageId) -> PortResult<usize> {
        let prefix = format!("{}-", message_id);
        let paths = self
            .files_with_prefix(&prefix)
            .await
            .map_err(|e| PortError::Persistence(format!("Failed to scan content directory: {}", e)))?;

        let mut removed = 0;
        let mut failures = Vec::new();
        for path in paths {
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(path = %path.display(), "Failed to remove blob: {}", e);
                    failures.push(format!("{}: {}", path.display(), e));
                }
            }
        }

        if failures.is_empty() {
            Ok(removed)
        } else {
            Err(PortError::Persistence(failures.join("; ")))
        }
    }
}
