//! Durable state document: load once per run, overwrite once per run.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::StoreError;
use crate::pipeline::types::StateDocument;

/// Whole-document persistence for the bounce log.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the document, or an empty one if nothing was saved yet.
    async fn load(&self) -> Result<StateDocument, StoreError>;

    /// Replace the persisted document. Stamps `last_run`.
    async fn save(&self, doc: &mut StateDocument) -> Result<(), StoreError>;
}

/// State document kept as pretty-printed JSON on disk.
///
/// Saves go through a sibling temp file and a rename, so a crash leaves
/// either the old or the new document, never a truncated one.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "bounce-log.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn load(&self) -> Result<StateDocument, StoreError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No state document yet, starting empty");
                return Ok(StateDocument::default());
            }
            Err(e) => return Err(self.io_err(e)),
        };
        serde_json::from_str(&raw).map_err(|source| StoreError::Serialization {
            path: self.path.display().to_string(),
            source,
        })
    }

    async fn save(&self, doc: &mut StateDocument) -> Result<(), StoreError> {
        doc.last_run = Some(Utc::now());

        let json = serde_json::to_vec_pretty(doc).map_err(|source| StoreError::Serialization {
            path: self.path.display().to_string(),
            source,
        })?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_err(e))?;
        }

        let tmp = self.temp_path();
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| self.io_err(e))?;
        file.write_all(&json).await.map_err(|e| self.io_err(e))?;
        file.sync_all().await.map_err(|e| self.io_err(e))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_err(e))?;

        debug!(
            path = %self.path.display(),
            bounces = doc.processed_bounces.len(),
            "State document saved"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{BounceRecord, BounceType};

    #[tokio::test]
    async fn load_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path().join("bounce-log.json"));
        let doc = store.load().await.unwrap();
        assert_eq!(doc, StateDocument::default());
    }

    #[tokio::test]
    async fn save_then_load_keeps_records_and_stamps_last_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path().join("nested/dir/bounce-log.json"));

        let mut doc = StateDocument::default();
        doc.processed_bounces.push(BounceRecord {
            email: "x@y.com".into(),
            bounce_type: BounceType::Hard,
            subject: Some("Undelivered Mail Returned to Sender".into()),
            processed_at: Utc::now(),
            retried: false,
        });
        doc.stats.total = 1;
        doc.stats.permanent = 1;

        store.save(&mut doc).await.unwrap();
        assert!(doc.last_run.is_some());

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, doc);
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn save_overwrites_whole_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path().join("bounce-log.json"));

        let mut first = StateDocument::default();
        first.stats.total = 9;
        store.save(&mut first).await.unwrap();

        let mut second = StateDocument::default();
        second.stats.total = 10;
        store.save(&mut second).await.unwrap();

        assert_eq!(store.load().await.unwrap().stats.total, 10);
    }

    #[tokio::test]
    async fn corrupt_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bounce-log.json");
        tokio::fs::write(&path, "[1, 2").await.unwrap();
        let store = JsonStateStore::new(path);
        assert!(matches!(
            store.load().await,
            Err(StoreError::Serialization { .. })
        ));
    }
}
