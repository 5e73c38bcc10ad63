//! JSON document store with atomic replace

use super::{LedgerChange, LedgerDocument, LedgerStore};
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One `<direction>.json` document per direction.
///
/// Writes go to `<file>.tmp`, are fsynced, then renamed over the original,
/// so a crash mid-write leaves either the old or the new document.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl AsRef<Path>, direction: &str) -> Self {
        Self {
            path: dir.as_ref().join(format!("{}.json", direction)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    // Persist the rename itself; not supported everywhere
    if let Ok(dir) = File::open(dir) {
        let _ = dir.sync_all();
    }
    Ok(())
}

#[async_trait]
impl LedgerStore for JsonFileStore {
    async fn load(&self) -> RelayerResult<LedgerDocument> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.iter().all(|b| b.is_ascii_whitespace()) => {
                Ok(LedgerDocument::default())
            }
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LedgerDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn commit(&self, document: &LedgerDocument, _change: LedgerChange<'_>) -> RelayerResult<()> {
        let bytes = serde_json::to_vec_pretty(document)?;
        let size = bytes.len();

        // fsync off the async workers
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| RelayerError::Ledger(format!("ledger write task failed: {}", e)))??;

        debug!("Wrote ledger {:?} ({} bytes)", self.path, size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RelayRecord;
    use crate::testing::sample_event;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_or_empty_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path(), "a-to-b");
        assert_eq!(store.load().await.unwrap(), LedgerDocument::default());

        fs::write(store.path(), "\n").unwrap();
        assert_eq!(store.load().await.unwrap(), LedgerDocument::default());
    }

    #[tokio::test]
    async fn commit_replaces_document_without_leftovers() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested"), "a-to-b");

        let record = RelayRecord::new(sample_event(0xabc, 0, 100));
        let mut document = LedgerDocument {
            watermark: Some(100),
            ..LedgerDocument::default()
        };
        document
            .records
            .insert(record.key.to_string(), record.clone());
        store
            .commit(&document, LedgerChange::Record(&record))
            .await
            .unwrap();

        document.watermark = Some(120);
        store
            .commit(&document, LedgerChange::Watermark(120))
            .await
            .unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, document);

        let names: Vec<String> = fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a-to-b.json".to_string()]);

        // Keys are stored in their string form
        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains(&record.key.to_string()));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn commit_yields_to_other_tasks() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path(), "a-to-b");
        let document = LedgerDocument {
            watermark: Some(7),
            ..LedgerDocument::default()
        };

        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let ticker = tokio::spawn(async move {
            loop {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
            }
        });

        store
            .commit(&document, LedgerChange::Watermark(7))
            .await
            .unwrap();
        ticker.abort();

        // The single runtime thread was free while the file was written
        assert!(ticks.load(Ordering::SeqCst) > 0);
        assert_eq!(store.load().await.unwrap(), document);
    }

    #[tokio::test]
    async fn corrupt_document_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path(), "a-to-b");
        fs::write(store.path(), "{\"watermark\": ").unwrap();
        assert!(store.load().await.is_err());
    }
}
