//! Content-addressed export files written with an atomic temp-file rename.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

use crate::StoreSnapshot;

#[derive(Debug, Clone)]
pub struct ArchivedSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct SnapshotArchive {
    root: PathBuf,
}

impl SnapshotArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// `<YYYYMMDD>/cache_export_<HHMMSS>_<hash prefix>.json`
    pub fn snapshot_relative_path(exported_at: DateTime<Utc>, content_hash: &str) -> PathBuf {
        let short_hash = &content_hash[..content_hash.len().min(16)];
        PathBuf::from(exported_at.format("%Y%m%d").to_string()).join(format!(
            "cache_export_{}_{short_hash}.json",
            exported_at.format("%H%M%S")
        ))
    }

    pub async fn store_snapshot(&self, snapshot: &StoreSnapshot) -> anyhow::Result<ArchivedSnapshot> {
        let bytes = serde_json::to_vec_pretty(snapshot).context("serializing store snapshot")?;
        self.store_bytes(snapshot.exported_at, &bytes).await
    }

    /// Identical bytes exported in the same second resolve to the same path and are not rewritten.
    pub async fn store_bytes(
        &self,
        exported_at: DateTime<Utc>,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::snapshot_relative_path(exported_at, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let archived = |deduplicated| ArchivedSnapshot {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.export.tmp", Uuid::new_v4()));
        if let Err(err) = write_synced(&temp_path, bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => {
                info!(path = %absolute_path.display(), bytes = bytes.len(), "snapshot archived");
                Ok(archived(false))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }

    pub async fn read_bytes(path: impl AsRef<Path>) -> anyhow::Result<Vec<u8>> {
        let path = path.as_ref();
        fs::read(path)
            .await
            .with_context(|| format!("reading snapshot {}", path.display()))
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("opening temp export {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp export {}", path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp export {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn exported_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 31, 6, 30, 0).single().unwrap()
    }

    #[test]
    fn archive_path_is_dated_and_hash_addressed() {
        let hash = SnapshotArchive::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        let rel = SnapshotArchive::snapshot_relative_path(exported_at(), &hash);
        assert_eq!(
            rel,
            PathBuf::from("20250131").join("cache_export_063000_b94d27b9934d3e08.json")
        );
    }

    #[tokio::test]
    async fn repeated_export_is_deduplicated() {
        let dir = tempdir().expect("tempdir");
        let archive = SnapshotArchive::new(dir.path());
        let snapshot = StoreSnapshot {
            schema_version: crate::SCHEMA_VERSION,
            exported_at: exported_at(),
            earnings: vec![],
            analysts: vec![],
        };

        let first = archive.store_snapshot(&snapshot).await.expect("first");
        let second = archive.store_snapshot(&snapshot).await.expect("second");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.absolute_path, second.absolute_path);

        let bytes = SnapshotArchive::read_bytes(&first.absolute_path).await.expect("read");
        let decoded: StoreSnapshot = serde_json::from_slice(&bytes).expect("decode");
        assert_eq!(decoded, snapshot);
    }
}
