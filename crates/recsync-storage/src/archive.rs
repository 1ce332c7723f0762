use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// A source export copied into the archive, addressed by content hash.
#[derive(Debug, Clone, Serialize)]
pub struct ArchivedExport {
    pub sha256: String,
    pub relative_path: PathBuf,
    pub byte_size: usize,
    pub already_archived: bool,
}

/// Keeps every ingested export so a run can be replayed from exactly the bytes it saw.
#[derive(Debug, Clone)]
pub struct ExportArchive {
    root: PathBuf,
}

impl ExportArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// `<table>/<YYYYmmdd>/<sha256>.<ext>`; the extension comes from the source file name.
    pub fn relative_path_for(
        table: &str,
        received_at: DateTime<Utc>,
        source_name: &str,
        sha256: &str,
    ) -> PathBuf {
        let ext = Path::new(source_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.trim().to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| "bin".to_string());
        PathBuf::from(table)
            .join(received_at.format("%Y%m%d").to_string())
            .join(format!("{sha256}.{ext}"))
    }

    /// Write the export through a temp file and rename, so a crash never leaves a torn copy.
    pub async fn archive(
        &self,
        table: &str,
        received_at: DateTime<Utc>,
        source_name: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedExport> {
        let sha256 = Self::sha256_hex(bytes);
        let relative_path = Self::relative_path_for(table, received_at, source_name, &sha256);
        let target = self.root.join(&relative_path);
        let dir = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        let archived = |already_archived| ArchivedExport {
            sha256: sha256.clone(),
            relative_path: relative_path.clone(),
            byte_size: bytes.len(),
            already_archived,
        };

        if fs::try_exists(&target)
            .await
            .with_context(|| format!("checking {}", target.display()))?
        {
            return Ok(archived(true));
        }

        let temp = dir.join(format!(".{}.partial", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp)
            .await
            .with_context(|| format!("opening {}", temp.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing {}", temp.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing {}", temp.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            if fs::try_exists(&target).await.unwrap_or(false) {
                return Ok(archived(true));
            }
            return Err(err).with_context(|| {
                format!("moving {} into place at {}", temp.display(), target.display())
            });
        }
        Ok(archived(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn hash_is_stable() {
        assert_eq!(
            ExportArchive::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn extension_falls_back_to_bin() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();
        assert_eq!(
            ExportArchive::relative_path_for("students", at, "march.CSV", "abc"),
            PathBuf::from("students/20260301/abc.csv")
        );
        assert_eq!(
            ExportArchive::relative_path_for("students", at, "export", "abc"),
            PathBuf::from("students/20260301/abc.bin")
        );
    }

    #[tokio::test]
    async fn same_bytes_are_archived_once() {
        let dir = tempdir().expect("tempdir");
        let archive = ExportArchive::new(dir.path());
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();

        let first = archive
            .archive("students", at, "march.csv", b"name,phone\nAnn,111\n")
            .await
            .expect("first archive");
        let second = archive
            .archive("students", at, "march_copy.csv", b"name,phone\nAnn,111\n")
            .await
            .expect("second archive");

        assert!(!first.already_archived);
        assert!(second.already_archived);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(dir.path().join(&first.relative_path).exists());
    }
}
