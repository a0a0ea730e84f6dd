//! Server data backups.
//!
//! A backup is a point-in-time copy of the server's data directory under
//! the backup root, plus a SHA-256 digest over the file tree. The digest
//! covers relative paths and contents in sorted order, so two identical
//! trees always hash the same.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::AgentResult;

/// Outcome of a completed backup.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupArtifact {
    /// Hex SHA-256 over the backed-up tree.
    pub checksum: String,
    /// Total bytes of file content.
    pub size_bytes: u64,
}

/// Where a backup's copy lives under the backup root.
pub fn backup_path(backup_root: &Path, server_id: &str, backup_id: &str) -> PathBuf {
    backup_root.join(server_id).join(backup_id)
}

/// All regular files under `dir`, as paths relative to it, sorted.
async fn collect_files(dir: &Path) -> AgentResult<Vec<PathBuf>> {
    let mut pending = vec![dir.to_path_buf()];
    let mut files = Vec::new();

    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let kind = entry.file_type().await?;
            if kind.is_dir() {
                pending.push(entry.path());
            } else if kind.is_file() {
                // Unwrap is fine: every entry sits under `dir`.
                files.push(entry.path().strip_prefix(dir).unwrap().to_path_buf());
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Copy a server's data directory into the backup root and digest it.
pub async fn create_backup(
    server_data_dir: &Path,
    backup_root: &Path,
    server_id: &str,
    backup_id: &str,
) -> AgentResult<BackupArtifact> {
    let dest_root = backup_path(backup_root, server_id, backup_id);
    tokio::fs::create_dir_all(&dest_root).await?;

    let files = collect_files(server_data_dir).await?;
    let mut hasher = Sha256::new();
    let mut size_bytes = 0u64;

    for relative in &files {
        let source = server_data_dir.join(relative);
        let dest = dest_root.join(relative);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = tokio::fs::read(&source).await?;
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update(&contents);
        size_bytes += contents.len() as u64;
        tokio::fs::write(&dest, &contents).await?;
    }

    let checksum = hex::encode(hasher.finalize());
    info!(%server_id, %backup_id, size_bytes, files = files.len(), "backup created");
    Ok(BackupArtifact {
        checksum,
        size_bytes,
    })
}

/// Remove a backup's copy. Missing backups are fine.
pub async fn delete_backup(
    backup_root: &Path,
    server_id: &str,
    backup_id: &str,
) -> AgentResult<()> {
    let dest = backup_path(backup_root, server_id, backup_id);
    match tokio::fs::remove_dir_all(&dest).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed(dir: &Path) {
        tokio::fs::create_dir_all(dir.join("world/region")).await.unwrap();
        tokio::fs::write(dir.join("server.properties"), b"motd=hello")
            .await
            .unwrap();
        tokio::fs::write(dir.join("world/region/r.0.0.mca"), b"chunkdata")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn backup_copies_tree_and_sums_sizes() {
        let data = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();
        seed(data.path()).await;

        let artifact = create_backup(data.path(), backups.path(), "s1", "b1")
            .await
            .unwrap();
        assert_eq!(artifact.size_bytes, 10 + 9);
        assert_eq!(artifact.checksum.len(), 64);

        let copied = backup_path(backups.path(), "s1", "b1");
        assert_eq!(
            tokio::fs::read(copied.join("server.properties")).await.unwrap(),
            b"motd=hello"
        );
        assert_eq!(
            tokio::fs::read(copied.join("world/region/r.0.0.mca")).await.unwrap(),
            b"chunkdata"
        );
    }

    #[tokio::test]
    async fn identical_trees_hash_identically() {
        let data = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();
        seed(data.path()).await;

        let first = create_backup(data.path(), backups.path(), "s1", "b1")
            .await
            .unwrap();
        let second = create_backup(data.path(), backups.path(), "s1", "b2")
            .await
            .unwrap();
        assert_eq!(first.checksum, second.checksum);

        tokio::fs::write(data.path().join("server.properties"), b"motd=changed")
            .await
            .unwrap();
        let third = create_backup(data.path(), backups.path(), "s1", "b3")
            .await
            .unwrap();
        assert_ne!(first.checksum, third.checksum);
    }

    #[tokio::test]
    async fn empty_directory_backs_up_cleanly() {
        let data = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();

        let artifact = create_backup(data.path(), backups.path(), "s1", "b1")
            .await
            .unwrap();
        assert_eq!(artifact.size_bytes, 0);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let data = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();
        seed(data.path()).await;

        create_backup(data.path(), backups.path(), "s1", "b1")
            .await
            .unwrap();
        delete_backup(backups.path(), "s1", "b1").await.unwrap();
        assert!(!backup_path(backups.path(), "s1", "b1").exists());
        delete_backup(backups.path(), "s1", "b1").await.unwrap();
    }
}
