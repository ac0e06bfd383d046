//! Frozen parent disks for providers whose task disks are overlays.
//!
//! Before the first clone, the project's disk is renamed to `base-<n>.<ext>`
//! and the project gets a fresh overlay on top of it at the old path. Task
//! overlays point at the frozen file, so booting or restoring the project
//! only ever touches its own overlay.
//!
//! A `base` marker next to the disk names the frozen file and fingerprints
//! the project overlay as it was right after freezing. While the overlay is
//! unchanged, later clones reuse the same base instead of stacking another.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::error::{Result, VmforkError};

const MARKER: &str = "base";

/// Modification time and length; enough to tell whether a guest wrote to
/// the disk since it was recorded.
async fn fingerprint(disk: &Path) -> Option<(u128, u64)> {
    let meta = tokio::fs::metadata(disk).await.ok()?;
    let mtime = meta.modified().ok()?.duration_since(UNIX_EPOCH).ok()?;
    Some((mtime.as_nanos(), meta.len()))
}

/// The frozen base under `dir`, if `disk` has not been written since it was
/// layered on top of it.
pub async fn reusable(dir: &Path, disk: &Path) -> Option<PathBuf> {
    let marker = tokio::fs::read_to_string(dir.join(MARKER)).await.ok()?;
    let mut fields = marker.split_whitespace();
    let base = dir.join(fields.next()?);
    let recorded = (fields.next()?.parse().ok()?, fields.next()?.parse().ok()?);

    if fingerprint(disk).await? != recorded || !base.is_file() {
        return None;
    }
    Some(base)
}

/// Move `disk` aside as the next `base-<n>.<ext>` and return the new path.
/// The file is made read-only where the platform allows removing such files
/// with their directory.
pub async fn freeze(dir: &Path, disk: &Path, ext: &str) -> Result<PathBuf> {
    let base = (1u32..)
        .map(|n| dir.join(format!("base-{n}.{ext}")))
        .find(|p| !p.exists())
        .ok_or_else(|| VmforkError::Validation {
            message: format!("no free base slot in {}", dir.display()),
        })?;

    tokio::fs::rename(disk, &base)
        .await
        .map_err(|e| VmforkError::io(format!("freezing {}", disk.display()), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let readonly = std::fs::Permissions::from_mode(0o444);
        if let Err(e) = tokio::fs::set_permissions(&base, readonly).await {
            tracing::warn!(path = %base.display(), error = %e, "could not mark base read-only");
        }
    }

    tracing::info!(disk = %disk.display(), base = %base.display(), "froze project disk");
    Ok(base)
}

/// Undo [`freeze`] after the overlay could not be created.
pub async fn thaw(base: &Path, disk: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = tokio::fs::set_permissions(base, std::fs::Permissions::from_mode(0o644)).await;
    }
    let _ = tokio::fs::remove_file(disk).await;
    if let Err(e) = tokio::fs::rename(base, disk).await {
        tracing::warn!(base = %base.display(), error = %e, "could not restore project disk");
    }
}

/// Remember that `disk` is a fresh overlay on `base`.
pub async fn record(dir: &Path, base: &Path, disk: &Path) -> Result<()> {
    let name = base
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| VmforkError::Validation {
            message: format!("unusable base path {}", base.display()),
        })?;
    let (mtime, len) = fingerprint(disk).await.ok_or_else(|| VmforkError::Validation {
        message: format!("overlay {} is missing", disk.display()),
    })?;
    let path = dir.join(MARKER);
    tokio::fs::write(&path, format!("{name} {mtime} {len}\n"))
        .await
        .map_err(|e| VmforkError::io(format!("writing {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn base_is_reused_until_the_overlay_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let disk = dir.join("disk.qcow2");
        tokio::fs::write(&disk, "provisioned").await.unwrap();
        assert!(reusable(dir, &disk).await.is_none());

        let base = freeze(dir, &disk, "qcow2").await.unwrap();
        assert_eq!(base, dir.join("base-1.qcow2"));
        assert!(!disk.exists());
        tokio::fs::write(&disk, "").await.unwrap();
        record(dir, &base, &disk).await.unwrap();

        assert_eq!(reusable(dir, &disk).await, Some(base.clone()));

        tokio::fs::write(&disk, "guest wrote here").await.unwrap();
        assert!(reusable(dir, &disk).await.is_none());

        let next = freeze(dir, &disk, "qcow2").await.unwrap();
        assert_eq!(next, dir.join("base-2.qcow2"));
        assert_eq!(tokio::fs::read_to_string(&base).await.unwrap(), "provisioned");
    }

    #[tokio::test]
    async fn thaw_puts_the_disk_back() {
        let tmp = tempfile::tempdir().unwrap();
        let disk = tmp.path().join("disk.vhdx");
        tokio::fs::write(&disk, "data").await.unwrap();

        let base = freeze(tmp.path(), &disk, "vhdx").await.unwrap();
        thaw(&base, &disk).await;

        assert!(!base.exists());
        assert_eq!(tokio::fs::read_to_string(&disk).await.unwrap(), "data");
    }
}
