//! On-disk checkpoint layout: one directory per VM under the snapshots root,
//! one `<name>.disk` file per checkpoint inside it.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::error::{Result, VmforkError};
use crate::process;

const EXT: &str = "disk";

/// How a disk image is duplicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Byte copy.
    Plain,
    /// Filesystem clone where supported (`cp -c` on APFS, reflink on Linux),
    /// falling back to a byte copy.
    Clone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub name: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size: u64,
}

pub fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(VmforkError::Validation {
            message: format!(
                "invalid checkpoint name '{name}': use letters, digits, '.', '_' or '-', not starting with '.'"
            ),
        })
    }
}

/// Default checkpoint name for `now`.
pub fn timestamp_name(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d-%H%M%S").to_string()
}

pub fn checkpoint_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{EXT}"))
}

/// Copy `disk` into `dir` as checkpoint `name`, replacing any checkpoint of
/// the same name.
pub async fn save(disk: &Path, dir: &Path, name: &str, mode: CopyMode) -> Result<Checkpoint> {
    validate_name(name)?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| VmforkError::io(format!("creating directory {}", dir.display()), e))?;

    let dest = checkpoint_path(dir, name);
    let partial = dest.with_extension(format!("{EXT}.part"));
    copy_disk(disk, &partial, mode).await?;
    tokio::fs::rename(&partial, &dest)
        .await
        .map_err(|e| VmforkError::io(format!("renaming {}", partial.display()), e))?;

    tracing::info!(checkpoint = name, path = %dest.display(), "saved checkpoint");
    describe(name, &dest).await
}

/// Checkpoints in `dir`, oldest first. Ties on mtime sort by name.
pub async fn list(dir: &Path) -> Result<Vec<Checkpoint>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(VmforkError::io(format!("reading {}", dir.display()), e)),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| VmforkError::io(format!("reading {}", dir.display()), e))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(EXT) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        found.push(describe(name, &path).await?);
    }

    found.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(found)
}

/// Replace `disk` with the contents of checkpoint `name`.
pub async fn restore(dir: &Path, name: &str, disk: &Path, vm: &str, mode: CopyMode) -> Result<()> {
    let source = checkpoint_path(dir, name);
    if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
        return Err(VmforkError::CheckpointNotFound {
            vm: vm.to_string(),
            name: name.to_string(),
        });
    }

    let partial = disk.with_extension("restore.part");
    copy_disk(&source, &partial, mode).await?;
    tokio::fs::rename(&partial, disk)
        .await
        .map_err(|e| VmforkError::io(format!("replacing {}", disk.display()), e))?;

    tracing::info!(checkpoint = name, disk = %disk.display(), "restored checkpoint");
    Ok(())
}

/// Remove every checkpoint of a VM. A missing directory is fine.
pub async fn remove_all(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(VmforkError::io(format!("removing {}", dir.display()), e)),
    }
}

async fn describe(name: &str, path: &Path) -> Result<Checkpoint> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| VmforkError::io(format!("reading {}", path.display()), e))?;
    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    Ok(Checkpoint {
        name: name.to_string(),
        path: path.to_path_buf(),
        created_at: DateTime::<Utc>::from(modified),
        size: meta.len(),
    })
}

pub async fn copy_disk(src: &Path, dst: &Path, mode: CopyMode) -> Result<()> {
    let _ = tokio::fs::remove_file(dst).await;

    if mode == CopyMode::Clone {
        let flag = if cfg!(target_os = "macos") {
            Some("-c")
        } else if cfg!(target_os = "linux") {
            Some("--reflink=auto")
        } else {
            None
        };
        if let Some(flag) = flag {
            match process::run("cp", [OsStr::new(flag), src.as_os_str(), dst.as_os_str()]).await {
                Ok(_) => return Ok(()),
                Err(e) => tracing::debug!(error = %e, "clone copy failed, falling back to plain copy"),
            }
        }
    }

    tokio::fs::copy(src, dst).await.map_err(|e| {
        VmforkError::io(
            format!("copying {} to {}", src.display(), dst.display()),
            e,
        )
    })?;
    Ok(())
}
