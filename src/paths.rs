use std::path::{Path, PathBuf};

/// Environment variable that relocates every per-user path under one root.
pub const HOME_ENV: &str = "VMFORK_HOME";

fn home_override() -> Option<PathBuf> {
    std::env::var_os(HOME_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Data root: `~/.local/share/vmfork/` (or `$VMFORK_HOME/data`).
pub fn data_dir() -> PathBuf {
    match home_override() {
        Some(root) => root.join("data"),
        None => dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("vmfork"),
    }
}

/// Default config file: `~/.config/vmfork/config.toml` (or `$VMFORK_HOME/config.toml`).
pub fn config_path() -> PathBuf {
    match home_override() {
        Some(root) => root.join("config.toml"),
        None => dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("vmfork")
            .join("config.toml"),
    }
}

/// Downloaded base image cache: `~/.cache/vmfork/images/`.
pub fn cache_dir() -> PathBuf {
    match home_override() {
        Some(root) => root.join("cache").join("images"),
        None => dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("vmfork")
            .join("images"),
    }
}

/// The registry database file.
pub fn registry_path() -> PathBuf {
    data_dir().join("registry.db")
}

/// Root of all per-VM directories. Anything below it is a managed disk.
pub fn vms_dir() -> PathBuf {
    data_dir().join("vms")
}

/// Per-VM directory holding its disk, provisioning media and runtime files.
pub fn vm_dir(id: &str) -> PathBuf {
    vms_dir().join(id)
}

/// Root of all checkpoint directories.
pub fn snapshots_dir() -> PathBuf {
    data_dir().join("snapshots")
}

/// Checkpoint directory for one VM: one image file per checkpoint name.
pub fn snapshot_dir(id: &str) -> PathBuf {
    snapshots_dir().join(id)
}

/// Installation SSH private key; the public half sits next to it with `.pub`.
pub fn ssh_key_path() -> PathBuf {
    data_dir().join("ssh").join("id_ed25519")
}

/// User-scoped encryption key file used by the `file` key store.
pub fn key_file_path() -> PathBuf {
    data_dir().join("secret.key")
}

pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Whether `path` lives inside the managed VM tree, i.e. is an existing
/// project disk rather than a golden base image.
pub fn is_managed(path: &Path) -> bool {
    is_managed_under(path, &vms_dir())
}

fn is_managed_under(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn managed_paths_are_detected_by_prefix() {
        let root = Path::new("/home/u/.local/share/vmfork/vms");
        assert!(is_managed_under(
            Path::new("/home/u/.local/share/vmfork/vms/web/disk.qcow2"),
            root
        ));
        assert!(!is_managed_under(
            Path::new("/home/u/images/noble.qcow2"),
            root
        ));
        // Component-wise, not string prefix.
        assert!(!is_managed_under(
            Path::new("/home/u/.local/share/vmfork/vms-old/web/disk.qcow2"),
            root
        ));
    }

    #[test]
    fn vm_and_snapshot_dirs_are_keyed_by_id() {
        assert!(vm_dir("t1").ends_with("vms/t1"));
        assert!(snapshot_dir("t1").ends_with("snapshots/t1"));
    }
}
