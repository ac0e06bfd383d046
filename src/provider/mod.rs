//! The hypervisor contract and its shared plumbing.
//!
//! A [`Provider`] owns everything the host hypervisor tracks for a VM: its
//! definition or process, its disk files under the VM directory, and its
//! checkpoints. Handles are `vmfork-<id>` for every provider.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rand_core::{OsRng, RngCore};

use crate::checkpoint::Checkpoint;
use crate::cloudinit;
use crate::config::{Config, ProvisionConfig};
use crate::error::{Result, VmforkError};
use crate::readiness::Policy;
use crate::types::VmStatus;
use crate::{paths, session};

pub mod base;
pub mod detect;
pub mod hyperv;
#[cfg(target_os = "linux")]
pub mod libvirt;
pub mod native;

pub use detect::ProviderSet;

const HANDLE_PREFIX: &str = "vmfork-";
const MAC_FILE: &str = "mac";

/// What a provider reports about a VM after launching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInfo {
    pub handle: String,
    /// `None` when no address showed up before the IP timeout.
    pub ip: Option<String>,
    pub status: VmStatus,
}

/// Where to reach a running VM over SSH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshInfo {
    pub host: String,
    pub port: u16,
    pub user: String,
}

/// A VM found on the host, whether or not the registry knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSummary {
    pub handle: String,
    pub status: VmStatus,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Shown when this provider is required but unavailable.
    fn install_hint(&self) -> &'static str;

    /// Whether host prerequisites are present. Never fails.
    async fn available(&self) -> bool;

    /// Build and boot a VM. `source` is a base image for a project, or a
    /// project's disk (under the managed VM tree) for a task.
    async fn create_vm(&self, id: &str, source: &Path) -> Result<VmInfo>;

    async fn start_vm(&self, handle: &str) -> Result<VmInfo>;

    /// Graceful shutdown, then forced after the stop timeout. Stopping a
    /// stopped VM is fine.
    async fn stop_vm(&self, handle: &str) -> Result<()>;

    /// Best-effort removal of the VM, its disk and its checkpoints.
    async fn delete_vm(&self, handle: &str) -> Result<()>;

    async fn ssh_info(&self, handle: &str) -> Result<SshInfo>;

    /// Copy the disk into a named checkpoint. The VM is stopped first.
    async fn checkpoint(&self, handle: &str, name: &str) -> Result<Checkpoint>;

    async fn restore(&self, handle: &str, name: &str) -> Result<()>;

    async fn list_checkpoints(&self, handle: &str) -> Result<Vec<Checkpoint>>;

    async fn status(&self, handle: &str) -> Result<VmStatus>;

    /// Every vmfork VM this provider finds on the host, sorted by handle.
    async fn list_vms(&self) -> Result<Vec<VmSummary>>;

    /// The disk a task of the stopped `project` can be cloned from as things
    /// stand, or `None` when [`Provider::prepare_clone_source`] has to run
    /// first.
    async fn clone_source(&self, project: &str) -> Option<PathBuf>;

    /// Make the project's disk safe to clone from and return it. Providers
    /// whose task disks stay linked to their source freeze the project's
    /// disk here, so the project's own later writes never reach its tasks.
    async fn prepare_clone_source(&self, project: &str) -> Result<PathBuf>;
}

/// Provider-independent knobs lifted out of [`Config`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub cpus: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub ip: Policy,
    pub stop_timeout: std::time::Duration,
    pub ssh_user: String,
    pub provision: ProvisionConfig,
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cpus: config.resources.cpus,
            memory_mb: config.resources.memory_mb,
            disk_gb: config.resources.disk_gb,
            ip: config.readiness.ip(),
            stop_timeout: config.readiness.stop_timeout(),
            ssh_user: config.ssh.user.clone(),
            provision: config.provision.clone(),
        }
    }
}

pub fn handle_for(id: &str) -> String {
    format!("{HANDLE_PREFIX}{id}")
}

/// Recover the VM id from a handle. Foreign names are returned unchanged.
pub fn id_of(handle: &str) -> &str {
    handle.strip_prefix(HANDLE_PREFIX).unwrap_or(handle)
}

pub fn is_vmfork_handle(name: &str) -> bool {
    name.starts_with(HANDLE_PREFIX)
}

/// A locally administered MAC in the QEMU range.
pub fn generate_mac() -> String {
    let mut tail = [0u8; 3];
    OsRng.fill_bytes(&mut tail);
    format!("52:54:00:{:02x}:{:02x}:{:02x}", tail[0], tail[1], tail[2])
}

/// Pick the MAC for a new VM and record it in `dir`. A task cloned from a
/// project disk reuses the project's MAC so the guest's network config
/// still matches.
pub async fn assign_mac(dir: &Path, source: &Path) -> Result<String> {
    let inherited = if paths::is_managed(source) {
        match source.parent() {
            Some(project_dir) => read_mac(project_dir).await,
            None => None,
        }
    } else {
        None
    };
    let mac = inherited.unwrap_or_else(generate_mac);
    let path = dir.join(MAC_FILE);
    tokio::fs::write(&path, &mac)
        .await
        .map_err(|e| VmforkError::io(format!("writing {}", path.display()), e))?;
    Ok(mac)
}

pub async fn read_mac(dir: &Path) -> Option<String> {
    tokio::fs::read_to_string(dir.join(MAC_FILE))
        .await
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub async fn create_vm_dir(id: &str) -> Result<PathBuf> {
    let dir = paths::vm_dir(id);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| VmforkError::io(format!("creating directory {}", dir.display()), e))?;
    Ok(dir)
}

/// Provisioning media for a project VM. Tasks never get one.
pub async fn project_seed(settings: &Settings, dir: &Path, id: &str) -> Result<PathBuf> {
    let public_key = session::ensure_keypair(&paths::ssh_key_path()).await?;
    let keys = [public_key];
    cloudinit::write_seed(
        dir,
        &cloudinit::Seed {
            instance_id: id,
            user: &settings.ssh_user,
            ssh_keys: &keys,
            packages: &settings.provision.packages,
            script: &settings.provision.script,
        },
    )
    .await
}

/// Remove a VM directory. Already-gone is fine; other I/O errors are not.
pub async fn remove_dir_quiet(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {
            tracing::debug!(path = %dir.display(), "removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(VmforkError::io(format!("removing {}", dir.display()), e)),
    }
}

/// Remove the on-disk artifacts of `id`: its VM directory and checkpoints.
pub async fn remove_artifacts(id: &str) -> Result<()> {
    remove_dir_quiet(&paths::vm_dir(id)).await?;
    crate::checkpoint::remove_all(&paths::snapshot_dir(id)).await
}

/// Keep vmfork domains from a hypervisor's `(name, running)` listing.
pub fn summarize<I>(domains: I) -> Vec<VmSummary>
where
    I: IntoIterator<Item = (String, bool)>,
{
    let mut vms: Vec<VmSummary> = domains
        .into_iter()
        .filter(|(name, _)| is_vmfork_handle(name))
        .map(|(handle, running)| VmSummary {
            handle,
            status: if running {
                VmStatus::Running
            } else {
                VmStatus::Stopped
            },
        })
        .collect();
    vms.sort_by(|a, b| a.handle.cmp(&b.handle));
    vms
}

/// Ids of the VM directories under `root` that hold `disk_file`.
pub async fn scan_vm_dirs(root: &Path, disk_file: &str) -> Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(VmforkError::io(format!("reading {}", root.display()), e)),
    };
    let mut ids = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| VmforkError::io(format!("reading {}", root.display()), e))?
    {
        if let Some(id) = entry.file_name().to_str()
            && entry.path().join(disk_file).is_file()
        {
            ids.push(id.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

/// Build an [`SshInfo`] from a status and address probe result.
pub fn ssh_target(
    handle: &str,
    status: VmStatus,
    ip: Option<String>,
    user: &str,
) -> Result<SshInfo> {
    if status != VmStatus::Running {
        return Err(VmforkError::VmNotRunning {
            handle: handle.to_string(),
        });
    }
    let host = ip.ok_or_else(|| VmforkError::VmNoAddress {
        handle: handle.to_string(),
    })?;
    Ok(SshInfo {
        host,
        port: 22,
        user: user.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_round_trip_ids() {
        assert_eq!(handle_for("web"), "vmfork-web");
        assert_eq!(id_of("vmfork-web"), "web");
        assert_eq!(id_of("other"), "other");
        assert!(is_vmfork_handle("vmfork-t1"));
        assert!(!is_vmfork_handle("ubuntu"));
    }

    #[test]
    fn generated_macs_are_qemu_local() {
        let mac = generate_mac();
        assert!(mac.starts_with("52:54:00:"));
        assert_eq!(mac.len(), 17);
    }

    #[test]
    fn ssh_target_requires_running_and_address() {
        assert!(matches!(
            ssh_target("vmfork-a", VmStatus::Stopped, Some("10.0.0.2".into()), "agent"),
            Err(VmforkError::VmNotRunning { .. })
        ));
        assert!(matches!(
            ssh_target("vmfork-a", VmStatus::Running, None, "agent"),
            Err(VmforkError::VmNoAddress { .. })
        ));
        let info = ssh_target("vmfork-a", VmStatus::Running, Some("10.0.0.2".into()), "agent")
            .unwrap();
        assert_eq!(info.host, "10.0.0.2");
        assert_eq!(info.port, 22);
    }

    #[test]
    fn summaries_keep_only_vmfork_domains() {
        let vms = summarize([
            ("vmfork-web".to_string(), true),
            ("ubuntu-dev".to_string(), true),
            ("vmfork-t1".to_string(), false),
        ]);
        assert_eq!(
            vms,
            vec![
                VmSummary {
                    handle: "vmfork-t1".into(),
                    status: VmStatus::Stopped
                },
                VmSummary {
                    handle: "vmfork-web".into(),
                    status: VmStatus::Running
                },
            ]
        );
    }

    #[tokio::test]
    async fn scan_finds_dirs_with_the_disk_file() {
        let tmp = tempfile::tempdir().unwrap();
        for (id, file) in [("web", "disk.img"), ("t1", "disk.img"), ("kvm", "disk.qcow2")] {
            let dir = tmp.path().join(id);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(file), "").unwrap();
        }
        std::fs::create_dir_all(tmp.path().join("empty")).unwrap();

        let ids = scan_vm_dirs(tmp.path(), "disk.img").await.unwrap();
        assert_eq!(ids, vec!["t1", "web"]);
        assert!(scan_vm_dirs(&tmp.path().join("missing"), "disk.img")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unmanaged_source_gets_a_fresh_mac() {
        let tmp = tempfile::tempdir().unwrap();
        let mac = assign_mac(tmp.path(), Path::new("/images/base.qcow2"))
            .await
            .unwrap();
        assert_eq!(read_mac(tmp.path()).await.as_deref(), Some(mac.as_str()));
    }
}
