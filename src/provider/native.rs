//! macOS Virtualization.framework through a small helper binary.
//!
//! vmfork does not link the framework itself. Each VM is one long-running
//! helper process started with the disk, MAC and seed it should boot; its pid
//! lives in the VM directory. Disks are raw images cloned with APFS
//! copy-on-write, and addresses come from the host's bootpd lease file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use super::{Provider, Settings, SshInfo, VmInfo, VmSummary};
use crate::checkpoint::{self, Checkpoint, CopyMode};
use crate::config::NativeConfig;
use crate::error::{Result, VmforkError};
use crate::types::VmStatus;
use crate::{paths, process, readiness};

const DISK_FILE: &str = "disk.img";
const PID_FILE: &str = "pid";
const LEASES: &str = "/var/db/dhcpd_leases";

pub struct NativeProvider {
    config: NativeConfig,
    settings: Settings,
}

impl NativeProvider {
    pub fn new(config: NativeConfig, settings: Settings) -> Self {
        Self { config, settings }
    }

    fn dir_of(&self, handle: &str) -> PathBuf {
        paths::vm_dir(super::id_of(handle))
    }

    fn disk_of(&self, handle: &str) -> PathBuf {
        self.dir_of(handle).join(DISK_FILE)
    }

    async fn pid(&self, handle: &str) -> Option<u32> {
        tokio::fs::read_to_string(self.dir_of(handle).join(PID_FILE))
            .await
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    async fn running_pid(&self, handle: &str) -> Option<u32> {
        let pid = self.pid(handle).await?;
        process::succeeds("kill", ["-0", pid.to_string().as_str()])
            .await
            .then_some(pid)
    }

    async fn launch(&self, handle: &str) -> Result<()> {
        let dir = self.dir_of(handle);
        if !dir.exists() {
            return Err(VmforkError::VmNotFound {
                handle: handle.to_string(),
            });
        }
        if self.running_pid(handle).await.is_some() {
            tracing::debug!(handle, "helper already running");
            return Ok(());
        }

        let mac = super::read_mac(&dir).await.ok_or_else(|| VmforkError::Validation {
            message: format!("VM '{handle}' has no recorded MAC address"),
        })?;
        let mut args = vec![
            "--disk".to_string(),
            dir.join(DISK_FILE).display().to_string(),
            "--mac".into(),
            mac,
            "--cpus".into(),
            self.settings.cpus.to_string(),
            "--memory-mb".into(),
            self.settings.memory_mb.to_string(),
        ];
        let seed = dir.join("seed.iso");
        if seed.exists() {
            args.push("--seed".into());
            args.push(seed.display().to_string());
        }

        let pid = process::spawn_detached(&self.config.helper, &args, &dir.join("console.log"))?;
        let pid_path = dir.join(PID_FILE);
        tokio::fs::write(&pid_path, pid.to_string())
            .await
            .map_err(|e| VmforkError::io(format!("writing {}", pid_path.display()), e))?;
        tracing::info!(handle, pid, "started VM helper");
        Ok(())
    }

    async fn lookup_ip(&self, handle: &str) -> Option<String> {
        let mac = super::read_mac(&self.dir_of(handle)).await?;
        let leases = tokio::fs::read_to_string(LEASES).await.ok()?;
        ip_from_leases(&leases, &mac)
    }

    async fn wait_for_ip(&self, handle: &str) -> Option<String> {
        readiness::wait_for_ip(self.settings.ip, move || async move {
            self.lookup_ip(handle).await
        })
        .await
    }

    async fn signal(&self, pid: u32, signal: &str) -> Result<()> {
        process::run("kill", [signal, pid.to_string().as_str()]).await.map(|_| ())
    }
}

#[async_trait]
impl Provider for NativeProvider {
    fn name(&self) -> &'static str {
        "native"
    }

    fn install_hint(&self) -> &'static str {
        "requires macOS on hardware with Hypervisor.framework support and the vmfork-vz helper on PATH \
         (build it with `swift build -c release` and sign it with the virtualization entitlement)"
    }

    async fn available(&self) -> bool {
        if !cfg!(target_os = "macos") || process::which(&self.config.helper).is_none() {
            return false;
        }
        matches!(
            process::run("sysctl", ["-n", "kern.hv_support"]).await.as_deref(),
            Ok("1")
        )
    }

    async fn create_vm(&self, id: &str, source: &Path) -> Result<VmInfo> {
        let handle = super::handle_for(id);
        let is_task = paths::is_managed(source);
        let dir = super::create_vm_dir(id).await?;
        let disk = dir.join(DISK_FILE);

        checkpoint::copy_disk(source, &disk, CopyMode::Clone).await?;
        if !is_task {
            grow_disk(&disk, self.settings.disk_gb).await?;
            super::project_seed(&self.settings, &dir, id).await?;
        }
        super::assign_mac(&dir, source).await?;

        self.launch(&handle).await?;
        let ip = self.wait_for_ip(&handle).await;
        Ok(VmInfo {
            handle,
            ip,
            status: VmStatus::Running,
        })
    }

    async fn start_vm(&self, handle: &str) -> Result<VmInfo> {
        self.launch(handle).await?;
        let ip = self.wait_for_ip(handle).await;
        Ok(VmInfo {
            handle: handle.to_string(),
            ip,
            status: VmStatus::Running,
        })
    }

    async fn stop_vm(&self, handle: &str) -> Result<()> {
        let Some(pid) = self.running_pid(handle).await else {
            return Ok(());
        };

        // The helper turns SIGTERM into a guest power-button request.
        tracing::info!(handle, pid, "requesting guest shutdown");
        self.signal(pid, "-TERM").await?;

        let exited = readiness::poll_until(
            "shutdown",
            readiness::Policy::new(Duration::from_secs(1), self.settings.stop_timeout),
            move || async move { self.running_pid(handle).await.is_none().then_some(()) },
        )
        .await;
        if exited.is_none() {
            tracing::warn!(handle, pid, "graceful shutdown timed out, killing helper");
            if let Err(e) = self.signal(pid, "-KILL").await {
                // It may have exited between the last probe and now.
                if self.running_pid(handle).await.is_some() {
                    return Err(e);
                }
            }
        }

        let _ = tokio::fs::remove_file(self.dir_of(handle).join(PID_FILE)).await;
        Ok(())
    }

    async fn delete_vm(&self, handle: &str) -> Result<()> {
        if let Some(pid) = self.running_pid(handle).await {
            let _ = self.signal(pid, "-KILL").await;
        }
        super::remove_artifacts(super::id_of(handle)).await
    }

    async fn ssh_info(&self, handle: &str) -> Result<SshInfo> {
        let status = self.status(handle).await?;
        let ip = self.lookup_ip(handle).await;
        super::ssh_target(handle, status, ip, &self.settings.ssh_user)
    }

    async fn checkpoint(&self, handle: &str, name: &str) -> Result<Checkpoint> {
        self.stop_vm(handle).await?;
        let dir = paths::snapshot_dir(super::id_of(handle));
        checkpoint::save(&self.disk_of(handle), &dir, name, CopyMode::Clone).await
    }

    async fn restore(&self, handle: &str, name: &str) -> Result<()> {
        self.stop_vm(handle).await?;
        let dir = paths::snapshot_dir(super::id_of(handle));
        checkpoint::restore(&dir, name, &self.disk_of(handle), handle, CopyMode::Clone).await
    }

    async fn list_checkpoints(&self, handle: &str) -> Result<Vec<Checkpoint>> {
        checkpoint::list(&paths::snapshot_dir(super::id_of(handle))).await
    }

    async fn status(&self, handle: &str) -> Result<VmStatus> {
        if !self.disk_of(handle).exists() {
            return Err(VmforkError::VmNotFound {
                handle: handle.to_string(),
            });
        }
        Ok(if self.running_pid(handle).await.is_some() {
            VmStatus::Running
        } else {
            VmStatus::Stopped
        })
    }

    async fn list_vms(&self) -> Result<Vec<VmSummary>> {
        let mut vms = Vec::new();
        for id in super::scan_vm_dirs(&paths::vms_dir(), DISK_FILE).await? {
            let handle = super::handle_for(&id);
            let status = self.status(&handle).await?;
            vms.push(VmSummary { handle, status });
        }
        Ok(vms)
    }

    // Tasks get independent APFS clones; the project disk is always safe
    // to clone from.
    async fn clone_source(&self, project: &str) -> Option<PathBuf> {
        Some(paths::vm_dir(project).join(DISK_FILE))
    }

    async fn prepare_clone_source(&self, project: &str) -> Result<PathBuf> {
        Ok(paths::vm_dir(project).join(DISK_FILE))
    }
}

/// Extend a raw disk to at least `gb` gigabytes. Never shrinks.
async fn grow_disk(disk: &Path, gb: u64) -> Result<()> {
    let want = gb * 1024 * 1024 * 1024;
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(disk)
        .await
        .map_err(|e| VmforkError::io(format!("opening {}", disk.display()), e))?;
    let have = file
        .metadata()
        .await
        .map_err(|e| VmforkError::io(format!("reading {}", disk.display()), e))?
        .len();
    if have < want {
        file.set_len(want)
            .await
            .map_err(|e| VmforkError::io(format!("resizing {}", disk.display()), e))?;
    }
    Ok(())
}

/// bootpd writes octets without leading zeros (`52:54:0:a:b:c`).
fn normalize_mac(mac: &str) -> String {
    mac.split(':')
        .map(|octet| {
            let trimmed = octet.trim_start_matches('0');
            let octet = if trimmed.is_empty() { "0" } else { trimmed };
            octet.to_ascii_lowercase()
        })
        .collect::<Vec<_>>()
        .join(":")
}

/// Find the address leased to `mac` in a bootpd lease file. The file lists
/// newest leases first.
fn ip_from_leases(leases: &str, mac: &str) -> Option<String> {
    let want = normalize_mac(mac);
    let mut ip: Option<&str> = None;
    let mut hw: Option<&str> = None;

    for line in leases.lines().map(str::trim) {
        if line == "{" {
            ip = None;
            hw = None;
        } else if let Some(v) = line.strip_prefix("ip_address=") {
            ip = Some(v);
        } else if let Some(v) = line.strip_prefix("hw_address=") {
            // "1,52:54:0:ab:cd:ef": hardware type, then the address.
            hw = v.split_once(',').map(|(_, addr)| addr);
        } else if line == "}"
            && let (Some(ip), Some(hw)) = (ip, hw)
            && normalize_mac(hw) == want
        {
            return Some(ip.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASES: &str = "\
{
\tname=web
\tip_address=192.168.64.7
\thw_address=1,52:54:0:a:bc:1
\tidentifier=1,52:54:0:a:bc:1
\tlease=0x65f0a1b2
}
{
\tname=other
\tip_address=192.168.64.3
\thw_address=1,52:54:0:ff:ff:ff
\tlease=0x65f0a000
}
";

    #[test]
    fn mac_normalization_drops_leading_zeros() {
        assert_eq!(normalize_mac("52:54:00:0a:BC:01"), "52:54:0:a:bc:1");
        assert_eq!(normalize_mac("52:54:0:a:bc:1"), "52:54:0:a:bc:1");
    }

    #[test]
    fn finds_lease_for_padded_mac() {
        assert_eq!(
            ip_from_leases(LEASES, "52:54:00:0a:bc:01").as_deref(),
            Some("192.168.64.7")
        );
        assert_eq!(
            ip_from_leases(LEASES, "52:54:00:ff:ff:ff").as_deref(),
            Some("192.168.64.3")
        );
        assert!(ip_from_leases(LEASES, "52:54:00:12:34:56").is_none());
    }

    #[tokio::test]
    async fn unavailable_without_helper() {
        let provider = NativeProvider::new(
            NativeConfig {
                helper: "vmfork-vz-definitely-not-installed".into(),
            },
            Settings::from_config(&crate::config::Config::default()),
        );
        assert!(!provider.available().await);
    }

    #[tokio::test]
    async fn grow_never_shrinks() {
        let tmp = tempfile::tempdir().unwrap();
        let disk = tmp.path().join("disk.img");
        tokio::fs::write(&disk, vec![0u8; 4096]).await.unwrap();
        grow_disk(&disk, 0).await.unwrap();
        assert_eq!(tokio::fs::metadata(&disk).await.unwrap().len(), 4096);
    }
}
