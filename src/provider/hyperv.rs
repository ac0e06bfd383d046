//! Hyper-V through PowerShell. Disks are differencing VHDX files whose parent
//! is the base image (projects) or a frozen copy of the project's disk
//! (tasks, see [`super::base`]).

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{Provider, Settings, SshInfo, VmInfo, VmSummary, base};
use crate::checkpoint::{self, Checkpoint, CopyMode};
use crate::config::HypervConfig;
use crate::error::{Result, VmforkError};
use crate::process::{self, ps_quote};
use crate::types::VmStatus;
use crate::{paths, readiness};

const DISK_FILE: &str = "disk.vhdx";

pub struct HypervProvider {
    config: HypervConfig,
    settings: Settings,
}

impl HypervProvider {
    pub fn new(config: HypervConfig, settings: Settings) -> Self {
        Self { config, settings }
    }

    fn disk_of(&self, handle: &str) -> PathBuf {
        paths::vm_dir(super::id_of(handle)).join(DISK_FILE)
    }

    async fn state(&self, handle: &str) -> Result<Option<String>> {
        let out = process::powershell(&format!(
            "$vm = Get-VM -Name {} -ErrorAction SilentlyContinue; if ($vm) {{ $vm.State }} else {{ 'Missing' }}",
            ps_quote(handle)
        ))
        .await?;
        Ok((out != "Missing").then_some(out))
    }

    async fn lookup_ip(&self, handle: &str) -> Option<String> {
        let name = ps_quote(handle);
        let script = format!(
            "$a = Get-VMNetworkAdapter -VMName {name} -ErrorAction SilentlyContinue | Select-Object -First 1; \
             if (-not $a) {{ exit 0 }}; \
             $ip = $a.IPAddresses | Where-Object {{ $_ -match '^\\d+\\.\\d+\\.\\d+\\.\\d+$' }} | Select-Object -First 1; \
             if (-not $ip) {{ \
               $mac = ($a.MacAddress -replace '(..)(?!$)', '$1-'); \
               $ip = Get-NetNeighbor -LinkLayerAddress $mac -AddressFamily IPv4 -ErrorAction SilentlyContinue | \
                 Select-Object -First 1 -ExpandProperty IPAddress \
             }}; \
             $ip"
        );
        process::powershell(&script)
            .await
            .ok()
            .filter(|ip| is_ipv4(ip))
    }

    async fn wait_for_ip(&self, handle: &str) -> Option<String> {
        readiness::wait_for_ip(self.settings.ip, move || async move {
            self.lookup_ip(handle).await
        })
        .await
    }
}

fn is_ipv4(s: &str) -> bool {
    s.parse::<std::net::Ipv4Addr>().is_ok()
}

fn parse_state(state: &str) -> VmStatus {
    match state {
        "Running" => VmStatus::Running,
        _ => VmStatus::Stopped,
    }
}

#[async_trait]
impl Provider for HypervProvider {
    fn name(&self) -> &'static str {
        "hyperv"
    }

    fn install_hint(&self) -> &'static str {
        "enable Hyper-V (`Enable-WindowsOptionalFeature -Online -FeatureName Microsoft-Hyper-V -All`) \
         and run vmfork from an account in the Hyper-V Administrators group"
    }

    async fn available(&self) -> bool {
        if !cfg!(windows) {
            return false;
        }
        process::powershell("Get-Command New-VM -ErrorAction Stop | Out-Null; Get-VMHost | Out-Null")
            .await
            .is_ok()
    }

    async fn create_vm(&self, id: &str, source: &Path) -> Result<VmInfo> {
        let handle = super::handle_for(id);
        let is_task = paths::is_managed(source);
        let dir = super::create_vm_dir(id).await?;
        let disk = dir.join(DISK_FILE);

        let seed = if is_task {
            None
        } else {
            Some(super::project_seed(&self.settings, &dir, id).await?)
        };

        let name = ps_quote(&handle);
        let mut script = format!(
            "$ErrorActionPreference = 'Stop'; \
             New-VHD -Path {disk} -ParentPath {parent} -Differencing | Out-Null; \
             New-VM -Name {name} -Generation 2 -MemoryStartupBytes {mem}MB -VHDPath {disk} -SwitchName {switch} -Path {dir} | Out-Null; \
             Set-VMProcessor -VMName {name} -Count {cpus}; \
             Set-VMFirmware -VMName {name} -EnableSecureBoot Off; ",
            disk = ps_quote(&disk.display().to_string()),
            parent = ps_quote(&source.display().to_string()),
            mem = self.settings.memory_mb,
            switch = ps_quote(&self.config.switch),
            dir = ps_quote(&dir.display().to_string()),
            cpus = self.settings.cpus,
        );
        if !is_task {
            script.push_str(&format!(
                "Resize-VHD -Path {} -SizeBytes {}GB -ErrorAction SilentlyContinue; ",
                ps_quote(&disk.display().to_string()),
                self.settings.disk_gb
            ));
        }
        if let Some(seed) = &seed {
            script.push_str(&format!(
                "Add-VMDvdDrive -VMName {name} -Path {}; ",
                ps_quote(&seed.display().to_string())
            ));
        }
        script.push_str(&format!("Start-VM -Name {name}"));
        process::powershell(&script).await?;
        tracing::info!(handle, parent = %source.display(), "created Hyper-V VM");

        let ip = self.wait_for_ip(&handle).await;
        Ok(VmInfo {
            handle,
            ip,
            status: VmStatus::Running,
        })
    }

    async fn start_vm(&self, handle: &str) -> Result<VmInfo> {
        let state = self.state(handle).await?.ok_or_else(|| VmforkError::VmNotFound {
            handle: handle.to_string(),
        })?;
        if parse_state(&state) != VmStatus::Running {
            process::powershell(&format!("Start-VM -Name {}", ps_quote(handle))).await?;
        }
        let ip = self.wait_for_ip(handle).await;
        Ok(VmInfo {
            handle: handle.to_string(),
            ip,
            status: VmStatus::Running,
        })
    }

    async fn stop_vm(&self, handle: &str) -> Result<()> {
        let state = self.state(handle).await?.ok_or_else(|| VmforkError::VmNotFound {
            handle: handle.to_string(),
        })?;
        if parse_state(&state) != VmStatus::Running {
            return Ok(());
        }

        let name = ps_quote(handle);
        let graceful = tokio::time::timeout(
            self.settings.stop_timeout,
            process::powershell(&format!("Stop-VM -Name {name} -Force")),
        )
        .await;
        match graceful {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(e)) => tracing::warn!(handle, error = %e, "graceful stop failed"),
            Err(_) => tracing::warn!(handle, "graceful stop timed out"),
        }
        tracing::warn!(handle, "turning off VM");
        process::powershell(&format!("Stop-VM -Name {name} -TurnOff -Force")).await?;
        Ok(())
    }

    async fn delete_vm(&self, handle: &str) -> Result<()> {
        if self.state(handle).await?.is_some() {
            let name = ps_quote(handle);
            process::powershell(&format!(
                "Stop-VM -Name {name} -TurnOff -Force -ErrorAction SilentlyContinue; Remove-VM -Name {name} -Force"
            ))
            .await?;
            tracing::info!(handle, "removed Hyper-V VM");
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
        checkpoint::save(&self.disk_of(handle), &dir, name, CopyMode::Plain).await
    }

    async fn restore(&self, handle: &str, name: &str) -> Result<()> {
        self.stop_vm(handle).await?;
        let dir = paths::snapshot_dir(super::id_of(handle));
        checkpoint::restore(&dir, name, &self.disk_of(handle), handle, CopyMode::Plain).await
    }

    async fn list_checkpoints(&self, handle: &str) -> Result<Vec<Checkpoint>> {
        checkpoint::list(&paths::snapshot_dir(super::id_of(handle))).await
    }

    async fn status(&self, handle: &str) -> Result<VmStatus> {
        let state = self.state(handle).await?.ok_or_else(|| VmforkError::VmNotFound {
            handle: handle.to_string(),
        })?;
        Ok(parse_state(&state))
    }

    async fn list_vms(&self) -> Result<Vec<VmSummary>> {
        let out = process::powershell(
            "Get-VM | Where-Object { $_.Name -like 'vmfork-*' } | ForEach-Object { \"$($_.Name) $($_.State)\" }",
        )
        .await?;
        Ok(parse_vm_list(&out))
    }

    async fn clone_source(&self, project: &str) -> Option<PathBuf> {
        let dir = paths::vm_dir(project);
        base::reusable(&dir, &dir.join(DISK_FILE)).await
    }

    async fn prepare_clone_source(&self, project: &str) -> Result<PathBuf> {
        let dir = paths::vm_dir(project);
        let disk = dir.join(DISK_FILE);
        if let Some(frozen) = base::reusable(&dir, &disk).await {
            return Ok(frozen);
        }

        let frozen = base::freeze(&dir, &disk, "vhdx").await?;
        let overlay = process::powershell(&format!(
            "New-VHD -Path {} -ParentPath {} -Differencing -ErrorAction Stop | Out-Null",
            ps_quote(&disk.display().to_string()),
            ps_quote(&frozen.display().to_string()),
        ))
        .await;
        if let Err(e) = overlay {
            base::thaw(&frozen, &disk).await;
            return Err(e);
        }
        base::record(&dir, &frozen, &disk).await?;
        Ok(frozen)
    }
}

fn parse_vm_list(out: &str) -> Vec<VmSummary> {
    super::summarize(out.lines().filter_map(|line| {
        let (name, state) = line.trim().rsplit_once(' ')?;
        Some((name.to_string(), parse_state(state) == VmStatus::Running))
    }))
}
