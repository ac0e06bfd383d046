//! KVM through libvirt. Disks are qcow2 overlays on a backing file. A task's
//! overlay is backed by a frozen copy of its project's disk (see
//! [`super::base`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error as virt_error;
use virt::network::Network;

use super::{Provider, Settings, SshInfo, VmInfo, VmSummary, base};
use crate::checkpoint::{self, Checkpoint, CopyMode};
use crate::config::LibvirtConfig;
use crate::error::{Result, VmforkError};
use crate::types::VmStatus;
use crate::{paths, process, readiness};

const DISK_FILE: &str = "disk.qcow2";

struct ConnGuard(Connect);

impl std::ops::Deref for ConnGuard {
    type Target = Connect;
    fn deref(&self) -> &Connect {
        &self.0
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.close().ok();
    }
}

pub struct LibvirtProvider {
    config: LibvirtConfig,
    settings: Settings,
}

impl LibvirtProvider {
    pub fn new(config: LibvirtConfig, settings: Settings) -> Self {
        Self { config, settings }
    }

    // libvirt handles are not Send; every call below opens, uses and drops
    // its connection without crossing an await.
    fn connect(&self) -> Result<ConnGuard> {
        // Keep the C library from printing its own errors to stderr.
        virt_error::clear_error_callback();

        Connect::open(Some(&self.config.uri))
            .map(ConnGuard)
            .map_err(|e| VmforkError::Libvirt {
                message: format!("failed to connect to libvirt: {e}"),
                hint: format!(
                    "ensure libvirtd is running and you have access to {}",
                    self.config.uri
                ),
            })
    }

    fn lookup(&self, conn: &Connect, handle: &str) -> Result<Domain> {
        Domain::lookup_by_name(conn, handle).map_err(|_| VmforkError::VmNotFound {
            handle: handle.to_string(),
        })
    }

    fn is_active(&self, handle: &str) -> Result<bool> {
        let conn = self.connect()?;
        let dom = self.lookup(&conn, handle)?;
        Ok(dom.is_active().unwrap_or(false))
    }

    fn define_and_start(&self, xml: &str, handle: &str) -> Result<()> {
        let conn = self.connect()?;
        ensure_network(&conn, &self.config.network)?;
        let dom = Domain::define_xml(&conn, xml).map_err(|e| VmforkError::Libvirt {
            message: format!("failed to define domain: {e}"),
            hint: "check the generated domain XML for errors".into(),
        })?;
        dom.create().map_err(|e| VmforkError::Libvirt {
            message: format!("failed to start domain: {e}"),
            hint: format!("check `virsh -c {} start {handle}` for details", self.config.uri),
        })?;
        tracing::info!(handle, "domain defined and started");
        Ok(())
    }

    fn start_domain(&self, handle: &str) -> Result<()> {
        let conn = self.connect()?;
        ensure_network(&conn, &self.config.network)?;
        let dom = self.lookup(&conn, handle)?;
        if dom.is_active().unwrap_or(false) {
            tracing::debug!(handle, "domain already running");
            return Ok(());
        }
        dom.create().map_err(|e| VmforkError::Libvirt {
            message: format!("failed to start domain: {e}"),
            hint: format!("check `virsh -c {} start {handle}` for details", self.config.uri),
        })?;
        Ok(())
    }

    /// Current DHCP lease address, falling back to the ARP table.
    fn lookup_ip(&self, handle: &str) -> Option<String> {
        let conn = self.connect().ok()?;
        let dom = Domain::lookup_by_name(&conn, handle).ok()?;
        [
            virt::sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE,
            virt::sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_ARP,
        ]
        .into_iter()
        .find_map(|source| {
            let ifaces = dom.interface_addresses(source, 0).ok()?;
            ifaces
                .iter()
                .flat_map(|iface| iface.addrs.iter())
                .map(|a| a.addr.clone())
                .find(|addr| !addr.contains(':'))
        })
    }

    async fn wait_for_ip(&self, handle: &str) -> Option<String> {
        readiness::wait_for_ip(self.settings.ip, move || async move { self.lookup_ip(handle) })
            .await
    }

    fn disk_of(&self, handle: &str) -> PathBuf {
        paths::vm_dir(super::id_of(handle)).join(DISK_FILE)
    }
}

#[async_trait]
impl Provider for LibvirtProvider {
    fn name(&self) -> &'static str {
        "libvirt"
    }

    fn install_hint(&self) -> &'static str {
        "install libvirt and qemu (e.g. `sudo apt install libvirt-daemon-system qemu-kvm qemu-utils`) \
         and add yourself to the libvirt group"
    }

    async fn available(&self) -> bool {
        if process::which("qemu-img").is_none() {
            return false;
        }
        self.connect().is_ok()
    }

    async fn create_vm(&self, id: &str, source: &Path) -> Result<VmInfo> {
        let handle = super::handle_for(id);
        let is_task = paths::is_managed(source);
        let dir = super::create_vm_dir(id).await?;
        let disk = dir.join(DISK_FILE);

        let mut args = vec![
            "create".to_string(),
            "-f".into(),
            "qcow2".into(),
            "-F".into(),
            "qcow2".into(),
            "-b".into(),
            source.display().to_string(),
            disk.display().to_string(),
        ];
        if !is_task {
            args.push(format!("{}G", self.settings.disk_gb));
        }
        process::run("qemu-img", &args).await?;
        tracing::info!(path = %disk.display(), backing = %source.display(), "created qcow2 overlay");

        let mac = super::assign_mac(&dir, source).await?;
        let seed = if is_task {
            None
        } else {
            Some(super::project_seed(&self.settings, &dir, id).await?)
        };

        let xml = domain_xml(&DomainSpec {
            name: &handle,
            domain_type: &self.config.domain_type,
            machine: &self.config.machine,
            memory_mb: self.settings.memory_mb,
            cpus: self.settings.cpus,
            disk: &disk,
            seed: seed.as_deref(),
            network: &self.config.network,
            mac: &mac,
        });
        self.define_and_start(&xml, &handle)?;

        let ip = self.wait_for_ip(&handle).await;
        Ok(VmInfo {
            handle,
            ip,
            status: VmStatus::Running,
        })
    }

    async fn start_vm(&self, handle: &str) -> Result<VmInfo> {
        self.start_domain(handle)?;
        let ip = self.wait_for_ip(handle).await;
        Ok(VmInfo {
            handle: handle.to_string(),
            ip,
            status: VmStatus::Running,
        })
    }

    async fn stop_vm(&self, handle: &str) -> Result<()> {
        {
            let conn = self.connect()?;
            let dom = self.lookup(&conn, handle)?;
            if !dom.is_active().unwrap_or(false) {
                return Ok(());
            }
            tracing::info!(handle, "sending ACPI shutdown");
            if let Err(e) = dom.shutdown() {
                tracing::warn!(handle, error = %e, "ACPI shutdown failed");
            }
        }

        let stopped = readiness::poll_until(
            "shutdown",
            readiness::Policy::new(Duration::from_secs(1), self.settings.stop_timeout),
            move || async move { (!self.is_active(handle).unwrap_or(true)).then_some(()) },
        )
        .await;
        if stopped.is_some() {
            return Ok(());
        }

        tracing::warn!(handle, "graceful shutdown timed out, force stopping");
        let conn = self.connect()?;
        let dom = self.lookup(&conn, handle)?;
        if dom.is_active().unwrap_or(false) {
            dom.destroy().map_err(|e| VmforkError::Libvirt {
                message: format!("force stop failed: {e}"),
                hint: "check libvirt permissions".into(),
            })?;
        }
        Ok(())
    }

    async fn delete_vm(&self, handle: &str) -> Result<()> {
        {
            let conn = self.connect()?;
            if let Ok(dom) = Domain::lookup_by_name(&conn, handle) {
                if dom.is_active().unwrap_or(false) {
                    let _ = dom.destroy();
                }
                dom.undefine().map_err(|e| VmforkError::Libvirt {
                    message: format!("failed to undefine domain: {e}"),
                    hint: "check libvirt permissions".into(),
                })?;
                tracing::info!(handle, "domain undefined");
            }
        }
        super::remove_artifacts(super::id_of(handle)).await
    }

    async fn ssh_info(&self, handle: &str) -> Result<SshInfo> {
        let status = self.status(handle).await?;
        let ip = self.lookup_ip(handle);
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
        Ok(if self.is_active(handle)? {
            VmStatus::Running
        } else {
            VmStatus::Stopped
        })
    }

    async fn list_vms(&self) -> Result<Vec<VmSummary>> {
        let conn = self.connect()?;
        let domains = conn.list_all_domains(0).map_err(|e| VmforkError::Libvirt {
            message: format!("listing domains failed: {e}"),
            hint: "check libvirt permissions".into(),
        })?;
        Ok(super::summarize(domains.iter().filter_map(|dom| {
            let name = dom.get_name().ok()?;
            Some((name, dom.is_active().unwrap_or(false)))
        })))
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

        let frozen = base::freeze(&dir, &disk, "qcow2").await?;
        let overlay = process::run(
            "qemu-img",
            [
                "create".to_string(),
                "-f".into(),
                "qcow2".into(),
                "-F".into(),
                "qcow2".into(),
                "-b".into(),
                frozen.display().to_string(),
                disk.display().to_string(),
            ],
        )
        .await;
        if let Err(e) = overlay {
            base::thaw(&frozen, &disk).await;
            return Err(e);
        }
        base::record(&dir, &frozen, &disk).await?;
        Ok(frozen)
    }
}

fn ensure_network(conn: &Connect, name: &str) -> Result<()> {
    let net = Network::lookup_by_name(conn, name).map_err(|_| VmforkError::Libvirt {
        message: format!("network '{name}' not found"),
        hint: format!(
            "run `sudo virsh net-define /usr/share/libvirt/networks/default.xml && sudo virsh net-start {name}`"
        ),
    })?;

    if !net.is_active().unwrap_or(false) {
        tracing::info!(network = name, "starting inactive network");
        net.create().map_err(|e| VmforkError::Libvirt {
            message: format!("failed to start network '{name}': {e}"),
            hint: format!("try `sudo virsh net-start {name}`"),
        })?;
    }
    Ok(())
}

struct DomainSpec<'a> {
    name: &'a str,
    domain_type: &'a str,
    machine: &'a str,
    memory_mb: u64,
    cpus: u32,
    disk: &'a Path,
    seed: Option<&'a Path>,
    network: &'a str,
    mac: &'a str,
}

fn domain_xml(spec: &DomainSpec<'_>) -> String {
    let DomainSpec {
        name,
        domain_type,
        machine,
        cpus,
        network,
        mac,
        ..
    } = spec;
    let memory_kib = spec.memory_mb * 1024;
    let disk = spec.disk.display();
    let seed = spec
        .seed
        .map(|seed| {
            format!(
                r#"
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{}'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>"#,
                seed.display()
            )
        })
        .unwrap_or_default();

    format!(
        r#"<domain type='{domain_type}'>
  <name>{name}</name>
  <memory unit='KiB'>{memory_kib}</memory>
  <vcpu>{cpus}</vcpu>
  <os>
    <type arch='x86_64' machine='{machine}'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>{seed}
    <interface type='network'>
      <mac address='{mac}'/>
      <source network='{network}'/>
      <model type='virtio'/>
    </interface>
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
  </devices>
</domain>
"#
    )
}
