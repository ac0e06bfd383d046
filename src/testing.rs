//! In-process fakes for driving the orchestrator without a hypervisor.
//!
//! [`FakeProvider`] keeps each VM's "disk" as a plain file under a temp root
//! and uses the real checkpoint module, so checkpoint and restore behave the
//! way they do for the file-backed providers. By default a task's disk is a
//! full copy; [`FakeProvider::overlays`] instead links each task to a parent
//! file the way qcow2 and differencing disks do, and remembers what the
//! parent held at clone time.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;

use crate::checkpoint::{self, Checkpoint, CopyMode};
use crate::error::{Result, VmforkError};
use crate::provider::{self, Provider, SshInfo, VmInfo, VmSummary};
use crate::readiness::GuestProbe;
use crate::secrets::{KeyCustodian, cipher};
use crate::types::VmStatus;

#[derive(Debug, Clone)]
struct FakeVm {
    status: VmStatus,
    ip: Option<String>,
}

/// A task disk's parent and the parent's contents when the task was cloned.
#[derive(Debug, Clone)]
struct ParentLink {
    path: PathBuf,
    contents: String,
}

pub struct FakeProvider {
    name: &'static str,
    available: AtomicBool,
    overlays: bool,
    parents: Mutex<HashMap<String, ParentLink>>,
    root: PathBuf,
    next_ip: AtomicU32,
    without_ip: AtomicBool,
    vms: Mutex<HashMap<String, FakeVm>>,
    failing: Mutex<HashSet<String>>,
    log: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn new(name: &'static str, root: &Path) -> Self {
        Self {
            name,
            available: AtomicBool::new(true),
            overlays: false,
            parents: Mutex::new(HashMap::new()),
            root: root.to_path_buf(),
            next_ip: AtomicU32::new(10),
            without_ip: AtomicBool::new(false),
            vms: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn unavailable(name: &'static str, root: &Path) -> Self {
        let fake = Self::new(name, root);
        fake.set_available(false);
        fake
    }

    /// Task disks reference their parent instead of copying it.
    pub fn overlays(name: &'static str, root: &Path) -> Self {
        Self {
            overlays: true,
            ..Self::new(name, root)
        }
    }

    pub fn set_available(&self, up: bool) {
        self.available.store(up, Ordering::SeqCst);
    }

    pub fn parent_of(&self, id: &str) -> Option<PathBuf> {
        self.parents.lock().unwrap().get(id).map(|link| link.path.clone())
    }

    /// Whether `id`'s parent still holds what it held when `id` was cloned.
    pub fn parent_intact(&self, id: &str) -> bool {
        let link = self.parents.lock().unwrap().get(id).cloned();
        link.is_some_and(|link| {
            std::fs::read_to_string(&link.path).is_ok_and(|now| now == link.contents)
        })
    }

    /// Make `create_vm` fail for this id.
    pub fn fail_create(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    /// Boot VMs without ever reporting an address.
    pub fn withhold_ip(&self) {
        self.without_ip.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn disk(&self, id: &str) -> PathBuf {
        self.root.join("vms").join(id).join("disk")
    }

    pub fn vm_status(&self, handle: &str) -> Option<VmStatus> {
        self.vms.lock().unwrap().get(handle).map(|vm| vm.status)
    }

    pub fn has_vm(&self, handle: &str) -> bool {
        self.vms.lock().unwrap().contains_key(handle)
    }

    /// Pretend the guest's DHCP lease changed.
    pub fn set_ip(&self, handle: &str, ip: &str) {
        if let Some(vm) = self.vms.lock().unwrap().get_mut(handle) {
            vm.ip = Some(ip.to_string());
        }
    }

    fn vm_dir(&self, id: &str) -> PathBuf {
        self.root.join("vms").join(id)
    }

    fn snapshots(&self, handle: &str) -> PathBuf {
        self.root.join("snapshots").join(provider::id_of(handle))
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn lookup(&self, handle: &str) -> Result<FakeVm> {
        self.vms
            .lock()
            .unwrap()
            .get(handle)
            .cloned()
            .ok_or_else(|| VmforkError::VmNotFound {
                handle: handle.to_string(),
            })
    }

    fn set_status(&self, handle: &str, status: VmStatus) -> Result<()> {
        let mut vms = self.vms.lock().unwrap();
        let vm = vms.get_mut(handle).ok_or_else(|| VmforkError::VmNotFound {
            handle: handle.to_string(),
        })?;
        vm.status = status;
        Ok(())
    }

    fn fresh_ip(&self) -> Option<String> {
        if self.without_ip.load(Ordering::SeqCst) {
            return None;
        }
        Some(format!("10.0.0.{}", self.next_ip.fetch_add(1, Ordering::SeqCst)))
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn install_hint(&self) -> &'static str {
        "install the fake"
    }

    async fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn create_vm(&self, id: &str, source: &Path) -> Result<VmInfo> {
        self.record(format!("create {id}"));
        if self.failing.lock().unwrap().contains(id) {
            return Err(VmforkError::ToolFailed {
                tool: "fake".into(),
                status: "exit status: 1".into(),
                stderr: format!("cannot create {id}"),
            });
        }
        // Yield so concurrent creates interleave.
        tokio::task::yield_now().await;

        let disk = self.disk(id);
        if let Some(dir) = disk.parent() {
            tokio::fs::create_dir_all(dir).await.unwrap();
        }
        if self.overlays && source.starts_with(self.root.join("vms")) {
            let contents = tokio::fs::read_to_string(source)
                .await
                .map_err(|e| VmforkError::io(format!("reading {}", source.display()), e))?;
            tokio::fs::write(&disk, "").await.unwrap();
            self.parents.lock().unwrap().insert(
                id.to_string(),
                ParentLink {
                    path: source.to_path_buf(),
                    contents,
                },
            );
        } else {
            tokio::fs::copy(source, &disk)
                .await
                .map_err(|e| VmforkError::io(format!("copying {}", source.display()), e))?;
        }

        let handle = provider::handle_for(id);
        let ip = self.fresh_ip();
        self.vms.lock().unwrap().insert(
            handle.clone(),
            FakeVm {
                status: VmStatus::Running,
                ip: ip.clone(),
            },
        );
        Ok(VmInfo {
            handle,
            ip,
            status: VmStatus::Running,
        })
    }

    async fn start_vm(&self, handle: &str) -> Result<VmInfo> {
        self.record(format!("start {handle}"));
        self.set_status(handle, VmStatus::Running)?;
        // A booted guest always writes to its disk.
        let disk = self.disk(provider::id_of(handle));
        let mut written = tokio::fs::read_to_string(&disk).await.unwrap_or_default();
        written.push_str("boot\n");
        tokio::fs::write(&disk, written).await.unwrap();
        let vm = self.lookup(handle)?;
        Ok(VmInfo {
            handle: handle.to_string(),
            ip: vm.ip,
            status: VmStatus::Running,
        })
    }

    async fn stop_vm(&self, handle: &str) -> Result<()> {
        self.record(format!("stop {handle}"));
        self.set_status(handle, VmStatus::Stopped)
    }

    async fn delete_vm(&self, handle: &str) -> Result<()> {
        self.record(format!("delete {handle}"));
        self.vms.lock().unwrap().remove(handle);
        provider::remove_dir_quiet(&self.vm_dir(provider::id_of(handle))).await?;
        checkpoint::remove_all(&self.snapshots(handle)).await
    }

    async fn ssh_info(&self, handle: &str) -> Result<SshInfo> {
        let vm = self.lookup(handle)?;
        provider::ssh_target(handle, vm.status, vm.ip, "agent")
    }

    async fn checkpoint(&self, handle: &str, name: &str) -> Result<Checkpoint> {
        self.stop_vm(handle).await?;
        let disk = self.disk(provider::id_of(handle));
        checkpoint::save(&disk, &self.snapshots(handle), name, CopyMode::Plain).await
    }

    async fn restore(&self, handle: &str, name: &str) -> Result<()> {
        self.stop_vm(handle).await?;
        let disk = self.disk(provider::id_of(handle));
        checkpoint::restore(&self.snapshots(handle), name, &disk, handle, CopyMode::Plain).await
    }

    async fn list_checkpoints(&self, handle: &str) -> Result<Vec<Checkpoint>> {
        checkpoint::list(&self.snapshots(handle)).await
    }

    async fn status(&self, handle: &str) -> Result<VmStatus> {
        Ok(self.lookup(handle)?.status)
    }

    async fn list_vms(&self) -> Result<Vec<VmSummary>> {
        let mut vms: Vec<VmSummary> = self
            .vms
            .lock()
            .unwrap()
            .iter()
            .map(|(handle, vm)| VmSummary {
                handle: handle.clone(),
                status: vm.status,
            })
            .collect();
        vms.sort_by(|a, b| a.handle.cmp(&b.handle));
        Ok(vms)
    }

    async fn clone_source(&self, project: &str) -> Option<PathBuf> {
        if !self.overlays {
            return Some(self.disk(project));
        }
        provider::base::reusable(&self.vm_dir(project), &self.disk(project)).await
    }

    async fn prepare_clone_source(&self, project: &str) -> Result<PathBuf> {
        if !self.overlays {
            return Ok(self.disk(project));
        }
        let dir = self.vm_dir(project);
        let disk = self.disk(project);
        if let Some(frozen) = provider::base::reusable(&dir, &disk).await {
            return Ok(frozen);
        }
        let frozen = provider::base::freeze(&dir, &disk, "disk").await?;
        tokio::fs::write(&disk, "").await.unwrap();
        provider::base::record(&dir, &frozen, &disk).await?;
        Ok(frozen)
    }
}

/// Answers every probe immediately.
pub struct FakeProbe {
    pub reachable: bool,
    pub provisioned: bool,
}

impl FakeProbe {
    pub fn ready() -> Self {
        Self {
            reachable: true,
            provisioned: true,
        }
    }
}

#[async_trait]
impl GuestProbe for FakeProbe {
    async fn reachable(&self, _target: &SshInfo) -> bool {
        self.reachable
    }

    async fn provisioned(&self, _target: &SshInfo) -> bool {
        self.provisioned
    }
}

/// Hands out a constant key and counts how often it was asked.
#[derive(Default)]
pub struct FixedKey {
    calls: AtomicU32,
}

impl FixedKey {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyCustodian for FixedKey {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn get_or_create_key(&self) -> Result<cipher::Key> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok([42u8; 32])
    }
}
