//! Project and task lifecycle.
//!
//! Every operation calls the provider first and writes the registry only
//! after the provider confirmed, so a failure part-way leaves the registry at
//! the last state a provider actually reported.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::instrument;

use crate::checkpoint::{self, Checkpoint};
use crate::config::{self, Config};
use crate::error::{Result, VmforkError};
use crate::provider::{Provider, ProviderSet, SshInfo};
use crate::readiness::{self, GuestProbe, Policy, Readiness};
use crate::registry::Registry;
use crate::secrets::SecretBackend;
use crate::types::{Project, Task, VmStatus};


/// Serializes operations per project/task id within this process.
#[derive(Default)]
struct IdLocks {
    map: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl IdLocks {
    fn get(&self, key: &str) -> Arc<RwLock<()>> {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key.to_string()).or_default().clone()
    }

    async fn write(&self, key: &str) -> OwnedRwLockWriteGuard<()> {
        self.get(key).write_owned().await
    }

    async fn read(&self, key: &str) -> OwnedRwLockReadGuard<()> {
        self.get(key).read_owned().await
    }
}

fn project_key(name: &str) -> String {
    format!("project:{name}")
}

fn task_key(id: &str) -> String {
    format!("task:{id}")
}

/// Held while a project or task is being created under `id`. Projects and
/// tasks share one namespace, so both kinds take the same key.
fn name_key(id: &str) -> String {
    format!("name:{id}")
}

/// A name resolved against the registry: tasks first, then projects.
#[derive(Debug, Clone)]
pub enum Target {
    Project(Project),
    Task(Task),
}

impl Target {
    pub fn name(&self) -> &str {
        match self {
            Target::Project(p) => &p.name,
            Target::Task(t) => &t.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Target::Project(_) => "project",
            Target::Task(_) => "task",
        }
    }

    pub fn provider(&self) -> &str {
        match self {
            Target::Project(p) => &p.provider,
            Target::Task(t) => &t.provider,
        }
    }

    pub fn vm_handle(&self) -> &str {
        match self {
            Target::Project(p) => &p.vm_handle,
            Target::Task(t) => &t.vm_handle,
        }
    }

    pub fn ip(&self) -> Option<&str> {
        match self {
            Target::Project(p) => p.ip.as_deref(),
            Target::Task(t) => t.ip.as_deref(),
        }
    }

    /// The secret scope this VM sees.
    pub fn scope(&self) -> &str {
        match self {
            Target::Project(p) => &p.name,
            Target::Task(t) => &t.project,
        }
    }

    fn lock_key(&self) -> String {
        match self {
            Target::Project(p) => project_key(&p.name),
            Target::Task(t) => task_key(&t.id),
        }
    }
}

/// A VM found on the host by one of the available providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostVm {
    pub provider: &'static str,
    pub handle: String,
    pub status: VmStatus,
    /// `"project"` or `"task"` when the registry knows it; `None` for an
    /// orphan left behind outside vmfork's bookkeeping.
    pub owner: Option<&'static str>,
}

/// Host VMs checked against the registry.
#[derive(Debug, Default)]
pub struct Inventory {
    pub vms: Vec<HostVm>,
    /// Registry rows whose provider was listed but has no such VM.
    pub missing: Vec<String>,
    /// Providers that could not be asked.
    pub skipped: Vec<&'static str>,
}

impl Inventory {
    pub fn orphans(&self) -> impl Iterator<Item = &HostVm> {
        self.vms.iter().filter(|vm| vm.owner.is_none())
    }
}

/// One id's result in a bulk operation.
#[derive(Debug)]
pub struct BulkOutcome {
    pub id: String,
    /// On success, the VM's address if it had one.
    pub result: Result<Option<String>>,
}

#[derive(Debug)]
pub struct BulkReport {
    pub verb: &'static str,
    pub outcomes: Vec<BulkOutcome>,
}

impl BulkReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// e.g. "2 created, 1 failed"
    pub fn summary(&self) -> String {
        format!("{} {}, {} failed", self.succeeded(), self.verb, self.failed())
    }
}

pub struct Orchestrator {
    registry: Registry,
    providers: ProviderSet,
    secrets: Arc<SecretBackend>,
    probe: Arc<dyn GuestProbe>,
    provider_choice: String,
    ssh_user: String,
    ssh_policy: Policy,
    provision_policy: Policy,
    locks: IdLocks,
}

impl Orchestrator {
    pub fn new(
        registry: Registry,
        providers: ProviderSet,
        secrets: Arc<SecretBackend>,
        probe: Arc<dyn GuestProbe>,
        config: &Config,
    ) -> Self {
        Self {
            registry,
            providers,
            secrets,
            probe,
            provider_choice: config.provider.clone(),
            ssh_user: config.ssh.user.clone(),
            ssh_policy: config.readiness.ssh(),
            provision_policy: config.readiness.provision(),
            locks: IdLocks::default(),
        }
    }

    pub fn secrets(&self) -> &SecretBackend {
        &self.secrets
    }

    // ── lookup ────────────────────────────────────────────

    pub async fn resolve_target(&self, name: &str) -> Result<Target> {
        if let Some(task) = self.registry.find_task(name).await? {
            return Ok(Target::Task(task));
        }
        if let Some(project) = self.registry.find_project(name).await? {
            return Ok(Target::Project(project));
        }
        Err(VmforkError::TargetNotFound {
            name: name.to_string(),
        })
    }

    /// Re-read a target's row after taking its lock.
    async fn reload(&self, target: &Target) -> Result<Target> {
        Ok(match target {
            Target::Project(p) => Target::Project(self.registry.get_project(&p.name).await?),
            Target::Task(t) => Target::Task(self.registry.get_task(&t.id).await?),
        })
    }

    /// The provider a row is pinned to, which must still be usable here.
    async fn pinned(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers.require(name).await
    }

    async fn provider_for(&self, target: &Target) -> Result<Arc<dyn Provider>> {
        self.pinned(target.provider()).await
    }

    async fn set_status(&self, target: &Target, status: VmStatus) -> Result<()> {
        match target {
            Target::Project(p) => self.registry.update_project_status(&p.name, status).await,
            Target::Task(t) => self.registry.update_task_status(&t.id, status).await,
        }
    }

    async fn set_ip(&self, target: &Target, ip: Option<&str>) -> Result<()> {
        match target {
            Target::Project(p) => self.registry.update_project_ip(&p.name, ip).await,
            Target::Task(t) => self.registry.update_task_ip(&t.id, ip).await,
        }
    }

    async fn ensure_unused(&self, id: &str) -> Result<()> {
        if self.registry.find_project(id).await?.is_some() {
            return Err(VmforkError::AlreadyExists {
                kind: "project",
                name: id.to_string(),
            });
        }
        if self.registry.find_task(id).await?.is_some() {
            return Err(VmforkError::AlreadyExists {
                kind: "task",
                name: id.to_string(),
            });
        }
        Ok(())
    }

    async fn await_readiness(&self, ip: Option<String>, provision: bool) -> Readiness {
        let Some(host) = ip.clone() else {
            return Readiness {
                ip,
                ssh: false,
                provisioned: provision.then_some(false),
            };
        };
        let target = SshInfo {
            host,
            port: 22,
            user: self.ssh_user.clone(),
        };
        let ssh = readiness::wait_for_ssh(self.probe.as_ref(), &target, self.ssh_policy).await;
        let provisioned = if provision {
            Some(
                ssh && readiness::wait_for_provisioning(
                    self.probe.as_ref(),
                    &target,
                    self.provision_policy,
                )
                .await,
            )
        } else {
            None
        };
        Readiness {
            ip,
            ssh,
            provisioned,
        }
    }

    // ── projects ──────────────────────────────────────────

    #[instrument(skip(self, base_image), fields(project = %name))]
    pub async fn create_project(&self, name: &str, base_image: &Path) -> Result<(Project, Readiness)> {
        config::validate_name("project", name)?;
        if !base_image.is_file() {
            return Err(VmforkError::Validation {
                message: format!("base image {} does not exist", base_image.display()),
            });
        }

        let _guard = self.locks.write(&project_key(name)).await;
        let _name = self.locks.write(&name_key(name)).await;
        self.ensure_unused(name).await?;

        let provider = self.providers.resolve(&self.provider_choice).await?;
        tracing::info!(provider = provider.name(), "creating project");
        let info = provider.create_vm(name, base_image).await?;

        let project = Project {
            name: name.to_string(),
            provider: provider.name().to_string(),
            vm_handle: info.handle.clone(),
            base_image_path: base_image.display().to_string(),
            ip: info.ip.clone(),
            status: info.status,
            created_at: Utc::now(),
        };
        if let Err(e) = self.registry.insert_project(&project).await {
            tracing::warn!(error = %e, "registry insert failed, removing VM");
            if let Err(cleanup) = provider.delete_vm(&info.handle).await {
                tracing::warn!(error = %cleanup, "cleanup after failed insert also failed");
            }
            return Err(e);
        }

        let readiness = self.await_readiness(info.ip, true).await;
        Ok((project, readiness))
    }

    #[instrument(skip(self), fields(project = %name))]
    pub async fn delete_project(&self, name: &str) -> Result<()> {
        let _guard = self.locks.write(&project_key(name)).await;
        let project = self.registry.get_project(name).await?;

        let tasks = self.registry.task_ids_for_project(name).await?;
        if !tasks.is_empty() {
            return Err(VmforkError::ReferentialConflict {
                project: name.to_string(),
                tasks,
            });
        }

        let provider = self.pinned(&project.provider).await?;
        provider.delete_vm(&project.vm_handle).await?;
        self.registry.delete_project(name).await?;
        tracing::info!("project deleted");
        Ok(())
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        self.registry.list_projects().await
    }

    /// The project, its provider and the disk to clone from, with the
    /// project's read lock held so sibling clones run side by side while
    /// anything that would write the project's disk waits. When the project
    /// is running or its disk is not ready to be cloned, the write lock is
    /// taken to stop it and prepare the disk, then downgraded.
    async fn clone_source(
        &self,
        name: &str,
    ) -> Result<(Project, Arc<dyn Provider>, PathBuf, OwnedRwLockReadGuard<()>)> {
        let key = project_key(name);
        {
            let read = self.locks.read(&key).await;
            let project = self.registry.get_project(name).await?;
            // Pinned at project creation; never re-detected.
            let provider = self.pinned(&project.provider).await?;
            if project.status != VmStatus::Running
                && let Some(source) = provider.clone_source(name).await
            {
                return Ok((project, provider, source, read));
            }
        }

        let write = self.locks.write(&key).await;
        let mut project = self.registry.get_project(name).await?;
        let provider = self.pinned(&project.provider).await?;
        if project.status == VmStatus::Running {
            tracing::info!(project = name, "stopping project before clone");
            provider.stop_vm(&project.vm_handle).await?;
            self.registry
                .update_project_status(name, VmStatus::Stopped)
                .await?;
            project.status = VmStatus::Stopped;
        }
        let source = provider.prepare_clone_source(name).await?;
        Ok((project, provider, source, write.downgrade()))
    }

    // ── tasks ─────────────────────────────────────────────

    #[instrument(skip(self), fields(project = %project, task = %id))]
    pub async fn create_task(&self, project: &str, id: &str) -> Result<(Task, Readiness)> {
        config::validate_name("task", id)?;

        let (project, provider, source, _project_guard) = self.clone_source(project).await?;
        let _guard = self.locks.write(&task_key(id)).await;
        let _name = self.locks.write(&name_key(id)).await;
        self.ensure_unused(id).await?;

        let info = provider.create_vm(id, &source).await?;

        let task = Task {
            id: id.to_string(),
            project: project.name.clone(),
            provider: project.provider.clone(),
            vm_handle: info.handle.clone(),
            base_image_path: project.base_image_path.clone(),
            ip: info.ip.clone(),
            status: info.status,
            created_at: Utc::now(),
        };
        if let Err(e) = self.registry.insert_task(&task).await {
            tracing::warn!(error = %e, "registry insert failed, removing VM");
            if let Err(cleanup) = provider.delete_vm(&info.handle).await {
                tracing::warn!(error = %cleanup, "cleanup after failed insert also failed");
            }
            return Err(e);
        }
        tracing::info!(ip = ?task.ip, "task created");

        let readiness = self.await_readiness(info.ip, false).await;
        Ok((task, readiness))
    }

    #[instrument(skip(self), fields(task = %id))]
    pub async fn delete_task(&self, id: &str) -> Result<()> {
        let _guard = self.locks.write(&task_key(id)).await;
        let task = self.registry.get_task(id).await?;
        let provider = self.pinned(&task.provider).await?;
        provider.delete_vm(&task.vm_handle).await?;
        self.registry.delete_task(id).await?;
        tracing::info!("task deleted");
        Ok(())
    }

    pub async fn list_tasks(&self, project: Option<&str>) -> Result<Vec<Task>> {
        if let Some(p) = project {
            self.registry.get_project(p).await?;
        }
        self.registry.list_tasks(project).await
    }

    /// Clone one task per id concurrently. Every id runs to completion; one
    /// failure never cancels the others.
    pub async fn bulk_create(&self, project: &str, ids: &[String]) -> BulkReport {
        let outcomes = join_all(ids.iter().map(|id| async move {
            let result = self
                .create_task(project, id)
                .await
                .map(|(task, _)| task.ip);
            BulkOutcome {
                id: id.clone(),
                result,
            }
        }))
        .await;
        BulkReport {
            verb: "created",
            outcomes,
        }
    }

    pub async fn bulk_delete(&self, ids: &[String]) -> BulkReport {
        let outcomes = join_all(ids.iter().map(|id| async move {
            BulkOutcome {
                id: id.clone(),
                result: self.delete_task(id).await.map(|()| None),
            }
        }))
        .await;
        BulkReport {
            verb: "deleted",
            outcomes,
        }
    }

    // ── either kind ───────────────────────────────────────

    #[instrument(skip(self))]
    pub async fn start(&self, name: &str) -> Result<Readiness> {
        let target = self.resolve_target(name).await?;
        let _guard = self.locks.write(&target.lock_key()).await;
        let target = self.reload(&target).await?;
        let provider = self.provider_for(&target).await?;

        let info = provider.start_vm(target.vm_handle()).await?;
        self.set_status(&target, info.status).await?;
        self.set_ip(&target, info.ip.as_deref()).await?;

        Ok(self.await_readiness(info.ip, false).await)
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, name: &str) -> Result<()> {
        let target = self.resolve_target(name).await?;
        let _guard = self.locks.write(&target.lock_key()).await;
        let target = self.reload(&target).await?;
        let provider = self.provider_for(&target).await?;

        provider.stop_vm(target.vm_handle()).await?;
        self.set_status(&target, VmStatus::Stopped).await
    }

    /// Stop the VM and copy its disk. The VM stays stopped afterwards.
    #[instrument(skip(self))]
    pub async fn checkpoint(&self, name: &str, checkpoint: Option<&str>) -> Result<Checkpoint> {
        let checkpoint_name = match checkpoint {
            Some(n) => n.to_string(),
            None => checkpoint::timestamp_name(Utc::now()),
        };
        checkpoint::validate_name(&checkpoint_name)?;

        let target = self.resolve_target(name).await?;
        let _guard = self.locks.write(&target.lock_key()).await;
        let target = self.reload(&target).await?;
        let provider = self.provider_for(&target).await?;

        let saved = provider
            .checkpoint(target.vm_handle(), &checkpoint_name)
            .await?;
        self.set_status(&target, VmStatus::Stopped).await?;
        Ok(saved)
    }

    /// Roll the disk back. Without a name, the most recent checkpoint wins.
    /// Returns the checkpoint used.
    #[instrument(skip(self))]
    pub async fn restore(&self, name: &str, checkpoint: Option<&str>) -> Result<String> {
        let target = self.resolve_target(name).await?;
        let _guard = self.locks.write(&target.lock_key()).await;
        let target = self.reload(&target).await?;
        let provider = self.provider_for(&target).await?;

        let checkpoint_name = match checkpoint {
            Some(n) => n.to_string(),
            None => provider
                .list_checkpoints(target.vm_handle())
                .await?
                .pop()
                .map(|c| c.name)
                .ok_or_else(|| VmforkError::CheckpointNotFound {
                    vm: target.name().to_string(),
                    name: "(latest)".into(),
                })?,
        };

        provider
            .restore(target.vm_handle(), &checkpoint_name)
            .await?;
        // Guest state on the restored disk is unknown until the next start.
        self.set_status(&target, VmStatus::Stopped).await?;
        Ok(checkpoint_name)
    }

    pub async fn list_checkpoints(&self, name: &str) -> Result<Vec<Checkpoint>> {
        let target = self.resolve_target(name).await?;
        let _guard = self.locks.read(&target.lock_key()).await;
        self.provider_for(&target)
            .await?
            .list_checkpoints(target.vm_handle())
            .await
    }

    /// Current SSH endpoint; a changed address is written back to the
    /// registry.
    pub async fn ssh_info(&self, name: &str) -> Result<(Target, SshInfo)> {
        let target = self.resolve_target(name).await?;
        let _guard = self.locks.read(&target.lock_key()).await;
        let info = self
            .provider_for(&target)
            .await?
            .ssh_info(target.vm_handle())
            .await?;
        if target.ip() != Some(info.host.as_str()) {
            tracing::info!(target = target.name(), ip = %info.host, "address changed");
            self.set_ip(&target, Some(&info.host)).await?;
        }
        Ok((target, info))
    }

    /// Every vmfork VM the available providers report, matched against the
    /// registry in both directions.
    pub async fn inventory(&self) -> Result<Inventory> {
        let mut known: HashMap<(String, String), (&'static str, String)> = HashMap::new();
        for p in self.registry.list_projects().await? {
            known.insert((p.provider, p.vm_handle), ("project", p.name));
        }
        for t in self.registry.list_tasks(None).await? {
            known.insert((t.provider, t.vm_handle), ("task", t.id));
        }

        let mut inventory = Inventory::default();
        for provider in self.providers.all() {
            if !provider.available().await {
                inventory.skipped.push(provider.name());
                continue;
            }
            for vm in provider.list_vms().await? {
                let owner = known
                    .remove(&(provider.name().to_string(), vm.handle.clone()))
                    .map(|(kind, _)| kind);
                if owner.is_none() {
                    tracing::warn!(provider = provider.name(), handle = %vm.handle, "orphaned VM");
                }
                inventory.vms.push(HostVm {
                    provider: provider.name(),
                    handle: vm.handle,
                    status: vm.status,
                    owner,
                });
            }
        }

        let skipped = &inventory.skipped;
        inventory.missing = known
            .into_iter()
            .filter(|((provider, _), _)| !skipped.iter().any(|s| s == provider))
            .map(|(_, (_, name))| name)
            .collect();
        inventory.missing.sort();
        Ok(inventory)
    }

    /// Secrets visible inside `target`.
    pub async fn secrets_for(&self, target: &Target) -> Result<BTreeMap<String, String>> {
        self.secrets.resolve(target.scope()).await
    }
}
