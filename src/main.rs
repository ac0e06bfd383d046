use std::io::Read;
use std::sync::Arc;

use clap::Parser;
use console::style;

use vmfork::checkpoint::Checkpoint;
use vmfork::cli::{Cli, Command, ImageCommand, ProjectCommand, SecretCommand, TaskCommand};
use vmfork::config::{self, Config};
use vmfork::error::VmforkError;
use vmfork::image::{self, ImageFormat};
use vmfork::orchestrator::{BulkReport, Inventory, Orchestrator};
use vmfork::progress::{self, OutputMode};
use vmfork::provider::ProviderSet;
use vmfork::readiness::Readiness;
use vmfork::registry::Registry;
use vmfork::secrets::{self, SecretBackend};
use vmfork::session::{Session, SshProbe};
use vmfork::types::{Project, Task};
use vmfork::{logging, paths};

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    let log_sink = logging::init(cli.verbose);
    let mode = OutputMode::detect(cli.json, cli.verbose);

    let config = match &cli.config {
        Some(path) => config::load_config(path, true)?,
        None => config::load_config(&paths::config_path(), false)?,
    };
    logging::attach_file(&log_sink, &paths::logs_dir());
    tracing::debug!(command = ?cli.command, "starting");

    let json = cli.json;
    match cli.command {
        // Neither of these touches the registry.
        Command::Image { action } => return image_command(action, mode, json).await,
        Command::Providers => return providers_command(&config, json).await,
        _ => {}
    }

    let orch = open(&config).await?;

    match cli.command {
        Command::Project { action } => project_command(&orch, action, mode, json).await?,
        Command::Task { action } => task_command(&orch, action, mode, json).await?,
        Command::Checkpoint { target, name } => {
            let saved = progress::step(
                mode,
                &format!("Checkpointing '{target}'"),
                orch.checkpoint(&target, name.as_deref()),
            )
            .await?;
            if json {
                print_json(&checkpoint_json(&saved))?;
            } else {
                println!(
                    "Saved checkpoint '{}' ({}); '{target}' is stopped",
                    saved.name,
                    image::format_size(saved.size)
                );
            }
        }
        Command::Restore { target, name } => {
            let used = progress::step(
                mode,
                &format!("Restoring '{target}'"),
                orch.restore(&target, name.as_deref()),
            )
            .await?;
            if json {
                print_json(&RestoreJson {
                    target,
                    checkpoint: used,
                })?;
            } else {
                println!("Restored '{target}' to checkpoint '{used}'; start it to boot the restored disk");
            }
        }
        Command::Checkpoints { target } => {
            let list = orch.list_checkpoints(&target).await?;
            if json {
                print_json(&list.iter().map(checkpoint_json).collect::<Vec<_>>())?;
            } else if list.is_empty() {
                println!("No checkpoints for '{target}'.");
            } else {
                for c in &list {
                    println!(
                        "  {:<24} {}  {}",
                        c.name,
                        c.created_at.format("%Y-%m-%d %H:%M:%S"),
                        image::format_size(c.size)
                    );
                }
            }
        }
        Command::Ssh { target } => {
            let (resolved, info) = orch.ssh_info(&target).await?;
            let vars = orch.secrets_for(&resolved).await?;
            let code = Session::new(info, paths::ssh_key_path()).shell(&vars).await?;
            std::process::exit(code);
        }
        Command::Run { target, command } => {
            let (resolved, info) = orch.ssh_info(&target).await?;
            let vars = orch.secrets_for(&resolved).await?;
            let code = Session::new(info, paths::ssh_key_path())
                .run(&vars, &command)
                .await?;
            if json {
                print_json(&ExecJson { exit_code: code })?;
            }
            std::process::exit(code);
        }
        Command::Cp {
            target,
            src,
            dst,
            recursive,
        } => {
            let (_, info) = orch.ssh_info(&target).await?;
            Session::new(info, paths::ssh_key_path())
                .copy(&src, &dst, recursive)
                .await?;
        }
        Command::Secret { action } => secret_command(orch.secrets(), action, json).await?,
        Command::Vms => vms_command(&orch, json).await?,
        Command::Image { .. } | Command::Providers => {}
    }

    Ok(())
}

async fn open(config: &Config) -> miette::Result<Orchestrator> {
    let registry = Registry::open(paths::registry_path()).await?;
    let custodian = secrets::custodian::from_config(&config.secrets)?;
    tracing::debug!(key_store = custodian.name(), "key custodian selected");
    let secrets = Arc::new(SecretBackend::new(registry.clone(), custodian));
    let probe = Arc::new(SshProbe::new(paths::ssh_key_path()));
    Ok(Orchestrator::new(
        registry,
        ProviderSet::from_config(config),
        secrets,
        probe,
        config,
    ))
}

// ── projects and tasks ───────────────────────────────────

async fn project_command(
    orch: &Orchestrator,
    action: ProjectCommand,
    mode: OutputMode,
    json: bool,
) -> miette::Result<()> {
    match action {
        ProjectCommand::Create { name, image } => {
            let base = progress::step(
                mode,
                "Preparing base image",
                image::fetch(&image, &paths::cache_dir()),
            )
            .await?;
            let (project, readiness) = progress::step(
                mode,
                &format!("Creating project '{name}'"),
                orch.create_project(&name, &base),
            )
            .await?;
            if json {
                print_json(&readiness_json(&project.name, &readiness))?;
            } else {
                println!("Project '{}' created on {}", project.name, project.provider);
                print_readiness(&readiness);
            }
        }
        ProjectCommand::List => {
            let projects = orch.list_projects().await?;
            if json {
                print_json(&projects.iter().map(project_json).collect::<Vec<_>>())?;
            } else if projects.is_empty() {
                println!("No projects.");
            } else {
                for p in &projects {
                    println!(
                        "  {:<20} {:<8} {:<8} {}",
                        p.name,
                        p.status.as_str(),
                        p.provider,
                        p.ip.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        ProjectCommand::Start { name } => start(orch, &name, mode, json).await?,
        ProjectCommand::Stop { name } => {
            progress::step(mode, &format!("Stopping '{name}'"), orch.stop(&name)).await?;
        }
        ProjectCommand::Delete { name } => {
            progress::step(
                mode,
                &format!("Deleting project '{name}'"),
                orch.delete_project(&name),
            )
            .await?;
        }
    }
    Ok(())
}

async fn task_command(
    orch: &Orchestrator,
    action: TaskCommand,
    mode: OutputMode,
    json: bool,
) -> miette::Result<()> {
    match action {
        TaskCommand::Create { project, ids } => {
            let report = progress::step(
                mode,
                &format!("Cloning {} task(s) from '{project}'", ids.len()),
                async { Ok::<_, VmforkError>(orch.bulk_create(&project, &ids).await) },
            )
            .await?;
            finish_bulk(&report, json)?;
        }
        TaskCommand::List { project } => {
            let tasks = orch.list_tasks(project.as_deref()).await?;
            if json {
                print_json(&tasks.iter().map(task_json).collect::<Vec<_>>())?;
            } else if tasks.is_empty() {
                println!("No tasks.");
            } else {
                for t in &tasks {
                    println!(
                        "  {:<20} {:<16} {:<8} {}",
                        t.id,
                        if t.project.is_empty() { "-" } else { t.project.as_str() },
                        t.status.as_str(),
                        t.ip.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        TaskCommand::Start { id } => start(orch, &id, mode, json).await?,
        TaskCommand::Stop { id } => {
            progress::step(mode, &format!("Stopping '{id}'"), orch.stop(&id)).await?;
        }
        TaskCommand::Delete { ids } => {
            let report = progress::step(
                mode,
                &format!("Deleting {} task(s)", ids.len()),
                async { Ok::<_, VmforkError>(orch.bulk_delete(&ids).await) },
            )
            .await?;
            finish_bulk(&report, json)?;
        }
    }
    Ok(())
}

async fn start(orch: &Orchestrator, name: &str, mode: OutputMode, json: bool) -> miette::Result<()> {
    let readiness = progress::step(mode, &format!("Starting '{name}'"), orch.start(name)).await?;
    if json {
        print_json(&readiness_json(name, &readiness))?;
    } else {
        print_readiness(&readiness);
    }
    Ok(())
}

fn print_readiness(readiness: &Readiness) {
    match &readiness.ip {
        Some(ip) => println!("  IP:           {ip}"),
        None => println!("  IP:           not assigned yet"),
    }
    println!(
        "  SSH:          {}",
        if readiness.ssh { "ready" } else { "not reachable yet" }
    );
    if let Some(done) = readiness.provisioned {
        println!(
            "  Provisioning: {}",
            if done { "finished" } else { "still running" }
        );
    }
}

/// Per-id table plus the aggregate line. Any failure makes the command fail.
fn finish_bulk(report: &BulkReport, json: bool) -> miette::Result<()> {
    if json {
        print_json(
            &report
                .outcomes
                .iter()
                .map(|o| BulkJson {
                    id: o.id.clone(),
                    ok: o.result.is_ok(),
                    ip: o.result.as_ref().ok().cloned().flatten(),
                    error: o.result.as_ref().err().map(|e| e.to_string()),
                })
                .collect::<Vec<_>>(),
        )?;
    } else {
        for o in &report.outcomes {
            match &o.result {
                Ok(ip) => println!(
                    "  {} {:<20} {}",
                    style("\u{2713}").green(),
                    o.id,
                    ip.as_deref().unwrap_or("")
                ),
                Err(e) => println!("  {} {:<20} {}", style("\u{2717}").red(), o.id, e),
            }
        }
        println!("{}", report.summary());
    }

    if report.failed() > 0 {
        return Err(miette::miette!("{}", report.summary()));
    }
    Ok(())
}

// ── secrets ──────────────────────────────────────────────

async fn secret_command(
    secrets: &SecretBackend,
    action: SecretCommand,
    json: bool,
) -> miette::Result<()> {
    match action {
        SecretCommand::Set {
            name,
            value,
            project,
        } => {
            let value = match value {
                Some(v) => v,
                None => read_stdin_value()?,
            };
            secrets.set(&name, &value, project.as_deref()).await?;
        }
        SecretCommand::Get { name, project } => {
            println!("{}", secrets.get(&name, project.as_deref()).await?);
        }
        SecretCommand::List { project } => {
            let names = secrets.list(project.as_deref()).await?;
            if json {
                print_json(&names)?;
            } else {
                for name in &names {
                    println!("{name}");
                }
            }
        }
        SecretCommand::Rm { name, project } => {
            if !secrets.remove(&name, project.as_deref()).await? {
                eprintln!("secret '{name}' was not set");
            }
        }
    }
    Ok(())
}

/// Whole of stdin, minus one trailing newline.
fn read_stdin_value() -> miette::Result<String> {
    let mut value = String::new();
    std::io::stdin()
        .read_to_string(&mut value)
        .map_err(|e| VmforkError::Io {
            context: "reading secret value from stdin".into(),
            source: e,
        })?;
    if value.ends_with('\n') {
        value.pop();
        if value.ends_with('\r') {
            value.pop();
        }
    }
    Ok(value)
}

// ── images and providers ─────────────────────────────────

async fn image_command(action: ImageCommand, mode: OutputMode, json: bool) -> miette::Result<()> {
    let path = match action {
        ImageCommand::Fetch { url } => image::fetch(&url, &paths::cache_dir()).await?,
        ImageCommand::Convert { src, dst, format } => {
            let format = format.map(|f| f.parse::<ImageFormat>()).transpose()?;
            progress::step(
                mode,
                &format!("Converting {}", src.display()),
                image::convert(&src, &dst, format),
            )
            .await?
        }
    };
    if json {
        print_json(&ImageJson {
            path: path.display().to_string(),
        })?;
    } else {
        println!("{}", path.display());
    }
    Ok(())
}

async fn providers_command(config: &Config, json: bool) -> miette::Result<()> {
    let set = ProviderSet::from_config(config);
    let mut rows = Vec::new();
    for provider in set.all() {
        rows.push(ProviderJson {
            name: provider.name().to_string(),
            available: provider.available().await,
            hint: provider.install_hint().to_string(),
        });
    }
    if json {
        print_json(&rows)?;
        return Ok(());
    }
    for row in &rows {
        if row.available {
            println!("  {} {}", style("\u{2713}").green(), row.name);
        } else {
            println!("  {} {}  ({})", style("\u{2717}").red(), row.name, row.hint);
        }
    }
    Ok(())
}

async fn vms_command(orch: &Orchestrator, json: bool) -> miette::Result<()> {
    let inventory = orch.inventory().await?;
    if json {
        print_json(&inventory_json(&inventory))?;
        return Ok(());
    }

    if inventory.vms.is_empty() {
        println!("No VMs found.");
    }
    for vm in &inventory.vms {
        let owner = match vm.owner {
            Some(kind) => style(kind).to_string(),
            None => style("orphan").yellow().to_string(),
        };
        println!(
            "  {:<28} {:<8} {:<8} {}",
            vm.handle,
            vm.provider,
            vm.status.as_str(),
            owner
        );
    }
    for name in &inventory.missing {
        println!("  {} '{name}' is registered but has no VM", style("!").red());
    }
    for name in &inventory.skipped {
        println!("  ({name} not available, not checked)");
    }
    Ok(())
}

// ── JSON output structs ─────────────────────────────────────────────

fn print_json<'a, T: facet::Facet<'a>>(value: &T) -> miette::Result<()> {
    let text = facet_json::to_string(value)
        .map_err(|e| miette::miette!("JSON serialization failed: {e}"))?;
    println!("{text}");
    Ok(())
}

#[derive(facet::Facet)]
struct ProjectJson {
    name: String,
    provider: String,
    status: String,
    ip: Option<String>,
    base_image: String,
    created_at: String,
}

fn project_json(p: &Project) -> ProjectJson {
    ProjectJson {
        name: p.name.clone(),
        provider: p.provider.clone(),
        status: p.status.to_string(),
        ip: p.ip.clone(),
        base_image: p.base_image_path.clone(),
        created_at: p.created_at.to_rfc3339(),
    }
}

#[derive(facet::Facet)]
struct TaskJson {
    id: String,
    project: String,
    provider: String,
    status: String,
    ip: Option<String>,
    created_at: String,
}

fn task_json(t: &Task) -> TaskJson {
    TaskJson {
        id: t.id.clone(),
        project: t.project.clone(),
        provider: t.provider.clone(),
        status: t.status.to_string(),
        ip: t.ip.clone(),
        created_at: t.created_at.to_rfc3339(),
    }
}

#[derive(facet::Facet)]
struct HostVmJson {
    handle: String,
    provider: String,
    status: String,
    owner: Option<String>,
}

#[derive(facet::Facet)]
struct InventoryJson {
    vms: Vec<HostVmJson>,
    missing: Vec<String>,
    skipped: Vec<String>,
}

fn inventory_json(inventory: &Inventory) -> InventoryJson {
    InventoryJson {
        vms: inventory
            .vms
            .iter()
            .map(|vm| HostVmJson {
                handle: vm.handle.clone(),
                provider: vm.provider.to_string(),
                status: vm.status.to_string(),
                owner: vm.owner.map(str::to_string),
            })
            .collect(),
        missing: inventory.missing.clone(),
        skipped: inventory.skipped.iter().map(|s| s.to_string()).collect(),
    }
}

#[derive(facet::Facet)]
struct CheckpointJson {
    name: String,
    created_at: String,
    size: u64,
}

fn checkpoint_json(c: &Checkpoint) -> CheckpointJson {
    CheckpointJson {
        name: c.name.clone(),
        created_at: c.created_at.to_rfc3339(),
        size: c.size,
    }
}

#[derive(facet::Facet)]
struct ReadinessJson {
    name: String,
    ip: Option<String>,
    ssh: bool,
    provisioned: Option<bool>,
}

fn readiness_json(name: &str, r: &Readiness) -> ReadinessJson {
    ReadinessJson {
        name: name.to_string(),
        ip: r.ip.clone(),
        ssh: r.ssh,
        provisioned: r.provisioned,
    }
}

#[derive(facet::Facet)]
struct BulkJson {
    id: String,
    ok: bool,
    ip: Option<String>,
    error: Option<String>,
}

#[derive(facet::Facet)]
struct RestoreJson {
    target: String,
    checkpoint: String,
}

#[derive(facet::Facet)]
struct ExecJson {
    exit_code: i32,
}

#[derive(facet::Facet)]
struct ImageJson {
    path: String,
}

#[derive(facet::Facet)]
struct ProviderJson {
    name: String,
    available: bool,
    hint: String,
}
