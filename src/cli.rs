use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "vmfork",
    version,
    about = "Disposable VMs cloned from long-lived project templates"
)]
pub struct Cli {
    /// Path to config file (default: per-user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Machine-readable output on stdout
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage template VMs
    Project {
        #[command(subcommand)]
        action: ProjectCommand,
    },

    /// Manage VMs cloned from a project
    Task {
        #[command(subcommand)]
        action: TaskCommand,
    },

    /// Stop a project or task and save its disk
    Checkpoint {
        /// Project name or task id
        target: String,

        /// Checkpoint name (default: UTC timestamp)
        name: Option<String>,
    },

    /// Roll a project or task back to a checkpoint
    Restore {
        /// Project name or task id
        target: String,

        /// Checkpoint name (default: most recent)
        name: Option<String>,
    },

    /// List checkpoints of a project or task
    Checkpoints {
        /// Project name or task id
        target: String,
    },

    /// Open a shell in a project or task with secrets exported
    Ssh {
        /// Project name or task id
        target: String,
    },

    /// Run a command in a project or task with secrets exported
    Run {
        /// Project name or task id
        target: String,

        /// Command and arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Copy files to or from a VM (prefix guest paths with ':')
    Cp {
        /// Project name or task id
        target: String,

        src: String,
        dst: String,

        /// Copy directories recursively
        #[arg(short, long)]
        recursive: bool,
    },

    /// Manage encrypted secrets
    Secret {
        #[command(subcommand)]
        action: SecretCommand,
    },

    /// Prepare base images
    Image {
        #[command(subcommand)]
        action: ImageCommand,
    },

    /// Show which providers work on this host
    Providers,

    /// List VMs on this host and flag ones the registry does not know
    Vms,
}

#[derive(Subcommand, Debug)]
pub enum ProjectCommand {
    /// Create and provision a project VM from a base image
    Create {
        name: String,

        /// Base image path or URL
        #[arg(long)]
        image: String,
    },

    /// List projects
    List,

    /// Start a stopped project
    Start { name: String },

    /// Stop a running project
    Stop { name: String },

    /// Delete a project (refused while it has tasks)
    Delete { name: String },
}

#[derive(Subcommand, Debug)]
pub enum TaskCommand {
    /// Clone one or more tasks from a project
    Create {
        /// Project to clone
        #[arg(short, long)]
        project: String,

        /// Task ids
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// List tasks
    List {
        /// Only tasks of this project
        #[arg(short, long)]
        project: Option<String>,
    },

    /// Start a stopped task
    Start { id: String },

    /// Stop a running task
    Stop { id: String },

    /// Delete one or more tasks
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum SecretCommand {
    /// Store a secret (value read from stdin when omitted)
    Set {
        name: String,
        value: Option<String>,

        /// Scope to a project instead of global
        #[arg(short, long)]
        project: Option<String>,
    },

    /// Print a secret's value
    Get {
        name: String,

        #[arg(short, long)]
        project: Option<String>,
    },

    /// List secret names
    List {
        #[arg(short, long)]
        project: Option<String>,
    },

    /// Remove a secret
    Rm {
        name: String,

        #[arg(short, long)]
        project: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ImageCommand {
    /// Download a base image into the cache
    Fetch { url: String },

    /// Convert a disk image with qemu-img
    Convert {
        src: PathBuf,
        dst: PathBuf,

        /// Output format (default: from the destination extension)
        #[arg(long, value_parser = ["raw", "qcow2", "vhdx"])]
        format: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn bulk_task_create_parses_ids() {
        let cli = Cli::parse_from(["vmfork", "task", "create", "-p", "web", "t1", "t2"]);
        match cli.command {
            Command::Task {
                action: TaskCommand::Create { project, ids },
            } => {
                assert_eq!(project, "web");
                assert_eq!(ids, vec!["t1", "t2"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn run_keeps_hyphenated_arguments() {
        let cli = Cli::parse_from(["vmfork", "run", "t1", "ls", "-la", "/"]);
        match cli.command {
            Command::Run { target, command } => {
                assert_eq!(target, "t1");
                assert_eq!(command, vec!["ls", "-la", "/"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
