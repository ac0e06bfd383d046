use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VmforkError>;

#[derive(Debug, Error, Diagnostic)]
pub enum VmforkError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("provider '{name}' is not available on this host")]
    #[diagnostic(help("{hint}"))]
    ProviderUnavailable { name: String, hint: String },

    #[error("unknown provider '{name}'")]
    #[diagnostic(help("known providers: native, libvirt, hyperv"))]
    UnknownProvider { name: String },

    #[error("project '{name}' not found")]
    ProjectNotFound { name: String },

    #[error("task '{id}' not found")]
    TaskNotFound { id: String },

    #[error("no project or task named '{name}'")]
    TargetNotFound { name: String },

    #[error("checkpoint '{name}' not found for '{vm}'")]
    CheckpointNotFound { vm: String, name: String },

    #[error("secret '{name}' not found{}", scope_suffix(.scope))]
    SecretNotFound { name: String, scope: String },

    #[error("VM '{handle}' not found")]
    VmNotFound { handle: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("project '{project}' still has tasks: {}", .tasks.join(", "))]
    #[diagnostic(help("delete the tasks first"))]
    ReferentialConflict { project: String, tasks: Vec<String> },

    #[error("failed to decrypt secret '{name}'{}: ciphertext rejected", scope_suffix(.scope))]
    #[diagnostic(help("the stored value was modified or the installation key changed"))]
    DecryptionFailed { name: String, scope: String },

    #[error("{tool} failed ({status}): {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("libvirt error: {message}")]
    #[diagnostic(help("{hint}"))]
    Libvirt { message: String, hint: String },

    #[error("VM '{handle}' is not running")]
    VmNotRunning { handle: String },

    #[error("VM '{handle}' is running but has no address yet")]
    #[diagnostic(help("wait for the guest network to come up, or start the VM again"))]
    VmNoAddress { handle: String },

    #[error("registry error: {message}")]
    Registry { message: String },

    #[error("key store error: {message}")]
    KeyStore { message: String },

    #[error("failed to download image: {message}")]
    ImageDownload {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

fn scope_suffix(scope: &str) -> String {
    if scope.is_empty() {
        String::new()
    } else {
        format!(" in scope '{scope}'")
    }
}

impl VmforkError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<sqlx::Error> for VmforkError {
    fn from(e: sqlx::Error) -> Self {
        Self::Registry {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referential_conflict_names_blocking_tasks() {
        let err = VmforkError::ReferentialConflict {
            project: "web".into(),
            tasks: vec!["t1".into(), "t2".into()],
        };
        assert_eq!(err.to_string(), "project 'web' still has tasks: t1, t2");
    }

    #[test]
    fn secret_errors_mention_scope_only_when_scoped() {
        let global = VmforkError::SecretNotFound {
            name: "TOKEN".into(),
            scope: String::new(),
        };
        assert_eq!(global.to_string(), "secret 'TOKEN' not found");

        let scoped = VmforkError::SecretNotFound {
            name: "TOKEN".into(),
            scope: "web".into(),
        };
        assert_eq!(scoped.to_string(), "secret 'TOKEN' not found in scope 'web'");
    }
}
