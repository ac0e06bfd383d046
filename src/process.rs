//! The one place vmfork shells out to host tooling.
//!
//! Every provider and key store goes through [`run`] (or one of its thin
//! variants), so non-zero exits are reported uniformly as
//! [`VmforkError::ToolFailed`] with the tool's stderr kept verbatim.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncWriteExt;

use crate::error::{Result, VmforkError};

/// Run `program` with `args`, returning trimmed stdout on success.
pub async fn run<I, S>(program: &str, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    run_inner(program, args, None).await
}

/// Like [`run`], but feeds `input` to the child's stdin.
pub async fn run_with_stdin<I, S>(program: &str, args: I, input: &[u8]) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    run_inner(program, args, Some(input)).await
}

/// Run a PowerShell script non-interactively.
pub async fn powershell(script: &str) -> Result<String> {
    run(
        "powershell.exe",
        [
            "-NoProfile",
            "-NonInteractive",
            "-ExecutionPolicy",
            "Bypass",
            "-Command",
            script,
        ],
    )
    .await
}

/// Whether the command runs and exits zero. Never errors: a missing binary
/// is just `false`.
pub async fn succeeds<I, S>(program: &str, args: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    run_inner(program, args, None).await.is_ok()
}

/// Run with the terminal attached and return the exit code. A non-zero
/// exit is the caller's business, not an error.
pub async fn run_interactive<I, S>(program: &str, args: I) -> Result<i32>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    tracing::debug!(tool = program, "running interactively {:?}", cmd.as_std());
    let status = cmd
        .status()
        .await
        .map_err(|e| VmforkError::io(format!("running {program}"), e))?;
    Ok(status.code().unwrap_or(-1))
}

/// Start a long-lived background process that outlives vmfork, with stdout
/// and stderr appended to `log`. Returns its pid.
pub fn spawn_detached<I, S>(program: &str, args: I, log: &Path) -> Result<u32>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let open_log = || {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)
            .map_err(|e| VmforkError::io(format!("opening {}", log.display()), e))
    };
    let mut cmd = std::process::Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(open_log()?)
        .stderr(open_log()?);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    tracing::debug!(tool = program, "spawning {:?}", cmd);
    let child = cmd
        .spawn()
        .map_err(|e| VmforkError::io(format!("spawning {program}"), e))?;
    Ok(child.id())
}

/// Resolve `program` against `PATH`. Absolute or relative paths with a
/// separator are checked directly.
pub fn which(program: &str) -> Option<PathBuf> {
    let candidate = PathBuf::from(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then_some(candidate);
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).find_map(|dir| {
        let full = dir.join(program);
        if full.is_file() {
            return Some(full);
        }
        if cfg!(windows) {
            let exe = dir.join(format!("{program}.exe"));
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    })
}

async fn run_inner<I, S>(program: &str, args: I, input: Option<&[u8]>) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);

    tracing::debug!(tool = program, "running {:?}", cmd.as_std());

    let mut child = cmd
        .spawn()
        .map_err(|e| VmforkError::io(format!("running {program}"), e))?;

    if let Some(bytes) = input
        && let Some(mut stdin) = child.stdin.take()
    {
        stdin
            .write_all(bytes)
            .await
            .map_err(|e| VmforkError::io(format!("writing stdin of {program}"), e))?;
        // Dropping closes the pipe so the child sees EOF.
        drop(stdin);
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| VmforkError::io(format!("waiting for {program}"), e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stderr = if stderr.is_empty() {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        } else {
            stderr
        };
        return Err(VmforkError::ToolFailed {
            tool: program.to_string(),
            status: output.status.to_string(),
            stderr,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Quote a value for embedding in a PowerShell single-quoted string.
pub fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captures_stdout() {
        let out = run("sh", ["-c", "echo hello"]).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn non_zero_exit_keeps_stderr_verbatim() {
        let err = run("sh", ["-c", "echo 'disk busy: /dev/vda' >&2; exit 3"])
            .await
            .unwrap_err();
        match err {
            VmforkError::ToolFailed { tool, stderr, .. } => {
                assert_eq!(tool, "sh");
                assert_eq!(stderr, "disk busy: /dev/vda");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stdin_is_forwarded() {
        let out = run_with_stdin("sh", ["-c", "cat"], b"piped").await.unwrap();
        assert_eq!(out, "piped");
    }

    #[tokio::test]
    async fn missing_binary_is_not_success() {
        assert!(!succeeds("vmfork-definitely-not-installed", ["--version"]).await);
    }

    #[test]
    fn which_finds_sh() {
        assert!(which("sh").is_some());
        assert!(which("vmfork-definitely-not-installed").is_none());
    }

    #[test]
    fn ps_quote_doubles_single_quotes() {
        assert_eq!(ps_quote("it's"), "'it''s'");
    }
}
