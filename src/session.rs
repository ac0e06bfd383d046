//! Remote sessions into running VMs over the system `ssh`/`scp`.
//!
//! Secrets reach the guest as a 0600 env file streamed over ssh's stdin,
//! sourced and deleted before the user's command runs. Values never show up
//! in any process's argv on either side, and nothing is left on the guest
//! disk to end up in clones or checkpoints.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rand_core::{OsRng, RngCore};
use ssh_key::{Algorithm, LineEnding, PrivateKey};

use crate::error::{Result, VmforkError};
use crate::process;
use crate::provider::SshInfo;
use crate::readiness::GuestProbe;
use crate::secrets;

/// Guest-side directory for env files, relative to the login user's home.
const ENV_DIR: &str = ".vmfork";

/// A fresh env file path per session, so concurrent sessions never share one.
fn env_file() -> String {
    format!("$HOME/{ENV_DIR}/env.{:016x}", OsRng.next_u64())
}

/// Source `env_file`, delete it, then run `then`.
fn sourced(env_file: &str, then: &str) -> String {
    format!(". \"{env_file}\"; rm -f \"{env_file}\"; {then}")
}

/// Remote command line for [`Session::run`].
fn run_line(env_file: &str, command: &[String]) -> String {
    sourced(env_file, &command.join(" "))
}

/// Remote command line for [`Session::shell`].
fn shell_line(env_file: &str) -> String {
    sourced(env_file, "exec \"${SHELL:-/bin/sh}\" -l")
}

/// Options shared by every ssh/scp invocation. Guests are recreated often
/// and their host keys change with them.
fn common_opts(key: &Path) -> Vec<String> {
    let mut opts = vec!["-i".to_string(), key.display().to_string()];
    for opt in [
        "StrictHostKeyChecking=no",
        "UserKnownHostsFile=/dev/null",
        "LogLevel=ERROR",
        "IdentitiesOnly=yes",
        "ConnectTimeout=5",
    ] {
        opts.push("-o".into());
        opts.push(opt.into());
    }
    opts
}

pub fn ssh_args(target: &SshInfo, key: &Path, batch: bool, tty: bool) -> Vec<String> {
    let mut args = common_opts(key);
    if batch {
        args.extend(["-o".into(), "BatchMode=yes".into()]);
    }
    if tty {
        args.push("-t".into());
    }
    args.extend(["-p".into(), target.port.to_string()]);
    args.push(format!("{}@{}", target.user, target.host));
    args
}

/// Single-quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Render resolved secrets as a sourceable script of `export` lines.
pub fn env_script(vars: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::new();
    for (name, value) in vars {
        secrets::validate_env_name(name)?;
        out.push_str(&format!("export {name}={}\n", shell_quote(value)));
    }
    Ok(out)
}

/// Checks reachability and cloud-init progress with one-shot ssh commands.
pub struct SshProbe {
    key: PathBuf,
}

impl SshProbe {
    pub fn new(key: PathBuf) -> Self {
        Self { key }
    }
}

#[async_trait]
impl GuestProbe for SshProbe {
    async fn reachable(&self, target: &SshInfo) -> bool {
        let mut args = ssh_args(target, &self.key, true, false);
        args.push("true".into());
        process::succeeds("ssh", &args).await
    }

    async fn provisioned(&self, target: &SshInfo) -> bool {
        let mut args = ssh_args(target, &self.key, true, false);
        args.push("cloud-init status 2>/dev/null || true".into());
        match process::run("ssh", &args).await {
            Ok(out) => cloud_init_finished(&out),
            Err(_) => false,
        }
    }
}

/// `done`, `error` and `disabled` are all terminal. A failed first boot still
/// counts as finished; the operator finds out on first use.
fn cloud_init_finished(status_output: &str) -> bool {
    status_output.lines().any(|line| {
        matches!(
            line.trim().strip_prefix("status:").map(str::trim),
            Some("done" | "error" | "disabled")
        )
    })
}

/// A connection recipe for one VM plus the secrets to inject.
pub struct Session {
    target: SshInfo,
    key: PathBuf,
}

impl Session {
    pub fn new(target: SshInfo, key: PathBuf) -> Self {
        Self { target, key }
    }

    /// Write a one-shot env file in the guest and return its path. An empty
    /// set still writes the file so the `.` that consumes it succeeds.
    pub async fn upload_env(&self, vars: &BTreeMap<String, String>) -> Result<String> {
        let script = env_script(vars)?;
        let path = env_file();
        let mut args = ssh_args(&self.target, &self.key, true, false);
        args.push(format!(
            "umask 077 && mkdir -p \"$HOME/{ENV_DIR}\" && cat > \"{path}\""
        ));
        process::run_with_stdin("ssh", &args, script.as_bytes()).await?;
        tracing::debug!(host = %self.target.host, count = vars.len(), "uploaded env file");
        Ok(path)
    }

    /// Run `command` in the guest with secrets exported. Returns the remote
    /// exit code.
    pub async fn run(&self, vars: &BTreeMap<String, String>, command: &[String]) -> Result<i32> {
        if command.is_empty() {
            return Err(VmforkError::Validation {
                message: "no command given".into(),
            });
        }
        let env = self.upload_env(vars).await?;
        let mut args = ssh_args(&self.target, &self.key, false, false);
        args.push(run_line(&env, command));
        process::run_interactive("ssh", &args).await
    }

    /// Interactive login shell with secrets exported.
    pub async fn shell(&self, vars: &BTreeMap<String, String>) -> Result<i32> {
        let env = self.upload_env(vars).await?;
        let mut args = ssh_args(&self.target, &self.key, false, true);
        args.push(shell_line(&env));
        process::run_interactive("ssh", &args).await
    }

    /// Copy files with scp. Paths starting with `:` are in the guest.
    pub async fn copy(&self, from: &str, to: &str, recursive: bool) -> Result<()> {
        let mut args = common_opts(&self.key);
        args.extend(["-P".into(), self.target.port.to_string()]);
        if recursive {
            args.push("-r".into());
        }
        args.push(self.scp_path(from));
        args.push(self.scp_path(to));
        process::run("scp", &args).await?;
        Ok(())
    }

    fn scp_path(&self, path: &str) -> String {
        match path.strip_prefix(':') {
            Some(remote) => format!("{}@{}:{remote}", self.target.user, self.target.host),
            None => path.to_string(),
        }
    }
}

/// Make sure the installation keypair exists at `path` (private) and
/// `path.pub`, returning the OpenSSH public key line.
pub async fn ensure_keypair(path: &Path) -> Result<String> {
    let pub_path = path.with_extension("pub");
    if path.exists()
        && let Ok(public) = tokio::fs::read_to_string(&pub_path).await
    {
        return Ok(public.trim().to_string());
    }

    let key_err = |e: ssh_key::Error| VmforkError::KeyStore {
        message: format!("generating SSH key: {e}"),
    };
    let mut key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(key_err)?;
    key.set_comment("vmfork");
    let private = key.to_openssh(LineEnding::LF).map_err(key_err)?;
    let public = key.public_key().to_openssh().map_err(key_err)?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| VmforkError::io(format!("creating {}", parent.display()), e))?;
    }
    write_private(path, private.as_bytes()).await?;
    tokio::fs::write(&pub_path, format!("{public}\n"))
        .await
        .map_err(|e| VmforkError::io(format!("writing {}", pub_path.display()), e))?;

    tracing::info!(path = %path.display(), "generated SSH keypair");
    Ok(public)
}

async fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(0o600);
    let mut file = opts
        .open(path)
        .await
        .map_err(|e| VmforkError::io(format!("writing {}", path.display()), e))?;
    file.write_all(contents)
        .await
        .map_err(|e| VmforkError::io(format!("writing {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SshInfo {
        SshInfo {
            host: "10.0.0.9".into(),
            port: 2222,
            user: "agent".into(),
        }
    }

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn env_script_exports_quoted_values() {
        let vars: BTreeMap<String, String> = [
            ("TOKEN".to_string(), "a'b $HOME".to_string()),
            ("EMPTY".to_string(), String::new()),
        ]
        .into_iter()
        .collect();
        let script = env_script(&vars).unwrap();
        assert_eq!(script, "export EMPTY=''\nexport TOKEN='a'\\''b $HOME'\n");
    }

    #[test]
    fn env_script_rejects_bad_names() {
        let vars: BTreeMap<String, String> =
            [("BAD-NAME".to_string(), "x".to_string())].into_iter().collect();
        assert!(env_script(&vars).is_err());
    }

    #[test]
    fn env_file_is_removed_before_the_command_runs() {
        let env = "$HOME/.vmfork/env.00000000000000ff";
        let line = run_line(env, &["make".to_string(), "test".to_string()]);
        assert_eq!(
            line,
            ". \"$HOME/.vmfork/env.00000000000000ff\"; rm -f \"$HOME/.vmfork/env.00000000000000ff\"; make test"
        );
        let shell = shell_line(env);
        assert!(shell.starts_with(&format!(". \"{env}\"; rm -f \"{env}\"; ")));
        assert!(shell.ends_with("-l"));
    }

    #[test]
    fn every_session_gets_its_own_env_file() {
        let a = env_file();
        assert!(a.starts_with("$HOME/.vmfork/env."));
        assert_ne!(a, env_file());
    }

    #[test]
    fn ssh_args_target_and_options() {
        let args = ssh_args(&target(), Path::new("/keys/id"), true, false);
        assert_eq!(args.last().unwrap(), "agent@10.0.0.9");
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.windows(2).any(|w| w == ["-p", "2222"]));
        assert!(!args.contains(&"-t".to_string()));
    }

    #[test]
    fn scp_paths_with_colon_are_remote() {
        let session = Session::new(target(), PathBuf::from("/keys/id"));
        assert_eq!(session.scp_path(":/srv/app"), "agent@10.0.0.9:/srv/app");
        assert_eq!(session.scp_path("./local"), "./local");
    }

    #[test]
    fn cloud_init_terminal_states() {
        assert!(cloud_init_finished("status: done"));
        assert!(cloud_init_finished("\nstatus: error\n"));
        assert!(!cloud_init_finished("status: running"));
        assert!(!cloud_init_finished(""));
    }

    #[tokio::test]
    async fn keypair_is_generated_once() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ssh").join("id_ed25519");
        let first = ensure_keypair(&path).await.unwrap();
        assert!(first.starts_with("ssh-ed25519 "));
        let second = ensure_keypair(&path).await.unwrap();
        assert_eq!(first, second);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
