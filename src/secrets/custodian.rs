//! Platform storage for the installation's secret key.
//!
//! Every variant follows the same first-use protocol: look the key up; if it
//! is absent, generate one, try to store it, then read back whatever the store
//! now holds. Two processes racing on first use therefore both end up with the
//! key that actually got persisted.

use std::path::PathBuf;
use std::sync::Arc;

use aes_gcm::aead::OsRng;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand_core::RngCore;

use super::cipher::Key;
use crate::config::SecretsConfig;
use crate::error::{Result, VmforkError};
use crate::{paths, process};

const SERVICE: &str = "vmfork";
const ACCOUNT: &str = "installation-key";

#[async_trait]
pub trait KeyCustodian: Send + Sync {
    fn name(&self) -> &'static str;

    /// Return the stable 256-bit key, generating and persisting it on first use.
    async fn get_or_create_key(&self) -> Result<Key>;
}

/// Pick the custodian named in config. `auto` prefers the OS credential store.
pub fn from_config(config: &SecretsConfig) -> Result<Arc<dyn KeyCustodian>> {
    let store = match config.key_store.as_str() {
        "auto" if cfg!(target_os = "macos") => "keychain",
        "auto" if cfg!(target_os = "linux") && process::which("secret-tool").is_some() => {
            "secret-service"
        }
        "auto" => "file",
        other => other,
    };
    tracing::debug!(store, "using key store");
    match store {
        "keychain" => Ok(Arc::new(Keychain)),
        "secret-service" => Ok(Arc::new(SecretService)),
        "file" => Ok(Arc::new(KeyFile::new(paths::key_file_path()))),
        other => Err(VmforkError::Validation {
            message: format!("unknown key store '{other}'"),
        }),
    }
}

fn generate() -> Key {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

fn encode(key: &Key) -> String {
    BASE64.encode(key)
}

fn decode(text: &str) -> Result<Key> {
    let bytes = BASE64
        .decode(text.trim())
        .map_err(|e| VmforkError::KeyStore {
            message: format!("stored key is not valid base64: {e}"),
        })?;
    bytes.try_into().map_err(|b: Vec<u8>| VmforkError::KeyStore {
        message: format!("stored key is {} bytes, expected 32", b.len()),
    })
}

/// `security -i` reads commands from stdin, which keeps the key out of argv.
fn keychain_add_command(encoded_key: &str) -> String {
    format!("add-generic-password -s \"{SERVICE}\" -a \"{ACCOUNT}\" -w \"{encoded_key}\"\n")
}

/// macOS login keychain via `security`.
pub struct Keychain;

impl Keychain {
    async fn lookup(&self) -> Option<String> {
        process::run(
            "security",
            ["find-generic-password", "-s", SERVICE, "-a", ACCOUNT, "-w"],
        )
        .await
        .ok()
        .filter(|s| !s.is_empty())
    }
}

#[async_trait]
impl KeyCustodian for Keychain {
    fn name(&self) -> &'static str {
        "keychain"
    }

    async fn get_or_create_key(&self) -> Result<Key> {
        if let Some(text) = self.lookup().await {
            return decode(&text);
        }
        let fresh = encode(&generate());
        // Without -U this fails if another process stored a key first.
        if let Err(e) =
            process::run_with_stdin("security", ["-i"], keychain_add_command(&fresh).as_bytes())
                .await
        {
            tracing::debug!(error = %e, "keychain add failed, reading back");
        }
        let stored = self.lookup().await.ok_or_else(|| VmforkError::KeyStore {
            message: "keychain has no vmfork key after storing one".into(),
        })?;
        decode(&stored)
    }
}

/// freedesktop Secret Service via `secret-tool`.
pub struct SecretService;

impl SecretService {
    async fn lookup(&self) -> Option<String> {
        process::run(
            "secret-tool",
            ["lookup", "service", SERVICE, "account", ACCOUNT],
        )
        .await
        .ok()
        .filter(|s| !s.is_empty())
    }
}

#[async_trait]
impl KeyCustodian for SecretService {
    fn name(&self) -> &'static str {
        "secret-service"
    }

    async fn get_or_create_key(&self) -> Result<Key> {
        if let Some(text) = self.lookup().await {
            return decode(&text);
        }
        let fresh = encode(&generate());
        process::run_with_stdin(
            "secret-tool",
            [
                "store",
                "--label=vmfork installation key",
                "service",
                SERVICE,
                "account",
                ACCOUNT,
            ],
            fresh.as_bytes(),
        )
        .await?;
        let stored = self.lookup().await.ok_or_else(|| VmforkError::KeyStore {
            message: "secret service has no vmfork key after storing one".into(),
        })?;
        decode(&stored)
    }
}

/// A user-only file. On Windows the contents are DPAPI-protected for the
/// current user; elsewhere the file is created with mode 0600.
pub struct KeyFile {
    path: PathBuf,
}

impl KeyFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn read(&self) -> Result<Option<Key>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(VmforkError::io(
                    format!("reading key file {}", self.path.display()),
                    e,
                ));
            }
        };
        let text = if cfg!(windows) {
            dpapi("Unprotect", text.trim()).await?
        } else {
            text
        };
        decode(&text).map(Some)
    }

    async fn write_tmp(&self, tmp: &std::path::Path, contents: &str) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let mut opts = tokio::fs::OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(unix)]
        opts.mode(0o600);
        let mut file = opts
            .open(tmp)
            .await
            .map_err(|e| VmforkError::io(format!("creating {}", tmp.display()), e))?;
        file.write_all(contents.as_bytes())
            .await
            .map_err(|e| VmforkError::io(format!("writing {}", tmp.display()), e))?;
        file.sync_all()
            .await
            .map_err(|e| VmforkError::io(format!("syncing {}", tmp.display()), e))?;
        Ok(())
    }
}

#[async_trait]
impl KeyCustodian for KeyFile {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn get_or_create_key(&self) -> Result<Key> {
        if let Some(key) = self.read().await? {
            return Ok(key);
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| VmforkError::io(format!("creating {}", parent.display()), e))?;
        }

        let fresh = encode(&generate());
        let contents = if cfg!(windows) {
            dpapi("Protect", &fresh).await?
        } else {
            fresh
        };

        // Fully write a private temp file, then link it into place. The link
        // fails if another process got there first, and we use theirs.
        let tmp = self
            .path
            .with_extension(format!("tmp.{}.{:08x}", std::process::id(), OsRng.next_u32()));
        self.write_tmp(&tmp, &contents).await?;
        let linked = tokio::fs::hard_link(&tmp, &self.path).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => tracing::info!(path = %self.path.display(), "created installation key"),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::debug!("lost key creation race, reading back");
            }
            Err(e) => {
                return Err(VmforkError::io(
                    format!("storing key file {}", self.path.display()),
                    e,
                ));
            }
        }

        self.read().await?.ok_or_else(|| VmforkError::KeyStore {
            message: format!("key file {} vanished", self.path.display()),
        })
    }
}

/// Round-trip base64 text through DPAPI (`Protect` or `Unprotect`) for the
/// current user. The payload travels over stdin.
async fn dpapi(direction: &str, text: &str) -> Result<String> {
    let script = format!(
        "Add-Type -AssemblyName System.Security; \
         $in = [Convert]::FromBase64String([Console]::In.ReadToEnd().Trim()); \
         $out = [Security.Cryptography.ProtectedData]::{direction}($in, $null, 'CurrentUser'); \
         [Convert]::ToBase64String($out)"
    );
    process::run_with_stdin(
        "powershell.exe",
        [
            "-NoProfile",
            "-NonInteractive",
            "-Command",
            script.as_str(),
        ],
        text.as_bytes(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_wrong_lengths() {
        assert!(decode(&BASE64.encode([1u8; 16])).is_err());
        assert!(decode("not base64!").is_err());
        assert_eq!(decode(&encode(&[9u8; 32])).unwrap(), [9u8; 32]);
    }

    #[test]
    fn keychain_key_travels_on_stdin() {
        let key = encode(&[7u8; 32]);
        let command = keychain_add_command(&key);
        assert_eq!(
            command,
            format!("add-generic-password -s \"vmfork\" -a \"installation-key\" -w \"{key}\"\n")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn key_file_is_stable_and_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("secret.key");
        let custodian = KeyFile::new(path.clone());

        let first = custodian.get_or_create_key().await.unwrap();
        let second = custodian.get_or_create_key().await.unwrap();
        assert_eq!(first, second);

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn concurrent_first_use_agrees_on_one_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.key");
        let custodians: Vec<_> = (0..8).map(|_| Arc::new(KeyFile::new(path.clone()))).collect();

        let keys = futures_util::future::join_all(
            custodians.iter().map(|c| c.get_or_create_key()),
        )
        .await;
        let keys: Vec<Key> = keys.into_iter().map(|k| k.unwrap()).collect();
        assert!(keys.windows(2).all(|w| w[0] == w[1]));
    }
}
