//! Encrypted credential storage with global and per-project scopes.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::instrument;

use crate::error::{Result, VmforkError};
use crate::registry::Registry;

pub mod cipher;
pub mod custodian;

pub use custodian::KeyCustodian;

/// Scope under which global values are stored.
pub const GLOBAL: &str = "";

pub struct SecretBackend {
    registry: Registry,
    custodian: Arc<dyn KeyCustodian>,
    key: OnceCell<cipher::Key>,
}

impl SecretBackend {
    pub fn new(registry: Registry, custodian: Arc<dyn KeyCustodian>) -> Self {
        Self {
            registry,
            custodian,
            key: OnceCell::new(),
        }
    }

    async fn key(&self) -> Result<&cipher::Key> {
        self.key
            .get_or_try_init(|| self.custodian.get_or_create_key())
            .await
    }

    #[instrument(skip(self, value))]
    pub async fn set(&self, name: &str, value: &str, scope: Option<&str>) -> Result<()> {
        validate_env_name(name)?;
        let scope = scope.unwrap_or(GLOBAL);
        let blob = cipher::seal(self.key().await?, value.as_bytes()).map_err(|_| {
            VmforkError::KeyStore {
                message: format!("encrypting secret '{name}' failed"),
            }
        })?;
        self.registry.put_secret(name, scope, &blob).await
    }

    pub async fn get(&self, name: &str, scope: Option<&str>) -> Result<String> {
        let scope = scope.unwrap_or(GLOBAL);
        let blob = self.registry.get_secret(name, scope).await?.ok_or_else(|| {
            VmforkError::SecretNotFound {
                name: name.to_string(),
                scope: scope.to_string(),
            }
        })?;
        self.decrypt(name, scope, &blob).await
    }

    /// Delete an entry. Absent entries are not an error.
    pub async fn remove(&self, name: &str, scope: Option<&str>) -> Result<bool> {
        self.registry
            .delete_secret(name, scope.unwrap_or(GLOBAL))
            .await
    }

    /// Names only; values are never listed in bulk.
    pub async fn list(&self, scope: Option<&str>) -> Result<Vec<String>> {
        self.registry.secret_names(scope.unwrap_or(GLOBAL)).await
    }

    /// Everything visible to `project`: global entries, then the project's own
    /// entries on top.
    #[instrument(skip(self))]
    pub async fn resolve(&self, project: &str) -> Result<BTreeMap<String, String>> {
        let mut merged = BTreeMap::new();
        let mut layers = vec![GLOBAL];
        if !project.is_empty() {
            layers.push(project);
        }
        for scope in layers {
            for (name, blob) in self.registry.secrets_in_scope(scope).await? {
                let value = self.decrypt(&name, scope, &blob).await?;
                merged.insert(name, value);
            }
        }
        tracing::debug!(count = merged.len(), "resolved secrets");
        Ok(merged)
    }

    async fn decrypt(&self, name: &str, scope: &str, blob: &[u8]) -> Result<String> {
        let failed = || VmforkError::DecryptionFailed {
            name: name.to_string(),
            scope: scope.to_string(),
        };
        let plain = cipher::open(self.key().await?, blob).map_err(|_| failed())?;
        String::from_utf8(plain).map_err(|_| failed())
    }
}

/// Whether `name` can be exported as a shell variable.
pub fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

pub fn validate_env_name(name: &str) -> Result<()> {
    if is_env_name(name) {
        Ok(())
    } else {
        Err(VmforkError::Validation {
            message: format!(
                "secret name '{name}' must be a shell identifier (letters, digits, '_', not starting with a digit)"
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixedKey;

    async fn backend() -> (SecretBackend, Registry, Arc<FixedKey>) {
        let registry = Registry::new_in_memory().await.unwrap();
        let custodian = Arc::new(FixedKey::default());
        let backend = SecretBackend::new(registry.clone(), custodian.clone());
        (backend, registry, custodian)
    }

    #[tokio::test]
    async fn project_scope_overrides_global() {
        let (secrets, _, _) = backend().await;
        secrets.set("A", "1", None).await.unwrap();
        secrets.set("B", "2", None).await.unwrap();
        secrets.set("B", "9", Some("web")).await.unwrap();
        secrets.set("C", "3", Some("web")).await.unwrap();
        secrets.set("D", "other", Some("api")).await.unwrap();

        let resolved = secrets.resolve("web").await.unwrap();
        let expected: BTreeMap<String, String> = [("A", "1"), ("B", "9"), ("C", "3")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(resolved, expected);
    }

    #[tokio::test]
    async fn plaintext_is_never_stored() {
        let (secrets, registry, _) = backend().await;
        secrets.set("TOKEN", "ghp_plaintext", None).await.unwrap();
        let blob = registry.get_secret("TOKEN", "").await.unwrap().unwrap();
        assert!(
            !blob
                .windows(b"ghp_plaintext".len())
                .any(|w| w == b"ghp_plaintext")
        );
        assert_eq!(secrets.get("TOKEN", None).await.unwrap(), "ghp_plaintext");
    }

    #[tokio::test]
    async fn empty_and_delimiter_values_survive() {
        let (secrets, _, _) = backend().await;
        for value in ["", "a=b", "line1\nline2", "it's \"quoted\"", "\0\u{1}"] {
            secrets.set("V", value, None).await.unwrap();
            assert_eq!(secrets.get("V", None).await.unwrap(), value);
        }
    }

    #[tokio::test]
    async fn tampered_value_fails_decryption() {
        let (secrets, registry, _) = backend().await;
        secrets.set("TOKEN", "s3cret", Some("web")).await.unwrap();
        let mut blob = registry.get_secret("TOKEN", "web").await.unwrap().unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x80;
        registry.put_secret("TOKEN", "web", &blob).await.unwrap();

        let err = secrets.get("TOKEN", Some("web")).await.unwrap_err();
        assert!(matches!(err, VmforkError::DecryptionFailed { .. }));
        assert!(matches!(
            secrets.resolve("web").await,
            Err(VmforkError::DecryptionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn missing_secret_is_not_found_and_remove_is_quiet() {
        let (secrets, _, _) = backend().await;
        assert!(matches!(
            secrets.get("NOPE", None).await,
            Err(VmforkError::SecretNotFound { .. })
        ));
        assert!(!secrets.remove("NOPE", None).await.unwrap());
    }

    #[tokio::test]
    async fn list_returns_names_for_one_scope() {
        let (secrets, _, _) = backend().await;
        secrets.set("B", "x", None).await.unwrap();
        secrets.set("A", "x", None).await.unwrap();
        secrets.set("C", "x", Some("web")).await.unwrap();
        assert_eq!(secrets.list(None).await.unwrap(), vec!["A", "B"]);
        assert_eq!(secrets.list(Some("web")).await.unwrap(), vec!["C"]);
    }

    #[tokio::test]
    async fn key_is_fetched_once() {
        let (secrets, _, custodian) = backend().await;
        secrets.set("A", "1", None).await.unwrap();
        secrets.set("B", "2", None).await.unwrap();
        secrets.get("A", None).await.unwrap();
        assert_eq!(custodian.calls(), 1);
    }

    #[test]
    fn env_names() {
        assert!(is_env_name("GITHUB_TOKEN"));
        assert!(is_env_name("_x1"));
        assert!(!is_env_name("1ABC"));
        assert!(!is_env_name("A-B"));
        assert!(!is_env_name(""));
        assert!(validate_env_name("A B").is_err());
    }
}
