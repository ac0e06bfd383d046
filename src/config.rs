use std::path::Path;
use std::time::Duration;

use facet::Facet;

use crate::error::VmforkError;
use crate::readiness::Policy;

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct Config {
    /// Provider used for new projects: `auto`, `native`, `libvirt` or `hyperv`.
    #[facet(default = "auto")]
    pub provider: String,
    #[facet(default)]
    pub resources: ResourcesConfig,
    #[facet(default)]
    pub readiness: ReadinessConfig,
    #[facet(default)]
    pub ssh: SshConfig,
    #[facet(default)]
    pub provision: ProvisionConfig,
    #[facet(default)]
    pub libvirt: LibvirtConfig,
    #[facet(default)]
    pub native: NativeConfig,
    #[facet(default)]
    pub hyperv: HypervConfig,
    #[facet(default)]
    pub secrets: SecretsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: "auto".into(),
            resources: ResourcesConfig::default(),
            readiness: ReadinessConfig::default(),
            ssh: SshConfig::default(),
            provision: ProvisionConfig::default(),
            libvirt: LibvirtConfig::default(),
            native: NativeConfig::default(),
            hyperv: HypervConfig::default(),
            secrets: SecretsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ResourcesConfig {
    #[facet(default = 2)]
    pub cpus: u32,
    #[facet(default = 4096)]
    pub memory_mb: u64,
    #[facet(default = 40)]
    pub disk_gb: u64,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            cpus: 2,
            memory_mb: 4096,
            disk_gb: 40,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ReadinessConfig {
    #[facet(default = 3)]
    pub ip_interval_s: u64,
    #[facet(default = 90)]
    pub ip_timeout_s: u64,
    #[facet(default = 3)]
    pub ssh_interval_s: u64,
    #[facet(default = 120)]
    pub ssh_timeout_s: u64,
    #[facet(default = 5)]
    pub provision_interval_s: u64,
    #[facet(default = 600)]
    pub provision_timeout_s: u64,
    #[facet(default = 30)]
    pub stop_timeout_s: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            ip_interval_s: 3,
            ip_timeout_s: 90,
            ssh_interval_s: 3,
            ssh_timeout_s: 120,
            provision_interval_s: 5,
            provision_timeout_s: 600,
            stop_timeout_s: 30,
        }
    }
}

impl ReadinessConfig {
    pub fn ip(&self) -> Policy {
        Policy::from_secs(self.ip_interval_s, self.ip_timeout_s)
    }

    pub fn ssh(&self) -> Policy {
        Policy::from_secs(self.ssh_interval_s, self.ssh_timeout_s)
    }

    pub fn provision(&self) -> Policy {
        Policy::from_secs(self.provision_interval_s, self.provision_timeout_s)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_s)
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct SshConfig {
    #[facet(default = "agent")]
    pub user: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "agent".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct ProvisionConfig {
    #[facet(default)]
    pub packages: Vec<String>,
    #[facet(default)]
    pub script: String,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct LibvirtConfig {
    #[facet(default = "qemu:///system")]
    pub uri: String,
    #[facet(default = "default")]
    pub network: String,
    #[facet(default = "kvm")]
    pub domain_type: String,
    #[facet(default = "q35")]
    pub machine: String,
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".into(),
            network: "default".into(),
            domain_type: "kvm".into(),
            machine: "q35".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct NativeConfig {
    /// Helper binary that hosts one Virtualization.framework VM per process.
    #[facet(default = "vmfork-vz")]
    pub helper: String,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            helper: "vmfork-vz".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct HypervConfig {
    #[facet(default = "Default Switch")]
    pub switch: String,
}

impl Default for HypervConfig {
    fn default() -> Self {
        Self {
            switch: "Default Switch".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct SecretsConfig {
    /// `auto`, `keychain`, `secret-service` or `file`.
    #[facet(default = "auto")]
    pub key_store: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            key_store: "auto".into(),
        }
    }
}

pub const PROVIDER_NAMES: &[&str] = &["native", "libvirt", "hyperv"];
pub const KEY_STORES: &[&str] = &["auto", "keychain", "secret-service", "file"];

// ── validation ────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<(), VmforkError> {
    if config.provider != "auto" && !PROVIDER_NAMES.contains(&config.provider.as_str()) {
        return Err(VmforkError::UnknownProvider {
            name: config.provider.clone(),
        });
    }
    if config.resources.cpus < 1 {
        return Err(VmforkError::Validation {
            message: "cpus must be at least 1".into(),
        });
    }
    if config.resources.memory_mb < 512 {
        return Err(VmforkError::Validation {
            message: "memory_mb must be at least 512".into(),
        });
    }
    if !KEY_STORES.contains(&config.secrets.key_store.as_str()) {
        return Err(VmforkError::Validation {
            message: format!(
                "unknown key_store '{}' (expected one of: {})",
                config.secrets.key_store,
                KEY_STORES.join(", ")
            ),
        });
    }

    let r = &config.readiness;
    for (label, interval, timeout) in [
        ("ip", r.ip_interval_s, r.ip_timeout_s),
        ("ssh", r.ssh_interval_s, r.ssh_timeout_s),
        ("provision", r.provision_interval_s, r.provision_timeout_s),
    ] {
        if interval == 0 {
            return Err(VmforkError::Validation {
                message: format!("{label}_interval_s must be greater than 0"),
            });
        }
        if timeout < interval {
            return Err(VmforkError::Validation {
                message: format!("{label}_timeout_s must be at least {label}_interval_s"),
            });
        }
    }

    if config.ssh.user.is_empty() {
        return Err(VmforkError::Validation {
            message: "ssh user cannot be empty".into(),
        });
    }

    Ok(())
}

/// Validate a user-chosen project name or task id. These become directory
/// names, libvirt domain names and Hyper-V VM names.
pub fn validate_name(kind: &str, name: &str) -> Result<(), VmforkError> {
    let valid = name.len() <= 63
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(VmforkError::Validation {
            message: format!(
                "{kind} name must match [a-zA-Z0-9][a-zA-Z0-9._-]* and be at most 63 characters (got '{name}')"
            ),
        });
    }
    Ok(())
}

// ── public API ────────────────────────────────────────────

/// Load the config file. A missing file yields defaults unless the path was
/// given explicitly.
pub fn load_config(path: &Path, explicit: bool) -> Result<Config, VmforkError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Config::default());
        }
        Err(source) => {
            return Err(VmforkError::ConfigLoad {
                path: path.display().to_string(),
                source,
            });
        }
    };

    let config = parse_config(&contents).map_err(|message| VmforkError::ConfigParse {
        path: path.display().to_string(),
        message,
    })?;

    validate_config(&config)?;
    Ok(config)
}

fn parse_config(contents: &str) -> Result<Config, String> {
    facet_toml::from_str(contents).map_err(|e| e.to_string())
}
