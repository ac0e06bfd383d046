//! The compiled-in provider set, in detection priority order.

use std::sync::Arc;

use super::Provider;
use super::hyperv::HypervProvider;
use super::native::NativeProvider;
use super::Settings;
use crate::config::Config;
use crate::error::{Result, VmforkError};

#[derive(Clone)]
pub struct ProviderSet {
    providers: Vec<Arc<dyn Provider>>,
}

impl ProviderSet {
    /// Every provider this build knows about: native, then libvirt, then
    /// Hyper-V.
    pub fn from_config(config: &Config) -> Self {
        let settings = Settings::from_config(config);
        let mut providers: Vec<Arc<dyn Provider>> = vec![Arc::new(NativeProvider::new(
            config.native.clone(),
            settings.clone(),
        ))];
        #[cfg(target_os = "linux")]
        providers.push(Arc::new(super::libvirt::LibvirtProvider::new(
            config.libvirt.clone(),
            settings.clone(),
        )));
        providers.push(Arc::new(HypervProvider::new(config.hyperv.clone(), settings)));
        Self { providers }
    }

    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self { providers }
    }

    pub fn all(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }

    /// The first available provider in priority order.
    pub async fn detect(&self) -> Result<Arc<dyn Provider>> {
        for provider in &self.providers {
            if provider.available().await {
                tracing::debug!(provider = provider.name(), "detected provider");
                return Ok(provider.clone());
            }
            tracing::debug!(provider = provider.name(), "provider not available");
        }
        let hint = self
            .providers
            .iter()
            .map(|p| format!("{}: {}", p.name(), p.install_hint()))
            .collect::<Vec<_>>()
            .join("\n");
        Err(VmforkError::ProviderUnavailable {
            name: "any".into(),
            hint,
        })
    }

    /// Look a provider up by name without probing it.
    pub fn by_name(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .iter()
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| VmforkError::UnknownProvider {
                name: name.to_string(),
            })
    }

    /// Look a provider up by name and insist that it is usable here.
    pub async fn require(&self, name: &str) -> Result<Arc<dyn Provider>> {
        let provider = self.by_name(name)?;
        if !provider.available().await {
            return Err(VmforkError::ProviderUnavailable {
                name: name.to_string(),
                hint: provider.install_hint().to_string(),
            });
        }
        Ok(provider)
    }

    /// `auto` detects; anything else must name an available provider.
    pub async fn resolve(&self, choice: &str) -> Result<Arc<dyn Provider>> {
        match choice {
            "auto" => self.detect().await,
            name => self.require(name).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProvider;

    fn set(root: &std::path::Path, available: &[bool]) -> ProviderSet {
        let names = ["native", "libvirt", "hyperv"];
        ProviderSet::new(
            available
                .iter()
                .zip(names)
                .map(|(&up, name)| {
                    let fake = if up {
                        FakeProvider::new(name, root)
                    } else {
                        FakeProvider::unavailable(name, root)
                    };
                    Arc::new(fake) as Arc<dyn Provider>
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn detection_follows_priority_order() {
        let tmp = tempfile::tempdir().unwrap();
        let providers = set(tmp.path(), &[false, true, true]);
        assert_eq!(providers.detect().await.unwrap().name(), "libvirt");
        assert_eq!(providers.resolve("auto").await.unwrap().name(), "libvirt");
    }

    #[tokio::test]
    async fn nothing_available_lists_every_hint() {
        let tmp = tempfile::tempdir().unwrap();
        let providers = set(tmp.path(), &[false, false, false]);
        match providers.detect().await {
            Err(VmforkError::ProviderUnavailable { hint, .. }) => {
                for name in ["native", "libvirt", "hyperv"] {
                    assert!(hint.contains(name), "{hint}");
                }
            }
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(p) => panic!("unexpected provider {}", p.name()),
        }
    }

    #[tokio::test]
    async fn explicit_choice_must_be_available() {
        let tmp = tempfile::tempdir().unwrap();
        let providers = set(tmp.path(), &[true, false, true]);
        assert_eq!(providers.resolve("hyperv").await.unwrap().name(), "hyperv");
        assert!(matches!(
            providers.resolve("libvirt").await,
            Err(VmforkError::ProviderUnavailable { .. })
        ));
        assert!(matches!(
            providers.resolve("virtualbox").await,
            Err(VmforkError::UnknownProvider { .. })
        ));
        // Lookup by name never probes.
        assert_eq!(providers.by_name("libvirt").unwrap().name(), "libvirt");
    }

    #[tokio::test]
    async fn compiled_in_providers_report_unavailable_without_tooling() {
        let mut config = Config::default();
        config.native.helper = "vmfork-helper-that-does-not-exist".into();
        let providers = ProviderSet::from_config(&config);
        assert!(!providers.by_name("native").unwrap().available().await);
        if !cfg!(windows) {
            assert!(!providers.by_name("hyperv").unwrap().available().await);
        }
    }
}
