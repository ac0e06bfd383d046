//! Bounded readiness polling.
//!
//! A freshly launched VM goes through three observable milestones: it gets an
//! address, it answers SSH, and (for projects only) first-boot provisioning
//! finishes. Each is polled independently with its own [`Policy`]. Running
//! out of time is never an error here; the caller gets `None`/`false` and
//! decides what to do with a slow guest.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::provider::SshInfo;

/// Fixed retry interval plus an overall deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Policy {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub const fn from_secs(interval: u64, timeout: u64) -> Self {
        Self::new(Duration::from_secs(interval), Duration::from_secs(timeout))
    }
}

/// Call `probe` until it yields a value or `policy.timeout` elapses.
///
/// The probe always runs at least once, and once more right at the deadline.
pub async fn poll_until<T, F, Fut>(label: &str, policy: Policy, mut probe: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        if let Some(value) = probe().await {
            tracing::debug!(label, attempts, "ready");
            return Some(value);
        }

        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(
                label,
                attempts,
                timeout_s = policy.timeout.as_secs(),
                "gave up waiting"
            );
            return None;
        }

        tracing::debug!(label, attempts, "not ready, retrying");
        tokio::time::sleep(policy.interval.min(deadline - now)).await;
    }
}

/// Poll an address lookup until it reports an IP.
pub async fn wait_for_ip<F, Fut>(policy: Policy, lookup: F) -> Option<String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<String>>,
{
    poll_until("ip", policy, lookup).await
}

/// Checks a guest over its SSH endpoint.
#[async_trait]
pub trait GuestProbe: Send + Sync {
    /// A trivial authenticated no-op succeeds.
    async fn reachable(&self, target: &SshInfo) -> bool;

    /// First-boot provisioning has finished (successfully or not).
    async fn provisioned(&self, target: &SshInfo) -> bool;
}

pub async fn wait_for_ssh(probe: &dyn GuestProbe, target: &SshInfo, policy: Policy) -> bool {
    poll_until("ssh", policy, move || async move {
        probe.reachable(target).await.then_some(())
    })
    .await
    .is_some()
}

pub async fn wait_for_provisioning(
    probe: &dyn GuestProbe,
    target: &SshInfo,
    policy: Policy,
) -> bool {
    poll_until("provisioning", policy, move || async move {
        probe.provisioned(target).await.then_some(())
    })
    .await
    .is_some()
}

/// What a launch observed before returning. All fields degrade gracefully:
/// `ip: None` means "not yet reachable", not failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    pub ip: Option<String>,
    pub ssh: bool,
    /// `None` when provisioning was not awaited (task clones, restarts).
    pub provisioned: Option<bool>,
}
