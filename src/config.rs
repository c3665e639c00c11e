use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SisyphusError};
use crate::matrix::Os;

/// Retry and backoff settings.
///
/// Used both for build attempts and, with a separate instance, for calls to
/// the code-hosting service.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts allowed, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, jitter included
    pub max_delay_ms: u64,
    /// Relative jitter applied to each delay (0.2 = +/-20%)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 5_000,
            max_delay_ms: 120_000,
            jitter: 0.2,
        }
    }
}

/// Channel pool settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// How long [`ChannelPool::acquire`](crate::pool::ChannelPool::acquire)
    /// waits for a matching channel
    pub acquire_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Interval between health probes of idle channels
    pub health_interval_ms: u64,
    /// Timeout of a single health probe
    pub health_timeout_ms: u64,
    /// Consecutive failures after which a channel is considered dead
    pub dead_after_failures: u32,
    /// How long a dead host is skipped before one lease may try it again
    pub dead_cooldown_ms: u64,
    /// Timeout of each host preparation command that sets none itself
    pub prepare_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 60_000,
            connect_timeout_ms: 10_000,
            health_interval_ms: 30_000,
            health_timeout_ms: 5_000,
            dead_after_failures: 3,
            dead_cooldown_ms: 5 * 60 * 1000,
            prepare_timeout_ms: 60 * 60 * 1000,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn dead_cooldown(&self) -> Duration {
        Duration::from_millis(self.dead_cooldown_ms)
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms)
    }
}

/// Settings for one scheduler run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Timeout for a build step that does not declare its own
    pub step_timeout_ms: u64,
    /// Timeout for artifact downloads
    pub transfer_timeout_ms: u64,
    /// Wall-clock limit for a single attempt before it is forcibly failed
    pub job_timeout_ms: u64,
    /// Wall-clock limit for the whole run, if any
    pub run_timeout_ms: Option<u64>,
    /// Time a cancelled job gets to stop its remote command
    pub cancel_grace_ms: u64,
    /// A job queued for longer than this is reported as stale
    pub queue_stale_after_ms: u64,
    /// Bytes of combined output kept per job
    pub log_limit_bytes: usize,
    /// Number of log lines included in a failure excerpt
    pub excerpt_lines: usize,
    /// Reject targets whose capability tags no inventory host provides
    pub strict_capabilities: bool,
    /// Local directory to download artifacts into, if any
    pub artifact_dir: Option<PathBuf>,
    pub retry: RetryConfig,
    pub pool: PoolConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: 4 * 60 * 60 * 1000,
            transfer_timeout_ms: 15 * 60 * 1000,
            job_timeout_ms: 8 * 60 * 60 * 1000,
            run_timeout_ms: None,
            cancel_grace_ms: 15_000,
            queue_stale_after_ms: 10 * 60 * 1000,
            log_limit_bytes: 256 * 1024,
            excerpt_lines: 40,
            strict_capabilities: true,
            artifact_dir: None,
            retry: RetryConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = Some(dir.into());
        self
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn queue_stale_after(&self) -> Duration {
        Duration::from_millis(self.queue_stale_after_ms)
    }
}

/// Short-lived credential handed in by the caller. Never written anywhere and
/// redacted from debug output.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Settings for publishing results to the code-hosting service.
#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub api_url: String,
    pub uploads_url: String,
    /// Prefix of every commit status context
    pub context_prefix: String,
    /// Link attached to commit statuses, e.g. the CI job page
    pub details_url: Option<String>,
    pub request_timeout_ms: u64,
    pub retry: RetryConfig,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            uploads_url: "https://uploads.github.com".to_string(),
            context_prefix: "sisyphus".to_string(),
            details_url: None,
            request_timeout_ms: 30_000,
            retry: RetryConfig {
                max_attempts: 4,
                base_delay_ms: 1_000,
                max_delay_ms: 15_000,
                jitter: 0.2,
            },
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_max_channels() -> usize {
    1
}

/// One-time setup of a build host, e.g. creating the conda environment the
/// build steps activate.
///
/// Runs on the first channel opened to the host, before any build is leased
/// there. With a `marker`, a host prepared by an earlier run is recognised by
/// the marker file and the commands are skipped.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostPrepare {
    pub commands: Vec<String>,
    /// Remote file created once every command succeeded
    #[serde(default)]
    pub marker: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl HostPrepare {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// One build host from the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostSpec {
    pub name: String,
    /// IP or FQDN
    pub address: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Reference to the SSH key used for this host; the key itself is never read
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    pub os: Os,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Upper bound on channels opened to this host at once
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,
    #[serde(default)]
    pub prepare: Option<HostPrepare>,
}

impl HostSpec {
    pub fn new(name: impl Into<String>, address: impl Into<String>, os: Os) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            user: None,
            port: default_port(),
            identity_file: None,
            os,
            tags: BTreeSet::new(),
            max_channels: default_max_channels(),
            prepare: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_max_channels(mut self, max: usize) -> Self {
        self.max_channels = max;
        self
    }

    pub fn with_prepare(mut self, prepare: HostPrepare) -> Self {
        self.prepare = Some(prepare);
        self
    }

    /// Declared tags plus the implicit `os:<os>` tag.
    pub fn capabilities(&self) -> BTreeSet<String> {
        let mut caps = self.tags.clone();
        caps.insert(format!("os:{}", self.os));
        caps
    }

    /// Set inclusion: the host serves a target when it has every required tag.
    pub fn provides(&self, required: &BTreeSet<String>) -> bool {
        let caps = self.capabilities();
        required.iter().all(|tag| caps.contains(tag))
    }

    /// `user@address` as understood by ssh
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.address),
            None => self.address.clone(),
        }
    }
}

/// The host inventory document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostInventory {
    pub hosts: Vec<HostSpec>,
}

impl HostInventory {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| SisyphusError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let inventory: Self =
            serde_yaml::from_str(&text).map_err(|source| SisyphusError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        inventory.validate()?;
        Ok(inventory)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(SisyphusError::Inventory("no hosts defined".to_string()));
        }
        let mut names = HashSet::new();
        for host in &self.hosts {
            if !names.insert(host.name.as_str()) {
                return Err(SisyphusError::Inventory(format!(
                    "duplicate host name '{}'",
                    host.name
                )));
            }
            if host.address.trim().is_empty() {
                return Err(SisyphusError::Inventory(format!(
                    "host '{}' has an empty address",
                    host.name
                )));
            }
            if host.max_channels == 0 {
                return Err(SisyphusError::Inventory(format!(
                    "host '{}' allows zero channels",
                    host.name
                )));
            }
            if host.prepare.as_ref().is_some_and(|p| p.commands.is_empty()) {
                return Err(SisyphusError::Inventory(format!(
                    "host '{}' has a prepare section without commands",
                    host.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_config_default() {
        let cfg = RunConfig::default();
        assert!(cfg.run_timeout().is_none());
        assert!(cfg.strict_capabilities);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.pool.dead_after_failures, 3);
        assert!(cfg.artifact_dir.is_none());
    }

    #[test]
    fn run_config_builders() {
        let cfg = RunConfig::default()
            .with_run_timeout(Duration::from_secs(90))
            .with_artifact_dir("/tmp/out");
        assert_eq!(cfg.run_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(cfg.artifact_dir, Some(PathBuf::from("/tmp/out")));
    }

    #[test]
    fn secret_is_redacted() {
        let secret = Secret::new("ghp_abcdef");
        assert_eq!(format!("{:?}", secret), "Secret(***)");
        assert_eq!(secret.expose(), "ghp_abcdef");
    }

    #[test]
    fn host_capabilities_include_os() {
        let host = HostSpec::new("gpu-1", "10.0.0.5", Os::Linux).with_tag("cuda:12.4");
        let caps = host.capabilities();
        assert!(caps.contains("os:linux"));
        assert!(caps.contains("cuda:12.4"));
    }

    #[test]
    fn host_provides_is_set_inclusion() {
        let host = HostSpec::new("gpu-1", "10.0.0.5", Os::Linux)
            .with_tag("arch:x86_64")
            .with_tag("cuda:12.4")
            .with_tag("cuda:11.8");

        let required: BTreeSet<String> = ["os:linux", "cuda:11.8"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(host.provides(&required));

        let missing: BTreeSet<String> = ["os:linux", "cuda:12.1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(!host.provides(&missing));
        assert!(host.provides(&BTreeSet::new()));
    }

    #[test]
    fn host_destination() {
        let mut host = HostSpec::new("gpu-1", "build.example.com", Os::Linux);
        assert_eq!(host.destination(), "build.example.com");
        host.user = Some("ec2-user".to_string());
        assert_eq!(host.destination(), "ec2-user@build.example.com");
    }

    #[test]
    fn inventory_parses_yaml() {
        let yaml = r#"
hosts:
  - name: linux-1
    address: 10.0.0.5
    user: ec2-user
    os: linux
    tags: ["arch:x86_64", "cuda:12.4"]
    max_channels: 2
  - name: win-1
    address: 10.0.0.6
    os: windows
"#;
        let inventory: HostInventory = serde_yaml::from_str(yaml).unwrap();
        inventory.validate().unwrap();
        assert_eq!(inventory.hosts.len(), 2);
        assert_eq!(inventory.hosts[0].max_channels, 2);
        assert_eq!(inventory.hosts[1].port, 22);
        assert_eq!(inventory.hosts[1].max_channels, 1);
        assert_eq!(inventory.hosts[1].os, Os::Windows);
    }

    #[test]
    fn inventory_rejects_duplicates() {
        let inventory = HostInventory {
            hosts: vec![
                HostSpec::new("a", "10.0.0.1", Os::Linux),
                HostSpec::new("a", "10.0.0.2", Os::Linux),
            ],
        };
        assert!(matches!(
            inventory.validate(),
            Err(SisyphusError::Inventory(_))
        ));
    }

    #[test]
    fn inventory_parses_host_preparation() {
        let yaml = r#"
hosts:
  - name: linux-1
    address: 10.0.0.5
    os: linux
    prepare:
      commands:
        - "conda create -y -n sisyphus conda-build anaconda-client conda-package-handling"
      marker: /tmp/sisyphus/conda.ready
      timeout_secs: 1800
"#;
        let inventory: HostInventory = serde_yaml::from_str(yaml).unwrap();
        inventory.validate().unwrap();
        let prepare = inventory.hosts[0].prepare.as_ref().unwrap();
        assert_eq!(prepare.commands.len(), 1);
        assert_eq!(prepare.marker.as_deref(), Some("/tmp/sisyphus/conda.ready"));
        assert_eq!(prepare.timeout(), Some(Duration::from_secs(1800)));
    }

    #[test]
    fn inventory_rejects_prepare_without_commands() {
        let host = HostSpec::new("a", "10.0.0.1", Os::Linux).with_prepare(HostPrepare {
            commands: vec![],
            marker: None,
            timeout_secs: None,
        });
        let inventory = HostInventory { hosts: vec![host] };
        assert!(matches!(
            inventory.validate(),
            Err(SisyphusError::Inventory(_))
        ));
    }

    #[test]
    fn inventory_rejects_empty() {
        let inventory = HostInventory { hosts: vec![] };
        assert!(inventory.validate().is_err());
    }
}
