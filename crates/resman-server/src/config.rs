//! TOML configuration for `resmand`.
//!
//! Resolution chain: CLI flag > env var > config file > default. The
//! file also seeds the resource-pool hierarchy, which a production
//! deployment would read from the config store on leader election.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use resman_api::{Resources, ResourcePoolConfig, SchedulingPolicy};
use resman_core::manager::ResourceManagerConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub framework: FrameworkSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub reconciler: ReconcilerSection,
    #[serde(default)]
    pub timers: TimersSection,
    #[serde(default)]
    pub queues: QueuesSection,
    #[serde(default)]
    pub pools: Vec<PoolSection>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_owned(),
            port: 5290,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FrameworkSection {
    pub stream_id: String,
    pub framework_id: String,
}

impl Default for FrameworkSection {
    fn default() -> Self {
        Self {
            stream_id: "resman-stream".to_owned(),
            framework_id: "resman".to_owned(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SchedulerSection {
    pub period_ms: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self { period_ms: 1_000 }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReconcilerSection {
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    pub period_ms: u64,
}

impl Default for ReconcilerSection {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            batch_interval_ms: 1_000,
            period_ms: 1_800_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TimersSection {
    pub launching_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for TimersSection {
    fn default() -> Self {
        Self {
            launching_timeout_ms: 120_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueuesSection {
    pub pool_queue_bound: usize,
    pub max_placements: usize,
    pub preemption_queue_bound: usize,
}

impl Default for QueuesSection {
    fn default() -> Self {
        Self {
            pool_queue_bound: 10_000,
            max_placements: 10_000,
            preemption_queue_bound: 10_000,
        }
    }
}

/// One resource-pool node as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub reservation: Resources,
    pub limit: Resources,
    #[serde(default = "default_share")]
    pub share: f64,
}

fn default_share() -> f64 {
    1.0
}

impl From<&PoolSection> for ResourcePoolConfig {
    fn from(section: &PoolSection) -> Self {
        ResourcePoolConfig {
            name: section.name.clone(),
            parent: section.parent.clone(),
            reservation: section.reservation,
            limit: section.limit,
            share: section.share,
            policy: SchedulingPolicy::PriorityFifo,
        }
    }
}

// -----------------------------------------------------------------------
// Read / write / resolve
// -----------------------------------------------------------------------

pub fn default_config_path() -> PathBuf {
    PathBuf::from("resmand.toml")
}

pub fn read_config(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

/// Write a commented starter config. Refuses to overwrite unless
/// `force`.
pub fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "config file {} already exists (use --force to overwrite)",
            path.display()
        );
    }
    let mut file = ConfigFile::default();
    file.pools = vec![
        PoolSection {
            name: "root".to_owned(),
            parent: None,
            reservation: Resources::new(100.0, 102_400.0, 1_048_576.0, 0.0),
            limit: Resources::new(100.0, 102_400.0, 1_048_576.0, 0.0),
            share: 1.0,
        },
        PoolSection {
            name: "default".to_owned(),
            parent: Some("root".to_owned()),
            reservation: Resources::new(100.0, 102_400.0, 1_048_576.0, 0.0),
            limit: Resources::new(100.0, 102_400.0, 1_048_576.0, 0.0),
            share: 1.0,
        },
    ];
    let rendered = toml::to_string_pretty(&file).context("failed to render default config")?;
    std::fs::write(path, rendered)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Resolved settings for the serve command.
pub struct ResolvedConfig {
    pub bind: String,
    pub port: u16,
    pub framework: FrameworkSection,
    pub manager: ResourceManagerConfig,
    pub pools: Vec<ResourcePoolConfig>,
}

impl ConfigFile {
    /// Apply the flag > env > file > default chain for the listen
    /// address and fold the sections into the manager config.
    pub fn resolve(self, bind_flag: Option<String>, port_flag: Option<u16>) -> ResolvedConfig {
        let bind = bind_flag
            .or_else(|| std::env::var("RESMAN_BIND").ok())
            .unwrap_or_else(|| self.server.bind.clone());
        let port = port_flag
            .or_else(|| {
                std::env::var("RESMAN_PORT")
                    .ok()
                    .and_then(|raw| raw.parse().ok())
            })
            .unwrap_or(self.server.port);

        let mut manager = ResourceManagerConfig::default();
        manager.scheduler.period = Duration::from_millis(self.scheduler.period_ms);
        manager.reconciler.batch_size = self.reconciler.batch_size;
        manager.reconciler.batch_interval = Duration::from_millis(self.reconciler.batch_interval_ms);
        manager.reconciler.period = Duration::from_millis(self.reconciler.period_ms);
        manager.timers.launching_timeout = Duration::from_millis(self.timers.launching_timeout_ms);
        manager.timers.backoff_base = Duration::from_millis(self.timers.backoff_base_ms);
        manager.timers.backoff_max = Duration::from_millis(self.timers.backoff_max_ms);
        manager.handler.max_placements = self.queues.max_placements;
        manager.handler.launching_timeout = Duration::from_millis(self.timers.launching_timeout_ms);
        manager.preemptor.queue_bound = self.queues.preemption_queue_bound;
        manager.pool_queue_bound = self.queues.pool_queue_bound;

        let pools = self.pools.iter().map(ResourcePoolConfig::from).collect();
        ResolvedConfig {
            bind,
            port,
            framework: self.framework,
            manager,
            pools,
        }
    }
}
