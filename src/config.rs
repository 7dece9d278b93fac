use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name looked up in the working directory and the user config dir.
pub const CONFIG_FILE: &str = "stackmond.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("no services configured")]
    Empty,
    #[error("service name '{0}' is configured more than once")]
    DuplicateName(String),
    #[error("port {port} is claimed by both '{first}' and '{second}'")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },
    #[error("service '{0}' has an empty command")]
    EmptyCommand(String),
    #[error("service '{0}' has no port")]
    MissingPort(String),
    #[error("service names must be non-empty")]
    EmptyName,
}

/// Top‑level supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    pub services: Vec<ServiceDefinition>,
    /// Extra URLs printed under the status table.
    #[serde(default)]
    pub links: Vec<QuickLink>,
}

/// Order in which services are stopped on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownOrder {
    /// Dependents first: frontend, then API, then node.
    #[default]
    Reverse,
    /// Same order as startup.
    Forward,
}

/// Timings and knobs shared by every service. All durations are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub probe_interval_ms: u64,
    pub startup_probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub status_interval_ms: u64,
    pub restart_delay_ms: u64,
    pub spawn_retry_delay_ms: u64,
    pub stop_grace_ms: u64,
    pub kill_timeout_ms: u64,
    pub failure_threshold: u32,
    pub sustained_health_ms: u64,
    pub startup_stagger_ms: u64,
    pub port_release_timeout_ms: u64,
    pub shutdown_order: ShutdownOrder,
    pub output_line_limit: usize,
    pub dashboard: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            probe_interval_ms: 30_000,
            startup_probe_interval_ms: 2_000,
            probe_timeout_ms: 5_000,
            status_interval_ms: 5_000,
            restart_delay_ms: 5_000,
            spawn_retry_delay_ms: 1_000,
            stop_grace_ms: 10_000,
            kill_timeout_ms: 5_000,
            failure_threshold: 3,
            sustained_health_ms: 60_000,
            startup_stagger_ms: 2_000,
            port_release_timeout_ms: 5_000,
            shutdown_order: ShutdownOrder::Reverse,
            output_line_limit: 200,
            dashboard: true,
        }
    }
}

impl SupervisorSettings {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn startup_probe_interval(&self) -> Duration {
        Duration::from_millis(self.startup_probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.max(100))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn spawn_retry_delay(&self) -> Duration {
        Duration::from_millis(self.spawn_retry_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn sustained_health(&self) -> Duration {
        Duration::from_millis(self.sustained_health_ms)
    }

    pub fn startup_stagger(&self) -> Duration {
        Duration::from_millis(self.startup_stagger_ms)
    }

    pub fn port_release_timeout(&self) -> Duration {
        Duration::from_millis(self.port_release_timeout_ms)
    }
}

fn default_max_restarts() -> u32 {
    3
}

fn default_health_path() -> String {
    "/".to_string()
}

/// How a service proves it is alive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthCheckConfig {
    /// `GET http://127.0.0.1:<port><path>`, healthy below status 500.
    Http {
        #[serde(default = "default_health_path")]
        path: String,
    },
    /// `eth_accounts` JSON-RPC POST, healthy on status 200.
    JsonRpc,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        HealthCheckConfig::Http {
            path: default_health_path(),
        }
    }
}

/// On‑disk TOML description of a single service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    pub display_name: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    #[serde(default)]
    pub port: u16,
    pub url: Option<String>,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Window after (re)start during which failing probes are not counted.
    pub grace_period_ms: Option<u64>,
    /// Output lines containing any of these substrings are not forwarded.
    #[serde(default)]
    pub quiet_patterns: Vec<String>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickLink {
    pub label: String,
    pub url: String,
}

impl SupervisorConfig {
    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Resolve relative working directories against `base`.
    pub fn anchor_to(&mut self, base: &Path) {
        for def in &mut self.services {
            let dir = match &def.working_dir {
                Some(dir) if Path::new(dir).is_relative() => base.join(dir),
                Some(_) => continue,
                None => base.to_path_buf(),
            };
            def.working_dir = Some(dir.to_string_lossy().into_owned());
        }
    }

    fn default_services() -> Vec<ServiceDefinition> {
        vec![
            ServiceDefinition {
                name: "node".to_string(),
                display_name: Some("Hardhat Blockchain".to_string()),
                command: "npx".to_string(),
                args: vec!["hardhat".to_string(), "node".to_string()],
                working_dir: None,
                port: 8545,
                url: None,
                max_restarts: 3,
                grace_period_ms: Some(10_000),
                quiet_patterns: vec!["eth_blockNumber".to_string()],
                health_check: HealthCheckConfig::JsonRpc,
                env: BTreeMap::new(),
            },
            ServiceDefinition {
                name: "api".to_string(),
                display_name: Some("Laravel Backend".to_string()),
                command: "php".to_string(),
                args: vec![
                    "artisan".to_string(),
                    "serve".to_string(),
                    "--host=127.0.0.1".to_string(),
                    "--port=8282".to_string(),
                ],
                working_dir: Some("backend".to_string()),
                port: 8282,
                url: None,
                max_restarts: 3,
                grace_period_ms: Some(5_000),
                quiet_patterns: vec!["deprecated".to_string()],
                health_check: HealthCheckConfig::Http {
                    path: default_health_path(),
                },
                env: BTreeMap::new(),
            },
            ServiceDefinition {
                name: "web".to_string(),
                display_name: Some("Next.js Frontend".to_string()),
                command: "npm".to_string(),
                args: vec!["run".to_string(), "dev".to_string()],
                working_dir: Some("frontend".to_string()),
                port: 3000,
                url: Some("http://localhost:3000".to_string()),
                max_restarts: 3,
                grace_period_ms: Some(5_000),
                quiet_patterns: vec!["webpack".to_string(), "warning".to_string()],
                health_check: HealthCheckConfig::Http {
                    path: default_health_path(),
                },
                env: BTreeMap::new(),
            },
        ]
    }

    fn default_links() -> Vec<QuickLink> {
        vec![
            QuickLink {
                label: "Frontend".to_string(),
                url: "http://localhost:3000".to_string(),
            },
            QuickLink {
                label: "Admin".to_string(),
                url: "http://127.0.0.1:8282/admin".to_string(),
            },
            QuickLink {
                label: "API".to_string(),
                url: "http://127.0.0.1:8282/api/v1/stats".to_string(),
            },
        ]
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorSettings::default(),
            services: SupervisorConfig::default_services(),
            links: SupervisorConfig::default_links(),
        }
    }
}

/// Find the configuration file to use.
///
/// An explicit path always wins; otherwise `./stackmond.toml` and then the
/// per-user config directory are checked. `None` means the built-in table.
pub fn discover_config_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if explicit.is_some() {
        return explicit;
    }

    let mut search_paths = vec![PathBuf::from(CONFIG_FILE)];
    if let Some(dir) = dirs::config_dir() {
        search_paths.push(dir.join("stackmond").join(CONFIG_FILE));
    }

    for candidate in search_paths {
        if candidate.exists() {
            log::debug!("Found configuration at {}", candidate.display());
            return Some(candidate);
        }
    }

    log::info!("No {CONFIG_FILE} found, using the built-in service table");
    None
}
