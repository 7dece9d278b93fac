//! Immutable, ordered catalog of the services this supervisor owns.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{ConfigError, HealthCheckConfig, ServiceDefinition, ShutdownOrder};
use crate::health::HealthProbe;

/// Default grace window when a definition does not set one.
const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Fully resolved definition of one managed service.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub display_name: String,
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub port: u16,
    /// Where an operator reaches the service, shown on the dashboard.
    pub url: String,
    pub health: HealthProbe,
    pub max_restarts: u32,
    pub grace_period: Duration,
    pub env: Vec<(String, String)>,
    pub quiet_patterns: Vec<String>,
}

impl ServiceSpec {
    fn from_definition(def: &ServiceDefinition) -> Result<Self, ConfigError> {
        if def.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if def.command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand(def.name.clone()));
        }
        if def.port == 0 {
            return Err(ConfigError::MissingPort(def.name.clone()));
        }

        let health = match &def.health_check {
            HealthCheckConfig::Http { path } => HealthProbe::Http { path: path.clone() },
            HealthCheckConfig::JsonRpc => HealthProbe::JsonRpc,
        };

        Ok(Self {
            name: def.name.clone(),
            display_name: def.display_name.clone().unwrap_or_else(|| def.name.clone()),
            command: def.command.clone(),
            args: def.args.clone(),
            working_dir: def
                .working_dir
                .as_ref()
                .map_or_else(|| PathBuf::from("."), PathBuf::from),
            port: def.port,
            url: def
                .url
                .clone()
                .unwrap_or_else(|| format!("http://127.0.0.1:{}", def.port)),
            health,
            max_restarts: def.max_restarts,
            grace_period: def
                .grace_period_ms
                .map_or(DEFAULT_GRACE, Duration::from_millis),
            env: def
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            quiet_patterns: def.quiet_patterns.clone(),
        })
    }
}

/// Services in dependency order: each entry may assume the ones before it
/// are reachable. Fixed for the lifetime of a supervisor run.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    specs: Vec<ServiceSpec>,
}

impl ServiceRegistry {
    pub fn from_definitions(defs: &[ServiceDefinition]) -> Result<Self, ConfigError> {
        if defs.is_empty() {
            return Err(ConfigError::Empty);
        }

        let mut names = HashSet::new();
        let mut ports: HashMap<u16, &str> = HashMap::new();
        let mut specs = Vec::with_capacity(defs.len());

        for def in defs {
            let spec = ServiceSpec::from_definition(def)?;
            if !names.insert(spec.name.clone()) {
                return Err(ConfigError::DuplicateName(spec.name));
            }
            if let Some(first) = ports.insert(def.port, def.name.as_str()) {
                return Err(ConfigError::DuplicatePort {
                    port: def.port,
                    first: first.to_string(),
                    second: def.name.clone(),
                });
            }
            specs.push(spec);
        }

        Ok(Self { specs })
    }

    /// Startup order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ServiceSpec> {
        self.specs.iter()
    }

    pub fn shutdown_order(&self, order: ShutdownOrder) -> Vec<&ServiceSpec> {
        match order {
            ShutdownOrder::Reverse => self.specs.iter().rev().collect(),
            ShutdownOrder::Forward => self.specs.iter().collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ServiceSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }
}
