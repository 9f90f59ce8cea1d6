//! Campaign configuration, read from a toml file:
//! ```toml
//! request_timeout_ms = 200
//! iterations = 1000
//! output = "campaigns"
//!
//! [[agents]]
//! kind = "local"
//! id = "local-0"
//! concurrency = 4
//!
//! [[agents]]
//! kind = "remote"
//! id = "lab-1"
//! address = "10.0.0.7:7070"
//! concurrency = 8
//! reach = ["10.0.0.20"]
//!
//! [[targets]]
//! name = "plc"
//! protocol = "modbus"
//! endpoint = { host = "10.0.0.20", port = 502 }
//! ```
use crate::agent::remote::RemoteAgent;
use crate::agent::{ExecutionAgent, LocalAgent, Reach};
use crate::campaign::CampaignSettings;
use crate::harness::Harness;
use crate::scheduler::SchedulerConfig;
use crate::target::CampaignTarget;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentConfig {
    /// Executes in this process
    Local {
        id: String,
        concurrency: usize,
        #[serde(default)]
        reach: Option<Vec<String>>,
    },
    /// An agent started with `rusty-fuzzgrid agent`
    Remote {
        id: String,
        address: String,
        concurrency: usize,
        #[serde(default)]
        reach: Option<Vec<String>>,
    },
}

impl AgentConfig {
    pub fn id(&self) -> &str {
        match self {
            AgentConfig::Local { id, .. } | AgentConfig::Remote { id, .. } => id,
        }
    }
}

fn reach(hosts: &Option<Vec<String>>) -> Reach {
    match hosts {
        Some(hosts) => Reach::hosts(hosts.iter().cloned()),
        None => Reach::everywhere(),
    }
}

/// A target process started and watched by the local agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetProcess {
    /// Name of the campaign target the process serves
    pub target: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub restart: bool,
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
}

fn default_startup_delay_ms() -> u64 {
    500
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzConfig {
    pub request_timeout_ms: u64,
    pub generator_timeout_ms: u64,
    pub session_idle_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub unhealthy_threshold: u32,
    pub probe_interval_ms: u64,
    pub max_generator_failures: u32,
    /// Payloads per target
    pub iterations: u64,
    /// Seed of the mutation generator, random if unset
    pub seed: Option<u64>,
    /// Hex seed pool, see [`crate::markov::SeedPool`]
    pub seed_pool: Option<PathBuf>,
    pub output: PathBuf,
    pub agents: Vec<AgentConfig>,
    pub targets: Vec<CampaignTarget>,
    pub target_process: Option<TargetProcess>,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        let scheduler = SchedulerConfig::default();
        let settings = CampaignSettings::default();
        Self {
            request_timeout_ms: scheduler.request_timeout.as_millis() as u64,
            generator_timeout_ms: settings.generator_timeout.as_millis() as u64,
            session_idle_timeout_ms: settings.session_idle_timeout.as_millis() as u64,
            max_retries: scheduler.max_retries,
            retry_backoff_ms: scheduler.retry_backoff.as_millis() as u64,
            unhealthy_threshold: scheduler.unhealthy_threshold,
            probe_interval_ms: scheduler.probe_interval.as_millis() as u64,
            max_generator_failures: settings.max_generator_failures,
            iterations: 1000,
            seed: None,
            seed_pool: None,
            output: PathBuf::from("campaigns"),
            agents: vec![],
            targets: vec![],
            target_process: None,
        }
    }
}

impl FuzzConfig {
    pub async fn read_from_file(path: impl AsRef<Path>) -> color_eyre::Result<Self> {
        let mut content = String::new();
        File::open(path).await?.read_to_string(&mut content).await?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            max_retries: self.max_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            unhealthy_threshold: self.unhealthy_threshold,
            probe_interval: Duration::from_millis(self.probe_interval_ms),
        }
    }

    pub fn campaign_settings(&self) -> CampaignSettings {
        CampaignSettings {
            generator_timeout: Duration::from_millis(self.generator_timeout_ms),
            session_idle_timeout: Duration::from_millis(self.session_idle_timeout_ms),
            max_generator_failures: self.max_generator_failures,
            ..CampaignSettings::default()
        }
    }

    pub fn target(&self, name: &str) -> Option<&CampaignTarget> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// Builds the agent pool. Without configured agents a single local agent with
    /// a concurrency of 4 is used. Local agents share `harness`.
    pub fn build_agents(&self, harness: &Arc<Harness>) -> Vec<(Arc<dyn ExecutionAgent>, usize)> {
        if self.agents.is_empty() {
            let agent: Arc<dyn ExecutionAgent> = Arc::new(LocalAgent::new("local-0", harness.clone()));
            return vec![(agent, 4)];
        }
        self.agents
            .iter()
            .map(|config| {
                let agent: Arc<dyn ExecutionAgent> = match config {
                    AgentConfig::Local { id, reach: hosts, .. } => {
                        Arc::new(LocalAgent::new(id.clone(), harness.clone()).with_reach(reach(hosts)))
                    }
                    AgentConfig::Remote {
                        id,
                        address,
                        reach: hosts,
                        ..
                    } => Arc::new(RemoteAgent::new(id.clone(), address.clone()).with_reach(reach(hosts))),
                };
                let concurrency = match config {
                    AgentConfig::Local { concurrency, .. } | AgentConfig::Remote { concurrency, .. } => {
                        *concurrency
                    }
                };
                (agent, concurrency)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolRegistry;

    const EXAMPLE: &str = r#"
request_timeout_ms = 300
max_retries = 2
iterations = 50

[[agents]]
kind = "local"
id = "local-0"
concurrency = 4

[[agents]]
kind = "remote"
id = "lab-1"
address = "10.0.0.7:7070"
concurrency = 8
reach = ["10.0.0.20"]

[[targets]]
name = "plc"
protocol = "modbus"
endpoint = { host = "10.0.0.20", port = 502 }

[[targets]]
name = "sensor"
protocol = "coap"
endpoint = { host = "127.0.0.1", port = 5683, path = "/temp" }

[target_process]
target = "sensor"
command = "./coap-server"
args = ["-p", "5683"]
restart = true
"#;

    #[test]
    fn parses_a_full_config() {
        let config: FuzzConfig = toml::from_str(EXAMPLE).unwrap();
        assert_eq!(config.request_timeout_ms, 300);
        assert_eq!(config.unhealthy_threshold, 3);
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[1].id(), "lab-1");
        assert_eq!(
            config.target("sensor").unwrap().endpoint.path.as_deref(),
            Some("/temp")
        );
        let process = config.target_process.as_ref().unwrap();
        assert!(process.restart);
        assert_eq!(process.startup_delay_ms, 500);

        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.request_timeout, Duration::from_millis(300));
        assert_eq!(scheduler.max_retries, 2);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: FuzzConfig = toml::from_str("").unwrap();
        assert_eq!(config, FuzzConfig::default());
        assert_eq!(config.scheduler_config(), SchedulerConfig::default());
        assert_eq!(config.campaign_settings(), CampaignSettings::default());
    }

    #[test]
    fn builds_agents() {
        let harness = Arc::new(Harness::new(Arc::new(ProtocolRegistry::with_builtin())));
        let default = FuzzConfig::default().build_agents(&harness);
        assert_eq!(default.len(), 1);
        assert_eq!(default[0].1, 4);

        let config: FuzzConfig = toml::from_str(EXAMPLE).unwrap();
        let agents = config.build_agents(&harness);
        let ids: Vec<_> = agents.iter().map(|(a, c)| (a.id().to_string(), *c)).collect();
        assert_eq!(ids, vec![("local-0".to_string(), 4), ("lab-1".to_string(), 8)]);
        let plc = config.target("plc").unwrap();
        let sensor = config.target("sensor").unwrap();
        assert!(agents[1].0.can_reach(plc));
        assert!(!agents[1].0.can_reach(sensor));
    }
}
