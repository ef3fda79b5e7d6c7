use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::queue::TransitionPolicy;
use crate::reconciler::{Backoff, ReconcilerSettings};
use crate::runtime::EngineTimeouts;
use crate::types::DesiredState;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_socket: Option<String>,
    pub container_prefix: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_registry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    pub reconcile_interval_ms: u64,
    pub workers: usize,
    pub engine_timeout_ms: u64,
    pub pull_timeout_ms: u64,
    pub stop_grace_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub gc_grace_ms: u64,
    pub max_steps_per_pass: usize,
    pub state_file: PathBuf,
    pub respec_allowed_from: Vec<DesiredState>,
    pub prefetch_images: bool,
    pub sweep_orphans: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            docker_socket: None,
            container_prefix: "hostlife_generated_".into(),
            default_registry: None,
            network: None,
            reconcile_interval_ms: 5_000,
            workers: 4,
            engine_timeout_ms: 30_000,
            pull_timeout_ms: 600_000,
            stop_grace_secs: 10,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            gc_grace_ms: 30_000,
            max_steps_per_pass: 8,
            state_file: PathBuf::from("hostlife-state.json"),
            respec_allowed_from: vec![DesiredState::Absent],
            prefetch_images: true,
            sweep_orphans: true,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // An explicit file path wins over the working-directory defaults
        let toml_file = std::env::var("HOSTLIFE_CONFIG").unwrap_or_else(|_| "hostlife.toml".into());

        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(toml_file))
            .merge(Json::file("hostlife.json"))
            .merge(Env::prefixed("HOSTLIFE_").ignore(&["config"]))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.reconcile_interval_ms == 0 {
            anyhow::bail!("reconcile_interval_ms must be positive");
        }
        if self.backoff_base_ms > self.backoff_cap_ms {
            anyhow::bail!(
                "backoff_base_ms ({}) exceeds backoff_cap_ms ({})",
                self.backoff_base_ms,
                self.backoff_cap_ms
            );
        }
        if self.max_steps_per_pass == 0 {
            anyhow::bail!("max_steps_per_pass must be at least 1");
        }
        if self.container_prefix.is_empty() {
            anyhow::bail!("container_prefix cannot be empty");
        }
        Ok(())
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            interval: Duration::from_millis(self.reconcile_interval_ms),
            workers: self.workers,
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            backoff: Backoff::new(
                Duration::from_millis(self.backoff_base_ms),
                Duration::from_millis(self.backoff_cap_ms),
            ),
            gc_grace: Duration::from_millis(self.gc_grace_ms),
            max_steps: self.max_steps_per_pass,
        }
    }

    pub fn engine_timeouts(&self) -> EngineTimeouts {
        EngineTimeouts {
            call: Duration::from_millis(self.engine_timeout_ms),
            pull: Duration::from_millis(self.pull_timeout_ms),
        }
    }

    pub fn transition_policy(&self) -> TransitionPolicy {
        TransitionPolicy::new(self.respec_allowed_from.iter().copied())
    }
}
