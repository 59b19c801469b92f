//! Router flags shared by the bundled binaries.
//!
//! Every flag can also be set through a `SCRIBE_ROUTER_*` environment variable. Flags are read
//! once at startup and mapped into [`Config`].

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::config::{CloudConfig, Config, ContainerConfig, LocalConfig};
use crate::request::Priority;

#[derive(Args, Debug, Clone)]
pub struct RouterArgs {
    /// Don't register the cloud API adapter.
    #[arg(long, env = "SCRIBE_ROUTER_DISABLE_CLOUD")]
    pub disable_cloud: bool,

    /// Don't register the local whisper.cpp adapter.
    #[arg(long, env = "SCRIBE_ROUTER_DISABLE_LOCAL")]
    pub disable_local: bool,

    /// Don't register the container adapter.
    #[arg(long, env = "SCRIBE_ROUTER_DISABLE_DOCKER")]
    pub disable_docker: bool,

    /// API key for the cloud adapter. Without one the adapter is not registered.
    #[arg(long, env = "SCRIBE_ROUTER_CLOUD_API_KEY", hide_env_values = true)]
    pub cloud_api_key: Option<String>,

    #[arg(long, env = "SCRIBE_ROUTER_CLOUD_URL", default_value = "https://api.openai.com/v1")]
    pub cloud_url: String,

    #[arg(long, env = "SCRIBE_ROUTER_CLOUD_MODEL", default_value = "whisper-1")]
    pub cloud_model: String,

    /// USD per audio minute, used for cost estimates.
    #[arg(long, env = "SCRIBE_ROUTER_CLOUD_COST_PER_MINUTE", default_value_t = 0.006)]
    pub cloud_cost_per_minute: f64,

    /// whisper.cpp CLI binary; a bare name is looked up on `PATH`.
    #[arg(long, env = "SCRIBE_ROUTER_WHISPER_BINARY", default_value = "whisper-cli")]
    pub whisper_binary: PathBuf,

    /// Directory holding `ggml-<model>.bin` files.
    #[arg(long, env = "SCRIBE_ROUTER_MODEL_DIR", default_value = "./models")]
    pub model_dir: PathBuf,

    #[arg(long, env = "SCRIBE_ROUTER_LOCAL_MODEL", default_value = "base")]
    pub local_model: String,

    /// Threads per whisper process. Defaults to every core.
    #[arg(long, env = "SCRIBE_ROUTER_THREADS")]
    pub threads: Option<usize>,

    /// Concurrent whisper processes.
    #[arg(long, env = "SCRIBE_ROUTER_LOCAL_MAX_CONCURRENT", default_value_t = 1)]
    pub local_max_concurrent: usize,

    #[arg(long, env = "SCRIBE_ROUTER_CONTAINER_URL", default_value = "http://127.0.0.1:9000")]
    pub container_url: String,

    #[arg(long, env = "SCRIBE_ROUTER_CONTAINER_NAME", default_value = "whisper-asr")]
    pub container_name: String,

    #[arg(long, env = "SCRIBE_ROUTER_DOCKER_BINARY", default_value = "docker")]
    pub docker_binary: PathBuf,

    #[arg(long, env = "SCRIBE_ROUTER_CONTAINER_MODEL", default_value = "base")]
    pub container_model: String,

    /// Default tier for requests that don't name one: cost, balanced or speed.
    #[arg(long, env = "SCRIBE_ROUTER_PRIORITY", default_value = "balanced", value_parser = parse_priority)]
    pub priority: Priority,

    #[arg(long, env = "SCRIBE_ROUTER_HEALTH_INTERVAL_SECS", default_value_t = 30)]
    pub health_interval_secs: u64,

    #[arg(long, env = "SCRIBE_ROUTER_STARTUP_CHECK_DELAY_SECS", default_value_t = 2)]
    pub startup_check_delay_secs: u64,

    /// Upper bound for a single backend attempt.
    #[arg(long, env = "SCRIBE_ROUTER_REQUEST_TIMEOUT_SECS", default_value_t = 600)]
    pub request_timeout_secs: u64,

    /// Endpoint alerts are POSTed to as JSON.
    #[arg(long, env = "SCRIBE_ROUTER_ALERT_WEBHOOK")]
    pub alert_webhook: Option<String>,

    /// How long finished jobs stay queryable.
    #[arg(long, env = "SCRIBE_ROUTER_JOB_RETENTION_SECS", default_value_t = 3600)]
    pub job_retention_secs: u64,
}

fn parse_priority(raw: &str) -> Result<Priority, String> {
    raw.parse().map_err(|err: crate::Error| err.to_string())
}

impl RouterArgs {
    pub fn to_config(&self) -> Config {
        Config {
            cloud: CloudConfig {
                enabled: !self.disable_cloud,
                base_url: self.cloud_url.clone(),
                api_key: self.cloud_api_key.clone(),
                default_model: self.cloud_model.clone(),
                cost_per_minute: self.cloud_cost_per_minute,
            },
            local: LocalConfig {
                enabled: !self.disable_local,
                binary_path: self.whisper_binary.clone(),
                model_dir: self.model_dir.clone(),
                default_model: self.local_model.clone(),
                threads: self.threads,
                max_concurrent: self.local_max_concurrent,
            },
            container: ContainerConfig {
                enabled: !self.disable_docker,
                base_url: self.container_url.clone(),
                container_name: self.container_name.clone(),
                docker_binary: self.docker_binary.clone(),
                default_model: self.container_model.clone(),
            },
            default_priority: self.priority,
            health_check_interval: Duration::from_secs(self.health_interval_secs),
            startup_check_delay: Duration::from_secs(self.startup_check_delay_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            alert_webhook_url: self.alert_webhook.clone().filter(|url| !url.trim().is_empty()),
            job_retention: Duration::from_secs(self.job_retention_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        router: RouterArgs,
    }

    #[test]
    fn defaults_match_library_defaults() -> anyhow::Result<()> {
        let cli = TestCli::try_parse_from(["test"])?;
        let config = cli.router.to_config();
        let defaults = Config::default();

        assert_eq!(config.health_check_interval, defaults.health_check_interval);
        assert_eq!(config.request_timeout, defaults.request_timeout);
        assert_eq!(config.default_priority, Priority::Balanced);
        assert_eq!(config.local.binary_path, defaults.local.binary_path);
        assert!(config.cloud.enabled && config.local.enabled && config.container.enabled);
        Ok(())
    }

    #[test]
    fn flags_map_into_config() -> anyhow::Result<()> {
        let cli = TestCli::try_parse_from([
            "test",
            "--disable-docker",
            "--priority",
            "latency",
            "--health-interval-secs",
            "5",
            "--alert-webhook",
            "",
        ])?;
        let config = cli.router.to_config();

        assert!(!config.container.enabled);
        assert_eq!(config.default_priority, Priority::Speed);
        assert_eq!(config.health_check_interval, Duration::from_secs(5));
        assert!(config.alert_webhook_url.is_none());
        Ok(())
    }

    #[test]
    fn unknown_priority_is_rejected() {
        assert!(TestCli::try_parse_from(["test", "--priority", "yolo"]).is_err());
    }
}
