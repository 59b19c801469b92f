//! Startup configuration.
//!
//! This is *library-level configuration*, not CLI flags directly. The binaries map their
//! flags (and `SCRIBE_ROUTER_*` environment variables) into [`Config`]; everything is read
//! once at startup.

use std::path::PathBuf;
use std::time::Duration;

use crate::request::Priority;

#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub enabled: bool,
    /// OpenAI-compatible API root, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// The adapter is not registered without a key.
    pub api_key: Option<String>,
    pub default_model: String,
    /// USD per audio minute, used for the result's cost estimate.
    pub cost_per_minute: f64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://api.openai.com/v1".to_owned(),
            api_key: None,
            default_model: "whisper-1".to_owned(),
            cost_per_minute: 0.006,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub enabled: bool,
    /// whisper.cpp CLI binary. A bare name is looked up on `PATH`.
    pub binary_path: PathBuf,
    /// Directory holding `ggml-<model>.bin` files.
    pub model_dir: PathBuf,
    pub default_model: String,
    /// `None` uses every core.
    pub threads: Option<usize>,
    /// How many whisper processes may run at once.
    pub max_concurrent: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary_path: PathBuf::from("whisper-cli"),
            model_dir: PathBuf::from("./models"),
            default_model: "base".to_owned(),
            threads: None,
            max_concurrent: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub enabled: bool,
    /// Root URL of the containerized ASR service.
    pub base_url: String,
    pub container_name: String,
    pub docker_binary: PathBuf,
    pub default_model: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://127.0.0.1:9000".to_owned(),
            container_name: "whisper-asr".to_owned(),
            docker_binary: PathBuf::from("docker"),
            default_model: "base".to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub cloud: CloudConfig,
    pub local: LocalConfig,
    pub container: ContainerConfig,
    /// Tier used when a request doesn't name one.
    pub default_priority: Priority,
    pub health_check_interval: Duration,
    /// Delay before the first health check after `start()`.
    pub startup_check_delay: Duration,
    /// Upper bound for a single backend attempt.
    pub request_timeout: Duration,
    /// Optional endpoint alerts are POSTed to.
    pub alert_webhook_url: Option<String>,
    /// How long finished jobs stay queryable.
    pub job_retention: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cloud: CloudConfig::default(),
            local: LocalConfig::default(),
            container: ContainerConfig::default(),
            default_priority: Priority::Balanced,
            health_check_interval: Duration::from_secs(30),
            startup_check_delay: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10 * 60),
            alert_webhook_url: None,
            job_retention: Duration::from_secs(60 * 60),
        }
    }
}
