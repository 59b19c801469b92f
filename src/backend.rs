use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::health::HealthStatus;
use crate::job::{Job, JobId};
use crate::opts::TranscribeOpts;
use crate::transcript::TranscriptionResult;

/// The processing technologies a request can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Metered cloud API.
    Cloud,
    /// Locally spawned whisper process.
    Local,
    /// Containerized transcription service.
    Docker,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [Self::Cloud, Self::Local, Self::Docker];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cloud => "cloud",
            Self::Local => "local",
            Self::Docker => "docker",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cloud" | "openai" | "api" => Ok(Self::Cloud),
            "local" => Ok(Self::Local),
            "docker" | "container" => Ok(Self::Docker),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// What an adapter can do beyond the baseline contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// Whether in-flight work can be cancelled. Adapters without it always answer `false`
    /// from [`Backend::cancel_job`].
    pub cancellation: bool,
    /// Whether the adapter exposes [`ContainerControl`].
    pub container_lifecycle: bool,
    /// Whether requests cost money.
    pub metered: bool,
}

/// Result of an adapter's cheap self-check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "opt_secs::serialize")]
    pub uptime: Option<Duration>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub available_models: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl BackendHealth {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            uptime: None,
            available_models: Vec::new(),
            details: None,
        }
    }

    pub fn unhealthy(details: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            uptime: None,
            available_models: Vec::new(),
            details: Some(details.into()),
        }
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.available_models = models;
        self
    }

    pub fn with_uptime(mut self, uptime: Duration) -> Self {
        self.uptime = Some(uptime);
        self
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }
}

/// Uniform contract every transcription backend exposes to the router and the monitor.
///
/// Adapters own no authoritative job state: they report into the shared
/// [`crate::job_registry::JobRegistry`] and answer job queries from it.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> Capabilities;

    /// Transcribe one file that already sits on local disk.
    async fn transcribe_file(&self, path: &Path, opts: &TranscribeOpts)
    -> Result<TranscriptionResult>;

    /// Cheap, bounded-time self-check. Must not run a transcription.
    async fn health_status(&self) -> BackendHealth;

    fn job_status(&self, id: JobId) -> Option<Job>;

    fn active_jobs(&self) -> Vec<Job>;

    /// Best-effort cancellation; returns whether it was accepted.
    fn cancel_job(&self, id: JobId) -> bool;

    /// Lifecycle controls for container-backed adapters.
    fn container(&self) -> Option<&dyn ContainerControl> {
        None
    }
}

/// Start/stop controls only container-backed adapters have.
#[async_trait]
pub trait ContainerControl: Send + Sync {
    async fn start_container(&self) -> Result<()>;

    async fn stop_container(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_round_trips_through_display() -> anyhow::Result<()> {
        for kind in BackendKind::ALL {
            let parsed: BackendKind = kind.to_string().parse().map_err(anyhow::Error::msg)?;
            assert_eq!(parsed, kind);
        }
        Ok(())
    }

    #[test]
    fn backend_health_serializes_uptime_in_seconds() -> anyhow::Result<()> {
        let health = BackendHealth::healthy().with_uptime(Duration::from_millis(90_500));
        let json = serde_json::to_value(&health)?;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["uptime"], 90);
        assert!(json.get("details").is_none());
        Ok(())
    }
}
