//! The set of adapters this process can route to, built once at startup.
//!
//! An adapter whose prerequisites are missing (disabled, no API key, binary not found) is
//! simply left out. Routing and health polling only ever see what was registered here.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::{Backend, BackendKind, Capabilities, ContainerControl};
use crate::backends::{CloudBackend, ContainerBackend, LocalBackend};
use crate::config::Config;
use crate::job::{Job, JobId};
use crate::job_registry::JobRegistry;

#[derive(Default)]
pub struct BackendRegistry {
    backends: BTreeMap<BackendKind, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from configuration, registering every adapter whose prerequisites
    /// are met.
    pub fn from_config(config: &Config, jobs: Arc<JobRegistry>) -> Self {
        let mut registry = Self::new();

        if !config.cloud.enabled {
            info!(backend = %BackendKind::Cloud, "adapter disabled by configuration");
        } else {
            match config.cloud.api_key.as_deref().map(str::trim) {
                Some(key) if !key.is_empty() => {
                    registry.register(Arc::new(CloudBackend::new(
                        config.cloud.clone(),
                        key.to_owned(),
                        jobs.clone(),
                    )));
                }
                _ => warn!(backend = %BackendKind::Cloud, "no API key configured, adapter not registered"),
            }
        }

        if !config.local.enabled {
            info!(backend = %BackendKind::Local, "adapter disabled by configuration");
        } else {
            match LocalBackend::new(config.local.clone(), jobs.clone()) {
                Ok(backend) => registry.register(Arc::new(backend)),
                Err(_) => warn!(
                    backend = %BackendKind::Local,
                    binary = %config.local.binary_path.display(),
                    "whisper binary not found, adapter not registered"
                ),
            }
        }

        if !config.container.enabled {
            info!(backend = %BackendKind::Docker, "adapter disabled by configuration");
        } else {
            registry.register(Arc::new(ContainerBackend::new(
                config.container.clone(),
                jobs,
            )));
        }

        info!(backends = ?registry.kinds(), "backend registry ready");
        registry
    }

    /// Register an adapter, replacing any previous one of the same kind.
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        let kind = backend.kind();
        info!(backend = %kind, capabilities = ?backend.capabilities(), "adapter registered");
        self.backends.insert(kind, backend);
    }

    pub fn get(&self, kind: BackendKind) -> Option<&Arc<dyn Backend>> {
        self.backends.get(&kind)
    }

    pub fn contains(&self, kind: BackendKind) -> bool {
        self.backends.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        self.backends.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BackendKind, &Arc<dyn Backend>)> {
        self.backends.iter().map(|(kind, backend)| (*kind, backend))
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn capabilities(&self, kind: BackendKind) -> Option<Capabilities> {
        self.get(kind).map(|backend| backend.capabilities())
    }

    /// Lifecycle controls of a registered container-backed adapter.
    pub fn container(&self, kind: BackendKind) -> Option<&dyn ContainerControl> {
        self.get(kind).and_then(|backend| backend.container())
    }

    /// Look a job up across every adapter.
    pub fn find_job(&self, id: JobId) -> Option<Job> {
        self.backends
            .values()
            .find_map(|backend| backend.job_status(id))
    }

    /// Active jobs across every adapter, newest first.
    pub fn active_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .backends
            .values()
            .flat_map(|backend| backend.active_jobs())
            .collect();
        jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        jobs
    }

    /// Ask the owning adapter to cancel. `None` when no adapter knows the job.
    pub fn cancel_job(&self, id: JobId) -> Option<bool> {
        let job = self.find_job(id)?;
        let backend = self.get(job.backend)?;
        Some(backend.cancel_job(id))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn offline_config() -> Config {
        let mut config = Config::default();
        config.local.binary_path = PathBuf::from("/no/such/whisper-cli");
        config
    }

    #[test]
    fn missing_prerequisites_skip_adapters() {
        let registry = BackendRegistry::from_config(&offline_config(), Arc::new(JobRegistry::new()));
        // no API key, no whisper binary; the container adapter only needs configuration
        assert_eq!(registry.kinds(), vec![BackendKind::Docker]);
        assert!(registry.container(BackendKind::Docker).is_some());
        assert!(registry.get(BackendKind::Local).is_none());
    }

    #[test]
    fn disabled_adapters_are_not_registered() {
        let mut config = offline_config();
        config.container.enabled = false;
        config.cloud.api_key = Some("sk-test".into());
        config.cloud.enabled = false;

        let registry = BackendRegistry::from_config(&config, Arc::new(JobRegistry::new()));
        assert!(registry.is_empty());
    }

    #[test]
    fn blank_api_key_counts_as_missing() {
        let mut config = offline_config();
        config.cloud.api_key = Some("   ".into());
        let registry = BackendRegistry::from_config(&config, Arc::new(JobRegistry::new()));
        assert!(!registry.contains(BackendKind::Cloud));

        config.cloud.api_key = Some("sk-test".into());
        let registry = BackendRegistry::from_config(&config, Arc::new(JobRegistry::new()));
        assert!(registry.contains(BackendKind::Cloud));
        assert_eq!(
            registry.capabilities(BackendKind::Cloud).map(|c| c.cancellation),
            Some(false)
        );
    }

    #[test]
    fn jobs_are_found_through_their_owner() {
        let jobs = Arc::new(JobRegistry::new());
        let mut config = offline_config();
        config.cloud.api_key = Some("sk-test".into());
        let registry = BackendRegistry::from_config(&config, jobs.clone());

        let docker_job = jobs.submit(BackendKind::Docker, None);
        let cloud_job = jobs.submit(BackendKind::Cloud, None);

        assert_eq!(registry.active_jobs().len(), 2);
        assert_eq!(
            registry.find_job(cloud_job.id()).map(|j| j.backend),
            Some(BackendKind::Cloud)
        );
        // cloud has no cancellation; docker does
        assert_eq!(registry.cancel_job(cloud_job.id()), Some(false));
        assert_eq!(registry.cancel_job(docker_job.id()), Some(true));
        assert_eq!(registry.cancel_job(JobId::new()), None);
    }
}
