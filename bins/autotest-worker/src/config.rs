// Runtime configuration for one worker process
use crate::fetch::Fetcher;
use crate::rlimit::{self, ResourceSettings};
use crate::tester::TesterRegistry;
use crate::workdir::Identity;
use anyhow::{anyhow, Context, Result};
use autotest_common::config::{AutotestConfig, WorkerConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Everything a worker resolves once at startup and then shares with every
/// job it runs.
pub struct WorkerRuntime {
    pub config: AutotestConfig,
    pub worker: WorkerConfig,
    pub identity: Identity,
    pub limits: ResourceSettings,
    pub registry: TesterRegistry,
    pub fetcher: Fetcher,
}

impl WorkerRuntime {
    /// Resolve the worker named `worker_name`, or the first configured worker
    pub fn load(config: AutotestConfig, worker_name: Option<&str>) -> Result<Self> {
        let worker = match worker_name {
            Some(name) => config
                .worker(name)
                .cloned()
                .ok_or_else(|| anyhow!("Worker '{}' is not configured", name))?,
            None => config
                .workers
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("No workers configured"))?,
        };

        let identity = Identity::lookup(&worker.user)
            .with_context(|| format!("Worker '{}' runs tests as an unknown user", worker.name))?;
        let limits = rlimit::get_resource_settings(&config.rlimit_settings).context("Invalid rlimit_settings")?;
        let registry = TesterRegistry::from_config(&config)?;
        let fetcher = Fetcher::new(DOWNLOAD_TIMEOUT)?;

        Ok(Self {
            config,
            worker,
            identity,
            limits,
            registry,
            fetcher,
        })
    }

    /// The single working directory this worker runs jobs in
    pub fn workdir(&self) -> PathBuf {
        self.config.worker_dir(&self.worker.name)
    }

    pub fn staging_root(&self) -> PathBuf {
        self.config.staging_dir(&self.worker.name)
    }

    pub fn staging_dir(&self, job_id: &str) -> PathBuf {
        self.staging_root().join(job_id)
    }

    /// Limits for the next job, validated against the worker's limits as
    /// they are now. Falls back to the startup snapshot if that fails.
    pub fn job_limits(&self) -> ResourceSettings {
        match rlimit::get_resource_settings(&self.config.rlimit_settings) {
            Ok(limits) => limits,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Could not re-read resource limits, using startup values");
                self.limits.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rlimit::RlimitKind;

    fn runtime_with(rlimit_settings: &str, limits: ResourceSettings) -> WorkerRuntime {
        let config = AutotestConfig::from_json(&format!(
            r#"{{"workspace": "/tmp/autotest", "workers": [{{"name": "w0", "user": "nobody", "queues": ["low"]}}],
                "rlimit_settings": {}}}"#,
            rlimit_settings
        ))
        .unwrap();
        let worker = config.workers[0].clone();
        WorkerRuntime {
            config,
            worker,
            identity: Identity::current().unwrap(),
            limits,
            registry: TesterRegistry::default(),
            fetcher: Fetcher::new(Duration::from_secs(5)).unwrap(),
        }
    }

    #[test]
    fn test_job_limits_follow_current_process() {
        let rt = runtime_with(r#"{"nofile": [64, 64]}"#, ResourceSettings::default());
        let (cur_soft, _) = rlimit::current_limits(RlimitKind::Nofile).unwrap();

        let limits = rt.job_limits();
        assert_eq!(limits.entries().len(), 1);
        let (kind, (soft, hard)) = limits.entries()[0];
        assert_eq!(kind, RlimitKind::Nofile);
        assert!(soft <= 64 && hard <= 64);
        if cur_soft >= 64 {
            assert_eq!(soft, 64);
        }
    }

    #[test]
    fn test_job_limits_fall_back_to_startup_values() {
        let startup = rlimit::get_resource_settings(&[("nofile".to_string(), [32, 32])]).unwrap();
        let rt = runtime_with(r#"{"not_a_resource": [1, 1]}"#, startup.clone());
        assert_eq!(rt.job_limits(), startup);
    }

    #[test]
    fn test_unknown_worker_name() {
        let rt = runtime_with("{}", ResourceSettings::default());
        assert!(WorkerRuntime::load(rt.config, Some("w9")).is_err());
    }
}
