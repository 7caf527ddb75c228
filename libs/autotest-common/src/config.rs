// Deployment configuration shared by the API, the workers and the CLI.
// Loaded from config/autotest.json unless AUTOTEST_CONFIG points elsewhere.

use crate::queue::QueueName;
use crate::types::TesterType;
use anyhow::{bail, Context, Result};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config/autotest.json";
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// One worker process: its name, the OS user tests run as, and the queues
/// it serves in priority order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: String,
    pub user: String,
    pub queues: Vec<QueueName>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvStrategy {
    /// Per-settings virtualenv built from `env_data`
    PythonVenv,
    /// The configured default interpreter, nothing built
    Default,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TesterConfig {
    /// Executable speaking the tester stdin/stdout protocol
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env_strategy: Option<EnvStrategy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutotestConfig {
    pub workspace: PathBuf,
    #[serde(default)]
    pub redis_url: Option<String>,
    pub workers: Vec<WorkerConfig>,
    /// Resource name → `[soft, hard]`, `-1` meaning unlimited. Order is kept.
    #[serde(default, deserialize_with = "ordered_limits")]
    pub rlimit_settings: Vec<(String, [i64; 2])>,
    #[serde(default)]
    pub testers: BTreeMap<TesterType, TesterConfig>,
    #[serde(default = "default_python")]
    pub python: PathBuf,
    #[serde(default = "default_settings_job_timeout")]
    pub settings_job_timeout_secs: u64,
    /// Added to a job's timeout to form its settings lock TTL
    #[serde(default = "default_lock_margin")]
    pub lock_margin_secs: u64,
}

fn default_python() -> PathBuf {
    PathBuf::from("/usr/bin/python3")
}

fn default_settings_job_timeout() -> u64 {
    600
}

fn default_lock_margin() -> u64 {
    30
}

fn ordered_limits<'de, D>(deserializer: D) -> std::result::Result<Vec<(String, [i64; 2])>, D::Error>
where
    D: Deserializer<'de>,
{
    struct LimitsVisitor;

    impl<'de> Visitor<'de> for LimitsVisitor {
        type Value = Vec<(String, [i64; 2])>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of resource name to [soft, hard]")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
            let mut out = Vec::new();
            while let Some((name, limits)) = map.next_entry::<String, [i64; 2]>()? {
                out.push((name, limits));
            }
            Ok(out)
        }
    }

    deserializer.deserialize_map(LimitsVisitor)
}

impl AutotestConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Invalid configuration in {}", config_path.display()))
    }

    /// Load from `AUTOTEST_CONFIG`, falling back to config/autotest.json
    pub fn load_default() -> Result<Self> {
        let path = std::env::var("AUTOTEST_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(Path::new(&path))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: AutotestConfig = serde_json::from_str(content).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.workers.is_empty() {
            bail!("No workers configured");
        }
        let mut names = HashSet::new();
        for worker in &self.workers {
            if !names.insert(worker.name.as_str()) {
                bail!("Duplicate worker name '{}'", worker.name);
            }
            if worker.queues.is_empty() {
                bail!("Worker '{}' serves no queues", worker.name);
            }
        }
        for (name, [soft, hard]) in &self.rlimit_settings {
            if *soft < -1 || *hard < -1 {
                bail!("Invalid limits for '{}': {} {}", name, soft, hard);
            }
        }
        Ok(())
    }

    /// REDIS_URL wins over the file, which wins over the local default
    pub fn redis_url(&self) -> String {
        std::env::var("REDIS_URL")
            .ok()
            .or_else(|| self.redis_url.clone())
            .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string())
    }

    pub fn worker(&self, name: &str) -> Option<&WorkerConfig> {
        self.workers.iter().find(|w| w.name == name)
    }

    pub fn tester(&self, kind: TesterType) -> Option<&TesterConfig> {
        self.testers.get(&kind)
    }

    /// Job working directory of a worker
    pub fn worker_dir(&self, worker: &str) -> PathBuf {
        self.workspace.join("workers").join(worker)
    }

    /// Download and unpack area of a worker, outside the job directory
    pub fn staging_dir(&self, worker: &str) -> PathBuf {
        self.workspace.join("staging").join(worker)
    }

    pub fn harness_dir(&self, settings_id: u64) -> PathBuf {
        self.workspace.join("scripts").join(settings_id.to_string()).join("files")
    }

    pub fn environment_dir(&self, settings_id: u64, tester_index: usize) -> PathBuf {
        self.workspace
            .join("environments")
            .join(settings_id.to_string())
            .join(tester_index.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "workspace": "/srv/autotest",
        "workers": [
            {"name": "w0", "user": "autotst0", "queues": ["settings", "high", "low", "batch"]},
            {"name": "w1", "user": "autotst1", "queues": ["batch"]}
        ],
        "rlimit_settings": {"nproc": [300, 300], "cpu": [60, -1], "nofile": [512, 1024]},
        "testers": {
            "py": {"command": "/opt/testers/py/run", "env_strategy": "python_venv"},
            "java": {"command": "/opt/testers/java/run", "args": ["--quiet"]}
        }
    }"#;

    #[test]
    fn test_load_sample() {
        let config = AutotestConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.workers.len(), 2);
        assert_eq!(config.worker("w0").unwrap().queues[0], QueueName::Settings);
        assert_eq!(config.settings_job_timeout_secs, 600);
        assert_eq!(config.python, PathBuf::from("/usr/bin/python3"));
        assert_eq!(
            config.tester(TesterType::Py).unwrap().env_strategy,
            Some(EnvStrategy::PythonVenv)
        );
        assert!(config.tester(TesterType::Racket).is_none());
    }

    #[test]
    fn test_rlimit_order_preserved() {
        let config = AutotestConfig::from_json(SAMPLE).unwrap();
        let names: Vec<&str> = config.rlimit_settings.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["nproc", "cpu", "nofile"]);
        assert_eq!(config.rlimit_settings[1].1, [60, -1]);
    }

    #[test]
    fn test_rejects_bad_worker_setup() {
        let dup = r#"{"workspace": "/w", "workers": [
            {"name": "a", "user": "u", "queues": ["low"]},
            {"name": "a", "user": "v", "queues": ["low"]}
        ]}"#;
        assert!(AutotestConfig::from_json(dup).is_err());

        let idle = r#"{"workspace": "/w", "workers": [{"name": "a", "user": "u", "queues": []}]}"#;
        assert!(AutotestConfig::from_json(idle).is_err());

        let unknown_queue = r#"{"workspace": "/w", "workers": [{"name": "a", "user": "u", "queues": ["single"]}]}"#;
        assert!(AutotestConfig::from_json(unknown_queue).is_err());
    }

    #[test]
    fn test_workspace_layout() {
        let config = AutotestConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.worker_dir("w0"), PathBuf::from("/srv/autotest/workers/w0"));
        assert_eq!(config.harness_dir(4), PathBuf::from("/srv/autotest/scripts/4/files"));
        assert_eq!(config.environment_dir(4, 1), PathBuf::from("/srv/autotest/environments/4/1"));
    }

    #[test]
    fn test_shipped_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/autotest.json");
        let config = AutotestConfig::load(&path).unwrap();
        assert_eq!(config.workers.len(), 4);
        assert!(config.workers.iter().all(|w| w.queues[0] == QueueName::Settings));
    }

    #[test]
    fn test_missing_file() {
        assert!(AutotestConfig::load(Path::new("/nonexistent/autotest.json")).is_err());
    }
}
