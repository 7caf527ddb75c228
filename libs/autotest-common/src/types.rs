use crate::queue::QueueName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Closed set of tester kinds a settings record may reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TesterType {
    Py,
    Pyta,
    Jupyter,
    Java,
    Haskell,
    R,
    Racket,
    Rust,
    Custom,
    Ai,
}

impl TesterType {
    pub const ALL: [TesterType; 10] = [
        TesterType::Py,
        TesterType::Pyta,
        TesterType::Jupyter,
        TesterType::Java,
        TesterType::Haskell,
        TesterType::R,
        TesterType::Racket,
        TesterType::Rust,
        TesterType::Custom,
        TesterType::Ai,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TesterType::Py => "py",
            TesterType::Pyta => "pyta",
            TesterType::Jupyter => "jupyter",
            TesterType::Java => "java",
            TesterType::Haskell => "haskell",
            TesterType::R => "r",
            TesterType::Racket => "racket",
            TesterType::Rust => "rust",
            TesterType::Custom => "custom",
            TesterType::Ai => "ai",
        }
    }

    /// Testers whose environment is a per-settings python virtualenv
    pub fn uses_python_env(&self) -> bool {
        matches!(
            self,
            TesterType::Py | TesterType::Pyta | TesterType::Jupyter | TesterType::Ai
        )
    }
}

impl fmt::Display for TesterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TesterType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TesterType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s.to_lowercase())
            .ok_or_else(|| format!("unknown tester type: {}", s))
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One group of tests inside a tester spec.
///
/// Only the fields the core needs are typed; everything else is tester
/// specific and carried through untouched in `rest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestGroup {
    /// Wall-clock budget for this group, in seconds
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Vec<String>>,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Map::is_empty")]
    pub extra_info: Map<String, Value>,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub feedback_file_names: Vec<String>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl TestGroup {
    /// An empty category filter selects every group.
    pub fn matches(&self, categories: &[String]) -> bool {
        if categories.is_empty() {
            return true;
        }
        self.category
            .as_ref()
            .map(|own| own.iter().any(|c| categories.contains(c)))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TesterSpec {
    pub tester_type: TesterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_data: Option<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub test_data: Vec<TestGroup>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl TesterSpec {
    /// The spec handed to a tester process: same tester, a single test group
    pub fn narrowed_to(&self, group: &TestGroup) -> TesterSpec {
        TesterSpec {
            tester_type: self.tester_type,
            env_data: self.env_data.clone(),
            test_data: vec![group.clone()],
            rest: self.rest.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvStatus {
    #[default]
    Setup,
    Ready,
    Error,
}

/// Settings record stored under `autotest:settings`.
///
/// Underscore-prefixed keys are internal bookkeeping and are never shown to
/// clients (see [`SettingsRecord::public_view`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsRecord {
    #[serde(rename = "_user")]
    pub user: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub testers: Vec<TesterSpec>,
    #[serde(rename = "_files", default, deserialize_with = "null_as_default")]
    pub files: Vec<String>,
    #[serde(rename = "_file_url", default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(rename = "_env_status", default)]
    pub env_status: EnvStatus,
    #[serde(rename = "_error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "_last_access", default, skip_serializing_if = "Option::is_none")]
    pub last_access: Option<i64>,
}

impl SettingsRecord {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            testers: Vec::new(),
            files: Vec::new(),
            file_url: None,
            env_status: EnvStatus::Setup,
            error: None,
            last_access: None,
        }
    }

    /// JSON view with internal keys removed
    pub fn public_view(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Value::Object(
                map.into_iter()
                    .filter(|(k, _)| !k.starts_with('_'))
                    .collect(),
            ),
            _ => Value::Object(Map::new()),
        }
    }

    pub fn total_group_timeout_secs(&self) -> u64 {
        self.testers
            .iter()
            .flat_map(|t| t.test_data.iter())
            .map(|g| g.timeout)
            .sum()
    }
}

/// A test job: run every selected test group of a settings record against
/// one student submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Equal to the tests id
    pub id: String,
    pub settings_id: u64,
    pub files_url: String,
    #[serde(default)]
    pub categories: Vec<String>,
    pub user: String,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    pub timeout_secs: u64,
    pub queue: QueueName,
    pub enqueued_at: DateTime<Utc>,
}

/// Refresh of a settings record's harness files and environments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsJob {
    pub id: String,
    pub settings_id: u64,
    pub user: String,
    #[serde(default)]
    pub file_url: Option<String>,
    pub timeout_secs: u64,
    pub enqueued_at: DateTime<Utc>,
}

impl SettingsJob {
    pub fn job_id(settings_id: u64) -> String {
        format!("settings_{}", settings_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueuedJob {
    Test(JobRequest),
    Settings(SettingsJob),
}

impl QueuedJob {
    pub fn id(&self) -> &str {
        match self {
            QueuedJob::Test(job) => &job.id,
            QueuedJob::Settings(job) => &job.id,
        }
    }

    pub fn timeout_secs(&self) -> u64 {
        match self {
            QueuedJob::Test(job) => job.timeout_secs,
            QueuedJob::Settings(job) => job.timeout_secs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    #[serde(alias = "success")]
    Pass,
    Partial,
    #[serde(alias = "failure")]
    Fail,
    Error,
    ErrorAll,
}

/// One line of tester output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub status: OutcomeStatus,
    pub name: String,
    #[serde(default, alias = "output", alias = "errors", deserialize_with = "null_as_default")]
    pub message: String,
    #[serde(default, alias = "marks_earned", skip_serializing_if = "Option::is_none")]
    pub points_earned: Option<f64>,
    #[serde(default, alias = "marks_total", skip_serializing_if = "Option::is_none")]
    pub points_total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TestOutcome {
    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Error,
            name: name.into(),
            message: message.into(),
            points_earned: None,
            points_total: None,
            category: None,
            description: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestGroupResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tester_type: Option<TesterType>,
    pub time_ms: u64,
    /// Set to the budget (seconds) when the group was killed on timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub tests: Vec<TestOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub malformed: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra_info: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Finished,
    Error,
}

/// Everything persisted for one finished (or failed) job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub status: EnvelopeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub test_groups: Vec<TestGroupResult>,
    pub points_earned: f64,
    pub points_total: f64,
    #[serde(default)]
    pub annotations: Vec<Value>,
    #[serde(default)]
    pub tags: Vec<Value>,
    #[serde(default)]
    pub overall_comments: Vec<String>,
    #[serde(default)]
    pub feedback: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ResultEnvelope {
    pub fn finished(test_groups: Vec<TestGroupResult>) -> Self {
        let mut envelope = Self {
            status: EnvelopeStatus::Finished,
            error: None,
            test_groups,
            points_earned: 0.0,
            points_total: 0.0,
            annotations: Vec::new(),
            tags: Vec::new(),
            overall_comments: Vec::new(),
            feedback: Vec::new(),
            started_at: None,
            finished_at: None,
        };
        envelope.recompute_points();
        envelope
    }

    /// Envelope for a job that failed before producing any outcome: a single
    /// synthetic error test so clients always see at least one entry.
    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        let group = TestGroupResult {
            tests: vec![TestOutcome::error("job", message.clone())],
            ..Default::default()
        };
        let mut envelope = Self::finished(vec![group]);
        envelope.status = EnvelopeStatus::Error;
        envelope.error = Some(message);
        envelope
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &TestOutcome> {
        self.test_groups.iter().flat_map(|g| g.tests.iter())
    }

    pub fn recompute_points(&mut self) {
        self.points_earned = self.outcomes().filter_map(|o| o.points_earned).sum();
        self.points_total = self.outcomes().filter_map(|o| o.points_total).sum();
    }
}
