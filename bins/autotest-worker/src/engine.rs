/// Execution Engine - One Job, Start to Finish
///
/// **Core Responsibility:**
/// Take a claimed job, run every selected test group in the worker's
/// working directory and hand back a result envelope.
///
/// **State Machine:**
/// `Claimed → EnvPreparing → Running → ResultCollected → CleanedUp`,
/// with `Failed` reachable from any state. A failed job still reaches
/// `CleanedUp`.
///
/// **Rules:**
/// - At most one job per settings id runs at a time (Redis settings lock)
/// - Clean-up runs on every path, before the lock is released
/// - Every failure becomes an error envelope; nothing here stops the worker
///
/// **Architectural Boundary:**
/// The engine never forks or kills by itself (see `sandbox.rs`) and never
/// parses tester output by itself (see `results.rs`).

use crate::config::WorkerRuntime;
use crate::environment::{self, EnvVars};
use crate::results::{self, GroupExecutionOutput, SideChannel};
use crate::rlimit::ResourceSettings;
use crate::sandbox::{self, TesterInvocation};
use crate::tester::TesterAdapter;
use crate::workdir;
use anyhow::{anyhow, bail, Context};
use autotest_common::redis as store;
use autotest_common::types::{
    EnvStatus, JobRequest, ResultEnvelope, SettingsJob, SettingsRecord, TestGroup, TestGroupResult, TesterSpec,
};
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use redis::aio::ConnectionManager;
use serde_json::json;
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Component, Path};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

const LOCK_POLL_START: Duration = Duration::from_millis(50);
const LOCK_POLL_MAX: Duration = Duration::from_secs(1);
const MAX_FEEDBACK_BYTES: u64 = 10 * 1024 * 1024;

pub const ORPHAN_MESSAGE: &str = "The worker stopped while this job was running";
pub const ENV_NOT_READY_MESSAGE: &str =
    "The tester environment for these settings is still being prepared, try again once the settings update finishes";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Claimed,
    EnvPreparing,
    Running,
    ResultCollected,
    Failed,
    CleanedUp,
}

/// Why a job produced an error envelope
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Tester environment missing or failed to build
    #[error("{0}")]
    Environment(String),
    /// The tester or the submission itself misbehaved
    #[error("{0}")]
    Execution(String),
    /// Redis or the filesystem failed underneath the job
    #[error("{0}")]
    Infrastructure(String),
}

impl ExecutionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::Environment(_) => "environment",
            ExecutionError::Execution(_) => "execution",
            ExecutionError::Infrastructure(_) => "infrastructure",
        }
    }

    fn environment(e: anyhow::Error) -> Self {
        ExecutionError::Environment(format!("{:#}", e))
    }

    fn infrastructure(e: impl Into<anyhow::Error>) -> Self {
        ExecutionError::Infrastructure(format!("{:#}", e.into()))
    }
}

pub(crate) struct JobTracker {
    job_id: String,
    states: Vec<JobState>,
}

impl JobTracker {
    fn new(job_id: &str) -> Self {
        debug!(job_id = %job_id, state = ?JobState::Claimed, "Job claimed");
        Self {
            job_id: job_id.to_string(),
            states: vec![JobState::Claimed],
        }
    }

    fn advance(&mut self, next: JobState) {
        let from = self.states.last().copied().unwrap_or(JobState::Claimed);
        debug!(job_id = %self.job_id, from = ?from, to = ?next, "Job state transition");
        self.states.push(next);
    }
}

/// Final envelope plus the states the job went through
#[derive(Debug)]
pub struct JobReport {
    pub envelope: ResultEnvelope,
    pub states: Vec<JobState>,
}

/// Holder of the per-settings execution lock.
///
/// Dropping an unreleased guard releases the lock from a spawned task.
pub struct SettingsLockGuard {
    conn: ConnectionManager,
    settings_id: u64,
    token: String,
    released: bool,
}

impl SettingsLockGuard {
    /// Wait for the lock until `deadline`. `None` when the deadline passed.
    pub async fn acquire(
        conn: &ConnectionManager,
        settings_id: u64,
        ttl: Duration,
        deadline: Instant,
    ) -> anyhow::Result<Option<Self>> {
        let mut conn = conn.clone();
        let token = uuid::Uuid::new_v4().to_string();
        let mut wait = LOCK_POLL_START;
        let mut contended = false;

        loop {
            if store::try_acquire_settings_lock(&mut conn, settings_id, &token, ttl).await? {
                if contended {
                    info!(settings_id, "Settings lock acquired after waiting");
                }
                return Ok(Some(Self {
                    conn,
                    settings_id,
                    token,
                    released: false,
                }));
            }
            if !contended {
                debug!(settings_id, "Settings lock is held by another job, waiting");
                contended = true;
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(wait.min(deadline - now)).await;
            wait = (wait * 2).min(LOCK_POLL_MAX);
        }
    }

    pub async fn release(mut self) -> anyhow::Result<()> {
        self.released = true;
        let still_owned = store::release_settings_lock(&mut self.conn, self.settings_id, &self.token).await?;
        if !still_owned {
            warn!(settings_id = self.settings_id, "Settings lock had expired before release");
        }
        Ok(())
    }
}

impl Drop for SettingsLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let mut conn = self.conn.clone();
        let settings_id = self.settings_id;
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(e) = store::release_settings_lock(&mut conn, settings_id, &token).await {
                warn!(settings_id, error = %e, "Failed to release settings lock");
            }
        });
    }
}

fn lock_ttl(rt: &WorkerRuntime, timeout_secs: u64) -> Duration {
    Duration::from_secs(timeout_secs + rt.config.lock_margin_secs)
}

/// Run a test job and build its envelope. Never fails: every error ends
/// up inside the envelope.
#[instrument(skip(rt, conn, job), fields(job_id = %job.id, settings_id = job.settings_id))]
pub async fn execute_test_job(rt: &WorkerRuntime, conn: &mut ConnectionManager, job: &JobRequest) -> JobReport {
    let started_at = Utc::now();
    let mut tracker = JobTracker::new(&job.id);
    let budget = Duration::from_secs(job.timeout_secs);

    // Waiting for the lock has its own allowance; the job budget starts
    // once the lock is held.
    let lock_wait = Instant::now() + budget;
    let lock = SettingsLockGuard::acquire(conn, job.settings_id, lock_ttl(rt, job.timeout_secs), lock_wait).await;
    let result = match &lock {
        Ok(Some(_)) => run_locked(rt, conn, job, Instant::now() + budget, &mut tracker).await,
        Ok(None) => Err(ExecutionError::Execution(
            "Timed out waiting for another job of the same settings to finish".to_string(),
        )),
        Err(e) => Err(ExecutionError::Infrastructure(format!("{:#}", e))),
    };

    finish(rt, job, started_at, tracker, result, lock).await
}

async fn finish(
    rt: &WorkerRuntime,
    job: &JobRequest,
    started_at: chrono::DateTime<Utc>,
    mut tracker: JobTracker,
    result: Result<ResultEnvelope, ExecutionError>,
    lock: anyhow::Result<Option<SettingsLockGuard>>,
) -> JobReport {
    let mut envelope = match result {
        Ok(envelope) => envelope,
        Err(e) => {
            tracker.advance(JobState::Failed);
            match e {
                ExecutionError::Infrastructure(_) => {
                    error!(job_id = %job.id, kind = e.kind(), error = %e, "Job failed")
                }
                _ => warn!(job_id = %job.id, kind = e.kind(), error = %e, "Job failed"),
            }
            ResultEnvelope::error(e.to_string())
        }
    };

    cleanup_job(rt, &job.id).await;
    tracker.advance(JobState::CleanedUp);

    if let Ok(Some(lock)) = lock {
        if let Err(e) = lock.release().await {
            warn!(job_id = %job.id, error = %e, "Failed to release settings lock");
        }
    }

    envelope.started_at = Some(started_at);
    envelope.finished_at = Some(Utc::now());
    JobReport {
        envelope,
        states: tracker.states,
    }
}

async fn run_locked(
    rt: &WorkerRuntime,
    conn: &mut ConnectionManager,
    job: &JobRequest,
    deadline: Instant,
    tracker: &mut JobTracker,
) -> Result<ResultEnvelope, ExecutionError> {
    let mut settings = store::get_settings(conn, job.settings_id)
        .await
        .map_err(ExecutionError::infrastructure)?
        .ok_or_else(|| ExecutionError::Execution(format!("Settings {} no longer exist", job.settings_id)))?;

    settings.last_access = Some(Utc::now().timestamp());
    if let Err(e) = store::put_settings(conn, job.settings_id, &settings).await {
        warn!(job_id = %job.id, error = %e, "Failed to stamp settings access time");
    }

    match settings.env_status {
        EnvStatus::Ready => {}
        EnvStatus::Error => {
            return Err(ExecutionError::Environment(
                settings
                    .error
                    .clone()
                    .unwrap_or_else(|| "The tester environment for these settings failed to build".to_string()),
            ))
        }
        EnvStatus::Setup => return Err(ExecutionError::Environment(ENV_NOT_READY_MESSAGE.to_string())),
    }

    run_prepared(rt, job, &settings, deadline, tracker).await
}

/// Everything that happens while the settings lock is held: environments,
/// files, tester runs and aggregation. Needs no Redis.
pub(crate) async fn run_prepared(
    rt: &WorkerRuntime,
    job: &JobRequest,
    settings: &SettingsRecord,
    deadline: Instant,
    tracker: &mut JobTracker,
) -> Result<ResultEnvelope, ExecutionError> {
    tracker.advance(JobState::EnvPreparing);
    let limits = rt.job_limits();
    let mut prepared: Vec<(&TesterSpec, &TesterAdapter, EnvVars)> = Vec::new();
    for (idx, spec) in settings.testers.iter().enumerate() {
        let adapter = rt.registry.resolve(spec.tester_type).map_err(ExecutionError::environment)?;
        let vars = environment::prepare(&rt.config, job.settings_id, idx, spec, adapter.env_strategy, false)
            .await
            .map_err(ExecutionError::environment)?;
        prepared.push((spec, adapter, vars));
    }

    let staging = rt.staging_dir(&job.id);
    rt.fetcher
        .fetch_into(&job.files_url, &staging)
        .await
        .map_err(|e| ExecutionError::Execution(format!("Could not fetch submission files: {:#}", e)))?;

    let workdir = rt.workdir();
    let (student, harness) = {
        let identity = rt.identity.clone();
        let target = workdir.clone();
        let harness_dir = rt.config.harness_dir(job.settings_id);
        tokio::task::spawn_blocking(move || workdir::setup_files(&staging, &target, &identity, &harness_dir))
            .await
            .map_err(ExecutionError::infrastructure)?
            .map_err(ExecutionError::infrastructure)?
    };
    debug!(
        job_id = %job.id,
        student_files = student.len(),
        harness_files = harness.len(),
        "Working directory ready"
    );

    tracker.advance(JobState::Running);
    let mut side = SideChannel::default();
    let mut groups: Vec<TestGroupResult> = Vec::new();
    for (spec, adapter, vars) in &prepared {
        for group in spec.test_data.iter().filter(|g| g.matches(&job.categories)) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(job_id = %job.id, tester = %spec.tester_type, "Job time budget exhausted, skipping group");
                groups.push(results::budget_exhausted(spec.tester_type, group.extra_info.clone()));
                continue;
            }
            let timeout = Duration::from_secs(group.timeout).min(remaining);

            let output = run_group(rt, job, spec, group, adapter, vars, &limits, timeout).await;
            info!(
                job_id = %job.id,
                tester = %spec.tester_type,
                exit_code = ?output.exit_code,
                timed_out = output.timed_out,
                execution_ms = output.elapsed_ms,
                "Test group finished"
            );
            groups.push(results::evaluate_group(&output, &mut side));
            collect_feedback(&workdir, group, &mut side);
        }
    }

    let envelope = results::aggregate(groups, side);
    tracker.advance(JobState::ResultCollected);
    Ok(envelope)
}

async fn run_group(
    rt: &WorkerRuntime,
    job: &JobRequest,
    spec: &TesterSpec,
    group: &TestGroup,
    adapter: &TesterAdapter,
    vars: &EnvVars,
    limits: &ResourceSettings,
    timeout: Duration,
) -> GroupExecutionOutput {
    let mut output = GroupExecutionOutput {
        tester_type: Some(spec.tester_type),
        timeout_secs: timeout.as_secs_f64().ceil() as u64,
        extra_info: group.extra_info.clone(),
        ..Default::default()
    };

    let spec_json = match serde_json::to_value(spec.narrowed_to(group)) {
        Ok(value) => value,
        Err(e) => {
            output.launch_error = Some(format!("Could not encode tester spec: {}", e));
            return output;
        }
    };

    // Environment-provided variables win over job-provided ones
    let mut env = job.env_vars.clone();
    env.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));

    let workdir = rt.workdir();
    let invocation = TesterInvocation {
        program: &adapter.runner.program,
        args: &adapter.runner.args,
        cwd: &workdir,
        env: &env,
        stdin: sandbox::encode_stdin(spec.tester_type.as_str(), &limits.to_wire(), &spec_json),
        timeout,
    };

    match sandbox::run_tester(&rt.identity, limits, invocation).await {
        Ok(process) => {
            output.exit_code = process.status.and_then(|s| s.code());
            output.stdout = process.stdout;
            output.stderr = process.stderr;
            output.timed_out = process.timed_out;
            output.elapsed_ms = process.elapsed.as_millis() as u64;
        }
        Err(e) => output.launch_error = Some(format!("{:#}", e)),
    }
    output
}

fn is_relative_inside(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Read one feedback file the tester left in `workdir`.
///
/// `Ok(None)` when the file was not produced. Only regular files whose
/// real location is inside the working directory are read: symlinks are
/// refused at every path component.
fn read_feedback_file(workdir: &Path, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
    if !is_relative_inside(name) {
        bail!("path leaves the working directory");
    }
    let path = workdir.join(name);
    let meta = match std::fs::symlink_metadata(&path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if !meta.file_type().is_file() {
        bail!("not a regular file");
    }

    let root = workdir.canonicalize()?;
    let parent = path.parent().unwrap_or(workdir).canonicalize()?;
    if !parent.starts_with(&root) {
        bail!("path leaves the working directory");
    }

    let file = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_NOFOLLOW | nix::libc::O_NONBLOCK)
        .open(parent.join(path.file_name().unwrap_or_default()))?;
    let meta = file.metadata()?;
    if !meta.is_file() {
        bail!("not a regular file");
    }
    if meta.len() > MAX_FEEDBACK_BYTES {
        bail!("file too large ({} bytes)", meta.len());
    }

    let mut bytes = Vec::with_capacity(meta.len() as usize);
    file.take(MAX_FEEDBACK_BYTES).read_to_end(&mut bytes)?;
    Ok(Some(bytes))
}

/// Attach the feedback files a group asked for, base64 encoded
fn collect_feedback(workdir: &Path, group: &TestGroup, side: &mut SideChannel) {
    for name in &group.feedback_file_names {
        match read_feedback_file(workdir, name) {
            Ok(Some(bytes)) => side.feedback.push(json!({
                "filename": name,
                "content": general_purpose::STANDARD.encode(bytes),
                "encoding": "base64",
            })),
            Ok(None) => debug!(file = %name, "Feedback file was not produced"),
            Err(e) => warn!(file = %name, error = %format!("{:#}", e), "Feedback file skipped"),
        }
    }
}

/// Kill leftover tester processes and remove the job's files
pub async fn cleanup_job(rt: &WorkerRuntime, job_id: &str) {
    if let Err(e) = sandbox::stop_tester_processes(&rt.identity).await {
        warn!(job_id = %job_id, error = %e, "Failed to stop tester processes");
    }
    if let Err(e) = workdir::clear_working_directory(&rt.workdir(), &rt.identity).await {
        error!(job_id = %job_id, error = %e, "Failed to clear working directory");
    }
    let staging = rt.staging_dir(job_id);
    if staging.exists() {
        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            warn!(job_id = %job_id, error = %e, "Failed to remove staging directory");
        }
    }
}

/// Refresh a settings record's harness and environments, then record the
/// resulting environment status on it.
#[instrument(skip(rt, conn, job), fields(job_id = %job.id, settings_id = job.settings_id))]
pub async fn execute_settings_job(
    rt: &WorkerRuntime,
    conn: &mut ConnectionManager,
    job: &SettingsJob,
) -> anyhow::Result<EnvStatus> {
    let deadline = Instant::now() + Duration::from_secs(job.timeout_secs);
    let lock = match SettingsLockGuard::acquire(conn, job.settings_id, lock_ttl(rt, job.timeout_secs), deadline).await {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            let failed: anyhow::Result<()> = Err(anyhow!(
                "Timed out after {} seconds waiting for running tests of these settings to finish",
                job.timeout_secs
            ));
            return record_env_status(conn, job.settings_id, &failed).await;
        }
        Err(e) => {
            let failed: anyhow::Result<()> = Err(e.context("Could not take the settings lock"));
            return record_env_status(conn, job.settings_id, &failed).await;
        }
    };

    let remaining = deadline.saturating_duration_since(Instant::now());
    let outcome = match tokio::time::timeout(remaining, refresh_settings(rt, conn, job)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(anyhow!("Settings update timed out after {} seconds", job.timeout_secs)),
    };

    let staging = rt.staging_dir(&job.id);
    if staging.exists() {
        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            warn!(error = %e, "Failed to remove staging directory");
        }
    }

    let status = record_env_status(conn, job.settings_id, &outcome).await;
    lock.release().await?;
    status
}

async fn refresh_settings(rt: &WorkerRuntime, conn: &mut ConnectionManager, job: &SettingsJob) -> anyhow::Result<()> {
    let settings = store::get_settings(conn, job.settings_id)
        .await?
        .ok_or_else(|| anyhow!("Settings {} no longer exist", job.settings_id))?;

    // The stored record wins: a later update may have been folded into this job
    if let Some(url) = settings.file_url.as_ref().or(job.file_url.as_ref()) {
        let staging = rt.staging_dir(&job.id);
        let files = rt.fetcher.fetch_into(url, &staging).await.context("Could not fetch test files")?;
        let harness_dir = rt.config.harness_dir(job.settings_id);
        let installed = tokio::task::spawn_blocking(move || workdir::replace_harness(&staging, &harness_dir)).await??;
        info!(downloaded = files.len(), installed = installed.len(), "Test files replaced");
    }

    for (idx, spec) in settings.testers.iter().enumerate() {
        let adapter = rt.registry.resolve(spec.tester_type)?;
        environment::prepare(&rt.config, job.settings_id, idx, spec, adapter.env_strategy, true).await?;
    }
    Ok(())
}

async fn record_env_status(
    conn: &mut ConnectionManager,
    settings_id: u64,
    outcome: &anyhow::Result<()>,
) -> anyhow::Result<EnvStatus> {
    let Some(mut settings) = store::get_settings(conn, settings_id).await? else {
        warn!(settings_id, "Settings disappeared during update");
        return Ok(EnvStatus::Error);
    };
    match outcome {
        Ok(()) => {
            settings.env_status = EnvStatus::Ready;
            settings.error = None;
        }
        Err(e) => {
            warn!(settings_id, error = %format!("{:#}", e), "Settings environment setup failed");
            settings.env_status = EnvStatus::Error;
            settings.error = Some(format!("{:#}", e));
        }
    }
    store::put_settings(conn, settings_id, &settings).await?;
    Ok(settings.env_status)
}

/// Settle jobs a previous run of this worker left in the running registry
#[instrument(skip(rt, conn), fields(worker = %rt.worker.name))]
pub async fn recover_orphans(rt: &WorkerRuntime, conn: &mut ConnectionManager) -> anyhow::Result<usize> {
    let orphans = store::running_jobs_for(conn, &rt.worker.name).await?;
    for job_id in &orphans {
        warn!(job_id = %job_id, "Recovering job interrupted by a worker restart");
        match job_id.strip_prefix("settings_").and_then(|id| id.parse::<u64>().ok()) {
            Some(settings_id) => {
                if let Some(mut settings) = store::get_settings(conn, settings_id).await? {
                    settings.env_status = EnvStatus::Error;
                    settings.error = Some(ORPHAN_MESSAGE.to_string());
                    store::put_settings(conn, settings_id, &settings).await?;
                }
            }
            None => {
                let mut envelope = ResultEnvelope::error(ORPHAN_MESSAGE);
                envelope.finished_at = Some(Utc::now());
                if !store::store_result_if_absent(conn, job_id, &envelope).await? {
                    debug!(job_id = %job_id, "Result was stored before the restart");
                }
            }
        }
        store::clear_running(conn, job_id).await?;
    }

    sandbox::stop_tester_processes(&rt.identity).await?;
    workdir::clear_working_directory(&rt.workdir(), &rt.identity).await?;
    let staging = rt.staging_root();
    if staging.exists() {
        tokio::fs::remove_dir_all(&staging).await?;
    }
    Ok(orphans.len())
}

#[cfg(test)]
impl JobTracker {
    pub(crate) fn for_test(job_id: &str) -> Self {
        Self::new(job_id)
    }

    pub(crate) fn states(&self) -> &[JobState] {
        &self.states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feedback_names_must_stay_inside() {
        assert!(is_relative_inside("report.txt"));
        assert!(is_relative_inside("out/report.txt"));
        assert!(!is_relative_inside("../report.txt"));
        assert!(!is_relative_inside("/etc/passwd"));
        assert!(!is_relative_inside(""));
    }

    #[test]
    fn test_feedback_file_must_really_be_inside() {
        let tmp = tempfile::TempDir::new().unwrap();
        let workdir = tmp.path().join("work");
        std::fs::create_dir_all(workdir.join("out")).unwrap();
        std::fs::write(tmp.path().join("secret.txt"), "TOP-SECRET").unwrap();
        std::fs::write(workdir.join("out/report.txt"), "fine").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("secret.txt"), workdir.join("leak.txt")).unwrap();
        std::os::unix::fs::symlink(tmp.path(), workdir.join("up")).unwrap();

        assert_eq!(read_feedback_file(&workdir, "out/report.txt").unwrap(), Some(b"fine".to_vec()));
        assert_eq!(read_feedback_file(&workdir, "absent.txt").unwrap(), None);
        assert!(read_feedback_file(&workdir, "leak.txt").is_err());
        assert!(read_feedback_file(&workdir, "up/secret.txt").is_err());
        assert!(read_feedback_file(&workdir, "out").is_err());
        assert!(read_feedback_file(&workdir, "../secret.txt").is_err());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(ExecutionError::Environment("x".into()).kind(), "environment");
        assert_eq!(ExecutionError::infrastructure(anyhow!("disk full")).kind(), "infrastructure");
        assert_eq!(ExecutionError::Execution("boom".into()).to_string(), "boom");
    }

    #[test]
    fn test_tracker_records_transitions() {
        let mut tracker = JobTracker::for_test("7");
        tracker.advance(JobState::EnvPreparing);
        tracker.advance(JobState::Failed);
        tracker.advance(JobState::CleanedUp);
        assert_eq!(
            tracker.states(),
            &[JobState::Claimed, JobState::EnvPreparing, JobState::Failed, JobState::CleanedUp]
        );
    }
}
