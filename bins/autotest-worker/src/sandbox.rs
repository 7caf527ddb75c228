/// Sandbox - Process Control for Tester Subprocesses
///
/// **Core Responsibility:**
/// The only place that forks, drops privileges, sets limits and kills.
///
/// **Launch Rules:**
/// - uid/gid switched to the worker identity (skipped when already running
///   as it)
/// - `setsid()` first, then resource limits, both before exec
/// - stdin carries the tester type, the resource settings, then the spec
/// - on timeout the whole process group gets SIGKILL

use crate::rlimit::ResourceSettings;
use crate::workdir::Identity;
use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setsid, Pid};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::{ExitStatus, Output, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long stdout/stderr readers may linger after the process is gone
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);
/// Captured bytes per stream; the rest is read and dropped
pub const MAX_OUTPUT_BYTES: u64 = 4 * 1024 * 1024;

/// One tester launch
pub struct TesterInvocation<'a> {
    pub program: &'a Path,
    pub args: &'a [String],
    pub cwd: &'a Path,
    pub env: &'a BTreeMap<String, String>,
    pub stdin: Vec<u8>,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct ProcessOutput {
    /// `None` when the process was killed on timeout
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status.map(|s| s.success()).unwrap_or(false)
    }
}

/// Tester stdin: type line, resource settings line, spec JSON
pub fn encode_stdin(tester_type: &str, resource_settings: &serde_json::Value, spec: &serde_json::Value) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(tester_type.as_bytes());
    payload.push(b'\n');
    payload.extend_from_slice(serde_json::json!({ "resource_settings": resource_settings }).to_string().as_bytes());
    payload.push(b'\n');
    payload.extend_from_slice(spec.to_string().as_bytes());
    payload
}

fn identity_command(identity: &Identity, program: impl AsRef<std::ffi::OsStr>) -> Command {
    let mut cmd = Command::new(program);
    if !identity.is_current() {
        cmd.uid(identity.uid.as_raw()).gid(identity.gid.as_raw());
    }
    cmd
}

/// Keep the first `limit` bytes of `stream`, then discard the rest so the
/// writer never blocks on a full pipe.
async fn read_capped<R>(mut stream: R, limit: u64) -> String
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let _ = (&mut stream).take(limit).read_to_end(&mut buf).await;
    if buf.len() as u64 == limit {
        if let Ok(dropped) = tokio::io::copy(&mut stream, &mut tokio::io::sink()).await {
            if dropped > 0 {
                warn!(kept = limit, dropped, "Tester output truncated");
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn spawn_reader<R>(stream: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match stream {
            Some(s) => read_capped(s, MAX_OUTPUT_BYTES).await,
            None => String::new(),
        }
    })
}

async fn drain(handle: JoinHandle<String>) -> String {
    let abort = handle.abort_handle();
    match tokio::time::timeout(PIPE_DRAIN_GRACE, handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            abort.abort();
            String::new()
        }
    }
}

fn kill_group(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid = pid, error = %e, "killpg failed"),
    }
}

/// Run a tester as `identity` under `limits`.
///
/// Errors only when the process cannot be started; exit status, output and
/// timeout are reported in [`ProcessOutput`].
pub async fn run_tester(identity: &Identity, limits: &ResourceSettings, inv: TesterInvocation<'_>) -> Result<ProcessOutput> {
    let mut cmd = identity_command(identity, inv.program);
    cmd.args(inv.args)
        .current_dir(inv.cwd)
        .envs(inv.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let limits = limits.clone();
    // SAFETY: the hook only calls setsid and setrlimit, both
    // async-signal-safe, and touches no state shared with the parent.
    unsafe {
        cmd.pre_exec(move || {
            setsid().map_err(std::io::Error::from)?;
            limits.apply()
        });
    }

    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to start {}", inv.program.display()))?;
    let pid = child.id();
    debug!(pid = ?pid, program = %inv.program.display(), "Tester started");

    if let Some(mut stdin) = child.stdin.take() {
        let payload = inv.stdin;
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(error = %e, "Tester closed stdin early");
            }
        });
    }
    let stdout = spawn_reader(child.stdout.take());
    let stderr = spawn_reader(child.stderr.take());

    let (status, timed_out) = match tokio::time::timeout(inv.timeout, child.wait()).await {
        Ok(status) => (Some(status.context("Failed to wait for tester")?), false),
        Err(_) => {
            warn!(pid = ?pid, timeout_secs = inv.timeout.as_secs(), "Tester timed out, killing process group");
            (None, true)
        }
    };

    // Stragglers in the group are killed on the normal path too
    if let Some(pid) = pid {
        kill_group(pid);
    }
    if timed_out {
        let _ = child.wait().await;
    }

    Ok(ProcessOutput {
        status,
        stdout: drain(stdout).await,
        stderr: drain(stderr).await,
        timed_out,
        elapsed: start.elapsed(),
    })
}

/// Run a short helper command as `identity` and collect its output
pub async fn run_as(identity: &Identity, program: &str, args: &[&str]) -> Result<Output> {
    identity_command(identity, program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("Failed to run {} as {}", program, identity.name))
}

/// Kill every process owned by the worker identity.
///
/// Skipped when the identity is this process's own, which would kill the
/// worker itself.
pub async fn stop_tester_processes(identity: &Identity) -> Result<()> {
    if identity.is_current() {
        return Ok(());
    }
    let output = run_as(identity, "kill", &["-9", "-1"]).await?;
    debug!(user = %identity.name, status = ?output.status.code(), "Stopped tester processes");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn shell<'a>(script: &'a [String], cwd: &'a Path, env: &'a BTreeMap<String, String>, timeout: Duration) -> TesterInvocation<'a> {
        TesterInvocation {
            program: Path::new("/bin/sh"),
            args: script,
            cwd,
            env,
            stdin: encode_stdin("py", &json!([]), &json!({"test_data": []})),
            timeout,
        }
    }

    #[test]
    fn test_stdin_layout() {
        let payload = encode_stdin("java", &json!([[7, [512, 1024]]]), &json!({"a": 1}));
        let text = String::from_utf8(payload).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "java");
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(lines[1]).unwrap(),
            json!({"resource_settings": [[7, [512, 1024]]]})
        );
        assert_eq!(serde_json::from_str::<serde_json::Value>(lines[2]).unwrap(), json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_reads_protocol_and_reports_exit() {
        let tmp = TempDir::new().unwrap();
        let identity = Identity::current().unwrap();
        let script = vec!["-c".to_string(), "read kind; echo \"$kind $MARK\"; echo oops >&2; exit 3".to_string()];
        let env = BTreeMap::from([("MARK".to_string(), "x".to_string())]);

        let out = run_tester(&identity, &ResourceSettings::default(), shell(&script, tmp.path(), &env, Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(!out.timed_out);
        assert_eq!(out.status.and_then(|s| s.code()), Some(3));
        assert_eq!(out.stdout.trim(), "py x");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_read_capped_truncates() {
        assert_eq!(read_capped(&b"abcdef"[..], 4).await, "abcd");
        assert_eq!(read_capped(&b"abc"[..], 4).await, "abc");
    }

    #[tokio::test]
    async fn test_runaway_output_is_capped() {
        let tmp = TempDir::new().unwrap();
        let identity = Identity::current().unwrap();
        let script = vec![
            "-c".to_string(),
            format!("head -c {} /dev/zero | tr '\\0' a; echo done >&2", MAX_OUTPUT_BYTES + 1_000_000),
        ];
        let env = BTreeMap::new();

        let out = run_tester(&identity, &ResourceSettings::default(), shell(&script, tmp.path(), &env, Duration::from_secs(20)))
            .await
            .unwrap();
        assert!(!out.timed_out);
        assert!(out.success());
        assert_eq!(out.stdout.len() as u64, MAX_OUTPUT_BYTES);
        assert_eq!(out.stderr.trim(), "done");
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let tmp = TempDir::new().unwrap();
        let identity = Identity::current().unwrap();
        let script = vec!["-c".to_string(), "pwd".to_string()];
        let env = BTreeMap::new();

        let out = run_tester(&identity, &ResourceSettings::default(), shell(&script, tmp.path(), &env, Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(out.success());
        let reported = std::fs::canonicalize(out.stdout.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(tmp.path()).unwrap());
    }

    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let tmp = TempDir::new().unwrap();
        let identity = Identity::current().unwrap();
        let script = vec![
            "-c".to_string(),
            "sleep 30 & echo $! > child.pid; wait".to_string(),
        ];
        let env = BTreeMap::new();

        let out = run_tester(&identity, &ResourceSettings::default(), shell(&script, tmp.path(), &env, Duration::from_millis(500)))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(out.status.is_none());
        assert!(out.elapsed < Duration::from_secs(10));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let pid = std::fs::read_to_string(tmp.path().join("child.pid")).unwrap();
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid.trim())).unwrap_or_default();
        assert!(stat.is_empty() || stat.contains(") Z"), "background child survived: {}", stat);
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let identity = Identity::current().unwrap();
        let env = BTreeMap::new();
        let inv = TesterInvocation {
            program: Path::new("/nonexistent/tester"),
            args: &[],
            cwd: tmp.path(),
            env: &env,
            stdin: Vec::new(),
            timeout: Duration::from_secs(1),
        };
        assert!(run_tester(&identity, &ResourceSettings::default(), inv).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_is_noop_for_own_identity() {
        let identity = Identity::current().unwrap();
        stop_tester_processes(&identity).await.unwrap();
    }
}
