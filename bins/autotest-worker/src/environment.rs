// Per-settings tester environments.
//
// Python-family testers get a virtualenv under
// <workspace>/environments/<settings id>/<tester index>/venv, rebuilt when the
// tester's env_data changes. Everything else runs the configured interpreter.

use anyhow::{bail, Context, Result};
use autotest_common::config::{AutotestConfig, EnvStrategy};
use autotest_common::types::TesterSpec;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

const FINGERPRINT_FILE: &str = "env_data.json";

/// Environment variables a tester process gets from its environment
pub type EnvVars = BTreeMap<String, String>;

fn fingerprint(spec: &TesterSpec) -> String {
    spec.env_data.as_ref().map(Value::to_string).unwrap_or_default()
}

fn requirements(spec: &TesterSpec) -> Vec<String> {
    match spec.env_data.as_ref().and_then(|d| d.get("pip_requirements")) {
        Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
        Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_str()).map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

fn base_interpreter(config: &AutotestConfig, spec: &TesterSpec) -> PathBuf {
    match spec.env_data.as_ref().and_then(|d| d.get("python_version")).and_then(Value::as_str) {
        Some(version) if !version.is_empty() => PathBuf::from(format!("python{}", version)),
        _ => config.python.clone(),
    }
}

fn venv_python(venv: &Path) -> PathBuf {
    venv.join("bin").join("python")
}

/// True when the venv under `dir` is missing or was built from other env_data
pub fn needs_rebuild(dir: &Path, spec: &TesterSpec) -> bool {
    if !venv_python(&dir.join("venv")).exists() {
        return true;
    }
    match std::fs::read_to_string(dir.join(FINGERPRINT_FILE)) {
        Ok(stored) => stored != fingerprint(spec),
        Err(_) => true,
    }
}

async fn run_step(program: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to run {}", program.display()))?;
    if !output.status.success() {
        bail!(
            "{} {} failed: {}",
            program.display(),
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

async fn build_venv(config: &AutotestConfig, dir: &Path, spec: &TesterSpec) -> Result<()> {
    if dir.exists() {
        tokio::fs::remove_dir_all(dir).await?;
    }
    tokio::fs::create_dir_all(dir).await?;

    let venv = dir.join("venv");
    let venv_str = venv.to_string_lossy().to_string();
    run_step(&base_interpreter(config, spec), &["-m", "venv", &venv_str]).await?;

    let reqs = requirements(spec);
    if !reqs.is_empty() {
        let mut args = vec!["-m", "pip", "install", "--quiet"];
        args.extend(reqs.iter().map(String::as_str));
        run_step(&venv_python(&venv), &args).await?;
    }

    tokio::fs::write(dir.join(FINGERPRINT_FILE), fingerprint(spec)).await?;
    Ok(())
}

/// Locate or build the environment of one tester of a settings record and
/// return the variables its process needs.
pub async fn prepare(
    config: &AutotestConfig,
    settings_id: u64,
    tester_index: usize,
    spec: &TesterSpec,
    strategy: EnvStrategy,
    force_rebuild: bool,
) -> Result<EnvVars> {
    let mut vars = EnvVars::new();
    match strategy {
        EnvStrategy::Default => {
            vars.insert("PYTHON".to_string(), config.python.to_string_lossy().to_string());
        }
        EnvStrategy::PythonVenv => {
            let dir = config.environment_dir(settings_id, tester_index);
            if force_rebuild || needs_rebuild(&dir, spec) {
                info!(settings_id, tester_index, tester = %spec.tester_type, "Building tester environment");
                build_venv(config, &dir, spec)
                    .await
                    .with_context(|| format!("Environment build failed for {} tester", spec.tester_type))?;
            } else {
                debug!(settings_id, tester_index, "Reusing tester environment");
            }
            let venv = dir.join("venv");
            vars.insert("PYTHON".to_string(), venv_python(&venv).to_string_lossy().to_string());
            vars.insert("VIRTUAL_ENV".to_string(), venv.to_string_lossy().to_string());
        }
    }
    Ok(vars)
}
