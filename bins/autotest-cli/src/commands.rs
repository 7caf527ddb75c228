// CLI commands for installing and inspecting the autotester
use anyhow::{bail, Context, Result};
use autotest_common::config::AutotestConfig;
use autotest_common::queue::QueueName;
use autotest_common::redis;
use autotest_common::types::TesterType;
use nix::unistd::User;
use serde_json::{json, Value};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Workspace subdirectories every installation needs
const WORKSPACE_DIRS: [&str; 4] = ["workers", "staging", "scripts", "environments"];

/// Load configuration from `path`, or from the default location
pub fn load_config(path: Option<&Path>) -> Result<AutotestConfig> {
    match path {
        Some(path) => AutotestConfig::load(path),
        None => AutotestConfig::load_default(),
    }
}

async fn connect(config: &AutotestConfig) -> Result<::redis::aio::ConnectionManager> {
    let redis_url = config.redis_url();
    let client = ::redis::Client::open(redis_url.as_str()).context("Invalid Redis URL")?;
    ::redis::aio::ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", redis_url))
}

/// Settings schema advertised to clients: the installed tester kinds and
/// the test group fields the workers understand.
pub fn settings_schema(testers: &[TesterType]) -> Value {
    let kinds: Vec<&str> = testers.iter().map(|t| t.as_str()).collect();
    json!({
        "type": "object",
        "properties": {
            "testers": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["tester_type", "test_data"],
                    "properties": {
                        "tester_type": {"type": "string", "enum": kinds},
                        "env_data": {"type": "object"},
                        "test_data": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "required": ["timeout"],
                                "properties": {
                                    "timeout": {"type": "integer", "minimum": 1},
                                    "category": {"type": "array", "items": {"type": "string"}},
                                    "extra_info": {"type": "object"},
                                    "feedback_file_names": {"type": "array", "items": {"type": "string"}}
                                }
                            }
                        }
                    }
                }
            }
        }
    })
}

/// Worker users that do not exist on this host
fn missing_users(config: &AutotestConfig) -> Result<Vec<String>> {
    let mut missing = Vec::new();
    for worker in &config.workers {
        if User::from_name(&worker.user)?.is_none() {
            missing.push(format!("{} (worker {})", worker.user, worker.name));
        }
    }
    Ok(missing)
}

/// Configured testers whose command is present on disk
fn available_testers(config: &AutotestConfig) -> (Vec<TesterType>, Vec<(TesterType, PathBuf)>) {
    let mut available = Vec::new();
    let mut missing = Vec::new();
    for (kind, tester) in &config.testers {
        if tester.command.exists() {
            available.push(*kind);
        } else {
            missing.push((*kind, tester.command.clone()));
        }
    }
    (available, missing)
}

/// Create the workspace tree; returns the directories created
fn create_workspace(config: &AutotestConfig) -> Result<Vec<PathBuf>> {
    let mut created = Vec::new();
    let mut dirs: Vec<PathBuf> = WORKSPACE_DIRS.iter().map(|d| config.workspace.join(d)).collect();
    dirs.insert(0, config.workspace.clone());

    for dir in dirs {
        if !dir.exists() {
            fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
            created.push(dir.clone());
        }
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))?;
    }
    Ok(created)
}

/// Check the host, create the workspace and record schema and testers
pub async fn install(config: &AutotestConfig) -> Result<()> {
    println!("🚀 Installing autotester into {}", config.workspace.display());

    println!("🔌 Checking Redis...");
    let mut conn = connect(config).await?;
    let _: String = ::redis::cmd("PING").query_async(&mut conn).await.context("Redis did not answer PING")?;

    println!("👤 Checking worker users...");
    let missing = missing_users(config)?;
    if !missing.is_empty() {
        for user in &missing {
            println!("  ❌ missing user: {}", user);
        }
        bail!("{} worker user(s) do not exist", missing.len());
    }

    println!("🧪 Checking testers...");
    let (testers, unavailable) = available_testers(config);
    for (kind, command) in &unavailable {
        println!("  ⚠️  {} skipped: {} not found", kind, command.display());
    }
    if testers.is_empty() {
        bail!("No tester command is available");
    }

    println!("📁 Creating workspace...");
    for dir in create_workspace(config)? {
        println!("  created {}", dir.display());
    }

    println!("📝 Recording schema...");
    redis::record_installation(&mut conn, &settings_schema(&testers), &testers).await?;

    println!("✅ Autotester installed!");
    println!(
        "  workers: {}",
        config.workers.iter().map(|w| w.name.as_str()).collect::<Vec<_>>().join(", ")
    );
    println!(
        "  testers: {}",
        testers.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(", ")
    );
    println!("\n📋 Next steps:");
    println!("  1. Register a client: autotest-cli register <name>");
    println!("  2. Start one autotest-worker per worker with WORKER_NAME set");
    Ok(())
}

/// Register an API user directly in Redis
pub async fn register(config: &AutotestConfig, name: &str, auth_type: Option<&str>) -> Result<()> {
    let mut conn = connect(config).await?;
    let credentials = json!({ "auth_type": auth_type, "credentials": null });
    let api_key = redis::register_user(&mut conn, name, &credentials).await?;

    println!("✅ User '{}' registered", name);
    println!("  Api-Key: {}", api_key);
    Ok(())
}

fn format_interval(interval: Option<f64>) -> String {
    match interval {
        Some(secs) => format!("{:.2}s", secs),
        None => "-".to_string(),
    }
}

/// Print queue lengths and the average interval between pops
pub async fn show_queues(config: &AutotestConfig) -> Result<()> {
    let mut conn = connect(config).await?;

    println!("📊 Queues:\n");
    println!("{:<10} {:<10} {:<15}", "QUEUE", "PENDING", "AVG POP");
    println!("{}", "─".repeat(35));
    for queue in QueueName::ALL {
        let length = redis::queue_length(&mut conn, queue).await?;
        let interval = redis::get_avg_pop_interval(&mut conn, queue).await?;
        println!("{:<10} {:<10} {:<15}", queue.as_str(), length, format_interval(interval));
    }

    println!("\n👷 Workers:");
    for worker in &config.workers {
        let running = redis::running_jobs_for(&mut conn, &worker.name).await?;
        let queues: Vec<&str> = worker.queues.iter().map(|q| q.as_str()).collect();
        let state = if running.is_empty() {
            "idle".to_string()
        } else {
            format!("running {}", running.join(", "))
        };
        println!("  {:<12} [{}] {}", worker.name, queues.join(" > "), state);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_for(workspace: &Path, testers: &str) -> AutotestConfig {
        AutotestConfig::from_json(&format!(
            r#"{{"workspace": "{}", "workers": [{{"name": "w0", "user": "root", "queues": ["high"]}}], "testers": {}}}"#,
            workspace.display(),
            testers
        ))
        .unwrap()
    }

    #[test]
    fn test_schema_lists_installed_testers() {
        let schema = settings_schema(&[TesterType::Py, TesterType::Custom]);
        let kinds = &schema["properties"]["testers"]["items"]["properties"]["tester_type"]["enum"];
        assert_eq!(kinds, &json!(["py", "custom"]));
    }

    #[test]
    fn test_create_workspace_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let config = config_for(&tmp.path().join("ws"), "{}");

        let created = create_workspace(&config).unwrap();
        assert_eq!(created.len(), 5);
        assert!(tmp.path().join("ws/environments").is_dir());
        assert!(create_workspace(&config).unwrap().is_empty());
    }

    #[test]
    fn test_available_testers() {
        let tmp = TempDir::new().unwrap();
        let testers = r#"{"custom": {"command": "/bin/sh"}, "java": {"command": "/nonexistent/java_tester"}}"#;
        let config = config_for(tmp.path(), testers);

        let (available, missing) = available_testers(&config);
        assert_eq!(available, vec![TesterType::Custom]);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].0, TesterType::Java);
    }

    #[test]
    fn test_root_user_exists() {
        let tmp = TempDir::new().unwrap();
        assert!(missing_users(&config_for(tmp.path(), "{}")).unwrap().is_empty());
    }

    #[test]
    fn test_format_interval() {
        assert_eq!(format_interval(Some(1.5)), "1.50s");
        assert_eq!(format_interval(None), "-");
    }
}
