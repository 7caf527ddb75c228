use crate::error::{StoreError, StoreResult};
use crate::queue::QueueName;
use crate::types::{QueuedJob, ResultEnvelope, SettingsRecord, TesterType};
use base64::{engine::general_purpose, Engine as _};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// Job Record Store - key layout and access layer
///
/// Every key the API, the workers and the CLI touch is derived here, so
/// the processes never drift apart. Multi-step updates that must not be
/// torn run as Lua scripts: the job claim and the settings lock release.

pub const PREFIX: &str = "autotest";
pub const USERS_KEY: &str = "autotest:users";
pub const CREDENTIALS_KEY: &str = "autotest:user_credentials";
pub const SETTINGS_KEY: &str = "autotest:settings";
pub const SETTINGS_ID_KEY: &str = "autotest:settings_id";
pub const TESTS_KEY: &str = "autotest:tests";
pub const TESTS_ID_KEY: &str = "autotest:tests_id";
pub const JOBS_KEY: &str = "autotest:jobs";
pub const RUNNING_KEY: &str = "autotest:running";
pub const POP_INTERVAL_KEY: &str = "autotest:pop_intervals";
pub const SCHEMA_KEY: &str = "autotest:schema";
pub const INSTALLED_TESTERS_KEY: &str = "autotest:installed_testers";

pub const QUEUE_PREFIX: &str = "autotest:queue";
pub const RESULT_PREFIX: &str = "autotest:test_results";
pub const LOCK_PREFIX: &str = "autotest:lock:settings";

/// Results nobody fetched are dropped after a week
pub const RESULT_TTL_SECS: u64 = 7 * 24 * 60 * 60;

const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(200);

// KEYS: queue keys in priority order, then the pending-jobs hash and the
// running hash. Ids whose payload is gone are dropped and the pop goes on.
const CLAIM_JOB_SCRIPT: &str = r#"
local jobs = KEYS[#KEYS - 1]
local running = KEYS[#KEYS]
for i = 1, #KEYS - 2 do
    local id = redis.call("lpop", KEYS[i])
    while id do
        local payload = redis.call("hget", jobs, id)
        if payload then
            redis.call("hdel", jobs, id)
            redis.call("hset", running, id, ARGV[1])
            return {KEYS[i], payload}
        end
        id = redis.call("lpop", KEYS[i])
    end
end
return false
"#;

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

pub fn queue_key(queue: QueueName) -> String {
    format!("{}:{}", QUEUE_PREFIX, queue)
}

pub fn result_key(tests_id: &str) -> String {
    format!("{}:{}", RESULT_PREFIX, tests_id)
}

pub fn settings_lock_key(settings_id: u64) -> String {
    format!("{}:{}", LOCK_PREFIX, settings_id)
}

fn queue_from_key(key: &str) -> Option<QueueName> {
    key.strip_prefix(QUEUE_PREFIX)?
        .strip_prefix(':')?
        .parse()
        .ok()
}

/// Opaque 24-byte random token, base64 encoded
pub fn generate_api_key() -> String {
    let mut bytes = Vec::with_capacity(24);
    bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(&uuid::Uuid::new_v4().as_bytes()[..8]);
    general_purpose::STANDARD.encode(bytes)
}

// ---------------------------------------------------------------- users

/// Register a new user and return its API key.
///
/// The user name is claimed first so two concurrent registrations of the
/// same name cannot both succeed.
pub async fn register_user(
    conn: &mut ConnectionManager,
    user_name: &str,
    credentials: &serde_json::Value,
) -> StoreResult<String> {
    let payload = serde_json::to_string(credentials)?;
    let claimed: bool = conn.hset_nx(CREDENTIALS_KEY, user_name, payload).await?;
    if !claimed {
        return Err(StoreError::UserExists(user_name.to_string()));
    }

    loop {
        let key = generate_api_key();
        let inserted: bool = conn.hset_nx(USERS_KEY, &key, user_name).await?;
        if inserted {
            return Ok(key);
        }
    }
}

pub async fn reset_credentials(
    conn: &mut ConnectionManager,
    user_name: &str,
    credentials: &serde_json::Value,
) -> StoreResult<()> {
    let payload = serde_json::to_string(credentials)?;
    let _: () = conn.hset(CREDENTIALS_KEY, user_name, payload).await?;
    Ok(())
}

/// Resolve an API key to its user name
pub async fn authorize_user(
    conn: &mut ConnectionManager,
    api_key: Option<&str>,
) -> StoreResult<String> {
    let api_key = api_key.ok_or(StoreError::Unauthorized)?;
    let user: Option<String> = conn.hget(USERS_KEY, api_key).await?;
    user.ok_or(StoreError::Unauthorized)
}

// ---------------------------------------------------------------- settings

pub async fn create_settings(
    conn: &mut ConnectionManager,
    record: &SettingsRecord,
) -> StoreResult<u64> {
    let id: u64 = conn.incr(SETTINGS_ID_KEY, 1).await?;
    put_settings(conn, id, record).await?;
    Ok(id)
}

pub async fn get_settings(
    conn: &mut ConnectionManager,
    settings_id: u64,
) -> StoreResult<Option<SettingsRecord>> {
    let payload: Option<String> = conn.hget(SETTINGS_KEY, settings_id).await?;
    match payload {
        Some(data) => Ok(Some(serde_json::from_str(&data)?)),
        None => Ok(None),
    }
}

pub async fn put_settings(
    conn: &mut ConnectionManager,
    settings_id: u64,
    record: &SettingsRecord,
) -> StoreResult<()> {
    let payload = serde_json::to_string(record)?;
    let _: () = conn.hset(SETTINGS_KEY, settings_id, payload).await?;
    Ok(())
}

/// Load a settings record and check that `user` owns it
pub async fn authorize_settings(
    conn: &mut ConnectionManager,
    user: &str,
    settings_id: u64,
) -> StoreResult<SettingsRecord> {
    let record = get_settings(conn, settings_id)
        .await?
        .ok_or(StoreError::NotFound("settings"))?;
    if record.user != user {
        return Err(StoreError::Unauthorized);
    }
    Ok(record)
}

// ---------------------------------------------------------------- test runs

/// Allocate a tests id linked to `settings_id`
pub async fn register_test_run(conn: &mut ConnectionManager, settings_id: u64) -> StoreResult<u64> {
    let id: u64 = conn.incr(TESTS_ID_KEY, 1).await?;
    let _: () = conn.hset(TESTS_KEY, id, settings_id).await?;
    Ok(id)
}

/// Check that `tests_id` was created for `settings_id`
pub async fn authorize_tests(
    conn: &mut ConnectionManager,
    settings_id: u64,
    tests_id: u64,
) -> StoreResult<()> {
    let linked: Option<u64> = conn.hget(TESTS_KEY, tests_id).await?;
    match linked {
        None => Err(StoreError::NotFound("test")),
        Some(id) if id != settings_id => Err(StoreError::Unauthorized),
        Some(_) => Ok(()),
    }
}

// ---------------------------------------------------------------- queues

/// Enqueue a job. Uses HSETNX on the pending-jobs hash so an id that is
/// still outstanding is rejected instead of executed twice.
pub async fn push_job(
    conn: &mut ConnectionManager,
    queue: QueueName,
    job: &QueuedJob,
) -> StoreResult<()> {
    let payload = serde_json::to_string(job)?;
    let inserted: bool = conn.hset_nx(JOBS_KEY, job.id(), payload).await?;
    if !inserted {
        return Err(StoreError::AlreadyQueued(job.id().to_string()));
    }
    let _: () = conn.rpush(queue_key(queue), job.id()).await?;
    Ok(())
}

/// Claim the next job from the first non-empty queue in `queues`.
///
/// The claim script pops the id, takes its payload and records it as
/// running on `worker` in one step, so a worker that dies right after a
/// claim still leaves the job in the running registry. Queues are checked
/// left to right, which is what gives workers their queue priority order.
/// Polls until `timeout` elapses and returns `None` if nothing arrived.
pub async fn pop_job(
    conn: &mut ConnectionManager,
    queues: &[QueueName],
    worker: &str,
    timeout: Duration,
) -> StoreResult<Option<(QueueName, QueuedJob)>> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(claimed) = claim_job(conn, queues, worker).await? {
            return Ok(Some(claimed));
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(CLAIM_POLL_INTERVAL.min(deadline - now)).await;
    }
}

/// One non-blocking claim attempt, see `pop_job`
pub async fn claim_job(
    conn: &mut ConnectionManager,
    queues: &[QueueName],
    worker: &str,
) -> StoreResult<Option<(QueueName, QueuedJob)>> {
    let script = redis::Script::new(CLAIM_JOB_SCRIPT);
    let mut invocation = script.prepare_invoke();
    for queue in queues {
        invocation.key(queue_key(*queue));
    }
    invocation.key(JOBS_KEY).key(RUNNING_KEY).arg(worker);

    let claimed: Option<(String, String)> = invocation.invoke_async(conn).await?;
    let Some((key, payload)) = claimed else {
        return Ok(None);
    };
    let job: QueuedJob = serde_json::from_str(&payload)?;
    match queue_from_key(&key) {
        Some(queue) => Ok(Some((queue, job))),
        None => {
            warn!(key = %key, job_id = %job.id(), "Claimed from an unknown queue key");
            Ok(None)
        }
    }
}

pub async fn queue_length(conn: &mut ConnectionManager, queue: QueueName) -> StoreResult<usize> {
    Ok(conn.llen(queue_key(queue)).await?)
}

pub async fn clear_running(conn: &mut ConnectionManager, job_id: &str) -> StoreResult<()> {
    let _: () = conn.hdel(RUNNING_KEY, job_id).await?;
    Ok(())
}

/// Ids of jobs recorded as running on `worker`
pub async fn running_jobs_for(conn: &mut ConnectionManager, worker: &str) -> StoreResult<Vec<String>> {
    let running: HashMap<String, String> = conn.hgetall(RUNNING_KEY).await?;
    let mut ids: Vec<String> = running
        .into_iter()
        .filter(|(_, w)| w == worker)
        .map(|(id, _)| id)
        .collect();
    ids.sort();
    Ok(ids)
}

// ---------------------------------------------------------------- results

pub async fn store_result(
    conn: &mut ConnectionManager,
    tests_id: &str,
    result: &ResultEnvelope,
) -> StoreResult<()> {
    let payload = serde_json::to_string(result)?;
    let _: () = conn.set_ex(result_key(tests_id), payload, RESULT_TTL_SECS as _).await?;
    Ok(())
}

/// Store `result` unless one is already there. Returns whether it was written.
pub async fn store_result_if_absent(
    conn: &mut ConnectionManager,
    tests_id: &str,
    result: &ResultEnvelope,
) -> StoreResult<bool> {
    let payload = serde_json::to_string(result)?;
    let reply: Option<String> = redis::cmd("SET")
        .arg(result_key(tests_id))
        .arg(payload)
        .arg("NX")
        .arg("EX")
        .arg(RESULT_TTL_SECS)
        .query_async(conn)
        .await?;
    Ok(reply.is_some())
}

/// Fetch a persisted result.
///
/// Unless `keep_alive` is set the result and its tests id → settings id link
/// are deleted, so a second read reports not found.
pub async fn get_result(
    conn: &mut ConnectionManager,
    tests_id: u64,
    keep_alive: bool,
) -> StoreResult<serde_json::Value> {
    let key = result_key(&tests_id.to_string());
    let payload: Option<String> = conn.get(&key).await?;
    let payload = payload.ok_or(StoreError::NotFound("test result"))?;
    let result = serde_json::from_str(&payload)?;

    if !keep_alive {
        let _: () = conn.del(&key).await?;
        let _: () = conn.hdel(TESTS_KEY, tests_id).await?;
    }
    Ok(result)
}

// ---------------------------------------------------------------- pop intervals

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Record a pop from `queue`: first-pop time is set once per burst, last-pop
/// time and count always move.
pub async fn update_pop_interval_stat(conn: &mut ConnectionManager, queue: QueueName) -> StoreResult<()> {
    let now = now_secs();
    let _: () = conn.hset_nx(POP_INTERVAL_KEY, format!("{}_start", queue), now).await?;
    let _: () = conn.hset(POP_INTERVAL_KEY, format!("{}_last", queue), now).await?;
    let _: () = conn.hincr(POP_INTERVAL_KEY, format!("{}_count", queue), 1).await?;
    Ok(())
}

/// Reset the burst statistics of a queue that has drained
pub async fn clear_pop_interval_stat(conn: &mut ConnectionManager, queue: QueueName) -> StoreResult<()> {
    let _: () = conn.hdel(POP_INTERVAL_KEY, format!("{}_start", queue)).await?;
    let _: () = conn.hset(POP_INTERVAL_KEY, format!("{}_last", queue), 0).await?;
    let _: () = conn.hset(POP_INTERVAL_KEY, format!("{}_count", queue), 0).await?;
    Ok(())
}

/// Clear the burst statistics of every queue in `queues` that is empty.
/// Returns the queues that were reset.
pub async fn clear_drained_pop_stats(
    conn: &mut ConnectionManager,
    queues: &[QueueName],
) -> StoreResult<Vec<QueueName>> {
    let mut cleared = Vec::new();
    for queue in queues {
        if queue_length(conn, *queue).await? == 0 {
            clear_pop_interval_stat(conn, *queue).await?;
            cleared.push(*queue);
        }
    }
    Ok(cleared)
}

pub async fn get_pop_interval_stat(
    conn: &mut ConnectionManager,
    queue: QueueName,
) -> StoreResult<(Option<f64>, Option<f64>, Option<u64>)> {
    let start: Option<f64> = conn.hget(POP_INTERVAL_KEY, format!("{}_start", queue)).await?;
    let last: Option<f64> = conn.hget(POP_INTERVAL_KEY, format!("{}_last", queue)).await?;
    let count: Option<u64> = conn.hget(POP_INTERVAL_KEY, format!("{}_count", queue)).await?;
    Ok((start, last, count))
}

/// Average seconds between pops in the current burst, `None` when there is
/// no burst in progress.
pub fn average_pop_interval(start: Option<f64>, last: Option<f64>, count: Option<u64>) -> Option<f64> {
    let (start, last, count) = (start?, last?, count?);
    let intervals = count.saturating_sub(1);
    if intervals == 0 {
        return Some(0.0);
    }
    Some((last - start) / intervals as f64)
}

pub async fn get_avg_pop_interval(conn: &mut ConnectionManager, queue: QueueName) -> StoreResult<Option<f64>> {
    let (start, last, count) = get_pop_interval_stat(conn, queue).await?;
    Ok(average_pop_interval(start, last, count))
}

// ---------------------------------------------------------------- settings lock

/// Try to take the per-settings execution lock. Never blocks.
pub async fn try_acquire_settings_lock(
    conn: &mut ConnectionManager,
    settings_id: u64,
    token: &str,
    ttl: Duration,
) -> StoreResult<bool> {
    let reply: Option<String> = redis::cmd("SET")
        .arg(settings_lock_key(settings_id))
        .arg(token)
        .arg("NX")
        .arg("PX")
        .arg(ttl.as_millis().max(1) as u64)
        .query_async(conn)
        .await?;
    Ok(reply.is_some())
}

/// Release the lock only if `token` still owns it
pub async fn release_settings_lock(
    conn: &mut ConnectionManager,
    settings_id: u64,
    token: &str,
) -> StoreResult<bool> {
    let deleted: i64 = redis::Script::new(RELEASE_LOCK_SCRIPT)
        .key(settings_lock_key(settings_id))
        .arg(token)
        .invoke_async(conn)
        .await?;
    Ok(deleted == 1)
}

// ---------------------------------------------------------------- installation

/// Record the settings schema and the tester kinds this installation runs
pub async fn record_installation(
    conn: &mut ConnectionManager,
    schema: &serde_json::Value,
    testers: &[TesterType],
) -> StoreResult<()> {
    let names: Vec<&str> = testers.iter().map(|t| t.as_str()).collect();
    let _: () = conn.set(SCHEMA_KEY, serde_json::to_string(schema)?).await?;
    let _: () = conn.set(INSTALLED_TESTERS_KEY, serde_json::to_string(&names)?).await?;
    Ok(())
}

pub async fn get_schema(conn: &mut ConnectionManager) -> StoreResult<serde_json::Value> {
    let payload: Option<String> = conn.get(SCHEMA_KEY).await?;
    match payload {
        Some(data) => Ok(serde_json::from_str(&data)?),
        None => Ok(serde_json::Value::Object(Default::default())),
    }
}

/// Tester kinds recorded by the last install; empty if never installed
pub async fn installed_testers(conn: &mut ConnectionManager) -> StoreResult<Vec<TesterType>> {
    let payload: Option<String> = conn.get(INSTALLED_TESTERS_KEY).await?;
    match payload {
        Some(data) => Ok(serde_json::from_str(&data)?),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobRequest, SettingsJob};

    #[test]
    fn test_queue_naming() {
        assert_eq!(queue_key(QueueName::High), "autotest:queue:high");
        assert_eq!(queue_key(QueueName::Low), "autotest:queue:low");
        assert_eq!(queue_key(QueueName::Batch), "autotest:queue:batch");
        assert_eq!(queue_key(QueueName::Settings), "autotest:queue:settings");
    }

    #[test]
    fn test_queue_key_parses_back() {
        for q in QueueName::ALL {
            assert_eq!(queue_from_key(&queue_key(q)), Some(q));
        }
        assert_eq!(queue_from_key("autotest:queue:single"), None);
        assert_eq!(queue_from_key("other:queue:high"), None);
    }

    #[test]
    fn test_result_key_deterministic() {
        assert_eq!(result_key("12"), result_key("12"));
        assert_eq!(result_key("12"), "autotest:test_results:12");
        assert_eq!(settings_lock_key(3), "autotest:lock:settings:3");
    }

    #[test]
    fn test_api_keys_are_unique_and_sized() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert_ne!(a, b);
        assert_eq!(general_purpose::STANDARD.decode(&a).unwrap().len(), 24);
    }

    #[test]
    fn test_average_pop_interval() {
        assert_eq!(average_pop_interval(None, Some(5.0), Some(3)), None);
        assert_eq!(average_pop_interval(Some(10.0), Some(10.0), Some(1)), Some(0.0));
        assert_eq!(average_pop_interval(Some(10.0), Some(20.0), Some(3)), Some(5.0));
        assert_eq!(average_pop_interval(Some(10.0), Some(0.0), Some(0)), Some(0.0));
    }

    async fn create_redis_conn() -> ConnectionManager {
        let client = redis::Client::open("redis://127.0.0.1:6379")
            .expect("Failed to create Redis client");
        client
            .get_connection_manager()
            .await
            .expect("Failed to connect to Redis")
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_keep_alive_retrieval() {
        let mut conn = create_redis_conn().await;
        let settings_id = create_settings(&mut conn, &SettingsRecord::new("keepalive-user"))
            .await
            .unwrap();
        let tests_id = register_test_run(&mut conn, settings_id).await.unwrap();
        let envelope = ResultEnvelope::error("ImportError: foo");
        store_result(&mut conn, &tests_id.to_string(), &envelope).await.unwrap();

        authorize_tests(&mut conn, settings_id, tests_id).await.unwrap();
        let first = get_result(&mut conn, tests_id, true).await.unwrap();
        let second = get_result(&mut conn, tests_id, true).await.unwrap();
        assert_eq!(first, second);

        let third = get_result(&mut conn, tests_id, false).await.unwrap();
        assert_eq!(first, third);
        assert!(matches!(
            get_result(&mut conn, tests_id, false).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            authorize_tests(&mut conn, settings_id, tests_id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_tests_link_must_match_settings() {
        let mut conn = create_redis_conn().await;
        let owner = create_settings(&mut conn, &SettingsRecord::new("owner")).await.unwrap();
        let other = create_settings(&mut conn, &SettingsRecord::new("other")).await.unwrap();
        let tests_id = register_test_run(&mut conn, owner).await.unwrap();

        assert!(authorize_tests(&mut conn, owner, tests_id).await.is_ok());
        assert!(matches!(
            authorize_tests(&mut conn, other, tests_id).await,
            Err(StoreError::Unauthorized)
        ));
        assert!(matches!(
            authorize_settings(&mut conn, "owner", other).await,
            Err(StoreError::Unauthorized)
        ));
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_duplicate_enqueue_rejected() {
        let mut conn = create_redis_conn().await;
        let id = format!("dup-{}", uuid::Uuid::new_v4());
        let job = QueuedJob::Settings(SettingsJob {
            id: id.clone(),
            settings_id: 1,
            user: "alice".to_string(),
            file_url: None,
            timeout_secs: 10,
            enqueued_at: chrono::Utc::now(),
        });

        push_job(&mut conn, QueueName::Settings, &job).await.unwrap();
        assert!(matches!(
            push_job(&mut conn, QueueName::Settings, &job).await,
            Err(StoreError::AlreadyQueued(_))
        ));
        let _: () = conn.hdel(JOBS_KEY, &id).await.unwrap();
        let _: () = conn.lrem(queue_key(QueueName::Settings), 0, &id).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_pop_respects_queue_order() {
        let mut conn = create_redis_conn().await;
        let make = |queue: QueueName| {
            QueuedJob::Test(JobRequest {
                id: format!("order-{}", uuid::Uuid::new_v4()),
                settings_id: 1,
                files_url: "file:///dev/null".to_string(),
                categories: vec![],
                user: "alice".to_string(),
                env_vars: Default::default(),
                timeout_secs: 10,
                queue,
                enqueued_at: chrono::Utc::now(),
            })
        };
        let low = make(QueueName::Low);
        let high = make(QueueName::High);
        push_job(&mut conn, QueueName::Low, &low).await.unwrap();
        push_job(&mut conn, QueueName::High, &high).await.unwrap();

        let order = [QueueName::High, QueueName::Low];
        let wait = Duration::from_secs(1);
        let (q1, first) = pop_job(&mut conn, &order, "order-worker", wait).await.unwrap().unwrap();
        let (q2, second) = pop_job(&mut conn, &order, "order-worker", wait).await.unwrap().unwrap();
        assert_eq!((q1, first.id()), (QueueName::High, high.id()));
        assert_eq!((q2, second.id()), (QueueName::Low, low.id()));
        clear_running(&mut conn, first.id()).await.unwrap();
        clear_running(&mut conn, second.id()).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_claim_marks_job_running() {
        let mut conn = create_redis_conn().await;
        let worker = format!("claim-{}", uuid::Uuid::new_v4());
        let id = format!("claim-{}", uuid::Uuid::new_v4());
        let job = QueuedJob::Settings(SettingsJob {
            id: id.clone(),
            settings_id: 1,
            user: "alice".to_string(),
            file_url: None,
            timeout_secs: 10,
            enqueued_at: chrono::Utc::now(),
        });

        // An id without a payload is skipped, not returned
        let _: () = conn.rpush(queue_key(QueueName::Batch), "stale-id").await.unwrap();
        push_job(&mut conn, QueueName::Batch, &job).await.unwrap();

        let (queue, claimed) = claim_job(&mut conn, &[QueueName::Batch], &worker).await.unwrap().unwrap();
        assert_eq!(queue, QueueName::Batch);
        assert_eq!(claimed.id(), id);

        // Recorded as running before the caller did anything else
        assert_eq!(running_jobs_for(&mut conn, &worker).await.unwrap(), vec![id.clone()]);
        let pending: Option<String> = conn.hget(JOBS_KEY, &id).await.unwrap();
        assert!(pending.is_none());
        assert!(claim_job(&mut conn, &[QueueName::Batch], &worker).await.unwrap().is_none());

        let start = std::time::Instant::now();
        assert!(pop_job(&mut conn, &[QueueName::Batch], &worker, Duration::from_millis(300))
            .await
            .unwrap()
            .is_none());
        assert!(start.elapsed() >= Duration::from_millis(300));

        clear_running(&mut conn, &id).await.unwrap();
        assert!(running_jobs_for(&mut conn, &worker).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_recovery_result_never_overwrites() {
        let mut conn = create_redis_conn().await;
        let tests_id = format!("nx-{}", uuid::Uuid::new_v4());
        let real = ResultEnvelope::error("real result");
        let late = ResultEnvelope::error("late result");

        assert!(store_result_if_absent(&mut conn, &tests_id, &real).await.unwrap());
        assert!(!store_result_if_absent(&mut conn, &tests_id, &late).await.unwrap());
        let stored: Option<String> = conn.get(result_key(&tests_id)).await.unwrap();
        assert!(stored.unwrap().contains("real result"));
        let ttl: i64 = conn.ttl(result_key(&tests_id)).await.unwrap();
        assert!(ttl > 0);
        let _: () = conn.del(result_key(&tests_id)).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_drained_queue_stats_are_cleared() {
        let mut conn = create_redis_conn().await;
        let id = format!("drain-{}", uuid::Uuid::new_v4());
        let job = QueuedJob::Settings(SettingsJob {
            id: id.clone(),
            settings_id: 1,
            user: "alice".to_string(),
            file_url: None,
            timeout_secs: 10,
            enqueued_at: chrono::Utc::now(),
        });

        // Only the queue still holding a job keeps its burst
        let _: () = conn.del(queue_key(QueueName::High)).await.unwrap();
        update_pop_interval_stat(&mut conn, QueueName::High).await.unwrap();
        update_pop_interval_stat(&mut conn, QueueName::Settings).await.unwrap();
        push_job(&mut conn, QueueName::Settings, &job).await.unwrap();

        let cleared = clear_drained_pop_stats(&mut conn, &[QueueName::Settings, QueueName::High])
            .await
            .unwrap();
        assert_eq!(cleared, vec![QueueName::High]);
        assert_eq!(get_avg_pop_interval(&mut conn, QueueName::High).await.unwrap(), None);
        assert!(get_avg_pop_interval(&mut conn, QueueName::Settings).await.unwrap().is_some());

        let _: () = conn.hdel(JOBS_KEY, &id).await.unwrap();
        let _: () = conn.lrem(queue_key(QueueName::Settings), 0, &id).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_settings_lock_is_exclusive() {
        let mut conn = create_redis_conn().await;
        let settings_id = 900_000 + (uuid::Uuid::new_v4().as_u128() % 1000) as u64;
        let ttl = Duration::from_secs(5);

        assert!(try_acquire_settings_lock(&mut conn, settings_id, "a", ttl).await.unwrap());
        assert!(!try_acquire_settings_lock(&mut conn, settings_id, "b", ttl).await.unwrap());
        assert!(!release_settings_lock(&mut conn, settings_id, "b").await.unwrap());
        assert!(release_settings_lock(&mut conn, settings_id, "a").await.unwrap());
        assert!(try_acquire_settings_lock(&mut conn, settings_id, "b", ttl).await.unwrap());
        assert!(release_settings_lock(&mut conn, settings_id, "b").await.unwrap());
    }
}
