mod config;
mod engine;
mod environment;
mod fetch;
mod results;
mod rlimit;
mod sandbox;
mod tester;
mod workdir;


use autotest_common::config::AutotestConfig;
use autotest_common::queue::QueueName;
use autotest_common::redis;
use autotest_common::types::QueuedJob;
use config::WorkerRuntime;
use tokio::signal;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// How long one claim attempt waits, so shutdown and idle bookkeeping run
const POP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Autotest worker booting...");

    let config = AutotestConfig::load_default().map_err(|e| {
        error!("Failed to load autotester configuration: {:#}", e);
        error!("Set AUTOTEST_CONFIG or create config/autotest.json");
        e
    })?;

    let worker_name = std::env::var("WORKER_NAME").ok();
    let runtime = WorkerRuntime::load(config, worker_name.as_deref())?;

    info!(
        worker = %runtime.worker.name,
        user = %runtime.worker.user,
        queues = ?runtime.worker.queues,
        testers = ?runtime.registry.kinds(),
        "Worker configured"
    );
    if !runtime.limits.is_empty() {
        debug!(limits = %runtime.limits.to_wire(), "Resource limits for tester processes");
    }

    // Connect to Redis
    let redis_url = runtime.config.redis_url();
    let client = ::redis::Client::open(redis_url.as_str())?;
    let mut redis_conn = ::redis::aio::ConnectionManager::new(client).await?;

    info!("Connected to Redis: {}", redis_url);

    match engine::recover_orphans(&runtime, &mut redis_conn).await {
        Ok(0) => {}
        Ok(count) => warn!(count, "Settled jobs left running by a previous worker run"),
        Err(e) => error!(error = %e, "Failed to recover interrupted jobs"),
    }

    // Setup graceful shutdown
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install CTRL+C signal handler");
            std::future::pending::<()>().await;
        }
        warn!("Received shutdown signal, stopping worker...");
    };

    tokio::select! {
        _ = worker_loop(&mut redis_conn, &runtime) => {},
        _ = shutdown => {},
    }

    engine::cleanup_job(&runtime, "shutdown").await;
    info!("Worker shutdown complete");
    Ok(())
}

#[instrument(skip(redis_conn, runtime), fields(worker = %runtime.worker.name))]
async fn worker_loop(redis_conn: &mut ::redis::aio::ConnectionManager, runtime: &WorkerRuntime) {
    let queues = &runtime.worker.queues;
    let worker = runtime.worker.name.as_str();
    loop {
        // Claiming also records the job as running on this worker
        match redis::pop_job(redis_conn, queues, worker, POP_TIMEOUT).await {
            Ok(Some((queue, job))) => {
                let job_id = job.id().to_string();
                info!(job_id = %job_id, queue = %queue, timeout_secs = job.timeout_secs(), "Received job");

                if let Err(e) = redis::update_pop_interval_stat(redis_conn, queue).await {
                    warn!(queue = %queue, error = %e, "Failed to update pop statistics");
                }

                let start = std::time::Instant::now();
                run_job(redis_conn, runtime, &job).await;
                info!(
                    job_id = %job_id,
                    total_ms = start.elapsed().as_millis() as u64,
                    "Job finished"
                );

                if let Err(e) = redis::clear_running(redis_conn, &job_id).await {
                    warn!(job_id = %job_id, error = %e, "Failed to unregister running job");
                }
                reset_drained_queues(redis_conn, queues).await;
            }
            Ok(None) => {
                reset_drained_queues(redis_conn, queues).await;
                continue;
            }
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
        }
    }
}

async fn run_job(redis_conn: &mut ::redis::aio::ConnectionManager, runtime: &WorkerRuntime, job: &QueuedJob) {
    match job {
        QueuedJob::Test(request) => {
            let report = engine::execute_test_job(runtime, redis_conn, request).await;
            debug!(job_id = %request.id, states = ?report.states, "Job state history");

            // Persist result to Redis
            match redis::store_result(redis_conn, &request.id, &report.envelope).await {
                Ok(_) => {
                    info!(
                        job_id = %request.id,
                        status = ?report.envelope.status,
                        points = report.envelope.points_earned,
                        "Result persisted to Redis"
                    );
                }
                Err(e) => {
                    // Non-fatal - worker continues
                    error!(job_id = %request.id, error = %e, "Failed to persist result");
                }
            }
        }
        QueuedJob::Settings(settings_job) => match engine::execute_settings_job(runtime, redis_conn, settings_job).await {
            Ok(status) => info!(settings_id = settings_job.settings_id, env_status = ?status, "Settings updated"),
            Err(e) => error!(settings_id = settings_job.settings_id, error = %format!("{:#}", e), "Settings update failed"),
        },
    }
}

/// Restart the pop-rate burst of every served queue that is now empty
async fn reset_drained_queues(redis_conn: &mut ::redis::aio::ConnectionManager, queues: &[QueueName]) {
    match redis::clear_drained_pop_stats(redis_conn, queues).await {
        Ok(cleared) if !cleared.is_empty() => debug!(queues = ?cleared, "Reset pop statistics of drained queues"),
        Ok(_) => {}
        Err(e) => debug!(error = %e, "Failed to reset pop statistics"),
    }
}
