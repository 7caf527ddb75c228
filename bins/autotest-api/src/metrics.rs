use autotest_common::queue::QueueName;
use autotest_common::redis;
use prometheus::{IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::warn;

pub struct Metrics {
    registry: Registry,
    pub jobs_enqueued: IntCounterVec,
    pub settings_updates: IntCounter,
    pub results_fetched: IntCounter,
    pub auth_failures: IntCounter,
    queue_length: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("autotest".into()), None)?;

        let jobs_enqueued = IntCounterVec::new(
            Opts::new("jobs_enqueued", "Number of test jobs enqueued"),
            &["queue"],
        )?;
        let settings_updates = IntCounter::new("settings_updates", "Number of settings refresh jobs enqueued")?;
        let results_fetched = IntCounter::new("results_fetched", "Number of test results returned")?;
        let auth_failures = IntCounter::new("auth_failures", "Number of rejected requests")?;
        let queue_length = IntGaugeVec::new(Opts::new("queue_length", "Pending jobs per queue"), &["queue"])?;

        registry.register(Box::new(jobs_enqueued.clone()))?;
        registry.register(Box::new(settings_updates.clone()))?;
        registry.register(Box::new(results_fetched.clone()))?;
        registry.register(Box::new(auth_failures.clone()))?;
        registry.register(Box::new(queue_length.clone()))?;

        Ok(Self {
            registry,
            jobs_enqueued,
            settings_updates,
            results_fetched,
            auth_failures,
            queue_length,
        })
    }

    /// Refresh the queue gauges and render everything in text format
    pub async fn render(&self, conn: &mut ::redis::aio::ConnectionManager) -> prometheus::Result<String> {
        for queue in QueueName::ALL {
            match redis::queue_length(conn, queue).await {
                Ok(len) => self.queue_length.with_label_values(&[queue.as_str()]).set(len as i64),
                Err(e) => warn!(queue = %queue, error = %e, "Failed to read queue length"),
            }
        }
        self.encode()
    }

    fn encode(&self) -> prometheus::Result<String> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}
