//! Shared test helpers for integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::Instant;

use mediaq_core::JobId;
use mediaq_core::config::SchedulerConfig;
use mediaq_core::config::breaker::BreakerSettings;
use mediaq_entity::{Job, JobSpec, JobStatus};
use mediaq_worker::{
    JobExecutionError, JobHandler, MemoryJobStore, Operation, ProgressReporter, Scheduler,
};

/// Job type served by [`ScriptedHandler`].
pub const SCRIPTED: &str = "scripted";

/// Breaker name used by tests that trip a circuit.
pub const FLAKY: &str = "flaky";

/// How long helpers wait for a job to settle.
const WAIT: Duration = Duration::from_secs(10);

/// Configuration with short delays suitable for tests.
pub fn test_config(concurrency: usize) -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    config.worker.concurrency = concurrency;
    config.worker.poll_interval_ms = 20;
    config.worker.drain_timeout_seconds = 5;
    config.retry.initial_delay_ms = 10;
    config.retry.backoff_factor = 2.0;
    config.retry.max_delay_ms = 40;
    config.retry.max_attempts = 4;
    config.queue.default_max_retries = 0;
    config.breakers.dependencies.insert(
        FLAKY.to_string(),
        BreakerSettings {
            failure_threshold: 2,
            recovery_timeout_seconds: 3600,
        },
    );
    config
}

/// Test application context
pub struct TestApp {
    /// The running scheduler
    pub scheduler: Scheduler,
    /// Handler counters and execution log
    pub tally: Arc<Tally>,
    /// Advisory store the scheduler mirrors to
    pub store: Arc<MemoryJobStore>,
}

impl TestApp {
    /// Start a scheduler with `concurrency` workers and a scripted handler.
    pub fn new(concurrency: usize) -> Self {
        Self::with_config(test_config(concurrency))
    }

    /// Start a scheduler with an explicit configuration.
    pub fn with_config(config: SchedulerConfig) -> Self {
        Self::start(config, ScriptedHandler::new(), Arc::new(MemoryJobStore::new()))
    }

    /// Start a scheduler whose scripted handler is guarded by `dependency`.
    pub fn with_dependency(concurrency: usize, dependency: &str) -> Self {
        Self::with_config_and_dependency(test_config(concurrency), dependency)
    }

    /// Start a scheduler with an explicit configuration and dependency.
    pub fn with_config_and_dependency(config: SchedulerConfig, dependency: &str) -> Self {
        let handler = ScriptedHandler::new().with_dependency(dependency);
        Self::start(config, handler, Arc::new(MemoryJobStore::new()))
    }

    /// Start a scheduler mirroring to an existing store.
    pub fn with_store(concurrency: usize, store: Arc<MemoryJobStore>) -> Self {
        Self::start(test_config(concurrency), ScriptedHandler::new(), store)
    }

    fn start(config: SchedulerConfig, handler: ScriptedHandler, store: Arc<MemoryJobStore>) -> Self {
        let tally = Arc::clone(&handler.tally);
        let scheduler = Scheduler::builder(config)
            .handler(Arc::new(handler))
            .store(store.clone())
            .start()
            .expect("Failed to start scheduler");
        Self {
            scheduler,
            tally,
            store,
        }
    }

    /// Enqueue a scripted job and return its id.
    pub async fn submit(&self, spec: JobSpec) -> JobId {
        self.scheduler
            .enqueue(spec)
            .await
            .expect("Failed to enqueue job")
    }

    /// Poll until the job reaches `status`, panicking after a deadline.
    pub async fn wait_for_status(&self, job_id: JobId, status: JobStatus) -> Job {
        self.wait_for_status_within(job_id, status, WAIT).await
    }

    /// Like [`TestApp::wait_for_status`], with an explicit deadline.
    pub async fn wait_for_status_within(
        &self,
        job_id: JobId,
        status: JobStatus,
        within: Duration,
    ) -> Job {
        let deadline = Instant::now() + within;
        loop {
            let job = self
                .scheduler
                .status(job_id)
                .await
                .expect("Job should exist");
            if job.status == status {
                return job;
            }
            assert!(
                Instant::now() < deadline,
                "Job {} stuck in '{}' while waiting for '{}'",
                job_id,
                job.status,
                status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the job is terminal.
    pub async fn wait_for_terminal(&self, job_id: JobId) -> Job {
        let deadline = Instant::now() + WAIT;
        loop {
            let job = self
                .scheduler
                .status(job_id)
                .await
                .expect("Job should exist");
            if job.is_terminal() {
                return job;
            }
            assert!(
                Instant::now() < deadline,
                "Job {} did not finish, last status '{}'",
                job_id,
                job.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Spec for a scripted job.
///
/// `outcomes` lists what each attempt does, the last entry repeating:
/// `"ok"`, `"transient"`, `"permanent"`, `"hang"` (sleep until cancelled
/// or timed out), or `"panic"`.
pub fn scripted(correlation_id: &str, outcomes: &[&str]) -> JobSpec {
    JobSpec::new(correlation_id, SCRIPTED).with_payload(json!({ "outcomes": outcomes }))
}

/// Like [`scripted`], with every attempt sleeping `sleep_ms` first.
pub fn scripted_slow(correlation_id: &str, outcomes: &[&str], sleep_ms: u64) -> JobSpec {
    JobSpec::new(correlation_id, SCRIPTED)
        .with_payload(json!({ "outcomes": outcomes, "sleep_ms": sleep_ms }))
}

/// Like [`scripted`], with teardown after cancellation taking `cancel_ms`.
pub fn scripted_slow_cancel(correlation_id: &str, outcomes: &[&str], cancel_ms: u64) -> JobSpec {
    JobSpec::new(correlation_id, SCRIPTED)
        .with_payload(json!({ "outcomes": outcomes, "cancel_ms": cancel_ms }))
}

/// Counters shared between a [`ScriptedHandler`] and the test.
#[derive(Debug, Default)]
pub struct Tally {
    /// Attempts that reached the operation body.
    pub runs: AtomicUsize,
    /// Operations currently running.
    pub active: AtomicUsize,
    /// Highest value `active` reached.
    pub max_active: AtomicUsize,
    /// Correlation ids in the order their attempts ran.
    pub log: Mutex<Vec<String>>,
}

impl Tally {
    /// Number of attempts that reached the operation body.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Highest observed concurrency.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Execution order by correlation id.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().expect("log lock poisoned").clone()
    }
}

/// Handler whose attempts follow the script in the job payload.
#[derive(Debug)]
pub struct ScriptedHandler {
    dependency: String,
    tally: Arc<Tally>,
}

impl ScriptedHandler {
    pub fn new() -> Self {
        Self {
            dependency: "downloader".to_string(),
            tally: Arc::new(Tally::default()),
        }
    }

    pub fn with_dependency(mut self, dependency: &str) -> Self {
        self.dependency = dependency.to_string();
        self
    }
}

impl JobHandler for ScriptedHandler {
    fn job_type(&self) -> &str {
        SCRIPTED
    }

    fn dependency(&self) -> &str {
        &self.dependency
    }

    fn validate(&self, payload: &Value) -> Result<(), String> {
        match payload.get("outcomes").and_then(Value::as_array) {
            Some(outcomes) if !outcomes.is_empty() => Ok(()),
            _ => Err("outcomes must be a non-empty array".to_string()),
        }
    }

    fn create(
        &self,
        job: &Job,
        progress: ProgressReporter,
    ) -> Result<Box<dyn Operation>, JobExecutionError> {
        let outcomes: Vec<String> = job.payload["outcomes"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let index = (job.attempt.max(1) as usize - 1).min(outcomes.len().saturating_sub(1));
        Ok(Box::new(ScriptedOperation {
            correlation_id: job.correlation_id.clone(),
            outcome: outcomes.get(index).cloned().unwrap_or_else(|| "ok".to_string()),
            sleep: Duration::from_millis(job.payload["sleep_ms"].as_u64().unwrap_or(0)),
            cancel_delay: Duration::from_millis(job.payload["cancel_ms"].as_u64().unwrap_or(0)),
            progress,
            tally: Arc::clone(&self.tally),
        }))
    }
}

struct ScriptedOperation {
    correlation_id: String,
    outcome: String,
    sleep: Duration,
    cancel_delay: Duration,
    progress: ProgressReporter,
    tally: Arc<Tally>,
}

/// Decrements the active counter when an attempt ends, however it ends.
struct ActiveGuard(Arc<Tally>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Operation for ScriptedOperation {
    async fn run(&mut self, _deadline: Instant) -> Result<Option<Value>, JobExecutionError> {
        let tally = &self.tally;
        tally.runs.fetch_add(1, Ordering::SeqCst);
        let active = tally.active.fetch_add(1, Ordering::SeqCst) + 1;
        tally.max_active.fetch_max(active, Ordering::SeqCst);
        let _guard = ActiveGuard(Arc::clone(tally));
        tally
            .log
            .lock()
            .expect("log lock poisoned")
            .push(self.correlation_id.clone());

        self.progress.percentage(50.0);
        if !self.sleep.is_zero() {
            tokio::time::sleep(self.sleep).await;
        }

        match self.outcome.as_str() {
            "transient" => Err(JobExecutionError::Transient("connection reset".to_string())),
            "permanent" => Err(JobExecutionError::Permanent("video unavailable".to_string())),
            "hang" => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(None)
            }
            "panic" => panic!("scripted panic"),
            _ => Ok(Some(json!({ "correlation_id": self.correlation_id }))),
        }
    }

    async fn cancel(&mut self) {
        if !self.cancel_delay.is_zero() {
            tokio::time::sleep(self.cancel_delay).await;
        }
    }
}
