//! Bounded per-job progress trails.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde::Serialize;
use serde_json::{Map, Value};

use mediaq_core::JobId;
use mediaq_core::config::progress::ProgressConfig;
use mediaq_entity::progress::{EventType, ProgressEvent, ProgressSummary};

/// Percentage reported while a job is post-processing.
const POST_PROCESSING_PERCENTAGE: f64 = 95.0;

/// Aggregate progress across tracked jobs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressAggregate {
    /// Jobs matching the filter.
    pub jobs: usize,
    /// Job counts keyed by current phase.
    pub by_phase: BTreeMap<String, usize>,
    /// Mean completion percentage of the matching jobs.
    pub average_percentage: f64,
}

#[derive(Debug, Clone)]
struct Trail {
    events: VecDeque<ProgressEvent>,
    phase: EventType,
    percentage: f64,
    current_bytes: u64,
    total_bytes: u64,
    speed_bps: f64,
    eta_seconds: Option<f64>,
    updated_at: DateTime<Utc>,
}

impl Trail {
    fn new(first: &ProgressEvent) -> Self {
        Self {
            events: VecDeque::new(),
            phase: EventType::Created,
            percentage: 0.0,
            current_bytes: 0,
            total_bytes: 0,
            speed_bps: 0.0,
            eta_seconds: None,
            updated_at: first.timestamp,
        }
    }

    fn push(&mut self, event: ProgressEvent, capacity: usize) {
        self.apply(&event);
        self.events.push_back(event);
        while self.events.len() > capacity {
            self.events.pop_front();
        }
    }

    fn apply(&mut self, event: &ProgressEvent) {
        self.updated_at = event.timestamp;
        match event.event_type {
            EventType::Progress => {
                if let Some(current) = event.detail_u64("current_bytes") {
                    self.current_bytes = current;
                }
                if let Some(total) = event.detail_u64("total_bytes") {
                    self.total_bytes = total;
                }
                if let Some(speed) = event.detail_f64("speed_bps") {
                    self.speed_bps = speed.max(0.0);
                }
                let percentage = event.detail_f64("percentage").or_else(|| {
                    (self.total_bytes > 0)
                        .then(|| self.current_bytes as f64 / self.total_bytes as f64 * 100.0)
                });
                if let Some(percentage) = percentage {
                    self.percentage = percentage.clamp(0.0, 100.0);
                }
                self.eta_seconds = (self.speed_bps > 0.0 && self.total_bytes > self.current_bytes)
                    .then(|| (self.total_bytes - self.current_bytes) as f64 / self.speed_bps);
            }
            EventType::Started => {
                self.phase = EventType::Started;
                self.percentage = 0.0;
                self.eta_seconds = None;
            }
            EventType::PostProcessing => {
                self.phase = EventType::PostProcessing;
                self.percentage = POST_PROCESSING_PERCENTAGE;
                self.eta_seconds = None;
            }
            EventType::Completed => {
                self.phase = EventType::Completed;
                self.percentage = 100.0;
                self.eta_seconds = None;
            }
            other => {
                self.phase = other;
                self.eta_seconds = None;
            }
        }
    }

    fn summary(&self, job_id: JobId) -> ProgressSummary {
        ProgressSummary {
            job_id,
            phase: self.phase,
            percentage: self.percentage,
            current_bytes: self.current_bytes,
            total_bytes: self.total_bytes,
            speed_bps: self.speed_bps,
            eta_seconds: self.eta_seconds,
            updated_at: self.updated_at,
            event_count: self.events.len(),
        }
    }
}

/// Append-only progress store.
///
/// Each job's trail is an immutable snapshot replaced on every append, so
/// readers never wait on writers. Trails expire `retention` after their
/// last append; the oldest events are evicted once a trail is full.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    trails: Cache<JobId, Arc<Trail>>,
    max_events_per_job: usize,
}

impl ProgressTracker {
    /// Create a tracker from the `[progress]` configuration section.
    pub fn new(config: &ProgressConfig) -> Self {
        let trails = Cache::builder()
            .max_capacity(config.max_tracked_jobs)
            .time_to_live(config.retention())
            .build();

        Self {
            trails,
            max_events_per_job: config.max_events_per_job.max(1),
        }
    }

    /// Append an event to a job's trail and return it.
    pub fn record(
        &self,
        job_id: JobId,
        event_type: EventType,
        details: Map<String, Value>,
    ) -> ProgressEvent {
        let event = ProgressEvent::new(job_id, event_type, details);
        let capacity = self.max_events_per_job;
        let appended = event.clone();
        self.trails.entry(job_id).and_upsert_with(move |existing| {
            let mut trail = match existing {
                Some(entry) => Trail::clone(&entry.into_value()),
                None => Trail::new(&appended),
            };
            trail.push(appended, capacity);
            Arc::new(trail)
        });
        tracing::trace!("Recorded '{}' event for job {}", event_type, job_id);
        event
    }

    /// Events for a job in append order, limited to the newest `limit`.
    pub fn events(&self, job_id: JobId, limit: Option<usize>) -> Vec<ProgressEvent> {
        let Some(trail) = self.trails.get(&job_id) else {
            return Vec::new();
        };
        let skip = limit
            .map(|limit| trail.events.len().saturating_sub(limit))
            .unwrap_or(0);
        trail.events.iter().skip(skip).cloned().collect()
    }

    /// Derived summary of a job's latest progress.
    pub fn summary(&self, job_id: JobId) -> Option<ProgressSummary> {
        self.trails.get(&job_id).map(|trail| trail.summary(job_id))
    }

    /// Counts and mean percentage across tracked jobs, optionally limited to
    /// jobs currently in `phase`.
    pub fn aggregate(&self, phase: Option<EventType>) -> ProgressAggregate {
        let mut aggregate = ProgressAggregate::default();
        let mut total_percentage = 0.0;
        for (_, trail) in self.trails.iter() {
            if phase.is_some_and(|phase| phase != trail.phase) {
                continue;
            }
            aggregate.jobs += 1;
            total_percentage += trail.percentage;
            *aggregate
                .by_phase
                .entry(trail.phase.as_str().to_string())
                .or_default() += 1;
        }
        if aggregate.jobs > 0 {
            aggregate.average_percentage = total_percentage / aggregate.jobs as f64;
        }
        aggregate
    }

    /// Drop a job's trail.
    pub fn forget(&self, job_id: JobId) {
        self.trails.invalidate(&job_id);
    }

    /// Approximate number of tracked trails.
    pub fn tracked_jobs(&self) -> u64 {
        self.trails.run_pending_tasks();
        self.trails.entry_count()
    }
}
