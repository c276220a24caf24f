use crate::types::{QueueStats, QueueType};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use labflow_core::TimeRange;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

/// How a terminal job ended, as recorded for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleOutcome {
    /// The job succeeded.
    Succeeded,
    /// The job exhausted its retries.
    Failed,
    /// The job was cancelled before completion.
    Cancelled,
}

/// One terminal job observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSample {
    /// When the job reached its terminal state.
    pub finished_at: DateTime<Utc>,
    /// Milliseconds from admission to first dispatch (or to cancellation).
    pub wait_ms: u64,
    /// Milliseconds spent running, summed over attempts' wall-clock span.
    pub run_ms: u64,
    /// How the job ended.
    pub outcome: SampleOutcome,
}

/// Health classification derived from a queue's score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Score at or above the healthy threshold.
    Healthy,
    /// Score between the degraded and healthy thresholds.
    Degraded,
    /// Score below the degraded threshold.
    Unhealthy,
}

/// Alert severity, mirroring the breached threshold tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// A warning threshold was breached.
    Warning,
    /// A critical threshold was breached.
    Critical,
}

/// A currently-active derived alert.
///
/// Alerts are not stored: one exists exactly while its triggering condition
/// holds, and disappears on the next evaluation once the condition clears.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// The queue the alert concerns.
    pub queue_type: QueueType,
    /// Breached tier.
    pub severity: AlertSeverity,
    /// The specific threshold breach, e.g.
    /// `failure rate 12.0% exceeds 5% warning threshold`.
    pub message: String,
}

/// Thresholds and weights for health scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// Rolling window for health evaluation, in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Failure-rate warning threshold (fraction).
    #[serde(default = "default_failure_warn")]
    pub failure_warn: f64,
    /// Failure-rate critical threshold (fraction).
    #[serde(default = "default_failure_crit")]
    pub failure_crit: f64,
    /// p95 dispatch-latency warning threshold, in milliseconds.
    #[serde(default = "default_wait_warn_ms")]
    pub wait_p95_warn_ms: u64,
    /// p95 dispatch-latency critical threshold, in milliseconds.
    #[serde(default = "default_wait_crit_ms")]
    pub wait_p95_crit_ms: u64,
    /// Backlog-to-concurrency warning ratio.
    #[serde(default = "default_backlog_warn")]
    pub backlog_warn_ratio: f64,
    /// Backlog-to-concurrency critical ratio.
    #[serde(default = "default_backlog_crit")]
    pub backlog_crit_ratio: f64,
    /// Minimum score still considered healthy.
    #[serde(default = "default_healthy_min")]
    pub healthy_min_score: u32,
    /// Minimum score still considered degraded (below is unhealthy).
    #[serde(default = "default_degraded_min")]
    pub degraded_min_score: u32,
}

fn default_window_secs() -> u64 {
    900
}

fn default_failure_warn() -> f64 {
    0.05
}

fn default_failure_crit() -> f64 {
    0.20
}

fn default_wait_warn_ms() -> u64 {
    30_000
}

fn default_wait_crit_ms() -> u64 {
    120_000
}

fn default_backlog_warn() -> f64 {
    10.0
}

fn default_backlog_crit() -> f64 {
    50.0
}

fn default_healthy_min() -> u32 {
    80
}

fn default_degraded_min() -> u32 {
    50
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            failure_warn: default_failure_warn(),
            failure_crit: default_failure_crit(),
            wait_p95_warn_ms: default_wait_warn_ms(),
            wait_p95_crit_ms: default_wait_crit_ms(),
            backlog_warn_ratio: default_backlog_warn(),
            backlog_crit_ratio: default_backlog_crit(),
            healthy_min_score: default_healthy_min(),
            degraded_min_score: default_degraded_min(),
        }
    }
}

/// Windowed performance metrics for one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMetrics {
    /// The queue these metrics describe.
    pub queue_type: QueueType,
    /// Inclusive window start.
    pub window_start: DateTime<Utc>,
    /// Exclusive window end.
    pub window_end: DateTime<Utc>,
    /// Jobs that succeeded in the window.
    pub completed: usize,
    /// Jobs that failed in the window.
    pub failed: usize,
    /// Jobs cancelled in the window.
    pub cancelled: usize,
    /// Terminal jobs per minute over the window.
    pub throughput_per_minute: f64,
    /// Median run latency in milliseconds.
    pub p50_run_ms: u64,
    /// 95th percentile run latency in milliseconds.
    pub p95_run_ms: u64,
    /// 99th percentile run latency in milliseconds.
    pub p99_run_ms: u64,
    /// Mean dispatch wait in milliseconds.
    pub avg_wait_ms: u64,
    /// failed / (completed + failed); zero when nothing ran.
    pub failure_rate: f64,
}

/// Health evaluation for one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueHealth {
    /// The queue this evaluation describes.
    pub queue_type: QueueType,
    /// Derived classification.
    pub status: HealthStatus,
    /// Numeric score in `[0, 100]`.
    pub score: u32,
    /// The specific thresholds breached, empty when healthy.
    pub issues: Vec<String>,
    /// Metrics over the rolling health window.
    pub metrics: QueueMetrics,
}

/// Aggregate health across every queue.
///
/// The overall score is the minimum of the per-queue scores — one severely
/// unhealthy queue is never masked by healthy ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    /// Worst-case classification.
    pub status: HealthStatus,
    /// Minimum per-queue score.
    pub score: u32,
    /// Per-queue evaluations.
    pub queues: Vec<QueueHealth>,
    /// Currently-active alerts.
    pub alerts: Vec<Alert>,
    /// When this evaluation ran.
    pub generated_at: DateTime<Utc>,
}

impl SystemHealth {
    /// Serialize for dashboard consumption.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "status": self.status,
            "score": self.score,
            "queues": self.queues,
            "alerts": self.alerts,
            "generated_at": self.generated_at,
        })
    }
}

/// Retention bound for samples, matching the widest named query range.
const SAMPLE_RETENTION_DAYS: i64 = 7;
/// Hard cap on retained samples per queue.
const SAMPLE_CAP: usize = 10_000;

/// Read-only observer over terminal job samples.
///
/// The aggregator never drives scheduling decisions; it only answers
/// point-in-time and historical queries.
pub(crate) struct HealthAggregator {
    samples: RwLock<HashMap<QueueType, VecDeque<JobSample>>>,
    thresholds: HealthThresholds,
}

impl HealthAggregator {
    pub(crate) fn new(thresholds: HealthThresholds) -> Self {
        let mut samples = HashMap::new();
        for queue in QueueType::ALL {
            samples.insert(queue, VecDeque::new());
        }
        Self {
            samples: RwLock::new(samples),
            thresholds,
        }
    }

    /// Record a terminal job observation.
    pub(crate) async fn record(&self, queue: QueueType, sample: JobSample) {
        let mut samples = self.samples.write().await;
        let window = samples.entry(queue).or_default();
        window.push_back(sample);

        let horizon = Utc::now() - ChronoDuration::days(SAMPLE_RETENTION_DAYS);
        while window
            .front()
            .is_some_and(|s| s.finished_at < horizon)
        {
            window.pop_front();
        }
        while window.len() > SAMPLE_CAP {
            window.pop_front();
        }
    }

    /// Windowed metrics for one queue.
    pub(crate) async fn queue_metrics(&self, queue: QueueType, range: TimeRange) -> QueueMetrics {
        let now = Utc::now();
        let (start, end) = range.bounds(now);
        let samples = self.samples.read().await;
        let in_window: Vec<&JobSample> = samples
            .get(&queue)
            .map(|window| {
                window
                    .iter()
                    .filter(|s| s.finished_at >= start && s.finished_at < end)
                    .collect()
            })
            .unwrap_or_default();

        metrics_from(queue, start, end, &in_window)
    }

    /// Evaluate one queue's health from its rolling window and live stats.
    pub(crate) async fn queue_health(&self, stats: &QueueStats) -> QueueHealth {
        let window = TimeRange::Custom {
            start: Utc::now() - ChronoDuration::seconds(self.thresholds.window_secs as i64),
            end: Utc::now(),
        };
        let metrics = self.queue_metrics(stats.queue_type, window).await;

        let t = &self.thresholds;
        let mut score: i64 = 100;
        let mut issues = Vec::new();

        if metrics.failure_rate >= t.failure_crit {
            score -= 50;
            issues.push(format!(
                "failure rate {:.1}% exceeds {:.0}% critical threshold",
                metrics.failure_rate * 100.0,
                t.failure_crit * 100.0
            ));
        } else if metrics.failure_rate >= t.failure_warn {
            score -= 20;
            issues.push(format!(
                "failure rate {:.1}% exceeds {:.0}% warning threshold",
                metrics.failure_rate * 100.0,
                t.failure_warn * 100.0
            ));
        }

        let p95_wait_ms = self.p95_wait(stats.queue_type, window).await;
        if p95_wait_ms >= t.wait_p95_crit_ms {
            score -= 30;
            issues.push(format!(
                "p95 dispatch latency {p95_wait_ms}ms exceeds {}ms critical threshold",
                t.wait_p95_crit_ms
            ));
        } else if p95_wait_ms >= t.wait_p95_warn_ms {
            score -= 10;
            issues.push(format!(
                "p95 dispatch latency {p95_wait_ms}ms exceeds {}ms warning threshold",
                t.wait_p95_warn_ms
            ));
        }

        let backlog_ratio = stats.backlog() as f64 / stats.concurrency_limit.max(1) as f64;
        if backlog_ratio >= t.backlog_crit_ratio {
            score -= 20;
            issues.push(format!(
                "backlog {} is {backlog_ratio:.0}x the concurrency limit {}, exceeding the {:.0}x critical threshold",
                stats.backlog(),
                stats.concurrency_limit,
                t.backlog_crit_ratio
            ));
        } else if backlog_ratio >= t.backlog_warn_ratio {
            score -= 10;
            issues.push(format!(
                "backlog {} is {backlog_ratio:.0}x the concurrency limit {}, exceeding the {:.0}x warning threshold",
                stats.backlog(),
                stats.concurrency_limit,
                t.backlog_warn_ratio
            ));
        }

        let score = score.clamp(0, 100) as u32;
        let status = if score >= t.healthy_min_score {
            HealthStatus::Healthy
        } else if score >= t.degraded_min_score {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        QueueHealth {
            queue_type: stats.queue_type,
            status,
            score,
            issues,
            metrics,
        }
    }

    /// Evaluate system health across all queues.
    pub(crate) async fn system_health(&self, stats: &[QueueStats]) -> SystemHealth {
        let mut queues = Vec::with_capacity(stats.len());
        for queue_stats in stats {
            queues.push(self.queue_health(queue_stats).await);
        }

        let score = queues.iter().map(|q| q.score).min().unwrap_or(100);
        let status = if score >= self.thresholds.healthy_min_score {
            HealthStatus::Healthy
        } else if score >= self.thresholds.degraded_min_score {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        let alerts = queues
            .iter()
            .flat_map(|q| {
                let severity = match q.status {
                    HealthStatus::Unhealthy => AlertSeverity::Critical,
                    _ => AlertSeverity::Warning,
                };
                q.issues.iter().map(move |message| Alert {
                    queue_type: q.queue_type,
                    severity,
                    message: message.clone(),
                })
            })
            .collect();

        SystemHealth {
            status,
            score,
            queues,
            alerts,
            generated_at: Utc::now(),
        }
    }

    async fn p95_wait(&self, queue: QueueType, range: TimeRange) -> u64 {
        let now = Utc::now();
        let (start, end) = range.bounds(now);
        let samples = self.samples.read().await;
        let mut waits: Vec<u64> = samples
            .get(&queue)
            .map(|window| {
                window
                    .iter()
                    .filter(|s| s.finished_at >= start && s.finished_at < end)
                    .map(|s| s.wait_ms)
                    .collect()
            })
            .unwrap_or_default();
        waits.sort_unstable();
        percentile(&waits, 95.0)
    }
}

fn metrics_from(
    queue: QueueType,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    samples: &[&JobSample],
) -> QueueMetrics {
    let completed = samples
        .iter()
        .filter(|s| s.outcome == SampleOutcome::Succeeded)
        .count();
    let failed = samples
        .iter()
        .filter(|s| s.outcome == SampleOutcome::Failed)
        .count();
    let cancelled = samples
        .iter()
        .filter(|s| s.outcome == SampleOutcome::Cancelled)
        .count();

    let window_minutes = ((end - start).num_seconds().max(1)) as f64 / 60.0;
    let throughput_per_minute = samples.len() as f64 / window_minutes;

    let mut runs: Vec<u64> = samples.iter().map(|s| s.run_ms).collect();
    runs.sort_unstable();

    let avg_wait_ms = if samples.is_empty() {
        0
    } else {
        samples.iter().map(|s| s.wait_ms).sum::<u64>() / samples.len() as u64
    };

    let attempted = completed + failed;
    let failure_rate = if attempted == 0 {
        0.0
    } else {
        failed as f64 / attempted as f64
    };

    QueueMetrics {
        queue_type: queue,
        window_start: start,
        window_end: end,
        completed,
        failed,
        cancelled,
        throughput_per_minute,
        p50_run_ms: percentile(&runs, 50.0),
        p95_run_ms: percentile(&runs, 95.0),
        p99_run_ms: percentile(&runs, 99.0),
        avg_wait_ms,
        failure_rate,
    }
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}
