//! Run statistics: thread-safe counters and rolling batch performance.
//!
//! The decision thread writes, the status reporter reads; every increment and
//! query goes through one internal lock so a status line is always a
//! consistent cut. The per-chunk debug TSV rides along here (one line per
//! evaluated read, written through the non-blocking [`LineAppender`]).

pub mod appender;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::PoisonError;

use core_model::{Action, Decision};

pub use appender::LineAppender;

/// Column order of the per-chunk debug TSV.
pub const DEBUG_LOG_FIELDS: [&str; 14] = [
    "client_iteration",
    "read_in_loop",
    "read_id",
    "channel",
    "read_number",
    "seq_len",
    "counter",
    "mode",
    "decision",
    "condition",
    "barcode",
    "previous_action",
    "action_override",
    "timestamp",
];

/// Everything the statistics layer wants to know about one evaluated read.
#[derive(Debug, Clone)]
pub struct ReadObservation<'a> {
    pub client_iteration: u64,
    pub read_in_loop: usize,
    pub read_id: &'a str,
    pub channel: u32,
    pub read_number: u32,
    pub seq_len: usize,
    /// Chunks seen for this read including the current one.
    pub counter: u32,
    /// Post-override classification (single_on, above_max_chunks, ...).
    pub mode: Decision,
    /// Action actually dispatched (or `proceed`).
    pub action: Action,
    pub condition_name: &'a str,
    /// Region owning the channel, when it differs from the condition.
    pub region_name: Option<&'a str>,
    pub barcode: Option<&'a str>,
    pub previous_action: Option<Action>,
    /// True when a chunk-bound, control, or dry-run override changed the
    /// condition's table action.
    pub action_overridden: bool,
    /// Unix seconds.
    pub timestamp: f64,
}

#[derive(Debug, Default)]
struct BatchStats {
    batch_count: u64,
    cumulative_batch_size: u64,
    cumulative_batch_time: f64,
    batch_size: u64,
    batch_time: f64,
    cumulative_lagging_batches: u64,
    consecutive_lagging_batches: u64,
}

#[derive(Debug, Default)]
struct StatsInner {
    total_chunks: u64,
    decisions: HashMap<Decision, u64>,
    actions: HashMap<Action, u64>,
    conditions: HashMap<String, u64>,
    actions_conditions: HashMap<(String, Decision, Action), u64>,
    first_read_skipped: u64,
    read_analysed: u64,
    dropped_chunks: u64,
    suppressed_redundant: u64,
    duplicate_batch_entries: u64,
    dry_run_substitutions: u64,
    batch: BatchStats,
}

/// Point-in-time copy of every counter, for tests and shutdown summaries.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub total_chunks: u64,
    pub decisions: HashMap<Decision, u64>,
    pub actions: HashMap<Action, u64>,
    pub conditions: HashMap<String, u64>,
    pub actions_conditions: HashMap<(String, Decision, Action), u64>,
    pub first_read_skipped: u64,
    pub read_analysed: u64,
    pub dropped_chunks: u64,
    pub suppressed_redundant: u64,
    pub duplicate_batch_entries: u64,
    pub dry_run_substitutions: u64,
    pub batch_count: u64,
    pub slow_batches: u64,
    pub consecutive_slow_batches: u64,
}

pub struct RunStatistics {
    /// Slow-batch threshold: the loop throttle budget, in seconds.
    throttle_seconds: f64,
    inner: Mutex<StatsInner>,
    debug_log: Option<LineAppender>,
}

impl RunStatistics {
    pub fn new(throttle_seconds: f64) -> Self {
        Self {
            throttle_seconds,
            inner: Mutex::new(StatsInner::default()),
            debug_log: None,
        }
    }

    /// Attach the per-chunk debug TSV. Without this, observations only feed
    /// the in-memory counters.
    pub fn with_debug_log(mut self, path: &Path) -> std::io::Result<Self> {
        let appender = LineAppender::open(path, Some(&DEBUG_LOG_FIELDS.join("\t")))?;
        self.debug_log = Some(appender);
        Ok(self)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one evaluated read: counters plus (when enabled) a TSV line.
    pub fn log_read(&self, obs: &ReadObservation<'_>) {
        {
            let mut inner = self.lock();
            inner.total_chunks += 1;
            *inner.decisions.entry(obs.mode).or_default() += 1;
            *inner.actions.entry(obs.action).or_default() += 1;
            *inner
                .conditions
                .entry(obs.condition_name.to_string())
                .or_default() += 1;
            *inner
                .actions_conditions
                .entry((obs.condition_name.to_string(), obs.mode, obs.action))
                .or_default() += 1;
            if let Some(region) = obs.region_name {
                if region != obs.condition_name {
                    *inner.conditions.entry(region.to_string()).or_default() += 1;
                    *inner
                        .actions_conditions
                        .entry((region.to_string(), obs.mode, obs.action))
                        .or_default() += 1;
                }
            }
            if obs.previous_action.is_none() && obs.action_overridden {
                inner.first_read_skipped += 1;
            } else {
                inner.read_analysed += 1;
            }
        }
        if let Some(log) = &self.debug_log {
            log.append(format_debug_line(obs));
        }
    }

    /// Record one completed batch: size, wall time, slow-batch accounting.
    pub fn add_batch_performance(&self, number_of_reads: usize, batch_time: f64) {
        let mut inner = self.lock();
        let batch = &mut inner.batch;
        batch.batch_count += 1;
        batch.cumulative_batch_size += number_of_reads as u64;
        batch.cumulative_batch_time += batch_time;
        batch.batch_size = number_of_reads as u64;
        batch.batch_time = batch_time;
        if batch_time > self.throttle_seconds {
            batch.cumulative_lagging_batches += 1;
            batch.consecutive_lagging_batches += 1;
        } else {
            batch.consecutive_lagging_batches = 0;
        }
    }

    pub fn add_dropped_chunks(&self, n: usize) {
        self.lock().dropped_chunks += n as u64;
    }

    pub fn add_suppressed_redundant(&self) {
        self.lock().suppressed_redundant += 1;
    }

    pub fn add_duplicate_batch_entries(&self, n: usize) {
        self.lock().duplicate_batch_entries += n as u64;
    }

    pub fn add_dry_run_substitution(&self) {
        self.lock().dry_run_substitutions += 1;
    }

    pub fn average_chunks_per_second(&self) -> f64 {
        let inner = self.lock();
        if inner.batch.batch_count == 0 || inner.batch.cumulative_batch_time == 0.0 {
            return 0.0;
        }
        inner.batch.cumulative_batch_size as f64 / inner.batch.cumulative_batch_time
    }

    pub fn average_batch_time(&self) -> f64 {
        let inner = self.lock();
        if inner.batch.batch_count == 0 {
            return 0.0;
        }
        inner.batch.cumulative_batch_time / inner.batch.batch_count as f64
    }

    pub fn average_batch_size(&self) -> f64 {
        let inner = self.lock();
        if inner.batch.batch_count == 0 {
            return 0.0;
        }
        inner.batch.cumulative_batch_size as f64 / inner.batch.batch_count as f64
    }

    /// One-line rolling status, e.g.
    /// `0010R/0.30s; Avg: 0008R/0.28s; Seq:42; Unb:123; Pro:17; Slow batches (>0.40s): 2/150`.
    pub fn get_batch_performance(&self) -> String {
        let inner = self.lock();
        if inner.batch.batch_count == 0 {
            return "No performance data yet".to_string();
        }
        let avg_size = inner.batch.cumulative_batch_size as f64 / inner.batch.batch_count as f64;
        let avg_time = inner.batch.cumulative_batch_time / inner.batch.batch_count as f64;
        format!(
            "{:04}R/{:.2}s; Avg: {:04}R/{:.2}s; Seq:{}; Unb:{}; Pro:{}; Slow batches (>{:.2}s): {}/{}",
            inner.batch.batch_size,
            inner.batch.batch_time,
            avg_size as u64,
            avg_time,
            inner.actions.get(&Action::StopReceiving).copied().unwrap_or(0),
            inner.actions.get(&Action::Unblock).copied().unwrap_or(0),
            inner.actions.get(&Action::Proceed).copied().unwrap_or(0),
            self.throttle_seconds,
            inner.batch.cumulative_lagging_batches,
            inner.batch.batch_count,
        )
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.lock();
        StatsSnapshot {
            total_chunks: inner.total_chunks,
            decisions: inner.decisions.clone(),
            actions: inner.actions.clone(),
            conditions: inner.conditions.clone(),
            actions_conditions: inner.actions_conditions.clone(),
            first_read_skipped: inner.first_read_skipped,
            read_analysed: inner.read_analysed,
            dropped_chunks: inner.dropped_chunks,
            suppressed_redundant: inner.suppressed_redundant,
            duplicate_batch_entries: inner.duplicate_batch_entries,
            dry_run_substitutions: inner.dry_run_substitutions,
            batch_count: inner.batch.batch_count,
            slow_batches: inner.batch.cumulative_lagging_batches,
            consecutive_slow_batches: inner.batch.consecutive_lagging_batches,
        }
    }

    /// Lines lost by the debug TSV queue, if enabled.
    pub fn debug_log_dropped(&self) -> u64 {
        self.debug_log.as_ref().map(LineAppender::dropped).unwrap_or(0)
    }
}

fn format_debug_line(obs: &ReadObservation<'_>) -> String {
    format!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{:.6}",
        obs.client_iteration,
        obs.read_in_loop,
        obs.read_id,
        obs.channel,
        obs.read_number,
        obs.seq_len,
        obs.counter,
        obs.mode,
        obs.action,
        obs.condition_name,
        obs.barcode.unwrap_or("-"),
        obs.previous_action.as_ref().map(Action::as_str).unwrap_or("-"),
        obs.action_overridden,
        obs.timestamp,
    )
}
