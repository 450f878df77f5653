//! Batched RPC dispatch.
//!
//! Two sinks, flushed once per loop iteration after the engine has drained
//! its input: the unblock batch (with the configured voltage duration) and
//! the stop-receiving batch. Batches are sent in the order they were
//! enqueued; duplicates are harmless but wasteful, so they are counted and
//! still sent. Every unblocked read id also goes to a durable append-only
//! log through the non-blocking appender.

use std::collections::HashSet;

use core_client::{ClientError, SequencerClient, StopRequest, UnblockRequest};
use core_stats::LineAppender;
use tracing::debug;

/// Outcome of one flush, fed into the statistics layer by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub unblocks: usize,
    pub stops: usize,
    /// Entries sharing a `(channel, read_number)` key with an earlier entry
    /// in the same batch.
    pub duplicates: usize,
}

pub struct ActionBatcher {
    unblock: Vec<UnblockRequest>,
    stop: Vec<StopRequest>,
    unblock_log: Option<LineAppender>,
}

impl ActionBatcher {
    pub fn new(unblock_log: Option<LineAppender>) -> Self {
        Self {
            unblock: Vec::new(),
            stop: Vec::new(),
            unblock_log,
        }
    }

    pub fn push_unblock(&mut self, channel: u32, read_number: u32, read_id: &str) {
        self.unblock.push(UnblockRequest {
            channel,
            read_number,
            read_id: read_id.to_string(),
        });
    }

    pub fn push_stop(&mut self, channel: u32, read_number: u32) {
        self.stop.push(StopRequest {
            channel,
            read_number,
        });
    }

    /// `(pending unblocks, pending stops)`.
    pub fn pending(&self) -> (usize, usize) {
        (self.unblock.len(), self.stop.len())
    }

    /// Send both batches and clear them. Order within each batch is the
    /// enqueue order. `duration` is the unblock voltage time in seconds.
    pub fn dispatch(
        &mut self,
        client: &mut dyn SequencerClient,
        duration: f64,
    ) -> Result<DispatchSummary, ClientError> {
        let mut summary = DispatchSummary {
            unblocks: self.unblock.len(),
            stops: self.stop.len(),
            duplicates: 0,
        };
        let mut seen: HashSet<(u32, u32)> = HashSet::new();
        for key in self
            .unblock
            .iter()
            .map(|r| (r.channel, r.read_number))
            .chain(self.stop.iter().map(|r| (r.channel, r.read_number)))
        {
            if !seen.insert(key) {
                summary.duplicates += 1;
            }
        }

        if !self.unblock.is_empty() {
            client.unblock_read_batch(&self.unblock, duration)?;
            if let Some(log) = &self.unblock_log {
                for request in &self.unblock {
                    log.append(request.read_id.clone());
                }
            }
        }
        if !self.stop.is_empty() {
            client.stop_receiving_batch(&self.stop)?;
        }
        if summary.unblocks + summary.stops > 0 {
            debug!(
                target: "actions.dispatch",
                unblocks = summary.unblocks,
                stops = summary.stops,
                duplicates = summary.duplicates,
                "batch_dispatched"
            );
        }
        self.unblock.clear();
        self.stop.clear();
        Ok(summary)
    }

    /// Lines lost by the unblock-id log queue.
    pub fn unblock_log_dropped(&self) -> u64 {
        self.unblock_log
            .as_ref()
            .map(LineAppender::dropped)
            .unwrap_or(0)
    }
}
