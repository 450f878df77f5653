//! Sequencer RPC surface consumed by the decision loop.
//!
//! The live vendor transport is an external collaborator; everything the loop
//! needs from it is expressed by [`SequencerClient`] so the loop can be driven
//! by any implementation. This crate ships [`SimClient`], a scripted
//! in-process sequencer used by the test suite and by `--replay` runs.
//!
//! Contract highlights the loop relies on:
//!
//! - `get_read_chunks` returns **at most one chunk per channel**, always the
//!   most recent one; older unread chunks for a channel are discarded at the
//!   client layer.
//! - Status queries may fail transiently; callers treat a small run of
//!   consecutive failures as "run ended".
//! - Batch dispatch must not reorder within a batch.

pub mod sim;

use std::path::PathBuf;

use core_model::{Calibration, RawChunk, SignalDtype};
use thiserror::Error;

pub use sim::SimClient;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("sequencer connection lost: {0}")]
    Disconnected(String),
    #[error("sequencer rpc failed: {0}")]
    Rpc(String),
    #[error("could not read replay file {path}: {reason}")]
    Replay { path: PathBuf, reason: String },
}

/// Unblock request for one read: the voltage flip needs channel, read number,
/// and the read id for the durable unblock log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnblockRequest {
    pub channel: u32,
    pub read_number: u32,
    pub read_id: String,
}

/// Stop-receiving request for one read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopRequest {
    pub channel: u32,
    pub read_number: u32,
}

/// The sequencer as seen from the decision loop.
pub trait SequencerClient: Send {
    /// Number of channels on the flow cell.
    fn channel_count(&self) -> usize;

    fn signal_dtype(&self) -> SignalDtype;

    /// Digitisation calibration for a channel.
    fn calibration(&self, channel: u32) -> Calibration;

    /// False once the run has ended or the operator stopped it.
    fn is_running(&self) -> Result<bool, ClientError>;

    /// True only while the device is actively sequencing (not starting,
    /// pausing, or mux-scanning).
    fn is_sequencing_phase(&self) -> Result<bool, ClientError>;

    /// Most recent unread chunk per channel, at most `batch_size` entries.
    fn get_read_chunks(&mut self, batch_size: usize) -> Result<Vec<(u32, RawChunk)>, ClientError>;

    /// Eject the listed reads, applying unblock voltage for `duration` seconds.
    fn unblock_read_batch(
        &mut self,
        batch: &[UnblockRequest],
        duration: f64,
    ) -> Result<(), ClientError>;

    /// Stop forwarding chunks for the listed reads.
    fn stop_receiving_batch(&mut self, batch: &[StopRequest]) -> Result<(), ClientError>;

    /// Run output directory, when the client knows one and it is writable.
    fn run_dir(&self) -> Option<PathBuf>;

    /// Human-readable connection summary for startup logging.
    fn describe(&self) -> String;
}
