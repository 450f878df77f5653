//! Scripted in-process sequencer.
//!
//! `SimClient` plays back a fixed sequence of chunk batches and records every
//! dispatched action, which makes it both the replay transport for offline
//! runs (`--replay`) and the workhorse of the end-to-end tests. The replay
//! file is a TSV with one chunk per line:
//!
//! ```text
//! batch<TAB>channel<TAB>read_number<TAB>read_id
//! ```
//!
//! Lines starting with `#` are ignored. Batches are delivered in ascending
//! batch order; the run ends when the script is exhausted.

use std::cell::Cell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use core_model::{Calibration, RawChunk, SignalDtype};
use tracing::debug;

use crate::{ClientError, SequencerClient, StopRequest, UnblockRequest};

#[derive(Debug)]
pub struct SimClient {
    channel_count: usize,
    calibration: Vec<Calibration>,
    batches: VecDeque<Vec<(u32, RawChunk)>>,
    /// When set, `get_read_chunks` fails once this many batches have been
    /// served. Exercises the caller's RPC retry budget.
    fail_after_batches: Option<usize>,
    served_batches: usize,
    sequencing: bool,
    /// Number of upcoming phase polls that report "not sequencing", e.g. a
    /// scripted mux scan at run start.
    paused_polls: Cell<usize>,
    run_dir: Option<PathBuf>,
    /// Every unblock dispatched, with the requested voltage duration.
    pub unblocked: Vec<(UnblockRequest, f64)>,
    /// Every stop-receiving dispatched.
    pub stopped: Vec<StopRequest>,
}

impl SimClient {
    pub fn new(channel_count: usize) -> Self {
        Self {
            channel_count,
            calibration: vec![Calibration::default(); channel_count + 1],
            batches: VecDeque::new(),
            fail_after_batches: None,
            served_batches: 0,
            sequencing: true,
            paused_polls: Cell::new(0),
            run_dir: None,
            unblocked: Vec::new(),
            stopped: Vec::new(),
        }
    }

    /// Load a scripted run from a replay TSV.
    pub fn from_replay_file(path: &Path, channel_count: usize) -> Result<Self, ClientError> {
        let text = fs::read_to_string(path).map_err(|e| ClientError::Replay {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut batches: Vec<(usize, Vec<(u32, RawChunk)>)> = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            let [batch, channel, read_number, read_id] = fields.as_slice() else {
                return Err(ClientError::Replay {
                    path: path.to_path_buf(),
                    reason: format!("line {}: expected 4 tab-separated fields", idx + 1),
                });
            };
            let parse_num = |value: &str, what: &str| -> Result<u64, ClientError> {
                value.parse().map_err(|_| ClientError::Replay {
                    path: path.to_path_buf(),
                    reason: format!("line {}: invalid {what} {value:?}", idx + 1),
                })
            };
            let batch = parse_num(batch, "batch")? as usize;
            let channel = parse_num(channel, "channel")? as u32;
            if channel == 0 || channel as usize > channel_count {
                return Err(ClientError::Replay {
                    path: path.to_path_buf(),
                    reason: format!("line {}: channel {channel} outside flow cell", idx + 1),
                });
            }
            let read_number = parse_num(read_number, "read_number")? as u32;
            let chunk = RawChunk::new(*read_id, read_number);
            match batches.iter_mut().find(|(b, _)| *b == batch) {
                Some((_, entries)) => entries.push((channel, chunk)),
                None => batches.push((batch, vec![(channel, chunk)])),
            }
        }
        batches.sort_by_key(|(b, _)| *b);
        let mut client = Self::new(channel_count);
        for (_, entries) in batches {
            client.push_batch(entries);
        }
        Ok(client)
    }

    /// Queue one chunk batch for delivery.
    pub fn push_batch(&mut self, batch: Vec<(u32, RawChunk)>) -> &mut Self {
        self.batches.push_back(batch);
        self
    }

    pub fn with_run_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run_dir = Some(dir.into());
        self
    }

    pub fn set_sequencing(&mut self, sequencing: bool) {
        self.sequencing = sequencing;
    }

    /// Report "not sequencing" for the next `n` phase polls.
    pub fn pause_for_polls(&mut self, n: usize) {
        self.paused_polls.set(n);
    }

    pub fn fail_after_batches(&mut self, n: usize) {
        self.fail_after_batches = Some(n);
    }

    pub fn remaining_batches(&self) -> usize {
        self.batches.len()
    }
}

impl SequencerClient for SimClient {
    fn channel_count(&self) -> usize {
        self.channel_count
    }

    fn signal_dtype(&self) -> SignalDtype {
        SignalDtype::I16
    }

    fn calibration(&self, channel: u32) -> Calibration {
        self.calibration
            .get(channel as usize)
            .copied()
            .unwrap_or_default()
    }

    fn is_running(&self) -> Result<bool, ClientError> {
        Ok(!self.batches.is_empty())
    }

    fn is_sequencing_phase(&self) -> Result<bool, ClientError> {
        let paused = self.paused_polls.get();
        if paused > 0 {
            self.paused_polls.set(paused - 1);
            return Ok(false);
        }
        Ok(self.sequencing)
    }

    fn get_read_chunks(&mut self, batch_size: usize) -> Result<Vec<(u32, RawChunk)>, ClientError> {
        if let Some(limit) = self.fail_after_batches {
            if self.served_batches >= limit {
                return Err(ClientError::Rpc("scripted failure".into()));
            }
        }
        let Some(batch) = self.batches.pop_front() else {
            return Ok(Vec::new());
        };
        self.served_batches += 1;
        // At most one chunk per channel, keeping the most recent entry.
        let mut latest: Vec<(u32, RawChunk)> = Vec::with_capacity(batch.len());
        for (channel, chunk) in batch {
            if let Some(existing) = latest.iter_mut().find(|(c, _)| *c == channel) {
                existing.1 = chunk;
            } else {
                latest.push((channel, chunk));
            }
        }
        latest.truncate(batch_size);
        debug!(target: "client", chunks = latest.len(), "replay_batch_served");
        Ok(latest)
    }

    fn unblock_read_batch(
        &mut self,
        batch: &[UnblockRequest],
        duration: f64,
    ) -> Result<(), ClientError> {
        self.unblocked
            .extend(batch.iter().map(|req| (req.clone(), duration)));
        Ok(())
    }

    fn stop_receiving_batch(&mut self, batch: &[StopRequest]) -> Result<(), ClientError> {
        self.stopped.extend_from_slice(batch);
        Ok(())
    }

    fn run_dir(&self) -> Option<PathBuf> {
        self.run_dir.clone()
    }

    fn describe(&self) -> String {
        format!(
            "simulated sequencer: {} channels, {} scripted batches",
            self.channel_count,
            self.batches.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn one_chunk_per_channel_keeps_most_recent() {
        let mut client = SimClient::new(512);
        client.push_batch(vec![
            (7, RawChunk::new("old", 1)),
            (8, RawChunk::new("other", 1)),
            (7, RawChunk::new("new", 2)),
        ]);
        let chunks = client.get_read_chunks(512).unwrap();
        assert_eq!(chunks.len(), 2);
        let (_, chunk) = chunks.iter().find(|(c, _)| *c == 7).unwrap();
        assert_eq!(chunk.read_id, "new");
        assert_eq!(chunk.read_number, 2);
    }

    #[test]
    fn run_ends_when_script_exhausted() {
        let mut client = SimClient::new(512);
        client.push_batch(vec![(1, RawChunk::new("a", 1))]);
        assert!(client.is_running().unwrap());
        let _ = client.get_read_chunks(512).unwrap();
        assert!(!client.is_running().unwrap());
        assert!(client.get_read_chunks(512).unwrap().is_empty());
    }

    #[test]
    fn scripted_rpc_failure_surfaces() {
        let mut client = SimClient::new(512);
        client.push_batch(vec![(1, RawChunk::new("a", 1))]);
        client.push_batch(vec![(1, RawChunk::new("b", 2))]);
        client.fail_after_batches(1);
        assert!(client.get_read_chunks(512).is_ok());
        assert!(matches!(
            client.get_read_chunks(512),
            Err(ClientError::Rpc(_))
        ));
    }

    #[test]
    fn replay_file_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# batch\tchannel\tread_number\tread_id").unwrap();
        writeln!(file, "0\t7\t1\tread-a").unwrap();
        writeln!(file, "0\t8\t1\tread-b").unwrap();
        writeln!(file, "1\t7\t2\tread-c").unwrap();
        let mut client = SimClient::from_replay_file(file.path(), 512).unwrap();
        assert_eq!(client.remaining_batches(), 2);
        let first = client.get_read_chunks(512).unwrap();
        assert_eq!(first.len(), 2);
        let second = client.get_read_chunks(512).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].1.read_id, "read-c");
    }

    #[test]
    fn replay_rejects_bad_channel() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0\t900\t1\tread-a").unwrap();
        let err = SimClient::from_replay_file(file.path(), 512).unwrap_err();
        assert!(matches!(err, ClientError::Replay { .. }));
    }

    #[test]
    fn dispatched_batches_are_recorded_in_order() {
        let mut client = SimClient::new(512);
        client
            .unblock_read_batch(
                &[
                    UnblockRequest {
                        channel: 1,
                        read_number: 5,
                        read_id: "a".into(),
                    },
                    UnblockRequest {
                        channel: 2,
                        read_number: 6,
                        read_id: "b".into(),
                    },
                ],
                0.1,
            )
            .unwrap();
        assert_eq!(client.unblocked[0].0.channel, 1);
        assert_eq!(client.unblocked[1].0.channel, 2);
        assert!((client.unblocked[0].1 - 0.1).abs() < f64::EPSILON);
    }
}
