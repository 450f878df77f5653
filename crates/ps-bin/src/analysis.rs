//! The real-time decision loop.
//!
//! One thread runs [`Analysis::run`] serially. Per iteration: gate on run
//! phase and aligner readiness, poll the hot-reload trigger, pull at most one
//! chunk per channel, pipe chunks through caller → aligner → decision engine,
//! flush both action batches, record batch performance, then sleep whatever
//! remains of the throttle budget. All decisions of an iteration are computed
//! before any RPC for that iteration is dispatched.
//!
//! Error posture: a failing plugin record is skipped, a failing RPC call is
//! retried across iterations with a small budget, and a failing hot reload
//! keeps the previous configuration. Only configuration and plugin
//! initialisation errors (before the loop starts) are fatal.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use core_actions::{ActionBatcher, DecisionEngine};
use core_client::{ClientError, SequencerClient};
use core_config::SharedConf;
use core_model::{Calibration, RawChunk};
use core_plugin::{build_aligner, Aligner, Caller};
use core_stats::{LineAppender, ReadObservation, RunStatistics};
use tracing::{debug, error, info, warn};

/// Consecutive RPC failures tolerated before the run is treated as ended.
const RPC_RETRY_BUDGET: u32 = 3;

/// File the dispatcher appends every unblocked read id to.
const UNBLOCK_IDS_FILE: &str = "unblocked_read_ids.txt";
/// Snapshot of the channel→region assignment, written at loop start.
const CHANNELS_FILE: &str = "channels.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    RunEnded,
    RpcFailures,
}

impl ShutdownReason {
    fn as_str(&self) -> &'static str {
        match self {
            ShutdownReason::RunEnded => "run_ended",
            ShutdownReason::RpcFailures => "rpc_failures",
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct AnalysisOptions {
    pub throttle: Duration,
    /// Maximum chunks pulled per iteration; defaults to the channel count.
    pub batch_size: usize,
    /// Unblock voltage time, seconds.
    pub unblock_duration: f64,
    /// Replace every unblock with stop-receiving.
    pub dry_run: bool,
    /// Hot-reload trigger file, polled between batches.
    pub live_toml: PathBuf,
}

pub struct Analysis<C: SequencerClient> {
    client: C,
    conf: SharedConf,
    caller: Box<dyn Caller>,
    aligner: Box<dyn Aligner>,
    engine: DecisionEngine,
    batcher: ActionBatcher,
    stats: Arc<RunStatistics>,
    calibration: Vec<Calibration>,
    channel_count: usize,
    throttle: Duration,
    batch_size: usize,
    unblock_duration: f64,
    live_toml: PathBuf,
    last_reload: Option<SystemTime>,
    iteration: u64,
    rpc_failures: u32,
    output_dir: PathBuf,
}

impl<C: SequencerClient> Analysis<C> {
    pub fn new(
        client: C,
        conf: SharedConf,
        caller: Box<dyn Caller>,
        aligner: Box<dyn Aligner>,
        stats: Arc<RunStatistics>,
        options: AnalysisOptions,
    ) -> Self {
        let channel_count = client.channel_count();
        let calibration = (0..=channel_count as u32)
            .map(|channel| client.calibration(channel))
            .collect();
        let output_dir = client.run_dir().unwrap_or_else(|| PathBuf::from("."));
        let unblock_log = match LineAppender::open(&output_dir.join(UNBLOCK_IDS_FILE), None) {
            Ok(log) => Some(log),
            Err(e) => {
                warn!(
                    target: "runtime",
                    dir = %output_dir.display(),
                    error = %e,
                    "unblock_id_log_unavailable"
                );
                None
            }
        };
        Self {
            conf,
            caller,
            aligner,
            engine: DecisionEngine::new(channel_count, options.dry_run),
            batcher: ActionBatcher::new(unblock_log),
            stats,
            calibration,
            channel_count,
            throttle: options.throttle,
            batch_size: options.batch_size.min(channel_count).max(1),
            unblock_duration: options.unblock_duration,
            live_toml: options.live_toml,
            last_reload: None,
            iteration: 0,
            rpc_failures: 0,
            output_dir,
            client,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn run(&mut self) -> Result<()> {
        self.write_channels_snapshot();
        info!(target: "runtime", client = %self.client.describe(), "starting main loop");
        info!(target: "runtime", caller = %self.caller.describe(), "caller ready");
        info!(
            target: "runtime",
            aligner = %self.aligner.describe(&self.conf.load()),
            "aligner ready"
        );

        let reason = loop {
            let iteration_start = Instant::now();
            match self.client.is_running() {
                Ok(true) => {}
                Ok(false) => break ShutdownReason::RunEnded,
                Err(e) => {
                    if self.note_rpc_failure("is_running", &e) {
                        break ShutdownReason::RpcFailures;
                    }
                    self.sleep_remainder(iteration_start);
                    continue;
                }
            }

            match self.client.is_sequencing_phase() {
                Ok(true) => {}
                Ok(false) => {
                    debug!(target: "runtime", "not in a sequencing phase");
                    self.sleep_remainder(iteration_start);
                    continue;
                }
                Err(e) => {
                    if self.note_rpc_failure("is_sequencing_phase", &e) {
                        break ShutdownReason::RpcFailures;
                    }
                    self.sleep_remainder(iteration_start);
                    continue;
                }
            }

            if !self.aligner.initialised() {
                debug!(target: "runtime", "aligner not initialised yet");
                self.sleep_remainder(iteration_start);
                continue;
            }

            self.maybe_reload();

            let chunks = match self.client.get_read_chunks(self.batch_size) {
                Ok(chunks) => {
                    self.rpc_failures = 0;
                    chunks
                }
                Err(e) => {
                    if self.note_rpc_failure("get_read_chunks", &e) {
                        break ShutdownReason::RpcFailures;
                    }
                    self.sleep_remainder(iteration_start);
                    continue;
                }
            };

            let processed = self.run_pipeline(chunks);
            if let Err(e) = self
                .batcher
                .dispatch(&mut self.client, self.unblock_duration)
                .map(|summary| {
                    if summary.duplicates > 0 {
                        self.stats.add_duplicate_batch_entries(summary.duplicates);
                    }
                })
            {
                if self.note_rpc_failure("dispatch", &e) {
                    break ShutdownReason::RpcFailures;
                }
            }

            let batch_time = iteration_start.elapsed().as_secs_f64();
            if processed > 0 {
                self.stats.add_batch_performance(processed, batch_time);
                info!(target: "runtime.status", "{}", self.stats.get_batch_performance());
            }
            self.sleep_remainder(iteration_start);
        };

        self.finalize(reason);
        Ok(())
    }

    /// Drive one chunk batch through caller → aligner → engine. Returns the
    /// number of records processed.
    fn run_pipeline(&mut self, chunks: Vec<(u32, RawChunk)>) -> usize {
        self.iteration += 1;
        let pulled = chunks.len();
        if pulled == 0 {
            return 0;
        }
        let conf = self.conf.load();
        let dtype = self.client.signal_dtype();
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();

        let calls = self.caller.basecall(chunks, dtype, &self.calibration);
        let records = self.aligner.map_reads(calls);

        let mut read_in_loop = 0usize;
        for mut record in records {
            read_in_loop += 1;
            let resolution = match self.engine.process(&conf, &mut record, &mut self.batcher) {
                Ok(resolution) => resolution,
                Err(e) => {
                    // One bad record must not lose the batch.
                    error!(
                        target: "actions.engine",
                        channel = record.channel,
                        read_id = record.read_id.as_str(),
                        error = %e,
                        "record_skipped"
                    );
                    continue;
                }
            };
            if resolution.suppressed {
                self.stats.add_suppressed_redundant();
            }
            if resolution.dry_run_substituted {
                self.stats.add_dry_run_substitution();
            }
            self.stats.log_read(&ReadObservation {
                client_iteration: self.iteration,
                read_in_loop,
                read_id: &record.read_id,
                channel: record.channel,
                read_number: record.read_number,
                seq_len: record.seq.len(),
                counter: resolution.seen_count,
                mode: record.decision,
                action: resolution.action,
                condition_name: resolution.condition_name,
                region_name: resolution.region_name,
                barcode: record.barcode.as_deref(),
                previous_action: resolution.previous_action,
                action_overridden: resolution.overridden,
                timestamp,
            });
        }

        if read_in_loop < pulled {
            self.stats.add_dropped_chunks(pulled - read_in_loop);
        }
        read_in_loop
    }

    /// Poll the hot-reload trigger. A newer mtime than the last attempt
    /// triggers a reload; failures keep the old configuration, and a change
    /// of mapper settings rebuilds the aligner.
    fn maybe_reload(&mut self) {
        let Ok(meta) = fs::metadata(&self.live_toml) else {
            return;
        };
        let Ok(mtime) = meta.modified() else {
            return;
        };
        if self.last_reload.is_some_and(|last| mtime <= last) {
            return;
        }
        self.last_reload = Some(mtime);
        let old_mapper = self.conf.load().mapper_settings.clone();
        match self
            .conf
            .reload_from_file(&self.live_toml, self.channel_count)
        {
            Ok(new_conf) => {
                if new_conf.mapper_settings != old_mapper {
                    info!(target: "runtime", "mapper settings changed, rebuilding aligner");
                    match build_aligner(&new_conf.mapper_settings, &self.conf) {
                        Ok(aligner) => {
                            self.aligner.disconnect();
                            self.aligner = aligner;
                        }
                        Err(e) => {
                            error!(
                                target: "runtime",
                                error = %e,
                                "aligner_rebuild_failed, keeping previous aligner"
                            );
                        }
                    }
                }
            }
            Err(_) => {
                // Already logged by the reload path; old configuration stays.
            }
        }
    }

    fn note_rpc_failure(&mut self, what: &'static str, error: &ClientError) -> bool {
        self.rpc_failures += 1;
        warn!(
            target: "client",
            what,
            error = %error,
            failures = self.rpc_failures,
            budget = RPC_RETRY_BUDGET,
            "rpc_failure"
        );
        self.rpc_failures >= RPC_RETRY_BUDGET
    }

    fn sleep_remainder(&self, iteration_start: Instant) {
        let elapsed = iteration_start.elapsed();
        if elapsed < self.throttle {
            std::thread::sleep(self.throttle - elapsed);
        }
    }

    fn write_channels_snapshot(&self) {
        let conf = self.conf.load();
        let primary = self.output_dir.join(CHANNELS_FILE);
        if let Err(first) = conf.write_channels_snapshot(&primary) {
            let fallback = PathBuf::from(CHANNELS_FILE);
            match conf.write_channels_snapshot(&fallback) {
                Ok(()) => warn!(
                    target: "runtime",
                    primary = %primary.display(),
                    error = %first,
                    "channels_snapshot_fell_back_to_cwd"
                ),
                Err(second) => warn!(
                    target: "runtime",
                    error = %second,
                    "channels_snapshot_not_written"
                ),
            }
        }
    }

    fn finalize(&mut self, reason: ShutdownReason) {
        info!(target: "runtime.shutdown", reason = reason.as_str(), "draining");
        self.caller.disconnect();
        self.aligner.disconnect();
        let snapshot = self.stats.snapshot();
        info!(
            target: "runtime.shutdown",
            reason = reason.as_str(),
            total_chunks = snapshot.total_chunks,
            batches = snapshot.batch_count,
            slow_batches = snapshot.slow_batches,
            suppressed = snapshot.suppressed_redundant,
            dropped_chunks = snapshot.dropped_chunks,
            debug_lines_dropped = self.stats.debug_log_dropped(),
            unblock_log_lines_dropped = self.batcher.unblock_log_dropped(),
            "main loop finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_client::SimClient;
    use core_config::Conf;
    use core_plugin::build_caller;
    use std::io::Write;

    const UNBLOCK_ALL: &str = r#"
[caller_settings.no_op]
[mapper_settings.no_op]
[[regions]]
name = "unblock all"
min_chunks = 1
max_chunks = 2
targets = []
single_on = "unblock"
single_off = "unblock"
multi_on = "unblock"
multi_off = "unblock"
no_map = "unblock"
no_seq = "unblock"
above_max_chunks = "unblock"
below_min_chunks = "unblock"
"#;

    const TARGETED: &str = r#"
[caller_settings.lookup]
calls = "__CALLS__"

[mapper_settings.lookup]
alignments = "__ALIGNMENTS__"

[[regions]]
name = "select"
min_chunks = 1
max_chunks = 4
targets = ["chr1,100,200,+"]
single_on = "stop_receiving"
single_off = "unblock"
multi_on = "stop_receiving"
multi_off = "unblock"
no_map = "proceed"
no_seq = "proceed"
"#;

    fn options(dir: &std::path::Path) -> AnalysisOptions {
        AnalysisOptions {
            throttle: Duration::from_millis(1),
            batch_size: 512,
            unblock_duration: 0.1,
            dry_run: false,
            live_toml: dir.join("live.toml"),
        }
    }

    fn analysis(
        client: SimClient,
        conf_text: &str,
        dir: &std::path::Path,
        dry_run: bool,
    ) -> Analysis<SimClient> {
        let conf = SharedConf::new(Conf::from_str(conf_text, 512).unwrap());
        let caller = build_caller(&conf.load().caller_settings).unwrap();
        let aligner = build_aligner(&conf.load().mapper_settings, &conf).unwrap();
        let stats = Arc::new(RunStatistics::new(0.001));
        let mut options = options(dir);
        options.dry_run = dry_run;
        Analysis::new(client, conf, caller, aligner, stats, options)
    }

    fn chunk_batch(reads: &[(u32, u32, &str)]) -> Vec<(u32, RawChunk)> {
        reads
            .iter()
            .map(|&(channel, number, id)| (channel, RawChunk::new(id, number)))
            .collect()
    }

    #[test]
    fn unblock_all_run_ejects_every_read_and_logs_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = SimClient::new(512).with_run_dir(dir.path());
        client.push_batch(chunk_batch(&[(1, 1, "read-a"), (2, 1, "read-b")]));
        client.push_batch(chunk_batch(&[(3, 1, "read-c")]));

        let mut analysis = analysis(client, UNBLOCK_ALL, dir.path(), false);
        analysis.run().unwrap();

        let ids: Vec<String> = analysis
            .client()
            .unblocked
            .iter()
            .map(|(req, _)| req.read_id.clone())
            .collect();
        assert_eq!(ids, vec!["read-a", "read-b", "read-c"]);
        assert!(analysis.client().stopped.is_empty());

        // Durable artefacts land in the run directory.
        let logged = std::fs::read_to_string(dir.path().join(UNBLOCK_IDS_FILE)).unwrap();
        assert_eq!(logged.lines().count(), 3);
        assert!(dir.path().join(CHANNELS_FILE).exists());
    }

    #[test]
    fn targeted_run_classifies_and_dispatches() {
        let dir = tempfile::tempdir().unwrap();
        let calls = dir.path().join("calls.tsv");
        let mut file = std::fs::File::create(&calls).unwrap();
        writeln!(file, "read-on\tACGTACGT").unwrap();
        writeln!(file, "read-off\tACGTACGT").unwrap();
        let alignments = dir.path().join("alignments.tsv");
        let mut file = std::fs::File::create(&alignments).unwrap();
        writeln!(file, "read-on\tchr1\t+\t20\t150").unwrap();
        writeln!(file, "read-off\tchr1\t+\t20\t500").unwrap();

        let conf_text = TARGETED
            .replace("__CALLS__", &calls.to_string_lossy())
            .replace("__ALIGNMENTS__", &alignments.to_string_lossy());
        let mut client = SimClient::new(512).with_run_dir(dir.path());
        client.push_batch(chunk_batch(&[(7, 1, "read-on"), (8, 1, "read-off")]));

        let mut analysis = analysis(client, &conf_text, dir.path(), false);
        analysis.run().unwrap();

        let client = analysis.client();
        assert_eq!(client.stopped.len(), 1);
        assert_eq!(client.stopped[0].channel, 7);
        assert_eq!(client.unblocked.len(), 1);
        assert_eq!(client.unblocked[0].0.read_id, "read-off");
    }

    #[test]
    fn dry_run_sends_no_unblocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = SimClient::new(512).with_run_dir(dir.path());
        client.push_batch(chunk_batch(&[(1, 1, "read-a"), (2, 1, "read-b")]));

        let mut analysis = analysis(client, UNBLOCK_ALL, dir.path(), true);
        analysis.run().unwrap();

        assert!(analysis.client().unblocked.is_empty());
        assert_eq!(analysis.client().stopped.len(), 2);
    }

    #[test]
    fn paused_phases_delay_but_do_not_lose_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = SimClient::new(512).with_run_dir(dir.path());
        client.push_batch(chunk_batch(&[(1, 1, "read-a")]));
        client.pause_for_polls(3);

        let mut analysis = analysis(client, UNBLOCK_ALL, dir.path(), false);
        analysis.run().unwrap();

        assert_eq!(analysis.client().unblocked.len(), 1);
    }

    #[test]
    fn rpc_failures_exhaust_the_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = SimClient::new(512).with_run_dir(dir.path());
        for i in 0..10u32 {
            client.push_batch(chunk_batch(&[(1, i, "read")]));
        }
        client.fail_after_batches(1);

        let mut analysis = analysis(client, UNBLOCK_ALL, dir.path(), false);
        analysis.run().unwrap();

        // One batch served, then three consecutive failures end the run with
        // scripted chunks still queued.
        assert_eq!(analysis.client().unblocked.len(), 1);
        assert!(analysis.client().remaining_batches() > 0);
    }

    #[test]
    fn hot_reload_switches_policy_mid_run() {
        let dir = tempfile::tempdir().unwrap();
        let stop_all = UNBLOCK_ALL.replace("\"unblock\"", "\"stop_receiving\"");
        std::fs::write(dir.path().join("live.toml"), stop_all).unwrap();

        let mut client = SimClient::new(512).with_run_dir(dir.path());
        client.push_batch(chunk_batch(&[(1, 1, "read-a")]));
        client.push_batch(chunk_batch(&[(2, 1, "read-b")]));

        // Starts with unblock-everything, but the live file is newer than any
        // previous reload, so iteration one installs stop-everything.
        let mut analysis = analysis(client, UNBLOCK_ALL, dir.path(), false);
        analysis.run().unwrap();

        assert!(analysis.client().unblocked.is_empty());
        assert_eq!(analysis.client().stopped.len(), 2);
    }

    #[test]
    fn broken_live_file_keeps_previous_policy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("live.toml"), "not [ valid").unwrap();

        let mut client = SimClient::new(512).with_run_dir(dir.path());
        client.push_batch(chunk_batch(&[(1, 1, "read-a")]));

        let mut analysis = analysis(client, UNBLOCK_ALL, dir.path(), false);
        analysis.run().unwrap();

        assert_eq!(analysis.client().unblocked.len(), 1);
    }

    #[test]
    fn debug_tsv_records_each_read() {
        let dir = tempfile::tempdir().unwrap();
        let debug_path = dir.path().join("debug.tsv");
        let mut client = SimClient::new(512).with_run_dir(dir.path());
        client.push_batch(chunk_batch(&[(1, 1, "read-a"), (2, 1, "read-b")]));

        let conf = SharedConf::new(Conf::from_str(UNBLOCK_ALL, 512).unwrap());
        let caller = build_caller(&conf.load().caller_settings).unwrap();
        let aligner = build_aligner(&conf.load().mapper_settings, &conf).unwrap();
        let stats = Arc::new(
            RunStatistics::new(0.001)
                .with_debug_log(&debug_path)
                .unwrap(),
        );
        let mut analysis = Analysis::new(
            client,
            conf,
            caller,
            aligner,
            stats.clone(),
            options(dir.path()),
        );
        analysis.run().unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_chunks, 2);
        assert_eq!(snapshot.actions[&core_model::Action::Unblock], 2);

        // Closing the statistics flushes the TSV appender.
        drop(analysis);
        drop(stats);
        let text = std::fs::read_to_string(&debug_path).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("client_iteration\t"));
        let rows: Vec<&str> = lines.collect();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|row| row.contains("read-a")));
    }
}
