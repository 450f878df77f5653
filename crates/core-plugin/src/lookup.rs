//! Table-driven caller and aligner for playback runs and tests.
//!
//! External base-callers and aligners are remote daemons; these plugins stand
//! in for them when replaying a recorded run offline. Both load a TSV table
//! at initialisation and fail fast when the file is missing or malformed.
//!
//! Caller table, one line per read:
//!
//! ```text
//! read_id<TAB>seq[<TAB>barcode]
//! ```
//!
//! Chunks whose read id is absent from the table are dropped, exercising the
//! caller contract that dropped chunks never become records.
//!
//! Aligner table, one line per alignment (a read id may repeat):
//!
//! ```text
//! read_id<TAB>contig<TAB>strand<TAB>target_start<TAB>target_end
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use core_config::{Conf, PluginConf, SharedConf};
use core_model::{Alignment, Calibration, RawChunk, ReadRecord, SignalDtype};
use tracing::warn;

use crate::{assign_decision, Aligner, Caller, PluginError, RecordStream};

#[derive(Debug, Clone)]
struct Call {
    seq: String,
    barcode: Option<String>,
}

#[derive(Debug)]
pub struct LookupCaller {
    calls: HashMap<String, Call>,
}

impl LookupCaller {
    pub fn from_settings(settings: &PluginConf) -> Result<Self, PluginError> {
        let path = settings
            .get_str("calls")
            .ok_or_else(|| PluginError::MissingParameter {
                plugin: settings.name.clone(),
                key: "calls",
            })?;
        Self::from_table(Path::new(path), &settings.name)
    }

    fn from_table(path: &Path, plugin: &str) -> Result<Self, PluginError> {
        let text = read_table(path, plugin)?;
        let mut calls = HashMap::new();
        for (idx, line) in data_lines(&text) {
            let fields: Vec<&str> = line.split('\t').collect();
            let (read_id, seq, barcode) = match fields.as_slice() {
                [read_id, seq] => (*read_id, *seq, None),
                [read_id, seq, barcode] => (*read_id, *seq, Some((*barcode).to_string())),
                _ => {
                    return Err(PluginError::BadRecord {
                        plugin: plugin.to_string(),
                        path: path.to_path_buf(),
                        line: idx,
                        reason: format!("expected 2 or 3 fields, found {}", fields.len()),
                    });
                }
            };
            calls.insert(
                read_id.to_string(),
                Call {
                    seq: seq.to_string(),
                    barcode,
                },
            );
        }
        Ok(Self { calls })
    }
}

impl Caller for LookupCaller {
    fn basecall<'a>(
        &'a mut self,
        chunks: Vec<(u32, RawChunk)>,
        _dtype: SignalDtype,
        _calibration: &'a [Calibration],
    ) -> RecordStream<'a> {
        Box::new(chunks.into_iter().filter_map(|(channel, chunk)| {
            let call = self.calls.get(&chunk.read_id)?;
            let mut record =
                ReadRecord::new(channel, chunk.read_number, chunk.read_id, call.seq.clone());
            record.barcode = call.barcode.clone();
            Some(record)
        }))
    }

    fn describe(&self) -> String {
        format!("lookup caller: {} recorded calls", self.calls.len())
    }
}

#[derive(Debug)]
pub struct LookupAligner {
    alignments: HashMap<String, Vec<Alignment>>,
    conf: SharedConf,
}

impl LookupAligner {
    pub fn from_settings(settings: &PluginConf, conf: SharedConf) -> Result<Self, PluginError> {
        let path = settings
            .get_str("alignments")
            .ok_or_else(|| PluginError::MissingParameter {
                plugin: settings.name.clone(),
                key: "alignments",
            })?;
        Self::from_table(Path::new(path), &settings.name, conf)
    }

    fn from_table(path: &Path, plugin: &str, conf: SharedConf) -> Result<Self, PluginError> {
        let text = read_table(path, plugin)?;
        let mut alignments: HashMap<String, Vec<Alignment>> = HashMap::new();
        for (idx, line) in data_lines(&text) {
            let fields: Vec<&str> = line.split('\t').collect();
            let [read_id, contig, strand, start, end] = fields.as_slice() else {
                return Err(PluginError::BadRecord {
                    plugin: plugin.to_string(),
                    path: path.to_path_buf(),
                    line: idx,
                    reason: format!("expected 5 fields, found {}", fields.len()),
                });
            };
            let bad = |reason: String| PluginError::BadRecord {
                plugin: plugin.to_string(),
                path: path.to_path_buf(),
                line: idx,
                reason,
            };
            let strand = strand
                .parse()
                .map_err(|_| bad(format!("unrecognised strand {strand:?}")))?;
            let start: u64 = start
                .parse()
                .map_err(|_| bad(format!("invalid start {start:?}")))?;
            let end: u64 = end
                .parse()
                .map_err(|_| bad(format!("invalid end {end:?}")))?;
            alignments
                .entry((*read_id).to_string())
                .or_default()
                .push(Alignment::new(*contig, strand, start, end));
        }
        Ok(Self { alignments, conf })
    }
}

impl Aligner for LookupAligner {
    fn initialised(&self) -> bool {
        true
    }

    fn map_reads<'a>(&'a mut self, calls: RecordStream<'a>) -> RecordStream<'a> {
        // One config snapshot per batch; a mid-batch reload applies from the
        // next batch onwards.
        let conf = self.conf.load();
        Box::new(calls.filter_map(move |mut record| {
            record.alignment_data = Some(
                self.alignments
                    .get(&record.read_id)
                    .cloned()
                    .unwrap_or_default(),
            );
            let targets = match conf.get_targets(record.channel, record.barcode.as_deref()) {
                Ok(targets) => targets,
                Err(err) => {
                    warn!(
                        target: "plugin.lookup",
                        channel = record.channel,
                        read_id = record.read_id.as_str(),
                        error = %err,
                        "record_skipped_no_condition"
                    );
                    return None;
                }
            };
            record.decision = assign_decision(&record, targets);
            Some(record)
        }))
    }

    fn describe(&self, conf: &Conf) -> String {
        let mut parts = vec![format!(
            "lookup aligner: {} reads with recorded alignments",
            self.alignments.len()
        )];
        for (kind, condition) in conf
            .regions
            .iter()
            .map(|r| ("region", r))
            .chain(conf.barcodes.values().map(|b| ("barcode", b)))
        {
            parts.push(format!(
                "{kind} {} has {} targets on {} contigs",
                condition.name,
                condition.targets.num_intervals(),
                condition.targets.contigs().len(),
            ));
        }
        parts.join("; ")
    }
}

fn read_table(path: &Path, plugin: &str) -> Result<String, PluginError> {
    fs::read_to_string(path).map_err(|source| PluginError::Io {
        plugin: plugin.to_string(),
        path: path.to_path_buf(),
        source,
    })
}

fn data_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim_end()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_model::Decision;
    use std::io::Write;

    const CONF: &str = r#"
[caller_settings.no_op]
[mapper_settings.no_op]
[[regions]]
name = "select"
targets = ["chr1,100,200,+"]
single_on = "stop_receiving"
single_off = "unblock"
multi_on = "stop_receiving"
multi_off = "unblock"
no_map = "proceed"
no_seq = "proceed"
"#;

    fn shared_conf() -> SharedConf {
        SharedConf::new(Conf::from_str(CONF, 512).unwrap())
    }

    fn caller_table(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    fn settings(name: &str, key: &str, path: &Path) -> PluginConf {
        let mut settings = PluginConf::new(name);
        settings.parameters.insert(
            key.into(),
            toml::Value::String(path.to_string_lossy().into_owned()),
        );
        settings
    }

    #[test]
    fn caller_fills_seq_and_barcode_and_drops_unknown_ids() {
        let table = caller_table(&["read-a\tACGT\tbarcode01", "read-b\tTTTT"]);
        let mut caller =
            LookupCaller::from_settings(&settings("lookup", "calls", table.path())).unwrap();
        let chunks = vec![
            (1, RawChunk::new("read-a", 1)),
            (2, RawChunk::new("read-b", 1)),
            (3, RawChunk::new("read-missing", 1)),
        ];
        let records: Vec<_> = caller.basecall(chunks, SignalDtype::I16, &[]).collect();
        assert_eq!(records.len(), 2, "unknown read id must be dropped");
        assert_eq!(records[0].seq, "ACGT");
        assert_eq!(records[0].barcode.as_deref(), Some("barcode01"));
        assert!(records[1].barcode.is_none());
    }

    #[test]
    fn missing_caller_table_fails_initialisation() {
        let settings = settings("lookup", "calls", Path::new("/nonexistent/calls.tsv"));
        assert!(matches!(
            LookupCaller::from_settings(&settings),
            Err(PluginError::Io { .. })
        ));
    }

    #[test]
    fn aligner_assigns_decisions_from_table_and_targets() {
        let table = caller_table(&[
            "read-on\tchr1\t+\t50\t150",
            "read-off\tchr1\t+\t300\t500",
            "read-multi\tchr1\t+\t50\t150",
            "read-multi\tchr2\t+\t0\t10",
        ]);
        let mut aligner = LookupAligner::from_settings(
            &settings("lookup", "alignments", table.path()),
            shared_conf(),
        )
        .unwrap();
        assert!(aligner.initialised());
        let records = vec![
            ReadRecord::new(7, 1, "read-on", "ACGT"),
            ReadRecord::new(8, 1, "read-off", "ACGT"),
            ReadRecord::new(9, 1, "read-multi", "ACGT"),
            ReadRecord::new(10, 1, "read-unmapped", "ACGT"),
            ReadRecord::new(11, 1, "read-noseq", ""),
        ];
        let out: Vec<_> = aligner.map_reads(Box::new(records.into_iter())).collect();
        let decision = |id: &str| out.iter().find(|r| r.read_id == id).unwrap().decision;
        assert_eq!(decision("read-on"), Decision::SingleOn);
        assert_eq!(decision("read-off"), Decision::SingleOff);
        assert_eq!(decision("read-multi"), Decision::MultiOn);
        assert_eq!(decision("read-unmapped"), Decision::NoMap);
        assert_eq!(decision("read-noseq"), Decision::NoSeq);
    }

    #[test]
    fn malformed_alignment_row_cites_line() {
        let table = caller_table(&["read-a\tchr1\t+\t50\t150", "read-b\tchr1\t+"]);
        let err = LookupAligner::from_settings(
            &settings("lookup", "alignments", table.path()),
            shared_conf(),
        )
        .unwrap_err();
        match err {
            PluginError::BadRecord { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reload_changes_classification_without_reindexing() {
        let table = caller_table(&["read-a\tchr1\t+\t50\t150"]);
        let shared = shared_conf();
        let mut aligner = LookupAligner::from_settings(
            &settings("lookup", "alignments", table.path()),
            shared.clone(),
        )
        .unwrap();
        let classify = |aligner: &mut LookupAligner| {
            let records = vec![ReadRecord::new(7, 1, "read-a", "ACGT")];
            aligner
                .map_reads(Box::new(records.into_iter()))
                .next()
                .unwrap()
                .decision
        };
        assert_eq!(classify(&mut aligner), Decision::SingleOn);
        let retargeted = CONF.replace("chr1,100,200,+", "chr9,1,2,+");
        shared.replace(Conf::from_str(&retargeted, 512).unwrap());
        assert_eq!(classify(&mut aligner), Decision::SingleOff);
    }
}
