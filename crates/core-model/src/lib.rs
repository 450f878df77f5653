//! Domain types shared across the poresift pipeline.
//!
//! A read chunk flows through the pipeline as a [`ReadRecord`] that is filled
//! in stages: the caller sets `seq` (and optionally `barcode`), the aligner
//! sets `alignment_data` and `decision`, and the decision engine may override
//! `decision` when chunk bounds are violated. The record lives for exactly one
//! loop iteration.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of a read chunk after alignment.
///
/// The first six variants are produced by the aligner; `AboveMaxChunks` and
/// `BelowMinChunks` are synthetic overrides applied by the decision engine
/// when a read has been sampled outside its condition's chunk bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// One alignment, with its end coordinate inside a target interval.
    SingleOn,
    /// One alignment, outside all target intervals.
    SingleOff,
    /// Multiple alignments, at least one inside a target interval.
    MultiOn,
    /// Multiple alignments, none inside a target interval.
    MultiOff,
    /// Base-called but produced no alignments.
    NoMap,
    /// No sequence was produced for this chunk.
    NoSeq,
    /// More chunks collected than the condition's `max_chunks`.
    AboveMaxChunks,
    /// Fewer chunks collected than the condition's `min_chunks`.
    BelowMinChunks,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::SingleOn => "single_on",
            Decision::SingleOff => "single_off",
            Decision::MultiOn => "multi_on",
            Decision::MultiOff => "multi_off",
            Decision::NoMap => "no_map",
            Decision::NoSeq => "no_seq",
            Decision::AboveMaxChunks => "above_max_chunks",
            Decision::BelowMinChunks => "below_min_chunks",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the dispatcher will do for a read. `Proceed` produces no RPC call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Reverse the pore voltage and eject the molecule.
    Unblock,
    /// Let the molecule finish without forwarding further chunks.
    StopReceiving,
    /// No action; evaluate the next chunk for this read.
    Proceed,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Unblock => "unblock",
            Action::StopReceiving => "stop_receiving",
            Action::Proceed => "proceed",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alignment strand. Accepted on the wire as `+`/`-` or `1`/`-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strand {
    #[serde(rename = "+")]
    Forward,
    #[serde(rename = "-")]
    Reverse,
}

impl Strand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strand::Forward => "+",
            Strand::Reverse => "-",
        }
    }

    /// Index into strand-keyed pair arrays.
    pub fn index(&self) -> usize {
        match self {
            Strand::Forward => 0,
            Strand::Reverse => 1,
        }
    }
}

impl fmt::Display for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Strand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "+" | "1" => Ok(Strand::Forward),
            "-" | "-1" => Ok(Strand::Reverse),
            other => Err(format!("unrecognised strand {other:?}")),
        }
    }
}

impl TryFrom<i32> for Strand {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Strand::Forward),
            -1 => Ok(Strand::Reverse),
            other => Err(format!("unrecognised strand {other}")),
        }
    }
}

/// A single alignment of a base-called chunk against the reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alignment {
    pub contig: String,
    pub strand: Strand,
    /// Reference start of the alignment (0-based).
    pub target_start: u64,
    /// Reference end of the alignment.
    pub target_end: u64,
}

impl Alignment {
    pub fn new(
        contig: impl Into<String>,
        strand: Strand,
        target_start: u64,
        target_end: u64,
    ) -> Self {
        Self {
            contig: contig.into(),
            strand,
            target_start,
            target_end,
        }
    }

    /// The coordinate used for on/off-target classification: the position the
    /// molecule has reached on the reference, i.e. the alignment end when
    /// forward and the alignment start when reverse.
    pub fn decision_coord(&self) -> u64 {
        match self.strand {
            Strand::Forward => self.target_end,
            Strand::Reverse => self.target_start,
        }
    }
}

/// Per-chunk record threaded through caller, aligner, and decision engine.
#[derive(Debug, Clone)]
pub struct ReadRecord {
    pub channel: u32,
    pub read_number: u32,
    pub read_id: String,
    pub seq: String,
    pub decision: Decision,
    /// Barcode label assigned by the caller, when barcoding is enabled.
    pub barcode: Option<String>,
    /// Opaque caller payload forwarded to the aligner.
    pub basecall_data: Option<String>,
    /// `None` until the aligner has run; `Some(vec![])` means no hits.
    pub alignment_data: Option<Vec<Alignment>>,
}

impl ReadRecord {
    pub fn new(
        channel: u32,
        read_number: u32,
        read_id: impl Into<String>,
        seq: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            read_number,
            read_id: read_id.into(),
            seq: seq.into(),
            decision: Decision::NoSeq,
            barcode: None,
            basecall_data: None,
            alignment_data: None,
        }
    }

    pub fn with_barcode(mut self, barcode: impl Into<String>) -> Self {
        self.barcode = Some(barcode.into());
        self
    }

    /// Alignments as a slice, empty when the aligner has not run.
    pub fn alignments(&self) -> &[Alignment] {
        self.alignment_data.as_deref().unwrap_or(&[])
    }
}

/// Raw signal chunk as delivered by the sequencer for one channel.
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub read_id: String,
    pub read_number: u32,
    /// Raw signal bytes; interpretation is governed by [`SignalDtype`].
    pub raw_data: Vec<u8>,
    /// Sample index of the first sample in this chunk since read start.
    pub start_sample: u64,
}

impl RawChunk {
    pub fn new(read_id: impl Into<String>, read_number: u32) -> Self {
        Self {
            read_id: read_id.into(),
            read_number,
            raw_data: Vec::new(),
            start_sample: 0,
        }
    }
}

/// Per-channel digitisation calibration: `pA = (raw + offset) * scale`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub offset: f32,
    pub scale: f32,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            offset: 0.0,
            scale: 1.0,
        }
    }
}

/// Element type of the raw signal buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalDtype {
    #[default]
    I16,
    F32,
}

impl SignalDtype {
    pub fn sample_width(&self) -> usize {
        match self {
            SignalDtype::I16 => 2,
            SignalDtype::F32 => 4,
        }
    }
}
