//! Target index: which (contig, strand, coordinate) triples are on-target.
//!
//! Targets are declared either inline as comma-separated strings
//! (`"contig"` or `"contig,start,end,strand"`) or as a path to a 6-column BED
//! file. After construction the index holds, per (strand, contig), a sorted
//! list of coordinate intervals with overlapping or touching intervals merged,
//! so membership is a scan over disjoint ranges.
//!
//! Invariant: no two stored intervals on the same (strand, contig) overlap.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use core_model::Strand;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sentinel end coordinate meaning "to the end of the contig".
pub const WHOLE_CONTIG_END: u64 = u64::MAX;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("could not read targets file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid bed record in {path} at line {line}: expected 6 columns, found {found}")]
    BadBedRecord {
        path: PathBuf,
        line: usize,
        found: usize,
    },
    #[error("invalid target at line {line}: {reason}")]
    BadTarget { line: usize, reason: String },
    #[error("unrecognised strand {strand:?} at line {line}")]
    BadStrand { line: usize, strand: String },
    #[error("unrecognised strand {0:?}")]
    UnknownStrand(String),
}

/// Raw `targets` value as written in the configuration: either an inline list
/// of target strings or a path to a targets file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetSpec {
    List(Vec<String>),
    File(PathBuf),
}

impl Default for TargetSpec {
    fn default() -> Self {
        TargetSpec::List(Vec::new())
    }
}

/// Conversion seam for the strand argument of [`Targets::check_coord`]:
/// accepts the typed [`Strand`], `+`/`-`, and `1`/`-1`.
pub trait StrandArg {
    fn to_strand(self) -> Result<Strand, TargetError>;
}

impl StrandArg for Strand {
    fn to_strand(self) -> Result<Strand, TargetError> {
        Ok(self)
    }
}

impl StrandArg for &str {
    fn to_strand(self) -> Result<Strand, TargetError> {
        self.parse()
            .map_err(|_| TargetError::UnknownStrand(self.to_string()))
    }
}

impl StrandArg for i32 {
    fn to_strand(self) -> Result<Strand, TargetError> {
        Strand::try_from(self).map_err(|_| TargetError::UnknownStrand(self.to_string()))
    }
}

/// Merged per-strand, per-contig interval index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Targets {
    /// Indexed by [`Strand::index`]; contig name to sorted disjoint intervals.
    by_strand: [BTreeMap<String, Vec<(u64, u64)>>; 2],
}

impl Targets {
    /// Build the index from a parsed configuration value.
    pub fn from_spec(spec: &TargetSpec) -> Result<Self, TargetError> {
        match spec {
            TargetSpec::List(lines) => {
                let bed = false;
                Self::from_lines(lines.iter().map(|l| l.as_str()), b',', bed, Path::new("<inline>"))
            }
            TargetSpec::File(path) => Self::from_file(path),
        }
    }

    /// Build the index from a targets file. A `.bed` suffix selects the
    /// tab-separated 6-column grammar; anything else is parsed as
    /// comma-separated target strings, one per line.
    pub fn from_file(path: &Path) -> Result<Self, TargetError> {
        let text = fs::read_to_string(path).map_err(|source| TargetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let bed = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("bed"));
        let delim = if bed { b'\t' } else { b',' };
        Self::from_lines(text.lines(), delim, bed, path)
    }

    /// Build the index from inline target strings.
    pub fn from_list<I, S>(lines: I) -> Result<Self, TargetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let owned: Vec<String> = lines.into_iter().map(|s| s.as_ref().to_string()).collect();
        Self::from_spec(&TargetSpec::List(owned))
    }

    fn from_lines<'a, I>(lines: I, delim: u8, bed: bool, origin: &Path) -> Result<Self, TargetError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut by_strand: [BTreeMap<String, Vec<(u64, u64)>>; 2] = Default::default();
        for (idx, raw) in lines.into_iter().enumerate() {
            let line = idx + 1;
            if raw.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = raw.split(delim as char).collect();
            if bed && fields.len() != 6 {
                return Err(TargetError::BadBedRecord {
                    path: origin.to_path_buf(),
                    line,
                    found: fields.len(),
                });
            }
            match fields.as_slice() {
                [contig] => {
                    // Bare contig name targets the whole contig on both strands.
                    for strand in [Strand::Forward, Strand::Reverse] {
                        by_strand[strand.index()]
                            .entry(contig.to_string())
                            .or_default()
                            .push((0, WHOLE_CONTIG_END));
                    }
                }
                [contig, start, end, .., strand] => {
                    let strand: Strand =
                        strand
                            .trim()
                            .parse()
                            .map_err(|_| TargetError::BadStrand {
                                line,
                                strand: strand.trim().to_string(),
                            })?;
                    let start = parse_coord(start, line)?;
                    let end = parse_coord(end, line)?;
                    by_strand[strand.index()]
                        .entry(contig.to_string())
                        .or_default()
                        .push((start, end));
                }
                _ => {
                    return Err(TargetError::BadTarget {
                        line,
                        reason: format!("expected 1 or >=4 fields, found {}", fields.len()),
                    });
                }
            }
        }
        for contigs in by_strand.iter_mut() {
            for intervals in contigs.values_mut() {
                merge_intervals(intervals);
            }
        }
        Ok(Self { by_strand })
    }

    /// True iff a stored interval `[s, e]` on (strand, contig) satisfies
    /// `s <= coord <= e`.
    pub fn contains(&self, contig: &str, strand: Strand, coord: u64) -> bool {
        self.by_strand[strand.index()]
            .get(contig)
            .is_some_and(|intervals| {
                intervals
                    .iter()
                    .any(|&(start, end)| start <= coord && coord <= end)
            })
    }

    /// [`Targets::contains`] with a loosely typed strand (`+`/`-`, `1`/`-1`,
    /// or [`Strand`]).
    pub fn check_coord<S: StrandArg>(
        &self,
        contig: &str,
        strand: S,
        coord: u64,
    ) -> Result<bool, TargetError> {
        Ok(self.contains(contig, strand.to_strand()?, coord))
    }

    /// All stored intervals in (strand, contig, start, end) order.
    pub fn iter_intervals(&self) -> impl Iterator<Item = (Strand, &str, u64, u64)> + '_ {
        [Strand::Forward, Strand::Reverse]
            .into_iter()
            .flat_map(move |strand| {
                self.by_strand[strand.index()]
                    .iter()
                    .flat_map(move |(contig, intervals)| {
                        intervals
                            .iter()
                            .map(move |&(start, end)| (strand, contig.as_str(), start, end))
                    })
            })
    }

    /// Distinct contig names across both strands.
    pub fn contigs(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .by_strand
            .iter()
            .flat_map(|m| m.keys().map(|k| k.as_str()))
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Total stored interval count across both strands.
    pub fn num_intervals(&self) -> usize {
        self.by_strand
            .iter()
            .map(|m| m.values().map(Vec::len).sum::<usize>())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.num_intervals() == 0
    }
}

fn parse_coord(value: &str, line: usize) -> Result<u64, TargetError> {
    let trimmed = value.trim();
    // Accept float-formatted coordinates as written by some exporters.
    if let Ok(v) = trimmed.parse::<u64>() {
        return Ok(v);
    }
    match trimmed.parse::<f64>() {
        Ok(f) if f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => Ok(f as u64),
        _ => Err(TargetError::BadTarget {
            line,
            reason: format!("invalid coordinate {trimmed:?}"),
        }),
    }
}

/// Sort and merge in place so overlapping or touching intervals collapse.
fn merge_intervals(intervals: &mut Vec<(u64, u64)>) {
    if intervals.len() < 2 {
        return;
    }
    intervals.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(intervals.len());
    for &(start, end) in intervals.iter() {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    *intervals = merged;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn targets(lines: &[&str]) -> Targets {
        Targets::from_list(lines).expect("valid targets")
    }

    #[test]
    fn overlapping_intervals_merge() {
        let t = targets(&["chr1,10,20,+", "chr1,15,30,+"]);
        let intervals: Vec<_> = t.iter_intervals().collect();
        assert_eq!(intervals, vec![(Strand::Forward, "chr1", 10, 30)]);
    }

    #[test]
    fn touching_intervals_merge() {
        let t = targets(&["chr1,10,20,+", "chr1,20,30,+"]);
        assert_eq!(t.num_intervals(), 1);
        assert!(t.contains("chr1", Strand::Forward, 25));
    }

    #[test]
    fn disjoint_intervals_stay_separate_and_sorted() {
        let t = targets(&["chr1,40,50,+", "chr1,10,20,+"]);
        let intervals: Vec<_> = t.iter_intervals().collect();
        assert_eq!(
            intervals,
            vec![
                (Strand::Forward, "chr1", 10, 20),
                (Strand::Forward, "chr1", 40, 50),
            ]
        );
    }

    #[test]
    fn bare_contig_targets_both_whole_strands() {
        let t = targets(&["chr2"]);
        assert!(t.contains("chr2", Strand::Forward, 0));
        assert!(t.contains("chr2", Strand::Reverse, u64::MAX - 1));
        assert!(!t.contains("chr1", Strand::Forward, 0));
    }

    #[test]
    fn membership_is_inclusive_on_both_ends() {
        let t = targets(&["chr1,100,200,+"]);
        assert!(t.contains("chr1", Strand::Forward, 100));
        assert!(t.contains("chr1", Strand::Forward, 200));
        assert!(!t.contains("chr1", Strand::Forward, 99));
        assert!(!t.contains("chr1", Strand::Forward, 201));
        assert!(!t.contains("chr1", Strand::Reverse, 150));
    }

    #[test]
    fn check_coord_accepts_loose_strands() {
        let t = targets(&["chr1,100,200,-"]);
        assert!(t.check_coord("chr1", "-", 150).unwrap());
        assert!(t.check_coord("chr1", -1, 150).unwrap());
        assert!(!t.check_coord("chr1", "+", 150).unwrap());
        assert!(matches!(
            t.check_coord("chr1", "*", 150),
            Err(TargetError::UnknownStrand(_))
        ));
    }

    #[test]
    fn bad_strand_cites_line() {
        let err = Targets::from_list(["chr1,1,2,+", "chr1,5,6,x"]).unwrap_err();
        match err {
            TargetError::BadStrand { line, strand } => {
                assert_eq!(line, 2);
                assert_eq!(strand, "x");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn float_coordinates_accepted() {
        let t = targets(&["chr1,100.0,200.0,+"]);
        assert!(t.contains("chr1", Strand::Forward, 150));
    }

    #[test]
    fn bed_file_requires_six_columns() {
        let mut file = tempfile::Builder::new().suffix(".bed").tempfile().unwrap();
        writeln!(file, "chr1\t10\t20\tfeature\t0\t+").unwrap();
        writeln!(file, "chr1\t30\t40\tfeature\t0").unwrap();
        let err = Targets::from_file(file.path()).unwrap_err();
        match err {
            TargetError::BadBedRecord { line, found, .. } => {
                assert_eq!(line, 2);
                assert_eq!(found, 5);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn bed_file_parses() {
        let mut file = tempfile::Builder::new().suffix(".bed").tempfile().unwrap();
        writeln!(file, "chr1\t10\t20\tfeature\t0\t+").unwrap();
        writeln!(file, "chr2\t5\t15\tfeature\t0\t-").unwrap();
        let t = Targets::from_file(file.path()).unwrap();
        assert!(t.contains("chr1", Strand::Forward, 12));
        assert!(t.contains("chr2", Strand::Reverse, 5));
        assert_eq!(t.contigs(), vec!["chr1", "chr2"]);
    }

    #[test]
    fn comma_file_parses_like_inline_list() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "chr1,10,20,+").unwrap();
        writeln!(file, "chr3").unwrap();
        let t = Targets::from_file(file.path()).unwrap();
        assert!(t.contains("chr1", Strand::Forward, 10));
        assert!(t.contains("chr3", Strand::Reverse, 1_000_000));
    }

    #[test]
    fn reparse_of_enumerated_intervals_is_identity() {
        let t = targets(&["chr1,10,20,+", "chr1,15,30,+", "chr2,5,6,-", "chrM"]);
        let lines: Vec<String> = t
            .iter_intervals()
            .map(|(strand, contig, start, end)| {
                if end == WHOLE_CONTIG_END {
                    format!("{contig},0,{end},{strand}")
                } else {
                    format!("{contig},{start},{end},{strand}")
                }
            })
            .collect();
        let reparsed = Targets::from_list(&lines).unwrap();
        let a: Vec<_> = t.iter_intervals().collect();
        let b: Vec<_> = reparsed.iter_intervals().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_targets_reject_everything() {
        let t = Targets::default();
        assert!(t.is_empty());
        assert!(!t.contains("chr1", Strand::Forward, 0));
    }
}
