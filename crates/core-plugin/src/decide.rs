//! Decision assignment: classify an aligned record against its targets.

use core_model::{Decision, ReadRecord};
use core_targets::Targets;

/// Classify one record. Applied in order:
///
/// 1. empty `seq` → `no_seq`
/// 2. no alignments → `no_map`
/// 3. otherwise `single_*`/`multi_*`, `on` iff any alignment's end-of-read
///    coordinate (end when forward, start when reverse) lies inside a target
///    interval.
pub fn assign_decision(record: &ReadRecord, targets: &Targets) -> Decision {
    if record.seq.is_empty() {
        return Decision::NoSeq;
    }
    let alignments = record.alignments();
    if alignments.is_empty() {
        return Decision::NoMap;
    }
    let coord_match = alignments
        .iter()
        .any(|al| targets.contains(&al.contig, al.strand, al.decision_coord()));
    match (alignments.len(), coord_match) {
        (1, true) => Decision::SingleOn,
        (1, false) => Decision::SingleOff,
        (_, true) => Decision::MultiOn,
        (_, false) => Decision::MultiOff,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_model::{Alignment, Strand};

    fn targets() -> Targets {
        Targets::from_list(["chr1,100,200,+"]).unwrap()
    }

    fn record(seq: &str, alignments: Vec<Alignment>) -> ReadRecord {
        let mut record = ReadRecord::new(1, 1, "read", seq);
        record.alignment_data = Some(alignments);
        record
    }

    #[test]
    fn empty_seq_wins_over_everything() {
        let r = record("", vec![Alignment::new("chr1", Strand::Forward, 100, 150)]);
        assert_eq!(assign_decision(&r, &targets()), Decision::NoSeq);
    }

    #[test]
    fn no_alignments_is_no_map() {
        let r = record("ACGT", vec![]);
        assert_eq!(assign_decision(&r, &targets()), Decision::NoMap);
        // Aligner not run at all looks the same to classification.
        let mut r = ReadRecord::new(1, 1, "read", "ACGT");
        r.alignment_data = None;
        assert_eq!(assign_decision(&r, &targets()), Decision::NoMap);
    }

    #[test]
    fn single_alignment_classifies_by_end_coordinate() {
        let on = record("ACGT", vec![Alignment::new("chr1", Strand::Forward, 10, 150)]);
        assert_eq!(assign_decision(&on, &targets()), Decision::SingleOn);
        let off = record("ACGT", vec![Alignment::new("chr1", Strand::Forward, 10, 500)]);
        assert_eq!(assign_decision(&off, &targets()), Decision::SingleOff);
    }

    #[test]
    fn reverse_strand_uses_alignment_start() {
        let targets = Targets::from_list(["chr1,100,200,-"]).unwrap();
        let on = record("ACGT", vec![Alignment::new("chr1", Strand::Reverse, 150, 900)]);
        assert_eq!(assign_decision(&on, &targets), Decision::SingleOn);
        let off = record("ACGT", vec![Alignment::new("chr1", Strand::Reverse, 50, 900)]);
        assert_eq!(assign_decision(&off, &targets), Decision::SingleOff);
    }

    #[test]
    fn multi_alignment_needs_any_single_match() {
        let on = record(
            "ACGT",
            vec![
                Alignment::new("chr2", Strand::Forward, 0, 50),
                Alignment::new("chr1", Strand::Forward, 100, 180),
            ],
        );
        assert_eq!(assign_decision(&on, &targets()), Decision::MultiOn);
        let off = record(
            "ACGT",
            vec![
                Alignment::new("chr2", Strand::Forward, 0, 50),
                Alignment::new("chr1", Strand::Forward, 300, 400),
            ],
        );
        assert_eq!(assign_decision(&off, &targets()), Decision::MultiOff);
    }
}
