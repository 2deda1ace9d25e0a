//! Sustained-growth analysis over successive ranked snapshots.
//!
//! A leak does not announce itself in any single sample.  The analyzer
//! compares consecutive top-N snapshots, looks for a small cluster of
//! values growing much faster than the rest, and only reports a value once
//! it has stood out for enough consecutive periods.  Uniform growth, as in
//! a warm-up burst, produces no cliff in the sorted deltas and therefore no
//! suspects; a value that sits out a single period starts over from zero.

use std::mem;

use crate::bookkeeping::{new_vec, AVec};
use crate::ranked::{RankedSet, RankedValue};

// Score added for each consecutive period a value stays a suspect.
const SCORE_INCREMENT: u32 = 1;

pub struct TrendAnalyzer {
    ranking_size: usize,
    score_threshold: u32,
    prev: RankedSet,
    current: RankedSet,
    // (value, accumulated score), value-ordered, at most ranking_size long.
    scores: AVec<(RankedValue, u32)>,
    suspected: AVec<RankedValue>,
}

impl TrendAnalyzer {
    pub fn new(ranking_size: usize, score_threshold: u32) -> Self {
        TrendAnalyzer {
            ranking_size,
            score_threshold,
            prev: RankedSet::new(ranking_size),
            current: RankedSet::new(ranking_size),
            scores: new_vec(),
            suspected: new_vec(),
        }
    }

    pub fn ranking_size(&self) -> usize {
        self.ranking_size
    }

    /// Feeds the next snapshot and updates the suspected-leak list.
    pub fn add_sample(&mut self, snapshot: RankedSet) {
        self.prev = mem::replace(&mut self.current, snapshot);

        let mut deltas = RankedSet::new(self.ranking_size);
        for entry in self.current.iter() {
            // A value absent from the previous snapshot has no baseline
            // yet, and a shrinking value carries no leak signal.
            if let Some(prev_count) = self.prev.find(&entry.value) {
                if entry.count >= prev_count {
                    deltas.add(entry.value, entry.count - prev_count);
                }
            }
        }
        self.analyze_deltas(&deltas);
    }

    /// Values whose suspicion score has reached the threshold.
    pub fn suspected_leaks(&self) -> &[RankedValue] {
        &self.suspected
    }

    fn analyze_deltas(&mut self, deltas: &RankedSet) {
        let entries = deltas.as_slice();

        // The cliff: the first adjacent pair in the descending delta list
        // where the earlier delta is more than double the later one.
        // Everything before it grew conspicuously faster than the rest.
        let mut cliff = None;
        if entries.len() > 1 {
            for i in 0..entries.len() - 1 {
                if entries[i].count > entries[i + 1].count.saturating_mul(2) {
                    cliff = Some(i + 1);
                    break;
                }
            }
        }
        let suspects = match cliff {
            Some(pos) if entries[0].count > 0 => &entries[..pos],
            _ => &entries[..0],
        };

        // Suspicion must be sustained without interruption.
        self.scores
            .retain(|(value, _)| suspects.iter().any(|s| s.value == *value));

        for suspect in suspects {
            match self
                .scores
                .binary_search_by(|(value, _)| value.cmp(&suspect.value))
            {
                Ok(i) => self.scores[i].1 += SCORE_INCREMENT,
                Err(i) => {
                    // A full score table refuses new entries.
                    if self.scores.len() < self.ranking_size {
                        self.scores.insert(i, (suspect.value, SCORE_INCREMENT));
                    }
                }
            }
        }

        self.suspected.clear();
        for &(value, score) in self.scores.iter() {
            if score >= self.score_threshold {
                self.suspected.push(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(counts: &[(usize, u32)]) -> RankedSet {
        let mut set = RankedSet::new(16);
        for &(size, count) in counts {
            set.add(RankedValue::Size(size), count);
        }
        set
    }

    #[test]
    fn uniform_growth_is_never_suspicious() {
        let mut analyzer = TrendAnalyzer::new(16, 3);
        for round in 0..10u32 {
            analyzer.add_sample(snapshot(&[
                (16, 100 + 5 * round),
                (32, 200 + 5 * round),
                (48, 300 + 5 * round),
            ]));
            assert!(analyzer.suspected_leaks().is_empty());
        }
    }

    #[test]
    fn sustained_standout_growth_is_reported() {
        let mut analyzer = TrendAnalyzer::new(16, 3);
        analyzer.add_sample(snapshot(&[(16, 100), (32, 100)]));
        for round in 1..=2u32 {
            analyzer.add_sample(snapshot(&[(16, 100), (32, 100 + 10 * round)]));
            assert!(analyzer.suspected_leaks().is_empty());
        }
        analyzer.add_sample(snapshot(&[(16, 100), (32, 130)]));
        assert_eq!(analyzer.suspected_leaks(), &[RankedValue::Size(32)]);
    }

    #[test]
    fn interrupted_growth_resets_the_score() {
        let mut analyzer = TrendAnalyzer::new(16, 3);
        analyzer.add_sample(snapshot(&[(16, 100), (32, 100)]));
        analyzer.add_sample(snapshot(&[(16, 100), (32, 110)]));
        analyzer.add_sample(snapshot(&[(16, 100), (32, 120)]));
        assert!(analyzer.suspected_leaks().is_empty());

        // One flat period wipes the accumulated score.
        analyzer.add_sample(snapshot(&[(16, 100), (32, 120)]));
        assert!(analyzer.suspected_leaks().is_empty());

        analyzer.add_sample(snapshot(&[(16, 100), (32, 130)]));
        analyzer.add_sample(snapshot(&[(16, 100), (32, 140)]));
        assert!(analyzer.suspected_leaks().is_empty());
        analyzer.add_sample(snapshot(&[(16, 100), (32, 150)]));
        assert_eq!(analyzer.suspected_leaks(), &[RankedValue::Size(32)]);
    }

    #[test]
    fn values_missing_a_baseline_are_skipped() {
        let mut analyzer = TrendAnalyzer::new(16, 1);
        // 64 appears for the first time with a huge count; without a
        // baseline it cannot be judged, so nothing is suspected.
        analyzer.add_sample(snapshot(&[(16, 100), (32, 100)]));
        analyzer.add_sample(snapshot(&[(16, 100), (32, 100), (64, 10_000)]));
        assert!(analyzer.suspected_leaks().is_empty());
    }

    #[test]
    fn every_standout_grower_is_reported() {
        let mut analyzer = TrendAnalyzer::new(16, 1);
        analyzer.add_sample(snapshot(&[(16, 100), (32, 100), (48, 100), (64, 100)]));
        analyzer.add_sample(snapshot(&[(16, 150), (32, 150), (48, 150), (64, 100)]));
        let suspected = analyzer.suspected_leaks();
        assert_eq!(suspected.len(), 3);
        for size in [16, 32, 48] {
            assert!(suspected.contains(&RankedValue::Size(size)));
        }
    }
}
