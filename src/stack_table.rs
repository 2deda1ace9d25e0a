//! Per-size-class call-stack accounting.

use crate::bookkeeping::{new_map, AHashMap};
use crate::callstack::StackHandle;
use crate::ranked::{RankedSet, RankedValue};
use crate::trend::TrendAnalyzer;

// Live-count bookkeeping for one call stack within one size class.
#[derive(Clone, Copy)]
struct StackCount {
    count: u32,
    prev_count: Option<u32>,
    last_drop_count: u32,
    last_drop_ticks: u64,
}

/// How much a call stack's live count has grown, and for how long, since
/// the last period in which it did not grow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UptrendInfo {
    pub duration_ticks: u64,
    pub growth: u32,
}

/// Live allocation counts keyed by canonical call stack, plus the
/// stack-scoped trend analyzer for one size class.
pub struct CallStackTable {
    counts: AHashMap<StackHandle, StackCount>,
    analyzer: TrendAnalyzer,
}

impl CallStackTable {
    pub fn new(ranking_size: usize, score_threshold: u32) -> Self {
        CallStackTable {
            counts: new_map(),
            analyzer: TrendAnalyzer::new(ranking_size, score_threshold),
        }
    }

    /// Records one allocation attributed to `stack`.
    pub fn add(&mut self, stack: StackHandle) {
        self.counts
            .entry(stack)
            .or_insert(StackCount {
                count: 0,
                prev_count: None,
                last_drop_count: 0,
                last_drop_ticks: 0,
            })
            .count += 1;
    }

    /// Records one free attributed to `stack`.  Entries are evicted as
    /// soon as their live count returns to zero.
    pub fn remove(&mut self, stack: StackHandle) {
        if let Some(info) = self.counts.get_mut(&stack) {
            info.count = info.count.saturating_sub(1);
            if info.count == 0 {
                self.counts.remove(&stack);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Live count currently attributed to `stack`.
    pub fn count(&self, stack: StackHandle) -> u32 {
        self.counts.get(&stack).map_or(0, |info| info.count)
    }

    /// Top call sites by live count.
    pub fn ranked_counts(&self, capacity: usize) -> RankedSet {
        let mut set = RankedSet::new(capacity);
        for (&stack, info) in self.counts.iter() {
            set.add(RankedValue::Stack(stack), info.count);
        }
        set
    }

    /// Runs one analysis pass over the current counts.
    pub fn test_for_leaks(&mut self) {
        let snapshot = self.ranked_counts(self.analyzer.ranking_size());
        self.analyzer.add_sample(snapshot);
    }

    /// Call stacks the analyzer currently suspects.
    pub fn suspected_leaks(&self) -> &[RankedValue] {
        self.analyzer.suspected_leaks()
    }

    /// Rolls the per-period baselines forward.  A count that did not grow
    /// since the previous period, or is observed for the first time,
    /// becomes the new "last drop" baseline.
    pub fn update_last_drop_info(&mut self, now_ticks: u64) {
        for info in self.counts.values_mut() {
            let grew = info.prev_count.map_or(false, |prev| info.count > prev);
            if !grew {
                info.last_drop_ticks = now_ticks;
                info.last_drop_count = info.count;
            }
            info.prev_count = Some(info.count);
        }
    }

    /// Growth and duration since the last observed drop for `stack`.
    /// Unknown stacks report zeros.
    pub fn get_last_uptrend_info(&self, stack: StackHandle, now_ticks: u64) -> UptrendInfo {
        match self.counts.get(&stack) {
            Some(info) => UptrendInfo {
                duration_ticks: now_ticks.saturating_sub(info.last_drop_ticks),
                growth: info.count.saturating_sub(info.last_drop_count),
            },
            None => UptrendInfo::default(),
        }
    }
}
