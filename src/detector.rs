//! Leak detection orchestration.
//!
//! The detector keeps one bucket per size class.  Every allocation and
//! free updates its bucket's net live count; the periodic analysis pass
//! feeds the per-size counts to a trend analyzer, promotes conspicuously
//! growing size classes to call-stack tracking, and runs a second,
//! stack-scoped analysis inside every promoted bucket.  Stacks that stand
//! out there for long enough become [`LeakReport`]s.
//!
//! The engine is not thread safe.  The host must serialize
//! [`record_alloc`](LeakDetector::record_alloc),
//! [`record_free`](LeakDetector::record_free) and
//! [`test_for_leaks`](LeakDetector::test_for_leaks), for example with the
//! lock it already holds around the allocator hook.

use serde::Serialize;
use tracing::debug;

use crate::bookkeeping::{new_map, new_vec, AHashMap, AVec, BookkeepingAlloc};
use crate::callstack::{StackHandle, StackInterner};
use crate::config::{ConfigError, DetectorConfig};
use crate::ranked::{RankedSet, RankedValue};
use crate::report::{AllocBreakdown, LeakReport, SizeCount, UNMAPPED_FRAME};
use crate::stack_table::CallStackTable;
use crate::trend::TrendAnalyzer;

/// Running totals for the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DetectorStats {
    pub alloc_count: u64,
    pub free_count: u64,
    pub live_allocations: usize,
    pub interned_stacks: usize,
}

// One size class: net live count, a call-stack table once promoted, and a
// bounded history of the class's top call sites.
struct SizeBucket {
    count: u32,
    stacks: Option<CallStackTable>,
    history: AVec<AVec<(StackHandle, u32)>>,
}

// One outstanding allocation: its size class and, when the class was under
// call-stack tracking at allocation time, the attributed stack.
struct LiveAlloc {
    class: usize,
    stack: Option<StackHandle>,
}

/// Online statistical memory-leak detector.
pub struct LeakDetector {
    config: DetectorConfig,
    interner: StackInterner,
    buckets: AVec<SizeBucket>,
    live: AHashMap<usize, LiveAlloc>,
    size_analyzer: TrendAnalyzer,
    size_history: AVec<AVec<SizeCount>>,
    // (size class, stack) pairs suppressed after a report, with the number
    // of analysis periods left.
    cooldowns: AHashMap<(usize, StackHandle), u32>,
    alloc_count: u64,
    free_count: u64,
}

impl LeakDetector {
    /// Creates a detector with default tunables.  Frames of reported call
    /// stacks are rebased onto `mapping_base_address`.
    pub fn new(
        mapping_base_address: usize,
        mapping_size: usize,
        size_suspicion_threshold: u32,
        call_stack_suspicion_threshold: u32,
    ) -> Self {
        let config = DetectorConfig {
            mapping_base_address,
            mapping_size,
            size_suspicion_threshold,
            call_stack_suspicion_threshold,
            ..DetectorConfig::default()
        };
        Self::with_config(config).expect("default tunables are valid")
    }

    pub fn with_config(config: DetectorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut buckets = AVec::with_capacity_in(config.num_buckets(), BookkeepingAlloc);
        for _ in 0..config.num_buckets() {
            buckets.push(SizeBucket {
                count: 0,
                stacks: None,
                history: new_vec(),
            });
        }
        let size_analyzer =
            TrendAnalyzer::new(config.ranking_size, config.size_suspicion_threshold);
        Ok(LeakDetector {
            interner: StackInterner::new(),
            buckets,
            live: new_map(),
            size_analyzer,
            size_history: new_vec(),
            cooldowns: new_map(),
            alloc_count: 0,
            free_count: 0,
            config,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn stats(&self) -> DetectorStats {
        DetectorStats {
            alloc_count: self.alloc_count,
            free_count: self.free_count,
            live_allocations: self.live.len(),
            interned_stacks: self.interner.len(),
        }
    }

    // Oversized allocations collapse into the single overflow class; the
    // bucket array never grows.
    fn size_class(&self, size: usize) -> usize {
        if size > self.config.max_alloc_size {
            self.config.max_alloc_size / self.config.size_granularity + 1
        } else {
            size / self.config.size_granularity
        }
    }

    fn class_bytes(&self, class: usize) -> usize {
        class * self.config.size_granularity
    }

    /// Records one allocation.  An empty `frames` slice means the
    /// allocation has no call-stack attribution; it still counts toward
    /// its size class.
    pub fn record_alloc(&mut self, address: usize, size: usize, frames: &[usize]) {
        let class = self.size_class(size);
        self.alloc_count += 1;
        let tracked = self.buckets[class].stacks.is_some() && !frames.is_empty();
        let stack = if tracked {
            Some(self.interner.intern(frames))
        } else {
            None
        };
        let bucket = &mut self.buckets[class];
        bucket.count += 1;
        if let (Some(handle), Some(table)) = (stack, bucket.stacks.as_mut()) {
            table.add(handle);
        }
        // An address reused without an observed free replaces the stale
        // record.
        self.live.insert(address, LiveAlloc { class, stack });
    }

    /// Records one free.  Addresses never seen by
    /// [`record_alloc`](Self::record_alloc), such as memory allocated
    /// before instrumentation started, are ignored.
    pub fn record_free(&mut self, address: usize) {
        let record = match self.live.remove(&address) {
            Some(record) => record,
            None => return,
        };
        self.free_count += 1;
        let bucket = &mut self.buckets[record.class];
        bucket.count = bucket.count.saturating_sub(1);
        if let (Some(handle), Some(table)) = (record.stack, bucket.stacks.as_mut()) {
            table.remove(handle);
        }
    }

    /// Runs one analysis pass and returns any new leak reports.
    ///
    /// `now_ticks` is an opaque, monotonically non-decreasing timestamp
    /// chosen by the host; it only ever appears in uptrend durations.
    pub fn test_for_leaks(&mut self, now_ticks: u64) -> Vec<LeakReport> {
        // Expired cooldowns make room for the next report of the same
        // pair.
        self.cooldowns.retain(|_, remaining| {
            *remaining -= 1;
            *remaining > 0
        });

        // Size tier: one snapshot of every non-empty bucket.
        let mut snapshot = RankedSet::new(self.config.ranking_size);
        for (class, bucket) in self.buckets.iter().enumerate() {
            if bucket.count > 0 {
                snapshot.add(RankedValue::Size(self.class_bytes(class)), bucket.count);
            }
        }
        let mut breakdown = AVec::with_capacity_in(snapshot.len(), BookkeepingAlloc);
        for entry in snapshot.iter() {
            if let RankedValue::Size(size_bytes) = entry.value {
                breakdown.push(SizeCount {
                    size_bytes,
                    count: entry.count,
                });
            }
        }
        self.size_analyzer.add_sample(snapshot);
        push_bounded(&mut self.size_history, breakdown, self.config.history_depth);

        // Promoted buckets: snapshot their call sites and roll the drop
        // baselines forward.
        let ranking_size = self.config.ranking_size;
        let history_depth = self.config.history_depth;
        for bucket in self.buckets.iter_mut() {
            if let Some(table) = bucket.stacks.as_mut() {
                let top = table.ranked_counts(ranking_size);
                let mut sites = AVec::with_capacity_in(top.len(), BookkeepingAlloc);
                for entry in top.iter() {
                    if let RankedValue::Stack(handle) = entry.value {
                        sites.push((handle, entry.count));
                    }
                }
                push_bounded(&mut bucket.history, sites, history_depth);
                table.update_last_drop_info(now_ticks);
            }
        }

        // Promote newly suspicious size classes.  Promotion is sticky: a
        // bucket keeps its call-stack table even once the size tier stops
        // suspecting it.
        let stack_threshold = self.config.call_stack_suspicion_threshold;
        let mut suspicious_classes: AVec<(usize, usize)> = new_vec();
        for value in self.size_analyzer.suspected_leaks() {
            if let RankedValue::Size(bytes) = *value {
                suspicious_classes.push((bytes, self.size_class(bytes)));
            }
        }
        for &(bytes, class) in suspicious_classes.iter() {
            let bucket = &mut self.buckets[class];
            if bucket.stacks.is_none() {
                bucket.stacks = Some(CallStackTable::new(ranking_size, stack_threshold));
                debug!(size_bytes = bytes, "size class promoted to call-stack tracking");
            }
        }

        // Call-stack tier.
        let mut suspects: AVec<(usize, StackHandle)> = new_vec();
        for (class, bucket) in self.buckets.iter_mut().enumerate() {
            if let Some(table) = bucket.stacks.as_mut() {
                if table.is_empty() {
                    continue;
                }
                table.test_for_leaks();
                for value in table.suspected_leaks() {
                    if let RankedValue::Stack(handle) = *value {
                        suspects.push((class, handle));
                    }
                }
            }
        }

        let mut reports = Vec::new();
        for &(class, handle) in suspects.iter() {
            if self.cooldowns.contains_key(&(class, handle)) {
                continue;
            }
            let report = self.build_report(class, handle, now_ticks);
            debug!(%report, "leak suspect reported");
            reports.push(report);
            self.cooldowns
                .insert((class, handle), self.config.cooldown_periods);
        }
        reports
    }

    fn build_report(&self, class: usize, handle: StackHandle, now_ticks: u64) -> LeakReport {
        let base = self.config.mapping_base_address;
        let mapping_end = base.saturating_add(self.config.mapping_size);
        let call_stack: Vec<usize> = handle
            .frames()
            .iter()
            .map(|&frame| {
                if frame >= base && frame < mapping_end {
                    frame - base
                } else {
                    UNMAPPED_FRAME
                }
            })
            .collect();

        let bucket = &self.buckets[class];
        // The bucket's own history starts at promotion and can be shorter
        // than the size history; align the most recent entries.
        let skew = self.size_history.len().saturating_sub(bucket.history.len());
        let mut history = Vec::with_capacity(self.size_history.len());
        for (i, sizes) in self.size_history.iter().enumerate() {
            let count_for_call_stack = if i >= skew {
                bucket.history[i - skew]
                    .iter()
                    .find(|(h, _)| *h == handle)
                    .map_or(0, |&(_, count)| count)
            } else {
                0
            };
            history.push(AllocBreakdown {
                counts_by_size: sizes.iter().copied().collect(),
                count_for_call_stack,
            });
        }

        let uptrend = bucket
            .stacks
            .as_ref()
            .map(|table| table.get_last_uptrend_info(handle, now_ticks))
            .unwrap_or_default();

        LeakReport {
            alloc_size_bytes: self.class_bytes(class),
            call_stack,
            alloc_breakdown_history: history,
            uptrend_duration_ticks: uptrend.duration_ticks,
            uptrend_growth: uptrend.growth,
        }
    }
}

// Bounded ring: the oldest entry goes once `depth` is reached.
fn push_bounded<T>(history: &mut AVec<T>, item: T, depth: usize) {
    if history.len() == depth {
        history.remove(0);
    }
    history.push(item);
}
