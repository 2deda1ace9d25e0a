//! Leak reports handed to the reporting collaborator.
//!
//! Reports are plain values built with ordinary containers: they leave the
//! engine, and the consumer is expected to handle them outside any
//! allocation hook.

use std::fmt;

use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};

/// Sentinel offset for frames that fall outside the instrumented mapping.
pub const UNMAPPED_FRAME: usize = usize::MAX;

/// Live-allocation count for one size class at one analysis period.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeCount {
    pub size_bytes: usize,
    pub count: u32,
}

/// Allocation-count breakdown for one analysis period.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocBreakdown {
    /// Top size classes by live count, busiest first.
    pub counts_by_size: Vec<SizeCount>,
    /// Live count attributed to the reported call stack; zero for periods
    /// that precede call-stack tracking of its size class.
    pub count_for_call_stack: u32,
}

/// One suspected leak: a size class and call stack whose net allocation
/// count kept growing conspicuously, with enough history to judge it.
///
/// Call-stack frames are offsets from the mapping base supplied at
/// detector construction, so they stay comparable across process runs that
/// load the mapping at different addresses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakReport {
    /// Size class of the suspected allocations, in bytes.
    pub alloc_size_bytes: usize,
    /// Mapping-relative call stack, innermost first; [`UNMAPPED_FRAME`]
    /// marks frames outside the mapping.
    pub call_stack: Vec<usize>,
    /// Breakdown history, oldest first, ending at the analysis pass that
    /// produced this report.
    pub alloc_breakdown_history: Vec<AllocBreakdown>,
    /// Ticks since the reported stack's live count last failed to grow.
    pub uptrend_duration_ticks: u64,
    /// Live-count growth accumulated over that duration.
    pub uptrend_growth: u32,
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let live = self
            .alloc_breakdown_history
            .last()
            .map_or(0, |b| b.count_for_call_stack);
        write!(
            f,
            "suspected leak: {}B allocations, {} live, +{} over {} ticks, stack [",
            self.alloc_size_bytes,
            live.to_formatted_string(&Locale::en),
            self.uptrend_growth.to_formatted_string(&Locale::en),
            self.uptrend_duration_ticks
        )?;
        for (i, frame) in self.call_stack.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if *frame == UNMAPPED_FRAME {
                f.write_str("?")?;
            } else {
                write!(f, "{:#x}", frame)?;
            }
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_summarizes_the_report() {
        let report = LeakReport {
            alloc_size_bytes: 48,
            call_stack: vec![0x1000, UNMAPPED_FRAME],
            alloc_breakdown_history: vec![AllocBreakdown {
                counts_by_size: vec![SizeCount {
                    size_bytes: 48,
                    count: 1234,
                }],
                count_for_call_stack: 1000,
            }],
            uptrend_duration_ticks: 7,
            uptrend_growth: 950,
        };
        let rendered = report.to_string();
        assert!(rendered.contains("48B"));
        assert!(rendered.contains("1,000 live"));
        assert!(rendered.contains("+950"));
        assert!(rendered.contains("0x1000"));
        assert!(rendered.contains("?"));
    }
}
