//! Online statistical memory-leak detection for instrumented allocators.
//!
//! `malloc_trend` watches every allocation and free a host feeds it and
//! flags allocation sites whose net allocation count keeps growing in a
//! sustained, conspicuous way relative to all other sites.  It never stops
//! the process, never symbolicates, and keeps every byte of its own
//! bookkeeping on a separate installable allocator, so it can run from
//! inside an allocation hook without recursing into itself.
//!
//! Detection runs in two tiers.  Allocations are first bucketed by
//! quantized size; a trend analyzer watches the per-size live counts and
//! promotes size classes that stand out to call-stack tracking.  Inside a
//! promoted class, allocations are attributed to canonicalized call
//! stacks and a second analyzer watches those.  A call stack that keeps
//! standing out becomes a [`LeakReport`] with mapping-relative frames,
//! allocation-history context, and a cooldown against duplicate reports.
//!
//! Suspicion, not proof: a report says an allocation site deserves a
//! look, not that the program leaks.
//!
//! ## Wiring
//!
//! The host intercepts the process allocator (a `GlobalAlloc` shim, an
//! `LD_PRELOAD` interposer, or similar), serializes all calls, and drives
//! the engine:
//!
//! ```
//! use malloc_trend::{bookkeeping, capture_raw_stack, LeakDetector, MAX_STACK_DEPTH};
//!
//! bookkeeping::initialize(None, None);
//!
//! let mut detector = LeakDetector::new(0x40_0000, 0x20_0000, 4, 4);
//!
//! // On every allocation:
//! let mut frames = [0usize; MAX_STACK_DEPTH];
//! let depth = capture_raw_stack(&mut frames);
//! detector.record_alloc(0xdead_beef, 32, &frames[..depth]);
//!
//! // On every free:
//! detector.record_free(0xdead_beef);
//!
//! // Periodically, e.g. every N bytes of cumulative allocation:
//! let reports = detector.test_for_leaks(1);
//! assert!(reports.is_empty());
//! ```
//!
//! Reports are plain serializable values; symbolication and transport are
//! the consumer's business.

pub mod bookkeeping;
pub mod callstack;
pub mod capture;
pub mod config;
pub mod detector;
pub mod ranked;
pub mod report;
pub mod stack_table;
pub mod trend;

pub use bookkeeping::{AllocFn, BookkeepingAlloc, FreeFn};
pub use callstack::{StackHandle, StackInterner};
pub use capture::{capture_raw_stack, MAX_STACK_DEPTH};
pub use config::{ConfigError, DetectorConfig};
pub use detector::{DetectorStats, LeakDetector};
pub use ranked::{RankedEntry, RankedSet, RankedValue};
pub use report::{AllocBreakdown, LeakReport, SizeCount, UNMAPPED_FRAME};
pub use stack_table::{CallStackTable, UptrendInfo};
pub use trend::TrendAnalyzer;
