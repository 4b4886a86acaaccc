//! Metric cache for the cloudmetrics adapter
//!
//! The cache is the only state shared between the reconciler (one writer)
//! and request handlers (many readers). Entries are stored behind `Arc` and
//! swapped whole under a `parking_lot::RwLock`, so a reader holds either the
//! previous entry or the new one and never a mix of both.

#![deny(missing_docs)]

mod cache;
mod key;

pub use cache::{CacheEntry, MatchOutcome, MetricCache};
pub use key::{CacheKey, CustomScope, ExternalKey, GroupResource, TargetKey};
