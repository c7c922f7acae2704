use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A thread-safe statistics collector.
///
/// Every segment owns one, and the cache owns one more for work that is not
/// attributable to a single segment (bulk loads). All fields are atomic and
/// updated with relaxed ordering on the calling thread.
#[derive(Debug, Default)]
pub(crate) struct StatsCounter {
  hits: CachePadded<AtomicU64>,
  misses: CachePadded<AtomicU64>,
  load_successes: CachePadded<AtomicU64>,
  load_exceptions: CachePadded<AtomicU64>,
  total_load_time: CachePadded<AtomicU64>,
  evictions: CachePadded<AtomicU64>,
}

impl StatsCounter {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  #[inline]
  pub(crate) fn record_hits(&self, count: u64) {
    self.hits.fetch_add(count, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn record_misses(&self, count: u64) {
    self.misses.fetch_add(count, Ordering::Relaxed);
  }

  pub(crate) fn record_load_success(&self, load_time_nanos: u64) {
    self.load_successes.fetch_add(1, Ordering::Relaxed);
    self
      .total_load_time
      .fetch_add(load_time_nanos, Ordering::Relaxed);
  }

  pub(crate) fn record_load_exception(&self, load_time_nanos: u64) {
    self.load_exceptions.fetch_add(1, Ordering::Relaxed);
    self
      .total_load_time
      .fetch_add(load_time_nanos, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn record_eviction(&self) {
    self.evictions.fetch_add(1, Ordering::Relaxed);
  }

  /// Reads the counters into a snapshot. Not atomic across fields.
  pub(crate) fn snapshot(&self) -> CacheStats {
    CacheStats {
      hit_count: self.hits.load(Ordering::Relaxed),
      miss_count: self.misses.load(Ordering::Relaxed),
      load_success_count: self.load_successes.load(Ordering::Relaxed),
      load_exception_count: self.load_exceptions.load(Ordering::Relaxed),
      total_load_time_nanos: self.total_load_time.load(Ordering::Relaxed),
      eviction_count: self.evictions.load(Ordering::Relaxed),
    }
  }
}

/// A public-facing snapshot of the cache's counters.
///
/// Snapshots are summed segment by segment without stopping writers, so two
/// counters may disagree by a few in-flight operations. Treat the numbers as
/// eventually consistent.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CacheStats {
  /// Lookups that found a live value.
  pub hit_count: u64,
  /// Lookups that found nothing, or waited on a load.
  pub miss_count: u64,
  /// Loads that produced a value.
  pub load_success_count: u64,
  /// Loads that failed, returned no value, or panicked.
  pub load_exception_count: u64,
  /// Nanoseconds spent loading, successful or not.
  pub total_load_time_nanos: u64,
  /// Entries removed by size, expiration or reference collection.
  pub eviction_count: u64,
}

impl CacheStats {
  /// `hit_count + miss_count`.
  pub fn request_count(&self) -> u64 {
    self.hit_count.saturating_add(self.miss_count)
  }

  /// The ratio of hits to requests, `1.0` when there were no requests.
  pub fn hit_rate(&self) -> f64 {
    let requests = self.request_count();
    if requests == 0 {
      1.0
    } else {
      self.hit_count as f64 / requests as f64
    }
  }

  /// The ratio of misses to requests, `0.0` when there were no requests.
  pub fn miss_rate(&self) -> f64 {
    let requests = self.request_count();
    if requests == 0 {
      0.0
    } else {
      self.miss_count as f64 / requests as f64
    }
  }

  /// `load_success_count + load_exception_count`.
  pub fn load_count(&self) -> u64 {
    self
      .load_success_count
      .saturating_add(self.load_exception_count)
  }

  pub fn load_exception_rate(&self) -> f64 {
    let loads = self.load_count();
    if loads == 0 {
      0.0
    } else {
      self.load_exception_count as f64 / loads as f64
    }
  }

  /// Mean time spent per load, in nanoseconds.
  pub fn average_load_penalty_nanos(&self) -> f64 {
    let loads = self.load_count();
    if loads == 0 {
      0.0
    } else {
      self.total_load_time_nanos as f64 / loads as f64
    }
  }

  /// The difference between two snapshots, clamped at zero.
  pub fn minus(&self, other: &CacheStats) -> CacheStats {
    CacheStats {
      hit_count: self.hit_count.saturating_sub(other.hit_count),
      miss_count: self.miss_count.saturating_sub(other.miss_count),
      load_success_count: self
        .load_success_count
        .saturating_sub(other.load_success_count),
      load_exception_count: self
        .load_exception_count
        .saturating_sub(other.load_exception_count),
      total_load_time_nanos: self
        .total_load_time_nanos
        .saturating_sub(other.total_load_time_nanos),
      eviction_count: self.eviction_count.saturating_sub(other.eviction_count),
    }
  }

  /// The sum of two snapshots.
  pub fn plus(&self, other: &CacheStats) -> CacheStats {
    CacheStats {
      hit_count: self.hit_count.saturating_add(other.hit_count),
      miss_count: self.miss_count.saturating_add(other.miss_count),
      load_success_count: self
        .load_success_count
        .saturating_add(other.load_success_count),
      load_exception_count: self
        .load_exception_count
        .saturating_add(other.load_exception_count),
      total_load_time_nanos: self
        .total_load_time_nanos
        .saturating_add(other.total_load_time_nanos),
      eviction_count: self.eviction_count.saturating_add(other.eviction_count),
    }
  }
}

impl fmt::Debug for CacheStats {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheStats")
      .field("hit_count", &self.hit_count)
      .field("miss_count", &self.miss_count)
      .field("hit_rate", &format!("{:.2}%", self.hit_rate() * 100.0))
      .field("load_success_count", &self.load_success_count)
      .field("load_exception_count", &self.load_exception_count)
      .field("total_load_time_nanos", &self.total_load_time_nanos)
      .field("eviction_count", &self.eviction_count)
      .finish()
  }
}
