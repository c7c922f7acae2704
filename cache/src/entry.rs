use crate::reference::{KeyReference, ValueReference};

use generational_arena::Index;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// The two intrusive orderings every live entry takes part in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Order {
  /// Least recently read or written at the tail. Drives LRU eviction and
  /// access expiration.
  Access = 0,
  /// Least recently written at the tail. Drives write expiration.
  Write = 1,
}

impl Order {
  pub(crate) const ALL: [Order; 2] = [Order::Access, Order::Write];
}

/// Neighbours in one ordering. `prev` points towards the head (most recent),
/// `next` towards the tail.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Links {
  pub(crate) prev: Option<Index>,
  pub(crate) next: Option<Index>,
}

/// A single mapping inside a segment's table.
pub(crate) struct Entry<K, V> {
  pub(crate) key: KeyReference<K>,
  pub(crate) hash: u64,
  pub(crate) value: ValueReference<V>,
  /// Weight as reported by the weigher. Counted towards the segment total
  /// only while `linked` is set.
  pub(crate) weight: u64,
  /// Next entry in the same hash bucket.
  pub(crate) next: Option<Index>,
  pub(crate) links: [Links; 2],
  /// Whether the entry sits in the access and write queues. First-load
  /// placeholders are in the table but not in the queues.
  pub(crate) linked: bool,
  /// Ticker reading of the last write. Only touched under the write lock.
  pub(crate) write_time: u64,
  /// Ticker reading of the last read or write. Readers update it holding
  /// only the shared lock.
  access_time: AtomicU64,
  /// Set once the entry sits in the segment's reclaim buffer.
  reclaim_queued: AtomicBool,
}

impl<K, V> Entry<K, V> {
  pub(crate) fn new(key: KeyReference<K>, hash: u64, value: ValueReference<V>, now: u64) -> Self {
    Self {
      key,
      hash,
      value,
      weight: 0,
      next: None,
      links: [Links::default(); 2],
      linked: false,
      write_time: now,
      access_time: AtomicU64::new(now),
      reclaim_queued: AtomicBool::new(false),
    }
  }

  #[inline]
  pub(crate) fn access_time(&self) -> u64 {
    self.access_time.load(Ordering::Relaxed)
  }

  #[inline]
  pub(crate) fn set_access_time(&self, now: u64) {
    self.access_time.store(now, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn links(&self, order: Order) -> &Links {
    &self.links[order as usize]
  }

  #[inline]
  pub(crate) fn links_mut(&mut self, order: Order) -> &mut Links {
    &mut self.links[order as usize]
  }

  /// Marks the entry as queued for reclaiming. Returns `false` if it already
  /// was, so each collected entry occupies at most one buffer slot.
  #[inline]
  pub(crate) fn mark_reclaim_queued(&self) -> bool {
    !self.reclaim_queued.swap(true, Ordering::AcqRel)
  }

  #[inline]
  pub(crate) fn clear_reclaim_queued(&self) {
    self.reclaim_queued.store(false, Ordering::Release);
  }

  /// Whether the key or the value has been reclaimed.
  pub(crate) fn is_collected(&self) -> bool {
    self.key.is_cleared() || self.value.is_cleared()
  }
}
