use crate::entry::Entry;
use crate::error::CacheError;
use crate::listener::RemovalListener;
use crate::reference::{KeyStrength, ValueStrength};
use crate::time::Ticker;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Computes the weight of an entry. Must be a pure function of its inputs.
pub type Weigher<K, V> = Arc<dyn Fn(&K, &V) -> u32 + Send + Sync>;

/// The largest number of segments a cache is split into.
pub(crate) const MAX_SEGMENTS: usize = 1 << 16;

/// The largest bucket array a segment grows to.
pub(crate) const MAXIMUM_CAPACITY: usize = 1 << 30;

/// Guards against a bound too small to be meaningfully split.
pub(crate) const SEGMENT_WEIGHT_FACTOR: u64 = 20;

/// The normalised, immutable settings a built cache runs with.
pub(crate) struct CacheConfig<K, V> {
  pub(crate) initial_capacity: usize,
  pub(crate) concurrency_level: usize,
  pub(crate) maximum_weight: Option<u64>,
  pub(crate) weigher: Option<Weigher<K, V>>,
  pub(crate) expire_after_write: Option<u64>,
  pub(crate) expire_after_access: Option<u64>,
  pub(crate) refresh_after_write: Option<u64>,
  pub(crate) key_strength: KeyStrength,
  pub(crate) value_strength: ValueStrength,
  pub(crate) ticker: Arc<dyn Ticker>,
  pub(crate) listener: Option<Arc<dyn RemovalListener<K, V>>>,
}

impl<K, V> CacheConfig<K, V> {
  #[inline]
  pub(crate) fn now(&self) -> u64 {
    self.ticker.read()
  }

  #[inline]
  pub(crate) fn expires(&self) -> bool {
    self.expire_after_write.is_some() || self.expire_after_access.is_some()
  }

  #[inline]
  pub(crate) fn notifies(&self) -> bool {
    self.listener.is_some()
  }

  /// Whether a new entry keyed by `key` outlives the call creating it. A
  /// weak key held by nobody else would be collected straight away.
  #[inline]
  pub(crate) fn retains_key(&self, key: &Arc<K>) -> bool {
    self.key_strength == KeyStrength::Strong || Arc::strong_count(key) > 1
  }

  /// An entry is expired once it is strictly older than a configured
  /// duration, measured from its last write or last access.
  pub(crate) fn is_expired(&self, entry: &Entry<K, V>, now: u64) -> bool {
    if let Some(ttl) = self.expire_after_write {
      if now.saturating_sub(entry.write_time) > ttl {
        return true;
      }
    }
    if let Some(tti) = self.expire_after_access {
      if now.saturating_sub(entry.access_time()) > tti {
        return true;
      }
    }
    false
  }

  pub(crate) fn needs_refresh(&self, entry: &Entry<K, V>, now: u64) -> bool {
    match self.refresh_after_write {
      Some(interval) => {
        !entry.value.is_loading() && now.saturating_sub(entry.write_time) > interval
      }
      None => false,
    }
  }

  /// Weighs an entry outside of any lock. Unweighted caches count entries.
  #[inline]
  pub(crate) fn weight_of(&self, key: &K, value: &V) -> u64 {
    self.weigher.as_ref().map_or(1, |weigher| u64::from(weigher(key, value)))
  }

  /// Like `weight_of`, but a panicking weigher becomes an error so a load
  /// can still release its waiters.
  pub(crate) fn weigh(&self, key: &K, value: &V) -> Result<u64, CacheError> {
    panic::catch_unwind(AssertUnwindSafe(|| self.weight_of(key, value))).map_err(|_| {
      tracing::warn!("weigher panicked; the loaded value was not stored");
      CacheError::LoaderPanicked
    })
  }
}

impl<K, V> fmt::Debug for CacheConfig<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheConfig")
      .field("initial_capacity", &self.initial_capacity)
      .field("concurrency_level", &self.concurrency_level)
      .field("maximum_weight", &self.maximum_weight)
      .field("weigher", &self.weigher.is_some())
      .field("expire_after_write", &self.expire_after_write)
      .field("expire_after_access", &self.expire_after_access)
      .field("refresh_after_write", &self.refresh_after_write)
      .field("key_strength", &self.key_strength)
      .field("value_strength", &self.value_strength)
      .field("listener", &self.listener.is_some())
      .finish()
  }
}
