use crate::config::CacheConfig;
use crate::error::{BoxError, CacheError};
use crate::listener::RemovalNotification;
use crate::loader::{CacheLoader, LoadFuture};
use crate::metrics::{CacheStats, StatsCounter};
use crate::notification::RemovalQueue;
use crate::segment::{Claim, ClaimMode, Lookup, Pending, Segment};
use crate::store::SegmentedStore;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use equivalent::Equivalent;

/// Full passes `contains_value` makes before settling on a miss.
const CONTAINS_VALUE_SCANS: usize = 3;

/// A placeholder this thread installed and must resolve.
struct ClaimedLoad<K, V> {
  key: Arc<K>,
  hash: u64,
  future: Arc<LoadFuture<V>>,
}

/// The internal, thread-safe core of the cache.
pub(crate) struct CacheShared<K, V, H> {
  pub(crate) store: SegmentedStore<K, V, H>,
  pub(crate) config: Arc<CacheConfig<K, V>>,
  // Work not attributable to one segment, i.e. bulk loads.
  global_stats: StatsCounter,
  notifications: Option<RemovalQueue<K, V>>,
  loader: Option<Arc<dyn CacheLoader<K, V>>>,
}

impl<K, V, H> fmt::Debug for CacheShared<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheShared")
      .field("config", &self.config)
      .field("store", &self.store)
      .field("loader", &self.loader.is_some())
      .finish_non_exhaustive()
  }
}

impl<K, V, H> Drop for CacheShared<K, V, H> {
  fn drop(&mut self) {
    if let Some(queue) = &self.notifications {
      queue.drain();
    }
  }
}

impl<K, V, H> CacheShared<K, V, H>
where
  K: Eq + Hash,
  H: BuildHasher,
{
  pub(crate) fn new(
    config: CacheConfig<K, V>,
    hasher: H,
    loader: Option<Arc<dyn CacheLoader<K, V>>>,
  ) -> Self {
    let notifications = config.listener.clone().map(RemovalQueue::new);
    let config = Arc::new(config);
    Self {
      store: SegmentedStore::new(config.clone(), hasher),
      config,
      global_stats: StatsCounter::new(),
      notifications,
      loader,
    }
  }

  /// Hands notifications collected under a lock to the listener. Also
  /// delivers anything left behind by other threads.
  fn publish(&self, pending: Pending<K, V>) {
    let Some(queue) = &self.notifications else {
      return;
    };
    if pending.is_empty() {
      if queue.len() > 0 {
        queue.drain();
      }
    } else {
      queue.publish(pending);
    }
  }

  // --- Lookups ---

  pub(crate) fn get_if_present<Q>(&self, key: &Q) -> Option<Arc<V>>
  where
    Q: Hash + Equivalent<K> + ?Sized,
  {
    let hash = self.store.hash(key);
    let segment = self.store.segment_for(hash);
    let now = self.config.now();
    let mut pending = Vec::new();

    let (value, refresh) = match segment.read(hash, key, now) {
      Lookup::Hit { value, refresh } => {
        segment.stats().record_hits(1);
        (Some(value), refresh)
      }
      Lookup::Loading(_) | Lookup::Miss => {
        segment.stats().record_misses(1);
        (None, None)
      }
    };
    segment.post_read_cleanup(now, &mut pending);
    self.publish(pending);

    match (value, refresh) {
      (Some(stale), Some(key)) => Some(self.refresh_on_read(segment, hash, key).unwrap_or(stale)),
      (value, _) => value,
    }
  }

  pub(crate) fn peek<Q>(&self, key: &Q) -> Option<Arc<V>>
  where
    Q: Hash + Equivalent<K> + ?Sized,
  {
    let hash = self.store.hash(key);
    self.store.segment_for(hash).peek(hash, key, self.config.now())
  }

  /// Returns the cached value or computes it with `load`, making sure only
  /// one thread computes a given key at a time.
  pub(crate) fn get_or_load<M, F>(
    &self,
    key: &K,
    make_key: M,
    timeout: Option<Duration>,
    load: F,
  ) -> Result<Arc<V>, CacheError>
  where
    M: FnOnce() -> Arc<K>,
    F: FnOnce(&K) -> Result<Option<V>, BoxError>,
  {
    let hash = self.store.hash(key);
    let segment = self.store.segment_for(hash);
    let now = self.config.now();
    let mut pending = Vec::new();

    match segment.read(hash, key, now) {
      Lookup::Hit { value, refresh } => {
        segment.stats().record_hits(1);
        segment.post_read_cleanup(now, &mut pending);
        self.publish(pending);
        if let Some(stored_key) = refresh {
          return Ok(self.refresh_on_read(segment, hash, stored_key).unwrap_or(value));
        }
        return Ok(value);
      }
      Lookup::Loading(future) => {
        segment.stats().record_misses(1);
        segment.post_read_cleanup(now, &mut pending);
        self.publish(pending);
        return future.wait(timeout);
      }
      Lookup::Miss => {}
    }

    let owned_key = make_key();
    let claim = segment.claim(hash, &owned_key, ClaimMode::Get, now, &mut pending);
    self.publish(pending);
    match claim {
      Claim::Present(value) => {
        segment.stats().record_hits(1);
        Ok(value)
      }
      Claim::Wait(future) => {
        segment.stats().record_misses(1);
        future.wait(timeout)
      }
      Claim::Load { future, .. } => {
        segment.stats().record_misses(1);
        self.load_and_store(segment, hash, &owned_key, &future, || load(key))
      }
      Claim::KeyNotRetained => {
        segment.stats().record_misses(1);
        Err(CacheError::KeyNotRetained)
      }
    }
  }

  /// `get_or_load` with the configured loader.
  pub(crate) fn get_with_loader<M>(
    &self,
    key: &K,
    make_key: M,
    timeout: Option<Duration>,
  ) -> Result<Arc<V>, CacheError>
  where
    M: FnOnce() -> Arc<K>,
  {
    let Some(loader) = self.loader.clone() else {
      return Err(CacheError::NullValue);
    };
    self.get_or_load(key, make_key, timeout, |key| loader.load(key))
  }

  /// Runs a loader on this thread and resolves the claimed placeholder with
  /// its outcome. Panics are caught so waiters are always released.
  fn load_and_store<F>(
    &self,
    segment: &Segment<K, V>,
    hash: u64,
    key: &Arc<K>,
    future: &Arc<LoadFuture<V>>,
    load: F,
  ) -> Result<Arc<V>, CacheError>
  where
    F: FnOnce() -> Result<Option<V>, BoxError>,
  {
    let result = match panic::catch_unwind(AssertUnwindSafe(load)) {
      Ok(Ok(Some(value))) => Ok(value),
      Ok(Ok(None)) => Err(CacheError::NullValue),
      Ok(Err(err)) => Err(CacheError::load(err)),
      Err(_) => {
        tracing::warn!("cache loader panicked; waiters receive an error");
        Err(CacheError::LoaderPanicked)
      }
    };
    self.finish_load(segment, hash, key, future, result, true)
  }

  /// Stores or discards a load's result, then completes its future. The value
  /// is visible in the table before any waiter wakes up.
  fn finish_load(
    &self,
    segment: &Segment<K, V>,
    hash: u64,
    key: &Arc<K>,
    future: &Arc<LoadFuture<V>>,
    result: Result<V, CacheError>,
    record: bool,
  ) -> Result<Arc<V>, CacheError> {
    let now = self.config.now();
    let elapsed = now.saturating_sub(future.started_at());
    let mut pending = Vec::new();

    let weighed = result.and_then(|value| {
      let weight = self.config.weigh(key, &value)?;
      Ok((value, weight))
    });
    let outcome = match weighed {
      Ok((value, weight)) => {
        if record {
          segment.stats().record_load_success(elapsed);
        }
        let value = Arc::new(value);
        segment.store_loaded(hash, key, future, value.clone(), weight, now, &mut pending);
        Ok(value)
      }
      Err(err) => {
        if record {
          segment.stats().record_load_exception(elapsed);
        }
        tracing::debug!(error = %err, "load failed; entry reverted");
        segment.remove_loading(hash, key, future, now, &mut pending);
        Err(err)
      }
    };

    future.complete(outcome.clone());
    self.publish(pending);
    outcome
  }

  // --- Refresh ---

  /// Reloads `key`, keeping any current value readable meanwhile. Joins a
  /// load already in flight instead of starting another.
  pub(crate) fn refresh(&self, key: Arc<K>) -> Result<Arc<V>, CacheError> {
    let Some(loader) = self.loader.clone() else {
      return Err(CacheError::NullValue);
    };
    let hash = self.store.hash(key.as_ref());
    let segment = self.store.segment_for(hash);
    let now = self.config.now();
    let mut pending = Vec::new();

    let claim = segment.claim(hash, &key, ClaimMode::Refresh, now, &mut pending);
    self.publish(pending);
    match claim {
      Claim::Present(value) => Ok(value),
      Claim::Wait(future) => future.wait(None),
      Claim::Load { future, previous } => {
        self.load_and_store(segment, hash, &key, &future, || match &previous {
          Some(old) => loader.reload(&key, old),
          None => loader.load(&key),
        })
      }
      Claim::KeyNotRetained => Err(CacheError::KeyNotRetained),
    }
  }

  /// Refresh-after-write on the reading thread. Never waits on somebody else's
  /// refresh and never surfaces an error; the stale value stays in place.
  fn refresh_on_read(&self, segment: &Segment<K, V>, hash: u64, key: Arc<K>) -> Option<Arc<V>> {
    let loader = self.loader.clone()?;
    let now = self.config.now();
    let mut pending = Vec::new();
    let claim = segment.claim(hash, &key, ClaimMode::Refresh, now, &mut pending);
    self.publish(pending);

    let Claim::Load { future, previous } = claim else {
      return None;
    };
    let result = self.load_and_store(segment, hash, &key, &future, || match &previous {
      Some(old) => loader.reload(&key, old),
      None => loader.load(&key),
    });
    match result {
      Ok(value) => Some(value),
      Err(err) => {
        tracing::warn!(error = %err, "refresh after write failed; serving stale value");
        None
      }
    }
  }

  // --- Writes ---

  pub(crate) fn insert(&self, key: Arc<K>, value: Arc<V>, only_if_absent: bool) -> Option<Arc<V>> {
    let weight = self.config.weight_of(&key, &value);
    let hash = self.store.hash(key.as_ref());
    let segment = self.store.segment_for(hash);
    let mut pending = Vec::new();
    let previous = segment.put(
      hash,
      key,
      value,
      weight,
      only_if_absent,
      self.config.now(),
      &mut pending,
    );
    self.publish(pending);
    previous
  }

  /// Replaces a live value accepted by `matches`; absent keys stay absent.
  pub(crate) fn replace<F>(&self, key: &K, matches: F, value: Arc<V>) -> Option<Arc<V>>
  where
    F: FnOnce(&V) -> bool,
  {
    let weight = self.config.weight_of(key, &value);
    let hash = self.store.hash(key);
    let segment = self.store.segment_for(hash);
    let mut pending = Vec::new();
    let now = self.config.now();
    let previous = segment.replace(hash, key, matches, value, weight, now, &mut pending);
    self.publish(pending);
    previous
  }

  pub(crate) fn remove_if<Q, F>(&self, key: &Q, matches: F) -> Option<Arc<V>>
  where
    Q: Hash + Equivalent<K> + ?Sized,
    F: FnOnce(&V) -> bool,
  {
    let hash = self.store.hash(key);
    let mut pending = Vec::new();
    let removed = self
      .store
      .segment_for(hash)
      .remove_if(hash, key, matches, self.config.now(), &mut pending);
    self.publish(pending);
    removed
  }

  pub(crate) fn invalidate<Q>(&self, key: &Q) -> Option<Arc<V>>
  where
    Q: Hash + Equivalent<K> + ?Sized,
  {
    let hash = self.store.hash(key);
    let mut pending = Vec::new();
    let removed = self
      .store
      .segment_for(hash)
      .remove(hash, key, self.config.now(), &mut pending);
    self.publish(pending);
    removed
  }

  pub(crate) fn invalidate_all(&self) {
    for segment in self.store.segments() {
      let mut pending = Vec::new();
      segment.clear(&mut pending);
      self.publish(pending);
    }
  }

  // --- Introspection and maintenance ---

  pub(crate) fn len(&self) -> usize {
    self.store.segments().map(Segment::len).sum()
  }

  /// Checks every segment twice, using modification counts to rule out an
  /// entry having moved between segments mid-scan.
  pub(crate) fn is_empty(&self) -> bool {
    let mut sum = 0u64;
    for segment in self.store.segments() {
      if segment.len() != 0 {
        return false;
      }
      sum = sum.wrapping_add(segment.mod_count());
    }
    if sum != 0 {
      for segment in self.store.segments() {
        if segment.len() != 0 {
          return false;
        }
        sum = sum.wrapping_sub(segment.mod_count());
      }
      return sum == 0;
    }
    true
  }

  /// Scans the segments for a live value accepted by `matches`. A miss is
  /// only trusted once two full scans saw the same modification counts.
  pub(crate) fn contains_value<F>(&self, mut matches: F) -> bool
  where
    F: FnMut(&V) -> bool,
  {
    let mut last = None;
    for _ in 0..CONTAINS_VALUE_SCANS {
      let now = self.config.now();
      let mut sum = 0u64;
      for segment in self.store.segments() {
        if segment.contains_value(now, &mut matches) {
          return true;
        }
        sum = sum.wrapping_add(segment.mod_count());
      }
      if last == Some(sum) {
        break;
      }
      last = Some(sum);
    }
    false
  }

  pub(crate) fn weighted_size(&self) -> u64 {
    self.store.segments().map(Segment::weighted_size).sum()
  }

  pub(crate) fn stats(&self) -> CacheStats {
    self
      .store
      .segments()
      .fold(self.global_stats.snapshot(), |acc, segment| acc.plus(&segment.stats().snapshot()))
  }

  pub(crate) fn clean_up(&self) {
    let now = self.config.now();
    for segment in self.store.segments() {
      let mut pending = Vec::new();
      segment.clean_up(now, &mut pending);
      self.publish(pending);
    }
    if let Some(queue) = &self.notifications {
      queue.drain();
    }
  }

  pub(crate) fn release_soft_values(&self) {
    for segment in self.store.segments() {
      let mut pending = Vec::new();
      segment.release_soft_values(&mut pending);
      self.publish(pending);
    }
  }

  pub(crate) fn segment_count(&self) -> usize {
    self.store.segment_count()
  }
}

impl<K, V, H> CacheShared<K, V, H>
where
  K: Eq + Hash + Clone,
  H: BuildHasher,
{
  /// Loads every key not already present, sharing in-flight loads with other
  /// threads. Claimed keys go to `load_all` when the loader supports it and
  /// to individual loads otherwise.
  ///
  /// Each key may come with the `Arc` a new entry should keep; otherwise one
  /// is made from a clone.
  pub(crate) fn get_all<'a, I>(&self, keys: I) -> Result<HashMap<K, Arc<V>>, CacheError>
  where
    I: IntoIterator<Item = (&'a K, Option<&'a Arc<K>>)>,
    K: 'a,
  {
    let mut found = HashMap::new();
    let mut seen = HashSet::new();
    let mut waits: Vec<(K, Arc<LoadFuture<V>>)> = Vec::new();
    let mut claimed: Vec<ClaimedLoad<K, V>> = Vec::new();
    let mut failure = None;

    for (key, shared_key) in keys {
      if !seen.insert(key.clone()) {
        continue;
      }
      let hash = self.store.hash(key);
      let segment = self.store.segment_for(hash);
      let now = self.config.now();
      let mut pending = Vec::new();

      match segment.read(hash, key, now) {
        Lookup::Hit { value, refresh } => {
          segment.stats().record_hits(1);
          let value = match refresh {
            Some(stored_key) => self.refresh_on_read(segment, hash, stored_key).unwrap_or(value),
            None => value,
          };
          found.insert(key.clone(), value);
        }
        Lookup::Loading(future) => {
          segment.stats().record_misses(1);
          waits.push((key.clone(), future));
        }
        Lookup::Miss => {
          let owned_key = match shared_key {
            Some(shared_key) => shared_key.clone(),
            None => Arc::new(key.clone()),
          };
          match segment.claim(hash, &owned_key, ClaimMode::Get, now, &mut pending) {
            Claim::Present(value) => {
              segment.stats().record_hits(1);
              found.insert(key.clone(), value);
            }
            Claim::Wait(future) => {
              segment.stats().record_misses(1);
              waits.push((key.clone(), future));
            }
            Claim::Load { future, .. } => {
              segment.stats().record_misses(1);
              claimed.push(ClaimedLoad {
                key: owned_key,
                hash,
                future,
              });
            }
            Claim::KeyNotRetained => {
              segment.stats().record_misses(1);
              failure.get_or_insert(CacheError::KeyNotRetained);
            }
          }
        }
      }
      self.publish(pending);
    }

    if !claimed.is_empty() {
      self.load_claimed(claimed, &mut found, &mut failure);
    }
    for (key, future) in waits {
      match future.wait(None) {
        Ok(value) => {
          found.insert(key, value);
        }
        Err(err) => {
          failure.get_or_insert(err);
        }
      }
    }

    match failure {
      Some(err) => Err(err),
      None => Ok(found),
    }
  }

  fn load_claimed(
    &self,
    claimed: Vec<ClaimedLoad<K, V>>,
    found: &mut HashMap<K, Arc<V>>,
    failure: &mut Option<CacheError>,
  ) {
    let Some(loader) = self.loader.clone() else {
      for claim in claimed {
        self.fail_claim(&claim, CacheError::NullValue);
      }
      failure.get_or_insert(CacheError::NullValue);
      return;
    };

    let keys: Vec<K> = claimed.iter().map(|c| c.key.as_ref().clone()).collect();
    let started = self.config.now();
    let bulk = panic::catch_unwind(AssertUnwindSafe(|| loader.load_all(&keys)));
    let elapsed = self.config.now().saturating_sub(started);

    let mut loaded = match bulk {
      Ok(None) => {
        // Bulk loading is not supported; load one by one.
        self.load_individually(&loader, claimed, found, failure);
        return;
      }
      Ok(Some(Ok(map))) => {
        self.global_stats.record_load_success(elapsed);
        map
      }
      Ok(Some(Err(err))) => {
        self.global_stats.record_load_exception(elapsed);
        let err = CacheError::load(err);
        tracing::debug!(error = %err, keys = claimed.len(), "bulk load failed");
        for claim in &claimed {
          self.fail_claim(claim, err.clone());
        }
        failure.get_or_insert(err);
        return;
      }
      Err(_) => {
        self.global_stats.record_load_exception(elapsed);
        tracing::warn!("bulk loader panicked; waiters receive an error");
        for claim in &claimed {
          self.fail_claim(claim, CacheError::LoaderPanicked);
        }
        failure.get_or_insert(CacheError::LoaderPanicked);
        return;
      }
    };

    let mut missing = Vec::new();
    for claim in claimed {
      match loaded.remove(claim.key.as_ref()) {
        Some(value) => {
          let segment = self.store.segment_for(claim.hash);
          match self.finish_load(segment, claim.hash, &claim.key, &claim.future, Ok(value), false) {
            Ok(value) => {
              found.insert(claim.key.as_ref().clone(), value);
            }
            Err(err) => {
              failure.get_or_insert(err);
            }
          }
        }
        None => missing.push(claim),
      }
    }

    // Extra keys the loader volunteered are cached as plain writes.
    for (key, value) in loaded {
      self.insert(Arc::new(key), Arc::new(value), false);
    }

    if !missing.is_empty() {
      self.load_individually(&loader, missing, found, failure);
    }
  }

  fn load_individually(
    &self,
    loader: &Arc<dyn CacheLoader<K, V>>,
    claimed: Vec<ClaimedLoad<K, V>>,
    found: &mut HashMap<K, Arc<V>>,
    failure: &mut Option<CacheError>,
  ) {
    for claim in claimed {
      let segment = self.store.segment_for(claim.hash);
      let key = claim.key.clone();
      let loaded =
        self.load_and_store(segment, claim.hash, &claim.key, &claim.future, || loader.load(&key));
      match loaded {
        Ok(value) => {
          found.insert(claim.key.as_ref().clone(), value);
        }
        Err(err) => {
          failure.get_or_insert(err);
        }
      }
    }
  }

  fn fail_claim(&self, claim: &ClaimedLoad<K, V>, err: CacheError) {
    let segment = self.store.segment_for(claim.hash);
    let mut pending = Vec::new();
    let now = self.config.now();
    segment.remove_loading(claim.hash, &claim.key, &claim.future, now, &mut pending);
    claim.future.complete(Err(err));
    self.publish(pending);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::listener::RemovalCause;
  use crate::reference::{KeyStrength, ValueStrength};
  use crate::time::ManualTicker;
  use parking_lot::Mutex;

  fn shared(
    loader: Option<Arc<dyn CacheLoader<u32, u32>>>,
    causes: Arc<Mutex<Vec<RemovalCause>>>,
  ) -> CacheShared<u32, u32, ahash::RandomState> {
    let config = CacheConfig {
      initial_capacity: 16,
      concurrency_level: 4,
      maximum_weight: None,
      weigher: None,
      expire_after_write: None,
      expire_after_access: None,
      refresh_after_write: None,
      key_strength: KeyStrength::Strong,
      value_strength: ValueStrength::Strong,
      ticker: Arc::new(ManualTicker::new()),
      listener: Some(Arc::new(move |n: RemovalNotification<u32, u32>| {
        causes.lock().push(n.cause());
      })),
    };
    CacheShared::new(config, ahash::RandomState::new(), loader)
  }

  #[test]
  fn notifications_are_delivered_after_each_operation() {
    let causes = Arc::new(Mutex::new(Vec::new()));
    let cache = shared(None, causes.clone());
    cache.insert(Arc::new(1), Arc::new(1), false);
    cache.insert(Arc::new(1), Arc::new(2), false);
    cache.invalidate(&1);
    assert_eq!(*causes.lock(), vec![RemovalCause::Replaced, RemovalCause::Explicit]);
    assert_eq!(cache.notifications.as_ref().map_or(0, RemovalQueue::len), 0);
  }

  #[test]
  fn empty_check_uses_mod_counts() {
    let causes = Arc::new(Mutex::new(Vec::new()));
    let cache = shared(None, causes);
    assert!(cache.is_empty());
    cache.insert(Arc::new(7), Arc::new(7), false);
    assert!(!cache.is_empty());
    cache.invalidate(&7);
    assert!(cache.is_empty());
    assert_eq!(cache.len(), 0);
  }

  #[test]
  fn missing_bulk_keys_fall_back_to_single_loads() {
    struct Partial;
    impl CacheLoader<u32, u32> for Partial {
      fn load(&self, key: &u32) -> Result<Option<u32>, BoxError> {
        Ok(Some(key + 1000))
      }
      fn load_all(&self, keys: &[u32]) -> Option<Result<HashMap<u32, u32>, BoxError>> {
        let mut map: HashMap<u32, u32> =
          keys.iter().filter(|k| **k % 2 == 0).map(|k| (*k, *k)).collect();
        map.insert(99, 99);
        Some(Ok(map))
      }
    }

    let causes = Arc::new(Mutex::new(Vec::new()));
    let cache = shared(Some(Arc::new(Partial)), causes);
    let keys = [1, 2, 3, 4];
    let result = cache.get_all(keys.iter().map(|k| (k, None))).unwrap();
    assert_eq!(result[&2], Arc::new(2));
    assert_eq!(result[&4], Arc::new(4));
    assert_eq!(result[&1], Arc::new(1001));
    assert_eq!(result[&3], Arc::new(1003));
    assert_eq!(cache.peek(&99).map(|v| *v), Some(99), "extra keys are cached");

    let stats = cache.stats();
    assert_eq!(stats.miss_count, 4);
    assert_eq!(stats.load_success_count, 3, "one bulk load plus two single loads");
  }
}
