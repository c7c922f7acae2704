use crate::error::{BoxError, CacheError};
use crate::iter::{Iter, Keys};
use crate::metrics::CacheStats;
use crate::shared::CacheShared;

use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use equivalent::Equivalent;

/// A thread-safe, synchronous cache.
///
/// Values are handed out as `Arc<V>`, so `V` does not need to be `Clone`.
#[derive(Debug)]
pub struct Cache<K, V, H = ahash::RandomState> {
  pub(crate) shared: Arc<CacheShared<K, V, H>>,
}

impl<K, V, H> Clone for Cache<K, V, H> {
  fn clone(&self) -> Self {
    Self {
      shared: self.shared.clone(),
    }
  }
}

impl<K, V, H> Cache<K, V, H>
where
  K: Eq + Hash,
  H: BuildHasher,
{
  /// Returns the value for `key` if it is cached and live.
  ///
  /// Counts as a hit or a miss and marks the entry as recently used. A key
  /// that is still being loaded by another thread is a miss; this method never
  /// waits.
  pub fn get_if_present<Q>(&self, key: &Q) -> Option<Arc<V>>
  where
    Q: Hash + Equivalent<K> + ?Sized,
  {
    self.shared.get_if_present(key)
  }

  /// Returns the value for `key` without recording statistics or touching
  /// recency.
  pub fn peek<Q>(&self, key: &Q) -> Option<Arc<V>>
  where
    Q: Hash + Equivalent<K> + ?Sized,
  {
    self.shared.peek(key)
  }

  /// Returns `true` if a live value is cached for `key`.
  pub fn contains_key<Q>(&self, key: &Q) -> bool
  where
    Q: Hash + Equivalent<K> + ?Sized,
  {
    self.shared.peek(key).is_some()
  }

  /// Caches `value` under `key`, returning the value it replaced.
  ///
  /// A load in flight for the key is superseded: its waiters still receive the
  /// loaded value, but the cache keeps this one.
  ///
  /// The caller keeps no handle to the stored value or key. With weak values
  /// the value is therefore dropped right away, and with weak keys a new entry
  /// is not created at all; use [`insert_arc`](Cache::insert_arc) for those.
  pub fn insert(&self, key: K, value: V) -> Option<Arc<V>> {
    self.shared.insert(Arc::new(key), Arc::new(value), false)
  }

  /// Like [`insert`](Cache::insert), but the cache keeps the given key `Arc`.
  ///
  /// With weak keys this is how an entry is tied to the caller's key: it stays
  /// cached as long as some clone of `key` is alive.
  pub fn insert_shared(&self, key: Arc<K>, value: V) -> Option<Arc<V>> {
    self.shared.insert(key, Arc::new(value), false)
  }

  /// Caches the given `Arc`s as they are, returning the value replaced.
  ///
  /// This is the write for weak and soft references: the entry stays cached
  /// for as long as the caller holds `value` (weak values) and `key` (weak
  /// keys).
  pub fn insert_arc(&self, key: Arc<K>, value: Arc<V>) -> Option<Arc<V>> {
    self.shared.insert(key, value, false)
  }

  /// Caches `value` only if no live value exists. Returns the existing value
  /// when there is one, in which case nothing is written.
  pub fn insert_if_absent(&self, key: K, value: V) -> Option<Arc<V>> {
    self.shared.insert(Arc::new(key), Arc::new(value), true)
  }

  /// Replaces the value for `key` only if a live one is cached, returning it.
  /// An absent key stays absent.
  pub fn replace(&self, key: &K, value: V) -> Option<Arc<V>> {
    self.shared.replace(key, |_| true, Arc::new(value))
  }

  /// Replaces the value for `key` only if the cached value equals
  /// `expected`. Returns whether the value was replaced.
  pub fn replace_if(&self, key: &K, expected: &V, value: V) -> bool
  where
    V: PartialEq,
  {
    self
      .shared
      .replace(key, |current| current == expected, Arc::new(value))
      .is_some()
  }

  /// Removes the entry for `key`, returning its value.
  pub fn invalidate<Q>(&self, key: &Q) -> Option<Arc<V>>
  where
    Q: Hash + Equivalent<K> + ?Sized,
  {
    self.shared.invalidate(key)
  }

  /// Removes the entry for `key` only if its value equals `expected`.
  /// Returns whether it was removed.
  pub fn remove_if<Q>(&self, key: &Q, expected: &V) -> bool
  where
    Q: Hash + Equivalent<K> + ?Sized,
    V: PartialEq,
  {
    self.shared.remove_if(key, |current| current == expected).is_some()
  }

  /// Removes the entries for all of `keys`.
  pub fn invalidate_many<'a, Q, I>(&self, keys: I)
  where
    I: IntoIterator<Item = &'a Q>,
    Q: Hash + Equivalent<K> + ?Sized + 'a,
  {
    for key in keys {
      self.shared.invalidate(key);
    }
  }

  /// Removes every entry. Loads in flight are left to complete.
  pub fn invalidate_all(&self) {
    self.shared.invalidate_all();
  }

  /// Returns `true` if some key maps to a live value equal to `value`.
  ///
  /// Scans every segment, so it is slow for large caches.
  pub fn contains_value(&self, value: &V) -> bool
  where
    V: PartialEq,
  {
    self.shared.contains_value(|current| current == value)
  }

  /// Iterates over the live entries, one segment at a time.
  ///
  /// See [`Iter`] for the consistency guarantees.
  pub fn iter(&self) -> Iter<'_, K, V, H> {
    Iter::new(&self.shared)
  }

  /// Iterates over the keys of live entries.
  pub fn keys(&self) -> Keys<'_, K, V, H> {
    Keys::new(&self.shared)
  }

  /// The number of entries, including any that have expired or been
  /// collected but not yet cleaned up.
  pub fn len(&self) -> usize {
    self.shared.len()
  }

  pub fn is_empty(&self) -> bool {
    self.shared.is_empty()
  }

  /// The summed weight of all entries. Equals `len()` without a weigher.
  pub fn weighted_size(&self) -> u64 {
    self.shared.weighted_size()
  }

  /// A snapshot of the cache's counters.
  pub fn stats(&self) -> CacheStats {
    self.shared.stats()
  }

  /// Removes every expired or collected entry now and delivers pending
  /// removal notifications.
  ///
  /// The cache otherwise does this work piecemeal during reads and writes.
  pub fn clean_up(&self) {
    self.shared.clean_up();
  }

  /// Signals memory pressure: soft values stop being retained by the cache
  /// and those no longer used elsewhere are dropped.
  pub fn release_soft_values(&self) {
    self.shared.release_soft_values();
  }

  /// The number of independently locked segments.
  pub fn segment_count(&self) -> usize {
    self.shared.segment_count()
  }
}

impl<K, V, H> Cache<K, V, H>
where
  K: Eq + Hash + Clone,
  H: BuildHasher,
{
  /// Returns the cached value, computing it with `init` on a miss.
  ///
  /// Only one thread runs `init` for a given key at a time; others wait for
  /// its result. A panicking `init` releases the waiters with
  /// [`CacheError::LoaderPanicked`].
  ///
  /// With weak keys a miss gives [`CacheError::KeyNotRetained`], since no
  /// one would hold the key of the new entry.
  pub fn get_with<F>(&self, key: &K, init: F) -> Result<Arc<V>, CacheError>
  where
    F: FnOnce() -> V,
  {
    self
      .shared
      .get_or_load(key, || Arc::new(key.clone()), None, |_| Ok(Some(init())))
  }

  /// Like [`get_with`](Cache::get_with) with a fallible `init`. An error is
  /// returned to every waiter and nothing is cached.
  pub fn try_get_with<F, E>(&self, key: &K, init: F) -> Result<Arc<V>, CacheError>
  where
    F: FnOnce() -> Result<V, E>,
    E: Into<BoxError>,
  {
    self.shared.get_or_load(
      key,
      || Arc::new(key.clone()),
      None,
      |_| init().map(Some).map_err(Into::into),
    )
  }
}
