//! Iteration over a cache's live entries.

use crate::shared::CacheShared;

use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;
use std::vec;

/// An iterator over the live entries of a [`Cache`](crate::Cache).
///
/// Segments are visited one at a time: each is copied out under its shared
/// lock, which is released before the first of its entries is yielded. The
/// iteration is therefore not a point-in-time snapshot of the whole cache.
/// Writes to a segment that has already been visited are not seen, and an
/// entry removed after its segment was copied may still be yielded.
///
/// Expired entries and entries whose key or value was collected are skipped.
/// Iterating does not count as access for eviction or statistics.
pub struct Iter<'a, K, V, H> {
  shared: &'a CacheShared<K, V, H>,
  next_segment: usize,
  buffer: vec::IntoIter<(Arc<K>, Arc<V>)>,
}

impl<'a, K, V, H> Iter<'a, K, V, H> {
  pub(crate) fn new(shared: &'a CacheShared<K, V, H>) -> Self {
    Self {
      shared,
      next_segment: 0,
      buffer: Vec::new().into_iter(),
    }
  }
}

impl<K, V, H> fmt::Debug for Iter<'_, K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Iter")
      .field("next_segment", &self.next_segment)
      .field("buffered", &self.buffer.len())
      .finish()
  }
}

impl<K, V, H> Iterator for Iter<'_, K, V, H>
where
  K: Eq + Hash,
  H: BuildHasher,
{
  type Item = (Arc<K>, Arc<V>);

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      if let Some(item) = self.buffer.next() {
        return Some(item);
      }
      let segment = self.shared.store.segment_at(self.next_segment)?;
      self.next_segment += 1;
      self.buffer = segment.snapshot(self.shared.config.now()).into_iter();
    }
  }
}

/// An iterator over the keys of a [`Cache`](crate::Cache), with the same
/// consistency as [`Iter`].
#[derive(Debug)]
pub struct Keys<'a, K, V, H> {
  inner: Iter<'a, K, V, H>,
}

impl<'a, K, V, H> Keys<'a, K, V, H> {
  pub(crate) fn new(shared: &'a CacheShared<K, V, H>) -> Self {
    Self {
      inner: Iter::new(shared),
    }
  }
}

impl<K, V, H> Iterator for Keys<'_, K, V, H>
where
  K: Eq + Hash,
  H: BuildHasher,
{
  type Item = Arc<K>;

  fn next(&mut self) -> Option<Self::Item> {
    self.inner.next().map(|(key, _)| key)
  }
}

#[cfg(test)]
mod tests {
  use crate::CacheBuilder;
  use std::collections::HashSet;

  #[test]
  fn visits_every_segment() {
    let cache = CacheBuilder::<u32, u32>::new().concurrency_level(8).build().unwrap();
    for i in 0..200 {
      cache.insert(i, i * 2);
    }
    assert!(cache.segment_count() > 1);

    let mut seen = HashSet::new();
    for (key, value) in cache.iter() {
      assert_eq!(*value, *key * 2);
      assert!(seen.insert(*key), "key {key} yielded twice");
    }
    assert_eq!(seen.len(), 200);
    assert_eq!(cache.keys().count(), 200);
  }

  #[test]
  fn empty_cache_yields_nothing() {
    let cache = CacheBuilder::<u32, u32>::new().build().unwrap();
    assert!(cache.iter().next().is_none());
  }
}
