use crate::config::MAXIMUM_CAPACITY;
use crate::entry::{Entry, Order};
use crate::reference::KeyMatch;

use equivalent::Equivalent;
use generational_arena::{Arena, Index};
use std::ops::{Index as IndexOp, IndexMut};

/// A segment's storage: a chained hash table plus the access and write queues
/// threaded through the same entries.
///
/// Entries live in a generational arena, so an `Index` held by a lock-free
/// buffer goes stale instead of pointing at a recycled slot. Queue heads are
/// the most recent end; tails are the eviction and expiration end.
pub(crate) struct Table<K, V> {
  entries: Arena<Entry<K, V>>,
  buckets: Vec<Option<Index>>,
  // Resize once the number of entries reaches this. Always 3/4 of the bucket count.
  threshold: usize,
  heads: [Option<Index>; 2],
  tails: [Option<Index>; 2],
}

impl<K, V> Table<K, V> {
  pub(crate) fn with_capacity(capacity: usize) -> Self {
    let buckets = capacity.clamp(1, MAXIMUM_CAPACITY).next_power_of_two();
    Self {
      entries: Arena::with_capacity(buckets),
      buckets: vec![None; buckets],
      threshold: buckets * 3 / 4,
      heads: [None; 2],
      tails: [None; 2],
    }
  }

  /// Number of entries in the table, placeholders included.
  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.entries.len()
  }

  #[inline]
  pub(crate) fn bucket_count(&self) -> usize {
    self.buckets.len()
  }

  #[inline]
  fn bucket_of(&self, hash: u64) -> usize {
    (hash as usize) & (self.buckets.len() - 1)
  }

  #[inline]
  pub(crate) fn get(&self, index: Index) -> Option<&Entry<K, V>> {
    self.entries.get(index)
  }

  #[inline]
  pub(crate) fn get_mut(&mut self, index: Index) -> Option<&mut Entry<K, V>> {
    self.entries.get_mut(index)
  }

  /// Walks the bucket chain for `key`. Entries whose weak key has been
  /// dropped are skipped and reported through `on_cleared`.
  pub(crate) fn find<Q, F>(&self, hash: u64, key: &Q, mut on_cleared: F) -> Option<Index>
  where
    Q: Equivalent<K> + ?Sized,
    F: FnMut(Index, &Entry<K, V>),
  {
    let mut cursor = self.buckets[self.bucket_of(hash)];
    while let Some(index) = cursor {
      let entry = &self.entries[index];
      if entry.hash == hash {
        match entry.key.matches(key) {
          KeyMatch::Match => return Some(index),
          KeyMatch::Cleared => on_cleared(index, entry),
          KeyMatch::NoMatch => {}
        }
      }
      cursor = entry.next;
    }
    None
  }

  /// Adds an entry to its bucket, growing the table first if needed. The
  /// entry is not linked into the queues.
  pub(crate) fn insert(&mut self, mut entry: Entry<K, V>) -> Index {
    if self.entries.len() >= self.threshold {
      self.expand();
    }
    let bucket = self.bucket_of(entry.hash);
    entry.next = self.buckets[bucket];
    let index = self.entries.insert(entry);
    self.buckets[bucket] = Some(index);
    index
  }

  /// Doubles the bucket array and rehashes every chain into it. Entries stay
  /// where they are in the arena and in both queues.
  pub(crate) fn expand(&mut self) {
    let old_len = self.buckets.len();
    if old_len >= MAXIMUM_CAPACITY {
      return;
    }
    let new_len = old_len * 2;
    let old = std::mem::replace(&mut self.buckets, vec![None; new_len]);
    self.threshold = new_len * 3 / 4;

    for head in old {
      let mut cursor = head;
      while let Some(index) = cursor {
        let entry = &mut self.entries[index];
        cursor = entry.next;
        let bucket = (entry.hash as usize) & (new_len - 1);
        entry.next = self.buckets[bucket];
        self.buckets[bucket] = Some(index);
      }
    }
    tracing::trace!(buckets = new_len, entries = self.entries.len(), "segment table expanded");
  }

  fn unlink_chain(&mut self, index: Index) {
    let (bucket, next) = {
      let entry = &self.entries[index];
      (self.bucket_of(entry.hash), entry.next)
    };
    if self.buckets[bucket] == Some(index) {
      self.buckets[bucket] = next;
      return;
    }
    let mut cursor = self.buckets[bucket];
    while let Some(current) = cursor {
      let entry = &mut self.entries[current];
      if entry.next == Some(index) {
        entry.next = next;
        return;
      }
      cursor = entry.next;
    }
    debug_assert!(false, "entry missing from its bucket chain");
  }

  /// Removes an entry from the bucket chain, both queues, and the arena.
  pub(crate) fn remove(&mut self, index: Index) -> Option<Entry<K, V>> {
    if !self.entries.contains(index) {
      return None;
    }
    self.unlink_queues(index);
    self.unlink_chain(index);
    self.entries.remove(index)
  }

  // --- Queue maintenance ---

  pub(crate) fn head(&self, order: Order) -> Option<Index> {
    self.heads[order as usize]
  }

  pub(crate) fn tail(&self, order: Order) -> Option<Index> {
    self.tails[order as usize]
  }

  /// The neighbour one step closer to the head.
  pub(crate) fn newer(&self, order: Order, index: Index) -> Option<Index> {
    self.entries.get(index).and_then(|e| e.links(order).prev)
  }

  fn push_front(&mut self, order: Order, index: Index) {
    let old_head = self.heads[order as usize];
    {
      let links = self.entries[index].links_mut(order);
      links.prev = None;
      links.next = old_head;
    }
    match old_head {
      Some(head) => self.entries[head].links_mut(order).prev = Some(index),
      None => self.tails[order as usize] = Some(index),
    }
    self.heads[order as usize] = Some(index);
  }

  fn detach(&mut self, order: Order, index: Index) {
    let links = *self.entries[index].links(order);
    match links.prev {
      Some(prev) => self.entries[prev].links_mut(order).next = links.next,
      None => self.heads[order as usize] = links.next,
    }
    match links.next {
      Some(next) => self.entries[next].links_mut(order).prev = links.prev,
      None => self.tails[order as usize] = links.prev,
    }
    *self.entries[index].links_mut(order) = Default::default();
  }

  /// Puts an unlinked entry at the head of both queues.
  pub(crate) fn link(&mut self, index: Index) {
    debug_assert!(!self.entries[index].linked);
    for order in Order::ALL {
      self.push_front(order, index);
    }
    self.entries[index].linked = true;
  }

  pub(crate) fn unlink_queues(&mut self, index: Index) {
    if !self.entries[index].linked {
      return;
    }
    for order in Order::ALL {
      self.detach(order, index);
    }
    self.entries[index].linked = false;
  }

  /// Moves a linked entry to the head of one queue.
  pub(crate) fn move_to_front(&mut self, order: Order, index: Index) {
    match self.entries.get(index) {
      Some(entry) if entry.linked => {}
      _ => return,
    }
    if self.heads[order as usize] != Some(index) {
      self.detach(order, index);
      self.push_front(order, index);
    }
  }

  /// Removes every entry, keeping the bucket array at its current size.
  pub(crate) fn clear(&mut self) {
    self.entries.clear();
    self.buckets.iter_mut().for_each(|b| *b = None);
    self.heads = [None; 2];
    self.tails = [None; 2];
  }

  pub(crate) fn iter(&self) -> impl Iterator<Item = (Index, &Entry<K, V>)> {
    self.entries.iter()
  }

  pub(crate) fn indices(&self) -> Vec<Index> {
    self.entries.iter().map(|(index, _)| index).collect()
  }

  /// Queue contents from head to tail.
  #[cfg(test)]
  pub(crate) fn order(&self, order: Order) -> Vec<Index> {
    let mut out = Vec::new();
    let mut cursor = self.heads[order as usize];
    while let Some(index) = cursor {
      out.push(index);
      cursor = self.entries[index].links(order).next;
    }
    out
  }
}

impl<K, V> IndexOp<Index> for Table<K, V> {
  type Output = Entry<K, V>;

  fn index(&self, index: Index) -> &Entry<K, V> {
    &self.entries[index]
  }
}

impl<K, V> IndexMut<Index> for Table<K, V> {
  fn index_mut(&mut self, index: Index) -> &mut Entry<K, V> {
    &mut self.entries[index]
  }
}
