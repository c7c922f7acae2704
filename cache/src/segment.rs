use crate::config::CacheConfig;
use crate::entry::{Entry, Order};
use crate::listener::{RemovalCause, RemovalNotification};
use crate::loader::LoadFuture;
use crate::metrics::StatsCounter;
use crate::reference::{KeyReference, ValueReference};
use crate::table::Table;

use crossbeam_queue::ArrayQueue;
use equivalent::Equivalent;
use generational_arena::Index;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Reads recorded between two replays into the access queue.
const RECENCY_CAPACITY: usize = 256;
/// Cleared entries waiting to be unlinked.
const RECLAIM_CAPACITY: usize = 256;
/// Maximum number of reclaimed entries processed per locked operation.
const DRAIN_MAX: usize = 16;
/// A read-triggered cleanup is attempted every `DRAIN_THRESHOLD + 1` reads.
const DRAIN_THRESHOLD: u32 = 0x3F;

/// Notifications produced under the lock, published after it is released.
pub(crate) type Pending<K, V> = Vec<RemovalNotification<K, V>>;

/// Outcome of a lookup on the shared-lock fast path.
pub(crate) enum Lookup<K, V> {
  /// `refresh` carries the stored key when the value is due for a refresh.
  Hit { value: Arc<V>, refresh: Option<Arc<K>> },
  Loading(Arc<LoadFuture<V>>),
  Miss,
}

/// Outcome of trying to become the loader for a key.
pub(crate) enum Claim<V> {
  /// A live value appeared since the fast path looked.
  Present(Arc<V>),
  /// Somebody else is loading; wait on their future.
  Wait(Arc<LoadFuture<V>>),
  /// The caller now owns the load. `previous` is the value being refreshed.
  Load {
    future: Arc<LoadFuture<V>>,
    previous: Option<Arc<V>>,
  },
  /// No entry exists and a weak key nobody holds cannot start one.
  KeyNotRetained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClaimMode {
  /// Load only if there is no live value.
  Get,
  /// Load even over a live value, which stays readable meanwhile.
  Refresh,
}

struct SegmentState<K, V> {
  table: Table<K, V>,
  // Live (linked) entries.
  count: usize,
  // Sum of the weights of live entries.
  total_weight: u64,
  mod_count: u64,
}

/// One independently locked partition of the cache.
///
/// Every structural change happens under the exclusive lock. Readers take the
/// shared lock and record their access in lock-free buffers which the next
/// writer replays. Expiration and size eviction are piggybacked on writes
/// (and on every 64th read); nothing runs in the background.
pub(crate) struct Segment<K, V> {
  state: RwLock<SegmentState<K, V>>,
  count: AtomicUsize,
  weight: AtomicU64,
  mod_count: AtomicU64,
  max_weight: Option<u64>,
  recency: ArrayQueue<Index>,
  recency_overflow: AtomicBool,
  reclaim: ArrayQueue<Index>,
  reclaim_overflow: AtomicBool,
  reads: AtomicU32,
  stats: StatsCounter,
  config: Arc<CacheConfig<K, V>>,
}

impl<K, V> fmt::Debug for Segment<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Segment")
      .field("count", &self.len())
      .field("weight", &self.weighted_size())
      .field("max_weight", &self.max_weight)
      .finish()
  }
}

impl<K, V> Segment<K, V> {
  pub(crate) fn new(
    config: Arc<CacheConfig<K, V>>,
    initial_capacity: usize,
    max_weight: Option<u64>,
  ) -> Self {
    Self {
      state: RwLock::new(SegmentState {
        table: Table::with_capacity(initial_capacity),
        count: 0,
        total_weight: 0,
        mod_count: 0,
      }),
      count: AtomicUsize::new(0),
      weight: AtomicU64::new(0),
      mod_count: AtomicU64::new(0),
      max_weight,
      recency: ArrayQueue::new(RECENCY_CAPACITY),
      recency_overflow: AtomicBool::new(false),
      reclaim: ArrayQueue::new(RECLAIM_CAPACITY),
      reclaim_overflow: AtomicBool::new(false),
      reads: AtomicU32::new(0),
      stats: StatsCounter::new(),
      config,
    }
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.count.load(Ordering::Acquire)
  }

  #[inline]
  pub(crate) fn weighted_size(&self) -> u64 {
    self.weight.load(Ordering::Acquire)
  }

  #[inline]
  pub(crate) fn mod_count(&self) -> u64 {
    self.mod_count.load(Ordering::Acquire)
  }

  #[inline]
  pub(crate) fn max_weight(&self) -> Option<u64> {
    self.max_weight
  }

  #[inline]
  pub(crate) fn stats(&self) -> &StatsCounter {
    &self.stats
  }

  // --- Read path (shared lock) ---

  /// Looks a key up under the shared lock. A hit records the access without
  /// touching the queues.
  pub(crate) fn read<Q>(&self, hash: u64, key: &Q, now: u64) -> Lookup<K, V>
  where
    Q: Equivalent<K> + ?Sized,
  {
    let state = self.state.read();
    let Some(index) = state.table.find(hash, key, |i, e| self.enqueue_reclaim(i, e)) else {
      return Lookup::Miss;
    };
    let entry = &state.table[index];
    match entry.value.get() {
      Some(value) => {
        if self.config.is_expired(entry, now) {
          return Lookup::Miss;
        }
        entry.set_access_time(now);
        self.record_recency(index);
        let refresh = if self.config.needs_refresh(entry, now) {
          entry.key.get()
        } else {
          None
        };
        Lookup::Hit { value, refresh }
      }
      None => match entry.value.loading_future() {
        Some(future) if !entry.value.is_active() => Lookup::Loading(future.clone()),
        _ => {
          if entry.is_collected() {
            self.enqueue_reclaim(index, entry);
          }
          Lookup::Miss
        }
      },
    }
  }

  /// Reads a live value without recording the access.
  pub(crate) fn peek<Q>(&self, hash: u64, key: &Q, now: u64) -> Option<Arc<V>>
  where
    Q: Equivalent<K> + ?Sized,
  {
    let state = self.state.read();
    let index = state.table.find(hash, key, |i, e| self.enqueue_reclaim(i, e))?;
    let entry = &state.table[index];
    if self.config.is_expired(entry, now) {
      return None;
    }
    entry.value.get()
  }

  /// Runs a non-blocking cleanup every so many reads, or when the recency
  /// buffer overflowed.
  pub(crate) fn post_read_cleanup(&self, now: u64, pending: &mut Pending<K, V>) {
    let reads = self.reads.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    if reads & DRAIN_THRESHOLD != 0 && !self.recency_overflow.load(Ordering::Relaxed) {
      return;
    }
    if let Some(mut state) = self.state.try_write() {
      self.reads.store(0, Ordering::Relaxed);
      self.run_locked_cleanup(&mut state, now, pending);
      self.publish(&state);
    }
  }

  fn record_recency(&self, index: Index) {
    if self.recency.push(index).is_err() {
      self.recency_overflow.store(true, Ordering::Relaxed);
    }
  }

  fn enqueue_reclaim(&self, index: Index, entry: &Entry<K, V>) {
    if !entry.mark_reclaim_queued() {
      return;
    }
    if self.reclaim.push(index).is_err() {
      self.reclaim_overflow.store(true, Ordering::Relaxed);
    }
  }

  /// Copies out the live entries under the shared lock.
  pub(crate) fn snapshot(&self, now: u64) -> Vec<(Arc<K>, Arc<V>)> {
    let state = self.state.read();
    let mut live = Vec::with_capacity(state.count);
    for (_, entry) in state.table.iter() {
      if !entry.linked || self.config.is_expired(entry, now) {
        continue;
      }
      if let (Some(key), Some(value)) = (entry.key.get(), entry.value.get()) {
        live.push((key, value));
      }
    }
    live
  }

  pub(crate) fn contains_value<F>(&self, now: u64, mut matches: F) -> bool
  where
    F: FnMut(&V) -> bool,
  {
    let state = self.state.read();
    let found = state.table.iter().any(|(_, entry)| {
      entry.linked
        && !self.config.is_expired(entry, now)
        && entry.value.get().is_some_and(|value| matches(&value))
    });
    found
  }

  // --- Locked maintenance ---

  fn publish(&self, state: &SegmentState<K, V>) {
    self.count.store(state.count, Ordering::Release);
    self.weight.store(state.total_weight, Ordering::Release);
    self.mod_count.store(state.mod_count, Ordering::Release);
  }

  fn notify(
    &self,
    pending: &mut Pending<K, V>,
    key: Option<Arc<K>>,
    value: Option<Arc<V>>,
    cause: RemovalCause,
  ) {
    if self.config.notifies() {
      pending.push(RemovalNotification::new(key, value, cause));
    }
  }

  fn run_locked_cleanup(
    &self,
    state: &mut SegmentState<K, V>,
    now: u64,
    pending: &mut Pending<K, V>,
  ) {
    self.drain_reclaim(state, pending);
    self.expire_entries(state, now, pending);
  }

  fn drain_reclaim(&self, state: &mut SegmentState<K, V>, pending: &mut Pending<K, V>) {
    if self.reclaim_overflow.swap(false, Ordering::AcqRel) {
      while self.reclaim.pop().is_some() {}
      self.sweep_collected(state, pending);
      return;
    }
    for _ in 0..DRAIN_MAX {
      let Some(index) = self.reclaim.pop() else {
        break;
      };
      match state.table.get(index) {
        Some(entry) if entry.is_collected() => {
          self.remove_entry(state, index, RemovalCause::Collected, pending);
        }
        Some(entry) => entry.clear_reclaim_queued(),
        None => {}
      }
    }
  }

  fn sweep_collected(&self, state: &mut SegmentState<K, V>, pending: &mut Pending<K, V>) {
    for index in state.table.indices() {
      if state.table[index].is_collected() {
        self.remove_entry(state, index, RemovalCause::Collected, pending);
      }
    }
  }

  fn drain_recency(&self, state: &mut SegmentState<K, V>) {
    self.recency_overflow.store(false, Ordering::Relaxed);
    while let Some(index) = self.recency.pop() {
      state.table.move_to_front(Order::Access, index);
    }
  }

  /// Removes expired entries from the old end of both queues, stopping at the
  /// first entry that is still fresh.
  fn expire_entries(&self, state: &mut SegmentState<K, V>, now: u64, pending: &mut Pending<K, V>) {
    self.drain_recency(state);
    if !self.config.expires() {
      return;
    }
    for order in Order::ALL {
      while let Some(index) = state.table.tail(order) {
        if !self.config.is_expired(&state.table[index], now) {
          break;
        }
        self.remove_entry(state, index, RemovalCause::Expired, pending);
      }
    }
  }

  /// Brings the segment back within its share of the bound.
  fn evict_entries(
    &self,
    state: &mut SegmentState<K, V>,
    newest: Option<Index>,
    pending: &mut Pending<K, V>,
  ) {
    let Some(max) = self.max_weight else {
      return;
    };
    self.drain_recency(state);

    if let Some(index) = newest {
      if state.table.get(index).is_some_and(|e| e.linked && e.weight > max) {
        self.remove_entry(state, index, RemovalCause::Size, pending);
      }
    }

    while state.total_weight > max {
      let Some(victim) = Self::next_victim(&state.table) else {
        break;
      };
      self.remove_entry(state, victim, RemovalCause::Size, pending);
    }
  }

  /// The least recently used entry that actually carries weight.
  fn next_victim(table: &Table<K, V>) -> Option<Index> {
    let mut cursor = table.tail(Order::Access);
    while let Some(index) = cursor {
      if table[index].weight > 0 {
        return Some(index);
      }
      cursor = table.newer(Order::Access, index);
    }
    None
  }

  /// Unlinks an entry from every structure. Live entries are reported to the
  /// listener; first-load placeholders leave silently.
  fn remove_entry(
    &self,
    state: &mut SegmentState<K, V>,
    index: Index,
    cause: RemovalCause,
    pending: &mut Pending<K, V>,
  ) -> Option<Arc<V>> {
    let linked = state.table.get(index)?.linked;
    let entry = state.table.remove(index)?;
    state.mod_count += 1;
    if !linked {
      return None;
    }

    state.count -= 1;
    state.total_weight = state.total_weight.saturating_sub(entry.weight);
    if cause.was_evicted() {
      self.stats.record_eviction();
    }
    if cause == RemovalCause::Size {
      tracing::trace!(weight = entry.weight, "evicted entry to stay within segment bound");
    }
    let value = entry.value.get();
    self.notify(pending, entry.key.get(), value.clone(), cause);
    value
  }

  fn record_locked_read(state: &mut SegmentState<K, V>, index: Index, now: u64) {
    state.table[index].set_access_time(now);
    state.table.move_to_front(Order::Access, index);
  }

  /// Installs a value into an entry, linking it if it was a placeholder.
  fn set_value(
    &self,
    state: &mut SegmentState<K, V>,
    index: Index,
    value: ValueReference<V>,
    weight: u64,
    now: u64,
  ) {
    let entry = &mut state.table[index];
    let linked = entry.linked;
    let old_weight = if linked { entry.weight } else { 0 };
    entry.value = value;
    entry.weight = weight;
    entry.write_time = now;
    entry.set_access_time(now);

    if linked {
      for order in Order::ALL {
        state.table.move_to_front(order, index);
      }
    } else {
      state.table.link(index);
      state.count += 1;
    }
    state.total_weight = state.total_weight.saturating_sub(old_weight).saturating_add(weight);
    state.mod_count += 1;
  }

  fn insert_entry(
    &self,
    state: &mut SegmentState<K, V>,
    hash: u64,
    key: Arc<K>,
    value: ValueReference<V>,
    weight: u64,
    now: u64,
  ) -> Option<Index> {
    if !self.config.retains_key(&key) {
      tracing::trace!("weak key is not held outside the cache; entry not created");
      return None;
    }
    let key = KeyReference::new(key, self.config.key_strength);
    let index = state.table.insert(Entry::new(key, hash, ValueReference::Unset, now));
    self.set_value(state, index, value, weight, now);
    Some(index)
  }

  /// Takes the exclusive lock and runs the pending cleanup first.
  fn write_locked<R>(
    &self,
    now: u64,
    pending: &mut Pending<K, V>,
    f: impl FnOnce(&mut SegmentState<K, V>, &mut Pending<K, V>) -> R,
  ) -> R {
    let mut state = self.state.write();
    self.run_locked_cleanup(&mut state, now, pending);
    let result = f(&mut *state, pending);
    self.publish(&state);
    result
  }
}

impl<K: Eq, V> Segment<K, V> {
  // --- Write path (exclusive lock) ---

  /// Stores a value, returning the live value it replaced. With
  /// `only_if_absent` an existing live value wins and is returned instead.
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn put(
    &self,
    hash: u64,
    key: Arc<K>,
    value: Arc<V>,
    weight: u64,
    only_if_absent: bool,
    now: u64,
    pending: &mut Pending<K, V>,
  ) -> Option<Arc<V>> {
    let strength = self.config.value_strength;
    self.write_locked(now, pending, |state, pending| {
      let found = state.table.find(hash, key.as_ref(), |i, e| self.enqueue_reclaim(i, e));
      let mut previous = None;

      let index = match found {
        Some(index) => {
          let entry = &state.table[index];
          let expired = self.config.is_expired(entry, now);
          match entry.value.get() {
            Some(old) if !expired => {
              if only_if_absent {
                Self::record_locked_read(state, index, now);
                return Some(old);
              }
              self.notify(pending, Some(key.clone()), Some(old.clone()), RemovalCause::Replaced);
              self.set_value(state, index, ValueReference::new(value, strength), weight, now);
              previous = Some(old);
              Some(index)
            }
            None if !entry.value.is_active() => {
              // A first load is in flight; the explicit write wins and the
              // loader's result will be reported as replaced.
              self.set_value(state, index, ValueReference::new(value, strength), weight, now);
              Some(index)
            }
            Some(_) => {
              self.remove_entry(state, index, RemovalCause::Expired, pending);
              self.insert_entry(state, hash, key, ValueReference::new(value, strength), weight, now)
            }
            None => {
              self.remove_entry(state, index, RemovalCause::Collected, pending);
              self.insert_entry(state, hash, key, ValueReference::new(value, strength), weight, now)
            }
          }
        }
        None => {
          self.insert_entry(state, hash, key, ValueReference::new(value, strength), weight, now)
        }
      };

      if let Some(index) = index {
        self.evict_entries(state, Some(index), pending);
      }
      previous
    })
  }

  /// Removes a key. A first load in flight is left alone.
  pub(crate) fn remove<Q>(
    &self,
    hash: u64,
    key: &Q,
    now: u64,
    pending: &mut Pending<K, V>,
  ) -> Option<Arc<V>>
  where
    Q: Equivalent<K> + ?Sized,
  {
    self.write_locked(now, pending, |state, pending| {
      let index = state.table.find(hash, key, |i, e| self.enqueue_reclaim(i, e))?;
      let entry = &state.table[index];
      if !entry.value.is_active() {
        return None;
      }
      let (cause, removed) = match entry.value.get() {
        Some(_) if self.config.is_expired(entry, now) => (RemovalCause::Expired, false),
        Some(_) => (RemovalCause::Explicit, true),
        None => (RemovalCause::Collected, false),
      };
      let value = self.remove_entry(state, index, cause, pending);
      if removed {
        value
      } else {
        None
      }
    })
  }

  /// Swaps in `value` for a live value accepted by `matches`, returning the
  /// value it replaced. Never creates an entry.
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn replace<F>(
    &self,
    hash: u64,
    key: &K,
    matches: F,
    value: Arc<V>,
    weight: u64,
    now: u64,
    pending: &mut Pending<K, V>,
  ) -> Option<Arc<V>>
  where
    F: FnOnce(&V) -> bool,
  {
    let strength = self.config.value_strength;
    self.write_locked(now, pending, |state, pending| {
      let index = state.table.find(hash, key, |i, e| self.enqueue_reclaim(i, e))?;
      let entry = &state.table[index];
      if !entry.value.is_active() {
        return None;
      }
      let expired = self.config.is_expired(entry, now);
      match entry.value.get() {
        Some(old) if !expired => {
          if !matches(&old) {
            Self::record_locked_read(state, index, now);
            return None;
          }
          self.notify(pending, entry.key.get(), Some(old.clone()), RemovalCause::Replaced);
          self.set_value(state, index, ValueReference::new(value, strength), weight, now);
          self.evict_entries(state, Some(index), pending);
          Some(old)
        }
        Some(_) => {
          self.remove_entry(state, index, RemovalCause::Expired, pending);
          None
        }
        None => {
          self.remove_entry(state, index, RemovalCause::Collected, pending);
          None
        }
      }
    })
  }

  /// Removes the entry only if its live value is accepted by `matches`.
  pub(crate) fn remove_if<Q, F>(
    &self,
    hash: u64,
    key: &Q,
    matches: F,
    now: u64,
    pending: &mut Pending<K, V>,
  ) -> Option<Arc<V>>
  where
    Q: Equivalent<K> + ?Sized,
    F: FnOnce(&V) -> bool,
  {
    self.write_locked(now, pending, |state, pending| {
      let index = state.table.find(hash, key, |i, e| self.enqueue_reclaim(i, e))?;
      let entry = &state.table[index];
      if !entry.value.is_active() {
        return None;
      }
      let cause = match entry.value.get() {
        None => RemovalCause::Collected,
        Some(_) if self.config.is_expired(entry, now) => RemovalCause::Expired,
        Some(value) => {
          if !matches(&value) {
            return None;
          }
          RemovalCause::Explicit
        }
      };
      let removed = self.remove_entry(state, index, cause, pending);
      removed.filter(|_| cause == RemovalCause::Explicit)
    })
  }

  /// Removes every live entry. Loads in flight are not interrupted.
  pub(crate) fn clear(&self, pending: &mut Pending<K, V>) {
    let mut state = self.state.write();
    for index in state.table.indices() {
      if state.table[index].value.is_active() {
        self.remove_entry(&mut state, index, RemovalCause::Explicit, pending);
      }
    }
    while self.recency.pop().is_some() {}
    while self.reclaim.pop().is_some() {}
    // Surviving placeholders may have been queued; let them queue again.
    for (_, entry) in state.table.iter() {
      entry.clear_reclaim_queued();
    }
    self.reclaim_overflow.store(false, Ordering::Relaxed);
    self.recency_overflow.store(false, Ordering::Relaxed);
    if state.table.len() == 0 {
      state.table.clear();
    }
    self.publish(&state);
  }

  // --- Loading ---

  /// Decides who loads `key`: returns a live value, a load to join, or a
  /// fresh placeholder the caller must resolve with `store_loaded` or
  /// `remove_loading`.
  pub(crate) fn claim(
    &self,
    hash: u64,
    key: &Arc<K>,
    mode: ClaimMode,
    now: u64,
    pending: &mut Pending<K, V>,
  ) -> Claim<V> {
    self.write_locked(now, pending, |state, pending| {
      if let Some(index) = state.table.find(hash, key.as_ref(), |i, e| self.enqueue_reclaim(i, e)) {
        let entry = &state.table[index];
        if let Some(future) = entry.value.loading_future() {
          if future.is_done() {
            // The owner finished without resolving the entry. Revert it.
            let entry = &mut state.table[index];
            let value = std::mem::replace(&mut entry.value, ValueReference::Unset);
            entry.value = value.take_previous();
          } else {
            // A refresh keeps serving its stale value to plain lookups.
            let usable = entry.value.get().is_some() && !self.config.is_expired(entry, now);
            if mode == ClaimMode::Refresh || !usable {
              return Claim::Wait(future.clone());
            }
          }
        }

        let entry = &state.table[index];
        let expired = self.config.is_expired(entry, now);
        match entry.value.get() {
          Some(value) if !expired => match mode {
            ClaimMode::Get => {
              Self::record_locked_read(state, index, now);
              return Claim::Present(value);
            }
            ClaimMode::Refresh => {
              let future = Arc::new(LoadFuture::new(now));
              let entry = &mut state.table[index];
              let current = std::mem::replace(&mut entry.value, ValueReference::Unset);
              entry.value = ValueReference::loading(future.clone(), current);
              return Claim::Load {
                future,
                previous: Some(value),
              };
            }
          },
          Some(_) => {
            self.remove_entry(state, index, RemovalCause::Expired, pending);
          }
          None => {
            self.remove_entry(state, index, RemovalCause::Collected, pending);
          }
        }
      }

      if !self.config.retains_key(key) {
        return Claim::KeyNotRetained;
      }
      let future = Arc::new(LoadFuture::new(now));
      let placeholder = Entry::new(
        KeyReference::new(key.clone(), self.config.key_strength),
        hash,
        ValueReference::loading(future.clone(), ValueReference::Unset),
        now,
      );
      state.table.insert(placeholder);
      state.mod_count += 1;
      Claim::Load {
        future,
        previous: None,
      }
    })
  }

  /// Resolves a claimed load with its value. Returns `false` when the entry
  /// was replaced or removed while loading; the value is then discarded.
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn store_loaded(
    &self,
    hash: u64,
    key: &Arc<K>,
    future: &Arc<LoadFuture<V>>,
    value: Arc<V>,
    weight: u64,
    now: u64,
    pending: &mut Pending<K, V>,
  ) -> bool {
    let strength = self.config.value_strength;
    self.write_locked(now, pending, |state, pending| {
      let found = state.table.find(hash, key.as_ref(), |i, e| self.enqueue_reclaim(i, e));
      let Some(index) = found else {
        return false;
      };
      let ours = state.table[index]
        .value
        .loading_future()
        .is_some_and(|f| Arc::ptr_eq(f, future));
      if !ours {
        self.notify(pending, Some(key.clone()), Some(value), RemovalCause::Replaced);
        return false;
      }

      let entry = &mut state.table[index];
      let previous = std::mem::replace(&mut entry.value, ValueReference::Unset).take_previous();
      if entry.linked {
        match previous.get() {
          Some(old) => self.notify(pending, Some(key.clone()), Some(old), RemovalCause::Replaced),
          None => self.notify(pending, Some(key.clone()), None, RemovalCause::Collected),
        }
      }
      self.set_value(state, index, ValueReference::new(value, strength), weight, now);
      self.evict_entries(state, Some(index), pending);
      true
    })
  }

  /// Resolves a claimed load that failed: a refresh gets its old value back,
  /// a first load's placeholder is dropped.
  pub(crate) fn remove_loading(
    &self,
    hash: u64,
    key: &Arc<K>,
    future: &Arc<LoadFuture<V>>,
    now: u64,
    pending: &mut Pending<K, V>,
  ) {
    self.write_locked(now, pending, |state, pending| {
      let found = state.table.find(hash, key.as_ref(), |i, e| self.enqueue_reclaim(i, e));
      let Some(index) = found else {
        return;
      };
      let entry = &mut state.table[index];
      if !entry.value.loading_future().is_some_and(|f| Arc::ptr_eq(f, future)) {
        return;
      }
      let previous = std::mem::replace(&mut entry.value, ValueReference::Unset).take_previous();
      if previous.is_active() {
        entry.value = previous;
      } else {
        self.remove_entry(state, index, RemovalCause::Explicit, pending);
      }
    })
  }

  // --- Whole-segment sweeps ---

  /// Full sweep: reclaims every collected entry, expires every stale entry,
  /// and re-establishes the bound.
  pub(crate) fn clean_up(&self, now: u64, pending: &mut Pending<K, V>) {
    let mut state = self.state.write();
    while self.reclaim.pop().is_some() {}
    self.reclaim_overflow.store(false, Ordering::Relaxed);
    self.sweep_collected(&mut state, pending);
    self.expire_entries(&mut state, now, pending);
    if self.config.expires() {
      for index in state.table.indices() {
        let entry = &state.table[index];
        if entry.linked && self.config.is_expired(entry, now) {
          self.remove_entry(&mut state, index, RemovalCause::Expired, pending);
        }
      }
    }
    self.evict_entries(&mut state, None, pending);
    self.publish(&state);
  }

  /// Drops the pin on every soft value; values nobody else holds are
  /// collected right away.
  pub(crate) fn release_soft_values(&self, pending: &mut Pending<K, V>) {
    let mut state = self.state.write();
    for index in state.table.indices() {
      let entry = &mut state.table[index];
      if entry.value.release_soft() && entry.linked {
        self.remove_entry(&mut state, index, RemovalCause::Collected, pending);
      }
    }
    self.publish(&state);
  }
}
