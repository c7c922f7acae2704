use crate::config::{CacheConfig, MAXIMUM_CAPACITY, MAX_SEGMENTS, SEGMENT_WEIGHT_FACTOR};
use crate::segment::Segment;

use core::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

/// Hashes a key and spreads the bits so that both the high bits (segment
/// selection) and the low bits (bucket selection) are well mixed.
#[inline]
pub(crate) fn hash_key<Q: Hash + ?Sized, H: BuildHasher>(hasher: &H, key: &Q) -> u64 {
  let mut h = hasher.hash_one(key);
  // fmix64 finaliser.
  h ^= h >> 33;
  h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
  h ^= h >> 33;
  h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
  h ^= h >> 33;
  h
}

/// How the cache is carved into segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SegmentLayout {
  pub(crate) count: usize,
  pub(crate) shift: u32,
  pub(crate) per_segment_capacity: usize,
  pub(crate) max_weights: Vec<Option<u64>>,
}

impl SegmentLayout {
  /// Picks the smallest power-of-two segment count covering the concurrency
  /// level, keeping small weight bounds in few segments, then divides the
  /// capacity and the bound between them.
  pub(crate) fn compute(
    concurrency_level: usize,
    initial_capacity: usize,
    maximum_weight: Option<u64>,
    weighted: bool,
  ) -> Self {
    let concurrency_level = concurrency_level.clamp(1, MAX_SEGMENTS);
    let mut initial_capacity = initial_capacity.min(MAXIMUM_CAPACITY);
    if let (Some(max), false) = (maximum_weight, weighted) {
      initial_capacity = initial_capacity.min(usize::try_from(max).unwrap_or(usize::MAX));
    }

    let mut count = 1usize;
    let mut bits = 0u32;
    while count < concurrency_level
      && maximum_weight.map_or(true, |max| (count as u64) * SEGMENT_WEIGHT_FACTOR <= max)
    {
      count <<= 1;
      bits += 1;
    }

    let mut per_segment_capacity = initial_capacity / count;
    if per_segment_capacity * count < initial_capacity {
      per_segment_capacity += 1;
    }

    let max_weights = match maximum_weight {
      Some(max) => {
        let base = max / count as u64;
        let remainder = (max % count as u64) as usize;
        (0..count)
          .map(|i| Some(if i < remainder { base + 1 } else { base }))
          .collect()
      }
      None => vec![None; count],
    };

    Self {
      count,
      shift: 64 - bits,
      per_segment_capacity,
      max_weights,
    }
  }
}

/// The fixed directory of segments, routing each hash to one of them.
pub(crate) struct SegmentedStore<K, V, H> {
  segments: Box<[CachePadded<Segment<K, V>>]>,
  hasher: H,
  shift: u32,
  mask: usize,
}

impl<K, V, H> fmt::Debug for SegmentedStore<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SegmentedStore")
      .field("num_segments", &self.segments.len())
      .finish()
  }
}

impl<K, V, H: BuildHasher> SegmentedStore<K, V, H> {
  pub(crate) fn new(config: Arc<CacheConfig<K, V>>, hasher: H) -> Self {
    let layout = SegmentLayout::compute(
      config.concurrency_level,
      config.initial_capacity,
      config.maximum_weight,
      config.weigher.is_some(),
    );
    tracing::debug!(
      segments = layout.count,
      per_segment_capacity = layout.per_segment_capacity,
      per_segment_weight = ?layout.max_weights.first().copied().flatten(),
      "building segmented cache"
    );

    let segments: Vec<_> = layout
      .max_weights
      .iter()
      .map(|max| CachePadded::new(Segment::new(config.clone(), layout.per_segment_capacity, *max)))
      .collect();

    Self {
      segments: segments.into_boxed_slice(),
      hasher,
      shift: layout.shift,
      mask: layout.count - 1,
    }
  }

  #[inline]
  pub(crate) fn hash<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
    hash_key(&self.hasher, key)
  }

  /// Returns the segment owning `hash`. Uses the high bits; the table inside
  /// the segment uses the low ones.
  #[inline]
  pub(crate) fn segment_for(&self, hash: u64) -> &Segment<K, V> {
    let index = (hash.checked_shr(self.shift).unwrap_or(0) as usize) & self.mask;
    &self.segments[index]
  }

  pub(crate) fn segments(&self) -> impl Iterator<Item = &Segment<K, V>> {
    self.segments.iter().map(|padded| &**padded)
  }

  #[inline]
  pub(crate) fn segment_at(&self, index: usize) -> Option<&Segment<K, V>> {
    self.segments.get(index).map(|padded| &**padded)
  }

  pub(crate) fn segment_count(&self) -> usize {
    self.segments.len()
  }
}
