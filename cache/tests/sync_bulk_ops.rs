use fibre_loading_cache::{loader_fn, BoxError, CacheBuilder, CacheError, CacheLoader};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

/// Records every batch it is asked for.
#[derive(Default)]
struct BatchLoader {
  batches: Mutex<Vec<Vec<u32>>>,
  single_loads: AtomicUsize,
}

impl CacheLoader<u32, String> for BatchLoader {
  fn load(&self, key: &u32) -> Result<Option<String>, BoxError> {
    self.single_loads.fetch_add(1, Ordering::SeqCst);
    Ok(Some(format!("v{key}")))
  }

  fn load_all(&self, keys: &[u32]) -> Option<Result<HashMap<u32, String>, BoxError>> {
    let mut batch = keys.to_vec();
    batch.sort_unstable();
    self.batches.lock().push(batch);
    Some(Ok(keys.iter().map(|k| (*k, format!("v{k}"))).collect()))
  }
}

#[test]
fn test_get_all_loads_missing_keys_in_one_batch() {
  let loader = Arc::new(BatchLoader::default());
  let cache = CacheBuilder::new().build_with_loader(loader.clone()).unwrap();
  cache.insert(2, "cached".to_string());

  let values = cache.get_all(&[1, 2, 3]).unwrap();
  assert_eq!(values.len(), 3);
  assert_eq!(values[&1].as_str(), "v1");
  assert_eq!(values[&2].as_str(), "cached");
  assert_eq!(values[&3].as_str(), "v3");

  assert_eq!(*loader.batches.lock(), vec![vec![1, 3]]);
  assert_eq!(loader.single_loads.load(Ordering::SeqCst), 0);
  assert_eq!(cache.len(), 3, "loaded values are cached");

  let stats = cache.stats();
  assert_eq!(stats.hit_count, 1);
  assert_eq!(stats.miss_count, 2);
  assert_eq!(stats.load_success_count, 1);
}

#[test]
fn test_get_all_with_everything_cached_skips_the_loader() {
  let loader = Arc::new(BatchLoader::default());
  let cache = CacheBuilder::new().build_with_loader(loader.clone()).unwrap();
  cache.insert(1, "a".to_string());
  cache.insert(2, "b".to_string());

  let values = cache.get_all(&[1, 2]).unwrap();
  assert_eq!(values.len(), 2);
  assert!(loader.batches.lock().is_empty());
}

#[test]
fn test_get_all_deduplicates_keys() {
  let loader = Arc::new(BatchLoader::default());
  let cache = CacheBuilder::new().build_with_loader(loader.clone()).unwrap();

  let values = cache.get_all(&[4, 4, 5, 4]).unwrap();
  assert_eq!(values.len(), 2);
  assert_eq!(*loader.batches.lock(), vec![vec![4, 5]]);
}

#[test]
fn test_get_all_falls_back_to_single_loads() {
  let calls = Arc::new(AtomicUsize::new(0));
  let cache = CacheBuilder::new()
    .build_with_loader(loader_fn({
      let calls = calls.clone();
      move |key: &u32| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, BoxError>(key * 2)
      }
    }))
    .unwrap();

  let keys: Vec<u32> = (0..10).collect();
  let values = cache.get_all(&keys).unwrap();
  assert_eq!(values.len(), 10);
  assert_eq!(*values[&7], 14);
  assert_eq!(calls.load(Ordering::SeqCst), 10);
  assert_eq!(cache.stats().load_success_count, 10);
}

#[test]
fn test_get_all_failure_caches_nothing() {
  struct Broken;
  impl CacheLoader<u32, u32> for Broken {
    fn load(&self, key: &u32) -> Result<Option<u32>, BoxError> {
      Ok(Some(*key))
    }

    fn load_all(&self, _keys: &[u32]) -> Option<Result<HashMap<u32, u32>, BoxError>> {
      Some(Err("batch endpoint down".into()))
    }
  }

  let cache = CacheBuilder::new().build_with_loader(Broken).unwrap();
  cache.insert(1, 1);

  let err = cache.get_all(&[1, 2, 3]).unwrap_err();
  assert!(matches!(err, CacheError::Load(_)));
  assert_eq!(cache.len(), 1, "only the entry cached beforehand remains");
  assert!(cache.peek(&2).is_none());
  assert_eq!(cache.stats().load_exception_count, 1);

  // Single-key lookups are unaffected by the failed batch.
  assert_eq!(*cache.get(&2).unwrap(), 2);
}

#[test]
fn test_get_all_caches_extra_keys() {
  struct Prefetching;
  impl CacheLoader<u32, u32> for Prefetching {
    fn load(&self, key: &u32) -> Result<Option<u32>, BoxError> {
      Ok(Some(*key))
    }

    fn load_all(&self, keys: &[u32]) -> Option<Result<HashMap<u32, u32>, BoxError>> {
      // Fetch each requested key's neighbour while we are at it.
      Some(Ok(keys.iter().flat_map(|k| [(*k, *k), (k + 1000, k + 1000)]).collect()))
    }
  }

  let cache = CacheBuilder::new().build_with_loader(Prefetching).unwrap();
  let values = cache.get_all(&[1, 2]).unwrap();
  assert_eq!(values.len(), 2, "only requested keys are returned");
  assert_eq!(cache.peek(&1001), Some(Arc::new(1001)));
  assert_eq!(cache.peek(&1002), Some(Arc::new(1002)));
}

#[test]
fn test_get_and_get_all_share_one_load() {
  struct Gated {
    started: Barrier,
    release: Barrier,
    loads: AtomicUsize,
  }
  impl CacheLoader<u32, u32> for Gated {
    fn load(&self, key: &u32) -> Result<Option<u32>, BoxError> {
      self.loads.fetch_add(1, Ordering::SeqCst);
      Ok(Some(key * 10))
    }

    fn load_all(&self, keys: &[u32]) -> Option<Result<HashMap<u32, u32>, BoxError>> {
      self.loads.fetch_add(1, Ordering::SeqCst);
      self.started.wait();
      self.release.wait();
      Some(Ok(keys.iter().map(|k| (*k, k * 10)).collect()))
    }
  }

  let loader = Arc::new(Gated {
    started: Barrier::new(2),
    release: Barrier::new(2),
    loads: AtomicUsize::new(0),
  });
  let cache = CacheBuilder::new().build_with_loader(loader.clone()).unwrap();

  let bulk = {
    let cache = cache.clone();
    thread::spawn(move || cache.get_all(&[1, 2]).unwrap())
  };
  // Both keys are claimed by the bulk load once it is running.
  loader.started.wait();

  let single = {
    let cache = cache.clone();
    thread::spawn(move || cache.get(&1).unwrap())
  };
  // The single lookup counts its miss just before it starts waiting.
  while cache.stats().miss_count < 3 {
    thread::yield_now();
  }
  loader.release.wait();

  let bulk = bulk.join().unwrap();
  let single = single.join().unwrap();
  assert_eq!(loader.loads.load(Ordering::SeqCst), 1, "the single lookup joined the bulk load");
  assert_eq!(*bulk[&1], 10);
  assert_eq!(*single, 10);
  assert!(Arc::ptr_eq(&bulk[&1], &single));
}

#[test]
fn test_invalidate_many() {
  let cache = CacheBuilder::<u32, u32>::new().build().unwrap();
  for i in 0..10 {
    cache.insert(i, i);
  }
  cache.invalidate_many(&[1, 3, 5, 7, 9, 11]);
  assert_eq!(cache.len(), 5);
  assert!((0..10).step_by(2).all(|k| cache.contains_key(&k)));
}
