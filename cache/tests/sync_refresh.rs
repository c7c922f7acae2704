mod common;

use common::{causes, recording_listener};
use fibre_loading_cache::{
  BoxError, CacheBuilder, CacheError, CacheLoader, ManualTicker, RemovalCause,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

/// Loads a version number that goes up with every call.
struct Versioned {
  version: AtomicU32,
  fail: AtomicBool,
}

impl Versioned {
  fn new() -> Arc<Self> {
    Arc::new(Self {
      version: AtomicU32::new(0),
      fail: AtomicBool::new(false),
    })
  }
}

impl CacheLoader<u32, u32> for Versioned {
  fn load(&self, _key: &u32) -> Result<Option<u32>, BoxError> {
    if self.fail.load(Ordering::SeqCst) {
      return Err("reload failed".into());
    }
    Ok(Some(self.version.fetch_add(1, Ordering::SeqCst)))
  }
}

#[test]
fn test_refresh_after_write_reloads_on_read() {
  let ticker = Arc::new(ManualTicker::new());
  let loader = Versioned::new();
  let (events, listener) = recording_listener::<u32, u32>();
  let cache = CacheBuilder::new()
    .refresh_after_write(Duration::from_secs(10))
    .ticker(ticker.clone())
    .removal_listener(listener)
    .build_with_loader(loader.clone())
    .unwrap();

  assert_eq!(*cache.get(&1).unwrap(), 0);
  ticker.advance(Duration::from_secs(5));
  assert_eq!(*cache.get(&1).unwrap(), 0, "not due yet");

  ticker.advance(Duration::from_secs(6));
  assert_eq!(*cache.get(&1).unwrap(), 1, "the reading thread refreshed the entry");
  assert_eq!(*cache.get(&1).unwrap(), 1);
  assert_eq!(causes(&events), vec![RemovalCause::Replaced]);
  assert_eq!(loader.version.load(Ordering::SeqCst), 2);
}

#[test]
fn test_refresh_after_write_applies_to_get_if_present() {
  let ticker = Arc::new(ManualTicker::new());
  let loader = Versioned::new();
  let cache = CacheBuilder::new()
    .refresh_after_write(Duration::from_secs(1))
    .ticker(ticker.clone())
    .build_with_loader(loader)
    .unwrap();

  cache.insert(1, 100);
  ticker.advance(Duration::from_secs(2));
  assert_eq!(cache.get_if_present(&1), Some(Arc::new(0)));
}

#[test]
fn test_refresh_after_write_applies_to_get_all() {
  let ticker = Arc::new(ManualTicker::new());
  let loader = Versioned::new();
  let cache = CacheBuilder::new()
    .refresh_after_write(Duration::from_secs(1))
    .ticker(ticker.clone())
    .build_with_loader(loader.clone())
    .unwrap();

  cache.insert(1, 100);
  cache.insert(2, 200);
  assert_eq!(*cache.get_all(&[1, 2]).unwrap()[&1], 100, "not due yet");

  ticker.advance(Duration::from_secs(2));
  let values = cache.get_all(&[1, 2]).unwrap();
  let mut refreshed = vec![*values[&1], *values[&2]];
  refreshed.sort_unstable();
  assert_eq!(refreshed, vec![0, 1], "both stale entries were reloaded");
  assert_eq!(loader.version.load(Ordering::SeqCst), 2);
  assert_eq!(cache.peek(&1), Some(values[&1].clone()));
}

#[test]
fn test_failed_refresh_after_write_keeps_stale_value() {
  let ticker = Arc::new(ManualTicker::new());
  let loader = Versioned::new();
  let cache = CacheBuilder::new()
    .refresh_after_write(Duration::from_secs(1))
    .ticker(ticker.clone())
    .build_with_loader(loader.clone())
    .unwrap();

  assert_eq!(*cache.get(&1).unwrap(), 0);
  loader.fail.store(true, Ordering::SeqCst);
  ticker.advance(Duration::from_secs(2));

  assert_eq!(*cache.get(&1).unwrap(), 0, "refresh failures are not surfaced");
  assert_eq!(cache.peek(&1), Some(Arc::new(0)));
  assert_eq!(cache.stats().load_exception_count, 1);
}

#[test]
fn test_explicit_refresh() {
  let loader = Versioned::new();
  let cache = CacheBuilder::new().build_with_loader(loader.clone()).unwrap();

  assert_eq!(*cache.get(&1).unwrap(), 0);
  cache.refresh(&1).unwrap();
  assert_eq!(cache.peek(&1), Some(Arc::new(1)));

  // Refreshing an absent key loads it.
  cache.refresh(&2).unwrap();
  assert_eq!(cache.peek(&2), Some(Arc::new(2)));
}

#[test]
fn test_explicit_refresh_failure_keeps_old_value() {
  let loader = Versioned::new();
  let cache = CacheBuilder::new().build_with_loader(loader.clone()).unwrap();

  assert_eq!(*cache.get(&1).unwrap(), 0);
  loader.fail.store(true, Ordering::SeqCst);

  assert!(matches!(cache.refresh(&1), Err(CacheError::Load(_))));
  assert_eq!(cache.peek(&1), Some(Arc::new(0)));
  assert_eq!(cache.len(), 1);
}

#[test]
fn test_refresh_uses_reload_hook() {
  struct Incrementing;
  impl CacheLoader<u32, u32> for Incrementing {
    fn load(&self, key: &u32) -> Result<Option<u32>, BoxError> {
      Ok(Some(*key))
    }

    fn reload(&self, _key: &u32, old: &u32) -> Result<Option<u32>, BoxError> {
      Ok(Some(old + 100))
    }
  }

  let cache = CacheBuilder::new().build_with_loader(Incrementing).unwrap();
  assert_eq!(*cache.get(&7).unwrap(), 7);
  cache.refresh(&7).unwrap();
  cache.refresh(&7).unwrap();
  assert_eq!(cache.peek(&7), Some(Arc::new(207)));
}

#[test]
fn test_stale_value_is_served_during_refresh() {
  struct Gated {
    started: Barrier,
    release: Barrier,
  }
  impl CacheLoader<u32, u32> for Gated {
    fn load(&self, key: &u32) -> Result<Option<u32>, BoxError> {
      Ok(Some(*key))
    }

    fn reload(&self, _key: &u32, old: &u32) -> Result<Option<u32>, BoxError> {
      self.started.wait();
      self.release.wait();
      Ok(Some(old + 1))
    }
  }

  let loader = Arc::new(Gated {
    started: Barrier::new(2),
    release: Barrier::new(2),
  });
  let cache = CacheBuilder::new().build_with_loader(loader.clone()).unwrap();
  assert_eq!(*cache.get(&1).unwrap(), 1);

  let refresher = {
    let cache = cache.clone();
    thread::spawn(move || cache.refresh(&1))
  };
  loader.started.wait();

  assert_eq!(*cache.get(&1).unwrap(), 1, "readers see the old value while reloading");
  assert_eq!(cache.get_if_present(&1), Some(Arc::new(1)));
  assert_eq!(cache.len(), 1);

  loader.release.wait();
  refresher.join().unwrap().unwrap();
  assert_eq!(cache.peek(&1), Some(Arc::new(2)));
}

#[test]
fn test_invalidate_during_refresh_discards_result() {
  struct Gated {
    started: Barrier,
    release: Barrier,
  }
  impl CacheLoader<u32, u32> for Gated {
    fn load(&self, key: &u32) -> Result<Option<u32>, BoxError> {
      Ok(Some(*key))
    }

    fn reload(&self, _key: &u32, old: &u32) -> Result<Option<u32>, BoxError> {
      self.started.wait();
      self.release.wait();
      Ok(Some(old + 1))
    }
  }

  let loader = Arc::new(Gated {
    started: Barrier::new(2),
    release: Barrier::new(2),
  });
  let cache = CacheBuilder::new().build_with_loader(loader.clone()).unwrap();
  assert_eq!(*cache.get(&1).unwrap(), 1);

  let refresher = {
    let cache = cache.clone();
    thread::spawn(move || cache.refresh(&1))
  };
  loader.started.wait();
  assert_eq!(cache.invalidate(&1), Some(Arc::new(1)));
  loader.release.wait();

  refresher.join().unwrap().unwrap();
  assert!(cache.peek(&1).is_none(), "a refresh does not resurrect an invalidated key");
}
