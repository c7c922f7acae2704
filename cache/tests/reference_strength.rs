mod common;

use common::{causes, recording_listener};
use fibre_loading_cache::{loader_fn, BoxError, CacheBuilder, CacheError, RemovalCause};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_weak_values_live_while_held() {
  let cache = CacheBuilder::<u32, String>::new().weak_values().build().unwrap();

  let value = cache.get_with(&1, || "held".to_string()).unwrap();
  assert_eq!(cache.get_if_present(&1), Some(value.clone()));
  assert!(Arc::ptr_eq(&cache.get_if_present(&1).unwrap(), &value));

  drop(value);
  assert_eq!(cache.get_if_present(&1), None, "nothing else holds the value");
}

#[test]
fn test_weak_values_are_reclaimed() {
  let (events, listener) = recording_listener::<u32, u32>();
  let cache = CacheBuilder::new()
    .weak_values()
    .removal_listener(listener)
    .build()
    .unwrap();

  let held: Vec<_> = (0..10).map(|k| cache.get_with(&k, || k).unwrap()).collect();
  assert_eq!(cache.len(), 10);

  drop(held);
  cache.clean_up();
  assert_eq!(cache.len(), 0);
  assert_eq!(causes(&events), vec![RemovalCause::Collected; 10]);
  assert_eq!(cache.stats().eviction_count, 10);
}

#[test]
fn test_collected_value_is_reloaded() {
  let cache = CacheBuilder::<u32, u32>::new()
    .weak_values()
    .build_with_loader(loader_fn(|k: &u32| Ok::<_, BoxError>(*k + 1)))
    .unwrap();

  let first = cache.get(&1).unwrap();
  drop(first);
  assert_eq!(*cache.get(&1).unwrap(), 2);
  assert_eq!(cache.stats().load_success_count, 2);
}

#[test]
fn test_written_values_round_trip_for_every_value_strength() {
  for values in ["strong", "weak", "soft"] {
    let builder = CacheBuilder::<u32, String>::new();
    let builder = match values {
      "weak" => builder.weak_values(),
      "soft" => builder.soft_values(),
      _ => builder,
    };
    let cache = builder.build().unwrap();

    let value = Arc::new("v".to_string());
    assert_eq!(cache.insert_arc(Arc::new(1), value.clone()), None, "{values}");
    let read = cache.get_if_present(&1);
    assert!(read.is_some_and(|read| Arc::ptr_eq(&read, &value)), "{values}");
    assert_eq!(cache.len(), 1, "{values}");

    let replacement = Arc::new("w".to_string());
    assert_eq!(cache.insert_arc(Arc::new(1), replacement.clone()), Some(value), "{values}");
    assert_eq!(cache.get_if_present(&1), Some(replacement), "{values}");
  }
}

#[test]
fn test_weak_value_written_by_insert_is_not_kept() {
  let cache = CacheBuilder::<u32, String>::new().weak_values().build().unwrap();
  cache.insert(1, "dropped".to_string());
  assert_eq!(cache.get_if_present(&1), None, "insert keeps no reference for the caller");
  cache.clean_up();
  assert!(cache.is_empty());
}

#[test]
fn test_soft_values_survive_until_memory_pressure() {
  let (events, listener) = recording_listener::<u32, u32>();
  let cache = CacheBuilder::new()
    .soft_values()
    .removal_listener(listener)
    .build()
    .unwrap();

  cache.insert(1, 10);
  cache.insert(2, 20);
  assert_eq!(cache.get_if_present(&1), Some(Arc::new(10)), "soft values are retained");

  let in_use = cache.get_if_present(&2).unwrap();
  cache.release_soft_values();

  assert_eq!(cache.get_if_present(&1), None);
  assert_eq!(cache.get_if_present(&2), Some(Arc::new(20)), "a value in use survives");
  assert_eq!(causes(&events), vec![RemovalCause::Collected]);

  drop(in_use);
  cache.clean_up();
  assert!(cache.is_empty());
  assert_eq!(causes(&events), vec![RemovalCause::Collected, RemovalCause::Collected]);
}

#[test]
fn test_soft_values_written_after_release_are_retained() {
  let cache = CacheBuilder::<u32, u32>::new().soft_values().build().unwrap();
  cache.insert(1, 1);
  cache.release_soft_values();
  cache.insert(2, 2);
  assert!(cache.get_if_present(&1).is_none());
  assert_eq!(cache.get_if_present(&2), Some(Arc::new(2)));
}

#[test]
fn test_weak_keys_compare_by_value() {
  let cache = CacheBuilder::<String, u32>::new().weak_keys().build().unwrap();

  let key = Arc::new("session".to_string());
  cache.insert_shared(key.clone(), 7);

  assert_eq!(cache.get_if_present("session"), Some(Arc::new(7)));
  assert_eq!(cache.get_if_present(&"session".to_string()), Some(Arc::new(7)));
}

#[test]
fn test_weak_keys_are_collected_with_their_key() {
  let (events, listener) = recording_listener::<String, u32>();
  let cache = CacheBuilder::new()
    .weak_keys()
    .removal_listener(listener)
    .build()
    .unwrap();

  let key = Arc::new("session".to_string());
  cache.insert_shared(key.clone(), 7);
  drop(key);

  assert_eq!(cache.get_if_present("session"), None);
  cache.clean_up();
  assert!(cache.is_empty());

  let events = events.lock();
  assert_eq!(events.len(), 1);
  assert_eq!(events[0].cause(), RemovalCause::Collected);
  assert!(events[0].key().is_none(), "the key is gone");
  assert_eq!(events[0].value().map(|v| **v), Some(7));
}

#[test]
fn test_weak_keys_with_a_loader() {
  let cache = CacheBuilder::<String, usize>::new()
    .weak_keys()
    .build_with_loader(loader_fn(|k: &String| Ok::<_, BoxError>(k.len())))
    .unwrap();

  let key = Arc::new("hello".to_string());
  assert_eq!(*cache.get_shared(&key).unwrap(), 5);
  assert_eq!(cache.get_if_present("hello"), Some(Arc::new(5)));
  assert_eq!(cache.stats().load_success_count, 1);
}

#[test]
fn test_weak_keys_never_create_entries_nobody_holds() {
  let loads = Arc::new(AtomicUsize::new(0));
  let cache = CacheBuilder::<String, usize>::new()
    .weak_keys()
    .build_with_loader(loader_fn({
      let loads = loads.clone();
      move |k: &String| {
        loads.fetch_add(1, Ordering::SeqCst);
        Ok::<_, BoxError>(k.len())
      }
    }))
    .unwrap();

  let owned = "abc".to_string();
  assert!(matches!(cache.get(&owned), Err(CacheError::KeyNotRetained)));
  assert!(matches!(cache.get_with(&owned, || 0), Err(CacheError::KeyNotRetained)));
  assert!(matches!(cache.get_all([&owned]), Err(CacheError::KeyNotRetained)));
  assert_eq!(loads.load(Ordering::SeqCst), 0, "nothing is loaded for a doomed entry");
  assert_eq!(cache.insert(owned.clone(), 1), None);
  assert!(cache.is_empty(), "insert stores nothing for an unheld weak key");

  let key = Arc::new(owned.clone());
  assert_eq!(*cache.get_shared(&key).unwrap(), 3);
  assert_eq!(*cache.get(&owned).unwrap(), 3, "a held key is found by value");
  assert_eq!(*cache.get(&owned).unwrap(), 3);
  assert_eq!(loads.load(Ordering::SeqCst), 1, "the entry stays cached while the key is held");

  let other = Arc::new("de".to_string());
  let all = cache.get_all_shared([&key, &other]).unwrap();
  assert_eq!(*all["de"], 2);
  assert_eq!(cache.len(), 2);
  assert_eq!(loads.load(Ordering::SeqCst), 2);
}

#[test]
fn test_round_trip_in_every_strength_configuration() {
  for weak_keys in [false, true] {
    for values in ["strong", "weak", "soft"] {
      let mut builder = CacheBuilder::<String, String>::new();
      if weak_keys {
        builder = builder.weak_keys();
      }
      builder = match values {
        "weak" => builder.weak_values(),
        "soft" => builder.soft_values(),
        _ => builder,
      };
      let cache = builder
        .build_with_loader(loader_fn(|k: &String| Ok::<_, BoxError>(format!("{k}-value"))))
        .unwrap();

      // Hold both halves so every configuration keeps the entry alive.
      let key = Arc::new("k".to_string());
      let value = cache.get_shared(&key).unwrap();
      let context = format!("weak_keys={weak_keys} values={values}");

      assert_eq!(value.as_str(), "k-value", "{context}");
      assert_eq!(cache.get_if_present("k"), Some(value.clone()), "{context}");
      assert_eq!(cache.get_shared(&key).unwrap(), value, "{context}");
      assert_eq!(cache.stats().load_success_count, 1, "{context}");
      assert_eq!(cache.invalidate("k"), Some(value.clone()), "{context}");
      assert!(cache.is_empty(), "{context}");
    }
  }
}
