use fibre_loading_cache::{BoxError, CacheBuilder, CacheLoader, RemovalNotification};
use std::collections::HashMap;
use std::thread;
use std::time::Duration;

#[derive(Debug)]
struct User {
  id: u64,
  name: String,
}

/// Pretends to be a slow remote user service.
struct UserService;

impl CacheLoader<u64, User> for UserService {
  fn load(&self, id: &u64) -> Result<Option<User>, BoxError> {
    thread::sleep(Duration::from_millis(50));
    if *id == 0 {
      return Ok(None);
    }
    Ok(Some(User {
      id: *id,
      name: format!("user-{id}"),
    }))
  }

  fn load_all(&self, ids: &[u64]) -> Option<Result<HashMap<u64, User>, BoxError>> {
    thread::sleep(Duration::from_millis(50));
    let users = ids
      .iter()
      .filter(|id| **id != 0)
      .map(|id| {
        (
          *id,
          User {
            id: *id,
            name: format!("user-{id}"),
          },
        )
      })
      .collect();
    Some(Ok(users))
  }
}

fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .init();

  let users = CacheBuilder::new()
    .maximum_size(100)
    .expire_after_write(Duration::from_secs(60))
    .removal_listener(|n: RemovalNotification<u64, User>| {
      println!("removed {:?} ({})", n.key(), n.cause());
    })
    .build_with_loader(UserService)
    .expect("Failed to build cache");

  // Eight threads ask for the same user; the service is called once.
  let handles: Vec<_> = (0..8)
    .map(|_| {
      let users = users.clone();
      thread::spawn(move || users.get(&42).map(|user| user.name.clone()))
    })
    .collect();
  for handle in handles {
    println!("got {:?}", handle.join().expect("worker panicked"));
  }

  match users.get(&0) {
    Ok(user) => println!("unexpected user {user:?}"),
    Err(err) => println!("lookup of id 0 failed: {err}"),
  }

  let batch = users.get_all(&[1, 2, 3, 42]).expect("batch load failed");
  let mut ids: Vec<_> = batch.values().map(|user| user.id).collect();
  ids.sort_unstable();
  println!("batch loaded {ids:?}");

  users.invalidate(&42);
  println!("\nCache stats: {:#?}", users.stats());
}
