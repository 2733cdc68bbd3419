//! Single-flight coordination for cache fetches.
//!
//! A [`FlightMap`] makes sure that at most one network fetch per cache key
//! is in progress at any time. The first caller for a key becomes the
//! leader and receives a guard; everyone else arriving while the guard is
//! alive blocks until it is dropped and then re-checks the cache instead of
//! issuing a duplicate fetch.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use crate::utils::sync::Mutex;


//------------ FlightMap -----------------------------------------------------

/// The set of keys with a fetch currently in flight.
#[derive(Debug, Default)]
pub struct FlightMap<K> {
    pending: Mutex<HashMap<K, Arc<Flight>>>,
}

impl<K: Clone + Eq + Hash> FlightMap<K> {
    pub fn new() -> Self {
        FlightMap {
            pending: Mutex::new(HashMap::new())
        }
    }

    /// Tries to become the leader for the given key.
    ///
    /// Returns a guard if the caller should perform the fetch itself. If
    /// another fetch for the key was already in flight, blocks until that
    /// fetch finished and returns `None`; the caller should then re-check
    /// the cache.
    pub fn join(&self, key: &K) -> Option<FlightGuard<K>> {
        let mut pending = self.pending.lock();
        match pending.get(key) {
            Some(flight) => {
                let flight = flight.clone();
                drop(pending);
                flight.wait();
                None
            }
            None => {
                let flight = Arc::new(Flight::default());
                pending.insert(key.clone(), flight.clone());
                Some(FlightGuard { map: self, key: key.clone(), flight })
            }
        }
    }

    fn finish(&self, key: &K, flight: &Flight) {
        self.pending.lock().remove(key);
        flight.finish();
    }
}


//------------ FlightGuard ---------------------------------------------------

/// Leadership of a single fetch.
///
/// Dropping the guard wakes all waiting followers. This also happens when
/// the leader’s fetch fails or panics, so followers can never get stuck.
pub struct FlightGuard<'a, K: Clone + Eq + Hash> {
    map: &'a FlightMap<K>,
    key: K,
    flight: Arc<Flight>,
}

impl<'a, K: Clone + Eq + Hash> Drop for FlightGuard<'a, K> {
    fn drop(&mut self) {
        self.map.finish(&self.key, &self.flight)
    }
}


//------------ Flight --------------------------------------------------------

/// The completion signal of one in-flight fetch.
#[derive(Debug, Default)]
struct Flight {
    done: StdMutex<bool>,
    cond: Condvar,
}

impl Flight {
    fn wait(&self) {
        let mut done = self.done.lock().expect(
            "acquiring a poisoned mutex"
        );
        while !*done {
            done = self.cond.wait(done).expect(
                "acquiring a poisoned mutex"
            );
        }
    }

    fn finish(&self) {
        *self.done.lock().expect("acquiring a poisoned mutex") = true;
        self.cond.notify_all();
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn leader_then_follower() {
        let map = Arc::new(FlightMap::new());

        let guard = map.join(&1u32).expect("first caller leads");

        let follower = {
            let map = map.clone();
            thread::spawn(move || {
                // Returns None only once the leader is done.
                assert!(map.join(&1u32).is_none());
            })
        };

        thread::sleep(Duration::from_millis(20));
        drop(guard);
        follower.join().unwrap();

        // The key is free again afterwards.
        assert!(map.join(&1u32).is_some());
    }

    #[test]
    fn distinct_keys_are_independent() {
        let map = FlightMap::new();
        let _one = map.join(&1u32).unwrap();
        assert!(map.join(&2u32).is_some());
    }
}
