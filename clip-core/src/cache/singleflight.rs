use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

/// Completion signal a single-flight waiter blocks on.
pub struct Signal {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn wait(&self) {
        let Ok(mut done) = self.done.lock() else {
            return;
        };
        while !*done {
            match self.cond.wait(done) {
                Ok(guard) => done = guard,
                Err(_) => return,
            }
        }
    }

    fn fire(&self) {
        if let Ok(mut done) = self.done.lock() {
            *done = true;
        }
        self.cond.notify_all();
    }
}

/// Coordinates at most one producer per key.
///
/// The first caller for a key becomes the leader and does the work; the
/// map entry is removed and waiters are woken when the leader's guard
/// drops, success or not, so a failed producer never wedges the key.
/// Waiters re-probe their target cache after waking. The map mutex is
/// never held across I/O.
#[derive(Default)]
pub struct SingleFlight {
    flights: Mutex<HashMap<String, Arc<Signal>>>,
}

pub enum Flight<'a> {
    Leader(LeaderGuard<'a>),
    Waiter(Arc<Signal>),
}

pub struct LeaderGuard<'a> {
    owner: &'a SingleFlight,
    key: String,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        let signal = {
            let Ok(mut flights) = self.owner.flights.lock() else {
                return;
            };
            flights.remove(&self.key)
        };
        if let Some(signal) = signal {
            signal.fire();
        }
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, key: &str) -> Flight<'_> {
        let Ok(mut flights) = self.flights.lock() else {
            // Poisoned map: act as leader so progress is still possible.
            return Flight::Leader(LeaderGuard {
                owner: self,
                key: key.to_string(),
            });
        };
        if let Some(signal) = flights.get(key) {
            Flight::Waiter(signal.clone())
        } else {
            flights.insert(key.to_string(), Arc::new(Signal::new()));
            Flight::Leader(LeaderGuard {
                owner: self,
                key: key.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn one_leader_many_waiters() {
        let flights = Arc::new(SingleFlight::new());
        let leaders = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(10));
        let mut handles = Vec::new();

        for _ in 0..10 {
            let flights = flights.clone();
            let leaders = leaders.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                let flight = flights.begin("layer");
                // Every thread has joined the flight before the leader
                // is allowed to finish.
                barrier.wait();
                match flight {
                    Flight::Leader(_guard) => {
                        leaders.fetch_add(1, Ordering::SeqCst);
                    }
                    Flight::Waiter(signal) => signal.wait(),
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(leaders.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn key_is_reusable_after_leader_drops() {
        let flights = SingleFlight::new();
        {
            let f = flights.begin("k");
            assert!(matches!(f, Flight::Leader(_)));
        }
        assert!(matches!(flights.begin("k"), Flight::Leader(_)));
    }

    #[test]
    fn distinct_keys_fly_independently() {
        let flights = SingleFlight::new();
        let _a = flights.begin("a");
        assert!(matches!(flights.begin("b"), Flight::Leader(_)));
    }
}
