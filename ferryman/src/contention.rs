//! Passage contention cache.
//!
//! Tracks the last client IP seen for each passage key. A relay or manager
//! credential showing up from a second IP inside the cooling window indicates
//! leakage and is refused; user passages set a zero cooling window and are
//! never restricted (legitimately shared across devices).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

struct Entry {
    ip: IpAddr,
    deadline: Instant,
    // Guards the one-shot removal timer against racing a refreshed entry.
    generation: u64,
}

#[derive(Clone)]
pub struct ContentionCache {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl ContentionCache {
    pub fn new() -> Self {
        ContentionCache {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns `Ok(())` when `ip` may use the passage `key`, or the
    /// conflicting IP otherwise. A zero `cooling` disables the check.
    pub fn check(&self, key: &str, cooling: Duration, ip: IpAddr) -> Result<(), IpAddr> {
        if cooling.is_zero() {
            return Ok(());
        }
        let now = Instant::now();
        let mut map = self.inner.lock();
        let generation = match map.get_mut(key) {
            Some(entry) if entry.ip == ip || now >= entry.deadline => {
                entry.ip = ip;
                entry.deadline = now + cooling;
                entry.generation += 1;
                entry.generation
            }
            Some(entry) => return Err(entry.ip),
            None => {
                map.insert(
                    key.to_owned(),
                    Entry {
                        ip,
                        deadline: now + cooling,
                        generation: 0,
                    },
                );
                0
            }
        };
        drop(map);
        self.schedule_removal(key.to_owned(), cooling, generation);
        Ok(())
    }

    fn schedule_removal(&self, key: String, cooling: Duration, generation: u64) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(cooling).await;
            let mut map = inner.lock();
            if map.get(&key).is_some_and(|e| e.generation == generation) {
                map.remove(&key);
            }
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Default for ContentionCache {
    fn default() -> Self {
        Self::new()
    }
}
