use std::sync::{Arc, Mutex};

use lru::LruCache;

/// Byte-cost bounded LRU over string keys.
///
/// `lru` tracks recency; the cost accounting and evict-until-fit policy
/// live here. Purely a cache: correctness never depends on an entry
/// being present.
pub struct CostLru {
    inner: Mutex<Inner>,
}

struct Inner {
    map: LruCache<String, Arc<Vec<u8>>>,
    cost: u64,
    budget: u64,
}

impl CostLru {
    pub fn new(budget: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: LruCache::unbounded(),
                cost: 0,
                budget,
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let mut inner = self.inner.lock().ok()?;
        inner.map.get(key).cloned()
    }

    pub fn put(&self, key: String, value: Arc<Vec<u8>>) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let cost = value.len() as u64;
        if cost > inner.budget {
            return;
        }
        if let Some(old) = inner.map.put(key, value) {
            inner.cost -= old.len() as u64;
        }
        inner.cost += cost;
        while inner.cost > inner.budget {
            match inner.map.pop_lru() {
                Some((_, evicted)) => inner.cost -= evicted.len() as u64,
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(n: usize) -> Arc<Vec<u8>> {
        Arc::new(vec![0u8; n])
    }

    #[test]
    fn evicts_least_recent_beyond_budget() {
        let lru = CostLru::new(10);
        lru.put("a".into(), blob(4));
        lru.put("b".into(), blob(4));
        lru.get("a");
        lru.put("c".into(), blob(4));

        assert!(lru.get("b").is_none());
        assert!(lru.get("a").is_some());
        assert!(lru.get("c").is_some());
    }

    #[test]
    fn oversized_entry_is_refused() {
        let lru = CostLru::new(10);
        lru.put("big".into(), blob(11));
        assert!(lru.get("big").is_none());
        assert!(lru.is_empty());
    }

    #[test]
    fn replacing_a_key_adjusts_cost() {
        let lru = CostLru::new(10);
        lru.put("a".into(), blob(8));
        lru.put("a".into(), blob(2));
        lru.put("b".into(), blob(8));
        assert!(lru.get("a").is_some());
        assert!(lru.get("b").is_some());
    }
}
