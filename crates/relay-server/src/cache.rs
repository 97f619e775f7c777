use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::watch;

pub type Fragments = Arc<Vec<String>>;

/// Resolved fragments keyed by PHID, shared by every request handler.
///
/// Entries are write-once and never evicted; lookups only take a read lock.
/// Besides the entries the cache tracks which ids are currently being
/// fetched, so concurrent resolutions of the same unseen id produce a single
/// remote call: the first caller claims the id, later callers wait for that
/// claim to be released.
#[derive(Default)]
pub struct LookupCache {
    entries: RwLock<HashMap<String, Fragments>>,
    in_flight: Mutex<HashMap<String, watch::Receiver<bool>>>,
}

/// Outcome of [`LookupCache::claim`].
pub struct Claim {
    owned: Vec<String>,
    pending: Vec<watch::Receiver<bool>>,
    done: Option<watch::Sender<bool>>,
}

impl Claim {
    /// Ids the claimant must fetch, deduplicated, in input order.
    pub fn owned(&self) -> &[String] {
        &self.owned
    }

    /// Waits until every id fetched by someone else has been released.
    pub async fn wait_pending(&mut self) {
        for rx in &mut self.pending {
            // A dropped sender means the owner went away; either way the id is
            // no longer in flight.
            let _ = rx.wait_for(|done| *done).await;
        }
        self.pending.clear();
    }
}

impl LookupCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<String, Fragments>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<String, Fragments>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, watch::Receiver<bool>>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, id: &str) -> Option<Fragments> {
        self.read_entries().get(id).cloned()
    }

    /// Returns false when `id` already had an entry; the first value wins.
    pub fn put(&self, id: String, fragments: Vec<String>) -> bool {
        let mut entries = self.write_entries();
        if entries.contains_key(&id) {
            return false;
        }
        entries.insert(id, Arc::new(fragments));
        true
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn claim(&self, ids: &[String]) -> Claim {
        // Lock order: in_flight, then entries. `put` happens before `release`,
        // so an id missing from both is really unclaimed.
        let mut in_flight = self.lock_in_flight();
        let entries = self.read_entries();
        let (tx, rx) = watch::channel(false);
        let mut owned: Vec<String> = Vec::new();
        let mut pending = Vec::new();

        for id in ids {
            if entries.contains_key(id) || owned.contains(id) {
                continue;
            }
            if let Some(existing) = in_flight.get(id) {
                // Owner dropped without releasing (cancelled request): take over.
                if existing.has_changed().is_ok() {
                    pending.push(existing.clone());
                    continue;
                }
            }
            in_flight.insert(id.clone(), rx.clone());
            owned.push(id.clone());
        }

        let done = (!owned.is_empty()).then_some(tx);
        Claim {
            owned,
            pending,
            done,
        }
    }

    pub fn release(&self, claim: &mut Claim) {
        {
            let mut in_flight = self.lock_in_flight();
            for id in &claim.owned {
                in_flight.remove(id);
            }
        }
        if let Some(done) = claim.done.take() {
            let _ = done.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::Duration;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn put_is_write_once() {
        let cache = LookupCache::new();
        assert!(cache.put("PHID-TASK-1".to_string(), vec!["a".to_string()]));
        assert!(!cache.put("PHID-TASK-1".to_string(), vec!["b".to_string()]));
        assert_eq!(
            cache.get("PHID-TASK-1").unwrap().as_slice(),
            &["a".to_string()]
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn claim_skips_cached_and_duplicate_ids() {
        let cache = LookupCache::new();
        cache.put("A".to_string(), vec![]);
        let claim = cache.claim(&ids(&["B", "A", "B", "C"]));
        assert_eq!(claim.owned(), ids(&["B", "C"]).as_slice());
    }

    #[tokio::test]
    async fn second_claim_waits_for_first_release() {
        let cache = Arc::new(LookupCache::new());
        let mut first = cache.claim(&ids(&["A", "B"]));
        let mut second = cache.claim(&ids(&["B", "C"]));
        assert_eq!(first.owned(), ids(&["A", "B"]).as_slice());
        assert_eq!(second.owned(), ids(&["C"]).as_slice());

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move {
                second.wait_pending().await;
                cache.get("B")
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        cache.put("B".to_string(), vec!["bee".to_string()]);
        cache.release(&mut first);
        let seen = waiter.await.unwrap();
        assert_eq!(seen.unwrap().as_slice(), &["bee".to_string()]);
    }

    #[test]
    fn abandoned_claim_is_taken_over() {
        let cache = LookupCache::new();
        let first = cache.claim(&ids(&["A"]));
        drop(first);
        let second = cache.claim(&ids(&["A"]));
        assert_eq!(second.owned(), ids(&["A"]).as_slice());
    }

    #[test]
    fn lookups_ignore_outstanding_claims() {
        let cache = LookupCache::new();
        cache.put("A".to_string(), vec!["ay".to_string()]);
        let _claim = cache.claim(&ids(&["B"]));
        assert_eq!(cache.get("A").unwrap().as_slice(), &["ay".to_string()]);
        assert!(cache.get("B").is_none());
    }

    #[test]
    fn readers_hold_the_cache_at_the_same_time() {
        let cache = LookupCache::new();
        cache.put("A".to_string(), vec!["ay".to_string()]);
        let readers = 4;
        let barrier = Barrier::new(readers);
        std::thread::scope(|scope| {
            for _ in 0..readers {
                scope.spawn(|| {
                    let entries = cache.read_entries();
                    // Every reader reaches the barrier while still holding its
                    // guard; an exclusive lock would deadlock here.
                    barrier.wait();
                    assert!(entries.contains_key("A"));
                });
            }
        });
    }

    #[tokio::test]
    async fn concurrent_puts_keep_every_key() {
        let cache = Arc::new(LookupCache::new());
        let mut tasks = Vec::new();
        for i in 0..32 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache.put(format!("PHID-TASK-{i}"), vec![i.to_string()])
            }));
        }
        for t in tasks {
            assert!(t.await.unwrap());
        }
        assert_eq!(cache.len(), 32);
    }
}
