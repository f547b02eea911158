//! Passage store and per-client-IP user contexts.
//!
//! The store owns every passage; connections and user contexts only ever see
//! `Arc`/`Weak` references. Each protocol front-end instantiates the store
//! with its own localized passage type carrying derived key material.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::passage::Passage;

/// Idle TTL of a user context.
const CONTEXT_TTL: Duration = Duration::from_secs(60 * 60);

/// A protocol-localized passage: the controller record plus whatever derived
/// key material the protocol needs to probe it.
///
/// `localize` regenerates manager secrets; a manager credential never keeps
/// the value the controller sent.
pub trait LocalPassage: Send + Sync + Sized + 'static {
    fn localize(passage: Passage) -> anyhow::Result<Self>;

    fn passage(&self) -> &Passage;

    fn argument_hash(&self) -> &str;
}

/// Per-client-IP preference list, most recently successful first.
pub struct UserContext<P> {
    list: Mutex<Vec<Weak<P>>>,
}

impl<P: LocalPassage> UserContext<P> {
    fn new(passages: &[Arc<P>]) -> Self {
        UserContext {
            list: Mutex::new(passages.iter().map(Arc::downgrade).collect()),
        }
    }

    /// Probe every live passage in preference order; promote the hit to the
    /// front. Entries whose passage was removed from the store are skipped
    /// and pruned transparently.
    pub fn auth<R>(&self, mut probe: impl FnMut(&Arc<P>) -> Option<R>) -> Option<(Arc<P>, R)> {
        let snapshot: Vec<Weak<P>> = self.list.lock().clone();
        for weak in &snapshot {
            let Some(passage) = weak.upgrade() else {
                continue;
            };
            if let Some(result) = probe(&passage) {
                self.promote(weak);
                return Some((passage, result));
            }
        }
        self.prune();
        None
    }

    fn promote(&self, weak: &Weak<P>) {
        let mut list = self.list.lock();
        // The list may have shifted since the snapshot; locate by identity.
        if let Some(pos) = list.iter().position(|w| Weak::ptr_eq(w, weak)) {
            let node = list.remove(pos);
            list.insert(0, node);
        }
    }

    fn prune(&self) {
        self.list.lock().retain(|w| w.strong_count() > 0);
    }

    fn insert(&self, passage: &Arc<P>) {
        self.list.lock().push(Arc::downgrade(passage));
    }

    fn remove_matching(&self, hashes: &HashSet<String>) {
        self.list
            .lock()
            .retain(|w| match w.upgrade() {
                Some(p) => !hashes.contains(p.argument_hash()),
                None => false,
            });
    }

    #[cfg(test)]
    pub fn snapshot_hashes(&self) -> Vec<String> {
        self.list
            .lock()
            .iter()
            .filter_map(|w| w.upgrade())
            .map(|p| p.argument_hash().to_owned())
            .collect()
    }
}

struct ContextSlot<P> {
    context: Arc<UserContext<P>>,
    last_used: Instant,
}

struct Inner<P> {
    passages: Vec<Arc<P>>,
    contexts: HashMap<IpAddr, ContextSlot<P>>,
}

/// Store of localized passages plus the user-context LRU above it.
pub struct PassageStore<P> {
    inner: Mutex<Inner<P>>,
}

impl<P: LocalPassage> PassageStore<P> {
    pub fn new() -> Self {
        PassageStore {
            inner: Mutex::new(Inner {
                passages: Vec::new(),
                contexts: HashMap::new(),
            }),
        }
    }

    /// Insert all passages. When the batch carries a manager entry, every
    /// existing manager entry is dropped first; only the first manager of
    /// the batch keeps the flag.
    pub fn add_passages(&self, passages: Vec<Passage>) -> anyhow::Result<()> {
        trace!(count = passages.len(), "add_passages");
        let mut localized = Vec::with_capacity(passages.len());
        let mut saw_manager = false;
        for mut passage in passages {
            if passage.manager {
                if saw_manager {
                    warn!("found more than one manager passage; demoting the extra one");
                    passage.manager = false;
                } else {
                    saw_manager = true;
                }
            }
            localized.push(Arc::new(P::localize(passage)?));
        }

        let mut inner = self.inner.lock();
        if saw_manager {
            let stale: HashSet<String> = inner
                .passages
                .iter()
                .filter(|p| p.passage().manager)
                .map(|p| p.argument_hash().to_owned())
                .collect();
            if !stale.is_empty() {
                inner.passages.retain(|p| !p.passage().manager);
                for slot in inner.contexts.values() {
                    slot.context.remove_matching(&stale);
                }
            }
        }
        for passage in &localized {
            for slot in inner.contexts.values() {
                slot.context.insert(passage);
            }
        }
        inner.passages.extend(localized);
        Ok(())
    }

    /// Drop passages by argument hash. Manager entries are only touched when
    /// `also_manager` is set.
    pub fn remove_passages(&self, passages: &[Passage], also_manager: bool) {
        trace!(count = passages.len(), also_manager, "remove_passages");
        let doomed: HashSet<String> = passages
            .iter()
            .filter(|p| also_manager || !p.manager)
            .map(Passage::argument_hash)
            .collect();

        let mut inner = self.inner.lock();
        inner
            .passages
            .retain(|p| (p.passage().manager && !also_manager) || !doomed.contains(p.argument_hash()));
        for slot in inner.contexts.values() {
            slot.context.remove_matching(&doomed);
        }
    }

    /// Replace the current set with `target`: compute `(to_remove, to_add)`
    /// as a set difference by argument hash, remove first, then add. The
    /// local manager entry is always retained.
    pub fn sync_passages(&self, target: Vec<Passage>) -> anyhow::Result<()> {
        trace!("sync_passages");
        let current = self.passages();
        let target_hashes: HashSet<String> = target.iter().map(Passage::argument_hash).collect();
        let current_hashes: HashSet<String> = current.iter().map(Passage::argument_hash).collect();

        let to_remove: Vec<Passage> = current
            .into_iter()
            .filter(|p| !target_hashes.contains(&p.argument_hash()))
            .collect();
        let to_add: Vec<Passage> = target
            .into_iter()
            .filter(|p| !current_hashes.contains(&p.argument_hash()))
            .collect();

        self.remove_passages(&to_remove, false);
        self.add_passages(to_add)
    }

    /// Value snapshot of the controller-facing records.
    pub fn passages(&self) -> Vec<Passage> {
        self.inner
            .lock()
            .passages
            .iter()
            .map(|p| p.passage().clone())
            .collect()
    }

    pub fn manager_passage(&self) -> Option<Passage> {
        self.inner
            .lock()
            .passages
            .iter()
            .find(|p| p.passage().manager)
            .map(|p| p.passage().clone())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().passages.is_empty()
    }

    /// Localized snapshot, in insertion order. Protocols whose first packet
    /// identifies the credential directly (VMess, Juicity) probe this list
    /// instead of a per-IP context.
    pub fn snapshot(&self) -> Vec<Arc<P>> {
        self.inner.lock().passages.iter().map(Arc::clone).collect()
    }

    /// Find a live passage by a predicate, outside of any user context.
    pub fn find(&self, predicate: impl Fn(&P) -> bool) -> Option<Arc<P>> {
        self.inner
            .lock()
            .passages
            .iter()
            .find(|p| predicate(p))
            .map(Arc::clone)
    }

    /// Get or lazily create the user context for `ip`.
    pub fn user_context(&self, ip: IpAddr) -> Arc<UserContext<P>> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if let Some(slot) = inner.contexts.get_mut(&ip) {
            if now.duration_since(slot.last_used) < CONTEXT_TTL {
                slot.last_used = now;
                return Arc::clone(&slot.context);
            }
        }
        let context = Arc::new(UserContext::new(&inner.passages));
        inner.contexts.insert(
            ip,
            ContextSlot {
                context: Arc::clone(&context),
                last_used: now,
            },
        );
        context
    }

    /// Evict user contexts idle past their TTL. Driven by a background task.
    pub fn sweep_contexts(&self) {
        let now = Instant::now();
        self.inner
            .lock()
            .contexts
            .retain(|_, slot| now.duration_since(slot.last_used) < CONTEXT_TTL);
    }
}

impl<P: LocalPassage> Default for PassageStore<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: LocalPassage> crate::msg::PassageSync for PassageStore<P> {
    fn sync_passages(&self, passages: Vec<Passage>) -> anyhow::Result<()> {
        PassageStore::sync_passages(self, passages)
    }

    fn manager_passage(&self) -> Option<Passage> {
        PassageStore::manager_passage(self)
    }
}

#[cfg(test)]
mod tests {
    use crate::passage::InboundArg;

    use super::*;

    /// Minimal localized passage for store-level tests.
    struct PlainPassage {
        passage: Passage,
        hash: String,
    }

    impl LocalPassage for PlainPassage {
        fn localize(mut passage: Passage) -> anyhow::Result<Self> {
            if passage.manager {
                passage.inbound.password = crate::passage::generate_secret(21);
            }
            let hash = passage.argument_hash();
            Ok(PlainPassage { passage, hash })
        }

        fn passage(&self) -> &Passage {
            &self.passage
        }

        fn argument_hash(&self) -> &str {
            &self.hash
        }
    }

    fn user(tag: &str) -> Passage {
        Passage {
            manager: false,
            inbound: InboundArg {
                protocol: "shadowsocks".to_owned(),
                method: "aes-128-gcm".to_owned(),
                password: tag.to_owned(),
                ..Default::default()
            },
            out: None,
        }
    }

    fn manager() -> Passage {
        Passage {
            manager: true,
            ..Default::default()
        }
    }

    fn store_with_manager() -> PassageStore<PlainPassage> {
        let store = PassageStore::new();
        store.add_passages(vec![manager()]).expect("add manager");
        store
    }

    #[test]
    fn sync_is_a_diff_and_retains_manager() {
        // S5: [M]; add [A,B] -> [M,A,B]; sync [A,C] -> [M,A,C].
        let store = store_with_manager();
        store.add_passages(vec![user("A"), user("B")]).expect("add");
        assert_eq!(store.passages().len(), 3);

        store.sync_passages(vec![user("A"), user("C")]).expect("sync");
        let passages = store.passages();
        assert_eq!(passages.len(), 3);
        assert!(passages.iter().any(|p| p.manager));
        assert!(passages.iter().any(|p| p.inbound.password == "A"));
        assert!(passages.iter().any(|p| p.inbound.password == "C"));
        assert!(!passages.iter().any(|p| p.inbound.password == "B"));
    }

    #[test]
    fn manager_secret_is_regenerated_locally() {
        let store = store_with_manager();
        let stored = store.manager_passage().expect("manager present");
        assert_eq!(stored.inbound.password.len(), 21);

        // A new manager replaces the old one.
        store.add_passages(vec![manager()]).expect("replace manager");
        let replaced = store.manager_passage().expect("manager present");
        assert_ne!(replaced.inbound.password, stored.inbound.password);
        assert_eq!(store.passages().iter().filter(|p| p.manager).count(), 1);
    }

    #[test]
    fn remove_skips_manager_unless_asked() {
        let store = store_with_manager();
        let stored = store.manager_passage().expect("manager present");
        store.remove_passages(&[stored.clone()], false);
        assert!(store.manager_passage().is_some());
        store.remove_passages(&[stored], true);
        assert!(store.manager_passage().is_none());
    }

    #[tokio::test]
    async fn context_reflects_mutations() {
        let store = store_with_manager();
        store.add_passages(vec![user("A"), user("B")]).expect("add");
        let ip: IpAddr = "192.0.2.7".parse().expect("test address");
        let ctx = store.user_context(ip);
        assert_eq!(ctx.snapshot_hashes().len(), 3);

        store.add_passages(vec![user("C")]).expect("add");
        assert_eq!(ctx.snapshot_hashes().len(), 4);

        store.remove_passages(&[user("B")], false);
        assert_eq!(ctx.snapshot_hashes().len(), 3);
    }

    #[tokio::test]
    async fn auth_promotes_hit_and_skips_removed() {
        let store = store_with_manager();
        store.add_passages(vec![user("A"), user("B")]).expect("add");
        let ip: IpAddr = "192.0.2.8".parse().expect("test address");
        let ctx = store.user_context(ip);

        let hash_b = user("B").argument_hash();
        let (hit, ()) = ctx
            .auth(|p| (p.passage().inbound.password == "B").then_some(()))
            .expect("B authenticates");
        assert_eq!(hit.argument_hash(), hash_b);
        assert_eq!(ctx.snapshot_hashes().first(), Some(&hash_b));

        // S6: after B is synced away, the same probe fails.
        store
            .sync_passages(vec![user("A")])
            .expect("sync");
        assert!(ctx
            .auth(|p| (p.passage().inbound.password == "B").then_some(()))
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn contexts_expire_after_idle_ttl() {
        let store = store_with_manager();
        let ip: IpAddr = "192.0.2.9".parse().expect("test address");
        let ctx = store.user_context(ip);
        tokio::time::advance(CONTEXT_TTL + Duration::from_secs(1)).await;
        store.sweep_contexts();
        let fresh = store.user_context(ip);
        assert!(!Arc::ptr_eq(&ctx, &fresh));
    }
}
