use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::resource::{DynamicObject, ObjectKey};
use crate::store::Store;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
    /// Produced by a relist or a resync, not by a change on the server.
    Synced,
}

impl Display for DeltaKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeltaKind::Added => "added",
            DeltaKind::Updated => "updated",
            DeltaKind::Deleted => "deleted",
            DeltaKind::Synced => "synced",
        };

        f.write_str(s)
    }
}

/// One observed transition of an object.
#[derive(Clone, Debug)]
pub struct Delta {
    pub kind: DeltaKind,
    pub object: Arc<DynamicObject>,
}

impl Delta {
    pub fn new(kind: DeltaKind, object: impl Into<Arc<DynamicObject>>) -> Self {
        Delta {
            kind,
            object: object.into(),
        }
    }
}

#[derive(Default)]
struct Inner {
    items: HashMap<ObjectKey, Vec<Delta>>,
    // keys in the order they became non-empty, every key in here has deltas
    order: VecDeque<ObjectKey>,
    // key and last state of the batch handed out by the latest `pop`
    processing: Option<(ObjectKey, Arc<DynamicObject>)>,
    closed: bool,
}

impl Inner {
    fn push(&mut self, store: &Store, key: ObjectKey, delta: Delta) {
        let Some(deltas) = self.items.get_mut(&key) else {
            self.order.push_back(key.clone());
            self.items.insert(key, vec![delta]);
            return;
        };

        if delta.kind == DeltaKind::Deleted {
            if deltas.last().is_some_and(|last| last.kind == DeltaKind::Deleted) {
                return;
            }

            // Nothing downstream has seen this object, so an add followed by a
            // delete can vanish together.
            let delivered = store.get(&key).is_some()
                || self.processing.as_ref().is_some_and(|(k, _)| k == &key)
                || deltas.iter().any(|d| d.kind == DeltaKind::Deleted);
            if !delivered {
                self.items.remove(&key);
                self.order.retain(|k| k != &key);
                return;
            }
        }

        deltas.push(delta);
    }

    fn pending_object(&self, key: &ObjectKey) -> Option<Arc<DynamicObject>> {
        self.items
            .get(key)
            .and_then(|deltas| deltas.last())
            .map(|delta| Arc::clone(&delta.object))
    }
}

/// A FIFO of per-key delta sequences.
///
/// Keys come out in the order they first got a pending delta, each `pop`
/// hands out everything queued for one key. Adds for a key that is being
/// processed start a new sequence behind everything else.
///
/// There must be a single consumer. The batch returned by the last `pop` is
/// considered in flight until the next `pop`.
pub struct DeltaFifo {
    inner: Mutex<Inner>,
    notify: Notify,
    known: Store,
}

impl DeltaFifo {
    /// `known` is the store the consumer applies deltas to, it tells the queue
    /// which objects have already been delivered.
    pub fn new(known: Store) -> Self {
        DeltaFifo {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            known,
        }
    }

    pub fn add(&self, kind: DeltaKind, object: impl Into<Arc<DynamicObject>>) {
        let delta = Delta::new(kind, object);
        let key = delta.object.key();

        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }

            inner.push(&self.known, key, delta);
        }

        self.notify.notify_one();
    }

    /// Queue the result of a full list. Every listed object gets a `Synced`
    /// delta, every object the consumer knows about, or that is still
    /// queued, but is missing from the list gets a `Deleted` delta with its
    /// last known state.
    pub fn replace(&self, objects: Vec<DynamicObject>) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }

            let mut listed = HashSet::with_capacity(objects.len());
            for obj in objects {
                let key = obj.key();
                listed.insert(key.clone());
                inner.push(&self.known, key, Delta::new(DeltaKind::Synced, obj));
            }

            let mut gone = self
                .known
                .list()
                .into_iter()
                .filter(|obj| !listed.contains(&obj.key()))
                .map(|obj| (obj.key(), obj))
                .collect::<HashMap<_, _>>();

            if let Some((key, obj)) = &inner.processing
                && !listed.contains(key)
            {
                gone.entry(key.clone()).or_insert_with(|| Arc::clone(obj));
            }

            let queued = inner
                .order
                .iter()
                .filter(|key| !listed.contains(*key) && !gone.contains_key(*key))
                .cloned()
                .collect::<Vec<_>>();
            for key in queued {
                if let Some(obj) = inner.pending_object(&key) {
                    gone.insert(key, obj);
                }
            }

            for (key, obj) in gone {
                inner.push(&self.known, key, Delta::new(DeltaKind::Deleted, obj));
            }
        }

        self.notify.notify_one();
    }

    /// Queue a `Synced` delta for every known object, except those which
    /// already have something pending.
    pub fn resync(&self) -> usize {
        let mut count = 0;

        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return 0;
            }

            for obj in self.known.list() {
                let key = obj.key();
                if inner.items.contains_key(&key) {
                    continue;
                }

                inner.push(&self.known, key, Delta::new(DeltaKind::Synced, obj));
                count += 1;
            }
        }

        if count > 0 {
            self.notify.notify_one();
        }

        count
    }

    /// Wait for the next key with pending deltas and take all of them.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<(ObjectKey, Vec<Delta>)> {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            // register before looking, so an add between the check and the
            // await is not missed
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                inner.processing = None;

                while let Some(key) = inner.order.pop_front() {
                    if let Some(deltas) = inner.items.remove(&key) {
                        inner.processing = deltas
                            .last()
                            .filter(|delta| delta.kind != DeltaKind::Deleted)
                            .map(|delta| (key.clone(), Arc::clone(&delta.object)));

                        return Some((key, deltas));
                    }
                }

                if inner.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Stop accepting deltas, a waiting `pop` returns `None` once the queue
    /// is drained.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Number of keys with pending deltas.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::object;

    fn kinds(deltas: &[Delta]) -> Vec<DeltaKind> {
        deltas.iter().map(|delta| delta.kind).collect()
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new(Some("default"), name)
    }

    #[tokio::test]
    async fn fifo_across_keys() {
        let queue = DeltaFifo::new(Store::new());

        queue.add(DeltaKind::Added, object("default", "a", "1"));
        queue.add(DeltaKind::Added, object("default", "b", "2"));
        queue.add(DeltaKind::Updated, object("default", "a", "3"));

        let (first, deltas) = queue.pop().await.unwrap();
        assert_eq!(first, key("a"));
        assert_eq!(kinds(&deltas), vec![DeltaKind::Added, DeltaKind::Updated]);
        assert_eq!(deltas[1].object.resource_version(), Some("3"));

        let (second, deltas) = queue.pop().await.unwrap();
        assert_eq!(second, key("b"));
        assert_eq!(kinds(&deltas), vec![DeltaKind::Added]);

        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn adds_during_processing_are_kept() {
        let queue = DeltaFifo::new(Store::new());

        queue.add(DeltaKind::Added, object("default", "a", "1"));
        queue.add(DeltaKind::Added, object("default", "b", "1"));
        let (first, _) = queue.pop().await.unwrap();
        assert_eq!(first, key("a"));

        // "a" is in flight, a new change goes behind "b"
        queue.add(DeltaKind::Updated, object("default", "a", "2"));

        assert_eq!(queue.pop().await.unwrap().0, key("b"));
        let (again, deltas) = queue.pop().await.unwrap();
        assert_eq!(again, key("a"));
        assert_eq!(kinds(&deltas), vec![DeltaKind::Updated]);
    }

    #[tokio::test]
    async fn collapse_undelivered_add_and_delete() {
        let queue = DeltaFifo::new(Store::new());

        queue.add(DeltaKind::Added, object("default", "a", "1"));
        queue.add(DeltaKind::Updated, object("default", "a", "2"));
        queue.add(DeltaKind::Added, object("default", "b", "1"));
        queue.add(DeltaKind::Deleted, object("default", "a", "3"));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().await.unwrap().0, key("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn keep_delete_of_delivered_object() {
        let store = Store::new();
        store.update(Arc::new(object("default", "a", "1")));
        let queue = DeltaFifo::new(store);

        queue.add(DeltaKind::Updated, object("default", "a", "2"));
        queue.add(DeltaKind::Deleted, object("default", "a", "2"));
        queue.add(DeltaKind::Deleted, object("default", "a", "2"));

        let (_, deltas) = queue.pop().await.unwrap();
        assert_eq!(kinds(&deltas), vec![DeltaKind::Updated, DeltaKind::Deleted]);
    }

    #[tokio::test]
    async fn keep_delete_of_in_flight_object() {
        let queue = DeltaFifo::new(Store::new());

        queue.add(DeltaKind::Added, object("default", "a", "1"));
        let _in_flight = queue.pop().await.unwrap();

        queue.add(DeltaKind::Updated, object("default", "a", "2"));
        queue.add(DeltaKind::Deleted, object("default", "a", "2"));

        let (_, deltas) = queue.pop().await.unwrap();
        assert_eq!(kinds(&deltas), vec![DeltaKind::Updated, DeltaKind::Deleted]);
    }

    #[tokio::test]
    async fn lone_delete_is_queued() {
        let queue = DeltaFifo::new(Store::new());

        queue.add(DeltaKind::Deleted, object("default", "ghost", "5"));

        let (key, deltas) = queue.pop().await.unwrap();
        assert_eq!(key.as_str(), "default/ghost");
        assert_eq!(kinds(&deltas), vec![DeltaKind::Deleted]);
    }

    #[tokio::test]
    async fn replace_syncs_listed_and_deletes_missing() {
        let store = Store::new();
        store.update(Arc::new(object("default", "stale", "1")));
        store.update(Arc::new(object("default", "web", "1")));
        let queue = DeltaFifo::new(store);

        queue.replace(vec![object("default", "web", "2"), object("default", "new", "2")]);

        let mut got = Vec::new();
        while !queue.is_empty() {
            let (key, deltas) = queue.pop().await.unwrap();
            got.push((key.to_string(), kinds(&deltas)));
        }
        got.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(
            got,
            vec![
                ("default/new".to_string(), vec![DeltaKind::Synced]),
                ("default/stale".to_string(), vec![DeltaKind::Deleted]),
                ("default/web".to_string(), vec![DeltaKind::Synced]),
            ]
        );
    }

    #[tokio::test]
    async fn replace_drops_queued_objects_missing_from_list() {
        let queue = DeltaFifo::new(Store::new());

        queue.add(DeltaKind::Added, object("default", "gone", "1"));
        queue.replace(vec![object("default", "web", "2")]);

        // the queued add and the synthetic delete cancel out
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().await.unwrap().0, key("web"));
    }

    #[tokio::test]
    async fn resync_skips_pending_keys() {
        let store = Store::new();
        store.update(Arc::new(object("default", "a", "1")));
        store.update(Arc::new(object("default", "b", "1")));
        let queue = DeltaFifo::new(store);

        queue.add(DeltaKind::Updated, object("default", "a", "2"));
        assert_eq!(queue.resync(), 1);

        let mut got = Vec::new();
        while !queue.is_empty() {
            let (key, deltas) = queue.pop().await.unwrap();
            got.push((key.to_string(), kinds(&deltas)));
        }

        assert_eq!(
            got,
            vec![
                ("default/a".to_string(), vec![DeltaKind::Updated]),
                ("default/b".to_string(), vec![DeltaKind::Synced]),
            ]
        );
    }

    #[tokio::test]
    async fn pop_waits_for_add() {
        let queue = Arc::new(DeltaFifo::new(Store::new()));

        let consumer = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.pop().await.map(|(key, _)| key) }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        queue.add(DeltaKind::Added, object("default", "a", "1"));
        assert_eq!(consumer.await.unwrap(), Some(key("a")));
    }

    #[tokio::test]
    async fn close_wakes_waiting_pop() {
        let queue = Arc::new(DeltaFifo::new(Store::new()));

        let consumer = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.pop().await.is_none() }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert!(consumer.await.unwrap());

        queue.add(DeltaKind::Added, object("default", "a", "1"));
        assert!(queue.is_empty());
    }
}
