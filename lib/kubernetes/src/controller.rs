use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::handler::{Notification, Registry};
use crate::queue::{Delta, DeltaFifo, DeltaKind};
use crate::resource::ObjectKey;
use crate::store::Store;

/// Drains the queue, applies every delta to the store and tells the
/// handlers about it.
pub struct Controller {
    queue: Arc<DeltaFifo>,
    store: Store,
    registry: Registry,
}

impl Controller {
    pub fn new(queue: Arc<DeltaFifo>, store: Store, registry: Registry) -> Self {
        Controller {
            queue,
            store,
            registry,
        }
    }

    /// Process deltas until `shutdown` is cancelled or the queue is closed.
    ///
    /// Handlers run on the blocking thread pool, a slow one holds back the
    /// next batch but never the reflector. A batch that was already popped is
    /// always processed completely, the cancellation is only observed while
    /// waiting for the next one.
    pub async fn run(self, shutdown: CancellationToken) {
        let controller = Arc::new(self);

        loop {
            let (key, deltas) = tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                popped = controller.queue.pop() => match popped {
                    Some(popped) => popped,
                    None => break,
                },
            };

            let worker = Arc::clone(&controller);
            if let Err(err) =
                tokio::task::spawn_blocking(move || worker.process(&key, deltas)).await
            {
                error!(message = "process deltas failed", %err);
            }
        }

        debug!(message = "controller stopped");
    }

    /// Apply one batch in order, returns how many notifications were
    /// dispatched.
    pub fn process(&self, key: &ObjectKey, deltas: Vec<Delta>) -> usize {
        let mut dispatched = 0;

        for delta in deltas {
            trace!(message = "process delta", %key, kind = %delta.kind);

            // the store must be up to date before any handler runs
            if let Some(notification) = self.apply(key, delta) {
                self.registry.dispatch(&notification);
                dispatched += 1;
            }
        }

        dispatched
    }

    fn apply(&self, key: &ObjectKey, delta: Delta) -> Option<Notification> {
        match delta.kind {
            DeltaKind::Added | DeltaKind::Updated | DeltaKind::Synced => {
                let new = delta.object;
                let Some(old) = self.store.update(Arc::clone(&new)) else {
                    return Some(Notification::Added(new));
                };

                let replay = delta.kind != DeltaKind::Synced
                    && new.resource_version().is_some()
                    && old.resource_version() == new.resource_version();
                if replay {
                    debug!(
                        message = "skip replayed event",
                        %key,
                        resource_version = new.resource_version(),
                    );
                    return None;
                }

                Some(Notification::Updated { old, new })
            }
            DeltaKind::Deleted => {
                let last = self.store.delete(key).unwrap_or(delta.object);
                Some(Notification::Deleted(last))
            }
        }
    }
}
