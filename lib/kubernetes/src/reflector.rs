use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use futures::StreamExt;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::WatchEvent;
use crate::queue::{DeltaFifo, DeltaKind};
use crate::resource::compare_resource_versions;
use crate::source::ListWatch;

/// The back-off used between failed lists and watches unless another one is
/// configured: 500ms, 1s, 2s, ... up to 30s, each spread by 20%.
pub fn default_backoff() -> ExponentialBackoff {
    ExponentialBackoff::from_millis(2)
        .factor(250)
        .max_delay(Duration::from_secs(30))
        .jitter(0.2)
}

enum State {
    /// A full list is needed, at startup or when the cursor went stale.
    Listing,

    /// Resume watching from the cursor.
    Watching { resource_version: String },
}

/// Keeps the queue in sync with the API server.
///
/// It lists everything once, then watches from the resource version of the
/// list. Watches that end are resumed from the last seen resource version,
/// an expired resource version or an `ERROR` event leads to another full
/// list.
pub struct Reflector<L> {
    source: L,
    queue: Arc<DeltaFifo>,
    resync_period: Duration,
    backoff: ExponentialBackoff,
}

impl<L: ListWatch> Reflector<L> {
    pub fn new(source: L, queue: Arc<DeltaFifo>) -> Self {
        Reflector {
            source,
            queue,
            resync_period: Duration::ZERO,
            backoff: default_backoff(),
        }
    }

    /// Re-queue every cached object this often, zero disables resyncing.
    pub fn resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    pub fn backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// List and watch until `shutdown` is cancelled. Errors are retried
    /// forever.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let resync = resync(Arc::clone(&self.queue), self.resync_period);

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {},
            _ = self.list_and_watch() => {},
            _ = resync => {},
        }

        debug!(message = "reflector stopped");
    }

    async fn list_and_watch(&mut self) {
        let mut state = State::Listing;

        loop {
            state = match state {
                State::Listing => self.relist().await,
                State::Watching { resource_version } => self.watch(resource_version).await,
            };
        }
    }

    async fn relist(&mut self) -> State {
        match self.source.list().await {
            Ok(list) => {
                let resource_version = list
                    .metadata
                    .resource_version
                    .filter(|rv| !rv.is_empty())
                    .unwrap_or_else(|| "0".to_string());

                info!(
                    message = "list done",
                    items = list.items.len(),
                    %resource_version,
                );

                self.queue.replace(list.items);
                self.backoff.reset();

                State::Watching { resource_version }
            }
            Err(err) => {
                let delay = self.backoff.next_delay();
                warn!(
                    message = "list failed",
                    %err,
                    attempt = self.backoff.attempts(),
                    ?delay,
                );
                tokio::time::sleep(delay).await;

                State::Listing
            }
        }
    }

    async fn watch(&mut self, resource_version: String) -> State {
        let mut stream = match self.source.watch(&resource_version).await {
            Ok(stream) => stream,
            Err(err) => {
                let delay = self.backoff.next_delay();

                return if err.is_expired() {
                    info!(message = "resource version expired, relist", %resource_version, ?delay);
                    tokio::time::sleep(delay).await;
                    State::Listing
                } else {
                    warn!(
                        message = "start watch failed",
                        %err,
                        attempt = self.backoff.attempts(),
                        ?delay,
                    );
                    tokio::time::sleep(delay).await;
                    State::Watching { resource_version }
                };
            }
        };

        debug!(message = "watch started", %resource_version);

        let mut cursor = resource_version;
        let mut received = 0usize;

        while let Some(result) = stream.next().await {
            let (kind, obj) = match result {
                Ok(WatchEvent::Added(obj)) => (DeltaKind::Added, obj),
                Ok(WatchEvent::Modified(obj)) => (DeltaKind::Updated, obj),
                Ok(WatchEvent::Deleted(obj)) => (DeltaKind::Deleted, obj),
                Ok(WatchEvent::Bookmark(bookmark)) => {
                    advance(&mut cursor, &bookmark.metadata.resource_version);
                    received += 1;
                    continue;
                }
                Ok(WatchEvent::Error(resp)) => {
                    // the server gave up on this watch, the cursor can not be
                    // trusted anymore
                    let delay = self.backoff.next_delay();
                    if resp.is_expired() {
                        info!(message = "watch expired, relist", reason = %resp.reason, ?delay);
                    } else {
                        warn!(
                            message = "watch error event, relist",
                            code = resp.code,
                            reason = %resp.reason,
                            msg = %resp.message,
                            attempt = self.backoff.attempts(),
                            ?delay,
                        );
                    }

                    tokio::time::sleep(delay).await;
                    return State::Listing;
                }
                Err(err) if err.is_malformed() => {
                    warn!(message = "skip malformed watch event", %err);
                    continue;
                }
                Err(err) if err.is_expired() => {
                    let delay = self.backoff.next_delay();
                    info!(message = "watch expired, relist", %err, ?delay);
                    tokio::time::sleep(delay).await;
                    return State::Listing;
                }
                Err(err) => {
                    warn!(message = "watch stream failed", %err);
                    break;
                }
            };

            if let Some(rv) = obj.resource_version() {
                advance(&mut cursor, rv);
            }
            self.queue.add(kind, obj);
            received += 1;
        }

        if received > 0 {
            self.backoff.reset();
        }

        let delay = self.backoff.next_delay();
        debug!(message = "watch closed, resume", received, resource_version = %cursor, ?delay);
        tokio::time::sleep(delay).await;

        State::Watching {
            resource_version: cursor,
        }
    }
}

/// Move the cursor forward, never backward.
fn advance(cursor: &mut String, resource_version: &str) {
    if compare_resource_versions(resource_version, cursor) != Some(Ordering::Less) {
        *cursor = resource_version.to_string();
    }
}

async fn resync(queue: Arc<DeltaFifo>, period: Duration) {
    if period.is_zero() {
        return std::future::pending().await;
    }

    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let queued = queue.resync();
        debug!(message = "resync", queued);
    }
}
