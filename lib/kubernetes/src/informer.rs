use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::controller::Controller;
use crate::handler::{EventHandler, Registry};
use crate::queue::DeltaFifo;
use crate::reflector::{Reflector, default_backoff};
use crate::source::ListWatch;
use crate::store::Store;

/// A local, continuously updated replica of one resource type, with
/// callbacks for every change.
///
/// ```no_run
/// # async fn doc() -> Result<(), kubernetes::Error> {
/// use kubernetes::{Api, Client, HandlerFuncs, Informer};
/// use tokio_util::sync::CancellationToken;
///
/// let client = Client::infer()?;
/// let api = Api::all(client, "deployments.v1.apps".parse().unwrap());
///
/// let mut informer = Informer::new(api);
/// informer.add_handler(HandlerFuncs::new().on_add(|obj| {
///     println!("{} added", obj.key());
///     Ok(())
/// }));
///
/// informer.run(CancellationToken::new()).await;
/// # Ok(())
/// # }
/// ```
pub struct Informer<L> {
    source: L,
    store: Store,
    queue: Arc<DeltaFifo>,
    registry: Registry,
    resync_period: Duration,
    backoff: ExponentialBackoff,
}

impl<L: ListWatch> Informer<L> {
    pub fn new(source: L) -> Self {
        let store = Store::new();
        let queue = Arc::new(DeltaFifo::new(store.clone()));

        Informer {
            source,
            store,
            queue,
            registry: Registry::new(),
            resync_period: Duration::ZERO,
            backoff: default_backoff(),
        }
    }

    /// Deliver every cached object again as an update this often, zero
    /// disables resyncing.
    pub fn resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    pub fn backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn add_handler(&mut self, handler: impl EventHandler + 'static) -> &mut Self {
        self.registry.register(handler);
        self
    }

    /// A handle to the cache, it stays valid after `run` returns.
    pub fn store(&self) -> Store {
        self.store.clone()
    }

    /// Run the reflector and the controller until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let Informer {
            source,
            store,
            queue,
            registry,
            resync_period,
            backoff,
        } = self;

        info!(
            message = "informer started",
            handlers = registry.len(),
            resync_period = ?resync_period,
        );

        let reflector = Reflector::new(source, Arc::clone(&queue))
            .resync_period(resync_period)
            .backoff(backoff);
        let controller = Controller::new(queue, store, registry);

        tokio::join!(
            reflector.run(shutdown.clone()),
            controller.run(shutdown)
        );

        info!(message = "informer stopped");
    }
}
