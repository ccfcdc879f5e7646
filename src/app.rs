use std::time::Duration;

use futures::{Stream, StreamExt};
use kubernetes::{Informer, ListWatch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::signal::SignalTo;

/// How long in-flight work may take once a shutdown was requested.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How the informer came to a stop.
#[derive(Debug, PartialEq, Eq)]
pub enum Stopped {
    /// Everything returned within the grace period
    Graceful,
    /// The grace period passed, remaining work was dropped
    TimedOut,
    /// Quit, or a second signal during the grace period
    Forced,
    /// The informer returned on its own, without any signal
    Finished,
}

/// Run `informer` until a signal arrives, then stop it.
///
/// A `Shutdown` cancels the informer and waits up to `grace` for it to
/// return, a second signal or a `Quit` stops waiting immediately.
pub async fn serve<L, S>(informer: Informer<L>, mut signals: S, grace: Duration) -> Stopped
where
    L: ListWatch + 'static,
    S: Stream<Item = SignalTo> + Unpin,
{
    let shutdown = CancellationToken::new();
    let mut task = tokio::spawn(informer.run(shutdown.clone()));

    // a closed signal stream leaves the informer running
    let signal = tokio::select! {
        Some(signal) = signals.next() => signal,
        result = &mut task => {
            if let Err(err) = result {
                error!(message = "informer task failed", %err);
            }

            return Stopped::Finished;
        }
    };

    shutdown.cancel();

    match signal {
        SignalTo::Shutdown => {
            info!(message = "Shutdown signal received", grace = ?grace);

            tokio::select! {
                result = &mut task => {
                    if let Err(err) = result {
                        error!(message = "informer task failed", %err);
                    }

                    Stopped::Graceful
                }
                _ = tokio::time::sleep(grace) => {
                    warn!(message = "grace period exceeded, stop now", grace = ?grace);
                    task.abort();
                    Stopped::TimedOut
                }
                Some(_) = signals.next() => {
                    info!(message = "second signal received, stop now");
                    task.abort();
                    Stopped::Forced
                }
            }
        }
        SignalTo::Quit => {
            info!(message = "Quit signal received");
            task.abort();
            Stopped::Forced
        }
    }
}
