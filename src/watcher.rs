// System
use std::sync::Arc;
use std::time::Duration;

// Third Party
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// Local
use crate::metadata::{InstanceSnapshot, MetadataError, MetadataSource};

const UPDATE_CHANNEL_CAPACITY: usize = 16;
const ERROR_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, thiserror::Error)]
#[error("polling interval must be greater than zero")]
pub struct InvalidIntervalError;

/// Receiving halves of the watcher's two event streams.
///
/// `updates` carries a snapshot for every observed change, in fetch order.
/// `errors` carries fetch failures. There is no ordering guarantee between
/// the two streams. Both close once the watcher stops.
pub struct WatchStreams {
    pub updates: Receiver<InstanceSnapshot>,
    pub errors: Receiver<MetadataError>,
}

/// Polls a [`MetadataSource`] at a fixed cadence and reports deltas.
///
/// A change event is emitted iff a successful fetch differs by value from
/// the last successful fetch. Fetch failures go to the error stream and do
/// not touch the comparison baseline, so a transient failure followed by a
/// recovery to the same prior values is not reported as a change. The very
/// first successful fetch has no baseline and always emits.
pub struct InstanceWatcher {
    source: Arc<dyn MetadataSource>,
    interval: Duration,
    updates_tx: Sender<InstanceSnapshot>,
    errors_tx: Sender<MetadataError>,
}

impl InstanceWatcher {
    pub fn new(
        source: Arc<dyn MetadataSource>,
        interval: Duration,
    ) -> Result<(Self, WatchStreams), InvalidIntervalError> {
        if interval.is_zero() {
            return Err(InvalidIntervalError);
        }
        let (updates_tx, updates) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let (errors_tx, errors) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        Ok((
            Self {
                source,
                interval,
                updates_tx,
                errors_tx,
            },
            WatchStreams { updates, errors },
        ))
    }

    /// Run the polling loop until `token` is cancelled.
    ///
    /// The first tick fires immediately. Consumes the watcher: once stopped
    /// it cannot be restarted, a fresh instance is required to watch again.
    pub async fn start(self, token: CancellationToken) {
        info!("Starting instance watcher, polling every {:?}", self.interval);
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen: Option<InstanceSnapshot> = None;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // An in-flight fetch is allowed to finish, but its result is
            // discarded if cancellation wins the race.
            let result = tokio::select! {
                _ = token.cancelled() => break,
                result = self.source.fetch() => result,
            };

            match result {
                Ok(snapshot) => {
                    if last_seen.as_ref() == Some(&snapshot) {
                        continue;
                    }
                    let delivered = tokio::select! {
                        _ = token.cancelled() => break,
                        sent = self.updates_tx.send(snapshot.clone()) => sent.is_ok(),
                    };
                    if !delivered {
                        // Consumer went away; nothing left to report to.
                        break;
                    }
                    last_seen = Some(snapshot);
                }
                Err(error) => {
                    // Never block the poll loop on the error stream: if the
                    // buffer is full the newest error is dropped.
                    match self.errors_tx.try_send(error) {
                        Ok(()) => {}
                        Err(TrySendError::Full(error)) => {
                            debug!("Error channel full, dropping fetch error: {}", error);
                        }
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
            }
        }
        debug!("Instance watcher stopped");
    }
}
