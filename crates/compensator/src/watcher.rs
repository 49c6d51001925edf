//! Event Watcher
//!
//! Turns the cluster-wide `core/v1` Event stream into blocked-node triggers.
//! Initial-list and change notifications arrive as the same applied object,
//! so a redelivered event simply triggers the (idempotent) downstream again.

use std::fmt::Display;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Event;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::DisruptionSignal;

/// Receives the name of every node reported as blocking a disruption
#[async_trait]
pub trait NodeTriggerHandler: Send + Sync {
    async fn on_blocked_node(&self, node: &str);
}

/// Why the watch loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchExit {
    /// The shutdown token was cancelled
    Shutdown,
    /// The underlying stream ended on its own
    StreamEnded,
}

/// Field selector limiting the watch to `reason` events about nodes
pub fn event_field_selector(reason: &str) -> String {
    format!("reason={reason},involvedObject.kind=Node")
}

/// Live stream of `reason` Events about nodes in all namespaces, reconnecting
/// with backoff
pub fn event_stream(
    client: Client,
    reason: &str,
) -> impl Stream<Item = Result<Event, watcher::Error>> + Send {
    let events: Api<Event> = Api::all(client);
    let config = watcher::Config::default().fields(&event_field_selector(reason));
    watcher(events, config)
        .default_backoff()
        .applied_objects()
}

/// Filters events down to blocked-node triggers
#[derive(Debug, Clone)]
pub struct EventWatcher {
    reason: String,
}

impl EventWatcher {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Node named by `event` if it reports a blocked disruption
    pub fn trigger_for(&self, event: &Event) -> Option<String> {
        let signal = DisruptionSignal::from_event(event);
        let node = signal.blocked_node(&self.reason)?.to_string();
        info!(
            node = %node,
            observed_at = ?signal.observed_at,
            "Disruption blocked on node"
        );
        Some(node)
    }

    /// Drive `events` until the stream ends or `shutdown` is cancelled
    pub async fn run<S, E, H>(&self, events: S, handler: &H, shutdown: CancellationToken) -> WatchExit
    where
        S: Stream<Item = Result<Event, E>>,
        E: Display,
        H: NodeTriggerHandler + ?Sized,
    {
        info!(reason = %self.reason, "Starting event watcher");
        let mut events = std::pin::pin!(events);

        loop {
            let next = tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Event watcher shutting down");
                    return WatchExit::Shutdown;
                }
                next = events.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    if let Some(node) = self.trigger_for(&event) {
                        handler.on_blocked_node(&node).await;
                    } else {
                        debug!(
                            reason = event.reason.as_deref().unwrap_or_default(),
                            "Ignoring event"
                        );
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Event stream error, watch will be re-established");
                }
                None => {
                    warn!("Event stream ended");
                    return WatchExit::StreamEnded;
                }
            }
        }
    }
}
