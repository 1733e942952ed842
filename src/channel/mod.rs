//! Typed publish/subscribe contract between the orchestrator, the agents
//! and the pipeline engines.
//!
//! Delivery is at-least-once. Every handler must be idempotent on
//! [`EventId`]; [`ProcessedEvents`] is the bookkeeping for that.

mod dedup;
mod event;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::actors::ActorHandle;
use crate::Result;

pub use dedup::ProcessedEvents;
pub use event::{Event, EventId, PipelineCommand, PlatformEvent};
pub use memory::InMemoryEventChannel;

/// Well-known topic names.
pub mod topics {
    pub const SCHEDULE: &str = "schedule.events";
    pub const DISCOVERY: &str = "discovery.events";
    pub const SCHEMA: &str = "schema.events";
    pub const MAPPING: &str = "mapping.events";
    pub const COORDINATION: &str = "coordination.events";
    pub const PIPELINE_CONTROL: &str = "pipeline.control";
    pub const PIPELINE_EVENTS: &str = "pipeline.events";
    pub const PIPELINE_ERRORS: &str = "pipeline.errors";

    /// Topics the orchestrator turns into tasks.
    pub const INGEST: [&str; 4] = [SCHEDULE, DISCOVERY, SCHEMA, PIPELINE_ERRORS];
}

/// Receiving side of a subscription.
pub type Subscription = mpsc::UnboundedReceiver<Event>;

/// Transport-agnostic publish/subscribe.
#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Publish an event on its topic.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to every event published on `topic` from now on.
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}

/// Consumer of events delivered by [`spawn_handler`].
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<()>;
}

/// Merge the subscriptions of several topics into one receiver.
///
/// Events of one topic keep their publish order; there is no ordering
/// across topics. Forwarding stops when `cancel` fires.
pub async fn subscribe_all(
    channel: &dyn EventChannel,
    topics: &[&str],
    cancel: &CancellationToken,
) -> Result<Subscription> {
    let (merged_tx, merged_rx) = mpsc::unbounded_channel::<Event>();
    for topic in topics {
        let mut subscription = channel.subscribe(topic).await?;
        let tx = merged_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = subscription.recv() => match next {
                        Some(event) => {
                            if tx.send(event).is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });
    }
    Ok(merged_rx)
}

/// Run `handler` over every event published on `topics` until shut down.
///
/// Handler errors are logged and do not stop the loop.
pub async fn spawn_handler(
    channel: Arc<dyn EventChannel>,
    topics: &[&str],
    handler: Arc<dyn EventHandler>,
    name: &str,
) -> Result<ActorHandle> {
    let cancel = CancellationToken::new();
    let mut events = subscribe_all(channel.as_ref(), topics, &cancel).await?;

    let name = name.to_string();
    let loop_cancel = cancel.clone();
    debug!(handler = %name, ?topics, "spawning event handler");
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = loop_cancel.cancelled() => {
                    debug!(handler = %name, "event handler cancelled");
                    break;
                }
                next = events.recv() => {
                    let Some(event) = next else {
                        debug!(handler = %name, "all subscriptions closed");
                        break;
                    };
                    if let Err(e) = handler.handle(&event).await {
                        warn!(
                            handler = %name,
                            event_id = %event.id,
                            event_type = event.body.event_type(),
                            error = %e,
                            "event handler failed"
                        );
                    }
                }
            }
        }
    });

    Ok(ActorHandle::new(cancel, join))
}
