//! Time-based trigger for batch pipelines.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::{topics, Event, EventChannel, PlatformEvent};
use crate::core::PipelineId;

use super::ActorHandle;

const SOURCE: &str = "scheduler";

/// Actor that publishes a `ScheduleTick` for one pipeline on a fixed period.
pub struct ScheduleActor {
    channel: Arc<dyn EventChannel>,
    pipeline_id: PipelineId,
    period: Duration,
}

impl ScheduleActor {
    pub fn new(channel: Arc<dyn EventChannel>, pipeline_id: PipelineId, period: Duration) -> Self {
        Self {
            channel,
            pipeline_id,
            period,
        }
    }

    pub fn spawn(self) -> ActorHandle {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        debug!(pipeline = %self.pipeline_id, period = ?self.period, "ScheduleActor::spawn");

        let join = tokio::spawn(async move {
            // First tick one period from now, not immediately.
            let mut ticker = interval_at(Instant::now() + self.period, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        debug!(pipeline = %self.pipeline_id, "ScheduleActor cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let event = Event::new(
                            topics::SCHEDULE,
                            SOURCE,
                            PlatformEvent::ScheduleTick {
                                pipeline_id: self.pipeline_id.clone(),
                            },
                        );
                        if let Err(e) = self.channel.publish(event).await {
                            warn!(pipeline = %self.pipeline_id, error = %e, "schedule tick not published");
                        }
                    }
                }
            }
        });

        ActorHandle::new(cancel, join)
    }
}
