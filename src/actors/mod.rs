//! Background actors.
//!
//! Each actor is an independent tokio task that talks to the rest of the
//! system only through the event channel. Actors:
//! - Schedule trigger for batch pipelines (ScheduleActor)
//! - Orchestrator ingestion loop (see `Orchestrator::spawn`)
//! - Event handlers (see `channel::spawn_handler`)

pub mod schedule;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use schedule::ScheduleActor;

use crate::{Error, Result};

/// Handle to a running actor, used for graceful shutdown.
pub struct ActorHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl ActorHandle {
    pub fn new(cancel: CancellationToken, join: JoinHandle<()>) -> Self {
        Self { cancel, join }
    }

    /// Signal the actor to shut down gracefully.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the actor's task to exit.
    pub async fn join(self) -> Result<()> {
        self.join.await.map_err(|e| Error::TaskJoin(e.to_string()))
    }

    pub async fn shutdown_and_wait(self) -> Result<()> {
        self.shutdown();
        self.join().await
    }
}
