//! Pipeline execution: the lifecycle state machine, record transformations,
//! source/destination seams and the batch and stream engines.

pub mod batch;
pub mod controller;
pub mod io;
pub mod state;
pub mod stream;
pub mod transform;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::channel::{topics, Event, EventChannel, PlatformEvent};
use crate::core::{ExecutionId, PipelineId, PipelineStatus, PipelineType};
use crate::healing::PipelineError;
use crate::Error;

pub use batch::{BatchEngine, BatchReport};
pub use controller::PipelineController;
pub use io::{Destination, Source, StreamEvent, StreamSink, StreamSource};
pub use state::{PipelineStateMachine, SharedMachine, Transition};
pub use stream::{PartitionStats, StreamEngine, StreamReport};
pub use transform::{
    apply_all, Comparison, Condition, ExecutionPlan, FieldType, Operation, Record, RecordFailure,
    Transformation,
};

const SOURCE: &str = "pipeline";

/// Metrics recorded when an execution finishes without a structural failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub execution_id: ExecutionId,
    /// Records delivered to the destination.
    pub row_count: u64,
    pub failed_count: u64,
    pub duration_ms: u64,
    pub status: PipelineStatus,
}

pub(crate) async fn announce_completion(
    channel: &dyn EventChannel,
    pipeline_id: &PipelineId,
    metrics: &ExecutionMetrics,
) {
    let event = Event::new(
        topics::PIPELINE_EVENTS,
        SOURCE,
        PlatformEvent::ExecutionCompleted {
            pipeline_id: pipeline_id.clone(),
            execution_id: metrics.execution_id,
            metrics: metrics.clone(),
        },
    );
    if let Err(e) = channel.publish(event).await {
        warn!(pipeline = %pipeline_id, error = %e, "failed to publish execution completion");
    }
}

/// Hand a structural failure to the self-healing loop.
pub(crate) async fn announce_failure(
    channel: &dyn EventChannel,
    pipeline_id: &PipelineId,
    pipeline_type: PipelineType,
    execution_id: ExecutionId,
    error: &Error,
) {
    let failure = PipelineError::from_error(pipeline_id.clone(), pipeline_type, execution_id, error);
    let event = Event::new(
        topics::PIPELINE_ERRORS,
        SOURCE,
        PlatformEvent::PipelineFailed { error: failure },
    )
    .with_correlation(execution_id.to_string());
    if let Err(e) = channel.publish(event).await {
        warn!(pipeline = %pipeline_id, error = %e, "failed to publish pipeline failure");
    }
}
