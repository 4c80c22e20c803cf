//! Training sample capture for correction events.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::schema::{CorrectionEvent, TrainingSample};
use crate::store::TrainingSink;

/// Best-effort recorder: a sink failure is logged and never reaches the caller.
#[derive(Clone)]
pub struct TrainingRecorder {
    sink: Arc<dyn TrainingSink>,
}

impl TrainingRecorder {
    pub fn new(sink: Arc<dyn TrainingSink>) -> Self {
        Self { sink }
    }

    /// Append a sample for `event`. Returns whether a sample was stored.
    pub async fn record(&self, event: &CorrectionEvent) -> bool {
        if event.changed_keys.is_empty() {
            debug!("Correction {} changed nothing; no training sample", event.id);
            return false;
        }

        let sample = TrainingSample::from(event);
        match self.sink.append(&sample).await {
            Ok(()) => {
                debug!("Recorded training sample for {}", event.id);
                true
            }
            Err(e) => {
                warn!("Failed to record training sample for {}: {}", event.id, e);
                false
            }
        }
    }
}
