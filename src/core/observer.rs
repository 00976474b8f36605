//! Application-facing completion callbacks

use std::sync::Mutex;

use crate::core::types::{FormationOutcome, JoiningOutcome};

/// Completion callbacks invoked by the engine
///
/// Every method has a no-op default so an application only overrides what it
/// cares about. Each formation or joining run invokes exactly one completion
/// callback, successful or not.
pub trait CommissioningObserver: Send + Sync + 'static {
    /// A formation run finished
    fn formation_complete(&self, _outcome: &FormationOutcome) {}

    /// A joining run finished
    fn joining_complete(&self, _outcome: &JoiningOutcome) {}
}

/// Observer that ignores every completion
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl CommissioningObserver for NoopObserver {}

/// Observer that records every completion, for tests and diagnostics
#[derive(Debug, Default)]
pub struct RecordingObserver {
    formations: Mutex<Vec<FormationOutcome>>,
    joinings: Mutex<Vec<JoiningOutcome>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Formation outcomes seen so far
    pub fn formations(&self) -> Vec<FormationOutcome> {
        self.formations.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Joining outcomes seen so far
    pub fn joinings(&self) -> Vec<JoiningOutcome> {
        self.joinings.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl CommissioningObserver for RecordingObserver {
    fn formation_complete(&self, outcome: &FormationOutcome) {
        if let Ok(mut formations) = self.formations.lock() {
            formations.push(*outcome);
        }
    }

    fn joining_complete(&self, outcome: &JoiningOutcome) {
        if let Ok(mut joinings) = self.joinings.lock() {
            joinings.push(*outcome);
        }
    }
}
