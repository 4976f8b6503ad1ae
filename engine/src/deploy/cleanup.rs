//! Best-effort cleanup sequences
//!
//! Each step is a fallible future that is awaited in order. A failing step is
//! logged and recorded, and the remaining steps still run.

use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::errors::EngineError;

/// Outcome of a cleanup sequence
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub attempted: usize,
    /// `(step, error)` for every step that failed
    pub failures: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Ordered list of independently wrapped cleanup actions
pub struct CleanupChain<'a> {
    label: String,
    steps: Vec<(String, BoxFuture<'a, Result<(), EngineError>>)>,
}

impl<'a> CleanupChain<'a> {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            steps: Vec::new(),
        }
    }

    pub fn step<F>(mut self, name: impl Into<String>, action: F) -> Self
    where
        F: Future<Output = Result<(), EngineError>> + Send + 'a,
    {
        self.steps.push((name.into(), action.boxed()));
        self
    }

    /// Run every step regardless of sibling outcomes
    pub async fn run(self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for (name, action) in self.steps {
            report.attempted += 1;
            match action.await {
                Ok(()) => debug!("[{}] {} done", self.label, name),
                Err(e) => {
                    warn!("[{}] {} failed: {}", self.label, name, e);
                    report.failures.push((name, e.to_string()));
                }
            }
        }
        report
    }
}
