//! Concurrent provider startup and teardown
//!
//! Every unit starts in its own tokio task. Tasks share nothing but the
//! cancellation token; their results come back through the join handles and
//! are aggregated here only. A failing unit never cancels its siblings, so
//! the report shows exactly which providers made it.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{Error, Result};

/// Something the orchestrator can start and stop
#[async_trait]
pub trait ProviderUnit: Send + 'static {
    /// Name used in reports and logs
    fn name(&self) -> String;

    /// Start the unit and wait until it is ready
    async fn start(&mut self, cancel: &CancellationToken) -> Result<()>;

    /// Stop the unit; must be safe whether or not `start` ran or succeeded
    async fn stop(&mut self) -> Result<()>;
}

/// A unit that failed to start
#[derive(Debug)]
pub struct ProviderFailure {
    /// Unit name
    pub name: String,
    /// Why it failed
    pub error: Error,
}

/// Outcome of starting every unit
#[derive(Debug, Default)]
pub struct OrchestrationReport {
    /// Units that became ready, in configured order
    pub ready: Vec<String>,
    /// Units that failed, in configured order
    pub failed: Vec<ProviderFailure>,
}

impl OrchestrationReport {
    /// True when every unit became ready
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Ready names, or an error naming every failed unit
    pub fn into_result(self) -> Result<Vec<String>> {
        let mut failed = self.failed.into_iter();
        match failed.next() {
            None => Ok(self.ready),
            Some(first) => {
                let mut names = vec![first.name];
                names.extend(failed.map(|f| f.name));
                Err(Error::ProviderFailed {
                    names,
                    source: Box::new(first.error),
                })
            }
        }
    }
}

/// Starts and stops a fixed set of units
pub struct Orchestrator<U> {
    units: Vec<(String, Arc<Mutex<U>>)>,
}

impl<U: ProviderUnit> Orchestrator<U> {
    /// Take ownership of the units
    pub fn new(units: Vec<U>) -> Self {
        Self {
            units: units
                .into_iter()
                .map(|u| (u.name(), Arc::new(Mutex::new(u))))
                .collect(),
        }
    }

    /// Unit names in configured order
    pub fn names(&self) -> Vec<String> {
        self.units.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Start every unit concurrently and wait for all of them to settle
    pub async fn start_all(&self, cancel: &CancellationToken) -> OrchestrationReport {
        let handles: Vec<_> = self
            .units
            .iter()
            .map(|(_, unit)| {
                let unit = Arc::clone(unit);
                let cancel = cancel.clone();
                tokio::spawn(async move { unit.lock().await.start(&cancel).await })
            })
            .collect();

        let results = join_all(handles).await;

        let mut report = OrchestrationReport::default();
        for ((name, _), result) in self.units.iter().zip(results) {
            let outcome = result.unwrap_or_else(|e| {
                Err(Error::process_lifecycle(format!(
                    "provider {} task failed: {}",
                    name, e
                )))
            });
            match outcome {
                Ok(()) => {
                    info!(provider = %name, "provider started");
                    report.ready.push(name.clone());
                }
                Err(e) => {
                    error!(provider = %name, error = %e, "provider failed to start");
                    report.failed.push(ProviderFailure {
                        name: name.clone(),
                        error: e,
                    });
                }
            }
        }
        report
    }

    /// Stop every unit concurrently, returning the first error
    pub async fn stop_all(&self) -> Result<()> {
        let results = join_all(self.units.iter().map(|(name, unit)| async move {
            let result = unit.lock().await.stop().await;
            if let Err(e) = &result {
                warn!(provider = %name, error = %e, "failed to stop provider");
            }
            result
        }))
        .await;

        results.into_iter().collect()
    }
}
