use crate::consumption::Kwh;
use crate::dispatcher::{self, DispatchReport};
use crate::error::BridgeError;
use crate::reconciliation::{Outcome, ReconciliationState};
use crate::sink::Sink;
use crate::vicare::SnapshotSource;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

/// What one poll cycle did.
#[derive(Debug)]
pub struct CycleReport {
    pub outcome: Outcome,
    pub total_consumption: Option<Kwh>,
    pub effects: DispatchReport,
    pub telemetry: DispatchReport,
}

/// Owns the snapshot source, the reconciliation state and the sinks, and
/// drives them one cycle at a time.
pub struct Bridge {
    source: Box<dyn SnapshotSource>,
    state: ReconciliationState,
    sinks: Vec<Arc<dyn Sink>>,
    poll_interval: Duration,
}

impl Bridge {
    pub fn new(
        source: Box<dyn SnapshotSource>,
        sinks: Vec<Arc<dyn Sink>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            state: ReconciliationState::new(),
            sinks,
            poll_interval,
        }
    }

    pub fn state(&self) -> &ReconciliationState {
        &self.state
    }

    /// Runs every sink's setup. A sink that fails to initialize stays
    /// registered and keeps receiving updates.
    pub async fn initialize(&self) -> DispatchReport {
        let report = dispatcher::initialize(&self.sinks).await;
        for failure in &report.failures {
            warn!(error = %failure, "Sink initialization failed");
        }
        report
    }

    /// Fetches, reconciles and dispatches once. The state is committed before
    /// dispatch, whatever the sinks do with the effects.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, BridgeError> {
        let snapshot = self
            .source
            .fetch_snapshot()
            .await
            .map_err(BridgeError::SourceUnavailable)?;

        let reconciliation = self.state.reconcile(snapshot)?;
        let effects = dispatcher::dispatch(&reconciliation.effects, &self.sinks).await;

        let telemetry = match self.source.fetch_telemetry().await {
            Ok(telemetry) => dispatcher::dispatch_telemetry(&telemetry, &self.sinks).await,
            Err(e) => {
                warn!(error = %e, "Could not read boiler telemetry");
                DispatchReport::default()
            }
        };

        info!(
            outcome = ?reconciliation.outcome,
            total = ?self.state.total_consumption(),
            delivered = effects.delivered + telemetry.delivered,
            failed = effects.failures.len() + telemetry.failures.len(),
            "Cycle done"
        );

        Ok(CycleReport {
            outcome: reconciliation.outcome,
            total_consumption: self.state.total_consumption(),
            effects,
            telemetry,
        })
    }

    /// Polls until `shutdown` resolves. Shutdown is only observed between
    /// cycles, so a cycle that started dispatching always finishes.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<(), BridgeError> {
        info!(
            interval_secs = self.poll_interval.as_secs_f64(),
            sinks = self.sinks.len(),
            "Starting bridge"
        );
        self.initialize().await;

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = ticker.tick() => {}
            }

            match self.run_cycle().await {
                Ok(_) => {}
                Err(BridgeError::SourceUnavailable(e)) => {
                    warn!(error = %e, "Snapshot source unavailable, skipping cycle");
                }
                Err(e) => {
                    error!(error = %e, "Stopping bridge");
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}
