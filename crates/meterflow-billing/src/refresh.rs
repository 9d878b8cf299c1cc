//! Periodic refresh of the precomputed summary views

use std::sync::Arc;
use std::time::Duration;

use meterflow_common::Result;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::PipelineMetrics;
use crate::store::{bounded, SummaryViews};

pub struct SummaryRefresher {
    views: Arc<dyn SummaryViews>,
    timeout: Duration,
    metrics: Arc<PipelineMetrics>,
}

impl SummaryRefresher {
    pub fn new(views: Arc<dyn SummaryViews>, timeout: Duration, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            views,
            timeout,
            metrics,
        }
    }

    /// Recompute every summary view once
    pub async fn refresh_once(&self) -> Result<()> {
        match bounded(self.timeout, "summary refresh", self.views.refresh()).await {
            Ok(()) => {
                self.metrics.summary_refreshes.inc();
                debug!("Summary views refreshed");
                Ok(())
            }
            Err(err) => {
                self.metrics.summary_refresh_failures.inc();
                Err(err)
            }
        }
    }

    /// Refresh on a fixed interval until cancelled; a failed refresh waits for the next tick
    pub fn spawn(self: Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = every.as_secs(), "Summary refresher started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Summary refresher stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = self.refresh_once().await {
                            warn!(?err, "Summary refresh failed");
                        }
                    }
                }
            }
        })
    }
}
