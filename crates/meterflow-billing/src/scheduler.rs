//! Scheduled month-end billing runs
//!
//! A run looks at the day before `today`. When that day closes a calendar
//! month, every ACTIVE customer is billed for the month with bounded
//! parallelism. One customer's failure never affects another; failures are
//! logged, counted and left for the next trigger to retry (already billed
//! customers are skipped by the duplicate-period guard).

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use meterflow_common::{BillingPeriod, Customer, MeterflowError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::lock::RunLock;
use crate::metrics::PipelineMetrics;
use crate::service::BillingService;
use crate::store::{bounded, CustomerDirectory};

/// Batch runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Customers billed concurrently
    pub workers: usize,
    /// Expiry of the run lock; must exceed the longest expected run
    pub lock_ttl: Duration,
    pub store_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            lock_ttl: Duration::from_secs(30 * 60),
            store_timeout: Duration::from_secs(10),
        }
    }
}

/// A customer that could not be billed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerFailure {
    pub customer_id: Uuid,
    pub error: String,
}

/// Tally of a completed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub period: BillingPeriod,
    /// Active customers at the start of the run
    pub customers: usize,
    pub succeeded: usize,
    /// Already billed for the period
    pub duplicates: usize,
    pub failed: usize,
    pub failures: Vec<CustomerFailure>,
    /// Cancelled before every customer was processed
    pub interrupted: bool,
}

impl RunSummary {
    fn new(period: BillingPeriod, customers: usize) -> Self {
        Self {
            period,
            customers,
            succeeded: 0,
            duplicates: 0,
            failed: 0,
            failures: Vec::new(),
            interrupted: false,
        }
    }

    fn record(mut self, outcome: CustomerOutcome) -> Self {
        match outcome {
            CustomerOutcome::Billed => self.succeeded += 1,
            CustomerOutcome::AlreadyBilled => self.duplicates += 1,
            CustomerOutcome::Failed(failure) => {
                self.failed += 1;
                self.failures.push(failure);
            }
        }
        self
    }

    /// Every customer ended up with a record for the period
    pub fn is_complete(&self) -> bool {
        !self.interrupted && self.failed == 0
    }
}

/// Result of one trigger
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The closing day is not the last day of its month
    Skipped { closing_day: NaiveDate },
    /// Another runner holds the lock for this period
    Locked { period: BillingPeriod },
    /// The period was already fully billed by this runner
    AlreadyCompleted { period: BillingPeriod },
    Completed(RunSummary),
}

enum CustomerOutcome {
    Billed,
    AlreadyBilled,
    Failed(CustomerFailure),
}

/// The month closed by `closing_day`, if it is a month's last day
pub fn closing_period(closing_day: NaiveDate) -> Option<BillingPeriod> {
    let next = closing_day.succ_opt()?;
    if next.month() == closing_day.month() {
        return None;
    }
    Some(BillingPeriod::month_of(closing_day))
}

/// Scheduled batch runner
pub struct BatchRunner {
    billing: Arc<BillingService>,
    customers: Arc<dyn CustomerDirectory>,
    lock: Arc<dyn RunLock>,
    config: RunnerConfig,
    metrics: Arc<PipelineMetrics>,
    last_completed: Mutex<Option<BillingPeriod>>,
}

impl BatchRunner {
    pub fn new(
        billing: Arc<BillingService>,
        customers: Arc<dyn CustomerDirectory>,
        lock: Arc<dyn RunLock>,
        config: RunnerConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            billing,
            customers,
            lock,
            config,
            metrics,
            last_completed: Mutex::new(None),
        }
    }

    /// Run the trigger for `today`
    pub async fn run(&self, today: NaiveDate) -> Result<RunOutcome> {
        self.run_until(today, &CancellationToken::new()).await
    }

    /// Run the trigger for `today`, stopping early when `cancel` fires
    ///
    /// Customers not reached before cancellation are left for the next trigger.
    #[instrument(skip(self, cancel))]
    pub async fn run_until(&self, today: NaiveDate, cancel: &CancellationToken) -> Result<RunOutcome> {
        let closing_day = today - ChronoDuration::days(1);
        let Some(period) = closing_period(closing_day) else {
            self.metrics.runs.with_label_values(&["skipped"]).inc();
            return Ok(RunOutcome::Skipped { closing_day });
        };

        if *self.last_completed.lock() == Some(period) {
            return Ok(RunOutcome::AlreadyCompleted { period });
        }

        let lock_key = format!("billing-run:{}", period);
        let Some(token) = self.lock.try_acquire(&lock_key, self.config.lock_ttl).await? else {
            info!(%period, "Billing run already in progress elsewhere");
            self.metrics.runs.with_label_values(&["locked"]).inc();
            return Ok(RunOutcome::Locked { period });
        };

        let result = self.bill_active_customers(period, cancel).await;

        if let Err(err) = self.lock.release(&token).await {
            warn!(?err, %period, "Failed to release run lock");
        }

        let summary = result?;
        if summary.is_complete() {
            *self.last_completed.lock() = Some(period);
        }
        self.metrics.runs.with_label_values(&["completed"]).inc();

        info!(
            %period,
            customers = summary.customers,
            succeeded = summary.succeeded,
            duplicates = summary.duplicates,
            failed = summary.failed,
            interrupted = summary.interrupted,
            "Billing run finished"
        );
        Ok(RunOutcome::Completed(summary))
    }

    async fn bill_active_customers(
        &self,
        period: BillingPeriod,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let customers = bounded(
            self.config.store_timeout,
            "active customer listing",
            self.customers.list_active(),
        )
        .await?;

        info!(%period, customers = customers.len(), "Starting billing run");
        let total = customers.len();

        let outcomes = stream::iter(customers)
            .map(|customer| self.bill_customer(customer, period))
            .buffer_unordered(self.config.workers.max(1))
            .take_until(cancel.cancelled());
        futures::pin_mut!(outcomes);

        let mut summary = RunSummary::new(period, total);
        let mut processed = 0;
        while let Some(outcome) = outcomes.next().await {
            processed += 1;
            summary = summary.record(outcome);
        }
        summary.interrupted = processed < total;

        Ok(summary)
    }

    async fn bill_customer(&self, customer: Customer, period: BillingPeriod) -> CustomerOutcome {
        match self.billing.calculate_billing(customer.id, period).await {
            Ok(_) => CustomerOutcome::Billed,
            Err(MeterflowError::DuplicateBillingPeriod { .. }) => {
                info!(customer_id = %customer.id, %period, "Customer already billed for period");
                CustomerOutcome::AlreadyBilled
            }
            Err(err) => {
                self.metrics.run_customer_failures.inc();
                error!(customer_id = %customer.id, %period, error = %err, "Failed to bill customer");
                CustomerOutcome::Failed(CustomerFailure {
                    customer_id: customer.id,
                    error: err.to_string(),
                })
            }
        }
    }

    /// Trigger a run on every tick until cancelled
    pub fn spawn(self: Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = every.as_secs(), "Billing scheduler started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Billing scheduler stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let today = Utc::now().date_naive();
                        if let Err(err) = self.run_until(today, &cancel).await {
                            warn!(?err, %today, "Billing run failed");
                        }
                    }
                }
            }
        })
    }
}
