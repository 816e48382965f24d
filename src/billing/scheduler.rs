use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config;

use super::entitlements::Entitlements;
use super::error::BillingResult;
use super::gateway::PaymentGateway;
use super::ledger::Ledger;
use super::models::EntitlementStats;
use super::poller::{PaymentPoller, PollerSummary};
use super::pricing::PricingCatalog;
use super::store::BillingStore;
use super::sweeper::{RenewalPolicy, RenewalSweeper, SweepSummary};

/// key: billing-scheduler-config -> cadence and renewal policy
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: StdDuration,
    pub sweep_interval: StdDuration,
    pub renewal_policy: RenewalPolicy,
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        Self {
            poll_interval: StdDuration::from_secs(*config::PAYMENT_POLL_INTERVAL_SECS),
            sweep_interval: StdDuration::from_secs(*config::BILLING_SWEEP_INTERVAL_SECS),
            renewal_policy: RenewalPolicy {
                default_days: *config::BILLING_RENEWAL_DAYS,
                overrides: (*config::BILLING_RENEWAL_DAYS_OVERRIDES).clone(),
            },
        }
    }
}

/// Outcome of one attempt to run a periodic task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskRun<T> {
    Completed { summary: T },
    /// Another cycle of the same task was still in flight.
    Skipped,
    Failed { error: String },
    /// The task has no collaborator configured (e.g. no payment gateway).
    Disabled,
}

impl<T> TaskRun<T> {
    pub fn summary(&self) -> Option<&T> {
        match self {
            TaskRun::Completed { summary } => Some(summary),
            _ => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, TaskRun::Skipped)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FullCycleReport {
    pub poller: TaskRun<PollerSummary>,
    pub sweeper: TaskRun<SweepSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub started: bool,
    pub poller_enabled: bool,
    pub poller_running: bool,
    pub sweeper_running: bool,
    pub last_poller_run_at: Option<DateTime<Utc>>,
    pub last_sweeper_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
enum TaskKind {
    Poller,
    Sweeper,
}

impl TaskKind {
    fn name(&self) -> &'static str {
        match self {
            TaskKind::Poller => "payment-poller",
            TaskKind::Sweeper => "renewal-sweeper",
        }
    }
}

/// Single-flight flag plus bookkeeping for one periodic task.
#[derive(Default)]
struct TaskState {
    running: AtomicBool,
    last_run_at: RwLock<Option<DateTime<Utc>>>,
}

struct FlightGuard<'a> {
    state: &'a TaskState,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::Release);
    }
}

impl TaskState {
    fn try_begin(&self) -> Option<FlightGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { state: self })
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn run<T, F, Fut>(&self, task: TaskKind, work: F) -> TaskRun<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BillingResult<T>>,
    {
        let Some(_guard) = self.try_begin() else {
            warn!(task = task.name(), "previous cycle still running; skipping trigger");
            return TaskRun::Skipped;
        };

        let result = work().await;
        *self.last_run_at.write().await = Some(Utc::now());
        match result {
            Ok(summary) => TaskRun::Completed { summary },
            Err(err) => {
                error!(?err, task = task.name(), "billing cycle failed");
                TaskRun::Failed {
                    error: err.to_string(),
                }
            }
        }
    }
}

struct Timers {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

struct SchedulerInner {
    store: Arc<dyn BillingStore>,
    ledger: Ledger,
    entitlements: Entitlements,
    pricing: PricingCatalog,
    poller: Option<PaymentPoller>,
    sweeper: RenewalSweeper,
    config: SchedulerConfig,
    poller_state: TaskState,
    sweeper_state: TaskState,
    /// Held for a whole start or stop, store ping included.
    lifecycle: Mutex<()>,
    timers: Mutex<Option<Timers>>,
}

impl SchedulerInner {
    async fn run_poller(&self) -> TaskRun<PollerSummary> {
        let Some(poller) = &self.poller else {
            return TaskRun::Disabled;
        };
        self.poller_state
            .run(TaskKind::Poller, || poller.run_cycle())
            .await
    }

    async fn run_sweep(&self, now: DateTime<Utc>) -> TaskRun<SweepSummary> {
        self.sweeper_state
            .run(TaskKind::Sweeper, || self.sweeper.run_cycle(now))
            .await
    }
}

/// key: billing-scheduler -> owns both periodic tasks and their lifecycle
///
/// Cheap to clone; clones share timers and single-flight state.
#[derive(Clone)]
pub struct BillingScheduler {
    inner: Arc<SchedulerInner>,
}

impl BillingScheduler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Option<Arc<dyn PaymentGateway>>,
        config: SchedulerConfig,
    ) -> Self {
        let poller = gateway.map(|gateway| PaymentPoller::new(store.clone(), gateway));
        let sweeper = RenewalSweeper::new(store.clone(), config.renewal_policy.clone());
        Self {
            inner: Arc::new(SchedulerInner {
                ledger: Ledger::new(store.clone()),
                entitlements: Entitlements::new(store.clone()),
                pricing: PricingCatalog::new(store.clone()),
                store,
                poller,
                sweeper,
                config,
                poller_state: TaskState::default(),
                sweeper_state: TaskState::default(),
                lifecycle: Mutex::new(()),
                timers: Mutex::new(None),
            }),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.inner.ledger
    }

    pub fn entitlements(&self) -> &Entitlements {
        &self.inner.entitlements
    }

    pub fn pricing(&self) -> &PricingCatalog {
        &self.inner.pricing
    }

    /// Starts both timers. When the store is unreachable nothing is spawned and
    /// the error is returned so the caller can retry later.
    pub async fn start(&self) -> BillingResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.timers.lock().await.is_some() {
            debug!("billing scheduler already started");
            return Ok(());
        }

        if let Err(err) = self.inner.store.ping().await {
            error!(?err, "billing store unreachable; scheduler timers not started");
            return Err(err);
        }

        let (shutdown, receiver) = watch::channel(false);
        let mut handles = Vec::with_capacity(2);
        if self.inner.poller.is_some() {
            handles.push(tokio::spawn(timer_loop(
                self.inner.clone(),
                TaskKind::Poller,
                self.inner.config.poll_interval,
                receiver.clone(),
            )));
        } else {
            warn!("no payment gateway configured; payment poller timer not started");
        }
        handles.push(tokio::spawn(timer_loop(
            self.inner.clone(),
            TaskKind::Sweeper,
            self.inner.config.sweep_interval,
            receiver,
        )));

        *self.inner.timers.lock().await = Some(Timers { shutdown, handles });
        info!(
            poll_interval_secs = self.inner.config.poll_interval.as_secs(),
            sweep_interval_secs = self.inner.config.sweep_interval.as_secs(),
            "billing scheduler started"
        );
        Ok(())
    }

    /// Stops both timers and waits for any in-flight cycle to finish.
    pub async fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let timers = self.inner.timers.lock().await.take();
        let Some(Timers { shutdown, handles }) = timers else {
            return;
        };
        let _ = shutdown.send(true);
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(?err, "billing timer task ended abnormally");
            }
        }
        info!("billing scheduler stopped");
    }

    pub async fn trigger_full_cycle(&self) -> FullCycleReport {
        let poller = self.inner.run_poller().await;
        let sweeper = self.inner.run_sweep(Utc::now()).await;
        FullCycleReport { poller, sweeper }
    }

    pub async fn trigger_poller(&self) -> TaskRun<PollerSummary> {
        self.inner.run_poller().await
    }

    pub async fn trigger_sweep_at(&self, now: DateTime<Utc>) -> TaskRun<SweepSummary> {
        self.inner.run_sweep(now).await
    }

    pub async fn trigger_renewal_only(&self) -> TaskRun<SweepSummary> {
        let now = Utc::now();
        let sweeper = &self.inner.sweeper;
        self.inner
            .sweeper_state
            .run(TaskKind::Sweeper, || sweeper.run_renewals(now))
            .await
    }

    pub async fn trigger_expiration_only(&self) -> TaskRun<SweepSummary> {
        let now = Utc::now();
        let sweeper = &self.inner.sweeper;
        self.inner
            .sweeper_state
            .run(TaskKind::Sweeper, || sweeper.run_expirations(now))
            .await
    }

    pub async fn stats(&self) -> BillingResult<EntitlementStats> {
        self.inner.entitlements.stats(Utc::now()).await
    }

    pub async fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            started: self.inner.timers.lock().await.is_some(),
            poller_enabled: self.inner.poller.is_some(),
            poller_running: self.inner.poller_state.is_running(),
            sweeper_running: self.inner.sweeper_state.is_running(),
            last_poller_run_at: *self.inner.poller_state.last_run_at.read().await,
            last_sweeper_run_at: *self.inner.sweeper_state.last_run_at.read().await,
        }
    }
}

async fn timer_loop(
    inner: Arc<SchedulerInner>,
    task: TaskKind,
    period: StdDuration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    while next_tick(&mut ticker, &mut shutdown).await {
        match task {
            TaskKind::Poller => {
                inner.run_poller().await;
            }
            TaskKind::Sweeper => {
                inner.run_sweep(Utc::now()).await;
            }
        }
    }
    debug!(task = task.name(), "billing timer stopped");
}

/// Waits for the next tick; false once shutdown is requested, even when a
/// tick is ready too.
async fn next_tick(ticker: &mut Interval, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.changed() => false,
        _ = ticker.tick() => true,
    }
}
