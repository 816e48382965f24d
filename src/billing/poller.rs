use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::error::{BillingError, BillingResult};
use super::gateway::{GatewayStatus, PaymentGateway};
use super::ledger::Ledger;
use super::models::Transaction;
use super::store::BillingStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollerSummary {
    pub examined: usize,
    pub completed: usize,
    pub failed: usize,
    pub still_pending: usize,
    /// Rows finalized by another path between selection and update.
    pub already_finalized: usize,
    pub errors: usize,
}

enum PollResult {
    Completed,
    Failed,
    StillPending,
    AlreadyFinalized,
}

/// key: payment-poller -> reconcile pending top-ups against the gateway
#[derive(Clone)]
pub struct PaymentPoller {
    store: Arc<dyn BillingStore>,
    ledger: Ledger,
    gateway: Arc<dyn PaymentGateway>,
}

impl PaymentPoller {
    pub fn new(store: Arc<dyn BillingStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            ledger: Ledger::new(store.clone()),
            store,
            gateway,
        }
    }

    /// One reconciliation pass. Only the initial selection can fail the cycle;
    /// every row after that is handled on its own.
    pub async fn run_cycle(&self) -> BillingResult<PollerSummary> {
        let pending = self.store.pending_gateway_transactions().await?;
        let mut summary = PollerSummary {
            examined: pending.len(),
            ..Default::default()
        };

        for transaction in pending {
            match self.poll_one(&transaction).await {
                Ok(PollResult::Completed) => summary.completed += 1,
                Ok(PollResult::Failed) => summary.failed += 1,
                Ok(PollResult::StillPending) => summary.still_pending += 1,
                Ok(PollResult::AlreadyFinalized) => summary.already_finalized += 1,
                Err(err) => {
                    summary.errors += 1;
                    error!(
                        ?err,
                        transaction = %transaction.id,
                        user_id = %transaction.user_id,
                        "failed to reconcile pending payment"
                    );
                }
            }
        }

        info!(
            examined = summary.examined,
            completed = summary.completed,
            failed = summary.failed,
            still_pending = summary.still_pending,
            already_finalized = summary.already_finalized,
            errors = summary.errors,
            "payment verification cycle complete"
        );
        Ok(summary)
    }

    async fn poll_one(&self, transaction: &Transaction) -> BillingResult<PollResult> {
        let Some(external_id) = transaction.external_transaction_id.as_deref() else {
            return Ok(PollResult::StillPending);
        };

        let status = self
            .gateway
            .query_status(external_id)
            .await
            .map_err(|err| BillingError::Gateway(format!("{err:#}")))?;

        let finalized = match status {
            GatewayStatus::Pending => {
                debug!(transaction = %transaction.id, external_id, "payment still pending");
                return Ok(PollResult::StillPending);
            }
            GatewayStatus::Success => self
                .ledger
                .complete(transaction.id)
                .await
                .map(|_| PollResult::Completed),
            GatewayStatus::Failure => self
                .ledger
                .fail(transaction.id, "payment gateway reported failure")
                .await
                .map(|_| PollResult::Failed),
        };

        match finalized {
            Err(BillingError::AlreadyFinalized { id, status }) => {
                warn!(transaction = %id, %status, "payment already finalized; skipping");
                Ok(PollResult::AlreadyFinalized)
            }
            other => other,
        }
    }
}
