use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use super::error::{BillingError, BillingResult};
use super::models::{DebitOutcome, NewTransaction, Transaction, TransactionStatus, TransactionType};
use super::store::BillingStore;

/// key: billing-ledger -> derived balances and status compare-and-swap
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn BillingStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Balance after the user's most recent completed transaction.
    pub async fn balance(&self, user_id: Uuid) -> BillingResult<i64> {
        Ok(self
            .store
            .latest_completed(user_id)
            .await?
            .map(|transaction| transaction.balance_after_cents)
            .unwrap_or(0))
    }

    pub async fn open(
        &self,
        user_id: Uuid,
        transaction_type: TransactionType,
        amount_cents: i64,
        description: &str,
    ) -> BillingResult<Transaction> {
        self.open_with(NewTransaction::new(
            user_id,
            transaction_type,
            amount_cents,
            description,
        ))
        .await
    }

    pub async fn open_with(&self, input: NewTransaction) -> BillingResult<Transaction> {
        validate_amount(&input)?;
        let transaction = self.store.open_transaction(input).await?;
        debug!(
            transaction = %transaction.id,
            user_id = %transaction.user_id,
            kind = %transaction.transaction_type,
            amount_cents = transaction.amount_cents,
            "opened pending ledger transaction"
        );
        Ok(transaction)
    }

    /// Opens a pending gateway-mediated top-up that the payment poller will
    /// later finalize.
    pub async fn open_top_up(
        &self,
        user_id: Uuid,
        amount_cents: i64,
        payment_method: &str,
        external_transaction_id: &str,
    ) -> BillingResult<Transaction> {
        let input = NewTransaction::new(
            user_id,
            TransactionType::TopUp,
            amount_cents,
            format!("Balance top-up via {payment_method}"),
        )
        .with_gateway(payment_method, external_transaction_id);
        self.open_with(input).await
    }

    pub async fn complete(&self, transaction_id: Uuid) -> BillingResult<Transaction> {
        let transaction = self
            .store
            .finalize_transaction(transaction_id, TransactionStatus::Completed, None)
            .await?;
        info!(
            transaction = %transaction.id,
            user_id = %transaction.user_id,
            balance_after_cents = transaction.balance_after_cents,
            "ledger transaction completed"
        );
        Ok(transaction)
    }

    pub async fn fail(&self, transaction_id: Uuid, reason: &str) -> BillingResult<Transaction> {
        let transaction = self
            .store
            .finalize_transaction(transaction_id, TransactionStatus::Failed, Some(reason))
            .await?;
        info!(
            transaction = %transaction.id,
            user_id = %transaction.user_id,
            %reason,
            "ledger transaction failed"
        );
        Ok(transaction)
    }

    pub async fn cancel(&self, transaction_id: Uuid, reason: &str) -> BillingResult<Transaction> {
        self.store
            .finalize_transaction(transaction_id, TransactionStatus::Cancelled, Some(reason))
            .await
    }

    pub async fn debit_if_sufficient(
        &self,
        user_id: Uuid,
        amount_cents: i64,
        description: &str,
    ) -> BillingResult<DebitOutcome> {
        self.debit_with(NewTransaction::new(
            user_id,
            TransactionType::FeaturePurchase,
            amount_cents,
            description,
        ))
        .await
    }

    pub async fn debit_with(&self, input: NewTransaction) -> BillingResult<DebitOutcome> {
        if !input.transaction_type.is_debit() {
            return Err(BillingError::Message(format!(
                "`{}` is not a debit transaction type",
                input.transaction_type
            )));
        }
        validate_amount(&input)?;
        self.store.debit_if_sufficient(input).await
    }

    pub async fn transaction(&self, transaction_id: Uuid) -> BillingResult<Transaction> {
        self.store
            .transaction(transaction_id)
            .await?
            .ok_or(BillingError::TransactionNotFound(transaction_id))
    }

    pub async fn history(&self, user_id: Uuid) -> BillingResult<Vec<Transaction>> {
        self.store.transactions_for_user(user_id).await
    }

    pub async fn audit(&self, user_id: Uuid) -> BillingResult<LedgerAudit> {
        let history = self.store.transactions_for_user(user_id).await?;
        Ok(audit_chain(user_id, &history, Utc::now()))
    }
}

fn validate_amount(input: &NewTransaction) -> BillingResult<()> {
    let valid = match input.transaction_type {
        TransactionType::AdminAdjustment => input.amount_cents != 0,
        _ => input.amount_cents > 0,
    };
    if valid {
        Ok(())
    } else {
        Err(BillingError::InvalidAmount(input.amount_cents))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainViolationKind {
    /// First completed row does not start from zero.
    NonZeroOpening,
    /// `balance_before` differs from the previous row's `balance_after`.
    BrokenLink,
    /// `balance_after != balance_before + amount`.
    Arithmetic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainViolation {
    pub transaction_id: Uuid,
    pub kind: ChainViolationKind,
    pub expected_cents: i64,
    pub actual_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerAudit {
    pub user_id: Uuid,
    pub checked_at: DateTime<Utc>,
    pub completed_transactions: usize,
    pub balance_cents: i64,
    pub violations: Vec<ChainViolation>,
    pub healthy: bool,
}

/// Walks a user's completed rows in ledger order and reports every place the
/// derived-balance chain does not hold. Read only.
pub fn audit_chain(user_id: Uuid, history: &[Transaction], now: DateTime<Utc>) -> LedgerAudit {
    let mut completed: Vec<&Transaction> = history
        .iter()
        .filter(|transaction| transaction.status == TransactionStatus::Completed)
        .collect();
    completed.sort_by_key(|transaction| (transaction.ledger_position, transaction.created_at));

    let mut violations = Vec::new();
    let mut previous_after: Option<i64> = None;
    for transaction in &completed {
        let expected_before = previous_after.unwrap_or(0);
        if transaction.balance_before_cents != expected_before {
            violations.push(ChainViolation {
                transaction_id: transaction.id,
                kind: if previous_after.is_none() {
                    ChainViolationKind::NonZeroOpening
                } else {
                    ChainViolationKind::BrokenLink
                },
                expected_cents: expected_before,
                actual_cents: transaction.balance_before_cents,
            });
        }
        let expected_after = transaction.balance_before_cents + transaction.amount_cents;
        if transaction.balance_after_cents != expected_after {
            violations.push(ChainViolation {
                transaction_id: transaction.id,
                kind: ChainViolationKind::Arithmetic,
                expected_cents: expected_after,
                actual_cents: transaction.balance_after_cents,
            });
        }
        previous_after = Some(transaction.balance_after_cents);
    }

    LedgerAudit {
        user_id,
        checked_at: now,
        completed_transactions: completed.len(),
        balance_cents: previous_after.unwrap_or(0),
        healthy: violations.is_empty(),
        violations,
    }
}

/// Metadata attached to entitlement debits.
pub(crate) fn entitlement_metadata(
    subject_id: Uuid,
    kind: super::models::EntitlementKind,
    days: i64,
    renewal: bool,
) -> serde_json::Value {
    json!({
        "propertyId": subject_id,
        "serviceType": kind.as_str(),
        "days": days,
        "renewal": renewal,
    })
}
