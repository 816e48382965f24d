use thiserror::Error;
use uuid::Uuid;

use super::models::{EntitlementKind, ParseKindError, TransactionStatus};

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("payment gateway error: {0}")]
    Gateway(String),
    #[error("pricing for `{0}` is inactive")]
    InactivePricing(EntitlementKind),
    #[error("no pricing configured for `{0}`")]
    UnknownPricing(EntitlementKind),
    #[error("transaction {id} already finalized as {status}")]
    AlreadyFinalized {
        id: Uuid,
        status: TransactionStatus,
    },
    #[error("transaction {0} not found")]
    TransactionNotFound(Uuid),
    #[error("entitlement `{kind}` not found for subject {subject_id}")]
    EntitlementNotFound {
        subject_id: Uuid,
        kind: EntitlementKind,
    },
    #[error("invalid amount: {0} cents")]
    InvalidAmount(i64),
    #[error("invalid duration: {0} days")]
    InvalidDuration(i64),
    #[error("corrupt record: {0}")]
    Corrupt(#[from] ParseKindError),
    #[error("{0}")]
    Message(String),
}

impl BillingError {
    /// Pricing problems are business outcomes, not infrastructure failures.
    pub fn is_pricing_unavailable(&self) -> bool {
        matches!(
            self,
            BillingError::InactivePricing(_) | BillingError::UnknownPricing(_)
        )
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
