use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::error::{BillingError, BillingResult};
use super::ledger::entitlement_metadata;
use super::models::{
    ChargeOutcome, Entitlement, EntitlementChange, EntitlementGrant, EntitlementKind,
    EntitlementStats, NewTransaction, Transaction,
};
use super::pricing::PricingCatalog;
use super::store::BillingStore;

/// Renewal and expiration candidates for one sweep.
#[derive(Debug, Clone, Default)]
pub struct DueEntitlements {
    pub renewals: Vec<Entitlement>,
    pub expirations: Vec<Entitlement>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PurchaseOutcome {
    Purchased {
        transaction: Transaction,
        entitlement: Entitlement,
    },
    InsufficientBalance {
        balance_cents: i64,
        required_cents: i64,
    },
    PricingUnavailable {
        entitlement_type: EntitlementKind,
    },
}

/// key: billing-entitlements -> per-listing grant lifecycle
#[derive(Clone)]
pub struct Entitlements {
    store: Arc<dyn BillingStore>,
}

impl Entitlements {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn get(
        &self,
        subject_id: Uuid,
        kind: EntitlementKind,
    ) -> BillingResult<Option<Entitlement>> {
        self.store.entitlement(subject_id, kind).await
    }

    pub async fn activate(
        &self,
        grant: EntitlementGrant,
        transaction_id: Option<Uuid>,
    ) -> BillingResult<Entitlement> {
        let entitlement = self.store.activate_entitlement(grant, transaction_id).await?;
        info!(
            subject_id = %entitlement.subject_id,
            kind = %entitlement.entitlement_type,
            expires_at = %entitlement.expires_at,
            "entitlement activated"
        );
        Ok(entitlement)
    }

    pub async fn extend(
        &self,
        subject_id: Uuid,
        kind: EntitlementKind,
        expires_at: DateTime<Utc>,
        transaction_id: Uuid,
    ) -> BillingResult<Entitlement> {
        self.store
            .extend_entitlement(subject_id, kind, expires_at, transaction_id)
            .await
    }

    pub async fn deactivate(
        &self,
        subject_id: Uuid,
        kind: EntitlementKind,
    ) -> BillingResult<Entitlement> {
        self.store.deactivate_entitlement(subject_id, kind).await
    }

    pub async fn set_auto_renew(
        &self,
        subject_id: Uuid,
        kind: EntitlementKind,
        enabled: bool,
    ) -> BillingResult<Entitlement> {
        self.store.set_auto_renew(subject_id, kind, enabled).await
    }

    /// Renewal and expiration candidates as of `now`. The sweeper reads
    /// expirations again with [`Entitlements::expiration_candidates`] once its
    /// renewals have been applied.
    pub async fn list_due(&self, now: DateTime<Utc>) -> BillingResult<DueEntitlements> {
        Ok(DueEntitlements {
            renewals: self.store.renewal_candidates(now).await?,
            expirations: self.store.expiration_candidates(now).await?,
        })
    }

    pub async fn renewal_candidates(&self, now: DateTime<Utc>) -> BillingResult<Vec<Entitlement>> {
        self.store.renewal_candidates(now).await
    }

    pub async fn expiration_candidates(
        &self,
        now: DateTime<Utc>,
    ) -> BillingResult<Vec<Entitlement>> {
        self.store.expiration_candidates(now).await
    }

    pub async fn stats(&self, now: DateTime<Utc>) -> BillingResult<EntitlementStats> {
        self.store.entitlement_stats(now).await
    }

    /// Charges `days` of `kind` to `user_id` and grants it on `subject_id`.
    /// A still-active grant is extended from its current expiry instead of
    /// being reset.
    pub async fn purchase(
        &self,
        pricing: &PricingCatalog,
        request: PurchaseRequest,
        now: DateTime<Utc>,
    ) -> BillingResult<PurchaseOutcome> {
        let PurchaseRequest {
            user_id,
            subject_id,
            kind,
            days,
            auto_renew,
        } = request;

        let quote = match pricing.quote(kind, days).await {
            Ok(quote) => quote,
            Err(err) if err.is_pricing_unavailable() => {
                return Ok(PurchaseOutcome::PricingUnavailable {
                    entitlement_type: kind,
                })
            }
            Err(err) => return Err(err),
        };
        let duration_days =
            i32::try_from(days).map_err(|_| BillingError::InvalidDuration(days))?;

        let change = EntitlementChange::Purchase {
            subject_id,
            user_id,
            entitlement_type: kind,
            days: duration_days,
            auto_renew_enabled: auto_renew,
            now,
        };

        let debit = NewTransaction::new(
            user_id,
            kind.purchase_type(),
            quote.total_cents,
            format!("{kind} for {days} day(s)"),
        )
        .with_metadata(entitlement_metadata(subject_id, kind, days, false));

        match self.store.charge_and_grant(debit, change).await? {
            ChargeOutcome::Charged {
                transaction,
                entitlement,
            } => {
                info!(
                    %user_id,
                    %subject_id,
                    %kind,
                    amount_cents = quote.total_cents,
                    "entitlement purchased"
                );
                Ok(PurchaseOutcome::Purchased {
                    transaction,
                    entitlement,
                })
            }
            ChargeOutcome::InsufficientBalance {
                balance_cents,
                required_cents,
            } => Ok(PurchaseOutcome::InsufficientBalance {
                balance_cents,
                required_cents,
            }),
            ChargeOutcome::NotDue => Err(BillingError::Message(format!(
                "purchase of {kind} for subject {subject_id} was not applied"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PurchaseRequest {
    pub user_id: Uuid,
    pub subject_id: Uuid,
    pub kind: EntitlementKind,
    pub days: i64,
    pub auto_renew: bool,
}
