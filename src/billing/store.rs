use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::BillingResult;
use super::models::{
    ChargeOutcome, DebitOutcome, Entitlement, EntitlementChange, EntitlementGrant,
    EntitlementKind, EntitlementStats, NewTransaction, PricingEntry, Transaction,
    TransactionStatus, VipTier,
};

/// key: billing-store -> persistence seam for ledger, entitlements and pricing
///
/// Every method is one atomic unit. Transaction rows are only written through
/// `open_transaction`, `finalize_transaction`, `debit_if_sufficient` and
/// `charge_and_grant`, which keep the derived balance chain intact.
#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Cheap connectivity probe used before timers are started.
    async fn ping(&self) -> BillingResult<()>;

    async fn pricing_entry(&self, kind: EntitlementKind) -> BillingResult<Option<PricingEntry>>;

    async fn upsert_pricing(&self, entry: PricingEntry) -> BillingResult<PricingEntry>;

    /// Latest completed transaction for `user_id`, in ledger order.
    async fn latest_completed(&self, user_id: Uuid) -> BillingResult<Option<Transaction>>;

    /// Persists `input` as pending with a balance snapshot taken from the
    /// latest completed transaction.
    async fn open_transaction(&self, input: NewTransaction) -> BillingResult<Transaction>;

    /// Moves a pending row to `status`. Fails with `AlreadyFinalized` when the
    /// row has left pending. Completion re-derives the balance snapshot and
    /// appends the row to the user's chain.
    async fn finalize_transaction(
        &self,
        id: Uuid,
        status: TransactionStatus,
        reason: Option<&str>,
    ) -> BillingResult<Transaction>;

    /// Checks the derived balance and, when it covers the debit, writes a
    /// completed row. Nothing is persisted on insufficiency.
    async fn debit_if_sufficient(&self, debit: NewTransaction) -> BillingResult<DebitOutcome>;

    /// `debit_if_sufficient` and an entitlement change in one unit. The change
    /// is resolved against the entitlement row read under the same lock; a
    /// renewal that no longer applies returns `NotDue` without a debit.
    async fn charge_and_grant(
        &self,
        debit: NewTransaction,
        change: EntitlementChange,
    ) -> BillingResult<ChargeOutcome>;

    async fn transaction(&self, id: Uuid) -> BillingResult<Option<Transaction>>;

    /// All rows for `user_id`, completed rows in ledger order first.
    async fn transactions_for_user(&self, user_id: Uuid) -> BillingResult<Vec<Transaction>>;

    /// Pending rows that carry an external gateway id.
    async fn pending_gateway_transactions(&self) -> BillingResult<Vec<Transaction>>;

    async fn activate_entitlement(
        &self,
        grant: EntitlementGrant,
        transaction_id: Option<Uuid>,
    ) -> BillingResult<Entitlement>;

    async fn extend_entitlement(
        &self,
        subject_id: Uuid,
        kind: EntitlementKind,
        expires_at: DateTime<Utc>,
        transaction_id: Uuid,
    ) -> BillingResult<Entitlement>;

    /// Clears `is_active`; VIP tiers also reset the subject's tier when it
    /// still names the expiring tier.
    async fn deactivate_entitlement(
        &self,
        subject_id: Uuid,
        kind: EntitlementKind,
    ) -> BillingResult<Entitlement>;

    async fn set_auto_renew(
        &self,
        subject_id: Uuid,
        kind: EntitlementKind,
        enabled: bool,
    ) -> BillingResult<Entitlement>;

    async fn entitlement(
        &self,
        subject_id: Uuid,
        kind: EntitlementKind,
    ) -> BillingResult<Option<Entitlement>>;

    async fn renewal_candidates(&self, now: DateTime<Utc>) -> BillingResult<Vec<Entitlement>>;

    async fn expiration_candidates(&self, now: DateTime<Utc>) -> BillingResult<Vec<Entitlement>>;

    async fn entitlement_stats(&self, now: DateTime<Utc>) -> BillingResult<EntitlementStats>;

    async fn subject_tier(&self, subject_id: Uuid) -> BillingResult<Option<VipTier>>;
}
