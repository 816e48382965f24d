use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::entitlements::Entitlements;
use super::error::{BillingError, BillingResult};
use super::ledger::entitlement_metadata;
use super::models::{ChargeOutcome, Entitlement, EntitlementChange, EntitlementKind, NewTransaction};
use super::pricing::PricingCatalog;
use super::store::BillingStore;

/// How long an automatic renewal lasts.
///
/// Overrides win over `default_days`; without either the renewal repeats the
/// length of the purchase that created the entitlement. Never less than a day.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenewalPolicy {
    pub default_days: Option<u32>,
    pub overrides: HashMap<EntitlementKind, u32>,
}

impl RenewalPolicy {
    pub fn renewal_days(&self, kind: EntitlementKind, purchased_days: i32) -> i64 {
        let days = self
            .overrides
            .get(&kind)
            .copied()
            .or(self.default_days)
            .map(i64::from)
            .unwrap_or(i64::from(purchased_days));
        days.max(1)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub renewal_candidates: usize,
    pub renewed: usize,
    pub declined_insufficient_balance: usize,
    pub declined_pricing_unavailable: usize,
    /// Candidates that stopped qualifying before they were charged.
    pub skipped_not_due: usize,
    pub expiration_candidates: usize,
    pub expired: usize,
    pub errors: usize,
}

impl SweepSummary {
    fn merge(mut self, other: SweepSummary) -> Self {
        self.renewal_candidates += other.renewal_candidates;
        self.renewed += other.renewed;
        self.declined_insufficient_balance += other.declined_insufficient_balance;
        self.declined_pricing_unavailable += other.declined_pricing_unavailable;
        self.skipped_not_due += other.skipped_not_due;
        self.expiration_candidates += other.expiration_candidates;
        self.expired += other.expired;
        self.errors += other.errors;
        self
    }
}

enum RenewalOutcome {
    Renewed,
    InsufficientBalance,
    PricingUnavailable,
    NotDue,
}

/// Entitlements the expiration phase must leave alone this cycle.
type Held = HashSet<(Uuid, EntitlementKind)>;

/// key: renewal-sweeper -> charge auto-renewals, expire the rest
#[derive(Clone)]
pub struct RenewalSweeper {
    store: Arc<dyn BillingStore>,
    entitlements: Entitlements,
    pricing: PricingCatalog,
    policy: RenewalPolicy,
}

impl RenewalSweeper {
    pub fn new(store: Arc<dyn BillingStore>, policy: RenewalPolicy) -> Self {
        Self {
            entitlements: Entitlements::new(store.clone()),
            pricing: PricingCatalog::new(store.clone()),
            store,
            policy,
        }
    }

    /// Renewal phase followed by expiration phase. Renewed rows and rows whose
    /// renewal hit an infrastructure error are held out of expiration.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> BillingResult<SweepSummary> {
        let (renewals, held) = self.renewal_phase(now).await?;
        let expirations = self.expiration_phase(now, &held).await?;
        let summary = renewals.merge(expirations);
        info!(
            renewed = summary.renewed,
            declined_insufficient_balance = summary.declined_insufficient_balance,
            declined_pricing_unavailable = summary.declined_pricing_unavailable,
            skipped_not_due = summary.skipped_not_due,
            expired = summary.expired,
            errors = summary.errors,
            "renewal sweep complete"
        );
        Ok(summary)
    }

    pub async fn run_renewals(&self, now: DateTime<Utc>) -> BillingResult<SweepSummary> {
        let (summary, _) = self.renewal_phase(now).await?;
        info!(
            renewed = summary.renewed,
            declined_insufficient_balance = summary.declined_insufficient_balance,
            errors = summary.errors,
            "renewal-only sweep complete"
        );
        Ok(summary)
    }

    pub async fn run_expirations(&self, now: DateTime<Utc>) -> BillingResult<SweepSummary> {
        let summary = self.expiration_phase(now, &Held::new()).await?;
        info!(
            expired = summary.expired,
            errors = summary.errors,
            "expiration-only sweep complete"
        );
        Ok(summary)
    }

    async fn renewal_phase(&self, now: DateTime<Utc>) -> BillingResult<(SweepSummary, Held)> {
        let candidates = self.entitlements.renewal_candidates(now).await?;
        let mut summary = SweepSummary {
            renewal_candidates: candidates.len(),
            ..Default::default()
        };
        let mut held = Held::new();

        for entitlement in candidates {
            match self.renew(&entitlement, now).await {
                Ok(RenewalOutcome::Renewed) => {
                    summary.renewed += 1;
                    held.insert(entitlement.key());
                }
                Ok(RenewalOutcome::InsufficientBalance) => {
                    summary.declined_insufficient_balance += 1;
                }
                Ok(RenewalOutcome::PricingUnavailable) => {
                    summary.declined_pricing_unavailable += 1;
                }
                Ok(RenewalOutcome::NotDue) => {
                    summary.skipped_not_due += 1;
                }
                Err(err) => {
                    summary.errors += 1;
                    held.insert(entitlement.key());
                    error!(
                        ?err,
                        subject_id = %entitlement.subject_id,
                        kind = %entitlement.entitlement_type,
                        user_id = %entitlement.user_id,
                        "failed to renew entitlement"
                    );
                }
            }
        }

        Ok((summary, held))
    }

    async fn renew(&self, entitlement: &Entitlement, now: DateTime<Utc>) -> BillingResult<RenewalOutcome> {
        let kind = entitlement.entitlement_type;
        let days = self.policy.renewal_days(kind, entitlement.duration_days);

        let quote = match self.pricing.quote(kind, days).await {
            Ok(quote) => quote,
            Err(err) if err.is_pricing_unavailable() => {
                warn!(
                    subject_id = %entitlement.subject_id,
                    %kind,
                    "pricing unavailable; disabling auto-renew"
                );
                self.entitlements
                    .set_auto_renew(entitlement.subject_id, kind, false)
                    .await?;
                return Ok(RenewalOutcome::PricingUnavailable);
            }
            Err(err) => return Err(err),
        };

        let duration_days = i32::try_from(days).map_err(|_| BillingError::InvalidDuration(days))?;
        let debit = NewTransaction::new(
            entitlement.user_id,
            kind.purchase_type(),
            quote.total_cents,
            format!("Automatic renewal of {kind} for {days} day(s)"),
        )
        .with_metadata(entitlement_metadata(entitlement.subject_id, kind, days, true));
        let change = EntitlementChange::Renew {
            subject_id: entitlement.subject_id,
            entitlement_type: kind,
            days: duration_days,
            now,
        };

        match self.store.charge_and_grant(debit, change).await? {
            ChargeOutcome::Charged {
                transaction,
                entitlement: renewed,
            } => {
                info!(
                    subject_id = %entitlement.subject_id,
                    %kind,
                    transaction = %transaction.id,
                    amount_cents = quote.total_cents,
                    expires_at = %renewed.expires_at,
                    "entitlement renewed"
                );
                Ok(RenewalOutcome::Renewed)
            }
            ChargeOutcome::NotDue => {
                info!(
                    subject_id = %entitlement.subject_id,
                    %kind,
                    "entitlement no longer due for renewal; not charged"
                );
                Ok(RenewalOutcome::NotDue)
            }
            ChargeOutcome::InsufficientBalance {
                balance_cents,
                required_cents,
            } => {
                warn!(
                    subject_id = %entitlement.subject_id,
                    %kind,
                    user_id = %entitlement.user_id,
                    balance_cents,
                    required_cents,
                    "insufficient balance for renewal; disabling auto-renew"
                );
                self.entitlements
                    .set_auto_renew(entitlement.subject_id, kind, false)
                    .await?;
                Ok(RenewalOutcome::InsufficientBalance)
            }
        }
    }

    async fn expiration_phase(&self, now: DateTime<Utc>, held: &Held) -> BillingResult<SweepSummary> {
        let candidates = self.entitlements.expiration_candidates(now).await?;
        let mut summary = SweepSummary::default();

        for entitlement in candidates {
            if held.contains(&entitlement.key()) {
                continue;
            }
            summary.expiration_candidates += 1;
            match self
                .entitlements
                .deactivate(entitlement.subject_id, entitlement.entitlement_type)
                .await
            {
                Ok(_) => {
                    summary.expired += 1;
                    info!(
                        subject_id = %entitlement.subject_id,
                        kind = %entitlement.entitlement_type,
                        expired_at = %entitlement.expires_at,
                        "entitlement expired"
                    );
                }
                Err(err) => {
                    summary.errors += 1;
                    error!(
                        ?err,
                        subject_id = %entitlement.subject_id,
                        kind = %entitlement.entitlement_type,
                        "failed to expire entitlement"
                    );
                }
            }
        }

        Ok(summary)
    }
}
