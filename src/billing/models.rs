use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// key: billing-models -> ledger,entitlements,pricing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    TopUp,
    VipPurchase,
    ServicePurchase,
    FeaturePurchase,
    Refund,
    AdminAdjustment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::TopUp => "top_up",
            TransactionType::VipPurchase => "vip_purchase",
            TransactionType::ServicePurchase => "service_purchase",
            TransactionType::FeaturePurchase => "feature_purchase",
            TransactionType::Refund => "refund",
            TransactionType::AdminAdjustment => "admin_adjustment",
        }
    }

    /// Applies the ledger sign convention to `amount_cents`.
    ///
    /// Credits are always positive, purchases always negative, and admin
    /// adjustments keep whatever sign the operator supplied.
    pub fn signed(&self, amount_cents: i64) -> i64 {
        match self {
            TransactionType::TopUp | TransactionType::Refund => amount_cents.abs(),
            TransactionType::VipPurchase
            | TransactionType::ServicePurchase
            | TransactionType::FeaturePurchase => -amount_cents.abs(),
            TransactionType::AdminAdjustment => amount_cents,
        }
    }

    pub fn is_debit(&self) -> bool {
        matches!(
            self,
            TransactionType::VipPurchase
                | TransactionType::ServicePurchase
                | TransactionType::FeaturePurchase
        )
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = ParseKindError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "top_up" => Ok(TransactionType::TopUp),
            "vip_purchase" => Ok(TransactionType::VipPurchase),
            "service_purchase" => Ok(TransactionType::ServicePurchase),
            "feature_purchase" => Ok(TransactionType::FeaturePurchase),
            "refund" => Ok(TransactionType::Refund),
            "admin_adjustment" => Ok(TransactionType::AdminAdjustment),
            other => Err(ParseKindError::new("transaction type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = ParseKindError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            "cancelled" => Ok(TransactionStatus::Cancelled),
            other => Err(ParseKindError::new("transaction status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VipTier {
    Vip,
    VipPlus,
    SuperVip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    AutoRenew,
    ColorHighlight,
    TopPlacement,
}

/// Anything that can be sold as a time-boxed grant on a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EntitlementKind {
    Vip(VipTier),
    Service(ServiceKind),
}

impl EntitlementKind {
    pub const ALL: [EntitlementKind; 6] = [
        EntitlementKind::Vip(VipTier::Vip),
        EntitlementKind::Vip(VipTier::VipPlus),
        EntitlementKind::Vip(VipTier::SuperVip),
        EntitlementKind::Service(ServiceKind::AutoRenew),
        EntitlementKind::Service(ServiceKind::ColorHighlight),
        EntitlementKind::Service(ServiceKind::TopPlacement),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntitlementKind::Vip(VipTier::Vip) => "vip",
            EntitlementKind::Vip(VipTier::VipPlus) => "vip_plus",
            EntitlementKind::Vip(VipTier::SuperVip) => "super_vip",
            EntitlementKind::Service(ServiceKind::AutoRenew) => "auto_renew",
            EntitlementKind::Service(ServiceKind::ColorHighlight) => "color_highlight",
            EntitlementKind::Service(ServiceKind::TopPlacement) => "top_placement",
        }
    }

    pub fn vip_tier(&self) -> Option<VipTier> {
        match self {
            EntitlementKind::Vip(tier) => Some(*tier),
            EntitlementKind::Service(_) => None,
        }
    }

    /// Ledger type used when this entitlement is charged.
    pub fn purchase_type(&self) -> TransactionType {
        match self {
            EntitlementKind::Vip(_) => TransactionType::VipPurchase,
            EntitlementKind::Service(_) => TransactionType::ServicePurchase,
        }
    }
}

impl fmt::Display for EntitlementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntitlementKind {
    type Err = ParseKindError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        EntitlementKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| ParseKindError::new("entitlement type", value))
    }
}

impl TryFrom<String> for EntitlementKind {
    type Error = ParseKindError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntitlementKind> for String {
    fn from(kind: EntitlementKind) -> Self {
        kind.as_str().to_string()
    }
}

impl From<VipTier> for EntitlementKind {
    fn from(tier: VipTier) -> Self {
        EntitlementKind::Vip(tier)
    }
}

impl From<ServiceKind> for EntitlementKind {
    fn from(service: ServiceKind) -> Self {
        EntitlementKind::Service(service)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {what} `{value}`")]
pub struct ParseKindError {
    what: &'static str,
    value: String,
}

impl ParseKindError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

/// key: billing-ledger-model -> append-only balance events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    /// Signed delta applied to the balance when the row completes.
    pub amount_cents: i64,
    pub balance_before_cents: i64,
    pub balance_after_cents: i64,
    pub payment_method: String,
    pub external_transaction_id: Option<String>,
    pub description: String,
    pub metadata: Value,
    /// Position in the user's completed chain; assigned on completion.
    pub ledger_position: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Input for a new ledger row. `amount_cents` is signed by
/// [`TransactionType::signed`] before it is persisted.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub user_id: Uuid,
    pub transaction_type: TransactionType,
    pub amount_cents: i64,
    pub payment_method: String,
    pub external_transaction_id: Option<String>,
    pub description: String,
    pub metadata: Value,
}

impl NewTransaction {
    pub fn new(
        user_id: Uuid,
        transaction_type: TransactionType,
        amount_cents: i64,
        description: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            transaction_type,
            amount_cents,
            payment_method: "balance".to_string(),
            external_transaction_id: None,
            description: description.into(),
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_gateway(
        mut self,
        payment_method: impl Into<String>,
        external_transaction_id: impl Into<String>,
    ) -> Self {
        self.payment_method = payment_method.into();
        self.external_transaction_id = Some(external_transaction_id.into());
        self
    }

    pub fn signed_amount(&self) -> i64 {
        self.transaction_type.signed(self.amount_cents)
    }
}

/// key: billing-entitlement-model -> listing grants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entitlement {
    pub subject_id: Uuid,
    pub user_id: Uuid,
    pub entitlement_type: EntitlementKind,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub auto_renew_enabled: bool,
    pub duration_days: i32,
    pub last_transaction_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entitlement {
    pub fn key(&self) -> (Uuid, EntitlementKind) {
        (self.subject_id, self.entitlement_type)
    }

    pub fn is_due_for_renewal(&self, now: DateTime<Utc>) -> bool {
        self.auto_renew_enabled && self.is_active && self.expires_at <= now
    }

    pub fn is_due_for_expiration(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at < now
    }
}

/// Input for [`crate::billing::BillingStore::activate_entitlement`].
#[derive(Debug, Clone, PartialEq)]
pub struct EntitlementGrant {
    pub subject_id: Uuid,
    pub user_id: Uuid,
    pub entitlement_type: EntitlementKind,
    pub expires_at: DateTime<Utc>,
    pub duration_days: i32,
    pub auto_renew_enabled: bool,
}

/// Entitlement mutation applied in the same unit as a debit.
///
/// Carries a length, not an expiry: the store resolves it with
/// [`EntitlementChange::resolve`] against the row it reads under its lock.
#[derive(Debug, Clone)]
pub enum EntitlementChange {
    /// Extends a still-active grant from its expiry, otherwise starts a
    /// fresh one at `now`.
    Purchase {
        subject_id: Uuid,
        user_id: Uuid,
        entitlement_type: EntitlementKind,
        days: i32,
        auto_renew_enabled: bool,
        now: DateTime<Utc>,
    },
    /// Extends a row that is still active, auto-renewing and due at `now`.
    Renew {
        subject_id: Uuid,
        entitlement_type: EntitlementKind,
        days: i32,
        now: DateTime<Utc>,
    },
}

/// An [`EntitlementChange`] applied to the current row.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedChange {
    Activate(EntitlementGrant),
    Extend {
        expires_at: DateTime<Utc>,
        duration_days: i32,
    },
}

impl EntitlementChange {
    pub fn key(&self) -> (Uuid, EntitlementKind) {
        match self {
            EntitlementChange::Purchase {
                subject_id,
                entitlement_type,
                ..
            }
            | EntitlementChange::Renew {
                subject_id,
                entitlement_type,
                ..
            } => (*subject_id, *entitlement_type),
        }
    }

    /// `None` when a renewal no longer applies to `current`; nothing is
    /// charged then.
    pub fn resolve(&self, current: Option<&Entitlement>) -> Option<ResolvedChange> {
        match *self {
            EntitlementChange::Purchase {
                subject_id,
                user_id,
                entitlement_type,
                days,
                auto_renew_enabled,
                now,
            } => Some(match current {
                Some(row) if row.is_active && row.expires_at > now => ResolvedChange::Extend {
                    expires_at: row.expires_at + Duration::days(i64::from(days)),
                    duration_days: days,
                },
                _ => ResolvedChange::Activate(EntitlementGrant {
                    subject_id,
                    user_id,
                    entitlement_type,
                    expires_at: now + Duration::days(i64::from(days)),
                    duration_days: days,
                    auto_renew_enabled,
                }),
            }),
            EntitlementChange::Renew { days, now, .. } => current
                .filter(|row| row.is_due_for_renewal(now))
                .map(|row| ResolvedChange::Extend {
                    expires_at: row.expires_at.max(now) + Duration::days(i64::from(days)),
                    duration_days: days,
                }),
        }
    }
}

/// key: billing-pricing-model -> per-day catalog rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingEntry {
    pub entitlement_type: EntitlementKind,
    pub price_per_day_cents: i64,
    pub is_active: bool,
}

/// Result of an atomic balance check and debit.
#[derive(Debug, Clone, PartialEq)]
pub enum DebitOutcome {
    Debited(Transaction),
    InsufficientBalance {
        balance_cents: i64,
        required_cents: i64,
    },
}

impl DebitOutcome {
    pub fn transaction(&self) -> Option<&Transaction> {
        match self {
            DebitOutcome::Debited(transaction) => Some(transaction),
            DebitOutcome::InsufficientBalance { .. } => None,
        }
    }
}

/// Result of a debit applied together with an entitlement change.
#[derive(Debug, Clone, PartialEq)]
pub enum ChargeOutcome {
    Charged {
        transaction: Transaction,
        entitlement: Entitlement,
    },
    InsufficientBalance {
        balance_cents: i64,
        required_cents: i64,
    },
    /// A renewal found the row no longer active, auto-renewing or due.
    NotDue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementStats {
    pub active_entitlements: i64,
    pub due_for_renewal: i64,
    pub due_for_expiration: i64,
    pub auto_renew_enabled_count: i64,
}
