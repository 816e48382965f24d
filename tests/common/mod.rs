//! In-memory billing store and scripted gateway for tests
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use listing_billing::billing::{
    BillingError, BillingResult, BillingStore, ChargeOutcome, DebitOutcome, Entitlement,
    EntitlementChange, EntitlementGrant, EntitlementKind, EntitlementStats, GatewayStatus,
    Ledger, NewTransaction, PaymentGateway, PricingEntry, ResolvedChange, Transaction,
    TransactionStatus, VipTier,
};
use serde_json::json;
use tokio::sync::{Barrier, Mutex, Notify};
use uuid::Uuid;

#[derive(Default)]
struct State {
    transactions: Vec<Transaction>,
    next_position: i64,
    entitlements: HashMap<(Uuid, EntitlementKind), Entitlement>,
    pricing: HashMap<EntitlementKind, PricingEntry>,
    tiers: HashMap<Uuid, Option<VipTier>>,
}

impl State {
    fn balance(&self, user_id: Uuid) -> i64 {
        self.transactions
            .iter()
            .filter(|t| t.user_id == user_id && t.status == TransactionStatus::Completed)
            .max_by_key(|t| t.ledger_position)
            .map(|t| t.balance_after_cents)
            .unwrap_or(0)
    }

    fn insert(&mut self, input: &NewTransaction, status: TransactionStatus) -> Transaction {
        let before = self.balance(input.user_id);
        let amount = input.signed_amount();
        let now = Utc::now();
        let completed = status == TransactionStatus::Completed;
        let ledger_position = completed.then(|| {
            self.next_position += 1;
            self.next_position
        });
        let transaction = Transaction {
            id: Uuid::new_v4(),
            user_id: input.user_id,
            transaction_type: input.transaction_type,
            status,
            amount_cents: amount,
            balance_before_cents: before,
            balance_after_cents: before + amount,
            payment_method: input.payment_method.clone(),
            external_transaction_id: input.external_transaction_id.clone(),
            description: input.description.clone(),
            metadata: input.metadata.clone(),
            ledger_position,
            created_at: now,
            completed_at: completed.then_some(now),
        };
        self.transactions.push(transaction.clone());
        transaction
    }

    fn upsert(&mut self, grant: &EntitlementGrant, transaction_id: Option<Uuid>) -> Entitlement {
        let now = Utc::now();
        let key = (grant.subject_id, grant.entitlement_type);
        let created_at = self
            .entitlements
            .get(&key)
            .map(|existing| existing.created_at)
            .unwrap_or(now);
        let last_transaction_id = transaction_id.or_else(|| {
            self.entitlements
                .get(&key)
                .and_then(|existing| existing.last_transaction_id)
        });
        let entitlement = Entitlement {
            subject_id: grant.subject_id,
            user_id: grant.user_id,
            entitlement_type: grant.entitlement_type,
            expires_at: grant.expires_at,
            is_active: true,
            auto_renew_enabled: grant.auto_renew_enabled,
            duration_days: grant.duration_days,
            last_transaction_id,
            created_at,
            updated_at: now,
        };
        if let Some(tier) = grant.entitlement_type.vip_tier() {
            self.tiers.insert(grant.subject_id, Some(tier));
        }
        self.entitlements.insert(key, entitlement.clone());
        entitlement
    }

    fn extend(
        &mut self,
        subject_id: Uuid,
        kind: EntitlementKind,
        expires_at: DateTime<Utc>,
        duration_days: Option<i32>,
        transaction_id: Uuid,
    ) -> BillingResult<Entitlement> {
        let entitlement = self
            .entitlements
            .get_mut(&(subject_id, kind))
            .ok_or(BillingError::EntitlementNotFound { subject_id, kind })?;
        entitlement.expires_at = expires_at;
        if let Some(days) = duration_days {
            entitlement.duration_days = days;
        }
        entitlement.last_transaction_id = Some(transaction_id);
        entitlement.updated_at = Utc::now();
        Ok(entitlement.clone())
    }
}

/// `BillingStore` backed by a mutex-guarded map, with the same atomicity as
/// the Postgres store: every trait call runs under one lock acquisition.
#[derive(Default)]
pub struct MemoryBillingStore {
    state: Mutex<State>,
    ping_fails: AtomicBool,
    failing_subjects: std::sync::Mutex<HashSet<Uuid>>,
    renewal_gate: Option<RenewalGate>,
    ping_gate: Option<RenewalGate>,
    charge_barrier: Option<Barrier>,
    renewal_scans: AtomicUsize,
}

/// Holds a store call open until the test releases it.
pub struct RenewalGate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_renewal_gate() -> (Self, Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let store = Self {
            renewal_gate: Some(RenewalGate {
                entered: entered.clone(),
                release: release.clone(),
            }),
            ..Self::default()
        };
        (store, entered, release)
    }

    /// Like [`MemoryBillingStore::with_renewal_gate`], but holds `ping`.
    pub fn with_ping_gate() -> (Self, Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let store = Self {
            ping_gate: Some(RenewalGate {
                entered: entered.clone(),
                release: release.clone(),
            }),
            ..Self::default()
        };
        (store, entered, release)
    }

    /// `charge_and_grant` waits until `parties` calls have arrived, so every
    /// caller has finished its own reads before any of them charges.
    pub fn with_charge_barrier(parties: usize) -> Self {
        Self {
            charge_barrier: Some(Barrier::new(parties)),
            ..Self::default()
        }
    }

    pub fn set_ping_fails(&self, fails: bool) {
        self.ping_fails.store(fails, Ordering::SeqCst);
    }

    /// Makes every charge against `subject_id` fail like a database error.
    pub fn fail_charges_for(&self, subject_id: Uuid) {
        self.failing_subjects
            .lock()
            .expect("failing subjects lock")
            .insert(subject_id);
    }

    pub fn renewal_scans(&self) -> usize {
        self.renewal_scans.load(Ordering::SeqCst)
    }

    pub async fn put_entitlement(&self, entitlement: Entitlement) {
        let mut state = self.state.lock().await;
        if entitlement.is_active {
            if let Some(tier) = entitlement.entitlement_type.vip_tier() {
                state.tiers.insert(entitlement.subject_id, Some(tier));
            }
        }
        state
            .entitlements
            .insert(entitlement.key(), entitlement);
    }

    pub async fn all_transactions(&self) -> Vec<Transaction> {
        self.state.lock().await.transactions.clone()
    }

    fn charge_fails(&self, subject_id: Uuid) -> bool {
        self.failing_subjects
            .lock()
            .expect("failing subjects lock")
            .contains(&subject_id)
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn ping(&self) -> BillingResult<()> {
        if let Some(gate) = &self.ping_gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if self.ping_fails.load(Ordering::SeqCst) {
            return Err(BillingError::Db(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    async fn pricing_entry(&self, kind: EntitlementKind) -> BillingResult<Option<PricingEntry>> {
        Ok(self.state.lock().await.pricing.get(&kind).cloned())
    }

    async fn upsert_pricing(&self, entry: PricingEntry) -> BillingResult<PricingEntry> {
        self.state
            .lock()
            .await
            .pricing
            .insert(entry.entitlement_type, entry.clone());
        Ok(entry)
    }

    async fn latest_completed(&self, user_id: Uuid) -> BillingResult<Option<Transaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id && t.status == TransactionStatus::Completed)
            .max_by_key(|t| t.ledger_position)
            .cloned())
    }

    async fn open_transaction(&self, input: NewTransaction) -> BillingResult<Transaction> {
        let mut state = self.state.lock().await;
        Ok(state.insert(&input, TransactionStatus::Pending))
    }

    async fn finalize_transaction(
        &self,
        id: Uuid,
        status: TransactionStatus,
        reason: Option<&str>,
    ) -> BillingResult<Transaction> {
        let mut state = self.state.lock().await;
        let index = state
            .transactions
            .iter()
            .position(|t| t.id == id)
            .ok_or(BillingError::TransactionNotFound(id))?;
        let current = state.transactions[index].status;
        if current != TransactionStatus::Pending {
            return Err(BillingError::AlreadyFinalized {
                id,
                status: current,
            });
        }

        let user_id = state.transactions[index].user_id;
        let balance = state.balance(user_id);
        let position = if status == TransactionStatus::Completed {
            state.next_position += 1;
            Some(state.next_position)
        } else {
            None
        };

        let row = &mut state.transactions[index];
        row.status = status;
        row.completed_at = Some(Utc::now());
        if let Some(position) = position {
            row.balance_before_cents = balance;
            row.balance_after_cents = balance + row.amount_cents;
            row.ledger_position = Some(position);
        }
        if let Some(reason) = reason {
            if let Some(metadata) = row.metadata.as_object_mut() {
                metadata.insert("reason".to_string(), json!(reason));
            }
        }
        Ok(row.clone())
    }

    async fn debit_if_sufficient(&self, debit: NewTransaction) -> BillingResult<DebitOutcome> {
        let mut state = self.state.lock().await;
        let balance = state.balance(debit.user_id);
        let required = debit.amount_cents.abs();
        if balance < required {
            return Ok(DebitOutcome::InsufficientBalance {
                balance_cents: balance,
                required_cents: required,
            });
        }
        Ok(DebitOutcome::Debited(
            state.insert(&debit, TransactionStatus::Completed),
        ))
    }

    async fn charge_and_grant(
        &self,
        debit: NewTransaction,
        change: EntitlementChange,
    ) -> BillingResult<ChargeOutcome> {
        let (subject_id, kind) = change.key();
        if self.charge_fails(subject_id) {
            return Err(BillingError::Db(sqlx::Error::PoolClosed));
        }

        if let Some(barrier) = &self.charge_barrier {
            barrier.wait().await;
        }

        let mut state = self.state.lock().await;
        let current = state.entitlements.get(&(subject_id, kind)).cloned();
        let Some(resolved) = change.resolve(current.as_ref()) else {
            return Ok(ChargeOutcome::NotDue);
        };

        let balance = state.balance(debit.user_id);
        let required = debit.amount_cents.abs();
        if balance < required {
            return Ok(ChargeOutcome::InsufficientBalance {
                balance_cents: balance,
                required_cents: required,
            });
        }

        let transaction = state.insert(&debit, TransactionStatus::Completed);
        let entitlement = match resolved {
            ResolvedChange::Activate(grant) => state.upsert(&grant, Some(transaction.id)),
            ResolvedChange::Extend {
                expires_at,
                duration_days,
            } => state.extend(
                subject_id,
                kind,
                expires_at,
                Some(duration_days),
                transaction.id,
            )?,
        };
        Ok(ChargeOutcome::Charged {
            transaction,
            entitlement,
        })
    }

    async fn transaction(&self, id: Uuid) -> BillingResult<Option<Transaction>> {
        let state = self.state.lock().await;
        Ok(state.transactions.iter().find(|t| t.id == id).cloned())
    }

    async fn transactions_for_user(&self, user_id: Uuid) -> BillingResult<Vec<Transaction>> {
        let state = self.state.lock().await;
        let mut rows: Vec<Transaction> = state
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by_key(|t| (t.ledger_position.is_none(), t.ledger_position, t.created_at));
        Ok(rows)
    }

    async fn pending_gateway_transactions(&self) -> BillingResult<Vec<Transaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .filter(|t| {
                t.status == TransactionStatus::Pending && t.external_transaction_id.is_some()
            })
            .cloned()
            .collect())
    }

    async fn activate_entitlement(
        &self,
        grant: EntitlementGrant,
        transaction_id: Option<Uuid>,
    ) -> BillingResult<Entitlement> {
        Ok(self.state.lock().await.upsert(&grant, transaction_id))
    }

    async fn extend_entitlement(
        &self,
        subject_id: Uuid,
        kind: EntitlementKind,
        expires_at: DateTime<Utc>,
        transaction_id: Uuid,
    ) -> BillingResult<Entitlement> {
        self.state
            .lock()
            .await
            .extend(subject_id, kind, expires_at, None, transaction_id)
    }

    async fn deactivate_entitlement(
        &self,
        subject_id: Uuid,
        kind: EntitlementKind,
    ) -> BillingResult<Entitlement> {
        let mut state = self.state.lock().await;
        let entitlement = state
            .entitlements
            .get_mut(&(subject_id, kind))
            .ok_or(BillingError::EntitlementNotFound { subject_id, kind })?;
        entitlement.is_active = false;
        entitlement.updated_at = Utc::now();
        let entitlement = entitlement.clone();

        if let Some(tier) = kind.vip_tier() {
            if let Some(current) = state.tiers.get_mut(&subject_id) {
                if *current == Some(tier) {
                    *current = None;
                }
            }
        }
        Ok(entitlement)
    }

    async fn set_auto_renew(
        &self,
        subject_id: Uuid,
        kind: EntitlementKind,
        enabled: bool,
    ) -> BillingResult<Entitlement> {
        let mut state = self.state.lock().await;
        let entitlement = state
            .entitlements
            .get_mut(&(subject_id, kind))
            .ok_or(BillingError::EntitlementNotFound { subject_id, kind })?;
        entitlement.auto_renew_enabled = enabled;
        entitlement.updated_at = Utc::now();
        Ok(entitlement.clone())
    }

    async fn entitlement(
        &self,
        subject_id: Uuid,
        kind: EntitlementKind,
    ) -> BillingResult<Option<Entitlement>> {
        Ok(self
            .state
            .lock()
            .await
            .entitlements
            .get(&(subject_id, kind))
            .cloned())
    }

    async fn renewal_candidates(&self, now: DateTime<Utc>) -> BillingResult<Vec<Entitlement>> {
        self.renewal_scans.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.renewal_gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let state = self.state.lock().await;
        let mut rows: Vec<Entitlement> = state
            .entitlements
            .values()
            .filter(|e| e.is_due_for_renewal(now))
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.expires_at);
        Ok(rows)
    }

    async fn expiration_candidates(&self, now: DateTime<Utc>) -> BillingResult<Vec<Entitlement>> {
        let state = self.state.lock().await;
        let mut rows: Vec<Entitlement> = state
            .entitlements
            .values()
            .filter(|e| e.is_due_for_expiration(now))
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.expires_at);
        Ok(rows)
    }

    async fn entitlement_stats(&self, now: DateTime<Utc>) -> BillingResult<EntitlementStats> {
        let state = self.state.lock().await;
        let mut stats = EntitlementStats::default();
        for e in state.entitlements.values() {
            stats.active_entitlements += i64::from(e.is_active);
            stats.due_for_renewal += i64::from(e.is_due_for_renewal(now));
            stats.due_for_expiration += i64::from(e.is_due_for_expiration(now));
            stats.auto_renew_enabled_count += i64::from(e.auto_renew_enabled);
        }
        Ok(stats)
    }

    async fn subject_tier(&self, subject_id: Uuid) -> BillingResult<Option<VipTier>> {
        Ok(self
            .state
            .lock()
            .await
            .tiers
            .get(&subject_id)
            .copied()
            .flatten())
    }
}

/// Gateway that answers from a script keyed by external transaction id.
/// Unscripted ids report pending.
#[derive(Default)]
pub struct ScriptedGateway {
    answers: std::sync::Mutex<HashMap<String, Result<GatewayStatus, String>>>,
    calls: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(&self, external_id: &str, status: GatewayStatus) {
        self.answers
            .lock()
            .expect("gateway script lock")
            .insert(external_id.to_string(), Ok(status));
    }

    pub fn fail(&self, external_id: &str, message: &str) {
        self.answers
            .lock()
            .expect("gateway script lock")
            .insert(external_id.to_string(), Err(message.to_string()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn query_status(&self, external_transaction_id: &str) -> anyhow::Result<GatewayStatus> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = self
            .answers
            .lock()
            .expect("gateway script lock")
            .get(external_transaction_id)
            .cloned();
        match answer {
            Some(Ok(status)) => Ok(status),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(GatewayStatus::Pending),
        }
    }
}

/// Credits `amount_cents` to `user_id` through a completed top-up.
pub async fn seed_balance(store: Arc<MemoryBillingStore>, user_id: Uuid, amount_cents: i64) {
    let ledger = Ledger::new(store);
    let pending = ledger
        .open_top_up(
            user_id,
            amount_cents,
            "card",
            &format!("seed-{}", Uuid::new_v4()),
        )
        .await
        .expect("open seed top-up");
    ledger.complete(pending.id).await.expect("complete seed top-up");
}

pub async fn seed_price(store: &MemoryBillingStore, kind: EntitlementKind, cents: i64, active: bool) {
    store
        .upsert_pricing(PricingEntry {
            entitlement_type: kind,
            price_per_day_cents: cents,
            is_active: active,
        })
        .await
        .expect("seed price");
}

/// Active entitlement row on a fresh subject owned by `user_id`.
pub fn entitlement(
    user_id: Uuid,
    kind: EntitlementKind,
    expires_at: DateTime<Utc>,
    auto_renew: bool,
    duration_days: i32,
) -> Entitlement {
    let created_at = expires_at - Duration::days(i64::from(duration_days));
    Entitlement {
        subject_id: Uuid::new_v4(),
        user_id,
        entitlement_type: kind,
        expires_at,
        is_active: true,
        auto_renew_enabled: auto_renew,
        duration_days,
        last_transaction_id: None,
        created_at,
        updated_at: created_at,
    }
}
