use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgConnection, PgPool, Row};
use uuid::Uuid;

use super::error::{BillingError, BillingResult};
use super::models::{
    ChargeOutcome, DebitOutcome, Entitlement, EntitlementChange, EntitlementGrant,
    EntitlementKind, EntitlementStats, NewTransaction, PricingEntry, ResolvedChange,
    Transaction, TransactionStatus, VipTier,
};
use super::store::BillingStore;

/// key: billing-store-postgres -> sqlx implementation of the billing store
///
/// Balance-affecting writes for one user are serialized with a transaction
/// scoped advisory lock keyed on the user id.
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn lock_user(conn: &mut PgConnection, user_id: Uuid) -> BillingResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(user_id.to_string())
        .execute(conn)
        .await?;
    Ok(())
}

async fn balance_on(conn: &mut PgConnection, user_id: Uuid) -> BillingResult<i64> {
    let balance: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT balance_after_cents
        FROM billing_transactions
        WHERE user_id = $1 AND status = 'completed'
        ORDER BY ledger_position DESC
        LIMIT 1
        "#,
    )
    .bind(user_id)
    .fetch_optional(conn)
    .await?;
    Ok(balance.unwrap_or(0))
}

async fn insert_transaction(
    conn: &mut PgConnection,
    input: &NewTransaction,
    status: TransactionStatus,
    balance_before: i64,
) -> BillingResult<Transaction> {
    let amount = input.signed_amount();
    let row = sqlx::query(
        r#"
        INSERT INTO billing_transactions (
            id,
            user_id,
            transaction_type,
            status,
            amount_cents,
            balance_before_cents,
            balance_after_cents,
            payment_method,
            external_transaction_id,
            description,
            metadata,
            ledger_position,
            completed_at
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
            CASE WHEN $12 THEN nextval('billing_ledger_position_seq') ELSE NULL END,
            CASE WHEN $12 THEN NOW() ELSE NULL END
        )
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(input.user_id)
    .bind(input.transaction_type.as_str())
    .bind(status.as_str())
    .bind(amount)
    .bind(balance_before)
    .bind(balance_before + amount)
    .bind(&input.payment_method)
    .bind(input.external_transaction_id.as_deref())
    .bind(&input.description)
    .bind(&input.metadata)
    .bind(status == TransactionStatus::Completed)
    .fetch_one(conn)
    .await?;
    map_transaction(&row)
}

async fn fetch_entitlement(
    conn: &mut PgConnection,
    subject_id: Uuid,
    kind: EntitlementKind,
) -> BillingResult<Option<Entitlement>> {
    let row = sqlx::query(
        "SELECT * FROM billing_entitlements WHERE subject_id = $1 AND entitlement_type = $2",
    )
    .bind(subject_id)
    .bind(kind.as_str())
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(map_entitlement).transpose()
}

/// Serializes grants on one subject and entitlement type, the first insert
/// included, and returns the row as it stands under the lock.
async fn lock_entitlement(
    conn: &mut PgConnection,
    subject_id: Uuid,
    kind: EntitlementKind,
) -> BillingResult<Option<Entitlement>> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 1))")
        .bind(format!("{subject_id}:{}", kind.as_str()))
        .execute(&mut *conn)
        .await?;
    let row = sqlx::query(
        r#"
        SELECT * FROM billing_entitlements
        WHERE subject_id = $1 AND entitlement_type = $2
        FOR UPDATE
        "#,
    )
    .bind(subject_id)
    .bind(kind.as_str())
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(map_entitlement).transpose()
}

async fn upsert_entitlement(
    conn: &mut PgConnection,
    grant: &EntitlementGrant,
    transaction_id: Option<Uuid>,
) -> BillingResult<Entitlement> {
    let row = sqlx::query(
        r#"
        INSERT INTO billing_entitlements (
            subject_id,
            user_id,
            entitlement_type,
            expires_at,
            is_active,
            auto_renew_enabled,
            duration_days,
            last_transaction_id
        ) VALUES ($1, $2, $3, $4, TRUE, $5, $6, $7)
        ON CONFLICT (subject_id, entitlement_type)
        DO UPDATE SET
            user_id = EXCLUDED.user_id,
            expires_at = EXCLUDED.expires_at,
            is_active = TRUE,
            auto_renew_enabled = EXCLUDED.auto_renew_enabled,
            duration_days = EXCLUDED.duration_days,
            last_transaction_id = COALESCE(
                EXCLUDED.last_transaction_id,
                billing_entitlements.last_transaction_id
            ),
            updated_at = NOW()
        RETURNING *
        "#,
    )
    .bind(grant.subject_id)
    .bind(grant.user_id)
    .bind(grant.entitlement_type.as_str())
    .bind(grant.expires_at)
    .bind(grant.auto_renew_enabled)
    .bind(grant.duration_days)
    .bind(transaction_id)
    .fetch_one(&mut *conn)
    .await?;

    if let Some(tier) = grant.entitlement_type.vip_tier() {
        sqlx::query(
            r#"
            INSERT INTO billing_subject_tiers (subject_id, vip_tier)
            VALUES ($1, $2)
            ON CONFLICT (subject_id)
            DO UPDATE SET vip_tier = EXCLUDED.vip_tier, updated_at = NOW()
            "#,
        )
        .bind(grant.subject_id)
        .bind(EntitlementKind::Vip(tier).as_str())
        .execute(&mut *conn)
        .await?;
    }

    map_entitlement(&row)
}

async fn extend_on(
    conn: &mut PgConnection,
    subject_id: Uuid,
    kind: EntitlementKind,
    expires_at: DateTime<Utc>,
    duration_days: Option<i32>,
    transaction_id: Uuid,
) -> BillingResult<Entitlement> {
    let row = sqlx::query(
        r#"
        UPDATE billing_entitlements
        SET
            expires_at = $3,
            duration_days = COALESCE($4, duration_days),
            last_transaction_id = $5,
            updated_at = NOW()
        WHERE subject_id = $1 AND entitlement_type = $2
        RETURNING *
        "#,
    )
    .bind(subject_id)
    .bind(kind.as_str())
    .bind(expires_at)
    .bind(duration_days)
    .bind(transaction_id)
    .fetch_optional(conn)
    .await?;

    match row {
        Some(row) => map_entitlement(&row),
        None => Err(BillingError::EntitlementNotFound { subject_id, kind }),
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn ping(&self) -> BillingResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn pricing_entry(&self, kind: EntitlementKind) -> BillingResult<Option<PricingEntry>> {
        let row = sqlx::query("SELECT * FROM billing_pricing WHERE entitlement_type = $1")
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_pricing).transpose()
    }

    async fn upsert_pricing(&self, entry: PricingEntry) -> BillingResult<PricingEntry> {
        let row = sqlx::query(
            r#"
            INSERT INTO billing_pricing (entitlement_type, price_per_day_cents, is_active)
            VALUES ($1, $2, $3)
            ON CONFLICT (entitlement_type)
            DO UPDATE SET
                price_per_day_cents = EXCLUDED.price_per_day_cents,
                is_active = EXCLUDED.is_active,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(entry.entitlement_type.as_str())
        .bind(entry.price_per_day_cents)
        .bind(entry.is_active)
        .fetch_one(&self.pool)
        .await?;
        map_pricing(&row)
    }

    async fn latest_completed(&self, user_id: Uuid) -> BillingResult<Option<Transaction>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM billing_transactions
            WHERE user_id = $1 AND status = 'completed'
            ORDER BY ledger_position DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_transaction).transpose()
    }

    async fn open_transaction(&self, input: NewTransaction) -> BillingResult<Transaction> {
        let mut conn = self.pool.acquire().await?;
        let balance = balance_on(&mut conn, input.user_id).await?;
        insert_transaction(&mut conn, &input, TransactionStatus::Pending, balance).await
    }

    async fn finalize_transaction(
        &self,
        id: Uuid,
        status: TransactionStatus,
        reason: Option<&str>,
    ) -> BillingResult<Transaction> {
        if status == TransactionStatus::Pending {
            return Err(BillingError::Message(
                "cannot finalize a transaction into pending".to_string(),
            ));
        }

        let user_id: Option<Uuid> =
            sqlx::query_scalar("SELECT user_id FROM billing_transactions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        let user_id = user_id.ok_or(BillingError::TransactionNotFound(id))?;

        let mut tx = self.pool.begin().await?;
        lock_user(&mut tx, user_id).await?;

        let row = if status == TransactionStatus::Completed {
            let balance = balance_on(&mut tx, user_id).await?;
            sqlx::query(
                r#"
                UPDATE billing_transactions
                SET
                    status = 'completed',
                    balance_before_cents = $2,
                    balance_after_cents = $2 + amount_cents,
                    ledger_position = nextval('billing_ledger_position_seq'),
                    completed_at = NOW()
                WHERE id = $1 AND status = 'pending'
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(balance)
            .fetch_optional(&mut *tx)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE billing_transactions
                SET
                    status = $2,
                    completed_at = NOW(),
                    metadata = CASE
                        WHEN $3::text IS NULL THEN metadata
                        ELSE metadata || jsonb_build_object('reason', $3::text)
                    END
                WHERE id = $1 AND status = 'pending'
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(status.as_str())
            .bind(reason)
            .fetch_optional(&mut *tx)
            .await?
        };

        let Some(row) = row else {
            let current: String =
                sqlx::query_scalar("SELECT status FROM billing_transactions WHERE id = $1")
                    .bind(id)
                    .fetch_one(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Err(BillingError::AlreadyFinalized {
                id,
                status: current.parse()?,
            });
        };

        let transaction = map_transaction(&row)?;
        tx.commit().await?;
        Ok(transaction)
    }

    async fn debit_if_sufficient(&self, debit: NewTransaction) -> BillingResult<DebitOutcome> {
        let mut tx = self.pool.begin().await?;
        lock_user(&mut tx, debit.user_id).await?;
        let balance = balance_on(&mut tx, debit.user_id).await?;
        let required = debit.amount_cents.abs();
        if balance < required {
            tx.rollback().await?;
            return Ok(DebitOutcome::InsufficientBalance {
                balance_cents: balance,
                required_cents: required,
            });
        }

        let transaction =
            insert_transaction(&mut tx, &debit, TransactionStatus::Completed, balance).await?;
        tx.commit().await?;
        Ok(DebitOutcome::Debited(transaction))
    }

    async fn charge_and_grant(
        &self,
        debit: NewTransaction,
        change: EntitlementChange,
    ) -> BillingResult<ChargeOutcome> {
        let mut tx = self.pool.begin().await?;
        lock_user(&mut tx, debit.user_id).await?;

        let (subject_id, kind) = change.key();
        let current = lock_entitlement(&mut tx, subject_id, kind).await?;
        let Some(resolved) = change.resolve(current.as_ref()) else {
            tx.rollback().await?;
            return Ok(ChargeOutcome::NotDue);
        };

        let balance = balance_on(&mut tx, debit.user_id).await?;
        let required = debit.amount_cents.abs();
        if balance < required {
            tx.rollback().await?;
            return Ok(ChargeOutcome::InsufficientBalance {
                balance_cents: balance,
                required_cents: required,
            });
        }

        let transaction =
            insert_transaction(&mut tx, &debit, TransactionStatus::Completed, balance).await?;
        let entitlement = match resolved {
            ResolvedChange::Activate(grant) => {
                upsert_entitlement(&mut tx, &grant, Some(transaction.id)).await?
            }
            ResolvedChange::Extend {
                expires_at,
                duration_days,
            } => {
                extend_on(
                    &mut tx,
                    subject_id,
                    kind,
                    expires_at,
                    Some(duration_days),
                    transaction.id,
                )
                .await?
            }
        };
        tx.commit().await?;

        Ok(ChargeOutcome::Charged {
            transaction,
            entitlement,
        })
    }

    async fn transaction(&self, id: Uuid) -> BillingResult<Option<Transaction>> {
        let row = sqlx::query("SELECT * FROM billing_transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_transaction).transpose()
    }

    async fn transactions_for_user(&self, user_id: Uuid) -> BillingResult<Vec<Transaction>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM billing_transactions
            WHERE user_id = $1
            ORDER BY ledger_position ASC NULLS LAST, created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_transaction).collect()
    }

    async fn pending_gateway_transactions(&self) -> BillingResult<Vec<Transaction>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM billing_transactions
            WHERE status = 'pending' AND external_transaction_id IS NOT NULL
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_transaction).collect()
    }

    async fn activate_entitlement(
        &self,
        grant: EntitlementGrant,
        transaction_id: Option<Uuid>,
    ) -> BillingResult<Entitlement> {
        let mut tx = self.pool.begin().await?;
        let entitlement = upsert_entitlement(&mut tx, &grant, transaction_id).await?;
        tx.commit().await?;
        Ok(entitlement)
    }

    async fn extend_entitlement(
        &self,
        subject_id: Uuid,
        kind: EntitlementKind,
        expires_at: DateTime<Utc>,
        transaction_id: Uuid,
    ) -> BillingResult<Entitlement> {
        let mut conn = self.pool.acquire().await?;
        extend_on(&mut conn, subject_id, kind, expires_at, None, transaction_id).await
    }

    async fn deactivate_entitlement(
        &self,
        subject_id: Uuid,
        kind: EntitlementKind,
    ) -> BillingResult<Entitlement> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            UPDATE billing_entitlements
            SET is_active = FALSE, updated_at = NOW()
            WHERE subject_id = $1 AND entitlement_type = $2
            RETURNING *
            "#,
        )
        .bind(subject_id)
        .bind(kind.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(BillingError::EntitlementNotFound { subject_id, kind });
        };

        if kind.vip_tier().is_some() {
            sqlx::query(
                r#"
                UPDATE billing_subject_tiers
                SET vip_tier = NULL, updated_at = NOW()
                WHERE subject_id = $1 AND vip_tier = $2
                "#,
            )
            .bind(subject_id)
            .bind(kind.as_str())
            .execute(&mut *tx)
            .await?;
        }

        let entitlement = map_entitlement(&row)?;
        tx.commit().await?;
        Ok(entitlement)
    }

    async fn set_auto_renew(
        &self,
        subject_id: Uuid,
        kind: EntitlementKind,
        enabled: bool,
    ) -> BillingResult<Entitlement> {
        let row = sqlx::query(
            r#"
            UPDATE billing_entitlements
            SET auto_renew_enabled = $3, updated_at = NOW()
            WHERE subject_id = $1 AND entitlement_type = $2
            RETURNING *
            "#,
        )
        .bind(subject_id)
        .bind(kind.as_str())
        .bind(enabled)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => map_entitlement(&row),
            None => Err(BillingError::EntitlementNotFound { subject_id, kind }),
        }
    }

    async fn entitlement(
        &self,
        subject_id: Uuid,
        kind: EntitlementKind,
    ) -> BillingResult<Option<Entitlement>> {
        let mut conn = self.pool.acquire().await?;
        fetch_entitlement(&mut conn, subject_id, kind).await
    }

    async fn renewal_candidates(&self, now: DateTime<Utc>) -> BillingResult<Vec<Entitlement>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM billing_entitlements
            WHERE auto_renew_enabled AND is_active AND expires_at <= $1
            ORDER BY expires_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_entitlement).collect()
    }

    async fn expiration_candidates(&self, now: DateTime<Utc>) -> BillingResult<Vec<Entitlement>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM billing_entitlements
            WHERE is_active AND expires_at < $1
            ORDER BY expires_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_entitlement).collect()
    }

    async fn entitlement_stats(&self, now: DateTime<Utc>) -> BillingResult<EntitlementStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE is_active) AS active_entitlements,
                COUNT(*) FILTER (
                    WHERE is_active AND auto_renew_enabled AND expires_at <= $1
                ) AS due_for_renewal,
                COUNT(*) FILTER (WHERE is_active AND expires_at < $1) AS due_for_expiration,
                COUNT(*) FILTER (WHERE auto_renew_enabled) AS auto_renew_enabled_count
            FROM billing_entitlements
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(EntitlementStats {
            active_entitlements: row.try_get("active_entitlements")?,
            due_for_renewal: row.try_get("due_for_renewal")?,
            due_for_expiration: row.try_get("due_for_expiration")?,
            auto_renew_enabled_count: row.try_get("auto_renew_enabled_count")?,
        })
    }

    async fn subject_tier(&self, subject_id: Uuid) -> BillingResult<Option<VipTier>> {
        let tier: Option<Option<String>> =
            sqlx::query_scalar("SELECT vip_tier FROM billing_subject_tiers WHERE subject_id = $1")
                .bind(subject_id)
                .fetch_optional(&self.pool)
                .await?;
        match tier.flatten() {
            Some(raw) => Ok(raw.parse::<EntitlementKind>()?.vip_tier()),
            None => Ok(None),
        }
    }
}

fn map_transaction(row: &PgRow) -> BillingResult<Transaction> {
    Ok(Transaction {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        transaction_type: row.try_get::<String, _>("transaction_type")?.parse()?,
        status: row.try_get::<String, _>("status")?.parse()?,
        amount_cents: row.try_get("amount_cents")?,
        balance_before_cents: row.try_get("balance_before_cents")?,
        balance_after_cents: row.try_get("balance_after_cents")?,
        payment_method: row.try_get("payment_method")?,
        external_transaction_id: row.try_get("external_transaction_id")?,
        description: row.try_get("description")?,
        metadata: row.try_get("metadata")?,
        ledger_position: row.try_get("ledger_position")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn map_entitlement(row: &PgRow) -> BillingResult<Entitlement> {
    Ok(Entitlement {
        subject_id: row.try_get("subject_id")?,
        user_id: row.try_get("user_id")?,
        entitlement_type: row.try_get::<String, _>("entitlement_type")?.parse()?,
        expires_at: row.try_get("expires_at")?,
        is_active: row.try_get("is_active")?,
        auto_renew_enabled: row.try_get("auto_renew_enabled")?,
        duration_days: row.try_get("duration_days")?,
        last_transaction_id: row.try_get("last_transaction_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_pricing(row: &PgRow) -> BillingResult<PricingEntry> {
    Ok(PricingEntry {
        entitlement_type: row.try_get::<String, _>("entitlement_type")?.parse()?,
        price_per_day_cents: row.try_get("price_per_day_cents")?,
        is_active: row.try_get("is_active")?,
    })
}
