use axum::{
    extract::{Extension, Path},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::{
    BillingScheduler, EntitlementKind, EntitlementStats, FullCycleReport, LedgerAudit,
    PricingEntry, SchedulerStatus, SweepSummary, TaskRun, Transaction,
};

/// key: billing-admin-api -> operator endpoints for the billing engine
pub fn admin_routes() -> Router {
    Router::new().nest(
        "/admin/billing",
        Router::new()
            .route("/cycle", post(trigger_cycle))
            .route("/renewals", post(trigger_renewals))
            .route("/expirations", post(trigger_expirations))
            .route("/scheduler/start", post(start_scheduler))
            .route("/scheduler/stop", post(stop_scheduler))
            .route("/stats", get(stats))
            .route("/status", get(status))
            .route("/pricing/:entitlement_type", put(set_price))
            .route("/users/:user_id/balance", get(balance))
            .route("/users/:user_id/ledger", get(ledger))
            .route("/users/:user_id/ledger/audit", get(audit)),
    )
}

pub async fn trigger_cycle(
    Extension(scheduler): Extension<BillingScheduler>,
) -> Json<FullCycleReport> {
    Json(scheduler.trigger_full_cycle().await)
}

pub async fn trigger_renewals(
    Extension(scheduler): Extension<BillingScheduler>,
) -> Json<TaskRun<SweepSummary>> {
    Json(scheduler.trigger_renewal_only().await)
}

pub async fn trigger_expirations(
    Extension(scheduler): Extension<BillingScheduler>,
) -> Json<TaskRun<SweepSummary>> {
    Json(scheduler.trigger_expiration_only().await)
}

pub async fn start_scheduler(
    Extension(scheduler): Extension<BillingScheduler>,
) -> AppResult<Json<SchedulerStatus>> {
    scheduler
        .start()
        .await
        .map_err(|err| AppError::Unavailable(err.to_string()))?;
    Ok(Json(scheduler.status().await))
}

pub async fn stop_scheduler(
    Extension(scheduler): Extension<BillingScheduler>,
) -> Json<SchedulerStatus> {
    scheduler.stop().await;
    Json(scheduler.status().await)
}

pub async fn stats(
    Extension(scheduler): Extension<BillingScheduler>,
) -> AppResult<Json<EntitlementStats>> {
    Ok(Json(scheduler.stats().await?))
}

pub async fn status(Extension(scheduler): Extension<BillingScheduler>) -> Json<SchedulerStatus> {
    Json(scheduler.status().await)
}

pub async fn set_price(
    Extension(scheduler): Extension<BillingScheduler>,
    Path(entitlement_type): Path<String>,
    Json(payload): Json<SetPriceRequest>,
) -> AppResult<Json<PricingEntry>> {
    let kind: EntitlementKind = entitlement_type
        .parse()
        .map_err(|err: super::ParseKindError| AppError::BadRequest(err.to_string()))?;
    let entry = scheduler
        .pricing()
        .set_price(
            kind,
            payload.price_per_day_cents,
            payload.is_active.unwrap_or(true),
        )
        .await?;
    Ok(Json(entry))
}

pub async fn balance(
    Extension(scheduler): Extension<BillingScheduler>,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<BalanceResponse>> {
    let balance_cents = scheduler.ledger().balance(user_id).await?;
    Ok(Json(BalanceResponse {
        user_id,
        balance_cents,
    }))
}

pub async fn ledger(
    Extension(scheduler): Extension<BillingScheduler>,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<Vec<Transaction>>> {
    Ok(Json(scheduler.ledger().history(user_id).await?))
}

pub async fn audit(
    Extension(scheduler): Extension<BillingScheduler>,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<LedgerAudit>> {
    Ok(Json(scheduler.ledger().audit(user_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct SetPriceRequest {
    pub price_per_day_cents: i64,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub user_id: Uuid,
    pub balance_cents: i64,
}
