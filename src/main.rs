use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use listing_billing::billing::{
    admin_routes, BillingScheduler, BillingStore, HttpPaymentGateway, PaymentGateway,
    PgBillingStore, SchedulerConfig,
};
use listing_billing::config;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

async fn root() -> &'static str {
    "Listing Billing Engine"
}

fn payment_gateway() -> Option<Arc<dyn PaymentGateway>> {
    let base_url = config::PAYMENT_GATEWAY_URL.as_deref()?;
    let timeout = config::PAYMENT_GATEWAY_TIMEOUT_SECS.map(Duration::from_secs);
    match HttpPaymentGateway::new(base_url, (*config::PAYMENT_GATEWAY_TOKEN).clone(), timeout) {
        Ok(gateway) => Some(Arc::new(gateway)),
        Err(error) => {
            tracing::error!(?error, "invalid payment gateway configuration; poller disabled");
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_lazy(config::DATABASE_URL.as_str())?;

    // Run migrations when the database is reachable; the scheduler start below
    // reports an unreachable store on its own.
    match pool.acquire().await {
        Ok(connection) => {
            drop(connection);
            if let Err(error) = sqlx::migrate!().run(&pool).await {
                if *config::ALLOW_MIGRATION_FAILURE {
                    tracing::warn!(
                        ?error,
                        "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
                    );
                } else {
                    return Err(error.into());
                }
            }
        }
        Err(error) => {
            tracing::error!(?error, "database unreachable at startup; skipping migrations");
        }
    }

    let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool));
    let scheduler = BillingScheduler::new(store, payment_gateway(), SchedulerConfig::from_env());
    if let Err(error) = scheduler.start().await {
        tracing::error!(
            ?error,
            "billing scheduler not started; retry via POST /admin/billing/scheduler/start"
        );
    }

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(admin_routes())
        .layer(prometheus_layer)
        .layer(Extension(scheduler.clone()));

    let addr: SocketAddr =
        format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT).parse()?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::warn!(?error, "failed to listen for shutdown signal");
            }
        })
        .await?;

    scheduler.stop().await;
    Ok(())
}
