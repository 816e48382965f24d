use axum::{http::StatusCode, response::{IntoResponse, Response}};
use thiserror::Error;

use crate::billing::BillingError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Billing(#[from] BillingError),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Billing(err) => match err {
                BillingError::TransactionNotFound(_) | BillingError::EntitlementNotFound { .. } => {
                    StatusCode::NOT_FOUND
                }
                BillingError::InvalidAmount(_) | BillingError::InvalidDuration(_) => {
                    StatusCode::BAD_REQUEST
                }
                BillingError::InactivePricing(_)
                | BillingError::UnknownPricing(_)
                | BillingError::AlreadyFinalized { .. } => StatusCode::CONFLICT,
                BillingError::Gateway(_) => StatusCode::BAD_GATEWAY,
                BillingError::Db(_) | BillingError::Corrupt(_) | BillingError::Message(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::debug!(?self);
        }
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
