use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

/// Canonical top-up status reported by the payment gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    Success,
    Failure,
    Pending,
}

impl GatewayStatus {
    /// Maps the gateway's free-form status vocabulary onto the three canonical
    /// states. Unknown values are treated as still pending.
    pub fn from_gateway(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "success" | "succeeded" | "completed" | "paid" | "approved" => GatewayStatus::Success,
            "failure" | "failed" | "declined" | "rejected" | "cancelled" | "canceled"
            | "expired" | "error" => GatewayStatus::Failure,
            "pending" | "processing" | "created" | "in_progress" => GatewayStatus::Pending,
            other => {
                warn!(status = %other, "unrecognised gateway status; treating as pending");
                GatewayStatus::Pending
            }
        }
    }
}

/// key: billing-gateway -> external top-up status source
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn query_status(&self, external_transaction_id: &str) -> Result<GatewayStatus>;
}

pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GatewayStatusResponse {
    status: String,
}

impl HttpPaymentGateway {
    pub fn new(
        base_url: &str,
        auth_token: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut base_url =
            Url::parse(base_url).with_context(|| format!("invalid gateway url `{base_url}`"))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .context("failed to build payment gateway client")?;

        Ok(Self {
            client,
            base_url,
            auth_token,
        })
    }

    fn endpoint(&self, external_transaction_id: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("gateway url cannot be a base"))?
            .pop_if_empty()
            .extend(["transactions", external_transaction_id, "status"]);
        Ok(url)
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.auth_token {
            request.bearer_auth(token)
        } else {
            request
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn query_status(&self, external_transaction_id: &str) -> Result<GatewayStatus> {
        let url = self.endpoint(external_transaction_id)?;
        let response = self
            .auth(self.client.get(url))
            .send()
            .await
            .context("failed to contact payment gateway")?
            .error_for_status()
            .context("payment gateway rejected status query")?;

        let parsed: GatewayStatusResponse = response
            .json()
            .await
            .context("failed to decode payment gateway response")?;

        Ok(GatewayStatus::from_gateway(&parsed.status))
    }
}
