use std::sync::Arc;

use serde::Serialize;

use super::error::{BillingError, BillingResult};
use super::models::{EntitlementKind, PricingEntry};
use super::store::BillingStore;

/// key: billing-pricing -> quote per-day entitlements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub entitlement_type: EntitlementKind,
    pub days: i64,
    pub price_per_day_cents: i64,
    pub total_cents: i64,
}

impl PricingEntry {
    /// Prices `days` of this entitlement. Amounts are already in the currency
    /// minor unit, so the product needs no further rounding.
    pub fn quote(&self, days: i64) -> BillingResult<Quote> {
        if !self.is_active {
            return Err(BillingError::InactivePricing(self.entitlement_type));
        }
        if days <= 0 {
            return Err(BillingError::InvalidDuration(days));
        }
        let total_cents = self
            .price_per_day_cents
            .checked_mul(days)
            .ok_or(BillingError::InvalidAmount(self.price_per_day_cents))?;
        Ok(Quote {
            entitlement_type: self.entitlement_type,
            days,
            price_per_day_cents: self.price_per_day_cents,
            total_cents,
        })
    }
}

#[derive(Clone)]
pub struct PricingCatalog {
    store: Arc<dyn BillingStore>,
}

impl PricingCatalog {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn entry(&self, kind: EntitlementKind) -> BillingResult<PricingEntry> {
        self.store
            .pricing_entry(kind)
            .await?
            .ok_or(BillingError::UnknownPricing(kind))
    }

    pub async fn quote(&self, kind: EntitlementKind, days: i64) -> BillingResult<Quote> {
        self.entry(kind).await?.quote(days)
    }

    pub async fn set_price(
        &self,
        kind: EntitlementKind,
        price_per_day_cents: i64,
        is_active: bool,
    ) -> BillingResult<PricingEntry> {
        if price_per_day_cents < 0 {
            return Err(BillingError::InvalidAmount(price_per_day_cents));
        }
        self.store
            .upsert_pricing(PricingEntry {
                entitlement_type: kind,
                price_per_day_cents,
                is_active,
            })
            .await
    }
}
