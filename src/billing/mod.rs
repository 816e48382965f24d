pub mod api;
pub mod entitlements;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod models;
pub mod poller;
pub mod postgres;
pub mod pricing;
pub mod scheduler;
pub mod store;
pub mod sweeper;

pub use api::admin_routes;
pub use entitlements::{DueEntitlements, Entitlements, PurchaseOutcome, PurchaseRequest};
pub use error::{BillingError, BillingResult};
pub use gateway::{GatewayStatus, HttpPaymentGateway, PaymentGateway};
pub use ledger::{audit_chain, ChainViolation, ChainViolationKind, Ledger, LedgerAudit};
pub use models::{
    ChargeOutcome, DebitOutcome, Entitlement, EntitlementChange, EntitlementGrant,
    EntitlementKind, EntitlementStats, NewTransaction, ParseKindError, PricingEntry, ResolvedChange,
    ServiceKind, Transaction, TransactionStatus, TransactionType, VipTier,
};
pub use poller::{PaymentPoller, PollerSummary};
pub use postgres::PgBillingStore;
pub use pricing::{PricingCatalog, Quote};
pub use scheduler::{BillingScheduler, FullCycleReport, SchedulerConfig, SchedulerStatus, TaskRun};
pub use store::BillingStore;
pub use sweeper::{RenewalPolicy, RenewalSweeper, SweepSummary};
