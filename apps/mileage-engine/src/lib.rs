//! Mileage engine: ledger, redemption codes, reward policies and the
//! orchestrator that ties them into atomic units over one SQLite store.

pub mod config;
pub mod services;

use anyhow::Result;
use mileage_shared::{Clock, SystemClock};
use sqlx::SqlitePool;
use std::sync::Arc;

pub use config::EngineConfig;
use services::coupon_service::CouponService;
use services::ledger_service::LedgerService;
use services::notification_service::{LogNotifier, NotificationService, NotificationSink};
use services::policy_service::PolicyService;
use services::redemption_service::RedemptionService;
use services::registry_service::RegistryService;
use services::reward_service::RewardService;

#[derive(Clone)]
pub struct Engine {
    pub pool: SqlitePool,
    pub clock: Arc<dyn Clock>,
    pub ledger: Arc<LedgerService>,
    pub registry: Arc<RegistryService>,
    pub rewards: Arc<RewardService>,
    pub policies: Arc<PolicyService>,
    pub coupons: Arc<CouponService>,
    pub redemption: Arc<RedemptionService>,
}

impl Engine {
    /// Open the configured database and wire the services with the system
    /// clock and log-only notifications.
    pub async fn connect(config: &EngineConfig) -> Result<Self> {
        let pool = mileage_db::db::connect(&config.database_url, config.max_connections).await?;
        Ok(Self::new(
            pool,
            config,
            Arc::new(SystemClock),
            Arc::new(LogNotifier),
        ))
    }

    pub fn new(
        pool: SqlitePool,
        config: &EngineConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let retries = config.conflict_retries;
        let ledger = LedgerService::new(pool.clone(), clock.clone(), retries);
        let notifier = NotificationService::new(sink);

        Self {
            registry: Arc::new(RegistryService::new(
                pool.clone(),
                clock.clone(),
                config.clone(),
            )),
            rewards: Arc::new(RewardService::new(pool.clone(), clock.clone())),
            policies: Arc::new(PolicyService::new(pool.clone(), clock.clone(), retries)),
            coupons: Arc::new(CouponService::new(pool.clone(), clock.clone(), retries)),
            redemption: Arc::new(RedemptionService::new(
                pool.clone(),
                ledger.clone(),
                notifier,
                clock.clone(),
                retries,
            )),
            ledger: Arc::new(ledger),
            pool,
            clock,
        }
    }
}
