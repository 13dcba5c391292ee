use chrono::Duration;
use mileage_db::models::redemption_code::{CodePayload, RedemptionCode, normalize_code};
use mileage_db::repositories::code_repo::{self, CodeRepository};
use mileage_db::repositories::coupon_repo;
use mileage_db::{MileageError, MileageResult};
use mileage_shared::Clock;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::with_conflict_retry;
use crate::config::EngineConfig;

/// Draws before giving up on finding an unused code value.
const MAX_CODE_ATTEMPTS: u32 = 5;

/// Issues, shows and consumes single-use codes.
#[derive(Debug, Clone)]
pub struct RegistryService {
    pool: SqlitePool,
    codes: CodeRepository,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl RegistryService {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            codes: CodeRepository::new(pool.clone()),
            pool,
            clock,
            config,
        }
    }

    /// Issue a code for `payload`. Without `ttl` the configured default for
    /// the payload's kind applies.
    pub async fn issue(
        &self,
        payload: CodePayload,
        owner_scope: Option<i64>,
        ttl: Option<Duration>,
    ) -> MileageResult<RedemptionCode> {
        let kind = payload.kind();
        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl(kind));
        if ttl <= Duration::zero() {
            return Err(MileageError::InvalidRequest(format!(
                "ttl must be positive, got {}s",
                ttl.num_seconds()
            )));
        }
        self.validate_payload(&payload).await?;

        let now = self.clock.now_millis();
        let expires_at = now.checked_add(ttl.num_milliseconds()).ok_or_else(|| {
            MileageError::InvalidRequest(format!("ttl out of range: {}s", ttl.num_seconds()))
        })?;
        let mut conn = self.pool.acquire().await?;

        for attempt in 1..=MAX_CODE_ATTEMPTS {
            let candidate = code_repo::generate_code(kind);
            match code_repo::insert_code(&mut conn, &candidate, &payload, owner_scope, now, expires_at)
                .await?
            {
                Some(code) => {
                    info!(
                        "Issued {:?} code {} (expires in {}s)",
                        kind,
                        code.code,
                        ttl.num_seconds()
                    );
                    return Ok(code);
                }
                None => warn!(
                    "Code collision on {} (attempt {}/{})",
                    candidate, attempt, MAX_CODE_ATTEMPTS
                ),
            }
        }
        Err(MileageError::PersistenceConflict(
            "could not allocate a unique code".to_string(),
        ))
    }

    async fn validate_payload(&self, payload: &CodePayload) -> MileageResult<()> {
        match payload {
            CodePayload::Mileage { amount, .. } | CodePayload::Payment { amount, .. } => {
                if *amount <= 0 {
                    return Err(MileageError::InvalidAmount(*amount));
                }
            }
            CodePayload::Coupon { definition_id } => {
                let mut conn = self.pool.acquire().await?;
                let definition = coupon_repo::definition_in_tx(&mut conn, *definition_id)
                    .await?
                    .ok_or(MileageError::CouponNotFound(*definition_id))?;
                if !definition.is_open_at(self.clock.now_millis()) {
                    return Err(MileageError::CouponUnavailable(*definition_id));
                }
            }
        }
        Ok(())
    }

    /// Consume a code without any side effect of its payload. Redemption
    /// with side effects goes through the redemption service.
    pub async fn consume(&self, code: &str, consumer_id: i64) -> MileageResult<RedemptionCode> {
        let code = normalize_code(code);
        let code = code.as_str();
        let consumed = with_conflict_retry("code consume", self.config.conflict_retries, move || {
            self.consume_once(code, consumer_id)
        })
        .await?;
        info!("Code {} consumed by {}", consumed.code, consumer_id);
        Ok(consumed)
    }

    async fn consume_once(&self, code: &str, consumer_id: i64) -> MileageResult<RedemptionCode> {
        let now = self.clock.now_millis();
        let mut tx = self.pool.begin().await?;
        let consumed = code_repo::consume_in_tx(&mut tx, code, consumer_id, now).await?;
        tx.commit().await?;
        Ok(consumed)
    }

    /// Read-only lookup for display.
    pub async fn peek(&self, code: &str) -> MileageResult<RedemptionCode> {
        let code = normalize_code(code);
        debug!("Peek code {}", code);
        self.codes
            .find(&code)
            .await?
            .ok_or(MileageError::CodeNotFound(code))
    }

    pub async fn list_open(&self, owner_scope: i64) -> MileageResult<Vec<RedemptionCode>> {
        self.codes.list_open(owner_scope, self.clock.now_millis()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mileage_db::models::redemption_code::{CodeKind, CodeStatus};
    use mileage_shared::ManualClock;
    use tempfile::TempDir;

    async fn registry() -> (RegistryService, Arc<ManualClock>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("codes.db").display());
        let pool = mileage_db::db::connect(&url, 2).await.unwrap();
        let clock = Arc::new(ManualClock::new(1_790_000_000_000));
        let service = RegistryService::new(pool, clock.clone(), EngineConfig::default());
        (service, clock, dir)
    }

    fn mileage(amount: i64) -> CodePayload {
        CodePayload::Mileage {
            amount,
            funded_by: None,
        }
    }

    #[tokio::test]
    async fn issue_uses_kind_default_ttl() {
        let (registry, clock, _dir) = registry().await;
        let code = registry.issue(mileage(1_000), Some(3), None).await.unwrap();
        assert!(code.code.starts_with("ML-"));
        assert_eq!(code.kind, CodeKind::Mileage);
        assert_eq!(code.expires_at - code.created_at, 5 * 60 * 1000);
        assert_eq!(code.status(clock.now_millis()), CodeStatus::Issued);
    }

    #[tokio::test]
    async fn peek_normalizes_and_never_consumes() {
        let (registry, _clock, _dir) = registry().await;
        let code = registry.issue(mileage(500), None, None).await.unwrap();
        let typed = format!("  {}  ", code.code.to_lowercase());
        for _ in 0..3 {
            let seen = registry.peek(&typed).await.unwrap();
            assert!(seen.consumed_at.is_none());
        }
        let consumed = registry.consume(&typed, 8).await.unwrap();
        assert_eq!(consumed.consumed_by, Some(8));
        assert!(matches!(
            registry.peek("ML-UNKNOWN").await.unwrap_err(),
            MileageError::CodeNotFound(_)
        ));
    }

    #[tokio::test]
    async fn rejects_bad_payloads() {
        let (registry, _clock, _dir) = registry().await;
        assert!(matches!(
            registry.issue(mileage(0), None, None).await.unwrap_err(),
            MileageError::InvalidAmount(0)
        ));
        assert!(matches!(
            registry
                .issue(CodePayload::Coupon { definition_id: 404 }, None, None)
                .await
                .unwrap_err(),
            MileageError::CouponNotFound(404)
        ));
        assert!(matches!(
            registry
                .issue(mileage(10), None, Some(Duration::seconds(-1)))
                .await
                .unwrap_err(),
            MileageError::InvalidRequest(_)
        ));
    }

    #[tokio::test]
    async fn ttl_past_clock_range_is_rejected() {
        let (registry, _clock, _dir) = registry().await;
        for ttl in [Duration::MAX, Duration::milliseconds(i64::MAX - 1_000)] {
            assert!(matches!(
                registry.issue(mileage(10), None, Some(ttl)).await.unwrap_err(),
                MileageError::InvalidRequest(_)
            ));
        }
    }

    #[tokio::test]
    async fn list_open_is_scoped_to_owner() {
        let (registry, clock, _dir) = registry().await;
        let kept = registry.issue(mileage(100), Some(3), None).await.unwrap();
        let used = registry.issue(mileage(200), Some(3), None).await.unwrap();
        registry.issue(mileage(300), Some(4), None).await.unwrap();
        registry.consume(&used.code, 8).await.unwrap();

        let open = registry.list_open(3).await.unwrap();
        assert_eq!(open.iter().map(|c| c.code.as_str()).collect::<Vec<_>>(), [kept.code.as_str()]);

        clock.advance(Duration::minutes(5));
        assert!(registry.list_open(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_then_consumed_are_distinct_errors() {
        let (registry, clock, _dir) = registry().await;
        let code = registry.issue(mileage(100), None, None).await.unwrap();
        clock.advance(Duration::minutes(5));
        assert!(matches!(
            registry.consume(&code.code, 1).await.unwrap_err(),
            MileageError::Expired(_)
        ));

        let code = registry.issue(mileage(100), None, None).await.unwrap();
        registry.consume(&code.code, 1).await.unwrap();
        assert!(matches!(
            registry.consume(&code.code, 2).await.unwrap_err(),
            MileageError::AlreadyConsumed(_)
        ));
    }
}
