use mileage_db::MileageResult;
use mileage_db::models::coupon::{
    CouponDefinition, CouponUse, NewCouponDefinition, UserCoupon, UserCouponStatus,
};
use mileage_db::repositories::coupon_repo::{self, CouponRepository};
use mileage_shared::Clock;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

use super::with_conflict_retry;

#[derive(Debug, Clone)]
pub struct CouponService {
    pool: SqlitePool,
    repo: CouponRepository,
    clock: Arc<dyn Clock>,
    retries: u32,
}

impl CouponService {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, retries: u32) -> Self {
        Self {
            repo: CouponRepository::new(pool.clone()),
            pool,
            clock,
            retries,
        }
    }

    pub async fn create_definition(
        &self,
        new: &NewCouponDefinition,
    ) -> MileageResult<CouponDefinition> {
        let definition = self
            .repo
            .create_definition(new, self.clock.now_millis())
            .await?;
        info!(
            "Created coupon definition {} '{}' (quantity {:?})",
            definition.id, definition.name, definition.total_quantity
        );
        Ok(definition)
    }

    pub async fn get_definition(&self, id: i64) -> MileageResult<Option<CouponDefinition>> {
        self.repo.get_definition(id).await
    }

    pub async fn list_definitions(
        &self,
        business_id: Option<i64>,
    ) -> MileageResult<Vec<CouponDefinition>> {
        self.repo.list_definitions(business_id).await
    }

    pub async fn set_active(&self, id: i64, active: bool) -> MileageResult<CouponDefinition> {
        self.repo.set_active(id, active).await
    }

    /// Hand one coupon of a definition to a user, outside any code
    /// redemption (admin grant, campaign).
    pub async fn issue_to_user(
        &self,
        definition_id: i64,
        user_id: i64,
    ) -> MileageResult<UserCoupon> {
        let coupon = with_conflict_retry("coupon issue", self.retries, move || {
            self.issue_once(definition_id, user_id)
        })
        .await?;
        info!(
            "Issued coupon {} of definition {} to user {}",
            coupon.id, definition_id, user_id
        );
        Ok(coupon)
    }

    async fn issue_once(&self, definition_id: i64, user_id: i64) -> MileageResult<UserCoupon> {
        let now = self.clock.now_millis();
        let mut tx = self.pool.begin().await?;
        let coupon = coupon_repo::issue_in_tx(&mut tx, definition_id, user_id, None, now).await?;
        tx.commit().await?;
        Ok(coupon)
    }

    /// Apply a user's coupon to an order.
    pub async fn redeem_user_coupon(
        &self,
        coupon_id: i64,
        user_id: i64,
        order_amount: i64,
    ) -> MileageResult<CouponUse> {
        let now = self.clock.now_millis();
        let used = with_conflict_retry("coupon use", self.retries, move || {
            self.repo.use_coupon(coupon_id, user_id, order_amount, now)
        })
        .await?;
        info!(
            "User {} used coupon {}: discount {} on {}",
            user_id, coupon_id, used.discount, order_amount
        );
        Ok(used)
    }

    pub async fn list_user_coupons(
        &self,
        user_id: i64,
        status: Option<UserCouponStatus>,
    ) -> MileageResult<Vec<UserCoupon>> {
        self.repo.list_user_coupons(user_id, status).await
    }

    pub async fn expire_user_coupons(&self) -> MileageResult<u64> {
        let now = self.clock.now_millis();
        let expired = with_conflict_retry("coupon expiry sweep", self.retries, move || {
            self.repo.expire_due(now)
        })
        .await?;
        if expired > 0 {
            info!("Expired {} user coupons", expired);
        }
        Ok(expired)
    }
}
