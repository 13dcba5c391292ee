use sqlx::{SqliteConnection, SqlitePool};

use crate::error::{MileageError, MileageResult};
use crate::models::coupon::{
    CouponDefinition, CouponUse, NewCouponDefinition, UserCoupon, UserCouponStatus,
    coupon_ttl_millis,
};

const DEFINITION_COLUMNS: &str = "id, business_id, name, discount_type, discount_value, min_purchase, max_discount, valid_from, valid_until, total_quantity, issued_quantity, coupon_ttl_days, is_active, created_at";
const USER_COUPON_COLUMNS: &str = "id, definition_id, user_id, source_code, status, issued_at, expires_at, used_at, order_amount, discount_amount";

pub async fn definition_in_tx(
    conn: &mut SqliteConnection,
    definition_id: i64,
) -> MileageResult<Option<CouponDefinition>> {
    let definition = sqlx::query_as::<_, CouponDefinition>(&format!(
        "SELECT {} FROM coupon_definitions WHERE id = $1",
        DEFINITION_COLUMNS
    ))
    .bind(definition_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(definition)
}

/// Issue one coupon to `user_id`, counting it against the definition's cap.
///
/// The cap check and the increment are one conditional update, so two
/// issuers can never both take the last unit.
pub async fn issue_in_tx(
    conn: &mut SqliteConnection,
    definition_id: i64,
    user_id: i64,
    source_code: Option<&str>,
    now: i64,
) -> MileageResult<UserCoupon> {
    let ttl_days: Option<i64> = sqlx::query_scalar(
        "UPDATE coupon_definitions SET issued_quantity = issued_quantity + 1 \
         WHERE id = $1 AND is_active = TRUE AND valid_from <= $2 \
         AND (valid_until IS NULL OR valid_until > $2) \
         AND (total_quantity IS NULL OR issued_quantity < total_quantity) \
         RETURNING coupon_ttl_days",
    )
    .bind(definition_id)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(ttl_days) = ttl_days else {
        return Err(match definition_in_tx(conn, definition_id).await? {
            None => MileageError::CouponNotFound(definition_id),
            Some(definition) if !definition.is_open_at(now) => {
                MileageError::CouponUnavailable(definition_id)
            }
            Some(_) => MileageError::QuantityExhausted(definition_id),
        });
    };

    let expires_at = coupon_ttl_millis(ttl_days)
        .and_then(|ttl| now.checked_add(ttl))
        .ok_or_else(|| {
            MileageError::InvalidRequest(format!("coupon expiry out of range: {} days", ttl_days))
        })?;

    let coupon = sqlx::query_as::<_, UserCoupon>(&format!(
        "INSERT INTO user_coupons (definition_id, user_id, source_code, status, issued_at, expires_at) VALUES ($1, $2, $3, $4, $5, $6) RETURNING {}",
        USER_COUPON_COLUMNS
    ))
    .bind(definition_id)
    .bind(user_id)
    .bind(source_code)
    .bind(UserCouponStatus::Active)
    .bind(now)
    .bind(expires_at)
    .fetch_one(&mut *conn)
    .await?;
    Ok(coupon)
}

#[derive(Debug, Clone)]
pub struct CouponRepository {
    pool: SqlitePool,
}

impl CouponRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_definition(
        &self,
        new: &NewCouponDefinition,
        now: i64,
    ) -> MileageResult<CouponDefinition> {
        new.validate().map_err(MileageError::InvalidRequest)?;
        let definition = sqlx::query_as::<_, CouponDefinition>(&format!(
            "INSERT INTO coupon_definitions (business_id, name, discount_type, discount_value, min_purchase, max_discount, valid_from, valid_until, total_quantity, issued_quantity, coupon_ttl_days, is_active, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, $10, TRUE, $11) RETURNING {}",
            DEFINITION_COLUMNS
        ))
        .bind(new.business_id)
        .bind(new.name.trim())
        .bind(new.discount_type)
        .bind(new.discount_value)
        .bind(new.min_purchase)
        .bind(new.max_discount)
        .bind(new.valid_from.unwrap_or(now))
        .bind(new.valid_until)
        .bind(new.total_quantity)
        .bind(new.coupon_ttl_days)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(definition)
    }

    pub async fn get_definition(&self, id: i64) -> MileageResult<Option<CouponDefinition>> {
        let definition = sqlx::query_as::<_, CouponDefinition>(&format!(
            "SELECT {} FROM coupon_definitions WHERE id = $1",
            DEFINITION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(definition)
    }

    pub async fn list_definitions(&self, business_id: Option<i64>) -> MileageResult<Vec<CouponDefinition>> {
        let definitions = match business_id {
            Some(business_id) => {
                sqlx::query_as::<_, CouponDefinition>(&format!(
                    "SELECT {} FROM coupon_definitions WHERE business_id = $1 ORDER BY id",
                    DEFINITION_COLUMNS
                ))
                .bind(business_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, CouponDefinition>(&format!(
                    "SELECT {} FROM coupon_definitions ORDER BY id",
                    DEFINITION_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(definitions)
    }

    /// Closing a definition stops new issuance. Coupons already issued stay
    /// usable until their own expiry.
    pub async fn set_active(&self, id: i64, active: bool) -> MileageResult<CouponDefinition> {
        let definition = sqlx::query_as::<_, CouponDefinition>(&format!(
            "UPDATE coupon_definitions SET is_active = $1 WHERE id = $2 RETURNING {}",
            DEFINITION_COLUMNS
        ))
        .bind(active)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        definition.ok_or(MileageError::CouponNotFound(id))
    }

    pub async fn get_user_coupon(&self, id: i64) -> MileageResult<Option<UserCoupon>> {
        let coupon = sqlx::query_as::<_, UserCoupon>(&format!(
            "SELECT {} FROM user_coupons WHERE id = $1",
            USER_COUPON_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(coupon)
    }

    pub async fn list_user_coupons(
        &self,
        user_id: i64,
        status: Option<UserCouponStatus>,
    ) -> MileageResult<Vec<UserCoupon>> {
        let coupons = match status {
            Some(status) => {
                sqlx::query_as::<_, UserCoupon>(&format!(
                    "SELECT {} FROM user_coupons WHERE user_id = $1 AND status = $2 ORDER BY id DESC",
                    USER_COUPON_COLUMNS
                ))
                .bind(user_id)
                .bind(status)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, UserCoupon>(&format!(
                    "SELECT {} FROM user_coupons WHERE user_id = $1 ORDER BY id DESC",
                    USER_COUPON_COLUMNS
                ))
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(coupons)
    }

    /// Apply a user's coupon to an order. The active to used transition is
    /// a single conditional update; a concurrent second use loses it.
    pub async fn use_coupon(
        &self,
        coupon_id: i64,
        user_id: i64,
        order_amount: i64,
        now: i64,
    ) -> MileageResult<CouponUse> {
        if order_amount <= 0 {
            return Err(MileageError::InvalidAmount(order_amount));
        }
        let coupon = self
            .get_user_coupon(coupon_id)
            .await?
            .filter(|c| c.user_id == user_id)
            .ok_or(MileageError::CouponNotFound(coupon_id))?;
        check_usable(&coupon, now)?;

        let definition = self
            .get_definition(coupon.definition_id)
            .await?
            .ok_or(MileageError::CouponNotFound(coupon.definition_id))?;
        if order_amount < definition.min_purchase {
            return Err(MileageError::CouponNotUsable {
                id: coupon_id,
                reason: format!(
                    "order below minimum purchase of {}",
                    definition.min_purchase
                ),
            });
        }
        let discount = definition.discount_for(order_amount);

        let used = sqlx::query_as::<_, UserCoupon>(&format!(
            "UPDATE user_coupons SET status = $1, used_at = $2, order_amount = $3, discount_amount = $4 \
             WHERE id = $5 AND user_id = $6 AND status = $7 AND expires_at > $2 RETURNING {}",
            USER_COUPON_COLUMNS
        ))
        .bind(UserCouponStatus::Used)
        .bind(now)
        .bind(order_amount)
        .bind(discount)
        .bind(coupon_id)
        .bind(user_id)
        .bind(UserCouponStatus::Active)
        .fetch_optional(&self.pool)
        .await?;

        match used {
            Some(coupon) => Ok(CouponUse {
                coupon,
                discount,
                payable: order_amount - discount,
            }),
            None => {
                let current = self
                    .get_user_coupon(coupon_id)
                    .await?
                    .ok_or(MileageError::CouponNotFound(coupon_id))?;
                check_usable(&current, now)?;
                Err(MileageError::PersistenceConflict(format!(
                    "coupon {} changed during use",
                    coupon_id
                )))
            }
        }
    }

    /// Sweeps active coupons past their expiry. Returns how many moved.
    pub async fn expire_due(&self, now: i64) -> MileageResult<u64> {
        let result = sqlx::query(
            "UPDATE user_coupons SET status = $1 WHERE status = $2 AND expires_at <= $3",
        )
        .bind(UserCouponStatus::Expired)
        .bind(UserCouponStatus::Active)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn check_usable(coupon: &UserCoupon, now: i64) -> MileageResult<()> {
    let reason = match coupon.status {
        UserCouponStatus::Used => "already used",
        UserCouponStatus::Expired => "expired",
        UserCouponStatus::Active if coupon.expires_at <= now => "expired",
        UserCouponStatus::Active => return Ok(()),
    };
    Err(MileageError::CouponNotUsable {
        id: coupon.id,
        reason: reason.to_string(),
    })
}
