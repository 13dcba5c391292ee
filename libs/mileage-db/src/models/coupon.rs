use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    Fixed,
    Percent,
}

/// Coupon template a business publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct CouponDefinition {
    pub id: i64,
    pub business_id: Option<i64>,
    pub name: String,
    pub discount_type: DiscountType,
    pub discount_value: i64,
    pub min_purchase: i64,
    pub max_discount: Option<i64>,
    pub valid_from: i64,
    pub valid_until: Option<i64>,
    pub total_quantity: Option<i64>,
    pub issued_quantity: i64,
    pub coupon_ttl_days: i64,
    pub is_active: bool,
    pub created_at: i64,
}

impl CouponDefinition {
    pub fn remaining(&self) -> Option<i64> {
        self.total_quantity.map(|total| total - self.issued_quantity)
    }

    pub fn is_open_at(&self, now_millis: i64) -> bool {
        self.is_active
            && self.valid_from <= now_millis
            && self.valid_until.is_none_or(|until| until > now_millis)
    }

    /// Discount on an order, never more than the order itself.
    pub fn discount_for(&self, order_amount: i64) -> i64 {
        let raw = match self.discount_type {
            DiscountType::Fixed => self.discount_value,
            DiscountType::Percent => {
                let raw = i128::from(order_amount) * i128::from(self.discount_value) / 100;
                i64::try_from(raw).unwrap_or(i64::MAX)
            }
        };
        let capped = match self.max_discount {
            Some(cap) => raw.min(cap),
            None => raw,
        };
        capped.clamp(0, order_amount.max(0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCouponDefinition {
    #[serde(default)]
    pub business_id: Option<i64>,
    pub name: String,
    pub discount_type: DiscountType,
    pub discount_value: i64,
    #[serde(default)]
    pub min_purchase: i64,
    #[serde(default)]
    pub max_discount: Option<i64>,
    /// Defaults to creation time.
    #[serde(default)]
    pub valid_from: Option<i64>,
    #[serde(default)]
    pub valid_until: Option<i64>,
    #[serde(default)]
    pub total_quantity: Option<i64>,
    #[serde(default = "default_coupon_ttl_days")]
    pub coupon_ttl_days: i64,
}

fn default_coupon_ttl_days() -> i64 {
    30
}

pub const DAY_MILLIS: i64 = 86_400_000;

/// A coupon's lifetime in milliseconds, `None` when it doesn't fit.
pub fn coupon_ttl_millis(days: i64) -> Option<i64> {
    days.checked_mul(DAY_MILLIS)
}

impl NewCouponDefinition {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name is required".to_string());
        }
        if self.discount_value <= 0 {
            return Err(format!("discount_value must be positive, got {}", self.discount_value));
        }
        if self.discount_type == DiscountType::Percent && self.discount_value > 100 {
            return Err(format!("percent discount above 100: {}", self.discount_value));
        }
        if self.min_purchase < 0 {
            return Err("min_purchase is negative".to_string());
        }
        if self.max_discount.is_some_and(|cap| cap <= 0) {
            return Err("max_discount must be positive".to_string());
        }
        if self.total_quantity.is_some_and(|q| q < 0) {
            return Err("total_quantity is negative".to_string());
        }
        if self.coupon_ttl_days <= 0 {
            return Err("coupon_ttl_days must be positive".to_string());
        }
        if coupon_ttl_millis(self.coupon_ttl_days).is_none() {
            return Err(format!("coupon_ttl_days out of range: {}", self.coupon_ttl_days));
        }
        if let (Some(from), Some(until)) = (self.valid_from, self.valid_until) {
            if until <= from {
                return Err("valid_until must be after valid_from".to_string());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UserCouponStatus {
    Active,
    Used,
    Expired,
}

/// A coupon bound to a user. Its expiry is its own, fixed at issuance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct UserCoupon {
    pub id: i64,
    pub definition_id: i64,
    pub user_id: i64,
    pub source_code: Option<String>,
    pub status: UserCouponStatus,
    pub issued_at: i64,
    pub expires_at: i64,
    pub used_at: Option<i64>,
    pub order_amount: Option<i64>,
    pub discount_amount: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponUse {
    pub coupon: UserCoupon,
    pub discount: i64,
    pub payable: i64,
}
