use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::error::MileageResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CodeKind {
    Coupon,
    Mileage,
    Payment,
}

impl CodeKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            CodeKind::Coupon => "CP",
            CodeKind::Mileage => "ML",
            CodeKind::Payment => "PY",
        }
    }
}

/// What consuming the code does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CodePayload {
    /// Binds one coupon from the definition to whoever redeems the code.
    Coupon { definition_id: i64 },
    /// Credits the consumer. With `funded_by`, the same amount is debited
    /// from that account in the same unit.
    Mileage {
        amount: i64,
        #[serde(default)]
        funded_by: Option<i64>,
    },
    /// Opens a pending payment intent from the consumer to the business.
    Payment {
        amount: i64,
        #[serde(default)]
        business_id: Option<i64>,
    },
}

impl CodePayload {
    pub fn kind(&self) -> CodeKind {
        match self {
            CodePayload::Coupon { .. } => CodeKind::Coupon,
            CodePayload::Mileage { .. } => CodeKind::Mileage,
            CodePayload::Payment { .. } => CodeKind::Payment,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeStatus {
    Issued,
    Consumed,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionCode {
    pub code: String,
    pub kind: CodeKind,
    pub owner_scope: Option<i64>,
    pub payload: CodePayload,
    pub created_at: i64,
    pub expires_at: i64,
    pub consumed_at: Option<i64>,
    pub consumed_by: Option<i64>,
}

impl RedemptionCode {
    /// Consumption wins over expiry: a code used in time stays "consumed".
    pub fn status(&self, now_millis: i64) -> CodeStatus {
        if self.consumed_at.is_some() {
            CodeStatus::Consumed
        } else if self.expires_at <= now_millis {
            CodeStatus::Expired
        } else {
            CodeStatus::Issued
        }
    }

    pub(crate) fn from_row(row: &SqliteRow) -> MileageResult<Self> {
        let payload: String = row.try_get("payload")?;
        Ok(Self {
            code: row.try_get("code")?,
            kind: row.try_get("kind")?,
            owner_scope: row.try_get("owner_scope")?,
            payload: serde_json::from_str(&payload)?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
            consumed_at: row.try_get("consumed_at")?,
            consumed_by: row.try_get("consumed_by")?,
        })
    }
}

/// Canonical form of user-typed codes.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}
