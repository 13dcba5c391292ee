use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
}

/// Recorded when a payment code is scanned. Settlement happens elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PaymentIntent {
    pub id: i64,
    pub code: String,
    pub payer_id: i64,
    pub business_id: Option<i64>,
    pub amount: i64,
    pub status: PaymentStatus,
    pub created_at: i64,
}
