use sqlx::{SqliteConnection, SqlitePool};

use crate::error::MileageResult;
use crate::models::payment::{PaymentIntent, PaymentStatus};

const INTENT_COLUMNS: &str = "id, code, payer_id, business_id, amount, status, created_at";

pub async fn insert_in_tx(
    conn: &mut SqliteConnection,
    code: &str,
    payer_id: i64,
    business_id: Option<i64>,
    amount: i64,
    now: i64,
) -> MileageResult<PaymentIntent> {
    let intent = sqlx::query_as::<_, PaymentIntent>(&format!(
        "INSERT INTO payment_intents (code, payer_id, business_id, amount, status, created_at) VALUES ($1, $2, $3, $4, $5, $6) RETURNING {}",
        INTENT_COLUMNS
    ))
    .bind(code)
    .bind(payer_id)
    .bind(business_id)
    .bind(amount)
    .bind(PaymentStatus::Pending)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok(intent)
}

#[derive(Debug, Clone)]
pub struct PaymentRepository {
    pool: SqlitePool,
}

impl PaymentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find_by_code(&self, code: &str) -> MileageResult<Option<PaymentIntent>> {
        let intent = sqlx::query_as::<_, PaymentIntent>(&format!(
            "SELECT {} FROM payment_intents WHERE code = $1",
            INTENT_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(intent)
    }

    pub async fn pending_for_business(&self, business_id: i64) -> MileageResult<Vec<PaymentIntent>> {
        let intents = sqlx::query_as::<_, PaymentIntent>(&format!(
            "SELECT {} FROM payment_intents WHERE business_id = $1 AND status = $2 ORDER BY id",
            INTENT_COLUMNS
        ))
        .bind(business_id)
        .bind(PaymentStatus::Pending)
        .fetch_all(&self.pool)
        .await?;
        Ok(intents)
    }
}
