use rand::Rng;
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::{MileageError, MileageResult};
use crate::models::redemption_code::{CodeKind, CodePayload, RedemptionCode};

const CODE_COLUMNS: &str =
    "code, kind, owner_scope, payload, created_at, expires_at, consumed_at, consumed_by";

/// No 0/O or 1/I: codes get read aloud and typed by hand.
const CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_BODY_LEN: usize = 12;

/// A fresh code like `ML-7KQ2XH9WPA3M`, drawn from the thread-local CSPRNG.
/// Uniqueness is still up to the store's primary key.
pub fn generate_code(kind: CodeKind) -> String {
    let mut rng = rand::rng();
    let body: String = (0..CODE_BODY_LEN)
        .map(|_| char::from(CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())]))
        .collect();
    format!("{}-{}", kind.prefix(), body)
}

/// Stores a freshly generated code. `Ok(None)` means the value is already
/// taken and the caller should draw another one.
pub async fn insert_code(
    conn: &mut SqliteConnection,
    code: &str,
    payload: &CodePayload,
    owner_scope: Option<i64>,
    now: i64,
    expires_at: i64,
) -> MileageResult<Option<RedemptionCode>> {
    let payload_json = serde_json::to_string(payload)?;
    let row = sqlx::query(&format!(
        "INSERT INTO redemption_codes (code, kind, owner_scope, payload, created_at, expires_at) VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT(code) DO NOTHING RETURNING {}",
        CODE_COLUMNS
    ))
    .bind(code)
    .bind(payload.kind())
    .bind(owner_scope)
    .bind(payload_json)
    .bind(now)
    .bind(expires_at)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(RedemptionCode::from_row).transpose()
}

/// Marks the code consumed by `consumer`. Exactly one caller can win the
/// conditional update; everyone else gets the reason it failed.
pub async fn consume_in_tx(
    conn: &mut SqliteConnection,
    code: &str,
    consumer: i64,
    now: i64,
) -> MileageResult<RedemptionCode> {
    let row = sqlx::query(&format!(
        "UPDATE redemption_codes SET consumed_at = $1, consumed_by = $2 WHERE code = $3 AND consumed_at IS NULL AND expires_at > $1 RETURNING {}",
        CODE_COLUMNS
    ))
    .bind(now)
    .bind(consumer)
    .bind(code)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(row) = row {
        return RedemptionCode::from_row(&row);
    }

    match find_in_tx(conn, code).await? {
        None => Err(MileageError::CodeNotFound(code.to_string())),
        Some(existing) if existing.consumed_at.is_some() => {
            Err(MileageError::AlreadyConsumed(code.to_string()))
        }
        Some(_) => Err(MileageError::Expired(code.to_string())),
    }
}

pub async fn find_in_tx(
    conn: &mut SqliteConnection,
    code: &str,
) -> MileageResult<Option<RedemptionCode>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM redemption_codes WHERE code = $1",
        CODE_COLUMNS
    ))
    .bind(code)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(RedemptionCode::from_row).transpose()
}

#[derive(Debug, Clone)]
pub struct CodeRepository {
    pool: SqlitePool,
}

impl CodeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find(&self, code: &str) -> MileageResult<Option<RedemptionCode>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM redemption_codes WHERE code = $1",
            CODE_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(RedemptionCode::from_row).transpose()
    }

    /// Unconsumed, unexpired codes issued under a scope, newest first.
    pub async fn list_open(&self, owner_scope: i64, now: i64) -> MileageResult<Vec<RedemptionCode>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM redemption_codes WHERE owner_scope = $1 AND consumed_at IS NULL AND expires_at > $2 ORDER BY created_at DESC",
            CODE_COLUMNS
        ))
        .bind(owner_scope)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(RedemptionCode::from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::redemption_code::CodeStatus;
    use crate::test_support::{T0, test_pool};

    const FIVE_MINUTES: i64 = 5 * 60 * 1000;

    #[test]
    fn generated_codes_are_prefixed_and_unambiguous() {
        let code = generate_code(CodeKind::Coupon);
        let (prefix, body) = code.split_once('-').unwrap();
        assert_eq!(prefix, "CP");
        assert_eq!(body.len(), CODE_BODY_LEN);
        assert!(body.bytes().all(|b| CODE_ALPHABET.contains(&b)));
        assert_ne!(generate_code(CodeKind::Coupon), code);
    }

    async fn issue(pool: &SqlitePool, code: &str) -> Option<RedemptionCode> {
        let mut conn = pool.acquire().await.unwrap();
        insert_code(
            &mut conn,
            code,
            &CodePayload::Mileage {
                amount: 1_000,
                funded_by: None,
            },
            Some(9),
            T0,
            T0 + FIVE_MINUTES,
        )
        .await
        .unwrap()
    }

    async fn consume(pool: &SqlitePool, code: &str, consumer: i64, now: i64) -> MileageResult<RedemptionCode> {
        let mut tx = pool.begin().await?;
        let consumed = consume_in_tx(&mut tx, code, consumer, now).await?;
        tx.commit().await?;
        Ok(consumed)
    }

    #[tokio::test]
    async fn duplicate_value_asks_for_another_draw() {
        let (pool, _dir) = test_pool().await;
        assert!(issue(&pool, "ML-AAAA").await.is_some());
        assert!(issue(&pool, "ML-AAAA").await.is_none());
    }

    #[tokio::test]
    async fn consume_once_then_already_consumed() {
        let (pool, _dir) = test_pool().await;
        issue(&pool, "ML-BBBB").await.unwrap();

        let consumed = consume(&pool, "ML-BBBB", 1, T0 + 1_000).await.unwrap();
        assert_eq!(consumed.consumed_by, Some(1));
        assert_eq!(consumed.status(T0 + 1_000), CodeStatus::Consumed);

        let err = consume(&pool, "ML-BBBB", 2, T0 + 2_000).await.unwrap_err();
        assert!(matches!(err, MileageError::AlreadyConsumed(_)));

        let stored = CodeRepository::new(pool).find("ML-BBBB").await.unwrap().unwrap();
        assert_eq!(stored.consumed_by, Some(1));
    }

    #[tokio::test]
    async fn expiry_boundary_is_exclusive() {
        let (pool, _dir) = test_pool().await;
        issue(&pool, "ML-CCCC").await.unwrap();
        let err = consume(&pool, "ML-CCCC", 1, T0 + FIVE_MINUTES).await.unwrap_err();
        assert!(matches!(err, MileageError::Expired(_)));

        issue(&pool, "ML-DDDD").await.unwrap();
        assert!(consume(&pool, "ML-DDDD", 1, T0 + FIVE_MINUTES - 1).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_code() {
        let (pool, _dir) = test_pool().await;
        let err = consume(&pool, "ML-NOPE", 1, T0).await.unwrap_err();
        assert!(matches!(err, MileageError::CodeNotFound(_)));
    }

    #[tokio::test]
    async fn consumed_codes_are_terminal_in_the_store() {
        let (pool, _dir) = test_pool().await;
        issue(&pool, "ML-EEEE").await.unwrap();
        consume(&pool, "ML-EEEE", 1, T0 + 1).await.unwrap();
        let reset = sqlx::query("UPDATE redemption_codes SET consumed_at = NULL, consumed_by = NULL WHERE code = $1")
            .bind("ML-EEEE")
            .execute(&pool)
            .await;
        assert!(reset.is_err());
    }

    #[tokio::test]
    async fn list_open_skips_consumed_and_expired() {
        let (pool, _dir) = test_pool().await;
        issue(&pool, "ML-F1").await.unwrap();
        issue(&pool, "ML-F2").await.unwrap();
        consume(&pool, "ML-F1", 3, T0 + 10).await.unwrap();

        let repo = CodeRepository::new(pool);
        let open = repo.list_open(9, T0 + 10).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].code, "ML-F2");
        assert!(repo.list_open(9, T0 + FIVE_MINUTES).await.unwrap().is_empty());
    }
}
