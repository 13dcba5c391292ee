use sqlx::{SqliteConnection, SqlitePool};

use crate::error::{MileageError, MileageResult};
use crate::models::referral::Referral;

/// Records that `referee_id` joined through `referrer_id`. A user can be
/// referred only once.
pub async fn insert_in_tx(
    conn: &mut SqliteConnection,
    referrer_id: i64,
    referee_id: i64,
    now: i64,
) -> MileageResult<Referral> {
    if referrer_id == referee_id {
        return Err(MileageError::InvalidRequest(
            "a user cannot refer themselves".to_string(),
        ));
    }
    let referral = sqlx::query_as::<_, Referral>(
        "INSERT INTO referrals (referrer_id, referee_id, created_at) VALUES ($1, $2, $3) \
         ON CONFLICT(referee_id) DO NOTHING RETURNING id, referrer_id, referee_id, created_at",
    )
    .bind(referrer_id)
    .bind(referee_id)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    referral.ok_or_else(|| MileageError::DuplicateReference {
        reference_type: "referral".to_string(),
        reference_id: referee_id.to_string(),
    })
}

pub async fn count_in_tx(conn: &mut SqliteConnection, referrer_id: i64) -> MileageResult<u32> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM referrals WHERE referrer_id = $1")
        .bind(referrer_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(u32::try_from(count).unwrap_or(u32::MAX))
}

/// 1-based position of `referral_id` among `referrer_id`'s referrals, in
/// insertion order. `None` when the referral isn't one of theirs.
pub async fn position_in_tx(
    conn: &mut SqliteConnection,
    referrer_id: i64,
    referral_id: i64,
) -> MileageResult<Option<u32>> {
    let position: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM referrals WHERE referrer_id = $1 AND id <= $2 \
         AND EXISTS (SELECT 1 FROM referrals WHERE id = $2 AND referrer_id = $1)",
    )
    .bind(referrer_id)
    .bind(referral_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok((position > 0).then(|| u32::try_from(position).unwrap_or(u32::MAX)))
}

#[derive(Debug, Clone)]
pub struct ReferralRepository {
    pool: SqlitePool,
}

impl ReferralRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn count(&self, referrer_id: i64) -> MileageResult<u32> {
        let mut conn = self.pool.acquire().await?;
        count_in_tx(&mut conn, referrer_id).await
    }

    pub async fn find_by_referee(&self, referee_id: i64) -> MileageResult<Option<Referral>> {
        let referral = sqlx::query_as::<_, Referral>(
            "SELECT id, referrer_id, referee_id, created_at FROM referrals WHERE referee_id = $1",
        )
        .bind(referee_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(referral)
    }

    pub async fn list(&self, referrer_id: i64) -> MileageResult<Vec<Referral>> {
        let referrals = sqlx::query_as::<_, Referral>(
            "SELECT id, referrer_id, referee_id, created_at FROM referrals WHERE referrer_id = $1 ORDER BY id",
        )
        .bind(referrer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(referrals)
    }
}
