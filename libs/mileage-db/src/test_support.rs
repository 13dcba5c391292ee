use sqlx::SqlitePool;
use tempfile::TempDir;

/// Fresh migrated database in a temp dir. Keep the `TempDir` alive for as
/// long as the pool is used.
pub async fn test_pool() -> (SqlitePool, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("mileage.db").display());
    let pool = crate::db::connect(&url, 4).await.unwrap();
    (pool, dir)
}

pub const T0: i64 = 1_790_000_000_000;
