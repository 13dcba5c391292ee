use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::{MileageError, MileageResult, is_unique_violation};
use crate::models::account::Account;
use crate::models::transaction::{Reference, ReferenceType, Transaction, TransactionType};

const ACCOUNT_COLUMNS: &str =
    "id, balance, total_earned, total_used, total_expired, created_at, updated_at";
const TRANSACTION_COLUMNS: &str = "id, account_id, type, amount, balance_after, reference_type, reference_id, description, created_at";

pub const MAX_HISTORY_PAGE: i64 = 500;

fn duplicate(reference: &Reference) -> MileageError {
    MileageError::DuplicateReference {
        reference_type: reference.reference_type.to_string(),
        reference_id: reference.reference_id.clone(),
    }
}

/// Creates the zero-balance account if missing. As the first statement of a
/// unit it also takes the write lock, which serializes units on the store.
pub async fn ensure_account(
    conn: &mut SqliteConnection,
    account_id: i64,
    now: i64,
) -> MileageResult<()> {
    sqlx::query(
        "INSERT INTO accounts (id, balance, total_earned, total_used, total_expired, created_at, updated_at) VALUES ($1, 0, 0, 0, 0, $2, $2) ON CONFLICT(id) DO NOTHING",
    )
    .bind(account_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn fetch_account(
    conn: &mut SqliteConnection,
    account_id: i64,
) -> MileageResult<Option<Account>> {
    let account = sqlx::query_as::<_, Account>(&format!(
        "SELECT {} FROM accounts WHERE id = $1",
        ACCOUNT_COLUMNS
    ))
    .bind(account_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(account)
}

/// Current balance, creating the account if needed.
pub async fn balance_in_tx(
    conn: &mut SqliteConnection,
    account_id: i64,
    now: i64,
) -> MileageResult<i64> {
    ensure_account(conn, account_id, now).await?;
    let balance: i64 = sqlx::query_scalar("SELECT balance FROM accounts WHERE id = $1")
        .bind(account_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(balance)
}

pub async fn reference_applied(
    conn: &mut SqliteConnection,
    reference: &Reference,
) -> MileageResult<bool> {
    let applied: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM transactions WHERE reference_type = $1 AND reference_id = $2)",
    )
    .bind(reference.reference_type)
    .bind(&reference.reference_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(applied)
}

/// Append one transaction and move the cached balance with it.
///
/// Debits are a conditional decrement (`balance >= amount`) evaluated by the
/// store, never a read-then-write. The caller owns the surrounding
/// transaction; on any error it must be dropped, not committed.
pub async fn apply_in_tx(
    conn: &mut SqliteConnection,
    account_id: i64,
    tx_type: TransactionType,
    amount: i64,
    reference: &Reference,
    description: Option<&str>,
    now: i64,
) -> MileageResult<Transaction> {
    if amount <= 0 {
        return Err(MileageError::InvalidAmount(amount));
    }

    ensure_account(conn, account_id, now).await?;

    if reference_applied(conn, reference).await? {
        return Err(duplicate(reference));
    }

    let sql = match tx_type {
        TransactionType::Earn => {
            // total_earned bounds the balance, so one headroom check covers both.
            "UPDATE accounts SET balance = balance + $1, total_earned = total_earned + $1, updated_at = $2 WHERE id = $3 AND total_earned <= $4 - $1 RETURNING balance"
        }
        TransactionType::Use => {
            "UPDATE accounts SET balance = balance - $1, total_used = total_used + $1, updated_at = $2 WHERE id = $3 AND balance >= $1 RETURNING balance"
        }
        TransactionType::Expire => {
            "UPDATE accounts SET balance = balance - $1, total_expired = total_expired + $1, updated_at = $2 WHERE id = $3 AND balance >= $1 RETURNING balance"
        }
    };
    let mut update = sqlx::query_scalar::<_, i64>(sql)
        .bind(amount)
        .bind(now)
        .bind(account_id);
    if tx_type == TransactionType::Earn {
        update = update.bind(i64::MAX);
    }
    let balance_after = update.fetch_optional(&mut *conn).await?;

    let Some(balance_after) = balance_after else {
        if tx_type == TransactionType::Earn {
            return Err(MileageError::InvalidAmount(amount));
        }
        let available: i64 = sqlx::query_scalar("SELECT balance FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_one(&mut *conn)
            .await?;
        return Err(MileageError::InsufficientBalance {
            requested: amount,
            available,
        });
    };

    sqlx::query_as::<_, Transaction>(&format!(
        "INSERT INTO transactions (account_id, type, amount, balance_after, reference_type, reference_id, description, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {}",
        TRANSACTION_COLUMNS
    ))
    .bind(account_id)
    .bind(tx_type)
    .bind(amount)
    .bind(balance_after)
    .bind(reference.reference_type)
    .bind(&reference.reference_id)
    .bind(description)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            duplicate(reference)
        } else {
            e.into()
        }
    })
}

/// Earn transactions of one reference type since `since` (inclusive).
pub async fn count_rewards_since(
    conn: &mut SqliteConnection,
    account_id: i64,
    reference_type: ReferenceType,
    since: i64,
) -> MileageResult<u32> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM transactions WHERE account_id = $1 AND reference_type = $2 AND type = $3 AND created_at >= $4",
    )
    .bind(account_id)
    .bind(reference_type)
    .bind(TransactionType::Earn)
    .bind(since)
    .fetch_one(&mut *conn)
    .await?;
    Ok(u32::try_from(count).unwrap_or(u32::MAX))
}

/// Result of re-walking an account's transaction chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAudit {
    pub account: Account,
    pub transaction_count: usize,
    /// First transaction whose `balance_after` doesn't follow its
    /// predecessor.
    pub first_break: Option<i64>,
    pub projection_matches: bool,
}

impl LedgerAudit {
    pub fn is_clean(&self) -> bool {
        self.first_break.is_none() && self.projection_matches
    }
}

#[derive(Debug, Clone)]
pub struct LedgerRepository {
    pool: SqlitePool,
}

impl LedgerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The account, created with a zero balance if it doesn't exist yet.
    pub async fn get_or_create(&self, account_id: i64, now: i64) -> MileageResult<Account> {
        if let Some(account) = self.find(account_id).await? {
            return Ok(account);
        }
        let mut tx = self.pool.begin().await?;
        ensure_account(&mut tx, account_id, now).await?;
        let account = fetch_account(&mut tx, account_id)
            .await?
            .ok_or_else(|| MileageError::Database(sqlx::Error::RowNotFound))?;
        tx.commit().await?;
        Ok(account)
    }

    pub async fn find(&self, account_id: i64) -> MileageResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    /// Newest first. A zero limit is an empty page; pages above
    /// `MAX_HISTORY_PAGE` are cut down to it.
    pub async fn history(
        &self,
        account_id: i64,
        limit: i64,
        offset: i64,
    ) -> MileageResult<Vec<Transaction>> {
        if limit < 0 || offset < 0 {
            return Err(MileageError::InvalidRequest(format!(
                "negative page bounds: limit {}, offset {}",
                limit, offset
            )));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {} FROM transactions WHERE account_id = $1 ORDER BY id DESC LIMIT $2 OFFSET $3",
            TRANSACTION_COLUMNS
        ))
        .bind(account_id)
        .bind(limit.min(MAX_HISTORY_PAGE))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Re-derive the balance from the log and compare with the projection.
    /// Runs inside one read transaction so it sees a single snapshot.
    pub async fn audit(&self, account_id: i64) -> MileageResult<Option<LedgerAudit>> {
        let mut tx = self.pool.begin().await?;
        let Some(account) = fetch_account(&mut tx, account_id).await? else {
            return Ok(None);
        };
        let chain = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {} FROM transactions WHERE account_id = $1 ORDER BY id ASC",
            TRANSACTION_COLUMNS
        ))
        .bind(account_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut running = 0i64;
        let (mut earned, mut used, mut expired) = (0i64, 0i64, 0i64);
        let mut first_break = None;
        for entry in &chain {
            running += entry.delta();
            match entry.tx_type {
                TransactionType::Earn => earned += entry.amount,
                TransactionType::Use => used += entry.amount,
                TransactionType::Expire => expired += entry.amount,
            }
            if first_break.is_none() && entry.balance_after != running {
                first_break = Some(entry.id);
            }
        }
        let last_balance = chain.last().map(|t| t.balance_after).unwrap_or(0);
        let projection_matches = account.is_consistent()
            && account.balance == last_balance
            && account.total_earned == earned
            && account.total_used == used
            && account.total_expired == expired;

        Ok(Some(LedgerAudit {
            account,
            transaction_count: chain.len(),
            first_break,
            projection_matches,
        }))
    }
}
