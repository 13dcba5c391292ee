use mileage_db::models::account::Account;
use mileage_db::models::transaction::{Reference, Transaction, TransactionType};
use mileage_db::repositories::ledger_repo::{self, LedgerAudit, LedgerRepository};
use mileage_db::{MileageError, MileageResult};
use mileage_shared::Clock;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::with_conflict_retry;

/// Balances and the transaction log behind them.
#[derive(Debug, Clone)]
pub struct LedgerService {
    pool: SqlitePool,
    repo: LedgerRepository,
    clock: Arc<dyn Clock>,
    retries: u32,
}

impl LedgerService {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, retries: u32) -> Self {
        Self {
            repo: LedgerRepository::new(pool.clone()),
            pool,
            clock,
            retries,
        }
    }

    /// Append one transaction and move the balance with it, as one unit.
    pub async fn apply(
        &self,
        account_id: i64,
        tx_type: TransactionType,
        amount: i64,
        reference: &Reference,
        description: Option<&str>,
    ) -> MileageResult<Transaction> {
        let applied = with_conflict_retry("ledger apply", self.retries, move || {
            self.apply_once(account_id, tx_type, amount, reference, description)
        })
        .await;

        match &applied {
            Ok(entry) => info!(
                "Ledger {} {} on account {} ({}), balance now {}",
                tx_type.as_str(),
                amount,
                account_id,
                reference,
                entry.balance_after
            ),
            Err(e) if e.is_benign() => {
                debug!("Ledger {} skipped for {}: {}", tx_type.as_str(), reference, e)
            }
            Err(MileageError::InsufficientBalance { .. }) => {}
            Err(e) => warn!(
                "Ledger {} of {} on account {} failed: {}",
                tx_type.as_str(),
                amount,
                account_id,
                e
            ),
        }
        applied
    }

    async fn apply_once(
        &self,
        account_id: i64,
        tx_type: TransactionType,
        amount: i64,
        reference: &Reference,
        description: Option<&str>,
    ) -> MileageResult<Transaction> {
        let now = self.clock.now_millis();
        let mut tx = self.pool.begin().await?;
        let entry = ledger_repo::apply_in_tx(
            &mut tx,
            account_id,
            tx_type,
            amount,
            reference,
            description,
            now,
        )
        .await?;
        tx.commit().await?;
        Ok(entry)
    }

    pub async fn spend(
        &self,
        account_id: i64,
        amount: i64,
        reference: &Reference,
    ) -> MileageResult<Transaction> {
        self.apply(account_id, TransactionType::Use, amount, reference, None)
            .await
    }

    pub async fn expire(
        &self,
        account_id: i64,
        amount: i64,
        reference: &Reference,
    ) -> MileageResult<Transaction> {
        self.apply(
            account_id,
            TransactionType::Expire,
            amount,
            reference,
            Some("mileage expired"),
        )
        .await
    }

    pub async fn account(&self, account_id: i64) -> MileageResult<Account> {
        let now = self.clock.now_millis();
        with_conflict_retry("account lookup", self.retries, move || {
            self.repo.get_or_create(account_id, now)
        })
        .await
    }

    pub async fn get_balance(&self, account_id: i64) -> MileageResult<i64> {
        Ok(self.account(account_id).await?.balance)
    }

    pub async fn history(
        &self,
        account_id: i64,
        limit: i64,
        offset: i64,
    ) -> MileageResult<Vec<Transaction>> {
        debug!(
            "History for account {} (limit {}, offset {})",
            account_id, limit, offset
        );
        self.repo.history(account_id, limit, offset).await
    }

    /// Re-walk the account's chain and compare it with the cached balance.
    pub async fn verify(&self, account_id: i64) -> MileageResult<LedgerAudit> {
        self.account(account_id).await?;
        let audit = self
            .repo
            .audit(account_id)
            .await?
            .ok_or(MileageError::Database(sqlx::Error::RowNotFound))?;
        if !audit.is_clean() {
            warn!(
                "Ledger audit failed for account {}: first break {:?}, projection matches {}",
                account_id, audit.first_break, audit.projection_matches
            );
        }
        Ok(audit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mileage_db::models::transaction::ReferenceType;
    use mileage_shared::ManualClock;
    use tempfile::TempDir;

    async fn service() -> (LedgerService, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("ledger.db").display());
        let pool = mileage_db::db::connect(&url, 2).await.unwrap();
        let clock = Arc::new(ManualClock::new(1_790_000_000_000));
        (LedgerService::new(pool, clock, 3), dir)
    }

    #[tokio::test]
    async fn balance_of_unknown_account_is_zero() {
        let (ledger, _dir) = service().await;
        assert_eq!(ledger.get_balance(41).await.unwrap(), 0);
        assert!(ledger.history(41, 10, 0).await.unwrap().is_empty());
        assert!(ledger.verify(41).await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn spend_and_expire_are_debits() {
        let (ledger, _dir) = service().await;
        ledger
            .apply(
                1,
                TransactionType::Earn,
                1_000,
                &Reference::new(ReferenceType::Signup, "1"),
                Some("welcome"),
            )
            .await
            .unwrap();
        ledger
            .spend(1, 300, &Reference::new(ReferenceType::Purchase, "o-1"))
            .await
            .unwrap();
        let expired = ledger
            .expire(1, 200, &Reference::new(ReferenceType::Expiry, "1-2026"))
            .await
            .unwrap();
        assert_eq!(expired.balance_after, 500);

        let account = ledger.account(1).await.unwrap();
        assert_eq!(
            (account.total_earned, account.total_used, account.total_expired),
            (1_000, 300, 200)
        );
        let err = ledger
            .expire(1, 501, &Reference::new(ReferenceType::Expiry, "1-2027"))
            .await
            .unwrap_err();
        assert!(matches!(err, MileageError::InsufficientBalance { available: 500, .. }));
    }
}
