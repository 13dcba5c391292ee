use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Cached projection of an account's transaction log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: i64,
    pub balance: i64,
    pub total_earned: i64,
    pub total_used: i64,
    pub total_expired: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Account {
    pub fn is_consistent(&self) -> bool {
        self.balance >= 0 && self.balance == self.total_earned - self.total_used - self.total_expired
    }
}
