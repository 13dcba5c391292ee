use mileage_shared::RewardTrigger;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Earn,
    Use,
    Expire,
}

impl TransactionType {
    pub fn is_debit(&self) -> bool {
        !matches!(self, TransactionType::Earn)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Earn => "earn",
            TransactionType::Use => "use",
            TransactionType::Expire => "expire",
        }
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "earn" => Ok(TransactionType::Earn),
            "use" => Ok(TransactionType::Use),
            "expire" => Ok(TransactionType::Expire),
            other => Err(format!("unknown transaction type: {}", other)),
        }
    }
}

/// What caused a transaction. Together with the reference id it is unique
/// across the whole ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    Review,
    Signup,
    ReferralRecommender,
    ReferralReferee,
    /// Mileage paid at checkout.
    Purchase,
    /// Mileage earned on an order. Separate from `Purchase` so paying with
    /// mileage and earning on the same order both fit under the order id.
    PurchaseReward,
    Qr,
    Transfer,
    Expiry,
    Adjustment,
}

impl ReferenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceType::Review => "review",
            ReferenceType::Signup => "signup",
            ReferenceType::ReferralRecommender => "referral_recommender",
            ReferenceType::ReferralReferee => "referral_referee",
            ReferenceType::Purchase => "purchase",
            ReferenceType::PurchaseReward => "purchase_reward",
            ReferenceType::Qr => "qr",
            ReferenceType::Transfer => "transfer",
            ReferenceType::Expiry => "expiry",
            ReferenceType::Adjustment => "adjustment",
        }
    }
}

impl fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReferenceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let all = [
            ReferenceType::Review,
            ReferenceType::Signup,
            ReferenceType::ReferralRecommender,
            ReferenceType::ReferralReferee,
            ReferenceType::Purchase,
            ReferenceType::PurchaseReward,
            ReferenceType::Qr,
            ReferenceType::Transfer,
            ReferenceType::Expiry,
            ReferenceType::Adjustment,
        ];
        all.into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown reference type: {}", s))
    }
}

impl From<RewardTrigger> for ReferenceType {
    fn from(trigger: RewardTrigger) -> Self {
        match trigger {
            RewardTrigger::ReferralRecommender => ReferenceType::ReferralRecommender,
            RewardTrigger::ReferralReferee => ReferenceType::ReferralReferee,
            RewardTrigger::Review => ReferenceType::Review,
            RewardTrigger::Signup => ReferenceType::Signup,
            RewardTrigger::Purchase => ReferenceType::PurchaseReward,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub reference_type: ReferenceType,
    pub reference_id: String,
}

impl Reference {
    pub fn new(reference_type: ReferenceType, reference_id: impl Into<String>) -> Self {
        Self {
            reference_type,
            reference_id: reference_id.into(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.reference_type, self.reference_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Transaction {
    pub id: i64,
    pub account_id: i64,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub tx_type: TransactionType,
    pub amount: i64,
    pub balance_after: i64,
    pub reference_type: ReferenceType,
    pub reference_id: String,
    pub description: Option<String>,
    pub created_at: i64,
}

impl Transaction {
    /// Signed effect on the balance.
    pub fn delta(&self) -> i64 {
        if self.tx_type.is_debit() {
            -self.amount
        } else {
            self.amount
        }
    }
}
