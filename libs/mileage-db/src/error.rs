use mileage_shared::{PolicyError, RewardTrigger};
use thiserror::Error;

/// Everything the ledger/redemption core can refuse or fail with.
#[derive(Debug, Error)]
pub enum MileageError {
    #[error("amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: i64, available: i64 },

    #[error("reference {reference_type}:{reference_id} was already applied")]
    DuplicateReference {
        reference_type: String,
        reference_id: String,
    },

    #[error("code not found: {0}")]
    CodeNotFound(String),

    #[error("code already consumed: {0}")]
    AlreadyConsumed(String),

    #[error("code expired: {0}")]
    Expired(String),

    #[error("coupon definition {0} has no remaining quantity")]
    QuantityExhausted(i64),

    #[error("coupon not found: {0}")]
    CouponNotFound(i64),

    #[error("coupon {0} is not available for issuance")]
    CouponUnavailable(i64),

    #[error("coupon {id} cannot be used: {reason}")]
    CouponNotUsable { id: i64, reason: String },

    #[error("no active policy for {0}")]
    NoActivePolicy(RewardTrigger),

    #[error("invalid policy: {0}")]
    InvalidPolicy(#[from] PolicyError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("write conflict, retry the operation: {0}")]
    PersistenceConflict(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type MileageResult<T> = Result<T, MileageError>;

impl MileageError {
    /// Only write conflicts are safe to retry as a whole unit.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MileageError::PersistenceConflict(_))
    }

    /// Idempotence rejections: the effect already happened.
    pub fn is_benign(&self) -> bool {
        matches!(self, MileageError::DuplicateReference { .. })
    }

    /// Short text for the person holding the phone.
    pub fn user_message(&self) -> &'static str {
        match self {
            MileageError::InvalidAmount(_) => "invalid amount",
            MileageError::InsufficientBalance { .. } => "not enough mileage",
            MileageError::DuplicateReference { .. } => "already rewarded",
            MileageError::CodeNotFound(_) => "code not recognised",
            MileageError::AlreadyConsumed(_) => "already used",
            MileageError::Expired(_) => "expired",
            MileageError::QuantityExhausted(_) | MileageError::CouponUnavailable(_) => {
                "no longer available"
            }
            MileageError::CouponNotFound(_) => "coupon not found",
            MileageError::CouponNotUsable { .. } => "coupon cannot be used",
            MileageError::NoActivePolicy(_) => "no reward for this action",
            MileageError::InvalidPolicy(_) | MileageError::InvalidRequest(_) => "invalid request",
            MileageError::PersistenceConflict(_) => "busy, please try again",
            MileageError::Database(_) | MileageError::Serialization(_) => "something went wrong",
        }
    }
}

fn sqlite_primary_code(err: &sqlx::Error) -> Option<i32> {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|c| c.parse::<i32>().ok())
            .map(|c| c & 0xff),
        _ => None,
    }
}

/// SQLITE_BUSY / SQLITE_LOCKED, including the extended codes.
pub fn is_lock_conflict(err: &sqlx::Error) -> bool {
    matches!(sqlite_primary_code(err), Some(5) | Some(6))
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

impl From<sqlx::Error> for MileageError {
    fn from(err: sqlx::Error) -> Self {
        if is_lock_conflict(&err) || matches!(err, sqlx::Error::PoolTimedOut) {
            MileageError::PersistenceConflict(err.to_string())
        } else {
            MileageError::Database(err)
        }
    }
}
