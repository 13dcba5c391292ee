//! Reward policy model.
//!
//! A policy is a closed, typed description of what a trigger pays out and
//! under which conditions. The store keeps the `reward` / `conditions` /
//! `tiers` parts as JSON columns; this module owns their shape.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::tier::TierSchedule;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("unknown reward trigger: {0}")]
    UnknownTrigger(String),

    #[error("unknown policy status: {0}")]
    UnknownStatus(String),

    #[error("invalid reward: {0}")]
    InvalidReward(String),

    #[error("condition listed more than once: {0}")]
    DuplicateCondition(&'static str),

    #[error("invalid condition: {0}")]
    InvalidCondition(String),

    #[error("invalid tier schedule: {0}")]
    InvalidTiers(String),

    #[error("tier schedules are only supported on referral_recommender, not {0}")]
    TiersNotSupported(RewardTrigger),
}

/// The rewardable action a policy is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardTrigger {
    ReferralRecommender,
    ReferralReferee,
    Review,
    Signup,
    Purchase,
}

impl RewardTrigger {
    pub const ALL: [RewardTrigger; 5] = [
        RewardTrigger::ReferralRecommender,
        RewardTrigger::ReferralReferee,
        RewardTrigger::Review,
        RewardTrigger::Signup,
        RewardTrigger::Purchase,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RewardTrigger::ReferralRecommender => "referral_recommender",
            RewardTrigger::ReferralReferee => "referral_referee",
            RewardTrigger::Review => "review",
            RewardTrigger::Signup => "signup",
            RewardTrigger::Purchase => "purchase",
        }
    }
}

impl fmt::Display for RewardTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RewardTrigger {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RewardTrigger::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| PolicyError::UnknownTrigger(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStatus {
    Active,
    Inactive,
}

impl PolicyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyStatus::Active => "active",
            PolicyStatus::Inactive => "inactive",
        }
    }
}

impl FromStr for PolicyStatus {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(PolicyStatus::Active),
            "inactive" => Ok(PolicyStatus::Inactive),
            other => Err(PolicyError::UnknownStatus(other.to_string())),
        }
    }
}

/// What an eligible trigger pays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reward {
    Fixed {
        amount: i64,
    },
    /// Share of the context's order amount, floored.
    Percentage {
        percent: u32,
        #[serde(default)]
        max_amount: Option<i64>,
    },
}

impl Reward {
    /// Amount before any tier bonus. Percentage rewards pay nothing without
    /// an order amount.
    pub fn base_amount(&self, order_amount: Option<i64>) -> i64 {
        match self {
            Reward::Fixed { amount } => *amount,
            Reward::Percentage {
                percent,
                max_amount,
            } => {
                // Widened so a large order can't overflow before the division.
                let raw = i128::from(order_amount.unwrap_or(0).max(0)) * i128::from(*percent) / 100;
                let raw = i64::try_from(raw).unwrap_or(i64::MAX);
                match max_amount {
                    Some(cap) => raw.min(*cap),
                    None => raw,
                }
            }
        }
    }

    fn validate(&self) -> Result<(), PolicyError> {
        match self {
            Reward::Fixed { amount } if *amount <= 0 => Err(PolicyError::InvalidReward(format!(
                "fixed amount must be positive, got {}",
                amount
            ))),
            Reward::Percentage { percent, .. } if *percent == 0 || *percent > 100 => {
                Err(PolicyError::InvalidReward(format!(
                    "percentage must be within 1..=100, got {}",
                    percent
                )))
            }
            Reward::Percentage {
                max_amount: Some(cap),
                ..
            } if *cap <= 0 => Err(PolicyError::InvalidReward(format!(
                "max_amount must be positive, got {}",
                cap
            ))),
            _ => Ok(()),
        }
    }
}

/// Window over which `max_rewards` counts previous payouts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardPeriod {
    #[default]
    Lifetime,
    Day,
    Month,
}

impl RewardPeriod {
    /// Start of the window containing `now_millis`, in UTC.
    pub fn window_start(&self, now_millis: i64) -> i64 {
        let Some(now) = DateTime::<Utc>::from_timestamp_millis(now_millis) else {
            return i64::MIN;
        };
        let start = match self {
            RewardPeriod::Lifetime => return i64::MIN,
            RewardPeriod::Day => now.date_naive().and_hms_opt(0, 0, 0),
            RewardPeriod::Month => now
                .date_naive()
                .with_day(1)
                .and_then(|d| d.and_hms_opt(0, 0, 0)),
        };
        start
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap_or(i64::MIN)
    }
}

/// Eligibility condition. The set is closed so evaluation is exhaustive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    MinOrderAmount {
        amount: i64,
    },
    MaxRewards {
        limit: u32,
        #[serde(default)]
        period: RewardPeriod,
    },
    PhotoRequired,
    MinContentLength {
        chars: u32,
    },
}

impl Condition {
    /// Evaluation order. Stored order is irrelevant.
    pub fn rank(&self) -> u8 {
        match self {
            Condition::MinOrderAmount { .. } => 0,
            Condition::MaxRewards { .. } => 1,
            Condition::PhotoRequired => 2,
            Condition::MinContentLength { .. } => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Condition::MinOrderAmount { .. } => "min_order_amount",
            Condition::MaxRewards { .. } => "max_rewards",
            Condition::PhotoRequired => "photo_required",
            Condition::MinContentLength { .. } => "min_content_length",
        }
    }

    fn validate(&self) -> Result<(), PolicyError> {
        match self {
            Condition::MinOrderAmount { amount } if *amount < 0 => Err(
                PolicyError::InvalidCondition(format!("min_order_amount is negative: {}", amount)),
            ),
            Condition::MaxRewards { limit: 0, .. } => Err(PolicyError::InvalidCondition(
                "max_rewards limit must be at least 1".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// A stored, versioned policy row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardPolicy {
    pub id: i64,
    pub trigger: RewardTrigger,
    pub version: i64,
    pub status: PolicyStatus,
    pub reward: Reward,
    pub conditions: Vec<Condition>,
    pub tiers: Option<TierSchedule>,
    pub priority: i32,
    pub created_by: Option<i64>,
    pub created_at: i64,
}

impl RewardPolicy {
    pub fn is_active(&self) -> bool {
        self.status == PolicyStatus::Active
    }

    pub fn ordered_conditions(&self) -> Vec<&Condition> {
        let mut conditions: Vec<&Condition> = self.conditions.iter().collect();
        conditions.sort_by_key(|c| c.rank());
        conditions
    }

    /// The `max_rewards` window, if the policy caps payouts.
    pub fn max_rewards(&self) -> Option<(u32, RewardPeriod)> {
        self.conditions.iter().find_map(|c| match c {
            Condition::MaxRewards { limit, period } => Some((*limit, *period)),
            _ => None,
        })
    }

    /// Tier schedule for referral rewards; the documented default when the
    /// policy doesn't carry one.
    pub fn tier_schedule(&self) -> TierSchedule {
        self.tiers.clone().unwrap_or_default()
    }
}

/// Input for publishing a new policy version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDraft {
    pub trigger: RewardTrigger,
    pub reward: Reward,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub tiers: Option<TierSchedule>,
    #[serde(default)]
    pub priority: i32,
}

impl PolicyDraft {
    pub fn new(trigger: RewardTrigger, reward: Reward) -> Self {
        Self {
            trigger,
            reward,
            conditions: Vec::new(),
            tiers: None,
            priority: 0,
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_tiers(mut self, tiers: TierSchedule) -> Self {
        self.tiers = Some(tiers);
        self
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        self.reward.validate()?;

        let mut seen = [false; 4];
        for condition in &self.conditions {
            condition.validate()?;
            let slot = &mut seen[usize::from(condition.rank())];
            if *slot {
                return Err(PolicyError::DuplicateCondition(condition.name()));
            }
            *slot = true;
        }

        if let Some(tiers) = &self.tiers {
            if self.trigger != RewardTrigger::ReferralRecommender {
                return Err(PolicyError::TiersNotSupported(self.trigger));
            }
            tiers.validate()?;
        }
        Ok(())
    }
}
