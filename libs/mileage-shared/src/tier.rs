use serde::{Deserialize, Serialize};
use std::fmt;

use crate::policy::PolicyError;

/// Referral tier, derived from a referral count. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralTier {
    Bronze,
    Silver,
    Gold,
    Platinum,
}

impl ReferralTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferralTier::Bronze => "bronze",
            ReferralTier::Silver => "silver",
            ReferralTier::Gold => "gold",
            ReferralTier::Platinum => "platinum",
        }
    }
}

impl fmt::Display for ReferralTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a tier schedule and the benefits attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLevel {
    pub tier: ReferralTier,
    pub min_referrals: u32,
    #[serde(default)]
    pub bonus_percent: u32,
    #[serde(default)]
    pub coupon_allotment: u32,
    #[serde(default)]
    pub coupon_definition_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSchedule {
    pub levels: Vec<TierLevel>,
}

impl Default for TierSchedule {
    fn default() -> Self {
        // No coupon allotment by default: it needs a coupon definition.
        let level = |tier, min_referrals, bonus_percent| TierLevel {
            tier,
            min_referrals,
            bonus_percent,
            coupon_allotment: 0,
            coupon_definition_id: None,
        };
        Self {
            levels: vec![
                level(ReferralTier::Bronze, 0, 0),
                level(ReferralTier::Silver, 10, 10),
                level(ReferralTier::Gold, 25, 20),
                level(ReferralTier::Platinum, 50, 30),
            ],
        }
    }
}

impl TierSchedule {
    pub fn validate(&self) -> Result<(), PolicyError> {
        let Some(first) = self.levels.first() else {
            return Err(PolicyError::InvalidTiers("schedule has no levels".to_string()));
        };
        if first.min_referrals != 0 {
            return Err(PolicyError::InvalidTiers(format!(
                "first level must start at 0 referrals, starts at {}",
                first.min_referrals
            )));
        }
        for pair in self.levels.windows(2) {
            let (lower, upper) = (&pair[0], &pair[1]);
            if upper.min_referrals <= lower.min_referrals || upper.tier <= lower.tier {
                return Err(PolicyError::InvalidTiers(format!(
                    "{} must come after {} with a higher threshold",
                    upper.tier, lower.tier
                )));
            }
        }
        if let Some(level) = self
            .levels
            .iter()
            .find(|l| l.coupon_allotment > 0 && l.coupon_definition_id.is_none())
        {
            return Err(PolicyError::InvalidTiers(format!(
                "{} grants coupons but names no coupon definition",
                level.tier
            )));
        }
        Ok(())
    }

    /// Highest level whose threshold `total_referrals` has reached.
    ///
    /// Taking the maximum tier rather than the last matching row keeps the
    /// result non-decreasing in `total_referrals` even for a schedule that
    /// never went through `validate`.
    pub fn level_for_count(&self, total_referrals: u32) -> Option<&TierLevel> {
        self.levels
            .iter()
            .filter(|l| l.min_referrals <= total_referrals)
            .max_by_key(|l| (l.tier, l.min_referrals))
    }

    pub fn tier_for_count(&self, total_referrals: u32) -> ReferralTier {
        self.level_for_count(total_referrals)
            .map(|l| l.tier)
            .unwrap_or(ReferralTier::Bronze)
    }

    /// The level newly reached at exactly `total_referrals`, if the count
    /// crossed a threshold on this referral.
    pub fn promoted_at(&self, total_referrals: u32) -> Option<&TierLevel> {
        if total_referrals == 0 {
            return None;
        }
        let current = self.level_for_count(total_referrals)?;
        let previous = self.tier_for_count(total_referrals - 1);
        (current.tier > previous).then_some(current)
    }
}

/// Tier under the default schedule (<10 bronze, 10-24 silver, 25-49 gold,
/// 50+ platinum).
pub fn tier_for_count(total_referrals: u32) -> ReferralTier {
    TierSchedule::default().tier_for_count(total_referrals)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_thresholds() {
        assert_eq!(tier_for_count(0), ReferralTier::Bronze);
        assert_eq!(tier_for_count(9), ReferralTier::Bronze);
        assert_eq!(tier_for_count(10), ReferralTier::Silver);
        assert_eq!(tier_for_count(24), ReferralTier::Silver);
        assert_eq!(tier_for_count(25), ReferralTier::Gold);
        assert_eq!(tier_for_count(49), ReferralTier::Gold);
        assert_eq!(tier_for_count(50), ReferralTier::Platinum);
        assert_eq!(tier_for_count(u32::MAX), ReferralTier::Platinum);
    }

    #[test]
    fn tier_never_regresses_as_count_grows() {
        let schedule = TierSchedule::default();
        let mut previous = schedule.tier_for_count(0);
        for n in 1..=200 {
            let tier = schedule.tier_for_count(n);
            assert!(tier >= previous, "tier dropped at {}", n);
            previous = tier;
        }
    }

    #[test]
    fn unordered_schedule_is_still_monotone() {
        let schedule = TierSchedule {
            levels: vec![
                TierLevel {
                    tier: ReferralTier::Gold,
                    min_referrals: 5,
                    bonus_percent: 0,
                    coupon_allotment: 0,
                    coupon_definition_id: None,
                },
                TierLevel {
                    tier: ReferralTier::Silver,
                    min_referrals: 8,
                    bonus_percent: 0,
                    coupon_allotment: 0,
                    coupon_definition_id: None,
                },
            ],
        };
        assert!(schedule.validate().is_err());
        assert_eq!(schedule.tier_for_count(4), ReferralTier::Bronze);
        assert_eq!(schedule.tier_for_count(5), ReferralTier::Gold);
        assert_eq!(schedule.tier_for_count(8), ReferralTier::Gold);
    }

    #[test]
    fn promotion_is_reported_once_per_threshold() {
        let schedule = TierSchedule::default();
        assert!(schedule.promoted_at(9).is_none());
        assert_eq!(
            schedule.promoted_at(10).map(|l| l.tier),
            Some(ReferralTier::Silver)
        );
        assert!(schedule.promoted_at(11).is_none());
        assert_eq!(
            schedule.promoted_at(50).map(|l| l.tier),
            Some(ReferralTier::Platinum)
        );
    }

    #[test]
    fn validation() {
        assert!(TierSchedule { levels: vec![] }.validate().is_err());

        let mut schedule = TierSchedule::default();
        schedule.levels[0].min_referrals = 1;
        assert!(schedule.validate().is_err());

        let mut with_coupons = TierSchedule::default();
        assert!(with_coupons.validate().is_ok());
        with_coupons.levels[1].coupon_allotment = 1;
        assert!(with_coupons.validate().is_err());
        with_coupons.levels[1].coupon_definition_id = Some(7);
        assert!(with_coupons.validate().is_ok());
    }
}
