//! Reward calculator.
//!
//! `compute` is a pure function of the trigger, the currently active policy
//! for that trigger and a context snapshot. Callers that need the result to
//! be consistent with the ledger build the context and apply the decision
//! inside the same store transaction.

use serde::{Deserialize, Serialize};

use crate::policy::{Condition, RewardPolicy, RewardTrigger};
use crate::tier::ReferralTier;

/// Facts about the triggering event plus the counters the policy needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardContext {
    /// Identifies the triggering event (review id, referral id, order id).
    pub context_id: String,
    #[serde(default)]
    pub order_amount: Option<i64>,
    #[serde(default)]
    pub photo_attached: bool,
    #[serde(default)]
    pub content_length: Option<u32>,
    /// Rewards already paid to this user under this trigger in the
    /// policy's `max_rewards` window.
    #[serde(default)]
    pub reward_count: u32,
    /// Referrals made by this user, including the one being rewarded.
    #[serde(default)]
    pub total_referrals: u32,
}

impl RewardContext {
    pub fn new(context_id: impl Into<String>) -> Self {
        Self {
            context_id: context_id.into(),
            ..Self::default()
        }
    }

    pub fn with_order_amount(mut self, amount: i64) -> Self {
        self.order_amount = Some(amount);
        self
    }

    pub fn with_photo(mut self) -> Self {
        self.photo_attached = true;
        self
    }

    pub fn with_content_length(mut self, chars: u32) -> Self {
        self.content_length = Some(chars);
        self
    }

    pub fn with_reward_count(mut self, count: u32) -> Self {
        self.reward_count = count;
        self
    }

    pub fn with_total_referrals(mut self, count: u32) -> Self {
        self.total_referrals = count;
        self
    }
}

/// First failed rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Ineligible {
    NoActivePolicy,
    BelowMinOrder { required: i64, actual: i64 },
    MaxRewardsReached { limit: u32 },
    PhotoMissing,
    ContentTooShort { required: u32, actual: u32 },
    ZeroAmount,
    /// The payout doesn't fit a ledger amount.
    AmountOverflow,
}

impl Ineligible {
    pub fn code(&self) -> &'static str {
        match self {
            Ineligible::NoActivePolicy => "no_active_policy",
            Ineligible::BelowMinOrder { .. } => "below_min_order",
            Ineligible::MaxRewardsReached { .. } => "max_rewards_reached",
            Ineligible::PhotoMissing => "photo_missing",
            Ineligible::ContentTooShort { .. } => "content_too_short",
            Ineligible::ZeroAmount => "zero_amount",
            Ineligible::AmountOverflow => "amount_overflow",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardDecision {
    pub trigger: RewardTrigger,
    pub eligible: bool,
    pub amount: i64,
    pub policy_id: Option<i64>,
    pub policy_version: Option<i64>,
    pub tier: Option<ReferralTier>,
    pub bonus_percent: u32,
    pub ineligible: Option<Ineligible>,
}

impl RewardDecision {
    fn rejected(trigger: RewardTrigger, policy: Option<&RewardPolicy>, why: Ineligible) -> Self {
        Self {
            trigger,
            eligible: false,
            amount: 0,
            policy_id: policy.map(|p| p.id),
            policy_version: policy.map(|p| p.version),
            tier: None,
            bonus_percent: 0,
            ineligible: Some(why),
        }
    }
}

fn check(condition: &Condition, ctx: &RewardContext) -> Result<(), Ineligible> {
    match condition {
        Condition::MinOrderAmount { amount } => {
            let actual = ctx.order_amount.unwrap_or(0);
            if actual < *amount {
                return Err(Ineligible::BelowMinOrder {
                    required: *amount,
                    actual,
                });
            }
        }
        Condition::MaxRewards { limit, .. } => {
            if ctx.reward_count >= *limit {
                return Err(Ineligible::MaxRewardsReached { limit: *limit });
            }
        }
        Condition::PhotoRequired => {
            if !ctx.photo_attached {
                return Err(Ineligible::PhotoMissing);
            }
        }
        Condition::MinContentLength { chars } => {
            let actual = ctx.content_length.unwrap_or(0);
            if actual < *chars {
                return Err(Ineligible::ContentTooShort {
                    required: *chars,
                    actual,
                });
            }
        }
    }
    Ok(())
}

/// Decide whether `trigger` pays out and how much.
///
/// Rules short-circuit in order: an active policy for the trigger must exist,
/// then min order amount, max rewards, photo, content length. Referral
/// recommender rewards add the tier bonus for the referrer's current count.
pub fn compute(
    trigger: RewardTrigger,
    policy: Option<&RewardPolicy>,
    ctx: &RewardContext,
) -> RewardDecision {
    let Some(policy) = policy.filter(|p| p.is_active() && p.trigger == trigger) else {
        return RewardDecision::rejected(trigger, None, Ineligible::NoActivePolicy);
    };

    for condition in policy.ordered_conditions() {
        if let Err(why) = check(condition, ctx) {
            return RewardDecision::rejected(trigger, Some(policy), why);
        }
    }

    let base = policy.reward.base_amount(ctx.order_amount);
    let (tier, bonus_percent) = if trigger == RewardTrigger::ReferralRecommender {
        let schedule = policy.tier_schedule();
        let level = schedule.level_for_count(ctx.total_referrals);
        (
            Some(schedule.tier_for_count(ctx.total_referrals)),
            level.map(|l| l.bonus_percent).unwrap_or(0),
        )
    } else {
        (None, 0)
    };
    let bonus = i128::from(base) * i128::from(bonus_percent) / 100;
    let Ok(amount) = i64::try_from(i128::from(base) + bonus) else {
        return RewardDecision::rejected(trigger, Some(policy), Ineligible::AmountOverflow);
    };

    if amount <= 0 {
        return RewardDecision::rejected(trigger, Some(policy), Ineligible::ZeroAmount);
    }

    RewardDecision {
        trigger,
        eligible: true,
        amount,
        policy_id: Some(policy.id),
        policy_version: Some(policy.version),
        tier,
        bonus_percent,
        ineligible: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyStatus, Reward, RewardPeriod};
    use crate::tier::TierSchedule;

    fn policy(trigger: RewardTrigger, reward: Reward, conditions: Vec<Condition>) -> RewardPolicy {
        RewardPolicy {
            id: 11,
            trigger,
            version: 3,
            status: PolicyStatus::Active,
            reward,
            conditions,
            tiers: None,
            priority: 0,
            created_by: None,
            created_at: 0,
        }
    }

    #[test]
    fn no_policy_means_not_eligible() {
        let d = compute(RewardTrigger::Signup, None, &RewardContext::new("u1"));
        assert!(!d.eligible);
        assert_eq!(d.amount, 0);
        assert_eq!(d.ineligible, Some(Ineligible::NoActivePolicy));
    }

    #[test]
    fn inactive_or_mismatched_policy_is_ignored() {
        let mut p = policy(RewardTrigger::Review, Reward::Fixed { amount: 100 }, vec![]);
        p.status = PolicyStatus::Inactive;
        let d = compute(RewardTrigger::Review, Some(&p), &RewardContext::new("r1"));
        assert_eq!(d.ineligible, Some(Ineligible::NoActivePolicy));

        let p = policy(RewardTrigger::Signup, Reward::Fixed { amount: 100 }, vec![]);
        let d = compute(RewardTrigger::Review, Some(&p), &RewardContext::new("r1"));
        assert_eq!(d.ineligible, Some(Ineligible::NoActivePolicy));
    }

    #[test]
    fn twenty_first_referral_reward_is_refused() {
        let p = policy(
            RewardTrigger::ReferralRecommender,
            Reward::Fixed { amount: 500 },
            vec![Condition::MaxRewards {
                limit: 20,
                period: RewardPeriod::Lifetime,
            }],
        );
        let twentieth = RewardContext::new("ref-20").with_reward_count(19);
        let d = compute(RewardTrigger::ReferralRecommender, Some(&p), &twentieth);
        assert!(d.eligible);
        assert_eq!(d.amount, 500);

        let twenty_first = RewardContext::new("ref-21").with_reward_count(20);
        let d = compute(RewardTrigger::ReferralRecommender, Some(&p), &twenty_first);
        assert!(!d.eligible);
        assert_eq!(d.ineligible, Some(Ineligible::MaxRewardsReached { limit: 20 }));
    }

    #[test]
    fn first_failing_rule_wins() {
        let p = policy(
            RewardTrigger::Review,
            Reward::Fixed { amount: 300 },
            vec![
                Condition::PhotoRequired,
                Condition::MaxRewards {
                    limit: 1,
                    period: RewardPeriod::Day,
                },
                Condition::MinOrderAmount { amount: 10_000 },
            ],
        );
        // Fails everything; min order is checked first.
        let ctx = RewardContext::new("r1").with_reward_count(5);
        let d = compute(RewardTrigger::Review, Some(&p), &ctx);
        assert_eq!(
            d.ineligible,
            Some(Ineligible::BelowMinOrder {
                required: 10_000,
                actual: 0
            })
        );

        let ctx = ctx.with_order_amount(12_000);
        let d = compute(RewardTrigger::Review, Some(&p), &ctx);
        assert_eq!(d.ineligible, Some(Ineligible::MaxRewardsReached { limit: 1 }));

        let ctx = ctx.with_reward_count(0);
        let d = compute(RewardTrigger::Review, Some(&p), &ctx);
        assert_eq!(d.ineligible, Some(Ineligible::PhotoMissing));

        let d = compute(RewardTrigger::Review, Some(&p), &ctx.with_photo());
        assert!(d.eligible);
        assert_eq!(d.amount, 300);
        assert_eq!(d.policy_version, Some(3));
    }

    #[test]
    fn content_length_is_checked_last() {
        let p = policy(
            RewardTrigger::Review,
            Reward::Fixed { amount: 50 },
            vec![Condition::MinContentLength { chars: 20 }, Condition::PhotoRequired],
        );
        let d = compute(RewardTrigger::Review, Some(&p), &RewardContext::new("r"));
        assert_eq!(d.ineligible, Some(Ineligible::PhotoMissing));
        let ctx = RewardContext::new("r").with_photo().with_content_length(5);
        let d = compute(RewardTrigger::Review, Some(&p), &ctx);
        assert_eq!(
            d.ineligible,
            Some(Ineligible::ContentTooShort {
                required: 20,
                actual: 5
            })
        );
    }

    #[test]
    fn percentage_reward_without_order_is_zero_and_refused() {
        let p = policy(
            RewardTrigger::Purchase,
            Reward::Percentage {
                percent: 1,
                max_amount: None,
            },
            vec![],
        );
        let d = compute(RewardTrigger::Purchase, Some(&p), &RewardContext::new("o1"));
        assert_eq!(d.ineligible, Some(Ineligible::ZeroAmount));

        let ctx = RewardContext::new("o1").with_order_amount(45_000);
        let d = compute(RewardTrigger::Purchase, Some(&p), &ctx);
        assert!(d.eligible);
        assert_eq!(d.amount, 450);
    }

    #[test]
    fn recommender_reward_carries_tier_bonus() {
        let mut p = policy(
            RewardTrigger::ReferralRecommender,
            Reward::Fixed { amount: 500 },
            vec![],
        );
        p.tiers = Some(TierSchedule::default());

        let bronze = compute(
            RewardTrigger::ReferralRecommender,
            Some(&p),
            &RewardContext::new("a").with_total_referrals(3),
        );
        assert_eq!(bronze.tier, Some(ReferralTier::Bronze));
        assert_eq!(bronze.amount, 500);

        let gold = compute(
            RewardTrigger::ReferralRecommender,
            Some(&p),
            &RewardContext::new("b").with_total_referrals(30),
        );
        assert_eq!(gold.tier, Some(ReferralTier::Gold));
        assert_eq!(gold.bonus_percent, 20);
        assert_eq!(gold.amount, 600);
    }

    #[test]
    fn edited_tier_schedule_changes_the_bonus() {
        let mut p = policy(
            RewardTrigger::ReferralRecommender,
            Reward::Fixed { amount: 1_000 },
            vec![],
        );
        let mut schedule = TierSchedule::default();
        schedule.levels[1].bonus_percent = 50;
        p.tiers = Some(schedule);

        let d = compute(
            RewardTrigger::ReferralRecommender,
            Some(&p),
            &RewardContext::new("c").with_total_referrals(12),
        );
        assert_eq!(d.tier, Some(ReferralTier::Silver));
        assert_eq!(d.amount, 1_500);
    }

    #[test]
    fn referee_reward_has_no_tier() {
        let p = policy(
            RewardTrigger::ReferralReferee,
            Reward::Fixed { amount: 1_000 },
            vec![],
        );
        let d = compute(
            RewardTrigger::ReferralReferee,
            Some(&p),
            &RewardContext::new("c").with_total_referrals(70),
        );
        assert_eq!(d.tier, None);
        assert_eq!(d.amount, 1_000);
    }

    #[test]
    fn bonus_past_ledger_range_is_refused() {
        let mut p = policy(
            RewardTrigger::ReferralRecommender,
            Reward::Fixed {
                amount: i64::MAX / 2,
            },
            vec![],
        );
        let mut schedule = TierSchedule::default();
        schedule.levels[1].bonus_percent = 200;
        p.tiers = Some(schedule);

        let d = compute(
            RewardTrigger::ReferralRecommender,
            Some(&p),
            &RewardContext::new("c").with_total_referrals(12),
        );
        assert!(!d.eligible);
        assert_eq!(d.amount, 0);
        assert_eq!(d.ineligible, Some(Ineligible::AmountOverflow));
        assert_eq!(Ineligible::AmountOverflow.code(), "amount_overflow");
    }
}
