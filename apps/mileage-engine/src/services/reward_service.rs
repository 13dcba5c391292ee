use mileage_db::MileageResult;
use mileage_db::models::transaction::ReferenceType;
use mileage_db::repositories::policy_repo::{self, PolicyRepository};
use mileage_db::repositories::{ledger_repo, referral_repo};
use mileage_shared::{
    Clock, ReferralTier, RewardContext, RewardDecision, RewardPolicy, RewardTrigger, TierSchedule,
    compute,
};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::debug;

/// A user's referral standing, recomputed from the referral count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierStatus {
    pub user_id: i64,
    pub total_referrals: u32,
    pub tier: ReferralTier,
    pub bonus_percent: u32,
    pub next_tier: Option<ReferralTier>,
    pub referrals_to_next: Option<u32>,
}

/// Fill the store-derived counters of `ctx` and decide, on the caller's
/// connection. Inside a write transaction the counts can't move until
/// commit.
pub(crate) async fn evaluate_in_tx(
    conn: &mut SqliteConnection,
    trigger: RewardTrigger,
    user_id: i64,
    ctx: &RewardContext,
    now: i64,
) -> MileageResult<(RewardDecision, Option<RewardPolicy>, RewardContext)> {
    let policy = policy_repo::active_in_tx(conn, trigger).await?;
    let mut ctx = ctx.clone();

    if let Some(policy) = &policy {
        if let Some((_, period)) = policy.max_rewards() {
            ctx.reward_count = ledger_repo::count_rewards_since(
                conn,
                user_id,
                ReferenceType::from(trigger),
                period.window_start(now),
            )
            .await?;
        }
        if trigger == RewardTrigger::ReferralRecommender {
            ctx.total_referrals = referral_count_at(conn, user_id, &ctx.context_id).await?;
        }
    }

    let decision = compute(trigger, policy.as_ref(), &ctx);
    debug!(
        "Reward decision for {} user {} ({}): eligible={} amount={}",
        trigger, user_id, ctx.context_id, decision.eligible, decision.amount
    );
    Ok((decision, policy, ctx))
}

/// Referral count the recommender reward is computed with: the position of
/// the rewarded referral when the context names one of the user's
/// referrals, so each referral sees its own count however triggers
/// interleave. Otherwise the current total.
async fn referral_count_at(
    conn: &mut SqliteConnection,
    referrer_id: i64,
    context_id: &str,
) -> MileageResult<u32> {
    if let Ok(referral_id) = context_id.trim().parse::<i64>() {
        if let Some(position) = referral_repo::position_in_tx(conn, referrer_id, referral_id).await? {
            return Ok(position);
        }
    }
    referral_repo::count_in_tx(conn, referrer_id).await
}

/// Read side of the calculator: previews and tier lookups. Crediting goes
/// through the redemption service.
#[derive(Debug, Clone)]
pub struct RewardService {
    pool: SqlitePool,
    policies: PolicyRepository,
    clock: Arc<dyn Clock>,
}

impl RewardService {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            policies: PolicyRepository::new(pool.clone()),
            pool,
            clock,
        }
    }

    /// The calculator against the active policy and the context exactly as
    /// given.
    pub async fn compute(
        &self,
        trigger: RewardTrigger,
        ctx: &RewardContext,
    ) -> MileageResult<RewardDecision> {
        let policy = self.policies.active(trigger).await?;
        Ok(compute(trigger, policy.as_ref(), ctx))
    }

    /// What `trigger` would pay `user_id` right now, with counters read
    /// from the store. Nothing is written.
    pub async fn preview(
        &self,
        trigger: RewardTrigger,
        user_id: i64,
        ctx: &RewardContext,
    ) -> MileageResult<RewardDecision> {
        let mut conn = self.pool.acquire().await?;
        let (decision, _, _) =
            evaluate_in_tx(&mut conn, trigger, user_id, ctx, self.clock.now_millis()).await?;
        Ok(decision)
    }

    /// Tier schedule in force: the active recommender policy's, or the
    /// default one.
    pub async fn tier_schedule(&self) -> MileageResult<TierSchedule> {
        Ok(self
            .policies
            .active(RewardTrigger::ReferralRecommender)
            .await?
            .map(|p| p.tier_schedule())
            .unwrap_or_default())
    }

    pub async fn tier_for_user(&self, user_id: i64) -> MileageResult<TierStatus> {
        let schedule = self.tier_schedule().await?;
        let mut conn = self.pool.acquire().await?;
        let total_referrals = referral_repo::count_in_tx(&mut conn, user_id).await?;
        Ok(tier_status(&schedule, user_id, total_referrals))
    }
}

fn tier_status(schedule: &TierSchedule, user_id: i64, total_referrals: u32) -> TierStatus {
    let current = schedule.level_for_count(total_referrals);
    let tier = current.map(|l| l.tier).unwrap_or(ReferralTier::Bronze);
    let next = schedule
        .levels
        .iter()
        .filter(|l| l.tier > tier && l.min_referrals > total_referrals)
        .min_by_key(|l| l.min_referrals);

    TierStatus {
        user_id,
        total_referrals,
        tier,
        bonus_percent: current.map(|l| l.bonus_percent).unwrap_or(0),
        next_tier: next.map(|l| l.tier),
        referrals_to_next: next.map(|l| l.min_referrals - total_referrals),
    }
}
