//! Redemption orchestrator.
//!
//! Every public operation here is one store transaction: the code is
//! consumed, the ledger moves, coupons are bound and payment intents are
//! recorded together or not at all. Notifications go out only after the
//! commit.

use mileage_db::models::coupon::UserCoupon;
use mileage_db::models::payment::PaymentIntent;
use mileage_db::models::redemption_code::{CodePayload, RedemptionCode, normalize_code};
use mileage_db::models::referral::Referral;
use mileage_db::models::transaction::{Reference, ReferenceType, Transaction, TransactionType};
use mileage_db::repositories::referral_repo::{self, ReferralRepository};
use mileage_db::repositories::{code_repo, coupon_repo, ledger_repo, payment_repo};
use mileage_db::{MileageError, MileageResult};
use mileage_shared::{
    Clock, Ineligible, RewardContext, RewardDecision, RewardPolicy, RewardTrigger, TierLevel,
};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::ledger_service::LedgerService;
use super::notification_service::{Notification, NotificationService};
use super::reward_service::evaluate_in_tx;
use super::with_conflict_retry;

/// What the caller gets back from a committed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub user_id: i64,
    /// The user's balance after the operation.
    pub balance: i64,
    pub transactions: Vec<Transaction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<RedemptionCode>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub coupons: Vec<UserCoupon>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentIntent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<RewardDecision>,
}

impl Receipt {
    fn new(user_id: i64, balance: i64) -> Self {
        Self {
            user_id,
            balance,
            transactions: Vec::new(),
            code: None,
            coupons: Vec::new(),
            payment: None,
            decision: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Ineligible(Ineligible),
    /// The trigger was already rewarded; nothing changed.
    Duplicate(Reference),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RewardOutcome {
    Credited(Receipt),
    Skipped { reason: SkipReason },
}

impl RewardOutcome {
    pub fn receipt(&self) -> Option<&Receipt> {
        match self {
            RewardOutcome::Credited(receipt) => Some(receipt),
            RewardOutcome::Skipped { .. } => None,
        }
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match self {
            RewardOutcome::Credited(_) => None,
            RewardOutcome::Skipped { reason } => Some(reason),
        }
    }

    fn skipped(reason: SkipReason) -> Self {
        RewardOutcome::Skipped { reason }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferralOutcome {
    pub referral: Referral,
    pub recommender: RewardOutcome,
    pub referee: RewardOutcome,
}

#[derive(Clone)]
pub struct RedemptionService {
    pool: SqlitePool,
    ledger: LedgerService,
    referrals: ReferralRepository,
    notifier: NotificationService,
    clock: Arc<dyn Clock>,
    retries: u32,
}

impl RedemptionService {
    pub fn new(
        pool: SqlitePool,
        ledger: LedgerService,
        notifier: NotificationService,
        clock: Arc<dyn Clock>,
        retries: u32,
    ) -> Self {
        Self {
            referrals: ReferralRepository::new(pool.clone()),
            pool,
            ledger,
            notifier,
            clock,
            retries,
        }
    }

    /// A code was scanned by `consumer_id`. Consumes it and applies its
    /// payload in one unit; on any failure the code stays issued.
    pub async fn redeem(&self, code: &str, consumer_id: i64) -> MileageResult<Receipt> {
        let code = normalize_code(code);
        let code = code.as_str();
        let result = with_conflict_retry("code redeem", self.retries, move || {
            self.redeem_once(code, consumer_id)
        })
        .await;

        match result {
            Ok((receipt, notifications)) => {
                info!(
                    "User {} redeemed {}, balance {}",
                    consumer_id, code, receipt.balance
                );
                self.notifier.dispatch_all(notifications);
                Ok(receipt)
            }
            Err(e) => {
                info!(
                    "Redeem of {} by user {} refused: {} ({})",
                    code,
                    consumer_id,
                    e.user_message(),
                    e
                );
                Err(e)
            }
        }
    }

    async fn redeem_once(
        &self,
        code: &str,
        consumer_id: i64,
    ) -> MileageResult<(Receipt, Vec<Notification>)> {
        let now = self.clock.now_millis();
        let mut tx = self.pool.begin().await?;

        let consumed = code_repo::consume_in_tx(&mut tx, code, consumer_id, now).await?;
        let mut notifications = Vec::new();

        let mut receipt = match &consumed.payload {
            CodePayload::Mileage { amount, funded_by } => {
                let mut transactions = Vec::with_capacity(2);
                if let Some(funder) = *funded_by {
                    if funder == consumer_id {
                        return Err(MileageError::InvalidRequest(
                            "cannot redeem a transfer you funded".to_string(),
                        ));
                    }
                    let debit = ledger_repo::apply_in_tx(
                        &mut tx,
                        funder,
                        TransactionType::Use,
                        *amount,
                        &Reference::new(ReferenceType::Transfer, code),
                        Some("mileage transfer sent"),
                        now,
                    )
                    .await?;
                    notifications.push(Notification::MileageSpent {
                        user_id: funder,
                        amount: *amount,
                        balance: debit.balance_after,
                    });
                    transactions.push(debit);
                }
                let credit = ledger_repo::apply_in_tx(
                    &mut tx,
                    consumer_id,
                    TransactionType::Earn,
                    *amount,
                    &Reference::new(ReferenceType::Qr, code),
                    Some("mileage code redeemed"),
                    now,
                )
                .await?;
                let mut receipt = Receipt::new(consumer_id, credit.balance_after);
                transactions.push(credit);
                receipt.transactions = transactions;
                receipt
            }
            CodePayload::Coupon { definition_id } => {
                let coupon =
                    coupon_repo::issue_in_tx(&mut tx, *definition_id, consumer_id, Some(code), now)
                        .await?;
                let balance = ledger_repo::balance_in_tx(&mut tx, consumer_id, now).await?;
                let mut receipt = Receipt::new(consumer_id, balance);
                receipt.coupons.push(coupon);
                receipt
            }
            CodePayload::Payment {
                amount,
                business_id,
            } => {
                let intent = payment_repo::insert_in_tx(
                    &mut tx,
                    code,
                    consumer_id,
                    *business_id,
                    *amount,
                    now,
                )
                .await?;
                let balance = ledger_repo::balance_in_tx(&mut tx, consumer_id, now).await?;
                let mut receipt = Receipt::new(consumer_id, balance);
                receipt.payment = Some(intent);
                receipt
            }
        };

        tx.commit().await?;

        notifications.push(Notification::CodeRedeemed {
            user_id: consumer_id,
            code: consumed.code.clone(),
            kind: consumed.kind,
            balance: receipt.balance,
        });
        receipt.code = Some(consumed);
        Ok((receipt, notifications))
    }

    /// A rewardable action happened. Evaluates the active policy and credits
    /// the user in one unit keyed by `(trigger, ctx.context_id)`, so a
    /// re-delivered event is skipped as a duplicate.
    pub async fn trigger_reward(
        &self,
        trigger: RewardTrigger,
        user_id: i64,
        ctx: &RewardContext,
    ) -> MileageResult<RewardOutcome> {
        if ctx.context_id.trim().is_empty() {
            return Err(MileageError::InvalidRequest(
                "context_id is required".to_string(),
            ));
        }
        let (outcome, notifications) =
            with_conflict_retry("reward trigger", self.retries, move || {
                self.trigger_once(trigger, user_id, ctx)
            })
            .await?;

        match &outcome {
            RewardOutcome::Credited(receipt) => info!(
                "Rewarded user {} for {} {}: +{}, balance {}",
                user_id,
                trigger,
                ctx.context_id,
                receipt.transactions.first().map(|t| t.amount).unwrap_or(0),
                receipt.balance
            ),
            RewardOutcome::Skipped { reason } => debug!(
                "No {} reward for user {} ({}): {:?}",
                trigger, user_id, ctx.context_id, reason
            ),
        }
        self.notifier.dispatch_all(notifications);
        Ok(outcome)
    }

    async fn trigger_once(
        &self,
        trigger: RewardTrigger,
        user_id: i64,
        ctx: &RewardContext,
    ) -> MileageResult<(RewardOutcome, Vec<Notification>)> {
        let now = self.clock.now_millis();
        let reference = Reference::new(ReferenceType::from(trigger), ctx.context_id.trim());
        let mut tx = self.pool.begin().await?;

        // Write first: holds the store's write lock for the rest of the unit.
        ledger_repo::ensure_account(&mut tx, user_id, now).await?;
        if ledger_repo::reference_applied(&mut tx, &reference).await? {
            return Ok((RewardOutcome::skipped(SkipReason::Duplicate(reference)), Vec::new()));
        }

        let (decision, policy, ctx) = evaluate_in_tx(&mut tx, trigger, user_id, ctx, now).await?;
        if !decision.eligible {
            let why = decision
                .ineligible
                .clone()
                .unwrap_or(Ineligible::NoActivePolicy);
            return Ok((RewardOutcome::skipped(SkipReason::Ineligible(why)), Vec::new()));
        }

        let description = format!(
            "{} reward (policy v{})",
            trigger,
            decision.policy_version.unwrap_or_default()
        );
        let entry = match ledger_repo::apply_in_tx(
            &mut tx,
            user_id,
            TransactionType::Earn,
            decision.amount,
            &reference,
            Some(&description),
            now,
        )
        .await
        {
            Ok(entry) => entry,
            Err(e) if e.is_benign() => {
                return Ok((RewardOutcome::skipped(SkipReason::Duplicate(reference)), Vec::new()));
            }
            Err(e) => return Err(e),
        };

        let mut notifications = vec![Notification::RewardCredited {
            user_id,
            trigger,
            amount: entry.amount,
            balance: entry.balance_after,
            tier: decision.tier,
        }];

        let mut coupons = Vec::new();
        if let Some(level) = promotion(trigger, policy.as_ref(), ctx.total_referrals) {
            coupons = allot_tier_coupons(&mut tx, &level, user_id, now).await?;
            info!(
                "User {} reached {} at {} referrals ({} coupons)",
                user_id,
                level.tier,
                ctx.total_referrals,
                coupons.len()
            );
            notifications.push(Notification::TierReached {
                user_id,
                tier: level.tier,
                coupons_issued: coupons.len(),
            });
        }

        tx.commit().await?;

        let mut receipt = Receipt::new(user_id, entry.balance_after);
        receipt.transactions.push(entry);
        receipt.coupons = coupons;
        receipt.decision = Some(decision);
        Ok((RewardOutcome::Credited(receipt), notifications))
    }

    /// `referee_id` signed up through `referrer_id`. Stores the referral and
    /// fires both referral triggers, keyed by the referral id. Calling it
    /// again for the same pair only re-fires the (idempotent) triggers.
    pub async fn record_referral(
        &self,
        referrer_id: i64,
        referee_id: i64,
    ) -> MileageResult<ReferralOutcome> {
        let referral = with_conflict_retry("referral record", self.retries, move || {
            self.record_once(referrer_id, referee_id)
        })
        .await?;

        let ctx = RewardContext::new(referral.id.to_string());
        let recommender = self
            .trigger_reward(RewardTrigger::ReferralRecommender, referrer_id, &ctx)
            .await?;
        let referee = self
            .trigger_reward(RewardTrigger::ReferralReferee, referee_id, &ctx)
            .await?;

        Ok(ReferralOutcome {
            referral,
            recommender,
            referee,
        })
    }

    async fn record_once(&self, referrer_id: i64, referee_id: i64) -> MileageResult<Referral> {
        let now = self.clock.now_millis();
        let mut tx = self.pool.begin().await?;
        match referral_repo::insert_in_tx(&mut tx, referrer_id, referee_id, now).await {
            Ok(referral) => {
                tx.commit().await?;
                info!("Recorded referral {} -> {}", referrer_id, referee_id);
                Ok(referral)
            }
            Err(e) if e.is_benign() => {
                drop(tx);
                match self.referrals.find_by_referee(referee_id).await? {
                    Some(existing) if existing.referrer_id == referrer_id => Ok(existing),
                    _ => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Pay with mileage at purchase.
    pub async fn spend(
        &self,
        user_id: i64,
        amount: i64,
        reference_id: &str,
    ) -> MileageResult<Receipt> {
        let reference = Reference::new(ReferenceType::Purchase, reference_id);
        let entry = self.ledger.spend(user_id, amount, &reference).await?;

        self.notifier.dispatch(Notification::MileageSpent {
            user_id,
            amount,
            balance: entry.balance_after,
        });
        let mut receipt = Receipt::new(user_id, entry.balance_after);
        receipt.transactions.push(entry);
        Ok(receipt)
    }
}

/// The tier level a recommender reward just promoted the user into, if it
/// carries a coupon allotment.
fn promotion(
    trigger: RewardTrigger,
    policy: Option<&RewardPolicy>,
    total_referrals: u32,
) -> Option<TierLevel> {
    if trigger != RewardTrigger::ReferralRecommender {
        return None;
    }
    let schedule = policy?.tier_schedule();
    schedule
        .promoted_at(total_referrals)
        .filter(|level| level.coupon_allotment > 0 && level.coupon_definition_id.is_some())
        .cloned()
}

/// Best effort: a closed or exhausted definition cuts the allotment short
/// without failing the reward itself.
async fn allot_tier_coupons(
    conn: &mut SqliteConnection,
    level: &TierLevel,
    user_id: i64,
    now: i64,
) -> MileageResult<Vec<UserCoupon>> {
    let Some(definition_id) = level.coupon_definition_id else {
        return Ok(Vec::new());
    };
    let mut coupons = Vec::new();
    for _ in 0..level.coupon_allotment {
        match coupon_repo::issue_in_tx(conn, definition_id, user_id, None, now).await {
            Ok(coupon) => coupons.push(coupon),
            Err(
                e @ (MileageError::QuantityExhausted(_)
                | MileageError::CouponUnavailable(_)
                | MileageError::CouponNotFound(_)),
            ) => {
                warn!(
                    "Tier coupon allotment for user {} stopped at {}/{}: {}",
                    user_id,
                    coupons.len(),
                    level.coupon_allotment,
                    e
                );
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(coupons)
}
