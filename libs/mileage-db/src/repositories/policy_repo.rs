use mileage_shared::{PolicyDraft, PolicyStatus, RewardPolicy, RewardTrigger};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

use crate::error::{MileageError, MileageResult, is_unique_violation};
use crate::models::policy::{PolicyAction, PolicyChange, policy_from_row};

const POLICY_COLUMNS: &str = "id, trigger_type, version, status, reward_json, conditions_json, tiers_json, priority, created_by, created_at";
const CHANGE_COLUMNS: &str =
    "id, policy_id, trigger_type, action, snapshot, changed_by, created_at";

/// The policy in force for `trigger`, read on the caller's connection so a
/// reward unit evaluates against the version it commits under.
pub async fn active_in_tx(
    conn: &mut SqliteConnection,
    trigger: RewardTrigger,
) -> MileageResult<Option<RewardPolicy>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM reward_policies WHERE trigger_type = $1 AND status = $2",
        POLICY_COLUMNS
    ))
    .bind(trigger.as_str())
    .bind(PolicyStatus::Active.as_str())
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(policy_from_row).transpose()
}

async fn log_change(
    conn: &mut SqliteConnection,
    policy: &RewardPolicy,
    action: PolicyAction,
    changed_by: Option<i64>,
    now: i64,
) -> MileageResult<()> {
    sqlx::query(
        "INSERT INTO policy_changes (policy_id, trigger_type, action, snapshot, changed_by, created_at) VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(policy.id)
    .bind(policy.trigger.as_str())
    .bind(action)
    .bind(serde_json::to_string(policy)?)
    .bind(changed_by)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PolicyRepository {
    pool: SqlitePool,
}

impl PolicyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn active(&self, trigger: RewardTrigger) -> MileageResult<Option<RewardPolicy>> {
        let mut conn = self.pool.acquire().await?;
        active_in_tx(&mut conn, trigger).await
    }

    pub async fn get(&self, id: i64) -> MileageResult<Option<RewardPolicy>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM reward_policies WHERE id = $1",
            POLICY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(policy_from_row).transpose()
    }

    /// Every version for a trigger, newest first.
    pub async fn versions(&self, trigger: RewardTrigger) -> MileageResult<Vec<RewardPolicy>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM reward_policies WHERE trigger_type = $1 ORDER BY version DESC",
            POLICY_COLUMNS
        ))
        .bind(trigger.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(policy_from_row).collect()
    }

    /// Publish a draft as the next version and make it the only active one.
    /// The previous active version is kept as inactive history.
    pub async fn publish(
        &self,
        draft: &PolicyDraft,
        changed_by: Option<i64>,
        now: i64,
    ) -> MileageResult<RewardPolicy> {
        draft.validate()?;
        let trigger = draft.trigger;

        let mut tx = self.pool.begin().await?;

        let superseded = sqlx::query(&format!(
            "UPDATE reward_policies SET status = $1 WHERE trigger_type = $2 AND status = $3 RETURNING {}",
            POLICY_COLUMNS
        ))
        .bind(PolicyStatus::Inactive.as_str())
        .bind(trigger.as_str())
        .bind(PolicyStatus::Active.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = superseded {
            let previous = policy_from_row(&row)?;
            log_change(&mut tx, &previous, PolicyAction::Superseded, changed_by, now).await?;
        }

        let version: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM reward_policies WHERE trigger_type = $1",
        )
        .bind(trigger.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let tiers_json = draft.tiers.as_ref().map(serde_json::to_string).transpose()?;
        let row = sqlx::query(&format!(
            "INSERT INTO reward_policies (trigger_type, version, status, reward_json, conditions_json, tiers_json, priority, created_by, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING {}",
            POLICY_COLUMNS
        ))
        .bind(trigger.as_str())
        .bind(version)
        .bind(PolicyStatus::Active.as_str())
        .bind(serde_json::to_string(&draft.reward)?)
        .bind(serde_json::to_string(&draft.conditions)?)
        .bind(tiers_json)
        .bind(draft.priority)
        .bind(changed_by)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                MileageError::PersistenceConflict(format!(
                    "concurrent publish for {}",
                    trigger
                ))
            } else {
                e.into()
            }
        })?;
        let published = policy_from_row(&row)?;
        log_change(&mut tx, &published, PolicyAction::Published, changed_by, now).await?;

        tx.commit().await?;
        info!(
            "Published {} policy v{} (id {})",
            trigger, published.version, published.id
        );
        Ok(published)
    }

    /// Turn a policy off. The trigger pays nothing until another version is
    /// published.
    pub async fn deactivate(
        &self,
        id: i64,
        changed_by: Option<i64>,
        now: i64,
    ) -> MileageResult<RewardPolicy> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "UPDATE reward_policies SET status = $1 WHERE id = $2 AND status = $3 RETURNING {}",
            POLICY_COLUMNS
        ))
        .bind(PolicyStatus::Inactive.as_str())
        .bind(id)
        .bind(PolicyStatus::Active.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(MileageError::InvalidRequest(format!(
                "policy {} is not active",
                id
            )));
        };
        let policy = policy_from_row(&row)?;
        log_change(&mut tx, &policy, PolicyAction::Deactivated, changed_by, now).await?;
        tx.commit().await?;
        info!("Deactivated {} policy v{}", policy.trigger, policy.version);
        Ok(policy)
    }

    /// Audit trail, oldest first. `None` lists every trigger.
    pub async fn change_log(
        &self,
        trigger: Option<RewardTrigger>,
    ) -> MileageResult<Vec<PolicyChange>> {
        let changes = match trigger {
            Some(trigger) => {
                sqlx::query_as::<_, PolicyChange>(&format!(
                    "SELECT {} FROM policy_changes WHERE trigger_type = $1 ORDER BY id",
                    CHANGE_COLUMNS
                ))
                .bind(trigger.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, PolicyChange>(&format!(
                    "SELECT {} FROM policy_changes ORDER BY id",
                    CHANGE_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{T0, test_pool};
    use mileage_shared::{Condition, PolicyError, Reward, RewardPeriod, TierSchedule};

    fn review_draft(amount: i64) -> PolicyDraft {
        PolicyDraft::new(RewardTrigger::Review, Reward::Fixed { amount })
            .with_condition(Condition::PhotoRequired)
            .with_condition(Condition::MaxRewards {
                limit: 3,
                period: RewardPeriod::Day,
            })
    }

    #[tokio::test]
    async fn publish_supersedes_previous_version() {
        let (pool, _dir) = test_pool().await;
        let repo = PolicyRepository::new(pool);

        let v1 = repo.publish(&review_draft(500), Some(1), T0).await.unwrap();
        let v2 = repo.publish(&review_draft(700), Some(1), T0 + 1).await.unwrap();
        assert_eq!((v1.version, v2.version), (1, 2));

        let active = repo.active(RewardTrigger::Review).await.unwrap().unwrap();
        assert_eq!(active.id, v2.id);
        assert_eq!(active.reward, Reward::Fixed { amount: 700 });
        assert_eq!(active.conditions.len(), 2);

        let versions = repo.versions(RewardTrigger::Review).await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[1].status, PolicyStatus::Inactive);

        let log = repo.change_log(Some(RewardTrigger::Review)).await.unwrap();
        let actions: Vec<_> = log.iter().map(|c| c.action).collect();
        assert_eq!(
            actions,
            [
                PolicyAction::Published,
                PolicyAction::Superseded,
                PolicyAction::Published
            ]
        );
        let snapshot: RewardPolicy = serde_json::from_str(&log[0].snapshot).unwrap();
        assert_eq!(snapshot.reward, Reward::Fixed { amount: 500 });
    }

    #[tokio::test]
    async fn triggers_version_independently() {
        let (pool, _dir) = test_pool().await;
        let repo = PolicyRepository::new(pool);
        repo.publish(&review_draft(500), None, T0).await.unwrap();
        let signup = repo
            .publish(
                &PolicyDraft::new(RewardTrigger::Signup, Reward::Fixed { amount: 5_000 }),
                None,
                T0,
            )
            .await
            .unwrap();
        assert_eq!(signup.version, 1);
        assert!(repo.active(RewardTrigger::Purchase).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deactivate_leaves_no_active_policy() {
        let (pool, _dir) = test_pool().await;
        let repo = PolicyRepository::new(pool);
        let v1 = repo.publish(&review_draft(500), None, T0).await.unwrap();
        repo.deactivate(v1.id, Some(2), T0 + 5).await.unwrap();
        assert!(repo.active(RewardTrigger::Review).await.unwrap().is_none());

        let err = repo.deactivate(v1.id, Some(2), T0 + 6).await.unwrap_err();
        assert!(matches!(err, MileageError::InvalidRequest(_)));
        assert_eq!(repo.change_log(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn invalid_draft_is_not_stored() {
        let (pool, _dir) = test_pool().await;
        let repo = PolicyRepository::new(pool);
        let draft = review_draft(500).with_tiers(TierSchedule::default());
        let err = repo.publish(&draft, None, T0).await.unwrap_err();
        assert!(matches!(
            err,
            MileageError::InvalidPolicy(PolicyError::TiersNotSupported(RewardTrigger::Review))
        ));
        assert!(repo.versions(RewardTrigger::Review).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stored_policy_content_is_immutable() {
        let (pool, _dir) = test_pool().await;
        let repo = PolicyRepository::new(pool.clone());
        let v1 = repo.publish(&review_draft(500), None, T0).await.unwrap();
        let edit = sqlx::query("UPDATE reward_policies SET reward_json = $1 WHERE id = $2")
            .bind(r#"{"type":"fixed","amount":99999}"#)
            .bind(v1.id)
            .execute(&pool)
            .await;
        assert!(edit.is_err());
    }

    #[tokio::test]
    async fn recommender_policy_keeps_its_tiers() {
        let (pool, _dir) = test_pool().await;
        let repo = PolicyRepository::new(pool);
        let draft = PolicyDraft::new(
            RewardTrigger::ReferralRecommender,
            Reward::Fixed { amount: 3_000 },
        )
        .with_tiers(TierSchedule::default());
        repo.publish(&draft, None, T0).await.unwrap();
        let active = repo
            .active(RewardTrigger::ReferralRecommender)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.tiers, Some(TierSchedule::default()));
    }
}
