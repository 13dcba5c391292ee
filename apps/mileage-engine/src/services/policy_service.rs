use mileage_db::models::policy::PolicyChange;
use mileage_db::repositories::policy_repo::PolicyRepository;
use mileage_db::{MileageError, MileageResult};
use mileage_shared::{Clock, PolicyDraft, RewardPolicy, RewardTrigger};
use sqlx::SqlitePool;
use std::sync::Arc;

use super::with_conflict_retry;

/// Administrative side of the policy store.
#[derive(Debug, Clone)]
pub struct PolicyService {
    repo: PolicyRepository,
    clock: Arc<dyn Clock>,
    retries: u32,
}

impl PolicyService {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, retries: u32) -> Self {
        Self {
            repo: PolicyRepository::new(pool),
            clock,
            retries,
        }
    }

    pub async fn publish(
        &self,
        draft: &PolicyDraft,
        changed_by: Option<i64>,
    ) -> MileageResult<RewardPolicy> {
        let now = self.clock.now_millis();
        with_conflict_retry("policy publish", self.retries, move || {
            self.repo.publish(draft, changed_by, now)
        })
        .await
    }

    pub async fn deactivate(
        &self,
        policy_id: i64,
        changed_by: Option<i64>,
    ) -> MileageResult<RewardPolicy> {
        let now = self.clock.now_millis();
        with_conflict_retry("policy deactivate", self.retries, move || {
            self.repo.deactivate(policy_id, changed_by, now)
        })
        .await
    }

    pub async fn active(&self, trigger: RewardTrigger) -> MileageResult<RewardPolicy> {
        self.repo
            .active(trigger)
            .await?
            .ok_or(MileageError::NoActivePolicy(trigger))
    }

    pub async fn versions(&self, trigger: RewardTrigger) -> MileageResult<Vec<RewardPolicy>> {
        self.repo.versions(trigger).await
    }

    pub async fn change_log(
        &self,
        trigger: Option<RewardTrigger>,
    ) -> MileageResult<Vec<PolicyChange>> {
        self.repo.change_log(trigger).await
    }
}
