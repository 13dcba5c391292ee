use mileage_shared::RewardPolicy;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

use crate::error::MileageResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Published,
    Superseded,
    Deactivated,
}

/// Audit log entry. `snapshot` is the policy as JSON at the time of change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PolicyChange {
    pub id: i64,
    pub policy_id: i64,
    pub trigger_type: String,
    pub action: PolicyAction,
    pub snapshot: String,
    pub changed_by: Option<i64>,
    pub created_at: i64,
}

pub(crate) fn policy_from_row(row: &SqliteRow) -> MileageResult<RewardPolicy> {
    let trigger: String = row.try_get("trigger_type")?;
    let status: String = row.try_get("status")?;
    let reward: String = row.try_get("reward_json")?;
    let conditions: String = row.try_get("conditions_json")?;
    let tiers: Option<String> = row.try_get("tiers_json")?;

    Ok(RewardPolicy {
        id: row.try_get("id")?,
        trigger: trigger.parse()?,
        version: row.try_get("version")?,
        status: status.parse()?,
        reward: serde_json::from_str(&reward)?,
        conditions: serde_json::from_str(&conditions)?,
        tiers: tiers.as_deref().map(serde_json::from_str).transpose()?,
        priority: row.try_get("priority")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
    })
}
