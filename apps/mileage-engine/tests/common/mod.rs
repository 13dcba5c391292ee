#![allow(dead_code)]

use mileage_engine::services::notification_service::{ChannelNotifier, Notification};
use mileage_engine::{Engine, EngineConfig};
use mileage_shared::{ManualClock, PolicyDraft, Reward, RewardTrigger};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

pub const T0: i64 = 1_790_000_000_000;

pub struct TestEngine {
    pub engine: Engine,
    pub clock: Arc<ManualClock>,
    pub events: UnboundedReceiver<Notification>,
    _dir: TempDir,
}

/// Engine over a fresh database file, a manual clock at `T0` and a channel
/// sink for notifications.
pub async fn setup() -> TestEngine {
    setup_with(EngineConfig::default()).await
}

pub async fn setup_with(mut config: EngineConfig) -> TestEngine {
    let dir = tempfile::tempdir().unwrap();
    config.database_url = format!("sqlite://{}", dir.path().join("engine.db").display());
    config.max_connections = 8;

    let pool = mileage_db::db::connect(&config.database_url, config.max_connections)
        .await
        .unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let (sink, events) = ChannelNotifier::new();
    let engine = Engine::new(pool, &config, clock.clone(), Arc::new(sink));

    TestEngine {
        engine,
        clock,
        events,
        _dir: dir,
    }
}

impl TestEngine {
    pub async fn publish_fixed(&self, trigger: RewardTrigger, amount: i64) {
        self.publish(PolicyDraft::new(trigger, Reward::Fixed { amount }))
            .await;
    }

    pub async fn publish(&self, draft: PolicyDraft) {
        self.engine.policies.publish(&draft, Some(1)).await.unwrap();
    }

    /// Next notification, waiting for the dispatch task if needed.
    pub async fn next_event(&mut self) -> Notification {
        tokio::time::timeout(std::time::Duration::from_secs(5), self.events.recv())
            .await
            .expect("notification not delivered")
            .expect("notification channel closed")
    }
}
