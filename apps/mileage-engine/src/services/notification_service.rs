use anyhow::Result;
use async_trait::async_trait;
use mileage_db::models::redemption_code::CodeKind;
use mileage_shared::{ReferralTier, RewardTrigger};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Facts worth telling a user about, emitted only after the unit that
/// produced them has committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    RewardCredited {
        user_id: i64,
        trigger: RewardTrigger,
        amount: i64,
        balance: i64,
        tier: Option<ReferralTier>,
    },
    CodeRedeemed {
        user_id: i64,
        code: String,
        kind: CodeKind,
        balance: i64,
    },
    MileageSpent {
        user_id: i64,
        amount: i64,
        balance: i64,
    },
    TierReached {
        user_id: i64,
        tier: ReferralTier,
        coupons_issued: usize,
    },
}

impl Notification {
    pub fn user_id(&self) -> i64 {
        match self {
            Notification::RewardCredited { user_id, .. }
            | Notification::CodeRedeemed { user_id, .. }
            | Notification::MileageSpent { user_id, .. }
            | Notification::TierReached { user_id, .. } => *user_id,
        }
    }
}

/// Delivery channel (push, toast, chat bot). Implementations live outside
/// the core.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the log. Used when nothing else is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        info!(
            "Notify user {}: {}",
            notification.user_id(),
            serde_json::to_string(notification)?
        );
        Ok(())
    }
}

/// Forwards notifications into an in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        self.tx
            .send(notification.clone())
            .map_err(|_| anyhow::anyhow!("notification receiver dropped"))
    }
}

/// Fire-and-forget dispatch. Delivery runs on its own task and a failure
/// is only logged; it never reaches the caller of the operation.
#[derive(Clone)]
pub struct NotificationService {
    sink: Arc<dyn NotificationSink>,
}

impl NotificationService {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    pub fn dispatch(&self, notification: Notification) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.deliver(&notification).await {
                warn!(
                    "Failed to notify user {}: {}",
                    notification.user_id(),
                    e
                );
            }
        });
    }

    pub fn dispatch_all(&self, notifications: impl IntoIterator<Item = Notification>) {
        for notification in notifications {
            self.dispatch(notification);
        }
    }
}
