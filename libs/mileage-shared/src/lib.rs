//! Pure domain logic for the mileage core: reward policies, referral tiers,
//! the reward calculator and the clock abstraction. Nothing in this crate
//! touches storage.

pub mod clock;
pub mod policy;
pub mod reward;
pub mod tier;

pub use clock::{Clock, ManualClock, SystemClock};
pub use policy::{
    Condition, PolicyDraft, PolicyError, PolicyStatus, Reward, RewardPeriod, RewardPolicy,
    RewardTrigger,
};
pub use reward::{Ineligible, RewardContext, RewardDecision, compute};
pub use tier::{ReferralTier, TierLevel, TierSchedule, tier_for_count};
