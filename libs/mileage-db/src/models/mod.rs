pub mod account;
pub mod coupon;
pub mod payment;
pub mod policy;
pub mod redemption_code;
pub mod referral;
pub mod transaction;
