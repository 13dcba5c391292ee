//! Repositories. Free functions taking `&mut SqliteConnection` are the
//! building blocks of atomic units: callers run them inside one
//! `sqlx::Transaction` and commit once. Repository structs own a pool and
//! serve reads and single-statement writes.

pub mod code_repo;
pub mod coupon_repo;
pub mod ledger_repo;
pub mod payment_repo;
pub mod policy_repo;
pub mod referral_repo;
