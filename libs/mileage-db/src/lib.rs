pub mod db;
pub mod error;
pub mod models;
pub mod repositories;

pub use error::{MileageError, MileageResult};
pub use sqlx;

#[cfg(test)]
pub(crate) mod test_support;
