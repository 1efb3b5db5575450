pub mod activity;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod logging;
pub mod migration;

pub use error::{AppError, PreconditionError};
