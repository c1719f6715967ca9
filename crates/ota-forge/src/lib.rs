pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod hashing;
pub mod keys;
pub mod locator;
pub mod metrics;
pub mod package;
pub mod patch;
pub mod pipeline;
pub mod process;
pub mod publish;
pub mod record;
pub mod storage;

pub use error::{Error, Reason, Result};
