//! `tickwork-core`: configuration, ids, error type and the persisted data
//! model shared by every tickwork crate.

pub mod config;
pub mod error;
pub mod model;
pub mod types;

pub use error::{Result, TickworkError};
