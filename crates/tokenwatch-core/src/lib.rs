//! Core types for tokenwatch: usage records, statistics snapshots,
//! billing-block math, percentiles and the shared error enum.

pub mod blocks;
pub mod config;
pub mod error;
pub mod models;
pub mod percentile;
pub mod session_id;

pub use error::{Result, WatchError};
