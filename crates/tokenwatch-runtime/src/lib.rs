//! Runtime layer for tokenwatch: the debounced filesystem watcher, the
//! concurrent statistics aggregator and the live monitor that composes
//! the ingestion pipeline into an update stream.

pub mod aggregator;
pub mod live_monitor;
pub mod watcher;
