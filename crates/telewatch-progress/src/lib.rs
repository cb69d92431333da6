//! Multi-stage, weighted progress tracking with historical duration
//! learning.

pub mod history;
pub mod tracker;

#[cfg(test)]
mod tests;

pub use history::HistoryStore;
pub use tracker::{format_duration, ProgressTracker};
