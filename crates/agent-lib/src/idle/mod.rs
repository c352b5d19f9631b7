//! Idle tracking
//!
//! Debounces per-tick idle verdicts into one-shot reclaim candidates.

mod tracker;

pub use tracker::{IdleTracker, Observation, TrackerState};
