//! Agent library for idle GPU reclamation
//!
//! This crate provides the core functionality for:
//! - Sampling GPU utilization and compute processes (NVML or nvidia-smi)
//! - Attributing GPU processes to Kubernetes workloads
//! - Debouncing idle observations into reclaim candidates
//! - Re-validating and reporting candidates
//! - Health checks and observability

pub mod attribution;
pub mod health;
pub mod idle;
pub mod models;
pub mod observability;
pub mod reclaim;
pub mod sampler;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ReclaimMetrics, StructuredLogger};
