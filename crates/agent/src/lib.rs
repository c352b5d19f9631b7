//! GPU reclaimer agent
//!
//! Configuration loading and the health/metrics HTTP API for the
//! `gpu-reclaimer-agent` binary.

pub mod api;
pub mod config;
