//! Behavioral scenario harness for rtpthread.
//!
//! This crate provides:
//! - Scenarios: end-to-end checks of the threading layer's observable laws
//! - Reports: serializable per-scenario and per-suite results

#![forbid(unsafe_code)]

pub mod report;
pub mod scenarios;

pub use report::{ScenarioReport, SuiteReport};
pub use scenarios::{SCENARIOS, Scenario, ScenarioError, lock_timeout_ms, run_all, run_named};
