//! Multi-host diagnostic orchestration for a management agent.
//!
//! A session resolves a list of devices, runs a fixed catalog of agent
//! commands against each one (locally or over SSH), collects the log
//! archives the agent produces, and writes a consolidated report.

pub mod backend;
pub mod catalog;
pub mod cli;
pub mod collector;
pub mod config;
pub mod devices;
pub mod error;
pub mod poll;
pub mod remote;
pub mod session;

pub use error::{Error, FleetDiagError, Result};
