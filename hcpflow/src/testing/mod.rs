//! Testing utilities for hcpflow.
//!
//! This module provides:
//! - Session fixtures with realistic sidecar metadata
//! - A literal tool environment and configuration helpers
//! - A spy executor that records invocations

mod fixtures;
mod mocks;

pub use fixtures::{configuration, configuration_in, tool_environment, SessionFixture};
pub use mocks::RecordingExecutor;
