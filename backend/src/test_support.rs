//! Test utilities for the event bus crate.
//!
//! This module provides shared helpers for both unit tests (in `src/`) and
//! integration tests (in `tests/`). It is compiled for unit tests and behind
//! the `test-support` feature.

pub mod in_memory_broker;
pub mod runtime;
pub mod state_log;
