//! Integration test suite for conductor.
//!
//! These tests drive the public API the way a deployment does: task graphs
//! built from plans, workers contending for resources, supervised worker
//! processes and real socket connections.
//!
//! # Test Categories
//!
//! - `scheduling`: task graph behavior and graph properties
//! - `coordination`: lock hand-off, mutual exclusion, deadlock liveness
//! - `supervision`: bounded worker restarts
//! - `wire`: framing under truncation and concurrent senders
//! - `orchestrator_e2e`: the full loop over a local socket
//!
//! # CI Compatibility
//!
//! Worker processes are plain shell commands and the socket lives in a
//! temp directory, so nothing leaves the machine.

mod fixtures;

mod coordination;
mod orchestrator_e2e;
mod scheduling;
mod supervision;
mod wire;
