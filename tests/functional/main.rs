// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Functional tests for cluster reconciliation and restart campaigns.
//!
//! These tests drive the real reconciler against an in-memory cluster that
//! plays Kubernetes, Elasticsearch and the status subresource at once. No
//! live Kubernetes cluster is needed.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run specific test
//! cargo test --test functional test_single_node_cert_restart
//!
//! # Run with verbose output
//! cargo test --test functional -- --nocapture
//! ```
//!
//! ## Test Categories
//!
//! - **Topology tests**: node creation, guarded deletion, master quorum
//! - **Campaign tests**: stage persistence, resumption and deferral of one
//!   campaign driven directly
//! - **Scenario tests**: multi-pass reconciles covering certificate
//!   rotation, template updates, requested restarts and index blocks
//!
//! ## Design Principles
//!
//! - **No K8s Required**: Tests run without any cluster infrastructure
//! - **Fast Execution**: Polling uses millisecond intervals and timeouts
//! - **Persisted State Only**: Assertions read the stored status, the way
//!   the next reconcile would

mod campaign_tests;
mod topology_tests;

// Re-export for use in tests
pub use mock_state::*;
