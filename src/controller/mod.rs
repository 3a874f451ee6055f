//! Controller module for elasticsearch-operator.
//!
//! Contains the reconciliation loop, the managed node abstraction, the
//! restart orchestrator, status management and validation logic.
//!
//! A reconcile flows through:
//! - `validation`: spec rules, persisted as conditions
//! - `topology`: declared node groups to managed nodes and workloads
//! - `restart` / `campaign`: at most one resumable restart campaign
//! - `disk_watermark`: lifting read-only index blocks once disks recover

// Shared modules
pub mod common;
pub mod context;
pub mod error;
pub mod polling;
pub mod status;

// Managed nodes
pub mod managed_node;
pub mod node_registry;
pub mod replicated_node;
pub mod scalable_node;

// Reconciliation
pub mod campaign;
pub mod disk_watermark;
pub mod reconciler;
pub mod restart;
pub mod topology;
pub mod validation;
