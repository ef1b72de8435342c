//! Ledger Indexer Core
//!
//! Turns the committed transaction stream of a UTXO-style ledger into a
//! derived relational model: transaction rows, classified operation groups,
//! substates and interval-versioned balance history.
//!
//! # Architecture
//!
//! - **Accumulator Chain**: Every transaction is checked against its parent before its content is applied
//! - **Two-Phase Batches**: Schedule, bulk-load, then replay in state version order
//! - **Single Writer**: One actor owns ledger extension
//! - **Atomic Commit**: A batch is written in one RocksDB write batch, or not at all
//!
//! # Invariants
//!
//! - A substate is upped at most once and downed at most once
//! - Exactly one open history entry per key; closed intervals are contiguous
//! - No account balance, token supply or validator stake total is ever negative
//! - Deterministic replay: same transactions → same rows

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod accounting;
pub mod accumulator;
pub mod actor;
pub mod config;
pub mod entity;
pub mod error;
pub mod extender;
pub mod history;
pub mod metrics;
pub mod planner;
pub mod processor;
pub mod storage;
pub mod substate;
pub mod summary;
pub mod types;

// Re-exports
pub use accounting::{InferredAction, InferredActionType};
pub use config::Config;
pub use entity::{Entity, EntityResolver, NativeToken, ResourceIdentifier};
pub use error::{Error, Result};
pub use extender::{CommitReport, ConsistentLedgerExtension, LedgerExtender};
pub use storage::Storage;
pub use summary::TransactionSummary;
pub use types::{CommittedTransaction, TokenAmount, TransactionOpLocator};
