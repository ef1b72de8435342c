//! Ledger extension
//!
//! Ties together summarising, content processing, the planner and storage
//! into the batch pipeline:
//!
//! 1. Check the batch's parent is our top of ledger
//! 2. Summarise each transaction and check it chains from its parent
//! 3. Schedule the content of every transaction
//! 4. Load dependencies and replay
//! 5. Commit everything, with the new top of ledger, in one write batch
//!
//! Any error aborts the whole batch; nothing of it becomes visible.
//!
//! # Example
//!
//! ```no_run
//! use ledger_indexer::{extender::LedgerExtender, Config};
//!
//! fn main() -> ledger_indexer::Result<()> {
//!     let extender = LedgerExtender::open(&Config::default())?;
//!     println!("top of ledger: {}", extender.top_of_ledger().state_version);
//!     Ok(())
//! }
//! ```

use crate::{
    entity::{AddressEntityResolver, EntityResolver, NativeToken},
    error::{Error, Result},
    metrics::Metrics,
    planner::ActionsPlanner,
    processor::TransactionContentProcessor,
    substate::{PrefixVirtualSubstatePolicy, VirtualSubstatePolicy},
    summary::{
        assert_child_consistent, assert_parent_matches_top_of_ledger, generate_summary, pre_genesis_summary,
        TransactionSummary,
    },
    types::CommittedTransaction,
    Config, Storage,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Transactions to be committed on top of `parent_summary`, in state version order
#[derive(Debug, Clone)]
pub struct ConsistentLedgerExtension {
    /// Summary the first transaction chains from
    pub parent_summary: TransactionSummary,
    /// Transactions, contiguous and ascending
    pub transactions: Vec<CommittedTransaction>,
}

/// Outcome of a committed batch
#[derive(Debug, Clone)]
pub struct CommitReport {
    /// Transactions committed
    pub transactions_committed: usize,
    /// New top of ledger
    pub final_summary: TransactionSummary,
    /// Summarising and scheduling
    pub content_handling_ms: u64,
    /// Bulk loads
    pub dependency_loading_ms: u64,
    /// Actions replayed
    pub actions_count: usize,
    /// Replay
    pub action_replay_ms: u64,
    /// Write batch
    pub persistence_ms: u64,
    /// Rows written
    pub rows_written: usize,
}

/// Single-writer ledger extender
pub struct LedgerExtender {
    storage: Arc<Storage>,
    processor: TransactionContentProcessor,
    virtual_policy: Arc<dyn VirtualSubstatePolicy>,
    metrics: Metrics,
    top_of_ledger: RwLock<TransactionSummary>,
}

impl std::fmt::Debug for LedgerExtender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerExtender")
            .field("top_of_ledger", &self.top_of_ledger.read().state_version)
            .finish()
    }
}

impl LedgerExtender {
    /// Open storage and build the default collaborators from configuration
    pub fn open(config: &Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(config)?);
        let resolver = Arc::new(AddressEntityResolver::from_config(&config.network));
        let native_token = Arc::new(NativeToken::new(config.network.native_token_rri.clone()));
        let virtual_policy = Arc::new(PrefixVirtualSubstatePolicy::from_hex_prefixes(
            &config.substates.virtual_identifier_prefixes,
        )?);
        let metrics = Metrics::new().map_err(|e| Error::Config(format!("Failed to create metrics: {}", e)))?;

        Self::new(storage, resolver, native_token, virtual_policy, metrics)
    }

    /// Create an extender with explicit collaborators
    pub fn new(
        storage: Arc<Storage>,
        resolver: Arc<dyn EntityResolver>,
        native_token: Arc<NativeToken>,
        virtual_policy: Arc<dyn VirtualSubstatePolicy>,
        metrics: Metrics,
    ) -> Result<Self> {
        let top_of_ledger = storage.top_of_ledger()?.unwrap_or_else(pre_genesis_summary);
        metrics.set_top_of_ledger(top_of_ledger.state_version);

        tracing::info!(
            state_version = top_of_ledger.state_version,
            epoch = top_of_ledger.epoch,
            "Ledger extender ready"
        );

        Ok(Self {
            storage,
            processor: TransactionContentProcessor::new(resolver, native_token),
            virtual_policy,
            metrics,
            top_of_ledger: RwLock::new(top_of_ledger),
        })
    }

    /// Summary of the last committed transaction, or the pre-genesis summary
    pub fn top_of_ledger(&self) -> TransactionSummary {
        self.top_of_ledger.read().clone()
    }

    /// Storage, for reads
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Commit a batch of transactions atomically.
    ///
    /// `cancel` is checked around the bulk loads and before the final write.
    pub fn commit_transactions(
        &self,
        extension: ConsistentLedgerExtension,
        cancel: &CancellationToken,
    ) -> Result<CommitReport> {
        let started = Instant::now();
        let mut top_of_ledger = self.top_of_ledger.write();

        assert_parent_matches_top_of_ledger(&extension.parent_summary, &top_of_ledger)?;

        let transactions = extension.transactions;
        if transactions.is_empty() {
            return Ok(CommitReport {
                transactions_committed: 0,
                final_summary: top_of_ledger.clone(),
                content_handling_ms: 0,
                dependency_loading_ms: 0,
                actions_count: 0,
                action_replay_ms: 0,
                persistence_ms: 0,
                rows_written: 0,
            });
        }

        // Summarise and check the whole chain before touching content
        let content_started = Instant::now();
        let mut summaries = Vec::with_capacity(transactions.len());
        let mut parent = top_of_ledger.clone();
        for transaction in &transactions {
            let summary = generate_summary(&parent, transaction)?;
            assert_child_consistent(&parent, &summary)?;
            summaries.push(summary.clone());
            parent = summary;
        }

        tracing::debug!(
            transactions = transactions.len(),
            first_state_version = transactions[0].state_version(),
            "Transactions summarised"
        );

        let mut planner = ActionsPlanner::new(Arc::clone(&self.virtual_policy));
        for (transaction, summary) in transactions.iter().zip(&summaries) {
            self.processor.process_transaction(&mut planner, transaction, summary)?;
        }
        let content_handling_ms = content_started.elapsed().as_millis() as u64;

        let (working_set, planner_report) = planner.process_all_changes(&*self.storage, cancel)?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let final_summary = parent;
        let persistence_started = Instant::now();
        let rows_written = self.storage.commit_batch(&working_set, &final_summary)?;
        let persistence_ms = persistence_started.elapsed().as_millis() as u64;

        *top_of_ledger = final_summary.clone();

        self.metrics.record_batch_committed(
            transactions.len(),
            started.elapsed().as_secs_f64(),
            final_summary.state_version,
        );

        tracing::info!(
            transactions = transactions.len(),
            state_version = final_summary.state_version,
            epoch = final_summary.epoch,
            content_handling_ms,
            dependency_loading_ms = planner_report.dependency_loading_ms,
            actions = planner_report.actions_count,
            action_replay_ms = planner_report.action_replay_ms,
            persistence_ms,
            rows_written,
            "Committed transactions"
        );

        Ok(CommitReport {
            transactions_committed: transactions.len(),
            final_summary,
            content_handling_ms,
            dependency_loading_ms: planner_report.dependency_loading_ms,
            actions_count: planner_report.actions_count,
            action_replay_ms: planner_report.action_replay_ms,
            persistence_ms,
            rows_written,
        })
    }
}
