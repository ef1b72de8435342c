//! Actor-based concurrency for the indexer
//!
//! Ledger extension is single-writer: every batch goes through one task
//! which owns the [`LedgerExtender`]. Handles are cheap to clone and talk to
//! it over a bounded mailbox, so upstream fetchers get backpressure.
//!
//! ```text
//! fetcher ──┐
//! fetcher ──┼── ExtenderHandle ── mpsc (bounded) ──► ExtenderActor ──► LedgerExtender
//! fetcher ──┘                                        (one task)        (spawn_blocking)
//! ```

use crate::extender::{CommitReport, ConsistentLedgerExtension, LedgerExtender};
use crate::summary::TransactionSummary;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Message sent to the extender actor
#[derive(Debug)]
pub enum ExtenderMessage {
    /// Commit a batch
    CommitTransactions {
        /// The batch
        extension: ConsistentLedgerExtension,
        /// Cancels the batch before it is written
        cancel: CancellationToken,
        /// Reply
        response: oneshot::Sender<Result<CommitReport>>,
    },

    /// Get top of ledger
    GetTopOfLedger {
        /// Reply
        response: oneshot::Sender<TransactionSummary>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that owns the extender
#[derive(Debug)]
pub struct ExtenderActor {
    extender: Arc<LedgerExtender>,
    mailbox: mpsc::Receiver<ExtenderMessage>,
}

impl ExtenderActor {
    /// Create new actor
    pub fn new(extender: Arc<LedgerExtender>, mailbox: mpsc::Receiver<ExtenderMessage>) -> Self {
        Self { extender, mailbox }
    }

    /// Run the actor event loop until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                ExtenderMessage::Shutdown => break,
                msg => self.handle_message(msg).await,
            }
        }

        tracing::info!("Extender actor stopped");
    }

    async fn handle_message(&mut self, msg: ExtenderMessage) {
        match msg {
            ExtenderMessage::CommitTransactions {
                extension,
                cancel,
                response,
            } => {
                let extender = Arc::clone(&self.extender);
                // RocksDB work is blocking
                let result = tokio::task::spawn_blocking(move || extender.commit_transactions(extension, &cancel))
                    .await
                    .unwrap_or_else(|e| Err(Error::Concurrency(format!("Commit task failed: {}", e))));

                if let Err(e) = &result {
                    tracing::error!(error = %e, fatal = e.is_fatal_ledger_error(), "Failed to commit batch");
                }
                let _ = response.send(result);
            }

            ExtenderMessage::GetTopOfLedger { response } => {
                let _ = response.send(self.extender.top_of_ledger());
            }

            ExtenderMessage::Shutdown => {
                // Handled in main loop
            }
        }
    }
}

/// Handle for sending messages to the actor
#[derive(Clone, Debug)]
pub struct ExtenderHandle {
    sender: mpsc::Sender<ExtenderMessage>,
}

impl ExtenderHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<ExtenderMessage>) -> Self {
        Self { sender }
    }

    /// Commit a batch
    pub async fn commit_transactions(
        &self,
        extension: ConsistentLedgerExtension,
        cancel: CancellationToken,
    ) -> Result<CommitReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ExtenderMessage::CommitTransactions {
                extension,
                cancel,
                response: tx,
            })
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Get top of ledger
    pub async fn top_of_ledger(&self) -> Result<TransactionSummary> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ExtenderMessage::GetTopOfLedger { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(ExtenderMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the extender actor
pub fn spawn_extender_actor(extender: Arc<LedgerExtender>, channel_capacity: usize) -> ExtenderHandle {
    let (tx, rx) = mpsc::channel(channel_capacity.max(1)); // Bounded channel for backpressure
    let actor = ExtenderActor::new(extender, rx);

    tokio::spawn(async move {
        actor.run().await;
    });

    ExtenderHandle::new(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summary::pre_genesis_summary;
    use crate::Config;

    fn open_extender() -> (Arc<LedgerExtender>, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Arc::new(LedgerExtender::open(&config).unwrap()), temp_dir)
    }

    #[tokio::test]
    async fn test_actor_spawn_and_shutdown() {
        let (extender, _temp) = open_extender();
        let handle = spawn_extender_actor(extender, 4);

        assert_eq!(handle.top_of_ledger().await.unwrap(), pre_genesis_summary());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_actor_reports_commit_errors() {
        let (extender, _temp) = open_extender();
        let handle = spawn_extender_actor(extender, 4);

        let mut parent_summary = pre_genesis_summary();
        parent_summary.transaction_accumulator = vec![1; 32];
        let err = handle
            .commit_transactions(
                ConsistentLedgerExtension {
                    parent_summary,
                    transactions: Vec::new(),
                },
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InconsistentLedger(_)));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_fails_after_shutdown() {
        let (extender, _temp) = open_extender();
        let handle = spawn_extender_actor(extender, 1);
        handle.shutdown().await.unwrap();

        // Give the actor a moment to drop its mailbox
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(matches!(handle.top_of_ledger().await, Err(Error::Concurrency(_))));
    }
}
