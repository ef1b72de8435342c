//! Ledger indexer ingest binary
//!
//! Usage: `ledger-indexer [config.toml] <transactions.json>`
//!
//! Reads a JSON array of committed transactions and commits them, in batches,
//! on top of the current top of ledger. Transactions at or below the top of
//! ledger are skipped, so the same file can be replayed.

use anyhow::Context;
use ledger_indexer::{
    actor::spawn_extender_actor, CommittedTransaction, Config, ConsistentLedgerExtension, Error, LedgerExtender,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config, input) = match args.as_slice() {
        [input] => (Config::from_env()?, input),
        [config_path, input] => (
            Config::from_file(config_path).with_context(|| format!("Failed to load config {}", config_path))?,
            input,
        ),
        _ => anyhow::bail!("Usage: ledger-indexer [config.toml] <transactions.json>"),
    };

    tracing::info!(service = %config.service_name, data_dir = ?config.data_dir, "Starting ledger indexer");

    let content = std::fs::read_to_string(input).with_context(|| format!("Failed to read {}", input))?;
    let transactions: Vec<CommittedTransaction> =
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", input))?;

    let extender = Arc::new(LedgerExtender::open(&config)?);
    let handle = spawn_extender_actor(Arc::clone(&extender), config.batching.channel_capacity);

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, cancelling");
            ctrl_c_cancel.cancel();
        }
    });

    let top = handle.top_of_ledger().await?;
    let pending: Vec<CommittedTransaction> = transactions
        .into_iter()
        .filter(|t| t.state_version() > top.state_version)
        .collect();

    tracing::info!(
        top_of_ledger = top.state_version,
        pending = pending.len(),
        "Input loaded"
    );

    let mut committed = 0usize;
    for chunk in pending.chunks(config.batching.max_batch_size.max(1)) {
        if cancel.is_cancelled() {
            break;
        }

        let parent_summary = handle.top_of_ledger().await?;
        let result = handle
            .commit_transactions(
                ConsistentLedgerExtension {
                    parent_summary,
                    transactions: chunk.to_vec(),
                },
                cancel.clone(),
            )
            .await;

        match result {
            Ok(report) => committed += report.transactions_committed,
            Err(Error::Cancelled) => {
                tracing::warn!("Batch cancelled before commit");
                break;
            }
            Err(e) => return Err(e).context("Failed to commit batch"),
        }
    }

    handle.shutdown().await?;

    let final_state_version = extender.top_of_ledger().state_version;
    tracing::info!(committed, state_version = final_state_version, "Shutting down ledger indexer");
    Ok(())
}
