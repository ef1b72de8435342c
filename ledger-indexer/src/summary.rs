//! Transaction summaries and chain consistency
//!
//! A [`TransactionSummary`] is the compact rollup of a committed transaction
//! that the next transaction is checked and summarised against:
//!
//! - Epoch and index in epoch, derived from the parent summary
//! - Latest round and its timestamp, inherited until a new round is created
//! - A normalized round timestamp, clamped so it never runs backwards nor
//!   ahead of the time the summary was created
//! - The transaction's identifier hash and the accumulator the node claimed
//!
//! The chain is anchored by [`pre_genesis_summary`].

use crate::{
    accumulator::{self, ACCUMULATOR_LENGTH},
    error::{Error, Result},
    types::{CommittedTransaction, TransactionOpLocator},
};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Per-transaction rollup, chained from its parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSummary {
    /// Resultant state version
    pub state_version: u64,
    /// Epoch the transaction belongs to
    pub epoch: u64,
    /// Index of the transaction in its epoch (-1 only before genesis)
    pub index_in_epoch: i64,
    /// Latest round seen, inherited from the parent when unchanged
    pub round_in_epoch: u64,
    /// The transaction creates the next epoch's data
    pub is_end_of_epoch: bool,
    /// Every operation is round or BFT bookkeeping
    pub is_only_round_change: bool,
    /// Round deleted by the end-of-epoch transaction
    pub end_of_epoch_round: Option<u64>,
    /// Transaction identifier hash (empty before genesis)
    #[serde(with = "serde_bytes")]
    pub transaction_identifier_hash: Vec<u8>,
    /// Accumulator after this transaction
    #[serde(with = "serde_bytes")]
    pub transaction_accumulator: Vec<u8>,
    /// Timestamp of the current view (round)
    pub current_view_timestamp: DateTime<Utc>,
    /// When this summary was created by the indexer
    pub created_timestamp: DateTime<Utc>,
    /// Round timestamp clamped between the parent's normalized timestamp and `created_timestamp`
    pub normalized_round_timestamp: DateTime<Utc>,
}

/// Summary anchoring the chain, before the first real transaction
pub fn pre_genesis_summary() -> TransactionSummary {
    TransactionSummary {
        state_version: 0,
        epoch: 0,
        index_in_epoch: -1,
        round_in_epoch: 0,
        is_end_of_epoch: false,
        is_only_round_change: false,
        end_of_epoch_round: None,
        transaction_identifier_hash: Vec::new(),
        transaction_accumulator: vec![0u8; ACCUMULATOR_LENGTH],
        current_view_timestamp: DateTime::<Utc>::default(),
        created_timestamp: DateTime::<Utc>::default(),
        normalized_round_timestamp: DateTime::<Utc>::default(),
    }
}

/// Summarise `transaction` on top of `parent`, created now
pub fn generate_summary(
    parent: &TransactionSummary,
    transaction: &CommittedTransaction,
) -> Result<TransactionSummary> {
    generate_summary_at(parent, transaction, Utc::now())
}

/// Summarise `transaction` on top of `parent`, as if created at `created_timestamp`
pub fn generate_summary_at(
    parent: &TransactionSummary,
    transaction: &CommittedTransaction,
    created_timestamp: DateTime<Utc>,
) -> Result<TransactionSummary> {
    let mut is_end_of_epoch = false;
    let mut is_only_round_change = true;
    let mut end_of_epoch_round = None;
    let mut new_round = None;
    let mut new_timestamp = None;

    for (group_index, group) in transaction.operation_groups.iter().enumerate() {
        for (operation_index, operation) in group.operations.iter().enumerate() {
            if !operation.is_round_or_bft_housekeeping() {
                is_only_round_change = false;
            }

            if operation.created_epoch().is_some() {
                is_end_of_epoch = true;
            }

            if let Some(round) = operation.deleted_round() {
                end_of_epoch_round = Some(round);
            }

            if let Some((round, timestamp_ms)) = operation.created_round() {
                new_round = Some(round);
                // The ledger's first round carries a zero timestamp
                if timestamp_ms != 0 {
                    let timestamp = Utc.timestamp_millis_opt(timestamp_ms).single().ok_or_else(|| {
                        Error::invalid_transaction(
                            TransactionOpLocator::operation(
                                transaction.state_version(),
                                transaction.hash_hex(),
                                group_index,
                                operation_index,
                            ),
                            format!("round timestamp {} is out of range", timestamp_ms),
                        )
                    })?;
                    new_timestamp = Some(timestamp);
                }
            }
        }
    }

    let (epoch, index_in_epoch) = if parent.is_end_of_epoch {
        (parent.epoch + 1, 0)
    } else {
        (parent.epoch, parent.index_in_epoch + 1)
    };

    let current_view_timestamp = new_timestamp.unwrap_or(parent.current_view_timestamp);
    let normalized_round_timestamp = if current_view_timestamp < parent.normalized_round_timestamp {
        parent.normalized_round_timestamp
    } else if current_view_timestamp > created_timestamp {
        created_timestamp
    } else {
        current_view_timestamp
    };

    Ok(TransactionSummary {
        state_version: transaction.state_version(),
        epoch,
        index_in_epoch,
        round_in_epoch: new_round.unwrap_or(parent.round_in_epoch),
        is_end_of_epoch,
        is_only_round_change,
        end_of_epoch_round,
        transaction_identifier_hash: transaction.transaction_identifier_hash.clone(),
        transaction_accumulator: transaction
            .committed_state_identifier
            .transaction_accumulator
            .clone(),
        current_view_timestamp,
        created_timestamp,
        normalized_round_timestamp,
    })
}

/// Assert that `child` directly follows `parent` in the accumulator chain.
///
/// This must pass before any of the child's content is applied.
pub fn assert_child_consistent(parent: &TransactionSummary, child: &TransactionSummary) -> Result<()> {
    if child.state_version != parent.state_version + 1 {
        return Err(Error::InvalidLedgerCommit(format!(
            "Attempted to commit a transaction with state version {} on top of transaction with state version {}",
            child.state_version, parent.state_version
        )));
    }

    if !accumulator::is_valid(
        &parent.transaction_accumulator,
        &child.transaction_identifier_hash,
        &child.transaction_accumulator,
    ) {
        let expected = accumulator::create_new(
            &parent.transaction_accumulator,
            &child.transaction_identifier_hash,
        );
        return Err(Error::InconsistentLedger(format!(
            "Failure to commit a child transaction with resultant state version {}. \
             The parent (with resultant state version {}) has accumulator {} and the child has \
             transaction identifier hash {}, so the expected accumulator is {}, but the child \
             reported an accumulator of {}",
            child.state_version,
            parent.state_version,
            hex::encode(&parent.transaction_accumulator),
            hex::encode(&child.transaction_identifier_hash),
            hex::encode(expected),
            hex::encode(&child.transaction_accumulator),
        )));
    }

    Ok(())
}

/// Assert that the parent of an extension is the transaction on top of our ledger
pub fn assert_parent_matches_top_of_ledger(
    parent: &TransactionSummary,
    top_of_ledger: &TransactionSummary,
) -> Result<()> {
    if parent.state_version != top_of_ledger.state_version {
        return Err(Error::InvalidLedgerCommit(format!(
            "Attempted to commit a group of transactions with parent state version {}, \
             but the last committed transaction is at state version {}",
            parent.state_version, top_of_ledger.state_version
        )));
    }

    if parent.transaction_accumulator != top_of_ledger.transaction_accumulator {
        return Err(Error::InconsistentLedger(format!(
            "Attempted to commit a group of transactions with parent transaction accumulator {} \
             (state version {}), but the last committed transaction had accumulator {}",
            hex::encode(&parent.transaction_accumulator),
            parent.state_version,
            hex::encode(&top_of_ledger.transaction_accumulator),
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityIdentifier;
    use crate::types::{
        DataAction, DataActionKind, DataObject, Operation, OperationGroup, StateIdentifier,
        TransactionMetadata,
    };

    fn data_operation(action: DataActionKind, data_object: DataObject) -> Operation {
        Operation {
            entity_identifier: EntityIdentifier::new("system"),
            substate: None,
            amount: None,
            data: Some(DataAction { action, data_object }),
        }
    }

    fn transaction_on(parent: &TransactionSummary, operations: Vec<Operation>) -> CommittedTransaction {
        let hash = [parent.state_version as u8 + 1; 32];
        CommittedTransaction {
            transaction_identifier_hash: hash.to_vec(),
            committed_state_identifier: StateIdentifier {
                state_version: parent.state_version + 1,
                transaction_accumulator: accumulator::create_new(&parent.transaction_accumulator, &hash)
                    .to_vec(),
            },
            operation_groups: vec![OperationGroup { operations }],
            metadata: TransactionMetadata {
                fee: "0".into(),
                signed_by: None,
                message: None,
                hex: "00".into(),
                timestamp: 0,
            },
        }
    }

    #[test]
    fn test_first_transaction_is_index_zero() {
        let genesis = pre_genesis_summary();
        let tx = transaction_on(&genesis, vec![]);
        let summary = generate_summary(&genesis, &tx).unwrap();

        assert_eq!(summary.state_version, 1);
        assert_eq!(summary.epoch, 0);
        assert_eq!(summary.index_in_epoch, 0);
        assert!(summary.is_only_round_change);
        assert_child_consistent(&genesis, &summary).unwrap();
    }

    #[test]
    fn test_epoch_rolls_over_after_end_of_epoch() {
        let genesis = pre_genesis_summary();
        let end_of_epoch = transaction_on(
            &genesis,
            vec![
                data_operation(
                    DataActionKind::Delete,
                    DataObject::RoundData {
                        round: 50,
                        timestamp: 1_000,
                    },
                ),
                data_operation(DataActionKind::Create, DataObject::EpochData { epoch: 1 }),
            ],
        );
        let first = generate_summary(&genesis, &end_of_epoch).unwrap();
        assert!(first.is_end_of_epoch);
        assert_eq!(first.end_of_epoch_round, Some(50));
        assert!(!first.is_only_round_change);

        let next = transaction_on(&first, vec![]);
        let second = generate_summary(&first, &next).unwrap();
        assert_eq!(second.epoch, 1);
        assert_eq!(second.index_in_epoch, 0);
        assert!(!second.is_end_of_epoch);
    }

    #[test]
    fn test_round_timestamp_is_inherited_when_zero() {
        let genesis = pre_genesis_summary();
        let with_time = transaction_on(
            &genesis,
            vec![data_operation(
                DataActionKind::Create,
                DataObject::RoundData {
                    round: 1,
                    timestamp: 1_637_000_000_000,
                },
            )],
        );
        let first = generate_summary(&genesis, &with_time).unwrap();
        assert_eq!(first.current_view_timestamp.timestamp_millis(), 1_637_000_000_000);
        assert_eq!(first.round_in_epoch, 1);

        let zero_time = transaction_on(
            &first,
            vec![data_operation(
                DataActionKind::Create,
                DataObject::RoundData { round: 2, timestamp: 0 },
            )],
        );
        let second = generate_summary(&first, &zero_time).unwrap();
        assert_eq!(second.current_view_timestamp, first.current_view_timestamp);
        assert_eq!(second.round_in_epoch, 2);
    }

    #[test]
    fn test_normalized_round_timestamp_is_clamped() {
        let genesis = pre_genesis_summary();
        let at = |ms: i64| Utc.timestamp_millis_opt(ms).unwrap();
        let round = |parent: &TransactionSummary, round: u64, timestamp: i64| {
            transaction_on(
                parent,
                vec![data_operation(
                    DataActionKind::Create,
                    DataObject::RoundData { round, timestamp },
                )],
            )
        };

        let first = generate_summary_at(&genesis, &round(&genesis, 1, 5_000), at(10_000)).unwrap();
        assert_eq!(first.normalized_round_timestamp, at(5_000));
        assert_eq!(first.created_timestamp, at(10_000));

        // A round stamped in the future is held at the creation time
        let ahead = generate_summary_at(&first, &round(&first, 2, 50_000), at(20_000)).unwrap();
        assert_eq!(ahead.current_view_timestamp, at(50_000));
        assert_eq!(ahead.normalized_round_timestamp, at(20_000));

        // A round stamped before the last normalized timestamp never moves it back
        let behind = generate_summary_at(&ahead, &round(&ahead, 3, 15_000), at(30_000)).unwrap();
        assert_eq!(behind.current_view_timestamp, at(15_000));
        assert_eq!(behind.normalized_round_timestamp, at(20_000));
    }

    #[test]
    fn test_state_version_gap_is_invalid_commit() {
        let genesis = pre_genesis_summary();
        let mut tx = transaction_on(&genesis, vec![]);
        tx.committed_state_identifier.state_version = 2;
        let summary = generate_summary(&genesis, &tx).unwrap();

        let err = assert_child_consistent(&genesis, &summary).unwrap_err();
        assert!(matches!(err, Error::InvalidLedgerCommit(_)));
    }

    #[test]
    fn test_bad_accumulator_reports_expected_and_actual() {
        let genesis = pre_genesis_summary();
        let mut tx = transaction_on(&genesis, vec![]);
        let expected = hex::encode(&tx.committed_state_identifier.transaction_accumulator);
        tx.committed_state_identifier.transaction_accumulator = vec![0xee; 32];
        let summary = generate_summary(&genesis, &tx).unwrap();

        let err = assert_child_consistent(&genesis, &summary).unwrap_err();
        let message = match err {
            Error::InconsistentLedger(message) => message,
            other => panic!("expected inconsistent ledger, got {:?}", other),
        };
        assert!(message.contains(&expected));
        assert!(message.contains(&hex::encode([0xee; 32])));
    }

    #[test]
    fn test_parent_must_match_top_of_ledger() {
        let genesis = pre_genesis_summary();
        let summary = generate_summary(&genesis, &transaction_on(&genesis, vec![])).unwrap();

        assert_parent_matches_top_of_ledger(&summary, &summary).unwrap();
        assert!(matches!(
            assert_parent_matches_top_of_ledger(&summary, &genesis),
            Err(Error::InvalidLedgerCommit(_))
        ));

        let mut forked = summary.clone();
        forked.transaction_accumulator = vec![1u8; 32];
        assert!(matches!(
            assert_parent_matches_top_of_ledger(&forked, &summary),
            Err(Error::InconsistentLedger(_))
        ));
    }
}
