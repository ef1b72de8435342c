//! Transaction content processing
//!
//! Walks each committed transaction of a batch and turns its operations into
//! planned substate ups/downs, operation group rows and history entries,
//! plus the accounts each transaction references and validator proposal
//! counters.
//! Nothing is applied here; see [`crate::planner`].

use crate::{
    accounting::{Accounting, InferredActionType},
    entity::{Entity, EntityResolver, NativeToken, ResourceIdentifier},
    error::{Error, Result},
    history::{
        AccountValidatorStakeChange, AccountValidatorStakeSnapshot, HistoryKey, HistoryValue, ResourceSupply,
        ResourceSupplyChange, ValidatorStakeChange, ValidatorStakeSnapshot,
    },
    planner::ActionsPlanner,
    substate::{StakeOwnershipType, Substate, XrdStakeType},
    summary::TransactionSummary,
    types::{
        CommittedTransaction, DataAction, DataActionKind, DataObject, LedgerOperationGroup, LedgerTransaction,
        Operation, OperationRef, ResourceAmount, SubstateOperation, TokenAmount, TransactionOpLocator,
        ValidatorProposalRecord,
    },
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Net changes of one transaction, flushed into history once all its operations are seen
#[derive(Debug, Default)]
struct TransactionChanges {
    account_balances: BTreeMap<(String, String), TokenAmount>,
    native_supply: TokenAmount,
    resource_supply: BTreeMap<String, ResourceSupplyChange>,
    validator_stakes: BTreeMap<String, ValidatorStakeChange>,
    account_validator_stakes: BTreeMap<(String, String), AccountValidatorStakeChange>,
    referenced_accounts: BTreeSet<String>,
}

impl TransactionChanges {
    fn account_validator_stake(
        &mut self,
        account_address: &str,
        validator_address: &str,
    ) -> &mut AccountValidatorStakeChange {
        self.account_validator_stakes
            .entry((account_address.to_string(), validator_address.to_string()))
            .or_default()
    }
}

/// Per operation group state
#[derive(Debug)]
struct GroupScope {
    accounting: Accounting,
    supply: BTreeMap<String, TokenAmount>,
}

/// Where an operation sits and what it acts on
#[derive(Debug)]
struct OperationContext<'a> {
    locator: TransactionOpLocator,
    operation_ref: OperationRef,
    entity: Entity,
    epoch: u64,
    operation: &'a Operation,
}

fn add_to(total: &mut TokenAmount, delta: TokenAmount, locator: &TransactionOpLocator) -> Result<()> {
    *total = total
        .checked_add(delta)
        .ok_or_else(|| Error::invalid_transaction(locator.clone(), "Amount overflowed"))?;
    Ok(())
}

/// Schedules the derived model changes of committed transactions
pub struct TransactionContentProcessor {
    resolver: Arc<dyn EntityResolver>,
    native_token: Arc<NativeToken>,
}

impl std::fmt::Debug for TransactionContentProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContentProcessor")
            .field("native_token", &self.native_token)
            .finish()
    }
}

impl TransactionContentProcessor {
    /// Create a processor
    pub fn new(resolver: Arc<dyn EntityResolver>, native_token: Arc<NativeToken>) -> Self {
        Self { resolver, native_token }
    }

    /// Schedule everything `transaction` changes.
    ///
    /// `summary` must already have been checked against its parent.
    pub fn process_transaction(
        &self,
        planner: &mut ActionsPlanner,
        transaction: &CommittedTransaction,
        summary: &TransactionSummary,
    ) -> Result<()> {
        let state_version = transaction.state_version();
        let hash = transaction.hash_hex();
        let transaction_locator = TransactionOpLocator::transaction(state_version, hash.clone());

        let ledger_transaction = ledger_transaction(transaction, summary, &transaction_locator)?;
        let is_system_transaction = ledger_transaction.is_system_transaction();
        let signer_account_address = ledger_transaction
            .signed_by
            .as_deref()
            .map(|public_key| {
                self.resolver.signer_account_address(public_key).ok_or_else(|| {
                    Error::invalid_transaction(
                        transaction_locator.clone(),
                        format!("Signer {} is not a compressed public key", hex::encode(public_key)),
                    )
                })
            })
            .transpose()?;
        planner.add_transaction(ledger_transaction);

        let mut changes = TransactionChanges::default();

        for (group_index, group) in transaction.operation_groups.iter().enumerate() {
            // Proposal counters are read before housekeeping-only groups are skipped
            for (operation_index, operation) in group.operations.iter().enumerate() {
                let locator = TransactionOpLocator::operation(state_version, hash.clone(), group_index, operation_index);
                self.process_validator_bft_data(planner, summary, &locator, operation)?;
            }

            if !group.has_substantive_operations() {
                continue;
            }

            let group_locator = TransactionOpLocator::group(state_version, hash.clone(), group_index);
            let mut scope = GroupScope {
                accounting: Accounting::new(Arc::clone(&self.native_token)),
                supply: BTreeMap::new(),
            };

            for (operation_index, operation) in group.operations.iter().enumerate() {
                if operation.is_round_or_bft_housekeeping() {
                    continue;
                }

                let locator = TransactionOpLocator::operation(state_version, hash.clone(), group_index, operation_index);
                let entity = self.resolver.resolve(&operation.entity_identifier).ok_or_else(|| {
                    Error::invalid_transaction(
                        locator.clone(),
                        format!(
                            "Entity identifier {} could not be resolved",
                            operation.entity_identifier.address
                        ),
                    )
                })?;
                let context = OperationContext {
                    locator,
                    operation_ref: OperationRef {
                        state_version,
                        operation_group_index: group_index,
                        operation_index_in_group: operation_index,
                    },
                    entity,
                    epoch: summary.epoch,
                    operation,
                };

                if let Some(amount) = &operation.amount {
                    self.process_amount(planner, &mut scope, &mut changes, &context, amount)?;
                }
                if let Some(data) = &operation.data {
                    process_data(&mut scope.accounting, &context, data)?;
                }
            }

            for (rri, net) in scope.supply {
                if net.is_zero() {
                    continue;
                }
                changes
                    .resource_supply
                    .entry(rri)
                    .or_default()
                    .aggregate(net)
                    .ok_or_else(|| Error::invalid_transaction(group_locator.clone(), "Supply change overflowed"))?;
            }

            schedule_operation_group(
                planner,
                scope.accounting,
                is_system_transaction,
                group_locator,
                state_version,
                group_index,
            );
        }

        let referenced_accounts = std::mem::take(&mut changes.referenced_accounts);
        self.flush_history(planner, &transaction_locator, changes)?;

        let mut account_addresses = referenced_accounts;
        account_addresses.extend(signer_account_address.iter().cloned());
        planner.add_account_transactions(transaction_locator, account_addresses, signer_account_address);
        Ok(())
    }

    fn process_validator_bft_data(
        &self,
        planner: &mut ActionsPlanner,
        summary: &TransactionSummary,
        locator: &TransactionOpLocator,
        operation: &Operation,
    ) -> Result<()> {
        let Some(DataAction {
            action: DataActionKind::Create,
            data_object:
                DataObject::ValidatorBftData {
                    proposals_completed,
                    proposals_missed,
                },
        }) = &operation.data
        else {
            return Ok(());
        };

        let validator_address = match self.resolver.resolve(&operation.entity_identifier) {
            Some(Entity::ValidatorSystem { validator_address }) => validator_address,
            Some(entity) => {
                return Err(Error::invalid_transaction(
                    locator.clone(),
                    format!(
                        "Validator BFT data was against {:?} entity {}, but a validator system entity was expected",
                        entity.entity_type(),
                        entity
                    ),
                ));
            }
            None => {
                return Err(Error::invalid_transaction(
                    locator.clone(),
                    format!(
                        "Entity identifier {} could not be resolved",
                        operation.entity_identifier.address
                    ),
                ));
            }
        };

        planner.upsert_validator_proposal_record(ValidatorProposalRecord {
            validator_address,
            epoch: summary.epoch,
            proposals_completed: *proposals_completed,
            proposals_missed: *proposals_missed,
            last_updated_state_version: summary.state_version,
        });
        Ok(())
    }

    fn process_amount(
        &self,
        planner: &mut ActionsPlanner,
        scope: &mut GroupScope,
        changes: &mut TransactionChanges,
        context: &OperationContext<'_>,
        amount: &ResourceAmount,
    ) -> Result<()> {
        let locator = &context.locator;
        let fail = |message: String| Error::invalid_transaction(locator.clone(), message);

        let delta = TokenAmount::from_sub_units_str(&amount.value)
            .ok_or_else(|| fail(format!("Amount {:?} is not a whole number of sub-units", amount.value)))?;
        let substate_ref = context
            .operation
            .substate
            .as_ref()
            .ok_or_else(|| fail("Operation carries an amount but no substate".to_string()))?;

        match substate_ref.operation {
            SubstateOperation::Bootup if delta.is_negative() => {
                return Err(fail(format!("Substate booted up with negative amount {}", delta)));
            }
            SubstateOperation::Shutdown if delta.is_positive() => {
                return Err(fail(format!("Substate shut down with positive amount {}", delta)));
            }
            _ => {}
        }

        let resource = &amount.resource_identifier;
        scope.accounting.track_delta(locator, &context.entity, resource, delta)?;

        // Stake sub-entities count as references to their account
        if let Some(account_address) = context.entity.account_address() {
            changes.referenced_accounts.insert(account_address.to_string());
        }

        let substate = match (resource, &context.entity) {
            (ResourceIdentifier::Token { rri }, Entity::Account { account_address }) => {
                let balance = changes
                    .account_balances
                    .entry((account_address.clone(), rri.clone()))
                    .or_default();
                add_to(balance, delta, locator)?;
                Substate::AccountResourceBalance {
                    account_address: account_address.clone(),
                    rri: rri.clone(),
                    amount: delta,
                }
            }
            (
                ResourceIdentifier::Token { rri },
                Entity::AccountPreparedStake {
                    account_address,
                    validator_address,
                },
            ) => {
                self.require_native(rri, locator)?;
                let stake = changes.validator_stakes.entry(validator_address.clone()).or_default();
                add_to(&mut stake.prepared_xrd_stake, delta, locator)?;
                let account_stake = changes.account_validator_stake(account_address, validator_address);
                add_to(&mut account_stake.prepared_xrd_stake, delta, locator)?;
                Substate::AccountXrdStakeBalance {
                    account_address: account_address.clone(),
                    validator_address: validator_address.clone(),
                    stake_type: XrdStakeType::PreparedStake,
                    epoch_unlock: None,
                    amount: delta,
                }
            }
            (
                ResourceIdentifier::Token { rri },
                Entity::AccountExitingStake {
                    account_address,
                    validator_address,
                    epoch_unlock,
                },
            ) => {
                self.require_native(rri, locator)?;
                let stake = changes.validator_stakes.entry(validator_address.clone()).or_default();
                add_to(&mut stake.exiting_xrd_stake, delta, locator)?;
                let account_stake = changes.account_validator_stake(account_address, validator_address);
                add_to(&mut account_stake.exiting_xrd_stake, delta, locator)?;
                Substate::AccountXrdStakeBalance {
                    account_address: account_address.clone(),
                    validator_address: validator_address.clone(),
                    stake_type: XrdStakeType::ExitingStake,
                    epoch_unlock: Some(*epoch_unlock),
                    amount: delta,
                }
            }
            (ResourceIdentifier::Token { rri }, Entity::ValidatorSystem { validator_address }) => {
                self.require_native(rri, locator)?;
                let stake = changes.validator_stakes.entry(validator_address.clone()).or_default();
                add_to(&mut stake.xrd_stake, delta, locator)?;
                Substate::ValidatorStakeBalance {
                    validator_address: validator_address.clone(),
                    epoch: context.epoch,
                    amount: delta,
                }
            }
            (ResourceIdentifier::StakeOwnership { validator_address }, Entity::Account { account_address }) => {
                let stake = changes.validator_stakes.entry(validator_address.clone()).or_default();
                add_to(&mut stake.stake_units, delta, locator)?;
                let account_stake = changes.account_validator_stake(account_address, validator_address);
                add_to(&mut account_stake.stake_units, delta, locator)?;
                Substate::AccountStakeOwnershipBalance {
                    account_address: account_address.clone(),
                    validator_address: validator_address.clone(),
                    ownership_type: StakeOwnershipType::Staked,
                    amount: delta,
                }
            }
            (
                ResourceIdentifier::StakeOwnership { validator_address },
                Entity::AccountPreparedUnstake { account_address },
            ) => {
                let stake = changes.validator_stakes.entry(validator_address.clone()).or_default();
                add_to(&mut stake.prepared_unstake_units, delta, locator)?;
                let account_stake = changes.account_validator_stake(account_address, validator_address);
                add_to(&mut account_stake.prepared_unstake_units, delta, locator)?;
                // Inferring the unstake needs the validator's exchange rate
                planner.mark_history_to_load(HistoryKey::ValidatorStake {
                    validator_address: validator_address.clone(),
                });
                Substate::AccountStakeOwnershipBalance {
                    account_address: account_address.clone(),
                    validator_address: validator_address.clone(),
                    ownership_type: StakeOwnershipType::PreparingUnstake,
                    amount: delta,
                }
            }
            (resource, entity) => {
                return Err(fail(format!(
                    "Unsupported entity/resource combination: {} against {:?} entity {}",
                    resource,
                    entity.entity_type(),
                    entity
                )));
            }
        };

        if let ResourceIdentifier::Token { rri } = resource {
            if self.native_token.is_native_rri(rri) {
                add_to(&mut changes.native_supply, delta, locator)?;
            } else {
                add_to(scope.supply.entry(rri.clone()).or_default(), delta, locator)?;
            }
        }

        let identifier = substate_ref.identifier.clone();
        match substate_ref.operation {
            SubstateOperation::Bootup => {
                planner.up_substate(locator.clone(), context.operation_ref, identifier, substate);
            }
            SubstateOperation::Shutdown => {
                let kind = substate.kind();
                let virtual_substate = substate.with_amount(-delta);
                planner.down_substate(
                    locator.clone(),
                    context.operation_ref,
                    kind,
                    identifier,
                    move || virtual_substate,
                    move |existing| existing.matches_down(&substate),
                );
            }
        }

        Ok(())
    }

    fn require_native(&self, rri: &str, locator: &TransactionOpLocator) -> Result<()> {
        if self.native_token.is_native_rri(rri) {
            return Ok(());
        }
        Err(Error::invalid_transaction(
            locator.clone(),
            format!("Stake must be in the native token {}, not {}", self.native_token.rri(), rri),
        ))
    }

    fn flush_history(
        &self,
        planner: &mut ActionsPlanner,
        locator: &TransactionOpLocator,
        mut changes: TransactionChanges,
    ) -> Result<()> {
        let state_version = locator.state_version;

        for ((account_address, rri), delta) in changes.account_balances {
            if delta.is_zero() {
                continue;
            }
            let error_locator = locator.clone();
            let key = HistoryKey::AccountResource {
                account_address: account_address.clone(),
                rri: rri.clone(),
            };
            planner.add_history_entry(locator.clone(), key, state_version, move |previous| {
                let balance = match previous {
                    Some(HistoryValue::AccountBalance(balance)) => *balance,
                    _ => TokenAmount::ZERO,
                };
                let next = balance
                    .checked_add(delta)
                    .ok_or_else(|| Error::invalid_transaction(error_locator.clone(), "Balance overflowed"))?;
                if next.is_negative() {
                    return Err(Error::invalid_transaction(
                        error_locator,
                        format!(
                            "Balance of {} in account {} would become {}, spending funds that do not exist",
                            rri, account_address, next
                        ),
                    ));
                }
                Ok(HistoryValue::AccountBalance(next))
            });
        }

        // The native token nets over the whole transaction, so a fee burn and refund cancel out
        if !changes.native_supply.is_zero() {
            changes.resource_supply.insert(
                self.native_token.rri().to_string(),
                ResourceSupplyChange::from_net(changes.native_supply),
            );
        }

        for (rri, change) in changes.resource_supply {
            if change.is_zero() {
                continue;
            }
            let error_locator = locator.clone();
            let key = HistoryKey::ResourceSupply { rri: rri.clone() };
            planner.add_history_entry(locator.clone(), key, state_version, move |previous| {
                let supply = match previous {
                    Some(HistoryValue::ResourceSupply(supply)) => *supply,
                    _ => ResourceSupply::default(),
                };
                let next = supply
                    .apply(&change)
                    .ok_or_else(|| Error::invalid_transaction(error_locator.clone(), "Supply overflowed"))?;
                if next.total_supply.is_negative() {
                    return Err(Error::invalid_transaction(
                        error_locator,
                        format!("Total supply of {} would become {}", rri, next.total_supply),
                    ));
                }
                Ok(HistoryValue::ResourceSupply(next))
            });
        }

        for (validator_address, change) in changes.validator_stakes {
            if !change.is_meaningful() {
                continue;
            }
            let error_locator = locator.clone();
            let key = HistoryKey::ValidatorStake {
                validator_address: validator_address.clone(),
            };
            planner.add_history_entry(locator.clone(), key, state_version, move |previous| {
                let snapshot = match previous {
                    Some(HistoryValue::ValidatorStake(snapshot)) => *snapshot,
                    _ => ValidatorStakeSnapshot::default(),
                };
                let next = snapshot
                    .apply(&change)
                    .ok_or_else(|| Error::invalid_transaction(error_locator.clone(), "Validator stake overflowed"))?;
                if let Some(component) = next.first_negative_component() {
                    return Err(Error::invalid_transaction(
                        error_locator,
                        format!("Validator {} would have a negative {}", validator_address, component),
                    ));
                }
                Ok(HistoryValue::ValidatorStake(next))
            });
        }

        for ((account_address, validator_address), change) in changes.account_validator_stakes {
            if !change.is_meaningful() {
                continue;
            }
            let error_locator = locator.clone();
            let key = HistoryKey::AccountValidatorStake {
                account_address: account_address.clone(),
                validator_address: validator_address.clone(),
            };
            planner.add_history_entry(locator.clone(), key, state_version, move |previous| {
                let snapshot = match previous {
                    Some(HistoryValue::AccountValidatorStake(snapshot)) => *snapshot,
                    _ => AccountValidatorStakeSnapshot::default(),
                };
                let next = snapshot.apply(&change).ok_or_else(|| {
                    Error::invalid_transaction(error_locator.clone(), "Account validator stake overflowed")
                })?;
                if let Some(component) = next.first_negative_component() {
                    return Err(Error::invalid_transaction(
                        error_locator,
                        format!(
                            "Account {} would have a negative {} with validator {}",
                            account_address, component, validator_address
                        ),
                    ));
                }
                Ok(HistoryValue::AccountValidatorStake(next))
            });
        }

        Ok(())
    }
}

/// Data actions are metadata; only token definitions feed into the derived model
fn process_data(accounting: &mut Accounting, context: &OperationContext<'_>, data: &DataAction) -> Result<()> {
    match (data.action, &data.data_object) {
        (DataActionKind::Create, DataObject::TokenData { .. }) => match &context.entity {
            Entity::Resource { rri } => {
                accounting.track_token_creation(rri.clone());
                Ok(())
            }
            entity => Err(Error::invalid_transaction(
                context.locator.clone(),
                format!("Token data created against non-resource entity {}", entity),
            )),
        },
        _ => Ok(()),
    }
}

fn schedule_operation_group(
    planner: &mut ActionsPlanner,
    accounting: Accounting,
    is_system_transaction: bool,
    locator: TransactionOpLocator,
    state_version: u64,
    operation_group_index: usize,
) {
    planner.add_action(move |working_set| {
        let inferred_action = accounting.infer_action(is_system_transaction, &locator, &*working_set)?;

        if let Some(action) = inferred_action.as_ref().filter(|a| a.action_type == InferredActionType::PayXrd) {
            let transaction = working_set.transaction_mut(state_version).ok_or_else(|| {
                Error::invalid_transaction(locator.clone(), "Operation group has no transaction row")
            })?;
            if transaction.fee_payer.is_some() {
                return Err(Error::invalid_transaction(
                    locator,
                    "Transaction has more than one fee payment",
                ));
            }
            transaction.fee_payer = action.from_address.clone();
        }

        working_set.add_operation_group(LedgerOperationGroup {
            state_version,
            operation_group_index,
            inferred_action,
        });
        Ok(())
    });
}

fn ledger_transaction(
    transaction: &CommittedTransaction,
    summary: &TransactionSummary,
    locator: &TransactionOpLocator,
) -> Result<LedgerTransaction> {
    let metadata = &transaction.metadata;
    let decode = |field: &str, value: &str| {
        hex::decode(value).map_err(|e| {
            Error::invalid_transaction(locator.clone(), format!("Transaction {} is not valid hex: {}", field, e))
        })
    };

    let fee_paid = TokenAmount::from_sub_units_str(&metadata.fee).ok_or_else(|| {
        Error::invalid_transaction(locator.clone(), format!("Fee {:?} is not a whole number of sub-units", metadata.fee))
    })?;

    Ok(LedgerTransaction {
        state_version: summary.state_version,
        transaction_identifier_hash: summary.transaction_identifier_hash.clone(),
        transaction_accumulator: summary.transaction_accumulator.clone(),
        epoch: summary.epoch,
        index_in_epoch: summary.index_in_epoch,
        round_in_epoch: summary.round_in_epoch,
        is_end_of_epoch: summary.is_end_of_epoch,
        fee_paid,
        signed_by: metadata.signed_by.as_deref().map(|v| decode("signer", v)).transpose()?,
        message: metadata.message.as_deref().map(|v| decode("message", v)).transpose()?,
        payload: decode("payload", &metadata.hex)?,
        fee_payer: None,
        round_timestamp_ms: summary.current_view_timestamp.timestamp_millis(),
        normalized_round_timestamp_ms: summary.normalized_round_timestamp.timestamp_millis(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::InferredAction;
    use crate::entity::{
        account_address_from_public_key, AddressEntityResolver, EntityIdentifier, SubEntityMetadata,
        SUB_ENTITY_PREPARED_STAKES,
    };
    use crate::history::HistoryEntry;
    use crate::planner::{DependencyLoader, WorkingSet};
    use crate::substate::{PrefixVirtualSubstatePolicy, SubstateKind, SubstateRecord};
    use crate::summary::{generate_summary, pre_genesis_summary};
    use crate::types::{AccountTransaction, OperationGroup, StateIdentifier, SubstateRef, TransactionMetadata};
    use primitive_types::U256;
    use tokio_util::sync::CancellationToken;

    const XRD: &str = "xrd_rr1qy5";
    const FOO: &str = "foo_rr1x";
    const SIGNER_KEY: &str = "02abababababababababababababababababababababababababababababababab";

    struct EmptyLoader;

    impl DependencyLoader for EmptyLoader {
        fn load_substates(&self, _kind: SubstateKind, _identifiers: &[Vec<u8>]) -> Result<Vec<SubstateRecord>> {
            Ok(Vec::new())
        }

        fn load_open_history(&self, _keys: &[HistoryKey]) -> Result<Vec<HistoryEntry>> {
            Ok(Vec::new())
        }
    }

    fn amount_op(
        entity_identifier: EntityIdentifier,
        identifier: u8,
        operation: SubstateOperation,
        value: impl ToString,
        resource_identifier: ResourceIdentifier,
    ) -> Operation {
        Operation {
            entity_identifier,
            substate: Some(SubstateRef {
                identifier: vec![identifier],
                operation,
            }),
            amount: Some(ResourceAmount {
                value: value.to_string(),
                resource_identifier,
            }),
            data: None,
        }
    }

    fn up(account: &str, identifier: u8, value: i64, rri: &str) -> Operation {
        amount_op(
            EntityIdentifier::new(account),
            identifier,
            SubstateOperation::Bootup,
            value,
            ResourceIdentifier::token(rri),
        )
    }

    fn down(account: &str, identifier: u8, value: i64, rri: &str) -> Operation {
        amount_op(
            EntityIdentifier::new(account),
            identifier,
            SubstateOperation::Shutdown,
            -value,
            ResourceIdentifier::token(rri),
        )
    }

    fn transaction(state_version: u64, fee: i64, groups: Vec<Vec<Operation>>) -> CommittedTransaction {
        CommittedTransaction {
            transaction_identifier_hash: vec![state_version as u8; 32],
            committed_state_identifier: StateIdentifier {
                state_version,
                transaction_accumulator: vec![0; 32],
            },
            operation_groups: groups
                .into_iter()
                .map(|operations| OperationGroup { operations })
                .collect(),
            metadata: TransactionMetadata {
                fee: fee.to_string(),
                signed_by: Some(SIGNER_KEY.into()),
                message: None,
                hex: "0a0b".into(),
                timestamp: 0,
            },
        }
    }

    fn process_with(policy: PrefixVirtualSubstatePolicy, transactions: &[CommittedTransaction]) -> Result<WorkingSet> {
        let processor = TransactionContentProcessor::new(
            Arc::new(AddressEntityResolver::new("rdx", "rv", "_rr")),
            Arc::new(NativeToken::new(XRD)),
        );
        let mut planner = ActionsPlanner::new(Arc::new(policy));
        let mut parent = pre_genesis_summary();
        for transaction in transactions {
            let summary = generate_summary(&parent, transaction)?;
            processor.process_transaction(&mut planner, transaction, &summary)?;
            parent = summary;
        }
        planner
            .process_all_changes(&EmptyLoader, &CancellationToken::new())
            .map(|(working_set, _)| working_set)
    }

    fn process(transactions: &[CommittedTransaction]) -> Result<WorkingSet> {
        process_with(PrefixVirtualSubstatePolicy::default(), transactions)
    }

    fn balance(working_set: &WorkingSet, account: &str, rri: &str) -> Option<TokenAmount> {
        let key = HistoryKey::AccountResource {
            account_address: account.into(),
            rri: rri.into(),
        };
        match working_set.open_history_entry(&key).map(|e| &e.value) {
            Some(HistoryValue::AccountBalance(balance)) => Some(*balance),
            _ => None,
        }
    }

    fn actions(working_set: &WorkingSet) -> Vec<Option<InferredActionType>> {
        working_set
            .operation_groups()
            .iter()
            .map(|g| g.inferred_action.as_ref().map(|a| a.action_type))
            .collect()
    }

    fn amount(value: i64) -> TokenAmount {
        TokenAmount::from_sub_units(value)
    }

    fn signer_account() -> String {
        account_address_from_public_key("rdx", &hex::decode(SIGNER_KEY).unwrap()).unwrap()
    }

    fn account_transactions(working_set: &WorkingSet, state_version: u64) -> Vec<&AccountTransaction> {
        working_set
            .account_transactions()
            .iter()
            .filter(|row| row.state_version == state_version)
            .collect()
    }

    fn data_op(entity_identifier: EntityIdentifier, data_object: DataObject) -> Operation {
        Operation {
            entity_identifier,
            substate: None,
            amount: None,
            data: Some(DataAction {
                action: DataActionKind::Create,
                data_object,
            }),
        }
    }

    fn prepared_stake(account: &str, validator: &str) -> EntityIdentifier {
        EntityIdentifier::with_sub_entity(
            account,
            SUB_ENTITY_PREPARED_STAKES,
            Some(SubEntityMetadata {
                validator_address: Some(validator.into()),
                epoch_unlock: None,
            }),
        )
    }

    fn validator_system(validator: &str) -> EntityIdentifier {
        EntityIdentifier::with_sub_entity(validator, "system", None)
    }

    #[test]
    fn test_mint_fee_and_transfer() {
        let working_set = process(&[
            transaction(1, 0, vec![vec![up("rdx1a", 1, 1000, XRD)]]),
            transaction(
                2,
                10,
                vec![
                    vec![down("rdx1a", 1, 1000, XRD), up("rdx1a", 2, 990, XRD)],
                    vec![down("rdx1a", 2, 990, XRD), up("rdx1b", 3, 500, XRD), up("rdx1a", 4, 490, XRD)],
                ],
            ),
        ])
        .unwrap();

        assert_eq!(
            actions(&working_set),
            vec![
                Some(InferredActionType::MintXrd),
                Some(InferredActionType::PayXrd),
                Some(InferredActionType::SimpleTransfer)
            ]
        );
        assert_eq!(balance(&working_set, "rdx1a", XRD), Some(amount(490)));
        assert_eq!(balance(&working_set, "rdx1b", XRD), Some(amount(500)));

        let rows: Vec<_> = working_set.transactions().collect();
        assert_eq!(rows[0].fee_payer, None);
        assert_eq!(rows[1].fee_payer.as_deref(), Some("rdx1a"));
        assert_eq!(rows[1].fee_paid, amount(10));
        assert_eq!(rows[1].signed_by, Some(hex::decode(SIGNER_KEY).unwrap()));
        assert_eq!(rows[1].payload, vec![0x0a, 0x0b]);

        let supply = working_set
            .open_history_entry(&HistoryKey::ResourceSupply { rri: XRD.into() })
            .unwrap();
        assert_eq!(
            supply.value,
            HistoryValue::ResourceSupply(ResourceSupply {
                total_supply: amount(990),
                total_minted: amount(1000),
                total_burned: amount(10),
            })
        );
        assert_eq!(supply.from_state_version, 2);

        let transfer = &working_set.operation_groups()[2];
        assert_eq!(
            transfer.inferred_action,
            Some(InferredAction {
                action_type: InferredActionType::SimpleTransfer,
                from_address: Some("rdx1a".into()),
                to_address: Some("rdx1b".into()),
                amount: amount(500),
                resource: Some(ResourceIdentifier::token(XRD)),
            })
        );
    }

    #[test]
    fn test_negative_balance_is_fatal() {
        let err = process_with(
            PrefixVirtualSubstatePolicy::new(vec![vec![0xff]]),
            &[transaction(1, 0, vec![vec![down("rdx1a", 0xff, 100, XRD), up("rdx1b", 2, 100, XRD)]])],
        )
        .unwrap_err();
        assert!(err.is_fatal_ledger_error());
        assert!(err.to_string().contains("do not exist"));
    }

    #[test]
    fn test_unresolvable_entity_is_fatal() {
        let err = process(&[transaction(1, 0, vec![vec![up("nobody", 1, 1, XRD)]])]).unwrap_err();
        assert!(err.to_string().contains("could not be resolved"));
        assert!(err.to_string().contains("operation group 0, operation 0"));
    }

    #[test]
    fn test_unsupported_combination_is_fatal() {
        let err = process(&[transaction(1, 0, vec![vec![up("system", 1, 1, XRD)]])]).unwrap_err();
        assert!(err.to_string().contains("Unsupported entity/resource combination"));
    }

    #[test]
    fn test_unparsable_amount_is_fatal() {
        let mut operation = up("rdx1a", 1, 1, XRD);
        if let Some(amount) = operation.amount.as_mut() {
            amount.value = "1.5".into();
        }
        let err = process(&[transaction(1, 0, vec![vec![operation]])]).unwrap_err();
        assert!(err.to_string().contains("whole number"));
    }

    #[test]
    fn test_stake_updates_validator_history() {
        let prepared = EntityIdentifier::with_sub_entity(
            "rdx1a",
            SUB_ENTITY_PREPARED_STAKES,
            Some(SubEntityMetadata {
                validator_address: Some("rv1v".into()),
                epoch_unlock: None,
            }),
        );
        let working_set = process(&[
            transaction(1, 0, vec![vec![up("rdx1a", 1, 100, XRD)]]),
            transaction(
                2,
                0,
                vec![vec![
                    down("rdx1a", 1, 100, XRD),
                    amount_op(prepared, 2, SubstateOperation::Bootup, 100, ResourceIdentifier::token(XRD)),
                ]],
            ),
        ])
        .unwrap();

        assert_eq!(actions(&working_set)[1], Some(InferredActionType::StakeTokens));
        assert_eq!(balance(&working_set, "rdx1a", XRD), Some(TokenAmount::ZERO));
        let stake = working_set
            .open_history_entry(&HistoryKey::ValidatorStake {
                validator_address: "rv1v".into(),
            })
            .unwrap();
        match &stake.value {
            HistoryValue::ValidatorStake(snapshot) => assert_eq!(snapshot.total_prepared_xrd_stake, amount(100)),
            other => panic!("unexpected history value {:?}", other),
        }
        let record = working_set.substate(SubstateKind::AccountXrdStakeBalance, &[2]).unwrap();
        assert!(record.down.is_none());
    }

    #[test]
    fn test_stake_of_non_native_token_is_fatal() {
        let prepared = EntityIdentifier::with_sub_entity(
            "rdx1a",
            SUB_ENTITY_PREPARED_STAKES,
            Some(SubEntityMetadata {
                validator_address: Some("rv1v".into()),
                epoch_unlock: None,
            }),
        );
        let err = process(&[transaction(
            1,
            0,
            vec![vec![amount_op(prepared, 2, SubstateOperation::Bootup, 100, ResourceIdentifier::token(FOO))]],
        )])
        .unwrap_err();
        assert!(err.to_string().contains("native token"));
    }

    #[test]
    fn test_two_fee_payments_are_fatal() {
        let err = process(&[
            transaction(1, 0, vec![vec![up("rdx1a", 1, 100, XRD)]]),
            transaction(
                2,
                2,
                vec![
                    vec![down("rdx1a", 1, 100, XRD), up("rdx1a", 2, 99, XRD)],
                    vec![down("rdx1a", 2, 99, XRD), up("rdx1a", 3, 98, XRD)],
                ],
            ),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("more than one fee payment"));
    }

    #[test]
    fn test_token_creation() {
        let token_data = Operation {
            entity_identifier: EntityIdentifier::new(FOO),
            substate: None,
            amount: None,
            data: Some(DataAction {
                action: DataActionKind::Create,
                data_object: DataObject::TokenData {
                    granularity: "1".into(),
                    is_mutable: false,
                    owner: None,
                },
            }),
        };
        let working_set = process(&[transaction(1, 0, vec![vec![token_data, up("rdx1a", 1, 1000, FOO)]])]).unwrap();

        let action = working_set.operation_groups()[0].inferred_action.clone().unwrap();
        assert_eq!(action.action_type, InferredActionType::CreateTokenDefinition);
        assert_eq!(action.resource, Some(ResourceIdentifier::token(FOO)));
        assert_eq!(balance(&working_set, "rdx1a", FOO), Some(amount(1000)));
        assert!(working_set
            .open_history_entry(&HistoryKey::ResourceSupply { rri: FOO.into() })
            .is_some());
    }

    #[test]
    fn test_housekeeping_groups_have_no_rows() {
        let round = Operation {
            entity_identifier: EntityIdentifier::new("system"),
            substate: None,
            amount: None,
            data: Some(DataAction {
                action: DataActionKind::Create,
                data_object: DataObject::RoundData {
                    round: 4,
                    timestamp: 1_000,
                },
            }),
        };
        let working_set = process(&[transaction(1, 0, vec![vec![round]])]).unwrap();

        assert!(working_set.operation_groups().is_empty());
        let row = working_set.transactions().next().unwrap();
        assert_eq!(row.round_in_epoch, 4);
        assert_eq!(row.round_timestamp_ms, 1_000);
        assert_eq!(row.normalized_round_timestamp_ms, 1_000);
    }

    #[test]
    fn test_uint256_max_balance_is_transferred() {
        let max = U256::MAX.to_string();
        let working_set = process(&[
            transaction(
                1,
                0,
                vec![vec![amount_op(
                    EntityIdentifier::new("rdx1a"),
                    2,
                    SubstateOperation::Bootup,
                    &max,
                    ResourceIdentifier::token(XRD),
                )]],
            ),
            transaction(
                2,
                0,
                vec![vec![
                    amount_op(
                        EntityIdentifier::new("rdx1a"),
                        2,
                        SubstateOperation::Shutdown,
                        format!("-{}", max),
                        ResourceIdentifier::token(XRD),
                    ),
                    amount_op(
                        EntityIdentifier::new("rdx1b"),
                        3,
                        SubstateOperation::Bootup,
                        &max,
                        ResourceIdentifier::token(XRD),
                    ),
                ]],
            ),
        ])
        .unwrap();

        let max_amount = TokenAmount::from_sub_units_str(&max).unwrap();
        assert_eq!(balance(&working_set, "rdx1a", XRD), Some(TokenAmount::ZERO));
        assert_eq!(balance(&working_set, "rdx1b", XRD), Some(max_amount));

        let history: Vec<_> = working_set
            .touched_history()
            .filter(|entry| {
                entry.key
                    == HistoryKey::AccountResource {
                        account_address: "rdx1a".into(),
                        rri: XRD.into(),
                    }
            })
            .map(|entry| (entry.from_state_version, entry.value.clone()))
            .collect();
        assert_eq!(
            history,
            vec![
                (1, HistoryValue::AccountBalance(max_amount)),
                (2, HistoryValue::AccountBalance(TokenAmount::ZERO)),
            ]
        );

        let transfer = working_set.operation_groups()[1].inferred_action.clone().unwrap();
        assert_eq!(transfer.action_type, InferredActionType::SimpleTransfer);
        assert_eq!(transfer.amount, max_amount);

        let supply = working_set
            .open_history_entry(&HistoryKey::ResourceSupply { rri: XRD.into() })
            .unwrap();
        match &supply.value {
            HistoryValue::ResourceSupply(supply) => assert_eq!(supply.total_supply, max_amount),
            other => panic!("unexpected history value {:?}", other),
        }
    }

    #[test]
    fn test_stake_updates_account_validator_history() {
        let working_set = process(&[
            transaction(1, 0, vec![vec![up("rdx1a", 1, 100, XRD)]]),
            transaction(
                2,
                1,
                vec![vec![
                    down("rdx1a", 1, 100, XRD),
                    amount_op(
                        prepared_stake("rdx1a", "rv1v"),
                        2,
                        SubstateOperation::Bootup,
                        99,
                        ResourceIdentifier::token(XRD),
                    ),
                ]],
            ),
            // Epoch change: prepared stake becomes stake units
            transaction(
                3,
                0,
                vec![vec![
                    amount_op(
                        prepared_stake("rdx1a", "rv1v"),
                        2,
                        SubstateOperation::Shutdown,
                        -99,
                        ResourceIdentifier::token(XRD),
                    ),
                    amount_op(
                        validator_system("rv1v"),
                        3,
                        SubstateOperation::Bootup,
                        99,
                        ResourceIdentifier::token(XRD),
                    ),
                    amount_op(
                        EntityIdentifier::new("rdx1a"),
                        4,
                        SubstateOperation::Bootup,
                        99,
                        ResourceIdentifier::stake_ownership("rv1v"),
                    ),
                ]],
            ),
        ])
        .unwrap();

        let key = HistoryKey::AccountValidatorStake {
            account_address: "rdx1a".into(),
            validator_address: "rv1v".into(),
        };
        let entries: Vec<_> = working_set.touched_history().filter(|e| e.key == key).collect();
        assert_eq!(entries.len(), 2);

        match &entries[0].value {
            HistoryValue::AccountValidatorStake(snapshot) => {
                assert_eq!(snapshot.total_prepared_xrd_stake, amount(99));
                assert_eq!(snapshot.total_stake_units, TokenAmount::ZERO);
            }
            other => panic!("unexpected history value {:?}", other),
        }
        assert_eq!(entries[0].to_state_version, Some(2));

        let open = working_set.open_history_entry(&key).unwrap();
        assert_eq!(open.from_state_version, 3);
        match &open.value {
            HistoryValue::AccountValidatorStake(snapshot) => {
                assert_eq!(snapshot.total_prepared_xrd_stake, TokenAmount::ZERO);
                assert_eq!(snapshot.total_stake_units, amount(99));
            }
            other => panic!("unexpected history value {:?}", other),
        }

        // Stake sub-entities reference their account
        let accounts: Vec<_> = account_transactions(&working_set, 3)
            .into_iter()
            .map(|row| row.account_address.as_str())
            .collect();
        assert!(accounts.contains(&"rdx1a"));
    }

    #[test]
    fn test_unstaking_more_than_prepared_is_fatal() {
        let err = process_with(
            PrefixVirtualSubstatePolicy::new(vec![vec![0xff]]),
            &[transaction(
                1,
                0,
                vec![vec![
                    amount_op(
                        prepared_stake("rdx1a", "rv1v"),
                        0xff,
                        SubstateOperation::Shutdown,
                        -5,
                        ResourceIdentifier::token(XRD),
                    ),
                    up("rdx1a", 1, 5, XRD),
                ]],
            )],
        )
        .unwrap_err();
        assert!(err.is_fatal_ledger_error());
        assert!(err.to_string().contains("negative total_prepared_xrd_stake"));
    }

    #[test]
    fn test_account_transactions_cover_referenced_accounts_and_signer() {
        let working_set = process(&[
            transaction(1, 0, vec![vec![up("rdx1a", 1, 1000, XRD)]]),
            transaction(
                2,
                10,
                vec![
                    vec![down("rdx1a", 1, 1000, XRD), up("rdx1a", 2, 990, XRD)],
                    vec![down("rdx1a", 2, 990, XRD), up("rdx1b", 3, 500, XRD), up("rdx1a", 4, 490, XRD)],
                ],
            ),
        ])
        .unwrap();

        let signer = signer_account();
        let rows = account_transactions(&working_set, 2);
        assert_eq!(rows.len(), 3);

        let row = |account: &str| {
            rows.iter()
                .find(|row| row.account_address == account)
                .map(|row| (row.is_fee_payer, row.is_signer))
        };
        assert_eq!(row("rdx1a"), Some((true, false)));
        assert_eq!(row("rdx1b"), Some((false, false)));
        assert_eq!(row(&signer), Some((false, true)));

        // Every row names a distinct account
        let first = account_transactions(&working_set, 1);
        assert_eq!(first.len(), 2);
        assert!(first.iter().any(|row| row.account_address == "rdx1a"));
    }

    #[test]
    fn test_malformed_signer_is_fatal() {
        let mut tx = transaction(1, 0, vec![vec![up("rdx1a", 1, 1, XRD)]]);
        tx.metadata.signed_by = Some("02ab".into());
        let err = process(&[tx]).unwrap_err();
        assert!(err.is_fatal_ledger_error());
        assert!(err.to_string().contains("not a compressed public key"));
    }

    #[test]
    fn test_validator_bft_data_updates_proposal_record() {
        let bft = |completed: u64| {
            data_op(
                validator_system("rv1v"),
                DataObject::ValidatorBftData {
                    proposals_completed: completed,
                    proposals_missed: 1,
                },
            )
        };
        let working_set = process(&[transaction(1, 0, vec![vec![bft(4)]]), transaction(2, 0, vec![vec![bft(5)]])]).unwrap();

        // Housekeeping-only groups still update proposals, but produce no group rows
        assert!(working_set.operation_groups().is_empty());
        let records: Vec<_> = working_set.validator_proposal_records().collect();
        assert_eq!(
            records,
            vec![&ValidatorProposalRecord {
                validator_address: "rv1v".into(),
                epoch: 0,
                proposals_completed: 5,
                proposals_missed: 1,
                last_updated_state_version: 2,
            }]
        );
    }

    #[test]
    fn test_validator_bft_data_against_non_system_entity_is_fatal() {
        let bft = data_op(
            EntityIdentifier::new("rv1v"),
            DataObject::ValidatorBftData {
                proposals_completed: 1,
                proposals_missed: 0,
            },
        );
        let err = process(&[transaction(1, 0, vec![vec![bft]])]).unwrap_err();
        assert!(err.is_fatal_ledger_error());
        assert!(err.to_string().contains("validator system entity was expected"));
    }

    #[test]
    fn test_housekeeping_operations_in_substantive_group_are_skipped() {
        // An amount against the system entity would be fatal if it were processed
        let mut round = data_op(
            EntityIdentifier::new("system"),
            DataObject::RoundData {
                round: 7,
                timestamp: 2_000,
            },
        );
        round.substate = Some(SubstateRef {
            identifier: vec![9],
            operation: SubstateOperation::Bootup,
        });
        round.amount = Some(ResourceAmount {
            value: "5".into(),
            resource_identifier: ResourceIdentifier::token(XRD),
        });
        let bft = data_op(
            validator_system("rv1v"),
            DataObject::ValidatorBftData {
                proposals_completed: 3,
                proposals_missed: 0,
            },
        );

        let working_set = process(&[transaction(1, 0, vec![vec![round, up("rdx1a", 1, 100, XRD), bft]])]).unwrap();

        assert_eq!(actions(&working_set), vec![Some(InferredActionType::MintXrd)]);
        assert_eq!(balance(&working_set, "rdx1a", XRD), Some(amount(100)));

        let substates: Vec<_> = working_set.touched_substates().map(|r| r.identifier.clone()).collect();
        assert_eq!(substates, vec![vec![1]]);
        assert!(working_set.substate(SubstateKind::AccountResourceBalance, &[9]).is_none());

        let history_keys: Vec<_> = working_set.touched_history_keys().cloned().collect();
        assert_eq!(
            history_keys,
            vec![
                HistoryKey::AccountResource {
                    account_address: "rdx1a".into(),
                    rri: XRD.into(),
                },
                HistoryKey::ResourceSupply { rri: XRD.into() },
            ]
        );

        // Proposal counters still apply, and the round still moves the summary
        assert_eq!(working_set.validator_proposal_records().count(), 1);
        assert_eq!(working_set.transactions().next().map(|row| row.round_in_epoch), Some(7));

        let accounts: Vec<_> = account_transactions(&working_set, 1)
            .into_iter()
            .map(|row| row.account_address.clone())
            .collect();
        assert!(accounts.contains(&"rdx1a".to_string()));
        assert!(!accounts.contains(&"system".to_string()));
    }
}
