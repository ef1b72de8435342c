//! Two-phase batch planner
//!
//! Processing a batch of transactions one operation at a time would cost one
//! storage read per substate touched. Instead, the content processor runs over
//! the whole batch first and talks to the [`ActionsPlanner`]:
//!
//! - **Scan & schedule**: every substate identifier and history key the batch
//!   touches is recorded in a load set, and each mutation is queued as a
//!   deferred action
//! - **Load**: one bulk read per substate kind, and one for history, fill a
//!   [`WorkingSet`]
//! - **Replay**: the deferred actions run strictly in scheduling order
//!   against the working set, which is then committed in one write batch
//!
//! Every invariant violation found during replay aborts the batch.

use crate::{
    accounting::ValidatorStakeLookup,
    error::{Error, Result},
    history::{HistoryEntry, HistoryKey, HistoryValue, ValidatorStakeSnapshot},
    substate::{Substate, SubstateKind, SubstateRecord, SubstateState, VirtualSubstatePolicy},
    types::{
        AccountTransaction, LedgerOperationGroup, LedgerTransaction, OperationRef, TransactionOpLocator,
        ValidatorProposalRecord,
    },
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// A mutation deferred until dependencies are loaded
pub type PlannedAction = Box<dyn FnOnce(&mut WorkingSet) -> Result<()> + Send>;

/// Bulk reads of the state a batch depends on
pub trait DependencyLoader: Sync {
    /// Load the substates of `kind` with the given identifiers. Missing identifiers are skipped.
    fn load_substates(&self, kind: SubstateKind, identifiers: &[Vec<u8>]) -> Result<Vec<SubstateRecord>>;

    /// Load the open history entry of each key. Keys without history are skipped.
    fn load_open_history(&self, keys: &[HistoryKey]) -> Result<Vec<HistoryEntry>>;
}

/// Timings and counts from [`ActionsPlanner::process_all_changes`]
#[derive(Debug, Clone, Default)]
pub struct PlannerReport {
    /// Time spent in bulk loads
    pub dependency_loading_ms: u64,
    /// Number of deferred actions replayed
    pub actions_count: usize,
    /// Time spent replaying actions
    pub action_replay_ms: u64,
}

/// Collects load sets and deferred actions for one batch
pub struct ActionsPlanner {
    virtual_policy: Arc<dyn VirtualSubstatePolicy>,
    substates_to_load: BTreeMap<SubstateKind, BTreeSet<Vec<u8>>>,
    history_to_load: BTreeSet<HistoryKey>,
    actions: Vec<PlannedAction>,
}

impl std::fmt::Debug for ActionsPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionsPlanner")
            .field("substates_to_load", &self.substates_to_load.values().map(BTreeSet::len).sum::<usize>())
            .field("history_to_load", &self.history_to_load.len())
            .field("actions", &self.actions.len())
            .finish()
    }
}

impl ActionsPlanner {
    /// New planner for one batch
    pub fn new(virtual_policy: Arc<dyn VirtualSubstatePolicy>) -> Self {
        Self {
            virtual_policy,
            substates_to_load: BTreeMap::new(),
            history_to_load: BTreeSet::new(),
            actions: Vec::new(),
        }
    }

    /// Number of deferred actions so far
    pub fn actions_count(&self) -> usize {
        self.actions.len()
    }

    /// Defer an arbitrary action against the working set
    pub fn add_action(&mut self, action: impl FnOnce(&mut WorkingSet) -> Result<()> + Send + 'static) {
        self.actions.push(Box::new(action));
    }

    /// Defer adding a transaction row
    pub fn add_transaction(&mut self, transaction: LedgerTransaction) {
        self.add_action(move |working_set| {
            working_set.transactions.insert(transaction.state_version, transaction);
            Ok(())
        });
    }

    /// Defer one account transaction row per account in `account_addresses`.
    ///
    /// The fee payer is only known once the transaction's groups have been
    /// replayed, so this must be scheduled after them.
    pub fn add_account_transactions(
        &mut self,
        locator: TransactionOpLocator,
        account_addresses: BTreeSet<String>,
        signer_account_address: Option<String>,
    ) {
        if account_addresses.is_empty() {
            return;
        }
        self.add_action(move |working_set| {
            let state_version = locator.state_version;
            let fee_payer = working_set
                .transactions
                .get(&state_version)
                .ok_or_else(|| Error::invalid_transaction(locator.clone(), "Account transactions have no transaction row"))?
                .fee_payer
                .clone();
            for account_address in account_addresses {
                working_set.account_transactions.push(AccountTransaction {
                    is_fee_payer: fee_payer.as_deref() == Some(account_address.as_str()),
                    is_signer: signer_account_address.as_deref() == Some(account_address.as_str()),
                    account_address,
                    state_version,
                });
            }
            Ok(())
        });
    }

    /// Defer replacing the proposal record of the record's validator and epoch
    pub fn upsert_validator_proposal_record(&mut self, record: ValidatorProposalRecord) {
        self.add_action(move |working_set| {
            working_set
                .validator_proposals
                .insert((record.validator_address.clone(), record.epoch), record);
            Ok(())
        });
    }

    /// Schedule `substate` to be booted up at `operation`
    pub fn up_substate(
        &mut self,
        locator: TransactionOpLocator,
        operation: OperationRef,
        identifier: Vec<u8>,
        substate: Substate,
    ) {
        let kind = substate.kind();
        self.mark_substate_to_load(kind, &identifier);
        self.add_action(move |working_set| working_set.up_substate(&locator, operation, identifier, substate));
    }

    /// Schedule the substate `identifier` of `kind` to be shut down at `operation`.
    ///
    /// `create_if_virtual` builds the payload of a virtual substate downed
    /// without a prior up; `verify_matches` checks an existing substate
    /// against what the operation describes.
    pub fn down_substate(
        &mut self,
        locator: TransactionOpLocator,
        operation: OperationRef,
        kind: SubstateKind,
        identifier: Vec<u8>,
        create_if_virtual: impl FnOnce() -> Substate + Send + 'static,
        verify_matches: impl Fn(&Substate) -> bool + Send + 'static,
    ) {
        self.mark_substate_to_load(kind, &identifier);
        let policy = Arc::clone(&self.virtual_policy);
        self.add_action(move |working_set| {
            working_set.down_substate(
                &locator,
                operation,
                kind,
                identifier,
                policy.as_ref(),
                create_if_virtual,
                verify_matches,
            )
        });
    }

    /// Schedule a new history entry for `key` at `state_version`.
    ///
    /// `make_next` receives the value of the currently open entry, if any.
    pub fn add_history_entry(
        &mut self,
        locator: TransactionOpLocator,
        key: HistoryKey,
        state_version: u64,
        make_next: impl FnOnce(Option<&HistoryValue>) -> Result<HistoryValue> + Send + 'static,
    ) {
        self.mark_history_to_load(key.clone());
        self.add_action(move |working_set| working_set.add_history_entry(&locator, key, state_version, make_next));
    }

    /// Ensure the open history of `key` is loaded, e.g. for lookups during replay
    pub fn mark_history_to_load(&mut self, key: HistoryKey) {
        self.history_to_load.insert(key);
    }

    fn mark_substate_to_load(&mut self, kind: SubstateKind, identifier: &[u8]) {
        self.substates_to_load
            .entry(kind)
            .or_default()
            .insert(identifier.to_vec());
    }

    /// Load dependencies, then replay every deferred action in order
    pub fn process_all_changes(
        self,
        loader: &dyn DependencyLoader,
        cancel: &CancellationToken,
    ) -> Result<(WorkingSet, PlannerReport)> {
        let mut report = PlannerReport {
            actions_count: self.actions.len(),
            ..Default::default()
        };

        let started = Instant::now();
        let mut working_set = Self::load_dependencies(loader, &self.substates_to_load, &self.history_to_load, cancel)?;
        report.dependency_loading_ms = started.elapsed().as_millis() as u64;

        tracing::debug!(
            substates = working_set.substates.len(),
            history = working_set.open_history.len(),
            elapsed_ms = report.dependency_loading_ms,
            "Dependencies loaded"
        );

        let started = Instant::now();
        for action in self.actions {
            action(&mut working_set)?;
        }
        report.action_replay_ms = started.elapsed().as_millis() as u64;

        tracing::debug!(
            actions = report.actions_count,
            elapsed_ms = report.action_replay_ms,
            "Actions replayed"
        );

        Ok((working_set, report))
    }

    fn load_dependencies(
        loader: &dyn DependencyLoader,
        substates_to_load: &BTreeMap<SubstateKind, BTreeSet<Vec<u8>>>,
        history_to_load: &BTreeSet<HistoryKey>,
        cancel: &CancellationToken,
    ) -> Result<WorkingSet> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Kinds are independent, so their loads may run side by side
        let substate_loads: Vec<Result<Vec<SubstateRecord>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = substates_to_load
                .iter()
                .map(|(kind, identifiers)| {
                    let identifiers: Vec<Vec<u8>> = identifiers.iter().cloned().collect();
                    scope.spawn(move || loader.load_substates(*kind, &identifiers))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(Error::Concurrency("Substate loader panicked".to_string())))
                })
                .collect()
        });

        let mut working_set = WorkingSet::default();
        for records in substate_loads {
            for record in records? {
                working_set
                    .substates
                    .insert((record.kind(), record.identifier.clone()), record);
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let keys: Vec<HistoryKey> = history_to_load.iter().cloned().collect();
        for entry in loader.load_open_history(&keys)? {
            working_set.open_history.insert(entry.key.clone(), entry);
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        Ok(working_set)
    }
}

/// In-memory view of the state a batch touches, and the rows it produces
#[derive(Debug, Default)]
pub struct WorkingSet {
    substates: HashMap<(SubstateKind, Vec<u8>), SubstateRecord>,
    touched_substates: BTreeSet<(SubstateKind, Vec<u8>)>,
    open_history: HashMap<HistoryKey, HistoryEntry>,
    touched_history: BTreeSet<HistoryKey>,
    closed_history: Vec<HistoryEntry>,
    transactions: BTreeMap<u64, LedgerTransaction>,
    operation_groups: Vec<LedgerOperationGroup>,
    account_transactions: Vec<AccountTransaction>,
    validator_proposals: BTreeMap<(String, u64), ValidatorProposalRecord>,
}

impl WorkingSet {
    /// Substate by kind and identifier
    pub fn substate(&self, kind: SubstateKind, identifier: &[u8]) -> Option<&SubstateRecord> {
        self.substates.get(&(kind, identifier.to_vec()))
    }

    /// Substates created or downed in this batch
    pub fn touched_substates(&self) -> impl Iterator<Item = &SubstateRecord> {
        self.touched_substates
            .iter()
            .filter_map(move |key| self.substates.get(key))
    }

    /// Open history entry of `key`
    pub fn open_history_entry(&self, key: &HistoryKey) -> Option<&HistoryEntry> {
        self.open_history.get(key)
    }

    /// Entries closed in this batch, followed by the open entries of keys touched in it
    pub fn touched_history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.closed_history.iter().chain(
            self.touched_history
                .iter()
                .filter_map(move |key| self.open_history.get(key)),
        )
    }

    /// Keys whose open entry changed in this batch
    pub fn touched_history_keys(&self) -> impl Iterator<Item = &HistoryKey> {
        self.touched_history.iter()
    }

    /// Transaction rows, by state version
    pub fn transactions(&self) -> impl Iterator<Item = &LedgerTransaction> {
        self.transactions.values()
    }

    /// Transaction row at `state_version`
    pub fn transaction_mut(&mut self, state_version: u64) -> Option<&mut LedgerTransaction> {
        self.transactions.get_mut(&state_version)
    }

    /// Operation group rows, in processing order
    pub fn operation_groups(&self) -> &[LedgerOperationGroup] {
        &self.operation_groups
    }

    /// Record an operation group row
    pub fn add_operation_group(&mut self, group: LedgerOperationGroup) {
        self.operation_groups.push(group);
    }

    /// Account transaction rows, in processing order
    pub fn account_transactions(&self) -> &[AccountTransaction] {
        &self.account_transactions
    }

    /// Latest proposal record of each validator and epoch seen in this batch
    pub fn validator_proposal_records(&self) -> impl Iterator<Item = &ValidatorProposalRecord> {
        self.validator_proposals.values()
    }

    fn up_substate(
        &mut self,
        locator: &TransactionOpLocator,
        operation: OperationRef,
        identifier: Vec<u8>,
        substate: Substate,
    ) -> Result<()> {
        let key = (substate.kind(), identifier);

        if self.substates.contains_key(&key) {
            return Err(Error::invalid_transaction(
                locator.clone(),
                format!(
                    "{} with identifier {} can't be upped, as a substate with that identifier already exists",
                    key.0,
                    hex::encode(&key.1)
                ),
            ));
        }

        let record = SubstateRecord {
            identifier: key.1.clone(),
            substate,
            up: operation,
            down: None,
        };
        self.touched_substates.insert(key.clone());
        self.substates.insert(key, record);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn down_substate(
        &mut self,
        locator: &TransactionOpLocator,
        operation: OperationRef,
        kind: SubstateKind,
        identifier: Vec<u8>,
        virtual_policy: &dyn VirtualSubstatePolicy,
        create_if_virtual: impl FnOnce() -> Substate,
        verify_matches: impl Fn(&Substate) -> bool,
    ) -> Result<()> {
        let key = (kind, identifier);

        let Some(existing) = self.substates.get_mut(&key) else {
            if !virtual_policy.is_virtual(kind, &key.1) {
                return Err(Error::invalid_transaction(
                    locator.clone(),
                    format!(
                        "Non-virtual {} with identifier {} could not be downed, as it did not exist",
                        kind,
                        hex::encode(&key.1)
                    ),
                ));
            }

            // Virtual substates are implicitly up until first consumed
            let record = SubstateRecord {
                identifier: key.1.clone(),
                substate: create_if_virtual(),
                up: operation,
                down: Some(operation),
            };
            self.touched_substates.insert(key.clone());
            self.substates.insert(key, record);
            return Ok(());
        };

        if existing.state() == SubstateState::Down {
            return Err(Error::invalid_transaction(
                locator.clone(),
                format!(
                    "{} with identifier {} could not be downed, as it was already down",
                    kind,
                    hex::encode(&key.1)
                ),
            ));
        }

        if !verify_matches(&existing.substate) {
            return Err(Error::invalid_transaction(
                locator.clone(),
                format!(
                    "{} with identifier {} was downed, but the downed substate contents do not match expectation",
                    kind,
                    hex::encode(&key.1)
                ),
            ));
        }

        existing.down = Some(operation);
        self.touched_substates.insert(key);
        Ok(())
    }

    fn add_history_entry(
        &mut self,
        locator: &TransactionOpLocator,
        key: HistoryKey,
        state_version: u64,
        make_next: impl FnOnce(Option<&HistoryValue>) -> Result<HistoryValue>,
    ) -> Result<()> {
        let value = make_next(self.open_history.get(&key).map(|entry| &entry.value))?;

        if let Some(mut previous) = self.open_history.remove(&key) {
            if previous.from_state_version >= state_version {
                return Err(Error::invalid_transaction(
                    locator.clone(),
                    format!(
                        "History for {:?} already has an entry from state version {}, can't add one at {}",
                        key, previous.from_state_version, state_version
                    ),
                ));
            }
            previous.to_state_version = Some(state_version - 1);
            self.closed_history.push(previous);
        }

        self.touched_history.insert(key.clone());
        self.open_history.insert(
            key.clone(),
            HistoryEntry {
                key,
                value,
                from_state_version: state_version,
                to_state_version: None,
            },
        );
        Ok(())
    }
}

impl ValidatorStakeLookup for WorkingSet {
    fn validator_stake(&self, validator_address: &str) -> ValidatorStakeSnapshot {
        let key = HistoryKey::ValidatorStake {
            validator_address: validator_address.to_string(),
        };
        match self.open_history.get(&key).map(|entry| &entry.value) {
            Some(HistoryValue::ValidatorStake(snapshot)) => *snapshot,
            _ => ValidatorStakeSnapshot::default(),
        }
    }
}
