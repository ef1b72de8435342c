//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `transactions` - Ledger transaction rows (key: state_version)
//! - `operation_groups` - Operation group rows (key: state_version || group_index)
//! - `substates` - Substates of every kind (key: kind_tag || identifier)
//! - `history` - History intervals (key: encoded history key || from_state_version)
//! - `open_history` - Open interval per history key (key: encoded history key)
//! - `account_transactions` - Accounts referenced by each transaction (key: account || 0 || state_version)
//! - `validator_proposals` - Latest proposal counters (key: validator || 0 || epoch)
//! - `meta` - Top of ledger summary

use crate::{
    error::{Error, Result},
    history::{HistoryEntry, HistoryKey},
    planner::{DependencyLoader, WorkingSet},
    substate::{SubstateKind, SubstateRecord},
    summary::TransactionSummary,
    types::{AccountTransaction, LedgerOperationGroup, LedgerTransaction, ValidatorProposalRecord},
    Config,
};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options, WriteBatch, DB,
};
use std::sync::Arc;

/// Column family names
const CF_TRANSACTIONS: &str = "transactions";
const CF_OPERATION_GROUPS: &str = "operation_groups";
const CF_SUBSTATES: &str = "substates";
const CF_HISTORY: &str = "history";
const CF_OPEN_HISTORY: &str = "open_history";
const CF_ACCOUNT_TRANSACTIONS: &str = "account_transactions";
const CF_VALIDATOR_PROPOSALS: &str = "validator_proposals";
const CF_META: &str = "meta";

const KEY_TOP_OF_LEDGER: &[u8] = b"top_of_ledger";

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("path", &self.db.path()).finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.rocksdb.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_level_zero_file_num_compaction_trigger(
            config.rocksdb.level0_file_num_compaction_trigger,
        );

        // Ingest is write-heavy
        db_opts.set_compaction_style(DBCompactionStyle::Universal);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Self::cf_options_rows()),
            ColumnFamilyDescriptor::new(CF_OPERATION_GROUPS, Self::cf_options_rows()),
            ColumnFamilyDescriptor::new(CF_SUBSTATES, Self::cf_options_lookup()),
            ColumnFamilyDescriptor::new(CF_HISTORY, Self::cf_options_history()),
            ColumnFamilyDescriptor::new(CF_OPEN_HISTORY, Self::cf_options_lookup()),
            ColumnFamilyDescriptor::new(CF_ACCOUNT_TRANSACTIONS, Self::cf_options_rows()),
            ColumnFamilyDescriptor::new(CF_VALIDATOR_PROPOSALS, Self::cf_options_rows()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened RocksDB");

        Ok(Self { db: Arc::new(db) })
    }

    // Column family options

    fn cf_options_rows() -> Options {
        let mut opts = Options::default();
        // Written once, rarely read back by the indexer itself
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_lookup() -> Options {
        let mut opts = Options::default();
        // Point lookups on every batch, use LZ4 and bloom filters
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_options_history() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    // Helper: get column family handle

    fn cf_handle(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Key helpers

    fn operation_group_key(state_version: u64, operation_group_index: usize) -> Vec<u8> {
        let mut key = state_version.to_be_bytes().to_vec();
        key.extend_from_slice(&(operation_group_index as u32).to_be_bytes());
        key
    }

    fn address_prefix(address: &str) -> Vec<u8> {
        let mut key = address.as_bytes().to_vec();
        key.push(0);
        key
    }

    fn address_key(address: &str, suffix: u64) -> Vec<u8> {
        let mut key = Self::address_prefix(address);
        key.extend_from_slice(&suffix.to_be_bytes());
        key
    }

    fn history_key(key: &HistoryKey, from_state_version: u64) -> Vec<u8> {
        let mut encoded = key.encode();
        encoded.extend_from_slice(&from_state_version.to_be_bytes());
        encoded
    }

    fn decode_state_version(value: &[u8]) -> Result<u64> {
        let bytes: [u8; 8] = value
            .try_into()
            .map_err(|_| Error::Storage(format!("Invalid state version of {} bytes", value.len())))?;
        Ok(u64::from_be_bytes(bytes))
    }

    // Top of ledger

    /// Summary of the last committed transaction, `None` on an empty ledger
    pub fn top_of_ledger(&self) -> Result<Option<TransactionSummary>> {
        let cf = self.cf_handle(CF_META)?;
        match self.db.get_cf(&cf, KEY_TOP_OF_LEDGER)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    // Row reads

    /// Get ledger transaction by state version
    pub fn get_transaction(&self, state_version: u64) -> Result<Option<LedgerTransaction>> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        match self.db.get_cf(&cf, state_version.to_be_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Get the operation group rows of a transaction
    pub fn get_operation_groups(&self, state_version: u64) -> Result<Vec<LedgerOperationGroup>> {
        let cf = self.cf_handle(CF_OPERATION_GROUPS)?;
        let prefix = state_version.to_be_bytes();

        let mut groups = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            groups.push(bincode::deserialize(&value)?);
        }

        Ok(groups)
    }

    /// Get the transactions referencing an account, oldest first
    pub fn get_account_transactions(&self, account_address: &str) -> Result<Vec<AccountTransaction>> {
        let cf = self.cf_handle(CF_ACCOUNT_TRANSACTIONS)?;
        let prefix = Self::address_prefix(account_address);

        let mut rows = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            rows.push(bincode::deserialize(&value)?);
        }

        Ok(rows)
    }

    /// Get a validator's proposal counters for an epoch
    pub fn get_validator_proposal_record(
        &self,
        validator_address: &str,
        epoch: u64,
    ) -> Result<Option<ValidatorProposalRecord>> {
        let cf = self.cf_handle(CF_VALIDATOR_PROPOSALS)?;
        match self.db.get_cf(&cf, Self::address_key(validator_address, epoch))? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Get substate by kind and identifier
    pub fn get_substate(&self, kind: SubstateKind, identifier: &[u8]) -> Result<Option<SubstateRecord>> {
        let cf = self.cf_handle(CF_SUBSTATES)?;
        match self.db.get_cf(&cf, SubstateRecord::storage_key(kind, identifier))? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Get the open history entry of a key
    pub fn get_open_history(&self, key: &HistoryKey) -> Result<Option<HistoryEntry>> {
        Ok(self.load_open_history(std::slice::from_ref(key))?.pop())
    }

    /// Get every history entry of a key, oldest first
    pub fn get_history(&self, key: &HistoryKey) -> Result<Vec<HistoryEntry>> {
        let cf = self.cf_handle(CF_HISTORY)?;
        let prefix = key.encode();

        let mut entries = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (raw_key, value) = item?;
            if !raw_key.starts_with(&prefix) {
                break;
            }
            entries.push(bincode::deserialize(&value)?);
        }

        Ok(entries)
    }

    // Batch operations (atomic)

    /// Write everything a batch produced, and its new top of ledger, atomically.
    ///
    /// Returns the number of rows written.
    pub fn commit_batch(&self, working_set: &WorkingSet, top_of_ledger: &TransactionSummary) -> Result<usize> {
        let mut batch = WriteBatch::default();
        let mut rows = 0usize;

        // 1. Transactions
        let cf_transactions = self.cf_handle(CF_TRANSACTIONS)?;
        for transaction in working_set.transactions() {
            batch.put_cf(
                &cf_transactions,
                transaction.state_version.to_be_bytes(),
                bincode::serialize(transaction)?,
            );
            rows += 1;
        }

        // 2. Operation groups
        let cf_groups = self.cf_handle(CF_OPERATION_GROUPS)?;
        for group in working_set.operation_groups() {
            batch.put_cf(
                &cf_groups,
                Self::operation_group_key(group.state_version, group.operation_group_index),
                bincode::serialize(group)?,
            );
            rows += 1;
        }

        // 3. Substates
        let cf_substates = self.cf_handle(CF_SUBSTATES)?;
        for record in working_set.touched_substates() {
            batch.put_cf(
                &cf_substates,
                SubstateRecord::storage_key(record.kind(), &record.identifier),
                bincode::serialize(record)?,
            );
            rows += 1;
        }

        // 4. History, closed intervals included
        let cf_history = self.cf_handle(CF_HISTORY)?;
        for entry in working_set.touched_history() {
            batch.put_cf(&cf_history, entry.storage_key(), bincode::serialize(entry)?);
            rows += 1;
        }

        let cf_open_history = self.cf_handle(CF_OPEN_HISTORY)?;
        for key in working_set.touched_history_keys() {
            if let Some(open) = working_set.open_history_entry(key) {
                batch.put_cf(&cf_open_history, key.encode(), open.from_state_version.to_be_bytes());
            }
        }

        // 5. Account transactions and proposal counters
        let cf_account_transactions = self.cf_handle(CF_ACCOUNT_TRANSACTIONS)?;
        for row in working_set.account_transactions() {
            batch.put_cf(
                &cf_account_transactions,
                Self::address_key(&row.account_address, row.state_version),
                bincode::serialize(row)?,
            );
            rows += 1;
        }

        let cf_proposals = self.cf_handle(CF_VALIDATOR_PROPOSALS)?;
        for record in working_set.validator_proposal_records() {
            batch.put_cf(
                &cf_proposals,
                Self::address_key(&record.validator_address, record.epoch),
                bincode::serialize(record)?,
            );
            rows += 1;
        }

        // 6. Top of ledger
        let cf_meta = self.cf_handle(CF_META)?;
        batch.put_cf(&cf_meta, KEY_TOP_OF_LEDGER, bincode::serialize(top_of_ledger)?);

        // Atomic commit
        self.db.write(batch)?;

        tracing::debug!(
            state_version = top_of_ledger.state_version,
            rows,
            "Batch written"
        );

        Ok(rows)
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        drop(self.db);
        tracing::info!("RocksDB closed gracefully");
        Ok(())
    }
}

impl DependencyLoader for Storage {
    fn load_substates(&self, kind: SubstateKind, identifiers: &[Vec<u8>]) -> Result<Vec<SubstateRecord>> {
        let cf = self.cf_handle(CF_SUBSTATES)?;
        let keys: Vec<Vec<u8>> = identifiers
            .iter()
            .map(|identifier| SubstateRecord::storage_key(kind, identifier))
            .collect();

        let mut records = Vec::new();
        for value in self.db.multi_get_cf(keys.iter().map(|key| (&cf, key))) {
            if let Some(value) = value? {
                records.push(bincode::deserialize(&value)?);
            }
        }

        Ok(records)
    }

    fn load_open_history(&self, keys: &[HistoryKey]) -> Result<Vec<HistoryEntry>> {
        let cf_open = self.cf_handle(CF_OPEN_HISTORY)?;
        let encoded: Vec<Vec<u8>> = keys.iter().map(HistoryKey::encode).collect();

        let mut entry_keys = Vec::new();
        for (key, value) in keys
            .iter()
            .zip(self.db.multi_get_cf(encoded.iter().map(|k| (&cf_open, k))))
        {
            if let Some(value) = value? {
                entry_keys.push(Self::history_key(key, Self::decode_state_version(&value)?));
            }
        }

        let cf_history = self.cf_handle(CF_HISTORY)?;
        let mut entries = Vec::with_capacity(entry_keys.len());
        for value in self.db.multi_get_cf(entry_keys.iter().map(|k| (&cf_history, k))) {
            let value = value?.ok_or_else(|| Error::Storage("Open history entry is missing".to_string()))?;
            entries.push(bincode::deserialize(&value)?);
        }

        Ok(entries)
    }
}
