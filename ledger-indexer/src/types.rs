//! Core types for the ledger indexer
//!
//! Two groups of types live here:
//! - The committed transaction model, as emitted by the node's transaction log
//! - The rows persisted for each committed transaction and operation group
//!
//! Token amounts are exact integers of sub-units. The ledger's amounts are
//! unsigned 256-bit integers, so a [`TokenAmount`] keeps a sign next to a
//! 512-bit magnitude: deltas, balances and running supply totals all fit.

use crate::accounting::InferredAction;
use crate::entity::{EntityIdentifier, ResourceIdentifier};
use primitive_types::U512;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::ops::Neg;

/// A signed amount of token sub-units
///
/// Serialized as its decimal string, e.g. `"-1000000000000000000"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TokenAmount {
    negative: bool,
    magnitude: U512,
}

impl TokenAmount {
    /// Zero sub-units
    pub const ZERO: TokenAmount = TokenAmount {
        negative: false,
        magnitude: U512([0; 8]),
    };

    // Zero is never negative, so derived equality and hashing hold
    fn signed(negative: bool, magnitude: U512) -> Self {
        Self {
            negative: negative && !magnitude.is_zero(),
            magnitude,
        }
    }

    /// Parse a decimal sub-unit string such as `"-1000000000000000000"`.
    ///
    /// Returns `None` for anything that is not an integer in range, the
    /// equivalent of a NaN amount.
    pub fn from_sub_units_str(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(digits) => (true, digits),
            None => (false, trimmed),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let magnitude = U512::from_dec_str(digits).ok()?;
        Some(Self::signed(negative, magnitude))
    }

    /// Create from a whole number of sub-units
    pub fn from_sub_units(value: i64) -> Self {
        Self::signed(value < 0, U512::from(value.unsigned_abs()))
    }

    /// Absolute value, in sub-units
    pub fn magnitude(&self) -> U512 {
        self.magnitude
    }

    /// Addition which reports overflow as `None`
    pub fn checked_add(self, other: TokenAmount) -> Option<TokenAmount> {
        if self.negative == other.negative {
            return Some(Self::signed(self.negative, self.magnitude.checked_add(other.magnitude)?));
        }
        let sum = if self.magnitude >= other.magnitude {
            Self::signed(self.negative, self.magnitude - other.magnitude)
        } else {
            Self::signed(other.negative, other.magnitude - self.magnitude)
        };
        Some(sum)
    }

    /// Subtraction which reports overflow as `None`
    pub fn checked_sub(self, other: TokenAmount) -> Option<TokenAmount> {
        self.checked_add(-other)
    }

    /// `self * numerator / denominator`, truncated towards zero
    pub fn checked_mul_div(self, numerator: TokenAmount, denominator: TokenAmount) -> Option<TokenAmount> {
        if denominator.is_zero() {
            return None;
        }
        let magnitude = self
            .magnitude
            .checked_mul(numerator.magnitude)?
            .checked_div(denominator.magnitude)?;
        Some(Self::signed(
            self.negative ^ numerator.negative ^ denominator.negative,
            magnitude,
        ))
    }

    /// Is zero
    pub fn is_zero(&self) -> bool {
        self.magnitude.is_zero()
    }

    /// Is strictly negative
    pub fn is_negative(&self) -> bool {
        self.negative
    }

    /// Is strictly positive
    pub fn is_positive(&self) -> bool {
        !self.negative && !self.magnitude.is_zero()
    }
}

impl Neg for TokenAmount {
    type Output = TokenAmount;

    fn neg(self) -> Self::Output {
        Self::signed(!self.negative, self.magnitude)
    }
}

impl Ord for TokenAmount {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.negative, other.negative) {
            (false, false) => self.magnitude.cmp(&other.magnitude),
            (true, true) => other.magnitude.cmp(&self.magnitude),
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
        }
    }
}

impl PartialOrd for TokenAmount {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negative {
            write!(f, "-")?;
        }
        write!(f, "{}", self.magnitude)
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        TokenAmount::from_sub_units_str(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid sub-unit amount {:?}", value)))
    }
}

/// Points at a transaction, and optionally an operation group / operation within it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOpLocator {
    /// Resultant state version of the transaction
    pub state_version: u64,
    /// Transaction identifier hash (hex)
    pub transaction_hash: String,
    /// Operation group index within the transaction
    pub operation_group_index: Option<usize>,
    /// Operation index within the operation group
    pub operation_index_in_group: Option<usize>,
}

impl TransactionOpLocator {
    /// Locator for a whole transaction
    pub fn transaction(state_version: u64, transaction_hash: impl Into<String>) -> Self {
        Self {
            state_version,
            transaction_hash: transaction_hash.into(),
            operation_group_index: None,
            operation_index_in_group: None,
        }
    }

    /// Locator for an operation group
    pub fn group(state_version: u64, transaction_hash: impl Into<String>, group: usize) -> Self {
        Self {
            operation_group_index: Some(group),
            ..Self::transaction(state_version, transaction_hash)
        }
    }

    /// Locator for a single operation
    pub fn operation(
        state_version: u64,
        transaction_hash: impl Into<String>,
        group: usize,
        operation: usize,
    ) -> Self {
        Self {
            operation_group_index: Some(group),
            operation_index_in_group: Some(operation),
            ..Self::transaction(state_version, transaction_hash)
        }
    }
}

impl fmt::Display for TransactionOpLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state version {} (transaction {})", self.state_version, self.transaction_hash)?;
        if let Some(group) = self.operation_group_index {
            write!(f, ", operation group {}", group)?;
        }
        if let Some(operation) = self.operation_index_in_group {
            write!(f, ", operation {}", operation)?;
        }
        Ok(())
    }
}

/// Where a substate was upped or downed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationRef {
    /// State version of the transaction
    pub state_version: u64,
    /// Operation group index
    pub operation_group_index: usize,
    /// Operation index within the group
    pub operation_index_in_group: usize,
}

// ----------------------------------------------------------------------------
// Committed transaction model (input)
// ----------------------------------------------------------------------------

/// A transaction committed to the ledger, as emitted by the node's transaction log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommittedTransaction {
    /// Hash identifying the transaction (32 bytes)
    #[serde(with = "hex::serde")]
    pub transaction_identifier_hash: Vec<u8>,
    /// Ledger state after this transaction
    pub committed_state_identifier: StateIdentifier,
    /// Logically atomic groups of operations
    #[serde(default)]
    pub operation_groups: Vec<OperationGroup>,
    /// Fee, signer, message and payload
    pub metadata: TransactionMetadata,
}

impl CommittedTransaction {
    /// Resultant state version
    pub fn state_version(&self) -> u64 {
        self.committed_state_identifier.state_version
    }

    /// Transaction identifier hash as hex
    pub fn hash_hex(&self) -> String {
        hex::encode(&self.transaction_identifier_hash)
    }
}

/// State version plus the transaction accumulator at that version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateIdentifier {
    /// Index of the transaction in the ledger
    pub state_version: u64,
    /// Running double-SHA-256 accumulator (32 bytes)
    #[serde(with = "hex::serde")]
    pub transaction_accumulator: Vec<u8>,
}

/// Operations which are applied together
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationGroup {
    /// Operations in order
    #[serde(default)]
    pub operations: Vec<Operation>,
}

impl OperationGroup {
    /// True if some operation is more than round / BFT bookkeeping
    pub fn has_substantive_operations(&self) -> bool {
        self.operations.iter().any(|op| !op.is_round_or_bft_housekeeping())
    }
}

/// A single up/down of a substate, with an optional amount and data payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// The entity the operation is against
    pub entity_identifier: EntityIdentifier,
    /// Substate being booted up or shut down
    #[serde(default)]
    pub substate: Option<SubstateRef>,
    /// Amount moved (positive on bootup, negative on shutdown)
    #[serde(default)]
    pub amount: Option<ResourceAmount>,
    /// Data written or deleted
    #[serde(default)]
    pub data: Option<DataAction>,
}

impl Operation {
    /// Round data and validator BFT data are consensus bookkeeping only
    pub fn is_round_or_bft_housekeeping(&self) -> bool {
        matches!(
            self.data.as_ref().map(|d| &d.data_object),
            Some(DataObject::RoundData { .. }) | Some(DataObject::ValidatorBftData { .. })
        )
    }

    /// The epoch of newly created epoch data, if any
    pub fn created_epoch(&self) -> Option<u64> {
        match &self.data {
            Some(DataAction {
                action: DataActionKind::Create,
                data_object: DataObject::EpochData { epoch },
            }) => Some(*epoch),
            _ => None,
        }
    }

    /// Round and timestamp of newly created round data, if any
    pub fn created_round(&self) -> Option<(u64, i64)> {
        match &self.data {
            Some(DataAction {
                action: DataActionKind::Create,
                data_object: DataObject::RoundData { round, timestamp },
            }) => Some((*round, *timestamp)),
            _ => None,
        }
    }

    /// Round of deleted round data, if any
    pub fn deleted_round(&self) -> Option<u64> {
        match &self.data {
            Some(DataAction {
                action: DataActionKind::Delete,
                data_object: DataObject::RoundData { round, .. },
            }) => Some(*round),
            _ => None,
        }
    }
}

/// Reference to a substate and what happens to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstateRef {
    /// Opaque substate identifier
    #[serde(with = "hex::serde")]
    pub identifier: Vec<u8>,
    /// Bootup or shutdown
    pub operation: SubstateOperation,
}

/// Substate lifecycle operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubstateOperation {
    /// Substate comes into existence
    Bootup,
    /// Substate is consumed
    Shutdown,
}

/// An amount of a resource, as a sub-unit string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAmount {
    /// Signed sub-unit string
    pub value: String,
    /// What the amount is of
    pub resource_identifier: ResourceIdentifier,
}

/// Data created or deleted by an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAction {
    /// Create or delete
    pub action: DataActionKind,
    /// The data
    pub data_object: DataObject,
}

/// Data action kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataActionKind {
    /// Data written
    Create,
    /// Data removed
    Delete,
}

/// Data objects the indexer looks at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DataObject {
    /// Epoch change
    EpochData {
        /// New epoch
        epoch: u64,
    },
    /// Round change
    RoundData {
        /// Round in epoch
        round: u64,
        /// Round timestamp (ms since Unix epoch), 0 if unknown
        timestamp: i64,
    },
    /// Validator proposal counters
    ValidatorBftData {
        /// Proposals completed this epoch
        proposals_completed: u64,
        /// Proposals missed this epoch
        proposals_missed: u64,
    },
    /// Token definition
    TokenData {
        /// Granularity in sub-units
        granularity: String,
        /// Whether the supply is mutable
        is_mutable: bool,
        /// Owner of a mutable token
        #[serde(default)]
        owner: Option<EntityIdentifier>,
    },
    /// Any other data, not modelled by the indexer
    #[serde(other)]
    Other,
}

/// Fee, signer, message and raw payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionMetadata {
    /// Fee paid, as a sub-unit string
    pub fee: String,
    /// Signer public key (hex)
    #[serde(default)]
    pub signed_by: Option<String>,
    /// Attached message (hex)
    #[serde(default)]
    pub message: Option<String>,
    /// Raw transaction payload (hex)
    pub hex: String,
    /// Proposer timestamp (ms since Unix epoch)
    #[serde(default)]
    pub timestamp: i64,
}

// ----------------------------------------------------------------------------
// Persisted rows (output)
// ----------------------------------------------------------------------------

/// One row per committed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    /// Resultant state version
    pub state_version: u64,
    /// Transaction identifier hash
    #[serde(with = "serde_bytes")]
    pub transaction_identifier_hash: Vec<u8>,
    /// Transaction accumulator
    #[serde(with = "serde_bytes")]
    pub transaction_accumulator: Vec<u8>,
    /// Epoch
    pub epoch: u64,
    /// Index in epoch
    pub index_in_epoch: i64,
    /// Round in epoch
    pub round_in_epoch: u64,
    /// Whether this transaction ends the epoch
    pub is_end_of_epoch: bool,
    /// Fee paid
    pub fee_paid: TokenAmount,
    /// Signer public key
    pub signed_by: Option<Vec<u8>>,
    /// Message bytes
    pub message: Option<Vec<u8>>,
    /// Raw payload
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Account that paid the fee, from the transaction's PayXrd action
    pub fee_payer: Option<String>,
    /// Round timestamp (ms since Unix epoch)
    pub round_timestamp_ms: i64,
    /// Round timestamp, clamped to be monotonic and not in the future (ms since Unix epoch)
    pub normalized_round_timestamp_ms: i64,
}

impl LedgerTransaction {
    /// Transactions with no fee are proposed by the system
    pub fn is_system_transaction(&self) -> bool {
        self.fee_paid.is_zero()
    }
}

/// One row per substantive operation group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerOperationGroup {
    /// State version of the parent transaction
    pub state_version: u64,
    /// Index of the group in the transaction
    pub operation_group_index: usize,
    /// What the group did, if it could be classified
    pub inferred_action: Option<InferredAction>,
}

/// One row per account a transaction touched or was signed by
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountTransaction {
    /// Account
    pub account_address: String,
    /// State version of the transaction
    pub state_version: u64,
    /// The account paid the transaction's fee
    pub is_fee_payer: bool,
    /// The account's key signed the transaction
    pub is_signer: bool,
}

/// Proposal counters of a validator in one epoch, as of the latest BFT data seen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorProposalRecord {
    /// Validator
    pub validator_address: String,
    /// Epoch the counters are for
    pub epoch: u64,
    /// Proposals completed
    pub proposals_completed: u64,
    /// Proposals missed
    pub proposals_missed: u64,
    /// State version of the transaction that last updated the counters
    pub last_updated_state_version: u64,
}
