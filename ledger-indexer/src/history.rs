//! Interval-versioned history
//!
//! A history entry records the value of a business key over a contiguous
//! range of state versions `[from_state_version, to_state_version]`. The
//! latest entry for a key is open (`to_state_version == None`); at most one
//! open entry exists per key.

use crate::types::TokenAmount;
use serde::{Deserialize, Serialize};

/// Business key a history is kept for
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HistoryKey {
    /// Balance of a token in an account
    AccountResource {
        /// Account
        account_address: String,
        /// Token rri
        rri: String,
    },
    /// Supply of a token
    ResourceSupply {
        /// Token rri
        rri: String,
    },
    /// Stake held by a validator
    ValidatorStake {
        /// Validator
        validator_address: String,
    },
    /// Stake an account holds with a validator
    AccountValidatorStake {
        /// Account
        account_address: String,
        /// Validator
        validator_address: String,
    },
}

impl HistoryKey {
    /// Storage encoding: a tag byte, then each component NUL-terminated
    pub fn encode(&self) -> Vec<u8> {
        let (tag, parts): (u8, Vec<&str>) = match self {
            HistoryKey::AccountResource { account_address, rri } => {
                (1, vec![account_address.as_str(), rri.as_str()])
            }
            HistoryKey::ResourceSupply { rri } => (2, vec![rri.as_str()]),
            HistoryKey::ValidatorStake { validator_address } => (3, vec![validator_address.as_str()]),
            HistoryKey::AccountValidatorStake {
                account_address,
                validator_address,
            } => (4, vec![account_address.as_str(), validator_address.as_str()]),
        };

        let mut key = vec![tag];
        for part in parts {
            key.extend_from_slice(part.as_bytes());
            key.push(0);
        }
        key
    }
}

/// Value of a history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryValue {
    /// Account balance
    AccountBalance(TokenAmount),
    /// Token supply
    ResourceSupply(ResourceSupply),
    /// Validator stake
    ValidatorStake(ValidatorStakeSnapshot),
    /// Stake of an account with a validator
    AccountValidatorStake(AccountValidatorStakeSnapshot),
}

/// One interval of a key's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Business key
    pub key: HistoryKey,
    /// Value over the interval
    pub value: HistoryValue,
    /// First state version the value holds at
    pub from_state_version: u64,
    /// Last state version the value holds at, `None` while open
    pub to_state_version: Option<u64>,
}

impl HistoryEntry {
    /// Is this the latest entry for its key
    pub fn is_open(&self) -> bool {
        self.to_state_version.is_none()
    }

    /// Storage key: encoded business key then the big-endian from state version
    pub fn storage_key(&self) -> Vec<u8> {
        let mut key = self.key.encode();
        key.extend_from_slice(&self.from_state_version.to_be_bytes());
        key
    }
}

/// Total supply of a token
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSupply {
    /// Current supply
    pub total_supply: TokenAmount,
    /// Everything ever minted
    pub total_minted: TokenAmount,
    /// Everything ever burned
    pub total_burned: TokenAmount,
}

impl ResourceSupply {
    /// Apply a supply change, `None` on overflow
    pub fn apply(&self, change: &ResourceSupplyChange) -> Option<ResourceSupply> {
        Some(ResourceSupply {
            total_supply: self
                .total_supply
                .checked_add(change.minted)?
                .checked_sub(change.burned)?,
            total_minted: self.total_minted.checked_add(change.minted)?,
            total_burned: self.total_burned.checked_add(change.burned)?,
        })
    }
}

/// Minted and burned amounts, both non-negative
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceSupplyChange {
    /// Amount minted
    pub minted: TokenAmount,
    /// Amount burned
    pub burned: TokenAmount,
}

impl ResourceSupplyChange {
    /// Change from a net supply delta
    pub fn from_net(net: TokenAmount) -> Self {
        if net.is_negative() {
            Self {
                minted: TokenAmount::ZERO,
                burned: -net,
            }
        } else {
            Self {
                minted: net,
                burned: TokenAmount::ZERO,
            }
        }
    }

    /// Add a net supply delta. Positive deltas are mints, negative deltas burns.
    pub fn aggregate(&mut self, net: TokenAmount) -> Option<()> {
        if net.is_positive() {
            self.minted = self.minted.checked_add(net)?;
        } else if net.is_negative() {
            self.burned = self.burned.checked_sub(net)?;
        }
        Some(())
    }

    /// Nothing minted nor burned
    pub fn is_zero(&self) -> bool {
        self.minted.is_zero() && self.burned.is_zero()
    }
}

/// Stake totals of a validator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorStakeSnapshot {
    /// Native token staked
    pub total_xrd_stake: TokenAmount,
    /// Stake ownership units issued
    pub total_stake_units: TokenAmount,
    /// Native token prepared to stake
    pub total_prepared_xrd_stake: TokenAmount,
    /// Units prepared to unstake
    pub total_prepared_unstake_units: TokenAmount,
    /// Native token exiting
    pub total_exiting_xrd_stake: TokenAmount,
}

impl ValidatorStakeSnapshot {
    /// Estimate the native token value of `stake_units` at this snapshot's exchange rate.
    ///
    /// Returns the units unchanged while no units are issued.
    pub fn estimate_xrd_conversion(&self, stake_units: TokenAmount) -> TokenAmount {
        if self.total_stake_units.is_zero() {
            return stake_units;
        }
        stake_units
            .checked_mul_div(self.total_xrd_stake, self.total_stake_units)
            .unwrap_or(stake_units)
    }

    /// Apply a change, `None` on overflow
    pub fn apply(&self, change: &ValidatorStakeChange) -> Option<ValidatorStakeSnapshot> {
        Some(ValidatorStakeSnapshot {
            total_xrd_stake: self.total_xrd_stake.checked_add(change.xrd_stake)?,
            total_stake_units: self.total_stake_units.checked_add(change.stake_units)?,
            total_prepared_xrd_stake: self
                .total_prepared_xrd_stake
                .checked_add(change.prepared_xrd_stake)?,
            total_prepared_unstake_units: self
                .total_prepared_unstake_units
                .checked_add(change.prepared_unstake_units)?,
            total_exiting_xrd_stake: self
                .total_exiting_xrd_stake
                .checked_add(change.exiting_xrd_stake)?,
        })
    }

    /// Name of the first negative total, if any
    pub fn first_negative_component(&self) -> Option<&'static str> {
        [
            ("total_xrd_stake", self.total_xrd_stake),
            ("total_stake_units", self.total_stake_units),
            ("total_prepared_xrd_stake", self.total_prepared_xrd_stake),
            ("total_prepared_unstake_units", self.total_prepared_unstake_units),
            ("total_exiting_xrd_stake", self.total_exiting_xrd_stake),
        ]
        .into_iter()
        .find(|(_, value)| value.is_negative())
        .map(|(name, _)| name)
    }
}

/// Net change to a validator's stake totals within one transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidatorStakeChange {
    /// Change in staked native token
    pub xrd_stake: TokenAmount,
    /// Change in stake ownership units
    pub stake_units: TokenAmount,
    /// Change in prepared native token stake
    pub prepared_xrd_stake: TokenAmount,
    /// Change in units prepared to unstake
    pub prepared_unstake_units: TokenAmount,
    /// Change in exiting native token
    pub exiting_xrd_stake: TokenAmount,
}

impl ValidatorStakeChange {
    /// Any component non-zero
    pub fn is_meaningful(&self) -> bool {
        !(self.xrd_stake.is_zero()
            && self.stake_units.is_zero()
            && self.prepared_xrd_stake.is_zero()
            && self.prepared_unstake_units.is_zero()
            && self.exiting_xrd_stake.is_zero())
    }
}

/// Stake totals of one account with one validator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountValidatorStakeSnapshot {
    /// Stake ownership units held
    pub total_stake_units: TokenAmount,
    /// Native token prepared to stake
    pub total_prepared_xrd_stake: TokenAmount,
    /// Units prepared to unstake
    pub total_prepared_unstake_units: TokenAmount,
    /// Native token exiting
    pub total_exiting_xrd_stake: TokenAmount,
}

impl AccountValidatorStakeSnapshot {
    /// Apply a change, `None` on overflow
    pub fn apply(&self, change: &AccountValidatorStakeChange) -> Option<AccountValidatorStakeSnapshot> {
        Some(AccountValidatorStakeSnapshot {
            total_stake_units: self.total_stake_units.checked_add(change.stake_units)?,
            total_prepared_xrd_stake: self
                .total_prepared_xrd_stake
                .checked_add(change.prepared_xrd_stake)?,
            total_prepared_unstake_units: self
                .total_prepared_unstake_units
                .checked_add(change.prepared_unstake_units)?,
            total_exiting_xrd_stake: self
                .total_exiting_xrd_stake
                .checked_add(change.exiting_xrd_stake)?,
        })
    }

    /// Name of the first negative total, if any
    pub fn first_negative_component(&self) -> Option<&'static str> {
        [
            ("total_stake_units", self.total_stake_units),
            ("total_prepared_xrd_stake", self.total_prepared_xrd_stake),
            ("total_prepared_unstake_units", self.total_prepared_unstake_units),
            ("total_exiting_xrd_stake", self.total_exiting_xrd_stake),
        ]
        .into_iter()
        .find(|(_, value)| value.is_negative())
        .map(|(name, _)| name)
    }
}

/// Net change to an account's stake with a validator within one transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountValidatorStakeChange {
    /// Change in stake ownership units
    pub stake_units: TokenAmount,
    /// Change in prepared native token stake
    pub prepared_xrd_stake: TokenAmount,
    /// Change in units prepared to unstake
    pub prepared_unstake_units: TokenAmount,
    /// Change in exiting native token
    pub exiting_xrd_stake: TokenAmount,
}

impl AccountValidatorStakeChange {
    /// Any component non-zero
    pub fn is_meaningful(&self) -> bool {
        !(self.stake_units.is_zero()
            && self.prepared_xrd_stake.is_zero()
            && self.prepared_unstake_units.is_zero()
            && self.exiting_xrd_stake.is_zero())
    }
}
