//! Substates
//!
//! A substate is a versioned fact that is either Up (exists) or Down
//! (consumed), modelled like a UTXO. Each kind carries its own payload.
//!
//! - An identifier may be upped at most once
//! - Downing requires a prior up, unless the identifier is virtual
//! - The down amount is the negation of the up amount

use crate::{
    error::{Error, Result},
    types::{OperationRef, TokenAmount},
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Concrete substate kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SubstateKind {
    /// Token balance of an account
    AccountResourceBalance,
    /// Native token an account has prepared to stake, or is unstaking
    AccountXrdStakeBalance,
    /// Native token staked to a validator
    ValidatorStakeBalance,
    /// Stake ownership units held by an account
    AccountStakeOwnershipBalance,
}

impl SubstateKind {
    /// All kinds, in storage tag order
    pub const ALL: [SubstateKind; 4] = [
        SubstateKind::AccountResourceBalance,
        SubstateKind::AccountXrdStakeBalance,
        SubstateKind::ValidatorStakeBalance,
        SubstateKind::AccountStakeOwnershipBalance,
    ];

    /// Single-byte storage tag
    pub fn tag(self) -> u8 {
        match self {
            SubstateKind::AccountResourceBalance => 1,
            SubstateKind::AccountXrdStakeBalance => 2,
            SubstateKind::ValidatorStakeBalance => 3,
            SubstateKind::AccountStakeOwnershipBalance => 4,
        }
    }
}

impl fmt::Display for SubstateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Whether native token stake is being prepared or is exiting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XrdStakeType {
    /// Prepared stake, applied at the next epoch
    PreparedStake,
    /// Unstaked, locked until an unlock epoch
    ExitingStake,
}

/// Whether stake ownership units are held or being unstaked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StakeOwnershipType {
    /// Units held
    Staked,
    /// Units prepared for unstaking at the next epoch
    PreparingUnstake,
}

/// Substate payload, per kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Substate {
    /// Token balance of an account
    AccountResourceBalance {
        /// Owning account
        account_address: String,
        /// Token rri
        rri: String,
        /// Amount (negative when describing a down)
        amount: TokenAmount,
    },
    /// Native token stake of an account
    AccountXrdStakeBalance {
        /// Owning account
        account_address: String,
        /// Validator the stake is towards
        validator_address: String,
        /// Prepared or exiting
        stake_type: XrdStakeType,
        /// Unlock epoch, for exiting stake
        epoch_unlock: Option<u64>,
        /// Amount
        amount: TokenAmount,
    },
    /// Native token stake of a validator
    ValidatorStakeBalance {
        /// Validator
        validator_address: String,
        /// Epoch the substate was written in, kept for history
        epoch: u64,
        /// Amount
        amount: TokenAmount,
    },
    /// Stake ownership units of an account
    AccountStakeOwnershipBalance {
        /// Owning account
        account_address: String,
        /// Validator the units are in
        validator_address: String,
        /// Held or being unstaked
        ownership_type: StakeOwnershipType,
        /// Amount
        amount: TokenAmount,
    },
}

impl Substate {
    /// Kind of the payload
    pub fn kind(&self) -> SubstateKind {
        match self {
            Substate::AccountResourceBalance { .. } => SubstateKind::AccountResourceBalance,
            Substate::AccountXrdStakeBalance { .. } => SubstateKind::AccountXrdStakeBalance,
            Substate::ValidatorStakeBalance { .. } => SubstateKind::ValidatorStakeBalance,
            Substate::AccountStakeOwnershipBalance { .. } => SubstateKind::AccountStakeOwnershipBalance,
        }
    }

    /// Amount carried by the payload
    pub fn amount(&self) -> TokenAmount {
        match self {
            Substate::AccountResourceBalance { amount, .. }
            | Substate::AccountXrdStakeBalance { amount, .. }
            | Substate::ValidatorStakeBalance { amount, .. }
            | Substate::AccountStakeOwnershipBalance { amount, .. } => *amount,
        }
    }

    /// Same payload carrying a different amount
    pub fn with_amount(&self, new_amount: TokenAmount) -> Substate {
        let mut substate = self.clone();
        match &mut substate {
            Substate::AccountResourceBalance { amount, .. }
            | Substate::AccountXrdStakeBalance { amount, .. }
            | Substate::ValidatorStakeBalance { amount, .. }
            | Substate::AccountStakeOwnershipBalance { amount, .. } => *amount = new_amount,
        }
        substate
    }

    /// Does this (upped) substate match `down`, the substate described by a shutdown operation?
    ///
    /// Down operations carry the negated amount. A validator stake's epoch is
    /// not part of the substate and is not compared.
    pub fn matches_down(&self, down: &Substate) -> bool {
        match (self, down) {
            (
                Substate::AccountResourceBalance {
                    account_address,
                    rri,
                    amount,
                },
                Substate::AccountResourceBalance {
                    account_address: down_account,
                    rri: down_rri,
                    amount: down_amount,
                },
            ) => account_address == down_account && rri == down_rri && *amount == -*down_amount,
            (
                Substate::AccountXrdStakeBalance {
                    account_address,
                    validator_address,
                    stake_type,
                    epoch_unlock,
                    amount,
                },
                Substate::AccountXrdStakeBalance {
                    account_address: down_account,
                    validator_address: down_validator,
                    stake_type: down_type,
                    epoch_unlock: down_unlock,
                    amount: down_amount,
                },
            ) => {
                account_address == down_account
                    && validator_address == down_validator
                    && stake_type == down_type
                    && epoch_unlock == down_unlock
                    && *amount == -*down_amount
            }
            (
                Substate::ValidatorStakeBalance {
                    validator_address,
                    amount,
                    ..
                },
                Substate::ValidatorStakeBalance {
                    validator_address: down_validator,
                    amount: down_amount,
                    ..
                },
            ) => validator_address == down_validator && *amount == -*down_amount,
            (
                Substate::AccountStakeOwnershipBalance {
                    account_address,
                    validator_address,
                    ownership_type,
                    amount,
                },
                Substate::AccountStakeOwnershipBalance {
                    account_address: down_account,
                    validator_address: down_validator,
                    ownership_type: down_type,
                    amount: down_amount,
                },
            ) => {
                account_address == down_account
                    && validator_address == down_validator
                    && ownership_type == down_type
                    && *amount == -*down_amount
            }
            _ => false,
        }
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubstateState {
    /// Exists and can be consumed
    Up,
    /// Consumed
    Down,
}

/// A persisted substate with its lifecycle locators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstateRecord {
    /// Opaque identifier
    #[serde(with = "serde_bytes")]
    pub identifier: Vec<u8>,
    /// Payload
    pub substate: Substate,
    /// Operation which booted the substate up
    pub up: OperationRef,
    /// Operation which shut the substate down
    pub down: Option<OperationRef>,
}

impl SubstateRecord {
    /// Current state
    pub fn state(&self) -> SubstateState {
        if self.down.is_some() {
            SubstateState::Down
        } else {
            SubstateState::Up
        }
    }

    /// Kind of the payload
    pub fn kind(&self) -> SubstateKind {
        self.substate.kind()
    }

    /// Storage key: kind tag followed by the identifier
    pub fn storage_key(kind: SubstateKind, identifier: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(identifier.len() + 1);
        key.push(kind.tag());
        key.extend_from_slice(identifier);
        key
    }
}

/// Decides which identifiers denote implicitly existing, zero-valued substates
pub trait VirtualSubstatePolicy: Send + Sync {
    /// Can `identifier` be downed without ever having been upped?
    fn is_virtual(&self, kind: SubstateKind, identifier: &[u8]) -> bool;
}

/// Identifiers starting with one of a set of byte prefixes are virtual
#[derive(Debug, Clone, Default)]
pub struct PrefixVirtualSubstatePolicy {
    prefixes: Vec<Vec<u8>>,
}

impl PrefixVirtualSubstatePolicy {
    /// Policy from raw prefixes
    pub fn new(prefixes: Vec<Vec<u8>>) -> Self {
        Self { prefixes }
    }

    /// Policy from hex-encoded prefixes
    pub fn from_hex_prefixes<S: AsRef<str>>(prefixes: &[S]) -> Result<Self> {
        let prefixes = prefixes
            .iter()
            .map(|prefix| {
                let prefix: &str = prefix.as_ref();
                hex::decode(prefix)
                    .map_err(|e| Error::Config(format!("Invalid virtual identifier prefix {}: {}", prefix, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(prefixes))
    }
}

impl VirtualSubstatePolicy for PrefixVirtualSubstatePolicy {
    fn is_virtual(&self, _kind: SubstateKind, identifier: &[u8]) -> bool {
        self.prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && identifier.starts_with(prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balance(amount: i64) -> Substate {
        Substate::AccountResourceBalance {
            account_address: "rdx1a".into(),
            rri: "xrd_rr1".into(),
            amount: TokenAmount::from_sub_units(amount),
        }
    }

    #[test]
    fn test_down_must_negate_up() {
        assert!(balance(100).matches_down(&balance(-100)));
        assert!(!balance(100).matches_down(&balance(100)));
        assert!(!balance(100).matches_down(&balance(-99)));
    }

    #[test]
    fn test_kinds_never_match_each_other() {
        let validator = Substate::ValidatorStakeBalance {
            validator_address: "rv1v".into(),
            epoch: 3,
            amount: TokenAmount::from_sub_units(100),
        };
        assert!(!balance(100).matches_down(&validator));
    }

    #[test]
    fn test_validator_epoch_is_not_compared() {
        let up = Substate::ValidatorStakeBalance {
            validator_address: "rv1v".into(),
            epoch: 3,
            amount: TokenAmount::from_sub_units(100),
        };
        let down = Substate::ValidatorStakeBalance {
            validator_address: "rv1v".into(),
            epoch: 9,
            amount: TokenAmount::from_sub_units(-100),
        };
        assert!(up.matches_down(&down));
    }

    #[test]
    fn test_storage_key_is_tagged() {
        let key = SubstateRecord::storage_key(SubstateKind::ValidatorStakeBalance, &[0xab, 0xcd]);
        assert_eq!(key, vec![3, 0xab, 0xcd]);
    }

    #[test]
    fn test_prefix_policy() {
        let policy = PrefixVirtualSubstatePolicy::from_hex_prefixes(&["ff00"]).unwrap();
        assert!(policy.is_virtual(SubstateKind::AccountResourceBalance, &[0xff, 0x00, 0x01]));
        assert!(!policy.is_virtual(SubstateKind::AccountResourceBalance, &[0xff, 0x01]));
        assert!(!PrefixVirtualSubstatePolicy::default().is_virtual(SubstateKind::AccountResourceBalance, &[0xff]));
        assert!(PrefixVirtualSubstatePolicy::from_hex_prefixes(&["zz"]).is_err());
    }
}
