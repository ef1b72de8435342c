//! Balance accounting and action inference
//!
//! An [`Accounting`] scope (one operation group) accumulates signed deltas
//! per (entity, resource) and records token definitions created in it.
//! [`Accounting::infer_action`] then classifies the net movement as a
//! human-meaningful [`InferredAction`], or leaves it unclassified.
//!
//! Any delta shape the rules do not allow is fatal: nothing is coerced.

use crate::{
    entity::{Entity, EntityType, NativeToken, ResourceIdentifier},
    error::{Error, Result},
    history::ValidatorStakeSnapshot,
    types::{TokenAmount, TransactionOpLocator},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Supplies the latest known stake totals of a validator
pub trait ValidatorStakeLookup {
    /// Latest snapshot, or the empty snapshot if the validator has no stake history
    fn validator_stake(&self, validator_address: &str) -> ValidatorStakeSnapshot;
}

/// Classification of an operation group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InferredActionType {
    /// Tokens moved between two accounts
    SimpleTransfer,
    /// Native token staked to a validator
    StakeTokens,
    /// Stake ownership units unstaked from a validator
    UnstakeTokens,
    /// Non-native tokens minted
    MintTokens,
    /// Native token minted
    MintXrd,
    /// Non-native tokens burned
    BurnTokens,
    /// Native token burned as a fee
    PayXrd,
    /// A token definition was created
    CreateTokenDefinition,
    /// Several movements not decomposed further
    Complex,
}

/// What an operation group did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferredAction {
    /// Classification
    pub action_type: InferredActionType,
    /// Account (or validator, for unstakes) the amount came from
    pub from_address: Option<String>,
    /// Account (or validator, for stakes) the amount went to
    pub to_address: Option<String>,
    /// Amount moved
    pub amount: TokenAmount,
    /// Resource moved
    pub resource: Option<ResourceIdentifier>,
}

impl InferredAction {
    /// Unclassified fan-in or fan-out
    pub fn complex() -> Self {
        Self {
            action_type: InferredActionType::Complex,
            from_address: None,
            to_address: None,
            amount: TokenAmount::ZERO,
            resource: None,
        }
    }

    fn new(
        action_type: InferredActionType,
        from_address: Option<&str>,
        to_address: Option<&str>,
        amount: TokenAmount,
        resource: ResourceIdentifier,
    ) -> Self {
        Self {
            action_type,
            from_address: from_address.map(str::to_string),
            to_address: to_address.map(str::to_string),
            amount,
            resource: Some(resource),
        }
    }
}

struct AccountingEntry<'a> {
    entity: &'a Entity,
    resource: &'a ResourceIdentifier,
    delta: TokenAmount,
}

/// Delta tracker for one scope
#[derive(Debug, Clone)]
pub struct Accounting {
    native_token: Arc<NativeToken>,
    tracked_totals: BTreeMap<(Entity, ResourceIdentifier), TokenAmount>,
    created_tokens: BTreeSet<String>,
}

impl Accounting {
    /// New, empty scope
    pub fn new(native_token: Arc<NativeToken>) -> Self {
        Self {
            native_token,
            tracked_totals: BTreeMap::new(),
            created_tokens: BTreeSet::new(),
        }
    }

    /// Add a signed delta for `entity` in `resource`
    pub fn track_delta(
        &mut self,
        locator: &TransactionOpLocator,
        entity: &Entity,
        resource: &ResourceIdentifier,
        delta: TokenAmount,
    ) -> Result<()> {
        let total = self
            .tracked_totals
            .entry((entity.clone(), resource.clone()))
            .or_insert(TokenAmount::ZERO);
        *total = total.checked_add(delta).ok_or_else(|| {
            Error::invalid_transaction(
                locator.clone(),
                format!("Balance delta of {} in {} overflowed", entity, resource),
            )
        })?;
        Ok(())
    }

    /// Record that the token `rri` was defined in this scope
    pub fn track_token_creation(&mut self, rri: impl Into<String>) {
        self.created_tokens.insert(rri.into());
    }

    /// Net non-zero deltas
    pub fn total_changes(&self) -> impl Iterator<Item = (&Entity, &ResourceIdentifier, TokenAmount)> {
        self.tracked_totals
            .iter()
            .filter(|(_, delta)| !delta.is_zero())
            .map(|((entity, resource), delta)| (entity, resource, *delta))
    }

    /// Classify the scope's net balance movements.
    ///
    /// `Ok(None)` means the scope moved nothing, or moved it in a shape that
    /// is deliberately left unclassified.
    pub fn infer_action(
        &self,
        is_system_transaction: bool,
        locator: &TransactionOpLocator,
        stake_lookup: &dyn ValidatorStakeLookup,
    ) -> Result<Option<InferredAction>> {
        let fail = |message: &str| Err(Error::invalid_transaction(locator.clone(), message));

        let entries = self.tracked_totals.iter().map(|((entity, resource), delta)| AccountingEntry {
            entity,
            resource,
            delta: *delta,
        });
        let (withdrawals, deposits): (Vec<_>, Vec<_>) = entries
            .filter(|entry| !entry.delta.is_zero())
            .partition(|entry| entry.delta.is_negative());

        if !self.created_tokens.is_empty() {
            return self.infer_token_creation(locator, &withdrawals, &deposits).map(Some);
        }

        match (withdrawals.len(), deposits.len()) {
            (0, 0) => return Ok(None),
            (w, _) if w > 1 => {
                if is_system_transaction {
                    return Ok(Some(InferredAction::complex()));
                }
                return fail("Invalid operation group in non-system transaction with multiple vault withdrawals");
            }
            (_, d) if d > 1 => return Ok(Some(InferredAction::complex())),
            (0, 1) => {
                let mint = &deposits[0];
                let ResourceIdentifier::Token { rri } = mint.resource else {
                    return Ok(None);
                };
                if mint.entity.entity_type() != EntityType::Account {
                    return fail("Token minted to non-account");
                }
                let action_type = if self.native_token.is_native_rri(rri) {
                    InferredActionType::MintXrd
                } else {
                    InferredActionType::MintTokens
                };
                return Ok(Some(InferredAction::new(
                    action_type,
                    None,
                    mint.entity.account_address(),
                    mint.delta,
                    mint.resource.clone(),
                )));
            }
            (1, 0) => {
                let burn = &withdrawals[0];
                let ResourceIdentifier::Token { rri } = burn.resource else {
                    return Ok(None);
                };
                if burn.entity.entity_type() != EntityType::Account {
                    return fail("Token burned from non-account");
                }
                let action_type = if self.native_token.is_native_rri(rri) {
                    InferredActionType::PayXrd
                } else {
                    InferredActionType::BurnTokens
                };
                return Ok(Some(InferredAction::new(
                    action_type,
                    burn.entity.account_address(),
                    None,
                    -burn.delta,
                    burn.resource.clone(),
                )));
            }
            _ => {}
        }

        // Exactly one withdrawal and one deposit
        let sender = withdrawals[0].entity;
        let recipient = deposits[0].entity;
        let sent_resource = withdrawals[0].resource;
        let received_resource = deposits[0].resource;
        let sent_amount = -withdrawals[0].delta;
        let received_amount = deposits[0].delta;

        match (sender.entity_type(), recipient.entity_type()) {
            (sender_type, EntityType::AccountPreparedStake) => {
                if sender_type != EntityType::Account {
                    return fail("Prepared stake from non-account");
                }
                if !self.native_token.is_native_resource(sent_resource) {
                    return fail("Prepared stake using non-native resource");
                }
                Ok(Some(InferredAction::new(
                    InferredActionType::StakeTokens,
                    sender.account_address(),
                    recipient.validator_address(),
                    sent_amount,
                    self.native_token.resource(),
                )))
            }
            (sender_type, EntityType::AccountPreparedUnstake) => {
                if sender_type != EntityType::Account {
                    return fail("Prepared unstake from non-account");
                }
                if sent_resource != received_resource {
                    return fail("Prepared unstake send and receive resources aren't equal");
                }
                if sent_amount != received_amount {
                    return fail("Prepared unstake send and receive amounts weren't equal");
                }
                let ResourceIdentifier::StakeOwnership { validator_address } = sent_resource else {
                    return fail("Prepared unstake using non stake ownership resource");
                };
                let xrd_estimate = stake_lookup
                    .validator_stake(validator_address)
                    .estimate_xrd_conversion(sent_amount);
                Ok(Some(InferredAction::new(
                    InferredActionType::UnstakeTokens,
                    Some(validator_address.as_str()),
                    sender.account_address(),
                    xrd_estimate,
                    self.native_token.resource(),
                )))
            }
            (EntityType::Account, EntityType::Account) => {
                if sent_amount != received_amount {
                    return fail("Transfer send and receive amounts weren't equal");
                }
                if !matches!(sent_resource, ResourceIdentifier::Token { .. }) {
                    return fail("Cannot transfer non-token");
                }
                Ok(Some(InferredAction::new(
                    InferredActionType::SimpleTransfer,
                    sender.account_address(),
                    recipient.account_address(),
                    sent_amount,
                    sent_resource.clone(),
                )))
            }
            _ => Ok(None),
        }
    }

    fn infer_token_creation(
        &self,
        locator: &TransactionOpLocator,
        withdrawals: &[AccountingEntry<'_>],
        deposits: &[AccountingEntry<'_>],
    ) -> Result<InferredAction> {
        let fail = |message: &str| Err(Error::invalid_transaction(locator.clone(), message));

        if !withdrawals.is_empty() {
            return fail("Should be no withdrawals in token creation");
        }
        if deposits.len() > 1 {
            return fail("Should be no more than 1 account credited with tokens during token creation");
        }
        if self.created_tokens.len() > 1 {
            return fail("There should be no more than one token data created in a given operation group");
        }

        let credited = deposits.first();
        if let Some(entry) = credited {
            if entry.entity.entity_type() != EntityType::Account {
                return fail("Token creation credited to non-account");
            }
        }

        let Some(rri) = self.created_tokens.iter().next().cloned() else {
            return fail("Token creation has no token data");
        };

        Ok(InferredAction {
            action_type: InferredActionType::CreateTokenDefinition,
            from_address: None,
            to_address: credited.and_then(|e| e.entity.account_address()).map(str::to_string),
            amount: credited.map_or(TokenAmount::ZERO, |e| e.delta),
            resource: Some(ResourceIdentifier::token(rri)),
        })
    }
}
