//! Entities and resources
//!
//! An [`Entity`] is the ledger principal an operation acts on, resolved from
//! the raw [`EntityIdentifier`] carried by the operation. Entities are
//! transient: they live for the duration of one transaction's processing.
//!
//! A [`ResourceIdentifier`] names the axis of a balance: a token, or the
//! stake ownership units of a validator.

use crate::config::NetworkConfig;
use bech32::ToBase32;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sub-entity name for stake waiting to be applied at the next epoch
pub const SUB_ENTITY_PREPARED_STAKES: &str = "prepared_stakes";
/// Sub-entity name for unstake waiting to be applied at the next epoch
pub const SUB_ENTITY_PREPARED_UNSTAKES: &str = "prepared_unstakes";
/// Sub-entity name for unstaked tokens locked until an epoch
pub const SUB_ENTITY_EXITING_UNSTAKES: &str = "exiting_unstakes";
/// Sub-entity name for a validator's system balance, and the system address
pub const SYSTEM: &str = "system";

/// What a balance is denominated in
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceIdentifier {
    /// A token, by its resource identifier
    Token {
        /// Radix resource identifier
        rri: String,
    },
    /// Stake ownership units in a validator
    StakeOwnership {
        /// Validator the units belong to
        validator_address: String,
    },
}

impl ResourceIdentifier {
    /// Token resource
    pub fn token(rri: impl Into<String>) -> Self {
        ResourceIdentifier::Token { rri: rri.into() }
    }

    /// Stake ownership resource
    pub fn stake_ownership(validator_address: impl Into<String>) -> Self {
        ResourceIdentifier::StakeOwnership {
            validator_address: validator_address.into(),
        }
    }

    /// The rri, if this is a token
    pub fn token_rri(&self) -> Option<&str> {
        match self {
            ResourceIdentifier::Token { rri } => Some(rri),
            ResourceIdentifier::StakeOwnership { .. } => None,
        }
    }
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceIdentifier::Token { rri } => write!(f, "token {}", rri),
            ResourceIdentifier::StakeOwnership { validator_address } => {
                write!(f, "stake ownership of {}", validator_address)
            }
        }
    }
}

/// Raw entity identifier, as carried by an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityIdentifier {
    /// Account, validator, resource or system address
    pub address: String,
    /// Optional sub-entity of the address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_entity: Option<SubEntity>,
}

impl EntityIdentifier {
    /// Identifier without a sub-entity
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            sub_entity: None,
        }
    }

    /// Identifier with a sub-entity
    pub fn with_sub_entity(
        address: impl Into<String>,
        sub_entity: impl Into<String>,
        metadata: Option<SubEntityMetadata>,
    ) -> Self {
        Self {
            address: address.into(),
            sub_entity: Some(SubEntity {
                address: sub_entity.into(),
                metadata,
            }),
        }
    }
}

/// Sub-entity of an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubEntity {
    /// Sub-entity name, e.g. `prepared_stakes`
    pub address: String,
    /// Extra information the sub-entity needs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SubEntityMetadata>,
}

/// Sub-entity metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubEntityMetadata {
    /// Validator a stake sub-entity refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator_address: Option<String>,
    /// Epoch an exiting stake unlocks at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch_unlock: Option<u64>,
}

/// Kind of a resolved entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    /// Plain account
    Account,
    /// Stake an account has prepared, applied at the next epoch
    AccountPreparedStake,
    /// Unstake an account has prepared, applied at the next epoch
    AccountPreparedUnstake,
    /// Unstaked tokens locked until an epoch
    AccountExitingStake,
    /// Validator
    Validator,
    /// A validator's system-owned stake pool
    ValidatorSystem,
    /// The system
    System,
    /// A resource
    Resource,
}

/// A resolved ledger principal
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Entity {
    /// Plain account
    Account {
        /// Account address
        account_address: String,
    },
    /// Prepared stake of an account towards a validator
    AccountPreparedStake {
        /// Staking account
        account_address: String,
        /// Validator staked to
        validator_address: String,
    },
    /// Prepared unstake of an account
    AccountPreparedUnstake {
        /// Unstaking account
        account_address: String,
    },
    /// Exiting stake of an account
    AccountExitingStake {
        /// Unstaking account
        account_address: String,
        /// Validator unstaked from
        validator_address: String,
        /// Epoch the stake unlocks at
        epoch_unlock: u64,
    },
    /// Validator
    Validator {
        /// Validator address
        validator_address: String,
    },
    /// System stake pool of a validator
    ValidatorSystem {
        /// Validator address
        validator_address: String,
    },
    /// The system
    System,
    /// A resource
    Resource {
        /// Resource identifier
        rri: String,
    },
}

impl Entity {
    /// Plain account
    pub fn account(address: impl Into<String>) -> Self {
        Entity::Account {
            account_address: address.into(),
        }
    }

    /// Kind of the entity
    pub fn entity_type(&self) -> EntityType {
        match self {
            Entity::Account { .. } => EntityType::Account,
            Entity::AccountPreparedStake { .. } => EntityType::AccountPreparedStake,
            Entity::AccountPreparedUnstake { .. } => EntityType::AccountPreparedUnstake,
            Entity::AccountExitingStake { .. } => EntityType::AccountExitingStake,
            Entity::Validator { .. } => EntityType::Validator,
            Entity::ValidatorSystem { .. } => EntityType::ValidatorSystem,
            Entity::System => EntityType::System,
            Entity::Resource { .. } => EntityType::Resource,
        }
    }

    /// The account this entity belongs to, if any
    pub fn account_address(&self) -> Option<&str> {
        match self {
            Entity::Account { account_address }
            | Entity::AccountPreparedStake { account_address, .. }
            | Entity::AccountPreparedUnstake { account_address }
            | Entity::AccountExitingStake { account_address, .. } => Some(account_address),
            _ => None,
        }
    }

    /// The validator this entity refers to, if any
    pub fn validator_address(&self) -> Option<&str> {
        match self {
            Entity::AccountPreparedStake { validator_address, .. }
            | Entity::AccountExitingStake { validator_address, .. }
            | Entity::Validator { validator_address }
            | Entity::ValidatorSystem { validator_address } => Some(validator_address),
            _ => None,
        }
    }

    /// Unlock epoch of an exiting stake
    pub fn epoch_unlock(&self) -> Option<u64> {
        match self {
            Entity::AccountExitingStake { epoch_unlock, .. } => Some(*epoch_unlock),
            _ => None,
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Account { account_address } => write!(f, "{}", account_address),
            Entity::AccountPreparedStake {
                account_address,
                validator_address,
            } => write!(f, "{}/prepared_stakes/{}", account_address, validator_address),
            Entity::AccountPreparedUnstake { account_address } => {
                write!(f, "{}/prepared_unstakes", account_address)
            }
            Entity::AccountExitingStake {
                account_address,
                validator_address,
                epoch_unlock,
            } => write!(
                f,
                "{}/exiting_unstakes/{}@{}",
                account_address, validator_address, epoch_unlock
            ),
            Entity::Validator { validator_address } => write!(f, "{}", validator_address),
            Entity::ValidatorSystem { validator_address } => write!(f, "{}/system", validator_address),
            Entity::System => write!(f, "system"),
            Entity::Resource { rri } => write!(f, "{}", rri),
        }
    }
}

/// Length of a compressed secp256k1 public key
pub const COMPRESSED_PUBLIC_KEY_LENGTH: usize = 33;

/// Leading byte of the data of a public key account address
const ACCOUNT_ADDRESS_PUBLIC_KEY_TYPE: u8 = 0x04;

/// Bech32 account address of a compressed public key, `None` for anything else
pub fn account_address_from_public_key(account_hrp: &str, public_key: &[u8]) -> Option<String> {
    if public_key.len() != COMPRESSED_PUBLIC_KEY_LENGTH {
        return None;
    }
    let mut data = Vec::with_capacity(COMPRESSED_PUBLIC_KEY_LENGTH + 1);
    data.push(ACCOUNT_ADDRESS_PUBLIC_KEY_TYPE);
    data.extend_from_slice(public_key);
    bech32::encode(account_hrp, data.to_base32(), bech32::Variant::Bech32).ok()
}

/// Maps raw entity identifiers to entities
pub trait EntityResolver: Send + Sync {
    /// `None` when the identifier does not describe a known entity shape
    fn resolve(&self, identifier: &EntityIdentifier) -> Option<Entity>;

    /// Account address owned by a signer's public key, `None` if the key is malformed
    fn signer_account_address(&self, public_key: &[u8]) -> Option<String>;
}

/// Resolves entities from address prefixes (human readable parts)
#[derive(Debug, Clone)]
pub struct AddressEntityResolver {
    account_hrp: String,
    account_prefix: String,
    validator_prefix: String,
    resource_marker: String,
}

impl AddressEntityResolver {
    /// Create a resolver for the given HRPs
    pub fn new(account_hrp: &str, validator_hrp: &str, resource_hrp_suffix: &str) -> Self {
        Self {
            account_hrp: account_hrp.to_string(),
            account_prefix: format!("{}1", account_hrp),
            validator_prefix: format!("{}1", validator_hrp),
            resource_marker: format!("{}1", resource_hrp_suffix),
        }
    }

    /// Create a resolver from network configuration
    pub fn from_config(network: &NetworkConfig) -> Self {
        Self::new(
            &network.account_hrp,
            &network.validator_hrp,
            &network.resource_hrp_suffix,
        )
    }

    fn resolve_account(&self, address: &str, sub_entity: Option<&SubEntity>) -> Option<Entity> {
        let account_address = address.to_string();
        let Some(sub_entity) = sub_entity else {
            return Some(Entity::Account { account_address });
        };
        let metadata = sub_entity.metadata.clone().unwrap_or_default();

        match sub_entity.address.as_str() {
            SUB_ENTITY_PREPARED_STAKES => Some(Entity::AccountPreparedStake {
                account_address,
                validator_address: metadata.validator_address?,
            }),
            SUB_ENTITY_PREPARED_UNSTAKES => Some(Entity::AccountPreparedUnstake { account_address }),
            SUB_ENTITY_EXITING_UNSTAKES => Some(Entity::AccountExitingStake {
                account_address,
                validator_address: metadata.validator_address?,
                epoch_unlock: metadata.epoch_unlock?,
            }),
            _ => None,
        }
    }
}

impl EntityResolver for AddressEntityResolver {
    fn resolve(&self, identifier: &EntityIdentifier) -> Option<Entity> {
        let address = identifier.address.as_str();
        let sub_entity = identifier.sub_entity.as_ref();

        let resolved = if address == SYSTEM {
            sub_entity.is_none().then_some(Entity::System)
        } else if address.contains(&self.resource_marker) {
            sub_entity.is_none().then(|| Entity::Resource {
                rri: address.to_string(),
            })
        } else if address.starts_with(&self.account_prefix) {
            self.resolve_account(address, sub_entity)
        } else if address.starts_with(&self.validator_prefix) {
            let validator_address = address.to_string();
            match sub_entity.map(|s| s.address.as_str()) {
                None => Some(Entity::Validator { validator_address }),
                Some(SYSTEM) => Some(Entity::ValidatorSystem { validator_address }),
                Some(_) => None,
            }
        } else {
            None
        };

        if resolved.is_none() {
            tracing::warn!(
                address = %identifier.address,
                sub_entity = ?identifier.sub_entity.as_ref().map(|s| &s.address),
                "Entity identifier could not be resolved"
            );
        }

        resolved
    }

    fn signer_account_address(&self, public_key: &[u8]) -> Option<String> {
        account_address_from_public_key(&self.account_hrp, public_key)
    }
}

/// The single network-wide native token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeToken {
    rri: String,
}

impl NativeToken {
    /// Native token with the given rri
    pub fn new(rri: impl Into<String>) -> Self {
        Self { rri: rri.into() }
    }

    /// The native token's rri
    pub fn rri(&self) -> &str {
        &self.rri
    }

    /// The native token as a resource
    pub fn resource(&self) -> ResourceIdentifier {
        ResourceIdentifier::token(self.rri.clone())
    }

    /// Is the rri the native token
    pub fn is_native_rri(&self, rri: &str) -> bool {
        self.rri == rri
    }

    /// Is the resource the native token
    pub fn is_native_resource(&self, resource: &ResourceIdentifier) -> bool {
        resource.token_rri().map_or(false, |rri| self.is_native_rri(rri))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> AddressEntityResolver {
        AddressEntityResolver::new("rdx", "rv", "_rr")
    }

    #[test]
    fn test_resolve_plain_entities() {
        let resolver = resolver();

        assert_eq!(
            resolver.resolve(&EntityIdentifier::new("rdx1qsp")),
            Some(Entity::account("rdx1qsp"))
        );
        assert_eq!(
            resolver.resolve(&EntityIdentifier::new("rv1qf2")),
            Some(Entity::Validator {
                validator_address: "rv1qf2".into()
            })
        );
        assert_eq!(
            resolver.resolve(&EntityIdentifier::new("xrd_rr1qy5")),
            Some(Entity::Resource {
                rri: "xrd_rr1qy5".into()
            })
        );
        assert_eq!(resolver.resolve(&EntityIdentifier::new("system")), Some(Entity::System));
    }

    #[test]
    fn test_resolve_sub_entities() {
        let resolver = resolver();
        let metadata = SubEntityMetadata {
            validator_address: Some("rv1qf2".into()),
            epoch_unlock: Some(12),
        };

        let stake = EntityIdentifier::with_sub_entity("rdx1qsp", "prepared_stakes", Some(metadata.clone()));
        assert_eq!(
            resolver.resolve(&stake).map(|e| e.entity_type()),
            Some(EntityType::AccountPreparedStake)
        );

        let exiting = EntityIdentifier::with_sub_entity("rdx1qsp", "exiting_unstakes", Some(metadata));
        let entity = resolver.resolve(&exiting).unwrap();
        assert_eq!(entity.epoch_unlock(), Some(12));
        assert_eq!(entity.account_address(), Some("rdx1qsp"));
        assert_eq!(entity.validator_address(), Some("rv1qf2"));

        let unstake = EntityIdentifier::with_sub_entity("rdx1qsp", "prepared_unstakes", None);
        assert_eq!(
            resolver.resolve(&unstake),
            Some(Entity::AccountPreparedUnstake {
                account_address: "rdx1qsp".into()
            })
        );

        let validator_system = EntityIdentifier::with_sub_entity("rv1qf2", "system", None);
        assert_eq!(
            resolver.resolve(&validator_system).map(|e| e.entity_type()),
            Some(EntityType::ValidatorSystem)
        );
    }

    #[test]
    fn test_unresolvable_shapes() {
        let resolver = resolver();

        assert_eq!(resolver.resolve(&EntityIdentifier::new("tdx1abc")), None);
        // prepared stake without its validator
        let stake = EntityIdentifier::with_sub_entity("rdx1qsp", "prepared_stakes", None);
        assert_eq!(resolver.resolve(&stake), None);
        let unknown = EntityIdentifier::with_sub_entity("rdx1qsp", "vault", None);
        assert_eq!(resolver.resolve(&unknown), None);
    }

    #[test]
    fn test_native_token() {
        let native = NativeToken::new("xrd_rr1qy5");
        assert!(native.is_native_resource(&ResourceIdentifier::token("xrd_rr1qy5")));
        assert!(!native.is_native_resource(&ResourceIdentifier::token("foo_rr1abc")));
        assert!(!native.is_native_resource(&ResourceIdentifier::stake_ownership("rv1qf2")));
    }

    #[test]
    fn test_resource_identifier_json() {
        let json = serde_json::to_string(&ResourceIdentifier::token("xrd_rr1qy5")).unwrap();
        assert_eq!(json, r#"{"Token":{"rri":"xrd_rr1qy5"}}"#);
        let back: ResourceIdentifier =
            serde_json::from_str(r#"{"StakeOwnership":{"validator_address":"rv1qf2"}}"#).unwrap();
        assert_eq!(back, ResourceIdentifier::stake_ownership("rv1qf2"));
    }

    #[test]
    fn test_signer_account_address() {
        let resolver = resolver();
        let key = [0x02; COMPRESSED_PUBLIC_KEY_LENGTH];

        let address = resolver.signer_account_address(&key).unwrap();
        assert!(address.starts_with("rdx1"));
        assert_eq!(resolver.resolve(&EntityIdentifier::new(address.clone())), Some(Entity::account(address.clone())));

        let (hrp, data, variant) = bech32::decode(&address).unwrap();
        assert_eq!(hrp, "rdx");
        assert_eq!(variant, bech32::Variant::Bech32);
        let bytes = <Vec<u8> as bech32::FromBase32>::from_base32(&data).unwrap();
        assert_eq!(bytes[0], 0x04);
        assert_eq!(&bytes[1..], &key[..]);

        assert_eq!(resolver.signer_account_address(&[0x02, 0xab]), None);
    }
}
