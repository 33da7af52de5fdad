//! # Address model
//!
//! Desired-state types shared by the reconciler and the readiness tracker,
//! plus the JSON resource shape the configuration store holds for each
//! address definition.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Annotation naming the broker an address has been allocated to.
pub const BROKER_ID_ANNOTATION: &str = "enmasse.io/broker-id";

// ---------------------------------------------------------------------------
// AddressType
// ---------------------------------------------------------------------------

/// The kind of routable destination an address is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    Queue,
    Topic,
    Subscription,
}

impl AddressType {
    pub fn as_str(self) -> &'static str {
        match self {
            AddressType::Queue => "queue",
            AddressType::Topic => "topic",
            AddressType::Subscription => "subscription",
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddressType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queue" => Ok(AddressType::Queue),
            "topic" => Ok(AddressType::Topic),
            "subscription" => Ok(AddressType::Subscription),
            other => Err(format!("unknown address type: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Pending,
    Active,
    Terminating,
}

/// Persisted status of an address definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressStatus {
    #[serde(default)]
    pub is_ready: bool,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// AddressSettings
// ---------------------------------------------------------------------------

/// Retention and limit settings applied on the broker before an address is created.
///
/// Absent fields are omitted from the serialized JSON, leaving the broker default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSettings {
    #[serde(rename = "maxSizeBytes", default, skip_serializing_if = "Option::is_none")]
    pub max_size_bytes: Option<u64>,
    #[serde(rename = "expiryDelay", default, skip_serializing_if = "Option::is_none")]
    pub expiry_delay_ms: Option<u64>,
    #[serde(rename = "maxDeliveryAttempts", default, skip_serializing_if = "Option::is_none")]
    pub max_delivery_attempts: Option<u32>,
    #[serde(rename = "DLA", default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_address: Option<String>,
    #[serde(rename = "expiryAddress", default, skip_serializing_if = "Option::is_none")]
    pub expiry_address: Option<String>,
}

// ---------------------------------------------------------------------------
// AddressDefinition
// ---------------------------------------------------------------------------

/// One desired address, as declared in the configuration store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressDefinition {
    /// Unique key within a desired set.
    pub address: String,
    /// Name of the store resource holding this definition.
    pub name: String,
    #[serde(rename = "type")]
    pub address_type: AddressType,
    /// Parent topic; set iff `address_type` is `Subscription`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<AddressSettings>,
    #[serde(default)]
    pub status: AddressStatus,
}

impl AddressDefinition {
    fn new(address: impl Into<String>, address_type: AddressType) -> Self {
        let address = address.into();
        Self {
            name: address.clone(),
            address,
            address_type,
            topic: None,
            plan: None,
            allocated_to: None,
            settings: None,
            status: AddressStatus::default(),
        }
    }

    pub fn queue(address: impl Into<String>) -> Self {
        Self::new(address, AddressType::Queue)
    }

    pub fn topic(address: impl Into<String>) -> Self {
        Self::new(address, AddressType::Topic)
    }

    pub fn subscription(address: impl Into<String>, topic: impl Into<String>) -> Self {
        let mut d = Self::new(address, AddressType::Subscription);
        d.topic = Some(topic.into());
        d
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = Some(plan.into());
        self
    }

    pub fn with_settings(mut self, settings: AddressSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_status(mut self, status: AddressStatus) -> Self {
        self.status = status;
        self
    }

    /// `true` once the definition has left `Pending` and is not being torn down.
    pub fn is_routable(&self) -> bool {
        !matches!(self.status.phase, Phase::Pending | Phase::Terminating)
    }
}

/// An address as the broker reports it: just enough to compare against a definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressKey {
    pub address: String,
    pub address_type: AddressType,
}

impl AddressKey {
    pub fn new(address: impl Into<String>, address_type: AddressType) -> Self {
        Self {
            address: address.into(),
            address_type,
        }
    }
}

/// Anything that identifies an address by name and type.
pub trait AddressIdentity {
    fn address(&self) -> &str;
    fn address_type(&self) -> AddressType;

    fn key(&self) -> AddressKey {
        AddressKey::new(self.address(), self.address_type())
    }
}

impl AddressIdentity for AddressDefinition {
    fn address(&self) -> &str {
        &self.address
    }
    fn address_type(&self) -> AddressType {
        self.address_type
    }
}

impl AddressIdentity for AddressKey {
    fn address(&self) -> &str {
        &self.address
    }
    fn address_type(&self) -> AddressType {
        self.address_type
    }
}

/// Address-level equivalence used when diffing desired against actual.
pub fn same_address(a: &impl AddressIdentity, b: &impl AddressIdentity) -> bool {
    a.address() == b.address() && a.address_type() == b.address_type()
}

/// Desired addresses keyed by address name.
pub type DesiredAddressSet = BTreeMap<String, AddressDefinition>;

/// Actual broker addresses keyed by address name.
pub type ActualAddressView = BTreeMap<String, AddressKey>;

/// Index a list of definitions by address. A later duplicate replaces an earlier one.
pub fn desired_set(addresses: impl IntoIterator<Item = AddressDefinition>) -> DesiredAddressSet {
    addresses
        .into_iter()
        .map(|a| (a.address.clone(), a))
        .collect()
}

// ---------------------------------------------------------------------------
// AddressResource: the JSON document held by the configuration store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_space: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpec {
    pub address: String,
    #[serde(rename = "type")]
    pub address_type: AddressType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<AddressSettings>,
}

/// A stored address definition document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressResource {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: AddressSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AddressStatus>,
}

impl AddressResource {
    /// Build the document for a new definition in `address_space`.
    pub fn for_definition(definition: &AddressDefinition, address_space: &str) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(resource_name(address_space, &definition.address)),
                address_space: Some(address_space.to_string()),
                annotations: BTreeMap::new(),
            },
            spec: AddressSpec {
                address: definition.address.clone(),
                address_type: definition.address_type,
                plan: definition.plan.clone(),
                topic: match definition.address_type {
                    AddressType::Subscription => definition.topic.clone(),
                    _ => None,
                },
                settings: definition.settings.clone(),
            },
            status: None,
        }
    }

    /// Flatten into a definition. `fallback_name` is used when the document
    /// carries no `metadata.name`.
    pub fn into_definition(self, fallback_name: &str) -> AddressDefinition {
        let name = self
            .metadata
            .name
            .unwrap_or_else(|| fallback_name.to_string());
        AddressDefinition {
            address: self.spec.address,
            name,
            address_type: self.spec.address_type,
            topic: self.spec.topic,
            plan: self.spec.plan,
            allocated_to: self.metadata.annotations.get(BROKER_ID_ANNOTATION).cloned(),
            settings: self.spec.settings,
            status: self.status.unwrap_or_default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Resource naming
// ---------------------------------------------------------------------------

/// Store resource name for `address` within `address_space`.
///
/// Characters outside `[a-z0-9.-]` are replaced by `-`. When the sanitised
/// form differs from the address, an eight-character SHA-1 suffix keeps
/// distinct addresses from colliding.
pub fn resource_name(address_space: &str, address: &str) -> String {
    let sanitised: String = address
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = sanitised.trim_matches(|c: char| !c.is_ascii_alphanumeric());

    if trimmed == address && !trimmed.is_empty() {
        return format!("{address_space}.{trimmed}");
    }

    let digest = Sha1::digest(address.as_bytes());
    let suffix: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    if trimmed.is_empty() {
        format!("{address_space}.{suffix}")
    } else {
        format!("{address_space}.{trimmed}-{suffix}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
