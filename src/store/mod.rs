//! # Configuration store
//!
//! The desired-state collaborator: a versioned object store holding one JSON
//! [`AddressResource`] per address definition, a change feed delivering the
//! full object list on every change, and a read-only plan catalog.
//!
//! Writes are compare-and-swap on the object's version token; see
//! [`update_with`].

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::StoreError;
use crate::model::{AddressDefinition, AddressResource, AddressType, Phase};

pub use memory::MemoryStore;

/// One stored object: a name, a version token bumped on every write, and the
/// JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub name: String,
    pub version: u64,
    pub data: String,
}

// ---------------------------------------------------------------------------
// Plan catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressSpacePlan {
    pub name: String,
    /// Names of the address plans this space plan offers.
    #[serde(default)]
    pub address_plans: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressPlan {
    pub name: String,
    pub address_type: AddressType,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub short_description: Option<String>,
    #[serde(default)]
    pub long_description: Option<String>,
    #[serde(default)]
    pub display_order: Option<i64>,
}

// ---------------------------------------------------------------------------
// ConfigStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Change feed. The current value is always the full object list.
    fn watch(&self) -> watch::Receiver<Vec<StoredObject>>;

    async fn list(&self) -> Result<Vec<StoredObject>, StoreError>;
    async fn get(&self, name: &str) -> Result<Option<StoredObject>, StoreError>;
    /// Fails with [`StoreError::AlreadyExists`] if `name` is taken.
    async fn create(&self, name: &str, data: String) -> Result<StoredObject, StoreError>;
    async fn delete(&self, name: &str) -> Result<(), StoreError>;
    /// Replace `name` only if its version is still `expected_version`.
    async fn replace(
        &self,
        name: &str,
        expected_version: u64,
        data: String,
    ) -> Result<StoredObject, StoreError>;

    async fn address_space_plans(&self) -> Result<Vec<AddressSpacePlan>, StoreError>;
    async fn address_plans(&self) -> Result<Vec<AddressPlan>, StoreError>;
}

// ---------------------------------------------------------------------------
// Read-modify-write
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Written; carries the new version.
    Updated(u64),
    /// The transform found nothing to change; no write was issued.
    Unchanged,
}

/// Fetch `name`, run `transform` on its payload and write the result back
/// conditioned on the version that was read.
///
/// `transform` returns `Ok(None)` when the stored value already matches, in
/// which case nothing is written. A concurrent writer surfaces as
/// [`StoreError::Conflict`]; this function does not retry.
pub async fn update_with<F>(
    store: &dyn ConfigStore,
    name: &str,
    transform: F,
) -> Result<UpdateOutcome, StoreError>
where
    F: FnOnce(&str) -> Result<Option<String>, StoreError> + Send,
{
    let current = store
        .get(name)
        .await?
        .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
    match transform(&current.data)? {
        None => Ok(UpdateOutcome::Unchanged),
        Some(data) => {
            let written = store.replace(name, current.version, data).await?;
            Ok(UpdateOutcome::Updated(written.version))
        }
    }
}

/// Parse a stored payload as an address resource.
pub fn decode_resource(name: &str, data: &str) -> Result<AddressResource, StoreError> {
    serde_json::from_str(data).map_err(|e| StoreError::Decode {
        name: name.to_string(),
        detail: e.to_string(),
    })
}

fn encode_resource(name: &str, resource: &AddressResource) -> Result<String, StoreError> {
    serde_json::to_string(resource).map_err(|e| StoreError::Decode {
        name: name.to_string(),
        detail: e.to_string(),
    })
}

/// Persist readiness for the definition stored as `name`.
///
/// Sets `isReady`, and `phase` to `Active` or `Pending`, only when `isReady`
/// differs from what is stored.
pub async fn set_readiness(
    store: &dyn ConfigStore,
    name: &str,
    ready: bool,
) -> Result<UpdateOutcome, StoreError> {
    let owned = name.to_string();
    update_with(store, name, move |data| {
        let mut resource = decode_resource(&owned, data)?;
        let status = resource.status.get_or_insert_with(Default::default);
        if status.is_ready == ready {
            return Ok(None);
        }
        status.is_ready = ready;
        status.phase = if ready { Phase::Active } else { Phase::Pending };
        encode_resource(&owned, &resource).map(Some)
    })
    .await
}

/// Store a new definition in `address_space`. Returns the resource name used.
pub async fn create_address(
    store: &dyn ConfigStore,
    address_space: &str,
    definition: &AddressDefinition,
) -> Result<String, StoreError> {
    let resource = AddressResource::for_definition(definition, address_space);
    let name = resource
        .metadata
        .name
        .clone()
        .unwrap_or_else(|| definition.address.clone());
    let data = encode_resource(&name, &resource)?;
    store.create(&name, data).await?;
    Ok(name)
}

pub async fn delete_address(
    store: &dyn ConfigStore,
    definition: &AddressDefinition,
) -> Result<(), StoreError> {
    store.delete(&definition.name).await
}
