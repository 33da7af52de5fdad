//! Address types on offer in an address space, grouped for display.

use serde::Serialize;

use crate::error::StoreError;
use crate::model::AddressType;
use crate::store::{AddressPlan, ConfigStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanDetails {
    pub name: String,
    pub display_name: String,
    pub short_description: Option<String>,
    pub long_description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressTypeInfo {
    pub name: AddressType,
    pub plans: Vec<PlanDetails>,
}

impl From<&AddressPlan> for PlanDetails {
    fn from(plan: &AddressPlan) -> Self {
        Self {
            name: plan.name.clone(),
            display_name: plan.display_name.clone().unwrap_or_else(|| plan.name.clone()),
            short_description: plan.short_description.clone(),
            long_description: plan.long_description.clone(),
        }
    }
}

/// Plans offered by `space_plan`, ordered by display order (unset last) and
/// grouped by address type in first-seen order.
pub fn group_plans(offered: &[String], plans: &[AddressPlan]) -> Vec<AddressTypeInfo> {
    let mut selected: Vec<&AddressPlan> = plans
        .iter()
        .filter(|p| offered.iter().any(|name| *name == p.name))
        .collect();
    // Stable, so equal orders keep catalog order.
    selected.sort_by_key(|p| p.display_order.unwrap_or(i64::MAX));

    let mut out: Vec<AddressTypeInfo> = Vec::new();
    for plan in selected {
        match out.iter_mut().find(|t| t.name == plan.address_type) {
            Some(group) => group.plans.push(plan.into()),
            None => out.push(AddressTypeInfo {
                name: plan.address_type,
                plans: vec![plan.into()],
            }),
        }
    }
    out
}

/// Address types and plans available under the address-space plan `space_plan`.
///
/// # Errors
/// [`StoreError::NotFound`] when no such address-space plan exists.
pub async fn address_types(
    store: &dyn ConfigStore,
    space_plan: &str,
) -> Result<Vec<AddressTypeInfo>, StoreError> {
    let space = store
        .address_space_plans()
        .await?
        .into_iter()
        .find(|p| p.name == space_plan)
        .ok_or_else(|| StoreError::NotFound(format!("address space plan {space_plan}")))?;
    let plans = store.address_plans().await?;
    Ok(group_plans(&space.address_plans, &plans))
}
