//! Discovery of which list filter properties correspond to local profile fields.
//!
//! The result is informational: it is shown to admins and stored as
//! configuration, but sync runs always merge the full `ProfileField` set.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::Serialize;

use crate::crm::client::{CrmClient, CrmError, ListFilter, ListMetadata};
use crate::error::SyncError;
use crate::helpers::normalize_key;
use crate::types::ProfileField;

/// Local field name -> external property name.
pub type FieldMapping = BTreeMap<String, String>;

/// Mapping discovered for one list, with the list's display name.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredMapping {
    pub list_id: u64,
    pub list_name: String,
    pub properties: FieldMapping,
}

#[async_trait]
pub trait ListMetadataSource: Send + Sync {
    async fn fetch_list(&self, list_id: u64) -> Result<ListMetadata, CrmError>;
}

#[async_trait]
impl ListMetadataSource for CrmClient {
    async fn fetch_list(&self, list_id: u64) -> Result<ListMetadata, CrmError> {
        CrmClient::fetch_list(self, list_id).await
    }
}

/// Local field names that filters are matched against.
pub fn local_field_candidates() -> Vec<&'static str> {
    ProfileField::ALL.iter().map(|f| f.label()).collect()
}

/// Match filter properties to local field names by normalized name.
///
/// Unmatched filters are dropped. When several properties normalize to the
/// same local field, the lexicographically smallest wins so the result does
/// not depend on filter order.
pub fn infer_field_mapping<'a>(
    filters: &[ListFilter],
    candidates: impl IntoIterator<Item = &'a str>,
) -> FieldMapping {
    let by_key: HashMap<String, &str> = candidates
        .into_iter()
        .map(|c| (normalize_key(c), c))
        .filter(|(key, _)| !key.is_empty())
        .collect();

    let mut mapping = FieldMapping::new();
    for filter in filters {
        let key = normalize_key(&filter.property);
        let Some(local) = by_key.get(&key) else {
            continue;
        };
        mapping
            .entry(local.to_string())
            .and_modify(|existing| {
                if filter.property < *existing {
                    *existing = filter.property.clone();
                }
            })
            .or_insert_with(|| filter.property.clone());
    }
    mapping
}

/// Fetch `list_id`'s metadata and infer its field mapping.
pub async fn resolve_field_mapping<S: ListMetadataSource + ?Sized>(
    source: &S,
    list_id: u64,
) -> Result<DiscoveredMapping, SyncError> {
    let list = source
        .fetch_list(list_id)
        .await
        .map_err(|source| SyncError::List { list_id, source })?;

    let properties = infer_field_mapping(&list.filters, local_field_candidates());
    log::info!(
        "List {} ({}): {} of {} filters mapped to profile fields",
        list.list_id,
        list.name,
        properties.len(),
        list.filters.len()
    );

    Ok(DiscoveredMapping {
        list_id: list.list_id,
        list_name: list.name,
        properties,
    })
}
