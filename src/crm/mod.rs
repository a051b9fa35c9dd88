//! CRM contact-list integration.
//!
//! The member directory is mirrored from one CRM contact list. This module
//! holds the REST client, the cursor-following page aggregator, the list
//! filter to profile field mapping resolver, and company enrichment.

pub mod client;
pub mod companies;
pub mod mapping;
pub mod pages;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// CRM integration configuration stored in ~/.memberdir/config.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrmConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_id: Option<u64>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_company_concurrency")]
    pub company_concurrency: usize,
}

fn default_base_url() -> String {
    "https://api.hubapi.com".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_page_size() -> u32 {
    100
}

fn default_company_concurrency() -> usize {
    4
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            list_id: None,
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            page_size: default_page_size(),
            company_concurrency: default_company_concurrency(),
        }
    }
}

impl CrmConfig {
    /// The API key, or a configuration error when it is missing or blank.
    pub fn require_api_key(&self) -> Result<&str, SyncError> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| SyncError::Configuration("No CRM API key configured".to_string()))
    }

    /// The target list id, or a configuration error when it is missing.
    pub fn require_list_id(&self) -> Result<u64, SyncError> {
        self.list_id
            .ok_or_else(|| SyncError::Configuration("No CRM list id configured".to_string()))
    }
}
