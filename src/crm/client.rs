//! REST client for the CRM list and company APIs.
//!
//! Uses reqwest with Bearer token auth. Every request is bound by the
//! configured timeout, and any non-success status is a hard failure. The
//! client knows nothing about local storage.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::crm::CrmConfig;
use crate::types::ProfileField;

/// Contact property that links a contact to its primary company.
pub const COMPANY_ASSOCIATION_PROPERTY: &str = "associatedcompanyid";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from CRM API calls.
#[derive(Debug, thiserror::Error)]
pub enum CrmError {
    #[error("No API key configured for the CRM")]
    NoApiKey,
    #[error("Invalid CRM base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("CRM request failed: {0}")]
    Request(String),
    #[error("CRM request timed out after {0} seconds")]
    Timeout(u64),
    #[error("CRM API error {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Failed to parse CRM response: {0}")]
    Parse(String),
}

impl CrmError {
    /// Transport failures, timeouts, throttling and upstream 5xx are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            CrmError::Request(_) | CrmError::Timeout(_) => true,
            CrmError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// One contact of the external list, as fetched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExternalContactRecord {
    pub id: String,
    pub properties: BTreeMap<String, Option<String>>,
}

impl ExternalContactRecord {
    /// A property value, or `None` when it is absent or blank.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .get(name)
            .and_then(|v| v.as_deref())
            .filter(|v| !v.trim().is_empty())
    }

    pub fn field(&self, field: ProfileField) -> Option<&str> {
        self.property(field.property())
    }

    /// The associated company id. A contact with no company is normal.
    pub fn company_id(&self) -> Option<&str> {
        self.property(COMPANY_ASSOCIATION_PROPERTY).map(str::trim)
    }
}

/// One page of list contacts plus the cursor for the next page, if any.
#[derive(Debug, Clone, Default)]
pub struct ContactPage {
    pub contacts: Vec<ExternalContactRecord>,
    pub next_cursor: Option<String>,
}

/// A single list filter. Only filters that name a property are kept.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilter {
    pub property: String,
    pub operator: Option<String>,
}

/// List metadata returned by the list endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMetadata {
    pub list_id: u64,
    pub name: String,
    pub filters: Vec<ListFilter>,
}

/// A company record, optionally annotated with how many list members it has.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyRecord {
    pub id: String,
    pub name: Option<String>,
    pub domain: Option<String>,
    pub industry: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub website: Option<String>,
    #[serde(default)]
    pub member_count: usize,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ContactPageWire {
    #[serde(default)]
    contacts: Vec<ContactWire>,
    #[serde(rename = "has-more", default)]
    has_more: bool,
    #[serde(rename = "vid-offset", default)]
    vid_offset: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ContactWire {
    #[serde(default)]
    vid: serde_json::Value,
    #[serde(default)]
    properties: BTreeMap<String, PropertyWire>,
}

#[derive(Deserialize)]
struct PropertyWire {
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct ListWire {
    #[serde(rename = "listId", default)]
    list_id: serde_json::Value,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    filters: Vec<FilterGroupWire>,
}

/// Filters arrive either flat or as OR-groups of AND-ed filters.
#[derive(Deserialize)]
#[serde(untagged)]
enum FilterGroupWire {
    Group(Vec<FilterWire>),
    Single(FilterWire),
}

#[derive(Deserialize)]
struct FilterWire {
    #[serde(default, alias = "propertyName")]
    property: Option<String>,
    #[serde(default)]
    operator: Option<String>,
}

#[derive(Deserialize)]
struct CompanyWire {
    #[serde(rename = "companyId", default)]
    company_id: serde_json::Value,
    #[serde(default)]
    properties: BTreeMap<String, PropertyWire>,
}

/// Render a JSON scalar as a string. Objects, arrays and null yield `None`.
fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl ContactWire {
    fn into_record(self) -> Result<ExternalContactRecord, CrmError> {
        let id = scalar_to_string(&self.vid)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| CrmError::Parse("contact without an identifier".to_string()))?;
        let properties = self
            .properties
            .into_iter()
            .map(|(name, prop)| (name, scalar_to_string(&prop.value)))
            .collect();
        Ok(ExternalContactRecord { id, properties })
    }
}

impl ContactPageWire {
    fn into_page(self) -> Result<ContactPage, CrmError> {
        let next_cursor = if self.has_more {
            let cursor = self
                .vid_offset
                .as_ref()
                .and_then(scalar_to_string)
                .ok_or_else(|| CrmError::Parse("has-more set without a vid-offset".to_string()))?;
            Some(cursor)
        } else {
            None
        };
        let contacts = self
            .contacts
            .into_iter()
            .map(ContactWire::into_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ContactPage {
            contacts,
            next_cursor,
        })
    }
}

impl ListWire {
    fn into_metadata(self, requested_id: u64) -> ListMetadata {
        let list_id = scalar_to_string(&self.list_id)
            .and_then(|id| id.parse().ok())
            .unwrap_or(requested_id);
        let filters = self
            .filters
            .into_iter()
            .flat_map(|group| match group {
                FilterGroupWire::Group(filters) => filters,
                FilterGroupWire::Single(filter) => vec![filter],
            })
            .filter_map(|f| {
                let property = f.property?.trim().to_string();
                if property.is_empty() {
                    return None;
                }
                Some(ListFilter {
                    property,
                    operator: f.operator,
                })
            })
            .collect();
        ListMetadata {
            list_id,
            name: self.name.unwrap_or_default(),
            filters,
        }
    }
}

impl CompanyWire {
    fn into_record(self, requested_id: &str) -> CompanyRecord {
        let prop = |name: &str| {
            self.properties
                .get(name)
                .and_then(|p| scalar_to_string(&p.value))
                .filter(|v| !v.trim().is_empty())
        };
        CompanyRecord {
            id: scalar_to_string(&self.company_id).unwrap_or_else(|| requested_id.to_string()),
            name: prop("name"),
            domain: prop("domain"),
            industry: prop("industry"),
            city: prop("city"),
            state: prop("state"),
            website: prop("website"),
            member_count: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CrmClient {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
    timeout_secs: u64,
}

impl CrmClient {
    /// Build a client from configuration. Fails before any network call when
    /// the API key is missing.
    pub fn new(config: &CrmConfig) -> Result<Self, CrmError> {
        let api_key = config.api_key.as_deref().unwrap_or_default();
        Self::with_base_url(api_key, &config.base_url, config.request_timeout_secs)
    }

    pub fn with_base_url(
        api_key: &str,
        base_url: &str,
        timeout_secs: u64,
    ) -> Result<Self, CrmError> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(CrmError::NoApiKey);
        }

        let base_url = Url::parse(base_url)
            .map_err(|e| CrmError::InvalidBaseUrl(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(CrmError::InvalidBaseUrl(base_url.to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| CrmError::Request(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            api_key: api_key.to_string(),
            timeout_secs,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, CrmError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CrmError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn transport_error(&self, e: reqwest::Error) -> CrmError {
        if e.is_timeout() {
            CrmError::Timeout(self.timeout_secs)
        } else {
            CrmError::Request(e.to_string())
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> Result<T, CrmError> {
        let url = self.endpoint(segments)?;
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .query(query)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(CrmError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let bytes = resp.bytes().await.map_err(|e| self.transport_error(e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CrmError::Parse(format!("{}: {}", segments.join("/"), e)))
    }

    /// Fetch one page of list contacts starting at `cursor`.
    pub async fn fetch_contact_page(
        &self,
        list_id: u64,
        count: u32,
        cursor: Option<&str>,
    ) -> Result<ContactPage, CrmError> {
        let mut query: Vec<(&str, String)> = vec![("count", count.to_string())];
        if let Some(cursor) = cursor {
            query.push(("vidOffset", cursor.to_string()));
        }
        for field in ProfileField::ALL {
            query.push(("property", field.property().to_string()));
        }
        query.push(("property", COMPANY_ASSOCIATION_PROPERTY.to_string()));

        let list_id = list_id.to_string();
        let wire: ContactPageWire = self
            .get_json(&["contacts", "v1", "lists", &list_id, "contacts", "all"], &query)
            .await?;
        wire.into_page()
    }

    /// Fetch list metadata, including its filter definitions.
    pub async fn fetch_list(&self, list_id: u64) -> Result<ListMetadata, CrmError> {
        let id = list_id.to_string();
        let wire: ListWire = self
            .get_json(&["contacts", "v1", "lists", &id], &[])
            .await?;
        Ok(wire.into_metadata(list_id))
    }

    /// Fetch one company record by id.
    pub async fn fetch_company(&self, company_id: &str) -> Result<CompanyRecord, CrmError> {
        let wire: CompanyWire = self
            .get_json(&["companies", "v2", "companies", company_id], &[])
            .await?;
        Ok(wire.into_record(company_id))
    }
}
