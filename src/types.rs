//! Shared configuration and profile field definitions.

use serde::{Deserialize, Serialize};

use crate::crm::CrmConfig;

/// Application configuration stored in ~/.memberdir/config.json.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub crm: CrmConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Explicit database path. Defaults to `~/.memberdir/memberdir.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// The fixed set of profile fields mirrored from the CRM.
///
/// Every sync run merges all of these, regardless of what the discovered
/// field mapping contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileField {
    FirstName,
    LastName,
    Email,
    Company,
    JobTitle,
    Phone,
    Industry,
    State,
    City,
    Bio,
    LinkedIn,
    Headshot,
    Membership,
}

impl ProfileField {
    pub const ALL: [ProfileField; 13] = [
        ProfileField::FirstName,
        ProfileField::LastName,
        ProfileField::Email,
        ProfileField::Company,
        ProfileField::JobTitle,
        ProfileField::Phone,
        ProfileField::Industry,
        ProfileField::State,
        ProfileField::City,
        ProfileField::Bio,
        ProfileField::LinkedIn,
        ProfileField::Headshot,
        ProfileField::Membership,
    ];

    /// CRM property name. Doubles as the `members` column name.
    pub fn property(self) -> &'static str {
        match self {
            ProfileField::FirstName => "firstname",
            ProfileField::LastName => "lastname",
            ProfileField::Email => "email",
            ProfileField::Company => "company",
            ProfileField::JobTitle => "jobtitle",
            ProfileField::Phone => "phone",
            ProfileField::Industry => "industry",
            ProfileField::State => "state",
            ProfileField::City => "city",
            ProfileField::Bio => "bio",
            ProfileField::LinkedIn => "linkedin",
            ProfileField::Headshot => "headshot",
            ProfileField::Membership => "membership",
        }
    }

    /// Local display name, as shown on profile forms.
    pub fn label(self) -> &'static str {
        match self {
            ProfileField::FirstName => "First Name",
            ProfileField::LastName => "Last Name",
            ProfileField::Email => "Email",
            ProfileField::Company => "Company",
            ProfileField::JobTitle => "Job Title",
            ProfileField::Phone => "Phone",
            ProfileField::Industry => "Industry",
            ProfileField::State => "State",
            ProfileField::City => "City",
            ProfileField::Bio => "Bio",
            ProfileField::LinkedIn => "LinkedIn",
            ProfileField::Headshot => "Headshot",
            ProfileField::Membership => "Membership",
        }
    }
}
