//! Parsed bootstrap configuration and the interface to whatever produces it.

use crate::error::LoaderError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Grant target meaning "every event in this configuration".
pub const ALL_EVENTS: &str = "*";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub events: Vec<EventSeed>,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub admin_access: OneOrMany<AdminAccess>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub settings: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSeed {
    pub slug: String,
    pub name: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub dates: EventDates,
    #[serde(default)]
    pub venue: Venue,
    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(default)]
    pub ticket_types: Vec<TicketTypeSeed>,
}

fn default_status() -> String {
    "draft".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventDates {
    pub start: Option<String>,
    pub end: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Venue {
    pub name: Option<String>,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketTypeSeed {
    pub name: String,
    #[serde(default)]
    pub price: f64,
    pub capacity: Option<i64>,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminAccess {
    pub email: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default = "all_events")]
    pub events: Vec<String>,
}

fn default_role() -> String {
    "admin".to_string()
}

fn all_events() -> Vec<String> {
    vec![ALL_EVENTS.to_string()]
}

impl AdminAccess {
    pub fn is_wildcard(&self) -> bool {
        self.events.iter().any(|slug| slug == ALL_EVENTS)
    }
}

/// Accepts either a single object or a list of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::One(item) => std::slice::from_ref(item),
            OneOrMany::Many(items) => items,
        }
    }
}

impl BootstrapConfig {
    /// Structural checks the loader relies on. Business rules live elsewhere.
    pub fn validate(&self) -> Result<(), LoaderError> {
        if self.events.is_empty() {
            return Err(LoaderError::Config("configuration defines no events".to_string()));
        }

        let mut seen = HashSet::new();
        for event in &self.events {
            if event.slug.trim().is_empty() {
                return Err(LoaderError::validation(format!(
                    "event '{}' has an empty slug",
                    event.name
                )));
            }
            if !seen.insert(event.slug.as_str()) {
                return Err(LoaderError::validation(format!(
                    "duplicate event slug '{}'",
                    event.slug
                )));
            }

            let mut ticket_names = HashSet::new();
            for ticket in &event.ticket_types {
                if !ticket_names.insert(ticket.name.as_str()) {
                    return Err(LoaderError::validation(format!(
                        "duplicate ticket type '{}' for event '{}'",
                        ticket.name, event.slug
                    )));
                }
            }
        }

        for access in self.admin_access.as_slice() {
            if !access.email.contains('@') {
                return Err(LoaderError::validation(format!(
                    "admin access email '{}' must contain '@'",
                    access.email
                )));
            }
            if access.events.is_empty() {
                return Err(LoaderError::validation(format!(
                    "admin access for '{}' lists no events",
                    access.email
                )));
            }
        }

        Ok(())
    }
}

/// Produces the configuration for one bootstrap run.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<BootstrapConfig, LoaderError>;
}

/// Reads a JSON configuration file.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ConfigSource for JsonFileSource {
    fn load(&self) -> Result<BootstrapConfig, LoaderError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            LoaderError::Config(format!("failed to read {}: {}", self.path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            LoaderError::Config(format!("failed to parse {}: {}", self.path.display(), e))
        })
    }
}

/// An already-parsed configuration.
#[derive(Debug, Clone)]
pub struct StaticSource(pub BootstrapConfig);

impl ConfigSource for StaticSource {
    fn load(&self) -> Result<BootstrapConfig, LoaderError> {
        Ok(self.0.clone())
    }
}
