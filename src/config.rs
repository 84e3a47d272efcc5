//! Configuration for the catalog server and CLI
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (catalog.toml)
//! - Environment variables (CATALOG_*)
//!
//! ## Example config file (catalog.toml):
//! ```toml
//! database_url = "file://catalog.db"
//! bind_address = "127.0.0.1:5000"
//! search_fields = ["name", "category", "description"]
//! history_page_size = 100
//! ```

use std::path::Path;

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::ledger::DEFAULT_PAGE_SIZE;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// `memory://`, `file://path`, or a bare path
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Address the JSON API listens on
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Text fields matched by product search
    #[serde(default = "default_search_fields")]
    pub search_fields: Vec<String>,

    /// Ledger entries read per query when walking history
    #[serde(default = "default_history_page_size")]
    pub history_page_size: usize,
}

fn default_database_url() -> String {
    "file://catalog.db".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_search_fields() -> Vec<String> {
    vec!["name".to_string(), "category".to_string()]
}

fn default_history_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            bind_address: default_bind_address(),
            search_fields: default_search_fields(),
            history_page_size: default_history_page_size(),
        }
    }
}

impl CatalogConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration, adding a specific file that must exist
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        for location in ["catalog.toml", "config/catalog.toml"] {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("CATALOG")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("search_fields"),
        );

        builder.build()?.try_deserialize()
    }
}
