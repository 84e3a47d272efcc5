pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod schema;
pub mod server;
pub mod types;

pub use catalog::Catalog;
pub use config::CatalogConfig;
pub use db::Db;
pub use error::{CatalogError, Result};
pub use ledger::{History, VersionLedger};
pub use schema::SchemaRegistry;
pub use rusqlite;
