use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use product_catalog::server::start_server;
use product_catalog::types::{FieldSpec, FieldType, HistoryFilter, VersionEntry};
use product_catalog::{Catalog, CatalogConfig};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "product-catalog")]
#[command(about = "Product catalog with a user-editable schema and a revertible change history")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to catalog.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database URL (memory:// or file://path/to/catalog.db), overrides the config
    #[arg(long = "database-url", global = true)]
    database_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the JSON API (default)
    Serve {
        /// Address to listen on, overrides the config
        #[arg(long)]
        bind: Option<String>,
    },
    /// List the product fields
    Fields,
    /// Add a product field
    AddField {
        name: String,
        /// text, integer, real or cents
        field_type: FieldType,
        /// Default for existing and new products (JSON, or a plain string)
        #[arg(long)]
        default: Option<String>,
        #[arg(long)]
        required: bool,
    },
    /// Rename a product field
    RenameField { old_name: String, new_name: String },
    /// Change a field's type, converting stored values
    RetypeField { name: String, field_type: FieldType },
    /// Remove a product field and its data
    DropField { name: String },
    /// Show ledger entries, oldest first
    History {
        #[arg(long)]
        product: Option<i64>,
        #[arg(long)]
        field: Option<String>,
        /// Only the newest N entries, newest first
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Restore the value a ledger entry replaced
    Rollback { entry_id: i64 },
}

fn parse_default(raw: Option<String>) -> Value {
    match raw {
        Some(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        None => Value::Null,
    }
}

fn print_entry(entry: &VersionEntry) {
    println!(
        "#{} {} product {} {}: {} -> {} ({}){}",
        entry.id,
        entry.changed_at.to_rfc3339(),
        entry.product_id,
        entry.field_name,
        entry.old_value,
        entry.new_value,
        entry.kind.as_str(),
        entry.reverts.map(|id| format!(" reverts #{}", id)).unwrap_or_default()
    );
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = CatalogConfig::load_from(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    let catalog = Catalog::open(&config).with_context(|| format!("Failed to open {}", config.database_url))?;
    let registry = catalog.registry().clone();

    match cli.command.unwrap_or(Commands::Serve { bind: None }) {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.bind_address.clone());
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(start_server(catalog, &bind))?;
        }
        Commands::Fields => {
            for field in registry.current_fields()? {
                println!(
                    "{:<24} {:<8} {:<9} {}",
                    field.name,
                    field.field_type,
                    if field.required { "required" } else { "optional" },
                    field.default_value
                );
            }
        }
        Commands::AddField {
            name,
            field_type,
            default,
            required,
        } => {
            let mut spec = FieldSpec::new(name, field_type).with_default(parse_default(default));
            if required {
                spec = spec.required();
            }
            let field = registry.add(spec)?;
            println!("Added field {} ({})", field.name, field.field_type);
        }
        Commands::RenameField { old_name, new_name } => {
            let field = registry.rename_field(&old_name, &new_name)?;
            println!("Renamed field {} to {}", old_name, field.name);
        }
        Commands::RetypeField { name, field_type } => {
            let field = registry.retype_field(&name, field_type)?;
            println!("Field {} is now {}", field.name, field.field_type);
        }
        Commands::DropField { name } => {
            registry.drop_field(&name)?;
            println!("Dropped field {}", name);
        }
        Commands::History { product, field, limit } => {
            let filter = HistoryFilter {
                product_id: product,
                field_name: field,
            };
            match limit {
                Some(limit) => {
                    for entry in catalog.ledger().recent_matching(&filter, limit)? {
                        print_entry(&entry);
                    }
                }
                None => {
                    for entry in &catalog.ledger().history(filter)? {
                        print_entry(&entry?);
                    }
                }
            }
        }
        Commands::Rollback { entry_id } => {
            let entry = catalog.ledger().rollback(entry_id)?;
            print_entry(&entry);
        }
    }

    Ok(())
}
