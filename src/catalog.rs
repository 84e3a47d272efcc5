//! Catalog Service
//!
//! Product CRUD over the current schema. Every field edit is applied and
//! recorded in the ledger in the same transaction.

use std::collections::HashSet;

use rusqlite::Connection;
use serde_json::{Map, Value};

use crate::config::CatalogConfig;
use crate::db::{products, Db};
use crate::error::{CatalogError, Result};
use crate::ledger::{NewEntry, VersionLedger};
use crate::schema::SchemaRegistry;
use crate::types::{Comparison, ComparisonRow, FieldDefinition, FieldType, Product};

#[derive(Clone)]
pub struct Catalog {
    db: Db,
    registry: SchemaRegistry,
    ledger: VersionLedger,
    search_fields: Vec<String>,
}

impl Catalog {
    pub fn new(registry: SchemaRegistry, ledger: VersionLedger) -> Self {
        Self {
            db: registry.db().clone(),
            registry,
            ledger,
            search_fields: CatalogConfig::default().search_fields,
        }
    }

    /// Opens the configured database and wires up the registry and ledger.
    pub fn open(config: &CatalogConfig) -> Result<Self> {
        let db = Db::open_url(&config.database_url)?;
        let registry = SchemaRegistry::new(db.clone());
        let ledger = VersionLedger::new(db, registry.clone()).with_page_size(config.history_page_size);
        Ok(Self::new(registry, ledger).with_search_fields(config.search_fields.clone()))
    }

    pub fn with_search_fields(mut self, search_fields: Vec<String>) -> Self {
        self.search_fields = search_fields;
        self
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &VersionLedger {
        &self.ledger
    }

    /// Creates a product. Omitted fields take their default. Creation is not
    /// recorded in the ledger.
    pub fn create_product(&self, values: Map<String, Value>) -> Result<Product> {
        let product = self.db.write(|txn| {
            let fields = self.registry.fields_in(txn)?;
            check_known(&fields, &values)?;

            let mut row = Map::new();
            for field in &fields {
                let value = match values.get(&field.name) {
                    Some(value) => field.coerce(value)?,
                    None => field.coerce(&field.default_value)?,
                };
                row.insert(field.name.clone(), value);
            }
            let id = products::insert(txn, &row)?;
            load(txn, &fields, id)
        })?;

        log::info!("created product {}", product.id);
        Ok(product)
    }

    pub fn get_product(&self, id: i64) -> Result<Product> {
        self.db.read(|conn| {
            let fields = self.registry.fields_in(conn)?;
            load(conn, &fields, id)
        })
    }

    /// Applies the given field values. Each field whose value actually
    /// changes gets one ledger entry; any invalid field or value rejects the
    /// whole update.
    pub fn update_product(&self, id: i64, values: Map<String, Value>) -> Result<Product> {
        self.db.write(|txn| {
            let fields = self.registry.fields_in(txn)?;
            let product = load(txn, &fields, id)?;
            check_known(&fields, &values)?;

            let mut changes = Vec::new();
            for (name, value) in &values {
                let Some(field) = fields.iter().find(|f| &f.name == name) else {
                    return Err(CatalogError::UnknownField(name.clone()));
                };
                let new_value = field.coerce(value)?;
                let old_value = product.get(name).cloned().unwrap_or(Value::Null);
                if old_value != new_value {
                    changes.push((field, old_value, new_value));
                }
            }
            if changes.is_empty() {
                return Ok(product);
            }

            let assignments = changes
                .iter()
                .map(|(field, _, new_value)| (field.name.clone(), new_value.clone()))
                .collect::<Vec<_>>();
            products::update(txn, id, &assignments)?;
            for (field, old_value, new_value) in &changes {
                self.ledger
                    .append_in(txn, NewEntry::edit(id, field, old_value, new_value))?;
            }
            log::debug!("updated {} field(s) of product {}", changes.len(), id);
            load(txn, &fields, id)
        })
    }

    /// Deletes a product. Its ledger entries are kept.
    pub fn delete_product(&self, id: i64) -> Result<()> {
        self.db.write(|txn| {
            if !products::delete(txn, id)? {
                return Err(CatalogError::NotFound(id));
            }
            Ok(())
        })?;
        log::info!("deleted product {}", id);
        Ok(())
    }

    /// Products newest first, optionally narrowed to those whose searchable
    /// text fields contain `search` (ignoring case).
    pub fn list_products(&self, search: Option<&str>) -> Result<Vec<Product>> {
        let (fields, all) = self.db.read(|conn| {
            let fields = self.registry.fields_in(conn)?;
            let all = products::all(conn, &fields)?;
            Ok((fields, all))
        })?;

        let term = match search.map(str::trim) {
            Some(term) if !term.is_empty() => term.to_lowercase(),
            _ => return Ok(all),
        };
        let searchable = fields
            .iter()
            .filter(|f| f.field_type == FieldType::Text)
            .filter(|f| self.search_fields.iter().any(|s| s.eq_ignore_ascii_case(&f.name)))
            .map(|f| f.name.as_str())
            .collect::<Vec<_>>();

        Ok(all
            .into_iter()
            .filter(|product| {
                searchable.iter().any(|name| {
                    product
                        .get(name)
                        .and_then(Value::as_str)
                        .is_some_and(|text| text.to_lowercase().contains(&term))
                })
            })
            .collect())
    }

    /// Lines the given products up field by field using display strings.
    pub fn compare(&self, ids: &[i64]) -> Result<Comparison> {
        let mut seen = HashSet::new();
        let ids = ids.iter().copied().filter(|id| seen.insert(*id)).collect::<Vec<_>>();
        if ids.is_empty() {
            return Ok(Comparison {
                product_ids: ids,
                rows: Vec::new(),
            });
        }

        let (fields, compared) = self.db.read(|conn| {
            let fields = self.registry.fields_in(conn)?;
            let compared = ids
                .iter()
                .map(|id| load(conn, &fields, *id))
                .collect::<Result<Vec<_>>>()?;
            Ok((fields, compared))
        })?;

        let rows = fields
            .iter()
            .map(|field| ComparisonRow {
                field: field.name.clone(),
                values: compared
                    .iter()
                    .map(|product| field.display(product.get(&field.name).unwrap_or(&Value::Null)))
                    .collect(),
            })
            .collect();
        Ok(Comparison { product_ids: ids, rows })
    }
}

fn load(conn: &Connection, fields: &[FieldDefinition], id: i64) -> Result<Product> {
    products::load(conn, fields, id)?.ok_or(CatalogError::NotFound(id))
}

/// Field names are matched exactly against the registry.
fn check_known(fields: &[FieldDefinition], values: &Map<String, Value>) -> Result<()> {
    match values.keys().find(|name| !fields.iter().any(|f| &f.name == *name)) {
        Some(unknown) => Err(CatalogError::UnknownField(unknown.clone())),
        None => Ok(()),
    }
}
