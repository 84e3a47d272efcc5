//! Schema Registry
//!
//! Tracks which fields a product has. The `field_definition` table is the
//! source of truth; every change to it is paired with the matching
//! `ALTER TABLE product` statement inside one write transaction, so readers
//! never see the registry and the table disagree.

use std::sync::LazyLock;

use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::db::{execute, products, quote_ident, Db};
use crate::error::{CatalogError, Result};
use crate::types::{FieldDefinition, FieldSpec, FieldType};

static FIELD_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").expect("valid field name pattern"));

const FIELD_COLUMNS: &str = "id, name, field_type, required, default_value, position";

/// Registry of the product fields. Cheap to clone.
#[derive(Clone)]
pub struct SchemaRegistry {
    db: Db,
}

impl SchemaRegistry {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Snapshot of the registered fields in display order.
    pub fn current_fields(&self) -> Result<Vec<FieldDefinition>> {
        self.db.read(load_fields)
    }

    pub fn field(&self, name: &str) -> Result<FieldDefinition> {
        self.db
            .read(|conn| find_field(conn, name))?
            .ok_or_else(|| CatalogError::UnknownField(name.to_string()))
    }

    /// The registered fields as seen by the caller's connection or
    /// transaction.
    pub(crate) fn fields_in(&self, conn: &Connection) -> Result<Vec<FieldDefinition>> {
        load_fields(conn)
    }

    pub(crate) fn find_in(&self, conn: &Connection, name: &str) -> Result<Option<FieldDefinition>> {
        find_field(conn, name)
    }

    /// Registers an optional field and backfills `default` onto every
    /// existing product.
    pub fn add_field(&self, name: &str, field_type: FieldType, default: Value) -> Result<FieldDefinition> {
        self.add(FieldSpec::new(name, field_type).with_default(default))
    }

    pub fn add(&self, spec: FieldSpec) -> Result<FieldDefinition> {
        validate_field_name(&spec.name)?;
        let default = spec.field_type.coerce(&spec.name, &spec.default_value)?;

        let field = self.db.write(|txn| {
            if let Some(existing) = find_field(txn, &spec.name)? {
                return Err(CatalogError::DuplicateField(existing.name));
            }
            if spec.required && default.is_null() && products::count(txn)? > 0 {
                return Err(CatalogError::MissingRequiredField(spec.name.clone()));
            }

            let sql = format!(
                "ALTER TABLE product ADD COLUMN {} {}",
                quote_ident(&spec.name),
                spec.field_type.sql_type()
            );
            execute(txn, &sql, [])?;
            if !default.is_null() {
                products::fill(txn, &spec.name, &default)?;
            }

            execute(
                txn,
                "INSERT INTO field_definition (name, field_type, required, default_value, position)
                 VALUES (?, ?, ?, ?, (SELECT COALESCE(MAX(position), 0) + 1 FROM field_definition))",
                params![spec.name, spec.field_type, spec.required, encode_default(&default)?],
            )?;
            field_by_id(txn, txn.last_insert_rowid())
        })?;

        log::info!("added field {} ({})", field.name, field.field_type);
        Ok(field)
    }

    /// Renames a field in place. The field keeps its id; ledger entries keep
    /// the name they were recorded under.
    pub fn rename_field(&self, old_name: &str, new_name: &str) -> Result<FieldDefinition> {
        validate_field_name(new_name)?;

        let field = self.db.write(|txn| {
            let field = find_field(txn, old_name)?
                .ok_or_else(|| CatalogError::UnknownField(old_name.to_string()))?;
            if field.name == new_name {
                return Ok(field);
            }
            if let Some(other) = find_field(txn, new_name)? {
                if other.id != field.id {
                    return Err(CatalogError::DuplicateField(other.name));
                }
            }

            // SQLite treats a case-only rename as a clash with itself.
            if field.name.eq_ignore_ascii_case(new_name) {
                let scratch = scratch_column("rename", field.id);
                rename_column(txn, &field.name, &scratch)?;
                rename_column(txn, &scratch, new_name)?;
            } else {
                rename_column(txn, &field.name, new_name)?;
            }
            execute(
                txn,
                "UPDATE field_definition SET name = ? WHERE id = ?",
                params![new_name, field.id],
            )?;
            field_by_id(txn, field.id)
        })?;

        log::info!("renamed field {} to {}", old_name, field.name);
        Ok(field)
    }

    /// Changes a field's declared type, converting every stored value. Fails
    /// without changing anything if any value cannot be converted.
    pub fn retype_field(&self, name: &str, new_type: FieldType) -> Result<FieldDefinition> {
        let field = self.db.write(|txn| {
            let field = find_field(txn, name)?
                .ok_or_else(|| CatalogError::UnknownField(name.to_string()))?;
            if field.field_type == new_type {
                return Ok(field);
            }

            let default = new_type.convert_from(field.field_type, &field.name, &field.default_value)?;
            if default.is_null() && !field.default_value.is_null() && field.required {
                return Err(CatalogError::MissingRequiredField(field.name.clone()));
            }
            let rows = products::all(txn, std::slice::from_ref(&field))?;
            let mut converted = Vec::with_capacity(rows.len());
            for product in rows {
                let value = product.get(&field.name).unwrap_or(&Value::Null);
                let value = new_type.convert_from(field.field_type, &field.name, value)?;
                if value.is_null() && field.required {
                    return Err(CatalogError::MissingRequiredField(field.name.clone()));
                }
                converted.push((product.id, value));
            }

            let scratch = scratch_column("retype", field.id);
            let sql = format!(
                "ALTER TABLE product ADD COLUMN {} {}",
                quote_ident(&scratch),
                new_type.sql_type()
            );
            execute(txn, &sql, [])?;
            for (id, value) in converted {
                products::update(txn, id, &[(scratch.clone(), value)])?;
            }
            let sql = format!("ALTER TABLE product DROP COLUMN {}", quote_ident(&field.name));
            execute(txn, &sql, [])?;
            rename_column(txn, &scratch, &field.name)?;

            execute(
                txn,
                "UPDATE field_definition SET field_type = ?, default_value = ? WHERE id = ?",
                params![new_type, encode_default(&default)?, field.id],
            )?;
            field_by_id(txn, field.id)
        })?;

        log::info!("changed type of field {} to {}", field.name, field.field_type);
        Ok(field)
    }

    /// Removes a field and its data from every product. Ledger entries that
    /// mention it are kept.
    pub fn drop_field(&self, name: &str) -> Result<()> {
        let field = self.db.write(|txn| {
            let field = find_field(txn, name)?
                .ok_or_else(|| CatalogError::UnknownField(name.to_string()))?;
            let sql = format!("ALTER TABLE product DROP COLUMN {}", quote_ident(&field.name));
            execute(txn, &sql, [])?;
            execute(txn, "DELETE FROM field_definition WHERE id = ?", [field.id])?;
            Ok(field)
        })?;

        log::info!("dropped field {}", field.name);
        Ok(())
    }
}

/// Field names become column names, so they are restricted to plain
/// identifiers. `id` belongs to the product table itself.
pub fn validate_field_name(name: &str) -> Result<()> {
    if !FIELD_NAME.is_match(name) || name.eq_ignore_ascii_case("id") {
        return Err(CatalogError::InvalidFieldName(name.to_string()));
    }
    Ok(())
}

/// A column name no field can have, used while a column is being moved.
fn scratch_column(purpose: &str, field_id: i64) -> String {
    format!("{} in progress {}", purpose, field_id)
}

fn rename_column(conn: &Connection, from: &str, to: &str) -> Result<()> {
    let sql = format!(
        "ALTER TABLE product RENAME COLUMN {} TO {}",
        quote_ident(from),
        quote_ident(to)
    );
    execute(conn, &sql, [])?;
    Ok(())
}

fn encode_default(value: &Value) -> Result<Option<String>> {
    if value.is_null() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(value)?))
}

fn field_from_row(row: &Row) -> rusqlite::Result<(FieldDefinition, Option<String>)> {
    Ok((
        FieldDefinition {
            id: row.get("id")?,
            name: row.get("name")?,
            field_type: row.get("field_type")?,
            required: row.get("required")?,
            default_value: Value::Null,
            position: row.get("position")?,
        },
        row.get("default_value")?,
    ))
}

fn decode(row: (FieldDefinition, Option<String>)) -> Result<FieldDefinition> {
    let (mut field, default) = row;
    if let Some(json) = default {
        field.default_value = serde_json::from_str(&json)?;
    }
    Ok(field)
}

fn load_fields(conn: &Connection) -> Result<Vec<FieldDefinition>> {
    let sql = format!("SELECT {} FROM field_definition ORDER BY position, id", FIELD_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], field_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(decode).collect()
}

/// Looks a field up by name, ignoring case like SQLite does for columns.
fn find_field(conn: &Connection, name: &str) -> Result<Option<FieldDefinition>> {
    let sql = format!("SELECT {} FROM field_definition WHERE name = ?", FIELD_COLUMNS);
    conn.query_row(&sql, [name], field_from_row)
        .optional()?
        .map(decode)
        .transpose()
}

fn field_by_id(conn: &Connection, id: i64) -> Result<FieldDefinition> {
    let sql = format!("SELECT {} FROM field_definition WHERE id = ?", FIELD_COLUMNS);
    decode(conn.query_row(&sql, [id], field_from_row)?)
}
