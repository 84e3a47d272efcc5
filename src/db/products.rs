//! Row-level access to the `product` table. Column lists always come from
//! the field definitions passed in, never from the table itself.

use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};

use crate::db::{execute, quote_ident};
use crate::error::Result;
use crate::types::{json_to_sql, sql_to_json, FieldDefinition, Product};

fn select_sql(fields: &[FieldDefinition]) -> String {
    let columns = std::iter::once("id".to_string())
        .chain(fields.iter().map(|f| quote_ident(&f.name)))
        .collect::<Vec<_>>();
    format!("SELECT {} FROM product", columns.join(", "))
}

fn from_row(row: &Row, fields: &[FieldDefinition]) -> rusqlite::Result<Product> {
    let mut values = Map::new();
    for (i, field) in fields.iter().enumerate() {
        values.insert(field.name.clone(), sql_to_json(row.get_ref(i + 1)?));
    }
    Ok(Product {
        id: row.get(0)?,
        fields: values,
    })
}

pub(crate) fn load(conn: &Connection, fields: &[FieldDefinition], id: i64) -> Result<Option<Product>> {
    let sql = format!("{} WHERE id = ?", select_sql(fields));
    Ok(conn
        .query_row(&sql, [id], |row| from_row(row, fields))
        .optional()?)
}

/// Every product, newest first.
pub(crate) fn all(conn: &Connection, fields: &[FieldDefinition]) -> Result<Vec<Product>> {
    let sql = format!("{} ORDER BY id DESC", select_sql(fields));
    let mut stmt = conn.prepare(&sql)?;
    let products = stmt
        .query_map([], |row| from_row(row, fields))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(products)
}

pub(crate) fn exists(conn: &Connection, id: i64) -> Result<bool> {
    Ok(conn.prepare("SELECT 1 FROM product WHERE id = ?")?.exists([id])?)
}

pub(crate) fn count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM product", [], |row| row.get(0))?)
}

pub(crate) fn insert(conn: &Connection, values: &Map<String, Value>) -> Result<i64> {
    if values.is_empty() {
        execute(conn, "INSERT INTO product DEFAULT VALUES", [])?;
        return Ok(conn.last_insert_rowid());
    }
    let columns = values.keys().map(|k| quote_ident(k)).collect::<Vec<_>>();
    let placeholders = vec!["?"; values.len()].join(", ");
    let sql = format!(
        "INSERT INTO product ({}) VALUES ({})",
        columns.join(", "),
        placeholders
    );
    execute(conn, &sql, params_from_iter(values.values().map(json_to_sql)))?;
    Ok(conn.last_insert_rowid())
}

/// Writes the given columns of one product.
pub(crate) fn update(conn: &Connection, id: i64, changes: &[(String, Value)]) -> Result<()> {
    if changes.is_empty() {
        return Ok(());
    }
    let set_clause = changes
        .iter()
        .map(|(name, _)| format!("{} = ?", quote_ident(name)))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("UPDATE product SET {} WHERE id = ?", set_clause);
    let params = changes
        .iter()
        .map(|(_, value)| json_to_sql(value))
        .chain(std::iter::once(rusqlite::types::Value::Integer(id)));
    execute(conn, &sql, params_from_iter(params))?;
    Ok(())
}

/// Sets one column on every product.
pub(crate) fn fill(conn: &Connection, field: &str, value: &Value) -> Result<usize> {
    let sql = format!("UPDATE product SET {} = ?", quote_ident(field));
    execute(conn, &sql, [json_to_sql(value)])
}

pub(crate) fn delete(conn: &Connection, id: i64) -> Result<bool> {
    Ok(execute(conn, "DELETE FROM product WHERE id = ?", [id])? > 0)
}
