//! Version Ledger
//!
//! Append-only log of field-level value changes. Entries are never updated or
//! deleted, not even when their product or field goes away.

use std::collections::VecDeque;

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::db::{execute, products, Db};
use crate::error::{CatalogError, Result};
use crate::schema::SchemaRegistry;
use crate::types::{ChangeKind, FieldDefinition, FieldType, HistoryFilter, VersionEntry};

pub const DEFAULT_PAGE_SIZE: usize = 100;

const ENTRY_COLUMNS: &str =
    "id, product_id, field_name, field_id, old_value, new_value, changed_at, kind, reverts, field_type";

/// A change about to be appended.
pub(crate) struct NewEntry<'a> {
    pub product_id: i64,
    pub field_name: &'a str,
    pub field_id: Option<i64>,
    pub field_type: Option<FieldType>,
    pub old_value: &'a Value,
    pub new_value: &'a Value,
    pub kind: ChangeKind,
    pub reverts: Option<i64>,
}

impl<'a> NewEntry<'a> {
    /// An edit of a registered field.
    pub fn edit(product_id: i64, field: &'a FieldDefinition, old_value: &'a Value, new_value: &'a Value) -> Self {
        Self {
            product_id,
            field_name: &field.name,
            field_id: Some(field.id),
            field_type: Some(field.field_type),
            old_value,
            new_value,
            kind: ChangeKind::Edit,
            reverts: None,
        }
    }

    fn reverting(mut self, entry_id: i64) -> Self {
        self.kind = ChangeKind::Rollback;
        self.reverts = Some(entry_id);
        self
    }
}

#[derive(Clone)]
pub struct VersionLedger {
    db: Db,
    registry: SchemaRegistry,
    page_size: usize,
}

impl VersionLedger {
    pub fn new(db: Db, registry: SchemaRegistry) -> Self {
        Self {
            db,
            registry,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Sets how many entries `History` reads per query.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Appends an edit entry for a product field. The field does not need to
    /// be registered; if it is, its id and type are recorded alongside the
    /// name.
    pub fn record(
        &self,
        product_id: i64,
        field_name: &str,
        old_value: Value,
        new_value: Value,
    ) -> Result<VersionEntry> {
        self.db.write(|txn| {
            if !products::exists(txn, product_id)? {
                return Err(CatalogError::NotFound(product_id));
            }
            let field = self.registry.find_in(txn, field_name)?;
            self.append_in(
                txn,
                NewEntry {
                    product_id,
                    field_name,
                    field_id: field.as_ref().map(|f| f.id),
                    field_type: field.as_ref().map(|f| f.field_type),
                    old_value: &old_value,
                    new_value: &new_value,
                    kind: ChangeKind::Edit,
                    reverts: None,
                },
            )
        })
    }

    /// Appends an entry inside the caller's transaction.
    pub(crate) fn append_in(&self, conn: &Connection, entry: NewEntry) -> Result<VersionEntry> {
        execute(
            conn,
            "INSERT INTO version_entry (product_id, field_name, field_id, field_type, old_value, new_value, changed_at, kind, reverts)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                entry.product_id,
                entry.field_name,
                entry.field_id,
                entry.field_type,
                serde_json::to_string(entry.old_value)?,
                serde_json::to_string(entry.new_value)?,
                Utc::now(),
                entry.kind,
                entry.reverts,
            ],
        )?;
        let id = conn.last_insert_rowid();
        load_entry(conn, id)?.ok_or(CatalogError::UnknownEntry(id))
    }

    /// Entries matching `filter`, oldest first. Only entries that exist now
    /// are included; the returned `History` can be iterated any number of
    /// times.
    pub fn history(&self, filter: HistoryFilter) -> Result<History> {
        let upper = self
            .db
            .read(|conn| Ok(conn.query_row("SELECT COALESCE(MAX(id), 0) FROM version_entry", [], |row| row.get(0))?))?;
        Ok(History {
            db: self.db.clone(),
            filter,
            upper,
            page_size: self.page_size,
        })
    }

    /// The newest `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<VersionEntry>> {
        self.recent_matching(&HistoryFilter::default(), limit)
    }

    pub fn recent_matching(&self, filter: &HistoryFilter, limit: usize) -> Result<Vec<VersionEntry>> {
        self.db.read(|conn| {
            let (clause, mut values) = where_clause(filter);
            values.push(rusqlite::types::Value::Integer(limit.try_into().unwrap_or(i64::MAX)));
            let sql = format!(
                "SELECT {} FROM version_entry {} ORDER BY id DESC LIMIT ?",
                ENTRY_COLUMNS, clause
            );
            let mut stmt = conn.prepare(&sql)?;
            let entries = stmt
                .query_map(params_from_iter(values), entry_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    pub fn entry(&self, id: i64) -> Result<VersionEntry> {
        self.db
            .read(|conn| load_entry(conn, id))?
            .ok_or(CatalogError::UnknownEntry(id))
    }

    /// Restores the value an entry replaced, recording the restore as a new
    /// `rollback` entry. If the field was retyped since, the value is
    /// converted the same way the retype converted stored values.
    pub fn rollback(&self, entry_id: i64) -> Result<VersionEntry> {
        let entry = self.db.write(|txn| {
            let target = load_entry(txn, entry_id)?.ok_or(CatalogError::UnknownEntry(entry_id))?;
            let field = self
                .registry
                .find_in(txn, &target.field_name)?
                .filter(|field| target.field_id.map_or(true, |id| id == field.id))
                .ok_or_else(|| CatalogError::FieldNoLongerExists {
                    entry: entry_id,
                    field: target.field_name.clone(),
                })?;

            let fields = self.registry.fields_in(txn)?;
            let product = products::load(txn, &fields, target.product_id)?
                .ok_or(CatalogError::NotFound(target.product_id))?;
            let current = product.get(&field.name).cloned().unwrap_or(Value::Null);
            let restored = match target.field_type {
                Some(recorded) if recorded != field.field_type => {
                    field.field_type.convert_from(recorded, &field.name, &target.old_value)?
                }
                _ => target.old_value.clone(),
            };
            let restored = field.coerce(&restored)?;

            products::update(txn, product.id, &[(field.name.clone(), restored.clone())])?;
            self.append_in(
                txn,
                NewEntry::edit(product.id, &field, &current, &restored).reverting(entry_id),
            )
        })?;

        log::info!(
            "rolled back entry {} on product {} field {}",
            entry_id,
            entry.product_id,
            entry.field_name
        );
        Ok(entry)
    }
}

fn load_entry(conn: &Connection, id: i64) -> Result<Option<VersionEntry>> {
    let sql = format!("SELECT {} FROM version_entry WHERE id = ?", ENTRY_COLUMNS);
    Ok(conn.query_row(&sql, [id], entry_from_row).optional()?)
}

fn json_column(row: &Row, idx: usize) -> rusqlite::Result<Value> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn entry_from_row(row: &Row) -> rusqlite::Result<VersionEntry> {
    Ok(VersionEntry {
        id: row.get(0)?,
        product_id: row.get(1)?,
        field_name: row.get(2)?,
        field_id: row.get(3)?,
        field_type: row.get(9)?,
        old_value: json_column(row, 4)?,
        new_value: json_column(row, 5)?,
        changed_at: row.get(6)?,
        kind: row.get(7)?,
        reverts: row.get(8)?,
    })
}

fn where_clause(filter: &HistoryFilter) -> (String, Vec<rusqlite::types::Value>) {
    let mut conditions = Vec::new();
    let mut values = Vec::new();
    if let Some(product_id) = filter.product_id {
        conditions.push("product_id = ?");
        values.push(rusqlite::types::Value::Integer(product_id));
    }
    if let Some(field_name) = &filter.field_name {
        conditions.push("field_name = ? COLLATE NOCASE");
        values.push(rusqlite::types::Value::Text(field_name.clone()));
    }
    if conditions.is_empty() {
        (String::new(), values)
    } else {
        (format!("WHERE {}", conditions.join(" AND ")), values)
    }
}

/// Ledger entries matching a filter, bounded by the ledger's size when the
/// history was requested. Each iteration starts from the oldest entry and
/// reads one page at a time, holding a pooled connection only while a page
/// is being read.
pub struct History {
    db: Db,
    filter: HistoryFilter,
    upper: i64,
    page_size: usize,
}

impl History {
    pub fn iter(&self) -> HistoryIter<'_> {
        HistoryIter {
            history: self,
            after: 0,
            page: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Reads every entry.
    pub fn entries(&self) -> Result<Vec<VersionEntry>> {
        self.iter().collect()
    }

    fn page(&self, after: i64) -> Result<Vec<VersionEntry>> {
        self.db.read(|conn| {
            let (clause, mut values) = where_clause(&self.filter);
            let clause = if clause.is_empty() {
                "WHERE id > ? AND id <= ?".to_string()
            } else {
                format!("{} AND id > ? AND id <= ?", clause)
            };
            values.push(rusqlite::types::Value::Integer(after));
            values.push(rusqlite::types::Value::Integer(self.upper));
            values.push(rusqlite::types::Value::Integer(self.page_size.try_into().unwrap_or(i64::MAX)));
            let sql = format!(
                "SELECT {} FROM version_entry {} ORDER BY id LIMIT ?",
                ENTRY_COLUMNS, clause
            );
            let mut stmt = conn.prepare(&sql)?;
            let entries = stmt
                .query_map(params_from_iter(values), entry_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }
}

impl<'a> IntoIterator for &'a History {
    type Item = Result<VersionEntry>;
    type IntoIter = HistoryIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct HistoryIter<'a> {
    history: &'a History,
    after: i64,
    page: VecDeque<VersionEntry>,
    exhausted: bool,
}

impl Iterator for HistoryIter<'_> {
    type Item = Result<VersionEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            match self.history.page(self.after) {
                Ok(page) => {
                    self.exhausted = page.len() < self.history.page_size;
                    if let Some(last) = page.last() {
                        self.after = last.id;
                    }
                    self.page.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        self.page.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::*;

    fn ledger() -> Result<VersionLedger> {
        let db = Db::open_memory()?;
        Ok(VersionLedger::new(db.clone(), SchemaRegistry::new(db)))
    }

    fn insert_product(ledger: &VersionLedger, price_cents: i64) -> Result<i64> {
        ledger.db.write(|txn| {
            let mut values = Map::new();
            values.insert("name".to_string(), json!("Lamp"));
            values.insert("price_cents".to_string(), json!(price_cents));
            products::insert(txn, &values)
        })
    }

    fn set_price(ledger: &VersionLedger, id: i64, price_cents: i64) -> Result<()> {
        ledger
            .db
            .write(|txn| products::update(txn, id, &[("price_cents".to_string(), json!(price_cents))]))
    }

    fn price(ledger: &VersionLedger, id: i64) -> Result<Value> {
        let fields = ledger.registry.current_fields()?;
        let product = ledger
            .db
            .read(|conn| products::load(conn, &fields, id))?
            .ok_or(CatalogError::NotFound(id))?;
        Ok(product.get("price_cents").cloned().unwrap_or(Value::Null))
    }

    #[test]
    fn record_assigns_increasing_ids() -> anyhow::Result<()> {
        let ledger = ledger()?;
        let id = insert_product(&ledger, 100)?;
        let first = ledger.record(id, "price_cents", json!(100), json!(200))?;
        let second = ledger.record(id, "name", json!("Lamp"), json!("Desk lamp"))?;
        assert!(second.id > first.id);
        assert_eq!(first.kind, ChangeKind::Edit);
        assert_eq!(first.field_id, Some(ledger.registry.field("price_cents")?.id));
        assert_eq!(ledger.entry(first.id)?, first);
        Ok(())
    }

    #[test]
    fn record_requires_product() -> anyhow::Result<()> {
        let ledger = ledger()?;
        assert!(matches!(
            ledger.record(99, "price_cents", json!(1), json!(2)),
            Err(CatalogError::NotFound(99))
        ));
        Ok(())
    }

    #[test]
    fn unknown_entry() -> anyhow::Result<()> {
        let ledger = ledger()?;
        assert!(matches!(ledger.entry(7), Err(CatalogError::UnknownEntry(7))));
        assert!(matches!(ledger.rollback(7), Err(CatalogError::UnknownEntry(7))));
        Ok(())
    }

    #[test]
    fn history_filters_and_orders() -> anyhow::Result<()> {
        let ledger = ledger()?;
        let a = insert_product(&ledger, 100)?;
        let b = insert_product(&ledger, 300)?;
        ledger.record(a, "price_cents", json!(100), json!(150))?;
        ledger.record(b, "price_cents", json!(300), json!(350))?;
        ledger.record(a, "stock", json!(0), json!(4))?;

        let for_a = ledger.history(HistoryFilter::product(a))?.entries()?;
        assert_eq!(for_a.len(), 2);
        assert!(for_a[0].id < for_a[1].id);
        assert!(for_a.iter().all(|e| e.product_id == a));

        let prices = ledger.history(HistoryFilter::field("price_cents"))?.entries()?;
        assert_eq!(prices.iter().map(|e| e.product_id).collect::<Vec<_>>(), vec![a, b]);

        let both = HistoryFilter {
            product_id: Some(a),
            field_name: Some("stock".to_string()),
        };
        assert_eq!(ledger.history(both)?.entries()?.len(), 1);

        let recent = ledger.recent(2)?;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].field_name, "stock");
        Ok(())
    }

    #[test]
    fn field_filter_ignores_case() -> anyhow::Result<()> {
        let ledger = ledger()?;
        let id = insert_product(&ledger, 100)?;
        let edit = ledger.record(id, "price_cents", json!(100), json!(200))?;

        assert_eq!(ledger.history(HistoryFilter::field("PRICE_CENTS"))?.entries()?, vec![edit.clone()]);
        let filter = HistoryFilter::field("Price_Cents");
        assert_eq!(ledger.recent_matching(&filter, 5)?, vec![edit]);
        Ok(())
    }

    #[test]
    fn history_pages_and_restarts() -> anyhow::Result<()> {
        let ledger = ledger()?.with_page_size(2);
        let id = insert_product(&ledger, 0)?;
        for n in 0..5 {
            ledger.record(id, "stock", json!(n), json!(n + 1))?;
        }

        let history = ledger.history(HistoryFilter::product(id))?;
        // Entries appended after the call are outside the sequence.
        ledger.record(id, "stock", json!(5), json!(6))?;

        let first: Vec<VersionEntry> = history.iter().collect::<Result<_>>()?;
        let second: Vec<VersionEntry> = (&history).into_iter().collect::<Result<_>>()?;
        assert_eq!(first.len(), 5);
        assert_eq!(first, second);
        assert_eq!(first.last().map(|e| e.new_value.clone()), Some(json!(5)));
        assert_eq!(ledger.history(HistoryFilter::product(id))?.entries()?.len(), 6);
        Ok(())
    }

    #[test]
    fn empty_history() -> anyhow::Result<()> {
        let ledger = ledger()?;
        assert!(ledger.history(HistoryFilter::default())?.entries()?.is_empty());
        assert!(ledger.recent(10)?.is_empty());
        Ok(())
    }

    #[test]
    fn rollback_restores_previous_value() -> anyhow::Result<()> {
        let ledger = ledger()?;
        let id = insert_product(&ledger, 100)?;
        set_price(&ledger, id, 200)?;
        let edit = ledger.record(id, "price_cents", json!(100), json!(200))?;

        let rollback = ledger.rollback(edit.id)?;
        assert_eq!(price(&ledger, id)?, json!(100));
        assert_eq!(rollback.kind, ChangeKind::Rollback);
        assert_eq!(rollback.reverts, Some(edit.id));
        assert_eq!(rollback.old_value, json!(200));
        assert_eq!(rollback.new_value, json!(100));

        let history = ledger.history(HistoryFilter::product(id))?.entries()?;
        assert_eq!(history, vec![edit, rollback]);
        Ok(())
    }

    #[test]
    fn rollback_converts_across_retype() -> anyhow::Result<()> {
        let ledger = ledger()?;
        let id = insert_product(&ledger, 100)?;
        set_price(&ledger, id, 200)?;
        let edit = ledger.record(id, "price_cents", json!(100), json!(200))?;
        assert_eq!(edit.field_type, Some(FieldType::Cents));

        ledger.registry.retype_field("price_cents", FieldType::Real)?;
        assert_eq!(price(&ledger, id)?, json!(2.0));

        let rollback = ledger.rollback(edit.id)?;
        assert_eq!(price(&ledger, id)?, json!(1.0));
        assert_eq!(rollback.field_type, Some(FieldType::Real));
        assert_eq!((rollback.old_value, rollback.new_value), (json!(2.0), json!(1.0)));
        Ok(())
    }

    #[test]
    fn rollback_after_rename_or_drop_fails() -> anyhow::Result<()> {
        let ledger = ledger()?;
        let id = insert_product(&ledger, 100)?;
        set_price(&ledger, id, 200)?;
        let edit = ledger.record(id, "price_cents", json!(100), json!(200))?;

        ledger.registry.rename_field("price_cents", "cost_cents")?;
        assert!(matches!(
            ledger.rollback(edit.id),
            Err(CatalogError::FieldNoLongerExists { entry, field }) if entry == edit.id && field == "price_cents"
        ));

        // Same name again, but a different field.
        ledger.registry.drop_field("cost_cents")?;
        ledger.registry.add_field("price_cents", FieldType::Cents, json!(0))?;
        assert!(matches!(
            ledger.rollback(edit.id),
            Err(CatalogError::FieldNoLongerExists { .. })
        ));
        assert_eq!(price(&ledger, id)?, json!(0));
        assert_eq!(ledger.history(HistoryFilter::product(id))?.entries()?.len(), 1);
        Ok(())
    }

    #[test]
    fn rollback_of_deleted_product_fails() -> anyhow::Result<()> {
        let ledger = ledger()?;
        let id = insert_product(&ledger, 100)?;
        let edit = ledger.record(id, "price_cents", json!(100), json!(200))?;
        ledger.db.write(|txn| products::delete(txn, id))?;

        assert!(matches!(ledger.rollback(edit.id), Err(CatalogError::NotFound(p)) if p == id));
        assert_eq!(ledger.history(HistoryFilter::product(id))?.entries()?.len(), 1);
        Ok(())
    }
}
