use product_catalog::types::{ChangeKind, FieldType, HistoryFilter, NOT_AVAILABLE};
use product_catalog::{Catalog, CatalogConfig, CatalogError};
use serde_json::{json, Map, Value};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn memory_catalog() -> anyhow::Result<Catalog> {
    let config = CatalogConfig {
        database_url: "memory://".to_string(),
        ..Default::default()
    };
    Ok(Catalog::open(&config)?)
}

fn values(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[test]
fn rollback_round_trip() -> anyhow::Result<()> {
    init_logging();
    let catalog = memory_catalog()?;
    let product = catalog.create_product(values(json!({"name": "Widget", "price_cents": 100})))?;

    catalog.update_product(product.id, values(json!({"price_cents": 200})))?;
    let history = catalog.ledger().history(HistoryFilter::product(product.id))?.entries()?;
    assert_eq!(history.len(), 1);
    let e1 = history[0].clone();
    assert_eq!((e1.old_value.clone(), e1.new_value.clone()), (json!(100), json!(200)));

    let e2 = catalog.ledger().rollback(e1.id)?;
    assert_eq!(catalog.get_product(product.id)?.get("price_cents"), Some(&json!(100)));
    assert_eq!((e2.old_value.clone(), e2.new_value.clone()), (json!(200), json!(100)));
    assert_eq!(e2.kind, ChangeKind::Rollback);

    let history = catalog.ledger().history(HistoryFilter::product(product.id))?.entries()?;
    assert_eq!(history, vec![e1, e2]);
    Ok(())
}

#[test]
fn rollback_after_retype_keeps_units() -> anyhow::Result<()> {
    init_logging();
    let catalog = memory_catalog()?;
    let product = catalog.create_product(values(json!({"name": "Widget", "price_cents": 100})))?;
    catalog.update_product(product.id, values(json!({"price_cents": 200})))?;
    let e1 = catalog.ledger().recent(1)?.remove(0);
    assert_eq!(e1.field_type, Some(FieldType::Cents));

    catalog.registry().retype_field("price_cents", FieldType::Real)?;
    assert_eq!(catalog.get_product(product.id)?.get("price_cents"), Some(&json!(2.0)));

    catalog.ledger().rollback(e1.id)?;
    assert_eq!(catalog.get_product(product.id)?.get("price_cents"), Some(&json!(1.0)));
    Ok(())
}

#[test]
fn added_field_appears_on_every_product() -> anyhow::Result<()> {
    init_logging();
    let catalog = memory_catalog()?;
    for name in ["Lamp", "Chair", "Sofa"] {
        catalog.create_product(values(json!({"name": name})))?;
    }
    catalog.registry().add_field("warranty_years", FieldType::Integer, json!(2))?;

    let products = catalog.list_products(None)?;
    assert_eq!(products.len(), 3);
    assert!(products.iter().all(|p| p.get("warranty_years") == Some(&json!(2))));

    let created = catalog.create_product(values(json!({"name": "Desk"})))?;
    assert_eq!(created.get("warranty_years"), Some(&json!(2)));
    Ok(())
}

#[test]
fn schema_changes_never_touch_history() -> anyhow::Result<()> {
    init_logging();
    let catalog = memory_catalog()?;
    let product = catalog.create_product(values(json!({"name": "Lamp", "category": "Lighting"})))?;
    catalog.update_product(product.id, values(json!({"category": "Lamps"})))?;
    let entry = catalog.ledger().recent(1)?.remove(0);

    catalog.registry().rename_field("category", "department")?;
    assert!(matches!(
        catalog.ledger().rollback(entry.id),
        Err(CatalogError::FieldNoLongerExists { .. })
    ));
    assert_eq!(catalog.get_product(product.id)?.get("department"), Some(&json!("Lamps")));

    catalog.registry().drop_field("department")?;
    let kept = catalog.ledger().history(HistoryFilter::field("category"))?.entries()?;
    assert_eq!(kept, vec![entry]);
    assert!(matches!(
        catalog.update_product(product.id, values(json!({"department": "x"}))),
        Err(CatalogError::UnknownField(_))
    ));
    Ok(())
}

#[test]
fn rollback_follows_a_rename_back() -> anyhow::Result<()> {
    init_logging();
    let catalog = memory_catalog()?;
    let product = catalog.create_product(values(json!({"name": "Lamp", "stock": 3})))?;
    catalog.update_product(product.id, values(json!({"stock": 1})))?;
    let entry = catalog.ledger().recent(1)?.remove(0);

    // Renaming away and back keeps the field's identity.
    catalog.registry().rename_field("stock", "quantity")?;
    catalog.registry().rename_field("quantity", "stock")?;
    catalog.ledger().rollback(entry.id)?;
    assert_eq!(catalog.get_product(product.id)?.get("stock"), Some(&json!(3)));
    Ok(())
}

#[test]
fn compare_products() -> anyhow::Result<()> {
    init_logging();
    let catalog = memory_catalog()?;
    let a = catalog.create_product(values(json!({"name": "A", "price_cents": "12.34", "category": "Tools"})))?;
    let b = catalog.create_product(values(json!({"name": "B"})))?;

    let comparison = catalog.compare(&[a.id, b.id])?;
    let fields = catalog.registry().current_fields()?;
    assert_eq!(
        comparison.rows.iter().map(|r| r.field.clone()).collect::<Vec<_>>(),
        fields.iter().map(|f| f.name.clone()).collect::<Vec<_>>()
    );
    let category = comparison.rows.iter().find(|r| r.field == "category");
    assert_eq!(
        category.map(|r| r.values.clone()),
        Some(vec!["Tools".to_string(), NOT_AVAILABLE.to_string()])
    );
    let price = comparison.rows.iter().find(|r| r.field == "price_cents");
    assert_eq!(price.map(|r| r.values[0].clone()), Some("12.34".to_string()));

    assert!(matches!(catalog.compare(&[a.id, 999]), Err(CatalogError::NotFound(999))));
    Ok(())
}

#[test]
fn failed_retype_is_atomic() -> anyhow::Result<()> {
    init_logging();
    let catalog = memory_catalog()?;
    catalog.create_product(values(json!({"name": "Lamp", "description": "12"})))?;
    catalog.create_product(values(json!({"name": "Chair", "description": "wooden"})))?;
    let before_fields = catalog.registry().current_fields()?;
    let before_products = catalog.list_products(None)?;

    assert!(matches!(
        catalog.registry().retype_field("description", FieldType::Integer),
        Err(CatalogError::InvalidValue { .. })
    ));
    assert_eq!(catalog.registry().current_fields()?, before_fields);
    assert_eq!(catalog.list_products(None)?, before_products);
    Ok(())
}

#[test]
fn schema_and_history_survive_reopen() -> anyhow::Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let config = CatalogConfig {
        database_url: format!("file://{}", dir.path().join("catalog.db").display()),
        ..Default::default()
    };

    let product_id = {
        let catalog = Catalog::open(&config)?;
        catalog.registry().add_field("color", FieldType::Text, json!("black"))?;
        let product = catalog.create_product(values(json!({"name": "Lamp"})))?;
        catalog.update_product(product.id, values(json!({"color": "red"})))?;
        product.id
    };

    let catalog = Catalog::open(&config)?;
    assert_eq!(catalog.registry().field("color")?.default_value, json!("black"));
    assert_eq!(catalog.get_product(product_id)?.get("color"), Some(&json!("red")));
    assert_eq!(catalog.ledger().history(HistoryFilter::product(product_id))?.entries()?.len(), 1);
    Ok(())
}

#[test]
fn concurrent_updates_are_all_recorded() -> anyhow::Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let config = CatalogConfig {
        database_url: format!("file://{}", dir.path().join("catalog.db").display()),
        ..Default::default()
    };
    let catalog = Catalog::open(&config)?;
    let product = catalog.create_product(values(json!({"name": "Lamp"})))?;

    let handles = (1..=4)
        .map(|worker| {
            let catalog = catalog.clone();
            std::thread::spawn(move || -> product_catalog::Result<()> {
                for n in 0..5 {
                    catalog.update_product(product.id, values(json!({"stock": worker * 100 + n})))?;
                }
                Ok(())
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().map_err(|_| anyhow::anyhow!("writer panicked"))??;
    }

    let history = catalog.ledger().history(HistoryFilter::product(product.id))?.entries()?;
    assert_eq!(history.len(), 20);
    // Each entry starts from the value the previous one left behind.
    for pair in history.windows(2) {
        assert_eq!(pair[0].new_value, pair[1].old_value);
    }
    let last = history.last().map(|e| e.new_value.clone());
    assert_eq!(catalog.get_product(product.id)?.get("stock").cloned(), last);
    Ok(())
}
