//! # HTTP Server
//!
//! JSON API over the catalog, the schema registry and the version ledger.
//!
//! Provides endpoints:
//! - `/api/products` - list (`?q=` searches), create
//! - `/api/products/{id}` - read, update, delete
//! - `/api/compare?ids=1,2` - side-by-side comparison
//! - `/api/schema`, `/api/schema/fields/{name}` - field management
//! - `/api/versions`, `/api/versions/{id}/rollback` - ledger browsing and rollback
//! - `/healthz` - liveness check (always returns 200)
//!
//! Storage calls are synchronous, so handlers run them on tokio's blocking
//! pool.

use std::time::Instant;

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Number, Value};
use tokio::net::TcpListener;

use crate::catalog::Catalog;
use crate::error::CatalogError;
use crate::types::{Comparison, FieldDefinition, FieldSpec, FieldType, HistoryFilter, Product, VersionEntry};

pub async fn start_server(catalog: Catalog, bind_address: &str) -> Result<(), anyhow::Error> {
    let app = router(catalog);
    let listener = TcpListener::bind(bind_address).await?;

    log::info!("HTTP server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}

pub fn router(catalog: Catalog) -> Router {
    Router::new()
        .route("/api/products", get(list_products).post(create_product))
        .route(
            "/api/products/{id}",
            get(get_product).patch(update_product).delete(delete_product),
        )
        .route("/api/compare", get(compare))
        .route("/api/schema", get(list_fields))
        .route("/api/schema/fields", post(add_field))
        .route(
            "/api/schema/fields/{name}",
            patch(change_field).delete(drop_field),
        )
        .route("/api/versions", get(list_versions))
        .route("/api/versions/{id}", get(get_version))
        .route("/api/versions/{id}/rollback", post(rollback))
        .route("/healthz", get(healthz_handler))
        .layer(middleware::from_fn(log_request))
        .with_state(catalog)
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    log::info!(
        "{} {} {} ({:?})",
        method,
        path,
        response.status().as_u16(),
        started.elapsed()
    );
    response
}

/// Everything a handler can fail with.
#[derive(Debug)]
pub enum ApiError {
    Catalog(CatalogError),
    BadRequest(String),
    Internal(String),
}

impl From<CatalogError> for ApiError {
    fn from(e: CatalogError) -> Self {
        ApiError::Catalog(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Catalog(e) => match e {
                CatalogError::NotFound(_) | CatalogError::UnknownEntry(_) | CatalogError::UnknownField(_) => {
                    StatusCode::NOT_FOUND
                }
                CatalogError::DuplicateField(_) | CatalogError::FieldNoLongerExists { .. } => StatusCode::CONFLICT,
                CatalogError::InvalidFieldName(_)
                | CatalogError::InvalidValue { .. }
                | CatalogError::MissingRequiredField(_) => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::BadRequest(message) => message,
            ApiError::Catalog(e) if status != StatusCode::INTERNAL_SERVER_ERROR => e.to_string(),
            ApiError::Catalog(e) => {
                log::error!("request failed: {}", e);
                "Internal storage error".to_string()
            }
            ApiError::Internal(message) => {
                log::error!("request failed: {}", message);
                "Internal server error".to_string()
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn blocking<F, T>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> crate::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(ApiError::from)
}

/// A product as served by the API. Each cents field also gets a derived
/// amount in currency units: `price_cents` yields `price`, any other cents
/// field `x` yields `x_display`, unless that key is already taken.
pub fn product_json(product: &Product, fields: &[FieldDefinition]) -> Value {
    let mut map = Map::new();
    map.insert("id".to_string(), Value::from(product.id));
    for (name, value) in &product.fields {
        map.insert(name.clone(), value.clone());
    }
    for field in fields.iter().filter(|f| f.field_type == FieldType::Cents) {
        let key = match field.name.strip_suffix("_cents") {
            Some(base) if !base.is_empty() => base.to_string(),
            _ => format!("{}_display", field.name),
        };
        if map.contains_key(&key) {
            continue;
        }
        let amount = product
            .get(&field.name)
            .and_then(Value::as_i64)
            .and_then(|cents| Number::from_f64(cents as f64 / 100.0))
            .map_or(Value::Null, Value::Number);
        map.insert(key, amount);
    }
    Value::Object(map)
}

#[derive(Deserialize)]
struct ListQuery {
    q: Option<String>,
}

async fn list_products(State(catalog): State<Catalog>, Query(query): Query<ListQuery>) -> ApiResult<Json<Value>> {
    let (products, fields) = blocking(move || {
        let products = catalog.list_products(query.q.as_deref())?;
        Ok((products, catalog.registry().current_fields()?))
    })
    .await?;
    let products = products.iter().map(|p| product_json(p, &fields)).collect::<Vec<_>>();
    Ok(Json(json!({ "products": products })))
}

async fn get_product(State(catalog): State<Catalog>, Path(id): Path<i64>) -> ApiResult<Json<Value>> {
    let (product, fields) = blocking(move || Ok((catalog.get_product(id)?, catalog.registry().current_fields()?))).await?;
    Ok(Json(product_json(&product, &fields)))
}

async fn create_product(
    State(catalog): State<Catalog>,
    Json(values): Json<Map<String, Value>>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let (product, fields) =
        blocking(move || Ok((catalog.create_product(values)?, catalog.registry().current_fields()?))).await?;
    Ok((StatusCode::CREATED, Json(product_json(&product, &fields))))
}

async fn update_product(
    State(catalog): State<Catalog>,
    Path(id): Path<i64>,
    Json(values): Json<Map<String, Value>>,
) -> ApiResult<Json<Value>> {
    let (product, fields) =
        blocking(move || Ok((catalog.update_product(id, values)?, catalog.registry().current_fields()?))).await?;
    Ok(Json(product_json(&product, &fields)))
}

async fn delete_product(State(catalog): State<Catalog>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    blocking(move || catalog.delete_product(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct CompareQuery {
    ids: Option<String>,
}

fn parse_ids(ids: &str) -> ApiResult<Vec<i64>> {
    ids.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| {
            id.parse()
                .map_err(|_| ApiError::BadRequest(format!("Invalid product id: {}", id)))
        })
        .collect()
}

async fn compare(State(catalog): State<Catalog>, Query(query): Query<CompareQuery>) -> ApiResult<Json<Comparison>> {
    let ids = parse_ids(query.ids.as_deref().unwrap_or(""))?;
    let comparison = blocking(move || catalog.compare(&ids)).await?;
    Ok(Json(comparison))
}

async fn list_fields(State(catalog): State<Catalog>) -> ApiResult<Json<Value>> {
    let fields = blocking(move || catalog.registry().current_fields()).await?;
    Ok(Json(json!({ "fields": fields })))
}

async fn add_field(
    State(catalog): State<Catalog>,
    Json(spec): Json<FieldSpec>,
) -> ApiResult<(StatusCode, Json<FieldDefinition>)> {
    let field = blocking(move || catalog.registry().add(spec)).await?;
    Ok((StatusCode::CREATED, Json(field)))
}

#[derive(Deserialize)]
struct FieldChange {
    new_name: Option<String>,
    field_type: Option<FieldType>,
}

/// Retypes first, so a failed conversion leaves the name untouched.
async fn change_field(
    State(catalog): State<Catalog>,
    Path(name): Path<String>,
    Json(change): Json<FieldChange>,
) -> ApiResult<Json<FieldDefinition>> {
    let field = blocking(move || {
        let registry = catalog.registry();
        let mut field = registry.field(&name)?;
        if let Some(field_type) = change.field_type {
            field = registry.retype_field(&field.name, field_type)?;
        }
        if let Some(new_name) = change.new_name {
            field = registry.rename_field(&field.name, &new_name)?;
        }
        Ok(field)
    })
    .await?;
    Ok(Json(field))
}

async fn drop_field(State(catalog): State<Catalog>, Path(name): Path<String>) -> ApiResult<StatusCode> {
    blocking(move || catalog.registry().drop_field(&name)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct VersionsQuery {
    product_id: Option<i64>,
    field: Option<String>,
    limit: Option<usize>,
}

/// Oldest first, or the newest `limit` entries newest first.
async fn list_versions(State(catalog): State<Catalog>, Query(query): Query<VersionsQuery>) -> ApiResult<Json<Value>> {
    let filter = HistoryFilter {
        product_id: query.product_id,
        field_name: query.field,
    };
    let versions = blocking(move || match query.limit {
        Some(limit) => catalog.ledger().recent_matching(&filter, limit),
        None => catalog.ledger().history(filter)?.entries(),
    })
    .await?;
    Ok(Json(json!({ "versions": versions })))
}

async fn get_version(State(catalog): State<Catalog>, Path(id): Path<i64>) -> ApiResult<Json<VersionEntry>> {
    let entry = blocking(move || catalog.ledger().entry(id)).await?;
    Ok(Json(entry))
}

async fn rollback(State(catalog): State<Catalog>, Path(id): Path<i64>) -> ApiResult<Json<Value>> {
    let (entry, product, fields) = blocking(move || {
        let entry = catalog.ledger().rollback(id)?;
        let product = catalog.get_product(entry.product_id)?;
        Ok((entry, product, catalog.registry().current_fields()?))
    })
    .await?;
    Ok(Json(json!({
        "version": entry,
        "product": product_json(&product, &fields),
    })))
}

async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}
