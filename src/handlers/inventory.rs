use crate::{
    auth::{AuthUser, BearerToken},
    errors::{ServiceError, StockError},
    services::stock::{DecrementBatch, DecrementRequest, NewProduct},
    store::Product,
    AppState,
};
use axum::{
    extract::{rejection::JsonRejection, Extension, Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;
use validator::Validate;

#[derive(Debug, Deserialize, ToSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateProductRequest {
    #[schema(example = "SKU-1")]
    #[validate(length(min = 1, max = 128))]
    pub product_code: String,
    #[schema(example = 10)]
    pub stock: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeleteProductRequest {
    #[schema(example = "SKU-1")]
    pub product_code: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeleteProductsResponse {
    pub message: Vec<String>,
}

/// Stock change for one product
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StockRequest {
    #[schema(example = "SKU-1")]
    pub product_code: String,
    #[schema(example = 2)]
    pub quantity: i32,
}

#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct DecreaseStockRequest {
    pub items: Vec<StockRequest>,
    /// Shipment recipient; defaults to the caller's email
    #[validate(email)]
    #[schema(example = "buyer@example.com")]
    pub email: Option<String>,
}

/// List all products
#[utoipa::path(
    get,
    path = "/inventory",
    responses(
        (status = 200, description = "All products ordered by product code", body = [Product]),
        (status = 500, description = "Internal server error", body = crate::errors::ErrorResponse)
    ),
    tag = "Inventory"
)]
pub async fn list_inventory(
    State(state): State<AppState>,
) -> Result<Json<Vec<Product>>, ServiceError> {
    Ok(Json(state.stock_service.list_products().await?))
}

/// Get the stock of one product
#[utoipa::path(
    get,
    path = "/inventory/{productCode}",
    params(("productCode" = String, Path, description = "Product code")),
    responses(
        (status = 200, description = "Product found", body = Product),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Inventory"
)]
pub async fn get_product_stock(
    State(state): State<AppState>,
    Path(product_code): Path<String>,
) -> Result<Json<Product>, ServiceError> {
    Ok(Json(state.stock_service.get_product(&product_code).await?))
}

/// Create products (admin)
#[utoipa::path(
    post,
    path = "/inventory",
    request_body = [CreateProductRequest],
    responses(
        (status = 201, description = "Products created", body = [Product]),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 409, description = "Product already exists", body = crate::errors::ErrorResponse)
    ),
    security(("BearerAuth" = [])),
    tag = "Inventory Management"
)]
pub async fn create_products(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    payload: Result<Json<Vec<CreateProductRequest>>, JsonRejection>,
) -> Result<impl IntoResponse, ServiceError> {
    let Json(payload) = payload?;
    for product in &payload {
        product
            .validate()
            .map_err(|e| StockError::Validation(e.to_string()))?;
    }

    let products = payload
        .into_iter()
        .map(|p| NewProduct {
            product_code: p.product_code,
            stock: p.stock,
        })
        .collect();

    let created = state.stock_service.create_products(products).await?;
    info!(admin = %admin.subject_id, count = created.len(), "products created");
    Ok((StatusCode::CREATED, Json(created)))
}

/// Delete products (admin)
#[utoipa::path(
    delete,
    path = "/inventory",
    request_body = [DeleteProductRequest],
    responses(
        (status = 200, description = "Products deleted", body = DeleteProductsResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse)
    ),
    security(("BearerAuth" = [])),
    tag = "Inventory Management"
)]
pub async fn delete_products(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    payload: Result<Json<Vec<DeleteProductRequest>>, JsonRejection>,
) -> Result<Json<DeleteProductsResponse>, ServiceError> {
    let Json(payload) = payload?;
    let codes = payload.into_iter().map(|p| p.product_code).collect();
    let message = state.stock_service.delete_products(codes).await?;
    info!(admin = %admin.subject_id, count = message.len(), "products deleted");
    Ok(Json(DeleteProductsResponse { message }))
}

/// Increase the stock of one product (admin)
#[utoipa::path(
    post,
    path = "/inventory/increase",
    request_body = StockRequest,
    responses(
        (status = 200, description = "Stock increased", body = Product),
        (status = 400, description = "Invalid quantity", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse)
    ),
    security(("BearerAuth" = [])),
    tag = "Stock Management"
)]
pub async fn increase_stock(
    State(state): State<AppState>,
    payload: Result<Json<StockRequest>, JsonRejection>,
) -> Result<Json<Product>, ServiceError> {
    let Json(payload) = payload?;
    let product = state
        .stock_service
        .increase_stock(&payload.product_code, payload.quantity)
        .await?;
    Ok(Json(product))
}

/// Decrease stock for several products in one all-or-nothing batch
#[utoipa::path(
    post,
    path = "/inventory/decrease",
    request_body = DecreaseStockRequest,
    responses(
        (status = 200, description = "Stock decreased", body = [Product]),
        (status = 400, description = "Invalid quantity or insufficient stock", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse),
        (status = 503, description = "Stock locked by a concurrent request", body = crate::errors::ErrorResponse)
    ),
    security(("BearerAuth" = [])),
    tag = "Stock Management"
)]
pub async fn decrease_stock(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Extension(BearerToken(token)): Extension<BearerToken>,
    payload: Result<Json<DecreaseStockRequest>, JsonRejection>,
) -> Result<Json<Vec<Product>>, ServiceError> {
    let Json(payload) = payload?;
    payload
        .validate()
        .map_err(|e| StockError::Validation(e.to_string()))?;

    let batch = DecrementBatch {
        items: payload
            .items
            .into_iter()
            .map(|item| DecrementRequest::new(item.product_code, item.quantity))
            .collect(),
        requester: user,
        bearer_token: token,
        recipient_email: payload.email,
    };

    Ok(Json(state.stock_service.decrement(batch).await?))
}
