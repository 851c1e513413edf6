//! Inventory API Library
//!
//! Tracks stock per product code, serves it over HTTP and applies stock
//! decrements as locked, all-or-nothing units of work.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod notifications;
pub mod openapi;
pub mod services;
pub mod store;
pub mod tracing;

use axum::{routing::get, Router};
use std::sync::Arc;

use crate::auth::{AuthRouterExt, AuthService};
use crate::services::stock::StockService;
use crate::store::QuantityStore;

/// Shared application state. Every handle is created at startup and passed
/// in explicitly; nothing here is process-global.
#[derive(Clone)]
pub struct AppState {
    pub config: config::AppConfig,
    pub store: Arc<dyn QuantityStore>,
    pub stock_service: StockService,
    pub auth: Arc<AuthService>,
}

/// Builds the inventory router: public reads, bearer-authenticated decrement
/// and admin-only management routes.
pub fn inventory_routes(auth: Arc<AuthService>) -> Router<AppState> {
    let reads = Router::new()
        .route("/inventory", get(handlers::inventory::list_inventory))
        .route(
            "/inventory/:productCode",
            get(handlers::inventory::get_product_stock),
        );

    let decrement = Router::new()
        .route(
            "/inventory/decrease",
            axum::routing::post(handlers::inventory::decrease_stock),
        )
        .with_auth(auth.clone());

    let management = Router::new()
        .route(
            "/inventory",
            axum::routing::post(handlers::inventory::create_products)
                .delete(handlers::inventory::delete_products),
        )
        .route(
            "/inventory/increase",
            axum::routing::post(handlers::inventory::increase_stock),
        )
        .with_admin(auth);

    // Management routes share the "/inventory" path with the public list, so
    // the method routers are merged rather than nested.
    Router::new()
        .merge(reads)
        .merge(decrement)
        .merge(management)
}

/// Full application router without the outer tower layers.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .merge(inventory_routes(state.auth.clone()))
        .route("/health", get(health::health_check))
        .merge(openapi::swagger_ui())
        .layer(axum::middleware::from_fn(
            middleware::request_id::request_id_middleware,
        ))
        .with_state(state)
}
