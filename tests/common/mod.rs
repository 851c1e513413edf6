#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use inventory_api::{
    auth::AuthService,
    config::AppConfig,
    db,
    notifications::{DeliveryOutcome, ShipmentNotice, ShipmentNotifier},
    services::stock::{NewProduct, StockService},
    store::{DatabaseQuantityStore, QuantityStore},
    AppState,
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tower::ServiceExt;

pub const TEST_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";
pub const OVERRIDE_KEY: &str = "test-override-key";

/// Captures shipment notices instead of posting them.
pub struct RecordingNotifier {
    tx: mpsc::UnboundedSender<(String, ShipmentNotice)>,
}

#[async_trait]
impl ShipmentNotifier for RecordingNotifier {
    async fn notify(&self, token: &str, notice: &ShipmentNotice) -> DeliveryOutcome {
        let _ = self.tx.send((token.to_string(), notice.clone()));
        DeliveryOutcome {
            delivered: true,
            status: Some(200),
            detail: "recorded".into(),
        }
    }
}

/// Helper harness for spinning up the router over an in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    notices: Mutex<mpsc::UnboundedReceiver<(String, ShipmentNotice)>>,
}

impl TestApp {
    pub async fn new() -> Self {
        let mut cfg = AppConfig::new(TEST_SECRET);
        cfg.environment = "test".to_string();
        cfg.admin_override_key = Some(OVERRIDE_KEY.to_string());
        cfg.stock_lock_timeout_ms = 2_000;

        let pool = db::establish_connection_with_config(&db::DbConfig::in_memory())
            .await
            .expect("failed to create test database");
        db::ensure_schema(&pool).await.expect("create schema");

        let store: Arc<dyn QuantityStore> =
            Arc::new(DatabaseQuantityStore::new(pool, cfg.stock_lock_timeout()));
        let (tx, rx) = mpsc::unbounded_channel();
        let stock_service = StockService::new(
            store.clone(),
            Arc::new(RecordingNotifier { tx }),
            cfg.stock_lock_timeout(),
        );
        let auth = Arc::new(AuthService::new(
            &cfg.jwt_secret,
            cfg.admin_override_key.clone(),
        ));

        let state = AppState {
            config: cfg,
            store,
            stock_service,
            auth,
        };

        Self {
            router: inventory_api::app_router(state.clone()),
            state,
            notices: Mutex::new(rx),
        }
    }

    pub async fn seed(&self, products: &[(&str, i32)]) {
        self.state
            .stock_service
            .create_products(
                products
                    .iter()
                    .map(|(code, stock)| NewProduct {
                        product_code: code.to_string(),
                        stock: *stock,
                    })
                    .collect(),
            )
            .await
            .expect("seed products");
    }

    pub async fn stock_of(&self, product_code: &str) -> Option<i32> {
        self.state
            .store
            .get(product_code)
            .await
            .expect("read stock")
            .map(|p| p.stock)
    }

    /// Next recorded shipment notice, if one arrives within a second.
    pub async fn next_notice(&self) -> Option<(String, ShipmentNotice)> {
        let mut rx = self.notices.lock().await;
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// True when no notice arrives within a short grace period.
    pub async fn no_notice(&self) -> bool {
        let mut rx = self.notices.lock().await;
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err()
    }

    /// Send a request against the router with optional bearer token and extra headers.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn get(&self, uri: &str) -> Response {
        self.request(Method::GET, uri, None, None, &[]).await
    }
}

/// HS256 token signed with the test secret, valid for an hour.
pub fn token_for(sub: &str, email: &str, roles: &[&str]) -> String {
    let claims = json!({
        "sub": sub,
        "email": email,
        "role": roles,
        "exp": (Utc::now() + chrono::Duration::hours(1)).timestamp(),
    });
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .expect("encode access token")
}

pub fn customer_token() -> String {
    token_for("user-1", "customer@example.com", &["customer"])
}

pub fn admin_token() -> String {
    token_for("admin-1", "admin@example.com", &["admin"])
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}
