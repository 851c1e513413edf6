use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::HeaderValue;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
};
use tracing::{error, info, warn};

use inventory_api as api;
use inventory_api::config::{AppConfig, StoreBackend};
use inventory_api::notifications::{HttpShipmentNotifier, LoggingShipmentNotifier, ShipmentNotifier};
use inventory_api::store::{DatabaseQuantityStore, InMemoryQuantityStore, QuantityStore};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config().context("failed to load configuration")?;
    api::config::init_tracing(&cfg.log_level, cfg.log_json);

    let store = build_store(&cfg).await?;
    let notifier = build_notifier(&cfg)?;

    let auth = Arc::new(api::auth::AuthService::new(
        &cfg.jwt_secret,
        cfg.admin_override_key.clone(),
    ));
    let stock_service = api::services::stock::StockService::new(
        store.clone(),
        notifier,
        cfg.stock_lock_timeout(),
    );

    let app_state = api::AppState {
        config: cfg.clone(),
        store: store.clone(),
        stock_service,
        auth,
    };

    let app = api::app_router(app_state)
        .layer(api::tracing::configure_http_tracing())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(cors_layer(&cfg));

    let host: std::net::IpAddr = cfg
        .host
        .parse()
        .with_context(|| format!("invalid host address {}", cfg.host))?;
    let addr = SocketAddr::new(host, cfg.port);
    info!("inventory-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped; closing store");
    if let Err(e) = store.close().await {
        warn!("Failed to close store cleanly: {}", e);
    }

    Ok(())
}

async fn build_store(cfg: &AppConfig) -> anyhow::Result<Arc<dyn QuantityStore>> {
    match cfg.store_backend {
        StoreBackend::Database => {
            let db = api::db::establish_connection_with_config(&api::db::DbConfig::from(cfg))
                .await
                .context("failed to connect to database")?;
            if cfg.auto_create_schema {
                api::db::ensure_schema(&db).await.map_err(|e| {
                    error!("Failed creating schema: {}", e);
                    e
                })?;
            }
            Ok(Arc::new(DatabaseQuantityStore::new(
                db,
                cfg.stock_lock_timeout(),
            )))
        }
        StoreBackend::InMemory => {
            warn!("Using the in-memory store; stock is lost on restart");
            Ok(Arc::new(InMemoryQuantityStore::new()))
        }
    }
}

fn build_notifier(cfg: &AppConfig) -> anyhow::Result<Arc<dyn ShipmentNotifier>> {
    match &cfg.shipping_notifier_url {
        Some(url) => {
            info!("Shipment notices will be posted to {}", url);
            let notifier = HttpShipmentNotifier::new(url.clone(), cfg.shipping_notifier_timeout())
                .context("failed to build shipping notifier client")?;
            Ok(Arc::new(notifier))
        }
        None => {
            info!("Shipping notifier URL not configured; shipment notices are only logged");
            Ok(Arc::new(LoggingShipmentNotifier))
        }
    }
}

fn cors_layer(cfg: &AppConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = cfg
        .cors_origins()
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    if !origins.is_empty() {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    } else if cfg.is_development() {
        info!("Using permissive CORS in the development environment");
        CorsLayer::permissive()
    } else {
        warn!("No CORS origins configured; cross-origin requests will be rejected");
        CorsLayer::new()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
