//! Liveness endpoint for external process monitoring.

use axum::{routing::get, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "insera-web";

pub const DEFAULT_PORT: u16 = 50000;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PORT),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub message: &'static str,
}

pub fn app() -> Router {
    Router::new().route("/", get(health_handler))
}

pub async fn serve(config: &WebConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "liveness endpoint listening");
    axum::serve(listener, app()).await?;
    Ok(())
}

async fn health_handler() -> Json<Health> {
    Json(Health {
        message: "Service is running",
    })
}
