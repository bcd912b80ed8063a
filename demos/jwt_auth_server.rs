use axum::routing::get;
use axum::{Json, Router};
use nila_oidc_auth::prelude::*;
use serde::Deserialize;
use std::fs;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
struct ServerConfig {
    listen_addr: String,
    auth: AuthConfig,
    refresh_interval_secs: Option<u64>,
    leeway_secs: Option<u64>,
    token_lookup: Option<String>,
    #[serde(default)]
    public_paths: Vec<String>,
    #[serde(default)]
    reject_when_unavailable: bool,
}

async fn me(actor: Actor) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "subject": actor.subject(),
        "issuer": actor.claims().issuer,
        "expires_at": actor.claims().expires_at,
        "scope": actor.claim::<String>("scope"),
    }))
}

async fn hello(actor: Option<Actor>) -> String {
    match actor {
        Some(actor) => format!("hello, {}", actor.subject()),
        None => "hello, stranger".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,nila_oidc_auth=debug")))
        .init();

    // --- Load Configuration from YAML ---
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "demos/auth_config.yaml".to_string());
    let config_str = fs::read_to_string(&config_path)
        .map_err(|e| format!("Failed to read config file {}: {}", config_path, e))?;
    let config: ServerConfig = serde_yaml::from_str(&config_str)
        .map_err(|e| format!("Failed to parse YAML config from {}: {}", config_path, e))?;

    // --- Configure the JWT middleware ---
    let mut key_fetch = KeyFetchOptions::new();
    if let Some(secs) = config.refresh_interval_secs {
        key_fetch = key_fetch.with_refresh_interval(Duration::from_secs(secs));
    }

    let public_paths = config.public_paths.clone();
    let mut validation = ValidationOptions::new()
        .with_skipper(move |parts| public_paths.iter().any(|p| parts.uri.path() == p));
    if let Some(secs) = config.leeway_secs {
        validation = validation.with_leeway(Duration::from_secs(secs));
    }
    if let Some(lookup) = &config.token_lookup {
        validation = validation.with_token_lookup(lookup.parse()?);
    }

    let auth = JwtAuth::new(
        config.auth,
        vec![with_key_fetch_options(key_fetch), with_validation_options(validation)],
    )
    .await;

    let policy = if config.reject_when_unavailable {
        OnSetupFailure::Reject
    } else {
        OnSetupFailure::PassThrough
    };

    let app = Router::new()
        .route("/me", get(me))
        .route("/hello", get(hello))
        .route("/healthz", get(|| async { "ok" }))
        .layer(JwtAuthLayer::from_setup(auth, policy));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("JWT auth demo listening on {}", config.listen_addr);
    println!(
        "Test with: curl -v -H \"Authorization: Bearer <YOUR_JWT_TOKEN>\" http://{}/me",
        config.listen_addr
    );
    axum::serve(listener, app).await?;
    Ok(())
}
