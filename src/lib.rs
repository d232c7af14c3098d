//! Transactional, audited account management for password and OIDC auth
//! methods.

#![forbid(unsafe_code)]

pub mod account;
pub mod auth_method;
pub mod authorization;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod id;
pub mod kms;
pub mod oplog;
mod router;
pub mod telemetry;
pub mod token;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, header};
use axum::routing::get;
use axum::{Router, middleware as AxumMiddleware};
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

pub use error::ServerError;

use account::{AccountService, OidcAccount, PasswordAccount, Repository};
use auth_method::AuthMethodResolver;
use authorization::GrantAuthorizer;
use crypto::SymmetricKey;
use database::Store;
use database::memory::MemoryStore;
use database::postgres::PgStore;
use kms::LocalKms;
use token::TokenManager;

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    app: Router,
    method: Method,
    path: &str,
    authorization: Option<&str>,
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(authorization) = authorization {
        request = request.header(header::AUTHORIZATION, authorization);
    }

    app.oneshot(request.body(axum::body::Body::from(body)).unwrap())
        .await
        .unwrap()
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub service: Arc<AccountService>,
    pub token: Arc<TokenManager>,
    pub metrics: Option<PrometheusHandle>,
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Dropping the request future cancels in-flight store calls.
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(state.config.timeout_secs),
        ))
        // Remove sensitive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE, Method::OPTIONS])
                .allow_headers(Any)
                .vary([header::AUTHORIZATION]),
        );

    let mut routes = Router::new()
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(router::status::status))
        .nest("/v1/accounts", router::accounts::router(state.clone()));

    if state.metrics.is_some() {
        // `GET /metrics` goes to the Prometheus scrape.
        routes = routes.route("/metrics", get(metrics));
    }

    routes
        .with_state(state)
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(middleware)
}

async fn metrics(State(state): State<AppState>) -> String {
    state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}

/// Initialize the application state.
pub async fn initialize_state(
    config: Arc<config::Configuration>,
    metrics: Option<PrometheusHandle>,
) -> Result<AppState, Box<dyn std::error::Error>> {
    let (store, auth_methods): (Arc<dyn Store>, Arc<dyn AuthMethodResolver>) =
        match config.postgres {
            Some(ref postgres) => {
                let pg = Arc::new(
                    PgStore::new(
                        &postgres.address,
                        postgres
                            .username
                            .as_deref()
                            .unwrap_or(database::DEFAULT_CREDENTIALS),
                        postgres
                            .password
                            .as_deref()
                            .unwrap_or(database::DEFAULT_CREDENTIALS),
                        postgres
                            .database
                            .as_deref()
                            .unwrap_or(database::DEFAULT_DATABASE_NAME),
                        postgres.pool_size.unwrap_or(database::DEFAULT_POOL_SIZE),
                    )
                    .await?,
                );
                // execute migrations scripts on start.
                pg.migrate().await?;
                let store: Arc<dyn Store> = pg.clone();
                let auth_methods: Arc<dyn AuthMethodResolver> = pg;
                (store, auth_methods)
            },
            None => {
                tracing::warn!("missing `postgres` entry on `config.yaml` file, accounts are kept in memory");
                let memory = MemoryStore::new();
                for auth_method in &config.auth_methods {
                    memory.insert_auth_method(auth_method.clone()).await;
                }
                let store: Arc<dyn Store> = Arc::new(memory.clone());
                let auth_methods: Arc<dyn AuthMethodResolver> = Arc::new(memory);
                (store, auth_methods)
            },
        };

    let key = std::env::var("KEY").map_err(|_| "missing `KEY` environment variable")?;
    let salt = std::env::var("SALT").map_err(|_| "missing `SALT` environment variable")?;
    let kms = Arc::new(LocalKms::new(SymmetricKey::derive_from_password(key, salt)?));

    let mut token = match &config.token {
        Some(config::Token {
            public_key_pem: Some(pem),
            ..
        }) => TokenManager::from_ec_pem(pem)?,
        Some(config::Token {
            secret: Some(secret),
            ..
        }) => TokenManager::from_secret(secret),
        _ => return Err("missing `token` entry on `config.yaml` file".into()),
    };
    if let Some(audience) = config.token.as_ref().and_then(|t| t.audience.as_ref()) {
        token.audience(audience);
    }

    let policy = config.retry.policy();
    let limit = config.repository.default_limit;
    let password = Repository::<PasswordAccount>::new(
        Arc::clone(&store),
        kms.clone(),
        Arc::clone(&auth_methods),
    )
    .with_limit(limit)
    .with_retry(policy);
    let oidc = Repository::<OidcAccount>::new(store, kms, Arc::clone(&auth_methods))
        .with_limit(limit)
        .with_retry(policy);

    let authorizer = Arc::new(GrantAuthorizer::new(config.authorization.grants.clone()));
    let service = AccountService::new(password, oidc, auth_methods, authorizer);

    Ok(AppState {
        config,
        service: Arc::new(service),
        token: Arc::new(token),
        metrics,
    })
}
