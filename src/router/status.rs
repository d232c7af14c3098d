//! Public instance status.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::config::Configuration;

#[derive(Serialize)]
pub struct Status {
    version: String,
    name: String,
    store: &'static str,
}

pub async fn status(State(config): State<Arc<Configuration>>) -> Json<Status> {
    Json(Status {
        version: config.version.clone(),
        name: config.name.clone(),
        store: if config.postgres.is_some() {
            "postgres"
        } else {
            "memory"
        },
    })
}
