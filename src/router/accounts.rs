//! Account HTTP API.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Extension, Json, Router, middleware};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationErrors};

use crate::account::service::AccountItem;
use crate::account::view::{AccountView, CreatedAccount};
use crate::authorization::Principal;
use crate::router::Valid;
use crate::{AppState, ServerError};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    auth_method_id: String,
    limit: Option<usize>,
    /// Boolean expression over each listed item.
    filter: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    items: Vec<AccountView>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateBody {
    /// Paths to write, comma separated or as a list.
    #[serde(default)]
    update_mask: Vec<String>,
    #[serde(flatten)]
    item: AccountItem,
}

impl Validate for UpdateBody {
    fn validate(&self) -> Result<(), ValidationErrors> {
        self.item.validate()
    }
}

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        // `GET /v1/accounts?auth_method_id=` lists, `POST /v1/accounts`
        // creates.
        .route("/", get(list).post(create))
        .route("/{id}", get(read).patch(update).delete(delete))
        .route_layer(middleware::from_fn_with_state(state, super::auth))
}

async fn list(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<ListResponse>, ServerError> {
    let Query(query) = query?;
    let items = state
        .service
        .list_accounts(
            &principal,
            &query.auth_method_id,
            query.limit,
            query.filter.as_deref(),
        )
        .await?;

    Ok(Json(ListResponse { items }))
}

async fn create(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Valid(item): Valid<AccountItem>,
) -> Result<impl IntoResponse, ServerError> {
    let created: CreatedAccount = state.service.create_account(&principal, item).await?;

    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, format!("/v1/{}", created.uri))],
        Json(created),
    ))
}

async fn read(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<Json<AccountView>, ServerError> {
    Ok(Json(state.service.get_account(&principal, &id).await?))
}

async fn update(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Valid(body): Valid<UpdateBody>,
) -> Result<Json<AccountView>, ServerError> {
    let updated = state
        .service
        .update_account(&principal, &id, &body.update_mask, body.item)
        .await?;

    Ok(Json(updated))
}

async fn delete(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<StatusCode, ServerError> {
    match state.service.delete_account(&principal, &id).await? {
        0 => Err(ServerError::NotFound(format!("Account {id:?} doesn't exist."))),
        _ => Ok(StatusCode::NO_CONTENT),
    }
}
