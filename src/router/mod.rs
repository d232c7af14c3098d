//! HTTP API.
pub mod accounts;
pub mod status;

use axum::extract::{FromRequest, Json, Request, State};
use axum::http::header;
use axum::middleware;
use axum::response::Response;
use serde::de::DeserializeOwned;
use validator::Validate;

use crate::authorization::Principal;
use crate::{AppState, ServerError};

/// JSON body checked with [`Validate`] before reaching the handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct Valid<T>(pub T);

impl<T, S> FromRequest<S> for Valid<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(Valid(value))
    }
}

/// Resolve the caller from the `Authorization` header.
///
/// Requests without the header run as the anonymous principal.
pub async fn auth(
    State(state): State<AppState>,
    mut req: Request,
    next: middleware::Next,
) -> Result<Response, ServerError> {
    let header = req
        .headers()
        .get(header::AUTHORIZATION)
        .map(|value| value.to_str().map_err(|_| ServerError::Unauthorized))
        .transpose()?;
    let principal: Principal = state.token.principal(header)?;

    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use crate::AppState;
    use crate::account::service::tests::service;
    use crate::config::Configuration;
    use crate::database::memory::MemoryStore;
    use crate::token::TokenManager;
    use crate::token::tests::SECRET;

    /// Application state over `store`, with HS256 tokens signed by
    /// [`SECRET`].
    pub fn state(store: &MemoryStore) -> AppState {
        AppState {
            config: Arc::new(Configuration::default()),
            service: Arc::new(service(store, vec![])),
            token: Arc::new(TokenManager::from_secret(SECRET)),
            metrics: None,
        }
    }
}
