//! Error handler for accounts.

use std::fmt;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use validator::ValidationErrors;

use crate::database::StoreError;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Attribute whose uniqueness constraint rejected a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueAttribute {
    PublicId,
    Name,
    LoginName,
    Subject,
}

impl UniqueAttribute {
    /// Resolve the attribute from a store constraint name.
    pub fn from_constraint(constraint: &str) -> Self {
        if constraint.ends_with("_pkey") {
            Self::PublicId
        } else if constraint.ends_with("_login_name_uq") {
            Self::LoginName
        } else if constraint.ends_with("_subject_uq") {
            Self::Subject
        } else {
            Self::Name
        }
    }
}

impl fmt::Display for UniqueAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PublicId => write!(f, "public id"),
            Self::Name => write!(f, "name"),
            Self::LoginName => write!(f, "login name"),
            Self::Subject => write!(f, "subject for issuer"),
        }
    }
}

/// Enum representing server-side errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{op}: invalid parameter: {msg}")]
    InvalidParameter { op: &'static str, msg: String },

    #[error("{op}: invalid public id: {msg}")]
    InvalidPublicId { op: &'static str, msg: String },

    #[error("{op}: invalid field mask: {path}")]
    InvalidFieldMask { op: &'static str, path: String },

    #[error("{op}: empty field mask")]
    EmptyFieldMask { op: &'static str },

    #[error("{op}: in auth method {auth_method_id}: {attribute} already exists")]
    NotUnique {
        op: &'static str,
        attribute: UniqueAttribute,
        auth_method_id: String,
    },

    #[error("{op}: {msg}")]
    MultipleRecords { op: &'static str, msg: String },

    #[error("{op}: unable to seal audit entry")]
    Encrypt {
        op: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("forbidden")]
    Forbidden,

    #[error("invalid 'Authorization' header")]
    Unauthorized,

    #[error("validation error occurred")]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Json(#[from] JsonRejection),

    #[error(transparent)]
    Query(#[from] QueryRejection),

    #[error("{op}: {id}: {source}")]
    Store {
        op: &'static str,
        id: String,
        #[source]
        source: StoreError,
    },

    #[error("internal server error, {details}")]
    Internal {
        details: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ServerError {
    pub fn invalid_parameter(op: &'static str, msg: impl Into<String>) -> Self {
        Self::InvalidParameter {
            op,
            msg: msg.into(),
        }
    }

    pub fn invalid_public_id(op: &'static str, msg: impl Into<String>) -> Self {
        Self::InvalidPublicId {
            op,
            msg: msg.into(),
        }
    }

    pub fn internal(details: impl Into<String>) -> Self {
        Self::Internal {
            details: details.into(),
            source: None,
        }
    }

    /// Whether the transactional executor may replay the unit of work.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store { source, .. } if source.is_retryable())
    }

    /// Constraint name when the store rejected a duplicate.
    pub fn unique_constraint(&self) -> Option<&str> {
        match self {
            Self::Store {
                source: StoreError::Unique { constraint },
                ..
            } => Some(constraint),
            _ => None,
        }
    }
}

/// Attach operation context to store failures.
pub trait StoreContext<T> {
    fn context(self, op: &'static str, id: &str) -> Result<T>;
}

impl<T> StoreContext<T> for std::result::Result<T, StoreError> {
    fn context(self, op: &'static str, id: &str) -> Result<T> {
        self.map_err(|source| ServerError::Store {
            op,
            id: id.to_owned(),
            source,
        })
    }
}

/// Structure for detailed error responses.
#[derive(Debug, Serialize)]
pub struct ResponseError {
    r#type: Option<String>,
    title: String,
    status: u16,
    detail: String,
    instance: Option<String>,
    errors: Option<Vec<FieldError>>,
}

impl ResponseError {
    /// Update error status code.
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code.as_u16();
        self
    }

    /// Update `title` field.
    pub fn title(mut self, title: &str) -> Self {
        self.title = title.into();
        self
    }

    /// Add detailed error.
    pub fn details(mut self, description: &str) -> Self {
        self.detail = description.into();
        self
    }

    /// Automatically add errors field.
    pub fn errors(mut self, errors: &ValidationErrors) -> Self {
        self.errors = Some(parse_validation_errors(errors));
        self
    }

    /// Transform [`ResponseError`] into axum [`Response`].
    pub fn into_response(
        self,
    ) -> std::result::Result<Response, axum::http::Error> {
        if let Ok(body) = serde_json::to_string(&self) {
            Response::builder()
                .status(self.status)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.into())
        } else {
            Ok(internal_server_error())
        }
    }
}

impl Default for ResponseError {
    fn default() -> Self {
        Self {
            r#type: None,
            title: "Internal server error.".to_owned(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            detail: String::default(),
            instance: None,
            errors: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct FieldError {
    field: String,
    message: String,
}

fn parse_validation_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    let mut fields: Vec<FieldError> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, issues)| {
            issues.iter().map(move |issue| FieldError {
                field: field.to_string(),
                message: issue
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| issue.code.to_string()),
            })
        })
        .collect();
    fields.sort_by(|a, b| a.field.cmp(&b.field));
    fields
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let response = ResponseError::default()
            .title("There were validation errors with your request.")
            .status(StatusCode::BAD_REQUEST);

        let response = match &self {
            ServerError::Validation(validation_errors) => {
                response.errors(validation_errors)
            },
            ServerError::InvalidParameter { msg, .. }
            | ServerError::InvalidPublicId { msg, .. } => response.details(msg),
            ServerError::InvalidFieldMask { path, .. } => response
                .details(&format!("Field {path:?} cannot be updated.")),
            ServerError::EmptyFieldMask { .. } => {
                response.details("No valid fields included in the update mask.")
            },
            ServerError::NotUnique { attribute, .. } => response
                .title("Resource already exists.")
                .details(&format!("An account with this {attribute} already exists."))
                .status(StatusCode::CONFLICT),
            ServerError::Json(err) => response.details(&err.body_text()),
            ServerError::Query(err) => response.details(&err.body_text()),
            ServerError::NotFound(detail) => response
                .title("Resource not found.")
                .details(detail)
                .status(StatusCode::NOT_FOUND),
            ServerError::Forbidden => response
                .title("Forbidden.")
                .status(StatusCode::FORBIDDEN),
            ServerError::Unauthorized => response
                .title("Missing or invalid 'Authorization' header.")
                .status(StatusCode::UNAUTHORIZED),
            ServerError::Encrypt { .. }
            | ServerError::MultipleRecords { .. }
            | ServerError::Store { .. }
            | ServerError::Internal { .. } => {
                tracing::error!(err = %self, source = ?std::error::Error::source(&self), "server returned 500 status");

                ResponseError::default()
            },
        };

        response
            .into_response()
            .unwrap_or_else(|_| internal_server_error())
    }
}

fn internal_server_error() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(
            serde_json::json!({
                "type": null,
                "title": "Internal server error.",
                "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                "detail": null,
                "instance": null,
                "errors": null,
            })
            .to_string()
            .into(),
        )
        .unwrap_or_else(|_| Response::new("Internal server error".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_attribute_from_constraint() {
        assert_eq!(
            UniqueAttribute::from_constraint("auth_oidc_account_pkey"),
            UniqueAttribute::PublicId
        );
        assert_eq!(
            UniqueAttribute::from_constraint("auth_password_account_login_name_uq"),
            UniqueAttribute::LoginName
        );
        assert_eq!(
            UniqueAttribute::from_constraint("auth_password_account_name_uq"),
            UniqueAttribute::Name
        );
        assert_eq!(
            UniqueAttribute::from_constraint("auth_oidc_account_subject_uq"),
            UniqueAttribute::Subject
        );
    }

    #[test]
    fn test_retryable_only_for_conflicts() {
        let conflict: Result<()> =
            Err(StoreError::Conflict("40001".into())).context("op", "id");
        assert!(conflict.unwrap_err().is_retryable());

        let unique: Result<()> = Err(StoreError::Unique {
            constraint: "auth_oidc_account_name_uq".into(),
        })
        .context("op", "id");
        let unique = unique.unwrap_err();
        assert!(!unique.is_retryable());
        assert_eq!(unique.unique_constraint(), Some("auth_oidc_account_name_uq"));

        assert!(!ServerError::invalid_parameter("op", "missing").is_retryable());
    }

    #[test]
    fn test_status_codes() {
        let not_unique = ServerError::NotUnique {
            op: "op",
            attribute: UniqueAttribute::Name,
            auth_method_id: "amoidc_1234567890".into(),
        };
        assert_eq!(not_unique.into_response().status(), StatusCode::CONFLICT);
        assert_eq!(
            ServerError::EmptyFieldMask { op: "op" }
                .into_response()
                .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServerError::NotFound("gone".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServerError::internal("boom").into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
