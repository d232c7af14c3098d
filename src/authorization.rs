//! Authorization decisions for account operations.

use serde::{Deserialize, Serialize};

use crate::error::ServerError;

pub const ANONYMOUS_USER_ID: &str = "u_anon";
const ANY: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[serde(rename = "*")]
    All,
    Create,
    List,
    Read,
    Update,
    Delete,
}

/// Actions on a single account.
pub const ID_ACTIONS: &[Action] = &[Action::Read, Action::Update, Action::Delete];

/// Caller identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
}

impl Principal {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new(ANONYMOUS_USER_ID)
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id == ANONYMOUS_USER_ID
    }
}

/// Scope a resource lives in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl ScopeInfo {
    pub fn new(id: &str) -> Self {
        let kind = if id == "global" {
            "global"
        } else if id.starts_with("o_") {
            "org"
        } else if id.starts_with("p_") {
            "project"
        } else {
            "unknown"
        };

        Self {
            id: id.to_owned(),
            kind: kind.to_owned(),
        }
    }
}

/// Permission granted to a principal within one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    /// User id, or `*` for anyone including anonymous callers.
    pub principal: String,
    pub scope_id: String,
    /// Resource id, auth method id pinning a collection, or `*`.
    #[serde(default = "any")]
    pub id: String,
    pub actions: Vec<Action>,
}

fn any() -> String {
    ANY.to_owned()
}

impl Grant {
    fn applies_to(&self, id: Option<&str>, pin: Option<&str>) -> bool {
        self.id == ANY
            || id.is_some_and(|id| id == self.id)
            || pin.is_some_and(|pin| pin == self.id)
    }

    fn allows(&self, action: Action) -> bool {
        self.actions.iter().any(|a| *a == Action::All || *a == action)
    }
}

/// Resource an action is attempted on.
#[derive(Debug, Clone, Copy)]
pub struct VerifyRequest<'a> {
    pub scope_id: &'a str,
    /// Account id, `None` for collection actions.
    pub id: Option<&'a str>,
    /// Parent auth method id.
    pub pin: Option<&'a str>,
    pub action: Action,
}

/// Outcome of [`Authorizer::verify`].
#[derive(Debug)]
pub struct VerifyResult {
    pub scope: ScopeInfo,
    /// Set when the requested action is denied.
    pub error: Option<ServerError>,
    grants: Vec<Grant>,
}

impl VerifyResult {
    /// Subset of `available` the caller may perform on `id`.
    pub fn fetch_action_set_for_id(
        &self,
        id: &str,
        pin: Option<&str>,
        available: &[Action],
    ) -> Vec<Action> {
        available
            .iter()
            .copied()
            .filter(|action| {
                self.grants
                    .iter()
                    .any(|g| g.applies_to(Some(id), pin) && g.allows(*action))
            })
            .collect()
    }
}

pub trait Authorizer: Send + Sync {
    fn verify(&self, principal: &Principal, request: &VerifyRequest<'_>) -> VerifyResult;
}

/// Authorizer backed by a static list of grants.
#[derive(Debug, Clone, Default)]
pub struct GrantAuthorizer {
    grants: Vec<Grant>,
}

impl GrantAuthorizer {
    pub fn new(grants: Vec<Grant>) -> Self {
        Self { grants }
    }
}

impl Authorizer for GrantAuthorizer {
    fn verify(&self, principal: &Principal, request: &VerifyRequest<'_>) -> VerifyResult {
        let grants: Vec<Grant> = self
            .grants
            .iter()
            .filter(|g| {
                (g.principal == ANY || g.principal == principal.user_id)
                    && g.scope_id == request.scope_id
            })
            .cloned()
            .collect();

        let allowed = grants
            .iter()
            .any(|g| g.applies_to(request.id, request.pin) && g.allows(request.action));

        let error = (!allowed).then(|| {
            tracing::debug!(user_id = %principal.user_id, scope_id = request.scope_id, action = ?request.action, "action denied");
            if principal.is_anonymous() {
                ServerError::Unauthorized
            } else {
                ServerError::Forbidden
            }
        });

        VerifyResult {
            scope: ScopeInfo::new(request.scope_id),
            error,
            grants,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(principal: &str, id: &str, actions: &[Action]) -> Grant {
        Grant {
            principal: principal.into(),
            scope_id: "o_1234567890".into(),
            id: id.into(),
            actions: actions.to_vec(),
        }
    }

    fn request<'a>(id: Option<&'a str>, action: Action) -> VerifyRequest<'a> {
        VerifyRequest {
            scope_id: "o_1234567890",
            id,
            pin: Some("amoidc_1"),
            action,
        }
    }

    #[test]
    fn test_grant_matching() {
        let authorizer = GrantAuthorizer::new(vec![
            grant("u_alice", "amoidc_1", &[Action::List, Action::Read]),
            grant("*", "acctoidc_1", &[Action::All]),
        ]);
        let alice = Principal::new("u_alice");

        assert!(authorizer.verify(&alice, &request(None, Action::List)).error.is_none());
        assert!(matches!(
            authorizer.verify(&alice, &request(None, Action::Create)).error,
            Some(ServerError::Forbidden)
        ));
        assert!(matches!(
            authorizer.verify(&Principal::anonymous(), &request(None, Action::List)).error,
            Some(ServerError::Unauthorized)
        ));

        let result = authorizer.verify(&alice, &request(Some("acctoidc_1"), Action::Delete));
        assert!(result.error.is_none());
        assert_eq!(result.scope.kind, "org");
        assert_eq!(
            result.fetch_action_set_for_id("acctoidc_1", Some("amoidc_1"), ID_ACTIONS),
            ID_ACTIONS
        );
        assert_eq!(
            result.fetch_action_set_for_id("acctoidc_2", Some("amoidc_1"), ID_ACTIONS),
            [Action::Read]
        );
    }

    #[test]
    fn test_other_scope_is_denied() {
        let mut other = grant("*", "*", &[Action::All]);
        other.scope_id = "p_1234567890".into();
        let authorizer = GrantAuthorizer::new(vec![other]);

        let result = authorizer.verify(&Principal::new("u_alice"), &request(None, Action::List));
        assert!(result.error.is_some());
        assert!(result.fetch_action_set_for_id("acctoidc_1", None, ID_ACTIONS).is_empty());
    }

    #[test]
    fn test_action_wire_names() {
        let actions: Vec<Action> = serde_json::from_str(r#"["*", "read", "list"]"#).unwrap();
        assert_eq!(actions, [Action::All, Action::Read, Action::List]);
    }
}
