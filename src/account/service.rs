//! Subtype-agnostic account operations.
//!
//! Requests are routed by the subtype tag embedded in the identifier, checked
//! against the authorizer in the scope of the parent auth method and then
//! delegated to the matching repository.

use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use validator::{Validate, ValidationError, ValidationErrors};

use super::filter::Filter;
use super::view::{AccountView, CreatedAccount};
use super::{AccountKind, Field, OidcAccount, PasswordAccount, Repository};
use crate::auth_method::{AuthMethod, AuthMethodResolver};
use crate::authorization::{
    Action, Authorizer, ID_ACTIONS, Principal, VerifyRequest, VerifyResult,
};
use crate::error::{Result, ServerError, StoreContext};
use crate::id::{self, Subtype};

/// Account fields accepted by create and update.
#[derive(Debug, Default, Clone, Deserialize, Validate)]
pub struct AccountItem {
    #[serde(default)]
    pub auth_method_id: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[validate(length(max = 128, message = "Name must contain at most 128 characters."))]
    pub name: Option<String>,
    #[validate(length(
        max = 1024,
        message = "Description must contain at most 1024 characters."
    ))]
    pub description: Option<String>,
    #[serde(default)]
    pub version: u32,
    /// Subtype specific attributes, checked once the subtype is known.
    pub attributes: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PasswordAttributes {
    #[serde(default)]
    login_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct OidcAttributes {
    #[serde(default)]
    issuer: String,
    #[serde(default)]
    subject: String,
    full_name: Option<String>,
    email: Option<String>,
}

/// Mask paths that can never be written on an OIDC account.
const OIDC_READ_ONLY_PATHS: &[(&str, &str)] = &[
    ("attributes.issuer", "Field cannot be updated."),
    ("attributes.subject", "Field cannot be updated."),
    ("attributes.full_name", "Field is read only."),
    ("attributes.email", "Field is read only."),
];

pub struct AccountService {
    password: Repository<PasswordAccount>,
    oidc: Repository<OidcAccount>,
    auth_methods: Arc<dyn AuthMethodResolver>,
    authorizer: Arc<dyn Authorizer>,
}

impl AccountService {
    pub fn new(
        password: Repository<PasswordAccount>,
        oidc: Repository<OidcAccount>,
        auth_methods: Arc<dyn AuthMethodResolver>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            password,
            oidc,
            auth_methods,
            authorizer,
        }
    }

    /// Accounts of an auth method the principal may see.
    ///
    /// Items without any authorized action, then items rejected by `filter`,
    /// are dropped after the repository applied `limit`.
    pub async fn list_accounts(
        &self,
        principal: &Principal,
        auth_method_id: &str,
        limit: Option<usize>,
        filter: Option<&str>,
    ) -> Result<Vec<AccountView>> {
        let filter = validate_list(auth_method_id, filter.unwrap_or_default())?;

        let (_, auth) = self
            .parent_and_auth_result(principal, auth_method_id, None, Action::List)
            .await?;
        if let Some(err) = auth.error {
            return Err(err);
        }

        let mut accounts: Vec<AccountView> = Vec::new();
        accounts.extend(
            self.password
                .list_accounts(auth_method_id, limit)
                .await?
                .into_iter()
                .map(|a| AccountView::from(a.into_account())),
        );
        accounts.extend(
            self.oidc
                .list_accounts(auth_method_id, limit)
                .await?
                .into_iter()
                .map(|a| AccountView::from(a.into_account())),
        );

        let mut items = Vec::with_capacity(accounts.len());
        for view in accounts {
            let actions =
                auth.fetch_action_set_for_id(&view.id, Some(auth_method_id), ID_ACTIONS);
            if actions.is_empty() {
                continue;
            }
            let view = view.authorized(&auth.scope, actions);
            let value = serde_json::to_value(&view).map_err(|err| ServerError::Internal {
                details: "cannot serialize account view".into(),
                source: Some(Box::new(err)),
            })?;
            if filter.matches(&value) {
                items.push(view);
            }
        }

        Ok(items)
    }

    pub async fn get_account(&self, principal: &Principal, id: &str) -> Result<AccountView> {
        validate_id(id)?;

        let (auth_method, auth) = self
            .parent_and_auth_result(principal, id, Some(id), Action::Read)
            .await?;
        if auth.error.is_some() {
            return Err(not_found(id));
        }

        let view = match Subtype::from_id(id) {
            Some(Subtype::Password) => self
                .password
                .lookup_account(id)
                .await?
                .map(|a| AccountView::from(a.into_account())),
            Some(Subtype::Oidc) => self
                .oidc
                .lookup_account(id)
                .await?
                .map(|a| AccountView::from(a.into_account())),
            None => None,
        }
        .ok_or_else(|| not_found(id))?;

        Ok(authorize_view(view, &auth, &auth_method))
    }

    /// Create an account in the scope of its auth method.
    pub async fn create_account(
        &self,
        principal: &Principal,
        item: AccountItem,
    ) -> Result<CreatedAccount> {
        let subtype = validate_create(&item)?;

        let (auth_method, auth) = self
            .parent_and_auth_result(principal, &item.auth_method_id, None, Action::Create)
            .await?;
        if let Some(err) = auth.error {
            return Err(err);
        }
        let scope_id = &auth_method.scope_id;

        let created = match subtype {
            Subtype::Password => {
                let attributes: PasswordAttributes =
                    decode_attributes(&item.attributes).unwrap_or_default();
                let mut candidate =
                    PasswordAccount::new(&item.auth_method_id, &attributes.login_name);
                set_base(&mut candidate, &item);
                self.password
                    .create_account(scope_id, &candidate)
                    .await?
                    .into_account()
            },
            Subtype::Oidc => {
                let attributes: OidcAttributes =
                    decode_attributes(&item.attributes).unwrap_or_default();
                let mut candidate = OidcAccount::new(&item.auth_method_id, &attributes.subject);
                set_base(&mut candidate, &item);
                self.oidc.create_account(scope_id, &candidate).await?.into_account()
            },
        };

        let view = authorize_view(AccountView::from(created), &auth, &auth_method);
        Ok(CreatedAccount {
            uri: format!("accounts/{}", view.id),
            item: view,
        })
    }

    /// Apply the masked fields of `item` to account `id`.
    pub async fn update_account(
        &self,
        principal: &Principal,
        id: &str,
        update_mask: &[String],
        item: AccountItem,
    ) -> Result<AccountView> {
        let subtype = validate_update(id, update_mask, &item)?;

        let (auth_method, auth) = self
            .parent_and_auth_result(principal, id, Some(id), Action::Update)
            .await?;
        if auth.error.is_some() {
            return Err(not_found(id));
        }

        let fields: Vec<&str> = update_mask
            .iter()
            .flat_map(|paths| paths.split(','))
            .map(str::trim)
            .filter_map(|path| path.parse::<Field>().ok())
            .map(|field| field.column())
            .collect();
        if fields.is_empty() {
            let mut errors = ValidationErrors::new();
            field_error(
                &mut errors,
                "update_mask",
                "mask",
                "No valid fields provided in the update mask.",
            );
            return Err(ServerError::Validation(errors));
        }

        let scope_id = &auth_method.scope_id;
        let (updated, rows) = match subtype {
            Subtype::Password => {
                let mut patch = PasswordAccount::default();
                patch.base.public_id = id.to_owned();
                patch.base.auth_method_id = auth_method.public_id.clone();
                set_base(&mut patch, &item);
                let (updated, rows) = self
                    .password
                    .update_account(scope_id, &patch, item.version, &fields)
                    .await?;
                (updated.map(AccountKind::into_account), rows)
            },
            Subtype::Oidc => {
                let mut patch = OidcAccount::default();
                patch.base.public_id = id.to_owned();
                patch.base.auth_method_id = auth_method.public_id.clone();
                set_base(&mut patch, &item);
                let (updated, rows) = self
                    .oidc
                    .update_account(scope_id, &patch, item.version, &fields)
                    .await?;
                (updated.map(AccountKind::into_account), rows)
            },
        };

        match updated {
            Some(account) if rows > 0 => Ok(authorize_view(
                AccountView::from(account),
                &auth,
                &auth_method,
            )),
            _ => Err(ServerError::NotFound(format!(
                "Account {id:?} doesn't exist or incorrect version provided."
            ))),
        }
    }

    /// Delete account `id`, returning the number of removed rows.
    pub async fn delete_account(&self, principal: &Principal, id: &str) -> Result<usize> {
        validate_id(id)?;

        let (auth_method, auth) = self
            .parent_and_auth_result(principal, id, Some(id), Action::Delete)
            .await?;
        if auth.error.is_some() {
            return Err(not_found(id));
        }

        match Subtype::from_id(id) {
            Some(Subtype::Password) => {
                self.password.delete_account(&auth_method.scope_id, id).await
            },
            Some(Subtype::Oidc) => self.oidc.delete_account(&auth_method.scope_id, id).await,
            None => Err(not_found(id)),
        }
    }

    /// Resolve the parent auth method of `target` and check `action` in its
    /// scope.
    ///
    /// `account_id` is `None` for collection actions, `target` then being the
    /// auth method id itself. A missing account or auth method is reported
    /// as not found before any authorization decision.
    async fn parent_and_auth_result(
        &self,
        principal: &Principal,
        target: &str,
        account_id: Option<&str>,
        action: Action,
    ) -> Result<(AuthMethod, VerifyResult)> {
        const OP: &str = "account.service.authorize";

        let auth_method_id = match account_id {
            None => target.to_owned(),
            Some(id) => self.parent_of(id).await?.ok_or_else(|| not_found(id))?,
        };

        let auth_method = self
            .auth_methods
            .lookup_auth_method(&auth_method_id)
            .await
            .context(OP, &auth_method_id)?
            .ok_or_else(|| {
                ServerError::NotFound(format!("Auth method {auth_method_id:?} doesn't exist."))
            })?;

        let result = self.authorizer.verify(
            principal,
            &VerifyRequest {
                scope_id: &auth_method.scope_id,
                id: account_id,
                pin: Some(&auth_method.public_id),
                action,
            },
        );
        Ok((auth_method, result))
    }

    async fn parent_of(&self, id: &str) -> Result<Option<String>> {
        Ok(match Subtype::from_id(id) {
            Some(Subtype::Password) => self
                .password
                .lookup_account(id)
                .await?
                .map(|a| a.base.auth_method_id),
            Some(Subtype::Oidc) => self
                .oidc
                .lookup_account(id)
                .await?
                .map(|a| a.base.auth_method_id),
            None => None,
        })
    }
}

fn not_found(id: &str) -> ServerError {
    ServerError::NotFound(format!("Account {id:?} doesn't exist."))
}

fn authorize_view(view: AccountView, auth: &VerifyResult, auth_method: &AuthMethod) -> AccountView {
    let actions = auth.fetch_action_set_for_id(&view.id, Some(&auth_method.public_id), ID_ACTIONS);
    view.authorized(&auth.scope, actions)
}

fn set_base<K: AccountKind>(account: &mut K, item: &AccountItem) {
    let base = account.base_mut();
    base.name = item.name.clone();
    base.description = item.description.clone();
}

fn field_error(
    errors: &mut ValidationErrors,
    field: &'static str,
    code: &'static str,
    message: impl Into<String>,
) {
    let message: String = message.into();
    errors.add(field, ValidationError::new(code).with_message(message.into()));
}

/// Typed attributes, `None` when the payload has unexpected fields or types.
fn decode_attributes<T: DeserializeOwned + Default>(
    attributes: &Option<serde_json::Value>,
) -> Option<T> {
    match attributes {
        None | Some(serde_json::Value::Null) => Some(T::default()),
        Some(value) => serde_json::from_value(value.clone()).ok(),
    }
}

fn validate_list(auth_method_id: &str, filter: &str) -> Result<Filter> {
    let mut errors = ValidationErrors::new();
    if !id::is_auth_method_id(auth_method_id) {
        field_error(&mut errors, "auth_method_id", "id", "Invalid formatted identifier.");
    }
    let filter = Filter::parse(filter).unwrap_or_else(|err| {
        field_error(
            &mut errors,
            "filter",
            "filter",
            format!("This field could not be parsed. {err}"),
        );
        Filter::default()
    });

    if errors.is_empty() {
        Ok(filter)
    } else {
        Err(ServerError::Validation(errors))
    }
}

fn validate_id(id: &str) -> Result<()> {
    if id::is_account_id(id) {
        return Ok(());
    }
    let mut errors = ValidationErrors::new();
    field_error(&mut errors, "id", "id", "Improperly formatted identifier.");
    Err(ServerError::Validation(errors))
}

/// Check a create request, returning the subtype implied by its auth method.
fn validate_create(item: &AccountItem) -> Result<Subtype> {
    let mut errors = ValidationErrors::new();

    if item.auth_method_id.is_empty() {
        field_error(&mut errors, "auth_method_id", "required", "This field is required.");
        return Err(ServerError::Validation(errors));
    }
    let subtype = match Subtype::from_id(&item.auth_method_id) {
        Some(subtype) if id::is_auth_method_id(&item.auth_method_id) => subtype,
        _ => {
            field_error(
                &mut errors,
                "auth_method_id",
                "id",
                "Unknown auth method type from ID.",
            );
            return Err(ServerError::Validation(errors));
        },
    };

    if let Some(kind) = &item.kind {
        if kind.parse::<Subtype>().ok() != Some(subtype) {
            field_error(
                &mut errors,
                "type",
                "type",
                "Doesn't match the parent resource's type.",
            );
        }
    }

    match subtype {
        Subtype::Password => {
            match decode_attributes::<PasswordAttributes>(&item.attributes) {
                None => field_error(
                    &mut errors,
                    "attributes",
                    "format",
                    "Attribute fields do not match the expected format.",
                ),
                Some(attributes) if attributes.login_name.is_empty() => field_error(
                    &mut errors,
                    "attributes.login_name",
                    "required",
                    "This is a required field for this type.",
                ),
                Some(_) => {},
            }
        },
        Subtype::Oidc => match decode_attributes::<OidcAttributes>(&item.attributes) {
            None => field_error(
                &mut errors,
                "attributes",
                "format",
                "Attribute fields do not match the expected format.",
            ),
            Some(attributes) => {
                if attributes.issuer.is_empty() {
                    field_error(
                        &mut errors,
                        "attributes.issuer",
                        "required",
                        "This is a required field for this type.",
                    );
                } else if id::parse_issuer(&attributes.issuer).is_none() {
                    field_error(
                        &mut errors,
                        "attributes.issuer",
                        "url",
                        format!("Could not parse {:?} as a url.", attributes.issuer),
                    );
                }
                if attributes.subject.is_empty() {
                    field_error(
                        &mut errors,
                        "attributes.subject",
                        "required",
                        "This is a required field for this type.",
                    );
                }
                if attributes.full_name.is_some() {
                    field_error(
                        &mut errors,
                        "attributes.full_name",
                        "read_only",
                        "This is a read only field.",
                    );
                }
                if attributes.email.is_some() {
                    field_error(
                        &mut errors,
                        "attributes.email",
                        "read_only",
                        "This is a read only field.",
                    );
                }
            },
        },
    }

    if errors.is_empty() {
        Ok(subtype)
    } else {
        Err(ServerError::Validation(errors))
    }
}

/// Check an update request, returning the subtype implied by `id`.
fn validate_update(id: &str, update_mask: &[String], item: &AccountItem) -> Result<Subtype> {
    validate_id(id)?;
    let mut errors = ValidationErrors::new();

    let subtype = match Subtype::from_id(id) {
        Some(subtype) => subtype,
        None => {
            field_error(&mut errors, "id", "id", "Improperly formatted identifier.");
            return Err(ServerError::Validation(errors));
        },
    };

    if item.version == 0 {
        field_error(
            &mut errors,
            "version",
            "required",
            "Existing resource version is required for an update.",
        );
    }
    if update_mask.is_empty() {
        field_error(
            &mut errors,
            "update_mask",
            "required",
            "UpdateMask not provided but is required to update this resource.",
        );
    }
    if let Some(kind) = &item.kind {
        if kind.parse::<Subtype>().ok() != Some(subtype) {
            field_error(&mut errors, "type", "type", "Cannot modify the resource type.");
        }
    }

    match subtype {
        Subtype::Password => {
            if decode_attributes::<PasswordAttributes>(&item.attributes).is_none() {
                field_error(
                    &mut errors,
                    "attributes",
                    "format",
                    "Attribute fields do not match the expected format.",
                );
            }
        },
        Subtype::Oidc => {
            if decode_attributes::<OidcAttributes>(&item.attributes).is_none() {
                field_error(
                    &mut errors,
                    "attributes",
                    "format",
                    "Attribute fields do not match the expected format.",
                );
            }
            for (path, message) in OIDC_READ_ONLY_PATHS {
                let masked = update_mask
                    .iter()
                    .flat_map(|paths| paths.split(','))
                    .any(|p| p.trim().eq_ignore_ascii_case(path));
                if masked {
                    field_error(&mut errors, *path, "read_only", *message);
                }
            }
        },
    }

    if errors.is_empty() {
        Ok(subtype)
    } else {
        Err(ServerError::Validation(errors))
    }
}
