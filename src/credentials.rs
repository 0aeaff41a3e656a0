use std::fmt;

use serde::Deserialize;
use thiserror::Error;

use crate::{ClientId, SubscriptionId};

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("malformed credentials: `{0}`")]
    Malformed(String),
}

/// Client secret of a service principal. Never printed through `Debug`.
#[derive(Clone, PartialEq, Deserialize)]
pub struct ClientSecret(String);

impl<S: AsRef<str>> From<S> for ClientSecret {
    fn from(secret: S) -> Self {
        ClientSecret(secret.as_ref().to_string())
    }
}

impl ClientSecret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClientSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientSecret: redacted")
    }
}

/// Service principal record as emitted by `az ad sp create-for-rbac --sdk-auth`.
/// Built once from the raw credential text and immutable afterwards.
///
/// Both field spellings are accepted: the sdk-auth shape
/// (`clientId`/`clientSecret`/`tenantId`) and the bare create-for-rbac shape
/// (`appId`/`password`/`tenant`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePrincipal {
    #[serde(alias = "appId")]
    pub client_id: ClientId,
    #[serde(alias = "password")]
    pub client_secret: ClientSecret,
    #[serde(alias = "tenant")]
    pub tenant_id: String,
    #[serde(default)]
    pub subscription_id: SubscriptionId,
    /// Sovereign cloud override. When unset the public cloud endpoint is used.
    #[serde(default)]
    pub resource_manager_endpoint_url: Option<String>,
}

impl ServicePrincipal {
    pub fn from_json(raw: &str) -> Result<Self, CredentialError> {
        let principal: ServicePrincipal = serde_json::from_str(raw)
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;

        if principal.client_id.is_empty() || principal.tenant_id.is_empty() {
            return Err(CredentialError::Malformed(
                "clientId and tenantId must not be empty".to_string(),
            ));
        }

        Ok(principal)
    }
}
