use http::Method;
use http::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use url::form_urlencoded;

use crate::ClientId;
use crate::credentials::{ClientSecret, ServicePrincipal};
use crate::http_client::HttpClient;
use crate::token::Token;

/// Microsoft Entra ID endpoint of the public cloud.
pub const PUBLIC_CLOUD_AAD_ENDPOINT: &str = "https://login.microsoftonline.com";

/// Instance Metadata Service token endpoint, reachable from inside Azure compute.
pub const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

const IMDS_API_VERSION: &str = "2018-02-01";

#[derive(Error, Debug)]
pub enum AuthenticateError {
    #[error("unable to build token request: `{0}`")]
    Serialize(String),
    #[error("unable to deserialize token response: `{0}`")]
    Deserialize(String),
    #[error("identity provider rejected the credentials: status code `{0}`, reason: `{1}`")]
    Rejected(u16, String),
    #[error("http transport error: `{0}`")]
    Transport(String),
}

/// Exchanges a credential for a bearer token. One attempt, no retries.
pub trait Authenticator {
    fn authenticate(&self) -> Result<Token, AuthenticateError>;
}

/// Token response shape shared by the Entra ID and IMDS endpoints.
/// Entra ID v1 returns `expires_in` as a string, IMDS as a number.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    #[serde(deserialize_with = "seconds_from_string_or_number")]
    pub expires_in: u64,
}

fn seconds_from_string_or_number<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Number(u64),
        Text(String),
    }

    match Seconds::deserialize(deserializer)? {
        Seconds::Number(n) => Ok(n),
        Seconds::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Performs the OAuth2 client-credentials grant against Entra ID on behalf of
/// a service principal.
pub struct AadAuthenticator<C> {
    http_client: C,
    token_endpoint: String,
    client_id: ClientId,
    client_secret: ClientSecret,
    resource: String,
}

impl<C> AadAuthenticator<C> {
    pub fn new(
        http_client: C,
        token_endpoint: String,
        client_id: ClientId,
        client_secret: ClientSecret,
        resource: String,
    ) -> Self {
        Self {
            http_client,
            token_endpoint,
            client_id,
            client_secret,
            resource,
        }
    }

    /// Builds an authenticator for a resolved principal. `resource` is the
    /// audience the token is requested for, normally the Resource Manager
    /// endpoint.
    pub fn for_principal(
        http_client: C,
        aad_endpoint: &str,
        principal: &ServicePrincipal,
        resource: &str,
    ) -> Self {
        let token_endpoint = format!(
            "{}/{}/oauth2/token",
            aad_endpoint.trim_end_matches('/'),
            principal.tenant_id
        );
        Self::new(
            http_client,
            token_endpoint,
            principal.client_id.clone(),
            principal.client_secret.clone(),
            resource.to_string(),
        )
    }
}

impl<C> Authenticator for AadAuthenticator<C>
where
    C: HttpClient,
{
    fn authenticate(&self) -> Result<Token, AuthenticateError> {
        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "client_credentials")
            .append_pair("client_id", &self.client_id)
            .append_pair("client_secret", self.client_secret.expose())
            .append_pair("resource", &self.resource)
            .finish();

        let request = http::Request::builder()
            .method(Method::POST)
            .uri(&self.token_endpoint)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(ACCEPT, "application/json")
            .body(body.into_bytes())
            .map_err(|e| AuthenticateError::Serialize(e.to_string()))?;

        exchange(&self.http_client, request)
    }
}

/// Obtains a token from the ambient managed identity, without any explicit
/// credential material.
pub struct ManagedIdentityAuthenticator<C> {
    http_client: C,
    endpoint: String,
    resource: String,
    client_id: Option<ClientId>,
}

impl<C> ManagedIdentityAuthenticator<C> {
    pub fn new(
        http_client: C,
        endpoint: String,
        resource: String,
        client_id: Option<ClientId>,
    ) -> Self {
        Self {
            http_client,
            endpoint,
            resource,
            client_id,
        }
    }

    /// The IMDS endpoint can be relocated by the hosting environment
    /// (App Service, Cloud Shell) through `MSI_ENDPOINT`.
    pub fn from_environment(http_client: C, resource: &str) -> Self {
        let endpoint = std::env::var("MSI_ENDPOINT")
            .ok()
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| IMDS_TOKEN_ENDPOINT.to_string());
        let client_id = std::env::var("AZURE_CLIENT_ID")
            .ok()
            .filter(|id| !id.is_empty());

        Self::new(http_client, endpoint, resource.to_string(), client_id)
    }
}

impl<C> Authenticator for ManagedIdentityAuthenticator<C>
where
    C: HttpClient,
{
    fn authenticate(&self) -> Result<Token, AuthenticateError> {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query
            .append_pair("api-version", IMDS_API_VERSION)
            .append_pair("resource", &self.resource);
        if let Some(client_id) = &self.client_id {
            query.append_pair("client_id", client_id);
        }

        let request = http::Request::builder()
            .method(Method::GET)
            .uri(format!("{}?{}", self.endpoint, query.finish()))
            .header("Metadata", "true")
            .body(Vec::new())
            .map_err(|e| AuthenticateError::Serialize(e.to_string()))?;

        exchange(&self.http_client, request)
    }
}

fn exchange<C: HttpClient>(
    http_client: &C,
    request: http::Request<Vec<u8>>,
) -> Result<Token, AuthenticateError> {
    let response = http_client
        .send(request)
        .map_err(|e| AuthenticateError::Transport(e.to_string()))?;

    let body = String::from_utf8(response.body().clone())
        .map_err(|e| AuthenticateError::Deserialize(format!("invalid utf8 response: {}", e)))?;

    if !response.status().is_success() {
        return Err(AuthenticateError::Rejected(
            response.status().as_u16(),
            body,
        ));
    }

    let token_response: TokenResponse = serde_json::from_str(body.as_str())
        .map_err(|e| AuthenticateError::Deserialize(e.to_string()))?;

    Token::try_from(token_response)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use httpmock::{Method::GET, Method::POST, MockServer};

    use super::*;
    use crate::http::client::HttpClient as BlockingClient;

    fn fake_principal() -> ServicePrincipal {
        ServicePrincipal::from_json(
            r#"{"clientId": "fake-client", "clientSecret": "fake-secret", "tenantId": "fake-tenant"}"#,
        )
        .unwrap()
    }

    #[test]
    fn client_credentials_grant_succeeds() {
        let identity_server = MockServer::start();
        let mock = identity_server.mock(|when, then| {
            when.method(POST)
                .path("/fake-tenant/oauth2/token")
                .header("content-type", "application/x-www-form-urlencoded")
                .body_contains("grant_type=client_credentials")
                .body_contains("client_id=fake-client")
                .body_contains("resource=https%3A%2F%2Fmanagement.azure.com%2F");
            // Entra ID v1 responds with a string-typed expires_in
            then.status(200).body(
                r#"{"access_token":"fake-token","token_type":"Bearer","expires_in":"3599"}"#,
            );
        });

        let http_client = BlockingClient::with_timeout(Duration::from_millis(500)).unwrap();
        let authenticator = AadAuthenticator::for_principal(
            http_client,
            &identity_server.base_url(),
            &fake_principal(),
            "https://management.azure.com/",
        );

        let token = authenticator.authenticate().unwrap();

        assert_eq!(token.access_token(), "fake-token");
        assert!(!token.is_expired());
        mock.assert()
    }

    #[test]
    fn rejected_credentials_surface_the_status_and_body() {
        let identity_server = MockServer::start();
        let mock = identity_server.mock(|when, then| {
            when.method(POST).path("/fake-tenant/oauth2/token");
            then.status(401).body(r#"{"error":"invalid_client"}"#);
        });

        let http_client = BlockingClient::with_timeout(Duration::from_millis(500)).unwrap();
        let authenticator = AadAuthenticator::for_principal(
            http_client,
            &identity_server.base_url(),
            &fake_principal(),
            "https://management.azure.com/",
        );

        let error = authenticator.authenticate().unwrap_err();

        assert_matches!(error, AuthenticateError::Rejected(401, body) if body.contains("invalid_client"));
        mock.assert()
    }

    #[test]
    fn unparsable_token_response_is_a_deserialize_error() {
        let identity_server = MockServer::start();
        let mock = identity_server.mock(|when, then| {
            when.method(POST).path("/fake-tenant/oauth2/token");
            then.status(200)
                .body("this body should fail to be deserialized as TokenResponse");
        });

        let http_client = BlockingClient::with_timeout(Duration::from_millis(500)).unwrap();
        let authenticator = AadAuthenticator::for_principal(
            http_client,
            &identity_server.base_url(),
            &fake_principal(),
            "https://management.azure.com/",
        );

        let error = authenticator.authenticate().unwrap_err();

        assert_matches!(error, AuthenticateError::Deserialize(_));
        mock.assert()
    }

    #[test]
    fn authentication_timeout_is_a_transport_error() {
        let identity_server = MockServer::start();
        let timeout = Duration::from_millis(10);
        identity_server.mock(|when, then| {
            when.method(POST).path("/fake-tenant/oauth2/token");
            then.status(200)
                .delay(timeout.saturating_add(Duration::from_millis(50)));
        });

        let http_client = BlockingClient::with_timeout(timeout).unwrap();
        let authenticator = AadAuthenticator::for_principal(
            http_client,
            &identity_server.base_url(),
            &fake_principal(),
            "https://management.azure.com/",
        );

        let error = authenticator.authenticate().unwrap_err();

        assert_matches!(error, AuthenticateError::Transport(_));
    }

    #[test]
    fn managed_identity_token_is_fetched_from_the_metadata_service() {
        let metadata_server = MockServer::start();
        let mock = metadata_server.mock(|when, then| {
            when.method(GET)
                .path("/metadata/identity/oauth2/token")
                .header("Metadata", "true")
                .query_param("api-version", IMDS_API_VERSION)
                .query_param("resource", "https://management.azure.com/");
            then.status(200).body(
                r#"{"access_token":"msi-token","token_type":"Bearer","expires_in":86400}"#,
            );
        });

        let http_client = BlockingClient::with_timeout(Duration::from_millis(500)).unwrap();
        let authenticator = ManagedIdentityAuthenticator::new(
            http_client,
            format!("{}/metadata/identity/oauth2/token", metadata_server.base_url()),
            "https://management.azure.com/".to_string(),
            None,
        );

        let token = authenticator.authenticate().unwrap();

        assert_eq!(token.access_token(), "msi-token");
        mock.assert()
    }
}
