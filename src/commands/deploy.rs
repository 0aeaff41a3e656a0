use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::info;

use crate::arm::{ArmClient, PUBLIC_CLOUD_MANAGEMENT_ENDPOINT};
use crate::authenticator::{
    AadAuthenticator, Authenticator, ManagedIdentityAuthenticator, PUBLIC_CLOUD_AAD_ENDPOINT,
};
use crate::cancel::CancelToken;
use crate::credentials::ServicePrincipal;
use crate::deployment::{DeploymentMode, DeploymentRequest, Scope};
use crate::http_client::HttpClient;
use crate::outputs::{self, Output};
use crate::token::Token;
use crate::{Error, SubscriptionId, parameters, template};

/// Everything one deployment invocation needs, resolved from CLI flags or
/// action inputs before any remote call is made.
#[derive(Debug, Clone)]
pub struct DeployInput {
    /// Explicit service principal. The ambient managed identity is used when
    /// absent.
    pub credentials: Option<ServicePrincipal>,
    pub subscription_id: Option<SubscriptionId>,
    pub resource_group: Option<String>,
    pub management_group: Option<String>,
    pub template_location: PathBuf,
    /// Path to a `.json` file or inline `KEY=VALUE` pairs.
    pub parameters_location: Option<String>,
    pub override_parameters: Option<String>,
    pub deployment_name: String,
    pub mode: DeploymentMode,
}

#[derive(Debug, Clone)]
pub struct DeployOutcome {
    /// The generated name, base name plus uniqueness suffix.
    pub deployment_name: String,
    pub outputs: BTreeMap<String, Output>,
}

/// Runs the full deployment sequence: authenticate, load, merge, validate,
/// create, flatten. Strictly sequential, each step blocking on the previous
/// one.
pub struct DeployCommand<C> {
    http_client: C,
    aad_endpoint: String,
    management_endpoint: String,
}

impl<C> DeployCommand<C>
where
    C: HttpClient + Clone,
{
    pub fn new(http_client: C) -> Self {
        Self {
            http_client,
            aad_endpoint: PUBLIC_CLOUD_AAD_ENDPOINT.to_string(),
            management_endpoint: PUBLIC_CLOUD_MANAGEMENT_ENDPOINT.to_string(),
        }
    }

    /// Points the command at non-default identity and management endpoints,
    /// for sovereign clouds and tests.
    pub fn with_endpoints(mut self, aad_endpoint: &str, management_endpoint: &str) -> Self {
        self.aad_endpoint = aad_endpoint.trim_end_matches('/').to_string();
        self.management_endpoint = management_endpoint.trim_end_matches('/').to_string();
        self
    }

    pub fn run(&self, input: DeployInput, cancel: &CancelToken) -> Result<DeployOutcome, Error> {
        cancel.checkpoint()?;
        let token = self.authenticate(&input)?;

        let template = template::read_json(&input.template_location)?;
        let base = match &input.parameters_location {
            Some(location) => parameters::load(location)?,
            None => parameters::ParameterSet::new(),
        };
        let overrides = match &input.override_parameters {
            Some(location) => parameters::load(location)?,
            None => parameters::ParameterSet::new(),
        };
        let merged = parameters::merge(base, overrides);

        let scope = Scope::select(input.resource_group.clone(), input.management_group.clone());
        let subscription_id = self.resolve_subscription_id(&input, &scope)?;
        let request = DeploymentRequest::new(
            &input.deployment_name,
            input.mode,
            scope,
            template,
            merged,
        );
        info!(
            "Creating deployment {} -> {}, mode: {}",
            input.deployment_name, request.name, request.mode
        );

        let arm_client = ArmClient::new(self.http_client.clone(), token, subscription_id)
            .with_management_endpoint(&self.management_endpoint);

        cancel.checkpoint()?;
        info!("Validating deployment {}", request.name);
        arm_client.validate(&request)?;
        info!("Validation finished.");

        cancel.checkpoint()?;
        info!("Creating deployment {}", request.name);
        let result = arm_client.create(&request, cancel)?;
        info!("Template deployment finished.");

        let outputs = outputs::flatten(result.properties.outputs.as_ref())?;

        Ok(DeployOutcome {
            deployment_name: result.name,
            outputs,
        })
    }

    fn authenticate(&self, input: &DeployInput) -> Result<Token, Error> {
        let resource = self.token_resource(input);

        let token = match &input.credentials {
            Some(principal) => AadAuthenticator::for_principal(
                self.http_client.clone(),
                &self.aad_endpoint,
                principal,
                &resource,
            )
            .authenticate()?,
            None => {
                ManagedIdentityAuthenticator::from_environment(self.http_client.clone(), &resource)
                    .authenticate()?
            }
        };

        Ok(token)
    }

    /// The token audience is the management endpoint, unless the credentials
    /// name a sovereign override.
    fn token_resource(&self, input: &DeployInput) -> String {
        input
            .credentials
            .as_ref()
            .and_then(|principal| principal.resource_manager_endpoint_url.clone())
            .unwrap_or_else(|| format!("{}/", self.management_endpoint))
    }

    /// Management group deployments carry no subscription; the other scopes
    /// take the explicit id first, then the one inside the credentials.
    fn resolve_subscription_id(
        &self,
        input: &DeployInput,
        scope: &Scope,
    ) -> Result<SubscriptionId, Error> {
        if matches!(scope, Scope::ManagementGroup(_)) {
            return Ok(SubscriptionId::new());
        }

        input
            .subscription_id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| {
                input
                    .credentials
                    .as_ref()
                    .map(|principal| principal.subscription_id.clone())
                    .filter(|id| !id.is_empty())
            })
            .ok_or(Error::MissingSubscriptionId)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use httpmock::{Method::POST, Method::PUT, MockServer};
    use serde_json::json;
    use tempfile::{Builder, NamedTempFile};

    use super::*;
    use crate::http::client::HttpClient as BlockingClient;

    fn template_file() -> NamedTempFile {
        let mut file = Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(br#"{"$schema": "deploymentTemplate.json", "resources": []}"#)
            .unwrap();
        file
    }

    fn fake_input(template: &NamedTempFile) -> DeployInput {
        let credentials = ServicePrincipal::from_json(
            r#"{
                "clientId": "fake-client",
                "clientSecret": "fake-secret",
                "tenantId": "fake-tenant",
                "subscriptionId": "sub-1"
            }"#,
        )
        .unwrap();

        DeployInput {
            credentials: Some(credentials),
            subscription_id: None,
            resource_group: Some("rg-1".to_string()),
            management_group: None,
            template_location: template.path().to_path_buf(),
            parameters_location: None,
            override_parameters: None,
            deployment_name: "rollout".to_string(),
            mode: DeploymentMode::Incremental,
        }
    }

    fn mock_token_endpoint(server: &MockServer) -> httpmock::Mock<'_> {
        server.mock(|when, then| {
            when.method(POST).path("/fake-tenant/oauth2/token");
            then.status(200).body(
                r#"{"access_token":"fake-token","token_type":"Bearer","expires_in":"3599"}"#,
            );
        })
    }

    fn command(server: &MockServer) -> DeployCommand<BlockingClient> {
        let http_client = BlockingClient::with_timeout(Duration::from_millis(500)).unwrap();
        DeployCommand::new(http_client).with_endpoints(&server.base_url(), &server.base_url())
    }

    #[test]
    fn deploys_a_template_without_parameters_at_resource_group_scope() {
        let server = MockServer::start();
        let token_mock = mock_token_endpoint(&server);
        let validate_mock = server.mock(|when, then| {
            when.method(POST)
                .path_contains("/subscriptions/sub-1/resourcegroups/rg-1/providers/Microsoft.Resources/deployments/rollout-")
                .path_contains("/validate")
                .header("authorization", "Bearer fake-token")
                .body_contains(r#""mode":"Incremental""#)
                .body_contains(r#""parameters":{}"#);
            then.status(200).json_body(json!({}));
        });
        let create_mock = server.mock(|when, then| {
            when.method(PUT)
                .path_contains("/subscriptions/sub-1/resourcegroups/rg-1/providers/Microsoft.Resources/deployments/rollout-")
                .header("authorization", "Bearer fake-token")
                .body_contains(r#""mode":"Incremental""#);
            then.status(200).json_body(json!({
                "name": "rollout-unique",
                "properties": {
                    "provisioningState": "Succeeded",
                    "outputs": { "location": { "type": "String", "value": "westeurope" } }
                }
            }));
        });

        let template = template_file();
        let outcome = command(&server)
            .run(fake_input(&template), &CancelToken::new())
            .unwrap();

        // exactly one validate and one create call
        token_mock.assert();
        validate_mock.assert();
        create_mock.assert();
        assert_eq!(outcome.deployment_name, "rollout-unique");
        assert_eq!(outcome.outputs["location"].value, "westeurope");
    }

    #[test]
    fn override_parameters_win_in_the_submitted_payload() {
        let server = MockServer::start();
        mock_token_endpoint(&server);
        let validate_mock = server.mock(|when, then| {
            when.method(POST)
                .path_contains("/validate")
                .body_contains(r#""containerName":{"value":"overridden"}"#)
                .body_contains(r#""location":{"value":"westeurope"}"#);
            then.status(200).json_body(json!({}));
        });
        server.mock(|when, then| {
            when.method(PUT);
            then.status(200).json_body(json!({
                "name": "rollout-unique",
                "properties": { "provisioningState": "Succeeded" }
            }));
        });

        let template = template_file();
        let mut input = fake_input(&template);
        input.parameters_location =
            Some("location=westeurope containerName=original".to_string());
        input.override_parameters = Some("containerName=overridden".to_string());

        let outcome = command(&server).run(input, &CancelToken::new()).unwrap();

        validate_mock.assert();
        assert!(outcome.outputs.is_empty());
    }

    #[test]
    fn validation_failure_stops_before_any_create_call() {
        let server = MockServer::start();
        mock_token_endpoint(&server);
        server.mock(|when, then| {
            when.method(POST).path_contains("/validate");
            then.status(400).json_body(json!({
                "error": { "message": "bad template" }
            }));
        });
        let create_mock = server.mock(|when, then| {
            when.method(PUT);
            then.status(200).json_body(json!({}));
        });

        let template = template_file();
        let error = command(&server)
            .run(fake_input(&template), &CancelToken::new())
            .unwrap_err();

        assert_matches!(error, Error::Deploy(crate::arm::DeployError::ValidationFailed { .. }));
        create_mock.assert_hits(0);
    }

    #[test]
    fn missing_template_file_fails_before_any_remote_deployment_call() {
        let server = MockServer::start();
        mock_token_endpoint(&server);
        let validate_mock = server.mock(|when, then| {
            when.method(POST).path_contains("/validate");
            then.status(200).json_body(json!({}));
        });

        let template = template_file();
        let mut input = fake_input(&template);
        input.template_location = PathBuf::from("/no/such/template.json");

        let error = command(&server).run(input, &CancelToken::new()).unwrap_err();

        assert_matches!(error, Error::Template(_));
        validate_mock.assert_hits(0);
    }

    #[test]
    fn management_group_scope_needs_no_subscription_id() {
        let server = MockServer::start();
        mock_token_endpoint(&server);
        let validate_mock = server.mock(|when, then| {
            when.method(POST)
                .path_contains("/providers/Microsoft.Management/managementGroups/mg-1/")
                .path_contains("/validate");
            then.status(200).json_body(json!({}));
        });
        server.mock(|when, then| {
            when.method(PUT);
            then.status(200).json_body(json!({
                "name": "rollout-unique",
                "properties": { "provisioningState": "Succeeded" }
            }));
        });

        let template = template_file();
        let mut input = fake_input(&template);
        input.resource_group = None;
        input.management_group = Some("mg-1".to_string());
        input.credentials = input.credentials.map(|mut principal| {
            principal.subscription_id = SubscriptionId::new();
            principal
        });

        let outcome = command(&server).run(input, &CancelToken::new()).unwrap();

        validate_mock.assert();
        assert_eq!(outcome.deployment_name, "rollout-unique");
    }

    #[test]
    fn subscription_scope_without_any_subscription_id_is_an_error() {
        let server = MockServer::start();
        mock_token_endpoint(&server);

        let template = template_file();
        let mut input = fake_input(&template);
        input.resource_group = None;
        input.credentials = input.credentials.map(|mut principal| {
            principal.subscription_id = SubscriptionId::new();
            principal
        });

        let error = command(&server).run(input, &CancelToken::new()).unwrap_err();

        assert_matches!(error, Error::MissingSubscriptionId);
    }

    #[test]
    fn cancelled_token_stops_the_run_before_authentication() {
        let server = MockServer::start();
        let token_mock = mock_token_endpoint(&server);

        let cancel = CancelToken::new();
        cancel.cancel();

        let template = template_file();
        let error = command(&server)
            .run(fake_input(&template), &cancel)
            .unwrap_err();

        assert_matches!(error, Error::Cancelled(_));
        token_mock.assert_hits(0);
    }
}
