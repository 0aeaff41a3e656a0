use std::time::Duration;

use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::SubscriptionId;
use crate::cancel::{CancelError, CancelToken};
use crate::deployment::{DeploymentRequest, Scope};
use crate::http_client::HttpClient;
use crate::token::Token;

/// Resource Manager endpoint of the public cloud.
pub const PUBLIC_CLOUD_MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";

const API_VERSION: &str = "2021-04-01";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("template validation failed: `{status}`, {message}")]
    ValidationFailed { status: String, message: String },
    #[error("template deployment failed: `{status}`, {message}")]
    DeploymentFailed { status: String, message: String },
    #[error("http transport error: `{0}`")]
    Transport(String),
    #[error("unable to decode deployment response: `{0}`")]
    Decode(String),
    #[error(transparent)]
    Cancelled(#[from] CancelError),
}

/// Completed deployment as reported by the Resource Manager.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeploymentResult {
    pub name: String,
    #[serde(default)]
    pub properties: DeploymentResultProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentResultProperties {
    #[serde(default)]
    pub provisioning_state: String,
    pub outputs: Option<Value>,
}

/// Client for the Microsoft.Resources deployments API. Knows the three scope
/// variants of the validate and create operations; performs no local retries.
pub struct ArmClient<C> {
    http_client: C,
    token: Token,
    management_endpoint: String,
    subscription_id: SubscriptionId,
    poll_interval: Duration,
}

impl<C> ArmClient<C> {
    pub fn new(http_client: C, token: Token, subscription_id: SubscriptionId) -> Self {
        Self {
            http_client,
            token,
            management_endpoint: PUBLIC_CLOUD_MANAGEMENT_ENDPOINT.to_string(),
            subscription_id,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Sovereign clouds and tests use a different management endpoint.
    pub fn with_management_endpoint(mut self, endpoint: &str) -> Self {
        self.management_endpoint = endpoint.trim_end_matches('/').to_string();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn deployment_url(&self, scope: &Scope, deployment_name: &str) -> String {
        let base = &self.management_endpoint;
        match scope {
            Scope::ResourceGroup(rg) => format!(
                "{base}/subscriptions/{}/resourcegroups/{rg}/providers/Microsoft.Resources/deployments/{deployment_name}",
                self.subscription_id
            ),
            Scope::ManagementGroup(mg) => format!(
                "{base}/providers/Microsoft.Management/managementGroups/{mg}/providers/Microsoft.Resources/deployments/{deployment_name}"
            ),
            Scope::Subscription => format!(
                "{base}/subscriptions/{}/providers/Microsoft.Resources/deployments/{deployment_name}",
                self.subscription_id
            ),
        }
    }
}

impl<C> ArmClient<C>
where
    C: HttpClient,
{
    /// Asks the Resource Manager whether the template and parameters would
    /// produce a successful deployment, without deploying anything.
    pub fn validate(&self, request: &DeploymentRequest) -> Result<(), DeployError> {
        let url = format!(
            "{}/validate?api-version={API_VERSION}",
            self.deployment_url(&request.scope, &request.name)
        );

        let (status, body) = self.send(Method::POST, &url, Some(deployment_body(request)))?;

        if !status.is_success() {
            return Err(DeployError::ValidationFailed {
                status: status.to_string(),
                message: remote_error_message(&body),
            });
        }

        Ok(())
    }

    /// Submits the deployment and blocks until the long-running operation
    /// reaches a terminal provisioning state, polling at a fixed interval.
    pub fn create(
        &self,
        request: &DeploymentRequest,
        cancel: &CancelToken,
    ) -> Result<DeploymentResult, DeployError> {
        let url = format!(
            "{}?api-version={API_VERSION}",
            self.deployment_url(&request.scope, &request.name)
        );

        let (status, mut body) = self.send(Method::PUT, &url, Some(deployment_body(request)))?;
        if !status.is_success() {
            return Err(DeployError::DeploymentFailed {
                status: status.to_string(),
                message: remote_error_message(&body),
            });
        }

        loop {
            let result = parse_deployment(&body)?;
            let state = result.properties.provisioning_state.clone();
            match state.as_str() {
                "Succeeded" => return Ok(result),
                "Failed" | "Canceled" => {
                    return Err(DeployError::DeploymentFailed {
                        status: state,
                        message: remote_error_message(&body),
                    });
                }
                state => debug!("deployment {} is {state}, polling", request.name),
            }

            cancel.sleep(self.poll_interval)?;

            let (status, polled) = self.send(Method::GET, &url, None)?;
            if !status.is_success() {
                return Err(DeployError::DeploymentFailed {
                    status: status.to_string(),
                    message: remote_error_message(&polled),
                });
            }
            body = polled;
        }
    }

    fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Value), DeployError> {
        let mut builder = http::Request::builder()
            .method(method)
            .uri(url)
            .header(AUTHORIZATION, self.token.to_string())
            .header(ACCEPT, "application/json");
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }

        let request = builder
            .body(body.unwrap_or_default())
            .map_err(|e| DeployError::Transport(e.to_string()))?;

        let response = self
            .http_client
            .send(request)
            .map_err(|e| DeployError::Transport(e.to_string()))?;

        let status = response.status();
        let body = if response.body().is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(response.body())
                .map_err(|e| DeployError::Decode(e.to_string()))?
        };

        Ok((status, body))
    }
}

fn deployment_body(request: &DeploymentRequest) -> Vec<u8> {
    json!({
        "properties": {
            "template": request.template,
            "parameters": request.parameters,
            "mode": request.mode,
        }
    })
    .to_string()
    .into_bytes()
}

fn parse_deployment(body: &Value) -> Result<DeploymentResult, DeployError> {
    serde_json::from_value(body.clone()).map_err(|e| DeployError::Decode(e.to_string()))
}

/// ARM reports failures in an `{"error": {"code", "message"}}` envelope. The
/// raw body stands in when the envelope is missing.
fn remote_error_message(body: &Value) -> String {
    body.pointer("/error/message")
        .or_else(|| body.pointer("/properties/error/message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}
