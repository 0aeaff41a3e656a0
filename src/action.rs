use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::commands::deploy::DeployInput;
use crate::credentials::ServicePrincipal;
use crate::deployment::DeploymentMode;

/// Matches the action's documented default of 20 minutes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20 * 60);

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("missing required input `{0}`")]
    MissingInput(&'static str),
    #[error("invalid value for input `{name}`: {reason}")]
    InvalidInput { name: &'static str, reason: String },
    #[error("unable to write action output: {0}")]
    OutputWrite(#[from] std::io::Error),
}

/// Workflow context GitHub provides to every action run.
#[derive(Debug, Clone, Default)]
pub struct GitHubContext {
    pub workflow: String,
    pub action: String,
    pub actor: String,
    pub repository: String,
    pub commit: String,
    pub event_name: String,
    pub event_path: String,
    pub git_ref: String,
    pub running_as_action: bool,
}

/// The action's inputs, read from named environment variables with explicit
/// conversions. No struct-tag reflection, every variable is named here.
#[derive(Debug, Clone)]
pub struct ActionOptions {
    pub github: GitHubContext,
    /// Raw credential JSON. Managed identity is used when absent.
    pub credentials: Option<String>,
    pub subscription_id: Option<String>,
    pub resource_group_name: Option<String>,
    pub management_group_id: Option<String>,
    pub template_location: String,
    pub parameters: Option<String>,
    pub override_parameters: Option<String>,
    pub deployment_name: String,
    pub deployment_mode: DeploymentMode,
    pub timeout: Duration,
}

impl ActionOptions {
    pub fn from_env() -> Result<Self, ActionError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ActionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let github = GitHubContext {
            workflow: optional(&lookup, "GITHUB_WORKFLOW").unwrap_or_default(),
            action: optional(&lookup, "GITHUB_ACTION").unwrap_or_default(),
            actor: optional(&lookup, "GITHUB_ACTOR").unwrap_or_default(),
            repository: optional(&lookup, "GITHUB_REPOSITORY").unwrap_or_default(),
            commit: optional(&lookup, "GITHUB_SHA").unwrap_or_default(),
            event_name: optional(&lookup, "GITHUB_EVENT_NAME").unwrap_or_default(),
            event_path: optional(&lookup, "GITHUB_EVENT_PATH").unwrap_or_default(),
            git_ref: optional(&lookup, "GITHUB_REF").unwrap_or_default(),
            running_as_action: optional(&lookup, "GITHUB_ACTIONS").is_some_and(|v| v == "true"),
        };

        let deployment_mode = match optional(&lookup, "INPUT_DEPLOYMENTMODE") {
            Some(raw) => raw
                .parse()
                .map_err(|reason| ActionError::InvalidInput {
                    name: "INPUT_DEPLOYMENTMODE",
                    reason,
                })?,
            None => DeploymentMode::Incremental,
        };

        let timeout = match optional(&lookup, "INPUT_TIMEOUT") {
            Some(raw) => parse_timeout(&raw).map_err(|reason| ActionError::InvalidInput {
                name: "INPUT_TIMEOUT",
                reason,
            })?,
            None => DEFAULT_TIMEOUT,
        };

        Ok(Self {
            github,
            credentials: optional(&lookup, "INPUT_CREDS"),
            subscription_id: optional(&lookup, "INPUT_SUBSCRIPTIONID"),
            resource_group_name: optional(&lookup, "INPUT_RESOURCEGROUPNAME"),
            management_group_id: optional(&lookup, "INPUT_MANAGEMENTGROUPID"),
            template_location: required(&lookup, "INPUT_TEMPLATELOCATION")?,
            parameters: optional(&lookup, "INPUT_PARAMETERS"),
            override_parameters: optional(&lookup, "INPUT_OVERRIDEPARAMETERS"),
            deployment_name: required(&lookup, "INPUT_DEPLOYMENTNAME")?,
            deployment_mode,
            timeout,
        })
    }

    pub fn to_deploy_input(&self) -> Result<DeployInput, crate::Error> {
        let credentials = self
            .credentials
            .as_deref()
            .map(ServicePrincipal::from_json)
            .transpose()?;

        Ok(DeployInput {
            credentials,
            subscription_id: self.subscription_id.clone(),
            resource_group: self.resource_group_name.clone(),
            management_group: self.management_group_id.clone(),
            template_location: PathBuf::from(&self.template_location),
            parameters_location: self.parameters.clone(),
            override_parameters: self.override_parameters.clone(),
            deployment_name: self.deployment_name.clone(),
            mode: self.deployment_mode,
        })
    }
}

fn optional<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name).filter(|value| !value.is_empty())
}

fn required<F>(lookup: &F, name: &'static str) -> Result<String, ActionError>
where
    F: Fn(&str) -> Option<String>,
{
    optional(lookup, name).ok_or(ActionError::MissingInput(name))
}

/// Accepts `90s`, `20m`, `1h` or a bare number of seconds.
pub fn parse_timeout(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(DEFAULT_TIMEOUT);
    }

    let (digits, unit) = match raw.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&raw[..raw.len() - 1], Some(c)),
        _ => (raw, None),
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| format!("expected a duration like 20m, got `{raw}`"))?;

    match unit {
        None | Some('s') => Ok(Duration::from_secs(value)),
        Some('m') => Ok(Duration::from_secs(value * 60)),
        Some('h') => Ok(Duration::from_secs(value * 3600)),
        Some(other) => Err(format!("unknown duration unit `{other}` in `{raw}`")),
    }
}

/// Where deployment outputs go: the `GITHUB_OUTPUT` file on current runners,
/// the legacy `::set-output` workflow command everywhere else.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputChannel {
    File(PathBuf),
    Legacy,
}

impl OutputChannel {
    pub fn from_env() -> Self {
        std::env::var("GITHUB_OUTPUT")
            .ok()
            .filter(|path| !path.is_empty())
            .map(|path| OutputChannel::File(PathBuf::from(path)))
            .unwrap_or(OutputChannel::Legacy)
    }

    pub fn write(&self, name: &str, value: &str) -> Result<(), ActionError> {
        match self {
            OutputChannel::File(path) => {
                let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                writeln!(file, "{name}={value}")?;
            }
            OutputChannel::Legacy => {
                println!("::set-output name={name}::{value}");
            }
        }

        Ok(())
    }
}
