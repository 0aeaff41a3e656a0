use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::parameters::ParameterSet;
use crate::template::Template;

/// How the Resource Manager reconciles resources that exist in the target but
/// not in the template.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum DeploymentMode {
    #[default]
    Incremental,
    Complete,
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentMode::Incremental => write!(f, "Incremental"),
            DeploymentMode::Complete => write!(f, "Complete"),
        }
    }
}

impl std::str::FromStr for DeploymentMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "" | "Incremental" | "incremental" => Ok(DeploymentMode::Incremental),
            "Complete" | "complete" => Ok(DeploymentMode::Complete),
            other => Err(format!("invalid deployment mode: {other}")),
        }
    }
}

/// The level a deployment is applied at. Each scope maps to a distinct remote
/// validate/create operation pair.
#[derive(Debug, Clone, PartialEq)]
pub enum Scope {
    ResourceGroup(String),
    ManagementGroup(String),
    Subscription,
}

impl Scope {
    /// Picks the target scope from the identifying fields: a non-empty
    /// resource group name wins, then a non-empty management group id, else
    /// the deployment targets the subscription.
    pub fn select(resource_group: Option<String>, management_group: Option<String>) -> Scope {
        if let Some(rg) = resource_group.filter(|rg| !rg.is_empty()) {
            return Scope::ResourceGroup(rg);
        }
        if let Some(mg) = management_group.filter(|mg| !mg.is_empty()) {
            return Scope::ManagementGroup(mg);
        }

        Scope::Subscription
    }
}

/// One deployment invocation, immutable once built.
#[derive(Debug, Clone)]
pub struct DeploymentRequest {
    pub name: String,
    pub mode: DeploymentMode,
    pub scope: Scope,
    pub template: Template,
    pub parameters: ParameterSet,
}

impl DeploymentRequest {
    /// Appends a fresh uuid to the supplied name so concurrent or repeated
    /// invocations never collide on the deployment name.
    pub fn new(
        base_name: &str,
        mode: DeploymentMode,
        scope: Scope,
        template: Template,
        parameters: ParameterSet,
    ) -> Self {
        let name = format!("{}-{}", base_name, Uuid::new_v4());

        Self {
            name,
            mode,
            scope,
            template,
            parameters,
        }
    }
}
