pub mod action;
pub mod arm;
pub mod authenticator;
pub mod cancel;
pub mod commands;
pub mod credentials;
pub mod deployment;
pub mod http;
pub mod http_client;
pub mod outputs;
pub mod parameters;
pub mod template;
pub mod token;

use thiserror::Error;

pub type ClientId = String;
pub type SubscriptionId = String;

/// Top level error for one deployment invocation. Every failure is terminal,
/// nothing is retried locally.
#[derive(Error, Debug)]
pub enum Error {
    #[error("loading credentials: `{0}`")]
    Credentials(#[from] credentials::CredentialError),
    #[error("authenticating: `{0}`")]
    Authenticate(#[from] authenticator::AuthenticateError),
    #[error("loading template: `{0}`")]
    Template(#[from] template::TemplateError),
    #[error("loading parameters: `{0}`")]
    Parameters(#[from] parameters::ParameterError),
    #[error("deploying template: `{0}`")]
    Deploy(#[from] arm::DeployError),
    #[error("parsing deployment outputs: `{0}`")]
    Outputs(#[from] outputs::OutputError),
    #[error(transparent)]
    Cancelled(#[from] cancel::CancelError),
    #[error("no subscription id available, pass one explicitly or include subscriptionId in the credentials")]
    MissingSubscriptionId,
}
