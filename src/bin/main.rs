use std::error::Error;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use arm_deploy::action::{ActionOptions, OutputChannel, parse_timeout};
use arm_deploy::cancel::CancelToken;
use arm_deploy::commands::deploy::{DeployCommand, DeployInput, DeployOutcome};
use arm_deploy::credentials::ServicePrincipal;
use arm_deploy::deployment::DeploymentMode;
use arm_deploy::http::client::HttpClient;

#[derive(Parser, Debug)]
#[command(name = "arm-deploy-cli")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate and deploy an ARM template using explicit flags.
    Deploy(DeployArgs),
    /// Run as a GitHub Action, reading every input from the environment.
    Action,
}

#[derive(Args, Debug)]
struct DeployArgs {
    /// Service principal credentials JSON (`az ad sp create-for-rbac --sdk-auth`).
    /// The ambient managed identity is used when omitted.
    #[arg(long)]
    credentials: Option<String>,

    /// Subscription to deploy into. Falls back to the one in the credentials.
    #[arg(long)]
    subscription_id: Option<String>,

    /// Deploy at resource group scope.
    #[arg(long)]
    resource_group_name: Option<String>,

    /// Deploy at management group scope. A resource group takes precedence.
    #[arg(long)]
    management_group_id: Option<String>,

    /// Path to the ARM template JSON file.
    #[arg(long)]
    template_location: PathBuf,

    /// Path to a parameters `.json` file or inline KEY=VALUE pairs.
    #[arg(long)]
    parameters: Option<String>,

    /// Parameters overlaid onto the base set; an override wins per key.
    #[arg(long)]
    override_parameters: Option<String>,

    /// Base deployment name. A unique suffix is appended on every invocation.
    #[arg(long)]
    deployment_name: String,

    #[arg(long, value_enum, default_value_t = DeploymentMode::Incremental)]
    deployment_mode: DeploymentMode,

    /// Overall timeout for the authenticate-validate-create sequence,
    /// e.g. 20m, 300s or plain seconds.
    #[arg(long, default_value = "20m")]
    timeout: String,
}

fn main() {
    init_logging();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Deploy(args) => run_deploy(args),
        Commands::Action => run_action(),
    };

    if let Err(e) = result {
        error!("{e}");
        process::exit(1);
    }
}

fn run_deploy(args: DeployArgs) -> Result<(), Box<dyn Error>> {
    let timeout = parse_timeout(&args.timeout)?;
    let credentials = args
        .credentials
        .as_deref()
        .map(ServicePrincipal::from_json)
        .transpose()?;

    let input = DeployInput {
        credentials,
        subscription_id: args.subscription_id,
        resource_group: args.resource_group_name,
        management_group: args.management_group_id,
        template_location: args.template_location,
        parameters_location: args.parameters,
        override_parameters: args.override_parameters,
        deployment_name: args.deployment_name,
        mode: args.deployment_mode,
    };

    let outcome = execute(input, timeout)?;

    println!("deploymentName: {}", outcome.deployment_name);
    for (name, output) in &outcome.outputs {
        println!("{name}: {}", output.value);
    }

    Ok(())
}

fn run_action() -> Result<(), Box<dyn Error>> {
    let options = ActionOptions::from_env()?;
    if options.github.running_as_action {
        info!(
            "==== Running workflow {} for {}@{} ====",
            options.github.workflow, options.github.git_ref, options.github.commit
        );
    }

    let input = options.to_deploy_input()?;
    let outcome = execute(input, options.timeout)?;

    let channel = OutputChannel::from_env();
    channel.write("deploymentName", &outcome.deployment_name)?;
    for (name, output) in &outcome.outputs {
        channel.write(name, &output.value)?;
    }

    if options.github.running_as_action {
        info!("==== Successfully finished running the workflow ====");
    }

    Ok(())
}

fn execute(input: DeployInput, timeout: Duration) -> Result<DeployOutcome, Box<dyn Error>> {
    let cancel = CancelToken::with_timeout(timeout);
    spawn_interrupt_watcher(cancel.clone());

    let http_client =
        HttpClient::new().map_err(|e| format!("error creating http client: {}", e))?;
    let command = DeployCommand::new(http_client);

    Ok(command.run(input, &cancel)?)
}

fn init_logging() {
    // LOG_LEVEL not set, default to info
    let level = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|lvl| lvl.parse::<tracing::Level>().ok())
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::fmt().with_max_level(level).init();
}

/// The watcher trips the shared token and terminates the process, mirroring
/// the cooperative cancellation passed into every remote call.
fn spawn_interrupt_watcher(cancel: CancelToken) {
    std::thread::spawn(move || {
        let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
        else {
            return;
        };

        if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
            info!("Received interrupt, exiting now...");
            cancel.cancel();
            process::exit(1);
        }
    });
}
