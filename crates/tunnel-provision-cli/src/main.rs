use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tunnel_provision_core::auth::DEFAULT_CLIENT_ID;
use tunnel_provision_core::cloud::DEFAULT_REGION;
use tunnel_provision_core::engine::AUTH_USER;
use tunnel_provision_core::publish::SUPERVISOR_URL;
use tunnel_provision_core::service::TUNNEL_IMAGE;
use tunnel_provision_core::store::default_data_dir;
use tunnel_provision_core::transport::DEFAULT_TIMEOUT;
use tunnel_provision_core::{
    AuthError, AuthorizationFlow, CloudApiClient, CloudEndpoints, CloudError, ConfigPublisher,
    ConnectionDetails, FileCredentialStore, FileProgressStore, NoopPublisher, OAuthClientConfig,
    PublishError, ReqwestTransport, ServiceSpec, SetupError, SetupOptions, SetupOrchestrator,
    StoreError, SupervisorPublisher, TransportError, parse_callback, setup_status,
};

#[derive(Debug, Parser)]
#[command(name = "tunnel-provision")]
#[command(
    about = "Provisions the Cloud Run relay for the Home Assistant tunnel add-on",
    long_about = None
)]
struct Cli {
    /// Directory holding the token and setup state files.
    #[arg(long, global = true, env = "TUNNEL_DATA_DIR", default_value_os_t = default_data_dir())]
    data_dir: PathBuf,
    #[arg(long, global = true, env = "TUNNEL_OAUTH_CLIENT_ID", default_value = DEFAULT_CLIENT_ID)]
    client_id: String,
    #[arg(long, global = true, env = "TUNNEL_REGION", default_value = DEFAULT_REGION)]
    region: String,
    #[arg(long, global = true, env = "TUNNEL_IMAGE", default_value = TUNNEL_IMAGE)]
    image: String,
    #[arg(long, global = true, default_value_t = DEFAULT_TIMEOUT.as_secs())]
    http_timeout_secs: u64,
    /// Supervisor API token; without it the add-on options are not updated.
    #[arg(long, global = true, env = "SUPERVISOR_TOKEN", hide_env_values = true)]
    supervisor_token: Option<String>,
    #[arg(long, global = true, default_value = SUPERVISOR_URL)]
    supervisor_url: String,
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
    /// Lists the open billing accounts visible to the signed-in user.
    BillingAccounts {
        #[arg(long)]
        json: bool,
    },
    /// Creates (or resumes creating) the project and relay service.
    Setup {
        #[arg(long)]
        billing_account: Option<String>,
        #[arg(long)]
        json: bool,
    },
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Subcommand)]
enum AuthCommands {
    /// Prints the consent URL, then reads the redirected URL or code.
    Login {
        #[arg(long, default_value = "http://localhost")]
        redirect_uri: String,
    },
    Refresh,
}

enum CliPublisher<'a> {
    Noop(NoopPublisher),
    Supervisor(SupervisorPublisher<&'a ReqwestTransport>),
}

impl ConfigPublisher for CliPublisher<'_> {
    fn publish(&mut self, details: &ConnectionDetails) -> Result<(), PublishError> {
        match self {
            CliPublisher::Noop(publisher) => publisher.publish(details),
            CliPublisher::Supervisor(publisher) => publisher.publish(details),
        }
    }
}

fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Status { json } => {
            let status = setup_status(
                &FileCredentialStore::in_dir(&cli.data_dir),
                &FileProgressStore::in_dir(&cli.data_dir),
            )?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("Authenticated: {}", status.authenticated);
                println!("Step: {}", status.step);
                println!("Project: {}", status.project_id.as_deref().unwrap_or("-"));
                println!("Server URL: {}", status.server_url.as_deref().unwrap_or("-"));
                println!("Password generated: {}", status.has_password);
            }
        }
        Commands::Auth { command } => run_auth(&cli, command)?,
        Commands::BillingAccounts { json } => {
            let transport = transport(&cli)?;
            let mut credentials = FileCredentialStore::in_dir(&cli.data_dir);
            let flow = AuthorizationFlow::new(&transport, oauth_config(&cli));
            flow.ensure_fresh_token(&mut credentials, Utc::now())?;

            let client = CloudApiClient::new(&transport, credentials, CloudEndpoints::google());
            let accounts = client.list_billing_accounts()?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&accounts)?);
            } else if accounts.is_empty() {
                println!("No open billing accounts found.");
            } else {
                for account in accounts {
                    println!("{}\t{}", account.name, account.display_name);
                }
            }
        }
        Commands::Setup {
            billing_account,
            json,
        } => run_setup(&cli, billing_account.as_deref(), *json)?,
    }

    Ok(())
}

fn run_auth(cli: &Cli, command: &AuthCommands) -> Result<(), CliError> {
    let transport = transport(cli)?;
    let mut credentials = FileCredentialStore::in_dir(&cli.data_dir);
    let mut progress = FileProgressStore::in_dir(&cli.data_dir);
    let mut flow = AuthorizationFlow::new(&transport, oauth_config(cli));

    match command {
        AuthCommands::Login { redirect_uri } => {
            let url = flow.begin_authorization(redirect_uri)?;
            println!("Open this URL in a browser and grant access:\n\n{url}\n");
            print!("Paste the redirected URL (or just the code): ");
            std::io::stdout().flush()?;
            let mut input = String::new();
            std::io::stdin().lock().read_line(&mut input)?;
            let params = parse_callback(&input);
            let token = flow.complete_authorization(
                params.code.as_deref(),
                params.error.as_deref(),
                &mut credentials,
                &mut progress,
            )?;
            println!("Signed in; token saved to {}", credentials.path().display());
            if token.refresh_token.is_none() {
                println!("No refresh token was issued; sign in again once it expires.");
            }
        }
        AuthCommands::Refresh => {
            let token = flow.refresh_access_token(&mut credentials)?;
            match token.expiry {
                Some(expiry) => println!("Access token refreshed; valid until {expiry}"),
                None => println!("Access token refreshed"),
            }
        }
    }
    Ok(())
}

fn run_setup(cli: &Cli, billing_account: Option<&str>, json: bool) -> Result<(), CliError> {
    let transport = transport(cli)?;
    let mut credentials = FileCredentialStore::in_dir(&cli.data_dir);
    let progress = FileProgressStore::in_dir(&cli.data_dir);

    debug!(data_dir = %cli.data_dir.display(), region = %cli.region, "starting setup");
    let flow = AuthorizationFlow::new(&transport, oauth_config(cli));
    flow.ensure_fresh_token(&mut credentials, Utc::now())
        .map_err(|err| match err {
            AuthError::NotAuthenticated => CliError::Setup(SetupError::NotAuthenticated),
            other => CliError::Auth(other),
        })?;

    let publisher = match &cli.supervisor_token {
        Some(token) => CliPublisher::Supervisor(SupervisorPublisher::new(
            &transport,
            cli.supervisor_url.as_str(),
            token.as_str(),
        )),
        None => CliPublisher::Noop(NoopPublisher),
    };
    let options = SetupOptions {
        region: cli.region.clone(),
        service: ServiceSpec {
            image: cli.image.clone(),
            ..ServiceSpec::default()
        },
        ..SetupOptions::default()
    };
    let client = CloudApiClient::new(&transport, credentials, CloudEndpoints::google());
    let mut orchestrator = SetupOrchestrator::new(client, progress, publisher, options);

    let result = match orchestrator.run_setup(billing_account) {
        Ok(result) => result,
        Err(err) => {
            if err.billing_required() {
                eprintln!(
                    "A billing account must be linked. Run `tunnel-provision billing-accounts` \
                     and pass one with --billing-account."
                );
            } else if err.is_retryable() {
                eprintln!("The failure looks temporary; run setup again to resume.");
            }
            return Err(err.into());
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    println!("Project: {}", result.project_id);
    println!(
        "Server URL: {}",
        result.server_url.as_deref().unwrap_or("(not available yet)")
    );
    println!("Username: {AUTH_USER}");
    println!("Password: {}", result.generated_password);
    for warning in &result.warnings {
        println!("warning: {warning}");
    }
    Ok(())
}

fn transport(cli: &Cli) -> Result<ReqwestTransport, TransportError> {
    ReqwestTransport::new(Duration::from_secs(cli.http_timeout_secs))
}

fn oauth_config(cli: &Cli) -> OAuthClientConfig {
    OAuthClientConfig::google(cli.client_id.as_str())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("failed to read input: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to render JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
