//! chatfed - multi-instance chat connection manager
//!
//! Keeps one authenticated connection per chat instance, with sessions and the
//! instance directory persisted under the data directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser as ClapParser, Subcommand};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatfed::auth::{Credentials, HttpAuthenticator, LoginError, MfaResponse};
use chatfed::config::{default_config_path, Config};
use chatfed::instance_url::{normalize, validate, HttpProbe, Validation};
use chatfed::instances::InstanceDirectory;
use chatfed::registry::{InstanceRegistry, InstanceState, RegistryEvent};
use chatfed::sessions::SessionStore;
use chatfed::storage::FileStorage;
use chatfed::transport::WsClientFactory;

/// chatfed - one client, many chat instances.
#[derive(ClapParser, Debug)]
#[command(name = "chatfed", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the config file
    #[arg(long, env = "CHATFED_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the session and instance documents (overrides config)
    #[arg(long, env = "CHATFED_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check whether a URL points at a chat instance's API
    Validate { url: String },

    /// Manage the instance directory
    Instances {
        #[command(subcommand)]
        command: InstanceCommands,
    },

    /// Inspect stored sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },

    /// Log in to an instance and store the session
    Login {
        url: String,

        #[command(flatten)]
        credentials: LoginArgs,

        /// Name the instance shows for this session (overrides config)
        #[arg(long)]
        label: Option<String>,
    },

    /// Close the connection and forget the session for an instance
    Logout { url: String },

    /// Connect to every stored session and log state changes until Ctrl+C
    Connect,
}

#[derive(Subcommand, Debug)]
enum InstanceCommands {
    /// List known instances
    List,
    /// Add an instance, or update its display name
    Add {
        url: String,
        /// Display name (defaults to the hostname)
        #[arg(long)]
        name: Option<String>,
    },
    /// Remove a user-added instance
    Remove { url: String },
    /// Change an instance's display name
    Rename { url: String, name: String },
}

#[derive(Subcommand, Debug)]
enum SessionCommands {
    /// List instances with a stored session
    List,
}

#[derive(Args, Debug)]
struct LoginArgs {
    #[arg(long, requires = "password", conflicts_with = "mfa_ticket")]
    email: Option<String>,

    #[arg(long, env = "CHATFED_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Ticket from a previous login that asked for a second factor
    #[arg(long)]
    mfa_ticket: Option<String>,

    #[arg(long, requires = "mfa_ticket", conflicts_with = "recovery_code")]
    totp: Option<String>,

    #[arg(long, requires = "mfa_ticket")]
    recovery_code: Option<String>,
}

impl LoginArgs {
    fn into_credentials(self) -> anyhow::Result<Credentials> {
        if let Some(mfa_ticket) = self.mfa_ticket {
            let mfa_response = match (self.totp, self.recovery_code, self.password) {
                (Some(totp_code), _, _) => MfaResponse::Totp { totp_code },
                (None, Some(recovery_code), _) => MfaResponse::Recovery { recovery_code },
                (None, None, Some(password)) => MfaResponse::Password { password },
                (None, None, None) => {
                    anyhow::bail!("--mfa-ticket needs --totp, --recovery-code, or --password")
                }
            };
            return Ok(Credentials::Mfa {
                mfa_ticket,
                mfa_response,
            });
        }

        match (self.email, self.password) {
            (Some(email), Some(password)) => Ok(Credentials::Password { email, password }),
            _ => anyhow::bail!("either --email and --password or --mfa-ticket is required"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?.unwrap_or_default();
    if let Some(dir) = cli.data_dir {
        config.data_dir = Some(dir);
    }

    match cli.command {
        Commands::Validate { url } => run_validate(&config, &url).await,
        Commands::Instances { command } => run_instances(&config, command),
        Commands::Sessions {
            command: SessionCommands::List,
        } => run_sessions(&config),
        Commands::Login {
            url,
            credentials,
            label,
        } => run_login(&config, &url, credentials, label).await,
        Commands::Logout { url } => run_logout(&config, &url),
        Commands::Connect => run_connect(&config).await,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "chatfed=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Stores and registry wired to the data directory and real network clients.
fn build_registry(config: &Config) -> anyhow::Result<InstanceRegistry> {
    let data_dir = config.resolve_data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
    tracing::debug!(path = %data_dir.display(), "using data directory");

    let storage = Arc::new(FileStorage::new(data_dir));
    let legacy = config.legacy_session.as_ref().map(|l| l.to_legacy());
    let sessions = SessionStore::load(storage.clone(), legacy);
    let directory = InstanceDirectory::load(storage);

    let http = config.http.client().context("failed to build HTTP client")?;
    Ok(InstanceRegistry::new(
        sessions,
        directory,
        Arc::new(WsClientFactory::new(http.clone())),
        Arc::new(HttpAuthenticator::new(http)),
    ))
}

async fn run_validate(config: &Config, url: &str) -> anyhow::Result<()> {
    let probe = HttpProbe::new(config.http.client()?);
    let result = validate(&probe, url).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if matches!(result, Validation::Invalid { .. }) {
        std::process::exit(1);
    }
    Ok(())
}

fn run_instances(config: &Config, command: InstanceCommands) -> anyhow::Result<()> {
    let registry = build_registry(config)?;
    let directory = registry.directory();

    match command {
        InstanceCommands::List => {
            for info in directory.list() {
                let marker = if info.builtin { " (built-in)" } else { "" };
                println!("{}\t{}{}", info.url, info.name, marker);
            }
        }
        InstanceCommands::Add { url, name } => {
            let key = normalize(&url);
            let name = name
                .or_else(|| key.hostname())
                .with_context(|| format!("'{url}' is not a valid URL"))?;
            let info = directory.add(&url, &name)?;
            println!("added {}\t{}", info.url, info.name);
        }
        InstanceCommands::Remove { url } => {
            if !directory.remove(&url)? {
                anyhow::bail!("{} is unknown or built-in", normalize(&url));
            }
            println!("removed {}", normalize(&url));
        }
        InstanceCommands::Rename { url, name } => {
            if !directory.rename(&url, &name)? {
                anyhow::bail!("{} is not a known instance", normalize(&url));
            }
            println!("renamed {} to {}", normalize(&url), name);
        }
    }
    Ok(())
}

fn run_sessions(config: &Config) -> anyhow::Result<()> {
    let registry = build_registry(config)?;
    for (key, session) in registry.sessions().list_all() {
        let status = if session.valid { "valid" } else { "unvalidated" };
        println!("{}\tuser {}\t{}", key, session.user_id, status);
    }
    Ok(())
}

async fn run_login(
    config: &Config,
    url: &str,
    args: LoginArgs,
    label: Option<String>,
) -> anyhow::Result<()> {
    let credentials = args.into_credentials()?;
    let label = label.unwrap_or_else(|| config.resolve_client_label());
    let registry = build_registry(config)?;

    match registry.login(url, credentials, &label).await {
        Ok(()) => {}
        Err(LoginError::MfaRequired(challenge)) => {
            println!("second factor required");
            println!("ticket: {}", challenge.ticket);
            println!("methods: {}", challenge.allowed_methods.join(", "));
            println!("re-run with --mfa-ticket {} and --totp or --recovery-code", challenge.ticket);
            std::process::exit(2);
        }
        Err(e) => {
            eprintln!("chatfed login: {} ({})", e, e.reason());
            std::process::exit(1);
        }
    }

    // The session is stored; confirm it actually connects.
    let key = normalize(url);
    let timeout = Duration::from_secs(config.http.request_timeout_secs);
    let outcome = wait_for_settled(&registry, key.as_str(), timeout).await;
    registry.dispose_all();

    match outcome {
        Some(InstanceState::Connected) => println!("logged in to {key}"),
        Some(_) => println!("logged in to {key}, but the connection failed"),
        None => println!("logged in to {key}, connection not confirmed yet"),
    }
    Ok(())
}

/// Wait until the instance is `Connected` or `Error`, or the timeout passes.
async fn wait_for_settled(
    registry: &InstanceRegistry,
    url: &str,
    timeout: Duration,
) -> Option<InstanceState> {
    let mut state = registry.watch_state(url)?;
    let settled = tokio::time::timeout(
        timeout,
        state.wait_for(|s| matches!(s, InstanceState::Connected | InstanceState::Error)),
    )
    .await;
    match settled {
        Ok(Ok(current)) => Some(*current),
        _ => None,
    }
}

fn run_logout(config: &Config, url: &str) -> anyhow::Result<()> {
    let registry = build_registry(config)?;
    if registry.sessions().get(url).is_none() {
        anyhow::bail!("no session stored for {}", normalize(url));
    }
    registry.logout(url)?;
    println!("logged out of {}", normalize(url));
    Ok(())
}

async fn run_connect(config: &Config) -> anyhow::Result<()> {
    let registry = build_registry(config)?;
    let mut events = registry.subscribe();

    if registry.restore_sessions() == 0 {
        println!("no stored sessions; log in first");
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received Ctrl+C");
                break;
            }
            event = events.recv() => match event {
                Ok(RegistryEvent::StateChanged { instance, state }) => {
                    tracing::info!(instance = %instance, state = ?state, "state changed");
                    if state == InstanceState::Connected {
                        tracing::info!(
                            servers = registry.all_servers().len(),
                            conversations = registry.all_conversations().len(),
                            "entities available"
                        );
                    }
                }
                Ok(RegistryEvent::Closed { instance }) => {
                    tracing::info!(instance = %instance, "connection closed");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "registry events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    registry.dispose_all();
    tracing::info!("chatfed exiting");
    Ok(())
}
