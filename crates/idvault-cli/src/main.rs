use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use idvault_core::{
    AuthError, CreateOptions, IdentityContext, IdentityId, Network, NetworkConfig, Store,
    VaultConfig,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

const EXIT_FAILURE: u8 = 1;
const EXIT_UNLOCK: u8 = 3;
const EXIT_STORE: u8 = 4;
const EXIT_IDENTITY: u8 = 5;

const PASSPHRASE_ENV: &str = "IDVAULT_PASSPHRASE";
const NEW_PASSPHRASE_ENV: &str = "IDVAULT_NEW_PASSPHRASE";

#[derive(Parser)]
#[command(name = "idvault")]
#[command(about = "Encrypted local identity store", long_about = None)]
struct Cli {
    /// Store file (overrides the config file and the platform default)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new identity, optionally bound to a network
    CreateIdentity {
        #[arg(long)]
        username: Option<String>,

        /// local, devnet, testnet, mainnet or a custom network name
        #[arg(long)]
        network: Option<String>,

        /// JSON-RPC endpoint for the network
        #[arg(long, requires = "network")]
        endpoint: Option<String>,
    },

    /// Print one identity as JSON
    Show { id: String },

    /// Print all identities as JSON
    List,

    /// Store a raw value
    Set { key: String, value: String },

    /// Print a raw value
    Get { key: String },

    /// Change the store passphrase
    Passwd,
}

impl Commands {
    fn creates_store(&self) -> bool {
        matches!(self, Commands::CreateIdentity { .. } | Commands::Set { .. })
    }
}

/// An error together with the process exit code it maps to.
struct Failure {
    code: u8,
    error: anyhow::Error,
}

impl Failure {
    fn new(code: u8, error: impl Into<anyhow::Error>) -> Self {
        Self {
            code,
            error: error.into(),
        }
    }
}

impl From<anyhow::Error> for Failure {
    fn from(error: anyhow::Error) -> Self {
        Self::new(EXIT_FAILURE, error)
    }
}

type CliResult<T> = std::result::Result<T, Failure>;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            eprintln!("error: {:#}", failure.error);
            ExitCode::from(failure.code)
        }
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let config = match &cli.config {
        Some(path) => VaultConfig::from_file(path)?,
        None => VaultConfig::default(),
    };
    let store_path = match cli.store {
        Some(path) => path,
        None => config.store_path()?,
    };

    let store = open_store(&store_path, &config, cli.command.creates_store())?;
    let passphrase = read_passphrase(PASSPHRASE_ENV, "Passphrase: ")?;
    store
        .unlock_with_deadline(&passphrase, config.unlock_deadline())
        .await
        .map_err(unlock_failure)?;
    debug!(path = %store_path.display(), "store ready");

    match cli.command {
        Commands::CreateIdentity {
            username,
            network,
            endpoint,
        } => {
            let binding = match network {
                Some(name) => Some(network_config(&name, endpoint)),
                None => config.network.clone(),
            };
            let ctx = IdentityContext::new(store.clone())
                .map_err(|e| Failure::new(EXIT_IDENTITY, e))?;
            let id = ctx
                .create_identity(CreateOptions {
                    username,
                    network_binding: binding,
                })
                .await
                .map_err(|e| Failure::new(EXIT_IDENTITY, e))?;
            let identity = ctx
                .get_identity(id)
                .map_err(|e| Failure::new(EXIT_IDENTITY, e))?;
            print_json(&identity)?;
        }
        Commands::Show { id } => {
            let id: IdentityId = id
                .parse()
                .with_context(|| format!("invalid identity id {id}"))?;
            let ctx = IdentityContext::new(store.clone()).map_err(anyhow::Error::from)?;
            let identity = ctx.get_identity(id).map_err(anyhow::Error::from)?;
            print_json(&identity)?;
        }
        Commands::List => {
            let ctx = IdentityContext::new(store.clone()).map_err(anyhow::Error::from)?;
            let identities = ctx.list_identities().map_err(anyhow::Error::from)?;
            print_json(&identities)?;
        }
        Commands::Set { key, value } => {
            store
                .set(&key, value.as_bytes())
                .map_err(|e| Failure::new(EXIT_STORE, e))?;
        }
        Commands::Get { key } => {
            let value = store.get(&key).map_err(anyhow::Error::from)?;
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(&value)
                .and_then(|_| stdout.write_all(b"\n"))
                .context("write value")?;
        }
        Commands::Passwd => {
            let new = read_passphrase(NEW_PASSPHRASE_ENV, "New passphrase: ")?;
            store
                .change_passphrase(&passphrase, &new)
                .map_err(unlock_failure)?;
            eprintln!("passphrase changed");
        }
    }

    store.flush().map_err(|e| Failure::new(EXIT_STORE, e))?;
    Ok(())
}

fn open_store(path: &Path, config: &VaultConfig, create: bool) -> CliResult<Store> {
    if !create && !path.exists() {
        return Err(Failure::new(
            EXIT_STORE,
            anyhow!("no store at {}", path.display()),
        ));
    }
    Store::open_with(path, config.store_options()).map_err(|e| {
        Failure::new(
            EXIT_STORE,
            anyhow::Error::from(e).context(format!("open store {}", path.display())),
        )
    })
}

fn unlock_failure(err: AuthError) -> Failure {
    let code = match &err {
        AuthError::InvalidPassphrase
        | AuthError::KeyDerivation(_)
        | AuthError::DeadlineExceeded(_) => EXIT_UNLOCK,
        AuthError::NoSuchStore(_) | AuthError::CreatedConcurrently(_) | AuthError::Store(_) => {
            EXIT_STORE
        }
    };
    Failure::new(code, err)
}

fn network_config(name: &str, endpoint: Option<String>) -> NetworkConfig {
    match (Network::from(name), endpoint) {
        (Network::Local, _) => NetworkConfig::local(),
        (Network::Devnet, None) => NetworkConfig::devnet(),
        (network, endpoint) => NetworkConfig {
            network,
            endpoint,
            ..NetworkConfig::local()
        },
    }
}

fn read_passphrase(env: &str, prompt: &str) -> anyhow::Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var(env) {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }
    let pw = rpassword::prompt_password(prompt).map_err(|e| anyhow!("passphrase prompt: {e}"))?;
    if pw.is_empty() {
        return Err(anyhow!("passphrase must not be empty"));
    }
    Ok(Zeroizing::new(pw))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
