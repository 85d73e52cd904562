//! Threshold signing CLI
//!
//! Entry point for running a relay, initiating or joining a signing session,
//! and generating development key shares.

use clap::{Parser, Subcommand};
use mpc_keysign::logging::{init_logging, LogLevel};
use mpc_keysign::{
    ConfigError, CoordinatorConfig, FileVault, FrostEngineFactory, JoinInfo, MemoryVault,
    RelayConfig, RelayServer, Sha256Digest, SignatureAlgorithm, SigningCoordinator,
    SigningRequest,
};
use std::net::AddrParseError;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "mpc-keysign")]
#[command(about = "Threshold signing over an encrypted message relay")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "MPC_KEYSIGN_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit JSON logs
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct SignArgs {
    /// This device's party identifier
    #[arg(long, env = "MPC_KEYSIGN_PARTY_ID")]
    party_id: Option<String>,

    /// Encrypted vault file
    #[arg(long)]
    vault: PathBuf,

    /// Vault password
    #[arg(short, long, env = "MPC_KEYSIGN_VAULT_PASSWORD")]
    password: String,

    /// Hex-encoded payload (a 32-byte digest unless --hash-payload is set)
    #[arg(long)]
    payload: String,

    /// Sign SHA-256 of the payload instead of the payload itself
    #[arg(long)]
    hash_payload: bool,

    /// Derivation path handed to the engine
    #[arg(long, default_value = "m")]
    chain_path: String,

    /// Network the payload targets
    #[arg(long, default_value = "bitcoin")]
    network: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a stand-alone relay
    Relay {
        /// Bind address (e.g., 0.0.0.0:18080)
        #[arg(short, long, default_value = "0.0.0.0:18080")]
        bind: String,
    },

    /// Start a signing session and wait for other devices to join
    Sign {
        #[command(flatten)]
        args: SignArgs,

        /// Signature scheme (ecdsa, eddsa)
        #[arg(long, default_value = "eddsa")]
        scheme: SignatureAlgorithm,

        /// External relay URL; a relay is hosted locally when unset
        #[arg(long, env = "MPC_KEYSIGN_RELAY_URL")]
        relay_url: Option<String>,

        /// Bind address of the self-hosted relay (e.g., 0.0.0.0:18080)
        #[arg(long, env = "MPC_KEYSIGN_RELAY_BIND")]
        bind: Option<String>,

        /// Relay URL advertised to joining devices
        #[arg(long, env = "MPC_KEYSIGN_PUBLIC_URL")]
        public_url: Option<String>,

        /// Reuse a session identifier
        #[arg(long)]
        session_id: Option<String>,

        /// Comma-separated peers known to take part
        #[arg(long, value_delimiter = ',')]
        peers: Vec<String>,
    },

    /// Join a session started by another device
    Join {
        #[command(flatten)]
        args: SignArgs,

        /// Pairing JSON printed by `sign`
        #[arg(long)]
        join_info: String,
    },

    /// Generate test key shares using a trusted dealer (for development only)
    GenerateTestKeys {
        /// Output directory
        #[arg(short, long, default_value = "vaults")]
        output_dir: PathBuf,

        /// Comma-separated party identifiers
        #[arg(long, value_delimiter = ',', default_value = "device-1,device-2,device-3")]
        parties: Vec<String>,

        /// Threshold (t of n)
        #[arg(short, long, default_value = "2")]
        threshold: u16,

        /// Vault password
        #[arg(short, long, env = "MPC_KEYSIGN_VAULT_PASSWORD")]
        password: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(LogLevel::from(cli.log_level.as_str()), cli.json_logs)?;

    // Ctrl-C cancels running sessions and stops the relay
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    match cli.command {
        Commands::Relay { bind } => {
            run_relay(cli.config, bind, shutdown_rx).await?;
        }
        Commands::Sign {
            args,
            scheme,
            relay_url,
            bind,
            public_url,
            session_id,
            peers,
        } => {
            let mut config = load_config(cli.config, args.party_id.clone())?;
            if relay_url.is_some() {
                config.relay_url = relay_url;
            }
            apply_relay_flags(&mut config, bind, public_url)?;
            let coordinator = build_coordinator(config, &args, shutdown_rx)?;
            let request = SigningRequest {
                network: args.network.clone(),
                scheme,
                curve: None,
                payload: args.payload.clone(),
                chain_path: args.chain_path.clone(),
                session_id,
                peers: (!peers.is_empty()).then_some(peers),
            };

            let prepared = coordinator.prepare(&request).await?;
            println!("{}", serde_json::to_string(prepared.join_info())?);

            let result = coordinator.run(prepared).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Join { args, join_info } => {
            let info: JoinInfo = serde_json::from_str(&join_info)?;
            let config = load_config(cli.config, args.party_id.clone())?;
            let coordinator = build_coordinator(config, &args, shutdown_rx)?;
            let request = SigningRequest {
                network: args.network.clone(),
                scheme: info.algorithm,
                curve: None,
                payload: args.payload.clone(),
                chain_path: args.chain_path.clone(),
                session_id: Some(info.session_id.clone()),
                peers: None,
            };

            let result = coordinator.join(&info, &request).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::GenerateTestKeys {
            output_dir,
            parties,
            threshold,
            password,
        } => {
            generate_test_keys(output_dir, parties, threshold, password)?;
        }
    }

    Ok(())
}

/// Config file if given, else environment; `--party-id` wins over both
fn load_config(
    path: Option<PathBuf>,
    party_id: Option<String>,
) -> Result<CoordinatorConfig, ConfigError> {
    let mut config = match path {
        Some(path) => CoordinatorConfig::from_toml_file(path)?,
        None => match CoordinatorConfig::from_env() {
            Ok(config) => config,
            Err(ConfigError::MissingEnvVar(var)) => match &party_id {
                Some(party) => CoordinatorConfig::new(party.clone()),
                None => return Err(ConfigError::MissingEnvVar(var)),
            },
            Err(e) => return Err(e),
        },
    };
    if let Some(party) = party_id {
        config.local_party_id = party;
    }
    Ok(config)
}

/// `--bind` and `--public-url` override the self-hosted relay settings
fn apply_relay_flags(
    config: &mut CoordinatorConfig,
    bind: Option<String>,
    public_url: Option<String>,
) -> Result<(), AddrParseError> {
    if let Some(bind) = bind {
        config.relay.bind = bind.parse()?;
    }
    if public_url.is_some() {
        config.relay.public_url = public_url;
    }
    Ok(())
}

fn build_coordinator(
    config: CoordinatorConfig,
    args: &SignArgs,
    shutdown: watch::Receiver<bool>,
) -> Result<SigningCoordinator, Box<dyn std::error::Error>> {
    let vault = FileVault::new(&args.vault).load(&args.password)?;
    let mut coordinator = SigningCoordinator::new(config, Arc::new(vault))
        .with_engine(Arc::new(FrostEngineFactory))
        .with_shutdown(shutdown);
    if args.hash_payload {
        coordinator = coordinator.with_digest_builder(Arc::new(Sha256Digest));
    }
    Ok(coordinator)
}

/// Run a stand-alone relay until Ctrl-C
async fn run_relay(
    config_path: Option<PathBuf>,
    bind: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut relay = match config_path {
        Some(path) => CoordinatorConfig::from_toml_file(path)?.relay,
        None => RelayConfig::default(),
    };
    relay.bind = bind.parse()?;

    let server = RelayServer::start(&relay).await?;
    tracing::info!(url = %server.url(), "Relay ready");

    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }

    server.shutdown().await?;
    Ok(())
}

/// Generate test key shares using a trusted dealer (development only)
fn generate_test_keys(
    output_dir: PathBuf,
    parties: Vec<String>,
    threshold: u16,
    password: String,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::warn!("Generating test keys with trusted dealer - FOR DEVELOPMENT ONLY!");

    if usize::from(threshold) > parties.len() {
        return Err("Threshold cannot be greater than the number of parties".into());
    }

    let shares = mpc_keysign::frost::generate_key_shares(&parties, threshold)?;
    std::fs::create_dir_all(&output_dir)?;

    let mut group_pubkey = String::new();
    for (party, share) in shares {
        group_pubkey = share.public_key.clone();
        let path = output_dir.join(format!("{}.vault.json", party));
        FileVault::new(&path).save(&MemoryVault::new(party.clone()).with_share(share), &password)?;
        tracing::info!(party = %party, path = %path.display(), "Saved vault");
    }

    tracing::info!("Group public key (x-only): {}", group_pubkey);
    let pubkey_path = output_dir.join("group_pubkey.txt");
    std::fs::write(&pubkey_path, &group_pubkey)?;
    tracing::info!("Saved group public key to {}", pubkey_path.display());

    Ok(())
}
