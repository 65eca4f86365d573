use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use groupwire_core::config::Config;
use groupwire_core::core_relay::MemoryRelayNetwork;
use groupwire_core::core_session::{GroupSessionOrchestrator, InviteOutcome, SessionEvent};
use groupwire_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use groupwire_core::{Identity, MemorySnapshotStore, SimpleGroupEngine};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

const DEMO_RELAY: &str = "wss://relay.demo.local";
const DEMO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "groupwire")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Set the log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long, global = true)]
    json_logs: bool,

    /// Path to a TOML config file (`~` is expanded)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate an identity key pair and print it as JSON
    Keygen,

    /// Print the effective configuration, or write it to a file
    Config {
        /// Write TOML here instead of printing JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Two sessions on an in-memory relay: create, invite, join, message
    Demo {
        #[arg(default_value = "Hello from A!")]
        message: String,
    },
}

fn load_config(path: Option<&str>) -> Result<Config> {
    let path = path
        .map(|raw| shellexpand::tilde(raw).into_owned())
        .map(PathBuf::from);
    Config::load(path.as_deref()).context("failed to load configuration")
}

fn init_logging(args: &Args, config: &Config) -> Result<()> {
    let mut log_config = LogConfig::from_config(&config.logging)?;
    if let Some(level) = &args.log_level {
        log_config.level = LogLevel::from_str(level).unwrap_or_else(|| {
            eprintln!("Invalid log level '{}', using 'info'", level);
            LogLevel::Info
        });
    }
    if args.json_logs {
        log_config = log_config.json_format(true);
    }
    init_logging_with_config(log_config)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    init_logging(&args, &config)?;

    match args.command {
        Some(Command::Keygen) => keygen()?,
        Some(Command::Config { output }) => show_config(&config, output)?,
        Some(Command::Demo { message }) => demo(&config, &message).await?,
        None => {
            info!("No command specified. Use --help for usage information.");
        }
    }

    Ok(())
}

fn keygen() -> Result<()> {
    let identity = Identity::generate();
    let output = serde_json::json!({
        "public_key": identity.public_key().to_hex(),
        "private_key": identity.secret_hex().as_str(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn show_config(config: &Config, output: Option<PathBuf>) -> Result<()> {
    match output {
        Some(path) => {
            config.save_to_file(&path)?;
            info!(path = %path.display(), "configuration written");
        }
        None => println!("{}", serde_json::to_string_pretty(config)?),
    }
    Ok(())
}

async fn demo_session(config: &Config, network: &MemoryRelayNetwork) -> Result<(GroupSessionOrchestrator, Identity)> {
    let identity = Identity::generate();
    let session = GroupSessionOrchestrator::new(
        config,
        Arc::new(SimpleGroupEngine::new()),
        Arc::new(MemorySnapshotStore::new()),
        Arc::new(network.client().await),
    )?;
    let report = session
        .login(&identity.secret_hex(), &identity.public_key().to_hex())
        .await?;
    if !report.relays.any_connected() {
        bail!("demo session could not reach the in-memory relay");
    }
    Ok((session, identity))
}

async fn next_event<P>(rx: &mut broadcast::Receiver<SessionEvent>, mut predicate: P) -> Result<SessionEvent>
where
    P: FnMut(&SessionEvent) -> bool,
{
    let search = async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Ok(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => bail!("event stream closed"),
            }
        }
    };
    tokio::time::timeout(DEMO_TIMEOUT, search)
        .await
        .context("timed out waiting for a session event")?
}

async fn demo(base: &Config, message: &str) -> Result<()> {
    let network = MemoryRelayNetwork::new();
    network.add_relay(DEMO_RELAY).await?;
    let mut config = base.clone();
    config.relays.urls = vec![DEMO_RELAY.to_string()];

    let (alice, alice_id) = demo_session(&config, &network).await?;
    let (bob, bob_id) = demo_session(&config, &network).await?;
    info!(alice = %alice_id.public_key().short(), bob = %bob_id.public_key().short(), "sessions ready");
    let mut bob_events = bob.subscribe_events();

    let group_id = alice.create_group("demo").await?;
    match alice.invite_member(&group_id, &bob_id.public_key().to_hex()).await? {
        InviteOutcome::Committed { epoch, .. } => info!(epoch, "bob invited"),
        other => bail!("invite did not complete: {:?}", other),
    }

    let SessionEvent::InviteReceived(invite) =
        next_event(&mut bob_events, |e| matches!(e, SessionEvent::InviteReceived(_))).await?
    else {
        bail!("expected an invite");
    };
    bob.accept_invite(&invite.id).await?;

    alice.send_message(&group_id, message.as_bytes()).await?;
    let SessionEvent::MessageReceived { plaintext, epoch, .. } =
        next_event(&mut bob_events, |e| matches!(e, SessionEvent::MessageReceived { .. })).await?
    else {
        bail!("expected a message");
    };
    println!("bob received at epoch {}: {}", epoch, String::from_utf8_lossy(&plaintext));

    if let Err(e) = bob.update_keys(&group_id).await {
        warn!(error = %e, "key update failed");
    }
    alice.logout().await;
    bob.logout().await;
    Ok(())
}
