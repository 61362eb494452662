//! Plover CLI - connects an XMPP account and reports what the server negotiated.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use plover_xmpp::config::{create_default_config, load_config_from};
use plover_xmpp::filter::AcceptAll;
use plover_xmpp::stanza::Ping;
use plover_xmpp::{
    Config, ConnectionEvent, Iq, Jid, Stanza, StreamSessionContext, XmppConnection,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Plover - XMPP client core command-line tool
#[derive(Parser)]
#[command(name = "plover")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Connect, print the negotiated session and disconnect
    Connect {
        /// Ping the server once connected
        #[arg(long)]
        ping: bool,

        /// Stay connected and log connection events until Ctrl-C
        #[arg(long)]
        stay: bool,
    },
}

fn default_config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("im", "plover", "plover")
        .context("could not determine the configuration directory")?;
    Ok(dirs.config_dir().join("config.toml"))
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn run_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    create_default_config(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn print_session(session: &StreamSessionContext) {
    println!("Connected as {}", session.jid);
    if let Some(stream_id) = &session.stream_id {
        println!("  stream id:  {stream_id}");
    }
    println!(
        "  mechanism:  {}",
        session.mechanism.as_deref().unwrap_or("none")
    );
    println!("  encrypted:  {}", session.encrypted);
    match &session.stream_management {
        Some(sm) => println!(
            "  stream management: enabled (resumable: {}, window: {:?})",
            sm.resumable, sm.resumption_window
        ),
        None => println!("  stream management: off"),
    }
    for feature in &session.features {
        println!("  feature:    {feature}");
    }
}

async fn ping_server(connection: &XmppConnection, domain: Jid) -> Result<()> {
    let started = tokio::time::Instant::now();
    connection
        .send_iq_request(Iq::get(Some(domain.clone()), Ping))
        .await
        .with_context(|| format!("ping to {domain} failed"))?;
    println!("Ping to {domain}: {:?}", started.elapsed());
    Ok(())
}

async fn log_events_until_interrupted(connection: &XmppConnection) -> Result<()> {
    let mut events = connection.subscribe_events();
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl-C")?;
                info!("interrupted");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(ConnectionEvent::StateChanged { from, to }) => info!(%from, %to, "state changed"),
                Ok(ConnectionEvent::Established { jid }) => info!(%jid, "session established"),
                Ok(ConnectionEvent::Resumed { jid, replayed }) => info!(%jid, replayed, "session resumed"),
                Ok(ConnectionEvent::Lost { reason, will_retry }) => {
                    warn!(%reason, will_retry, "connection lost");
                    if !will_retry {
                        return Ok(());
                    }
                }
                Ok(ConnectionEvent::Reconnecting { attempt, delay }) => info!(attempt, ?delay, "reconnecting"),
                Ok(ConnectionEvent::Error { message, recoverable }) => warn!(%message, recoverable, "connection error"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed connection events"),
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }
}

async fn run_connect(config: Config, ping: bool, stay: bool) -> Result<()> {
    let connection_config = config
        .connection_config()
        .context("invalid account configuration")?;
    let domain: Jid = connection_config
        .domain()
        .parse()
        .context("account domain is not a valid JID")?;

    info!(jid = %connection_config.jid, transport = ?connection_config.transport, "connecting");
    let connection = XmppConnection::new(connection_config);
    connection.add_async_listener(AcceptAll, |stanza: Arc<Stanza>| async move {
        info!(
            kind = ?stanza.kind(),
            from = ?stanza.from().map(ToString::to_string),
            id = ?stanza.id(),
            "inbound stanza"
        );
    });
    let session = connection.connect().await.context("failed to connect")?;
    print_session(&session);

    let result = async {
        if ping {
            ping_server(&connection, domain).await?;
        }
        if stay {
            log_events_until_interrupted(&connection).await?;
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    connection.disconnect().await;
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };

    match cli.command {
        Commands::Init { force } => run_init(&config_path, force),
        Commands::Connect { ping, stay } => {
            let config = load_config_from(&config_path)
                .with_context(|| format!("failed to load {}", config_path.display()))?;
            init_logging(&config.logging.level);
            run_connect(config, ping, stay).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_writes_default_config_and_refuses_to_overwrite() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("plover").join("config.toml");

        run_init(&path, false).expect("first init succeeds");
        assert!(path.exists());
        assert!(run_init(&path, false).is_err());
        run_init(&path, true).expect("forced init succeeds");
    }

    #[test]
    fn cli_parses_connect_flags() {
        let cli = Cli::try_parse_from(["plover", "--config", "/tmp/plover.toml", "connect", "--ping"])
            .expect("arguments parse");
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/plover.toml")));
        assert!(matches!(
            cli.command,
            Commands::Connect {
                ping: true,
                stay: false
            }
        ));
    }
}
