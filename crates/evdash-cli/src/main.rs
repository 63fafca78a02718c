//! `evdash` – entry point for the EV telemetry backend.
//!
//! * `evdash serve` runs the aggregator, the broadcast server and the history
//!   recorder until Ctrl-C.
//! * `evdash watch` follows a server through the connection manager, falling
//!   back to synthetic data while it is unreachable.
//! * `evdash send '<json>'` sends one command and prints the response.
//! * `evdash config` prints the effective configuration.

mod config;
mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use evdash_client::{ConnectionManager, FeedItem};
use evdash_cockpit::BroadcastServer;
use evdash_hal::{HalProfile, SimRegistry, registry_for};
use evdash_kernel::{CommandDispatcher, CommandValidator, StateAggregator};
use evdash_middleware::{SnapshotHistory, record};
use evdash_types::{CommandEnvelope, CommandError, EvError, ServerMessage};

use crate::config::{Config, ConfigError, HardwareMode};

#[derive(Parser, Debug)]
#[command(name = "evdash", version, about = "EV telemetry and command backend")]
struct Cli {
    /// Config file (defaults to ~/.evdash/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the telemetry server
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        /// Use synthetic sources even on embedded targets
        #[arg(long)]
        synthetic: bool,
        /// Hide the banner
        #[arg(long)]
        quiet: bool,
    },
    /// Follow a server's telemetry stream
    Watch {
        /// Server URL, e.g. ws://localhost:8765
        #[arg(short, long)]
        url: Option<String>,
        /// Stop after this many snapshots
        #[arg(short = 'n', long)]
        count: Option<u64>,
    },
    /// Send one command and print the response
    Send {
        /// Command JSON, e.g. '{"action":"set_charge_limit","value":80}'
        json: String,
        #[arg(short, long)]
        url: Option<String>,
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
    /// Print the effective configuration
    Config {
        /// Also write it to the config file
        #[arg(long)]
        write: bool,
    },
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] EvError),

    #[error("invalid command: {0}")]
    Command(#[from] CommandError),

    #[error("could not start runtime: {0}")]
    Runtime(std::io::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("no response within {0} ms")]
    Timeout(u64),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let _guard = telemetry::init_tracing("evdash", level);

    let cancel = CancellationToken::new();
    let ctrlc_cancel = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        ctrlc_cancel.cancel();
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }

    let result = tokio::runtime::Runtime::new()
        .map_err(CliError::Runtime)
        .and_then(|rt| rt.block_on(run(cli, cancel)));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "evdash failed");
            eprintln!("{}: {e}", "error".red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<(), CliError> {
    let mut cfg = config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve {
            host,
            port,
            synthetic,
            quiet,
        } => {
            if let Some(host) = host {
                cfg.server.host = host;
            }
            if let Some(port) = port {
                cfg.server.port = port;
            }
            if synthetic {
                cfg.hardware.mode = HardwareMode::Synthetic;
            }
            if !quiet {
                print_banner();
            }
            serve(&cfg, cancel).await
        }
        Command::Watch { url, count } => {
            if let Some(url) = url {
                cfg.client.url = url;
                cfg.validate()?;
            }
            watch(&cfg, count, cancel).await
        }
        Command::Send {
            json,
            url,
            timeout_ms,
        } => {
            if let Some(url) = url {
                cfg.client.url = url;
                cfg.validate()?;
            }
            send(&cfg.client.url, &json, Duration::from_millis(timeout_ms)).await
        }
        Command::Config { write } => {
            let path = cli.config.unwrap_or_else(config::config_path);
            println!("{}", toml::to_string_pretty(&cfg).map_err(ConfigError::from)?);
            if write {
                config::save_to(&cfg, &path)?;
                println!("  {} Config saved to {}", "✓".green().bold(), path.display().to_string().bold());
            }
            Ok(())
        }
    }
}

async fn serve(cfg: &Config, cancel: CancellationToken) -> Result<(), CliError> {
    let registry = match cfg.hardware.mode {
        HardwareMode::Auto => registry_for(HalProfile::detect(), cfg.poll_timeout()),
        HardwareMode::Synthetic => SimRegistry::full()
            .with_poll_timeout(cfg.poll_timeout())
            .build(),
    };
    let (aggregator, handle, bus) =
        StateAggregator::new(registry, cfg.settings.clone(), cfg.aggregator_config());

    let history = SnapshotHistory::new(cfg.telemetry.history_size);
    let recorder = tokio::spawn(record(bus.subscribe(), history.clone()));

    let dispatcher = CommandDispatcher::new(CommandValidator::standard(), handle);
    let bound = BroadcastServer::new(cfg.server_config(), bus, dispatcher, history)
        .bind()
        .await?;
    println!(
        "  Listening on {}  (tick {} ms)\n",
        format!("ws://{}", bound.local_addr()).bold().cyan(),
        cfg.telemetry.interval_ms
    );

    // The aggregator outlives the server so commands still being dispatched
    // while sessions drain get answered.
    let stop_aggregator = CancellationToken::new();
    let mut aggregator = tokio::spawn(aggregator.run(stop_aggregator.clone()));
    let server = tokio::spawn(bound.run(cancel.clone()));

    // A fatal tick failure brings the server down too.
    let failed = tokio::select! {
        _ = cancel.cancelled() => None,
        aggregated = &mut aggregator => Some(aggregated),
    };
    cancel.cancel();
    let served = server.await;
    stop_aggregator.cancel();
    let aggregated = match failed {
        Some(aggregated) => aggregated,
        None => aggregator.await,
    };
    if let Err(e) = recorder.await {
        warn!(error = %e, "history recorder ended abnormally");
    }
    aggregated??;
    served??;
    info!("shutdown complete");
    Ok(())
}

async fn watch(cfg: &Config, count: Option<u64>, cancel: CancellationToken) -> Result<(), CliError> {
    let manager = ConnectionManager::start(cfg.client_config(), cancel.clone());
    let mut feed = manager.subscribe();
    let mut states = manager.watch_state();
    println!("  Watching {}", cfg.client.url.bold());

    let mut seen = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                println!("  {} {}", "●".yellow(), state.to_string().bold());
            }
            item = feed.recv() => match item {
                Ok(item) => {
                    print_item(&item);
                    seen += 1;
                    if count.is_some_and(|n| seen >= n) {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "watch output fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    manager.shutdown();
    Ok(())
}

fn print_item(item: &FeedItem) {
    let s = &item.snapshot;
    let origin = match item.origin {
        evdash_client::FeedOrigin::Live => "live".green(),
        evdash_client::FeedOrigin::Synthetic => "synthetic".yellow(),
    };
    let stale = if s.stale_sources.is_empty() {
        String::new()
    } else {
        format!("  stale: {}", s.stale_sources.join(",")).red().to_string()
    };
    println!(
        "  [{origin}] #{:<6} {:>5.1} km/h  soc {:>5.1}%  {:>5.1} °C  gps {:.5},{:.5}{stale}",
        s.seq, s.speed, s.battery_soc, s.cabin_temp, s.gps.latitude, s.gps.longitude,
    );
}

async fn send(url: &str, json: &str, timeout: Duration) -> Result<(), CliError> {
    // Fail locally on anything the server would reject as malformed.
    let envelope = CommandEnvelope::parse(json)?;
    let action = envelope.clone().into_command()?.action();

    let (ws, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| CliError::Timeout(timeout.as_millis() as u64))?
        .map_err(|e| EvError::Transport(format!("connect to {url}: {e}")))?;
    let (mut write, mut read) = ws.split();

    write
        .send(Message::Text(json.to_string().into()))
        .await
        .map_err(|e| EvError::Transport(e.to_string()))?;

    let reply = tokio::time::timeout(timeout, async {
        while let Some(frame) = read.next().await {
            let Ok(Message::Text(text)) = frame else {
                continue;
            };
            match ServerMessage::from_json(text.as_str()) {
                Ok(msg @ ServerMessage::Response { .. }) | Ok(msg @ ServerMessage::Error { .. }) => {
                    return Some(msg);
                }
                _ => {}
            }
        }
        None
    })
    .await
    .map_err(|_| CliError::Timeout(timeout.as_millis() as u64))?
    .ok_or_else(|| EvError::Transport("server closed before responding".to_string()))?;

    let _ = write.send(Message::Close(None)).await;

    match &reply {
        ServerMessage::Response { status, .. } if *status == evdash_types::ResponseStatus::Success => {
            println!("  {} {action}", "✓".green().bold());
        }
        ServerMessage::Response { reason, .. } => {
            println!("  {} {action}: {}", "✗".red().bold(), reason.as_deref().unwrap_or("rejected"));
        }
        _ => {}
    }
    println!("{}", reply.to_json().map_err(EvError::from)?);
    Ok(())
}

fn print_banner() {
    println!();
    println!("{}", r#"                 __         __  "#.bold().cyan());
    println!("{}", r#"  ___ _  __ ____/ /__ ____ / /  "#.bold().cyan());
    println!("{}", r#" / -_) |/ // _  / _ `(_-</ _ \ "#.bold().cyan());
    println!("{}", r#" \__/|___/ \_,_/\_,_/___/_//_/ "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "evdash".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  EV telemetry and command backend");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_send_with_global_config() {
        let cli = Cli::try_parse_from([
            "evdash",
            "send",
            r#"{"action":"play_music"}"#,
            "--url",
            "ws://127.0.0.1:9000",
            "--config",
            "/tmp/evdash.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/evdash.toml")));
        let Command::Send { json, url, timeout_ms } = cli.command else {
            panic!("expected send");
        };
        assert_eq!(json, r#"{"action":"play_music"}"#);
        assert_eq!(url.as_deref(), Some("ws://127.0.0.1:9000"));
        assert_eq!(timeout_ms, 5000);
    }

    #[tokio::test]
    async fn send_rejects_unknown_action_locally() {
        let err = send("ws://127.0.0.1:1", r#"{"action":"open_trunk"}"#, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CliError::Command(CommandError::UnknownAction(_))));
    }

    #[tokio::test]
    async fn send_round_trip_against_live_server() {
        let cancel = CancellationToken::new();
        let mut cfg = Config::default();
        cfg.server.host = "127.0.0.1".to_string();
        cfg.server.port = 0;
        let (aggregator, handle, bus) = StateAggregator::new(
            SimRegistry::full().build(),
            cfg.settings.clone(),
            cfg.aggregator_config(),
        );
        tokio::spawn(aggregator.run(cancel.clone()));
        let bound = BroadcastServer::new(
            cfg.server_config(),
            bus,
            CommandDispatcher::new(CommandValidator::standard(), handle),
            SnapshotHistory::default(),
        )
        .bind()
        .await
        .unwrap();
        let url = format!("ws://{}", bound.local_addr());
        tokio::spawn(bound.run(cancel.clone()));

        send(&url, r#"{"action":"set_brightness","value":70}"#, Duration::from_secs(2))
            .await
            .unwrap();
        cancel.cancel();
    }
}
