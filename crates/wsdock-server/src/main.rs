//! wsdock: standalone host for the embeddable WebSocket server.
//!
//! Starts a [`ServerEngine`], prints the URL peers should connect to, then
//! prints every connection-status change and received message as one JSON
//! object per line on stdout.  With `--echo` each received message is sent
//! back to its session.  Ctrl+C stops the server cleanly.
//!
//! # Usage
//!
//! ```text
//! wsdock [OPTIONS]
//!
//! Options:
//!   --host <IP>              Bind address [default: the machine's LAN address]
//!   --port <PORT>            Candidate port, repeatable [default: 1024, 2048]
//!   --max-frame-size <BYTES> Largest accepted frame/message [default: 2097152]
//!   --tls-p12 <PATH>         PKCS#12 bundle to serve wss:// with
//!   --tls-passphrase <PASS>  Passphrase for the bundle
//!   --config <PATH>          TOML settings file
//!   --echo                   Send every received message back
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable                | Flag               |
//! |-------------------------|--------------------|
//! | `WSDOCK_HOST`           | `--host`           |
//! | `WSDOCK_PORTS`          | `--port` (`a,b,c`) |
//! | `WSDOCK_MAX_FRAME_SIZE` | `--max-frame-size` |
//! | `WSDOCK_TLS_P12`        | `--tls-p12`        |
//! | `WSDOCK_TLS_PASSPHRASE` | `--tls-passphrase` |
//! | `WSDOCK_CONFIG`         | `--config`         |
//! | `WSDOCK_ECHO`           | `--echo`           |
//!
//! Precedence: command line, then environment, then the settings file, then
//! built-in defaults.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wsdock_server::domain::{ServerConfig, TlsMode};
use wsdock_server::infrastructure::{ServerEngine, Settings};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Embeddable WebSocket server, run standalone.
#[derive(Debug, Parser)]
#[command(name = "wsdock", version, about, long_about = None)]
struct Cli {
    /// Address to bind; defaults to the machine's LAN address.
    #[arg(long, env = "WSDOCK_HOST")]
    host: Option<IpAddr>,

    /// Candidate port, tried in order on "address in use".  Repeatable.
    #[arg(long = "port", env = "WSDOCK_PORTS", value_delimiter = ',')]
    ports: Vec<u16>,

    /// Largest accepted frame and reassembled message, in bytes.
    #[arg(long, env = "WSDOCK_MAX_FRAME_SIZE")]
    max_frame_size: Option<usize>,

    /// PKCS#12 bundle to terminate TLS with.
    #[arg(long, env = "WSDOCK_TLS_P12")]
    tls_p12: Option<PathBuf>,

    /// Passphrase for the PKCS#12 bundle.
    #[arg(long, env = "WSDOCK_TLS_PASSPHRASE", hide_env_values = true)]
    tls_passphrase: Option<String>,

    /// TOML settings file.
    #[arg(long, env = "WSDOCK_CONFIG")]
    config: Option<PathBuf>,

    /// Echo every received message back to its sender.
    #[arg(long, env = "WSDOCK_ECHO")]
    echo: bool,
}

impl Cli {
    /// Reads the settings file named by `--config`, or defaults.
    fn load_settings(&self) -> anyhow::Result<Settings> {
        match &self.config {
            Some(path) => Settings::load(path)
                .with_context(|| format!("failed to load settings from {}", path.display())),
            None => Ok(Settings::default()),
        }
    }

    /// Layers the command-line values over `settings`.
    fn server_config(&self, settings: &Settings) -> ServerConfig {
        let mut config = settings.to_server_config();
        if let Some(host) = self.host {
            config.host = Some(host);
        }
        if !self.ports.is_empty() {
            config.ports = self.ports.clone();
        }
        if let Some(max) = self.max_frame_size {
            config.max_frame_size = max;
        }

        if let Some(path) = &self.tls_p12 {
            config.tls = TlsMode::Pkcs12File {
                path: path.clone(),
                passphrase: self
                    .tls_passphrase
                    .clone()
                    .unwrap_or_else(|| settings.tls.passphrase.clone()),
            };
        } else if let Some(overridden) = &self.tls_passphrase {
            match &mut config.tls {
                TlsMode::Pkcs12File { passphrase, .. }
                | TlsMode::Pkcs12Bytes { passphrase, .. }
                | TlsMode::Embedded { passphrase, .. } => *passphrase = overridden.clone(),
                TlsMode::None => {}
            }
        }
        config
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;

    // `RUST_LOG` wins; otherwise the settings file's level; otherwise `info`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&settings.logging.level))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = cli.server_config(&settings);
    let tls_requested = config.tls.is_requested();

    let engine = ServerEngine::new();
    let addr = engine
        .start(config)
        .await
        .context("failed to start the WebSocket server")?;

    if tls_requested && !engine.is_secure().await {
        warn!("TLS was requested but could not be enabled; serving plaintext");
    }
    info!("wsdock listening on {addr}");
    if let Some(url) = engine.current_url().await {
        println!("{url}");
    }

    let status_task = tokio::spawn(print_json_lines(
        engine.notifications().subscribe_status(),
        |_| {},
    ));
    let echo_engine = engine.clone();
    let echo = cli.echo;
    let message_task = tokio::spawn(print_json_lines(
        engine.notifications().subscribe_messages(),
        move |message| {
            if echo {
                echo_engine.send_text(&message.session_id, message.content.clone());
            }
        },
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("received Ctrl+C, stopping");

    let stopped = engine.stop().await;
    status_task.abort();
    message_task.abort();
    stopped.context("failed to stop the WebSocket server cleanly")?;

    info!("wsdock stopped");
    Ok(())
}

/// Prints each item from `rx` as a JSON line and hands it to `then`.
async fn print_json_lines<T, F>(mut rx: broadcast::Receiver<T>, then: F)
where
    T: Clone + Serialize,
    F: Fn(&T),
{
    loop {
        match rx.recv().await {
            Ok(item) => {
                match serde_json::to_string(&item) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!("failed to serialise notification: {e}"),
                }
                then(&item);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("output fell behind; skipped {skipped} notification(s)");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("wsdock").chain(args.iter().copied()))
    }

    #[test]
    fn test_cli_defaults_match_server_config_default() {
        // Arrange
        let cli = parse(&[]);

        // Act
        let config = cli.server_config(&Settings::default());

        // Assert
        assert_eq!(config, ServerConfig::default());
        assert!(!cli.echo);
    }

    #[test]
    fn test_repeated_port_flags_keep_order() {
        let cli = parse(&["--port", "9000", "--port", "8000"]);
        let config = cli.server_config(&Settings::default());
        assert_eq!(config.ports, vec![9000, 8000]);
    }

    #[test]
    fn test_comma_separated_ports() {
        let cli = parse(&["--port", "7000,7001"]);
        assert_eq!(cli.ports, vec![7000, 7001]);
    }

    #[test]
    fn test_host_and_frame_size_override() {
        let cli = parse(&["--host", "127.0.0.1", "--max-frame-size", "4096"]);
        let config = cli.server_config(&Settings::default());
        assert_eq!(config.host, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(config.max_frame_size, 4096);
    }

    #[test]
    fn test_invalid_host_is_rejected() {
        let result = Cli::try_parse_from(["wsdock", "--host", "not.an.ip"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_tls_flags_build_pkcs12_file_mode() {
        let cli = parse(&["--tls-p12", "server.p12", "--tls-passphrase", "pw"]);
        let config = cli.server_config(&Settings::default());
        assert_eq!(
            config.tls,
            TlsMode::Pkcs12File {
                path: PathBuf::from("server.p12"),
                passphrase: "pw".to_string()
            }
        );
    }

    #[test]
    fn test_cli_overrides_settings_file() {
        let settings = Settings::from_toml_str(
            "[server]\nports = [5000]\nmax_frame_size = 100\n[tls]\np12_path = \"file.p12\"\npassphrase = \"from-file\"\n",
        )
        .unwrap();
        let cli = parse(&["--port", "6000", "--tls-passphrase", "from-cli"]);

        let config = cli.server_config(&settings);

        assert_eq!(config.ports, vec![6000]);
        assert_eq!(config.max_frame_size, 100);
        assert_eq!(
            config.tls,
            TlsMode::Pkcs12File {
                path: PathBuf::from("file.p12"),
                passphrase: "from-cli".to_string()
            }
        );
    }

    #[test]
    fn test_echo_flag() {
        assert!(parse(&["--echo"]).echo);
    }
}
