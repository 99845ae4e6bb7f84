//! droidlink - drive a device scripting agent from the command line
//!
//! # Usage
//!
//! ```bash
//! # Call a method and print the result as JSON
//! droidlink call getBuildVersion
//! droidlink call makeToast '"hello"'
//!
//! # Print events as JSON lines until Ctrl+C
//! droidlink events --pattern '^Battery'
//!
//! # Show the effective configuration
//! droidlink config
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use droidlink_client::config::default_config_path;
use droidlink_client::{AdbBridge, Session, SessionConfig};
use regex::Regex;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// droidlink - host-side client for device scripting agents
#[derive(Parser, Debug)]
#[command(name = "droidlink", version, about)]
struct Args {
    /// Configuration file (default: $DROIDLINK_CONFIG or the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Device serial (default: $ANDROID_SERIAL)
    #[arg(short, long, global = true)]
    serial: Option<String>,

    /// Port the agent listens on, on the device
    #[arg(long, global = true)]
    device_port: Option<u16>,

    /// Host port to forward from
    #[arg(long, global = true)]
    host_port: Option<u16>,

    /// Agent package to install if missing
    #[arg(long, global = true)]
    apk: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Call a method on the agent
    Call {
        /// Method name
        method: String,
        /// Parameters; each is parsed as JSON, or passed as a string
        params: Vec<String>,
    },
    /// Print events as JSON lines
    Events {
        /// Only events whose name matches this pattern
        #[arg(short, long, default_value = ".*")]
        pattern: String,
        /// Stop after this many events
        #[arg(short = 'n', long)]
        count: Option<usize>,
        /// Stop after this many seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Print the effective configuration
    Config,
}

impl Args {
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = SessionConfig::discover(self.config.as_deref())
            .context("Failed to load configuration")?;

        if let Some(serial) = &self.serial {
            config.serial = Some(serial.clone());
        }
        if let Some(port) = self.device_port {
            config.device_port = port;
        }
        if let Some(port) = self.host_port {
            config.host_port = Some(port);
        }
        if let Some(apk) = &self.apk {
            config.agent_apk = Some(apk.clone());
        }
        Ok(config.apply_env())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("droidlink=info".parse()?)
                .add_directive("droidlink_client=info".parse()?),
        )
        .init();

    let config = args.session_config()?;

    if let Command::Config = args.command {
        if let Some(path) = default_config_path() {
            println!("# default path: {}", path.display());
        }
        let text = toml::to_string_pretty(&config).context("Failed to render configuration")?;
        print!("{text}");
        return Ok(());
    }

    let bridge = AdbBridge::from_config(&config);
    let session = Session::start(config, std::sync::Arc::new(bridge))
        .await
        .context("Failed to start agent session")?;

    let result = match &args.command {
        Command::Call { method, params } => run_call(&session, method, params).await,
        Command::Events {
            pattern,
            count,
            timeout,
        } => run_events(&session, pattern, *count, timeout.map(Duration::from_secs)).await,
        Command::Config => Ok(()),
    };

    session.close().await;
    result
}

async fn run_call(session: &Session, method: &str, params: &[String]) -> Result<()> {
    let params: Vec<Value> = params.iter().map(String::as_str).map(parse_param).collect();

    let result = session
        .call(method, params)
        .await
        .with_context(|| format!("{method} failed"))?;

    match result {
        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        None => println!("null"),
    }
    Ok(())
}

async fn run_events(
    session: &Session,
    pattern: &str,
    count: Option<usize>,
    timeout: Option<Duration>,
) -> Result<()> {
    let pattern = Regex::new(pattern).with_context(|| format!("Invalid pattern {pattern:?}"))?;
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut printed = 0usize;

    info!(pattern = %pattern, "Waiting for events");

    loop {
        let wait = match deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::from_secs(1),
        };

        let events = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            events = session.events().pop_events(&pattern, wait) => events,
        };

        let events = match events {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "Event queue closed");
                break;
            }
        };

        for event in events {
            println!("{}", serde_json::to_string(&event)?);
            printed += 1;
            if count.is_some_and(|n| printed >= n) {
                return Ok(());
            }
        }

        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
    }

    Ok(())
}

/// Parses a command line parameter as JSON, falling back to a plain string.
fn parse_param(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
