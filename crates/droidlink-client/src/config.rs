//! Session configuration.
//!
//! Settings come from three layers, later ones winning:
//! 1. [`SessionConfig::default`]
//! 2. A TOML file (`$DROIDLINK_CONFIG`, or `<config dir>/droidlink/config.toml`)
//! 3. Environment (`ANDROID_SERIAL`) and command-line flags applied by the binary
//!
//! # Example
//!
//! ```toml
//! serial = "emulator-5554"
//! device_port = 8080
//! agent_apk = "/opt/agents/sl4a.apk"
//!
//! [connect]
//! max_attempts = 10
//! ```

use std::env;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ClientError, Result};

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV: &str = "DROIDLINK_CONFIG";

/// Environment variable selecting the target device, as `adb` itself uses.
pub const SERIAL_ENV: &str = "ANDROID_SERIAL";

/// Default device-side port the agent listens on.
pub const DEFAULT_DEVICE_PORT: u16 = 8080;

// ============================================================================
// Connect Policy
// ============================================================================

/// Retry policy for opening the transport socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectPolicy {
    /// Delay before the second attempt, in milliseconds.
    pub initial_delay_ms: u64,

    /// Upper bound on the delay between attempts, in milliseconds.
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry).
    pub multiplier: f64,

    /// Attempts before giving up with a connection error.
    pub max_attempts: u32,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
            multiplier: 2.0,
            max_attempts: 8,
        }
    }
}

impl ConnectPolicy {
    /// Delay before the first retry.
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Computes the delay following `delay`, capped at `max_delay_ms`.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        let next_ms = (delay.as_millis() as f64 * self.multiplier) as u64;
        Duration::from_millis(next_ms).min(Duration::from_millis(self.max_delay_ms))
    }
}

// ============================================================================
// Agent Commands
// ============================================================================

/// Device shell commands used to manage the agent process.
///
/// `{port}` in `launch` is replaced with the device port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCommands {
    /// Android package name of the agent.
    pub package: String,

    /// Starts the agent's listener.
    pub launch: String,

    /// Prints something non-empty when the agent process is alive.
    pub probe: String,

    /// Probe for shells lacking the primary probe's tool.
    pub probe_fallback: String,

    /// Stops the agent.
    pub stop: String,
}

impl Default for AgentCommands {
    fn default() -> Self {
        let package = "com.googlecode.android_scripting".to_string();
        Self {
            launch: format!(
                "am start -a {package}.action.LAUNCH_SERVER \
                 --ei {package}.extra.USE_SERVICE_PORT {{port}} \
                 {package}/.activity.ScriptingLayerServiceLauncher"
            ),
            probe: format!("pidof {package}"),
            probe_fallback: format!("ps | grep {package}"),
            stop: format!("am force-stop {package}"),
            package,
        }
    }
}

impl AgentCommands {
    /// Returns the launch command targeting `device_port`.
    pub fn launch_command(&self, device_port: u16) -> String {
        self.launch.replace("{port}", &device_port.to_string())
    }

    /// Returns the command that prints the installed package path.
    pub fn installed_check(&self) -> String {
        format!("pm path {}", self.package)
    }
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for one agent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Device serial; `None` lets `adb` pick the only attached device.
    pub serial: Option<String>,

    /// Path or name of the `adb` executable.
    pub adb_path: PathBuf,

    /// Port the agent listens on, on the device.
    pub device_port: u16,

    /// Host port to forward from; `None` picks a free ephemeral port.
    pub host_port: Option<u16>,

    /// Host address the forwarded port is bound to.
    pub host_address: IpAddr,

    /// Agent package to install when it is missing.
    pub agent_apk: Option<PathBuf>,

    /// Settle delay between launch and liveness probe, in milliseconds.
    pub launch_settle_ms: u64,

    /// Server-side timeout passed to each `eventWait` long-poll, in milliseconds.
    pub event_poll_timeout_ms: u64,

    /// Pause after a failed poll before polling again, in milliseconds.
    pub poll_error_backoff_ms: u64,

    /// Socket retry policy.
    pub connect: ConnectPolicy,

    /// Agent management commands.
    pub commands: AgentCommands,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            serial: None,
            adb_path: PathBuf::from("adb"),
            device_port: DEFAULT_DEVICE_PORT,
            host_port: None,
            host_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            agent_apk: None,
            launch_settle_ms: 1_000,
            event_poll_timeout_ms: 60_000,
            poll_error_backoff_ms: 500,
            connect: ConnectPolicy::default(),
            commands: AgentCommands::default(),
        }
    }
}

impl SessionConfig {
    /// Parses a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ClientError::Config(e.to_string()))
    }

    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// - `ClientError::Io` if the file cannot be read
    /// - `ClientError::Config` if it is not valid configuration TOML
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_toml(&text)
    }

    /// Loads `explicit` if given, else `$DROIDLINK_CONFIG`, else the default
    /// file when it exists, else the built-in defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Ok(path) = env::var(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Applies `ANDROID_SERIAL` when no serial was configured.
    pub fn apply_env(mut self) -> Self {
        if self.serial.is_none() {
            self.serial = env::var(SERIAL_ENV).ok().filter(|s| !s.is_empty());
        }
        self
    }

    /// Settle delay after launching the agent.
    pub fn launch_settle(&self) -> Duration {
        Duration::from_millis(self.launch_settle_ms)
    }

    /// Pause after a failed event poll.
    pub fn poll_error_backoff(&self) -> Duration {
        Duration::from_millis(self.poll_error_backoff_ms)
    }
}

/// Returns `<config dir>/droidlink/config.toml`, if the platform has one.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("droidlink").join("config.toml"))
}
