//! Device bridge: the `adb` commands a session needs.
//!
//! The session only talks to the device through [`DeviceBridge`], so tests
//! can substitute a recording fake for the real [`AdbBridge`].
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Command failures are returned as `ClientError::Bridge`

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::config::SessionConfig;
use crate::error::{ClientError, Result};

/// Operations against one attached device.
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    /// Runs a device shell command and returns its standard output.
    async fn shell(&self, command: &str) -> Result<String>;

    /// Forwards `host_port` on the host to `device_port` on the device.
    async fn forward(&self, host_port: u16, device_port: u16) -> Result<()>;

    /// Removes the forward for `host_port`.
    async fn remove_forward(&self, host_port: u16) -> Result<()>;

    /// Installs (or reinstalls) a package file.
    async fn install(&self, package: &Path) -> Result<()>;
}

/// [`DeviceBridge`] backed by the `adb` executable.
#[derive(Debug, Clone)]
pub struct AdbBridge {
    adb_path: PathBuf,
    serial: Option<String>,
}

impl AdbBridge {
    /// Creates a bridge for `serial` (or the only attached device).
    pub fn new(adb_path: impl Into<PathBuf>, serial: Option<String>) -> Self {
        Self {
            adb_path: adb_path.into(),
            serial,
        }
    }

    /// Creates a bridge from session configuration.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.adb_path.clone(), config.serial.clone())
    }

    /// Returns the device serial this bridge targets, if pinned.
    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    /// Builds the full argument list, including `-s <serial>`.
    fn full_args(&self, args: &[&str]) -> Vec<String> {
        let mut full = Vec::with_capacity(args.len() + 2);
        if let Some(serial) = &self.serial {
            full.push("-s".to_string());
            full.push(serial.clone());
        }
        full.extend(args.iter().map(|a| a.to_string()));
        full
    }

    /// Runs `adb` with `args` and returns stdout on success.
    async fn run(&self, args: &[&str]) -> Result<String> {
        let full = self.full_args(args);
        debug!(adb = %self.adb_path.display(), args = ?full, "Running adb");

        let output = Command::new(&self.adb_path)
            .args(&full)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                ClientError::Bridge(format!("failed to run {}: {e}", self.adb_path.display()))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        trace!(status = ?output.status, stdout = %stdout.trim(), "adb finished");

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClientError::Bridge(format!(
                "adb {} failed ({}): {}",
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }

        Ok(stdout)
    }
}

#[async_trait]
impl DeviceBridge for AdbBridge {
    async fn shell(&self, command: &str) -> Result<String> {
        self.run(&["shell", command]).await
    }

    async fn forward(&self, host_port: u16, device_port: u16) -> Result<()> {
        let local = format!("tcp:{host_port}");
        let remote = format!("tcp:{device_port}");
        self.run(&["forward", &local, &remote]).await.map(|_| ())
    }

    async fn remove_forward(&self, host_port: u16) -> Result<()> {
        let local = format!("tcp:{host_port}");
        self.run(&["forward", "--remove", &local]).await.map(|_| ())
    }

    async fn install(&self, package: &Path) -> Result<()> {
        let path = package.to_string_lossy();
        self.run(&["install", "-r", "-g", &path]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_args_with_serial() {
        let bridge = AdbBridge::new("adb", Some("emulator-5554".to_string()));
        assert_eq!(
            bridge.full_args(&["shell", "true"]),
            vec!["-s", "emulator-5554", "shell", "true"]
        );
        assert_eq!(bridge.serial(), Some("emulator-5554"));
    }

    #[test]
    fn test_full_args_without_serial() {
        let bridge = AdbBridge::new("adb", None);
        assert_eq!(bridge.full_args(&["forward", "--list"]), vec!["forward", "--list"]);
    }

    #[tokio::test]
    async fn test_missing_adb_binary() {
        let bridge = AdbBridge::new("/nonexistent/adb", None);
        let err = bridge.shell("true").await.unwrap_err();
        assert!(matches!(err, ClientError::Bridge(_)));
    }
}
