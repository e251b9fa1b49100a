//! Client and sandbox configuration.
//!
//! [`ClientConfig`] is loaded from environment variables with sensible
//! defaults. [`SandboxConfig`] describes one sandbox to create and is built
//! through a validating builder.

use crate::error::CoreError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default heartbeat period.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default time to wait for a sandbox to become ready.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(300);

/// Default name of the external tunnel executable.
pub const DEFAULT_TUNNEL_BINARY: &str = "sandlink-tunnel";

/// Configuration shared by every sandbox of one client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the sandbox REST API.
    pub api_url: String,

    /// Bearer token for the REST API.
    pub api_key: Option<String>,

    /// Period between keep-alive calls (default: 30s).
    pub heartbeat_interval: Duration,

    /// Default wait for provisioning (default: 300s).
    pub ready_timeout: Duration,

    /// Address of the tunnel proxy server.
    pub proxy_addr: String,

    /// Fixed token appended to one-time tunnel credentials.
    pub proxy_token: String,

    /// Skip TLS verification when talking to the proxy.
    pub proxy_insecure: bool,

    /// Explicit tunnel executable, bypassing the search.
    pub tunnel_binary: Option<PathBuf>,

    /// Shared SSH client config file.
    pub ssh_config_path: PathBuf,

    /// Directory for per-sandbox private SSH config files.
    pub private_config_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            api_url: "https://api.sandlink.dev/v1".to_string(),
            api_key: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            proxy_addr: "wss://proxy.sandlink.dev:443".to_string(),
            proxy_token: "sandlink".to_string(),
            proxy_insecure: false,
            tunnel_binary: None,
            ssh_config_path: home.join(".ssh").join("config"),
            private_config_dir: home.join(".sandlink").join("ssh"),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `SANDLINK_API_URL` | `https://api.sandlink.dev/v1` |
    /// | `SANDLINK_API_KEY` | unset |
    /// | `SANDLINK_HEARTBEAT_SECS` | `30` |
    /// | `SANDLINK_READY_TIMEOUT_SECS` | `300` |
    /// | `SANDLINK_PROXY_ADDR` | `wss://proxy.sandlink.dev:443` |
    /// | `SANDLINK_PROXY_TOKEN` | `sandlink` |
    /// | `SANDLINK_PROXY_INSECURE` | `false` |
    /// | `SANDLINK_TUNNEL_BINARY` | unset (search) |
    /// | `SANDLINK_SSH_CONFIG` | `~/.ssh/config` |
    /// | `SANDLINK_PRIVATE_CONFIG_DIR` | `~/.sandlink/ssh` |
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            api_url: std::env::var("SANDLINK_API_URL").unwrap_or(default.api_url),
            api_key: std::env::var("SANDLINK_API_KEY")
                .ok()
                .filter(|v| !v.is_empty()),
            heartbeat_interval: std::env::var("SANDLINK_HEARTBEAT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.heartbeat_interval),
            ready_timeout: std::env::var("SANDLINK_READY_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.ready_timeout),
            proxy_addr: std::env::var("SANDLINK_PROXY_ADDR").unwrap_or(default.proxy_addr),
            proxy_token: std::env::var("SANDLINK_PROXY_TOKEN").unwrap_or(default.proxy_token),
            proxy_insecure: std::env::var("SANDLINK_PROXY_INSECURE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(default.proxy_insecure),
            tunnel_binary: std::env::var("SANDLINK_TUNNEL_BINARY")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            ssh_config_path: std::env::var("SANDLINK_SSH_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(default.ssh_config_path),
            private_config_dir: std::env::var("SANDLINK_PRIVATE_CONFIG_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.private_config_dir),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(CoreError::InvalidConfig(format!(
                "api_url must be an http(s) URL: {}",
                self.api_url
            )));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(CoreError::InvalidConfig(
                "heartbeat_interval must be > 0".into(),
            ));
        }
        if self.proxy_addr.is_empty() {
            return Err(CoreError::InvalidConfig("proxy_addr is required".into()));
        }
        Ok(())
    }

    /// Whether the tunnel must skip TLS verification for the proxy.
    ///
    /// Plain-text proxies have no certificate to verify.
    pub fn tunnel_insecure(&self) -> bool {
        self.proxy_insecure
            || self.proxy_addr.starts_with("http://")
            || self.proxy_addr.starts_with("ws://")
    }
}

/// Configuration for creating a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxConfig {
    /// Template or image to boot from.
    pub template: String,
    /// vCPU count (default: 2).
    pub cpu_count: u8,
    /// Memory in MiB (default: 2048).
    pub memory_mib: u32,
    /// Server-side idle lifetime in seconds, refreshed by heartbeats.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    /// Environment variables set inside the sandbox.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Free-form labels.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            template: String::new(),
            cpu_count: 2,
            memory_mib: 2048,
            ttl_secs: None,
            env: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }
}

impl SandboxConfig {
    /// Create a new config builder.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.template.trim().is_empty() {
            return Err(CoreError::InvalidConfig("template is required".into()));
        }
        if self.cpu_count == 0 {
            return Err(CoreError::InvalidConfig("cpu_count must be > 0".into()));
        }
        if self.memory_mib == 0 {
            return Err(CoreError::InvalidConfig("memory_mib must be > 0".into()));
        }
        if self.ttl_secs == Some(0) {
            return Err(CoreError::InvalidConfig("ttl_secs must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for SandboxConfig.
#[derive(Debug, Default)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    /// Set the template.
    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.config.template = template.into();
        self
    }

    /// Set vCPU count.
    pub fn cpu_count(mut self, count: u8) -> Self {
        self.config.cpu_count = count;
        self
    }

    /// Set memory in MiB.
    pub fn memory_mib(mut self, mib: u32) -> Self {
        self.config.memory_mib = mib;
        self
    }

    /// Set the idle lifetime.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.config.ttl_secs = Some(ttl.as_secs());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    /// Add a metadata label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.metadata.insert(key.into(), value.into());
        self
    }

    /// Build the configuration, validating all required fields.
    pub fn build(self) -> Result<SandboxConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.cpu_count, 2);
        assert_eq!(config.memory_mib, 2048);
        assert!(config.ttl_secs.is_none());
    }

    #[test]
    fn test_builder_validation_missing_template() {
        let result = SandboxConfig::builder().memory_mib(512).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_validation_zero_cpu() {
        let result = SandboxConfig::builder().template("python").cpu_count(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_success() {
        let config = SandboxConfig::builder()
            .template("python-3.12")
            .cpu_count(4)
            .memory_mib(4096)
            .ttl(Duration::from_secs(600))
            .env("RUST_LOG", "debug")
            .build()
            .expect("should build successfully");

        assert_eq!(config.template, "python-3.12");
        assert_eq!(config.cpu_count, 4);
        assert_eq!(config.memory_mib, 4096);
        assert_eq!(config.ttl_secs, Some(600));
        assert_eq!(config.env.get("RUST_LOG").map(String::as_str), Some("debug"));
    }

    #[test]
    fn test_sandbox_config_serializes_without_empty_fields() {
        let config = SandboxConfig::builder().template("node").build().unwrap();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["template"], "node");
        assert!(json.get("ttl_secs").is_none());
        assert!(json.get("env").is_none());
    }

    #[test]
    fn test_client_defaults_validate() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert!(config.ssh_config_path.ends_with(".ssh/config"));
        assert!(!config.tunnel_insecure());
    }

    #[test]
    fn test_client_rejects_bad_url() {
        let config = ClientConfig {
            api_url: "ftp://example.com".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_plaintext_proxy_is_insecure() {
        let config = ClientConfig {
            proxy_addr: "ws://127.0.0.1:9000".into(),
            ..Default::default()
        };
        assert!(config.tunnel_insecure());
    }

    #[test]
    fn test_from_env_uses_defaults() {
        std::env::remove_var("SANDLINK_API_URL");
        std::env::remove_var("SANDLINK_HEARTBEAT_SECS");
        std::env::remove_var("SANDLINK_PROXY_ADDR");
        std::env::remove_var("SANDLINK_SSH_CONFIG");

        let config = ClientConfig::from_env();
        let default = ClientConfig::default();

        assert_eq!(config.api_url, default.api_url);
        assert_eq!(config.heartbeat_interval, default.heartbeat_interval);
        assert_eq!(config.proxy_addr, default.proxy_addr);
        assert_eq!(config.ssh_config_path, default.ssh_config_path);
    }
}
