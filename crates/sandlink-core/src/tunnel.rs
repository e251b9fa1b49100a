//! Local ↔ remote port bridges backed by an external tunnel executable.
//!
//! Each tunnel is one child process forwarding `127.0.0.1:<local_port>`
//! through the proxy to `<remote_port>` inside a sandbox. The table owned by
//! [`TunnelManager`] is the single source of truth for running tunnels.

use crate::binary_finder::TunnelBinaryFinder;
use crate::config::{ClientConfig, DEFAULT_TUNNEL_BINARY};
use crate::error::{CoreError, Result};
use crate::port;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Locally generated tunnel identifier, monotonic per manager.
pub type TunnelId = u64;

/// How long a stopped tunnel gets to exit before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// How long a new tunnel is watched for an early exit.
const STARTUP_CHECK: Duration = Duration::from_millis(200);

/// Sandbox a tunnel points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    /// Resource id owning the tunnel.
    pub resource_id: String,
    /// Public id used in the proxy credential.
    pub public_id: String,
}

/// Proxy settings passed to every tunnel process.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Executable name to search for.
    pub binary_name: String,
    /// Proxy server address.
    pub proxy_addr: String,
    /// Fixed token of the one-time credential.
    pub token: String,
    /// Skip TLS verification for the proxy.
    pub insecure: bool,
}

impl TunnelSettings {
    /// Settings derived from client configuration.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            binary_name: DEFAULT_TUNNEL_BINARY.to_string(),
            proxy_addr: config.proxy_addr.clone(),
            token: config.proxy_token.clone(),
            insecure: config.tunnel_insecure(),
        }
    }

    /// Command-line arguments for one tunnel.
    pub fn args(&self, target: &TunnelTarget, remote_port: u16, local_port: u16) -> Vec<String> {
        let mut args = vec![
            "client".to_string(),
            "--server".to_string(),
            self.proxy_addr.clone(),
            "--credential".to_string(),
            format!("{}@{}:{}", target.public_id, remote_port, self.token),
            "--local".to_string(),
            format!("127.0.0.1:{local_port}"),
        ];
        if self.insecure {
            args.push("--insecure".to_string());
        }
        args
    }
}

/// Public view of a running tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    /// Tunnel id.
    pub id: TunnelId,
    /// Resource the tunnel belongs to.
    pub resource_id: String,
    /// Local loopback port.
    pub local_port: u16,
    /// Port inside the sandbox.
    pub remote_port: u16,
    /// OS process id of the tunnel process.
    pub pid: Option<u32>,
    /// When the process was spawned.
    pub started_at: DateTime<Utc>,
}

struct Tunnel {
    info: TunnelInfo,
    child: Child,
}

/// Owns every tunnel process of this client.
pub struct TunnelManager {
    settings: TunnelSettings,
    finder: TunnelBinaryFinder,
    next_id: AtomicU64,
    tunnels: Mutex<HashMap<TunnelId, Tunnel>>,
    grace: Duration,
    startup_check: Duration,
}

impl TunnelManager {
    /// Create a manager with explicit settings and finder.
    pub fn new(settings: TunnelSettings, finder: TunnelBinaryFinder) -> Self {
        Self {
            settings,
            finder,
            next_id: AtomicU64::new(1),
            tunnels: Mutex::new(HashMap::new()),
            grace: TERMINATE_GRACE,
            startup_check: STARTUP_CHECK,
        }
    }

    /// Time a stopped tunnel gets after SIGTERM before it is killed (default 5s).
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Time a new tunnel is watched for an early exit (default 200ms).
    ///
    /// A process that fails later than this is only noticed when it is
    /// stopped.
    pub fn with_startup_check(mut self, window: Duration) -> Self {
        self.startup_check = window;
        self
    }

    /// Create a manager from client configuration using the standard search.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            TunnelSettings::from_config(config),
            TunnelBinaryFinder::standard(config.tunnel_binary.clone()),
        )
    }

    /// Start a tunnel to `remote_port` of `target`.
    ///
    /// `local_port == 0` picks any free port; a busy preferred port falls
    /// back to a free one. Returns the tunnel id and the bound local port.
    pub async fn start(
        &self,
        target: &TunnelTarget,
        remote_port: u16,
        local_port: u16,
    ) -> Result<(TunnelId, u16)> {
        let binary = self.finder.find(&self.settings.binary_name)?;
        let local_port = port::allocate(local_port).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            tunnel_id = id,
            resource_id = %target.resource_id,
            local_port,
            remote_port,
            "Starting tunnel"
        );

        let mut child = Command::new(&binary)
            .args(self.settings.args(target, remote_port, local_port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                tracing::error!(binary = %binary.display(), error = %e, "Failed to spawn tunnel");
                CoreError::Io(e)
            })?;

        if let Ok(status) = tokio::time::timeout(self.startup_check, child.wait()).await {
            let status = status?;
            let stderr = read_stderr(&mut child).await;
            tracing::error!(tunnel_id = id, %status, stderr = %stderr, "Tunnel exited during startup");
            let mut message = format!("{} exited with {status}", binary.display());
            if !stderr.is_empty() {
                message.push_str(": ");
                message.push_str(&stderr);
            }
            return Err(CoreError::TunnelExited(message));
        }

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(tunnel_id = id, "{}", line);
                }
            });
        }

        let info = TunnelInfo {
            id,
            resource_id: target.resource_id.clone(),
            local_port,
            remote_port,
            pid: child.id(),
            started_at: Utc::now(),
        };
        self.tunnels.lock().await.insert(id, Tunnel { info, child });
        Ok((id, local_port))
    }

    /// Stop a tunnel.
    ///
    /// The process is signalled and reaped in the background; this returns
    /// without waiting for it to exit. Stopping an unknown id is an error.
    pub async fn stop(&self, id: TunnelId) -> Result<()> {
        let tunnel = self
            .tunnels
            .lock()
            .await
            .remove(&id)
            .ok_or(CoreError::TunnelNotFound(id))?;

        tracing::info!(
            tunnel_id = id,
            resource_id = %tunnel.info.resource_id,
            local_port = tunnel.info.local_port,
            "Stopping tunnel"
        );
        tokio::spawn(terminate(id, tunnel.child, self.grace));
        Ok(())
    }

    /// Stop every tunnel belonging to `resource_id`. Returns how many stopped.
    pub async fn stop_resource(&self, resource_id: &str) -> usize {
        let ids: Vec<TunnelId> = self
            .tunnels
            .lock()
            .await
            .values()
            .filter(|t| t.info.resource_id == resource_id)
            .map(|t| t.info.id)
            .collect();

        let mut stopped = 0;
        for id in ids {
            if self.stop(id).await.is_ok() {
                stopped += 1;
            }
        }
        stopped
    }

    /// Running tunnels ordered by id.
    pub async fn list(&self) -> Vec<TunnelInfo> {
        let mut tunnels: Vec<TunnelInfo> = self
            .tunnels
            .lock()
            .await
            .values()
            .map(|t| t.info.clone())
            .collect();
        tunnels.sort_by_key(|t| t.id);
        tunnels
    }

    /// Look up one tunnel.
    pub async fn get(&self, id: TunnelId) -> Option<TunnelInfo> {
        self.tunnels.lock().await.get(&id).map(|t| t.info.clone())
    }
}

/// Whatever an exited tunnel wrote to stderr, trimmed.
async fn read_stderr(child: &mut Child) -> String {
    use tokio::io::AsyncReadExt;

    let Some(mut stderr) = child.stderr.take() else {
        return String::new();
    };
    let mut text = String::new();
    let _ = tokio::time::timeout(Duration::from_millis(100), stderr.read_to_string(&mut text)).await;
    text.trim().to_string()
}

/// Ask the process to exit, escalating to a kill after the grace period.
async fn terminate(id: TunnelId, mut child: Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(tunnel_id = id, pid, error = %e, "SIGTERM failed");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(tunnel_id = id, %status, "Tunnel process exited");
        }
        Ok(Err(e)) => {
            tracing::warn!(tunnel_id = id, error = %e, "Failed to reap tunnel process");
        }
        Err(_) => {
            tracing::warn!(tunnel_id = id, "Tunnel ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                tracing::warn!(tunnel_id = id, error = %e, "Failed to kill tunnel process");
            }
        }
    }
}
