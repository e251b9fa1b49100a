//! Sandbox lifecycle: one remote sandbox and every local artifact it owns.

use crate::api::{ControlPlane, HttpControlPlane, ResourceHandle, ResourceKind};
use crate::config::{ClientConfig, SandboxConfig};
use crate::error::{CoreError, OperationError, Result};
use crate::events::OperationEvent;
use crate::heartbeat::HeartbeatScheduler;
use crate::monitor::OperationMonitor;
use crate::ssh_config::SshConfigStore;
use crate::tunnel::{TunnelId, TunnelManager, TunnelTarget};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Current state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// Not created yet.
    Requested,
    /// Create accepted, waiting for the environment to come up.
    Provisioning,
    /// Up, nothing attached.
    Ready,
    /// At least one tunnel open.
    InUse,
    /// Every tunnel closed again.
    Idle,
    /// Teardown in progress.
    Closing,
    /// Torn down.
    Closed,
    /// Create or provisioning failed.
    Failed,
}

impl SandboxState {
    fn is_usable(self) -> bool {
        matches!(self, Self::Ready | Self::InUse | Self::Idle)
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Requested => "Requested",
            Self::Provisioning => "Provisioning",
            Self::Ready => "Ready",
            Self::InUse => "InUse",
            Self::Idle => "Idle",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Shared services every sandbox of one client uses.
#[derive(Clone)]
pub struct SandboxServices {
    /// Control plane client.
    pub api: Arc<dyn ControlPlane>,
    /// Operation monitor.
    pub monitor: Arc<OperationMonitor>,
    /// Keep-alive timers.
    pub heartbeats: Arc<HeartbeatScheduler>,
    /// Tunnel processes.
    pub tunnels: Arc<TunnelManager>,
    /// Shared SSH config.
    pub ssh: Arc<SshConfigStore>,
    /// Directory for per-sandbox private SSH config files.
    pub private_config_dir: PathBuf,
}

impl SandboxServices {
    /// Bundle services around `api` with default heartbeat period.
    pub fn new(
        api: Arc<dyn ControlPlane>,
        tunnels: Arc<TunnelManager>,
        ssh: Arc<SshConfigStore>,
        private_config_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            monitor: Arc::new(OperationMonitor::new(Arc::clone(&api))),
            heartbeats: Arc::new(HeartbeatScheduler::new(Arc::clone(&api))),
            api,
            tunnels,
            ssh,
            private_config_dir: private_config_dir.into(),
        }
    }

    /// Replace the heartbeat scheduler with one using `period`.
    pub fn with_heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeats = Arc::new(HeartbeatScheduler::with_period(
            Arc::clone(&self.api),
            period,
        ));
        self
    }

    /// Build the HTTP-backed services described by `config`.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let api: Arc<dyn ControlPlane> = Arc::new(HttpControlPlane::from_config(config)?);
        Ok(Self::new(
            api,
            Arc::new(TunnelManager::from_config(config)),
            Arc::new(SshConfigStore::shared(&config.ssh_config_path)),
            &config.private_config_dir,
        )
        .with_heartbeat_period(config.heartbeat_interval))
    }
}

/// How to register a sandbox with the SSH client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSetup {
    /// Preferred host alias; `-1`, `-2`, ... are appended when taken.
    pub base_hostname: String,
    /// Login user.
    pub user: String,
    /// `HostName` directive.
    pub host_name: String,
    /// `Port` directive.
    pub port: Option<u16>,
    /// `ProxyCommand` directive.
    pub proxy_command: Option<String>,
    /// `IdentityFile` directive. A setup with one is always written to the
    /// private file.
    pub identity_file: Option<PathBuf>,
    /// Write to a per-sandbox private file instead of the shared config.
    pub private: bool,
}

impl SshSetup {
    /// Setup for `user@127.0.0.1` under the alias `base_hostname`.
    pub fn new(base_hostname: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            base_hostname: base_hostname.into(),
            user: user.into(),
            host_name: "127.0.0.1".to_string(),
            port: None,
            proxy_command: None,
            identity_file: None,
            private: false,
        }
    }

    /// Set `HostName`.
    pub fn host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = host_name.into();
        self
    }

    /// Set `Port`, usually the local end of an SSH tunnel.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set `ProxyCommand`.
    pub fn proxy_command(mut self, command: impl Into<String>) -> Self {
        self.proxy_command = Some(command.into());
        self
    }

    /// Set `IdentityFile`. Implies [`SshSetup::private`].
    pub fn identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Write into a private 0600 file.
    pub fn private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    /// Whether this setup goes to the 0600 per-sandbox file.
    pub fn uses_private_file(&self) -> bool {
        self.private || self.identity_file.is_some()
    }

    fn directives(&self) -> Vec<(&'static str, String)> {
        let mut directives = vec![
            ("HostName", self.host_name.clone()),
            ("User", self.user.clone()),
        ];
        if let Some(port) = self.port {
            directives.push(("Port", port.to_string()));
        }
        if let Some(command) = &self.proxy_command {
            directives.push(("ProxyCommand", command.clone()));
        }
        if let Some(identity) = &self.identity_file {
            directives.push(("IdentityFile", identity.display().to_string()));
        }
        directives.push(("StrictHostKeyChecking", "no".to_string()));
        directives.push(("UserKnownHostsFile", "/dev/null".to_string()));
        directives
    }
}

/// The SSH host block a sandbox manages.
struct ManagedHost {
    hostname: String,
    store: Arc<SshConfigStore>,
}

/// Failures collected while tearing a sandbox down.
#[derive(Debug, Default)]
pub struct CloseReport {
    /// Resource that was closed, if it was ever created.
    pub resource_id: Option<String>,
    /// Every cleanup step that failed, in order.
    pub errors: Vec<CoreError>,
}

impl CloseReport {
    /// Whether every cleanup step succeeded.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// One remote sandbox and its local artifacts.
///
/// A lifecycle owns its resource handle, its tunnel ids and its SSH host
/// alias. Shared services are passed in; nothing is registered globally.
pub struct SandboxLifecycle {
    services: SandboxServices,
    state: SandboxState,
    handle: Option<ResourceHandle>,
    tunnels: Vec<TunnelId>,
    ssh_host: Option<ManagedHost>,
}

impl SandboxLifecycle {
    /// Create a lifecycle in the `Requested` state.
    pub fn new(services: SandboxServices) -> Self {
        Self {
            services,
            state: SandboxState::Requested,
            handle: None,
            tunnels: Vec::new(),
            ssh_host: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// Handle of the sandbox, once created.
    pub fn handle(&self) -> Option<&ResourceHandle> {
        self.handle.as_ref()
    }

    /// Server-assigned resource id, once created.
    pub fn resource_id(&self) -> Option<&str> {
        self.handle.as_ref().map(|h| h.resource_id.as_str())
    }

    /// Tunnels opened by this sandbox that are still running.
    pub fn tunnel_ids(&self) -> &[TunnelId] {
        &self.tunnels
    }

    /// SSH host alias managed by this sandbox.
    pub fn ssh_host(&self) -> Option<&str> {
        self.ssh_host.as_ref().map(|h| h.hostname.as_str())
    }

    /// Request a new sandbox and start its heartbeat.
    pub async fn create(&mut self, config: &SandboxConfig) -> Result<&ResourceHandle> {
        self.ensure_state(&[SandboxState::Requested])?;
        config.validate()?;

        let start = std::time::Instant::now();
        tracing::info!(
            template = %config.template,
            cpu_count = config.cpu_count,
            memory_mib = config.memory_mib,
            "Creating sandbox"
        );

        let accepted = match self.services.api.create_sandbox(config).await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!(error = %e, "Sandbox create call failed");
                self.state = SandboxState::Failed;
                return Err(e);
            }
        };
        let handle = ResourceHandle::new(accepted, ResourceKind::Sandbox);
        tracing::info!(
            resource_id = %handle.resource_id,
            correlation_id = %handle.correlation_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox accepted"
        );

        self.services.heartbeats.start(&handle.resource_id).await;
        self.state = SandboxState::Provisioning;
        Ok(&*self.handle.insert(handle))
    }

    /// Wait for provisioning to finish.
    pub async fn wait_ready(&mut self, timeout: Duration, cancel: &CancellationToken) -> Result<()> {
        self.wait_ready_with_progress(timeout, cancel, |_| {}).await
    }

    /// Wait for provisioning to finish, reporting every event to `on_event`.
    ///
    /// A cancelled wait leaves the sandbox in `Provisioning`; any other
    /// failure marks it `Failed` and stops its heartbeat.
    pub async fn wait_ready_with_progress<F>(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
        on_event: F,
    ) -> Result<()>
    where
        F: FnMut(&OperationEvent) + Send,
    {
        self.ensure_state(&[SandboxState::Provisioning])?;
        let (resource_id, correlation_id) = match &self.handle {
            Some(h) => (h.resource_id.clone(), h.correlation_id.clone()),
            None => return Err(self.invalid_state("a created sandbox")),
        };

        let start = std::time::Instant::now();
        tracing::debug!(resource_id = %resource_id, timeout_secs = timeout.as_secs_f64(), "Waiting for sandbox");

        match self
            .services
            .monitor
            .wait_with_callback(&correlation_id, timeout, cancel, on_event)
            .await
        {
            Ok(()) => {
                self.state = SandboxState::Ready;
                tracing::info!(
                    resource_id = %resource_id,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Sandbox ready"
                );
                Ok(())
            }
            Err(OperationError::Cancelled) => {
                tracing::debug!(resource_id = %resource_id, "Wait for sandbox cancelled");
                Err(OperationError::Cancelled.into())
            }
            Err(e) => {
                tracing::error!(resource_id = %resource_id, error = %e, "Sandbox failed to become ready");
                self.state = SandboxState::Failed;
                self.services.heartbeats.stop(&resource_id).await;
                Err(e.into())
            }
        }
    }

    /// Register the sandbox as an SSH host. Returns the chosen alias.
    pub async fn setup_ssh(&mut self, setup: &SshSetup) -> Result<String> {
        self.ensure_usable()?;
        if let Some(host) = &self.ssh_host {
            return Err(CoreError::InvalidState {
                expected: "no SSH host".into(),
                actual: format!("SSH host {}", host.hostname),
            });
        }
        let resource_id = self.require_resource_id()?;

        let store = if setup.uses_private_file() {
            Arc::new(SshConfigStore::private(
                self.services
                    .private_config_dir
                    .join(format!("{resource_id}.conf")),
            ))
        } else {
            Arc::clone(&self.services.ssh)
        };

        let hostname = store
            .append_unique(&setup.base_hostname, &setup.directives())
            .await?;
        tracing::info!(
            resource_id = %resource_id,
            host = %hostname,
            path = %store.path().display(),
            "SSH host configured"
        );
        self.ssh_host = Some(ManagedHost {
            hostname: hostname.clone(),
            store,
        });
        Ok(hostname)
    }

    /// Change the login user of the managed SSH host.
    pub async fn update_ssh_user(&self, user: &str) -> Result<()> {
        let host = self
            .ssh_host
            .as_ref()
            .ok_or_else(|| self.invalid_state("a configured SSH host"))?;
        host.store
            .update_directive(&host.hostname, "User", user)
            .await
    }

    /// Open a tunnel to `remote_port`. Returns the tunnel id and local port.
    pub async fn open_tunnel(&mut self, remote_port: u16, local_port: u16) -> Result<(TunnelId, u16)> {
        self.ensure_usable()?;
        let target = match &self.handle {
            Some(h) => TunnelTarget {
                resource_id: h.resource_id.clone(),
                public_id: h.public_id.clone(),
            },
            None => return Err(self.invalid_state("a created sandbox")),
        };

        let (id, port) = self
            .services
            .tunnels
            .start(&target, remote_port, local_port)
            .await?;
        self.tunnels.push(id);
        self.state = SandboxState::InUse;
        Ok((id, port))
    }

    /// Close a tunnel opened by this sandbox.
    pub async fn close_tunnel(&mut self, id: TunnelId) -> Result<()> {
        let index = self
            .tunnels
            .iter()
            .position(|t| *t == id)
            .ok_or(CoreError::TunnelNotFound(id))?;
        self.tunnels.remove(index);
        self.services.tunnels.stop(id).await?;

        if self.tunnels.is_empty() && self.state == SandboxState::InUse {
            self.state = SandboxState::Idle;
        }
        Ok(())
    }

    /// Snapshot the sandbox and wait for the snapshot to complete.
    pub async fn snapshot(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ResourceHandle> {
        self.ensure_usable()?;
        let resource_id = self.require_resource_id()?;

        tracing::info!(resource_id = %resource_id, name = %name, "Creating snapshot");
        let accepted = self.services.api.create_snapshot(resource_id, name).await?;
        let handle = ResourceHandle::new(accepted, ResourceKind::Snapshot);

        let outcome = self
            .services
            .monitor
            .wait(&handle.correlation_id, timeout, cancel)
            .await;
        self.services.monitor.forget(&handle.correlation_id).await;
        outcome?;
        tracing::info!(
            resource_id = %resource_id,
            snapshot_id = %handle.resource_id,
            "Snapshot created"
        );
        Ok(handle)
    }

    /// Tear the sandbox down.
    ///
    /// Stops the heartbeat and owned tunnels, removes the SSH host and
    /// deletes the remote resource. Every step runs even if an earlier one
    /// fails; the state always ends `Closed`.
    pub async fn close(&mut self) -> CloseReport {
        let mut report = CloseReport {
            resource_id: self.resource_id().map(str::to_string),
            errors: Vec::new(),
        };
        if self.state == SandboxState::Closed {
            return report;
        }

        let start = std::time::Instant::now();
        let resource_id = report.resource_id.clone().unwrap_or_default();
        tracing::info!(resource_id = %resource_id, state = %self.state, "Closing sandbox");
        self.state = SandboxState::Closing;

        if let Some(handle) = &self.handle {
            self.services.heartbeats.stop(&handle.resource_id).await;
        }

        for id in std::mem::take(&mut self.tunnels) {
            match self.services.tunnels.stop(id).await {
                Ok(()) | Err(CoreError::TunnelNotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(resource_id = %resource_id, tunnel_id = id, error = %e, "Failed to stop tunnel");
                    report.errors.push(e);
                }
            }
        }

        if let Some(host) = self.ssh_host.take() {
            match host.store.remove(&host.hostname).await {
                Ok(()) => {}
                Err(CoreError::HostNotFound(_)) => {
                    tracing::debug!(host = %host.hostname, "SSH host already removed");
                }
                Err(e) => {
                    tracing::warn!(resource_id = %resource_id, host = %host.hostname, error = %e, "Failed to remove SSH host");
                    report.errors.push(e);
                }
            }
        }

        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.services.api.delete_sandbox(&handle.resource_id).await {
                tracing::warn!(resource_id = %resource_id, error = %e, "Failed to delete sandbox");
                report.errors.push(e);
            }
            self.services.monitor.forget(&handle.correlation_id).await;
        }

        self.state = SandboxState::Closed;
        tracing::info!(
            resource_id = %resource_id,
            errors = report.errors.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox closed"
        );
        report
    }

    fn ensure_state(&self, allowed: &[SandboxState]) -> Result<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        let expected = allowed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("|");
        Err(self.invalid_state(&expected))
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.state.is_usable() {
            return Ok(());
        }
        Err(self.invalid_state("Ready|InUse|Idle"))
    }

    fn require_resource_id(&self) -> Result<&str> {
        self.resource_id()
            .ok_or_else(|| self.invalid_state("a created sandbox"))
    }

    fn invalid_state(&self, expected: &str) -> CoreError {
        CoreError::InvalidState {
            expected: expected.to_string(),
            actual: self.state.to_string(),
        }
    }
}

impl Drop for SandboxLifecycle {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            tracing::warn!(
                resource_id = %handle.resource_id,
                state = %self.state,
                "Sandbox dropped without close(); remote resource left running"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(SandboxState::Requested.to_string(), "Requested");
        assert_eq!(SandboxState::InUse.to_string(), "InUse");
        assert_eq!(SandboxState::Closed.to_string(), "Closed");
    }

    #[test]
    fn test_usable_states() {
        assert!(SandboxState::Ready.is_usable());
        assert!(SandboxState::InUse.is_usable());
        assert!(SandboxState::Idle.is_usable());
        assert!(!SandboxState::Provisioning.is_usable());
        assert!(!SandboxState::Failed.is_usable());
    }

    #[test]
    fn test_ssh_directives_order() {
        let setup = SshSetup::new("sandbox", "root")
            .port(2222)
            .identity_file("/keys/id");
        let keys: Vec<&str> = setup.directives().iter().map(|(k, _)| *k).collect();
        assert_eq!(
            keys,
            vec![
                "HostName",
                "User",
                "Port",
                "IdentityFile",
                "StrictHostKeyChecking",
                "UserKnownHostsFile"
            ]
        );
    }

    #[test]
    fn test_identity_file_forces_private_file() {
        assert!(!SshSetup::new("sandbox", "root").uses_private_file());
        assert!(SshSetup::new("sandbox", "root").private(true).uses_private_file());
        assert!(SshSetup::new("sandbox", "root")
            .identity_file("/keys/id")
            .uses_private_file());
    }

    #[test]
    fn test_close_report_clean() {
        let mut report = CloseReport::default();
        assert!(report.is_clean());
        report.errors.push(CoreError::HostNotFound("x".into()));
        assert!(!report.is_clean());
    }
}
