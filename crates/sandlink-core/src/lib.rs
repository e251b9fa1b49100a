//! # sandlink-core
//!
//! Client-side orchestration for ephemeral remote sandboxes.
//!
//! The sandbox service answers mutating calls right away with a correlation
//! id and reports the actual outcome on a server-sent event stream. This
//! crate turns that into a local lifecycle: it waits on the stream, keeps the
//! sandbox alive with heartbeats, bridges local ports through a tunnel
//! process and registers the sandbox as an SSH host.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  sandlink-core (client)                  │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌──────────────────┐    ┌───────────────────────────┐   │
//! │  │ SandboxLifecycle │───▶│ OperationMonitor          │   │
//! │  │  - create()      │    │  correlation id ─▶ result │   │
//! │  │  - wait_ready()  │    └───────────────────────────┘   │
//! │  │  - open_tunnel() │    ┌───────────────────────────┐   │
//! │  │  - setup_ssh()   │───▶│ HeartbeatScheduler        │   │
//! │  │  - close()       │    │  one timer per resource   │   │
//! │  └──────────────────┘    └───────────────────────────┘   │
//! │      │          │        ┌───────────────────────────┐   │
//! │      │          └───────▶│ TunnelManager             │   │
//! │      │                   │  child process per tunnel │   │
//! │      │                   └───────────────────────────┘   │
//! │      │                   ┌───────────────────────────┐   │
//! │      └──────────────────▶│ SshConfigStore            │   │
//! │                          │  ~/.ssh/config host blocks│   │
//! │                          └───────────────────────────┘   │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//!            │ HTTPS + SSE                │ tunnel binary
//!            ▼                            ▼
//! ┌────────────────────────┐   ┌────────────────────────────┐
//! │   sandbox REST API     │   │      tunnel proxy          │
//! └────────────────────────┘   └────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use sandlink_core::{ClientConfig, SandboxConfig, SandboxLifecycle, SandboxServices, SshSetup};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> sandlink_core::Result<()> {
//! let config = ClientConfig::from_env();
//! let services = SandboxServices::from_config(&config)?;
//!
//! let mut sandbox = SandboxLifecycle::new(services);
//! sandbox
//!     .create(&SandboxConfig::builder().template("ubuntu-24.04").build()?)
//!     .await?;
//! sandbox
//!     .wait_ready_with_progress(config.ready_timeout, &CancellationToken::new(), |event| {
//!         if let Some(message) = &event.message {
//!             println!("{message}");
//!         }
//!     })
//!     .await?;
//!
//! let (_, ssh_port) = sandbox.open_tunnel(22, 0).await?;
//! let host = sandbox
//!     .setup_ssh(&SshSetup::new("sandbox", "root").port(ssh_port))
//!     .await?;
//! println!("ssh {host}");
//!
//! let report = sandbox.close().await;
//! assert!(report.is_clean());
//! # Ok(())
//! # }
//! ```

mod api;
mod binary_finder;
mod config;
mod error;
mod events;
mod heartbeat;
mod lifecycle;
mod monitor;
mod port;
mod ssh_config;
mod tunnel;

pub use api::{AcceptedOperation, ControlPlane, HttpControlPlane, ResourceHandle, ResourceKind};
pub use binary_finder::TunnelBinaryFinder;
pub use config::{
    ClientConfig, SandboxConfig, SandboxConfigBuilder, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_READY_TIMEOUT, DEFAULT_TUNNEL_BINARY,
};
pub use error::{CoreError, OperationError, Result};
pub use events::{decode_event_stream, EventKind, EventStream, OperationEvent, SseDecoder, Step};
pub use heartbeat::HeartbeatScheduler;
pub use lifecycle::{CloseReport, SandboxLifecycle, SandboxServices, SandboxState, SshSetup};
pub use monitor::OperationMonitor;
pub use port::allocate as allocate_port;
pub use ssh_config::{HostBlock, SshConfigDocument, SshConfigStore};
pub use tunnel::{TunnelId, TunnelInfo, TunnelManager, TunnelSettings, TunnelTarget};
