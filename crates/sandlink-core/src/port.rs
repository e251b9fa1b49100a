//! Local port allocation for tunnels.

use crate::error::Result;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;

/// Pick a free loopback TCP port, preferring `preferred`.
///
/// `preferred == 0` means any port. If the preferred port cannot be bound
/// the OS assigns one instead; that fallback is not an error.
///
/// The probe listener is closed before returning, so the port is free but
/// not reserved.
pub async fn allocate(preferred: u16) -> Result<u16> {
    if preferred != 0 {
        match TcpListener::bind(loopback(preferred)).await {
            Ok(listener) => {
                let port = listener.local_addr()?.port();
                tracing::trace!(port, "Preferred port available");
                return Ok(port);
            }
            Err(e) => {
                tracing::debug!(preferred, error = %e, "Preferred port unavailable, using ephemeral port");
            }
        }
    }

    let listener = TcpListener::bind(loopback(0)).await?;
    let port = listener.local_addr()?.port();
    tracing::trace!(port, "Allocated ephemeral port");
    Ok(port)
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}
