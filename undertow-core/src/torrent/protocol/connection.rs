//! TCP connection establishment

use std::time::Duration;

use tokio::net::TcpStream;

use super::wire::PeerConnection;
use crate::torrent::{PeerAddress, TorrentError};

/// Opens a TCP connection to `address`, giving up after `connect_timeout`.
///
/// # Errors
/// - `TorrentError::ConnectFailure` - Connection refused or unreachable
/// - `TorrentError::Timeout` - No connection within `connect_timeout`
pub async fn connect_peer(
    address: PeerAddress,
    connect_timeout: Duration,
) -> Result<PeerConnection<TcpStream>, TorrentError> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address.socket_addr()))
        .await
        .map_err(|_| TorrentError::Timeout {
            operation: format!("connect to {address}"),
        })?
        .map_err(|e| TorrentError::ConnectFailure {
            address,
            reason: e.to_string(),
        })?;

    if let Err(e) = stream.set_nodelay(true) {
        tracing::trace!(peer = %address, "failed to set TCP_NODELAY: {e}");
    }

    Ok(PeerConnection::new(stream).with_address(address))
}
