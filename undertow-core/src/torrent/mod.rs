//! BitTorrent peer-protocol client: wire codec, exchanges and peer racing

pub mod availability;
pub mod bencode;
pub mod downloader;
pub mod extension;
pub mod fetch;
pub mod info;
pub mod metadata;
pub mod protocol;
pub mod race;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

pub use availability::{AvailabilitySource, PieceAvailability, wait_for_availability};
pub use bencode::{BencodeError, Decoded, Dict, Value};
pub use downloader::{
    BlockRequestWindow, PieceBuffer, PieceDownload, PieceDownloadOptions, RejectPolicy,
    download_piece, piece_size_for,
};
pub use extension::{ExtendedHandshakeInfo, negotiate_extensions};
pub use fetch::{MetadataFetch, PieceFetch, PieceTarget};
pub use info::{TorrentFile, TorrentInfo};
pub use metadata::{MetadataAssembly, fetch_metadata_from_peer};
pub use protocol::{
    Frame, PeerConnection, PeerHandshake, PeerId, PeerMessage, PeerTransport, connect_peer,
    perform_handshake,
};
pub use race::first_success;

/// SHA-1 hash identifying a unique swarm.
///
/// 20-byte SHA-1 hash of the info dictionary. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Parses a 40-character hex string.
    ///
    /// # Errors
    /// - `TorrentError::InvalidRequest` - Wrong length or non-hex characters
    pub fn from_hex(hex_str: &str) -> Result<Self, TorrentError> {
        let mut hash = [0u8; 20];
        hex::decode_to_slice(hex_str, &mut hash).map_err(|e| TorrentError::InvalidRequest {
            reason: format!("Invalid info hash '{hex_str}': {e}"),
        })?;
        Ok(Self(hash))
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index for slice addressing.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of a candidate peer as supplied by the tracker layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub ip: IpAddr,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl FromStr for PeerAddress {
    type Err = TorrentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(Self::from)
            .map_err(|e| TorrentError::InvalidRequest {
                reason: format!("Invalid peer address '{s}': {e}"),
            })
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Removes duplicate addresses, keeping the first occurrence of each.
pub fn dedup_peers(peers: &[PeerAddress]) -> Vec<PeerAddress> {
    let mut seen = std::collections::HashSet::with_capacity(peers.len());
    peers
        .iter()
        .copied()
        .filter(|peer| seen.insert(*peer))
        .collect()
}

/// Errors that can occur while talking to a single peer.
///
/// Every variant is recoverable at the swarm level: the peer race converts
/// them into "this peer failed" and moves on to the next candidate.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Failed to connect to {address}: {reason}")]
    ConnectFailure { address: PeerAddress, reason: String },

    #[error("Timed out during {operation}")]
    Timeout { operation: String },

    #[error("Peer closed the connection")]
    UnexpectedEof,

    #[error("Protocol mismatch: {reason}")]
    ProtocolMismatch { reason: String },

    #[error("Malformed encoding: {reason}")]
    MalformedEncoding { reason: String },

    #[error("Declared size {declared} outside accepted bound 1..={limit}")]
    ResourceBound { declared: i64, limit: u32 },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Invalid torrent info: {reason}")]
    InvalidTorrentInfo { reason: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl From<BencodeError> for TorrentError {
    fn from(error: BencodeError) -> Self {
        TorrentError::MalformedEncoding {
            reason: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn test_info_hash_display() {
        let hash = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ];
        let info_hash = InfoHash::new(hash);
        assert_eq!(
            info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn test_info_hash_from_hex() {
        let info_hash = InfoHash::from_hex("7B973E55B2198EAC530440DC7D9589DD708F5692").unwrap();
        assert_eq!(info_hash.as_bytes()[0], 0x7b);
        assert_eq!(info_hash.as_bytes()[19], 0x92);
        assert_eq!(
            info_hash.to_string(),
            "7b973e55b2198eac530440dc7d9589dd708f5692"
        );

        assert!(InfoHash::from_hex("7B973E55").is_err());
        assert!(InfoHash::from_hex("zz973e55b2198eac530440dc7d9589dd708f5692").is_err());
    }

    #[test]
    fn test_piece_index_ordering() {
        let piece1 = PieceIndex::new(5);
        let piece2 = PieceIndex::new(10);
        assert!(piece1 < piece2);
        assert_eq!(piece1.as_u32(), 5);
        assert_eq!(piece2.to_string(), "10");
    }

    #[test]
    fn test_peer_address_parsing() {
        let peer: PeerAddress = "10.0.0.7:6881".parse().unwrap();
        assert_eq!(peer.ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(peer.port, 6881);
        assert_eq!(peer.to_string(), "10.0.0.7:6881");

        let v6: PeerAddress = "[::1]:51413".parse().unwrap();
        assert_eq!(v6.port, 51413);

        assert!("not-an-address".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn test_dedup_peers_keeps_first_occurrence() {
        let a: PeerAddress = "1.1.1.1:1".parse().unwrap();
        let b: PeerAddress = "2.2.2.2:2".parse().unwrap();
        let c: PeerAddress = "1.1.1.1:2".parse().unwrap();

        let peers = dedup_peers(&[a, b, a, c, b]);
        assert_eq!(peers, vec![a, b, c]);
    }
}
