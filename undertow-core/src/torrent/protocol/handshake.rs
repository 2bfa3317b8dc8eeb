//! BitTorrent handshake serialization and exchange

use std::time::Duration;

use super::types::{HANDSHAKE_LEN, PROTOCOL_NAME, PeerHandshake, PeerId};
use super::wire::{PeerConnection, PeerTransport};
use crate::torrent::{InfoHash, TorrentError};

const RESERVED_OFFSET: usize = 20;
const INFO_HASH_OFFSET: usize = 28;
const PEER_ID_OFFSET: usize = 48;

/// Handshake serialization utilities for BitTorrent wire protocol.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Serializes handshake message following BEP 3
    pub fn serialize_handshake(handshake: &PeerHandshake) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HANDSHAKE_LEN);

        buf.push(handshake.protocol.len() as u8);
        buf.extend_from_slice(handshake.protocol.as_bytes());
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(handshake.info_hash.as_bytes());
        buf.extend_from_slice(handshake.peer_id.as_bytes());

        buf
    }

    /// Deserializes a 68-byte handshake following BEP 3
    ///
    /// # Errors
    /// - `TorrentError::ProtocolMismatch` - Wrong length or protocol string
    pub fn deserialize_handshake(data: &[u8]) -> Result<PeerHandshake, TorrentError> {
        if data.len() != HANDSHAKE_LEN {
            return Err(TorrentError::ProtocolMismatch {
                reason: format!("handshake is {} bytes, expected {HANDSHAKE_LEN}", data.len()),
            });
        }

        let protocol_len = data[0] as usize;
        let protocol = &data[1..RESERVED_OFFSET];
        if protocol_len != PROTOCOL_NAME.len() || protocol != PROTOCOL_NAME.as_bytes() {
            return Err(TorrentError::ProtocolMismatch {
                reason: format!(
                    "unexpected protocol '{}'",
                    String::from_utf8_lossy(protocol)
                ),
            });
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[RESERVED_OFFSET..INFO_HASH_OFFSET]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[INFO_HASH_OFFSET..PEER_ID_OFFSET]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[PEER_ID_OFFSET..HANDSHAKE_LEN]);

        Ok(PeerHandshake {
            protocol: PROTOCOL_NAME.to_string(),
            reserved,
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::new(peer_id),
        })
    }
}

/// Sends our handshake and reads the peer's reply within `timeout`.
///
/// Returns `Ok(None)` when the reply names a different info hash: many peers
/// accept any handshake and echo an unrelated swarm, which disqualifies the
/// peer without being a protocol violation.
///
/// # Errors
/// - `TorrentError::Timeout` - No complete reply before the deadline
/// - `TorrentError::UnexpectedEof` - Peer closed the connection
/// - `TorrentError::ProtocolMismatch` - Reply is not a BitTorrent handshake
pub async fn perform_handshake<S: PeerTransport>(
    conn: &mut PeerConnection<S>,
    info_hash: InfoHash,
    peer_id: PeerId,
    timeout: Duration,
) -> Result<Option<PeerHandshake>, TorrentError> {
    let ours = PeerHandshake::new(info_hash, peer_id);
    conn.write_all(&HandshakeCodec::serialize_handshake(&ours))
        .await?;

    let reply = conn.read_exact_within(HANDSHAKE_LEN, timeout).await?;
    if reply[INFO_HASH_OFFSET..PEER_ID_OFFSET] != info_hash.as_bytes()[..] {
        tracing::debug!(
            peer = ?conn.peer_address(),
            "handshake info hash mismatch, expected {info_hash}"
        );
        return Ok(None);
    }

    HandshakeCodec::deserialize_handshake(&reply).map(Some)
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::*;

    fn reply_bytes(info_hash: [u8; 20], reserved: [u8; 8]) -> Vec<u8> {
        let handshake = PeerHandshake {
            protocol: PROTOCOL_NAME.to_string(),
            reserved,
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::new([9u8; 20]),
        };
        HandshakeCodec::serialize_handshake(&handshake)
    }

    #[test]
    fn test_handshake_layout() {
        let handshake = PeerHandshake::new(InfoHash::new([0xAA; 20]), PeerId::new([0xBB; 20]));
        let bytes = HandshakeCodec::serialize_handshake(&handshake);

        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0, 0, 0, 0, 0, 0x10, 0, 0]);
        assert_eq!(&bytes[28..48], &[0xAA; 20]);
        assert_eq!(&bytes[48..68], &[0xBB; 20]);
    }

    #[test]
    fn test_deserialize_rejects_foreign_protocol() {
        let mut bytes = reply_bytes([1; 20], [0; 8]);
        bytes[1] = b'b';
        assert!(matches!(
            HandshakeCodec::deserialize_handshake(&bytes),
            Err(TorrentError::ProtocolMismatch { .. })
        ));
        assert!(HandshakeCodec::deserialize_handshake(&bytes[..67]).is_err());
    }

    #[tokio::test]
    async fn test_perform_handshake_accepts_matching_hash() {
        let (client, mut remote) = duplex(256);
        let mut conn = PeerConnection::new(client);
        let info_hash = InfoHash::new([7; 20]);

        let mut reserved = [0u8; 8];
        reserved[5] = 0x10;
        remote.write_all(&reply_bytes([7; 20], reserved)).await.unwrap();

        let handshake = perform_handshake(
            &mut conn,
            info_hash,
            PeerId::new([1; 20]),
            Duration::from_secs(1),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(handshake.supports_extensions());
        assert_eq!(handshake.peer_id, PeerId::new([9; 20]));

        let mut sent = [0u8; 68];
        remote.read_exact(&mut sent).await.unwrap();
        assert_eq!(&sent[28..48], &[7; 20]);
    }

    #[tokio::test]
    async fn test_single_byte_hash_difference_disqualifies() {
        let (client, mut remote) = duplex(256);
        let mut conn = PeerConnection::new(client);

        let mut echoed = [7u8; 20];
        echoed[19] = 8;
        remote.write_all(&reply_bytes(echoed, [0; 8])).await.unwrap();

        let result = perform_handshake(
            &mut conn,
            InfoHash::new([7; 20]),
            PeerId::new([1; 20]),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (client, _remote) = duplex(256);
        let mut conn = PeerConnection::new(client);

        let result = perform_handshake(
            &mut conn,
            InfoHash::new([7; 20]),
            PeerId::new([1; 20]),
            Duration::from_secs(4),
        )
        .await;
        assert!(matches!(result, Err(TorrentError::Timeout { .. })));
    }
}
