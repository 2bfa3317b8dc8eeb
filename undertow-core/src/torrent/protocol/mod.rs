//! BitTorrent wire protocol abstractions and message types.
//!
//! BitTorrent peer-to-peer protocol implementation following BEP 3, plus the
//! BEP 6 availability messages and the BEP 10 extended message envelope.
//! Connections are generic over any byte stream so tests can substitute an
//! in-memory transport for TCP.

pub mod connection;
pub mod handshake;
pub mod messages;
pub mod types;
pub mod wire;

// Re-export public API
pub use connection::connect_peer;
pub use handshake::{HandshakeCodec, perform_handshake};
pub use messages::MessageCodec;
pub use types::{Frame, PeerHandshake, PeerId, PeerMessage, message_id};
pub use wire::{MAX_FRAME_LEN, PeerConnection, PeerTransport};

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::torrent::{InfoHash, PieceIndex};

    #[test]
    fn test_peer_id_generation() {
        let peer_id = PeerId::generate("-UW0001-");
        let bytes = peer_id.as_bytes();

        assert_eq!(&bytes[..8], b"-UW0001-");
        assert!(bytes[8..].iter().all(u8::is_ascii_uppercase));

        let peer_id2 = PeerId::generate("-UW0001-");
        assert_ne!(peer_id.as_bytes(), peer_id2.as_bytes());
    }

    #[test]
    fn test_peer_handshake_creation() {
        let info_hash = InfoHash::new([1u8; 20]);
        let peer_id = PeerId::new([2u8; 20]);

        let handshake = PeerHandshake::new(info_hash, peer_id);

        assert_eq!(handshake.protocol, "BitTorrent protocol");
        assert_eq!(handshake.info_hash, info_hash);
        assert_eq!(handshake.peer_id, peer_id);
        assert!(handshake.supports_extensions());
    }

    #[test]
    fn test_handshake_serialization() {
        let info_hash = InfoHash::new([1u8; 20]);
        let peer_id = PeerId::new([2u8; 20]);
        let handshake = PeerHandshake::new(info_hash, peer_id);

        let serialized = HandshakeCodec::serialize_handshake(&handshake);
        let deserialized = HandshakeCodec::deserialize_handshake(&serialized).unwrap();

        assert_eq!(handshake, deserialized);
    }

    #[tokio::test]
    async fn test_messages_survive_the_wire() {
        let test_cases = vec![
            PeerMessage::KeepAlive,
            PeerMessage::Choke,
            PeerMessage::Unchoke,
            PeerMessage::Interested,
            PeerMessage::NotInterested,
            PeerMessage::Have {
                piece_index: PieceIndex::new(42),
            },
            PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0b1010_0000]),
            },
            PeerMessage::Request {
                piece_index: PieceIndex::new(10),
                offset: 16384,
                length: 16384,
            },
            PeerMessage::Piece {
                piece_index: PieceIndex::new(1),
                offset: 0,
                data: Bytes::from_static(b"block"),
            },
            PeerMessage::HaveNone,
            PeerMessage::Extended {
                ext_id: 3,
                payload: Bytes::from_static(b"d8:msg_typei0e5:piecei0ee"),
            },
        ];

        let (local, remote) = tokio::io::duplex(64 * 1024);
        let mut sender = PeerConnection::new(local);
        let mut receiver = PeerConnection::new(remote);

        for message in &test_cases {
            sender.send(message).await.unwrap();
        }
        for expected in test_cases {
            assert_eq!(receiver.read_message().await.unwrap(), expected);
        }
    }
}
