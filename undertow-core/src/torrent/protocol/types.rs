//! Core types and enumerations for BitTorrent wire protocol

use bytes::Bytes;
use rand::Rng;

use crate::torrent::{InfoHash, PieceIndex};

/// Protocol identifier carried in every handshake.
pub const PROTOCOL_NAME: &str = "BitTorrent protocol";

/// Total handshake length: 1 + 19 + 8 + 20 + 20.
pub const HANDSHAKE_LEN: usize = 68;

/// Reserved byte and bit advertising the BEP 10 extension protocol.
pub const EXTENSION_PROTOCOL_BYTE: usize = 5;
pub const EXTENSION_PROTOCOL_BIT: u8 = 0x10;

/// Message identifiers of the peer wire protocol (BEP 3, BEP 6, BEP 10).
pub mod message_id {
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const NOT_INTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;
    pub const PORT: u8 = 9;
    pub const HAVE_ALL: u8 = 0x0E;
    pub const HAVE_NONE: u8 = 0x0F;
    pub const REJECT_REQUEST: u8 = 0x10;
    pub const EXTENDED: u8 = 20;
}

/// BitTorrent peer identifier.
///
/// 20-byte identifier sent in the handshake. Built once per top-level
/// operation and passed by value to every connection it opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generates a peer ID of the form `-XX####-` followed by 12 random
    /// uppercase letters.
    ///
    /// Client prefixes longer than 8 bytes are truncated; shorter ones are
    /// padded with random letters.
    pub fn generate(client_prefix: &str) -> Self {
        let mut rng = rand::rng();
        let mut id = [0u8; 20];
        for byte in &mut id {
            *byte = rng.random_range(b'A'..=b'Z');
        }
        let prefix = client_prefix.as_bytes();
        let prefix_len = prefix.len().min(8);
        id[..prefix_len].copy_from_slice(&prefix[..prefix_len]);
        Self(id)
    }
}

/// One length-prefixed frame as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Zero-length frame; carries no message id.
    KeepAlive,
    Message { id: u8, payload: Bytes },
}

/// BitTorrent wire protocol messages.
///
/// BEP 3 core messages, the BEP 6 fast-extension messages this client
/// consumes, and the BEP 10 extended message envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield {
        bitfield: Bytes,
    },
    Request {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Bytes,
    },
    Cancel {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    Port {
        port: u16,
    },
    HaveAll,
    HaveNone,
    RejectRequest {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    /// Extension-protocol message; `ext_id` 0 is the extended handshake.
    Extended {
        ext_id: u8,
        payload: Bytes,
    },
    /// Any message id this client does not interpret.
    Unknown {
        id: u8,
        payload: Bytes,
    },
}

/// Peer handshake information.
///
/// Initial exchange between peers to establish protocol compatibility
/// and verify info hash matching.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerHandshake {
    /// Protocol identifier string ("BitTorrent protocol")
    pub protocol: String,
    /// Reserved bytes for protocol extensions
    pub reserved: [u8; 8],
    /// Info hash of the torrent being shared
    pub info_hash: InfoHash,
    /// Unique identifier for the peer
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Creates our outgoing handshake, advertising the extension protocol.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        let mut reserved = [0u8; 8];
        reserved[EXTENSION_PROTOCOL_BYTE] |= EXTENSION_PROTOCOL_BIT;
        Self {
            protocol: PROTOCOL_NAME.to_string(),
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Whether the sender advertised BEP 10 support.
    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_PROTOCOL_BYTE] & EXTENSION_PROTOCOL_BIT != 0
    }
}
