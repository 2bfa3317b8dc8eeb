//! Metadata exchange over the `ut_metadata` extension (BEP 9)
//!
//! The info dictionary is split into 16 KiB pieces. Every piece is requested
//! up front since the total size is bounded, then data messages are written
//! into a fixed-size assembly buffer that is only released once complete.

use std::time::Duration;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::time::Instant;

use super::bencode::{self, Value};
use super::extension::{LOCAL_UT_METADATA_ID, MAX_METADATA_SIZE};
use super::protocol::{PeerConnection, PeerMessage, PeerTransport};
use super::{InfoHash, TorrentError};

/// Size of one metadata piece.
pub const METADATA_PIECE_SIZE: usize = 16384;

/// Lower bound on the whole exchange regardless of the read timeout.
const MIN_EXCHANGE_DEADLINE: Duration = Duration::from_secs(6);

/// Message types for the ut_metadata extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataMessageType {
    Request = 0,
    Data = 1,
    Reject = 2,
}

impl MetadataMessageType {
    pub fn from_integer(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Request),
            1 => Some(Self::Data),
            2 => Some(Self::Reject),
            _ => None,
        }
    }
}

/// Bencoded header at the start of every ut_metadata payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataHeader {
    pub msg_type: MetadataMessageType,
    pub piece: u32,
    pub total_size: Option<i64>,
    /// Offset of the raw piece data following the header.
    pub data_offset: usize,
}

impl MetadataHeader {
    /// Decodes the header prefix; bytes after it are left uninterpreted.
    ///
    /// # Errors
    /// - `TorrentError::MalformedEncoding` - Header missing, not a dictionary,
    ///   or lacking a valid `msg_type`/`piece`
    pub fn decode(payload: &[u8]) -> Result<Self, TorrentError> {
        let decoded = bencode::decode_prefix(payload, 0)?;
        let malformed = |reason: &str| TorrentError::MalformedEncoding {
            reason: format!("ut_metadata header: {reason}"),
        };

        let dict = decoded.value.as_dict().ok_or_else(|| malformed("not a dictionary"))?;
        let msg_type = dict
            .get(b"msg_type")
            .and_then(Value::as_integer)
            .and_then(MetadataMessageType::from_integer)
            .ok_or_else(|| malformed("missing or unknown msg_type"))?;
        let piece = dict
            .get(b"piece")
            .and_then(Value::as_integer)
            .and_then(|piece| u32::try_from(piece).ok())
            .ok_or_else(|| malformed("missing or invalid piece"))?;
        let total_size = dict.get(b"total_size").and_then(Value::as_integer);

        Ok(Self {
            msg_type,
            piece,
            total_size,
            data_offset: decoded.consumed,
        })
    }
}

/// Encodes a request for one metadata piece: `{"msg_type": 0, "piece": n}`.
pub fn encode_request(piece: u32) -> Bytes {
    let request = Value::dict([
        ("msg_type", Value::from(MetadataMessageType::Request as i64)),
        ("piece", Value::from(i64::from(piece))),
    ]);
    Bytes::from(bencode::encode(&request))
}

/// Fixed-size buffer reassembling metadata pieces.
///
/// Each piece index is written at most once; the buffer is only handed out
/// by [`MetadataAssembly::finish`] after every index has arrived.
#[derive(Debug)]
pub struct MetadataAssembly {
    buffer: Vec<u8>,
    received: Vec<bool>,
    remaining: usize,
}

impl MetadataAssembly {
    /// Allocates the assembly buffer for `metadata_size` bytes.
    ///
    /// # Errors
    /// - `TorrentError::ResourceBound` - Size zero or above 8 MiB
    pub fn new(metadata_size: u32) -> Result<Self, TorrentError> {
        if metadata_size == 0 || metadata_size > MAX_METADATA_SIZE {
            return Err(TorrentError::ResourceBound {
                declared: i64::from(metadata_size),
                limit: MAX_METADATA_SIZE,
            });
        }

        let size = metadata_size as usize;
        let piece_count = size.div_ceil(METADATA_PIECE_SIZE);
        Ok(Self {
            buffer: vec![0u8; size],
            received: vec![false; piece_count],
            remaining: piece_count,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.received.len()
    }

    /// Exact length of piece `piece`, or `None` if out of range.
    pub fn expected_len(&self, piece: u32) -> Option<usize> {
        let piece = piece as usize;
        if piece >= self.piece_count() {
            return None;
        }
        let start = piece * METADATA_PIECE_SIZE;
        Some(METADATA_PIECE_SIZE.min(self.buffer.len() - start))
    }

    /// Stores piece data. Extra trailing bytes are dropped; short data,
    /// out-of-range indices and already received pieces are rejected.
    ///
    /// Returns whether the data was stored.
    pub fn insert(&mut self, piece: u32, data: &[u8]) -> bool {
        let Some(expected) = self.expected_len(piece) else {
            return false;
        };
        let slot = piece as usize;
        if self.received[slot] || data.len() < expected {
            return false;
        }

        let start = slot * METADATA_PIECE_SIZE;
        self.buffer[start..start + expected].copy_from_slice(&data[..expected]);
        self.received[slot] = true;
        self.remaining -= 1;
        true
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    /// Pieces still outstanding.
    pub fn missing(&self) -> usize {
        self.remaining
    }

    /// Returns the assembled metadata, or `None` while pieces are missing.
    pub fn finish(self) -> Option<Bytes> {
        self.is_complete().then(|| Bytes::from(self.buffer))
    }
}

/// Checks that `metadata` hashes to `info_hash`.
pub fn verify_metadata(metadata: &[u8], info_hash: &InfoHash) -> bool {
    let mut hasher = Sha1::new();
    hasher.update(metadata);
    let result = hasher.finalize();
    result.as_slice() == info_hash.as_bytes()
}

/// Fetches the full metadata from one peer.
///
/// `ut_metadata_id` is the id the peer assigned in its extension handshake.
/// Data messages are accepted on that id or on our own advertised id, since
/// clients disagree on which side's id labels replies. The exchange is bounded
/// by `max(3 * read_timeout, 6s)`; returns `Ok(None)` if incomplete by then.
///
/// # Errors
/// - `TorrentError::ResourceBound` - `metadata_size` outside `1..=8 MiB`
/// - `TorrentError::UnexpectedEof` - Peer closed the connection
/// - `TorrentError::Io` - Transport failure
pub async fn fetch_metadata_from_peer<S: PeerTransport>(
    conn: &mut PeerConnection<S>,
    ut_metadata_id: u8,
    metadata_size: u32,
    read_timeout: Duration,
) -> Result<Option<Bytes>, TorrentError> {
    let mut assembly = MetadataAssembly::new(metadata_size)?;

    // some peers only serve metadata to interested peers
    conn.send(&PeerMessage::Interested).await?;
    for piece in 0..assembly.piece_count() as u32 {
        conn.send(&PeerMessage::Extended {
            ext_id: ut_metadata_id,
            payload: encode_request(piece),
        })
        .await?;
    }

    let deadline = Instant::now() + (read_timeout * 3).max(MIN_EXCHANGE_DEADLINE);
    while !assembly.is_complete() {
        let message = match tokio::time::timeout_at(deadline, conn.read_message()).await {
            Ok(message) => message?,
            Err(_) => {
                tracing::debug!(
                    peer = ?conn.peer_address(),
                    missing = assembly.missing(),
                    "metadata exchange timed out"
                );
                return Ok(None);
            }
        };

        let PeerMessage::Extended { ext_id, payload } = message else {
            continue;
        };
        if ext_id != ut_metadata_id && ext_id != LOCAL_UT_METADATA_ID {
            continue;
        }

        let header = match MetadataHeader::decode(&payload) {
            Ok(header) => header,
            Err(e) => {
                tracing::trace!(peer = ?conn.peer_address(), "ignoring metadata message: {e}");
                continue;
            }
        };

        match header.msg_type {
            MetadataMessageType::Data => {
                let data = &payload[header.data_offset..];
                if !assembly.insert(header.piece, data) {
                    tracing::trace!(
                        peer = ?conn.peer_address(),
                        piece = header.piece,
                        len = data.len(),
                        "discarding metadata piece"
                    );
                }
            }
            MetadataMessageType::Reject => {
                tracing::debug!(peer = ?conn.peer_address(), piece = header.piece, "metadata request rejected");
            }
            MetadataMessageType::Request => {}
        }
    }

    Ok(assembly.finish())
}
