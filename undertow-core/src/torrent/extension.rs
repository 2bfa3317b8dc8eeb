//! BEP 10 extension protocol handshake
//!
//! After the base handshake both sides exchange an extended message with id
//! 0 whose bencoded payload maps extension names to the message ids the
//! sender wants to receive them on.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use super::bencode::{self, Value};
use super::protocol::{PeerConnection, PeerMessage, PeerTransport};
use super::TorrentError;

/// Extended message id reserved for the extension handshake.
pub const EXTENDED_HANDSHAKE_ID: u8 = 0;

/// Extension name for metadata exchange (BEP 9).
pub const UT_METADATA: &str = "ut_metadata";

/// Id we ask peers to use when sending us `ut_metadata` messages.
pub const LOCAL_UT_METADATA_ID: u8 = 1;

/// Largest metadata size a peer may declare.
pub const MAX_METADATA_SIZE: u32 = 8 * 1024 * 1024;

/// Decoded extension handshake of a remote peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedHandshakeInfo {
    /// Extension name to the id the peer expects for that extension.
    pub extensions: BTreeMap<String, u8>,
    /// Declared metadata size, unvalidated.
    pub metadata_size: Option<i64>,
    /// Client name and version (`v`), if sent.
    pub client: Option<String>,
}

impl ExtendedHandshakeInfo {
    /// Decodes an extension handshake payload.
    ///
    /// Entries of `m` with a zero id (extension disabled) or an id outside
    /// one byte are dropped.
    ///
    /// # Errors
    /// - `TorrentError::MalformedEncoding` - Payload is not a bencoded dictionary
    pub fn decode(payload: &[u8]) -> Result<Self, TorrentError> {
        let value = bencode::decode(payload)?;
        let dict = value.as_dict().ok_or_else(|| TorrentError::MalformedEncoding {
            reason: "extension handshake is not a dictionary".to_string(),
        })?;

        let mut info = Self::default();

        if let Some(m) = dict.get(b"m").and_then(Value::as_dict) {
            for (key, val) in m.iter() {
                if let (Ok(name), Some(id)) = (std::str::from_utf8(key), val.as_integer())
                    && let Ok(id) = u8::try_from(id)
                    && id > 0
                {
                    info.extensions.insert(name.to_string(), id);
                }
            }
        }

        info.metadata_size = dict.get(b"metadata_size").and_then(Value::as_integer);
        info.client = dict.get(b"v").and_then(Value::as_str).map(String::from);

        Ok(info)
    }

    /// Encodes the handshake we send: `{"m": {"ut_metadata": 1}}`.
    pub fn local_handshake() -> Bytes {
        let m = Value::dict([(UT_METADATA, Value::from(LOCAL_UT_METADATA_ID as i64))]);
        Bytes::from(bencode::encode(&Value::dict([("m", m)])))
    }

    /// Returns the id the peer assigned to `name`.
    pub fn extension_id(&self, name: &str) -> Option<u8> {
        self.extensions.get(name).copied()
    }

    /// Returns the declared metadata size if it lies in `1..=limit`.
    ///
    /// # Errors
    /// - `TorrentError::ResourceBound` - Size absent, non-positive or above `limit`
    pub fn metadata_size_within(&self, limit: u32) -> Result<u32, TorrentError> {
        let declared = self.metadata_size.unwrap_or(0);
        match u32::try_from(declared) {
            Ok(size) if size > 0 && size <= limit => Ok(size),
            _ => Err(TorrentError::ResourceBound { declared, limit }),
        }
    }
}

/// Sends our extension handshake and waits for the peer's.
///
/// Waits at most twice `read_timeout` in total. Bitfields and other regular
/// messages received meanwhile are ignored, as are undecodable handshakes.
/// Returns `Ok(None)` if no usable handshake arrives in time.
///
/// # Errors
/// - `TorrentError::UnexpectedEof` - Peer closed the connection
/// - `TorrentError::Io` - Transport failure
pub async fn negotiate_extensions<S: PeerTransport>(
    conn: &mut PeerConnection<S>,
    read_timeout: Duration,
) -> Result<Option<ExtendedHandshakeInfo>, TorrentError> {
    conn.send(&PeerMessage::Extended {
        ext_id: EXTENDED_HANDSHAKE_ID,
        payload: ExtendedHandshakeInfo::local_handshake(),
    })
    .await?;

    let deadline = Instant::now() + read_timeout * 2;
    loop {
        let message = match tokio::time::timeout_at(deadline, conn.read_message()).await {
            Ok(message) => message?,
            Err(_) => {
                tracing::debug!(peer = ?conn.peer_address(), "no extension handshake received");
                return Ok(None);
            }
        };

        match message {
            PeerMessage::Extended {
                ext_id: EXTENDED_HANDSHAKE_ID,
                payload,
            } => match ExtendedHandshakeInfo::decode(&payload) {
                Ok(info) => {
                    tracing::debug!(
                        peer = ?conn.peer_address(),
                        client = ?info.client,
                        metadata_size = ?info.metadata_size,
                        "extension handshake received"
                    );
                    return Ok(Some(info));
                }
                Err(e) => {
                    tracing::trace!(peer = ?conn.peer_address(), "ignoring extension handshake: {e}")
                }
            },
            other => tracing::trace!(peer = ?conn.peer_address(), "ignoring {other:?} during negotiation"),
        }
    }
}
