//! Length-prefixed framing over any byte-stream transport
//!
//! Received bytes are accumulated in a connection-owned buffer and only
//! consumed once a whole frame is present, so an elapsed read deadline never
//! desynchronises the stream: the next read resumes where the last one stopped.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::messages::MessageCodec;
use super::types::{Frame, PeerMessage};
use crate::torrent::{PeerAddress, TorrentError};

/// Largest frame accepted from a peer: a 1 MiB block plus header room.
pub const MAX_FRAME_LEN: usize = (1 << 20) + 13;

/// Upper bound on a single write before the peer is considered stalled.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

const READ_CHUNK: usize = 16 * 1024;

/// Byte-stream capability required of a peer connection.
///
/// Implemented for every tokio stream, so TCP sockets and in-memory test
/// doubles are interchangeable.
pub trait PeerTransport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> PeerTransport for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Framed connection to one peer.
pub struct PeerConnection<S> {
    stream: S,
    read_buf: BytesMut,
    address: Option<PeerAddress>,
    write_timeout: Duration,
}

impl<S: PeerTransport> PeerConnection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            address: None,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Records the remote address for logging.
    pub fn with_address(mut self, address: PeerAddress) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    /// Returns the socket address of the connected peer, if known.
    pub fn peer_address(&self) -> Option<PeerAddress> {
        self.address
    }

    async fn fill_buf(&mut self) -> Result<(), TorrentError> {
        self.read_buf.reserve(READ_CHUNK);
        let read = self.stream.read_buf(&mut self.read_buf).await?;
        if read == 0 {
            return Err(TorrentError::UnexpectedEof);
        }
        Ok(())
    }

    /// Reads exactly `n` bytes.
    ///
    /// # Errors
    /// - `TorrentError::UnexpectedEof` - Stream closed before `n` bytes arrived
    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes, TorrentError> {
        while self.read_buf.len() < n {
            self.fill_buf().await?;
        }
        Ok(self.read_buf.split_to(n).freeze())
    }

    /// Reads exactly `n` bytes within `timeout`.
    ///
    /// # Errors
    /// - `TorrentError::Timeout` - Deadline elapsed first
    /// - `TorrentError::UnexpectedEof` - Stream closed first
    pub async fn read_exact_within(
        &mut self,
        n: usize,
        timeout: Duration,
    ) -> Result<Bytes, TorrentError> {
        tokio::time::timeout(timeout, self.read_exact(n))
            .await
            .map_err(|_| TorrentError::Timeout {
                operation: format!("read of {n} bytes"),
            })?
    }

    /// Reads one frame. A zero length prefix yields `Frame::KeepAlive`.
    ///
    /// # Errors
    /// - `TorrentError::UnexpectedEof` - Stream closed mid-frame
    /// - `TorrentError::MalformedEncoding` - Declared length above `MAX_FRAME_LEN`
    pub async fn read_frame(&mut self) -> Result<Frame, TorrentError> {
        loop {
            if let Some(frame) = self.take_buffered_frame()? {
                return Ok(frame);
            }
            self.fill_buf().await?;
        }
    }

    /// Reads one frame within `timeout`.
    ///
    /// # Errors
    /// - `TorrentError::Timeout` - Deadline elapsed first
    pub async fn read_frame_within(&mut self, timeout: Duration) -> Result<Frame, TorrentError> {
        tokio::time::timeout(timeout, self.read_frame())
            .await
            .map_err(|_| TorrentError::Timeout {
                operation: "frame read".to_string(),
            })?
    }

    fn take_buffered_frame(&mut self) -> Result<Option<Frame>, TorrentError> {
        if self.read_buf.len() < 4 {
            return Ok(None);
        }

        let mut header = &self.read_buf[..4];
        let length = header.get_u32() as usize;

        if length == 0 {
            self.read_buf.advance(4);
            return Ok(Some(Frame::KeepAlive));
        }

        if length > MAX_FRAME_LEN {
            return Err(TorrentError::MalformedEncoding {
                reason: format!("frame length {length} exceeds {MAX_FRAME_LEN}"),
            });
        }

        if self.read_buf.len() < 4 + length {
            self.read_buf.reserve(4 + length - self.read_buf.len());
            return Ok(None);
        }

        self.read_buf.advance(4);
        let id = self.read_buf.get_u8();
        let payload = self.read_buf.split_to(length - 1).freeze();
        Ok(Some(Frame::Message { id, payload }))
    }

    /// Reads the next well-formed message.
    ///
    /// Frames whose payload does not fit their message id are skipped; the
    /// stream stays aligned because the whole frame was already consumed.
    ///
    /// # Errors
    /// - `TorrentError::UnexpectedEof` - Stream closed
    /// - `TorrentError::MalformedEncoding` - Oversized frame
    pub async fn read_message(&mut self) -> Result<PeerMessage, TorrentError> {
        loop {
            let frame = self.read_frame().await?;
            match MessageCodec::parse_frame(frame) {
                Ok(message) => return Ok(message),
                Err(e) => tracing::trace!(peer = ?self.address, "skipping malformed message: {e}"),
            }
        }
    }

    /// Reads the next well-formed message within `timeout`.
    ///
    /// # Errors
    /// - `TorrentError::Timeout` - Deadline elapsed first
    pub async fn read_message_within(
        &mut self,
        timeout: Duration,
    ) -> Result<PeerMessage, TorrentError> {
        tokio::time::timeout(timeout, self.read_message())
            .await
            .map_err(|_| TorrentError::Timeout {
                operation: "message read".to_string(),
            })?
    }

    /// Writes raw bytes (used for the handshake).
    ///
    /// # Errors
    /// - `TorrentError::Timeout` - Peer stopped draining its socket
    /// - `TorrentError::Io` - Write failed
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), TorrentError> {
        let write_timeout = self.write_timeout;
        let write = async {
            self.stream.write_all(data).await?;
            self.stream.flush().await
        };
        tokio::time::timeout(write_timeout, write)
            .await
            .map_err(|_| TorrentError::Timeout {
                operation: "write".to_string(),
            })??;
        Ok(())
    }

    /// Sends a message as one frame.
    ///
    /// # Errors
    /// - `TorrentError::Timeout` - Peer stopped draining its socket
    /// - `TorrentError::Io` - Write failed
    pub async fn send(&mut self, message: &PeerMessage) -> Result<(), TorrentError> {
        let data = MessageCodec::serialize_message(message);
        self.write_all(&data).await
    }

    /// Shuts down the write half; the stream is released on drop.
    pub async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::trace!(peer = ?self.address, "shutdown failed: {e}");
        }
    }
}
