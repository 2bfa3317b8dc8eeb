//! Pipelined block download of a single piece.
//!
//! A piece is fetched as a sequence of `request`/`piece` exchanges with up to
//! `pipeline_depth` requests outstanding. [`BlockRequestWindow`] tracks which
//! offsets are pending and received, [`PieceDownload`] drives the
//! choke/unchoke state machine on top of it, and [`download_piece`] runs both
//! against a live connection.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use super::protocol::{MAX_FRAME_LEN, PeerConnection, PeerMessage, PeerTransport};
use super::{PieceIndex, TorrentError};

// Constants
pub const DEFAULT_BLOCK_SIZE: u32 = 16_384;
pub const DEFAULT_PIPELINE_DEPTH: usize = 8;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Largest block whose `piece` frame (id, index, begin, data) still fits in
/// [`MAX_FRAME_LEN`].
pub const MAX_BLOCK_SIZE: u32 = (MAX_FRAME_LEN - 9) as u32;

/// What to do with an offset the peer refused with `reject_request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectPolicy {
    /// Request the offset again once the window has room.
    #[default]
    Retry,
    /// Only free the window slot; the piece cannot complete from this peer.
    Skip,
}

/// Tuning for a single piece download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceDownloadOptions {
    pub block_size: u32,
    pub pipeline_depth: usize,
    /// Maximum time without an accepted block before giving up.
    pub idle_timeout: Duration,
    pub reject_policy: RejectPolicy,
}

impl Default for PieceDownloadOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            reject_policy: RejectPolicy::default(),
        }
    }
}

/// Returns the size of piece `index`; the last piece may be shorter.
///
/// # Errors
/// - `TorrentError::InvalidRequest` - Zero piece length or total size, or
///   index past the last piece
pub fn piece_size_for(
    index: PieceIndex,
    piece_length: u32,
    total_size: u64,
) -> Result<u32, TorrentError> {
    if piece_length == 0 || total_size == 0 {
        return Err(TorrentError::InvalidRequest {
            reason: format!(
                "piece length {piece_length} and total size {total_size} must be positive"
            ),
        });
    }

    let num_pieces = total_size.div_ceil(u64::from(piece_length));
    let index_value = u64::from(index.as_u32());
    if index_value >= num_pieces {
        return Err(TorrentError::InvalidRequest {
            reason: format!("piece index {index} out of range (0..{num_pieces})"),
        });
    }

    if index_value == num_pieces - 1 {
        let last = total_size - (num_pieces - 1) * u64::from(piece_length);
        Ok(last as u32)
    } else {
        Ok(piece_length)
    }
}

/// Outstanding and completed block requests for one piece.
///
/// `pending` and `received` never overlap, `pending` never exceeds the
/// pipeline depth, and their combined lengths never exceed the piece size.
#[derive(Debug, Clone)]
pub struct BlockRequestWindow {
    piece_size: u32,
    block_size: u32,
    pipeline_depth: usize,
    next_offset: u32,
    retry: VecDeque<u32>,
    pending: BTreeMap<u32, u32>,
    received: BTreeSet<u32>,
    bytes_received: u32,
}

impl BlockRequestWindow {
    /// Zero block size or depth are raised to 1; block size is capped at
    /// [`MAX_BLOCK_SIZE`].
    pub fn new(piece_size: u32, block_size: u32, pipeline_depth: usize) -> Self {
        Self {
            piece_size,
            block_size: block_size.clamp(1, MAX_BLOCK_SIZE),
            pipeline_depth: pipeline_depth.max(1),
            next_offset: 0,
            retry: VecDeque::new(),
            pending: BTreeMap::new(),
            received: BTreeSet::new(),
            bytes_received: 0,
        }
    }

    fn block_len(&self, offset: u32) -> u32 {
        self.block_size.min(self.piece_size - offset)
    }

    /// Reserves the next block to request, as `(offset, length)`.
    ///
    /// Rejected offsets queued for retry go first. Returns `None` when the
    /// window is full or every block is pending or received.
    pub fn next_request(&mut self) -> Option<(u32, u32)> {
        if self.pending.len() >= self.pipeline_depth {
            return None;
        }

        let offset = loop {
            match self.retry.pop_front() {
                Some(offset) if self.pending.contains_key(&offset) => continue,
                Some(offset) if self.received.contains(&offset) => continue,
                Some(offset) => break offset,
                None if self.next_offset < self.piece_size => {
                    let offset = self.next_offset;
                    self.next_offset += self.block_len(offset);
                    break offset;
                }
                None => return None,
            }
        };

        let length = self.block_len(offset);
        self.pending.insert(offset, length);
        Some((offset, length))
    }

    /// Marks a pending block received if `length` matches its request.
    ///
    /// Returns false for unrequested offsets and length mismatches, leaving
    /// the window unchanged.
    pub fn accept_block(&mut self, offset: u32, length: usize) -> bool {
        match self.pending.get(&offset) {
            Some(&expected) if expected as usize == length => {
                self.pending.remove(&offset);
                self.received.insert(offset);
                self.bytes_received += expected;
                true
            }
            _ => false,
        }
    }

    /// Drops a pending request the peer refused.
    pub fn reject(&mut self, offset: u32, policy: RejectPolicy) -> bool {
        if self.pending.remove(&offset).is_none() {
            return false;
        }
        if policy == RejectPolicy::Retry {
            self.retry.push_back(offset);
        }
        true
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_received == self.piece_size
    }

    pub fn bytes_received(&self) -> u32 {
        self.bytes_received
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    fn pending_bytes(&self) -> u64 {
        self.pending.values().map(|&len| u64::from(len)).sum()
    }
}

/// Exact-size buffer receiving blocks in place.
#[derive(Debug, Clone)]
pub struct PieceBuffer {
    data: Vec<u8>,
}

impl PieceBuffer {
    pub fn new(size: u32) -> Self {
        Self {
            data: vec![0u8; size as usize],
        }
    }

    /// Copies `block` to `offset`; returns false if it does not fit.
    pub fn write(&mut self, offset: u32, block: &[u8]) -> bool {
        let start = offset as usize;
        match start.checked_add(block.len()) {
            Some(end) if end <= self.data.len() => {
                self.data[start..end].copy_from_slice(block);
                true
            }
            _ => false,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.data)
    }
}

/// Download lifecycle. `Choked` and `Unchoked` alternate until `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Idle,
    InterestedSent,
    Choked,
    Unchoked,
    Complete,
}

/// Effect of one inbound message on a [`PieceDownload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadEvent {
    Ignored,
    Choked,
    Unchoked,
    /// A block was stored; the idle clock restarts.
    BlockAccepted,
    Rejected,
    Complete,
}

/// Choke-aware state machine for one piece.
#[derive(Debug)]
pub struct PieceDownload {
    index: PieceIndex,
    window: BlockRequestWindow,
    buffer: PieceBuffer,
    state: DownloadState,
    reject_policy: RejectPolicy,
}

impl PieceDownload {
    pub fn new(index: PieceIndex, piece_size: u32, options: &PieceDownloadOptions) -> Self {
        Self {
            index,
            window: BlockRequestWindow::new(
                piece_size,
                options.block_size,
                options.pipeline_depth,
            ),
            buffer: PieceBuffer::new(piece_size),
            state: DownloadState::Idle,
            reject_policy: options.reject_policy,
        }
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    pub fn window(&self) -> &BlockRequestWindow {
        &self.window
    }

    /// Returns the `interested` message that opens the exchange.
    pub fn start(&mut self) -> PeerMessage {
        self.state = DownloadState::InterestedSent;
        PeerMessage::Interested
    }

    /// Proceeds as unchoked when the peer never confirmed; some peers serve
    /// requests without an explicit unchoke.
    pub fn assume_unchoked(&mut self) {
        if self.state == DownloadState::InterestedSent {
            self.state = DownloadState::Unchoked;
        }
    }

    /// Requests to send now to fill the pipeline. Empty while choked.
    pub fn fill_requests(&mut self) -> Vec<PeerMessage> {
        let mut requests = Vec::new();
        if self.state != DownloadState::Unchoked {
            return requests;
        }
        while let Some((offset, length)) = self.window.next_request() {
            requests.push(PeerMessage::Request {
                piece_index: self.index,
                offset,
                length,
            });
        }
        requests
    }

    pub fn handle_message(&mut self, message: &PeerMessage) -> DownloadEvent {
        if self.state == DownloadState::Complete {
            return DownloadEvent::Ignored;
        }

        match message {
            PeerMessage::Choke => {
                self.state = DownloadState::Choked;
                DownloadEvent::Choked
            }
            PeerMessage::Unchoke => {
                self.state = DownloadState::Unchoked;
                DownloadEvent::Unchoked
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } if *piece_index == self.index => {
                if !self.window.accept_block(*offset, data.len()) {
                    return DownloadEvent::Ignored;
                }
                self.buffer.write(*offset, data);
                if self.window.is_complete() {
                    self.state = DownloadState::Complete;
                    DownloadEvent::Complete
                } else {
                    DownloadEvent::BlockAccepted
                }
            }
            PeerMessage::RejectRequest {
                piece_index,
                offset,
                ..
            } if *piece_index == self.index => {
                if self.window.reject(*offset, self.reject_policy) {
                    DownloadEvent::Rejected
                } else {
                    DownloadEvent::Ignored
                }
            }
            _ => DownloadEvent::Ignored,
        }
    }

    /// Returns the piece once every byte has arrived.
    pub fn finish(self) -> Option<Bytes> {
        (self.state == DownloadState::Complete).then(|| self.buffer.into_bytes())
    }
}

/// Downloads piece `index` of `piece_size` bytes from a handshaken peer.
///
/// After sending `interested`, waits up to the idle timeout for `unchoke`; if
/// none arrives, requests are sent anyway. Fails once no block has been
/// accepted for a whole idle timeout, however long the transfer has run.
///
/// # Errors
/// - `TorrentError::Timeout` - No progress within `options.idle_timeout`
/// - `TorrentError::UnexpectedEof` - Peer closed the connection
/// - `TorrentError::Io` - Transport failure
pub async fn download_piece<S: PeerTransport>(
    conn: &mut PeerConnection<S>,
    index: PieceIndex,
    piece_size: u32,
    options: &PieceDownloadOptions,
) -> Result<Bytes, TorrentError> {
    let mut download = PieceDownload::new(index, piece_size, options);
    conn.send(&download.start()).await?;

    let unchoke_deadline = Instant::now() + options.idle_timeout;
    loop {
        match tokio::time::timeout_at(unchoke_deadline, conn.read_message()).await {
            Ok(message) => match download.handle_message(&message?) {
                DownloadEvent::Unchoked | DownloadEvent::Choked => break,
                _ => {}
            },
            Err(_) => {
                tracing::debug!(peer = ?conn.peer_address(), %index, "no unchoke, requesting anyway");
                download.assume_unchoked();
                break;
            }
        }
    }

    let mut idle_deadline = Instant::now() + options.idle_timeout;
    loop {
        for request in download.fill_requests() {
            conn.send(&request).await?;
        }

        let message = tokio::time::timeout_at(idle_deadline, conn.read_message())
            .await
            .map_err(|_| TorrentError::Timeout {
                operation: format!("download of piece {index}"),
            })??;

        match download.handle_message(&message) {
            DownloadEvent::Complete => break,
            DownloadEvent::BlockAccepted => {
                idle_deadline = Instant::now() + options.idle_timeout;
            }
            DownloadEvent::Choked => {
                tracing::trace!(peer = ?conn.peer_address(), %index, "choked mid-piece");
            }
            DownloadEvent::Rejected => {
                tracing::trace!(peer = ?conn.peer_address(), %index, ?message, "request rejected");
            }
            DownloadEvent::Unchoked | DownloadEvent::Ignored => {}
        }
    }

    download.finish().ok_or_else(|| TorrentError::InvalidRequest {
        reason: format!("piece {index} finished incomplete"),
    })
}
