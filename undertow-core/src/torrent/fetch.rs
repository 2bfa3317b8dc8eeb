//! Top-level metadata and piece fetches racing a list of candidate peers.
//!
//! Each peer gets one worker that connects, handshakes and runs a single
//! exchange. Worker errors are logged and turned into "this peer failed";
//! only the first successful result reaches the caller.

use std::sync::Arc;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tracing::Instrument;

use super::availability::wait_for_availability;
use super::downloader::{download_piece, piece_size_for};
use super::extension::{MAX_METADATA_SIZE, UT_METADATA, negotiate_extensions};
use super::info::TorrentInfo;
use super::metadata::{fetch_metadata_from_peer, verify_metadata};
use super::protocol::{PeerConnection, PeerId, PeerTransport, connect_peer, perform_handshake};
use super::race::first_success;
use super::{InfoHash, PeerAddress, PieceIndex, TorrentError, dedup_peers};
use crate::config::UndertowConfig;

/// Opens a connection to `address` and runs `exchange` over it.
///
/// Runs inside a `peer` span carrying the address and exchange name, so every
/// event the connection emits is attributed to this peer. Errors are logged at
/// debug level and reported as `None`.
async fn run_worker<T, F, Fut>(
    address: PeerAddress,
    config: &UndertowConfig,
    what: &'static str,
    exchange: F,
) -> Option<T>
where
    F: FnOnce(PeerConnection<tokio::net::TcpStream>) -> Fut,
    Fut: Future<Output = Result<Option<T>, TorrentError>>,
{
    let span = tracing::debug_span!("peer", peer = %address, exchange = what);
    async move {
        let conn = match connect_peer(address, config.network.connect_timeout).await {
            Ok(conn) => conn.with_write_timeout(config.network.write_timeout),
            Err(e) => {
                tracing::debug!("connect failed: {e}");
                return None;
            }
        };

        match exchange(conn).await {
            Ok(Some(result)) => {
                tracing::debug!("peer delivered");
                Some(result)
            }
            Ok(None) => {
                tracing::debug!("peer has nothing for us");
                None
            }
            Err(e) => {
                tracing::debug!("exchange failed: {e}");
                None
            }
        }
    }
    .instrument(span)
    .await
}

/// Retrieves the info dictionary of a swarm from its peers (BEP 9).
#[derive(Debug, Clone)]
pub struct MetadataFetch {
    info_hash: InfoHash,
    peer_id: PeerId,
    config: UndertowConfig,
}

impl MetadataFetch {
    /// Creates a fetch with a freshly generated peer id.
    pub fn new(info_hash: InfoHash, config: UndertowConfig) -> Self {
        Self {
            info_hash,
            peer_id: PeerId::generate(config.client.client_id),
            config,
        }
    }

    pub fn with_peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = peer_id;
        self
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Races `peers` and returns the first complete metadata, or `None` if
    /// no peer delivered it.
    pub async fn fetch_metadata(&self, peers: &[PeerAddress]) -> Option<Bytes> {
        let peers = dedup_peers(peers);
        tracing::info!(
            info_hash = %self.info_hash,
            peers = peers.len(),
            "fetching metadata"
        );

        let fetch = Arc::new(self.clone());
        let metadata = first_success(peers, self.config.network.max_concurrency, move |address| {
            let fetch = Arc::clone(&fetch);
            async move {
                let exchange = Arc::clone(&fetch);
                run_worker(address, &fetch.config, "metadata", |mut conn| async move {
                    let result = exchange.fetch_from_connection(&mut conn).await;
                    conn.close().await;
                    result
                })
                .await
            }
        })
        .await;

        match &metadata {
            Some(bytes) => {
                tracing::info!(info_hash = %self.info_hash, size = bytes.len(), "metadata retrieved")
            }
            None => tracing::info!(info_hash = %self.info_hash, "no peer yielded metadata"),
        }
        metadata
    }

    /// Runs handshake, extension negotiation and metadata exchange over an
    /// open connection.
    ///
    /// Returns `Ok(None)` when the peer is disqualified: wrong info hash, no
    /// extension support, no `ut_metadata`, an incomplete exchange, or
    /// metadata that fails verification.
    ///
    /// # Errors
    /// - `TorrentError::ResourceBound` - Declared metadata size out of bounds
    /// - `TorrentError::Timeout` - Handshake did not complete in time
    /// - `TorrentError::UnexpectedEof` - Peer closed the connection
    pub async fn fetch_from_connection<S: PeerTransport>(
        &self,
        conn: &mut PeerConnection<S>,
    ) -> Result<Option<Bytes>, TorrentError> {
        let network = &self.config.network;

        let Some(handshake) =
            perform_handshake(conn, self.info_hash, self.peer_id, network.connect_timeout).await?
        else {
            return Ok(None);
        };
        if !handshake.supports_extensions() {
            tracing::debug!(peer = ?conn.peer_address(), "peer lacks extension protocol");
            return Ok(None);
        }

        let Some(extensions) = negotiate_extensions(conn, network.read_timeout).await? else {
            return Ok(None);
        };
        let Some(ut_metadata_id) = extensions.extension_id(UT_METADATA) else {
            tracing::debug!(peer = ?conn.peer_address(), "peer lacks ut_metadata");
            return Ok(None);
        };

        let limit = self.config.metadata.max_metadata_size.min(MAX_METADATA_SIZE);
        let metadata_size = extensions.metadata_size_within(limit)?;

        let Some(metadata) =
            fetch_metadata_from_peer(conn, ut_metadata_id, metadata_size, network.read_timeout)
                .await?
        else {
            return Ok(None);
        };

        if self.config.metadata.verify_metadata && !verify_metadata(&metadata, &self.info_hash) {
            tracing::debug!(peer = ?conn.peer_address(), "metadata does not match info hash");
            return Ok(None);
        }

        Ok(Some(metadata))
    }
}

/// Piece to download and the torrent geometry it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceTarget {
    pub index: PieceIndex,
    pub piece_length: u32,
    pub total_size: u64,
    /// SHA-1 the downloaded piece must match, when known.
    pub expected_hash: Option<[u8; 20]>,
}

impl PieceTarget {
    /// Builds a target for piece `index` of a parsed info dictionary.
    ///
    /// # Errors
    /// - `TorrentError::InvalidRequest` - Index out of range
    pub fn from_info(info: &TorrentInfo, index: PieceIndex) -> Result<Self, TorrentError> {
        info.piece_size(index)?;
        Ok(Self {
            index,
            piece_length: info.piece_length,
            total_size: info.total_length(),
            expected_hash: info.piece_hash(index),
        })
    }

    /// Size of the target piece.
    ///
    /// # Errors
    /// - `TorrentError::InvalidRequest` - Index out of range or empty torrent
    pub fn piece_size(&self) -> Result<u32, TorrentError> {
        piece_size_for(self.index, self.piece_length, self.total_size)
    }

    pub fn num_pieces(&self) -> usize {
        if self.piece_length == 0 {
            return 0;
        }
        self.total_size.div_ceil(u64::from(self.piece_length)) as usize
    }

    /// Whether `data` matches the expected hash; true when none is known.
    pub fn verify(&self, data: &[u8]) -> bool {
        let Some(expected) = self.expected_hash else {
            return true;
        };
        let mut hasher = Sha1::new();
        hasher.update(data);
        let result = hasher.finalize();
        result.as_slice() == expected
    }
}

/// Downloads one piece from whichever peer delivers it first.
#[derive(Debug, Clone)]
pub struct PieceFetch {
    info_hash: InfoHash,
    peer_id: PeerId,
    target: PieceTarget,
    config: UndertowConfig,
}

impl PieceFetch {
    /// Creates a fetch with a freshly generated peer id.
    pub fn new(info_hash: InfoHash, target: PieceTarget, config: UndertowConfig) -> Self {
        Self {
            info_hash,
            peer_id: PeerId::generate(config.client.client_id),
            target,
            config,
        }
    }

    pub fn with_peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = peer_id;
        self
    }

    pub fn target(&self) -> &PieceTarget {
        &self.target
    }

    /// Races `peers` and returns the first complete piece.
    ///
    /// # Errors
    /// - `TorrentError::InvalidRequest` - Piece index outside the torrent
    pub async fn fetch_piece(&self, peers: &[PeerAddress]) -> Result<Option<Bytes>, TorrentError> {
        self.target.piece_size()?;

        let peers = dedup_peers(peers);
        tracing::info!(
            info_hash = %self.info_hash,
            piece = %self.target.index,
            peers = peers.len(),
            "fetching piece"
        );

        let fetch = Arc::new(self.clone());
        let piece = first_success(peers, self.config.network.max_concurrency, move |address| {
            let fetch = Arc::clone(&fetch);
            async move {
                let exchange = Arc::clone(&fetch);
                run_worker(address, &fetch.config, "piece", |mut conn| async move {
                    let result = exchange.fetch_from_connection(&mut conn).await;
                    conn.close().await;
                    result
                })
                .await
            }
        })
        .await;

        match &piece {
            Some(bytes) => {
                tracing::info!(piece = %self.target.index, size = bytes.len(), "piece retrieved")
            }
            None => tracing::info!(piece = %self.target.index, "no peer yielded the piece"),
        }
        Ok(piece)
    }

    /// Runs handshake, availability check and block download over an open
    /// connection.
    ///
    /// Returns `Ok(None)` when the peer is disqualified: wrong info hash, no
    /// proof it holds the piece, or data failing hash verification.
    ///
    /// # Errors
    /// - `TorrentError::InvalidRequest` - Piece index outside the torrent
    /// - `TorrentError::Timeout` - Handshake or download stalled
    /// - `TorrentError::UnexpectedEof` - Peer closed the connection
    pub async fn fetch_from_connection<S: PeerTransport>(
        &self,
        conn: &mut PeerConnection<S>,
    ) -> Result<Option<Bytes>, TorrentError> {
        let network = &self.config.network;
        let piece_size = self.target.piece_size()?;
        let index = self.target.index;

        if perform_handshake(conn, self.info_hash, self.peer_id, network.connect_timeout)
            .await?
            .is_none()
        {
            return Ok(None);
        }

        let availability =
            wait_for_availability(conn, self.target.num_pieces(), network.read_timeout).await?;
        if !availability.has_piece(index) {
            tracing::debug!(
                peer = ?conn.peer_address(),
                source = ?availability.source(),
                %index,
                "peer does not announce piece"
            );
            return Ok(None);
        }

        let options = self.config.transfer.download_options();
        let data = download_piece(conn, index, piece_size, &options).await?;

        if self.config.transfer.verify_pieces && !self.target.verify(&data) {
            tracing::debug!(peer = ?conn.peer_address(), %index, "piece failed hash check");
            return Ok(None);
        }

        Ok(Some(data))
    }
}
