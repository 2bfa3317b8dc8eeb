//! Peer piece availability from bitfield, have and fast-extension messages

use std::time::Duration;

use tokio::time::Instant;

use super::protocol::{PeerConnection, PeerMessage, PeerTransport};
use super::{PieceIndex, TorrentError};

/// How an availability snapshot was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilitySource {
    Bitfield,
    HaveAll,
    HaveNone,
    /// Deadline elapsed; only explicit `have` announcements are known.
    Partial,
}

/// Which pieces a peer claims to hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceAvailability {
    have: Vec<bool>,
    source: AvailabilitySource,
}

impl PieceAvailability {
    pub fn new(num_pieces: usize, source: AvailabilitySource) -> Self {
        let value = source == AvailabilitySource::HaveAll;
        Self {
            have: vec![value; num_pieces],
            source,
        }
    }

    /// Decodes a bitfield payload into an authoritative snapshot.
    pub fn from_bitfield(payload: &[u8], num_pieces: usize) -> Self {
        Self {
            have: decode_bitfield(payload, num_pieces),
            source: AvailabilitySource::Bitfield,
        }
    }

    pub fn has_piece(&self, index: PieceIndex) -> bool {
        self.have.get(index.as_usize()).copied().unwrap_or(false)
    }

    pub fn source(&self) -> AvailabilitySource {
        self.source
    }

    /// Whether the snapshot came from a terminal message rather than a timeout.
    pub fn is_authoritative(&self) -> bool {
        self.source != AvailabilitySource::Partial
    }

    pub fn num_pieces(&self) -> usize {
        self.have.len()
    }

    pub fn count(&self) -> usize {
        self.have.iter().filter(|&&have| have).count()
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.have
    }

    fn mark(&mut self, index: PieceIndex) {
        if let Some(slot) = self.have.get_mut(index.as_usize()) {
            *slot = true;
        }
    }
}

/// Decodes `num_pieces` bits MSB-first; bits past the payload are false.
pub fn decode_bitfield(payload: &[u8], num_pieces: usize) -> Vec<bool> {
    (0..num_pieces)
        .map(|i| {
            payload
                .get(i / 8)
                .is_some_and(|byte| byte & (1 << (7 - i % 8)) != 0)
        })
        .collect()
}

/// Reads messages until the peer's availability is known or `timeout` elapses.
///
/// Bitfield, have-all and have-none are terminal and returned immediately.
/// `have` messages accumulate; indices past `num_pieces` are ignored. On
/// deadline the accumulated result is returned tagged
/// [`AvailabilitySource::Partial`].
///
/// # Errors
/// - `TorrentError::UnexpectedEof` - Peer closed the connection
/// - `TorrentError::Io` - Transport failure
pub async fn wait_for_availability<S: PeerTransport>(
    conn: &mut PeerConnection<S>,
    num_pieces: usize,
    timeout: Duration,
) -> Result<PieceAvailability, TorrentError> {
    let deadline = Instant::now() + timeout;
    let mut partial = PieceAvailability::new(num_pieces, AvailabilitySource::Partial);

    loop {
        let message = match tokio::time::timeout_at(deadline, conn.read_message()).await {
            Ok(message) => message?,
            Err(_) => {
                tracing::debug!(
                    peer = ?conn.peer_address(),
                    announced = partial.count(),
                    "availability wait timed out"
                );
                return Ok(partial);
            }
        };

        match message {
            PeerMessage::Bitfield { bitfield } => {
                return Ok(PieceAvailability::from_bitfield(&bitfield, num_pieces));
            }
            PeerMessage::HaveAll => {
                return Ok(PieceAvailability::new(num_pieces, AvailabilitySource::HaveAll));
            }
            PeerMessage::HaveNone => {
                return Ok(PieceAvailability::new(num_pieces, AvailabilitySource::HaveNone));
            }
            PeerMessage::Have { piece_index } => partial.mark(piece_index),
            other => tracing::trace!(peer = ?conn.peer_address(), "ignoring {other:?} while awaiting availability"),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::io::duplex;

    use super::*;

    #[test]
    fn test_decode_bitfield_msb_first() {
        assert_eq!(
            decode_bitfield(&[0b1010_0000], 4),
            vec![true, false, true, false]
        );
        assert!(decode_bitfield(&[0x00, 0x01], 16)[15]);
        assert_eq!(decode_bitfield(&[0xff], 10), {
            let mut expected = vec![true; 8];
            expected.extend([false, false]);
            expected
        });
    }

    #[tokio::test]
    async fn test_have_all_is_terminal() {
        let (client, remote) = duplex(1024);
        let mut conn = PeerConnection::new(client);
        let mut peer = PeerConnection::new(remote);

        peer.send(&PeerMessage::HaveAll).await.unwrap();
        peer.send(&PeerMessage::Unchoke).await.unwrap();

        let availability = wait_for_availability(&mut conn, 5, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(availability.source(), AvailabilitySource::HaveAll);
        assert_eq!(availability.count(), 5);

        // the unchoke after have_all is left for the next consumer
        assert_eq!(conn.read_message().await.unwrap(), PeerMessage::Unchoke);
    }

    #[tokio::test]
    async fn test_bitfield_after_haves_is_authoritative() {
        let (client, remote) = duplex(1024);
        let mut conn = PeerConnection::new(client);
        let mut peer = PeerConnection::new(remote);

        peer.send(&PeerMessage::Have {
            piece_index: PieceIndex::new(0),
        })
        .await
        .unwrap();
        peer.send(&PeerMessage::KeepAlive).await.unwrap();
        peer.send(&PeerMessage::Bitfield {
            bitfield: Bytes::from_static(&[0b0100_0000]),
        })
        .await
        .unwrap();

        let availability = wait_for_availability(&mut conn, 3, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(availability.is_authoritative());
        assert_eq!(availability.as_slice(), &[false, true, false]);
    }

    #[tokio::test]
    async fn test_have_none() {
        let (client, remote) = duplex(1024);
        let mut conn = PeerConnection::new(client);
        let mut peer = PeerConnection::new(remote);

        peer.send(&PeerMessage::HaveNone).await.unwrap();
        let availability = wait_for_availability(&mut conn, 3, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(availability.source(), AvailabilitySource::HaveNone);
        assert_eq!(availability.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_haves_then_timeout_yield_partial() {
        let (client, remote) = duplex(1024);
        let mut conn = PeerConnection::new(client);
        let mut peer = PeerConnection::new(remote);

        for index in [1, 4, 6, 40] {
            peer.send(&PeerMessage::Have {
                piece_index: PieceIndex::new(index),
            })
            .await
            .unwrap();
        }

        let availability = wait_for_availability(&mut conn, 8, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(availability.source(), AvailabilitySource::Partial);
        assert!(!availability.is_authoritative());
        assert_eq!(
            availability.as_slice(),
            &[false, true, false, false, true, false, true, false]
        );
        assert!(availability.has_piece(PieceIndex::new(4)));
        assert!(!availability.has_piece(PieceIndex::new(40)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_is_partial_not_have_none() {
        let (client, _remote) = duplex(1024);
        let mut conn = PeerConnection::new(client);

        let availability = wait_for_availability(&mut conn, 2, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(availability.source(), AvailabilitySource::Partial);
        assert_eq!(availability.count(), 0);
    }
}
