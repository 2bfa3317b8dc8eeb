//! BitTorrent wire protocol message serialization and deserialization

use bytes::{Buf, BufMut, Bytes};

use super::types::{Frame, PeerMessage, message_id};
use crate::torrent::{PieceIndex, TorrentError};

/// Message serialization utilities for BitTorrent wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes a peer message into a complete length-prefixed frame.
    pub fn serialize_message(message: &PeerMessage) -> Vec<u8> {
        let mut buf = Vec::new();

        match message {
            PeerMessage::KeepAlive => {
                buf.put_u32(0); // Length = 0
            }
            PeerMessage::Choke => Self::put_header(&mut buf, message_id::CHOKE, 0),
            PeerMessage::Unchoke => Self::put_header(&mut buf, message_id::UNCHOKE, 0),
            PeerMessage::Interested => Self::put_header(&mut buf, message_id::INTERESTED, 0),
            PeerMessage::NotInterested => {
                Self::put_header(&mut buf, message_id::NOT_INTERESTED, 0)
            }
            PeerMessage::Have { piece_index } => {
                Self::put_header(&mut buf, message_id::HAVE, 4);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                Self::put_header(&mut buf, message_id::BITFIELD, bitfield.len());
                buf.extend_from_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                Self::put_header(&mut buf, message_id::REQUEST, 12);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                Self::put_header(&mut buf, message_id::PIECE, 8 + data.len());
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                Self::put_header(&mut buf, message_id::CANCEL, 12);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Port { port } => {
                Self::put_header(&mut buf, message_id::PORT, 2);
                buf.put_u16(*port);
            }
            PeerMessage::HaveAll => Self::put_header(&mut buf, message_id::HAVE_ALL, 0),
            PeerMessage::HaveNone => Self::put_header(&mut buf, message_id::HAVE_NONE, 0),
            PeerMessage::RejectRequest {
                piece_index,
                offset,
                length,
            } => {
                Self::put_header(&mut buf, message_id::REJECT_REQUEST, 12);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Extended { ext_id, payload } => {
                Self::put_header(&mut buf, message_id::EXTENDED, 1 + payload.len());
                buf.put_u8(*ext_id);
                buf.extend_from_slice(payload);
            }
            PeerMessage::Unknown { id, payload } => {
                Self::put_header(&mut buf, *id, payload.len());
                buf.extend_from_slice(payload);
            }
        }

        buf
    }

    /// Length prefix counts the id byte plus the payload.
    fn put_header(buf: &mut Vec<u8>, id: u8, payload_len: usize) {
        buf.put_u32(1 + payload_len as u32);
        buf.put_u8(id);
    }

    /// Interprets a frame as a typed message.
    ///
    /// Unknown ids become `PeerMessage::Unknown` so callers can ignore them.
    ///
    /// # Errors
    /// - `TorrentError::MalformedEncoding` - Payload too short for its message id
    pub fn parse_frame(frame: Frame) -> Result<PeerMessage, TorrentError> {
        let (id, payload) = match frame {
            Frame::KeepAlive => return Ok(PeerMessage::KeepAlive),
            Frame::Message { id, payload } => (id, payload),
        };
        let mut buf = payload.clone();

        let message = match id {
            message_id::CHOKE => PeerMessage::Choke,
            message_id::UNCHOKE => PeerMessage::Unchoke,
            message_id::INTERESTED => PeerMessage::Interested,
            message_id::NOT_INTERESTED => PeerMessage::NotInterested,
            message_id::HAVE => {
                Self::require_len(id, &payload, 4)?;
                PeerMessage::Have {
                    piece_index: PieceIndex::new(buf.get_u32()),
                }
            }
            message_id::BITFIELD => PeerMessage::Bitfield { bitfield: payload },
            message_id::REQUEST => {
                Self::require_len(id, &payload, 12)?;
                PeerMessage::Request {
                    piece_index: PieceIndex::new(buf.get_u32()),
                    offset: buf.get_u32(),
                    length: buf.get_u32(),
                }
            }
            message_id::PIECE => {
                Self::require_len(id, &payload, 8)?;
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: buf,
                }
            }
            message_id::CANCEL => {
                Self::require_len(id, &payload, 12)?;
                PeerMessage::Cancel {
                    piece_index: PieceIndex::new(buf.get_u32()),
                    offset: buf.get_u32(),
                    length: buf.get_u32(),
                }
            }
            message_id::PORT => {
                Self::require_len(id, &payload, 2)?;
                PeerMessage::Port {
                    port: buf.get_u16(),
                }
            }
            message_id::HAVE_ALL => PeerMessage::HaveAll,
            message_id::HAVE_NONE => PeerMessage::HaveNone,
            message_id::REJECT_REQUEST => {
                Self::require_len(id, &payload, 12)?;
                PeerMessage::RejectRequest {
                    piece_index: PieceIndex::new(buf.get_u32()),
                    offset: buf.get_u32(),
                    length: buf.get_u32(),
                }
            }
            message_id::EXTENDED => {
                Self::require_len(id, &payload, 1)?;
                let ext_id = buf.get_u8();
                PeerMessage::Extended {
                    ext_id,
                    payload: buf,
                }
            }
            _ => PeerMessage::Unknown { id, payload },
        };

        Ok(message)
    }

    fn require_len(id: u8, payload: &Bytes, min: usize) -> Result<(), TorrentError> {
        if payload.len() < min {
            return Err(TorrentError::MalformedEncoding {
                reason: format!(
                    "message id {id} needs at least {min} payload bytes, got {}",
                    payload.len()
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_layout() {
        let message = PeerMessage::Request {
            piece_index: PieceIndex::new(3),
            offset: 16384,
            length: 16384,
        };

        let bytes = MessageCodec::serialize_message(&message);
        assert_eq!(
            bytes,
            vec![0, 0, 0, 13, 6, 0, 0, 0, 3, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
    }

    #[test]
    fn test_keepalive_and_interested_layout() {
        assert_eq!(
            MessageCodec::serialize_message(&PeerMessage::KeepAlive),
            vec![0, 0, 0, 0]
        );
        assert_eq!(
            MessageCodec::serialize_message(&PeerMessage::Interested),
            vec![0, 0, 0, 1, 2]
        );
    }

    #[test]
    fn test_extended_message_layout() {
        let message = PeerMessage::Extended {
            ext_id: 0,
            payload: Bytes::from_static(b"de"),
        };
        assert_eq!(
            MessageCodec::serialize_message(&message),
            vec![0, 0, 0, 4, 20, 0, b'd', b'e']
        );
    }

    #[test]
    fn test_parse_piece_with_data() {
        let frame = Frame::Message {
            id: message_id::PIECE,
            payload: Bytes::from(vec![0, 0, 0, 1, 0, 0, 0x40, 0, 9, 8, 7]),
        };

        let message = MessageCodec::parse_frame(frame).unwrap();
        assert_eq!(
            message,
            PeerMessage::Piece {
                piece_index: PieceIndex::new(1),
                offset: 16384,
                data: Bytes::from_static(&[9, 8, 7]),
            }
        );
    }

    #[test]
    fn test_parse_fast_extension_messages() {
        let have_all = Frame::Message {
            id: message_id::HAVE_ALL,
            payload: Bytes::new(),
        };
        assert_eq!(
            MessageCodec::parse_frame(have_all).unwrap(),
            PeerMessage::HaveAll
        );

        let reject = MessageCodec::serialize_message(&PeerMessage::RejectRequest {
            piece_index: PieceIndex::new(2),
            offset: 32768,
            length: 16384,
        });
        assert_eq!(reject[4], 0x10);
        let frame = Frame::Message {
            id: reject[4],
            payload: Bytes::copy_from_slice(&reject[5..]),
        };
        assert_eq!(
            MessageCodec::parse_frame(frame).unwrap(),
            PeerMessage::RejectRequest {
                piece_index: PieceIndex::new(2),
                offset: 32768,
                length: 16384,
            }
        );
    }

    #[test]
    fn test_unknown_ids_are_preserved() {
        let frame = Frame::Message {
            id: 0x11,
            payload: Bytes::from_static(&[1, 2]),
        };
        assert_eq!(
            MessageCodec::parse_frame(frame).unwrap(),
            PeerMessage::Unknown {
                id: 0x11,
                payload: Bytes::from_static(&[1, 2]),
            }
        );
    }

    #[test]
    fn test_short_payloads_are_malformed() {
        let cases = [
            (message_id::HAVE, 3),
            (message_id::REQUEST, 11),
            (message_id::PIECE, 7),
            (message_id::REJECT_REQUEST, 4),
            (message_id::EXTENDED, 0),
        ];

        for (id, len) in cases {
            let frame = Frame::Message {
                id,
                payload: Bytes::from(vec![0u8; len]),
            };
            assert!(matches!(
                MessageCodec::parse_frame(frame),
                Err(TorrentError::MalformedEncoding { .. })
            ));
        }
    }
}
