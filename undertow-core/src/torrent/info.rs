//! Info dictionary parsing for metadata fetched from peers

use std::ops::RangeInclusive;

use super::bencode::{self, Dict, Value};
use super::downloader::piece_size_for;
use super::{PieceIndex, TorrentError};

/// One file in the torrent, positioned in the concatenated content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    pub path: Vec<String>,
    pub length: u64,
    /// Byte offset of the file within the whole torrent.
    pub offset: u64,
}

/// Decoded info dictionary.
///
/// Single-file torrents are represented as one file named after the torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentInfo {
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<TorrentFile>,
    total_length: u64,
}

fn invalid(reason: impl Into<String>) -> TorrentError {
    TorrentError::InvalidTorrentInfo {
        reason: reason.into(),
    }
}

fn required_length(dict: &Dict, context: &str) -> Result<u64, TorrentError> {
    dict.get(b"length")
        .and_then(Value::as_integer)
        .and_then(|length| u64::try_from(length).ok())
        .ok_or_else(|| invalid(format!("{context}: missing or negative length")))
}

impl TorrentInfo {
    /// Parses the bencoded info dictionary.
    ///
    /// # Errors
    /// - `TorrentError::MalformedEncoding` - Not valid bencode
    /// - `TorrentError::InvalidTorrentInfo` - Missing or inconsistent fields
    pub fn from_metadata(metadata: &[u8]) -> Result<Self, TorrentError> {
        let value = bencode::decode(metadata)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| invalid("info is not a dictionary"))?;

        let name = dict
            .get(b"name")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing name"))?
            .to_string();

        let piece_length = dict
            .get(b"piece length")
            .and_then(Value::as_integer)
            .and_then(|length| u32::try_from(length).ok())
            .filter(|&length| length > 0)
            .ok_or_else(|| invalid("missing or invalid piece length"))?;

        let pieces = dict
            .get(b"pieces")
            .and_then(Value::as_bytes)
            .ok_or_else(|| invalid("missing pieces"))?;
        if pieces.len() % 20 != 0 {
            return Err(invalid(format!(
                "pieces length {} is not a multiple of 20",
                pieces.len()
            )));
        }
        let piece_hashes: Vec<[u8; 20]> = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let (files, total_length) = match dict.get(b"files").and_then(Value::as_list) {
            Some(entries) => Self::parse_files(entries)?,
            None => {
                let length = required_length(dict, "single-file info")?;
                let file = TorrentFile {
                    path: vec![name.clone()],
                    length,
                    offset: 0,
                };
                (vec![file], length)
            }
        };

        let expected_pieces = total_length.div_ceil(u64::from(piece_length));
        if expected_pieces != piece_hashes.len() as u64 {
            return Err(invalid(format!(
                "{} piece hashes for {total_length} bytes at piece length {piece_length}",
                piece_hashes.len()
            )));
        }

        Ok(Self {
            name,
            piece_length,
            piece_hashes,
            files,
            total_length,
        })
    }

    /// Returns the files with their offsets and the summed length.
    fn parse_files(entries: &[Value]) -> Result<(Vec<TorrentFile>, u64), TorrentError> {
        let mut files = Vec::with_capacity(entries.len());
        let mut offset = 0u64;

        for (i, entry) in entries.iter().enumerate() {
            let context = format!("file {i}");
            let file = entry
                .as_dict()
                .ok_or_else(|| invalid(format!("{context}: not a dictionary")))?;
            let length = required_length(file, &context)?;
            let path = file
                .get(b"path")
                .and_then(Value::as_list)
                .ok_or_else(|| invalid(format!("{context}: missing path")))?
                .iter()
                .map(|component| component.as_str().map(String::from))
                .collect::<Option<Vec<_>>>()
                .filter(|path| !path.is_empty())
                .ok_or_else(|| invalid(format!("{context}: invalid path")))?;

            files.push(TorrentFile {
                path,
                length,
                offset,
            });
            offset = offset
                .checked_add(length)
                .ok_or_else(|| invalid(format!("{context}: total length overflows")))?;
        }

        Ok((files, offset))
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Size of piece `index`; the last piece may be shorter.
    ///
    /// # Errors
    /// - `TorrentError::InvalidRequest` - Index out of range
    pub fn piece_size(&self, index: PieceIndex) -> Result<u32, TorrentError> {
        piece_size_for(index, self.piece_length, self.total_length())
    }

    pub fn piece_hash(&self, index: PieceIndex) -> Option<[u8; 20]> {
        self.piece_hashes.get(index.as_usize()).copied()
    }

    /// Finds a file by its path components.
    pub fn file(&self, path: &[&str]) -> Option<&TorrentFile> {
        self.files
            .iter()
            .find(|file| file.path.iter().map(String::as_str).eq(path.iter().copied()))
    }

    /// Pieces covering `length` bytes starting at torrent offset `offset`.
    ///
    /// Returns `None` for an empty range or one extending past the content.
    pub fn pieces_for_range(&self, offset: u64, length: u64) -> Option<RangeInclusive<PieceIndex>> {
        let end = offset.checked_add(length)?;
        if length == 0 || end > self.total_length() {
            return None;
        }
        let piece_length = u64::from(self.piece_length);
        let first = PieceIndex::new((offset / piece_length) as u32);
        let last = PieceIndex::new(((end - 1) / piece_length) as u32);
        Some(first..=last)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn multi_file_info() -> Vec<u8> {
        let file = |length: i64, path: &[&str]| {
            Value::dict([
                ("length", Value::from(length)),
                (
                    "path",
                    Value::from(path.iter().map(|&p| Value::from(p)).collect::<Vec<_>>()),
                ),
            ])
        };
        let info = Value::dict([
            (
                "files",
                Value::from(vec![
                    file(30_000, &["docs", "readme.txt"]),
                    file(50_000, &["images", "cover.jpg"]),
                ]),
            ),
            ("name", Value::from("bundle")),
            ("piece length", Value::from(32_768)),
            ("pieces", Value::from(Bytes::from(vec![7u8; 60]))),
        ]);
        bencode::encode(&info)
    }

    #[test]
    fn test_parse_multi_file_info() {
        let info = TorrentInfo::from_metadata(&multi_file_info()).unwrap();

        assert_eq!(info.name, "bundle");
        assert_eq!(info.total_length(), 80_000);
        assert_eq!(info.piece_count(), 3);
        assert_eq!(info.piece_size(PieceIndex::new(0)).unwrap(), 32_768);
        assert_eq!(info.piece_size(PieceIndex::new(2)).unwrap(), 80_000 - 2 * 32_768);
        assert!(info.piece_size(PieceIndex::new(3)).is_err());
        assert_eq!(info.piece_hash(PieceIndex::new(1)), Some([7u8; 20]));

        let cover = info.file(&["images", "cover.jpg"]).unwrap();
        assert_eq!(cover.offset, 30_000);
        assert_eq!(
            info.pieces_for_range(cover.offset, cover.length),
            Some(PieceIndex::new(0)..=PieceIndex::new(2))
        );
    }

    #[test]
    fn test_parse_single_file_info() {
        let metadata = b"d6:lengthi10e4:name5:a.txt12:piece lengthi16e6:pieces20:aaaaaaaaaaaaaaaaaaaae";
        let info = TorrentInfo::from_metadata(metadata).unwrap();

        assert_eq!(info.files.len(), 1);
        assert_eq!(info.files[0].path, vec!["a.txt".to_string()]);
        assert_eq!(info.piece_size(PieceIndex::new(0)).unwrap(), 10);
    }

    #[test]
    fn test_rejects_inconsistent_info() {
        // 10 bytes at piece length 4 need 3 hashes, only 1 given
        let short = b"d6:lengthi10e4:name1:a12:piece lengthi4e6:pieces20:aaaaaaaaaaaaaaaaaaaae";
        assert!(matches!(
            TorrentInfo::from_metadata(short),
            Err(TorrentError::InvalidTorrentInfo { .. })
        ));

        let ragged = b"d6:lengthi10e4:name1:a12:piece lengthi16e6:pieces3:abce";
        assert!(TorrentInfo::from_metadata(ragged).is_err());

        assert!(matches!(
            TorrentInfo::from_metadata(b"d4:name"),
            Err(TorrentError::MalformedEncoding { .. })
        ));
    }

    #[test]
    fn test_rejects_overflowing_file_lengths() {
        let huge = Value::dict([
            ("length", Value::from(i64::MAX)),
            ("path", Value::from(vec![Value::from("part")])),
        ]);
        let info = Value::dict([
            ("files", Value::from(vec![huge.clone(), huge.clone(), huge])),
            ("name", Value::from("hostile")),
            ("piece length", Value::from(16_384)),
            ("pieces", Value::from(Bytes::from(vec![0u8; 20]))),
        ]);

        let result = TorrentInfo::from_metadata(&bencode::encode(&info));
        assert!(
            matches!(result, Err(TorrentError::InvalidTorrentInfo { ref reason }) if reason.contains("overflows")),
            "unexpected result: {result:?}"
        );
    }

    #[test]
    fn test_pieces_for_range_edges() {
        let info = TorrentInfo::from_metadata(&multi_file_info()).unwrap();

        assert_eq!(
            info.pieces_for_range(32_768, 1),
            Some(PieceIndex::new(1)..=PieceIndex::new(1))
        );
        assert_eq!(info.pieces_for_range(0, 0), None);
        assert_eq!(info.pieces_for_range(79_999, 2), None);
    }
}
