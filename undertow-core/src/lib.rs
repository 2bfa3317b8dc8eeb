//! Undertow Core - BitTorrent peer-wire client core
//!
//! Connects to candidate peers of a swarm, negotiates the extension protocol,
//! fetches torrent metadata over `ut_metadata` and downloads individual pieces
//! with pipelined block requests. Peers are raced concurrently and the first
//! successful result wins.

pub mod config;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::UndertowConfig;
pub use torrent::{InfoHash, MetadataFetch, PeerAddress, PieceFetch, TorrentError, TorrentInfo};

/// Errors surfaced to callers of the top-level fetch operations.
///
/// Per-peer failures never reach this level; they are absorbed by the
/// peer race and only "no peer produced a result" is reported.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("No peer yielded {what}")]
    NoResult { what: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UndertowError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            UndertowError::Torrent(e) => match e {
                TorrentError::InvalidRequest { reason } => format!("Invalid request: {reason}"),
                TorrentError::InvalidTorrentInfo { reason } => {
                    format!("Invalid torrent metadata: {reason}")
                }
                _ => "Peer protocol error occurred".to_string(),
            },
            UndertowError::NoResult { what } => format!("No peer could provide {what}"),
            UndertowError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            UndertowError::Torrent(TorrentError::InvalidRequest { .. })
                | UndertowError::Torrent(TorrentError::InvalidTorrentInfo { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, UndertowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors_are_classified() {
        let error = UndertowError::Torrent(TorrentError::InvalidRequest {
            reason: "piece index 9 out of range".to_string(),
        });
        assert!(error.is_user_error());
        assert!(error.user_message().contains("piece index 9"));

        let error = UndertowError::NoResult {
            what: "metadata".to_string(),
        };
        assert!(!error.is_user_error());
        assert_eq!(error.user_message(), "No peer could provide metadata");
    }
}
