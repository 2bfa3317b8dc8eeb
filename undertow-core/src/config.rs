//! Centralized configuration for Undertow.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

use crate::torrent::RejectPolicy;
use crate::torrent::downloader::{MAX_BLOCK_SIZE, PieceDownloadOptions};
use crate::torrent::extension::MAX_METADATA_SIZE;

/// Central configuration for all Undertow components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct UndertowConfig {
    pub client: ClientConfig,
    pub network: NetworkConfig,
    pub transfer: TransferConfig,
    pub metadata: MetadataConfig,
}

/// Identity this client presents to peers.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Peer id prefix in `-XX####-` form
    pub client_id: &'static str,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: "-UW0001-",
        }
    }
}

/// Peer connection timeouts and race width.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// TCP connect and handshake timeout
    pub connect_timeout: Duration,
    /// Per-read timeout; negotiation and metadata deadlines are multiples of it
    pub read_timeout: Duration,
    /// Maximum time a single write may block
    pub write_timeout: Duration,
    /// Peers contacted concurrently during a race
    pub max_concurrency: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(4),
            read_timeout: Duration::from_secs(4),
            write_timeout: Duration::from_secs(10),
            max_concurrency: 10,
        }
    }
}

/// Piece download tuning.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub block_size: u32,
    pub pipeline_depth: usize,
    /// Give up on a peer after this long without an accepted block
    pub idle_timeout: Duration,
    pub reject_policy: RejectPolicy,
    /// Check downloaded pieces against their expected SHA-1 when known
    pub verify_pieces: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: 16_384, // 16 KiB
            pipeline_depth: 8,
            idle_timeout: Duration::from_secs(15),
            reject_policy: RejectPolicy::Retry,
            verify_pieces: true,
        }
    }
}

/// Metadata exchange limits.
#[derive(Debug, Clone)]
pub struct MetadataConfig {
    /// Largest declared metadata size accepted, capped at 8 MiB
    pub max_metadata_size: u32,
    /// Require fetched metadata to hash to the requested info hash
    pub verify_metadata: bool,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            max_metadata_size: MAX_METADATA_SIZE,
            verify_metadata: true,
        }
    }
}

impl TransferConfig {
    /// Options for a single piece download.
    pub fn download_options(&self) -> PieceDownloadOptions {
        PieceDownloadOptions {
            block_size: self.block_size,
            pipeline_depth: self.pipeline_depth,
            idle_timeout: self.idle_timeout,
            reject_policy: self.reject_policy,
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

impl UndertowConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unparseable values and block sizes above [`MAX_BLOCK_SIZE`] are
    /// ignored and the default kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(timeout) = env_millis("UNDERTOW_CONNECT_TIMEOUT_MS") {
            config.network.connect_timeout = timeout;
        }

        if let Some(timeout) = env_millis("UNDERTOW_READ_TIMEOUT_MS") {
            config.network.read_timeout = timeout;
        }

        if let Some(concurrency) = env_number::<usize>("UNDERTOW_MAX_CONCURRENCY") {
            config.network.max_concurrency = concurrency;
        }

        if let Some(depth) = env_number::<usize>("UNDERTOW_PIPELINE_DEPTH") {
            config.transfer.pipeline_depth = depth;
        }

        if let Some(block_size) = env_number::<u32>("UNDERTOW_BLOCK_SIZE") {
            if (1..=MAX_BLOCK_SIZE).contains(&block_size) {
                config.transfer.block_size = block_size;
            } else {
                tracing::warn!(
                    block_size,
                    max = MAX_BLOCK_SIZE,
                    "ignoring UNDERTOW_BLOCK_SIZE outside 1..=max"
                );
            }
        }

        config
    }

    /// Creates a configuration with short timeouts for loopback tests.
    pub fn for_testing() -> Self {
        Self {
            network: NetworkConfig {
                connect_timeout: Duration::from_millis(500),
                read_timeout: Duration::from_millis(500),
                write_timeout: Duration::from_secs(1),
                max_concurrency: 4,
            },
            transfer: TransferConfig {
                idle_timeout: Duration::from_secs(2),
                ..TransferConfig::default()
            },
            ..Default::default()
        }
    }
}
