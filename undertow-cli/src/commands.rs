//! CLI command implementations

use std::path::{Path, PathBuf};

use clap::Subcommand;
use tokio::fs;
use undertow_core::config::UndertowConfig;
use undertow_core::torrent::{PieceIndex, PieceTarget};
use undertow_core::{
    InfoHash, MetadataFetch, PeerAddress, PieceFetch, Result, TorrentInfo, UndertowError,
};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Fetch the info dictionary of a swarm from its peers
    Metadata {
        /// Info hash as 40 hex characters
        #[arg(long)]
        info_hash: String,
        /// Candidate peer as ip:port, repeatable
        #[arg(short, long = "peer", required = true)]
        peers: Vec<PeerAddress>,
        /// Where to write the raw info dictionary
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Download and verify a single piece
    Piece {
        /// Info hash as 40 hex characters
        #[arg(long)]
        info_hash: String,
        /// Raw info dictionary, as written by `metadata`
        #[arg(short, long)]
        metadata: PathBuf,
        /// Zero-based piece index
        #[arg(short, long)]
        index: u32,
        /// Candidate peer as ip:port, repeatable
        #[arg(short, long = "peer", required = true)]
        peers: Vec<PeerAddress>,
        /// Where to write the piece data
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show the contents of a saved info dictionary
    Info {
        /// Raw info dictionary, as written by `metadata`
        metadata: PathBuf,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Metadata {
            info_hash,
            peers,
            output,
        } => fetch_metadata(&info_hash, &peers, output.as_deref()).await,
        Commands::Piece {
            info_hash,
            metadata,
            index,
            peers,
            output,
        } => fetch_piece(&info_hash, &metadata, index, &peers, output.as_deref()).await,
        Commands::Info { metadata } => show_info(&metadata).await,
    }
}

/// Fetch metadata from the given peers and optionally save it
///
/// # Errors
/// - `UndertowError::Torrent` - Info hash is not valid hex
/// - `UndertowError::NoResult` - No peer delivered verified metadata
/// - `UndertowError::Io` - Output file could not be written
pub async fn fetch_metadata(
    info_hash: &str,
    peers: &[PeerAddress],
    output: Option<&Path>,
) -> Result<()> {
    let info_hash = InfoHash::from_hex(info_hash)?;
    let config = UndertowConfig::from_env();
    tracing::debug!(?config, "configuration loaded");
    let fetch = MetadataFetch::new(info_hash, config);

    println!("Fetching metadata for {info_hash} from {} peers", peers.len());
    let metadata = fetch
        .fetch_metadata(peers)
        .await
        .ok_or_else(|| UndertowError::NoResult {
            what: "metadata".to_string(),
        })?;

    println!("Received {} bytes of metadata", metadata.len());
    match TorrentInfo::from_metadata(&metadata) {
        Ok(info) => print_info(&info),
        Err(e) => println!("  Metadata could not be interpreted: {e}"),
    }

    if let Some(path) = output {
        fs::write(path, &metadata).await?;
        println!("Saved to {}", path.display());
    }

    Ok(())
}

/// Download one piece from the given peers and optionally save it
///
/// # Errors
/// - `UndertowError::Torrent` - Invalid info hash, metadata or piece index
/// - `UndertowError::NoResult` - No peer delivered a verified piece
/// - `UndertowError::Io` - Metadata could not be read or output written
pub async fn fetch_piece(
    info_hash: &str,
    metadata: &Path,
    index: u32,
    peers: &[PeerAddress],
    output: Option<&Path>,
) -> Result<()> {
    let info_hash = InfoHash::from_hex(info_hash)?;
    let info = TorrentInfo::from_metadata(&fs::read(metadata).await?)?;
    let target = PieceTarget::from_info(&info, PieceIndex::new(index))?;
    let config = UndertowConfig::from_env();
    tracing::debug!(?config, "configuration loaded");
    let fetch = PieceFetch::new(info_hash, target, config);

    println!(
        "Fetching piece {index} of '{}' from {} peers",
        info.name,
        peers.len()
    );
    let piece = fetch
        .fetch_piece(peers)
        .await?
        .ok_or_else(|| UndertowError::NoResult {
            what: format!("piece {index}"),
        })?;

    println!("Received piece {index} ({} bytes, hash verified)", piece.len());

    if let Some(path) = output {
        fs::write(path, &piece).await?;
        println!("Saved to {}", path.display());
    }

    Ok(())
}

/// Print a saved info dictionary
///
/// # Errors
/// - `UndertowError::Io` - File could not be read
/// - `UndertowError::Torrent` - File is not a valid info dictionary
pub async fn show_info(metadata: &Path) -> Result<()> {
    let info = TorrentInfo::from_metadata(&fs::read(metadata).await?)?;
    print_info(&info);
    Ok(())
}

fn print_info(info: &TorrentInfo) {
    println!("  Name: {}", info.name);
    println!(
        "  Size: {} bytes in {} pieces of {} bytes",
        info.total_length(),
        info.piece_count(),
        info.piece_length
    );
    for file in &info.files {
        println!("    {} ({} bytes)", file.path.join("/"), file.length);
    }
}
