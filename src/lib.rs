//! # swarm-dl
//!
//! A BitTorrent leecher engine: given a verified piece manifest and a set
//! of candidate peers, it pulls every piece over the peer wire protocol
//! and reconstructs the payload with SHA-1 integrity.
//!
//! ## Features
//!
//! - **Peer wire protocol**: handshake, extension negotiation (BEP 10),
//!   bitfield, interest/unchoke, pipelined block requests
//! - **Concurrent scheduling**: one worker per peer with shared work
//!   re-queueing, bounded retries, and a run deadline
//! - **Bencode codec**: byte-exact decoding plus the canonical encoder
//!   used for info-hash computation
//! - **Magnet links**: metadata fetched from peers via ut_metadata (BEP 9)
//!   and verified against the infohash
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use swarm_dl::{Config, Downloader, TorrentFile};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let data = std::fs::read("debian.torrent")?;
//!     let torrent = TorrentFile::parse(&data)?;
//!
//!     // Peer endpoints come from a tracker client or any other source.
//!     let peers = vec!["203.0.113.7:6881".parse()?];
//!
//!     let downloader = Downloader::new(torrent, peers, Config::default());
//!     let payload = downloader.download().await?;
//!     println!("downloaded {} bytes", payload.len());
//!     Ok(())
//! }
//! ```

pub mod assemble;
pub mod bencode;
pub mod config;
pub mod downloader;
pub mod error;
pub mod magnet;
pub mod metadata;
pub mod metainfo;
pub mod peer;
pub mod tracker;

pub use config::Config;
pub use downloader::{download_with_source, Downloader, PieceResult, PieceWork};
pub use error::{
    BencodeErrorKind, DownloadError, Error, Phase, PieceErrorKind, Result, SessionErrorKind,
    WorkerError,
};
pub use magnet::MagnetLink;
pub use metainfo::{FileEntry, Info, Sha1Hash, TorrentFile};
pub use peer::{Bitfield, PeerMessage, PeerSession, SessionState, BLOCK_SIZE};
pub use tracker::{PeerSource, StaticPeers};
