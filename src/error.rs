//! Typed error hierarchy for swarm-dl.
//!
//! Errors are grouped by the layer that produced them: the bencode codec,
//! metainfo/magnet parsing, a single peer session, a single piece, or the
//! download run as a whole. Session errors always tear down the connection;
//! piece errors are retryable on the same peer.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for swarm-dl operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the leecher engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed bencoded input. Carries the byte offset of the failure and
    /// a short slice of the surrounding input.
    #[error("bencode error at byte {offset}: {kind} (near {context:?})")]
    Bencode {
        kind: BencodeErrorKind,
        offset: usize,
        context: String,
    },

    /// Missing or wrongly-typed key in a .torrent or info dictionary.
    #[error("invalid metainfo: {0}")]
    Metainfo(String),

    /// Malformed magnet URI.
    #[error("invalid magnet link: {0}")]
    Magnet(String),

    /// Fatal error on a peer connection. The session is closed and the
    /// owning worker terminates.
    #[error("peer {peer}: {kind}: {message}")]
    Session {
        peer: SocketAddr,
        kind: SessionErrorKind,
        message: String,
    },

    /// A piece arrived over well-formed frames but failed validation.
    /// Fatal to the piece only; the caller may retry.
    #[error("piece {index}: {kind}")]
    Piece { index: usize, kind: PieceErrorKind },

    /// One or more pieces could not be obtained from any peer.
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// The run deadline fired before every piece was collected.
    #[error("download timed out after {elapsed:?}: {pieces_completed}/{total_pieces} pieces completed")]
    Timeout {
        elapsed: Duration,
        pieces_completed: usize,
        total_pieces: usize,
    },

    /// The run-scoped cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Filesystem error during assembly.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bencode decode failure subtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BencodeErrorKind {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("invalid type prefix")]
    InvalidPrefix,
    #[error("invalid integer")]
    InvalidInteger,
    #[error("invalid string length")]
    InvalidLength,
    #[error("string length exceeds input")]
    StringPastEnd,
    #[error("string length exceeds allowed maximum")]
    OversizedString,
    #[error("dictionary key is not a byte string")]
    NonStringKey,
    #[error("trailing data after value")]
    TrailingData,
}

/// Session failure subtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionErrorKind {
    #[error("connect failed")]
    Connect,
    #[error("timed out")]
    Timeout,
    #[error("handshake rejected")]
    Handshake,
    #[error("framing violation")]
    Framing,
    #[error("unexpected message")]
    UnexpectedMessage,
    #[error("extension protocol failure")]
    Extension,
    #[error("connection error")]
    Connection,
}

/// Piece failure subtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PieceErrorKind {
    #[error("hash mismatch")]
    HashMismatch,
    #[error("payload shorter than declared piece length")]
    Truncated,
}

/// Aggregated failure for a download run that finished with missing pieces.
#[derive(Debug, Error)]
#[error(
    "download failed for '{torrent_name}': {}/{total_pieces} pieces failed, {} worker errors",
    failed_pieces.len(),
    worker_errors.len()
)]
pub struct DownloadError {
    pub torrent_name: String,
    pub failed_pieces: Vec<usize>,
    pub total_pieces: usize,
    pub worker_errors: Vec<WorkerError>,
}

/// Error from a single worker, attributed to the protocol phase it died in.
#[derive(Debug, Error)]
#[error("worker for peer {peer} failed during {phase}: {error}")]
pub struct WorkerError {
    pub peer: SocketAddr,
    pub phase: Phase,
    #[source]
    pub error: Box<Error>,
}

/// Protocol phase a worker was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Handshake,
    Bitfield,
    Interest,
    Unchoke,
    Download,
    Metadata,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connect => "connection",
            Self::Handshake => "handshake",
            Self::Bitfield => "bitfield",
            Self::Interest => "interested",
            Self::Unchoke => "unchoke",
            Self::Download => "download",
            Self::Metadata => "metadata",
        };
        f.write_str(name)
    }
}

/// How many input bytes to quote in a bencode error context.
const CONTEXT_LEN: usize = 20;

impl Error {
    /// Build a bencode error pointing at `offset` within `input`.
    pub fn bencode(kind: BencodeErrorKind, offset: usize, input: &[u8]) -> Self {
        let start = offset.min(input.len());
        let end = (start + CONTEXT_LEN).min(input.len());
        Self::Bencode {
            kind,
            offset,
            context: String::from_utf8_lossy(&input[start..end]).into_owned(),
        }
    }

    pub fn metainfo(message: impl Into<String>) -> Self {
        Self::Metainfo(message.into())
    }

    pub fn magnet(message: impl Into<String>) -> Self {
        Self::Magnet(message.into())
    }

    pub fn session(peer: SocketAddr, kind: SessionErrorKind, message: impl Into<String>) -> Self {
        Self::Session {
            peer,
            kind,
            message: message.into(),
        }
    }

    pub fn piece(index: usize, kind: PieceErrorKind) -> Self {
        Self::Piece { index, kind }
    }

    /// True for failures that are fatal to a single piece but leave the
    /// session usable, so the worker may retry on the same peer.
    pub fn is_piece_error(&self) -> bool {
        matches!(self, Self::Piece { .. })
    }

    /// True when the error came from the run-scoped cancellation token.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl WorkerError {
    pub fn new(peer: SocketAddr, phase: Phase, error: Error) -> Self {
        Self {
            peer,
            phase,
            error: Box::new(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bencode_error_context_is_bounded() {
        let input = vec![b'x'; 100];
        let err = Error::bencode(BencodeErrorKind::InvalidPrefix, 10, &input);
        match err {
            Error::Bencode {
                offset, context, ..
            } => {
                assert_eq!(offset, 10);
                assert_eq!(context.len(), CONTEXT_LEN);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn bencode_error_context_at_end_of_input() {
        let err = Error::bencode(BencodeErrorKind::UnexpectedEnd, 5, b"abc");
        match err {
            Error::Bencode { context, .. } => assert!(context.is_empty()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn piece_error_classification() {
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        assert!(Error::piece(3, PieceErrorKind::HashMismatch).is_piece_error());
        assert!(!Error::session(addr, SessionErrorKind::Framing, "bad frame").is_piece_error());
        assert!(!Error::Cancelled.is_piece_error());
    }

    #[test]
    fn download_error_display() {
        let err = DownloadError {
            torrent_name: "debian.iso".to_string(),
            failed_pieces: vec![3, 7],
            total_pieces: 100,
            worker_errors: Vec::new(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("debian.iso"));
        assert!(rendered.contains("2/100"));
    }

    #[test]
    fn worker_error_carries_phase() {
        let addr: SocketAddr = "10.0.0.1:51413".parse().unwrap();
        let err = WorkerError::new(
            addr,
            Phase::Unchoke,
            Error::session(addr, SessionErrorKind::UnexpectedMessage, "got choke"),
        );
        assert!(err.to_string().contains("during unchoke"));
    }
}
