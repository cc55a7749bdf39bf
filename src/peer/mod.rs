//! Peer wire protocol (BEP 3) with extension negotiation (BEP 10).
//!
//! A session is a one-shot leecher: it dials, handshakes, reads the
//! bitfield, signals interest, waits for unchoke, and then serves piece
//! downloads. It never chokes back, never answers requests, and never
//! sends `have`.

pub mod message;
pub mod session;

pub use message::PeerMessage;
pub use session::{PeerSession, SessionState};

use std::time::Duration;

use bitvec::prelude::*;

use crate::error::{Error, Result, SessionErrorKind};
use crate::metainfo::Sha1Hash;

/// Protocol identifier carried in every handshake.
pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Fixed handshake size: 1 + 19 + 8 + 20 + 20.
pub const HANDSHAKE_LEN: usize = 68;

/// Block size for piece requests (16 KiB).
pub const BLOCK_SIZE: u32 = 16384;

/// Timeout for the initial TCP dial.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Reserved byte index carrying the extension protocol bit.
const EXTENSION_BYTE: usize = 5;
/// Extension protocol flag within that byte (BEP 10).
const EXTENSION_FLAG: u8 = 0x10;

/// The 68-byte handshake, fixed layout:
/// `[pstrlen][pstr][reserved 8][infohash 20][peer_id 20]`.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Build an outgoing handshake, optionally advertising extension
    /// protocol support.
    pub fn new(info_hash: Sha1Hash, peer_id: [u8; 20], extensions: bool) -> Self {
        let mut reserved = [0u8; 8];
        if extensions {
            reserved[EXTENSION_BYTE] |= EXTENSION_FLAG;
        }
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Serialize to the 68-byte wire form.
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_STRING.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_STRING);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parse a received handshake, rejecting a wrong pstrlen or pstr.
    pub fn parse(buf: &[u8; HANDSHAKE_LEN]) -> std::result::Result<Self, String> {
        if buf[0] as usize != PROTOCOL_STRING.len() {
            return Err(format!("invalid protocol string length {}", buf[0]));
        }
        if &buf[1..20] != PROTOCOL_STRING {
            return Err("invalid protocol string".to_string());
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Whether the remote advertised the extension protocol (BEP 10).
    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_FLAG != 0
    }
}

/// Compact bitmap of which pieces a peer holds. Bit `i` lives in byte
/// `i / 8` at position `7 - i % 8` (most significant bit first).
#[derive(Debug, Clone, Default)]
pub struct Bitfield {
    bits: BitVec<u8, Msb0>,
}

impl Bitfield {
    /// Build from a raw wire payload. When `num_pieces` is known, trailing
    /// bits past it are discarded so they can never read as set.
    pub fn from_payload(payload: &[u8], num_pieces: Option<usize>) -> Self {
        let mut bits = BitVec::<u8, Msb0>::from_slice(payload);
        if let Some(n) = num_pieces {
            bits.truncate(n);
        }
        Self { bits }
    }

    /// Whether the peer advertised piece `index`. False for any index past
    /// the known piece count.
    pub fn has_piece(&self, index: usize) -> bool {
        self.bits.get(index).map(|b| *b).unwrap_or(false)
    }

    /// Number of pieces the peer advertised.
    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }
}

/// Generate a random Azureus-style peer id with our client prefix.
pub fn generate_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(b"-SW0010-");
    for byte in &mut id[8..] {
        *byte = rand::random();
    }
    id
}

/// Map an i/o error during session traffic to a session error.
pub(crate) fn io_session_error(
    peer: std::net::SocketAddr,
    what: &str,
    err: std::io::Error,
) -> Error {
    Error::session(
        peer,
        SessionErrorKind::Connection,
        format!("{what}: {err}"),
    )
}

/// Run a session i/o future under the peer read/write timeout.
pub(crate) async fn with_timeout<T, F>(
    peer: std::net::SocketAddr,
    what: &str,
    fut: F,
) -> Result<T>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(session::IO_TIMEOUT, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(io_session_error(peer, what, err)),
        Err(_) => Err(Error::session(peer, SessionErrorKind::Timeout, what)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_roundtrip() {
        let hs = Handshake::new([7u8; 20], *b"-SW0010-abcdefghijkl", true);
        let encoded = hs.encode();
        assert_eq!(encoded.len(), HANDSHAKE_LEN);
        assert_eq!(encoded[0], 19);

        let parsed = Handshake::parse(&encoded).unwrap();
        assert_eq!(parsed.info_hash, [7u8; 20]);
        assert_eq!(&parsed.peer_id, b"-SW0010-abcdefghijkl");
        assert!(parsed.supports_extensions());
    }

    #[test]
    fn handshake_without_extensions() {
        let hs = Handshake::new([0u8; 20], [1u8; 20], false);
        assert!(!Handshake::parse(&hs.encode()).unwrap().supports_extensions());
    }

    #[test]
    fn handshake_rejects_wrong_pstr() {
        let hs = Handshake::new([0u8; 20], [1u8; 20], false);
        let mut encoded = hs.encode();
        encoded[0] = 18;
        assert!(Handshake::parse(&encoded).is_err());

        let mut encoded = hs.encode();
        encoded[5] = b'X';
        assert!(Handshake::parse(&encoded).is_err());
    }

    #[test]
    fn bitfield_bit_order() {
        // 0b10100000 with 8 pieces: pieces 0 and 2 set, everything else not.
        let bf = Bitfield::from_payload(&[0b1010_0000], Some(8));
        assert!(bf.has_piece(0));
        assert!(!bf.has_piece(1));
        assert!(bf.has_piece(2));
        for i in 3..8 {
            assert!(!bf.has_piece(i), "piece {i} should be absent");
        }
    }

    #[test]
    fn bitfield_past_piece_count_is_false() {
        // All payload bits set, but only 3 pieces exist.
        let bf = Bitfield::from_payload(&[0xff], Some(3));
        assert!(bf.has_piece(0) && bf.has_piece(1) && bf.has_piece(2));
        assert!(!bf.has_piece(3));
        assert!(!bf.has_piece(100));
        assert_eq!(bf.count(), 3);
    }

    #[test]
    fn peer_id_has_client_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-SW0010-");
    }
}
