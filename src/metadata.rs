//! Metadata exchange for magnet links (BEP 9 over BEP 10).
//!
//! A magnet link carries only the infohash. The info dictionary itself is
//! fetched from a peer in 16 KiB pieces via the ut_metadata extension,
//! reassembled, and verified against the infohash before it is trusted.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use sha1::{Digest, Sha1};
use tokio_util::sync::CancellationToken;

use crate::bencode::Value;
use crate::config::Config;
use crate::error::{Error, Result, SessionErrorKind};
use crate::magnet::MagnetLink;
use crate::metainfo::Info;
use crate::peer::{generate_peer_id, PeerSession};

/// Size of a metadata piece (16 KiB).
pub const METADATA_PIECE_SIZE: usize = 16 * 1024;

/// Our advertised sub-id for ut_metadata in the extension handshake.
const OUR_METADATA_ID: u8 = 1;

/// Remote capabilities learned from the extension handshake.
#[derive(Debug, Clone, Copy)]
pub struct ExtensionHandshake {
    /// The remote's chosen sub-id for ut_metadata messages.
    pub ut_metadata_id: u8,
    /// Total size of the info dictionary in bytes.
    pub metadata_size: usize,
}

/// One piece of metadata received from a peer.
#[derive(Debug)]
pub struct MetadataPiece {
    pub piece: usize,
    pub total_size: usize,
    pub data: Vec<u8>,
}

/// Perform the extension handshake on an extension-negotiated session.
///
/// Sends `{"m":{"ut_metadata":1}}` as sub-id 0 and expects a reply whose
/// dict carries `metadata_size` and `m.ut_metadata`.
pub async fn extension_handshake(session: &mut PeerSession) -> Result<ExtensionHandshake> {
    let mut m = BTreeMap::new();
    m.insert(
        b"ut_metadata".to_vec(),
        Value::Integer(OUR_METADATA_ID as i64),
    );
    let mut dict = BTreeMap::new();
    dict.insert(b"m".to_vec(), Value::Dict(m));
    session.send_extended(0, Value::Dict(dict).encode()).await?;

    let (_, payload) = session.recv_extended().await?;
    parse_extension_handshake(session.addr(), &payload)
}

fn parse_extension_handshake(peer: SocketAddr, payload: &[u8]) -> Result<ExtensionHandshake> {
    let dict = Value::decode(payload)?.0;

    let ut_metadata_id = dict
        .get("m")
        .and_then(|m| m.get("ut_metadata"))
        .and_then(|v| v.as_uint())
        .ok_or_else(|| {
            Error::session(
                peer,
                SessionErrorKind::Extension,
                "extension handshake is missing m.ut_metadata",
            )
        })? as u8;

    let metadata_size = dict
        .get("metadata_size")
        .and_then(|v| v.as_uint())
        .ok_or_else(|| {
            Error::session(
                peer,
                SessionErrorKind::Extension,
                "extension handshake is missing metadata_size",
            )
        })? as usize;

    if metadata_size == 0 {
        return Err(Error::session(
            peer,
            SessionErrorKind::Extension,
            "peer reported metadata_size of 0",
        ));
    }

    Ok(ExtensionHandshake {
        ut_metadata_id,
        metadata_size,
    })
}

/// Request one metadata piece and parse the reply.
async fn request_metadata_piece(
    session: &mut PeerSession,
    ut_metadata_id: u8,
    piece: usize,
) -> Result<MetadataPiece> {
    let mut dict = BTreeMap::new();
    dict.insert(b"msg_type".to_vec(), Value::Integer(0));
    dict.insert(b"piece".to_vec(), Value::Integer(piece as i64));
    session
        .send_extended(ut_metadata_id, Value::Dict(dict).encode())
        .await?;

    let (_, payload) = session.recv_extended().await?;
    parse_metadata_piece(session.addr(), &payload)
}

/// Parse a ut_metadata data message: a bencoded dict immediately followed
/// by the raw piece bytes. The decoder's consumed-bytes contract locates
/// the boundary.
pub fn parse_metadata_piece(peer: SocketAddr, payload: &[u8]) -> Result<MetadataPiece> {
    let (dict, consumed) = Value::decode(payload)?;

    let msg_type = dict.get("msg_type").and_then(|v| v.as_uint());
    if msg_type != Some(1) {
        return Err(Error::session(
            peer,
            SessionErrorKind::Extension,
            format!("metadata reply has msg_type {msg_type:?}, expected data (1)"),
        ));
    }

    let piece = dict
        .get("piece")
        .and_then(|v| v.as_uint())
        .ok_or_else(|| {
            Error::session(
                peer,
                SessionErrorKind::Extension,
                "metadata reply has no piece index",
            )
        })? as usize;

    let total_size = dict
        .get("total_size")
        .and_then(|v| v.as_uint())
        .ok_or_else(|| {
            Error::session(
                peer,
                SessionErrorKind::Extension,
                "metadata reply has no total_size",
            )
        })? as usize;

    Ok(MetadataPiece {
        piece,
        total_size,
        data: payload[consumed..].to_vec(),
    })
}

/// Fetch and verify the complete info dictionary over an established,
/// extension-negotiated session.
pub async fn fetch_info(session: &mut PeerSession, magnet: &MagnetLink) -> Result<Info> {
    let handshake = extension_handshake(session).await?;
    let num_pieces = handshake.metadata_size.div_ceil(METADATA_PIECE_SIZE);

    tracing::debug!(
        peer = %session.addr(),
        size = handshake.metadata_size,
        pieces = num_pieces,
        "fetching metadata"
    );

    let mut metadata = Vec::with_capacity(handshake.metadata_size);
    for i in 0..num_pieces {
        let piece = request_metadata_piece(session, handshake.ut_metadata_id, i).await?;
        if piece.piece != i {
            return Err(Error::session(
                session.addr(),
                SessionErrorKind::Extension,
                format!("metadata reply for piece {}, expected {i}", piece.piece),
            ));
        }
        metadata.extend_from_slice(&piece.data);
    }

    metadata.truncate(handshake.metadata_size);

    let digest: [u8; 20] = Sha1::digest(&metadata).into();
    if digest != magnet.info_hash {
        return Err(Error::session(
            session.addr(),
            SessionErrorKind::Extension,
            "assembled metadata does not match the magnet infohash",
        ));
    }

    Info::parse(&metadata)
}

/// Bootstrap metadata from a list of candidate peers, trying each in order
/// until one delivers a verified info dictionary.
pub async fn fetch_info_from_peers(
    magnet: &MagnetLink,
    peers: &[SocketAddr],
    config: &Config,
    cancel: CancellationToken,
) -> Result<Info> {
    let peer_id = generate_peer_id();
    let mut last_error = None;

    for &addr in peers {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match fetch_from_one(addr, magnet, peer_id, config, cancel.clone()).await {
            Ok(info) => return Ok(info),
            Err(err) => {
                if err.is_cancelled() {
                    return Err(err);
                }
                tracing::debug!(peer = %addr, error = %err, "metadata fetch failed");
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::magnet("no peers available for metadata fetch")))
}

async fn fetch_from_one(
    addr: SocketAddr,
    magnet: &MagnetLink,
    peer_id: [u8; 20],
    config: &Config,
    cancel: CancellationToken,
) -> Result<Info> {
    let mut session = PeerSession::dial(addr, config.pipeline_depth, cancel).await?;
    let result = async {
        session
            .handshake(magnet.info_hash, peer_id, true)
            .await?;
        session.read_bitfield(None).await?;
        fetch_info(&mut session, magnet).await
    }
    .await;
    session.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    #[test]
    fn parse_handshake_reply() {
        let payload = b"d1:md11:ut_metadatai3ee13:metadata_sizei31235ee";
        let hs = parse_extension_handshake(addr(), payload).unwrap();
        assert_eq!(hs.ut_metadata_id, 3);
        assert_eq!(hs.metadata_size, 31235);
    }

    #[test]
    fn handshake_reply_missing_ut_metadata() {
        let payload = b"d1:mde13:metadata_sizei100ee";
        assert!(parse_extension_handshake(addr(), payload).is_err());
    }

    #[test]
    fn handshake_reply_zero_size() {
        let payload = b"d1:md11:ut_metadatai3ee13:metadata_sizei0ee";
        assert!(parse_extension_handshake(addr(), payload).is_err());
    }

    #[test]
    fn parse_data_message_with_trailing_bytes() {
        let mut payload = b"d8:msg_typei1e5:piecei0e10:total_sizei11ee".to_vec();
        payload.extend_from_slice(b"hello world");

        let piece = parse_metadata_piece(addr(), &payload).unwrap();
        assert_eq!(piece.piece, 0);
        assert_eq!(piece.total_size, 11);
        assert_eq!(piece.data, b"hello world");
    }

    #[test]
    fn rejects_reject_message() {
        let payload = b"d8:msg_typei2e5:piecei0ee";
        assert!(parse_metadata_piece(addr(), payload).is_err());
    }

    #[test]
    fn rejects_data_without_total_size() {
        let payload = b"d8:msg_typei1e5:piecei0ee";
        assert!(parse_metadata_piece(addr(), payload).is_err());
    }
}
