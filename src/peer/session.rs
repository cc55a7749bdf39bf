//! A single peer session.
//!
//! Owns one TCP connection and drives it through the leecher state
//! machine: dial, handshake, bitfield, interested/unchoke, then pipelined
//! piece downloads. Any protocol violation is fatal to the session; a hash
//! mismatch on an assembled piece is fatal to the piece only.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::message::PeerMessage;
use super::{with_timeout, Bitfield, Handshake, BLOCK_SIZE, CONNECT_TIMEOUT, HANDSHAKE_LEN};
use crate::error::{Error, PieceErrorKind, Result, SessionErrorKind};
use crate::metainfo::Sha1Hash;

/// Inactivity timeout for any single read or write on the wire.
pub(crate) const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on a single frame: one 16 KiB block plus headroom.
const MAX_FRAME_SIZE: usize = 32 * 1024;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// TCP connected, handshake not yet exchanged.
    Handshaking,
    /// Handshake done; the first inbound frame must be the bitfield.
    AwaitingBitfield,
    /// Bitfield stored; `interested` not yet sent.
    SignalingInterest,
    /// `interested` sent; the next inbound frame must be `unchoke`.
    AwaitingUnchoke,
    /// Unchoked and idle; piece downloads may start.
    Ready,
    /// A piece download is in flight.
    Downloading,
    /// Torn down.
    Closed,
}

/// One connection to one remote peer.
pub struct PeerSession {
    stream: TcpStream,
    addr: SocketAddr,
    remote_peer_id: Option<[u8; 20]>,
    remote_supports_extensions: bool,
    bitfield: Bitfield,
    peer_choking: bool,
    pipeline_depth: usize,
    state: SessionState,
    read_buf: BytesMut,
    cancel: CancellationToken,
}

impl PeerSession {
    /// Dial a peer. The TCP connect carries its own short timeout,
    /// independent of the run deadline.
    pub async fn dial(
        addr: SocketAddr,
        pipeline_depth: usize,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)) => {
                match result {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(err)) => {
                        return Err(Error::session(
                            addr,
                            SessionErrorKind::Connect,
                            err.to_string(),
                        ))
                    }
                    Err(_) => {
                        return Err(Error::session(
                            addr,
                            SessionErrorKind::Connect,
                            "dial timed out",
                        ))
                    }
                }
            }
        };

        Ok(Self {
            stream,
            addr,
            remote_peer_id: None,
            remote_supports_extensions: false,
            bitfield: Bitfield::default(),
            peer_choking: true,
            pipeline_depth: pipeline_depth.max(1),
            state: SessionState::Handshaking,
            read_buf: BytesMut::with_capacity(MAX_FRAME_SIZE),
            cancel,
        })
    }

    /// Exchange 68-byte handshakes. Rejects a response whose protocol
    /// string or infohash does not match; when `extensions` is set, also
    /// requires the remote to advertise the extension bit.
    pub async fn handshake(
        &mut self,
        info_hash: Sha1Hash,
        peer_id: [u8; 20],
        extensions: bool,
    ) -> Result<()> {
        let outgoing = Handshake::new(info_hash, peer_id, extensions).encode();
        self.write_all(&outgoing, "send handshake").await?;

        let mut response = [0u8; HANDSHAKE_LEN];
        self.read_full(&mut response, "read handshake").await?;

        let remote = Handshake::parse(&response)
            .map_err(|msg| Error::session(self.addr, SessionErrorKind::Handshake, msg))?;

        if remote.info_hash != info_hash {
            return Err(Error::session(
                self.addr,
                SessionErrorKind::Handshake,
                "info hash mismatch",
            ));
        }
        if extensions && !remote.supports_extensions() {
            return Err(Error::session(
                self.addr,
                SessionErrorKind::Extension,
                "peer does not support the extension protocol",
            ));
        }

        self.remote_peer_id = Some(remote.peer_id);
        self.remote_supports_extensions = remote.supports_extensions();
        self.state = SessionState::AwaitingBitfield;
        Ok(())
    }

    /// Read the peer's bitfield, which must be its first post-handshake
    /// message. `num_pieces` bounds the bitmap when the piece count is
    /// known; pass `None` on magnet bootstrap sessions.
    pub async fn read_bitfield(&mut self, num_pieces: Option<usize>) -> Result<()> {
        match self.recv_frame().await? {
            PeerMessage::Bitfield { bitfield } => {
                self.bitfield = Bitfield::from_payload(&bitfield, num_pieces);
                self.state = SessionState::SignalingInterest;
                Ok(())
            }
            other => Err(self.unexpected("bitfield (5)", &other)),
        }
    }

    /// Send `interested`.
    pub async fn send_interested(&mut self) -> Result<()> {
        self.send_message(&PeerMessage::Interested).await?;
        self.state = SessionState::AwaitingUnchoke;
        Ok(())
    }

    /// Wait for `unchoke`. This one-shot leecher treats anything else,
    /// including choke and keepalives, as a protocol failure.
    pub async fn await_unchoke(&mut self) -> Result<()> {
        match self.recv_frame().await? {
            PeerMessage::Unchoke => {
                self.peer_choking = false;
                self.state = SessionState::Ready;
                Ok(())
            }
            other => Err(self.unexpected("unchoke (1)", &other)),
        }
    }

    /// Download one piece using pipelined block requests.
    ///
    /// The piece is cut into 16 KiB blocks (short final block). Outstanding
    /// requests are topped up to the pipeline depth back-to-back, then
    /// exactly one inbound `piece` frame is consumed per loop turn. Blocks
    /// arrive in request order because requests are issued sequentially.
    pub async fn get_piece(
        &mut self,
        index: usize,
        length: u32,
        expected_hash: &Sha1Hash,
    ) -> Result<Vec<u8>> {
        self.state = SessionState::Downloading;

        let blocks = block_layout(length);
        let block_count = blocks.len();
        let mut received: Vec<Vec<u8>> = Vec::with_capacity(block_count);
        let mut requested = 0usize;

        while received.len() < block_count {
            while requested < block_count && requested - received.len() < self.pipeline_depth {
                let (begin, block_len) = blocks[requested];
                self.send_message(&PeerMessage::Request {
                    index: index as u32,
                    begin,
                    length: block_len,
                })
                .await?;
                requested += 1;
            }

            match self.recv_frame().await? {
                PeerMessage::Piece {
                    index: got, block, ..
                } => {
                    if got as usize != index {
                        return Err(Error::session(
                            self.addr,
                            SessionErrorKind::UnexpectedMessage,
                            format!("piece frame for index {got}, expected {index}"),
                        ));
                    }
                    received.push(block);
                }
                other => return Err(self.unexpected("piece (7)", &other)),
            }
        }

        self.state = SessionState::Ready;

        let piece: Vec<u8> = received.concat();
        if piece.len() < length as usize {
            return Err(Error::piece(index, PieceErrorKind::Truncated));
        }
        if Sha1::digest(&piece)[..] != expected_hash[..] {
            return Err(Error::piece(index, PieceErrorKind::HashMismatch));
        }
        Ok(piece)
    }

    /// Send an extension protocol message (id 20).
    pub async fn send_extended(&mut self, sub_id: u8, payload: Vec<u8>) -> Result<()> {
        self.send_message(&PeerMessage::Extended {
            id: sub_id,
            payload,
        })
        .await
    }

    /// Read one frame which must be an extension protocol message.
    pub async fn recv_extended(&mut self) -> Result<(u8, Vec<u8>)> {
        match self.recv_frame().await? {
            PeerMessage::Extended { id, payload } => Ok((id, payload)),
            other => Err(self.unexpected("extension message (20)", &other)),
        }
    }

    /// Whether the remote advertised BEP 10 support in its handshake.
    pub fn supports_extensions(&self) -> bool {
        self.remote_supports_extensions
    }

    /// Whether the peer's bitfield advertises a piece.
    pub fn has_piece(&self, index: usize) -> bool {
        self.bitfield.has_piece(index)
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The remote's peer id, learned from its handshake.
    pub fn remote_peer_id(&self) -> Option<&[u8; 20]> {
        self.remote_peer_id.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking
    }

    /// Tear down the connection.
    pub async fn close(mut self) {
        self.state = SessionState::Closed;
        let _ = self.stream.shutdown().await;
    }

    async fn send_message(&mut self, msg: &PeerMessage) -> Result<()> {
        let frame = msg.encode();
        self.write_all(&frame, "send message").await
    }

    /// Read one complete frame: 4-byte length prefix, then the body. A
    /// zero-length frame is a keepalive.
    async fn recv_frame(&mut self) -> Result<PeerMessage> {
        let mut len_buf = [0u8; 4];
        self.read_full(&mut len_buf, "read frame length").await?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            return Ok(PeerMessage::KeepAlive);
        }
        if len > MAX_FRAME_SIZE {
            return Err(Error::session(
                self.addr,
                SessionErrorKind::Framing,
                format!("frame of {len} bytes exceeds maximum"),
            ));
        }

        let mut body = std::mem::take(&mut self.read_buf);
        body.resize(len, 0);
        let result = self.read_full(&mut body, "read frame body").await;
        let msg = result.and_then(|()| {
            PeerMessage::decode(&body)
                .map_err(|msg| Error::session(self.addr, SessionErrorKind::Framing, msg))
        });
        self.read_buf = body;
        msg
    }

    async fn read_full(&mut self, buf: &mut [u8], what: &str) -> Result<()> {
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = with_timeout(self.addr, what, self.stream.read_exact(buf)) => {
                result.map(|_| ())
            }
        }
    }

    async fn write_all(&mut self, data: &[u8], what: &str) -> Result<()> {
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = with_timeout(self.addr, what, self.stream.write_all(data)) => result,
        }
    }

    fn unexpected(&self, expected: &str, got: &PeerMessage) -> Error {
        let got = match got.id() {
            Some(id) => format!("message id {id}"),
            None => "keepalive".to_string(),
        };
        Error::session(
            self.addr,
            SessionErrorKind::UnexpectedMessage,
            format!("expected {expected}, got {got}"),
        )
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("addr", &self.addr)
            .field("state", &self.state)
            .field("peer_choking", &self.peer_choking)
            .finish()
    }
}

/// Split a piece of `length` bytes into `(begin, length)` block requests.
fn block_layout(length: u32) -> Vec<(u32, u32)> {
    let mut blocks = Vec::with_capacity(length.div_ceil(BLOCK_SIZE) as usize);
    let mut begin = 0u32;
    let mut remaining = length;
    while remaining > 0 {
        let block_len = remaining.min(BLOCK_SIZE);
        blocks.push((begin, block_len));
        begin += block_len;
        remaining -= block_len;
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn block_layout_exact_multiple() {
        let blocks = block_layout(32768);
        assert_eq!(blocks, vec![(0, 16384), (16384, 16384)]);
    }

    #[test]
    fn block_layout_short_tail() {
        // 262142 = 15 full blocks + a 16382-byte tail.
        let blocks = block_layout(262142);
        assert_eq!(blocks.len(), 16);
        assert_eq!(blocks[0], (0, 16384));
        assert_eq!(blocks[15], (15 * 16384, 16382));
        let total: u32 = blocks.iter().map(|&(_, len)| len).sum();
        assert_eq!(total, 262142);
    }

    #[test]
    fn block_layout_single_small_block() {
        assert_eq!(block_layout(100), vec![(0, 100)]);
    }

    #[tokio::test]
    async fn handshake_rejects_info_hash_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut incoming = [0u8; HANDSHAKE_LEN];
            stream.read_exact(&mut incoming).await.unwrap();
            // Reply with a different infohash.
            let reply = Handshake::new([9u8; 20], [2u8; 20], false).encode();
            stream.write_all(&reply).await.unwrap();
        });

        let mut session = PeerSession::dial(addr, 5, CancellationToken::new())
            .await
            .unwrap();
        let err = session
            .handshake([1u8; 20], [3u8; 20], false)
            .await
            .unwrap_err();
        match err {
            Error::Session { kind, .. } => assert_eq!(kind, SessionErrorKind::Handshake),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn bitfield_must_be_first_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [1u8; 20];

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut incoming = [0u8; HANDSHAKE_LEN];
            stream.read_exact(&mut incoming).await.unwrap();
            let reply = Handshake::new(info_hash, [2u8; 20], false).encode();
            stream.write_all(&reply).await.unwrap();
            // Send unchoke where the bitfield belongs.
            stream.write_all(&PeerMessage::Unchoke.encode()).await.unwrap();
        });

        let mut session = PeerSession::dial(addr, 5, CancellationToken::new())
            .await
            .unwrap();
        session.handshake(info_hash, [3u8; 20], false).await.unwrap();
        let err = session.read_bitfield(Some(8)).await.unwrap_err();
        match err {
            Error::Session { kind, .. } => {
                assert_eq!(kind, SessionErrorKind::UnexpectedMessage)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Accept and hold the socket open without ever writing.
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let cancel = CancellationToken::new();
        let mut session = PeerSession::dial(addr, 5, cancel.clone()).await.unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = session
            .handshake([1u8; 20], [3u8; 20], false)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
