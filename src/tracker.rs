//! Peer discovery collaborator.
//!
//! The core never constructs tracker requests itself; it consumes an
//! opaque source of peer endpoints and treats the result as data. Tests
//! and embedders supply their own implementations.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::Result;
use crate::metainfo::Sha1Hash;

/// An opaque source of candidate peer endpoints for a torrent.
#[async_trait]
pub trait PeerSource: Send + Sync {
    /// Return candidate endpoints for the given torrent.
    async fn get_peers(
        &self,
        announce: &str,
        info_hash: &Sha1Hash,
        total_length: u64,
    ) -> Result<Vec<SocketAddr>>;
}

/// A fixed endpoint list, useful for tests and for callers that already
/// resolved their peers elsewhere.
#[derive(Debug, Clone, Default)]
pub struct StaticPeers {
    peers: Vec<SocketAddr>,
}

impl StaticPeers {
    pub fn new(peers: Vec<SocketAddr>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl PeerSource for StaticPeers {
    async fn get_peers(
        &self,
        _announce: &str,
        _info_hash: &Sha1Hash,
        _total_length: u64,
    ) -> Result<Vec<SocketAddr>> {
        Ok(self.peers.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_peers_returns_fixed_list() {
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let source = StaticPeers::new(vec![addr]);
        let peers = source.get_peers("http://t/a", &[0u8; 20], 100).await.unwrap();
        assert_eq!(peers, vec![addr]);
    }
}
