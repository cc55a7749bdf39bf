//! Download coordinator.
//!
//! Builds the piece work list, spawns one worker per peer (bounded by
//! `max_workers`), gathers verified pieces, and enforces the run deadline.
//! Workers never decide the run's fate: the coordinator is the only place
//! that aggregates failures and classifies the outcome.

mod queue;
mod worker;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{DownloadError, Error, Result};
use crate::magnet::MagnetLink;
use crate::metadata;
use crate::metainfo::{Info, Sha1Hash, TorrentFile};
use crate::peer::generate_peer_id;
use crate::tracker::PeerSource;
use queue::WorkQueue;
use worker::Worker;

/// One piece to fetch. Immutable once enqueued.
#[derive(Debug, Clone)]
pub struct PieceWork {
    pub index: usize,
    pub hash: Sha1Hash,
    pub length: u32,
}

/// One verified piece, produced by a worker.
#[derive(Debug)]
pub struct PieceResult {
    pub index: usize,
    pub payload: Vec<u8>,
}

/// Coordinates a download run over a fixed set of peer endpoints.
#[derive(Debug)]
pub struct Downloader {
    torrent: Arc<TorrentFile>,
    peers: Vec<SocketAddr>,
    config: Config,
}

impl Downloader {
    pub fn new(torrent: TorrentFile, peers: Vec<SocketAddr>, config: Config) -> Self {
        Self {
            torrent: Arc::new(torrent),
            peers,
            config,
        }
    }

    /// Bootstrap a downloader from a magnet link: fetch the info
    /// dictionary from one of the candidate peers via ut_metadata, verify
    /// it against the magnet infohash, then seed the coordinator with it.
    pub async fn from_magnet(
        magnet: &MagnetLink,
        peers: Vec<SocketAddr>,
        config: Config,
    ) -> Result<Self> {
        let cancel = CancellationToken::new();
        let info = metadata::fetch_info_from_peers(magnet, &peers, &config, cancel).await?;
        let torrent = TorrentFile::from_parts(
            magnet.tracker_url.clone().unwrap_or_default(),
            info,
            magnet.info_hash,
        );
        Ok(Self::new(torrent, peers, config))
    }

    pub fn torrent(&self) -> &TorrentFile {
        &self.torrent
    }

    /// Download every piece and write the payload into `dest_dir` using
    /// the declared file layout.
    pub async fn download_to(&self, dest_dir: &Path) -> Result<()> {
        let payload = self.download().await?;
        crate::assemble::write_payload(&self.torrent.info, &payload, dest_dir).await
    }

    /// Download every piece and return the assembled payload in piece
    /// order.
    ///
    /// Fails with [`DownloadError`] when any index is left unfilled after
    /// all workers finish, or with [`Error::Timeout`] when the run deadline
    /// fires first.
    pub async fn download(&self) -> Result<Vec<u8>> {
        let info = &self.torrent.info;
        let num_pieces = info.piece_count();

        let queue = Arc::new(WorkQueue::new(build_work_list(info), self.peers.len()));
        let (results_tx, mut results_rx) = mpsc::channel::<PieceResult>(num_pieces.max(1));
        let (errors_tx, mut errors_rx) = mpsc::channel(self.peers.len().max(1));
        let cancel = CancellationToken::new();
        let peer_id = generate_peer_id();

        let num_workers = self.config.max_workers.min(self.peers.len());
        tracing::info!(
            torrent = %info.name,
            pieces = num_pieces,
            peers = self.peers.len(),
            workers = num_workers,
            "starting download"
        );

        for &addr in self.peers.iter().take(num_workers) {
            let worker = Worker::new(
                addr,
                Arc::clone(&self.torrent),
                peer_id,
                self.config.clone(),
                Arc::clone(&queue),
                results_tx.clone(),
                errors_tx.clone(),
                cancel.clone(),
            );
            tokio::spawn(worker.run());
        }
        // Workers hold the only remaining senders; the channels close when
        // the last worker returns.
        drop(results_tx);
        drop(errors_tx);

        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);

        let mut pieces: Vec<Option<Vec<u8>>> = vec![None; num_pieces];
        let mut completed = 0usize;
        let mut worker_errors = Vec::new();
        let mut results_open = true;
        let mut errors_open = true;

        while results_open || errors_open {
            tokio::select! {
                _ = &mut deadline => {
                    cancel.cancel();
                    tracing::warn!(
                        torrent = %info.name,
                        completed,
                        total = num_pieces,
                        "download deadline fired"
                    );
                    return Err(Error::Timeout {
                        elapsed: self.config.timeout,
                        pieces_completed: completed,
                        total_pieces: num_pieces,
                    });
                }

                result = results_rx.recv(), if results_open => match result {
                    Some(piece) => {
                        let slot = &mut pieces[piece.index];
                        if slot.is_none() {
                            completed += 1;
                            *slot = Some(piece.payload);
                            tracing::debug!(
                                index = piece.index,
                                completed,
                                total = num_pieces,
                                "piece collected"
                            );
                        }
                    }
                    None => results_open = false,
                },

                error = errors_rx.recv(), if errors_open => match error {
                    Some(err) => {
                        if self.config.verbose {
                            tracing::warn!(error = %err, "worker error");
                        } else {
                            tracing::debug!(error = %err, "worker error");
                        }
                        worker_errors.push(err);
                    }
                    None => errors_open = false,
                },
            }
        }

        if completed == num_pieces {
            let mut payload = Vec::with_capacity(info.total_length as usize);
            for piece in pieces.into_iter().flatten() {
                payload.extend_from_slice(&piece);
            }
            tracing::info!(torrent = %info.name, bytes = payload.len(), "download complete");
            Ok(payload)
        } else {
            let failed_pieces: Vec<usize> = pieces
                .iter()
                .enumerate()
                .filter(|(_, piece)| piece.is_none())
                .map(|(index, _)| index)
                .collect();
            Err(DownloadError {
                torrent_name: info.name.clone(),
                failed_pieces,
                total_pieces: num_pieces,
                worker_errors,
            }
            .into())
        }
    }
}

/// Fetch the peer list from a [`PeerSource`] and run the download.
pub async fn download_with_source(
    torrent: TorrentFile,
    source: &dyn PeerSource,
    config: Config,
) -> Result<Vec<u8>> {
    let peers = source
        .get_peers(
            &torrent.announce,
            &torrent.info_hash,
            torrent.info.total_length,
        )
        .await?;
    Downloader::new(torrent, peers, config).download().await
}

/// Emit one work item per piece; the last piece gets the short remainder.
fn build_work_list(info: &Info) -> Vec<PieceWork> {
    (0..info.piece_count())
        .map(|index| {
            let start = index as u64 * info.piece_length;
            let length = (info.total_length - start).min(info.piece_length) as u32;
            PieceWork {
                index,
                hash: info.pieces[index],
                length,
            }
        })
        .collect()
}
