//! One download worker.
//!
//! A worker owns exactly one peer for the lifetime of the run: it dials,
//! carries the session to `Ready`, then consumes work items until the queue
//! drains. A session failure terminates the worker (the item in hand is
//! re-offered); a piece failure is retried on the same peer with linear
//! backoff before being reported and dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::queue::{SkipOutcome, WorkQueue};
use super::{PieceResult, PieceWork};
use crate::config::Config;
use crate::error::{Error, Phase, Result, WorkerError};
use crate::metainfo::TorrentFile;
use crate::peer::PeerSession;

/// Pause before re-claiming an item this peer already declined once.
const SKIP_BACKOFF: Duration = Duration::from_millis(50);

pub(crate) struct Worker {
    addr: SocketAddr,
    torrent: Arc<TorrentFile>,
    peer_id: [u8; 20],
    config: Config,
    queue: Arc<WorkQueue>,
    results: mpsc::Sender<PieceResult>,
    errors: mpsc::Sender<WorkerError>,
    cancel: CancellationToken,

    attempted: usize,
    downloaded: usize,
    failed: usize,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        addr: SocketAddr,
        torrent: Arc<TorrentFile>,
        peer_id: [u8; 20],
        config: Config,
        queue: Arc<WorkQueue>,
        results: mpsc::Sender<PieceResult>,
        errors: mpsc::Sender<WorkerError>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            addr,
            torrent,
            peer_id,
            config,
            queue,
            results,
            errors,
            cancel,
            attempted: 0,
            downloaded: 0,
            failed: 0,
        }
    }

    /// Run the worker to completion. Terminal failures are pushed to the
    /// errors channel; cancellation exits quietly.
    pub(crate) async fn run(mut self) {
        if let Err(err) = self.run_inner().await {
            if !err.error.is_cancelled() {
                let _ = self.errors.send(err).await;
            }
        }

        if self.config.verbose {
            tracing::info!(
                peer = %self.addr,
                attempted = self.attempted,
                downloaded = self.downloaded,
                failed = self.failed,
                "worker finished"
            );
        } else {
            tracing::debug!(
                peer = %self.addr,
                attempted = self.attempted,
                downloaded = self.downloaded,
                failed = self.failed,
                "worker finished"
            );
        }
    }

    async fn run_inner(&mut self) -> std::result::Result<(), WorkerError> {
        let mut session = self.setup().await?;
        let result = self.download_loop(&mut session).await;
        session.close().await;
        result
    }

    /// Dial and carry the session through handshake, bitfield, and the
    /// interest/unchoke exchange.
    async fn setup(&self) -> std::result::Result<PeerSession, WorkerError> {
        let fail = |phase, error| WorkerError::new(self.addr, phase, error);

        let mut session =
            PeerSession::dial(self.addr, self.config.pipeline_depth, self.cancel.clone())
                .await
                .map_err(|e| fail(Phase::Connect, e))?;

        session
            .handshake(self.torrent.info_hash, self.peer_id, false)
            .await
            .map_err(|e| fail(Phase::Handshake, e))?;
        session
            .read_bitfield(Some(self.torrent.info.piece_count()))
            .await
            .map_err(|e| fail(Phase::Bitfield, e))?;
        session
            .send_interested()
            .await
            .map_err(|e| fail(Phase::Interest, e))?;
        session
            .await_unchoke()
            .await
            .map_err(|e| fail(Phase::Unchoke, e))?;

        tracing::debug!(peer = %self.addr, "session ready");
        Ok(session)
    }

    async fn download_loop(
        &mut self,
        session: &mut PeerSession,
    ) -> std::result::Result<(), WorkerError> {
        loop {
            let work = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                work = self.queue.claim() => match work {
                    Some(work) => work,
                    None => return Ok(()),
                },
            };

            self.attempted += 1;

            if !session.has_piece(work.index) {
                let index = work.index;
                match self.queue.skip(work, self.addr) {
                    SkipOutcome::Requeued => {}
                    SkipOutcome::Revisited => {
                        // Only other workers can serve this item; give them
                        // a moment before claiming again.
                        tokio::select! {
                            _ = self.cancel.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(SKIP_BACKOFF) => {}
                        }
                    }
                    SkipOutcome::Dropped => {
                        tracing::debug!(
                            peer = %self.addr,
                            index,
                            "piece dropped: no remaining peer advertises it"
                        );
                    }
                }
                continue;
            }

            match self.fetch_with_retry(session, &work).await {
                Ok(payload) => {
                    self.queue.complete(&work);
                    self.downloaded += 1;
                    let result = PieceResult {
                        index: work.index,
                        payload,
                    };
                    if self.results.send(result).await.is_err() {
                        // Coordinator went away; nothing left to deliver to.
                        return Ok(());
                    }
                }
                Err(err) if err.is_piece_error() => {
                    self.failed += 1;
                    self.queue.abandon(&work);
                    let report = WorkerError::new(self.addr, Phase::Download, err);
                    let _ = self.errors.send(report).await;
                }
                Err(err) => {
                    // The session is unusable; let another worker have the
                    // piece and terminate.
                    self.queue.requeue(work);
                    if err.is_cancelled() {
                        return Ok(());
                    }
                    return Err(WorkerError::new(self.addr, Phase::Download, err));
                }
            }
        }
    }

    /// Attempt a piece up to `max_retries` times with linear backoff.
    /// Only piece-level failures are retried; session failures propagate
    /// immediately.
    async fn fetch_with_retry(
        &self,
        session: &mut PeerSession,
        work: &PieceWork,
    ) -> Result<Vec<u8>> {
        let mut last_error = None;

        for attempt in 0..self.config.max_retries.max(1) {
            match session.get_piece(work.index, work.length, &work.hash).await {
                Ok(payload) => return Ok(payload),
                Err(err) if err.is_piece_error() => {
                    tracing::debug!(
                        peer = %self.addr,
                        index = work.index,
                        attempt = attempt + 1,
                        error = %err,
                        "piece attempt failed"
                    );
                    last_error = Some(err);

                    if attempt + 1 < self.config.max_retries {
                        let backoff = Duration::from_millis(100 * (attempt as u64 + 1));
                        tokio::select! {
                            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or(Error::Cancelled))
    }
}
