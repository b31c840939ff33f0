//! Round-robin frame broker.
//!
//! Sits between one-or-more producers and a pool of reduction workers:
//! producers connect to the frontend, workers to the backend, and each
//! frame is forwarded to the next worker in rotation. Frames are treated as
//! opaque bytes so the broker works for the high-bandwidth raw-frame path
//! as well as for encoded events. A frame is never dropped: with no worker
//! connected, dispatch blocks (and the bounded queue pushes the
//! backpressure onto producers).

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::error::AppResult;
use crate::shutdown::ShutdownSignal;

type WorkerWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

/// The broker's two listening addresses.
#[derive(Clone, Debug)]
pub struct Broker {
    frontend_addr: String,
    backend_addr: String,
    queue_depth: usize,
}

impl Broker {
    /// A broker accepting producers on `frontend_addr` and workers on
    /// `backend_addr`.
    pub fn new(frontend_addr: &str, backend_addr: &str, queue_depth: usize) -> Self {
        Self {
            frontend_addr: frontend_addr.to_string(),
            backend_addr: backend_addr.to_string(),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Run until shutdown. Producer connections each get a reader task
    /// feeding one bounded queue; this loop owns the worker pool.
    pub async fn run(self, mut shutdown: ShutdownSignal) -> AppResult<()> {
        let frontend = TcpListener::bind(&self.frontend_addr).await?;
        let backend = TcpListener::bind(&self.backend_addr).await?;
        info!(
            frontend = %self.frontend_addr,
            backend = %self.backend_addr,
            "broker listening"
        );

        let (frame_tx, mut frame_rx) = mpsc::channel::<Bytes>(self.queue_depth);
        let mut workers: Vec<WorkerWriter> = Vec::new();
        let mut next = 0usize;

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,

                accepted = frontend.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "producer connected");
                    let tx = frame_tx.clone();
                    tokio::spawn(async move {
                        let mut frames = FramedRead::new(stream, super::wire_codec());
                        while let Some(frame) = frames.next().await {
                            match frame {
                                Ok(bytes) => {
                                    if tx.send(bytes.freeze()).await.is_err() {
                                        break;
                                    }
                                }
                                Err(err) => {
                                    warn!(error = %err, "producer read failed");
                                    break;
                                }
                            }
                        }
                        debug!(%peer, "producer disconnected");
                    });
                }

                accepted = backend.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "worker connected");
                    let (_read, write) = stream.into_split();
                    workers.push(FramedWrite::new(write, super::wire_codec()));
                }

                frame = frame_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let mut undelivered = Some(frame);
                    while let Some(bytes) = undelivered.take() {
                        if workers.is_empty() {
                            // No worker yet: wait for one rather than drop.
                            tokio::select! {
                                _ = shutdown.recv() => return Ok(()),
                                accepted = backend.accept() => {
                                    let (stream, peer) = accepted?;
                                    debug!(%peer, "worker connected");
                                    let (_read, write) = stream.into_split();
                                    workers.push(FramedWrite::new(write, super::wire_codec()));
                                }
                            }
                            undelivered = Some(bytes);
                            continue;
                        }
                        let idx = next % workers.len();
                        match workers[idx].send(bytes.clone()).await {
                            Ok(()) => next = next.wrapping_add(1),
                            Err(err) => {
                                warn!(error = %err, "dropping dead worker");
                                workers.remove(idx);
                                undelivered = Some(bytes);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
