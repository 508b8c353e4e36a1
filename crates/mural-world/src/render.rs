//! Off-thread chunk rendering.
//!
//! Workers only ever see a [`PixelSnapshot`]: an `Arc` of the pixel buffer
//! taken on the simulation thread. Finished renders are sent back on the
//! channel carried by each job and applied by the owning world.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ExtendedColorType, ImageEncoder};
use mural_common::ChunkCoord;
use thiserror::Error;
use tracing::{debug, warn};

/// Render failures reported to requesters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    /// Encoder returned an error or panicked
    #[error("Chunk encode failed: {0}")]
    Encode(String),
    /// Worker pool no longer accepts jobs
    #[error("Render pool is shut down")]
    PoolClosed,
}

/// Read-only pixels of one chunk at one revision.
#[derive(Debug, Clone)]
pub struct PixelSnapshot {
    /// Source chunk
    pub coord: ChunkCoord,
    /// Chunk side in pixels
    pub size: u32,
    /// Chunk revision the pixels belong to
    pub revision: u64,
    /// RGB pixels, row-major
    pub pixels: Arc<Vec<u8>>,
}

/// Turns chunk pixels into image bytes served to clients.
pub trait ChunkEncoder: Send + Sync {
    /// Encodes `snapshot`.
    fn encode(&self, snapshot: &PixelSnapshot) -> Result<Vec<u8>, RenderError>;
}

/// Encodes chunks as RGB PNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct PngChunkEncoder;

impl ChunkEncoder for PngChunkEncoder {
    fn encode(&self, snapshot: &PixelSnapshot) -> Result<Vec<u8>, RenderError> {
        let mut out = Vec::with_capacity(snapshot.pixels.len() / 8);
        PngEncoder::new_with_quality(&mut out, CompressionType::Fast, FilterType::Adaptive)
            .write_image(
                &snapshot.pixels,
                snapshot.size,
                snapshot.size,
                ExtendedColorType::Rgb8,
            )
            .map_err(|e| RenderError::Encode(e.to_string()))?;
        Ok(out)
    }
}

/// Work item for the pool.
#[derive(Debug)]
pub struct RenderJob {
    /// Pixels to encode
    pub snapshot: PixelSnapshot,
    /// Where to send the result
    pub reply: Sender<RenderDone>,
}

/// Result of one render job.
#[derive(Debug, Clone)]
pub struct RenderDone {
    /// Rendered chunk
    pub coord: ChunkCoord,
    /// Revision of the rendered pixels
    pub revision: u64,
    /// Image bytes or the failure
    pub result: Result<Arc<[u8]>, RenderError>,
}

impl RenderDone {
    fn closed(snapshot: &PixelSnapshot) -> Self {
        Self {
            coord: snapshot.coord,
            revision: snapshot.revision,
            result: Err(RenderError::PoolClosed),
        }
    }
}

/// Fixed-size pool of encoder threads.
///
/// Dropping the pool stops the workers; jobs still queued are answered
/// with [`RenderError::PoolClosed`].
pub struct RenderPool {
    /// Job queue, cloned into every submitter
    jobs: Sender<RenderJob>,
    /// Dropped to signal shutdown
    shutdown: Option<Sender<()>>,
    /// Worker threads
    workers: Vec<JoinHandle<()>>,
}

impl RenderPool {
    /// Starts `threads` workers (at least one).
    #[must_use]
    pub fn new(threads: usize, encoder: Arc<dyn ChunkEncoder>) -> Self {
        let (jobs, job_rx) = unbounded::<RenderJob>();
        let (shutdown, shutdown_rx) = bounded::<()>(0);

        let workers = (0..threads.max(1))
            .filter_map(|i| {
                let job_rx = job_rx.clone();
                let shutdown_rx = shutdown_rx.clone();
                let encoder = Arc::clone(&encoder);
                std::thread::Builder::new()
                    .name(format!("mural-render-{i}"))
                    .spawn(move || worker_loop(&*encoder, &job_rx, &shutdown_rx))
                    .map_err(|e| warn!("Failed to spawn render worker {i}: {e}"))
                    .ok()
            })
            .collect::<Vec<_>>();

        debug!("Render pool started with {} workers", workers.len());
        Self {
            jobs,
            shutdown: Some(shutdown),
            workers,
        }
    }

    /// Handle for queueing jobs.
    #[must_use]
    pub fn submitter(&self) -> RenderSubmitter {
        RenderSubmitter {
            jobs: self.jobs.clone(),
        }
    }

    /// Number of running workers.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Stops the workers and waits for them to exit.
    pub fn shutdown(&mut self) {
        if self.shutdown.take().is_none() {
            return;
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("Render worker panicked during shutdown");
            }
        }
        debug!("Render pool stopped");
    }
}

impl Drop for RenderPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for RenderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPool")
            .field("threads", &self.workers.len())
            .finish_non_exhaustive()
    }
}

fn worker_loop(
    encoder: &dyn ChunkEncoder,
    jobs: &Receiver<RenderJob>,
    shutdown: &Receiver<()>,
) {
    loop {
        let job = select! {
            recv(jobs) -> job => job.ok(),
            recv(shutdown) -> _ => None,
        };
        match job {
            Some(job) => run_job(encoder, job),
            None => break,
        }
    }

    for job in jobs.try_iter() {
        let _ = job.reply.send(RenderDone::closed(&job.snapshot));
    }
}

fn run_job(encoder: &dyn ChunkEncoder, job: RenderJob) {
    let RenderJob { snapshot, reply } = job;
    let result = catch_unwind(AssertUnwindSafe(|| encoder.encode(&snapshot)))
        .unwrap_or_else(|_| Err(RenderError::Encode("encoder panicked".to_string())))
        .map(Arc::from);

    // Receiver gone means the world was unloaded; nothing to deliver.
    let _ = reply.send(RenderDone {
        coord: snapshot.coord,
        revision: snapshot.revision,
        result,
    });
}

/// Cloneable handle for queueing render jobs.
#[derive(Debug, Clone)]
pub struct RenderSubmitter {
    jobs: Sender<RenderJob>,
}

impl RenderSubmitter {
    /// Queues a job. Fails once every worker has exited.
    pub fn submit(&self, job: RenderJob) -> Result<(), RenderError> {
        self.jobs.send(job).map_err(|_| RenderError::PoolClosed)
    }
}

/// Answer to a chunk view request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkResponse {
    /// Encoded chunk image
    Image(Arc<[u8]>),
    /// Coordinates outside the canvas or unknown world
    NotFound,
    /// Rendering failed
    Failed,
}

/// Receives the answer to one chunk view request.
pub trait ChunkResponder: Send {
    /// True once the requester stopped waiting.
    fn is_cancelled(&self) -> bool;

    /// Delivers the answer.
    fn respond(self: Box<Self>, response: ChunkResponse);
}

/// Channel-backed [`ChunkResponder`].
#[derive(Debug)]
pub struct ChunkRequest {
    reply: Sender<ChunkResponse>,
    cancelled: Arc<AtomicBool>,
}

impl ChunkRequest {
    /// Creates a responder and the handle that waits on it.
    #[must_use]
    pub fn new() -> (Self, PendingChunk) {
        let (reply, rx) = bounded(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        (
            Self {
                reply,
                cancelled: Arc::clone(&cancelled),
            },
            PendingChunk { rx, cancelled },
        )
    }
}

impl ChunkResponder for ChunkRequest {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn respond(self: Box<Self>, response: ChunkResponse) {
        let _ = self.reply.send(response);
    }
}

/// Waiting half of a [`ChunkRequest`]. Dropping it cancels the request.
#[derive(Debug)]
pub struct PendingChunk {
    rx: Receiver<ChunkResponse>,
    cancelled: Arc<AtomicBool>,
}

impl PendingChunk {
    /// Returns the answer if it has arrived.
    #[must_use]
    pub fn try_recv(&self) -> Option<ChunkResponse> {
        self.rx.try_recv().ok()
    }

    /// Waits up to `timeout` for the answer.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ChunkResponse> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Marks the request cancelled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

impl Drop for PendingChunk {
    fn drop(&mut self) {
        self.cancel();
    }
}
