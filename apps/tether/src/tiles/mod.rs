//! Rate-limited delivery of preview tiles.
//!
//! The daemon's receive buffer is small; tiles are therefore drained
//! strictly FIFO, one capture in flight, with an enforced delay between
//! sends. A short debounce before the first dispatch lets a burst of
//! closely-spaced requests coalesce into the queue before draining
//! starts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::sleep;

use crate::host::TileCapture;
use crate::protocol::{frame_tile, SourceRect, TILE_TYPE_PREVIEW};
use crate::session::channel::SessionChannel;
use transport_queue::{Fifo, Queue};

/// Window between popping a tile and sending the next one.
pub const TILE_SEND_DELAY: Duration = Duration::from_millis(200);
/// Coalescing delay before the first dispatch of a burst.
pub const TILE_START_DEBOUNCE: Duration = Duration::from_millis(50);

/// One vertical slice of a stitched scrolling capture: `height` source
/// rows starting at `src_y`, rendered at `dst_y` in the output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureBand {
    pub src_y: f64,
    pub dst_y: f64,
    pub height: f64,
}

/// Paired [source-span, destination-span] ranges describing how
/// disjoint vertical bands of the document map into the capture
/// output.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionRemap {
    pub src: Vec<[f64; 2]>,
    pub dest: Vec<[f64; 2]>,
}

impl SectionRemap {
    /// Clip the remap table against the requested source region. Bands
    /// entirely outside the region are dropped; a band straddling the
    /// region edge is trimmed and its destination offset shifted by
    /// the trimmed amount.
    pub fn bands_for(&self, region: &SourceRect) -> Vec<CaptureBand> {
        let region_top = region.y;
        let region_bottom = region.y + region.height;
        self.src
            .iter()
            .zip(self.dest.iter())
            .filter_map(|(src, dest)| {
                let start = src[0].max(region_top);
                let end = src[1].min(region_bottom);
                if end <= start {
                    return None;
                }
                Some(CaptureBand {
                    src_y: start,
                    dst_y: dest[0] + (start - src[0]),
                    height: end - start,
                })
            })
            .collect()
    }
}

/// A deferred screen-capture job.
#[derive(Debug, Clone, PartialEq)]
pub struct TileRequest {
    pub size: [u32; 2],
    pub region: SourceRect,
    pub request_id: u8,
    pub remap: Option<SectionRemap>,
}

/// Destination of framed tile payloads; the session channel in
/// production, a recorder in tests.
pub trait TileSink: Send + Sync {
    fn send_tile(&self, payload: Bytes);
}

impl TileSink for SessionChannel {
    fn send_tile(&self, payload: Bytes) {
        self.send_binary(payload);
    }
}

struct DispatcherShared {
    queue: Mutex<Fifo<TileRequest>>,
    draining: AtomicBool,
    capture: Arc<dyn TileCapture>,
    sink: Arc<dyn TileSink>,
    start_debounce: Duration,
    send_delay: Duration,
}

/// FIFO, one-in-flight tile delivery loop.
#[derive(Clone)]
pub struct TileDispatcher {
    shared: Arc<DispatcherShared>,
}

impl TileDispatcher {
    pub fn new(capture: Arc<dyn TileCapture>, sink: Arc<dyn TileSink>) -> Self {
        Self::with_pacing(capture, sink, TILE_START_DEBOUNCE, TILE_SEND_DELAY)
    }

    pub fn with_pacing(
        capture: Arc<dyn TileCapture>,
        sink: Arc<dyn TileSink>,
        start_debounce: Duration,
        send_delay: Duration,
    ) -> Self {
        TileDispatcher {
            shared: Arc::new(DispatcherShared {
                queue: Mutex::new(Fifo::new()),
                draining: AtomicBool::new(false),
                capture,
                sink,
                start_debounce,
                send_delay,
            }),
        }
    }

    /// Queue a tile job and make sure a drain loop is scheduled.
    pub fn enqueue(&self, request: TileRequest) {
        self.shared.queue.lock().push(request);
        if !self.shared.draining.swap(true, Ordering::AcqRel) {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                sleep(shared.start_debounce).await;
                drain(shared).await;
            });
        }
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

async fn drain(shared: Arc<DispatcherShared>) {
    loop {
        let request = shared.queue.lock().pop();
        let Some(request) = request else {
            shared.draining.store(false, Ordering::Release);
            // An enqueue racing the handoff may have seen the loop as
            // still running; pick its work up instead of stranding it.
            if shared.queue.lock().is_empty() || shared.draining.swap(true, Ordering::AcqRel) {
                return;
            }
            continue;
        };

        let bands = request
            .remap
            .as_ref()
            .map(|remap| remap.bands_for(&request.region));
        match shared.capture.capture(
            request.size,
            request.region,
            request.request_id,
            bands.as_deref(),
        ) {
            Ok(pixels) => {
                shared
                    .sink
                    .send_tile(frame_tile(TILE_TYPE_PREVIEW, request.request_id, &pixels));
            }
            Err(err) => {
                // One failed capture never aborts the loop.
                tracing::warn!(request_id = request.request_id, %err, "tile capture failed, skipping");
            }
        }

        sleep(shared.send_delay).await;
    }
}
