//! Forwarding policy between the sink and the source

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use tracing::{debug, warn};

use crate::clock::HostTime;
use crate::endpoint::{SampleHandler, SourceEndpoint};
use crate::error::{RelayError, Result};
use crate::frame::{Frame, FramePool, TimedFrameFactory};
use crate::host::{PulledSample, SamplePayload, ScheduledOutput, SinkClient};
use crate::RelayStats;

/// Per-frame counters
#[derive(Default)]
struct Counters {
    received: AtomicU64,
    delivered: AtomicU64,
    unviewed: AtomicU64,
    pool_exhausted: AtomicU64,
    format_failures: AtomicU64,
    acknowledged: AtomicU64,
}

/// Copies producer samples into pool frames and hands them to the source.
///
/// Every accepted sample is acknowledged exactly once, whether or not a
/// viewer saw it, so a producer never stalls for lack of an audience.
pub struct Pump {
    source: Arc<SourceEndpoint>,
    pool: FramePool,
    factory: TimedFrameFactory,
    counters: CachePadded<Counters>,
}

impl Pump {
    pub fn new(source: Arc<SourceEndpoint>, pool: FramePool) -> Self {
        let factory = TimedFrameFactory::new(*pool.format());
        Self {
            source,
            pool,
            factory,
            counters: CachePadded::new(Counters::default()),
        }
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    /// Forward an already-built frame if anyone is watching, then acknowledge it.
    ///
    /// Returns whether the frame went to the source.
    pub fn on_sink_frame(&self, frame: Frame, client: &dyn SinkClient) -> bool {
        let delivered = if self.source.is_active() {
            let sessions = self.source.deliver(&frame);
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("relay_frames_delivered").increment(1);
            metrics::histogram!("relay_delivery_latency_ms")
                .record(frame.timestamp.elapsed().as_secs_f64() * 1_000.0);
            debug!(sequence = frame.sequence(), sessions, "Frame delivered");
            true
        } else {
            self.counters.unviewed.fetch_add(1, Ordering::Relaxed);
            false
        };

        self.acknowledge(client, frame.sequence());
        delivered
    }

    /// Copy `payload` into a pool buffer and stamp it.
    pub fn materialize(&self, payload: &SamplePayload, sequence: u64) -> Result<Frame> {
        let expected = self.pool.format();
        if payload.format != *expected {
            return Err(RelayError::format(format!(
                "producer sent {}, stream is {}",
                payload.format, expected
            )));
        }
        let size = payload.format.buffer_size();
        if payload.data.len() < size {
            return Err(RelayError::format(format!(
                "payload holds {} bytes, {} needs {}",
                payload.data.len(),
                payload.format,
                size
            )));
        }

        let mut buffer = self.pool.acquire()?;
        buffer[..size].copy_from_slice(&payload.data[..size]);
        self.factory
            .wrap_timed(buffer, &payload.format, sequence, payload.presentation_time)
    }

    pub fn stats(&self) -> RelayStats {
        let c = &self.counters;
        RelayStats {
            frames_received: c.received.load(Ordering::Relaxed),
            frames_delivered: c.delivered.load(Ordering::Relaxed),
            frames_unviewed: c.unviewed.load(Ordering::Relaxed),
            pool_exhausted: c.pool_exhausted.load(Ordering::Relaxed),
            format_failures: c.format_failures.load(Ordering::Relaxed),
            frames_acknowledged: c.acknowledged.load(Ordering::Relaxed),
            pool: self.pool.stats(),
        }
    }

    fn acknowledge(&self, client: &dyn SinkClient, sequence: u64) {
        client.notify_scheduled(ScheduledOutput {
            sequence,
            host_time: HostTime::now(),
        });
        self.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relay_frames_acknowledged").increment(1);
    }

    fn record_drop(&self, sequence: u64, err: &RelayError) {
        match err {
            RelayError::PoolExhausted { .. } => {
                self.counters.pool_exhausted.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("relay_pool_exhausted").increment(1);
            }
            _ => {
                self.counters.format_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        metrics::counter!("relay_frames_dropped").increment(1);
        warn!(sequence, "Dropping frame: {}", err);
    }
}

impl SampleHandler for Pump {
    fn handle_sample(&self, sample: PulledSample, client: &dyn SinkClient) {
        let Some(payload) = sample.payload else {
            return;
        };
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        if !self.source.is_active() {
            // Nobody watching: skip the copy, still let the producer move on
            self.counters.unviewed.fetch_add(1, Ordering::Relaxed);
            self.acknowledge(client, sample.sequence);
            return;
        }

        match self.materialize(&payload, sample.sequence) {
            Ok(frame) => {
                self.on_sink_frame(frame, client);
            }
            Err(err) => {
                self.record_drop(sample.sequence, &err);
                self.acknowledge(client, sample.sequence);
            }
        }
    }
}
