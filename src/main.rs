//! Relaycam demo: a synthetic producer feeding the relay and a viewer counting frames

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relaycam::feeder::{ChannelViewer, FrameFeeder};
use relaycam::host::{ClientIdentity, SamplePayload};
use relaycam::{Config, FormatDescription, HostTime, RelayDevice};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("Relaycam launching...");

    // Load configuration: first argument, then RELAYCAM_CONFIG
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("RELAYCAM_CONFIG").ok())
        .map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    relaycam::CONFIG.store(Arc::new(config.clone()));

    let device = Arc::new(RelayDevice::new(config.clone())?);
    info!("Device: {:?}", device.info());

    // Viewer side
    let (viewer, frames) = ChannelViewer::new(config.pool.capacity);
    device.open_viewer(
        &ClientIdentity::with_pid("relaycam-viewer", std::process::id()),
        Arc::new(viewer),
    )?;

    let _viewer_handle = tokio::spawn(async move {
        let mut window_start = Instant::now();
        let mut count = 0u32;
        while let Ok(item) = frames.recv_async().await {
            count += 1;
            if window_start.elapsed() >= Duration::from_secs(5) {
                let fps = f64::from(count) / window_start.elapsed().as_secs_f64();
                info!(
                    sequence = item.frame.sequence(),
                    "Viewer: {:.1} fps, latency {:?}",
                    fps,
                    item.frame.timestamp.elapsed()
                );
                window_start = Instant::now();
                count = 0;
            }
        }
    });

    // Producer side
    let feeder = FrameFeeder::new(
        ClientIdentity::with_pid("relaycam-producer", std::process::id()),
        config.sink.queue_size,
    );
    device.open_sink(feeder.clone())?;

    let format = config.device.format_description()?;
    let period = config.device.max_frame_duration();
    let _producer_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        let mut index: u64 = 0;
        loop {
            ticker.tick().await;
            index += 1;
            if !feeder.enqueue(synthetic_frame(&format, index)) {
                warn!(index, "Producer queue full, frame skipped");
            }
        }
    });

    tokio::signal::ctrl_c().await?;

    let stats = device.stats();
    info!(
        "Relaycam shutting down: {} received, {} delivered, {} pool exhaustions",
        stats.frames_received, stats.frames_delivered, stats.pool_exhausted
    );
    device.shutdown();
    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relaycam=debug"));

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::prelude::*;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(tracing_subscriber::fmt::time::uptime()),
            )
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }

    #[cfg(not(feature = "profiling"))]
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
}

/// Flat gray frame whose level cycles with the frame index
fn synthetic_frame(format: &FormatDescription, index: u64) -> SamplePayload {
    let level = (index % 256) as u8;
    SamplePayload {
        data: Bytes::from(vec![level; format.buffer_size()]),
        format: *format,
        presentation_time: HostTime::now(),
    }
}
