//! Producer-facing endpoint and its pull loop

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::{Activation, StreamCore, StreamFormat, StreamInfo, StreamProperties};
use crate::host::{ClientIdentity, PullReply, PulledSample, SinkClient};
use crate::SinkConfig;

/// Receives every non-empty sample the pull loop collects.
///
/// Implementors own the forwarding policy and the acknowledgment back to
/// `client`; the sink only keeps the pulls coming.
pub trait SampleHandler: Send + Sync + 'static {
    fn handle_sample(&self, sample: PulledSample, client: &dyn SinkClient);
}

/// Flag and generation consulted by the pull loop at every iteration boundary
#[derive(Debug, Default)]
struct LoopState {
    started: AtomicBool,
    generation: AtomicU64,
}

impl LoopState {
    fn is_current(&self, generation: u64) -> bool {
        self.started.load(Ordering::Acquire)
            && self.generation.load(Ordering::Acquire) == generation
    }
}

/// Inbound half of the relay.
///
/// The first `start` launches a pull loop that keeps exactly one pull
/// outstanding against the producer. Nested starts only bump the reference
/// count. The loop is told to stop when the count returns to zero; a pull
/// already in flight at that point is discarded when it lands.
pub struct SinkEndpoint {
    core: StreamCore,
    config: SinkConfig,
    state: Arc<LoopState>,
    /// Client recorded by the last successful authorization
    authorized: Mutex<Option<Arc<dyn SinkClient>>>,
    /// Client the running loop pulls from
    client: Mutex<Option<Arc<dyn SinkClient>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    handler: Arc<dyn SampleHandler>,
    runtime: Handle,
}

impl SinkEndpoint {
    pub fn new(
        info: StreamInfo,
        format: StreamFormat,
        config: SinkConfig,
        handler: Arc<dyn SampleHandler>,
        runtime: Handle,
    ) -> Self {
        Self {
            core: StreamCore::new(info, format),
            config,
            state: Arc::new(LoopState::default()),
            authorized: Mutex::new(None),
            client: Mutex::new(None),
            task: Mutex::new(None),
            handler,
            runtime,
        }
    }

    pub fn info(&self) -> &StreamInfo {
        &self.core.info
    }

    pub fn formats(&self) -> &[StreamFormat] {
        self.core.formats()
    }

    pub fn max_frame_duration(&self) -> Duration {
        self.core.format.max_frame_duration
    }

    pub fn active_count(&self) -> usize {
        self.core.activation.get()
    }

    pub fn is_active(&self) -> bool {
        self.core.activation.is_active()
    }

    /// True while the pull loop is supposed to be running
    pub fn is_started(&self) -> bool {
        self.state.started.load(Ordering::Acquire)
    }

    /// Identity of the producer the loop is pulling from, `None` while stopped
    pub fn client(&self) -> Option<ClientIdentity> {
        lock(&self.client).as_ref().map(|c| c.identity())
    }

    pub fn properties(&self) -> StreamProperties {
        StreamProperties {
            sink_queue_size: Some(self.config.queue_size),
            sink_buffers_required_for_startup: Some(self.config.buffers_required_for_startup),
            ..self.core.properties()
        }
    }

    pub fn set_active_format_index(&self, index: usize) {
        self.core.set_active_format_index(index);
    }

    /// Remember `client` for a following [`start_authorized`](Self::start_authorized).
    pub fn record_authorized(&self, client: Arc<dyn SinkClient>) {
        *lock(&self.authorized) = Some(client);
    }

    /// Start with the client recorded at authorization time.
    ///
    /// Returns `None` when no client was ever authorized; the count is left alone.
    pub fn start_authorized(&self) -> Option<Activation> {
        let client = lock(&self.authorized).clone();
        match client {
            Some(client) => Some(self.start(client)),
            None => {
                warn!(
                    stream = %self.core.info.name,
                    "Start requested before any client was authorized"
                );
                None
            }
        }
    }

    /// Activate the sink for `client`.
    #[instrument(skip_all, fields(stream = %self.core.info.name))]
    pub fn start(&self, client: Arc<dyn SinkClient>) -> Activation {
        let mut task = lock(&self.task);
        let activation = self.core.activation.increment();

        if !activation.became_active() {
            debug!(count = activation.current, "Nested sink start");
            return activation;
        }

        let generation = self.state.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.started.store(true, Ordering::Release);
        *lock(&self.client) = Some(Arc::clone(&client));

        info!(client = %client.identity(), generation, "Sink started");

        let handle = self.runtime.spawn(pull_loop(
            Arc::clone(&self.state),
            generation,
            client,
            Arc::clone(&self.handler),
            self.core.format.max_frame_duration,
        ));
        if let Some(previous) = task.replace(handle) {
            // Superseded generation; it would exit on its own at the next check
            previous.abort();
        }

        activation
    }

    /// Deactivate once. The loop stops when the count reaches zero.
    #[instrument(skip_all, fields(stream = %self.core.info.name))]
    pub fn stop(&self) -> Activation {
        let _task = lock(&self.task);
        let activation = self.core.activation.decrement();

        if activation.was_clamped() {
            warn!("Stop on a sink that was never started, ignoring");
        } else if activation.became_inactive() {
            self.state.started.store(false, Ordering::Release);
            let client = lock(&self.client).take();
            info!(client = ?client.map(|c| c.identity()), "Sink stopped");
        } else {
            debug!(count = activation.current, "Nested sink stop");
        }

        activation
    }

    /// Tear everything down regardless of the count.
    pub(crate) fn shutdown(&self) {
        let mut task = lock(&self.task);
        self.core.activation.reset();
        self.state.started.store(false, Ordering::Release);
        if let Some(handle) = task.take() {
            handle.abort();
        }
        lock(&self.client).take();
        lock(&self.authorized).take();
    }
}

impl Drop for SinkEndpoint {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
    }
}

async fn pull_loop(
    state: Arc<LoopState>,
    generation: u64,
    client: Arc<dyn SinkClient>,
    handler: Arc<dyn SampleHandler>,
    idle_backoff: Duration,
) {
    debug!(generation, "Pull loop running");

    while state.is_current(generation) {
        let (reply, rx) = PullReply::channel();
        client.pull_next(reply);

        let outcome = rx.recv_async().await;

        if !state.is_current(generation) {
            debug!(generation, "Sink stopped while pull was in flight, discarding");
            break;
        }

        match outcome {
            Ok(sample) => {
                if let Some(err) = &sample.error {
                    warn!(sequence = sample.sequence, "Producer reported error: {}", err);
                }
                if sample.payload.is_none() {
                    // End of stream for this cycle only; the producer may recover
                    tokio::task::yield_now().await;
                    continue;
                }
                handler.handle_sample(sample, client.as_ref());
            }
            Err(_) => {
                debug!("Producer dropped the pull without answering");
                tokio::time::sleep(idle_backoff).await;
            }
        }
    }

    debug!(generation, "Pull loop finished");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
