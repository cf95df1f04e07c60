//! In-process stand-ins for the two kinds of client process
//!
//! [`FrameFeeder`] is the producer side: a small bounded queue that answers
//! the sink's pulls. [`ChannelViewer`] is the viewer side: a session that
//! forwards delivered frames into a bounded channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use flume::{Receiver, Sender};
use tracing::{debug, warn};

use crate::frame::Frame;
use crate::host::{
    ClientIdentity, Discontinuity, PullReply, PulledSample, SamplePayload, ScheduledOutput,
    SinkClient, ViewerSession,
};

const ACK_BUFFER: usize = 256;

/// Producer-side sample queue.
///
/// `enqueue` never blocks: a sample is handed straight to a waiting pull if
/// there is one, queued otherwise, and refused once the queue is full.
pub struct FrameFeeder {
    identity: ClientIdentity,
    capacity: usize,
    state: Mutex<FeederState>,
    acks: Option<Sender<ScheduledOutput>>,
    acknowledged: AtomicU64,
}

#[derive(Default)]
struct FeederState {
    queue: VecDeque<PulledSample>,
    parked: Option<PullReply>,
    next_sequence: u64,
}

impl FrameFeeder {
    pub fn new(identity: ClientIdentity, capacity: usize) -> Arc<Self> {
        Arc::new(Self::build(identity, capacity, None))
    }

    /// Like [`new`](Self::new), also returning a stream of acknowledgments.
    pub fn with_acks(
        identity: ClientIdentity,
        capacity: usize,
    ) -> (Arc<Self>, Receiver<ScheduledOutput>) {
        let (tx, rx) = flume::bounded(ACK_BUFFER);
        (Arc::new(Self::build(identity, capacity, Some(tx))), rx)
    }

    fn build(
        identity: ClientIdentity,
        capacity: usize,
        acks: Option<Sender<ScheduledOutput>>,
    ) -> Self {
        Self {
            identity,
            capacity: capacity.max(1),
            state: Mutex::new(FeederState::default()),
            acks,
            acknowledged: AtomicU64::new(0),
        }
    }

    /// Queue a frame under the next sequence number. Returns `false` if it was refused.
    pub fn enqueue(&self, payload: SamplePayload) -> bool {
        let mut state = self.lock();
        state.next_sequence += 1;
        let sample = PulledSample::frame(state.next_sequence, payload);
        self.push(&mut state, sample)
    }

    /// Queue a sample exactly as given, empty and failed samples included.
    pub fn enqueue_sample(&self, sample: PulledSample) -> bool {
        let mut state = self.lock();
        self.push(&mut state, sample)
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True while the sink has a pull waiting on this feeder
    pub fn has_pending_pull(&self) -> bool {
        self.lock()
            .parked
            .as_ref()
            .is_some_and(|reply| !reply.is_abandoned())
    }

    pub fn acknowledged(&self) -> u64 {
        self.acknowledged.load(Ordering::Relaxed)
    }

    fn push(&self, state: &mut FeederState, sample: PulledSample) -> bool {
        if let Some(reply) = state.parked.take() {
            if !reply.is_abandoned() {
                return reply.complete(sample);
            }
        }

        if state.queue.len() >= self.capacity {
            warn!(
                client = %self.identity,
                sequence = sample.sequence,
                "Feeder queue full, refusing sample"
            );
            return false;
        }
        state.queue.push_back(sample);
        true
    }

    fn lock(&self) -> MutexGuard<'_, FeederState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SinkClient for FrameFeeder {
    fn identity(&self) -> ClientIdentity {
        self.identity.clone()
    }

    fn pull_next(&self, reply: PullReply) {
        let mut state = self.lock();
        match state.queue.pop_front() {
            Some(sample) => {
                reply.complete(sample);
            }
            None => state.parked = Some(reply),
        }
    }

    fn notify_scheduled(&self, output: ScheduledOutput) {
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
        if let Some(acks) = &self.acks {
            let _ = acks.try_send(output);
        }
    }
}

/// A frame as seen by a viewer
#[derive(Debug, Clone)]
pub struct ViewerFrame {
    pub frame: Frame,
    pub discontinuity: Discontinuity,
    pub host_time_nanos: u64,
}

/// Viewer session that pushes frames into a bounded channel.
///
/// A viewer that stops reading loses frames instead of stalling the relay.
pub struct ChannelViewer {
    tx: Sender<ViewerFrame>,
    dropped: AtomicU64,
}

impl ChannelViewer {
    pub fn new(capacity: usize) -> (Self, Receiver<ViewerFrame>) {
        let (tx, rx) = flume::bounded(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ViewerSession for ChannelViewer {
    fn deliver(&self, frame: &Frame, discontinuity: Discontinuity, host_time_nanos: u64) {
        let item = ViewerFrame {
            frame: frame.clone(),
            discontinuity,
            host_time_nanos,
        };
        if self.tx.try_send(item).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(sequence = frame.sequence(), "Viewer not keeping up, frame dropped");
        }
    }
}
