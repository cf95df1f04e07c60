//! Viewer-facing endpoint

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{Activation, StreamCore, StreamFormat, StreamInfo, StreamProperties};
use crate::frame::Frame;
use crate::host::{Discontinuity, ViewerSession};

/// Handle for an attached viewer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewerId(u64);

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "viewer-{}", self.0)
    }
}

/// Outbound half of the relay.
///
/// `start`/`stop` track how many viewers currently want frames; `deliver`
/// hands a frame to every attached session.
pub struct SourceEndpoint {
    core: StreamCore,
    sessions: RwLock<Vec<(ViewerId, Arc<dyn ViewerSession>)>>,
    next_id: AtomicU64,
}

impl SourceEndpoint {
    pub fn new(info: StreamInfo, format: StreamFormat) -> Self {
        Self {
            core: StreamCore::new(info, format),
            sessions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
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

    pub fn properties(&self) -> StreamProperties {
        self.core.properties()
    }

    pub fn set_active_format_index(&self, index: usize) {
        self.core.set_active_format_index(index);
    }

    pub fn active_count(&self) -> usize {
        self.core.activation.get()
    }

    pub fn is_active(&self) -> bool {
        self.core.activation.is_active()
    }

    pub fn start(&self) -> Activation {
        let activation = self.core.activation.increment();
        if activation.became_active() {
            info!(stream = %self.core.info.name, "Source started");
        } else {
            debug!(count = activation.current, "Nested source start");
        }
        activation
    }

    /// Decrement clamped at zero; duplicate teardown notifications are no-ops.
    pub fn stop(&self) -> Activation {
        let activation = self.core.activation.decrement();
        if activation.was_clamped() {
            warn!(stream = %self.core.info.name, "Stop on an idle source, ignoring");
        } else if activation.became_inactive() {
            info!(stream = %self.core.info.name, "Source stopped");
        } else {
            debug!(count = activation.current, "Nested source stop");
        }
        activation
    }

    pub(crate) fn reset(&self) -> usize {
        self.core.activation.reset()
    }

    pub fn attach(&self, session: Arc<dyn ViewerSession>) -> ViewerId {
        let id = ViewerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, session));
        debug!(%id, "Viewer session attached");
        id
    }

    /// Returns `false` if `id` was not attached.
    pub fn detach(&self, id: ViewerId) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|(viewer, _)| *viewer != id);
        let removed = sessions.len() != before;
        if removed {
            debug!(%id, "Viewer session detached");
        }
        removed
    }

    pub(crate) fn detach_all(&self) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let count = sessions.len();
        sessions.clear();
        count
    }

    pub fn viewer_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Send `frame` to every attached session, stamped with its own
    /// presentation time. Returns how many sessions received it.
    pub fn deliver(&self, frame: &Frame) -> usize {
        // Snapshot so sessions run without the lock held
        let sessions: Vec<Arc<dyn ViewerSession>> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, session)| Arc::clone(session))
            .collect();

        let host_time_nanos = frame.presentation_time().as_nanos();
        for session in &sessions {
            session.deliver(frame, Discontinuity::NONE, host_time_nanos);
        }
        sessions.len()
    }
}
