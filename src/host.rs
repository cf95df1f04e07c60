//! Boundary types shared with the hosting runtime.
//!
//! The host owns the client processes: it hands the relay a [`SinkClient`]
//! when a producer opens the sink stream and a [`ViewerSession`] for every
//! viewer of the source stream. Everything here is deliberately small; the
//! relay treats host structures as opaque beyond these fields.

use std::fmt;
use std::ops::BitOr;

use bytes::Bytes;

use crate::clock::HostTime;
use crate::endpoint::StreamDirection;
use crate::frame::{FormatDescription, Frame};

/// Who is asking to open a stream
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    pub name: String,
    pub pid: Option<u32>,
}

impl ClientIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pid: None,
        }
    }

    pub fn with_pid(name: impl Into<String>, pid: u32) -> Self {
        Self {
            name: name.into(),
            pid: Some(pid),
        }
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "{}[{}]", self.name, pid),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Discontinuity flags attached to a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Discontinuity(u32);

impl Discontinuity {
    pub const NONE: Discontinuity = Discontinuity(0);
    pub const UNKNOWN: Discontinuity = Discontinuity(1 << 0);
    pub const TIME: Discontinuity = Discontinuity(1 << 1);
    pub const SAMPLE_DROPPED: Discontinuity = Discontinuity(1 << 6);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Discontinuity) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Discontinuity {
    type Output = Discontinuity;

    fn bitor(self, rhs: Self) -> Self {
        Discontinuity(self.0 | rhs.0)
    }
}

/// Pixel data a producer hands over on one pull
#[derive(Debug, Clone)]
pub struct SamplePayload {
    pub data: Bytes,
    pub format: FormatDescription,
    pub presentation_time: HostTime,
}

/// Everything a pull callback receives
#[derive(Debug, Clone)]
pub struct PulledSample {
    /// `None` means end-of-stream for this pull cycle only
    pub payload: Option<SamplePayload>,
    pub sequence: u64,
    pub discontinuity: Discontinuity,
    pub has_more: bool,
    pub error: Option<String>,
}

impl PulledSample {
    pub fn frame(sequence: u64, payload: SamplePayload) -> Self {
        Self {
            payload: Some(payload),
            sequence,
            discontinuity: Discontinuity::NONE,
            has_more: true,
            error: None,
        }
    }

    pub fn empty(sequence: u64) -> Self {
        Self {
            payload: None,
            sequence,
            discontinuity: Discontinuity::NONE,
            has_more: false,
            error: None,
        }
    }

    pub fn failed(sequence: u64, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::empty(sequence)
        }
    }
}

/// Continuation for exactly one outstanding pull.
///
/// The host completes it whenever the next sample is ready, from any thread.
/// Dropping it without completing counts as an empty pull.
#[derive(Debug)]
pub struct PullReply {
    tx: flume::Sender<PulledSample>,
}

impl PullReply {
    pub(crate) fn channel() -> (Self, flume::Receiver<PulledSample>) {
        let (tx, rx) = flume::bounded(1);
        (Self { tx }, rx)
    }

    /// Deliver the sample. Returns `false` if the pull loop already went away.
    pub fn complete(self, sample: PulledSample) -> bool {
        self.tx.try_send(sample).is_ok()
    }

    /// True once the pull loop that issued this reply has stopped listening.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_disconnected()
    }
}

/// Acknowledgment sent to the producer after each accepted sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledOutput {
    pub sequence: u64,
    pub host_time: HostTime,
}

impl ScheduledOutput {
    pub fn host_time_nanos(&self) -> u64 {
        self.host_time.as_nanos()
    }
}

/// Producer process as seen from the sink stream
pub trait SinkClient: Send + Sync + 'static {
    fn identity(&self) -> ClientIdentity;

    /// Ask for the next sample. Must not block; complete `reply` later.
    fn pull_next(&self, reply: PullReply);

    /// Tell the producer a sample was scheduled.
    fn notify_scheduled(&self, output: ScheduledOutput);
}

/// One viewer attached to the source stream
pub trait ViewerSession: Send + Sync {
    fn deliver(&self, frame: &Frame, discontinuity: Discontinuity, host_time_nanos: u64);
}

/// Decides whether a client may start a stream
pub trait Authorizer: Send + Sync {
    fn authorize(&self, client: &ClientIdentity, direction: StreamDirection) -> bool;
}

/// Default policy: everyone is welcome
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _client: &ClientIdentity, _direction: StreamDirection) -> bool {
        true
    }
}

impl<F> Authorizer for F
where
    F: Fn(&ClientIdentity, StreamDirection) -> bool + Send + Sync,
{
    fn authorize(&self, client: &ClientIdentity, direction: StreamDirection) -> bool {
        self(client, direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discontinuity_flags() {
        let flags = Discontinuity::TIME | Discontinuity::SAMPLE_DROPPED;
        assert!(flags.contains(Discontinuity::TIME));
        assert!(!flags.contains(Discontinuity::UNKNOWN));
        assert!(Discontinuity::NONE.is_empty());
    }

    #[test]
    fn test_reply_after_loop_gone() {
        let (reply, rx) = PullReply::channel();
        drop(rx);
        assert!(reply.is_abandoned());
        assert!(!reply.complete(PulledSample::empty(1)));
    }

    #[test]
    fn test_closure_authorizer() {
        let only_obs = |client: &ClientIdentity, _: StreamDirection| client.name == "obs";
        assert!(only_obs.authorize(&ClientIdentity::new("obs"), StreamDirection::Source));
        assert!(!only_obs.authorize(&ClientIdentity::new("zoom"), StreamDirection::Source));
        assert!(AllowAll.authorize(&ClientIdentity::with_pid("zoom", 7), StreamDirection::Sink));
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(ClientIdentity::with_pid("obs", 42).to_string(), "obs[42]");
        assert_eq!(ClientIdentity::new("obs").to_string(), "obs");
    }
}
