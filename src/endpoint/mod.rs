//! Stream endpoints: the producer-facing sink and the viewer-facing source
//!
//! Both directions share the same bookkeeping, kept in [`StreamCore`]: an
//! activation reference count that never goes below zero, one fixed
//! [`StreamFormat`], and the property set reported to the host.

pub mod sink;
pub mod source;

pub use sink::{SampleHandler, SinkEndpoint};
pub use source::{SourceEndpoint, ViewerId};

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::frame::FormatDescription;

/// Which way frames flow through an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamDirection {
    /// Frames flow in from a producer
    Sink,
    /// Frames flow out to viewers
    Source,
}

impl fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamDirection::Sink => write!(f, "sink"),
            StreamDirection::Source => write!(f, "source"),
        }
    }
}

/// Result of one reference count mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation {
    pub previous: usize,
    pub current: usize,
}

impl Activation {
    pub fn became_active(&self) -> bool {
        self.previous == 0 && self.current > 0
    }

    pub fn became_inactive(&self) -> bool {
        self.previous > 0 && self.current == 0
    }

    /// A stop arrived while nothing was started
    pub fn was_clamped(&self) -> bool {
        self.previous == 0 && self.current == 0
    }
}

/// Activation reference count, clamped at zero
#[derive(Debug, Default)]
pub struct ActivationCount(AtomicUsize);

impl ActivationCount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) -> Activation {
        let previous = self.0.fetch_add(1, Ordering::AcqRel);
        Activation {
            previous,
            current: previous + 1,
        }
    }

    /// `max(0, count - 1)`
    pub fn decrement(&self) -> Activation {
        let previous = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            // The closure never returns None
            .unwrap_or_else(|n| n);
        Activation {
            previous,
            current: previous.saturating_sub(1),
        }
    }

    /// Drop straight to zero, returning the count that was discarded
    pub fn reset(&self) -> usize {
        self.0.swap(0, Ordering::AcqRel)
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.get() > 0
    }
}

/// The single format an endpoint advertises
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamFormat {
    pub description: FormatDescription,
    pub max_frame_duration: Duration,
    pub min_frame_duration: Duration,
}

/// Properties reported to the host for one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamProperties {
    pub active_format_index: usize,
    pub frame_duration: Duration,
    /// Sink only
    pub sink_queue_size: Option<usize>,
    /// Sink only
    pub sink_buffers_required_for_startup: Option<usize>,
}

/// Identity of a stream as registered with the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub name: String,
    pub id: Uuid,
    pub direction: StreamDirection,
}

/// State shared by both endpoint kinds
#[derive(Debug)]
pub(crate) struct StreamCore {
    pub info: StreamInfo,
    pub format: StreamFormat,
    pub activation: ActivationCount,
    active_format_index: AtomicUsize,
}

impl StreamCore {
    pub fn new(info: StreamInfo, format: StreamFormat) -> Self {
        Self {
            info,
            format,
            activation: ActivationCount::new(),
            active_format_index: AtomicUsize::new(0),
        }
    }

    pub fn formats(&self) -> &[StreamFormat] {
        std::slice::from_ref(&self.format)
    }

    pub fn active_format_index(&self) -> usize {
        self.active_format_index.load(Ordering::Relaxed)
    }

    pub fn set_active_format_index(&self, index: usize) {
        if index >= self.formats().len() {
            error!(
                stream = %self.info.name,
                index,
                "Invalid format index, keeping {}",
                self.active_format_index()
            );
            return;
        }
        self.active_format_index.store(index, Ordering::Relaxed);
    }

    pub fn properties(&self) -> StreamProperties {
        StreamProperties {
            active_format_index: self.active_format_index(),
            frame_duration: self.format.max_frame_duration,
            sink_queue_size: None,
            sink_buffers_required_for_startup: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    fn core() -> StreamCore {
        StreamCore::new(
            StreamInfo {
                name: "Relay Source".into(),
                id: Uuid::new_v4(),
                direction: StreamDirection::Source,
            },
            StreamFormat {
                description: FormatDescription::new(1280, 720, PixelFormat::Bgra32).unwrap(),
                max_frame_duration: Duration::from_secs(1) / 30,
                min_frame_duration: Duration::from_secs(1) / 30,
            },
        )
    }

    #[test]
    fn test_count_never_negative() {
        let count = ActivationCount::new();
        let t = count.decrement();
        assert!(t.was_clamped());
        assert_eq!(count.get(), 0);

        assert!(count.increment().became_active());
        assert!(!count.increment().became_active());
        assert_eq!(count.get(), 2);

        assert!(!count.decrement().became_inactive());
        assert!(count.decrement().became_inactive());
        assert!(count.decrement().was_clamped());
        assert!(!count.is_active());
    }

    #[test]
    fn test_arbitrary_start_stop_sequences() {
        // Pseudo-random walk over start/stop, checked against a saturating model
        let count = ActivationCount::new();
        let mut model: usize = 0;
        let mut seed: u32 = 0x9e37_79b9;
        for _ in 0..1_000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if seed % 3 == 0 {
                count.increment();
                model += 1;
            } else {
                count.decrement();
                model = model.saturating_sub(1);
            }
            assert_eq!(count.get(), model);
            assert_eq!(count.is_active(), model > 0);
        }
    }

    #[test]
    fn test_invalid_format_index_ignored() {
        let core = core();
        core.set_active_format_index(1);
        assert_eq!(core.active_format_index(), 0);
        core.set_active_format_index(0);
        assert_eq!(core.properties().active_format_index, 0);
        assert_eq!(core.properties().frame_duration, Duration::from_secs(1) / 30);
        assert_eq!(core.formats().len(), 1);
    }

    #[test]
    fn test_reset() {
        let count = ActivationCount::new();
        count.increment();
        count.increment();
        assert_eq!(count.reset(), 2);
        assert!(!count.is_active());
    }
}
