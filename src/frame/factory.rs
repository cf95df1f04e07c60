//! Turns pool buffers into timestamped frames

use std::sync::atomic::{AtomicU64, Ordering};

use super::frame::{FormatDescription, Frame, FrameMetadata};
use super::pool::PooledBuffer;
use crate::clock::HostTime;
use crate::error::{RelayError, Result};

/// Wraps raw pixel buffers into self-describing [`Frame`]s.
pub struct TimedFrameFactory {
    format: FormatDescription,
    sequence: AtomicU64,
}

impl TimedFrameFactory {
    pub fn new(format: FormatDescription) -> Self {
        Self {
            format,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn format(&self) -> &FormatDescription {
        &self.format
    }

    /// Stamp a buffer with the current host time and the next local sequence number.
    pub fn stamp(&self, payload: PooledBuffer) -> Frame {
        let meta = FrameMetadata {
            sequence: self.next_sequence(),
            format: self.format,
            presentation_time: HostTime::now(),
        };
        Frame::new(payload, meta)
    }

    /// Stamp a buffer under an explicit format.
    pub fn wrap(&self, payload: PooledBuffer, format: &FormatDescription) -> Result<Frame> {
        self.check(&payload, format)?;
        let sequence = self.next_sequence();
        Ok(self.build(payload, *format, sequence, HostTime::now()))
    }

    /// Like [`wrap`](Self::wrap), but keeps the producer's sequence number and
    /// presentation time instead of assigning local ones.
    pub fn wrap_timed(
        &self,
        payload: PooledBuffer,
        format: &FormatDescription,
        sequence: u64,
        presentation_time: HostTime,
    ) -> Result<Frame> {
        self.check(&payload, format)?;
        Ok(self.build(payload, *format, sequence, presentation_time))
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn build(
        &self,
        payload: PooledBuffer,
        format: FormatDescription,
        sequence: u64,
        presentation_time: HostTime,
    ) -> Frame {
        Frame::new(
            payload,
            FrameMetadata {
                sequence,
                format,
                presentation_time,
            },
        )
    }

    fn check(&self, payload: &PooledBuffer, format: &FormatDescription) -> Result<()> {
        format.validate()?;
        if format.buffer_size() > payload.len() {
            return Err(RelayError::format(format!(
                "{} needs {} bytes, buffer holds {}",
                format,
                format.buffer_size(),
                payload.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FramePool, PixelFormat};

    fn setup() -> (FramePool, TimedFrameFactory) {
        let format = FormatDescription::new(32, 16, PixelFormat::Bgra32).unwrap();
        (FramePool::new(format, 4).unwrap(), TimedFrameFactory::new(format))
    }

    #[test]
    fn test_stamp_assigns_increasing_sequence_and_time() {
        let (pool, factory) = setup();
        let a = factory.stamp(pool.acquire().unwrap());
        let b = factory.stamp(pool.acquire().unwrap());
        assert_eq!(a.sequence(), 1);
        assert_eq!(b.sequence(), 2);
        assert!(b.presentation_time() >= a.presentation_time());
        assert_eq!(a.width(), 32);
    }

    #[test]
    fn test_wrap_rejects_oversized_format() {
        let (pool, factory) = setup();
        let bigger = FormatDescription::new(64, 64, PixelFormat::Bgra32).unwrap();
        let err = factory.wrap(pool.acquire().unwrap(), &bigger).unwrap_err();
        assert!(matches!(err, RelayError::FormatConstructionFailed(_)));
        // The rejected buffer went straight back to the pool
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_wrap_timed_keeps_producer_timing() {
        let (pool, factory) = setup();
        let format = *factory.format();
        let frame = factory
            .wrap_timed(pool.acquire().unwrap(), &format, 42, HostTime::from_nanos(1_000))
            .unwrap();
        assert_eq!(frame.sequence(), 42);
        assert_eq!(frame.presentation_time(), HostTime::from_nanos(1_000));
    }

    #[test]
    fn test_last_clone_releases_slot() {
        let (pool, factory) = setup();
        let frame = factory.stamp(pool.acquire().unwrap());
        let copy = frame.clone();
        assert_eq!(frame.holders(), 2);
        drop(frame);
        assert_eq!(pool.outstanding(), 1);
        drop(copy);
        assert_eq!(pool.outstanding(), 0);
    }
}
