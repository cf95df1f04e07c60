//! Device lifecycle notifications
//!
//! Observers (device discovery, UI status) subscribe through
//! [`RelayDevice::subscribe_events`](super::RelayDevice::subscribe_events).
//! The channel belongs to the device and closes when it is dropped.
//! `Ready` is replayed to every subscriber of a live device, so observers
//! that attach after construction still see it first.

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use uuid::Uuid;

use crate::host::ClientIdentity;

/// Events emitted by a relay device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Device finished initialization and can be opened
    Ready {
        /// Stable identity of the device
        device_id: Uuid,
    },

    /// A producer activated the sink stream
    SinkStarted {
        /// Producer the pull loop reads from
        client: ClientIdentity,
    },

    /// Last sink reference went away
    SinkStopped,

    /// First viewer activated the source stream
    SourceStarted,

    /// Last viewer went away
    SourceStopped,

    /// Device was shut down, no further events follow
    ShutDown,
}

impl DeviceEvent {
    /// Check if this event concerns the producer side
    pub fn is_sink_event(&self) -> bool {
        matches!(self, DeviceEvent::SinkStarted { .. } | DeviceEvent::SinkStopped)
    }

    /// Check if this event concerns the viewer side
    pub fn is_source_event(&self) -> bool {
        matches!(self, DeviceEvent::SourceStarted | DeviceEvent::SourceStopped)
    }

    /// Producer identity if this is a sink start
    pub fn client(&self) -> Option<&ClientIdentity> {
        match self {
            DeviceEvent::SinkStarted { client } => Some(client),
            _ => None,
        }
    }
}

/// Receiving half of a device's event stream
pub struct EventSubscription {
    replay: Option<DeviceEvent>,
    rx: broadcast::Receiver<DeviceEvent>,
}

impl EventSubscription {
    pub(crate) fn new(
        rx: broadcast::Receiver<DeviceEvent>,
        replay: Option<DeviceEvent>,
    ) -> Self {
        Self { replay, rx }
    }

    /// Next event, waiting if none is queued.
    pub async fn recv(&mut self) -> Result<DeviceEvent, RecvError> {
        if let Some(event) = self.replay.take() {
            return Ok(event);
        }
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<DeviceEvent, TryRecvError> {
        if let Some(event) = self.replay.take() {
            return Ok(event);
        }
        self.rx.try_recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_checking() {
        let started = DeviceEvent::SinkStarted {
            client: ClientIdentity::new("feeder"),
        };
        assert!(started.is_sink_event());
        assert!(!started.is_source_event());
        assert_eq!(started.client(), Some(&ClientIdentity::new("feeder")));

        assert!(DeviceEvent::SourceStopped.is_source_event());
        assert_eq!(DeviceEvent::ShutDown.client(), None);
    }

    #[test]
    fn test_subscription_replays_before_live_events() {
        let (tx, rx) = broadcast::channel(4);
        let device_id = Uuid::new_v4();
        let mut events = EventSubscription::new(rx, Some(DeviceEvent::Ready { device_id }));
        tx.send(DeviceEvent::SourceStarted).unwrap();

        assert_eq!(events.try_recv().unwrap(), DeviceEvent::Ready { device_id });
        assert_eq!(events.try_recv().unwrap(), DeviceEvent::SourceStarted);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }
}
