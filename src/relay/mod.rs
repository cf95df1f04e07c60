//! Relay orchestration
//!
//! ```text
//!  producer ──pull──► SinkEndpoint ──sample──► Pump ──frame──► SourceEndpoint ──► viewers
//!      ▲                                        │
//!      └──────────── notify_scheduled ──────────┘
//! ```
//!
//! [`RelayDevice`] wires the two endpoints to one [`FramePool`](crate::FramePool)
//! and owns the activation bookkeeping for both directions.

pub mod device;
pub mod events;
pub mod pump;

pub use device::{DeviceInfo, RelayDevice, RelayDeviceBuilder, TransportType};
pub use events::{DeviceEvent, EventSubscription};
pub use pump::Pump;
