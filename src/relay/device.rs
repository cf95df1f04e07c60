//! The virtual device: one sink, one source, one pool

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::events::{DeviceEvent, EventSubscription};
use super::pump::Pump;
use crate::endpoint::{SinkEndpoint, SourceEndpoint, StreamDirection, StreamInfo, ViewerId};
use crate::error::{RelayError, Result};
use crate::frame::{Frame, FramePool};
use crate::host::{AllowAll, Authorizer, ClientIdentity, SinkClient, ViewerSession};
use crate::{Config, RelayStats};

const EVENT_CAPACITY: usize = 32;

/// How the device is attached to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Virtual,
}

/// Read-only device metadata derived from configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub manufacturer: String,
    pub name: String,
    pub model: String,
    pub device_id: Uuid,
    pub transport: TransportType,
    pub source: StreamInfo,
    pub sink: StreamInfo,
}

/// Builder for [`RelayDevice`]
pub struct RelayDeviceBuilder {
    config: Config,
    authorizer: Arc<dyn Authorizer>,
    runtime: Option<Handle>,
}

impl RelayDeviceBuilder {
    /// Replace the default allow-everyone policy.
    pub fn authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authorizer = Arc::new(authorizer);
        self
    }

    /// Runtime the sink pull loop runs on. Defaults to the current one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    #[instrument(skip_all, fields(device = %self.config.device.name))]
    pub fn build(self) -> Result<RelayDevice> {
        let Self {
            config,
            authorizer,
            runtime,
        } = self;

        if let Err(err) = config.validate() {
            error!("Refusing to start device: {}", err);
            return Err(err);
        }

        let runtime = match runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| RelayError::NoRuntime)?,
        };

        let device = &config.device;
        let stream_format = device.stream_format()?;
        let pool = FramePool::new(stream_format.description, config.pool.capacity)
            .map_err(|err| {
                error!("Frame pool could not be created: {}", err);
                err
            })?;

        let info = DeviceInfo {
            manufacturer: device.manufacturer.clone(),
            name: device.name.clone(),
            model: device.model.clone(),
            device_id: device.device_id,
            transport: TransportType::Virtual,
            source: StreamInfo {
                name: device.source_name.clone(),
                id: device.source_id,
                direction: StreamDirection::Source,
            },
            sink: StreamInfo {
                name: device.sink_name.clone(),
                id: device.sink_id,
                direction: StreamDirection::Sink,
            },
        };

        let source = Arc::new(SourceEndpoint::new(info.source.clone(), stream_format));
        let pump = Arc::new(Pump::new(Arc::clone(&source), pool));
        let sink = SinkEndpoint::new(
            info.sink.clone(),
            stream_format,
            config.sink,
            pump.clone(),
            runtime,
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!(
            "Relay device ready: {} ({}, {} fps, pool of {})",
            info.name, stream_format.description, device.frame_rate, config.pool.capacity
        );

        Ok(RelayDevice {
            info,
            config,
            sink,
            source,
            pump,
            authorizer,
            events,
            ready: AtomicBool::new(true),
        })
    }
}

/// A virtual camera relaying frames from one producer to any number of viewers.
///
/// Producer and viewer activations are counted independently. Frames only
/// flow while the sink is started, and only reach viewers while the source
/// count is above zero; the producer is acknowledged either way.
pub struct RelayDevice {
    info: DeviceInfo,
    config: Config,
    sink: SinkEndpoint,
    source: Arc<SourceEndpoint>,
    pump: Arc<Pump>,
    authorizer: Arc<dyn Authorizer>,
    events: broadcast::Sender<DeviceEvent>,
    /// Cleared by shutdown
    ready: AtomicBool,
}

impl RelayDevice {
    pub fn builder(config: Config) -> RelayDeviceBuilder {
        RelayDeviceBuilder {
            config,
            authorizer: Arc::new(AllowAll),
            runtime: None,
        }
    }

    /// Build with the default authorization policy on the current runtime.
    pub fn new(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sink(&self) -> &SinkEndpoint {
        &self.sink
    }

    pub fn source(&self) -> &SourceEndpoint {
        &self.source
    }

    pub fn pool(&self) -> &FramePool {
        self.pump.pool()
    }

    pub fn stats(&self) -> RelayStats {
        self.pump.stats()
    }

    /// Lifecycle events from now on, preceded by `Ready` while the device is live.
    pub fn subscribe_events(&self) -> EventSubscription {
        let rx = self.events.subscribe();
        let replay = self
            .ready
            .load(Ordering::Acquire)
            .then(|| DeviceEvent::Ready {
                device_id: self.info.device_id,
            });
        EventSubscription::new(rx, replay)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Authorization hook consulted before any stream is opened.
    pub fn authorize(&self, client: &ClientIdentity, direction: StreamDirection) -> bool {
        let allowed = self.authorizer.authorize(client, direction);
        if !allowed {
            warn!(%client, %direction, "Client refused by authorization policy");
        }
        allowed
    }

    /// Host authorization step for the sink; remembers the client on success.
    pub fn authorize_sink(&self, client: Arc<dyn SinkClient>) -> bool {
        if !self.authorize(&client.identity(), StreamDirection::Sink) {
            return false;
        }
        self.sink.record_authorized(client);
        true
    }

    /// Host start step for the sink, using the client from
    /// [`authorize_sink`](Self::authorize_sink).
    ///
    /// Returns `false` when no client was authorized first.
    pub fn start_sink(&self) -> bool {
        match self.sink.start_authorized() {
            Some(activation) => {
                if activation.became_active() {
                    self.emit_sink_started();
                }
                true
            }
            None => false,
        }
    }

    /// Authorize and start the sink in one step.
    pub fn open_sink(&self, client: Arc<dyn SinkClient>) -> Result<()> {
        let identity = client.identity();
        if !self.authorize(&identity, StreamDirection::Sink) {
            return Err(RelayError::Unauthorized {
                client: identity.to_string(),
                direction: StreamDirection::Sink,
            });
        }
        if self.sink.start(client).became_active() {
            self.emit_sink_started();
        }
        Ok(())
    }

    pub fn stop_sink(&self) {
        if self.sink.stop().became_inactive() {
            let _ = self.events.send(DeviceEvent::SinkStopped);
        }
    }

    pub fn start_source(&self) {
        if self.source.start().became_active() {
            let _ = self.events.send(DeviceEvent::SourceStarted);
        }
    }

    pub fn stop_source(&self) {
        if self.source.stop().became_inactive() {
            let _ = self.events.send(DeviceEvent::SourceStopped);
        }
    }

    /// Authorize a viewer, attach its session and count it as active.
    pub fn open_viewer(
        &self,
        client: &ClientIdentity,
        session: Arc<dyn ViewerSession>,
    ) -> Result<ViewerId> {
        if !self.authorize(client, StreamDirection::Source) {
            return Err(RelayError::Unauthorized {
                client: client.to_string(),
                direction: StreamDirection::Source,
            });
        }
        let id = self.source.attach(session);
        self.start_source();
        info!(%client, %id, "Viewer opened");
        Ok(id)
    }

    /// Detach a viewer opened with [`open_viewer`](Self::open_viewer).
    ///
    /// Closing an unknown or already closed viewer is logged and ignored.
    pub fn close_viewer(&self, id: ViewerId) {
        if self.source.detach(id) {
            self.stop_source();
            info!(%id, "Viewer closed");
        } else {
            warn!(%id, "Close for unknown viewer, ignoring");
        }
    }

    /// Forwarding policy for an already-built frame; see [`Pump::on_sink_frame`].
    pub fn on_sink_frame(&self, frame: Frame, client: &dyn SinkClient) -> bool {
        self.pump.on_sink_frame(frame, client)
    }

    /// Stop relaying, drop every viewer and reset both counts.
    #[instrument(skip_all, fields(device = %self.info.name))]
    pub fn shutdown(&self) {
        self.ready.store(false, Ordering::Release);
        self.sink.shutdown();
        self.source.reset();
        let viewers = self.source.detach_all();
        info!(viewers, "Relay device shut down");
        let _ = self.events.send(DeviceEvent::ShutDown);
    }

    fn emit_sink_started(&self) {
        if let Some(client) = self.sink.client() {
            let _ = self.events.send(DeviceEvent::SinkStarted { client });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeder::{ChannelViewer, FrameFeeder};
    use crate::PixelFormat;
    use std::time::Duration;

    fn small_config() -> Config {
        let mut config = Config::default();
        config.device.width = 32;
        config.device.height = 16;
        config.device.format = PixelFormat::Bgra32;
        config
    }

    #[tokio::test]
    async fn test_invalid_config_fails_startup() {
        let mut config = small_config();
        config.pool.capacity = 0;
        let err = RelayDevice::new(config).err().expect("startup should fail");
        assert!(matches!(err, RelayError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_requires_runtime() {
        let err = RelayDevice::new(small_config()).err().expect("no runtime");
        assert!(matches!(err, RelayError::NoRuntime));
    }

    #[tokio::test]
    async fn test_device_info_from_config() {
        let config = small_config();
        let device = RelayDevice::new(config.clone()).unwrap();
        let info = device.info();
        assert_eq!(info.device_id, config.device.device_id);
        assert_eq!(info.transport, TransportType::Virtual);
        assert_eq!(info.sink.direction, StreamDirection::Sink);
        assert_eq!(info.source.id, config.device.source_id);
        assert_eq!(device.pool().capacity(), 3);
    }

    #[tokio::test]
    async fn test_authorization_policy_applies_to_both_directions() {
        let device = RelayDevice::builder(small_config())
            .authorizer(|client: &ClientIdentity, _: StreamDirection| client.name != "intruder")
            .build()
            .unwrap();

        let (viewer, _rx) = ChannelViewer::new(4);
        let err = device
            .open_viewer(&ClientIdentity::new("intruder"), Arc::new(viewer))
            .unwrap_err();
        assert!(matches!(err, RelayError::Unauthorized { .. }));
        assert_eq!(device.source().active_count(), 0);

        let feeder = FrameFeeder::new(ClientIdentity::new("intruder"), 1);
        assert!(!device.authorize_sink(feeder.clone()));
        assert!(!device.start_sink());
        assert!(device.open_sink(feeder).is_err());
        assert_eq!(device.sink().active_count(), 0);
    }

    #[tokio::test]
    async fn test_lifecycle_events() {
        let device = RelayDevice::new(small_config()).unwrap();
        let mut events = device.subscribe_events();

        let feeder = FrameFeeder::new(ClientIdentity::new("feeder"), 1);
        assert!(device.authorize_sink(feeder));
        assert!(device.start_sink());
        let (viewer, _rx) = ChannelViewer::new(4);
        let id = device
            .open_viewer(&ClientIdentity::new("viewer"), Arc::new(viewer))
            .unwrap();
        device.close_viewer(id);
        device.close_viewer(id);
        device.stop_sink();
        device.shutdown();

        let mut seen = Vec::new();
        while let Ok(Ok(event)) =
            tokio::time::timeout(Duration::from_millis(50), events.recv()).await
        {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                DeviceEvent::Ready {
                    device_id: device.info().device_id
                },
                DeviceEvent::SinkStarted {
                    client: ClientIdentity::new("feeder")
                },
                DeviceEvent::SourceStarted,
                DeviceEvent::SourceStopped,
                DeviceEvent::SinkStopped,
                DeviceEvent::ShutDown,
            ]
        );
        assert_eq!(device.source().active_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_resets_counts() {
        let device = RelayDevice::new(small_config()).unwrap();
        device.open_sink(FrameFeeder::new(ClientIdentity::new("feeder"), 1)).unwrap();
        device.start_source();
        device.start_source();
        device.shutdown();

        assert!(!device.sink().is_started());
        assert_eq!(device.sink().active_count(), 0);
        assert_eq!(device.source().active_count(), 0);
        assert_eq!(device.source().viewer_count(), 0);
    }

    #[tokio::test]
    async fn test_ready_seen_by_late_subscriber() {
        let device = RelayDevice::new(small_config()).unwrap();
        assert!(device.is_ready());

        let mut first = device.subscribe_events();
        let mut second = device.subscribe_events();
        let ready = DeviceEvent::Ready {
            device_id: device.info().device_id,
        };
        let event = tokio::time::timeout(Duration::from_millis(100), first.recv())
            .await
            .expect("ready within timeout")
            .unwrap();
        assert_eq!(event, ready);
        assert_eq!(second.try_recv().unwrap(), ready);

        device.shutdown();
        assert!(!device.is_ready());
        let mut after = device.subscribe_events();
        assert!(after.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_oversized_pool_fails_startup() {
        let mut config = small_config();
        config.pool.capacity = usize::MAX / 4;
        let err = RelayDevice::new(config).err().expect("startup should fail");
        assert!(matches!(err, RelayError::PoolCreationFailed { .. }));
    }
}
