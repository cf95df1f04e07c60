pub mod factory;
pub mod frame;
pub mod pool;

pub use factory::TimedFrameFactory;
pub use frame::{FormatDescription, Frame, FrameMetadata, PixelFormat};
pub use pool::{FramePool, PoolStats, PooledBuffer};
