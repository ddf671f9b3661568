pub mod cache;
pub mod controller;
pub mod convert;
pub mod frame;
pub mod observer;

pub use cache::FrameReader;
pub use controller::CameraController;
pub use convert::{convert, ConvertError};
pub use frame::{FrameBuffer, FrameFormat, FrameStatus, Image, PixelFormat, RawFrame};
pub use observer::{FrameObserver, FrameSink, FrameTelemetry};
