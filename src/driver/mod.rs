//! Driver binding: the seam between the acquisition core and a camera SDK.
//!
//! A [`Driver`] enumerates and opens cameras. A [`Camera`] accepts one
//! [`FrameHandler`] per session and calls it from its own delivery thread,
//! at most one callback in flight, until the registration is withdrawn.

pub mod sim;
#[cfg(feature = "v4l2")]
pub mod v4l2;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capture::frame::RawFrame;
use crate::error::DriverError;

pub use sim::{SimCamera, SimDriver, SimFeeder, SimProbe};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Driver;

/// Callback target invoked by the driver once per captured frame.
pub trait FrameHandler: Send + Sync {
    fn on_frame(&self, frame: &RawFrame<'_>);
}

/// Identifies a registration for later withdrawal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationToken(pub u64);

/// An open camera session handle.
pub trait Camera: Send + Sync {
    fn info(&self) -> &CameraInfo;

    /// Starts continuous acquisition, delivering frames to `handler` with
    /// `buffer_count` buffers in flight.
    fn register_observer(
        &self,
        buffer_count: u32,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<RegistrationToken, DriverError>;

    /// Stops acquisition. Blocks until no callback for `token` is running and
    /// none will be started.
    fn unregister_observer(&self, token: RegistrationToken) -> Result<(), DriverError>;

    fn features(&self) -> Result<Vec<Feature>, DriverError>;

    fn feature_by_name(&self, name: &str) -> Result<Feature, DriverError>;

    fn close(&self) -> Result<(), DriverError>;
}

/// Camera discovery and process-wide SDK lifetime.
pub trait Driver: Send + Sync {
    fn startup(&self) -> Result<(), DriverError>;

    fn shutdown(&self);

    fn list_cameras(&self) -> Result<Vec<CameraInfo>, DriverError>;

    fn open_camera(&self, id: &CameraId) -> Result<Box<dyn Camera>, DriverError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CameraId(pub String);

impl CameraId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Detected camera info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub id: CameraId,
    pub name: String,
    pub model: String,
    pub serial: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeatureValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Enum(String),
    Str(String),
    Command,
}

/// A named camera feature and its current value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub value: FeatureValue,
}

impl Feature {
    pub fn new(name: impl Into<String>, value: FeatureValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}
