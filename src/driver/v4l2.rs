//! Video4Linux2 driver binding with mmap streaming on a dedicated thread

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, instrument};
use v4l::buffer::{Flags as BufferFlags, Type};
use v4l::capability::Flags as CapFlags;
use v4l::control::{self, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{
    Camera, CameraId, CameraInfo, Driver, Feature, FeatureValue, FrameHandler, RegistrationToken,
};
use crate::capture::frame::{FrameFormat, FrameStatus, PixelFormat, RawFrame};
use crate::error::{DriverError, DriverStatus};

/// How long a dequeue may block before the stop flag is checked again
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

/// Formats we can convert, in order of preference
const PREFERRED: [(&[u8; 4], PixelFormat); 9] = [
    (b"RGGB", PixelFormat::BayerRg8),
    (b"GBRG", PixelFormat::BayerGb8),
    (b"GRBG", PixelFormat::BayerGr8),
    (b"BA81", PixelFormat::BayerBg8),
    (b"RGB3", PixelFormat::Rgb8),
    (b"BGR3", PixelFormat::Bgr8),
    (b"YUYV", PixelFormat::Yuyv),
    (b"MJPG", PixelFormat::Mjpeg),
    (b"GREY", PixelFormat::Mono8),
];

fn driver_err(operation: &'static str) -> impl FnOnce(io::Error) -> DriverError {
    move |err| DriverError::new(operation, DriverStatus::from(err))
}

/// Scans `/dev/video*` nodes for capture devices
pub struct V4l2Driver {
    max_devices: usize,
}

impl V4l2Driver {
    pub fn new() -> Self {
        Self { max_devices: 10 }
    }

    fn device_path(id: &CameraId) -> PathBuf {
        PathBuf::from(id.as_str())
    }

    fn supported_format(device: &Device) -> Option<PixelFormat> {
        let formats = device.enum_formats().ok()?;
        PREFERRED.iter().find_map(|(fourcc, format)| {
            formats
                .iter()
                .any(|desc| desc.fourcc == FourCC::new(fourcc))
                .then_some(*format)
        })
    }

    fn probe(path: &Path) -> Option<CameraInfo> {
        let device = Device::with_path(path).ok()?;
        let caps = device.query_caps().ok()?;
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return None;
        }
        Self::supported_format(&device)?;

        Some(CameraInfo {
            id: CameraId::new(path.to_string_lossy()),
            name: caps.card.clone(),
            model: caps.driver.clone(),
            serial: caps.bus.clone(),
        })
    }
}

impl Default for V4l2Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for V4l2Driver {
    fn startup(&self) -> Result<(), DriverError> {
        info!("V4L2 driver started");
        Ok(())
    }

    fn shutdown(&self) {
        info!("V4L2 driver shut down");
    }

    fn list_cameras(&self) -> Result<Vec<CameraInfo>, DriverError> {
        info!("Scanning for capture devices...");

        let cameras: Vec<CameraInfo> = (0..self.max_devices)
            .map(|i| PathBuf::from(format!("/dev/video{i}")))
            .filter(|path| path.exists())
            .filter_map(|path| Self::probe(&path))
            .inspect(|info| info!("Found capture device: {} - {}", info.id, info.name))
            .collect();

        if cameras.is_empty() {
            return Err(DriverError::new(
                "list cameras",
                DriverStatus::NoTransportLayer,
            ));
        }
        Ok(cameras)
    }

    #[instrument(skip(self))]
    fn open_camera(&self, id: &CameraId) -> Result<Box<dyn Camera>, DriverError> {
        const OP: &str = "open camera";

        let path = Self::device_path(id);
        let info = Self::probe(&path).ok_or(DriverError::new(OP, DriverStatus::NotFound))?;
        let device = Device::with_path(&path).map_err(driver_err(OP))?;

        let pixel_format = Self::supported_format(&device)
            .ok_or(DriverError::new(OP, DriverStatus::NotSupported))?;
        let mut fmt = device.format().map_err(driver_err(OP))?;
        fmt.fourcc = PREFERRED
            .iter()
            .find(|(_, format)| *format == pixel_format)
            .map(|(fourcc, _)| FourCC::new(fourcc))
            .unwrap_or(fmt.fourcc);
        let fmt = device.set_format(&fmt).map_err(driver_err(OP))?;

        let format = FrameFormat::new(fmt.width, fmt.height, pixel_format);
        info!("Device: {} ({}) streaming {}", info.name, info.model, format);

        Ok(Box::new(V4l2Camera {
            info,
            path,
            device,
            format,
            open: AtomicBool::new(true),
            next_token: AtomicU64::new(1),
            session: Mutex::new(None),
        }))
    }
}

struct Session {
    token: RegistrationToken,
    stop: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

pub struct V4l2Camera {
    info: CameraInfo,
    path: PathBuf,
    device: Device,
    format: FrameFormat,
    open: AtomicBool,
    next_token: AtomicU64,
    session: Mutex<Option<Session>>,
}

impl V4l2Camera {
    fn ensure_open(&self, operation: &'static str) -> Result<(), DriverError> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(DriverError::new(operation, DriverStatus::DeviceNotOpen))
        }
    }

    fn stop_session(&self, session: Session) -> Result<(), DriverError> {
        session.stop.store(true, Ordering::Release);
        session
            .worker
            .join()
            .map_err(|_| DriverError::new("unregister observer", DriverStatus::InternalFault))
    }
}

impl Camera for V4l2Camera {
    fn info(&self) -> &CameraInfo {
        &self.info
    }

    fn register_observer(
        &self,
        buffer_count: u32,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<RegistrationToken, DriverError> {
        const OP: &str = "register observer";

        self.ensure_open(OP)?;
        let mut session = self.session.lock();
        if session.is_some() {
            return Err(DriverError::new(OP, DriverStatus::InvalidCall));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = flume::bounded(1);
        let worker = {
            let path = self.path.clone();
            let format = self.format;
            let stop = stop.clone();
            thread::Builder::new()
                .name(format!("v4l2-{}", self.info.id))
                .spawn(move || stream_frames(path, buffer_count, format, handler, stop, ready_tx))
                .map_err(|_| DriverError::new(OP, DriverStatus::Resources))?
        };

        // The stream is set up on the worker; wait for its verdict.
        let ready = ready_rx
            .recv()
            .unwrap_or(Err(DriverError::new(OP, DriverStatus::InternalFault)));
        if let Err(err) = ready {
            let _ = worker.join();
            return Err(err);
        }

        let token = RegistrationToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        *session = Some(Session {
            token,
            stop,
            worker,
        });
        info!("Capture stream started with {} buffers", buffer_count);
        Ok(token)
    }

    fn unregister_observer(&self, token: RegistrationToken) -> Result<(), DriverError> {
        let session = {
            let mut guard = self.session.lock();
            match guard.as_ref() {
                Some(session) if session.token == token => guard.take(),
                _ => None,
            }
        };

        match session {
            Some(session) => self.stop_session(session),
            None => Err(DriverError::new(
                "unregister observer",
                DriverStatus::BadHandle,
            )),
        }
    }

    fn features(&self) -> Result<Vec<Feature>, DriverError> {
        const OP: &str = "list features";

        self.ensure_open(OP)?;
        let descriptions = self.device.query_controls().map_err(driver_err(OP))?;
        Ok(descriptions
            .iter()
            .filter_map(|desc| self.read_control(desc))
            .collect())
    }

    fn feature_by_name(&self, name: &str) -> Result<Feature, DriverError> {
        const OP: &str = "feature lookup";

        self.ensure_open(OP)?;
        self.device
            .query_controls()
            .map_err(driver_err(OP))?
            .iter()
            .find(|desc| desc.name == name)
            .and_then(|desc| self.read_control(desc))
            .ok_or(DriverError::new(OP, DriverStatus::NotFound))
    }

    fn close(&self) -> Result<(), DriverError> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Err(DriverError::new("close camera", DriverStatus::DeviceNotOpen));
        }
        let session = self.session.lock().take();
        if let Some(session) = session {
            self.stop_session(session)?;
        }
        Ok(())
    }
}

impl V4l2Camera {
    fn read_control(&self, desc: &control::Description) -> Option<Feature> {
        let value = match desc.typ {
            control::Type::Button => FeatureValue::Command,
            control::Type::CtrlClass => return None,
            _ => match self.device.control(desc.id).ok()?.value {
                Value::Integer(v) if desc.typ == control::Type::Menu => {
                    FeatureValue::Enum(v.to_string())
                }
                Value::Integer(v) => FeatureValue::Int(v),
                Value::Boolean(v) => FeatureValue::Bool(v),
                Value::String(v) => FeatureValue::Str(v),
                _ => return None,
            },
        };
        Some(Feature::new(desc.name.clone(), value))
    }
}

fn stream_frames(
    path: PathBuf,
    buffer_count: u32,
    format: FrameFormat,
    handler: Arc<dyn FrameHandler>,
    stop: Arc<AtomicBool>,
    ready: flume::Sender<Result<(), DriverError>>,
) {
    const OP: &str = "register observer";

    let device = match Device::with_path(&path) {
        Ok(device) => device,
        Err(err) => {
            let _ = ready.send(Err(driver_err(OP)(err)));
            return;
        }
    };
    let mut stream = match MmapStream::with_buffers(&device, Type::VideoCapture, buffer_count) {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready.send(Err(driver_err(OP)(err)));
            return;
        }
    };
    stream.set_timeout(DEQUEUE_TIMEOUT);
    let _ = ready.send(Ok(()));

    let min_len = format.min_buffer_len();
    while !stop.load(Ordering::Acquire) {
        let (buf, meta) = match CaptureStream::next(&mut stream) {
            Ok(next) => next,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                ) =>
            {
                continue
            }
            Err(err) => {
                error!(device = %path.display(), "Capture stream failed: {}", err);
                break;
            }
        };

        let used = (meta.bytesused as usize).min(buf.len());
        let status = if meta.flags.contains(BufferFlags::ERROR) {
            FrameStatus::Incomplete
        } else if min_len.is_some_and(|len| used < len) {
            FrameStatus::TooSmall
        } else {
            FrameStatus::Complete
        };
        if status != FrameStatus::Complete {
            debug!(
                device = %path.display(),
                sequence = meta.sequence,
                %status,
                "Driver flagged buffer"
            );
        }

        handler.on_frame(&RawFrame {
            frame_id: u64::from(meta.sequence),
            status,
            format,
            data: &buf[..used],
            device_timestamp: Some(
                Duration::from_secs(meta.timestamp.sec as u64)
                    + Duration::from_micros(meta.timestamp.usec as u64),
            ),
        });
    }
}
