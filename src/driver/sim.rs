//! In-process camera driver with a real delivery thread per session.
//!
//! Frames either come from a [`SimFeeder`] (tests push them one by one) or are
//! synthesized at a fixed rate (sample app). A [`SimProbe`] records the
//! driver-side call sequence and can inject faults.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use image::codecs::jpeg::JpegEncoder;
use image::GrayImage;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{
    Camera, CameraId, CameraInfo, Driver, Feature, FeatureValue, FrameHandler, RegistrationToken,
};
use crate::capture::frame::{FrameBuffer, FrameFormat, FrameStatus, PixelFormat};
use crate::error::{DriverError, DriverStatus};
use crate::SimulatorConfig;

/// Idle wake-up of a feeder-driven session
const IDLE_TICK: Duration = Duration::from_millis(10);

/// Driver-side calls, in the order the camera saw them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    Opened,
    Registered {
        token: RegistrationToken,
        buffer_count: u32,
    },
    Unregistered {
        token: RegistrationToken,
    },
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct Generator {
    period: Duration,
    error_every: u64,
}

struct Delivery {
    frame: FrameBuffer,
    ack: Option<Sender<()>>,
}

struct Session {
    token: RegistrationToken,
    tx: Sender<Delivery>,
    stop: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

struct Shared {
    info: CameraInfo,
    format: FrameFormat,
    generator: Option<Generator>,
    open: AtomicBool,
    next_token: AtomicU64,
    session: Mutex<Option<Session>>,
    // Kept past unregistration so a probe can act like a driver that
    // misbehaves and calls a withdrawn handler.
    last_handler: Mutex<Option<Arc<dyn FrameHandler>>>,
    fail_next_registration: Mutex<Option<DriverStatus>>,
    events: Mutex<Vec<SimEvent>>,
}

impl Shared {
    fn record(&self, event: SimEvent) {
        self.events.lock().push(event);
    }

    fn ensure_open(&self, operation: &'static str) -> Result<(), DriverError> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(DriverError::new(operation, DriverStatus::DeviceNotOpen))
        }
    }

    fn stop_session(&self, session: Session) -> Result<(), DriverError> {
        if session.worker.thread().id() == thread::current().id() {
            // Joining ourselves would never return. Put the session back.
            *self.session.lock() = Some(session);
            return Err(DriverError::new(
                "unregister observer",
                DriverStatus::InvalidCall,
            ));
        }

        session.stop.store(true, Ordering::Release);
        drop(session.tx);
        session
            .worker
            .join()
            .map_err(|_| DriverError::new("unregister observer", DriverStatus::InternalFault))?;

        self.record(SimEvent::Unregistered {
            token: session.token,
        });
        Ok(())
    }
}

/// A simulated camera handle
pub struct SimCamera {
    shared: Arc<Shared>,
}

impl SimCamera {
    /// Opens a camera whose frames are pushed through its [`SimFeeder`].
    pub fn new(id: impl Into<String>, format: FrameFormat) -> Self {
        Self::build(id.into(), format, None)
    }

    /// Opens a camera that synthesizes a test pattern at `fps`, marking every
    /// `error_every`-th frame incomplete (0 disables).
    pub fn generating(
        id: impl Into<String>,
        format: FrameFormat,
        fps: u32,
        error_every: u64,
    ) -> Self {
        let generator = Generator {
            period: Duration::from_secs_f64(1.0 / f64::from(fps.max(1))),
            error_every,
        };
        Self::build(id.into(), format, Some(generator))
    }

    fn build(id: String, format: FrameFormat, generator: Option<Generator>) -> Self {
        let info = CameraInfo {
            id: CameraId::new(id.clone()),
            name: format!("Simulated camera {id}"),
            model: format!("SimCam {}", format.pixel_format),
            serial: format!("SIM-{id}"),
        };
        Self {
            shared: Arc::new(Shared {
                info,
                format,
                generator,
                open: AtomicBool::new(true),
                next_token: AtomicU64::new(1),
                session: Mutex::new(None),
                last_handler: Mutex::new(None),
                fail_next_registration: Mutex::new(None),
                events: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn feeder(&self) -> SimFeeder {
        SimFeeder {
            shared: self.shared.clone(),
        }
    }

    pub fn probe(&self) -> SimProbe {
        SimProbe {
            shared: self.shared.clone(),
        }
    }

    fn features_of(&self) -> Vec<Feature> {
        let shared = &self.shared;
        let fps = shared
            .generator
            .map(|g| 1.0 / g.period.as_secs_f64())
            .unwrap_or(0.0);
        vec![
            Feature::new("Width", FeatureValue::Int(i64::from(shared.format.width))),
            Feature::new("Height", FeatureValue::Int(i64::from(shared.format.height))),
            Feature::new(
                "PixelFormat",
                FeatureValue::Enum(shared.format.pixel_format.to_string()),
            ),
            Feature::new("AcquisitionFrameRate", FeatureValue::Float(fps)),
            Feature::new("DeviceModelName", FeatureValue::Str(shared.info.model.clone())),
            Feature::new("AcquisitionStart", FeatureValue::Command),
        ]
    }
}

impl Camera for SimCamera {
    fn info(&self) -> &CameraInfo {
        &self.shared.info
    }

    fn register_observer(
        &self,
        buffer_count: u32,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<RegistrationToken, DriverError> {
        const OP: &str = "register observer";

        self.shared.ensure_open(OP)?;
        if buffer_count == 0 {
            return Err(DriverError::new(OP, DriverStatus::BadParameter));
        }
        if let Some(status) = self.shared.fail_next_registration.lock().take() {
            return Err(DriverError::new(OP, status));
        }

        let mut session = self.shared.session.lock();
        if session.is_some() {
            return Err(DriverError::new(OP, DriverStatus::InvalidCall));
        }

        let token = RegistrationToken(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = flume::bounded(buffer_count as usize);
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let handler = handler.clone();
            let stop = stop.clone();
            let format = self.shared.format;
            let generator = self.shared.generator;
            thread::Builder::new()
                .name(format!("sim-{}", self.shared.info.id))
                .spawn(move || deliver_frames(handler, rx, stop, format, generator))
                .map_err(|_| DriverError::new(OP, DriverStatus::Resources))?
        };

        *session = Some(Session {
            token,
            tx,
            stop,
            worker,
        });
        *self.shared.last_handler.lock() = Some(handler);
        self.shared.record(SimEvent::Registered {
            token,
            buffer_count,
        });
        debug!(camera = %self.shared.info.id, ?token, buffer_count, "Simulated stream started");
        Ok(token)
    }

    fn unregister_observer(&self, token: RegistrationToken) -> Result<(), DriverError> {
        let session = {
            let mut guard = self.shared.session.lock();
            match guard.as_ref() {
                Some(session) if session.token == token => guard.take(),
                _ => None,
            }
        };

        match session {
            Some(session) => self.shared.stop_session(session),
            None => Err(DriverError::new(
                "unregister observer",
                DriverStatus::BadHandle,
            )),
        }
    }

    fn features(&self) -> Result<Vec<Feature>, DriverError> {
        self.shared.ensure_open("list features")?;
        Ok(self.features_of())
    }

    fn feature_by_name(&self, name: &str) -> Result<Feature, DriverError> {
        const OP: &str = "feature lookup";

        self.shared.ensure_open(OP)?;
        self.features_of()
            .into_iter()
            .find(|feature| feature.name == name)
            .ok_or(DriverError::new(OP, DriverStatus::NotFound))
    }

    fn close(&self) -> Result<(), DriverError> {
        if !self.shared.open.swap(false, Ordering::AcqRel) {
            return Err(DriverError::new("close camera", DriverStatus::DeviceNotOpen));
        }
        let session = self.shared.session.lock().take();
        if let Some(session) = session {
            self.shared.stop_session(session)?;
        }
        self.shared.record(SimEvent::Closed);
        Ok(())
    }
}

fn deliver_frames(
    handler: Arc<dyn FrameHandler>,
    rx: Receiver<Delivery>,
    stop: Arc<AtomicBool>,
    format: FrameFormat,
    generator: Option<Generator>,
) {
    let started = Instant::now();
    let tick = generator.map(|g| g.period).unwrap_or(IDLE_TICK);
    let mut deadline = started + tick;
    let mut next_id = 0u64;

    while !stop.load(Ordering::Acquire) {
        match rx.recv_deadline(deadline) {
            Ok(delivery) => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                handler.on_frame(&delivery.frame.as_raw());
                if let Some(ack) = delivery.ack {
                    let _ = ack.send(());
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                deadline = Instant::now() + tick;
                if let Some(generator) = generator {
                    let mut frame = synthesize(format, next_id, generator.error_every);
                    frame.device_timestamp = Some(started.elapsed());
                    handler.on_frame(&frame.as_raw());
                    next_id += 1;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Moving diagonal gradient in the camera's native format.
fn synthesize(format: FrameFormat, frame_id: u64, error_every: u64) -> FrameBuffer {
    let (w, h) = (format.width as usize, format.height as usize);
    let shift = (frame_id * 4) as usize;
    let level = |x: usize, y: usize| ((x + y + shift) & 0xff) as u8;

    let data: Vec<u8> = match format.pixel_format {
        PixelFormat::Mono8
        | PixelFormat::BayerRg8
        | PixelFormat::BayerGb8
        | PixelFormat::BayerGr8
        | PixelFormat::BayerBg8 => (0..h)
            .flat_map(|y| (0..w).map(move |x| (x, y)))
            .map(|(x, y)| level(x, y))
            .collect(),
        PixelFormat::Rgb8 | PixelFormat::Bgr8 => (0..h)
            .flat_map(|y| (0..w).map(move |x| (x, y)))
            .flat_map(|(x, y)| [level(x, y), (y & 0xff) as u8, (x & 0xff) as u8])
            .collect(),
        PixelFormat::Yuyv => (0..h)
            .flat_map(|y| (0..w).map(move |x| (x, y)))
            .flat_map(|(x, y)| [level(x, y), 128])
            .collect(),
        PixelFormat::Mjpeg => {
            let gradient = GrayImage::from_fn(format.width, format.height, |x, y| {
                image::Luma([level(x as usize, y as usize)])
            });
            let mut encoded = Vec::new();
            match JpegEncoder::new(&mut encoded).encode_image(&gradient) {
                Ok(()) => encoded,
                Err(_) => {
                    return FrameBuffer::complete(frame_id, format, Vec::new())
                        .with_status(FrameStatus::Invalid)
                }
            }
        }
    };

    let frame = FrameBuffer::complete(frame_id, format, data);
    if error_every > 0 && frame_id % error_every == error_every - 1 {
        frame.with_status(FrameStatus::Incomplete)
    } else {
        frame
    }
}

/// Pushes frames into a camera's active session
#[derive(Clone)]
pub struct SimFeeder {
    shared: Arc<Shared>,
}

impl SimFeeder {
    fn sender(&self, operation: &'static str) -> Result<Sender<Delivery>, DriverError> {
        self.shared
            .session
            .lock()
            .as_ref()
            .map(|session| session.tx.clone())
            .ok_or(DriverError::new(operation, DriverStatus::InvalidCall))
    }

    /// Queues a frame; blocks while all session buffers are in flight.
    pub fn push(&self, frame: FrameBuffer) -> Result<(), DriverError> {
        const OP: &str = "push frame";

        self.sender(OP)?
            .send(Delivery { frame, ack: None })
            .map_err(|_| DriverError::new(OP, DriverStatus::InvalidCall))
    }

    /// Queues a frame and waits until the handler has returned from it.
    pub fn deliver(&self, frame: FrameBuffer) -> Result<(), DriverError> {
        const OP: &str = "deliver frame";

        let (ack_tx, ack_rx) = flume::bounded(1);
        self.sender(OP)?
            .send(Delivery {
                frame,
                ack: Some(ack_tx),
            })
            .map_err(|_| DriverError::new(OP, DriverStatus::InvalidCall))?;
        ack_rx
            .recv()
            .map_err(|_| DriverError::new(OP, DriverStatus::Incomplete))
    }
}

/// Inspects and perturbs a simulated camera from the outside
#[derive(Clone)]
pub struct SimProbe {
    shared: Arc<Shared>,
}

impl SimProbe {
    pub fn events(&self) -> Vec<SimEvent> {
        self.shared.events.lock().clone()
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.session.lock().is_some()
    }

    pub fn fail_next_registration(&self, status: DriverStatus) {
        *self.shared.fail_next_registration.lock() = Some(status);
    }

    /// Calls the most recently registered handler directly, on the calling
    /// thread, whether or not it is still registered.
    pub fn stale_delivery(&self, frame: &FrameBuffer) -> bool {
        let handler = self.shared.last_handler.lock().clone();
        match handler {
            Some(handler) => {
                handler.on_frame(&frame.as_raw());
                true
            }
            None => false,
        }
    }
}

/// Driver exposing a fixed set of simulated cameras
pub struct SimDriver {
    cameras: Vec<Arc<Shared>>,
    running: AtomicBool,
}

impl SimDriver {
    pub fn new() -> Self {
        Self {
            cameras: Vec::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &SimulatorConfig) -> Self {
        let format = FrameFormat::new(config.width, config.height, config.pixel_format);
        (0..config.cameras).fold(Self::new(), |driver, index| {
            driver.with_camera(SimCamera::generating(
                format!("DEV_SIM{index}"),
                format,
                config.fps,
                config.error_every,
            ))
        })
    }

    /// Adds a camera; it stays closed until opened through the driver.
    pub fn with_camera(mut self, camera: SimCamera) -> Self {
        camera.shared.open.store(false, Ordering::Release);
        self.cameras.push(camera.shared);
        self
    }

    fn ensure_running(&self, operation: &'static str) -> Result<(), DriverError> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(DriverError::new(operation, DriverStatus::ApiNotStarted))
        }
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for SimDriver {
    fn startup(&self) -> Result<(), DriverError> {
        self.running.store(true, Ordering::Release);
        info!(cameras = self.cameras.len(), "Simulated driver started");
        Ok(())
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        info!("Simulated driver shut down");
    }

    fn list_cameras(&self) -> Result<Vec<CameraInfo>, DriverError> {
        self.ensure_running("list cameras")?;
        Ok(self.cameras.iter().map(|c| c.info.clone()).collect())
    }

    fn open_camera(&self, id: &CameraId) -> Result<Box<dyn Camera>, DriverError> {
        const OP: &str = "open camera";

        self.ensure_running(OP)?;
        let shared = self
            .cameras
            .iter()
            .find(|c| &c.info.id == id)
            .ok_or(DriverError::new(OP, DriverStatus::NotFound))?;

        // Exclusive access: a camera is open at most once.
        if shared.open.swap(true, Ordering::AcqRel) {
            return Err(DriverError::new(OP, DriverStatus::InvalidAccess));
        }
        shared.record(SimEvent::Opened);

        Ok(Box::new(SimCamera {
            shared: shared.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::RawFrame;

    #[derive(Default)]
    struct Recorder {
        ids: Mutex<Vec<(u64, FrameStatus)>>,
    }

    impl FrameHandler for Recorder {
        fn on_frame(&self, frame: &RawFrame<'_>) {
            self.ids.lock().push((frame.frame_id, frame.status));
        }
    }

    fn mono(width: u32, height: u32) -> FrameFormat {
        FrameFormat::new(width, height, PixelFormat::Mono8)
    }

    #[test]
    fn feeder_frames_reach_handler_in_order() {
        let camera = SimCamera::new("A", mono(2, 2));
        let feeder = camera.feeder();
        let recorder = Arc::new(Recorder::default());

        let token = camera.register_observer(2, recorder.clone()).unwrap();
        for id in 1..=3 {
            feeder
                .deliver(FrameBuffer::complete(id, mono(2, 2), vec![0u8; 4]))
                .unwrap();
        }
        camera.unregister_observer(token).unwrap();

        let ids: Vec<u64> = recorder.ids.lock().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn push_after_unregister_is_refused() {
        let camera = SimCamera::new("A", mono(1, 1));
        let feeder = camera.feeder();
        let token = camera
            .register_observer(2, Arc::new(Recorder::default()))
            .unwrap();
        camera.unregister_observer(token).unwrap();

        let err = feeder
            .push(FrameBuffer::complete(1, mono(1, 1), vec![0u8]))
            .unwrap_err();
        assert_eq!(err.status, DriverStatus::InvalidCall);
    }

    #[test]
    fn second_registration_is_rejected() {
        let camera = SimCamera::new("A", mono(1, 1));
        let token = camera
            .register_observer(2, Arc::new(Recorder::default()))
            .unwrap();
        let err = camera
            .register_observer(2, Arc::new(Recorder::default()))
            .unwrap_err();
        assert_eq!(err.status, DriverStatus::InvalidCall);
        camera.unregister_observer(token).unwrap();
    }

    #[test]
    fn unknown_token_is_a_bad_handle() {
        let camera = SimCamera::new("A", mono(1, 1));
        let err = camera
            .unregister_observer(RegistrationToken(99))
            .unwrap_err();
        assert_eq!(err.status, DriverStatus::BadHandle);
    }

    #[test]
    fn generator_marks_periodic_errors() {
        let camera = SimCamera::generating("G", mono(4, 2), 200, 3);
        let recorder = Arc::new(Recorder::default());
        let token = camera.register_observer(2, recorder.clone()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while recorder.ids.lock().len() < 6 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        camera.unregister_observer(token).unwrap();

        let seen = recorder.ids.lock().clone();
        assert!(seen.len() >= 6);
        assert_eq!(seen[2], (2, FrameStatus::Incomplete));
        assert_eq!(seen[5], (5, FrameStatus::Incomplete));
        assert_eq!(seen[0].1, FrameStatus::Complete);
    }

    #[test]
    fn features_are_looked_up_by_name() {
        let camera = SimCamera::new("A", mono(8, 6));
        assert_eq!(
            camera.feature_by_name("Width").unwrap().value,
            FeatureValue::Int(8)
        );
        let err = camera.feature_by_name("Gain").unwrap_err();
        assert_eq!(err.status, DriverStatus::NotFound);

        camera.close().unwrap();
        let err = camera.features().unwrap_err();
        assert_eq!(err.status, DriverStatus::DeviceNotOpen);
    }

    #[test]
    fn driver_opens_each_camera_once() {
        let driver = SimDriver::new().with_camera(SimCamera::new("A", mono(1, 1)));
        let id = CameraId::new("A");

        assert_eq!(
            driver.open_camera(&id).err().map(|e| e.status),
            Some(DriverStatus::ApiNotStarted)
        );
        driver.startup().unwrap();

        let camera = driver.open_camera(&id).unwrap();
        assert_eq!(
            driver.open_camera(&id).err().map(|e| e.status),
            Some(DriverStatus::InvalidAccess)
        );
        camera.close().unwrap();
        assert!(driver.open_camera(&id).is_ok());

        assert_eq!(
            driver
                .open_camera(&CameraId::new("missing"))
                .err()
                .map(|e| e.status),
            Some(DriverStatus::NotFound)
        );
    }

    #[test]
    fn every_format_can_be_synthesized() {
        for pixel_format in [
            PixelFormat::Mono8,
            PixelFormat::Rgb8,
            PixelFormat::Bgr8,
            PixelFormat::BayerRg8,
            PixelFormat::Yuyv,
            PixelFormat::Mjpeg,
        ] {
            let format = FrameFormat::new(8, 4, pixel_format);
            let frame = synthesize(format, 0, 0);
            assert_eq!(frame.status, FrameStatus::Complete);
            if let Some(len) = format.min_buffer_len() {
                assert_eq!(frame.data.len(), len);
            } else {
                assert!(!frame.data.is_empty());
            }
        }
    }
}
