//! Acquisition lifecycle for one camera.
//!
//! ```text
//!        start() ok
//!   Idle ───────────▶ Acquiring
//!    ▲                   │
//!    └───────────────────┘
//!          stop()
//! ```
//!
//! `start` while Acquiring fails with [`LifecycleError::AlreadyAcquiring`];
//! `stop` while Idle does nothing. `start` and `stop` take `&mut self`, so
//! they cannot race each other on the same controller.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::capture::cache::{FrameReader, LatestFrame};
use crate::capture::frame::{Image, RawFrame};
use crate::capture::observer::{FrameObserver, FrameTelemetry};
use crate::driver::{Camera, CameraId, CameraInfo, Feature, FrameHandler, RegistrationToken};
use crate::error::{LifecycleError, Result};
use crate::{AcquisitionConfig, ColorProcessing, FrameLogging};

/// The handler actually registered with the driver.
///
/// Closing the gate waits for an in-flight callback to return; afterwards
/// every delivery is discarded, however late the driver calls.
pub(crate) struct SessionGate {
    target: RwLock<Option<Arc<dyn FrameHandler>>>,
}

impl SessionGate {
    pub(crate) fn new(target: Arc<dyn FrameHandler>) -> Self {
        Self {
            target: RwLock::new(Some(target)),
        }
    }

    /// Returns whether the gate was still open.
    pub(crate) fn close(&self) -> bool {
        self.target.write().take().is_some()
    }
}

impl FrameHandler for SessionGate {
    fn on_frame(&self, frame: &RawFrame<'_>) {
        if let Some(target) = self.target.read().as_ref() {
            target.on_frame(frame);
        }
    }
}

struct Session {
    token: RegistrationToken,
    observer: Arc<FrameObserver>,
    gate: Arc<SessionGate>,
}

/// Owns one camera handle and its acquisition sessions.
///
/// At most one controller may exist per physical camera; the driver's
/// exclusive-open semantics are relied upon, not checked here.
pub struct CameraController {
    camera: Box<dyn Camera>,
    buffer_count: u32,
    color_processing: ColorProcessing,
    frame_logging: FrameLogging,
    cache: Arc<LatestFrame>,
    session: Option<Session>,
}

impl CameraController {
    /// Takes ownership of an open camera. The camera is closed if `config`
    /// is rejected.
    pub fn new(camera: Box<dyn Camera>, config: &AcquisitionConfig) -> Result<Self> {
        if let Err(err) = config.validate() {
            if let Err(close_err) = camera.close() {
                warn!(
                    camera = %camera.info().id,
                    error = %close_err,
                    "Failed to close rejected camera"
                );
            }
            return Err(err);
        }

        Ok(Self {
            camera,
            buffer_count: config.buffer_count,
            color_processing: config.color_processing,
            frame_logging: config.frame_logging,
            cache: Arc::new(LatestFrame::default()),
            session: None,
        })
    }

    pub fn info(&self) -> &CameraInfo {
        self.camera.info()
    }

    pub fn id(&self) -> &CameraId {
        &self.camera.info().id
    }

    pub fn name(&self) -> &str {
        &self.camera.info().name
    }

    pub fn model(&self) -> &str {
        &self.camera.info().model
    }

    pub fn buffer_count(&self) -> u32 {
        self.buffer_count
    }

    pub fn is_acquiring(&self) -> bool {
        self.session.is_some()
    }

    /// Starts continuous acquisition with a fresh observer.
    pub fn start(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Err(LifecycleError::AlreadyAcquiring {
                camera: self.id().to_string(),
            }
            .into());
        }

        let cache = self.cache.clone();
        let observer = Arc::new(FrameObserver::new(
            self.camera.info(),
            move |image| cache.publish(image),
            self.frame_logging,
            self.color_processing,
        ));
        let gate = Arc::new(SessionGate::new(observer.clone()));

        let token = self
            .camera
            .register_observer(self.buffer_count, gate.clone())?;

        info!(
            camera = %self.id(),
            buffer_count = self.buffer_count,
            color_processing = ?self.color_processing,
            "Acquisition started"
        );
        self.session = Some(Session {
            token,
            observer,
            gate,
        });
        Ok(())
    }

    /// Stops acquisition. Once this returns, the session's observer has been
    /// destroyed and will never be called again.
    ///
    /// Blocks until the driver confirms no callback is running. A driver that
    /// never confirms blocks this call forever.
    pub fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        if let Err(err) = self.camera.unregister_observer(session.token) {
            warn!(
                camera = %self.id(),
                error = %err,
                "Driver did not confirm acquisition stop, closing the session anyway"
            );
        }
        session.gate.close();

        let telemetry = session.observer.telemetry();
        info!(
            camera = %self.id(),
            frames_received = telemetry.frames_received,
            frames_dropped = telemetry.frames_dropped,
            frames_missed = telemetry.frames_missed,
            "Acquisition stopped"
        );
    }

    /// Most recent image, or `None` if no frame was ever delivered.
    pub fn current_frame(&self) -> Option<Arc<Image>> {
        self.cache.current()
    }

    /// Tests and clears the "new frame" flag, returning its prior value.
    pub fn poll_new_frame(&self) -> bool {
        self.cache.poll_new()
    }

    pub fn take_new_frame(&self) -> Option<Arc<Image>> {
        self.cache.take_new()
    }

    pub fn frame_reader(&self) -> FrameReader {
        FrameReader::new(self.cache.clone())
    }

    /// Telemetry of the running session, `None` when Idle.
    pub fn telemetry(&self) -> Option<FrameTelemetry> {
        self.session
            .as_ref()
            .map(|session| session.observer.telemetry())
    }

    /// Applies to the next delivered frame when Acquiring, and to every
    /// later session.
    pub fn set_color_processing(&mut self, color_processing: ColorProcessing) {
        if let Some(session) = &self.session {
            session.observer.set_color_processing(color_processing);
        }
        self.color_processing = color_processing;
    }

    pub fn color_processing(&self) -> ColorProcessing {
        self.color_processing
    }

    /// Applies to the next delivered frame when Acquiring, and to every
    /// later session.
    pub fn set_frame_logging(&mut self, frame_logging: FrameLogging) {
        if let Some(session) = &self.session {
            session.observer.set_frame_logging(frame_logging);
        }
        self.frame_logging = frame_logging;
    }

    pub fn frame_logging(&self) -> FrameLogging {
        self.frame_logging
    }

    pub fn features(&self) -> Result<Vec<Feature>> {
        Ok(self.camera.features()?)
    }

    pub fn feature_by_name(&self, name: &str) -> Result<Feature> {
        Ok(self.camera.feature_by_name(name)?)
    }
}

impl Drop for CameraController {
    fn drop(&mut self) {
        self.stop();
        if let Err(err) = self.camera.close() {
            warn!(camera = %self.id(), error = %err, "Failed to close camera");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::capture::frame::{FrameBuffer, FrameFormat, PixelFormat};
    use crate::driver::SimCamera;

    #[derive(Default)]
    struct Counter {
        calls: AtomicUsize,
    }

    impl FrameHandler for Counter {
        fn on_frame(&self, _frame: &RawFrame<'_>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Parks inside the callback until released.
    struct Parked {
        entered: Barrier,
        release: Barrier,
    }

    impl FrameHandler for Parked {
        fn on_frame(&self, _frame: &RawFrame<'_>) {
            self.entered.wait();
            self.release.wait();
        }
    }

    fn frame() -> FrameBuffer {
        FrameBuffer::complete(1, FrameFormat::new(1, 1, PixelFormat::Mono8), vec![0u8])
    }

    #[test]
    fn closed_gate_discards_deliveries() {
        let counter = Arc::new(Counter::default());
        let gate = SessionGate::new(counter.clone());

        gate.on_frame(&frame().as_raw());
        assert!(gate.close());
        assert!(!gate.close());
        gate.on_frame(&frame().as_raw());

        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_waits_for_in_flight_callback() {
        let parked = Arc::new(Parked {
            entered: Barrier::new(2),
            release: Barrier::new(2),
        });
        let gate = Arc::new(SessionGate::new(parked.clone()));

        let driver = {
            let gate = gate.clone();
            thread::spawn(move || gate.on_frame(&frame().as_raw()))
        };
        parked.entered.wait();

        let closer = {
            let gate = gate.clone();
            thread::spawn(move || gate.close())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!closer.is_finished(), "close returned while a callback was running");

        parked.release.wait();
        assert!(closer.join().unwrap());
        driver.join().unwrap();
    }

    #[test]
    fn stop_destroys_the_session_observer() {
        let camera = SimCamera::new("A", FrameFormat::new(1, 1, PixelFormat::Mono8));
        let feeder = camera.feeder();
        let mut controller =
            CameraController::new(Box::new(camera), &AcquisitionConfig::default()).unwrap();

        controller.start().unwrap();
        feeder.deliver(frame()).unwrap();
        let first = Arc::downgrade(&controller.session.as_ref().unwrap().observer);
        controller.stop();
        assert!(first.upgrade().is_none(), "observer outlived stop");

        controller.start().unwrap();
        let second = Arc::downgrade(&controller.session.as_ref().unwrap().observer);
        assert_eq!(second.strong_count(), 2);
        drop(controller);
        assert!(second.upgrade().is_none());
    }
}
