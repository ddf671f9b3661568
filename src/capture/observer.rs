//! Per-session frame callback target.
//!
//! One `FrameObserver` exists per acquisition session. The driver calls it on
//! its own thread for every captured frame; the observer converts the buffer,
//! updates telemetry, logs according to the configured verbosity and hands
//! the image to its sink.

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use arc_swap::ArcSwap;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::capture::convert::convert;
use crate::capture::frame::{FrameFormat, FrameStatus, Image, RawFrame};
use crate::driver::{CameraId, CameraInfo, FrameHandler};
use crate::value::TimestampedValue;
use crate::{ColorProcessing, FrameLogging};

/// Receives every successfully converted image, on the driver's thread.
pub type FrameSink = Box<dyn Fn(Arc<Image>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ObserverSettings {
    color_processing: ColorProcessing,
    frame_logging: FrameLogging,
}

/// What the observer has seen during its session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameTelemetry {
    /// Wall-clock time of the last converted frame
    pub captured_at: TimestampedValue<SystemTime>,
    /// Driver id of the last converted frame
    pub frame_id: TimestampedValue<u64>,
    /// Format of the last delivered frame
    pub format: TimestampedValue<FrameFormat>,
    /// Status of the last delivered frame
    pub status: TimestampedValue<FrameStatus>,
    pub frames_received: u64,
    pub frames_converted: u64,
    pub frames_dropped: u64,
    /// Frame ids skipped by the driver
    pub frames_missed: u64,
}

#[derive(Default)]
struct ObserverState {
    telemetry: FrameTelemetry,
    last_delivery_id: Option<u64>,
}

pub struct FrameObserver {
    camera: CameraId,
    settings: ArcSwap<ObserverSettings>,
    state: Mutex<ObserverState>,
    sink: FrameSink,
}

impl FrameObserver {
    pub fn new(
        camera: &CameraInfo,
        sink: impl Fn(Arc<Image>) + Send + Sync + 'static,
        frame_logging: FrameLogging,
        color_processing: ColorProcessing,
    ) -> Self {
        Self {
            camera: camera.id.clone(),
            settings: ArcSwap::from_pointee(ObserverSettings {
                color_processing,
                frame_logging,
            }),
            state: Mutex::new(ObserverState::default()),
            sink: Box::new(sink),
        }
    }

    /// Takes effect from the next delivered frame.
    pub fn set_color_processing(&self, color_processing: ColorProcessing) {
        self.settings.rcu(|current| ObserverSettings {
            color_processing,
            ..**current
        });
    }

    /// Takes effect from the next delivered frame.
    pub fn set_frame_logging(&self, frame_logging: FrameLogging) {
        self.settings.rcu(|current| ObserverSettings {
            frame_logging,
            ..**current
        });
    }

    pub fn color_processing(&self) -> ColorProcessing {
        self.settings.load().color_processing
    }

    pub fn frame_logging(&self) -> FrameLogging {
        self.settings.load().frame_logging
    }

    pub fn telemetry(&self) -> FrameTelemetry {
        self.state.lock().telemetry.clone()
    }

    fn drop_frame(&self, reason: &'static str) {
        counter!(
            "camlatch_frames_dropped_total",
            "camera" => self.camera.to_string(),
            "reason" => reason
        )
        .increment(1);
    }
}

impl FrameHandler for FrameObserver {
    fn on_frame(&self, frame: &RawFrame<'_>) {
        let settings = **self.settings.load();
        let camera = &self.camera;
        counter!("camlatch_frames_received_total", "camera" => camera.to_string()).increment(1);

        {
            let mut state = self.state.lock();
            let telemetry = &mut state.telemetry;
            telemetry.frames_received += 1;
            telemetry.status.set(frame.status);
            telemetry.format.set(frame.format);

            if let Some(last) = state.last_delivery_id {
                let gap = frame.frame_id.saturating_sub(last);
                if gap > 1 {
                    let missed = gap - 1;
                    state.telemetry.frames_missed += missed;
                    if settings.frame_logging >= FrameLogging::WarningsAndErrors {
                        warn!(
                            %camera,
                            frame_id = frame.frame_id,
                            missed,
                            "Frame ids skipped: {} frame(s) missing before frame {}",
                            missed,
                            frame.frame_id
                        );
                    }
                }
            }
            state.last_delivery_id = Some(frame.frame_id);

            if !frame.status.is_complete() {
                state.telemetry.frames_dropped += 1;
                drop(state);
                self.drop_frame("status");
                if settings.frame_logging >= FrameLogging::ErrorsOnly {
                    error!(
                        %camera,
                        frame_id = frame.frame_id,
                        status = %frame.status,
                        code = frame.status.code(),
                        "Frame dropped: driver reported {} status",
                        frame.status
                    );
                }
                return;
            }
        }

        // Only one callback is in flight, so converting outside the lock
        // cannot interleave with another frame's telemetry update.
        let started = Instant::now();
        let pixels = match convert(frame.data, frame.format, settings.color_processing) {
            Ok(pixels) => pixels,
            Err(err) => {
                self.state.lock().telemetry.frames_dropped += 1;
                self.drop_frame("conversion");
                if settings.frame_logging >= FrameLogging::ErrorsOnly {
                    error!(
                        %camera,
                        frame_id = frame.frame_id,
                        format = %frame.format,
                        "Frame dropped: conversion failed: {err}"
                    );
                }
                return;
            }
        };
        let convert_time = started.elapsed();
        histogram!("camlatch_frame_convert_seconds", "camera" => camera.to_string())
            .record(convert_time.as_secs_f64());

        let now = SystemTime::now();
        let since_previous = {
            let mut state = self.state.lock();
            let telemetry = &mut state.telemetry;
            let since_previous = if telemetry.captured_at.is_valid() {
                Some(now.duration_since(*telemetry.captured_at.get()).unwrap_or_default())
            } else {
                None
            };
            telemetry.captured_at.set(now);
            telemetry.frame_id.set(frame.frame_id);
            telemetry.frames_converted += 1;
            since_previous
        };

        if settings.frame_logging >= FrameLogging::WarningsAndErrors {
            match since_previous {
                Some(elapsed) => {
                    let secs = elapsed.as_secs_f64();
                    let fps = if secs > 0.0 { 1.0 / secs } else { 0.0 };
                    info!(
                        %camera,
                        frame_id = frame.frame_id,
                        format = %frame.format,
                        elapsed_ms = secs * 1000.0,
                        "Frame received ({fps:.1} fps)"
                    );
                }
                None => info!(
                    %camera,
                    frame_id = frame.frame_id,
                    format = %frame.format,
                    "Frame received (first frame)"
                ),
            }
        }
        if settings.frame_logging >= FrameLogging::Verbose {
            debug!(
                %camera,
                frame_id = frame.frame_id,
                color_processing = ?settings.color_processing,
                convert_us = convert_time.as_micros() as u64,
                device_timestamp = ?frame.device_timestamp,
                "Frame converted"
            );
        }

        let image = Arc::new(Image::new(pixels, frame.frame_id, now, frame.format));
        (self.sink)(image);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{FrameBuffer, PixelFormat};
    use tracing_test::traced_test;

    fn info() -> CameraInfo {
        CameraInfo {
            id: CameraId::new("DEV_TEST"),
            name: "test".into(),
            model: "test".into(),
            serial: "0".into(),
        }
    }

    fn bayer(frame_id: u64) -> FrameBuffer {
        FrameBuffer::complete(
            frame_id,
            FrameFormat::new(4, 2, PixelFormat::BayerRg8),
            vec![frame_id as u8; 8],
        )
    }

    fn make_observer(logging: FrameLogging) -> (FrameObserver, Arc<Mutex<Vec<Arc<Image>>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let observer = FrameObserver::new(
            &info(),
            move |image| sink.lock().push(image),
            logging,
            ColorProcessing::Off,
        );
        (observer, received)
    }

    #[test]
    fn fresh_observer_has_no_telemetry() {
        let (observer, _) = make_observer(FrameLogging::Off);
        let telemetry = observer.telemetry();
        assert!(!telemetry.captured_at.is_valid());
        assert!(!telemetry.frame_id.is_valid());
        assert!(!telemetry.status.is_valid());
        assert_eq!(telemetry.frames_received, 0);
    }

    #[test]
    fn good_frame_reaches_sink_and_updates_telemetry() {
        let (observer, received) = make_observer(FrameLogging::Off);
        observer.on_frame(&bayer(7).as_raw());

        let images = received.lock();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].frame_id(), 7);

        let telemetry = observer.telemetry();
        assert_eq!(*telemetry.frame_id.get(), 7);
        assert_eq!(*telemetry.status.get(), FrameStatus::Complete);
        assert!(telemetry.captured_at.is_valid());
        assert_eq!(telemetry.frames_converted, 1);
    }

    #[test]
    fn bad_status_never_reaches_sink_but_is_recorded() {
        let (observer, received) = make_observer(FrameLogging::Off);
        observer.on_frame(&bayer(1).with_status(FrameStatus::Incomplete).as_raw());

        assert!(received.lock().is_empty());
        let telemetry = observer.telemetry();
        assert_eq!(*telemetry.status.get(), FrameStatus::Incomplete);
        assert!(!telemetry.frame_id.is_valid());
        assert_eq!(telemetry.frames_dropped, 1);
    }

    #[test]
    fn unconvertible_frame_is_dropped() {
        let (observer, received) = make_observer(FrameLogging::Off);
        let short = FrameBuffer::complete(
            1,
            FrameFormat::new(4, 4, PixelFormat::Mono8),
            vec![0u8; 3],
        );
        observer.on_frame(&short.as_raw());

        assert!(received.lock().is_empty());
        assert_eq!(observer.telemetry().frames_dropped, 1);
    }

    #[test]
    fn color_mode_applies_from_next_frame() {
        let (observer, received) = make_observer(FrameLogging::Off);
        observer.on_frame(&bayer(1).as_raw());
        observer.set_color_processing(ColorProcessing::Bilinear);
        observer.on_frame(&bayer(2).as_raw());

        let images = received.lock();
        assert!(images[0].pixels().as_luma8().is_some());
        assert!(images[1].pixels().as_rgb8().is_some());
        assert_eq!(observer.color_processing(), ColorProcessing::Bilinear);
        assert_eq!(observer.frame_logging(), FrameLogging::Off);
    }

    #[test]
    fn id_gaps_count_as_missed_frames() {
        let (observer, _) = make_observer(FrameLogging::Off);
        for id in [1, 2, 5, 6, 10] {
            observer.on_frame(&bayer(id).as_raw());
        }
        assert_eq!(observer.telemetry().frames_missed, 5);
    }

    #[test]
    #[traced_test]
    fn errors_only_logs_one_line_per_bad_frame() {
        let (observer, _) = make_observer(FrameLogging::ErrorsOnly);
        observer.on_frame(&bayer(1).as_raw());
        observer.on_frame(&bayer(2).with_status(FrameStatus::TooSmall).as_raw());
        observer.on_frame(&bayer(3).as_raw());

        logs_assert(|lines: &[&str]| {
            let errors = lines.iter().filter(|l| l.contains("Frame dropped")).count();
            let summaries = lines.iter().filter(|l| l.contains("Frame received")).count();
            match (errors, summaries) {
                (1, 0) => Ok(()),
                other => Err(format!("expected (1 error, 0 summaries), got {other:?}")),
            }
        });
    }

    #[test]
    #[traced_test]
    fn warnings_level_logs_first_frame_then_timing() {
        let (observer, _) = make_observer(FrameLogging::WarningsAndErrors);
        observer.on_frame(&bayer(1).as_raw());
        observer.on_frame(&bayer(3).as_raw());

        assert!(logs_contain("first frame"));
        assert!(logs_contain("fps"));
        assert!(logs_contain("1 frame(s) missing before frame 3"));
        assert!(!logs_contain("Frame converted"));
    }

    #[test]
    #[traced_test]
    fn verbose_adds_conversion_details() {
        let (observer, received) = make_observer(FrameLogging::Verbose);
        observer.on_frame(&bayer(1).as_raw());

        assert_eq!(received.lock().len(), 1);
        assert!(logs_contain("first frame"));
        assert!(logs_contain("Frame converted"));
        assert!(logs_contain("convert_us"));
    }

    #[test]
    #[traced_test]
    fn logging_off_is_silent() {
        let (observer, _) = make_observer(FrameLogging::Off);
        observer.on_frame(&bayer(1).with_status(FrameStatus::Invalid).as_raw());
        observer.on_frame(&bayer(4).as_raw());

        assert!(!logs_contain("Frame dropped"));
        assert!(!logs_contain("missing"));
        assert!(!logs_contain("Frame received"));
    }
}
