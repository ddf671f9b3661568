use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use camlatch::capture::{FrameFormat, PixelFormat};
use camlatch::driver::{CameraId, SimCamera, SimDriver};
use camlatch::{AcquisitionConfig, DriverStatus, Error, LifecycleError, SimulatorConfig, System};
use serial_test::serial;

fn two_camera_driver() -> Arc<SimDriver> {
    let format = FrameFormat::new(4, 2, PixelFormat::Mono8);
    Arc::new(
        SimDriver::new()
            .with_camera(SimCamera::new("DEV_A", format))
            .with_camera(SimCamera::new("DEV_B", format)),
    )
}

#[test]
#[serial]
fn only_one_system_at_a_time() {
    let system = System::startup(two_camera_driver()).unwrap();
    assert!(System::is_running());

    let second = System::startup(two_camera_driver()).err();
    assert!(matches!(
        second,
        Some(Error::Lifecycle(LifecycleError::SystemAlreadyStarted))
    ));

    system.shutdown();
    assert!(!System::is_running());

    let again = System::startup(two_camera_driver()).unwrap();
    drop(again);
}

#[test]
#[serial]
fn lists_and_opens_cameras_exclusively() {
    let system = System::startup(two_camera_driver()).unwrap();

    let ids: Vec<String> = system
        .cameras()
        .unwrap()
        .into_iter()
        .map(|info| info.id.to_string())
        .collect();
    assert_eq!(ids, ["DEV_A", "DEV_B"]);

    let config = AcquisitionConfig::default();
    let camera = system.open_camera(&CameraId::new("DEV_B"), &config).unwrap();
    assert_eq!(camera.id().as_str(), "DEV_B");
    assert_eq!(camera.buffer_count(), config.buffer_count);

    match system.open_camera(&CameraId::new("DEV_B"), &config).err() {
        Some(Error::Driver(err)) => assert_eq!(err.status, DriverStatus::InvalidAccess),
        other => panic!("unexpected result: {other:?}"),
    }

    drop(camera);
    assert!(system.open_camera(&CameraId::new("DEV_B"), &config).is_ok());
}

#[test]
#[serial]
fn unknown_camera_is_a_lifecycle_error() {
    let system = System::startup(two_camera_driver()).unwrap();

    let err = system
        .open_camera(&CameraId::new("DEV_Z"), &AcquisitionConfig::default())
        .err();
    assert!(matches!(
        err,
        Some(Error::Lifecycle(LifecycleError::UnknownCamera { ref camera })) if camera == "DEV_Z"
    ));
}

#[test]
#[serial]
fn generated_stream_reaches_the_consumer() {
    let simulator = SimulatorConfig {
        cameras: 1,
        width: 8,
        height: 4,
        fps: 200,
        pixel_format: PixelFormat::BayerGr8,
        error_every: 0,
    };
    let system = System::startup(Arc::new(SimDriver::from_config(&simulator))).unwrap();
    let cameras = system.cameras().unwrap();
    assert_eq!(cameras.len(), 1);

    let mut camera = system
        .open_camera(&cameras[0].id, &AcquisitionConfig::default())
        .unwrap();
    camera.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let image = loop {
        if let Some(image) = camera.take_new_frame() {
            break image;
        }
        assert!(Instant::now() < deadline, "no frame within 5s");
        thread::sleep(Duration::from_millis(5));
    };
    camera.stop();

    assert_eq!((image.width(), image.height()), (8, 4));
    assert_eq!(image.source().pixel_format, PixelFormat::BayerGr8);
    assert!(camera.telemetry().is_none());
}
