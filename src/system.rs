//! Process-wide driver lifetime and camera discovery.
//!
//! Exactly one [`System`] may be alive per process. Dropping it shuts the
//! driver down; controllers opened through it must be dropped first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::capture::CameraController;
use crate::driver::{CameraId, CameraInfo, Driver};
use crate::error::{DriverStatus, Error, LifecycleError, Result};
use crate::AcquisitionConfig;

static SYSTEM_ACTIVE: AtomicBool = AtomicBool::new(false);

pub struct System {
    driver: Arc<dyn Driver>,
}

impl System {
    pub fn startup(driver: Arc<dyn Driver>) -> Result<Self> {
        if SYSTEM_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(LifecycleError::SystemAlreadyStarted.into());
        }

        if let Err(err) = driver.startup() {
            SYSTEM_ACTIVE.store(false, Ordering::Release);
            return Err(err.into());
        }

        info!("Camera system started");
        Ok(Self { driver })
    }

    pub fn is_running() -> bool {
        SYSTEM_ACTIVE.load(Ordering::Acquire)
    }

    pub fn cameras(&self) -> Result<Vec<CameraInfo>> {
        Ok(self.driver.list_cameras()?)
    }

    pub fn open_camera(
        &self,
        id: &CameraId,
        config: &AcquisitionConfig,
    ) -> Result<CameraController> {
        let camera = self.driver.open_camera(id).map_err(|err| {
            if err.status == DriverStatus::NotFound {
                Error::from(LifecycleError::UnknownCamera {
                    camera: id.to_string(),
                })
            } else {
                Error::from(err)
            }
        })?;
        info!(camera = %id, model = %camera.info().model, "Camera opened");
        CameraController::new(camera, config)
    }

    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.driver.shutdown();
        SYSTEM_ACTIVE.store(false, Ordering::Release);
        info!("Camera system shut down");
    }
}
