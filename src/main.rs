//! camlatch viewer: opens every camera and polls each for its latest frame

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camlatch::driver::{Driver, SimDriver};
use camlatch::{CameraController, Config, System};
use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};

fn select_driver(config: &Config) -> Result<Arc<dyn Driver>> {
    let requested = std::env::var("CAMLATCH_DRIVER").unwrap_or_else(|_| "sim".into());
    match requested.as_str() {
        "sim" => Ok(Arc::new(SimDriver::from_config(&config.simulator))),
        #[cfg(feature = "v4l2")]
        "v4l2" => Ok(Arc::new(camlatch::driver::V4l2Driver::new())),
        other => Err(eyre!("Unknown driver: {other}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camlatch=info".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("camlatch launching...");

    // Load configuration
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("camlatch.toml"));
    let config = Config::load(Some(&path))?;

    let system = System::startup(select_driver(&config)?)?;

    let mut cameras = Vec::new();
    for camera in system.cameras()? {
        let controller = system.open_camera(&camera.id, &config.acquisition)?;
        info!(
            "Using camera {} - {} ({})",
            controller.id(),
            controller.name(),
            controller.model()
        );
        cameras.push(controller);
    }
    if cameras.is_empty() {
        return Err(eyre!("No cameras found"));
    }

    for camera in &mut cameras {
        camera.start()?;
    }
    info!("Started acquisition.");

    let outcome = run_viewer(&mut cameras, &config).await;

    for camera in &mut cameras {
        camera.stop();
    }
    info!("Stopped acquisition.");
    outcome?;

    if let Some(snapshot) = &config.viewer.snapshot {
        save_snapshot(&cameras, snapshot)?;
    }

    drop(cameras);
    system.shutdown();
    info!("camlatch shutting down");
    Ok(())
}

/// Polls every camera at the configured cadence until Ctrl-C or the
/// configured run time elapses, cycling acquisition if asked to.
async fn run_viewer(cameras: &mut [CameraController], config: &Config) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_millis(
        config.viewer.poll_interval_ms.max(1),
    ));
    let deadline = config
        .viewer
        .run_for_secs
        .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
    let mut restart = config.viewer.restart_every_secs.map(|secs| {
        let period = Duration::from_secs(secs.max(1));
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut frames = vec![0u64; cameras.len()];
    let mut window = Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut ctrl_c => {
                info!("Interrupt received");
                break;
            }
            _ = sleep_until(deadline) => {
                info!("Run time elapsed");
                break;
            }
            _ = next_tick(&mut restart) => {
                for camera in cameras.iter_mut() {
                    camera.stop();
                    camera.start()?;
                }
                info!("Restarted acquisition.");
                continue;
            }
        }

        for (index, camera) in cameras.iter().enumerate() {
            if camera.take_new_frame().is_some() {
                frames[index] += 1;
            }
        }

        let elapsed = window.elapsed();
        if elapsed >= Duration::from_secs(1) {
            for (index, camera) in cameras.iter().enumerate() {
                let fps = frames[index] as f64 / elapsed.as_secs_f64();
                match camera.telemetry() {
                    Some(telemetry) => info!(
                        camera = %camera.id(),
                        dropped = telemetry.frames_dropped,
                        missed = telemetry.frames_missed,
                        "Displaying {fps:.1} fps"
                    ),
                    None => warn!(camera = %camera.id(), "Camera is not acquiring"),
                }
            }
            frames.iter_mut().for_each(|count| *count = 0);
            window = Instant::now();
        }
    }
    Ok(())
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn save_snapshot(cameras: &[CameraController], path: &std::path::Path) -> Result<()> {
    let Some(image) = cameras.iter().find_map(|camera| camera.current_frame()) else {
        warn!("No frame captured, snapshot skipped");
        return Ok(());
    };
    image.pixels().save(path)?;
    info!(
        frame_id = image.frame_id(),
        "Saved snapshot to {}",
        path.display()
    );
    Ok(())
}
