use std::sync::Arc;

use andor3::{AndorCamera, CameraConfig, CycleMode};
use sdk3::sim::SimCam;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let driver = Arc::new(SimCam::new());
    let mut camera = AndorCamera::open(driver, CameraConfig::default())?;
    println!("opened camera '{}' (model {})", camera.camera_name(), camera.camera_model());

    let exposure = camera.set_exposure_time(0.005)?;
    let rate = camera.set_frame_rate(25.0)?;
    println!("exposure {} s, frame rate {} Hz", exposure, rate);

    camera.set_cycle_mode(CycleMode::Continuous)?;
    camera.set_metadata_enabled(true)?;
    camera.start_recording()?;

    let aoi = camera.aoi()?;
    let mut frame = vec![0u8; camera.decoded_frame_len()];
    for _ in 0..10 {
        match camera.grab(&mut frame) {
            Ok(info) => {
                let device = info.device.expect("metadata is enabled");
                println!(
                    "  frame {} (host {}): {}x{}, timestamp {}",
                    device.frame_number, info.host.fno, aoi.width, aoi.height, device.timestamp
                );
            }
            Err(andor3::Error::Timeout) => {
                println!("  grab timed out, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }

    camera.stop_recording()?;
    Ok(())
}
