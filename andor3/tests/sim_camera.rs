//! Full-session tests against the simulated device.

use std::sync::Arc;
use std::time::{Duration, Instant};

use approx::assert_relative_eq;
use byteorder::{ByteOrder, LittleEndian};

use andor3::{AndorCamera, CameraConfig, CycleMode, Error, FanSpeed, PixelEncoding, TriggerSource};
use sdk3::sim::SimCam;
use sdk3::Driver;

fn open_sim() -> (Arc<SimCam>, AndorCamera) {
    let sim = Arc::new(SimCam::new());
    let camera = AndorCamera::open(sim.clone(), CameraConfig::default()).unwrap();
    (sim, camera)
}

fn pixels(frame: &[u8]) -> Vec<u16> {
    frame.chunks_exact(2).map(LittleEndian::read_u16).collect()
}

#[test]
fn open_reads_the_initial_state() {
    let (_sim, camera) = open_sim();
    assert_eq!(camera.camera_model(), "SIMCAM CMOS");
    assert!(camera.is_simulated());
    assert!(!camera.is_recording());
    assert!(camera.is_connected());

    let state = camera.cached_state();
    assert_eq!(state.aoi.width, 64);
    assert_eq!(state.aoi.height, 48);
    assert_eq!(state.aoi.stride, 128);
    assert_eq!(state.pixel_encoding, Some(PixelEncoding::Mono16));
    assert_eq!(state.image_size_bytes, 128 * 48);
    assert_relative_eq!(state.frame_rate, 30.0);
}

#[test]
fn closing_the_session_releases_the_device() {
    let sim = Arc::new(SimCam::new());
    {
        let _camera = AndorCamera::open(sim.clone(), CameraConfig::default()).unwrap();
        assert_eq!(sim.open(0).unwrap_err().code, 38);
    }
    // Dropped sessions close their handle.
    let h = sim.open(0).unwrap();
    sim.close(h).unwrap();
}

#[test]
fn integer_write_out_of_range_is_rejected() {
    let (_sim, mut camera) = open_sim();
    match camera.set_aoi_width(5000) {
        Err(Error::IntOutOfRange { value, min, max, .. }) => {
            assert_eq!(value, 5000);
            assert_eq!(min, 1);
            assert_eq!(max, 2560);
        }
        other => panic!("expected an out-of-range rejection, got {:?}", other.err()),
    }
    // The device value is unchanged.
    assert_eq!(camera.aoi().unwrap().width, 64);
}

#[test]
fn enum_write_out_of_range_is_rejected() {
    let (_sim, mut camera) = open_sim();
    match camera.set_trigger_mode_index(99) {
        Err(Error::EnumOutOfRange { index, count, .. }) => {
            assert_eq!(index, 99);
            assert_eq!(count, 5);
        }
        other => panic!("expected an out-of-range rejection, got {:?}", other.err()),
    }
    assert_eq!(camera.trigger_mode_index().unwrap(), 0);
}

#[test]
fn float_write_reads_back_the_clamped_value() {
    let (_sim, mut camera) = open_sim();
    let stored = camera.set_exposure_time(0.0123456).unwrap();
    assert_relative_eq!(stored, 0.01235, epsilon = 1e-9);
    assert_relative_eq!(camera.exposure_time().unwrap(), stored);
}

#[test]
fn float_write_out_of_range_leaves_the_device_unchanged() {
    let (_sim, mut camera) = open_sim();
    assert!(matches!(
        camera.set_frame_rate(1000.0),
        Err(Error::FloatOutOfRange { .. })
    ));
    assert_relative_eq!(camera.frame_rate().unwrap(), 30.0);
}

#[test]
fn runtime_access_change_denies_the_write() {
    let (_sim, mut camera) = open_sim();
    camera.set_aoi_top(5).unwrap();
    camera.set_vertically_centered_aoi(true).unwrap();
    match camera.set_aoi_top(9) {
        Err(Error::AccessDenied { feature }) => assert_eq!(feature, "AOITop"),
        other => panic!("expected an access denial, got {:?}", other.err()),
    }
    camera.set_vertically_centered_aoi(false).unwrap();
    camera.set_aoi_top(9).unwrap();
}

#[test]
fn unimplemented_feature_is_access_denied() {
    let (sim, mut camera) = open_sim();
    sim.remove_feature("FanSpeed");
    assert!(matches!(camera.fan_speed(), Err(Error::AccessDenied { .. })));
    assert!(matches!(
        camera.set_fan_speed(FanSpeed::Low),
        Err(Error::AccessDenied { .. })
    ));
}

#[test]
fn enum_string_surface_round_trips() {
    let (_sim, mut camera) = open_sim();
    camera.set_fan_speed(FanSpeed::Low).unwrap();
    assert_eq!(camera.fan_speed().unwrap(), FanSpeed::Low);
    assert_eq!(camera.set_cycle_mode(CycleMode::Fixed).unwrap(), CycleMode::Fixed);
    camera.set_pixel_encoding(PixelEncoding::Mono12Packed).unwrap();
    assert_eq!(camera.pixel_encoding().unwrap(), PixelEncoding::Mono12Packed);
    // The cached geometry followed the encoding change.
    assert_relative_eq!(camera.cached_state().bytes_per_pixel, 1.5);
}

#[test]
fn fixed_mode_queues_exactly_frame_count_slots() {
    let (sim, mut camera) = open_sim();
    camera.set_cycle_mode(CycleMode::Fixed).unwrap();
    camera.set_frame_count(7).unwrap();
    camera.start_recording().unwrap();
    assert_eq!(sim.queued_total(), 7);
    assert!(camera.is_recording());

    let mut frame = vec![0u8; camera.decoded_frame_len()];
    for _ in 0..7 {
        camera.grab(&mut frame).unwrap();
    }
    // Fixed mode does not re-queue consumed slots.
    assert_eq!(sim.queued_total(), 7);
    assert!(matches!(camera.grab(&mut frame), Err(Error::Timeout)));

    camera.stop_recording().unwrap();
    assert!(!camera.is_recording());
}

#[test]
fn continuous_mode_requeues_each_grabbed_slot() {
    let sim = Arc::new(SimCam::new());
    let config = CameraConfig {
        num_buffers: 4,
        ..CameraConfig::default()
    };
    let mut camera = AndorCamera::open(sim.clone(), config).unwrap();
    camera.start_recording().unwrap();
    assert_eq!(sim.queued_total(), 4);

    let mut frame = vec![0u8; camera.decoded_frame_len()];
    camera.grab(&mut frame).unwrap();
    assert_eq!(sim.queued_total(), 5);
    camera.grab(&mut frame).unwrap();
    assert_eq!(sim.queued_total(), 6);
    assert_eq!(sim.queued_len(), 4);
}

#[test]
fn queue_failure_aborts_before_the_start_command() {
    let (sim, mut camera) = open_sim();
    sim.fail_queue_at(3);
    assert!(matches!(
        camera.start_recording(),
        Err(Error::Device { .. })
    ));
    assert!(!camera.is_recording());
    // The device acquisition state was never started.
    assert!(!sim
        .get_bool(1, &sdk3::encode_wide("CameraAcquiring"))
        .unwrap());
}

#[test]
fn grab_without_recording_is_an_error() {
    let (_sim, mut camera) = open_sim();
    let mut frame = vec![0u8; camera.decoded_frame_len()];
    assert!(matches!(
        camera.grab(&mut frame),
        Err(Error::InvalidState(_))
    ));
}

#[test]
fn grab_validates_the_output_buffer_size() {
    let (_sim, mut camera) = open_sim();
    camera.start_recording().unwrap();
    let mut short = vec![0u8; camera.decoded_frame_len() - 2];
    assert!(matches!(
        camera.grab(&mut short),
        Err(Error::OutputSizeMismatch { .. })
    ));
}

#[test]
fn metadata_frames_carry_the_bcd_header_and_pattern() {
    let (_sim, mut camera) = open_sim();
    // 25 Hz divides the 100 MHz timestamp clock exactly.
    camera.set_frame_rate(25.0).unwrap();
    camera.set_metadata_enabled(true).unwrap();
    camera.start_recording().unwrap();

    let mut frame = vec![0u8; camera.decoded_frame_len()];
    let info = camera.grab(&mut frame).unwrap();
    let device = info.device.expect("metadata-enabled grabs carry device timing");
    assert_eq!(device.frame_number, 1);
    assert_eq!(device.timestamp, 1_000_000);
    assert_eq!(info.host.fno, 1);

    let px = pixels(&frame);
    // Frame number 1 in pixels 0..4.
    assert_eq!(&px[0..4], &[0x0000, 0x0000, 0x0000, 0x0001]);
    // Timestamp 1_000_000 is twenty digits: ...0001000000.
    assert_eq!(px[4..14].iter().filter(|&&p| p != 0).count(), 1);
    assert_eq!(px[10], 0x0001);
    // Past the header, the decoded payload shows the sensor pattern with
    // padding stripped: pixel (x, y) of frame 0 is x + y.
    assert_eq!(px[14], 14);
    assert_eq!(px[64], 1);

    let second = camera.grab(&mut frame).unwrap().device.unwrap();
    assert_eq!(second.frame_number, 2);
    assert_eq!(second.timestamp, 1_000_000 + 4_000_000);
}

#[test]
fn frame_sequence_resets_at_each_recording_start() {
    let (_sim, mut camera) = open_sim();
    camera.set_frame_rate(25.0).unwrap();
    camera.set_metadata_enabled(true).unwrap();
    camera.set_cycle_mode(CycleMode::Fixed).unwrap();
    camera.set_frame_count(6).unwrap();
    camera.start_recording().unwrap();

    let mut frame = vec![0u8; camera.decoded_frame_len()];
    assert_eq!(camera.grab(&mut frame).unwrap().device.unwrap().frame_number, 1);
    assert_eq!(camera.grab(&mut frame).unwrap().device.unwrap().frame_number, 2);
    camera.stop_recording().unwrap();

    // A second recording resets the sequence baseline even though the
    // hardware clock keeps running.
    camera.start_recording().unwrap();
    assert_eq!(camera.grab(&mut frame).unwrap().device.unwrap().frame_number, 1);
}

#[test]
fn software_trigger_counts_grabs_not_timestamps() {
    let (_sim, mut camera) = open_sim();
    camera.set_metadata_enabled(true).unwrap();
    camera.set_trigger_source(TriggerSource::Software).unwrap();
    camera.start_recording().unwrap();

    let mut frame = vec![0u8; camera.decoded_frame_len()];
    // No trigger issued: the wait runs out.
    assert!(matches!(camera.grab(&mut frame), Err(Error::Timeout)));

    for expected in 1..=3u64 {
        camera.trigger().unwrap();
        let device = camera.grab(&mut frame).unwrap().device.unwrap();
        assert_eq!(device.frame_number, expected);
    }
}

#[test]
fn metadata_grab_needs_room_for_the_frame_header() {
    let (sim, mut camera) = open_sim();
    camera.set_aoi_width(4).unwrap();
    camera.set_aoi_height(2).unwrap();
    camera.set_metadata_enabled(true).unwrap();
    camera.start_recording().unwrap();
    let queued_after_start = sim.queued_total();

    // 4x2 Mono16 is only 16 bytes, less than the 14-pixel header.
    let mut frame = vec![0u8; camera.decoded_frame_len()];
    assert_eq!(frame.len(), 16);
    match camera.grab(&mut frame) {
        Err(Error::OutputSizeMismatch { needed, got }) => {
            assert_eq!(needed, 28);
            assert_eq!(got, 16);
        }
        other => panic!("expected a header-size rejection, got {:?}", other.err()),
    }
    // The slot still went back into the ring.
    assert_eq!(sim.queued_total(), queued_after_start + 1);
}

#[test]
fn corrupt_metadata_fails_the_grab_but_keeps_the_ring_fed() {
    let (sim, mut camera) = open_sim();
    camera.set_frame_rate(25.0).unwrap();
    camera.set_metadata_enabled(true).unwrap();
    camera.start_recording().unwrap();
    let queued_after_start = sim.queued_total();

    sim.corrupt_metadata(true);
    let mut frame = vec![0u8; camera.decoded_frame_len()];
    match camera.grab(&mut frame) {
        Err(Error::MetadataCorrupt { expected, found }) => {
            assert_eq!(expected, 1);
            assert_eq!(found, 0);
        }
        other => panic!("expected corrupt metadata, got {:?}", other.err()),
    }
    // The slot went back into the ring despite the failure.
    assert_eq!(sim.queued_total(), queued_after_start + 1);

    sim.corrupt_metadata(false);
    let device = camera.grab(&mut frame).unwrap().device.unwrap();
    // The failed frame never advanced the sequence.
    assert_eq!(device.frame_number, 1);
}

#[test]
fn mirror_applies_device_side_changes() {
    // A non-simulated model registers change notifications.
    let sim = Arc::new(SimCam::with_model("NEO 5.5 sCMOS"));
    let camera = AndorCamera::open(sim.clone(), CameraConfig::default()).unwrap();
    assert!(!camera.is_simulated());

    sim.set_float(1, &sdk3::encode_wide("FrameRate"), 50.0).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if (camera.cached_state().frame_rate - 50.0).abs() < f64::EPSILON {
            break;
        }
        assert!(Instant::now() < deadline, "mirror never applied the update");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn presence_loss_degrades_the_session() {
    let sim = Arc::new(SimCam::with_model("NEO 5.5 sCMOS"));
    let camera = AndorCamera::open(sim.clone(), CameraConfig::default()).unwrap();
    assert!(camera.is_connected());

    sim.set_camera_present(false);
    let deadline = Instant::now() + Duration::from_secs(2);
    while camera.is_connected() {
        assert!(Instant::now() < deadline, "presence loss never propagated");
        std::thread::sleep(Duration::from_millis(1));
    }
}
