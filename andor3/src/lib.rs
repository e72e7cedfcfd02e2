//! Camera session layer for SDK3 feature-tree sCMOS cameras.
//!
//! The device is reached through the [`sdk3::Driver`] trait; this crate
//! adds the typed, access-checked feature surface, the acquisition buffer
//! ring, the frame decode pipeline (metadata trailer, frame-number
//! reconciliation, in-band BCD header) and the device-driven cache
//! mirror.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use sdk3::{encode_wide, AtWc, Driver, Handle};

pub use andor3_types::{
    AoiBinning, CycleMode, FanSpeed, PixelEncoding, ShutteringMode, TriggerSource,
};
pub use sdk3::SdkError;

mod buffers;
mod decode;
mod mirror;
mod proxy;
mod sequence;

use buffers::FrameBuffers;
use proxy::{Proxy, Warn};
use sequence::{FrameSequence, SequenceParams};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The feature is unimplemented, unreadable or unwritable in the
    /// current device state. Already reported; the value is unchanged.
    #[error("access denied for feature '{feature}'")]
    AccessDenied { feature: String },
    #[error("value {value} is out of range for feature '{feature}': current range is [{min}; {max}]")]
    IntOutOfRange {
        feature: String,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("value {value} is out of range for feature '{feature}': current range is [{min}; {max}]")]
    FloatOutOfRange {
        feature: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("enumeration index {index} is out of range [0, {count}) for feature '{feature}'")]
    EnumOutOfRange {
        feature: String,
        index: i32,
        count: i32,
    },
    /// A driver primitive failed; carries the device's own error code and
    /// its description.
    #[error("could not {context}: {source}")]
    Device { context: String, source: SdkError },
    #[error("metadata format error: expected chunk id {expected}, found {found}")]
    MetadataCorrupt { expected: u32, found: u32 },
    #[error("metadata trailer needs {needed} bytes but only {len} are present")]
    MetadataTruncated { needed: usize, len: usize },
    #[error("timed out waiting for a frame")]
    Timeout,
    #[error("{0}")]
    InvalidState(&'static str),
    #[error("output buffer holds {got} bytes but the decoded frame needs {needed}")]
    OutputSizeMismatch { needed: usize, got: usize },
    #[error("the device returned a buffer that was never queued")]
    UnknownBuffer,
    #[error(transparent)]
    UnknownVariant(#[from] andor3_types::UnknownVariant),
}

fn device_error(context: &str, e: SdkError) -> Error {
    warn!("could not {}: {} ({})", context, e.msg, e.code);
    Error::Device {
        context: context.to_string(),
        source: e,
    }
}

/// Device enumeration indices of the canonical trigger sources.
///
/// The mapping between enumeration indices and trigger sources differs
/// between firmware revisions, so it is configuration, not a constant.
/// The default follows the vendor-documented ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerMap {
    pub auto: i32,
    pub software: i32,
    pub external: i32,
}

impl Default for TriggerMap {
    fn default() -> Self {
        Self {
            auto: 0,
            software: 1,
            external: 2,
        }
    }
}

impl TriggerMap {
    /// The ordering observed on Neo units running firmware V3, which
    /// disagrees with the vendor documentation.
    pub fn neo_firmware_v3() -> Self {
        Self {
            auto: 0,
            software: 4,
            external: 6,
        }
    }

    pub fn source_for_index(&self, index: i32) -> Option<TriggerSource> {
        if index == self.auto {
            Some(TriggerSource::Auto)
        } else if index == self.software {
            Some(TriggerSource::Software)
        } else if index == self.external {
            Some(TriggerSource::External)
        } else {
            None
        }
    }

    pub fn index_for_source(&self, source: TriggerSource) -> i32 {
        match source {
            TriggerSource::Auto => self.auto,
            TriggerSource::Software => self.software,
            TriggerSource::External => self.external,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Index passed to the driver's open call.
    pub device_index: i64,
    /// Ring depth in continuous cycle mode.
    pub num_buffers: usize,
    /// Bound on each wait for a filled buffer, in milliseconds.
    pub wait_timeout_ms: u32,
    pub trigger_map: TriggerMap,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            num_buffers: 10,
            wait_timeout_ms: 10_000,
            trigger_map: TriggerMap::default(),
        }
    }
}

/// Cached device state, kept synchronized by property writes and by the
/// live mirror.
#[derive(Debug, Default)]
pub(crate) struct Cache {
    aoi_left: i64,
    aoi_top: i64,
    aoi_width: i64,
    aoi_height: i64,
    aoi_stride: i64,
    pixel_encoding: Option<PixelEncoding>,
    pixel_encoding_wide: Vec<AtWc>,
    bytes_per_pixel: f64,
    frame_rate: f64,
    frame_rate_min: f64,
    frame_rate_max: f64,
    image_size: i64,
    sensor_temperature: f64,
    acquiring: bool,
    present: bool,
}

/// A point-in-time copy of the cached device state.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraState {
    pub aoi: Aoi,
    pub pixel_encoding: Option<PixelEncoding>,
    pub bytes_per_pixel: f64,
    pub frame_rate: f64,
    pub frame_rate_range: (f64, f64),
    pub image_size_bytes: i64,
    pub sensor_temperature: f64,
    pub acquiring: bool,
    pub present: bool,
}

/// The rectangular sensor readout window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aoi {
    pub left: i64,
    pub top: i64,
    pub width: i64,
    pub height: i64,
    pub stride: i64,
}

/// Frame timing information measured on the host.
#[derive(Debug, Clone)]
pub struct HostTimingInfo {
    /// Count of successful grabs this recording; drops are invisible here.
    pub fno: usize,
    pub datetime: chrono::DateTime<chrono::Utc>,
}

/// Frame timing recovered from the device metadata trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTiming {
    /// Reconciled frame number since recording start, starting at 1.
    pub frame_number: u64,
    /// Raw hardware timestamp, in timestamp-clock ticks.
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub host: HostTimingInfo,
    /// Present only when the device embeds metadata in its frames.
    pub device: Option<DeviceTiming>,
}

struct Recording {
    buffers: FrameBuffers,
    cycle: CycleMode,
    metadata: bool,
    sequence: FrameSequence,
    params: SequenceParams,
    host_fno: usize,
}

/// One open camera session.
///
/// Configuration access goes through the typed property methods; frames
/// are produced by [`start_recording`](Self::start_recording) +
/// [`grab`](Self::grab).
pub struct AndorCamera {
    proxy: Proxy,
    config: CameraConfig,
    cache: Arc<Mutex<Cache>>,
    mirror: Option<mirror::Mirror>,
    recording: Option<Recording>,
    /// Buffers of the previous recording; the device may still reference
    /// them until the flush at the next start.
    retired: Option<FrameBuffers>,
    model: String,
    name: String,
    is_sim: bool,
}

const SIM_MODEL: &str = "SIMCAM CMOS";

impl AndorCamera {
    /// Open the device and perform the initial query set. The first
    /// failing query aborts construction.
    pub fn open(driver: Arc<dyn Driver>, config: CameraConfig) -> Result<Self> {
        let handle = driver
            .open(config.device_index)
            .map_err(|e| device_error("open camera", e))?;

        match Self::initialize(driver.clone(), handle, config) {
            Ok(camera) => Ok(camera),
            Err(e) => {
                let _ = driver.close(handle);
                Err(e)
            }
        }
    }

    fn initialize(driver: Arc<dyn Driver>, handle: Handle, config: CameraConfig) -> Result<Self> {
        let init = |feature: &str, e: SdkError| Error::Device {
            context: format!("read '{}' at initialization", feature),
            source: e,
        };
        let g_int = |f: &str| driver.get_int(handle, &encode_wide(f)).map_err(|e| init(f, e));
        let g_float = |f: &str| driver.get_float(handle, &encode_wide(f)).map_err(|e| init(f, e));
        let g_bool = |f: &str| driver.get_bool(handle, &encode_wide(f)).map_err(|e| init(f, e));

        let model = sdk3::decode_wide(
            &driver
                .get_string(handle, &encode_wide("CameraModel"))
                .map_err(|e| init("CameraModel", e))?,
        );
        let is_sim = model == SIM_MODEL;
        let name = if is_sim {
            model.clone()
        } else {
            sdk3::decode_wide(
                &driver
                    .get_string(handle, &encode_wide("CameraName"))
                    .map_err(|e| init("CameraName", e))?,
            )
        };

        let mut cache = Cache {
            present: true,
            ..Cache::default()
        };
        let _exposure = g_float("ExposureTime")?;
        cache.aoi_width = g_int("AOIWidth")?;
        cache.aoi_height = g_int("AOIHeight")?;
        cache.aoi_left = g_int("AOILeft")?;
        cache.aoi_top = g_int("AOITop")?;
        cache.aoi_stride = g_int("AOIStride")?;
        let _sensor_w = g_int("SensorWidth")?;
        let _sensor_h = g_int("SensorHeight")?;
        let _pixel_w = g_float("PixelWidth")?;
        let _pixel_h = g_float("PixelHeight")?;
        let _trigger = driver
            .get_enum_index(handle, &encode_wide("TriggerMode"))
            .map_err(|e| init("TriggerMode", e))?;
        cache.frame_rate = g_float("FrameRate")?;
        cache.sensor_temperature = g_float("SensorTemperature")?;
        let _target = g_float("TargetSensorTemperature")?;
        cache.acquiring = g_bool("CameraAcquiring")?;

        let enc_wide = driver
            .get_enum_index(handle, &encode_wide("PixelEncoding"))
            .and_then(|idx| {
                driver.get_enum_string_by_index(handle, &encode_wide("PixelEncoding"), idx)
            })
            .map_err(|e| init("PixelEncoding", e))?;
        cache.pixel_encoding = sdk3::decode_wide(&enc_wide).parse().ok();
        cache.pixel_encoding_wide = enc_wide;

        cache.image_size = g_int("ImageSizeBytes")?;
        cache.bytes_per_pixel = g_float("BytesPerPixel").unwrap_or(2.0);
        cache.frame_rate_min = driver
            .get_float_min(handle, &encode_wide("FrameRate"))
            .unwrap_or(0.0);
        cache.frame_rate_max = driver
            .get_float_max(handle, &encode_wide("FrameRate"))
            .unwrap_or(0.0);

        let proxy = Proxy {
            driver,
            handle,
            quiet_sim_reads: is_sim,
        };
        let cache = Arc::new(Mutex::new(cache));

        // Change notifications are only available on real hardware.
        let mirror = if is_sim {
            None
        } else {
            Some(mirror::Mirror::start(proxy.clone(), cache.clone())?)
        };

        Ok(Self {
            proxy,
            config,
            cache,
            mirror,
            recording: None,
            retired: None,
            model,
            name,
            is_sim,
        })
    }

    pub fn camera_model(&self) -> &str {
        &self.model
    }

    pub fn camera_name(&self) -> &str {
        &self.name
    }

    pub fn is_simulated(&self) -> bool {
        self.is_sim
    }

    /// A copy of the cached device state.
    pub fn cached_state(&self) -> CameraState {
        let c = self.cache.lock();
        CameraState {
            aoi: Aoi {
                left: c.aoi_left,
                top: c.aoi_top,
                width: c.aoi_width,
                height: c.aoi_height,
                stride: c.aoi_stride,
            },
            pixel_encoding: c.pixel_encoding,
            bytes_per_pixel: c.bytes_per_pixel,
            frame_rate: c.frame_rate,
            frame_rate_range: (c.frame_rate_min, c.frame_rate_max),
            image_size_bytes: c.image_size,
            sensor_temperature: c.sensor_temperature,
            acquiring: c.acquiring,
            present: c.present,
        }
    }

    // ----- configuration surface ------------------------------------

    /// Exposure time in seconds (`ExposureTime`).
    pub fn exposure_time(&self) -> Result<f64> {
        self.proxy.read_float("ExposureTime")
    }

    /// Set the exposure time and return the value the device actually
    /// stored, which may be clamped or rounded.
    pub fn set_exposure_time(&mut self, seconds: f64) -> Result<f64> {
        self.proxy.write_float("ExposureTime", seconds)?;
        self.proxy.read_float("ExposureTime")
    }

    /// Frame rate in Hz (`FrameRate`).
    pub fn frame_rate(&self) -> Result<f64> {
        self.proxy.read_float("FrameRate")
    }

    pub fn set_frame_rate(&mut self, hz: f64) -> Result<f64> {
        self.proxy.write_float("FrameRate", hz)?;
        let actual = self.proxy.read_float("FrameRate")?;
        self.cache.lock().frame_rate = actual;
        Ok(actual)
    }

    pub fn frame_rate_range(&self) -> Result<(f64, f64)> {
        Ok((
            self.proxy.read_float_min("FrameRate")?,
            self.proxy.read_float_max("FrameRate")?,
        ))
    }

    /// The current readout window (`AOILeft`/`AOITop`/`AOIWidth`/
    /// `AOIHeight`/`AOIStride`).
    pub fn aoi(&self) -> Result<Aoi> {
        Ok(Aoi {
            left: self.proxy.read_integer("AOILeft")?,
            top: self.proxy.read_integer("AOITop")?,
            width: self.proxy.read_integer("AOIWidth")?,
            height: self.proxy.read_integer("AOIHeight")?,
            stride: self.proxy.read_integer("AOIStride")?,
        })
    }

    pub fn set_aoi_width(&mut self, value: i64) -> Result<()> {
        self.proxy.write_integer("AOIWidth", value)?;
        self.cache.lock().aoi_width = value;
        Ok(())
    }

    pub fn set_aoi_height(&mut self, value: i64) -> Result<()> {
        self.proxy.write_integer("AOIHeight", value)?;
        self.cache.lock().aoi_height = value;
        Ok(())
    }

    pub fn set_aoi_left(&mut self, value: i64) -> Result<()> {
        self.proxy.write_integer("AOILeft", value)?;
        self.cache.lock().aoi_left = value;
        Ok(())
    }

    pub fn set_aoi_top(&mut self, value: i64) -> Result<()> {
        self.proxy.write_integer("AOITop", value)?;
        self.cache.lock().aoi_top = value;
        Ok(())
    }

    /// Sensor size in pixels (`SensorWidth`, `SensorHeight`).
    pub fn sensor_size(&self) -> Result<(i64, i64)> {
        Ok((
            self.proxy.read_integer("SensorWidth")?,
            self.proxy.read_integer("SensorHeight")?,
        ))
    }

    /// Physical pixel pitch in micrometers (`PixelWidth`, `PixelHeight`).
    pub fn pixel_size_um(&self) -> Result<(f64, f64)> {
        Ok((
            self.proxy.read_float("PixelWidth")?,
            self.proxy.read_float("PixelHeight")?,
        ))
    }

    pub fn sensor_temperature(&self) -> Result<f64> {
        self.proxy.read_float("SensorTemperature")
    }

    pub fn target_sensor_temperature(&self) -> Result<f64> {
        self.proxy.read_float("TargetSensorTemperature")
    }

    pub fn set_target_sensor_temperature(&mut self, celsius: f64) -> Result<f64> {
        self.proxy.write_float("TargetSensorTemperature", celsius)?;
        self.proxy.read_float("TargetSensorTemperature")
    }

    pub fn fan_speed(&self) -> Result<FanSpeed> {
        Ok(self.proxy.read_string("FanSpeed")?.parse()?)
    }

    pub fn set_fan_speed(&mut self, speed: FanSpeed) -> Result<()> {
        self.proxy.write_string("FanSpeed", speed.as_str())
    }

    pub fn cycle_mode(&self) -> Result<CycleMode> {
        Ok(self.proxy.read_string("CycleMode")?.parse()?)
    }

    /// Set the cycle mode and return what the device reports afterwards.
    pub fn set_cycle_mode(&mut self, mode: CycleMode) -> Result<CycleMode> {
        self.proxy.write_string("CycleMode", mode.as_str())?;
        self.cycle_mode()
    }

    /// The canonical trigger source, if the current enumeration index is
    /// covered by the configured [`TriggerMap`].
    pub fn trigger_source(&self) -> Result<Option<TriggerSource>> {
        let index = self.proxy.read_enum_index("TriggerMode")?;
        Ok(self.config.trigger_map.source_for_index(index))
    }

    pub fn set_trigger_source(&mut self, source: TriggerSource) -> Result<()> {
        let index = self.config.trigger_map.index_for_source(source);
        self.proxy.write_enum_index("TriggerMode", index)
    }

    /// Raw trigger enumeration index, for firmware whose mapping is not
    /// covered by the configured map.
    pub fn trigger_mode_index(&self) -> Result<i32> {
        self.proxy.read_enum_index("TriggerMode")
    }

    pub fn set_trigger_mode_index(&mut self, index: i32) -> Result<()> {
        self.proxy.write_enum_index("TriggerMode", index)
    }

    pub fn electronic_shuttering_mode(&self) -> Result<ShutteringMode> {
        Ok(self.proxy.read_string("ElectronicShutteringMode")?.parse()?)
    }

    pub fn set_electronic_shuttering_mode(&mut self, mode: ShutteringMode) -> Result<()> {
        self.proxy.write_string("ElectronicShutteringMode", mode.as_str())
    }

    pub fn aoi_binning(&self) -> Result<AoiBinning> {
        Ok(self.proxy.read_string("AOIBinning")?.parse()?)
    }

    pub fn set_aoi_binning(&mut self, binning: AoiBinning) -> Result<()> {
        self.proxy.write_string("AOIBinning", binning.as_str())
    }

    /// Raw readout-rate enumeration index. The index-to-rate mapping is
    /// firmware-specific, so no canonical enumeration is offered.
    pub fn pixel_readout_rate_index(&self) -> Result<i32> {
        self.proxy.read_enum_index("PixelReadoutRate")
    }

    pub fn set_pixel_readout_rate_index(&mut self, index: i32) -> Result<()> {
        self.proxy.write_enum_index("PixelReadoutRate", index)
    }

    pub fn pixel_encoding(&self) -> Result<PixelEncoding> {
        Ok(self.proxy.read_string("PixelEncoding")?.parse()?)
    }

    pub fn set_pixel_encoding(&mut self, encoding: PixelEncoding) -> Result<()> {
        self.proxy.write_string("PixelEncoding", encoding.as_str())?;
        // Stride, image size and bytes-per-pixel all follow the encoding.
        self.refresh_geometry()
    }

    /// When enabled, the device centers the readout window vertically and
    /// takes over `AOITop` (which becomes read-only).
    pub fn vertically_centered_aoi(&self) -> Result<bool> {
        self.proxy.read_boolean("VerticallyCentreAOI")
    }

    pub fn set_vertically_centered_aoi(&mut self, enabled: bool) -> Result<()> {
        self.proxy.write_boolean("VerticallyCentreAOI", enabled)
    }

    pub fn accumulate_count(&self) -> Result<i64> {
        self.proxy.read_integer("AccumulateCount")
    }

    pub fn set_accumulate_count(&mut self, count: i64) -> Result<()> {
        self.proxy.write_integer("AccumulateCount", count)
    }

    /// Number of frames acquired per recording in fixed cycle mode.
    pub fn frame_count(&self) -> Result<i64> {
        self.proxy.read_integer("FrameCount")
    }

    pub fn set_frame_count(&mut self, count: i64) -> Result<()> {
        self.proxy.write_integer("FrameCount", count)
    }

    pub fn metadata_enabled(&self) -> Result<bool> {
        self.proxy.read_boolean("MetadataEnable")
    }

    /// Enable or disable the per-frame metadata trailer. Enabling also
    /// turns on the timestamp block that frame decoding requires.
    pub fn set_metadata_enabled(&mut self, enabled: bool) -> Result<()> {
        self.proxy.write_boolean("MetadataEnable", enabled)?;
        if enabled {
            self.proxy.write_boolean("MetadataTimestamp", true)?;
        }
        Ok(())
    }

    pub fn image_size_bytes(&self) -> Result<i64> {
        self.proxy.read_integer("ImageSizeBytes")
    }

    pub fn is_recording(&self) -> bool {
        self.cache.lock().acquiring
    }

    /// False once the device has reported a loss of presence; reads are
    /// then best-effort and writes should be expected to fail.
    pub fn is_connected(&self) -> bool {
        self.cache.lock().present
    }

    // ----- acquisition ----------------------------------------------

    /// Re-read the geometry and encoding fields that frame decoding and
    /// buffer sizing depend on. Image size in particular must never be
    /// taken from a stale cache.
    fn refresh_geometry(&self) -> Result<()> {
        let aoi_width = self.proxy.read_integer("AOIWidth")?;
        let aoi_height = self.proxy.read_integer("AOIHeight")?;
        let aoi_left = self.proxy.read_integer("AOILeft")?;
        let aoi_top = self.proxy.read_integer("AOITop")?;
        let aoi_stride = self.proxy.read_integer("AOIStride")?;
        let image_size = self.proxy.read_integer("ImageSizeBytes")?;
        let (_, enc_wide) = self.proxy.read_enum_wide("PixelEncoding")?;
        let encoding = sdk3::decode_wide(&enc_wide).parse().ok();
        let bytes_per_pixel = self
            .proxy
            .read_float("BytesPerPixel")
            .unwrap_or_else(|_| self.cache.lock().bytes_per_pixel);

        let mut c = self.cache.lock();
        c.aoi_width = aoi_width;
        c.aoi_height = aoi_height;
        c.aoi_left = aoi_left;
        c.aoi_top = aoi_top;
        c.aoi_stride = aoi_stride;
        c.image_size = image_size;
        c.pixel_encoding = encoding;
        c.pixel_encoding_wide = enc_wide;
        c.bytes_per_pixel = bytes_per_pixel;
        Ok(())
    }

    /// Arm the buffer ring and start the device's acquisition state.
    ///
    /// Previously queued buffers are flushed first; a failure to queue any
    /// slot aborts before the start command is issued.
    pub fn start_recording(&mut self) -> Result<()> {
        if self.recording.is_some() {
            return Err(Error::InvalidState("recording has already been started"));
        }

        self.proxy.flush_buffers()?;
        // Any buffers the device still referenced are now reclaimable.
        drop(self.retired.take());

        self.refresh_geometry()?;
        let cycle = self.cycle_mode()?;
        let metadata = self
            .proxy
            .read_boolean_with("MetadataEnable", Warn::Silent)
            .unwrap_or(false);
        if metadata
            && self
                .proxy
                .read_boolean_with("MetadataFrameInfo", Warn::Silent)
                .unwrap_or(false)
        {
            warn!(
                "MetadataFrameInfo is enabled; frame decoding assumes only the \
                 Ticks and FrameData blocks are present"
            );
        }

        let image_size = self.cache.lock().image_size;
        if image_size <= 0 {
            return Err(Error::InvalidState("device reported a zero image size"));
        }
        let slot_count = match cycle {
            CycleMode::Fixed => {
                let count = self.proxy.read_integer("FrameCount")?;
                if count <= 0 {
                    return Err(Error::InvalidState("fixed cycle mode with a zero frame count"));
                }
                count as usize
            }
            CycleMode::Continuous => self.config.num_buffers,
        };
        if slot_count == 0 {
            return Err(Error::InvalidState("the configured ring depth is zero"));
        }

        let mut frame_buffers = FrameBuffers::allocate(slot_count, image_size as usize);
        for i in 0..slot_count {
            let (ptr, len) = frame_buffers.slot_raw(i);
            if let Err(e) = self.proxy.driver.queue_buffer(self.proxy.handle, ptr, len) {
                // Reclaim whatever was queued; the start command is never
                // issued after a queue failure.
                let _ = self.proxy.driver.flush(self.proxy.handle);
                return Err(device_error("queue an acquisition buffer", e));
            }
        }

        let trigger_index = self.proxy.read_enum_index("TriggerMode")?;
        let auto_trigger = self.config.trigger_map.source_for_index(trigger_index)
            == Some(TriggerSource::Auto);
        let frame_rate = self.proxy.read_float("FrameRate")?;
        let accumulate_count = self
            .proxy
            .read_integer_with("AccumulateCount", Warn::Silent)
            .unwrap_or(1)
            .max(1);
        let clock_frequency = self
            .proxy
            .read_integer_with("TimestampClockFrequency", Warn::Silent)
            .unwrap_or_else(|_| {
                warn!("TimestampClockFrequency unavailable; assuming 100 MHz");
                100_000_000
            }) as u64;

        self.proxy.command("AcquisitionStart")?;

        match self.proxy.read_boolean("CameraAcquiring") {
            Ok(v) => self.cache.lock().acquiring = v,
            Err(e) => warn!("could not read back CameraAcquiring: {}", e),
        }

        self.recording = Some(Recording {
            buffers: frame_buffers,
            cycle,
            metadata,
            sequence: FrameSequence::default(),
            params: SequenceParams {
                auto_trigger,
                frame_rate,
                accumulate_count,
                clock_frequency,
            },
            host_fno: 0,
        });
        Ok(())
    }

    /// Stop the device's acquisition state. The flush and the acquiring
    /// flag read-back are best-effort and reported independently.
    pub fn stop_recording(&mut self) -> Result<()> {
        let recording = self
            .recording
            .take()
            .ok_or(Error::InvalidState("recording has not been started"))?;
        // The device may still hold slot addresses until the next flush,
        // so the buffers survive until the next recording start.
        self.retired = Some(recording.buffers);

        self.proxy.command("AcquisitionStop")?;

        if let Err(e) = self.proxy.flush_buffers() {
            warn!("could not flush remaining queued buffers: {}", e);
        }
        match self.proxy.read_boolean("CameraAcquiring") {
            Ok(v) => self.cache.lock().acquiring = v,
            Err(e) => warn!("could not read back CameraAcquiring: {}", e),
        }
        Ok(())
    }

    /// Issue a software trigger. Ignored with a warning when the current
    /// trigger source is not Software.
    pub fn trigger(&mut self) -> Result<()> {
        let index = self.proxy.read_enum_index("TriggerMode")?;
        if self.config.trigger_map.source_for_index(index) == Some(TriggerSource::Software) {
            self.proxy.command("SoftwareTrigger")
        } else {
            warn!("software trigger ignored: the current trigger source is not Software");
            Ok(())
        }
    }

    /// The number of Mono16 bytes [`grab`](Self::grab) will write, per the
    /// cached geometry.
    pub fn decoded_frame_len(&self) -> usize {
        let c = self.cache.lock();
        (c.aoi_width * c.aoi_height * 2) as usize
    }

    /// Wait for the next filled buffer and decode it into `data` as
    /// Mono16.
    ///
    /// With metadata enabled, the hardware timestamp is recovered from the
    /// trailer, the payload is converted with padding and metadata
    /// stripped, and the first 14 pixels are overwritten with the
    /// BCD-packed frame number and timestamp (frames smaller than 14
    /// pixels are rejected). The slot is re-queued in continuous mode
    /// even when decoding fails, so a corrupt frame does not starve the
    /// ring.
    pub fn grab(&mut self, data: &mut [u8]) -> Result<FrameInfo> {
        let (width, height, stride, enc_wide) = {
            let c = self.cache.lock();
            (c.aoi_width, c.aoi_height, c.aoi_stride, c.pixel_encoding_wide.clone())
        };
        let recording = self
            .recording
            .as_mut()
            .ok_or(Error::InvalidState("recording has not been started"))?;

        let needed = (width * height * 2) as usize;
        if data.len() != needed {
            return Err(Error::OutputSizeMismatch {
                needed,
                got: data.len(),
            });
        }

        let (ptr, size) = self
            .proxy
            .driver
            .wait_buffer(self.proxy.handle, self.config.wait_timeout_ms)
            .map_err(|e| {
                if e.code == sdk3::codes::TIMED_OUT {
                    warn!("timed out waiting for a frame after {} ms", self.config.wait_timeout_ms);
                    Error::Timeout
                } else {
                    device_error("wait for a filled buffer", e)
                }
            })?;
        let index = recording
            .buffers
            .index_of(ptr, size)
            .ok_or(Error::UnknownBuffer)?;

        let decoded = {
            let slot = recording.buffers.slot(index);
            if recording.metadata {
                decode::parse_trailer(slot).and_then(|trailer| {
                    // The in-band header needs 14 pixels of room.
                    if data.len() < decode::FRAME_HEADER_BYTES {
                        return Err(Error::OutputSizeMismatch {
                            needed: decode::FRAME_HEADER_BYTES,
                            got: data.len(),
                        });
                    }
                    convert_frame(
                        &self.proxy,
                        &slot[trailer.payload.clone()],
                        data,
                        width,
                        height,
                        stride,
                        &enc_wide,
                    )?;
                    let frame_number =
                        recording.sequence.advance(trailer.timestamp, &recording.params);
                    decode::stamp_frame_header(data, frame_number, trailer.timestamp);
                    Ok(Some(DeviceTiming {
                        frame_number,
                        timestamp: trailer.timestamp,
                    }))
                })
            } else {
                convert_frame(&self.proxy, slot, data, width, height, stride, &enc_wide)
                    .map(|()| None)
            }
        };

        if recording.cycle == CycleMode::Continuous {
            let (ptr, len) = recording.buffers.slot_raw(index);
            if let Err(e) = self.proxy.driver.queue_buffer(self.proxy.handle, ptr, len) {
                match decoded {
                    Ok(_) => return Err(device_error("re-queue the consumed buffer", e)),
                    Err(decode_err) => {
                        warn!(
                            "could not re-queue the consumed buffer after a failed decode: {} ({})",
                            e.msg, e.code
                        );
                        return Err(decode_err);
                    }
                }
            }
        }

        let device = decoded?;
        recording.host_fno += 1;
        Ok(FrameInfo {
            host: HostTimingInfo {
                fno: recording.host_fno,
                datetime: chrono::Utc::now(),
            },
            device,
        })
    }
}

fn convert_frame(
    proxy: &Proxy,
    src: &[u8],
    dst: &mut [u8],
    width: i64,
    height: i64,
    stride: i64,
    encoding: &[AtWc],
) -> Result<()> {
    proxy
        .driver
        .convert_buffer(
            src,
            dst,
            width as u64,
            height as u64,
            stride as u64,
            encoding,
            &encode_wide("Mono16"),
        )
        .map_err(|e| device_error("convert the frame buffer", e))
}

impl Drop for AndorCamera {
    fn drop(&mut self) {
        if self.recording.is_some() {
            if let Err(e) = self.stop_recording() {
                warn!("could not stop acquisition while closing: {}", e);
            }
        }
        if let Some(mut mirror) = self.mirror.take() {
            mirror.stop(&self.proxy);
        }
        if let Err(e) = self.proxy.driver.close(self.proxy.handle) {
            warn!("could not close the camera handle: {} ({})", e.msg, e.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_map_round_trips_sources() {
        let map = TriggerMap::default();
        for source in [TriggerSource::Auto, TriggerSource::Software, TriggerSource::External] {
            assert_eq!(map.source_for_index(map.index_for_source(source)), Some(source));
        }
        assert_eq!(map.source_for_index(17), None);
    }

    #[test]
    fn neo_map_differs_from_the_documented_ordering() {
        let neo = TriggerMap::neo_firmware_v3();
        assert_eq!(neo.source_for_index(4), Some(TriggerSource::Software));
        assert_eq!(neo.source_for_index(6), Some(TriggerSource::External));
        assert_eq!(neo.source_for_index(1), None);
    }

    #[test]
    fn config_deserializes_with_defaults_and_overrides() {
        let config: CameraConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.num_buffers, 10);
        assert_eq!(config.wait_timeout_ms, 10_000);
        assert_eq!(config.trigger_map, TriggerMap::default());

        let config: CameraConfig =
            serde_json::from_str(r#"{"trigger_map": {"auto": 0, "software": 4, "external": 6}}"#)
                .unwrap();
        assert_eq!(config.trigger_map, TriggerMap::neo_firmware_v3());
    }
}
