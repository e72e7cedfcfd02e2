//! Software-emulated camera.
//!
//! [`SimCam`] is a complete in-process [`Driver`] with the feature tree of
//! the sCMOS family it stands in for. Queued buffers are filled with a
//! deterministic pixel pattern and, when metadata is enabled, a trailing
//! FrameData + Ticks chunk pair with an advancing hardware timestamp, so
//! the whole acquisition path can be exercised without hardware attached.

use std::collections::{HashMap, VecDeque};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::{codes, decode_wide, AtWc, Driver, FeatureCallback, Handle, SdkError, SdkResult};

const SIM_HANDLE: Handle = 1;

/// Fixed hardware timestamp clock of the simulated sensor, in Hz.
pub const SIM_CLOCK_FREQUENCY: i64 = 100_000_000;

/// Bytes appended after the pixel payload when metadata is enabled:
/// FrameData CID + length fields, then the Ticks block.
pub const SIM_METADATA_BYTES: i64 = 24;

#[derive(Clone)]
enum Node {
    Int {
        value: i64,
        min: i64,
        max: i64,
        writable: bool,
    },
    Float {
        value: f64,
        min: f64,
        max: f64,
        writable: bool,
        /// Device-side rounding applied on write.
        quantum: Option<f64>,
    },
    Bool {
        value: bool,
        writable: bool,
    },
    Enum {
        index: i32,
        values: Vec<&'static str>,
        writable: bool,
    },
    Text {
        value: String,
    },
    Command,
}

struct SimState {
    open: bool,
    features: HashMap<String, Node>,
    queued: VecDeque<(usize, usize)>,
    queued_total: u64,
    flush_count: u64,
    soft_triggers: u32,
    frames_remaining: Option<i64>,
    timestamp: u64,
    frame_index: u64,
    corrupt_metadata: bool,
    fail_queue_at: Option<u64>,
}

/// The simulated camera. Presents itself as "SIMCAM CMOS" unless another
/// model string is requested.
pub struct SimCam {
    state: Mutex<SimState>,
    callbacks: Mutex<HashMap<String, FeatureCallback>>,
}

impl Default for SimCam {
    fn default() -> Self {
        Self::new()
    }
}

fn int_node(value: i64, min: i64, max: i64, writable: bool) -> Node {
    Node::Int {
        value,
        min,
        max,
        writable,
    }
}

fn float_node(value: f64, min: f64, max: f64, writable: bool, quantum: Option<f64>) -> Node {
    Node::Float {
        value,
        min,
        max,
        writable,
        quantum,
    }
}

fn enum_node(index: i32, values: Vec<&'static str>, writable: bool) -> Node {
    Node::Enum {
        index,
        values,
        writable,
    }
}

impl SimCam {
    pub fn new() -> Self {
        Self::with_model("SIMCAM CMOS")
    }

    pub fn with_model(model: &str) -> Self {
        let mut features = HashMap::new();

        features.insert("CameraModel".into(), Node::Text { value: model.into() });
        features.insert(
            "CameraName".into(),
            Node::Text {
                value: format!("{} (simulated)", model),
            },
        );
        features.insert("SerialNumber".into(), Node::Text { value: "SFT-0001".into() });
        features.insert("SoftwareVersion".into(), Node::Text { value: "3.0-sim".into() });

        features.insert("SensorWidth".into(), int_node(2560, 2560, 2560, false));
        features.insert("SensorHeight".into(), int_node(2160, 2160, 2160, false));
        features.insert("AOILeft".into(), int_node(1, 1, 2560, true));
        features.insert("AOITop".into(), int_node(1, 1, 2160, true));
        features.insert("AOIWidth".into(), int_node(64, 1, 2560, true));
        features.insert("AOIHeight".into(), int_node(48, 1, 2160, true));
        // AOIStride and ImageSizeBytes are recomputed from geometry below.
        features.insert("AOIStride".into(), int_node(0, 0, i64::MAX, false));
        features.insert("ImageSizeBytes".into(), int_node(0, 0, i64::MAX, false));
        features.insert("FrameCount".into(), int_node(1, 1, i64::from(u32::MAX), true));
        features.insert("AccumulateCount".into(), int_node(1, 1, 2048, true));
        features.insert("TimestampClock".into(), int_node(0, 0, i64::MAX, false));
        features.insert(
            "TimestampClockFrequency".into(),
            int_node(SIM_CLOCK_FREQUENCY, SIM_CLOCK_FREQUENCY, SIM_CLOCK_FREQUENCY, false),
        );

        features.insert(
            "ExposureTime".into(),
            float_node(0.01, 1e-5, 30.0, true, Some(1e-5)),
        );
        features.insert("FrameRate".into(), float_node(30.0, 0.001, 100.0, true, None));
        features.insert(
            "SensorTemperature".into(),
            float_node(-15.3, -100.0, 100.0, false, None),
        );
        features.insert(
            "TargetSensorTemperature".into(),
            float_node(-15.0, -40.0, 30.0, true, None),
        );
        features.insert("PixelWidth".into(), float_node(6.5, 6.5, 6.5, false, None));
        features.insert("PixelHeight".into(), float_node(6.5, 6.5, 6.5, false, None));
        features.insert("BytesPerPixel".into(), float_node(2.0, 1.0, 4.0, false, None));

        features.insert("CameraAcquiring".into(), Node::Bool { value: false, writable: false });
        features.insert("CameraPresent".into(), Node::Bool { value: true, writable: false });
        features.insert("MetadataEnable".into(), Node::Bool { value: false, writable: true });
        features.insert("MetadataTimestamp".into(), Node::Bool { value: true, writable: true });
        features.insert("MetadataFrameInfo".into(), Node::Bool { value: false, writable: true });
        features.insert("VerticallyCentreAOI".into(), Node::Bool { value: false, writable: true });
        features.insert("SensorCooling".into(), Node::Bool { value: true, writable: true });

        features.insert(
            "TriggerMode".into(),
            enum_node(
                0,
                vec!["Internal", "Software", "External", "External Start", "External Exposure"],
                true,
            ),
        );
        features.insert(
            "PixelEncoding".into(),
            enum_node(2, vec!["Mono12", "Mono12Packed", "Mono16", "Mono32"], true),
        );
        features.insert("CycleMode".into(), enum_node(1, vec!["Fixed", "Continuous"], true));
        features.insert("FanSpeed".into(), enum_node(2, vec!["Off", "Low", "On"], true));
        features.insert(
            "ElectronicShutteringMode".into(),
            enum_node(0, vec!["Rolling", "Global"], true),
        );
        features.insert(
            "AOIBinning".into(),
            enum_node(0, vec!["1x1", "2x2", "3x3", "4x4", "8x8"], true),
        );
        features.insert(
            "PixelReadoutRate".into(),
            enum_node(2, vec!["100 MHz", "200 MHz", "280 MHz"], true),
        );

        features.insert("AcquisitionStart".into(), Node::Command);
        features.insert("AcquisitionStop".into(), Node::Command);
        features.insert("SoftwareTrigger".into(), Node::Command);
        features.insert("TimestampClockReset".into(), Node::Command);

        let mut state = SimState {
            open: false,
            features,
            queued: VecDeque::new(),
            queued_total: 0,
            flush_count: 0,
            soft_triggers: 0,
            frames_remaining: None,
            timestamp: 1_000_000,
            frame_index: 0,
            corrupt_metadata: false,
            fail_queue_at: None,
        };
        refresh_derived(&mut state);

        Self {
            state: Mutex::new(state),
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    /// Drop a feature from the tree, so it reports "not implemented".
    pub fn remove_feature(&self, name: &str) {
        self.state.lock().features.remove(name);
    }

    /// Total number of buffers ever queued.
    pub fn queued_total(&self) -> u64 {
        self.state.lock().queued_total
    }

    /// Number of buffers currently owned by the device.
    pub fn queued_len(&self) -> usize {
        self.state.lock().queued.len()
    }

    /// Number of flush calls issued so far.
    pub fn flush_count(&self) -> u64 {
        self.state.lock().flush_count
    }

    /// Emit frames whose trailer chunks are in the wrong order.
    pub fn corrupt_metadata(&self, on: bool) {
        self.state.lock().corrupt_metadata = on;
    }

    /// Make the nth queue call (counted over the device's lifetime) fail.
    pub fn fail_queue_at(&self, nth: u64) {
        self.state.lock().fail_queue_at = Some(nth);
    }

    /// Simulate the device dropping off the bus (or coming back).
    pub fn set_camera_present(&self, present: bool) {
        {
            let mut state = self.state.lock();
            set_bool_raw(&mut state, "CameraPresent", present);
        }
        self.fire(&["CameraPresent".to_string()]);
    }

    fn fire(&self, changed: &[String]) {
        let callbacks = self.callbacks.lock();
        for name in changed {
            if let Some(cb) = callbacks.get(name) {
                cb(&crate::encode_wide(name));
            }
        }
    }

    fn with_state<T>(
        &self,
        handle: Handle,
        f: impl FnOnce(&mut SimState) -> SdkResult<T>,
    ) -> SdkResult<T> {
        let mut state = self.state.lock();
        if handle != SIM_HANDLE || !state.open {
            return Err(SdkError::from(codes::INVALID_HANDLE));
        }
        f(&mut state)
    }
}

fn node<'a>(state: &'a SimState, feature: &[AtWc]) -> SdkResult<(&'a str, &'a Node)> {
    // Leak-free lookup needs the owned key; the tree is small.
    let name = decode_wide(feature);
    state
        .features
        .get_key_value(name.as_str())
        .map(|(k, v)| (k.as_str(), v))
        .ok_or_else(|| SdkError::from(codes::NOT_IMPLEMENTED))
}

fn geometry(state: &SimState) -> (i64, i64, i64, &'static str, bool) {
    let width = int_of(state, "AOIWidth");
    let height = int_of(state, "AOIHeight");
    let stride = int_of(state, "AOIStride");
    let encoding = match &state.features["PixelEncoding"] {
        Node::Enum { index, values, .. } => values[*index as usize],
        _ => "Mono16",
    };
    let metadata = bool_of(state, "MetadataEnable");
    (width, height, stride, encoding, metadata)
}

fn int_of(state: &SimState, name: &str) -> i64 {
    match state.features.get(name) {
        Some(Node::Int { value, .. }) => *value,
        _ => 0,
    }
}

fn float_of(state: &SimState, name: &str) -> f64 {
    match state.features.get(name) {
        Some(Node::Float { value, .. }) => *value,
        _ => 0.0,
    }
}

fn bool_of(state: &SimState, name: &str) -> bool {
    match state.features.get(name) {
        Some(Node::Bool { value, .. }) => *value,
        _ => false,
    }
}

fn set_int_raw(state: &mut SimState, name: &str, v: i64) {
    if let Some(Node::Int { value, .. }) = state.features.get_mut(name) {
        *value = v;
    }
}

fn set_float_raw(state: &mut SimState, name: &str, v: f64) {
    if let Some(Node::Float { value, .. }) = state.features.get_mut(name) {
        *value = v;
    }
}

fn set_bool_raw(state: &mut SimState, name: &str, v: bool) {
    if let Some(Node::Bool { value, .. }) = state.features.get_mut(name) {
        *value = v;
    }
}

fn row_bytes(width: i64, encoding: &str) -> i64 {
    match encoding {
        "Mono12Packed" => ((width * 3) + 1) / 2,
        "Mono32" => width * 4,
        _ => width * 2,
    }
}

/// Recompute stride, image size and bytes-per-pixel from the current
/// geometry, encoding and metadata enablement. Returns the names of the
/// derived features whose value changed.
fn refresh_derived(state: &mut SimState) -> Vec<String> {
    let width = int_of(state, "AOIWidth");
    let height = int_of(state, "AOIHeight");
    let encoding = match &state.features["PixelEncoding"] {
        Node::Enum { index, values, .. } => values[*index as usize],
        _ => "Mono16",
    };
    let metadata = bool_of(state, "MetadataEnable");

    // Rows are padded out to the readout burst size.
    let stride = (row_bytes(width, encoding) + 7) & !7;
    let image_size = stride * height + if metadata { SIM_METADATA_BYTES } else { 0 };
    let bytes_per_pixel = match encoding {
        "Mono12Packed" => 1.5,
        "Mono32" => 4.0,
        _ => 2.0,
    };

    let mut changed = Vec::new();
    if int_of(state, "AOIStride") != stride {
        set_int_raw(state, "AOIStride", stride);
        changed.push("AOIStride".to_string());
    }
    if int_of(state, "ImageSizeBytes") != image_size {
        set_int_raw(state, "ImageSizeBytes", image_size);
        changed.push("ImageSizeBytes".to_string());
    }
    if float_of(state, "BytesPerPixel") != bytes_per_pixel {
        set_float_raw(state, "BytesPerPixel", bytes_per_pixel);
        changed.push("BytesPerPixel".to_string());
    }
    changed
}

fn pattern_value(x: i64, y: i64, frame_index: u64) -> u16 {
    ((x + y + frame_index as i64) % 4096) as u16
}

fn fill_payload(buf: &mut [u8], width: i64, height: i64, stride: i64, encoding: &str, frame_index: u64) {
    for y in 0..height {
        let row = &mut buf[(y * stride) as usize..((y + 1) * stride) as usize];
        row.fill(0);
        match encoding {
            "Mono12Packed" => {
                let mut x = 0;
                let mut off = 0;
                while x < width {
                    let p0 = pattern_value(x, y, frame_index);
                    if x + 1 < width {
                        let p1 = pattern_value(x + 1, y, frame_index);
                        row[off] = (p0 >> 4) as u8;
                        row[off + 1] = (((p1 & 0xf) << 4) | (p0 & 0xf)) as u8;
                        row[off + 2] = (p1 >> 4) as u8;
                        off += 3;
                    } else {
                        row[off] = (p0 >> 4) as u8;
                        row[off + 1] = (p0 & 0xf) as u8;
                        off += 2;
                    }
                    x += 2;
                }
            }
            "Mono32" => {
                for x in 0..width {
                    let v = u32::from(pattern_value(x, y, frame_index));
                    LittleEndian::write_u32(&mut row[(x * 4) as usize..(x * 4 + 4) as usize], v);
                }
            }
            _ => {
                for x in 0..width {
                    let v = pattern_value(x, y, frame_index);
                    LittleEndian::write_u16(&mut row[(x * 2) as usize..(x * 2 + 2) as usize], v);
                }
            }
        }
    }
}

fn append_trailer(buf: &mut [u8], payload_len: usize, timestamp: u64, swap_cids: bool) {
    let end = buf.len();
    let trailer = &mut buf[payload_len..end];
    let (framedata_cid, ticks_cid) = if swap_cids { (1, 0) } else { (0, 1) };
    // FrameData chunk: CID then length (length counts payload + CID field).
    LittleEndian::write_u32(&mut trailer[0..4], framedata_cid);
    LittleEndian::write_u32(&mut trailer[4..8], (payload_len + 4) as u32);
    // Ticks chunk: 8-byte timestamp, CID, length.
    LittleEndian::write_u64(&mut trailer[8..16], timestamp);
    LittleEndian::write_u32(&mut trailer[16..20], ticks_cid);
    LittleEndian::write_u32(&mut trailer[20..24], 12);
}

impl Driver for SimCam {
    fn open(&self, index: i64) -> SdkResult<Handle> {
        tracing::debug!("opening simulated camera {}", index);
        if index != 0 {
            return Err(SdkError::from(codes::DEVICE_NOT_FOUND));
        }
        let mut state = self.state.lock();
        if state.open {
            return Err(SdkError::from(codes::DEVICE_IN_USE));
        }
        state.open = true;
        Ok(SIM_HANDLE)
    }

    fn close(&self, handle: Handle) -> SdkResult<()> {
        self.with_state(handle, |state| {
            state.open = false;
            state.queued.clear();
            set_bool_raw(state, "CameraAcquiring", false);
            Ok(())
        })
    }

    fn is_implemented(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<bool> {
        self.with_state(handle, |state| Ok(node(state, feature).is_ok()))
    }

    fn is_readable(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<bool> {
        self.with_state(handle, |state| {
            let (_, n) = node(state, feature)?;
            Ok(!matches!(n, Node::Command))
        })
    }

    fn is_read_only(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<bool> {
        self.with_state(handle, |state| {
            let (_, n) = node(state, feature)?;
            Ok(match n {
                Node::Int { writable, .. }
                | Node::Float { writable, .. }
                | Node::Bool { writable, .. }
                | Node::Enum { writable, .. } => !*writable,
                Node::Text { .. } => true,
                Node::Command => false,
            })
        })
    }

    fn is_writable(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<bool> {
        self.is_read_only(handle, feature).map(|ro| !ro)
    }

    fn get_int(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<i64> {
        self.with_state(handle, |state| match node(state, feature)? {
            ("TimestampClock", _) => Ok(state.timestamp as i64),
            (_, Node::Int { value, .. }) => Ok(*value),
            _ => Err(SdkError::from(codes::NOT_IMPLEMENTED)),
        })
    }

    fn set_int(&self, handle: Handle, feature: &[AtWc], v: i64) -> SdkResult<()> {
        let mut changed = self.with_state(handle, |state| {
            let (name, n) = node(state, feature)?;
            let name = name.to_string();
            match n {
                Node::Int { min, max, writable, .. } => {
                    if !*writable {
                        return Err(SdkError::from(codes::NOT_WRITABLE));
                    }
                    if v < *min || v > *max {
                        return Err(SdkError::from(codes::OUT_OF_RANGE));
                    }
                }
                _ => return Err(SdkError::from(codes::NOT_IMPLEMENTED)),
            }
            set_int_raw(state, &name, v);
            let mut changed = refresh_derived(state);
            changed.insert(0, name);
            Ok(changed)
        })?;
        changed.dedup();
        self.fire(&changed);
        Ok(())
    }

    fn get_int_min(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<i64> {
        self.with_state(handle, |state| match node(state, feature)? {
            (_, Node::Int { min, .. }) => Ok(*min),
            _ => Err(SdkError::from(codes::NOT_IMPLEMENTED)),
        })
    }

    fn get_int_max(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<i64> {
        self.with_state(handle, |state| match node(state, feature)? {
            (_, Node::Int { max, .. }) => Ok(*max),
            _ => Err(SdkError::from(codes::NOT_IMPLEMENTED)),
        })
    }

    fn get_float(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<f64> {
        self.with_state(handle, |state| match node(state, feature)? {
            (_, Node::Float { value, .. }) => Ok(*value),
            _ => Err(SdkError::from(codes::NOT_IMPLEMENTED)),
        })
    }

    fn set_float(&self, handle: Handle, feature: &[AtWc], v: f64) -> SdkResult<()> {
        let changed = self.with_state(handle, |state| {
            let (name, n) = node(state, feature)?;
            let name = name.to_string();
            let stored = match n {
                Node::Float { min, max, writable, quantum, .. } => {
                    if !*writable {
                        return Err(SdkError::from(codes::NOT_WRITABLE));
                    }
                    if v < *min || v > *max {
                        return Err(SdkError::from(codes::OUT_OF_RANGE));
                    }
                    match quantum {
                        Some(q) => (v / q).round() * q,
                        None => v,
                    }
                }
                _ => return Err(SdkError::from(codes::NOT_IMPLEMENTED)),
            };
            set_float_raw(state, &name, stored);
            Ok(vec![name])
        })?;
        self.fire(&changed);
        Ok(())
    }

    fn get_float_min(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<f64> {
        self.with_state(handle, |state| match node(state, feature)? {
            (_, Node::Float { min, .. }) => Ok(*min),
            _ => Err(SdkError::from(codes::NOT_IMPLEMENTED)),
        })
    }

    fn get_float_max(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<f64> {
        self.with_state(handle, |state| match node(state, feature)? {
            (_, Node::Float { max, .. }) => Ok(*max),
            _ => Err(SdkError::from(codes::NOT_IMPLEMENTED)),
        })
    }

    fn get_bool(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<bool> {
        self.with_state(handle, |state| match node(state, feature)? {
            (_, Node::Bool { value, .. }) => Ok(*value),
            _ => Err(SdkError::from(codes::NOT_IMPLEMENTED)),
        })
    }

    fn set_bool(&self, handle: Handle, feature: &[AtWc], v: bool) -> SdkResult<()> {
        let mut changed = self.with_state(handle, |state| {
            let (name, n) = node(state, feature)?;
            let name = name.to_string();
            match n {
                Node::Bool { writable, .. } => {
                    if !*writable {
                        return Err(SdkError::from(codes::NOT_WRITABLE));
                    }
                }
                _ => return Err(SdkError::from(codes::NOT_IMPLEMENTED)),
            }
            set_bool_raw(state, &name, v);
            // Vertical centering takes over the AOI top coordinate.
            if name == "VerticallyCentreAOI" {
                if let Some(Node::Int { writable, .. }) = state.features.get_mut("AOITop") {
                    *writable = !v;
                }
            }
            let mut changed = refresh_derived(state);
            changed.insert(0, name);
            Ok(changed)
        })?;
        changed.dedup();
        self.fire(&changed);
        Ok(())
    }

    fn get_enum_index(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<i32> {
        self.with_state(handle, |state| match node(state, feature)? {
            (_, Node::Enum { index, .. }) => Ok(*index),
            _ => Err(SdkError::from(codes::NOT_IMPLEMENTED)),
        })
    }

    fn set_enum_index(&self, handle: Handle, feature: &[AtWc], index: i32) -> SdkResult<()> {
        let mut changed = self.with_state(handle, |state| {
            let (name, n) = node(state, feature)?;
            let name = name.to_string();
            match n {
                Node::Enum { values, writable, .. } => {
                    if !*writable {
                        return Err(SdkError::from(codes::NOT_WRITABLE));
                    }
                    if index < 0 || index as usize >= values.len() {
                        return Err(SdkError::from(codes::INDEX_NOT_AVAILABLE));
                    }
                }
                _ => return Err(SdkError::from(codes::NOT_IMPLEMENTED)),
            }
            if let Some(Node::Enum { index: cur, .. }) = state.features.get_mut(&name) {
                *cur = index;
            }
            let mut changed = refresh_derived(state);
            changed.insert(0, name);
            Ok(changed)
        })?;
        changed.dedup();
        self.fire(&changed);
        Ok(())
    }

    fn get_enum_count(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<i32> {
        self.with_state(handle, |state| match node(state, feature)? {
            (_, Node::Enum { values, .. }) => Ok(values.len() as i32),
            _ => Err(SdkError::from(codes::NOT_IMPLEMENTED)),
        })
    }

    fn set_enum_string(&self, handle: Handle, feature: &[AtWc], value: &[AtWc]) -> SdkResult<()> {
        let wanted = decode_wide(value);
        let index = self.with_state(handle, |state| match node(state, feature)? {
            (_, Node::Enum { values, .. }) => values
                .iter()
                .position(|v| *v == wanted)
                .map(|i| i as i32)
                .ok_or_else(|| SdkError::from(codes::STRING_NOT_AVAILABLE)),
            _ => Err(SdkError::from(codes::NOT_IMPLEMENTED)),
        })?;
        self.set_enum_index(handle, feature, index)
    }

    fn get_enum_string_by_index(
        &self,
        handle: Handle,
        feature: &[AtWc],
        index: i32,
    ) -> SdkResult<Vec<AtWc>> {
        self.with_state(handle, |state| match node(state, feature)? {
            (_, Node::Enum { values, .. }) => values
                .get(index as usize)
                .map(|v| crate::encode_wide(v))
                .ok_or_else(|| SdkError::from(codes::INDEX_NOT_AVAILABLE)),
            _ => Err(SdkError::from(codes::NOT_IMPLEMENTED)),
        })
    }

    fn get_string(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<Vec<AtWc>> {
        self.with_state(handle, |state| match node(state, feature)? {
            (_, Node::Text { value }) => Ok(crate::encode_wide(value)),
            _ => Err(SdkError::from(codes::NOT_IMPLEMENTED)),
        })
    }

    fn command(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<()> {
        tracing::debug!("command {:?}", decode_wide(feature));
        let changed = self.with_state(handle, |state| {
            let (name, n) = node(state, feature)?;
            let name = name.to_string();
            if !matches!(n, Node::Command) {
                return Err(SdkError::from(codes::NOT_IMPLEMENTED));
            }
            match name.as_str() {
                "AcquisitionStart" => {
                    let fixed = matches!(
                        &state.features["CycleMode"],
                        Node::Enum { index: 0, .. }
                    );
                    let frame_count = int_of(state, "FrameCount");
                    state.frames_remaining = if fixed { Some(frame_count) } else { None };
                    state.frame_index = 0;
                    state.soft_triggers = 0;
                    set_bool_raw(state, "CameraAcquiring", true);
                    Ok(vec!["CameraAcquiring".to_string()])
                }
                "AcquisitionStop" => {
                    set_bool_raw(state, "CameraAcquiring", false);
                    Ok(vec!["CameraAcquiring".to_string()])
                }
                "SoftwareTrigger" => {
                    state.soft_triggers += 1;
                    Ok(vec![])
                }
                "TimestampClockReset" => {
                    state.timestamp = 0;
                    Ok(vec![])
                }
                _ => Err(SdkError::from(codes::NOT_IMPLEMENTED)),
            }
        })?;
        self.fire(&changed);
        Ok(())
    }

    fn queue_buffer(&self, handle: Handle, ptr: *mut u8, size: usize) -> SdkResult<()> {
        let addr = ptr as usize;
        self.with_state(handle, |state| {
            if addr % 8 != 0 {
                return Err(SdkError::from(codes::MISALIGNED_BUFFER));
            }
            if state.fail_queue_at == Some(state.queued_total + 1) {
                return Err(SdkError::from(codes::NO_MEMORY));
            }
            state.queued.push_back((addr, size));
            state.queued_total += 1;
            Ok(())
        })
    }

    fn wait_buffer(&self, handle: Handle, _timeout_ms: u32) -> SdkResult<(*mut u8, usize)> {
        self.with_state(handle, |state| {
            if !bool_of(state, "CameraAcquiring") {
                return Err(SdkError::from(codes::TIMED_OUT));
            }
            if let Some(remaining) = state.frames_remaining {
                if remaining == 0 {
                    return Err(SdkError::from(codes::TIMED_OUT));
                }
            }
            let software = matches!(&state.features["TriggerMode"], Node::Enum { index: 1, .. });
            if software {
                if state.soft_triggers == 0 {
                    return Err(SdkError::from(codes::TIMED_OUT));
                }
                state.soft_triggers -= 1;
            }
            let (addr, size) = state
                .queued
                .pop_front()
                .ok_or_else(|| SdkError::from(codes::TIMED_OUT))?;

            let (width, height, stride, encoding, metadata) = geometry(state);
            let image_size = int_of(state, "ImageSizeBytes") as usize;
            if size != image_size {
                return Err(SdkError::from(codes::SIZE_CONFLICT));
            }

            // The region was handed over by queue_buffer and the contract
            // requires it to stay valid until returned here or flushed.
            let buf = unsafe { std::slice::from_raw_parts_mut(addr as *mut u8, size) };
            let payload_len = (stride * height) as usize;
            fill_payload(buf, width, height, stride, encoding, state.frame_index);
            if metadata {
                append_trailer(buf, payload_len, state.timestamp, state.corrupt_metadata);
            }

            let frame_rate = float_of(state, "FrameRate");
            state.timestamp += (SIM_CLOCK_FREQUENCY as f64 / frame_rate) as u64;
            state.frame_index += 1;
            if let Some(remaining) = state.frames_remaining.as_mut() {
                *remaining -= 1;
            }
            Ok((addr as *mut u8, size))
        })
    }

    fn flush(&self, handle: Handle) -> SdkResult<()> {
        self.with_state(handle, |state| {
            state.queued.clear();
            state.flush_count += 1;
            Ok(())
        })
    }

    fn register_feature_callback(
        &self,
        handle: Handle,
        feature: &[AtWc],
        callback: FeatureCallback,
    ) -> SdkResult<()> {
        self.with_state(handle, |state| {
            node(state, feature)?;
            Ok(())
        })?;
        self.callbacks.lock().insert(decode_wide(feature), callback);
        Ok(())
    }

    fn unregister_feature_callback(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<()> {
        self.callbacks.lock().remove(&decode_wide(feature));
        let _ = handle;
        Ok(())
    }

    fn convert_buffer(
        &self,
        src: &[u8],
        dst: &mut [u8],
        width: u64,
        height: u64,
        stride: u64,
        input_encoding: &[AtWc],
        output_encoding: &[AtWc],
    ) -> SdkResult<()> {
        if decode_wide(output_encoding) != "Mono16" {
            return Err(SdkError::from(codes::INVALID_OUTPUT_ENCODING));
        }
        let (width, height, stride) = (width as usize, height as usize, stride as usize);
        if src.len() < stride * height || dst.len() < width * height * 2 {
            return Err(SdkError::from(codes::SIZE_CONFLICT));
        }
        let input = decode_wide(input_encoding);
        for y in 0..height {
            let row = &src[y * stride..(y + 1) * stride];
            let out = &mut dst[y * width * 2..(y + 1) * width * 2];
            match input.as_str() {
                "Mono16" | "Mono12" => {
                    out.copy_from_slice(&row[..width * 2]);
                }
                "Mono32" => {
                    for x in 0..width {
                        let v = LittleEndian::read_u32(&row[x * 4..x * 4 + 4]);
                        LittleEndian::write_u16(&mut out[x * 2..x * 2 + 2], v as u16);
                    }
                }
                "Mono12Packed" => {
                    let mut x = 0;
                    let mut off = 0;
                    while x < width {
                        let b0 = u16::from(row[off]);
                        let b1 = u16::from(row[off + 1]);
                        let p0 = (b0 << 4) | (b1 & 0xf);
                        LittleEndian::write_u16(&mut out[x * 2..x * 2 + 2], p0);
                        if x + 1 < width {
                            let b2 = u16::from(row[off + 2]);
                            let p1 = (b2 << 4) | (b1 >> 4);
                            LittleEndian::write_u16(&mut out[x * 2 + 2..x * 2 + 4], p1);
                            off += 3;
                        } else {
                            off += 2;
                        }
                        x += 2;
                    }
                }
                _ => return Err(SdkError::from(codes::INVALID_INPUT_ENCODING)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode_wide as w;

    #[test]
    fn open_close_cycle() {
        let cam = SimCam::new();
        let h = cam.open(0).unwrap();
        assert_eq!(cam.open(0).unwrap_err().code, codes::DEVICE_IN_USE);
        cam.close(h).unwrap();
        cam.open(0).unwrap();
    }

    #[test]
    fn unknown_feature_is_not_implemented() {
        let cam = SimCam::new();
        let h = cam.open(0).unwrap();
        assert!(!cam.is_implemented(h, &w("NoSuchFeature")).unwrap());
        assert_eq!(
            cam.get_int(h, &w("NoSuchFeature")).unwrap_err().code,
            codes::NOT_IMPLEMENTED
        );
    }

    #[test]
    fn image_size_tracks_geometry_and_metadata() {
        let cam = SimCam::new();
        let h = cam.open(0).unwrap();
        cam.set_int(h, &w("AOIWidth"), 100).unwrap();
        cam.set_int(h, &w("AOIHeight"), 10).unwrap();
        // Mono16, 100 px -> 200 bytes, already a multiple of 8.
        assert_eq!(cam.get_int(h, &w("AOIStride")).unwrap(), 200);
        assert_eq!(cam.get_int(h, &w("ImageSizeBytes")).unwrap(), 2000);
        cam.set_bool(h, &w("MetadataEnable"), true).unwrap();
        assert_eq!(cam.get_int(h, &w("ImageSizeBytes")).unwrap(), 2024);
    }

    #[test]
    fn vertical_centering_locks_aoi_top() {
        let cam = SimCam::new();
        let h = cam.open(0).unwrap();
        assert!(cam.is_writable(h, &w("AOITop")).unwrap());
        cam.set_bool(h, &w("VerticallyCentreAOI"), true).unwrap();
        assert!(!cam.is_writable(h, &w("AOITop")).unwrap());
        assert_eq!(
            cam.set_int(h, &w("AOITop"), 5).unwrap_err().code,
            codes::NOT_WRITABLE
        );
    }

    #[test]
    fn exposure_write_is_quantized() {
        let cam = SimCam::new();
        let h = cam.open(0).unwrap();
        cam.set_float(h, &w("ExposureTime"), 0.0123456).unwrap();
        let got = cam.get_float(h, &w("ExposureTime")).unwrap();
        assert!((got - 0.01235).abs() < 1e-9, "got {}", got);
    }

    #[test]
    fn wait_without_queue_times_out() {
        let cam = SimCam::new();
        let h = cam.open(0).unwrap();
        cam.command(h, &w("AcquisitionStart")).unwrap();
        assert_eq!(cam.wait_buffer(h, 10).unwrap_err().code, codes::TIMED_OUT);
    }

    #[test]
    fn filled_buffer_carries_pattern_and_trailer() {
        let cam = SimCam::new();
        let h = cam.open(0).unwrap();
        cam.set_int(h, &w("AOIWidth"), 16).unwrap();
        cam.set_int(h, &w("AOIHeight"), 4).unwrap();
        cam.set_bool(h, &w("MetadataEnable"), true).unwrap();
        let size = cam.get_int(h, &w("ImageSizeBytes")).unwrap() as usize;
        let mut buf = vec![0u8; size];
        cam.command(h, &w("AcquisitionStart")).unwrap();
        cam.queue_buffer(h, buf.as_mut_ptr(), size).unwrap();
        let (ptr, got) = cam.wait_buffer(h, 100).unwrap();
        assert_eq!(ptr, buf.as_mut_ptr());
        assert_eq!(got, size);
        // First pixel of frame 0 is (0 + 0 + 0) % 4096.
        assert_eq!(LittleEndian::read_u16(&buf[0..2]), 0);
        // Trailer: ticks CID just before the final length field.
        assert_eq!(LittleEndian::read_u32(&buf[size - 8..size - 4]), 1);
        assert_eq!(LittleEndian::read_u32(&buf[size - 4..size]), 12);
        assert_eq!(LittleEndian::read_u64(&buf[size - 16..size - 8]), 1_000_000);
    }

    #[test]
    fn mono12packed_conversion_matches_pattern() {
        let cam = SimCam::new();
        let h = cam.open(0).unwrap();
        cam.set_int(h, &w("AOIWidth"), 8).unwrap();
        cam.set_int(h, &w("AOIHeight"), 2).unwrap();
        cam.set_enum_string(h, &w("PixelEncoding"), &w("Mono12Packed")).unwrap();
        let size = cam.get_int(h, &w("ImageSizeBytes")).unwrap() as usize;
        let stride = cam.get_int(h, &w("AOIStride")).unwrap() as u64;
        let mut buf = vec![0u8; size];
        cam.command(h, &w("AcquisitionStart")).unwrap();
        cam.queue_buffer(h, buf.as_mut_ptr(), size).unwrap();
        cam.wait_buffer(h, 100).unwrap();
        let mut out = vec![0u8; 8 * 2 * 2];
        cam.convert_buffer(&buf, &mut out, 8, 2, stride, &w("Mono12Packed"), &w("Mono16"))
            .unwrap();
        for y in 0..2i64 {
            for x in 0..8i64 {
                let v = LittleEndian::read_u16(&out[(y * 16 + x * 2) as usize..][..2]);
                assert_eq!(v, pattern_value(x, y, 0), "pixel ({}, {})", x, y);
            }
        }
    }
}
