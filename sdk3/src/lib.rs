//! Driver boundary for SDK3-style sCMOS cameras.
//!
//! The vendor library exposes the camera as a tree of named, typed
//! features plus a small buffer-exchange surface. This crate defines that
//! surface as the [`Driver`] trait so that the session layer does not care
//! whether it talks to the real dynamic library or to the in-process
//! simulated device in [`sim`].

pub mod sim;

/// Session handle returned by [`Driver::open`].
pub type Handle = i32;

/// One unit of the driver's wide-character strings.
pub type AtWc = u32;

/// Callback invoked by the driver when a feature value changes.
///
/// The argument is the wide feature name. Implementations must not call
/// back into the driver and must return promptly; heavy work belongs on a
/// consumer thread.
pub type FeatureCallback = Box<dyn Fn(&[AtWc]) + Send + Sync>;

fn err_str(err: i32) -> &'static str {
    match err {
        0 => "no error",
        1 => "camera handle uninitialized",
        2 => "feature is not implemented for this camera",
        3 => "feature is read only",
        4 => "feature is currently not readable",
        5 => "feature is currently not writable / command is not currently executable",
        6 => "value is either out of range or unavailable",
        7 => "index is currently not available",
        8 => "index is not implemented on this camera",
        9 => "string value exceeds maximum allowed length",
        10 => "connection or disconnection error",
        11 => "no internal event or internal error",
        12 => "invalid handle",
        13 => "waiting for buffer timed out",
        14 => "input buffer queue reached maximum capacity",
        15 => "queued buffer / returned frame size conflict",
        16 => "a queued buffer was not aligned on an 8-byte boundary",
        17 => "an error has occurred while communicating with hardware",
        18 => "index / string is not currently available",
        19 => "index / string is not implemented on this camera",
        20 => "passed feature was null",
        21 => "passed handle was null",
        22 => "feature pointer was null",
        23 => "readable pointer was null",
        24 => "read-only pointer was null",
        25 => "writable pointer was null",
        26 => "min value pointer was null",
        27 => "max value pointer was null",
        28 => "value pointer was null",
        29 => "string pointer was null",
        30 => "feature index count was null",
        31 => "available pointer was null",
        32 => "string length pointer was null",
        33 => "event callback parameter was null",
        34 => "pointer to queue was null",
        35 => "wait pointer was null",
        36 => "pointer size was null",
        37 => "no memory allocated for current action",
        38 => "unable to connect, device already in use",
        39 => "device not found",
        100 => "data could not be retrieved from the camera fast enough to avoid an internal hardware buffer burst",
        1002 => "invalid output pixel encoding",
        1003 => "invalid input pixel encoding",
        1004 => "input buffer does not include metadata",
        1005 => "corrupted metadata",
        1006 => "metadata not found",
        _ => "unknown error",
    }
}

/// A failed driver primitive, as a numeric SDK code plus its fixed
/// description.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("SDK error {code}: {msg}")]
pub struct SdkError {
    pub code: i32,
    pub msg: &'static str,
}

impl From<i32> for SdkError {
    fn from(code: i32) -> SdkError {
        SdkError {
            code,
            msg: err_str(code),
        }
    }
}

pub type SdkResult<T> = std::result::Result<T, SdkError>;

/// SDK error codes referenced by name.
pub mod codes {
    pub const SUCCESS: i32 = 0;
    pub const NOT_IMPLEMENTED: i32 = 2;
    pub const READ_ONLY: i32 = 3;
    pub const NOT_READABLE: i32 = 4;
    pub const NOT_WRITABLE: i32 = 5;
    pub const OUT_OF_RANGE: i32 = 6;
    pub const INDEX_NOT_AVAILABLE: i32 = 7;
    pub const CONNECTION: i32 = 10;
    pub const INVALID_HANDLE: i32 = 12;
    pub const TIMED_OUT: i32 = 13;
    pub const QUEUE_FULL: i32 = 14;
    pub const SIZE_CONFLICT: i32 = 15;
    pub const MISALIGNED_BUFFER: i32 = 16;
    pub const HARDWARE_COMM: i32 = 17;
    pub const STRING_NOT_AVAILABLE: i32 = 18;
    pub const NO_MEMORY: i32 = 37;
    pub const DEVICE_IN_USE: i32 = 38;
    pub const DEVICE_NOT_FOUND: i32 = 39;
    pub const INVALID_OUTPUT_ENCODING: i32 = 1002;
    pub const INVALID_INPUT_ENCODING: i32 = 1003;
}

/// Encode a narrow string into the driver's wide representation.
pub fn encode_wide(s: &str) -> Vec<AtWc> {
    s.chars().map(|c| c as AtWc).collect()
}

/// Decode a wide string from the driver.
///
/// The output is sized from the decoded content; units outside the Unicode
/// scalar range are replaced.
pub fn decode_wide(w: &[AtWc]) -> String {
    w.iter()
        .take_while(|&&c| c != 0)
        .map(|&c| char::from_u32(c).unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// The primitive operations of the camera driver.
///
/// Feature names and string values are wide strings. Buffer exchange
/// transfers ownership: a queued region belongs to the device until
/// [`wait_buffer`] returns it or [`flush`] discards it, and must stay
/// valid for that whole time.
///
/// [`wait_buffer`]: Driver::wait_buffer
/// [`flush`]: Driver::flush
pub trait Driver: Send + Sync {
    fn open(&self, index: i64) -> SdkResult<Handle>;
    fn close(&self, handle: Handle) -> SdkResult<()>;

    fn is_implemented(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<bool>;
    fn is_readable(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<bool>;
    fn is_read_only(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<bool>;
    fn is_writable(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<bool>;

    fn get_int(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<i64>;
    fn set_int(&self, handle: Handle, feature: &[AtWc], value: i64) -> SdkResult<()>;
    fn get_int_min(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<i64>;
    fn get_int_max(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<i64>;

    fn get_float(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<f64>;
    fn set_float(&self, handle: Handle, feature: &[AtWc], value: f64) -> SdkResult<()>;
    fn get_float_min(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<f64>;
    fn get_float_max(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<f64>;

    fn get_bool(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<bool>;
    fn set_bool(&self, handle: Handle, feature: &[AtWc], value: bool) -> SdkResult<()>;

    fn get_enum_index(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<i32>;
    fn set_enum_index(&self, handle: Handle, feature: &[AtWc], index: i32) -> SdkResult<()>;
    fn get_enum_count(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<i32>;
    fn set_enum_string(&self, handle: Handle, feature: &[AtWc], value: &[AtWc]) -> SdkResult<()>;
    fn get_enum_string_by_index(
        &self,
        handle: Handle,
        feature: &[AtWc],
        index: i32,
    ) -> SdkResult<Vec<AtWc>>;

    fn get_string(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<Vec<AtWc>>;

    fn command(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<()>;

    /// Hand a memory region to the device to be filled with one frame.
    fn queue_buffer(&self, handle: Handle, ptr: *mut u8, size: usize) -> SdkResult<()>;

    /// Block until a queued region has been filled, up to `timeout_ms`.
    ///
    /// Timeout is reported as error code 13.
    fn wait_buffer(&self, handle: Handle, timeout_ms: u32) -> SdkResult<(*mut u8, usize)>;

    /// Discard all queued regions, returning their ownership to the caller.
    fn flush(&self, handle: Handle) -> SdkResult<()>;

    fn register_feature_callback(
        &self,
        handle: Handle,
        feature: &[AtWc],
        callback: FeatureCallback,
    ) -> SdkResult<()>;
    fn unregister_feature_callback(&self, handle: Handle, feature: &[AtWc]) -> SdkResult<()>;

    /// Convert a raw frame into `output_encoding`, stripping row padding.
    ///
    /// Delegated pixel-format codec; `stride` is the row pitch of `src` in
    /// bytes.
    #[allow(clippy::too_many_arguments)]
    fn convert_buffer(
        &self,
        src: &[u8],
        dst: &mut [u8],
        width: u64,
        height: u64,
        stride: u64,
        input_encoding: &[AtWc],
        output_encoding: &[AtWc],
    ) -> SdkResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_table_spot_checks() {
        assert_eq!(SdkError::from(2).msg, "feature is not implemented for this camera");
        assert_eq!(SdkError::from(13).msg, "waiting for buffer timed out");
        assert_eq!(SdkError::from(1005).msg, "corrupted metadata");
        assert_eq!(SdkError::from(-42).msg, "unknown error");
    }

    #[test]
    fn error_display_includes_code_and_message() {
        let e = SdkError::from(codes::TIMED_OUT);
        assert_eq!(e.to_string(), "SDK error 13: waiting for buffer timed out");
    }

    #[test]
    fn wide_round_trip() {
        let s = "PixelEncoding";
        assert_eq!(decode_wide(&encode_wide(s)), s);
    }

    #[test]
    fn decode_wide_stops_at_nul_and_measures_length() {
        let mut w = encode_wide("Mono16");
        w.push(0);
        w.extend_from_slice(&encode_wide("junk"));
        assert_eq!(decode_wide(&w), "Mono16");
    }
}
