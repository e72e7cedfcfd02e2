//! Typed, access-checked operations on the device feature tree.
//!
//! Every operation re-queries the relevant access flags (and, for numeric
//! writes, the live bounds) from the device. The device is allowed to
//! change both at runtime, so nothing here is cached.

use std::sync::Arc;

use tracing::warn;

use sdk3::{encode_wide, AtWc, Driver, Handle, SdkError};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
}

/// Whether an access denial is worth a diagnostic. `Silent` is reserved
/// for optional, speculative reads; query failures are always reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Warn {
    Warn,
    Silent,
}

#[derive(Clone)]
pub(crate) struct Proxy {
    pub driver: Arc<dyn Driver>,
    pub handle: Handle,
    /// Suppress "not implemented" reports for read access on the
    /// simulated stand-in, which lacks most of the feature tree.
    pub quiet_sim_reads: bool,
}

impl Proxy {
    /// Check whether `feature` currently allows the given access.
    ///
    /// Returns `false` (after reporting, unless silenced) when the feature
    /// is unimplemented, not readable, read-only, or not writable, and
    /// when any of those queries itself fails.
    pub fn check_access(&self, feature: &str, access: Access, warn: Warn) -> bool {
        let w = encode_wide(feature);
        match self.driver.is_implemented(self.handle, &w) {
            Ok(true) => {}
            Ok(false) => {
                let quiet = self.quiet_sim_reads && access == Access::Read;
                if warn == Warn::Warn && !quiet {
                    warn!("access error: feature '{}' is not implemented on this camera", feature);
                }
                return false;
            }
            Err(e) => {
                warn!(
                    "access check failed for '{}': is_implemented returned: {} ({})",
                    feature, e.msg, e.code
                );
                return false;
            }
        }
        match access {
            Access::Read => match self.driver.is_readable(self.handle, &w) {
                Ok(true) => true,
                Ok(false) => {
                    if warn == Warn::Warn {
                        warn!("read access error: feature '{}' is currently not readable", feature);
                    }
                    false
                }
                Err(e) => {
                    warn!(
                        "access check failed for '{}': is_readable returned: {} ({})",
                        feature, e.msg, e.code
                    );
                    false
                }
            },
            Access::Write => {
                match self.driver.is_read_only(self.handle, &w) {
                    Ok(false) => {}
                    Ok(true) => {
                        if warn == Warn::Warn {
                            warn!("write access error: feature '{}' is read only", feature);
                        }
                        return false;
                    }
                    Err(e) => {
                        warn!(
                            "access check failed for '{}': is_read_only returned: {} ({})",
                            feature, e.msg, e.code
                        );
                        return false;
                    }
                }
                match self.driver.is_writable(self.handle, &w) {
                    Ok(true) => true,
                    Ok(false) => {
                        if warn == Warn::Warn {
                            warn!("write access error: feature '{}' is currently not writable", feature);
                        }
                        false
                    }
                    Err(e) => {
                        warn!(
                            "access check failed for '{}': is_writable returned: {} ({})",
                            feature, e.msg, e.code
                        );
                        false
                    }
                }
            }
        }
    }

    fn denied(feature: &str) -> Error {
        Error::AccessDenied {
            feature: feature.to_string(),
        }
    }

    fn device(&self, action: &str, feature: &str, e: SdkError) -> Error {
        warn!("could not {} '{}': {} ({})", action, feature, e.msg, e.code);
        Error::Device {
            context: format!("{} '{}'", action, feature),
            source: e,
        }
    }

    pub fn read_integer(&self, feature: &str) -> Result<i64> {
        self.read_integer_with(feature, Warn::Warn)
    }

    pub fn read_integer_with(&self, feature: &str, warn: Warn) -> Result<i64> {
        if !self.check_access(feature, Access::Read, warn) {
            return Err(Self::denied(feature));
        }
        self.driver
            .get_int(self.handle, &encode_wide(feature))
            .map_err(|e| self.device("read integer", feature, e))
    }

    pub fn write_integer(&self, feature: &str, value: i64) -> Result<()> {
        if !self.check_access(feature, Access::Write, Warn::Warn) {
            return Err(Self::denied(feature));
        }
        let w = encode_wide(feature);
        let max = self
            .driver
            .get_int_max(self.handle, &w)
            .map_err(|e| self.device("read maximum allowable value of", feature, e))?;
        let min = self
            .driver
            .get_int_min(self.handle, &w)
            .map_err(|e| self.device("read minimum allowable value of", feature, e))?;
        if value < min || value > max {
            warn!(
                "value {} is out of range for feature '{}': current range is [{}; {}]",
                value, feature, min, max
            );
            return Err(Error::IntOutOfRange {
                feature: feature.to_string(),
                value,
                min,
                max,
            });
        }
        self.driver
            .set_int(self.handle, &w, value)
            .map_err(|e| self.device("write integer", feature, e))
    }

    pub fn read_float(&self, feature: &str) -> Result<f64> {
        if !self.check_access(feature, Access::Read, Warn::Warn) {
            return Err(Self::denied(feature));
        }
        self.driver
            .get_float(self.handle, &encode_wide(feature))
            .map_err(|e| self.device("read float", feature, e))
    }

    /// Write a float. The device may clamp or round the stored value, so
    /// callers that care must read it back afterwards.
    pub fn write_float(&self, feature: &str, value: f64) -> Result<()> {
        if !self.check_access(feature, Access::Write, Warn::Warn) {
            return Err(Self::denied(feature));
        }
        let w = encode_wide(feature);
        let max = self
            .driver
            .get_float_max(self.handle, &w)
            .map_err(|e| self.device("read maximum allowable value of", feature, e))?;
        let min = self
            .driver
            .get_float_min(self.handle, &w)
            .map_err(|e| self.device("read minimum allowable value of", feature, e))?;
        if value < min || value > max {
            warn!(
                "value {} is out of range for feature '{}': current range is [{}; {}]",
                value, feature, min, max
            );
            return Err(Error::FloatOutOfRange {
                feature: feature.to_string(),
                value,
                min,
                max,
            });
        }
        self.driver
            .set_float(self.handle, &w, value)
            .map_err(|e| self.device("write float", feature, e))
    }

    pub fn read_float_min(&self, feature: &str) -> Result<f64> {
        if !self.check_access(feature, Access::Read, Warn::Warn) {
            return Err(Self::denied(feature));
        }
        self.driver
            .get_float_min(self.handle, &encode_wide(feature))
            .map_err(|e| self.device("read float min of", feature, e))
    }

    pub fn read_float_max(&self, feature: &str) -> Result<f64> {
        if !self.check_access(feature, Access::Read, Warn::Warn) {
            return Err(Self::denied(feature));
        }
        self.driver
            .get_float_max(self.handle, &encode_wide(feature))
            .map_err(|e| self.device("read float max of", feature, e))
    }

    pub fn read_enum_index(&self, feature: &str) -> Result<i32> {
        if !self.check_access(feature, Access::Read, Warn::Warn) {
            return Err(Self::denied(feature));
        }
        self.driver
            .get_enum_index(self.handle, &encode_wide(feature))
            .map_err(|e| self.device("read index of", feature, e))
    }

    pub fn write_enum_index(&self, feature: &str, index: i32) -> Result<()> {
        if !self.check_access(feature, Access::Write, Warn::Warn) {
            return Err(Self::denied(feature));
        }
        let w = encode_wide(feature);
        let count = self
            .driver
            .get_enum_count(self.handle, &w)
            .map_err(|e| self.device("read enum count of", feature, e))?;
        if index < 0 || index >= count {
            warn!(
                "enumeration value {} is out of range [0, {}] for feature '{}'",
                index,
                count - 1,
                feature
            );
            return Err(Error::EnumOutOfRange {
                feature: feature.to_string(),
                index,
                count,
            });
        }
        self.driver
            .set_enum_index(self.handle, &w, index)
            .map_err(|e| self.device("set enum of", feature, e))
    }

    pub fn read_boolean(&self, feature: &str) -> Result<bool> {
        self.read_boolean_with(feature, Warn::Warn)
    }

    pub fn read_boolean_with(&self, feature: &str, warn: Warn) -> Result<bool> {
        if !self.check_access(feature, Access::Read, warn) {
            return Err(Self::denied(feature));
        }
        self.driver
            .get_bool(self.handle, &encode_wide(feature))
            .map_err(|e| self.device("read boolean", feature, e))
    }

    pub fn write_boolean(&self, feature: &str, value: bool) -> Result<()> {
        if !self.check_access(feature, Access::Write, Warn::Warn) {
            return Err(Self::denied(feature));
        }
        self.driver
            .set_bool(self.handle, &encode_wide(feature), value)
            .map_err(|e| self.device("write boolean", feature, e))
    }

    /// Select an enumerated feature by its string form.
    ///
    /// Like floats, the stored selection is whatever the device accepted;
    /// read back afterwards rather than trusting the written value.
    pub fn write_string(&self, feature: &str, value: &str) -> Result<()> {
        if !self.check_access(feature, Access::Write, Warn::Warn) {
            return Err(Self::denied(feature));
        }
        self.driver
            .set_enum_string(self.handle, &encode_wide(feature), &encode_wide(value))
            .map_err(|e| self.device("write string to", feature, e))
    }

    /// Read the string form of the currently selected enumeration entry.
    pub fn read_string(&self, feature: &str) -> Result<String> {
        if !self.check_access(feature, Access::Read, Warn::Warn) {
            return Err(Self::denied(feature));
        }
        let w = encode_wide(feature);
        let index = self
            .driver
            .get_enum_index(self.handle, &w)
            .map_err(|e| self.device("read index of", feature, e))?;
        let wide = self
            .driver
            .get_enum_string_by_index(self.handle, &w, index)
            .map_err(|e| self.device("read string of", feature, e))?;
        Ok(sdk3::decode_wide(&wide))
    }

    /// Read the current enumeration entry in both index and wide form.
    pub fn read_enum_wide(&self, feature: &str) -> Result<(i32, Vec<AtWc>)> {
        if !self.check_access(feature, Access::Read, Warn::Warn) {
            return Err(Self::denied(feature));
        }
        let w = encode_wide(feature);
        let index = self
            .driver
            .get_enum_index(self.handle, &w)
            .map_err(|e| self.device("read index of", feature, e))?;
        let wide = self
            .driver
            .get_enum_string_by_index(self.handle, &w, index)
            .map_err(|e| self.device("read string of", feature, e))?;
        Ok((index, wide))
    }

    pub fn command(&self, feature: &str) -> Result<()> {
        self.driver
            .command(self.handle, &encode_wide(feature))
            .map_err(|e| self.device("execute command", feature, e))
    }

    pub fn flush_buffers(&self) -> Result<()> {
        self.driver
            .flush(self.handle)
            .map_err(|e| self.device("flush queued buffers on", "device", e))
    }
}
