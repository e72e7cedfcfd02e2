//! Plain data types shared across the andor3 camera crates.

use serde::{Deserialize, Serialize};

/// Canonical trigger sources.
///
/// The device exposes more enumeration entries than these (e.g. "External
/// Start", "External Exposure"), but only these three have distinct
/// acquisition semantics for frame-number reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerSource {
    /// Free-running internal trigger.
    Auto,
    /// Frames start on a software trigger command.
    Software,
    /// Frames start on an external hardware trigger.
    External,
}

// use Debug to impl Display
impl std::fmt::Display for TriggerSource {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        std::fmt::Debug::fmt(self, fmt)
    }
}

/// Acquisition repeat policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleMode {
    /// A bounded number of frames, then the device stops on its own.
    Fixed,
    /// Indefinite ring-buffered streaming.
    Continuous,
}

impl CycleMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleMode::Fixed => "Fixed",
            CycleMode::Continuous => "Continuous",
        }
    }
}

impl std::str::FromStr for CycleMode {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Fixed" => Ok(CycleMode::Fixed),
            "Continuous" => Ok(CycleMode::Continuous),
            other => Err(UnknownVariant::new("CycleMode", other)),
        }
    }
}

impl std::fmt::Display for CycleMode {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        fmt.write_str(self.as_str())
    }
}

/// Sensor cooling fan setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FanSpeed {
    Off,
    Low,
    On,
}

impl FanSpeed {
    pub fn as_str(&self) -> &'static str {
        match self {
            FanSpeed::Off => "Off",
            FanSpeed::Low => "Low",
            FanSpeed::On => "On",
        }
    }
}

impl std::str::FromStr for FanSpeed {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Off" => Ok(FanSpeed::Off),
            "Low" => Ok(FanSpeed::Low),
            "On" => Ok(FanSpeed::On),
            other => Err(UnknownVariant::new("FanSpeed", other)),
        }
    }
}

impl std::fmt::Display for FanSpeed {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        fmt.write_str(self.as_str())
    }
}

/// Sensor-native pixel encodings.
///
/// The canonical output of the decode pipeline is always [`Mono16`];
/// the others appear only as the source encoding of a raw frame.
///
/// [`Mono16`]: PixelEncoding::Mono16
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelEncoding {
    Mono12,
    Mono12Packed,
    Mono16,
    Mono32,
}

impl PixelEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            PixelEncoding::Mono12 => "Mono12",
            PixelEncoding::Mono12Packed => "Mono12Packed",
            PixelEncoding::Mono16 => "Mono16",
            PixelEncoding::Mono32 => "Mono32",
        }
    }
}

impl std::str::FromStr for PixelEncoding {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Mono12" => Ok(PixelEncoding::Mono12),
            "Mono12Packed" => Ok(PixelEncoding::Mono12Packed),
            "Mono16" => Ok(PixelEncoding::Mono16),
            "Mono32" => Ok(PixelEncoding::Mono32),
            other => Err(UnknownVariant::new("PixelEncoding", other)),
        }
    }
}

impl std::fmt::Display for PixelEncoding {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        fmt.write_str(self.as_str())
    }
}

/// Electronic shutter readout mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutteringMode {
    Rolling,
    Global,
}

impl ShutteringMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutteringMode::Rolling => "Rolling",
            ShutteringMode::Global => "Global",
        }
    }
}

impl std::str::FromStr for ShutteringMode {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Rolling" => Ok(ShutteringMode::Rolling),
            "Global" => Ok(ShutteringMode::Global),
            other => Err(UnknownVariant::new("ShutteringMode", other)),
        }
    }
}

/// On-sensor binning of the area of interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AoiBinning {
    Bin1x1,
    Bin2x2,
    Bin3x3,
    Bin4x4,
    Bin8x8,
}

impl AoiBinning {
    pub fn as_str(&self) -> &'static str {
        match self {
            AoiBinning::Bin1x1 => "1x1",
            AoiBinning::Bin2x2 => "2x2",
            AoiBinning::Bin3x3 => "3x3",
            AoiBinning::Bin4x4 => "4x4",
            AoiBinning::Bin8x8 => "8x8",
        }
    }
}

impl std::str::FromStr for AoiBinning {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1x1" => Ok(AoiBinning::Bin1x1),
            "2x2" => Ok(AoiBinning::Bin2x2),
            "3x3" => Ok(AoiBinning::Bin3x3),
            "4x4" => Ok(AoiBinning::Bin4x4),
            "8x8" => Ok(AoiBinning::Bin8x8),
            other => Err(UnknownVariant::new("AOIBinning", other)),
        }
    }
}

/// An enumeration string returned by the device did not match any known
/// variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl std::fmt::Display for UnknownVariant {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        write!(fmt, "unknown {} value: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_mode_round_trip() {
        for mode in [CycleMode::Fixed, CycleMode::Continuous] {
            assert_eq!(mode.as_str().parse::<CycleMode>().unwrap(), mode);
        }
        assert!("fixed".parse::<CycleMode>().is_err());
    }

    #[test]
    fn pixel_encoding_round_trip() {
        for enc in [
            PixelEncoding::Mono12,
            PixelEncoding::Mono12Packed,
            PixelEncoding::Mono16,
            PixelEncoding::Mono32,
        ] {
            assert_eq!(enc.as_str().parse::<PixelEncoding>().unwrap(), enc);
        }
    }

    #[test]
    fn unknown_variant_names_the_value() {
        let err = "Mono99".parse::<PixelEncoding>().unwrap_err();
        assert_eq!(err.value, "Mono99");
    }
}
