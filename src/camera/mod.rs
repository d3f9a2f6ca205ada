//
// ccdhost - CCD camera driver host for amateur astronomy
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Camera SDK facade: types and the blocking call surface shared by all camera SDK drivers.
//!

pub mod drivers;

use strum_macros as sm;

/// Error codes reported by the camera SDK (values as used by ZWO ASICamera2).
#[derive(Copy, Clone, Debug, PartialEq, Eq, sm::FromRepr, sm::Display)]
#[repr(i32)]
pub enum SdkError {
    #[strum(serialize = "invalid index")]
    InvalidIndex = 1,
    #[strum(serialize = "invalid ID")]
    InvalidId = 2,
    #[strum(serialize = "invalid control type")]
    InvalidControlType = 3,
    #[strum(serialize = "camera closed")]
    CameraClosed = 4,
    #[strum(serialize = "camera removed")]
    CameraRemoved = 5,
    #[strum(serialize = "invalid path")]
    InvalidPath = 6,
    #[strum(serialize = "invalid file format")]
    InvalidFileFormat = 7,
    #[strum(serialize = "invalid size")]
    InvalidSize = 8,
    #[strum(serialize = "invalid image type")]
    InvalidImgType = 9,
    #[strum(serialize = "start position out of boundary")]
    OutOfBoundary = 10,
    #[strum(serialize = "timeout")]
    Timeout = 11,
    #[strum(serialize = "invalid sequence")]
    InvalidSequence = 12,
    #[strum(serialize = "buffer too small")]
    BufferTooSmall = 13,
    #[strum(serialize = "video mode active")]
    VideoModeActive = 14,
    #[strum(serialize = "exposure in progress")]
    ExposureInProgress = 15,
    #[strum(serialize = "general error")]
    GeneralError = 16,
    #[strum(serialize = "invalid mode")]
    InvalidMode = 17,
    #[strum(serialize = "unknown error")]
    Unknown = 1000
}

impl SdkError {
    /// Converts a raw SDK return code; `0` (success) yields `Ok`.
    pub fn check(code: i32) -> Result<(), SdkError> {
        match code {
            0 => Ok(()),
            code => Err(SdkError::from_repr(code).unwrap_or(SdkError::Unknown))
        }
    }

    pub fn code(&self) -> i32 { *self as i32 }
}

impl std::error::Error for SdkError {}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CameraId(pub i32);

impl std::fmt::Display for CameraId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, sm::FromRepr, sm::Display, sm::EnumIter)]
#[repr(i32)]
pub enum ControlType {
    Gain = 0,
    Exposure = 1,
    Gamma = 2,
    #[strum(serialize = "WB_R")]
    WbR = 3,
    #[strum(serialize = "WB_B")]
    WbB = 4,
    Offset = 5,
    BandWidth = 6,
    Overclock = 7,
    Temperature = 8,
    Flip = 9,
    AutoExpMaxGain = 10,
    AutoExpMaxExpMS = 11,
    AutoExpTargetBrightness = 12,
    HardwareBin = 13,
    HighSpeedMode = 14,
    CoolerPowerPerc = 15,
    TargetTemp = 16,
    CoolerOn = 17,
    MonoBin = 18,
    FanOn = 19,
    PatternAdjust = 20,
    AntiDewHeater = 21
}

/// Image (video) format as understood by the SDK.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, sm::FromRepr, sm::IntoStaticStr, sm::EnumString, sm::EnumIter)]
#[repr(i32)]
pub enum ImgType {
    #[strum(serialize = "ASI_IMG_RAW8")]
    Raw8 = 0,
    #[strum(serialize = "ASI_IMG_RGB24")]
    Rgb24 = 1,
    #[strum(serialize = "ASI_IMG_RAW16")]
    Raw16 = 2,
    #[strum(serialize = "ASI_IMG_Y8")]
    Y8 = 3
}

impl ImgType {
    /// Switch name used in the video format property.
    pub fn switch_name(&self) -> &'static str { self.into() }

    pub fn label(&self) -> &'static str {
        match self {
            ImgType::Raw8 => "Raw 8 bit",
            ImgType::Rgb24 => "RGB 24",
            ImgType::Raw16 => "Raw 16 bit",
            ImgType::Y8 => "Luma"
        }
    }

    pub fn num_channels(&self) -> usize {
        match self {
            ImgType::Rgb24 => 3,
            _ => 1
        }
    }

    pub fn bits_per_pixel(&self) -> u32 {
        match self {
            ImgType::Raw16 => 16,
            _ => 8
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, sm::FromRepr)]
#[repr(i32)]
pub enum BayerPattern {
    RG = 0,
    BG = 1,
    GR = 2,
    GB = 3
}

impl BayerPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            BayerPattern::RG => "RGGB",
            BayerPattern::BG => "BGGR",
            BayerPattern::GR => "GRBG",
            BayerPattern::GB => "GBRG"
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, sm::FromRepr, sm::Display)]
#[repr(i32)]
pub enum ExposureStatus {
    Idle = 0,
    Working = 1,
    Success = 2,
    Failed = 3
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, sm::FromRepr, sm::Display)]
#[repr(i32)]
pub enum GuideDirection {
    North = 0,
    South = 1,
    East = 2,
    West = 3
}

#[derive(Clone, Debug)]
pub struct CameraInfo {
    pub id: CameraId,
    /// Model name as reported by the SDK (e.g., "ZWO ASI120MM-S").
    pub name: String,
    pub max_width: u32,
    pub max_height: u32,
    pub is_color: bool,
    pub bayer_pattern: BayerPattern,
    pub supported_bins: Vec<u32>,
    /// Raw SDK values; may contain values not covered by `ImgType`.
    pub supported_video_formats: Vec<i32>,
    /// Pixel size in micrometers.
    pub pixel_size: f64,
    pub has_st4_port: bool,
    pub has_cooler: bool,
    pub is_usb3_host: bool,
    pub is_usb3_camera: bool,
    pub bit_depth: u32
}

#[derive(Clone, Debug)]
pub struct ControlCaps {
    pub name: String,
    pub description: String,
    pub control_type: ControlType,
    pub min: i64,
    pub max: i64,
    pub default: i64,
    pub is_auto_supported: bool,
    pub is_writable: bool
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RoiFormat {
    pub width: u32,
    pub height: u32,
    pub bin: u32,
    pub img_type: ImgType
}

/// Blocking call surface of a camera SDK.
///
/// All calls except `enumerate_cameras`, `name` and `version` address a single camera by `CameraId`.
/// Implementations must tolerate control setters being called concurrently with acquisition calls
/// issued from another thread; acquisition calls themselves are never issued concurrently
/// for the same camera.
pub trait CameraSdk: Send + Sync {
    fn name(&self) -> &'static str;

    fn version(&self) -> String;

    fn enumerate_cameras(&self) -> Result<Vec<CameraInfo>, SdkError>;

    fn open(&self, id: CameraId) -> Result<(), SdkError>;

    fn init(&self, id: CameraId) -> Result<(), SdkError>;

    fn close(&self, id: CameraId) -> Result<(), SdkError>;

    fn num_controls(&self, id: CameraId) -> Result<usize, SdkError>;

    fn control_caps(&self, id: CameraId, index: usize) -> Result<ControlCaps, SdkError>;

    /// Returns (value, is auto).
    fn control_value(&self, id: CameraId, control: ControlType) -> Result<(i64, bool), SdkError>;

    fn set_control_value(&self, id: CameraId, control: ControlType, value: i64, auto: bool) -> Result<(), SdkError>;

    fn roi_format(&self, id: CameraId) -> Result<RoiFormat, SdkError>;

    fn set_roi_format(&self, id: CameraId, format: RoiFormat) -> Result<(), SdkError>;

    fn set_start_pos(&self, id: CameraId, x: u32, y: u32) -> Result<(), SdkError>;

    fn start_exposure(&self, id: CameraId, is_dark: bool) -> Result<(), SdkError>;

    fn stop_exposure(&self, id: CameraId) -> Result<(), SdkError>;

    fn exposure_status(&self, id: CameraId) -> Result<ExposureStatus, SdkError>;

    /// Downloads the image of a finished exposure.
    fn data_after_exposure(&self, id: CameraId, buffer: &mut [u8]) -> Result<(), SdkError>;

    fn start_video_capture(&self, id: CameraId) -> Result<(), SdkError>;

    fn stop_video_capture(&self, id: CameraId) -> Result<(), SdkError>;

    /// Waits up to `wait_ms` for the next video frame; returns `SdkError::Timeout` if none arrived.
    fn video_data(&self, id: CameraId, buffer: &mut [u8], wait_ms: i32) -> Result<(), SdkError>;

    fn pulse_guide_on(&self, id: CameraId, direction: GuideDirection) -> Result<(), SdkError>;

    fn pulse_guide_off(&self, id: CameraId, direction: GuideDirection) -> Result<(), SdkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdk_return_codes_are_mapped() {
        assert_eq!(Ok(()), SdkError::check(0));
        assert_eq!(Err(SdkError::Timeout), SdkError::check(11));
        assert_eq!(Err(SdkError::Unknown), SdkError::check(99));
        assert_eq!(11, SdkError::Timeout.code());
    }

    #[test]
    fn image_type_names() {
        assert_eq!("ASI_IMG_RAW16", ImgType::Raw16.switch_name());
        assert_eq!(Ok(ImgType::Y8), "ASI_IMG_Y8".parse::<ImgType>());
        assert_eq!(Some(ImgType::Rgb24), ImgType::from_repr(1));
        assert_eq!(None, ImgType::from_repr(-1));
        assert_eq!(3, ImgType::Rgb24.num_channels());
        assert_eq!(16, ImgType::Raw16.bits_per_pixel());
    }
}
