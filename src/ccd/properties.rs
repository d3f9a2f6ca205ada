//
// ccdhost - CCD camera driver host for amateur astronomy
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Standard CCD properties.
//!

use crate::camera::CameraInfo;
use crate::ccd::chip::FrameType;
use crate::host::property::*;
use strum::IntoEnumIterator;

pub mod names {
    pub const CONNECTION: &str = "CONNECTION";
    pub const CONNECT: &str = "CONNECT";
    pub const DISCONNECT: &str = "DISCONNECT";

    pub const CCD_EXPOSURE: &str = "CCD_EXPOSURE";
    pub const CCD_EXPOSURE_VALUE: &str = "CCD_EXPOSURE_VALUE";
    pub const CCD_ABORT_EXPOSURE: &str = "CCD_ABORT_EXPOSURE";
    pub const ABORT: &str = "ABORT";

    pub const CCD_FRAME: &str = "CCD_FRAME";
    pub const X: &str = "X";
    pub const Y: &str = "Y";
    pub const WIDTH: &str = "WIDTH";
    pub const HEIGHT: &str = "HEIGHT";

    pub const CCD_BINNING: &str = "CCD_BINNING";
    pub const HOR_BIN: &str = "HOR_BIN";
    pub const VER_BIN: &str = "VER_BIN";

    pub const CCD_FRAME_TYPE: &str = "CCD_FRAME_TYPE";

    pub const CCD_INFO: &str = "CCD_INFO";
    pub const CCD_MAX_X: &str = "CCD_MAX_X";
    pub const CCD_MAX_Y: &str = "CCD_MAX_Y";
    pub const CCD_PIXEL_SIZE: &str = "CCD_PIXEL_SIZE";
    pub const CCD_PIXEL_SIZE_X: &str = "CCD_PIXEL_SIZE_X";
    pub const CCD_PIXEL_SIZE_Y: &str = "CCD_PIXEL_SIZE_Y";
    pub const CCD_BITSPERPIXEL: &str = "CCD_BITSPERPIXEL";

    pub const CCD_TEMPERATURE: &str = "CCD_TEMPERATURE";
    pub const CCD_TEMPERATURE_VALUE: &str = "CCD_TEMPERATURE_VALUE";
    pub const CCD_COOLER: &str = "CCD_COOLER";
    pub const COOLER_ON: &str = "COOLER_ON";
    pub const COOLER_OFF: &str = "COOLER_OFF";
    pub const CCD_COOLER_POWER: &str = "CCD_COOLER_POWER";
    pub const CCD_COOLER_VALUE: &str = "CCD_COOLER_VALUE";

    pub const CCD_VIDEO_STREAM: &str = "CCD_VIDEO_STREAM";
    pub const STREAM_ON: &str = "STREAM_ON";
    pub const STREAM_OFF: &str = "STREAM_OFF";

    pub const ADC_DEPTH: &str = "ADC_DEPTH";
    pub const BITS: &str = "BITS";
    pub const SDK: &str = "SDK";
    pub const VERSION: &str = "VERSION";

    pub const CCD_CFA: &str = "CCD_CFA";
    pub const CFA_OFFSET_X: &str = "CFA_OFFSET_X";
    pub const CFA_OFFSET_Y: &str = "CFA_OFFSET_Y";
    pub const CFA_TYPE: &str = "CFA_TYPE";

    pub const TELESCOPE_TIMED_GUIDE_NS: &str = "TELESCOPE_TIMED_GUIDE_NS";
    pub const TIMED_GUIDE_N: &str = "TIMED_GUIDE_N";
    pub const TIMED_GUIDE_S: &str = "TIMED_GUIDE_S";
    pub const TELESCOPE_TIMED_GUIDE_WE: &str = "TELESCOPE_TIMED_GUIDE_WE";
    pub const TIMED_GUIDE_W: &str = "TIMED_GUIDE_W";
    pub const TIMED_GUIDE_E: &str = "TIMED_GUIDE_E";
}

mod groups {
    pub const MAIN: &str = "Main Control";
    pub const IMAGE_SETTINGS: &str = "Image Settings";
    pub const IMAGE_INFO: &str = "Image Info";
    pub const GUIDER: &str = "Guider Control";
    pub const STREAMING: &str = "Streaming";
}

/// Longest accepted guide pulse (ms).
const MAX_GUIDE_PULSE: f64 = 60_000.0;
const MAX_EXPOSURE: f64 = 3600.0;

/// Properties common to all CCD devices.
pub struct StandardProperties {
    pub connection: SwitchVector,
    pub exposure: NumberVector,
    pub abort: SwitchVector,
    pub frame: NumberVector,
    pub binning: NumberVector,
    pub frame_type: SwitchVector,
    pub info: NumberVector,
    pub temperature: NumberVector,
    pub cooler: SwitchVector,
    pub cooler_power: NumberVector,
    pub stream: SwitchVector,
    pub adc_depth: NumberVector,
    pub sdk: TextVector,
    pub cfa: TextVector,
    pub guide_ns: NumberVector,
    pub guide_we: NumberVector
}

impl StandardProperties {
    pub fn new(device: &str, info: &CameraInfo, sdk_version: &str) -> StandardProperties {
        use names::*;

        let max_bin = info.supported_bins.iter().copied().max().unwrap_or(1) as f64;
        let (width, height) = (info.max_width as f64, info.max_height as f64);

        StandardProperties{
            connection: SwitchVector::new(
                PropertyHeader::new(device, CONNECTION, "Connection", groups::MAIN, Permission::ReadWrite),
                SwitchRule::OneOfMany,
                vec![SwitchItem::new(CONNECT, "Connect", false), SwitchItem::new(DISCONNECT, "Disconnect", true)]
            ),

            exposure: NumberVector::new(
                PropertyHeader::new(device, CCD_EXPOSURE, "Expose", groups::MAIN, Permission::ReadWrite),
                vec![NumberItem::new(CCD_EXPOSURE_VALUE, "Duration (s)", 0.0, MAX_EXPOSURE, 1.0, 1.0)]
            ),

            abort: SwitchVector::new(
                PropertyHeader::new(device, CCD_ABORT_EXPOSURE, "Abort", groups::MAIN, Permission::ReadWrite),
                SwitchRule::AtMostOne,
                vec![SwitchItem::new(ABORT, "Abort", false)]
            ),

            frame: NumberVector::new(
                PropertyHeader::new(device, CCD_FRAME, "Frame", groups::IMAGE_SETTINGS, Permission::ReadWrite),
                vec![
                    NumberItem::new(X, "Left", 0.0, width - 1.0, 0.0, 0.0),
                    NumberItem::new(Y, "Top", 0.0, height - 1.0, 0.0, 0.0),
                    NumberItem::new(WIDTH, "Width", 1.0, width, 0.0, width),
                    NumberItem::new(HEIGHT, "Height", 1.0, height, 0.0, height)
                ]
            ),

            binning: NumberVector::new(
                PropertyHeader::new(device, CCD_BINNING, "Binning", groups::IMAGE_SETTINGS, Permission::ReadWrite),
                vec![
                    NumberItem::new(HOR_BIN, "X", 1.0, max_bin, 1.0, 1.0),
                    NumberItem::new(VER_BIN, "Y", 1.0, max_bin, 1.0, 1.0)
                ]
            ),

            frame_type: SwitchVector::new(
                PropertyHeader::new(device, CCD_FRAME_TYPE, "Frame Type", groups::IMAGE_SETTINGS, Permission::ReadWrite),
                SwitchRule::OneOfMany,
                FrameType::iter()
                    .map(|ft| SwitchItem::new(ft.switch_name(), ft.label(), ft == FrameType::Light))
                    .collect()
            ),

            info: NumberVector::new(
                PropertyHeader::new(device, CCD_INFO, "CCD Information", groups::IMAGE_INFO, Permission::ReadOnly),
                vec![
                    NumberItem::new(CCD_MAX_X, "Max. Width", 1.0, 16000.0, 0.0, width),
                    NumberItem::new(CCD_MAX_Y, "Max. Height", 1.0, 16000.0, 0.0, height),
                    NumberItem::new(CCD_PIXEL_SIZE, "Pixel size (um)", 1.0, 40.0, 0.0, info.pixel_size),
                    NumberItem::new(CCD_PIXEL_SIZE_X, "Pixel size X", 1.0, 40.0, 0.0, info.pixel_size),
                    NumberItem::new(CCD_PIXEL_SIZE_Y, "Pixel size Y", 1.0, 40.0, 0.0, info.pixel_size),
                    NumberItem::new(CCD_BITSPERPIXEL, "Bits per pixel", 8.0, 64.0, 0.0, 8.0)
                ]
            ),

            temperature: NumberVector::new(
                PropertyHeader::new(
                    device, CCD_TEMPERATURE, "Temperature", groups::MAIN,
                    if info.has_cooler { Permission::ReadWrite } else { Permission::ReadOnly }
                ),
                vec![NumberItem::new(CCD_TEMPERATURE_VALUE, "Temperature (C)", -50.0, 50.0, 0.0, 0.0)]
            ),

            cooler: SwitchVector::new(
                PropertyHeader::new(device, CCD_COOLER, "Cooler", groups::MAIN, Permission::WriteOnly),
                SwitchRule::OneOfMany,
                vec![SwitchItem::new(COOLER_ON, "ON", false), SwitchItem::new(COOLER_OFF, "OFF", true)]
            ),

            cooler_power: NumberVector::new(
                PropertyHeader::new(device, CCD_COOLER_POWER, "Cooling Power", groups::MAIN, Permission::ReadOnly),
                vec![NumberItem::new(CCD_COOLER_VALUE, "Cooling Power (%)", 0.0, 100.0, 1.0, 0.0)]
            ),

            stream: SwitchVector::new(
                PropertyHeader::new(device, CCD_VIDEO_STREAM, "Video Stream", groups::STREAMING, Permission::ReadWrite),
                SwitchRule::OneOfMany,
                vec![SwitchItem::new(STREAM_ON, "Stream On", false), SwitchItem::new(STREAM_OFF, "Stream Off", true)]
            ),

            adc_depth: NumberVector::new(
                PropertyHeader::new(device, ADC_DEPTH, "ADC Depth", groups::IMAGE_INFO, Permission::ReadOnly),
                vec![NumberItem::new(BITS, "Bits", 0.0, 32.0, 1.0, info.bit_depth as f64)]
            ),

            sdk: TextVector::new(
                PropertyHeader::new(device, SDK, "SDK", groups::MAIN, Permission::ReadOnly),
                &[(VERSION, "Version", sdk_version)]
            ),

            cfa: TextVector::new(
                PropertyHeader::new(device, CCD_CFA, "Bayer Info", groups::IMAGE_INFO, Permission::ReadOnly),
                &[
                    (CFA_OFFSET_X, "X Offset", "0"),
                    (CFA_OFFSET_Y, "Y Offset", "0"),
                    (CFA_TYPE, "Filter", info.bayer_pattern.as_str())
                ]
            ),

            guide_ns: NumberVector::new(
                PropertyHeader::new(device, TELESCOPE_TIMED_GUIDE_NS, "Guide N/S", groups::GUIDER, Permission::ReadWrite),
                vec![
                    NumberItem::new(TIMED_GUIDE_N, "North (ms)", 0.0, MAX_GUIDE_PULSE, 100.0, 0.0),
                    NumberItem::new(TIMED_GUIDE_S, "South (ms)", 0.0, MAX_GUIDE_PULSE, 100.0, 0.0)
                ]
            ),

            guide_we: NumberVector::new(
                PropertyHeader::new(device, TELESCOPE_TIMED_GUIDE_WE, "Guide E/W", groups::GUIDER, Permission::ReadWrite),
                vec![
                    NumberItem::new(TIMED_GUIDE_W, "West (ms)", 0.0, MAX_GUIDE_PULSE, 100.0, 0.0),
                    NumberItem::new(TIMED_GUIDE_E, "East (ms)", 0.0, MAX_GUIDE_PULSE, 100.0, 0.0)
                ]
            )
        }
    }

    pub fn set_frame_type(&mut self, frame_type: FrameType) {
        self.frame_type.reset();
        for item in &mut self.frame_type.items {
            item.on = item.name == frame_type.switch_name();
        }
    }
}

/// Capabilities of a CCD device.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub can_abort: bool,
    pub can_bin: bool,
    pub can_subframe: bool,
    pub has_cooler: bool,
    pub has_st4_port: bool,
    pub has_bayer: bool,
    pub has_streaming: bool
}

impl Capabilities {
    pub fn new(info: &CameraInfo) -> Capabilities {
        Capabilities{
            can_abort: true,
            can_bin: info.supported_bins.iter().any(|b| *b > 1),
            can_subframe: true,
            has_cooler: info.has_cooler,
            has_st4_port: info.has_st4_port,
            has_bayer: info.is_color,
            has_streaming: true
        }
    }
}
