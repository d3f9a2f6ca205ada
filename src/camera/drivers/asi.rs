//
// ccdhost - CCD camera driver host for amateur astronomy
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! ZWO ASI camera SDK (libASICamera2) bindings.
//!

use crate::camera::*;
use std::os::raw::{c_char, c_double, c_float, c_int, c_long, c_uchar};

macro_rules! checked_call {
    ($func_call:expr) => {
        SdkError::check(unsafe { $func_call } as i32)?
    }
}

const ASI_TRUE: c_int = 1;
const ASI_FALSE: c_int = 0;
/// Terminates `ASI_CAMERA_INFO::SupportedVideoFormat`.
const ASI_IMG_END: c_int = -1;

#[repr(C)]
#[allow(non_snake_case)]
struct ASI_CAMERA_INFO {
    Name: [c_char; 64],
    CameraID: c_int,
    MaxHeight: c_long,
    MaxWidth: c_long,
    IsColorCam: c_int,
    BayerPattern: c_int,
    SupportedBins: [c_int; 16],
    SupportedVideoFormat: [c_int; 8],
    PixelSize: c_double,
    MechanicalShutter: c_int,
    ST4Port: c_int,
    IsCoolerCam: c_int,
    IsUSB3Host: c_int,
    IsUSB3Camera: c_int,
    ElecPerADU: c_float,
    BitDepth: c_int,
    IsTriggerCam: c_int,
    Unused: [c_char; 16]
}

#[repr(C)]
#[allow(non_snake_case)]
struct ASI_CONTROL_CAPS {
    Name: [c_char; 64],
    Description: [c_char; 128],
    MaxValue: c_long,
    MinValue: c_long,
    DefaultValue: c_long,
    IsAutoSupported: c_int,
    IsWritable: c_int,
    ControlType: c_int,
    Unused: [c_char; 32]
}

#[link(name = "ASICamera2")]
extern "C" {
    fn ASIGetNumOfConnectedCameras() -> c_int;
    fn ASIGetCameraProperty(info: *mut ASI_CAMERA_INFO, index: c_int) -> c_int;
    fn ASIOpenCamera(id: c_int) -> c_int;
    fn ASIInitCamera(id: c_int) -> c_int;
    fn ASICloseCamera(id: c_int) -> c_int;
    fn ASIGetNumOfControls(id: c_int, num: *mut c_int) -> c_int;
    fn ASIGetControlCaps(id: c_int, index: c_int, caps: *mut ASI_CONTROL_CAPS) -> c_int;
    fn ASIGetControlValue(id: c_int, control: c_int, value: *mut c_long, auto: *mut c_int) -> c_int;
    fn ASISetControlValue(id: c_int, control: c_int, value: c_long, auto: c_int) -> c_int;
    fn ASISetROIFormat(id: c_int, width: c_int, height: c_int, bin: c_int, img_type: c_int) -> c_int;
    fn ASIGetROIFormat(id: c_int, width: *mut c_int, height: *mut c_int, bin: *mut c_int, img_type: *mut c_int) -> c_int;
    fn ASISetStartPos(id: c_int, x: c_int, y: c_int) -> c_int;
    fn ASIStartExposure(id: c_int, is_dark: c_int) -> c_int;
    fn ASIStopExposure(id: c_int) -> c_int;
    fn ASIGetExpStatus(id: c_int, status: *mut c_int) -> c_int;
    fn ASIGetDataAfterExp(id: c_int, buffer: *mut c_uchar, size: c_long) -> c_int;
    fn ASIStartVideoCapture(id: c_int) -> c_int;
    fn ASIStopVideoCapture(id: c_int) -> c_int;
    fn ASIGetVideoData(id: c_int, buffer: *mut c_uchar, size: c_long, wait_ms: c_int) -> c_int;
    fn ASIPulseGuideOn(id: c_int, direction: c_int) -> c_int;
    fn ASIPulseGuideOff(id: c_int, direction: c_int) -> c_int;
    fn ASIGetSDKVersion() -> *const c_char;
}

/// The SDK does not guarantee the char arrays are NUL-terminated.
fn asi_char_array_to_string(chars: &[c_char]) -> String {
    let bytes: Vec<u8> = chars.iter().take_while(|ch| **ch != 0).map(|ch| *ch as u8).collect();
    String::from_utf8_lossy(&bytes).to_string()
}

pub struct AsiSdk {}

impl AsiSdk {
    pub fn new() -> AsiSdk {
        AsiSdk{}
    }
}

impl CameraSdk for AsiSdk {
    fn name(&self) -> &'static str { "ASI" }

    fn version(&self) -> String {
        let version = unsafe { ASIGetSDKVersion() };
        if version.is_null() {
            "unknown".to_string()
        } else {
            unsafe { std::ffi::CStr::from_ptr(version) }.to_string_lossy().to_string()
        }
    }

    fn enumerate_cameras(&self) -> Result<Vec<CameraInfo>, SdkError> {
        let mut cameras = vec![];

        let num_cameras = unsafe { ASIGetNumOfConnectedCameras() };
        for i in 0..num_cameras {
            let mut info = std::mem::MaybeUninit::<ASI_CAMERA_INFO>::uninit();
            checked_call!(ASIGetCameraProperty(info.as_mut_ptr(), i));
            let info = unsafe { info.assume_init() };

            cameras.push(CameraInfo{
                id: CameraId(info.CameraID),
                name: asi_char_array_to_string(&info.Name),
                max_width: info.MaxWidth as u32,
                max_height: info.MaxHeight as u32,
                is_color: info.IsColorCam == ASI_TRUE,
                bayer_pattern: BayerPattern::from_repr(info.BayerPattern).unwrap_or(BayerPattern::RG),
                supported_bins: info.SupportedBins.iter().take_while(|b| **b != 0).map(|b| *b as u32).collect(),
                supported_video_formats: info.SupportedVideoFormat.iter()
                    .take_while(|f| **f != ASI_IMG_END)
                    .copied()
                    .collect(),
                pixel_size: info.PixelSize,
                has_st4_port: info.ST4Port == ASI_TRUE,
                has_cooler: info.IsCoolerCam == ASI_TRUE,
                is_usb3_host: info.IsUSB3Host == ASI_TRUE,
                is_usb3_camera: info.IsUSB3Camera == ASI_TRUE,
                bit_depth: info.BitDepth as u32
            });
        }

        Ok(cameras)
    }

    fn open(&self, id: CameraId) -> Result<(), SdkError> {
        checked_call!(ASIOpenCamera(id.0));
        Ok(())
    }

    fn init(&self, id: CameraId) -> Result<(), SdkError> {
        checked_call!(ASIInitCamera(id.0));
        Ok(())
    }

    fn close(&self, id: CameraId) -> Result<(), SdkError> {
        checked_call!(ASICloseCamera(id.0));
        Ok(())
    }

    fn num_controls(&self, id: CameraId) -> Result<usize, SdkError> {
        let mut num: c_int = 0;
        checked_call!(ASIGetNumOfControls(id.0, &mut num));
        Ok(num.max(0) as usize)
    }

    fn control_caps(&self, id: CameraId, index: usize) -> Result<ControlCaps, SdkError> {
        let mut caps = std::mem::MaybeUninit::<ASI_CONTROL_CAPS>::uninit();
        checked_call!(ASIGetControlCaps(id.0, index as c_int, caps.as_mut_ptr()));
        let caps = unsafe { caps.assume_init() };

        Ok(ControlCaps{
            name: asi_char_array_to_string(&caps.Name),
            description: asi_char_array_to_string(&caps.Description),
            control_type: ControlType::from_repr(caps.ControlType).ok_or(SdkError::InvalidControlType)?,
            min: caps.MinValue as i64,
            max: caps.MaxValue as i64,
            default: caps.DefaultValue as i64,
            is_auto_supported: caps.IsAutoSupported == ASI_TRUE,
            is_writable: caps.IsWritable == ASI_TRUE
        })
    }

    fn control_value(&self, id: CameraId, control: ControlType) -> Result<(i64, bool), SdkError> {
        let mut value: c_long = 0;
        let mut auto: c_int = ASI_FALSE;
        checked_call!(ASIGetControlValue(id.0, control as c_int, &mut value, &mut auto));
        Ok((value as i64, auto == ASI_TRUE))
    }

    fn set_control_value(&self, id: CameraId, control: ControlType, value: i64, auto: bool) -> Result<(), SdkError> {
        checked_call!(ASISetControlValue(
            id.0,
            control as c_int,
            value as c_long,
            if auto { ASI_TRUE } else { ASI_FALSE }
        ));
        Ok(())
    }

    fn roi_format(&self, id: CameraId) -> Result<RoiFormat, SdkError> {
        let (mut width, mut height, mut bin, mut img_type): (c_int, c_int, c_int, c_int) = (0, 0, 0, 0);
        checked_call!(ASIGetROIFormat(id.0, &mut width, &mut height, &mut bin, &mut img_type));
        Ok(RoiFormat{
            width: width as u32,
            height: height as u32,
            bin: bin as u32,
            img_type: ImgType::from_repr(img_type).ok_or(SdkError::InvalidImgType)?
        })
    }

    fn set_roi_format(&self, id: CameraId, format: RoiFormat) -> Result<(), SdkError> {
        checked_call!(ASISetROIFormat(
            id.0, format.width as c_int, format.height as c_int, format.bin as c_int, format.img_type as c_int
        ));
        Ok(())
    }

    fn set_start_pos(&self, id: CameraId, x: u32, y: u32) -> Result<(), SdkError> {
        checked_call!(ASISetStartPos(id.0, x as c_int, y as c_int));
        Ok(())
    }

    fn start_exposure(&self, id: CameraId, is_dark: bool) -> Result<(), SdkError> {
        checked_call!(ASIStartExposure(id.0, if is_dark { ASI_TRUE } else { ASI_FALSE }));
        Ok(())
    }

    fn stop_exposure(&self, id: CameraId) -> Result<(), SdkError> {
        checked_call!(ASIStopExposure(id.0));
        Ok(())
    }

    fn exposure_status(&self, id: CameraId) -> Result<ExposureStatus, SdkError> {
        let mut status: c_int = 0;
        checked_call!(ASIGetExpStatus(id.0, &mut status));
        ExposureStatus::from_repr(status).ok_or(SdkError::Unknown)
    }

    fn data_after_exposure(&self, id: CameraId, buffer: &mut [u8]) -> Result<(), SdkError> {
        checked_call!(ASIGetDataAfterExp(id.0, buffer.as_mut_ptr(), buffer.len() as c_long));
        Ok(())
    }

    fn start_video_capture(&self, id: CameraId) -> Result<(), SdkError> {
        checked_call!(ASIStartVideoCapture(id.0));
        Ok(())
    }

    fn stop_video_capture(&self, id: CameraId) -> Result<(), SdkError> {
        checked_call!(ASIStopVideoCapture(id.0));
        Ok(())
    }

    fn video_data(&self, id: CameraId, buffer: &mut [u8], wait_ms: i32) -> Result<(), SdkError> {
        checked_call!(ASIGetVideoData(id.0, buffer.as_mut_ptr(), buffer.len() as c_long, wait_ms));
        Ok(())
    }

    fn pulse_guide_on(&self, id: CameraId, direction: GuideDirection) -> Result<(), SdkError> {
        checked_call!(ASIPulseGuideOn(id.0, direction as c_int));
        Ok(())
    }

    fn pulse_guide_off(&self, id: CameraId, direction: GuideDirection) -> Result<(), SdkError> {
        checked_call!(ASIPulseGuideOff(id.0, direction as c_int));
        Ok(())
    }
}
