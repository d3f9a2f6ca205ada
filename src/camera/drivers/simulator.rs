//
// ccdhost - CCD camera driver host for amateur astronomy
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Camera SDK simulator.
//!
//! Behaves like a set of cooled color cameras. Exposure statuses, video frame results and exposure start
//! failures can be scripted; every acquisition and guiding call is counted.
//!

use crate::camera::*;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

const SENSOR_WIDTH: u32 = 640;
const SENSOR_HEIGHT: u32 = 480;
const AMBIENT_TEMPERATURE: f64 = 20.0;
/// Temperature change per temperature reading while cooling/warming (deg. C).
const TEMPERATURE_STEP: f64 = 0.5;

/// Number of calls made to the simulated SDK for one camera.
#[derive(Clone, Debug, Default)]
pub struct SimCalls {
    pub open: usize,
    pub close: usize,
    pub start_exposure: usize,
    pub stop_exposure: usize,
    pub exposure_status: usize,
    pub data_after_exposure: usize,
    pub start_video: usize,
    pub stop_video: usize,
    pub video_data: usize,
    pub pulse_on: Vec<GuideDirection>,
    pub pulse_off: Vec<GuideDirection>,
    /// Control writes in call order.
    pub set_control: Vec<(ControlType, i64, bool)>
}

#[derive(Default)]
struct Script {
    exposure_statuses: VecDeque<Result<ExposureStatus, SdkError>>,
    video_results: VecDeque<Result<(), SdkError>>,
    start_exposure_failures: usize,
    failing_controls: Vec<ControlType>
}

struct Exposure {
    started: Instant,
    duration: Duration,
    dark: bool
}

struct SimCamera {
    info: CameraInfo,
    caps: Vec<ControlCaps>,
    open: bool,
    controls: HashMap<ControlType, (i64, bool)>,
    roi: RoiFormat,
    start_pos: (u32, u32),
    exposure: Option<Exposure>,
    video_active: bool,
    t_last_frame: Instant,
    temperature: f64,
    frame_counter: u32,
    script: Script,
    calls: SimCalls
}

pub struct SimSdk {
    cameras: Vec<Mutex<SimCamera>>
}

fn caps(
    control_type: ControlType,
    min: i64,
    max: i64,
    default: i64,
    is_auto_supported: bool,
    is_writable: bool
) -> ControlCaps {
    ControlCaps{
        name: control_type.to_string(),
        description: format!("{} (simulated)", control_type),
        control_type,
        min,
        max,
        default,
        is_auto_supported,
        is_writable
    }
}

fn default_caps() -> Vec<ControlCaps> {
    vec![
        caps(ControlType::Gain, 0, 300, 100, true, true),
        caps(ControlType::Exposure, 32, 2_000_000_000, 10_000, true, true),
        caps(ControlType::Offset, 0, 80, 8, false, true),
        caps(ControlType::BandWidth, 40, 100, 50, true, true),
        caps(ControlType::WbR, 1, 99, 52, true, true),
        caps(ControlType::WbB, 1, 99, 95, true, true),
        caps(ControlType::Gamma, 1, 100, 50, false, true),
        caps(ControlType::Flip, 0, 3, 0, false, true),
        caps(ControlType::Temperature, -500, 1000, 200, false, false),
        caps(ControlType::CoolerPowerPerc, 0, 100, 0, false, false),
        caps(ControlType::TargetTemp, -40, 30, 0, false, true),
        caps(ControlType::CoolerOn, 0, 1, 0, false, true),
        caps(ControlType::HighSpeedMode, 0, 1, 0, false, true),
    ]
}

impl SimCamera {
    fn new(index: usize) -> SimCamera {
        let caps = default_caps();
        let controls = caps.iter().map(|c| (c.control_type, (c.default, false))).collect();

        SimCamera{
            info: CameraInfo{
                id: CameraId(index as i32),
                name: "ZWO ASI Simulator".to_string(),
                max_width: SENSOR_WIDTH,
                max_height: SENSOR_HEIGHT,
                is_color: true,
                bayer_pattern: BayerPattern::RG,
                supported_bins: vec![1, 2],
                supported_video_formats: vec![
                    ImgType::Raw8 as i32, ImgType::Rgb24 as i32, ImgType::Raw16 as i32, ImgType::Y8 as i32
                ],
                pixel_size: 3.75,
                has_st4_port: true,
                has_cooler: true,
                is_usb3_host: false,
                is_usb3_camera: true,
                bit_depth: 12
            },
            caps,
            open: false,
            controls,
            roi: RoiFormat{ width: SENSOR_WIDTH, height: SENSOR_HEIGHT, bin: 1, img_type: ImgType::Raw8 },
            start_pos: (0, 0),
            exposure: None,
            video_active: false,
            t_last_frame: Instant::now(),
            temperature: AMBIENT_TEMPERATURE,
            frame_counter: 0,
            script: Default::default(),
            calls: Default::default()
        }
    }

    fn check_open(&self) -> Result<(), SdkError> {
        if self.open { Ok(()) } else { Err(SdkError::CameraClosed) }
    }

    fn control(&self, control: ControlType) -> (i64, bool) {
        self.controls.get(&control).copied().unwrap_or((0, false))
    }

    fn update_temperature(&mut self) {
        let (cooler_on, _) = self.control(ControlType::CoolerOn);
        let target = if cooler_on != 0 {
            self.control(ControlType::TargetTemp).0 as f64
        } else {
            AMBIENT_TEMPERATURE
        };

        let diff = target - self.temperature;
        if diff.abs() <= TEMPERATURE_STEP {
            self.temperature = target;
        } else {
            self.temperature += TEMPERATURE_STEP * diff.signum();
        }

        let power = if cooler_on != 0 {
            ((AMBIENT_TEMPERATURE - target).max(0.0) * 3.0).min(100.0) as i64
        } else {
            0
        };
        self.controls.insert(ControlType::CoolerPowerPerc, (power, false));
        self.controls.insert(ControlType::Temperature, ((self.temperature * 10.0).round() as i64, false));
    }

    /// Renders a synthetic frame (gradient with a grid of point sources) for the current ROI.
    fn render(&mut self, buffer: &mut [u8], dark: bool) -> Result<(), SdkError> {
        let width = self.roi.width as usize;
        let height = self.roi.height as usize;
        let img_type = self.roi.img_type;
        let needed = width * height * img_type.num_channels() * (img_type.bits_per_pixel() as usize / 8);
        if buffer.len() < needed {
            return Err(SdkError::BufferTooSmall);
        }

        self.frame_counter = self.frame_counter.wrapping_add(1);
        let shift = (self.frame_counter % 16) as usize;
        let (x0, y0) = (self.start_pos.0 as usize, self.start_pos.1 as usize);

        let rgb_at = |x: usize, y: usize| -> [u8; 3] {
            if dark { return [2, 2, 2]; }
            let (sx, sy) = (x0 + x + shift, y0 + y);
            let star = sx % 64 == 32 && sy % 64 == 32;
            if star {
                [250, 250, 250]
            } else {
                [(sx % 256) as u8 / 2, (sy % 256) as u8 / 2, 40]
            }
        };

        const RED: usize = 0;
        const GREEN: usize = 1;
        const BLUE: usize = 2;

        let cfa_channel = |x: usize, y: usize| -> usize {
            let (even_x, even_y) = (x & 1 == 0, y & 1 == 0);
            match self.info.bayer_pattern {
                BayerPattern::RG => match (even_x, even_y) { (true, true) => RED, (false, false) => BLUE, _ => GREEN },
                BayerPattern::BG => match (even_x, even_y) { (true, true) => BLUE, (false, false) => RED, _ => GREEN },
                BayerPattern::GR => match (even_x, even_y) { (false, true) => RED, (true, false) => BLUE, _ => GREEN },
                BayerPattern::GB => match (even_x, even_y) { (false, true) => BLUE, (true, false) => RED, _ => GREEN },
            }
        };

        for y in 0..height {
            for x in 0..width {
                let rgb = rgb_at(x, y);
                let idx = y * width + x;
                match img_type {
                    ImgType::Raw8 => buffer[idx] = rgb[cfa_channel(x, y)],
                    ImgType::Raw16 => {
                        let value = (rgb[cfa_channel(x, y)] as u16) << 8;
                        buffer[2 * idx..2 * idx + 2].copy_from_slice(&value.to_le_bytes());
                    },
                    ImgType::Y8 => {
                        buffer[idx] = ((rgb[RED] as u32 * 77 + rgb[GREEN] as u32 * 150 + rgb[BLUE] as u32 * 29) >> 8) as u8;
                    },
                    // the SDK delivers BGR
                    ImgType::Rgb24 => {
                        buffer[3 * idx] = rgb[BLUE];
                        buffer[3 * idx + 1] = rgb[GREEN];
                        buffer[3 * idx + 2] = rgb[RED];
                    }
                }
            }
        }

        Ok(())
    }
}

impl SimSdk {
    pub fn new(num_cameras: usize) -> SimSdk {
        SimSdk{ cameras: (0..num_cameras).map(|i| Mutex::new(SimCamera::new(i))).collect() }
    }

    fn camera(&self, id: CameraId) -> Result<MutexGuard<'_, SimCamera>, SdkError> {
        if id.0 < 0 { return Err(SdkError::InvalidId); }
        match self.cameras.get(id.0 as usize) {
            Some(camera) => Ok(camera.lock().unwrap_or_else(|e| e.into_inner())),
            None => Err(SdkError::InvalidId)
        }
    }

    /// Makes subsequent `exposure_status` calls return the provided results (before falling back
    /// to time-based behavior).
    pub fn script_exposure_statuses<I>(&self, id: CameraId, statuses: I)
    where I: IntoIterator<Item=Result<ExposureStatus, SdkError>> {
        if let Ok(mut camera) = self.camera(id) {
            camera.script.exposure_statuses.extend(statuses);
        }
    }

    /// Makes subsequent `video_data` calls return the provided results (a frame is rendered for each `Ok`).
    pub fn script_video_results<I>(&self, id: CameraId, results: I)
    where I: IntoIterator<Item=Result<(), SdkError>> {
        if let Ok(mut camera) = self.camera(id) {
            camera.script.video_results.extend(results);
        }
    }

    /// Makes the next `count` calls to `start_exposure` fail.
    pub fn fail_exposure_starts(&self, id: CameraId, count: usize) {
        if let Ok(mut camera) = self.camera(id) {
            camera.script.start_exposure_failures = count;
        }
    }

    /// Makes all writes of `control` fail.
    pub fn fail_control_writes(&self, id: CameraId, control: ControlType) {
        if let Ok(mut camera) = self.camera(id) {
            camera.script.failing_controls.push(control);
        }
    }

    pub fn calls(&self, id: CameraId) -> SimCalls {
        match self.camera(id) {
            Ok(camera) => camera.calls.clone(),
            Err(_) => SimCalls::default()
        }
    }

    pub fn temperature(&self, id: CameraId) -> Option<f64> {
        self.camera(id).ok().map(|c| c.temperature)
    }
}

impl CameraSdk for SimSdk {
    fn name(&self) -> &'static str { "Sim" }

    fn version(&self) -> String { "simulator".to_string() }

    fn enumerate_cameras(&self) -> Result<Vec<CameraInfo>, SdkError> {
        Ok(self.cameras.iter().map(|c| c.lock().unwrap_or_else(|e| e.into_inner()).info.clone()).collect())
    }

    fn open(&self, id: CameraId) -> Result<(), SdkError> {
        let mut camera = self.camera(id)?;
        camera.calls.open += 1;
        camera.open = true;
        Ok(())
    }

    fn init(&self, id: CameraId) -> Result<(), SdkError> {
        self.camera(id)?.check_open()
    }

    fn close(&self, id: CameraId) -> Result<(), SdkError> {
        let mut camera = self.camera(id)?;
        camera.calls.close += 1;
        camera.open = false;
        camera.video_active = false;
        camera.exposure = None;
        Ok(())
    }

    fn num_controls(&self, id: CameraId) -> Result<usize, SdkError> {
        let camera = self.camera(id)?;
        camera.check_open()?;
        Ok(camera.caps.len())
    }

    fn control_caps(&self, id: CameraId, index: usize) -> Result<ControlCaps, SdkError> {
        let camera = self.camera(id)?;
        camera.check_open()?;
        camera.caps.get(index).cloned().ok_or(SdkError::InvalidIndex)
    }

    fn control_value(&self, id: CameraId, control: ControlType) -> Result<(i64, bool), SdkError> {
        let mut camera = self.camera(id)?;
        camera.check_open()?;
        if control == ControlType::Temperature { camera.update_temperature(); }
        match camera.controls.get(&control) {
            Some(value) => Ok(*value),
            None => Err(SdkError::InvalidControlType)
        }
    }

    fn set_control_value(&self, id: CameraId, control: ControlType, value: i64, auto: bool) -> Result<(), SdkError> {
        let mut camera = self.camera(id)?;
        camera.check_open()?;
        camera.calls.set_control.push((control, value, auto));
        if camera.script.failing_controls.contains(&control) {
            return Err(SdkError::GeneralError);
        }

        let caps = match camera.caps.iter().find(|c| c.control_type == control) {
            Some(caps) => caps.clone(),
            None => return Err(SdkError::InvalidControlType)
        };
        if !caps.is_writable { return Err(SdkError::GeneralError); }

        camera.controls.insert(control, (value.max(caps.min).min(caps.max), auto));
        Ok(())
    }

    fn roi_format(&self, id: CameraId) -> Result<RoiFormat, SdkError> {
        let camera = self.camera(id)?;
        camera.check_open()?;
        Ok(camera.roi)
    }

    fn set_roi_format(&self, id: CameraId, format: RoiFormat) -> Result<(), SdkError> {
        let mut camera = self.camera(id)?;
        camera.check_open()?;
        if !camera.info.supported_bins.contains(&format.bin) || format.width == 0 || format.height == 0 {
            return Err(SdkError::InvalidSize);
        }
        if format.width * format.bin > camera.info.max_width || format.height * format.bin > camera.info.max_height {
            return Err(SdkError::InvalidSize);
        }
        camera.roi = format;
        camera.start_pos = (0, 0);
        Ok(())
    }

    fn set_start_pos(&self, id: CameraId, x: u32, y: u32) -> Result<(), SdkError> {
        let mut camera = self.camera(id)?;
        camera.check_open()?;
        camera.start_pos = (x, y);
        Ok(())
    }

    fn start_exposure(&self, id: CameraId, is_dark: bool) -> Result<(), SdkError> {
        let mut camera = self.camera(id)?;
        camera.check_open()?;
        camera.calls.start_exposure += 1;
        if camera.script.start_exposure_failures > 0 {
            camera.script.start_exposure_failures -= 1;
            return Err(SdkError::GeneralError);
        }
        if camera.video_active { return Err(SdkError::VideoModeActive); }

        let exposure_us = camera.control(ControlType::Exposure).0.max(0) as u64;
        camera.exposure = Some(Exposure{
            started: Instant::now(),
            duration: Duration::from_micros(exposure_us),
            dark: is_dark
        });
        Ok(())
    }

    fn stop_exposure(&self, id: CameraId) -> Result<(), SdkError> {
        let mut camera = self.camera(id)?;
        camera.calls.stop_exposure += 1;
        camera.exposure = None;
        Ok(())
    }

    fn exposure_status(&self, id: CameraId) -> Result<ExposureStatus, SdkError> {
        let mut camera = self.camera(id)?;
        camera.calls.exposure_status += 1;
        camera.check_open()?;
        if let Some(scripted) = camera.script.exposure_statuses.pop_front() {
            return scripted;
        }

        Ok(match &camera.exposure {
            None => ExposureStatus::Idle,
            Some(exposure) => if exposure.started.elapsed() >= exposure.duration {
                ExposureStatus::Success
            } else {
                ExposureStatus::Working
            }
        })
    }

    fn data_after_exposure(&self, id: CameraId, buffer: &mut [u8]) -> Result<(), SdkError> {
        let mut camera = self.camera(id)?;
        camera.calls.data_after_exposure += 1;
        camera.check_open()?;
        let dark = camera.exposure.take().map(|e| e.dark).unwrap_or(false);
        camera.render(buffer, dark)
    }

    fn start_video_capture(&self, id: CameraId) -> Result<(), SdkError> {
        let mut camera = self.camera(id)?;
        camera.check_open()?;
        camera.calls.start_video += 1;
        camera.video_active = true;
        camera.t_last_frame = Instant::now();
        Ok(())
    }

    fn stop_video_capture(&self, id: CameraId) -> Result<(), SdkError> {
        let mut camera = self.camera(id)?;
        camera.calls.stop_video += 1;
        camera.video_active = false;
        Ok(())
    }

    fn video_data(&self, id: CameraId, buffer: &mut [u8], wait_ms: i32) -> Result<(), SdkError> {
        let wait_for = {
            let mut camera = self.camera(id)?;
            camera.calls.video_data += 1;
            camera.check_open()?;

            if let Some(scripted) = camera.script.video_results.pop_front() {
                return match scripted {
                    Ok(()) => camera.render(buffer, false),
                    Err(e) => Err(e)
                };
            }

            if !camera.video_active { return Err(SdkError::InvalidSequence); }

            let period = Duration::from_micros(camera.control(ControlType::Exposure).0.max(1000) as u64);
            let elapsed = camera.t_last_frame.elapsed();
            let wait_limit = Duration::from_millis(wait_ms.max(0) as u64);
            let remaining = if period > elapsed { period - elapsed } else { Duration::ZERO };
            if remaining > wait_limit {
                // do not hold the camera while "waiting" for the frame
                drop(camera);
                std::thread::sleep(wait_limit);
                return Err(SdkError::Timeout);
            }
            remaining
        };

        std::thread::sleep(wait_for);

        let mut camera = self.camera(id)?;
        camera.t_last_frame = Instant::now();
        camera.render(buffer, false)
    }

    fn pulse_guide_on(&self, id: CameraId, direction: GuideDirection) -> Result<(), SdkError> {
        let mut camera = self.camera(id)?;
        camera.check_open()?;
        camera.calls.pulse_on.push(direction);
        Ok(())
    }

    fn pulse_guide_off(&self, id: CameraId, direction: GuideDirection) -> Result<(), SdkError> {
        let mut camera = self.camera(id)?;
        camera.check_open()?;
        camera.calls.pulse_off.push(direction);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposure_completes_after_its_duration() {
        let sdk = SimSdk::new(1);
        let id = CameraId(0);
        sdk.open(id).unwrap();
        sdk.set_control_value(id, ControlType::Exposure, 20_000, false).unwrap();
        sdk.start_exposure(id, false).unwrap();
        assert_eq!(ExposureStatus::Working, sdk.exposure_status(id).unwrap());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(ExposureStatus::Success, sdk.exposure_status(id).unwrap());

        let mut buf = vec![0u8; (SENSOR_WIDTH * SENSOR_HEIGHT) as usize];
        sdk.data_after_exposure(id, &mut buf).unwrap();
        assert_eq!(ExposureStatus::Idle, sdk.exposure_status(id).unwrap());
    }

    #[test]
    fn scripted_statuses_take_precedence() {
        let sdk = SimSdk::new(1);
        let id = CameraId(0);
        sdk.open(id).unwrap();
        sdk.script_exposure_statuses(id, vec![Ok(ExposureStatus::Failed), Err(SdkError::Timeout)]);
        assert_eq!(Ok(ExposureStatus::Failed), sdk.exposure_status(id));
        assert_eq!(Err(SdkError::Timeout), sdk.exposure_status(id));
        assert_eq!(Ok(ExposureStatus::Idle), sdk.exposure_status(id));
        assert_eq!(3, sdk.calls(id).exposure_status);
    }

    #[test]
    fn closed_camera_rejects_calls() {
        let sdk = SimSdk::new(1);
        assert_eq!(Err(SdkError::CameraClosed), sdk.start_exposure(CameraId(0), false));
        assert_eq!(Err(SdkError::InvalidId), sdk.open(CameraId(3)));
    }

    #[test]
    fn rgb_frames_are_delivered_as_bgr() {
        let sdk = SimSdk::new(1);
        let id = CameraId(0);
        sdk.open(id).unwrap();
        sdk.set_roi_format(id, RoiFormat{ width: 64, height: 64, bin: 1, img_type: ImgType::Rgb24 }).unwrap();
        sdk.script_video_results(id, vec![Ok(())]);
        let mut buf = vec![0u8; 64 * 64 * 3];
        sdk.video_data(id, &mut buf, 100).unwrap();
        // background pixel: red = x/2, green = y/2, blue = 40
        assert_eq!(40, buf[3 * (10 * 64 + 3)]);
    }

    #[test]
    fn too_small_buffer_is_rejected() {
        let sdk = SimSdk::new(1);
        let id = CameraId(0);
        sdk.open(id).unwrap();
        sdk.start_exposure(id, false).unwrap();
        let mut buf = vec![0u8; 16];
        assert_eq!(Err(SdkError::BufferTooSmall), sdk.data_after_exposure(id, &mut buf));
    }

    #[test]
    fn cooler_drives_temperature_toward_target() {
        let sdk = SimSdk::new(1);
        let id = CameraId(0);
        sdk.open(id).unwrap();
        sdk.set_control_value(id, ControlType::TargetTemp, 10, true).unwrap();
        sdk.set_control_value(id, ControlType::CoolerOn, 1, false).unwrap();
        for _ in 0..30 { sdk.control_value(id, ControlType::Temperature).unwrap(); }
        assert_eq!((100, false), sdk.control_value(id, ControlType::Temperature).unwrap());
        assert_eq!(30, sdk.control_value(id, ControlType::CoolerPowerPerc).unwrap().0);
    }
}
