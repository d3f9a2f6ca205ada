//
// ccdhost - CCD camera driver host for amateur astronomy
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! CCD device driver.
//!
//! `AsiCcd` runs on the host thread: it handles property requests, timers (temperature polling, guide pulses)
//! and events sent by its imaging thread. Acquisition itself is performed by the imaging thread
//! (see `workers::imaging`).
//!

pub mod chip;
pub mod controls;
pub mod guide;
pub mod properties;
pub mod video;

use crate::camera::{CameraInfo, CameraSdk, ControlType, GuideDirection, ImgType, RoiFormat, SdkError};
use crate::config::DeviceConfig;
use crate::host::DeviceEvent;
use crate::host::property::*;
use crate::streaming::Streamer;
use crate::timer::{EventLoop, TimerId};
use crate::workers::imaging::{self, FrameSetup, ImageState, Shared};
use chip::{CcdChip, FrameError, FrameType};
use controls::ControlSet;
use crossbeam::channel::Sender;
use guide::{Axis, GuideAxis};
use properties::{names, Capabilities, StandardProperties};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;
use video::VideoFormats;

/// Interval of temperature and cooler power polling.
const TEMP_TIMER: Duration = Duration::from_millis(1000);
/// Temperature difference (deg. C) within which the requested temperature counts as reached.
const TEMP_THRESHOLD: f64 = 0.25;
const INITIAL_BANDWIDTH: i64 = 40;

#[derive(Debug)]
pub enum CcdError {
    Sdk(SdkError),
    Frame(FrameError),
    ThreadSpawn(std::io::Error),
    NotConnected
}

impl std::fmt::Display for CcdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CcdError::Sdk(e) => write!(f, "camera SDK error: {}", e),
            CcdError::Frame(e) => write!(f, "{}", e),
            CcdError::ThreadSpawn(e) => write!(f, "failed to start imaging thread: {}", e),
            CcdError::NotConnected => write!(f, "not connected")
        }
    }
}

impl std::error::Error for CcdError {}

impl From<SdkError> for CcdError {
    fn from(e: SdkError) -> CcdError { CcdError::Sdk(e) }
}

impl From<FrameError> for CcdError {
    fn from(e: FrameError) -> CcdError { CcdError::Frame(e) }
}

impl From<CcdError> for PropertyError {
    fn from(e: CcdError) -> PropertyError {
        match e {
            CcdError::NotConnected => PropertyError::NotConnected,
            e => PropertyError::Rejected(e.to_string())
        }
    }
}

fn find_value<T: Copy>(values: &[(&str, T)], name: &str) -> Option<T> {
    values.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
}

fn schedule_guide_timer(event_loop: &EventLoop, device: Weak<RefCell<AsiCcd>>, axis: Axis, delay: Duration) -> TimerId {
    event_loop.add_timer(delay, move || {
        if let Some(device) = device.upgrade() {
            device.borrow_mut().guide_timeout(axis);
        }
    })
}

pub struct AsiCcd {
    name: String,
    info: CameraInfo,
    sdk: Arc<dyn CameraSdk>,
    event_loop: Rc<EventLoop>,
    events: Sender<DeviceEvent>,
    self_ref: Weak<RefCell<AsiCcd>>,
    shared: Arc<Shared>,
    worker: Option<std::thread::JoinHandle<()>>,
    connected: bool,
    chip: CcdChip,
    img_type: ImgType,
    properties: StandardProperties,
    /// Created on connection.
    controls: Option<ControlSet>,
    /// Created on connection.
    video_formats: Option<VideoFormats>,
    guide_ns: GuideAxis,
    guide_we: GuideAxis,
    temperature_timer: Option<TimerId>,
    temperature_request: f64,
    /// Settings applied on connection.
    saved_config: Option<DeviceConfig>
}

impl AsiCcd {
    pub fn new(
        name: &str,
        info: CameraInfo,
        sdk: Arc<dyn CameraSdk>,
        event_loop: Rc<EventLoop>,
        events: Sender<DeviceEvent>,
        streamer: Box<dyn Streamer>
    ) -> Rc<RefCell<AsiCcd>> {
        let chip = CcdChip::new(&info);
        let img_type = ImgType::Raw8;
        let setup = FrameSetup{
            width: chip.x_res,
            height: chip.y_res,
            img_type,
            bits_per_pixel: img_type.bits_per_pixel(),
            frame_type: chip.frame_type,
            is_color: info.is_color,
            bayer_pattern: info.bayer_pattern
        };
        let shared = Arc::new(Shared::new(name, info.id, Arc::clone(&sdk), setup, streamer, events.clone()));
        let properties = StandardProperties::new(name, &info, &sdk.version());

        Rc::new_cyclic(|self_ref| RefCell::new(AsiCcd{
            name: name.to_string(),
            info,
            sdk,
            event_loop,
            events,
            self_ref: self_ref.clone(),
            shared,
            worker: None,
            connected: false,
            chip,
            img_type,
            properties,
            controls: None,
            video_formats: None,
            guide_ns: GuideAxis::new(name, Axis::NS),
            guide_we: GuideAxis::new(name, Axis::WE),
            temperature_timer: None,
            temperature_request: 0.0,
            saved_config: None
        }))
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn is_connected(&self) -> bool { self.connected }

    pub fn capabilities(&self) -> Capabilities { Capabilities::new(&self.info) }

    pub fn properties(&self) -> &StandardProperties { &self.properties }

    pub fn controls(&self) -> Option<&ControlSet> { self.controls.as_ref() }

    pub fn chip(&self) -> &CcdChip { &self.chip }

    pub fn video_format(&self) -> ImgType { self.img_type }

    pub fn image_state(&self) -> ImageState { self.shared.mailbox.state() }

    pub fn in_exposure(&self) -> bool { self.shared.in_exposure() }

    pub fn set_saved_config(&mut self, config: Option<DeviceConfig>) {
        self.saved_config = config;
    }

    fn send(&self, event: DeviceEvent) {
        if self.events.send(event).is_err() {
            log::debug!("{}: event receiver is gone", self.name);
        }
    }

    fn publish<P: Into<Property>>(&self, property: P) {
        self.send(DeviceEvent::PropertyUpdated(property.into()));
    }

    fn guide_axis(&self, axis: Axis) -> &GuideAxis {
        match axis { Axis::NS => &self.guide_ns, Axis::WE => &self.guide_we }
    }

    fn guide_axis_mut(&mut self, axis: Axis) -> &mut GuideAxis {
        match axis { Axis::NS => &mut self.guide_ns, Axis::WE => &mut self.guide_we }
    }

    /// Opens the camera, starts the imaging thread and sets up all parameters.
    ///
    /// Returns after the imaging thread has started.
    ///
    pub fn connect(&mut self) -> Result<(), CcdError> {
        if self.connected { return Ok(()); }

        let camera = self.info.id;

        if let Err(e) = self.sdk.open(camera) {
            log::error!("{}: error connecting to the CCD: {}", self.name, e);
            return Err(e.into());
        }

        if let Err(e) = self.sdk.init(camera) {
            log::error!("{}: error initializing the CCD: {}", self.name, e);
            let _ = self.sdk.close(camera);
            return Err(e.into());
        }

        self.arm_temperature_timer();

        self.shared.mailbox.reset();
        match imaging::spawn(Arc::clone(&self.shared)) {
            Ok(handle) => self.worker = Some(handle),
            Err(e) => {
                log::error!("{}: failed to start the imaging thread: {}", self.name, e);
                if let Some(id) = self.temperature_timer.take() { self.event_loop.remove_timer(id); }
                let _ = self.sdk.close(camera);
                return Err(CcdError::ThreadSpawn(e));
            }
        }
        self.shared.mailbox.wait_until_started();

        if let Err(e) = self.sdk.set_control_value(camera, ControlType::BandWidth, INITIAL_BANDWIDTH, false) {
            log::error!("{}: failed to set initial USB bandwidth: {}", self.name, e);
        }

        log::info!("{}: CCD is online, retrieving basic data", self.name);
        self.connected = true;

        if let Err(e) = self.setup_params() {
            log::error!("{}: failed to set up camera parameters: {}", self.name, e);
            self.disconnect()?;
            return Err(e);
        }

        self.apply_saved_config();

        self.set_connection_switch(true);
        self.publish(self.properties.connection.clone());

        Ok(())
    }

    /// Stops the imaging thread and closes the camera.
    ///
    /// An exposure or video capture in progress when the thread was stopped is stopped afterwards.
    ///
    pub fn disconnect(&mut self) -> Result<(), CcdError> {
        if !self.connected { return Ok(()); }

        let camera = self.info.id;
        self.saved_config = Some(self.save_config_items());

        let previous_state = self.shared.mailbox.terminate();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("{}: imaging thread ended with a panic", self.name);
            }
        }

        match previous_state {
            ImageState::Exposure | ImageState::RestartExposure => {
                if let Err(e) = self.sdk.stop_exposure(camera) {
                    log::warn!("{}: failed to stop exposure: {}", self.name, e);
                }
            },
            ImageState::Stream => {
                if let Err(e) = self.sdk.stop_video_capture(camera) {
                    log::warn!("{}: failed to stop video capture: {}", self.name, e);
                }
                self.shared.streamer().set_stream(false);
            },
            _ => ()
        }
        self.shared.set_in_exposure(false);
        self.reset_acquisition_properties();

        for axis in [Axis::NS, Axis::WE].iter() {
            let sdk = Arc::clone(&self.sdk);
            let event_loop = Rc::clone(&self.event_loop);
            if self.guide_axis_mut(*axis).stop(&*sdk, camera, &event_loop) {
                self.send(DeviceEvent::GuideComplete{ device: self.name.clone(), axis: *axis });
            }
        }

        if let Some(id) = self.temperature_timer.take() {
            self.event_loop.remove_timer(id);
        }

        if let Err(e) = self.sdk.close(camera) {
            log::warn!("{}: failed to close camera: {}", self.name, e);
        }

        self.connected = false;
        self.set_connection_switch(false);
        self.publish(self.properties.connection.clone());
        log::info!("{}: CCD is offline", self.name);

        Ok(())
    }

    fn reset_acquisition_properties(&mut self) {
        self.properties.exposure.set_value(names::CCD_EXPOSURE_VALUE, 0.0);
        self.properties.exposure.set_state(PropertyState::Idle);
        for item in &mut self.properties.stream.items {
            item.on = item.name == names::STREAM_OFF;
        }
        self.properties.stream.set_state(PropertyState::Idle);
    }

    fn set_connection_switch(&mut self, connected: bool) {
        for item in &mut self.properties.connection.items {
            item.on = (item.name == names::CONNECT) == connected;
        }
        self.properties.connection.set_state(if connected { PropertyState::Ok } else { PropertyState::Idle });
    }

    fn setup_params(&mut self) -> Result<(), CcdError> {
        let camera = self.info.id;

        let (controls, exposure_limits) = ControlSet::create(&self.name, &*self.sdk, camera, &self.info)?;
        self.controls = Some(controls);
        if let Some(limits) = exposure_limits {
            if let Some(item) = self.properties.exposure.item_mut(names::CCD_EXPOSURE_VALUE) {
                item.min = limits.min;
                item.max = limits.max;
            }
        }

        if self.info.has_cooler {
            for i in 0..self.sdk.num_controls(camera)? {
                let caps = self.sdk.control_caps(camera, i)?;
                if caps.control_type == ControlType::TargetTemp {
                    if let Some(item) = self.properties.temperature.item_mut(names::CCD_TEMPERATURE_VALUE) {
                        item.min = caps.min as f64;
                        item.max = caps.max as f64;
                    }
                }
            }
        }

        self.img_type = self.sdk.roi_format(camera)?.img_type;
        self.video_formats = Some(VideoFormats::new(&self.name, &self.info, self.img_type));

        self.chip.bin = 1;
        self.chip.bits_per_pixel = self.img_type.bits_per_pixel();
        self.properties.info.set_value(names::CCD_BITSPERPIXEL, self.chip.bits_per_pixel as f64);
        self.properties.binning.update(&[(names::HOR_BIN, 1.0), (names::VER_BIN, 1.0)]);

        match self.sdk.control_value(camera, ControlType::Temperature) {
            Ok((value, _)) => {
                let temperature = value as f64 / 10.0;
                log::debug!("{}: current temperature: {:.2} C", self.name, temperature);
                self.properties.temperature.set_value(names::CCD_TEMPERATURE_VALUE, temperature);
            },
            Err(e) => log::error!("{}: failed to read temperature: {}", self.name, e)
        }

        if let Err(e) = self.sdk.stop_video_capture(camera) {
            log::debug!("{}: failed to stop video capture: {}", self.name, e);
        }

        self.update_ccd_frame(0, 0, self.chip.x_res, self.chip.y_res)?;
        self.update_recorder_format();

        Ok(())
    }

    fn update_recorder_format(&mut self) {
        let (format, bits_per_pixel) = video::pixel_format(self.img_type, self.info.is_color, self.info.bayer_pattern);
        self.shared.streamer().set_pixel_format(format, bits_per_pixel);
    }

    fn sync_frame_setup(&self) {
        let (width, height) = self.chip.binned_size();
        self.shared.set_setup(FrameSetup{
            width,
            height,
            img_type: self.img_type,
            bits_per_pixel: self.chip.bits_per_pixel,
            frame_type: self.chip.frame_type,
            is_color: self.info.is_color,
            bayer_pattern: self.info.bayer_pattern
        });
    }

    /// Starts an exposure of `duration` seconds; completion is reported with `DeviceEvent::ExposureComplete`.
    pub fn start_exposure(&mut self, duration: f64) -> Result<(), CcdError> {
        if !self.connected { return Err(CcdError::NotConnected); }

        self.sync_frame_setup();
        if let Err(e) = self.shared.arm_exposure(duration) {
            log::error!("{}: failed to start exposure: {}", self.name, e);
            return Err(e.into());
        }
        self.shared.mailbox.set_request(ImageState::Exposure);

        Ok(())
    }

    /// Stops the current exposure; returns once the imaging thread no longer handles it.
    pub fn abort_exposure(&mut self) -> Result<(), CcdError> {
        if !self.connected { return Err(CcdError::NotConnected); }

        log::debug!("{}: aborting exposure", self.name);
        self.shared.mailbox.set_request_and_wait(
            ImageState::Abort,
            &[ImageState::Exposure, ImageState::RestartExposure]
        );
        if let Err(e) = self.sdk.stop_exposure(self.info.id) {
            log::warn!("{}: failed to stop exposure: {}", self.name, e);
        }
        self.shared.set_in_exposure(false);

        Ok(())
    }

    pub fn start_streaming(&mut self) -> Result<(), CcdError> {
        if !self.connected { return Err(CcdError::NotConnected); }

        let camera = self.info.id;
        let exposure = 1.0 / self.shared.streamer().target_fps();
        self.shared.set_exposure_request(exposure);

        // leave some margin for frame readout
        let exposure_us = (exposure * 950_000.0) as i64;
        if let Err(e) = self.sdk.set_control_value(camera, ControlType::Exposure, exposure_us, false) {
            log::warn!("{}: failed to set exposure time: {}", self.name, e);
        }

        if let Err(e) = self.sdk.start_video_capture(camera) {
            log::error!("{}: failed to start video capture: {}", self.name, e);
            return Err(e.into());
        }

        self.shared.mailbox.set_request(ImageState::Stream);

        Ok(())
    }

    /// Stops streaming; returns once the imaging thread no longer reads frames.
    pub fn stop_streaming(&mut self) -> Result<(), CcdError> {
        if !self.connected { return Err(CcdError::NotConnected); }

        self.shared.mailbox.set_request_and_wait(ImageState::Abort, &[ImageState::Stream]);
        if let Err(e) = self.sdk.stop_video_capture(self.info.id) {
            log::warn!("{}: failed to stop video capture: {}", self.name, e);
        }

        Ok(())
    }

    fn arm_temperature_timer(&mut self) {
        let device = self.self_ref.clone();
        self.temperature_timer = Some(self.event_loop.add_timer(TEMP_TIMER, move || {
            if let Some(device) = device.upgrade() {
                device.borrow_mut().timer_hit();
            }
        }));
    }

    /// Polls temperature and cooler power; re-arms itself.
    pub fn timer_hit(&mut self) {
        if let Some(id) = self.temperature_timer.take() {
            self.event_loop.remove_timer(id);
        }
        if !self.connected { return; }

        let camera = self.info.id;
        let previous = self.properties.temperature.value(names::CCD_TEMPERATURE_VALUE).unwrap_or(0.0);

        match self.sdk.control_value(camera, ControlType::Temperature) {
            Ok((value, _)) => {
                self.properties.temperature.set_value(names::CCD_TEMPERATURE_VALUE, value as f64 / 10.0);
            },
            Err(e) => {
                log::error!("{}: failed to read temperature: {}", self.name, e);
                self.properties.temperature.set_state(PropertyState::Alert);
            }
        }

        let temperature = self.properties.temperature.value(names::CCD_TEMPERATURE_VALUE).unwrap_or(0.0);
        match self.properties.temperature.state() {
            PropertyState::Idle | PropertyState::Ok => {
                if (temperature - previous).abs() > TEMP_THRESHOLD / 10.0 {
                    self.publish(self.properties.temperature.clone());
                }
            },

            PropertyState::Busy => {
                if (self.temperature_request - temperature).abs() <= TEMP_THRESHOLD {
                    log::info!("{}: temperature {:.2} C reached", self.name, temperature);
                    self.properties.temperature.set_state(PropertyState::Ok);
                }
                self.publish(self.properties.temperature.clone());
            },

            PropertyState::Alert => ()
        }

        if self.info.has_cooler {
            match self.sdk.control_value(camera, ControlType::CoolerPowerPerc) {
                Ok((power, _)) => {
                    self.properties.cooler_power.set_value(names::CCD_COOLER_VALUE, power as f64);
                    self.properties.cooler_power.set_state(
                        if power > 0 { PropertyState::Busy } else { PropertyState::Idle }
                    );
                },
                Err(e) => {
                    log::error!("{}: failed to read cooler power: {}", self.name, e);
                    self.properties.cooler_power.set_state(PropertyState::Alert);
                }
            }
            self.publish(self.properties.cooler_power.clone());
        }

        self.arm_temperature_timer();
    }

    /// Requests sensor temperature; returns `Ok` if already reached, `Busy` if cooling/warming has started.
    pub fn set_temperature(&mut self, temperature: f64) -> PropertyState {
        let current = self.properties.temperature.value(names::CCD_TEMPERATURE_VALUE).unwrap_or(0.0);
        if (temperature - current).abs() < TEMP_THRESHOLD {
            return PropertyState::Ok;
        }

        if !self.activate_cooler(true) {
            log::error!("{}: failed to activate cooler", self.name);
            return PropertyState::Alert;
        }

        // the camera accepts whole degrees; round away from zero
        let target = if temperature > 0.5 { (temperature + 0.49) as i64 } else { (temperature - 0.49) as i64 };
        if let Err(e) = self.sdk.set_control_value(self.info.id, ControlType::TargetTemp, target, true) {
            log::error!("{}: failed to set temperature: {}", self.name, e);
            return PropertyState::Alert;
        }

        self.temperature_request = temperature;
        log::info!("{}: setting CCD temperature to {:+06.2} C", self.name, temperature);

        PropertyState::Busy
    }

    /// Turns the cooler on or off; returns false on failure.
    pub fn activate_cooler(&mut self, enable: bool) -> bool {
        let result = match self.sdk.set_control_value(self.info.id, ControlType::CoolerOn, enable as i64, false) {
            Ok(()) => {
                for item in &mut self.properties.cooler.items {
                    item.on = (item.name == names::COOLER_ON) == enable;
                }
                self.properties.cooler.set_state(if enable { PropertyState::Busy } else { PropertyState::Idle });
                true
            },
            Err(e) => {
                log::error!("{}: failed to {} cooler: {}", self.name, if enable { "activate" } else { "deactivate" }, e);
                self.properties.cooler.set_state(PropertyState::Alert);
                false
            }
        };
        self.publish(self.properties.cooler.clone());

        result
    }

    /// Sets the region of interest (unbinned coordinates).
    ///
    /// Width is reduced to a multiple of 8 and height to a multiple of 2 (binned).
    ///
    pub fn update_ccd_frame(&mut self, x: u32, y: u32, w: u32, h: u32) -> Result<(), CcdError> {
        let camera = self.info.id;

        let roi = match self.chip.fit_frame(x, y, w, h) {
            Ok(roi) => roi,
            Err(e) => {
                log::error!("{}: {}", self.name, e);
                return Err(e.into());
            }
        };

        log::debug!(
            "{}: frame ROI x: {}, y: {}, w: {}, h: {}, bin: {}, type: {:?}",
            self.name, roi.x, roi.y, roi.width, roi.height, self.chip.bin, self.img_type
        );

        let format = RoiFormat{ width: roi.width, height: roi.height, bin: self.chip.bin, img_type: self.img_type };
        if let Err(e) = self.sdk.set_roi_format(camera, format) {
            log::error!("{}: failed to set ROI format: {}", self.name, e);
            return Err(e.into());
        }
        if let Err(e) = self.sdk.set_start_pos(camera, roi.x, roi.y) {
            log::error!("{}: failed to set ROI start position: {}", self.name, e);
            return Err(e.into());
        }

        self.chip.set_frame(&roi);
        self.properties.frame.update(&[
            (names::X, self.chip.sub_x as f64),
            (names::Y, self.chip.sub_y as f64),
            (names::WIDTH, self.chip.sub_w as f64),
            (names::HEIGHT, self.chip.sub_h as f64)
        ]);

        let buffer_size = self.chip.frame_buffer_size(self.img_type);
        log::debug!("{}: setting frame buffer size to {} bytes", self.name, buffer_size);
        self.shared.frame_buffer().resize(buffer_size, 0);

        self.sync_frame_setup();
        self.shared.streamer().set_size(roi.width, roi.height);

        Ok(())
    }

    /// Sets square binning and re-applies the current frame.
    pub fn update_ccd_bin(&mut self, bin: u32) -> Result<(), CcdError> {
        let previous = self.chip.bin;
        self.chip.bin = bin.max(1);

        let (x, y, w, h) = (self.chip.sub_x, self.chip.sub_y, self.chip.sub_w, self.chip.sub_h);
        match self.update_ccd_frame(x, y, w, h) {
            Ok(()) => {
                self.properties.binning.update(&[(names::HOR_BIN, bin as f64), (names::VER_BIN, bin as f64)]);
                Ok(())
            },
            Err(e) => {
                self.chip.bin = previous;
                Err(e)
            }
        }
    }

    pub fn set_frame_type(&mut self, frame_type: FrameType) {
        self.chip.frame_type = frame_type;
        self.properties.set_frame_type(frame_type);
        self.sync_frame_setup();
    }

    /// Changes the image type; the frame is reset to full sensor size.
    pub fn set_video_format(&mut self, img_type: ImgType) -> Result<(), CcdError> {
        if img_type == ImgType::Raw16 {
            log::warn!("{}: 16-bit RAW is not supported on all hardware platforms", self.name);
        }

        let (previous_type, previous_bpp) = (self.img_type, self.chip.bits_per_pixel);
        self.img_type = img_type;
        self.chip.bits_per_pixel = img_type.bits_per_pixel();

        if let Err(e) = self.update_ccd_frame(0, 0, self.chip.x_res, self.chip.y_res) {
            self.img_type = previous_type;
            self.chip.bits_per_pixel = previous_bpp;
            return Err(e);
        }

        self.properties.info.set_value(names::CCD_BITSPERPIXEL, self.chip.bits_per_pixel as f64);
        self.update_recorder_format();

        if let Some(formats) = &mut self.video_formats {
            if let Err(e) = formats.select(img_type) {
                log::warn!("{}: {}", self.name, e);
            }
            formats.set_state(PropertyState::Ok);
        }

        Ok(())
    }

    pub fn guide_north(&mut self, ms: f64) -> PropertyState { self.guide(Axis::NS, GuideDirection::North, ms) }

    pub fn guide_south(&mut self, ms: f64) -> PropertyState { self.guide(Axis::NS, GuideDirection::South, ms) }

    pub fn guide_east(&mut self, ms: f64) -> PropertyState { self.guide(Axis::WE, GuideDirection::East, ms) }

    pub fn guide_west(&mut self, ms: f64) -> PropertyState { self.guide(Axis::WE, GuideDirection::West, ms) }

    fn guide(&mut self, axis: Axis, direction: GuideDirection, ms: f64) -> PropertyState {
        let camera = self.info.id;
        let sdk = Arc::clone(&self.sdk);
        let event_loop = Rc::clone(&self.event_loop);
        let device = self.self_ref.clone();

        if self.guide_axis_mut(axis).stop(&*sdk, camera, &event_loop) {
            self.send(DeviceEvent::GuideComplete{ device: self.name.clone(), axis });
        }

        let result = self.guide_axis_mut(axis).start(
            &*sdk, camera, ms, direction, |delay| schedule_guide_timer(&event_loop, device, axis, delay)
        );

        match result {
            Ok(state) => state,
            Err(e) => {
                log::error!("{}: failed to start {} guide pulse: {}", self.name, direction, e);
                PropertyState::Alert
            }
        }
    }

    /// Called when the guide pulse timer of `axis` expires.
    pub fn guide_timeout(&mut self, axis: Axis) {
        let camera = self.info.id;
        let sdk = Arc::clone(&self.sdk);
        let event_loop = Rc::clone(&self.event_loop);
        let device = self.self_ref.clone();

        let completed = self.guide_axis_mut(axis).on_timer(
            &*sdk, camera, |delay| schedule_guide_timer(&event_loop, device, axis, delay)
        );

        if completed {
            self.send(DeviceEvent::GuideComplete{ device: self.name.clone(), axis });
        }
    }

    pub fn get_properties(&self) -> Vec<Property> {
        let p = &self.properties;
        let caps = self.capabilities();

        let mut result: Vec<Property> = vec![p.connection.clone().into()];
        if !self.connected { return result; }

        result.push(p.exposure.clone().into());
        if caps.can_abort { result.push(p.abort.clone().into()); }
        if caps.can_subframe { result.push(p.frame.clone().into()); }
        if caps.can_bin { result.push(p.binning.clone().into()); }
        result.push(p.frame_type.clone().into());
        result.push(p.info.clone().into());
        result.push(p.temperature.clone().into());
        result.push(p.adc_depth.clone().into());
        result.push(p.sdk.clone().into());
        if caps.has_streaming { result.push(p.stream.clone().into()); }

        if caps.has_cooler {
            result.push(p.cooler.clone().into());
            result.push(p.cooler_power.clone().into());
        }

        if let Some(controls) = &self.controls {
            if !controls.numbers().items.is_empty() { result.push(controls.numbers().clone().into()); }
            if !controls.modes().items.is_empty() { result.push(controls.modes().clone().into()); }
        }

        if let Some(formats) = &self.video_formats {
            result.push(formats.property().clone().into());
        }

        if caps.has_bayer {
            result.push(p.cfa.clone().into());
        }

        if caps.has_st4_port {
            result.push(p.guide_ns.clone().into());
            result.push(p.guide_we.clone().into());
        }

        result
    }

    pub fn new_number(&mut self, name: &str, values: &[(&str, f64)]) -> Result<(), PropertyError> {
        if !self.connected { return Err(PropertyError::NotConnected); }

        match name {
            names::CCD_EXPOSURE => self.on_new_exposure(values),
            names::CCD_FRAME => self.on_new_frame(values),
            names::CCD_BINNING => self.on_new_binning(values),
            names::CCD_TEMPERATURE => self.on_new_temperature(values),
            controls::CONTROLS_PROPERTY => self.on_new_control_values(values),
            names::TELESCOPE_TIMED_GUIDE_NS | names::TELESCOPE_TIMED_GUIDE_WE => self.on_new_guide_pulse(name, values),
            names::CCD_INFO | names::CCD_COOLER_POWER | names::ADC_DEPTH => Err(PropertyError::ReadOnly(name.to_string())),
            _ => Err(PropertyError::UnknownProperty(name.to_string()))
        }
    }

    fn on_new_exposure(&mut self, values: &[(&str, f64)]) -> Result<(), PropertyError> {
        if let Err(e) = self.properties.exposure.validate(values) {
            self.properties.exposure.set_state(PropertyState::Alert);
            self.publish(self.properties.exposure.clone());
            return Err(e);
        }
        let duration = find_value(values, names::CCD_EXPOSURE_VALUE)
            .ok_or_else(|| PropertyError::UnknownItem(names::CCD_EXPOSURE_VALUE.to_string()))?;

        if self.shared.in_exposure() {
            self.abort_exposure()?;
        }

        let result = self.start_exposure(duration);
        match &result {
            Ok(()) => {
                self.properties.exposure.set_value(names::CCD_EXPOSURE_VALUE, duration);
                self.properties.exposure.set_state(PropertyState::Busy);
            },
            Err(_) => self.properties.exposure.set_state(PropertyState::Alert)
        }
        self.publish(self.properties.exposure.clone());

        result.map_err(PropertyError::from)
    }

    fn on_new_frame(&mut self, values: &[(&str, f64)]) -> Result<(), PropertyError> {
        if let Err(e) = self.properties.frame.validate(values) {
            self.properties.frame.set_state(PropertyState::Alert);
            self.publish(self.properties.frame.clone());
            return Err(e);
        }

        let frame = &self.properties.frame;
        let get = |item: &str| find_value(values, item).or_else(|| frame.value(item)).unwrap_or(0.0) as u32;
        let (x, y, w, h) = (get(names::X), get(names::Y), get(names::WIDTH), get(names::HEIGHT));

        let result = self.update_ccd_frame(x, y, w, h);
        self.properties.frame.set_state(if result.is_ok() { PropertyState::Ok } else { PropertyState::Alert });
        self.publish(self.properties.frame.clone());

        result.map_err(PropertyError::from)
    }

    fn on_new_binning(&mut self, values: &[(&str, f64)]) -> Result<(), PropertyError> {
        if let Err(e) = self.properties.binning.validate(values) {
            self.properties.binning.set_state(PropertyState::Alert);
            self.publish(self.properties.binning.clone());
            return Err(e);
        }

        // only square binning is supported
        let bin = find_value(values, names::HOR_BIN).or_else(|| find_value(values, names::VER_BIN)).unwrap_or(1.0);

        let result = self.update_ccd_bin(bin as u32);
        self.properties.binning.set_state(if result.is_ok() { PropertyState::Ok } else { PropertyState::Alert });
        self.publish(self.properties.binning.clone());
        self.publish(self.properties.frame.clone());

        result.map_err(PropertyError::from)
    }

    fn on_new_temperature(&mut self, values: &[(&str, f64)]) -> Result<(), PropertyError> {
        if self.properties.temperature.header.permission == Permission::ReadOnly {
            return Err(PropertyError::ReadOnly(names::CCD_TEMPERATURE.to_string()));
        }
        if let Err(e) = self.properties.temperature.validate(values) {
            self.properties.temperature.set_state(PropertyState::Alert);
            self.publish(self.properties.temperature.clone());
            return Err(e);
        }
        let temperature = find_value(values, names::CCD_TEMPERATURE_VALUE)
            .ok_or_else(|| PropertyError::UnknownItem(names::CCD_TEMPERATURE_VALUE.to_string()))?;

        let state = self.set_temperature(temperature);
        self.properties.temperature.set_state(state);
        self.publish(self.properties.temperature.clone());

        if state == PropertyState::Alert {
            Err(PropertyError::Rejected("failed to set temperature".to_string()))
        } else {
            Ok(())
        }
    }

    fn on_new_control_values(&mut self, values: &[(&str, f64)]) -> Result<(), PropertyError> {
        let sdk = Arc::clone(&self.sdk);
        let camera = self.info.id;

        let (result, numbers, modes) = match self.controls.as_mut() {
            Some(controls) => {
                let result = controls.update_numbers(&*sdk, camera, values);
                (result, controls.numbers().clone(), controls.modes().clone())
            },
            None => return Err(PropertyError::NotConnected)
        };

        self.publish(numbers);
        if let Ok(true) = result {
            self.publish(modes);
        }

        result.map(|_| ())
    }

    fn on_new_guide_pulse(&mut self, name: &str, values: &[(&str, f64)]) -> Result<(), PropertyError> {
        let (axis, first, second) = if name == names::TELESCOPE_TIMED_GUIDE_NS {
            (Axis::NS, names::TIMED_GUIDE_N, names::TIMED_GUIDE_S)
        } else {
            (Axis::WE, names::TIMED_GUIDE_W, names::TIMED_GUIDE_E)
        };

        let property = match axis { Axis::NS => &self.properties.guide_ns, Axis::WE => &self.properties.guide_we };
        property.validate(values)?;

        let first_ms = find_value(values, first).unwrap_or(0.0);
        let second_ms = find_value(values, second).unwrap_or(0.0);

        let state = match axis {
            Axis::NS if first_ms > 0.0 => self.guide_north(first_ms),
            Axis::NS if second_ms > 0.0 => self.guide_south(second_ms),
            Axis::WE if first_ms > 0.0 => self.guide_west(first_ms),
            Axis::WE if second_ms > 0.0 => self.guide_east(second_ms),
            _ => PropertyState::Idle
        };

        let property = match axis { Axis::NS => &mut self.properties.guide_ns, Axis::WE => &mut self.properties.guide_we };
        property.update(&[(first, 0.0), (second, 0.0)]);
        property.set_state(state);
        let property = property.clone();
        self.publish(property);

        if state == PropertyState::Alert {
            Err(PropertyError::Rejected("failed to start guide pulse".to_string()))
        } else {
            Ok(())
        }
    }

    pub fn new_switch(&mut self, name: &str, states: &[(&str, bool)]) -> Result<(), PropertyError> {
        if name == names::CONNECTION {
            return self.on_new_connection(states);
        }

        if !self.connected { return Err(PropertyError::NotConnected); }

        match name {
            names::CCD_ABORT_EXPOSURE => {
                let result = self.abort_exposure();
                self.properties.abort.reset();
                self.properties.abort.set_state(if result.is_ok() { PropertyState::Ok } else { PropertyState::Alert });
                self.publish(self.properties.abort.clone());
                if result.is_ok() {
                    self.properties.exposure.set_value(names::CCD_EXPOSURE_VALUE, 0.0);
                    self.properties.exposure.set_state(PropertyState::Idle);
                    self.publish(self.properties.exposure.clone());
                }
                result.map_err(PropertyError::from)
            },

            names::CCD_FRAME_TYPE => {
                let mut frame_type_sv = self.properties.frame_type.clone();
                frame_type_sv.update(states)?;
                let frame_type = frame_type_sv.find_on()
                    .and_then(|item| item.name.parse::<FrameType>().ok())
                    .unwrap_or(FrameType::Light);
                self.set_frame_type(frame_type);
                self.properties.frame_type.set_state(PropertyState::Ok);
                self.publish(self.properties.frame_type.clone());
                Ok(())
            },

            names::CCD_COOLER => {
                let mut cooler_sv = self.properties.cooler.clone();
                if let Err(e) = cooler_sv.update(states) {
                    self.properties.cooler.set_state(PropertyState::Alert);
                    self.publish(self.properties.cooler.clone());
                    return Err(e);
                }
                if self.activate_cooler(cooler_sv.is_on(names::COOLER_ON)) {
                    Ok(())
                } else {
                    Err(PropertyError::Rejected("failed to switch cooler".to_string()))
                }
            },

            controls::CONTROLS_MODE_PROPERTY => self.on_new_control_modes(states),

            video::VIDEO_FORMAT_PROPERTY => self.on_new_video_format(states),

            names::CCD_VIDEO_STREAM => self.on_new_stream_state(states),

            _ => Err(PropertyError::UnknownProperty(name.to_string()))
        }
    }

    fn on_new_connection(&mut self, states: &[(&str, bool)]) -> Result<(), PropertyError> {
        let mut connection_sv = self.properties.connection.clone();
        connection_sv.update(states)?;

        let result = if connection_sv.is_on(names::CONNECT) { self.connect() } else { self.disconnect() };
        if let Err(e) = result {
            self.properties.connection.set_state(PropertyState::Alert);
            self.publish(self.properties.connection.clone());
            return Err(e.into());
        }

        Ok(())
    }

    fn on_new_control_modes(&mut self, states: &[(&str, bool)]) -> Result<(), PropertyError> {
        let sdk = Arc::clone(&self.sdk);
        let camera = self.info.id;

        let (result, numbers, modes) = match self.controls.as_mut() {
            Some(controls) => {
                let result = controls.update_modes(&*sdk, camera, states);
                (result, controls.numbers().clone(), controls.modes().clone())
            },
            None => return Err(PropertyError::NotConnected)
        };

        if result.is_err() { self.publish(numbers); }
        self.publish(modes);

        result
    }

    fn on_new_video_format(&mut self, states: &[(&str, bool)]) -> Result<(), PropertyError> {
        let formats = match &mut self.video_formats {
            Some(formats) => formats,
            None => return Err(PropertyError::NotConnected)
        };

        if self.shared.streamer().is_busy() {
            log::error!("{}: cannot change format while streaming/recording", self.name);
            formats.set_state(PropertyState::Alert);
            let property = formats.property().clone();
            self.publish(property);
            return Err(PropertyError::Rejected("streaming in progress".to_string()));
        }

        let target = states.iter().find(|(_, on)| *on).map(|(name, _)| *name).unwrap_or("");
        let img_type = match formats.find(target) {
            Some(img_type) => img_type,
            None => {
                log::error!("{}: unable to locate format {}", self.name, target);
                formats.set_state(PropertyState::Alert);
                let property = formats.property().clone();
                self.publish(property);
                return Err(PropertyError::UnknownItem(target.to_string()));
            }
        };

        let result = self.set_video_format(img_type);
        if let Some(formats) = &mut self.video_formats {
            if result.is_err() { formats.set_state(PropertyState::Alert); }
            let property = formats.property().clone();
            self.publish(property);
        }
        self.publish(self.properties.frame.clone());

        result.map_err(PropertyError::from)
    }

    fn on_new_stream_state(&mut self, states: &[(&str, bool)]) -> Result<(), PropertyError> {
        let mut stream_sv = self.properties.stream.clone();
        stream_sv.update(states)?;
        let enable = stream_sv.is_on(names::STREAM_ON);

        let result = if enable {
            self.shared.streamer().set_stream(true);
            self.start_streaming()
        } else {
            let result = self.stop_streaming();
            self.shared.streamer().set_stream(false);
            result
        };

        match &result {
            Ok(()) => {
                stream_sv.set_state(if enable { PropertyState::Busy } else { PropertyState::Idle });
                self.properties.stream = stream_sv;
            },
            Err(_) => {
                if enable { self.shared.streamer().set_stream(false); }
                self.properties.stream.set_state(PropertyState::Alert);
            }
        }
        self.publish(self.properties.stream.clone());

        result.map_err(PropertyError::from)
    }

    /// All text properties of the device are read-only.
    pub fn new_text(&mut self, name: &str, _texts: &[(&str, &str)]) -> Result<(), PropertyError> {
        match name {
            names::SDK | names::CCD_CFA => Err(PropertyError::ReadOnly(name.to_string())),
            _ => Err(PropertyError::UnknownProperty(name.to_string()))
        }
    }

    /// Updates properties according to an event sent by this device; may add header values to a delivered frame.
    pub fn on_event(&mut self, event: &mut DeviceEvent) {
        match event {
            DeviceEvent::ExposureLeft{ seconds, .. } => {
                if self.properties.exposure.state() == PropertyState::Busy {
                    self.properties.exposure.set_value(names::CCD_EXPOSURE_VALUE, *seconds);
                    self.publish(self.properties.exposure.clone());
                }
            },

            DeviceEvent::ExposureComplete{ frame, .. } => {
                if let Some(gain) = self.controls.as_ref().and_then(|c| c.value(ControlType::Gain)) {
                    frame.keywords.push(("Gain".to_string(), gain));
                }
                self.properties.exposure.set_value(names::CCD_EXPOSURE_VALUE, 0.0);
                self.properties.exposure.set_state(PropertyState::Ok);
                self.publish(self.properties.exposure.clone());
            },

            DeviceEvent::ExposureFailed{ .. } => {
                self.properties.exposure.set_state(PropertyState::Alert);
                self.publish(self.properties.exposure.clone());
            },

            DeviceEvent::ExposureRestarted{ attempt, .. } => {
                log::info!("{}: exposure failed, restarted (attempt {})", self.name, *attempt + 1);
            },

            DeviceEvent::StreamStopped{ .. } => {
                if self.connected {
                    if let Err(e) = self.stop_streaming() {
                        log::warn!("{}: {}", self.name, e);
                    }
                }
                for item in &mut self.properties.stream.items {
                    item.on = item.name == names::STREAM_OFF;
                }
                self.properties.stream.set_state(PropertyState::Alert);
                self.publish(self.properties.stream.clone());
            },

            DeviceEvent::GuideComplete{ axis, .. } => {
                if !self.guide_axis(*axis).is_pending() {
                    let property = match axis {
                        Axis::NS => &mut self.properties.guide_ns,
                        Axis::WE => &mut self.properties.guide_we
                    };
                    property.set_state(PropertyState::Idle);
                    let property = property.clone();
                    self.publish(property);
                }
            },

            DeviceEvent::PropertyUpdated(_) => ()
        }
    }

    /// Returns the settings to be persisted for this device.
    pub fn save_config_items(&self) -> DeviceConfig {
        if !self.connected {
            return self.saved_config.clone().unwrap_or_default();
        }

        let mut config = DeviceConfig::default();
        if self.info.has_cooler {
            config.cooler_on = Some(self.properties.cooler.is_on(names::COOLER_ON));
        }
        if let Some(controls) = &self.controls {
            config.controls = controls.numbers().items.iter().map(|i| (i.name.clone(), i.value)).collect();
            config.auto_controls = controls.modes().items.iter().map(|i| (i.name.clone(), i.on)).collect();
        }
        config.video_format = self.video_formats.as_ref()
            .and_then(|f| f.current())
            .map(|f| f.switch_name().to_string());

        config
    }

    fn apply_saved_config(&mut self) {
        let config = match &self.saved_config {
            Some(config) => config.clone(),
            None => return
        };
        log::debug!("{}: applying saved settings", self.name);

        let saved_format = config.video_format.as_deref()
            .and_then(|name| self.video_formats.as_ref().and_then(|f| f.find(name)));
        if let Some(img_type) = saved_format {
            if img_type != self.img_type {
                if let Err(e) = self.set_video_format(img_type) {
                    log::warn!("{}: failed to restore video format: {}", self.name, e);
                }
            }
        }

        let sdk = Arc::clone(&self.sdk);
        let camera = self.info.id;
        if let Some(controls) = self.controls.as_mut() {
            let values: Vec<(&str, f64)> = config.controls.iter()
                .filter(|(name, _)| controls.numbers().item(name).is_some())
                .map(|(name, value)| (name.as_str(), *value))
                .collect();
            if let Err(e) = controls.update_numbers(&*sdk, camera, &values) {
                log::warn!("{}: failed to restore control values: {}", self.name, e);
            }

            let states: Vec<(&str, bool)> = config.auto_controls.iter()
                .filter(|(name, _)| controls.modes().item(name).is_some())
                .map(|(name, on)| (name.as_str(), *on))
                .collect();
            if !states.is_empty() {
                if let Err(e) = controls.update_modes(&*sdk, camera, &states) {
                    log::warn!("{}: failed to restore auto controls: {}", self.name, e);
                }
            }
        }

        if self.info.has_cooler && config.cooler_on == Some(true) {
            self.activate_cooler(true);
        }
    }
}

impl Drop for AsiCcd {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            log::error!("{}: failed to disconnect: {}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::drivers::simulator::SimSdk;
    use crate::camera::{CameraId, ExposureStatus};
    use crate::workers::imaging::tests::CountingStreamer;
    use crossbeam::channel::Receiver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    const CAMERA: CameraId = CameraId(0);

    struct Fixture {
        sdk: Arc<SimSdk>,
        event_loop: Rc<EventLoop>,
        events: Receiver<DeviceEvent>,
        ccd: Rc<RefCell<AsiCcd>>,
        stream_stops: Arc<AtomicUsize>
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture::with_camera(|_| ())
        }

        /// Creates a device for the simulated camera with its description altered by `modify`.
        fn with_camera<F: FnOnce(&mut CameraInfo)>(modify: F) -> Fixture {
            let sdk = Arc::new(SimSdk::new(1));
            let mut info = sdk.enumerate_cameras().unwrap().remove(0);
            modify(&mut info);
            let event_loop = Rc::new(EventLoop::new());
            let (sender, events) = crossbeam::channel::unbounded();
            let (streamer, _, stream_stops) = CountingStreamer::new();
            let ccd = AsiCcd::new(
                "test", info, Arc::clone(&sdk) as Arc<dyn CameraSdk>, Rc::clone(&event_loop), sender, Box::new(streamer)
            );

            Fixture{ sdk, event_loop, events, ccd, stream_stops }
        }

        fn connected() -> Fixture {
            let fx = Fixture::new();
            fx.ccd.borrow_mut().connect().unwrap();
            fx
        }

        /// Runs timers and delivers events to the device until `predicate` matches an event.
        fn wait_for<F: Fn(&DeviceEvent) -> bool>(&self, predicate: F) -> Vec<DeviceEvent> {
            let mut received = vec![];
            let deadline = Instant::now() + Duration::from_secs(10);
            loop {
                assert!(Instant::now() < deadline, "expected event not received");
                self.event_loop.fire_due();
                if let Ok(mut event) = self.events.recv_timeout(Duration::from_millis(5)) {
                    self.ccd.borrow_mut().on_event(&mut event);
                    let found = predicate(&event);
                    received.push(event);
                    if found { return received; }
                }
            }
        }

        fn drain(&self) {
            while let Ok(mut event) = self.events.try_recv() {
                self.ccd.borrow_mut().on_event(&mut event);
            }
        }
    }

    #[test]
    fn connect_and_disconnect_without_acquisition_issue_no_stop_calls() {
        let fx = Fixture::connected();
        assert_eq!(ImageState::Idle, fx.ccd.borrow().image_state());
        assert!(fx.ccd.borrow().get_properties().len() > 1);

        let before = fx.sdk.calls(CAMERA);
        fx.ccd.borrow_mut().disconnect().unwrap();
        let after = fx.sdk.calls(CAMERA);

        assert_eq!(ImageState::Terminated, fx.ccd.borrow().image_state());
        assert_eq!(before.stop_exposure, after.stop_exposure);
        assert_eq!(before.stop_video, after.stop_video);
        assert_eq!(1, after.close);
        assert_eq!(0, fx.event_loop.num_pending());
        assert_eq!(1, fx.ccd.borrow().get_properties().len());
    }

    #[test]
    fn exposure_is_delivered_with_gain() {
        let fx = Fixture::connected();
        fx.ccd.borrow_mut().new_number(names::CCD_EXPOSURE, &[(names::CCD_EXPOSURE_VALUE, 0.05)]).unwrap();
        assert_eq!(PropertyState::Busy, fx.ccd.borrow().properties().exposure.state());

        let events = fx.wait_for(|e| matches!(e, DeviceEvent::ExposureComplete{ .. }));
        match events.last() {
            Some(DeviceEvent::ExposureComplete{ frame, .. }) => {
                assert_eq!((640, 480), (frame.width, frame.height));
                assert_eq!(640 * 480, frame.data.len());
                assert_eq!(Some(100.0), frame.keyword("Gain"));
            },
            _ => panic!("unexpected last event")
        }
        fx.drain();
        assert_eq!(PropertyState::Ok, fx.ccd.borrow().properties().exposure.state());
        assert_eq!(1, fx.sdk.calls(CAMERA).data_after_exposure);
    }

    #[test]
    fn abort_stops_exposure_once() {
        let fx = Fixture::connected();
        fx.ccd.borrow_mut().start_exposure(5.0).unwrap();
        while fx.ccd.borrow().image_state() != ImageState::Exposure {
            std::thread::sleep(Duration::from_millis(1));
        }

        fx.ccd.borrow_mut().new_switch(names::CCD_ABORT_EXPOSURE, &[(names::ABORT, true)]).unwrap();
        assert_ne!(ImageState::Exposure, fx.ccd.borrow().image_state());
        assert!(!fx.ccd.borrow().in_exposure());
        assert_eq!(1, fx.sdk.calls(CAMERA).stop_exposure);

        fx.ccd.borrow_mut().disconnect().unwrap();
        let calls = fx.sdk.calls(CAMERA);
        assert_eq!(1, calls.stop_exposure);
        assert_eq!(0, calls.data_after_exposure);
    }

    #[test]
    fn disconnect_during_exposure_stops_it() {
        let fx = Fixture::connected();
        fx.ccd.borrow_mut().start_exposure(5.0).unwrap();
        while fx.ccd.borrow().image_state() != ImageState::Exposure {
            std::thread::sleep(Duration::from_millis(1));
        }

        fx.ccd.borrow_mut().disconnect().unwrap();
        assert_eq!(1, fx.sdk.calls(CAMERA).stop_exposure);
        assert_eq!(ImageState::Terminated, fx.ccd.borrow().image_state());
    }

    #[test]
    fn disconnect_right_after_exposure_start_stops_it() {
        let fx = Fixture::new();
        for _ in 0..20 {
            fx.ccd.borrow_mut().connect().unwrap();
            let before = fx.sdk.calls(CAMERA).stop_exposure;

            fx.ccd.borrow_mut().start_exposure(5.0).unwrap();
            fx.ccd.borrow_mut().disconnect().unwrap();

            assert_eq!(before + 1, fx.sdk.calls(CAMERA).stop_exposure);
            assert!(!fx.ccd.borrow().in_exposure());
        }
    }

    #[test]
    fn disconnect_right_after_stream_start_releases_streamer() {
        let fx = Fixture::new();
        for i in 0..20 {
            fx.ccd.borrow_mut().connect().unwrap();
            let before = fx.sdk.calls(CAMERA).stop_video;

            fx.ccd.borrow_mut().new_switch(names::CCD_VIDEO_STREAM, &[(names::STREAM_ON, true)]).unwrap();
            fx.ccd.borrow_mut().disconnect().unwrap();

            assert_eq!(before + 1, fx.sdk.calls(CAMERA).stop_video);
            assert_eq!(i + 1, fx.stream_stops.load(Ordering::SeqCst));
            assert!(!fx.ccd.borrow().shared.streamer().is_busy());

            fx.ccd.borrow_mut().connect().unwrap();
            fx.ccd.borrow_mut().new_switch(video::VIDEO_FORMAT_PROPERTY, &[("ASI_IMG_RAW16", true)]).unwrap();
            fx.ccd.borrow_mut().new_switch(video::VIDEO_FORMAT_PROPERTY, &[("ASI_IMG_RAW8", true)]).unwrap();
            fx.ccd.borrow_mut().disconnect().unwrap();
            fx.drain();
        }
    }

    #[test]
    fn disconnect_resets_acquisition_properties() {
        let fx = Fixture::connected();
        fx.ccd.borrow_mut().new_number(names::CCD_EXPOSURE, &[(names::CCD_EXPOSURE_VALUE, 5.0)]).unwrap();
        assert_eq!(PropertyState::Busy, fx.ccd.borrow().properties().exposure.state());
        fx.ccd.borrow_mut().disconnect().unwrap();
        fx.drain();
        {
            let ccd = fx.ccd.borrow();
            assert_eq!(PropertyState::Idle, ccd.properties().exposure.state());
            assert_eq!(Some(0.0), ccd.properties().exposure.value(names::CCD_EXPOSURE_VALUE));
        }

        fx.ccd.borrow_mut().connect().unwrap();
        fx.ccd.borrow_mut().new_switch(names::CCD_VIDEO_STREAM, &[(names::STREAM_ON, true)]).unwrap();
        assert_eq!(PropertyState::Busy, fx.ccd.borrow().properties().stream.state());
        fx.ccd.borrow_mut().disconnect().unwrap();
        fx.drain();

        let ccd = fx.ccd.borrow();
        assert_eq!(PropertyState::Idle, ccd.properties().stream.state());
        assert!(ccd.properties().stream.is_on(names::STREAM_OFF));
    }

    #[test]
    fn properties_follow_camera_capabilities() {
        let fx = Fixture::with_camera(|info| {
            info.has_cooler = false;
            info.has_st4_port = false;
            info.is_color = false;
            info.supported_bins = vec![1];
        });
        fx.ccd.borrow_mut().connect().unwrap();

        let caps = fx.ccd.borrow().capabilities();
        assert_eq!((false, false, false, false), (caps.can_bin, caps.has_cooler, caps.has_st4_port, caps.has_bayer));

        let published: Vec<String> = fx.ccd.borrow().get_properties().iter().map(|p| p.name().to_string()).collect();
        for absent in [
            names::CCD_BINNING, names::CCD_COOLER, names::CCD_COOLER_POWER, names::CCD_CFA,
            names::TELESCOPE_TIMED_GUIDE_NS, names::TELESCOPE_TIMED_GUIDE_WE
        ].iter() {
            assert!(!published.iter().any(|n| n == absent), "unexpected property {}", absent);
        }
        for present in [names::CCD_EXPOSURE, names::CCD_ABORT_EXPOSURE, names::CCD_FRAME, names::CCD_VIDEO_STREAM].iter() {
            assert!(published.iter().any(|n| n == present), "missing property {}", present);
        }

        let full = Fixture::connected();
        assert_eq!(Capabilities{
            can_abort: true,
            can_bin: true,
            can_subframe: true,
            has_cooler: true,
            has_st4_port: true,
            has_bayer: true,
            has_streaming: true
        }, full.ccd.borrow().capabilities());
        assert_eq!(published.len() + 6, full.ccd.borrow().get_properties().len());
    }

    #[test]
    fn failed_exposure_start_is_reported() {
        let fx = Fixture::connected();
        fx.sdk.fail_exposure_starts(CAMERA, 3);

        let result = fx.ccd.borrow_mut().new_number(names::CCD_EXPOSURE, &[(names::CCD_EXPOSURE_VALUE, 0.1)]);
        assert!(result.is_err());
        assert_eq!(3, fx.sdk.calls(CAMERA).start_exposure);
        assert_eq!(PropertyState::Alert, fx.ccd.borrow().properties().exposure.state());
        assert_eq!(ImageState::Idle, fx.ccd.borrow().image_state());
    }

    #[test]
    fn repeated_camera_failures_end_in_alert() {
        let fx = Fixture::connected();
        fx.sdk.script_exposure_statuses(CAMERA, vec![
            Ok(ExposureStatus::Failed), Ok(ExposureStatus::Failed), Ok(ExposureStatus::Failed)
        ]);
        fx.ccd.borrow_mut().start_exposure(0.05).unwrap();
        fx.ccd.borrow_mut().properties.exposure.set_state(PropertyState::Busy);

        fx.wait_for(|e| matches!(e, DeviceEvent::ExposureFailed{ .. }));
        assert_eq!(PropertyState::Alert, fx.ccd.borrow().properties().exposure.state());
        assert_eq!(3, fx.sdk.calls(CAMERA).start_exposure);
    }

    #[test]
    fn stream_read_failure_stops_streaming() {
        let fx = Fixture::connected();
        fx.sdk.script_video_results(CAMERA, vec![Ok(()), Err(SdkError::GeneralError)]);

        fx.ccd.borrow_mut().new_switch(names::CCD_VIDEO_STREAM, &[(names::STREAM_ON, true)]).unwrap();
        fx.wait_for(|e| matches!(e, DeviceEvent::StreamStopped{ .. }));

        assert_eq!(1, fx.stream_stops.load(Ordering::SeqCst));
        assert_eq!(2, fx.sdk.calls(CAMERA).video_data);
        assert_ne!(ImageState::Stream, fx.ccd.borrow().image_state());
        assert!(fx.ccd.borrow().properties().stream.is_on(names::STREAM_OFF));
    }

    #[test]
    fn streaming_stops_on_request() {
        let fx = Fixture::connected();
        let stop_video_before = fx.sdk.calls(CAMERA).stop_video;

        fx.ccd.borrow_mut().new_switch(names::CCD_VIDEO_STREAM, &[(names::STREAM_ON, true)]).unwrap();
        while fx.ccd.borrow().image_state() != ImageState::Stream {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(fx.ccd.borrow_mut().new_switch(video::VIDEO_FORMAT_PROPERTY, &[("ASI_IMG_RAW16", true)]).is_err());

        fx.ccd.borrow_mut().new_switch(names::CCD_VIDEO_STREAM, &[(names::STREAM_OFF, true)]).unwrap();
        assert_ne!(ImageState::Stream, fx.ccd.borrow().image_state());
        assert_eq!(stop_video_before + 1, fx.sdk.calls(CAMERA).stop_video);
        assert_eq!(1, fx.stream_stops.load(Ordering::SeqCst));

        let num_reads = fx.sdk.calls(CAMERA).video_data;
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(num_reads, fx.sdk.calls(CAMERA).video_data);
    }

    #[test]
    fn new_guide_pulse_cancels_pending_one() {
        let fx = Fixture::connected();
        let pulse = |name: &str, ms: f64| {
            fx.ccd.borrow_mut().new_number(names::TELESCOPE_TIMED_GUIDE_WE, &[(name, ms)]).unwrap()
        };

        pulse(names::TIMED_GUIDE_W, 500.0);
        assert_eq!(PropertyState::Busy, fx.ccd.borrow().properties().guide_we.state());
        pulse(names::TIMED_GUIDE_E, 20.0);

        let events = fx.wait_for(|e| matches!(e, DeviceEvent::GuideComplete{ .. }) && fx.sdk.calls(CAMERA).pulse_off.len() == 2);
        assert_eq!(2, events.iter().filter(|e| matches!(e, DeviceEvent::GuideComplete{ axis: Axis::WE, .. })).count());

        let calls = fx.sdk.calls(CAMERA);
        assert_eq!(vec![GuideDirection::West, GuideDirection::East], calls.pulse_on);
        assert_eq!(vec![GuideDirection::West, GuideDirection::East], calls.pulse_off);
        assert_eq!(PropertyState::Idle, fx.ccd.borrow().properties().guide_we.state());
    }

    #[test]
    fn short_guide_pulse_completes_immediately() {
        let fx = Fixture::connected();
        assert_eq!(PropertyState::Ok, fx.ccd.borrow_mut().guide_north(0.5));
        assert_eq!(vec![GuideDirection::North], fx.sdk.calls(CAMERA).pulse_off);
    }

    #[test]
    fn cooling_reaches_requested_temperature() {
        let fx = Fixture::connected();

        assert_eq!(PropertyState::Ok, fx.ccd.borrow_mut().set_temperature(20.1));

        fx.ccd.borrow_mut().new_number(names::CCD_TEMPERATURE, &[(names::CCD_TEMPERATURE_VALUE, 15.2)]).unwrap();
        assert_eq!(PropertyState::Busy, fx.ccd.borrow().properties().temperature.state());
        assert!(fx.ccd.borrow().properties().cooler.is_on(names::COOLER_ON));
        assert!(fx.sdk.calls(CAMERA).set_control.contains(&(ControlType::TargetTemp, 15, true)));

        for _ in 0..20 { fx.ccd.borrow_mut().timer_hit(); }

        let ccd = fx.ccd.borrow();
        assert_eq!(PropertyState::Ok, ccd.properties().temperature.state());
        assert_eq!(Some(15.0), ccd.properties().temperature.value(names::CCD_TEMPERATURE_VALUE));
        assert_eq!(Some(15.0), fx.sdk.temperature(CAMERA));
        assert_eq!(PropertyState::Busy, ccd.properties().cooler_power.state());
        assert_eq!(1, fx.event_loop.num_pending());
    }

    #[test]
    fn frame_and_binning_are_applied() {
        let fx = Fixture::connected();

        fx.ccd.borrow_mut().update_ccd_frame(10, 20, 101, 51).unwrap();
        {
            let ccd = fx.ccd.borrow();
            assert_eq!((96, 50), (ccd.chip().sub_w, ccd.chip().sub_h));
            assert_eq!(96 * 50, ccd.shared.frame_buffer().len());
        }

        fx.ccd.borrow_mut().new_number(names::CCD_BINNING, &[(names::HOR_BIN, 2.0)]).unwrap();
        assert_eq!((48, 24), fx.ccd.borrow().chip().binned_size());
        assert_eq!(RoiFormat{ width: 48, height: 24, bin: 2, img_type: ImgType::Raw8 }, fx.sdk.roi_format(CAMERA).unwrap());

        assert!(fx.ccd.borrow_mut().update_ccd_bin(3).is_err());
        assert_eq!(2, fx.ccd.borrow().chip().bin);
    }

    #[test]
    fn video_format_change_resets_frame() {
        let fx = Fixture::connected();
        fx.ccd.borrow_mut().update_ccd_frame(0, 0, 320, 240).unwrap();

        fx.ccd.borrow_mut().new_switch(video::VIDEO_FORMAT_PROPERTY, &[("ASI_IMG_RAW16", true)]).unwrap();
        let ccd = fx.ccd.borrow();
        assert_eq!(ImgType::Raw16, ccd.video_format());
        assert_eq!(16, ccd.chip().bits_per_pixel);
        assert_eq!(640 * 480 * 2, ccd.shared.frame_buffer().len());
        drop(ccd);

        assert_eq!(
            Err(PropertyError::UnknownItem("ASI_IMG_RAW32".to_string())),
            fx.ccd.borrow_mut().new_switch(video::VIDEO_FORMAT_PROPERTY, &[("ASI_IMG_RAW32", true)])
        );
    }

    #[test]
    fn saved_settings_are_restored_on_connect() {
        let fx = Fixture::connected();
        fx.ccd.borrow_mut().new_number(controls::CONTROLS_PROPERTY, &[("Gain", 200.0)]).unwrap();
        fx.ccd.borrow_mut().new_switch(video::VIDEO_FORMAT_PROPERTY, &[("ASI_IMG_RGB24", true)]).unwrap();
        fx.ccd.borrow_mut().activate_cooler(true);
        fx.ccd.borrow_mut().disconnect().unwrap();

        let saved = fx.ccd.borrow().save_config_items();
        assert_eq!(Some(&200.0), saved.controls.get("Gain"));
        assert_eq!(Some("ASI_IMG_RGB24".to_string()), saved.video_format);
        assert_eq!(Some(true), saved.cooler_on);

        let other = Fixture::new();
        other.ccd.borrow_mut().set_saved_config(Some(saved));
        other.ccd.borrow_mut().connect().unwrap();
        let ccd = other.ccd.borrow();
        assert_eq!(Some(200.0), ccd.controls().and_then(|c| c.value(ControlType::Gain)));
        assert_eq!(ImgType::Rgb24, ccd.video_format());
        assert!(ccd.properties().cooler.is_on(names::COOLER_ON));
    }

    #[test]
    fn requests_require_connection() {
        let fx = Fixture::new();
        assert!(matches!(fx.ccd.borrow_mut().start_exposure(1.0), Err(CcdError::NotConnected)));
        assert_eq!(
            Err(PropertyError::NotConnected),
            fx.ccd.borrow_mut().new_switch(names::CCD_VIDEO_STREAM, &[(names::STREAM_ON, true)])
        );
        assert_eq!(
            Err(PropertyError::ReadOnly(names::SDK.to_string())),
            fx.ccd.borrow_mut().new_text(names::SDK, &[(names::VERSION, "1.0")])
        );
    }
}
