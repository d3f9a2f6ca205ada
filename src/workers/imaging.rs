//
// ccdhost - CCD camera driver host for amateur astronomy
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Imaging thread.
//!
//! The thread is the only caller of the SDK's acquisition calls (exposure status, post-exposure download,
//! video frame read) for its camera. The driver hands work to it through `Mailbox`: it writes `request`
//! and the thread reports what it is doing in `state`. All blocking SDK calls are made with the mailbox unlocked.
//!

use atomic_float::AtomicF64;
use crate::camera::{BayerPattern, CameraId, CameraSdk, ControlType, ExposureStatus, ImgType, SdkError};
use crate::ccd::chip::{Frame, FrameType};
use crate::host::DeviceEvent;
use crate::streaming::Streamer;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Number of failed exposures (reported by the camera) after which the exposure is given up.
pub const MAX_EXP_RETRIES: u32 = 3;
/// Number of failed exposure status queries after which the exposure is given up.
const MAX_STATUS_ERRORS: u32 = 10;
const START_ATTEMPTS: u32 = 3;
const RETRY_PAUSE: Duration = Duration::from_millis(100);
const EXPOSURE_SETTLE: Duration = Duration::from_millis(10);
const SHORT_POLL: Duration = Duration::from_millis(10);
const VIDEO_TIMEOUT_PAUSE: Duration = Duration::from_micros(100);
const FRAMES_PER_YIELD: u32 = 30;
/// Exposures longer than this (in seconds) get progress messages logged at info level.
pub const VERBOSE_EXPOSURE: f64 = 3.0;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageState {
    /// Imaging thread not started yet.
    None,
    Idle,
    Stream,
    Exposure,
    RestartExposure,
    Abort,
    Terminate,
    Terminated
}

#[derive(Debug)]
pub struct Slots {
    /// What the driver wants; written by the driver (and by the thread when a request has been consumed).
    pub request: ImageState,
    /// What the thread is doing; written only by the thread.
    pub state: ImageState
}

/// Single-slot, overwrite-latest handoff between the driver and its imaging thread.
pub struct Mailbox {
    slots: Mutex<Slots>,
    cv: Condvar
}

impl Mailbox {
    pub fn new() -> Mailbox {
        Mailbox{
            slots: Mutex::new(Slots{ request: ImageState::Idle, state: ImageState::None }),
            cv: Condvar::new()
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn notify(&self) {
        self.cv.notify_all();
    }

    pub fn wait_while<'a, F>(&'a self, guard: MutexGuard<'a, Slots>, condition: F) -> MutexGuard<'a, Slots>
    where F: FnMut(&mut Slots) -> bool {
        self.cv.wait_while(guard, condition).unwrap_or_else(|e| e.into_inner())
    }

    /// Prepares the mailbox for a new imaging thread.
    pub fn reset(&self) {
        let mut slots = self.lock();
        slots.request = ImageState::Idle;
        slots.state = ImageState::None;
    }

    pub fn request(&self) -> ImageState { self.lock().request }

    pub fn state(&self) -> ImageState { self.lock().state }

    pub fn set_request(&self, request: ImageState) {
        self.lock().request = request;
        self.notify();
    }

    /// Sets a new request and blocks until the thread's state is none of `busy_states`;
    /// returns the state observed afterwards.
    pub fn set_request_and_wait(&self, request: ImageState, busy_states: &[ImageState]) -> ImageState {
        let mut slots = self.lock();
        slots.request = request;
        self.notify();
        let slots = self.wait_while(slots, |s| busy_states.contains(&s.state));
        slots.state
    }

    /// Blocks until the imaging thread has signalled it is running.
    pub fn wait_until_started(&self) -> ImageState {
        let slots = self.lock();
        self.wait_while(slots, |s| s.state == ImageState::None).state
    }

    /// Requests termination; returns the acquisition in progress at the time of the request.
    ///
    /// An exposure or stream request not yet picked up by the thread counts as in progress
    /// (the camera has already been armed by the requester).
    ///
    pub fn terminate(&self) -> ImageState {
        let mut slots = self.lock();
        let previous = match (slots.state, slots.request) {
            (ImageState::Idle, pending @ ImageState::Exposure)
            | (ImageState::Idle, pending @ ImageState::RestartExposure)
            | (ImageState::Idle, pending @ ImageState::Stream) => pending,
            (state, _) => state
        };
        slots.request = ImageState::Terminate;
        self.notify();
        previous
    }
}

/// Acquisition parameters used for each frame; maintained by the driver.
#[derive(Clone, Debug)]
pub struct FrameSetup {
    /// Binned ROI width.
    pub width: u32,
    /// Binned ROI height.
    pub height: u32,
    pub img_type: ImgType,
    pub bits_per_pixel: u32,
    pub frame_type: FrameType,
    pub is_color: bool,
    pub bayer_pattern: BayerPattern
}

impl FrameSetup {
    pub fn frame_size_bytes(&self) -> usize {
        self.width as usize * self.height as usize
            * self.img_type.num_channels()
            * (self.bits_per_pixel as usize / 8)
    }
}

/// State shared by a driver and its imaging thread.
pub struct Shared {
    pub device: String,
    pub camera: CameraId,
    pub sdk: Arc<dyn CameraSdk>,
    pub mailbox: Mailbox,
    /// Requested exposure duration in seconds.
    exposure_request: AtomicF64,
    in_exposure: AtomicBool,
    exposure_start: Mutex<Instant>,
    setup: Mutex<FrameSetup>,
    /// Video frame destination.
    pub frame_buffer: Mutex<Vec<u8>>,
    pub streamer: Mutex<Box<dyn Streamer>>,
    events: crossbeam::channel::Sender<DeviceEvent>
}

impl Shared {
    pub fn new(
        device: &str,
        camera: CameraId,
        sdk: Arc<dyn CameraSdk>,
        setup: FrameSetup,
        streamer: Box<dyn Streamer>,
        events: crossbeam::channel::Sender<DeviceEvent>
    ) -> Shared {
        Shared{
            device: device.to_string(),
            camera,
            sdk,
            mailbox: Mailbox::new(),
            exposure_request: AtomicF64::new(0.0),
            in_exposure: AtomicBool::new(false),
            exposure_start: Mutex::new(Instant::now()),
            setup: Mutex::new(setup),
            frame_buffer: Mutex::new(vec![]),
            streamer: Mutex::new(streamer),
            events
        }
    }

    pub fn exposure_request(&self) -> f64 {
        self.exposure_request.load(Ordering::SeqCst)
    }

    pub fn set_exposure_request(&self, duration: f64) {
        self.exposure_request.store(duration, Ordering::SeqCst);
    }

    pub fn in_exposure(&self) -> bool {
        self.in_exposure.load(Ordering::SeqCst)
    }

    pub fn set_in_exposure(&self, value: bool) {
        self.in_exposure.store(value, Ordering::SeqCst);
    }

    pub fn setup(&self) -> FrameSetup {
        self.setup.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_setup(&self, setup: FrameSetup) {
        *self.setup.lock().unwrap_or_else(|e| e.into_inner()) = setup;
    }

    pub fn streamer(&self) -> MutexGuard<'_, Box<dyn Streamer>> {
        self.streamer.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn frame_buffer(&self) -> MutexGuard<'_, Vec<u8>> {
        self.frame_buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn send(&self, event: DeviceEvent) {
        if self.events.send(event).is_err() {
            log::debug!("{}: event receiver is gone", self.device);
        }
    }

    /// Seconds left of the current exposure (not less than zero).
    pub fn exposure_time_left(&self) -> f64 {
        let elapsed = self.exposure_start.lock().unwrap_or_else(|e| e.into_inner()).elapsed().as_secs_f64();
        (self.exposure_request() - elapsed).max(0.0)
    }

    /// Programs the exposure time and starts an exposure (trying up to 3 times).
    ///
    /// Used both by the driver and by the imaging thread when restarting a failed exposure.
    ///
    pub fn arm_exposure(&self, duration: f64) -> Result<(), SdkError> {
        self.set_exposure_request(duration);

        // the SDK takes microseconds
        let exposure_us = (duration * 1_000_000.0) as i64;
        log::debug!("{}: setting exposure to {:.3} s", self.device, duration);
        if let Err(e) = self.sdk.set_control_value(self.camera, ControlType::Exposure, exposure_us, false) {
            log::warn!("{}: failed to set exposure time: {}", self.device, e);
        }

        let is_dark = match self.setup().frame_type {
            FrameType::Dark | FrameType::Bias => true,
            FrameType::Light | FrameType::Flat => false
        };

        let mut result = Err(SdkError::GeneralError);
        for attempt in 1..=START_ATTEMPTS {
            result = self.sdk.start_exposure(self.camera, is_dark);
            match &result {
                Ok(()) => break,
                Err(e) => {
                    log::error!("{}: starting exposure failed (attempt {}): {}", self.device, attempt, e);
                    std::thread::sleep(RETRY_PAUSE);
                }
            }
        }

        if let Err(e) = result {
            log::warn!("{}: camera firmware might require an update to the compatible mode", self.device);
            return Err(e);
        }

        *self.exposure_start.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        if duration > VERBOSE_EXPOSURE {
            log::info!("{}: taking a {} s frame...", self.device, duration);
        }
        self.set_in_exposure(true);

        Ok(())
    }
}

pub fn spawn(shared: Arc<Shared>) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("imaging ({})", shared.device))
        .spawn(move || Worker::new(&shared).run())
}

struct Worker<'a> {
    shared: &'a Shared,
    /// Failed exposures so far; carried over exposure restarts.
    exposure_retries: u32,
    /// Set when the thread itself has re-armed the current exposure.
    restarted: bool
}

impl<'a> Worker<'a> {
    fn new(shared: &'a Shared) -> Worker<'a> {
        Worker{ shared, exposure_retries: 0, restarted: false }
    }

    fn run(mut self) {
        let shared = self.shared;
        let mailbox = &shared.mailbox;

        let mut slots = mailbox.lock();
        slots.state = ImageState::Idle;
        mailbox.notify();
        log::debug!("{}: imaging thread started", shared.device);

        loop {
            slots = mailbox.wait_while(slots, |s| s.request == ImageState::Idle);
            slots.state = slots.request;
            mailbox.notify();

            match slots.state {
                ImageState::Exposure => slots = self.get_exposure(slots),
                ImageState::Stream => slots = self.stream_video(slots),
                ImageState::RestartExposure => slots = self.restart_exposure(slots),
                ImageState::Terminate => break,
                _ => slots.request = ImageState::Idle
            }

            slots.state = ImageState::Idle;
            mailbox.notify();
        }

        slots.state = ImageState::Terminated;
        mailbox.notify();
        log::debug!("{}: imaging thread finished", shared.device);
    }

    /// Replaces the request only if it is still `Exposure` (it might have been changed to `Abort` meanwhile).
    fn exposure_set_request(&self, slots: &mut Slots, request: ImageState) {
        if slots.request == ImageState::Exposure {
            slots.request = request;
            self.shared.mailbox.notify();
        }
    }

    fn get_exposure(&mut self, slots: MutexGuard<'a, Slots>) -> MutexGuard<'a, Slots> {
        let shared = self.shared;
        let mailbox = &shared.mailbox;

        if !self.restarted { self.exposure_retries = 0; }
        self.restarted = false;

        let duration = shared.exposure_request();
        let mut status_errors = 0;
        let mut last_reported = f64::INFINITY;

        drop(slots);
        std::thread::sleep(EXPOSURE_SETTLE);
        let mut slots = mailbox.lock();

        while slots.request == ImageState::Exposure {
            drop(slots);

            match shared.sdk.exposure_status(shared.camera) {
                Ok(ExposureStatus::Success) => {
                    shared.set_in_exposure(false);
                    shared.send(DeviceEvent::ExposureLeft{ device: shared.device.clone(), seconds: 0.0 });
                    if duration > VERBOSE_EXPOSURE {
                        log::info!("{}: exposure done, downloading image...", shared.device);
                    }

                    let mut slots = mailbox.lock();
                    self.exposure_set_request(&mut slots, ImageState::Idle);
                    drop(slots);

                    self.grab_image(duration);

                    return mailbox.lock();
                },

                Ok(ExposureStatus::Failed) => {
                    self.exposure_retries += 1;
                    shared.set_in_exposure(false);

                    if self.exposure_retries < MAX_EXP_RETRIES {
                        if mailbox.request() == ImageState::Exposure {
                            log::debug!("{}: exposure failed, restarting...", shared.device);
                        }
                        self.stop_exposure();
                        std::thread::sleep(RETRY_PAUSE);
                        let mut slots = mailbox.lock();
                        self.exposure_set_request(&mut slots, ImageState::RestartExposure);
                        return slots;
                    } else {
                        if mailbox.request() == ImageState::Exposure {
                            log::error!("{}: exposure failed after {} attempts", shared.device, self.exposure_retries);
                        }
                        self.stop_exposure();
                        shared.send(DeviceEvent::ExposureFailed{ device: shared.device.clone() });
                        std::thread::sleep(RETRY_PAUSE);
                        let mut slots = mailbox.lock();
                        self.exposure_set_request(&mut slots, ImageState::Idle);
                        return slots;
                    }
                },

                Ok(_) => (),

                Err(e) => {
                    log::debug!("{}: exposure status error: {}", shared.device, e);
                    status_errors += 1;
                    if status_errors >= MAX_STATUS_ERRORS {
                        if mailbox.request() == ImageState::Exposure {
                            log::error!("{}: exposure status timed out ({})", shared.device, e);
                        }
                        shared.send(DeviceEvent::ExposureFailed{ device: shared.device.clone() });
                        shared.set_in_exposure(false);
                        let mut slots = mailbox.lock();
                        self.exposure_set_request(&mut slots, ImageState::Idle);
                        return slots;
                    }
                }
            }

            // Poll every second until about one second is left, then every 10 ms. While more than
            // a second is left, the polls are aligned so that the reported time left is a whole number of seconds.
            let time_left = shared.exposure_time_left();
            let pause = if time_left > 1.1 {
                let fraction = time_left.fract();
                if fraction >= 0.005 { Duration::from_secs_f64(fraction) } else { Duration::from_secs(1) }
            } else {
                SHORT_POLL
            };

            if time_left >= 0.0049 && time_left <= last_reported {
                shared.send(DeviceEvent::ExposureLeft{ device: shared.device.clone(), seconds: time_left });
                last_reported = time_left;
            }

            std::thread::sleep(pause);

            slots = mailbox.lock();
        }

        slots
    }

    fn stop_exposure(&self) {
        if let Err(e) = self.shared.sdk.stop_exposure(self.shared.camera) {
            log::warn!("{}: failed to stop exposure: {}", self.shared.device, e);
        }
    }

    /// Re-arms the exposure after a failure reported by the camera.
    fn restart_exposure(&mut self, slots: MutexGuard<'a, Slots>) -> MutexGuard<'a, Slots> {
        let shared = self.shared;
        let duration = shared.exposure_request();
        shared.send(DeviceEvent::ExposureRestarted{ device: shared.device.clone(), attempt: self.exposure_retries });
        drop(slots);

        let result = shared.arm_exposure(duration);

        let mut slots = shared.mailbox.lock();
        match result {
            Ok(()) => if slots.request == ImageState::RestartExposure {
                slots.request = ImageState::Exposure;
                self.restarted = true;
            },

            Err(e) => {
                log::error!("{}: failed to restart exposure: {}", shared.device, e);
                shared.send(DeviceEvent::ExposureFailed{ device: shared.device.clone() });
                if slots.request == ImageState::RestartExposure {
                    slots.request = ImageState::Idle;
                }
            }
        }
        shared.mailbox.notify();

        slots
    }

    fn stream_video(&mut self, mut slots: MutexGuard<'a, Slots>) -> MutexGuard<'a, Slots> {
        let shared = self.shared;
        let mut frames = 0;

        while slots.request == ImageState::Stream {
            drop(slots);

            let wait_ms = (shared.exposure_request() * 2000.0 + 500.0) as i32;
            let img_type = shared.setup().img_type;

            let mut buffer = shared.frame_buffer();
            match shared.sdk.video_data(shared.camera, &mut buffer, wait_ms) {
                Ok(()) => {
                    // the SDK delivers BGR
                    if img_type == ImgType::Rgb24 {
                        for pixel in buffer.chunks_exact_mut(3) { pixel.swap(0, 2); }
                    }
                    shared.streamer().new_frame(&buffer);
                    drop(buffer);

                    frames += 1;
                    if frames == FRAMES_PER_YIELD {
                        frames = 0;
                        std::thread::sleep(Duration::from_micros(10));
                    }
                },

                Err(SdkError::Timeout) => {
                    drop(buffer);
                    std::thread::sleep(VIDEO_TIMEOUT_PAUSE);
                },

                Err(e) => {
                    drop(buffer);
                    shared.streamer().set_stream(false);
                    let mut slots = shared.mailbox.lock();
                    if slots.request == ImageState::Stream {
                        log::error!("{}: error reading video data: {}", shared.device, e);
                        slots.request = ImageState::Idle;
                        shared.mailbox.notify();
                        shared.send(DeviceEvent::StreamStopped{ device: shared.device.clone() });
                    }
                    return slots;
                }
            }

            slots = shared.mailbox.lock();
        }

        slots
    }

    /// Downloads the finished exposure and delivers it to the host.
    fn grab_image(&self, duration: f64) {
        let shared = self.shared;
        let setup = shared.setup();

        let mut raw = vec![0u8; setup.frame_size_bytes()];
        if let Err(e) = shared.sdk.data_after_exposure(shared.camera, &mut raw) {
            log::error!(
                "{}: downloading image ({}x{}, {} channel(s)) failed: {}",
                shared.device, setup.width, setup.height, setup.img_type.num_channels(), e
            );
            shared.send(DeviceEvent::ExposureFailed{ device: shared.device.clone() });
            return;
        }

        let (data, naxis) = if setup.img_type == ImgType::Rgb24 {
            (bgr_to_planar_rgb(&raw), 3)
        } else {
            (raw, 2)
        };

        let bayer_pattern = match setup.img_type {
            ImgType::Raw8 | ImgType::Raw16 if setup.is_color => Some(setup.bayer_pattern),
            _ => None
        };

        if duration > VERBOSE_EXPOSURE {
            log::info!("{}: download complete", shared.device);
        }

        shared.send(DeviceEvent::ExposureComplete{
            device: shared.device.clone(),
            frame: Frame{
                width: setup.width,
                height: setup.height,
                naxis,
                bits_per_pixel: setup.bits_per_pixel,
                data,
                bayer_pattern,
                exposure: duration,
                frame_type: setup.frame_type,
                keywords: vec![]
            }
        });
    }
}

/// Converts interleaved BGR pixels into consecutive R, G, B planes.
fn bgr_to_planar_rgb(bgr: &[u8]) -> Vec<u8> {
    let num_pixels = bgr.len() / 3;
    let mut planar = vec![0u8; 3 * num_pixels];
    let (red, rest) = planar.split_at_mut(num_pixels);
    let (green, blue) = rest.split_at_mut(num_pixels);
    for (i, pixel) in bgr.chunks_exact(3).enumerate() {
        blue[i] = pixel[0];
        green[i] = pixel[1];
        red[i] = pixel[2];
    }

    planar
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::camera::drivers::simulator::SimSdk;
    use crate::camera::RoiFormat;
    use crossbeam::channel::Receiver;
    use std::sync::atomic::AtomicUsize;

    const CAMERA: CameraId = CameraId(0);

    /// Streamer counting frames and stop notifications.
    pub struct CountingStreamer {
        pub frames: Arc<AtomicUsize>,
        pub stops: Arc<AtomicUsize>,
        busy: bool
    }

    impl CountingStreamer {
        pub fn new() -> (CountingStreamer, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let frames = Arc::new(AtomicUsize::new(0));
            let stops = Arc::new(AtomicUsize::new(0));
            (CountingStreamer{ frames: Arc::clone(&frames), stops: Arc::clone(&stops), busy: false }, frames, stops)
        }
    }

    impl Streamer for CountingStreamer {
        fn set_pixel_format(&mut self, _: crate::streaming::PixelFormat, _: u32) {}
        fn set_size(&mut self, _: u32, _: u32) {}
        fn new_frame(&mut self, _: &[u8]) { self.frames.fetch_add(1, Ordering::SeqCst); }
        fn is_busy(&self) -> bool { self.busy }
        fn target_fps(&self) -> f64 { 100.0 }
        fn set_stream(&mut self, enabled: bool) {
            if !enabled { self.stops.fetch_add(1, Ordering::SeqCst); }
            self.busy = enabled;
        }
    }

    struct Fixture {
        sdk: Arc<SimSdk>,
        shared: Arc<Shared>,
        events: Receiver<DeviceEvent>,
        thread: Option<std::thread::JoinHandle<()>>,
        stops: Arc<AtomicUsize>
    }

    impl Fixture {
        fn new(img_type: ImgType) -> Fixture {
            let sdk = Arc::new(SimSdk::new(1));
            sdk.open(CAMERA).unwrap();
            let (width, height) = (64, 32);
            sdk.set_roi_format(CAMERA, RoiFormat{ width, height, bin: 1, img_type }).unwrap();

            let setup = FrameSetup{
                width,
                height,
                img_type,
                bits_per_pixel: img_type.bits_per_pixel(),
                frame_type: FrameType::Light,
                is_color: true,
                bayer_pattern: BayerPattern::RG
            };
            let (streamer, _, stops) = CountingStreamer::new();
            let (sender, events) = crossbeam::channel::unbounded();
            let shared = Arc::new(Shared::new(
                "test", CAMERA, Arc::clone(&sdk) as Arc<dyn CameraSdk>, setup.clone(), Box::new(streamer), sender
            ));
            *shared.frame_buffer() = vec![0; setup.frame_size_bytes()];

            let thread = Some(spawn(Arc::clone(&shared)).unwrap());
            assert_eq!(ImageState::Idle, shared.mailbox.wait_until_started());

            Fixture{ sdk, shared, events, thread, stops }
        }

        fn wait_for<F: Fn(&DeviceEvent) -> bool>(&self, predicate: F) -> Vec<DeviceEvent> {
            let mut received = vec![];
            let deadline = Instant::now() + Duration::from_secs(10);
            loop {
                let event = self.events.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                    .expect("expected event not received");
                let found = predicate(&event);
                received.push(event);
                if found { return received; }
            }
        }

        fn wait_for_state(&self, state: ImageState) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.shared.mailbox.state() != state {
                assert!(Instant::now() < deadline, "state {:?} not reached", state);
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        /// Waits until the thread is idle and has consumed the last request.
        fn wait_until_idle(&self) {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                let slots = self.shared.mailbox.lock();
                if slots.state == ImageState::Idle && slots.request == ImageState::Idle { break; }
                drop(slots);
                assert!(Instant::now() < deadline, "imaging thread not idle");
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        fn terminate(&mut self) -> ImageState {
            let previous = self.shared.mailbox.terminate();
            self.thread.take().unwrap().join().unwrap();
            previous
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            if self.thread.is_some() { self.terminate(); }
        }
    }

    fn start_exposure(fx: &Fixture, duration: f64) {
        fx.shared.arm_exposure(duration).unwrap();
        fx.shared.mailbox.set_request(ImageState::Exposure);
    }

    #[test]
    fn thread_starts_idle_and_terminates_cleanly() {
        let mut fx = Fixture::new(ImgType::Raw8);
        assert_eq!(ImageState::Idle, fx.terminate());
        assert_eq!(ImageState::Terminated, fx.shared.mailbox.state());

        let calls = fx.sdk.calls(CAMERA);
        assert_eq!(0, calls.stop_exposure);
        assert_eq!(0, calls.stop_video);
        assert_eq!(0, calls.exposure_status);
    }

    #[test]
    fn immediate_success_downloads_one_frame() {
        let fx = Fixture::new(ImgType::Raw8);
        fx.sdk.script_exposure_statuses(CAMERA, vec![Ok(ExposureStatus::Success)]);
        start_exposure(&fx, 0.5);

        let events = fx.wait_for(|e| matches!(e, DeviceEvent::ExposureComplete{ .. }));
        fx.wait_for_state(ImageState::Idle);

        assert_eq!(1, fx.sdk.calls(CAMERA).data_after_exposure);
        assert_eq!(1, events.iter().filter(|e| matches!(e, DeviceEvent::ExposureComplete{ .. })).count());
        assert_eq!(ImageState::Idle, fx.shared.mailbox.request());
        assert!(!fx.shared.in_exposure());

        match events.last() {
            Some(DeviceEvent::ExposureComplete{ frame, .. }) => {
                assert_eq!((64, 32, 2), (frame.width, frame.height, frame.naxis));
                assert_eq!(64 * 32, frame.data.len());
                assert_eq!(Some(BayerPattern::RG), frame.bayer_pattern);
            },
            _ => panic!("unexpected last event")
        }
    }

    #[test]
    fn three_failures_give_two_restarts_and_one_failure() {
        let fx = Fixture::new(ImgType::Raw8);
        fx.sdk.script_exposure_statuses(CAMERA, vec![
            Ok(ExposureStatus::Failed), Ok(ExposureStatus::Failed), Ok(ExposureStatus::Failed)
        ]);
        start_exposure(&fx, 0.1);

        let events = fx.wait_for(|e| matches!(e, DeviceEvent::ExposureFailed{ .. }));
        fx.wait_for_state(ImageState::Idle);
        std::thread::sleep(Duration::from_millis(50));

        let restarts: Vec<u32> = events.iter().filter_map(|e| match e {
            DeviceEvent::ExposureRestarted{ attempt, .. } => Some(*attempt),
            _ => None
        }).collect();
        assert_eq!(vec![1, 2], restarts);
        assert!(fx.events.try_recv().is_err());

        let calls = fx.sdk.calls(CAMERA);
        assert_eq!(3, calls.start_exposure);
        assert_eq!(3, calls.stop_exposure);
        assert_eq!(0, calls.data_after_exposure);
        assert_eq!(ImageState::Idle, fx.shared.mailbox.request());
    }

    #[test]
    fn status_errors_give_up_after_ten_attempts() {
        let fx = Fixture::new(ImgType::Raw8);
        fx.sdk.script_exposure_statuses(CAMERA, std::iter::repeat(Err(SdkError::Timeout)).take(10));
        start_exposure(&fx, 0.05);

        fx.wait_for(|e| matches!(e, DeviceEvent::ExposureFailed{ .. }));
        fx.wait_for_state(ImageState::Idle);
        assert_eq!(10, fx.sdk.calls(CAMERA).exposure_status);
        assert_eq!(0, fx.sdk.calls(CAMERA).data_after_exposure);
    }

    #[test]
    fn exposure_left_decreases_to_zero_once() {
        let fx = Fixture::new(ImgType::Raw8);
        start_exposure(&fx, 1.3);

        let events = fx.wait_for(|e| matches!(e, DeviceEvent::ExposureComplete{ .. }));
        let left: Vec<f64> = events.iter().filter_map(|e| match e {
            DeviceEvent::ExposureLeft{ seconds, .. } => Some(*seconds),
            _ => None
        }).collect();

        assert!(left.len() >= 2);
        assert!(left[0] <= 1.3 && left[0] > 1.0);
        assert!(left.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(Some(&0.0), left.last());
        assert_eq!(1, left.iter().filter(|s| **s == 0.0).count());
    }

    #[test]
    fn abort_stops_polling() {
        let fx = Fixture::new(ImgType::Raw8);
        start_exposure(&fx, 5.0);
        fx.wait_for_state(ImageState::Exposure);

        let state = fx.shared.mailbox.set_request_and_wait(
            ImageState::Abort, &[ImageState::Exposure, ImageState::RestartExposure]
        );
        assert_ne!(ImageState::Exposure, state);
        fx.wait_until_idle();

        let num_polls = fx.sdk.calls(CAMERA).exposure_status;
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(num_polls, fx.sdk.calls(CAMERA).exposure_status);
        assert_eq!(0, fx.sdk.calls(CAMERA).data_after_exposure);
    }

    #[test]
    fn stream_failure_returns_to_idle_once() {
        let fx = Fixture::new(ImgType::Raw8);
        fx.sdk.script_video_results(CAMERA, vec![Ok(()), Err(SdkError::Timeout), Ok(()), Err(SdkError::GeneralError)]);
        fx.shared.set_exposure_request(0.01);
        fx.shared.mailbox.set_request(ImageState::Stream);

        let events = fx.wait_for(|e| matches!(e, DeviceEvent::StreamStopped{ .. }));
        fx.wait_for_state(ImageState::Idle);
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(1, events.iter().filter(|e| matches!(e, DeviceEvent::StreamStopped{ .. })).count());
        assert_eq!(1, fx.stops.load(Ordering::SeqCst));
        assert_eq!(4, fx.sdk.calls(CAMERA).video_data);
        assert_eq!(ImageState::Idle, fx.shared.mailbox.request());
    }

    #[test]
    fn rgb_stream_frames_are_swapped_to_rgb() {
        let fx = Fixture::new(ImgType::Rgb24);
        fx.sdk.script_video_results(CAMERA, vec![Ok(()), Err(SdkError::GeneralError)]);
        fx.shared.mailbox.set_request(ImageState::Stream);
        fx.wait_for(|e| matches!(e, DeviceEvent::StreamStopped{ .. }));

        // background pixel (3, 10): red = x/2 (with frame shift), blue = 40
        let buffer = fx.shared.frame_buffer();
        let idx = 3 * (10 * 64 + 3);
        assert_eq!(40, buffer[idx + 2]);
    }

    #[test]
    fn failed_restart_ends_exposure() {
        let fx = Fixture::new(ImgType::Raw8);
        fx.sdk.script_exposure_statuses(CAMERA, vec![Ok(ExposureStatus::Failed)]);
        start_exposure(&fx, 0.5);
        fx.sdk.fail_exposure_starts(CAMERA, START_ATTEMPTS as usize);

        let events = fx.wait_for(|e| matches!(e, DeviceEvent::ExposureFailed{ .. }));
        fx.wait_for_state(ImageState::Idle);
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(1, events.iter().filter(|e| matches!(e, DeviceEvent::ExposureRestarted{ attempt: 1, .. })).count());
        assert!(fx.events.try_recv().is_err());
        assert_eq!(ImageState::Idle, fx.shared.mailbox.request());
        assert!(!fx.shared.in_exposure());

        let calls = fx.sdk.calls(CAMERA);
        assert_eq!(1 + START_ATTEMPTS as usize, calls.start_exposure);
        assert_eq!(1, calls.exposure_status);
        assert_eq!(0, calls.data_after_exposure);
    }

    #[test]
    fn abort_during_restart_is_honoured() {
        let fx = Fixture::new(ImgType::Raw8);
        fx.sdk.script_exposure_statuses(CAMERA, vec![Ok(ExposureStatus::Failed)]);
        start_exposure(&fx, 5.0);
        // the restart succeeds only at the last attempt, leaving time to abort
        fx.sdk.fail_exposure_starts(CAMERA, START_ATTEMPTS as usize - 1);

        fx.wait_for(|e| matches!(e, DeviceEvent::ExposureRestarted{ .. }));
        let state = fx.shared.mailbox.set_request_and_wait(
            ImageState::Abort, &[ImageState::Exposure, ImageState::RestartExposure]
        );
        assert_ne!(ImageState::RestartExposure, state);
        assert_ne!(ImageState::Exposure, state);
        fx.wait_until_idle();

        let calls = fx.sdk.calls(CAMERA);
        assert_eq!(1 + START_ATTEMPTS as usize, calls.start_exposure);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.exposure_status, fx.sdk.calls(CAMERA).exposure_status);
        assert_eq!(0, fx.sdk.calls(CAMERA).data_after_exposure);
        assert!(fx.events.try_iter().all(|e| !matches!(e, DeviceEvent::ExposureComplete{ .. })));
    }

    #[test]
    fn request_not_yet_picked_up_counts_as_in_progress() {
        let mailbox = Mailbox::new();
        mailbox.lock().state = ImageState::Idle;

        mailbox.set_request(ImageState::Stream);
        assert_eq!(ImageState::Stream, mailbox.terminate());

        mailbox.reset();
        mailbox.lock().state = ImageState::Idle;
        mailbox.set_request(ImageState::Exposure);
        assert_eq!(ImageState::Exposure, mailbox.terminate());

        mailbox.reset();
        mailbox.lock().state = ImageState::Idle;
        mailbox.set_request(ImageState::Abort);
        assert_eq!(ImageState::Idle, mailbox.terminate());
        assert_eq!(ImageState::Terminate, mailbox.request());
    }

    #[test]
    fn bgr_is_converted_to_planes() {
        assert_eq!(vec![3, 6, 2, 5, 1, 4], bgr_to_planar_rgb(&[1, 2, 3, 4, 5, 6]));
    }
}
