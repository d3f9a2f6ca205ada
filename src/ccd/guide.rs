//
// ccdhost - CCD camera driver host for amateur astronomy
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! ST4 guide pulses.
//!

use crate::camera::{CameraId, CameraSdk, GuideDirection};
use crate::host::property::PropertyState;
use crate::timer::{EventLoop, TimerId};
use std::time::{Duration, Instant};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Axis {
    /// North/south (declination).
    NS,
    /// West/east (right ascension).
    WE
}

/// Pulse guiding state of one axis; at most one pulse is in progress.
pub struct GuideAxis {
    device: String,
    direction: GuideDirection,
    pulse_request: f64,
    pulse_start: Instant,
    timer: Option<TimerId>
}

impl GuideAxis {
    pub fn new(device: &str, axis: Axis) -> GuideAxis {
        GuideAxis{
            device: device.to_string(),
            direction: match axis { Axis::NS => GuideDirection::North, Axis::WE => GuideDirection::West },
            pulse_request: 0.0,
            pulse_start: Instant::now(),
            timer: None
        }
    }

    pub fn is_pending(&self) -> bool { self.timer.is_some() }

    fn pulse_off(&self, sdk: &dyn CameraSdk, camera: CameraId) {
        if let Err(e) = sdk.pulse_guide_off(camera, self.direction) {
            log::error!("{}: failed to stop {} guide pulse: {}", self.device, self.direction, e);
        }
    }

    /// Cancels the pending pulse (if any) and deasserts its signal; returns true if a pulse was cancelled.
    pub fn stop(&mut self, sdk: &dyn CameraSdk, camera: CameraId, event_loop: &EventLoop) -> bool {
        match self.timer.take() {
            Some(id) => {
                self.pulse_off(sdk, camera);
                event_loop.remove_timer(id);
                log::debug!("{}: cancelled {} guide pulse", self.device, self.direction);
                true
            },
            None => false
        }
    }

    /// Starts a guide pulse of `ms` milliseconds.
    ///
    /// Pulses shorter than 1 ms are executed synchronously (result: `Ok`). For longer ones `arm_timer` is called
    /// with the delay after which `on_timer` must be called (result: `Busy`). Any pending pulse has to be stopped
    /// by the caller beforehand.
    ///
    pub fn start<F>(
        &mut self,
        sdk: &dyn CameraSdk,
        camera: CameraId,
        ms: f64,
        direction: GuideDirection,
        arm_timer: F
    ) -> Result<PropertyState, crate::camera::SdkError>
    where F: FnOnce(Duration) -> TimerId {
        self.direction = direction;
        log::debug!("{}: starting {} guide for {} ms", self.device, direction, ms);

        sdk.pulse_guide_on(camera, direction)?;

        if ms < 1.0 {
            std::thread::sleep(Duration::from_micros((ms * 1000.0) as u64));
            self.pulse_off(sdk, camera);
            log::debug!("{}: stopped {} guide", self.device, direction);
            Ok(PropertyState::Ok)
        } else {
            self.pulse_request = ms / 1000.0;
            self.pulse_start = Instant::now();
            self.timer = Some(arm_timer(Duration::from_millis(ms as u64)));
            Ok(PropertyState::Busy)
        }
    }

    /// Handles expiry of the pulse timer; returns true if the pulse has been completed, or false if the timer
    /// was re-armed for the remaining time.
    pub fn on_timer<F>(&mut self, sdk: &dyn CameraSdk, camera: CameraId, arm_timer: F) -> bool
    where F: FnOnce(Duration) -> TimerId {
        self.timer = None;

        let time_left = self.pulse_request - self.pulse_start.elapsed().as_secs_f64();
        if time_left >= 0.000_001 {
            if time_left < 0.001 {
                std::thread::sleep(Duration::from_secs_f64(time_left));
            } else {
                self.timer = Some(arm_timer(Duration::from_millis((time_left * 1000.0) as u64)));
                return false;
            }
        }

        self.pulse_off(sdk, camera);
        log::debug!("{}: stopping {} guide", self.device, self.direction);

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::drivers::simulator::SimSdk;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::sync::Arc;

    const CAMERA: CameraId = CameraId(0);

    struct Ctx {
        axis: RefCell<GuideAxis>,
        sdk: Arc<SimSdk>,
        event_loop: EventLoop,
        completions: Cell<u32>
    }

    fn ctx() -> Rc<Ctx> {
        let sdk = Arc::new(SimSdk::new(1));
        sdk.open(CAMERA).unwrap();
        Rc::new(Ctx{
            axis: RefCell::new(GuideAxis::new("test", Axis::WE)),
            sdk,
            event_loop: EventLoop::new(),
            completions: Cell::new(0)
        })
    }

    fn schedule(ctx: &Rc<Ctx>, delay: Duration) -> TimerId {
        let c = Rc::clone(ctx);
        ctx.event_loop.add_timer(delay, move || {
            let rearm_ctx = Rc::clone(&c);
            let done = c.axis.borrow_mut().on_timer(&*c.sdk, CAMERA, |d| schedule(&rearm_ctx, d));
            if done { c.completions.set(c.completions.get() + 1); }
        })
    }

    fn run_until_idle(ctx: &Ctx) {
        let tstart = Instant::now();
        while ctx.event_loop.num_pending() > 0 && tstart.elapsed() < Duration::from_secs(2) {
            ctx.event_loop.run_once(Duration::from_millis(100));
        }
    }

    #[test]
    fn short_pulse_is_synchronous() {
        let ctx = ctx();
        let state = ctx.axis.borrow_mut().start(&*ctx.sdk, CAMERA, 0.5, GuideDirection::East, |_| panic!("no timer expected"));
        assert_eq!(PropertyState::Ok, state.unwrap());

        let calls = ctx.sdk.calls(CAMERA);
        assert_eq!(vec![GuideDirection::East], calls.pulse_on);
        assert_eq!(vec![GuideDirection::East], calls.pulse_off);
        assert!(!ctx.axis.borrow().is_pending());
    }

    #[test]
    fn long_pulse_completes_on_timer() {
        let ctx = ctx();
        let state = ctx.axis.borrow_mut().start(&*ctx.sdk, CAMERA, 20.5, GuideDirection::West, |d| schedule(&ctx, d));
        assert_eq!(PropertyState::Busy, state.unwrap());
        assert!(ctx.axis.borrow().is_pending());
        assert!(ctx.sdk.calls(CAMERA).pulse_off.is_empty());

        run_until_idle(&ctx);

        assert_eq!(1, ctx.completions.get());
        assert_eq!(vec![GuideDirection::West], ctx.sdk.calls(CAMERA).pulse_off);
        assert!(!ctx.axis.borrow().is_pending());
    }

    #[test]
    fn new_pulse_cancels_pending_one_once() {
        let ctx = ctx();
        ctx.axis.borrow_mut().start(&*ctx.sdk, CAMERA, 500.0, GuideDirection::West, |d| schedule(&ctx, d)).unwrap();

        assert!(ctx.axis.borrow_mut().stop(&*ctx.sdk, CAMERA, &ctx.event_loop));
        assert!(!ctx.axis.borrow_mut().stop(&*ctx.sdk, CAMERA, &ctx.event_loop));
        ctx.axis.borrow_mut().start(&*ctx.sdk, CAMERA, 10.0, GuideDirection::East, |d| schedule(&ctx, d)).unwrap();
        assert_eq!(1, ctx.event_loop.num_pending());

        run_until_idle(&ctx);

        assert_eq!(1, ctx.completions.get());
        let calls = ctx.sdk.calls(CAMERA);
        assert_eq!(vec![GuideDirection::West, GuideDirection::East], calls.pulse_on);
        assert_eq!(vec![GuideDirection::West, GuideDirection::East], calls.pulse_off);
    }
}
