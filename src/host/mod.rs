//
// ccdhost - CCD camera driver host for amateur astronomy
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Host runtime: device registry, event delivery and the timer loop.
//!

pub mod property;
pub mod registry;

use crate::camera::CameraSdk;
use crate::ccd::chip::Frame;
use crate::ccd::guide::Axis;
use crate::config::Configuration;
use crate::timer::EventLoop;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use property::{Property, PropertyBase};
use registry::DeviceRegistry;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Notification sent by a device (from the host thread or from its imaging thread).
#[derive(Debug)]
pub enum DeviceEvent {
    /// New value and/or state of a property.
    PropertyUpdated(Property),
    /// Progress of the current exposure.
    ExposureLeft{ device: String, seconds: f64 },
    ExposureComplete{ device: String, frame: Frame },
    ExposureFailed{ device: String },
    /// The camera reported a failed exposure and it has been started again.
    ExposureRestarted{ device: String, attempt: u32 },
    /// Streaming ended because of a frame read error.
    StreamStopped{ device: String },
    GuideComplete{ device: String, axis: Axis }
}

impl DeviceEvent {
    pub fn device(&self) -> &str {
        match self {
            DeviceEvent::PropertyUpdated(property) => &property.header().device,
            DeviceEvent::ExposureLeft{ device, .. }
            | DeviceEvent::ExposureComplete{ device, .. }
            | DeviceEvent::ExposureFailed{ device }
            | DeviceEvent::ExposureRestarted{ device, .. }
            | DeviceEvent::StreamStopped{ device }
            | DeviceEvent::GuideComplete{ device, .. } => device
        }
    }
}

pub struct Host {
    event_loop: Rc<EventLoop>,
    registry: DeviceRegistry,
    events: Receiver<DeviceEvent>
}

impl Host {
    pub fn new(drivers: &[Arc<dyn CameraSdk>], config: &Configuration) -> Host {
        let event_loop = Rc::new(EventLoop::new());
        let (sender, events) = crossbeam::channel::unbounded();
        let registry = DeviceRegistry::new(drivers, &event_loop, sender, config);

        Host{ event_loop, registry, events }
    }

    pub fn registry(&self) -> &DeviceRegistry { &self.registry }

    fn deliver<F: FnMut(&DeviceEvent) -> bool>(&self, mut event: DeviceEvent, handler: &mut F) -> bool {
        self.registry.on_event(&mut event);
        handler(&event)
    }

    /// Runs timers and delivers device events until `handler` returns true or `timeout` elapses.
    ///
    /// Each event is first handled by its device, then passed to `handler`. Returns false on timeout.
    ///
    pub fn run_until<F: FnMut(&DeviceEvent) -> bool>(&self, timeout: Duration, mut handler: F) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            self.event_loop.fire_due();

            while let Ok(event) = self.events.try_recv() {
                if self.deliver(event, &mut handler) { return true; }
            }

            let now = Instant::now();
            if now >= deadline { return false; }

            let wake_up = match self.event_loop.next_deadline() {
                Some(timer_deadline) => timer_deadline.min(deadline),
                None => deadline
            };

            match self.events.recv_timeout(wake_up.saturating_duration_since(now)) {
                Ok(event) => if self.deliver(event, &mut handler) { return true; },
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => std::thread::sleep(wake_up.saturating_duration_since(now))
            }
        }
    }

    /// Collects device settings and writes them to `config`.
    pub fn save_config(&self, config: &mut Configuration) {
        self.registry.save_config(config);
    }
}
