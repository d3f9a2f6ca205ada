//
// ccdhost - CCD camera driver host for amateur astronomy
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Registry of CCD devices.
//!

use crate::camera::CameraSdk;
use crate::ccd::AsiCcd;
use crate::config::Configuration;
use crate::host::DeviceEvent;
use crate::host::property::{Property, PropertyError};
use crate::streaming::FrameRateStreamer;
use crate::timer::EventLoop;
use crossbeam::channel::Sender;
use std::cell::{Ref, RefCell};
use std::rc::Rc;
use std::sync::Arc;

const DEVICE_NAME_PREFIX: &str = "ZWO CCD";
/// Length of the vendor prefix of SDK camera names (e.g., "ZWO ").
const VENDOR_PREFIX_LEN: usize = 4;

/// Returns the device name for an SDK camera name, without the duplicate number.
fn base_device_name(camera_name: &str) -> String {
    let model = camera_name.get(VENDOR_PREFIX_LEN..).unwrap_or(camera_name);
    format!("{} {}", DEVICE_NAME_PREFIX, model)
}

/// Returns a unique device name; `base_names`: base names of devices registered so far.
fn device_name(base_name: &str, base_names: &[String]) -> String {
    match base_names.iter().filter(|n| *n == base_name).count() {
        0 => base_name.to_string(),
        num_same => format!("{} {}", base_name, num_same + 1)
    }
}

/// All cameras found by the enabled SDK drivers, addressed by device name.
pub struct DeviceRegistry {
    devices: Vec<Rc<RefCell<AsiCcd>>>
}

impl DeviceRegistry {
    pub fn new(
        drivers: &[Arc<dyn CameraSdk>],
        event_loop: &Rc<EventLoop>,
        events: Sender<DeviceEvent>,
        config: &Configuration
    ) -> DeviceRegistry {
        let mut devices = vec![];
        let mut base_names: Vec<String> = vec![];

        for sdk in drivers {
            let cameras = match sdk.enumerate_cameras() {
                Ok(cameras) => cameras,
                Err(e) => { log::error!("failed to enumerate {} cameras: {}", sdk.name(), e); continue; }
            };

            if cameras.is_empty() {
                log::info!("no {} cameras detected", sdk.name());
            }

            for info in cameras {
                let base_name = base_device_name(&info.name);
                let name = device_name(&base_name, &base_names);
                log::info!("found camera \"{}\" (ID {}), registered as \"{}\"", info.name, info.id, name);

                let streamer = Box::new(FrameRateStreamer::new(&name, config.stream_target_fps()));
                let device = AsiCcd::new(
                    &name, info, Arc::clone(sdk), Rc::clone(event_loop), events.clone(), streamer
                );
                device.borrow_mut().set_saved_config(config.device(&name));
                devices.push(device);
                base_names.push(base_name);
            }
        }

        DeviceRegistry{ devices }
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.borrow().name().to_string()).collect()
    }

    fn find(&self, name: &str) -> Result<&Rc<RefCell<AsiCcd>>, PropertyError> {
        self.devices.iter()
            .find(|d| d.borrow().name() == name)
            .ok_or_else(|| PropertyError::UnknownDevice(name.to_string()))
    }

    pub fn device(&self, name: &str) -> Option<Ref<'_, AsiCcd>> {
        self.find(name).ok().map(|d| d.borrow())
    }

    /// Returns the current properties of `device` (or of all devices if `None`).
    pub fn get_properties(&self, device: Option<&str>) -> Result<Vec<Property>, PropertyError> {
        match device {
            Some(name) => Ok(self.find(name)?.borrow().get_properties()),
            None => Ok(self.devices.iter().flat_map(|d| d.borrow().get_properties()).collect())
        }
    }

    pub fn new_number(&self, device: &str, name: &str, values: &[(&str, f64)]) -> Result<(), PropertyError> {
        self.find(device)?.borrow_mut().new_number(name, values)
    }

    pub fn new_switch(&self, device: &str, name: &str, states: &[(&str, bool)]) -> Result<(), PropertyError> {
        self.find(device)?.borrow_mut().new_switch(name, states)
    }

    pub fn new_text(&self, device: &str, name: &str, texts: &[(&str, &str)]) -> Result<(), PropertyError> {
        self.find(device)?.borrow_mut().new_text(name, texts)
    }

    /// Lets the originating device react to its event.
    pub fn on_event(&self, event: &mut DeviceEvent) {
        match self.find(event.device()) {
            Ok(device) => device.borrow_mut().on_event(event),
            Err(_) => log::debug!("event from unknown device: {:?}", event)
        }
    }

    pub fn save_config(&self, config: &mut Configuration) {
        for device in &self.devices {
            let device = device.borrow();
            config.set_device(device.name(), device.save_config_items());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::drivers::simulator::SimSdk;
    use crate::ccd::properties::names;

    fn registry(num_cameras: usize) -> (DeviceRegistry, crossbeam::channel::Receiver<DeviceEvent>) {
        let (sender, receiver) = crossbeam::channel::unbounded();
        let drivers: Vec<Arc<dyn CameraSdk>> = vec![Arc::new(SimSdk::new(num_cameras))];
        let registry = DeviceRegistry::new(&drivers, &Rc::new(EventLoop::new()), sender, &Configuration::default());
        (registry, receiver)
    }

    #[test]
    fn duplicate_models_are_numbered() {
        let (registry, _) = registry(3);
        assert_eq!(
            vec!["ZWO CCD ASI Simulator", "ZWO CCD ASI Simulator 2", "ZWO CCD ASI Simulator 3"],
            registry.device_names()
        );
    }

    #[test]
    fn only_identical_models_are_numbered() {
        assert_eq!("ZWO CCD ASI", base_device_name("ASI"));
        let base_names = vec!["ZWO CCD ASI120MM".to_string(), "ZWO CCD ASI120MM Mini".to_string()];
        assert_eq!("ZWO CCD ASI120MM 2", device_name(&base_device_name("ZWO ASI120MM"), &base_names));
        assert_eq!("ZWO CCD ASI1600MM", device_name(&base_device_name("ZWO ASI1600MM"), &base_names));
    }

    #[test]
    fn requests_are_dispatched_by_device_name() {
        let (registry, _) = registry(1);

        assert_eq!(
            Err(PropertyError::UnknownDevice("nonexistent".to_string())),
            registry.new_switch("nonexistent", names::CONNECTION, &[(names::CONNECT, true)])
        );

        let properties = registry.get_properties(Some("ZWO CCD ASI Simulator")).unwrap();
        assert_eq!(1, properties.len());

        assert_eq!(
            Err(PropertyError::NotConnected),
            registry.new_number("ZWO CCD ASI Simulator", names::CCD_EXPOSURE, &[(names::CCD_EXPOSURE_VALUE, 1.0)])
        );
    }

    #[test]
    fn text_properties_are_read_only() {
        let (registry, _) = registry(1);
        let device = "ZWO CCD ASI Simulator";

        assert_eq!(
            Err(PropertyError::ReadOnly(names::CCD_CFA.to_string())),
            registry.new_text(device, names::CCD_CFA, &[(names::CFA_TYPE, "GBRG")])
        );
        assert_eq!(
            Err(PropertyError::UnknownProperty("CCD_NOTES".to_string())),
            registry.new_text(device, "CCD_NOTES", &[("TEXT", "")])
        );
        assert_eq!(
            Err(PropertyError::UnknownDevice("nonexistent".to_string())),
            registry.new_text("nonexistent", names::SDK, &[(names::VERSION, "")])
        );

        let ccd = registry.device(device).unwrap();
        assert_eq!(Some("RGGB"), ccd.properties().cfa.text(names::CFA_TYPE));
        assert_eq!(Some("simulator"), ccd.properties().sdk.text(names::VERSION));
    }
}
