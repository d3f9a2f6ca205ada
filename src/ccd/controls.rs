//
// ccdhost - CCD camera driver host for amateur astronomy
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Camera controls exposed as properties.
//!

use crate::camera::{CameraId, CameraInfo, CameraSdk, ControlType, SdkError};
use crate::host::property::*;

pub const CONTROLS_PROPERTY: &str = "CCD_CONTROLS";
pub const CONTROLS_MODE_PROPERTY: &str = "CCD_CONTROLS_MODE";
const CONTROLS_GROUP: &str = "Controls";

/// Exposure time limits reported by the camera (seconds).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ExposureLimits {
    pub min: f64,
    pub max: f64
}

/// Writable camera controls (one number each) and their auto modes (one switch per auto-capable control).
pub struct ControlSet {
    numbers: NumberVector,
    /// Control types of `numbers.items`, with the current auto flag.
    number_controls: Vec<(ControlType, bool)>,
    modes: SwitchVector,
    /// Control types of `modes.items`.
    mode_controls: Vec<ControlType>
}

fn auto_switch_name(control_name: &str) -> String { format!("AUTO_{}", control_name) }

impl ControlSet {
    /// Builds the controls from the camera's control capabilities.
    ///
    /// Target temperature and cooler on/off are handled by the cooler properties; the exposure control only
    /// provides the exposure limits. The USB bandwidth control is initialized according to the USB host
    /// and camera kind.
    ///
    pub fn create(
        device: &str,
        sdk: &dyn CameraSdk,
        camera: CameraId,
        info: &CameraInfo
    ) -> Result<(ControlSet, Option<ExposureLimits>), SdkError> {
        let mut numbers = vec![];
        let mut number_controls = vec![];
        let mut modes = vec![];
        let mut mode_controls = vec![];
        let mut exposure_limits = None;

        for i in 0..sdk.num_controls(camera)? {
            let caps = sdk.control_caps(camera, i)?;
            log::debug!(
                "{}: control #{}: {} ({}), min {}, max {}, default {}, auto: {}, writable: {}",
                device, i, caps.name, caps.description, caps.min, caps.max, caps.default,
                caps.is_auto_supported, caps.is_writable
            );

            match caps.control_type {
                ControlType::TargetTemp | ControlType::CoolerOn => continue,
                _ if !caps.is_writable => continue,
                ControlType::Exposure => {
                    exposure_limits = Some(ExposureLimits{
                        min: caps.min as f64 / 1_000_000.0,
                        max: caps.max as f64 / 1_000_000.0
                    });
                    continue;
                },
                ControlType::BandWidth => {
                    let bandwidth = if info.is_usb3_camera && !info.is_usb3_host {
                        (0.8 * caps.max as f64) as i64
                    } else {
                        caps.min
                    };
                    log::debug!("{}: setting USB bandwidth to {}", device, bandwidth);
                    if let Err(e) = sdk.set_control_value(camera, caps.control_type, bandwidth, false) {
                        log::warn!("{}: failed to set USB bandwidth: {}", device, e);
                    }
                },
                _ => ()
            }

            let (value, is_auto) = sdk.control_value(camera, caps.control_type)?;

            // a range of 1 denotes an on/off control
            let step = if caps.max - caps.min > 1 { (caps.max - caps.min) as f64 / 10.0 } else { 1.0 };
            numbers.push(NumberItem::new(&caps.name, &caps.name, caps.min as f64, caps.max as f64, step, value as f64));
            number_controls.push((caps.control_type, is_auto));

            if caps.is_auto_supported {
                modes.push(SwitchItem::new(&auto_switch_name(&caps.name), &caps.name, is_auto));
                mode_controls.push(caps.control_type);
            }
        }

        Ok((
            ControlSet{
                numbers: NumberVector::new(
                    PropertyHeader::new(device, CONTROLS_PROPERTY, "Controls", CONTROLS_GROUP, Permission::ReadWrite),
                    numbers
                ),
                number_controls,
                modes: SwitchVector::new(
                    PropertyHeader::new(device, CONTROLS_MODE_PROPERTY, "Set Auto", CONTROLS_GROUP, Permission::ReadWrite),
                    SwitchRule::AnyOfMany,
                    modes
                ),
                mode_controls
            },
            exposure_limits
        ))
    }

    pub fn numbers(&self) -> &NumberVector { &self.numbers }

    pub fn modes(&self) -> &SwitchVector { &self.modes }

    pub fn value(&self, control: ControlType) -> Option<f64> {
        self.number_controls.iter()
            .position(|(ct, _)| *ct == control)
            .map(|idx| self.numbers.items[idx].value)
    }

    pub fn is_auto(&self, control: ControlType) -> Option<bool> {
        self.number_controls.iter().find(|(ct, _)| *ct == control).map(|(_, auto)| *auto)
    }

    /// Writes the changed control values (in manual mode); returns true if any auto switch was turned off.
    ///
    /// On failure all values are reverted and the property is set to alert.
    ///
    pub fn update_numbers(
        &mut self,
        sdk: &dyn CameraSdk,
        camera: CameraId,
        values: &[(&str, f64)]
    ) -> Result<bool, PropertyError> {
        if let Err(e) = self.numbers.validate(values) {
            self.numbers.set_state(PropertyState::Alert);
            return Err(e);
        }

        let old_values: Vec<f64> = self.numbers.items.iter().map(|i| i.value).collect();
        self.numbers.update(values);

        let mut modes_changed = false;
        for idx in 0..self.numbers.items.len() {
            let value = self.numbers.items[idx].value;
            if value == old_values[idx] { continue; }

            let (control, was_auto) = self.number_controls[idx];
            log::debug!("{}: setting control {} to {:.2}", self.numbers.header.device, control, value);
            if let Err(e) = sdk.set_control_value(camera, control, value as i64, false) {
                log::error!(
                    "{}: failed to set {} to {}: {}",
                    self.numbers.header.device, self.numbers.items[idx].name, value, e
                );
                for (item, old_value) in self.numbers.items.iter_mut().zip(old_values.iter()) {
                    item.value = *old_value;
                }
                self.numbers.set_state(PropertyState::Alert);
                return Err(PropertyError::Rejected(e.to_string()));
            }

            if was_auto {
                self.number_controls[idx].1 = false;
                if let Some(sw_idx) = self.mode_controls.iter().position(|ct| *ct == control) {
                    self.modes.items[sw_idx].on = false;
                    modes_changed = true;
                }
            }
        }

        self.numbers.set_state(PropertyState::Ok);

        Ok(modes_changed)
    }

    /// Applies auto mode switches: each control is written with its current value and the switch's auto flag.
    pub fn update_modes(
        &mut self,
        sdk: &dyn CameraSdk,
        camera: CameraId,
        states: &[(&str, bool)]
    ) -> Result<(), PropertyError> {
        if let Err(e) = self.modes.update(states) {
            self.modes.set_state(PropertyState::Alert);
            return Err(e);
        }

        for (sw_idx, control) in self.mode_controls.iter().enumerate() {
            let auto = self.modes.items[sw_idx].on;
            let num_idx = match self.number_controls.iter().position(|(ct, _)| ct == control) {
                Some(idx) => idx,
                None => continue
            };

            let value = self.numbers.items[num_idx].value;
            log::debug!("{}: setting control {} to {:.2} (auto: {})", self.modes.header.device, control, value, auto);
            if let Err(e) = sdk.set_control_value(camera, *control, value as i64, auto) {
                log::error!(
                    "{}: failed to set {} to {}: {}",
                    self.modes.header.device, self.numbers.items[num_idx].name, value, e
                );
                self.numbers.set_state(PropertyState::Alert);
                self.modes.set_state(PropertyState::Alert);
                return Err(PropertyError::Rejected(e.to_string()));
            }
            self.number_controls[num_idx].1 = auto;
        }

        self.modes.set_state(PropertyState::Ok);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::drivers::simulator::SimSdk;

    const CAMERA: CameraId = CameraId(0);

    fn create() -> (SimSdk, ControlSet, Option<ExposureLimits>) {
        let sdk = SimSdk::new(1);
        sdk.open(CAMERA).unwrap();
        let info = sdk.enumerate_cameras().unwrap().remove(0);
        let (controls, limits) = ControlSet::create("test", &sdk, CAMERA, &info).unwrap();
        (sdk, controls, limits)
    }

    #[test]
    fn only_plain_writable_controls_become_numbers() {
        let (sdk, controls, limits) = create();

        let names: Vec<&str> = controls.numbers().items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(vec!["Gain", "Offset", "BandWidth", "WB_R", "WB_B", "Gamma", "Flip", "HighSpeedMode"], names);

        let switches: Vec<&str> = controls.modes().items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(vec!["AUTO_Gain", "AUTO_BandWidth", "AUTO_WB_R", "AUTO_WB_B"], switches);

        assert_eq!(Some(ExposureLimits{ min: 0.000032, max: 2000.0 }), limits);
        assert_eq!(Some(30.0), controls.numbers().item("Gain").map(|i| i.step));
        assert_eq!(Some(1.0), controls.numbers().item("HighSpeedMode").map(|i| i.step));

        // USB3 camera on a USB2 host
        assert_eq!(Some(80.0), controls.value(ControlType::BandWidth));
        assert!(sdk.calls(CAMERA).set_control.contains(&(ControlType::BandWidth, 80, false)));
    }

    #[test]
    fn manual_value_turns_auto_mode_off() {
        let (sdk, mut controls, _) = create();

        controls.update_modes(&sdk, CAMERA, &[("AUTO_Gain", true)]).unwrap();
        assert_eq!(Some(true), controls.is_auto(ControlType::Gain));
        assert_eq!(Some(&(ControlType::Gain, 100, true)), sdk.calls(CAMERA).set_control.last());

        assert!(controls.update_numbers(&sdk, CAMERA, &[("Gain", 150.0), ("Offset", 8.0)]).unwrap());
        assert_eq!(Some(&(ControlType::Gain, 150, false)), sdk.calls(CAMERA).set_control.last());
        assert!(!controls.modes().is_on("AUTO_Gain"));
        assert_eq!(Some(false), controls.is_auto(ControlType::Gain));
        assert_eq!(PropertyState::Ok, controls.numbers().state());
    }

    #[test]
    fn failed_write_reverts_all_values() {
        let (sdk, mut controls, _) = create();
        sdk.fail_control_writes(CAMERA, ControlType::Offset);

        let result = controls.update_numbers(&sdk, CAMERA, &[("Gain", 150.0), ("Offset", 20.0)]);
        assert!(result.is_err());
        assert_eq!(Some(100.0), controls.value(ControlType::Gain));
        assert_eq!(Some(8.0), controls.value(ControlType::Offset));
        assert_eq!(PropertyState::Alert, controls.numbers().state());
    }

    #[test]
    fn out_of_range_value_is_rejected_without_writes() {
        let (sdk, mut controls, _) = create();
        let num_writes = sdk.calls(CAMERA).set_control.len();

        assert!(controls.update_numbers(&sdk, CAMERA, &[("Gain", 301.0)]).is_err());
        assert_eq!(num_writes, sdk.calls(CAMERA).set_control.len());
        assert_eq!(PropertyState::Alert, controls.numbers().state());
    }
}
