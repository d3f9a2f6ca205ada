//
// ccdhost - CCD camera driver host for amateur astronomy
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Camera SDK drivers.
//!

#[cfg(feature = "camera_asi")]
pub mod asi;
pub mod simulator;

use crate::camera::CameraSdk;
use std::sync::Arc;

pub fn init_drivers(disabled_drivers: &[&str], num_simulator_cameras: usize) -> Vec<Arc<dyn CameraSdk>> {
    let mut drivers: Vec<Arc<dyn CameraSdk>> = vec![];

    #[cfg(feature = "camera_asi")]
    if !disabled_drivers.contains(&"camera_asi") {
        let driver = asi::AsiSdk::new();
        log::info!("initializing ZWO ASI camera driver (SDK version {})", driver.version());
        drivers.push(Arc::new(driver));
    }

    // add more drivers here

    if !disabled_drivers.contains(&"simulator") && num_simulator_cameras > 0 {
        log::info!("initializing camera simulator driver ({} camera(s))", num_simulator_cameras);
        drivers.push(Arc::new(simulator::SimSdk::new(num_simulator_cameras)));
    }

    drivers
}
