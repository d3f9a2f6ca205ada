//
// ccdhost - CCD camera driver host for amateur astronomy
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Entry point of the `ccdhost` executable.
//!

mod args;
mod camera;
mod ccd;
mod config;
mod host;
mod streaming;
mod timer;
mod workers;

use camera::drivers;
use ccd::guide::Axis;
use ccd::properties::names;
use config::Configuration;
use host::{DeviceEvent, Host};
use host::property::{Property, PropertyBase, PropertyError, PropertyState};
use std::time::Duration;

pub const VERSION_STRING: &'static str = include_str!(concat!(env!("OUT_DIR"), "/version"));

/// Extra time allowed for an exposure to be downloaded and delivered.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const GUIDE_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

fn main() {
    let args = args::parse_command_line(std::env::args());

    set_up_logging(args.logging);

    log::info!("ccdhost ver. {} on {} started", VERSION_STRING, os_info::get());

    let mut config = Configuration::new();
    let disabled_drivers: Vec<&str> = config.disabled_drivers().iter().map(|s| s.as_str()).collect();
    let drivers = drivers::init_drivers(&disabled_drivers, config.simulator_cameras());

    let host = Host::new(&drivers, &config);
    let device_names = host.registry().device_names();
    if device_names.is_empty() {
        println!("No cameras found.");
        return;
    }
    println!("Cameras: {}", device_names.join(", "));

    let device = match &args.device {
        Some(name) if !device_names.contains(name) => {
            println!("Camera \"{}\" not found.", name);
            return;
        },
        Some(name) => name.clone(),
        None => device_names[0].clone()
    };

    if let Err(e) = run_session(&host, &device, &args) {
        println!("{}: {}", device, e);
        log::error!("{}: {}", device, e);
    }

    if host.registry().device(&device).map_or(false, |d| d.is_connected()) {
        if let Err(e) = host.registry().new_switch(&device, names::CONNECTION, &[(names::DISCONNECT, true)]) {
            log::error!("{}: failed to disconnect: {}", device, e);
        }
    }

    host.save_config(&mut config);
    if let Err(e) = config.store() {
        log::warn!("failed to save configuration: {}", e);
    }
}

/// Connects `device` and runs the acquisition requested on the command line.
fn run_session(host: &Host, device: &str, args: &args::Args) -> Result<(), PropertyError> {
    let registry = host.registry();

    registry.new_switch(device, names::CONNECTION, &[(names::CONNECT, true)])?;
    for property in registry.get_properties(Some(device))? {
        print_property(&property);
    }

    if let Some(duration) = args.exposure {
        registry.new_number(device, names::CCD_EXPOSURE, &[(names::CCD_EXPOSURE_VALUE, duration)])?;

        let timeout = Duration::from_secs_f64(duration) + DOWNLOAD_TIMEOUT;
        let finished = host.run_until(timeout, |event| match event {
            DeviceEvent::ExposureComplete{ device: d, frame } if d == device => {
                match frame.statistics() {
                    Some(stats) => println!(
                        "Exposure complete: {:?}, min {}, max {}, mean {:.1}", frame, stats.min, stats.max, stats.mean
                    ),
                    None => println!("Exposure complete: {:?}", frame)
                }
                true
            },
            DeviceEvent::ExposureFailed{ device: d } if d == device => {
                println!("Exposure failed.");
                true
            },
            _ => false
        });
        if !finished { println!("Exposure timed out."); }
    }

    if let Some(duration) = args.stream {
        registry.new_switch(device, names::CCD_VIDEO_STREAM, &[(names::STREAM_ON, true)])?;

        let stopped = host.run_until(Duration::from_secs_f64(duration), |event| match event {
            DeviceEvent::StreamStopped{ device: d } if d == device => true,
            _ => false
        });
        if stopped {
            println!("Streaming stopped on error.");
        } else {
            registry.new_switch(device, names::CCD_VIDEO_STREAM, &[(names::STREAM_OFF, true)])?;
            println!("Streaming finished.");
        }
    }

    if let Some(ms) = args.guide {
        let timeout = Duration::from_secs_f64(ms / 1000.0) + GUIDE_TIMEOUT_MARGIN;
        let pulses = [
            (names::TELESCOPE_TIMED_GUIDE_NS, names::TIMED_GUIDE_N, Axis::NS),
            (names::TELESCOPE_TIMED_GUIDE_WE, names::TIMED_GUIDE_W, Axis::WE)
        ];

        for (property, item, axis) in pulses.iter() {
            registry.new_number(device, property, &[(*item, ms)])?;

            let pending = registry.device(device).map_or(false, |d| {
                let guide = match axis { Axis::NS => &d.properties().guide_ns, Axis::WE => &d.properties().guide_we };
                guide.state() == PropertyState::Busy
            });
            if pending {
                host.run_until(timeout, |event| match event {
                    DeviceEvent::GuideComplete{ device: d, axis: a } => d == device && a == axis,
                    _ => false
                });
            }
            println!("Guide pulse {} for {} ms done.", item, ms);
        }
    }

    Ok(())
}

fn print_property(property: &Property) {
    println!("  [{}] {} \"{}\" ({:?})", property.group(), property.name(), property.label(), property.state());
    match property {
        Property::Number(nv) => for item in &nv.items {
            println!("      {}: {}", item.label, item.value);
        },
        Property::Switch(sv) => for item in &sv.items {
            println!("      {}: {}", item.label, if item.on { "on" } else { "off" });
        },
        Property::Text(tv) => for item in &tv.items {
            println!("      {}: {}", item.label, item.text);
        }
    }
}

fn set_up_logging(log_to_file: bool) {
    let mut loggers: Vec<Box<dyn simplelog::SharedLogger>> = vec![];
    loggers.push(simplelog::TermLogger::new(
        simplelog::LevelFilter::Warn,
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto
    ));

    if log_to_file {
        std::panic::set_hook(Box::new(|info| {
            let backtrace = std::backtrace::Backtrace::force_capture();
            log::error!("{}\n\n{}", info, backtrace);
        }));

        let tz_offset = chrono::Local::now().offset().clone();
        let logfile = dirs::data_dir().unwrap_or(std::path::Path::new("").to_path_buf())
            .join(format!("ccdhost_{}.log", chrono::Local::now().format("%Y-%m-%d_%H%M%S")));

        match std::fs::File::create(&logfile) {
            Ok(file) => {
                println!("Logging to: {}", logfile.to_string_lossy());
                loggers.push(simplelog::WriteLogger::new(
                    simplelog::LevelFilter::Debug,
                    simplelog::ConfigBuilder::new()
                        .set_target_level(simplelog::LevelFilter::Error)
                        .set_time_offset(
                            time::UtcOffset::from_whole_seconds(tz_offset.local_minus_utc()).unwrap_or(time::UtcOffset::UTC)
                        )
                        .set_time_format_custom(simplelog::format_description!(
                            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]"
                        ))
                        .build(),
                    file
                ));
            },
            Err(e) => eprintln!("Failed to create log file {}: {}.", logfile.to_string_lossy(), e)
        }
    }

    if let Err(e) = simplelog::CombinedLogger::init(loggers) {
        eprintln!("Failed to set up logging: {}.", e);
    }
}
