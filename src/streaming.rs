//
// ccdhost - CCD camera driver host for amateur astronomy
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Video streaming collaborator.
//!

use crate::camera::BayerPattern;
use std::time::{Duration, Instant};

pub const DEFAULT_TARGET_FPS: f64 = 30.0;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Mono,
    Bayer(BayerPattern),
    Rgb
}

/// Receives video frames from the imaging worker.
pub trait Streamer: Send {
    fn set_pixel_format(&mut self, format: PixelFormat, bits_per_pixel: u32);

    fn set_size(&mut self, width: u32, height: u32);

    fn new_frame(&mut self, data: &[u8]);

    /// Returns true while streaming or recording is in progress.
    fn is_busy(&self) -> bool;

    fn target_fps(&self) -> f64;

    /// Called with `false` when streaming stops on its own (e.g., after a frame read error).
    fn set_stream(&mut self, enabled: bool);
}

/// Streamer measuring the received frame rate.
pub struct FrameRateStreamer {
    device: String,
    target_fps: f64,
    streaming: bool,
    pixel_format: PixelFormat,
    bits_per_pixel: u32,
    size: (u32, u32),
    num_frames: u64,
    fps_counter: u32,
    t_last_info: Instant,
    measured_fps: f64
}

impl FrameRateStreamer {
    pub fn new(device: &str, target_fps: f64) -> FrameRateStreamer {
        FrameRateStreamer{
            device: device.to_string(),
            target_fps: if target_fps > 0.0 { target_fps } else { DEFAULT_TARGET_FPS },
            streaming: false,
            pixel_format: PixelFormat::Mono,
            bits_per_pixel: 8,
            size: (0, 0),
            num_frames: 0,
            fps_counter: 0,
            t_last_info: Instant::now(),
            measured_fps: 0.0
        }
    }

    pub fn num_frames(&self) -> u64 { self.num_frames }

    pub fn measured_fps(&self) -> f64 { self.measured_fps }

    pub fn pixel_format(&self) -> (PixelFormat, u32) { (self.pixel_format, self.bits_per_pixel) }

    pub fn size(&self) -> (u32, u32) { self.size }
}

impl Streamer for FrameRateStreamer {
    fn set_pixel_format(&mut self, format: PixelFormat, bits_per_pixel: u32) {
        log::debug!("{}: stream pixel format {:?}, {} bpp", self.device, format, bits_per_pixel);
        self.pixel_format = format;
        self.bits_per_pixel = bits_per_pixel;
    }

    fn set_size(&mut self, width: u32, height: u32) {
        self.size = (width, height);
    }

    fn new_frame(&mut self, data: &[u8]) {
        if !self.streaming {
            self.streaming = true;
            self.t_last_info = Instant::now();
            self.fps_counter = 0;
        }

        let expected_len = match self.pixel_format {
            PixelFormat::Rgb => 3,
            _ => 1
        } * (self.bits_per_pixel as usize / 8) * self.size.0 as usize * self.size.1 as usize;
        if data.len() < expected_len {
            log::warn!("{}: received frame too small ({} < {} bytes)", self.device, data.len(), expected_len);
        }

        self.num_frames += 1;
        self.fps_counter += 1;
        let elapsed = self.t_last_info.elapsed();
        if elapsed >= Duration::from_secs(1) {
            self.measured_fps = self.fps_counter as f64 / elapsed.as_secs_f64();
            log::debug!("{}: streaming at {:.1} fps", self.device, self.measured_fps);
            self.fps_counter = 0;
            self.t_last_info = Instant::now();
        }
    }

    fn is_busy(&self) -> bool { self.streaming }

    fn target_fps(&self) -> f64 { self.target_fps }

    fn set_stream(&mut self, enabled: bool) {
        if self.streaming && !enabled {
            log::info!("{}: streaming stopped after {} frames", self.device, self.num_frames);
        }
        self.streaming = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_mark_streamer_busy_until_stopped() {
        let mut streamer = FrameRateStreamer::new("test", 10.0);
        streamer.set_pixel_format(PixelFormat::Rgb, 8);
        streamer.set_size(4, 2);
        assert!(!streamer.is_busy());

        assert_eq!(((PixelFormat::Rgb, 8), (4, 2)), (streamer.pixel_format(), streamer.size()));

        streamer.new_frame(&[0u8; 24]);
        streamer.new_frame(&[0u8; 24]);
        assert!(streamer.is_busy());
        assert_eq!(2, streamer.num_frames());

        streamer.set_stream(false);
        assert!(!streamer.is_busy());
    }

    #[test]
    fn frame_rate_is_measured_once_per_second() {
        let mut streamer = FrameRateStreamer::new("test", 10.0);
        streamer.set_size(2, 2);
        streamer.new_frame(&[0u8; 4]);
        assert_eq!(0.0, streamer.measured_fps());

        streamer.t_last_info = Instant::now() - Duration::from_secs(2);
        streamer.new_frame(&[0u8; 4]);
        let fps = streamer.measured_fps();
        assert!(fps > 0.9 && fps <= 1.0, "unexpected frame rate {}", fps);
        assert_eq!(0, streamer.fps_counter);
    }

    #[test]
    fn invalid_target_fps_is_replaced_by_default() {
        assert_eq!(DEFAULT_TARGET_FPS, FrameRateStreamer::new("test", 0.0).target_fps());
    }
}
