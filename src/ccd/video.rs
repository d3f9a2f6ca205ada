//
// ccdhost - CCD camera driver host for amateur astronomy
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Video (image) format selection.
//!

use crate::camera::{BayerPattern, CameraInfo, ImgType};
use crate::host::property::*;
use crate::streaming::PixelFormat;

pub const VIDEO_FORMAT_PROPERTY: &str = "CCD_VIDEO_FORMAT";

/// One switch per image type supported by the camera.
pub struct VideoFormats {
    switches: SwitchVector,
    formats: Vec<ImgType>
}

impl VideoFormats {
    pub fn new(device: &str, info: &CameraInfo, current: ImgType) -> VideoFormats {
        let mut formats = vec![];
        for raw in &info.supported_video_formats {
            match ImgType::from_repr(*raw) {
                Some(img_type) => formats.push(img_type),
                None => log::debug!("{}: skipping unknown video format {}", device, raw)
            }
        }

        let items = formats.iter()
            .map(|f| SwitchItem::new(f.switch_name(), f.label(), *f == current))
            .collect();

        VideoFormats{
            switches: SwitchVector::new(
                PropertyHeader::new(device, VIDEO_FORMAT_PROPERTY, "Format", "Streaming", Permission::ReadWrite),
                SwitchRule::OneOfMany,
                items
            ),
            formats
        }
    }

    pub fn property(&self) -> &SwitchVector { &self.switches }

    pub fn current(&self) -> Option<ImgType> {
        self.switches.find_on_index().map(|idx| self.formats[idx])
    }

    pub fn find(&self, name: &str) -> Option<ImgType> {
        self.formats.iter().copied().find(|f| f.switch_name() == name)
    }

    /// Marks `format` as the selected one.
    pub fn select(&mut self, format: ImgType) -> Result<(), PropertyError> {
        match self.formats.iter().position(|f| *f == format) {
            Some(idx) => {
                self.switches.reset();
                self.switches.items[idx].on = true;
                Ok(())
            },
            None => Err(PropertyError::UnknownItem(format.switch_name().to_string()))
        }
    }

    pub fn set_state(&mut self, state: PropertyState) { self.switches.set_state(state); }
}

/// Pixel format and bits per pixel of frames delivered in `img_type`.
pub fn pixel_format(img_type: ImgType, is_color: bool, bayer_pattern: BayerPattern) -> (PixelFormat, u32) {
    let raw_format = if is_color { PixelFormat::Bayer(bayer_pattern) } else { PixelFormat::Mono };

    match img_type {
        ImgType::Y8 => (PixelFormat::Mono, 8),
        ImgType::Raw8 => (raw_format, 8),
        ImgType::Raw16 => (raw_format, 16),
        ImgType::Rgb24 => (PixelFormat::Rgb, 8)
    }
}
