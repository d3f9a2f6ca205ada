//
// ccdhost - CCD camera driver host for amateur astronomy
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Sensor geometry and captured frames.
//!

use crate::camera::{BayerPattern, CameraInfo, ImgType};
use num_traits::{bounds::Bounded, cast::AsPrimitive};
use strum_macros as sm;

#[derive(Copy, Clone, Debug, PartialEq, Eq, sm::EnumIter, sm::IntoStaticStr, sm::EnumString)]
pub enum FrameType {
    #[strum(serialize = "FRAME_LIGHT")]
    Light,
    #[strum(serialize = "FRAME_BIAS")]
    Bias,
    #[strum(serialize = "FRAME_DARK")]
    Dark,
    #[strum(serialize = "FRAME_FLAT")]
    Flat
}

impl FrameType {
    pub fn switch_name(&self) -> &'static str { self.into() }

    pub fn label(&self) -> &'static str {
        match self {
            FrameType::Light => "Light",
            FrameType::Bias => "Bias",
            FrameType::Dark => "Dark",
            FrameType::Flat => "Flat"
        }
    }
}

/// Image delivered after an exposure.
///
/// For `naxis == 3` the data consists of consecutive R, G, B planes. 16-bit values are little-endian.
///
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub naxis: u32,
    pub bits_per_pixel: u32,
    pub data: Vec<u8>,
    /// Set if the data is a raw color filter array mosaic.
    pub bayer_pattern: Option<BayerPattern>,
    /// Exposure time in seconds.
    pub exposure: f64,
    pub frame_type: FrameType,
    /// Additional header values (e.g., gain).
    pub keywords: Vec<(String, f64)>
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f, "Frame({}x{}, NAXIS {}, {} bpp, {:?}, {} s, {} bytes)",
            self.width, self.height, self.naxis, self.bits_per_pixel, self.frame_type, self.exposure, self.data.len()
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FrameStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64
}

impl Frame {
    pub fn keyword(&self, name: &str) -> Option<f64> {
        self.keywords.iter().find(|(k, _)| k == name).map(|(_, v)| *v)
    }

    pub fn statistics(&self) -> Option<FrameStats> {
        match self.bits_per_pixel {
            8 => find_stats(self.data.iter().copied()),
            16 => find_stats(self.data.chunks_exact(2).map(|b| u16::from_le_bytes([b[0], b[1]]))),
            _ => None
        }
    }
}

/// Finds min, max and mean of `values`.
///
/// `T`: type of pixel (channel) values.
///
fn find_stats<T, I>(values: I) -> Option<FrameStats>
where
    T: 'static + Bounded + Copy + PartialOrd + AsPrimitive<f64>,
    I: Iterator<Item = T>
{
    let mut min_val = T::max_value();
    let mut max_val = T::min_value();
    let mut sum = 0.0;
    let mut count = 0usize;

    for val in values {
        if val < min_val { min_val = val; }
        if val > max_val { max_val = val; }
        sum += val.as_();
        count += 1;
    }

    if count == 0 {
        None
    } else {
        Some(FrameStats{ min: min_val.as_(), max: max_val.as_(), mean: sum / count as f64 })
    }
}

#[derive(Debug, PartialEq)]
pub enum FrameError {
    InvalidWidth(u32),
    InvalidHeight(u32)
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::InvalidWidth(w) => write!(f, "invalid width requested: {}", w),
            FrameError::InvalidHeight(h) => write!(f, "invalid height requested: {}", h)
        }
    }
}

/// Binned region of interest as programmed into the camera.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BinnedRoi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32
}

/// Sensor parameters and the current (unbinned) sub-frame.
#[derive(Debug)]
pub struct CcdChip {
    pub x_res: u32,
    pub y_res: u32,
    pub bits_per_pixel: u32,
    pub max_bin: u32,
    pub bin: u32,
    pub sub_x: u32,
    pub sub_y: u32,
    pub sub_w: u32,
    pub sub_h: u32,
    pub frame_type: FrameType,
    warn_roi_width: bool,
    warn_roi_height: bool
}

impl CcdChip {
    pub fn new(info: &CameraInfo) -> CcdChip {
        CcdChip{
            x_res: info.max_width,
            y_res: info.max_height,
            bits_per_pixel: 8,
            max_bin: info.supported_bins.iter().copied().max().unwrap_or(1),
            bin: 1,
            sub_x: 0,
            sub_y: 0,
            sub_w: info.max_width,
            sub_h: info.max_height,
            frame_type: FrameType::Light,
            warn_roi_width: true,
            warn_roi_height: true
        }
    }

    /// Converts an unbinned frame to the binned ROI supported by the camera.
    ///
    /// The camera requires width to be a multiple of 8 and height a multiple of 2; other values are reduced
    /// (with a one-time notice per dimension).
    ///
    pub fn fit_frame(&mut self, x: u32, y: u32, w: u32, h: u32) -> Result<BinnedRoi, FrameError> {
        let bin = self.bin.max(1);
        let (sub_x, sub_y, mut sub_w, mut sub_h) = (x / bin, y / bin, w / bin, h / bin);

        if sub_w > self.x_res / bin { return Err(FrameError::InvalidWidth(w)); }
        if sub_h > self.y_res / bin { return Err(FrameError::InvalidHeight(h)); }

        if self.warn_roi_width && sub_w % 8 > 0 {
            log::info!("incompatible frame width {} px; reducing by {} px", sub_w, sub_w % 8);
            self.warn_roi_width = false;
        }
        if self.warn_roi_height && sub_h % 2 > 0 {
            log::info!("incompatible frame height {} px; reducing by {} px", sub_h, sub_h % 2);
            self.warn_roi_height = false;
        }

        sub_w -= sub_w % 8;
        sub_h -= sub_h % 2;

        if sub_w == 0 { return Err(FrameError::InvalidWidth(w)); }
        if sub_h == 0 { return Err(FrameError::InvalidHeight(h)); }

        Ok(BinnedRoi{ x: sub_x, y: sub_y, width: sub_w, height: sub_h })
    }

    /// Records the programmed ROI as the current unbinned frame.
    pub fn set_frame(&mut self, roi: &BinnedRoi) {
        self.sub_x = roi.x * self.bin;
        self.sub_y = roi.y * self.bin;
        self.sub_w = roi.width * self.bin;
        self.sub_h = roi.height * self.bin;
    }

    pub fn binned_size(&self) -> (u32, u32) {
        let bin = self.bin.max(1);
        (self.sub_w / bin, self.sub_h / bin)
    }

    pub fn frame_buffer_size(&self, img_type: ImgType) -> usize {
        let (w, h) = self.binned_size();
        w as usize * h as usize * (self.bits_per_pixel as usize / 8) * img_type.num_channels()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraId;

    fn info() -> CameraInfo {
        CameraInfo{
            id: CameraId(0),
            name: "ZWO ASI120MM".to_string(),
            max_width: 1280,
            max_height: 960,
            is_color: false,
            bayer_pattern: BayerPattern::RG,
            supported_bins: vec![1, 2, 4],
            supported_video_formats: vec![0],
            pixel_size: 3.75,
            has_st4_port: true,
            has_cooler: false,
            is_usb3_host: false,
            is_usb3_camera: false,
            bit_depth: 12
        }
    }

    #[test]
    fn frame_is_reduced_to_camera_granularity() {
        let mut chip = CcdChip::new(&info());
        assert_eq!(4, chip.max_bin);

        let roi = chip.fit_frame(10, 20, 101, 51).unwrap();
        assert_eq!(BinnedRoi{ x: 10, y: 20, width: 96, height: 50 }, roi);
        // notices are issued once, the reduction always applies
        assert!(!chip.warn_roi_width && !chip.warn_roi_height);
        assert_eq!(96, chip.fit_frame(0, 0, 103, 50).unwrap().width);
    }

    #[test]
    fn binned_frame_is_recorded_unbinned() {
        let mut chip = CcdChip::new(&info());
        chip.bin = 2;
        let roi = chip.fit_frame(0, 0, 1280, 960).unwrap();
        assert_eq!((640, 480), (roi.width, roi.height));
        chip.set_frame(&roi);
        assert_eq!((1280, 960), (chip.sub_w, chip.sub_h));
        assert_eq!((640, 480), chip.binned_size());
        assert_eq!(640 * 480 * 3, chip.frame_buffer_size(ImgType::Rgb24));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut chip = CcdChip::new(&info());
        assert_eq!(Err(FrameError::InvalidWidth(1300)), chip.fit_frame(0, 0, 1300, 960));
        assert_eq!(Err(FrameError::InvalidHeight(1000)), chip.fit_frame(0, 0, 1280, 1000));
    }

    #[test]
    fn statistics_of_16_bit_frame() {
        let frame = Frame{
            width: 2,
            height: 1,
            naxis: 2,
            bits_per_pixel: 16,
            data: vec![0x00, 0x01, 0x00, 0x03],
            bayer_pattern: None,
            exposure: 1.0,
            frame_type: FrameType::Light,
            keywords: vec![("Gain".to_string(), 120.0)]
        };
        assert_eq!(Some(FrameStats{ min: 256.0, max: 768.0, mean: 512.0 }), frame.statistics());
        assert_eq!(Some(120.0), frame.keyword("Gain"));
    }

    #[test]
    fn frame_type_names() {
        assert_eq!("FRAME_DARK", FrameType::Dark.switch_name());
        assert_eq!(Ok(FrameType::Flat), "FRAME_FLAT".parse::<FrameType>());
    }
}
