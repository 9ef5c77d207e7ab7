use crate::exposure::ExposureList;
use crate::frame::{CodingMode, PixelFormat};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const MIN_JPEG_QUALITY: i32 = 1;
pub const MAX_JPEG_QUALITY: i32 = 100;
pub const DEFAULT_THUMB_WIDTH: u32 = 160;
pub const DEFAULT_THUMB_HEIGHT: u32 = 120;

/// Picture format names accepted in [`CaptureParameters::picture_format`]
pub mod formats {
    pub const YUV422I: &str = "yuv422i-yuyv";
    pub const YUV420SP: &str = "yuv420sp";
    pub const RGB565: &str = "rgb565";
    pub const JPEG: &str = "jpeg";
    pub const JPS: &str = "jps";
    pub const MPO: &str = "mpo";
    pub const RAW_JPEG: &str = "raw+jpeg";
    pub const RAW_MPO: &str = "raw+mpo";
    pub const RAW: &str = "raw";
}

/// Camera operating mode the adapter was opened in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    HighQuality,
    HighQualityZsl,
    HighSpeed,
    Video,
}

impl OperatingMode {
    /// Shutter notifications are only produced in the high-quality modes
    pub fn has_shutter_events(&self) -> bool {
        matches!(self, OperatingMode::HighQuality | OperatingMode::HighQualityZsl)
    }
}

/// Raw user-facing capture parameters; absent values fall back to defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureParameters {
    #[serde(default)]
    pub picture_size: Option<(u32, u32)>,
    #[serde(default)]
    pub picture_format: Option<String>,
    #[serde(default)]
    pub rotation: Option<i32>,
    #[serde(default)]
    pub sensor_orientation: Option<i32>,
    #[serde(default)]
    pub burst: Option<i32>,
    #[serde(default)]
    pub jpeg_quality: Option<i32>,
    #[serde(default)]
    pub thumbnail_width: Option<i32>,
    #[serde(default)]
    pub thumbnail_height: Option<i32>,
    #[serde(default)]
    pub thumbnail_quality: Option<i32>,
    #[serde(default)]
    pub exposure_bracketing_range: Option<String>,
}

/// Capture configuration record consumed by the capture lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub coding: CodingMode,
    pub rotation: u32,
    pub sensor_orientation: u32,
    pub burst_frames: usize,
    pub quality: u32,
    pub thumb_width: u32,
    pub thumb_height: u32,
    pub thumb_quality: u32,
    pub exposure: ExposureList,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            pixel_format: PixelFormat::Coded,
            coding: CodingMode::None,
            rotation: 0,
            sensor_orientation: 0,
            burst_frames: 1,
            quality: MAX_JPEG_QUALITY as u32,
            thumb_width: DEFAULT_THUMB_WIDTH,
            thumb_height: DEFAULT_THUMB_HEIGHT,
            thumb_quality: MAX_JPEG_QUALITY as u32,
            exposure: ExposureList::new(),
        }
    }
}

impl CaptureSettings {
    /// Fold `params` into the settings.
    ///
    /// Returns `true` when the picture size or colour format changed and the
    /// image port definition must be sent again.
    pub fn apply(&mut self, params: &CaptureParameters, mode: OperatingMode) -> bool {
        let mut port_changed = false;

        let (width, height) = params.picture_size.unwrap_or((self.width, self.height));
        if width != self.width || height != self.height {
            port_changed = true;
        }
        self.width = width;
        self.height = height;
        debug!("Image: {}x{}", self.width, self.height);

        let pixel_format = match params.picture_format.as_deref() {
            Some(name) => match self.parse_format(name) {
                Some(format) => format,
                None => {
                    warn!("Invalid picture format {:?}, defaulting to JPEG", name);
                    PixelFormat::Coded
                }
            },
            None => {
                warn!("Picture format missing, defaulting to JPEG");
                PixelFormat::Coded
            }
        };
        if pixel_format != self.pixel_format {
            port_changed = true;
            self.pixel_format = pixel_format;
        }

        self.exposure = params
            .exposure_bracketing_range
            .as_deref()
            .map(ExposureList::parse)
            .unwrap_or_default();

        // -1 means unset; other angles are normalized into 0..360
        self.rotation = match params.rotation {
            None | Some(-1) => 0,
            Some(r) => r.rem_euclid(360) as u32,
        };
        self.sensor_orientation = sensor_orientation(params.sensor_orientation, mode);

        self.burst_frames = match params.burst {
            Some(n) if n >= 1 => n as usize,
            _ => 1,
        };

        self.quality = clamp_quality(params.jpeg_quality);
        self.thumb_width = thumb_dimension(params.thumbnail_width, DEFAULT_THUMB_WIDTH);
        self.thumb_height = thumb_dimension(params.thumbnail_height, DEFAULT_THUMB_HEIGHT);
        self.thumb_quality = clamp_quality(params.thumbnail_quality);

        debug!(
            "Capture settings: rotation {}, sensor orientation {}, burst {}, quality {}, thumbnail {}x{} q{}",
            self.rotation,
            self.sensor_orientation,
            self.burst_frames,
            self.quality,
            self.thumb_width,
            self.thumb_height,
            self.thumb_quality
        );

        port_changed
    }

    fn parse_format(&mut self, name: &str) -> Option<PixelFormat> {
        let format = match name {
            formats::YUV422I => PixelFormat::CbYCrY,
            formats::YUV420SP => PixelFormat::Yuv420SemiPlanar,
            formats::RGB565 => PixelFormat::Rgb565,
            formats::RAW => PixelFormat::RawBayer10,
            formats::JPEG => {
                self.coding = CodingMode::None;
                PixelFormat::Coded
            }
            formats::JPS => {
                self.coding = CodingMode::Jps;
                PixelFormat::Coded
            }
            formats::MPO => {
                self.coding = CodingMode::Mpo;
                PixelFormat::Coded
            }
            formats::RAW_JPEG => {
                self.coding = CodingMode::RawJpeg;
                PixelFormat::Coded
            }
            formats::RAW_MPO => {
                self.coding = CodingMode::RawMpo;
                PixelFormat::Coded
            }
            _ => return None,
        };
        Some(format)
    }
}

/// Out-of-range qualities clamp to the maximum, not the nearest bound
fn clamp_quality(value: Option<i32>) -> u32 {
    match value {
        Some(q) if (MIN_JPEG_QUALITY..=MAX_JPEG_QUALITY).contains(&q) => q as u32,
        _ => MAX_JPEG_QUALITY as u32,
    }
}

fn thumb_dimension(value: Option<i32>, default: u32) -> u32 {
    match value {
        Some(v) if v >= 0 => v as u32,
        _ => default,
    }
}

/// The sensor is mounted inverted; 90/270 get counter-rotated in video mode
fn sensor_orientation(value: Option<i32>, mode: OperatingMode) -> u32 {
    match value {
        Some(degrees) if degrees != -1 && mode == OperatingMode::Video => {
            let degrees = if degrees == 90 || degrees == 270 {
                warn!("Sensor orientation {} counter-rotated by 180", degrees);
                (degrees + 180) % 360
            } else {
                degrees
            };
            degrees.max(0) as u32
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> CaptureParameters {
        CaptureParameters {
            picture_size: Some((2592, 1944)),
            picture_format: Some(formats::JPEG.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_rotation_unset_and_negative_angles() {
        let mut settings = CaptureSettings::default();
        let mut p = params();

        p.rotation = Some(-1);
        settings.apply(&p, OperatingMode::HighQuality);
        assert_eq!(settings.rotation, 0);

        p.rotation = Some(90);
        settings.apply(&p, OperatingMode::HighQuality);
        assert_eq!(settings.rotation, 90);

        p.rotation = Some(-90);
        settings.apply(&p, OperatingMode::HighQuality);
        assert_eq!(settings.rotation, 270);

        p.rotation = None;
        settings.apply(&p, OperatingMode::HighQuality);
        assert_eq!(settings.rotation, 0);
    }

    #[test]
    fn test_sensor_orientation_only_corrected_in_video_mode() {
        let mut settings = CaptureSettings::default();
        let mut p = params();
        p.sensor_orientation = Some(90);

        settings.apply(&p, OperatingMode::Video);
        assert_eq!(settings.sensor_orientation, 270);

        settings.apply(&p, OperatingMode::HighQuality);
        assert_eq!(settings.sensor_orientation, 0);

        p.sensor_orientation = Some(270);
        settings.apply(&p, OperatingMode::Video);
        assert_eq!(settings.sensor_orientation, 90);

        p.sensor_orientation = Some(180);
        settings.apply(&p, OperatingMode::Video);
        assert_eq!(settings.sensor_orientation, 180);
    }

    #[test]
    fn test_quality_clamps_to_maximum() {
        let mut settings = CaptureSettings::default();
        let mut p = params();

        p.jpeg_quality = Some(0);
        p.thumbnail_quality = Some(150);
        settings.apply(&p, OperatingMode::HighQuality);
        assert_eq!(settings.quality, 100);
        assert_eq!(settings.thumb_quality, 100);

        p.jpeg_quality = Some(85);
        p.thumbnail_quality = Some(1);
        settings.apply(&p, OperatingMode::HighQuality);
        assert_eq!(settings.quality, 85);
        assert_eq!(settings.thumb_quality, 1);
    }

    #[test]
    fn test_thumbnail_and_burst_defaults() {
        let mut settings = CaptureSettings::default();
        let mut p = params();
        p.thumbnail_width = Some(-1);
        p.thumbnail_height = Some(0);
        p.burst = Some(0);

        settings.apply(&p, OperatingMode::HighQuality);
        assert_eq!(settings.thumb_width, DEFAULT_THUMB_WIDTH);
        assert_eq!(settings.thumb_height, 0);
        assert_eq!(settings.burst_frames, 1);

        p.burst = Some(5);
        settings.apply(&p, OperatingMode::HighQuality);
        assert_eq!(settings.burst_frames, 5);
    }

    #[test]
    fn test_port_change_detection() {
        let mut settings = CaptureSettings::default();
        assert!(settings.apply(&params(), OperatingMode::HighQuality));
        assert!(!settings.apply(&params(), OperatingMode::HighQuality));

        let mut p = params();
        p.picture_format = Some(formats::YUV422I.to_string());
        assert!(settings.apply(&p, OperatingMode::HighQuality));
        assert_eq!(settings.pixel_format, PixelFormat::CbYCrY);
    }

    #[test]
    fn test_coded_formats_select_coding_mode() {
        let mut settings = CaptureSettings::default();
        let mut p = params();

        p.picture_format = Some(formats::RAW_MPO.to_string());
        settings.apply(&p, OperatingMode::HighQuality);
        assert_eq!(settings.pixel_format, PixelFormat::Coded);
        assert_eq!(settings.coding, CodingMode::RawMpo);

        p.picture_format = Some("bogus".to_string());
        settings.apply(&p, OperatingMode::HighQuality);
        assert_eq!(settings.pixel_format, PixelFormat::Coded);
        assert_eq!(settings.coding, CodingMode::RawMpo);

        p.picture_format = Some(formats::RAW.to_string());
        settings.apply(&p, OperatingMode::HighQuality);
        assert_eq!(settings.pixel_format, PixelFormat::RawBayer10);
    }

    #[test]
    fn test_exposure_range_parsed() {
        let mut settings = CaptureSettings::default();
        let mut p = params();
        p.exposure_bracketing_range = Some("-20,0,20".to_string());

        settings.apply(&p, OperatingMode::HighQuality);
        assert_eq!(settings.exposure.as_slice(), &[-20, 0, 20]);

        p.exposure_bracketing_range = None;
        settings.apply(&p, OperatingMode::HighQuality);
        assert!(settings.exposure.is_empty());
    }
}
