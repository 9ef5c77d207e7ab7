mod bracketing;
mod core;

pub use self::core::{CaptureState, CaptureStats, CaptureTimeouts, ImageCapture, ImageCaptureBuilder};
