use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;

/// Colour format programmed on the image port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Packed YUV 4:2:2 (CbYCrY ordering)
    CbYCrY,
    /// Semi-planar YUV 4:2:0
    Yuv420SemiPlanar,
    /// 16-bit RGB 5:6:5
    Rgb565,
    /// 10-bit raw Bayer
    RawBayer10,
    /// No colour format: the port emits a coded bitstream
    Coded,
}

impl PixelFormat {
    /// Bytes per pixel used for the port stride
    pub fn bytes_per_pixel(&self) -> usize {
        2
    }

    pub fn is_coded(&self) -> bool {
        matches!(self, PixelFormat::Coded)
    }
}

/// Container the hardware encoder wraps coded output in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodingMode {
    /// Plain JPEG
    None,
    /// Stereo JPEG
    Jps,
    /// Multi-picture object
    Mpo,
    /// Raw plus JPEG
    RawJpeg,
    /// Raw plus MPO
    RawMpo,
}

/// Kind of frame a completed capture buffer carries downstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    /// Coded or processed still image
    ImageFrame,
    /// Raw sensor data
    RawFrame,
}

impl FrameType {
    pub fn for_format(format: PixelFormat) -> Self {
        match format {
            PixelFormat::RawBayer10 => FrameType::RawFrame,
            _ => FrameType::ImageFrame,
        }
    }
}

/// Backing memory for one capture buffer.
///
/// Cloning shares the same memory; the hardware writes into it while the
/// buffer is queued and consumers read it once it is ready.
#[derive(Debug, Clone)]
pub struct ImageBuffer {
    id: u64,
    data: Arc<Mutex<Vec<u8>>>,
}

impl ImageBuffer {
    pub fn new(id: u64, capacity: usize) -> Self {
        Self {
            id,
            data: Arc::new(Mutex::new(Vec::with_capacity(capacity))),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of valid bytes currently held
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.lock().capacity()
    }

    /// Replace the buffer contents
    pub fn write(&self, bytes: &[u8]) {
        let mut data = self.data.lock();
        data.clear();
        data.extend_from_slice(bytes);
    }

    /// Copy of the current contents
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Whether two handles refer to the same memory
    pub fn shares_memory(&self, other: &ImageBuffer) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

/// Frame descriptor handed to the downstream delivery path
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    /// Buffer index on the capture port
    pub index: usize,
    pub buffer: ImageBuffer,
    pub frame_type: FrameType,
    pub width: u32,
    pub height: u32,
    /// Valid bytes in `buffer` at dispatch time
    pub length: usize,
    pub timestamp: SystemTime,
}

impl CaptureFrame {
    pub fn new(index: usize, buffer: ImageBuffer, frame_type: FrameType, width: u32, height: u32) -> Self {
        let length = buffer.len();
        Self {
            index,
            buffer,
            frame_type,
            width,
            height,
            length,
            timestamp: SystemTime::now(),
        }
    }

    /// Get frame age in milliseconds
    pub fn age_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(self.timestamp)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_format_yields_raw_frames() {
        assert_eq!(FrameType::for_format(PixelFormat::RawBayer10), FrameType::RawFrame);
        assert_eq!(FrameType::for_format(PixelFormat::Coded), FrameType::ImageFrame);
        assert_eq!(FrameType::for_format(PixelFormat::CbYCrY), FrameType::ImageFrame);
    }

    #[test]
    fn test_buffer_clones_share_memory() {
        let buffer = ImageBuffer::new(7, 64);
        let alias = buffer.clone();
        alias.write(&[1, 2, 3]);

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.to_vec(), vec![1, 2, 3]);
        assert!(buffer.shares_memory(&alias));
        assert!(!buffer.shares_memory(&ImageBuffer::new(8, 64)));
    }

    #[test]
    fn test_frame_captures_length_at_dispatch() {
        let buffer = ImageBuffer::new(1, 16);
        buffer.write(&[0u8; 12]);
        let frame = CaptureFrame::new(0, buffer.clone(), FrameType::ImageFrame, 4, 3);
        buffer.write(&[0u8; 2]);

        assert_eq!(frame.length, 12);
        assert_eq!(frame.index, 0);
    }
}
