//! Seams to the collaborators around the capture core: frame delivery
//! downstream and the 3A (auto-exposure/focus/white-balance) lock manager.

use crate::error::Result;
use crate::frame::CaptureFrame;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Receives completed capture buffers. Fire-and-forget.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: CaptureFrame);
}

/// Forwards frames into an unbounded channel
pub struct ChannelFrameSink {
    sender: mpsc::UnboundedSender<CaptureFrame>,
}

impl ChannelFrameSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CaptureFrame>) {
        let (sender, rx) = mpsc::unbounded_channel();
        (Self { sender }, rx)
    }
}

impl FrameSink for ChannelFrameSink {
    fn send_frame(&self, frame: CaptureFrame) {
        let index = frame.index;
        if self.sender.send(frame).is_err() {
            warn!("Frame receiver dropped; discarding frame from buffer {}", index);
        }
    }
}

/// Pending 3A settings and lock release
#[async_trait]
pub trait ThreeAControl: Send + Sync {
    /// Whether settings changed since they were last applied
    fn has_pending(&self) -> bool;

    async fn apply_pending(&self) -> Result<()>;

    async fn release_locks(&self) -> Result<()>;
}

/// 3A control that records calls and never fails
#[derive(Default)]
pub struct PassiveThreeA {
    pending: AtomicBool,
    applied: AtomicUsize,
    released: AtomicUsize,
}

impl PassiveThreeA {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_pending(&self) {
        self.pending.store(true, Ordering::Relaxed);
    }

    pub fn applied_count(&self) -> usize {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn released_count(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ThreeAControl for PassiveThreeA {
    fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Relaxed)
    }

    async fn apply_pending(&self) -> Result<()> {
        debug!("Applying pending 3A settings");
        self.pending.store(false, Ordering::Relaxed);
        self.applied.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn release_locks(&self) -> Result<()> {
        self.released.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameType, ImageBuffer};

    #[tokio::test]
    async fn test_channel_sink_forwards_frames() {
        let (sink, mut rx) = ChannelFrameSink::new();
        sink.send_frame(CaptureFrame::new(
            2,
            ImageBuffer::new(2, 8),
            FrameType::ImageFrame,
            4,
            2,
        ));

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.index, 2);
    }

    #[tokio::test]
    async fn test_passive_three_a_clears_pending() {
        let three_a = PassiveThreeA::new();
        three_a.mark_pending();
        assert!(three_a.has_pending());

        three_a.apply_pending().await.unwrap();
        assert!(!three_a.has_pending());
        assert_eq!(three_a.applied_count(), 1);
    }
}
