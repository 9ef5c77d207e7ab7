use super::core::{CaptureState, ImageCapture};
use crate::buffers::BufferOwner;
use crate::error::{CaptureError, Result};
use crate::events::CaptureEvent;
use crate::hardware::ComponentState;
use tracing::{debug, error, info, warn};

impl ImageCapture {
    /// Start continuous bracketed capture over every provisioned buffer.
    ///
    /// Returns immediately when bracketing is already running. `range` is the
    /// number of frames a later plain capture request should still deliver.
    pub async fn start_bracketing(&self, range: usize) -> Result<()> {
        if self.component.state() != ComponentState::Executing {
            error!("Image component is not in executing state");
            return Err(CaptureError::not_ready("image component not executing"));
        }

        if self.ring.is_enabled() {
            debug!("Bracketing already enabled");
            return Ok(());
        }

        let buffer_count = self.pool.len();
        if buffer_count == 0 {
            error!("Image capture buffers set to 0");
            return Err(CaptureError::invalid_argument(
                "bracketing needs provisioned capture buffers",
            ));
        }

        if self.three_a.has_pending() {
            if let Err(e) = self.three_a.apply_pending().await {
                warn!("Applying pending 3A settings failed: {}", e);
            }
        }

        self.ring.arm(buffer_count, range)?;

        let result = self.start_capture().await;
        self.ring.activate(result.is_ok());

        match result {
            Ok(()) => {
                self.set_state(CaptureState::Bracketing);
                info!(
                    "Bracketing started over {} buffers (range {})",
                    buffer_count, range
                );
                self.bus
                    .publish(CaptureEvent::BracketingStarted { buffer_count });
                Ok(())
            }
            Err(e) => {
                error!("Starting bracketed capture failed: {}", e);
                Err(e)
            }
        }
    }

    /// Stop bracketing and tear the capture down. A no-op when not running.
    pub async fn stop_bracketing(&self) -> Result<()> {
        if !self.ring.disable() {
            return Ok(());
        }

        let result = self.stop_capture().await;
        self.ring.reset();
        info!("Bracketing stopped");
        self.bus.publish(CaptureEvent::BracketingStopped);
        result
    }

    /// Completion path while bracketing: rotate the ring and re-arm the next
    /// buffer once nothing else is in flight.
    pub(super) async fn do_bracketing(&self, index: usize) -> Result<()> {
        if self.component.state() != ComponentState::Executing {
            error!("Image component is not in executing state");
            return Err(CaptureError::not_ready("image component not executing"));
        }

        let next = self.ring.complete(index)?;
        self.pool.set_owner(index, BufferOwner::ReadyForConsumer)?;

        match next {
            Some(next) => {
                debug!("Re-arming bracketing buffer {}", next);
                self.pool.queue(next).await
            }
            None => Ok(()),
        }
    }

    /// Hand the frames held by the ring downstream, in ring order
    pub(super) fn send_bracket_frames(&self, indices: &[usize]) -> Result<()> {
        let mut first_error = None;
        for &index in indices {
            if let Err(e) = self.deliver(index) {
                error!("Delivering bracketed frame {} failed: {}", index, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
