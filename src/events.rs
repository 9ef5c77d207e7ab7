use serde::Serialize;
use std::time::SystemTime;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Notifications published by the capture core
#[derive(Debug, Clone, Serialize)]
pub enum CaptureEvent {
    /// Buffers are registered and the capture port is enabled
    BuffersReady { session: String, buffer_count: usize },
    /// The exposure physically happened
    Shutter { timestamp: SystemTime },
    /// Capturing was enabled on the hardware
    CaptureStarted { session: String },
    /// A filled buffer was handed downstream
    FrameDelivered { index: usize, length: usize },
    /// Capture teardown finished (successfully or not)
    CaptureStopped { session: String, clean: bool },
    /// Capture buffers were released back to their owner
    BuffersReleased,
    BracketingStarted { buffer_count: usize },
    BracketingStopped,
}

impl CaptureEvent {
    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            CaptureEvent::BuffersReady {
                session,
                buffer_count,
            } => format!("Session {} ready with {} buffers", session, buffer_count),
            CaptureEvent::Shutter { .. } => "Shutter".to_string(),
            CaptureEvent::CaptureStarted { session } => format!("Capture started: {}", session),
            CaptureEvent::FrameDelivered { index, length } => {
                format!("Frame from buffer {} delivered ({} bytes)", index, length)
            }
            CaptureEvent::CaptureStopped { session, clean } => {
                format!("Capture stopped: {} (clean: {})", session, clean)
            }
            CaptureEvent::BuffersReleased => "Buffers released".to_string(),
            CaptureEvent::BracketingStarted { buffer_count } => {
                format!("Bracketing started over {} buffers", buffer_count)
            }
            CaptureEvent::BracketingStopped => "Bracketing stopped".to_string(),
        }
    }
}

/// Broadcast bus for capture notifications (shutter subscribers and friends)
pub struct EventBus {
    sender: broadcast::Sender<CaptureEvent>,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events and get a receiver
    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers; returns how many received it
    pub fn publish(&self, event: CaptureEvent) -> usize {
        match &event {
            CaptureEvent::Shutter { .. } => info!("Shutter callback received"),
            CaptureEvent::CaptureStopped { clean: false, session } => {
                warn!("Capture {} stopped with errors", session)
            }
            _ => debug!("Event: {}", event.description()),
        }

        // No subscribers is not an error for fire-and-forget notifications
        self.sender.send(event).unwrap_or(0)
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        assert_eq!(bus.publish(CaptureEvent::BuffersReleased), 1);
        assert!(matches!(rx.recv().await.unwrap(), CaptureEvent::BuffersReleased));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(8);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(CaptureEvent::BracketingStopped), 0);
    }
}
