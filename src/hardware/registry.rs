use super::EventKind;
use crate::sync::EventSignal;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace, warn};

struct Registration {
    kind: EventKind,
    signal: Arc<EventSignal>,
}

/// Pending event registrations.
///
/// The capture core arms a registration before issuing the request that
/// produces the event; the component's notification thread calls
/// [`EventRegistry::dispatch`] when it fires. Each registration releases
/// its signal at most once.
#[derive(Default)]
pub struct EventRegistry {
    pending: Mutex<Vec<Registration>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: EventKind, signal: Arc<EventSignal>) {
        debug!("Registering {} for {}", signal.name(), kind);
        self.pending.lock().push(Registration { kind, signal });
    }

    /// Deliver an event from the component. Returns whether a waiter was armed.
    pub fn dispatch(&self, kind: EventKind) -> bool {
        match self.take(kind) {
            Some(signal) => {
                trace!("Event {} releases {}", kind, signal.name());
                signal.signal();
                true
            }
            None => {
                trace!("Unsolicited event {}", kind);
                false
            }
        }
    }

    /// Release a registration whose event never arrived so nothing stays
    /// blocked on it. Returns whether a registration was still pending.
    pub fn force_signal(&self, kind: EventKind) -> bool {
        match self.take(kind) {
            Some(signal) => {
                warn!("Force-signaling {} for {}", signal.name(), kind);
                signal.signal();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, kind: EventKind) -> bool {
        self.pending.lock().iter().any(|r| r.kind == kind)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn take(&self, kind: EventKind) -> Option<Arc<EventSignal>> {
        let mut pending = self.pending.lock();
        let position = pending.iter().position(|r| r.kind == kind)?;
        Some(pending.remove(position).signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{Command, ConfigIndex, PortIndex};

    fn enable_event() -> EventKind {
        EventKind::CommandComplete {
            command: Command::PortEnable,
            port: PortIndex::IMAGE_OUT,
        }
    }

    #[test]
    fn test_dispatch_releases_matching_registration_once() {
        let registry = EventRegistry::new();
        let signal = Arc::new(EventSignal::new("enable"));
        registry.register(enable_event(), Arc::clone(&signal));

        assert!(registry.dispatch(enable_event()));
        assert_eq!(signal.count(), 1);

        assert!(!registry.dispatch(enable_event()));
        assert_eq!(signal.count(), 1);
    }

    #[test]
    fn test_dispatch_ignores_other_kinds() {
        let registry = EventRegistry::new();
        let signal = Arc::new(EventSignal::new("enable"));
        registry.register(enable_event(), Arc::clone(&signal));

        let shutter = EventKind::SettingChanged {
            port: PortIndex::ALL,
            index: ConfigIndex::ShutterCallback,
        };
        assert!(!registry.dispatch(shutter));
        assert_eq!(signal.count(), 0);
        assert!(registry.is_pending(enable_event()));
    }

    #[test]
    fn test_force_signal_consumes_registration() {
        let registry = EventRegistry::new();
        let signal = Arc::new(EventSignal::new("enable"));
        registry.register(enable_event(), Arc::clone(&signal));

        assert!(registry.force_signal(enable_event()));
        assert_eq!(signal.count(), 1);
        assert_eq!(registry.pending_count(), 0);

        // A late hardware event no longer finds anything to release
        assert!(!registry.dispatch(enable_event()));
        assert_eq!(signal.count(), 1);
    }
}
