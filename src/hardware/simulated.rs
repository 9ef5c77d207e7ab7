use super::{
    BufferHandle, Command, ComponentState, ConfigIndex, ConfigPayload, EventKind, EventRegistry,
    HwResult, ImageComponent, PortFormat, PortIndex,
};
use crate::error::HardwareStatus;
use crate::frame::ImageBuffer;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Scriptable behaviour of the [`SimulatedComponent`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorBehavior {
    /// Complete port enable once every expected buffer is registered
    #[serde(default = "default_true")]
    pub ack_port_enable: bool,

    /// Complete port disable once every buffer is freed
    #[serde(default = "default_true")]
    pub ack_port_disable: bool,

    /// Fire the shutter notification when capturing starts
    #[serde(default = "default_true")]
    pub fire_shutter: bool,

    /// Fill queued buffers (up to the frame limit) when capturing starts
    #[serde(default = "default_true")]
    pub auto_complete: bool,

    /// Bytes written into each filled buffer
    #[serde(default = "default_fill_bytes")]
    pub fill_bytes: usize,

    /// Reject every `set_config`/`set_port_format` for this index
    #[serde(default)]
    pub fail_config: Option<ConfigIndex>,

    /// Reject `free_buffer` for these buffer indices
    #[serde(default)]
    pub fail_free: Vec<usize>,

    /// Reject every `fill_buffer`
    #[serde(default)]
    pub fail_fill: bool,

    /// Reject `PortDisable` commands
    #[serde(default)]
    pub fail_port_disable: bool,
}

fn default_true() -> bool {
    true
}
fn default_fill_bytes() -> usize {
    4096
}

impl Default for SimulatorBehavior {
    fn default() -> Self {
        Self {
            ack_port_enable: true,
            ack_port_disable: true,
            fire_shutter: true,
            auto_complete: true,
            fill_bytes: default_fill_bytes(),
            fail_config: None,
            fail_free: Vec::new(),
            fail_fill: false,
            fail_port_disable: false,
        }
    }
}

/// Every request the simulator received, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareCall {
    SetPortFormat(PortFormat),
    SetConfig(ConfigPayload),
    SendCommand(Command, PortIndex),
    UseBuffer(usize),
    FreeBuffer(usize),
    FillBuffer(usize),
}

struct SimState {
    component_state: ComponentState,
    expected_buffers: usize,
    registered: BTreeMap<usize, ImageBuffer>,
    enable_pending: bool,
    disable_pending: bool,
    queued: VecDeque<usize>,
    capturing: bool,
    shutter_enabled: bool,
    frame_limit: Option<usize>,
}

/// In-process stand-in for the image component.
///
/// Port commands complete the way the real component sequences them:
/// enable completes after the last expected buffer is registered, disable
/// after the last buffer is freed. Filled buffers are reported on the
/// completion channel returned by [`SimulatedComponent::new`].
pub struct SimulatedComponent {
    registry: Arc<EventRegistry>,
    behavior: Mutex<SimulatorBehavior>,
    state: Mutex<SimState>,
    calls: Mutex<Vec<HardwareCall>>,
    completions: mpsc::UnboundedSender<usize>,
    next_token: AtomicU64,
}

impl SimulatedComponent {
    pub fn new(
        registry: Arc<EventRegistry>,
        behavior: SimulatorBehavior,
    ) -> (Self, mpsc::UnboundedReceiver<usize>) {
        let (completions, rx) = mpsc::unbounded_channel();
        let component = Self {
            registry,
            behavior: Mutex::new(behavior),
            state: Mutex::new(SimState {
                component_state: ComponentState::Executing,
                expected_buffers: 0,
                registered: BTreeMap::new(),
                enable_pending: false,
                disable_pending: false,
                queued: VecDeque::new(),
                capturing: false,
                shutter_enabled: false,
                frame_limit: None,
            }),
            calls: Mutex::new(Vec::new()),
            completions,
            next_token: AtomicU64::new(1),
        };
        (component, rx)
    }

    pub fn set_component_state(&self, state: ComponentState) {
        self.state.lock().component_state = state;
    }

    pub fn update_behavior(&self, update: impl FnOnce(&mut SimulatorBehavior)) {
        update(&mut self.behavior.lock());
    }

    pub fn calls(&self) -> Vec<HardwareCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Buffer indices currently queued for filling, oldest first
    pub fn queued(&self) -> Vec<usize> {
        self.state.lock().queued.iter().copied().collect()
    }

    pub fn registered_count(&self) -> usize {
        self.state.lock().registered.len()
    }

    pub fn is_capturing(&self) -> bool {
        self.state.lock().capturing
    }

    /// Fill the oldest queued buffer and report it. Returns its index.
    pub fn complete_next(&self) -> Option<usize> {
        let fill_bytes = self.behavior.lock().fill_bytes;
        let (index, memory) = {
            let mut state = self.state.lock();
            let index = state.queued.pop_front()?;
            (index, state.registered.get(&index).cloned())
        };

        if let Some(memory) = memory {
            let pattern: Vec<u8> = (0..fill_bytes).map(|i| (i + index) as u8).collect();
            memory.write(&pattern);
        }

        trace!("Simulated fill done on buffer {}", index);
        if self.completions.send(index).is_err() {
            debug!("Completion for buffer {} dropped: receiver closed", index);
        }
        Some(index)
    }

    /// Fire the shutter notification regardless of behaviour switches
    pub fn fire_shutter(&self) -> bool {
        self.registry.dispatch(EventKind::SettingChanged {
            port: PortIndex::ALL,
            index: ConfigIndex::ShutterCallback,
        })
    }

    fn record(&self, call: HardwareCall) {
        self.calls.lock().push(call);
    }

    fn check_config(&self, index: ConfigIndex) -> HwResult<()> {
        if self.behavior.lock().fail_config == Some(index) {
            debug!("Simulator rejecting {:?}", index);
            return Err(HardwareStatus::BAD_PARAMETER);
        }
        Ok(())
    }

    fn maybe_complete_enable(&self, port: PortIndex) {
        let ack = self.behavior.lock().ack_port_enable;
        let done = {
            let mut state = self.state.lock();
            let ready = state.enable_pending && state.registered.len() >= state.expected_buffers;
            if ready && ack {
                state.enable_pending = false;
            }
            ready && ack
        };
        if done {
            self.registry.dispatch(EventKind::CommandComplete {
                command: Command::PortEnable,
                port,
            });
        }
    }

    fn maybe_complete_disable(&self, port: PortIndex) {
        let ack = self.behavior.lock().ack_port_disable;
        let done = {
            let mut state = self.state.lock();
            let ready = state.disable_pending && state.registered.is_empty();
            if ready && ack {
                state.disable_pending = false;
            }
            ready && ack
        };
        if done {
            self.registry.dispatch(EventKind::CommandComplete {
                command: Command::PortDisable,
                port,
            });
        }
    }

    fn start_capturing(&self) {
        let behavior = self.behavior.lock().clone();
        let (fire_shutter, burst) = {
            let mut state = self.state.lock();
            state.capturing = true;
            let burst = state
                .frame_limit
                .unwrap_or(state.queued.len())
                .min(state.queued.len());
            (state.shutter_enabled && behavior.fire_shutter, burst)
        };

        if fire_shutter {
            self.fire_shutter();
        }

        if behavior.auto_complete {
            for _ in 0..burst {
                self.complete_next();
            }
        }
    }
}

#[async_trait]
impl ImageComponent for SimulatedComponent {
    fn state(&self) -> ComponentState {
        self.state.lock().component_state
    }

    async fn set_port_format(&self, _port: PortIndex, format: &PortFormat) -> HwResult<usize> {
        self.record(HardwareCall::SetPortFormat(format.clone()));
        self.check_config(ConfigIndex::PortDefinition)?;

        self.state.lock().expected_buffers = format.buffer_count;
        Ok(format.width as usize * format.height as usize * format.stride as usize)
    }

    async fn set_config(&self, config: ConfigPayload) -> HwResult<()> {
        self.record(HardwareCall::SetConfig(config.clone()));
        self.check_config(config.index())?;

        match config {
            ConfigPayload::Capturing(true) => self.start_capturing(),
            ConfigPayload::Capturing(false) => self.state.lock().capturing = false,
            ConfigPayload::CallbackRequest {
                index: ConfigIndex::ShutterCallback,
                enable,
            } => self.state.lock().shutter_enabled = enable,
            ConfigPayload::CaptureMode {
                frame_limited,
                frame_limit,
                ..
            } => {
                self.state.lock().frame_limit = frame_limited.then_some(frame_limit);
            }
            _ => {}
        }
        Ok(())
    }

    async fn send_command(&self, command: Command, port: PortIndex) -> HwResult<()> {
        self.record(HardwareCall::SendCommand(command, port));

        match command {
            Command::PortEnable => {
                self.state.lock().enable_pending = true;
                self.maybe_complete_enable(port);
            }
            Command::PortDisable => {
                if self.behavior.lock().fail_port_disable {
                    return Err(HardwareStatus::INCORRECT_STATE);
                }
                self.state.lock().disable_pending = true;
                self.maybe_complete_disable(port);
            }
        }
        Ok(())
    }

    async fn use_buffer(
        &self,
        port: PortIndex,
        index: usize,
        memory: ImageBuffer,
    ) -> HwResult<BufferHandle> {
        self.record(HardwareCall::UseBuffer(index));

        self.state.lock().registered.insert(index, memory);
        let handle = BufferHandle {
            index,
            token: self.next_token.fetch_add(1, Ordering::Relaxed),
        };

        self.maybe_complete_enable(port);
        Ok(handle)
    }

    async fn free_buffer(&self, port: PortIndex, handle: BufferHandle) -> HwResult<()> {
        self.record(HardwareCall::FreeBuffer(handle.index));

        if self.behavior.lock().fail_free.contains(&handle.index) {
            return Err(HardwareStatus::INCORRECT_STATE);
        }

        {
            let mut state = self.state.lock();
            state.registered.remove(&handle.index);
            state.queued.retain(|&i| i != handle.index);
        }

        self.maybe_complete_disable(port);
        Ok(())
    }

    async fn fill_buffer(&self, handle: BufferHandle) -> HwResult<()> {
        self.record(HardwareCall::FillBuffer(handle.index));

        if self.behavior.lock().fail_fill {
            return Err(HardwareStatus::UNDEFINED);
        }

        let mut state = self.state.lock();
        if !state.registered.contains_key(&handle.index) {
            return Err(HardwareStatus::BAD_PARAMETER);
        }
        state.queued.push_back(handle.index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use crate::sync::EventSignal;

    fn format(count: usize) -> PortFormat {
        PortFormat {
            width: 8,
            height: 4,
            color_format: PixelFormat::CbYCrY,
            stride: 2,
            buffer_count: count,
        }
    }

    #[tokio::test]
    async fn test_port_enable_completes_after_last_buffer() {
        let registry = Arc::new(EventRegistry::new());
        let (sim, _rx) = SimulatedComponent::new(Arc::clone(&registry), SimulatorBehavior::default());
        let signal = Arc::new(EventSignal::new("enable"));
        let port = PortIndex::IMAGE_OUT;

        assert_eq!(sim.set_port_format(port, &format(2)).await.unwrap(), 64);
        registry.register(
            EventKind::CommandComplete {
                command: Command::PortEnable,
                port,
            },
            Arc::clone(&signal),
        );
        sim.send_command(Command::PortEnable, port).await.unwrap();
        sim.use_buffer(port, 0, ImageBuffer::new(0, 64)).await.unwrap();
        assert_eq!(signal.count(), 0);

        sim.use_buffer(port, 1, ImageBuffer::new(1, 64)).await.unwrap();
        assert_eq!(signal.count(), 1);
    }

    #[tokio::test]
    async fn test_complete_next_reports_oldest_queued() {
        let registry = Arc::new(EventRegistry::new());
        let (sim, mut rx) = SimulatedComponent::new(registry, SimulatorBehavior::default());
        let port = PortIndex::IMAGE_OUT;
        let memory = ImageBuffer::new(0, 16);

        let handle = sim.use_buffer(port, 0, memory.clone()).await.unwrap();
        sim.fill_buffer(handle).await.unwrap();

        assert_eq!(sim.complete_next(), Some(0));
        assert_eq!(rx.recv().await, Some(0));
        assert_eq!(memory.len(), 4096);
        assert_eq!(sim.complete_next(), None);
    }

    #[tokio::test]
    async fn test_complete_next_without_receiver() {
        let registry = Arc::new(EventRegistry::new());
        let (sim, rx) = SimulatedComponent::new(registry, SimulatorBehavior::default());
        drop(rx);

        let handle = sim
            .use_buffer(PortIndex::IMAGE_OUT, 0, ImageBuffer::new(0, 16))
            .await
            .unwrap();
        sim.fill_buffer(handle).await.unwrap();

        assert_eq!(sim.complete_next(), Some(0));
        assert!(sim.queued().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_port_disable() {
        let registry = Arc::new(EventRegistry::new());
        let behavior = SimulatorBehavior {
            fail_port_disable: true,
            ..Default::default()
        };
        let (sim, _rx) = SimulatedComponent::new(registry, behavior);

        let result = sim
            .send_command(Command::PortDisable, PortIndex::IMAGE_OUT)
            .await;
        assert_eq!(result, Err(HardwareStatus::INCORRECT_STATE));
        assert!(sim.send_command(Command::PortEnable, PortIndex::IMAGE_OUT).await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_config_failure() {
        let registry = Arc::new(EventRegistry::new());
        let behavior = SimulatorBehavior {
            fail_config: Some(ConfigIndex::ImageQuality),
            ..Default::default()
        };
        let (sim, _rx) = SimulatedComponent::new(registry, behavior);

        let result = sim
            .set_config(ConfigPayload::ImageQuality {
                port: PortIndex::IMAGE_OUT,
                quality: 90,
            })
            .await;
        assert_eq!(result, Err(HardwareStatus::BAD_PARAMETER));
        assert_eq!(sim.calls().len(), 1);
    }
}
