use crate::error::{CaptureError, Result};
use crate::frame::ImageBuffer;
use crate::hardware::{BufferHandle, Command, EventKind, EventRegistry, ImageComponent, PortIndex};
use crate::sync::{EventSignal, WaitOutcome};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Who currently owns a capture buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BufferOwner {
    Free,
    QueuedToHardware,
    ReadyForConsumer,
}

/// One buffer registered on the capture port
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub index: usize,
    pub handle: BufferHandle,
    pub memory: ImageBuffer,
    pub owner: BufferOwner,
}

/// Buffers registered with the hardware capture port.
///
/// Indices are dense (`0..len`) and fixed between `provision` and `release`.
/// Ownership tags are only changed under the pool lock.
pub struct CaptureBufferPool {
    component: Arc<dyn ImageComponent>,
    events: Arc<EventRegistry>,
    port: PortIndex,
    enable_signal: Arc<EventSignal>,
    disable_signal: Arc<EventSignal>,
    slots: Mutex<Vec<BufferDescriptor>>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl CaptureBufferPool {
    pub fn new(
        component: Arc<dyn ImageComponent>,
        events: Arc<EventRegistry>,
        port: PortIndex,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            component,
            events,
            port,
            enable_signal: Arc::new(EventSignal::new("port-enable")),
            disable_signal: Arc::new(EventSignal::new("port-disable")),
            slots: Mutex::new(Vec::new()),
            timeout,
            cancel,
        }
    }

    fn enable_event(&self) -> EventKind {
        EventKind::CommandComplete {
            command: Command::PortEnable,
            port: self.port,
        }
    }

    fn disable_event(&self) -> EventKind {
        EventKind::CommandComplete {
            command: Command::PortDisable,
            port: self.port,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Signals left over from an earlier disable that nobody consumed
    pub fn pending_disable_signals(&self) -> usize {
        self.disable_signal.count()
    }

    #[cfg(test)]
    pub(crate) fn disable_signal(&self) -> &EventSignal {
        &self.disable_signal
    }

    /// Allocate `count` buffers of `size_hint` bytes and register them
    pub async fn provision(&self, count: usize, size_hint: usize) -> Result<()> {
        let memory = (0..count)
            .map(|i| ImageBuffer::new(i as u64, size_hint))
            .collect();
        self.provision_with(memory).await
    }

    /// Register caller-supplied memory with the capture port and enable it.
    ///
    /// Blocks until the port reports enabled or the command timeout elapses.
    /// On any failure, buffers registered so far are unregistered again.
    pub async fn provision_with(&self, memory: Vec<ImageBuffer>) -> Result<()> {
        if memory.is_empty() {
            return Err(CaptureError::invalid_argument(
                "at least one capture buffer is required",
            ));
        }
        if !self.is_empty() {
            return Err(CaptureError::not_ready("capture buffers already provisioned"));
        }
        if self.enable_signal.count() != 0 {
            error!(
                "Port enable signal has stale count {}",
                self.enable_signal.count()
            );
            self.enable_signal.drain();
        }

        self.events
            .register(self.enable_event(), Arc::clone(&self.enable_signal));

        if let Err(status) = self.component.send_command(Command::PortEnable, self.port).await {
            error!("Port enable on {} rejected: {}", self.port, status);
            self.events.force_signal(self.enable_event());
            self.enable_signal.drain();
            return Err(CaptureError::hardware("port enable", status));
        }

        let mut registered = Vec::with_capacity(memory.len());
        for (index, buffer) in memory.into_iter().enumerate() {
            debug!(
                "Registering capture buffer {} ({} bytes)",
                index,
                buffer.capacity()
            );
            match self.component.use_buffer(self.port, index, buffer.clone()).await {
                Ok(handle) => registered.push(BufferDescriptor {
                    index,
                    handle,
                    memory: buffer,
                    owner: BufferOwner::Free,
                }),
                Err(status) => {
                    error!("Registering capture buffer {} failed: {}", index, status);
                    self.events.force_signal(self.enable_event());
                    self.enable_signal.drain();
                    self.unwind(registered).await;
                    return Err(CaptureError::hardware("use buffer", status));
                }
            }
        }

        debug!("Waiting for port enable");
        match self.enable_signal.wait_timeout(self.timeout, &self.cancel).await {
            WaitOutcome::Signaled => {
                info!("Capture port {} enabled with {} buffers", self.port, registered.len());
                *self.slots.lock() = registered;
                Ok(())
            }
            outcome => {
                self.events.force_signal(self.enable_event());
                self.enable_signal.drain();
                warn!("Port enable not confirmed ({:?}), unregistering buffers", outcome);
                self.unwind(registered).await;
                Err(CaptureError::timeout("port enable", self.timeout))
            }
        }
    }

    async fn unwind(&self, registered: Vec<BufferDescriptor>) {
        if let Err(status) = self.component.send_command(Command::PortDisable, self.port).await {
            warn!("Port disable during unwind failed: {}", status);
        }
        for descriptor in registered {
            if let Err(status) = self.component.free_buffer(self.port, descriptor.handle).await {
                warn!(
                    "Freeing buffer {} during unwind failed: {}",
                    descriptor.index, status
                );
            }
        }
    }

    /// Disable the port and unregister every buffer.
    ///
    /// Every buffer is attempted even when some fail; the first failure is
    /// returned. A port-disable that never completes is force-signaled and
    /// reported as a timeout after teardown finished.
    pub async fn release(&self) -> Result<()> {
        let descriptors = std::mem::take(&mut *self.slots.lock());
        let mut first_error: Option<CaptureError> = None;

        self.events
            .register(self.disable_event(), Arc::clone(&self.disable_signal));

        if let Err(status) = self.component.send_command(Command::PortDisable, self.port).await {
            error!("Port disable on {} rejected: {}", self.port, status);
            first_error.get_or_insert(CaptureError::hardware("port disable", status));
        }

        debug!("Freeing {} buffer(s) on capture port", descriptors.len());
        for descriptor in descriptors {
            if let Err(status) = self.component.free_buffer(self.port, descriptor.handle).await {
                error!("Freeing capture buffer {} failed: {}", descriptor.index, status);
                first_error.get_or_insert(CaptureError::hardware("free buffer", status));
            }
        }

        debug!("Waiting for port disable");
        match self.disable_signal.wait_timeout(self.timeout, &self.cancel).await {
            WaitOutcome::Signaled => debug!("Port {} disabled", self.port),
            outcome => {
                self.events.force_signal(self.disable_event());
                self.disable_signal.drain();
                warn!(
                    "Port disable not confirmed ({:?}); continuing teardown",
                    outcome
                );
                first_error.get_or_insert(CaptureError::timeout("port disable", self.timeout));
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Hand buffer `index` to the hardware for filling
    pub async fn queue(&self, index: usize) -> Result<()> {
        let handle = self.handle(index)?;
        self.set_owner(index, BufferOwner::QueuedToHardware)?;

        if let Err(status) = self.component.fill_buffer(handle).await {
            error!("Queuing buffer {} failed: {}", index, status);
            self.set_owner(index, BufferOwner::Free)?;
            return Err(CaptureError::hardware("fill buffer", status));
        }
        Ok(())
    }

    /// Queue every buffer in index order, stopping at the first failure
    pub async fn queue_all(&self) -> Result<()> {
        for index in 0..self.len() {
            debug!("Queuing buffer {} on capture port", index);
            self.queue(index).await?;
        }
        Ok(())
    }

    pub fn handle(&self, index: usize) -> Result<BufferHandle> {
        self.slots
            .lock()
            .get(index)
            .map(|d| d.handle)
            .ok_or_else(|| out_of_range(index))
    }

    pub fn descriptor(&self, index: usize) -> Option<BufferDescriptor> {
        self.slots.lock().get(index).cloned()
    }

    pub fn owner(&self, index: usize) -> Option<BufferOwner> {
        self.slots.lock().get(index).map(|d| d.owner)
    }

    pub fn owners(&self) -> Vec<BufferOwner> {
        self.slots.lock().iter().map(|d| d.owner).collect()
    }

    pub fn count_owned_by(&self, owner: BufferOwner) -> usize {
        self.slots.lock().iter().filter(|d| d.owner == owner).count()
    }

    /// Change the owner of `index`, returning the previous one
    pub fn set_owner(&self, index: usize, owner: BufferOwner) -> Result<BufferOwner> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index).ok_or_else(|| out_of_range(index))?;
        Ok(std::mem::replace(&mut slot.owner, owner))
    }
}

fn out_of_range(index: usize) -> CaptureError {
    CaptureError::invalid_argument(format!("capture buffer index {} not provisioned", index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{HardwareCall, SimulatedComponent, SimulatorBehavior};

    fn pool_with(behavior: SimulatorBehavior) -> (CaptureBufferPool, Arc<SimulatedComponent>) {
        let registry = Arc::new(EventRegistry::new());
        let (sim, _rx) = SimulatedComponent::new(Arc::clone(&registry), behavior);
        let sim = Arc::new(sim);
        let pool = CaptureBufferPool::new(
            sim.clone(),
            registry,
            PortIndex::IMAGE_OUT,
            Duration::from_millis(50),
            CancellationToken::new(),
        );
        (pool, sim)
    }

    async fn expect_buffers(sim: &SimulatedComponent, count: usize) {
        use crate::frame::PixelFormat;
        use crate::hardware::PortFormat;
        sim.set_port_format(
            PortIndex::IMAGE_OUT,
            &PortFormat {
                width: 4,
                height: 4,
                color_format: PixelFormat::CbYCrY,
                stride: 2,
                buffer_count: count,
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_provision_registers_dense_indices() {
        let (pool, sim) = pool_with(SimulatorBehavior::default());
        expect_buffers(&sim, 3).await;

        pool.provision(3, 32).await.unwrap();

        assert_eq!(pool.len(), 3);
        for i in 0..3 {
            let descriptor = pool.descriptor(i).unwrap();
            assert_eq!(descriptor.index, i);
            assert_eq!(descriptor.owner, BufferOwner::Free);
        }
        assert_eq!(sim.registered_count(), 3);
    }

    #[tokio::test]
    async fn test_provision_timeout_unwinds() {
        let behavior = SimulatorBehavior {
            ack_port_enable: false,
            ..Default::default()
        };
        let (pool, sim) = pool_with(behavior);
        expect_buffers(&sim, 2).await;

        let err = pool.provision(2, 32).await.unwrap_err();
        assert!(err.is_soft());
        assert!(pool.is_empty());
        assert_eq!(sim.registered_count(), 0);
    }

    #[tokio::test]
    async fn test_unwind_frees_buffers_when_port_disable_rejected() {
        let behavior = SimulatorBehavior {
            ack_port_enable: false,
            fail_port_disable: true,
            ..Default::default()
        };
        let (pool, sim) = pool_with(behavior);
        expect_buffers(&sim, 3).await;

        let err = pool.provision(3, 32).await.unwrap_err();
        assert!(err.is_soft());
        assert!(pool.is_empty());
        assert_eq!(sim.registered_count(), 0);

        let calls = sim.calls();
        assert!(calls
            .iter()
            .any(|c| matches!(c, HardwareCall::SendCommand(Command::PortDisable, _))));
        let frees = calls
            .iter()
            .filter(|c| matches!(c, HardwareCall::FreeBuffer(_)))
            .count();
        assert_eq!(frees, 3);
    }

    #[tokio::test]
    async fn test_release_attempts_every_buffer() {
        let behavior = SimulatorBehavior {
            fail_free: vec![0],
            ..Default::default()
        };
        let (pool, sim) = pool_with(behavior);
        expect_buffers(&sim, 3).await;
        pool.provision(3, 32).await.unwrap();
        sim.clear_calls();

        let err = pool.release().await.unwrap_err();
        assert!(matches!(err, CaptureError::HardwareRejected { .. }));

        let frees: Vec<_> = sim
            .calls()
            .into_iter()
            .filter(|c| matches!(c, HardwareCall::FreeBuffer(_)))
            .collect();
        assert_eq!(frees.len(), 3);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_release_clean() {
        let (pool, sim) = pool_with(SimulatorBehavior::default());
        expect_buffers(&sim, 2).await;
        pool.provision(2, 32).await.unwrap();

        pool.release().await.unwrap();
        assert_eq!(sim.registered_count(), 0);
        assert_eq!(pool.pending_disable_signals(), 0);
    }

    #[tokio::test]
    async fn test_queue_tracks_ownership() {
        let (pool, sim) = pool_with(SimulatorBehavior::default());
        expect_buffers(&sim, 2).await;
        pool.provision(2, 32).await.unwrap();

        pool.queue_all().await.unwrap();
        assert_eq!(pool.count_owned_by(BufferOwner::QueuedToHardware), 2);
        assert_eq!(sim.queued(), vec![0, 1]);

        assert!(pool.queue(5).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_fill_returns_buffer_to_free() {
        let behavior = SimulatorBehavior {
            fail_fill: true,
            ..Default::default()
        };
        let (pool, sim) = pool_with(behavior);
        expect_buffers(&sim, 1).await;
        pool.provision(1, 32).await.unwrap();

        assert!(pool.queue(0).await.is_err());
        assert_eq!(pool.owner(0), Some(BufferOwner::Free));
    }
}
