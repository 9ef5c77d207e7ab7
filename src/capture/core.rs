use crate::{
    buffers::{BufferOwner, CaptureBufferPool},
    delivery::{FrameSink, PassiveThreeA, ThreeAControl},
    error::{CaptureError, Result},
    events::{CaptureEvent, EventBus},
    exposure::bracketing_payloads,
    frame::{CaptureFrame, FrameType, ImageBuffer},
    hardware::{
        ComponentState, ConfigIndex, ConfigPayload, EventKind, EventRegistry, ImageComponent,
        PortFormat, PortIndex,
    },
    params::{CaptureParameters, CaptureSettings, OperatingMode},
    ring_buffer::BracketingRing,
    sync::{EventSignal, WaitOutcome},
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle of the still-capture port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CaptureState {
    Idle,
    Provisioned,
    Capturing,
    Bracketing,
    Stopping,
}

/// Bounds on every blocking wait
#[derive(Debug, Clone, Copy)]
pub struct CaptureTimeouts {
    /// Port enable/disable completion
    pub command: Duration,
    /// Shutter and capture-complete notifications
    pub capture: Duration,
}

impl Default for CaptureTimeouts {
    fn default() -> Self {
        Self {
            command: Duration::from_millis(3000),
            capture: Duration::from_millis(5000),
        }
    }
}

/// Counters exposed for monitoring
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureStats {
    pub sessions: u64,
    pub frames_delivered: u64,
    pub shutter_events: u64,
    pub timeouts: u64,
}

#[derive(Default)]
struct Counters {
    sessions: AtomicU64,
    frames_delivered: AtomicU64,
    shutter_events: AtomicU64,
    timeouts: AtomicU64,
}

/// Capture session token: exists while buffers are provisioned
struct Session {
    id: Option<Uuid>,
    configured: bool,
    remaining_frames: usize,
    waiting_for_snapshot: bool,
    capture_signalled: bool,
    state: CaptureState,
}

impl Session {
    fn idle() -> Self {
        Self {
            id: None,
            configured: false,
            remaining_frames: 0,
            waiting_for_snapshot: false,
            capture_signalled: false,
            state: CaptureState::Idle,
        }
    }

    fn label(&self) -> String {
        self.id.map(|id| id.to_string()).unwrap_or_default()
    }
}

type ReleaseCallback = Arc<dyn Fn() + Send + Sync>;

/// Drives the image component through still capture.
///
/// One thread (task) drives the lifecycle transitions; the component's
/// notification path calls [`ImageCapture::on_buffer_filled`] concurrently.
pub struct ImageCapture {
    pub(super) component: Arc<dyn ImageComponent>,
    pub(super) events: Arc<EventRegistry>,
    pub(super) pool: CaptureBufferPool,
    pub(super) ring: BracketingRing,
    pub(super) three_a: Arc<dyn ThreeAControl>,
    sink: Arc<dyn FrameSink>,
    pub(super) bus: EventBus,
    mode: OperatingMode,
    port: PortIndex,
    settings: Mutex<CaptureSettings>,
    session: Mutex<Session>,
    shutter_signal: Arc<EventSignal>,
    capture_done: Arc<EventSignal>,
    timeouts: CaptureTimeouts,
    cancel: CancellationToken,
    release_callback: Mutex<Option<ReleaseCallback>>,
    counters: Counters,
}

impl ImageCapture {
    pub fn builder() -> ImageCaptureBuilder {
        ImageCaptureBuilder::new()
    }

    pub fn state(&self) -> CaptureState {
        self.session.lock().state
    }

    pub(super) fn set_state(&self, state: CaptureState) {
        let mut session = self.session.lock();
        if session.state != state {
            debug!("Capture state {:?} -> {:?}", session.state, state);
            session.state = state;
        }
    }

    /// Whether a capture session is provisioned
    pub fn is_configured(&self) -> bool {
        self.session.lock().configured
    }

    pub fn remaining_frames(&self) -> usize {
        self.session.lock().remaining_frames
    }

    pub(super) fn set_remaining_frames(&self, frames: usize) {
        self.session.lock().remaining_frames = frames;
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session.lock().id
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    pub fn settings(&self) -> CaptureSettings {
        self.settings.lock().clone()
    }

    pub fn pool(&self) -> &CaptureBufferPool {
        &self.pool
    }

    pub fn ring(&self) -> &BracketingRing {
        &self.ring
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.bus.subscribe()
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            sessions: self.counters.sessions.load(Ordering::Relaxed),
            frames_delivered: self.counters.frames_delivered.load(Ordering::Relaxed),
            shutter_events: self.counters.shutter_events.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Callback run once at the end of every capture teardown
    pub fn set_release_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.release_callback.lock() = Some(Arc::new(callback));
    }

    /// Abandon all pending waits
    pub fn shutdown(&self) {
        info!("Shutting down image capture");
        self.cancel.cancel();
    }

    fn shutter_event() -> EventKind {
        EventKind::SettingChanged {
            port: PortIndex::ALL,
            index: ConfigIndex::ShutterCallback,
        }
    }

    fn note_timeout(&self) {
        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    async fn configure(&self, operation: &str, payload: ConfigPayload) -> Result<()> {
        self.component.set_config(payload).await.map_err(|status| {
            error!("Error while configuring {}: {}", operation, status);
            CaptureError::hardware(operation, status)
        })
    }

    /// Translate user parameters into capture settings.
    ///
    /// A changed picture size or format is pushed to the image port unless a
    /// capture is already running.
    pub async fn set_parameters(&self, params: &CaptureParameters) -> Result<()> {
        let port_changed = self.settings.lock().apply(params, self.mode);

        let active = matches!(
            self.state(),
            CaptureState::Capturing | CaptureState::Bracketing
        );
        if port_changed && !active {
            let buffer_count = self.pool.len();
            self.push_port_format(buffer_count).await?;
        }
        Ok(())
    }

    async fn push_port_format(&self, buffer_count: usize) -> Result<usize> {
        let format = {
            let settings = self.settings.lock();
            PortFormat {
                width: settings.width,
                height: settings.height,
                color_format: settings.pixel_format,
                stride: settings.pixel_format.bytes_per_pixel() as u32,
                buffer_count,
            }
        };

        self.component
            .set_port_format(self.port, &format)
            .await
            .map_err(|status| {
                error!("Setting image port format failed: {}", status);
                CaptureError::hardware("set port format", status)
            })
    }

    /// Size in bytes each of `buffer_count` capture buffers must have
    pub async fn picture_buffer_size(&self, buffer_count: usize) -> Result<usize> {
        let size = self.push_port_format(buffer_count).await?;
        debug!("Picture buffer size {} for {} buffers", size, buffer_count);
        Ok(size)
    }

    /// Configure frame limit and exposure bracketing on the capture port
    pub async fn set_exposure_bracketing(
        &self,
        values: Option<&[i32]>,
        count: usize,
        frame_limit: usize,
    ) -> Result<()> {
        if self.component.state() == ComponentState::Invalid {
            error!("Image component is in invalid state");
            return Err(CaptureError::invalid_argument(
                "image component is in invalid state",
            ));
        }

        let (capture_mode, ext_mode) = bracketing_payloads(self.port, values, count, frame_limit)?;

        let mode_result = self.configure("capture mode", capture_mode).await;
        if mode_result.is_ok() {
            debug!("Capture mode configured (frame limit {})", frame_limit);
        }
        let ext_result = self.configure("extended capture mode", ext_mode).await;
        if ext_result.is_ok() {
            debug!("Extended capture mode configured ({} exposure values)", count);
        }
        mode_result.and(ext_result)
    }

    /// Enable or disable shutter notifications; the component must be executing
    pub async fn set_shutter_callback(&self, enabled: bool) -> Result<()> {
        if self.component.state() != ComponentState::Executing {
            error!("Image component not in executing state");
            return Err(CaptureError::not_ready("image component not executing"));
        }

        debug!(
            "{} shutter callback",
            if enabled { "Enabling" } else { "Disabling" }
        );
        self.configure(
            "shutter callback",
            ConfigPayload::CallbackRequest {
                index: ConfigIndex::ShutterCallback,
                enable: enabled,
            },
        )
        .await
    }

    async fn set_picture_rotation(&self, degrees: u32) -> Result<()> {
        self.configure(
            "picture rotation",
            ConfigPayload::Rotation {
                port: self.port,
                degrees,
            },
        )
        .await
    }

    /// Allocate `count` buffers of `size_hint` bytes and provision them
    pub async fn provision(&self, count: usize, size_hint: usize) -> Result<()> {
        let memory = (0..count)
            .map(|i| ImageBuffer::new(i as u64, size_hint))
            .collect();
        self.use_buffers(memory).await
    }

    /// Idle -> Provisioned: configure the capture port and register buffers.
    ///
    /// Any failing step aborts the transition and leaves no session behind.
    pub async fn use_buffers(&self, memory: Vec<ImageBuffer>) -> Result<()> {
        if self.is_configured() {
            return Err(CaptureError::not_ready("capture session already provisioned"));
        }
        if memory.is_empty() {
            return Err(CaptureError::invalid_argument(
                "at least one capture buffer is required",
            ));
        }

        let buffer_count = memory.len();
        let settings = self.settings();

        self.push_port_format(buffer_count).await?;

        self.configure(
            "thumbnail",
            ConfigPayload::Thumbnail {
                port: self.port,
                width: settings.thumb_width,
                height: settings.thumb_height,
                quality: settings.thumb_quality,
            },
        )
        .await?;

        let exposure = settings.exposure.as_slice();
        self.set_exposure_bracketing(Some(exposure), exposure.len(), settings.burst_frames)
            .await?;

        self.configure(
            "image quality",
            ConfigPayload::ImageQuality {
                port: self.port,
                quality: settings.quality,
            },
        )
        .await?;

        self.pool.provision_with(memory).await?;

        let id = Uuid::new_v4();
        {
            let mut session = self.session.lock();
            session.id = Some(id);
            session.configured = true;
            session.remaining_frames = settings.burst_frames;
            session.capture_signalled = false;
            session.state = CaptureState::Provisioned;
        }
        self.counters.sessions.fetch_add(1, Ordering::Relaxed);

        info!(
            "Capture session {} provisioned: {} buffers, burst {}",
            id, buffer_count, settings.burst_frames
        );
        self.bus.publish(CaptureEvent::BuffersReady {
            session: id.to_string(),
            buffer_count,
        });
        Ok(())
    }

    /// Provisioned -> Capturing.
    ///
    /// A no-op when no session is provisioned. While bracketing is active the
    /// request finishes the bracket burst instead of starting a new capture.
    pub async fn start_capture(&self) -> Result<()> {
        if !self.is_configured() {
            debug!("Image capture was cancelled before it could start");
            return Ok(());
        }

        if self.shutter_signal.count() != 0 {
            error!(
                "Shutter signal has stale count {}",
                self.shutter_signal.count()
            );
            return Err(CaptureError::not_ready("shutter signal not reset"));
        }

        if self.three_a.has_pending() {
            if let Err(e) = self.three_a.apply_pending().await {
                warn!("Applying pending 3A settings failed: {}", e);
            }
        }

        if let Some(plan) = self.ring.take_drain() {
            info!("Bracketing active; finishing burst of {} frames", plan.range);
            self.set_remaining_frames(plan.range);
            self.set_state(CaptureState::Capturing);
            return self.send_bracket_frames(&plan.indices);
        }

        let rotation = self.settings.lock().rotation;
        self.set_picture_rotation(rotation).await?;

        let shutter = self.mode.has_shutter_events();
        if shutter {
            self.events
                .register(Self::shutter_event(), Arc::clone(&self.shutter_signal));
            if let Err(e) = self.set_shutter_callback(true).await {
                self.disarm_shutter();
                return Err(e);
            }
        }

        if let Err(e) = self.enable_capturing().await {
            if shutter {
                self.disarm_shutter();
            }
            return Err(e);
        }

        if !shutter {
            return Ok(());
        }

        match self
            .shutter_signal
            .wait_timeout(self.timeouts.capture, &self.cancel)
            .await
        {
            WaitOutcome::Signaled => {
                let armed =
                    std::mem::replace(&mut self.session.lock().waiting_for_snapshot, false);
                if armed {
                    self.counters.shutter_events.fetch_add(1, Ordering::Relaxed);
                    self.bus.publish(CaptureEvent::Shutter {
                        timestamp: SystemTime::now(),
                    });
                } else {
                    debug!("Shutter signalled after the snapshot was abandoned");
                }
                Ok(())
            }
            outcome => {
                self.disarm_shutter();
                self.session.lock().waiting_for_snapshot = false;
                self.note_timeout();
                warn!("Shutter callback not received ({:?})", outcome);
                Err(CaptureError::timeout("shutter callback", self.timeouts.capture))
            }
        }
    }

    async fn enable_capturing(&self) -> Result<()> {
        if let Err(e) = self.pool.queue_all().await {
            self.reset_snapshot_flags();
            return Err(e);
        }

        let burst = self.settings.lock().burst_frames;
        self.capture_done.drain();
        {
            let mut session = self.session.lock();
            session.waiting_for_snapshot = true;
            session.capture_signalled = false;
            session.remaining_frames = burst;
        }

        if let Err(e) = self.configure("capturing", ConfigPayload::Capturing(true)).await {
            self.reset_snapshot_flags();
            return Err(e);
        }

        let label = {
            let mut session = self.session.lock();
            session.state = CaptureState::Capturing;
            session.label()
        };
        info!("Capture {} started", label);
        self.bus.publish(CaptureEvent::CaptureStarted { session: label });
        Ok(())
    }

    fn reset_snapshot_flags(&self) {
        let mut session = self.session.lock();
        session.waiting_for_snapshot = false;
        session.capture_signalled = false;
    }

    fn disarm_shutter(&self) {
        self.events.force_signal(Self::shutter_event());
        self.shutter_signal.drain();
    }

    #[cfg(test)]
    pub(crate) fn shutter_signal(&self) -> &EventSignal {
        &self.shutter_signal
    }

    #[cfg(test)]
    pub(crate) fn waiting_for_snapshot(&self) -> bool {
        self.session.lock().waiting_for_snapshot
    }

    /// Capturing -> Idle.
    ///
    /// A no-op when no session is provisioned. Every wait is bounded and a
    /// missing event never stops the teardown; the release callback runs at
    /// the end on every path. Returns the first hard failure, or a timeout
    /// if the port never confirmed it was disabled.
    pub async fn stop_capture(&self) -> Result<()> {
        if !self.is_configured() {
            debug!("Capture is not ongoing");
            return Ok(());
        }

        let result = if self.pool.pending_disable_signals() != 0 {
            error!(
                "Port disable signal has stale count {}",
                self.pool.pending_disable_signals()
            );
            Ok(())
        } else {
            self.teardown().await
        };

        self.notify_release();
        result
    }

    async fn teardown(&self) -> Result<()> {
        let (label, started) = {
            let mut session = self.session.lock();
            let started = matches!(
                session.state,
                CaptureState::Capturing | CaptureState::Bracketing
            );
            session.state = CaptureState::Stopping;
            session.waiting_for_snapshot = false;
            (session.label(), started)
        };
        info!("Stopping capture {}", label);
        self.ring.disable();

        if let Err(e) = self.set_shutter_callback(false).await {
            debug!("Disabling shutter callback failed: {}", e);
        }

        if let Err(e) = self.three_a.release_locks().await {
            error!("Error releasing 3A locks: {}", e);
        }

        let outcome = if started {
            self.capture_done
                .wait_timeout(self.timeouts.capture, &self.cancel)
                .await
        } else {
            WaitOutcome::Signaled
        };
        match outcome {
            WaitOutcome::Signaled => debug!("Capture completed"),
            outcome => {
                self.capture_done.release_waiters();
                self.disarm_shutter();
                self.note_timeout();
                warn!("Capture completion not received ({:?}); continuing", outcome);
            }
        }

        let mut first_error = self
            .configure("capturing", ConfigPayload::Capturing(false))
            .await
            .err();

        {
            let mut session = self.session.lock();
            session.capture_signalled = true;
            session.configured = false;
        }

        if let Err(e) = self.pool.release().await {
            if e.is_soft() {
                self.note_timeout();
            }
            first_error.get_or_insert(e);
        }

        self.ring.reset();
        let clean = first_error.is_none();
        {
            let mut session = self.session.lock();
            session.id = None;
            session.remaining_frames = 0;
            session.state = CaptureState::Idle;
        }

        self.bus.publish(CaptureEvent::CaptureStopped {
            session: label,
            clean,
        });

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn notify_release(&self) {
        let callback = self.release_callback.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
        self.bus.publish(CaptureEvent::BuffersReleased);
    }

    /// Completion entry point for a buffer the hardware finished filling
    pub async fn on_buffer_filled(&self, index: usize) -> Result<()> {
        if self.ring.is_enabled() {
            return self.do_bracketing(index).await;
        }

        self.deliver(index)?;

        let done = {
            let mut session = self.session.lock();
            session.remaining_frames = session.remaining_frames.saturating_sub(1);
            let done = session.remaining_frames == 0 && !session.capture_signalled;
            if done {
                session.capture_signalled = true;
            }
            done
        };

        if done {
            debug!("All frames for this capture received");
            self.capture_done.signal();
        }
        Ok(())
    }

    /// Mark `index` ready and hand it to the frame sink
    pub(super) fn deliver(&self, index: usize) -> Result<()> {
        self.pool.set_owner(index, BufferOwner::ReadyForConsumer)?;
        let descriptor = self.pool.descriptor(index).ok_or_else(|| {
            CaptureError::invalid_argument(format!("capture buffer {} vanished", index))
        })?;

        let (width, height, frame_type) = {
            let settings = self.settings.lock();
            (
                settings.width,
                settings.height,
                FrameType::for_format(settings.pixel_format),
            )
        };

        let frame = CaptureFrame::new(index, descriptor.memory, frame_type, width, height);
        let length = frame.length;
        self.sink.send_frame(frame);
        self.counters.frames_delivered.fetch_add(1, Ordering::Relaxed);
        self.bus.publish(CaptureEvent::FrameDelivered { index, length });
        Ok(())
    }

    /// Downstream is done with buffer `index`.
    ///
    /// The buffer is queued again while the capture still expects more frames
    /// than are already in flight; otherwise it becomes free.
    pub async fn return_frame(&self, index: usize, frame_type: FrameType) -> Result<()> {
        let owner = self.pool.owner(index).ok_or_else(|| {
            CaptureError::invalid_argument(format!("capture buffer {} not provisioned", index))
        })?;
        if owner != BufferOwner::ReadyForConsumer {
            warn!("Returned buffer {} is not held by a consumer ({:?})", index, owner);
            return Ok(());
        }

        let in_flight = self.pool.count_owned_by(BufferOwner::QueuedToHardware);
        let requeue = {
            let session = self.session.lock();
            session.configured
                && session.state == CaptureState::Capturing
                && session.remaining_frames > in_flight
        };

        debug!("{:?} buffer {} returned (requeue: {})", frame_type, index, requeue);
        if requeue {
            self.pool.queue(index).await
        } else {
            self.pool.set_owner(index, BufferOwner::Free).map(|_| ())
        }
    }

    /// Forward completions reported on `completions` until the channel closes
    /// or the capture shuts down.
    pub fn spawn_completion_pump(
        self: &Arc<Self>,
        mut completions: mpsc::UnboundedReceiver<usize>,
    ) -> JoinHandle<()> {
        let capture = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = capture.cancel.cancelled() => break,
                    next = completions.recv() => match next {
                        Some(index) => {
                            if let Err(e) = capture.on_buffer_filled(index).await {
                                error!("Handling completion of buffer {} failed: {}", index, e);
                            }
                        }
                        None => break,
                    }
                }
            }
            debug!("Completion pump stopped");
        })
    }
}

/// Builder for [`ImageCapture`]
pub struct ImageCaptureBuilder {
    component: Option<Arc<dyn ImageComponent>>,
    events: Option<Arc<EventRegistry>>,
    sink: Option<Arc<dyn FrameSink>>,
    three_a: Option<Arc<dyn ThreeAControl>>,
    mode: OperatingMode,
    port: PortIndex,
    timeouts: CaptureTimeouts,
    event_bus_capacity: usize,
}

impl ImageCaptureBuilder {
    pub fn new() -> Self {
        Self {
            component: None,
            events: None,
            sink: None,
            three_a: None,
            mode: OperatingMode::HighQuality,
            port: PortIndex::IMAGE_OUT,
            timeouts: CaptureTimeouts::default(),
            event_bus_capacity: 64,
        }
    }

    /// Image component plus the registry its notifications are delivered to
    pub fn component(mut self, component: Arc<dyn ImageComponent>, events: Arc<EventRegistry>) -> Self {
        self.component = Some(component);
        self.events = Some(events);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn three_a(mut self, three_a: Arc<dyn ThreeAControl>) -> Self {
        self.three_a = Some(three_a);
        self
    }

    pub fn mode(mut self, mode: OperatingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn port(mut self, port: PortIndex) -> Self {
        self.port = port;
        self
    }

    pub fn timeouts(mut self, timeouts: CaptureTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn event_bus_capacity(mut self, capacity: usize) -> Self {
        self.event_bus_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<ImageCapture> {
        let component = self
            .component
            .ok_or_else(|| CaptureError::invalid_argument("image component must be specified"))?;
        let events = self
            .events
            .ok_or_else(|| CaptureError::invalid_argument("event registry must be specified"))?;
        let sink = self
            .sink
            .ok_or_else(|| CaptureError::invalid_argument("frame sink must be specified"))?;
        if self.event_bus_capacity == 0 {
            return Err(CaptureError::invalid_argument(
                "event bus capacity must be greater than 0",
            ));
        }

        let cancel = CancellationToken::new();
        let pool = CaptureBufferPool::new(
            Arc::clone(&component),
            Arc::clone(&events),
            self.port,
            self.timeouts.command,
            cancel.clone(),
        );

        Ok(ImageCapture {
            component,
            events,
            pool,
            ring: BracketingRing::new(),
            three_a: self
                .three_a
                .unwrap_or_else(|| Arc::new(PassiveThreeA::new())),
            sink,
            bus: EventBus::new(self.event_bus_capacity),
            mode: self.mode,
            port: self.port,
            settings: Mutex::new(CaptureSettings::default()),
            session: Mutex::new(Session::idle()),
            shutter_signal: Arc::new(EventSignal::new("shutter")),
            capture_done: Arc::new(EventSignal::new("capture-done")),
            timeouts: self.timeouts,
            cancel,
            release_callback: Mutex::new(None),
            counters: Counters::default(),
        })
    }
}

impl Default for ImageCaptureBuilder {
    fn default() -> Self {
        Self::new()
    }
}
