//! Host-side view of the asynchronous image component.
//!
//! The component is an opaque service: every request may be rejected with a
//! [`HardwareStatus`], and requests that need confirmation complete later
//! through an [`EventKind`] delivered to the [`EventRegistry`].

mod registry;
mod simulated;

pub use registry::EventRegistry;
pub use simulated::{HardwareCall, SimulatedComponent, SimulatorBehavior};

use crate::error::HardwareStatus;
use crate::frame::{ImageBuffer, PixelFormat};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type HwResult<T> = std::result::Result<T, HardwareStatus>;

/// Port number on the image component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortIndex(pub u32);

impl PortIndex {
    /// Still-image output port
    pub const IMAGE_OUT: Self = Self(2);
    /// Wildcard addressing every port
    pub const ALL: Self = Self(u32::MAX);
}

impl fmt::Display for PortIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == PortIndex::ALL {
            write!(f, "all")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentState {
    Loaded,
    Idle,
    Executing,
    Invalid,
}

/// Port commands that complete asynchronously
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    PortEnable,
    PortDisable,
}

/// Configuration indices understood by the component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigIndex {
    PortDefinition,
    CaptureMode,
    ExtCaptureMode,
    Capturing,
    CallbackRequest,
    ShutterCallback,
    Rotation,
    ImageQuality,
    Thumbnail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BracketMode {
    ExposureRelativeInEv,
}

/// Exposure bracketing block of the extended capture mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BracketConfig {
    pub mode: BracketMode,
    /// Number of relative steps (values minus one)
    pub step_count: usize,
    /// Q16 encoded exposure offsets
    pub values: Vec<i32>,
}

/// Payloads accepted by [`ImageComponent::set_config`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigPayload {
    CaptureMode {
        port: PortIndex,
        frame_limited: bool,
        frame_limit: usize,
    },
    ExtCaptureMode {
        port: PortIndex,
        bracketing: Option<BracketConfig>,
    },
    Capturing(bool),
    CallbackRequest {
        index: ConfigIndex,
        enable: bool,
    },
    Rotation {
        port: PortIndex,
        degrees: u32,
    },
    ImageQuality {
        port: PortIndex,
        quality: u32,
    },
    Thumbnail {
        port: PortIndex,
        width: u32,
        height: u32,
        quality: u32,
    },
}

impl ConfigPayload {
    pub fn index(&self) -> ConfigIndex {
        match self {
            ConfigPayload::CaptureMode { .. } => ConfigIndex::CaptureMode,
            ConfigPayload::ExtCaptureMode { .. } => ConfigIndex::ExtCaptureMode,
            ConfigPayload::Capturing(_) => ConfigIndex::Capturing,
            ConfigPayload::CallbackRequest { .. } => ConfigIndex::CallbackRequest,
            ConfigPayload::Rotation { .. } => ConfigIndex::Rotation,
            ConfigPayload::ImageQuality { .. } => ConfigIndex::ImageQuality,
            ConfigPayload::Thumbnail { .. } => ConfigIndex::Thumbnail,
        }
    }
}

/// Port definition pushed before buffers are registered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortFormat {
    pub width: u32,
    pub height: u32,
    pub color_format: PixelFormat,
    /// Bytes per pixel
    pub stride: u32,
    pub buffer_count: usize,
}

/// Component-side handle for a registered buffer.
///
/// `index` is the host's dense buffer index, carried so completions can be
/// mapped back to a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    pub index: usize,
    pub token: u64,
}

/// Asynchronous notifications a wait can be armed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CommandComplete { command: Command, port: PortIndex },
    SettingChanged { port: PortIndex, index: ConfigIndex },
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::CommandComplete { command, port } => {
                write!(f, "{:?} complete on port {}", command, port)
            }
            EventKind::SettingChanged { port, index } => {
                write!(f, "{:?} changed on port {}", index, port)
            }
        }
    }
}

/// Requests the capture core issues to the image component
#[async_trait]
pub trait ImageComponent: Send + Sync {
    fn state(&self) -> ComponentState;

    /// Program the port definition; returns the per-buffer size required
    async fn set_port_format(&self, port: PortIndex, format: &PortFormat) -> HwResult<usize>;

    async fn set_config(&self, config: ConfigPayload) -> HwResult<()>;

    async fn send_command(&self, command: Command, port: PortIndex) -> HwResult<()>;

    /// Register caller-supplied memory as buffer `index` of `port`
    async fn use_buffer(
        &self,
        port: PortIndex,
        index: usize,
        memory: ImageBuffer,
    ) -> HwResult<BufferHandle>;

    async fn free_buffer(&self, port: PortIndex, handle: BufferHandle) -> HwResult<()>;

    /// Hand a registered buffer to the component for filling
    async fn fill_buffer(&self, handle: BufferHandle) -> HwResult<()>;
}
