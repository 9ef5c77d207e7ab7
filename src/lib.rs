pub mod buffers;
pub mod capture;
pub mod config;
pub mod delivery;
pub mod error;
pub mod events;
pub mod exposure;
pub mod frame;
pub mod hardware;
pub mod params;
pub mod ring_buffer;
pub mod sync;

pub use buffers::{BufferDescriptor, BufferOwner, CaptureBufferPool};
pub use capture::{CaptureState, CaptureStats, CaptureTimeouts, ImageCapture, ImageCaptureBuilder};
pub use config::{AdapterConfig, StillcapConfig};
pub use delivery::{ChannelFrameSink, FrameSink, PassiveThreeA, ThreeAControl};
pub use error::{CaptureError, HardwareStatus, Result};
pub use events::{CaptureEvent, EventBus};
pub use exposure::{parse_exp_range, ExposureList, EXP_BRACKET_RANGE};
pub use frame::{CaptureFrame, CodingMode, FrameType, ImageBuffer, PixelFormat};
pub use hardware::{
    EventKind, EventRegistry, HardwareCall, ImageComponent, SimulatedComponent, SimulatorBehavior,
};
pub use params::{CaptureParameters, CaptureSettings, OperatingMode};
pub use ring_buffer::{BracketingRing, DrainPlan, RingSnapshot};
pub use sync::{EventSignal, WaitOutcome};
