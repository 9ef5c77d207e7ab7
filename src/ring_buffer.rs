use crate::error::{CaptureError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Bookkeeping for continuous bracketed capture.
///
/// Tracks which capture buffers are armed on the hardware port and decides,
/// completion by completion, which buffer is re-armed next. The ring walks
/// buffer indices in registration order. It never touches the hardware
/// itself; callers act on the indices it returns.
pub struct BracketingRing {
    state: Mutex<RingState>,
    stats: RingStats,
}

#[derive(Debug, Default)]
struct RingState {
    enabled: bool,
    /// Per-buffer "queued to hardware" flags, one per registered buffer
    queued: Vec<bool>,
    queued_count: usize,
    /// Most recently re-armed buffer
    last_index: usize,
    /// Frames still owed when bracketing is turned into a plain burst
    range: usize,
}

/// Counters for ring activity
#[derive(Debug, Default)]
pub struct RingStats {
    pub completions: AtomicU64,
    pub rotations: AtomicU64,
    pub rejected: AtomicU64,
}

impl RingStats {
    pub fn snapshot(&self) -> RingStatsSnapshot {
        RingStatsSnapshot {
            completions: self.completions.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingStatsSnapshot {
    pub completions: u64,
    pub rotations: u64,
    pub rejected: u64,
}

/// Point-in-time copy of the ring state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingSnapshot {
    pub enabled: bool,
    pub queued: Vec<bool>,
    pub queued_count: usize,
    pub last_index: usize,
    pub range: usize,
}

/// Buffers to hand downstream when a bracket is cut short
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainPlan {
    /// Indices not armed on hardware, in ring order
    pub indices: Vec<usize>,
    /// Frames the remaining burst should produce
    pub range: usize,
}

impl BracketingRing {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RingState::default()),
            stats: RingStats::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Prepare the ring with every one of `buffer_count` buffers in flight.
    ///
    /// Does not enable the ring; call [`BracketingRing::activate`] once the
    /// capture has actually started.
    pub fn arm(&self, buffer_count: usize, range: usize) -> Result<()> {
        if buffer_count == 0 {
            return Err(CaptureError::invalid_argument(
                "bracketing needs at least one capture buffer",
            ));
        }

        let mut queued = Vec::new();
        queued.try_reserve_exact(buffer_count).map_err(|e| {
            CaptureError::ResourceExhausted {
                details: format!("bracketing flags for {} buffers: {}", buffer_count, e),
            }
        })?;
        queued.resize(buffer_count, true);

        let mut state = self.state.lock();
        state.queued = queued;
        state.queued_count = buffer_count;
        state.last_index = buffer_count - 1;
        state.range = range;

        debug!(
            "Bracketing ring armed with {} buffers (range {})",
            buffer_count, range
        );
        Ok(())
    }

    /// Record whether the capture behind an armed ring started.
    /// A failed start releases the flag array.
    pub fn activate(&self, started: bool) {
        let mut state = self.state.lock();
        state.enabled = started;
        if !started {
            *state = RingState::default();
        }
    }

    /// Account for a completed buffer.
    ///
    /// Returns the index that must be re-armed on hardware, if any. Rotation
    /// only happens once no buffer is left in flight, matching the grouped
    /// completions the hardware reports.
    pub fn complete(&self, index: usize) -> Result<Option<usize>> {
        let mut state = self.state.lock();
        if !state.enabled {
            return Err(CaptureError::not_ready("bracketing ring is not enabled"));
        }
        let buffer_count = state.queued.len();

        if index >= buffer_count {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Invalid bracketing buffer index {} (ring holds {})",
                index, buffer_count
            );
            return Err(CaptureError::invalid_argument(format!(
                "bracketing buffer index {} out of range 0..{}",
                index, buffer_count
            )));
        }

        self.stats.completions.fetch_add(1, Ordering::Relaxed);
        state.queued[index] = false;
        state.queued_count = state.queued_count.saturating_sub(1);

        if state.queued_count > 0 {
            trace!(
                "Buffer {} completed, {} still in flight",
                index,
                state.queued_count
            );
            return Ok(None);
        }

        let next = (index + 1) % buffer_count;
        state.queued[next] = true;
        state.queued_count += 1;
        state.last_index = next;
        self.stats.rotations.fetch_add(1, Ordering::Relaxed);

        trace!("Buffer {} completed, rotating to {}", index, next);
        Ok(Some(next))
    }

    /// Disable the ring and list the buffers holding frames not yet
    /// delivered. Walks one full cycle starting after the last re-armed
    /// index, so every buffer is visited once.
    pub fn take_drain(&self) -> Option<DrainPlan> {
        let mut state = self.state.lock();
        if !state.enabled {
            return None;
        }
        state.enabled = false;

        let buffer_count = state.queued.len();
        let indices = (1..=buffer_count)
            .map(|step| (state.last_index + step) % buffer_count)
            .filter(|&i| !state.queued[i])
            .collect::<Vec<_>>();

        debug!(
            "Draining {} bracketed frame(s) from ring of {}",
            indices.len(),
            buffer_count
        );

        Some(DrainPlan {
            indices,
            range: state.range,
        })
    }

    /// Turn the ring off for teardown. Returns whether it was enabled.
    pub fn disable(&self) -> bool {
        let mut state = self.state.lock();
        let was_enabled = state.enabled;
        if was_enabled {
            state.enabled = false;
            state.queued = Vec::new();
        }
        was_enabled
    }

    /// Drop all bookkeeping
    pub fn reset(&self) {
        *self.state.lock() = RingState::default();
        trace!("Bracketing ring reset");
    }

    pub fn snapshot(&self) -> RingSnapshot {
        let state = self.state.lock();
        RingSnapshot {
            enabled: state.enabled,
            queued: state.queued.clone(),
            queued_count: state.queued_count,
            last_index: state.last_index,
            range: state.range,
        }
    }

    pub fn stats(&self) -> RingStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Default for BracketingRing {
    fn default() -> Self {
        Self::new()
    }
}
