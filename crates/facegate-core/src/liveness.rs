//! Blink-challenge liveness detection.
//!
//! A printed photo or a frozen frame never blinks. The detector classifies
//! each frame as eyes-open or eyes-closed from the mean openness of both
//! eyes, debounces the closed classification over `min_closed_frames`
//! consecutive frames, and counts a blink on the closed → open edge.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs, still images on a screen.
//! - **Does not block:** Video replay of a blinking subject, 3D masks with
//!   moving eyelids.

use serde::Serialize;

use crate::options::VerificationOptions;
use crate::types::EyeState;

/// Blink progress for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BlinkState {
    pub consecutive_closed_frames: u32,
    pub blink_count: u32,
    /// True once the closed run has lasted `min_closed_frames`.
    pub eyes_currently_closed: bool,
}

#[derive(Debug, Clone)]
pub struct LivenessDetector {
    closed_threshold: f32,
    min_closed_frames: u32,
    state: BlinkState,
}

impl LivenessDetector {
    pub fn new(closed_threshold: f32, min_closed_frames: u32) -> Self {
        Self {
            closed_threshold,
            min_closed_frames: min_closed_frames.max(1),
            state: BlinkState::default(),
        }
    }

    pub fn from_options(options: &VerificationOptions) -> Self {
        Self::new(options.closed_threshold, options.min_closed_frames)
    }

    /// Clear all blink progress. Called at session start.
    pub fn reset(&mut self) {
        self.state = BlinkState::default();
    }

    /// Feed one frame. `None` means no face (or no eye data) this frame,
    /// which breaks the in-progress closed run without touching the total.
    ///
    /// Returns true if this frame completed a blink.
    pub fn process_frame(&mut self, eyes: Option<EyeState>) -> bool {
        let Some(eyes) = eyes else {
            if self.state.consecutive_closed_frames > 0 {
                tracing::trace!(
                    closed_frames = self.state.consecutive_closed_frames,
                    "liveness: face lost, closed run discarded"
                );
            }
            self.state.consecutive_closed_frames = 0;
            self.state.eyes_currently_closed = false;
            return false;
        };

        if eyes.mean_openness() < self.closed_threshold {
            self.state.consecutive_closed_frames = self.state.consecutive_closed_frames.saturating_add(1);
            if self.state.consecutive_closed_frames >= self.min_closed_frames {
                self.state.eyes_currently_closed = true;
            }
            return false;
        }

        let blinked = self.state.eyes_currently_closed;
        if blinked {
            self.state.blink_count += 1;
            tracing::debug!(total = self.state.blink_count, "liveness: blink detected");
        }
        self.state.consecutive_closed_frames = 0;
        self.state.eyes_currently_closed = false;
        blinked
    }

    pub fn blink_count(&self) -> u32 {
        self.state.blink_count
    }

    pub fn eyes_closed(&self) -> bool {
        self.state.eyes_currently_closed
    }

    pub fn state(&self) -> BlinkState {
        self.state
    }
}
