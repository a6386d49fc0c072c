use std::time::Duration;
use tokio::time::Instant;

use crate::error::PlayerError;

/// Lifecycle of a player session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerState {
    /// Torn down; holds no media.
    #[default]
    Idle,
    /// Waiting for voice metadata.
    Loading,
    /// Voice duration known, not started (or not playable after a voice failure).
    Ready,
    /// At least one track is advancing.
    Playing,
    /// Stopped mid-timeline, position retained.
    Paused,
    /// A scrub gesture is in progress.
    Seeking,
    /// Played through; position back at zero.
    Ended,
}

impl PlayerState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Seeking => "seeking",
            Self::Ended => "ended",
        }
    }
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable player state for rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerSnapshot {
    /// Current state machine state
    pub state: PlayerState,
    /// Whether either track is advancing on behalf of the session
    pub is_playing: bool,
    /// Whether the UI should show a loading indicator
    pub is_loading: bool,
    /// Unified playhead position
    pub position: Duration,
    /// Length of the unified timeline
    pub duration: Duration,
    /// Whether a background track exists
    pub has_music: bool,
    /// Whether background music is ready (or known to be absent)
    pub music_loaded: bool,
    /// Last user-visible error, if any
    pub error: Option<PlayerError>,
    /// When this snapshot was taken (for interpolation)
    pub updated_at: Instant,
}

impl Default for PlayerSnapshot {
    fn default() -> Self {
        Self {
            state: PlayerState::Idle,
            is_playing: false,
            is_loading: false,
            position: Duration::ZERO,
            duration: Duration::ZERO,
            has_music: false,
            music_loaded: false,
            error: None,
            updated_at: Instant::now(),
        }
    }
}

impl PlayerSnapshot {
    /// Get interpolated position based on time elapsed since the snapshot
    #[must_use]
    pub fn interpolated_position(&self) -> Duration {
        if !self.is_playing {
            return self.position;
        }

        let interpolated = self.position + self.updated_at.elapsed();

        // Clamp to timeline length
        interpolated.min(self.duration)
    }

    /// Fraction of the timeline played, for drawing the scrubber.
    #[must_use]
    pub fn progress(&self) -> f64 {
        if self.duration.is_zero() {
            return 0.0;
        }
        (self.position.as_secs_f64() / self.duration.as_secs_f64()).clamp(0.0, 1.0)
    }

    /// Whether transport controls should be disabled.
    #[must_use]
    pub fn controls_disabled(&self) -> bool {
        self.state == PlayerState::Idle
            || self.error.as_ref().is_some_and(|e| {
                matches!(e, PlayerError::VoiceLoad { .. } | PlayerError::SessionClosed)
            })
    }
}
