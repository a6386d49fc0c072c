use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::track::TrackKind;

#[derive(Debug, Error)]
pub enum CoreError {
    // Configuration errors
    #[error("Config file not found at {path}. A template has been created - please review it and restart.")]
    ConfigNotFound { path: PathBuf },

    #[error("Invalid config: {message}")]
    ConfigInvalid { message: String },

    #[error("Missing required config field: {field}")]
    ConfigMissingField { field: String },

    #[error("Failed to parse config file: {0}")]
    ConfigParseError(#[from] toml::de::Error),

    // Collaborator errors
    #[error("Background music lookup via {provider} failed: {reason}")]
    MusicLookupFailed { provider: String, reason: String },

    // Network errors
    #[error("Network request failed: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest_middleware::Error),

    // IO errors
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to initialize logging: {reason}")]
    LoggingInit { reason: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors reported by a media backend for a single element.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("failed to load media: {0}")]
    Load(String),

    #[error("failed to decode media: {0}")]
    Decode(String),

    #[error("playback was rejected: {0}")]
    PlayRejected(String),
}

/// Errors surfaced by a player session.
///
/// Out-of-range seeks are not represented here: they are clamped onto the
/// timeline, which is the expected outcome of dragging past either end of a
/// scrubber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlayerError {
    /// The voice track could not be loaded. Fatal for the session.
    #[error("could not load the voice recording: {reason}")]
    VoiceLoad { reason: String },

    /// Voice metadata did not arrive before a Play request gave up waiting.
    #[error("voice recording did not become ready within {}ms", timeout.as_millis())]
    VoiceMetadataTimeout { timeout: Duration },

    /// The background track failed; playback degrades to voice only.
    #[error("background music unavailable: {reason}")]
    MusicLoad { reason: String },

    /// Starting playback was rejected; both tracks were rolled back to paused.
    #[error("could not start playback: {reason}")]
    PlaybackStart { reason: String },

    /// A track failed while playing; both tracks were paused.
    #[error("{track} track failed during playback: {reason}")]
    Decode { track: TrackKind, reason: String },

    /// The player has been shut down or replaced.
    #[error("player session is closed")]
    SessionClosed,
}

impl PlayerError {
    /// Whether the error should be shown to the listener.
    ///
    /// Background music is an enhancement, so its failures are diagnostics only.
    #[must_use]
    pub const fn is_user_visible(&self) -> bool {
        !matches!(
            self,
            Self::MusicLoad { .. }
                | Self::Decode {
                    track: TrackKind::Music,
                    ..
                }
        )
    }
}
