pub mod clock;
pub mod config;
pub mod error;
pub mod gain;
pub mod logging;
pub mod music;
pub mod paths;
pub mod playback;
pub mod player;
pub mod session;
pub mod time;
pub mod timeline;
pub mod track;

#[cfg(test)]
pub(crate) mod testing;

pub use clock::{ClockBackend, ClockElement, ClockFailure, ClockMedia};
pub use config::{
    build_config_template, DuetConfig, LoggingConfig, PlayAtEnd, PlayerConfig, ProvidersConfig,
};

/// Re-export toml error type for config parsing error handling
pub use toml::de::Error as TomlParseError;
pub use error::{CoreError, MediaError, PlayerError};
pub use gain::{GainControl, GainMode, GainStage, GainStrategy};
pub use logging::init_tracing;
pub use music::{resolve_or_none, MusicResolver, NoMusic, StaticMusicResolver};
pub use paths::{
    config_dir, config_path, log_file_path, CONFIG_DIR_NAME, CONFIG_FILE_NAME, LOG_FILE_NAME,
};
pub use playback::{PlayerSnapshot, PlayerState};
pub use player::{PlayerContext, SyncedAudioPlayer};
pub use session::{EndedCallback, PlayReadiness, PlayerEvent, PlayerSession, SessionChannels};
pub use time::DurationExt;
pub use timeline::{
    fraction_from_pointer, position_at_fraction, SkipDirection, Timeline, TimelineSource,
};
pub use track::{
    MediaBackend, MediaElement, MediaEvent, MediaEventReceiver, MediaEvents, Track, TrackKind,
};
