use const_format::concatcp;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CoreError, Result};
use crate::gain::GainMode;

const DEFAULT_METADATA_TIMEOUT_MS: u64 = 5000;
const DEFAULT_MUSIC_READY_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_TRACKING_INTERVAL_MS: u64 = 100;
const DEFAULT_PAUSE_DEBOUNCE_MS: u64 = 300;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DuetConfig {
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

/// What Play does when the playhead already sits at the end of the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlayAtEnd {
    /// Finish immediately: fire the ended callback and rewind.
    #[default]
    Complete,
    /// Leave the session paused at the end.
    Ignore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Background-music volume in `[0, 1]`
    #[serde(default = "default_music_volume")]
    pub default_music_volume: f32,
    /// Voice volume in `[0, 1]`
    #[serde(default = "default_voice_volume")]
    pub voice_volume: f32,
    /// How long Play waits for voice metadata
    #[serde(default = "default_metadata_timeout")]
    pub metadata_timeout_ms: u64,
    /// How long Play waits for a loading background track before dropping it
    #[serde(default = "default_music_ready_timeout")]
    pub music_ready_timeout_ms: u64,
    /// Sampling interval while only the background track is playing
    #[serde(default = "default_tracking_interval")]
    pub tracking_interval_ms: u64,
    /// Step used by skip backward/forward
    #[serde(default = "default_skip_step")]
    pub skip_step_secs: f64,
    /// How long a user pause masks pause notifications from the tracks
    #[serde(default = "default_pause_debounce")]
    pub pause_debounce_ms: u64,
    #[serde(default)]
    pub play_at_end: PlayAtEnd,
    #[serde(default)]
    pub gain: GainMode,
}

const fn default_music_volume() -> f32 {
    0.15
}

const fn default_voice_volume() -> f32 {
    1.0
}

const fn default_metadata_timeout() -> u64 {
    DEFAULT_METADATA_TIMEOUT_MS
}

const fn default_music_ready_timeout() -> u64 {
    DEFAULT_MUSIC_READY_TIMEOUT_MS
}

const fn default_tracking_interval() -> u64 {
    DEFAULT_TRACKING_INTERVAL_MS
}

const fn default_skip_step() -> f64 {
    5.0
}

const fn default_pause_debounce() -> u64 {
    DEFAULT_PAUSE_DEBOUNCE_MS
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            default_music_volume: default_music_volume(),
            voice_volume: default_voice_volume(),
            metadata_timeout_ms: default_metadata_timeout(),
            music_ready_timeout_ms: default_music_ready_timeout(),
            tracking_interval_ms: default_tracking_interval(),
            skip_step_secs: default_skip_step(),
            pause_debounce_ms: default_pause_debounce(),
            play_at_end: PlayAtEnd::default(),
            gain: GainMode::default(),
        }
    }
}

impl PlayerConfig {
    #[must_use]
    pub const fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    #[must_use]
    pub const fn music_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.music_ready_timeout_ms)
    }

    #[must_use]
    pub const fn tracking_interval(&self) -> Duration {
        Duration::from_millis(self.tracking_interval_ms)
    }

    #[must_use]
    pub const fn pause_debounce(&self) -> Duration {
        Duration::from_millis(self.pause_debounce_ms)
    }

    #[must_use]
    pub fn skip_step(&self) -> Duration {
        crate::time::duration_from_secs_lossy(self.skip_step_secs)
    }

    /// Validate ranges.
    ///
    /// # Errors
    ///
    /// Returns an error if a volume is outside `[0, 1]` or an interval is zero.
    pub fn validate(&self) -> Result<()> {
        for (field, volume) in [
            ("player.default_music_volume", self.default_music_volume),
            ("player.voice_volume", self.voice_volume),
        ] {
            if !(0.0..=1.0).contains(&volume) {
                return Err(CoreError::ConfigInvalid {
                    message: format!("{field} must be between 0 and 1, got {volume}"),
                });
            }
        }

        for (field, value) in [
            ("player.metadata_timeout_ms", self.metadata_timeout_ms),
            ("player.music_ready_timeout_ms", self.music_ready_timeout_ms),
            ("player.tracking_interval_ms", self.tracking_interval_ms),
        ] {
            if value == 0 {
                return Err(CoreError::ConfigInvalid {
                    message: format!("{field} must be greater than 0"),
                });
            }
        }

        if self.skip_step().is_zero() {
            return Err(CoreError::ConfigInvalid {
                message: format!(
                    "player.skip_step_secs must be greater than 0, got {}",
                    self.skip_step_secs
                ),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Also write logs to a file next to the config
    #[serde(default)]
    pub enabled: bool,
    /// `EnvFilter` directives used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            filter: default_log_filter(),
        }
    }
}

/// Provider-specific tables under `[providers.<name>]`.
///
/// Provider crates own their config structs and read them with [`ProvidersConfig::get`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvidersConfig(toml::Table);

impl ProvidersConfig {
    /// Deserialize the table for `name`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the table does not match `T`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let Some(value) = self.0.get(name) else {
            return Ok(None);
        };
        T::deserialize(value.clone())
            .map(Some)
            .map_err(|e| CoreError::ConfigInvalid {
                message: format!("providers.{name}: {e}"),
            })
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }
}

impl DuetConfig {
    /// Get the configuration directory path (~/.config/duet/)
    #[must_use]
    pub fn config_dir() -> PathBuf {
        crate::paths::config_dir()
    }

    /// Get the config file path (~/.config/duet/config.toml)
    #[must_use]
    pub fn config_path() -> PathBuf {
        crate::paths::config_path()
    }

    /// Load config from the default path or create a template on first run.
    ///
    /// `provider_templates` are appended to the generated template.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConfigNotFound`] after writing a template, or an
    /// error if the file cannot be read, parsed or validated.
    pub fn load_or_create(provider_templates: Option<&[&str]>) -> Result<Self> {
        Self::load_or_create_at(&Self::config_path(), provider_templates)
    }

    /// Same as [`DuetConfig::load_or_create`] for an explicit path.
    ///
    /// # Errors
    ///
    /// See [`DuetConfig::load_or_create`].
    pub fn load_or_create_at(path: &Path, provider_templates: Option<&[&str]>) -> Result<Self> {
        if !path.exists() {
            // Create config directory if it doesn't exist
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }

            fs::write(path, build_config_template(provider_templates))?;

            return Err(CoreError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate config text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML or fails validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.player.validate()?;
        Ok(config)
    }
}

/// Base template followed by any provider sections.
#[must_use]
pub fn build_config_template(provider_templates: Option<&[&str]>) -> String {
    let mut template = CONFIG_TEMPLATE.to_string();
    for section in provider_templates.unwrap_or_default() {
        template.push('\n');
        template.push_str(section);
    }
    template
}

const CONFIG_TEMPLATE: &str = concatcp!(
    r#"# Duet Configuration
# ~/.config/duet/config.toml

[player]
# Background music volume (0.0 - 1.0)
default_music_volume = 0.15
voice_volume = 1.0
# How long Play waits for the voice recording's metadata
metadata_timeout_ms = "#,
    DEFAULT_METADATA_TIMEOUT_MS,
    r#"
# How long Play waits for background music before continuing voice-only
music_ready_timeout_ms = "#,
    DEFAULT_MUSIC_READY_TIMEOUT_MS,
    r#"
# Position sampling while only background music is playing
tracking_interval_ms = "#,
    DEFAULT_TRACKING_INTERVAL_MS,
    r#"
skip_step_secs = 5.0
pause_debounce_ms = "#,
    DEFAULT_PAUSE_DEBOUNCE_MS,
    r#"
# Play at the very end of the timeline: "complete" or "ignore"
play_at_end = "complete"
# Volume control: "auto", "element_volume" or "gain_node"
gain = "auto"

[logging]
# Also write logs to ~/.config/duet/duet.log
enabled = false
filter = "info"
"#
);
