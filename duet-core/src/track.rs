//! Track handles and the media-element collaborator traits.
//!
//! A [`MediaBackend`] opens [`MediaElement`]s: independently loading,
//! independently timed media sources that report progress through
//! [`MediaEvent`]s. The engine wraps each element in a [`Track`], which is the
//! only place playback state is mutated from.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::MediaError;
use crate::gain::{GainControl, GainStage, GainStrategy};

/// The role a track plays in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    /// Narrated story audio, played once.
    Voice,
    /// Looping background ambience.
    Music,
}

impl TrackKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Voice => "voice",
            Self::Music => "music",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications a media element emits while loading and playing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// Metadata is available; the duration is now known.
    MetadataLoaded { duration: Duration },
    /// Enough data is buffered to play through without stalling.
    CanPlayThrough,
    /// Periodic position report while playing.
    TimeUpdate { position: Duration },
    /// The element stopped advancing. Fired for explicit pauses, external
    /// interruptions and right before [`MediaEvent::Ended`].
    Paused,
    /// Playback reached the end of a non-looping element.
    Ended,
    /// Loading or decoding failed.
    Error(MediaError),
}

/// Sending half handed to a backend when an element is opened.
///
/// Every event is tagged with the kind of track it belongs to so both
/// elements of a session can share one channel.
#[derive(Debug, Clone)]
pub struct MediaEvents {
    kind: TrackKind,
    tx: mpsc::UnboundedSender<(TrackKind, MediaEvent)>,
}

/// Receiving half of a session's media event channel.
pub type MediaEventReceiver = mpsc::UnboundedReceiver<(TrackKind, MediaEvent)>;

impl MediaEvents {
    /// Create a channel and the sender for the voice track.
    #[must_use]
    pub fn channel() -> (Self, MediaEventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                kind: TrackKind::Voice,
                tx,
            },
            rx,
        )
    }

    /// A sender on the same channel tagged with another track kind.
    #[must_use]
    pub fn for_kind(&self, kind: TrackKind) -> Self {
        Self {
            kind,
            tx: self.tx.clone(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Emit an event. Events emitted after the session is gone are dropped.
    pub fn emit(&self, event: MediaEvent) {
        if self.tx.send((self.kind, event)).is_err() {
            debug!("Dropping {} media event, session closed", self.kind);
        }
    }
}

/// A single playable media source, modeled after an HTML media element.
///
/// Loading starts when the element is opened and progresses on its own;
/// progress is reported through the [`MediaEvents`] passed to
/// [`MediaBackend::open`].
#[async_trait]
pub trait MediaElement: Send + Sync {
    /// Duration, once metadata has loaded.
    fn duration(&self) -> Option<Duration>;

    /// Current playback position.
    fn position(&self) -> Duration;

    /// Move the playback position. Positions past the end are pinned to it.
    fn set_position(&self, position: Duration);

    /// Whether the element is not advancing.
    fn is_paused(&self) -> bool;

    /// Whether a non-looping element reached its end.
    fn is_ended(&self) -> bool;

    /// Toggle looping.
    fn set_looping(&self, looping: bool);

    /// Set the element's own volume property.
    fn set_volume(&self, volume: f32);

    /// Route the element's output through a gain stage.
    fn route_through(&self, stage: GainStage);

    /// Start or resume playback.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform refuses to start playback (autoplay
    /// policy, undecodable data).
    async fn play(&self) -> Result<(), MediaError>;

    /// Pause playback, keeping the position.
    fn pause(&self);

    /// Stop playback and release any resources held by the element.
    fn release(&self);
}

/// Opens media elements for URLs.
pub trait MediaBackend: Send + Sync {
    /// Returns a human-readable name for this backend.
    fn name(&self) -> &'static str;

    /// Open an element for `url` and start loading it.
    ///
    /// Opening never fails synchronously; load failures are reported as
    /// [`MediaEvent::Error`] through `events`.
    fn open(&self, url: &str, events: MediaEvents) -> Arc<dyn MediaElement>;
}

/// A media element owned by a session, together with its gain control.
pub struct Track {
    kind: TrackKind,
    url: String,
    element: Arc<dyn MediaElement>,
    gain: Box<dyn GainControl>,
    loaded: bool,
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("kind", &self.kind)
            .field("url", &self.url)
            .field("loaded", &self.loaded)
            .field("duration", &self.duration())
            .field("position", &self.position())
            .field("volume", &self.volume())
            .finish_non_exhaustive()
    }
}

impl Track {
    /// Open a track through `backend`.
    pub fn open(
        backend: &dyn MediaBackend,
        url: impl Into<String>,
        events: &MediaEvents,
        strategy: GainStrategy,
        volume: f32,
        looping: bool,
    ) -> Self {
        let url = url.into();
        let kind = events.kind();
        debug!("Opening {} track via {}: {}", kind, backend.name(), url);

        let element = backend.open(&url, events.clone());
        element.set_looping(looping);
        let gain = strategy.attach(&element);
        gain.set_gain(volume.clamp(0.0, 1.0));

        Self {
            kind,
            url,
            element,
            gain,
            loaded: false,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether metadata has loaded.
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub(crate) fn mark_loaded(&mut self) {
        self.loaded = true;
    }

    /// Duration, known only once metadata has loaded and non-zero.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        if !self.loaded {
            return None;
        }
        self.element.duration().filter(|d| !d.is_zero())
    }

    /// Duration with unknown treated as zero.
    #[must_use]
    pub fn duration_or_zero(&self) -> Duration {
        self.duration().unwrap_or(Duration::ZERO)
    }

    #[must_use]
    pub fn position(&self) -> Duration {
        self.element.position()
    }

    /// Move to `position`, pinned at the track's own end when known.
    pub fn set_position(&self, position: Duration) {
        let target = self.duration().map_or(position, |d| position.min(d));
        self.element.set_position(target);
    }

    /// Whether the track is actively advancing.
    #[must_use]
    pub fn is_playing(&self) -> bool {
        !self.element.is_paused() && !self.element.is_ended()
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.element.is_ended()
    }

    /// Whether the position has reached the track's own end.
    #[must_use]
    pub fn is_at_end(&self) -> bool {
        self.element.is_ended() || self.duration().is_some_and(|d| self.position() >= d)
    }

    pub fn set_looping(&self, looping: bool) {
        self.element.set_looping(looping);
    }

    /// Set the track volume, clamped to `[0, 1]`.
    pub fn set_volume(&self, volume: f32) {
        self.gain.set_gain(volume.clamp(0.0, 1.0));
    }

    #[must_use]
    pub fn volume(&self) -> f32 {
        self.gain.gain()
    }

    /// Start playback.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if playback could not start.
    pub async fn play(&self) -> Result<(), MediaError> {
        self.element.play().await
    }

    pub fn pause(&self) {
        self.element.pause();
    }

    /// Stop, rewind and release the element.
    pub fn release(&self) {
        self.element.pause();
        self.element.set_position(Duration::ZERO);
        self.element.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubBackend;

    #[test]
    fn test_track_kind_display() {
        assert_eq!(TrackKind::Voice.to_string(), "voice");
        assert_eq!(TrackKind::Music.to_string(), "music");
    }

    #[tokio::test]
    async fn test_media_events_are_tagged_with_kind() {
        let (voice, mut rx) = MediaEvents::channel();
        let music = voice.for_kind(TrackKind::Music);

        voice.emit(MediaEvent::CanPlayThrough);
        music.emit(MediaEvent::Ended);

        assert_eq!(
            rx.recv().await,
            Some((TrackKind::Voice, MediaEvent::CanPlayThrough))
        );
        assert_eq!(rx.recv().await, Some((TrackKind::Music, MediaEvent::Ended)));
    }

    #[test]
    fn test_emit_after_receiver_dropped_is_silent() {
        let (events, rx) = MediaEvents::channel();
        drop(rx);
        events.emit(MediaEvent::Ended);
    }

    #[test]
    fn test_duration_unknown_until_loaded() {
        let backend = StubBackend::new();
        let (events, _rx) = MediaEvents::channel();
        let mut track = Track::open(
            &backend,
            "voice.mp3",
            &events,
            GainStrategy::ElementVolume,
            1.0,
            false,
        );
        backend.element("voice.mp3").set_duration(Duration::from_secs(30));

        assert_eq!(track.duration(), None);
        track.mark_loaded();
        assert_eq!(track.duration(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_zero_duration_counts_as_unknown() {
        let backend = StubBackend::new();
        let (events, _rx) = MediaEvents::channel();
        let mut track = Track::open(
            &backend,
            "voice.mp3",
            &events,
            GainStrategy::ElementVolume,
            1.0,
            false,
        );
        track.mark_loaded();
        assert_eq!(track.duration(), None);
        assert_eq!(track.duration_or_zero(), Duration::ZERO);
    }

    #[test]
    fn test_set_position_pins_at_end() {
        let backend = StubBackend::new();
        let (events, _rx) = MediaEvents::channel();
        let mut track = Track::open(
            &backend,
            "voice.mp3",
            &events,
            GainStrategy::ElementVolume,
            1.0,
            false,
        );
        backend.element("voice.mp3").set_duration(Duration::from_secs(10));
        track.mark_loaded();

        track.set_position(Duration::from_secs(25));
        assert_eq!(track.position(), Duration::from_secs(10));
        assert!(track.is_at_end());
    }

    #[test]
    fn test_volume_is_clamped() {
        let backend = StubBackend::new();
        let (events, _rx) = MediaEvents::channel();
        let track = Track::open(
            &backend,
            "music.mp3",
            &events.for_kind(TrackKind::Music),
            GainStrategy::ElementVolume,
            0.15,
            true,
        );
        assert!((track.volume() - 0.15).abs() < f32::EPSILON);

        track.set_volume(3.0);
        assert!((track.volume() - 1.0).abs() < f32::EPSILON);
        track.set_volume(-1.0);
        assert!(track.volume().abs() < f32::EPSILON);
        assert!(backend.element("music.mp3").is_looping());
    }
}
