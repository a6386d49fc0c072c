//! The synchronized dual-track session.
//!
//! A [`PlayerSession`] owns the voice track and the optional background track
//! and is the only thing that mutates their playback state. It presents both as
//! one timeline of length `max(voice, music)`: the voice track plays once, the
//! background track loops underneath it and, when it is the longer of the two,
//! carries the timeline on its own after the voice finishes.
//!
//! The session is a plain state machine. It reacts to transport calls, to
//! [`MediaEvent`]s and to [`PlayerSession::tick`]; driving those inputs is the
//! job of [`SyncedAudioPlayer`](crate::SyncedAudioPlayer).

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{PlayAtEnd, PlayerConfig};
use crate::error::{MediaError, PlayerError};
use crate::gain::GainStrategy;
use crate::playback::{PlayerSnapshot, PlayerState};
use crate::time::DurationExt;
use crate::timeline::{SkipDirection, Timeline, TimelineSource};
use crate::track::{MediaBackend, MediaEvent, MediaEventReceiver, MediaEvents, Track, TrackKind};

/// Events emitted by a player session
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// The voice track started loading
    Loading,
    /// Voice metadata arrived; the session can play
    Ready { duration: Duration },
    /// The background track can play through
    MusicReady { duration: Option<Duration> },
    /// The background track is gone; playback continues voice-only
    MusicUnavailable { reason: String },
    /// Playback started or resumed
    Started { position: Duration },
    /// Playback was paused
    Paused { position: Duration },
    /// The playhead was moved
    Seeked { position: Duration },
    /// Regular position update while playing
    PositionSync { position: Duration },
    /// The voice track finished and the background track carries on
    VoiceFinished { position: Duration },
    /// The whole timeline played through
    Ended,
    /// A user-visible error occurred
    Error { error: PlayerError },
    /// The session was torn down
    Closed,
}

/// Host callback invoked once per full play-through.
pub type EndedCallback = Arc<dyn Fn() + Send + Sync>;

/// What a Play request has to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayReadiness {
    /// Play can run now.
    Ready,
    /// Voice metadata has not arrived yet.
    AwaitVoice,
    /// The background track is still being resolved or buffered.
    AwaitMusic,
}

/// Outbound channels shared by every session a player creates.
#[derive(Debug, Clone)]
pub struct SessionChannels {
    events: broadcast::Sender<PlayerEvent>,
    snapshots: Arc<watch::Sender<PlayerSnapshot>>,
}

impl SessionChannels {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        let (snapshots, _) = watch::channel(PlayerSnapshot::default());
        Self {
            events,
            snapshots: Arc::new(snapshots),
        }
    }

    /// Subscribe to session events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    /// Watch the observable player state
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<PlayerSnapshot> {
        self.snapshots.subscribe()
    }

    /// Latest published snapshot
    #[must_use]
    pub fn snapshot(&self) -> PlayerSnapshot {
        self.snapshots.borrow().clone()
    }
}

impl Default for SessionChannels {
    fn default() -> Self {
        Self::new()
    }
}

enum MusicSlot {
    /// The figure lookup has not answered yet.
    Resolving,
    /// No background track, which is a fully loaded state.
    Absent,
    Loading(Track),
    Ready(Track),
}

impl MusicSlot {
    const fn track(&self) -> Option<&Track> {
        match self {
            Self::Loading(track) | Self::Ready(track) => Some(track),
            Self::Resolving | Self::Absent => None,
        }
    }

    fn track_mut(&mut self) -> Option<&mut Track> {
        match self {
            Self::Loading(track) | Self::Ready(track) => Some(track),
            Self::Resolving | Self::Absent => None,
        }
    }

    const fn is_loaded(&self) -> bool {
        matches!(self, Self::Absent | Self::Ready(_))
    }
}

/// A time update further than this from its element's live position was
/// queued before a seek moved the element.
const STALE_UPDATE_TOLERANCE: Duration = Duration::from_millis(500);

fn is_current(reported: Duration, track: &Track) -> bool {
    let live = track.position();
    if reported.distance(live) > STALE_UPDATE_TOLERANCE {
        debug!("Dropping stale time update {:?} (track at {:?})", reported, live);
        return false;
    }
    true
}

/// One voice recording plus its background track, presented as one timeline.
pub struct PlayerSession {
    config: PlayerConfig,
    backend: Arc<dyn MediaBackend>,
    gain: GainStrategy,
    media: MediaEvents,
    voice: Track,
    music: MusicSlot,
    state: PlayerState,
    /// Unified playhead
    position: Duration,
    /// The voice finished and the background track drives the timeline
    music_only: bool,
    /// Whether the position-tracking interval should run
    tracking: bool,
    user_pause_at: Option<Instant>,
    /// State to return to when a scrub gesture ends
    scrub_resume: Option<PlayerState>,
    ended_fired: bool,
    /// Voice failure that makes the session unplayable
    fault: Option<PlayerError>,
    last_error: Option<PlayerError>,
    channels: SessionChannels,
    on_ended: Option<EndedCallback>,
}

impl PlayerSession {
    /// Create a session and start loading the voice track.
    ///
    /// The background track is attached later with
    /// [`PlayerSession::attach_music`] once the figure lookup answers. Media
    /// events for both tracks arrive on the returned receiver.
    pub fn new(
        config: PlayerConfig,
        backend: Arc<dyn MediaBackend>,
        voice_url: &str,
        channels: SessionChannels,
        on_ended: Option<EndedCallback>,
    ) -> (Self, MediaEventReceiver) {
        let (media, media_rx) = MediaEvents::channel();
        let gain = GainStrategy::detect(config.gain);
        info!("Loading voice track: {}", voice_url);

        let voice = Track::open(
            backend.as_ref(),
            voice_url,
            &media,
            gain,
            config.voice_volume,
            false,
        );

        let session = Self {
            config,
            backend,
            gain,
            media,
            voice,
            music: MusicSlot::Resolving,
            state: PlayerState::Loading,
            position: Duration::ZERO,
            music_only: false,
            tracking: false,
            user_pause_at: None,
            scrub_resume: None,
            ended_fired: false,
            fault: None,
            last_error: None,
            channels,
            on_ended,
        };
        session.emit(PlayerEvent::Loading);
        session.publish();

        (session, media_rx)
    }

    #[must_use]
    pub const fn state(&self) -> PlayerState {
        self.state
    }

    /// Unified playhead position.
    #[must_use]
    pub const fn position(&self) -> Duration {
        self.position
    }

    /// Whether either track is advancing on behalf of the session.
    #[must_use]
    pub fn is_playing(&self) -> bool {
        match self.state {
            PlayerState::Playing => true,
            PlayerState::Seeking => self.scrub_resume == Some(PlayerState::Playing),
            _ => false,
        }
    }

    /// Whether the position-tracking interval should be running.
    #[must_use]
    pub const fn is_tracking(&self) -> bool {
        self.tracking
    }

    #[must_use]
    pub const fn music_loaded(&self) -> bool {
        self.music.is_loaded()
    }

    #[must_use]
    pub const fn has_music(&self) -> bool {
        self.music.track().is_some()
    }

    /// The voice failure that disabled this session, if any.
    #[must_use]
    pub const fn fault(&self) -> Option<&PlayerError> {
        self.fault.as_ref()
    }

    #[must_use]
    pub const fn config(&self) -> &PlayerConfig {
        &self.config
    }

    #[must_use]
    pub fn voice(&self) -> &Track {
        &self.voice
    }

    #[must_use]
    pub fn music(&self) -> Option<&Track> {
        self.music.track()
    }

    /// Current durations of both tracks.
    #[must_use]
    pub fn timeline(&self) -> Timeline {
        Timeline::new(
            self.voice.duration(),
            self.music.track().map(Track::duration_or_zero),
        )
    }

    /// Observable state for rendering.
    #[must_use]
    pub fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            state: self.state,
            is_playing: self.is_playing(),
            is_loading: self.state == PlayerState::Loading && self.fault.is_none(),
            position: self.position,
            duration: self.timeline().effective_duration(),
            has_music: self.has_music(),
            music_loaded: self.music_loaded(),
            error: self.last_error.clone(),
            updated_at: Instant::now(),
        }
    }

    fn publish(&self) {
        self.channels.snapshots.send_replace(self.snapshot());
    }

    fn emit(&self, event: PlayerEvent) {
        // No subscribers is fine
        let _ = self.channels.events.send(event);
    }

    // ---------------------------------------------------------------------
    // Loading
    // ---------------------------------------------------------------------

    /// Attach the result of the background-music lookup.
    ///
    /// Only the first answer counts; a lookup that arrives after the session
    /// gave up on music is ignored.
    pub fn attach_music(&mut self, url: Option<String>) {
        if !matches!(self.music, MusicSlot::Resolving) {
            debug!("Ignoring late background music lookup result");
            return;
        }

        match url {
            Some(url) => {
                info!("Loading background music: {}", url);
                let track = Track::open(
                    self.backend.as_ref(),
                    url,
                    &self.media.for_kind(TrackKind::Music),
                    self.gain,
                    self.config.default_music_volume,
                    true,
                );
                self.music = MusicSlot::Loading(track);
            }
            None => {
                debug!("No background music for this session");
                self.music = MusicSlot::Absent;
            }
        }
        self.publish();
    }

    /// Give up on a background track that has not become ready.
    pub fn abandon_music(&mut self, reason: &str) {
        if self.music.is_loaded() {
            return;
        }
        warn!("Continuing without background music: {}", reason);
        if let Some(track) = self.music.track() {
            track.release();
        }
        self.music = MusicSlot::Absent;
        self.emit(PlayerEvent::MusicUnavailable {
            reason: reason.to_string(),
        });
        self.publish();
    }

    /// What a Play request would have to wait for.
    ///
    /// # Errors
    ///
    /// Returns the session's fault if the voice track failed to load, or
    /// [`PlayerError::SessionClosed`] after teardown.
    pub fn play_readiness(&self) -> Result<PlayReadiness, PlayerError> {
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        if self.state == PlayerState::Idle {
            return Err(PlayerError::SessionClosed);
        }
        if self.voice.duration().is_none() {
            return Ok(PlayReadiness::AwaitVoice);
        }
        if !self.music.is_loaded() {
            return Ok(PlayReadiness::AwaitMusic);
        }
        Ok(PlayReadiness::Ready)
    }

    /// Called when a pending Play request ran out of time.
    ///
    /// Missing voice metadata fails the request; a background track that is
    /// still loading is dropped so the request can go ahead voice-only.
    pub fn play_wait_expired(&mut self) -> Option<PlayerError> {
        match self.play_readiness() {
            Ok(PlayReadiness::AwaitVoice) => {
                let error = PlayerError::VoiceMetadataTimeout {
                    timeout: self.config.metadata_timeout(),
                };
                error!("{}", error);
                self.report(error.clone());
                Some(error)
            }
            Ok(PlayReadiness::AwaitMusic) => {
                self.abandon_music("background music did not become ready in time");
                None
            }
            Ok(PlayReadiness::Ready) => None,
            Err(e) => Some(e),
        }
    }

    // ---------------------------------------------------------------------
    // Transport
    // ---------------------------------------------------------------------

    /// Start or resume playback from the unified position.
    ///
    /// Both tracks are started in the same turn. If either refuses, both are
    /// paused again and the error is reported.
    ///
    /// # Errors
    ///
    /// Returns the session fault, [`PlayerError::PlaybackStart`] if the session
    /// is not ready yet or a track refused to start.
    pub async fn play(&mut self) -> Result<(), PlayerError> {
        match self.play_readiness()? {
            PlayReadiness::Ready => {}
            PlayReadiness::AwaitVoice => {
                return Err(PlayerError::PlaybackStart {
                    reason: "voice track is not ready".into(),
                })
            }
            PlayReadiness::AwaitMusic => {
                return Err(PlayerError::PlaybackStart {
                    reason: "background music is still loading".into(),
                })
            }
        }

        if self.state == PlayerState::Seeking {
            // Resumes when the gesture is released
            self.scrub_resume = Some(PlayerState::Playing);
            self.publish();
            return Ok(());
        }
        if self.is_playing() {
            return Ok(());
        }

        let timeline = self.timeline();
        let position = self.position;

        if timeline.is_at_end(position) {
            match self.config.play_at_end {
                PlayAtEnd::Complete => {
                    info!("Play requested at the end of the timeline, completing");
                    self.ended_fired = false;
                    self.complete();
                }
                PlayAtEnd::Ignore => {
                    debug!("Play requested at the end of the timeline, ignoring");
                }
            }
            return Ok(());
        }

        self.last_error = None;

        let music_only = timeline.source_at(position) == TimelineSource::Music;
        let started = if music_only {
            self.start_music_only(position).await
        } else {
            self.start_both(position).await
        };
        if let Err(e) = started {
            return Err(self.fail_start(&e));
        }

        self.music_only = music_only;
        self.tracking = music_only;
        self.ended_fired = false;
        self.state = PlayerState::Playing;
        info!(
            "Playback started at {:?}{}",
            position,
            if music_only { " (background only)" } else { "" }
        );
        self.emit(PlayerEvent::Started { position });
        self.publish();
        Ok(())
    }

    async fn start_both(&self, position: Duration) -> Result<(), MediaError> {
        self.voice.set_position(position);
        let music = self.music.track();
        if let Some(music) = music {
            music.set_looping(true);
            music.set_position(position);
        }

        // Issued together so neither start waits on the other
        let voice = &self.voice;
        let (voice_started, music_started) = tokio::join!(voice.play(), async move {
            match music {
                Some(music) => music.play().await,
                None => Ok(()),
            }
        });
        voice_started.and(music_started)
    }

    async fn start_music_only(&self, position: Duration) -> Result<(), MediaError> {
        self.voice.pause();
        self.voice.set_position(position);
        match self.music.track() {
            Some(music) => {
                music.set_looping(false);
                music.set_position(position);
                music.play().await
            }
            None => Ok(()),
        }
    }

    /// Roll both tracks back to paused after a failed start.
    fn fail_start(&mut self, cause: &MediaError) -> PlayerError {
        let error = PlayerError::PlaybackStart {
            reason: cause.to_string(),
        };
        error!("{}", error);
        self.pause_tracks();
        self.tracking = false;
        self.music_only = false;
        if self.state == PlayerState::Playing {
            self.state = PlayerState::Paused;
        }
        if self.scrub_resume == Some(PlayerState::Playing) {
            self.scrub_resume = Some(PlayerState::Paused);
        }
        self.report(error.clone());
        error
    }

    /// Pause both tracks, keeping the unified position.
    pub fn pause(&mut self) {
        if self.state == PlayerState::Seeking {
            if self.scrub_resume == Some(PlayerState::Playing) {
                self.user_pause_at = Some(Instant::now());
                self.pause_tracks();
                self.tracking = false;
                self.music_only = false;
                self.scrub_resume = Some(PlayerState::Paused);
                self.publish();
            }
            return;
        }
        if self.state != PlayerState::Playing {
            return;
        }

        self.user_pause_at = Some(Instant::now());
        self.position = self.sample_position();
        self.pause_tracks();
        self.tracking = false;
        self.music_only = false;
        self.state = PlayerState::Paused;
        info!("Playback paused at {:?}", self.position);
        self.emit(PlayerEvent::Paused {
            position: self.position,
        });
        self.publish();
    }

    /// Move the playhead to `secs`, clamped onto the timeline.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::PlaybackStart`] if a track that should keep
    /// playing after the seek refused to resume.
    pub async fn seek(&mut self, secs: f64) -> Result<(), PlayerError> {
        let target = self.timeline().clamp_secs(secs);
        self.seek_to(target).await
    }

    /// Skip back by the configured step.
    ///
    /// # Errors
    ///
    /// See [`PlayerSession::seek`].
    pub async fn skip_backward(&mut self) -> Result<(), PlayerError> {
        self.skip(SkipDirection::Backward).await
    }

    /// Skip forward by the configured step.
    ///
    /// # Errors
    ///
    /// See [`PlayerSession::seek`].
    pub async fn skip_forward(&mut self) -> Result<(), PlayerError> {
        self.skip(SkipDirection::Forward).await
    }

    async fn skip(&mut self, direction: SkipDirection) -> Result<(), PlayerError> {
        let from = self.sample_position();
        let target = self
            .timeline()
            .skip(from, self.config.skip_step(), direction);
        self.seek_to(target).await
    }

    /// Back to the start, still playing if it was.
    ///
    /// # Errors
    ///
    /// See [`PlayerSession::seek`].
    pub async fn restart(&mut self) -> Result<(), PlayerError> {
        self.seek_to(Duration::ZERO).await
    }

    fn transport_enabled(&self) -> bool {
        self.fault.is_none() && !matches!(self.state, PlayerState::Idle | PlayerState::Loading)
    }

    async fn seek_to(&mut self, target: Duration) -> Result<(), PlayerError> {
        if !self.transport_enabled() {
            debug!("Ignoring seek while {}", self.state);
            return Ok(());
        }

        let timeline = self.timeline();
        let target = timeline.clamp(target);
        let was_playing = self.is_playing();

        self.voice.set_position(target);
        if let Some(music) = self.music.track() {
            music.set_position(target);
        }
        self.position = target;
        debug!("Seek to {:?}", target);

        if was_playing {
            if timeline.is_at_end(target) {
                // Both tracks are past their own ends
                self.complete();
                return Ok(());
            }
            self.resume_after_seek(&timeline, target).await?;
        } else if self.state == PlayerState::Ended && !target.is_zero() {
            self.state = PlayerState::Paused;
        }

        self.emit(PlayerEvent::Seeked { position: target });
        self.publish();
        Ok(())
    }

    /// Keep playing whatever still has audio at `target`; tracks already past
    /// their own end stay paused.
    async fn resume_after_seek(
        &mut self,
        timeline: &Timeline,
        target: Duration,
    ) -> Result<(), PlayerError> {
        let voice_continues = target < timeline.voice();
        let music = self.music.track();
        let music_continues = music.is_some_and(|m| target < m.duration_or_zero());

        if !voice_continues {
            self.voice.pause();
        }
        if let Some(music) = music {
            music.set_looping(voice_continues);
            if !music_continues {
                music.pause();
            }
        }

        let voice = &self.voice;
        let (voice_resumed, music_resumed) = tokio::join!(
            async move {
                if voice_continues && !voice.is_playing() {
                    voice.play().await
                } else {
                    Ok(())
                }
            },
            async move {
                match music {
                    Some(music) if music_continues && !music.is_playing() => music.play().await,
                    _ => Ok(()),
                }
            }
        );
        if let Err(e) = voice_resumed.and(music_resumed) {
            return Err(self.fail_start(&e));
        }

        self.music_only = !voice_continues;
        self.tracking = self.music_only;
        Ok(())
    }

    /// Press on the scrubber: commit a seek and start a drag.
    ///
    /// # Errors
    ///
    /// See [`PlayerSession::seek`].
    pub async fn begin_scrub(&mut self, secs: f64) -> Result<(), PlayerError> {
        if !self.transport_enabled() {
            return Ok(());
        }
        if self.state == PlayerState::Seeking {
            self.scrub_to(secs);
            return Ok(());
        }

        self.seek(secs).await?;
        if self.state == PlayerState::Ended {
            return Ok(());
        }
        self.scrub_resume = Some(self.state);
        self.state = PlayerState::Seeking;
        self.publish();
        Ok(())
    }

    /// Drag on the scrubber: move the displayed position only.
    pub fn scrub_to(&mut self, secs: f64) {
        if self.state != PlayerState::Seeking {
            return;
        }
        self.position = self.timeline().clamp_secs(secs);
        self.publish();
    }

    /// Release the scrubber: commit the final seek and leave the drag.
    ///
    /// If the session completed during the drag, the release still moves the
    /// playhead, leaving the session paused there.
    ///
    /// # Errors
    ///
    /// See [`PlayerSession::seek`].
    pub async fn end_scrub(&mut self, secs: f64) -> Result<(), PlayerError> {
        let Some(resume) = self.scrub_resume.take() else {
            return Ok(());
        };
        if self.state == PlayerState::Seeking {
            self.state = resume;
        }
        self.seek(secs).await
    }

    /// Change the background-music volume.
    pub fn set_music_volume(&mut self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.config.default_music_volume = volume;
        if let Some(music) = self.music.track() {
            music.set_volume(volume);
        }
    }

    // ---------------------------------------------------------------------
    // Media events
    // ---------------------------------------------------------------------

    /// React to a notification from one of the tracks.
    pub fn handle_media_event(&mut self, kind: TrackKind, event: MediaEvent) {
        if self.state == PlayerState::Idle {
            return;
        }
        match kind {
            TrackKind::Voice => self.on_voice_event(event),
            TrackKind::Music => self.on_music_event(event),
        }
        self.publish();
    }

    fn on_voice_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::MetadataLoaded { duration } => {
                self.voice.mark_loaded();
                info!("Voice track loaded ({:?})", duration);
                if self.state == PlayerState::Loading && self.fault.is_none() {
                    self.state = PlayerState::Ready;
                    self.emit(PlayerEvent::Ready {
                        duration: self.timeline().effective_duration(),
                    });
                }
            }
            MediaEvent::CanPlayThrough => debug!("Voice track can play through"),
            MediaEvent::TimeUpdate { position } => {
                let within_voice = self.voice.duration().is_some_and(|d| position < d);
                if self.state == PlayerState::Playing
                    && !self.music_only
                    && within_voice
                    && is_current(position, &self.voice)
                {
                    self.position = position;
                    self.emit(PlayerEvent::PositionSync { position });
                }
            }
            MediaEvent::Paused => self.on_voice_paused(),
            MediaEvent::Ended => self.on_voice_ended(),
            MediaEvent::Error(e) => self.on_voice_error(&e),
        }
    }

    fn on_voice_paused(&mut self) {
        if self.state != PlayerState::Playing || self.music_only {
            return;
        }
        if self.user_pause_active() {
            debug!("Voice pause matches a user pause, ignoring");
            return;
        }
        if self.voice.is_at_end() {
            // Natural end; handled by the ended notification
            return;
        }
        self.external_pause(TrackKind::Voice);
    }

    fn on_voice_ended(&mut self) {
        if !self.is_playing() || self.music_only {
            debug!("Voice ended while {}, ignoring", self.state);
            return;
        }

        let voice_end = self.voice.duration_or_zero();
        let music_continues = self.music.track().is_some_and(|music| {
            music.is_playing() && music.duration_or_zero() > voice_end && !music.is_at_end()
        });

        if music_continues {
            self.music_only = true;
            self.tracking = true;
            if let Some(music) = self.music.track() {
                // Let the background track finish instead of looping forever
                music.set_looping(false);
                if self.state == PlayerState::Playing {
                    self.position = music.position();
                }
            }
            info!("Voice finished, background music continues");
            self.emit(PlayerEvent::VoiceFinished {
                position: self.position,
            });
        } else {
            self.complete();
        }
    }

    fn on_voice_error(&mut self, cause: &MediaError) {
        self.pause_tracks();
        self.tracking = false;
        self.music_only = false;

        if self.voice.is_loaded() {
            let error = PlayerError::Decode {
                track: TrackKind::Voice,
                reason: cause.to_string(),
            };
            error!("{}", error);
            if self.is_playing() {
                self.position = self.sample_position();
                self.state = PlayerState::Paused;
                self.scrub_resume = None;
            }
            self.report(error);
        } else {
            let error = PlayerError::VoiceLoad {
                reason: cause.to_string(),
            };
            error!("{}", error);
            self.fault = Some(error.clone());
            self.state = PlayerState::Ready;
            self.report(error);
        }
    }

    fn on_music_event(&mut self, event: MediaEvent) {
        if self.music.track().is_none() {
            debug!("Ignoring {:?} from detached background track", event);
            return;
        }

        match event {
            MediaEvent::MetadataLoaded { duration } => {
                if let Some(track) = self.music.track_mut() {
                    track.mark_loaded();
                }
                debug!("Background music metadata loaded ({:?})", duration);
            }
            MediaEvent::CanPlayThrough => self.on_music_ready(),
            MediaEvent::TimeUpdate { position } => {
                let current = self.music.track().is_some_and(|m| is_current(position, m));
                if self.state == PlayerState::Playing && self.music_only && current {
                    self.position = position;
                    self.emit(PlayerEvent::PositionSync { position });
                }
            }
            MediaEvent::Paused => {
                let at_end = self.music.track().is_some_and(Track::is_at_end);
                if self.state == PlayerState::Playing && !self.user_pause_active() && !at_end {
                    self.external_pause(TrackKind::Music);
                }
            }
            MediaEvent::Ended => {
                if self.music_only && self.is_playing() {
                    self.complete();
                } else {
                    debug!("Background music ended while voice drives the timeline");
                }
            }
            MediaEvent::Error(e) => self.on_music_error(&e),
        }
    }

    fn on_music_ready(&mut self) {
        let slot = std::mem::replace(&mut self.music, MusicSlot::Absent);
        self.music = match slot {
            MusicSlot::Loading(mut track) => {
                track.mark_loaded();
                let duration = track.duration();
                info!("Background music ready ({:?})", duration);
                self.emit(PlayerEvent::MusicReady { duration });
                MusicSlot::Ready(track)
            }
            other => other,
        };
    }

    fn on_music_error(&mut self, cause: &MediaError) {
        if matches!(cause, MediaError::Decode(_)) && self.is_playing() {
            self.on_music_decode_error(cause);
            return;
        }

        let reason = cause.to_string();
        warn!(
            "{}",
            PlayerError::MusicLoad {
                reason: reason.clone()
            }
        );
        if let Some(track) = self.music.track() {
            track.release();
        }
        self.music = MusicSlot::Absent;
        self.emit(PlayerEvent::MusicUnavailable { reason });

        if self.music_only && self.is_playing() {
            // The voice already finished; nothing is left to play
            self.complete();
        }
    }

    /// The background track broke while playing: stop the voice with it so
    /// the two never drift apart, and leave resuming to the listener.
    fn on_music_decode_error(&mut self, cause: &MediaError) {
        let error = PlayerError::Decode {
            track: TrackKind::Music,
            reason: cause.to_string(),
        };
        warn!("{}", error);

        self.position = self.sample_position();
        self.pause_tracks();
        self.tracking = false;
        self.music_only = false;
        if self.state == PlayerState::Seeking {
            self.scrub_resume = Some(PlayerState::Paused);
        } else {
            self.state = PlayerState::Paused;
        }
        self.emit(PlayerEvent::Paused {
            position: self.position,
        });
        self.report(error);
    }

    fn external_pause(&mut self, source: TrackKind) {
        info!("{} track paused externally, pausing playback", source);
        self.position = self.sample_position();
        self.pause_tracks();
        self.tracking = false;
        self.music_only = false;
        self.state = PlayerState::Paused;
        self.emit(PlayerEvent::Paused {
            position: self.position,
        });
    }

    // ---------------------------------------------------------------------
    // Position tracking
    // ---------------------------------------------------------------------

    /// Sample the background track while it plays alone.
    ///
    /// Called on the tracking interval; see [`PlayerSession::is_tracking`].
    pub fn tick(&mut self) {
        if !self.tracking || !self.music_only {
            return;
        }

        let Some(music) = self.music.track() else {
            self.complete();
            return;
        };

        if music.is_at_end() {
            info!("Background music finished");
            self.complete();
            return;
        }

        let position = music.position();
        if !music.is_playing() {
            if self.state == PlayerState::Playing {
                info!("Background music stopped at {:?}", position);
                self.position = position;
                self.tracking = false;
                self.music_only = false;
                self.state = PlayerState::Paused;
                self.emit(PlayerEvent::Paused { position });
                self.publish();
            }
            return;
        }

        if self.state == PlayerState::Playing {
            self.position = position;
            self.emit(PlayerEvent::PositionSync { position });
            self.publish();
        }
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    /// Position of whichever track drives the timeline right now.
    fn sample_position(&self) -> Duration {
        if self.state == PlayerState::Seeking {
            return self.position;
        }
        if self.music_only {
            return self.music.track().map_or(self.position, Track::position);
        }
        match self.voice.duration() {
            Some(duration) => self.voice.position().min(duration),
            None => self.position,
        }
    }

    fn pause_tracks(&self) {
        self.voice.pause();
        if let Some(music) = self.music.track() {
            music.pause();
        }
    }

    fn user_pause_active(&self) -> bool {
        self.user_pause_at
            .is_some_and(|at| at.elapsed() < self.config.pause_debounce())
    }

    fn report(&mut self, error: PlayerError) {
        if error.is_user_visible() {
            self.last_error = Some(error.clone());
        }
        self.emit(PlayerEvent::Error { error });
    }

    /// Full play-through: rewind both tracks and notify the host once.
    fn complete(&mut self) {
        if self.ended_fired {
            debug!("Session already completed");
            return;
        }
        self.ended_fired = true;
        self.tracking = false;
        self.music_only = false;
        // A drag still in progress is released onto the finished session
        self.scrub_resume = (self.state == PlayerState::Seeking).then_some(PlayerState::Ended);

        self.voice.pause();
        self.voice.set_position(Duration::ZERO);
        if let Some(music) = self.music.track() {
            music.pause();
            music.set_position(Duration::ZERO);
            music.set_looping(true);
        }

        self.position = Duration::ZERO;
        self.state = PlayerState::Ended;
        info!("Playback complete");
        self.emit(PlayerEvent::Ended);
        self.publish();

        if let Some(on_ended) = &self.on_ended {
            on_ended();
        }
    }

    /// Stop both tracks and release them.
    pub fn teardown(&mut self) {
        if self.state == PlayerState::Idle {
            return;
        }
        self.tracking = false;
        self.music_only = false;
        self.scrub_resume = None;

        self.voice.release();
        if let Some(music) = self.music.track() {
            music.release();
        }
        self.music = MusicSlot::Absent;
        self.position = Duration::ZERO;
        self.state = PlayerState::Idle;
        info!("Player session closed");
        self.emit(PlayerEvent::Closed);
        self.publish();
    }
}

impl Drop for PlayerSession {
    fn drop(&mut self) {
        self.teardown();
    }
}
