//! Silent media backend driven by the Tokio clock.
//!
//! Elements advance with [`tokio::time`] without producing sound and report the
//! same notifications a browser media element would: metadata, buffering,
//! periodic time updates, pause and end. Media is registered per URL; opening an
//! unknown URL fails to load.
//!
//! Because it runs on the Tokio clock, tests can drive whole sessions with
//! paused time.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::MediaError;
use crate::gain::GainStage;
use crate::track::{MediaBackend, MediaElement, MediaEvent, MediaEvents};

const TIME_UPDATE_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_METADATA_DELAY: Duration = Duration::from_millis(20);
const DEFAULT_READY_DELAY: Duration = Duration::from_millis(50);

/// Failure injected into a [`ClockMedia`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockFailure {
    /// The media never loads.
    Load,
    /// Every play attempt is refused.
    RejectPlay,
    /// Decoding fails once playback reaches this position.
    DecodeAt(Duration),
}

/// Description of a piece of media the clock backend can play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockMedia {
    pub duration: Duration,
    /// Delay before metadata is reported
    pub metadata_delay: Duration,
    /// Delay between metadata and "can play through"
    pub ready_delay: Duration,
    pub failure: Option<ClockFailure>,
}

impl ClockMedia {
    #[must_use]
    pub const fn new(duration: Duration) -> Self {
        Self {
            duration,
            metadata_delay: DEFAULT_METADATA_DELAY,
            ready_delay: DEFAULT_READY_DELAY,
            failure: None,
        }
    }

    #[must_use]
    pub const fn with_metadata_delay(mut self, delay: Duration) -> Self {
        self.metadata_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_ready_delay(mut self, delay: Duration) -> Self {
        self.ready_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_failure(mut self, failure: ClockFailure) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// Backend producing [`ClockElement`]s.
#[derive(Debug, Default)]
pub struct ClockBackend {
    library: Mutex<HashMap<String, ClockMedia>>,
    opened: Mutex<Vec<Arc<ClockElement>>>,
}

impl ClockBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register media under `url`
    #[must_use]
    pub fn with_media(self, url: impl Into<String>, media: ClockMedia) -> Self {
        self.insert(url, media);
        self
    }

    pub fn insert(&self, url: impl Into<String>, media: ClockMedia) {
        self.library
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.into(), media);
    }

    /// Most recently opened element for `url`.
    #[must_use]
    pub fn opened(&self, url: &str) -> Option<Arc<ClockElement>> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|element| element.url == url)
            .cloned()
    }

    /// Number of elements opened so far.
    #[must_use]
    pub fn opened_count(&self) -> usize {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl MediaBackend for ClockBackend {
    fn name(&self) -> &'static str {
        "clock"
    }

    /// Must be called from within a Tokio runtime.
    fn open(&self, url: &str, events: MediaEvents) -> Arc<dyn MediaElement> {
        let media = self
            .library
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned();

        let element = Arc::new(ClockElement::new(url, media.as_ref(), events));
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&element));

        let driver = Arc::clone(&element);
        tokio::spawn(async move {
            tokio::select! {
                () = driver.cancel.cancelled() => {
                    debug!("Clock element released: {}", driver.url);
                }
                () = driver.run(media) => {}
            }
        });

        element
    }
}

#[derive(Debug)]
struct ClockState {
    duration: Option<Duration>,
    /// Position at `anchor`, or the paused position
    base: Duration,
    /// Set while playing
    anchor: Option<Instant>,
    looping: bool,
    ended: bool,
    /// Reached the end; the driver has not reported it yet
    ended_pending: bool,
    volume: f32,
    stage: Option<GainStage>,
    released: bool,
    reject_play: bool,
    decode_at: Option<Duration>,
    plays: usize,
}

impl ClockState {
    fn raw_position(&self, now: Instant) -> Duration {
        match self.anchor {
            Some(anchor) => self.base + now.saturating_duration_since(anchor),
            None => self.base,
        }
    }

    /// Apply looping or ending for the time that has passed.
    fn settle(&mut self, now: Instant) {
        let (Some(_), Some(duration)) = (self.anchor, self.duration) else {
            return;
        };
        let raw = self.raw_position(now);
        if duration.is_zero() || raw < duration {
            return;
        }

        if self.looping {
            let wrapped = raw.as_secs_f64() % duration.as_secs_f64();
            self.base = Duration::from_secs_f64(wrapped);
            self.anchor = Some(now);
        } else {
            self.base = duration;
            self.anchor = None;
            self.ended = true;
            self.ended_pending = true;
        }
    }

    fn pause_at(&mut self, now: Instant) -> bool {
        self.settle(now);
        if self.anchor.is_none() {
            return false;
        }
        self.base = self.raw_position(now);
        self.anchor = None;
        true
    }

    /// When the driver next has something to report.
    fn next_wake(&self, now: Instant) -> Option<Instant> {
        if self.ended_pending {
            return Some(now);
        }
        let anchor = self.anchor?;

        let mut wake = now + TIME_UPDATE_INTERVAL;
        if let Some(duration) = self.duration.filter(|_| !self.looping) {
            wake = wake.min(anchor + duration.saturating_sub(self.base));
        }
        if let Some(at) = self.decode_at {
            wake = wake.min(anchor + at.saturating_sub(self.base));
        }
        Some(wake)
    }
}

/// A silent element advancing on the Tokio clock.
#[derive(Debug)]
pub struct ClockElement {
    url: String,
    state: Mutex<ClockState>,
    events: MediaEvents,
    wake: Notify,
    cancel: CancellationToken,
}

impl ClockElement {
    fn new(url: &str, media: Option<&ClockMedia>, events: MediaEvents) -> Self {
        let failure = media.and_then(|m| m.failure);
        Self {
            url: url.to_string(),
            state: Mutex::new(ClockState {
                duration: None,
                base: Duration::ZERO,
                anchor: None,
                looping: false,
                ended: false,
                ended_pending: false,
                volume: 1.0,
                stage: None,
                released: false,
                reject_play: failure == Some(ClockFailure::RejectPlay),
                decode_at: match failure {
                    Some(ClockFailure::DecodeAt(at)) => Some(at),
                    _ => None,
                },
                plays: 0,
            }),
            events,
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn volume(&self) -> f32 {
        self.lock().volume
    }

    #[must_use]
    pub fn is_looping(&self) -> bool {
        self.lock().looping
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.lock().released
    }

    /// Number of successful play calls.
    #[must_use]
    pub fn plays(&self) -> usize {
        self.lock().plays
    }

    async fn run(&self, media: Option<ClockMedia>) {
        let Some(media) = media else {
            sleep(DEFAULT_METADATA_DELAY).await;
            self.events.emit(MediaEvent::Error(MediaError::Load(format!(
                "no media registered for {}",
                self.url
            ))));
            return;
        };

        sleep(media.metadata_delay).await;
        if media.failure == Some(ClockFailure::Load) {
            self.events.emit(MediaEvent::Error(MediaError::Load(format!(
                "failed to load {}",
                self.url
            ))));
            return;
        }
        self.lock().duration = Some(media.duration);
        self.events.emit(MediaEvent::MetadataLoaded {
            duration: media.duration,
        });

        sleep(media.ready_delay).await;
        self.events.emit(MediaEvent::CanPlayThrough);

        loop {
            let next = self.lock().next_wake(Instant::now());
            match next {
                Some(at) => {
                    tokio::select! {
                        () = sleep_until(at) => self.report(),
                        () = self.wake.notified() => {}
                    }
                }
                None => self.wake.notified().await,
            }
        }
    }

    /// Emit whatever changed since the last wake.
    fn report(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        state.settle(now);

        if state.ended_pending {
            state.ended_pending = false;
            drop(state);
            self.events.emit(MediaEvent::Paused);
            self.events.emit(MediaEvent::Ended);
            return;
        }

        if state.anchor.is_none() {
            return;
        }

        let position = state.raw_position(now);
        if let Some(at) = state.decode_at.filter(|at| position >= *at) {
            state.decode_at = None;
            state.pause_at(now);
            drop(state);
            self.events.emit(MediaEvent::Error(MediaError::Decode(format!(
                "corrupt frame at {at:?}"
            ))));
            return;
        }

        drop(state);
        self.events.emit(MediaEvent::TimeUpdate { position });
    }
}

#[async_trait]
impl MediaElement for ClockElement {
    fn duration(&self) -> Option<Duration> {
        self.lock().duration
    }

    fn position(&self) -> Duration {
        let now = Instant::now();
        let mut state = self.lock();
        state.settle(now);
        state.raw_position(now)
    }

    fn set_position(&self, position: Duration) {
        let now = Instant::now();
        {
            let mut state = self.lock();
            state.settle(now);
            let position = state.duration.map_or(position, |d| position.min(d));
            state.base = position;
            if state.anchor.is_some() {
                state.anchor = Some(now);
            }
            state.ended = false;
            state.ended_pending = false;
        }
        self.wake.notify_one();
    }

    fn is_paused(&self) -> bool {
        let mut state = self.lock();
        state.settle(Instant::now());
        state.anchor.is_none()
    }

    fn is_ended(&self) -> bool {
        let mut state = self.lock();
        state.settle(Instant::now());
        state.ended
    }

    fn set_looping(&self, looping: bool) {
        {
            let mut state = self.lock();
            state.settle(Instant::now());
            state.looping = looping;
        }
        self.wake.notify_one();
    }

    fn set_volume(&self, volume: f32) {
        self.lock().volume = volume;
    }

    fn route_through(&self, stage: GainStage) {
        self.lock().stage = Some(stage);
    }

    async fn play(&self) -> Result<(), MediaError> {
        let now = Instant::now();
        {
            let mut state = self.lock();
            if state.released {
                return Err(MediaError::PlayRejected("element was released".into()));
            }
            if state.reject_play {
                return Err(MediaError::PlayRejected(
                    "playback is not allowed without a user gesture".into(),
                ));
            }
            state.settle(now);
            if state.anchor.is_some() {
                return Ok(());
            }
            let at_end = state.ended || state.duration.is_some_and(|d| state.base >= d);
            if at_end {
                state.base = Duration::ZERO;
            }
            state.ended = false;
            state.ended_pending = false;
            state.anchor = Some(now);
            state.plays += 1;
        }
        self.wake.notify_one();
        Ok(())
    }

    fn pause(&self) {
        let paused = self.lock().pause_at(Instant::now());
        if paused {
            self.wake.notify_one();
            self.events.emit(MediaEvent::Paused);
        }
    }

    fn release(&self) {
        {
            let mut state = self.lock();
            state.pause_at(Instant::now());
            state.released = true;
        }
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{MediaEventReceiver, TrackKind};

    const VOICE: &str = "voice.mp3";

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = actual.max(expected) - actual.min(expected);
        assert!(
            diff <= Duration::from_millis(5),
            "expected {expected:?}, got {actual:?}"
        );
    }

    fn open(backend: &ClockBackend, url: &str) -> (Arc<dyn MediaElement>, MediaEventReceiver) {
        let (events, rx) = MediaEvents::channel();
        (backend.open(url, events), rx)
    }

    async fn next_event(rx: &mut MediaEventReceiver) -> MediaEvent {
        loop {
            match rx.recv().await {
                Some((_, MediaEvent::TimeUpdate { .. })) => {}
                Some((kind, event)) => {
                    assert_eq!(kind, TrackKind::Voice);
                    return event;
                }
                None => panic!("media event channel closed"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_metadata_then_ready() {
        let backend = ClockBackend::new().with_media(VOICE, ClockMedia::new(secs(30)));
        let (element, mut rx) = open(&backend, VOICE);
        assert_eq!(element.duration(), None);

        assert_eq!(
            next_event(&mut rx).await,
            MediaEvent::MetadataLoaded { duration: secs(30) }
        );
        assert_eq!(element.duration(), Some(secs(30)));
        assert_eq!(next_event(&mut rx).await, MediaEvent::CanPlayThrough);
        assert_eq!(backend.opened_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_advances_while_playing() {
        let backend = ClockBackend::new().with_media(VOICE, ClockMedia::new(secs(30)));
        let (element, mut rx) = open(&backend, VOICE);
        next_event(&mut rx).await;

        assert!(element.play().await.is_ok());
        sleep(secs(3)).await;
        assert_close(element.position(), secs(3));

        element.pause();
        assert_eq!(next_event(&mut rx).await, MediaEvent::CanPlayThrough);
        assert_eq!(next_event(&mut rx).await, MediaEvent::Paused);
        sleep(secs(3)).await;
        assert_close(element.position(), secs(3));
        assert!(element.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_time_updates() {
        let backend = ClockBackend::new().with_media(VOICE, ClockMedia::new(secs(30)));
        let (element, mut rx) = open(&backend, VOICE);
        sleep(Duration::from_millis(100)).await;
        while rx.try_recv().is_ok() {}

        assert!(element.play().await.is_ok());
        sleep(secs(1)).await;

        let mut updates = 0;
        while let Ok((_, event)) = rx.try_recv() {
            if matches!(event, MediaEvent::TimeUpdate { .. }) {
                updates += 1;
            }
        }
        assert!(updates >= 3, "got {updates} time updates");
    }

    #[tokio::test(start_paused = true)]
    async fn test_plays_to_end() {
        let backend = ClockBackend::new().with_media(VOICE, ClockMedia::new(secs(5)));
        let (element, mut rx) = open(&backend, VOICE);
        next_event(&mut rx).await;
        next_event(&mut rx).await;

        assert!(element.play().await.is_ok());
        assert_eq!(next_event(&mut rx).await, MediaEvent::Paused);
        assert_eq!(next_event(&mut rx).await, MediaEvent::Ended);
        assert!(element.is_ended());
        assert!(element.is_paused());
        assert_eq!(element.position(), secs(5));

        // Playing again starts over
        assert!(element.play().await.is_ok());
        assert_close(element.position(), Duration::ZERO);
        assert!(!element.is_ended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_looping_wraps() {
        let backend = ClockBackend::new().with_media(VOICE, ClockMedia::new(secs(5)));
        let (element, mut rx) = open(&backend, VOICE);
        next_event(&mut rx).await;

        element.set_looping(true);
        assert!(element.play().await.is_ok());
        sleep(secs(7)).await;

        assert_close(element.position(), secs(2));
        assert!(!element.is_ended());
        assert!(!element.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_is_pinned_to_duration() {
        let backend = ClockBackend::new().with_media(VOICE, ClockMedia::new(secs(5)));
        let (element, mut rx) = open(&backend, VOICE);
        next_event(&mut rx).await;

        element.set_position(secs(9));
        assert_eq!(element.position(), secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_url_fails_to_load() {
        let backend = ClockBackend::new();
        let (_element, mut rx) = open(&backend, "missing.mp3");

        assert!(matches!(
            next_event(&mut rx).await,
            MediaEvent::Error(MediaError::Load(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_play() {
        let media = ClockMedia::new(secs(5)).with_failure(ClockFailure::RejectPlay);
        let backend = ClockBackend::new().with_media(VOICE, media);
        let (element, mut rx) = open(&backend, VOICE);
        next_event(&mut rx).await;

        assert!(matches!(
            element.play().await,
            Err(MediaError::PlayRejected(_))
        ));
        assert!(element.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_failure_pauses() {
        let media = ClockMedia::new(secs(30)).with_failure(ClockFailure::DecodeAt(secs(4)));
        let backend = ClockBackend::new().with_media(VOICE, media);
        let (element, mut rx) = open(&backend, VOICE);
        next_event(&mut rx).await;
        next_event(&mut rx).await;

        assert!(element.play().await.is_ok());
        assert!(matches!(
            next_event(&mut rx).await,
            MediaEvent::Error(MediaError::Decode(_))
        ));
        assert!(element.is_paused());
        assert_close(element.position(), secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_stops_element() {
        let backend = ClockBackend::new().with_media(VOICE, ClockMedia::new(secs(30)));
        let (element, mut rx) = open(&backend, VOICE);
        next_event(&mut rx).await;
        assert!(element.play().await.is_ok());

        element.release();
        sleep(secs(2)).await;

        assert!(element.is_paused());
        assert!(backend.opened(VOICE).is_some_and(|e| e.is_released()));
        assert!(element.play().await.is_err());
    }
}
