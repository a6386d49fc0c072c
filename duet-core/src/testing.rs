//! Hand-driven media doubles for unit tests.
//!
//! Stub elements never advance on their own: tests move them with
//! [`StubElement::advance`] and feed the matching [`MediaEvent`]s to the
//! session explicitly.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::MediaError;
use crate::gain::GainStage;
use crate::track::{MediaBackend, MediaElement, MediaEvents};

#[derive(Debug)]
struct StubState {
    duration: Option<Duration>,
    position: Duration,
    paused: bool,
    ended: bool,
    looping: bool,
    volume: f32,
    stage: Option<GainStage>,
    released: bool,
    reject_play: Option<MediaError>,
    plays: usize,
}

impl Default for StubState {
    fn default() -> Self {
        Self {
            duration: None,
            position: Duration::ZERO,
            paused: true,
            ended: false,
            looping: false,
            volume: 1.0,
            stage: None,
            released: false,
            reject_play: None,
            plays: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct StubElement {
    state: Mutex<StubState>,
}

impl StubElement {
    fn lock(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_duration(&self, duration: Duration) {
        self.lock().duration = Some(duration);
    }

    pub fn reject_next_play(&self, error: MediaError) {
        self.lock().reject_play = Some(error);
    }

    /// Advance a playing element by `elapsed`, wrapping or ending at its duration.
    pub fn advance(&self, elapsed: Duration) {
        let mut state = self.lock();
        if state.paused || state.ended {
            return;
        }
        let next = state.position + elapsed;
        match state.duration {
            Some(duration) if !duration.is_zero() && next >= duration => {
                if state.looping {
                    let wrapped = next.as_secs_f64() % duration.as_secs_f64();
                    state.position = Duration::from_secs_f64(wrapped);
                } else {
                    state.position = duration;
                    state.ended = true;
                    state.paused = true;
                }
            }
            _ => state.position = next,
        }
    }

    /// Pause without going through the session, as an interruption would.
    pub fn interrupt(&self) {
        self.lock().paused = true;
    }

    pub fn volume(&self) -> f32 {
        self.lock().volume
    }

    pub fn gain_stage(&self) -> Option<GainStage> {
        self.lock().stage.clone()
    }

    pub fn is_looping(&self) -> bool {
        self.lock().looping
    }

    pub fn is_released(&self) -> bool {
        self.lock().released
    }

    pub fn plays(&self) -> usize {
        self.lock().plays
    }
}

#[async_trait]
impl MediaElement for StubElement {
    fn duration(&self) -> Option<Duration> {
        self.lock().duration
    }

    fn position(&self) -> Duration {
        self.lock().position
    }

    fn set_position(&self, position: Duration) {
        let mut state = self.lock();
        state.position = state.duration.map_or(position, |d| position.min(d));
        state.ended = false;
    }

    fn is_paused(&self) -> bool {
        self.lock().paused
    }

    fn is_ended(&self) -> bool {
        self.lock().ended
    }

    fn set_looping(&self, looping: bool) {
        self.lock().looping = looping;
    }

    fn set_volume(&self, volume: f32) {
        self.lock().volume = volume;
    }

    fn route_through(&self, stage: GainStage) {
        self.lock().stage = Some(stage);
    }

    async fn play(&self) -> Result<(), MediaError> {
        let mut state = self.lock();
        if let Some(error) = state.reject_play.take() {
            return Err(error);
        }
        let at_end = state.ended || state.duration.is_some_and(|d| state.position >= d);
        if at_end {
            state.position = Duration::ZERO;
        }
        state.paused = false;
        state.ended = false;
        state.plays += 1;
        Ok(())
    }

    fn pause(&self) {
        self.lock().paused = true;
    }

    fn release(&self) {
        let mut state = self.lock();
        state.paused = true;
        state.released = true;
    }
}

/// Backend handing out [`StubElement`]s keyed by URL.
#[derive(Default)]
pub struct StubBackend {
    elements: Mutex<HashMap<String, Arc<StubElement>>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The element for `url`, created on first use so tests can configure it
    /// before the session opens it.
    pub fn element(&self, url: &str) -> Arc<StubElement> {
        let mut elements = self
            .elements
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(elements.entry(url.to_string()).or_default())
    }
}

impl MediaBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn open(&self, url: &str, _events: MediaEvents) -> Arc<dyn MediaElement> {
        self.element(url)
    }
}
