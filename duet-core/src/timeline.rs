//! The unified timeline presented over a voice track and an optional
//! background-music track.
//!
//! The timeline is as long as the longer of the two tracks. Unknown or zero
//! durations count as zero, so the effective duration is always a valid,
//! non-negative [`Duration`].

use std::time::Duration;

use crate::time::duration_from_secs_lossy;

/// Which track currently drives the unified position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineSource {
    /// The voice track is still within its own duration.
    Voice,
    /// The voice track has finished and the background track carries on.
    Music,
}

/// Direction of a relative skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDirection {
    Backward,
    Forward,
}

/// Snapshot of both track durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timeline {
    voice: Duration,
    music: Option<Duration>,
}

impl Timeline {
    /// Build a timeline from the known track durations.
    ///
    /// `music` is `None` when the session has no background track at all. A
    /// background track whose duration is not known yet is `Some(Duration::ZERO)`.
    #[must_use]
    pub fn new(voice: Option<Duration>, music: Option<Duration>) -> Self {
        Self {
            voice: voice.unwrap_or(Duration::ZERO),
            music,
        }
    }

    /// Voice duration, zero while unknown.
    #[must_use]
    pub const fn voice(&self) -> Duration {
        self.voice
    }

    /// Background-music duration, if a background track exists.
    #[must_use]
    pub const fn music(&self) -> Option<Duration> {
        self.music
    }

    /// Length of the user-visible timeline: `max(voice, music)`.
    #[must_use]
    pub fn effective_duration(&self) -> Duration {
        self.voice.max(self.music.unwrap_or(Duration::ZERO))
    }

    /// Clamp a position onto `[0, effective_duration]`.
    #[must_use]
    pub fn clamp(&self, position: Duration) -> Duration {
        position.min(self.effective_duration())
    }

    /// Clamp a seek target given in floating-point seconds.
    #[must_use]
    pub fn clamp_secs(&self, secs: f64) -> Duration {
        self.clamp(duration_from_secs_lossy(secs))
    }

    /// Whether `position` lies at or past the end of a known voice duration.
    #[must_use]
    pub fn is_beyond_voice(&self, position: Duration) -> bool {
        !self.voice.is_zero() && position >= self.voice
    }

    /// Whether `position` is the end of a non-empty timeline.
    #[must_use]
    pub fn is_at_end(&self, position: Duration) -> bool {
        let end = self.effective_duration();
        !end.is_zero() && position >= end
    }

    /// Which track should drive the unified position at `position`.
    #[must_use]
    pub fn source_at(&self, position: Duration) -> TimelineSource {
        if self.is_beyond_voice(position) && self.music.is_some() {
            TimelineSource::Music
        } else {
            TimelineSource::Voice
        }
    }

    /// Position after skipping `step` in `direction`, clamped to the timeline.
    #[must_use]
    pub fn skip(&self, position: Duration, step: Duration, direction: SkipDirection) -> Duration {
        match direction {
            SkipDirection::Backward => position.saturating_sub(step),
            SkipDirection::Forward => self.clamp(position.saturating_add(step)),
        }
    }

    /// Map a scrubber fraction onto the timeline.
    #[must_use]
    pub fn position_at_fraction(&self, fraction: f64) -> Duration {
        position_at_fraction(fraction, self.effective_duration())
    }
}

/// Fraction of the scrubber width under a pointer, clamped to `[0, 1]`.
///
/// A bar without width maps every pointer to the start.
#[must_use]
pub fn fraction_from_pointer(pointer_x: f64, bar_left: f64, bar_width: f64) -> f64 {
    if bar_width.is_nan() || bar_width <= 0.0 {
        return 0.0;
    }
    let fraction = (pointer_x - bar_left) / bar_width;
    if fraction.is_nan() {
        0.0
    } else {
        fraction.clamp(0.0, 1.0)
    }
}

/// Map a fraction of the scrubber onto `[0, effective]`.
#[must_use]
pub fn position_at_fraction(fraction: f64, effective: Duration) -> Duration {
    let fraction = if fraction.is_nan() {
        0.0
    } else {
        fraction.clamp(0.0, 1.0)
    };
    duration_from_secs_lossy(effective.as_secs_f64() * fraction).min(effective)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_effective_duration_is_max_of_tracks() {
        let cases = [
            (Some(secs(30)), None, secs(30)),
            (Some(secs(10)), Some(secs(60)), secs(60)),
            (Some(secs(90)), Some(secs(60)), secs(90)),
            (None, Some(secs(45)), secs(45)),
            (Some(Duration::ZERO), Some(Duration::ZERO), Duration::ZERO),
            (None, None, Duration::ZERO),
            (None, Some(Duration::ZERO), Duration::ZERO),
        ];

        for (voice, music, expected) in cases {
            let timeline = Timeline::new(voice, music);
            assert_eq!(
                timeline.effective_duration(),
                expected,
                "voice={voice:?} music={music:?}"
            );
        }
    }

    #[test]
    fn test_clamp_secs_handles_garbage_input() {
        let timeline = Timeline::new(Some(secs(10)), Some(secs(20)));
        assert_eq!(timeline.clamp_secs(-4.0), Duration::ZERO);
        assert_eq!(timeline.clamp_secs(f64::NAN), Duration::ZERO);
        assert_eq!(timeline.clamp_secs(25.0), secs(20));
        assert_eq!(timeline.clamp_secs(f64::INFINITY), secs(20));
        assert_eq!(timeline.clamp_secs(12.5), Duration::from_millis(12_500));
    }

    #[test]
    fn test_clamp_on_empty_timeline() {
        let timeline = Timeline::default();
        assert_eq!(timeline.clamp_secs(5.0), Duration::ZERO);
        assert!(!timeline.is_at_end(Duration::ZERO));
    }

    #[test]
    fn test_beyond_voice_requires_known_voice_duration() {
        let unknown = Timeline::new(None, Some(secs(60)));
        assert!(!unknown.is_beyond_voice(secs(5)));

        let known = Timeline::new(Some(secs(10)), Some(secs(60)));
        assert!(!known.is_beyond_voice(Duration::from_millis(9_999)));
        assert!(known.is_beyond_voice(secs(10)));
        assert!(known.is_beyond_voice(secs(30)));
    }

    #[test]
    fn test_source_switches_to_music_after_voice() {
        let timeline = Timeline::new(Some(secs(10)), Some(secs(60)));
        assert_eq!(timeline.source_at(secs(3)), TimelineSource::Voice);
        assert_eq!(timeline.source_at(secs(10)), TimelineSource::Music);

        let voice_only = Timeline::new(Some(secs(10)), None);
        assert_eq!(voice_only.source_at(secs(10)), TimelineSource::Voice);
    }

    #[test]
    fn test_skip_clamps_both_ends() {
        let timeline = Timeline::new(Some(secs(30)), None);
        let step = secs(5);
        assert_eq!(
            timeline.skip(secs(3), step, SkipDirection::Backward),
            Duration::ZERO
        );
        assert_eq!(
            timeline.skip(secs(12), step, SkipDirection::Backward),
            secs(7)
        );
        assert_eq!(timeline.skip(secs(12), step, SkipDirection::Forward), secs(17));
        assert_eq!(timeline.skip(secs(28), step, SkipDirection::Forward), secs(30));
    }

    #[test]
    fn test_fraction_from_pointer() {
        assert!((fraction_from_pointer(150.0, 100.0, 200.0) - 0.25).abs() < f64::EPSILON);
        assert!((fraction_from_pointer(50.0, 100.0, 200.0)).abs() < f64::EPSILON);
        assert!((fraction_from_pointer(400.0, 100.0, 200.0) - 1.0).abs() < f64::EPSILON);
        assert!((fraction_from_pointer(150.0, 100.0, 0.0)).abs() < f64::EPSILON);
        assert!((fraction_from_pointer(f64::NAN, 100.0, 200.0)).abs() < f64::EPSILON);
    }

    #[test]
    fn test_position_at_fraction() {
        let timeline = Timeline::new(Some(secs(10)), Some(secs(40)));
        assert_eq!(timeline.position_at_fraction(0.5), secs(20));
        assert_eq!(timeline.position_at_fraction(1.5), secs(40));
        assert_eq!(timeline.position_at_fraction(-1.0), Duration::ZERO);
        assert_eq!(position_at_fraction(0.5, Duration::ZERO), Duration::ZERO);
    }
}
