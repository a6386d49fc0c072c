//! Volume control capability.
//!
//! Some platforms ignore an element's own volume property, so volume must be
//! applied by a gain stage in the audio graph instead. The strategy is chosen
//! once, when a track is constructed; the session only ever talks to
//! [`GainControl`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::track::MediaElement;

/// Configured volume strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GainMode {
    /// Pick based on the platform the player runs on.
    #[default]
    Auto,
    /// Always use the element's volume property.
    ElementVolume,
    /// Always route through a gain stage.
    GainNode,
}

/// Resolved volume strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainStrategy {
    ElementVolume,
    GainNode,
}

impl GainStrategy {
    /// Resolve the strategy for `mode` on the current platform.
    #[must_use]
    pub fn detect(mode: GainMode) -> Self {
        match mode {
            GainMode::ElementVolume => Self::ElementVolume,
            GainMode::GainNode => Self::GainNode,
            GainMode::Auto => Self::for_platform(std::env::consts::OS),
        }
    }

    /// iOS does not honor per-element volume, everything else does.
    #[must_use]
    pub fn for_platform(os: &str) -> Self {
        if os == "ios" {
            Self::GainNode
        } else {
            Self::ElementVolume
        }
    }

    /// Build the control for `element`.
    #[must_use]
    pub fn attach(self, element: &Arc<dyn MediaElement>) -> Box<dyn GainControl> {
        match self {
            Self::ElementVolume => Box::new(ElementVolume::new(Arc::clone(element))),
            Self::GainNode => {
                let stage = GainStage::new(1.0);
                element.set_volume(1.0);
                element.route_through(stage.clone());
                Box::new(GainNode { stage })
            }
        }
    }
}

/// Sets and reports a track's volume.
pub trait GainControl: Send + Sync {
    /// Apply `volume` in `[0, 1]`.
    fn set_gain(&self, volume: f32);

    /// Last applied volume.
    fn gain(&self) -> f32;
}

/// Shared gain factor read by a backend's render path.
#[derive(Debug, Clone)]
pub struct GainStage(Arc<AtomicU32>);

impl GainStage {
    #[must_use]
    pub fn new(factor: f32) -> Self {
        Self(Arc::new(AtomicU32::new(factor.to_bits())))
    }

    pub fn set(&self, factor: f32) {
        self.0.store(factor.to_bits(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn factor(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Volume through the element's own volume property.
pub struct ElementVolume {
    element: Arc<dyn MediaElement>,
    level: GainStage,
}

impl ElementVolume {
    #[must_use]
    pub fn new(element: Arc<dyn MediaElement>) -> Self {
        Self {
            element,
            level: GainStage::new(1.0),
        }
    }
}

impl GainControl for ElementVolume {
    fn set_gain(&self, volume: f32) {
        self.level.set(volume);
        self.element.set_volume(volume);
    }

    fn gain(&self) -> f32 {
        self.level.factor()
    }
}

/// Volume through a gain stage; the element itself stays at full volume.
pub struct GainNode {
    stage: GainStage,
}

impl GainControl for GainNode {
    fn set_gain(&self, volume: f32) {
        self.stage.set(volume);
    }

    fn gain(&self) -> f32 {
        self.stage.factor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubElement;

    #[test]
    fn test_platform_detection() {
        assert_eq!(GainStrategy::for_platform("ios"), GainStrategy::GainNode);
        assert_eq!(GainStrategy::for_platform("macos"), GainStrategy::ElementVolume);
        assert_eq!(GainStrategy::for_platform("linux"), GainStrategy::ElementVolume);
    }

    #[test]
    fn test_explicit_mode_overrides_platform() {
        assert_eq!(
            GainStrategy::detect(GainMode::GainNode),
            GainStrategy::GainNode
        );
        assert_eq!(
            GainStrategy::detect(GainMode::ElementVolume),
            GainStrategy::ElementVolume
        );
    }

    #[test]
    fn test_element_volume_writes_property() {
        let stub = Arc::new(StubElement::default());
        let element: Arc<dyn MediaElement> = stub.clone();
        let gain = GainStrategy::ElementVolume.attach(&element);

        gain.set_gain(0.2);
        assert!((stub.volume() - 0.2).abs() < f32::EPSILON);
        assert!((gain.gain() - 0.2).abs() < f32::EPSILON);
        assert!(stub.gain_stage().is_none());
    }

    #[test]
    fn test_gain_node_keeps_element_at_full_volume() {
        let stub = Arc::new(StubElement::default());
        let element: Arc<dyn MediaElement> = stub.clone();
        let gain = GainStrategy::GainNode.attach(&element);

        gain.set_gain(0.12);
        assert!((stub.volume() - 1.0).abs() < f32::EPSILON);
        let stage = stub.gain_stage();
        assert!(stage.is_some_and(|s| (s.factor() - 0.12).abs() < f32::EPSILON));
    }

    #[test]
    fn test_gain_mode_deserializes_snake_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            gain: GainMode,
        }
        let parsed: Result<Wrapper, _> = toml::from_str("gain = \"gain_node\"");
        assert!(parsed.is_ok_and(|w| w.gain == GainMode::GainNode));
    }
}
