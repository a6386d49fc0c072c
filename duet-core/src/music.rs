//! Background-music lookup.
//!
//! A figure may have zero or one background track. Resolvers map a figure
//! identifier to the URL of that track; a failed lookup is treated the same as
//! a figure without music.

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::CoreError;

/// Trait for background-music resolvers.
#[async_trait]
pub trait MusicResolver: Send + Sync {
    /// Get the resolver name
    fn name(&self) -> &'static str;

    /// Resolve `figure_id` to a background-music URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup itself failed. A figure without music is
    /// `Ok(None)`, not an error.
    async fn resolve(&self, figure_id: &str) -> Result<Option<String>, CoreError>;
}

/// Resolve background music, degrading every failure to "no music".
pub async fn resolve_or_none(
    resolver: &dyn MusicResolver,
    figure_id: Option<&str>,
) -> Option<String> {
    let figure_id = figure_id?;
    match resolver.resolve(figure_id).await {
        Ok(Some(url)) => {
            debug!(
                "Resolved background music for figure {} via {}: {}",
                figure_id,
                resolver.name(),
                url
            );
            Some(url)
        }
        Ok(None) => {
            debug!("No background music for figure {}", figure_id);
            None
        }
        Err(e) => {
            warn!(
                "Background music lookup for figure {} failed, continuing without music: {}",
                figure_id, e
            );
            None
        }
    }
}

/// Resolver for hosts that never play background music.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMusic;

#[async_trait]
impl MusicResolver for NoMusic {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn resolve(&self, _figure_id: &str) -> Result<Option<String>, CoreError> {
        Ok(None)
    }
}

/// Fixed figure → URL table, for bundled ambience.
#[derive(Debug, Default, Clone)]
pub struct StaticMusicResolver {
    tracks: HashMap<String, String>,
}

impl StaticMusicResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a background track for a figure
    #[must_use]
    pub fn with_track(mut self, figure_id: impl Into<String>, url: impl Into<String>) -> Self {
        self.tracks.insert(figure_id.into(), url.into());
        self
    }
}

#[async_trait]
impl MusicResolver for StaticMusicResolver {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn resolve(&self, figure_id: &str) -> Result<Option<String>, CoreError> {
        Ok(self.tracks.get(figure_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingResolver;

    #[async_trait]
    impl MusicResolver for FailingResolver {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn resolve(&self, _figure_id: &str) -> Result<Option<String>, CoreError> {
            Err(CoreError::MusicLookupFailed {
                provider: "failing".into(),
                reason: "connection refused".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_static_resolver_hit_and_miss() {
        let resolver = StaticMusicResolver::new().with_track("grandma", "https://cdn/rain.mp3");

        assert_eq!(
            resolve_or_none(&resolver, Some("grandma")).await,
            Some("https://cdn/rain.mp3".to_string())
        );
        assert_eq!(resolve_or_none(&resolver, Some("wizard")).await, None);
    }

    #[tokio::test]
    async fn test_failure_degrades_to_none() {
        assert_eq!(resolve_or_none(&FailingResolver, Some("grandma")).await, None);
    }

    #[tokio::test]
    async fn test_missing_figure_skips_lookup() {
        assert_eq!(resolve_or_none(&FailingResolver, None).await, None);
    }

    #[tokio::test]
    async fn test_no_music_resolver() {
        assert_eq!(NoMusic.resolve("anyone").await.ok().flatten(), None);
    }
}
