//! Host-facing player handle.
//!
//! [`SyncedAudioPlayer`] runs one [`PlayerSession`] on a background task and
//! serializes everything that touches it: transport commands, media
//! notifications, the background-music lookup, the position-tracking interval
//! and the deadline of a Play request that is waiting for media. Observers
//! read state through a [`watch`] snapshot and a [`broadcast`] event stream,
//! both of which survive [`SyncedAudioPlayer::replace`].

use futures::future::{BoxFuture, FutureExt};
use std::future::pending;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PlayerConfig;
use crate::error::PlayerError;
use crate::music::{resolve_or_none, MusicResolver, NoMusic};
use crate::playback::PlayerSnapshot;
use crate::session::{EndedCallback, PlayReadiness, PlayerEvent, PlayerSession, SessionChannels};
use crate::track::{MediaBackend, MediaEvent, MediaEventReceiver, TrackKind};

const LOG_TARGET: &str = "duet::player";

type Reply = oneshot::Sender<Result<(), PlayerError>>;

enum Command {
    Play(Reply),
    Pause(Reply),
    Seek { secs: f64, reply: Reply },
    SkipBackward(Reply),
    SkipForward(Reply),
    Restart(Reply),
    BeginScrub { secs: f64, reply: Reply },
    ScrubTo { secs: f64 },
    EndScrub { secs: f64, reply: Reply },
    SetMusicVolume { volume: f32 },
}

/// Everything a player needs besides the voice recording itself.
#[derive(Clone)]
pub struct PlayerContext {
    backend: Arc<dyn MediaBackend>,
    resolver: Arc<dyn MusicResolver>,
    config: PlayerConfig,
    on_ended: Option<EndedCallback>,
}

impl PlayerContext {
    /// Context without background music and with default settings.
    #[must_use]
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            backend,
            resolver: Arc::new(NoMusic),
            config: PlayerConfig::default(),
            on_ended: None,
        }
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn MusicResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replace the default settings.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConfigInvalid`](crate::error::CoreError::ConfigInvalid)
    /// if `config` fails [`PlayerConfig::validate`].
    pub fn with_config(mut self, config: PlayerConfig) -> crate::error::Result<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    /// Callback run once each time a session plays through to the end
    #[must_use]
    pub fn on_ended(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_ended = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub const fn config(&self) -> &PlayerConfig {
        &self.config
    }
}

impl std::fmt::Debug for PlayerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerContext")
            .field("backend", &self.backend.name())
            .field("resolver", &self.resolver.name())
            .field("config", &self.config)
            .field("on_ended", &self.on_ended.is_some())
            .finish()
    }
}

/// Handle to a running player session.
///
/// Dropping the handle stops the session.
pub struct SyncedAudioPlayer {
    context: PlayerContext,
    channels: SessionChannels,
    commands: mpsc::UnboundedSender<Command>,
    cancel_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SyncedAudioPlayer {
    /// Start a session for `voice_url`, with background music looked up for
    /// `figure_id`.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn(context: PlayerContext, voice_url: &str, figure_id: Option<&str>) -> Self {
        let channels = SessionChannels::new();
        let (commands, cancel_token, task) = start(&context, &channels, voice_url, figure_id);
        Self {
            context,
            channels,
            commands,
            cancel_token,
            task: Some(task),
        }
    }

    /// Tear down the current session and start a new one.
    ///
    /// The previous session has released its audio before the new one starts
    /// loading. Existing subscriptions keep receiving from the new session.
    pub async fn replace(&mut self, voice_url: &str, figure_id: Option<&str>) {
        self.shutdown().await;
        info!(target: LOG_TARGET, "Replacing session with {}", voice_url);
        let (commands, cancel_token, task) =
            start(&self.context, &self.channels, voice_url, figure_id);
        self.commands = commands;
        self.cancel_token = cancel_token;
        self.task = Some(task);
    }

    /// Stop the session and wait until it has released its audio.
    pub async fn shutdown(&mut self) {
        self.cancel_token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(target: LOG_TARGET, "Player task did not shut down cleanly: {}", e);
            }
        }
    }

    async fn request(&self, command: impl FnOnce(Reply) -> Command) -> Result<(), PlayerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| PlayerError::SessionClosed)?;
        rx.await.map_err(|_| PlayerError::SessionClosed)?
    }

    /// Start or resume playback.
    ///
    /// Waits for voice metadata (bounded by `metadata_timeout_ms`) and for the
    /// background track to be ready (bounded by `music_ready_timeout_ms`,
    /// after which playback goes ahead without it).
    ///
    /// # Errors
    ///
    /// Returns the reason playback could not start.
    pub async fn play(&self) -> Result<(), PlayerError> {
        self.request(Command::Play).await
    }

    /// Pause both tracks. Also cancels a Play request that is still waiting.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::SessionClosed`] if the session is gone.
    pub async fn pause(&self) -> Result<(), PlayerError> {
        self.request(Command::Pause).await
    }

    /// Move the playhead to `secs`.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::PlaybackStart`] if playback could not resume
    /// after the seek.
    pub async fn seek(&self, secs: f64) -> Result<(), PlayerError> {
        self.request(|reply| Command::Seek { secs, reply }).await
    }

    /// # Errors
    ///
    /// See [`SyncedAudioPlayer::seek`].
    pub async fn skip_backward(&self) -> Result<(), PlayerError> {
        self.request(Command::SkipBackward).await
    }

    /// # Errors
    ///
    /// See [`SyncedAudioPlayer::seek`].
    pub async fn skip_forward(&self) -> Result<(), PlayerError> {
        self.request(Command::SkipForward).await
    }

    /// Back to the start, continuing playback if it was playing.
    ///
    /// # Errors
    ///
    /// See [`SyncedAudioPlayer::seek`].
    pub async fn restart(&self) -> Result<(), PlayerError> {
        self.request(Command::Restart).await
    }

    /// Scrubber pressed at `secs`.
    ///
    /// # Errors
    ///
    /// See [`SyncedAudioPlayer::seek`].
    pub async fn begin_scrub(&self, secs: f64) -> Result<(), PlayerError> {
        self.request(|reply| Command::BeginScrub { secs, reply }).await
    }

    /// Scrubber dragged to `secs`. Only the displayed position moves.
    pub fn scrub_to(&self, secs: f64) {
        let _ = self.commands.send(Command::ScrubTo { secs });
    }

    /// Scrubber released at `secs`.
    ///
    /// # Errors
    ///
    /// See [`SyncedAudioPlayer::seek`].
    pub async fn end_scrub(&self, secs: f64) -> Result<(), PlayerError> {
        self.request(|reply| Command::EndScrub { secs, reply }).await
    }

    /// Change the background-music volume.
    pub fn set_music_volume(&self, volume: f32) {
        let _ = self.commands.send(Command::SetMusicVolume { volume });
    }

    /// Latest observable state
    #[must_use]
    pub fn snapshot(&self) -> PlayerSnapshot {
        self.channels.snapshot()
    }

    /// Watch the observable state
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<PlayerSnapshot> {
        self.channels.watch()
    }

    /// Subscribe to player events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.channels.subscribe()
    }
}

impl Drop for SyncedAudioPlayer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

fn start(
    context: &PlayerContext,
    channels: &SessionChannels,
    voice_url: &str,
    figure_id: Option<&str>,
) -> (mpsc::UnboundedSender<Command>, CancellationToken, JoinHandle<()>) {
    let (session, media) = PlayerSession::new(
        context.config.clone(),
        Arc::clone(&context.backend),
        voice_url,
        channels.clone(),
        context.on_ended.clone(),
    );

    let resolver = Arc::clone(&context.resolver);
    let figure_id = figure_id.map(str::to_owned);
    let lookup =
        async move { resolve_or_none(resolver.as_ref(), figure_id.as_deref()).await }.boxed();

    let (commands_tx, commands) = mpsc::unbounded_channel();
    let cancel_token = CancellationToken::new();

    let actor = PlayerActor {
        session,
        media,
        commands,
        lookup: Some(lookup),
        tracker: None,
        pending: None,
        cancel_token: cancel_token.clone(),
    };
    let task = tokio::spawn(actor.run());

    (commands_tx, cancel_token, task)
}

/// A Play request waiting for media.
struct PendingPlay {
    since: Instant,
    replies: Vec<Reply>,
}

enum Wake {
    Cancelled,
    Command(Option<Command>),
    Media(TrackKind, MediaEvent),
    Lookup(Option<String>),
    Tick,
    PlayDeadline,
}

struct PlayerActor {
    session: PlayerSession,
    media: MediaEventReceiver,
    commands: mpsc::UnboundedReceiver<Command>,
    lookup: Option<BoxFuture<'static, Option<String>>>,
    /// Runs only while the session asks for position tracking
    tracker: Option<Interval>,
    pending: Option<PendingPlay>,
    cancel_token: CancellationToken,
}

impl PlayerActor {
    async fn run(mut self) {
        debug!(target: LOG_TARGET, "Player task started");

        loop {
            let deadline = self.play_deadline();
            let lookup = self.lookup.as_mut();
            let tracker = self.tracker.as_mut();

            let wake = tokio::select! {
                () = self.cancel_token.cancelled() => Wake::Cancelled,
                command = self.commands.recv() => Wake::Command(command),
                Some((kind, event)) = self.media.recv() => Wake::Media(kind, event),
                url = async move {
                    match lookup {
                        Some(lookup) => lookup.await,
                        None => pending().await,
                    }
                } => Wake::Lookup(url),
                () = async move {
                    match tracker {
                        Some(tracker) => {
                            tracker.tick().await;
                        }
                        None => pending::<()>().await,
                    }
                } => Wake::Tick,
                () = async move {
                    match deadline {
                        Some(at) => sleep_until(at).await,
                        None => pending::<()>().await,
                    }
                } => Wake::PlayDeadline,
            };

            match wake {
                Wake::Cancelled | Wake::Command(None) => break,
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Media(kind, event) => {
                    self.session.handle_media_event(kind, event);
                    self.try_start_pending().await;
                }
                Wake::Lookup(url) => {
                    self.lookup = None;
                    self.session.attach_music(url);
                    self.try_start_pending().await;
                }
                Wake::Tick => self.session.tick(),
                Wake::PlayDeadline => {
                    if let Some(error) = self.session.play_wait_expired() {
                        self.fail_pending(&error);
                    }
                    self.try_start_pending().await;
                }
            }

            self.sync_tracker();
        }

        self.fail_pending(&PlayerError::SessionClosed);
        self.session.teardown();
        debug!(target: LOG_TARGET, "Player task stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Play(reply) => self.request_play(reply).await,
            Command::Pause(reply) => {
                if let Some(pending) = self.pending.take() {
                    debug!(target: LOG_TARGET, "Pause cancels waiting play request");
                    for waiting in pending.replies {
                        let _ = waiting.send(Ok(()));
                    }
                }
                self.session.pause();
                let _ = reply.send(Ok(()));
            }
            Command::Seek { secs, reply } => {
                let _ = reply.send(self.session.seek(secs).await);
            }
            Command::SkipBackward(reply) => {
                let _ = reply.send(self.session.skip_backward().await);
            }
            Command::SkipForward(reply) => {
                let _ = reply.send(self.session.skip_forward().await);
            }
            Command::Restart(reply) => {
                let _ = reply.send(self.session.restart().await);
            }
            Command::BeginScrub { secs, reply } => {
                let _ = reply.send(self.session.begin_scrub(secs).await);
            }
            Command::ScrubTo { secs } => self.session.scrub_to(secs),
            Command::EndScrub { secs, reply } => {
                let _ = reply.send(self.session.end_scrub(secs).await);
            }
            Command::SetMusicVolume { volume } => self.session.set_music_volume(volume),
        }
    }

    async fn request_play(&mut self, reply: Reply) {
        match self.session.play_readiness() {
            Ok(PlayReadiness::Ready) => {
                let _ = reply.send(self.session.play().await);
            }
            Ok(waiting_for) => {
                debug!(target: LOG_TARGET, "Play waiting for media: {:?}", waiting_for);
                self.pending
                    .get_or_insert_with(|| PendingPlay {
                        since: Instant::now(),
                        replies: Vec::new(),
                    })
                    .replies
                    .push(reply);
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    /// When the waiting Play request gives up on what it is waiting for.
    fn play_deadline(&self) -> Option<Instant> {
        let pending = self.pending.as_ref()?;
        let config = self.session.config();
        let wait = match self.session.play_readiness() {
            Ok(PlayReadiness::AwaitVoice) => config.metadata_timeout(),
            Ok(PlayReadiness::AwaitMusic) => config.music_ready_timeout(),
            Ok(PlayReadiness::Ready) | Err(_) => return Some(Instant::now()),
        };
        Some(pending.since + wait)
    }

    async fn try_start_pending(&mut self) {
        if self.pending.is_none() {
            return;
        }
        match self.session.play_readiness() {
            Ok(PlayReadiness::Ready) => {
                let Some(pending) = self.pending.take() else {
                    return;
                };
                let result = self.session.play().await;
                for reply in pending.replies {
                    let _ = reply.send(result.clone());
                }
            }
            Ok(_) => {}
            Err(e) => self.fail_pending(&e),
        }
    }

    fn fail_pending(&mut self, error: &PlayerError) {
        if let Some(pending) = self.pending.take() {
            for reply in pending.replies {
                let _ = reply.send(Err(error.clone()));
            }
        }
    }

    /// Start or stop the tracking interval to match the session.
    fn sync_tracker(&mut self) {
        match (self.session.is_tracking(), self.tracker.is_some()) {
            (true, false) => {
                let mut tracker = interval(self.session.config().tracking_interval());
                tracker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                self.tracker = Some(tracker);
            }
            (false, true) => self.tracker = None,
            _ => {}
        }
    }
}
