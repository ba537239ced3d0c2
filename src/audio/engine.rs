//! Per-guild playback coordinator.
//!
//! Every guild gets one [`GuildState`] behind its own async mutex. User
//! commands and sink completion notifications both take that lock before
//! touching the queue or the voice session, so for a single guild they are
//! applied one at a time in arrival order. Different guilds never contend.

use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::{
    error::EngineError,
    queue::{GuildQueue, QueueSnapshot, Track},
    sink::{AudioSink, Completion},
    voice::{VoiceGateway, VoiceSession},
};
use crate::sources::{ResolutionError, TrackResolver};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Upper bound on a single resolver call.
    pub resolve_timeout: Duration,
    /// Consecutive failed tracks tolerated before the guild goes idle. A track
    /// fails when the sink refuses it or its stream breaks while playing.
    pub max_start_failures: u32,
    pub event_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            resolve_timeout: Duration::from_secs(20),
            max_start_failures: 3,
            event_buffer: 64,
        }
    }
}

/// Result of a successful play request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayOutcome {
    Started { title: String },
    Queued { title: String, position: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined(ChannelId),
    Moved(ChannelId),
    AlreadyHere(ChannelId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Disconnected,
    ConnectedIdle,
    ConnectedPlaying,
}

/// Things that happen off the request path, for the bot to announce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    NowPlaying { guild_id: GuildId, title: String, requested_by: UserId },
    TrackFailed { guild_id: GuildId, title: String, reason: String },
    QueueFinished { guild_id: GuildId },
    PlaybackStalled { guild_id: GuildId, failures: u32 },
}

impl PlaybackEvent {
    pub fn guild_id(&self) -> GuildId {
        match self {
            Self::NowPlaying { guild_id, .. }
            | Self::TrackFailed { guild_id, .. }
            | Self::QueueFinished { guild_id }
            | Self::PlaybackStalled { guild_id, .. } => *guild_id,
        }
    }
}

#[derive(Debug, Default)]
struct GuildState {
    queue: GuildQueue,
    voice: VoiceSession,
    /// Bumped on every stop; completions from older generations are ignored.
    generation: u64,
    /// Failed tracks since the last one that played through.
    consecutive_failures: u32,
}

impl GuildState {
    fn playback_state(&self) -> PlaybackState {
        match (self.voice.is_connected(), self.queue.now_playing().is_some()) {
            (false, _) => PlaybackState::Disconnected,
            (true, false) => PlaybackState::ConnectedIdle,
            (true, true) => PlaybackState::ConnectedPlaying,
        }
    }
}

/// What one advance pass did.
#[derive(Debug, Default)]
struct Advance {
    popped: usize,
    started: bool,
    failures: Vec<String>,
}

pub struct QueueEngine {
    me: Weak<QueueEngine>,
    guilds: DashMap<GuildId, Arc<Mutex<GuildState>>>,
    resolver: Arc<dyn TrackResolver>,
    sink: Arc<dyn AudioSink>,
    gateway: Arc<dyn VoiceGateway>,
    settings: EngineSettings,
    events: broadcast::Sender<PlaybackEvent>,
}

impl QueueEngine {
    pub fn new(
        resolver: Arc<dyn TrackResolver>,
        sink: Arc<dyn AudioSink>,
        gateway: Arc<dyn VoiceGateway>,
        settings: EngineSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            guilds: DashMap::new(),
            resolver,
            sink,
            gateway,
            settings,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    /// Resolves `query` and queues it, starting playback if the guild is idle.
    ///
    /// The resolver runs without the guild lock held. Voice is only touched
    /// after resolution succeeds, so a failed lookup leaves the guild exactly
    /// as it was. A `stop` that lands while resolving cancels the request
    /// with [`EngineError::Interrupted`].
    pub async fn request_play(
        &self,
        guild_id: GuildId,
        query: &str,
        requester_channel: Option<ChannelId>,
        requested_by: UserId,
    ) -> Result<PlayOutcome, EngineError> {
        let slot = self.guild(guild_id);

        let generation = {
            let state = slot.lock().await;
            if !state.voice.is_connected() && requester_channel.is_none() {
                return Err(EngineError::NotInVoiceChannel);
            }
            state.generation
        };

        let descriptor =
            match tokio::time::timeout(self.settings.resolve_timeout, self.resolver.resolve(query))
                .await
            {
                Ok(Ok(descriptor)) => descriptor,
                Ok(Err(e)) => {
                    warn!("❌ Could not resolve '{}' for guild {}: {}", query, guild_id, e);
                    return Err(e.into());
                }
                Err(_) => {
                    warn!("⏰ Resolving '{}' timed out for guild {}", query, guild_id);
                    return Err(ResolutionError::Timeout.into());
                }
            };

        let mut state = slot.lock().await;
        if state.generation != generation {
            info!("Play request for '{}' in guild {} cancelled by stop", descriptor.title, guild_id);
            return Err(EngineError::Interrupted);
        }

        self.follow_requester(guild_id, &mut state, requester_channel).await?;

        let track = Track::new(descriptor, requested_by);
        let title = track.title.clone();
        let position = state.queue.enqueue(track);

        if state.queue.now_playing().is_some() {
            return Ok(PlayOutcome::Queued { title, position });
        }

        state.consecutive_failures = 0;
        let advance = self.advance_locked(guild_id, &mut state).await;
        if advance.popped < position {
            Ok(PlayOutcome::Queued {
                title,
                position: position - advance.popped,
            })
        } else if advance.popped == position && advance.started {
            Ok(PlayOutcome::Started { title })
        } else {
            // every popped track up to and including ours failed to start
            let reason = advance
                .failures
                .get(position - 1)
                .cloned()
                .unwrap_or_else(|| "unknown sink failure".to_string());
            Err(EngineError::SinkStartFailed(reason))
        }
    }

    /// Connects to, or moves to, the requester's channel.
    pub async fn join(
        &self,
        guild_id: GuildId,
        requester_channel: Option<ChannelId>,
    ) -> Result<JoinOutcome, EngineError> {
        let channel_id = requester_channel.ok_or(EngineError::NotInVoiceChannel)?;
        let slot = self.guild(guild_id);
        let mut state = slot.lock().await;

        match state.voice.channel() {
            Some(current) if current == channel_id => Ok(JoinOutcome::AlreadyHere(channel_id)),
            Some(_) => {
                state
                    .voice
                    .move_to(self.gateway.as_ref(), guild_id, channel_id)
                    .await
                    .map_err(|e| EngineError::JoinFailed(e.to_string()))?;
                Ok(JoinOutcome::Moved(channel_id))
            }
            None => {
                state
                    .voice
                    .connect(self.gateway.as_ref(), guild_id, channel_id)
                    .await
                    .map_err(|e| EngineError::JoinFailed(e.to_string()))?;
                Ok(JoinOutcome::Joined(channel_id))
            }
        }
    }

    /// Halts the current stream. The resulting completion advances the queue;
    /// this method never advances by itself. Returns the skipped title.
    pub async fn skip(&self, guild_id: GuildId) -> Result<String, EngineError> {
        let slot = self.existing(guild_id).ok_or(EngineError::NothingPlaying)?;
        let state = slot.lock().await;

        let title = state
            .queue
            .now_playing()
            .map(|track| track.title.clone())
            .ok_or(EngineError::NothingPlaying)?;

        info!("⏭️ Skipping '{}' in guild {}", title, guild_id);
        self.sink.stop(guild_id).await;
        Ok(title)
    }

    /// Clears the queue, halts playback and leaves voice.
    /// Returns how many pending tracks were dropped.
    pub async fn stop(&self, guild_id: GuildId) -> Result<usize, EngineError> {
        let slot = self.existing(guild_id).ok_or(EngineError::NotConnected)?;
        let mut state = slot.lock().await;

        if !state.voice.is_connected() {
            return Err(EngineError::NotConnected);
        }

        state.generation += 1;
        state.consecutive_failures = 0;
        let cleared = state.queue.clear();
        self.sink.stop(guild_id).await;
        state.voice.disconnect(self.gateway.as_ref(), guild_id).await;

        info!(
            "⏹️ Stopped guild {} (generation {}, {} tracks dropped)",
            guild_id, state.generation, cleared
        );
        Ok(cleared)
    }

    pub async fn peek_queue(&self, guild_id: GuildId) -> QueueSnapshot {
        let Some(slot) = self.existing(guild_id) else {
            return QueueSnapshot::default();
        };
        let state = slot.lock().await;

        QueueSnapshot {
            now_playing: state.queue.now_playing().map(|track| track.title.clone()),
            pending: state.queue.snapshot(),
        }
    }

    pub async fn state(&self, guild_id: GuildId) -> PlaybackState {
        let Some(slot) = self.existing(guild_id) else {
            return PlaybackState::Disconnected;
        };
        let state = slot.lock().await.playback_state();
        state
    }

    pub async fn voice_channel(&self, guild_id: GuildId) -> Option<ChannelId> {
        let slot = self.existing(guild_id)?;
        let channel = slot.lock().await.voice.channel();
        channel
    }

    /// Completion entry point; reached through [`Completion::complete`] or
    /// [`Completion::fail`].
    pub(crate) async fn on_track_end(
        &self,
        guild_id: GuildId,
        generation: u64,
        failure: Option<String>,
    ) {
        let Some(slot) = self.existing(guild_id) else {
            return;
        };
        let mut state = slot.lock().await;

        if state.generation != generation {
            debug!(
                "Discarding stale completion for guild {} (generation {} != {})",
                guild_id, generation, state.generation
            );
            return;
        }

        let Some(finished) = state.queue.take_now_playing() else {
            debug!("Completion for guild {} with nothing playing", guild_id);
            return;
        };

        match failure {
            None => {
                info!("🎵 Finished '{}' in guild {}", finished.title, guild_id);
                state.consecutive_failures = 0;
            }
            Some(reason) => {
                warn!("❌ '{}' broke off in guild {}: {}", finished.title, guild_id, reason);
                self.publish(PlaybackEvent::TrackFailed {
                    guild_id,
                    title: finished.title,
                    reason,
                });
                if self.record_failure(guild_id, &mut state) {
                    return;
                }
            }
        }

        self.advance_locked(guild_id, &mut state).await;
    }

    /// Pops and starts tracks until one starts, the queue runs dry, or too
    /// many tracks fail in a row. Caller holds the guild lock and has
    /// already cleared `now_playing`.
    async fn advance_locked(&self, guild_id: GuildId, state: &mut GuildState) -> Advance {
        let mut advance = Advance::default();

        loop {
            let Some(track) = state.queue.dequeue_next() else {
                info!("📭 Queue empty for guild {}, staying connected", guild_id);
                self.publish(PlaybackEvent::QueueFinished { guild_id });
                return advance;
            };
            advance.popped += 1;

            let completion = Completion::new(self.me.clone(), guild_id, state.generation);
            match self.sink.start(guild_id, &track.stream_url, completion).await {
                Ok(()) => {
                    info!("▶️ Now playing '{}' in guild {}", track.title, guild_id);
                    self.publish(PlaybackEvent::NowPlaying {
                        guild_id,
                        title: track.title.clone(),
                        requested_by: track.requested_by,
                    });
                    state.queue.set_now_playing(track);
                    advance.started = true;
                    return advance;
                }
                Err(e) => {
                    warn!("❌ Could not start '{}' in guild {}: {}", track.title, guild_id, e);
                    self.publish(PlaybackEvent::TrackFailed {
                        guild_id,
                        title: track.title,
                        reason: e.to_string(),
                    });
                    advance.failures.push(e.to_string());
                    if self.record_failure(guild_id, state) {
                        return advance;
                    }
                }
            }
        }
    }

    /// Counts a failed track. Returns true once the guild has stalled.
    fn record_failure(&self, guild_id: GuildId, state: &mut GuildState) -> bool {
        state.consecutive_failures += 1;
        let failures = state.consecutive_failures;
        if failures < self.settings.max_start_failures {
            return false;
        }
        warn!(
            "🚨 Playback stalled in guild {} after {} failed tracks",
            guild_id, failures
        );
        self.publish(PlaybackEvent::PlaybackStalled { guild_id, failures });
        true
    }

    async fn follow_requester(
        &self,
        guild_id: GuildId,
        state: &mut GuildState,
        requester_channel: Option<ChannelId>,
    ) -> Result<(), EngineError> {
        let result = match (state.voice.channel(), requester_channel) {
            (None, None) => return Err(EngineError::NotInVoiceChannel),
            (None, Some(channel_id)) => {
                state
                    .voice
                    .connect(self.gateway.as_ref(), guild_id, channel_id)
                    .await
            }
            (Some(current), Some(channel_id)) if current != channel_id => {
                state
                    .voice
                    .move_to(self.gateway.as_ref(), guild_id, channel_id)
                    .await
            }
            _ => Ok(()),
        };
        result.map_err(|e| EngineError::JoinFailed(e.to_string()))
    }

    fn publish(&self, event: PlaybackEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn guild(&self, guild_id: GuildId) -> Arc<Mutex<GuildState>> {
        self.guilds
            .entry(guild_id)
            .or_insert_with(|| Arc::new(Mutex::new(GuildState::default())))
            .clone()
    }

    fn existing(&self, guild_id: GuildId) -> Option<Arc<Mutex<GuildState>>> {
        self.guilds.get(&guild_id).map(|slot| slot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{sink::fake::FakeSink, voice::fake::FakeGateway};
    use crate::sources::{MockTrackResolver, TrackDescriptor};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::sync::Notify;

    const GUILD: GuildId = GuildId::new(100);
    const OTHER_GUILD: GuildId = GuildId::new(200);
    const LOBBY: ChannelId = ChannelId::new(10);
    const STAGE: ChannelId = ChannelId::new(11);
    const USER: UserId = UserId::new(5);

    struct Harness {
        engine: Arc<QueueEngine>,
        sink: Arc<FakeSink>,
        gateway: Arc<FakeGateway>,
    }

    fn url_for(query: &str) -> String {
        format!("https://cdn.example/{}", query)
    }

    /// Every query resolves to a track titled after it, except "missing".
    fn catalog() -> MockTrackResolver {
        let mut resolver = MockTrackResolver::new();
        resolver.expect_resolve().returning(|query: &str| {
            if query == "missing" {
                Err(ResolutionError::NoResults)
            } else {
                Ok(TrackDescriptor {
                    title: query.to_string(),
                    stream_url: url_for(query),
                })
            }
        });
        resolver
    }

    fn harness_with(resolver: Arc<dyn TrackResolver>, settings: EngineSettings) -> Harness {
        let sink = Arc::new(FakeSink::default());
        let gateway = Arc::new(FakeGateway::default());
        let engine = QueueEngine::new(resolver, sink.clone(), gateway.clone(), settings);
        Harness {
            engine,
            sink,
            gateway,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(catalog()), EngineSettings::default())
    }

    impl Harness {
        async fn play(&self, query: &str) -> Result<PlayOutcome, EngineError> {
            self.engine
                .request_play(GUILD, query, Some(LOBBY), USER)
                .await
        }

        async fn snapshot(&self) -> QueueSnapshot {
            self.engine.peek_queue(GUILD).await
        }
    }

    fn drain(events: &mut broadcast::Receiver<PlaybackEvent>) -> Vec<PlaybackEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    fn pending(titles: &[&str]) -> Vec<(usize, String)> {
        titles
            .iter()
            .enumerate()
            .map(|(i, title)| (i + 1, title.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn first_play_joins_and_starts() {
        let h = harness();

        let outcome = h.play("A").await.unwrap();

        assert_eq!(outcome, PlayOutcome::Started { title: "A".to_string() });
        assert_eq!(h.gateway.joins.lock().clone(), vec![(GUILD, LOBBY)]);
        assert_eq!(h.sink.started(), vec![url_for("A")]);
        assert_eq!(
            h.snapshot().await,
            QueueSnapshot {
                now_playing: Some("A".to_string()),
                pending: vec![],
            }
        );
        assert_eq!(h.engine.state(GUILD).await, PlaybackState::ConnectedPlaying);
    }

    #[tokio::test]
    async fn full_playback_cycle() {
        let h = harness();
        let mut events = h.engine.subscribe();

        h.play("A").await.unwrap();
        assert_eq!(
            h.play("B").await.unwrap(),
            PlayOutcome::Queued { title: "B".to_string(), position: 1 }
        );
        assert_eq!(
            h.play("C").await.unwrap(),
            PlayOutcome::Queued { title: "C".to_string(), position: 2 }
        );
        assert_eq!(h.snapshot().await.pending, pending(&["B", "C"]));

        h.sink.finish(GUILD).await;
        assert_eq!(
            h.snapshot().await,
            QueueSnapshot {
                now_playing: Some("B".to_string()),
                pending: pending(&["C"]),
            }
        );

        assert_eq!(h.engine.skip(GUILD).await.unwrap(), "B");
        // skip only halts the stream; the notification does the advancing
        assert_eq!(h.snapshot().await.now_playing, Some("B".to_string()));
        h.sink.deliver_halted().await;
        assert_eq!(
            h.snapshot().await,
            QueueSnapshot {
                now_playing: Some("C".to_string()),
                pending: vec![],
            }
        );

        h.sink.finish(GUILD).await;
        assert_eq!(h.snapshot().await, QueueSnapshot::default());
        assert_eq!(h.engine.state(GUILD).await, PlaybackState::ConnectedIdle);
        assert!(h.gateway.leaves.lock().is_empty());
        assert_eq!(
            h.sink.started(),
            vec![url_for("A"), url_for("B"), url_for("C")]
        );

        let seen = drain(&mut events);
        let now_playing: Vec<&str> = seen
            .iter()
            .filter_map(|event| match event {
                PlaybackEvent::NowPlaying { title, .. } => Some(title.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(now_playing, vec!["A", "B", "C"]);
        assert_eq!(
            seen.last(),
            Some(&PlaybackEvent::QueueFinished { guild_id: GUILD })
        );
    }

    #[tokio::test]
    async fn idle_guild_restarts_on_next_play() {
        let h = harness();
        h.play("A").await.unwrap();
        h.sink.finish(GUILD).await;

        let outcome = h.play("B").await.unwrap();

        assert_eq!(outcome, PlayOutcome::Started { title: "B".to_string() });
        assert_eq!(h.gateway.joins.lock().len(), 1);
    }

    #[tokio::test]
    async fn play_without_voice_channel_is_rejected_before_resolving() {
        let mut resolver = MockTrackResolver::new();
        resolver.expect_resolve().never();
        let h = harness_with(Arc::new(resolver), EngineSettings::default());

        let result = h.engine.request_play(GUILD, "A", None, USER).await;

        assert_eq!(result, Err(EngineError::NotInVoiceChannel));
        assert_eq!(h.engine.state(GUILD).await, PlaybackState::Disconnected);
    }

    #[tokio::test]
    async fn connected_guild_accepts_requester_outside_voice() {
        let h = harness();
        h.play("A").await.unwrap();

        let outcome = h.engine.request_play(GUILD, "B", None, USER).await;

        assert_eq!(
            outcome,
            Ok(PlayOutcome::Queued { title: "B".to_string(), position: 1 })
        );
        assert_eq!(h.engine.voice_channel(GUILD).await, Some(LOBBY));
    }

    #[tokio::test]
    async fn failed_resolution_leaves_state_untouched() {
        let h = harness();
        h.play("A").await.unwrap();
        h.play("B").await.unwrap();
        let before = h.snapshot().await;

        let result = h.engine.request_play(GUILD, "missing", Some(STAGE), USER).await;

        assert_eq!(
            result,
            Err(EngineError::ResolutionFailed(ResolutionError::NoResults))
        );
        assert_eq!(h.snapshot().await, before);
        assert_eq!(h.engine.voice_channel(GUILD).await, Some(LOBBY));
        assert_eq!(h.gateway.joins.lock().len(), 1);
    }

    #[tokio::test]
    async fn failed_resolution_does_not_join() {
        let h = harness();

        let result = h.play("missing").await;

        assert!(matches!(result, Err(EngineError::ResolutionFailed(_))));
        assert!(h.gateway.joins.lock().is_empty());
        assert_eq!(h.engine.state(GUILD).await, PlaybackState::Disconnected);
    }

    struct SlowResolver;

    #[async_trait]
    impl TrackResolver for SlowResolver {
        async fn resolve(&self, query: &str) -> Result<TrackDescriptor, ResolutionError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(TrackDescriptor {
                title: query.to_string(),
                stream_url: url_for(query),
            })
        }
    }

    #[tokio::test]
    async fn slow_resolution_times_out() {
        let settings = EngineSettings {
            resolve_timeout: Duration::from_millis(20),
            ..EngineSettings::default()
        };
        let h = harness_with(Arc::new(SlowResolver), settings);

        let result = h.play("A").await;

        assert_eq!(
            result,
            Err(EngineError::ResolutionFailed(ResolutionError::Timeout))
        );
        assert_eq!(h.engine.state(GUILD).await, PlaybackState::Disconnected);
    }

    #[tokio::test]
    async fn play_follows_requester_to_new_channel() {
        let h = harness();
        h.play("A").await.unwrap();

        h.engine
            .request_play(GUILD, "B", Some(STAGE), USER)
            .await
            .unwrap();

        assert_eq!(
            h.gateway.joins.lock().clone(),
            vec![(GUILD, LOBBY), (GUILD, STAGE)]
        );
        assert_eq!(h.engine.voice_channel(GUILD).await, Some(STAGE));
    }

    #[tokio::test]
    async fn refused_join_keeps_queue_empty() {
        let h = harness();
        h.gateway.refuse.lock().insert(LOBBY);

        let result = h.play("A").await;

        assert!(matches!(result, Err(EngineError::JoinFailed(_))));
        assert_eq!(h.snapshot().await, QueueSnapshot::default());
        assert!(h.sink.started().is_empty());
    }

    #[tokio::test]
    async fn skip_with_nothing_playing_changes_nothing() {
        let h = harness();
        assert_eq!(h.engine.skip(GUILD).await, Err(EngineError::NothingPlaying));

        h.engine.join(GUILD, Some(LOBBY)).await.unwrap();
        assert_eq!(h.engine.skip(GUILD).await, Err(EngineError::NothingPlaying));

        assert!(h.sink.stops.lock().is_empty());
        assert_eq!(h.engine.state(GUILD).await, PlaybackState::ConnectedIdle);
    }

    #[tokio::test]
    async fn stop_on_disconnected_guild_fails() {
        let h = harness();
        assert_eq!(h.engine.stop(GUILD).await, Err(EngineError::NotConnected));

        h.play("A").await.unwrap();
        h.engine.stop(GUILD).await.unwrap();
        assert_eq!(h.engine.stop(GUILD).await, Err(EngineError::NotConnected));
    }

    #[tokio::test]
    async fn stop_clears_and_disconnects() {
        let h = harness();
        h.play("A").await.unwrap();
        h.play("B").await.unwrap();
        h.play("C").await.unwrap();

        assert_eq!(h.engine.stop(GUILD).await, Ok(2));

        assert_eq!(h.engine.state(GUILD).await, PlaybackState::Disconnected);
        assert_eq!(h.snapshot().await, QueueSnapshot::default());
        assert_eq!(h.sink.stops.lock().clone(), vec![GUILD]);
        assert_eq!(h.gateway.leaves.lock().clone(), vec![GUILD]);
    }

    #[tokio::test]
    async fn completion_queued_behind_stop_is_ignored() {
        let h = harness();
        h.play("A").await.unwrap();
        h.play("B").await.unwrap();

        h.engine.stop(GUILD).await.unwrap();
        h.sink.deliver_halted().await;

        assert_eq!(h.engine.state(GUILD).await, PlaybackState::Disconnected);
        assert_eq!(h.snapshot().await, QueueSnapshot::default());
        assert_eq!(h.sink.started(), vec![url_for("A")]);
    }

    #[tokio::test]
    async fn stale_completion_does_not_touch_new_session() {
        let h = harness();
        h.play("A").await.unwrap();
        let stale = h.sink.take_active(GUILD).unwrap();
        h.engine.stop(GUILD).await.unwrap();

        h.play("X").await.unwrap();
        h.play("Y").await.unwrap();
        assert_eq!(stale.generation(), 0);
        stale.complete().await;

        assert_eq!(
            h.snapshot().await,
            QueueSnapshot {
                now_playing: Some("X".to_string()),
                pending: pending(&["Y"]),
            }
        );
        assert_eq!(h.sink.started(), vec![url_for("A"), url_for("X")]);
    }

    #[tokio::test]
    async fn broken_stream_is_skipped() {
        let h = harness();
        h.sink.break_url(&url_for("B"));
        let mut events = h.engine.subscribe();

        h.play("A").await.unwrap();
        h.play("B").await.unwrap();
        h.play("C").await.unwrap();
        h.sink.finish(GUILD).await;

        assert_eq!(h.snapshot().await.now_playing, Some("C".to_string()));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&PlaybackEvent::TrackFailed {
            guild_id: GUILD,
            title: "B".to_string(),
            reason: format!("stream rejected: {} expired", url_for("B")),
        }));
        assert_eq!(
            seen.last(),
            Some(&PlaybackEvent::NowPlaying {
                guild_id: GUILD,
                title: "C".to_string(),
                requested_by: USER,
            })
        );
    }

    #[tokio::test]
    async fn repeated_start_failures_stall_the_guild() {
        let h = harness();
        for query in ["B", "C", "D"] {
            h.sink.break_url(&url_for(query));
        }
        let mut events = h.engine.subscribe();

        for query in ["A", "B", "C", "D", "E"] {
            h.play(query).await.unwrap();
        }
        h.sink.finish(GUILD).await;

        assert_eq!(
            h.snapshot().await,
            QueueSnapshot {
                now_playing: None,
                pending: pending(&["E"]),
            }
        );
        assert_eq!(h.engine.state(GUILD).await, PlaybackState::ConnectedIdle);

        let mut stalled = false;
        while let Ok(event) = events.try_recv() {
            stalled |= event == PlaybackEvent::PlaybackStalled { guild_id: GUILD, failures: 3 };
        }
        assert!(stalled);

        // the next request picks the leftover queue back up
        let outcome = h.play("F").await.unwrap();
        assert_eq!(
            outcome,
            PlayOutcome::Queued { title: "F".to_string(), position: 1 }
        );
        assert_eq!(h.snapshot().await.now_playing, Some("E".to_string()));
    }

    #[tokio::test]
    async fn streams_breaking_after_start_stall_the_guild() {
        let h = harness();
        let mut events = h.engine.subscribe();

        for query in ["A", "B", "C", "D", "E"] {
            h.play(query).await.unwrap();
        }
        for _ in 0..3 {
            h.sink.error_out(GUILD, "HTTP 403").await;
        }

        assert_eq!(
            h.snapshot().await,
            QueueSnapshot {
                now_playing: None,
                pending: pending(&["D", "E"]),
            }
        );
        assert_eq!(h.engine.state(GUILD).await, PlaybackState::ConnectedIdle);

        let seen = drain(&mut events);
        let failed: Vec<&str> = seen
            .iter()
            .filter_map(|event| match event {
                PlaybackEvent::TrackFailed { title, reason, .. } => {
                    assert_eq!(reason, "HTTP 403");
                    Some(title.as_str())
                }
                _ => None,
            })
            .collect();
        assert_eq!(failed, vec!["A", "B", "C"]);
        assert_eq!(
            seen.last(),
            Some(&PlaybackEvent::PlaybackStalled { guild_id: GUILD, failures: 3 })
        );

        let outcome = h.play("F").await.unwrap();
        assert_eq!(
            outcome,
            PlayOutcome::Queued { title: "F".to_string(), position: 2 }
        );
        assert_eq!(h.snapshot().await.now_playing, Some("D".to_string()));
    }

    #[tokio::test]
    async fn track_that_plays_through_resets_the_failure_count() {
        let h = harness();
        let mut events = h.engine.subscribe();

        for query in ["A", "B", "C", "D", "E"] {
            h.play(query).await.unwrap();
        }
        h.sink.error_out(GUILD, "reset by peer").await;
        h.sink.error_out(GUILD, "reset by peer").await;
        h.sink.finish(GUILD).await;
        h.sink.error_out(GUILD, "reset by peer").await;

        assert_eq!(h.snapshot().await.now_playing, Some("E".to_string()));
        assert!(!drain(&mut events)
            .iter()
            .any(|event| matches!(event, PlaybackEvent::PlaybackStalled { .. })));
    }

    #[tokio::test]
    async fn start_failure_of_requested_track_is_reported() {
        let h = harness();
        h.sink.break_url(&url_for("A"));

        let result = h.play("A").await;

        assert_eq!(
            result,
            Err(EngineError::SinkStartFailed(format!(
                "stream rejected: {} expired",
                url_for("A")
            )))
        );
        assert_eq!(h.engine.state(GUILD).await, PlaybackState::ConnectedIdle);
        assert_eq!(h.snapshot().await, QueueSnapshot::default());
    }

    /// Blocks inside `resolve` until released.
    struct GatedResolver {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl TrackResolver for GatedResolver {
        async fn resolve(&self, query: &str) -> Result<TrackDescriptor, ResolutionError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(TrackDescriptor {
                title: query.to_string(),
                stream_url: url_for(query),
            })
        }
    }

    #[tokio::test]
    async fn stop_during_resolution_cancels_the_request() {
        let resolver = Arc::new(GatedResolver {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let h = harness_with(resolver.clone(), EngineSettings::default());
        h.engine.join(GUILD, Some(LOBBY)).await.unwrap();

        let engine = h.engine.clone();
        let pending_play = tokio::spawn(async move {
            engine.request_play(GUILD, "late", Some(LOBBY), USER).await
        });
        resolver.entered.notified().await;

        h.engine.stop(GUILD).await.unwrap();
        resolver.release.notify_one();

        assert_eq!(pending_play.await.unwrap(), Err(EngineError::Interrupted));
        assert_eq!(h.engine.state(GUILD).await, PlaybackState::Disconnected);
        assert!(h.sink.started().is_empty());
    }

    #[tokio::test]
    async fn join_reports_what_happened() {
        let h = harness();

        assert_eq!(h.engine.join(GUILD, None).await, Err(EngineError::NotInVoiceChannel));
        assert_eq!(h.engine.join(GUILD, Some(LOBBY)).await, Ok(JoinOutcome::Joined(LOBBY)));
        assert_eq!(
            h.engine.join(GUILD, Some(LOBBY)).await,
            Ok(JoinOutcome::AlreadyHere(LOBBY))
        );
        assert_eq!(h.engine.join(GUILD, Some(STAGE)).await, Ok(JoinOutcome::Moved(STAGE)));
        assert_eq!(h.gateway.joins.lock().len(), 2);
    }

    #[tokio::test]
    async fn peek_unknown_guild_is_empty() {
        let h = harness();
        assert_eq!(h.engine.peek_queue(OTHER_GUILD).await, QueueSnapshot::default());
        assert_eq!(h.engine.state(OTHER_GUILD).await, PlaybackState::Disconnected);
    }

    #[tokio::test]
    async fn guilds_are_isolated() {
        let h = harness();
        h.play("A").await.unwrap();
        h.engine
            .request_play(OTHER_GUILD, "Z", Some(STAGE), USER)
            .await
            .unwrap();

        h.engine.stop(GUILD).await.unwrap();
        h.sink.finish(OTHER_GUILD).await;

        assert_eq!(h.engine.state(GUILD).await, PlaybackState::Disconnected);
        assert_eq!(h.engine.state(OTHER_GUILD).await, PlaybackState::ConnectedIdle);
        assert_eq!(h.engine.voice_channel(OTHER_GUILD).await, Some(STAGE));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_each_land_once() {
        let h = harness();
        h.play("first").await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..20 {
            let engine = h.engine.clone();
            tasks.push(tokio::spawn(async move {
                engine
                    .request_play(GUILD, &format!("t{}", i), Some(LOBBY), USER)
                    .await
            }));
        }
        let mut positions = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                Ok(PlayOutcome::Queued { position, .. }) => positions.push(position),
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
        positions.sort_unstable();

        assert_eq!(positions, (1..=20).collect::<Vec<_>>());
        assert_eq!(h.snapshot().await.pending.len(), 20);
        assert_eq!(h.sink.started().len(), 1);
    }
}
