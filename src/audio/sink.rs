use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serenity::model::id::GuildId;
use songbird::{
    input::{HttpRequest, Input},
    tracks::{PlayMode, TrackHandle},
    Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tracing::{debug, warn};

use super::{engine::QueueEngine, error::SinkError};

/// Fired once when a stream handed to [`AudioSink::start`] ends for any reason.
///
/// Carries the guild generation that was current at start time so the engine
/// can drop notifications that outlived a `stop`.
pub struct Completion {
    engine: Weak<QueueEngine>,
    guild_id: GuildId,
    generation: u64,
}

impl Completion {
    pub(crate) fn new(engine: Weak<QueueEngine>, guild_id: GuildId, generation: u64) -> Self {
        Self {
            engine,
            guild_id,
            generation,
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Delivers a normal end of stream into the guild's serialized domain.
    pub async fn complete(self) {
        self.deliver(None).await;
    }

    /// Delivers a stream that died after it was accepted, e.g. an upstream
    /// 403 halfway through. Counts as a failed track.
    pub async fn fail(self, reason: String) {
        self.deliver(Some(reason)).await;
    }

    async fn deliver(self, failure: Option<String>) {
        match self.engine.upgrade() {
            Some(engine) => {
                engine
                    .on_track_end(self.guild_id, self.generation, failure)
                    .await
            }
            None => debug!("Engine gone, dropping completion for guild {}", self.guild_id),
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("guild_id", &self.guild_id)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Streams audio into a guild's voice connection.
///
/// Implementations must deliver the [`Completion`] exactly once for every
/// successful `start`, including when the stream is ended through `stop`:
/// [`Completion::complete`] for a normal end, [`Completion::fail`] when the
/// stream breaks after `start` returned.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn start(
        &self,
        guild_id: GuildId,
        stream_url: &str,
        on_complete: Completion,
    ) -> Result<(), SinkError>;

    /// Ends the active stream, if any. Idempotent.
    async fn stop(&self, guild_id: GuildId);
}

/// How long a stream may take to open before `start` gives up on it.
const LOAD_TIMEOUT: Duration = Duration::from_secs(15);

/// [`AudioSink`] that plays HTTP streams through songbird.
pub struct SongbirdSink {
    manager: Arc<Songbird>,
    http: reqwest::Client,
    tracks: DashMap<GuildId, TrackHandle>,
}

impl SongbirdSink {
    pub fn new(manager: Arc<Songbird>, http: reqwest::Client) -> Self {
        Self {
            manager,
            http,
            tracks: DashMap::new(),
        }
    }
}

#[async_trait]
impl AudioSink for SongbirdSink {
    async fn start(
        &self,
        guild_id: GuildId,
        stream_url: &str,
        on_complete: Completion,
    ) -> Result<(), SinkError> {
        let call = self.manager.get(guild_id).ok_or(SinkError::NoCall)?;

        let input = Input::from(HttpRequest::new(self.http.clone(), stream_url.to_string()));
        let handle = {
            let mut call = call.lock().await;
            call.play_only_input(input)
        };

        // Inputs load lazily; a dead URL only shows up once the request is made
        match tokio::time::timeout(LOAD_TIMEOUT, handle.make_playable_async()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.stop();
                return Err(SinkError::Rejected(e.to_string()));
            }
            Err(_) => {
                let _ = handle.stop();
                return Err(SinkError::Rejected(format!(
                    "stream did not open within {}s",
                    LOAD_TIMEOUT.as_secs()
                )));
            }
        }

        // End and Error both terminate a track; whichever fires first wins.
        let slot = Arc::new(Mutex::new(Some(on_complete)));
        for event in [TrackEvent::End, TrackEvent::Error] {
            let notifier = TrackEndNotifier {
                guild_id,
                slot: slot.clone(),
            };
            if let Err(e) = handle.add_event(Event::Track(event), notifier) {
                // Disarm before stopping so the failed start never notifies
                slot.lock().take();
                let _ = handle.stop();
                return Err(SinkError::Rejected(e.to_string()));
            }
        }

        self.tracks.insert(guild_id, handle);
        Ok(())
    }

    async fn stop(&self, guild_id: GuildId) {
        if let Some((_, handle)) = self.tracks.remove(&guild_id) {
            let _ = handle.stop();
        }
    }
}

struct TrackEndNotifier {
    guild_id: GuildId,
    slot: Arc<Mutex<Option<Completion>>>,
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let mut failure = None;
        if let EventContext::Track(tracks) = ctx {
            for (state, _handle) in *tracks {
                if let PlayMode::Errored(e) = &state.playing {
                    warn!("❌ Stream error in guild {}: {}", self.guild_id, e);
                    failure = Some(e.to_string());
                }
            }
        }

        let completion = self.slot.lock().take();
        match (completion, failure) {
            (Some(completion), Some(reason)) => completion.fail(reason).await,
            (Some(completion), None) => completion.complete().await,
            (None, _) => {}
        }

        None
    }
}
