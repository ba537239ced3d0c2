use dashmap::DashMap;
use serenity::{
    builder::CreateMessage,
    http::Http,
    model::id::{ChannelId, GuildId},
};
use std::sync::Arc;
use tokio::sync::{broadcast, broadcast::error::RecvError, Mutex};
use tracing::{debug, error, warn};

use crate::{audio::PlaybackEvent, storage::JsonStorage, ui::embeds};

/// Forwards engine events to each guild's text channel until the engine goes away.
pub async fn announce_playback_events(
    http: Arc<Http>,
    mut events: broadcast::Receiver<PlaybackEvent>,
    reply_channels: Arc<DashMap<GuildId, ChannelId>>,
    storage: Arc<Mutex<JsonStorage>>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Announcer fell behind, {} events dropped", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let guild_id = event.guild_id();
        let Some(channel_id) = announcement_target(guild_id, &reply_channels, &storage).await else {
            debug!("No announcement channel for guild {}", guild_id);
            continue;
        };

        let message = CreateMessage::new().embed(embeds::playback_event_embed(&event));
        if let Err(e) = channel_id.send_message(&http, message).await {
            error!("Error sending announcement to {}: {:?}", channel_id, e);
        }
    }
}

/// The channel the last command came from, else the stored announcement channel.
async fn announcement_target(
    guild_id: GuildId,
    reply_channels: &DashMap<GuildId, ChannelId>,
    storage: &Mutex<JsonStorage>,
) -> Option<ChannelId> {
    if let Some(channel_id) = reply_channels.get(&guild_id).map(|c| *c) {
        return Some(channel_id);
    }
    storage
        .lock()
        .await
        .server_config(guild_id.get())
        .announcement_channel_id
        .map(ChannelId::new)
}
