//! # Bot Module
//!
//! Discord glue around the queue engine.
//!
//! - Slash command registration and dispatch ([`commands`], [`handlers`])
//! - Playback announcements from engine events ([`events`])
//! - Guild greeting and external voice-disconnect handling
//!
//! The bot never touches queue or voice state directly; everything goes
//! through [`QueueEngine`].

use dashmap::DashMap;
use serenity::{
    all::{
        ChannelId, ChannelType, Context, EventHandler, Guild, GuildChannel, GuildId, Interaction,
        Ready, UserId, VoiceState,
    },
    async_trait,
    builder::CreateMessage,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod events;
pub mod handlers;

use crate::{
    audio::{EngineError, QueueEngine},
    config::Config,
    storage::JsonStorage,
    ui::embeds,
};

/// Serenity event handler for the jukebox.
///
/// ## Fields
///
/// - `engine`: per-guild queue engine shared with the voice event handlers
/// - `storage`: persisted per-guild settings
/// - `reply_channels`: last text channel a command came from, per guild
pub struct JukeboxBot {
    config: Arc<Config>,
    pub engine: Arc<QueueEngine>,
    pub storage: Arc<tokio::sync::Mutex<JsonStorage>>,
    reply_channels: Arc<DashMap<GuildId, ChannelId>>,
    announcer_started: AtomicBool,
}

impl JukeboxBot {
    pub fn new(
        config: Config,
        engine: Arc<QueueEngine>,
        storage: Arc<tokio::sync::Mutex<JsonStorage>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            engine,
            storage,
            reply_channels: Arc::new(DashMap::new()),
            announcer_started: AtomicBool::new(false),
        }
    }

    pub fn remember_reply_channel(&self, guild_id: GuildId, channel_id: ChannelId) {
        self.reply_channels.insert(guild_id, channel_id);
    }

    async fn register_commands(&self, ctx: &Context) -> anyhow::Result<()> {
        match self.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::new(guild_id);
                commands::register_guild_commands(ctx, guild_id).await?;
                info!("✅ Guild commands registered for {}", guild_id);
            }
            None => {
                commands::register_global_commands(ctx).await?;
                info!("✅ Global commands registered");
            }
        }
        Ok(())
    }

    async fn greet(&self, ctx: &Context, guild: &Guild) -> anyhow::Result<()> {
        let greeting = embeds::message_embed(
            "👋 Hello!",
            format!(
                "Hello people of **{}**! I'm your music bot. Hop in a voice channel and use `/play` to get started.",
                guild.name
            ),
        );

        let bot_id = ctx.cache.current_user().id;
        for channel_id in greeting_channels(guild, bot_id) {
            let message = CreateMessage::new().embed(greeting.clone());
            if let Err(e) = channel_id.send_message(&ctx.http, message).await {
                warn!("Could not greet guild {} in {}: {:?}", guild.name, channel_id, e);
                continue;
            }

            let mut storage = self.storage.lock().await;
            if storage.server_config(guild.id.get()).announcement_channel_id.is_none() {
                storage
                    .set_announcement_channel(guild.id.get(), Some(channel_id.get()))
                    .await?;
            }
            return Ok(());
        }

        warn!("No text channel to greet guild {} in", guild.name);
        Ok(())
    }
}

/// Where to greet a new guild, best first: the system channel, then text
/// channels by position. Channels the bot may not post in are left out.
fn greeting_channels(guild: &Guild, bot_id: UserId) -> Vec<ChannelId> {
    let bot = guild.members.get(&bot_id);
    let text_channels = guild
        .channels
        .values()
        .filter(|channel| channel.kind == ChannelType::Text)
        .filter(|channel| match bot {
            Some(member) => guild.user_permissions_in(channel, member).send_messages(),
            // member list not delivered; let the send itself decide
            None => true,
        });
    order_greeting_channels(guild.system_channel_id, text_channels)
}

fn order_greeting_channels<'a>(
    system_channel: Option<ChannelId>,
    text_channels: impl Iterator<Item = &'a GuildChannel>,
) -> Vec<ChannelId> {
    let mut text_channels: Vec<_> = text_channels.collect();
    text_channels.sort_by_key(|channel| channel.position);

    let mut ordered: Vec<ChannelId> = Vec::with_capacity(text_channels.len());
    if let Some(system) = system_channel {
        if text_channels.iter().any(|channel| channel.id == system) {
            ordered.push(system);
        }
    }
    ordered.extend(
        text_channels
            .iter()
            .map(|channel| channel.id)
            .filter(|id| Some(*id) != system_channel),
    );
    ordered
}

/// True when `user` left the voice channel the engine is playing in.
/// Moves between channels and updates for an earlier channel do not count.
fn left_current_channel(
    bot: UserId,
    user: UserId,
    old_channel: Option<ChannelId>,
    new_channel: Option<ChannelId>,
    engine_channel: Option<ChannelId>,
) -> bool {
    user == bot && new_channel.is_none() && old_channel.is_some() && old_channel == engine_channel
}

#[async_trait]
impl EventHandler for JukeboxBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} is online in {} guilds", ready.user.name, ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error registering commands: {:?}", e);
        }

        // ready fires again on reconnect
        if !self.announcer_started.swap(true, Ordering::SeqCst) {
            tokio::spawn(events::announce_playback_events(
                ctx.http.clone(),
                self.engine.subscribe(),
                self.reply_channels.clone(),
                self.storage.clone(),
            ));
        }
    }

    async fn guild_create(&self, ctx: Context, guild: Guild, is_new: Option<bool>) {
        if is_new != Some(true) {
            return;
        }
        info!("🏠 Joined new guild {} ({})", guild.name, guild.id);
        if let Err(e) = self.greet(&ctx, &guild).await {
            error!("Error greeting guild {}: {:?}", guild.id, e);
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command) = interaction {
            if let Err(e) = handlers::handle_command(&ctx, command, self).await {
                error!("Error handling command: {:?}", e);
            }
        }
    }

    /// Someone else disconnecting the bot is treated like `/stop`.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id || new.channel_id.is_some() {
            return;
        }
        let Some(guild_id) = new.guild_id else {
            return;
        };

        let old_channel = old.and_then(|state| state.channel_id);
        let engine_channel = self.engine.voice_channel(guild_id).await;
        if !left_current_channel(
            current_user_id,
            new.user_id,
            old_channel,
            new.channel_id,
            engine_channel,
        ) {
            return;
        }

        match self.engine.stop(guild_id).await {
            Ok(cleared) => info!(
                "🔌 Disconnected from voice in guild {}, {} queued tracks dropped",
                guild_id, cleared
            ),
            Err(EngineError::NotConnected) => debug!("Voice already torn down in guild {}", guild_id),
            Err(e) => warn!("Error stopping guild {} after disconnect: {}", guild_id, e),
        }
    }
}
