use anyhow::Result;
use serenity::{
    builder::{
        CreateEmbed, CreateInteractionResponse, CreateInteractionResponseMessage,
        EditInteractionResponse,
    },
    model::{
        application::CommandInteraction,
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use tracing::{info, warn};

use crate::{bot::JukeboxBot, ui::embeds};

/// Dispatches slash commands
pub async fn handle_command(
    ctx: &Context,
    command: CommandInteraction,
    bot: &JukeboxBot,
) -> Result<()> {
    let Some(guild_id) = command.guild_id else {
        return respond(ctx, &command, embeds::error_embed("Commands only work inside a server.")).await;
    };

    info!(
        "📝 /{} used by {} in guild {}",
        command.data.name, command.user.name, guild_id
    );
    bot.remember_reply_channel(guild_id, command.channel_id);

    match command.data.name.as_str() {
        "play" => handle_play(ctx, &command, bot, guild_id).await,
        "join" => handle_join(ctx, &command, bot, guild_id).await,
        "leave" => handle_leave(ctx, &command, bot, guild_id).await,
        "skip" => handle_skip(ctx, &command, bot, guild_id).await,
        "stop" => handle_stop(ctx, &command, bot, guild_id).await,
        "queue" => handle_queue(ctx, &command, bot, guild_id).await,
        "nowplaying" => handle_nowplaying(ctx, &command, bot, guild_id).await,
        _ => {
            command
                .create_response(
                    &ctx.http,
                    CreateInteractionResponse::Message(
                        CreateInteractionResponseMessage::new()
                            .content("❌ Unknown command")
                            .ephemeral(true),
                    ),
                )
                .await?;
            Ok(())
        }
    }
}

async fn handle_play(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    let query = command
        .data
        .options
        .iter()
        .find(|opt| opt.name == "query")
        .and_then(|opt| opt.value.as_str())
        .ok_or_else(|| anyhow::anyhow!("query option missing"))?
        .to_string();

    // Resolution can take a while
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    let requester_channel = user_voice_channel(ctx, guild_id, command.user.id);
    let embed = match bot
        .engine
        .request_play(guild_id, &query, requester_channel, command.user.id)
        .await
    {
        Ok(outcome) => embeds::play_outcome_embed(&outcome),
        Err(e) => {
            warn!("/play '{}' failed in guild {}: {}", query, guild_id, e);
            embeds::error_embed(e.to_string())
        }
    };

    command
        .edit_response(&ctx.http, EditInteractionResponse::new().embed(embed))
        .await?;
    Ok(())
}

async fn handle_join(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    let requester_channel = user_voice_channel(ctx, guild_id, command.user.id);
    let embed = match bot.engine.join(guild_id, requester_channel).await {
        Ok(outcome) => embeds::join_embed(&outcome),
        Err(e) => embeds::error_embed(e.to_string()),
    };
    respond(ctx, command, embed).await
}

async fn handle_leave(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    let embed = match bot.engine.stop(guild_id).await {
        Ok(_) => embeds::message_embed("👋 Left", "Disconnected from the voice channel!"),
        Err(e) => embeds::error_embed(e.to_string()),
    };
    respond(ctx, command, embed).await
}

async fn handle_skip(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    let embed = match bot.engine.skip(guild_id).await {
        Ok(title) => embeds::message_embed("⏭️ Skipped", format!("**{}**", title)),
        Err(e) => embeds::error_embed(e.to_string()),
    };
    respond(ctx, command, embed).await
}

async fn handle_stop(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    let embed = match bot.engine.stop(guild_id).await {
        Ok(cleared) => embeds::message_embed(
            "⏹️ Stopped",
            format!("Playback stopped, {} queued songs cleared.", cleared),
        ),
        Err(e) => embeds::error_embed(e.to_string()),
    };
    respond(ctx, command, embed).await
}

async fn handle_queue(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    let snapshot = bot.engine.peek_queue(guild_id).await;
    respond(ctx, command, embeds::queue_embed(&snapshot)).await
}

async fn handle_nowplaying(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    let state = bot.engine.state(guild_id).await;
    let snapshot = bot.engine.peek_queue(guild_id).await;
    respond(ctx, command, embeds::status_embed(state, &snapshot)).await
}

async fn respond(ctx: &Context, command: &CommandInteraction, embed: CreateEmbed) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(CreateInteractionResponseMessage::new().embed(embed)),
        )
        .await?;
    Ok(())
}

/// The requester's current voice channel, from the gateway cache.
fn user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    let guild = guild_id.to_guild_cached(&ctx.cache)?;
    guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
}
