use serenity::{
    all::Timestamp,
    builder::{CreateEmbed, CreateEmbedFooter},
};

use crate::audio::{
    engine::{JoinOutcome, PlayOutcome, PlaybackEvent, PlaybackState},
    queue::QueueSnapshot,
};

/// Standard palette
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
    pub const ERROR_RED: Colour = Colour::from_rgb(220, 53, 69);
    pub const WARNING_ORANGE: Colour = Colour::from_rgb(255, 193, 7);
    pub const INFO_BLUE: Colour = Colour::from_rgb(52, 144, 220);
    pub const MUSIC_PURPLE: Colour = Colour::from_rgb(138, 43, 226);
    pub const NEUTRAL_GRAY: Colour = Colour::from_rgb(108, 117, 125);
}

const STANDARD_FOOTER: &str = "🎵 Open Jukebox";

/// How many pending entries a queue listing shows before summarizing.
const QUEUE_LISTING_LIMIT: usize = 15;

fn base(title: &str, color: serenity::all::Colour) -> CreateEmbed {
    CreateEmbed::default()
        .title(title)
        .color(color)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
        .timestamp(Timestamp::now())
}

pub fn play_outcome_embed(outcome: &PlayOutcome) -> CreateEmbed {
    match outcome {
        PlayOutcome::Started { title } => base("🎵 Now Playing", colors::SUCCESS_GREEN)
            .description(format!("**{}**", title)),
        PlayOutcome::Queued { title, position } => base("➕ Added to Queue", colors::INFO_BLUE)
            .description(format!("**{}**", title))
            .field("📍 Position", position.to_string(), true),
    }
}

pub fn join_embed(outcome: &JoinOutcome) -> CreateEmbed {
    let text = match outcome {
        JoinOutcome::Joined(channel) => format!("Joined <#{}>!", channel),
        JoinOutcome::Moved(channel) => format!("Moved to <#{}>!", channel),
        JoinOutcome::AlreadyHere(channel) => format!("Already in <#{}>.", channel),
    };
    base("🔊 Voice", colors::SUCCESS_GREEN).description(text)
}

pub fn queue_embed(snapshot: &QueueSnapshot) -> CreateEmbed {
    if snapshot.now_playing.is_none() && snapshot.pending.is_empty() {
        return base("📋 Queue", colors::NEUTRAL_GRAY)
            .description("😴 **The queue is empty.**\n\n💡 Use `/play <song>` to add music");
    }
    base("📋 Queue", colors::INFO_BLUE).description(queue_description(snapshot))
}

/// Plain-text queue listing.
pub fn queue_description(snapshot: &QueueSnapshot) -> String {
    let mut lines = Vec::new();

    if let Some(title) = &snapshot.now_playing {
        lines.push(format!("▶️ **Now playing:** {}", title));
    }

    if !snapshot.pending.is_empty() {
        lines.push("**Up next:**".to_string());
        for (position, title) in snapshot.pending.iter().take(QUEUE_LISTING_LIMIT) {
            lines.push(format!("`{}.` {}", position, title));
        }
        let hidden = snapshot.pending.len().saturating_sub(QUEUE_LISTING_LIMIT);
        if hidden > 0 {
            lines.push(format!("…and {} more", hidden));
        }
    }

    lines.join("\n")
}

pub fn status_embed(state: PlaybackState, snapshot: &QueueSnapshot) -> CreateEmbed {
    match (state, &snapshot.now_playing) {
        (PlaybackState::ConnectedPlaying, Some(title)) => {
            base("🎵 Now Playing", colors::MUSIC_PURPLE)
                .description(format!("**{}**", title))
                .field("📋 Up next", snapshot.pending.len().to_string(), true)
        }
        (PlaybackState::Disconnected, _) => {
            base("💤 Idle", colors::NEUTRAL_GRAY).description("Not connected to voice.")
        }
        _ => base("💤 Idle", colors::NEUTRAL_GRAY).description("Connected, nothing playing."),
    }
}

/// Announcement for something that happened between commands.
pub fn playback_event_embed(event: &PlaybackEvent) -> CreateEmbed {
    match event {
        PlaybackEvent::NowPlaying {
            title,
            requested_by,
            ..
        } => base("🎵 Now Playing", colors::MUSIC_PURPLE)
            .description(format!("**{}**", title))
            .field("👤 Requested by", format!("<@{}>", requested_by), true),
        PlaybackEvent::TrackFailed { title, reason, .. } => base("⚠️ Skipped Track", colors::WARNING_ORANGE)
            .description(format!("**{}** could not be played: {}", title, reason)),
        PlaybackEvent::QueueFinished { .. } => base("📭 Queue Finished", colors::NEUTRAL_GRAY)
            .description("Add more songs with `/play`!"),
        PlaybackEvent::PlaybackStalled { failures, .. } => base("🚨 Playback Stalled", colors::ERROR_RED)
            .description(format!(
                "{} tracks in a row failed to start. Playback paused; `/play` resumes the queue.",
                failures
            )),
    }
}

pub fn message_embed(title: &str, text: impl Into<String>) -> CreateEmbed {
    base(title, colors::SUCCESS_GREEN).description(text.into())
}

pub fn error_embed(text: impl Into<String>) -> CreateEmbed {
    base("❌ Error", colors::ERROR_RED).description(text.into())
}
