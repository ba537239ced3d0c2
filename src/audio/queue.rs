use serenity::model::id::UserId;
use std::collections::VecDeque;
use tracing::{debug, info};

use crate::sources::TrackDescriptor;

/// A resolved, playable track. Never mutated once queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub title: String,
    pub stream_url: String,
    pub requested_by: UserId,
}

impl Track {
    pub fn new(descriptor: TrackDescriptor, requested_by: UserId) -> Self {
        Self {
            title: descriptor.title,
            stream_url: descriptor.stream_url,
            requested_by,
        }
    }
}

/// Pending tracks plus the "now playing" slot for one guild.
///
/// `now_playing` is only ever written by the engine, which sets it after the
/// sink accepted a stream and clears it on completion or stop. `pending` never
/// holds the playing track.
#[derive(Debug, Default)]
pub struct GuildQueue {
    pending: VecDeque<Track>,
    now_playing: Option<Track>,
}

/// Read-only view of a queue: 1-indexed positions, playing track reported apart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub now_playing: Option<String>,
    pub pending: Vec<(usize, String)>,
}

impl GuildQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends to the back of the queue and returns its 1-indexed position.
    pub fn enqueue(&mut self, track: Track) -> usize {
        info!("➕ Queued: {}", track.title);
        self.pending.push_back(track);
        self.pending.len()
    }

    /// FIFO pop. Leaves `now_playing` untouched.
    pub fn dequeue_next(&mut self) -> Option<Track> {
        let next = self.pending.pop_front();
        if let Some(track) = &next {
            debug!("➡️ Next in queue: {}", track.title);
        }
        next
    }

    /// Empties the queue and the playing slot. Does not touch any live stream.
    pub fn clear(&mut self) -> usize {
        let cleared = self.pending.len();
        self.pending.clear();
        self.now_playing = None;
        info!("🗑️ Queue cleared ({} pending removed)", cleared);
        cleared
    }

    pub fn snapshot(&self) -> Vec<(usize, String)> {
        self.pending
            .iter()
            .enumerate()
            .map(|(i, track)| (i + 1, track.title.clone()))
            .collect()
    }

    pub fn now_playing(&self) -> Option<&Track> {
        self.now_playing.as_ref()
    }

    pub(crate) fn set_now_playing(&mut self, track: Track) {
        self.now_playing = Some(track);
    }

    pub(crate) fn take_now_playing(&mut self) -> Option<Track> {
        self.now_playing.take()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn track(title: &str) -> Track {
    Track::new(
        TrackDescriptor {
            title: title.to_string(),
            stream_url: format!("https://cdn.example/{}", title.to_lowercase()),
        },
        UserId::new(1),
    )
}
