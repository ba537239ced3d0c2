//! # Open Jukebox
//!
//! Per-guild music playback for Discord: a queue engine that owns each
//! guild's queue and voice session, resolves play requests through yt-dlp
//! and keeps playing until the queue runs out.

pub mod audio;
pub mod bot;
pub mod config;
pub mod sources;
pub mod storage;
pub mod ui;
