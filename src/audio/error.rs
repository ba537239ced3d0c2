use thiserror::Error;

use crate::sources::ResolutionError;

/// Failures reported by [`QueueEngine`](super::engine::QueueEngine).
///
/// All of these are local to one guild and one request. The `Display` text is
/// written to be shown to the user as-is.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("You must be in a voice channel to use this command.")]
    NotInVoiceChannel,
    #[error("Could not find that track: {0}")]
    ResolutionFailed(#[from] ResolutionError),
    #[error("Nothing is playing right now.")]
    NothingPlaying,
    #[error("I'm not in a voice channel!")]
    NotConnected,
    #[error("Playback could not start: {0}")]
    SinkStartFailed(String),
    #[error("I couldn't join the voice channel: {0}")]
    JoinFailed(String),
    #[error("Playback was stopped before the track was ready.")]
    Interrupted,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("no voice call for this guild")]
    NoCall,
    #[error("stream rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VoiceError {
    #[error("join failed: {0}")]
    Join(String),
    #[error("leave failed: {0}")]
    Leave(String),
}
