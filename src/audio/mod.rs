//! # Audio Module
//!
//! The playback queue engine and the seams it drives.
//!
//! ## Architecture
//!
//! ### [`queue`] - Guild queue
//! - FIFO of resolved tracks plus the "now playing" slot
//!
//! ### [`engine`] - Queue engine
//! - Registry of guild state, one async lock per guild
//! - Play / skip / stop / join / peek, and the advance-on-completion loop
//! - Generation counter that discards notifications outliving a stop
//!
//! ### [`voice`] - Voice sessions
//! - [`voice::VoiceGateway`] seam with a songbird implementation
//!
//! ### [`sink`] - Audio sink
//! - [`sink::AudioSink`] seam with a songbird implementation
//! - [`sink::Completion`], the once-only end-of-stream notification
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use open_jukebox::audio::engine::{EngineSettings, QueueEngine};
//! use serenity::all::{ChannelId, GuildId, UserId};
//! # use std::sync::Arc;
//! # async fn example(
//! #     resolver: Arc<dyn open_jukebox::sources::TrackResolver>,
//! #     sink: Arc<dyn open_jukebox::audio::sink::AudioSink>,
//! #     gateway: Arc<dyn open_jukebox::audio::voice::VoiceGateway>,
//! # ) -> anyhow::Result<()> {
//! let engine = QueueEngine::new(resolver, sink, gateway, EngineSettings::default());
//! let guild_id = GuildId::new(123456789);
//!
//! engine
//!     .request_play(guild_id, "lofi beats", Some(ChannelId::new(42)), UserId::new(7))
//!     .await?;
//! engine.skip(guild_id).await?;
//! engine.stop(guild_id).await?;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod queue;
pub mod sink;
pub mod voice;

pub use engine::{JoinOutcome, PlayOutcome, PlaybackEvent, PlaybackState, QueueEngine};
pub use error::EngineError;
