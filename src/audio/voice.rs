use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{error::JoinError, Songbird};
use std::sync::Arc;
use tracing::{info, warn};

use super::error::VoiceError;

/// Platform side of a voice connection.
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    /// Connects, or moves an existing connection, to `channel_id`.
    async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), VoiceError>;

    /// Drops the connection. Must be a no-op when there is none.
    async fn leave(&self, guild_id: GuildId) -> Result<(), VoiceError>;
}

/// Connection state for one guild, as the engine sees it.
///
/// Only mutated while the owning guild's lock is held, which also serializes
/// concurrent connect attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoiceSession {
    channel: Option<ChannelId>,
}

impl VoiceSession {
    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    pub async fn connect(
        &mut self,
        gateway: &dyn VoiceGateway,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<(), VoiceError> {
        gateway.join(guild_id, channel_id).await?;
        self.channel = Some(channel_id);
        info!("🔊 Connected to voice channel {} in guild {}", channel_id, guild_id);
        Ok(())
    }

    pub async fn move_to(
        &mut self,
        gateway: &dyn VoiceGateway,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<(), VoiceError> {
        gateway.join(guild_id, channel_id).await?;
        self.channel = Some(channel_id);
        info!("🔀 Moved to voice channel {} in guild {}", channel_id, guild_id);
        Ok(())
    }

    /// Idempotent. The session counts as disconnected even if the gateway errors.
    pub async fn disconnect(&mut self, gateway: &dyn VoiceGateway, guild_id: GuildId) {
        if self.channel.take().is_none() {
            return;
        }
        if let Err(e) = gateway.leave(guild_id).await {
            warn!("Error leaving voice in guild {}: {}", guild_id, e);
        }
        info!("👋 Disconnected from voice in guild {}", guild_id);
    }
}

/// [`VoiceGateway`] over a songbird manager.
pub struct SongbirdGateway {
    manager: Arc<Songbird>,
}

impl SongbirdGateway {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl VoiceGateway for SongbirdGateway {
    async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), VoiceError> {
        // songbird moves an existing call when joining a different channel
        self.manager
            .join(guild_id, channel_id)
            .await
            .map(|_call| ())
            .map_err(|e| VoiceError::Join(e.to_string()))
    }

    async fn leave(&self, guild_id: GuildId) -> Result<(), VoiceError> {
        match self.manager.remove(guild_id).await {
            Ok(()) | Err(JoinError::NoCall) => Ok(()),
            Err(e) => Err(VoiceError::Leave(e.to_string())),
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// Records gateway calls; can be told to refuse joins.
    #[derive(Default)]
    pub struct FakeGateway {
        pub joins: Mutex<Vec<(GuildId, ChannelId)>>,
        pub leaves: Mutex<Vec<GuildId>>,
        pub refuse: Mutex<HashSet<ChannelId>>,
    }

    #[async_trait]
    impl VoiceGateway for FakeGateway {
        async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), VoiceError> {
            if self.refuse.lock().contains(&channel_id) {
                return Err(VoiceError::Join("missing permissions".to_string()));
            }
            self.joins.lock().push((guild_id, channel_id));
            Ok(())
        }

        async fn leave(&self, guild_id: GuildId) -> Result<(), VoiceError> {
            self.leaves.lock().push(guild_id);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeGateway;
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn disconnect_twice_is_a_noop() {
        let gateway = FakeGateway::default();
        let guild = GuildId::new(7);
        let mut session = VoiceSession::default();

        session.connect(&gateway, guild, ChannelId::new(70)).await.unwrap();
        session.disconnect(&gateway, guild).await;
        session.disconnect(&gateway, guild).await;

        assert!(!session.is_connected());
        assert_eq!(gateway.leaves.lock().len(), 1);
    }

    #[tokio::test]
    async fn failed_join_keeps_previous_channel() {
        let gateway = FakeGateway::default();
        let guild = GuildId::new(7);
        let mut session = VoiceSession::default();
        session.connect(&gateway, guild, ChannelId::new(70)).await.unwrap();
        gateway.refuse.lock().insert(ChannelId::new(71));

        let result = session.move_to(&gateway, guild, ChannelId::new(71)).await;

        assert!(result.is_err());
        assert_eq!(session.channel(), Some(ChannelId::new(70)));
    }
}
