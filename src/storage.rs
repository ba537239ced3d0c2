use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::fs;
use tracing::{info, warn};

const CONFIG_FILE: &str = "server_config.json";

/// Per-guild settings the command layer consults. Queue state is never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub announcement_channel_id: Option<u64>,
}

/// Settings for every guild, kept in one JSON file keyed by guild id.
pub struct JsonStorage {
    path: PathBuf,
    servers: BTreeMap<u64, ServerConfig>,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&data_dir).await?;
        let path = data_dir.join(CONFIG_FILE);

        let servers = match fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(servers) => servers,
                Err(e) => {
                    warn!("Ignoring unreadable {}: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };

        info!("📁 Storage at {} ({} servers)", path.display(), servers.len());
        Ok(Self { path, servers })
    }

    pub fn server_config(&self, guild_id: u64) -> ServerConfig {
        self.servers.get(&guild_id).cloned().unwrap_or_default()
    }

    pub async fn set_announcement_channel(&mut self, guild_id: u64, channel_id: Option<u64>) -> Result<()> {
        self.servers.entry(guild_id).or_default().announcement_channel_id = channel_id;
        self.save().await?;
        info!("💾 Announcement channel for guild {} set to {:?}", guild_id, channel_id);
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.servers)?;
        fs::write(&self.path, content)
            .await
            .with_context(|| format!("writing {}", self.path.display()))
    }
}
