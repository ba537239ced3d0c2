use anyhow::{Context, Result};
use std::{path::PathBuf, time::Duration};

use crate::audio::engine::EngineSettings;

#[derive(Debug, Clone)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub guild_id: Option<u64>, // guild-scoped command registration for development

    // Playback
    pub resolve_timeout: Duration,
    pub max_start_failures: u32,
    pub event_buffer: usize,
    pub ytdlp_path: String,

    // Paths
    pub data_dir: PathBuf,
}

impl Config {
    /// Loads `.env` (if present) and reads the process environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("creating {}", config.data_dir.display()))?;

        Ok(config)
    }

    /// Builds a config from any key lookup and validates it.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let config = Self {
            discord_token: lookup("DISCORD_TOKEN")
                .filter(|token| !token.trim().is_empty())
                .context("DISCORD_TOKEN is not set")?,
            guild_id: match lookup("GUILD_ID").filter(|s| !s.trim().is_empty()) {
                Some(id) => Some(id.trim().parse().context("GUILD_ID must be a number")?),
                None => None,
            },

            resolve_timeout: humantime::parse_duration(&get("RESOLVE_TIMEOUT", "20s"))
                .context("RESOLVE_TIMEOUT must be a duration like `20s`")?,
            max_start_failures: get("MAX_START_FAILURES", "3")
                .parse()
                .context("MAX_START_FAILURES must be a number")?,
            event_buffer: get("EVENT_BUFFER", "64")
                .parse()
                .context("EVENT_BUFFER must be a number")?,
            ytdlp_path: get("YTDLP_PATH", "yt-dlp"),

            data_dir: get("DATA_DIR", "./data").into(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Sanity checks that catch settings the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.resolve_timeout.is_zero() {
            anyhow::bail!("Resolve timeout must be greater than 0");
        }

        if self.max_start_failures == 0 {
            anyhow::bail!("Max start failures must be at least 1");
        }

        if self.event_buffer == 0 {
            anyhow::bail!("Event buffer must be greater than 0");
        }

        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            resolve_timeout: self.resolve_timeout,
            max_start_failures: self.max_start_failures,
            event_buffer: self.event_buffer,
        }
    }

    /// One-line summary without the token, for startup logs.
    pub fn summary(&self) -> String {
        format!(
            "commands: {}, resolve timeout: {}, max start failures: {}, yt-dlp: {}, data: {}",
            self.guild_id
                .map_or("global".to_string(), |id| format!("guild {}", id)),
            humantime::format_duration(self.resolve_timeout),
            self.max_start_failures,
            self.ytdlp_path,
            self.data_dir.display(),
        )
    }
}
