use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tracing::{error, info};

use open_jukebox::{
    audio::{sink::SongbirdSink, voice::SongbirdGateway, QueueEngine},
    bot::JukeboxBot,
    config::Config,
    sources::YtDlpResolver,
    storage::JsonStorage,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_jukebox=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Starting Open Jukebox v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    info!("⚙️ {}", config.summary());

    let storage = Arc::new(tokio::sync::Mutex::new(
        JsonStorage::new(config.data_dir.clone()).await?,
    ));

    // One songbird manager shared by the client and the engine's voice seams
    let songbird = Songbird::serenity();
    let engine = QueueEngine::new(
        Arc::new(YtDlpResolver::new(config.ytdlp_path.clone())),
        Arc::new(SongbirdSink::new(songbird.clone(), reqwest::Client::new())),
        Arc::new(SongbirdGateway::new(songbird.clone())),
        config.engine_settings(),
    );

    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let handler = JukeboxBot::new(config.clone(), engine, storage);
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error listening for Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Shutdown signal received, closing...");
        shard_manager.shutdown_all().await;
    });

    info!("🚀 Bot started");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    Ok(())
}

async fn health_check(config: &Config) -> Result<()> {
    let version = YtDlpResolver::new(config.ytdlp_path.clone()).verify().await?;
    println!("OK (yt-dlp {})", version);
    Ok(())
}
