use async_process::{Command, Stdio};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{looks_like_url, ResolutionError, TrackDescriptor, TrackResolver};

/// Resolver backed by the `yt-dlp` executable.
pub struct YtDlpResolver {
    binary: String,
    // Limit concurrent yt-dlp processes to avoid rate limiting
    rate_limiter: Semaphore,
}

/// The slice of `yt-dlp --dump-json` output we care about.
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    title: Option<String>,
    url: Option<String>,
    webpage_url: Option<String>,
}

impl YtDlpResolver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            rate_limiter: Semaphore::new(3),
        }
    }

    /// Direct links go to yt-dlp as-is, everything else becomes a single-hit search.
    fn target(query: &str) -> String {
        let query = query.trim();
        if looks_like_url(query) {
            query.to_string()
        } else {
            format!("ytsearch1:{}", query)
        }
    }

    /// Checks that the binary runs. Used by the health check.
    pub async fn verify(&self) -> anyhow::Result<String> {
        let output = Command::new(&self.binary).arg("--version").output().await?;
        if !output.status.success() {
            anyhow::bail!("{} --version exited with {}", self.binary, output.status);
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Picks the first entry yt-dlp printed and pulls title and stream URL out of it.
fn parse_output(stdout: &str) -> Result<TrackDescriptor, ResolutionError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or(ResolutionError::NoResults)?;

    let info: YtDlpInfo = serde_json::from_str(line)
        .map_err(|e| ResolutionError::InvalidOutput(e.to_string()))?;

    let stream_url = info
        .url
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ResolutionError::InvalidOutput("entry has no stream url".to_string()))?;

    let title = info
        .title
        .filter(|title| !title.trim().is_empty())
        .or(info.webpage_url)
        .unwrap_or_else(|| "Unknown title".to_string());

    Ok(TrackDescriptor { title, stream_url })
}

#[async_trait]
impl TrackResolver for YtDlpResolver {
    async fn resolve(&self, query: &str) -> Result<TrackDescriptor, ResolutionError> {
        if query.trim().is_empty() {
            return Err(ResolutionError::NoResults);
        }

        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| ResolutionError::Backend(e.to_string()))?;

        let target = Self::target(query);
        info!("🔍 Resolving: {}", target);

        // The engine's timeout drops this future; the child must die with it.
        let output = Command::new(&self.binary)
            .args([
                "--no-playlist",
                "--dump-json",
                "--format",
                "bestaudio/best",
                "--no-warnings",
                "--quiet",
            ])
            .arg(&target)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ResolutionError::Backend(format!("failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("❌ yt-dlp failed for {}: {}", target, stderr.trim());
            return Err(ResolutionError::Backend(stderr.trim().to_string()));
        }

        let descriptor = parse_output(&String::from_utf8_lossy(&output.stdout))?;
        debug!("✅ Resolved {} -> {}", target, descriptor.title);
        Ok(descriptor)
    }
}
