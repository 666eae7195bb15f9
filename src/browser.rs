//! Browser container provisioning.
//!
//! Each pool drives the local container runtime through the `docker` binary:
//! create → start → resolve the published port, then probe the CDP HTTP
//! endpoint until the browser answers. Containers run the headless-browser
//! image with its internal idle-timeout disabled and a single-session cap,
//! publishing container port 3000 on an ephemeral host port.

use crate::error::{Error, Result};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

const BROWSER_IMAGE: &str = "browserless/chrome:latest";
const READY_MAX_RETRIES: u32 = 20;
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A provisioned browser container, owned by the session it backs.
#[derive(Debug, Clone)]
pub struct BrowserInstance {
    pub container_id: String,
    pub session_id: String,
    pub connect_url: String,
    pub region: String,
    pub port: String,
    pub user_data_dir: String,
}

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub session_id: String,
    /// Host directory bind-mounted at /data inside the container. When
    /// empty, a fresh session-scoped scratch directory is created.
    pub user_data_dir: String,
}

pub struct Pool {
    region: String,
    http: reqwest::Client,
}

impl Pool {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Pull the browser image unless it is already present locally.
    pub async fn ensure_image(&self) -> Result<()> {
        if docker(&["image", "inspect", BROWSER_IMAGE]).await.is_ok() {
            return Ok(());
        }

        info!(region = %self.region, image = BROWSER_IMAGE, "Pulling browser image");
        docker(&["pull", BROWSER_IMAGE]).await?;
        Ok(())
    }

    pub async fn launch(&self, opts: LaunchOptions) -> Result<BrowserInstance> {
        let user_data_dir = if opts.user_data_dir.is_empty() {
            let dir = std::env::temp_dir()
                .join("browser-data")
                .join(&opts.session_id);
            std::fs::create_dir_all(&dir)?;
            dir.display().to_string()
        } else {
            opts.user_data_dir.clone()
        };

        let short_id = short(&opts.session_id).to_string();
        let session_label = format!("session-id={}", opts.session_id);
        let region_label = format!("region={}", self.region);
        let mount = format!("{}:/data", user_data_dir);
        let name = format!("session-{}", short_id);

        let container_id = docker(&[
            "create",
            "--name",
            &name,
            "--label",
            &session_label,
            "--label",
            &region_label,
            "--label",
            "managed-by=browserhub",
            "-e",
            "CONNECTION_TIMEOUT=-1",
            "-e",
            "MAX_CONCURRENT_SESSIONS=1",
            "-e",
            "PREBOOT_CHROME=true",
            "-e",
            "KEEP_ALIVE=true",
            "-e",
            "EXIT_ON_HEALTH_FAILURE=false",
            "-p",
            "0:3000",
            "-v",
            &mount,
            BROWSER_IMAGE,
        ])
        .await?
        .trim()
        .to_string();

        docker(&["start", &container_id]).await?;

        let port = self.published_port(&container_id).await?;
        self.wait_for_browser_ready(&port).await?;

        let instance = BrowserInstance {
            connect_url: format!("ws://localhost:{}", port),
            container_id,
            session_id: opts.session_id,
            region: self.region.clone(),
            port,
            user_data_dir,
        };

        info!(
            session = %short(&instance.session_id),
            region = %instance.region,
            port = %instance.port,
            "Browser container ready"
        );
        Ok(instance)
    }

    /// Stop (10 s graceful) and remove the container. Both steps are
    /// attempted; their errors are aggregated.
    pub async fn stop(&self, container_id: &str) -> Result<()> {
        let stop_res = docker(&["stop", "-t", "10", container_id]).await;
        let rm_res = docker(&["rm", container_id]).await;

        match (stop_res, rm_res) {
            (Ok(_), Ok(_)) => Ok(()),
            (Err(e), Ok(_)) => Err(Error::Other(format!("failed to stop container: {}", e))),
            (Ok(_), Err(e)) => Err(Error::Other(format!("failed to remove container: {}", e))),
            (Err(stop), Err(rm)) => Err(Error::Other(format!(
                "failed to stop container: {}; failed to remove container: {}",
                stop, rm
            ))),
        }
    }

    /// Host port the container's 3000/tcp was published on.
    async fn published_port(&self, container_id: &str) -> Result<String> {
        let out = docker(&["port", container_id, "3000/tcp"]).await?;
        // Output looks like "0.0.0.0:49153" (possibly one line per address
        // family); any line's port component will do.
        out.lines()
            .filter_map(|line| line.rsplit(':').next())
            .map(|p| p.trim().to_string())
            .find(|p| !p.is_empty())
            .ok_or_else(|| Error::Other(format!("no published port for {}", container_id)))
    }

    /// Poll /json/version until the browser answers, then give the
    /// WebSocket endpoint a moment to settle.
    async fn wait_for_browser_ready(&self, port: &str) -> Result<()> {
        let url = format!("http://localhost:{}/json/version", port);

        for attempt in 0..READY_MAX_RETRIES {
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().as_u16() == 200 => {
                    tokio::time::sleep(READY_POLL_INTERVAL).await;
                    return Ok(());
                }
                Ok(resp) => {
                    debug!(attempt, status = %resp.status(), "Browser not ready yet");
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Browser not reachable yet");
                }
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }

        Err(Error::Other(format!(
            "browser did not become ready after {} retries",
            READY_MAX_RETRIES
        )))
    }
}

fn short(session_id: &str) -> &str {
    &session_id[..session_id.len().min(8)]
}

/// Run a docker subcommand, returning stdout on success.
async fn docker(args: &[&str]) -> Result<String> {
    let output = Command::new("docker").args(args).output().await?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(cmd = ?args.first(), "docker command failed: {}", stderr.trim());
        Err(Error::Other(format!(
            "docker {} failed: {}",
            args.first().copied().unwrap_or_default(),
            stderr.trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_handles_tiny_input() {
        assert_eq!(short("abcdefghij"), "abcdefgh");
        assert_eq!(short("ab"), "ab");
    }
}
