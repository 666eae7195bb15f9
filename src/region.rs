//! Regional placement of browser pools.
//!
//! Regions are labels over pools that all talk to the same local container
//! runtime. Each region reserves a base port for future static allocation;
//! published host ports are currently ephemeral.

use crate::browser::{BrowserInstance, LaunchOptions, Pool};
use crate::error::Result;
use tracing::warn;

pub const DEFAULT_REGION: &str = "us-west-2";

pub struct RegionalPool {
    pub region: &'static str,
    pub pool: Pool,
    /// Reserved for static port allocation; unused while host ports are
    /// assigned by the runtime.
    #[allow(dead_code)]
    pub base_port: u16,
}

pub struct RegionManager {
    pools: Vec<RegionalPool>,
}

impl RegionManager {
    pub fn new() -> Self {
        let regions: [(&'static str, u16); 3] = [
            ("us-west-2", 9222),
            ("us-east-1", 9322),
            ("eu-central-1", 9422),
        ];

        let pools = regions
            .into_iter()
            .map(|(region, base_port)| RegionalPool {
                region,
                pool: Pool::new(region),
                base_port,
            })
            .collect();

        Self { pools }
    }

    /// Pick the region a session lands in. Unknown regions fall back to the
    /// default rather than failing.
    pub fn route_session(&self, requested: &str) -> &'static str {
        self.pools
            .iter()
            .find(|p| p.region == requested)
            .map(|p| p.region)
            .unwrap_or(DEFAULT_REGION)
    }

    pub fn regions(&self) -> Vec<&'static str> {
        self.pools.iter().map(|p| p.region).collect()
    }

    pub async fn launch_browser(
        &self,
        region: &str,
        opts: LaunchOptions,
    ) -> Result<BrowserInstance> {
        let pool = self
            .pools
            .iter()
            .find(|p| p.region == region)
            .map(|p| &p.pool)
            .unwrap_or(&self.pools[0].pool);

        pool.launch(opts).await
    }

    /// Stop a container wherever it lives: each region's runtime is tried in
    /// order and the first success wins.
    pub async fn stop_browser(&self, container_id: &str) -> Result<()> {
        let mut last_err = crate::error::Error::Other(format!(
            "no region accepted container {}",
            container_id
        ));
        for regional in &self.pools {
            match regional.pool.stop(container_id).await {
                Ok(()) => return Ok(()),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Make sure the browser image is present in every region. Called once
    /// at startup.
    pub async fn ensure_images(&self) -> Result<()> {
        for regional in &self.pools {
            if let Err(e) = regional.pool.ensure_image().await {
                warn!(region = %regional.region, "image pull failed: {}", e);
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Default for RegionManager {
    fn default() -> Self {
        Self::new()
    }
}
