use std::{
    collections::{BTreeMap, HashSet},
    io,
    path::PathBuf,
    time::{Duration, Instant},
};

use futures::{StreamExt, TryStreamExt, stream};
use reqwest::{Client, StatusCode, redirect::Policy};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{info, warn};
use url::Url;

use super::{types::ResolvedAsset, workspace::Workspace};

const USER_AGENT: &str = concat!("texrender/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Clone)]
pub struct AssetResolverConfig {
    pub fetch_timeout: Duration,
    pub max_in_flight: usize,
    pub max_asset_bytes: u64,
}

impl Default for AssetResolverConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(crate::config::DEFAULT_ASSET_FETCH_TIMEOUT_SECS),
            max_in_flight: crate::config::DEFAULT_ASSET_MAX_IN_FLIGHT as usize,
            max_asset_bytes: crate::config::DEFAULT_ASSET_MAX_BYTES,
        }
    }
}

impl From<&crate::config::AssetSettings> for AssetResolverConfig {
    fn from(settings: &crate::config::AssetSettings) -> Self {
        Self {
            fetch_timeout: settings.fetch_timeout,
            max_in_flight: settings.max_in_flight.get() as usize,
            max_asset_bytes: settings.max_asset_bytes.get(),
        }
    }
}

/// Errors name the logical asset only; URLs and local paths stay in the
/// source chain for logs.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("failed to download image: {name}")]
    Fetch {
        name: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to download image: {name} (status {status})")]
    Status { name: String, status: u16 },
    #[error("image exceeds {limit} bytes: {name}")]
    TooLarge { name: String, limit: u64 },
    #[error("invalid image name: {name}")]
    InvalidName { name: String },
    #[error("duplicate image file name: {name}")]
    DuplicateName { name: String },
    #[error("cannot save image: {name}")]
    Write {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl AssetError {
    pub fn name(&self) -> &str {
        match self {
            AssetError::Fetch { name, .. }
            | AssetError::Status { name, .. }
            | AssetError::TooLarge { name, .. }
            | AssetError::InvalidName { name }
            | AssetError::DuplicateName { name }
            | AssetError::Write { name, .. } => name,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AssetError::Fetch { .. } => "fetch",
            AssetError::Status { .. } => "status",
            AssetError::TooLarge { .. } => "too_large",
            AssetError::InvalidName { .. } => "invalid_name",
            AssetError::DuplicateName { .. } => "duplicate_name",
            AssetError::Write { .. } => "write",
        }
    }
}

/// Downloads referenced assets into a workspace.
#[derive(Debug, Clone)]
pub struct AssetResolver {
    client: Client,
    max_in_flight: usize,
    max_asset_bytes: u64,
}

impl AssetResolver {
    pub fn new(config: AssetResolverConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .connect_timeout(CONNECT_TIMEOUT.min(config.fetch_timeout))
            .timeout(config.fetch_timeout)
            .build()?;

        Ok(Self {
            client,
            max_in_flight: config.max_in_flight.max(1),
            max_asset_bytes: config.max_asset_bytes,
        })
    }

    /// Fetch every asset concurrently, bounded by the in-flight limit.
    ///
    /// The first failure wins: the remaining fetches are dropped, which
    /// cancels their requests. Files already written stay in the workspace
    /// until it is released.
    pub async fn resolve(
        &self,
        assets: &BTreeMap<String, Url>,
        workspace: &Workspace,
    ) -> Result<Vec<ResolvedAsset>, AssetError> {
        let started_at = Instant::now();
        let targets = plan_targets(assets, workspace)?;

        let result: Result<Vec<ResolvedAsset>, AssetError> = stream::iter(targets)
            .map(|(name, url, target)| async move { self.fetch_one(&name, &url, target).await })
            .buffer_unordered(self.max_in_flight)
            .try_collect()
            .await;

        match result {
            Ok(mut resolved) => {
                resolved.sort_by(|left, right| left.name.cmp(&right.name));
                info!(
                    target = "application::compile::assets",
                    op = "assets::resolve",
                    result = "success",
                    workspace_id = %workspace.id(),
                    assets = resolved.len(),
                    total_bytes = resolved.iter().map(|asset| asset.size_bytes).sum::<u64>(),
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "Assets resolved"
                );
                Ok(resolved)
            }
            Err(err) => {
                warn!(
                    target = "application::compile::assets",
                    op = "assets::resolve",
                    result = "error",
                    workspace_id = %workspace.id(),
                    asset = %err.name(),
                    error_code = err.code(),
                    error = ?err,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "Asset resolution failed"
                );
                Err(err)
            }
        }
    }

    async fn fetch_one(
        &self,
        name: &str,
        url: &Url,
        target: PathBuf,
    ) -> Result<ResolvedAsset, AssetError> {
        let fetch_error = |source| AssetError::Fetch {
            name: name.to_string(),
            source,
        };
        let write_error = |source| AssetError::Write {
            name: name.to_string(),
            source,
        };
        let too_large = || AssetError::TooLarge {
            name: name.to_string(),
            limit: self.max_asset_bytes,
        };

        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(fetch_error)?;

        if response.status() != StatusCode::OK {
            return Err(AssetError::Status {
                name: name.to_string(),
                status: response.status().as_u16(),
            });
        }
        if let Some(length) = response.content_length() {
            if length > self.max_asset_bytes {
                return Err(too_large());
            }
        }

        let mut file = fs::File::create(&target).await.map_err(write_error)?;
        let mut size_bytes: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(fetch_error)? {
            size_bytes = size_bytes.saturating_add(chunk.len() as u64);
            if size_bytes > self.max_asset_bytes {
                return Err(too_large());
            }
            file.write_all(&chunk).await.map_err(write_error)?;
        }
        file.flush().await.map_err(write_error)?;

        Ok(ResolvedAsset {
            name: name.to_string(),
            path: target,
            size_bytes,
        })
    }
}

/// Map each asset to its file in the workspace, rejecting unusable names
/// and names that collapse onto the same file.
fn plan_targets(
    assets: &BTreeMap<String, Url>,
    workspace: &Workspace,
) -> Result<Vec<(String, Url, PathBuf)>, AssetError> {
    let mut seen = HashSet::new();
    let mut planned = Vec::with_capacity(assets.len());
    for (name, url) in assets {
        let target = workspace
            .asset_path(name)
            .ok_or_else(|| AssetError::InvalidName { name: name.clone() })?;
        if target == workspace.source_path() || !seen.insert(target.clone()) {
            return Err(AssetError::DuplicateName { name: name.clone() });
        }
        planned.push((name.clone(), url.clone(), target));
    }
    Ok(planned)
}
