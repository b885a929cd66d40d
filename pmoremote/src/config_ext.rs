//! Extension pour construire les clients pmoremote à partir de pmoconfig
//!
//! ```rust,ignore
//! use pmoconfig::Config;
//! use pmoremote::RemoteConfigExt;
//!
//! let config = Config::load_config("")?;
//! let discovery = config.discovery_config()?;
//! let catalogue = config.catalogue_client()?;
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use pmoconfig::Config;

use crate::asset::{AssetFetcher, RetryPolicy};
use crate::catalogue::CatalogueClient;
use crate::discovery::{DiscoveryConfig, MdnsBrowser};

/// Trait d'extension de `pmoconfig::Config` pour la découverte, le catalogue
/// et les assets.
pub trait RemoteConfigExt {
    fn discovery_config(&self) -> Result<DiscoveryConfig>;

    /// Browser mDNS avec l'intervalle de requêtes configuré
    fn mdns_browser(&self) -> Result<MdnsBrowser>;

    fn catalogue_client(&self) -> Result<CatalogueClient>;

    fn thumbnail_policy(&self) -> Result<RetryPolicy>;

    fn media_policy(&self) -> Result<RetryPolicy>;

    /// Fetcher partageant le pool de connexions de `catalogue`
    fn asset_fetcher(&self, catalogue: &CatalogueClient) -> Result<AssetFetcher> {
        Ok(AssetFetcher::new(
            catalogue.http_client().clone(),
            self.thumbnail_policy()?,
            self.media_policy()?,
        ))
    }
}

fn retry_policy(config: &Config, request_timeout_secs: u64) -> Result<RetryPolicy> {
    let max_attempts = u32::try_from(config.get_asset_max_attempts()?)
        .context("assets.max_attempts is out of range")?;
    Ok(RetryPolicy {
        max_attempts: max_attempts.max(1),
        generation_backoff: Duration::from_millis(config.get_asset_generation_backoff_ms()?),
        error_backoff: Duration::from_millis(config.get_asset_error_backoff_ms()?),
        request_timeout: Duration::from_secs(request_timeout_secs),
    })
}

impl RemoteConfigExt for Config {
    fn discovery_config(&self) -> Result<DiscoveryConfig> {
        Ok(DiscoveryConfig {
            service_type: self.get_discovery_service_type()?,
            resolve_timeout: Duration::from_secs(self.get_discovery_resolve_timeout_secs()?),
            window: Duration::from_secs(self.get_discovery_window_secs()?),
        })
    }

    fn mdns_browser(&self) -> Result<MdnsBrowser> {
        Ok(MdnsBrowser::new(Duration::from_secs(
            self.get_discovery_query_interval_secs()?,
        )))
    }

    fn catalogue_client(&self) -> Result<CatalogueClient> {
        let timeout = Duration::from_secs(self.get_catalogue_request_timeout_secs()?);
        CatalogueClient::builder()
            .timeout(timeout)
            .build()
            .context("Cannot build the catalogue HTTP client")
    }

    fn thumbnail_policy(&self) -> Result<RetryPolicy> {
        retry_policy(self, self.get_asset_thumbnail_timeout_secs()?)
    }

    fn media_policy(&self) -> Result<RetryPolicy> {
        retry_policy(self, self.get_asset_media_timeout_secs()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn config_with(yaml: &str) -> (TempDir, Config) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("config.yaml"), yaml).unwrap();
        let config = Config::load_config(dir.path().to_str().unwrap()).unwrap();
        (dir, config)
    }

    #[test]
    fn test_defaults_match_library_constants() {
        let (_dir, config) = config_with("{}\n");
        assert_eq!(config.discovery_config().unwrap(), DiscoveryConfig::default());
        assert_eq!(config.thumbnail_policy().unwrap(), RetryPolicy::thumbnails());
        assert_eq!(config.media_policy().unwrap(), RetryPolicy::media());
    }

    #[test]
    fn test_overrides() {
        let (_dir, config) = config_with(
            "discovery:\n  window_secs: 2\nassets:\n  max_attempts: 3\n  generation_backoff_ms: 10\n",
        );
        assert_eq!(
            config.discovery_config().unwrap().window,
            Duration::from_secs(2)
        );
        let policy = config.thumbnail_policy().unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.generation_backoff, Duration::from_millis(10));
        assert_eq!(policy.error_backoff, Duration::from_millis(3000));
    }
}
