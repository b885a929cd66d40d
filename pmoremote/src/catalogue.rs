//! HTTP client for the album and media catalogue.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Client;
use reqwest::header::{CACHE_CONTROL, HeaderMap, HeaderValue, PRAGMA};
use serde::{Deserialize, Deserializer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::errors::CatalogueError;
use crate::model::{AlbumKind, AlbumSummary, MediaItem, MediaKind, ServerAddress};

/// Default timeout for catalogue requests
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default timeout for establishing a TCP connection
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default User-Agent
pub const DEFAULT_USER_AGENT: &str = concat!("pmoremote/", env!("CARGO_PKG_VERSION"));

/// Headers sent with every request: the server content changes under our
/// feet (thumbnails appear once generated), nothing may be served from cache.
pub(crate) fn no_cache_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers
}

/// Client for `GET /albums` and `GET /albums/{id}/videos`.
#[derive(Debug, Clone)]
pub struct CatalogueClient {
    pub(crate) client: Client,
    request_timeout: Duration,
}

impl CatalogueClient {
    /// Create a client with default settings
    pub fn new() -> Result<Self, CatalogueError> {
        Self::builder().build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Create a client around an existing reqwest::Client
    ///
    /// Useful to share the connection pool with an [`crate::AssetFetcher`].
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    /// Underlying HTTP client, shared with the asset fetcher.
    pub fn http_client(&self) -> &Client {
        &self.client
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Fetch the album list of a server.
    ///
    /// ```no_run
    /// # use pmoremote::{CatalogueClient, ServerAddress};
    /// # tokio_test::block_on(async {
    /// let client = CatalogueClient::new()?;
    /// let address = ServerAddress::parse("http://192.168.1.5:8080")?;
    /// for album in client.fetch_albums(&address).await? {
    ///     println!("{} ({} items)", album.name, album.media_count);
    /// }
    /// # Ok::<(), pmoremote::CatalogueError>(())
    /// # });
    /// ```
    pub async fn fetch_albums(
        &self,
        address: &ServerAddress,
    ) -> Result<Vec<AlbumSummary>, CatalogueError> {
        let body = self.get(address.albums_url()).await?;
        decode_albums(&body)
    }

    /// Same as [`fetch_albums`](Self::fetch_albums), aborted when `token` fires.
    pub async fn fetch_albums_cancellable(
        &self,
        address: &ServerAddress,
        token: &CancellationToken,
    ) -> Result<Vec<AlbumSummary>, CatalogueError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(CatalogueError::Cancelled),
            result = self.fetch_albums(address) => result,
        }
    }

    /// Fetch the media list of one album.
    pub async fn fetch_media(
        &self,
        address: &ServerAddress,
        album_id: &str,
    ) -> Result<Vec<MediaItem>, CatalogueError> {
        let body = self.get(address.album_media_url(album_id)).await?;
        decode_media(&body)
    }

    pub async fn fetch_media_cancellable(
        &self,
        address: &ServerAddress,
        album_id: &str,
        token: &CancellationToken,
    ) -> Result<Vec<MediaItem>, CatalogueError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(CatalogueError::Cancelled),
            result = self.fetch_media(address, album_id) => result,
        }
    }

    async fn get(&self, url: Url) -> Result<Bytes, CatalogueError> {
        debug!(%url, "Fetching catalogue");

        let response = self
            .client
            .get(url.clone())
            .headers(no_cache_headers())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(CatalogueError::network)?;

        let status = response.status();
        if !status.is_success() {
            warn!(%url, status = status.as_u16(), "Catalogue request rejected");
            return Err(CatalogueError::Status(status.as_u16()));
        }

        response.bytes().await.map_err(CatalogueError::network)
    }
}

/// Builder for [`CatalogueClient`]
#[derive(Debug)]
pub struct ClientBuilder {
    client: Option<Client>,
    request_timeout: Duration,
    connect_timeout: Duration,
    user_agent: String,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            client: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a custom HTTP client
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the per-request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set a custom User-Agent header
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Build the client
    ///
    /// No global request timeout is installed on the reqwest client: media
    /// streams outlive it. Timeouts are applied per request instead.
    pub fn build(self) -> Result<CatalogueClient, CatalogueError> {
        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .user_agent(&self.user_agent)
                .connect_timeout(self.connect_timeout)
                .build()
                .map_err(CatalogueError::network)?,
        };

        Ok(CatalogueClient {
            client,
            request_timeout: self.request_timeout,
        })
    }
}

// ============================================================================
// Wire format
// ============================================================================

/// Deserialize a string or number into a u64
fn deserialize_count<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Int(u64),
        Float(f64),
    }

    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s.trim().parse::<u64>().map_err(D::Error::custom),
        StringOrNumber::Int(n) => Ok(n),
        StringOrNumber::Float(f) if f >= 0.0 => Ok(f as u64),
        StringOrNumber::Float(f) => Err(D::Error::custom(format!("negative count {f}"))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAlbum {
    id: String,
    name: String,
    #[serde(deserialize_with = "deserialize_count")]
    video_count: u64,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

impl From<WireAlbum> for AlbumSummary {
    fn from(wire: WireAlbum) -> Self {
        AlbumSummary {
            kind: AlbumKind::from_wire(wire.kind.as_deref()),
            id: wire.id,
            name: wire.name,
            media_count: wire.video_count,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMedia {
    id: String,
    filename: String,
    #[serde(default)]
    duration: Option<f64>,
    // Les dates sont décodées à part: une date illisible ne doit pas faire
    // échouer tout le lot.
    #[serde(default)]
    import_date: serde_json::Value,
    #[serde(default)]
    creation_date: serde_json::Value,
    #[serde(default)]
    media_type: Option<String>,
}

/// Parses an ISO-8601 timestamp, fractional seconds optional.
///
/// A missing offset is read as UTC.
pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(date) = DateTime::parse_from_rfc3339(value) {
        return Some(date.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn timestamp_field(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    value.as_str().and_then(parse_timestamp)
}

impl WireMedia {
    fn into_item(self) -> Option<MediaItem> {
        let Some(imported_at) = timestamp_field(&self.import_date) else {
            warn!(
                id = %self.id,
                import_date = %self.import_date,
                "Dropping media item with unparsable importDate"
            );
            return None;
        };

        let captured_at = timestamp_field(&self.creation_date);
        if captured_at.is_none() && !self.creation_date.is_null() {
            debug!(id = %self.id, creation_date = %self.creation_date, "Ignoring unparsable creationDate");
        }

        Some(MediaItem {
            media_kind: MediaKind::from_wire(self.media_type.as_deref()),
            duration_seconds: self.duration.filter(|d| d.is_finite()).unwrap_or(0.0),
            id: self.id,
            filename: self.filename,
            imported_at,
            captured_at,
        })
    }
}

pub(crate) fn decode_albums(body: &[u8]) -> Result<Vec<AlbumSummary>, CatalogueError> {
    let albums: Vec<WireAlbum> = serde_json::from_slice(body).map_err(CatalogueError::decode)?;
    debug!(count = albums.len(), "Decoded album list");
    Ok(albums.into_iter().map(AlbumSummary::from).collect())
}

pub(crate) fn decode_media(body: &[u8]) -> Result<Vec<MediaItem>, CatalogueError> {
    let media: Vec<WireMedia> = serde_json::from_slice(body).map_err(CatalogueError::decode)?;
    let total = media.len();
    let items: Vec<MediaItem> = media.into_iter().filter_map(WireMedia::into_item).collect();
    if items.len() != total {
        warn!(total, kept = items.len(), "Some media items were dropped");
    }
    Ok(items)
}
