//! Retrieval of thumbnails and media bodies.
//!
//! The server generates thumbnails lazily: a `202 Accepted` means "ask
//! again later". Every fetch runs a bounded retry loop whose requests and
//! waits all race a [`CancellationToken`].

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use image::ImageFormat;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use crate::catalogue::{CatalogueClient, no_cache_headers};
use crate::errors::AssetError;
use crate::model::ServerAddress;

/// Default number of requests per fetch (so at most 29 waits)
pub const DEFAULT_MAX_ATTEMPTS: u32 = 30;

/// Wait after a `202 Accepted`
pub const DEFAULT_GENERATION_BACKOFF_MS: u64 = 2000;

/// Wait after any other failure
pub const DEFAULT_ERROR_BACKOFF_MS: u64 = 3000;

pub const DEFAULT_THUMBNAIL_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_MEDIA_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Thumbnail,
    Media,
}

impl AssetKind {
    pub fn url(&self, address: &ServerAddress, id: &str) -> Url {
        match self {
            AssetKind::Thumbnail => address.thumbnail_url(id),
            AssetKind::Media => address.media_url(id),
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetKind::Thumbnail => f.write_str("thumbnail"),
            AssetKind::Media => f.write_str("media"),
        }
    }
}

/// Bounds of the retry loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of requests, the first one included.
    pub max_attempts: u32,
    pub generation_backoff: Duration,
    pub error_backoff: Duration,
    pub request_timeout: Duration,
}

impl RetryPolicy {
    pub fn thumbnails() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            generation_backoff: Duration::from_millis(DEFAULT_GENERATION_BACKOFF_MS),
            error_backoff: Duration::from_millis(DEFAULT_ERROR_BACKOFF_MS),
            request_timeout: Duration::from_secs(DEFAULT_THUMBNAIL_TIMEOUT_SECS),
        }
    }

    pub fn media() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_MEDIA_TIMEOUT_SECS),
            ..Self::thumbnails()
        }
    }

    fn backoff(&self, reason: &RetryReason) -> Duration {
        match reason {
            RetryReason::Generating => self.generation_backoff,
            _ => self.error_backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::thumbnails()
    }
}

/// Why the previous attempt did not produce the asset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryReason {
    /// `202 Accepted`: the server is still generating the asset.
    Generating,
    Status(u16),
    Transport(String),
    /// Reset or truncated keep-alive connection.
    StaleConnection,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::Generating => f.write_str("asset is being generated"),
            RetryReason::Status(code) => write!(f, "HTTP {code}"),
            RetryReason::Transport(msg) => write!(f, "transport error: {msg}"),
            RetryReason::StaleConnection => f.write_str("stale connection"),
        }
    }
}

/// Decoded thumbnail. `bytes` keeps the encoded payload for display.
#[derive(Clone, Debug, PartialEq)]
pub struct ThumbnailImage {
    pub bytes: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: Option<ImageFormat>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MediaBytes {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Asset {
    Thumbnail(ThumbnailImage),
    Media(MediaBytes),
}

impl Asset {
    pub fn bytes(&self) -> &Bytes {
        match self {
            Asset::Thumbnail(image) => &image.bytes,
            Asset::Media(media) => &media.bytes,
        }
    }
}

/// Observable state of one fetch.
#[derive(Clone, Debug, PartialEq)]
pub enum AssetFetchState {
    Pending,
    /// `attempt` is the number of the request about to be issued.
    Retrying { attempt: u32, reason: RetryReason },
    Ready(Arc<Asset>),
    Failed(String),
}

impl AssetFetchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AssetFetchState::Ready(_) | AssetFetchState::Failed(_))
    }
}

/// Cancellation scope shared by every fetch a view starts.
#[derive(Clone, Debug, Default)]
pub struct FetchScope {
    token: CancellationToken,
}

impl FetchScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Aborts every fetch started under this scope, sleeping retries included.
    pub fn cancel_all(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Handle on a spawned fetch. Dropping it cancels the fetch.
#[derive(Debug)]
pub struct AssetHandle {
    state: watch::Receiver<AssetFetchState>,
    token: CancellationToken,
}

impl AssetHandle {
    /// Current state.
    pub fn state(&self) -> AssetFetchState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AssetFetchState> {
        self.state.clone()
    }

    /// Waits for `Ready` or `Failed`.
    ///
    /// A cancelled fetch publishes nothing more; it is reported here as failed.
    pub async fn wait(&self) -> AssetFetchState {
        let mut state = self.state.clone();
        match state.wait_for(AssetFetchState::is_terminal).await {
            Ok(terminal) => terminal.clone(),
            Err(_) => AssetFetchState::Failed(AssetError::Cancelled.to_string()),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for AssetHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Streamed media body, for videos too large to buffer.
#[derive(Debug)]
pub struct MediaStream {
    response: Response,
}

impl MediaStream {
    pub fn content_type(&self) -> Option<&str> {
        self.response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    pub fn into_bytes_stream(self) -> impl Stream<Item = Result<Bytes, AssetError>> {
        self.response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| AssetError::Io(e.to_string())))
    }

    /// Copies the body into `writer`, returning the number of bytes written.
    pub async fn write_to<W>(
        self,
        writer: &mut W,
        token: &CancellationToken,
    ) -> Result<u64, AssetError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut stream = Box::pin(self.into_bytes_stream());
        let mut written = 0u64;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(AssetError::Cancelled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(chunk) => {
                    let chunk = chunk?;
                    writer.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                }
                None => break,
            }
        }
        writer.flush().await?;
        Ok(written)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Delivery {
    Buffered,
    Streamed,
}

enum Fetched {
    Buffered {
        bytes: Bytes,
        content_type: Option<String>,
    },
    Streamed(Response),
}

/// Fetches assets with the bounded retry protocol.
#[derive(Debug, Clone)]
pub struct AssetFetcher {
    client: Client,
    thumbnails: RetryPolicy,
    media: RetryPolicy,
}

impl AssetFetcher {
    pub fn new(client: Client, thumbnails: RetryPolicy, media: RetryPolicy) -> Self {
        Self {
            client,
            thumbnails,
            media,
        }
    }

    /// Shares the connection pool of a catalogue client, default policies.
    pub fn from_catalogue(catalogue: &CatalogueClient) -> Self {
        Self::new(
            catalogue.http_client().clone(),
            RetryPolicy::thumbnails(),
            RetryPolicy::media(),
        )
    }

    pub fn policy(&self, kind: AssetKind) -> &RetryPolicy {
        match kind {
            AssetKind::Thumbnail => &self.thumbnails,
            AssetKind::Media => &self.media,
        }
    }

    /// Starts an independent fetch task under `scope`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn fetch(
        &self,
        address: &ServerAddress,
        kind: AssetKind,
        id: &str,
        scope: &FetchScope,
    ) -> AssetHandle {
        let token = scope.child_token();
        let (tx, rx) = watch::channel(AssetFetchState::Pending);
        let url = kind.url(address, id);
        let fetcher = self.clone();
        let task_token = token.clone();

        tokio::spawn(async move {
            let result = fetcher
                .run(kind, &url, &task_token, |attempt, reason| {
                    if !task_token.is_cancelled() {
                        tx.send_replace(AssetFetchState::Retrying {
                            attempt,
                            reason: reason.clone(),
                        });
                    }
                })
                .await;

            if task_token.is_cancelled() {
                debug!(%url, "Asset fetch cancelled, dropping result");
                return;
            }
            match result {
                Ok(asset) => {
                    tx.send_replace(AssetFetchState::Ready(Arc::new(asset)));
                }
                Err(AssetError::Cancelled) => {}
                Err(e) => {
                    tx.send_replace(AssetFetchState::Failed(e.to_string()));
                }
            }
        });

        AssetHandle { state: rx, token }
    }

    /// Runs the retry loop inline and returns the asset.
    pub async fn fetch_now(
        &self,
        address: &ServerAddress,
        kind: AssetKind,
        id: &str,
        token: &CancellationToken,
    ) -> Result<Asset, AssetError> {
        let url = kind.url(address, id);
        self.run(kind, &url, token, |_, _| {}).await
    }

    /// Opens `/video/{id}` as a stream once the server answers 200.
    ///
    /// The media request timeout does not apply to the body, which may take
    /// far longer to transfer.
    pub async fn open_stream(
        &self,
        address: &ServerAddress,
        id: &str,
        token: &CancellationToken,
    ) -> Result<MediaStream, AssetError> {
        let url = address.media_url(id);
        match self
            .retry_loop(&url, &self.media, Delivery::Streamed, token, |_, _| {})
            .await?
        {
            Fetched::Streamed(response) => Ok(MediaStream { response }),
            Fetched::Buffered { .. } => Err(AssetError::Io("unexpected buffered body".into())),
        }
    }

    async fn run<F>(
        &self,
        kind: AssetKind,
        url: &Url,
        token: &CancellationToken,
        on_retry: F,
    ) -> Result<Asset, AssetError>
    where
        F: FnMut(u32, &RetryReason),
    {
        let policy = self.policy(kind);
        let (bytes, content_type) = match self
            .retry_loop(url, policy, Delivery::Buffered, token, on_retry)
            .await?
        {
            Fetched::Buffered {
                bytes,
                content_type,
            } => (bytes, content_type),
            Fetched::Streamed(_) => return Err(AssetError::Io("unexpected streamed body".into())),
        };

        match kind {
            AssetKind::Thumbnail => {
                let image = tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(AssetError::Cancelled),
                    image = decode_thumbnail(bytes) => image,
                };
                image.map(Asset::Thumbnail).inspect_err(|e| {
                    warn!(%url, error = %e, "Thumbnail is not a decodable image");
                })
            }
            AssetKind::Media => Ok(Asset::Media(MediaBytes {
                bytes,
                content_type,
            })),
        }
    }

    async fn retry_loop<F>(
        &self,
        url: &Url,
        policy: &RetryPolicy,
        delivery: Delivery,
        token: &CancellationToken,
        mut on_retry: F,
    ) -> Result<Fetched, AssetError>
    where
        F: FnMut(u32, &RetryReason),
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1u32;
        let mut stale_retry_used = false;

        loop {
            trace!(%url, attempt, "Requesting asset");
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(AssetError::Cancelled),
                outcome = self.attempt(url, policy, delivery) => outcome,
            };

            let reason = match outcome {
                Ok(fetched) => {
                    debug!(%url, attempt, "Asset retrieved");
                    return Ok(fetched);
                }
                Err(reason) => reason,
            };

            if attempt >= max_attempts {
                warn!(%url, attempts = attempt, %reason, "Giving up on asset");
                return Err(match reason {
                    RetryReason::Generating => AssetError::GenerationTimeout { attempts: attempt },
                    other => AssetError::RetriesExhausted {
                        attempts: attempt,
                        last: other.to_string(),
                    },
                });
            }
            attempt += 1;

            if token.is_cancelled() {
                return Err(AssetError::Cancelled);
            }
            on_retry(attempt, &reason);

            if reason == RetryReason::StaleConnection && !stale_retry_used {
                stale_retry_used = true;
                debug!(%url, "Stale connection, retrying immediately");
                continue;
            }

            let backoff = policy.backoff(&reason);
            debug!(%url, %reason, next_attempt = attempt, backoff_ms = backoff.as_millis() as u64, "Asset not ready, backing off");
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(AssetError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    async fn attempt(
        &self,
        url: &Url,
        policy: &RetryPolicy,
        delivery: Delivery,
    ) -> Result<Fetched, RetryReason> {
        let mut request = self.client.get(url.clone()).headers(no_cache_headers());
        if delivery == Delivery::Buffered {
            request = request.timeout(policy.request_timeout);
        }

        let response = request.send().await.map_err(|e| classify_transport(&e))?;
        let status = response.status();
        if status == StatusCode::ACCEPTED {
            return Err(RetryReason::Generating);
        }
        if !status.is_success() {
            return Err(RetryReason::Status(status.as_u16()));
        }

        match delivery {
            Delivery::Streamed => Ok(Fetched::Streamed(response)),
            Delivery::Buffered => {
                let content_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let bytes = response.bytes().await.map_err(|e| classify_transport(&e))?;
                Ok(Fetched::Buffered {
                    bytes,
                    content_type,
                })
            }
        }
    }
}

fn classify_transport(err: &reqwest::Error) -> RetryReason {
    if is_stale_connection(err) {
        RetryReason::StaleConnection
    } else {
        RetryReason::Transport(err.to_string())
    }
}

/// Walks the error chain looking for a connection the server closed on us.
fn is_stale_connection(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        let message = e.to_string();
        if message.contains("connection closed before message completed")
            || message.contains("connection reset")
        {
            return true;
        }
        current = e.source();
    }
    false
}

async fn decode_thumbnail(bytes: Bytes) -> Result<ThumbnailImage, AssetError> {
    tokio::task::spawn_blocking(move || {
        let format = image::guess_format(&bytes).ok();
        let decoded =
            image::load_from_memory(&bytes).map_err(|e| AssetError::Decode(e.to_string()))?;
        Ok(ThumbnailImage {
            width: decoded.width(),
            height: decoded.height(),
            format,
            bytes,
        })
    })
    .await
    .map_err(|e| AssetError::Decode(e.to_string()))?
}
