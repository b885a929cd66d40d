//! Browsing context: discovery, album list and album content as one state
//! machine.
//!
//! A [`CatalogueViewHandle`] owns an actor task. The task is the only
//! writer of the [`CatalogueSnapshot`]; every mutation arrives as a command
//! or as a fetch result tagged with a generation. Results whose generation
//! is not the current one are dropped.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::asset::{AssetFetcher, AssetHandle, AssetKind, FetchScope};
use crate::catalogue::CatalogueClient;
use crate::collaborators::PlaybackSurface;
use crate::discovery::ServiceDiscovery;
use crate::errors::{CatalogueError, CollaboratorError};
use crate::model::{
    AlbumGroup, AlbumSummary, DiscoveredServer, MediaItem, ServerAddress, group_albums,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadStatus {
    Loading,
    Loaded,
    Failed(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum CatalogueState {
    Idle,
    Discovering,
    /// The discovery window elapsed without a resolved server. Discovery
    /// keeps running.
    NoServerFound,
    ServerFound {
        server: DiscoveredServer,
        /// Last successful album list, kept across failures.
        albums: Arc<Vec<AlbumSummary>>,
        status: LoadStatus,
    },
}

impl CatalogueState {
    pub fn server(&self) -> Option<&DiscoveredServer> {
        match self {
            CatalogueState::ServerFound { server, .. } => Some(server),
            _ => None,
        }
    }
}

/// Content of the selected album.
#[derive(Clone, Debug, PartialEq)]
pub struct AlbumMediaState {
    pub album_id: String,
    pub items: Arc<Vec<MediaItem>>,
    pub status: LoadStatus,
}

/// What a screen should show.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisplayState {
    Idle,
    Searching,
    NoServerFound,
    Loading,
    EmptyCatalogue,
    Albums,
    FetchFailed(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct CatalogueSnapshot {
    pub state: CatalogueState,
    pub album: Option<AlbumMediaState>,
}

impl Default for CatalogueSnapshot {
    fn default() -> Self {
        Self {
            state: CatalogueState::Idle,
            album: None,
        }
    }
}

impl CatalogueSnapshot {
    pub fn display(&self) -> DisplayState {
        match &self.state {
            CatalogueState::Idle => DisplayState::Idle,
            CatalogueState::Discovering => DisplayState::Searching,
            CatalogueState::NoServerFound => DisplayState::NoServerFound,
            CatalogueState::ServerFound { albums, status, .. } => match status {
                LoadStatus::Failed(message) => DisplayState::FetchFailed(message.clone()),
                LoadStatus::Loading if albums.is_empty() => DisplayState::Loading,
                LoadStatus::Loaded if albums.is_empty() => DisplayState::EmptyCatalogue,
                _ => DisplayState::Albums,
            },
        }
    }

    pub fn server(&self) -> Option<&DiscoveredServer> {
        self.state.server()
    }

    pub fn address(&self) -> Option<&ServerAddress> {
        self.server().and_then(DiscoveredServer::usable_address)
    }

    pub fn albums(&self) -> &[AlbumSummary] {
        match &self.state {
            CatalogueState::ServerFound { albums, .. } => albums.as_slice(),
            _ => &[],
        }
    }

    pub fn grouped_albums(&self) -> Vec<(AlbumGroup, Vec<AlbumSummary>)> {
        group_albums(self.albums())
    }

    pub fn media(&self) -> &[MediaItem] {
        self.album
            .as_ref()
            .map(|album| album.items.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Debug)]
enum Command {
    Enter,
    Leave,
    Refresh,
    OpenAlbum(String),
    RefreshAlbum,
    CloseAlbum,
}

#[derive(Debug)]
enum FetchResult {
    Albums {
        generation: u64,
        result: Result<Vec<AlbumSummary>, CatalogueError>,
    },
    Media {
        generation: u64,
        album_id: String,
        result: Result<Vec<MediaItem>, CatalogueError>,
    },
}

/// Handle on a browsing context.
///
/// Dropping the handle tears the context down.
pub struct CatalogueViewHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<CatalogueSnapshot>,
    assets: AssetFetcher,
    scope: Arc<Mutex<FetchScope>>,
}

impl CatalogueViewHandle {
    /// Spawns the view actor. Must be called from within a tokio runtime.
    pub fn spawn(
        discovery: ServiceDiscovery,
        catalogue: CatalogueClient,
        assets: AssetFetcher,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (results, result_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(CatalogueSnapshot::default());
        let scope = Arc::new(Mutex::new(FetchScope::new()));

        let actor = ViewActor {
            window: discovery.config().window,
            discovery,
            catalogue,
            state_tx,
            results,
            snapshot: CatalogueSnapshot::default(),
            active: false,
            window_deadline: None,
            albums_generation: 0,
            albums_token: None,
            media_generation: 0,
            media_token: None,
            scope: scope.clone(),
        };
        tokio::spawn(actor.run(command_rx, result_rx));

        Self {
            commands,
            state,
            assets,
            scope,
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Catalogue view task is gone");
        }
    }

    /// Enters the browsing context (starts discovery from scratch).
    pub fn enter(&self) {
        self.send(Command::Enter);
    }

    /// Leaves the context: discovery stops, every fetch is cancelled.
    pub fn leave(&self) {
        self.send(Command::Leave);
    }

    /// Re-fetches the album list, or restarts discovery when no server was
    /// found.
    pub fn refresh(&self) {
        self.send(Command::Refresh);
    }

    pub fn open_album(&self, album_id: impl Into<String>) {
        self.send(Command::OpenAlbum(album_id.into()));
    }

    pub fn refresh_album(&self) {
        self.send(Command::RefreshAlbum);
    }

    pub fn close_album(&self) {
        self.send(Command::CloseAlbum);
    }

    pub fn snapshot(&self) -> CatalogueSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CatalogueSnapshot> {
        self.state.clone()
    }

    /// Waits for a snapshot matching `predicate`; `None` once the view is gone.
    pub async fn wait_until<F>(&self, predicate: F) -> Option<CatalogueSnapshot>
    where
        F: FnMut(&CatalogueSnapshot) -> bool,
    {
        let mut state = self.state.clone();
        state.wait_for(predicate).await.ok().map(|s| s.clone())
    }

    fn current_scope(&self) -> FetchScope {
        self.scope
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn fetch_asset(&self, kind: AssetKind, item_id: &str) -> Option<AssetHandle> {
        let address = self.state.borrow().address().cloned()?;
        Some(
            self.assets
                .fetch(&address, kind, item_id, &self.current_scope()),
        )
    }

    /// Thumbnail of `item_id` on the active server, tied to this view.
    pub fn thumbnail(&self, item_id: &str) -> Option<AssetHandle> {
        self.fetch_asset(AssetKind::Thumbnail, item_id)
    }

    /// Buffered media body, e.g. a photo for the viewer.
    pub fn media(&self, item_id: &str) -> Option<AssetHandle> {
        self.fetch_asset(AssetKind::Media, item_id)
    }

    /// Hands the stream of `item` to the player and starts playback.
    pub fn play(
        &self,
        item: &MediaItem,
        surface: &mut dyn PlaybackSurface,
    ) -> Result<Url, CollaboratorError> {
        let address = self
            .state
            .borrow()
            .address()
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound("active server".into()))?;
        let url = address.media_url(&item.id);
        info!(%url, filename = %item.filename, "Starting playback");
        surface.load(&url)?;
        surface.play()?;
        Ok(url)
    }
}

struct ViewActor {
    discovery: ServiceDiscovery,
    catalogue: CatalogueClient,
    window: Duration,
    state_tx: watch::Sender<CatalogueSnapshot>,
    results: mpsc::UnboundedSender<FetchResult>,
    snapshot: CatalogueSnapshot,
    active: bool,
    window_deadline: Option<Instant>,
    albums_generation: u64,
    albums_token: Option<CancellationToken>,
    media_generation: u64,
    media_token: Option<CancellationToken>,
    scope: Arc<Mutex<FetchScope>>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ViewActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut results: mpsc::UnboundedReceiver<FetchResult>,
    ) {
        let mut servers = self.discovery.subscribe();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(result) = results.recv() => self.handle_result(result),
                changed = servers.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let list = servers.borrow_and_update().clone();
                    self.on_servers(&list);
                }
                _ = sleep_until_opt(self.window_deadline) => self.on_window_elapsed(),
            }
        }

        self.leave();
        debug!("Catalogue view stopped");
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.snapshot.clone());
    }

    fn handle_command(&mut self, command: Command) {
        debug!(?command, "View command");
        match command {
            Command::Enter => self.enter(),
            Command::Leave => self.leave(),
            Command::Refresh => match self.snapshot.state {
                CatalogueState::ServerFound { .. } => self.fetch_albums(),
                CatalogueState::NoServerFound => self.enter(),
                CatalogueState::Idle | CatalogueState::Discovering => {}
            },
            Command::OpenAlbum(album_id) => self.open_album(album_id),
            Command::RefreshAlbum => {
                if let Some(album_id) = self.snapshot.album.as_ref().map(|a| a.album_id.clone()) {
                    self.open_album(album_id);
                }
            }
            Command::CloseAlbum => {
                cancel(&mut self.media_token);
                self.media_generation += 1;
                if self.snapshot.album.take().is_some() {
                    self.publish();
                }
            }
        }
    }

    fn enter(&mut self) {
        self.cancel_fetches();
        self.active = true;
        self.snapshot = CatalogueSnapshot {
            state: CatalogueState::Discovering,
            album: None,
        };

        match self.discovery.start_browsing() {
            Ok(()) => {
                self.window_deadline = Some(Instant::now() + self.window);
                info!("Searching for media servers");
            }
            Err(e) => {
                error!(error = %e, "Cannot start discovery");
                self.window_deadline = None;
                self.snapshot.state = CatalogueState::NoServerFound;
            }
        }
        self.publish();
    }

    fn leave(&mut self) {
        if !self.active && self.snapshot.state == CatalogueState::Idle {
            return;
        }
        self.active = false;
        self.window_deadline = None;
        self.cancel_fetches();
        self.discovery.stop_browsing();
        self.snapshot = CatalogueSnapshot::default();
        self.publish();
        info!("Left catalogue view");
    }

    /// Cancels catalogue fetches and every asset fetch of the view.
    fn cancel_fetches(&mut self) {
        cancel(&mut self.albums_token);
        cancel(&mut self.media_token);
        self.albums_generation += 1;
        self.media_generation += 1;
        self.reset_scope();
    }

    fn reset_scope(&self) {
        let mut scope = self
            .scope
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        scope.cancel_all();
        *scope = FetchScope::new();
    }

    fn on_window_elapsed(&mut self) {
        self.window_deadline = None;
        if self.active && self.snapshot.state == CatalogueState::Discovering {
            info!(window_secs = self.window.as_secs(), "No media server found");
            self.snapshot.state = CatalogueState::NoServerFound;
            self.publish();
        }
    }

    fn on_servers(&mut self, servers: &[DiscoveredServer]) {
        if !self.active {
            return;
        }

        if let Some(current) = self.snapshot.server() {
            let still_there = servers
                .iter()
                .find(|s| s.service == current.service && s.is_usable());
            match still_there {
                Some(server) if server.address == current.address => return,
                Some(server) => {
                    info!(server = %server.display_name, "Active server moved");
                    let server = server.clone();
                    self.activate(server);
                    return;
                }
                None => {
                    info!(server = %current.display_name, "Active server withdrawn");
                }
            }
        }

        match servers.iter().find(|s| s.is_usable()) {
            Some(server) => self.activate(server.clone()),
            None => {
                if matches!(self.snapshot.state, CatalogueState::ServerFound { .. }) {
                    self.cancel_fetches();
                    self.snapshot = CatalogueSnapshot {
                        state: CatalogueState::Discovering,
                        album: None,
                    };
                    self.window_deadline = Some(Instant::now() + self.window);
                    self.publish();
                }
            }
        }
    }

    fn activate(&mut self, server: DiscoveredServer) {
        info!(
            server = %server.display_name,
            address = ?server.address.as_ref().map(ServerAddress::as_str),
            "Using media server"
        );
        self.cancel_fetches();
        self.window_deadline = None;
        self.snapshot = CatalogueSnapshot {
            state: CatalogueState::ServerFound {
                server,
                albums: Arc::new(Vec::new()),
                status: LoadStatus::Loading,
            },
            album: None,
        };
        self.fetch_albums();
    }

    fn fetch_albums(&mut self) {
        let Some(address) = self.snapshot.address().cloned() else {
            return;
        };
        if let CatalogueState::ServerFound { status, .. } = &mut self.snapshot.state {
            *status = LoadStatus::Loading;
        }
        self.publish();

        cancel(&mut self.albums_token);
        self.albums_generation += 1;
        let generation = self.albums_generation;
        let token = CancellationToken::new();
        self.albums_token = Some(token.clone());

        let catalogue = self.catalogue.clone();
        let results = self.results.clone();
        tokio::spawn(async move {
            let result = catalogue.fetch_albums_cancellable(&address, &token).await;
            if token.is_cancelled() {
                return;
            }
            let _ = results.send(FetchResult::Albums { generation, result });
        });
    }

    fn open_album(&mut self, album_id: String) {
        let Some(address) = self.snapshot.address().cloned() else {
            warn!(%album_id, "Cannot open album without a server");
            return;
        };

        let items = match &self.snapshot.album {
            Some(album) if album.album_id == album_id => album.items.clone(),
            _ => Arc::new(Vec::new()),
        };
        self.snapshot.album = Some(AlbumMediaState {
            album_id: album_id.clone(),
            items,
            status: LoadStatus::Loading,
        });
        self.publish();

        cancel(&mut self.media_token);
        self.media_generation += 1;
        let generation = self.media_generation;
        let token = CancellationToken::new();
        self.media_token = Some(token.clone());

        let catalogue = self.catalogue.clone();
        let results = self.results.clone();
        tokio::spawn(async move {
            let result = catalogue
                .fetch_media_cancellable(&address, &album_id, &token)
                .await;
            if token.is_cancelled() {
                return;
            }
            let _ = results.send(FetchResult::Media {
                generation,
                album_id,
                result,
            });
        });
    }

    fn handle_result(&mut self, result: FetchResult) {
        match result {
            FetchResult::Albums { generation, result } => {
                if generation != self.albums_generation {
                    debug!(generation, current = self.albums_generation, "Discarding stale album list");
                    return;
                }
                self.albums_token = None;
                let CatalogueState::ServerFound { albums, status, .. } = &mut self.snapshot.state
                else {
                    return;
                };
                match result {
                    Ok(fetched) => {
                        info!(count = fetched.len(), "Album list loaded");
                        *albums = Arc::new(fetched);
                        *status = LoadStatus::Loaded;
                    }
                    Err(CatalogueError::Cancelled) => return,
                    Err(e) => {
                        warn!(error = %e, "Album list fetch failed");
                        *status = LoadStatus::Failed(e.to_string());
                    }
                }
                self.publish();
            }
            FetchResult::Media {
                generation,
                album_id,
                result,
            } => {
                if generation != self.media_generation {
                    debug!(generation, %album_id, "Discarding stale media list");
                    return;
                }
                self.media_token = None;
                let Some(album) = self.snapshot.album.as_mut() else {
                    return;
                };
                if album.album_id != album_id {
                    return;
                }
                match result {
                    Ok(items) => {
                        info!(%album_id, count = items.len(), "Media list loaded");
                        album.items = Arc::new(items);
                        album.status = LoadStatus::Loaded;
                    }
                    Err(CatalogueError::Cancelled) => return,
                    Err(e) => {
                        warn!(%album_id, error = %e, "Media list fetch failed");
                        album.status = LoadStatus::Failed(e.to_string());
                    }
                }
                self.publish();
            }
        }
    }
}

fn cancel(token: &mut Option<CancellationToken>) {
    if let Some(token) = token.take() {
        token.cancel();
    }
}
