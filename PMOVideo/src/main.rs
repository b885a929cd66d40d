mod picker;
mod player;
mod store;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use pmoconfig::Config;
use pmoremote::{
    AlbumSelector, Asset, AssetFetcher, AssetKind, CatalogueSnapshot, CatalogueState,
    CatalogueViewHandle, ImportPicker, LoadStatus, LocalMedia, LocalMediaStore, MediaItem,
    RemoteConfigExt, ServerAddress, ServiceDiscovery, SortOrder, StaticBrowser, photos_only,
    project, random_video,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::picker::ArgsPicker;
use crate::player::CommandPlayer;
use crate::store::DirectoryStore;

#[derive(Parser)]
#[command(
    name = "pmovideo",
    version,
    about = "Browse PMOVideo media servers on the local network"
)]
struct Cli {
    /// Configuration directory (default: $PMOVIDEO_CONFIG, ./.pmovideo, ~/.pmovideo)
    #[arg(long, global = true)]
    config: Option<String>,
    /// Server base URL, e.g. http://192.168.1.5:8080 (skips discovery)
    #[arg(long, global = true)]
    server: Option<String>,
    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the servers seen on the network
    Discover {
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// List the albums of the first server found
    Albums,
    /// List the content of an album
    Media {
        album: String,
        #[arg(long, value_enum, default_value = "captured-desc")]
        sort: SortArg,
        #[arg(long, default_value = "")]
        filter: String,
        /// Only photos, in viewer order
        #[arg(long)]
        photos: bool,
    },
    /// Save the thumbnail of a media item
    Thumbnail { id: String, output: PathBuf },
    /// Download a media item into the local library
    Download {
        album: String,
        id: String,
        /// Local album receiving the file
        #[arg(long)]
        into: String,
    },
    /// Play a media item with the configured player
    Play { album: String, id: String },
    /// Play a random video of an album
    Random {
        album: String,
        #[arg(long, default_value = "")]
        filter: String,
    },
    /// Import local files into a library album
    Import {
        album: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Manage the local library
    Local {
        #[command(subcommand)]
        action: LocalAction,
    },
}

#[derive(Subcommand)]
enum LocalAction {
    Albums,
    Create {
        name: String,
    },
    /// Delete an album, its content goes to the trash
    Delete {
        name: String,
    },
    List {
        #[arg(long, conflicts_with = "trash")]
        album: Option<String>,
        #[arg(long)]
        trash: bool,
    },
    Trash {
        album: String,
        file: String,
    },
    Restore {
        album: String,
        file: String,
    },
    /// Delete a trashed file for good
    Purge {
        album: String,
        file: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    CapturedDesc,
    CapturedAsc,
    DurationDesc,
    DurationAsc,
}

impl From<SortArg> for SortOrder {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::CapturedDesc => SortOrder::CapturedDesc,
            SortArg::CapturedAsc => SortOrder::CapturedAsc,
            SortArg::DurationDesc => SortOrder::DurationDesc,
            SortArg::DurationAsc => SortOrder::DurationAsc,
        }
    }
}

fn init_tracing(min_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(min_level.to_ascii_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Cancelled on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted");
            child.cancel();
        }
    });
    token
}

struct App {
    config: Arc<Config>,
    server: Option<ServerAddress>,
    json: bool,
}

/// A view connected to a server with its album list loaded.
struct Connected {
    view: CatalogueViewHandle,
    assets: AssetFetcher,
    snapshot: CatalogueSnapshot,
    address: ServerAddress,
}

impl App {
    fn discovery(&self) -> Result<ServiceDiscovery> {
        let config = self.config.discovery_config()?;
        Ok(match &self.server {
            Some(address) => ServiceDiscovery::new(
                Arc::new(StaticBrowser::new().with_server(address.to_string(), address.clone())),
                config,
            ),
            None => ServiceDiscovery::new(Arc::new(self.config.mdns_browser()?), config),
        })
    }

    async fn connect(&self) -> Result<Connected> {
        let catalogue = self.config.catalogue_client()?;
        let assets = self.config.asset_fetcher(&catalogue)?;
        let view = CatalogueViewHandle::spawn(self.discovery()?, catalogue, assets.clone());
        view.enter();

        let snapshot = view
            .wait_until(|s| match &s.state {
                CatalogueState::NoServerFound => true,
                CatalogueState::ServerFound { status, .. } => *status != LoadStatus::Loading,
                _ => false,
            })
            .await
            .ok_or_else(|| anyhow!("Catalogue view stopped unexpectedly"))?;

        match &snapshot.state {
            CatalogueState::NoServerFound => bail!("No media server found on the local network"),
            CatalogueState::ServerFound {
                status: LoadStatus::Failed(message),
                ..
            } => bail!("Cannot fetch the album list: {message}"),
            _ => {}
        }

        let address = snapshot
            .address()
            .cloned()
            .ok_or_else(|| anyhow!("Server has no usable address"))?;
        if let Some(server) = snapshot.server() {
            info!(server = %server.display_name, %address, "Connected");
        }
        Ok(Connected {
            view,
            assets,
            snapshot,
            address,
        })
    }

    fn store(&self) -> Result<DirectoryStore> {
        let dir = self.config.get_storage_dir()?;
        let store =
            DirectoryStore::open(&dir).with_context(|| format!("Cannot open library {dir}"))?;
        debug!(root = %store.root().display(), "Local library");
        Ok(store)
    }

    fn print_json(&self, value: &serde_json::Value) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    async fn discover(&self, seconds: u64) -> Result<()> {
        let discovery = self.discovery()?;
        discovery.start_browsing()?;
        tokio::time::sleep(Duration::from_secs(seconds)).await;
        discovery.stop_browsing();

        let servers = discovery.servers();
        if self.json {
            return self.print_json(&serde_json::to_value(&servers)?);
        }
        if servers.is_empty() {
            println!("No media server found");
        }
        for server in servers {
            match server.usable_address() {
                Some(address) => println!("{}\t{}", server.display_name, address),
                None => println!("{}\t(unresolved)", server.display_name),
            }
        }
        Ok(())
    }

    async fn albums(&self) -> Result<()> {
        let connected = self.connect().await?;
        let groups = connected.snapshot.grouped_albums();
        connected.view.leave();

        if self.json {
            let groups: Vec<serde_json::Value> = groups
                .iter()
                .map(|(group, albums)| json!({"group": group, "albums": albums}))
                .collect();
            return self.print_json(&json!({
                "server": connected.snapshot.server(),
                "groups": groups,
            }));
        }
        if groups.is_empty() {
            println!("The server has no albums");
        }
        for (group, albums) in groups {
            println!("{}", group.title());
            for album in albums {
                println!("  {}\t{}\t({} items)", album.id, album.name, album.media_count);
            }
        }
        Ok(())
    }

    async fn open_album(&self, connected: &Connected, album_id: &str) -> Result<Vec<MediaItem>> {
        connected.view.open_album(album_id);
        let snapshot = connected
            .view
            .wait_until(|s| {
                s.album
                    .as_ref()
                    .is_some_and(|a| a.album_id == album_id && a.status != LoadStatus::Loading)
            })
            .await
            .ok_or_else(|| anyhow!("Catalogue view stopped unexpectedly"))?;

        let album = snapshot
            .album
            .ok_or_else(|| anyhow!("Album {album_id} was closed"))?;
        if let LoadStatus::Failed(message) = album.status {
            bail!("Cannot fetch album {album_id}: {message}");
        }
        Ok(album.items.as_ref().clone())
    }

    async fn find_item(&self, connected: &Connected, album: &str, id: &str) -> Result<MediaItem> {
        self.open_album(connected, album)
            .await?
            .into_iter()
            .find(|item| item.id == id)
            .ok_or_else(|| anyhow!("No media {id} in album {album}"))
    }

    async fn media(&self, album: &str, sort: SortOrder, filter: &str, photos: bool) -> Result<()> {
        let connected = self.connect().await?;
        let items = self.open_album(&connected, album).await?;
        connected.view.leave();

        let mut projected = project(&items, sort, filter);
        if photos {
            projected = photos_only(&projected);
        }

        if self.json {
            return self.print_json(&serde_json::to_value(&projected)?);
        }
        for item in &projected {
            println!(
                "{}\t{:>8}\t{}\t{}\t{}",
                item.id,
                item.formatted_duration(),
                item.sort_date().format("%Y-%m-%d %H:%M"),
                if item.is_photo() { "photo" } else { "video" },
                item.filename
            );
        }
        println!("{} of {} item(s)", projected.len(), items.len());
        Ok(())
    }

    async fn thumbnail(&self, id: &str, output: PathBuf) -> Result<()> {
        let connected = self.connect().await?;
        let token = interrupt_token();
        let asset = connected
            .assets
            .fetch_now(&connected.address, AssetKind::Thumbnail, id, &token)
            .await
            .with_context(|| format!("Cannot fetch thumbnail {id}"))?;
        connected.view.leave();

        if let Asset::Thumbnail(image) = &asset {
            info!(width = image.width, height = image.height, format = ?image.format, "Thumbnail decoded");
        }
        tokio::fs::write(&output, asset.bytes())
            .await
            .with_context(|| format!("Cannot write {}", output.display()))?;
        println!("{}", output.display());
        Ok(())
    }

    async fn download(&self, album: &str, id: &str, into: &str) -> Result<()> {
        let connected = self.connect().await?;
        let item = self.find_item(&connected, album, id).await?;
        let store = self.store()?;
        let path = store.reserve_import(into, &item.filename)?;

        let token = interrupt_token();
        let stream = connected
            .assets
            .open_stream(&connected.address, id, &token)
            .await
            .with_context(|| format!("Cannot fetch media {id}"))?;
        if let Some(length) = stream.content_length() {
            debug!(length, "Downloading");
        }

        let mut file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("Cannot create {}", path.display()))?;
        let result = stream.write_to(&mut file, &token).await;
        connected.view.leave();

        match result {
            Ok(written) => {
                info!(bytes = written, path = %path.display(), "Download complete");
                println!("{}", path.display());
                Ok(())
            }
            Err(e) => {
                drop(file);
                if let Err(remove) = tokio::fs::remove_file(&path).await {
                    warn!(error = %remove, "Cannot remove partial download");
                }
                Err(e).context("Download failed")
            }
        }
    }

    async fn play_item(&self, connected: &Connected, item: &MediaItem) -> Result<()> {
        let mut player = CommandPlayer::new(&self.config.get_player_command()?)?;
        let url = connected.view.play(item, &mut player)?;
        println!("Playing {} ({url})", item.filename);

        let status = tokio::task::spawn_blocking(move || player.wait()).await??;
        if let Some(status) = status.filter(|s| !s.success()) {
            warn!(%status, "Player exited with an error");
        }
        Ok(())
    }

    async fn play(&self, album: &str, id: &str) -> Result<()> {
        let connected = self.connect().await?;
        let item = self.find_item(&connected, album, id).await?;
        let result = self.play_item(&connected, &item).await;
        connected.view.leave();
        result
    }

    async fn random(&self, album: &str, filter: &str) -> Result<()> {
        let connected = self.connect().await?;
        let items = self.open_album(&connected, album).await?;
        let projected = project(&items, SortOrder::default(), filter);
        let item = random_video(&projected, &mut rand::rng())
            .cloned()
            .ok_or_else(|| anyhow!("No video in album {album}"))?;
        let result = self.play_item(&connected, &item).await;
        connected.view.leave();
        result
    }

    async fn import(&self, album: &str, files: Vec<PathBuf>) -> Result<()> {
        let store = self.store()?;
        let mut picker = ArgsPicker::new(files);
        for path in picker.pick()? {
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Cannot read {}", path.display()))?;
            let media = store.import(album, &filename, &bytes)?;
            println!("{}", media.path.display());
        }
        Ok(())
    }

    fn find_local(
        &self,
        store: &DirectoryStore,
        selector: AlbumSelector,
        album: &str,
        file: &str,
    ) -> Result<LocalMedia> {
        store
            .list_media(&selector)?
            .into_iter()
            .find(|m| m.album == album && m.filename == file)
            .ok_or_else(|| anyhow!("No file {file} in {album}"))
    }

    fn local(&self, action: LocalAction) -> Result<()> {
        let store = self.store()?;
        match action {
            LocalAction::Albums => {
                for album in store.list_albums()? {
                    println!("{album}");
                }
            }
            LocalAction::Create { name } => store.create_album(&name)?,
            LocalAction::Delete { name } => store.delete_album(&name)?,
            LocalAction::List { album, trash } => {
                let selector = match (album, trash) {
                    (_, true) => AlbumSelector::Trash,
                    (Some(album), false) => AlbumSelector::User(album),
                    (None, false) => AlbumSelector::All,
                };
                let media = store.list_media(&selector)?;
                if self.json {
                    let entries: Vec<serde_json::Value> = media
                        .iter()
                        .map(|m| {
                            json!({"album": m.album, "filename": m.filename, "path": m.path, "size": m.size})
                        })
                        .collect();
                    return self.print_json(&json!(entries));
                }
                for m in media {
                    println!("{}\t{}\t{}", m.album, m.filename, m.size);
                }
            }
            LocalAction::Trash { album, file } => {
                let media = self.find_local(&store, AlbumSelector::User(album.clone()), &album, &file)?;
                store.move_to_trash(&media)?;
            }
            LocalAction::Restore { album, file } => {
                let media = self.find_local(&store, AlbumSelector::Trash, &album, &file)?;
                let restored = store.restore(&media)?;
                println!("{}", restored.path.display());
            }
            LocalAction::Purge { album, file } => {
                let media = self.find_local(&store, AlbumSelector::Trash, &album, &file)?;
                store.delete_permanently(&media)?;
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Arc::new(
        Config::load_config(cli.config.as_deref().unwrap_or(""))
            .context("Cannot load configuration")?,
    );
    init_tracing(&config.get_log_min_level()?);

    let server = cli
        .server
        .as_deref()
        .map(ServerAddress::parse)
        .transpose()
        .context("Invalid --server")?;
    let app = App {
        config,
        server,
        json: cli.json,
    };

    match cli.command {
        Command::Discover { seconds } => app.discover(seconds).await,
        Command::Albums => app.albums().await,
        Command::Media {
            album,
            sort,
            filter,
            photos,
        } => app.media(&album, sort.into(), &filter, photos).await,
        Command::Thumbnail { id, output } => app.thumbnail(&id, output).await,
        Command::Download { album, id, into } => app.download(&album, &id, &into).await,
        Command::Play { album, id } => app.play(&album, &id).await,
        Command::Random { album, filter } => app.random(&album, &filter).await,
        Command::Import { album, files } => app.import(&album, files).await,
        Command::Local { action } => app.local(action),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_media_command() {
        let cli = Cli::try_parse_from([
            "pmovideo",
            "--server",
            "http://192.168.1.5:8080",
            "media",
            "all",
            "--sort",
            "duration-asc",
            "--filter",
            "beach",
        ])
        .unwrap();
        assert_eq!(cli.server.as_deref(), Some("http://192.168.1.5:8080"));
        match cli.command {
            Command::Media {
                album,
                sort,
                filter,
                photos,
            } => {
                assert_eq!(album, "all");
                assert_eq!(SortOrder::from(sort), SortOrder::DurationAsc);
                assert_eq!(filter, "beach");
                assert!(!photos);
            }
            _ => panic!("expected the media command"),
        }
    }

    #[test]
    fn test_local_list_flags_conflict() {
        assert!(
            Cli::try_parse_from(["pmovideo", "local", "list", "--album", "x", "--trash"]).is_err()
        );
    }
}
