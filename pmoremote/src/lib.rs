//! # pmoremote - PMOVideo media server client
//!
//! `pmoremote` browses a PMOVideo media server on the local network:
//!
//! - **Discovery**: DNS-SD / mDNS browsing for `_myvideoserver._tcp.local`
//!   ([`ServiceDiscovery`], [`MdnsBrowser`])
//! - **Catalogue**: album and media lists over the JSON REST API
//!   ([`CatalogueClient`])
//! - **Assets**: thumbnails and media bodies with a bounded retry protocol
//!   tolerating server-side generation ([`AssetFetcher`])
//! - **View state**: discovery and catalogue merged into one observable state
//!   machine ([`CatalogueViewHandle`]) plus a pure sort/filter
//!   [`projection`]
//!
//! ## Quick Start
//!
//! ```no_run
//! use pmoremote::{
//!     AssetFetcher, CatalogueClient, CatalogueViewHandle, DiscoveryConfig, DisplayState,
//!     ServiceDiscovery,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let catalogue = CatalogueClient::new()?;
//!     let assets = AssetFetcher::from_catalogue(&catalogue);
//!     let discovery = ServiceDiscovery::mdns(DiscoveryConfig::default());
//!
//!     let view = CatalogueViewHandle::spawn(discovery, catalogue, assets);
//!     view.enter();
//!
//!     let snapshot = view
//!         .wait_until(|s| matches!(s.display(), DisplayState::Albums | DisplayState::EmptyCatalogue))
//!         .await;
//!     if let Some(snapshot) = snapshot {
//!         for (group, albums) in snapshot.grouped_albums() {
//!             println!("{}", group.title());
//!             for album in albums {
//!                 println!("  {} ({})", album.name, album.media_count);
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod asset;
pub mod catalogue;
pub mod collaborators;
pub mod discovery;
pub mod errors;
pub mod model;
pub mod projection;
pub mod view;

#[cfg(feature = "pmoconfig")]
pub mod config_ext;

pub use asset::{
    Asset, AssetFetchState, AssetFetcher, AssetHandle, AssetKind, FetchScope, MediaBytes,
    MediaStream, RetryPolicy, RetryReason, ThumbnailImage,
};
pub use catalogue::{CatalogueClient, ClientBuilder};
pub use collaborators::{AlbumSelector, ImportPicker, LocalMedia, LocalMediaStore, PlaybackSurface};
pub use discovery::{
    BrowseEvent, DiscoveryConfig, MdnsBrowser, ServerList, ServiceBrowser, ServiceDiscovery,
    StaticBrowser,
};
pub use errors::{AssetError, CatalogueError, CollaboratorError, DiscoveryError};
pub use model::{
    AlbumGroup, AlbumKind, AlbumSummary, DiscoveredServer, MediaItem, MediaKind, ServerAddress,
    ServerId, ServiceName,
};
pub use projection::{SortOrder, photos_only, project, random_video};
pub use view::{
    AlbumMediaState, CatalogueSnapshot, CatalogueState, CatalogueViewHandle, DisplayState,
    LoadStatus,
};

#[cfg(feature = "pmoconfig")]
pub use config_ext::RemoteConfigExt;
