//! Interfaces of the components living outside the catalogue client.
//!
//! The library only defines the traits; `PMOVideo` provides a
//! directory-backed store and an external-command player.

use std::path::PathBuf;

use url::Url;

use crate::errors::CollaboratorError;

/// Which local album to list.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AlbumSelector {
    All,
    Trash,
    User(String),
}

/// One imported file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalMedia {
    pub album: String,
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
}

/// On-device media library.
pub trait LocalMediaStore {
    fn list_albums(&self) -> Result<Vec<String>, CollaboratorError>;

    fn create_album(&self, name: &str) -> Result<(), CollaboratorError>;

    /// Deleting an album moves its media to the trash.
    fn delete_album(&self, name: &str) -> Result<(), CollaboratorError>;

    fn list_media(&self, selector: &AlbumSelector) -> Result<Vec<LocalMedia>, CollaboratorError>;

    fn move_to_trash(&self, media: &LocalMedia) -> Result<LocalMedia, CollaboratorError>;

    fn restore(&self, media: &LocalMedia) -> Result<LocalMedia, CollaboratorError>;

    fn delete_permanently(&self, media: &LocalMedia) -> Result<(), CollaboratorError>;

    /// Stores `bytes` as `filename` in `album`.
    fn import(
        &self,
        album: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<LocalMedia, CollaboratorError>;

    /// Path a streamed import should be written to.
    ///
    /// Stores that cannot hand out paths refuse.
    fn reserve_import(&self, album: &str, filename: &str) -> Result<PathBuf, CollaboratorError> {
        let _ = (album, filename);
        Err(CollaboratorError::unsupported("reserve_import"))
    }
}

/// External video player.
pub trait PlaybackSurface {
    fn load(&mut self, url: &Url) -> Result<(), CollaboratorError>;

    fn play(&mut self) -> Result<(), CollaboratorError>;

    fn pause(&mut self) -> Result<(), CollaboratorError>;

    fn is_ready(&self) -> bool;
}

/// Source of files to import.
pub trait ImportPicker {
    fn pick(&mut self) -> Result<Vec<PathBuf>, CollaboratorError>;
}
