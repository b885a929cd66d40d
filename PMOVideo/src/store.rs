//! Directory-backed local library.
//!
//! Layout: one subdirectory per album, trashed files under
//! `.trash/<album>/<file>` so they can be restored to their album.

use std::fs;
use std::path::{Path, PathBuf};

use pmoremote::{AlbumSelector, CollaboratorError, LocalMedia, LocalMediaStore};
use tracing::{debug, info};

const TRASH_DIR: &str = ".trash";

pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CollaboratorError> {
        let root = root.into();
        fs::create_dir_all(root.join(TRASH_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn album_dir(&self, album: &str) -> Result<PathBuf, CollaboratorError> {
        validate_name(album)?;
        Ok(self.root.join(album))
    }

    fn trash_dir(&self, album: &str) -> Result<PathBuf, CollaboratorError> {
        validate_name(album)?;
        Ok(self.root.join(TRASH_DIR).join(album))
    }

    fn files_in(&self, album: &str, dir: &Path) -> Result<Vec<LocalMedia>, CollaboratorError> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut media = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let filename = entry.file_name().to_string_lossy().into_owned();
            if filename.starts_with('.') {
                continue;
            }
            media.push(LocalMedia {
                album: album.to_string(),
                filename,
                path: entry.path(),
                size: metadata.len(),
            });
        }
        media.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(media)
    }

    fn trashed(&self) -> Result<Vec<LocalMedia>, CollaboratorError> {
        let mut media = Vec::new();
        for album in list_subdirs(&self.root.join(TRASH_DIR))? {
            let dir = self.root.join(TRASH_DIR).join(&album);
            media.extend(self.files_in(&album, &dir)?);
        }
        Ok(media)
    }
}

fn list_subdirs(dir: &Path) -> Result<Vec<String>, CollaboratorError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// A name is a single, visible path component.
fn validate_name(name: &str) -> Result<(), CollaboratorError> {
    let trimmed = name.trim();
    let single_component = Path::new(trimmed)
        .file_name()
        .is_some_and(|component| component == trimmed);
    if trimmed.is_empty() || trimmed.starts_with('.') || !single_component {
        return Err(CollaboratorError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// `beach.mov`, `beach (1).mov`, `beach (2).mov`...
fn unique_path(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }
    let path = Path::new(filename);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string());
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());
    (1..)
        .map(|n| match &extension {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

fn move_file(from: &Path, to_dir: &Path, filename: &str) -> Result<PathBuf, CollaboratorError> {
    if !from.is_file() {
        return Err(CollaboratorError::NotFound(from.display().to_string()));
    }
    fs::create_dir_all(to_dir)?;
    let target = unique_path(to_dir, filename);
    fs::rename(from, &target)?;
    Ok(target)
}

impl LocalMediaStore for DirectoryStore {
    fn list_albums(&self) -> Result<Vec<String>, CollaboratorError> {
        list_subdirs(&self.root)
    }

    fn create_album(&self, name: &str) -> Result<(), CollaboratorError> {
        let dir = self.album_dir(name)?;
        if dir.exists() {
            return Err(CollaboratorError::AlreadyExists(name.to_string()));
        }
        fs::create_dir(&dir)?;
        info!(album = %name, "Album created");
        Ok(())
    }

    fn delete_album(&self, name: &str) -> Result<(), CollaboratorError> {
        let dir = self.album_dir(name)?;
        if !dir.is_dir() {
            return Err(CollaboratorError::NotFound(name.to_string()));
        }
        for media in self.files_in(name, &dir)? {
            self.move_to_trash(&media)?;
        }
        fs::remove_dir_all(&dir)?;
        info!(album = %name, "Album deleted, content moved to trash");
        Ok(())
    }

    fn list_media(&self, selector: &AlbumSelector) -> Result<Vec<LocalMedia>, CollaboratorError> {
        match selector {
            AlbumSelector::All => {
                let mut media = Vec::new();
                for album in self.list_albums()? {
                    let dir = self.album_dir(&album)?;
                    media.extend(self.files_in(&album, &dir)?);
                }
                Ok(media)
            }
            AlbumSelector::Trash => self.trashed(),
            AlbumSelector::User(album) => {
                let dir = self.album_dir(album)?;
                if !dir.is_dir() {
                    return Err(CollaboratorError::NotFound(album.clone()));
                }
                self.files_in(album, &dir)
            }
        }
    }

    fn move_to_trash(&self, media: &LocalMedia) -> Result<LocalMedia, CollaboratorError> {
        let target = move_file(&media.path, &self.trash_dir(&media.album)?, &media.filename)?;
        debug!(file = %media.filename, "Moved to trash");
        Ok(LocalMedia {
            filename: file_name(&target, &media.filename),
            path: target,
            ..media.clone()
        })
    }

    fn restore(&self, media: &LocalMedia) -> Result<LocalMedia, CollaboratorError> {
        let target = move_file(&media.path, &self.album_dir(&media.album)?, &media.filename)?;
        debug!(file = %media.filename, album = %media.album, "Restored from trash");
        Ok(LocalMedia {
            filename: file_name(&target, &media.filename),
            path: target,
            ..media.clone()
        })
    }

    fn delete_permanently(&self, media: &LocalMedia) -> Result<(), CollaboratorError> {
        if !media.path.starts_with(&self.root) {
            return Err(CollaboratorError::NotFound(media.path.display().to_string()));
        }
        fs::remove_file(&media.path)?;
        info!(file = %media.filename, "Deleted permanently");
        Ok(())
    }

    fn import(
        &self,
        album: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<LocalMedia, CollaboratorError> {
        let path = self.reserve_import(album, filename)?;
        fs::write(&path, bytes)?;
        info!(album = %album, path = %path.display(), "Imported");
        Ok(LocalMedia {
            album: album.to_string(),
            filename: file_name(&path, filename),
            size: bytes.len() as u64,
            path,
        })
    }

    fn reserve_import(&self, album: &str, filename: &str) -> Result<PathBuf, CollaboratorError> {
        validate_name(filename)?;
        let dir = self.album_dir(album)?;
        fs::create_dir_all(&dir)?;
        Ok(unique_path(&dir, filename))
    }
}

fn file_name(path: &Path, fallback: &str) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| fallback.to_string())
}
