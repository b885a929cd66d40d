use std::fs;
use std::path::PathBuf;

use pmoremote::{CollaboratorError, ImportPicker};

/// Picks the files named on the command line; directories contribute their
/// regular files.
pub struct ArgsPicker {
    paths: Vec<PathBuf>,
}

impl ArgsPicker {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

impl ImportPicker for ArgsPicker {
    fn pick(&mut self) -> Result<Vec<PathBuf>, CollaboratorError> {
        let mut picked = Vec::new();
        for path in self.paths.drain(..) {
            if path.is_dir() {
                let mut files: Vec<PathBuf> = fs::read_dir(&path)?
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|p| p.is_file())
                    .collect();
                files.sort();
                picked.extend(files);
            } else if path.is_file() {
                picked.push(path);
            } else {
                return Err(CollaboratorError::NotFound(path.display().to_string()));
            }
        }
        Ok(picked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pick_files_and_directories() {
        let dir = TempDir::new().unwrap();
        let single = dir.path().join("one.mov");
        fs::write(&single, b"1").unwrap();
        let folder = dir.path().join("batch");
        fs::create_dir(&folder).unwrap();
        fs::write(folder.join("b.jpg"), b"b").unwrap();
        fs::write(folder.join("a.jpg"), b"a").unwrap();

        let mut picker = ArgsPicker::new(vec![single.clone(), folder.clone()]);
        let picked = picker.pick().unwrap();
        assert_eq!(picked, vec![single, folder.join("a.jpg"), folder.join("b.jpg")]);
        assert!(picker.pick().unwrap().is_empty());

        let mut missing = ArgsPicker::new(vec![dir.path().join("nope")]);
        assert!(missing.pick().is_err());
    }
}
