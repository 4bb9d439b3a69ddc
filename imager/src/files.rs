//! Image folder access
//!
//! Lists the images the camera stored in the configured folder, oldest first,
//! and resolves a listed name for download or removal.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::{ImagerError, ImagerResult};

/// Name fragments marking an image file
pub const IMAGE_EXTENSIONS: [&str; 12] = [
    ".fits", ".xisf", ".raw", ".jpeg", ".tiff", ".avi", ".ser", ".nef", ".cr", ".sr", ".arw", ".raf",
];

pub fn is_image_name(name: &str) -> bool {
    IMAGE_EXTENSIONS.iter().any(|extension| name.contains(extension))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageFile {
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// An image encoded for transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageDownload {
    pub name: String,
    /// Extension including the dot, empty when the name has none
    pub extension: String,
    /// Base64 encoded file content
    pub data: String,
}

#[derive(Debug, Clone)]
pub struct ImageFolder {
    dir: PathBuf,
}

impl ImageFolder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Non-empty image files, by modification time ascending
    pub fn list(&self) -> ImagerResult<Vec<ImageFile>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_image_name(&name) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    tracing::warn!("Can not stat {:?}: {}", entry.path(), err);
                    continue;
                }
            };
            if !metadata.is_file() || metadata.len() == 0 {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push(ImageFile {
                name,
                size: metadata.len(),
                modified: DateTime::<Utc>::from(modified),
            });
        }
        files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));
        Ok(files)
    }

    /// Path of a listed file, failing for missing or empty files
    fn resolve(&self, name: &str) -> ImagerResult<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == ".." {
            return Err(ImagerError::InvalidConfiguration(format!("Invalid file name '{}'", name)));
        }
        let path = self.dir.join(name);
        let metadata = std::fs::metadata(&path)?;
        if !metadata.is_file() || metadata.len() == 0 {
            return Err(ImagerError::InvalidConfiguration(format!("{} is empty", name)));
        }
        Ok(path)
    }

    pub fn read(&self, name: &str) -> ImagerResult<Vec<u8>> {
        let path = self.resolve(name)?;
        Ok(std::fs::read(path)?)
    }

    pub fn download(&self, name: &str) -> ImagerResult<ImageDownload> {
        let bytes = self.read(name)?;
        let extension = Path::new(name)
            .extension()
            .map(|extension| format!(".{}", extension.to_string_lossy()))
            .unwrap_or_default();
        tracing::debug!("Downloading {} ({} bytes)", name, bytes.len());
        Ok(ImageDownload {
            name: name.to_string(),
            extension,
            data: BASE64.encode(bytes),
        })
    }

    pub fn delete(&self, name: &str) -> ImagerResult<()> {
        let path = self.resolve(name)?;
        std::fs::remove_file(&path)?;
        tracing::info!("Removed {:?}", path);
        Ok(())
    }
}
