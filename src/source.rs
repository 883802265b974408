//! Access to the folder that holds the photos.
//!
//! The pipeline only ever talks to a [`PhotoSource`]: it lists entries once
//! per index build and reads individual photos by identifier afterwards.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use image::ImageFormat;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::Error;

/// Opaque, stable name of one photo inside a source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhotoId(String);

impl PhotoId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhotoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One listed entry together with its reported media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub id: PhotoId,
    pub media_type: String,
}

impl SourceEntry {
    pub fn is_image(&self) -> bool {
        self.media_type.starts_with("image/")
    }
}

/// Where the photos live, as handed over by the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLocation(PathBuf);

impl SourceLocation {
    /// Accepts a plain directory path or a `file://` URI.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::ConfigParseFailure {
                field: "source-location",
                reason: "location is blank".into(),
            });
        }
        let path = if let Some(rest) = trimmed.strip_prefix("file://") {
            rest
        } else if let Some((scheme, _)) = trimmed.split_once("://") {
            return Err(Error::ConfigParseFailure {
                field: "source-location",
                reason: format!("unsupported scheme `{scheme}`"),
            });
        } else {
            trimmed
        };
        if path.is_empty() {
            return Err(Error::ConfigParseFailure {
                field: "source-location",
                reason: "URI carries no path".into(),
            });
        }
        Ok(Self(PathBuf::from(path)))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl From<PathBuf> for SourceLocation {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Black-box enumerator/accessor for a photo container.
pub trait PhotoSource: Send + Sync {
    fn location(&self) -> &SourceLocation;

    /// Lists the entries in source order.
    fn list_images(&self) -> Result<Vec<SourceEntry>, Error>;

    /// Reads the raw bytes of one entry. `NotFound` means the photo vanished.
    fn read(&self, id: &PhotoId) -> io::Result<Vec<u8>>;
}

/// A folder on the local filesystem.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    location: SourceLocation,
    recursive: bool,
}

impl DirectorySource {
    pub fn new(location: SourceLocation, recursive: bool) -> Self {
        Self {
            location,
            recursive,
        }
    }

    fn resolve(&self, id: &PhotoId) -> Option<PathBuf> {
        let relative = Path::new(id.as_str());
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return None;
        }
        Some(self.location.path().join(relative))
    }
}

impl PhotoSource for DirectorySource {
    fn location(&self) -> &SourceLocation {
        &self.location
    }

    fn list_images(&self) -> Result<Vec<SourceEntry>, Error> {
        let root = self.location.path();
        let unavailable = |reason: String| Error::SourceUnavailable {
            location: self.location.to_string(),
            reason,
        };
        let meta = fs::metadata(root).map_err(|err| unavailable(err.to_string()))?;
        if !meta.is_dir() {
            return Err(unavailable("not a directory".into()));
        }
        // Probe readability up front so a permission error is not mistaken
        // for an empty folder.
        fs::read_dir(root).map_err(|err| unavailable(err.to_string()))?;

        let max_depth = if self.recursive { usize::MAX } else { 1 };
        let mut entries = Vec::new();
        for entry in WalkDir::new(root)
            .min_depth(1)
            .max_depth(max_depth)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            let id = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            entries.push(SourceEntry {
                id: PhotoId::new(id),
                media_type: media_type_for(entry.path()).to_string(),
            });
        }
        debug!(
            location = %self.location,
            entries = entries.len(),
            "listed source entries"
        );
        Ok(entries)
    }

    fn read(&self, id: &PhotoId) -> io::Result<Vec<u8>> {
        let path = self
            .resolve(id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "identifier escapes source"))?;
        fs::read(path)
    }
}

#[inline]
fn media_type_for(p: &Path) -> &'static str {
    ImageFormat::from_path(p)
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_paths_and_file_uris() {
        let plain = SourceLocation::parse(" /photos ").unwrap();
        assert_eq!(plain.path(), Path::new("/photos"));
        let uri = SourceLocation::parse("file:///mnt/pictures").unwrap();
        assert_eq!(uri.path(), Path::new("/mnt/pictures"));
    }

    #[test]
    fn rejects_blank_and_foreign_locations() {
        assert!(SourceLocation::parse("   ").is_err());
        assert!(SourceLocation::parse("content://tree/primary").is_err());
        assert!(SourceLocation::parse("file://").is_err());
    }

    #[test]
    fn lists_sorted_entries_with_media_types() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.png"), b"x").unwrap();
        fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("c.webp"), b"x").unwrap();

        let flat = DirectorySource::new(dir.path().to_path_buf().into(), false);
        let listed = flat.list_images().unwrap();
        let ids: Vec<_> = listed.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a.jpg", "b.png", "notes.txt"]);
        assert_eq!(listed[0].media_type, "image/jpeg");
        assert!(!listed[2].is_image());

        let deep = DirectorySource::new(dir.path().to_path_buf().into(), true);
        let ids: Vec<_> = deep
            .list_images()
            .unwrap()
            .into_iter()
            .map(|e| e.id.to_string())
            .collect();
        assert!(ids.contains(&"nested/c.webp".to_string()));
    }

    #[test]
    fn missing_folder_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectorySource::new(dir.path().join("gone").into(), false);
        assert!(matches!(
            source.list_images(),
            Err(Error::SourceUnavailable { .. })
        ));
    }

    #[test]
    fn read_refuses_identifiers_outside_the_folder() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectorySource::new(dir.path().to_path_buf().into(), false);
        let err = source.read(&PhotoId::new("../secret.jpg")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
