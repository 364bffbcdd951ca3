// Media source resolution: plain files, directories and ZIP archives.
//
// Frontends refer to media by (archive, name). An empty archive means `name`
// is a path; a directory archive is joined with `name`; a ZIP archive has the
// entry loaded into memory.

use std::fs::File;
use std::io::{Cursor, Read, Seek};
use std::path::{Path, PathBuf};

use crate::error::{MediaError, Result};

/// Byte stream a backend can parse.
pub trait ReadSeek: Read + Seek + Send + Sync {}

impl<T: Read + Seek + Send + Sync> ReadSeek for T {}

pub struct MediaSource {
    /// File name of the media (used for extension hints)
    pub name: String,
    pub reader: Box<dyn ReadSeek>,
    pub len: Option<u64>,
}

impl MediaSource {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| MediaError::open(format!("Failed to open {}: {}", path.display(), e)))?;
        let len = file.metadata().ok().map(|m| m.len());
        Ok(Self {
            name: path.to_string_lossy().into_owned(),
            reader: Box::new(file),
            len,
        })
    }

    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let len = bytes.len() as u64;
        Self {
            name: name.into(),
            reader: Box::new(Cursor::new(bytes)),
            len: Some(len),
        }
    }

    pub fn extension(&self) -> Option<String> {
        crate::backend::extension_of(&self.name)
    }

    pub fn into_bytes(mut self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.len.unwrap_or(0) as usize);
        self.reader
            .read_to_end(&mut bytes)
            .map_err(|e| MediaError::open(format!("Failed to read {}: {}", self.name, e)))?;
        Ok(bytes)
    }
}

impl std::fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSource")
            .field("name", &self.name)
            .field("len", &self.len)
            .finish()
    }
}

/// Resolves a logical media name to a byte stream.
pub trait SourceResolver {
    fn resolve(&self, archive: &str, name: &str) -> Result<MediaSource>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// No archive: the name is a path
    None,
    Directory,
    Zip,
    Unknown,
}

pub fn detect_archive_format(archive: &str) -> ArchiveFormat {
    if archive.is_empty() {
        return ArchiveFormat::None;
    }
    let path = Path::new(archive);
    if path.is_dir() {
        return ArchiveFormat::Directory;
    }

    if crate::backend::extension_of(archive).as_deref() == Some("zip") {
        return ArchiveFormat::Zip;
    }

    // Try magic bytes
    if let Ok(mut file) = File::open(path) {
        let mut magic = [0u8; 4];
        if file.read_exact(&mut magic).is_ok() && magic == [0x50, 0x4B, 0x03, 0x04] {
            return ArchiveFormat::Zip;
        }
    }
    ArchiveFormat::Unknown
}

/// File-system resolver that also looks inside ZIP archives.
#[derive(Debug, Default, Clone)]
pub struct FsResolver {
    /// Base directory for relative archive paths
    pub base: Option<PathBuf>,
}

impl FsResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base<P: Into<PathBuf>>(base: P) -> Self {
        Self { base: Some(base.into()) }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        match &self.base {
            Some(base) if Path::new(path).is_relative() => base.join(path),
            _ => PathBuf::from(path),
        }
    }
}

impl SourceResolver for FsResolver {
    fn resolve(&self, archive: &str, name: &str) -> Result<MediaSource> {
        if archive.is_empty() {
            return MediaSource::from_file(self.full_path(name));
        }

        let archive_path = self.full_path(archive);
        let archive_str = archive_path.to_string_lossy();
        match detect_archive_format(&archive_str) {
            ArchiveFormat::Directory => MediaSource::from_file(archive_path.join(name)),
            ArchiveFormat::Zip => ZipResolver.resolve(&archive_str, name),
            ArchiveFormat::None | ArchiveFormat::Unknown => Err(MediaError::open(format!(
                "Unsupported archive: {}",
                archive_path.display()
            ))),
        }
    }
}

/// Loads an entry of a ZIP archive into memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipResolver;

impl SourceResolver for ZipResolver {
    fn resolve(&self, archive: &str, name: &str) -> Result<MediaSource> {
        let file = File::open(archive)
            .map_err(|e| MediaError::open(format!("Failed to open {}: {}", archive, e)))?;
        let mut zip = zip::ZipArchive::new(file)
            .map_err(|e| MediaError::open(format!("Failed to read ZIP {}: {}", archive, e)))?;
        let mut entry = zip
            .by_name(name)
            .map_err(|e| MediaError::open(format!("{} not found in {}: {}", name, archive, e)))?;

        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| MediaError::open(format!("Failed to extract {}: {}", name, e)))?;

        tracing::debug!("Loaded {} ({} bytes) from {}", name, bytes.len(), archive);
        Ok(MediaSource::from_bytes(name, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_zip(path: &Path, name: &str, contents: &[u8]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file(name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(contents).unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn test_plain_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.synth");
        std::fs::write(&path, b"{}").unwrap();

        let source = FsResolver::new().resolve("", path.to_str().unwrap()).unwrap();
        assert_eq!(source.extension().as_deref(), Some("synth"));
        assert_eq!(source.into_bytes().unwrap(), b"{}");
    }

    #[test]
    fn test_directory_archive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.wav"), b"RIFF").unwrap();

        let resolver = FsResolver::with_base(dir.path());
        let archive = dir.path().to_str().unwrap();
        assert_eq!(detect_archive_format(archive), ArchiveFormat::Directory);
        let source = resolver.resolve(archive, "a.wav").unwrap();
        assert_eq!(source.len, Some(4));
    }

    #[test]
    fn test_zip_entry() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("snaps.zip");
        write_zip(&zip_path, "pacman.synth", b"{\"fps\": 30}");

        let source = FsResolver::new()
            .resolve(zip_path.to_str().unwrap(), "pacman.synth")
            .unwrap();
        assert_eq!(source.name, "pacman.synth");
        assert_eq!(source.into_bytes().unwrap(), b"{\"fps\": 30}");
    }

    #[test]
    fn test_missing_zip_entry() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("snaps.zip");
        write_zip(&zip_path, "a.synth", b"{}");

        let err = ZipResolver.resolve(zip_path.to_str().unwrap(), "b.synth").unwrap_err();
        assert!(matches!(err, MediaError::Open(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = FsResolver::new().resolve("", "/definitely/not/here.mp4").unwrap_err();
        assert!(matches!(err, MediaError::Open(_)));
    }
}
