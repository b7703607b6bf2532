//! Installable image catalog.
//!
//! Images are RouterOS packages (`.npk`). Their header carries the package
//! name, version, release channel, target architecture and a description,
//! which is enough to offer each device only the images built for it.

use crate::error::{NetInstallError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tracing::warn;

/// How much of a package is read to extract its metadata
pub const HEADER_LEN: usize = 256;

const NAME_RANGE: std::ops::Range<usize> = 14..30;
const VERSION_OFFSET: usize = 30;
const TAG_SEARCH_START: usize = 33;
const TAG_CHANNEL: [u8; 2] = [0x18, 0x00];
const TAG_ARCH: [u8; 2] = [0x10, 0x00];
const TAG_DESCRIPTION: [u8; 2] = [0x02, 0x00];

/// Metadata of one installable image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageMetadata {
    pub filename: String,
    pub name: String,
    pub version: String,
    pub channel: String,
    pub arch: String,
    pub description: String,
}

/// Source of installable images
#[async_trait]
pub trait ImageCatalog: Send + Sync {
    /// Every image the catalog knows, sorted by filename.
    async fn list(&self) -> Result<Vec<ImageMetadata>>;

    async fn resolve(&self, filename: &str) -> Result<ImageMetadata>;

    /// Full content of the image.
    async fn load(&self, filename: &str) -> Result<Bytes>;

    /// Images built for `arch`.
    async fn compatible_with(&self, arch: &str) -> Result<Vec<ImageMetadata>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|image| image.arch == arch)
            .collect())
    }
}

/// Parse the metadata out of the first [`HEADER_LEN`] bytes of a package.
///
/// Shorter input is treated as zero-padded.
pub fn parse_package_header(filename: &str, data: &[u8]) -> Result<ImageMetadata> {
    let mut header = [0u8; HEADER_LEN];
    let len = data.len().min(HEADER_LEN);
    header[..len].copy_from_slice(&data[..len]);

    let malformed = |reason: &str| NetInstallError::MalformedImage {
        filename: filename.to_string(),
        reason: reason.to_string(),
    };

    let name: String = String::from_utf8_lossy(&header[NAME_RANGE])
        .chars()
        .filter(|c| *c != '\0')
        .collect();

    let [patch, kind, minor, major] = [
        header[VERSION_OFFSET],
        header[VERSION_OFFSET + 1],
        header[VERSION_OFFSET + 2],
        header[VERSION_OFFSET + 3],
    ];
    let separator = if kind == b'b' { "beta" } else { "." };
    let version = format!("{major}.{minor}{separator}{patch}");

    let (channel, next) = tagged_text(&header, TAG_SEARCH_START, TAG_CHANNEL)
        .ok_or_else(|| malformed("missing channel"))?;
    let (arch, next) =
        tagged_text(&header, next, TAG_ARCH).ok_or_else(|| malformed("missing architecture"))?;
    let (description, _) = tagged_text(&header, next, TAG_DESCRIPTION)
        .ok_or_else(|| malformed("missing description"))?;

    Ok(ImageMetadata {
        filename: filename.to_string(),
        name,
        version,
        channel,
        arch,
        description,
    })
}

/// Find `tag` at or after `from`, then read the u32 LE length and text that
/// follow it. Returns the trimmed text and the offset just past it.
fn tagged_text(header: &[u8], from: usize, tag: [u8; 2]) -> Option<(String, usize)> {
    let found = header
        .get(from..)?
        .windows(tag.len())
        .position(|window| window == tag)?;
    let len_at = from + found + tag.len();
    let len_bytes: [u8; 4] = header.get(len_at..len_at + 4)?.try_into().ok()?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let text_at = len_at + 4;
    let text = header.get(text_at..text_at.checked_add(len)?)?;
    Some((
        String::from_utf8_lossy(text).trim().to_string(),
        text_at + len,
    ))
}

fn check_filename(filename: &str) -> Result<()> {
    if filename.is_empty()
        || filename.contains(['/', '\\'])
        || filename == "."
        || filename == ".."
    {
        return Err(NetInstallError::ImageNotFound(format!(
            "refusing image name {filename:?}"
        )));
    }
    Ok(())
}

/// Catalog backed by a directory of package files
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    root: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_of(&self, filename: &str) -> Result<PathBuf> {
        check_filename(filename)?;
        Ok(self.root.join(filename))
    }
}

fn not_found(filename: &str) -> impl FnOnce(std::io::Error) -> NetInstallError + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            NetInstallError::ImageNotFound(filename.to_string())
        } else {
            NetInstallError::Io(e)
        }
    }
}

#[async_trait]
impl ImageCatalog for DirectoryCatalog {
    async fn list(&self) -> Result<Vec<ImageMetadata>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut images = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(filename) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.resolve(&filename).await {
                Ok(image) => images.push(image),
                Err(e) => warn!(filename = %filename, error = %e, "Skipping unreadable image"),
            }
        }
        images.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(images)
    }

    async fn resolve(&self, filename: &str) -> Result<ImageMetadata> {
        let path = self.path_of(filename)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(not_found(filename))?;
        let mut header = Vec::with_capacity(HEADER_LEN);
        file.take(HEADER_LEN as u64).read_to_end(&mut header).await?;
        parse_package_header(filename, &header)
    }

    async fn load(&self, filename: &str) -> Result<Bytes> {
        let path = self.path_of(filename)?;
        let data = tokio::fs::read(&path).await.map_err(not_found(filename))?;
        Ok(Bytes::from(data))
    }
}

/// In-memory catalog
#[derive(Debug, Default, Clone)]
pub struct MemoryCatalog {
    images: Vec<(ImageMetadata, Bytes)>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image(&mut self, metadata: ImageMetadata, content: impl Into<Bytes>) {
        self.images
            .retain(|(existing, _)| existing.filename != metadata.filename);
        self.images.push((metadata, content.into()));
        self.images.sort_by(|a, b| a.0.filename.cmp(&b.0.filename));
    }

    fn find(&self, filename: &str) -> Result<&(ImageMetadata, Bytes)> {
        self.images
            .iter()
            .find(|(metadata, _)| metadata.filename == filename)
            .ok_or_else(|| NetInstallError::ImageNotFound(filename.to_string()))
    }
}

#[async_trait]
impl ImageCatalog for MemoryCatalog {
    async fn list(&self) -> Result<Vec<ImageMetadata>> {
        Ok(self.images.iter().map(|(metadata, _)| metadata.clone()).collect())
    }

    async fn resolve(&self, filename: &str) -> Result<ImageMetadata> {
        self.find(filename).map(|(metadata, _)| metadata.clone())
    }

    async fn load(&self, filename: &str) -> Result<Bytes> {
        self.find(filename).map(|(_, content)| content.clone())
    }
}
