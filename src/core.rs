use std::collections::BTreeMap;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 hash used for content-addressing and change detection.
///
/// In `assetpipe`, this serves two purposes:
/// 1. It names persisted cache tables and snapshots, derived from the
///    absolute path of the pipeline entry or a watched directory.
/// 2. It fingerprints script and input files, so a new session can tell which
///    files changed since the last successful save.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub(crate) fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new()
            .update_mmap_rayon(path)?
            .finalize()
            .into())
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    /// Short, filesystem-safe name: hex of the first 16 bytes.
    pub(crate) fn to_short_hex(self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(32);
        hex
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Hashes every file that still exists on disk. Missing files are left out of
/// the map, which makes them show up as removed when compared.
pub(crate) fn fingerprint<I>(paths: I) -> BTreeMap<Utf8PathBuf, Hash32>
where
    I: IntoIterator<Item = Utf8PathBuf>,
{
    paths
        .into_iter()
        .collect::<Vec<_>>()
        .into_par_iter()
        .filter_map(|path| {
            let hash = Hash32::hash_file(&path).ok()?;
            Some((path, hash))
        })
        .collect()
}

/// A single file flowing through the pipeline.
///
/// Files are cheap descriptors: `content` points at the bytes on disk, and
/// it is also the identity used by the claim, ignore and cache-miss sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    /// Directory of the file relative to the base directory of the query that
    /// matched it. Empty for literal queries.
    pub dirname: Utf8PathBuf,
    /// File name including the extension.
    pub basename: String,
    /// Absolute path to the file contents.
    pub content: Utf8PathBuf,
    /// Arbitrary data attached by transformers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl File {
    /// Creates a file descriptor without metadata.
    pub fn new(
        dirname: impl Into<Utf8PathBuf>,
        basename: impl Into<String>,
        content: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            dirname: dirname.into(),
            basename: basename.into(),
            content: content.into(),
            metadata: None,
        }
    }

    /// Attaches metadata to this file.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Path of this file relative to its query base, `dirname/basename`.
    pub fn relative(&self) -> Utf8PathBuf {
        self.dirname.join(&self.basename)
    }

    /// File extension without the leading dot, if any.
    pub fn extension(&self) -> Option<&str> {
        Utf8Path::new(&self.basename).extension()
    }
}

/// The mode in which the engine is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// A one-time build.
    Build,
    /// A continuous watch mode for development.
    Watch,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Build => write!(f, "build"),
            Mode::Watch => write!(f, "watch"),
        }
    }
}

/// Engine configuration shared by [`build`](crate::build) and
/// [`watch`](crate::watch).
///
/// # Example
///
/// ```rust
/// use assetpipe::Settings;
///
/// let settings = Settings::default()
///     .root("site")
///     .out_dir("public")
///     .cache_dir(".cache/assetpipe");
/// ```
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory against which relative query patterns are resolved.
    pub root: Utf8PathBuf,
    /// Where the final files of a successful run are copied to.
    pub out_dir: Option<Utf8PathBuf>,
    /// Where the result cache is persisted. `None` disables caching.
    pub cache_dir: Option<Utf8PathBuf>,
    /// Quiet period used to coalesce bursts of filesystem events.
    pub debounce: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root: Utf8PathBuf::from("."),
            out_dir: Some(Utf8PathBuf::from("dist")),
            cache_dir: None,
            debounce: Duration::from_millis(100),
        }
    }
}

impl Settings {
    pub fn root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn out_dir(mut self, out_dir: impl Into<Utf8PathBuf>) -> Self {
        self.out_dir = Some(out_dir.into());
        self
    }

    /// Disables writing the final files anywhere.
    pub fn no_output(mut self) -> Self {
        self.out_dir = None;
        self
    }

    pub fn cache_dir(mut self, cache_dir: impl Into<Utf8PathBuf>) -> Self {
        self.cache_dir = Some(cache_dir.into());
        self
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Resolves `path` against the configured root.
    pub(crate) fn resolve(&self, path: &Utf8Path) -> Utf8PathBuf {
        self.root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex() {
        let hash = Hash32::hash(b"assetpipe");
        let hex = hash.to_hex();

        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash.to_short_hex(), hex[..32]);
        assert_eq!(Hash32::hash(b"assetpipe"), hash);
        assert_ne!(Hash32::hash(b"assetpipe2"), hash);
    }

    #[test]
    fn test_fingerprint_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        std::fs::write(root.join("a.txt"), "a").unwrap();

        let prints = fingerprint([root.join("a.txt"), root.join("missing.txt")]);

        assert_eq!(prints.len(), 1);
        assert_eq!(prints[&root.join("a.txt")], Hash32::hash(b"a"));
    }

    #[test]
    fn test_file_helpers() {
        let file = File::new("img", "logo.png", "/site/img/logo.png");

        assert_eq!(file.relative(), Utf8Path::new("img/logo.png"));
        assert_eq!(file.extension(), Some("png"));
        assert!(file.metadata.is_none());
    }

    #[test]
    fn test_settings_builder() {
        let settings = Settings::default().root("site").no_output();

        assert_eq!(settings.root, "site");
        assert!(settings.out_dir.is_none());
        assert!(settings.cache_dir.is_none());
        assert_eq!(settings.resolve(Utf8Path::new("a/b")), "site/a/b");
    }
}
