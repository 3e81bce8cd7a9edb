//! On-disk cache of driver pipeline blobs.
//!
//! Every pipeline is stored in its own file named
//! `<label>-<hash(vertex)>-<hash(fragment)>.pso` where the hashes are the first 128
//! bits of the BLAKE3 hash of the shader bytecode, hex encoded.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use tandem_tracing::trace_span;

use crate::backend::{Api, Device, GraphicsPipelineDescriptor};
use crate::error::{Error, Result};

pub const CACHE_EXTENSION: &str = "pso";

/// How a pipeline was created by [`create_pso_with_caching`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CacheStatus {
    /// Created from the cached blob.
    Hit,
    /// No blob was cached, the pipeline was created from scratch.
    Miss,
    /// The cached blob was rejected by the driver and replaced.
    Stale,
}

/// 128-bit content hash of shader bytecode.
pub fn content_hash(bytes: &[u8]) -> [u8; 16] {
    let hash = blake3::hash(bytes);
    let mut out = [0; 16];
    out.copy_from_slice(&hash.as_bytes()[..16]);
    out
}

pub fn cache_file_name(label: &str, vertex: &[u8], fragment: &[u8]) -> String {
    format!(
        "{}-{}-{}.{}",
        label,
        hex::encode(content_hash(vertex)),
        hex::encode(content_hash(fragment)),
        CACHE_EXTENSION
    )
}

/// Directory holding the pipeline cache files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineCacheDir {
    dir: Option<PathBuf>,
}

impl PipelineCacheDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    /// A cache that never reads or writes files.
    pub const fn disabled() -> Self {
        Self { dir: None }
    }

    /// Uses `dir` if given, otherwise `<documents>/<app_name>`.
    pub fn resolve(dir: Option<&Path>, app_name: &str) -> Self {
        let dir = match dir {
            Some(dir) => Some(dir.to_path_buf()),
            None => {
                let dir = dirs::document_dir().map(|docs| docs.join(app_name));
                if dir.is_none() {
                    tracing::warn!("no documents directory, pipeline cache disabled");
                }
                dir
            }
        };

        Self { dir }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn path(&self, label: &str, vertex: &[u8], fragment: &[u8]) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(cache_file_name(label, vertex, fragment)))
    }
}

/// Creates the pipeline described by `desc`, using and updating the blob cached for
/// `(desc.label, vertex, fragment)`.
///
/// `vertex` and `fragment` are the shader bytecode the modules of `desc` were created
/// from. A cached blob that the driver rejects is discarded and the pipeline is
/// created without it. Failing to write the cache file is not an error.
pub fn create_pso_with_caching<A: Api>(
    device: &A::Device,
    cache: &PipelineCacheDir,
    desc: &GraphicsPipelineDescriptor<'_, A>,
    vertex: &[u8],
    fragment: &[u8],
) -> Result<(A::Pipeline, CacheStatus)> {
    let _span = trace_span!("create_pso_with_caching").entered();

    let Some(path) = cache.path(desc.label, vertex, fragment) else {
        let pipeline = device.create_graphics_pipeline(desc, None)?;
        return Ok((pipeline, CacheStatus::Miss));
    };

    let cached = match std::fs::read(&path) {
        Ok(blob) => Some(blob),
        Err(err) if err.kind() == ErrorKind::NotFound => None,
        Err(err) => {
            tracing::warn!("failed to read pipeline cache {}: {}", path.display(), err);
            None
        }
    };

    let (pipeline, status) = match cached {
        Some(blob) => match device.create_graphics_pipeline(desc, Some(&blob)) {
            Ok(pipeline) => {
                tracing::debug!("pipeline {} loaded from {}", desc.label, path.display());
                return Ok((pipeline, CacheStatus::Hit));
            }
            Err(Error::PipelineCreate(reason)) => {
                tracing::warn!(
                    "discarding pipeline cache {}: {}",
                    path.display(),
                    reason
                );
                (device.create_graphics_pipeline(desc, None)?, CacheStatus::Stale)
            }
            Err(err) => return Err(err),
        },
        None => (device.create_graphics_pipeline(desc, None)?, CacheStatus::Miss),
    };

    match device.pipeline_cache_blob(&pipeline) {
        Ok(blob) if blob.is_empty() => {
            tracing::debug!("driver returned no cache blob for {}", desc.label);
        }
        Ok(blob) => {
            if let Err(err) = write_atomic(&path, &blob) {
                tracing::warn!("failed to write pipeline cache {}: {}", path.display(), err);
            }
        }
        Err(err) => {
            tracing::warn!("failed to get cache blob of {}: {}", desc.label, err);
        }
    }

    Ok((pipeline, status))
}

/// Replaces the file at `path` with `bytes` through a temporary file.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;

    // The temporary file is in the same directory so that persisting it is a rename.
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{cache_file_name, content_hash, write_atomic, PipelineCacheDir};

    #[test]
    fn cache_file_name_format() {
        let name = cache_file_name("draw-model", b"vertex", b"fragment");
        let parts: Vec<_> = name.trim_end_matches(".pso").split('-').collect();

        assert!(name.ends_with(".pso"));
        assert_eq!(parts[..2], ["draw", "model"]);
        assert_eq!(parts[2].len(), 32);
        assert_eq!(parts[3].len(), 32);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(parts[2], parts[3]);
    }

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
        assert_eq!(
            hex::encode(content_hash(b"")),
            "af1349b9f5f9a1a6a0404dea36dcc949"
        );
    }

    #[test]
    fn different_labels_use_different_files() {
        let cache = PipelineCacheDir::new("cache");
        assert_ne!(
            cache.path("image-blit", b"vs", b"fs"),
            cache.path("ui-overlay", b"vs", b"fs")
        );
        assert!(PipelineCacheDir::disabled().path("a", b"", b"").is_none());
    }

    #[test]
    fn resolve_prefers_override() {
        let cache = PipelineCacheDir::resolve(Some(Path::new("/tmp/override")), "app");
        assert_eq!(cache.dir(), Some(Path::new("/tmp/override")));
    }

    #[test]
    fn write_atomic_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("a.pso");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn write_atomic_keeps_old_file_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pso");
        write_atomic(&path, b"first").unwrap();

        // A directory in place of the target cannot be replaced by a file.
        let blocked = dir.path().join("blocked.pso");
        std::fs::create_dir(&blocked).unwrap();
        std::fs::write(blocked.join("inner"), b"x").unwrap();
        assert!(write_atomic(&blocked, b"second").is_err());

        assert_eq!(std::fs::read(&path).unwrap(), b"first");
        // No temporary files are left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }
}
