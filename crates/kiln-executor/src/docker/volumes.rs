//! Host-side cache directories bound into build containers.
//!
//! Paths are `<cache root>/<project>/<md5(mount path)>`, so jobs never need to
//! coordinate: different projects or mount paths land in different
//! directories, and the same inputs always map to the same directory.

use std::path::{Path, PathBuf};

use kiln_core::Result;
use kiln_core::config::DEFAULT_CACHE_DIR;
use kiln_core::handle::{CacheVolumeBinding, ImageHandle};
use tracing::debug;

/// Host directory caching `mount_path` for `project_unique_name`.
pub fn cache_dir(cache_root: &Path, project_unique_name: &str, mount_path: &str) -> PathBuf {
    cache_root
        .join(project_unique_name)
        .join(format!("{:x}", md5::compute(mount_path)))
}

/// Absolute cache root from the configured value, or the default relative to
/// the current directory.
pub fn cache_root(configured: Option<&str>) -> Result<PathBuf> {
    let root = match configured {
        Some(dir) if !dir.is_empty() => dir,
        _ => DEFAULT_CACHE_DIR,
    };
    Ok(std::path::absolute(root)?)
}

/// Inputs of [`create_volumes`].
#[derive(Debug, Clone)]
pub struct VolumeRequest<'a> {
    pub cache_root: &'a Path,
    pub project_unique_name: &'a str,
    /// Configured cache paths.
    pub volumes: &'a [String],
    /// Image whose declared mount points are cached too.
    pub image: Option<&'a ImageHandle>,
    /// Working directory cached when incremental fetch is allowed.
    pub builds_dir: Option<&'a str>,
}

/// Create the cache directories and return one binding per mount, in order:
/// configured volumes, image volumes, then the working directory.
/// Duplicates are kept; the later bind shadows the earlier one.
pub async fn create_volumes(request: &VolumeRequest<'_>) -> Result<Vec<CacheVolumeBinding>> {
    let image_volumes = request
        .image
        .map(|image| image.volumes.as_slice())
        .unwrap_or_default();

    let mounts = request
        .volumes
        .iter()
        .chain(image_volumes)
        .map(String::as_str)
        .chain(request.builds_dir);

    let mut bindings = Vec::new();
    for mount in mounts {
        let host_dir = cache_dir(request.cache_root, request.project_unique_name, mount);
        tokio::fs::create_dir_all(&host_dir).await?;
        debug!(host = %host_dir.display(), volume = %mount, "Using cache directory");

        bindings.push(CacheVolumeBinding {
            host_path: host_dir.to_string_lossy().into_owned(),
            container_path: mount.to_string(),
        });
    }

    Ok(bindings)
}
