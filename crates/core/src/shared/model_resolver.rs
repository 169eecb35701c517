use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelResolveError {
    #[error("failed to create cache directory: {0}")]
    CacheDir(#[source] std::io::Error),
    #[error("download failed for {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to write model to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("model {name} not found locally and no download URL configured")]
    NotFound { name: String },
    #[error("model file {path} is empty")]
    Empty { path: PathBuf },
    #[error("could not determine cache directory")]
    NoCacheDir,
}

/// A model file the engine needs, and where it may be fetched from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelAsset {
    pub name: String,
    pub url: Option<String>,
}

impl ModelAsset {
    pub fn new(name: impl Into<String>, url: Option<String>) -> Self {
        Self {
            name: name.into(),
            url,
        }
    }
}

/// Resolve a model file, checking local locations before downloading.
///
/// Resolution order:
/// 1. User cache directory (platform-specific)
/// 2. Bundled directory (development checkouts, packaged installs)
/// 3. Download from the asset URL into the cache
pub fn resolve(
    asset: &ModelAsset,
    bundled_dir: Option<&Path>,
) -> Result<PathBuf, ModelResolveError> {
    resolve_in(&model_cache_dir()?, asset, bundled_dir)
}

/// [`resolve`] against an explicit cache directory.
pub fn resolve_in(
    cache_dir: &Path,
    asset: &ModelAsset,
    bundled_dir: Option<&Path>,
) -> Result<PathBuf, ModelResolveError> {
    let cached_path = cache_dir.join(&asset.name);
    if cached_path.exists() {
        return non_empty(cached_path);
    }

    if let Some(dir) = bundled_dir {
        let bundled_path = dir.join(&asset.name);
        if bundled_path.exists() {
            return non_empty(bundled_path);
        }
    }

    let Some(url) = asset.url.as_deref() else {
        return Err(ModelResolveError::NotFound {
            name: asset.name.clone(),
        });
    };

    log::info!("Downloading model {} from {url}", asset.name);
    fs::create_dir_all(cache_dir).map_err(ModelResolveError::CacheDir)?;
    download(url, &cached_path)?;
    non_empty(cached_path)
}

/// Platform-specific model cache directory.
///
/// - macOS: `~/Library/Application Support/LandmarkStream/models/`
/// - Linux: `$XDG_CACHE_HOME/LandmarkStream/models/` or `~/.cache/LandmarkStream/models/`
/// - Windows: `%LOCALAPPDATA%/LandmarkStream/models/`
pub fn model_cache_dir() -> Result<PathBuf, ModelResolveError> {
    #[cfg(target_os = "macos")]
    {
        dirs::data_dir()
            .map(|d| d.join("LandmarkStream").join("models"))
            .ok_or(ModelResolveError::NoCacheDir)
    }
    #[cfg(not(target_os = "macos"))]
    {
        dirs::cache_dir()
            .map(|d| d.join("LandmarkStream").join("models"))
            .ok_or(ModelResolveError::NoCacheDir)
    }
}

fn non_empty(path: PathBuf) -> Result<PathBuf, ModelResolveError> {
    match fs::metadata(&path) {
        Ok(meta) if meta.len() > 0 => Ok(path),
        _ => Err(ModelResolveError::Empty { path }),
    }
}

fn download(url: &str, dest: &Path) -> Result<(), ModelResolveError> {
    let temp_path = dest.with_extension("part");

    let result = download_inner(url, dest, &temp_path);

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }

    result
}

fn download_inner(url: &str, dest: &Path, temp_path: &Path) -> Result<(), ModelResolveError> {
    let write_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| ModelResolveError::Write { path, source }
    };

    let mut response = reqwest::blocking::get(url)
        .and_then(|r| r.error_for_status())
        .map_err(|e| ModelResolveError::Download {
            url: url.to_string(),
            source: e,
        })?;

    let mut file = fs::File::create(temp_path).map_err(write_err(temp_path))?;

    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = response.read(&mut buf).map_err(write_err(temp_path))?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).map_err(write_err(temp_path))?;
    }

    file.flush().map_err(write_err(temp_path))?;
    drop(file);

    fs::rename(temp_path, dest).map_err(write_err(dest))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_prefers_cache_over_bundled() {
        let tmp = TempDir::new().unwrap();
        let cache = tmp.path().join("cache");
        let bundled = tmp.path().join("bundled");
        fs::create_dir_all(&cache).unwrap();
        fs::create_dir_all(&bundled).unwrap();
        fs::write(cache.join("mesh.onnx"), b"cached").unwrap();
        fs::write(bundled.join("mesh.onnx"), b"bundled").unwrap();

        let asset = ModelAsset::new("mesh.onnx", None);
        let path = resolve_in(&cache, &asset, Some(&bundled)).unwrap();

        assert_eq!(path, cache.join("mesh.onnx"));
    }

    #[test]
    fn test_resolve_falls_back_to_bundled() {
        let tmp = TempDir::new().unwrap();
        let cache = tmp.path().join("cache");
        let bundled = tmp.path().join("bundled");
        fs::create_dir_all(&bundled).unwrap();
        fs::write(bundled.join("mesh.onnx"), b"bundled").unwrap();

        let asset = ModelAsset::new("mesh.onnx", None);
        let path = resolve_in(&cache, &asset, Some(&bundled)).unwrap();

        assert_eq!(path, bundled.join("mesh.onnx"));
    }

    #[test]
    fn test_resolve_without_url_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let asset = ModelAsset::new("missing.onnx", None);

        let result = resolve_in(tmp.path(), &asset, None);

        assert!(matches!(
            result,
            Err(ModelResolveError::NotFound { name }) if name == "missing.onnx"
        ));
    }

    #[test]
    fn test_resolve_rejects_empty_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("empty.onnx"), b"").unwrap();
        let asset = ModelAsset::new("empty.onnx", None);

        let result = resolve_in(tmp.path(), &asset, None);

        assert!(matches!(result, Err(ModelResolveError::Empty { .. })));
    }

    #[test]
    fn test_model_cache_dir_returns_path() {
        let path = model_cache_dir().unwrap();
        assert!(path.to_string_lossy().contains("LandmarkStream"));
        assert!(path.to_string_lossy().contains("models"));
    }

    #[test]
    fn test_download_atomic_no_partial_on_failure() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("model.onnx");
        let result = download("http://invalid.nonexistent.example.com/model", &dest);
        assert!(result.is_err());
        assert!(!dest.exists());
        assert!(!dest.with_extension("part").exists());
    }
}
