//! Tunnel binary resolution and installation
//!
//! Binaries are cached under `<cache_dir>/<version>/`. Installing a version
//! removes every other cached version.

use flate2::read::GzDecoder;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{ReachError, Result};

/// Tunnel release this build installs
pub const TUNNEL_VERSION: &str = "2024.8.2";

const RELEASE_BASE_URL: &str = "https://github.com/cloudflare/cloudflared/releases/download";
const BINARY_NAME: &str = "cloudflared";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetFormat {
    Binary,
    /// gzip'd tar containing the binary
    Tgz,
}

/// Release asset for an OS and architecture (`std::env::consts` naming)
pub fn release_asset(os: &str, arch: &str) -> Option<(&'static str, AssetFormat)> {
    let asset = match (os, arch) {
        ("linux", "x86_64") => ("cloudflared-linux-amd64", AssetFormat::Binary),
        ("linux", "aarch64") => ("cloudflared-linux-arm64", AssetFormat::Binary),
        ("linux", "arm") => ("cloudflared-linux-arm", AssetFormat::Binary),
        ("linux", "x86") => ("cloudflared-linux-386", AssetFormat::Binary),
        ("windows", "x86_64") => ("cloudflared-windows-amd64.exe", AssetFormat::Binary),
        ("windows", "x86") => ("cloudflared-windows-386.exe", AssetFormat::Binary),
        ("macos", "x86_64") => ("cloudflared-darwin-amd64.tgz", AssetFormat::Tgz),
        ("macos", "aarch64") => ("cloudflared-darwin-arm64.tgz", AssetFormat::Tgz),
        _ => return None,
    };
    Some(asset)
}

pub fn release_url(version: &str, asset: &str) -> String {
    format!("{}/{}/{}", RELEASE_BASE_URL, version, asset)
}

fn binary_file_name(os: &str) -> String {
    if os == "windows" {
        format!("{}.exe", BINARY_NAME)
    } else {
        BINARY_NAME.to_string()
    }
}

pub struct BinaryInstaller {
    cache_dir: PathBuf,
    version: String,
    /// Use this binary instead of downloading one
    override_path: Option<PathBuf>,
    http: reqwest::Client,
}

impl BinaryInstaller {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            cache_dir: cache_dir.into(),
            version: TUNNEL_VERSION.to_string(),
            override_path: None,
            http: reqwest::Client::builder().build()?,
        })
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_override(mut self, path: Option<PathBuf>) -> Self {
        self.override_path = path;
        self
    }

    pub fn version_dir(&self) -> PathBuf {
        self.cache_dir.join(&self.version)
    }

    pub fn binary_path(&self) -> PathBuf {
        self.version_dir()
            .join(binary_file_name(std::env::consts::OS))
    }

    /// Path of a runnable binary, downloading it on first use
    pub async fn ensure_installed(&self) -> Result<PathBuf> {
        if let Some(path) = &self.override_path {
            return Ok(path.clone());
        }

        let binary = self.binary_path();
        if tokio::fs::metadata(&binary).await.is_ok() {
            debug!("Tunnel binary present at {}", binary.display());
            return Ok(binary);
        }

        let os = std::env::consts::OS;
        let arch = std::env::consts::ARCH;
        let (asset, format) = release_asset(os, arch).ok_or_else(|| {
            ReachError::TunnelProcess(format!("no tunnel binary for {}/{}", os, arch))
        })?;

        let url = release_url(&self.version, asset);
        info!("Downloading tunnel binary {}", url);
        let bytes = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ReachError::TunnelProcess(format!("download failed: {}", e)))?
            .bytes()
            .await
            .map_err(|e| ReachError::TunnelProcess(format!("download failed: {}", e)))?;

        let contents = match format {
            AssetFormat::Binary => bytes.to_vec(),
            AssetFormat::Tgz => extract_from_tgz(&bytes, BINARY_NAME)?,
        };

        tokio::fs::create_dir_all(self.version_dir()).await?;
        let partial = binary.with_extension("partial");
        tokio::fs::write(&partial, &contents).await?;
        make_executable(&partial).await?;
        tokio::fs::rename(&partial, &binary).await?;
        info!("Installed tunnel binary {} at {}", self.version, binary.display());

        if let Err(e) = purge_other_versions(&self.cache_dir, &self.version) {
            warn!("Could not purge old tunnel binaries: {}", e);
        }
        Ok(binary)
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Remove cached versions other than `keep`. Returns how many were removed.
pub fn purge_other_versions(cache_dir: &Path, keep: &str) -> Result<usize> {
    let mut removed = 0;
    let entries = match std::fs::read_dir(cache_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        if entry.file_name() == keep || !entry.file_type()?.is_dir() {
            continue;
        }
        std::fs::remove_dir_all(entry.path())?;
        info!("Removed old tunnel binary {}", entry.path().display());
        removed += 1;
    }
    Ok(removed)
}

/// Pull one regular file out of a .tgz by its base name
pub fn extract_from_tgz(archive: &[u8], name: &str) -> Result<Vec<u8>> {
    let mut tar = Vec::new();
    GzDecoder::new(archive)
        .read_to_end(&mut tar)
        .map_err(|e| ReachError::TunnelProcess(format!("bad tunnel archive: {}", e)))?;

    const BLOCK: usize = 512;
    let mut offset = 0;
    while offset + BLOCK <= tar.len() {
        let header = &tar[offset..offset + BLOCK];
        if header.iter().all(|b| *b == 0) {
            break;
        }

        let entry_name = String::from_utf8_lossy(until_nul(&header[0..100])).to_string();
        let size = parse_octal(&header[124..136]).ok_or_else(|| {
            ReachError::TunnelProcess("bad tunnel archive: invalid entry size".to_string())
        })?;
        let type_flag = header[156];
        let data_start = offset + BLOCK;
        let data_end = data_start + size;
        if data_end > tar.len() {
            break;
        }

        let base_name = entry_name.rsplit('/').next().unwrap_or(&entry_name);
        if (type_flag == b'0' || type_flag == 0) && base_name == name {
            return Ok(tar[data_start..data_end].to_vec());
        }

        offset = data_start + size.div_ceil(BLOCK) * BLOCK;
    }

    Err(ReachError::TunnelProcess(format!(
        "tunnel archive does not contain {}",
        name
    )))
}

fn until_nul(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

fn parse_octal(field: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(until_nul(field)).ok()?.trim();
    if text.is_empty() {
        return Some(0);
    }
    usize::from_str_radix(text, 8).ok()
}
