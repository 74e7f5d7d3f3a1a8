//! The artifact exchange.
//!
//! Training plans, parameter sets and training results are moved between the researcher and the
//! nodes as files: the sender uploads a file and passes the returned handle inside a message, the
//! receiver downloads the file behind the handle.

use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use displaydoc::Display;
use thiserror::Error;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

/// The status of a successful download.
pub const STATUS_OK: u16 = 200;
/// The status of a download whose handle doesn't resolve.
pub const STATUS_NOT_FOUND: u16 = 404;

/// Errors of the artifact exchange.
#[derive(Debug, Display, Error)]
pub enum ExchangeError {
    /// The file {0:?} does not exist.
    NotFound(PathBuf),
    /// Access to {0:?} was denied.
    PermissionDenied(PathBuf),
    /// Transfer failed: {0}.
    Transport(String),
}

impl ExchangeError {
    fn from_io(err: io::Error, path: &Path) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_path_buf()),
            _ => Self::Transport(err.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UploadResponse {
    /// The handle to pass to [`ArtifactExchange::download`].
    pub handle: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DownloadResponse {
    /// An HTTP like status, [`STATUS_OK`] on success.
    pub status: u16,
    /// Where the file was downloaded to.
    pub path: PathBuf,
}

impl DownloadResponse {
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// A service to upload and download files.
#[async_trait]
pub trait ArtifactExchange: Send + Sync {
    /// Uploads a file.
    ///
    /// # Errors
    /// Fails if the file is missing or unreadable, or if the transfer fails.
    async fn upload(&self, path: &Path) -> Result<UploadResponse, ExchangeError>;

    /// Downloads the file behind `handle` into a file named `dest_name`.
    ///
    /// A handle that doesn't resolve is not an error: it's reported through the status.
    ///
    /// # Errors
    /// Fails if the transfer fails.
    async fn download(
        &self,
        handle: &str,
        dest_name: &str,
    ) -> Result<DownloadResponse, ExchangeError>;
}

const FS_SCHEME: &str = "fs://";

/// An artifact exchange backed by a shared directory.
///
/// Uploads are copied into the store directory, downloads are copied from there into the
/// download directory.
#[derive(Clone, Debug)]
pub struct FsExchange {
    store: PathBuf,
    download_dir: PathBuf,
}

impl FsExchange {
    pub fn new(store: impl Into<PathBuf>, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: store.into(),
            download_dir: download_dir.into(),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    fn resolve(&self, handle: &str) -> Option<PathBuf> {
        let name = handle.strip_prefix(FS_SCHEME)?;
        // handles never name anything outside of the store
        if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." {
            return None;
        }
        Some(self.store.join(name))
    }
}

#[async_trait]
impl ArtifactExchange for FsExchange {
    async fn upload(&self, path: &Path) -> Result<UploadResponse, ExchangeError> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| ExchangeError::NotFound(path.to_path_buf()))?;
        fs::create_dir_all(&self.store)
            .await
            .map_err(|err| ExchangeError::from_io(err, &self.store))?;
        let name = format!("{}-{}", Uuid::new_v4().to_simple(), file_name);
        fs::copy(path, self.store.join(&name))
            .await
            .map_err(|err| ExchangeError::from_io(err, path))?;
        debug!("uploaded {:?} as {}", path, name);
        Ok(UploadResponse {
            handle: format!("{}{}", FS_SCHEME, name),
        })
    }

    async fn download(
        &self,
        handle: &str,
        dest_name: &str,
    ) -> Result<DownloadResponse, ExchangeError> {
        let dest = self.download_dir.join(dest_name);
        let source = match self.resolve(handle) {
            Some(source) if fs::metadata(&source).await.is_ok() => source,
            _ => {
                debug!("no artifact behind {}", handle);
                return Ok(DownloadResponse {
                    status: STATUS_NOT_FOUND,
                    path: dest,
                });
            }
        };
        fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|err| ExchangeError::from_io(err, &self.download_dir))?;
        fs::copy(&source, &dest)
            .await
            .map_err(|err| ExchangeError::from_io(err, &source))?;
        Ok(DownloadResponse {
            status: STATUS_OK,
            path: dest,
        })
    }
}
