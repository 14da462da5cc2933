//! Branch-addressable deployment content.

use std::future::Future;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

use crate::error::Error;

/// Extracted content for one job. The scratch directory is removed on drop.
#[derive(Debug)]
pub struct FetchedContent {
    _dir: TempDir,
    root: PathBuf,
}

impl FetchedContent {
    /// Wraps an already extracted tree; `root` must lie inside `dir`.
    #[must_use]
    pub fn new(dir: TempDir, root: PathBuf) -> Self {
        Self { _dir: dir, root }
    }

    /// The single top-level content directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Where deployment content comes from.
pub trait ContentSource: Send + Sync + 'static {
    /// Fetch and unpack the content for `branch`.
    ///
    /// Failures are [`Error::ContentNotFound`] (or [`Error::Http`]/[`Error::Io`]
    /// for transport problems).
    fn fetch(&self, branch: &str) -> impl Future<Output = Result<FetchedContent, Error>> + Send;
}

/// Archive downloads get a longer overall timeout than token calls.
fn archive_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(180))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Downloads a zip archive per branch and unpacks it into a scratch directory.
#[derive(Debug, Clone)]
pub struct ArchiveSource {
    http: reqwest::Client,
    url_template: String,
    dir_prefix: String,
}

impl ArchiveSource {
    pub const DEFAULT_URL_TEMPLATE: &'static str =
        "https://github.com/SalesforceLabs/LSStarterConfig/archive/refs/heads/{branch}.zip";
    pub const DEFAULT_DIR_PREFIX: &'static str = "LSStarterConfig-";

    /// `url_template` must contain `{branch}`.
    #[must_use]
    pub fn new(url_template: impl Into<String>, dir_prefix: impl Into<String>) -> Self {
        Self {
            http: archive_http_client(),
            url_template: url_template.into(),
            dir_prefix: dir_prefix.into(),
        }
    }

    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    fn archive_url(&self, branch: &str) -> String {
        self.url_template.replace("{branch}", branch)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, Error> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::ContentNotFound(format!(
                "HTTP {} from {url}",
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

impl Default for ArchiveSource {
    fn default() -> Self {
        Self::new(Self::DEFAULT_URL_TEMPLATE, Self::DEFAULT_DIR_PREFIX)
    }
}

impl ContentSource for ArchiveSource {
    async fn fetch(&self, branch: &str) -> Result<FetchedContent, Error> {
        let url = self.archive_url(branch);
        tracing::debug!(%url, "Downloading content archive");
        let data = self.download(&url).await?;

        let dir = tempfile::Builder::new().prefix("orgdeploy-").tempdir()?;
        let dest = dir.path().to_path_buf();
        let prefix = self.dir_prefix.clone();

        let root = tokio::task::spawn_blocking(move || {
            extract_archive(&data, &dest)?;
            locate_root(&dest, &prefix)
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        Ok(FetchedContent::new(dir, root))
    }
}

/// Extract a zip archive into `dest`, skipping entries that would escape it.
///
/// # Errors
///
/// Returns [`Error::ContentNotFound`] if `data` is not a zip archive and
/// [`Error::Io`] if writing fails.
pub fn extract_archive(data: &[u8], dest: &Path) -> Result<(), Error> {
    std::fs::create_dir_all(dest)?;

    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(data))
        .map_err(|e| Error::ContentNotFound(format!("archive is not a zip file: {e}")))?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| Error::ContentNotFound(format!("unreadable archive entry {i}: {e}")))?;

        let Some(relative) = file.enclosed_name() else {
            tracing::warn!(entry = file.name(), "Skipping archive entry outside destination");
            continue;
        };
        let outpath = dest.join(relative);

        if file.is_dir() {
            std::fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;
        std::fs::write(&outpath, &buffer)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = file.unix_mode() {
                std::fs::set_permissions(&outpath, std::fs::Permissions::from_mode((mode & 0o777) | 0o600))?;
            }
        }
    }
    Ok(())
}

/// Finds the one top-level directory of `dir` named `<prefix>…`.
///
/// # Errors
///
/// Returns [`Error::ContentNotFound`] when there is no match or more than one.
pub fn locate_root(dir: &Path, prefix: &str) -> Result<PathBuf, Error> {
    let mut matches = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() && entry.file_name().to_string_lossy().starts_with(prefix) {
            matches.push(entry.path());
        }
    }
    match matches.len() {
        1 => Ok(matches.remove(0)),
        0 => Err(Error::ContentNotFound(format!(
            "no extracted directory starting with '{prefix}'"
        ))),
        n => Err(Error::ContentNotFound(format!(
            "{n} extracted directories start with '{prefix}', expected one"
        ))),
    }
}
