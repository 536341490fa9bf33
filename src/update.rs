//! Download and atomic install of the local MMDB database.
//!
//! The pipeline runs as one sequential unit of work: download the provider
//! archive, verify it, decompress and extract it, locate the edition's
//! database file, validate it with a functional probe query, stage a copy
//! next to the target and atomically rename it into place. The scratch
//! directory is removed on every exit path. The rename is the only moment
//! the live database changes, so concurrent readers never observe a partial
//! file.
//!
//! Only one update should run at a time per target path. Concurrent runs are
//! not coordinated; their scratch state is independent and the final rename
//! still leaves the target as one complete version or another.

use crate::geo::{GeoDatabase, MmdbDatabase, QueryOutcome};
use crate::config::UpdateConfig;

use base64::Engine;
use hyper::body::HttpBody;
use hyper::client::connect::Connect;
use hyper::client::Client;
use hyper::{Body, Request, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use std::fs::{self, File};
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const MAX_REDIRECTS: usize = 10;
const MIN_ARCHIVE_BYTES: u64 = 1024;
const DATABASE_EXTENSION: &str = "mmdb";

/// Well-known public address used for the functional probe.
const PROBE_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));

/// Categorized failure reasons; every abort path maps to a distinct variant
/// so operators can branch on the category, not just a boolean.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("missing required update configuration values")]
    MissingConfig,
    #[error(r#"invalid download url "{url}": {source}"#)]
    InvalidUrl {
        url: String,
        source: hyper::http::uri::InvalidUri,
    },
    #[error("download unauthorized (HTTP 401); check the account id and license key and that the key has download access")]
    Unauthorized,
    #[error("download forbidden (HTTP 403); check the license entitlement for edition {0}")]
    Forbidden(String),
    #[error("download failed with HTTP {0}")]
    BadStatus(StatusCode),
    #[error("too many redirects while downloading")]
    TooManyRedirects,
    #[error("download request failed: {0}")]
    Request(#[from] hyper::Error),
    #[error(transparent)]
    Http(#[from] hyper::http::Error),
    #[error("download timed out after {0} seconds")]
    Timeout(u64),
    #[error("downloaded archive is missing or too small")]
    TruncatedArchive,
    #[error("failed to unpack downloaded archive: {0}")]
    Unpack(std::io::Error),
    #[error("could not find {0} in the extracted archive")]
    DatabaseNotFound(String),
    #[error("downloaded database failed validation: {0}")]
    CandidateValidation(String),
    #[error("staged database failed validation: {0}")]
    StagedValidation(String),
    #[error("failed to stage database copy: {0}")]
    StageCopy(std::io::Error),
    #[error("atomic replace failed: {0}")]
    Replace(std::io::Error),
    #[error("scratch directory error: {0}")]
    Scratch(std::io::Error),
}

/// The provider exposes two endpoint shapes; the configured URL form selects
/// which one is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DownloadStrategy {
    /// Per-edition template URL with an `{edition_id}` placeholder.
    EditionTemplate,
    /// Legacy endpoint taking the edition as an `edition_id` query parameter.
    LegacyQuery,
}

impl DownloadStrategy {
    fn for_url(template: &str) -> Self {
        if !template.contains("{edition_id}") && template.contains("app/geoip_download") {
            Self::LegacyQuery
        } else {
            Self::EditionTemplate
        }
    }
}

fn resolve_download_url(template: &str, edition_id: &str) -> String {
    let strategy = DownloadStrategy::for_url(template);
    let mut url = template.replace("{edition_id}", edition_id);
    url.push(if url.contains('?') { '&' } else { '?' });
    url.push_str("suffix=tar.gz");
    if strategy == DownloadStrategy::LegacyQuery {
        url.push_str("&edition_id=");
        url.push_str(edition_id);
    }
    url
}

pub struct UpdatePipeline {
    config: UpdateConfig,
    target_path: PathBuf,
}

impl UpdatePipeline {
    pub fn new(config: UpdateConfig, target_path: PathBuf) -> Self {
        Self {
            config,
            target_path,
        }
    }

    /// Run the pipeline to one of its terminal outcomes. On success the
    /// target path holds the new, validated database.
    pub async fn run(&self) -> Result<PathBuf, UpdateError> {
        self.validate_config()?;

        let scratch_parent = self
            .config
            .scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        fs::create_dir_all(&scratch_parent).map_err(UpdateError::Scratch)?;
        // Dropping the TempDir removes the whole scratch tree on every exit
        // path, success or abort.
        let scratch = tempfile::Builder::new()
            .prefix("mmdb-update-")
            .tempdir_in(&scratch_parent)
            .map_err(UpdateError::Scratch)?;

        let result = self.run_in(scratch.path()).await;
        if let Err(error) = scratch.close() {
            log::warn!("Failed to remove update scratch directory: {error}");
        }
        result
    }

    async fn run_in(&self, scratch: &Path) -> Result<PathBuf, UpdateError> {
        let url = resolve_download_url(&self.config.download_url, &self.config.edition_id);
        let archive_path = scratch.join("database.tar.gz");
        self.download(&url, &archive_path).await?;
        verify_archive_size(&archive_path)?;

        let extract_dir = scratch.join("extract");
        unpack_archive(&archive_path, scratch, &extract_dir)?;

        let wanted = format!("{}.{DATABASE_EXTENSION}", self.config.edition_id);
        let candidate = find_database_file(&extract_dir, &wanted)
            .map_err(UpdateError::Unpack)?
            .ok_or(UpdateError::DatabaseNotFound(wanted))?;

        validate_database(&candidate).map_err(UpdateError::CandidateValidation)?;
        promote(&candidate, &self.target_path, validate_database)?;

        log::info!("MMDB updated successfully: {}", self.target_path.display());
        Ok(self.target_path.clone())
    }

    fn validate_config(&self) -> Result<(), UpdateError> {
        let blank = [
            &self.config.account_id,
            &self.config.license_key,
            &self.config.edition_id,
            &self.config.download_url,
        ]
        .iter()
        .any(|value| value.trim().is_empty());
        if blank || self.target_path.as_os_str().is_empty() {
            return Err(UpdateError::MissingConfig);
        }
        Ok(())
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), UpdateError> {
        let https = HttpsConnector::new();
        let client = Client::builder().build::<_, Body>(https);
        let timeout_secs = self.config.download_timeout_secs;
        tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.download_with(&client, url, dest),
        )
        .await
        .map_err(|_| UpdateError::Timeout(timeout_secs))?
    }

    async fn download_with<C>(
        &self,
        client: &Client<C>,
        url: &str,
        dest: &Path,
    ) -> Result<(), UpdateError>
    where
        C: Connect + Clone + Send + Sync + 'static,
    {
        let origin: Uri = url.parse().map_err(|source| UpdateError::InvalidUrl {
            url: url.to_owned(),
            source,
        })?;
        let auth_host = origin.host().unwrap_or_default().to_owned();
        let token = base64::engine::general_purpose::STANDARD.encode(format!(
            "{}:{}",
            self.config.account_id, self.config.license_key
        ));

        let mut uri = origin;
        let mut hops = 0;
        let response = loop {
            let mut builder = Request::builder().uri(&uri);
            // Redirect targets are presigned object-storage URLs that reject
            // an extra Authorization header; only the origin host gets it.
            if uri.host() == Some(auth_host.as_str()) {
                builder = builder.header(hyper::header::AUTHORIZATION, format!("Basic {token}"));
            }
            let request = builder.body(Body::empty())?;
            let response = client.request(request).await?;

            if response.status().is_success() {
                break response;
            }
            if response.status().is_redirection() {
                let status = response.status();
                uri = response
                    .headers()
                    .get(hyper::header::LOCATION)
                    .and_then(|location| Uri::try_from(location.as_bytes()).ok())
                    .ok_or(UpdateError::BadStatus(status))?;
                hops += 1;
                if hops == MAX_REDIRECTS {
                    return Err(UpdateError::TooManyRedirects);
                }
                continue;
            }
            return Err(status_error(response.status(), &self.config.edition_id));
        };

        // Archives can be large; stream the body to disk instead of
        // buffering it.
        let mut file = File::create(dest).map_err(UpdateError::Scratch)?;
        let mut body = response.into_body();
        while let Some(chunk) = body.data().await {
            file.write_all(&chunk?).map_err(UpdateError::Scratch)?;
        }
        Ok(())
    }
}

fn status_error(status: StatusCode, edition_id: &str) -> UpdateError {
    match status {
        StatusCode::UNAUTHORIZED => UpdateError::Unauthorized,
        StatusCode::FORBIDDEN => UpdateError::Forbidden(edition_id.to_owned()),
        status => UpdateError::BadStatus(status),
    }
}

fn verify_archive_size(archive: &Path) -> Result<(), UpdateError> {
    match fs::metadata(archive) {
        Ok(meta) if meta.len() >= MIN_ARCHIVE_BYTES => Ok(()),
        // Smaller implies a truncated download or an error-page body.
        _ => Err(UpdateError::TruncatedArchive),
    }
}

fn unpack_archive(archive: &Path, scratch: &Path, extract_dir: &Path) -> Result<(), UpdateError> {
    let tar_path = scratch.join("database.tar");
    {
        let gz_file = File::open(archive).map_err(UpdateError::Unpack)?;
        let mut decoder = flate2::read::GzDecoder::new(gz_file);
        let mut tar_file = File::create(&tar_path).map_err(UpdateError::Unpack)?;
        std::io::copy(&mut decoder, &mut tar_file).map_err(UpdateError::Unpack)?;
    }
    let tar_file = File::open(&tar_path).map_err(UpdateError::Unpack)?;
    let mut tar_archive = tar::Archive::new(tar_file);
    // `unpack` refuses entries whose paths would escape the destination.
    tar_archive.unpack(extract_dir).map_err(UpdateError::Unpack)?;
    Ok(())
}

fn find_database_file(dir: &Path, file_name: &str) -> std::io::Result<Option<PathBuf>> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            if let Some(found) = find_database_file(&path, file_name)? {
                return Ok(Some(found));
            }
        } else if path.file_name().map_or(false, |name| name == file_name) {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

/// Functional probe: the file must open as a database and answer the probe
/// query, where "address absent from this database" counts as a valid
/// answer.
fn validate_database(path: &Path) -> Result<(), String> {
    let database = MmdbDatabase::open(path).map_err(|error| error.to_string())?;
    let outcome = match database.query_city(PROBE_ADDRESS) {
        QueryOutcome::Unsupported => database.query_country(PROBE_ADDRESS),
        outcome => outcome,
    };
    match outcome {
        QueryOutcome::Found(_) | QueryOutcome::NotFound => Ok(()),
        QueryOutcome::Unsupported => {
            Err("edition answers neither city nor country queries".to_owned())
        }
        QueryOutcome::Failed(detail) => Err(detail),
    }
}

/// Stage a copy next to the target, re-validate the copy, then atomically
/// rename it onto the target path. Any failure removes the staged file and
/// leaves the pre-existing target untouched.
fn promote(
    candidate: &Path,
    target: &Path,
    validate: impl Fn(&Path) -> Result<(), String>,
) -> Result<(), UpdateError> {
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(UpdateError::StageCopy)?;
        }
    }
    let staged = staged_path(target);
    fs::copy(candidate, &staged).map_err(UpdateError::StageCopy)?;

    // Guards against corruption introduced by the copy itself.
    if let Err(detail) = validate(&staged) {
        let _ = fs::remove_file(&staged);
        return Err(UpdateError::StagedValidation(detail));
    }

    if let Err(error) = fs::rename(&staged, target) {
        let _ = fs::remove_file(&staged);
        return Err(UpdateError::Replace(error));
    }
    Ok(())
}

fn staged_path(target: &Path) -> PathBuf {
    let mut staged = target.as_os_str().to_owned();
    staged.push(".tmp");
    PathBuf::from(staged)
}
