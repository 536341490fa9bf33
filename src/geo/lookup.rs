use crate::cache::GeoCache;
use crate::geo::{DatabaseOpener, GeoDatabase, GeoRecord, MmdbOpener, QueryOutcome};
use crate::public_ip::parse_public_ip;

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const CACHE_NAMESPACE: &str = "local-geoip";

/// Tag under which lookup entries are stored when the cache supports tags,
/// so all geo entries can be invalidated without a full cache flush.
pub const CACHE_TAG: &str = "local-geoip";

const SECONDS_PER_DAY: u64 = 86400;

/// The lookup contract consumed by callers. Inject a value implementing this
/// instead of reaching for a global.
pub trait GeoIpLookup: Send + Sync {
    fn lookup(&self, ip_address: &str) -> Option<GeoRecord>;
}

pub struct LookupSettings {
    pub database_path: PathBuf,
    pub cache_ttl: Duration,
    /// Warn once when the database file is older than this many days;
    /// zero or negative disables the check.
    pub database_max_age_days: i64,
}

struct OpenDatabase {
    path: PathBuf,
    database: Box<dyn GeoDatabase>,
}

/// MMDB-backed lookup with cache-aside semantics.
///
/// Never surfaces an error to the caller: a missing, stale, corrupt or
/// incomplete database resolves to `None`, with operational warnings logged
/// where the degradation is unexpected.
pub struct MmdbGeoIpLookup {
    settings: LookupSettings,
    cache: Arc<dyn GeoCache>,
    opener: Box<dyn DatabaseOpener>,
    open_database: RwLock<Option<OpenDatabase>>,
    stale_warning_emitted: AtomicBool,
}

impl MmdbGeoIpLookup {
    pub fn new(settings: LookupSettings, cache: Arc<dyn GeoCache>) -> Self {
        Self::with_opener(settings, cache, Box::new(MmdbOpener))
    }

    pub fn with_opener(
        settings: LookupSettings,
        cache: Arc<dyn GeoCache>,
        opener: Box<dyn DatabaseOpener>,
    ) -> Self {
        Self {
            settings,
            cache,
            opener,
            open_database: RwLock::new(None),
            stale_warning_emitted: AtomicBool::new(false),
        }
    }

    /// Drop any open reader handle, releasing its resources.
    pub fn close(&self) {
        let mut guard = self.open_database.write().unwrap();
        *guard = None;
    }

    fn warn_if_stale(&self, path: &Path) {
        if self.settings.database_max_age_days <= 0 {
            return;
        }
        if self.stale_warning_emitted.load(Ordering::Relaxed) {
            return;
        }
        let modified = match std::fs::metadata(path).and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(_) => return,
        };
        if !is_stale(
            modified,
            SystemTime::now(),
            self.settings.database_max_age_days,
        ) {
            return;
        }
        if self.stale_warning_emitted.swap(true, Ordering::Relaxed) {
            return;
        }
        let modified_epoch = modified
            .duration_since(UNIX_EPOCH)
            .map(|age| age.as_secs())
            .unwrap_or(0);
        log::warn!(
            "GeoIP database appears stale: path={} max_age_days={} last_modified_epoch={}",
            path.display(),
            self.settings.database_max_age_days,
            modified_epoch,
        );
    }

    /// Run `f` against the open handle for `path`, opening one if needed.
    ///
    /// The handle is reused while its path matches; otherwise the previous
    /// handle is closed and a new one is opened under the write lock, so
    /// concurrent lookups never observe a half-replaced handle.
    fn with_database<R>(&self, path: &Path, f: impl FnOnce(&dyn GeoDatabase) -> R) -> Option<R> {
        {
            let guard = self.open_database.read().unwrap();
            if let Some(open) = guard.as_ref() {
                if open.path == path {
                    return Some(f(open.database.as_ref()));
                }
            }
        }
        let mut guard = self.open_database.write().unwrap();
        let path_matches = guard.as_ref().map_or(false, |open| open.path == path);
        if !path_matches {
            *guard = None;
            match self.opener.open(path) {
                Ok(database) => {
                    *guard = Some(OpenDatabase {
                        path: path.to_owned(),
                        database,
                    });
                }
                Err(error) => {
                    log::warn!(
                        "Unable to open GeoIP database: path={} error={}",
                        path.display(),
                        error,
                    );
                    return None;
                }
            }
        }
        guard.as_ref().map(|open| f(open.database.as_ref()))
    }

    fn read_from_database(&self, path: &Path, address: IpAddr) -> Option<GeoRecord> {
        self.with_database(path, |database| {
            let outcome = match database.query_city(address) {
                QueryOutcome::Unsupported => database.query_country(address),
                outcome => outcome,
            };
            match outcome {
                QueryOutcome::Found(record) => Some(record),
                QueryOutcome::NotFound | QueryOutcome::Unsupported => None,
                QueryOutcome::Failed(detail) => {
                    log::warn!(
                        "GeoIP database read failed: path={} address={} error={}",
                        path.display(),
                        address,
                        detail,
                    );
                    None
                }
            }
        })
        .flatten()
    }
}

impl GeoIpLookup for MmdbGeoIpLookup {
    fn lookup(&self, ip_address: &str) -> Option<GeoRecord> {
        let address = parse_public_ip(ip_address)?;

        let path = self.settings.database_path.as_path();
        if path.as_os_str().is_empty() || !path.is_file() {
            // Missing database is expected degraded operation, not a fault.
            return None;
        }

        self.warn_if_stale(path);

        let key = format!("{CACHE_NAMESPACE}:lookup:{ip_address}");
        let ttl = self.settings.cache_ttl;
        let mut producer = || self.read_from_database(path, address);
        match self.cache.tagged() {
            Some(tagged) => tagged.remember_tagged(CACHE_TAG, &key, ttl, &mut producer),
            None => self.cache.remember(&key, ttl, &mut producer),
        }
    }
}

fn is_stale(modified: SystemTime, now: SystemTime, max_age_days: i64) -> bool {
    let max_age = Duration::from_secs(max_age_days as u64 * SECONDS_PER_DAY);
    now.duration_since(modified)
        .map(|age| age > max_age)
        .unwrap_or(false)
}
