//! GeoLite2 City database lookup.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use async_trait::async_trait;
use maxminddb::{geoip2, MaxMindDBError, Reader};

use crate::region::{GeoError, GeoLookup, GeoRecord};

struct LoadedDatabase {
    reader: Arc<Reader<Vec<u8>>>,
    modified: Option<SystemTime>,
}

/// [`GeoLookup`] over a local `.mmdb` file.
///
/// The file is reopened when its modification time changes, so a refreshed
/// database is picked up without restarting the process.
pub struct MaxMindGeoLookup {
    path: PathBuf,
    loaded: RwLock<Option<LoadedDatabase>>,
}

impl MaxMindGeoLookup {
    /// Opens the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`GeoError::Unavailable`] if the file cannot be read.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, GeoError> {
        let lookup = Self::new(path);
        lookup.reader()?;
        Ok(lookup)
    }

    /// Creates a lookup that opens `path` on first use.
    ///
    /// Until the file exists every lookup fails with [`GeoError::Unavailable`].
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            loaded: RwLock::new(None),
        }
    }

    fn modified(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok()
    }

    fn reader(&self) -> Result<Arc<Reader<Vec<u8>>>, GeoError> {
        let modified = self.modified();
        {
            let guard = self
                .loaded
                .read()
                .map_err(|_| GeoError::Unavailable("lock poisoned".to_string()))?;
            if let Some(loaded) = guard.as_ref() {
                if loaded.modified == modified {
                    return Ok(Arc::clone(&loaded.reader));
                }
            }
        }

        let reader = Reader::open_readfile(&self.path).map_err(|e| {
            GeoError::Unavailable(format!("{}: {e}", self.path.display()))
        })?;
        let reader = Arc::new(reader);
        log::info!("loaded geo database {}", self.path.display());

        let mut guard = self
            .loaded
            .write()
            .map_err(|_| GeoError::Unavailable("lock poisoned".to_string()))?;
        *guard = Some(LoadedDatabase {
            reader: Arc::clone(&reader),
            modified,
        });
        Ok(reader)
    }
}

/// Extracts the country and most specific subdivision from a City record.
fn to_record(city: &geoip2::City<'_>) -> GeoRecord {
    let country_iso = city
        .country
        .as_ref()
        .and_then(|country| country.iso_code)
        .map(ToString::to_string);
    let subdivision = city
        .subdivisions
        .as_ref()
        .and_then(|subdivisions| subdivisions.last());
    GeoRecord {
        country_iso,
        subdivision_iso: subdivision
            .and_then(|sub| sub.iso_code)
            .map(ToString::to_string),
        subdivision_name: subdivision
            .and_then(|sub| sub.names.as_ref())
            .and_then(|names| names.get("en"))
            .map(|name| (*name).to_string()),
    }
}

#[async_trait]
impl GeoLookup for MaxMindGeoLookup {
    async fn locate(&self, ip: IpAddr) -> Result<GeoRecord, GeoError> {
        let reader = self.reader()?;
        match reader.lookup::<geoip2::City<'_>>(ip) {
            Ok(city) => Ok(to_record(&city)),
            Err(MaxMindDBError::AddressNotFoundError(_)) => Err(GeoError::NotFound(ip)),
            Err(err) => Err(GeoError::Lookup(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_database_is_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = MaxMindGeoLookup::open(dir.path().join("GeoLite2-City.mmdb"));
        assert!(matches!(result, Err(GeoError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_lazy_lookup_fails_until_file_exists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lookup = MaxMindGeoLookup::new(dir.path().join("GeoLite2-City.mmdb"));
        let result = lookup.locate("128.101.101.101".parse().unwrap()).await;
        assert!(matches!(result, Err(GeoError::Unavailable(_))));
    }

    #[test]
    fn test_garbage_database_is_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("GeoLite2-City.mmdb");
        std::fs::write(&path, b"not a maxmind database").expect("write");
        assert!(matches!(
            MaxMindGeoLookup::open(&path),
            Err(GeoError::Unavailable(_))
        ));
    }
}
