//! Scheduled GeoLite2 City database refresh.
//!
//! Downloads into a staging file next to the live database, sanity-checks the
//! download, and only then renames it into place. The live file is never
//! touched by a failed refresh.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use agegate_core::{GeoLookup, MaxMindGeoLookup};
use async_trait::async_trait;
use eyre::{bail, eyre, WrapErr};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::http::Request;

/// Community mirror of the free GeoLite2 City database.
pub const DEFAULT_DATABASE_URL: &str =
    "https://github.com/P3TERX/GeoLite.mmdb/raw/download/GeoLite2-City.mmdb";

/// A real City database is far larger than this; anything smaller is an error page.
pub const DEFAULT_MIN_SIZE: u64 = 30 * 1024 * 1024;

/// Upstream publishes at least weekly.
pub const DEFAULT_MAX_UNCHANGED: Duration = Duration::from_secs(10 * 24 * 60 * 60);

/// Where to download from and where the files live.
#[derive(Debug, Clone)]
pub struct RefreshPlan {
    pub url: String,
    pub database: PathBuf,
    pub staging: PathBuf,
    pub metadata: PathBuf,
    pub min_size: u64,
    pub max_unchanged: Duration,
    pub health_check_url: Option<String>,
}

impl RefreshPlan {
    /// Plan for refreshing `database` from `url`, with staging and metadata
    /// files alongside it.
    pub fn new(database: &Path, url: impl Into<String>) -> Self {
        let mut staging = database.as_os_str().to_owned();
        staging.push(".staging");
        let mut metadata = database.as_os_str().to_owned();
        metadata.push(".json");
        Self {
            url: url.into(),
            database: database.to_path_buf(),
            staging: PathBuf::from(staging),
            metadata: PathBuf::from(metadata),
            min_size: DEFAULT_MIN_SIZE,
            max_unchanged: DEFAULT_MAX_UNCHANGED,
            health_check_url: None,
        }
    }
}

/// Contents of the metadata file written after each install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshMetadata {
    /// Hex SHA-256 of the installed database.
    pub digest: String,
    /// Unix seconds when this digest was installed.
    pub time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new database was moved into place.
    Installed,
    /// Upstream still serves the installed database.
    Unchanged,
}

/// Sanity check run against a downloaded database before it goes live.
#[async_trait]
pub trait DatabaseProbe: Send + Sync {
    async fn check(&self, path: &Path) -> eyre::Result<()>;
}

/// Looks up a known address and requires the expected subdivision.
pub struct MaxMindProbe {
    ip: IpAddr,
    expected_subdivision: String,
}

impl Default for MaxMindProbe {
    fn default() -> Self {
        // University of Minnesota.
        Self {
            ip: IpAddr::from([128, 101, 101, 101]),
            expected_subdivision: "MN".to_string(),
        }
    }
}

#[async_trait]
impl DatabaseProbe for MaxMindProbe {
    async fn check(&self, path: &Path) -> eyre::Result<()> {
        let lookup = MaxMindGeoLookup::open(path)?;
        let record = lookup.locate(self.ip).await?;
        match record.subdivision_iso.as_deref() {
            Some(sub) if sub == self.expected_subdivision => Ok(()),
            other => Err(eyre!(
                "probe {} resolved to {other:?}, expected {}",
                self.ip,
                self.expected_subdivision
            )),
        }
    }
}

/// Runs the refresh and reports the result to the health-check URL, if any.
pub async fn run(
    plan: &RefreshPlan,
    http: &Request,
    probe: &dyn DatabaseProbe,
    now: u64,
) -> eyre::Result<RefreshOutcome> {
    let result = refresh(plan, http, probe, now).await;
    if let Some(url) = &plan.health_check_url {
        let ping = match &result {
            Ok(_) => url.clone(),
            Err(_) => format!("{}/fail", url.trim_end_matches('/')),
        };
        if let Err(err) = http.get(&ping).await {
            tracing::warn!("health check ping failed: {err:#}");
        }
    }
    result
}

async fn refresh(
    plan: &RefreshPlan,
    http: &Request,
    probe: &dyn DatabaseProbe,
    now: u64,
) -> eyre::Result<RefreshOutcome> {
    let (size, digest) = match download(plan, http).await {
        Ok(downloaded) => downloaded,
        Err(err) => {
            discard_staging(plan).await;
            return Err(err);
        }
    };
    tracing::info!(size, %digest, "downloaded {}", plan.url);

    if let Err(err) = verify_download(plan, probe, size).await {
        discard_staging(plan).await;
        return Err(err);
    }

    if let Some(previous) = read_metadata(&plan.metadata).await {
        if previous.digest == digest {
            discard_staging(plan).await;
            let age = now.saturating_sub(previous.time);
            if age > plan.max_unchanged.as_secs() {
                bail!(
                    "database unchanged for {} days, upstream may be stale",
                    age / 86_400
                );
            }
            tracing::info!("database unchanged since {}", previous.time);
            return Ok(RefreshOutcome::Unchanged);
        }
    }

    tokio::fs::rename(&plan.staging, &plan.database)
        .await
        .wrap_err_with(|| format!("installing {}", plan.database.display()))?;
    let metadata = serde_json::to_vec(&RefreshMetadata { digest, time: now })?;
    tokio::fs::write(&plan.metadata, metadata)
        .await
        .wrap_err_with(|| format!("writing {}", plan.metadata.display()))?;
    tracing::info!("installed {}", plan.database.display());
    Ok(RefreshOutcome::Installed)
}

/// Streams the download into the staging file, hashing as it goes.
async fn download(plan: &RefreshPlan, http: &Request) -> eyre::Result<(u64, String)> {
    let mut response = http.get(&plan.url).await?;
    let mut file = tokio::fs::File::create(&plan.staging)
        .await
        .wrap_err_with(|| format!("creating {}", plan.staging.display()))?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    while let Some(chunk) = response.chunk().await.wrap_err("reading download")? {
        hasher.update(&chunk);
        size += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok((size, hex::encode(hasher.finalize())))
}

async fn verify_download(
    plan: &RefreshPlan,
    probe: &dyn DatabaseProbe,
    size: u64,
) -> eyre::Result<()> {
    if size < plan.min_size {
        bail!(
            "download is {size} bytes, expected at least {}",
            plan.min_size
        );
    }
    probe
        .check(&plan.staging)
        .await
        .wrap_err("downloaded database failed the probe lookup")
}

async fn read_metadata(path: &Path) -> Option<RefreshMetadata> {
    let raw = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&raw) {
        Ok(metadata) => Some(metadata),
        Err(err) => {
            tracing::warn!("ignoring unreadable {}: {err}", path.display());
            None
        }
    }
}

async fn discard_staging(plan: &RefreshPlan) {
    match tokio::fs::remove_file(&plan.staging).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!("could not remove {}: {err}", plan.staging.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server, ServerGuard};

    const NOW: u64 = 1_700_000_000;
    const BODY: &[u8] = b"pretend this is a GeoLite2 City database";

    struct FixedProbe(bool);

    #[async_trait]
    impl DatabaseProbe for FixedProbe {
        async fn check(&self, _path: &Path) -> eyre::Result<()> {
            if self.0 {
                Ok(())
            } else {
                Err(eyre!("probe resolved to None"))
            }
        }
    }

    fn http() -> Request {
        Request::new(Duration::from_secs(5))
            .allow_http(true)
            .max_retries(0)
    }

    fn plan(server: &ServerGuard, dir: &Path) -> RefreshPlan {
        let mut plan = RefreshPlan::new(
            &dir.join("GeoLite2-City.mmdb"),
            format!("{}/GeoLite2-City.mmdb", server.url()),
        );
        plan.min_size = 16;
        plan
    }

    fn digest(body: &[u8]) -> String {
        hex::encode(Sha256::digest(body))
    }

    #[test]
    fn test_plan_paths_sit_next_to_database() {
        let plan = RefreshPlan::new(Path::new("/var/geo/GeoLite2-City.mmdb"), DEFAULT_DATABASE_URL);
        assert_eq!(plan.staging, Path::new("/var/geo/GeoLite2-City.mmdb.staging"));
        assert_eq!(plan.metadata, Path::new("/var/geo/GeoLite2-City.mmdb.json"));
        assert_eq!(plan.min_size, 30 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_new_database_is_installed() {
        let mut server = Server::new_async().await;
        let download = server
            .mock("GET", "/GeoLite2-City.mmdb")
            .with_status(200)
            .with_body(BODY)
            .create_async()
            .await;
        let ping = server.mock("GET", "/ping").create_async().await;

        let dir = tempfile::tempdir().unwrap();
        let mut plan = plan(&server, dir.path());
        plan.health_check_url = Some(format!("{}/ping", server.url()));

        let outcome = run(&plan, &http(), &FixedProbe(true), NOW).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Installed);
        assert_eq!(std::fs::read(&plan.database).unwrap(), BODY);
        assert!(!plan.staging.exists());

        let metadata: RefreshMetadata =
            serde_json::from_slice(&std::fs::read(&plan.metadata).unwrap()).unwrap();
        assert_eq!(
            metadata,
            RefreshMetadata {
                digest: digest(BODY),
                time: NOW
            }
        );
        download.assert_async().await;
        ping.assert_async().await;
    }

    #[tokio::test]
    async fn test_small_download_is_rejected() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/GeoLite2-City.mmdb")
            .with_status(200)
            .with_body("<html>rate limited</html>")
            .create_async()
            .await;
        let fail = server.mock("GET", "/ping/fail").create_async().await;

        let dir = tempfile::tempdir().unwrap();
        let mut plan = plan(&server, dir.path());
        plan.min_size = 1024;
        plan.health_check_url = Some(format!("{}/ping", server.url()));
        std::fs::write(&plan.database, b"live database").unwrap();

        let err = run(&plan, &http(), &FixedProbe(true), NOW).await.unwrap_err();
        assert!(err.to_string().contains("expected at least 1024"));
        assert_eq!(std::fs::read(&plan.database).unwrap(), b"live database");
        assert!(!plan.staging.exists());
        fail.assert_async().await;
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_staging_file() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/GeoLite2-City.mmdb")
            .with_status(500)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let plan = plan(&server, dir.path());
        std::fs::write(&plan.staging, b"half of a database").unwrap();
        std::fs::write(&plan.database, b"live database").unwrap();

        assert!(run(&plan, &http(), &FixedProbe(true), NOW).await.is_err());
        assert!(!plan.staging.exists());
        assert_eq!(std::fs::read(&plan.database).unwrap(), b"live database");
    }

    #[tokio::test]
    async fn test_failed_probe_keeps_live_database() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/GeoLite2-City.mmdb")
            .with_body(BODY)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let plan = plan(&server, dir.path());
        std::fs::write(&plan.database, b"live database").unwrap();

        assert!(run(&plan, &http(), &FixedProbe(false), NOW).await.is_err());
        assert_eq!(std::fs::read(&plan.database).unwrap(), b"live database");
        assert!(!plan.metadata.exists());
    }

    #[tokio::test]
    async fn test_unchanged_database_within_window() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/GeoLite2-City.mmdb")
            .with_body(BODY)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let plan = plan(&server, dir.path());
        let installed_at = NOW - 3 * 86_400;
        std::fs::write(
            &plan.metadata,
            serde_json::to_vec(&RefreshMetadata {
                digest: digest(BODY),
                time: installed_at,
            })
            .unwrap(),
        )
        .unwrap();

        let outcome = run(&plan, &http(), &FixedProbe(true), NOW).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Unchanged);
        assert!(!plan.staging.exists());
        assert!(!plan.database.exists());

        // The install time is not bumped while the digest stays the same.
        let metadata: RefreshMetadata =
            serde_json::from_slice(&std::fs::read(&plan.metadata).unwrap()).unwrap();
        assert_eq!(metadata.time, installed_at);
    }

    #[tokio::test]
    async fn test_stale_database_is_an_error() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/GeoLite2-City.mmdb")
            .with_body(BODY)
            .create_async()
            .await;
        let fail = server
            .mock("GET", Matcher::Regex("^/ping/fail$".to_string()))
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut plan = plan(&server, dir.path());
        plan.health_check_url = Some(format!("{}/ping/", server.url()));
        std::fs::write(
            &plan.metadata,
            serde_json::to_vec(&RefreshMetadata {
                digest: digest(BODY),
                time: NOW - 11 * 86_400,
            })
            .unwrap(),
        )
        .unwrap();

        let err = run(&plan, &http(), &FixedProbe(true), NOW).await.unwrap_err();
        assert!(err.to_string().contains("unchanged for 11 days"));
        fail.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_database_fails_probe() {
        let dir = tempfile::tempdir().unwrap();
        let result = MaxMindProbe::default()
            .check(&dir.path().join("GeoLite2-City.mmdb"))
            .await;
        assert!(result.is_err());
    }
}
