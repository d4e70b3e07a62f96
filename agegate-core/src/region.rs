//! Region restriction: IP → location → "must this region verify?".
//!
//! Decisions are cached per IP for five minutes. Geo lookup failures fail open
//! and are never cached, so an outage cannot pin traffic into either state.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::cache::KeyedCache;
use crate::context::RequestContext;
use crate::error::{AgeGateError, AgeGateResult};
use crate::storage::CacheEntry;

/// How long a region decision is cached per IP.
pub const REGION_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Location of an IP as reported by the geo database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoRecord {
    /// ISO 3166-1 alpha-2 country code.
    pub country_iso: Option<String>,
    /// ISO 3166-2 code of the most specific subdivision (without country prefix).
    pub subdivision_iso: Option<String>,
    /// English name of the most specific subdivision.
    pub subdivision_name: Option<String>,
}

/// Errors from a geo lookup. All of them are treated as transient.
#[derive(Debug, Error)]
pub enum GeoError {
    /// The database file is missing or unreadable.
    #[error("geo database unavailable: {0}")]
    Unavailable(String),
    /// The address has no entry in the database.
    #[error("address not found: {0}")]
    NotFound(IpAddr),
    /// The lookup itself failed.
    #[error("geo lookup failed: {0}")]
    Lookup(String),
}

/// IP → country/subdivision resolver.
#[async_trait]
pub trait GeoLookup: Send + Sync {
    /// Locates `ip`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unavailable or has no entry.
    async fn locate(&self, ip: IpAddr) -> Result<GeoRecord, GeoError>;
}

/// Decides whether a country/subdivision requires age verification.
pub trait RestrictionPolicy: Send + Sync {
    /// Returns `true` if visitors from this location must verify.
    fn is_restricted(&self, country_iso: &str, subdivision_iso: Option<&str>) -> bool;
}

/// Restriction policy listing whole countries and individual subdivisions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockList {
    countries: HashSet<String>,
    subdivisions: HashMap<String, HashSet<String>>,
}

const RESTRICTIVE_US_STATES: [&str; 25] = [
    "AL", "AZ", "AR", "FL", "GA", "ID", "IN", "KS", "KY", "LA", "MS", "MO", "MT", "NE", "NC",
    "ND", "OH", "OK", "SC", "SD", "TN", "TX", "UT", "VA", "WY",
];

impl BlockList {
    /// US states with age verification laws in force.
    ///
    /// Legal coverage changes; deployments should confirm this list.
    #[must_use]
    pub fn us_states() -> Self {
        let mut list = Self::default();
        list.subdivisions.insert(
            "US".to_string(),
            RESTRICTIVE_US_STATES.iter().map(ToString::to_string).collect(),
        );
        list
    }

    /// Builds a list from `CC` (whole country) and `CC-SUB` codes.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for malformed codes.
    pub fn parse<S: AsRef<str>>(codes: &[S]) -> AgeGateResult<Self> {
        let mut list = Self::default();
        for code in codes {
            let code = code.as_ref().trim().to_ascii_uppercase();
            let (country, subdivision) = match code.split_once('-') {
                Some((country, subdivision)) => (country, Some(subdivision)),
                None => (code.as_str(), None),
            };
            let valid_country = country.len() == 2 && country.chars().all(|c| c.is_ascii_alphabetic());
            let valid_subdivision = match subdivision {
                Some(sub) => {
                    (1..=3).contains(&sub.len()) && sub.chars().all(|c| c.is_ascii_alphanumeric())
                }
                None => true,
            };
            if !valid_country || !valid_subdivision {
                return Err(AgeGateError::Configuration(format!(
                    "invalid region code {code:?}"
                )));
            }
            match subdivision {
                Some(sub) => {
                    list.subdivisions
                        .entry(country.to_string())
                        .or_default()
                        .insert(sub.to_string());
                }
                None => {
                    list.countries.insert(country.to_string());
                }
            }
        }
        Ok(list)
    }

    /// Returns `true` if the location is listed.
    #[must_use]
    pub fn contains(&self, country_iso: &str, subdivision_iso: Option<&str>) -> bool {
        if self.countries.contains(country_iso) {
            return true;
        }
        match (self.subdivisions.get(country_iso), subdivision_iso) {
            (Some(listed), Some(sub)) => listed.contains(sub),
            _ => false,
        }
    }
}

impl RestrictionPolicy for BlockList {
    fn is_restricted(&self, country_iso: &str, subdivision_iso: Option<&str>) -> bool {
        self.contains(country_iso, subdivision_iso)
    }
}

/// Outcome of a region resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionDecision {
    /// Visitors from this IP must verify.
    pub restricted: bool,
    /// Subdivision name to show a blocked visitor; empty otherwise.
    pub display_region_name: String,
}

impl RegionDecision {
    const fn unrestricted() -> Self {
        Self {
            restricted: false,
            display_region_name: String::new(),
        }
    }

    const fn restricted() -> Self {
        Self {
            restricted: true,
            display_region_name: String::new(),
        }
    }
}

/// Loopback and internal ranges are never restricted.
#[must_use]
pub fn is_internal_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_internal_address(IpAddr::V4(mapped));
            }
            // fc00::/7 unique local
            v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

/// Cached region restriction lookups.
pub struct RegionResolver {
    geo: Arc<dyn GeoLookup>,
    policy: Arc<dyn RestrictionPolicy>,
    cache: KeyedCache,
    globally_restricted: bool,
    ip_overrides: HashMap<String, bool>,
}

impl RegionResolver {
    /// Creates a resolver.
    #[must_use]
    pub fn new(
        geo: Arc<dyn GeoLookup>,
        policy: Arc<dyn RestrictionPolicy>,
        cache: KeyedCache,
        globally_restricted: bool,
        ip_overrides: HashMap<String, bool>,
    ) -> Self {
        Self {
            geo,
            policy,
            cache,
            globally_restricted,
            ip_overrides,
        }
    }

    /// Resolves whether `ctx`'s visitor IP is in a restricted region.
    ///
    /// When a geo lookup runs, the subdivision name (or `""` if not blocked)
    /// is stored on `ctx` for display.
    pub async fn resolve(&self, ctx: &mut RequestContext) -> RegionDecision {
        let ip = ctx.visitor.ip.clone();

        if self.globally_restricted {
            return RegionDecision::restricted();
        }

        match self.ip_overrides.get(&ip) {
            Some(true) => return RegionDecision::restricted(),
            Some(false) => return RegionDecision::unrestricted(),
            None => {}
        }

        let key = self.cache.ip_key(&ip);
        match self.cache.read(&key).await {
            Some(CacheEntry::Yes) => return RegionDecision::restricted(),
            Some(CacheEntry::No) => return RegionDecision::unrestricted(),
            // Not a region value; fall through and overwrite it.
            Some(CacheEntry::Missing) | None => {}
        }

        let addr: IpAddr = match ip.parse() {
            Ok(addr) => addr,
            Err(_) => {
                log::warn!("cannot parse visitor address {ip:?}, treating as unrestricted");
                return RegionDecision::unrestricted();
            }
        };

        if is_internal_address(addr) {
            self.cache.write(&key, CacheEntry::No, REGION_CACHE_TTL).await;
            return RegionDecision::unrestricted();
        }

        let record = match self.geo.locate(addr).await {
            Ok(record) => record,
            Err(err) => {
                // Transient: fail open, and leave the cache alone so the next
                // request retries the lookup.
                log::warn!("geo lookup for {addr} failed, failing open: {err}");
                return RegionDecision::unrestricted();
            }
        };

        let restricted = record.country_iso.as_deref().is_some_and(|country| {
            self.policy
                .is_restricted(country, record.subdivision_iso.as_deref())
        });

        let display_region_name = if restricted {
            record.subdivision_name.unwrap_or_default()
        } else {
            String::new()
        };
        ctx.store_region_for_display(display_region_name.clone());

        self.cache
            .write(&key, CacheEntry::from_bool(restricted), REGION_CACHE_TTL)
            .await;

        RegionDecision {
            restricted,
            display_region_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::VisitorContext;
    use crate::storage::{Cache, MemoryCache};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_case::test_case;

    #[derive(Default)]
    struct FakeGeo {
        records: HashMap<IpAddr, GeoRecord>,
        calls: AtomicUsize,
        broken: bool,
    }

    impl FakeGeo {
        fn with(mut self, ip: &str, country: &str, sub: Option<(&str, &str)>) -> Self {
            self.records.insert(
                ip.parse().unwrap(),
                GeoRecord {
                    country_iso: Some(country.to_string()),
                    subdivision_iso: sub.map(|(code, _)| code.to_string()),
                    subdivision_name: sub.map(|(_, name)| name.to_string()),
                },
            );
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GeoLookup for FakeGeo {
        async fn locate(&self, ip: IpAddr) -> Result<GeoRecord, GeoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.broken {
                return Err(GeoError::Unavailable("missing file".to_string()));
            }
            self.records.get(&ip).cloned().ok_or(GeoError::NotFound(ip))
        }
    }

    fn resolver(
        geo: Arc<FakeGeo>,
        cache: Arc<MemoryCache>,
        global: bool,
        overrides: HashMap<String, bool>,
    ) -> RegionResolver {
        RegionResolver::new(
            geo,
            Arc::new(BlockList::us_states()),
            KeyedCache::new(cache, "AV_", true),
            global,
            overrides,
        )
    }

    fn ctx(ip: &str) -> RequestContext {
        RequestContext::new(VisitorContext::guest(ip))
    }

    #[tokio::test]
    async fn test_blocked_state_is_cached() {
        let geo = Arc::new(FakeGeo::default().with("203.0.113.7", "US", Some(("TX", "Texas"))));
        let cache = Arc::new(MemoryCache::new());
        let resolver = resolver(geo.clone(), cache.clone(), false, HashMap::new());

        let mut first = ctx("203.0.113.7");
        let decision = resolver.resolve(&mut first).await;
        assert!(decision.restricted);
        assert_eq!(decision.display_region_name, "Texas");
        assert_eq!(first.display_region(), Some("Texas"));
        assert_eq!(
            cache.get("AV_IP_203.0.113.7").await.unwrap(),
            Some(CacheEntry::Yes)
        );

        let mut second = ctx("203.0.113.7");
        assert!(resolver.resolve(&mut second).await.restricted);
        assert_eq!(geo.calls(), 1);
    }

    #[tokio::test]
    async fn test_country_without_subdivision_is_not_restricted() {
        let geo = Arc::new(FakeGeo::default().with("8.8.8.8", "US", None));
        let cache = Arc::new(MemoryCache::new());
        let resolver = resolver(geo, cache.clone(), false, HashMap::new());

        let mut ctx = ctx("8.8.8.8");
        assert!(!resolver.resolve(&mut ctx).await.restricted);
        assert_eq!(ctx.display_region(), Some(""));
        assert_eq!(cache.get("AV_IP_8.8.8.8").await.unwrap(), Some(CacheEntry::No));
    }

    #[test_case("127.0.0.1" ; "loopback")]
    #[test_case("10.1.2.3" ; "ten slash eight")]
    #[test_case("192.168.1.20" ; "one nine two")]
    #[test_case("172.20.0.5" ; "one seven two")]
    #[test_case("::1" ; "v6 loopback")]
    #[test_case("fd00::1" ; "v6 unique local")]
    #[tokio::test]
    async fn test_internal_addresses_skip_lookup(ip: &str) {
        let geo = Arc::new(FakeGeo::default());
        let cache = Arc::new(MemoryCache::new());
        let resolver = resolver(geo.clone(), cache.clone(), false, HashMap::new());

        assert!(!resolver.resolve(&mut ctx(ip)).await.restricted);
        assert_eq!(geo.calls(), 0);
        assert_eq!(
            cache.get(&format!("AV_IP_{ip}")).await.unwrap(),
            Some(CacheEntry::No)
        );
    }

    #[tokio::test]
    async fn test_lookup_failure_fails_open_uncached() {
        let geo = Arc::new(FakeGeo {
            broken: true,
            ..FakeGeo::default()
        });
        let cache = Arc::new(MemoryCache::new());
        let resolver = resolver(geo.clone(), cache.clone(), false, HashMap::new());

        assert!(!resolver.resolve(&mut ctx("203.0.113.7")).await.restricted);
        assert!(!resolver.resolve(&mut ctx("203.0.113.7")).await.restricted);
        assert_eq!(geo.calls(), 2);
        assert!(cache.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_global_restriction_skips_everything() {
        let geo = Arc::new(FakeGeo::default());
        let cache = Arc::new(MemoryCache::new());
        let resolver = resolver(geo.clone(), cache.clone(), true, HashMap::new());

        assert!(resolver.resolve(&mut ctx("127.0.0.1")).await.restricted);
        assert_eq!(geo.calls(), 0);
        assert!(cache.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_overrides_bypass_cache_and_geo() {
        let geo = Arc::new(FakeGeo::default().with("203.0.113.7", "US", Some(("TX", "Texas"))));
        let cache = Arc::new(MemoryCache::new());
        let overrides = HashMap::from([
            ("203.0.113.7".to_string(), false),
            ("192.168.0.9".to_string(), true),
        ]);
        let resolver = resolver(geo.clone(), cache.clone(), false, overrides);

        assert!(!resolver.resolve(&mut ctx("203.0.113.7")).await.restricted);
        assert!(resolver.resolve(&mut ctx("192.168.0.9")).await.restricted);
        assert_eq!(geo.calls(), 0);
        assert!(cache.is_empty().unwrap());
    }

    #[test]
    fn test_block_list_parse() {
        let list = BlockList::parse(&["us-fl", "GB", "DE-BY"]).expect("parse");
        assert!(list.contains("US", Some("FL")));
        assert!(!list.contains("US", Some("CA")));
        assert!(list.contains("GB", None));
        assert!(list.contains("DE", Some("BY")));
        assert!(!list.contains("DE", None));

        assert!(BlockList::parse(&["USA-TX"]).is_err());
        assert!(BlockList::parse(&["US-"]).is_err());
    }

    #[test_case("US", Some("FL"), true)]
    #[test_case("US", Some("TX"), true)]
    #[test_case("US", Some("CA"), false)]
    #[test_case("US", None, false)]
    #[test_case("CA", Some("AL"), false)]
    fn test_us_state_policy(country: &str, sub: Option<&str>, expected: bool) {
        assert_eq!(BlockList::us_states().is_restricted(country, sub), expected);
    }
}
