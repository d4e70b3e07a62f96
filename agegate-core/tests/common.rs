#![allow(dead_code)]

//! Common test utilities shared across integration tests.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use agegate_core::providers::{GoCamInstance, GoCamRequest, GoCamSdk};
use agegate_core::storage::{Cache, MemoryCache, MemoryRecordStore, RecordStore};
use agegate_core::{
    AgeGate, AgeGateResult, Clock, Dependencies, GeoError, GeoLookup, GeoRecord, RequestContext,
    Settings, VisitorContext,
};
use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use serde_json::{json, Value};

pub const NOW: u64 = 1_700_000_000;
pub const REDACT_ID_URL: &str = "https://redact-id.com/verify?site=example";
pub const CALLBACK_KEY: &str = "s3cret-key";
pub const HOST: &str = "example.com";

/// Geo lookup answering from a fixed table and counting calls.
#[derive(Default)]
pub struct CountingGeo {
    records: HashMap<IpAddr, GeoRecord>,
    calls: AtomicUsize,
}

impl CountingGeo {
    pub fn with_region(mut self, ip: &str, country: &str, subdivision: Option<(&str, &str)>) -> Self {
        self.records.insert(
            ip.parse().expect("ip"),
            GeoRecord {
                country_iso: Some(country.to_string()),
                subdivision_iso: subdivision.map(|(code, _)| code.to_string()),
                subdivision_name: subdivision.map(|(_, name)| name.to_string()),
            },
        );
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeoLookup for CountingGeo {
    async fn locate(&self, ip: IpAddr) -> Result<GeoRecord, GeoError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.records.get(&ip).cloned().ok_or(GeoError::NotFound(ip))
    }
}

/// Clock the test moves by hand.
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self(AtomicU64::new(now))
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Signs RedactID-style assertions.
pub struct JwtSigner(pub SigningKey);

impl JwtSigner {
    pub fn new() -> Self {
        Self(SigningKey::from_bytes(&[42u8; 32]))
    }

    pub fn public_key(&self) -> String {
        STANDARD.encode(self.0.verifying_key().to_bytes())
    }

    pub fn sign(&self, claims: &Value) -> String {
        let input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(json!({"alg": "EdDSA", "typ": "JWT"}).to_string()),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        );
        let signature = self.0.sign(input.as_bytes());
        format!("{input}.{}", URL_SAFE_NO_PAD.encode(signature.to_bytes()))
    }

    /// A valid assertion for `example` issued at `now`.
    pub fn assertion(&self, now: u64, jti: &str, reference: &str) -> String {
        self.sign(&json!({
            "iss": "https://redact-id.com",
            "sub": "example",
            "iat": now,
            "nbf": now,
            "exp": now + 3600,
            "jti": jti,
            "18plus": true,
            "reference": reference,
            "ip": "203.0.113.7",
        }))
    }
}

impl Default for JwtSigner {
    fn default() -> Self {
        Self::new()
    }
}

/// GoCam SDK stand-in that keeps the last request instead of encrypting it.
#[derive(Default)]
pub struct RecordingGoCamSdk {
    pub last: Mutex<Option<(GoCamInstance, GoCamRequest)>>,
}

impl GoCamSdk for RecordingGoCamSdk {
    fn verification_url(
        &self,
        instance: &GoCamInstance,
        base_url: &str,
        request: &GoCamRequest,
    ) -> AgeGateResult<String> {
        *self.last.lock().expect("lock") = Some((instance.clone(), request.clone()));
        Ok(format!("{base_url}/?request=opaque"))
    }
}

pub fn settings(signer: &JwtSigner) -> Settings {
    let raw = format!(
        r#"
        [providers.redact_id]
        redact_id_url = "{REDACT_ID_URL}"
        site_id = "example"
        public_key = "{}"

        [providers.gocam]
        base_url = "https://gocam.example.org"
        callback_key = "{CALLBACK_KEY}"
        "#,
        signer.public_key()
    );
    Settings::from_toml_str(&raw).expect("settings")
}

/// An age gate over in-memory backends plus handles to inspect them.
pub struct Harness {
    pub gate: AgeGate,
    pub geo: Arc<CountingGeo>,
    pub store: Arc<MemoryRecordStore>,
    pub cache: Arc<MemoryCache>,
    pub clock: Arc<ManualClock>,
    pub sdk: Arc<RecordingGoCamSdk>,
    pub signer: JwtSigner,
}

impl Harness {
    pub fn new(geo: CountingGeo) -> Self {
        let signer = JwtSigner::new();
        Self::with_settings(geo, settings(&signer), signer)
    }

    pub fn with_settings(geo: CountingGeo, settings: Settings, signer: JwtSigner) -> Self {
        let clock = Arc::new(ManualClock::new(NOW));
        let geo = Arc::new(geo);
        let store = Arc::new(MemoryRecordStore::new());
        let cache = Arc::new(MemoryCache::with_clock(clock.clone()));
        let sdk = Arc::new(RecordingGoCamSdk::default());

        let deps = Dependencies::new(
            cache.clone() as Arc<dyn Cache>,
            store.clone() as Arc<dyn RecordStore>,
            geo.clone() as Arc<dyn GeoLookup>,
        )
        .with_clock(clock.clone())
        .with_gocam_sdk(sdk.clone());

        Self {
            gate: AgeGate::new(settings, deps).expect("gate"),
            geo,
            store,
            cache,
            clock,
            sdk,
            signer,
        }
    }
}

/// A browser request from `ip` on the test host.
pub fn request(ip: &str) -> RequestContext {
    RequestContext::new(
        VisitorContext::guest(ip)
            .with_user_agent("Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0")
            .with_host(HOST, true),
    )
}

/// The next request from the same browser: same visitor, no pending effects.
pub fn follow_up(previous: &RequestContext) -> RequestContext {
    RequestContext::new(previous.visitor.clone())
}
