//! The age gate facade: decision, display region, provider handshakes and
//! cookie management, wired from [`Settings`] and [`Dependencies`].

use std::sync::Arc;

use crate::cache::KeyedCache;
use crate::clock::{Clock, SystemClock};
use crate::config::Settings;
use crate::context::RequestContext;
use crate::decision::DecisionEngine;
use crate::error::AgeGateResult;
use crate::providers::{
    AssertionValidator, Ed25519JwtValidator, GoCamSdk, Provider, ProviderEnv, ProviderOutcome,
    ProviderRequest,
};
use crate::records::VerificationRecords;
use crate::region::{GeoLookup, RegionResolver, RestrictionPolicy};
use crate::storage::{Cache, RecordStore};
use crate::tokens::TokenLifecycle;

/// Runtime handles, constructed once per process and shared by every request.
#[derive(Clone)]
pub struct Dependencies {
    /// Cache in front of region and record lookups.
    pub cache: Arc<dyn Cache>,
    /// Account and token tables.
    pub store: Arc<dyn RecordStore>,
    /// IP geolocation.
    pub geo: Arc<dyn GeoLookup>,
    /// Overrides the policy derived from [`Settings::block_list`].
    pub policy: Option<Arc<dyn RestrictionPolicy>>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// RedactID assertion validation.
    pub assertion_validator: Arc<dyn AssertionValidator>,
    /// GoCam request encryption; required to launch GoCam.
    pub gocam_sdk: Option<Arc<dyn GoCamSdk>>,
}

impl Dependencies {
    /// Creates dependencies with the system clock and the Ed25519 validator.
    #[must_use]
    pub fn new(cache: Arc<dyn Cache>, store: Arc<dyn RecordStore>, geo: Arc<dyn GeoLookup>) -> Self {
        Self {
            cache,
            store,
            geo,
            policy: None,
            clock: Arc::new(SystemClock),
            assertion_validator: Arc::new(Ed25519JwtValidator),
            gocam_sdk: None,
        }
    }

    /// Replaces the restriction policy.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn RestrictionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the assertion validator.
    #[must_use]
    pub fn with_assertion_validator(mut self, validator: Arc<dyn AssertionValidator>) -> Self {
        self.assertion_validator = validator;
        self
    }

    /// Provides the GoCam SDK.
    #[must_use]
    pub fn with_gocam_sdk(mut self, sdk: Arc<dyn GoCamSdk>) -> Self {
        self.gocam_sdk = Some(sdk);
        self
    }
}

/// Age verification for one site.
pub struct AgeGate {
    settings: Settings,
    engine: DecisionEngine,
    cache: KeyedCache,
    clock: Arc<dyn Clock>,
    assertion_validator: Arc<dyn AssertionValidator>,
    gocam_sdk: Option<Arc<dyn GoCamSdk>>,
}

impl AgeGate {
    /// Validates `settings` and wires the components.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the settings are invalid.
    pub fn new(settings: Settings, deps: Dependencies) -> AgeGateResult<Self> {
        settings.validate()?;
        let policy: Arc<dyn RestrictionPolicy> = match deps.policy {
            Some(policy) => policy,
            None => Arc::new(settings.block_list()?),
        };
        let cache = KeyedCache::new(
            deps.cache,
            settings.cache_prefix.clone(),
            settings.cache_read_enabled,
        );

        let region = RegionResolver::new(
            deps.geo,
            policy,
            cache.clone(),
            settings.globally_restricted,
            settings.ip_overrides.clone(),
        );
        let records = VerificationRecords::new(Arc::clone(&deps.store), cache.clone());
        let tokens = TokenLifecycle::new(
            deps.store,
            cache.clone(),
            Arc::clone(&deps.clock),
            settings.cookie_name.clone(),
        );
        let engine = DecisionEngine::new(region, records, tokens, settings.gate_path.clone());

        Ok(Self {
            settings,
            engine,
            cache,
            clock: deps.clock,
            assertion_validator: deps.assertion_validator,
            gocam_sdk: deps.gocam_sdk,
        })
    }

    /// Active settings.
    #[must_use]
    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The underlying decision engine, records and tokens.
    #[must_use]
    pub const fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    /// Returns `true` if the visitor must verify.
    pub async fn should_verify(&self, ctx: &mut RequestContext) -> bool {
        self.engine.should_verify(ctx).await
    }

    /// Returns the gate path if the visitor must verify.
    pub async fn redirect_if_should(&self, ctx: &mut RequestContext) -> Option<String> {
        self.engine.redirect_if_should(ctx).await
    }

    /// Returns `true` if the visitor's cookie token is verified.
    pub async fn is_valid_cookie_present(&self, ctx: &RequestContext) -> bool {
        self.engine.is_valid_cookie_present(&ctx.visitor).await
    }

    /// Region name to show a blocked visitor; empty if not blocked or unknown.
    #[must_use]
    pub fn display_region_name<'c>(&self, ctx: &'c RequestContext) -> &'c str {
        ctx.display_region().unwrap_or_default()
    }

    fn env(&self) -> ProviderEnv<'_> {
        ProviderEnv {
            engine: &self.engine,
            cache: &self.cache,
            clock: self.clock.as_ref(),
            assertion_validator: self.assertion_validator.as_ref(),
            gocam_sdk: self.gocam_sdk.as_deref(),
        }
    }

    /// Sends the visitor to `provider`, e.g. `RedactID` or `GoCam`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown or unconfigured providers,
    /// or the error that prevented building the redirect.
    pub async fn launch(
        &self,
        provider: &str,
        ctx: &mut RequestContext,
    ) -> AgeGateResult<ProviderOutcome> {
        let provider = Provider::by_name(provider, &self.settings.providers)?;
        provider.launch(&self.env(), ctx).await
    }

    /// Handles a provider's server-to-server result post.
    ///
    /// # Errors
    ///
    /// Returns configuration or validation errors.
    pub async fn callback(
        &self,
        provider: &str,
        ctx: &mut RequestContext,
        request: &ProviderRequest,
    ) -> AgeGateResult<ProviderOutcome> {
        let provider = Provider::by_name(provider, &self.settings.providers)?;
        provider.callback(&self.env(), ctx, request).await
    }

    /// Handles the visitor returning from a provider.
    ///
    /// # Errors
    ///
    /// Returns configuration, validation or replay errors.
    pub async fn linkback(
        &self,
        provider: &str,
        ctx: &mut RequestContext,
        request: &ProviderRequest,
    ) -> AgeGateResult<ProviderOutcome> {
        let provider = Provider::by_name(provider, &self.settings.providers)?;
        provider.linkback(&self.env(), ctx, request).await
    }

    /// Ensures the visitor holds a token, verified if `verified`.
    ///
    /// # Errors
    ///
    /// Returns token generation or persistence errors.
    pub async fn set_verified_cookie(
        &self,
        ctx: &mut RequestContext,
        verified: bool,
    ) -> AgeGateResult<String> {
        self.engine.tokens().set_verified_cookie(ctx, verified).await
    }

    /// Deletes the visitor's token cookie.
    pub fn clear_verified_cookie(&self, ctx: &mut RequestContext) {
        self.engine.tokens().clear_verified_cookie(ctx);
    }
}
