//! External verification providers and their launch/callback/linkback handshakes.
//!
//! Providers form a closed set: [`ProviderKind`] names them and [`Provider`]
//! pairs each with its typed configuration. Every handshake step dispatches
//! through a single exhaustive match.

use std::collections::HashMap;

use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::cache::KeyedCache;
use crate::clock::Clock;
use crate::config::ProviderSettings;
use crate::context::RequestContext;
use crate::decision::DecisionEngine;
use crate::error::{AgeGateError, AgeGateResult};
use crate::storage::VerificationMethod;

pub mod assertion;
pub mod gocam;
pub mod redact_id;

pub use assertion::{
    AssertionError, AssertionExpectations, AssertionValidator, Ed25519JwtValidator,
    RedactIdClaims,
};
pub use gocam::{
    ColorConfig, GoCam, GoCamConfig, GoCamHttpParams, GoCamInstance, GoCamParamList,
    GoCamRequest, GoCamSdk, GoCamUserData, VerificationVersion,
};
pub use redact_id::{RedactId, RedactIdConfig};

/// Supported providers, named as they appear in gate URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, EnumIter)]
pub enum ProviderKind {
    /// Assertion-redirect provider: the visitor returns with a signed JWT.
    #[strum(serialize = "RedactID")]
    RedactId,
    /// SDK-encrypted redirect provider: results arrive by server callback.
    #[strum(serialize = "GoCam")]
    GoCam,
}

/// Progress of a provider handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStage {
    /// Nothing happened.
    NotStarted,
    /// The visitor was sent to the provider.
    Launched,
    /// A verification was recorded (now or earlier).
    Recorded,
}

/// Result of a handshake step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderOutcome {
    /// The visitor was already verified; send them back to the gate.
    AlreadyVerified {
        /// Cache-busted gate URL.
        location: String,
    },
    /// Redirect the visitor to the provider.
    Launched {
        /// Provider URL.
        location: String,
    },
    /// The provider's result was recorded.
    Recorded {
        /// Where to send the visitor; `None` for server-to-server callbacks.
        location: Option<String>,
    },
    /// This provider does not handle this step.
    Ignored,
}

impl ProviderOutcome {
    /// Redirect target, if any.
    #[must_use]
    pub fn location(&self) -> Option<&str> {
        match self {
            Self::AlreadyVerified { location } | Self::Launched { location } => Some(location),
            Self::Recorded { location } => location.as_deref(),
            Self::Ignored => None,
        }
    }

    /// Stage the handshake reached.
    #[must_use]
    pub const fn stage(&self) -> ProtocolStage {
        match self {
            Self::AlreadyVerified { .. } | Self::Recorded { .. } => ProtocolStage::Recorded,
            Self::Launched { .. } => ProtocolStage::Launched,
            Self::Ignored => ProtocolStage::NotStarted,
        }
    }
}

/// Query string and form fields of a provider request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderRequest {
    /// Decoded query parameters.
    pub query: HashMap<String, String>,
    /// Decoded `application/x-www-form-urlencoded` body fields.
    pub form: HashMap<String, String>,
}

impl ProviderRequest {
    /// Parses a raw query string and form body.
    #[must_use]
    pub fn from_encoded(query: &str, form: &str) -> Self {
        let parse = |raw: &str| -> HashMap<String, String> {
            url::form_urlencoded::parse(raw.trim_start_matches('?').as_bytes())
                .into_owned()
                .collect()
        };
        Self {
            query: parse(query),
            form: parse(form),
        }
    }

    /// Adds a query parameter.
    #[must_use]
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Adds a form field.
    #[must_use]
    pub fn with_form(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.form.insert(name.into(), value.into());
        self
    }

    pub(crate) fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub(crate) fn form(&self, name: &str) -> Option<&str> {
        self.form.get(name).map(String::as_str)
    }
}

/// Handles shared by every provider.
pub struct ProviderEnv<'a> {
    /// Decision engine, for its records and tokens.
    pub engine: &'a DecisionEngine,
    /// Prefixed cache, for single-use markers.
    pub cache: &'a KeyedCache,
    /// Time source.
    pub clock: &'a dyn Clock,
    /// RedactID assertion validator.
    pub assertion_validator: &'a dyn AssertionValidator,
    /// GoCam request encryption, when GoCam is deployed.
    pub gocam_sdk: Option<&'a dyn GoCamSdk>,
}

impl ProviderEnv<'_> {
    /// Gate URL with a cache-busting parameter.
    pub(crate) fn gate_url(&self) -> String {
        format!("{}?cache={}", self.engine.gate_path(), self.clock.now())
    }

    /// Short-circuits a launch for visitors who are already verified.
    ///
    /// A verified cookie is promoted onto an unverified account; the reverse
    /// never happens.
    pub(crate) async fn already_verified(
        &self,
        ctx: &RequestContext,
    ) -> Option<ProviderOutcome> {
        let visitor = &ctx.visitor;
        let account_verified = visitor.account_id > 0
            && self
                .engine
                .records()
                .account_status(visitor.account_id)
                .await
                .is_verified();
        let token_verified = self.engine.is_valid_cookie_present(visitor).await;

        if !account_verified && !token_verified {
            return None;
        }
        if visitor.account_id > 0 && !account_verified {
            self.engine
                .records()
                .set_account_verified(visitor.account_id, VerificationMethod::Cookie, None)
                .await;
        }
        Some(ProviderOutcome::AlreadyVerified {
            location: self.gate_url(),
        })
    }
}

/// A configured provider.
#[derive(Debug, Clone, Copy)]
pub enum Provider<'a> {
    /// RedactID.
    RedactId(RedactId<'a>),
    /// GoCam.
    GoCam(GoCam<'a>),
}

impl<'a> Provider<'a> {
    /// Pairs `kind` with its configuration section.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the provider has no section.
    pub fn select(kind: ProviderKind, settings: &'a ProviderSettings) -> AgeGateResult<Self> {
        let missing = || AgeGateError::Configuration(format!("provider {kind} is not configured"));
        match kind {
            ProviderKind::RedactId => settings
                .redact_id
                .as_ref()
                .map(|config| Self::RedactId(RedactId::new(config)))
                .ok_or_else(missing),
            ProviderKind::GoCam => settings
                .gocam
                .as_ref()
                .map(|config| Self::GoCam(GoCam::new(config)))
                .ok_or_else(missing),
        }
    }

    /// Resolves a provider by its URL name, e.g. `RedactID`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown or unconfigured providers.
    pub fn by_name(name: &str, settings: &'a ProviderSettings) -> AgeGateResult<Self> {
        let kind: ProviderKind = name
            .parse()
            .map_err(|_| AgeGateError::Configuration(format!("unknown provider {name:?}")))?;
        Self::select(kind, settings)
    }

    /// Which provider this is.
    #[must_use]
    pub const fn kind(&self) -> ProviderKind {
        match self {
            Self::RedactId(_) => ProviderKind::RedactId,
            Self::GoCam(_) => ProviderKind::GoCam,
        }
    }

    /// Sends the visitor to the provider, unless already verified.
    ///
    /// # Errors
    ///
    /// Returns configuration or token errors that prevent building the redirect.
    pub async fn launch(
        &self,
        env: &ProviderEnv<'_>,
        ctx: &mut RequestContext,
    ) -> AgeGateResult<ProviderOutcome> {
        if let Some(outcome) = env.already_verified(ctx).await {
            log::debug!("{} launch skipped, visitor already verified", self.kind());
            return Ok(outcome);
        }
        // Both providers correlate the result with a cookie token.
        env.engine.tokens().ensure_cookie(ctx).await?;
        match self {
            Self::RedactId(provider) => Ok(provider.launch()),
            Self::GoCam(provider) => provider.launch(env, ctx),
        }
    }

    /// Handles a server-to-server result post.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the post is not a genuine success.
    pub async fn callback(
        &self,
        env: &ProviderEnv<'_>,
        ctx: &mut RequestContext,
        request: &ProviderRequest,
    ) -> AgeGateResult<ProviderOutcome> {
        match self {
            Self::GoCam(provider) => provider.callback(env, ctx, request).await,
            Self::RedactId(_) => Ok(ProviderOutcome::Ignored),
        }
    }

    /// Handles the visitor returning from the provider.
    ///
    /// # Errors
    ///
    /// Returns validation or replay errors to show the visitor.
    pub async fn linkback(
        &self,
        env: &ProviderEnv<'_>,
        ctx: &mut RequestContext,
        request: &ProviderRequest,
    ) -> AgeGateResult<ProviderOutcome> {
        match self {
            Self::RedactId(provider) => provider.linkback(env, ctx, request).await,
            Self::GoCam(_) => Ok(ProviderOutcome::Ignored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_provider_names() {
        assert_eq!(ProviderKind::from_str("RedactID").unwrap(), ProviderKind::RedactId);
        assert_eq!(ProviderKind::GoCam.to_string(), "GoCam");
        assert!(ProviderKind::from_str("redactid").is_err());
        assert_eq!(ProviderKind::iter().count(), 2);
    }

    #[test]
    fn test_unconfigured_provider_is_configuration_error() {
        let settings = ProviderSettings::default();
        for kind in ProviderKind::iter() {
            assert!(matches!(
                Provider::select(kind, &settings),
                Err(AgeGateError::Configuration(_))
            ));
        }
        assert!(matches!(
            Provider::by_name("Yoti", &settings),
            Err(AgeGateError::Configuration(_))
        ));
    }

    #[test]
    fn test_request_parsing() {
        let request = ProviderRequest::from_encoded(
            "?cache=1&provider=GoCam&callback&k=abc",
            "state=Success&userData=%7B%22userId%22%3A5%7D",
        );
        assert_eq!(request.query("k"), Some("abc"));
        assert_eq!(request.query("callback"), Some(""));
        assert_eq!(request.form("userData"), Some("{\"userId\":5}"));
    }

    #[test]
    fn test_outcome_stage() {
        let outcome = ProviderOutcome::Launched {
            location: "https://redact-id.com/start".to_string(),
        };
        assert_eq!(outcome.stage(), ProtocolStage::Launched);
        assert_eq!(outcome.location(), Some("https://redact-id.com/start"));
        assert_eq!(ProviderOutcome::Ignored.stage(), ProtocolStage::NotStarted);
        assert_eq!(
            ProviderOutcome::Recorded { location: None }.stage(),
            ProtocolStage::Recorded
        );
    }
}
