//! RedactID: redirect out, come back with a signed single-use assertion.

use std::time::Duration;

use serde::Deserialize;

use crate::context::RequestContext;
use crate::error::{AgeGateError, AgeGateResult};
use crate::storage::VerificationMethod;

use super::assertion::{decode_public_key, AssertionExpectations};
use super::{ProviderEnv, ProviderOutcome, ProviderRequest};

/// Form field carrying the assertion on linkback.
pub const ASSERTION_FIELD: &str = "redactJwt";

/// Minimum lifetime of a consumed-assertion marker.
pub const REPLAY_MARKER_TTL: Duration = Duration::from_secs(3 * 60 * 60);

fn default_issuer() -> String {
    "https://redact-id.com".to_string()
}

fn default_launcher_path() -> String {
    "/redactIdLauncher.php".to_string()
}

/// RedactID deployment settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedactIdConfig {
    /// Where visitors start verification.
    pub redact_id_url: String,
    /// Linkback URL registered with RedactID for this site.
    #[serde(default)]
    pub linkback_url: String,
    /// Site id; must equal the assertion's `sub`.
    pub site_id: String,
    /// Base64 Ed25519 public key assertions are signed with.
    pub public_key: String,
    /// Expected assertion issuer.
    #[serde(default = "default_issuer")]
    pub issuer: String,
    /// Local page that starts a RedactID launch, offered when a linkback is empty.
    #[serde(default = "default_launcher_path")]
    pub launcher_path: String,
}

impl RedactIdConfig {
    /// Checks that URLs parse and the public key is a valid Ed25519 key.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the bad field.
    pub fn validate(&self) -> AgeGateResult<()> {
        let invalid = |field: &str| {
            AgeGateError::Configuration(format!("providers.redact_id.{field} is invalid"))
        };
        url::Url::parse(&self.redact_id_url).map_err(|_| invalid("redact_id_url"))?;
        if !self.linkback_url.is_empty() {
            url::Url::parse(&self.linkback_url).map_err(|_| invalid("linkback_url"))?;
        }
        if self.site_id.is_empty() {
            return Err(invalid("site_id"));
        }
        if self.issuer.is_empty() {
            return Err(invalid("issuer"));
        }
        if !self.launcher_path.starts_with('/') {
            return Err(invalid("launcher_path"));
        }
        decode_public_key(&self.public_key).map_err(|_| invalid("public_key"))?;
        Ok(())
    }
}

/// RedactID handshake.
#[derive(Debug, Clone, Copy)]
pub struct RedactId<'a> {
    config: &'a RedactIdConfig,
}

impl<'a> RedactId<'a> {
    /// Binds the handshake to its configuration.
    #[must_use]
    pub const fn new(config: &'a RedactIdConfig) -> Self {
        Self { config }
    }

    pub(crate) fn launch(&self) -> ProviderOutcome {
        ProviderOutcome::Launched {
            location: self.config.redact_id_url.clone(),
        }
    }

    pub(crate) async fn linkback(
        &self,
        env: &ProviderEnv<'_>,
        ctx: &mut RequestContext,
        request: &ProviderRequest,
    ) -> AgeGateResult<ProviderOutcome> {
        let raw = request
            .form(ASSERTION_FIELD)
            .filter(|raw| !raw.is_empty())
            .ok_or_else(|| {
                AgeGateError::validation(
                    "Did not receive a response from RedactID.",
                    Some(&self.config.launcher_path),
                )
            })?;

        let now = env.clock.now();
        let claims = env
            .assertion_validator
            .validate(
                raw,
                &AssertionExpectations {
                    public_key: &self.config.public_key,
                    issuer: &self.config.issuer,
                    subject: &self.config.site_id,
                    now,
                },
            )
            .map_err(|err| {
                log::info!("rejected RedactID assertion: {err}");
                AgeGateError::validation(
                    format!("Problem validating data from RedactID: {err}."),
                    Some(&self.config.redact_id_url),
                )
            })?;

        if claims.ip != ctx.visitor.ip {
            // Not enforced; addresses change mid-flow.
            log::debug!("assertion ip {} differs from visitor ip {}", claims.ip, ctx.visitor.ip);
        }

        let marker_ttl =
            REPLAY_MARKER_TTL.max(Duration::from_secs(claims.expires_at.saturating_sub(now)));
        let first_use = env
            .cache
            .claim(&env.cache.assertion_key(&claims.jti), marker_ttl)
            .await?;
        if !first_use {
            log::warn!("RedactID assertion {} presented again", claims.jti);
            return Err(AgeGateError::Replay {
                retry_url: self.config.redact_id_url.clone(),
                already_verified: env.engine.is_already_verified(&ctx.visitor).await,
            });
        }

        let account_id = ctx.visitor.account_id;
        if account_id > 0 {
            env.engine
                .records()
                .set_account_verified(
                    account_id,
                    VerificationMethod::RedactId,
                    Some(&claims.reference),
                )
                .await;
        }

        let tokens = env.engine.tokens();
        if !ctx.visitor.cookie_token.is_empty() {
            tokens.upgrade(&ctx.visitor.cookie_token).await;
        }
        // No-op when the upgrade above succeeded.
        if let Err(err) = tokens.set_verified_cookie(ctx, true).await {
            if account_id == 0 {
                return Err(err);
            }
            log::error!("could not issue verified cookie for account {account_id}: {err}");
        }

        Ok(ProviderOutcome::Recorded {
            location: Some(env.gate_url()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RedactIdConfig {
        toml::from_str(
            r#"
            redact_id_url = "https://redact-id.com/verify?site=example"
            site_id = "example"
            public_key = "11qYAYKxCrfVS/7TyWQHOg7hcvPapiMlrwIaaPcHURo="
            "#,
        )
        .expect("config")
    }

    #[test]
    fn test_defaults() {
        let config = config();
        assert_eq!(config.issuer, "https://redact-id.com");
        assert_eq!(config.launcher_path, "/redactIdLauncher.php");
        assert!(config.linkback_url.is_empty());
        config.validate().expect("valid");
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let mut bad_key = config();
        bad_key.public_key = "not base64!".to_string();
        assert!(matches!(
            bad_key.validate(),
            Err(AgeGateError::Configuration(message)) if message.contains("public_key")
        ));

        let mut bad_url = config();
        bad_url.redact_id_url = "redact-id.com".to_string();
        assert!(bad_url.validate().is_err());

        let mut no_site = config();
        no_site.site_id.clear();
        assert!(no_site.validate().is_err());
    }

    #[test]
    fn test_launch_redirects_to_provider() {
        let config = config();
        assert_eq!(
            RedactId::new(&config).launch().location(),
            Some("https://redact-id.com/verify?site=example")
        );
    }
}
