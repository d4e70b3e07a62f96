//! GoCam: SDK-encrypted redirect out, results posted back server-to-server.
//!
//! Payload encryption belongs to the GoCam SDK, reached through [`GoCamSdk`].
//! This module assembles the identifiers the SDK encrypts and validates the
//! callback post.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use subtle::ConstantTimeEq;

use crate::context::RequestContext;
use crate::error::{AgeGateError, AgeGateResult};
use crate::storage::VerificationMethod;

use super::{ProviderEnv, ProviderOutcome, ProviderRequest};

/// Cipher key shipped with the open-source GoCam server.
pub const OPEN_SOURCE_CIPHER_KEY: &str = "zIkmW2zEgzlTLTRC5xeMbcOhHcE5sBHB";

const OFFICIAL_BASE_URL: &str = "https://go.cam";

fn default_cipher_key() -> String {
    OPEN_SOURCE_CIPHER_KEY.to_string()
}

fn default_verification_options() -> Vec<String> {
    ["creditCard", "selfie", "scanId", "email"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

/// GoCam deployment settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GoCamConfig {
    /// GoCam server. Empty selects the official instance.
    pub base_url: String,
    /// Request encryption key.
    pub cipher_key: String,
    /// Shared secret the callback URL must carry as `k`. Empty disables the check.
    pub callback_key: String,
    /// Where GoCam returns the visitor. Empty derives it from the request host.
    pub linkback_url: String,
    /// Where GoCam posts results. Empty derives it from the request host.
    ///
    /// The official instance ignores this and uses the account settings.
    pub callback_url_base: String,
    /// Official instance partner id.
    pub partner_id: u64,
    /// Official instance HMAC key.
    pub hmac_key: String,
    /// Offered verification types. Empty falls back to selfie and ID scan.
    pub verification_options: Vec<String>,
}

impl Default for GoCamConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            cipher_key: default_cipher_key(),
            callback_key: String::new(),
            linkback_url: String::new(),
            callback_url_base: String::new(),
            partner_id: 0,
            hmac_key: String::new(),
            verification_options: default_verification_options(),
        }
    }
}

impl GoCamConfig {
    /// Returns `true` when `base_url` points at the official GoCam service.
    #[must_use]
    pub fn is_official(&self) -> bool {
        self.base_url.is_empty()
            || self
                .base_url
                .get(..OFFICIAL_BASE_URL.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(OFFICIAL_BASE_URL))
    }

    /// Selects the SDK flavour for this deployment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the official instance is selected
    /// without partner credentials.
    pub fn instance(&self) -> AgeGateResult<GoCamInstance> {
        let cipher_key = if self.cipher_key.is_empty() {
            default_cipher_key()
        } else {
            self.cipher_key.clone()
        };
        if !self.is_official() {
            return Ok(GoCamInstance::OpenSource { cipher_key });
        }
        if self.partner_id == 0 || self.hmac_key.is_empty() {
            return Err(AgeGateError::Configuration(
                "GoCam official instance selected, but no partner_id and hmac_key set"
                    .to_string(),
            ));
        }
        Ok(GoCamInstance::Official {
            partner_id: self.partner_id,
            cipher_key,
            hmac_key: self.hmac_key.clone(),
        })
    }

    /// Checks the callback key and official credentials.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the problem.
    pub fn validate(&self) -> AgeGateResult<()> {
        let url_safe = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~');
        if !self.callback_key.chars().all(url_safe) {
            return Err(AgeGateError::Configuration(
                "providers.gocam.callback_key must be URL safe".to_string(),
            ));
        }
        for (field, value) in [
            ("base_url", &self.base_url),
            ("linkback_url", &self.linkback_url),
            ("callback_url_base", &self.callback_url_base),
        ] {
            if !value.is_empty() && url::Url::parse(value).is_err() {
                return Err(AgeGateError::Configuration(format!(
                    "providers.gocam.{field} is not a valid URL"
                )));
            }
        }
        self.instance().map(|_| ())
    }
}

/// Which GoCam SDK variant encrypts the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GoCamInstance {
    /// The hosted service at go.cam.
    Official {
        /// Partner id.
        partner_id: u64,
        /// Request encryption key.
        cipher_key: String,
        /// Request signing key.
        hmac_key: String,
    },
    /// A self-hosted open-source server.
    OpenSource {
        /// Request encryption key.
        cipher_key: String,
    },
}

impl GoCamInstance {
    /// Wire name of the HTTP parameter block, which differs between SDKs.
    #[must_use]
    pub const fn http_parameter_name(&self) -> &'static str {
        match self {
            Self::Official { .. } => "http",
            Self::OpenSource { .. } => "httpParamList",
        }
    }
}

/// Colours of a colour pair plus call-to-action text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ButtonColors {
    /// Button background.
    pub background: String,
    /// Button text.
    pub foreground: String,
    /// Call-to-action button text.
    pub foreground_call_to_action: String,
}

/// Page body colours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BodyColors {
    /// Page background.
    pub background: String,
    /// Page text.
    pub foreground: String,
    /// Buttons.
    pub button: ButtonColors,
}

/// Theme of the GoCam verification page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColorConfig {
    /// Body colours.
    pub body: BodyColors,
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            body: BodyColors {
                background: "#ffffff".to_string(),
                foreground: "#000000".to_string(),
                button: ButtonColors {
                    background: "#9acd1f".to_string(),
                    foreground: "#ffffff".to_string(),
                    foreground_call_to_action: "#ffffff".to_string(),
                },
            },
        }
    }
}

/// Identifiers echoed back in the callback's `userData`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoCamUserData {
    /// Account id, `0` for guests.
    pub user_id: u64,
    /// Cookie token.
    pub user_data: String,
    /// Page theme.
    pub color_config: ColorConfig,
}

/// Optional verification parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoCamParamList {
    /// Show the estimated age to the visitor.
    pub show_detected_age_number: bool,
    /// Offered verification types.
    pub verification_type_list: Vec<String>,
    /// Visitor user agent.
    pub user_agent: String,
}

/// Visitor HTTP details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoCamHttpParams {
    /// Visitor user agent.
    pub user_agent: String,
    /// Host serving the gate; echoed back as `websiteHostname`.
    pub website_hostname: String,
    /// Optional parameters.
    pub param_list: GoCamParamList,
}

/// Verification flow version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerificationVersion {
    /// Standard v1 flow.
    #[serde(rename = "standardV1")]
    StandardV1,
}

/// Everything the SDK encrypts into the verification URL.
///
/// The SDK glue places `http_params` under
/// [`GoCamInstance::http_parameter_name`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoCamRequest {
    /// Identifiers and theme.
    pub user_data: GoCamUserData,
    /// Visitor HTTP details.
    pub http_params: GoCamHttpParams,
    /// Flow version.
    pub verification_version: VerificationVersion,
    /// Where the visitor returns.
    pub link_back: String,
    /// Where results are posted; omitted for the official instance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    /// Visitor address.
    pub ip_str: String,
    /// Visitor country, if known.
    pub country_code: String,
    /// Visitor state, if known.
    pub state_code: String,
}

/// GoCam SDK: encrypts a request into a verification page URL.
pub trait GoCamSdk: Send + Sync {
    /// Builds the verification URL on `base_url` (empty for the official server).
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be encrypted.
    fn verification_url(
        &self,
        instance: &GoCamInstance,
        base_url: &str,
        request: &GoCamRequest,
    ) -> AgeGateResult<String>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallbackUserData {
    #[serde(default)]
    user_id: Value,
    #[serde(default)]
    user_data: String,
}

fn account_id_from(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(raw) if raw.is_empty() => Some(0),
        Value::String(raw) => raw.trim().parse().ok(),
        Value::Null => Some(0),
        _ => None,
    }
}

/// GoCam handshake.
#[derive(Debug, Clone, Copy)]
pub struct GoCam<'a> {
    config: &'a GoCamConfig,
}

impl<'a> GoCam<'a> {
    /// Binds the handshake to its configuration.
    #[must_use]
    pub const fn new(config: &'a GoCamConfig) -> Self {
        Self { config }
    }

    fn default_return_url(env: &ProviderEnv<'_>, ctx: &RequestContext) -> String {
        format!(
            "{}{}?cache={}&provider=GoCam",
            ctx.visitor.origin(),
            env.engine.gate_path(),
            env.clock.now()
        )
    }

    fn link_back(&self, env: &ProviderEnv<'_>, ctx: &RequestContext) -> String {
        if self.config.linkback_url.is_empty() {
            format!("{}&linkback", Self::default_return_url(env, ctx))
        } else {
            self.config.linkback_url.clone()
        }
    }

    fn callback_url(&self, env: &ProviderEnv<'_>, ctx: &RequestContext) -> String {
        let mut url = if self.config.callback_url_base.is_empty() {
            format!("{}&callback", Self::default_return_url(env, ctx))
        } else {
            self.config.callback_url_base.clone()
        };
        if !self.config.callback_key.is_empty() {
            url.push_str("&k=");
            url.push_str(&self.config.callback_key);
        }
        url
    }

    /// Assembles the SDK request for the visitor in `ctx`.
    pub(crate) fn request(
        &self,
        env: &ProviderEnv<'_>,
        ctx: &RequestContext,
        instance: &GoCamInstance,
    ) -> GoCamRequest {
        let visitor = &ctx.visitor;
        let verification_type_list = if self.config.verification_options.is_empty() {
            vec!["selfie".to_string(), "scanId".to_string()]
        } else {
            self.config.verification_options.clone()
        };
        // The official instance only uses the callback from the partner account.
        let callback_url = match instance {
            GoCamInstance::Official { .. } => None,
            GoCamInstance::OpenSource { .. } => Some(self.callback_url(env, ctx)),
        };
        GoCamRequest {
            user_data: GoCamUserData {
                user_id: visitor.account_id,
                user_data: visitor.cookie_token.clone(),
                color_config: ColorConfig::default(),
            },
            http_params: GoCamHttpParams {
                user_agent: visitor.user_agent.clone(),
                website_hostname: visitor.hostname().to_string(),
                param_list: GoCamParamList {
                    show_detected_age_number: false,
                    verification_type_list,
                    user_agent: visitor.user_agent.clone(),
                },
            },
            verification_version: VerificationVersion::StandardV1,
            link_back: self.link_back(env, ctx),
            callback_url,
            ip_str: visitor.ip.clone(),
            country_code: String::new(),
            state_code: String::new(),
        }
    }

    pub(crate) fn launch(
        &self,
        env: &ProviderEnv<'_>,
        ctx: &RequestContext,
    ) -> AgeGateResult<ProviderOutcome> {
        let sdk = env.gocam_sdk.ok_or_else(|| {
            AgeGateError::Configuration("GoCam is configured but no SDK was provided".to_string())
        })?;
        let instance = self.config.instance()?;
        let request = self.request(env, ctx, &instance);
        let location = sdk.verification_url(&instance, &self.config.base_url, &request)?;
        Ok(ProviderOutcome::Launched { location })
    }

    pub(crate) async fn callback(
        &self,
        env: &ProviderEnv<'_>,
        ctx: &RequestContext,
        request: &ProviderRequest,
    ) -> AgeGateResult<ProviderOutcome> {
        let expected_key = self.config.callback_key.as_bytes();
        if !expected_key.is_empty() {
            let presented = request.query("k").unwrap_or_default().as_bytes();
            if !bool::from(presented.ct_eq(expected_key)) {
                log::warn!("GoCam callback with invalid key from {}", ctx.visitor.ip);
                return Err(AgeGateError::validation("Invalid k parameter.", None));
            }
        }

        // Official and open-source servers disagree on the casing.
        if !request
            .form("state")
            .is_some_and(|state| state.eq_ignore_ascii_case("success"))
        {
            return Err(AgeGateError::validation("State was not success.", None));
        }

        if request.form("websiteHostname") != Some(ctx.visitor.hostname()) {
            return Err(AgeGateError::validation("Wrong hostname.", None));
        }

        let user_data: CallbackUserData =
            serde_json::from_str(request.form("userData").unwrap_or_default())
                .map_err(|e| AgeGateError::validation(format!("Invalid userData: {e}"), None))?;
        let account_id = account_id_from(&user_data.user_id)
            .ok_or_else(|| AgeGateError::validation("Invalid userId.", None))?;

        if account_id > 0 {
            env.engine
                .records()
                .set_account_verified(account_id, VerificationMethod::GoCam, None)
                .await;
        }
        if !user_data.user_data.is_empty() {
            env.engine.tokens().upgrade(&user_data.user_data).await;
        }

        Ok(ProviderOutcome::Recorded { location: None })
    }
}
