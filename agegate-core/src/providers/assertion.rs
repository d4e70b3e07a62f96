//! Signed RedactID assertions (compact JWS, `EdDSA`).
//!
//! A single failed constraint is enough to reject an assertion; the error's
//! `Display` text is what the visitor sees alongside the retry link.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use ed25519_dalek::VerifyingKey;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::{Map, Value};
use thiserror::Error;

/// Why an assertion was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssertionError {
    /// Not three base64url segments of JSON.
    #[error("The token could not be parsed: {0}")]
    Malformed(String),
    /// Header `alg` is not `EdDSA`.
    #[error("The token uses an unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    /// The configured public key is not a valid Ed25519 key.
    #[error("The verification key is invalid")]
    InvalidKey,
    /// The signature does not match the configured key.
    #[error("Token signer mismatch")]
    Signature,
    /// Unexpected `iss`.
    #[error("The token was not issued by the given issuers")]
    Issuer,
    /// Unexpected `sub`.
    #[error("The token is not related to the expected subject")]
    Subject,
    /// `exp` has passed.
    #[error("The token is expired")]
    Expired,
    /// `iat` or `nbf` lies in the future.
    #[error("The token cannot be used yet")]
    NotYetValid,
    /// A required claim is absent.
    #[error("The token does not have the claim \"{0}\"")]
    MissingClaim(&'static str),
    /// A claim has the wrong value or type.
    #[error("The claim \"{0}\" does not have the expected value")]
    ClaimMismatch(&'static str),
}

/// What a valid assertion must match.
#[derive(Debug, Clone, Copy)]
pub struct AssertionExpectations<'a> {
    /// Base64 (standard alphabet) Ed25519 public key.
    pub public_key: &'a str,
    /// Expected `iss`.
    pub issuer: &'a str,
    /// Expected `sub`, the site id.
    pub subject: &'a str,
    /// Current unix time.
    pub now: u64,
}

/// Claims extracted from a valid assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedactIdClaims {
    /// Unique assertion id, used for single-use enforcement.
    pub jti: String,
    /// Provider reference for the verification, kept on the account.
    pub reference: String,
    /// Address the visitor verified from.
    pub ip: String,
    /// Expiry (unix seconds).
    pub expires_at: u64,
}

/// Validates raw assertions from a linkback.
pub trait AssertionValidator: Send + Sync {
    /// Checks signature, issuer, subject, time window and required claims.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    fn validate(
        &self,
        raw: &str,
        expected: &AssertionExpectations<'_>,
    ) -> Result<RedactIdClaims, AssertionError>;
}

/// [`AssertionValidator`] for Ed25519-signed compact JWTs.
///
/// Signature, algorithm, issuer and subject are checked by `jsonwebtoken`.
/// The time window is checked against the caller's clock since the library
/// only reads the wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519JwtValidator;

/// Decodes a base64 Ed25519 public key.
///
/// # Errors
///
/// Returns [`AssertionError::InvalidKey`] if the key is not 32 valid bytes.
pub fn decode_public_key(public_key: &str) -> Result<VerifyingKey, AssertionError> {
    let bytes = STANDARD
        .decode(public_key.trim())
        .map_err(|_| AssertionError::InvalidKey)?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| AssertionError::InvalidKey)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| AssertionError::InvalidKey)
}

fn decoding_key(public_key: &str) -> Result<DecodingKey, AssertionError> {
    let key = decode_public_key(public_key)?;
    DecodingKey::from_ed_components(&URL_SAFE_NO_PAD.encode(key.to_bytes()))
        .map_err(|_| AssertionError::InvalidKey)
}

fn claim_name(name: &str) -> &'static str {
    match name {
        "iss" => "iss",
        "sub" => "sub",
        "exp" => "exp",
        "nbf" => "nbf",
        "aud" => "aud",
        _ => "unknown",
    }
}

fn map_jwt_error(raw: &str, err: &jsonwebtoken::errors::Error) -> AssertionError {
    match err.kind() {
        ErrorKind::InvalidSignature => AssertionError::Signature,
        ErrorKind::InvalidAlgorithm | ErrorKind::MissingAlgorithm => {
            let alg = jsonwebtoken::decode_header(raw)
                .map_or_else(|_| "unknown".to_string(), |header| format!("{:?}", header.alg));
            AssertionError::UnsupportedAlgorithm(alg)
        }
        ErrorKind::InvalidIssuer => AssertionError::Issuer,
        ErrorKind::InvalidSubject => AssertionError::Subject,
        ErrorKind::MissingRequiredClaim(name) => AssertionError::MissingClaim(claim_name(name)),
        ErrorKind::InvalidEcdsaKey | ErrorKind::InvalidKeyFormat => AssertionError::InvalidKey,
        _ => AssertionError::Malformed(err.to_string()),
    }
}

fn numeric_claim(claims: &Map<String, Value>, name: &'static str) -> Result<u64, AssertionError> {
    let value = claims.get(name).ok_or(AssertionError::MissingClaim(name))?;
    value
        .as_u64()
        .or_else(|| {
            // Fractional timestamps are allowed; truncate.
            value
                .as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| {
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let secs = f as u64;
                    secs
                })
        })
        .ok_or(AssertionError::ClaimMismatch(name))
}

fn string_claim(claims: &Map<String, Value>, name: &'static str) -> Result<String, AssertionError> {
    match claims.get(name) {
        None | Some(Value::Null) => Err(AssertionError::MissingClaim(name)),
        Some(Value::String(value)) => Ok(value.clone()),
        Some(Value::Number(value)) => Ok(value.to_string()),
        Some(_) => Err(AssertionError::ClaimMismatch(name)),
    }
}

impl AssertionValidator for Ed25519JwtValidator {
    fn validate(
        &self,
        raw: &str,
        expected: &AssertionExpectations<'_>,
    ) -> Result<RedactIdClaims, AssertionError> {
        let raw = raw.trim();
        let key = decoding_key(expected.public_key)?;

        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.set_issuer(&[expected.issuer]);
        validation.sub = Some(expected.subject.to_string());
        validation.set_required_spec_claims(&["iss", "sub"]);
        validation.leeway = 0;
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;

        let claims = jsonwebtoken::decode::<Map<String, Value>>(raw, &key, &validation)
            .map_err(|err| map_jwt_error(raw, &err))?
            .claims;

        let issued_at = numeric_claim(&claims, "iat")?;
        let not_before = numeric_claim(&claims, "nbf")?;
        let expires_at = numeric_claim(&claims, "exp")?;
        if issued_at > expected.now || not_before > expected.now {
            return Err(AssertionError::NotYetValid);
        }
        if expires_at <= expected.now {
            return Err(AssertionError::Expired);
        }

        match claims.get("18plus") {
            None => return Err(AssertionError::MissingClaim("18plus")),
            Some(Value::Bool(true)) => {}
            Some(_) => return Err(AssertionError::ClaimMismatch("18plus")),
        }

        Ok(RedactIdClaims {
            reference: string_claim(&claims, "reference")?,
            ip: string_claim(&claims, "ip")?,
            jti: string_claim(&claims, "jti")?,
            expires_at,
        })
    }
}
