//! Records and cache values shared by every backend.

use strum::{AsRefStr, Display, EnumString};

use super::error::{StorageError, StorageResult};

/// Cached outcome of a lookup.
///
/// `Missing` records that the backing row does not exist, which is different
/// from the key not being cached at all (`None` from [`super::Cache::get`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheEntry {
    /// The looked-up fact holds (restricted, verified, consumed).
    Yes = 1,
    /// The looked-up fact does not hold.
    No = 2,
    /// The looked-up record does not exist.
    Missing = 3,
}

impl CacheEntry {
    /// Byte tag used by binary backends.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Maps a boolean outcome onto `Yes`/`No`.
    #[must_use]
    pub const fn from_bool(value: bool) -> Self {
        if value {
            Self::Yes
        } else {
            Self::No
        }
    }
}

impl TryFrom<u8> for CacheEntry {
    type Error = StorageError;

    fn try_from(value: u8) -> StorageResult<Self> {
        match value {
            1 => Ok(Self::Yes),
            2 => Ok(Self::No),
            3 => Ok(Self::Missing),
            _ => Err(StorageError::Serialization(format!(
                "invalid cache entry tag {value}"
            ))),
        }
    }
}

/// How an account was verified. Stored verbatim in the account row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
pub enum VerificationMethod {
    /// Redacted ID document via RedactID.
    #[strum(serialize = "REDACT-ID")]
    RedactId,
    /// Selfie / document scan via GoCam.
    #[strum(serialize = "GOCAM")]
    GoCam,
    /// Promoted from an already verified cookie token.
    #[strum(serialize = "COOKIE")]
    Cookie,
}

impl VerificationMethod {
    /// Only RedactID hands back a reference worth keeping for audits.
    #[must_use]
    pub const fn retains_reference(self) -> bool {
        matches!(self, Self::RedactId)
    }
}

/// Persisted verification state of an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountVerification {
    /// Site account id (> 0).
    pub account_id: u64,
    /// Method that verified the account; `None` while unverified.
    pub method: Option<String>,
    /// Provider reference, kept only for RedactID.
    pub reference: Option<String>,
}

impl AccountVerification {
    /// Creates an unverified account row.
    #[must_use]
    pub const fn unverified(account_id: u64) -> Self {
        Self {
            account_id,
            method: None,
            reference: None,
        }
    }

    /// An account is verified once any method has been recorded.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.method.as_deref().is_some_and(|method| !method.is_empty())
    }
}

/// Anonymous verification token carried in the visitor's cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgeToken {
    /// 32 lowercase hex characters.
    pub token: String,
    /// Unix seconds at creation.
    pub issued: u64,
    /// Whether the holder has passed verification.
    pub verified: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_cache_entry_tags() {
        for entry in [CacheEntry::Yes, CacheEntry::No, CacheEntry::Missing] {
            assert_eq!(CacheEntry::try_from(entry.as_byte()).unwrap(), entry);
        }
        assert!(CacheEntry::try_from(0).is_err());
    }

    #[test]
    fn test_method_names_match_account_column() {
        assert_eq!(VerificationMethod::RedactId.as_ref(), "REDACT-ID");
        assert_eq!(
            VerificationMethod::from_str("GOCAM").unwrap(),
            VerificationMethod::GoCam
        );
        assert!(VerificationMethod::RedactId.retains_reference());
        assert!(!VerificationMethod::Cookie.retains_reference());
    }

    #[test]
    fn test_empty_method_is_unverified() {
        let mut account = AccountVerification::unverified(7);
        assert!(!account.is_verified());
        account.method = Some(String::new());
        assert!(!account.is_verified());
        account.method = Some("GOCAM".to_string());
        assert!(account.is_verified());
    }
}
