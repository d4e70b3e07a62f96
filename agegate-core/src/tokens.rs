//! Anonymous age tokens carried in the visitor's cookie.
//!
//! A token proves a guest's verification without an account. Tokens are
//! created unverified (or verified, at the moment a provider confirms the
//! visitor), may later be upgraded, and are never deleted here.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::cache::KeyedCache;
use crate::clock::Clock;
use crate::context::{CookieDirective, RequestContext, TOKEN_LENGTH};
use crate::error::{AgeGateError, AgeGateResult};
use crate::storage::{AgeToken, CacheEntry, RecordStore};

/// How long a resolved token state is cached.
pub const TOKEN_CACHE_TTL: Duration = Duration::from_secs(3 * 60 * 60);

/// How long a nonexistent token is remembered. Short, to bound probing cost.
pub const MISSING_TOKEN_CACHE_TTL: Duration = Duration::from_secs(3 * 60);

/// Age token cookies outlive any realistic browser.
pub const COOKIE_LIFETIME_SECS: u64 = 60 * 60 * 24 * 31 * 12 * 25;

const TOKEN_BYTES: usize = 16;
const MAX_CREATE_ATTEMPTS: usize = 5;

/// State of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token exists and its holder has verified.
    Verified,
    /// The token exists but is not verified (or is malformed).
    Unverified,
    /// No such token.
    Unknown,
}

impl TokenStatus {
    /// Only `Verified` counts as verified.
    #[must_use]
    pub const fn is_verified(self) -> bool {
        matches!(self, Self::Verified)
    }

    const fn from_entry(entry: CacheEntry) -> Self {
        match entry {
            CacheEntry::Yes => Self::Verified,
            CacheEntry::No => Self::Unverified,
            CacheEntry::Missing => Self::Unknown,
        }
    }
}

/// Outcome of [`TokenLifecycle::upgrade`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// The token flipped from unverified to verified.
    Upgraded,
    /// Nothing to do: the token is unknown or already verified.
    Unchanged,
    /// The token could not be upgraded.
    Failed,
}

/// Creates, checks and upgrades age tokens.
pub struct TokenLifecycle {
    store: Arc<dyn RecordStore>,
    cache: KeyedCache,
    clock: Arc<dyn Clock>,
    cookie_name: String,
}

impl TokenLifecycle {
    /// Creates the token layer.
    #[must_use]
    pub fn new(
        store: Arc<dyn RecordStore>,
        cache: KeyedCache,
        clock: Arc<dyn Clock>,
        cookie_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            cookie_name: cookie_name.into(),
        }
    }

    /// Looks up `token`.
    ///
    /// Tokens longer than [`TOKEN_LENGTH`] are rejected without touching the
    /// cache or store. Store errors are logged and reported as `Unverified`.
    pub async fn check(&self, token: &str) -> TokenStatus {
        if token.len() > TOKEN_LENGTH {
            return TokenStatus::Unverified;
        }

        let key = self.cache.token_key(token);
        if let Some(entry) = self.cache.read(&key).await {
            return TokenStatus::from_entry(entry);
        }

        let (status, entry, ttl) = match self.store.token(token).await {
            Ok(Some(row)) if row.verified => {
                (TokenStatus::Verified, CacheEntry::Yes, TOKEN_CACHE_TTL)
            }
            Ok(Some(_)) => (TokenStatus::Unverified, CacheEntry::No, TOKEN_CACHE_TTL),
            Ok(None) => (
                TokenStatus::Unknown,
                CacheEntry::Missing,
                MISSING_TOKEN_CACHE_TTL,
            ),
            Err(err) => {
                log::error!("token lookup failed: {err}");
                return TokenStatus::Unverified;
            }
        };
        self.cache.write(&key, entry, ttl).await;
        status
    }

    fn generate() -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Issues a fresh token.
    ///
    /// # Errors
    ///
    /// Returns [`AgeGateError::TokenGeneration`] if no unused, well-formed
    /// value was produced within the retry budget, or
    /// [`AgeGateError::Persistence`] if the insert failed.
    pub async fn create(&self, verified: bool) -> AgeGateResult<String> {
        let mut token = None;
        for _ in 0..MAX_CREATE_ATTEMPTS {
            let candidate = Self::generate();
            if candidate.len() != TOKEN_LENGTH {
                return Err(AgeGateError::TokenGeneration(format!(
                    "generated token of length {}",
                    candidate.len()
                )));
            }
            if self.check(&candidate).await == TokenStatus::Unknown {
                token = Some(candidate);
                break;
            }
            log::warn!("generated age token already exists, retrying");
        }
        let token = token.ok_or_else(|| {
            AgeGateError::TokenGeneration(format!(
                "no unused token after {MAX_CREATE_ATTEMPTS} attempts"
            ))
        })?;

        let row = AgeToken {
            token: token.clone(),
            issued: self.clock.now(),
            verified,
        };
        self.store.insert_token(&row).await?;

        // Replaces the Missing entry written by the collision check.
        self.cache
            .write(
                &self.cache.token_key(&token),
                CacheEntry::from_bool(verified),
                TOKEN_CACHE_TTL,
            )
            .await;
        log::debug!("issued age token (verified: {verified})");
        Ok(token)
    }

    /// Marks an existing unverified token as verified.
    pub async fn upgrade(&self, token: &str) -> UpgradeOutcome {
        if token.len() > TOKEN_LENGTH {
            return UpgradeOutcome::Failed;
        }
        match self.check(token).await {
            TokenStatus::Unknown | TokenStatus::Verified => return UpgradeOutcome::Unchanged,
            TokenStatus::Unverified => {}
        }

        if let Err(err) = self.store.mark_token_verified(token).await {
            log::error!("token upgrade failed: {err}");
            return UpgradeOutcome::Failed;
        }
        self.cache
            .write(&self.cache.token_key(token), CacheEntry::Yes, TOKEN_CACHE_TTL)
            .await;
        UpgradeOutcome::Upgraded
    }

    /// Ensures the visitor carries a token, issuing one if needed.
    ///
    /// A cookie token that is already verified is kept as is. Otherwise a new
    /// token is created and a cookie directive pushed onto `ctx`, which must
    /// be applied before the response body is written.
    ///
    /// # Errors
    ///
    /// Propagates failures from [`Self::create`].
    pub async fn set_verified_cookie(
        &self,
        ctx: &mut RequestContext,
        verified: bool,
    ) -> AgeGateResult<String> {
        let existing = ctx.visitor.cookie_token.clone();
        if !existing.is_empty() && self.check(&existing).await.is_verified() {
            return Ok(existing);
        }

        let token = self.create(verified).await?;
        ctx.push_cookie(CookieDirective {
            name: self.cookie_name.clone(),
            value: token.clone(),
            expires_at: self.clock.now().saturating_add(COOKIE_LIFETIME_SECS),
        });
        ctx.visitor.cookie_token.clone_from(&token);
        Ok(token)
    }

    /// Returns the visitor's existing token, issuing an unverified one if the
    /// cookie is empty or names no known token.
    ///
    /// # Errors
    ///
    /// Propagates failures from [`Self::create`].
    pub async fn ensure_cookie(&self, ctx: &mut RequestContext) -> AgeGateResult<String> {
        let existing = ctx.visitor.cookie_token.clone();
        if !existing.is_empty() && self.check(&existing).await != TokenStatus::Unknown {
            return Ok(existing);
        }
        self.set_verified_cookie(ctx, false).await
    }

    /// Instructs the transport to delete the token cookie.
    pub fn clear_verified_cookie(&self, ctx: &mut RequestContext) {
        ctx.push_cookie(CookieDirective {
            name: self.cookie_name.clone(),
            value: String::new(),
            expires_at: self.clock.now().saturating_sub(3600),
        });
        ctx.visitor.cookie_token.clear();
    }
}
