//! Whether a visitor must verify before seeing restricted content.

use crate::context::{RequestContext, VisitorContext};
use crate::records::VerificationRecords;
use crate::region::RegionResolver;
use crate::tokens::TokenLifecycle;

/// Case-insensitive user agent fragments exempt from verification.
///
/// Best effort: a missed bot is acceptable, a human matching is not expected.
const BOT_SIGNATURES: [&str; 7] = [
    "bot",
    "spider",
    "facebook",
    "gpt",
    "anthropic",
    "crawler",
    "curl",
];

/// Returns `true` if `user_agent` looks like a crawler or scripted client.
#[must_use]
pub fn is_bot_agent(user_agent: &str) -> bool {
    let lowercase = user_agent.to_ascii_lowercase();
    BOT_SIGNATURES
        .iter()
        .any(|signature| lowercase.contains(signature))
}

/// Combines region, account, token and user agent checks.
pub struct DecisionEngine {
    region: RegionResolver,
    records: VerificationRecords,
    tokens: TokenLifecycle,
    gate_path: String,
}

impl DecisionEngine {
    /// Creates the engine.
    #[must_use]
    pub fn new(
        region: RegionResolver,
        records: VerificationRecords,
        tokens: TokenLifecycle,
        gate_path: impl Into<String>,
    ) -> Self {
        Self {
            region,
            records,
            tokens,
            gate_path: gate_path.into(),
        }
    }

    /// Account records used by the engine.
    #[must_use]
    pub const fn records(&self) -> &VerificationRecords {
        &self.records
    }

    /// Token lifecycle used by the engine.
    #[must_use]
    pub const fn tokens(&self) -> &TokenLifecycle {
        &self.tokens
    }

    /// Path of the gate page.
    #[must_use]
    pub fn gate_path(&self) -> &str {
        &self.gate_path
    }

    /// Returns `true` if the visitor must verify.
    ///
    /// Checks run cheapest first and short-circuit: region, then the account,
    /// then the cookie token, then the bot exemption.
    pub async fn should_verify(&self, ctx: &mut RequestContext) -> bool {
        if !self.region.resolve(ctx).await.restricted {
            return false;
        }
        if self.is_already_verified(&ctx.visitor).await {
            return false;
        }
        if is_bot_agent(&ctx.visitor.user_agent) {
            log::debug!("exempting bot agent {:?}", ctx.visitor.user_agent);
            return false;
        }
        true
    }

    /// Returns the gate path if the visitor must verify.
    pub async fn redirect_if_should(&self, ctx: &mut RequestContext) -> Option<String> {
        if self.should_verify(ctx).await {
            Some(self.gate_path.clone())
        } else {
            None
        }
    }

    /// Returns `true` if the visitor's account or cookie token is verified.
    pub async fn is_already_verified(&self, visitor: &VisitorContext) -> bool {
        if visitor.account_id > 0
            && self
                .records
                .account_status(visitor.account_id)
                .await
                .is_verified()
        {
            return true;
        }
        self.is_valid_cookie_present(visitor).await
    }

    /// Returns `true` if the visitor carries a verified cookie token.
    pub async fn is_valid_cookie_present(&self, visitor: &VisitorContext) -> bool {
        !visitor.cookie_token.is_empty()
            && self.tokens.check(&visitor.cookie_token).await.is_verified()
    }
}
