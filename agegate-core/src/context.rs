//! Per-request visitor data and the side effects a request accumulates.

/// Longest valid age token, in characters.
pub const TOKEN_LENGTH: usize = 32;

/// Who is asking, as seen by the transport layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisitorContext {
    /// Remote address as reported by the transport.
    pub ip: String,
    /// Logged-in account id, `0` for guests.
    pub account_id: u64,
    /// Value of the age token cookie, empty if absent.
    pub cookie_token: String,
    /// Raw `User-Agent` header.
    pub user_agent: String,
    /// `Host` header (may include a port).
    pub host: String,
    /// Whether the request arrived over HTTPS.
    pub secure: bool,
}

impl VisitorContext {
    /// Creates a guest visitor from `ip`.
    #[must_use]
    pub fn guest(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            ..Self::default()
        }
    }

    /// Sets the logged-in account.
    #[must_use]
    pub const fn with_account(mut self, account_id: u64) -> Self {
        self.account_id = account_id;
        self
    }

    /// Sets the age token cookie value.
    #[must_use]
    pub fn with_cookie_token(mut self, token: impl Into<String>) -> Self {
        self.cookie_token = token.into();
        self
    }

    /// Sets the user agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Sets the host and scheme the request was served on.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>, secure: bool) -> Self {
        self.host = host.into();
        self.secure = secure;
        self
    }

    /// Host without any `:port` suffix.
    #[must_use]
    pub fn hostname(&self) -> &str {
        if self.host.starts_with('[') {
            // [v6]:port
            return self
                .host
                .split_once(']')
                .map_or(self.host.as_str(), |(addr, _)| &addr[1..]);
        }
        self.host
            .split_once(':')
            .map_or(self.host.as_str(), |(name, _)| name)
    }

    /// `https://host` or `http://host`.
    #[must_use]
    pub fn origin(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}", self.host)
    }
}

/// Instruction for the transport layer to set or clear a cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieDirective {
    /// Cookie name.
    pub name: String,
    /// Cookie value; empty when clearing.
    pub value: String,
    /// Expiry in unix seconds. A past value deletes the cookie.
    pub expires_at: u64,
}

/// Request-scoped state: the visitor plus effects to apply before the body.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// The visitor. `cookie_token` is updated when a new token is issued.
    pub visitor: VisitorContext,
    display_region: Option<String>,
    cookies: Vec<CookieDirective>,
}

impl RequestContext {
    /// Wraps a visitor with no pending effects.
    #[must_use]
    pub const fn new(visitor: VisitorContext) -> Self {
        Self {
            visitor,
            display_region: None,
            cookies: Vec::new(),
        }
    }

    /// Region name recorded by the last geo lookup; empty when not blocked.
    ///
    /// `None` when no lookup ran during this request (cache hit, override,
    /// private address).
    #[must_use]
    pub fn display_region(&self) -> Option<&str> {
        self.display_region.as_deref()
    }

    pub(crate) fn store_region_for_display(&mut self, region: impl Into<String>) {
        self.display_region = Some(region.into());
    }

    /// Cookies to emit, in order.
    #[must_use]
    pub fn cookies(&self) -> &[CookieDirective] {
        &self.cookies
    }

    pub(crate) fn push_cookie(&mut self, cookie: CookieDirective) {
        self.cookies.push(cookie);
    }
}
