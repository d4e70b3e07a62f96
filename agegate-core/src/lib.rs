//! `agegate-core` decides whether a visitor must pass age verification and
//! runs the handshakes with external verification providers.
//!
//! Build an [`AgeGate`] once per process from [`Settings`] and
//! [`Dependencies`], then per request wrap the visitor in a
//! [`RequestContext`] and call [`AgeGate::should_verify`]. Cookies the gate
//! wants set are collected on the context for the transport layer to emit.

#![deny(clippy::all, clippy::pedantic, clippy::nursery)]

mod age_gate;
pub use age_gate::{AgeGate, Dependencies};

mod cache;
pub use cache::KeyedCache;

pub mod clock;
pub use clock::{Clock, SystemClock};

pub mod config;
pub use config::{ProviderSettings, Settings};

mod context;
pub use context::{CookieDirective, RequestContext, VisitorContext, TOKEN_LENGTH};

mod decision;
pub use decision::{is_bot_agent, DecisionEngine};

mod error;
pub use error::{AgeGateError, AgeGateResult};

#[cfg(feature = "maxmind")]
mod geo_maxmind;
#[cfg(feature = "maxmind")]
pub use geo_maxmind::MaxMindGeoLookup;

pub mod logger;

pub mod providers;
pub use providers::{ProviderKind, ProviderOutcome, ProviderRequest, ProtocolStage};

mod records;
pub use records::{AccountStatus, VerificationRecords};

pub mod region;
pub use region::{BlockList, GeoError, GeoLookup, GeoRecord, RegionDecision, RestrictionPolicy};

pub mod storage;

mod tokens;
pub use tokens::{TokenLifecycle, TokenStatus, UpgradeOutcome, COOKIE_LIFETIME_SECS};
