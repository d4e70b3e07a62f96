//! Deployment settings.
//!
//! Everything here is plain data loaded once per process; runtime handles
//! (cache, store, geo database) are passed separately through
//! [`crate::Dependencies`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{AgeGateError, AgeGateResult};
use crate::providers::{GoCamConfig, ProviderKind, RedactIdConfig};
use crate::region::BlockList;

/// Site-wide age gate settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Path of the page that explains the gate and launches providers.
    pub gate_path: String,
    /// Prepended to every cache key to avoid collisions with other services.
    pub cache_prefix: String,
    /// When `false`, the cache is written but never read.
    pub cache_read_enabled: bool,
    /// Require verification from every region.
    pub globally_restricted: bool,
    /// Operator testing overrides: `true` always restricts an IP, `false` never does.
    pub ip_overrides: HashMap<String, bool>,
    /// Name of the cookie carrying the anonymous age token.
    pub cookie_name: String,
    /// `CC` or `CC-SUB` codes replacing the built-in US state block list.
    pub restricted_regions: Option<Vec<String>>,
    /// Location of the GeoLite2 City database.
    pub geo_database_path: PathBuf,
    /// Provider configuration; a provider without a section is disabled.
    pub providers: ProviderSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gate_path: "/ageBlock.php".to_string(),
            cache_prefix: "AV_".to_string(),
            cache_read_enabled: true,
            globally_restricted: false,
            ip_overrides: HashMap::new(),
            cookie_name: "ageVerificationToken".to_string(),
            restricted_regions: None,
            geo_database_path: PathBuf::from("GeoLite2-City.mmdb"),
            providers: ProviderSettings::default(),
        }
    }
}

/// Per-provider configuration sections.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderSettings {
    /// RedactID assertion-redirect provider.
    pub redact_id: Option<RedactIdConfig>,
    /// GoCam encrypted-redirect provider.
    pub gocam: Option<GoCamConfig>,
}

impl Settings {
    /// Parses settings from TOML and validates them.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the TOML is malformed or a provider
    /// section is inconsistent.
    pub fn from_toml_str(raw: &str) -> AgeGateResult<Self> {
        let settings: Self = toml::from_str(raw)
            .map_err(|e| AgeGateError::Configuration(format!("invalid settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads and parses the settings file at `path`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> AgeGateResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AgeGateError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first problem found.
    pub fn validate(&self) -> AgeGateResult<()> {
        if !self.gate_path.starts_with('/') {
            return Err(AgeGateError::Configuration(format!(
                "gate_path must be absolute, got {:?}",
                self.gate_path
            )));
        }
        if self.cookie_name.is_empty() {
            return Err(AgeGateError::Configuration(
                "cookie_name must not be empty".to_string(),
            ));
        }
        if let Some(codes) = &self.restricted_regions {
            BlockList::parse(codes)?;
        }
        if let Some(gocam) = &self.providers.gocam {
            gocam.validate()?;
        }
        if let Some(redact_id) = &self.providers.redact_id {
            redact_id.validate()?;
        }
        Ok(())
    }

    /// Restriction policy selected by these settings.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a region code is malformed.
    pub fn block_list(&self) -> AgeGateResult<BlockList> {
        match &self.restricted_regions {
            Some(codes) => BlockList::parse(codes),
            None => Ok(BlockList::us_states()),
        }
    }

    /// Returns `true` if `kind` has a configuration section.
    #[must_use]
    pub const fn is_enabled(&self, kind: ProviderKind) -> bool {
        match kind {
            ProviderKind::RedactId => self.providers.redact_id.is_some(),
            ProviderKind::GoCam => self.providers.gocam.is_some(),
        }
    }
}
