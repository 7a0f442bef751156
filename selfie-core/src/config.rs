//! Session configuration shared by every host.

use std::time::Duration;

use serde::Deserialize;

use crate::error::DiscoveryError;

/// Service type advertised when nothing else is configured.
pub const DEFAULT_SERVICE_TYPE: &str = "selfie-share";

/// Seconds an inbound invitation waits for a decision before it is declined.
pub const DEFAULT_INVITATION_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Advertised service type (1-15 chars: lowercase ASCII letters, digits, hyphens).
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Human-readable name; the identity becomes `<display_name>#<hex>`.
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// 0 disables expiry.
    #[serde(default = "default_invitation_timeout_secs")]
    pub invitation_timeout_secs: u64,
    /// Follow every image broadcast with a "Sent from <identity>" text payload.
    #[serde(default)]
    pub announce_provenance: bool,
}

fn default_service_type() -> String {
    DEFAULT_SERVICE_TYPE.to_string()
}
fn default_display_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "selfie".to_string())
}
fn default_invitation_timeout_secs() -> u64 {
    DEFAULT_INVITATION_TIMEOUT_SECS
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            display_name: default_display_name(),
            invitation_timeout_secs: default_invitation_timeout_secs(),
            announce_provenance: false,
        }
    }
}

impl SessionConfig {
    pub fn invitation_timeout(&self) -> Option<Duration> {
        match self.invitation_timeout_secs {
            0 => None,
            s => Some(Duration::from_secs(s)),
        }
    }

    pub fn validate(&self) -> Result<(), DiscoveryError> {
        validate_service_type(&self.service_type)
    }
}

/// Same shape the platform discovery services accept.
pub fn validate_service_type(s: &str) -> Result<(), DiscoveryError> {
    let valid_chars = s
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    let valid = (1..=15).contains(&s.len())
        && valid_chars
        && !s.starts_with('-')
        && !s.ends_with('-')
        && !s.contains("--");
    if valid {
        Ok(())
    } else {
        Err(DiscoveryError::InvalidServiceType(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let c = SessionConfig::default();
        assert!(c.validate().is_ok());
        assert_eq!(c.invitation_timeout(), Some(Duration::from_secs(30)));
        assert!(!c.announce_provenance);
    }

    #[test]
    fn service_type_rules() {
        assert!(validate_service_type("atina-sfshare").is_ok());
        assert!(validate_service_type("").is_err());
        assert!(validate_service_type("has_underscore").is_err());
        assert!(validate_service_type("UPPER").is_err());
        assert!(validate_service_type("-lead").is_err());
        assert!(validate_service_type("double--dash").is_err());
        assert!(validate_service_type("sixteen-chars-xx").is_err());
    }

    #[test]
    fn zero_timeout_disables_expiry() {
        let c = SessionConfig {
            invitation_timeout_secs: 0,
            ..SessionConfig::default()
        };
        assert_eq!(c.invitation_timeout(), None);
    }
}
